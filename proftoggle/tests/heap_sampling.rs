//! Heap sampling with `SamplingAllocator` installed as the global allocator.
//!
//! Sampling state is process-wide, so this binary holds a single test.

use std::hint::black_box;

use proftoggle::config::HeapOptions;
use proftoggle::sampling::{HeapSampler, Sampler};
use proftoggle::SamplingAllocator;

#[global_allocator]
static GLOBAL: SamplingAllocator = SamplingAllocator::system();

const RETAINED: usize = 96 * 1024;
const TRANSIENT: usize = 160 * 1024;

#[inline(never)]
fn retain_buffer() -> Vec<u8> {
    black_box(vec![7u8; RETAINED])
}

#[inline(never)]
fn transient_buffer() -> usize {
    let buffer = black_box(vec![1u8; TRANSIENT]);
    buffer.len()
}

#[test]
fn test_live_allocations_are_sampled_and_freed_ones_dropped() {
    assert!(HeapSampler::allocator_installed());

    let mut sampler = HeapSampler::new(HeapOptions { interval_bytes: 4096, stack_depth: 64 });
    sampler.start().unwrap();
    assert!(sampler.start().is_err());

    let kept = retain_buffer();
    assert_eq!(transient_buffer(), TRANSIENT);

    let profile = sampler.stop().unwrap();
    black_box(&kept);

    let sample_types: Vec<&str> =
        profile.sample_type.iter().map(|vt| profile.string_table[vt.ty as usize].as_str()).collect();
    assert_eq!(sample_types, vec!["inuse_objects", "inuse_space"]);

    // Allocations larger than the interval are always sampled at their size
    let retained_bytes = i64::try_from(RETAINED).unwrap();
    assert!(profile.sample.iter().any(|s| s.value[1] == retained_bytes));

    let names: Vec<&str> = profile.function.iter().map(|f| profile.string_table[f.name as usize].as_str()).collect();
    assert!(names.iter().any(|n| n.contains("retain_buffer")), "functions: {names:?}");
    assert!(!names.iter().any(|n| n.contains("transient_buffer")));
    // Allocator internals never appear as frames
    assert!(!names.iter().any(|n| n.contains("SamplingAllocator")));

    // Stopped: nothing more is recorded and a second stop fails
    assert!(sampler.stop().is_err());
}
