//! Demo target - a small program with an obvious CPU hotspot and a growing heap
//!
//! Run it under the supervisor and toggle profiling while it works:
//!
//!   cargo build --example demo-target
//!   proftoggle run --autostart -- target/debug/examples/demo-target
//!
//! or launch it directly and send SIGUSR2 yourself:
//!
//!   cargo run --example demo-target &
//!   proftoggle toggle demo-target   # start
//!   proftoggle toggle demo-target   # stop, writes cpu/heap-profile-*.pb

use std::time::{Duration, Instant};

use proftoggle::SamplingAllocator;

#[global_allocator]
static GLOBAL: SamplingAllocator = SamplingAllocator::system();

fn main() -> anyhow::Result<()> {
    let _profiler = proftoggle::install()?;

    println!("Demo target running (pid {})", std::process::id());
    println!("  SIGUSR2 toggles profiling, Ctrl+C saves and exits\n");

    let mut retained: Vec<Vec<u8>> = Vec::new();
    for round in 0..10 {
        let checksum = busy_hash(Duration::from_millis(450));
        retained.push(grow_cache(round));
        println!("[Round {round}] checksum {checksum:#x}, {} buffers retained", retained.len());
        std::thread::sleep(Duration::from_millis(200));
    }

    println!("\nDone; profiles still running are saved on exit");
    Ok(())
}

/// CPU hotspot: spin on a cheap hash for `budget`.
fn busy_hash(budget: Duration) -> u64 {
    let start = Instant::now();
    let mut state = 0xcbf2_9ce4_8422_2325_u64;
    while start.elapsed() < budget {
        for byte in 0..=255u8 {
            state ^= u64::from(byte);
            state = state.wrapping_mul(0x0100_0000_01b3);
        }
    }
    state
}

/// Heap growth: one retained buffer per round, larger each time.
fn grow_cache(round: usize) -> Vec<u8> {
    vec![round as u8; (round + 1) * 256 * 1024]
}
