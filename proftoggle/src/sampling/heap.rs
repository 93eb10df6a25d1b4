//! # Heap Sampling Allocator
//!
//! [`SamplingAllocator`] wraps another [`GlobalAlloc`] and, while a
//! [`HeapSampler`] is running, records the call stack of roughly one
//! allocation per `interval_bytes` allocated. Sampled allocations stay in a
//! live table until freed, so a stop produces an in-use heap profile:
//!
//! ```text
//! sample_type  inuse_objects/count, inuse_space/bytes
//! period_type  space/bytes, period = interval_bytes
//! ```
//!
//! A sample stands for `max(size, interval)` bytes, the same weighting Go's
//! runtime uses for its memprofile.
//!
//! ## Installing
//!
//! ```rust,ignore
//! #[global_allocator]
//! static ALLOC: proftoggle::SamplingAllocator = proftoggle::SamplingAllocator::system();
//! ```
//!
//! Without it the heap sampler refuses to start and only CPU is captured.
//!
//! ## Reentrancy
//!
//! Recording a sample allocates (stack buffer, table node). A thread-local
//! flag makes those inner allocations bypass the hook.

#![allow(unsafe_code)]

use std::alloc::{GlobalAlloc, Layout, System};
use std::cell::Cell;
use std::collections::{BTreeMap, HashMap};
use std::ffi::c_void;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use backtrace::{resolve, trace_unsynchronized};
use log::debug;
use parking_lot::{const_mutex, Mutex};
use pprof::protos::{Function, Line, Location, Profile, Sample, ValueType};
use proftoggle_common::ArtifactKind;
use rustc_demangle::try_demangle;

use super::{intern, Sampler};
use crate::config::HeapOptions;
use crate::domain::SamplerError;

/// Hard cap on recorded frames per sample.
const MAX_STACK_DEPTH: usize = 256;

/// Frames whose symbol contains one of these belong to the allocator hook,
/// not the program.
const INTERNAL_SYMBOLS: &[&str] = &[
    "backtrace::",
    "proftoggle::sampling::heap::SamplingAllocator",
    "proftoggle::sampling::heap::capture_stack",
    "__rust_alloc",
    "__rust_realloc",
    "__rg_alloc",
    "__rg_realloc",
    "alloc::alloc::",
    "alloc::raw_vec::",
];

// ============================================================================
// Shared State
// ============================================================================

static INSTALLED: AtomicBool = AtomicBool::new(false);
static ACTIVE: AtomicBool = AtomicBool::new(false);
static INTERVAL: AtomicUsize = AtomicUsize::new(crate::config::DEFAULT_HEAP_INTERVAL);
static DEPTH: AtomicUsize = AtomicUsize::new(crate::config::DEFAULT_HEAP_DEPTH);
static ALLOCATED: AtomicUsize = AtomicUsize::new(0);
static LIVE_SAMPLES: AtomicUsize = AtomicUsize::new(0);
static LIVE: Mutex<BTreeMap<usize, SampledAllocation>> = const_mutex(BTreeMap::new());

#[derive(Debug)]
struct SampledAllocation {
    size: usize,
    stack: Vec<usize>,
}

thread_local! {
    static IN_HOOK: Cell<bool> = const { Cell::new(false) };
}

struct ReentryGuard;

impl ReentryGuard {
    fn enter() -> Option<Self> {
        // Thread-local storage is gone during thread teardown; skip sampling
        IN_HOOK
            .try_with(|flag| {
                if flag.get() {
                    None
                } else {
                    flag.set(true);
                    Some(Self)
                }
            })
            .ok()
            .flatten()
    }
}

impl Drop for ReentryGuard {
    fn drop(&mut self) {
        let _ = IN_HOOK.try_with(|flag| flag.set(false));
    }
}

// ============================================================================
// Allocator
// ============================================================================

/// A [`GlobalAlloc`] that samples allocations while heap profiling runs.
pub struct SamplingAllocator<A = System> {
    inner: A,
}

impl SamplingAllocator<System> {
    /// Sampling on top of the system allocator.
    #[must_use]
    pub const fn system() -> Self {
        Self { inner: System }
    }
}

impl<A> SamplingAllocator<A> {
    pub const fn new(inner: A) -> Self {
        Self { inner }
    }

    fn on_alloc(ptr: *mut u8, size: usize) {
        if !INSTALLED.load(Ordering::Relaxed) {
            INSTALLED.store(true, Ordering::Relaxed);
        }
        if !ACTIVE.load(Ordering::Relaxed) {
            return;
        }

        let interval = INTERVAL.load(Ordering::Relaxed).max(1);
        let before = ALLOCATED.fetch_add(size, Ordering::Relaxed);
        let after = before.wrapping_add(size);
        if before / interval == after / interval && size < interval {
            return;
        }

        let Some(_guard) = ReentryGuard::enter() else {
            return;
        };
        let stack = capture_stack(DEPTH.load(Ordering::Relaxed));
        LIVE.lock().insert(ptr as usize, SampledAllocation { size, stack });
        LIVE_SAMPLES.fetch_add(1, Ordering::Relaxed);
    }

    fn on_dealloc(ptr: *mut u8) {
        if LIVE_SAMPLES.load(Ordering::Relaxed) == 0 {
            return;
        }
        let Some(_guard) = ReentryGuard::enter() else {
            return;
        };
        if LIVE.lock().remove(&(ptr as usize)).is_some() {
            LIVE_SAMPLES.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

// SAFETY: every call is forwarded unchanged to `inner`; the hooks only read
// the returned pointer value and never touch the memory behind it.
unsafe impl<A: GlobalAlloc> GlobalAlloc for SamplingAllocator<A> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = self.inner.alloc(layout);
        if !ptr.is_null() {
            Self::on_alloc(ptr, layout.size());
        }
        ptr
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = self.inner.alloc_zeroed(layout);
        if !ptr.is_null() {
            Self::on_alloc(ptr, layout.size());
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        Self::on_dealloc(ptr);
        self.inner.dealloc(ptr, layout);
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let next = self.inner.realloc(ptr, layout, new_size);
        if !next.is_null() {
            Self::on_dealloc(ptr);
            Self::on_alloc(next, new_size);
        }
        next
    }
}

fn capture_stack(depth: usize) -> Vec<usize> {
    let depth = depth.clamp(1, MAX_STACK_DEPTH);
    let mut frames = Vec::with_capacity(depth);
    // SAFETY: only walks the current thread's stack; symbolization happens
    // later, outside the allocator.
    unsafe {
        trace_unsynchronized(|frame| {
            let ip = frame.ip() as usize;
            if ip != 0 {
                frames.push(ip);
            }
            frames.len() < depth
        });
    }
    frames
}

// ============================================================================
// Sampler
// ============================================================================

/// Starts and stops allocation sampling and turns the live table into a
/// pprof heap profile.
pub struct HeapSampler {
    options: HeapOptions,
    started: Option<(Instant, SystemTime)>,
}

impl HeapSampler {
    #[must_use]
    pub fn new(options: HeapOptions) -> Self {
        Self { options, started: None }
    }

    /// Whether [`SamplingAllocator`] has served an allocation in this process.
    #[must_use]
    pub fn allocator_installed() -> bool {
        INSTALLED.load(Ordering::Relaxed)
    }
}

impl Sampler for HeapSampler {
    fn kind(&self) -> ArtifactKind {
        ArtifactKind::Heap
    }

    fn start(&mut self) -> Result<(), SamplerError> {
        if !Self::allocator_installed() {
            return Err(SamplerError::AllocatorNotInstalled);
        }
        if self.started.is_some() || ACTIVE.load(Ordering::Acquire) {
            return Err(SamplerError::AlreadyRunning(ArtifactKind::Heap));
        }

        {
            let _guard = ReentryGuard::enter();
            LIVE.lock().clear();
        }
        LIVE_SAMPLES.store(0, Ordering::Relaxed);
        ALLOCATED.store(0, Ordering::Relaxed);
        INTERVAL.store(self.options.interval_bytes.max(1), Ordering::Relaxed);
        DEPTH.store(self.options.stack_depth, Ordering::Relaxed);

        if ACTIVE.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_err() {
            return Err(SamplerError::AlreadyRunning(ArtifactKind::Heap));
        }
        self.started = Some((Instant::now(), SystemTime::now()));
        debug!(
            "Heap sampling every {} bytes, {} frames deep",
            self.options.interval_bytes, self.options.stack_depth
        );
        Ok(())
    }

    fn stop(&mut self) -> Result<Profile, SamplerError> {
        let (started_at, started_wall) =
            self.started.take().ok_or(SamplerError::NotRunning(ArtifactKind::Heap))?;
        ACTIVE.store(false, Ordering::Release);

        let samples = {
            let _guard = ReentryGuard::enter();
            std::mem::take(&mut *LIVE.lock())
        };
        LIVE_SAMPLES.store(0, Ordering::Relaxed);

        let mut builder = HeapProfileBuilder::new(self.options.interval_bytes.max(1));
        for allocation in samples.into_values() {
            builder.add(&allocation.stack, allocation.size);
        }

        let time_nanos = started_wall
            .duration_since(UNIX_EPOCH)
            .map(|d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
            .unwrap_or_default();
        let duration_nanos = i64::try_from(started_at.elapsed().as_nanos()).unwrap_or(i64::MAX);
        Ok(builder.finish(time_nanos, duration_nanos))
    }
}

impl Drop for HeapSampler {
    fn drop(&mut self) {
        if self.started.is_some() {
            ACTIVE.store(false, Ordering::Release);
        }
    }
}

// ============================================================================
// Profile Construction
// ============================================================================

/// Aggregates sampled stacks and symbolizes each address once.
struct HeapProfileBuilder {
    interval: usize,
    strings: Vec<String>,
    string_index: HashMap<String, i64>,
    functions: Vec<Function>,
    function_index: HashMap<(i64, i64), u64>,
    locations: Vec<Location>,
    /// address -> location id, `None` for hook-internal frames
    location_index: HashMap<usize, Option<u64>>,
    stacks: HashMap<Vec<u64>, (i64, i64)>,
}

impl HeapProfileBuilder {
    fn new(interval: usize) -> Self {
        Self {
            interval,
            strings: vec![String::new()],
            string_index: HashMap::from([(String::new(), 0)]),
            functions: Vec::new(),
            function_index: HashMap::new(),
            locations: Vec::new(),
            location_index: HashMap::new(),
            stacks: HashMap::new(),
        }
    }

    fn intern(&mut self, s: &str) -> i64 {
        intern(&mut self.strings, &mut self.string_index, s)
    }

    #[allow(clippy::cast_possible_wrap)]
    fn add(&mut self, stack: &[usize], size: usize) {
        let location_ids: Vec<u64> =
            stack.iter().filter_map(|&address| self.location_for(address)).collect();
        if location_ids.is_empty() {
            return;
        }

        // One sample stands for `interval` bytes' worth of allocations of this size
        let weight = size.max(self.interval);
        let objects = (weight / size.max(1)).max(1);
        let entry = self.stacks.entry(location_ids).or_insert((0, 0));
        entry.0 += objects as i64;
        entry.1 += weight as i64;
    }

    fn location_for(&mut self, address: usize) -> Option<u64> {
        if let Some(cached) = self.location_index.get(&address) {
            return *cached;
        }

        let mut symbols = Vec::new();
        resolve(address as *mut c_void, |symbol| {
            let name = symbol.name().map_or_else(
                || format!("0x{address:x}"),
                |name| {
                    let raw = name.to_string();
                    let demangled = try_demangle(&raw).map(|d| format!("{d:#}")).ok();
                    demangled.unwrap_or(raw)
                },
            );
            let file = symbol.filename().map(|f| f.to_string_lossy().into_owned()).unwrap_or_default();
            let line = symbol.lineno().map_or(0, i64::from);
            symbols.push((name, file, line));
        });
        if symbols.is_empty() {
            symbols.push((format!("0x{address:x}"), String::new(), 0));
        }

        if symbols.iter().any(|(name, _, _)| INTERNAL_SYMBOLS.iter().any(|s| name.contains(s))) {
            self.location_index.insert(address, None);
            return None;
        }

        let mut lines = Vec::with_capacity(symbols.len());
        for (name, file, line) in symbols {
            let name_id = self.intern(&name);
            let file_id = self.intern(&file);
            let next_id = self.functions.len() as u64 + 1;
            let function_id = *self.function_index.entry((name_id, file_id)).or_insert(next_id);
            if function_id == next_id {
                self.functions.push(Function {
                    id: function_id,
                    name: name_id,
                    system_name: name_id,
                    filename: file_id,
                    ..Default::default()
                });
            }
            lines.push(Line { function_id, line, ..Default::default() });
        }

        let id = self.locations.len() as u64 + 1;
        self.locations.push(Location { id, address: address as u64, line: lines, ..Default::default() });
        self.location_index.insert(address, Some(id));
        Some(id)
    }

    #[allow(clippy::cast_possible_wrap)]
    fn finish(mut self, time_nanos: i64, duration_nanos: i64) -> Profile {
        let sample_type = vec![
            ValueType { ty: self.intern("inuse_objects"), unit: self.intern("count") },
            ValueType { ty: self.intern("inuse_space"), unit: self.intern("bytes") },
        ];
        let period_type = ValueType { ty: self.intern("space"), unit: self.intern("bytes") };

        let sample = self
            .stacks
            .drain()
            .map(|(location_id, (objects, bytes))| Sample {
                location_id,
                value: vec![objects, bytes],
                ..Default::default()
            })
            .collect();

        Profile {
            sample_type,
            sample,
            location: self.locations,
            function: self.functions,
            string_table: self.strings,
            time_nanos,
            duration_nanos,
            period_type: Some(period_type),
            period: self.interval as i64,
            ..Default::default()
        }
    }
}
