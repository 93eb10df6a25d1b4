//! # proftoggle - Signal-toggled CPU and Heap Profiling
//!
//! proftoggle captures CPU and heap profiles of a running program on demand.
//! `SIGUSR2` starts capture and the next `SIGUSR2` stops it and writes
//! pprof-compatible `.pb` files. On exit the last capture is saved and
//! rendered as an HTML flamegraph plus a markdown summary.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────┐        ┌───────────────────────────────┐
//! │  proftoggle run -- ./app     │ env +  │  ./app                        │
//! │  (ProcessSupervisor)         │ signals│  proftoggle::install()        │
//! │                              │───────▶│    │                          │
//! │  SIGUSR2 relay               │        │    ▼ agent thread             │
//! │  SIGINT/SIGTERM + kill grace │        │  ProfilerController           │
//! └──────────────────────────────┘        │    ├─ CpuSampler (SIGPROF)    │
//!                                         │    ├─ HeapSampler (allocator) │
//!                                         │    ├─ SourcemapIndex          │
//!                                         │    ├─ ProfileWriter  ──▶ .pb  │
//!                                         │    └─ FlamegraphBridge ─▶ .html/.md
//!                                         └───────────────────────────────┘
//! ```
//!
//! ## Module Structure
//!
//! - [`controller`]: session state machine, agent thread, exit coordination
//! - [`sampling`]: CPU and heap sub-profilers
//! - [`sourcemap`]: `.map` discovery and frame translation
//! - [`export`]: pprof encoding, collision-free artifact files, loading
//! - [`render`]: HTML flamegraphs and markdown hotspot summaries
//! - [`supervisor`]: child launch, signal relay, shutdown ordering
//! - [`config`]: `PROFTOGGLE_*` environment configuration
//! - [`cli`]: supervisor command-line arguments
//! - [`domain`]: core types and errors
//!
//! ## Typical Usage
//!
//! ```no_run
//! use proftoggle::SamplingAllocator;
//!
//! #[global_allocator]
//! static GLOBAL: SamplingAllocator = SamplingAllocator::system();
//!
//! fn main() -> anyhow::Result<()> {
//!     let _profiler = proftoggle::install()?;
//!     // ... the program ...
//!     Ok(())
//! }
//! ```
//!
//! ```bash
//! proftoggle run --autostart --delay until-started -- ./target/release/app
//! proftoggle toggle app
//! ```

pub mod cli;
pub mod config;
pub mod controller;
pub mod domain;
pub mod export;
pub mod preflight;
pub mod process_lookup;
pub mod render;
pub mod sampling;
pub mod sourcemap;
pub mod supervisor;

pub use config::ControllerConfig;
pub use controller::{install, install_with, AgentOptions, ProfilerController, ProfilerHandle};
pub use domain::{Artifact, Signal};
pub use sampling::SamplingAllocator;
