//! Profile persistence
//!
//! Writes encoded pprof profiles to the output directory and reads them back
//! (plain or gzip-compressed) for rendering.

pub mod loader;
pub mod profile_writer;

pub use loader::{decode_profile, load_profile};
pub use profile_writer::{encode_profile, now_timestamp, ProfileWriter};
