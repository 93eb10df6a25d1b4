//! Frame origin classification for the markdown hotspot tables.
//!
//! Rust links std and every dependency into one executable, so the only
//! signal left in a profile is the frame's file path and, failing that, its
//! module prefix. Rewritten source-map frames are classified the same way:
//! an original path under `node_modules/` or `vendor/` is third-party code.
//!
//! # Classification Strategy
//!
//! 1. **File path patterns**
//!    - `.cargo/registry/`, `node_modules/`, `vendor/` → Third-party
//!    - `.rustup/toolchains/`, `/rustc/` → Standard library
//! 2. **Function name prefixes** when there is no path
//!    - `std::`, `core::`, `alloc::` → Standard library
//!    - `tokio::`, `futures::`, ... → Async runtime

/// Where a frame's code comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameOrigin {
    /// The profiled program's own code
    UserCode,
    /// Rust standard library (std, core, alloc)
    StdLib,
    /// Async runtime libraries (tokio, futures, ...)
    RuntimeLib,
    /// Registry crates and vendored packages
    ThirdParty,
    /// Raw address or no information at all
    #[default]
    Unknown,
}

impl FrameOrigin {
    #[must_use]
    pub fn is_user_code(self) -> bool {
        matches!(self, FrameOrigin::UserCode)
    }

    /// Short label for table cells.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            FrameOrigin::UserCode => "app",
            FrameOrigin::StdLib => "std",
            FrameOrigin::RuntimeLib => "runtime",
            FrameOrigin::ThirdParty => "deps",
            FrameOrigin::Unknown => "?",
        }
    }
}

/// Classify a frame from its function name and source path.
///
/// ```
/// use proftoggle::render::classification::{classify_frame, FrameOrigin};
///
/// assert_eq!(classify_frame("myapp::handler::process", Some("src/handler.rs")), FrameOrigin::UserCode);
/// assert_eq!(classify_frame("tokio::runtime::park", None), FrameOrigin::RuntimeLib);
/// ```
#[must_use]
pub fn classify_frame(function: &str, file: Option<&str>) -> FrameOrigin {
    if function.is_empty() || function == "<unknown>" || function.starts_with("0x") {
        return FrameOrigin::Unknown;
    }

    if let Some(path) = file.filter(|p| !p.is_empty()) {
        let path = path.replace('\\', "/");

        if path.contains(".cargo/registry/") || path.contains(".cargo/git/") {
            return if is_runtime_path(&path) { FrameOrigin::RuntimeLib } else { FrameOrigin::ThirdParty };
        }
        if path.contains(".rustup/toolchains/") || path.contains("/rustc/") {
            return FrameOrigin::StdLib;
        }
        if VENDORED_PATH_PATTERNS.iter().any(|p| path.contains(p)) {
            return FrameOrigin::ThirdParty;
        }
        if path.starts_with("/usr/") || path.starts_with("/lib/") {
            return FrameOrigin::ThirdParty;
        }
        return FrameOrigin::UserCode;
    }

    classify_by_function_prefix(function).unwrap_or(FrameOrigin::UserCode)
}

// =============================================================================
// CLASSIFICATION TABLES
// =============================================================================

const STD_PREFIXES: &[&str] = &["std::", "core::", "alloc::", "<std::", "<core::", "<alloc::"];

const RUNTIME_PREFIXES: &[&str] = &[
    "tokio::",
    "<tokio::",
    "async_std::",
    "futures::",
    "futures_util::",
    "futures_core::",
    "mio::",
    "hyper::",
    "tower::",
];

const THIRD_PARTY_PREFIXES: &[&str] = &[
    "serde::",
    "serde_json::",
    "log::",
    "regex::",
    "regex_automata::",
    "parking_lot::",
    "flate2::",
    "hashbrown::",
    "pprof::",
    "backtrace::",
];

const RUNTIME_CRATE_PATTERNS: &[&str] =
    &["/tokio-", "/async-std-", "/futures-", "/futures-util-", "/mio-", "/hyper-", "/tower-"];

const VENDORED_PATH_PATTERNS: &[&str] = &["/node_modules/", "node_modules/", "/vendor/", "webpack://"];

fn classify_by_function_prefix(function: &str) -> Option<FrameOrigin> {
    [
        (STD_PREFIXES, FrameOrigin::StdLib),
        (RUNTIME_PREFIXES, FrameOrigin::RuntimeLib),
        (THIRD_PARTY_PREFIXES, FrameOrigin::ThirdParty),
    ]
    .into_iter()
    .find(|(prefixes, _)| prefixes.iter().any(|p| function.starts_with(p)))
    .map(|(_, origin)| origin)
}

fn is_runtime_path(path: &str) -> bool {
    RUNTIME_CRATE_PATTERNS.iter().any(|pattern| path.contains(pattern))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_code_relative_path() {
        let origin = classify_frame("myapp::main", Some("src/main.rs"));
        assert_eq!(origin, FrameOrigin::UserCode);
        assert!(origin.is_user_code());
    }

    #[test]
    fn test_std_by_rustc_path() {
        let origin = classify_frame("std::io::Read::read", Some("/rustc/abc123def/library/std/src/io/mod.rs"));
        assert_eq!(origin, FrameOrigin::StdLib);
    }

    #[test]
    fn test_cargo_registry_runtime_and_third_party() {
        let tokio = classify_frame(
            "tokio::sync::mutex::Mutex::lock",
            Some("/home/user/.cargo/registry/src/index.crates.io-xxx/tokio-1.35.0/src/sync/mutex.rs"),
        );
        assert_eq!(tokio, FrameOrigin::RuntimeLib);

        let serde = classify_frame(
            "serde_json::de::from_str",
            Some("/home/user/.cargo/registry/src/index.crates.io-xxx/serde_json-1.0.0/src/de.rs"),
        );
        assert_eq!(serde, FrameOrigin::ThirdParty);
    }

    #[test]
    fn test_source_mapped_vendored_path() {
        let origin = classify_frame("render", Some("/srv/app/node_modules/react-dom/cjs/react-dom.js"));
        assert_eq!(origin, FrameOrigin::ThirdParty);
    }

    #[test]
    fn test_prefix_fallback_without_path() {
        assert_eq!(classify_frame("std::thread::spawn", None), FrameOrigin::StdLib);
        assert_eq!(classify_frame("my_custom_function", None), FrameOrigin::UserCode);
        assert_eq!(classify_frame("0x7fff12345678", None), FrameOrigin::Unknown);
    }
}
