//! Controller configuration
//!
//! The agent reads everything from `PROFTOGGLE_*` environment variables so a
//! supervisor can configure a child it does not share memory with. The
//! supervisor builds the same struct from CLI flags and writes it back out
//! with [`ControllerConfig::to_env`].

use std::path::PathBuf;
use std::time::Duration;

use proftoggle_common::{
    parse_flag, split_list, DelayPolicy, MarkdownFormat, DIR_LIST_SEPARATOR, ENV_AUTOSTART,
    ENV_CPU_FREQUENCY, ENV_DELAY, ENV_EXIT_GRACE_MS, ENV_HEAP_DEPTH, ENV_HEAP_INTERVAL, ENV_HTML,
    ENV_MD_FORMAT, ENV_OUT_DIR, ENV_SOURCEMAP_DIRS, ENV_SOURCEMAP_PACKAGES,
    PACKAGE_LIST_SEPARATOR,
};

use crate::domain::ConfigError;
use crate::render::HtmlRenderer;

/// CPU sampling frequency in Hz
pub const DEFAULT_CPU_FREQUENCY: i32 = 100;

/// Average bytes allocated between two heap samples (512 KiB)
pub const DEFAULT_HEAP_INTERVAL: usize = 512 * 1024;

/// Frames recorded per heap sample
pub const DEFAULT_HEAP_DEPTH: usize = 64;

/// Stays below the supervisor's 5s kill window
pub const DEFAULT_EXIT_GRACE_MS: u64 = 4000;

pub const DEFAULT_EXIT_GRACE: Duration = Duration::from_millis(DEFAULT_EXIT_GRACE_MS);

/// Heap sampler options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapOptions {
    pub interval_bytes: usize,
    pub stack_depth: usize,
}

impl Default for HeapOptions {
    fn default() -> Self {
        Self { interval_bytes: DEFAULT_HEAP_INTERVAL, stack_depth: DEFAULT_HEAP_DEPTH }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ControllerConfig {
    pub autostart: bool,
    pub delay: DelayPolicy,
    pub sourcemap_dirs: Vec<PathBuf>,
    pub sourcemap_packages: Vec<String>,
    pub markdown_format: MarkdownFormat,
    pub out_dir: PathBuf,
    pub cpu_frequency: i32,
    pub heap: HeapOptions,
    pub html: HtmlRenderer,
    pub exit_grace: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            autostart: false,
            delay: DelayPolicy::None,
            sourcemap_dirs: Vec::new(),
            sourcemap_packages: Vec::new(),
            markdown_format: MarkdownFormat::Summary,
            out_dir: PathBuf::from("."),
            cpu_frequency: DEFAULT_CPU_FREQUENCY,
            heap: HeapOptions::default(),
            html: HtmlRenderer::Builtin,
            exit_grace: DEFAULT_EXIT_GRACE,
        }
    }
}

impl ControllerConfig {
    /// Read the configuration from the process environment.
    ///
    /// # Errors
    /// Returns a [`ConfigError`] when a variable is set to an unparseable value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary variable lookup.
    ///
    /// Unset variables keep their defaults.
    ///
    /// # Errors
    /// Returns a [`ConfigError`] when a variable is set to an unparseable value.
    pub fn from_vars<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(value) = lookup(ENV_AUTOSTART) {
            config.autostart = parse_flag(&value)
                .map_err(|source| ConfigError::InvalidValue { key: ENV_AUTOSTART, source })?;
        }
        if let Some(value) = lookup(ENV_DELAY) {
            config.delay = value
                .parse()
                .map_err(|source| ConfigError::InvalidValue { key: ENV_DELAY, source })?;
        }
        if let Some(value) = lookup(ENV_SOURCEMAP_DIRS) {
            config.sourcemap_dirs =
                split_list(&value, DIR_LIST_SEPARATOR).into_iter().map(PathBuf::from).collect();
        }
        if let Some(value) = lookup(ENV_SOURCEMAP_PACKAGES) {
            config.sourcemap_packages = split_list(&value, PACKAGE_LIST_SEPARATOR);
        }
        if let Some(value) = lookup(ENV_MD_FORMAT) {
            config.markdown_format = value
                .parse()
                .map_err(|source| ConfigError::InvalidValue { key: ENV_MD_FORMAT, source })?;
        }
        if let Some(value) = lookup(ENV_OUT_DIR) {
            if !value.trim().is_empty() {
                config.out_dir = PathBuf::from(value);
            }
        }
        if let Some(value) = lookup(ENV_CPU_FREQUENCY) {
            config.cpu_frequency = parse_number(ENV_CPU_FREQUENCY, &value)?;
            if config.cpu_frequency <= 0 {
                return Err(ConfigError::InvalidSetting { key: ENV_CPU_FREQUENCY, value });
            }
        }
        if let Some(value) = lookup(ENV_HEAP_INTERVAL) {
            config.heap.interval_bytes = parse_number(ENV_HEAP_INTERVAL, &value)?;
        }
        if let Some(value) = lookup(ENV_HEAP_DEPTH) {
            config.heap.stack_depth = parse_number(ENV_HEAP_DEPTH, &value)?;
        }
        if let Some(value) = lookup(ENV_HTML) {
            config.html = value
                .parse()
                .map_err(|_| ConfigError::InvalidSetting { key: ENV_HTML, value: value.clone() })?;
        }
        if let Some(value) = lookup(ENV_EXIT_GRACE_MS) {
            config.exit_grace = Duration::from_millis(parse_number(ENV_EXIT_GRACE_MS, &value)?);
        }

        Ok(config)
    }

    /// Serialise into environment variables for a child process.
    #[must_use]
    pub fn to_env(&self) -> Vec<(&'static str, String)> {
        let dirs = self
            .sourcemap_dirs
            .iter()
            .map(|d| d.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(&DIR_LIST_SEPARATOR.to_string());

        vec![
            (ENV_AUTOSTART, if self.autostart { "1" } else { "0" }.to_string()),
            (ENV_DELAY, self.delay.to_string()),
            (ENV_SOURCEMAP_DIRS, dirs),
            (ENV_SOURCEMAP_PACKAGES, self.sourcemap_packages.join(",")),
            (ENV_MD_FORMAT, self.markdown_format.to_string()),
            (ENV_OUT_DIR, self.out_dir.to_string_lossy().into_owned()),
            (ENV_CPU_FREQUENCY, self.cpu_frequency.to_string()),
            (ENV_HEAP_INTERVAL, self.heap.interval_bytes.to_string()),
            (ENV_HEAP_DEPTH, self.heap.stack_depth.to_string()),
            (ENV_HTML, self.html.to_string()),
            (ENV_EXIT_GRACE_MS, self.exit_grace.as_millis().to_string()),
        ]
    }

    /// Whether a sourcemap index has to be built before capture starts.
    #[must_use]
    pub fn wants_sourcemaps(&self) -> bool {
        !self.sourcemap_dirs.is_empty() || !self.sourcemap_packages.is_empty()
    }
}

fn parse_number<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidSetting { key, value: value.to_string() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            vars.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = ControllerConfig::from_vars(|_| None).unwrap();
        assert_eq!(config, ControllerConfig::default());
        assert!(!config.wants_sourcemaps());
    }

    #[test]
    fn test_parses_all_variables() {
        let config = ControllerConfig::from_vars(lookup(&[
            (ENV_AUTOSTART, "1"),
            (ENV_DELAY, "until-started"),
            (ENV_SOURCEMAP_DIRS, "dist:build"),
            (ENV_SOURCEMAP_PACKAGES, "ui-kit, codegen"),
            (ENV_MD_FORMAT, "adaptive"),
            (ENV_OUT_DIR, "/tmp/profiles"),
            (ENV_HEAP_INTERVAL, "1024"),
            (ENV_HTML, "none"),
        ]))
        .unwrap();

        assert!(config.autostart);
        assert_eq!(config.delay, DelayPolicy::UntilStarted);
        assert_eq!(config.sourcemap_packages, vec!["ui-kit", "codegen"]);
        assert_eq!(config.markdown_format, MarkdownFormat::Adaptive);
        assert_eq!(config.out_dir, PathBuf::from("/tmp/profiles"));
        assert_eq!(config.heap.interval_bytes, 1024);
        assert_eq!(config.html, HtmlRenderer::None);
        assert!(config.wants_sourcemaps());
    }

    #[test]
    fn test_invalid_delay_is_a_config_error() {
        let err = ControllerConfig::from_vars(lookup(&[(ENV_DELAY, "later")])).unwrap_err();
        assert!(err.to_string().contains(ENV_DELAY));
    }

    #[test]
    fn test_non_positive_cpu_frequency_is_rejected() {
        for value in ["0", "-50"] {
            let err = ControllerConfig::from_vars(lookup(&[(ENV_CPU_FREQUENCY, value)])).unwrap_err();
            assert!(matches!(err, ConfigError::InvalidSetting { key: ENV_CPU_FREQUENCY, .. }), "{value}: {err}");
        }
        let config = ControllerConfig::from_vars(lookup(&[(ENV_CPU_FREQUENCY, "250")])).unwrap();
        assert_eq!(config.cpu_frequency, 250);
    }

    #[test]
    fn test_to_env_round_trips() {
        let config = ControllerConfig {
            autostart: true,
            delay: DelayPolicy::Millis(1500),
            sourcemap_packages: vec!["a".to_string(), "b".to_string()],
            markdown_format: MarkdownFormat::Detailed,
            html: HtmlRenderer::Command("render {input} {output}".to_string()),
            ..ControllerConfig::default()
        };
        let env: HashMap<String, String> =
            config.to_env().into_iter().map(|(k, v)| (k.to_string(), v)).collect();
        let parsed = ControllerConfig::from_vars(|key| env.get(key).cloned()).unwrap();
        assert_eq!(parsed, config);
    }
}
