//! CLI argument definitions

use clap::{ArgGroup, Args as ClapArgs, Parser, Subcommand};
use proftoggle_common::{DelayPolicy, MarkdownFormat};
use std::path::PathBuf;
use std::time::Duration;

use crate::config::{
    ControllerConfig, HeapOptions, DEFAULT_CPU_FREQUENCY, DEFAULT_EXIT_GRACE_MS, DEFAULT_HEAP_DEPTH,
    DEFAULT_HEAP_INTERVAL,
};
use crate::render::HtmlRenderer;

#[derive(Parser, Debug)]
#[command(
    name = "proftoggle",
    version,
    about = "Signal-toggled CPU and heap profiling with pprof output",
    after_help = "\
EXAMPLES:
    proftoggle run -- ./my-app --port 8080              Launch, toggle later with SIGUSR2
    proftoggle run --autostart -- ./my-app              Profile from the first instruction
    proftoggle run --autostart --delay 2000 -- ./app    Profile after 2s of warm-up
    proftoggle toggle my-app                            Start or stop a running session
    proftoggle render cpu-profile-<ts>.pb               Re-render HTML and markdown"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Launch a program with profiling configured through its environment
    Run(RunArgs),
    /// Send the toggle signal (SIGUSR2) to a running process
    Toggle(ToggleArgs),
    /// Render the HTML flamegraph and markdown summary of a saved profile
    Render(RenderArgs),
}

#[derive(ClapArgs, Debug)]
pub struct RunArgs {
    /// Start profiling without waiting for a signal
    #[arg(long)]
    pub autostart: bool,

    /// When auto-start begins: none, until-started or milliseconds
    #[arg(long, default_value = "none", value_name = "POLICY")]
    pub delay: DelayPolicy,

    /// Directory to scan for .map files (repeatable)
    #[arg(long = "sourcemap-dir", value_name = "DIR")]
    pub sourcemap_dirs: Vec<PathBuf>,

    /// Package whose .map files are indexed (repeatable)
    #[arg(long = "sourcemap-package", value_name = "NAME")]
    pub sourcemap_packages: Vec<String>,

    /// Markdown summary layout: summary, detailed or adaptive
    #[arg(long, default_value = "summary", value_name = "FORMAT")]
    pub markdown_format: MarkdownFormat,

    /// HTML renderer for exit-time flamegraphs: builtin, none or command:<template>
    #[arg(long, default_value = "builtin", value_name = "RENDERER")]
    pub html: HtmlRenderer,

    /// Directory profiles are written to
    #[arg(short, long, default_value = ".", value_name = "DIR")]
    pub out_dir: PathBuf,

    /// CPU sampling frequency in Hz
    #[arg(long, default_value_t = DEFAULT_CPU_FREQUENCY, value_parser = clap::value_parser!(i32).range(1..))]
    pub cpu_frequency: i32,

    /// Average bytes allocated between heap samples
    #[arg(long, default_value_t = DEFAULT_HEAP_INTERVAL, value_name = "BYTES")]
    pub heap_interval: usize,

    /// Frames recorded per heap sample
    #[arg(long, default_value_t = DEFAULT_HEAP_DEPTH, value_name = "FRAMES")]
    pub heap_depth: usize,

    /// How long the child may spend rendering after SIGINT/SIGTERM
    #[arg(long, default_value_t = DEFAULT_EXIT_GRACE_MS, value_name = "MS")]
    pub exit_grace_ms: u64,

    /// How long the child gets after a forwarded signal before it is killed
    #[arg(long, default_value_t = 5000, value_name = "MS")]
    pub kill_grace_ms: u64,

    /// Extra environment for the child (repeatable)
    #[arg(short, long = "env", value_name = "KEY=VALUE", value_parser = parse_key_val)]
    pub env: Vec<(String, String)>,

    /// Program and arguments to run
    #[arg(last = true, required = true, value_name = "COMMAND")]
    pub command: Vec<String>,
}

impl RunArgs {
    /// Controller configuration handed to the child.
    #[must_use]
    pub fn to_config(&self) -> ControllerConfig {
        ControllerConfig {
            autostart: self.autostart,
            delay: self.delay,
            sourcemap_dirs: self.sourcemap_dirs.clone(),
            sourcemap_packages: self.sourcemap_packages.clone(),
            markdown_format: self.markdown_format,
            out_dir: self.out_dir.clone(),
            cpu_frequency: self.cpu_frequency,
            heap: HeapOptions { interval_bytes: self.heap_interval, stack_depth: self.heap_depth },
            html: self.html.clone(),
            exit_grace: Duration::from_millis(self.exit_grace_ms),
        }
    }

    #[must_use]
    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }
}

#[derive(ClapArgs, Debug)]
#[command(group(ArgGroup::new("target").required(true).args(["process", "pid"])))]
pub struct ToggleArgs {
    /// Process name to toggle
    #[arg(value_name = "PROCESS")]
    pub process: Option<String>,

    /// Process ID to toggle
    #[arg(short, long)]
    pub pid: Option<i32>,
}

#[derive(ClapArgs, Debug)]
pub struct RenderArgs {
    /// Saved profile (.pb, optionally gzip-compressed)
    #[arg(value_name = "PROFILE")]
    pub profile: PathBuf,

    /// Markdown summary layout: summary, detailed or adaptive
    #[arg(long, default_value = "summary", value_name = "FORMAT")]
    pub markdown_format: MarkdownFormat,

    /// HTML renderer: builtin, none or command:<template>
    #[arg(long, default_value = "builtin", value_name = "RENDERER")]
    pub html: HtmlRenderer,
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let (key, value) = s.split_once('=').ok_or_else(|| format!("expected KEY=VALUE, got {s:?}"))?;
    if key.is_empty() {
        return Err(format!("empty variable name in {s:?}"));
    }
    Ok((key.to_string(), value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> Result<Args, clap::Error> {
        Args::try_parse_from(std::iter::once("proftoggle").chain(argv.iter().copied()))
    }

    #[test]
    fn test_run_collects_command_after_separator() {
        let args = parse(&[
            "run",
            "--autostart",
            "--delay",
            "until-started",
            "--sourcemap-dir",
            "dist",
            "-e",
            "RUST_LOG=debug",
            "--",
            "./app",
            "--port",
            "8080",
        ])
        .unwrap();

        let Command::Run(run) = args.command else { panic!("expected run") };
        assert_eq!(run.command, vec!["./app", "--port", "8080"]);
        assert_eq!(run.env, vec![("RUST_LOG".to_string(), "debug".to_string())]);

        let config = run.to_config();
        assert!(config.autostart);
        assert_eq!(config.delay, DelayPolicy::UntilStarted);
        assert_eq!(config.sourcemap_dirs, vec![PathBuf::from("dist")]);
        assert_eq!(config.exit_grace, crate::config::DEFAULT_EXIT_GRACE);
        assert_eq!(run.kill_grace(), Duration::from_secs(5));
    }

    #[test]
    fn test_run_requires_a_command() {
        assert!(parse(&["run", "--autostart"]).is_err());
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(parse(&["run", "--delay", "soon", "--", "app"]).is_err());
        assert!(parse(&["run", "--html", "svg", "--", "app"]).is_err());
        assert!(parse(&["run", "-e", "NOEQUALS", "--", "app"]).is_err());
        assert!(parse(&["run", "--cpu-frequency", "0", "--", "app"]).is_err());
        assert!(parse(&["run", "--cpu-frequency", "-1", "--", "app"]).is_err());
    }

    #[test]
    fn test_toggle_needs_exactly_one_target() {
        assert!(parse(&["toggle"]).is_err());
        assert!(parse(&["toggle", "app", "--pid", "12"]).is_err());
        let Command::Toggle(toggle) = parse(&["toggle", "--pid", "12"]).unwrap().command else {
            panic!("expected toggle")
        };
        assert_eq!(toggle.pid, Some(12));
    }
}
