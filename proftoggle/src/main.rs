//! # proftoggle - Supervisor Entry Point
//!
//! - **`run`**: launch a program linked against `proftoggle` with profiling
//!   configured through its environment, relay signals, mirror its exit code
//! - **`toggle`**: send SIGUSR2 to an already running process
//! - **`render`**: regenerate the HTML and markdown of a saved profile

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use proftoggle_common::{ArtifactFormat, ArtifactKind};

use proftoggle::cli::{Args, Command, RenderArgs, RunArgs, ToggleArgs};
use proftoggle::domain::{Artifact, ConfigError, Pid, Signal};
use proftoggle::preflight::{check_out_dir, check_process_exists, resolve_program};
use proftoggle::process_lookup::find_process_by_name;
use proftoggle::render::FlamegraphBridge;
use proftoggle::supervisor::{send_signal, ProcessSupervisor};

// Exit codes
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_USAGE: i32 = 2;
const EXIT_NOT_FOUND: i32 = 127;

fn main() {
    env_logger::init();
    let args = Args::parse();
    std::process::exit(match run(args) {
        Ok(code) => code,
        Err(e) => {
            let code = exit_code_for(&e);
            eprintln!("error: {e:#}");
            code
        }
    });
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<ConfigError>() {
        Some(ConfigError::ProgramNotFound(_)) => EXIT_NOT_FOUND,
        Some(_) => EXIT_USAGE,
        None => EXIT_ERROR,
    }
}

#[tokio::main]
async fn run(args: Args) -> Result<i32> {
    match args.command {
        Command::Run(run) => run_child(run).await,
        Command::Toggle(toggle) => toggle_process(&toggle).map(|()| EXIT_SUCCESS),
        Command::Render(render) => render_profile(render).await,
    }
}

async fn run_child(args: RunArgs) -> Result<i32> {
    let Some((program, program_args)) = args.command.split_first() else {
        return Err(ConfigError::MissingArgument("COMMAND").into());
    };
    resolve_program(program)?;
    check_out_dir(&args.out_dir)?;

    let supervisor =
        ProcessSupervisor::new(args.to_config()).with_env(args.env.clone()).with_kill_grace(args.kill_grace());
    supervisor.run(program, program_args).await
}

fn toggle_process(args: &ToggleArgs) -> Result<()> {
    let pid = match (&args.process, args.pid) {
        (Some(name), _) => {
            let found = find_process_by_name(name)?;
            info!("Found {} ({})", found.command, found.pid);
            found.pid
        }
        (None, Some(pid)) => {
            let pid = Pid(pid);
            check_process_exists(pid)?;
            pid
        }
        (None, None) => return Err(ConfigError::MissingArgument("PROCESS or --pid").into()),
    };

    send_signal(pid, Signal::Toggle).with_context(|| format!("Failed to signal {pid}"))?;
    println!("Sent SIGUSR2 to {}", pid.0);
    Ok(())
}

async fn render_profile(args: RenderArgs) -> Result<i32> {
    let artifact = Artifact {
        kind: kind_from_file_name(&args.profile),
        format: ArtifactFormat::Pb,
        timestamp: String::new(),
        path: args.profile.clone(),
    };
    let report = FlamegraphBridge::new(args.html, args.markdown_format).render(&artifact).await;
    if let Err(e) = report.markdown {
        return Err(e).with_context(|| format!("Failed to render {}", args.profile.display()));
    }
    Ok(EXIT_SUCCESS)
}

/// `heap-profile-*` files are heap profiles, anything else is treated as CPU.
fn kind_from_file_name(path: &std::path::Path) -> ArtifactKind {
    let heap_prefix = format!("{}-", ArtifactKind::Heap.as_str());
    match path.file_name().and_then(|n| n.to_str()) {
        Some(name) if name.starts_with(&heap_prefix) => ArtifactKind::Heap,
        _ => ArtifactKind::Cpu,
    }
}
