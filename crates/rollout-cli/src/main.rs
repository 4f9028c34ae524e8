use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use rollout_core::checkpoint::{CheckpointEntry, checkpoint_path};
use rollout_core::config::{CliOverrides, Config, RolloutConfig};
use rollout_core::engine::Reporter;
use rollout_core::error::{EXIT_ABORTED, EXIT_COMPLETED};
use rollout_core::orchestrator::{
    DoctorReport, DryRunPlan, ReleaseOrchestrator, StatusReport, Workflow,
};
use rollout_core::process::{CancelToken, SystemRunner};
use rollout_core::types::{RunOutcome, StepOutcome};
use rollout_core::version::BumpKind;
use rollout_core::{RolloutError, state};

#[derive(Parser, Debug)]
#[command(name = "rollout", version)]
#[command(about = "Resumable release workflows: check, bump, build, verify, publish")]
struct Cli {
    /// Project root containing the version file and `.rollout.toml`
    #[arg(long, global = true, default_value = ".")]
    project_dir: PathBuf,

    /// Config file to use instead of `<project-dir>/.rollout.toml`
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Environment name exposed to tools as `{env}`
    #[arg(long = "env", global = true)]
    environment: Option<String>,

    /// Directory for the lock, checkpoint and receipt (default: .rollout)
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    /// Allow releasing from a working tree with uncommitted changes.
    #[arg(long, global = true)]
    allow_dirty: bool,

    /// Default per-command timeout (e.g. 90s, 10m)
    #[arg(long, global = true)]
    timeout: Option<String>,

    #[command(subcommand)]
    cmd: Commands,
}

/// Flags for commands that execute steps.
#[derive(clap::Args, Debug)]
struct ForceArgs {
    /// Re-run a step even if the checkpoint records it as done (repeatable).
    #[arg(long = "force", value_name = "STEP")]
    force: Vec<String>,
}

impl ForceArgs {
    fn steps(&self) -> BTreeSet<String> {
        self.force.iter().cloned().collect()
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Verify the lockfile and that the working tree is clean.
    Check {
        #[command(flatten)]
        force: ForceArgs,
    },
    /// Check, then bump the version file.
    Bump {
        kind: BumpKind,
        #[command(flatten)]
        force: ForceArgs,
    },
    /// Build distributable artifacts.
    Build {
        #[command(flatten)]
        force: ForceArgs,
    },
    /// Build, then validate the artifacts.
    Verify {
        #[command(flatten)]
        force: ForceArgs,
    },
    /// Build, verify, upload, and create the hosted release.
    Publish {
        #[command(flatten)]
        force: ForceArgs,
    },
    /// Check, bump, and build.
    Release {
        kind: BumpKind,
        #[command(flatten)]
        force: ForceArgs,
    },
    /// Print the plan for a workflow without running anything.
    DryRun {
        /// patch, minor, major, or any other workflow name
        workflow: String,
    },
    /// Continue the pending run from its checkpoint.
    Resume {
        #[command(flatten)]
        force: ForceArgs,
    },
    /// Discard the pending checkpoint.
    Abandon,
    /// Show the current version, pending run, and lock holder.
    Status,
    /// Check that configured tools are installed.
    Doctor,
}

struct CliReporter;

impl Reporter for CliReporter {
    fn info(&mut self, msg: &str) {
        eprintln!("[info] {msg}");
    }

    fn warn(&mut self, msg: &str) {
        eprintln!("[warn] {msg}");
    }

    fn error(&mut self, msg: &str) {
        eprintln!("[error] {msg}");
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("[error] {err:#}");
            let code = err
                .downcast_ref::<RolloutError>()
                .map(RolloutError::exit_code)
                .unwrap_or(EXIT_ABORTED);
            ExitCode::from(code)
        }
    }
}

fn run(cli: Cli) -> Result<u8> {
    let config = load_config(&cli)?;
    let cancel = CancelToken::new();
    let runner = SystemRunner::new(config.project_dir.clone(), config.grace_period, cancel.clone());
    let orchestrator = ReleaseOrchestrator::new(config, Arc::new(runner), cancel.clone());
    let mut reporter = CliReporter;

    let (workflow, force) = match cli.cmd {
        Commands::Check { force } => (Workflow::Check, force),
        Commands::Bump { kind, force } => (Workflow::Bump(kind), force),
        Commands::Build { force } => (Workflow::Build, force),
        Commands::Verify { force } => (Workflow::Verify, force),
        Commands::Publish { force } => (Workflow::Publish, force),
        Commands::Release { kind, force } => (Workflow::Release(kind), force),
        Commands::DryRun { workflow } => {
            let workflow: Workflow = workflow.parse()?;
            print_dry_run(&orchestrator.dry_run(workflow)?);
            return Ok(EXIT_COMPLETED);
        }
        Commands::Resume { force } => {
            install_interrupt_handler(cancel);
            let outcome = orchestrator.resume(&force.steps(), &mut reporter)?;
            return Ok(report_outcome(&outcome, orchestrator.config()));
        }
        Commands::Abandon => {
            if orchestrator.abandon(&mut reporter)? {
                println!("pending run abandoned");
            } else {
                println!("no pending run");
            }
            return Ok(EXIT_COMPLETED);
        }
        Commands::Status => {
            print_status(&orchestrator.status()?);
            return Ok(EXIT_COMPLETED);
        }
        Commands::Doctor => {
            let report = orchestrator.doctor();
            print_doctor(&report);
            return Ok(if report.is_healthy() {
                EXIT_COMPLETED
            } else {
                EXIT_ABORTED
            });
        }
    };

    install_interrupt_handler(cancel);
    let outcome = orchestrator.run(workflow, &force.steps(), &mut reporter)?;
    Ok(report_outcome(&outcome, orchestrator.config()))
}

fn load_config(cli: &Cli) -> Result<Config> {
    let file = match &cli.config {
        Some(path) => RolloutConfig::load_from_file(path)?,
        None => RolloutConfig::load_from_project(&cli.project_dir)?.unwrap_or_default(),
    };

    let overrides = CliOverrides {
        environment: cli.environment.clone(),
        state_dir: cli.state_dir.clone(),
        timeout: cli.timeout.as_deref().map(parse_duration).transpose()?,
        allow_dirty: cli.allow_dirty,
    };

    Ok(file.build_config(&cli.project_dir, overrides)?)
}

fn parse_duration(s: &str) -> Result<Duration> {
    humantime::parse_duration(s)
        .map_err(|e| RolloutError::config(format!("invalid duration `{s}`: {e}")))
        .with_context(|| "failed to parse --timeout".to_string())
}

/// Cancel the run on Ctrl-C; the running command gets its grace period.
fn install_interrupt_handler(cancel: CancelToken) {
    std::thread::spawn(move || {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(rt) => rt,
            Err(e) => {
                eprintln!("[warn] Ctrl-C handling unavailable: {e}");
                return;
            }
        };
        runtime.block_on(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("[warn] interrupt received; stopping the running command");
                cancel.cancel();
            }
        });
    });
}

fn report_outcome(outcome: &RunOutcome, config: &Config) -> u8 {
    match outcome {
        RunOutcome::Completed { version, artifacts } => {
            println!("completed: version {version}");
            for artifact in artifacts {
                println!("  artifact: {}", display_relative(artifact, &config.project_dir));
            }
            println!(
                "receipt: {}",
                state::receipt_path(&config.state_dir).display()
            );
            outcome.exit_code()
        }
        RunOutcome::Aborted {
            step,
            reason,
            output_tail,
            checkpoint,
        } => {
            let message = reason
                .to_error()
                .map_or_else(|| reason.to_string(), |e| e.to_string());
            eprintln!("[error] step `{step}` failed: {message}");
            if !output_tail.is_empty() {
                eprintln!("--- output (last {} lines) ---", config.output_lines);
                eprintln!("{output_tail}");
                eprintln!("---");
            }
            let done: Vec<&str> = checkpoint
                .iter()
                .filter_map(|e| match e {
                    CheckpointEntry::Finished { step, result, .. } if result.is_success() => {
                        Some(step.as_str())
                    }
                    _ => None,
                })
                .collect();
            if !done.is_empty() {
                eprintln!("completed steps: {}", done.join(", "));
            }
            eprintln!(
                "checkpoint: {} (run `rollout resume` to continue)",
                checkpoint_path(&config.state_dir).display()
            );
            outcome.exit_code()
        }
    }
}

fn display_relative(path: &Path, base: &Path) -> String {
    path.strip_prefix(base).unwrap_or(path).display().to_string()
}

fn print_dry_run(plan: &DryRunPlan) {
    println!("goal: {}", plan.goal);
    println!("plan_id: {}", plan.plan_id);
    println!(
        "version: {} -> {}",
        plan.current_version, plan.projected_version
    );
    println!();

    for (idx, step) in plan.steps.iter().enumerate() {
        let mut flags = Vec::new();
        if !step.idempotent {
            flags.push("not idempotent");
        }
        if step.done {
            flags.push("done");
        }
        let flags = if flags.is_empty() {
            String::new()
        } else {
            format!(" [{}]", flags.join(", "))
        };
        println!("{:>3}. {}{flags}: {}", idx + 1, step.id, step.command);
    }
}

fn print_status(status: &StatusReport) {
    println!("environment: {}", status.environment);
    match status.version {
        Some(v) => println!("version: {v}"),
        None => println!("version: (no {})", status.version_file.display()),
    }

    match &status.lock {
        Some(lock) => println!(
            "lock: held by pid {} on {} since {}",
            lock.pid,
            lock.hostname,
            lock.acquired_at.to_rfc3339()
        ),
        None => println!("lock: free"),
    }

    match &status.pending {
        Some(pending) => {
            println!(
                "pending: {} (started {})",
                pending.goal,
                pending.created_at.to_rfc3339()
            );
            for record in &pending.records {
                let outcome = match &record.result.outcome {
                    StepOutcome::Success => "ok".to_string(),
                    StepOutcome::Skipped => "skipped".to_string(),
                    StepOutcome::Failure(reason) => format!("failed: {reason}"),
                };
                println!("  {}: {outcome}", record.step);
            }
            for step in &pending.in_flight {
                println!("  {step}: started, no result recorded");
            }
        }
        None => println!("pending: none"),
    }

    if let Some(receipt) = &status.last_receipt {
        println!(
            "last completed: {} at version {} ({})",
            receipt.goal,
            receipt.version,
            receipt.finished_at.to_rfc3339()
        );
    }
}

fn print_doctor(report: &DoctorReport) {
    println!("project_dir: {}", report.project_dir.display());
    println!("state_dir: {}", report.state_dir.display());
    match &report.version {
        Ok(v) => println!("version: {v}"),
        Err(e) => println!("version: error: {e}"),
    }
    println!();

    for tool in &report.tools {
        match &tool.path {
            Some(path) => println!("{}: {} ({})", tool.name, tool.program, path.display()),
            None => println!("{}: {} (not found on PATH)", tool.name, tool.program),
        }
    }
}
