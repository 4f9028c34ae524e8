//! Named workflows and the entry points the CLI drives.
//!
//! The orchestrator owns the exclusive lock for the duration of a run, picks
//! up a pending checkpoint when the plan matches, and hands the plan to the
//! [`WorkflowEngine`].

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::checkpoint::{Checkpoint, CheckpointLog, StepStatus};
use crate::config::Config;
use crate::engine::{Reporter, RunOptions, WorkflowEngine};
use crate::error::{Result, RolloutError};
use crate::graph::{Step, plan_id};
use crate::lock::{LockFile, LockInfo};
use crate::process::{self, CancelToken, CommandRunner};
use crate::state;
use crate::steps::{self, standard_graph};
use crate::types::{Receipt, RunOutcome, StepRecord, WorkflowContext};
use crate::version::{BumpKind, Version, VersionStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Workflow {
    Check,
    Bump(BumpKind),
    Build,
    Verify,
    Publish,
    Release(BumpKind),
}

impl Workflow {
    /// Step the workflow drives toward.
    pub fn goal(self) -> &'static str {
        match self {
            Self::Check => steps::CHECK,
            Self::Bump(kind) => steps::bump_step(kind),
            Self::Build => steps::BUILD,
            Self::Verify => steps::VERIFY,
            Self::Publish => steps::PUBLISH,
            Self::Release(kind) => steps::release_step(kind),
        }
    }
}

impl fmt::Display for Workflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Check => f.write_str("check"),
            Self::Bump(kind) => write!(f, "bump-{kind}"),
            Self::Build => f.write_str("build"),
            Self::Verify => f.write_str("verify"),
            Self::Publish => f.write_str("publish"),
            Self::Release(kind) => write!(f, "{kind}"),
        }
    }
}

impl FromStr for Workflow {
    type Err = RolloutError;

    fn from_str(s: &str) -> Result<Self> {
        let workflow = match s {
            "check" => Self::Check,
            "build" => Self::Build,
            "verify" => Self::Verify,
            "publish" => Self::Publish,
            other => match other.strip_prefix("bump-") {
                Some(kind) => Self::Bump(parse_kind(kind, s)?),
                None => Self::Release(parse_kind(other, s)?),
            },
        };
        Ok(workflow)
    }
}

fn parse_kind(kind: &str, workflow: &str) -> Result<BumpKind> {
    kind.parse()
        .map_err(|_| RolloutError::config(format!("unknown workflow `{workflow}`")))
}

/// What a workflow would do, computed without side effects.
#[derive(Debug, Clone)]
pub struct DryRunPlan {
    pub goal: String,
    pub plan_id: String,
    pub current_version: Version,
    pub projected_version: Version,
    pub steps: Vec<PlannedStep>,
}

#[derive(Debug, Clone)]
pub struct PlannedStep {
    pub id: String,
    pub idempotent: bool,
    pub command: String,
    /// A pending checkpoint for this plan already records a success.
    pub done: bool,
}

#[derive(Debug, Clone)]
pub struct PendingRun {
    pub goal: String,
    pub plan_id: String,
    pub created_at: DateTime<Utc>,
    pub records: Vec<StepRecord>,
    /// Steps with a start marker and no result.
    pub in_flight: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct StatusReport {
    pub environment: String,
    /// `None` when the version file does not exist yet.
    pub version: Option<Version>,
    pub version_file: PathBuf,
    pub pending: Option<PendingRun>,
    pub lock: Option<LockInfo>,
    pub last_receipt: Option<Receipt>,
}

#[derive(Debug, Clone)]
pub struct ToolCheck {
    pub name: &'static str,
    pub program: String,
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct DoctorReport {
    pub project_dir: PathBuf,
    pub state_dir: PathBuf,
    pub version: std::result::Result<Version, String>,
    pub tools: Vec<ToolCheck>,
}

impl DoctorReport {
    pub fn is_healthy(&self) -> bool {
        self.version.is_ok() && self.tools.iter().all(|t| t.path.is_some())
    }
}

pub struct ReleaseOrchestrator {
    config: Config,
    runner: Arc<dyn CommandRunner>,
    cancel: CancelToken,
    versions: VersionStore,
    log: CheckpointLog,
}

impl ReleaseOrchestrator {
    pub fn new(config: Config, runner: Arc<dyn CommandRunner>, cancel: CancelToken) -> Self {
        let versions = VersionStore::new(&config.version_file);
        let log = CheckpointLog::new(&config.state_dir);
        Self {
            config,
            runner,
            cancel,
            versions,
            log,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Run `workflow` to completion or to its first failing step.
    ///
    /// A pending checkpoint for the same plan is resumed; one for a
    /// different plan must be resumed or abandoned first.
    pub fn run(
        &self,
        workflow: Workflow,
        force: &BTreeSet<String>,
        reporter: &mut dyn Reporter,
    ) -> Result<RunOutcome> {
        let goal = workflow.goal();
        let plan = standard_graph(&self.config)?.build(goal)?;
        check_forced(force, &plan)?;
        let id = plan_id(goal, &plan);

        let mut lock = self.lock()?;
        lock.set_plan_id(&id)?;

        let checkpoint = match self.log.load()? {
            Some(cp) if cp.plan_id == id => {
                reporter.info(&format!(
                    "resuming `{}` from checkpoint created {}",
                    cp.goal,
                    cp.created_at.to_rfc3339()
                ));
                cp
            }
            Some(cp) => {
                return Err(RolloutError::config(format!(
                    "a `{}` run is pending in {}; run `rollout resume` to finish it or `rollout abandon` to discard it",
                    cp.goal,
                    self.log.path().display()
                )));
            }
            None => Checkpoint::new(goal, &id),
        };

        reporter.info(&format!("workflow {workflow}: {} step(s)", plan.len()));
        let outcome = self.execute(&plan, checkpoint, force, reporter)?;
        lock.release()?;
        Ok(outcome)
    }

    /// Continue the pending run recorded in the checkpoint.
    pub fn resume(
        &self,
        force: &BTreeSet<String>,
        reporter: &mut dyn Reporter,
    ) -> Result<RunOutcome> {
        let mut lock = self.lock()?;
        let checkpoint = self
            .log
            .load()?
            .ok_or_else(|| RolloutError::config("no pending run to resume"))?;

        let plan = standard_graph(&self.config)?.build(&checkpoint.goal)?;
        if plan_id(&checkpoint.goal, &plan) != checkpoint.plan_id {
            return Err(RolloutError::config(format!(
                "the pending `{}` run was planned with different steps; run `rollout abandon` to discard it",
                checkpoint.goal
            )));
        }
        check_forced(force, &plan)?;
        lock.set_plan_id(&checkpoint.plan_id)?;

        reporter.info(&format!("resuming `{}`", checkpoint.goal));
        let outcome = self.execute(&plan, checkpoint, force, reporter)?;
        lock.release()?;
        Ok(outcome)
    }

    /// The plan for `workflow`, with each step's rendered command and the
    /// version it would end on. Takes no lock and runs nothing.
    pub fn dry_run(&self, workflow: Workflow) -> Result<DryRunPlan> {
        let goal = workflow.goal();
        let plan = standard_graph(&self.config)?.build(goal)?;
        let id = plan_id(goal, &plan);
        let current = self.versions.read()?;

        let pending = self.log.load()?.filter(|cp| cp.plan_id == id);
        let mut ctx = WorkflowContext::new(
            current,
            self.config.environment.clone(),
            pending.unwrap_or_else(|| Checkpoint::new(goal, &id)),
        );

        let mut steps = Vec::with_capacity(plan.len());
        for step in &plan {
            let done = ctx.checkpoint.succeeded(&step.id);
            // A completed bump is already reflected in the version file.
            if done {
                step.action.restore(&mut ctx)?;
            }
            steps.push(PlannedStep {
                id: step.id.clone(),
                idempotent: step.idempotent,
                command: step.action.describe(&ctx),
                done,
            });
            if !done {
                step.action.project(&mut ctx);
            }
        }

        Ok(DryRunPlan {
            goal: goal.to_string(),
            plan_id: id,
            current_version: current,
            projected_version: ctx.version,
            steps,
        })
    }

    /// Discard the pending checkpoint. Returns whether there was one.
    pub fn abandon(&self, reporter: &mut dyn Reporter) -> Result<bool> {
        let mut lock = self.lock()?;
        if !self.log.exists() {
            lock.release()?;
            return Ok(false);
        }
        match self.log.load() {
            Ok(Some(cp)) => reporter.warn(&format!(
                "abandoning `{}` run ({} step entries)",
                cp.goal,
                cp.entries().len()
            )),
            Ok(None) => reporter.warn("removing empty checkpoint"),
            Err(e) => reporter.warn(&format!("removing unreadable checkpoint: {e}")),
        }
        self.log.clear()?;
        lock.release()?;
        Ok(true)
    }

    pub fn status(&self) -> Result<StatusReport> {
        let version = match self.versions.read() {
            Ok(v) => Some(v),
            Err(RolloutError::NotFound { .. }) => None,
            Err(e) => return Err(e),
        };

        let pending = self.log.load()?.map(|cp| {
            let in_flight = cp
                .entries()
                .iter()
                .filter_map(|e| e.step())
                .filter(|s| matches!(cp.status(s), Some(StepStatus::Started)))
                .map(str::to_string)
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect();
            PendingRun {
                goal: cp.goal.clone(),
                plan_id: cp.plan_id.clone(),
                created_at: cp.created_at,
                records: cp.records(),
                in_flight,
            }
        });

        let lock = if LockFile::is_locked(&self.config.state_dir) {
            LockFile::read_lock_info(&self.config.state_dir).ok()
        } else {
            None
        };

        Ok(StatusReport {
            environment: self.config.environment.clone(),
            version,
            version_file: self.versions.path().to_path_buf(),
            pending,
            lock,
            last_receipt: state::load_receipt(&self.config.state_dir)?,
        })
    }

    /// Look up every configured tool on `PATH` and read the version file.
    pub fn doctor(&self) -> DoctorReport {
        let tools = self
            .config
            .tools
            .named()
            .into_iter()
            .map(|(name, tool)| ToolCheck {
                name,
                program: tool.program.clone(),
                path: process::which(&tool.program),
            })
            .collect();

        DoctorReport {
            project_dir: self.config.project_dir.clone(),
            state_dir: self.config.state_dir.clone(),
            version: self.versions.read().map_err(|e| e.to_string()),
            tools,
        }
    }

    fn lock(&self) -> Result<LockFile> {
        match self.config.lock_stale_after {
            Some(stale_after) => LockFile::acquire_with_timeout(&self.config.state_dir, stale_after),
            None => LockFile::acquire(&self.config.state_dir),
        }
    }

    fn execute(
        &self,
        plan: &[Arc<Step>],
        checkpoint: Checkpoint,
        force: &BTreeSet<String>,
        reporter: &mut dyn Reporter,
    ) -> Result<RunOutcome> {
        let version = self.versions.read()?;
        let mut ctx = WorkflowContext::new(version, self.config.environment.clone(), checkpoint);
        let options = RunOptions {
            force: force.clone(),
            output_lines: self.config.output_lines,
            default_timeout: self.config.default_timeout,
        };
        let mut engine = WorkflowEngine::new(
            self.runner.as_ref(),
            &self.versions,
            &self.log,
            self.cancel.clone(),
            options,
        );
        engine.execute(plan, &mut ctx, reporter)
    }
}

/// Every forced step must be part of the plan.
fn check_forced(force: &BTreeSet<String>, plan: &[Arc<Step>]) -> Result<()> {
    match force.iter().find(|f| !plan.iter().any(|s| &s.id == *f)) {
        Some(missing) => Err(RolloutError::UnknownStep {
            step: missing.clone(),
            referenced_by: None,
        }),
        None => Ok(()),
    }
}
