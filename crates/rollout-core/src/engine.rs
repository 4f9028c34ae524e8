//! Sequential, resumable execution of a step plan.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::checkpoint::{CheckpointEntry, CheckpointLog, StepStatus};
use crate::error::{Result, RolloutError};
use crate::graph::{ActionEnv, Step};
use crate::process::{CancelToken, CommandRunner};
use crate::state::{self, CURRENT_RECEIPT_VERSION};
use crate::types::{
    FailureReason, Receipt, RunOutcome, RunState, StepOutcome, StepResult, WorkflowContext,
};
use crate::version::VersionStore;

pub trait Reporter {
    fn info(&mut self, msg: &str);
    fn warn(&mut self, msg: &str);
    fn error(&mut self, msg: &str);
}

/// Reporter that drops every message.
#[derive(Debug, Default)]
pub struct SilentReporter;

impl Reporter for SilentReporter {
    fn info(&mut self, _msg: &str) {}
    fn warn(&mut self, _msg: &str) {}
    fn error(&mut self, _msg: &str) {}
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Steps to run again even though the checkpoint records them as done.
    pub force: BTreeSet<String>,
    /// Lines of output kept in an abort report.
    pub output_lines: usize,
    pub default_timeout: Duration,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            force: BTreeSet::new(),
            output_lines: 50,
            default_timeout: Duration::from_secs(600),
        }
    }
}

/// Executes one plan once.
pub struct WorkflowEngine<'a> {
    runner: &'a dyn CommandRunner,
    versions: &'a VersionStore,
    log: &'a CheckpointLog,
    cancel: CancelToken,
    options: RunOptions,
    state: RunState,
}

impl<'a> WorkflowEngine<'a> {
    pub fn new(
        runner: &'a dyn CommandRunner,
        versions: &'a VersionStore,
        log: &'a CheckpointLog,
        cancel: CancelToken,
        options: RunOptions,
    ) -> Self {
        Self {
            runner,
            versions,
            log,
            cancel,
            options,
            state: RunState::Pending,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// Run `steps` in order against `ctx`.
    ///
    /// Steps the checkpoint in `ctx` already records as successful are
    /// skipped unless forced. The first failure stops the run and leaves the
    /// checkpoint on disk; completing every step clears it and writes the
    /// receipt.
    pub fn execute(
        &mut self,
        steps: &[Arc<Step>],
        ctx: &mut WorkflowContext,
        reporter: &mut dyn Reporter,
    ) -> Result<RunOutcome> {
        if self.state != RunState::Pending {
            return Err(RolloutError::config(
                "workflow engine has already executed a plan",
            ));
        }
        self.state = RunState::Running;

        let outcome = self.walk(steps, ctx, reporter);
        self.state = match &outcome {
            Ok(RunOutcome::Completed { .. }) => RunState::Completed,
            _ => RunState::Aborted,
        };
        outcome
    }

    fn walk(
        &self,
        steps: &[Arc<Step>],
        ctx: &mut WorkflowContext,
        reporter: &mut dyn Reporter,
    ) -> Result<RunOutcome> {
        let started_at = Utc::now();
        self.log.start(&ctx.checkpoint)?;

        for step in steps {
            if self.cancel.is_cancelled() {
                reporter.error(&format!("{}: cancelled before start", step.id));
                return Ok(aborted(step, FailureReason::Cancelled, String::new(), ctx));
            }

            let forced = self.options.force.contains(&step.id);
            let (done_before, dangling) = match ctx.checkpoint.status(&step.id) {
                Some(StepStatus::Finished(prev)) => (prev.is_success(), false),
                Some(StepStatus::Started) => (false, true),
                None => (false, false),
            };

            if done_before && !forced {
                reporter.info(&format!("{}: already succeeded (skipping)", step.id));
                if let Err(e) = step.action.restore(ctx) {
                    let reason = FailureReason::Action {
                        message: e.to_string(),
                    };
                    reporter.error(&format!("{}: {reason}", step.id));
                    return Ok(aborted(step, reason, String::new(), ctx));
                }
                continue;
            }
            if dangling && !step.idempotent && !forced {
                reporter.error(&format!(
                    "{}: started in an earlier run with no recorded result",
                    step.id
                ));
                return Ok(aborted(step, FailureReason::Interrupted, String::new(), ctx));
            }

            if forced {
                reporter.warn(&format!("{}: forced re-run", step.id));
            }

            if !step.idempotent {
                self.record(
                    ctx,
                    CheckpointEntry::Started {
                        step: step.id.clone(),
                        at: Utc::now(),
                    },
                )?;
            }

            reporter.info(&format!("{}: running {}", step.id, step.action.describe(ctx)));
            let env = ActionEnv {
                runner: self.runner,
                versions: self.versions,
                default_timeout: self.options.default_timeout,
            };
            let result = step.action.run(ctx, &env).unwrap_or_else(|e| {
                StepResult::failure(FailureReason::Action {
                    message: e.to_string(),
                })
            });

            self.record(
                ctx,
                CheckpointEntry::Finished {
                    step: step.id.clone(),
                    result: result.clone(),
                    at: Utc::now(),
                },
            )?;

            match &result.outcome {
                StepOutcome::Success => {
                    reporter.info(&format!("{}: ok ({}ms)", step.id, result.duration_ms));
                }
                StepOutcome::Skipped => {
                    reporter.info(&format!("{}: skipped", step.id));
                }
                StepOutcome::Failure(reason) => {
                    reporter.error(&format!("{}: {reason}", step.id));
                    let tail = result.output_tail(self.options.output_lines);
                    return Ok(aborted(step, reason.clone(), tail, ctx));
                }
            }
        }

        let receipt = Receipt {
            receipt_version: CURRENT_RECEIPT_VERSION.to_string(),
            goal: ctx.checkpoint.goal.clone(),
            plan_id: ctx.checkpoint.plan_id.clone(),
            environment: ctx.environment.clone(),
            version: ctx.version,
            artifacts: ctx.artifacts.clone(),
            started_at,
            finished_at: Utc::now(),
            steps: ctx.checkpoint.records(),
        };
        state::write_receipt(self.log.state_dir(), &receipt)?;
        self.log.clear()?;

        Ok(RunOutcome::Completed {
            version: ctx.version,
            artifacts: ctx.artifacts.clone(),
        })
    }

    fn record(&self, ctx: &mut WorkflowContext, entry: CheckpointEntry) -> Result<()> {
        self.log.append(&entry)?;
        ctx.checkpoint.push(entry);
        Ok(())
    }
}

fn aborted(
    step: &Step,
    reason: FailureReason,
    output_tail: String,
    ctx: &WorkflowContext,
) -> RunOutcome {
    RunOutcome::Aborted {
        step: step.id.clone(),
        reason,
        output_tail,
        checkpoint: ctx.checkpoint.all_entries(),
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::{TempDir, tempdir};

    use super::*;
    use crate::checkpoint::Checkpoint;
    use crate::config::ToolCommand;
    use crate::graph::{StepAction, StepGraph};
    use crate::state::load_receipt;
    use crate::steps::{BumpAction, CommandAction};
    use crate::testing::{CollectingReporter, RecordingRunner};
    use crate::version::{BumpKind, Version};

    struct Fixture {
        _td: TempDir,
        versions: VersionStore,
        log: CheckpointLog,
    }

    impl Fixture {
        fn new() -> Self {
            let td = tempdir().expect("tempdir");
            let versions = VersionStore::new(td.path().join("VERSION"));
            versions.write(Version::new(1, 2, 3)).expect("write version");
            let log = CheckpointLog::new(&td.path().join(".rollout"));
            Self {
                _td: td,
                versions,
                log,
            }
        }

        fn context(&self, goal: &str) -> WorkflowContext {
            let checkpoint = self
                .log
                .load()
                .expect("load")
                .unwrap_or_else(|| Checkpoint::new(goal, "plan"));
            WorkflowContext::new(self.versions.read().expect("version"), "test", checkpoint)
        }
    }

    fn tool_step(id: &str) -> Step {
        Step::new(
            id,
            CommandAction {
                tool: ToolCommand::new(id, &[]),
            },
        )
    }

    /// lock-check -> build -> publish, with publish non-idempotent.
    fn pipeline() -> Vec<Arc<Step>> {
        let graph = StepGraph::new()
            .with(tool_step("lock-check"))
            .and_then(|g| g.with(tool_step("build").after(["lock-check"])))
            .and_then(|g| g.with(tool_step("publish").after(["build"]).non_idempotent()))
            .expect("graph");
        graph.build("publish").expect("plan")
    }

    fn execute(
        fx: &Fixture,
        runner: &RecordingRunner,
        cancel: CancelToken,
        force: &[&str],
        steps: &[Arc<Step>],
    ) -> (RunOutcome, CollectingReporter) {
        let mut ctx = fx.context("publish");
        let mut reporter = CollectingReporter::default();
        let options = RunOptions {
            force: force.iter().map(|s| s.to_string()).collect(),
            ..RunOptions::default()
        };
        let mut engine = WorkflowEngine::new(runner, &fx.versions, &fx.log, cancel, options);
        let outcome = engine
            .execute(steps, &mut ctx, &mut reporter)
            .expect("execute");
        (outcome, reporter)
    }

    #[test]
    fn failing_step_aborts_and_later_steps_never_run() {
        let fx = Fixture::new();
        let runner = RecordingRunner::new().fail("build", 2, "compile error");

        let (outcome, reporter) = execute(&fx, &runner, CancelToken::new(), &[], &pipeline());

        match outcome {
            RunOutcome::Aborted {
                step,
                reason,
                output_tail,
                checkpoint,
            } => {
                assert_eq!(step, "build");
                assert_eq!(reason, FailureReason::NonZeroExit { code: 2 });
                assert!(output_tail.contains("compile error"));
                assert_eq!(checkpoint.len(), 3);
            }
            other => panic!("expected abort, got {other:?}"),
        }
        assert_eq!(runner.calls_to("publish"), 0);
        assert!(reporter.errors.iter().any(|m| m.starts_with("build:")));

        let on_disk = fx.log.load().expect("load").expect("checkpoint kept");
        assert!(on_disk.succeeded("lock-check"));
        assert!(!on_disk.succeeded("build"));
    }

    #[test]
    fn resume_runs_only_unfinished_steps() {
        let fx = Fixture::new();
        let failing = RecordingRunner::new().fail("publish", 1, "registry down");
        let (first, _) = execute(&fx, &failing, CancelToken::new(), &[], &pipeline());
        assert!(!first.is_completed());

        let runner = RecordingRunner::new();
        let (outcome, reporter) = execute(&fx, &runner, CancelToken::new(), &[], &pipeline());

        assert!(outcome.is_completed());
        assert_eq!(runner.programs(), vec!["publish"]);
        assert_eq!(
            reporter
                .infos
                .iter()
                .filter(|m| m.contains("already succeeded"))
                .count(),
            2
        );
        assert!(!fx.log.exists());
    }

    #[test]
    fn completed_run_clears_checkpoint_and_writes_receipt() {
        let fx = Fixture::new();
        let runner = RecordingRunner::new();

        let (outcome, _) = execute(&fx, &runner, CancelToken::new(), &[], &pipeline());

        assert_eq!(
            outcome,
            RunOutcome::Completed {
                version: Version::new(1, 2, 3),
                artifacts: vec![],
            }
        );
        assert_eq!(runner.programs(), vec!["lock-check", "build", "publish"]);
        assert!(!fx.log.exists());

        let receipt = load_receipt(fx.log.state_dir())
            .expect("load")
            .expect("receipt");
        let steps: Vec<&str> = receipt.steps.iter().map(|r| r.step.as_str()).collect();
        assert_eq!(steps, vec!["lock-check", "build", "publish"]);
        assert_eq!(receipt.environment, "test");
    }

    #[test]
    fn succeeded_non_idempotent_step_is_not_repeated_without_force() {
        let fx = Fixture::new();
        let steps = pipeline();
        let mut cp = Checkpoint::new("publish", "plan");
        for id in ["lock-check", "build", "publish"] {
            cp.push(CheckpointEntry::Finished {
                step: id.to_string(),
                result: StepResult::success(),
                at: Utc::now(),
            });
        }
        fx.log.start(&cp).expect("seed");

        let runner = RecordingRunner::new();
        let (outcome, _) = execute(&fx, &runner, CancelToken::new(), &[], &steps);
        assert!(outcome.is_completed());
        assert!(runner.programs().is_empty());
    }

    #[test]
    fn force_repeats_a_recorded_success() {
        let fx = Fixture::new();
        let steps = pipeline();
        let mut cp = Checkpoint::new("publish", "plan");
        for id in ["lock-check", "build", "publish"] {
            cp.push(CheckpointEntry::Finished {
                step: id.to_string(),
                result: StepResult::success(),
                at: Utc::now(),
            });
        }
        fx.log.start(&cp).expect("seed");

        let runner = RecordingRunner::new();
        let (outcome, reporter) =
            execute(&fx, &runner, CancelToken::new(), &["publish"], &steps);
        assert!(outcome.is_completed());
        assert_eq!(runner.programs(), vec!["publish"]);
        assert!(reporter.warns.iter().any(|m| m.contains("forced")));
    }

    #[test]
    fn dangling_start_of_non_idempotent_step_is_interrupted() {
        let fx = Fixture::new();
        let mut cp = Checkpoint::new("publish", "plan");
        for id in ["lock-check", "build"] {
            cp.push(CheckpointEntry::Finished {
                step: id.to_string(),
                result: StepResult::success(),
                at: Utc::now(),
            });
        }
        cp.push(CheckpointEntry::Started {
            step: "publish".to_string(),
            at: Utc::now(),
        });
        fx.log.start(&cp).expect("seed");
        let before = fs::read_to_string(fx.log.path()).expect("read");

        let runner = RecordingRunner::new();
        let (outcome, _) = execute(&fx, &runner, CancelToken::new(), &[], &pipeline());

        assert!(matches!(
            outcome,
            RunOutcome::Aborted { ref step, reason: FailureReason::Interrupted, .. } if step == "publish"
        ));
        assert!(runner.programs().is_empty());
        assert_eq!(fs::read_to_string(fx.log.path()).expect("read"), before);

        // An explicit force resolves it.
        let (forced, _) = execute(&fx, &runner, CancelToken::new(), &["publish"], &pipeline());
        assert!(forced.is_completed());
        assert_eq!(runner.programs(), vec!["publish"]);
    }

    #[test]
    fn cancellation_aborts_before_next_step() {
        let fx = Fixture::new();
        let cancel = CancelToken::new();
        cancel.cancel();
        let runner = RecordingRunner::new();

        let (outcome, _) = execute(&fx, &runner, cancel, &[], &pipeline());
        assert!(matches!(
            outcome,
            RunOutcome::Aborted { ref step, reason: FailureReason::Cancelled, .. } if step == "lock-check"
        ));
        assert!(runner.programs().is_empty());
    }

    #[test]
    fn action_error_becomes_step_failure() {
        let fx = Fixture::new();
        let graph = StepGraph::new()
            .with(
                Step::new(
                    "bump-patch",
                    BumpAction {
                        kind: BumpKind::Patch,
                    },
                )
                .non_idempotent(),
            )
            .expect("graph");
        let steps = graph.build("bump-patch").expect("plan");
        let mut ctx = fx.context("bump-patch");
        fs::write(fx.versions.path(), "garbage\n").expect("corrupt version");

        let runner = RecordingRunner::new();
        let mut engine = WorkflowEngine::new(
            &runner,
            &fx.versions,
            &fx.log,
            CancelToken::new(),
            RunOptions::default(),
        );
        let outcome = engine
            .execute(&steps, &mut ctx, &mut SilentReporter)
            .expect("execute");

        assert!(matches!(
            outcome,
            RunOutcome::Aborted { reason: FailureReason::Action { .. }, .. }
        ));
        assert_eq!(engine.state(), RunState::Aborted);
    }

    struct NothingToDo;

    impl StepAction for NothingToDo {
        fn run(&self, _ctx: &mut WorkflowContext, _env: &ActionEnv<'_>) -> Result<StepResult> {
            Ok(StepResult {
                outcome: StepOutcome::Skipped,
                ..StepResult::success()
            })
        }

        fn describe(&self, _ctx: &WorkflowContext) -> String {
            "nothing".to_string()
        }
    }

    #[test]
    fn skipped_action_does_not_stop_the_run() {
        let fx = Fixture::new();
        let graph = StepGraph::new()
            .with(Step::new("sign", NothingToDo))
            .and_then(|g| g.with(tool_step("publish").after(["sign"])))
            .expect("graph");
        let steps = graph.build("publish").expect("plan");

        let runner = RecordingRunner::new();
        let (outcome, reporter) = execute(&fx, &runner, CancelToken::new(), &[], &steps);

        assert!(outcome.is_completed());
        assert_eq!(runner.programs(), vec!["publish"]);
        assert!(reporter.infos.iter().any(|m| m == "sign: skipped"));

        let receipt = load_receipt(fx.log.state_dir())
            .expect("load")
            .expect("receipt");
        assert_eq!(receipt.steps[0].step, "sign");
        assert_eq!(receipt.steps[0].result.outcome, StepOutcome::Skipped);
    }

    #[test]
    fn bump_updates_context_version() {
        let fx = Fixture::new();
        let graph = StepGraph::new()
            .with(Step::new("bump-minor", BumpAction { kind: BumpKind::Minor }).non_idempotent())
            .expect("graph");
        let steps = graph.build("bump-minor").expect("plan");

        let runner = RecordingRunner::new();
        let (outcome, _) = execute(&fx, &runner, CancelToken::new(), &[], &steps);
        assert_eq!(
            outcome,
            RunOutcome::Completed {
                version: Version::new(1, 3, 0),
                artifacts: vec![],
            }
        );
        assert_eq!(fx.versions.read().expect("read"), Version::new(1, 3, 0));
    }

    #[test]
    fn engine_runs_a_plan_only_once() {
        let fx = Fixture::new();
        let runner = RecordingRunner::new();
        let steps = pipeline();
        let mut engine = WorkflowEngine::new(
            &runner,
            &fx.versions,
            &fx.log,
            CancelToken::new(),
            RunOptions::default(),
        );
        assert_eq!(engine.state(), RunState::Pending);

        let mut ctx = fx.context("publish");
        engine
            .execute(&steps, &mut ctx, &mut SilentReporter)
            .expect("first");
        assert_eq!(engine.state(), RunState::Completed);

        let mut ctx = fx.context("publish");
        assert!(matches!(
            engine.execute(&steps, &mut ctx, &mut SilentReporter),
            Err(RolloutError::ConfigurationError(_))
        ));
    }
}
