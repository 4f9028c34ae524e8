//! Built-in release steps and the default step graph.
//!
//! Tool arguments may contain `{version}`, `{env}` and `{artifacts}`
//! placeholders; `{artifacts}` must stand alone and expands to one argument
//! per collected artifact.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::Context;

use crate::config::{Config, ToolCommand};
use crate::error::Result;
use crate::graph::{ActionEnv, Step, StepAction, StepGraph};
use crate::types::{FailureReason, StepResult, WorkflowContext};
use crate::version::BumpKind;

pub const LOCK_CHECK: &str = "lock-check";
pub const VCS_CHECK: &str = "vcs-check";
pub const CHECK: &str = "check";
pub const BUMP_PATCH: &str = "bump-patch";
pub const BUMP_MINOR: &str = "bump-minor";
pub const BUMP_MAJOR: &str = "bump-major";
pub const BUILD: &str = "build";
pub const VERIFY: &str = "verify";
pub const UPLOAD: &str = "upload";
pub const HOST_RELEASE: &str = "host-release";
pub const PUBLISH: &str = "publish";
pub const RELEASE_PATCH: &str = "release-patch";
pub const RELEASE_MINOR: &str = "release-minor";
pub const RELEASE_MAJOR: &str = "release-major";

pub fn bump_step(kind: BumpKind) -> &'static str {
    match kind {
        BumpKind::Patch => BUMP_PATCH,
        BumpKind::Minor => BUMP_MINOR,
        BumpKind::Major => BUMP_MAJOR,
    }
}

pub fn release_step(kind: BumpKind) -> &'static str {
    match kind {
        BumpKind::Patch => RELEASE_PATCH,
        BumpKind::Minor => RELEASE_MINOR,
        BumpKind::Major => RELEASE_MAJOR,
    }
}

/// Substitute placeholders in `args` from the run context.
pub fn render_args(args: &[String], ctx: &WorkflowContext) -> Vec<String> {
    let version = ctx.version.to_string();
    let mut out = Vec::with_capacity(args.len());
    for arg in args {
        if arg == "{artifacts}" {
            out.extend(ctx.artifacts.iter().map(|p| p.display().to_string()));
        } else {
            out.push(
                arg.replace("{version}", &version)
                    .replace("{env}", &ctx.environment),
            );
        }
    }
    out
}

fn command_line(tool: &ToolCommand, ctx: &WorkflowContext) -> String {
    std::iter::once(tool.program.clone())
        .chain(render_args(&tool.args, ctx))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Runs a configured tool.
pub struct CommandAction {
    pub tool: ToolCommand,
}

impl StepAction for CommandAction {
    fn run(&self, ctx: &mut WorkflowContext, env: &ActionEnv<'_>) -> Result<StepResult> {
        let args = render_args(&self.tool.args, ctx);
        let timeout = self.tool.timeout.unwrap_or(env.default_timeout);
        Ok(env.runner.run(&self.tool.program, &args, timeout))
    }

    fn describe(&self, ctx: &WorkflowContext) -> String {
        command_line(&self.tool, ctx)
    }
}

/// Fails when the version-control status command reports changes.
pub struct CleanTreeAction {
    pub tool: ToolCommand,
    pub allow_dirty: bool,
}

impl StepAction for CleanTreeAction {
    fn run(&self, ctx: &mut WorkflowContext, env: &ActionEnv<'_>) -> Result<StepResult> {
        let args = render_args(&self.tool.args, ctx);
        let timeout = self.tool.timeout.unwrap_or(env.default_timeout);
        let result = env.runner.run(&self.tool.program, &args, timeout);

        if result.is_success() && !self.allow_dirty && !result.stdout.trim().is_empty() {
            return Ok(StepResult {
                outcome: crate::types::StepOutcome::Failure(FailureReason::Action {
                    message: "working tree has uncommitted changes (use --allow-dirty to override)"
                        .to_string(),
                }),
                ..result
            });
        }
        Ok(result)
    }

    fn describe(&self, ctx: &WorkflowContext) -> String {
        let line = command_line(&self.tool, ctx);
        if self.allow_dirty {
            format!("{line} (dirty tree allowed)")
        } else {
            format!("{line} (must print nothing)")
        }
    }
}

/// Bumps the stored version and carries the new value into the context.
pub struct BumpAction {
    pub kind: BumpKind,
}

impl StepAction for BumpAction {
    fn run(&self, ctx: &mut WorkflowContext, env: &ActionEnv<'_>) -> Result<StepResult> {
        let previous = ctx.version;
        let next = env.versions.bump(self.kind)?;
        ctx.version = next;
        Ok(StepResult {
            stdout: format!("bumped {previous} -> {next}"),
            ..StepResult::success()
        })
    }

    fn describe(&self, ctx: &WorkflowContext) -> String {
        match ctx.version.bumped(self.kind) {
            Some(next) => format!("bump {} version {} -> {next}", self.kind, ctx.version),
            None => format!("bump {} version {} (overflows)", self.kind, ctx.version),
        }
    }

    fn project(&self, ctx: &mut WorkflowContext) {
        if let Some(next) = ctx.version.bumped(self.kind) {
            ctx.version = next;
        }
    }
}

/// Runs the build tool, then records the artifacts for the current version.
pub struct BuildAction {
    pub tool: ToolCommand,
    pub artifacts_dir: PathBuf,
}

impl StepAction for BuildAction {
    fn run(&self, ctx: &mut WorkflowContext, env: &ActionEnv<'_>) -> Result<StepResult> {
        let args = render_args(&self.tool.args, ctx);
        let timeout = self.tool.timeout.unwrap_or(env.default_timeout);
        let result = env.runner.run(&self.tool.program, &args, timeout);
        if result.is_success() {
            ctx.artifacts = collect_artifacts(&self.artifacts_dir, &ctx.version.to_string())?;
        }
        Ok(result)
    }

    fn restore(&self, ctx: &mut WorkflowContext) -> Result<()> {
        ctx.artifacts = collect_artifacts(&self.artifacts_dir, &ctx.version.to_string())?;
        Ok(())
    }

    fn describe(&self, ctx: &WorkflowContext) -> String {
        format!(
            "{} (artifacts from {})",
            command_line(&self.tool, ctx),
            self.artifacts_dir.display()
        )
    }
}

/// Files in `dir` whose name mentions `version`, sorted by path.
pub fn collect_artifacts(dir: &Path, version: &str) -> Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(anyhow::Error::new(e)
                .context(format!("failed to read artifacts dir {}", dir.display()))
                .into());
        }
    };

    let mut artifacts = Vec::new();
    for entry in entries {
        let entry =
            entry.with_context(|| format!("failed to read artifacts dir {}", dir.display()))?;
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().to_string();
        if path.is_file() && mentions_version(&name, version) {
            artifacts.push(path);
        }
    }
    artifacts.sort();
    Ok(artifacts)
}

/// `version` appears in `name` not directly followed or preceded by another digit.
fn mentions_version(name: &str, version: &str) -> bool {
    name.match_indices(version).any(|(idx, _)| {
        let before = name[..idx].chars().next_back();
        let after = name[idx + version.len()..].chars().next();
        !before.is_some_and(|c| c.is_ascii_digit() || c == '.')
            && !after.is_some_and(|c| c.is_ascii_digit())
    })
}

/// Groups prerequisites under one name; does nothing itself.
pub struct GroupAction;

impl StepAction for GroupAction {
    fn run(&self, _ctx: &mut WorkflowContext, _env: &ActionEnv<'_>) -> Result<StepResult> {
        Ok(StepResult::success())
    }

    fn describe(&self, _ctx: &WorkflowContext) -> String {
        "(group)".to_string()
    }
}

/// The default release graph, in declaration order.
pub fn standard_graph(config: &Config) -> Result<StepGraph> {
    let tools = &config.tools;
    let mut graph = StepGraph::new();

    graph.add(Step::new(
        LOCK_CHECK,
        CommandAction {
            tool: tools.lock_check.clone(),
        },
    ))?;
    graph.add(Step::new(
        VCS_CHECK,
        CleanTreeAction {
            tool: tools.vcs_status.clone(),
            allow_dirty: config.allow_dirty,
        },
    ))?;
    graph.add(Step::new(CHECK, GroupAction).after([LOCK_CHECK, VCS_CHECK]))?;
    for kind in [BumpKind::Patch, BumpKind::Minor, BumpKind::Major] {
        graph.add(
            Step::new(bump_step(kind), BumpAction { kind })
                .after([CHECK])
                .non_idempotent(),
        )?;
    }
    graph.add(
        Step::new(
            BUILD,
            BuildAction {
                tool: tools.build.clone(),
                artifacts_dir: config.artifacts_dir.clone(),
            },
        )
        .after([LOCK_CHECK]),
    )?;
    graph.add(
        Step::new(
            VERIFY,
            CommandAction {
                tool: tools.verify.clone(),
            },
        )
        .after([BUILD]),
    )?;
    graph.add(
        Step::new(
            UPLOAD,
            CommandAction {
                tool: tools.upload.clone(),
            },
        )
        .after([VERIFY])
        .non_idempotent(),
    )?;
    graph.add(
        Step::new(
            HOST_RELEASE,
            CommandAction {
                tool: tools.host_release.clone(),
            },
        )
        .after([UPLOAD])
        .non_idempotent(),
    )?;
    graph.add(Step::new(PUBLISH, GroupAction).after([UPLOAD, HOST_RELEASE]))?;
    for kind in [BumpKind::Patch, BumpKind::Minor, BumpKind::Major] {
        graph.add(Step::new(release_step(kind), GroupAction).after([
            CHECK,
            bump_step(kind),
            BUILD,
        ]))?;
    }

    Ok(graph)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tempfile::tempdir;

    use super::*;
    use crate::checkpoint::Checkpoint;
    use crate::config::{CliOverrides, RolloutConfig};
    use crate::graph::Step as GraphStep;
    use crate::version::Version;

    fn ctx(version: Version) -> WorkflowContext {
        WorkflowContext::new(version, "production", Checkpoint::new("goal", "plan"))
    }

    fn config() -> Config {
        RolloutConfig::default()
            .build_config(Path::new("/project"), CliOverrides::default())
            .expect("config")
    }

    fn ids(steps: &[Arc<GraphStep>]) -> Vec<&str> {
        steps.iter().map(|s| s.id.as_str()).collect()
    }

    #[test]
    fn render_args_substitutes_placeholders() {
        let mut c = ctx(Version::new(1, 2, 3));
        c.artifacts = vec![PathBuf::from("dist/a.whl"), PathBuf::from("dist/a.tar.gz")];
        let args: Vec<String> = ["v{version}", "--env={env}", "{artifacts}", "tail"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        assert_eq!(
            render_args(&args, &c),
            vec![
                "v1.2.3",
                "--env=production",
                "dist/a.whl",
                "dist/a.tar.gz",
                "tail"
            ]
        );
    }

    #[test]
    fn empty_artifacts_expand_to_nothing() {
        let c = ctx(Version::new(0, 1, 0));
        let args = vec!["publish".to_string(), "{artifacts}".to_string()];
        assert_eq!(render_args(&args, &c), vec!["publish"]);
    }

    #[test]
    fn release_plan_runs_check_then_bump_then_build() {
        let graph = standard_graph(&config()).expect("graph");
        let plan = graph.build(RELEASE_PATCH).expect("plan");
        assert_eq!(
            ids(&plan),
            vec![LOCK_CHECK, VCS_CHECK, CHECK, BUMP_PATCH, BUILD, RELEASE_PATCH]
        );
    }

    #[test]
    fn publish_plan_verifies_before_upload() {
        let graph = standard_graph(&config()).expect("graph");
        let plan = graph.build(PUBLISH).expect("plan");
        assert_eq!(
            ids(&plan),
            vec![LOCK_CHECK, BUILD, VERIFY, UPLOAD, HOST_RELEASE, PUBLISH]
        );
        let non_idempotent: Vec<&str> = plan
            .iter()
            .filter(|s| !s.idempotent)
            .map(|s| s.id.as_str())
            .collect();
        assert_eq!(non_idempotent, vec![UPLOAD, HOST_RELEASE]);
    }

    #[test]
    fn bump_describe_projects_next_version() {
        let action = BumpAction {
            kind: BumpKind::Major,
        };
        assert_eq!(
            action.describe(&ctx(Version::new(1, 2, 3))),
            "bump major version 1.2.3 -> 2.0.0"
        );
    }

    #[test]
    fn collect_artifacts_filters_by_version() {
        let td = tempdir().expect("tempdir");
        for name in [
            "demo-1.2.4.tar.gz",
            "demo-1.2.4-py3-none-any.whl",
            "demo-1.2.40.tar.gz",
            "demo-11.2.4.tar.gz",
            "demo-1.2.3.tar.gz",
        ] {
            fs::write(td.path().join(name), "x").expect("write");
        }

        let found = collect_artifacts(td.path(), "1.2.4").expect("collect");
        let names: Vec<String> = found
            .iter()
            .map(|p| p.file_name().expect("name").to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["demo-1.2.4-py3-none-any.whl", "demo-1.2.4.tar.gz"]);
    }

    #[test]
    fn collect_artifacts_missing_dir_is_empty() {
        let td = tempdir().expect("tempdir");
        assert!(
            collect_artifacts(&td.path().join("dist"), "1.0.0")
                .expect("collect")
                .is_empty()
        );
    }
}
