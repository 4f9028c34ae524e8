//! Step declarations and deterministic plan building.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};

use crate::error::{Result, RolloutError};
use crate::process::CommandRunner;
use crate::types::{StepResult, WorkflowContext};
use crate::version::VersionStore;

/// Capabilities handed to a step action.
pub struct ActionEnv<'a> {
    pub runner: &'a dyn CommandRunner,
    pub versions: &'a VersionStore,
    /// Timeout for commands that do not configure their own.
    pub default_timeout: Duration,
}

/// The work a step performs.
pub trait StepAction: Send + Sync {
    fn run(&self, ctx: &mut WorkflowContext, env: &ActionEnv<'_>) -> Result<StepResult>;

    /// Rebuild context this step would have produced, when a resumed run
    /// skips it because an earlier run already succeeded.
    fn restore(&self, _ctx: &mut WorkflowContext) -> Result<()> {
        Ok(())
    }

    /// One-line description of what `run` would do, for dry runs.
    fn describe(&self, ctx: &WorkflowContext) -> String;

    /// Apply the context changes `run` would make, without side effects.
    fn project(&self, _ctx: &mut WorkflowContext) {}
}

/// A unit of release work with declared prerequisites.
pub struct Step {
    pub id: String,
    pub prerequisites: Vec<String>,
    pub idempotent: bool,
    pub action: Box<dyn StepAction>,
}

impl Step {
    pub fn new(id: impl Into<String>, action: impl StepAction + 'static) -> Self {
        Self {
            id: id.into(),
            prerequisites: Vec::new(),
            idempotent: true,
            action: Box::new(action),
        }
    }

    pub fn after<I, S>(mut self, prerequisites: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.prerequisites
            .extend(prerequisites.into_iter().map(Into::into));
        self
    }

    /// Mark the step as unsafe to repeat (publishing, tagging, bumping).
    pub fn non_idempotent(mut self) -> Self {
        self.idempotent = false;
        self
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("id", &self.id)
            .field("prerequisites", &self.prerequisites)
            .field("idempotent", &self.idempotent)
            .finish_non_exhaustive()
    }
}

/// Steps keyed by id, remembering declaration order.
#[derive(Debug, Default)]
pub struct StepGraph {
    steps: Vec<Arc<Step>>,
    index: BTreeMap<String, usize>,
}

impl StepGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, step: Step) -> Result<()> {
        if self.index.contains_key(&step.id) {
            return Err(RolloutError::config(format!(
                "step `{}` is declared twice",
                step.id
            )));
        }
        self.index.insert(step.id.clone(), self.steps.len());
        self.steps.push(Arc::new(step));
        Ok(())
    }

    pub fn with(mut self, step: Step) -> Result<Self> {
        self.add(step)?;
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Every step needed to reach `goal`, prerequisites first.
    ///
    /// Independent steps keep their declaration order, so the same graph
    /// always yields the same plan.
    pub fn build(&self, goal: &str) -> Result<Vec<Arc<Step>>> {
        let goal_idx = *self.index.get(goal).ok_or_else(|| RolloutError::UnknownStep {
            step: goal.to_string(),
            referenced_by: None,
        })?;

        // Collect the goal's transitive prerequisites.
        let mut included: BTreeSet<usize> = BTreeSet::new();
        let mut queue: VecDeque<usize> = VecDeque::from([goal_idx]);
        included.insert(goal_idx);
        while let Some(idx) = queue.pop_front() {
            let step = &self.steps[idx];
            for pre in &step.prerequisites {
                let pre_idx = *self.index.get(pre).ok_or_else(|| RolloutError::UnknownStep {
                    step: pre.clone(),
                    referenced_by: Some(step.id.clone()),
                })?;
                if included.insert(pre_idx) {
                    queue.push_back(pre_idx);
                }
            }
        }

        let mut indegree: BTreeMap<usize, usize> = BTreeMap::new();
        let mut dependents_of: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for &idx in &included {
            let mut deps: BTreeSet<usize> = BTreeSet::new();
            for pre in &self.steps[idx].prerequisites {
                deps.insert(self.index[pre]);
            }
            indegree.insert(idx, deps.len());
            for dep in deps {
                dependents_of.entry(dep).or_default().push(idx);
            }
        }

        // Ready set ordered by declaration index.
        let mut ready: BTreeSet<usize> = indegree
            .iter()
            .filter(|&(_, &deg)| deg == 0)
            .map(|(&idx, _)| idx)
            .collect();
        let mut out: Vec<Arc<Step>> = Vec::with_capacity(included.len());

        while let Some(idx) = ready.pop_first() {
            out.push(Arc::clone(&self.steps[idx]));
            for &dependent in dependents_of.get(&idx).map(Vec::as_slice).unwrap_or_default() {
                if let Some(d) = indegree.get_mut(&dependent) {
                    *d -= 1;
                    if *d == 0 {
                        ready.insert(dependent);
                    }
                }
            }
        }

        if out.len() != included.len() {
            let blocked: BTreeSet<usize> = indegree
                .iter()
                .filter(|&(_, &deg)| deg > 0)
                .map(|(&idx, _)| idx)
                .collect();
            return Err(RolloutError::CycleDetected {
                steps: self.find_cycle(&blocked),
            });
        }

        Ok(out)
    }

    /// Walk prerequisites inside `blocked` until a step repeats.
    fn find_cycle(&self, blocked: &BTreeSet<usize>) -> Vec<String> {
        let Some(&start) = blocked.first() else {
            return Vec::new();
        };
        let mut path: Vec<usize> = vec![start];
        let mut current = start;
        loop {
            let next = self.steps[current]
                .prerequisites
                .iter()
                .map(|p| self.index[p])
                .find(|i| blocked.contains(i));
            let Some(next) = next else {
                break;
            };
            if let Some(pos) = path.iter().position(|&i| i == next) {
                let mut cycle: Vec<String> = path[pos..]
                    .iter()
                    .map(|&i| self.steps[i].id.clone())
                    .collect();
                cycle.push(self.steps[next].id.clone());
                return cycle;
            }
            path.push(next);
            current = next;
        }
        path.iter().map(|&i| self.steps[i].id.clone()).collect()
    }
}

/// Fingerprint of a plan: the goal plus the ordered step ids.
pub fn plan_id(goal: &str, steps: &[Arc<Step>]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(goal.as_bytes());
    hasher.update(b"\n");
    for step in steps {
        hasher.update(step.id.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}
