//! Test doubles shared by the unit tests.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use crate::engine::Reporter;
use crate::process::CommandRunner;
use crate::types::{FailureReason, StepResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Call {
    pub program: String,
    pub args: Vec<String>,
}

/// Runner that records invocations and answers with scripted results.
#[derive(Debug, Default)]
pub(crate) struct RecordingRunner {
    calls: Mutex<Vec<Call>>,
    failures: BTreeMap<String, (i32, String)>,
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every run of `program` exit with `code`, printing `stderr`.
    pub fn fail(mut self, program: &str, code: i32, stderr: &str) -> Self {
        self.failures
            .insert(program.to_string(), (code, stderr.to_string()));
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().expect("calls lock").clone()
    }

    pub fn programs(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.program).collect()
    }

    pub fn calls_to(&self, program: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.program == program)
            .count()
    }
}

impl CommandRunner for RecordingRunner {
    fn run(&self, program: &str, args: &[String], _timeout: Duration) -> StepResult {
        self.calls.lock().expect("calls lock").push(Call {
            program: program.to_string(),
            args: args.to_vec(),
        });
        match self.failures.get(program) {
            Some((code, stderr)) => StepResult {
                stderr: stderr.clone(),
                exit_code: Some(*code),
                ..StepResult::failure(FailureReason::NonZeroExit { code: *code })
            },
            None => StepResult {
                exit_code: Some(0),
                ..StepResult::success()
            },
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct CollectingReporter {
    pub infos: Vec<String>,
    pub warns: Vec<String>,
    pub errors: Vec<String>,
}

impl Reporter for CollectingReporter {
    fn info(&mut self, msg: &str) {
        self.infos.push(msg.to_string());
    }

    fn warn(&mut self, msg: &str) {
        self.warns.push(msg.to_string());
    }

    fn error(&mut self, msg: &str) {
        self.errors.push(msg.to_string());
    }
}
