//! # rollout-core
//!
//! Resumable release workflows driven through external command-line tools.
//!
//! A release is a graph of steps (lock check, clean-tree check, version bump,
//! build, verify, upload, hosted release). `rollout-core` turns a goal into a
//! deterministic plan, runs it one step at a time, and records every step in
//! an append-only checkpoint so an interrupted or failed run can continue
//! where it stopped without repeating publishing side effects.
//!
//! ## Pipeline
//!
//! 1. [`config::RolloutConfig`] loads `.rollout.toml` and merges CLI
//!    overrides into an immutable [`config::Config`].
//! 2. [`steps::standard_graph`] declares the built-in steps and
//!    [`graph::StepGraph::build`] orders the ones a goal needs.
//! 3. [`orchestrator::ReleaseOrchestrator`] takes the lock, picks up a
//!    matching checkpoint, and hands the plan to [`engine::WorkflowEngine`].
//! 4. On completion the engine writes a receipt and clears the checkpoint.
//!
//! ## Modules
//!
//! - [`version`]: `VERSION` file and bump rules
//! - [`process`]: subprocess execution with timeouts and cancellation
//! - [`graph`]: step declarations and plan building
//! - [`steps`]: built-in release steps
//! - [`checkpoint`]: append-only JSONL run log
//! - [`engine`]: sequential, resumable execution
//! - [`orchestrator`]: named workflows, locking, dry runs, status

/// Checkpoint file format and append-only log.
pub mod checkpoint;

/// Configuration file (`.rollout.toml`) loading and merging.
pub mod config;

/// Sequential, resumable step execution.
pub mod engine;

/// Error kinds and CLI exit codes.
pub mod error;

/// Step declarations, dependency ordering, and plan fingerprints.
pub mod graph;

/// Exclusive lock guarding the version file and checkpoint.
pub mod lock;

/// Named workflows and the operations the CLI exposes.
pub mod orchestrator;

/// Subprocess runner with timeout, grace period, and cancellation.
pub mod process;

/// Receipt persistence and atomic file writes.
pub mod state;

/// Built-in release steps and the default graph.
pub mod steps;

/// Domain types: step results, run outcomes, receipts.
pub mod types;

/// Version parsing, bumping, and the version file.
pub mod version;

pub use error::{Result, RolloutError};


#[cfg(test)]
mod testing;
