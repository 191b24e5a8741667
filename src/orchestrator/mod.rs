//! Simulation lifecycle orchestration.
//!
//! This module owns submission (validation, scheduling of both lanes onto the
//! worker pool), cancellation and cleanup, plus the per-simulation writer task
//! that is the only place lane events are applied to the registry. CLI layers
//! call into this module and only ever see snapshots.

mod controller;
mod writer;

pub(crate) use controller::{Orchestrator, OrchestratorError};
