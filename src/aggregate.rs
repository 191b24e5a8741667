//! Lifecycle state machine for a simulation record.
//!
//! Every function here mutates a `SimulationStatus` in place and reports whether
//! anything changed. Callers are expected to hold the record's lock (see
//! `registry::Registry::update`), so these stay plain, synchronous functions.

use crate::model::{Lane, LaneEvent, LaneResult, OverallStatus, PreflightKind, SimulationStatus};

const INVISIBLE_SOLUTION_MESSAGE: &str =
    "Infeasible Solution - One or both algorithms returned zero or negative profit";

/// Apply any lane event to the record.
pub fn apply_event(status: &mut SimulationStatus, event: LaneEvent) -> bool {
    match event {
        LaneEvent::Progress {
            lane,
            percent,
            eta_seconds,
        } => apply_progress(status, lane, percent, eta_seconds),
        LaneEvent::Result { lane, result } => apply_result(status, lane, *result),
        LaneEvent::Error { lane, message } => apply_error(status, lane, &message),
    }
}

pub fn apply_progress(status: &mut SimulationStatus, lane: Lane, percent: f64, eta: f64) -> bool {
    if status.is_terminal() || status.lane(lane).finished {
        return false;
    }
    let slot = status.lane_mut(lane);
    slot.progress_percent = clamp_percent(percent);
    slot.eta_seconds = if eta.is_finite() { eta.max(0.0) } else { 0.0 };
    if status.overall_status == OverallStatus::Pending {
        status.overall_status = OverallStatus::Running;
    }
    true
}

pub fn apply_result(status: &mut SimulationStatus, lane: Lane, result: LaneResult) -> bool {
    if status.lane(lane).finished {
        return false;
    }
    status.lane_results.set_lane(lane, result);
    finish_lane(status, lane);
    settle(status);
    true
}

pub fn apply_error(status: &mut SimulationStatus, lane: Lane, message: &str) -> bool {
    if status.lane(lane).finished {
        return false;
    }
    append_error(status, &format!("{lane} Error: {message}"));
    status.lane_mut(lane).has_error = true;
    // An errored lane still contributes an (empty) sub-result.
    status.lane_results.set_lane(lane, LaneResult::default());
    finish_lane(status, lane);
    settle(status);
    true
}

/// Record a pre-flight failure. Only legal before either lane has started.
pub fn apply_preflight_error(
    status: &mut SimulationStatus,
    kind: PreflightKind,
    message: &str,
) -> bool {
    if status.overall_status != OverallStatus::Pending || status.ga.finished || status.aco.finished
    {
        return false;
    }
    status.overall_status = kind.status();
    append_error(status, message);
    for lane in Lane::ALL {
        status.lane_mut(lane).finished = true;
    }
    true
}

/// Record a failure that happened after creation but before the lanes were scheduled.
pub fn apply_setup_error(status: &mut SimulationStatus, message: &str) -> bool {
    if status.is_terminal() {
        return false;
    }
    append_error(status, &format!("Setup Error: {message}"));
    for lane in Lane::ALL {
        let slot = status.lane_mut(lane);
        slot.has_error = true;
        slot.finished = true;
        slot.progress_percent = 100.0;
        slot.eta_seconds = 0.0;
    }
    status.overall_status = OverallStatus::Error;
    true
}

fn finish_lane(status: &mut SimulationStatus, lane: Lane) {
    let slot = status.lane_mut(lane);
    slot.finished = true;
    slot.progress_percent = 100.0;
    slot.eta_seconds = 0.0;
}

/// Compute the terminal state once both lanes are done. Terminal is sticky.
fn settle(status: &mut SimulationStatus) {
    if status.is_terminal() || !status.both_finished() {
        return;
    }
    status.result = Some(status.lane_results.clone());
    if status.ga.has_error || status.aco.has_error {
        status.overall_status = OverallStatus::Error;
        return;
    }
    let unprofitable = status
        .result
        .as_ref()
        .map(|combined| {
            Lane::ALL
                .iter()
                .filter_map(|lane| combined.lane(*lane))
                .any(|r| r.total_profit <= 0.0)
        })
        .unwrap_or(false);
    if unprofitable {
        status.overall_status = OverallStatus::InvisibleSolution;
        append_error(status, INVISIBLE_SOLUTION_MESSAGE);
    } else {
        status.overall_status = OverallStatus::Completed;
    }
}

fn append_error(status: &mut SimulationStatus, message: &str) {
    match status.error_message.as_mut() {
        Some(existing) => {
            existing.push('\n');
            existing.push_str(message);
        }
        None => status.error_message = Some(message.to_string()),
    }
}

fn clamp_percent(percent: f64) -> f64 {
    if percent.is_finite() {
        percent.clamp(0.0, 100.0)
    } else {
        0.0
    }
}
