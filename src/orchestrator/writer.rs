//! Single writer per simulation.
//!
//! Both lanes of a simulation send their events into one channel; this task
//! drains it and applies each event under the record's lock, so a record only
//! ever changes through one sequential stream of events.

use super::controller::InFlightMap;
use crate::aggregate;
use crate::model::{LaneEvent, SimulationId};
use crate::registry::Registry;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;

/// Apply lane events until every sender is gone, then forget the simulation's
/// cancellation token.
pub(super) async fn run_status_writer(
    registry: Arc<Registry>,
    inflight: InFlightMap,
    id: SimulationId,
    mut event_rx: UnboundedReceiver<LaneEvent>,
) {
    while let Some(event) = event_rx.recv().await {
        let lane = event.lane();
        let terminal = event.is_terminal();
        let applied = registry.update(&id, |status| {
            let changed = aggregate::apply_event(status, event);
            (changed, status.overall_status)
        });
        match applied {
            None => {
                tracing::debug!(simulation_id = %id, %lane, "record gone, dropping lane event");
            }
            Some((false, _)) if terminal => {
                tracing::debug!(simulation_id = %id, %lane, "lane already finished, ignoring terminal update");
            }
            Some((true, overall)) if terminal => {
                tracing::info!(simulation_id = %id, %lane, %overall, "lane finished");
            }
            Some(_) => {}
        }
    }

    inflight.lock().remove(&id);
    if let Some(status) = registry.get(&id) {
        tracing::info!(
            simulation_id = %id,
            overall = %status.overall_status,
            "simulation settled"
        );
    }
}
