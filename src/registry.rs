//! In-memory store of simulation records.
//!
//! The map is behind a `RwLock`, and every record sits behind its own `Mutex`, so
//! all mutations of one simulation are serialized while distinct simulations never
//! contend. Readers only ever receive clones.

use crate::model::{SimulationId, SimulationStatus};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("registry is full ({capacity} simulations in flight)")]
    Full { capacity: usize },
}

struct Entry {
    status: SimulationStatus,
    terminal_since: Option<Instant>,
}

pub struct Registry {
    records: RwLock<HashMap<SimulationId, Arc<Mutex<Entry>>>>,
    capacity: usize,
    retention: Duration,
}

impl Registry {
    pub fn new(capacity: usize, retention: Duration) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
            retention,
        }
    }

    /// Insert a fresh `PENDING` record and return its id.
    ///
    /// Expired terminal records are evicted first; if the registry is still at
    /// capacity the record that has been terminal the longest makes room. Records that are still
    /// running are never evicted.
    pub fn create(&self) -> Result<SimulationId, RegistryError> {
        let mut records = self.records.write();
        let now = Instant::now();
        records.retain(|_, entry| {
            entry
                .lock()
                .terminal_since
                .map_or(true, |since| now.duration_since(since) < self.retention)
        });

        if records.len() >= self.capacity {
            let oldest_terminal = records
                .iter()
                .filter_map(|(id, entry)| {
                    let since = entry.lock().terminal_since;
                    since.map(|since| (id.clone(), since))
                })
                .min_by_key(|(_, since)| *since)
                .map(|(id, _)| id);
            match oldest_terminal {
                Some(id) => {
                    tracing::debug!(simulation_id = %id, "evicting terminal simulation to make room");
                    records.remove(&id);
                }
                None => {
                    return Err(RegistryError::Full {
                        capacity: self.capacity,
                    })
                }
            }
        }

        let id = SimulationId::generate();
        records.insert(
            id.clone(),
            Arc::new(Mutex::new(Entry {
                status: SimulationStatus::new(id.clone()),
                terminal_since: None,
            })),
        );
        Ok(id)
    }

    /// Snapshot of a record.
    pub fn get(&self, id: &SimulationId) -> Option<SimulationStatus> {
        let entry = self.records.read().get(id).cloned()?;
        let snapshot = entry.lock().status.clone();
        Some(snapshot)
    }

    /// Run `f` against the record while holding its lock.
    ///
    /// Returns `None` when the id is unknown (for instance, already cleaned up).
    pub fn update<R>(
        &self,
        id: &SimulationId,
        f: impl FnOnce(&mut SimulationStatus) -> R,
    ) -> Option<R> {
        let entry = self.records.read().get(id).cloned()?;
        let mut entry = entry.lock();
        let was_terminal = entry.status.is_terminal();
        let out = f(&mut entry.status);
        if !was_terminal && entry.status.is_terminal() {
            entry.terminal_since = Some(Instant::now());
        }
        Some(out)
    }

    pub fn remove(&self, id: &SimulationId) -> bool {
        self.records.write().remove(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }
}
