//! Worker capacity registry
//!
//! Process-wide, in-memory committed-load tracking per fleet worker. Shared
//! by every stage scheduler, since one worker can be targeted by multiple
//! stages; all mutation happens under a single mutex so reservations are
//! atomic with respect to interleaved dispatch passes. Not persisted -
//! stage schedulers rebuild reservations from their in-process tables at
//! startup.

use std::collections::HashMap;

use tokio::sync::Mutex;
use tracing::debug;

/// Committed work units per worker id. A worker absent from the map has
/// never been observed; its load is unknown and dispatch must skip it.
#[derive(Default)]
pub struct WorkerRegistry {
    loads: Mutex<HashMap<String, u32>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin tracking a worker, initializing its committed load to zero if
    /// it was previously unknown.
    pub async fn observe(&self, worker_id: &str) {
        self.loads.lock().await.entry(worker_id.to_string()).or_insert(0);
    }

    /// Current committed load, or None for a never-observed worker.
    pub async fn load(&self, worker_id: &str) -> Option<u32> {
        self.loads.lock().await.get(worker_id).copied()
    }

    /// Reserve `units` against `capacity` if the worker is known and has
    /// room. The check and the reservation happen under one lock.
    pub async fn try_reserve(&self, worker_id: &str, units: u32, capacity: u32) -> bool {
        let mut loads = self.loads.lock().await;
        let Some(load) = loads.get_mut(worker_id) else {
            return false;
        };

        if *load + units > capacity {
            return false;
        }

        *load += units;
        debug!(worker_id, units, load = *load, capacity, "reserved capacity");
        true
    }

    /// Re-apply a reservation recorded before a restart. The work is
    /// already running on the worker, so no capacity check applies.
    pub async fn restore(&self, worker_id: &str, units: u32) {
        let mut loads = self.loads.lock().await;
        let load = loads.entry(worker_id.to_string()).or_insert(0);
        *load += units;
        debug!(worker_id, units, load = *load, "restored committed load");
    }

    /// Release `units` previously reserved, saturating at zero.
    pub async fn release(&self, worker_id: &str, units: u32) {
        let mut loads = self.loads.lock().await;
        if let Some(load) = loads.get_mut(worker_id) {
            *load = load.saturating_sub(units);
            debug!(worker_id, units, load = *load, "released capacity");
        }
    }
}
