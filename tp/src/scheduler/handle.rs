//! Worker handles
//!
//! A stage worker runs its scheduling loop on its own task (or in its own
//! process). The hub controls it through a [`StageWorkerHandle`]: shared
//! atomic flags for exit/processing, and a query channel the worker drains
//! between cycles.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use tilestore::{PlaneTileStatus, StatusCounts};

/// Control flags shared between a worker loop and its handle.
///
/// The loop reads both flags at the top of each cycle, so a flag set
/// mid-cycle takes effect at the next cycle boundary.
#[derive(Default)]
pub struct WorkerFlags {
    exit_requested: AtomicBool,
    processing_requested: AtomicBool,
}

impl WorkerFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_exit(&self) {
        self.exit_requested.store(true, Ordering::SeqCst);
    }

    pub fn exit_requested(&self) -> bool {
        self.exit_requested.load(Ordering::SeqCst)
    }

    pub fn set_processing_requested(&self, on: bool) {
        self.processing_requested.store(on, Ordering::SeqCst);
    }

    pub fn processing_requested(&self) -> bool {
        self.processing_requested.load(Ordering::SeqCst)
    }
}

/// Read-only queries served by a worker loop between cycles.
pub enum StageQuery {
    PlaneStatus {
        plane: i64,
        reply: oneshot::Sender<Vec<PlaneTileStatus>>,
    },
    StatusCounts {
        reply: oneshot::Sender<StatusCounts>,
    },
}

/// Control surface the hub holds for one running stage worker, regardless
/// of whether the worker runs in-process or as a child process.
#[async_trait]
pub trait StageWorkerHandle: Send + Sync {
    /// Ask the worker loop to stop after its current cycle.
    async fn request_exit(&self);

    /// Push the stage's desired processing state. Off means the worker
    /// keeps syncing and reconciling but dispatches nothing new.
    async fn set_processing_requested(&self, on: bool);

    /// Last processing state pushed through this handle.
    fn processing_requested(&self) -> bool;

    /// Tile statuses for one z-plane. Degrades to empty when the worker
    /// is gone or cannot answer.
    async fn plane_status(&self, plane: i64) -> Vec<PlaneTileStatus>;

    /// Per-status tile counts. Degrades to all-zero when the worker is
    /// gone or cannot answer.
    async fn status_counts(&self) -> StatusCounts;
}

/// Handle for a worker running as a tokio task in this process.
pub struct LocalStageWorker {
    pub(crate) flags: Arc<WorkerFlags>,
    query_tx: mpsc::Sender<StageQuery>,
}

impl LocalStageWorker {
    pub fn new(flags: Arc<WorkerFlags>, query_tx: mpsc::Sender<StageQuery>) -> Self {
        Self { flags, query_tx }
    }
}

#[async_trait]
impl StageWorkerHandle for LocalStageWorker {
    async fn request_exit(&self) {
        self.flags.request_exit();
    }

    async fn set_processing_requested(&self, on: bool) {
        self.flags.set_processing_requested(on);
    }

    fn processing_requested(&self) -> bool {
        self.flags.processing_requested()
    }

    async fn plane_status(&self, plane: i64) -> Vec<PlaneTileStatus> {
        let (reply, rx) = oneshot::channel();
        if self.query_tx.send(StageQuery::PlaneStatus { plane, reply }).await.is_err() {
            debug!("worker loop gone, returning empty plane status");
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    async fn status_counts(&self) -> StatusCounts {
        let (reply, rx) = oneshot::channel();
        if self.query_tx.send(StageQuery::StatusCounts { reply }).await.is_err() {
            debug!("worker loop gone, returning zero counts");
            return StatusCounts::default();
        }
        rx.await.unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_default_off() {
        let flags = WorkerFlags::new();
        assert!(!flags.exit_requested());
        assert!(!flags.processing_requested());
    }

    #[test]
    fn test_flags_toggle() {
        let flags = WorkerFlags::new();

        flags.set_processing_requested(true);
        assert!(flags.processing_requested());
        flags.set_processing_requested(false);
        assert!(!flags.processing_requested());

        flags.request_exit();
        assert!(flags.exit_requested());
    }

    #[tokio::test]
    async fn test_queries_degrade_when_loop_gone() {
        let flags = Arc::new(WorkerFlags::new());
        let (tx, rx) = mpsc::channel(4);
        drop(rx);

        let handle = LocalStageWorker::new(flags, tx);
        assert!(handle.plane_status(0).await.is_empty());
        assert_eq!(handle.status_counts().await, StatusCounts::default());
    }
}
