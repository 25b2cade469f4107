//! Catalog boundary - projects, stages, task definitions and fleet workers
//!
//! The relational catalog itself (ORM models, migrations, mutation API) is
//! an external collaborator. The scheduler consumes it only through the
//! [`Catalog`] trait: get/list reads, processing-flag updates, worker
//! availability updates, and per-stage performance reporting.

mod memory;
mod models;

use async_trait::async_trait;
use thiserror::Error;

pub use memory::{CatalogSeed, MemoryCatalog, StageSeed};
pub use models::{
    FleetWorker, PerformanceSample, PipelineStage, Project, RegionBounds, TaskDefinition, WorkerAvailability,
};

/// Errors surfaced by a catalog implementation
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Catalog unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid reference: {0}")]
    InvalidReference(String),
}

/// Read/update access to the pipeline catalog.
///
/// Implementations must be cheap to share (`Arc<dyn Catalog>`); every
/// scheduling cycle re-reads what it needs rather than caching.
#[async_trait]
pub trait Catalog: Send + Sync {
    async fn list_projects(&self) -> Result<Vec<Project>, CatalogError>;

    async fn project(&self, id: &str) -> Result<Option<Project>, CatalogError>;

    async fn list_stages(&self) -> Result<Vec<PipelineStage>, CatalogError>;

    async fn stages_for_project(&self, project_id: &str) -> Result<Vec<PipelineStage>, CatalogError>;

    async fn stage(&self, id: &str) -> Result<Option<PipelineStage>, CatalogError>;

    async fn task_definition(&self, id: &str) -> Result<Option<TaskDefinition>, CatalogError>;

    async fn list_workers(&self) -> Result<Vec<FleetWorker>, CatalogError>;

    async fn worker(&self, id: &str) -> Result<Option<FleetWorker>, CatalogError>;

    async fn set_project_processing(&self, id: &str, is_processing: bool) -> Result<(), CatalogError>;

    async fn set_stage_processing(&self, id: &str, is_processing: bool) -> Result<(), CatalogError>;

    async fn set_worker_availability(&self, id: &str, availability: WorkerAvailability) -> Result<(), CatalogError>;

    /// Per-cycle observability: current in-process and to-process counts.
    async fn update_stage_counts(&self, stage_id: &str, in_process: usize, to_process: usize)
    -> Result<(), CatalogError>;

    /// Per-completion performance sample for duration/throughput statistics.
    async fn record_completion(&self, stage_id: &str, sample: PerformanceSample) -> Result<(), CatalogError>;
}
