//! Catalog data model

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Operator-declared spatial bounds for a project's sample region. When
/// set, these override observed tile bounds in plane status responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionBounds {
    pub x_min: i64,
    pub x_max: i64,
    pub y_min: i64,
    pub y_max: i64,
}

/// A processing project. Created and edited externally; read-only to the
/// scheduler apart from its processing flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    /// Root path of the raw acquisition data (and the raw-input store)
    pub root_path: PathBuf,
    pub is_processing: bool,
    #[serde(default)]
    pub sample_bounds: Option<RegionBounds>,
}

/// One step of a project's pipeline chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineStage {
    pub id: String,
    pub name: String,
    pub project_id: String,
    /// None means this stage consumes the project's raw input
    #[serde(default)]
    pub previous_stage_id: Option<String>,
    pub task_id: String,
    /// Output path; also hosts this stage's tile state store
    pub dst_path: PathBuf,
    /// 1 + previous stage's depth, computed at creation. Denormalized for
    /// display; not used by scheduling control flow.
    pub depth: u32,
    pub is_processing: bool,
}

/// Immutable description of the script a stage runs per tile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub id: String,
    pub name: String,
    pub script: String,
    /// Fixed capacity cost of one execution, in work units
    pub work_units: u32,
    /// Handlebars templates rendered into concrete arguments at dispatch
    #[serde(default)]
    pub args_template: Vec<String>,
}

/// Availability of a fleet worker for new dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerAvailability {
    Available,
    Unavailable,
}

/// A remote compute worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FleetWorker {
    pub id: String,
    pub name: String,
    /// host:port of the worker's task execution endpoint
    pub address: String,
    pub work_unit_capacity: u32,
    pub availability: WorkerAvailability,
    /// Operators can exclude a worker from scheduling without deleting it
    #[serde(default = "default_true")]
    pub in_scheduler_pool: bool,
}

fn default_true() -> bool {
    true
}

impl FleetWorker {
    pub fn is_dispatchable(&self) -> bool {
        self.in_scheduler_pool && self.availability == WorkerAvailability::Available
    }
}

/// One completed remote execution, reported to the per-stage performance
/// statistics collector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSample {
    pub task_execution_id: String,
    pub worker_id: String,
    pub outcome: String,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    pub work_units: u32,
}
