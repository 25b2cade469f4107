//! TilePipe - fleet scheduler for multi-stage tile processing pipelines
//!
//! TilePipe drives image tiles through a chain of processing stages across a
//! fleet of remote compute workers with bounded capacity. Each stage tracks
//! per-tile completion state in its own durable store (see the `tilestore`
//! crate), dispatches not-yet-processed tiles to workers with free capacity,
//! and polls those workers for completion.
//!
//! # Core Concepts
//!
//! - **Sequential cycles**: each stage scheduler re-enters a fixed
//!   sync → reconcile → refill → dispatch → report cycle; cycle N+1 only
//!   starts after cycle N finishes, so queue state needs no locking
//! - **Idempotent reconciliation**: dispatch is at-least-once; completion
//!   observations are applied exactly once through the in-process table
//! - **Capacity first-fit**: placement reserves work units in a shared
//!   registry before the remote start call, so concurrent stages never
//!   double-book a worker
//!
//! # Modules
//!
//! - [`catalog`] - projects, stages, tasks and workers behind a trait
//! - [`fleet`] - worker capacity registry and remote worker RPC client
//! - [`scheduler`] - stage scheduler cycle, hub reconciliation, handles
//! - [`config`] - configuration types and loading
//! - [`cli`] - command-line interface

pub mod catalog;
pub mod cli;
pub mod config;
pub mod daemon;
pub mod fleet;
pub mod scheduler;

pub use catalog::{
    Catalog, CatalogError, CatalogSeed, FleetWorker, MemoryCatalog, PerformanceSample, PipelineStage, Project,
    RegionBounds, TaskDefinition, WorkerAvailability,
};
pub use config::{Config, FleetConfig, SchedulingConfig, StorageConfig};
pub use fleet::{
    CompletionStatus, ExecutionReport, ExecutionStatus, FleetClient, HttpWorkerClient, TaskExecution, WorkerClient,
    WorkerClientError, WorkerRegistry,
};
pub use scheduler::{
    ChildStageWorker, ControlRequest, ControlResponse, LocalStageWorker, PlanePosition, PlaneStatusMap,
    ProjectStatusWorker, SchedulerHub, HubConfig, StagePlaneStatus, StageScheduler, StageSchedulerOptions,
    StageWorkerHandle, WorkerFlags,
};
