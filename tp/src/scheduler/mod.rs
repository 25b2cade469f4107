//! Scheduling engine - per-stage cycles, the fleet-level hub, and the
//! worker handle contract that ties them together

mod child;
mod handle;
mod hub;
mod plane;
mod project;
mod stage;

pub use child::{serve_stage_worker, ChildStageWorker, ControlRequest, ControlResponse};
pub use handle::{LocalStageWorker, StageQuery, StageWorkerHandle, WorkerFlags};
pub use hub::{HubConfig, SchedulerHub};
pub use plane::{PlanePosition, PlaneStatusMap, StagePlaneStatus};
pub use project::{ManifestTile, ProjectStatusWorker, ACQUISITION_MANIFEST};
pub use stage::{StageScheduler, StageSchedulerOptions};
