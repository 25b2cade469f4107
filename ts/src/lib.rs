//! TileStore - per-stage durable tile state over SQLite
//!
//! Each pipeline stage owns one physical store located under its output
//! path, so no two stages ever contend on the same database file. A store
//! holds three logical tables:
//!
//! - `tile_status` - one row per tile ever observed upstream, tracking the
//!   previous stage's status and this stage's status
//! - `in_process` - one row per tile with an outstanding remote task
//! - `to_process` - one row per tile queued but not yet dispatched
//!
//! All operations are synchronous with respect to the calling scheduling
//! cycle; callers guarantee no two cycles touch the same store concurrently.

pub mod error;
pub mod store;
pub mod tile;

pub use error::StoreError;
pub use store::{StageStore, database_name_for_stage};
pub use tile::{InProcessRecord, PlaneTileStatus, StatusCounts, TileRecord, TileStatus, ToProcessRecord};

/// Stage id sentinel for a project's raw-input (acquisition) store.
pub const RAW_INPUT_STAGE_ID: &str = "acquisition";

/// Default chunk size for batched inserts and updates.
pub const DEFAULT_BATCH_SIZE: usize = 50;
