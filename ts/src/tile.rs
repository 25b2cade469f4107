//! Tile record types and per-stage status values

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Per-stage completion status of a tile.
///
/// `Processing` is never stored by the scheduler - it is implied by
/// membership in the in-process table. `Canceled` likewise never persists:
/// a canceled remote task reverts the tile to `Incomplete` so it can be
/// queued again. Both values exist so aggregate counts can report them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TileStatus {
    Incomplete,
    Queued,
    Processing,
    Complete,
    Failed,
    Canceled,
}

impl TileStatus {
    /// Value persisted in the status columns
    pub fn as_i64(self) -> i64 {
        match self {
            TileStatus::Incomplete => 0,
            TileStatus::Queued => 1,
            TileStatus::Processing => 2,
            TileStatus::Complete => 3,
            TileStatus::Failed => 4,
            TileStatus::Canceled => 5,
        }
    }

    pub fn from_i64(value: i64) -> Result<Self, StoreError> {
        match value {
            0 => Ok(TileStatus::Incomplete),
            1 => Ok(TileStatus::Queued),
            2 => Ok(TileStatus::Processing),
            3 => Ok(TileStatus::Complete),
            4 => Ok(TileStatus::Failed),
            5 => Ok(TileStatus::Canceled),
            other => Err(StoreError::UnknownStatus(other)),
        }
    }

    /// Terminal statuses never transition to any other value
    pub fn is_terminal(self) -> bool {
        matches!(self, TileStatus::Complete | TileStatus::Failed)
    }
}

/// One row in the `tile_status` table.
///
/// Spatial fields are copied verbatim from the upstream record the first
/// time a relative path is observed and never change afterwards. Only
/// `prev_stage_status` (on upstream change) and `this_stage_status` (by the
/// stage's own state machine) mutate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TileRecord {
    pub relative_path: String,
    pub tile_name: String,
    pub prev_stage_status: TileStatus,
    pub this_stage_status: TileStatus,
    pub x: Option<i64>,
    pub y: Option<i64>,
    pub z: Option<i64>,
    pub lat_x: Option<i64>,
    pub lat_y: Option<i64>,
    pub lat_z: Option<i64>,
    pub cut_offset: Option<f64>,
    pub z_offset: Option<f64>,
    pub delta_z: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One row in the `in_process` table - a tile with an outstanding remote
/// task execution. Created at dispatch, deleted the instant completion is
/// observed, regardless of outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InProcessRecord {
    pub relative_path: String,
    pub tile_name: String,
    pub worker_id: String,
    pub worker_last_seen: DateTime<Utc>,
    pub task_execution_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One row in the `to_process` table - a tile queued but undispatched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToProcessRecord {
    pub relative_path: String,
    pub tile_name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Aggregate tile counts for one stage, grouped by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub incomplete: u64,
    pub queued: u64,
    pub processing: u64,
    pub complete: u64,
    pub failed: u64,
    pub canceled: u64,
}

/// Tile status restricted to one z-plane, as consumed by the hub's
/// cross-stage plane query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaneTileStatus {
    pub relative_path: String,
    pub lat_x: i64,
    pub lat_y: i64,
    pub this_stage_status: TileStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip() {
        for status in [
            TileStatus::Incomplete,
            TileStatus::Queued,
            TileStatus::Processing,
            TileStatus::Complete,
            TileStatus::Failed,
            TileStatus::Canceled,
        ] {
            assert_eq!(TileStatus::from_i64(status.as_i64()).unwrap(), status);
        }
    }

    #[test]
    fn test_unknown_status_rejected() {
        assert!(matches!(TileStatus::from_i64(42), Err(StoreError::UnknownStatus(42))));
    }

    #[test]
    fn test_terminality() {
        assert!(TileStatus::Complete.is_terminal());
        assert!(TileStatus::Failed.is_terminal());
        assert!(!TileStatus::Incomplete.is_terminal());
        assert!(!TileStatus::Queued.is_terminal());
    }
}
