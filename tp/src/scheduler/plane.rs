//! Cross-stage plane status aggregation
//!
//! The hub asks every stage worker of a project for the tile statuses on
//! one z-plane, then merges the answers into a single grid keyed by
//! lattice position. A UI row for one tile position shows that tile's
//! status at every stage depth.

use std::collections::BTreeMap;

use serde::Serialize;

use tilestore::{PlaneTileStatus, TileStatus};

use crate::catalog::RegionBounds;

/// One stage's status for a tile position.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StagePlaneStatus {
    pub stage_id: String,
    pub depth: u32,
    pub status: TileStatus,
}

/// One lattice position on the plane, with statuses from every stage that
/// knows about it, ordered by pipeline depth.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanePosition {
    pub x_index: i64,
    pub y_index: i64,
    pub stages: Vec<StagePlaneStatus>,
}

/// Merged plane view across all stages of one project.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PlaneStatusMap {
    pub max_depth: u32,
    pub x_min: i64,
    pub x_max: i64,
    pub y_min: i64,
    pub y_max: i64,
    pub tiles: Vec<PlanePosition>,
}

impl PlaneStatusMap {
    /// The answer for an unknown project, a missing plane argument, or a
    /// project with no responding stage workers. Never an error.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Merge per-stage plane responses keyed by lattice position. Bounds
    /// come from the observed positions unless the project declares fixed
    /// sample bounds.
    pub fn merge(
        max_depth: u32,
        sample_bounds: Option<RegionBounds>,
        entries: Vec<(String, u32, Vec<PlaneTileStatus>)>,
    ) -> Self {
        let mut positions: BTreeMap<(i64, i64), PlanePosition> = BTreeMap::new();

        for (stage_id, depth, tiles) in entries {
            for tile in tiles {
                positions
                    .entry((tile.lat_x, tile.lat_y))
                    .or_insert_with(|| PlanePosition {
                        x_index: tile.lat_x,
                        y_index: tile.lat_y,
                        stages: Vec::new(),
                    })
                    .stages
                    .push(StagePlaneStatus {
                        stage_id: stage_id.clone(),
                        depth,
                        status: tile.this_stage_status,
                    });
            }
        }

        if positions.is_empty() {
            return Self::empty();
        }

        let (x_min, x_max, y_min, y_max) = match sample_bounds {
            Some(bounds) => (bounds.x_min, bounds.x_max, bounds.y_min, bounds.y_max),
            None => {
                let xs = positions.keys().map(|(x, _)| *x);
                let ys = positions.keys().map(|(_, y)| *y);
                (
                    xs.clone().min().unwrap_or(0),
                    xs.max().unwrap_or(0),
                    ys.clone().min().unwrap_or(0),
                    ys.max().unwrap_or(0),
                )
            }
        };

        let tiles = positions
            .into_values()
            .map(|mut position| {
                position.stages.sort_by_key(|s| s.depth);
                position
            })
            .collect();

        Self {
            max_depth,
            x_min,
            x_max,
            y_min,
            y_max,
            tiles,
        }
    }
}
