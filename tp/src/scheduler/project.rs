//! Project status worker
//!
//! Per-project aggregator that feeds the pipeline's raw input. It ingests
//! the acquisition manifest at the project root into the raw-input tile
//! store, which the first pipeline stage then consumes as its upstream.
//! Runs on the same worker-loop shape as a stage scheduler: cycle, then
//! serve queries until the next deadline.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use eyre::Result;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use tilestore::{StageStore, StatusCounts, TileRecord, TileStatus, RAW_INPUT_STAGE_ID};

use crate::catalog::Project;
use crate::scheduler::handle::{LocalStageWorker, StageQuery, WorkerFlags};

/// Manifest file the acquisition system writes at the project root.
pub const ACQUISITION_MANIFEST: &str = "acquisition-manifest.json";

/// One tile entry in the acquisition manifest.
#[derive(Debug, Clone, Deserialize)]
pub struct ManifestTile {
    pub relative_path: String,
    pub tile_name: String,
    #[serde(default)]
    pub x: Option<i64>,
    #[serde(default)]
    pub y: Option<i64>,
    #[serde(default)]
    pub z: Option<i64>,
    #[serde(default)]
    pub lat_x: Option<i64>,
    #[serde(default)]
    pub lat_y: Option<i64>,
    #[serde(default)]
    pub lat_z: Option<i64>,
    #[serde(default)]
    pub cut_offset: Option<f64>,
    #[serde(default)]
    pub z_offset: Option<f64>,
    #[serde(default)]
    pub delta_z: Option<f64>,
    pub is_complete: bool,
}

impl ManifestTile {
    fn status(&self) -> TileStatus {
        if self.is_complete {
            TileStatus::Complete
        } else {
            TileStatus::Incomplete
        }
    }
}

pub struct ProjectStatusWorker {
    project: Project,
    store: StageStore,
    flags: Arc<WorkerFlags>,
    query_rx: mpsc::Receiver<StageQuery>,
    interval: Duration,
}

impl ProjectStatusWorker {
    pub fn open(project: Project, interval: Duration, batch_size: usize) -> Result<(Self, LocalStageWorker)> {
        let store = StageStore::open_with_batch_size(&project.root_path, RAW_INPUT_STAGE_ID, batch_size)?;

        let flags = Arc::new(WorkerFlags::new());
        let (query_tx, query_rx) = mpsc::channel(16);
        let handle = LocalStageWorker::new(flags.clone(), query_tx);

        let worker = Self {
            project,
            store,
            flags,
            query_rx,
            interval,
        };
        Ok((worker, handle))
    }

    pub async fn spawn(project: Project, interval: Duration, batch_size: usize) -> Result<LocalStageWorker> {
        let (worker, handle) = Self::open(project, interval, batch_size)?;
        tokio::spawn(worker.run());
        Ok(handle)
    }

    pub async fn run(mut self) {
        info!(project = %self.project.name, "project status worker started");
        let mut rx_open = true;

        while !self.flags.exit_requested() {
            if let Err(err) = self.run_cycle() {
                warn!(project = %self.project.id, error = ?err, "manifest ingest failed");
            }

            let deadline = Instant::now() + self.interval;
            loop {
                tokio::select! {
                    _ = sleep_until(deadline) => break,
                    query = self.query_rx.recv(), if rx_open => match query {
                        Some(query) => self.serve_query(query),
                        None => rx_open = false,
                    },
                }
            }
        }

        info!(project = %self.project.name, "project status worker stopped");
    }

    /// Ingest the acquisition manifest into the raw-input store. New tiles
    /// get a record; known tiles only track completion flips. An absent
    /// manifest just means acquisition has not started.
    pub fn run_cycle(&mut self) -> Result<()> {
        let manifest_path = self.project.root_path.join(ACQUISITION_MANIFEST);
        if !manifest_path.exists() {
            debug!(project = %self.project.id, "no acquisition manifest yet");
            return Ok(());
        }

        let raw = std::fs::read_to_string(&manifest_path)?;
        let tiles: Vec<ManifestTile> = serde_json::from_str(&raw)?;

        let known: HashMap<String, TileStatus> = self
            .store
            .list_status()?
            .into_iter()
            .map(|rec| (rec.relative_path, rec.this_stage_status))
            .collect();

        let mut created = Vec::new();
        let mut flipped = 0usize;
        for tile in tiles {
            let status = tile.status();
            match known.get(&tile.relative_path) {
                None => {
                    let now = Utc::now();
                    created.push(TileRecord {
                        relative_path: tile.relative_path,
                        tile_name: tile.tile_name,
                        // The raw input has no upstream; both columns carry
                        // the acquisition state
                        prev_stage_status: status,
                        this_stage_status: status,
                        x: tile.x,
                        y: tile.y,
                        z: tile.z,
                        lat_x: tile.lat_x,
                        lat_y: tile.lat_y,
                        lat_z: tile.lat_z,
                        cut_offset: tile.cut_offset,
                        z_offset: tile.z_offset,
                        delta_z: tile.delta_z,
                        created_at: now,
                        updated_at: now,
                    });
                }
                Some(existing) if *existing != status => {
                    self.store.set_this_status(&tile.relative_path, status)?;
                    flipped += 1;
                }
                Some(_) => {}
            }
        }

        if !created.is_empty() || flipped > 0 {
            info!(
                project = %self.project.id,
                created = created.len(),
                flipped,
                "acquisition manifest ingested"
            );
        }
        if !created.is_empty() {
            self.store.insert_status(&created)?;
        }
        Ok(())
    }

    fn serve_query(&self, query: StageQuery) {
        match query {
            StageQuery::PlaneStatus { plane, reply } => {
                let tiles = self.store.plane_status(plane).unwrap_or_else(|err| {
                    warn!(project = %self.project.id, error = %err, "plane status query failed");
                    Vec::new()
                });
                let _ = reply.send(tiles);
            }
            StageQuery::StatusCounts { reply } => {
                let counts = self.store.status_counts().unwrap_or_else(|err| {
                    warn!(project = %self.project.id, error = %err, "status counts query failed");
                    StatusCounts::default()
                });
                let _ = reply.send(counts);
            }
        }
    }
}
