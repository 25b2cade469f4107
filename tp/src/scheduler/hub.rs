//! Scheduler hub
//!
//! Top-level reconciliation loop. Each pass reads the catalog's desired
//! state and converges the set of running workers: stage workers and
//! project aggregators are started for processing-enabled projects,
//! stopped for disabled ones, and kept as-is otherwise. Flags that flip
//! and flip back between passes are never observed, so workers survive
//! them. The hub also serves cross-stage status queries, degrading to
//! empty answers rather than erroring.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use eyre::Result;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use tilestore::{StatusCounts, DEFAULT_BATCH_SIZE};

use crate::catalog::{Catalog, PipelineStage, Project, WorkerAvailability};
use crate::fleet::{FleetClient, WorkerRegistry};
use crate::scheduler::child::ChildStageWorker;
use crate::scheduler::handle::StageWorkerHandle;
use crate::scheduler::plane::PlaneStatusMap;
use crate::scheduler::project::ProjectStatusWorker;
use crate::scheduler::stage::{StageScheduler, StageSchedulerOptions};

#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Gap between catalog reconciliation passes
    pub poll_interval: Duration,
    pub stage_interval: Duration,
    pub project_interval: Duration,
    pub batch_size: usize,
    /// Run stage workers as child processes instead of in-process tasks
    pub child_process_workers: bool,
    /// Config file forwarded to child stage-worker processes
    pub child_config: Option<PathBuf>,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            stage_interval: Duration::from_secs(30),
            project_interval: Duration::from_secs(30),
            batch_size: DEFAULT_BATCH_SIZE,
            child_process_workers: false,
            child_config: None,
        }
    }
}

pub struct SchedulerHub {
    catalog: Arc<dyn Catalog>,
    registry: Arc<WorkerRegistry>,
    fleet: Arc<FleetClient>,
    config: HubConfig,
    stage_workers: HashMap<String, Box<dyn StageWorkerHandle>>,
    project_workers: HashMap<String, Box<dyn StageWorkerHandle>>,
    stage_workers_started: usize,
}

impl SchedulerHub {
    pub fn new(
        catalog: Arc<dyn Catalog>,
        registry: Arc<WorkerRegistry>,
        fleet: Arc<FleetClient>,
        config: HubConfig,
    ) -> Self {
        Self {
            catalog,
            registry,
            fleet,
            config,
            stage_workers: HashMap::new(),
            project_workers: HashMap::new(),
            stage_workers_started: 0,
        }
    }

    /// Reconciliation loop; runs until the shutdown signal fires, then
    /// asks every worker to exit.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("scheduler hub started");
        loop {
            if let Err(err) = self.reconcile().await {
                warn!(error = ?err, "hub reconciliation failed");
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        self.stop_all().await;
        info!("scheduler hub stopped");
    }

    /// One reconciliation pass against current catalog state.
    pub async fn reconcile(&mut self) -> Result<()> {
        // Available fleet workers become known to the capacity registry so
        // dispatch can consider them
        for worker in self.catalog.list_workers().await? {
            if worker.availability == WorkerAvailability::Available {
                self.registry.observe(&worker.id).await;
            }
        }

        for project in self.catalog.list_projects().await? {
            let result = if project.is_processing {
                self.resume_project(&project).await
            } else {
                self.pause_project(&project).await
            };
            if let Err(err) = result {
                warn!(project = %project.id, error = ?err, "project reconciliation failed");
            }
        }

        self.push_processing_flags().await
    }

    /// Stop every worker belonging to a processing-disabled project and
    /// mark its stages not-processing.
    async fn pause_project(&mut self, project: &Project) -> Result<()> {
        if let Some(worker) = self.project_workers.remove(&project.id) {
            info!(project = %project.name, "stopping project aggregator");
            worker.request_exit().await;
        }

        for stage in self.catalog.stages_for_project(&project.id).await? {
            self.catalog.set_stage_processing(&stage.id, false).await?;
            if let Some(worker) = self.stage_workers.remove(&stage.id) {
                info!(project = %project.name, stage = %stage.name, "stopping stage worker");
                worker.request_exit().await;
            }
        }
        Ok(())
    }

    /// Ensure a processing-enabled project has its aggregator and one
    /// worker per stage. Existing workers are reused untouched.
    async fn resume_project(&mut self, project: &Project) -> Result<()> {
        if !self.project_workers.contains_key(&project.id) {
            info!(project = %project.name, "starting project aggregator");
            let handle =
                ProjectStatusWorker::spawn(project.clone(), self.config.project_interval, self.config.batch_size)
                    .await?;
            self.project_workers.insert(project.id.clone(), Box::new(handle));
        }

        for stage in self.catalog.stages_for_project(&project.id).await? {
            if self.stage_workers.contains_key(&stage.id) {
                continue;
            }
            info!(project = %project.name, stage = %stage.name, "starting stage worker");
            match self.start_stage_worker(&stage).await {
                Ok(worker) => {
                    worker.set_processing_requested(stage.is_processing).await;
                    self.stage_workers.insert(stage.id.clone(), worker);
                    self.stage_workers_started += 1;
                }
                Err(err) => {
                    warn!(stage = %stage.id, error = ?err, "failed to start stage worker");
                }
            }
        }
        Ok(())
    }

    async fn start_stage_worker(&self, stage: &PipelineStage) -> Result<Box<dyn StageWorkerHandle>> {
        if self.config.child_process_workers {
            let worker = ChildStageWorker::spawn(&stage.id, self.config.child_config.as_deref())?;
            Ok(Box::new(worker))
        } else {
            let handle = StageScheduler::spawn(
                self.catalog.clone(),
                self.registry.clone(),
                self.fleet.clone(),
                &stage.id,
                StageSchedulerOptions {
                    interval: self.config.stage_interval,
                    batch_size: self.config.batch_size,
                },
            )
            .await?;
            Ok(Box::new(handle))
        }
    }

    /// Push each stage's current processing flag into its running worker.
    async fn push_processing_flags(&self) -> Result<()> {
        for (stage_id, worker) in &self.stage_workers {
            if let Some(stage) = self.catalog.stage(stage_id).await? {
                worker.set_processing_requested(stage.is_processing).await;
            }
        }
        Ok(())
    }

    async fn stop_all(&mut self) {
        for (_, worker) in self.project_workers.drain() {
            worker.request_exit().await;
        }
        for (_, worker) in self.stage_workers.drain() {
            worker.request_exit().await;
        }
    }

    /// Merged tile status for one z-plane across all of a project's
    /// stages. Unknown projects, missing planes, and absent workers all
    /// yield the empty map.
    pub async fn plane_status(&self, project_id: &str, plane: Option<i64>) -> PlaneStatusMap {
        let Some(plane) = plane else {
            return PlaneStatusMap::empty();
        };
        let Ok(Some(project)) = self.catalog.project(project_id).await else {
            debug!(project_id, "plane status for unknown project");
            return PlaneStatusMap::empty();
        };
        let Ok(stages) = self.catalog.stages_for_project(project_id).await else {
            return PlaneStatusMap::empty();
        };
        if stages.is_empty() {
            return PlaneStatusMap::empty();
        }

        let max_depth = stages.iter().map(|s| s.depth).max().unwrap_or(0);
        let mut entries = Vec::new();
        for stage in &stages {
            if let Some(worker) = self.stage_workers.get(&stage.id) {
                entries.push((stage.id.clone(), stage.depth, worker.plane_status(plane).await));
            }
        }

        PlaneStatusMap::merge(max_depth, project.sample_bounds, entries)
    }

    /// Per-status tile counts for one stage, zero when no worker runs.
    pub async fn stage_counts(&self, stage_id: &str) -> StatusCounts {
        match self.stage_workers.get(stage_id) {
            Some(worker) => worker.status_counts().await,
            None => StatusCounts::default(),
        }
    }
}
