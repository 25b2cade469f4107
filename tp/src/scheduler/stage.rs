//! Per-stage scheduler
//!
//! One scheduler instance owns one stage's tile state store and runs the
//! scheduling cycle: sync from the upstream store, reconcile outstanding
//! remote executions, refill the dispatch queue, dispatch to fleet workers
//! with capacity, and report counts back to the catalog. Cycles never
//! overlap - the loop runs one cycle, then sleeps, serving status queries
//! only in the gap between cycles.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use eyre::{eyre, Result};
use handlebars::Handlebars;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use tilestore::{
    InProcessRecord, StageStore, StatusCounts, TileRecord, TileStatus, ToProcessRecord, DEFAULT_BATCH_SIZE,
    RAW_INPUT_STAGE_ID,
};

use crate::catalog::{Catalog, FleetWorker, PerformanceSample, PipelineStage, Project, TaskDefinition};
use crate::fleet::{CompletionStatus, ExecutionStatus, FleetClient, WorkerRegistry};
use crate::scheduler::handle::{LocalStageWorker, StageQuery, WorkerFlags};

#[derive(Debug, Clone, Copy)]
pub struct StageSchedulerOptions {
    /// Gap between the end of one cycle and the start of the next
    pub interval: Duration,
    pub batch_size: usize,
}

impl Default for StageSchedulerOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

/// Template context for rendering task argument templates at dispatch.
#[derive(Serialize)]
struct ArgsContext<'a> {
    project_name: &'a str,
    project_root: String,
    src_path: String,
    dst_path: String,
    relative_path: &'a str,
    tile_name: &'a str,
}

pub struct StageScheduler {
    catalog: Arc<dyn Catalog>,
    registry: Arc<WorkerRegistry>,
    fleet: Arc<FleetClient>,
    project: Project,
    stage: PipelineStage,
    task: TaskDefinition,
    /// Upstream output path: the previous stage's dst_path, or the project
    /// root for a first stage
    src_path: PathBuf,
    input_store: StageStore,
    store: StageStore,
    templates: Handlebars<'static>,
    flags: Arc<WorkerFlags>,
    query_rx: mpsc::Receiver<StageQuery>,
    interval: Duration,
}

impl StageScheduler {
    /// Resolve the stage from the catalog, open both tile stores, and
    /// rebuild the capacity registry's committed load from any in-process
    /// records left over from before a restart.
    pub async fn open(
        catalog: Arc<dyn Catalog>,
        registry: Arc<WorkerRegistry>,
        fleet: Arc<FleetClient>,
        stage_id: &str,
        options: StageSchedulerOptions,
    ) -> Result<(Self, LocalStageWorker)> {
        let stage = catalog
            .stage(stage_id)
            .await?
            .ok_or_else(|| eyre!("unknown stage {stage_id}"))?;
        let project = catalog
            .project(&stage.project_id)
            .await?
            .ok_or_else(|| eyre!("unknown project {} for stage {stage_id}", stage.project_id))?;
        let task = catalog
            .task_definition(&stage.task_id)
            .await?
            .ok_or_else(|| eyre!("unknown task {} for stage {stage_id}", stage.task_id))?;

        let (src_path, input_stage_id) = match &stage.previous_stage_id {
            Some(prev_id) => {
                let prev = catalog
                    .stage(prev_id)
                    .await?
                    .ok_or_else(|| eyre!("unknown previous stage {prev_id} for stage {stage_id}"))?;
                (prev.dst_path.clone(), prev.id.clone())
            }
            None => (project.root_path.clone(), RAW_INPUT_STAGE_ID.to_string()),
        };

        let input_store = StageStore::open_with_batch_size(&src_path, &input_stage_id, options.batch_size)?;
        let store = StageStore::open_with_batch_size(&stage.dst_path, &stage.id, options.batch_size)?;

        for record in store.list_in_process()? {
            debug!(tile = %record.relative_path, worker = %record.worker_id, "restoring in-flight reservation");
            registry.restore(&record.worker_id, task.work_units).await;
        }

        let flags = Arc::new(WorkerFlags::new());
        let (query_tx, query_rx) = mpsc::channel(16);
        let handle = LocalStageWorker::new(flags.clone(), query_tx);

        let scheduler = Self {
            catalog,
            registry,
            fleet,
            project,
            stage,
            task,
            src_path,
            input_store,
            store,
            templates: Handlebars::new(),
            flags,
            query_rx,
            interval: options.interval,
        };

        Ok((scheduler, handle))
    }

    /// Open and run on a new task, returning the control handle.
    pub async fn spawn(
        catalog: Arc<dyn Catalog>,
        registry: Arc<WorkerRegistry>,
        fleet: Arc<FleetClient>,
        stage_id: &str,
        options: StageSchedulerOptions,
    ) -> Result<LocalStageWorker> {
        let (scheduler, handle) = Self::open(catalog, registry, fleet, stage_id, options).await?;
        tokio::spawn(scheduler.run());
        Ok(handle)
    }

    /// Scheduling loop. Exit is observed at the top of each iteration, so
    /// a requested exit lets the current cycle finish.
    pub async fn run(mut self) {
        info!(stage = %self.stage.name, "stage scheduler started");
        let mut rx_open = true;

        while !self.flags.exit_requested() {
            if let Err(err) = self.run_cycle().await {
                warn!(stage = %self.stage.id, error = ?err, "scheduling cycle failed");
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

        info!(stage = %self.stage.name, "stage scheduler stopped");
    }

    /// One full scheduling cycle. Dispatch is gated on the stage's
    /// processing flag; sync, reconcile, and reporting always run so the
    /// store keeps tracking upstream progress while paused.
    pub async fn run_cycle(&mut self) -> Result<()> {
        debug!(stage = %self.stage.id, "scheduling cycle");

        self.sync_from_upstream()?;
        self.reconcile_in_process().await?;
        let pending = self.refill_queue()?;

        if self.flags.processing_requested() {
            if !pending.is_empty() {
                self.dispatch(pending).await?;
            }
        } else {
            debug!(stage = %self.stage.id, "processing not requested, skipping dispatch");
        }

        self.report().await
    }

    /// Mirror the upstream store into this stage's status table. New
    /// upstream tiles get a record with spatial fields copied once; known
    /// tiles only have their prev_stage_status refreshed.
    fn sync_from_upstream(&mut self) -> Result<()> {
        let upstream = self.input_store.list_status()?;

        let mut created = Vec::new();
        let mut prev_updates = Vec::new();

        for up in upstream {
            match self.store.status_for(&up.relative_path)? {
                None => {
                    let now = Utc::now();
                    created.push(TileRecord {
                        relative_path: up.relative_path,
                        tile_name: up.tile_name,
                        prev_stage_status: up.this_stage_status,
                        this_stage_status: TileStatus::Incomplete,
                        x: up.x,
                        y: up.y,
                        z: up.z,
                        lat_x: up.lat_x,
                        lat_y: up.lat_y,
                        lat_z: up.lat_z,
                        cut_offset: up.cut_offset,
                        z_offset: up.z_offset,
                        delta_z: up.delta_z,
                        created_at: now,
                        updated_at: now,
                    });
                }
                Some(existing) if existing.prev_stage_status != up.this_stage_status => {
                    prev_updates.push((up.relative_path, up.this_stage_status));
                }
                Some(_) => {}
            }
        }

        if !created.is_empty() {
            debug!(stage = %self.stage.id, count = created.len(), "new upstream tiles");
            self.store.insert_status(&created)?;
        }
        if !prev_updates.is_empty() {
            debug!(stage = %self.stage.id, count = prev_updates.len(), "upstream status changes");
            self.store.update_prev_status(&prev_updates)?;
        }
        Ok(())
    }

    /// Poll every outstanding remote execution. A completed execution
    /// resolves its tile and frees the worker's capacity; a query failure
    /// leaves the record for a later cycle (the fleet client has already
    /// demoted the worker).
    async fn reconcile_in_process(&mut self) -> Result<()> {
        for record in self.store.list_in_process()? {
            let Some(worker) = self.catalog.worker(&record.worker_id).await? else {
                warn!(
                    tile = %record.relative_path,
                    worker = %record.worker_id,
                    "in-process record references unknown worker"
                );
                continue;
            };

            let report = match self.fleet.query_task_execution(&worker, &record.task_execution_id).await {
                Ok(report) => report,
                Err(err) => {
                    warn!(
                        tile = %record.relative_path,
                        worker = %worker.name,
                        error = %err,
                        "execution query failed, keeping in-process record"
                    );
                    continue;
                }
            };

            match report.execution_status {
                ExecutionStatus::Running => {
                    self.store.touch_in_process(&record.relative_path)?;
                }
                ExecutionStatus::Completed => {
                    let completion = report.completion_status.unwrap_or(CompletionStatus::Error);
                    let status = match completion {
                        CompletionStatus::Success => TileStatus::Complete,
                        CompletionStatus::Error => TileStatus::Failed,
                        // Canceled tiles go back to the start of the state
                        // machine so they can be queued again
                        CompletionStatus::Cancel => TileStatus::Incomplete,
                    };

                    self.store.set_this_status(&record.relative_path, status)?;
                    self.store.delete_in_process(&record.relative_path)?;
                    self.registry.release(&record.worker_id, self.task.work_units).await;

                    info!(
                        stage = %self.stage.id,
                        tile = %record.relative_path,
                        worker = %worker.name,
                        ?status,
                        "remote execution completed"
                    );

                    let outcome = match completion {
                        CompletionStatus::Success => "success",
                        CompletionStatus::Error => "error",
                        CompletionStatus::Cancel => "cancel",
                    };
                    let sample = PerformanceSample {
                        task_execution_id: record.task_execution_id.clone(),
                        worker_id: record.worker_id.clone(),
                        outcome: outcome.to_string(),
                        duration_ms: report.duration_ms,
                        work_units: self.task.work_units,
                    };
                    if let Err(err) = self.catalog.record_completion(&self.stage.id, sample).await {
                        warn!(stage = %self.stage.id, error = %err, "failed to record completion sample");
                    }
                }
            }
        }
        Ok(())
    }

    /// Return the dispatch backlog, rescanning the status table for newly
    /// eligible tiles only when the backlog has fully drained.
    fn refill_queue(&mut self) -> Result<Vec<ToProcessRecord>> {
        let pending = self.store.list_to_process()?;
        if !pending.is_empty() {
            return Ok(pending);
        }

        let eligible = self.store.eligible_for_queue()?;
        if eligible.is_empty() {
            return Ok(Vec::new());
        }

        let now = Utc::now();
        let queued: Vec<ToProcessRecord> = eligible
            .iter()
            .map(|tile| ToProcessRecord {
                relative_path: tile.relative_path.clone(),
                tile_name: tile.tile_name.clone(),
                created_at: now,
                updated_at: now,
            })
            .collect();

        self.store.insert_to_process(&queued)?;
        let paths: Vec<String> = eligible.iter().map(|tile| tile.relative_path.clone()).collect();
        self.store.mark_queued(&paths)?;

        info!(stage = %self.stage.id, count = queued.len(), "refilled dispatch queue");
        Ok(queued)
    }

    /// Walk the backlog in order, placing each tile on the first worker
    /// with room. Every tile in the pass costs the same fixed work units,
    /// so the first tile that cannot be placed ends the pass - no later
    /// tile could fit either.
    async fn dispatch(&mut self, pending: Vec<ToProcessRecord>) -> Result<()> {
        let stage = self
            .catalog
            .stage(&self.stage.id)
            .await?
            .ok_or_else(|| eyre!("stage {} disappeared from catalog", self.stage.id))?;
        if stage.task_id != self.task.id {
            self.task = self
                .catalog
                .task_definition(&stage.task_id)
                .await?
                .ok_or_else(|| eyre!("unknown task {} for stage {}", stage.task_id, self.stage.id))?;
            info!(stage = %self.stage.id, task = %self.task.name, "stage task definition changed");
        }

        let mut workers: Vec<FleetWorker> = self
            .catalog
            .list_workers()
            .await?
            .into_iter()
            .filter(FleetWorker::is_dispatchable)
            .collect();
        if workers.is_empty() {
            debug!(stage = %self.stage.id, "no dispatchable workers");
            return Ok(());
        }
        // Fixed scan order keeps first-fit deterministic
        workers.sort_by(|a, b| a.id.cmp(&b.id));

        for tile in pending {
            if !self.place_tile(&tile, &workers).await? {
                debug!(stage = %self.stage.id, tile = %tile.relative_path, "no capacity left, ending dispatch pass");
                break;
            }
        }
        Ok(())
    }

    /// Try to start `tile` on the first worker with room. Capacity is
    /// reserved before the RPC; a failed start releases the reservation
    /// and moves on to the next worker.
    async fn place_tile(&mut self, tile: &ToProcessRecord, workers: &[FleetWorker]) -> Result<bool> {
        std::fs::create_dir_all(self.stage.dst_path.join(&tile.relative_path))?;
        let args = self.render_args(tile)?;

        for worker in workers {
            let Some(load) = self.registry.load(&worker.id).await else {
                debug!(worker = %worker.name, "load unknown, skipping");
                continue;
            };
            if load + self.task.work_units > worker.work_unit_capacity {
                continue;
            }
            if !self
                .registry
                .try_reserve(&worker.id, self.task.work_units, worker.work_unit_capacity)
                .await
            {
                continue;
            }

            match self.fleet.start_task_execution(worker, &self.task, &args).await {
                Ok(execution) => {
                    let now = Utc::now();
                    self.store.insert_in_process(&InProcessRecord {
                        relative_path: tile.relative_path.clone(),
                        tile_name: tile.tile_name.clone(),
                        worker_id: worker.id.clone(),
                        worker_last_seen: now,
                        task_execution_id: execution.id.clone(),
                        created_at: now,
                        updated_at: now,
                    })?;
                    self.store.delete_to_process(&tile.relative_path)?;

                    info!(
                        stage = %self.stage.id,
                        tile = %tile.relative_path,
                        worker = %worker.name,
                        execution_id = %execution.id,
                        "dispatched tile"
                    );
                    return Ok(true);
                }
                Err(err) => {
                    self.registry.release(&worker.id, self.task.work_units).await;
                    warn!(
                        stage = %self.stage.id,
                        tile = %tile.relative_path,
                        worker = %worker.name,
                        error = %err,
                        "failed to start remote task"
                    );
                }
            }
        }
        Ok(false)
    }

    fn render_args(&self, tile: &ToProcessRecord) -> Result<Vec<String>> {
        let context = ArgsContext {
            project_name: &self.project.name,
            project_root: self.project.root_path.display().to_string(),
            src_path: self.src_path.display().to_string(),
            dst_path: self.stage.dst_path.display().to_string(),
            relative_path: &tile.relative_path,
            tile_name: &tile.tile_name,
        };
        self.task
            .args_template
            .iter()
            .map(|template| Ok(self.templates.render_template(template, &context)?))
            .collect()
    }

    async fn report(&mut self) -> Result<()> {
        let in_process = self.store.count_in_process()?;
        let to_process = self.store.count_to_process()?;
        debug!(stage = %self.stage.id, in_process, to_process, "reporting stage counts");
        self.catalog.update_stage_counts(&self.stage.id, in_process, to_process).await?;
        Ok(())
    }

    /// Queries are answered from the store between cycles. A store failure
    /// degrades to an empty answer rather than killing the loop.
    fn serve_query(&self, query: StageQuery) {
        match query {
            StageQuery::PlaneStatus { plane, reply } => {
                let tiles = self.store.plane_status(plane).unwrap_or_else(|err| {
                    warn!(stage = %self.stage.id, error = %err, "plane status query failed");
                    Vec::new()
                });
                let _ = reply.send(tiles);
            }
            StageQuery::StatusCounts { reply } => {
                let counts = self.derived_counts().unwrap_or_else(|err| {
                    warn!(stage = %self.stage.id, error = %err, "status counts query failed");
                    StatusCounts::default()
                });
                let _ = reply.send(counts);
            }
        }
    }

    /// Counts as reported outward: Processing is derived from in-process
    /// membership and subtracted from the stored Queued figure.
    fn derived_counts(&self) -> Result<StatusCounts, tilestore::StoreError> {
        let mut counts = self.store.status_counts()?;
        let processing = self.store.count_in_process()? as u64;
        counts.processing = processing;
        counts.queued = counts.queued.saturating_sub(processing);
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::path::Path;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use tempfile::TempDir;

    use crate::catalog::{MemoryCatalog, StageSeed, WorkerAvailability};
    use crate::fleet::{ExecutionReport, TaskExecution, WorkerClient, WorkerClientError};
    use crate::scheduler::handle::StageWorkerHandle;

    #[derive(Default)]
    struct ScriptedInner {
        next_id: u32,
        reports: HashMap<String, ExecutionReport>,
        start_calls: u32,
        fail_starts: bool,
        fail_queries: bool,
    }

    /// Worker client with scripted completions.
    #[derive(Default)]
    struct ScriptedClient {
        inner: Mutex<ScriptedInner>,
    }

    impl ScriptedClient {
        fn start_calls(&self) -> u32 {
            self.inner.lock().unwrap().start_calls
        }

        fn fail_starts(&self) {
            self.inner.lock().unwrap().fail_starts = true;
        }

        fn fail_queries(&self, on: bool) {
            self.inner.lock().unwrap().fail_queries = on;
        }

        /// Flip every running execution to completed with the given outcome.
        fn complete_all(&self, completion: CompletionStatus) {
            let mut inner = self.inner.lock().unwrap();
            for report in inner.reports.values_mut() {
                if report.execution_status == ExecutionStatus::Running {
                    report.execution_status = ExecutionStatus::Completed;
                    report.completion_status = Some(completion);
                    report.duration_ms = Some(1000);
                }
            }
        }
    }

    #[async_trait]
    impl WorkerClient for ScriptedClient {
        async fn start_task_execution(
            &self,
            _worker: &FleetWorker,
            _task: &TaskDefinition,
            _args: &[String],
        ) -> Result<TaskExecution, WorkerClientError> {
            let mut inner = self.inner.lock().unwrap();
            inner.start_calls += 1;
            if inner.fail_starts {
                return Err(WorkerClientError::Api {
                    status: 503,
                    message: "down".to_string(),
                });
            }
            inner.next_id += 1;
            let id = format!("exec-{}", inner.next_id);
            inner.reports.insert(
                id.clone(),
                ExecutionReport {
                    id: id.clone(),
                    execution_status: ExecutionStatus::Running,
                    completion_status: None,
                    duration_ms: None,
                },
            );
            Ok(TaskExecution { id })
        }

        async fn query_task_execution(
            &self,
            _worker: &FleetWorker,
            execution_id: &str,
        ) -> Result<ExecutionReport, WorkerClientError> {
            let inner = self.inner.lock().unwrap();
            if inner.fail_queries {
                return Err(WorkerClientError::Api {
                    status: 503,
                    message: "down".to_string(),
                });
            }
            inner
                .reports
                .get(execution_id)
                .cloned()
                .ok_or_else(|| WorkerClientError::InvalidResponse(format!("unknown execution {execution_id}")))
        }
    }

    struct Fixture {
        catalog: Arc<MemoryCatalog>,
        registry: Arc<WorkerRegistry>,
        client: Arc<ScriptedClient>,
        temp: TempDir,
    }

    impl Fixture {
        async fn new(capacity: u32, work_units: u32, tile_count: usize) -> Self {
            let temp = TempDir::new().unwrap();
            let catalog = Arc::new(MemoryCatalog::new());

            catalog
                .insert_project(Project {
                    id: "p1".to_string(),
                    name: "sample".to_string(),
                    root_path: temp.path().join("root"),
                    is_processing: true,
                    sample_bounds: None,
                })
                .await;
            catalog
                .insert_task(TaskDefinition {
                    id: "t1".to_string(),
                    name: "classify".to_string(),
                    script: "classify.sh".to_string(),
                    work_units,
                    args_template: vec!["{{relative_path}}".to_string(), "{{dst_path}}".to_string()],
                })
                .await;
            catalog
                .insert_stage(StageSeed {
                    id: "s1".to_string(),
                    name: "classify".to_string(),
                    project_id: "p1".to_string(),
                    previous_stage_id: None,
                    task_id: "t1".to_string(),
                    dst_path: temp.path().join("s1"),
                    is_processing: true,
                })
                .await
                .unwrap();
            catalog
                .insert_worker(FleetWorker {
                    id: "w1".to_string(),
                    name: "worker-1".to_string(),
                    address: "127.0.0.1:4001".to_string(),
                    work_unit_capacity: capacity,
                    availability: WorkerAvailability::Available,
                    in_scheduler_pool: true,
                })
                .await;

            seed_raw_store(&temp.path().join("root"), tile_count);

            let registry = Arc::new(WorkerRegistry::new());
            registry.observe("w1").await;

            Self {
                catalog,
                registry,
                client: Arc::new(ScriptedClient::default()),
                temp,
            }
        }

        async fn scheduler(&self) -> (StageScheduler, LocalStageWorker) {
            let fleet = Arc::new(FleetClient::new(self.client.clone(), self.catalog.clone()));
            StageScheduler::open(
                self.catalog.clone(),
                self.registry.clone(),
                fleet,
                "s1",
                StageSchedulerOptions::default(),
            )
            .await
            .unwrap()
        }

        fn stage_store(&self) -> StageStore {
            StageStore::open(&self.temp.path().join("s1"), "s1").unwrap()
        }
    }

    fn seed_raw_store(root: &Path, tile_count: usize) {
        let mut store = StageStore::open(root, RAW_INPUT_STAGE_ID).unwrap();
        let now = Utc::now();
        let records: Vec<TileRecord> = (0..tile_count)
            .map(|i| TileRecord {
                relative_path: format!("2026-01-01/{i:05}"),
                tile_name: format!("{i:05}"),
                prev_stage_status: TileStatus::Complete,
                this_stage_status: TileStatus::Complete,
                x: Some(i as i64),
                y: Some(0),
                z: Some(0),
                lat_x: Some(i as i64),
                lat_y: Some(0),
                lat_z: Some(0),
                cut_offset: Some(0.0),
                z_offset: Some(0.0),
                delta_z: Some(0.25),
                created_at: now,
                updated_at: now,
            })
            .collect();
        store.insert_status(&records).unwrap();
    }

    #[tokio::test]
    async fn test_sync_and_refill_without_dispatch() {
        let fixture = Fixture::new(4, 2, 3).await;
        let (mut scheduler, _handle) = fixture.scheduler().await;

        // Processing not requested: tiles sync and queue but nothing starts
        scheduler.run_cycle().await.unwrap();

        assert_eq!(fixture.client.start_calls(), 0);
        assert_eq!(fixture.catalog.counts_for("s1").await, Some((0, 3)));

        let store = fixture.stage_store();
        let counts = store.status_counts().unwrap();
        assert_eq!(counts.queued, 3);
        assert_eq!(counts.incomplete, 0);
    }

    #[tokio::test]
    async fn test_spatial_fields_frozen_after_creation() {
        let fixture = Fixture::new(4, 2, 1).await;
        let (mut scheduler, _handle) = fixture.scheduler().await;
        scheduler.run_cycle().await.unwrap();

        // Mutate the upstream record's spatial fields; only prev status may
        // propagate on later syncs
        {
            let mut raw = StageStore::open(&fixture.temp.path().join("root"), RAW_INPUT_STAGE_ID).unwrap();
            raw.update_prev_status(&[("2026-01-01/00000".to_string(), TileStatus::Incomplete)])
                .unwrap();
            raw.set_this_status("2026-01-01/00000", TileStatus::Incomplete).unwrap();
        }
        scheduler.run_cycle().await.unwrap();

        let record = fixture.stage_store().status_for("2026-01-01/00000").unwrap().unwrap();
        assert_eq!(record.prev_stage_status, TileStatus::Incomplete);
        assert_eq!(record.lat_x, Some(0));
    }

    #[tokio::test]
    async fn test_dispatch_fills_capacity_and_stops_early() {
        // Capacity 4, cost 2, 3 tiles: exactly two placements, then the
        // third ends the pass
        let fixture = Fixture::new(4, 2, 3).await;
        let (mut scheduler, handle) = fixture.scheduler().await;
        handle.set_processing_requested(true).await;

        scheduler.run_cycle().await.unwrap();

        assert_eq!(fixture.client.start_calls(), 2);
        assert_eq!(fixture.registry.load("w1").await, Some(4));
        assert_eq!(fixture.catalog.counts_for("s1").await, Some((2, 1)));

        let store = fixture.stage_store();
        assert_eq!(store.count_in_process().unwrap(), 2);
        // a dispatched tile is in exactly one of the two tables
        assert_eq!(store.count_to_process().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_pipeline_drains_over_cycles() {
        let fixture = Fixture::new(4, 2, 3).await;
        let (mut scheduler, handle) = fixture.scheduler().await;
        handle.set_processing_requested(true).await;

        scheduler.run_cycle().await.unwrap();
        fixture.client.complete_all(CompletionStatus::Success);
        scheduler.run_cycle().await.unwrap();

        // Two completed, capacity freed, third tile dispatched
        assert_eq!(fixture.catalog.counts_for("s1").await, Some((1, 0)));
        assert_eq!(fixture.registry.load("w1").await, Some(2));

        fixture.client.complete_all(CompletionStatus::Success);
        scheduler.run_cycle().await.unwrap();

        assert_eq!(fixture.catalog.counts_for("s1").await, Some((0, 0)));
        assert_eq!(fixture.registry.load("w1").await, Some(0));
        assert_eq!(fixture.stage_store().status_counts().unwrap().complete, 3);

        let samples = fixture.catalog.samples_for("s1").await;
        assert_eq!(samples.len(), 3);
        assert!(samples.iter().all(|s| s.outcome == "success"));
    }

    #[tokio::test]
    async fn test_canceled_execution_requeues_tile() {
        let fixture = Fixture::new(2, 2, 1).await;
        let (mut scheduler, handle) = fixture.scheduler().await;
        handle.set_processing_requested(true).await;

        scheduler.run_cycle().await.unwrap();
        assert_eq!(fixture.catalog.counts_for("s1").await, Some((1, 0)));

        fixture.client.complete_all(CompletionStatus::Cancel);
        scheduler.run_cycle().await.unwrap();

        // Cancel reverted the tile to Incomplete; the same cycle requeued
        // and redispatched it
        assert_eq!(fixture.client.start_calls(), 2);
        assert_eq!(fixture.catalog.counts_for("s1").await, Some((1, 0)));
        assert_eq!(fixture.stage_store().status_counts().unwrap().canceled, 0);
    }

    #[tokio::test]
    async fn test_failed_tiles_are_terminal() {
        let fixture = Fixture::new(4, 2, 1).await;
        let (mut scheduler, handle) = fixture.scheduler().await;
        handle.set_processing_requested(true).await;

        scheduler.run_cycle().await.unwrap();
        fixture.client.complete_all(CompletionStatus::Error);
        scheduler.run_cycle().await.unwrap();
        scheduler.run_cycle().await.unwrap();

        // Never requeued after failure
        assert_eq!(fixture.client.start_calls(), 1);
        assert_eq!(fixture.catalog.counts_for("s1").await, Some((0, 0)));
        assert_eq!(fixture.stage_store().status_counts().unwrap().failed, 1);
    }

    #[tokio::test]
    async fn test_failed_start_releases_reservation_and_demotes() {
        let fixture = Fixture::new(4, 2, 1).await;
        fixture.client.fail_starts();
        let (mut scheduler, handle) = fixture.scheduler().await;
        handle.set_processing_requested(true).await;

        scheduler.run_cycle().await.unwrap();

        assert_eq!(fixture.registry.load("w1").await, Some(0));
        assert_eq!(fixture.catalog.counts_for("s1").await, Some((0, 1)));
        let worker = fixture.catalog.worker("w1").await.unwrap().unwrap();
        assert_eq!(worker.availability, WorkerAvailability::Unavailable);
    }

    #[tokio::test]
    async fn test_query_failure_keeps_in_process_record() {
        let fixture = Fixture::new(4, 2, 1).await;
        let (mut scheduler, handle) = fixture.scheduler().await;
        handle.set_processing_requested(true).await;

        scheduler.run_cycle().await.unwrap();
        fixture.client.fail_queries(true);
        scheduler.run_cycle().await.unwrap();

        // Record survives the failed poll; capacity stays committed
        assert_eq!(fixture.stage_store().count_in_process().unwrap(), 1);
        assert_eq!(fixture.registry.load("w1").await, Some(2));

        // Worker recovers: next poll resolves the execution
        fixture.client.fail_queries(false);
        fixture
            .catalog
            .set_worker_availability("w1", WorkerAvailability::Available)
            .await
            .unwrap();
        fixture.client.complete_all(CompletionStatus::Success);
        scheduler.run_cycle().await.unwrap();
        assert_eq!(fixture.stage_store().count_in_process().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unknown_worker_load_skipped() {
        let fixture = Fixture::new(4, 2, 1).await;
        // Fresh registry that has never observed w1
        let registry = Arc::new(WorkerRegistry::new());
        let fleet = Arc::new(FleetClient::new(fixture.client.clone(), fixture.catalog.clone()));
        let (mut scheduler, handle) = StageScheduler::open(
            fixture.catalog.clone(),
            registry,
            fleet,
            "s1",
            StageSchedulerOptions::default(),
        )
        .await
        .unwrap();
        handle.set_processing_requested(true).await;

        scheduler.run_cycle().await.unwrap();

        assert_eq!(fixture.client.start_calls(), 0);
        assert_eq!(fixture.catalog.counts_for("s1").await, Some((0, 1)));
    }

    #[tokio::test]
    async fn test_restart_restores_committed_load() {
        let fixture = Fixture::new(4, 2, 1).await;
        {
            let (mut scheduler, handle) = fixture.scheduler().await;
            handle.set_processing_requested(true).await;
            scheduler.run_cycle().await.unwrap();
        }
        assert_eq!(fixture.registry.load("w1").await, Some(2));

        // A fresh registry (new process) rebuilds load from the store
        let registry = Arc::new(WorkerRegistry::new());
        let fleet = Arc::new(FleetClient::new(fixture.client.clone(), fixture.catalog.clone()));
        let _ = StageScheduler::open(
            fixture.catalog.clone(),
            registry.clone(),
            fleet,
            "s1",
            StageSchedulerOptions::default(),
        )
        .await
        .unwrap();

        assert_eq!(registry.load("w1").await, Some(2));
    }

    #[tokio::test]
    async fn test_args_rendered_from_templates() {
        let fixture = Fixture::new(4, 2, 1).await;
        let (scheduler, _handle) = fixture.scheduler().await;

        let now = Utc::now();
        let args = scheduler
            .render_args(&ToProcessRecord {
                relative_path: "2026-01-01/00000".to_string(),
                tile_name: "00000".to_string(),
                created_at: now,
                updated_at: now,
            })
            .unwrap();

        assert_eq!(args[0], "2026-01-01/00000");
        assert_eq!(args[1], fixture.temp.path().join("s1").display().to_string());
    }
}
