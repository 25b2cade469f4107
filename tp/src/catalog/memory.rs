//! In-memory catalog implementation
//!
//! Used by the daemon wiring (seeded from a YAML file) and by tests. The
//! real relational catalog lives behind the same trait in a separate
//! service.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use super::models::{
    FleetWorker, PerformanceSample, PipelineStage, Project, TaskDefinition, WorkerAvailability,
};
use super::{Catalog, CatalogError};

/// Stage seed without `depth`; depth is computed at insertion as
/// 1 + previous stage's depth.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageSeed {
    pub id: String,
    pub name: String,
    pub project_id: String,
    #[serde(default)]
    pub previous_stage_id: Option<String>,
    pub task_id: String,
    pub dst_path: std::path::PathBuf,
    #[serde(default)]
    pub is_processing: bool,
}

/// Declarative catalog contents loaded from YAML at daemon startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogSeed {
    pub projects: Vec<Project>,
    pub stages: Vec<StageSeed>,
    pub tasks: Vec<TaskDefinition>,
    pub workers: Vec<FleetWorker>,
}

#[derive(Default)]
struct Inner {
    projects: HashMap<String, Project>,
    stages: HashMap<String, PipelineStage>,
    tasks: HashMap<String, TaskDefinition>,
    workers: HashMap<String, FleetWorker>,
    stage_counts: HashMap<String, (usize, usize)>,
    samples: Vec<(String, PerformanceSample)>,
}

/// RwLock-backed catalog.
#[derive(Default)]
pub struct MemoryCatalog {
    inner: RwLock<Inner>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a catalog from seed contents. Stages must appear after the
    /// stage they reference as previous.
    pub async fn from_seed(seed: CatalogSeed) -> Result<Self, CatalogError> {
        let catalog = Self::new();
        for project in seed.projects {
            catalog.insert_project(project).await;
        }
        for task in seed.tasks {
            catalog.insert_task(task).await;
        }
        for stage in seed.stages {
            catalog.insert_stage(stage).await?;
        }
        for worker in seed.workers {
            catalog.insert_worker(worker).await;
        }
        Ok(catalog)
    }

    pub async fn insert_project(&self, project: Project) {
        self.inner.write().await.projects.insert(project.id.clone(), project);
    }

    /// Insert a stage, computing its depth from the previous stage.
    pub async fn insert_stage(&self, seed: StageSeed) -> Result<PipelineStage, CatalogError> {
        let mut inner = self.inner.write().await;

        let depth = match &seed.previous_stage_id {
            None => 1,
            Some(prev_id) => {
                let prev = inner
                    .stages
                    .get(prev_id)
                    .ok_or_else(|| CatalogError::InvalidReference(format!("previous stage {prev_id}")))?;
                prev.depth + 1
            }
        };

        let stage = PipelineStage {
            id: seed.id,
            name: seed.name,
            project_id: seed.project_id,
            previous_stage_id: seed.previous_stage_id,
            task_id: seed.task_id,
            dst_path: seed.dst_path,
            depth,
            is_processing: seed.is_processing,
        };

        inner.stages.insert(stage.id.clone(), stage.clone());
        Ok(stage)
    }

    pub async fn insert_task(&self, task: TaskDefinition) {
        self.inner.write().await.tasks.insert(task.id.clone(), task);
    }

    pub async fn insert_worker(&self, worker: FleetWorker) {
        self.inner.write().await.workers.insert(worker.id.clone(), worker);
    }

    /// Recorded performance samples for a stage (test/inspection helper).
    pub async fn samples_for(&self, stage_id: &str) -> Vec<PerformanceSample> {
        self.inner
            .read()
            .await
            .samples
            .iter()
            .filter(|(sid, _)| sid == stage_id)
            .map(|(_, sample)| sample.clone())
            .collect()
    }

    /// Last reported (in_process, to_process) counts for a stage.
    pub async fn counts_for(&self, stage_id: &str) -> Option<(usize, usize)> {
        self.inner.read().await.stage_counts.get(stage_id).copied()
    }
}

#[async_trait]
impl Catalog for MemoryCatalog {
    async fn list_projects(&self) -> Result<Vec<Project>, CatalogError> {
        let mut projects: Vec<_> = self.inner.read().await.projects.values().cloned().collect();
        projects.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(projects)
    }

    async fn project(&self, id: &str) -> Result<Option<Project>, CatalogError> {
        Ok(self.inner.read().await.projects.get(id).cloned())
    }

    async fn list_stages(&self) -> Result<Vec<PipelineStage>, CatalogError> {
        let mut stages: Vec<_> = self.inner.read().await.stages.values().cloned().collect();
        stages.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(stages)
    }

    async fn stages_for_project(&self, project_id: &str) -> Result<Vec<PipelineStage>, CatalogError> {
        let mut stages: Vec<_> = self
            .inner
            .read()
            .await
            .stages
            .values()
            .filter(|s| s.project_id == project_id)
            .cloned()
            .collect();
        stages.sort_by_key(|s| s.depth);
        Ok(stages)
    }

    async fn stage(&self, id: &str) -> Result<Option<PipelineStage>, CatalogError> {
        Ok(self.inner.read().await.stages.get(id).cloned())
    }

    async fn task_definition(&self, id: &str) -> Result<Option<TaskDefinition>, CatalogError> {
        Ok(self.inner.read().await.tasks.get(id).cloned())
    }

    async fn list_workers(&self) -> Result<Vec<FleetWorker>, CatalogError> {
        let mut workers: Vec<_> = self.inner.read().await.workers.values().cloned().collect();
        workers.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(workers)
    }

    async fn worker(&self, id: &str) -> Result<Option<FleetWorker>, CatalogError> {
        Ok(self.inner.read().await.workers.get(id).cloned())
    }

    async fn set_project_processing(&self, id: &str, is_processing: bool) -> Result<(), CatalogError> {
        let mut inner = self.inner.write().await;
        let project = inner
            .projects
            .get_mut(id)
            .ok_or_else(|| CatalogError::NotFound(format!("project {id}")))?;
        project.is_processing = is_processing;
        Ok(())
    }

    async fn set_stage_processing(&self, id: &str, is_processing: bool) -> Result<(), CatalogError> {
        let mut inner = self.inner.write().await;
        let stage = inner
            .stages
            .get_mut(id)
            .ok_or_else(|| CatalogError::NotFound(format!("stage {id}")))?;
        stage.is_processing = is_processing;
        Ok(())
    }

    async fn set_worker_availability(&self, id: &str, availability: WorkerAvailability) -> Result<(), CatalogError> {
        let mut inner = self.inner.write().await;
        let worker = inner
            .workers
            .get_mut(id)
            .ok_or_else(|| CatalogError::NotFound(format!("worker {id}")))?;
        debug!(worker_id = %id, ?availability, "worker availability updated");
        worker.availability = availability;
        Ok(())
    }

    async fn update_stage_counts(
        &self,
        stage_id: &str,
        in_process: usize,
        to_process: usize,
    ) -> Result<(), CatalogError> {
        self.inner
            .write()
            .await
            .stage_counts
            .insert(stage_id.to_string(), (in_process, to_process));
        Ok(())
    }

    async fn record_completion(&self, stage_id: &str, sample: PerformanceSample) -> Result<(), CatalogError> {
        self.inner.write().await.samples.push((stage_id.to_string(), sample));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn stage_seed(id: &str, prev: Option<&str>) -> StageSeed {
        StageSeed {
            id: id.to_string(),
            name: id.to_string(),
            project_id: "p1".to_string(),
            previous_stage_id: prev.map(str::to_string),
            task_id: "t1".to_string(),
            dst_path: PathBuf::from(format!("/tmp/{id}")),
            is_processing: false,
        }
    }

    #[tokio::test]
    async fn test_stage_depth_computed_at_insertion() {
        let catalog = MemoryCatalog::new();

        let first = catalog.insert_stage(stage_seed("s1", None)).await.unwrap();
        assert_eq!(first.depth, 1);

        let second = catalog.insert_stage(stage_seed("s2", Some("s1"))).await.unwrap();
        assert_eq!(second.depth, 2);

        let third = catalog.insert_stage(stage_seed("s3", Some("s2"))).await.unwrap();
        assert_eq!(third.depth, 3);
    }

    #[tokio::test]
    async fn test_stage_with_missing_previous_rejected() {
        let catalog = MemoryCatalog::new();
        let result = catalog.insert_stage(stage_seed("s2", Some("missing"))).await;
        assert!(matches!(result, Err(CatalogError::InvalidReference(_))));
    }

    #[tokio::test]
    async fn test_stages_for_project_sorted_by_depth() {
        let catalog = MemoryCatalog::new();
        catalog.insert_stage(stage_seed("b", None)).await.unwrap();
        catalog.insert_stage(stage_seed("a", Some("b"))).await.unwrap();

        let stages = catalog.stages_for_project("p1").await.unwrap();
        assert_eq!(stages[0].id, "b");
        assert_eq!(stages[1].id, "a");
    }

    #[tokio::test]
    async fn test_processing_flag_updates() {
        let catalog = MemoryCatalog::new();
        catalog
            .insert_project(Project {
                id: "p1".to_string(),
                name: "sample".to_string(),
                root_path: PathBuf::from("/tmp/p1"),
                is_processing: false,
                sample_bounds: None,
            })
            .await;

        catalog.set_project_processing("p1", true).await.unwrap();
        assert!(catalog.project("p1").await.unwrap().unwrap().is_processing);

        assert!(matches!(
            catalog.set_project_processing("missing", true).await,
            Err(CatalogError::NotFound(_))
        ));
    }
}
