//! Remote worker RPC client
//!
//! The scheduler talks to a fleet worker through two calls: start a task
//! execution, and query an execution's status. Any communication failure
//! demotes the targeted worker to Unavailable in the catalog - that is the
//! only automatic recovery path for an unreachable worker.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::catalog::{Catalog, FleetWorker, TaskDefinition, WorkerAvailability};

/// Errors from the worker RPC boundary
#[derive(Debug, Error)]
pub enum WorkerClientError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Worker API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Invalid response from worker: {0}")]
    InvalidResponse(String),
}

impl WorkerClientError {
    /// Communication errors (as opposed to well-formed rejections) demote
    /// the worker's availability.
    pub fn is_communication(&self) -> bool {
        match self {
            WorkerClientError::Network(_) => true,
            WorkerClientError::Api { status, .. } => *status >= 500,
            WorkerClientError::InvalidResponse(_) => false,
        }
    }
}

/// Remote execution lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Completed,
}

/// How a completed remote execution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    Success,
    Error,
    Cancel,
}

/// Handle returned when a remote execution starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskExecution {
    pub id: String,
}

/// Status report for one remote execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub id: String,
    pub execution_status: ExecutionStatus,
    #[serde(default)]
    pub completion_status: Option<CompletionStatus>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
}

/// The wire contract a fleet worker exposes.
#[async_trait]
pub trait WorkerClient: Send + Sync {
    async fn start_task_execution(
        &self,
        worker: &FleetWorker,
        task: &TaskDefinition,
        args: &[String],
    ) -> Result<TaskExecution, WorkerClientError>;

    async fn query_task_execution(
        &self,
        worker: &FleetWorker,
        execution_id: &str,
    ) -> Result<ExecutionReport, WorkerClientError>;
}

#[derive(Serialize)]
struct StartTaskBody<'a> {
    task_id: &'a str,
    script: &'a str,
    args: &'a [String],
}

/// HTTP JSON implementation of the worker contract.
pub struct HttpWorkerClient {
    http: Client,
}

impl HttpWorkerClient {
    pub fn new(timeout: Duration) -> Result<Self, WorkerClientError> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self { http })
    }

    fn base_url(worker: &FleetWorker) -> String {
        format!("http://{}/engine/task-executions", worker.address)
    }
}

#[async_trait]
impl WorkerClient for HttpWorkerClient {
    async fn start_task_execution(
        &self,
        worker: &FleetWorker,
        task: &TaskDefinition,
        args: &[String],
    ) -> Result<TaskExecution, WorkerClientError> {
        debug!(worker = %worker.name, task = %task.name, "starting remote task execution");

        let response = self
            .http
            .post(Self::base_url(worker))
            .json(&StartTaskBody {
                task_id: &task.id,
                script: &task.script,
                args,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(WorkerClientError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let execution: TaskExecution = response
            .json()
            .await
            .map_err(|e| WorkerClientError::InvalidResponse(e.to_string()))?;

        debug!(worker = %worker.name, execution_id = %execution.id, "remote task execution started");
        Ok(execution)
    }

    async fn query_task_execution(
        &self,
        worker: &FleetWorker,
        execution_id: &str,
    ) -> Result<ExecutionReport, WorkerClientError> {
        let url = format!("{}/{execution_id}", Self::base_url(worker));
        let response = self.http.get(url).send().await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(WorkerClientError::Api {
                status: status.as_u16(),
                message,
            });
        }

        response
            .json()
            .await
            .map_err(|e| WorkerClientError::InvalidResponse(e.to_string()))
    }
}

/// Worker client plus the availability side effect.
///
/// Wraps the raw RPC client and the catalog handle so that every
/// communication failure marks the targeted worker Unavailable before the
/// error propagates.
pub struct FleetClient {
    client: Arc<dyn WorkerClient>,
    catalog: Arc<dyn Catalog>,
}

impl FleetClient {
    pub fn new(client: Arc<dyn WorkerClient>, catalog: Arc<dyn Catalog>) -> Self {
        Self { client, catalog }
    }

    pub async fn start_task_execution(
        &self,
        worker: &FleetWorker,
        task: &TaskDefinition,
        args: &[String],
    ) -> Result<TaskExecution, WorkerClientError> {
        let result = self.client.start_task_execution(worker, task, args).await;
        self.demote_on_failure(worker, &result).await;
        result
    }

    pub async fn query_task_execution(
        &self,
        worker: &FleetWorker,
        execution_id: &str,
    ) -> Result<ExecutionReport, WorkerClientError> {
        let result = self.client.query_task_execution(worker, execution_id).await;
        self.demote_on_failure(worker, &result).await;
        result
    }

    async fn demote_on_failure<T>(&self, worker: &FleetWorker, result: &Result<T, WorkerClientError>) {
        if let Err(err) = result
            && err.is_communication()
        {
            warn!(worker = %worker.name, error = %err, "worker communication failed, marking unavailable");
            if let Err(e) = self
                .catalog
                .set_worker_availability(&worker.id, WorkerAvailability::Unavailable)
                .await
            {
                warn!(worker = %worker.name, error = %e, "failed to demote worker availability");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MemoryCatalog;

    struct FailingClient;

    #[async_trait]
    impl WorkerClient for FailingClient {
        async fn start_task_execution(
            &self,
            _worker: &FleetWorker,
            _task: &TaskDefinition,
            _args: &[String],
        ) -> Result<TaskExecution, WorkerClientError> {
            Err(WorkerClientError::Api {
                status: 503,
                message: "unreachable".to_string(),
            })
        }

        async fn query_task_execution(
            &self,
            _worker: &FleetWorker,
            _execution_id: &str,
        ) -> Result<ExecutionReport, WorkerClientError> {
            Err(WorkerClientError::Api {
                status: 503,
                message: "unreachable".to_string(),
            })
        }
    }

    fn test_worker() -> FleetWorker {
        FleetWorker {
            id: "w1".to_string(),
            name: "worker-1".to_string(),
            address: "127.0.0.1:4001".to_string(),
            work_unit_capacity: 4,
            availability: WorkerAvailability::Available,
            in_scheduler_pool: true,
        }
    }

    #[test]
    fn test_communication_error_classification() {
        let api_500 = WorkerClientError::Api {
            status: 503,
            message: String::new(),
        };
        assert!(api_500.is_communication());

        let api_400 = WorkerClientError::Api {
            status: 404,
            message: String::new(),
        };
        assert!(!api_400.is_communication());

        assert!(!WorkerClientError::InvalidResponse("bad json".to_string()).is_communication());
    }

    #[tokio::test]
    async fn test_communication_failure_demotes_worker() {
        let catalog = Arc::new(MemoryCatalog::new());
        catalog.insert_worker(test_worker()).await;

        let fleet = FleetClient::new(Arc::new(FailingClient), catalog.clone());
        let worker = test_worker();

        let result = fleet.query_task_execution(&worker, "exec-1").await;
        assert!(result.is_err());

        let stored = catalog.worker("w1").await.unwrap().unwrap();
        assert_eq!(stored.availability, WorkerAvailability::Unavailable);
    }

    #[test]
    fn test_execution_report_deserializes_without_completion() {
        let report: ExecutionReport =
            serde_json::from_str(r#"{"id":"e1","execution_status":"running"}"#).unwrap();
        assert_eq!(report.execution_status, ExecutionStatus::Running);
        assert_eq!(report.completion_status, None);
    }
}
