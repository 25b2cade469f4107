//! Child-process stage workers
//!
//! A stage worker can run in its own process for fault isolation. The hub
//! spawns `tp stage-worker <stage-id>` and speaks a line-delimited JSON
//! control protocol over the child's stdin/stdout: one request line out,
//! one response line back. The child side wraps a [`LocalStageWorker`]
//! handle, so process-mode and in-process workers share the same loop.

use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use eyre::{eyre, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use tilestore::{PlaneTileStatus, StatusCounts};

use crate::scheduler::handle::{LocalStageWorker, StageWorkerHandle};

/// Control messages sent to a stage worker process, one JSON line each.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ControlRequest {
    SetProcessing { on: bool },
    PlaneStatus { plane: i64 },
    StatusCounts,
    Exit,
}

/// One JSON-line reply per request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ControlResponse {
    Ack,
    Plane { tiles: Vec<PlaneTileStatus> },
    Counts { counts: StatusCounts },
    Error { message: String },
}

struct ChildIo {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

/// Hub-side handle to a stage worker running as a child process.
pub struct ChildStageWorker {
    stage_id: String,
    io: Mutex<ChildIo>,
    last_processing: AtomicBool,
}

impl ChildStageWorker {
    /// Spawn `tp stage-worker <stage-id>` with piped control streams.
    pub fn spawn(stage_id: &str, config: Option<&Path>) -> Result<Self> {
        let exe = std::env::current_exe()?;
        let mut command = Command::new(exe);
        command.arg("stage-worker").arg(stage_id);
        if let Some(path) = config {
            command.arg("--config").arg(path);
        }
        command.stdin(Stdio::piped()).stdout(Stdio::piped()).stderr(Stdio::inherit());

        let mut child = command.spawn()?;
        let stdin = child.stdin.take().ok_or_else(|| eyre!("stage worker process has no stdin"))?;
        let stdout = child
            .stdout
            .take()
            .map(BufReader::new)
            .ok_or_else(|| eyre!("stage worker process has no stdout"))?;

        debug!(stage_id, "spawned stage worker process");
        Ok(Self {
            stage_id: stage_id.to_string(),
            io: Mutex::new(ChildIo { child, stdin, stdout }),
            last_processing: AtomicBool::new(false),
        })
    }

    /// Write one request line and read the matching response line. The io
    /// lock serializes request/response pairs.
    async fn request(&self, request: &ControlRequest) -> Result<ControlResponse> {
        let mut io = self.io.lock().await;

        let mut line = serde_json::to_string(request)?;
        line.push('\n');
        io.stdin.write_all(line.as_bytes()).await?;
        io.stdin.flush().await?;

        let mut reply = String::new();
        let read = io.stdout.read_line(&mut reply).await?;
        if read == 0 {
            return Err(eyre!("stage worker process closed its control stream"));
        }
        Ok(serde_json::from_str(reply.trim())?)
    }
}

#[async_trait]
impl StageWorkerHandle for ChildStageWorker {
    async fn request_exit(&self) {
        if let Err(err) = self.request(&ControlRequest::Exit).await {
            warn!(stage = %self.stage_id, error = %err, "exit request failed, killing worker process");
            let mut io = self.io.lock().await;
            let _ = io.child.start_kill();
        }
    }

    async fn set_processing_requested(&self, on: bool) {
        match self.request(&ControlRequest::SetProcessing { on }).await {
            Ok(_) => self.last_processing.store(on, Ordering::SeqCst),
            Err(err) => warn!(stage = %self.stage_id, error = %err, "failed to push processing flag"),
        }
    }

    fn processing_requested(&self) -> bool {
        self.last_processing.load(Ordering::SeqCst)
    }

    async fn plane_status(&self, plane: i64) -> Vec<PlaneTileStatus> {
        match self.request(&ControlRequest::PlaneStatus { plane }).await {
            Ok(ControlResponse::Plane { tiles }) => tiles,
            Ok(other) => {
                warn!(stage = %self.stage_id, ?other, "unexpected plane status response");
                Vec::new()
            }
            Err(err) => {
                warn!(stage = %self.stage_id, error = %err, "plane status request failed");
                Vec::new()
            }
        }
    }

    async fn status_counts(&self) -> StatusCounts {
        match self.request(&ControlRequest::StatusCounts).await {
            Ok(ControlResponse::Counts { counts }) => counts,
            Ok(other) => {
                warn!(stage = %self.stage_id, ?other, "unexpected status counts response");
                StatusCounts::default()
            }
            Err(err) => {
                warn!(stage = %self.stage_id, error = %err, "status counts request failed");
                StatusCounts::default()
            }
        }
    }
}

/// Child-process side: bridge control requests from stdin to the local
/// worker handle, one response line per request. Returns once an Exit
/// request has been acknowledged or stdin closes.
pub async fn serve_stage_worker(handle: LocalStageWorker) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let mut exit = false;
        let response = match serde_json::from_str::<ControlRequest>(line) {
            Ok(ControlRequest::SetProcessing { on }) => {
                handle.set_processing_requested(on).await;
                ControlResponse::Ack
            }
            Ok(ControlRequest::PlaneStatus { plane }) => ControlResponse::Plane {
                tiles: handle.plane_status(plane).await,
            },
            Ok(ControlRequest::StatusCounts) => ControlResponse::Counts {
                counts: handle.status_counts().await,
            },
            Ok(ControlRequest::Exit) => {
                handle.request_exit().await;
                exit = true;
                ControlResponse::Ack
            }
            Err(err) => ControlResponse::Error {
                message: err.to_string(),
            },
        };

        let mut reply = serde_json::to_string(&response)?;
        reply.push('\n');
        stdout.write_all(reply.as_bytes()).await?;
        stdout.flush().await?;

        if exit {
            break;
        }
    }
    Ok(())
}
