//! Fleet - worker capacity tracking and the remote worker RPC boundary

mod client;
mod registry;

pub use client::{
    CompletionStatus, ExecutionReport, ExecutionStatus, FleetClient, HttpWorkerClient, TaskExecution, WorkerClient,
    WorkerClientError,
};
pub use registry::WorkerRegistry;
