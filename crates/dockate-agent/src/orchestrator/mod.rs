use std::time::Duration;

use async_trait::async_trait;
use common::api::{RawNode, RawService};
use thiserror::Error;

use crate::table::{self, TableError, TableRecord};

pub mod ssh;
pub mod swarm;

pub use swarm::SwarmClient;

pub type DynOrchestrator = std::sync::Arc<dyn Orchestrator>;

/// Columns of `docker node ps`, in header order.
pub const NODE_PS_COLUMNS: [&str; 8] = [
    "ID",
    "NAME",
    "IMAGE",
    "NODE",
    "DESIRED STATE",
    "CURRENT STATE",
    "ERROR",
    "PORTS",
];

pub const DESIRED_RUNNING: &str = "Running";

#[async_trait]
pub trait Orchestrator: Send + Sync {
    async fn list_nodes(&self) -> Result<Vec<RawNode>, OrchestratorError>;
    async fn list_services(&self) -> Result<Vec<RawService>, OrchestratorError>;
    /// Tasks scheduled on `node_id`, reusing the remote command session.
    async fn list_tasks(&self, node_id: &str) -> Result<Vec<TaskRow>, OrchestratorError>;
    /// Releases the remote command session; a no-op when none is open.
    async fn stop(&self) -> Result<(), OrchestratorError>;
}

/// One row of `docker node ps`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskRow {
    pub id: String,
    pub name: String,
    pub image: String,
    pub node: String,
    pub desired_state: String,
    pub current_state: String,
    pub error: String,
    pub ports: String,
}

impl TaskRow {
    fn from_record(record: &TableRecord) -> Self {
        Self {
            id: record.get("ID").to_string(),
            name: record.get("NAME").to_string(),
            image: record.get("IMAGE").to_string(),
            node: record.get("NODE").to_string(),
            desired_state: record.get("DESIRED STATE").to_string(),
            current_state: record.get("CURRENT STATE").to_string(),
            error: record.get("ERROR").to_string(),
            ports: record.get("PORTS").to_string(),
        }
    }

    pub fn is_desired_running(&self) -> bool {
        self.desired_state == DESIRED_RUNNING
    }
}

/// Parses `docker node ps` output.
///
/// Some SSH targets print banner/motd text before the command output, so
/// everything above the header line is skipped.
pub fn parse_node_ps(output: &str) -> Result<Vec<TaskRow>, TableError> {
    let start = output
        .lines()
        .position(|line| line.starts_with("ID") && line.contains("DESIRED STATE"))
        .unwrap_or(0);
    let body = output.lines().skip(start).collect::<Vec<_>>().join("\n");
    let rows = table::parse_table(&NODE_PS_COLUMNS, &body)?;
    Ok(rows.iter().map(TaskRow::from_record).collect())
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} returned {status}: {body}")]
    Response {
        url: String,
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("failed to decode response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to open ssh session to {destination}: {message}")]
    Session {
        destination: String,
        message: String,
    },
    #[error("remote command `{command}` failed on {destination} (status {status}): {stderr}")]
    Command {
        destination: String,
        command: String,
        status: String,
        stderr: String,
    },
    #[error("remote command `{command}` timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },
    #[error("failed to run ssh: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("failed to parse task list of node {node_id}: {source}")]
    Table {
        node_id: String,
        #[source]
        source: TableError,
    },
}

impl OrchestratorError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transport { .. } | Self::Spawn(_) => "transport",
            Self::Response { .. } => "response",
            Self::Decode { .. } | Self::Table { .. } => "decode",
            Self::Session { .. } => "session",
            Self::Command { .. } => "command",
            Self::Timeout { .. } => "timeout",
        }
    }
}
