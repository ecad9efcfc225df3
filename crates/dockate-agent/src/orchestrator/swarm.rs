use async_trait::async_trait;
use common::api::{RawNode, RawService};
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::ssh::{SshSession, SshTarget, sh_quote};
use super::{Orchestrator, OrchestratorError, TaskRow, parse_node_ps};
use crate::{config, telemetry};

/// Swarm manager access: the Engine HTTP API for inventory, SSH for
/// per-node task lists.
pub struct SwarmClient {
    base_url: String,
    http: reqwest::Client,
    target: SshTarget,
    // Held for the whole remote call so commands never interleave.
    session: Mutex<Option<SshSession>>,
}

impl SwarmClient {
    pub fn new(base_url: impl Into<String>, http: reqwest::Client, target: SshTarget) -> Self {
        Self {
            base_url: base_url.into(),
            http,
            target,
            session: Mutex::new(None),
        }
    }

    pub fn from_config(cfg: &config::AppConfig) -> anyhow::Result<Self> {
        let http = crate::build_client(cfg)?;
        Ok(Self::new(
            cfg.orchestrator_url(),
            http,
            SshTarget::from_config(cfg),
        ))
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, OrchestratorError> {
        let url = self.url(path);
        let res = self.http.get(&url).send().await.map_err(|source| {
            warn!(%url, error = %source, "orchestrator request failed");
            OrchestratorError::Transport {
                url: url.clone(),
                source,
            }
        })?;

        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            warn!(%url, %status, error = %body, "orchestrator returned error");
            return Err(OrchestratorError::Response { url, status, body });
        }

        let body = res.bytes().await.map_err(|source| OrchestratorError::Transport {
            url: url.clone(),
            source,
        })?;
        debug!(%url, %status, body = %String::from_utf8_lossy(&body), "orchestrator response");
        serde_json::from_slice(&body).map_err(|source| OrchestratorError::Decode { url, source })
    }

    async fn run_node_ps(&self, node_id: &str) -> Result<String, OrchestratorError> {
        let command = format!("docker node ps {}", sh_quote(node_id));
        let mut guard = self.session.lock().await;
        // The session stays in the slot while the command runs, so a
        // cancelled call still leaves it for `stop` to close.
        let session = match &mut *guard {
            Some(session) => session,
            slot => slot.insert(SshSession::open(&self.target).await?),
        };
        session.exec(&command).await
    }
}

fn observe<T>(
    operation: &'static str,
    result: Result<T, OrchestratorError>,
) -> Result<T, OrchestratorError> {
    let outcome = match &result {
        Ok(_) => "success",
        Err(err) => err.kind(),
    };
    telemetry::record_orchestrator_request(operation, outcome);
    result
}

#[async_trait]
impl Orchestrator for SwarmClient {
    async fn list_nodes(&self) -> Result<Vec<RawNode>, OrchestratorError> {
        observe("list_nodes", self.get_json("/nodes").await)
    }

    async fn list_services(&self) -> Result<Vec<RawService>, OrchestratorError> {
        observe("list_services", self.get_json("/services").await)
    }

    async fn list_tasks(&self, node_id: &str) -> Result<Vec<TaskRow>, OrchestratorError> {
        let result = match self.run_node_ps(node_id).await {
            Ok(output) => parse_node_ps(&output).map_err(|source| OrchestratorError::Table {
                node_id: node_id.to_string(),
                source,
            }),
            Err(err) => Err(err),
        };
        observe("list_tasks", result)
    }

    async fn stop(&self) -> Result<(), OrchestratorError> {
        let session = self.session.lock().await.take();
        match session {
            Some(session) => session.close().await,
            None => Ok(()),
        }
    }
}
