use async_trait::async_trait;
use common::api::ClusterSnapshot;
use tracing::{debug, info, warn};

use super::{ConfigConsumer, ConsumerError, SnapshotEnvelope};
use crate::config::AppConfig;

pub const NAME: &str = "webhook";
pub const REQUIRED_KEYS: &[&str] = &["url"];

/// POSTs each snapshot to an HTTP endpoint. An optional `token` setting is
/// sent as a bearer token.
#[derive(Debug, Clone)]
pub struct WebhookConsumer {
    url: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl WebhookConsumer {
    pub fn new(url: impl Into<String>, token: Option<String>, client: reqwest::Client) -> Self {
        Self {
            url: url.into(),
            token,
            client,
        }
    }

    pub fn from_config(cfg: &AppConfig) -> anyhow::Result<Self> {
        let url = cfg
            .consumer_settings
            .get("url")
            .cloned()
            .unwrap_or_default();
        let token = cfg
            .consumer_settings
            .get("token")
            .filter(|token| !token.trim().is_empty())
            .cloned();
        Ok(Self::new(url, token, crate::build_client(cfg)?))
    }
}

#[async_trait]
impl ConfigConsumer for WebhookConsumer {
    fn name(&self) -> &'static str {
        NAME
    }

    fn required_config_keys(&self) -> &'static [&'static str] {
        REQUIRED_KEYS
    }

    async fn update_conf(&self, snapshot: &ClusterSnapshot) -> Result<(), ConsumerError> {
        let mut request = self
            .client
            .post(&self.url)
            .json(&SnapshotEnvelope::new(snapshot));
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let res = request.send().await.map_err(|source| {
            warn!(url = %self.url, error = %source, "webhook request failed");
            ConsumerError::Transport {
                url: self.url.clone(),
                source,
            }
        })?;

        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            warn!(url = %self.url, %status, error = %body, "webhook rejected snapshot");
            return Err(ConsumerError::Rejected {
                url: self.url.clone(),
                status,
                body,
            });
        }

        info!(url = %self.url, %status, services = snapshot.service_count(), "snapshot delivered");
        Ok(())
    }

    async fn stop(&self) -> Result<(), ConsumerError> {
        debug!(url = %self.url, "webhook consumer idle");
        Ok(())
    }
}
