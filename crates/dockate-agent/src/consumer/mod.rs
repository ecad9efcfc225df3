//! Destinations for published snapshots.
//!
//! Consumers are selected by name from a fixed registry. Each declares the
//! `consumer_settings` keys it needs so startup can fail before the first
//! cycle when one is missing.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::api::ClusterSnapshot;
use serde::Serialize;
use thiserror::Error;

use crate::config::AppConfig;

pub mod file;
pub mod log;
pub mod webhook;

pub use file::FileConsumer;
pub use log::LogConsumer;
pub use webhook::WebhookConsumer;

pub type DynConsumer = Arc<dyn ConfigConsumer>;

#[async_trait]
pub trait ConfigConsumer: Send + Sync {
    fn name(&self) -> &'static str;

    /// `consumer_settings` keys that must be present at startup.
    fn required_config_keys(&self) -> &'static [&'static str];

    /// Receives every freshly computed snapshot.
    async fn update_conf(&self, snapshot: &ClusterSnapshot) -> Result<(), ConsumerError>;

    /// Called after each successful `update_conf`.
    async fn stop(&self) -> Result<(), ConsumerError>;
}

#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("failed to serialize snapshot: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} rejected snapshot with {status}: {body}")]
    Rejected {
        url: String,
        status: reqwest::StatusCode,
        body: String,
    },
}

/// JSON document handed to file and webhook consumers.
#[derive(Debug, Serialize)]
pub struct SnapshotEnvelope<'a> {
    pub generated_at: DateTime<Utc>,
    pub agent_version: &'static str,
    pub snapshot: &'a ClusterSnapshot,
}

impl<'a> SnapshotEnvelope<'a> {
    pub fn new(snapshot: &'a ClusterSnapshot) -> Self {
        Self {
            generated_at: Utc::now(),
            agent_version: crate::VERSION,
            snapshot,
        }
    }
}

const REGISTRY: &[(&str, &[&str])] = &[
    (log::NAME, log::REQUIRED_KEYS),
    (file::NAME, file::REQUIRED_KEYS),
    (webhook::NAME, webhook::REQUIRED_KEYS),
];

/// Settings keys the named consumer needs, `None` for unknown names.
pub fn required_config_keys(name: &str) -> Option<&'static [&'static str]> {
    REGISTRY
        .iter()
        .find(|(registered, _)| *registered == name)
        .map(|(_, keys)| *keys)
}

/// Validates the consumer settings and builds the configured consumer.
pub fn build_consumer(cfg: &AppConfig) -> anyhow::Result<DynConsumer> {
    let name = cfg.consumer.as_str();
    let Some(keys) = required_config_keys(name) else {
        let known: Vec<&str> = REGISTRY.iter().map(|(name, _)| *name).collect();
        anyhow::bail!(
            "unknown consumer {:?}; expected one of: {}",
            name,
            known.join(", ")
        );
    };
    cfg.check_consumer_settings(keys)?;

    let consumer: DynConsumer = match name {
        file::NAME => Arc::new(FileConsumer::from_settings(&cfg.consumer_settings)),
        webhook::NAME => Arc::new(WebhookConsumer::from_config(cfg)?),
        log::NAME => Arc::new(LogConsumer),
        other => anyhow::bail!("consumer {other:?} is registered but has no constructor"),
    };
    Ok(consumer)
}
