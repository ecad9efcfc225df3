//! Polling loop: check for changes, recompute the snapshot when needed and
//! hand it to the consumer.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use common::api::ClusterSnapshot;
use futures_util::future::try_join_all;
use tokio::sync::watch;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::change::{self, Decision};
use crate::config::AppConfig;
use crate::consumer::DynConsumer;
use crate::orchestrator::{DynOrchestrator, OrchestratorError};
use crate::telemetry;
use crate::topology::{self, NodeTasks};

/// Last successfully published snapshot.
#[derive(Debug, Clone, Default)]
pub enum LastKnown {
    #[default]
    Unknown,
    Snapshot(Arc<ClusterSnapshot>),
}

impl LastKnown {
    pub fn snapshot(&self) -> Option<&ClusterSnapshot> {
        match self {
            Self::Unknown => None,
            Self::Snapshot(snapshot) => Some(snapshot.as_ref()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Unchanged,
    Published,
}

impl CycleOutcome {
    pub(crate) fn label(&self) -> &'static str {
        match self {
            CycleOutcome::Unchanged => "skipped",
            CycleOutcome::Published => "published",
        }
    }
}

pub struct Scheduler {
    client: DynOrchestrator,
    consumer: DynConsumer,
    last: LastKnown,
    interval: Option<Duration>,
    cycle_timeout: Duration,
}

impl Scheduler {
    /// `interval` of `None` runs a single cycle.
    pub fn new(
        client: DynOrchestrator,
        consumer: DynConsumer,
        interval: Option<Duration>,
        cycle_timeout: Duration,
    ) -> Self {
        Self {
            client,
            consumer,
            last: LastKnown::Unknown,
            interval,
            cycle_timeout,
        }
    }

    pub fn from_config(cfg: &AppConfig, client: DynOrchestrator, consumer: DynConsumer) -> Self {
        Self::new(client, consumer, cfg.check_interval(), cfg.cycle_timeout())
    }

    pub fn last_known(&self) -> &LastKnown {
        &self.last
    }

    /// Runs one bounded cycle. A failure resets the last snapshot and
    /// releases the remote session so the next cycle starts clean.
    pub async fn run_cycle(&mut self) -> anyhow::Result<CycleOutcome> {
        let started = Instant::now();
        let timeout = self.cycle_timeout;
        let result = match tokio::time::timeout(timeout, self.cycle()).await {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!("cycle did not finish within {timeout:?}")),
        };

        let label = match &result {
            Ok(outcome) => outcome.label(),
            Err(err) => {
                warn!(error = %format!("{err:#}"), "cycle failed; last snapshot discarded");
                self.last = LastKnown::Unknown;
                if let Err(stop_err) = self.client.stop().await {
                    warn!(error = %stop_err, "failed to release orchestrator session");
                }
                "failed"
            }
        };
        telemetry::record_cycle_result(label);
        telemetry::record_cycle_duration(label, started.elapsed());
        result
    }

    async fn cycle(&mut self) -> anyhow::Result<CycleOutcome> {
        let decision = change::check(self.client.as_ref(), self.last.snapshot())
            .await
            .context("checking services for changes")?;
        let reason = match decision {
            Decision::Unchanged => {
                debug!("routing unchanged");
                return Ok(CycleOutcome::Unchanged);
            }
            Decision::Recompute(reason) => reason,
        };
        info!(%reason, "recomputing routing snapshot");

        let snapshot = Arc::new(self.recompute().await?);
        self.last = LastKnown::Snapshot(snapshot.clone());
        telemetry::record_snapshot(snapshot.service_count(), snapshot.node_count());

        self.consumer
            .update_conf(&snapshot)
            .await
            .with_context(|| format!("{} consumer failed to apply snapshot", self.consumer.name()))?;
        self.consumer
            .stop()
            .await
            .with_context(|| format!("{} consumer failed to stop", self.consumer.name()))?;

        info!(
            services = snapshot.service_count(),
            nodes = snapshot.node_count(),
            consumer = self.consumer.name(),
            "routing snapshot published"
        );
        Ok(CycleOutcome::Published)
    }

    async fn recompute(&self) -> anyhow::Result<ClusterSnapshot> {
        let client = self.client.as_ref();
        let (nodes, services) = tokio::try_join!(client.list_nodes(), client.list_services())
            .context("listing nodes and services")?;
        debug!(
            nodes = ?nodes.iter().map(|n| n.id.as_str()).collect::<Vec<_>>(),
            services = ?services.iter().map(|s| s.name()).collect::<Vec<_>>(),
            "orchestrator inventory"
        );

        let tasks = try_join_all(nodes.iter().map(|node| async move {
            let tasks = client.list_tasks(&node.id).await?;
            debug!(node_id = %node.id, tasks = tasks.len(), "node tasks");
            Ok::<_, OrchestratorError>(NodeTasks {
                node_id: node.id.clone(),
                tasks,
            })
        }))
        .await
        .context("listing node tasks")?;

        let snapshot = topology::build_snapshot(&nodes, &services, &tasks);
        client.stop().await.context("releasing orchestrator session")?;
        Ok(snapshot)
    }

    /// Runs cycles until shutdown is requested, or once when no interval is
    /// configured.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let mut cycle: u64 = 0;
        loop {
            if *shutdown.borrow() {
                break;
            }
            cycle += 1;

            let span = info_span!("cycle", cycle);
            tokio::select! {
                _ = shutdown.changed() => {
                    info!(cycle, "shutdown requested during cycle");
                    break;
                }
                _ = self.run_cycle().instrument(span) => {}
            }

            let Some(interval) = self.interval else {
                info!("check interval is not positive; scheduler finished");
                break;
            };
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }

        if let Err(err) = self.client.stop().await {
            warn!(error = %err, "failed to release orchestrator session on exit");
        }
        Ok(())
    }
}
