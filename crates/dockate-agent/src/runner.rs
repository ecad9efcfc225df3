use std::{net::SocketAddr, sync::Arc};

use tokio::{sync::watch, task::JoinHandle};
use tracing::{error, info};

use crate::{
    VERSION, config,
    consumer::{self, DynConsumer},
    orchestrator::{DynOrchestrator, SwarmClient},
    scheduler::Scheduler,
    telemetry,
};

/// Controls optional behaviours when starting the agent programmatically.
#[derive(Clone, Debug)]
pub struct AgentOptions {
    /// Initialize a tracing subscriber before starting the agent.
    pub init_tracing: bool,
    /// Start the dedicated `/metrics` HTTP server (also gated by `serve_metrics` in config).
    pub serve_metrics: bool,
    /// Reuse an existing Prometheus recorder instead of installing a new one.
    pub metrics_handle: Option<metrics_exporter_prometheus::PrometheusHandle>,
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self {
            init_tracing: true,
            serve_metrics: true,
            metrics_handle: None,
        }
    }
}

/// Handle returned by [`start_agent`] to manage shutdown when embedded.
pub struct AgentHandle {
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    scheduler_done: watch::Receiver<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl AgentHandle {
    /// Returns a cloneable receiver that fires when shutdown is requested.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    /// Request a graceful shutdown; idempotent.
    pub fn request_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Resolves once the scheduler loop has returned, either after its
    /// single run or after shutdown.
    pub async fn scheduler_finished(&self) {
        let mut done = self.scheduler_done.clone();
        let _ = done.wait_for(|finished| *finished).await;
    }

    /// Wait for all agent tasks to finish.
    pub async fn await_termination(self) -> anyhow::Result<()> {
        for handle in self.tasks {
            if let Err(join_err) = handle.await {
                if join_err.is_panic() {
                    error!(?join_err, "agent task panicked during shutdown");
                    anyhow::bail!("agent task panicked");
                }
            }
        }
        Ok(())
    }

    /// Request shutdown and block until all tasks have stopped.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        self.request_shutdown();
        self.await_termination().await
    }
}

/// Start the agent against the configured swarm manager and consumer.
pub async fn start_agent(cfg: config::AppConfig, options: AgentOptions) -> anyhow::Result<AgentHandle> {
    cfg.validate()?;
    let consumer = consumer::build_consumer(&cfg)?;
    let client: DynOrchestrator = Arc::new(SwarmClient::from_config(&cfg)?);
    start_agent_with(cfg, options, client, consumer).await
}

/// Start the agent with caller-provided orchestrator and consumer.
pub async fn start_agent_with(
    cfg: config::AppConfig,
    mut options: AgentOptions,
    client: DynOrchestrator,
    consumer: DynConsumer,
) -> anyhow::Result<AgentHandle> {
    if options.init_tracing {
        telemetry::init_tracing();
    }

    let metrics_handle = match options.metrics_handle.take() {
        Some(handle) => telemetry::register_metrics_handle(handle),
        None => telemetry::init_metrics_recorder(),
    };
    let metrics_addr: SocketAddr = format!("{}:{}", cfg.metrics_host, cfg.metrics_port)
        .parse()
        .map_err(|err| anyhow::anyhow!("invalid metrics bind address: {}", err))?;

    info!(
        swarm = %cfg.orchestrator_url(),
        ssh_port = cfg.swarm_port_ssh,
        consumer = consumer.name(),
        interval_ms = cfg.interval_between_check_services_ms,
        version = VERSION,
        "dockate agent starting"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (done_tx, scheduler_done) = watch::channel(false);
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    if options.serve_metrics && cfg.serve_metrics {
        let mut shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            let shutdown_fut = async move {
                if *shutdown.borrow() {
                    return;
                }
                let _ = shutdown.changed().await;
            };
            if let Err(err) =
                telemetry::serve_metrics_with_shutdown(metrics_handle, metrics_addr, shutdown_fut)
                    .await
            {
                error!(?err, "metrics server exited with error");
            }
        }));
    }

    let scheduler = Scheduler::from_config(&cfg, client, consumer);
    let scheduler_shutdown = shutdown_rx.clone();
    tasks.push(tokio::spawn(async move {
        if let Err(err) = scheduler.run(scheduler_shutdown).await {
            error!(?err, "scheduler terminated with error");
        }
        let _ = done_tx.send(true);
    }));

    Ok(AgentHandle {
        shutdown_tx,
        shutdown_rx,
        scheduler_done,
        tasks,
    })
}

/// Waits for Ctrl+C or SIGTERM.
pub async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(%err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => stream.recv().await,
            Err(err) => {
                error!(%err, "failed to install SIGTERM handler");
                std::future::pending::<Option<()>>().await
            }
        };
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
