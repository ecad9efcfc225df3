use dockate_agent::{config, runner, telemetry};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init_tracing();
    let cfg = config::load()?;

    let agent = runner::start_agent(
        cfg,
        runner::AgentOptions {
            init_tracing: false,
            ..Default::default()
        },
    )
    .await?;

    tokio::select! {
        _ = runner::wait_for_shutdown_signal() => {
            info!("shutdown signal received, stopping agent");
        }
        _ = agent.scheduler_finished() => {
            info!("scheduler finished, stopping agent");
        }
    }

    agent.shutdown().await
}
