use async_trait::async_trait;
use common::api::ClusterSnapshot;
use tracing::{debug, info};

use super::{ConfigConsumer, ConsumerError};

pub const NAME: &str = "log";
pub const REQUIRED_KEYS: &[&str] = &[];

/// Logs a summary line per routed service.
#[derive(Debug, Default)]
pub struct LogConsumer;

#[async_trait]
impl ConfigConsumer for LogConsumer {
    fn name(&self) -> &'static str {
        NAME
    }

    fn required_config_keys(&self) -> &'static [&'static str] {
        REQUIRED_KEYS
    }

    async fn update_conf(&self, snapshot: &ClusterSnapshot) -> Result<(), ConsumerError> {
        info!(
            services = snapshot.service_count(),
            nodes = snapshot.node_count(),
            "routing snapshot updated"
        );
        for service in snapshot.services.values() {
            let nodes: Vec<&str> = snapshot
                .nodes_for(service)
                .map(|node| node.name.as_str())
                .collect();
            for constraint in &service.constraints {
                info!(
                    service = %service.name,
                    order = constraint.order,
                    port = constraint.port,
                    external_port = constraint.external_port,
                    domains = ?constraint.domains,
                    paths = ?constraint.paths,
                    authents = ?constraint.authents,
                    nodes = ?nodes,
                    "route"
                );
            }
        }
        Ok(())
    }

    async fn stop(&self) -> Result<(), ConsumerError> {
        debug!("log consumer idle");
        Ok(())
    }
}
