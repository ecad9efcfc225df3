use std::fmt;

use common::api::{ClusterSnapshot, RawService};
use tracing::debug;

use crate::constraints;
use crate::orchestrator::{Orchestrator, OrchestratorError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Unchanged,
    Recompute(RecomputeReason),
}

impl Decision {
    pub fn needs_recompute(&self) -> bool {
        matches!(self, Self::Recompute(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecomputeReason {
    NoSnapshot,
    NewService(String),
    VirtualIpCount {
        service: String,
        current: usize,
        previous: usize,
    },
    VirtualIpChanged {
        service: String,
        addr: String,
    },
    ServiceCount {
        current: usize,
        previous: usize,
    },
}

impl fmt::Display for RecomputeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoSnapshot => write!(f, "no previous snapshot"),
            Self::NewService(name) => write!(f, "service {name} not in previous snapshot"),
            Self::VirtualIpCount {
                service,
                current,
                previous,
            } => write!(
                f,
                "service {service} has {current} virtual ips, previously {previous}"
            ),
            Self::VirtualIpChanged { service, addr } => {
                write!(f, "service {service} has new virtual ip {addr}")
            }
            Self::ServiceCount { current, previous } => write!(
                f,
                "{current} labeled services, previous snapshot has {previous}"
            ),
        }
    }
}

/// Compares the current service list against the last snapshot.
pub fn detect(previous: Option<&ClusterSnapshot>, services: &[RawService]) -> Decision {
    let Some(previous) = previous else {
        return Decision::Recompute(RecomputeReason::NoSnapshot);
    };

    let mut labeled = 0usize;
    for service in services {
        let name = service.name();
        if !constraints::has_port_label(service.labels()) {
            debug!(service = name, "ignoring service without port label");
            continue;
        }
        labeled += 1;

        let Some(known) = previous.service(name) else {
            return Decision::Recompute(RecomputeReason::NewService(name.to_string()));
        };
        let current = service.endpoint.virtual_ips.len();
        if current != known.virtual_ips.len() {
            return Decision::Recompute(RecomputeReason::VirtualIpCount {
                service: name.to_string(),
                current,
                previous: known.virtual_ips.len(),
            });
        }
        if let Some(addr) = service
            .virtual_ip_addrs()
            .find(|addr| !known.virtual_ips.contains(*addr))
        {
            return Decision::Recompute(RecomputeReason::VirtualIpChanged {
                service: name.to_string(),
                addr: addr.to_string(),
            });
        }
    }

    if labeled != previous.service_count() {
        return Decision::Recompute(RecomputeReason::ServiceCount {
            current: labeled,
            previous: previous.service_count(),
        });
    }
    Decision::Unchanged
}

/// Fetches the service list only when a previous snapshot exists.
pub async fn check(
    client: &dyn Orchestrator,
    previous: Option<&ClusterSnapshot>,
) -> Result<Decision, OrchestratorError> {
    if previous.is_none() {
        return Ok(Decision::Recompute(RecomputeReason::NoSnapshot));
    }
    let services = client.list_services().await?;
    Ok(detect(previous, &services))
}
