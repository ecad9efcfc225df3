//! Shared DTOs used by the agent and by configuration consumers.
//!
//! The `Raw*` types mirror the subset of the Docker Engine swarm API the agent
//! reads (`GET /nodes`, `GET /services`). Field names on the wire are
//! PascalCase; anything optional or absent deserializes to an empty value.
//! The snapshot types describe the reconciled topology handed to consumers.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

/// Node as reported by `GET /nodes`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct RawNode {
    /// Stable node identifier.
    #[serde(rename = "ID")]
    pub id: String,
    /// Operator-controlled node metadata.
    #[serde(default)]
    pub spec: NodeSpec,
    /// Engine-reported description of the host.
    #[serde(default)]
    pub description: NodeDescription,
    /// Current reachability of the node.
    #[serde(default)]
    pub status: NodeStatus,
}

impl RawNode {
    /// Hostname reported by the node's engine.
    pub fn hostname(&self) -> &str {
        &self.description.hostname
    }

    /// Address the node is reachable on.
    pub fn addr(&self) -> &str {
        &self.status.addr
    }
}

/// Operator-controlled node metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct NodeSpec {
    /// Node labels.
    #[serde(default)]
    pub labels: HashMap<String, String>,
    /// `manager` or `worker`.
    #[serde(default)]
    pub role: Option<String>,
    /// `active`, `pause` or `drain`.
    #[serde(default)]
    pub availability: Option<String>,
}

/// Engine-reported host description.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct NodeDescription {
    /// Hostname of the node.
    #[serde(default)]
    pub hostname: String,
}

/// Node reachability.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct NodeStatus {
    /// `ready`, `down`, ...
    #[serde(default)]
    pub state: Option<String>,
    /// Reachable address of the node.
    #[serde(default)]
    pub addr: String,
}

/// Service as reported by `GET /services`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct RawService {
    /// Stable service identifier.
    #[serde(rename = "ID", default)]
    pub id: String,
    /// Declared service specification.
    pub spec: ServiceSpec,
    /// Runtime endpoint state (published ports and virtual IPs).
    #[serde(default)]
    pub endpoint: ServiceEndpoint,
}

impl RawService {
    /// Unique service name.
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// Container labels carrying the routing grammar.
    pub fn labels(&self) -> &HashMap<String, String> {
        &self.spec.task_template.container_spec.labels
    }

    /// Container ports that have an endpoint entry.
    pub fn target_ports(&self) -> Vec<u16> {
        self.endpoint.ports.iter().map(|p| p.target_port).collect()
    }

    /// Published port for the given container port, if one is published.
    pub fn published_port_for(&self, target_port: u16) -> Option<u16> {
        self.endpoint
            .ports
            .iter()
            .find(|p| p.target_port == target_port)
            .and_then(|p| p.published_port)
    }

    /// Addresses of the virtual IPs currently assigned to the service.
    pub fn virtual_ip_addrs(&self) -> impl Iterator<Item = &str> {
        self.endpoint.virtual_ips.iter().map(|vip| vip.addr.as_str())
    }
}

/// Declared service specification.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct ServiceSpec {
    /// Unique service name.
    pub name: String,
    /// Service-level labels (not used for routing).
    #[serde(default)]
    pub labels: HashMap<String, String>,
    /// Template used for the service's tasks.
    #[serde(default)]
    pub task_template: TaskTemplate,
}

/// Task template of a service.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct TaskTemplate {
    /// Container specification shared by every task.
    #[serde(default)]
    pub container_spec: ContainerSpec,
}

/// Container specification of a task template.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerSpec {
    /// Image reference.
    #[serde(default)]
    pub image: Option<String>,
    /// Container labels.
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

/// Runtime endpoint state of a service.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct ServiceEndpoint {
    /// Published ports.
    #[serde(default)]
    pub ports: Vec<EndpointPort>,
    /// Virtual IPs assigned on each attached network.
    #[serde(rename = "VirtualIPs", default)]
    pub virtual_ips: Vec<VirtualIp>,
}

/// One published port of a service endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct EndpointPort {
    /// `tcp`, `udp` or `sctp`.
    #[serde(default)]
    pub protocol: Option<String>,
    /// Port inside the container.
    pub target_port: u16,
    /// Port published on the routing mesh.
    #[serde(default)]
    pub published_port: Option<u16>,
    /// `ingress` or `host`.
    #[serde(default)]
    pub publish_mode: Option<String>,
}

/// Virtual IP of a service on one network.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct VirtualIp {
    /// Network the address belongs to.
    #[serde(rename = "NetworkID", default)]
    pub network_id: String,
    /// Address in CIDR notation.
    pub addr: String,
}

/// One routing rule derived from service labels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingConstraint {
    /// Label level the constraint was declared at; also its sort key.
    pub order: u32,
    /// Container (internal) port.
    pub port: u16,
    /// Published (external) port the proxy should forward to.
    pub external_port: u16,
    /// Host names routed to the service.
    pub domains: Vec<String>,
    /// Path prefixes routed to the service.
    pub paths: Vec<String>,
    /// Authentication policy identifiers.
    pub authents: Vec<String>,
}

/// Reconciled service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEntry {
    /// Unique service name.
    pub name: String,
    /// Internal to external port mapping.
    pub ports: BTreeMap<u16, u16>,
    /// Routing constraints, ascending by `order`.
    pub constraints: Vec<RoutingConstraint>,
    /// Virtual IP addresses of the service.
    pub virtual_ips: BTreeSet<String>,
    /// IDs of the nodes running a task of the service, one entry per task.
    pub nodes: Vec<String>,
}

/// Reconciled node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeEntry {
    /// Stable node identifier.
    pub id: String,
    /// Hostname.
    pub name: String,
    /// Reachable address.
    pub addr: String,
    /// Names of the services running on the node, one entry per task.
    pub services: Vec<String>,
}

/// Topology produced by one successful recomputation.
///
/// Node and service entries reference each other by key; both sides are
/// built together and discarded together.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterSnapshot {
    /// Every node reported by the orchestrator, in API order.
    pub nodes: Vec<NodeEntry>,
    /// Routable services keyed by name.
    pub services: BTreeMap<String, ServiceEntry>,
}

impl ClusterSnapshot {
    /// Number of routable services.
    pub fn service_count(&self) -> usize {
        self.services.len()
    }

    /// Number of nodes.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Looks up a service by name.
    pub fn service(&self, name: &str) -> Option<&ServiceEntry> {
        self.services.get(name)
    }

    /// Looks up a node by ID.
    pub fn node(&self, id: &str) -> Option<&NodeEntry> {
        self.nodes.iter().find(|node| node.id == id)
    }

    /// Nodes a service has tasks on, one entry per task.
    pub fn nodes_for<'a>(&'a self, service: &'a ServiceEntry) -> impl Iterator<Item = &'a NodeEntry> {
        service.nodes.iter().filter_map(|id| self.node(id))
    }

    /// Services running on a node, one entry per task.
    pub fn services_on<'a>(&'a self, node: &'a NodeEntry) -> impl Iterator<Item = &'a ServiceEntry> {
        node.services.iter().filter_map(|name| self.service(name))
    }
}
