//! Builds the routing snapshot from node, service and task inventories.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap, HashSet};

use common::api::{
    ClusterSnapshot, NodeEntry, RawNode, RawService, RoutingConstraint, ServiceEntry,
};
use tracing::{debug, warn};

use crate::constraints;
use crate::orchestrator::TaskRow;
use crate::telemetry;

/// Task list of one node, as returned by the orchestrator.
#[derive(Debug, Clone, Default)]
pub struct NodeTasks {
    pub node_id: String,
    pub tasks: Vec<TaskRow>,
}

/// Service owning a container: `web.3` belongs to `web`. Only a single-digit
/// replica suffix is stripped, so `web.33` is taken verbatim.
pub fn service_name_for_container(container: &str) -> &str {
    let bytes = container.as_bytes();
    match bytes {
        [.., b'.', digit] if digit.is_ascii_digit() && bytes.len() > 2 => {
            &container[..container.len() - 2]
        }
        _ => container,
    }
}

/// Assembles a snapshot. `tasks` must follow the order of `nodes` so the
/// result does not depend on which task list arrived first.
pub fn build_snapshot(
    nodes: &[RawNode],
    services: &[RawService],
    tasks: &[NodeTasks],
) -> ClusterSnapshot {
    let services_by_name: HashMap<&str, &RawService> =
        services.iter().map(|svc| (svc.name(), svc)).collect();

    let mut node_entries: Vec<NodeEntry> = nodes
        .iter()
        .map(|node| NodeEntry {
            id: node.id.clone(),
            name: node.hostname().to_string(),
            addr: node.addr().to_string(),
            services: Vec::new(),
        })
        .collect();
    let node_index: HashMap<String, usize> = node_entries
        .iter()
        .enumerate()
        .map(|(idx, node)| (node.id.clone(), idx))
        .collect();

    let mut entries: BTreeMap<String, ServiceEntry> = BTreeMap::new();
    let mut excluded: HashSet<String> = HashSet::new();

    for node_tasks in tasks {
        let Some(&idx) = node_index.get(&node_tasks.node_id) else {
            warn!(node_id = %node_tasks.node_id, "ignoring tasks of unknown node");
            continue;
        };

        for task in node_tasks.tasks.iter().filter(|t| t.is_desired_running()) {
            let name = service_name_for_container(&task.name);
            let Some(service) = services_by_name.get(name) else {
                warn!(
                    node_id = %node_tasks.node_id,
                    task = %task.name,
                    "task has no matching service"
                );
                telemetry::record_orphan_task();
                continue;
            };
            if excluded.contains(name) {
                continue;
            }

            let entry = match entries.entry(name.to_string()) {
                Entry::Occupied(entry) => entry.into_mut(),
                Entry::Vacant(slot) => match service_entry(service) {
                    Some(entry) => slot.insert(entry),
                    None => {
                        excluded.insert(name.to_string());
                        continue;
                    }
                },
            };
            entry.nodes.push(node_tasks.node_id.clone());
            node_entries[idx].services.push(name.to_string());
        }
    }

    ClusterSnapshot {
        nodes: node_entries,
        services: entries,
    }
}

fn service_entry(service: &RawService) -> Option<ServiceEntry> {
    let name = service.name();
    let mut resolved: Vec<RoutingConstraint> = Vec::new();
    for constraint in constraints::extract_constraints(name, service.labels()) {
        let Some(external_port) = service.published_port_for(constraint.port) else {
            warn!(
                service = name,
                level = constraint.order,
                port = constraint.port,
                endpoint_ports = ?service.target_ports(),
                "dropping routing constraint without a published port"
            );
            telemetry::record_constraint_dropped("no_published_port");
            continue;
        };
        resolved.push(RoutingConstraint {
            order: constraint.order,
            port: constraint.port,
            external_port,
            domains: constraint.domains,
            paths: constraint.paths,
            authents: constraint.authents,
        });
    }

    if resolved.is_empty() {
        debug!(service = name, "service has no routable constraint");
        return None;
    }
    resolved.sort_by_key(|c| c.order);

    Some(ServiceEntry {
        name: name.to_string(),
        ports: resolved
            .iter()
            .map(|c| (c.port, c.external_port))
            .collect(),
        constraints: resolved,
        virtual_ips: service.virtual_ip_addrs().map(str::to_string).collect(),
        nodes: Vec::new(),
    })
}
