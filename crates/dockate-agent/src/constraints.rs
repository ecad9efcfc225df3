//! Routing constraints declared through `dockate.*` container labels.
//!
//! `dockate.<field>` sets a default on the root level and is never routed on
//! its own. `dockate.<N>.<field>` sets the field for level `N`. Once all
//! labels are bucketed, each level inherits the root fields it left unset and
//! levels that still have no port are dropped.

use std::collections::{BTreeMap, HashMap};

use tracing::{debug, warn};

use crate::telemetry;

pub const LABEL_PREFIX: &str = "dockate";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ConstraintLevel {
    Root,
    Level(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintField {
    Port,
    Domains,
    Paths,
    Authents,
}

impl ConstraintField {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "port" => Some(Self::Port),
            "domains" => Some(Self::Domains),
            "paths" => Some(Self::Paths),
            "authents" => Some(Self::Authents),
            _ => None,
        }
    }
}

/// Splits a label key into its level and field, `None` when the key is not
/// part of the routing grammar.
pub fn parse_label_key(key: &str) -> Option<(ConstraintLevel, ConstraintField)> {
    let rest = key.strip_prefix(LABEL_PREFIX)?.strip_prefix('.')?;
    match rest.split_once('.') {
        None => ConstraintField::parse(rest).map(|field| (ConstraintLevel::Root, field)),
        Some((level, field)) => {
            if level.is_empty() || !level.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            let level = level.parse::<u32>().ok()?;
            let field = ConstraintField::parse(field)?;
            Some((ConstraintLevel::Level(level), field))
        }
    }
}

/// True when any label declares a port, at the root or at a level.
pub fn has_port_label(labels: &HashMap<String, String>) -> bool {
    labels
        .keys()
        .any(|key| matches!(parse_label_key(key), Some((_, ConstraintField::Port))))
}

/// A level constraint after merging, before its external port is resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelConstraint {
    pub order: u32,
    pub port: u16,
    pub domains: Vec<String>,
    pub paths: Vec<String>,
    pub authents: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct ConstraintFields {
    port: Option<u16>,
    domains: Option<Vec<String>>,
    paths: Option<Vec<String>>,
    authents: Option<Vec<String>>,
}

impl ConstraintFields {
    fn set(&mut self, service: &str, key: &str, field: ConstraintField, value: &str) {
        match field {
            ConstraintField::Port => match value.trim().parse::<u16>() {
                Ok(port) => self.port = Some(port),
                Err(_) => {
                    warn!(service, label = key, value, "ignoring non-numeric port label");
                }
            },
            ConstraintField::Domains => self.domains = split_list(value),
            ConstraintField::Paths => self.paths = split_list(value),
            ConstraintField::Authents => self.authents = split_list(value),
        }
    }

    fn inherit(&mut self, root: &ConstraintFields) {
        if self.port.is_none() {
            self.port = root.port;
        }
        if self.domains.is_none() {
            self.domains = root.domains.clone();
        }
        if self.paths.is_none() {
            self.paths = root.paths.clone();
        }
        if self.authents.is_none() {
            self.authents = root.authents.clone();
        }
    }
}

fn split_list(value: &str) -> Option<Vec<String>> {
    if value.trim().is_empty() {
        return None;
    }
    Some(
        value
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(String::from)
            .collect(),
    )
}

/// Extracts the routable level constraints of a service, ascending by level.
pub fn extract_constraints(service: &str, labels: &HashMap<String, String>) -> Vec<LabelConstraint> {
    let mut root: Option<ConstraintFields> = None;
    let mut levels: BTreeMap<u32, ConstraintFields> = BTreeMap::new();

    for (key, value) in labels {
        let Some((level, field)) = parse_label_key(key) else {
            continue;
        };
        let bucket = match level {
            ConstraintLevel::Root => root.get_or_insert_with(ConstraintFields::default),
            ConstraintLevel::Level(n) => levels.entry(n).or_default(),
        };
        bucket.set(service, key, field, value);
    }

    if let Some(root) = &root {
        for fields in levels.values_mut() {
            fields.inherit(root);
        }
    }

    let mut constraints = Vec::with_capacity(levels.len());
    for (order, fields) in levels {
        let Some(port) = fields.port else {
            warn!(service, level = order, "dropping routing constraint without a port");
            telemetry::record_constraint_dropped("missing_port");
            continue;
        };
        constraints.push(LabelConstraint {
            order,
            port,
            domains: fields.domains.unwrap_or_default(),
            paths: fields.paths.unwrap_or_default(),
            authents: fields.authents.unwrap_or_default(),
        });
    }

    debug!(service, constraints = constraints.len(), "extracted routing constraints");
    constraints
}
