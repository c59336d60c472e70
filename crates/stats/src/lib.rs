//! Policy traffic statistics payloads: the objects a control plane publishes
//! through the lookout store, plus ready-made store constructors.

#![forbid(unsafe_code)]

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use lookout_core::{gen_change_event, AttrSet, Attributes, AttrsFn, ExtractError};
use lookout_store::{Indexers, Store};

/// Traffic counters attributed to one policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficStats {
    /// Packet count hit by the policy.
    pub packets: i64,
    /// Byte count hit by the policy.
    pub bytes: i64,
    /// Session count hit by the policy.
    pub sessions: i64,
}

impl TrafficStats {
    pub fn new(packets: i64, bytes: i64, sessions: i64) -> Self {
        Self { packets, bytes, sessions }
    }

    /// Fold another sample into this one; collectors report per-node deltas.
    pub fn merge(&mut self, other: &TrafficStats) {
        self.packets += other.packets;
        self.bytes += other.bytes;
        self.sessions += other.sessions;
    }
}

/// Identifying metadata of a stats object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub name: String,
    /// `None` for cluster-scoped policies.
    pub namespace: Option<String>,
    pub labels: AttrSet,
}

/// Aggregated statistics of one policy. Cluster-scoped and namespaced policy
/// kinds share this shape; the scope lives in the metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyStats {
    pub meta: ObjectMeta,
    pub traffic: TrafficStats,
}

impl PolicyStats {
    pub fn cluster_scoped(name: &str, traffic: TrafficStats) -> Self {
        Self {
            meta: ObjectMeta { name: name.to_string(), namespace: None, labels: AttrSet::new() },
            traffic,
        }
    }

    pub fn namespaced(namespace: &str, name: &str, traffic: TrafficStats) -> Self {
        Self {
            meta: ObjectMeta {
                name: name.to_string(),
                namespace: Some(namespace.to_string()),
                labels: AttrSet::new(),
            },
            traffic,
        }
    }

    pub fn with_labels<K: Into<String>, V: Into<String>>(
        mut self,
        labels: impl IntoIterator<Item = (K, V)>,
    ) -> Self {
        self.meta.labels = labels.into_iter().collect();
        self
    }
}

/// `namespace/name` for namespaced policies, plain `name` otherwise.
pub fn policy_stats_key(stats: &PolicyStats) -> Result<String, ExtractError> {
    if stats.meta.name.is_empty() {
        return Err(ExtractError::new("stats object has no name"));
    }
    Ok(match &stats.meta.namespace {
        Some(ns) => format!("{}/{}", ns, stats.meta.name),
        None => stats.meta.name.clone(),
    })
}

/// Labels straight from metadata; name and namespace as selectable fields.
pub fn policy_stats_attrs() -> AttrsFn<PolicyStats> {
    Arc::new(|stats: &PolicyStats| {
        let mut fields: Vec<(String, String)> =
            vec![("metadata.name".to_string(), stats.meta.name.clone())];
        if let Some(ns) = &stats.meta.namespace {
            fields.push(("metadata.namespace".to_string(), ns.clone()));
        }
        Ok(Attributes {
            labels: stats.meta.labels.clone(),
            fields: fields.into_iter().collect(),
        })
    })
}

/// Index stats objects by namespace, for per-namespace listings.
pub fn namespace_indexers() -> Indexers<PolicyStats> {
    let mut indexers: Indexers<PolicyStats> = Indexers::new();
    indexers.insert(
        "namespace".to_string(),
        Box::new(|stats: &PolicyStats| match &stats.meta.namespace {
            Some(ns) => vec![ns.clone()],
            None => Vec::new(),
        }),
    );
    indexers
}

/// A store wired for policy stats: scope-aware keys, a namespace index and
/// change events carrying label/field attributes.
pub fn new_policy_stats_store() -> Store<PolicyStats> {
    Store::new(
        Box::new(policy_stats_key),
        namespace_indexers(),
        gen_change_event(policy_stats_attrs()),
    )
}
