//! Catalog registrations, desired-state sync sets and config entries.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{Placement, WorkKey};

pub const META_K8S_NAMESPACE: &str = "k8s-namespace";
pub const META_POD_NAME: &str = "pod-name";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    #[default]
    Passing,
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheck {
    pub check_id: String,
    pub name: String,
    pub status: HealthStatus,
    pub output: String,
}

/// Identity of a registration in the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RegistrationKey {
    pub placement: Placement,
    pub node: String,
    pub service_id: String,
}

/// A service instance in the mesh catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshRegistration {
    pub node: String,
    pub address: String,
    pub service_id: String,
    pub service_name: String,
    pub port: Option<u16>,
    pub tags: Vec<String>,
    pub meta: BTreeMap<String, String>,
    pub checks: Vec<HealthCheck>,
    pub placement: Placement,
}

impl MeshRegistration {
    pub fn new(node: impl Into<String>, service_name: impl Into<String>, service_id: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            address: String::new(),
            service_id: service_id.into(),
            service_name: service_name.into(),
            port: None,
            tags: Vec::new(),
            meta: BTreeMap::new(),
            checks: Vec::new(),
            placement: Placement::default(),
        }
    }

    /// Registration stamped with the workload it represents.
    pub fn for_workload(workload: &WorkKey, node: impl Into<String>, service_name: impl Into<String>, service_id: impl Into<String>) -> Self {
        let mut reg = Self::new(node, service_name, service_id);
        reg.meta.insert(META_K8S_NAMESPACE.to_string(), workload.namespace.clone());
        reg.meta.insert(META_POD_NAME.to_string(), workload.name.clone());
        reg
    }

    pub fn with_placement(mut self, placement: Placement) -> Self {
        self.placement = placement;
        self
    }

    pub fn key(&self) -> RegistrationKey {
        RegistrationKey { placement: self.placement.clone(), node: self.node.clone(), service_id: self.service_id.clone() }
    }

    /// The workload this registration was minted for, if stamped.
    pub fn workload(&self) -> Option<WorkKey> {
        let ns = self.meta.get(META_K8S_NAMESPACE)?;
        let name = self.meta.get(META_POD_NAME)?;
        Some(WorkKey::new(ns, name))
    }
}

/// Full desired set of registrations a producer wants mirrored.
/// Later entries with the same key replace earlier ones.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncSet(BTreeMap<RegistrationKey, MeshRegistration>);

impl SyncSet {
    pub fn new() -> Self { Self::default() }

    pub fn insert(&mut self, reg: MeshRegistration) -> Option<MeshRegistration> { self.0.insert(reg.key(), reg) }

    pub fn remove(&mut self, key: &RegistrationKey) -> Option<MeshRegistration> { self.0.remove(key) }

    pub fn get(&self, key: &RegistrationKey) -> Option<&MeshRegistration> { self.0.get(key) }

    pub fn contains_key(&self, key: &RegistrationKey) -> bool { self.0.contains_key(key) }

    pub fn len(&self) -> usize { self.0.len() }

    pub fn is_empty(&self) -> bool { self.0.is_empty() }

    pub fn iter(&self) -> impl Iterator<Item = &MeshRegistration> { self.0.values() }

    pub fn keys(&self) -> impl Iterator<Item = &RegistrationKey> { self.0.keys() }

    /// Copy without the registrations minted for `workload`.
    pub fn without_workload(&self, workload: &WorkKey) -> SyncSet {
        self.iter().filter(|r| r.workload().as_ref() != Some(workload)).cloned().collect()
    }
}

impl FromIterator<MeshRegistration> for SyncSet {
    fn from_iter<I: IntoIterator<Item = MeshRegistration>>(iter: I) -> Self {
        let mut set = SyncSet::new();
        for reg in iter {
            set.insert(reg);
        }
        set
    }
}

/// Mesh routing object (resolver, gateway config, ...). Last write wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigEntry {
    pub kind: String,
    pub name: String,
    pub payload: serde_json::Map<String, serde_json::Value>,
    pub placement: Placement,
}
