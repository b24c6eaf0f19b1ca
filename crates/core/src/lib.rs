//! Meshsync core types: work keys, workload snapshots, mesh-side objects,
//! the error taxonomy and the namespace/partition resolver.

#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

pub mod config;
pub mod error;
pub mod namespaces;
pub mod registration;
pub mod resolver;
pub mod token;

pub use config::{ComponentSelector, ReconcilerConfig};
pub use error::{Error, ErrorClass, Result};
pub use namespaces::{AdmissionFilter, NamespaceSet};
pub use registration::{ConfigEntry, HealthCheck, HealthStatus, MeshRegistration, RegistrationKey, SyncSet};
pub use resolver::{NamespaceResolver, Placement, PlacementConfig};
pub use token::{MeshToken, MetadataError, TokenMetadata};

pub type Uid = [u8; 16];

/// Namespaced name of a cluster object whose change triggers a reconcile.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkKey {
    pub namespace: String,
    pub name: String,
}

impl WorkKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }
}

impl fmt::Display for WorkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Lifecycle {
    Present,
    Absent,
}

/// Read-only snapshot of a cluster workload (a pod).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkloadState {
    pub uid: Uid,
    pub namespace: String,
    pub name: String,
    /// Kubernetes labels as key/value pairs.
    pub labels: SmallVec<[(String, String); 8]>,
    pub lifecycle: Lifecycle,
}

impl WorkloadState {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            uid: [0u8; 16],
            namespace: namespace.into(),
            name: name.into(),
            labels: SmallVec::new(),
            lifecycle: Lifecycle::Present,
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.push((key.into(), value.into()));
        self
    }

    pub fn key(&self) -> WorkKey { WorkKey::new(&self.namespace, &self.name) }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }
}

pub mod prelude {
    pub use super::{
        AdmissionFilter, Error, ErrorClass, Lifecycle, MeshRegistration, MeshToken, NamespaceResolver, NamespaceSet,
        Placement, Result, SyncSet, TokenMetadata, Uid, WorkKey, WorkloadState,
    };
}
