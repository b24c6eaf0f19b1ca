//! Maps a cluster namespace onto the mesh namespace/partition its objects live in.
//! Pure: no I/O.

use serde::{Deserialize, Serialize};

const DEFAULT: &str = "default";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementConfig {
    /// Mesh namespaces are available (enterprise only).
    pub enable_namespaces: bool,
    /// Where everything lands when mirroring is off.
    pub destination_namespace: String,
    /// Mirror cluster namespaces, with this prefix prepended.
    pub mirroring_prefix: Option<String>,
    pub enable_partitions: bool,
    pub partition: String,
}

impl Default for PlacementConfig {
    fn default() -> Self {
        Self {
            enable_namespaces: false,
            destination_namespace: DEFAULT.to_string(),
            mirroring_prefix: None,
            enable_partitions: false,
            partition: DEFAULT.to_string(),
        }
    }
}

/// Mesh-side location. `None` means the feature is disabled and callers
/// must leave the field out of requests entirely.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Placement {
    pub namespace: Option<String>,
    pub partition: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NamespaceResolver {
    cfg: PlacementConfig,
}

impl NamespaceResolver {
    pub fn new(cfg: PlacementConfig) -> Self { Self { cfg } }

    pub fn resolve(&self, cluster_namespace: &str, partition_override: Option<&str>) -> Placement {
        let namespace = self.cfg.enable_namespaces.then(|| match &self.cfg.mirroring_prefix {
            Some(prefix) => format!("{prefix}{cluster_namespace}"),
            None => self.cfg.destination_namespace.clone(),
        });
        let partition = self
            .cfg
            .enable_partitions
            .then(|| partition_override.unwrap_or(&self.cfg.partition).to_string());
        Placement { namespace, partition }
    }

    /// Placement that spans every mesh namespace of the configured partition.
    pub fn all_namespaces(&self) -> Placement {
        Placement {
            namespace: self.cfg.enable_namespaces.then(|| crate::namespaces::WILDCARD.to_string()),
            partition: self.cfg.enable_partitions.then(|| self.cfg.partition.clone()),
        }
    }
}
