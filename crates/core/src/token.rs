//! Mesh access tokens and the workload identity encoded in their description.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const META_POD: &str = "pod";
pub const META_NAMESPACE: &str = "namespace";
pub const META_PARTITION: &str = "partition";

const DESCRIPTION_PREFIX: &str = "token created via login: ";

static META_JSON: Lazy<Regex> = Lazy::new(|| Regex::new(r".*(\{.+\})").expect("static regex"));

/// A mesh-issued ACL token as returned by the token listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshToken {
    pub accessor_id: String,
    pub auth_method: String,
    pub description: String,
    pub create_time: Option<DateTime<Utc>>,
    pub namespace: Option<String>,
    pub partition: Option<String>,
}

impl MeshToken {
    pub fn new(accessor_id: impl Into<String>, auth_method: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            accessor_id: accessor_id.into(),
            auth_method: auth_method.into(),
            description: description.into(),
            create_time: None,
            namespace: None,
            partition: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("description carries no metadata object")]
    NoPayload,
    #[error("metadata is not a flat string map: {0}")]
    Json(#[from] serde_json::Error),
    #[error("metadata has no `pod` entry")]
    MissingPod,
    #[error("cannot determine namespace for pod `{0}`")]
    MissingNamespace(String),
    #[error("pod `{pod}` does not belong to namespace `{namespace}`")]
    NamespaceMismatch { pod: String, namespace: String },
}

/// Workload identity a token was issued for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TokenMetadata {
    pub workload: String,
    pub namespace: String,
    pub partition: Option<String>,
}

impl TokenMetadata {
    /// Rejects identities `parse` could not read back: an empty namespace,
    /// or a workload name that is empty or contains `/`.
    pub fn new(namespace: impl Into<String>, workload: impl Into<String>) -> Result<Self, MetadataError> {
        let (namespace, workload) = (namespace.into(), workload.into());
        if namespace.is_empty() {
            return Err(MetadataError::MissingNamespace(workload));
        }
        if workload.is_empty() {
            return Err(MetadataError::MissingPod);
        }
        if workload.contains('/') {
            return Err(MetadataError::NamespaceMismatch { pod: workload, namespace });
        }
        Ok(Self { workload, namespace, partition: None })
    }

    /// An empty partition means none.
    pub fn with_partition(mut self, partition: impl Into<String>) -> Self {
        let partition: String = partition.into();
        self.partition = (!partition.is_empty()).then_some(partition);
        self
    }

    /// Render as a token description; `parse` reads it back unchanged.
    pub fn to_description(&self) -> String {
        let mut meta = BTreeMap::new();
        meta.insert(META_POD, format!("{}/{}", self.namespace, self.workload));
        meta.insert(META_NAMESPACE, self.namespace.clone());
        if let Some(p) = &self.partition {
            meta.insert(META_PARTITION, p.clone());
        }
        // A map of strings always serializes.
        let json = serde_json::to_string(&meta).unwrap_or_default();
        format!("{DESCRIPTION_PREFIX}{json}")
    }

    pub fn parse(description: &str) -> Result<Self, MetadataError> {
        let caps = META_JSON.captures(description).ok_or(MetadataError::NoPayload)?;
        let json = caps.get(1).ok_or(MetadataError::NoPayload)?.as_str();
        let mut meta: BTreeMap<String, String> = serde_json::from_str(json)?;
        let pod = meta.remove(META_POD).ok_or(MetadataError::MissingPod)?;
        let partition = meta.remove(META_PARTITION).filter(|p| !p.is_empty());

        let (namespace, workload) = match meta.remove(META_NAMESPACE).filter(|n| !n.is_empty()) {
            Some(ns) => {
                let name = pod.strip_prefix(&format!("{ns}/")).unwrap_or(&pod).to_string();
                if name.contains('/') {
                    return Err(MetadataError::NamespaceMismatch { pod, namespace: ns });
                }
                (ns, name)
            }
            None => match pod.split_once('/') {
                Some((ns, name)) if !ns.is_empty() && !name.is_empty() && !name.contains('/') => {
                    (ns.to_string(), name.to_string())
                }
                _ => return Err(MetadataError::MissingNamespace(pod)),
            },
        };
        if workload.is_empty() {
            return Err(MetadataError::MissingPod);
        }
        Ok(Self { workload, namespace, partition })
    }
}
