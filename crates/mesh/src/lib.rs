//! Meshsync mesh API: the control-plane capability the reconciler calls through.
//!
//! [`MeshApi`] is the seam; [`HttpMeshClient`] speaks the Consul HTTP API and
//! [`MemoryMesh`] records calls in memory for tests.

#![forbid(unsafe_code)]

use meshsync_core::{ConfigEntry, MeshRegistration, MeshToken, Placement, RegistrationKey, Result};

pub mod http;
pub mod memory;

pub use http::{HttpMeshClient, MeshConnection};
pub use memory::{MemoryMesh, MeshCall, MeshOp, ScriptedFailure};

/// Token listing request. Listings are always strongly consistent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenQuery {
    pub auth_method: String,
    pub placement: Placement,
}

impl TokenQuery {
    pub fn new(auth_method: impl Into<String>, placement: Placement) -> Self {
        Self { auth_method: auth_method.into(), placement }
    }
}

#[async_trait::async_trait]
pub trait MeshApi: Send + Sync {
    /// Tokens issued by `query.auth_method`, read from the leader.
    async fn list_tokens(&self, query: &TokenQuery) -> Result<Vec<MeshToken>>;

    /// Revoke by accessor id. Revoking an unknown accessor succeeds.
    async fn revoke_token(&self, accessor_id: &str, placement: &Placement) -> Result<()>;

    async fn register(&self, reg: &MeshRegistration) -> Result<()>;

    async fn deregister(&self, key: &RegistrationKey) -> Result<()>;

    /// Create or overwrite a config entry.
    async fn set_config_entry(&self, entry: &ConfigEntry) -> Result<()>;
}
