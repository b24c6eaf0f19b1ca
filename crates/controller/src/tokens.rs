//! ACL token garbage collection: revoke login tokens whose workload is gone.
//!
//! A pass lists tokens from the leader, decodes the workload identity out of
//! every token description up front, then checks each workload directly
//! against the cluster and revokes only on confirmed absence. Any malformed
//! description fails the pass before a single revocation is issued.

use std::sync::Arc;

use futures::{stream, StreamExt};
use meshsync_core::{Error, MeshToken, NamespaceResolver, Placement, ReconcilerConfig, Result, TokenMetadata};
use meshsync_kubehub::Workloads;
use meshsync_mesh::{MeshApi, TokenQuery};
use tracing::{debug, error, info, warn};

/// Tally of one cleanup pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Tokens of our auth method in scope.
    pub examined: usize,
    pub revoked: usize,
    /// Workload still exists.
    pub kept: usize,
    /// Empty description: not minted by a workload login.
    pub skipped: usize,
}

enum Outcome {
    Revoked,
    Kept,
    Failed(Error),
}

pub struct TokenReaper {
    mesh: Arc<dyn MeshApi>,
    workloads: Arc<dyn Workloads>,
    resolver: NamespaceResolver,
    auth_method: String,
    concurrency: usize,
}

impl TokenReaper {
    pub fn new(
        mesh: Arc<dyn MeshApi>,
        workloads: Arc<dyn Workloads>,
        auth_method: impl Into<String>,
        resolver: NamespaceResolver,
        concurrency: usize,
    ) -> Self {
        Self { mesh, workloads, resolver, auth_method: auth_method.into(), concurrency: concurrency.max(1) }
    }

    /// `None` when no auth method is configured.
    pub fn from_config(cfg: &ReconcilerConfig, mesh: Arc<dyn MeshApi>, workloads: Arc<dyn Workloads>) -> Option<Self> {
        let method = cfg.auth_method.as_ref()?;
        Some(Self::new(mesh, workloads, method, NamespaceResolver::new(cfg.placement.clone()), cfg.revoke_concurrency))
    }

    pub fn auth_method(&self) -> &str { &self.auth_method }

    /// Where the revoke for `token` has to be addressed. Values the listing
    /// reported win over the resolver's guess.
    fn revoke_placement(&self, token: &MeshToken, meta: &TokenMetadata) -> Placement {
        let resolved = self.resolver.resolve(&meta.namespace, meta.partition.as_deref());
        Placement {
            namespace: resolved.namespace.map(|ns| token.namespace.clone().unwrap_or(ns)),
            partition: resolved.partition.map(|p| token.partition.clone().unwrap_or(p)),
        }
    }

    /// Revoke tokens of departed workloads. `scope` limits the pass to
    /// workloads of one cluster namespace; `None` sweeps every namespace.
    pub async fn cleanup_tokens(&self, scope: Option<&str>) -> Result<CleanupReport> {
        let query = TokenQuery::new(&self.auth_method, self.resolver.all_namespaces());
        let tokens = self.mesh.list_tokens(&query).await.map_err(|e| e.context("listing ACL tokens"))?;

        let mut report = CleanupReport::default();
        let mut candidates = Vec::new();
        for token in tokens {
            if token.auth_method != self.auth_method {
                continue;
            }
            if token.description.is_empty() {
                report.skipped += 1;
                continue;
            }
            let meta = match TokenMetadata::parse(&token.description) {
                Ok(meta) => meta,
                Err(e) => {
                    error!(accessor = %token.accessor_id, description = %token.description, error = %e, "corrupt token metadata; aborting cleanup pass");
                    return Err(Error::DataCorruption { accessor: token.accessor_id, reason: e.to_string() });
                }
            };
            if scope.is_some_and(|ns| ns != meta.namespace) {
                continue;
            }
            candidates.push((token, meta));
        }
        report.examined = candidates.len();

        let outcomes: Vec<Outcome> = stream::iter(candidates)
            .map(|(token, meta)| self.reap_one(token, meta))
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut failures = Vec::new();
        for o in outcomes {
            match o {
                Outcome::Revoked => report.revoked += 1,
                Outcome::Kept => report.kept += 1,
                Outcome::Failed(e) => failures.push(e),
            }
        }
        debug!(scope = scope.unwrap_or("*"), examined = report.examined, revoked = report.revoked, kept = report.kept, failed = failures.len(), "cleanup pass finished");
        match Error::incomplete(failures, report.examined) {
            None => Ok(report),
            Some(e) => Err(e),
        }
    }

    async fn reap_one(&self, token: MeshToken, meta: TokenMetadata) -> Outcome {
        let accessor = token.accessor_id.as_str();
        match self.workloads.get(&meta.namespace, &meta.workload).await {
            Ok(Some(_)) => {
                debug!(accessor = %accessor, namespace = %meta.namespace, name = %meta.workload, "workload present; token kept");
                Outcome::Kept
            }
            Ok(None) => {
                let placement = self.revoke_placement(&token, &meta);
                match self.mesh.revoke_token(accessor, &placement).await {
                    Ok(()) => {
                        metrics::counter!("acl_tokens_revoked_total", 1);
                        info!(accessor = %accessor, namespace = %meta.namespace, name = %meta.workload, "revoked token of departed workload");
                        Outcome::Revoked
                    }
                    Err(e) => {
                        warn!(accessor = %accessor, error = %e, "token revoke failed");
                        Outcome::Failed(e.context(format!("revoking token {accessor}")))
                    }
                }
            }
            Err(e) => {
                warn!(accessor = %accessor, namespace = %meta.namespace, name = %meta.workload, error = %e, "workload lookup failed; token left alone");
                Outcome::Failed(e.context(format!("looking up {}/{} for token {accessor}", meta.namespace, meta.workload)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshsync_core::PlacementConfig;
    use meshsync_kubehub::MemoryWorkloads;
    use meshsync_mesh::MemoryMesh;

    fn reaper(cfg: PlacementConfig) -> TokenReaper {
        TokenReaper::new(
            Arc::new(MemoryMesh::new()),
            Arc::new(MemoryWorkloads::new()),
            "k8s",
            NamespaceResolver::new(cfg),
            2,
        )
    }

    #[test]
    fn revoke_placement_is_empty_without_enterprise_features() {
        let r = reaper(PlacementConfig::default());
        let mut token = MeshToken::new("a1", "k8s", "");
        token.namespace = Some("default".into());
        let meta = TokenMetadata::new("ns1", "pod-a").unwrap();
        assert_eq!(r.revoke_placement(&token, &meta), Placement::default());
    }

    #[test]
    fn revoke_placement_prefers_listing_values() {
        let cfg = PlacementConfig {
            enable_namespaces: true,
            mirroring_prefix: Some("k8s-".into()),
            enable_partitions: true,
            ..PlacementConfig::default()
        };
        let r = reaper(cfg);
        let meta = TokenMetadata::new("ns1", "pod-a").unwrap().with_partition("ap1");
        let bare = MeshToken::new("a1", "k8s", "");
        assert_eq!(
            r.revoke_placement(&bare, &meta),
            Placement { namespace: Some("k8s-ns1".into()), partition: Some("ap1".into()) }
        );
        let mut listed = bare.clone();
        listed.namespace = Some("auth-ns".into());
        assert_eq!(r.revoke_placement(&listed, &meta).namespace.as_deref(), Some("auth-ns"));
    }
}
