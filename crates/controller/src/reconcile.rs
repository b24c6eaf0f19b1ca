//! Per-key convergence.

use std::sync::Arc;

use meshsync_catalog::Syncer;
use meshsync_core::{Error, Result, WorkKey};
use meshsync_kubehub::Workloads;
use tracing::{debug, info};

use crate::tokens::TokenReaper;

/// What a successful reconcile found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Workload still exists; nothing to do.
    Present,
    /// Workload confirmed gone; its tokens and registrations were cleaned up.
    Departed { revoked: usize, evicted: usize },
}

pub struct Reconciler {
    workloads: Arc<dyn Workloads>,
    reaper: Option<Arc<TokenReaper>>,
    catalog: Option<Arc<dyn Syncer>>,
}

impl Reconciler {
    pub fn new(workloads: Arc<dyn Workloads>, reaper: Option<TokenReaper>) -> Self {
        Self { workloads, reaper: reaper.map(Arc::new), catalog: None }
    }

    /// Also evict the registrations of departed workloads from `catalog`.
    pub fn with_catalog(mut self, catalog: Arc<dyn Syncer>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn reaper(&self) -> Option<Arc<TokenReaper>> { self.reaper.clone() }

    /// Converge one key. Errors carry the key; `is_fatal()` tells the caller
    /// whether retrying can help.
    pub async fn reconcile(&self, key: &WorkKey) -> Result<Outcome> {
        self.converge(key).await.map_err(|e| e.context(format!("reconciling {key}")))
    }

    async fn converge(&self, key: &WorkKey) -> Result<Outcome> {
        // Only Ok(None) proves absence; a failed lookup proves nothing.
        if self.workloads.get(&key.namespace, &key.name).await?.is_some() {
            debug!(key = %key, "workload present");
            return Ok(Outcome::Present);
        }

        // Eviction does not depend on the token pass; both always run.
        let mut failures = Vec::new();
        let mut revoked = 0;
        if let Some(reaper) = &self.reaper {
            match reaper.cleanup_tokens(Some(&key.namespace)).await {
                Ok(report) => revoked = report.revoked,
                Err(e) => failures.push(e),
            }
        }
        let mut evicted = 0;
        if let Some(catalog) = &self.catalog {
            match catalog.evict_workload(key).await {
                Ok(report) => evicted = report.deregistered,
                Err(e) => failures.push(e),
            }
        }
        if failures.len() == 1 {
            return Err(failures.remove(0));
        }
        if let Some(e) = Error::incomplete(failures, 2) {
            return Err(e);
        }
        info!(key = %key, revoked, evicted, "workload departed");
        Ok(Outcome::Departed { revoked, evicted })
    }
}
