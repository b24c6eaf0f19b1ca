//! Meshsync catalog: mirrors a producer's desired registrations into the mesh.
//!
//! Callers hand over the full desired [`SyncSet`]; the syncer diffs it against
//! what it last synced and only issues the register/deregister calls needed.
//! Syncs are serialized; readers see the last-synced set through a lock-free
//! snapshot.

#![forbid(unsafe_code)]

use std::sync::Arc;

use arc_swap::ArcSwap;
use meshsync_core::{Error, MeshRegistration, RegistrationKey, Result, SyncSet, WorkKey};
use meshsync_mesh::MeshApi;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// What one sync changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub registered: usize,
    pub deregistered: usize,
    pub unchanged: usize,
}

impl SyncReport {
    pub fn is_noop(&self) -> bool { self.registered == 0 && self.deregistered == 0 }
}

#[async_trait::async_trait]
pub trait Syncer: Send + Sync {
    /// Replace the mirrored set with `desired`.
    async fn sync(&self, desired: SyncSet) -> Result<SyncReport>;

    /// Drop every registration minted for `workload`.
    async fn evict_workload(&self, workload: &WorkKey) -> Result<SyncReport>;

    /// Registrations the mesh has accepted so far.
    fn registrations(&self) -> Arc<SyncSet>;
}

pub struct CatalogSyncer {
    mesh: Arc<dyn MeshApi>,
    last: Mutex<SyncSet>,
    snap: ArcSwap<SyncSet>,
}

impl CatalogSyncer {
    pub fn new(mesh: Arc<dyn MeshApi>) -> Self {
        Self { mesh, last: Mutex::new(SyncSet::new()), snap: ArcSwap::from_pointee(SyncSet::new()) }
    }

    /// Diff and apply under the held lock. `last` ends up equal to what the
    /// mesh accepted, so a failed call is reissued by the next sync.
    async fn apply(&self, last: &mut SyncSet, desired: &SyncSet) -> Result<SyncReport> {
        let to_register: Vec<&MeshRegistration> =
            desired.iter().filter(|r| last.get(&r.key()) != Some(*r)).collect();
        let to_deregister: Vec<RegistrationKey> = last.keys().filter(|k| !desired.contains_key(k)).cloned().collect();
        let mut report = SyncReport { unchanged: desired.len() - to_register.len(), ..SyncReport::default() };
        if to_register.is_empty() && to_deregister.is_empty() {
            debug!(size = desired.len(), "catalog already in sync");
            return Ok(report);
        }

        let attempted = to_register.len() + to_deregister.len();
        let mut failures = Vec::new();

        for reg in to_register {
            match self.mesh.register(reg).await {
                Ok(()) => {
                    last.insert(reg.clone());
                    report.registered += 1;
                    metrics::counter!("catalog_registrations_total", 1);
                }
                Err(e) => {
                    warn!(service = %reg.service_name, id = %reg.service_id, node = %reg.node, error = %e, "register failed");
                    failures.push(e.context(format!("registering {}/{}", reg.node, reg.service_id)));
                }
            }
        }
        for key in to_deregister {
            match self.mesh.deregister(&key).await {
                Ok(()) => {
                    last.remove(&key);
                    report.deregistered += 1;
                    metrics::counter!("catalog_deregistrations_total", 1);
                }
                Err(e) => {
                    warn!(id = %key.service_id, node = %key.node, error = %e, "deregister failed");
                    failures.push(e.context(format!("deregistering {}/{}", key.node, key.service_id)));
                }
            }
        }

        self.snap.store(Arc::new(last.clone()));
        info!(registered = report.registered, deregistered = report.deregistered, failed = failures.len(), "catalog synced");
        match Error::incomplete(failures, attempted) {
            None => Ok(report),
            Some(e) => Err(e),
        }
    }
}

#[async_trait::async_trait]
impl Syncer for CatalogSyncer {
    async fn sync(&self, desired: SyncSet) -> Result<SyncReport> {
        let mut last = self.last.lock().await;
        self.apply(&mut last, &desired).await
    }

    async fn evict_workload(&self, workload: &WorkKey) -> Result<SyncReport> {
        let mut last = self.last.lock().await;
        let desired = last.without_workload(workload);
        if desired.len() == last.len() {
            return Ok(SyncReport { unchanged: desired.len(), ..SyncReport::default() });
        }
        debug!(workload = %workload, "evicting workload registrations");
        self.apply(&mut last, &desired).await
    }

    fn registrations(&self) -> Arc<SyncSet> { self.snap.load_full() }
}
