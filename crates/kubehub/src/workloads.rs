//! Direct workload existence checks against the API server (never a cache).

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use kube::{api::Api, Client};
use meshsync_core::{Error, Lifecycle, Result, WorkKey, WorkloadState};
use tracing::debug;

use crate::workload_from;

/// Workload lookups. `Ok(None)` is confirmed absence; any `Err` proves nothing.
#[async_trait::async_trait]
pub trait Workloads: Send + Sync {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<WorkloadState>>;
}

pub struct KubeWorkloads {
    client: Client,
    timeout: Duration,
}

impl KubeWorkloads {
    pub fn new(client: Client, timeout: Duration) -> Self { Self { client, timeout } }
}

pub(crate) fn map_kube_err(e: kube::Error) -> Error {
    match &e {
        kube::Error::Api(ae) if ae.code == 401 || ae.code == 403 => Error::permission_denied(ae.message.clone()),
        kube::Error::Api(ae) if ae.code == 404 => Error::not_found(ae.message.clone()),
        _ => Error::transient(e.to_string()),
    }
}

#[async_trait::async_trait]
impl Workloads for KubeWorkloads {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<WorkloadState>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let res = tokio::time::timeout(self.timeout, api.get_opt(name))
            .await
            .map_err(|_| Error::transient(format!("pod lookup timed out after {:?}", self.timeout)))?;
        metrics::counter!("kube_lookups_total", 1);
        match res.map_err(map_kube_err)? {
            Some(pod) => {
                let state = workload_from(&pod, Lifecycle::Present).map_err(|e| Error::protocol(e.to_string()))?;
                Ok(Some(state))
            }
            None => {
                debug!(ns = %namespace, name = %name, "pod confirmed absent");
                Ok(None)
            }
        }
    }
}

/// Failure a `MemoryWorkloads` lookup can be scripted to return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupFailure {
    Transient,
    Forbidden,
}

#[derive(Default)]
struct MemState {
    pods: HashMap<WorkKey, WorkloadState>,
    failures: HashMap<WorkKey, LookupFailure>,
    lookups: Vec<WorkKey>,
}

/// In-memory workloads for tests.
#[derive(Default)]
pub struct MemoryWorkloads {
    inner: Mutex<MemState>,
}

impl MemoryWorkloads {
    pub fn new() -> Self { Self::default() }

    pub fn with(pods: impl IntoIterator<Item = WorkloadState>) -> Self {
        let me = Self::new();
        for p in pods {
            me.insert(p);
        }
        me
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MemState> { self.inner.lock().unwrap_or_else(PoisonError::into_inner) }

    pub fn insert(&self, pod: WorkloadState) { self.state().pods.insert(pod.key(), pod); }

    pub fn remove(&self, namespace: &str, name: &str) -> Option<WorkloadState> {
        self.state().pods.remove(&WorkKey::new(namespace, name))
    }

    pub fn fail_lookups(&self, namespace: &str, name: &str, failure: LookupFailure) {
        self.state().failures.insert(WorkKey::new(namespace, name), failure);
    }

    pub fn clear_failures(&self) { self.state().failures.clear(); }

    /// Every key looked up so far, in order.
    pub fn lookups(&self) -> Vec<WorkKey> { self.state().lookups.clone() }
}

#[async_trait::async_trait]
impl Workloads for MemoryWorkloads {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<WorkloadState>> {
        let key = WorkKey::new(namespace, name);
        let mut st = self.state();
        st.lookups.push(key.clone());
        match st.failures.get(&key) {
            Some(LookupFailure::Transient) => Err(Error::transient(format!("connection reset looking up {key}"))),
            Some(LookupFailure::Forbidden) => Err(Error::permission_denied(format!("pods \"{name}\" is forbidden"))),
            None => Ok(st.pods.get(&key).cloned()),
        }
    }
}
