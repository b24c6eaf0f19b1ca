//! Meshsync kubehub – pod watch wiring, event admission and direct workload lookups

#![forbid(unsafe_code)]

use std::collections::HashMap;

use anyhow::{anyhow, Context, Result};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::Api,
    runtime::{watcher, WatchStreamExt},
    Client,
};
use meshsync_core::{Lifecycle, Uid, WorkloadState};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub mod filter;
pub mod workloads;

pub use filter::{EventFilter, EventKind, EventPredicate, Gate, WorkloadEvent};
pub use workloads::{KubeWorkloads, LookupFailure, MemoryWorkloads, Workloads};

/// What the watch adapter hands to the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchSignal {
    Event(WorkloadEvent),
    /// The watch relisted; a full token sweep should follow.
    Resynced { count: usize },
    /// The API server refused the watch; retrying with the same credentials cannot help.
    Denied(String),
}

/// HTTP status of a watch failure the controller's credentials caused.
pub fn permission_failure(err: &watcher::Error) -> Option<u16> {
    let code = match err {
        watcher::Error::InitialListFailed(kube::Error::Api(r))
        | watcher::Error::WatchStartFailed(kube::Error::Api(r))
        | watcher::Error::WatchFailed(kube::Error::Api(r)) => r.code,
        watcher::Error::WatchError(r) => r.code,
        _ => return None,
    };
    matches!(code, 401 | 403).then_some(code)
}

fn to_uid(uid_str: &str) -> Result<Uid> {
    let u = Uuid::parse_str(uid_str).context("parsing metadata.uid as uuid")?;
    Ok(*u.as_bytes())
}

/// Project a pod into the snapshot the reconciler works with.
pub fn workload_from(pod: &Pod, lifecycle: Lifecycle) -> Result<WorkloadState> {
    let meta = &pod.metadata;
    let name = meta.name.clone().ok_or_else(|| anyhow!("pod missing metadata.name"))?;
    let namespace = meta.namespace.clone().ok_or_else(|| anyhow!("pod {name} missing metadata.namespace"))?;
    let uid = match meta.uid.as_deref() {
        Some(s) => to_uid(s)?,
        None => [0u8; 16],
    };
    let labels = meta
        .labels
        .as_ref()
        .map(|l| l.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        .unwrap_or_default();
    Ok(WorkloadState { uid, namespace, name, labels, lifecycle })
}

/// Turns the watcher's applied/deleted/restarted stream into create/update/delete events.
/// The first sighting of a UID is a create; a relist that no longer holds a UID is a delete.
#[derive(Debug, Default)]
pub struct Tracker {
    seen: HashMap<Uid, WorkloadState>,
}

impl Tracker {
    pub fn new() -> Self { Self::default() }

    pub fn len(&self) -> usize { self.seen.len() }

    pub fn applied(&mut self, state: WorkloadState) -> WorkloadEvent {
        let kind = if self.seen.contains_key(&state.uid) { EventKind::Update } else { EventKind::Create };
        self.seen.insert(state.uid, state.clone());
        WorkloadEvent { kind, object: state }
    }

    pub fn deleted(&mut self, mut state: WorkloadState) -> WorkloadEvent {
        self.seen.remove(&state.uid);
        state.lifecycle = Lifecycle::Absent;
        WorkloadEvent { kind: EventKind::Delete, object: state }
    }

    pub fn restarted(&mut self, list: Vec<WorkloadState>) -> Vec<WorkloadEvent> {
        let mut previous = std::mem::take(&mut self.seen);
        let mut out = Vec::with_capacity(list.len());
        for state in list {
            let kind = if previous.remove(&state.uid).is_some() { EventKind::Update } else { EventKind::Create };
            self.seen.insert(state.uid, state.clone());
            out.push(WorkloadEvent { kind, object: state });
        }
        // Whatever was not relisted departed while the watch was down.
        for (_, mut gone) in previous {
            gone.lifecycle = Lifecycle::Absent;
            out.push(WorkloadEvent { kind: EventKind::Delete, object: gone });
        }
        out
    }
}

/// List+watch pods matching `label_selector` and forward events until the receiver goes away.
pub async fn watch_workloads(
    client: Client,
    namespace: Option<&str>,
    label_selector: &str,
    tx: mpsc::Sender<WatchSignal>,
) -> Result<()> {
    let api: Api<Pod> = match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    };
    let cfg = watcher::Config::default().labels(label_selector);
    let stream = watcher::watcher(api, cfg).default_backoff();
    futures::pin_mut!(stream);
    info!(ns = ?namespace, selector = %label_selector, "pod watcher started");

    let mut tracker = Tracker::new();
    while let Some(ev) = stream.next().await {
        let ev = match ev {
            Ok(ev) => ev,
            Err(e) => {
                if let Some(code) = permission_failure(&e) {
                    let msg = format!("pod watch refused ({code}): {e}");
                    let _ = tx.send(WatchSignal::Denied(msg.clone())).await;
                    return Err(anyhow!(msg));
                }
                warn!(error = %e, "pod watch error; backing off");
                metrics::counter!("watch_errors_total", 1);
                continue;
            }
        };
        let signals = match ev {
            watcher::Event::Applied(pod) => match workload_from(&pod, Lifecycle::Present) {
                Ok(state) => vec![WatchSignal::Event(tracker.applied(state))],
                Err(e) => {
                    warn!(error = %e, "skipping unreadable pod");
                    continue;
                }
            },
            watcher::Event::Deleted(pod) => match workload_from(&pod, Lifecycle::Absent) {
                Ok(state) => vec![WatchSignal::Event(tracker.deleted(state))],
                Err(e) => {
                    warn!(error = %e, "skipping unreadable pod");
                    continue;
                }
            },
            watcher::Event::Restarted(pods) => {
                let count = pods.len();
                debug!(count, "watch restart");
                let states = pods.iter().filter_map(|p| workload_from(p, Lifecycle::Present).ok()).collect();
                let mut out: Vec<_> = tracker.restarted(states).into_iter().map(WatchSignal::Event).collect();
                out.push(WatchSignal::Resynced { count });
                out
            }
        };
        for s in signals {
            if tx.send(s).await.is_err() {
                info!("signal receiver closed; stopping pod watcher");
                return Ok(());
            }
        }
    }
    warn!("pod watcher stream ended");
    Ok(())
}
