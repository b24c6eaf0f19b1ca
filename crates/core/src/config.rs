//! Reconciler configuration. Built once at startup and handed to each
//! component's constructor.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{AdmissionFilter, Error, PlacementConfig, Result, WorkloadState};

/// Labels every watched workload must carry with these exact values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentSelector {
    pub app: String,
    pub component: String,
    pub release: String,
}

impl ComponentSelector {
    pub fn new(release: impl Into<String>) -> Self {
        Self { app: "consul".to_string(), component: "controller".to_string(), release: release.into() }
    }

    pub fn matches(&self, workload: &WorkloadState) -> bool {
        workload.label("app") == Some(self.app.as_str())
            && workload.label("component") == Some(self.component.as_str())
            && workload.label("release") == Some(self.release.as_str())
    }

    /// Server-side label selector, e.g. `app=consul,component=controller,release=r1`.
    pub fn label_selector(&self) -> String {
        format!("app={},component={},release={}", self.app, self.component, self.release)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    /// Auth method whose tokens are garbage collected. `None` disables cleanup.
    pub auth_method: Option<String>,
    pub selector: ComponentSelector,
    pub admission: AdmissionFilter,
    pub placement: PlacementConfig,
    /// Restrict the watch to one namespace.
    pub watch_namespace: Option<String>,
    pub workers: usize,
    pub reconcile_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub resync_interval: Duration,
    pub revoke_concurrency: usize,
}

impl ReconcilerConfig {
    pub fn new(selector: ComponentSelector) -> Self {
        Self {
            auth_method: None,
            selector,
            admission: AdmissionFilter::default(),
            placement: PlacementConfig::default(),
            watch_namespace: None,
            workers: 4,
            reconcile_timeout: Duration::from_secs(30),
            backoff_base: Duration::from_millis(5),
            backoff_max: Duration::from_secs(1000),
            resync_interval: Duration::from_secs(300),
            revoke_concurrency: 4,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.selector.release.is_empty() {
            return Err(Error::config("release name must be set"));
        }
        if self.workers == 0 {
            return Err(Error::config("at least one reconcile worker is required"));
        }
        if self.revoke_concurrency == 0 {
            return Err(Error::config("revoke concurrency must be positive"));
        }
        if self.backoff_base > self.backoff_max {
            return Err(Error::config("backoff base exceeds backoff max"));
        }
        if matches!(&self.auth_method, Some(m) if m.is_empty()) {
            return Err(Error::config("auth method name is empty"));
        }
        Ok(())
    }
}
