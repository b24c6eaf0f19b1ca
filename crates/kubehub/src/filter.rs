//! Event admission: which cluster events become work keys.

use meshsync_core::{AdmissionFilter, ComponentSelector, ReconcilerConfig, WorkKey, WorkloadState};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkloadEvent {
    pub kind: EventKind,
    pub object: WorkloadState,
}

impl WorkloadEvent {
    pub fn new(kind: EventKind, object: WorkloadState) -> Self { Self { kind, object } }
}

/// Whether an event kind is considered at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    /// Dropped without looking at the object.
    Suppress,
    /// Passed on to label and namespace admission.
    Admit,
}

/// Per-kind gates, kept as a value so subscriptions can be inspected and tested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventPredicate {
    pub on_create: Gate,
    pub on_update: Gate,
    pub on_delete: Gate,
}

impl EventPredicate {
    /// React to workload departure only.
    pub const fn departures() -> Self {
        Self { on_create: Gate::Suppress, on_update: Gate::Suppress, on_delete: Gate::Admit }
    }

    pub fn gate(&self, kind: EventKind) -> Gate {
        match kind {
            EventKind::Create => self.on_create,
            EventKind::Update => self.on_update,
            EventKind::Delete => self.on_delete,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventFilter {
    predicate: EventPredicate,
    selector: ComponentSelector,
    admission: AdmissionFilter,
}

impl EventFilter {
    pub fn new(predicate: EventPredicate, selector: ComponentSelector, admission: AdmissionFilter) -> Self {
        Self { predicate, selector, admission }
    }

    pub fn from_config(cfg: &ReconcilerConfig) -> Self {
        Self::new(EventPredicate::departures(), cfg.selector.clone(), cfg.admission.clone())
    }

    pub fn predicate(&self) -> EventPredicate { self.predicate }

    /// Work key for an admitted event, `None` otherwise.
    pub fn on_event(&self, ev: &WorkloadEvent) -> Option<WorkKey> {
        let obj = &ev.object;
        if self.predicate.gate(ev.kind) == Gate::Suppress {
            return None;
        }
        if !self.selector.matches(obj) {
            debug!(ns = %obj.namespace, name = %obj.name, kind = ?ev.kind, "event dropped: labels do not match");
            return None;
        }
        if !self.admission.admits(&obj.namespace) {
            debug!(ns = %obj.namespace, name = %obj.name, kind = ?ev.kind, "event dropped: namespace not admitted");
            return None;
        }
        Some(obj.key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshsync_core::NamespaceSet;

    fn pod(ns: &str, name: &str, release: &str) -> WorkloadState {
        WorkloadState::new(ns, name)
            .with_label("app", "consul")
            .with_label("component", "controller")
            .with_label("release", release)
    }

    fn filter(allow: &[&str], deny: &[&str]) -> EventFilter {
        EventFilter::new(
            EventPredicate::departures(),
            ComponentSelector::new("r1"),
            AdmissionFilter::new(allow.iter().copied().collect::<NamespaceSet>(), deny.iter().copied().collect()),
        )
    }

    #[test]
    fn only_deletes_pass_the_departure_predicate() {
        let f = filter(&[], &[]);
        let p = pod("ns1", "pod-a", "r1");
        assert_eq!(f.on_event(&WorkloadEvent::new(EventKind::Create, p.clone())), None);
        assert_eq!(f.on_event(&WorkloadEvent::new(EventKind::Update, p.clone())), None);
        assert_eq!(f.on_event(&WorkloadEvent::new(EventKind::Delete, p)), Some(WorkKey::new("ns1", "pod-a")));
    }

    #[test]
    fn label_mismatch_never_yields_a_key() {
        let f = filter(&[], &[]);
        let other_release = pod("ns1", "pod-a", "r2");
        assert_eq!(f.on_event(&WorkloadEvent::new(EventKind::Delete, other_release)), None);
        let unlabeled = WorkloadState::new("ns1", "pod-b");
        assert_eq!(f.on_event(&WorkloadEvent::new(EventKind::Delete, unlabeled)), None);
    }

    #[test]
    fn namespace_admission_applies_after_labels() {
        let f = filter(&["ns1", "ns2"], &["ns2"]);
        let del = |ns: &str| WorkloadEvent::new(EventKind::Delete, pod(ns, "p", "r1"));
        assert!(f.on_event(&del("ns1")).is_some());
        assert!(f.on_event(&del("ns2")).is_none());
        assert!(f.on_event(&del("ns3")).is_none());
    }

    #[test]
    fn predicate_is_inspectable() {
        let f = filter(&[], &[]);
        assert_eq!(f.predicate().gate(EventKind::Delete), Gate::Admit);
        assert_eq!(f.predicate().gate(EventKind::Create), Gate::Suppress);
        assert_eq!(f.predicate().gate(EventKind::Update), Gate::Suppress);
    }
}
