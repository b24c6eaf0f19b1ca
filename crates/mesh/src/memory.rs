//! In-memory mesh for tests: records every call and can be scripted to fail.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use meshsync_core::{ConfigEntry, Error, MeshRegistration, MeshToken, Placement, RegistrationKey, Result};

use crate::{MeshApi, TokenQuery};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MeshOp {
    ListTokens,
    Revoke,
    Register,
    Deregister,
    SetConfigEntry,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MeshCall {
    ListTokens(TokenQuery),
    Revoke(String),
    Register(RegistrationKey),
    Deregister(RegistrationKey),
    SetConfigEntry { kind: String, name: String },
}

impl MeshCall {
    pub fn op(&self) -> MeshOp {
        match self {
            MeshCall::ListTokens(_) => MeshOp::ListTokens,
            MeshCall::Revoke(_) => MeshOp::Revoke,
            MeshCall::Register(_) => MeshOp::Register,
            MeshCall::Deregister(_) => MeshOp::Deregister,
            MeshCall::SetConfigEntry { .. } => MeshOp::SetConfigEntry,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptedFailure {
    Transient,
    Forbidden,
    Protocol,
}

impl ScriptedFailure {
    fn to_error(self, what: &str) -> Error {
        match self {
            ScriptedFailure::Transient => Error::transient(format!("{what}: connection reset")),
            ScriptedFailure::Forbidden => Error::permission_denied(format!("{what}: 403 Permission denied")),
            ScriptedFailure::Protocol => Error::protocol(format!("{what}: unexpected response")),
        }
    }
}

#[derive(Default)]
struct MemState {
    tokens: BTreeMap<String, MeshToken>,
    catalog: BTreeMap<RegistrationKey, MeshRegistration>,
    config: BTreeMap<(String, String), ConfigEntry>,
    calls: Vec<MeshCall>,
    next_failures: HashMap<MeshOp, VecDeque<ScriptedFailure>>,
    revoke_failures: HashMap<String, ScriptedFailure>,
}

impl MemState {
    fn scripted(&mut self, op: MeshOp) -> Option<ScriptedFailure> {
        self.next_failures.get_mut(&op).and_then(VecDeque::pop_front)
    }
}

#[derive(Default)]
pub struct MemoryMesh {
    inner: Mutex<MemState>,
}

impl MemoryMesh {
    pub fn new() -> Self { Self::default() }

    pub fn with_tokens(tokens: impl IntoIterator<Item = MeshToken>) -> Self {
        let me = Self::new();
        for t in tokens {
            me.insert_token(t);
        }
        me
    }

    fn state(&self) -> MutexGuard<'_, MemState> { self.inner.lock().unwrap_or_else(PoisonError::into_inner) }

    pub fn insert_token(&self, token: MeshToken) { self.state().tokens.insert(token.accessor_id.clone(), token); }

    pub fn tokens(&self) -> Vec<MeshToken> { self.state().tokens.values().cloned().collect() }

    pub fn has_token(&self, accessor_id: &str) -> bool { self.state().tokens.contains_key(accessor_id) }

    pub fn registrations(&self) -> Vec<MeshRegistration> { self.state().catalog.values().cloned().collect() }

    pub fn config_entry(&self, kind: &str, name: &str) -> Option<ConfigEntry> {
        self.state().config.get(&(kind.to_string(), name.to_string())).cloned()
    }

    /// Fail the next call of `op` once; queued failures are consumed in order.
    pub fn fail_next(&self, op: MeshOp, failure: ScriptedFailure) {
        self.state().next_failures.entry(op).or_default().push_back(failure);
    }

    /// Fail every revoke of `accessor_id` until cleared.
    pub fn fail_revoke(&self, accessor_id: &str, failure: ScriptedFailure) {
        self.state().revoke_failures.insert(accessor_id.to_string(), failure);
    }

    pub fn clear_failures(&self) {
        let mut st = self.state();
        st.next_failures.clear();
        st.revoke_failures.clear();
    }

    pub fn calls(&self) -> Vec<MeshCall> { self.state().calls.clone() }

    pub fn count(&self, op: MeshOp) -> usize { self.state().calls.iter().filter(|c| c.op() == op).count() }

    /// Accessors passed to revoke, successful or not.
    pub fn revoked(&self) -> Vec<String> {
        self.state()
            .calls
            .iter()
            .filter_map(|c| match c {
                MeshCall::Revoke(a) => Some(a.clone()),
                _ => None,
            })
            .collect()
    }

    /// Register plus deregister calls.
    pub fn catalog_writes(&self) -> usize { self.count(MeshOp::Register) + self.count(MeshOp::Deregister) }

    pub fn clear_calls(&self) { self.state().calls.clear(); }
}

#[async_trait::async_trait]
impl MeshApi for MemoryMesh {
    async fn list_tokens(&self, query: &TokenQuery) -> Result<Vec<MeshToken>> {
        let mut st = self.state();
        st.calls.push(MeshCall::ListTokens(query.clone()));
        if let Some(f) = st.scripted(MeshOp::ListTokens) {
            return Err(f.to_error("listing tokens"));
        }
        Ok(st.tokens.values().filter(|t| t.auth_method == query.auth_method).cloned().collect())
    }

    async fn revoke_token(&self, accessor_id: &str, _placement: &Placement) -> Result<()> {
        let mut st = self.state();
        st.calls.push(MeshCall::Revoke(accessor_id.to_string()));
        if let Some(f) = st.scripted(MeshOp::Revoke).or_else(|| st.revoke_failures.get(accessor_id).copied()) {
            return Err(f.to_error(&format!("revoking {accessor_id}")));
        }
        st.tokens.remove(accessor_id);
        Ok(())
    }

    async fn register(&self, reg: &MeshRegistration) -> Result<()> {
        let mut st = self.state();
        st.calls.push(MeshCall::Register(reg.key()));
        if let Some(f) = st.scripted(MeshOp::Register) {
            return Err(f.to_error(&format!("registering {}", reg.service_id)));
        }
        st.catalog.insert(reg.key(), reg.clone());
        Ok(())
    }

    async fn deregister(&self, key: &RegistrationKey) -> Result<()> {
        let mut st = self.state();
        st.calls.push(MeshCall::Deregister(key.clone()));
        if let Some(f) = st.scripted(MeshOp::Deregister) {
            return Err(f.to_error(&format!("deregistering {}", key.service_id)));
        }
        st.catalog.remove(key);
        Ok(())
    }

    async fn set_config_entry(&self, entry: &ConfigEntry) -> Result<()> {
        let mut st = self.state();
        st.calls.push(MeshCall::SetConfigEntry { kind: entry.kind.clone(), name: entry.name.clone() });
        if let Some(f) = st.scripted(MeshOp::SetConfigEntry) {
            return Err(f.to_error(&format!("writing {}/{}", entry.kind, entry.name)));
        }
        st.config.insert((entry.kind.clone(), entry.name.clone()), entry.clone());
        Ok(())
    }
}
