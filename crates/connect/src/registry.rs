//! Active remote-signer sessions keyed by user pubkey.

use std::sync::{Arc, RwLock};

use rustc_hash::FxHashMap;
use tracing::{debug, info};

use crate::codec::normalize_pubkey;
use crate::error::{Nip46Error, Nip46Result};
use crate::rpc::RpcSession;
use crate::util::summarize_hex;

#[derive(Default)]
struct RegistryState {
    sessions: FxHashMap<String, RpcSession>,
    active: Option<String>,
}

/// Explicit "which signer speaks for which user" lookup, shared by `Arc`.
#[derive(Clone, Default)]
pub struct SignerRegistry {
    state: Arc<RwLock<RegistryState>>,
}

impl std::fmt::Debug for SignerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.read();
        f.debug_struct("SignerRegistry")
            .field("sessions", &state.sessions.len())
            .field("active", &state.active)
            .finish()
    }
}

impl SignerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, RegistryState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, RegistryState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Register `session` under its user pubkey and make it active.
    /// Returns the session it replaced, if any.
    pub fn register(&self, session: RpcSession) -> Nip46Result<Option<RpcSession>> {
        let pubkey = session.user_pubkey().ok_or(Nip46Error::EmptyPubkey)?;
        let mut state = self.write();
        let previous = state.sessions.insert(pubkey.clone(), session);
        info!("[nip46] registered signer for {}", summarize_hex(&pubkey));
        state.active = Some(pubkey);
        Ok(previous)
    }

    /// Remove the session for `pubkey`. Clears the active slot if it pointed
    /// there.
    pub fn unregister(&self, pubkey: &str) -> Option<RpcSession> {
        let key = normalize_pubkey(pubkey);
        let mut state = self.write();
        let removed = state.sessions.remove(&key);
        if state.active.as_deref() == Some(key.as_str()) {
            state.active = None;
        }
        if removed.is_some() {
            debug!("[nip46] unregistered signer for {}", summarize_hex(&key));
        }
        removed
    }

    pub fn get(&self, pubkey: &str) -> Option<RpcSession> {
        self.read().sessions.get(&normalize_pubkey(pubkey)).cloned()
    }

    pub fn active(&self) -> Option<RpcSession> {
        let state = self.read();
        state.active.as_ref().and_then(|key| state.sessions.get(key)).cloned()
    }

    /// Make the registered session for `pubkey` active. Returns `false` when
    /// no such session is registered.
    pub fn set_active(&self, pubkey: &str) -> bool {
        let key = normalize_pubkey(pubkey);
        let mut state = self.write();
        if state.sessions.contains_key(&key) {
            state.active = Some(key);
            true
        } else {
            false
        }
    }

    pub fn len(&self) -> usize {
        self.read().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectConfig;
    use crate::rpc::SessionOptions;
    use crate::transport::{LocalKeySigner, MemoryRelay};
    use crate::types::Keys;

    fn session_for(user: &str) -> RpcSession {
        let mut options = SessionOptions::new(Keys::generate().unwrap(), Keys::generate().unwrap().public_key);
        options.relays = vec!["wss://relay.test".to_string()];
        let session = RpcSession::new(
            options,
            Arc::new(MemoryRelay::new()),
            Arc::new(LocalKeySigner),
            Arc::new(ConnectConfig::default()),
        )
        .unwrap();
        session.set_user_pubkey(user);
        session
    }

    #[test]
    fn test_registry_lifecycle() {
        let registry = SignerRegistry::new();
        let alice = "aa".repeat(32);
        let bob = "bb".repeat(32);

        assert!(registry.register(session_for(&alice)).unwrap().is_none());
        assert!(registry.register(session_for(&bob)).unwrap().is_none());
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.active().unwrap().user_pubkey(), Some(bob.clone()));

        assert!(registry.set_active(&alice.to_uppercase()));
        assert_eq!(registry.active().unwrap().user_pubkey(), Some(alice.clone()));
        assert!(!registry.set_active(&"cc".repeat(32)));

        assert!(registry.unregister(&alice).is_some());
        assert!(registry.active().is_none());
        assert!(registry.get(&bob).is_some());
        assert!(registry.unregister(&alice).is_none());
    }

    #[test]
    fn test_register_requires_user_pubkey() {
        let registry = SignerRegistry::new();
        let session = session_for("");
        assert_eq!(registry.register(session).unwrap_err(), Nip46Error::EmptyPubkey);
        assert!(registry.is_empty());
    }
}
