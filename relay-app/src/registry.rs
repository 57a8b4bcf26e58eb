//! host -> session, and identity -> currently selected host.
//!
//! Both maps live under one lock so a current-host pointer can never name a
//! host that is absent from the session map.

use crate::error::GatewayError;
use crate::remote_session::RemoteSession;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Default)]
struct RegistryState {
    sessions: HashMap<String, Arc<RemoteSession>>,
    current: HashMap<String, String>,
}

#[derive(Default)]
pub struct SessionRegistry {
    inner: Mutex<RegistryState>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Registers `session` under its host and returns the session it
    /// replaced, if any. Closing the replaced session is the caller's job.
    pub fn put(&self, session: Arc<RemoteSession>) -> Option<Arc<RemoteSession>> {
        let host = session.host().to_string();
        self.lock().sessions.insert(host, session)
    }

    pub fn get(&self, host: &str) -> Option<Arc<RemoteSession>> {
        self.lock().sessions.get(host).cloned()
    }

    /// Removes the host and every current-host pointer that names it.
    pub fn remove(&self, host: &str) -> Option<Arc<RemoteSession>> {
        let mut state = self.lock();
        let removed = state.sessions.remove(host);
        if removed.is_some() {
            state.current.retain(|_, current| current.as_str() != host);
        }
        removed
    }

    /// Like [`remove`](Self::remove), but only when `host` still maps to this
    /// exact session. Used by idle expiry so it never evicts a replacement.
    pub fn remove_if_same(&self, host: &str, session: &Arc<RemoteSession>) -> bool {
        let mut state = self.lock();
        let same = state
            .sessions
            .get(host)
            .is_some_and(|registered| Arc::ptr_eq(registered, session));
        if same {
            state.sessions.remove(host);
            state.current.retain(|_, current| current.as_str() != host);
        }
        same
    }

    /// Points `identity` at `host`. Returns false (and changes nothing) when
    /// the host is not registered.
    pub fn set_current(&self, identity: &str, host: &str) -> bool {
        let mut state = self.lock();
        if !state.sessions.contains_key(host) {
            return false;
        }
        state.current.insert(identity.to_string(), host.to_string());
        true
    }

    pub fn get_current(&self, identity: &str) -> Option<String> {
        self.lock().current.get(identity).cloned()
    }

    pub fn clear_current(&self, identity: &str) -> Option<String> {
        self.lock().current.remove(identity)
    }

    /// The identity's selected session, or `NoActiveSession`. A pointer
    /// whose host is no longer registered is dropped.
    pub fn current_session(&self, identity: &str) -> Result<Arc<RemoteSession>, GatewayError> {
        let host = self
            .get_current(identity)
            .ok_or(GatewayError::NoActiveSession)?;
        match self.get(&host) {
            Some(session) => Ok(session),
            None => {
                self.clear_current(identity);
                Err(GatewayError::NoActiveSession)
            }
        }
    }

    /// Changes the identity's selected host. The idle timer is not touched.
    pub fn switch(&self, identity: &str, host: &str) -> Result<Arc<RemoteSession>, GatewayError> {
        let mut state = self.lock();
        let Some(session) = state.sessions.get(host).cloned() else {
            return Err(GatewayError::NoSuchSession(host.to_string()));
        };
        state.current.insert(identity.to_string(), host.to_string());
        Ok(session)
    }

    pub fn all(&self) -> Vec<Arc<RemoteSession>> {
        self.lock().sessions.values().cloned().collect()
    }

    /// Empties both maps and hands every session to the caller.
    pub fn take_all(&self) -> Vec<Arc<RemoteSession>> {
        let mut state = self.lock();
        state.current.clear();
        state.sessions.drain().map(|(_, session)| session).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
