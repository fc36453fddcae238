//! Run-wide map of live sessions, keyed by endpoint.

use crate::endpoint::Endpoint;
use crate::error::{DutError, Result};
use crate::session::Session;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Registry of currently connected sessions.
///
/// Shared by reference across the run; interior mutability keeps the calling
/// side free of `&mut` plumbing.
#[derive(Default)]
pub struct ConnectionCache {
    sessions: Mutex<HashMap<Endpoint, Arc<Session>>>,
}

impl ConnectionCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn guard(&self) -> MutexGuard<'_, HashMap<Endpoint, Arc<Session>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Look up the live session for an endpoint.
    pub fn get(&self, endpoint: &Endpoint) -> Option<Arc<Session>> {
        self.guard().get(endpoint).cloned()
    }

    /// Register a session under its endpoint. Overwriting silently would
    /// leak the displaced session's tunnel, so an occupied slot is an error.
    pub fn put(&self, session: Arc<Session>) -> Result<()> {
        match self.guard().entry(session.endpoint().clone()) {
            Entry::Occupied(entry) => Err(DutError::validation(format!(
                "a session for {} is already registered",
                entry.key()
            ))),
            Entry::Vacant(slot) => {
                slot.insert(session);
                Ok(())
            }
        }
    }

    /// Drop the entry for an endpoint, handing the session back so the
    /// caller can tear it down. Absent entries are not an error.
    pub fn remove(&self, endpoint: &Endpoint) -> Option<Arc<Session>> {
        self.guard().remove(endpoint)
    }

    /// Endpoints with a registered session.
    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.guard().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.guard().len()
    }

    pub fn is_empty(&self) -> bool {
        self.guard().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::OperationDef;
    use crate::wire::{ExecMode, ProtoClient, MARKER_OP};
    use serde_json::Map;

    fn session(host: &str) -> Arc<Session> {
        let defs = vec![OperationDef {
            name: MARKER_OP.to_string(),
            crc: "0x51077d14".to_string(),
            options: Map::new(),
        }];
        let client = ProtoClient::from_defs(&defs).unwrap();
        Arc::new(Session::new(
            Endpoint::new(host, 22, "/run/engine/api.sock"),
            ExecMode::Sync,
            client,
            None,
        ))
    }

    #[test]
    fn test_put_then_get() {
        let cache = ConnectionCache::new();
        let session = session("10.0.1.5");
        cache.put(Arc::clone(&session)).unwrap();

        let hit = cache.get(session.endpoint()).unwrap();
        assert!(Arc::ptr_eq(&hit, &session));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_get_unknown_endpoint_is_none() {
        let cache = ConnectionCache::new();
        assert!(cache
            .get(&Endpoint::new("10.0.1.5", 22, "/run/engine/api.sock"))
            .is_none());
    }

    #[test]
    fn test_put_over_existing_entry_fails() {
        let cache = ConnectionCache::new();
        cache.put(session("10.0.1.5")).unwrap();

        let err = cache.put(session("10.0.1.5")).unwrap_err();
        assert!(err.to_string().contains("already registered"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_remove_hands_back_the_session_once() {
        let cache = ConnectionCache::new();
        let session = session("10.0.1.5");
        let endpoint = session.endpoint().clone();
        cache.put(session).unwrap();

        assert!(cache.remove(&endpoint).is_some());
        assert!(cache.remove(&endpoint).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_distinct_endpoints_coexist() {
        let cache = ConnectionCache::new();
        cache.put(session("10.0.1.5")).unwrap();
        cache.put(session("10.0.1.6")).unwrap();

        assert_eq!(cache.endpoints().len(), 2);
    }
}
