//! Reuse of protocol clients across sessions.
//!
//! Building a client means re-indexing the whole operation schema, which is
//! worth skipping when sessions to the same engine come and go during a run.

use crate::error::Result;
use crate::schema::OperationDef;
use crate::wire::ProtoClient;
use tracing::debug;

/// Stack of idle, disconnected clients.
#[derive(Default)]
pub struct ClientPool {
    idle: Vec<ProtoClient>,
}

impl ClientPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pop the most recently released client, or build a fresh one from the
    /// operation definitions.
    pub fn acquire(&mut self, defs: &[OperationDef]) -> Result<ProtoClient> {
        match self.idle.pop() {
            Some(client) => {
                debug!("Reusing pooled client, {} left idle", self.idle.len());
                Ok(client)
            }
            None => ProtoClient::from_defs(defs),
        }
    }

    /// Return a client for later reuse. The client keeps its operation index
    /// and last-used target so a reacquired one can reconnect cheaply.
    pub fn release(&mut self, client: ProtoClient) {
        self.idle.push(client);
    }

    pub fn idle_count(&self) -> usize {
        self.idle.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::MARKER_OP;
    use serde_json::Map;

    fn defs() -> Vec<OperationDef> {
        vec![
            OperationDef {
                name: MARKER_OP.to_string(),
                crc: "0x51077d14".to_string(),
                options: Map::new(),
            },
            OperationDef {
                name: "show_version".to_string(),
                crc: "0xc919bde1".to_string(),
                options: Map::new(),
            },
        ]
    }

    #[test]
    fn test_acquire_builds_when_empty() {
        let mut pool = ClientPool::new();
        let client = pool.acquire(&defs()).unwrap();
        assert_eq!(client.index().len(), 2);
        assert_eq!(pool.idle_count(), 0);
    }

    #[test]
    fn test_release_then_acquire_reuses() {
        let mut pool = ClientPool::new();
        let client = pool.acquire(&defs()).unwrap();
        pool.release(client);
        assert_eq!(pool.idle_count(), 1);

        let reused = pool.acquire(&[]).unwrap();
        // Came from the pool: an empty definition list could not have built
        // a client with a populated index.
        assert_eq!(reused.index().len(), 2);
        assert_eq!(pool.idle_count(), 0);
    }

    #[test]
    fn test_acquire_is_lifo() {
        let mut pool = ClientPool::new();
        let first = pool.acquire(&defs()).unwrap();
        let mut extra = defs();
        extra.push(OperationDef {
            name: "show_threads".to_string(),
            crc: "0x51077d14".to_string(),
            options: Map::new(),
        });
        let second = pool.acquire(&extra).unwrap();

        pool.release(first);
        pool.release(second);

        let popped = pool.acquire(&[]).unwrap();
        assert_eq!(popped.index().len(), 3);
    }
}
