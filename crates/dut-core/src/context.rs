//! Per-run context wiring the registry, pool, cache, and sessions together.
//!
//! One [`RunContext`] per test run replaces process-wide singletons: every
//! component that used to be global state hangs off the context and dies
//! with it. The context hands out sessions (creating tunnel, client, and
//! cache entry on first use) and executors bound to its schema registry.

use crate::cache::ConnectionCache;
use crate::config::ExecutorConfig;
use crate::endpoint::{Credentials, Endpoint};
use crate::error::{DutError, Result};
use crate::pool::ClientPool;
use crate::schema::{OperationDef, SchemaRegistry};
use crate::session::{Session, SessionExecutor};
use crate::tunnel::TunnelManager;
use crate::wire::{ExecMode, ProtoClient};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

/// Run-wide state: the schema registry, the client pool, and the session
/// cache.
pub struct RunContext {
    schema: Mutex<SchemaRegistry>,
    pool: Mutex<ClientPool>,
    cache: ConnectionCache,
    config: ExecutorConfig,
    defs: Vec<OperationDef>,
}

impl RunContext {
    /// Load the schema directory through the registry and assemble the
    /// run-wide state.
    pub fn new(
        schema_dir: &Path,
        mut registry: SchemaRegistry,
        config: ExecutorConfig,
    ) -> Result<Self> {
        let defs = registry.load(schema_dir)?;
        info!(
            "Loaded {} operation definitions from {}",
            defs.len(),
            schema_dir.display()
        );
        Ok(Self {
            schema: Mutex::new(registry),
            pool: Mutex::new(ClientPool::new()),
            cache: ConnectionCache::new(),
            config,
            defs,
        })
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Operation definitions discovered at load time.
    pub fn defs(&self) -> &[OperationDef] {
        &self.defs
    }

    /// The run's schema registry, for explicit conflict reporting.
    pub fn registry(&self) -> &Mutex<SchemaRegistry> {
        &self.schema
    }

    pub fn cache(&self) -> &ConnectionCache {
        &self.cache
    }

    /// Idle clients currently held by the pool.
    pub fn pooled_clients(&self) -> usize {
        self.pool().idle_count()
    }

    /// Session to an endpoint behind a fresh tunnel. An already cached
    /// session for the endpoint is returned as-is.
    pub async fn session(
        &self,
        endpoint: &Endpoint,
        credentials: &Credentials,
        mode: ExecMode,
    ) -> Result<Arc<Session>> {
        if let Some(existing) = self.cached(endpoint, mode)? {
            return Ok(existing);
        }
        let tunnel = TunnelManager::open(endpoint, credentials).await?;
        match self.connect_client(tunnel.local_socket(), mode).await {
            Ok(client) => {
                let session = Arc::new(Session::new(endpoint.clone(), mode, client, Some(tunnel)));
                self.cache.put(Arc::clone(&session))?;
                Ok(session)
            }
            Err(e) => {
                // The tunnel is useless without a verified connection.
                if let Err(close_err) = TunnelManager::close(tunnel).await {
                    warn!("Closing tunnel after failed connect: {close_err}");
                }
                Err(e)
            }
        }
    }

    /// Session over an already reachable socket, no tunnel of our own. For
    /// engines running locally or behind an externally maintained forward.
    pub async fn session_direct(
        &self,
        endpoint: &Endpoint,
        mode: ExecMode,
    ) -> Result<Arc<Session>> {
        if let Some(existing) = self.cached(endpoint, mode)? {
            return Ok(existing);
        }
        let client = self.connect_client(endpoint.socket_path(), mode).await?;
        let session = Arc::new(Session::new(endpoint.clone(), mode, client, None));
        self.cache.put(Arc::clone(&session))?;
        Ok(session)
    }

    /// Explicit teardown for one endpoint: the client goes back to the pool,
    /// the tunnel gets closed. Unknown endpoints are a no-op.
    pub async fn disconnect(&self, endpoint: &Endpoint) -> Result<()> {
        let Some(session) = self.cache.remove(endpoint) else {
            debug!("No session registered for {endpoint}");
            return Ok(());
        };
        let (client, tunnel) = session.take_parts().await;
        if let Some(mut client) = client {
            client.disconnect();
            self.pool().release(client);
        }
        if let Some(tunnel) = tunnel {
            TunnelManager::close(tunnel).await?;
        }
        info!("Disconnected session for {endpoint}");
        Ok(())
    }

    /// Tear down every cached session.
    pub async fn disconnect_all(&self) -> Result<()> {
        for endpoint in self.cache.endpoints() {
            self.disconnect(&endpoint).await?;
        }
        Ok(())
    }

    /// Batch executor bound to a session and this run's registry.
    pub fn executor(&self, session: &Arc<Session>) -> SessionExecutor<'_> {
        SessionExecutor::new(Arc::clone(session), &self.schema, self.config.clone())
    }

    fn pool(&self) -> MutexGuard<'_, ClientPool> {
        self.pool.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cached(&self, endpoint: &Endpoint, mode: ExecMode) -> Result<Option<Arc<Session>>> {
        match self.cache.get(endpoint) {
            Some(existing) if existing.mode() == mode => Ok(Some(existing)),
            Some(existing) => Err(DutError::validation(format!(
                "session for {endpoint} is open in {} mode, requested {mode}",
                existing.mode()
            ))),
            None => Ok(None),
        }
    }

    /// Acquire a pooled client and connect it; a failed dial returns the
    /// client to the pool since only the transport was at fault.
    async fn connect_client(&self, socket: &Path, mode: ExecMode) -> Result<ProtoClient> {
        let mut client = self.pool().acquire(&self.defs)?;
        match client.connect(socket, mode).await {
            Ok(()) => Ok(client),
            Err(e) => {
                self.pool().release(client);
                Err(e)
            }
        }
    }
}
