//! Sessions and batch execution.
//!
//! A [`Session`] is the live channel to one endpoint: the connected protocol
//! client plus the tunnel keeping its socket reachable. A
//! [`SessionExecutor`] accumulates a batch of calls against one session and
//! executes it in one of three shapes: single reply, one reply per call, or
//! a marker-bounded detail stream.
//!
//! A batch is taken out of the executor exactly once, at the start of an
//! execution attempt, so a failed run never leaves stale calls behind. After
//! any failure the transport is drained within a bounded budget, keeping the
//! session usable for the next batch.

use crate::config::ExecutorConfig;
use crate::endpoint::Endpoint;
use crate::error::{DutError, Result};
use crate::schema::SchemaRegistry;
use crate::tunnel::TunnelHandle;
use crate::wire::{ExecMode, ProtoClient, Reply, MARKER_OP};
use serde_json::Value;
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Read step while draining stale replies after a failure.
const DRAIN_READ_WAIT: Duration = Duration::from_millis(200);

struct SessionInner {
    client: Option<ProtoClient>,
    tunnel: Option<TunnelHandle>,
}

/// Connected channel to one endpoint.
///
/// Created lazily by the run context, kept in its cache across many batches,
/// and torn down only by an explicit disconnect. One caller drives one
/// session at a time; batches are never interleaved.
pub struct Session {
    endpoint: Endpoint,
    mode: ExecMode,
    inner: Mutex<SessionInner>,
}

impl Session {
    pub(crate) fn new(
        endpoint: Endpoint,
        mode: ExecMode,
        client: ProtoClient,
        tunnel: Option<TunnelHandle>,
    ) -> Self {
        Self {
            endpoint,
            mode,
            inner: Mutex::new(SessionInner {
                client: Some(client),
                tunnel,
            }),
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn mode(&self) -> ExecMode {
        self.mode
    }

    /// Strip the session for teardown: the client goes back to the pool, the
    /// tunnel gets closed. A stripped session rejects further use.
    pub(crate) async fn take_parts(&self) -> (Option<ProtoClient>, Option<TunnelHandle>) {
        let mut inner = self.inner.lock().await;
        (inner.client.take(), inner.tunnel.take())
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("endpoint", &self.endpoint)
            .field("mode", &self.mode)
            .finish()
    }
}

/// One queued call. Async mode transmits at add time and keeps only the
/// issued context; sync mode keeps the owned arguments for later
/// transmission.
#[derive(Debug)]
struct QueuedCall {
    op: String,
    sent_context: Option<u32>,
    args: Value,
}

impl QueuedCall {
    fn args_display(&self) -> String {
        if self.sent_context.is_some() {
            "(args not retained)".to_string()
        } else {
            self.args.to_string()
        }
    }
}

/// Batch builder and executor for one session.
///
/// Obtained from the run context; borrows the run's schema registry so every
/// added operation is checked against the surviving collections first.
#[derive(Debug)]
pub struct SessionExecutor<'a> {
    session: Arc<Session>,
    registry: &'a std::sync::Mutex<SchemaRegistry>,
    config: ExecutorConfig,
    batch: Vec<QueuedCall>,
}

impl<'a> SessionExecutor<'a> {
    pub(crate) fn new(
        session: Arc<Session>,
        registry: &'a std::sync::Mutex<SchemaRegistry>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            session,
            registry,
            config,
            batch: Vec::new(),
        }
    }

    /// Number of calls currently queued.
    pub fn queued(&self) -> usize {
        self.batch.len()
    }

    /// Queue one call, checking the operation against the schema registry
    /// first. In async mode the call is transmitted immediately and only a
    /// lightweight placeholder is queued; in sync mode the owned arguments
    /// are kept until execution. Returns `self` for chaining.
    pub async fn add(&mut self, op: impl Into<String>, args: Value) -> Result<&mut Self> {
        let op = op.into();
        {
            let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
            registry.report_initial_conflicts()?;
            registry.check_operation(&op)?;
        }
        match self.session.mode() {
            ExecMode::Async => {
                let mut inner = self.session.inner.lock().await;
                let client = inner.client.as_mut().ok_or_else(disconnected)?;
                let context = client.send(&op, &args).await?;
                self.batch.push(QueuedCall {
                    op,
                    sent_context: Some(context),
                    args: Value::Null,
                });
            }
            ExecMode::Sync => {
                self.batch.push(QueuedCall {
                    op,
                    sent_context: None,
                    args,
                });
            }
        }
        Ok(self)
    }

    /// Execute a single-call batch and return its one reply.
    ///
    /// Fails when the batch holds zero or more than one call. In sync mode
    /// the exchange gets one transparent reconnect-and-retry on a connection
    /// error before the failure surfaces.
    pub async fn get_reply(&mut self) -> Result<Reply> {
        let call = match <[QueuedCall; 1]>::try_from(self.take_batch()) {
            Ok([call]) => call,
            Err(batch) => {
                return Err(DutError::validation(format!(
                    "get_reply expects exactly one queued call, got {}",
                    batch.len()
                )))
            }
        };

        let mut inner = self.session.inner.lock().await;
        let client = inner.client.as_mut().ok_or_else(disconnected)?;
        let result = match self.session.mode() {
            ExecMode::Async => self.read_matching(client, &call).await,
            ExecMode::Sync => self.exchange_with_retry(client, &call).await,
        };
        match result {
            Ok(reply) => Ok(reply),
            Err(e) => {
                drain(client, self.config.drain_timeout).await;
                Err(e)
            }
        }
    }

    /// Collect one reply per queued call, in issue order. Async sessions
    /// only: the calls were already transmitted by [`SessionExecutor::add`].
    ///
    /// Each read waits up to the configured bound, with a small number of
    /// retries on spurious empty reads; exhausting them is a fatal timeout.
    pub async fn get_replies(&mut self) -> Result<Vec<Reply>> {
        let batch = self.take_batch();
        if self.session.mode() != ExecMode::Async {
            return Err(DutError::validation(
                "get_replies requires an async session; use get_reply or get_details",
            ));
        }
        if batch.is_empty() {
            return Ok(Vec::new());
        }

        let mut inner = self.session.inner.lock().await;
        let client = inner.client.as_mut().ok_or_else(disconnected)?;
        match self.collect_in_order(client, &batch).await {
            Ok(replies) => Ok(replies),
            Err(e) => {
                drain(client, self.config.drain_timeout).await;
                Err(e)
            }
        }
    }

    /// Execute queued dump calls and collect their detail replies. Sync
    /// sessions only.
    ///
    /// Each dump is followed by a marker call; detail replies carry the
    /// dump's context and the stream ends when the marker's context comes
    /// back. A reply with any other context is a protocol error.
    pub async fn get_details(&mut self) -> Result<Vec<Reply>> {
        let batch = self.take_batch();
        if self.session.mode() != ExecMode::Sync {
            return Err(DutError::validation(
                "get_details requires a sync session; async batches use get_replies",
            ));
        }
        if batch.is_empty() {
            return Ok(Vec::new());
        }

        let mut inner = self.session.inner.lock().await;
        let client = inner.client.as_mut().ok_or_else(disconnected)?;
        let mut details = Vec::new();
        for call in &batch {
            if !client.index().is_stream(&call.op) {
                warn!("Operation {} does not look like a dump", call.op);
            }
            let streamed = match self.stream_once(client, call).await {
                Err(e) if e.is_connection() => {
                    // Partial details from the dead transport are discarded;
                    // the dump restarts from scratch on the new connection.
                    warn!("Stream of {} failed ({e}); reconnecting once", call.op);
                    if let Err(e) = client.reconnect().await {
                        drain(client, self.config.drain_timeout).await;
                        return Err(e);
                    }
                    self.stream_once(client, call).await
                }
                other => other,
            };
            match streamed {
                Ok(mut replies) => details.append(&mut replies),
                Err(e) => {
                    drain(client, self.config.drain_timeout).await;
                    return Err(e);
                }
            }
        }
        Ok(details)
    }

    fn take_batch(&mut self) -> Vec<QueuedCall> {
        std::mem::take(&mut self.batch)
    }

    /// Read replies for already-transmitted calls, enforcing issue order.
    async fn collect_in_order(
        &self,
        client: &mut ProtoClient,
        batch: &[QueuedCall],
    ) -> Result<Vec<Reply>> {
        let mut replies = Vec::with_capacity(batch.len());
        for call in batch {
            replies.push(self.read_matching(client, call).await?);
        }
        Ok(replies)
    }

    /// Read the reply for one transmitted call and validate it.
    async fn read_matching(&self, client: &mut ProtoClient, call: &QueuedCall) -> Result<Reply> {
        let expected = call.sent_context.map(u64::from).ok_or_else(|| {
            DutError::validation(format!("queued call {} was never transmitted", call.op))
        })?;
        let reply = self.read_reply(client, call).await?;
        match reply.context() {
            Some(context) if context == expected => {}
            other => {
                return Err(DutError::protocol(format!(
                    "reply for {} arrived with context {other:?}, expected {expected}",
                    call.op
                )))
            }
        }
        validate_retval(&call.op, &call.args_display(), &reply)?;
        Ok(reply)
    }

    /// Sync exchange with one transparent reconnect-and-retry on a
    /// connection error. The request that died with the old transport is
    /// re-driven from scratch.
    async fn exchange_with_retry(
        &self,
        client: &mut ProtoClient,
        call: &QueuedCall,
    ) -> Result<Reply> {
        let reply = match self.exchange_once(client, call).await {
            Err(e) if e.is_connection() => {
                warn!("Exchange of {} failed ({e}); reconnecting once", call.op);
                client.reconnect().await?;
                self.exchange_once(client, call).await?
            }
            other => other?,
        };
        validate_retval(&call.op, &call.args_display(), &reply)?;
        Ok(reply)
    }

    /// One send-and-read round trip for a plain call.
    async fn exchange_once(&self, client: &mut ProtoClient, call: &QueuedCall) -> Result<Reply> {
        let context = u64::from(client.send(&call.op, &call.args).await?);
        let reply = self.read_reply(client, call).await?;
        match reply.context() {
            Some(got) if got == context => Ok(reply),
            other => Err(DutError::protocol(format!(
                "reply for {} arrived with context {other:?}, expected {context}",
                call.op
            ))),
        }
    }

    /// Drive one dump: send the main call, then the marker bounding the
    /// stream, then collect detail replies until the marker's context comes
    /// back.
    async fn stream_once(&self, client: &mut ProtoClient, call: &QueuedCall) -> Result<Vec<Reply>> {
        let main_context = u64::from(client.send(&call.op, &call.args).await?);
        let marker_context =
            u64::from(client.send(MARKER_OP, &Value::Object(Default::default())).await?);

        let mut details = Vec::new();
        loop {
            let reply = self.read_reply(client, call).await.map_err(|e| match e {
                // Silence while a stream is open means the terminator never
                // arrived; that is a protocol fault, not a slow engine.
                DutError::Timeout { message } => DutError::protocol(format!(
                    "stream of {} ended without its terminator: {message}",
                    call.op
                )),
                other => other,
            })?;
            match reply.context() {
                Some(context) if context == main_context => {
                    validate_retval(&call.op, &call.args_display(), &reply)?;
                    details.push(reply);
                }
                Some(context) if context == marker_context => {
                    validate_retval(MARKER_OP, "{}", &reply)?;
                    break;
                }
                other => {
                    return Err(DutError::protocol(format!(
                        "reply with context {other:?} while streaming {}, \
                         expected {main_context} or {marker_context}",
                        call.op
                    )))
                }
            }
        }
        Ok(details)
    }

    /// Bounded read with retries on spurious empty reads.
    async fn read_reply(&self, client: &mut ProtoClient, call: &QueuedCall) -> Result<Reply> {
        let mut attempt = 0u32;
        loop {
            match client.recv(self.config.reply_timeout).await? {
                Some(reply) => return Ok(reply),
                None => {
                    if attempt >= self.config.empty_read_retries {
                        return Err(DutError::timeout(format!(
                            "no reply to {}({}) within {:?} after {attempt} extra attempts",
                            call.op,
                            call.args_display(),
                            self.config.reply_timeout
                        )));
                    }
                    attempt += 1;
                    debug!(
                        "Empty read for {}, attempt {attempt} of {}",
                        call.op, self.config.empty_read_retries
                    );
                    tokio::time::sleep(self.config.backoff_delay()).await;
                }
            }
        }
    }
}

fn disconnected() -> DutError {
    DutError::connection("session was disconnected; open a new one via the run context")
}

fn validate_retval(op: &str, args: &str, reply: &Reply) -> Result<()> {
    match reply.retval() {
        Some(retval) if retval != 0 => Err(DutError::RemoteOperation {
            op: op.to_string(),
            args: args.to_string(),
            retval,
            reply: reply.payload().to_string(),
        }),
        _ => Ok(()),
    }
}

/// Pull stale replies off the transport so the next batch starts clean.
async fn drain(client: &mut ProtoClient, budget: Duration) {
    let deadline = tokio::time::Instant::now() + budget;
    let mut drained = 0usize;
    loop {
        let now = tokio::time::Instant::now();
        if now >= deadline {
            break;
        }
        match client.recv(DRAIN_READ_WAIT.min(deadline - now)).await {
            Ok(Some(_)) => drained += 1,
            Ok(None) | Err(_) => break,
        }
    }
    if drained > 0 {
        debug!("Drained {drained} stale replies");
    }
}
