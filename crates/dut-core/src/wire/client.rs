//! Protocol client for the local (forwarded) control socket.
//!
//! A [`ProtoClient`] is expensive to build (constructing its
//! [`OperationIndex`] walks the whole loaded schema), so disconnected clients
//! are pooled and reused across sessions. The connection target and mode are
//! attached metadata: they are kept on disconnect and overwritten by the next
//! connect.
//!
//! In async mode a background reader task owns the read half and feeds every
//! arriving reply into a channel; the foreground only receives. In sync mode
//! the foreground reads the stream directly. Both paths surface through
//! [`ProtoClient::recv`] with the same bounded-wait contract.

use crate::config::WireConfig;
use crate::error::{DutError, Result};
use crate::schema::OperationDef;
use crate::wire::frame::{read_frame, write_frame};
use crate::wire::message::{OperationIndex, Reply, Request, MARKER_OP};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// How a session exchanges batches with the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecMode {
    /// Foreground sends one call and reads its reply directly.
    Sync,
    /// Calls are transmitted as they are added; a background reader task
    /// queues replies for later collection.
    Async,
}

impl std::fmt::Display for ExecMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecMode::Sync => write!(f, "sync"),
            ExecMode::Async => write!(f, "async"),
        }
    }
}

struct AsyncConn {
    writer: OwnedWriteHalf,
    replies: mpsc::UnboundedReceiver<Result<Reply>>,
    reader: JoinHandle<()>,
}

impl Drop for AsyncConn {
    fn drop(&mut self) {
        // The reader owns the read half; without this it would outlive us,
        // parked on a read that can no longer matter.
        self.reader.abort();
    }
}

enum Conn {
    Sync(UnixStream),
    Async(AsyncConn),
}

/// Reusable low-level client for one control socket at a time.
pub struct ProtoClient {
    index: OperationIndex,
    next_context: u32,
    target: Option<PathBuf>,
    mode: ExecMode,
    conn: Option<Conn>,
}

impl ProtoClient {
    /// Build a disconnected client from parsed schema definitions.
    pub fn from_defs(defs: &[OperationDef]) -> Result<Self> {
        Ok(Self {
            index: OperationIndex::build(defs)?,
            next_context: 1,
            target: None,
            mode: ExecMode::Sync,
            conn: None,
        })
    }

    pub fn index(&self) -> &OperationIndex {
        &self.index
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    pub fn mode(&self) -> ExecMode {
        self.mode
    }

    /// Dial the socket, verify it with one marker round-trip, and (in async
    /// mode) start the reader task.
    pub async fn connect(&mut self, socket: &Path, mode: ExecMode) -> Result<()> {
        if self.conn.is_some() {
            return Err(DutError::validation(
                "client is already connected; disconnect first",
            ));
        }
        self.connect_inner(socket, mode).await
    }

    /// Drop the transport and re-dial the remembered target once.
    ///
    /// Used for the single transparent retry of a failed sync exchange; the
    /// tunnel underneath is left alone.
    pub async fn reconnect(&mut self) -> Result<()> {
        let target = self
            .target
            .clone()
            .ok_or_else(|| DutError::validation("client was never connected"))?;
        let mode = self.mode;
        self.disconnect();
        tokio::time::sleep(WireConfig::RECONNECT_PAUSE).await;
        self.connect_inner(&target, mode).await
    }

    async fn connect_inner(&mut self, socket: &Path, mode: ExecMode) -> Result<()> {
        let mut stream = tokio::time::timeout(
            WireConfig::CONNECT_TIMEOUT,
            UnixStream::connect(socket),
        )
        .await
        .map_err(|_| {
            DutError::connection(format!("timed out dialing {}", socket.display()))
        })?
        .map_err(|e| DutError::Connection {
            message: format!("dialing {}: {e}", socket.display()),
            source: Some(e),
        })?;

        self.verify(&mut stream).await?;

        self.target = Some(socket.to_path_buf());
        self.mode = mode;
        self.conn = Some(match mode {
            ExecMode::Sync => Conn::Sync(stream),
            ExecMode::Async => Conn::Async(spawn_reader(stream)),
        });
        debug!("Connected to {} in {mode} mode", socket.display());
        Ok(())
    }

    /// One marker round-trip proving the socket leads to a live engine.
    /// Any failure here is a connection error: nothing was cached yet and
    /// the caller should treat the endpoint as unreachable.
    async fn verify(&mut self, stream: &mut UnixStream) -> Result<()> {
        let context = self.take_context();
        let request = Request::new(MARKER_OP, context, Value::Object(Default::default()));
        let frame = request.to_frame()?;

        let exchange = async {
            write_frame(stream, &frame).await?;
            match read_frame(stream).await? {
                Some(bytes) => Reply::from_frame(&bytes),
                None => Err(DutError::connection("peer closed during verification")),
            }
        };
        let reply = tokio::time::timeout(WireConfig::CONNECT_TIMEOUT, exchange)
            .await
            .map_err(|_| DutError::connection("verification ping timed out"))?
            .map_err(|e| DutError::connection(format!("verification ping failed: {e}")))?;

        if reply.context() != Some(u64::from(context)) {
            return Err(DutError::connection(format!(
                "verification ping answered with context {:?}, expected {context}",
                reply.context()
            )));
        }
        if let Some(retval) = reply.retval() {
            if retval != 0 {
                return Err(DutError::connection(format!(
                    "verification ping returned retval {retval}"
                )));
            }
        }
        Ok(())
    }

    /// Serialize and transmit one call; returns the context it was issued
    /// under.
    pub async fn send(&mut self, op: &str, args: &Value) -> Result<u32> {
        if !self.index.contains(op) {
            return Err(DutError::validation(format!(
                "operation {op} is not present in the loaded schema"
            )));
        }
        let context = self.take_context();
        let frame = Request::new(op, context, args.clone()).to_frame()?;
        match self.conn.as_mut() {
            Some(Conn::Sync(stream)) => write_frame(stream, &frame).await?,
            Some(Conn::Async(conn)) => write_frame(&mut conn.writer, &frame).await?,
            None => return Err(DutError::connection("client is not connected")),
        }
        Ok(context)
    }

    /// Bounded-wait read of the next reply.
    ///
    /// `Ok(None)` means nothing arrived within `wait`; the caller decides
    /// whether that is a retryable empty read or a timeout. A closed
    /// transport is a connection error.
    pub async fn recv(&mut self, wait: Duration) -> Result<Option<Reply>> {
        match self.conn.as_mut() {
            Some(Conn::Sync(stream)) => {
                // A lapsed wait cancels the read between frames: the engine
                // writes each frame in one burst, so a partial prefix is not
                // observed in practice.
                match tokio::time::timeout(wait, read_frame(stream)).await {
                    Err(_) => Ok(None),
                    Ok(Err(e)) => Err(e),
                    Ok(Ok(None)) => Err(DutError::connection("connection closed by peer")),
                    Ok(Ok(Some(bytes))) => Reply::from_frame(&bytes).map(Some),
                }
            }
            Some(Conn::Async(conn)) => match tokio::time::timeout(wait, conn.replies.recv()).await
            {
                Err(_) => Ok(None),
                Ok(None) => Err(DutError::connection("reader task ended; connection closed")),
                Ok(Some(result)) => result.map(Some),
            },
            None => Err(DutError::connection("client is not connected")),
        }
    }

    /// Drop the transport. The operation index and the remembered target
    /// stay attached; the next use overwrites them.
    pub fn disconnect(&mut self) {
        if self.conn.take().is_some() {
            debug!("Client disconnected from {:?}", self.target);
        }
    }

    /// Contexts are issued starting at 1; 0 is never used so unsolicited
    /// replies cannot alias a real call.
    fn take_context(&mut self) -> u32 {
        let context = self.next_context;
        self.next_context = self.next_context.checked_add(1).unwrap_or(1);
        context
    }
}

/// Split the stream and start the reader task feeding the reply channel.
fn spawn_reader(stream: UnixStream) -> AsyncConn {
    let (read_half, writer) = stream.into_split();
    let (tx, replies) = mpsc::unbounded_channel();
    let reader = tokio::spawn(read_loop(read_half, tx));
    AsyncConn {
        writer,
        replies,
        reader,
    }
}

async fn read_loop(mut read_half: OwnedReadHalf, tx: mpsc::UnboundedSender<Result<Reply>>) {
    loop {
        let item = match read_frame(&mut read_half).await {
            Ok(Some(bytes)) => Reply::from_frame(&bytes),
            Ok(None) => break, // clean EOF; closing the channel says the rest
            Err(e) => {
                warn!("Reader task stopping: {e}");
                let _ = tx.send(Err(e));
                break;
            }
        };
        let fatal = item.is_err();
        if tx.send(item).is_err() || fatal {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::net::UnixListener;

    fn test_defs() -> Vec<OperationDef> {
        ["show_version", "iface_dump", "iface_details", MARKER_OP]
            .iter()
            .map(|name| OperationDef {
                name: name.to_string(),
                crc: "0x01".to_string(),
                options: serde_json::Map::new(),
            })
            .collect()
    }

    /// Accepts connections forever; answers every request with its context
    /// echoed and retval 0.
    async fn serve_echo(listener: UnixListener) {
        loop {
            let (mut stream, _) = listener.accept().await.unwrap();
            tokio::spawn(async move {
                while let Ok(Some(bytes)) = read_frame(&mut stream).await {
                    let req: Request = serde_json::from_slice(&bytes).unwrap();
                    let reply =
                        serde_json::json!({"context": req.context, "retval": 0, "op": req.op});
                    if write_frame(&mut stream, reply.to_string().as_bytes())
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            });
        }
    }

    fn start_echo_server(dir: &TempDir) -> PathBuf {
        let path = dir.path().join("engine.sock");
        let listener = UnixListener::bind(&path).unwrap();
        tokio::spawn(serve_echo(listener));
        path
    }

    #[tokio::test]
    async fn test_connect_verifies_and_exchanges() {
        let tmp = TempDir::new().unwrap();
        let socket = start_echo_server(&tmp);

        let mut client = ProtoClient::from_defs(&test_defs()).unwrap();
        client.connect(&socket, ExecMode::Sync).await.unwrap();
        assert!(client.is_connected());

        let context = client
            .send("show_version", &serde_json::json!({}))
            .await
            .unwrap();
        let reply = client
            .recv(Duration::from_secs(1))
            .await
            .unwrap()
            .expect("reply expected");
        assert_eq!(reply.context(), Some(u64::from(context)));
        assert_eq!(reply.retval(), Some(0));
    }

    #[tokio::test]
    async fn test_connect_to_missing_socket_is_a_connection_error() {
        let tmp = TempDir::new().unwrap();
        let socket = tmp.path().join("nobody-home.sock");

        let mut client = ProtoClient::from_defs(&test_defs()).unwrap();
        let err = client.connect(&socket, ExecMode::Sync).await.unwrap_err();
        assert!(err.is_connection());
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_send_unknown_operation_is_rejected_locally() {
        let tmp = TempDir::new().unwrap();
        let socket = start_echo_server(&tmp);

        let mut client = ProtoClient::from_defs(&test_defs()).unwrap();
        client.connect(&socket, ExecMode::Sync).await.unwrap();

        let err = client
            .send("not_in_schema", &serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, DutError::Validation { .. }));
    }

    #[tokio::test]
    async fn test_async_reader_preserves_order() {
        let tmp = TempDir::new().unwrap();
        let socket = start_echo_server(&tmp);

        let mut client = ProtoClient::from_defs(&test_defs()).unwrap();
        client.connect(&socket, ExecMode::Async).await.unwrap();

        let mut contexts = Vec::new();
        for _ in 0..5 {
            contexts.push(
                client
                    .send("show_version", &serde_json::json!({}))
                    .await
                    .unwrap(),
            );
        }
        for expected in contexts {
            let reply = client
                .recv(Duration::from_secs(1))
                .await
                .unwrap()
                .expect("reply expected");
            assert_eq!(reply.context(), Some(u64::from(expected)));
        }
    }

    #[tokio::test]
    async fn test_recv_empty_within_bound_returns_none() {
        let tmp = TempDir::new().unwrap();
        let socket = start_echo_server(&tmp);

        let mut client = ProtoClient::from_defs(&test_defs()).unwrap();
        client.connect(&socket, ExecMode::Sync).await.unwrap();

        // Nothing outstanding, so nothing arrives.
        let got = client.recv(Duration::from_millis(50)).await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn test_disconnect_keeps_metadata_and_allows_reconnect() {
        let tmp = TempDir::new().unwrap();
        let socket = start_echo_server(&tmp);

        let mut client = ProtoClient::from_defs(&test_defs()).unwrap();
        client.connect(&socket, ExecMode::Sync).await.unwrap();
        let index_len = client.index().len();

        client.disconnect();
        assert!(!client.is_connected());
        assert_eq!(client.index().len(), index_len);

        client.reconnect().await.unwrap();
        assert!(client.is_connected());
        client
            .send("show_version", &serde_json::json!({}))
            .await
            .unwrap();
        client
            .recv(Duration::from_secs(1))
            .await
            .unwrap()
            .expect("reply expected");
    }
}
