//! dutlink - Resilient RPC client/session layer for driving a remote
//! dataplane engine's control API during test runs.
//!
//! The engine's control socket is only reachable through a per-run SSH
//! forward. This crate manages the tunnel lifecycle, connection reuse,
//! schema compatibility checking, and batch execution in single-reply,
//! streaming, and async shapes, while tolerating a flaky transport
//! underneath.
//!
//! # Example
//!
//! ```rust,ignore
//! use dutlink::{Credentials, Endpoint, ExecMode, ExecutorConfig, RunContext, SchemaRegistry};
//!
//! #[tokio::main]
//! async fn main() -> dutlink::Result<()> {
//!     let mut registry = SchemaRegistry::new();
//!     registry.load_collections_file("supported.json".as_ref())?;
//!     let ctx = RunContext::new(
//!         "/var/cache/engine-api".as_ref(),
//!         registry,
//!         ExecutorConfig::default(),
//!     )?;
//!
//!     let endpoint = Endpoint::new("10.0.1.5", 22, "/run/engine/api.sock");
//!     let creds = Credentials::with_key("testuser", std::fs::read_to_string("id_ed25519")?);
//!     let session = ctx.session(&endpoint, &creds, ExecMode::Sync).await?;
//!
//!     let mut exec = ctx.executor(&session);
//!     let reply = exec
//!         .add("show_version", serde_json::json!({}))
//!         .await?
//!         .get_reply()
//!         .await?;
//!     println!("Engine version: {:?}", reply.get("version"));
//!
//!     ctx.disconnect(&endpoint).await?;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod config;
pub mod context;
pub mod endpoint;
pub mod error;
pub mod pool;
pub mod schema;
pub mod session;
pub mod tunnel;
pub mod wire;

// Re-export commonly used types
pub use cache::ConnectionCache;
pub use config::{ExecutorConfig, TunnelConfig, WireConfig};
pub use context::RunContext;
pub use endpoint::{Auth, Credentials, Endpoint};
pub use error::{DutError, Result};
pub use pool::ClientPool;
pub use schema::{Collection, OperationDef, SchemaRegistry};
pub use session::{Session, SessionExecutor};
pub use tunnel::{TunnelHandle, TunnelManager};
pub use wire::{ExecMode, Reply};
