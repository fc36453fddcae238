//! Wire transport for the engine's control socket.
//!
//! - **frame**: length-prefixed JSON framing
//! - **message**: request/reply types and the operation index
//! - **client**: the pooled protocol client (sync and async transports)

pub mod client;
pub mod frame;
pub mod message;

pub use client::{ExecMode, ProtoClient};
pub use message::{OperationIndex, Reply, Request, MARKER_OP};
