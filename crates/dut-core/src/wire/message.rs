//! Wire message types and the operation index.
//!
//! The wire protocol is opaque beyond this: an operation name plus keyword
//! arguments go out, a dict-like reply comes back. Replies optionally carry
//! `"retval"` (0 = success, absent on streamed detail replies) and
//! `"context"` (correlates replies to calls).

use crate::error::{DutError, Result};
use crate::schema::OperationDef;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Marker operation used to verify a fresh connection and to terminate
/// streamed dumps.
pub const MARKER_OP: &str = "control_ping";

/// One request on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub op: String,
    pub context: u32,
    #[serde(default)]
    pub args: Value,
}

impl Request {
    pub fn new(op: impl Into<String>, context: u32, args: Value) -> Self {
        Self {
            op: op.into(),
            context,
            args,
        }
    }

    /// Serialize into a frame payload.
    pub fn to_frame(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// A dict-like reply from the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    payload: Value,
}

impl Reply {
    /// Wrap a parsed value. Anything but a JSON object is a protocol error.
    pub fn from_value(payload: Value) -> Result<Self> {
        if !payload.is_object() {
            return Err(DutError::protocol(format!(
                "reply is not an object: {payload}"
            )));
        }
        Ok(Self { payload })
    }

    /// Parse a reply frame.
    pub fn from_frame(bytes: &[u8]) -> Result<Self> {
        let payload: Value = serde_json::from_slice(bytes)
            .map_err(|e| DutError::protocol(format!("reply is not valid JSON: {e}")))?;
        Self::from_value(payload)
    }

    /// Correlation number, when the engine echoed one.
    pub fn context(&self) -> Option<u64> {
        self.payload.get("context").and_then(Value::as_u64)
    }

    /// Status field; absent on streamed detail replies.
    pub fn retval(&self) -> Option<i64> {
        self.payload.get("retval").and_then(Value::as_i64)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }
}

impl std::fmt::Display for Reply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.payload)
    }
}

/// Explicit name → definition map built once from the loaded schema.
///
/// Construction walks and copies every definition; it is the expensive part
/// of building a protocol client, which is why clients are pooled instead of
/// rebuilt per session.
#[derive(Debug, Clone)]
pub struct OperationIndex {
    ops: HashMap<String, OperationDef>,
}

impl OperationIndex {
    /// Build the index from parsed definitions.
    ///
    /// The marker operation must be present: connection verification and
    /// stream termination depend on it.
    pub fn build(defs: &[OperationDef]) -> Result<Self> {
        let mut ops = HashMap::with_capacity(defs.len());
        for def in defs {
            ops.insert(def.name.clone(), def.clone());
        }
        if !ops.contains_key(MARKER_OP) {
            return Err(DutError::validation(format!(
                "loaded schema does not define {MARKER_OP}"
            )));
        }
        Ok(Self { ops })
    }

    pub fn get(&self, name: &str) -> Option<&OperationDef> {
        self.ops.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.ops.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Whether `name` opens a reply stream: a `_dump` operation with a paired
    /// `_details` definition. Diagnostic classification only; dispatch never
    /// depends on it.
    pub fn is_stream(&self, name: &str) -> bool {
        match name.strip_suffix("_dump") {
            Some(base) => self.ops.contains_key(&format!("{base}_details")),
            None => false,
        }
    }
}
