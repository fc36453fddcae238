//! Parsing of on-disk API definition files.
//!
//! A definition file is JSON with a `"messages"` array. Two dialects exist in
//! the wild and both must load:
//!
//! - current: each message is an object `{"name", "crc", "options"?}`;
//! - legacy: each message is an array whose first string item is the name and
//!   whose last object item carries `"crc"` (no options).
//!
//! Each entry is tried as the current dialect first and falls back to the
//! legacy one, so mixed-era schema trees load without preprocessing.

use crate::error::{DutError, Result};
use serde::Deserialize;
use serde_json::Value;
use std::path::Path;
use tracing::debug;
use walkdir::WalkDir;

/// File name suffix of API definition files.
pub const SCHEMA_FILE_SUFFIX: &str = ".api.json";

/// One remote operation as declared on disk.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationDef {
    pub name: String,
    pub crc: String,
    pub options: serde_json::Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct SchemaFile {
    #[serde(default)]
    messages: Vec<Value>,
}

/// Parse one definition file, accepting both dialects.
pub fn parse_file(path: &Path) -> Result<Vec<OperationDef>> {
    let raw = std::fs::read_to_string(path).map_err(|e| DutError::io_with_path(e, path))?;
    let file: SchemaFile = serde_json::from_str(&raw).map_err(|e| DutError::Json {
        message: format!("{}: {e}", path.display()),
        source: Some(e),
    })?;

    let mut defs = Vec::with_capacity(file.messages.len());
    for entry in &file.messages {
        let def = match parse_current(entry) {
            Some(def) => def,
            None => parse_legacy(entry).ok_or_else(|| DutError::Json {
                message: format!("{}: malformed message entry: {entry}", path.display()),
                source: None,
            })?,
        };
        defs.push(def);
    }
    Ok(defs)
}

/// Current dialect: `{"name": ..., "crc": "0x...", "options": {...}}`.
fn parse_current(entry: &Value) -> Option<OperationDef> {
    let obj = entry.as_object()?;
    let name = obj.get("name")?.as_str()?;
    let crc = obj.get("crc")?.as_str()?;
    let options = match obj.get("options") {
        Some(Value::Object(map)) => map.clone(),
        _ => serde_json::Map::new(),
    };
    Some(OperationDef {
        name: name.to_string(),
        crc: crc.to_string(),
        options,
    })
}

/// Legacy dialect: `[name, ...fields..., {"crc": "0x..."}]`.
///
/// The name is the first string item; the checksum is taken from the last
/// object item that has a `"crc"` key.
fn parse_legacy(entry: &Value) -> Option<OperationDef> {
    let items = entry.as_array()?;
    let name = items.iter().find_map(Value::as_str)?;
    let crc = items.iter().rev().find_map(|item| {
        item.as_object()
            .and_then(|obj| obj.get("crc"))
            .and_then(Value::as_str)
    })?;
    Some(OperationDef {
        name: name.to_string(),
        crc: crc.to_string(),
        options: serde_json::Map::new(),
    })
}

/// Scan a directory tree for `*.api.json` files and parse them all.
///
/// Files are visited in a deterministic order so repeated scans of one tree
/// produce identical definition lists.
pub fn scan_dir(dir: &Path) -> Result<Vec<OperationDef>> {
    let mut defs = Vec::new();
    let mut files = 0usize;
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            let io = e
                .into_io_error()
                .unwrap_or_else(|| std::io::Error::other("walk error"));
            DutError::io_with_path(io, dir)
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if !name.ends_with(SCHEMA_FILE_SUFFIX) {
            continue;
        }
        defs.extend(parse_file(entry.path())?);
        files += 1;
    }
    debug!("Scanned {files} schema files under {}: {} operations", dir.display(), defs.len());
    Ok(defs)
}
