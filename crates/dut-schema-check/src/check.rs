//! Registry diffing against a schema directory.

use anyhow::{Context, Result};
use dutlink::schema;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::debug;

/// Collection name → (operation → checksum), the registry file format.
type Registry = BTreeMap<String, BTreeMap<String, String>>;

/// One operation whose registered checksum no longer matches the schema
/// directory. `expected` is `None` when the operation vanished from disk.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct Mismatch {
    pub operation: String,
    pub old: String,
    pub expected: Option<String>,
}

/// Outcome of one check run.
pub struct CheckReport {
    /// Distinct mismatches, sorted by operation name.
    pub mismatches: Vec<Mismatch>,
    /// Registry entries compared.
    pub checked: usize,
}

impl CheckReport {
    pub fn passed(&self) -> bool {
        self.mismatches.is_empty()
    }
}

/// Diff the registry file against the schema directory.
///
/// On mismatch the registry is rewritten in place to match the discovered
/// checksums, with vanished operations dropped, so the resulting diff can be
/// reviewed and committed.
pub fn run_check(schema_dir: &Path, registry_path: &Path) -> Result<CheckReport> {
    let raw = std::fs::read_to_string(registry_path)
        .with_context(|| format!("reading registry {}", registry_path.display()))?;
    let mut registry: Registry = serde_json::from_str(&raw)
        .with_context(|| format!("parsing registry {}", registry_path.display()))?;

    let defs = schema::scan_dir(schema_dir)
        .with_context(|| format!("scanning schema directory {}", schema_dir.display()))?;
    let found: BTreeMap<String, String> = defs.into_iter().map(|d| (d.name, d.crc)).collect();
    debug!("Discovered {} operations on disk", found.len());

    let mut mismatches = BTreeSet::new();
    let mut checked = 0usize;
    for entries in registry.values() {
        for (operation, old) in entries {
            checked += 1;
            let expected = found.get(operation);
            if expected.map(String::as_str) != Some(old.as_str()) {
                mismatches.insert(Mismatch {
                    operation: operation.clone(),
                    old: old.clone(),
                    expected: expected.cloned(),
                });
            }
        }
    }

    let mismatches: Vec<Mismatch> = mismatches.into_iter().collect();
    if !mismatches.is_empty() {
        align(&mut registry, &found);
        let rendered = serde_json::to_string_pretty(&registry)?;
        std::fs::write(registry_path, rendered + "\n")
            .with_context(|| format!("rewriting registry {}", registry_path.display()))?;
        debug!("Registry rewritten in place");
    }
    Ok(CheckReport {
        mismatches,
        checked,
    })
}

/// Point every collection entry at the discovered checksum; operations gone
/// from disk are dropped.
fn align(registry: &mut Registry, found: &BTreeMap<String, String>) {
    for entries in registry.values_mut() {
        entries.retain(|operation, _| found.contains_key(operation));
        for (operation, crc) in entries.iter_mut() {
            if let Some(disk) = found.get(operation) {
                *crc = disk.clone();
            }
        }
    }
}
