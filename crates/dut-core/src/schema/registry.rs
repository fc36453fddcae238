//! Collection tracking and checksum compatibility checking.
//!
//! A [`Collection`] is one self-consistent supported remote-API version. The
//! registry discovers the checksums actually on disk and narrows the set of
//! surviving collections as evidence accumulates; the set only ever shrinks.
//! A conflict that would wipe out every collection is remembered instead of
//! applied, so it can be reported exactly once with full context rather than
//! failing whatever call happened to trip it.

use crate::error::{DutError, Result};
use crate::schema::defs::{self, OperationDef};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, warn};

/// A named set of (operation, checksum) pairs for one supported API version.
#[derive(Debug, Clone, PartialEq)]
pub struct Collection {
    pub name: String,
    pub entries: BTreeMap<String, String>,
}

/// Tracks which collections are still compatible with the discovered schema.
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    /// Surviving collections in registration order.
    collections: Vec<Collection>,
    /// Checksums discovered on disk, by operation name.
    found: BTreeMap<String, String>,
    /// Operations already reported as unsupported; the value is the
    /// discovered checksum, `None` when the operation never appeared on disk.
    reported: BTreeMap<String, Option<String>>,
    initial_reported: bool,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a collection. Duplicate names are rejected.
    pub fn register_collection(
        &mut self,
        name: impl Into<String>,
        entries: BTreeMap<String, String>,
    ) -> Result<()> {
        let name = name.into();
        if self.collections.iter().any(|c| c.name == name) {
            return Err(DutError::validation(format!(
                "collection {name} already registered"
            )));
        }
        self.collections.push(Collection { name, entries });
        Ok(())
    }

    /// Register every collection declared in a JSON registry file.
    ///
    /// The file maps collection name to an object of operation → checksum.
    pub fn load_collections_file(&mut self, path: &Path) -> Result<usize> {
        let raw = std::fs::read_to_string(path).map_err(|e| DutError::io_with_path(e, path))?;
        let parsed: BTreeMap<String, BTreeMap<String, String>> =
            serde_json::from_str(&raw).map_err(|e| DutError::Json {
                message: format!("{}: {e}", path.display()),
                source: Some(e),
            })?;
        let count = parsed.len();
        for (name, entries) in parsed {
            self.register_collection(name, entries)?;
        }
        Ok(count)
    }

    /// Scan a schema directory and check every discovered checksum against
    /// the registered collections. Returns the parsed definitions so the
    /// caller can build operation indexes from the same pass.
    pub fn load(&mut self, dir: &Path) -> Result<Vec<OperationDef>> {
        let defs = defs::scan_dir(dir)?;
        for def in &defs {
            self.process_checksum(&def.name, &def.crc);
        }
        debug!(
            "{} collections survive schema load ({} conflicts held for reporting)",
            self.collections.len(),
            self.reported.len()
        );
        Ok(defs)
    }

    /// Record one discovered checksum and evict collections it contradicts.
    ///
    /// A collection survives if it does not know the operation or expects the
    /// same checksum. If nothing would survive, the conflict is remembered
    /// for one-shot reporting and the surviving set is left alone.
    fn process_checksum(&mut self, op: &str, crc: &str) {
        self.found.insert(op.to_string(), crc.to_string());
        let survivors: Vec<Collection> = self
            .collections
            .iter()
            .filter(|c| c.entries.get(op).map_or(true, |expected| expected == crc))
            .cloned()
            .collect();
        if survivors.is_empty() {
            self.reported.insert(op.to_string(), Some(crc.to_string()));
        } else {
            self.collections = survivors;
        }
    }

    /// Raise the conflicts accumulated during load, exactly once.
    ///
    /// Later calls return `Ok` even if conflicts were reported, so one batch
    /// fails with the full picture and the run can continue past it.
    pub fn report_initial_conflicts(&mut self) -> Result<()> {
        if self.initial_reported {
            return Ok(());
        }
        self.initial_reported = true;
        if self.reported.is_empty() {
            return Ok(());
        }
        let items: Vec<String> = self
            .reported
            .iter()
            .map(|(op, crc)| format!("{op}: {}", crc.as_deref().unwrap_or("(not discovered)")))
            .collect();
        Err(DutError::schema_conflict(format!(
            "operations with no supporting collection after schema load: {}",
            items.join(", ")
        )))
    }

    /// Narrow the surviving collections to those recognizing `name`.
    ///
    /// Fails when no surviving collection recognizes the operation; each
    /// distinct failing name is reported once and then passes silently, so a
    /// long run surfaces every distinct problem instead of stopping at the
    /// first.
    pub fn check_operation(&mut self, name: &str) -> Result<()> {
        if self.reported.contains_key(name) {
            return Ok(());
        }
        let survivors: Vec<Collection> = self
            .collections
            .iter()
            .filter(|c| c.entries.contains_key(name))
            .cloned()
            .collect();
        if !survivors.is_empty() {
            self.collections = survivors;
            return Ok(());
        }
        let crc = self.found.get(name).cloned();
        self.reported.insert(name.to_string(), crc.clone());
        let discovered = crc.as_deref().unwrap_or("(not discovered)");
        warn!("Operation {name} (checksum {discovered}) is not supported by any collection");
        Err(DutError::schema_conflict(format!(
            "operation {name} with checksum {discovered} matches no surviving collection"
        )))
    }

    /// Names of the collections still alive, in registration order.
    pub fn collection_names(&self) -> Vec<&str> {
        self.collections.iter().map(|c| c.name.as_str()).collect()
    }

    /// Checksum discovered on disk for an operation, if any.
    pub fn found_checksum(&self, op: &str) -> Option<&str> {
        self.found.get(op).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entries(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(op, crc)| (op.to_string(), crc.to_string()))
            .collect()
    }

    fn registry_with_disk(
        collections: &[(&str, &[(&str, &str)])],
        disk: &[(&str, &str)],
    ) -> SchemaRegistry {
        let mut registry = SchemaRegistry::new();
        for (name, pairs) in collections {
            registry.register_collection(*name, entries(pairs)).unwrap();
        }

        let tmp = TempDir::new().unwrap();
        let messages: Vec<serde_json::Value> = disk
            .iter()
            .map(|(op, crc)| serde_json::json!({"name": op, "crc": crc}))
            .collect();
        std::fs::write(
            tmp.path().join("disk.api.json"),
            serde_json::json!({"messages": messages}).to_string(),
        )
        .unwrap();
        registry.load(tmp.path()).unwrap();
        registry
    }

    #[test]
    fn test_matching_collection_checks_silently() {
        // Scenario A: one collection, checksums agree with disk.
        let mut registry = registry_with_disk(
            &[("24.10", &[("op_x", "aaaa1111")])],
            &[("op_x", "aaaa1111")],
        );
        assert!(registry.check_operation("op_x").is_ok());
        assert_eq!(registry.collection_names(), vec!["24.10"]);
    }

    #[test]
    fn test_conflicting_collection_is_evicted() {
        // Scenario B: two collections disagree; only the matching one lives.
        let mut registry = registry_with_disk(
            &[
                ("24.10", &[("op_x", "aaaa1111")]),
                ("25.02", &[("op_x", "bbbb2222")]),
            ],
            &[("op_x", "aaaa1111")],
        );
        assert_eq!(registry.collection_names(), vec!["24.10"]);
        assert!(registry.check_operation("op_x").is_ok());
        assert!(registry.report_initial_conflicts().is_ok());
    }

    #[test]
    fn test_no_partial_credit_on_shared_mismatch() {
        // Both collections define op_x with checksums differing from disk;
        // both go, the bystander that never mentions op_x stays.
        let registry = registry_with_disk(
            &[
                ("24.10", &[("op_x", "cccc3333"), ("op_y", "0y")]),
                ("25.02", &[("op_x", "dddd4444"), ("op_y", "0y")]),
                ("experimental", &[("op_y", "0y")]),
            ],
            &[("op_x", "aaaa1111"), ("op_y", "0y")],
        );
        assert_eq!(registry.collection_names(), vec!["experimental"]);
    }

    #[test]
    fn test_conflict_that_would_empty_the_set_is_held_for_reporting() {
        let mut registry = registry_with_disk(
            &[("24.10", &[("op_x", "cccc3333")])],
            &[("op_x", "aaaa1111")],
        );
        // The lone collection is kept so later checks still have context.
        assert_eq!(registry.collection_names(), vec!["24.10"]);

        let err = registry.report_initial_conflicts().unwrap_err();
        assert!(err.to_string().contains("op_x"));
        assert!(err.to_string().contains("aaaa1111"));
        // One-shot: the second report is silent.
        assert!(registry.report_initial_conflicts().is_ok());
    }

    #[test]
    fn test_duplicate_collection_name_is_rejected() {
        let mut registry = SchemaRegistry::new();
        registry
            .register_collection("24.10", entries(&[("op_x", "0x01")]))
            .unwrap();
        let err = registry
            .register_collection("24.10", entries(&[("op_y", "0x02")]))
            .unwrap_err();
        assert!(err.to_string().contains("already registered"));
    }

    #[test]
    fn test_check_narrows_to_recognizing_collections() {
        let mut registry = registry_with_disk(
            &[
                ("full", &[("op_x", "0x01"), ("op_y", "0x02")]),
                ("slim", &[("op_x", "0x01")]),
            ],
            &[("op_x", "0x01"), ("op_y", "0x02")],
        );
        assert_eq!(registry.collection_names(), vec!["full", "slim"]);

        registry.check_operation("op_y").unwrap();
        assert_eq!(registry.collection_names(), vec!["full"]);
    }

    #[test]
    fn test_unknown_operation_fails_once_then_passes() {
        let mut registry = registry_with_disk(
            &[("24.10", &[("op_x", "0x01")])],
            &[("op_x", "0x01"), ("op_z", "0xff")],
        );

        let err = registry.check_operation("op_z").unwrap_err();
        assert!(matches!(err, DutError::SchemaConflict { .. }));
        assert!(err.to_string().contains("0xff"));

        // Reported once; later checks of the same name pass silently.
        assert!(registry.check_operation("op_z").is_ok());
        // The surviving set was not emptied by the failed check.
        assert_eq!(registry.collection_names(), vec!["24.10"]);
    }

    #[test]
    fn test_collections_file_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("collections.json");
        std::fs::write(
            &path,
            r#"{"24.10": {"op_x": "0x01"}, "25.02": {"op_x": "0x99"}}"#,
        )
        .unwrap();

        let mut registry = SchemaRegistry::new();
        assert_eq!(registry.load_collections_file(&path).unwrap(), 2);
        assert_eq!(registry.collection_names(), vec!["24.10", "25.02"]);
    }

    #[test]
    fn test_found_checksum_reflects_disk() {
        let registry = registry_with_disk(&[("24.10", &[("op_x", "0x01")])], &[("op_x", "0x01")]);
        assert_eq!(registry.found_checksum("op_x"), Some("0x01"));
        assert_eq!(registry.found_checksum("op_missing"), None);
    }
}
