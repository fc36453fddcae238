//! Remote API schema handling.
//!
//! - **defs**: parsing of the on-disk definition files (both dialects)
//! - **registry**: named collections of known-good checksums, conflict
//!   discovery and one-shot reporting
//!
//! The registry decides whether an operation may be issued at all; the parsed
//! definitions also feed the wire layer's operation index.

pub mod defs;
pub mod registry;

pub use defs::{parse_file, scan_dir, OperationDef, SCHEMA_FILE_SUFFIX};
pub use registry::{Collection, SchemaRegistry};
