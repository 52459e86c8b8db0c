//! leaseflow core
//!
//! The backend-agnostic workload manifest: data model, YAML parsing and
//! validation. Nothing in this crate performs I/O beyond reading a file
//! the caller names.

pub mod error;
pub mod model;
pub mod parser;

pub use error::{ManifestError, Result};
pub use model::*;
pub use parser::{load_file, parse, parse_str, validate};
