//! Manifest parser
//!
//! Parsing turns YAML bytes into a [`Manifest`] and rejects unknown schema
//! versions. Validation checks the structural invariants. Both are pure.

mod validate;

pub use validate::validate;

use crate::error::{ManifestError, Result};
use crate::model::{Manifest, SUPPORTED_VERSIONS};
use std::fs;
use std::path::Path;

/// Parse manifest bytes
///
/// Unknown versions are rejected here instead of being parsed best-effort.
pub fn parse(bytes: &[u8]) -> Result<Manifest> {
    let manifest: Manifest = serde_yaml::from_slice(bytes)?;
    check_version(&manifest.version)?;
    tracing::debug!(
        name = %manifest.name,
        services = manifest.services.len(),
        volumes = manifest.volumes.len(),
        "parsed manifest"
    );
    Ok(manifest)
}

/// Parse a manifest string
pub fn parse_str(content: &str) -> Result<Manifest> {
    parse(content.as_bytes())
}

/// Read, parse and validate a manifest file
pub fn load_file<P: AsRef<Path>>(path: P) -> Result<Manifest> {
    let path = path.as_ref();
    let content = fs::read(path).map_err(|e| ManifestError::Read {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    let manifest = parse(&content)?;
    validate(&manifest)?;
    Ok(manifest)
}

pub(crate) fn check_version(version: &str) -> Result<()> {
    if SUPPORTED_VERSIONS.contains(&version) {
        Ok(())
    } else {
        Err(ManifestError::UnsupportedVersion(version.to_string()))
    }
}

#[cfg(test)]
mod tests;
