use std::path::PathBuf;
use thiserror::Error;

/// Manifest parsing and validation errors
///
/// All variants are raised before any backend call is made.
#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("manifest parse error: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("failed to read manifest {path}: {message}")]
    Read { path: PathBuf, message: String },

    #[error("unsupported manifest version '{0}' (supported: v1)")]
    UnsupportedVersion(String),

    #[error("manifest name must not be empty")]
    MissingName,

    #[error("manifest declares no services")]
    NoServices,

    #[error("service name must not be empty")]
    MissingServiceName,

    #[error("duplicate service '{0}'")]
    DuplicateService(String),

    #[error("duplicate volume '{0}'")]
    DuplicateVolume(String),

    #[error("service '{0}' does not specify an image")]
    MissingImage(String),

    #[error("service '{service}' mounts undeclared volume '{volume}'")]
    UndeclaredVolume { service: String, volume: String },

    #[error("service '{service}' has invalid resources: {reason}")]
    InvalidResources { service: String, reason: String },

    #[error("service '{service}' has invalid port '{port}': {reason}")]
    InvalidPort {
        service: String,
        port: String,
        reason: String,
    },

    #[error("volume '{volume}' is invalid: {reason}")]
    InvalidVolume { volume: String, reason: String },
}

pub type Result<T> = std::result::Result<T, ManifestError>;
