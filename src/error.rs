//! Error types crossing the class-loading boundary.
//!
//! `LoadError` is what callers of a loader or of the deserialization cache
//! see. `ProviderError` stays inside the caching layer: the bridge turns it
//! into a fall-back branch and never hands it to a caller.

use std::sync::Arc;

#[derive(Debug, Clone, thiserror::Error)]
pub enum LoadError {
    #[error("class not found: {0}")]
    ClassNotFound(String),

    #[error("sealing violation: {reason}")]
    SealingViolation { package: String, reason: String },

    #[error("malformed class {name}: {reason}")]
    ClassFormat { name: String, reason: String },

    #[error("i/o error: {0}")]
    Io(Arc<std::io::Error>),
}

impl LoadError {
    pub fn sealed(package: &str) -> Self {
        Self::SealingViolation {
            package: package.to_string(),
            reason: format!("package {package} is sealed"),
        }
    }

    pub fn cannot_seal(package: &str) -> Self {
        Self::SealingViolation {
            package: package.to_string(),
            reason: format!("can't seal package {package}: already loaded"),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::ClassNotFound(_))
    }

    /// Errors a cached definition may swallow before retrying the normal
    /// path. Sealing violations are never among them.
    pub fn is_cache_recoverable(&self) -> bool {
        matches!(self, Self::Io(_) | Self::ClassFormat { .. })
    }
}

impl From<std::io::Error> for LoadError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl From<zip::result::ZipError> for LoadError {
    fn from(err: zip::result::ZipError) -> Self {
        match err {
            zip::result::ZipError::Io(io) => Self::Io(Arc::new(io)),
            other => Self::Io(Arc::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                other,
            ))),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("shared class provider unavailable")]
    Unavailable,

    #[error("shared class storage failed: {0}")]
    Storage(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<heed::Error> for ProviderError {
    fn from(err: heed::Error) -> Self {
        Self::Storage(err.to_string())
    }
}
