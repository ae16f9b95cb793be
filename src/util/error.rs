//! Error types for the renderer core.

use thiserror::Error;

/// Main error type for renderer operations.
///
/// `Load` and `Consistency` are recoverable at the scene-assembly boundary:
/// the caller may skip the offending model and continue. The remaining
/// kinds are fatal for the current run.
#[derive(Error, Debug)]
pub enum Error {
    /// Model source missing or unparseable
    #[error("Failed to load '{source_name}': {reason}")]
    Load { source_name: String, reason: String },

    /// Mesh arrays disagree with each other
    #[error("Inconsistent mesh '{mesh}': {detail}")]
    Consistency { mesh: String, detail: String },

    /// Operation invoked in a state that does not allow it
    #[error("Precondition violated: {0}")]
    Precondition(String),

    /// Device rejected an acceleration-structure build or trace
    #[error("Device error during {op}: {cause}")]
    Device { op: &'static str, cause: String },

    /// Model id not present in the registry
    #[error("Unknown model id {0}")]
    UnknownModel(u32),

    /// Instance id not present in the registry
    #[error("Unknown instance id {0}")]
    UnknownInstance(u32),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Image encoding error
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    /// Configuration (de)serialization error
    #[error("Config error: {0}")]
    Config(#[from] serde_json::Error),

    /// Generic error with message
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create a load error for the named source.
    pub fn load(source_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Load {
            source_name: source_name.into(),
            reason: reason.into(),
        }
    }

    /// Create a consistency error for the named mesh.
    pub fn consistency(mesh: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Consistency {
            mesh: mesh.into(),
            detail: detail.into(),
        }
    }

    /// Create a precondition violation.
    pub fn precondition(msg: impl Into<String>) -> Self {
        Self::Precondition(msg.into())
    }

    /// Create a device error for the given operation.
    pub fn device(op: &'static str, cause: impl Into<String>) -> Self {
        Self::Device {
            op,
            cause: cause.into(),
        }
    }

    /// Create an "other" error from a string.
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Whether scene assembly may skip the failing model and continue.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Load { .. } | Self::Consistency { .. })
    }
}

/// Result type alias for renderer operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = Error::load("bunny.obj", "file not found");
        assert!(e.to_string().contains("bunny.obj"));
        assert!(e.to_string().contains("not found"));

        let e = Error::consistency("plane", "5 indices");
        assert!(e.to_string().contains("plane"));

        let e = Error::device("build_bottom_level", "out of memory");
        assert!(e.to_string().contains("build_bottom_level"));
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "test");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_recoverable_kinds() {
        assert!(Error::load("a", "b").is_recoverable());
        assert!(Error::consistency("a", "b").is_recoverable());
        assert!(!Error::precondition("refit before build").is_recoverable());
        assert!(!Error::device("trace", "lost").is_recoverable());
        assert!(!Error::UnknownModel(3).is_recoverable());
    }
}
