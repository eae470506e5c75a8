//! Status taxonomy shared by the storage lifecycle core

use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Status>;

/// Errors surfaced by storage operations
///
/// No failure here is user-visible directly; callers are expected to log
/// and degrade gracefully (fall back to direct creation, skip a pruning
/// cycle).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Status {
    /// Filesystem or database open, rename, or I/O failure
    #[error("I/O error: {0}")]
    Io(String),

    /// The task was cancelled while suspended
    #[error("interrupted")]
    Interrupted,

    /// Invariant violation or unexpected state
    #[error("internal error: {0}")]
    Internal(String),

    /// Lookup miss
    #[error("not found: {0}")]
    NotFound(String),
}

impl Status {
    /// Check whether this is a cancellation, to be treated as a normal
    /// non-success outcome rather than a fault
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Status::Interrupted)
    }

    /// Check whether this is a lookup miss
    pub fn is_not_found(&self) -> bool {
        matches!(self, Status::NotFound(_))
    }
}

impl From<std::io::Error> for Status {
    fn from(err: std::io::Error) -> Self {
        Status::Io(err.to_string())
    }
}

impl From<rusqlite::Error> for Status {
    fn from(err: rusqlite::Error) -> Self {
        Status::Io(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_interrupted() {
        assert!(Status::Interrupted.is_interrupted());
        assert!(!Status::Io("disk full".to_string()).is_interrupted());
        assert!(!Status::NotFound("commit".to_string()).is_interrupted());
    }

    #[test]
    fn test_is_not_found() {
        assert!(Status::NotFound("commit c1".to_string()).is_not_found());
        assert!(!Status::Interrupted.is_not_found());
    }

    #[test]
    fn test_io_error_conversion() {
        let err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let status = Status::from(err);
        assert!(matches!(status, Status::Io(_)));
        assert!(status.to_string().contains("denied"));
    }
}
