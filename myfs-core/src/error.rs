//! Error types for volume operations.

use thiserror::Error;

/// Result type for volume operations.
pub type MyfsResult<T> = Result<T, MyfsError>;

/// Errors surfaced by the volume core.
///
/// Cryptographic failures deliberately carry no cause: a wrong secret and a
/// tampered ciphertext both surface as [`MyfsError::AuthFailed`] or
/// [`MyfsError::IntegrityFailed`] depending on the layer that detected them.
#[derive(Debug, Error)]
pub enum MyfsError {
    /// Session, master, or file secret rejected, or machine binding mismatch.
    #[error("authentication failed")]
    AuthFailed,

    /// Named entry absent, or soft-deleted when an active entry was required.
    #[error("file not found: {name}")]
    NotFound {
        /// The name that was looked up.
        name: String,
    },

    /// Import or recover would duplicate an active name.
    #[error("name already in use: {name}")]
    NameTaken {
        /// The colliding name.
        name: String,
    },

    /// AEAD open failed or the content digest mismatched for a specific entry.
    #[error("integrity check failed for entry: {name}")]
    IntegrityFailed {
        /// The affected entry name.
        name: String,
    },

    /// The sealed table failed to open from both the container and the sidecar.
    #[error("file table is corrupt in container and sidecar")]
    TableCorrupt,

    /// Repair cannot proceed.
    #[error("volume unrecoverable: {reason}")]
    Unrecoverable {
        /// What made the volume unrecoverable.
        reason: String,
    },

    /// Another process holds the container lock.
    #[error("container is locked by another process")]
    Locked,

    /// A lower-level read or write failed.
    #[error("I/O error during {context}: {source}")]
    Io {
        /// The operation that failed.
        context: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

impl MyfsError {
    /// Creates an I/O error with context.
    pub fn io<S: Into<String>>(context: S, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Creates a not-found error.
    pub fn not_found<S: Into<String>>(name: S) -> Self {
        Self::NotFound { name: name.into() }
    }

    /// Creates a name-taken error.
    pub fn name_taken<S: Into<String>>(name: S) -> Self {
        Self::NameTaken { name: name.into() }
    }

    /// Creates an integrity-failed error for an entry.
    pub fn integrity<S: Into<String>>(name: S) -> Self {
        Self::IntegrityFailed { name: name.into() }
    }

    /// Creates an unrecoverable error.
    pub fn unrecoverable<S: Into<String>>(reason: S) -> Self {
        Self::Unrecoverable {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(format!("{}", MyfsError::AuthFailed), "authentication failed");
        assert!(format!("{}", MyfsError::not_found("a.txt")).contains("a.txt"));
        assert!(format!("{}", MyfsError::name_taken("b.txt")).contains("b.txt"));
        assert!(format!("{}", MyfsError::TableCorrupt).contains("corrupt"));
    }
}
