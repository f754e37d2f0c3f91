//! Error types for ivcache
//!
//! One error enum is shared by the cache plumbing, the class plugins and the
//! authority/host seams. Errors are `Clone` because a single upstream failure
//! is delivered to every caller coalesced behind it.

use thiserror::Error;

/// Common result type for ivcache operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for ivcache
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// No cached or authoritative record exists
    #[error("not found: {0}")]
    NotFound(String),

    /// The caller's capacity is smaller than the record; retry with `required`
    #[error("capacity too small: {required} entries required")]
    Oversized { required: u32 },

    /// Malformed input: bad ACL, unknown property bit, over-long string,
    /// out-of-range arithmetic or a record of the wrong class
    #[error("invalid: {0}")]
    Invalid(String),

    /// A container handle is already open with different flags
    #[error("conflict: {0}")]
    Conflict(String),

    /// The authority or a peer node could not be reached
    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a not found error
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Create an invalid input error
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }

    /// Create a conflict error
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Create an unavailable error
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Check if the caller should retry with backoff
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }

    /// Check if this is a not found error
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_retryable() {
        assert!(Error::unavailable("not leader").is_retryable());
        assert!(!Error::invalid("bad acl").is_retryable());
        assert!(!Error::Oversized { required: 4 }.is_retryable());
    }

    #[test]
    fn test_error_not_found() {
        assert!(Error::not_found("handle").is_not_found());
        assert!(!Error::conflict("flags").is_not_found());
    }

    #[test]
    fn test_error_display() {
        assert_eq!(
            Error::Oversized { required: 12 }.to_string(),
            "capacity too small: 12 entries required"
        );
        assert_eq!(Error::invalid("x").to_string(), "invalid: x");
    }
}
