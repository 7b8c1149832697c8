//! CSI error taxonomy.
//!
//! Every failure that crosses the RPC surface is represented by [`CsiError`],
//! which derives [`thiserror::Error`] for ergonomic handling and implements
//! [`Serialize`]/[`Deserialize`] so errors can travel across the QUIC
//! transport layer.  Driver-internal error types map onto these kinds
//! one-to-one at the node boundary.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unified error type for CSI operations.
///
/// The variants mirror the subset of gRPC status codes the node surface
/// actually produces.  Each carries a human-readable cause chain rendered
/// into the message.
#[derive(Debug, Error, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub enum CsiError {
    /// The caller supplied an invalid or missing argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A referenced object (image, snapshot, mount) does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The operation cannot be admitted right now; the caller should retry.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// The operation ran past its deadline.
    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    /// An unclassified internal failure.
    #[error("internal error: {0}")]
    Internal(String),

    /// The operation was interrupted before it could complete.
    #[error("aborted: {0}")]
    Aborted(String),

    /// The target already exists with conflicting parameters.
    #[error("already exists: {0}")]
    AlreadyExists(String),
}

impl CsiError {
    /// Create a [`CsiError::InvalidArgument`] from anything displayable.
    pub fn invalid<E: std::fmt::Display>(e: E) -> Self {
        Self::InvalidArgument(e.to_string())
    }

    /// Create a [`CsiError::Unavailable`] from anything displayable.
    pub fn unavailable<E: std::fmt::Display>(e: E) -> Self {
        Self::Unavailable(e.to_string())
    }

    /// Create a [`CsiError::Internal`] from anything displayable.
    pub fn internal<E: std::fmt::Display>(e: E) -> Self {
        Self::Internal(e.to_string())
    }

    /// Create a [`CsiError::Aborted`] from anything displayable.
    pub fn aborted<E: std::fmt::Display>(e: E) -> Self {
        Self::Aborted(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = CsiError::NotFound("snapshot ro:abc".into());
        assert_eq!(err.to_string(), "not found: snapshot ro:abc");
    }

    #[test]
    fn error_serde_roundtrip() {
        let err = CsiError::AlreadyExists("/var/lib/kubelet/pods/x/mount".into());
        let json = serde_json::to_string(&err).expect("serialize");
        let de: CsiError = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(err, de);
    }
}
