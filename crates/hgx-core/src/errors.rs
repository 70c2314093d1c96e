//! Unified error system for HGX
//!
//! One error type covers the whole engine. Variants mirror the failure classes
//! callers need to tell apart: structural violations (never retried), chain
//! validation failures (recoverable through healing, else fatal to the object)
//! and transport failures (retryable).

use serde::{Deserialize, Serialize};

use crate::identifiers::{Address, ApiId, AppToken};

/// Unified error type for all HGX operations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum HgxError {
    /// Mutation attempted on an immutable or foreign object
    #[error("Object {address} is not mutable: {reason}")]
    NotMutable {
        /// Object the mutation targeted
        address: Address,
        /// Why the object refused the mutation
        reason: String,
    },

    /// Operation on a deleted object
    #[error("Object {address} has been deleted")]
    ObjectGone {
        /// Deleted object
        address: Address,
    },

    /// Removal of a callback that was never registered
    #[error("Callback {handler} is not registered")]
    CallbackNotFound {
        /// Handler id the caller tried to remove
        handler: u64,
    },

    /// A frame failed validation against the local chain
    #[error("Ratchet mismatch on {address} at frame {index}: {reason}")]
    RatchetMismatch {
        /// Object whose chain rejected the frame
        address: Address,
        /// Index claimed by the rejected frame
        index: u64,
        /// Validation failure detail
        reason: String,
    },

    /// Healing could not close a gap within its retry budget
    #[error("Chain {address} desynchronized after {attempts} retransmission requests")]
    ChainDesynchronized {
        /// Object whose chain could not be healed
        address: Address,
        /// Number of requests issued before giving up
        attempts: u32,
    },

    /// The derivation counter would overflow its configured width
    #[error("Ratchet exhausted on {address}: counter width of {width} bits reached")]
    RatchetExhausted {
        /// Object whose ratchet ran out
        address: Address,
        /// Configured counter width
        width: u8,
    },

    /// A capability registration conflicts with an existing one
    #[error("Capability {api_id} is already registered")]
    CapabilityConflict {
        /// Conflicting capability
        api_id: ApiId,
    },

    /// Scope token was never issued
    #[error("Unknown application token {token}")]
    UnknownToken {
        /// Token the caller supplied
        token: AppToken,
    },

    /// The caller's scope does not grant access to the object
    #[error("Object {address} is not accessible: {reason}")]
    Inaccessible {
        /// Object the caller tried to reach
        address: Address,
        /// Why access was refused
        reason: String,
    },

    /// Resource not found
    #[error("Not found: {message}")]
    NotFound {
        /// What was not found
        message: String,
    },

    /// Invalid input or configuration
    #[error("Invalid: {message}")]
    Invalid {
        /// Error message describing the invalid input
        message: String,
    },

    /// Cryptographic operation failed
    #[error("Crypto error: {message}")]
    Crypto {
        /// Error message describing the cryptographic failure
        message: String,
    },

    /// Serialization/deserialization error
    #[error("Serialization error: {message}")]
    Serialization {
        /// Error message describing the serialization failure
        message: String,
    },

    /// Transport collaborator failed; safe to retry
    #[error("Transport error: {message}")]
    Transport {
        /// Error message from the transport
        message: String,
    },

    /// Internal system error (connection closed, task lost)
    #[error("Internal error: {message}")]
    Internal {
        /// Error message describing the internal error
        message: String,
    },
}

impl HgxError {
    /// Create a not-mutable error
    pub fn not_mutable(address: Address, reason: impl Into<String>) -> Self {
        Self::NotMutable {
            address,
            reason: reason.into(),
        }
    }

    /// Create an object-gone error
    pub fn object_gone(address: Address) -> Self {
        Self::ObjectGone { address }
    }

    /// Create a ratchet mismatch error
    pub fn ratchet_mismatch(address: Address, index: u64, reason: impl Into<String>) -> Self {
        Self::RatchetMismatch {
            address,
            index,
            reason: reason.into(),
        }
    }

    /// Create an inaccessible error
    pub fn inaccessible(address: Address, reason: impl Into<String>) -> Self {
        Self::Inaccessible {
            address,
            reason: reason.into(),
        }
    }

    /// Create a not found error
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    /// Create an invalid input error
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }

    /// Create a crypto error
    pub fn crypto(message: impl Into<String>) -> Self {
        Self::Crypto {
            message: message.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Create a transport error
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Transport failures are the only class callers may blindly retry.
    /// Chain tamper/mismatch errors and structural violations are not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }

    /// True for errors that leave the object permanently unusable
    pub fn is_fatal_to_object(&self) -> bool {
        matches!(
            self,
            Self::ChainDesynchronized { .. } | Self::RatchetExhausted { .. } | Self::ObjectGone { .. }
        )
    }
}

/// Standard Result type for HGX operations
pub type Result<T> = std::result::Result<T, HgxError>;

impl From<bincode::Error> for HgxError {
    fn from(err: bincode::Error) -> Self {
        Self::serialization(err.to_string())
    }
}

impl From<serde_json::Error> for HgxError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err.to_string())
    }
}

impl From<std::io::Error> for HgxError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::not_found(err.to_string()),
            _ => Self::internal(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transport_errors_are_retryable() {
        assert!(HgxError::transport("socket reset").is_retryable());

        let address = Address::from_bytes([7u8; 32]);
        assert!(!HgxError::ratchet_mismatch(address, 3, "tag").is_retryable());
        assert!(!HgxError::object_gone(address).is_retryable());
        assert!(!HgxError::not_mutable(address, "foreign").is_retryable());
    }

    #[test]
    fn test_fatal_classification() {
        let address = Address::from_bytes([1u8; 32]);
        assert!(HgxError::RatchetExhausted { address, width: 8 }.is_fatal_to_object());
        assert!(HgxError::ChainDesynchronized {
            address,
            attempts: 3
        }
        .is_fatal_to_object());
        assert!(!HgxError::ratchet_mismatch(address, 1, "fork").is_fatal_to_object());
    }

    #[test]
    fn test_error_display() {
        let err = HgxError::invalid("legroom");
        assert_eq!(err.to_string(), "Invalid: legroom");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "config missing");
        assert!(matches!(HgxError::from(io_err), HgxError::NotFound { .. }));
    }
}
