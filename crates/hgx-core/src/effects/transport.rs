//! Transport collaborator interface

use async_trait::async_trait;

use crate::identifiers::Address;
use crate::types::{Frame, ShareGrant, StaticRecord};
use crate::HgxError;

/// Transport operation errors
///
/// Every variant is retryable from the engine's point of view; the engine
/// rolls back local state before surfacing one.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Peer or service cannot be reached
    #[error("Unreachable: {reason}")]
    Unreachable {
        /// Reason for the failure
        reason: String,
    },
    /// Remote side refused the request
    #[error("Rejected: {reason}")]
    Rejected {
        /// Reason for the refusal
        reason: String,
    },
    /// Operation timed out
    #[error("Operation '{operation}' timed out after {timeout_ms}ms")]
    Timeout {
        /// The operation that timed out
        operation: String,
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },
    /// Transport has shut down
    #[error("Transport closed")]
    Closed,
}

impl From<TransportError> for HgxError {
    fn from(err: TransportError) -> Self {
        HgxError::transport(err.to_string())
    }
}

/// Carries frames, grants and storage requests for one connection
#[async_trait]
pub trait TransportEffects: Send + Sync {
    /// Fan a frame out to `recipients` and to the author's other devices
    async fn publish_frame(&self, frame: &Frame, recipients: &[Address]) -> Result<(), TransportError>;

    /// Store a sealed static object
    async fn publish_static(&self, record: &StaticRecord) -> Result<(), TransportError>;

    /// Deliver a share grant to its recipient
    async fn send_grant(&self, grant: &ShareGrant) -> Result<(), TransportError>;

    /// Ask for retransmission of frames `from..to` (exclusive) of `object`
    async fn request_frames(&self, object: &Address, from: u64, to: u64) -> Result<(), TransportError>;

    /// Start receiving frames for `object`
    async fn subscribe(&self, object: &Address) -> Result<(), TransportError>;

    /// Stop receiving frames for `object`
    async fn unsubscribe(&self, object: &Address) -> Result<(), TransportError>;

    /// Bind `address` so storage keeps it
    async fn hold(&self, address: &Address) -> Result<(), TransportError>;

    /// Remove the local binding for `address`; copies held elsewhere survive
    async fn delete(&self, address: &Address) -> Result<(), TransportError>;

    /// Look up a grant addressed to the local identity for `address`
    async fn fetch_grant(&self, address: &Address) -> Result<Option<ShareGrant>, TransportError>;
}
