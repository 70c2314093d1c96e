//! Engine telemetry
//!
//! Structured logging for frame processing, healing and verb outcomes. Timing
//! is left to spans at call sites; this module fixes the field names so log
//! queries stay stable.

use hgx_core::{Address, Frame, HgxError, Verb};
use tracing::{debug, error, info, warn};

/// Error categories for log aggregation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Lifecycle,
    Ratchet,
    Access,
    Cryptographic,
    Transport,
    Input,
    Internal,
}

/// Categorize an error for observability
pub fn categorize_error(error: &HgxError) -> ErrorCategory {
    match error {
        HgxError::NotMutable { .. } | HgxError::ObjectGone { .. } => ErrorCategory::Lifecycle,
        HgxError::RatchetMismatch { .. }
        | HgxError::ChainDesynchronized { .. }
        | HgxError::RatchetExhausted { .. } => ErrorCategory::Ratchet,
        HgxError::Inaccessible { .. }
        | HgxError::UnknownToken { .. }
        | HgxError::CapabilityConflict { .. } => ErrorCategory::Access,
        HgxError::Crypto { .. } => ErrorCategory::Cryptographic,
        HgxError::Transport { .. } => ErrorCategory::Transport,
        HgxError::NotFound { .. }
        | HgxError::Invalid { .. }
        | HgxError::Serialization { .. }
        | HgxError::CallbackNotFound { .. } => ErrorCategory::Input,
        HgxError::Internal { .. } => ErrorCategory::Internal,
    }
}

/// Centralized engine telemetry
pub struct HgxTelemetry;

impl HgxTelemetry {
    /// Log a frame sealed and accepted by the transport
    pub fn log_frame_published(&self, frame: &Frame, rekeyed: bool, recipients: usize) {
        info!(
            operation = "publish_frame",
            status = "success",
            object = %frame.object.short(),
            index = frame.index,
            epoch = frame.epoch,
            rekeyed,
            recipients,
            ciphertext_bytes = frame.ciphertext.len(),
            "Frame published"
        );
    }

    /// Log an inbound frame applied to the chain
    pub fn log_frame_accepted(&self, object: &Address, index: u64, rekeyed: bool) {
        debug!(
            operation = "ingest_frame",
            status = "accepted",
            object = %object.short(),
            index,
            rekeyed,
            "Frame accepted"
        );
    }

    /// Log an inbound frame that failed validation
    pub fn log_frame_rejected(&self, object: &Address, index: u64, error: &HgxError) {
        warn!(
            operation = "ingest_frame",
            status = "rejected",
            object = %object.short(),
            index,
            error_category = ?categorize_error(error),
            error_message = %error,
            "Frame rejected"
        );
    }

    /// Log a gap in an object's chain
    pub fn log_gap(&self, object: &Address, missing: (u64, u64), buffered: usize) {
        info!(
            operation = "heal",
            status = "gap",
            object = %object.short(),
            missing_from = missing.0,
            missing_to = missing.1,
            buffered,
            "Chain gap detected"
        );
    }

    /// Log a retransmission request
    pub fn log_heal_request(&self, object: &Address, missing: (u64, u64), attempt: u32) {
        debug!(
            operation = "heal",
            status = "requested",
            object = %object.short(),
            missing_from = missing.0,
            missing_to = missing.1,
            attempt,
            "Retransmission requested"
        );
    }

    /// Log a chain declared desynchronized
    pub fn log_desynchronized(&self, object: &Address, attempts: u32) {
        error!(
            operation = "heal",
            status = "desynchronized",
            object = %object.short(),
            attempts,
            "Chain desynchronized"
        );
    }

    /// Log a verb that completed
    pub fn log_verb_success(&self, verb: Verb, object: Option<&Address>) {
        debug!(
            operation = verb.as_str(),
            status = "success",
            object = ?object.map(|a| a.short()),
            "Verb completed"
        );
    }

    /// Log a verb that failed
    pub fn log_verb_failure(&self, verb: Verb, object: Option<&Address>, error: &HgxError) {
        let category = categorize_error(error);
        if category == ErrorCategory::Internal || category == ErrorCategory::Transport {
            error!(
                operation = verb.as_str(),
                status = "failure",
                object = ?object.map(|a| a.short()),
                error_category = ?category,
                error_message = %error,
                retryable = error.is_retryable(),
                "Verb failed"
            );
        } else {
            debug!(
                operation = verb.as_str(),
                status = "failure",
                object = ?object.map(|a| a.short()),
                error_category = ?category,
                error_message = %error,
                "Verb refused"
            );
        }
    }

    /// Log callback fan-out for one event
    pub fn log_dispatch(&self, object: &Address, kind: &'static str, deliveries: usize) {
        debug!(
            operation = "dispatch",
            object = %object.short(),
            kind,
            deliveries,
            "Event routed"
        );
    }
}

/// Global telemetry instance
pub static HGX_TELEMETRY: HgxTelemetry = HgxTelemetry;
