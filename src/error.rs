//! Error taxonomy for the sync engine.
//!
//! Every fallible path in the engine resolves to a `SyncError` so that the
//! worker pool can decide between retrying a job and dead-lettering it by
//! asking the error itself, instead of guessing from strings.

use thiserror::Error;

use crate::models::FulfillmentState;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Malformed ciphertext or wrong key. Fatal at startup, per-request
    /// elsewhere; callers treat the decrypted value as missing.
    #[error("crypto error: {0}")]
    Crypto(String),

    /// The OAuth refresh endpoint signaled that the refresh token is dead.
    /// The scheduler must mark the tenant's FFN config inactive and stop
    /// issuing work against it.
    #[error("FFN refresh token revoked: {0}")]
    TokenRevoked(String),

    /// Non-2xx from the fulfillment network.
    #[error("FFN API error {status}: {body}")]
    FfnApi { status: u16, body: String },

    /// Non-2xx from a commerce platform.
    #[error("commerce API error {status}: {body}")]
    CommerceApi { status: u16, body: String },

    /// The payment gate refused an FFN dispatch. Not retried by the queue;
    /// a payment webhook or the paid-order sweep re-enqueues later.
    #[error("blocked by payment gate: {reason}")]
    BlockedByPaymentGate { reason: String },

    #[error("not found: {0}")]
    NotFound(String),

    /// Operational updates are rejected once the outbound passed the point
    /// of no return at the warehouse.
    #[error("order not updateable in state {current_state}")]
    NotUpdateable { current_state: FulfillmentState },

    #[error("tenant {0} has no warehouse configured")]
    MissingWarehouse(String),

    #[error("missing credentials: {0}")]
    MissingCredentials(String),

    /// Malformed input, usually from a webhook payload. The webhook surface
    /// answers success-skipped so the platform stops redelivering bad data.
    #[error("validation error: {0}")]
    Validation(String),

    /// Network timeouts, connection resets, lock contention. Safe to retry.
    #[error("transient I/O error: {0}")]
    Transient(String),

    /// Storage-level failure that is not lock contention.
    #[error("storage error: {0}")]
    Storage(String),
}

impl SyncError {
    /// Whether the queue should schedule another attempt for this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transient(_) => true,
            SyncError::FfnApi { status, .. } | SyncError::CommerceApi { status, .. } => {
                *status == 429 || *status >= 500
            }
            SyncError::Crypto(_)
            | SyncError::TokenRevoked(_)
            | SyncError::BlockedByPaymentGate { .. }
            | SyncError::NotFound(_)
            | SyncError::NotUpdateable { .. }
            | SyncError::MissingWarehouse(_)
            | SyncError::MissingCredentials(_)
            | SyncError::Validation(_)
            | SyncError::Storage(_) => false,
        }
    }

    /// Payment-gate blocks are reported as handled rather than failed: the
    /// job ends, and a later event re-enqueues the order.
    pub fn is_gate_block(&self) -> bool {
        matches!(self, SyncError::BlockedByPaymentGate { .. })
    }
}

impl From<rusqlite::Error> for SyncError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::SqliteFailure(code, _)
                if code.code == rusqlite::ErrorCode::DatabaseBusy
                    || code.code == rusqlite::ErrorCode::DatabaseLocked =>
            {
                SyncError::Transient(e.to_string())
            }
            _ => SyncError::Storage(e.to_string()),
        }
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        // Status-bearing failures are classified by the client that saw the
        // response body; what reaches this path is connect/timeout/decode.
        SyncError::Transient(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_and_rate_limits_are_retryable() {
        assert!(SyncError::FfnApi {
            status: 503,
            body: "upstream".into()
        }
        .is_retryable());
        assert!(SyncError::FfnApi {
            status: 429,
            body: "slow down".into()
        }
        .is_retryable());
        assert!(SyncError::Transient("timeout".into()).is_retryable());
    }

    #[test]
    fn client_errors_and_gate_blocks_are_not() {
        assert!(!SyncError::FfnApi {
            status: 400,
            body: "bad payload".into()
        }
        .is_retryable());
        assert!(!SyncError::FfnApi {
            status: 403,
            body: "forbidden".into()
        }
        .is_retryable());
        assert!(!SyncError::TokenRevoked("revoked".into()).is_retryable());
        assert!(!SyncError::BlockedByPaymentGate {
            reason: "payment_status=pending".into()
        }
        .is_retryable());
        assert!(!SyncError::Validation("no items".into()).is_retryable());
    }

    #[test]
    fn busy_sqlite_maps_to_transient() {
        let busy = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            Some("database is locked".into()),
        );
        assert!(SyncError::from(busy).is_retryable());
    }
}
