//! Call-scoped error taxonomy.
//!
//! Every variant here is reported over the connection as a failure envelope
//! and never tears the session down; the one connection-fatal error is
//! [`crate::envelope::DecodeError`], which the session layer handles itself.

use crate::envelope::Envelope;

// ── Error code constants (metrics labels, not wire fields) ──────────

/// Method not present in the registry.
pub const UNKNOWN_METHOD: &str = "UNKNOWN_METHOD";
/// Method-specific body failed validation.
pub const INVALID_PAYLOAD: &str = "INVALID_PAYLOAD";
/// Backend transport or application failure.
pub const BACKEND_ERROR: &str = "BACKEND_ERROR";
/// Call deadline expired.
pub const TIMEOUT: &str = "TIMEOUT";
/// Call aborted by session teardown or explicit cancellation.
pub const CANCELLED: &str = "CANCELLED";
/// Per-session in-flight cap exceeded.
pub const TOO_MANY_IN_FLIGHT: &str = "TOO_MANY_IN_FLIGHT";
/// Correlation id already in flight on this session.
pub const DUPLICATE_ID: &str = "DUPLICATE_ID";

/// Errors scoped to a single call.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum CallError {
    /// The request named a method the bridge does not register.
    #[error("unknown method: {0}")]
    UnknownMethod(String),

    /// The method-specific payload did not decode.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// The backend reported a transport or application failure.
    #[error("backend call failed: {0}")]
    Backend(String),

    /// The call's deadline expired before completion.
    #[error("call deadline exceeded")]
    Timeout,

    /// The call was cancelled before completion.
    #[error("call cancelled")]
    Cancelled,

    /// The session already has the maximum number of calls in flight.
    #[error("too many in-flight requests")]
    TooManyInFlight,

    /// A call with this correlation id is already in flight.
    #[error("duplicate in-flight request id: {0}")]
    DuplicateId(String),
}

impl CallError {
    /// Machine-readable code for this variant.
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnknownMethod(_) => UNKNOWN_METHOD,
            Self::InvalidPayload(_) => INVALID_PAYLOAD,
            Self::Backend(_) => BACKEND_ERROR,
            Self::Timeout => TIMEOUT,
            Self::Cancelled => CANCELLED,
            Self::TooManyInFlight => TOO_MANY_IN_FLIGHT,
            Self::DuplicateId(_) => DUPLICATE_ID,
        }
    }

    /// Convert into the failure envelope reported to the client.
    pub fn to_envelope(&self, id: impl Into<String>) -> Envelope {
        Envelope::failure(id, self.to_string())
    }
}
