//! Error taxonomy for the help-desk coordinator
//!
//! Every variant that can occur during normal operation maps to an outbound
//! event on the wire; none of them are fatal to the process.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// Bad, expired, or replayed token. Surfaced as a named event
    /// (`bad_auth`, `auth_failed`, or `connect_error`), never a silent drop.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Single-use token presented a second time
    #[error("Token has already been redeemed")]
    AlreadyRedeemed,

    /// Token past its expiry
    #[error("Token has expired")]
    TokenExpired,

    /// Too many queue joins from the same fingerprint. Surfaced as `429`.
    #[error("Rate limit exceeded")]
    RateLimited,

    /// Transfer target is not in the presence registry's online set.
    /// Surfaced to the requesting agent only; the session is unaffected.
    #[error("Agent is offline: {0}")]
    AgentOffline(String),

    /// Upload failed size or MIME validation. Surfaced to the uploader only.
    #[error("Upload rejected: {0}")]
    UploadRejected(String),

    /// A state invariant would be broken (e.g. visitor already in a session).
    /// Logged and fatal to the request, never to the process.
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// External blob/transcript collaborator failed or timed out
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type CoordinatorResult<T> = Result<T, CoordinatorError>;
