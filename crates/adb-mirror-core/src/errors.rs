//! Error types for the session core.
//!
//! Mirrors the shape of the six error kinds in the design doc: a handful of
//! narrow sub-errors that compose into one umbrella [`CoreError`] via
//! `#[from]`, plus a [`CoreError::kind`] accessor used by the session
//! manager to decide retry-vs-terminate.

use thiserror::Error;

/// Coarse classification used for propagation policy (retry vs. terminate
/// vs. ignore).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The debug tool or agent binary cannot be located or invoked.
    ToolMissing,
    /// Socket accept timeout, agent exited non-zero on startup.
    TransientConnect,
    /// Frame too large, malformed codec meta, unreadable track-devices hex.
    ProtocolViolation,
    /// An individual ADB shell call failed; degrade, never surface as a
    /// session error.
    CommandFailure,
    /// Session disposed while an operation was in flight.
    UserCancel,
    /// Unexpected programming error in a listener callback.
    Fatal,
}

/// Errors raised while parsing or assembling wire frames ([`crate::framing`]).
#[derive(Debug, Error, Clone)]
pub enum FramingError {
    #[error("frame exceeds 64 MiB limit ({0} bytes)")]
    FrameTooLarge(usize),
    #[error("malformed codec metadata: {0}")]
    MalformedCodecMeta(String),
    #[error("socket closed before frame completed")]
    TruncatedStream,
}

/// Errors raised while pushing/launching the agent ([`crate::launcher`]).
#[derive(Debug, Error, Clone)]
pub enum LaunchError {
    #[error("debug tool not found: {0}")]
    ToolMissing(String),
    #[error("agent process exited with status {code:?}: {stderr}")]
    AgentExited { code: Option<i32>, stderr: String },
    #[error("timed out waiting for listener accept")]
    AcceptTimeout,
    #[error("pairing failed: {0}")]
    PairingFailed(String),
    #[error("wifi connect failed: {0}")]
    ConnectFailed(String),
    #[error("io error: {0}")]
    Io(String),
}

/// Errors raised by the device-inventory tracker ([`crate::inventory`]).
#[derive(Debug, Error, Clone)]
pub enum InventoryError {
    #[error("could not parse track-devices length prefix: {0}")]
    BadLengthPrefix(String),
    #[error("tracker process exited unexpectedly")]
    TrackerExited,
}

/// Unified error type for session-core operations.
#[derive(Debug, Error, Clone)]
pub enum CoreError {
    #[error("framing error: {0}")]
    Framing(#[from] FramingError),

    #[error("launch error: {0}")]
    Launch(#[from] LaunchError),

    #[error("inventory error: {0}")]
    Inventory(#[from] InventoryError),

    #[error("adb command failed: {0}")]
    CommandFailure(String),

    #[error("session disposed")]
    UserCancel,

    #[error("internal error: {0}")]
    Fatal(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("reconnect retries exhausted")]
    RetriesExhausted,
}

impl CoreError {
    /// Classify this error for retry/propagation policy (spec.md §7).
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::Launch(LaunchError::ToolMissing(_)) => ErrorKind::ToolMissing,
            CoreError::Launch(LaunchError::AgentExited { .. })
            | CoreError::Launch(LaunchError::AcceptTimeout) => ErrorKind::TransientConnect,
            CoreError::Framing(_) => ErrorKind::ProtocolViolation,
            CoreError::Inventory(InventoryError::BadLengthPrefix(_)) => {
                ErrorKind::ProtocolViolation
            }
            CoreError::CommandFailure(_) => ErrorKind::CommandFailure,
            CoreError::UserCancel => ErrorKind::UserCancel,
            _ => ErrorKind::Fatal,
        }
    }

    /// Whether this error should trigger the session manager's
    /// reconnect/fallback loop rather than immediate teardown.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::TransientConnect)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_missing_classified_correctly() {
        let err = CoreError::Launch(LaunchError::ToolMissing("adb".into()));
        assert_eq!(err.kind(), ErrorKind::ToolMissing);
        assert!(!err.is_retryable());
    }

    #[test]
    fn agent_exit_is_retryable() {
        let err = CoreError::Launch(LaunchError::AgentExited {
            code: Some(1),
            stderr: "boom".into(),
        });
        assert_eq!(err.kind(), ErrorKind::TransientConnect);
        assert!(err.is_retryable());
    }

    #[test]
    fn framing_error_is_protocol_violation() {
        let err = CoreError::Framing(FramingError::FrameTooLarge(100));
        assert_eq!(err.kind(), ErrorKind::ProtocolViolation);
        assert!(!err.is_retryable());
    }

    #[test]
    fn user_cancel_is_silent() {
        let err = CoreError::UserCancel;
        assert_eq!(err.kind(), ErrorKind::UserCancel);
    }
}
