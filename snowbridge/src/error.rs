//! Bridge error types.
//!
//! Every failure mode has a named variant; the adapter turns each of them into
//! a distinct message for the invoking actor.

use std::time::Duration;

use crate::bridge::transport::Endpoint;

/// Errors from bringing the channel up. Fatal to `open()`.
#[derive(Debug, thiserror::Error)]
pub enum ChannelSetupError {
    #[error("failed to bind {endpoint}: {source}")]
    Bind {
        endpoint: Endpoint,
        #[source]
        source: std::io::Error,
    },

    #[error("no responder attached within {timeout:?}")]
    AttachTimeout { timeout: Duration },

    #[error("bridge channel is closed")]
    Closed,
}

/// Errors from a single call. All are recoverable.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BridgeError {
    /// Channel never opened, closed, or no responder attached right now.
    #[error("bridge channel not ready: no responder attached")]
    NotReady,

    #[error("responder disconnected: {reason}")]
    Disconnected { reason: String },

    #[error("no reply within {timeout:?}")]
    CallTimeout { timeout: Duration },

    /// Another call holds the channel and the busy policy did not let this one wait.
    #[error("bridge channel busy")]
    Busy,

    /// The responder answered, but with a failure instead of a reply.
    #[error("responder returned no answer: {message}")]
    Responder { message: String },
}

impl BridgeError {
    pub fn disconnected(reason: impl Into<String>) -> Self {
        Self::Disconnected {
            reason: reason.into(),
        }
    }

    /// Whether retrying later could plausibly succeed without operator action.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::CallTimeout { .. } | Self::Busy)
    }
}

/// Result type alias for bridge calls.
pub type BridgeResult<T> = Result<T, BridgeError>;
