//! Request/response correlation over message-oriented transports.
//!
//! Devices speak a fire-and-forget framing protocol. The types here turn that
//! into an awaitable call: one slot per device, a oneshot per slot, a deadline
//! per attempt and a bounded retry when the reply could not be parsed.

pub mod assistant;
pub mod invoker;
pub mod slot;

pub use assistant::{AssistantChannel, AssistantRequest, AssistantResponse};
pub use invoker::DeviceInvoker;
pub use slot::CorrelationSlot;

use std::time::Duration;

/// Value delivered through a correlation slot.
pub type SlotResult<T> = Result<T, CorrelatorError>;

/// Failures surfaced by the correlators.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CorrelatorError {
    #[error("no connected device for session {0}")]
    UnknownSession(String),

    #[error("session {0} already has a request in flight")]
    Busy(String),

    /// The reply arrived but could not be decoded, usually a fragmented frame.
    #[error("unexpected parse error in device response")]
    UnexpectedParse,

    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("device returned {status_code}: {message}")]
    ProtocolFault { status_code: u16, message: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("connection closed before a response arrived")]
    Disconnected,

    #[error("failed to encode request: {0}")]
    Encode(String),
}

impl CorrelatorError {
    /// Only parse failures are retried; everything else is final.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::UnexpectedParse)
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::ProtocolFault { status_code: 401, .. })
    }
}
