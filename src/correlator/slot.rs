use std::time::{Duration, Instant};

use tokio::sync::oneshot;

use super::SlotResult;

/// A request waiting for exactly one answer.
///
/// Fulfilling consumes the slot, so a late duplicate can never resolve the
/// same awaiter twice.
#[derive(Debug)]
pub struct CorrelationSlot<T> {
    message_id: u64,
    created_at: Instant,
    sender: oneshot::Sender<SlotResult<T>>,
}

impl<T> CorrelationSlot<T> {
    pub fn open(message_id: u64) -> (Self, oneshot::Receiver<SlotResult<T>>) {
        let (sender, receiver) = oneshot::channel();
        (
            Self {
                message_id,
                created_at: Instant::now(),
                sender,
            },
            receiver,
        )
    }

    pub fn message_id(&self) -> u64 {
        self.message_id
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// `false` once the awaiter has gone away (timed out or cancelled).
    pub fn is_live(&self) -> bool {
        !self.sender.is_closed()
    }

    /// Deliver the result. Returns whether an awaiter received it.
    pub fn fulfil(self, result: SlotResult<T>) -> bool {
        self.sender.send(result).is_ok()
    }
}
