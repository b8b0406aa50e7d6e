//! Per-message settlement decision.

use super::hook::ProcessError;

/// What to tell the broker about one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    /// Without requeue the broker routes the message to the dead-letter queue.
    Reject { requeue: bool },
}

impl Disposition {
    pub const DEAD_LETTER: Disposition = Disposition::Reject { requeue: false };
    pub const REQUEUE: Disposition = Disposition::Reject { requeue: true };

    /// Validation errors are dead-lettered; every other error is requeued.
    pub fn from_outcome(outcome: &Result<(), ProcessError>) -> Self {
        match outcome {
            Ok(()) => Disposition::Ack,
            Err(e) if e.is_validation() => Disposition::DEAD_LETTER,
            Err(_) => Disposition::REQUEUE,
        }
    }
}
