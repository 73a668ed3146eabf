use std::borrow::Cow;
use std::io;

use thiserror::Error;

use crate::event::ErrorEvent;

/// Errors returned by the ringcall engine.
#[derive(Debug, Error)]
pub enum Error {
    /// io_uring setup or operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Ring setup failed (e.g., invalid configuration or unsupported kernel).
    #[error("ring setup: {0}")]
    RingSetup(String),
    /// Provided-buffer ring registration failed.
    #[error("buffer registration: {0}")]
    BufferRegistration(String),
    /// The request pool has no free slots for another in-flight request.
    #[error("request queue is full")]
    QueueFull,
    /// A completion carried a missing or out-of-range buffer id.
    #[error("invalid buffer id in completion")]
    InvalidBuffer,
    /// The event loop backing a resource has been dropped.
    #[error("event loop is gone")]
    LoopGone,
}

/// Errors surfaced through the event loop's error handler.
///
/// These never abort the loop; they are reported and the loop continues.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The submit syscall returned a hard negative.
    #[error("submit failed: {}", .0.what())]
    Submit(ErrorEvent),
    /// A completion could not be dispatched (malformed entry, bad magic,
    /// unknown opcode, missing live request, invalid buffer id).
    #[error("{0}")]
    Dispatch(&'static str),
}

/// Success-or-message status returned by resource methods.
///
/// Carries a success flag and a stable, human-readable message. Callers
/// check `success()`; the message contextualizes setup failures
/// (resolution, socket creation, bind, listen, option setting) without
/// forcing an error type on application callbacks.
#[must_use]
#[derive(Debug, Clone)]
pub struct MessagedStatus {
    success: bool,
    message: Cow<'static, str>,
}

impl MessagedStatus {
    pub fn ok(message: impl Into<Cow<'static, str>>) -> Self {
        MessagedStatus {
            success: true,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<Cow<'static, str>>) -> Self {
        MessagedStatus {
            success: false,
            message: message.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.success
    }

    /// The status message.
    pub fn what(&self) -> &str {
        &self.message
    }
}

impl From<MessagedStatus> for bool {
    fn from(status: MessagedStatus) -> bool {
        status.success
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messaged_status_truthiness() {
        let ok = MessagedStatus::ok("Pending connection requests");
        assert!(ok.success());
        assert_eq!(ok.what(), "Pending connection requests");

        let err = MessagedStatus::error("Already listening");
        assert!(!err.success());
        assert_eq!(err.what(), "Already listening");
        assert!(!bool::from(err));
    }
}
