//! Typed events synthesized from completions.
//!
//! Each completion the engine dispatches becomes exactly one of these,
//! delivered to the subscriber of the resource that issued the request.
//! Read and write events borrow their byte spans; the storage behind a
//! read span is returned to the kernel as soon as the handler returns.

use std::io;
use std::os::fd::RawFd;

/// A new connection was accepted on a listening socket.
#[derive(Debug, Clone, Copy)]
pub struct AcceptEvent {
    /// Descriptor of the accepted client socket.
    pub client_fd: RawFd,
}

/// An outbound connect finished successfully.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectEvent;

/// Data arrived on a socket.
#[derive(Debug, Clone, Copy)]
pub struct ReadEvent<'a> {
    pub fd: RawFd,
    /// The received bytes. Empty when the peer closed the stream.
    pub bytes_read: &'a [u8],
}

/// A write finished.
#[derive(Debug, Clone, Copy)]
pub struct WriteEvent<'a> {
    pub fd: RawFd,
    /// The bytes that were handed to the kernel for this write.
    pub bytes_written: &'a [u8],
}

/// A kernel operation completed with an error.
#[derive(Debug, Clone, Copy)]
pub struct ErrorEvent {
    /// Positive errno value from the completion.
    pub error_code: i32,
}

impl ErrorEvent {
    /// Human-readable message for the error code.
    pub fn what(&self) -> String {
        io::Error::from_raw_os_error(self.error_code).to_string()
    }
}
