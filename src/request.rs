//! Request records submitted to the kernel.
//!
//! Every operation handed to the ring is backed by a record starting with
//! a 16-byte [`RequestHeader`]. The record's stable address is the
//! kernel's `user_data`, so a pointer recovered from a completion is
//! reinterpreted first as the header (magic check, opcode tag) and then
//! as the concrete record type the tag selects. Records are plain `Copy`
//! data; payloads that must outlive the completion travel separately as
//! [`PayloadGuard`]s owned by the engine.

use std::fmt;
use std::os::fd::RawFd;

use bytes::Bytes;

use crate::socket::SocketAddress;
use crate::subscriber::Subscriber;

/// Sentinel checked on every completion before any other interpretation.
pub(crate) const HEADER_MAGIC: u32 = 0xA1B2_C3D4;

/// Operation tag stored in every request header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Opcode {
    Accept = 0xA1A1_A1A1,
    Connect = 0xB2B2_B2B2,
    Read = 0xC3C3_C3C3,
    ReadMultishot = 0xD4D4_D4D4,
    Write = 0xE5E5_E5E5,
}

impl Opcode {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0xA1A1_A1A1 => Some(Opcode::Accept),
            0xB2B2_B2B2 => Some(Opcode::Connect),
            0xC3C3_C3C3 => Some(Opcode::Read),
            0xD4D4_D4D4 => Some(Opcode::ReadMultishot),
            0xE5E5_E5E5 => Some(Opcode::Write),
            _ => None,
        }
    }

    /// Multishot registrations stay armed across completions; single-shot
    /// records are released after their one completion is dispatched.
    pub fn is_multishot(self) -> bool {
        matches!(self, Opcode::Accept | Opcode::ReadMultishot)
    }
}

/// 16-byte standard-layout prefix at offset 0 of every request record.
#[derive(Clone, Copy)]
#[repr(C)]
pub(crate) struct RequestHeader {
    magic: u32,
    op: u32,
    subscriber: *const Subscriber,
}

impl RequestHeader {
    pub fn new(op: Opcode, subscriber: *const Subscriber) -> Self {
        RequestHeader {
            magic: HEADER_MAGIC,
            op: op as u32,
            subscriber,
        }
    }

    pub fn valid(&self) -> bool {
        self.magic == HEADER_MAGIC
    }

    pub fn opcode(&self) -> Option<Opcode> {
        Opcode::from_u32(self.op)
    }

    /// The opaque subscriber pointer recorded at push time.
    pub fn subscriber_ptr(&self) -> *const Subscriber {
        self.subscriber
    }

    #[cfg(test)]
    pub fn corrupt_magic(&mut self) {
        self.magic = 0;
    }
}

#[derive(Clone, Copy)]
#[repr(C)]
pub(crate) struct AcceptRequest {
    pub header: RequestHeader,
    pub listening_socket_fd: RawFd,
}

#[derive(Clone, Copy)]
#[repr(C)]
pub(crate) struct ConnectRequest {
    pub header: RequestHeader,
    pub socket_fd: RawFd,
    pub addr: *const libc::sockaddr,
    pub addrlen: libc::socklen_t,
}

/// Single-shot read with a reception buffer specified upfront. Needs to
/// be renewed once completed.
#[derive(Clone, Copy)]
#[repr(C)]
pub(crate) struct ReadRequest {
    pub header: RequestHeader,
    pub fd: RawFd,
    pub buf: *mut u8,
    pub len: u32,
}

/// Multishot read. The kernel picks a provided buffer from the group at
/// completion time.
#[derive(Clone, Copy)]
#[repr(C)]
pub(crate) struct MultishotReadRequest {
    pub header: RequestHeader,
    pub fd: RawFd,
    pub buffer_group: u16,
}

#[derive(Clone, Copy)]
#[repr(C)]
pub(crate) struct WriteRequest {
    pub header: RequestHeader,
    pub fd: RawFd,
    pub data: *const u8,
    pub len: u32,
}

/// One pool slot, sized and aligned for any record. The header is at
/// offset 0 of every variant, so a slot pointer is always a valid header
/// pointer.
#[derive(Clone, Copy)]
#[repr(C)]
pub(crate) union RequestSlot {
    pub header: RequestHeader,
    pub accept: AcceptRequest,
    pub connect: ConnectRequest,
    pub read: ReadRequest,
    pub read_multishot: MultishotReadRequest,
    pub write: WriteRequest,
}

const _: () = assert!(std::mem::size_of::<RequestHeader>() == 16);
const _: () = assert!(std::mem::offset_of!(AcceptRequest, header) == 0);
const _: () = assert!(std::mem::offset_of!(ConnectRequest, header) == 0);
const _: () = assert!(std::mem::offset_of!(ReadRequest, header) == 0);
const _: () = assert!(std::mem::offset_of!(MultishotReadRequest, header) == 0);
const _: () = assert!(std::mem::offset_of!(WriteRequest, header) == 0);

/// A request as handed to [`EventLoop::add`](crate::EventLoop::add).
///
/// Owned payloads (the connect target, a single-shot read buffer, write
/// bytes) are moved into the engine and kept alive until the matching
/// completion has been dispatched.
pub enum Request {
    /// Multishot accept on a listening descriptor.
    Accept { listening_socket_fd: RawFd },
    /// Single-shot connect to a resolved address.
    Connect { fd: RawFd, addr: SocketAddress },
    /// Single-shot read into an engine-owned buffer of `capacity` bytes.
    Read { fd: RawFd, capacity: usize },
    /// Multishot read backed by the provided-buffer ring.
    ReadMultishot { fd: RawFd },
    /// Single-shot write of the given bytes.
    Write { fd: RawFd, bytes: Bytes },
}

impl Request {
    pub fn opcode(&self) -> Opcode {
        match self {
            Request::Accept { .. } => Opcode::Accept,
            Request::Connect { .. } => Opcode::Connect,
            Request::Read { .. } => Opcode::Read,
            Request::ReadMultishot { .. } => Opcode::ReadMultishot,
            Request::Write { .. } => Opcode::Write,
        }
    }

    /// The descriptor the operation targets.
    pub fn fd(&self) -> RawFd {
        match *self {
            Request::Accept {
                listening_socket_fd,
            } => listening_socket_fd,
            Request::Connect { fd, .. } => fd,
            Request::Read { fd, .. } => fd,
            Request::ReadMultishot { fd } => fd,
            Request::Write { fd, .. } => fd,
        }
    }
}

/// Owned payload kept alive from push until record release. The record
/// holds raw pointers into the payload; the guard is never read back,
/// only dropped.
#[allow(dead_code)]
pub(crate) enum PayloadGuard {
    None,
    /// The sockaddr a submitted connect points at.
    Connect(Box<SocketAddress>),
    /// The reception buffer a submitted single-shot read points at.
    Read(Box<[u8]>),
    /// The source bytes a submitted write points at.
    Write(Bytes),
}

impl fmt::Display for AcceptRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "accept request for listening socket {}",
            self.listening_socket_fd
        )
    }
}

impl fmt::Display for ConnectRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "connect request for socket {}", self.socket_fd)
    }
}

impl fmt::Display for ReadRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "single shot read request using buffer of size {} bytes for socket {}",
            self.len, self.fd
        )
    }
}

impl fmt::Display for MultishotReadRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "multi shot read request using buffer group {} for socket {}",
            self.buffer_group, self.fd
        )
    }
}

impl fmt::Display for WriteRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "write request of {} bytes for socket {}", self.len, self.fd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr;

    #[test]
    fn opcode_round_trip() {
        for op in [
            Opcode::Accept,
            Opcode::Connect,
            Opcode::Read,
            Opcode::ReadMultishot,
            Opcode::Write,
        ] {
            assert_eq!(Opcode::from_u32(op as u32), Some(op));
        }
    }

    #[test]
    fn unknown_tag_rejected() {
        assert_eq!(Opcode::from_u32(0), None);
        assert_eq!(Opcode::from_u32(0xDEAD_BEEF), None);
    }

    #[test]
    fn multishot_classification() {
        assert!(Opcode::Accept.is_multishot());
        assert!(Opcode::ReadMultishot.is_multishot());
        assert!(!Opcode::Connect.is_multishot());
        assert!(!Opcode::Read.is_multishot());
        assert!(!Opcode::Write.is_multishot());
    }

    #[test]
    fn header_magic_validation() {
        let mut header = RequestHeader::new(Opcode::Write, ptr::null());
        assert!(header.valid());
        assert_eq!(header.opcode(), Some(Opcode::Write));
        header.corrupt_magic();
        assert!(!header.valid());
    }

    #[test]
    fn header_reinterprets_from_any_record() {
        let record = WriteRequest {
            header: RequestHeader::new(Opcode::Write, ptr::null()),
            fd: 7,
            data: ptr::null(),
            len: 13,
        };
        // A record pointer doubles as a header pointer.
        let header = unsafe { &*(&record as *const WriteRequest as *const RequestHeader) };
        assert!(header.valid());
        assert_eq!(header.opcode(), Some(Opcode::Write));
    }
}
