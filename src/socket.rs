//! Blocking socket primitives.
//!
//! Everything in this module blocks; the library only calls it during
//! resource setup (resolve, bind, listen, option setting), never on the
//! event-loop hot path.

use std::ffi::{CStr, CString};
use std::io;
use std::mem;
use std::os::fd::RawFd;
use std::ptr;

/// IP version of a resolved address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpVersion {
    V4,
    V6,
}

impl IpVersion {
    fn family(self) -> libc::c_int {
        match self {
            IpVersion::V4 => libc::AF_INET,
            IpVersion::V6 => libc::AF_INET6,
        }
    }
}

/// Owning handle over a kernel file descriptor.
///
/// At most one live owner; moved-from handles are inert; destruction
/// closes the descriptor iff it is positive.
#[derive(Debug)]
pub struct FileDescriptor {
    fd: RawFd,
}

impl FileDescriptor {
    pub const INVALID: RawFd = -1;

    pub fn from_raw(fd: RawFd) -> Self {
        FileDescriptor { fd }
    }

    pub fn invalid() -> Self {
        FileDescriptor { fd: Self::INVALID }
    }

    pub fn raw(&self) -> RawFd {
        self.fd
    }

    pub fn is_open(&self) -> bool {
        self.fd > 0
    }

    /// Transfer ownership out, leaving this handle inert.
    pub fn take(&mut self) -> FileDescriptor {
        FileDescriptor {
            fd: mem::replace(&mut self.fd, Self::INVALID),
        }
    }

    /// Relinquish ownership without closing.
    pub fn into_raw(mut self) -> RawFd {
        mem::replace(&mut self.fd, Self::INVALID)
    }
}

impl From<RawFd> for FileDescriptor {
    fn from(fd: RawFd) -> Self {
        FileDescriptor::from_raw(fd)
    }
}

impl Drop for FileDescriptor {
    fn drop(&mut self) {
        if self.fd > 0 {
            unsafe {
                libc::close(self.fd);
            }
        }
    }
}

/// An IPv4 or IPv6 socket address, immutable once resolved.
#[derive(Clone, Copy)]
pub enum SocketAddress {
    V4(libc::sockaddr_in),
    V6(libc::sockaddr_in6),
}

impl SocketAddress {
    /// Pointer and length pair suitable for kernel calls.
    ///
    /// The pointer borrows from `self`; it is valid for as long as this
    /// `SocketAddress` is not moved or dropped.
    pub fn as_sockaddr(&self) -> (*const libc::sockaddr, libc::socklen_t) {
        match self {
            SocketAddress::V4(sa) => (
                sa as *const libc::sockaddr_in as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            ),
            SocketAddress::V6(sa) => (
                sa as *const libc::sockaddr_in6 as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
            ),
        }
    }

    pub fn ip_version(&self) -> IpVersion {
        match self {
            SocketAddress::V4(_) => IpVersion::V4,
            SocketAddress::V6(_) => IpVersion::V6,
        }
    }
}

impl std::fmt::Debug for SocketAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SocketAddress::V4(_) => f.write_str("SocketAddress::V4"),
            SocketAddress::V6(_) => f.write_str("SocketAddress::V6"),
        }
    }
}

/// Resolve a hostname and port to a stream socket address.
///
/// `passive` sets `AI_PASSIVE`, yielding an address suitable for binding
/// a listening socket.
pub fn resolve(host: &str, port: u16, passive: bool) -> io::Result<SocketAddress> {
    let host_c = CString::new(host)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "host contains a NUL byte"))?;
    let service = CString::new(port.to_string()).expect("port string has no NUL");

    let mut hints: libc::addrinfo = unsafe { mem::zeroed() };
    hints.ai_family = libc::AF_UNSPEC;
    hints.ai_socktype = libc::SOCK_STREAM;
    if passive {
        hints.ai_flags = libc::AI_PASSIVE;
    }

    let mut list: *mut libc::addrinfo = ptr::null_mut();
    let rc = unsafe { libc::getaddrinfo(host_c.as_ptr(), service.as_ptr(), &hints, &mut list) };
    if rc != 0 {
        let message = unsafe { CStr::from_ptr(libc::gai_strerror(rc)) }
            .to_string_lossy()
            .into_owned();
        return Err(io::Error::new(io::ErrorKind::NotFound, message));
    }

    let mut entry = list;
    let mut resolved = None;
    while !entry.is_null() {
        let info = unsafe { &*entry };
        match info.ai_family {
            libc::AF_INET => {
                let sa = unsafe { *(info.ai_addr as *const libc::sockaddr_in) };
                resolved = Some(SocketAddress::V4(sa));
                break;
            }
            libc::AF_INET6 => {
                let sa = unsafe { *(info.ai_addr as *const libc::sockaddr_in6) };
                resolved = Some(SocketAddress::V6(sa));
                break;
            }
            _ => entry = info.ai_next,
        }
    }
    unsafe { libc::freeaddrinfo(list) };

    resolved.ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            "no IPv4 or IPv6 address for host",
        )
    })
}

/// Create a blocking stream socket of the given family.
pub fn stream_socket(version: IpVersion) -> io::Result<FileDescriptor> {
    let fd = unsafe { libc::socket(version.family(), libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(FileDescriptor::from_raw(fd))
}

/// Set or clear a boolean `SOL_SOCKET` option.
pub fn set_option(socket: &FileDescriptor, option: libc::c_int, enable: bool) -> io::Result<()> {
    let value: libc::c_int = if enable { 1 } else { 0 };
    let rc = unsafe {
        libc::setsockopt(
            socket.raw(),
            libc::SOL_SOCKET,
            option,
            &value as *const _ as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub fn bind(socket: &FileDescriptor, address: &SocketAddress) -> io::Result<()> {
    let (addr, addrlen) = address.as_sockaddr();
    let rc = unsafe { libc::bind(socket.raw(), addr, addrlen) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub fn listen(socket: &FileDescriptor, backlog: usize) -> io::Result<()> {
    let backlog = backlog.min(libc::c_int::MAX as usize) as libc::c_int;
    let rc = unsafe { libc::listen(socket.raw(), backlog) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Blocking connect. The engine's async connect path never calls this;
/// it exists for setup-time plumbing and diagnostics.
pub fn connect(socket: &FileDescriptor, address: &SocketAddress) -> io::Result<()> {
    let (addr, addrlen) = address.as_sockaddr();
    let rc = unsafe { libc::connect(socket.raw(), addr, addrlen) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_loopback_v4() {
        let address = resolve("127.0.0.1", 4242, true).unwrap();
        assert_eq!(address.ip_version(), IpVersion::V4);
        let (ptr, len) = address.as_sockaddr();
        assert!(!ptr.is_null());
        assert_eq!(len as usize, mem::size_of::<libc::sockaddr_in>());
    }

    #[test]
    fn resolve_rejects_nul() {
        assert!(resolve("bad\0host", 80, false).is_err());
    }

    #[test]
    fn descriptor_move_semantics() {
        let mut owner = FileDescriptor::from_raw(0);
        // fd 0 is never closed (destruction closes iff positive).
        let moved = owner.take();
        assert!(!owner.is_open());
        assert_eq!(moved.raw(), 0);
    }

    #[test]
    fn bind_listen_connect_round_trip() {
        let address = resolve("127.0.0.1", 0, true).unwrap();
        let listener = stream_socket(address.ip_version()).unwrap();
        set_option(&listener, libc::SO_REUSEADDR, true).unwrap();
        bind(&listener, &address).unwrap();
        listen(&listener, 16).unwrap();

        // Recover the kernel-assigned port for the connect side.
        let mut bound: libc::sockaddr_in = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockname(
                listener.raw(),
                &mut bound as *mut _ as *mut libc::sockaddr,
                &mut len,
            )
        };
        assert_eq!(rc, 0);
        let port = u16::from_be(bound.sin_port);

        let target = resolve("127.0.0.1", port, false).unwrap();
        let client = stream_socket(target.ip_version()).unwrap();
        connect(&client, &target).unwrap();
    }
}
