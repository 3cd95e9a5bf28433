// src/syscalls.rs
use crate::error::EmberResult;
use libc::{c_int, c_void, socklen_t};
use std::io::{self, IoSlice, Read, Write};
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;

// ---- Socket Operations ----

/// Create a non-blocking listening TCP socket bound to `host:port`.
pub fn create_listen_socket(host: &str, port: u16) -> EmberResult<OwnedFd> {
    let addr_str = format!("{}:{}", host, port);
    let addr: SocketAddr = addr_str
        .parse()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid listen address"))?;

    let domain = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };

    unsafe {
        // Atomic non-blocking + close-on-exec socket
        let fd = libc::socket(
            domain,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        );
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }
        // From here on the descriptor is closed on every early return.
        let owned = OwnedFd::from_raw_fd(fd);

        let one: c_int = 1;
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        );
        // TCP_NODELAY on the listener is inherited by accepted sockets
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_NODELAY,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        );

        bind_addr(fd, &addr)?;

        if libc::listen(fd, libc::SOMAXCONN) < 0 {
            return Err(io::Error::last_os_error().into());
        }

        Ok(owned)
    }
}

fn bind_addr(fd: c_int, addr: &SocketAddr) -> io::Result<()> {
    let res = unsafe {
        match addr {
            SocketAddr::V4(a) => {
                let sin = libc::sockaddr_in {
                    sin_family: libc::AF_INET as libc::sa_family_t,
                    sin_port: a.port().to_be(),
                    sin_addr: libc::in_addr {
                        s_addr: u32::from_ne_bytes(a.ip().octets()),
                    },
                    sin_zero: [0; 8],
                };
                libc::bind(
                    fd,
                    &sin as *const _ as *const libc::sockaddr,
                    mem::size_of_val(&sin) as socklen_t,
                )
            }
            SocketAddr::V6(a) => {
                let sin6 = libc::sockaddr_in6 {
                    sin6_family: libc::AF_INET6 as libc::sa_family_t,
                    sin6_port: a.port().to_be(),
                    sin6_flowinfo: a.flowinfo(),
                    sin6_addr: libc::in6_addr {
                        s6_addr: a.ip().octets(),
                    },
                    sin6_scope_id: a.scope_id(),
                };
                libc::bind(
                    fd,
                    &sin6 as *const _ as *const libc::sockaddr,
                    mem::size_of_val(&sin6) as socklen_t,
                )
            }
        }
    };
    if res < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn storage_to_addr(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as c_int {
        libc::AF_INET => {
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
            Some(SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(sin.sin_port))))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Some(SocketAddr::V6(SocketAddrV6::new(
                ip,
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        _ => None,
    }
}

/// Accept one pending connection as a non-blocking socket.
/// Returns `Ok(None)` once the backlog is drained.
pub fn accept_connection(listen_fd: RawFd) -> io::Result<Option<(OwnedFd, Option<SocketAddr>)>> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;
    let fd = unsafe {
        libc::accept4(
            listen_fd,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        )
    };
    if fd < 0 {
        let err = io::Error::last_os_error();
        return match err.kind() {
            io::ErrorKind::WouldBlock => Ok(None),
            // A peer that resets before we accept is not a listener failure
            _ if err.raw_os_error() == Some(libc::ECONNABORTED) => Ok(None),
            _ => Err(err),
        };
    }
    let owned = unsafe { OwnedFd::from_raw_fd(fd) };
    Ok(Some((owned, storage_to_addr(&storage))))
}

/// Address a socket is bound to (resolves port 0 after bind).
pub fn local_addr(fd: RawFd) -> io::Result<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;
    let res = unsafe {
        libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len)
    };
    if res < 0 {
        return Err(io::Error::last_os_error());
    }
    storage_to_addr(&storage)
        .ok_or_else(|| io::Error::new(io::ErrorKind::Unsupported, "unknown address family"))
}

// ---- Epoll Operations ----

/// Readiness interest for a registered descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Read,
    Write,
}

impl Interest {
    fn bits(self) -> u32 {
        match self {
            Interest::Read => libc::EPOLLIN as u32,
            Interest::Write => libc::EPOLLOUT as u32,
        }
    }
}

pub use libc::epoll_event;

pub const EPOLLIN: u32 = libc::EPOLLIN as u32;
pub const EPOLLOUT: u32 = libc::EPOLLOUT as u32;
pub const EPOLLRDHUP: u32 = libc::EPOLLRDHUP as u32;
pub const EPOLLHUP: u32 = libc::EPOLLHUP as u32;
pub const EPOLLERR: u32 = libc::EPOLLERR as u32;

pub fn empty_event() -> epoll_event {
    epoll_event { events: 0, u64: 0 }
}

/// Thin owner of an epoll instance. Every registration is edge-triggered;
/// connection sockets are additionally one-shot so a descriptor is handed to
/// exactly one thread per notification.
pub struct Epoll {
    fd: OwnedFd,
}

impl Epoll {
    pub fn new() -> EmberResult<Self> {
        unsafe {
            let fd = libc::epoll_create1(libc::EPOLL_CLOEXEC);
            if fd < 0 {
                return Err(io::Error::last_os_error().into());
            }
            Ok(Self {
                fd: OwnedFd::from_raw_fd(fd),
            })
        }
    }

    /// Register a long-lived descriptor (listener, signal pipe).
    pub fn add(&self, fd: RawFd, token: u64, interest: Interest) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, token, interest.bits() | libc::EPOLLET as u32)
    }

    /// Register a connection socket: edge-triggered, one-shot, peer hang-up reported.
    pub fn add_oneshot(&self, fd: RawFd, token: u64, interest: Interest) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, token, oneshot_bits(interest))
    }

    /// Re-arm a one-shot registration with the next interest set.
    pub fn rearm(&self, fd: RawFd, token: u64, interest: Interest) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, token, oneshot_bits(interest))
    }

    pub fn delete(&self, fd: RawFd) -> io::Result<()> {
        unsafe {
            if libc::epoll_ctl(self.fd.as_raw_fd(), libc::EPOLL_CTL_DEL, fd, ptr::null_mut()) < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::ENOENT) {
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// Block until at least one event is ready. `None` waits forever.
    /// An interrupted wait reports zero events.
    pub fn wait(&self, events: &mut [epoll_event], timeout_ms: Option<i32>) -> io::Result<usize> {
        unsafe {
            let res = libc::epoll_wait(
                self.fd.as_raw_fd(),
                events.as_mut_ptr(),
                events.len() as c_int,
                timeout_ms.unwrap_or(-1),
            );

            if res < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    return Ok(0);
                }
                return Err(err);
            }

            Ok(res as usize)
        }
    }

    fn ctl(&self, op: c_int, fd: RawFd, token: u64, events: u32) -> io::Result<()> {
        let mut event = epoll_event { events, u64: token };
        unsafe {
            if libc::epoll_ctl(self.fd.as_raw_fd(), op, fd, &mut event) < 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }
}

fn oneshot_bits(interest: Interest) -> u32 {
    interest.bits() | (libc::EPOLLET | libc::EPOLLONESHOT | libc::EPOLLRDHUP) as u32
}

// ---- Non-blocking stream over a raw descriptor ----

const MAX_IOV: usize = 1024;

/// `Read`/`Write` view of a non-blocking socket. `WouldBlock` surfaces as an
/// error of that kind; a zero-length read is end of stream.
pub struct FdStream {
    fd: RawFd,
}

impl FdStream {
    pub fn new(fd: RawFd) -> Self {
        Self { fd }
    }
}

impl Read for FdStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let res = unsafe { libc::read(self.fd, buf.as_mut_ptr() as *mut c_void, buf.len()) };
        if res < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(res as usize)
    }
}

impl Write for FdStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let res = unsafe { libc::write(self.fd, buf.as_ptr() as *const c_void, buf.len()) };
        if res < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(res as usize)
    }

    /// Scatter-gather write of every segment in a single syscall.
    fn write_vectored(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        // IoSlice is ABI-compatible with iovec on unix
        let count = bufs.len().min(MAX_IOV);
        let res = unsafe {
            libc::writev(self.fd, bufs.as_ptr() as *const libc::iovec, count as c_int)
        };
        if res < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(res as usize)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

// ---- Self-pipe ----

/// Create a non-blocking pipe. Returns (read_end, write_end).
pub fn create_pipe() -> EmberResult<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as c_int; 2];
    unsafe {
        if libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok((OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])))
    }
}

/// Write one byte to the pipe; a full pipe already guarantees a wakeup.
pub fn write_byte(fd: RawFd, byte: u8) -> io::Result<()> {
    let res = unsafe { libc::write(fd, &byte as *const u8 as *const c_void, 1) };
    if res < 0 {
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::WouldBlock {
            return Err(err);
        }
    }
    Ok(())
}

/// Drain every pending byte from the pipe.
pub fn drain_pipe(fd: RawFd) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut buf = [0u8; 64];
    loop {
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut c_void, buf.len()) };
        if n < 0 {
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::WouldBlock => return Ok(out),
                io::ErrorKind::Interrupted => continue,
                _ => return Err(err),
            }
        }
        if n == 0 {
            return Ok(out);
        }
        out.extend_from_slice(&buf[..n as usize]);
    }
}

// ---- Process signals ----

/// Writes to a half-closed peer must fail with EPIPE instead of killing the process.
pub fn ignore_sigpipe() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

/// Schedule a SIGALRM `secs` seconds from now.
pub fn schedule_alarm(secs: u32) {
    unsafe {
        libc::alarm(secs);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpStream;

    #[test]
    fn listen_accept_and_stream_io() {
        let listener = create_listen_socket("127.0.0.1", 0).unwrap();
        let addr = local_addr(listener.as_raw_fd()).unwrap();
        assert_ne!(addr.port(), 0);

        assert!(accept_connection(listener.as_raw_fd()).unwrap().is_none());

        let mut client = TcpStream::connect(addr).unwrap();
        let accepted = loop {
            if let Some(conn) = accept_connection(listener.as_raw_fd()).unwrap() {
                break conn;
            }
            std::thread::yield_now();
        };
        let (sock, peer) = accepted;
        assert_eq!(peer, Some(client.local_addr().unwrap()));

        let mut stream = FdStream::new(sock.as_raw_fd());
        let mut buf = [0u8; 16];
        let err = stream.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);

        let n = stream
            .write_vectored(&[IoSlice::new(b"head "), IoSlice::new(b"tail")])
            .unwrap();
        assert_eq!(n, 9);
        let mut got = [0u8; 9];
        client.read_exact(&mut got).unwrap();
        assert_eq!(&got, b"head tail");
    }

    #[test]
    fn pipe_round_trip() {
        let (rx, tx) = create_pipe().unwrap();
        assert!(drain_pipe(rx.as_raw_fd()).unwrap().is_empty());
        write_byte(tx.as_raw_fd(), 14).unwrap();
        write_byte(tx.as_raw_fd(), 15).unwrap();
        assert_eq!(drain_pipe(rx.as_raw_fd()).unwrap(), vec![14, 15]);
    }

    #[test]
    fn epoll_reports_pipe_readiness() {
        let epoll = Epoll::new().unwrap();
        let (rx, tx) = create_pipe().unwrap();
        epoll.add(rx.as_raw_fd(), 42, Interest::Read).unwrap();

        let mut events = vec![empty_event(); 4];
        assert_eq!(epoll.wait(&mut events, Some(0)).unwrap(), 0);

        write_byte(tx.as_raw_fd(), 1).unwrap();
        assert_eq!(epoll.wait(&mut events, Some(1000)).unwrap(), 1);
        let token = events[0].u64;
        assert_eq!(token, 42);
        epoll.delete(rx.as_raw_fd()).unwrap();
        epoll.delete(rx.as_raw_fd()).unwrap();
    }
}
