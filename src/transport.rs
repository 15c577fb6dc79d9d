//! Byte-stream transports.
//!
//! A transport is a non-blocking stream socket with partial-progress send
//! and receive. The TLS variant wraps the plain one; see [`crate::tls`].
//! Connection establishment covers Unix sockets, TCP (one address at a
//! time, driven by the connect states), inherited sockets, and subprocess
//! servers speaking NBD on stdin/stdout.

use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Child, Command as ProcCommand, Stdio};

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::sys::socket::{
    self, sockopt, AddressFamily, MsgFlags, SockFlag, SockType, SockaddrIn, SockaddrIn6, UnixAddr,
};

use crate::state::Direction;
use crate::tls::TlsTransport;

fn nix_io(e: Errno) -> io::Error {
    io::Error::from_raw_os_error(e as i32)
}

/// A connected, non-blocking stream socket.
pub(crate) struct PlainTransport {
    fd: OwnedFd,
}

impl PlainTransport {
    /// Adopt `fd`, forcing it into non-blocking mode.
    pub fn new(fd: OwnedFd) -> io::Result<Self> {
        let flags = fcntl(fd.as_raw_fd(), FcntlArg::F_GETFL).map_err(nix_io)?;
        let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
        fcntl(fd.as_raw_fd(), FcntlArg::F_SETFL(flags)).map_err(nix_io)?;
        Ok(PlainTransport { fd })
    }

    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        socket::recv(self.fd.as_raw_fd(), buf, MsgFlags::empty()).map_err(nix_io)
    }

    pub fn send(&mut self, buf: &[u8], more: bool) -> io::Result<usize> {
        let mut flags = MsgFlags::MSG_NOSIGNAL;
        if more {
            flags |= MsgFlags::from_bits_truncate(libc::MSG_MORE);
        }
        socket::send(self.fd.as_raw_fd(), buf, flags).map_err(nix_io)
    }

    pub fn shut_writes(&mut self) -> io::Result<()> {
        socket::shutdown(self.fd.as_raw_fd(), socket::Shutdown::Write).map_err(nix_io)
    }
}

/// The handle's connection: plain from the start, upgraded in place when
/// the server accepts STARTTLS.
pub(crate) enum Conn {
    Plain(PlainTransport),
    Tls(TlsTransport),
}

impl Conn {
    pub fn raw_fd(&self) -> RawFd {
        match self {
            Conn::Plain(t) => t.raw_fd(),
            Conn::Tls(t) => t.raw_fd(),
        }
    }

    /// Receive into `buf`. `Ok(0)` means the peer closed; `WouldBlock`
    /// means no bytes are available yet.
    pub fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Conn::Plain(t) => t.recv(buf),
            Conn::Tls(t) => t.recv(buf),
        }
    }

    /// Send from `buf`, returning the bytes accepted. `more` hints that
    /// another frame follows immediately; correctness must not depend on
    /// it.
    pub fn send(&mut self, buf: &[u8], more: bool) -> io::Result<usize> {
        match self {
            Conn::Plain(t) => t.send(buf, more),
            Conn::Tls(t) => t.send(buf, more),
        }
    }

    /// Extra readiness the transport itself is waiting for (TLS record
    /// plumbing); combined with the state machine's own direction.
    pub fn pending_direction(&self) -> Direction {
        match self {
            Conn::Plain(_) => Direction::None,
            Conn::Tls(t) => t.pending_direction(),
        }
    }

    /// Whether decrypted bytes are already buffered, i.e. a recv can make
    /// progress without the socket polling readable.
    pub fn has_buffered_read(&self) -> bool {
        match self {
            Conn::Plain(_) => false,
            Conn::Tls(t) => t.has_buffered_read(),
        }
    }

    /// Half-close the write side. Returns false if the close is still in
    /// flight (TLS close-notify blocked) and must be retried.
    pub fn shut_writes(&mut self) -> io::Result<bool> {
        match self {
            Conn::Plain(t) => t.shut_writes().map(|()| true),
            Conn::Tls(t) => t.shut_writes(),
        }
    }
}

/// Create a non-blocking stream socket for `family`.
fn stream_socket(family: AddressFamily) -> io::Result<OwnedFd> {
    let fd = socket::socket(
        family,
        SockType::Stream,
        SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
        None,
    )
    .map_err(nix_io)?;
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Begin connecting to a Unix socket. Returns the transport and whether
/// the connect is still in progress (check with [`so_error`] once the
/// socket polls writable).
pub(crate) fn connect_unix_start(path: &Path) -> io::Result<(PlainTransport, bool)> {
    let fd = stream_socket(AddressFamily::Unix)?;
    let addr = UnixAddr::new(path).map_err(nix_io)?;
    let in_progress = match socket::connect(fd.as_raw_fd(), &addr) {
        Ok(()) => false,
        Err(Errno::EINPROGRESS) => true,
        Err(e) => return Err(nix_io(e)),
    };
    Ok((PlainTransport { fd }, in_progress))
}

/// Begin connecting to one resolved TCP address.
pub(crate) fn connect_tcp_start(addr: &SocketAddr) -> io::Result<(PlainTransport, bool)> {
    let family = match addr {
        SocketAddr::V4(_) => AddressFamily::Inet,
        SocketAddr::V6(_) => AddressFamily::Inet6,
    };
    let fd = stream_socket(family)?;
    // Disable Nagle's algorithm on the socket, but don't fail.
    let _ = socket::setsockopt(fd.as_raw_fd(), sockopt::TcpNoDelay, &true);
    let res = match addr {
        SocketAddr::V4(a) => socket::connect(fd.as_raw_fd(), &SockaddrIn::from(*a)),
        SocketAddr::V6(a) => socket::connect(fd.as_raw_fd(), &SockaddrIn6::from(*a)),
    };
    let in_progress = match res {
        Ok(()) => false,
        Err(Errno::EINPROGRESS) => true,
        Err(e) => return Err(nix_io(e)),
    };
    Ok((PlainTransport { fd }, in_progress))
}

/// Status of the asynchronous connect on `fd` (the saved SO_ERROR).
pub(crate) fn so_error(fd: RawFd) -> io::Result<i32> {
    socket::getsockopt(fd, sockopt::SocketError).map_err(nix_io)
}

fn command_socketpair() -> io::Result<(OwnedFd, OwnedFd)> {
    let (a, b) = socket::socketpair(
        AddressFamily::Unix,
        SockType::Stream,
        None,
        SockFlag::SOCK_CLOEXEC,
    )
    .map_err(nix_io)?;
    Ok(unsafe { (OwnedFd::from_raw_fd(a), OwnedFd::from_raw_fd(b)) })
}

/// Spawn `argv` as an NBD server speaking the protocol on its
/// stdin/stdout, connected to the returned transport by a socketpair. The
/// socket is made non-blocking only on the parent's side; the child may
/// not expect a non-blocking socket.
pub(crate) fn spawn_command(argv: &[String]) -> io::Result<(PlainTransport, Child)> {
    if argv.is_empty() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty command"));
    }
    let (parent, child_end) = command_socketpair()?;
    let stdin_end = child_end.try_clone()?;
    let mut cmd = ProcCommand::new(&argv[0]);
    cmd.args(&argv[1..]);
    cmd.stdin(unsafe { Stdio::from_raw_fd(stdin_end.into_raw_fd()) });
    cmd.stdout(unsafe { Stdio::from_raw_fd(child_end.into_raw_fd()) });
    let child = cmd.spawn()?;
    Ok((PlainTransport::new(parent)?, child))
}

/// Spawn `argv` with the socket passed by the systemd socket-activation
/// protocol: fd 3 in the child, advertised via LISTEN_FDS/LISTEN_PID.
pub(crate) fn spawn_socket_activation(argv: &[String]) -> io::Result<(PlainTransport, Child)> {
    const LISTEN_FD: RawFd = 3;
    if argv.is_empty() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty command"));
    }
    let (parent, child_end) = command_socketpair()?;
    // the raw fd is captured by the pre_exec hook; the owned handle stays
    // alive until after spawn so the parent's copy closes exactly once
    let sock = child_end.as_raw_fd();
    let mut cmd = ProcCommand::new(&argv[0]);
    cmd.args(&argv[1..]);
    cmd.env("LISTEN_FDS", "1");
    unsafe {
        cmd.pre_exec(move || {
            if sock == LISTEN_FD {
                // already in place; just clear close-on-exec
                fcntl(LISTEN_FD, FcntlArg::F_SETFD(FdFlag::empty()))
                    .map_err(|e| io::Error::from_raw_os_error(e as i32))?;
            } else {
                // dup2 clears close-on-exec on the new descriptor
                nix::unistd::dup2(sock, LISTEN_FD)
                    .map_err(|e| io::Error::from_raw_os_error(e as i32))?;
            }
            // LISTEN_PID must name the child, so it is set between fork
            // and exec
            std::env::set_var("LISTEN_PID", std::process::id().to_string());
            Ok(())
        });
    }
    let child = cmd.spawn()?;
    drop(child_end);
    Ok((PlainTransport::new(parent)?, child))
}

/// Adopt an already-connected stream socket.
pub(crate) fn adopt_socket(fd: OwnedFd) -> io::Result<PlainTransport> {
    PlainTransport::new(fd)
}
