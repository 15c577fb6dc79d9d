//! Error surface: typed error kinds, errno mapping, and the per-thread
//! last-error slot.

use std::cell::RefCell;
use std::error;
use std::fmt;
use std::io;

use nix::errno::Errno;

/// Result type returned by every fallible call in this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Caller misuse: bad argument, wrong handle state.
    InvalidArgument,
    /// An API that needs an active session was called without one.
    NotConnected,
    /// The server violated the protocol.
    Protocol,
    /// Option refused by the server, capability not advertised, or feature
    /// not compiled in.
    Unsupported,
    /// The server announced it is shutting down.
    Shutdown,
    /// TLS was required but could not be established.
    TlsRequired,
    /// The server refused to upgrade to TLS.
    TlsRefused,
    /// A blocking helper's deadline expired.
    Timeout,
    /// Transport-level failure.
    Io,
}

impl ErrorKind {
    fn default_errno(&self) -> i32 {
        match self {
            ErrorKind::InvalidArgument => Errno::EINVAL as i32,
            ErrorKind::NotConnected => Errno::ENOTCONN as i32,
            ErrorKind::Protocol => Errno::EPROTO as i32,
            ErrorKind::Unsupported => Errno::ENOTSUP as i32,
            ErrorKind::Shutdown => Errno::ESHUTDOWN as i32,
            ErrorKind::TlsRequired => Errno::ENOTSUP as i32,
            ErrorKind::TlsRefused => Errno::ENOTSUP as i32,
            ErrorKind::Timeout => Errno::ETIMEDOUT as i32,
            ErrorKind::Io => Errno::EIO as i32,
        }
    }
}

/// An error raised by the engine: a kind, a human-readable message, and an
/// errno-equivalent numeric code.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    msg: String,
    errno: i32,
}

impl Error {
    pub fn new<S: Into<String>>(kind: ErrorKind, msg: S) -> Self {
        Error {
            errno: kind.default_errno(),
            kind,
            msg: msg.into(),
        }
    }

    pub fn with_errno<S: Into<String>>(kind: ErrorKind, errno: i32, msg: S) -> Self {
        Error {
            kind,
            msg: msg.into(),
            errno,
        }
    }

    pub(crate) fn invalid<S: Into<String>>(msg: S) -> Self {
        Self::new(ErrorKind::InvalidArgument, msg)
    }

    pub(crate) fn not_connected<S: Into<String>>(msg: S) -> Self {
        Self::new(ErrorKind::NotConnected, msg)
    }

    pub(crate) fn protocol<S: Into<String>>(msg: S) -> Self {
        Self::new(ErrorKind::Protocol, msg)
    }

    pub(crate) fn unsupported<S: Into<String>>(msg: S) -> Self {
        Self::new(ErrorKind::Unsupported, msg)
    }

    pub(crate) fn timeout<S: Into<String>>(msg: S) -> Self {
        Self::new(ErrorKind::Timeout, msg)
    }

    pub(crate) fn io(err: io::Error, context: &str) -> Self {
        Error {
            kind: ErrorKind::Io,
            msg: format!("{context}: {err}"),
            errno: err.raw_os_error().unwrap_or(Errno::EIO as i32),
        }
    }

    /// Build an error for a failed command from the errno recorded on it.
    pub(crate) fn from_command_errno(errno: i32, context: &str) -> Self {
        let kind = match Errno::from_i32(errno) {
            Errno::ENOTCONN => ErrorKind::NotConnected,
            Errno::EPROTO => ErrorKind::Protocol,
            Errno::ENOTSUP | Errno::ENOENT => ErrorKind::Unsupported,
            Errno::ESHUTDOWN => ErrorKind::Shutdown,
            Errno::ETIMEDOUT => ErrorKind::Timeout,
            Errno::EINVAL => ErrorKind::InvalidArgument,
            _ => ErrorKind::Io,
        };
        Error {
            kind,
            msg: format!("{context}: {}", Errno::from_i32(errno).desc()),
            errno,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn errno(&self) -> i32 {
        self.errno
    }

    pub fn message(&self) -> &str {
        &self.msg
    }

    /// Store a copy in the calling thread's last-error slot and pass the
    /// error through. Every public entry point funnels failures through
    /// here.
    pub(crate) fn record(self) -> Self {
        LAST_ERROR.with(|slot| {
            *slot.borrow_mut() = Some((self.msg.clone(), self.errno));
        });
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "nbd: {}", self.msg)
    }
}

impl error::Error for Error {}

thread_local! {
    static LAST_ERROR: RefCell<Option<(String, i32)>> = RefCell::new(None);
}

/// Message recorded by the most recent failing call on this thread.
pub fn get_error() -> Option<String> {
    LAST_ERROR.with(|slot| slot.borrow().as_ref().map(|(m, _)| m.clone()))
}

/// Numeric code recorded by the most recent failing call on this thread,
/// or 0 if no call has failed.
pub fn get_errno() -> i32 {
    LAST_ERROR.with(|slot| slot.borrow().as_ref().map_or(0, |&(_, e)| e))
}
