//! Client engine for the Network Block Device (NBD) protocol.
//!
//! A [`Handle`] is a non-blocking protocol engine for one connection: it
//! drives the handshake (oldstyle and fixed newstyle, including TLS,
//! structured replies and metadata contexts), multiplexes many in-flight
//! block I/O commands over the socket, and decodes simple and structured
//! replies into user callbacks without ever blocking internally.
//!
//! Two façades are exposed over the same engine:
//!
//! * synchronous calls ([`Handle::pread`], [`Handle::pwrite`], …) that
//!   poll internally and return when the command completes;
//! * async primitives ([`Handle::aio_pread`], …) returning a cookie,
//!   with [`Handle::aio_get_direction`] /[`Handle::aio_notify_read`] /
//!   [`Handle::aio_notify_write`] for integration into any event loop
//!   and [`Handle::aio_command_completed`] to retire completions.
//!
//! See <https://github.com/NetworkBlockDevice/nbd/blob/master/doc/proto.md>
//! for the protocol description.

mod aio;
mod callbacks;
mod command;
mod errors;
mod handle;
mod handshake;
mod issue;
mod proto;
mod reply;
mod state;
mod sync;
mod tls;
mod transport;

pub use callbacks::{
    ChunkCallback, ChunkStatus, CompletionCallback, ContextCallback, DebugCallback,
    ExtentCallback, ListCallback,
};
pub use errors::{get_errno, get_error, Error, ErrorKind, Result};
pub use handle::{BlockSizeKind, Handle, TlsMode};
pub use proto::{Cmd, CmdFlag, ShutdownFlags, StrictFlags, TransmitFlags, TCP_PORT};
pub use state::Direction;
