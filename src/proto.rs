//! NBD protocol constants and wire-level definitions.
//!
//! See <https://github.com/NetworkBlockDevice/nbd/blob/master/doc/proto.md> for
//! the protocol description.
#![allow(clippy::upper_case_acronyms)]
#![allow(non_camel_case_types)]

use bitflags::bitflags;
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Default port for NBD over TCP.
pub const TCP_PORT: u16 = 10809;

pub(crate) const MAGIC: u64 = 0x4e42444d41474943; // b"NBDMAGIC"
pub(crate) const IHAVEOPT: u64 = 0x49484156454F5054; // b"IHAVEOPT"
pub(crate) const OLD_VERSION: u64 = 0x420281861253;
pub(crate) const REPLY_MAGIC: u64 = 0x3e889045565a9;

// transmission constants
pub(crate) const REQUEST_MAGIC: u32 = 0x25609513;
pub(crate) const SIMPLE_REPLY_MAGIC: u32 = 0x67446698;
pub(crate) const STRUCTURED_REPLY_MAGIC: u32 = 0x668e33ef;

/// Upper bound the protocol places on strings (export names, descriptions,
/// metadata context names, error messages).
pub(crate) const MAX_STRING: usize = 4096;

/// Upper bound on a single request or reply payload. Requests above this are
/// rejected client-side (strict mode) and replies above it indicate a server
/// that has lost protocol synchronization.
pub(crate) const MAX_REQUEST_SIZE: usize = 64 * 1024 * 1024;

/// Size of the transmission-phase request header on the wire.
pub(crate) const REQUEST_SIZE: usize = 28;
/// Size of a simple reply header (also the speculative read size for any
/// reply; the structured header is strictly larger).
pub(crate) const SIMPLE_REPLY_SIZE: usize = 16;
/// Size of a structured reply header.
pub(crate) const STRUCTURED_REPLY_SIZE: usize = 20;
/// Size of an option reply header.
pub(crate) const OPTION_REPLY_SIZE: usize = 20;

/// Write payloads under this size get the "more data coming" hint when
/// further requests are queued behind them.
pub(crate) const COALESCE_LIMIT: usize = 64 * 1024;

bitflags! {
  /// Global flags sent by a newstyle server.
  pub(crate) struct HandshakeFlags: u16 {
    const FIXED_NEWSTYLE = 0b01;
    const NO_ZEROES = 0b10;
  }

  /// Flags the client echoes back after the newstyle greeting.
  pub(crate) struct ClientHandshakeFlags: u32 {
    const C_FIXED_NEWSTYLE = 0b01;
    const C_NO_ZEROES = 0b10;
  }

  /// Per-export transmission flags.
  pub struct TransmitFlags: u16 {
    const HAS_FLAGS = 1 << 0;
    const READ_ONLY = 1 << 1;
    const SEND_FLUSH = 1 << 2;
    const SEND_FUA = 1 << 3;
    const ROTATIONAL = 1 << 4;
    const SEND_TRIM = 1 << 5;
    const SEND_WRITE_ZEROES = 1 << 6;
    const SEND_DF = 1 << 7;
    const CAN_MULTI_CONN = 1 << 8;
    const SEND_RESIZE = 1 << 9;
    const SEND_CACHE = 1 << 10;
    const SEND_FAST_ZERO = 1 << 11;
  }

  /// Flags modifying a single command.
  pub struct CmdFlag: u16 {
    const FUA = 1 << 0;
    const NO_HOLE = 1 << 1;
    // "don't fragment"
    const DF = 1 << 2;
    const REQ_ONE = 1 << 3;
    const FAST_ZERO = 1 << 4;
  }

  /// Client-side precondition checks applied before a command is sent.
  /// All bits default to enabled; clearing one allows deliberate protocol
  /// probing.
  pub struct StrictFlags: u32 {
    /// Reject commands the server did not advertise support for.
    const COMMANDS = 1 << 0;
    /// Reject command flag bits not meaningful for the command type.
    const FLAGS = 1 << 1;
    /// Reject offsets or counts outside the export.
    const BOUNDS = 1 << 2;
    /// Reject zero-length transactions.
    const ZERO_SIZE = 1 << 3;
    /// Reject oversized payloads.
    const PAYLOAD = 1 << 4;
  }

  /// Flags for [`crate::Handle::shutdown`].
  pub struct ShutdownFlags: u32 {
    /// Fail commands that have not begun transmission instead of draining
    /// them.
    const ABANDON_PENDING = 0x10000;
  }
}

impl Default for StrictFlags {
    fn default() -> Self {
        StrictFlags::all()
    }
}

#[derive(IntoPrimitive, TryFromPrimitive, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub(crate) enum OptType {
    EXPORT_NAME = 1,
    ABORT = 2,
    LIST = 3,
    STARTTLS = 5,
    INFO = 6,
    GO = 7,
    STRUCTURED_REPLY = 8,
    LIST_META_CONTEXT = 9,
    SET_META_CONTEXT = 10,
}

#[derive(IntoPrimitive, TryFromPrimitive, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub(crate) enum ReplyType {
    ACK = 1,
    SERVER = 2,
    INFO = 3,
    META_CONTEXT = 4,
    ERR_UNSUP = (1 << 31) + 1,
    ERR_POLICY = (1 << 31) + 2,
    ERR_INVALID = (1 << 31) + 3,
    ERR_PLATFORM = (1 << 31) + 4,
    ERR_TLS_REQD = (1 << 31) + 5,
    ERR_UNKNOWN = (1 << 31) + 6,
    ERR_SHUTDOWN = (1 << 31) + 7,
    ERR_BLOCK_SIZE_REQD = (1 << 31) + 8,
    ERR_TOO_BIG = (1 << 31) + 9,
}

impl ReplyType {
    /// The high bit discriminates error replies from informational ones,
    /// including codes this client does not know by name.
    pub fn is_error(raw: u32) -> bool {
        raw & (1 << 31) != 0
    }
}

#[derive(IntoPrimitive, TryFromPrimitive, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u16)]
pub(crate) enum InfoType {
    EXPORT = 0,
    NAME = 1,
    DESCRIPTION = 2,
    BLOCK_SIZE = 3,
}

/// Transmission-phase command types.
#[derive(IntoPrimitive, TryFromPrimitive, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u16)]
pub enum Cmd {
    READ = 0,
    WRITE = 1,
    // NBD_CMD_DISC
    DISC = 2,
    FLUSH = 3,
    TRIM = 4,
    CACHE = 5,
    WRITE_ZEROES = 6,
    BLOCK_STATUS = 7,
}

impl Cmd {
    /// Command flag bits that are meaningful for this command type.
    pub(crate) fn valid_flags(&self) -> CmdFlag {
        match self {
            Cmd::READ => CmdFlag::DF,
            Cmd::WRITE => CmdFlag::FUA,
            Cmd::TRIM => CmdFlag::FUA,
            Cmd::WRITE_ZEROES => CmdFlag::FUA | CmdFlag::NO_HOLE | CmdFlag::FAST_ZERO,
            Cmd::BLOCK_STATUS => CmdFlag::REQ_ONE,
            Cmd::DISC | Cmd::FLUSH | Cmd::CACHE => CmdFlag::empty(),
        }
    }
}

/// Structured reply chunk types.
#[derive(IntoPrimitive, TryFromPrimitive, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u16)]
pub(crate) enum ChunkType {
    NONE = 0,
    OFFSET_DATA = 1,
    OFFSET_HOLE = 2,
    BLOCK_STATUS = 5,
    ERROR = (1 << 15) + 1,
    ERROR_OFFSET = (1 << 15) + 2,
}

/// Structured reply flags (16-bit field); DONE marks the final chunk for a
/// cookie.
pub(crate) const REPLY_FLAG_DONE: u16 = 1 << 0;

/// Error codes a server may put in a reply. The values double as errno
/// numbers on Linux.
#[derive(IntoPrimitive, TryFromPrimitive, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub(crate) enum NbdError {
    OK = 0,
    EPERM = 1,
    EIO = 5,
    ENOMEM = 12,
    EINVAL = 22,
    ENOSPC = 28,
    EOVERFLOW = 75,
    ENOTSUP = 95,
    ESHUTDOWN = 108,
}

/// Translate a wire error code to a local errno value. Unknown codes
/// collapse to EIO rather than leaking server-specific numbers.
pub(crate) fn errno_of_nbd_error(raw: u32) -> i32 {
    match NbdError::try_from(raw) {
        Ok(NbdError::OK) => 0,
        Ok(e) => u32::from(e) as i32,
        Err(_) => NbdError::EIO as u32 as i32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_reply_bit() {
        assert!(ReplyType::is_error(ReplyType::ERR_UNSUP.into()));
        assert!(ReplyType::is_error((1 << 31) + 99));
        assert!(!ReplyType::is_error(ReplyType::ACK.into()));
    }

    #[test]
    fn unknown_wire_error_becomes_eio() {
        assert_eq!(errno_of_nbd_error(0), 0);
        assert_eq!(errno_of_nbd_error(22), 22);
        assert_eq!(errno_of_nbd_error(9999), 5);
    }

    #[test]
    fn flag_validity_per_command() {
        assert!(Cmd::READ.valid_flags().contains(CmdFlag::DF));
        assert!(!Cmd::READ.valid_flags().contains(CmdFlag::FUA));
        assert!(Cmd::WRITE_ZEROES.valid_flags().contains(CmdFlag::FAST_ZERO));
        assert!(Cmd::FLUSH.valid_flags().is_empty());
    }
}
