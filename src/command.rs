//! Commands: the unit of work in the transmission phase.
//!
//! A command lives in exactly one of the handle's three queues (`to_issue`,
//! `in_flight`, `done`) from creation to retirement. The cookie is the sole
//! identifier the server echoes back in its replies.

use crate::callbacks::{ChunkCallback, CompletionCallback, ExtentCallback};
use crate::proto::{Cmd, CmdFlag};

pub(crate) struct Command {
    pub cookie: u64,
    pub typ: Cmd,
    pub flags: CmdFlag,
    pub offset: u64,
    pub count: u32,
    /// Data buffer owned for the life of the command: the payload for
    /// WRITE, the destination for READ, empty otherwise.
    pub buf: Vec<u8>,
    pub completion: Option<CompletionCallback>,
    pub chunk: Option<ChunkCallback>,
    pub extent: Option<ExtentCallback>,
    /// First error recorded for this command (server- or client-side);
    /// sticky once set.
    pub error: i32,
    /// Bytes of the requested range accounted for so far.
    pub data_seen: u32,
    /// Sub-ranges of `[offset, offset + count)` not yet covered by a chunk.
    /// Only maintained for READ commands.
    remaining: Vec<(u64, u64)>,
    /// Content chunks (data or hole) delivered so far; used to police DF.
    pub content_chunks: u32,
    /// Set when a chunk/extent callback asked for delivery to stop.
    pub delivery_aborted: bool,
}

impl Command {
    pub fn new(cookie: u64, typ: Cmd, offset: u64, count: u32, buf: Vec<u8>) -> Self {
        let remaining = if typ == Cmd::READ && count > 0 {
            vec![(offset, offset + count as u64)]
        } else {
            Vec::new()
        };
        Command {
            cookie,
            typ,
            flags: CmdFlag::empty(),
            offset,
            count,
            buf,
            completion: None,
            chunk: None,
            extent: None,
            error: 0,
            data_seen: 0,
            remaining,
            content_chunks: 0,
            delivery_aborted: false,
        }
    }

    /// Record an error if none has been recorded yet.
    pub fn set_error(&mut self, errno: i32) {
        if self.error == 0 {
            self.error = errno;
        }
    }

    /// Whether the requested range has been fully covered by chunks.
    pub fn range_covered(&self) -> bool {
        self.remaining.is_empty()
    }

    /// Account a chunk covering `[chunk_offset, chunk_offset + len)`.
    ///
    /// The range must carve a piece out of exactly one remaining range:
    /// anything else (zero length, outside the request, overlapping an
    /// already-seen range) is a server protocol violation and returns
    /// false. Interior hits split the remaining range in two.
    pub fn mark_range(&mut self, chunk_offset: u64, len: u64) -> bool {
        if len == 0 {
            return false;
        }
        let first = chunk_offset;
        let Some(last) = chunk_offset.checked_add(len) else {
            return false;
        };
        let idx = match self
            .remaining
            .iter()
            .position(|&(lo, hi)| first >= lo && first < hi)
        {
            Some(i) => i,
            None => return false,
        };
        let (lo, hi) = self.remaining[idx];
        if last > hi {
            return false;
        }
        match (first == lo, last == hi) {
            (true, true) => {
                self.remaining.remove(idx);
            }
            (true, false) => self.remaining[idx] = (last, hi),
            (false, true) => self.remaining[idx] = (lo, first),
            (false, false) => {
                self.remaining[idx] = (lo, first);
                self.remaining.insert(idx + 1, (last, hi));
            }
        }
        self.data_seen = self.data_seen.saturating_add(len as u32);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_cmd() -> Command {
        Command::new(1, Cmd::READ, 1024, 1024, vec![0; 1024])
    }

    #[test]
    fn full_range_single_chunk() {
        let mut cmd = read_cmd();
        assert!(cmd.mark_range(1024, 1024));
        assert!(cmd.range_covered());
        assert_eq!(cmd.data_seen, 1024);
    }

    #[test]
    fn interior_chunk_splits_remaining() {
        let mut cmd = read_cmd();
        assert!(cmd.mark_range(1536, 128));
        assert!(!cmd.range_covered());
        // the two leftover pieces are individually claimable, once
        assert!(cmd.mark_range(1024, 512));
        assert!(cmd.mark_range(1664, 384));
        assert!(cmd.range_covered());
    }

    #[test]
    fn overlap_and_out_of_range_rejected() {
        let mut cmd = read_cmd();
        assert!(cmd.mark_range(1024, 512));
        assert!(!cmd.mark_range(1024, 512), "overlap");
        assert!(!cmd.mark_range(1280, 512), "straddles seen range");
        assert!(!cmd.mark_range(0, 16), "before request");
        assert!(!cmd.mark_range(2047, 2), "past request end");
        assert!(!cmd.mark_range(1536, 0), "zero length");
    }

    #[test]
    fn error_is_sticky() {
        let mut cmd = read_cmd();
        cmd.set_error(5);
        cmd.set_error(22);
        assert_eq!(cmd.error, 5);
    }
}
