//! Reply-side transmission states: decode simple and structured replies
//! and route them to in-flight commands by cookie.
//!
//! Both reply forms are read speculatively as a 16-byte header (the
//! structured header is strictly larger) and discriminated by magic.
//! Large payload receives yield back to READY between socket events so
//! queued requests keep flowing in the other direction.

use byteorder::{ByteOrder, BE};
use nix::errno::Errno;

use crate::callbacks::ChunkStatus;
use crate::errors::{Error, Result};
use crate::handle::{Flow, Handle, RecvProgress, RecvTarget};
use crate::proto::{
    errno_of_nbd_error, ChunkType, Cmd, CmdFlag, MAX_REQUEST_SIZE, MAX_STRING, REPLY_FLAG_DONE,
    SIMPLE_REPLY_MAGIC, SIMPLE_REPLY_SIZE, STRUCTURED_REPLY_MAGIC, STRUCTURED_REPLY_SIZE,
};
use crate::state::{ReplyState, SimpleReplyState, State, StructuredReplyState};

/// Block-status payloads beyond this are not credible.
const MAX_BS_PAYLOAD: usize = 1024 * 1024;

impl Handle {
    pub(crate) fn step_reply(&mut self, s: ReplyState) -> Result<Flow> {
        match s {
            ReplyState::Start => self.reply_start(),
            ReplyState::RecvReply => match self.recv_into_rbuf()? {
                RecvProgress::Done => {
                    self.state = State::Reply(ReplyState::CheckSimpleOrStructured);
                    Ok(Flow::Continue)
                }
                RecvProgress::Again => Ok(Flow::Block),
                RecvProgress::Eof => {
                    if self.rpos == 0 {
                        self.enter_closed();
                        Ok(Flow::Block)
                    } else {
                        Err(Error::protocol("unexpected end of stream inside a reply"))
                    }
                }
            },
            ReplyState::CheckSimpleOrStructured => self.check_reply_magic(),
            ReplyState::Simple(s) => self.step_simple_reply(s),
            ReplyState::Structured(s) => self.step_structured_reply(s),
            ReplyState::FinishCommand => {
                if let Some(idx) = self.reply_cmd.take() {
                    if let Some(cmd) = self.cmds_in_flight.remove(idx) {
                        self.finish_command_to_done(cmd);
                    }
                }
                self.state = State::Ready;
                Ok(Flow::Continue)
            }
        }
    }

    fn reply_start(&mut self) -> Result<Flow> {
        // an interrupted reply takes precedence over a new header
        if let Some(saved) = self.saved_reply.take() {
            self.state = State::Reply(saved);
            return Ok(Flow::Continue);
        }
        self.begin_recv_sbuf(SIMPLE_REPLY_SIZE);
        match self.recv_into_rbuf()? {
            RecvProgress::Done => {
                self.state = State::Reply(ReplyState::CheckSimpleOrStructured);
                Ok(Flow::Continue)
            }
            RecvProgress::Again => {
                self.state = State::Reply(ReplyState::RecvReply);
                Ok(Flow::Block)
            }
            RecvProgress::Eof => {
                if self.rpos == 0 {
                    // reading zero bytes here means the server closed the
                    // connection between replies
                    self.enter_closed();
                    Ok(Flow::Block)
                } else {
                    Err(Error::protocol("unexpected end of stream inside a reply"))
                }
            }
        }
    }

    fn check_reply_magic(&mut self) -> Result<Flow> {
        let magic = BE::read_u32(&self.sbuf[0..4]);
        if magic == SIMPLE_REPLY_MAGIC {
            self.simple_error_raw = BE::read_u32(&self.sbuf[4..8]);
            self.reply_cookie = BE::read_u64(&self.sbuf[8..16]);
            self.reply_cmd = self.find_in_flight(self.reply_cookie);
            self.state = State::Reply(ReplyState::Simple(SimpleReplyState::Start));
            Ok(Flow::Continue)
        } else if magic == STRUCTURED_REPLY_MAGIC {
            if !self.structured_replies {
                return Err(Error::protocol(
                    "server sent a structured reply without negotiation",
                ));
            }
            self.state = State::Reply(ReplyState::Structured(StructuredReplyState::Start));
            Ok(Flow::Continue)
        } else {
            // we've probably lost synchronization
            Err(Error::protocol("invalid reply magic"))
        }
    }

    // ---- simple replies ----

    fn step_simple_reply(&mut self, s: SimpleReplyState) -> Result<Flow> {
        match s {
            SimpleReplyState::Start => {
                let error = errno_of_nbd_error(self.simple_error_raw);
                let Some(idx) = self.reply_cmd else {
                    // Unexpected reply. With an error set or structured
                    // replies negotiated there is no payload, so the next
                    // bytes are another reply and the stream survives.
                    // Otherwise we cannot know whether a READ payload
                    // follows, and the stream is unsynchronized.
                    if self.simple_error_raw != 0 || self.structured_replies {
                        self.state = State::Reply(ReplyState::FinishCommand);
                        return Ok(Flow::Continue);
                    }
                    return Err(Error::protocol(format!(
                        "no matching cookie {} found for server reply, \
                         this is probably a server bug",
                        self.reply_cookie
                    )));
                };
                let (is_read, count) = {
                    let cmd = &mut self.cmds_in_flight[idx];
                    if error != 0 {
                        cmd.set_error(error);
                    }
                    (cmd.typ == Cmd::READ, cmd.count)
                };
                if error == 0 && is_read && count > 0 {
                    self.begin_recv_cmd(idx, 0, count as usize);
                    self.state =
                        State::Reply(ReplyState::Simple(SimpleReplyState::RecvReadPayload));
                } else {
                    self.state = State::Reply(ReplyState::FinishCommand);
                }
                Ok(Flow::Continue)
            }
            SimpleReplyState::RecvReadPayload => match self.recv_into_rbuf()? {
                RecvProgress::Done => {
                    let Some(idx) = self.reply_cmd else {
                        return Err(Error::protocol("reply routing lost its command"));
                    };
                    let (offset, count) = {
                        let cmd = &mut self.cmds_in_flight[idx];
                        let o = cmd.offset;
                        let c = cmd.count;
                        cmd.mark_range(o, c as u64);
                        (o, c)
                    };
                    self.deliver_chunk(idx, 0, count as usize, offset, ChunkStatus::ReadData);
                    self.state = State::Reply(ReplyState::FinishCommand);
                    Ok(Flow::Continue)
                }
                RecvProgress::Again => self.yield_to_ready(ReplyState::Simple(
                    SimpleReplyState::RecvReadPayload,
                )),
                RecvProgress::Eof => {
                    Err(Error::protocol("unexpected end of stream inside a reply"))
                }
            },
        }
    }

    /// Park a partially received payload and return to READY so queued
    /// requests can make progress in the other direction.
    fn yield_to_ready(&mut self, resume: ReplyState) -> Result<Flow> {
        self.saved_reply = Some(resume);
        self.state = State::Ready;
        Ok(Flow::Continue)
    }

    /// Invoke a command's chunk callback over `buf[at..at + len]`.
    fn deliver_chunk(&mut self, idx: usize, at: usize, len: usize, offset: u64, status: ChunkStatus) {
        let cmd = &mut self.cmds_in_flight[idx];
        if cmd.delivery_aborted || cmd.chunk.is_none() {
            return;
        }
        let buf = std::mem::take(&mut cmd.buf);
        let mut err = cmd.error;
        let r = match cmd.chunk.as_mut() {
            Some(cb) => cb(&buf[at..at + len], offset, status, &mut err),
            None => 0,
        };
        cmd.buf = buf;
        if err != 0 && cmd.error == 0 {
            cmd.error = err;
        }
        if r < 0 {
            cmd.delivery_aborted = true;
            cmd.set_error(Errno::EPROTO as i32);
        }
    }

    // ---- structured replies ----

    fn step_structured_reply(&mut self, s: StructuredReplyState) -> Result<Flow> {
        use StructuredReplyState as S;
        match s {
            S::Start => {
                // the structured header is 4 bytes longer than the
                // speculative read
                self.extend_recv_sbuf(STRUCTURED_REPLY_SIZE);
                self.state = State::Reply(ReplyState::Structured(S::RecvRemaining));
                Ok(Flow::Continue)
            }
            S::RecvRemaining => match self.recv_into_rbuf()? {
                RecvProgress::Done => {
                    self.state = State::Reply(ReplyState::Structured(S::Check));
                    Ok(Flow::Continue)
                }
                RecvProgress::Again => Ok(Flow::Block),
                RecvProgress::Eof => {
                    Err(Error::protocol("unexpected end of stream inside a reply"))
                }
            },
            S::Check => self.check_structured_header(),
            S::RecvError => match self.recv_into_rbuf()? {
                RecvProgress::Done => {
                    self.chunk_err = BE::read_u32(&self.sbuf[0..4]);
                    self.chunk_msglen = BE::read_u16(&self.sbuf[4..6]) as usize;
                    let remaining = self.sr_len as usize - 6;
                    if self.chunk_msglen > remaining || self.chunk_msglen > MAX_STRING {
                        return Err(Error::protocol("invalid error chunk message length"));
                    }
                    self.begin_recv_sbuf(self.chunk_msglen);
                    self.state = State::Reply(ReplyState::Structured(S::RecvErrorMessage));
                    Ok(Flow::Continue)
                }
                RecvProgress::Again => Ok(Flow::Block),
                RecvProgress::Eof => {
                    Err(Error::protocol("unexpected end of stream inside a reply"))
                }
            },
            S::RecvErrorMessage => match self.recv_into_rbuf()? {
                RecvProgress::Done => {
                    if self.chunk_msglen > 0 {
                        let msg =
                            String::from_utf8_lossy(&self.sbuf[..self.chunk_msglen]).into_owned();
                        self.debug_msg(&format!("server error message: {msg}"));
                    }
                    let tail = self.sr_len as usize - 6 - self.chunk_msglen;
                    let offset_chunk = self.sr_type_raw == u16::from(ChunkType::ERROR_OFFSET);
                    if offset_chunk {
                        if tail != 8 {
                            return Err(Error::protocol("invalid error chunk length"));
                        }
                        self.begin_recv_sbuf(8);
                    } else {
                        if tail != 0 {
                            return Err(Error::protocol("invalid error chunk length"));
                        }
                        self.begin_recv_sbuf(0);
                    }
                    self.state = State::Reply(ReplyState::Structured(S::RecvErrorTail));
                    Ok(Flow::Continue)
                }
                RecvProgress::Again => Ok(Flow::Block),
                RecvProgress::Eof => {
                    Err(Error::protocol("unexpected end of stream inside a reply"))
                }
            },
            S::RecvErrorTail => match self.recv_into_rbuf()? {
                RecvProgress::Done => {
                    let offset_chunk =
                        self.sr_type_raw == u16::from(ChunkType::ERROR_OFFSET) && self.rlen == 8;
                    let err_offset = if offset_chunk {
                        BE::read_u64(&self.sbuf[0..8])
                    } else {
                        0
                    };
                    // an error chunk reporting success is itself an error
                    let errno = match errno_of_nbd_error(self.chunk_err) {
                        0 => Errno::EPROTO as i32,
                        e => e,
                    };
                    if let Some(idx) = self.reply_cmd {
                        let cb_offset = {
                            let cmd = &mut self.cmds_in_flight[idx];
                            cmd.set_error(errno);
                            let in_range = offset_chunk
                                && err_offset >= cmd.offset
                                && err_offset < cmd.offset + cmd.count as u64;
                            if in_range {
                                err_offset
                            } else {
                                cmd.offset
                            }
                        };
                        self.deliver_chunk(idx, 0, 0, cb_offset, ChunkStatus::ReadError);
                        // an error terminates chunk delivery for this
                        // command
                        self.cmds_in_flight[idx].delivery_aborted = true;
                    }
                    self.structured_chunk_done()
                }
                RecvProgress::Again => Ok(Flow::Block),
                RecvProgress::Eof => {
                    Err(Error::protocol("unexpected end of stream inside a reply"))
                }
            },
            S::RecvOffsetData => match self.recv_into_rbuf()? {
                RecvProgress::Done => {
                    self.chunk_offset = BE::read_u64(&self.sbuf[0..8]);
                    self.chunk_payload = self.sr_len as usize - 8;
                    self.route_offset_data_payload();
                    self.state = State::Reply(ReplyState::Structured(S::RecvOffsetDataData));
                    Ok(Flow::Continue)
                }
                RecvProgress::Again => Ok(Flow::Block),
                RecvProgress::Eof => {
                    Err(Error::protocol("unexpected end of stream inside a reply"))
                }
            },
            S::RecvOffsetDataData => match self.recv_into_rbuf()? {
                RecvProgress::Done => {
                    if let RecvTarget::CommandBuf { idx, at } = self.rtarget {
                        self.cmds_in_flight[idx].content_chunks += 1;
                        self.deliver_chunk(
                            idx,
                            at,
                            self.chunk_payload,
                            self.chunk_offset,
                            ChunkStatus::ReadData,
                        );
                    }
                    self.structured_chunk_done()
                }
                RecvProgress::Again => self.yield_to_ready(ReplyState::Structured(
                    S::RecvOffsetDataData,
                )),
                RecvProgress::Eof => {
                    Err(Error::protocol("unexpected end of stream inside a reply"))
                }
            },
            S::RecvOffsetHole => match self.recv_into_rbuf()? {
                RecvProgress::Done => {
                    let offset = BE::read_u64(&self.sbuf[0..8]);
                    let hole_len = BE::read_u32(&self.sbuf[8..12]);
                    self.process_hole_chunk(offset, hole_len);
                    self.structured_chunk_done()
                }
                RecvProgress::Again => Ok(Flow::Block),
                RecvProgress::Eof => {
                    Err(Error::protocol("unexpected end of stream inside a reply"))
                }
            },
            S::RecvBsEntries => match self.recv_into_rbuf()? {
                RecvProgress::Done => self.process_block_status(),
                RecvProgress::Again => {
                    self.yield_to_ready(ReplyState::Structured(S::RecvBsEntries))
                }
                RecvProgress::Eof => {
                    Err(Error::protocol("unexpected end of stream inside a reply"))
                }
            },
            S::Finish => match self.recv_into_rbuf()? {
                RecvProgress::Done => self.structured_chunk_done(),
                RecvProgress::Again => {
                    self.yield_to_ready(ReplyState::Structured(S::Finish))
                }
                RecvProgress::Eof => {
                    Err(Error::protocol("unexpected end of stream inside a reply"))
                }
            },
        }
    }

    fn check_structured_header(&mut self) -> Result<Flow> {
        use StructuredReplyState as S;
        self.sr_flags = BE::read_u16(&self.sbuf[4..6]);
        self.sr_type_raw = BE::read_u16(&self.sbuf[6..8]);
        self.reply_cookie = BE::read_u64(&self.sbuf[8..16]);
        self.sr_len = BE::read_u32(&self.sbuf[16..20]);
        let len = self.sr_len as usize;
        if len > MAX_REQUEST_SIZE {
            return Err(Error::protocol("structured reply length too large"));
        }
        self.reply_cmd = self.find_in_flight(self.reply_cookie);

        match ChunkType::try_from(self.sr_type_raw) {
            Ok(ChunkType::NONE) => {
                if let Some(idx) = self.reply_cmd {
                    // a NONE chunk must be final and empty
                    if len != 0 || self.sr_flags & REPLY_FLAG_DONE == 0 {
                        self.cmds_in_flight[idx].set_error(Errno::EPROTO as i32);
                    }
                }
                self.begin_recv_discard(len);
                self.state = State::Reply(ReplyState::Structured(S::Finish));
            }
            Ok(ChunkType::OFFSET_DATA) => {
                if len < 8 {
                    return Err(Error::protocol("offset-data chunk too short"));
                }
                self.begin_recv_sbuf(8);
                self.state = State::Reply(ReplyState::Structured(S::RecvOffsetData));
            }
            Ok(ChunkType::OFFSET_HOLE) => {
                if len != 12 {
                    return Err(Error::protocol("invalid offset-hole chunk length"));
                }
                self.begin_recv_sbuf(12);
                self.state = State::Reply(ReplyState::Structured(S::RecvOffsetHole));
            }
            Ok(ChunkType::BLOCK_STATUS) => {
                if len < 12 || (len - 4) % 8 != 0 {
                    return Err(Error::protocol("malformed block status chunk length"));
                }
                if len > MAX_BS_PAYLOAD {
                    return Err(Error::protocol("block status chunk implausibly large"));
                }
                self.begin_recv_sbuf(len);
                self.state = State::Reply(ReplyState::Structured(S::RecvBsEntries));
            }
            Ok(ChunkType::ERROR) | Ok(ChunkType::ERROR_OFFSET) => {
                if len < 6 {
                    return Err(Error::protocol("error chunk too short"));
                }
                self.begin_recv_sbuf(6);
                self.state = State::Reply(ReplyState::Structured(S::RecvError));
            }
            Err(_) => {
                self.debug_msg(&format!(
                    "skipping unknown structured reply chunk type {}",
                    self.sr_type_raw
                ));
                if let Some(idx) = self.reply_cmd {
                    self.cmds_in_flight[idx].set_error(Errno::EPROTO as i32);
                }
                self.begin_recv_discard(len);
                self.state = State::Reply(ReplyState::Structured(S::Finish));
            }
        }
        Ok(Flow::Continue)
    }

    /// Decide where an offset-data payload lands: the user buffer when the
    /// chunk is valid, the bit bucket when it is not.
    fn route_offset_data_payload(&mut self) {
        let payload = self.chunk_payload;
        let offset = self.chunk_offset;
        match self.reply_cmd {
            Some(idx) => {
                let cmd = &mut self.cmds_in_flight[idx];
                if payload == 0 {
                    // zero-length content chunks are forbidden
                    cmd.set_error(Errno::EPROTO as i32);
                    self.begin_recv_discard(0);
                    return;
                }
                let df_violation =
                    cmd.flags.contains(CmdFlag::DF) && cmd.content_chunks >= 1;
                let ok = cmd.typ == Cmd::READ
                    && !df_violation
                    && cmd.mark_range(offset, payload as u64);
                if ok {
                    let at = (offset - cmd.offset) as usize;
                    self.begin_recv_cmd(idx, at, payload);
                } else {
                    cmd.set_error(Errno::EPROTO as i32);
                    self.begin_recv_discard(payload);
                }
            }
            None => self.begin_recv_discard(payload),
        }
    }

    fn process_hole_chunk(&mut self, offset: u64, hole_len: u32) {
        let Some(idx) = self.reply_cmd else { return };
        let valid = {
            let cmd = &mut self.cmds_in_flight[idx];
            // a hole chunk violates a don't-fragment request outright
            let ok = cmd.typ == Cmd::READ
                && hole_len > 0
                && !cmd.flags.contains(CmdFlag::DF)
                && cmd.mark_range(offset, hole_len as u64);
            if !ok {
                cmd.set_error(Errno::EPROTO as i32);
            }
            ok
        };
        if valid {
            let at = {
                let cmd = &mut self.cmds_in_flight[idx];
                let at = (offset - cmd.offset) as usize;
                cmd.buf[at..at + hole_len as usize].fill(0);
                cmd.content_chunks += 1;
                at
            };
            self.deliver_chunk(idx, at, hole_len as usize, offset, ChunkStatus::ReadHole);
        }
    }

    fn process_block_status(&mut self) -> Result<Flow> {
        let len = self.sr_len as usize;
        let Some(idx) = self.reply_cmd else {
            return self.structured_chunk_done();
        };
        let context_id = BE::read_u32(&self.sbuf[0..4]);
        let name = self
            .meta_contexts
            .iter()
            .find(|(_, id)| *id == context_id)
            .map(|(n, _)| n.clone());

        let mut pairs = Vec::with_capacity((len - 4) / 8);
        let mut well_formed = true;
        for chunk in self.sbuf[4..len].chunks_exact(8) {
            let length = BE::read_u32(&chunk[0..4]);
            let status = BE::read_u32(&chunk[4..8]);
            if length == 0 {
                well_formed = false;
            }
            pairs.push((length, status));
        }

        let cmd = &mut self.cmds_in_flight[idx];
        let Some(name) = name else {
            // the server invented a context id we never negotiated
            cmd.set_error(Errno::EPROTO as i32);
            return self.structured_chunk_done();
        };
        if cmd.typ != Cmd::BLOCK_STATUS || !well_formed {
            cmd.set_error(Errno::EPROTO as i32);
            return self.structured_chunk_done();
        }
        if cmd.flags.contains(CmdFlag::REQ_ONE)
            && (pairs.len() != 1 || pairs[0].0 as u64 > cmd.count as u64)
        {
            cmd.set_error(Errno::EPROTO as i32);
            return self.structured_chunk_done();
        }
        if !cmd.delivery_aborted {
            if let Some(cb) = cmd.extent.as_mut() {
                let mut err = cmd.error;
                let r = cb(&name, cmd.offset, &pairs, &mut err);
                if err != 0 && cmd.error == 0 {
                    cmd.error = err;
                }
                if r < 0 {
                    cmd.delivery_aborted = true;
                    cmd.set_error(Errno::EPROTO as i32);
                }
            }
        }
        self.structured_chunk_done()
    }

    /// Account the end of one chunk: the DONE flag retires the command,
    /// anything else goes back to READY for the next header.
    fn structured_chunk_done(&mut self) -> Result<Flow> {
        if self.sr_flags & REPLY_FLAG_DONE != 0 {
            let mut uncovered = false;
            if let Some(idx) = self.reply_cmd {
                let cmd = &mut self.cmds_in_flight[idx];
                if cmd.typ == Cmd::READ
                    && cmd.error == 0
                    && cmd.count > 0
                    && !cmd.range_covered()
                {
                    cmd.set_error(Errno::EPROTO as i32);
                    uncovered = true;
                }
            }
            if uncovered {
                self.debug_msg("structured read did not cover the whole range");
            }
            self.state = State::Reply(ReplyState::FinishCommand);
        } else {
            self.reply_cmd = None;
            self.state = State::Ready;
        }
        Ok(Flow::Continue)
    }
}
