//! Handshake state handlers: MAGIC, OLDSTYLE and the NEWSTYLE option
//! loop.
//!
//! Every handler is a pure function of the handle: it inspects the bytes
//! staged so far, advances the state, and reports whether the engine can
//! keep running or must wait for socket readiness.

use byteorder::{ByteOrder, BE};
use nix::errno::Errno;

use crate::errors::{Error, ErrorKind, Result};
use crate::handle::{Flow, Handle, RecvProgress, RecvTarget, TlsMode};
use crate::proto::{
    ClientHandshakeFlags, HandshakeFlags, InfoType, OptType, ReplyType, TransmitFlags, IHAVEOPT,
    MAGIC, MAX_STRING, OLD_VERSION, OPTION_REPLY_SIZE, REPLY_MAGIC,
};
use crate::state::{MagicState, NewstyleState, OldstyleState, OptState, State};
use crate::tls::{self, HandshakeProgress};
use crate::transport::Conn;

/// Informational option payloads larger than this are skipped rather than
/// stored.
const MAX_OPTION_PAYLOAD: usize = 2 * MAX_STRING + 16;

impl Handle {
    // ---- MAGIC ----

    pub(crate) fn step_magic(&mut self, s: MagicState) -> Result<Flow> {
        match s {
            MagicState::Start => {
                self.begin_recv_sbuf(16);
                self.state = State::Magic(MagicState::RecvMagic);
                Ok(Flow::Continue)
            }
            MagicState::RecvMagic => match self.recv_into_rbuf()? {
                RecvProgress::Done => {
                    self.state = State::Magic(MagicState::CheckMagic);
                    Ok(Flow::Continue)
                }
                RecvProgress::Again => Ok(Flow::Block),
                RecvProgress::Eof => {
                    Err(Error::protocol("handshake: unexpected end of stream"))
                }
            },
            MagicState::CheckMagic => {
                if BE::read_u64(&self.sbuf[0..8]) != MAGIC {
                    return Err(Error::protocol(
                        "handshake: server did not send expected NBD magic",
                    ));
                }
                let version = BE::read_u64(&self.sbuf[8..16]);
                self.state = if version == IHAVEOPT {
                    State::Newstyle(NewstyleState::Start)
                } else if version == OLD_VERSION {
                    State::Oldstyle(OldstyleState::Start)
                } else {
                    return Err(Error::protocol(
                        "handshake: server is not an oldstyle or fixed newstyle NBD server",
                    ));
                };
                Ok(Flow::Continue)
            }
        }
    }

    // ---- OLDSTYLE ----

    pub(crate) fn step_oldstyle(&mut self, s: OldstyleState) -> Result<Flow> {
        match s {
            OldstyleState::Start => {
                // the 16 magic bytes are already consumed; the rest is
                // size (8), flags (4) and 124 reserved zero bytes
                self.begin_recv_sbuf(8 + 4 + 124);
                self.state = State::Oldstyle(OldstyleState::RecvRemaining);
                Ok(Flow::Continue)
            }
            OldstyleState::RecvRemaining => match self.recv_into_rbuf()? {
                RecvProgress::Done => {
                    self.state = State::Oldstyle(OldstyleState::Check);
                    Ok(Flow::Continue)
                }
                RecvProgress::Again => Ok(Flow::Block),
                RecvProgress::Eof => {
                    Err(Error::protocol("handshake: unexpected end of stream"))
                }
            },
            OldstyleState::Check => {
                let size = BE::read_u64(&self.sbuf[0..8]);
                let flags = BE::read_u32(&self.sbuf[8..12]);
                // an oldstyle server cannot upgrade to TLS
                if self.tls == TlsMode::Require {
                    return Err(Error::new(
                        ErrorKind::TlsRequired,
                        "handshake: server is oldstyle, but TLS is required",
                    ));
                }
                let gflags = (flags >> 16) as u16;
                if gflags != 0 {
                    return Err(Error::protocol(
                        "handshake: oldstyle server should not set handshake flags",
                    ));
                }
                self.set_size_and_flags(size, flags as u16);
                self.got_export_info = true;
                self.protocol = Some("oldstyle");
                self.state = State::Ready;
                Ok(Flow::Continue)
            }
        }
    }

    // ---- NEWSTYLE greeting ----

    pub(crate) fn step_newstyle(&mut self, s: NewstyleState) -> Result<Flow> {
        match s {
            NewstyleState::Start => {
                self.begin_recv_sbuf(2);
                self.state = State::Newstyle(NewstyleState::RecvGflags);
                Ok(Flow::Continue)
            }
            NewstyleState::RecvGflags => match self.recv_into_rbuf()? {
                RecvProgress::Done => {
                    self.state = State::Newstyle(NewstyleState::CheckGflags);
                    Ok(Flow::Continue)
                }
                RecvProgress::Again => Ok(Flow::Block),
                RecvProgress::Eof => {
                    Err(Error::protocol("handshake: unexpected end of stream"))
                }
            },
            NewstyleState::CheckGflags => {
                let raw = BE::read_u16(&self.sbuf[0..2]);
                self.debug_msg(&format!("gflags: {raw:#x}"));
                self.gflags = HandshakeFlags::from_bits_truncate(raw);
                self.fixed_newstyle = self.gflags.contains(HandshakeFlags::FIXED_NEWSTYLE);
                self.no_zeroes = self.gflags.contains(HandshakeFlags::NO_ZEROES);
                let mut cflags = ClientHandshakeFlags::empty();
                if self.fixed_newstyle {
                    cflags |= ClientHandshakeFlags::C_FIXED_NEWSTYLE;
                }
                if self.no_zeroes {
                    cflags |= ClientHandshakeFlags::C_NO_ZEROES;
                }
                self.sbuf.clear();
                self.sbuf.extend_from_slice(&cflags.bits().to_be_bytes());
                self.begin_send_sbuf(false);
                self.state = State::Newstyle(NewstyleState::SendCflags);
                Ok(Flow::Continue)
            }
            NewstyleState::SendCflags => {
                if !self.send_from_wbuf()? {
                    return Ok(Flow::Block);
                }
                self.protocol = Some(if self.fixed_newstyle {
                    "newstyle-fixed"
                } else {
                    "newstyle"
                });
                if !self.fixed_newstyle {
                    // no options possible beyond selecting the export
                    if self.tls == TlsMode::Require {
                        return Err(Error::new(
                            ErrorKind::TlsRequired,
                            "handshake: server is not fixed newstyle, cannot negotiate TLS",
                        ));
                    }
                    self.state = State::Newstyle(NewstyleState::OptExportName(OptState::Start));
                    return Ok(Flow::Continue);
                }
                if self.opt_mode {
                    self.state = State::Negotiating;
                    return Ok(Flow::Block);
                }
                self.state = State::Newstyle(NewstyleState::OptStartTls(OptState::Start));
                Ok(Flow::Continue)
            }

            NewstyleState::OptStartTls(o) => self.step_opt_starttls(o),
            NewstyleState::TlsHandshakeRead | NewstyleState::TlsHandshakeWrite => {
                self.step_tls_handshake()
            }
            NewstyleState::TlsHandshakeDone => self.step_tls_handshake_done(),
            NewstyleState::OptStructuredReply(o) => self.step_opt_structured_reply(o),
            NewstyleState::OptMetaContext(o) => self.step_opt_meta_context(o),
            NewstyleState::OptGo(o) => self.step_opt_go(o),
            NewstyleState::OptExportName(o) => self.step_opt_export_name(o),
            NewstyleState::OptList(o) => self.step_opt_list(o),
            NewstyleState::PrepareOptAbort => {
                self.begin_option(OptType::ABORT, &[]);
                self.state = State::Newstyle(NewstyleState::OptAbort(OptState::Send));
                Ok(Flow::Continue)
            }
            NewstyleState::OptAbort(_) => {
                if !self.send_from_wbuf()? {
                    return Ok(Flow::Block);
                }
                // the server may close abruptly after an abort; don't wait
                // for its acknowledgement
                self.enter_closed();
                match self.deferred_error.take() {
                    Some(e) => Err(e),
                    None => Ok(Flow::Block),
                }
            }
            NewstyleState::Finished => {
                self.state = State::Ready;
                Ok(Flow::Continue)
            }
        }
    }

    // ---- option plumbing shared by every option ----

    /// Stage an option request frame for sending.
    pub(crate) fn begin_option(&mut self, opt: OptType, payload: &[u8]) {
        self.sbuf.clear();
        self.sbuf.extend_from_slice(&IHAVEOPT.to_be_bytes());
        self.sbuf.extend_from_slice(&u32::from(opt).to_be_bytes());
        self.sbuf
            .extend_from_slice(&(payload.len() as u32).to_be_bytes());
        self.sbuf.extend_from_slice(payload);
        self.begin_send_sbuf(false);
    }

    /// Validate the option reply header in the staging buffer and arrange
    /// to receive its payload.
    fn prepare_option_payload(&mut self, expected: OptType) -> Result<()> {
        if BE::read_u64(&self.sbuf[0..8]) != REPLY_MAGIC
            || BE::read_u32(&self.sbuf[8..12]) != u32::from(expected)
        {
            return Err(Error::protocol(
                "handshake: invalid option reply magic or option",
            ));
        }
        self.or_reply = BE::read_u32(&self.sbuf[12..16]);
        self.or_len = BE::read_u32(&self.sbuf[16..20]);
        let len = self.or_len as usize;
        if ReplyType::is_error(self.or_reply) {
            if len > MAX_STRING {
                return Err(Error::protocol("handshake: option error message too long"));
            }
            self.begin_recv_sbuf(len);
        } else if self.or_reply == u32::from(ReplyType::ACK) && len != 0 {
            return Err(Error::protocol("handshake: unexpected payload after ACK"));
        } else if len <= MAX_OPTION_PAYLOAD {
            self.begin_recv_sbuf(len);
        } else {
            self.debug_msg(&format!("skipping oversized option reply ({len} bytes)"));
            self.begin_recv_discard(len);
        }
        Ok(())
    }

    fn option_payload_skipped(&self) -> bool {
        matches!(self.rtarget, RecvTarget::Discard)
    }

    /// The error message carried by an error reply, if we kept it.
    fn option_error_message(&self) -> String {
        if self.option_payload_skipped() {
            return String::new();
        }
        String::from_utf8_lossy(&self.sbuf[..self.or_len as usize]).into_owned()
    }

    /// errno equivalent for an option error reply.
    fn option_errno(reply: u32) -> i32 {
        match ReplyType::try_from(reply) {
            Ok(ReplyType::ERR_UNSUP)
            | Ok(ReplyType::ERR_POLICY)
            | Ok(ReplyType::ERR_PLATFORM)
            | Ok(ReplyType::ERR_TLS_REQD) => Errno::ENOTSUP as i32,
            Ok(ReplyType::ERR_INVALID)
            | Ok(ReplyType::ERR_TOO_BIG)
            | Ok(ReplyType::ERR_BLOCK_SIZE_REQD) => Errno::EINVAL as i32,
            Ok(ReplyType::ERR_UNKNOWN) => Errno::ENOENT as i32,
            Ok(ReplyType::ERR_SHUTDOWN) => Errno::ESHUTDOWN as i32,
            _ => Errno::EPROTO as i32,
        }
    }

    /// A handshake receive helper: Done advances to `next`, EOF is fatal.
    fn opt_recv(&mut self, next: NewstyleState) -> Result<Flow> {
        match self.recv_into_rbuf()? {
            RecvProgress::Done => {
                self.state = State::Newstyle(next);
                Ok(Flow::Continue)
            }
            RecvProgress::Again => Ok(Flow::Block),
            RecvProgress::Eof => Err(Error::protocol("handshake: unexpected end of stream")),
        }
    }

    /// A handshake send helper: done advances to `next`.
    fn opt_send(&mut self, next: NewstyleState) -> Result<Flow> {
        if self.send_from_wbuf()? {
            self.state = State::Newstyle(next);
            Ok(Flow::Continue)
        } else {
            Ok(Flow::Block)
        }
    }

    /// Finish an option invoked from option mode: deliver its completion
    /// and park the handle back in Negotiating.
    fn option_completed(&mut self, err: i32) -> Flow {
        self.opt_current = None;
        self.opt_queries = None;
        self.opt_cb.complete(err);
        self.state = State::Negotiating;
        Flow::Block
    }

    // ---- STARTTLS ----

    fn step_opt_starttls(&mut self, o: OptState) -> Result<Flow> {
        use NewstyleState::OptStartTls as S;
        match o {
            OptState::Start => {
                if self.opt_current != Some(OptType::STARTTLS) && self.tls == TlsMode::Disable {
                    // TLS not requested; next option
                    self.state =
                        State::Newstyle(NewstyleState::OptStructuredReply(OptState::Start));
                    return Ok(Flow::Continue);
                }
                self.begin_option(OptType::STARTTLS, &[]);
                self.state = State::Newstyle(S(OptState::Send));
                Ok(Flow::Continue)
            }
            OptState::Send => {
                let flow = self.opt_send(S(OptState::RecvReply))?;
                if flow == Flow::Continue {
                    self.begin_recv_sbuf(OPTION_REPLY_SIZE);
                }
                Ok(flow)
            }
            OptState::RecvReply => {
                let flow = self.opt_recv(S(OptState::RecvReplyPayload))?;
                if flow == Flow::Continue {
                    self.prepare_option_payload(OptType::STARTTLS)?;
                }
                Ok(flow)
            }
            OptState::RecvReplyPayload => self.opt_recv(S(OptState::CheckReply)),
            OptState::CheckReply => {
                if self.or_reply == u32::from(ReplyType::ACK) {
                    if self.tls_negotiated {
                        return Err(Error::with_errno(
                            ErrorKind::Protocol,
                            Errno::EPROTO as i32,
                            "handshake: unable to support server accepting TLS twice",
                        ));
                    }
                    // everything negotiated so far is void once the
                    // session restarts under TLS
                    self.reset_size_and_flags();
                    self.structured_replies = false;
                    self.meta_contexts.clear();
                    let plain = match self.conn.take() {
                        Some(Conn::Plain(p)) => p,
                        other => {
                            self.conn = other;
                            return Err(Error::protocol("handshake: TLS already layered"));
                        }
                    };
                    let session = tls::create_session(&self.tls_settings, plain)?;
                    let reading = session.handshake_is_reading();
                    self.conn = Some(Conn::Tls(session));
                    self.state = State::Newstyle(if reading {
                        NewstyleState::TlsHandshakeRead
                    } else {
                        NewstyleState::TlsHandshakeWrite
                    });
                    return Ok(Flow::Continue);
                }
                // refusal
                let errno = Self::option_errno(self.or_reply);
                let msg = self.option_error_message();
                self.debug_msg(&format!("server refused TLS ({msg})"));
                if self.opt_current == Some(OptType::STARTTLS) {
                    return Ok(self.option_completed(errno));
                }
                if self.tls == TlsMode::Require {
                    self.deferred_error = Some(Error::new(
                        ErrorKind::TlsRefused,
                        "handshake: server refused TLS, but TLS is required",
                    ));
                    self.state = State::Newstyle(NewstyleState::PrepareOptAbort);
                    return Ok(Flow::Continue);
                }
                self.debug_msg("continuing with unencrypted connection");
                self.state = State::Newstyle(NewstyleState::OptStructuredReply(OptState::Start));
                Ok(Flow::Continue)
            }
        }
    }

    fn step_tls_handshake(&mut self) -> Result<Flow> {
        let session = match self.conn.as_mut() {
            Some(Conn::Tls(t)) => t,
            _ => return Err(Error::protocol("TLS session disappeared mid-handshake")),
        };
        let progress = session
            .handshake_step()
            .map_err(|e| Error::io(e, "TLS handshake"))?;
        match progress {
            HandshakeProgress::Done => {
                self.state = State::Newstyle(NewstyleState::TlsHandshakeDone);
                Ok(Flow::Continue)
            }
            HandshakeProgress::Again | HandshakeProgress::Blocked => {
                let reading = match self.conn.as_ref() {
                    Some(Conn::Tls(t)) => t.handshake_is_reading(),
                    _ => false,
                };
                self.state = State::Newstyle(if reading {
                    NewstyleState::TlsHandshakeRead
                } else {
                    NewstyleState::TlsHandshakeWrite
                });
                Ok(if progress == HandshakeProgress::Again {
                    Flow::Continue
                } else {
                    Flow::Block
                })
            }
        }
    }

    fn step_tls_handshake_done(&mut self) -> Result<Flow> {
        self.tls_negotiated = true;
        self.debug_msg("TLS negotiated");
        if self.opt_current == Some(OptType::STARTTLS) {
            return Ok(self.option_completed(0));
        }
        self.state = State::Newstyle(NewstyleState::OptStructuredReply(OptState::Start));
        Ok(Flow::Continue)
    }

    // ---- STRUCTURED_REPLY ----

    fn step_opt_structured_reply(&mut self, o: OptState) -> Result<Flow> {
        use NewstyleState::OptStructuredReply as S;
        match o {
            OptState::Start => {
                if self.opt_current != Some(OptType::STRUCTURED_REPLY) && !self.request_sr {
                    self.state = State::Newstyle(NewstyleState::OptMetaContext(OptState::Start));
                    return Ok(Flow::Continue);
                }
                self.begin_option(OptType::STRUCTURED_REPLY, &[]);
                self.state = State::Newstyle(S(OptState::Send));
                Ok(Flow::Continue)
            }
            OptState::Send => {
                let flow = self.opt_send(S(OptState::RecvReply))?;
                if flow == Flow::Continue {
                    self.begin_recv_sbuf(OPTION_REPLY_SIZE);
                }
                Ok(flow)
            }
            OptState::RecvReply => {
                let flow = self.opt_recv(S(OptState::RecvReplyPayload))?;
                if flow == Flow::Continue {
                    self.prepare_option_payload(OptType::STRUCTURED_REPLY)?;
                }
                Ok(flow)
            }
            OptState::RecvReplyPayload => self.opt_recv(S(OptState::CheckReply)),
            OptState::CheckReply => {
                let err;
                if self.or_reply == u32::from(ReplyType::ACK) {
                    self.debug_msg("negotiated structured replies on this connection");
                    self.structured_replies = true;
                    err = 0;
                } else {
                    self.debug_msg("structured replies are not supported by this server");
                    self.structured_replies = false;
                    err = Self::option_errno(self.or_reply);
                }
                if self.opt_current == Some(OptType::STRUCTURED_REPLY) {
                    return Ok(self.option_completed(err));
                }
                self.state = State::Newstyle(NewstyleState::OptMetaContext(OptState::Start));
                Ok(Flow::Continue)
            }
        }
    }

    // ---- SET/LIST_META_CONTEXT ----

    fn meta_opcode(&self) -> OptType {
        match self.opt_current {
            Some(OptType::LIST_META_CONTEXT) => OptType::LIST_META_CONTEXT,
            _ => OptType::SET_META_CONTEXT,
        }
    }

    fn step_opt_meta_context(&mut self, o: OptState) -> Result<Flow> {
        use NewstyleState::OptMetaContext as S;
        match o {
            OptState::Start => {
                let in_opt_mode = matches!(
                    self.opt_current,
                    Some(OptType::SET_META_CONTEXT) | Some(OptType::LIST_META_CONTEXT)
                );
                if !in_opt_mode
                    && (!self.structured_replies
                        || !self.request_meta
                        || self.meta_queries.is_empty())
                {
                    self.state = State::Newstyle(NewstyleState::OptGo(OptState::Start));
                    return Ok(Flow::Continue);
                }
                let opcode = self.meta_opcode();
                let queries = self
                    .opt_queries
                    .take()
                    .unwrap_or_else(|| self.meta_queries.clone());
                if opcode == OptType::SET_META_CONTEXT {
                    // ids only become valid as the replies come in
                    self.meta_contexts.clear();
                }
                let mut payload = Vec::new();
                payload.extend_from_slice(&(self.export_name.len() as u32).to_be_bytes());
                payload.extend_from_slice(self.export_name.as_bytes());
                payload.extend_from_slice(&(queries.len() as u32).to_be_bytes());
                for q in &queries {
                    payload.extend_from_slice(&(q.len() as u32).to_be_bytes());
                    payload.extend_from_slice(q.as_bytes());
                }
                self.begin_option(opcode, &payload);
                self.state = State::Newstyle(S(OptState::Send));
                Ok(Flow::Continue)
            }
            OptState::Send => {
                let flow = self.opt_send(S(OptState::RecvReply))?;
                if flow == Flow::Continue {
                    self.begin_recv_sbuf(OPTION_REPLY_SIZE);
                }
                Ok(flow)
            }
            OptState::RecvReply => {
                let flow = self.opt_recv(S(OptState::RecvReplyPayload))?;
                if flow == Flow::Continue {
                    let opcode = self.meta_opcode();
                    self.prepare_option_payload(opcode)?;
                }
                Ok(flow)
            }
            OptState::RecvReplyPayload => self.opt_recv(S(OptState::CheckReply)),
            OptState::CheckReply => {
                let in_opt_mode = matches!(
                    self.opt_current,
                    Some(OptType::SET_META_CONTEXT) | Some(OptType::LIST_META_CONTEXT)
                );
                if self.or_reply == u32::from(ReplyType::META_CONTEXT) {
                    if !self.option_payload_skipped() {
                        let len = self.or_len as usize;
                        if len < 4 {
                            return Err(Error::protocol(
                                "handshake: metadata context reply too short",
                            ));
                        }
                        let id = BE::read_u32(&self.sbuf[0..4]);
                        let name = String::from_utf8_lossy(&self.sbuf[4..len]).into_owned();
                        self.debug_msg(&format!("negotiated {name} with context ID {id}"));
                        if self.meta_opcode() == OptType::SET_META_CONTEXT {
                            self.meta_contexts.push((name.clone(), id));
                        }
                        if let Some(cb) = self.opt_cb.context.as_mut() {
                            cb(&name);
                        }
                    }
                    // more contexts may follow
                    self.begin_recv_sbuf(OPTION_REPLY_SIZE);
                    self.state = State::Newstyle(S(OptState::RecvReply));
                    return Ok(Flow::Continue);
                }
                if self.or_reply == u32::from(ReplyType::ACK) {
                    if in_opt_mode {
                        return Ok(self.option_completed(0));
                    }
                    self.state = State::Newstyle(NewstyleState::OptGo(OptState::Start));
                    return Ok(Flow::Continue);
                }
                let errno = Self::option_errno(self.or_reply);
                let msg = self.option_error_message();
                self.debug_msg(&format!("server refused metadata contexts ({msg})"));
                if in_opt_mode {
                    return Ok(self.option_completed(errno));
                }
                // nonfatal during connect; block status just stays
                // unavailable
                self.state = State::Newstyle(NewstyleState::OptGo(OptState::Start));
                Ok(Flow::Continue)
            }
        }
    }

    // ---- GO / INFO ----

    fn go_opcode(&self) -> OptType {
        match self.opt_current {
            Some(OptType::INFO) => OptType::INFO,
            _ => OptType::GO,
        }
    }

    fn go_error(&self, reply: u32, msg: String) -> Error {
        let detail = if msg.is_empty() {
            String::new()
        } else {
            format!(": {msg}")
        };
        match ReplyType::try_from(reply) {
            Ok(ReplyType::ERR_POLICY) | Ok(ReplyType::ERR_PLATFORM) => Error::unsupported(
                format!("handshake: server policy prevents choosing this export{detail}"),
            ),
            Ok(ReplyType::ERR_INVALID) | Ok(ReplyType::ERR_TOO_BIG) => {
                Error::invalid(format!("handshake: server rejected the request{detail}"))
            }
            Ok(ReplyType::ERR_TLS_REQD) => Error::new(
                ErrorKind::TlsRequired,
                format!("handshake: server requires TLS encryption first{detail}"),
            ),
            Ok(ReplyType::ERR_UNKNOWN) => Error::with_errno(
                ErrorKind::Unsupported,
                Errno::ENOENT as i32,
                format!("handshake: server has no export named '{}'", self.export_name),
            ),
            Ok(ReplyType::ERR_SHUTDOWN) => Error::new(
                ErrorKind::Shutdown,
                format!("handshake: server is shutting down{detail}"),
            ),
            Ok(ReplyType::ERR_BLOCK_SIZE_REQD) => Error::invalid(format!(
                "handshake: server requires specific block sizes{detail}"
            )),
            _ => Error::protocol(format!("handshake: unknown reply to GO: {reply:#x}")),
        }
    }

    fn step_opt_go(&mut self, o: OptState) -> Result<Flow> {
        use NewstyleState::OptGo as S;
        match o {
            OptState::Start => {
                let opcode = self.go_opcode();
                self.got_export_info = false;
                let infos: &[InfoType] = if self.full_info {
                    &[InfoType::BLOCK_SIZE, InfoType::NAME, InfoType::DESCRIPTION]
                } else {
                    &[InfoType::BLOCK_SIZE]
                };
                let mut payload = Vec::new();
                payload.extend_from_slice(&(self.export_name.len() as u32).to_be_bytes());
                payload.extend_from_slice(self.export_name.as_bytes());
                payload.extend_from_slice(&(infos.len() as u16).to_be_bytes());
                for info in infos {
                    payload.extend_from_slice(&u16::from(*info).to_be_bytes());
                }
                self.begin_option(opcode, &payload);
                self.state = State::Newstyle(S(OptState::Send));
                Ok(Flow::Continue)
            }
            OptState::Send => {
                let flow = self.opt_send(S(OptState::RecvReply))?;
                if flow == Flow::Continue {
                    self.begin_recv_sbuf(OPTION_REPLY_SIZE);
                }
                Ok(flow)
            }
            OptState::RecvReply => {
                let flow = self.opt_recv(S(OptState::RecvReplyPayload))?;
                if flow == Flow::Continue {
                    let opcode = self.go_opcode();
                    self.prepare_option_payload(opcode)?;
                }
                Ok(flow)
            }
            OptState::RecvReplyPayload => self.opt_recv(S(OptState::CheckReply)),
            OptState::CheckReply => self.check_go_reply(),
        }
    }

    fn check_go_reply(&mut self) -> Result<Flow> {
        use NewstyleState::OptGo as S;
        let opcode = self.go_opcode();
        let in_opt_mode = self.opt_current.is_some();
        if self.or_reply == u32::from(ReplyType::INFO) {
            if !self.option_payload_skipped() {
                self.record_info_payload()?;
            }
            // any number of info replies may precede the ACK
            self.begin_recv_sbuf(OPTION_REPLY_SIZE);
            self.state = State::Newstyle(S(OptState::RecvReply));
            return Ok(Flow::Continue);
        }
        if self.or_reply == u32::from(ReplyType::ACK) {
            if !self.got_export_info {
                return Err(Error::protocol(
                    "handshake: server acknowledged the export without describing it",
                ));
            }
            if opcode == OptType::INFO {
                return Ok(self.option_completed(0));
            }
            if in_opt_mode {
                self.opt_current = None;
                self.opt_queries = None;
                self.opt_cb.complete(0);
            }
            self.state = State::Newstyle(NewstyleState::Finished);
            return Ok(Flow::Continue);
        }
        if self.or_reply == u32::from(ReplyType::ERR_UNSUP) && !in_opt_mode {
            self.debug_msg("server does not support GO, falling back to export name");
            self.state = State::Newstyle(NewstyleState::OptExportName(OptState::Start));
            return Ok(Flow::Continue);
        }
        let errno = Self::option_errno(self.or_reply);
        let msg = self.option_error_message();
        self.reset_size_and_flags();
        if in_opt_mode {
            self.debug_msg(&format!("option failed ({msg})"));
            return Ok(self.option_completed(errno));
        }
        self.deferred_error = Some(self.go_error(self.or_reply, msg));
        self.state = State::Newstyle(NewstyleState::PrepareOptAbort);
        Ok(Flow::Continue)
    }

    fn record_info_payload(&mut self) -> Result<()> {
        let len = self.or_len as usize;
        if len < 2 {
            return Err(Error::protocol("handshake: info reply too short"));
        }
        let info = BE::read_u16(&self.sbuf[0..2]);
        match InfoType::try_from(info) {
            Ok(InfoType::EXPORT) => {
                if len != 12 {
                    return Err(Error::protocol(
                        "handshake: incorrect export info reply length",
                    ));
                }
                let size = BE::read_u64(&self.sbuf[2..10]);
                let eflags = BE::read_u16(&self.sbuf[10..12]);
                if !TransmitFlags::from_bits_truncate(eflags).contains(TransmitFlags::HAS_FLAGS) {
                    return Err(Error::protocol("handshake: invalid export flags from server"));
                }
                self.set_size_and_flags(size, eflags);
                self.got_export_info = true;
            }
            Ok(InfoType::BLOCK_SIZE) => {
                if len != 14 {
                    return Err(Error::protocol(
                        "handshake: incorrect block size reply length",
                    ));
                }
                let min = BE::read_u32(&self.sbuf[2..6]);
                let pref = BE::read_u32(&self.sbuf[6..10]);
                let max = BE::read_u32(&self.sbuf[10..14]);
                self.debug_msg(&format!("block sizes: min {min} preferred {pref} max {max}"));
                self.block_size = Some((min, pref, max));
            }
            Ok(InfoType::NAME) => {
                if len - 2 > MAX_STRING {
                    return Err(Error::protocol("handshake: export name reply too long"));
                }
                self.canonical_name =
                    Some(String::from_utf8_lossy(&self.sbuf[2..len]).into_owned());
            }
            Ok(InfoType::DESCRIPTION) => {
                if len - 2 > MAX_STRING {
                    return Err(Error::protocol("handshake: description reply too long"));
                }
                self.description = Some(String::from_utf8_lossy(&self.sbuf[2..len]).into_owned());
            }
            Err(_) => {
                self.debug_msg(&format!("skipping unknown info reply type {info}"));
            }
        }
        Ok(())
    }

    // ---- EXPORT_NAME (legacy fallback) ----

    fn step_opt_export_name(&mut self, o: OptState) -> Result<Flow> {
        use NewstyleState::OptExportName as S;
        match o {
            OptState::Start => {
                let name = self.export_name.clone();
                self.begin_option(OptType::EXPORT_NAME, name.as_bytes());
                self.state = State::Newstyle(S(OptState::Send));
                Ok(Flow::Continue)
            }
            OptState::Send => {
                if !self.send_from_wbuf()? {
                    return Ok(Flow::Block);
                }
                // the reply is a fixed-format export info block, not an
                // option reply
                let n = 8 + 2 + if self.no_zeroes { 0 } else { 124 };
                self.begin_recv_sbuf(n);
                self.state = State::Newstyle(S(OptState::RecvReply));
                Ok(Flow::Continue)
            }
            OptState::RecvReply => match self.recv_into_rbuf()? {
                RecvProgress::Done => {
                    self.state = State::Newstyle(S(OptState::CheckReply));
                    Ok(Flow::Continue)
                }
                RecvProgress::Again => Ok(Flow::Block),
                RecvProgress::Eof => Err(Error::with_errno(
                    ErrorKind::Unsupported,
                    Errno::ENOENT as i32,
                    format!(
                        "handshake: server closed the connection; export '{}' may not exist",
                        self.export_name
                    ),
                )),
            },
            OptState::RecvReplyPayload => unreachable_state(),
            OptState::CheckReply => {
                let size = BE::read_u64(&self.sbuf[0..8]);
                let eflags = BE::read_u16(&self.sbuf[8..10]);
                if !TransmitFlags::from_bits_truncate(eflags).contains(TransmitFlags::HAS_FLAGS) {
                    return Err(Error::protocol("handshake: invalid export flags from server"));
                }
                self.set_size_and_flags(size, eflags);
                self.got_export_info = true;
                self.state = State::Newstyle(NewstyleState::Finished);
                Ok(Flow::Continue)
            }
        }
    }

    // ---- LIST ----

    fn step_opt_list(&mut self, o: OptState) -> Result<Flow> {
        use NewstyleState::OptList as S;
        match o {
            OptState::Start => {
                self.begin_option(OptType::LIST, &[]);
                self.state = State::Newstyle(S(OptState::Send));
                Ok(Flow::Continue)
            }
            OptState::Send => {
                let flow = self.opt_send(S(OptState::RecvReply))?;
                if flow == Flow::Continue {
                    self.begin_recv_sbuf(OPTION_REPLY_SIZE);
                }
                Ok(flow)
            }
            OptState::RecvReply => {
                let flow = self.opt_recv(S(OptState::RecvReplyPayload))?;
                if flow == Flow::Continue {
                    self.prepare_option_payload(OptType::LIST)?;
                }
                Ok(flow)
            }
            OptState::RecvReplyPayload => self.opt_recv(S(OptState::CheckReply)),
            OptState::CheckReply => {
                if self.or_reply == u32::from(ReplyType::SERVER) {
                    if !self.option_payload_skipped() {
                        let len = self.or_len as usize;
                        if len < 4 {
                            return Err(Error::protocol("handshake: export list reply too short"));
                        }
                        let elen = BE::read_u32(&self.sbuf[0..4]) as usize;
                        if elen > len - 4 || elen > MAX_STRING || len - 4 - elen > MAX_STRING {
                            return Err(Error::protocol("handshake: invalid export name length"));
                        }
                        let name = String::from_utf8_lossy(&self.sbuf[4..4 + elen]).into_owned();
                        let desc =
                            String::from_utf8_lossy(&self.sbuf[4 + elen..len]).into_owned();
                        if let Some(cb) = self.opt_cb.list.as_mut() {
                            cb(&name, &desc);
                        }
                    }
                    // wait for more replies
                    self.begin_recv_sbuf(OPTION_REPLY_SIZE);
                    self.state = State::Newstyle(S(OptState::RecvReply));
                    return Ok(Flow::Continue);
                }
                if self.or_reply == u32::from(ReplyType::ACK) {
                    return Ok(self.option_completed(0));
                }
                let errno = Self::option_errno(self.or_reply);
                self.debug_msg(
                    "unexpected response, possibly the server does not support listing exports",
                );
                Ok(self.option_completed(errno))
            }
        }
    }
}

fn unreachable_state() -> Result<Flow> {
    Err(Error::protocol("impossible handshake state"))
}
