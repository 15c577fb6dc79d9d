//! Asynchronous command and option APIs.
//!
//! Commands are validated against the strict-mode flags, assigned a
//! cookie, queued, and pushed toward the wire as far as the socket
//! allows without blocking. The caller drives the rest through
//! `aio_notify_read`/`aio_notify_write` and retires completions with
//! `aio_command_completed`.

use crate::callbacks::{
    ChunkCallback, CompletionCallback, ContextCallback, ExtentCallback, ListCallback,
};
use crate::command::Command;
use crate::errors::{Error, Result};
use crate::handle::Handle;
use crate::proto::{Cmd, CmdFlag, OptType, StrictFlags, TransmitFlags, MAX_REQUEST_SIZE};
use crate::state::{IssueState, NewstyleState, OptState, State};

impl Handle {
    fn validate_command(&self, typ: Cmd, offset: u64, count: u32, flags: CmdFlag) -> Result<()> {
        if !self.state.in_transmission() {
            return Err(Error::not_connected("not in the transmission phase"));
        }
        let eflags = self.eflags.unwrap_or_else(TransmitFlags::empty);

        if self.strict.contains(StrictFlags::ZERO_SIZE) && count == 0 && typ != Cmd::FLUSH {
            return Err(Error::invalid("zero-length request"));
        }
        if self.strict.contains(StrictFlags::PAYLOAD) && count as usize > MAX_REQUEST_SIZE {
            return Err(Error::invalid("request length exceeds maximum payload size"));
        }
        if self.strict.contains(StrictFlags::BOUNDS) {
            if let Some(size) = self.export_size {
                if offset
                    .checked_add(count as u64)
                    .map_or(true, |end| end > size)
                {
                    return Err(Error::invalid("request extends beyond the end of the export"));
                }
            }
        }
        if self.strict.contains(StrictFlags::COMMANDS) {
            let writes = matches!(typ, Cmd::WRITE | Cmd::TRIM | Cmd::WRITE_ZEROES);
            if writes && eflags.contains(TransmitFlags::READ_ONLY) {
                return Err(Error::unsupported("export is read-only"));
            }
            let missing = match typ {
                Cmd::FLUSH if !eflags.contains(TransmitFlags::SEND_FLUSH) => true,
                Cmd::TRIM if !eflags.contains(TransmitFlags::SEND_TRIM) => true,
                Cmd::CACHE if !eflags.contains(TransmitFlags::SEND_CACHE) => true,
                Cmd::WRITE_ZEROES if !eflags.contains(TransmitFlags::SEND_WRITE_ZEROES) => true,
                _ => false,
            };
            if missing {
                return Err(Error::unsupported(format!(
                    "server does not support {typ:?} commands"
                )));
            }
            if typ == Cmd::BLOCK_STATUS && self.meta_contexts.is_empty() {
                return Err(Error::unsupported("no metadata contexts were negotiated"));
            }
        }
        if self.strict.contains(StrictFlags::FLAGS) {
            if !typ.valid_flags().contains(flags) {
                return Err(Error::invalid(format!(
                    "flags {flags:?} are not valid for {typ:?}"
                )));
            }
            if flags.contains(CmdFlag::FUA) && !eflags.contains(TransmitFlags::SEND_FUA) {
                return Err(Error::unsupported("server does not support FUA"));
            }
            if flags.contains(CmdFlag::DF)
                && !(self.structured_replies && eflags.contains(TransmitFlags::SEND_DF))
            {
                return Err(Error::unsupported(
                    "server does not support the don't-fragment flag",
                ));
            }
            if flags.contains(CmdFlag::FAST_ZERO)
                && !eflags.contains(TransmitFlags::SEND_FAST_ZERO)
            {
                return Err(Error::unsupported("server does not support fast zeroing"));
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn queue_command(
        &mut self,
        typ: Cmd,
        offset: u64,
        count: u32,
        buf: Vec<u8>,
        completion: Option<CompletionCallback>,
        chunk: Option<ChunkCallback>,
        extent: Option<ExtentCallback>,
        flags: CmdFlag,
    ) -> Result<u64> {
        self.validate_command(typ, offset, count, flags)
            .map_err(Error::record)?;
        let cookie = self.alloc_cookie();
        let mut cmd = Command::new(cookie, typ, offset, count, buf);
        cmd.flags = flags;
        cmd.completion = completion;
        cmd.chunk = chunk;
        cmd.extent = extent;
        self.debug_msg(&format!(
            "queuing {typ:?} cookie {cookie} offset {offset} count {count}"
        ));
        self.cmds_to_issue.push_back(cmd);
        // push bytes out right away if the engine is idle
        if matches!(self.state, State::Ready) {
            self.state = State::Issue(IssueState::Start);
            self.run()?;
        }
        Ok(cookie)
    }

    fn checked_len(buf: &[u8]) -> Result<u32> {
        u32::try_from(buf.len()).map_err(|_| Error::invalid("buffer too large for one request").record())
    }

    /// Queue a read of `buf.len()` bytes at `offset`. The buffer is owned
    /// by the command until completion.
    pub fn aio_pread(
        &mut self,
        buf: Vec<u8>,
        offset: u64,
        completion: Option<CompletionCallback>,
        flags: CmdFlag,
    ) -> Result<u64> {
        let count = Self::checked_len(&buf)?;
        self.queue_command(Cmd::READ, offset, count, buf, completion, None, None, flags)
    }

    /// Queue a read delivered through `chunk`, one callback per reply
    /// chunk (data, hole or error).
    pub fn aio_pread_structured(
        &mut self,
        buf: Vec<u8>,
        offset: u64,
        chunk: ChunkCallback,
        completion: Option<CompletionCallback>,
        flags: CmdFlag,
    ) -> Result<u64> {
        let count = Self::checked_len(&buf)?;
        self.queue_command(
            Cmd::READ,
            offset,
            count,
            buf,
            completion,
            Some(chunk),
            None,
            flags,
        )
    }

    /// Queue a write of `buf` at `offset`.
    pub fn aio_pwrite(
        &mut self,
        buf: Vec<u8>,
        offset: u64,
        completion: Option<CompletionCallback>,
        flags: CmdFlag,
    ) -> Result<u64> {
        let count = Self::checked_len(&buf)?;
        self.queue_command(Cmd::WRITE, offset, count, buf, completion, None, None, flags)
    }

    pub fn aio_flush(&mut self, completion: Option<CompletionCallback>) -> Result<u64> {
        self.queue_command(
            Cmd::FLUSH,
            0,
            0,
            Vec::new(),
            completion,
            None,
            None,
            CmdFlag::empty(),
        )
    }

    pub fn aio_trim(
        &mut self,
        count: u32,
        offset: u64,
        completion: Option<CompletionCallback>,
        flags: CmdFlag,
    ) -> Result<u64> {
        self.queue_command(Cmd::TRIM, offset, count, Vec::new(), completion, None, None, flags)
    }

    pub fn aio_cache(
        &mut self,
        count: u32,
        offset: u64,
        completion: Option<CompletionCallback>,
    ) -> Result<u64> {
        self.queue_command(
            Cmd::CACHE,
            offset,
            count,
            Vec::new(),
            completion,
            None,
            None,
            CmdFlag::empty(),
        )
    }

    pub fn aio_zero(
        &mut self,
        count: u32,
        offset: u64,
        completion: Option<CompletionCallback>,
        flags: CmdFlag,
    ) -> Result<u64> {
        self.queue_command(
            Cmd::WRITE_ZEROES,
            offset,
            count,
            Vec::new(),
            completion,
            None,
            None,
            flags,
        )
    }

    /// Queue a block-status query; `extent` is invoked once per metadata
    /// context in the reply.
    pub fn aio_block_status(
        &mut self,
        count: u32,
        offset: u64,
        extent: ExtentCallback,
        completion: Option<CompletionCallback>,
        flags: CmdFlag,
    ) -> Result<u64> {
        self.queue_command(
            Cmd::BLOCK_STATUS,
            offset,
            count,
            Vec::new(),
            completion,
            None,
            Some(extent),
            flags,
        )
    }

    // ---- completion and retirement ----

    /// Cookie of the first completed-but-unretired command, if any.
    pub fn aio_peek_command_completed(&self) -> Option<u64> {
        self.cmds_done.front().map(|c| c.cookie)
    }

    /// Retire the completed command `cookie`. `Ok(false)` if it has not
    /// completed yet; an error carries the command's failure.
    pub fn aio_command_completed(&mut self, cookie: u64) -> Result<bool> {
        if cookie == 0 || cookie >= self.next_cookie {
            return Err(Error::invalid("unknown cookie").record());
        }
        if let Some(pos) = self.cmds_done.iter().position(|c| c.cookie == cookie) {
            let cmd = match self.cmds_done.remove(pos) {
                Some(cmd) => cmd,
                None => return Err(Error::invalid("unknown cookie").record()),
            };
            if cmd.error == 0 {
                return Ok(true);
            }
            let what = format!("{:?}", cmd.typ).to_lowercase();
            return Err(Error::from_command_errno(cmd.error, &what).record());
        }
        let pending = self
            .cmds_to_issue
            .iter()
            .chain(self.cmds_in_flight.iter())
            .any(|c| c.cookie == cookie);
        if pending {
            Ok(false)
        } else {
            // completed and already retired, or never issued
            Err(Error::invalid("cookie is not outstanding").record())
        }
    }

    /// Remove a completed command, with its buffer, for the synchronous
    /// façade.
    pub(crate) fn take_done(&mut self, cookie: u64) -> Option<Command> {
        let pos = self.cmds_done.iter().position(|c| c.cookie == cookie)?;
        self.cmds_done.remove(pos)
    }

    // ---- option-mode entry points ----

    fn begin_option_run(
        &mut self,
        opt: OptType,
        completion: Option<CompletionCallback>,
        entry: NewstyleState,
    ) -> Result<()> {
        if !matches!(self.state, State::Negotiating) {
            return Err(Error::invalid("not in option negotiation mode").record());
        }
        self.opt_current = Some(opt);
        self.opt_cb.completion = completion;
        self.state = State::Newstyle(entry);
        self.run()
    }

    /// Select the configured export and move to the transmission phase.
    pub fn aio_opt_go(&mut self, completion: Option<CompletionCallback>) -> Result<()> {
        self.begin_option_run(OptType::GO, completion, NewstyleState::OptGo(OptState::Start))
    }

    /// Probe the configured export without selecting it.
    pub fn aio_opt_info(&mut self, completion: Option<CompletionCallback>) -> Result<()> {
        self.begin_option_run(
            OptType::INFO,
            completion,
            NewstyleState::OptGo(OptState::Start),
        )
    }

    /// Abandon negotiation and close the connection cleanly.
    pub fn aio_opt_abort(&mut self) -> Result<()> {
        if !matches!(self.state, State::Negotiating) {
            return Err(Error::invalid("not in option negotiation mode").record());
        }
        self.state = State::Newstyle(NewstyleState::PrepareOptAbort);
        self.run()
    }

    /// List the server's exports through `list`.
    pub fn aio_opt_list(
        &mut self,
        list: ListCallback,
        completion: Option<CompletionCallback>,
    ) -> Result<()> {
        if !matches!(self.state, State::Negotiating) {
            return Err(Error::invalid("not in option negotiation mode").record());
        }
        self.opt_cb.list = Some(list);
        self.begin_option_run(
            OptType::LIST,
            completion,
            NewstyleState::OptList(OptState::Start),
        )
    }

    /// Request a TLS upgrade now.
    pub fn aio_opt_starttls(&mut self, completion: Option<CompletionCallback>) -> Result<()> {
        self.begin_option_run(
            OptType::STARTTLS,
            completion,
            NewstyleState::OptStartTls(OptState::Start),
        )
    }

    /// Request structured replies now.
    pub fn aio_opt_structured_reply(
        &mut self,
        completion: Option<CompletionCallback>,
    ) -> Result<()> {
        self.begin_option_run(
            OptType::STRUCTURED_REPLY,
            completion,
            NewstyleState::OptStructuredReply(OptState::Start),
        )
    }

    /// Negotiate the handle's configured metadata contexts; `context` is
    /// invoked once per context the server accepts.
    pub fn aio_opt_set_meta_context(
        &mut self,
        context: ContextCallback,
        completion: Option<CompletionCallback>,
    ) -> Result<()> {
        if !matches!(self.state, State::Negotiating) {
            return Err(Error::invalid("not in option negotiation mode").record());
        }
        self.opt_cb.context = Some(context);
        self.opt_queries = None;
        self.begin_option_run(
            OptType::SET_META_CONTEXT,
            completion,
            NewstyleState::OptMetaContext(OptState::Start),
        )
    }

    /// Negotiate an explicit list of metadata context queries.
    pub fn aio_opt_set_meta_context_queries(
        &mut self,
        queries: Vec<String>,
        context: ContextCallback,
        completion: Option<CompletionCallback>,
    ) -> Result<()> {
        if !matches!(self.state, State::Negotiating) {
            return Err(Error::invalid("not in option negotiation mode").record());
        }
        self.opt_cb.context = Some(context);
        self.opt_queries = Some(queries);
        self.begin_option_run(
            OptType::SET_META_CONTEXT,
            completion,
            NewstyleState::OptMetaContext(OptState::Start),
        )
    }

    /// Ask which metadata contexts the server can serve for the given
    /// queries (an empty list asks for all of them).
    pub fn aio_opt_list_meta_context_queries(
        &mut self,
        queries: Vec<String>,
        context: ContextCallback,
        completion: Option<CompletionCallback>,
    ) -> Result<()> {
        if !matches!(self.state, State::Negotiating) {
            return Err(Error::invalid("not in option negotiation mode").record());
        }
        self.opt_cb.context = Some(context);
        self.opt_queries = Some(queries);
        self.begin_option_run(
            OptType::LIST_META_CONTEXT,
            completion,
            NewstyleState::OptMetaContext(OptState::Start),
        )
    }
}
