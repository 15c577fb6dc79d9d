//! The handle: the single unit of ownership.
//!
//! A handle exclusively owns one transport, the three command queues, the
//! staging buffer for small protocol frames, the current state, the
//! configuration and negotiated session facts. All of its state
//! transitions run on the thread that calls into it; the engine itself
//! never blocks.

use std::collections::VecDeque;
use std::mem;
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::unix::io::{OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::process::Child;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use nix::errno::Errno;

use crate::callbacks::{DebugCallback, OptionCallbacks};
use crate::command::Command;
use crate::errors::{Error, Result};
use crate::proto::{Cmd, HandshakeFlags, OptType, ShutdownFlags, TransmitFlags, REQUEST_SIZE};
use crate::state::{
    ConnectState, Direction, IssueState, MagicState, ReplyState, State, TcpConnectState,
};
use crate::tls::TlsSettings;
use crate::transport::{self, Conn};

static HANDLE_SEQ: AtomicUsize = AtomicUsize::new(1);

/// Whether to request TLS, and how hard to insist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsMode {
    /// Never upgrade to TLS.
    Disable,
    /// Attempt TLS, fall back to cleartext if the server refuses.
    Allow,
    /// Fail the connection unless TLS is established.
    Require,
}

/// Which negotiated block size limit to query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockSizeKind {
    Minimum,
    Preferred,
    Maximum,
}

/// Where the engine is currently receiving into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RecvTarget {
    /// The staging buffer.
    Sbuf,
    /// A command's data buffer, starting `at` bytes in.
    CommandBuf { idx: usize, at: usize },
    /// Consume and drop (skipping oversized or unwanted payloads).
    Discard,
}

/// Where the engine is currently sending from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SendSource {
    /// The staging buffer (handshake frames).
    Sbuf,
    /// The fixed request-header buffer; kept separate from the staging
    /// buffer because a reply may be decoded while a request header is
    /// still partially sent.
    Request,
    /// The payload of the command at the front of the issue queue.
    Payload,
}

/// Outcome of running one substate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    /// Run the next substate immediately.
    Continue,
    /// Return to the caller; an external event must wake the engine.
    Block,
}

/// Outcome of a partial receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RecvProgress {
    Done,
    Again,
    Eof,
}

/// A client connection to one NBD server.
pub struct Handle {
    pub(crate) state: State,
    pub(crate) conn: Option<Conn>,
    pub(crate) child: Option<Child>,

    // identity and debugging
    pub(crate) name: String,
    pub(crate) debug: bool,
    pub(crate) debug_cb: Option<DebugCallback>,
    private_data: usize,

    // configuration
    pub(crate) export_name: String,
    pub(crate) tls: TlsMode,
    pub(crate) tls_settings: TlsSettings,
    pub(crate) request_sr: bool,
    pub(crate) request_meta: bool,
    pub(crate) meta_queries: Vec<String>,
    pub(crate) opt_mode: bool,
    pub(crate) full_info: bool,
    pub(crate) strict: crate::proto::StrictFlags,
    pub(crate) uri_allow_local_file: bool,
    pub(crate) timeout: Option<Duration>,

    // connection establishment progress
    pub(crate) addrs: Vec<SocketAddr>,
    pub(crate) addr_index: usize,
    pub(crate) connect_errno: i32,
    pub(crate) connect_ready: bool,

    // negotiated session facts
    pub(crate) gflags: HandshakeFlags,
    pub(crate) fixed_newstyle: bool,
    pub(crate) no_zeroes: bool,
    pub(crate) export_size: Option<u64>,
    pub(crate) eflags: Option<TransmitFlags>,
    pub(crate) block_size: Option<(u32, u32, u32)>,
    pub(crate) canonical_name: Option<String>,
    pub(crate) description: Option<String>,
    pub(crate) meta_contexts: Vec<(String, u32)>,
    pub(crate) protocol: Option<&'static str>,
    pub(crate) structured_replies: bool,
    pub(crate) tls_negotiated: bool,

    // option negotiation in progress
    pub(crate) opt_current: Option<OptType>,
    pub(crate) opt_cb: OptionCallbacks,
    pub(crate) opt_queries: Option<Vec<String>>,
    pub(crate) got_export_info: bool,
    pub(crate) deferred_error: Option<Error>,

    // I/O cursors
    pub(crate) sbuf: Vec<u8>,
    pub(crate) request: [u8; REQUEST_SIZE],
    pub(crate) rtarget: RecvTarget,
    pub(crate) rlen: usize,
    pub(crate) rpos: usize,
    pub(crate) wsource: SendSource,
    pub(crate) wlen: usize,
    pub(crate) wpos: usize,
    pub(crate) wmore: bool,
    pub(crate) in_write_payload: bool,
    pub(crate) in_write_shutdown: bool,

    // reply decoding scratch
    pub(crate) or_reply: u32,
    pub(crate) or_len: u32,
    pub(crate) sr_flags: u16,
    pub(crate) sr_type_raw: u16,
    pub(crate) sr_len: u32,
    pub(crate) reply_cookie: u64,
    pub(crate) simple_error_raw: u32,
    pub(crate) chunk_err: u32,
    pub(crate) chunk_msglen: usize,
    pub(crate) chunk_offset: u64,
    pub(crate) chunk_payload: usize,
    pub(crate) reply_cmd: Option<usize>,
    pub(crate) saved_reply: Option<ReplyState>,

    // command queues
    pub(crate) cmds_to_issue: VecDeque<Command>,
    pub(crate) cmds_in_flight: VecDeque<Command>,
    pub(crate) cmds_done: VecDeque<Command>,
    pub(crate) next_cookie: u64,
    pub(crate) disconnect_requested: bool,
}

impl Default for Handle {
    fn default() -> Self {
        Self::new()
    }
}

impl Handle {
    /// Create a fresh handle in the Created state.
    pub fn new() -> Self {
        let seq = HANDLE_SEQ.fetch_add(1, Ordering::Relaxed);
        let debug = std::env::var("NBD_CLIENT_DEBUG").map_or(false, |v| v == "1");
        Handle {
            state: State::Created,
            conn: None,
            child: None,
            name: format!("nbd{seq}"),
            debug,
            debug_cb: None,
            private_data: 0,
            export_name: String::new(),
            tls: TlsMode::Disable,
            tls_settings: TlsSettings::new(),
            request_sr: true,
            request_meta: true,
            meta_queries: vec!["base:allocation".to_string()],
            opt_mode: false,
            full_info: false,
            strict: Default::default(),
            uri_allow_local_file: false,
            timeout: None,
            addrs: Vec::new(),
            addr_index: 0,
            connect_errno: 0,
            connect_ready: false,
            gflags: HandshakeFlags::empty(),
            fixed_newstyle: false,
            no_zeroes: false,
            export_size: None,
            eflags: None,
            block_size: None,
            canonical_name: None,
            description: None,
            meta_contexts: Vec::new(),
            protocol: None,
            structured_replies: false,
            tls_negotiated: false,
            opt_current: None,
            opt_cb: Default::default(),
            opt_queries: None,
            got_export_info: false,
            deferred_error: None,
            sbuf: Vec::with_capacity(1024),
            request: [0; REQUEST_SIZE],
            rtarget: RecvTarget::Sbuf,
            rlen: 0,
            rpos: 0,
            wsource: SendSource::Sbuf,
            wlen: 0,
            wpos: 0,
            wmore: false,
            in_write_payload: false,
            in_write_shutdown: false,
            or_reply: 0,
            or_len: 0,
            sr_flags: 0,
            sr_type_raw: 0,
            sr_len: 0,
            reply_cookie: 0,
            simple_error_raw: 0,
            chunk_err: 0,
            chunk_msglen: 0,
            chunk_offset: 0,
            chunk_payload: 0,
            reply_cmd: None,
            saved_reply: None,
            cmds_to_issue: VecDeque::new(),
            cmds_in_flight: VecDeque::new(),
            cmds_done: VecDeque::new(),
            next_cookie: 1,
            disconnect_requested: false,
        }
    }

    pub(crate) fn debug_msg(&mut self, msg: &str) {
        if !self.debug {
            return;
        }
        if let Some(cb) = self.debug_cb.as_mut() {
            cb(&self.name, msg);
        } else {
            log::debug!("{}: {}", self.name, msg);
        }
    }

    fn require_created(&self) -> Result<()> {
        if matches!(self.state, State::Created) {
            Ok(())
        } else {
            Err(Error::invalid("handle is already connected").record())
        }
    }

    // ---- configuration ----

    pub fn set_export_name<S: Into<String>>(&mut self, name: S) -> Result<()> {
        if !matches!(self.state, State::Created | State::Negotiating) {
            return Err(Error::invalid("export name is fixed after negotiation").record());
        }
        let name = name.into();
        if name.len() > crate::proto::MAX_STRING {
            return Err(Error::invalid("export name too long").record());
        }
        self.export_name = name;
        Ok(())
    }

    pub fn get_export_name(&self) -> &str {
        &self.export_name
    }

    pub fn set_tls(&mut self, mode: TlsMode) -> Result<()> {
        self.require_created()?;
        self.tls = mode;
        Ok(())
    }

    pub fn get_tls(&self) -> TlsMode {
        self.tls
    }

    pub fn set_tls_certificates<P: Into<PathBuf>>(&mut self, dir: P) -> Result<()> {
        self.require_created()?;
        self.tls_settings.certificates = Some(dir.into());
        Ok(())
    }

    pub fn set_tls_verify_peer(&mut self, verify: bool) -> Result<()> {
        self.require_created()?;
        self.tls_settings.verify_peer = verify;
        Ok(())
    }

    pub fn set_tls_username<S: Into<String>>(&mut self, user: S) -> Result<()> {
        self.require_created()?;
        self.tls_settings.username = Some(user.into());
        Ok(())
    }

    pub fn set_tls_psk_file<P: Into<PathBuf>>(&mut self, path: P) -> Result<()> {
        self.require_created()?;
        self.tls_settings.psk_file = Some(path.into());
        Ok(())
    }

    pub fn set_tls_hostname<S: Into<String>>(&mut self, host: S) -> Result<()> {
        self.require_created()?;
        self.tls_settings.hostname = Some(host.into());
        Ok(())
    }

    pub fn set_request_structured_replies(&mut self, request: bool) -> Result<()> {
        self.require_created()?;
        self.request_sr = request;
        Ok(())
    }

    pub fn get_request_structured_replies(&self) -> bool {
        self.request_sr
    }

    pub fn set_request_meta_context(&mut self, request: bool) -> Result<()> {
        self.require_created()?;
        self.request_meta = request;
        Ok(())
    }

    pub fn get_request_meta_context(&self) -> bool {
        self.request_meta
    }

    pub fn add_meta_context<S: Into<String>>(&mut self, name: S) -> Result<()> {
        if !matches!(self.state, State::Created | State::Negotiating) {
            return Err(Error::invalid("metadata contexts are fixed after negotiation").record());
        }
        let name = name.into();
        if name.is_empty() || name.len() > crate::proto::MAX_STRING {
            return Err(Error::invalid("bad metadata context name").record());
        }
        self.meta_queries.push(name);
        Ok(())
    }

    pub fn clear_meta_contexts(&mut self) -> Result<()> {
        if !matches!(self.state, State::Created | State::Negotiating) {
            return Err(Error::invalid("metadata contexts are fixed after negotiation").record());
        }
        self.meta_queries.clear();
        Ok(())
    }

    pub fn get_nr_meta_contexts(&self) -> usize {
        self.meta_queries.len()
    }

    pub fn get_meta_context(&self, i: usize) -> Result<&str> {
        self.meta_queries
            .get(i)
            .map(|s| s.as_str())
            .ok_or_else(|| Error::invalid("metadata context index out of range").record())
    }

    pub fn set_opt_mode(&mut self, enable: bool) -> Result<()> {
        self.require_created()?;
        self.opt_mode = enable;
        Ok(())
    }

    pub fn get_opt_mode(&self) -> bool {
        self.opt_mode
    }

    pub fn set_full_info(&mut self, enable: bool) -> Result<()> {
        self.require_created()?;
        self.full_info = enable;
        Ok(())
    }

    pub fn get_full_info(&self) -> bool {
        self.full_info
    }

    pub fn set_strict_mode(&mut self, flags: crate::proto::StrictFlags) {
        self.strict = flags;
    }

    pub fn get_strict_mode(&self) -> crate::proto::StrictFlags {
        self.strict
    }

    pub fn set_debug(&mut self, enable: bool) {
        self.debug = enable;
    }

    pub fn get_debug(&self) -> bool {
        self.debug
    }

    pub fn set_debug_callback(&mut self, cb: DebugCallback) {
        self.debug_cb = Some(cb);
    }

    pub fn set_private_data(&mut self, data: usize) -> usize {
        mem::replace(&mut self.private_data, data)
    }

    pub fn get_private_data(&self) -> usize {
        self.private_data
    }

    pub fn set_handle_name<S: Into<String>>(&mut self, name: S) {
        self.name = name.into();
    }

    pub fn get_handle_name(&self) -> &str {
        &self.name
    }

    pub fn set_uri_allow_local_file(&mut self, allow: bool) -> Result<()> {
        self.require_created()?;
        self.uri_allow_local_file = allow;
        Ok(())
    }

    /// Deadline applied by each blocking helper call; `None` waits
    /// indefinitely.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    // ---- connection establishment ----

    /// Begin connecting to an NBD server over a Unix domain socket.
    pub fn aio_connect_unix<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        self.require_created()?;
        let (t, _in_progress) = transport::connect_unix_start(path.as_ref())
            .map_err(|e| Error::io(e, "connect").record())?;
        self.conn = Some(Conn::Plain(t));
        self.state = State::Connecting(ConnectState::Start);
        self.run()
    }

    /// Begin connecting over TCP. Name resolution happens here (and
    /// blocks); the resolved addresses are then tried in order without
    /// blocking, retaining the first connect error.
    pub fn aio_connect_tcp(&mut self, host: &str, port: u16) -> Result<()> {
        self.require_created()?;
        let addrs: Vec<SocketAddr> = (host, port)
            .to_socket_addrs()
            .map_err(|e| Error::io(e, &format!("getaddrinfo: {host}:{port}")).record())?
            .collect();
        if addrs.is_empty() {
            return Err(Error::invalid(format!("no addresses found for {host}")).record());
        }
        self.addrs = addrs;
        self.state = State::ConnectingTcp(TcpConnectState::Start);
        self.run()
    }

    /// Begin connecting to one already-resolved TCP address.
    pub fn aio_connect(&mut self, addr: SocketAddr) -> Result<()> {
        self.require_created()?;
        self.addrs = vec![addr];
        self.state = State::ConnectingTcp(TcpConnectState::Start);
        self.run()
    }

    /// Adopt an already-connected stream socket.
    pub fn aio_connect_socket(&mut self, fd: OwnedFd) -> Result<()> {
        self.require_created()?;
        let t = transport::adopt_socket(fd).map_err(|e| Error::io(e, "socket").record())?;
        self.conn = Some(Conn::Plain(t));
        self.state = State::Magic(MagicState::Start);
        self.run()
    }

    /// Spawn `argv` as a server speaking NBD on stdin/stdout and connect
    /// to it over a socketpair.
    pub fn aio_connect_command(&mut self, argv: &[String]) -> Result<()> {
        self.require_created()?;
        let (t, child) =
            transport::spawn_command(argv).map_err(|e| Error::io(e, "spawning server").record())?;
        self.conn = Some(Conn::Plain(t));
        self.child = Some(child);
        // the socketpair is connected from birth
        self.state = State::Magic(MagicState::Start);
        self.run()
    }

    /// Spawn `argv` with the socket handed over via the systemd
    /// socket-activation protocol.
    pub fn aio_connect_systemd_socket_activation(&mut self, argv: &[String]) -> Result<()> {
        self.require_created()?;
        let t_child = transport::spawn_socket_activation(argv)
            .map_err(|e| Error::io(e, "spawning server").record())?;
        self.conn = Some(Conn::Plain(t_child.0));
        self.child = Some(t_child.1);
        self.state = State::Magic(MagicState::Start);
        self.run()
    }

    /// NBD URIs are handled by an external collaborator; this build does
    /// not parse them.
    pub fn aio_connect_uri(&mut self, _uri: &str) -> Result<()> {
        Err(Error::unsupported("NBD URIs are not supported in this build").record())
    }

    // ---- engine pump ----

    /// Run the state machine until it blocks or terminates.
    pub(crate) fn run(&mut self) -> Result<()> {
        loop {
            match self.step() {
                Ok(Flow::Continue) => continue,
                Ok(Flow::Block) => return Ok(()),
                Err(e) => {
                    self.debug_msg(&format!("terminating: {e}"));
                    self.die();
                    return Err(e.record());
                }
            }
        }
    }

    fn step(&mut self) -> Result<Flow> {
        match self.state {
            State::Created | State::Negotiating | State::Closed | State::Dead => Ok(Flow::Block),
            State::Connecting(s) => self.step_connect(s),
            State::ConnectingTcp(s) => self.step_connect_tcp(s),
            State::Magic(s) => self.step_magic(s),
            State::Oldstyle(s) => self.step_oldstyle(s),
            State::Newstyle(s) => self.step_newstyle(s),
            State::Ready => self.step_ready(),
            State::Issue(s) => self.step_issue(s),
            State::Reply(s) => self.step_reply(s),
        }
    }

    fn step_ready(&mut self) -> Result<Flow> {
        if let Some(conn) = &self.conn {
            // decrypted bytes may already be buffered; the socket will not
            // poll readable for them
            if conn.has_buffered_read() {
                self.state = State::Reply(ReplyState::Start);
                return Ok(Flow::Continue);
            }
        }
        if !self.cmds_to_issue.is_empty() {
            self.state = State::Issue(IssueState::Start);
            return Ok(Flow::Continue);
        }
        Ok(Flow::Block)
    }

    fn step_connect(&mut self, s: ConnectState) -> Result<Flow> {
        match s {
            ConnectState::Start => {
                // connect(2) was initiated by the API call; wait for the
                // socket to become writable before checking the outcome
                self.state = State::Connecting(ConnectState::Connecting);
                Ok(Flow::Block)
            }
            ConnectState::Connecting => {
                if !self.connect_ready {
                    return Ok(Flow::Block);
                }
                self.connect_ready = false;
                let fd = self.aio_get_fd()?;
                let status = transport::so_error(fd).map_err(|e| Error::io(e, "getsockopt"))?;
                if status != 0 {
                    return Err(Error::with_errno(
                        crate::errors::ErrorKind::Io,
                        status,
                        format!("connect: {}", Errno::from_i32(status).desc()),
                    ));
                }
                self.state = State::Magic(MagicState::Start);
                Ok(Flow::Continue)
            }
        }
    }

    fn step_connect_tcp(&mut self, s: TcpConnectState) -> Result<Flow> {
        match s {
            TcpConnectState::Start => {
                self.addr_index = 0;
                self.connect_errno = 0;
                self.state = State::ConnectingTcp(TcpConnectState::Connect);
                Ok(Flow::Continue)
            }
            TcpConnectState::Connect => {
                let Some(addr) = self.addrs.get(self.addr_index).copied() else {
                    // every address failed; surface the first errno we saw
                    let errno = if self.connect_errno != 0 {
                        self.connect_errno
                    } else {
                        Errno::ECONNREFUSED as i32
                    };
                    return Err(Error::with_errno(
                        crate::errors::ErrorKind::Io,
                        errno,
                        "connect: could not connect to remote host",
                    ));
                };
                match transport::connect_tcp_start(&addr) {
                    Ok((t, _in_progress)) => {
                        self.conn = Some(Conn::Plain(t));
                        self.state = State::ConnectingTcp(TcpConnectState::Connecting);
                        Ok(Flow::Block)
                    }
                    Err(e) => {
                        if self.connect_errno == 0 {
                            self.connect_errno = e.raw_os_error().unwrap_or(0);
                        }
                        self.state = State::ConnectingTcp(TcpConnectState::NextAddress);
                        Ok(Flow::Continue)
                    }
                }
            }
            TcpConnectState::Connecting => {
                if !self.connect_ready {
                    return Ok(Flow::Block);
                }
                self.connect_ready = false;
                let fd = self.aio_get_fd()?;
                let status = transport::so_error(fd).map_err(|e| Error::io(e, "getsockopt"))?;
                if status == 0 {
                    self.state = State::Magic(MagicState::Start);
                } else {
                    if self.connect_errno == 0 {
                        self.connect_errno = status;
                    }
                    self.state = State::ConnectingTcp(TcpConnectState::NextAddress);
                }
                Ok(Flow::Continue)
            }
            TcpConnectState::NextAddress => {
                self.conn = None;
                self.addr_index += 1;
                self.state = State::ConnectingTcp(TcpConnectState::Connect);
                Ok(Flow::Continue)
            }
        }
    }

    // ---- partial-progress I/O ----

    /// Arrange to receive `n` bytes into the staging buffer.
    pub(crate) fn begin_recv_sbuf(&mut self, n: usize) {
        if self.sbuf.len() < n {
            self.sbuf.resize(n, 0);
        }
        self.rtarget = RecvTarget::Sbuf;
        self.rlen = n;
        self.rpos = 0;
    }

    /// Grow the current staging-buffer receive to `n` total bytes,
    /// keeping what has already arrived.
    pub(crate) fn extend_recv_sbuf(&mut self, n: usize) {
        debug_assert!(matches!(self.rtarget, RecvTarget::Sbuf));
        if self.sbuf.len() < n {
            self.sbuf.resize(n, 0);
        }
        self.rlen = n;
    }

    /// Arrange to receive `n` bytes into the buffer of in-flight command
    /// `idx`, `at` bytes in.
    pub(crate) fn begin_recv_cmd(&mut self, idx: usize, at: usize, n: usize) {
        self.rtarget = RecvTarget::CommandBuf { idx, at };
        self.rlen = n;
        self.rpos = 0;
    }

    /// Arrange to receive and drop `n` bytes.
    pub(crate) fn begin_recv_discard(&mut self, n: usize) {
        self.rtarget = RecvTarget::Discard;
        self.rlen = n;
        self.rpos = 0;
    }

    /// Receive until the current target is satisfied, the socket runs
    /// dry, or the peer closes.
    pub(crate) fn recv_into_rbuf(&mut self) -> Result<RecvProgress> {
        while self.rpos < self.rlen {
            let conn = self
                .conn
                .as_mut()
                .ok_or_else(|| Error::not_connected("no transport"))?;
            let res = match self.rtarget {
                RecvTarget::Sbuf => conn.recv(&mut self.sbuf[self.rpos..self.rlen]),
                RecvTarget::CommandBuf { idx, at } => {
                    let cmd = &mut self.cmds_in_flight[idx];
                    conn.recv(&mut cmd.buf[at + self.rpos..at + self.rlen])
                }
                RecvTarget::Discard => {
                    let mut scratch = [0u8; 8192];
                    let want = (self.rlen - self.rpos).min(scratch.len());
                    conn.recv(&mut scratch[..want])
                }
            };
            match res {
                Ok(0) => return Ok(RecvProgress::Eof),
                Ok(n) => self.rpos += n,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    return Ok(RecvProgress::Again)
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::io(e, "recv")),
            }
        }
        Ok(RecvProgress::Done)
    }

    /// Queue the staging buffer's contents for sending.
    pub(crate) fn begin_send_sbuf(&mut self, more: bool) {
        self.wsource = SendSource::Sbuf;
        self.wlen = self.sbuf.len();
        self.wpos = 0;
        self.wmore = more;
    }

    /// Send until the current source is drained or the socket stops
    /// accepting bytes. Returns true when fully sent.
    pub(crate) fn send_from_wbuf(&mut self) -> Result<bool> {
        while self.wpos < self.wlen {
            let conn = self
                .conn
                .as_mut()
                .ok_or_else(|| Error::not_connected("no transport"))?;
            let res = match self.wsource {
                SendSource::Sbuf => conn.send(&self.sbuf[self.wpos..self.wlen], self.wmore),
                SendSource::Request => conn.send(&self.request[self.wpos..self.wlen], self.wmore),
                SendSource::Payload => match self.cmds_to_issue.front() {
                    Some(cmd) => conn.send(&cmd.buf[self.wpos..self.wlen], self.wmore),
                    None => {
                        return Err(Error::protocol("payload send with an empty issue queue"))
                    }
                },
            };
            match res {
                Ok(n) => self.wpos += n,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::io(e, "send")),
            }
        }
        self.wlen = 0;
        self.wpos = 0;
        Ok(true)
    }

    // ---- command bookkeeping ----

    pub(crate) fn alloc_cookie(&mut self) -> u64 {
        let cookie = self.next_cookie;
        self.next_cookie += 1;
        cookie
    }

    pub(crate) fn find_in_flight(&self, cookie: u64) -> Option<usize> {
        self.cmds_in_flight.iter().position(|c| c.cookie == cookie)
    }

    /// Deliver the completion callback and either retire the command on
    /// the spot (callback returned positive) or park it on the done
    /// queue.
    pub(crate) fn finish_command_to_done(&mut self, mut cmd: Command) {
        let mut err = cmd.error;
        let auto_retire = match cmd.completion.take() {
            Some(mut cb) => {
                let r = cb(&mut cmd.buf, &mut err);
                if err != 0 {
                    cmd.error = err;
                }
                r > 0
            }
            None => false,
        };
        if !auto_retire {
            self.cmds_done.push_back(cmd);
        }
    }

    /// Fail every queued and in-flight command with `errno` and deliver
    /// their callbacks.
    pub(crate) fn abort_commands(&mut self, errno: i32) {
        let mut cmds: Vec<Command> = self.cmds_to_issue.drain(..).collect();
        cmds.extend(self.cmds_in_flight.drain(..));
        self.reply_cmd = None;
        self.saved_reply = None;
        for mut cmd in cmds {
            cmd.set_error(errno);
            self.finish_command_to_done(cmd);
        }
    }

    pub(crate) fn die(&mut self) {
        if !matches!(self.state, State::Closed | State::Dead) {
            self.state = State::Dead;
            self.opt_current = None;
            self.opt_cb.complete(Errno::ENOTCONN as i32);
            self.abort_commands(Errno::ENOTCONN as i32);
        }
    }

    pub(crate) fn enter_closed(&mut self) {
        if !matches!(self.state, State::Closed | State::Dead) {
            self.state = State::Closed;
            self.opt_current = None;
            self.opt_cb.complete(Errno::ENOTCONN as i32);
            self.abort_commands(Errno::ENOTCONN as i32);
        }
    }

    // ---- external events ----

    /// The caller saw the socket become readable.
    pub fn aio_notify_read(&mut self) -> Result<()> {
        match self.state {
            State::Ready => self.state = State::Reply(ReplyState::Start),
            State::Issue(IssueState::SendRequest) => {
                self.state = State::Issue(IssueState::PauseSendRequest)
            }
            State::Issue(IssueState::SendWritePayload) => {
                self.state = State::Issue(IssueState::PauseWritePayload)
            }
            State::Issue(IssueState::SendWriteShutdown) => {
                self.state = State::Issue(IssueState::PauseWriteShutdown)
            }
            State::Closed | State::Dead => {
                return Err(Error::not_connected("connection is shut down").record())
            }
            _ => {}
        }
        self.run()
    }

    /// The caller saw the socket become writable.
    pub fn aio_notify_write(&mut self) -> Result<()> {
        match self.state {
            State::Connecting(ConnectState::Connecting)
            | State::ConnectingTcp(TcpConnectState::Connecting) => self.connect_ready = true,
            State::Ready => {
                if !self.cmds_to_issue.is_empty() {
                    self.state = State::Issue(IssueState::Start);
                }
            }
            State::Closed | State::Dead => {
                return Err(Error::not_connected("connection is shut down").record())
            }
            _ => {}
        }
        self.run()
    }

    // ---- introspection ----

    pub fn aio_get_fd(&self) -> Result<RawFd> {
        self.conn
            .as_ref()
            .map(Conn::raw_fd)
            .ok_or_else(|| Error::not_connected("no transport").record())
    }

    /// The readiness the engine is waiting for. The caller feeds matching
    /// events back via [`Handle::aio_notify_read`] /
    /// [`Handle::aio_notify_write`].
    pub fn aio_get_direction(&self) -> Direction {
        let mut d = self.state.direction();
        if matches!(self.state, State::Ready) && !self.cmds_to_issue.is_empty() {
            d = d.union(Direction::Write);
        }
        if let Some(conn) = &self.conn {
            d = d.union(conn.pending_direction());
        }
        d
    }

    pub fn aio_is_created(&self) -> bool {
        matches!(self.state, State::Created)
    }

    pub fn aio_is_connecting(&self) -> bool {
        self.state.is_connecting()
    }

    pub fn aio_is_negotiating(&self) -> bool {
        matches!(self.state, State::Negotiating)
    }

    pub fn aio_is_ready(&self) -> bool {
        matches!(self.state, State::Ready)
    }

    /// Busy processing a command (issuing or decoding a reply).
    pub fn aio_is_processing(&self) -> bool {
        matches!(self.state, State::Issue(_) | State::Reply(_))
    }

    pub fn aio_is_closed(&self) -> bool {
        matches!(self.state, State::Closed)
    }

    pub fn aio_is_dead(&self) -> bool {
        matches!(self.state, State::Dead)
    }

    /// Commands accepted but not yet retired to the done queue.
    pub fn aio_in_flight(&self) -> usize {
        self.cmds_to_issue.len() + self.cmds_in_flight.len()
    }

    // ---- negotiated facts ----

    fn require_negotiated<T: Copy>(&self, fact: Option<T>, what: &str) -> Result<T> {
        fact.ok_or_else(|| Error::not_connected(format!("{what} is not known yet")).record())
    }

    /// Size of the export, as reported by the server during the
    /// handshake.
    pub fn get_size(&self) -> Result<u64> {
        self.require_negotiated(self.export_size, "export size")
    }

    pub fn get_protocol(&self) -> Result<&'static str> {
        self.require_negotiated(self.protocol, "protocol variant")
    }

    pub fn get_structured_replies_negotiated(&self) -> bool {
        self.structured_replies
    }

    pub fn get_tls_negotiated(&self) -> bool {
        self.tls_negotiated
    }

    fn eflag(&self, flag: TransmitFlags) -> Result<bool> {
        let eflags = self.require_negotiated(self.eflags, "export flags")?;
        Ok(eflags.contains(flag))
    }

    pub fn is_read_only(&self) -> Result<bool> {
        self.eflag(TransmitFlags::READ_ONLY)
    }

    pub fn is_rotational(&self) -> Result<bool> {
        self.eflag(TransmitFlags::ROTATIONAL)
    }

    pub fn can_flush(&self) -> Result<bool> {
        self.eflag(TransmitFlags::SEND_FLUSH)
    }

    pub fn can_fua(&self) -> Result<bool> {
        self.eflag(TransmitFlags::SEND_FUA)
    }

    pub fn can_trim(&self) -> Result<bool> {
        self.eflag(TransmitFlags::SEND_TRIM)
    }

    pub fn can_zero(&self) -> Result<bool> {
        self.eflag(TransmitFlags::SEND_WRITE_ZEROES)
    }

    pub fn can_fast_zero(&self) -> Result<bool> {
        self.eflag(TransmitFlags::SEND_FAST_ZERO)
    }

    pub fn can_df(&self) -> Result<bool> {
        self.eflag(TransmitFlags::SEND_DF)
    }

    pub fn can_multi_conn(&self) -> Result<bool> {
        self.eflag(TransmitFlags::CAN_MULTI_CONN)
    }

    pub fn can_cache(&self) -> Result<bool> {
        self.eflag(TransmitFlags::SEND_CACHE)
    }

    /// Whether `name` was negotiated as a metadata context, and if so its
    /// wire id.
    pub fn can_meta_context(&self, name: &str) -> Result<bool> {
        if !self.state.is_connected() && self.meta_contexts.is_empty() {
            return Err(Error::not_connected("metadata contexts are not known yet").record());
        }
        Ok(self.meta_contexts.iter().any(|(n, _)| n == name))
    }

    pub fn get_block_size(&self, which: BlockSizeKind) -> Result<u32> {
        let (min, pref, max) = self.require_negotiated(self.block_size, "block size")?;
        Ok(match which {
            BlockSizeKind::Minimum => min,
            BlockSizeKind::Preferred => pref,
            BlockSizeKind::Maximum => max,
        })
    }

    pub fn get_canonical_export_name(&self) -> Result<&str> {
        self.canonical_name
            .as_deref()
            .ok_or_else(|| Error::not_connected("canonical name was not reported").record())
    }

    pub fn get_export_description(&self) -> Result<&str> {
        self.description
            .as_deref()
            .ok_or_else(|| Error::not_connected("description was not reported").record())
    }

    /// Message recorded by the most recent failing call on this thread.
    pub fn get_error(&self) -> Option<String> {
        crate::errors::get_error()
    }

    /// Numeric code recorded by the most recent failing call on this
    /// thread.
    pub fn get_errno(&self) -> i32 {
        crate::errors::get_errno()
    }

    // ---- handshake bookkeeping shared by several states ----

    pub(crate) fn set_size_and_flags(&mut self, size: u64, raw_eflags: u16) {
        let eflags = TransmitFlags::from_bits_truncate(raw_eflags);
        self.debug_msg(&format!("size: {size} eflags: {raw_eflags:#x}"));
        self.export_size = Some(size);
        self.eflags = Some(eflags);
    }

    pub(crate) fn reset_size_and_flags(&mut self) {
        self.export_size = None;
        self.eflags = None;
        self.block_size = None;
        self.canonical_name = None;
        self.description = None;
    }

    // ---- shutdown ----

    /// Queue a disconnect request. With ABANDON_PENDING, commands that
    /// have not begun transmission fail immediately with ENOTCONN.
    pub fn aio_shutdown(&mut self, flags: ShutdownFlags) -> Result<()> {
        match self.state {
            State::Closed | State::Dead => return Ok(()),
            s if s.in_transmission() => {}
            _ => return Err(Error::not_connected("not in the transmission phase").record()),
        }
        if flags.contains(ShutdownFlags::ABANDON_PENDING) {
            // a command mid-transmission must finish; everything queued
            // behind it is fair game
            let keep_first = matches!(self.state, State::Issue(_))
                || self.in_write_payload
                || self.in_write_shutdown
                || self.wpos < self.wlen;
            let skip = usize::from(keep_first);
            let abandoned: Vec<Command> = if self.cmds_to_issue.len() > skip {
                self.cmds_to_issue.drain(skip..).collect()
            } else {
                Vec::new()
            };
            for mut cmd in abandoned {
                cmd.set_error(Errno::ENOTCONN as i32);
                self.finish_command_to_done(cmd);
            }
        }
        if !self.disconnect_requested {
            self.disconnect_requested = true;
            let cookie = self.alloc_cookie();
            let cmd = Command::new(cookie, Cmd::DISC, 0, 0, Vec::new());
            self.cmds_to_issue.push_back(cmd);
        }
        if matches!(self.state, State::Ready) {
            self.state = State::Issue(IssueState::Start);
        }
        self.run()
    }

    /// Close the connection immediately, without draining in-flight
    /// commands. Every pending callback is released.
    pub fn close(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        self.abort_commands(Errno::ENOTCONN as i32);
        self.cmds_done.clear();
        self.conn = None;
        if let Some(mut child) = self.child.take() {
            let _ = child.wait();
        }
        if !matches!(self.state, State::Closed | State::Dead) {
            self.state = State::Closed;
        }
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        self.teardown();
    }
}
