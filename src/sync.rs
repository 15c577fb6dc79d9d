//! Synchronous façade.
//!
//! Every call here is a thin loop over the async primitives: issue, then
//! poll(2) on the handle's file descriptor in whichever direction the
//! engine asks for, feeding readiness back until the awaited event
//! happens. Readable is always serviced before writable: a server
//! blocked on its send side needs draining before it will accept more of
//! our requests.

use std::os::unix::io::OwnedFd;
use std::path::Path;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};

use crate::callbacks::{ChunkCallback, ContextCallback, ExtentCallback, ListCallback};
use crate::errors::{Error, Result};
use crate::handle::Handle;
use crate::proto::{CmdFlag, ShutdownFlags};
use crate::state::State;

/// Sentinel meaning "option completion has not fired yet".
const PENDING: i32 = i32::MIN;

impl Handle {
    /// Wait for one readiness event and feed it to the engine.
    pub(crate) fn poll_one(&mut self) -> Result<()> {
        let fd = self.aio_get_fd()?;
        let dir = self.aio_get_direction();
        let mut events = PollFlags::empty();
        if dir.wants_read() {
            events |= PollFlags::POLLIN;
        }
        if dir.wants_write() {
            events |= PollFlags::POLLOUT;
        }
        if events.is_empty() {
            return Err(Error::invalid("handle is not expecting any events").record());
        }
        let timeout_ms = match self.timeout {
            Some(t) => i32::try_from(t.as_millis()).unwrap_or(i32::MAX),
            None => -1,
        };
        let mut fds = [PollFd::new(fd, events)];
        let n = loop {
            match poll(&mut fds, timeout_ms) {
                Ok(n) => break n,
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    return Err(Error::io(
                        std::io::Error::from_raw_os_error(e as i32),
                        "poll",
                    )
                    .record())
                }
            }
        };
        if n == 0 {
            return Err(Error::timeout("timed out waiting for the server").record());
        }
        let revents = fds[0].revents().unwrap_or_else(PollFlags::empty);
        let readable =
            revents.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR);
        let writable = revents.intersects(PollFlags::POLLOUT | PollFlags::POLLERR);
        if dir.wants_read() && readable {
            self.aio_notify_read()
        } else if dir.wants_write() && writable {
            self.aio_notify_write()
        } else if revents.intersects(PollFlags::POLLHUP | PollFlags::POLLERR) {
            // let the engine observe the failure through a read attempt
            self.aio_notify_read()
        } else {
            Ok(())
        }
    }

    fn wait_connected(&mut self) -> Result<()> {
        while self.state.is_connecting() {
            self.poll_one()?;
        }
        match self.state {
            State::Ready | State::Negotiating => Ok(()),
            _ => Err(Error::not_connected("connection closed during handshake").record()),
        }
    }

    /// Connect over a Unix domain socket and complete the handshake.
    pub fn connect_unix<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        self.aio_connect_unix(path)?;
        self.wait_connected()
    }

    /// Connect over TCP and complete the handshake.
    pub fn connect_tcp(&mut self, host: &str, port: u16) -> Result<()> {
        self.aio_connect_tcp(host, port)?;
        self.wait_connected()
    }

    /// Adopt a connected socket and complete the handshake.
    pub fn connect_socket(&mut self, fd: OwnedFd) -> Result<()> {
        self.aio_connect_socket(fd)?;
        self.wait_connected()
    }

    /// Spawn a server subprocess and complete the handshake over a
    /// socketpair.
    pub fn connect_command(&mut self, argv: &[String]) -> Result<()> {
        self.aio_connect_command(argv)?;
        self.wait_connected()
    }

    /// Spawn a server subprocess, passing the socket the systemd way.
    pub fn connect_systemd_socket_activation(&mut self, argv: &[String]) -> Result<()> {
        self.aio_connect_systemd_socket_activation(argv)?;
        self.wait_connected()
    }

    /// See [`Handle::aio_connect_uri`].
    pub fn connect_uri(&mut self, uri: &str) -> Result<()> {
        self.aio_connect_uri(uri)
    }

    /// Wait until command `cookie` completes, retire it, and hand back
    /// its buffer.
    fn wait_command(&mut self, cookie: u64, what: &str) -> Result<Vec<u8>> {
        loop {
            if let Some(cmd) = self.take_done(cookie) {
                if cmd.error != 0 {
                    return Err(Error::from_command_errno(cmd.error, what).record());
                }
                return Ok(cmd.buf);
            }
            if matches!(self.state, State::Closed | State::Dead) {
                return Err(Error::not_connected("connection is shut down").record());
            }
            self.poll_one()?;
        }
    }

    /// Read `buf.len()` bytes at `offset`.
    pub fn pread(&mut self, buf: &mut [u8], offset: u64, flags: CmdFlag) -> Result<()> {
        let cookie = self.aio_pread(vec![0; buf.len()], offset, None, flags)?;
        let data = self.wait_command(cookie, "pread")?;
        buf.copy_from_slice(&data);
        Ok(())
    }

    /// Read with per-chunk delivery; on success `buf` additionally holds
    /// the assembled bytes.
    pub fn pread_structured(
        &mut self,
        buf: &mut [u8],
        offset: u64,
        chunk: ChunkCallback,
        flags: CmdFlag,
    ) -> Result<()> {
        let cookie = self.aio_pread_structured(vec![0; buf.len()], offset, chunk, None, flags)?;
        let data = self.wait_command(cookie, "pread_structured")?;
        buf.copy_from_slice(&data);
        Ok(())
    }

    /// Write `data` at `offset`.
    pub fn pwrite(&mut self, data: &[u8], offset: u64, flags: CmdFlag) -> Result<()> {
        let cookie = self.aio_pwrite(data.to_vec(), offset, None, flags)?;
        self.wait_command(cookie, "pwrite")?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        let cookie = self.aio_flush(None)?;
        self.wait_command(cookie, "flush")?;
        Ok(())
    }

    pub fn trim(&mut self, count: u32, offset: u64, flags: CmdFlag) -> Result<()> {
        let cookie = self.aio_trim(count, offset, None, flags)?;
        self.wait_command(cookie, "trim")?;
        Ok(())
    }

    pub fn cache(&mut self, count: u32, offset: u64) -> Result<()> {
        let cookie = self.aio_cache(count, offset, None)?;
        self.wait_command(cookie, "cache")?;
        Ok(())
    }

    pub fn zero(&mut self, count: u32, offset: u64, flags: CmdFlag) -> Result<()> {
        let cookie = self.aio_zero(count, offset, None, flags)?;
        self.wait_command(cookie, "zero")?;
        Ok(())
    }

    /// Query block status over `[offset, offset+count)`; `extent` is
    /// invoked once per negotiated metadata context.
    pub fn block_status(
        &mut self,
        count: u32,
        offset: u64,
        extent: ExtentCallback,
        flags: CmdFlag,
    ) -> Result<()> {
        let cookie = self.aio_block_status(count, offset, extent, None, flags)?;
        self.wait_command(cookie, "block_status")?;
        Ok(())
    }

    /// Send a disconnect request and wait for the connection to wind
    /// down.
    pub fn shutdown(&mut self, flags: ShutdownFlags) -> Result<()> {
        self.aio_shutdown(flags)?;
        while !matches!(self.state, State::Closed | State::Dead) {
            self.poll_one()?;
        }
        Ok(())
    }

    // ---- synchronous option mode ----

    fn option_completion(flag: &Arc<AtomicI32>) -> crate::callbacks::CompletionCallback {
        let flag = Arc::clone(flag);
        Box::new(move |_buf, err| {
            flag.store(*err, Ordering::SeqCst);
            0
        })
    }

    fn wait_option(&mut self, flag: &Arc<AtomicI32>) -> Result<i32> {
        while flag.load(Ordering::SeqCst) == PENDING {
            self.poll_one()?;
        }
        Ok(flag.load(Ordering::SeqCst))
    }

    /// Select the configured export and enter the transmission phase.
    pub fn opt_go(&mut self) -> Result<()> {
        let flag = Arc::new(AtomicI32::new(PENDING));
        self.aio_opt_go(Some(Self::option_completion(&flag)))?;
        match self.wait_option(&flag)? {
            0 => Ok(()),
            err => Err(Error::from_command_errno(err, "opt_go").record()),
        }
    }

    /// Probe the configured export without selecting it.
    pub fn opt_info(&mut self) -> Result<()> {
        let flag = Arc::new(AtomicI32::new(PENDING));
        self.aio_opt_info(Some(Self::option_completion(&flag)))?;
        match self.wait_option(&flag)? {
            0 => Ok(()),
            err => Err(Error::from_command_errno(err, "opt_info").record()),
        }
    }

    /// Abandon negotiation; the connection ends cleanly.
    pub fn opt_abort(&mut self) -> Result<()> {
        self.aio_opt_abort()?;
        while !matches!(self.state, State::Closed | State::Dead) {
            self.poll_one()?;
        }
        Ok(())
    }

    /// List exports; returns how many the server described.
    pub fn opt_list(&mut self, mut list: ListCallback) -> Result<usize> {
        let count = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&count);
        let wrapped: ListCallback = Box::new(move |name, desc| {
            counted.fetch_add(1, Ordering::SeqCst);
            list(name, desc);
        });
        let flag = Arc::new(AtomicI32::new(PENDING));
        self.aio_opt_list(wrapped, Some(Self::option_completion(&flag)))?;
        match self.wait_option(&flag)? {
            0 => Ok(count.load(Ordering::SeqCst)),
            err => Err(Error::from_command_errno(err, "opt_list").record()),
        }
    }

    /// Attempt a TLS upgrade; false means the server refused and the
    /// session continues in cleartext.
    pub fn opt_starttls(&mut self) -> Result<bool> {
        let flag = Arc::new(AtomicI32::new(PENDING));
        self.aio_opt_starttls(Some(Self::option_completion(&flag)))?;
        self.wait_option(&flag)?;
        Ok(self.get_tls_negotiated())
    }

    /// Attempt to enable structured replies; false means the server
    /// refused.
    pub fn opt_structured_reply(&mut self) -> Result<bool> {
        let flag = Arc::new(AtomicI32::new(PENDING));
        self.aio_opt_structured_reply(Some(Self::option_completion(&flag)))?;
        self.wait_option(&flag)?;
        Ok(self.get_structured_replies_negotiated())
    }

    fn counted_context(
        count: &Arc<AtomicUsize>,
        mut context: ContextCallback,
    ) -> ContextCallback {
        let counted = Arc::clone(count);
        Box::new(move |name| {
            counted.fetch_add(1, Ordering::SeqCst);
            context(name);
        })
    }

    /// Negotiate the handle's configured metadata contexts; returns how
    /// many the server accepted.
    pub fn opt_set_meta_context(&mut self, context: ContextCallback) -> Result<usize> {
        let count = Arc::new(AtomicUsize::new(0));
        let flag = Arc::new(AtomicI32::new(PENDING));
        self.aio_opt_set_meta_context(
            Self::counted_context(&count, context),
            Some(Self::option_completion(&flag)),
        )?;
        match self.wait_option(&flag)? {
            0 => Ok(count.load(Ordering::SeqCst)),
            err => Err(Error::from_command_errno(err, "opt_set_meta_context").record()),
        }
    }

    /// Negotiate an explicit list of metadata context queries.
    pub fn opt_set_meta_context_queries(
        &mut self,
        queries: Vec<String>,
        context: ContextCallback,
    ) -> Result<usize> {
        let count = Arc::new(AtomicUsize::new(0));
        let flag = Arc::new(AtomicI32::new(PENDING));
        self.aio_opt_set_meta_context_queries(
            queries,
            Self::counted_context(&count, context),
            Some(Self::option_completion(&flag)),
        )?;
        match self.wait_option(&flag)? {
            0 => Ok(count.load(Ordering::SeqCst)),
            err => Err(Error::from_command_errno(err, "opt_set_meta_context_queries").record()),
        }
    }

    /// List which metadata contexts the server can serve; an empty query
    /// list asks for all of them.
    pub fn opt_list_meta_context_queries(
        &mut self,
        queries: Vec<String>,
        context: ContextCallback,
    ) -> Result<usize> {
        let count = Arc::new(AtomicUsize::new(0));
        let flag = Arc::new(AtomicI32::new(PENDING));
        self.aio_opt_list_meta_context_queries(
            queries,
            Self::counted_context(&count, context),
            Some(Self::option_completion(&flag)),
        )?;
        match self.wait_option(&flag)? {
            0 => Ok(count.load(Ordering::SeqCst)),
            err => Err(Error::from_command_errno(err, "opt_list_meta_context_queries").record()),
        }
    }
}
