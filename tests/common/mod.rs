//! Scriptable in-process NBD server for the integration tests.
//!
//! Serves one connection per thread over a `UnixStream` pair (or a TCP
//! listener for the multi-connection tests). The handshake style, option
//! behavior and reply shapes are chosen per test through `ServerConfig`,
//! including deliberately broken replies for the negative tests.
#![allow(dead_code)]

use std::io::{self, prelude::*};
use std::net::TcpListener;
use std::os::unix::io::OwnedFd;
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use byteorder::{ReadBytesExt, WriteBytesExt, BE};
use color_eyre::eyre::bail;
use color_eyre::Result;
use nix::poll::{poll, PollFd, PollFlags};

use nbd_client::Handle;

/// Drive the handle's event loop by hand (poll + notify per the
/// direction hint) until `pred` holds or the deadline passes.
pub fn drive_until(
    h: &mut Handle,
    deadline: Duration,
    mut pred: impl FnMut(&mut Handle) -> bool,
) -> Result<()> {
    let start = Instant::now();
    while !pred(h) {
        if start.elapsed() > deadline {
            bail!("engine made no progress within {deadline:?}");
        }
        let dir = h.aio_get_direction();
        let fd = h.aio_get_fd()?;
        let mut events = PollFlags::empty();
        if dir.wants_read() {
            events |= PollFlags::POLLIN;
        }
        if dir.wants_write() {
            events |= PollFlags::POLLOUT;
        }
        if events.is_empty() {
            bail!("engine is idle but the condition has not been reached");
        }
        let mut fds = [PollFd::new(fd, events)];
        poll(&mut fds, 100)?;
        let revents = fds[0].revents().unwrap_or_else(PollFlags::empty);
        let readable =
            revents.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR);
        let writable = revents.intersects(PollFlags::POLLOUT | PollFlags::POLLERR);
        if dir.wants_read() && readable {
            h.aio_notify_read()?;
        } else if dir.wants_write() && writable {
            h.aio_notify_write()?;
        }
    }
    Ok(())
}

// handshake constants
const MAGIC: u64 = 0x4e42444d41474943; // b"NBDMAGIC"
const IHAVEOPT: u64 = 0x49484156454F5054; // b"IHAVEOPT"
const OLD_VERSION: u64 = 0x420281861253;
const REPLY_MAGIC: u64 = 0x3e889045565a9;

// transmission constants
const REQUEST_MAGIC: u32 = 0x25609513;
const SIMPLE_REPLY_MAGIC: u32 = 0x67446698;
const STRUCTURED_REPLY_MAGIC: u32 = 0x668e33ef;

// global handshake flags
const FLAG_FIXED_NEWSTYLE: u16 = 1;
const FLAG_NO_ZEROES: u16 = 2;

// options
const OPT_EXPORT_NAME: u32 = 1;
const OPT_ABORT: u32 = 2;
const OPT_LIST: u32 = 3;
const OPT_STARTTLS: u32 = 5;
const OPT_INFO: u32 = 6;
const OPT_GO: u32 = 7;
const OPT_STRUCTURED_REPLY: u32 = 8;
const OPT_LIST_META_CONTEXT: u32 = 9;
const OPT_SET_META_CONTEXT: u32 = 10;

// option replies
const REP_ACK: u32 = 1;
const REP_SERVER: u32 = 2;
const REP_INFO: u32 = 3;
const REP_META_CONTEXT: u32 = 4;
const REP_ERR_UNSUP: u32 = (1 << 31) + 1;
const REP_ERR_POLICY: u32 = (1 << 31) + 2;
const REP_ERR_UNKNOWN: u32 = (1 << 31) + 6;

// info types
const INFO_EXPORT: u16 = 0;
const INFO_NAME: u16 = 1;
const INFO_DESCRIPTION: u16 = 2;
const INFO_BLOCK_SIZE: u16 = 3;

// commands
const CMD_READ: u16 = 0;
const CMD_WRITE: u16 = 1;
const CMD_DISC: u16 = 2;
const CMD_FLUSH: u16 = 3;
const CMD_TRIM: u16 = 4;
const CMD_CACHE: u16 = 5;
const CMD_WRITE_ZEROES: u16 = 6;
const CMD_BLOCK_STATUS: u16 = 7;

const CMD_FLAG_DF: u16 = 1 << 2;
const CMD_FLAG_REQ_ONE: u16 = 1 << 3;

// structured reply chunks
const REPLY_FLAG_DONE: u16 = 1;
const CHUNK_NONE: u16 = 0;
const CHUNK_OFFSET_DATA: u16 = 1;
const CHUNK_OFFSET_HOLE: u16 = 2;
const CHUNK_BLOCK_STATUS: u16 = 5;
const CHUNK_ERROR_OFFSET: u16 = (1 << 15) + 2;

// export flags: everything a well-equipped server advertises
pub const EFLAG_HAS_FLAGS: u16 = 1 << 0;
pub const EFLAG_READ_ONLY: u16 = 1 << 1;
pub const EFLAG_SEND_FLUSH: u16 = 1 << 2;
pub const EFLAG_SEND_FUA: u16 = 1 << 3;
pub const EFLAG_SEND_TRIM: u16 = 1 << 5;
pub const EFLAG_SEND_WRITE_ZEROES: u16 = 1 << 6;
pub const EFLAG_SEND_DF: u16 = 1 << 7;
pub const EFLAG_CAN_MULTI_CONN: u16 = 1 << 8;
pub const EFLAG_SEND_CACHE: u16 = 1 << 10;
pub const EFLAG_SEND_FAST_ZERO: u16 = 1 << 11;

pub const DEFAULT_EFLAGS: u16 = EFLAG_HAS_FLAGS
    | EFLAG_SEND_FLUSH
    | EFLAG_SEND_FUA
    | EFLAG_SEND_TRIM
    | EFLAG_SEND_WRITE_ZEROES
    | EFLAG_SEND_DF
    | EFLAG_CAN_MULTI_CONN
    | EFLAG_SEND_CACHE
    | EFLAG_SEND_FAST_ZERO;

pub type SharedDisk = Arc<Mutex<Vec<u8>>>;

/// How the server answers READ when structured replies are negotiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadPlan {
    /// Always a simple reply.
    Simple,
    /// Chunked replies reflecting the configured hole map.
    Chunked,
    /// Send the same data chunk twice (overlap violation).
    Overlap,
    /// Cover only the first half of the range, then claim completion.
    Gap,
    /// Fail every read with an error chunk at the request offset.
    ErrorChunk,
    /// Simple reply carrying a cookie that was never issued.
    WrongCookie,
}

#[derive(Clone)]
pub struct ServerConfig {
    pub size: u64,
    pub oldstyle: bool,
    pub allow_structured: bool,
    pub support_go: bool,
    pub eflags: u16,
    /// (name, description); the first entry is the export actually
    /// served.
    pub exports: Vec<(String, String)>,
    /// Metadata context names served, ids assigned starting at 1.
    pub contexts: Vec<String>,
    pub block_size: Option<(u32, u32, u32)>,
    pub description: Option<String>,
    pub read_plan: ReadPlan,
    /// Ranges treated as holes by the Chunked plan.
    pub holes: Vec<(u64, u64)>,
    /// Never answer transmission commands (for timeout tests).
    pub hang: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            size: 1024 * 1024,
            oldstyle: false,
            allow_structured: true,
            support_go: true,
            eflags: DEFAULT_EFLAGS,
            exports: vec![(String::new(), String::new())],
            contexts: Vec::new(),
            block_size: None,
            description: None,
            read_plan: ReadPlan::Simple,
            holes: Vec::new(),
            hang: false,
        }
    }
}

pub struct ServerThread(Option<JoinHandle<()>>);

impl ServerThread {
    pub fn join(mut self) {
        if let Some(t) = self.0.take() {
            let _ = t.join();
        }
    }
}

impl Drop for ServerThread {
    fn drop(&mut self) {
        if let Some(t) = self.0.take() {
            let _ = t.join();
        }
    }
}

pub fn new_disk(size: u64) -> SharedDisk {
    Arc::new(Mutex::new(vec![0; size as usize]))
}

/// Serve one connection on the other end of a socketpair. Returns the
/// client's end.
pub fn serve_pair_with_disk(cfg: ServerConfig, disk: SharedDisk) -> Result<(OwnedFd, ServerThread)> {
    let (client, server) = UnixStream::pair()?;
    let t = thread::spawn(move || {
        let mut stream = server;
        if let Err(e) = serve_conn(&mut stream, &cfg, &disk) {
            // disconnects mid-test are routine for the negative tests
            log::debug!("test server exited: {e}");
        }
    });
    Ok((OwnedFd::from(client), ServerThread(Some(t))))
}

pub fn serve_pair(cfg: ServerConfig) -> Result<(OwnedFd, ServerThread)> {
    let disk = new_disk(cfg.size);
    serve_pair_with_disk(cfg, disk)
}

/// A handle connected (socket adopted, handshake not yet driven) to a
/// fresh server.
pub fn connect_handle(cfg: ServerConfig) -> Result<(Handle, ServerThread)> {
    let disk = new_disk(cfg.size);
    connect_handle_with_disk(cfg, disk)
}

pub fn connect_handle_with_disk(
    cfg: ServerConfig,
    disk: SharedDisk,
) -> Result<(Handle, ServerThread)> {
    let (fd, server) = serve_pair_with_disk(cfg, disk)?;
    let mut handle = Handle::new();
    handle.connect_socket(fd)?;
    Ok((handle, server))
}

/// Serve `conns` connections over TCP on an ephemeral port, all backed
/// by one disk.
pub fn serve_tcp(cfg: ServerConfig, conns: usize) -> Result<(u16, SharedDisk, ServerThread)> {
    let listener = TcpListener::bind(("127.0.0.1", 0))?;
    let port = listener.local_addr()?.port();
    let disk = new_disk(cfg.size);
    let served = Arc::clone(&disk);
    let t = thread::spawn(move || {
        let mut workers = Vec::new();
        for _ in 0..conns {
            let Ok((mut stream, _)) = listener.accept() else {
                break;
            };
            let cfg = cfg.clone();
            let disk = Arc::clone(&served);
            workers.push(thread::spawn(move || {
                stream.set_nodelay(true).ok();
                if let Err(e) = serve_conn(&mut stream, &cfg, &disk) {
                    log::debug!("test server exited: {e}");
                }
            }));
        }
        for w in workers {
            let _ = w.join();
        }
    });
    Ok((port, disk, ServerThread(Some(t))))
}

// ---- protocol plumbing ----

fn serve_conn<S: Read + Write>(stream: &mut S, cfg: &ServerConfig, disk: &SharedDisk) -> Result<()> {
    if cfg.oldstyle {
        stream.write_u64::<BE>(MAGIC)?;
        stream.write_u64::<BE>(OLD_VERSION)?;
        stream.write_u64::<BE>(cfg.size)?;
        stream.write_u32::<BE>(cfg.eflags as u32)?;
        stream.write_all(&[0u8; 124])?;
        stream.flush()?;
        return handle_ops(stream, cfg, disk, false);
    }

    stream.write_u64::<BE>(MAGIC)?;
    stream.write_u64::<BE>(IHAVEOPT)?;
    stream.write_u16::<BE>(FLAG_FIXED_NEWSTYLE | FLAG_NO_ZEROES)?;
    stream.flush()?;
    let cflags = stream.read_u32::<BE>()?;
    let no_zeroes = cflags & u32::from(FLAG_NO_ZEROES) != 0;

    let mut structured = false;
    loop {
        let magic = stream.read_u64::<BE>()?;
        if magic != IHAVEOPT {
            bail!("bad option magic {magic:#x}");
        }
        let opt = stream.read_u32::<BE>()?;
        let len = stream.read_u32::<BE>()? as usize;
        let mut payload = vec![0; len];
        stream.read_exact(&mut payload)?;

        match opt {
            OPT_STARTTLS => {
                opt_reply(stream, opt, REP_ERR_POLICY, b"TLS is not configured")?;
            }
            OPT_STRUCTURED_REPLY => {
                if cfg.allow_structured {
                    structured = true;
                    opt_reply(stream, opt, REP_ACK, &[])?;
                } else {
                    opt_reply(stream, opt, REP_ERR_UNSUP, &[])?;
                }
            }
            OPT_SET_META_CONTEXT | OPT_LIST_META_CONTEXT => {
                let queries = parse_meta_payload(&payload)?;
                let mut id = 0u32;
                for ctx in &cfg.contexts {
                    id += 1;
                    let matched = if opt == OPT_LIST_META_CONTEXT && queries.is_empty() {
                        true
                    } else {
                        queries.iter().any(|q| q == ctx || ctx.starts_with(q))
                    };
                    if matched {
                        let mut data = Vec::new();
                        data.write_u32::<BE>(id)?;
                        data.write_all(ctx.as_bytes())?;
                        opt_reply(stream, opt, REP_META_CONTEXT, &data)?;
                    }
                }
                opt_reply(stream, opt, REP_ACK, &[])?;
            }
            OPT_GO | OPT_INFO => {
                if !cfg.support_go {
                    opt_reply(stream, opt, REP_ERR_UNSUP, &[])?;
                    continue;
                }
                let (name, infos) = parse_go_payload(&payload)?;
                if name != cfg.exports[0].0 {
                    opt_reply(stream, opt, REP_ERR_UNKNOWN, b"no such export")?;
                    continue;
                }
                let mut data = Vec::new();
                data.write_u16::<BE>(INFO_EXPORT)?;
                data.write_u64::<BE>(cfg.size)?;
                data.write_u16::<BE>(cfg.eflags)?;
                opt_reply(stream, opt, REP_INFO, &data)?;
                if let Some((min, pref, max)) = cfg.block_size {
                    if infos.contains(&INFO_BLOCK_SIZE) {
                        let mut data = Vec::new();
                        data.write_u16::<BE>(INFO_BLOCK_SIZE)?;
                        data.write_u32::<BE>(min)?;
                        data.write_u32::<BE>(pref)?;
                        data.write_u32::<BE>(max)?;
                        opt_reply(stream, opt, REP_INFO, &data)?;
                    }
                }
                if infos.contains(&INFO_NAME) {
                    let mut data = Vec::new();
                    data.write_u16::<BE>(INFO_NAME)?;
                    data.write_all(cfg.exports[0].0.as_bytes())?;
                    opt_reply(stream, opt, REP_INFO, &data)?;
                }
                if let Some(desc) = &cfg.description {
                    if infos.contains(&INFO_DESCRIPTION) {
                        let mut data = Vec::new();
                        data.write_u16::<BE>(INFO_DESCRIPTION)?;
                        data.write_all(desc.as_bytes())?;
                        opt_reply(stream, opt, REP_INFO, &data)?;
                    }
                }
                opt_reply(stream, opt, REP_ACK, &[])?;
                if opt == OPT_GO {
                    return handle_ops(stream, cfg, disk, structured);
                }
            }
            OPT_EXPORT_NAME => {
                stream.write_u64::<BE>(cfg.size)?;
                stream.write_u16::<BE>(cfg.eflags)?;
                if !no_zeroes {
                    stream.write_all(&[0u8; 124])?;
                }
                stream.flush()?;
                return handle_ops(stream, cfg, disk, structured);
            }
            OPT_LIST => {
                for (name, desc) in &cfg.exports {
                    let mut data = Vec::new();
                    data.write_u32::<BE>(name.len() as u32)?;
                    data.write_all(name.as_bytes())?;
                    data.write_all(desc.as_bytes())?;
                    opt_reply(stream, opt, REP_SERVER, &data)?;
                }
                opt_reply(stream, opt, REP_ACK, &[])?;
            }
            OPT_ABORT => {
                let _ = opt_reply(stream, opt, REP_ACK, &[]);
                return Ok(());
            }
            _ => {
                opt_reply(stream, opt, REP_ERR_UNSUP, &[])?;
            }
        }
    }
}

fn opt_reply<S: Write>(stream: &mut S, opt: u32, rep: u32, payload: &[u8]) -> io::Result<()> {
    stream.write_u64::<BE>(REPLY_MAGIC)?;
    stream.write_u32::<BE>(opt)?;
    stream.write_u32::<BE>(rep)?;
    stream.write_u32::<BE>(payload.len() as u32)?;
    stream.write_all(payload)?;
    stream.flush()
}

fn parse_go_payload(payload: &[u8]) -> Result<(String, Vec<u16>)> {
    let mut r = payload;
    let name_len = r.read_u32::<BE>()? as usize;
    let mut name = vec![0; name_len];
    r.read_exact(&mut name)?;
    let nr = r.read_u16::<BE>()?;
    let mut infos = Vec::new();
    for _ in 0..nr {
        infos.push(r.read_u16::<BE>()?);
    }
    Ok((String::from_utf8(name)?, infos))
}

fn parse_meta_payload(payload: &[u8]) -> Result<Vec<String>> {
    let mut r = payload;
    let name_len = r.read_u32::<BE>()? as usize;
    let mut name = vec![0; name_len];
    r.read_exact(&mut name)?;
    let nr = r.read_u32::<BE>()?;
    let mut queries = Vec::new();
    for _ in 0..nr {
        let qlen = r.read_u32::<BE>()? as usize;
        let mut q = vec![0; qlen];
        r.read_exact(&mut q)?;
        queries.push(String::from_utf8(q)?);
    }
    Ok(queries)
}

fn simple_reply<S: Write>(stream: &mut S, err: u32, cookie: u64, data: &[u8]) -> io::Result<()> {
    stream.write_u32::<BE>(SIMPLE_REPLY_MAGIC)?;
    stream.write_u32::<BE>(err)?;
    stream.write_u64::<BE>(cookie)?;
    stream.write_all(data)?;
    stream.flush()
}

fn chunk<S: Write>(
    stream: &mut S,
    flags: u16,
    typ: u16,
    cookie: u64,
    payload: &[u8],
) -> io::Result<()> {
    stream.write_u32::<BE>(STRUCTURED_REPLY_MAGIC)?;
    stream.write_u16::<BE>(flags)?;
    stream.write_u16::<BE>(typ)?;
    stream.write_u64::<BE>(cookie)?;
    stream.write_u32::<BE>(payload.len() as u32)?;
    stream.write_all(payload)?;
    stream.flush()
}

fn offset_data_payload(offset: u64, data: &[u8]) -> Vec<u8> {
    let mut p = Vec::with_capacity(8 + data.len());
    p.extend_from_slice(&offset.to_be_bytes());
    p.extend_from_slice(data);
    p
}

/// Split `[offset, offset+count)` into data/hole segments per the hole
/// map.
fn segments(cfg: &ServerConfig, offset: u64, count: u32) -> Vec<(u64, u64, bool)> {
    let end = offset + count as u64;
    let mut cuts = vec![offset, end];
    for &(h_off, h_len) in &cfg.holes {
        for edge in [h_off, h_off + h_len] {
            if edge > offset && edge < end {
                cuts.push(edge);
            }
        }
    }
    cuts.sort_unstable();
    cuts.dedup();
    cuts.windows(2)
        .map(|w| {
            let is_hole = cfg
                .holes
                .iter()
                .any(|&(h_off, h_len)| w[0] >= h_off && w[1] <= h_off + h_len);
            (w[0], w[1] - w[0], is_hole)
        })
        .collect()
}

fn structured_read<S: Write>(
    stream: &mut S,
    cfg: &ServerConfig,
    disk: &SharedDisk,
    cookie: u64,
    offset: u64,
    count: u32,
    df: bool,
) -> io::Result<()> {
    let data = {
        let disk = disk.lock().unwrap();
        disk[offset as usize..(offset + count as u64) as usize].to_vec()
    };
    match cfg.read_plan {
        ReadPlan::Overlap => {
            let p = offset_data_payload(offset, &data);
            chunk(stream, 0, CHUNK_OFFSET_DATA, cookie, &p)?;
            chunk(stream, 0, CHUNK_OFFSET_DATA, cookie, &p)?;
            chunk(stream, REPLY_FLAG_DONE, CHUNK_NONE, cookie, &[])
        }
        ReadPlan::Gap => {
            let half = (count / 2) as usize;
            let p = offset_data_payload(offset, &data[..half]);
            chunk(stream, 0, CHUNK_OFFSET_DATA, cookie, &p)?;
            chunk(stream, REPLY_FLAG_DONE, CHUNK_NONE, cookie, &[])
        }
        ReadPlan::ErrorChunk => {
            let mut p = Vec::new();
            p.extend_from_slice(&5u32.to_be_bytes()); // EIO
            p.extend_from_slice(&0u16.to_be_bytes());
            p.extend_from_slice(&offset.to_be_bytes());
            chunk(stream, 0, CHUNK_ERROR_OFFSET, cookie, &p)?;
            chunk(stream, REPLY_FLAG_DONE, CHUNK_NONE, cookie, &[])
        }
        _ if df => {
            let p = offset_data_payload(offset, &data);
            chunk(stream, REPLY_FLAG_DONE, CHUNK_OFFSET_DATA, cookie, &p)
        }
        _ => {
            let segs = segments(cfg, offset, count);
            let last = segs.len() - 1;
            for (i, &(s_off, s_len, is_hole)) in segs.iter().enumerate() {
                let flags = if i == last { REPLY_FLAG_DONE } else { 0 };
                if is_hole {
                    let mut p = Vec::new();
                    p.extend_from_slice(&s_off.to_be_bytes());
                    p.extend_from_slice(&(s_len as u32).to_be_bytes());
                    chunk(stream, flags, CHUNK_OFFSET_HOLE, cookie, &p)?;
                } else {
                    let at = (s_off - offset) as usize;
                    let p = offset_data_payload(s_off, &data[at..at + s_len as usize]);
                    chunk(stream, flags, CHUNK_OFFSET_DATA, cookie, &p)?;
                }
            }
            Ok(())
        }
    }
}

fn block_status_reply<S: Write>(
    stream: &mut S,
    cfg: &ServerConfig,
    cookie: u64,
    count: u32,
    req_one: bool,
) -> io::Result<()> {
    let nr = cfg.contexts.len();
    for (i, _) in cfg.contexts.iter().enumerate() {
        let id = (i + 1) as u32;
        let mut p = Vec::new();
        p.extend_from_slice(&id.to_be_bytes());
        if req_one || count < 2 {
            p.extend_from_slice(&count.to_be_bytes());
            p.extend_from_slice(&0u32.to_be_bytes());
        } else {
            // two extents that add up to the requested length
            let first = count / 2;
            p.extend_from_slice(&first.to_be_bytes());
            p.extend_from_slice(&0u32.to_be_bytes());
            p.extend_from_slice(&(count - first).to_be_bytes());
            p.extend_from_slice(&1u32.to_be_bytes());
        }
        let flags = if i == nr - 1 { REPLY_FLAG_DONE } else { 0 };
        chunk(stream, flags, CHUNK_BLOCK_STATUS, cookie, &p)?;
    }
    Ok(())
}

fn handle_ops<S: Read + Write>(
    stream: &mut S,
    cfg: &ServerConfig,
    disk: &SharedDisk,
    structured: bool,
) -> Result<()> {
    loop {
        let magic = stream.read_u32::<BE>()?;
        if magic != REQUEST_MAGIC {
            bail!("bad request magic {magic:#x}");
        }
        let flags = stream.read_u16::<BE>()?;
        let typ = stream.read_u16::<BE>()?;
        let cookie = stream.read_u64::<BE>()?;
        let offset = stream.read_u64::<BE>()?;
        let count = stream.read_u32::<BE>()?;
        let mut wdata = Vec::new();
        if typ == CMD_WRITE {
            wdata = vec![0; count as usize];
            stream.read_exact(&mut wdata)?;
        }
        if cfg.hang {
            thread::sleep(Duration::from_secs(2));
            return Ok(());
        }
        match typ {
            CMD_READ => {
                if cfg.read_plan == ReadPlan::WrongCookie {
                    simple_reply(stream, 0, cookie.wrapping_add(1), &vec![0; count as usize])?;
                    continue;
                }
                if structured && cfg.read_plan != ReadPlan::Simple {
                    let df = flags & CMD_FLAG_DF != 0;
                    structured_read(stream, cfg, disk, cookie, offset, count, df)?;
                } else {
                    let data = {
                        let disk = disk.lock().unwrap();
                        disk[offset as usize..(offset + count as u64) as usize].to_vec()
                    };
                    simple_reply(stream, 0, cookie, &data)?;
                }
            }
            CMD_WRITE => {
                {
                    let mut disk = disk.lock().unwrap();
                    let at = offset as usize;
                    disk[at..at + wdata.len()].copy_from_slice(&wdata);
                }
                simple_reply(stream, 0, cookie, &[])?;
            }
            CMD_FLUSH | CMD_CACHE => {
                simple_reply(stream, 0, cookie, &[])?;
            }
            CMD_TRIM | CMD_WRITE_ZEROES => {
                {
                    let mut disk = disk.lock().unwrap();
                    let at = offset as usize;
                    disk[at..at + count as usize].fill(0);
                }
                simple_reply(stream, 0, cookie, &[])?;
            }
            CMD_BLOCK_STATUS => {
                block_status_reply(stream, cfg, cookie, count, flags & CMD_FLAG_REQ_ONE != 0)?;
            }
            CMD_DISC => return Ok(()),
            _ => {
                simple_reply(stream, 95, cookie, &[])?; // ENOTSUP
            }
        }
    }
}
