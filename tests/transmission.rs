//! Transmission-phase tests: the command pipeline, strict mode,
//! interleaved sends and receives, shutdown semantics, callback
//! lifetimes.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use color_eyre::eyre::ensure;
use color_eyre::Result;
use nix::errno::Errno;
use rand::Rng;
use serial_test::serial;

use common::{ReadPlan, ServerConfig};
use nbd_client::{CmdFlag, CompletionCallback, ErrorKind, Handle, ShutdownFlags, StrictFlags};

/// Increments a counter when dropped; stands in for a callback release
/// hook.
struct ReleaseGuard(Arc<AtomicUsize>);

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

fn recording_completion(
    errors: &Arc<Mutex<Vec<i32>>>,
    released: &Arc<AtomicUsize>,
) -> CompletionCallback {
    let errors = Arc::clone(errors);
    let guard = ReleaseGuard(Arc::clone(released));
    Box::new(move |_buf, err| {
        let _ = &guard;
        errors.lock().unwrap().push(*err);
        0
    })
}

#[test]
fn pread_first_sector_and_shutdown() -> Result<()> {
    let cfg = ServerConfig::default();
    let disk = common::new_disk(cfg.size);
    for (i, b) in disk.lock().unwrap()[..512].iter_mut().enumerate() {
        *b = (i % 251) as u8;
    }
    let (mut h, server) = common::connect_handle_with_disk(cfg, Arc::clone(&disk))?;

    let mut buf = vec![0u8; 512];
    h.pread(&mut buf, 0, CmdFlag::empty())?;
    for (i, b) in buf.iter().enumerate() {
        ensure!(*b == (i % 251) as u8, "byte {i} differs");
    }
    h.shutdown(ShutdownFlags::empty())?;
    assert!(h.aio_is_closed());
    drop(h);
    server.join();
    Ok(())
}

#[test]
fn pwrite_then_pread_roundtrip() -> Result<()> {
    let cfg = ServerConfig::default();
    let disk = common::new_disk(cfg.size);
    let (mut h, _server) = common::connect_handle_with_disk(cfg, Arc::clone(&disk))?;

    let mut rng = rand::thread_rng();
    let data: Vec<u8> = (0..4096).map(|_| rng.gen()).collect();
    h.pwrite(&data, 8192, CmdFlag::empty())?;
    h.flush()?;

    // the bytes that crossed the wire are byte-identical to the buffer
    assert_eq!(&disk.lock().unwrap()[8192..8192 + 4096], &data[..]);

    let mut back = vec![0u8; 4096];
    h.pread(&mut back, 8192, CmdFlag::empty())?;
    assert_eq!(back, data);
    Ok(())
}

#[test]
fn fua_write_is_accepted() -> Result<()> {
    let (mut h, _server) = common::connect_handle(ServerConfig::default())?;
    assert!(h.can_fua()?);
    h.pwrite(&[7u8; 512], 0, CmdFlag::FUA)?;
    Ok(())
}

#[test]
fn batched_read_and_write_do_not_deadlock() -> Result<()> {
    // a read and a write of half the export each, issued back to back
    // and driven purely by the direction hint
    let cfg = ServerConfig {
        size: 2 * 1024 * 1024,
        ..Default::default()
    };
    let packet = (cfg.size / 2) as usize;
    let disk = common::new_disk(cfg.size);
    for (i, b) in disk.lock().unwrap()[..packet].iter_mut().enumerate() {
        *b = (i % 253) as u8;
    }
    let (mut h, _server) = common::connect_handle_with_disk(cfg, Arc::clone(&disk))?;

    let read_data: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&read_data);
    let read_completion: CompletionCallback = Box::new(move |buf, _err| {
        *sink.lock().unwrap() = std::mem::take(buf);
        0
    });
    let rc = h.aio_pread(vec![0; packet], 0, Some(read_completion), CmdFlag::empty())?;
    let wc = h.aio_pwrite(
        vec![0xAB; packet],
        packet as u64,
        None,
        CmdFlag::empty(),
    )?;
    assert_eq!(h.aio_in_flight(), 2);

    common::drive_until(&mut h, Duration::from_secs(10), |h| {
        h.aio_in_flight() == 0
    })?;
    assert!(h.aio_command_completed(rc)?);
    assert!(h.aio_command_completed(wc)?);

    let read_data = read_data.lock().unwrap();
    ensure!(read_data.len() == packet);
    for (i, b) in read_data.iter().enumerate() {
        ensure!(*b == (i % 253) as u8, "read byte {i} differs");
    }
    assert!(disk.lock().unwrap()[packet..].iter().all(|&b| b == 0xAB));
    Ok(())
}

#[test]
#[serial]
fn parallel_connections_all_retire() -> Result<()> {
    let cfg = ServerConfig {
        size: 2 * 1024 * 1024,
        ..Default::default()
    };
    const THREADS: usize = 4;
    const OPS: usize = 2000;
    let (port, _disk, server) = common::serve_tcp(cfg, THREADS)?;

    let mut workers = Vec::new();
    for _ in 0..THREADS {
        workers.push(thread::spawn(move || -> Result<()> {
            let mut h = Handle::new();
            h.connect_tcp("127.0.0.1", port)?;
            ensure!(h.can_multi_conn()?);
            let mut rng = rand::thread_rng();
            let mut buf = vec![0u8; 512];
            for _ in 0..OPS {
                let offset = u64::from(rng.gen_range(0..2048u32)) * 512;
                if rng.gen_bool(0.5) {
                    h.pread(&mut buf, offset, CmdFlag::empty())?;
                } else {
                    h.pwrite(&buf, offset, CmdFlag::empty())?;
                }
                ensure!(h.aio_in_flight() == 0);
            }
            h.shutdown(ShutdownFlags::empty())?;
            Ok(())
        }));
    }
    for w in workers {
        w.join().expect("worker panicked")?;
    }
    server.join();
    Ok(())
}

#[test]
fn strict_mode_rejects_bad_requests() -> Result<()> {
    let (mut h, _server) = common::connect_handle(ServerConfig::default())?;
    let size = h.get_size()?;

    // zero-length I/O
    let err = h.pread(&mut [], 0, CmdFlag::empty()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    assert_eq!(h.get_errno(), Errno::EINVAL as i32);

    // out of bounds
    let mut one = [0u8; 1];
    h.pread(&mut one, size - 1, CmdFlag::empty())?;
    let err = h.pread(&mut one, size, CmdFlag::empty()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    // flag not meaningful for the command
    let err = h.pwrite(&[0u8; 512], 0, CmdFlag::DF).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    // with the zero-size check disabled the request goes out and the
    // server answers it
    h.set_strict_mode(StrictFlags::default() - StrictFlags::ZERO_SIZE);
    h.pread(&mut [], 4096, CmdFlag::empty())?;
    Ok(())
}

#[test]
fn strict_mode_requires_advertised_capabilities() -> Result<()> {
    let cfg = ServerConfig {
        eflags: common::EFLAG_HAS_FLAGS | common::EFLAG_SEND_FLUSH,
        ..Default::default()
    };
    let (mut h, _server) = common::connect_handle(cfg)?;
    assert!(!h.can_trim()?);

    let err = h.trim(4096, 0, CmdFlag::empty()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unsupported);
    assert_eq!(h.get_errno(), Errno::ENOTSUP as i32);

    let err = h.zero(4096, 0, CmdFlag::empty()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unsupported);

    // probing is possible with the check disabled; this server happens
    // to honor trim anyway
    h.set_strict_mode(StrictFlags::default() - StrictFlags::COMMANDS);
    h.trim(4096, 0, CmdFlag::empty())?;
    Ok(())
}

#[test]
fn blocking_helper_honors_timeout() -> Result<()> {
    let cfg = ServerConfig {
        hang: true,
        ..Default::default()
    };
    let (mut h, _server) = common::connect_handle(cfg)?;
    h.set_timeout(Some(Duration::from_millis(150)));
    let mut buf = [0u8; 512];
    let err = h.pread(&mut buf, 0, CmdFlag::empty()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert_eq!(h.get_errno(), Errno::ETIMEDOUT as i32);
    // the engine itself is unharmed; the command is still in flight
    assert!(!h.aio_is_dead());
    assert_eq!(h.aio_in_flight(), 1);
    Ok(())
}

#[test]
fn shutdown_abandons_unsent_commands() -> Result<()> {
    let cfg = ServerConfig {
        size: 4 * 1024 * 1024,
        ..Default::default()
    };
    let (mut h, _server) = common::connect_handle(cfg)?;

    let errors = Arc::new(Mutex::new(Vec::new()));
    let released = Arc::new(AtomicUsize::new(0));

    // two back-to-back large writes; the first starts transmitting
    // immediately, the second is still queued when we shut down
    let c1 = h.aio_pwrite(
        vec![1; 2 * 1024 * 1024],
        0,
        Some(recording_completion(&errors, &released)),
        CmdFlag::empty(),
    )?;
    let c2 = h.aio_pwrite(
        vec![2; 2 * 1024 * 1024],
        0,
        Some(recording_completion(&errors, &released)),
        CmdFlag::empty(),
    )?;
    assert_ne!(c1, c2);

    h.shutdown(ShutdownFlags::ABANDON_PENDING)?;
    assert!(h.aio_is_closed() || h.aio_is_dead());

    // both commands retired exactly once and nothing leaked
    let errors = errors.lock().unwrap();
    assert_eq!(errors.len(), 2);
    // the abandoned write fails with "not connected"
    assert!(errors.contains(&(Errno::ENOTCONN as i32)));
    assert_eq!(released.load(Ordering::SeqCst), 2);
    assert_eq!(h.aio_in_flight(), 0);
    Ok(())
}

#[test]
fn handle_drop_releases_pending_callbacks() -> Result<()> {
    let cfg = ServerConfig {
        hang: true,
        ..Default::default()
    };
    let (mut h, _server) = common::connect_handle(cfg)?;

    let errors = Arc::new(Mutex::new(Vec::new()));
    let released = Arc::new(AtomicUsize::new(0));
    h.aio_pwrite(
        vec![0; 4096],
        0,
        Some(recording_completion(&errors, &released)),
        CmdFlag::empty(),
    )?;
    drop(h);

    // the completion ran exactly once, with the not-connected error,
    // and its release hook fired exactly once
    let errors = errors.lock().unwrap();
    assert_eq!(errors.as_slice(), &[Errno::ENOTCONN as i32]);
    assert_eq!(released.load(Ordering::SeqCst), 1);
    Ok(())
}

#[test]
fn cookies_are_unique_and_monotonic() -> Result<()> {
    let (mut h, _server) = common::connect_handle(ServerConfig::default())?;
    let mut last = 0;
    for _ in 0..100 {
        let cookie = h.aio_flush(None)?;
        assert!(cookie > last, "cookie {cookie} not monotonic");
        last = cookie;
    }
    common::drive_until(&mut h, Duration::from_secs(5), |h| h.aio_in_flight() == 0)?;
    // retire everything; each cookie appears exactly once on the done
    // queue
    let mut seen = std::collections::HashSet::new();
    while let Some(cookie) = h.aio_peek_command_completed() {
        assert!(seen.insert(cookie));
        assert!(h.aio_command_completed(cookie)?);
    }
    assert_eq!(seen.len(), 100);
    Ok(())
}

#[test]
fn command_completed_reports_pending_commands() -> Result<()> {
    let (mut h, _server) = common::connect_handle(ServerConfig::default())?;
    let cookie = h.aio_flush(None)?;
    // no notifications processed yet, so the command cannot be done
    assert!(!h.aio_command_completed(cookie)?);
    common::drive_until(&mut h, Duration::from_secs(5), |h| h.aio_in_flight() == 0)?;
    assert_eq!(h.aio_peek_command_completed(), Some(cookie));
    assert!(h.aio_command_completed(cookie)?);
    // a second retirement of the same cookie is a caller bug
    assert!(h.aio_command_completed(cookie).is_err());
    Ok(())
}

#[test]
fn untagged_simple_reply_kills_the_connection() -> Result<()> {
    let cfg = ServerConfig {
        allow_structured: false,
        read_plan: ReadPlan::WrongCookie,
        ..Default::default()
    };
    let (mut h, _server) = common::connect_handle(cfg)?;
    let mut buf = [0u8; 512];
    let err = h.pread(&mut buf, 0, CmdFlag::empty()).unwrap_err();
    assert!(matches!(
        err.kind(),
        ErrorKind::Protocol | ErrorKind::NotConnected
    ));
    assert!(h.aio_is_dead());
    // a dead handle accepts no further commands
    let err = h.flush().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotConnected);
    Ok(())
}
