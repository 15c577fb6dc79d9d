//! Option-mode tests: LIST, INFO, GO, ABORT, structured replies and
//! metadata contexts negotiated one option at a time.

mod common;

use std::sync::{Arc, Mutex};

use color_eyre::Result;
use nix::errno::Errno;

use common::ServerConfig;
use nbd_client::{CmdFlag, ErrorKind, Handle, ListCallback};

fn two_export_config() -> ServerConfig {
    ServerConfig {
        contexts: vec!["base:allocation".to_string()],
        exports: vec![
            ("disk1".to_string(), "first disk".to_string()),
            ("disk2".to_string(), "second disk".to_string()),
        ],
        ..Default::default()
    }
}

fn negotiating_handle(cfg: ServerConfig) -> Result<(Handle, common::ServerThread)> {
    let (fd, server) = common::serve_pair(cfg)?;
    let mut h = Handle::new();
    h.set_opt_mode(true)?;
    h.connect_socket(fd)?;
    Ok((h, server))
}

#[test]
fn opt_mode_parks_after_the_greeting() -> Result<()> {
    let (h, _server) = negotiating_handle(two_export_config())?;
    assert!(h.aio_is_negotiating());
    assert!(!h.aio_is_ready());
    // no export facts are known yet
    assert!(h.get_size().is_err());
    Ok(())
}

#[test]
fn opt_list_enumerates_exports() -> Result<()> {
    let (mut h, _server) = negotiating_handle(two_export_config())?;
    let seen: Arc<Mutex<Vec<(String, String)>>> = Default::default();
    let sink = Arc::clone(&seen);
    let cb: ListCallback = Box::new(move |name, desc| {
        sink.lock().unwrap().push((name.to_string(), desc.to_string()));
    });
    let n = h.opt_list(cb)?;
    assert_eq!(n, 2);
    let seen = seen.lock().unwrap();
    assert_eq!(seen[0], ("disk1".to_string(), "first disk".to_string()));
    assert_eq!(seen[1], ("disk2".to_string(), "second disk".to_string()));
    assert!(h.aio_is_negotiating());
    Ok(())
}

#[test]
fn opt_info_probes_without_selecting() -> Result<()> {
    let (mut h, _server) = negotiating_handle(two_export_config())?;
    h.set_export_name("disk1")?;
    h.opt_info()?;
    assert_eq!(h.get_size()?, 1024 * 1024);
    assert!(h.aio_is_negotiating());
    Ok(())
}

#[test]
fn opt_go_enters_transmission() -> Result<()> {
    let cfg = two_export_config();
    let disk = common::new_disk(cfg.size);
    disk.lock().unwrap()[0..6].copy_from_slice(b"hello!");
    let (fd, _server) = common::serve_pair_with_disk(cfg, disk)?;
    let mut h = Handle::new();
    h.set_opt_mode(true)?;
    h.set_export_name("disk1")?;
    h.connect_socket(fd)?;

    h.opt_structured_reply()?;
    h.opt_go()?;
    assert!(h.aio_is_ready());
    let mut buf = [0u8; 6];
    h.pread(&mut buf, 0, CmdFlag::empty())?;
    assert_eq!(&buf, b"hello!");
    Ok(())
}

#[test]
fn opt_go_unknown_export_keeps_negotiating() -> Result<()> {
    let (mut h, _server) = negotiating_handle(two_export_config())?;
    h.set_export_name("missing")?;
    let err = h.opt_go().unwrap_err();
    assert_eq!(err.errno(), Errno::ENOENT as i32);
    assert!(h.aio_is_negotiating());

    // recover by picking an export that exists
    h.set_export_name("disk1")?;
    h.opt_structured_reply()?;
    h.opt_go()?;
    assert!(h.aio_is_ready());
    Ok(())
}

#[test]
fn opt_structured_reply_and_meta_contexts() -> Result<()> {
    let (mut h, _server) = negotiating_handle(two_export_config())?;
    h.set_export_name("disk1")?;
    assert!(h.opt_structured_reply()?);
    assert!(h.get_structured_replies_negotiated());

    let names: Arc<Mutex<Vec<String>>> = Default::default();
    let sink = Arc::clone(&names);
    let n = h.opt_set_meta_context(Box::new(move |name| {
        sink.lock().unwrap().push(name.to_string());
    }))?;
    assert_eq!(n, 1);
    assert_eq!(names.lock().unwrap().as_slice(), &["base:allocation"]);
    assert!(h.can_meta_context("base:allocation")?);
    Ok(())
}

#[test]
fn opt_list_meta_context_queries_lists_all() -> Result<()> {
    let (mut h, _server) = negotiating_handle(two_export_config())?;
    h.set_export_name("disk1")?;
    h.opt_structured_reply()?;
    let names: Arc<Mutex<Vec<String>>> = Default::default();
    let sink = Arc::clone(&names);
    let n = h.opt_list_meta_context_queries(
        Vec::new(),
        Box::new(move |name| {
            sink.lock().unwrap().push(name.to_string());
        }),
    )?;
    assert_eq!(n, 1);
    assert_eq!(names.lock().unwrap().as_slice(), &["base:allocation"]);
    Ok(())
}

#[test]
fn opt_starttls_reports_refusal() -> Result<()> {
    let (mut h, _server) = negotiating_handle(two_export_config())?;
    assert!(!h.opt_starttls()?);
    assert!(!h.get_tls_negotiated());
    assert!(h.aio_is_negotiating());
    Ok(())
}

#[test]
fn opt_abort_closes_cleanly() -> Result<()> {
    let (mut h, _server) = negotiating_handle(two_export_config())?;
    h.opt_abort()?;
    assert!(h.aio_is_closed());
    let mut buf = [0u8; 16];
    let err = h.pread(&mut buf, 0, CmdFlag::empty()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotConnected);
    Ok(())
}

#[test]
fn options_require_negotiation_state() -> Result<()> {
    // a handle connected without option mode is already in transmission
    let (mut h, _server) = common::connect_handle(ServerConfig::default())?;
    let err = h.opt_go().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    Ok(())
}
