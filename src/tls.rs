//! TLS transport: a rustls client session layered over the plain
//! transport.
//!
//! The session buffers partial TLS records internally, so the engine's
//! partial-progress model carries through unchanged: `recv`/`send` report
//! `WouldBlock` and the record plumbing catches up on the next readiness
//! event. During the handshake the session dictates the poll direction.

use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::os::unix::io::RawFd;
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;

use rustls::client::{ServerCertVerified, ServerCertVerifier};
use rustls::{Certificate, ClientConfig, ClientConnection, PrivateKey, RootCertStore, ServerName};

use crate::errors::{Error, ErrorKind};
use crate::state::Direction;
use crate::transport::PlainTransport;

/// TLS configuration accumulated on the handle before connecting.
#[derive(Default, Clone)]
pub(crate) struct TlsSettings {
    pub certificates: Option<std::path::PathBuf>,
    pub verify_peer: bool,
    pub username: Option<String>,
    pub psk_file: Option<std::path::PathBuf>,
    pub hostname: Option<String>,
}

impl TlsSettings {
    pub fn new() -> Self {
        TlsSettings {
            verify_peer: true,
            ..Default::default()
        }
    }
}

struct NoVerify;

impl ServerCertVerifier for NoVerify {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}

fn load_certs(path: &Path) -> io::Result<Vec<Certificate>> {
    let mut reader = BufReader::new(File::open(path)?);
    Ok(rustls_pemfile::certs(&mut reader)?
        .into_iter()
        .map(Certificate)
        .collect())
}

fn load_key(path: &Path) -> io::Result<Option<PrivateKey>> {
    let mut reader = BufReader::new(File::open(path)?);
    while let Some(item) = rustls_pemfile::read_one(&mut reader)? {
        match item {
            rustls_pemfile::Item::RSAKey(k)
            | rustls_pemfile::Item::PKCS8Key(k)
            | rustls_pemfile::Item::ECKey(k) => return Ok(Some(PrivateKey(k))),
            _ => continue,
        }
    }
    Ok(None)
}

fn config_error(context: &str, e: impl std::fmt::Display) -> Error {
    Error::new(ErrorKind::TlsRequired, format!("TLS setup: {context}: {e}"))
}

/// Build a client session from the handle's settings and wrap the plain
/// transport with it. Called only after the server has acknowledged
/// STARTTLS.
pub(crate) fn create_session(
    settings: &TlsSettings,
    plain: PlainTransport,
) -> Result<TlsTransport, Error> {
    if settings.psk_file.is_some() {
        return Err(Error::unsupported(
            "TLS-PSK authentication is not available; use certificates",
        ));
    }

    let mut roots = RootCertStore::empty();
    let mut client_auth = None;
    if let Some(dir) = &settings.certificates {
        for cert in load_certs(&dir.join("cacert.pem"))
            .map_err(|e| config_error("loading CA certificates", e))?
        {
            roots
                .add(&cert)
                .map_err(|e| config_error("adding CA certificate", e))?;
        }
        let cert_path = dir.join("cert.pem");
        let key_path = dir.join("key.pem");
        if cert_path.exists() && key_path.exists() {
            let certs =
                load_certs(&cert_path).map_err(|e| config_error("loading client certificate", e))?;
            let key = load_key(&key_path)
                .map_err(|e| config_error("loading client key", e))?
                .ok_or_else(|| Error::new(ErrorKind::TlsRequired, "no private key in key.pem"))?;
            client_auth = Some((certs, key));
        }
    } else {
        let native = rustls_native_certs::load_native_certs()
            .map_err(|e| config_error("loading system trust store", e))?;
        for cert in native {
            let _ = roots.add(&Certificate(cert.0));
        }
    }

    let builder = ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots);
    let mut config = match client_auth {
        Some((certs, key)) => builder
            .with_client_auth_cert(certs, key)
            .map_err(|e| config_error("client authentication", e))?,
        None => builder.with_no_client_auth(),
    };
    if !settings.verify_peer {
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(NoVerify));
    }

    let name = settings.hostname.as_deref().unwrap_or("localhost");
    let server_name = ServerName::try_from(name)
        .map_err(|e| config_error("invalid TLS hostname", e))?;
    let conn = ClientConnection::new(Arc::new(config), server_name)
        .map_err(|e| config_error("creating session", e))?;

    Ok(TlsTransport {
        plain,
        conn,
        plaintext_left: 0,
        close_notify_sent: false,
    })
}

/// The plain transport as `io::Read`/`io::Write` for rustls record I/O.
struct RecordIo<'a>(&'a mut PlainTransport);

impl Read for RecordIo<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.recv(buf)
    }
}

impl Write for RecordIo<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.send(buf, false)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn tls_io(e: rustls::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}

/// Outcome of one handshake step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HandshakeProgress {
    Done,
    /// Progress was made; step again immediately.
    Again,
    /// The socket must become ready before the next step.
    Blocked,
}

pub(crate) struct TlsTransport {
    plain: PlainTransport,
    conn: ClientConnection,
    /// Decrypted bytes known to be waiting in the session's plaintext
    /// buffer.
    plaintext_left: usize,
    close_notify_sent: bool,
}

impl TlsTransport {
    pub fn raw_fd(&self) -> RawFd {
        self.plain.raw_fd()
    }

    /// Push buffered TLS records toward the socket; stops (without error)
    /// when the socket stops accepting bytes.
    fn flush_records(&mut self) -> io::Result<()> {
        while self.conn.wants_write() {
            match self.conn.write_tls(&mut RecordIo(&mut self.plain)) {
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Pull TLS records from the socket and decrypt them. `Ok(true)` if the
    /// peer reached EOF.
    fn pump_records(&mut self) -> io::Result<bool> {
        match self.conn.read_tls(&mut RecordIo(&mut self.plain)) {
            Ok(0) => Ok(true),
            Ok(_) => {
                let state = self.conn.process_new_packets().map_err(tls_io)?;
                self.plaintext_left = state.plaintext_bytes_to_read();
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Run one step of the TLS handshake.
    pub fn handshake_step(&mut self) -> io::Result<HandshakeProgress> {
        if self.conn.is_handshaking() {
            if self.conn.wants_write() {
                match self.conn.write_tls(&mut RecordIo(&mut self.plain)) {
                    Ok(_) => {}
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        return Ok(HandshakeProgress::Blocked)
                    }
                    Err(e) => return Err(e),
                }
            } else {
                match self.pump_records() {
                    Ok(true) => {
                        return Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "server closed connection during TLS handshake",
                        ))
                    }
                    Ok(false) => {}
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        return Ok(HandshakeProgress::Blocked)
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        if !self.conn.is_handshaking() {
            // leftover flight data (session tickets etc.)
            self.flush_records()?;
            return Ok(HandshakeProgress::Done);
        }
        Ok(HandshakeProgress::Again)
    }

    /// During the handshake, whether the next step needs the socket
    /// readable (as opposed to writable).
    pub fn handshake_is_reading(&self) -> bool {
        self.conn.is_handshaking() && !self.conn.wants_write()
    }

    pub fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.conn.reader().read(buf) {
                Ok(n) => {
                    self.plaintext_left = self.plaintext_left.saturating_sub(n);
                    return Ok(n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if self.pump_records()? {
                        return Ok(0);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub fn send(&mut self, buf: &[u8], _more: bool) -> io::Result<usize> {
        // the session buffers plaintext up to its internal limit; 0 means
        // the records backing it up must drain first
        let n = self.conn.writer().write(buf)?;
        self.flush_records()?;
        if n == 0 && !buf.is_empty() {
            return Err(io::Error::from(io::ErrorKind::WouldBlock));
        }
        Ok(n)
    }

    pub fn pending_direction(&self) -> Direction {
        if self.conn.is_handshaking() {
            if self.conn.wants_write() {
                Direction::Write
            } else {
                Direction::Read
            }
        } else if self.conn.wants_write() {
            Direction::Write
        } else {
            Direction::None
        }
    }

    pub fn has_buffered_read(&self) -> bool {
        self.plaintext_left > 0
    }

    /// Queue a close-notify alert and shut the socket's write side once
    /// the alert is fully on the wire.
    pub fn shut_writes(&mut self) -> io::Result<bool> {
        if !self.close_notify_sent {
            self.conn.send_close_notify();
            self.close_notify_sent = true;
        }
        self.flush_records()?;
        if self.conn.wants_write() {
            return Ok(false);
        }
        self.plain.shut_writes()?;
        Ok(true)
    }
}
