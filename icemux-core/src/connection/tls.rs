//! TLS adapter
//!
//! Builds one rustls server context from the configured certificate/key file
//! and cipher list, and wraps accepted sockets in per-connection sessions.
//! WANT_READ/WANT_WRITE style conditions surface as `WouldBlock`, so the
//! plaintext and TLS paths behave identically to callers. TLS is optional:
//! when no certificate is configured the listeners simply stay plaintext.

use std::fs;
use std::io::{self, IoSlice, Read, Write};
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use log::{info, warn};
use rustls::crypto::CryptoProvider;
use rustls::{ServerConfig, ServerConnection};
use tokio::net::TcpStream;

/// Upper bound on plaintext buffered inside a session before the socket
/// drains, which is what makes TLS writes report short counts.
const SESSION_BUFFER_LIMIT: usize = 64 * 1024;

/// Server-side TLS context shared by all TLS listeners.
pub struct TlsContext {
    config: Arc<ServerConfig>,
}

impl TlsContext {
    /// Build a context from a combined PEM file (certificate chain plus
    /// private key) and an optional cipher-suite list.
    pub fn from_config(cert_file: &Path, cipher_list: Option<&str>) -> Result<Self> {
        let pem = fs::read(cert_file)
            .with_context(|| format!("failed to read cert file {}", cert_file.display()))?;

        let certs: Vec<_> = rustls_pemfile::certs(&mut &pem[..])
            .collect::<std::result::Result<_, _>>()
            .with_context(|| format!("invalid cert file {}", cert_file.display()))?;
        if certs.is_empty() {
            bail!("no certificate found in {}", cert_file.display());
        }
        let key = rustls_pemfile::private_key(&mut &pem[..])
            .with_context(|| format!("invalid private key file {}", cert_file.display()))?
            .ok_or_else(|| anyhow!("no private key found in {}", cert_file.display()))?;

        let provider = build_provider(cipher_list);
        let config = ServerConfig::builder_with_provider(Arc::new(provider))
            .with_protocol_versions(rustls::ALL_VERSIONS)?
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .context("private key does not match certificate")?;

        info!("SSL certificate found at {}", cert_file.display());
        Ok(Self { config: Arc::new(config) })
    }

    /// Wrap an accepted socket in an accept-state TLS session.
    pub fn wrap(&self, stream: TcpStream) -> io::Result<TlsSession> {
        let mut session = ServerConnection::new(self.config.clone())
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        session.set_buffer_limit(Some(SESSION_BUFFER_LIMIT));
        Ok(TlsSession { stream, session })
    }
}

fn build_provider(cipher_list: Option<&str>) -> CryptoProvider {
    let mut provider = rustls::crypto::ring::default_provider();
    if let Some(list) = cipher_list {
        let wanted: Vec<String> = list
            .split([':', ',', ' '])
            .filter(|s| !s.is_empty())
            .map(|s| s.to_uppercase().replace('-', "_"))
            .collect();
        let filtered: Vec<_> = provider
            .cipher_suites
            .iter()
            .copied()
            .filter(|s| {
                let name = format!("{:?}", s.suite());
                wanted.iter().any(|want| name.contains(want.as_str()))
            })
            .collect();
        if filtered.is_empty() {
            warn!("Invalid cipher list: {}", list);
        } else {
            info!("SSL using ciphers {}", list);
            provider.cipher_suites = filtered;
        }
    }
    provider
}

/// One TLS connection: the socket plus its rustls session state.
pub struct TlsSession {
    stream: TcpStream,
    session: ServerConnection,
}

impl TlsSession {
    /// Read decrypted bytes. `Ok(0)` is end-of-stream; `WouldBlock` means no
    /// plaintext is available yet (including mid-handshake).
    pub fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.session.reader().read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(0),
                Err(e) => return Err(e),
            }
            if self.session.wants_write() {
                self.pump_writes()?;
            }
            match self.session.read_tls(&mut SockIo(&self.stream)) {
                Ok(0) => return Ok(0),
                Ok(_) => {
                    self.process_packets()?;
                    if self.session.wants_write() {
                        self.pump_writes()?;
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Write slices sequentially into the session, stopping at the first
    /// short write, then flush what the socket will take. The returned count
    /// is what was consumed from the front of the vector.
    pub fn try_write_vectored(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        self.advance_handshake()?;
        let mut consumed = 0;
        for buf in bufs {
            match self.session.writer().write(buf) {
                Ok(n) => {
                    consumed += n;
                    if n < buf.len() {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        self.pump_writes()?;
        if consumed == 0 && !bufs.is_empty() {
            return Err(io::Error::from(io::ErrorKind::WouldBlock));
        }
        Ok(consumed)
    }

    /// Push buffered TLS records to the socket until it blocks or drains.
    fn pump_writes(&mut self) -> io::Result<()> {
        while self.session.wants_write() {
            match self.session.write_tls(&mut SockIo(&self.stream)) {
                Ok(0) => return Ok(()),
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Exchange handshake flights in both directions while progress is made.
    fn advance_handshake(&mut self) -> io::Result<()> {
        loop {
            let mut progressed = false;
            if self.session.wants_write() {
                match self.session.write_tls(&mut SockIo(&self.stream)) {
                    Ok(n) if n > 0 => progressed = true,
                    Ok(_) => {}
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(e) => return Err(e),
                }
            }
            if self.session.is_handshaking() && self.session.wants_read() {
                match self.session.read_tls(&mut SockIo(&self.stream)) {
                    Ok(0) => return Err(io::Error::from(io::ErrorKind::UnexpectedEof)),
                    Ok(_) => {
                        self.process_packets()?;
                        progressed = true;
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(e) => return Err(e),
                }
            }
            if !progressed {
                return Ok(());
            }
        }
    }

    fn process_packets(&mut self) -> io::Result<()> {
        self.session
            .process_new_packets()
            .map(|_| ())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

/// Non-blocking socket lens for rustls record I/O.
struct SockIo<'a>(&'a TcpStream);

impl Read for SockIo<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.try_read(buf)
    }
}

impl Write for SockIo<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.try_write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
