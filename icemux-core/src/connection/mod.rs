//! Connection object and socket plumbing
//!
//! A [`Connection`] owns one accepted socket (plaintext or TLS) together
//! with its identity: a process-unique monotonic id, the normalized peer IP,
//! a sent-byte counter and the error flag the state machine checks between
//! steps. Recoverable conditions (`WouldBlock`, `Interrupted`) never set the
//! error flag; everything else does.

pub mod sendbuf;
pub mod tls;
pub mod transport;

use std::io::{self, IoSlice};
use std::sync::atomic::{AtomicU64, Ordering};

pub use sendbuf::SendBufs;
pub use tls::{TlsContext, TlsSession};
pub use transport::Transport;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(0);

fn next_connection_id() -> u64 {
    NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)
}

/// Strip an IPv4-mapped prefix from a peer address, exactly once.
pub fn strip_mapped(ip: &str) -> &str {
    ip.strip_prefix("::ffff:").unwrap_or(ip)
}

/// True for socket conditions that just mean "try again".
pub fn is_recoverable(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted)
}

pub struct Connection {
    pub transport: Transport,
    pub id: u64,
    pub ip: String,
    pub sent_bytes: u64,
    pub error: bool,
    pub con_time_ms: u64,
    /// Drop the client when the worker clock passes this; `u64::MAX` once
    /// the headers arrived
    pub discon_deadline_ms: u64,
}

impl Connection {
    pub fn new(transport: Transport, addr: &str, now_ms: u64) -> Self {
        Self {
            transport,
            id: next_connection_id(),
            ip: strip_mapped(addr).to_string(),
            sent_bytes: 0,
            error: false,
            con_time_ms: now_ms,
            discon_deadline_ms: u64::MAX,
        }
    }

    /// Read available bytes. EOF and fatal errors set the error flag;
    /// recoverable errors pass through untouched.
    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.transport.try_read(buf) {
            Ok(0) => {
                self.error = true;
                Ok(0)
            }
            Ok(n) => Ok(n),
            Err(e) => {
                if !is_recoverable(&e) {
                    self.error = true;
                }
                Err(e)
            }
        }
    }

    /// Write a single buffer.
    pub fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.send_vectored(&[IoSlice::new(buf)])
    }

    /// Vectored write; counts sent bytes and funnels fatal errors into the
    /// error flag.
    pub fn send_vectored(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        match self.transport.try_write_vectored(bufs) {
            Ok(n) => {
                self.sent_bytes += n as u64;
                Ok(n)
            }
            Err(e) => {
                if !is_recoverable(&e) {
                    self.error = true;
                }
                Err(e)
            }
        }
    }
}
