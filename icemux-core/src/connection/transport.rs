//! Uniform non-blocking transport over plaintext TCP and TLS
//!
//! Both paths expose the same contract: `try_read` / `try_write_vectored`
//! either make progress, return `Ok(0)` on end-of-stream, or fail with
//! `WouldBlock` meaning "try again later". The state machine never blocks on
//! a socket.

use std::io::{self, IoSlice};

use tokio::net::TcpStream;

use super::tls::TlsSession;

pub enum Transport {
    Tcp(TcpStream),
    Tls(Box<TlsSession>),
    #[cfg(test)]
    Mem(MemStream),
}

impl Transport {
    pub fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Transport::Tcp(stream) => stream.try_read(buf),
            Transport::Tls(session) => session.try_read(buf),
            #[cfg(test)]
            Transport::Mem(mem) => mem.try_read(buf),
        }
    }

    /// Write as much of `bufs` as the transport accepts right now, returning
    /// the byte count consumed from the front of the vector.
    pub fn try_write_vectored(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        match self {
            Transport::Tcp(stream) => stream.try_write_vectored(bufs),
            Transport::Tls(session) => session.try_write_vectored(bufs),
            #[cfg(test)]
            Transport::Mem(mem) => mem.try_write_vectored(bufs),
        }
    }
}

/// In-memory transport for exercising the state machine without sockets.
#[cfg(test)]
pub struct MemStream {
    pub input: std::collections::VecDeque<u8>,
    /// Once the input drains, reads return EOF instead of WouldBlock
    pub closed: bool,
    pub output: Vec<u8>,
    /// Caps the bytes accepted per write call, for partial-write tests
    pub write_limit: Option<usize>,
}

#[cfg(test)]
impl MemStream {
    pub fn new(input: &[u8]) -> Self {
        Self {
            input: input.iter().copied().collect(),
            closed: false,
            output: Vec::new(),
            write_limit: None,
        }
    }

    pub fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.input.is_empty() {
            return if self.closed {
                Ok(0)
            } else {
                Err(io::Error::from(io::ErrorKind::WouldBlock))
            };
        }
        let mut n = 0;
        while n < buf.len() {
            match self.input.pop_front() {
                Some(b) => {
                    buf[n] = b;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }

    pub fn try_write_vectored(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        let mut budget = self.write_limit.unwrap_or(usize::MAX);
        if budget == 0 {
            return Err(io::Error::from(io::ErrorKind::WouldBlock));
        }
        let mut total = 0;
        for buf in bufs {
            let take = buf.len().min(budget);
            self.output.extend_from_slice(&buf[..take]);
            total += take;
            budget -= take;
            if take < buf.len() || budget == 0 {
                break;
            }
        }
        Ok(total)
    }
}
