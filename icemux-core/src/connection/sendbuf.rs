//! Scatter-gather send buffers
//!
//! A response is assembled as a list of byte blocks and written with one
//! vectored call. Callers that saw a partial send pass the consumed byte
//! count back as `skip`; the block containing that offset is located and the
//! write resumes mid-block. Chunked-transfer framing appends its header and
//! trailer as blocks of their own.

use std::io::{self, IoSlice};

use bytes::Bytes;

use super::Connection;

/// Chunks at or above this size indicate a corrupted length upstream.
pub const CHUNK_MAX: usize = 1 << 24;

/// An ordered list of byte blocks plus their running total.
#[derive(Default)]
pub struct SendBufs {
    blocks: Vec<Bytes>,
    total: usize,
}

impl SendBufs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(blocks: usize) -> Self {
        Self { blocks: Vec::with_capacity(blocks), total: 0 }
    }

    /// Append a block; returns the new total.
    pub fn append(&mut self, block: impl Into<Bytes>) -> usize {
        let block = block.into();
        self.total += block.len();
        self.blocks.push(block);
        self.total
    }

    /// Drop all blocks, keeping the allocation.
    pub fn flush(&mut self) {
        self.blocks.clear();
        self.total = 0;
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Append a chunked-transfer header (`<hexlen>\r\n`) for a chunk of
    /// `chunk_len` bytes. Panics on an insane length; that is a bug in the
    /// caller, not input.
    pub fn chunk_start(&mut self, chunk_len: usize) -> usize {
        assert!(chunk_len < CHUNK_MAX, "chunk length sanity check failed: {}", chunk_len);
        self.append(format!("{:x}\r\n", chunk_len))
    }

    /// Append the chunk trailer.
    pub fn chunk_end(&mut self) -> usize {
        self.append(&b"\r\n"[..])
    }

    /// Send everything past `skip` in one vectored write.
    ///
    /// The slice list is built over the stored blocks, with the block
    /// containing byte `skip` narrowed to its unsent tail; the stored blocks
    /// themselves are never modified. Panics when `skip` exceeds the total.
    pub fn send(&self, con: &mut Connection, skip: usize) -> io::Result<usize> {
        assert!(skip <= self.total, "send skip {} beyond buffered {}", skip, self.total);
        if skip == self.total {
            return Ok(0);
        }
        let mut slices: Vec<IoSlice<'_>> = Vec::with_capacity(self.blocks.len());
        let mut remaining = skip;
        for block in &self.blocks {
            if slices.is_empty() {
                if remaining >= block.len() {
                    remaining -= block.len();
                    continue;
                }
                slices.push(IoSlice::new(&block[remaining..]));
            } else {
                slices.push(IoSlice::new(block));
            }
        }
        con.send_vectored(&slices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::transport::{MemStream, Transport};

    fn mem_connection(limit: Option<usize>) -> Connection {
        let mut mem = MemStream::new(b"");
        mem.write_limit = limit;
        Connection::new(Transport::Mem(mem), "127.0.0.1", 0)
    }

    fn output(con: &Connection) -> &[u8] {
        match &con.transport {
            Transport::Mem(mem) => &mem.output,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_total_tracks_appends() {
        let mut bufs = SendBufs::new();
        assert_eq!(bufs.append(&b"abc"[..]), 3);
        assert_eq!(bufs.append(&b"defgh"[..]), 8);
        assert_eq!(bufs.total(), 8);
        bufs.flush();
        assert_eq!(bufs.total(), 0);
        assert!(bufs.is_empty());
    }

    #[test]
    fn test_send_whole_vector() {
        let mut bufs = SendBufs::new();
        bufs.append(&b"hello "[..]);
        bufs.append(&b"world"[..]);
        let mut con = mem_connection(None);
        assert_eq!(bufs.send(&mut con, 0).unwrap(), 11);
        assert_eq!(output(&con), b"hello world");
        assert_eq!(con.sent_bytes, 11);
    }

    #[test]
    fn test_send_with_skip_resumes_mid_block() {
        let mut bufs = SendBufs::new();
        bufs.append(&b"hello "[..]);
        bufs.append(&b"world"[..]);
        let mut con = mem_connection(None);
        assert_eq!(bufs.send(&mut con, 4).unwrap(), 7);
        assert_eq!(output(&con), b"o world");
    }

    #[test]
    fn test_send_with_skip_at_block_boundary() {
        let mut bufs = SendBufs::new();
        bufs.append(&b"hello "[..]);
        bufs.append(&b"world"[..]);
        let mut con = mem_connection(None);
        assert_eq!(bufs.send(&mut con, 6).unwrap(), 5);
        assert_eq!(output(&con), b"world");
    }

    #[test]
    fn test_partial_send_then_resume_reproduces_stream() {
        let mut bufs = SendBufs::new();
        bufs.append(&b"alpha"[..]);
        bufs.append(&b"beta"[..]);
        bufs.append(&b"gamma"[..]);

        // Reference stream: one unrestricted send
        let mut full = mem_connection(None);
        bufs.send(&mut full, 0).unwrap();

        // Same vector through a transport that takes 7 bytes per call
        let mut partial = mem_connection(Some(7));
        let mut skip = 0;
        while skip < bufs.total() {
            skip += bufs.send(&mut partial, skip).unwrap();
        }
        assert_eq!(output(&partial), output(&full));
    }

    #[test]
    fn test_send_skip_equals_total() {
        let mut bufs = SendBufs::new();
        bufs.append(&b"abc"[..]);
        let mut con = mem_connection(None);
        assert_eq!(bufs.send(&mut con, 3).unwrap(), 0);
        assert!(output(&con).is_empty());
    }

    #[test]
    #[should_panic(expected = "beyond buffered")]
    fn test_send_skip_beyond_total_panics() {
        let mut bufs = SendBufs::new();
        bufs.append(&b"abc"[..]);
        let mut con = mem_connection(None);
        let _ = bufs.send(&mut con, 4);
    }

    #[test]
    fn test_chunk_helpers() {
        let mut bufs = SendBufs::new();
        bufs.chunk_start(0x1a2b);
        bufs.append(vec![0u8; 0x1a2b]);
        bufs.chunk_end();
        let mut con = mem_connection(None);
        bufs.send(&mut con, 0).unwrap();
        let out = output(&con);
        assert!(out.starts_with(b"1a2b\r\n"));
        assert!(out.ends_with(b"\r\n"));
        assert_eq!(out.len(), 6 + 0x1a2b + 2);
    }

    #[test]
    #[should_panic(expected = "sanity check")]
    fn test_chunk_too_large_panics() {
        let mut bufs = SendBufs::new();
        bufs.chunk_start(CHUNK_MAX);
    }
}
