//! Byte transport beneath a connection.
//!
//! A transport makes partial progress or reports `WouldBlock`; it never
//! blocks on behalf of the connection. Any `Read + Write` type qualifies,
//! so a `TcpStream` in non-blocking mode can be used directly.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard};

/// Non-blocking byte stream.
pub trait Transport {
    /// Read available bytes into `buf`.
    ///
    /// `Ok(0)` means end of stream; `io::ErrorKind::WouldBlock` means no
    /// data right now.
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write some prefix of `buf`, returning how much was taken.
    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize>;
}

impl<T: Read + Write> Transport for T {
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read(buf)
    }

    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write(buf)
    }
}

#[derive(Debug, Default)]
struct PipeBuffer {
    data: VecDeque<u8>,
    closed: bool,
}

/// One end of an in-process byte pipe.
///
/// Both ends share two buffers. Reads and writes never block: an empty
/// buffer reads as `WouldBlock` until the writing end is closed, after which
/// it reads as end of stream. Fragmentation can be injected to exercise
/// resumable parsing.
#[derive(Debug)]
pub struct MemoryPipe {
    incoming: Arc<Mutex<PipeBuffer>>,
    outgoing: Arc<Mutex<PipeBuffer>>,
    max_read: Option<usize>,
    would_block_every: Option<usize>,
    write_capacity: Option<usize>,
    read_calls: usize,
}

fn lock(buffer: &Mutex<PipeBuffer>) -> MutexGuard<'_, PipeBuffer> {
    buffer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MemoryPipe {
    /// Create two connected ends.
    pub fn pair() -> (MemoryPipe, MemoryPipe) {
        let a_to_b = Arc::new(Mutex::new(PipeBuffer::default()));
        let b_to_a = Arc::new(Mutex::new(PipeBuffer::default()));
        let a = MemoryPipe::new(Arc::clone(&b_to_a), Arc::clone(&a_to_b));
        let b = MemoryPipe::new(a_to_b, b_to_a);
        (a, b)
    }

    fn new(incoming: Arc<Mutex<PipeBuffer>>, outgoing: Arc<Mutex<PipeBuffer>>) -> Self {
        Self {
            incoming,
            outgoing,
            max_read: None,
            would_block_every: None,
            write_capacity: None,
            read_calls: 0,
        }
    }

    /// Deliver at most `max` bytes per read.
    pub fn with_max_read(mut self, max: usize) -> Self {
        self.max_read = Some(max.max(1));
        self
    }

    /// Report `WouldBlock` on every `n`th read, even when data is waiting.
    pub fn with_would_block_every(mut self, n: usize) -> Self {
        self.would_block_every = Some(n.max(1));
        self
    }

    /// Refuse writes once `capacity` bytes are waiting unread.
    pub fn with_write_capacity(mut self, capacity: usize) -> Self {
        self.write_capacity = Some(capacity.max(1));
        self
    }

    /// Bytes written by the other end and not yet read here.
    pub fn pending(&self) -> usize {
        lock(&self.incoming).data.len()
    }

    /// Bytes written here and not yet read by the other end.
    pub fn unread_by_peer(&self) -> usize {
        lock(&self.outgoing).data.len()
    }

    /// Close the writing direction; the other end reads end of stream once
    /// it has drained what is buffered.
    pub fn close(&self) {
        lock(&self.outgoing).closed = true;
    }

    /// Append raw bytes to what this end will read.
    pub fn inject(&self, bytes: &[u8]) {
        lock(&self.incoming).data.extend(bytes);
    }
}

impl Read for MemoryPipe {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_calls += 1;
        if let Some(n) = self.would_block_every {
            if self.read_calls % n == 0 {
                return Err(io::ErrorKind::WouldBlock.into());
            }
        }

        let mut incoming = lock(&self.incoming);
        if incoming.data.is_empty() {
            if incoming.closed {
                return Ok(0);
            }
            return Err(io::ErrorKind::WouldBlock.into());
        }

        let limit = self.max_read.unwrap_or(usize::MAX);
        let count = buf.len().min(limit).min(incoming.data.len());
        for (slot, byte) in buf.iter_mut().zip(incoming.data.drain(..count)) {
            *slot = byte;
        }
        Ok(count)
    }
}

impl Write for MemoryPipe {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut outgoing = lock(&self.outgoing);
        if outgoing.closed {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        let room = match self.write_capacity {
            Some(capacity) => capacity.saturating_sub(outgoing.data.len()),
            None => buf.len(),
        };
        if room == 0 && !buf.is_empty() {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let count = buf.len().min(room);
        outgoing.data.extend(&buf[..count]);
        Ok(count)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
