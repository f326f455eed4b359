//! Buffered packet I/O over a transport.
//!
//! `PacketIo` owns the connection's input and output buffers. Outgoing
//! messages are encoded, compressed, sealed and framed as soon as they are
//! queued, so the keys and sequence number in effect at queue time are the
//! ones used. Incoming bytes accumulate until a complete identification line
//! or frame is available; parsing never consumes a partial unit, which makes
//! it indifferent to how the transport fragments the stream.

use std::fmt;
use std::io;
use std::sync::Arc;

use bytes::{Buf, BytesMut};
use protocol::framing::FrameFlags;
use protocol::version::scan_version_line;
use protocol::{FrameCodec, LineScan, Message, ProtocolError, SessionKeys, VersionInfo};

use crate::error::{Progress, Result, SessionError};
use crate::transport::Transport;

/// Bytes requested from the transport per read.
const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Which byte counter crossed the high-water mark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HighwaterSide {
    /// Bytes written to the transport.
    Transmit,
    /// Bytes read from the transport.
    Receive,
}

/// Callback invoked with the side and its byte total when a mark is crossed.
pub type HighwaterCallback = Box<dyn FnMut(HighwaterSide, u64) + Send>;

/// Per-connection counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    /// Bytes written to the transport.
    pub tx_bytes: u64,
    /// Bytes read from the transport.
    pub rx_bytes: u64,
    /// Packets sent; also the next outbound sequence number.
    pub tx_seq: u32,
    /// Packets received; also the next inbound sequence number.
    pub rx_seq: u32,
}

struct Highwater {
    mark: u64,
    next_tx: u64,
    next_rx: u64,
    callback: Option<HighwaterCallback>,
}

impl Highwater {
    fn new(mark: u64) -> Self {
        Self {
            mark,
            next_tx: mark,
            next_rx: mark,
            callback: None,
        }
    }

    fn reset(&mut self, mark: u64, tx_total: u64, rx_total: u64) {
        self.mark = mark;
        self.next_tx = next_multiple(tx_total, mark);
        self.next_rx = next_multiple(rx_total, mark);
    }

    fn check(&mut self, side: HighwaterSide, total: u64) {
        let next = match side {
            HighwaterSide::Transmit => &mut self.next_tx,
            HighwaterSide::Receive => &mut self.next_rx,
        };
        if total < *next {
            return;
        }
        *next = next_multiple(total, self.mark);
        tracing::debug!(?side, bytes = total, "High-water mark crossed");
        if let Some(callback) = self.callback.as_mut() {
            callback(side, total);
        }
    }
}

fn next_multiple(total: u64, mark: u64) -> u64 {
    (total / mark).saturating_add(1).saturating_mul(mark)
}

impl fmt::Debug for Highwater {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Highwater")
            .field("mark", &self.mark)
            .field("next_tx", &self.next_tx)
            .field("next_rx", &self.next_rx)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

/// Buffered, sequenced packet reader and writer.
pub(crate) struct PacketIo {
    input: BytesMut,
    scratch: Box<[u8]>,
    output: Vec<u8>,
    output_pos: usize,
    codec: FrameCodec,
    tx_keys: Option<Arc<SessionKeys>>,
    rx_keys: Option<Arc<SessionKeys>>,
    rx_compression: bool,
    stats: Stats,
    highwater: Highwater,
}

impl fmt::Debug for PacketIo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketIo")
            .field("buffered_input", &self.input.len())
            .field("pending_output", &self.pending_output())
            .field("encrypted", &self.tx_keys.is_some())
            .field("stats", &self.stats)
            .field("highwater", &self.highwater)
            .finish()
    }
}

impl PacketIo {
    pub(crate) fn new(highwater_mark: u64) -> Self {
        Self {
            input: BytesMut::with_capacity(READ_CHUNK_SIZE),
            scratch: vec![0u8; READ_CHUNK_SIZE].into_boxed_slice(),
            output: Vec::new(),
            output_pos: 0,
            codec: FrameCodec::new(),
            tx_keys: None,
            rx_keys: None,
            rx_compression: false,
            stats: Stats::default(),
            highwater: Highwater::new(highwater_mark),
        }
    }

    pub(crate) fn stats(&self) -> Stats {
        self.stats
    }

    pub(crate) fn highwater_mark(&self) -> u64 {
        self.highwater.mark
    }

    pub(crate) fn set_highwater(&mut self, mark: u64, callback: Option<HighwaterCallback>) {
        self.highwater
            .reset(mark, self.stats.tx_bytes, self.stats.rx_bytes);
        self.highwater.callback = callback;
    }

    /// Bytes queued but not yet written to the transport.
    pub(crate) fn pending_output(&self) -> usize {
        self.output.len() - self.output_pos
    }

    /// Use new keys for every packet queued from now on.
    pub(crate) fn activate_outbound(&mut self, keys: Arc<SessionKeys>, compression: bool) {
        self.tx_keys = Some(keys);
        self.codec.set_compression(compression);
    }

    /// Use new keys for every packet read from now on.
    pub(crate) fn activate_inbound(&mut self, keys: Arc<SessionKeys>, compression: bool) {
        self.rx_keys = Some(keys);
        self.rx_compression = compression;
    }

    /// Queue raw bytes, used for the identification line.
    pub(crate) fn queue_raw(&mut self, bytes: &[u8]) {
        self.output.extend_from_slice(bytes);
    }

    /// Encode, seal and frame a message.
    pub(crate) fn queue(&mut self, message: &Message) -> Result<()> {
        let seq = self.stats.tx_seq;
        let next = seq.checked_add(1).ok_or(SessionError::SequenceExhausted)?;

        let payload = message.to_msgpack()?;
        let body = self.codec.encode_body(&payload)?;
        let body = match &self.tx_keys {
            Some(keys) => keys.seal(seq, &body)?,
            None => body,
        };
        let frame = self.codec.encode(&body)?;
        self.output.extend_from_slice(&frame);
        self.stats.tx_seq = next;

        tracing::trace!(seq, kind = message.kind(), bytes = frame.len(), "Queued packet");
        Ok(())
    }

    /// Take the peer's identification line, skipping any preamble lines.
    pub(crate) fn next_version_line(&mut self) -> Result<Option<VersionInfo>> {
        loop {
            match scan_version_line(&self.input)? {
                LineScan::Incomplete => return Ok(None),
                LineScan::Skipped(consumed) => {
                    tracing::trace!(bytes = consumed, "Skipped preamble line");
                    self.input.advance(consumed);
                }
                LineScan::Found(info, consumed) => {
                    self.input.advance(consumed);
                    return Ok(Some(info));
                }
            }
        }
    }

    /// Take the next complete packet, returning the message and its payload.
    pub(crate) fn next_packet(&mut self) -> Result<Option<(Message, Vec<u8>)>> {
        let Some((body, consumed)) = self.codec.try_decode(&self.input)? else {
            return Ok(None);
        };
        self.input.advance(consumed);

        let seq = self.stats.rx_seq;
        let next = seq.checked_add(1).ok_or(SessionError::SequenceExhausted)?;

        let body = match &self.rx_keys {
            Some(keys) => keys.open(seq, &body)?,
            None => body,
        };
        if let Some(&flags) = body.first() {
            if FrameFlags::from_byte(flags).is_compressed() && !self.rx_compression {
                return Err(ProtocolError::MalformedFrame(
                    "compressed packet without negotiated compression".to_string(),
                )
                .into());
            }
        }
        let payload = self.codec.decode_body(&body)?;
        let message = Message::from_msgpack(&payload)?;
        self.stats.rx_seq = next;

        tracing::trace!(seq, kind = message.kind(), bytes = consumed, "Received packet");
        Ok(Some((message, payload)))
    }

    /// Read once from the transport into the input buffer.
    pub(crate) fn fill<T: Transport>(&mut self, transport: &mut T) -> Result<Progress<usize>> {
        loop {
            match transport.try_read(&mut self.scratch) {
                Ok(0) => return Err(SessionError::TransportClosed),
                Ok(n) => {
                    self.input.extend_from_slice(&self.scratch[..n]);
                    self.stats.rx_bytes += n as u64;
                    self.highwater
                        .check(HighwaterSide::Receive, self.stats.rx_bytes);
                    return Ok(Progress::Ready(n));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Progress::WouldBlock),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Write queued bytes until the output is empty or the transport stalls.
    pub(crate) fn flush<T: Transport>(&mut self, transport: &mut T) -> Result<Progress<()>> {
        while self.output_pos < self.output.len() {
            match transport.try_write(&self.output[self.output_pos..]) {
                Ok(0) => return Err(SessionError::TransportClosed),
                Ok(n) => {
                    self.output_pos += n;
                    self.stats.tx_bytes += n as u64;
                    self.highwater
                        .check(HighwaterSide::Transmit, self.stats.tx_bytes);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.output.drain(..self.output_pos);
                    self.output_pos = 0;
                    return Ok(Progress::WouldBlock);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        self.output.clear();
        self.output_pos = 0;
        Ok(Progress::Ready(()))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use protocol::messages::{ChannelData, Ignore, ServiceRequest};

    use super::*;
    use crate::transport::MemoryPipe;

    fn service_request() -> Message {
        Message::ServiceRequest(ServiceRequest {
            service: "shellwire-userauth".to_string(),
        })
    }

    fn pump(tx: &mut PacketIo, a: &mut MemoryPipe, rx: &mut PacketIo, b: &mut MemoryPipe) {
        tx.flush(a).unwrap();
        while let Progress::Ready(_) = rx.fill(b).unwrap() {}
    }

    #[test]
    fn test_queue_and_receive_plaintext() {
        let (mut a, mut b) = MemoryPipe::pair();
        let mut tx = PacketIo::new(u64::MAX);
        let mut rx = PacketIo::new(u64::MAX);

        tx.queue(&service_request()).unwrap();
        tx.queue(&Message::NewKeys).unwrap();
        assert_eq!(tx.stats().tx_seq, 2);
        pump(&mut tx, &mut a, &mut rx, &mut b);

        let (first, _) = rx.next_packet().unwrap().unwrap();
        assert_eq!(first, service_request());
        let (second, _) = rx.next_packet().unwrap().unwrap();
        assert_eq!(second, Message::NewKeys);
        assert!(rx.next_packet().unwrap().is_none());
        assert_eq!(rx.stats().rx_seq, 2);
        assert_eq!(rx.stats().rx_bytes, tx.stats().tx_bytes);
    }

    #[test]
    fn test_version_line_then_packet_in_one_read() {
        let (mut a, mut b) = MemoryPipe::pair();
        let mut tx = PacketIo::new(u64::MAX);
        let mut rx = PacketIo::new(u64::MAX);

        tx.queue_raw(b"welcome\r\nSHELLWIRE-2.0-test\r\n");
        tx.queue(&service_request()).unwrap();
        pump(&mut tx, &mut a, &mut rx, &mut b);

        let info = rx.next_version_line().unwrap().unwrap();
        assert_eq!(info.software, "test");
        assert!(rx.next_packet().unwrap().is_some());
    }

    #[test]
    fn test_partial_frame_is_not_consumed() {
        let (mut a, b) = MemoryPipe::pair();
        let mut b = b.with_max_read(3);
        let mut tx = PacketIo::new(u64::MAX);
        let mut rx = PacketIo::new(u64::MAX);

        tx.queue(&service_request()).unwrap();
        tx.flush(&mut a).unwrap();

        let mut reads = 0;
        let message = loop {
            if let Some((message, _)) = rx.next_packet().unwrap() {
                break message;
            }
            assert!(rx.fill(&mut b).unwrap().is_ready());
            reads += 1;
        };
        assert_eq!(message, service_request());
        assert!(reads > 1);
        assert_eq!(rx.stats().rx_seq, 1);
    }

    #[test]
    fn test_sequence_exhaustion() {
        let mut io = PacketIo::new(u64::MAX);
        io.stats.tx_seq = u32::MAX - 1;
        io.queue(&Message::NewKeys).unwrap();
        assert!(matches!(
            io.queue(&Message::NewKeys),
            Err(SessionError::SequenceExhausted)
        ));
        assert_eq!(io.stats().tx_seq, u32::MAX);
    }

    #[test]
    fn test_end_of_stream() {
        let (a, mut b) = MemoryPipe::pair();
        a.close();
        let mut io = PacketIo::new(u64::MAX);
        assert!(matches!(
            io.fill(&mut b),
            Err(SessionError::TransportClosed)
        ));
    }

    #[test]
    fn test_flush_resumes_after_backpressure() {
        let (a, mut b) = MemoryPipe::pair();
        let mut a = a.with_write_capacity(10);
        let mut tx = PacketIo::new(u64::MAX);
        let mut rx = PacketIo::new(u64::MAX);

        tx.queue(&service_request()).unwrap();
        let total = tx.pending_output();
        assert_eq!(tx.flush(&mut a).unwrap(), Progress::WouldBlock);
        assert_eq!(tx.pending_output(), total - 10);

        loop {
            rx.fill(&mut b).unwrap();
            if tx.flush(&mut a).unwrap().is_ready() {
                break;
            }
        }
        while let Progress::Ready(_) = rx.fill(&mut b).unwrap() {}
        assert_eq!(rx.next_packet().unwrap().unwrap().0, service_request());
    }

    #[test]
    fn test_compressed_packet_requires_negotiation() {
        let (mut a, mut b) = MemoryPipe::pair();
        let mut tx = PacketIo::new(u64::MAX);
        let mut rx = PacketIo::new(u64::MAX);
        tx.codec.set_compression(true);

        let data = Message::ChannelData(ChannelData {
            recipient_channel: 0,
            data: vec![b'a'; 8192],
        });
        tx.queue(&data).unwrap();
        pump(&mut tx, &mut a, &mut rx, &mut b);
        assert!(matches!(
            rx.next_packet(),
            Err(SessionError::Protocol(ProtocolError::MalformedFrame(_)))
        ));
    }

    #[test]
    fn test_highwater_fires_per_interval() {
        let (mut a, mut b) = MemoryPipe::pair();
        let fired = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&fired);

        let mut tx = PacketIo::new(u64::MAX);
        tx.set_highwater(
            100,
            Some(Box::new(move |side, total| {
                seen.lock().unwrap().push((side, total));
            })),
        );
        let mut rx = PacketIo::new(u64::MAX);

        for _ in 0..3 {
            tx.queue(&Message::Ignore(Ignore { data: vec![0u8; 90] }))
                .unwrap();
            pump(&mut tx, &mut a, &mut rx, &mut b);
        }

        let fired = fired.lock().unwrap();
        assert!(!fired.is_empty());
        assert!(fired.iter().all(|(side, _)| *side == HighwaterSide::Transmit));
        // One callback per crossed mark at most
        assert!(fired.len() as u64 <= tx.stats().tx_bytes / 100);
        assert_eq!(tx.highwater_mark(), 100);
    }
}
