//! Flow-controlled channel state.
//!
//! Each channel owns a fixed inbound buffer whose capacity equals the window
//! it advertised when it opened. Received data fills the buffer and shrinks
//! the window by the same amount, so `local_window + filled == capacity`
//! always holds. Reading moves a cursor; once more than half the capacity
//! has been read, the connection sends the consumed count as a window
//! adjustment and the buffer is compacted.
//!
//! The send side only does accounting: the peer's window and maximum packet
//! bound how much of a caller's buffer goes out in each data message.

use crate::error::{Result, SessionError};

/// Largest data payload in one channel message.
pub const MAX_CHANNEL_DATA: usize = 32 * 1024;

/// One multiplexed stream within a connection.
#[derive(Debug)]
pub struct Channel {
    local_id: u32,
    peer_id: u32,

    local_window: u32,
    local_max_packet: u32,
    peer_window: u32,
    peer_max_packet: u32,

    buffer: Box<[u8]>,
    filled: usize,
    cursor: usize,

    eof_received: bool,
    eof_sent: bool,
    close_received: bool,
    close_sent: bool,
}

impl Channel {
    /// Create an open channel.
    ///
    /// `local_window` is the window we advertised and becomes the inbound
    /// buffer capacity.
    pub fn new(
        local_id: u32,
        peer_id: u32,
        local_window: u32,
        local_max_packet: u32,
        peer_window: u32,
        peer_max_packet: u32,
    ) -> Self {
        Self {
            local_id,
            peer_id,
            local_window,
            local_max_packet,
            peer_window,
            peer_max_packet,
            buffer: vec![0u8; local_window as usize].into_boxed_slice(),
            filled: 0,
            cursor: 0,
            eof_received: false,
            eof_sent: false,
            close_received: false,
            close_sent: false,
        }
    }

    /// Our id for this channel.
    pub fn local_id(&self) -> u32 {
        self.local_id
    }

    /// The peer's id for this channel.
    pub fn peer_id(&self) -> u32 {
        self.peer_id
    }

    /// Bytes the peer may still send us.
    pub fn local_window(&self) -> u32 {
        self.local_window
    }

    /// Largest data payload we accept.
    pub fn local_max_packet(&self) -> u32 {
        self.local_max_packet
    }

    /// Bytes we may still send the peer.
    pub fn peer_window(&self) -> u32 {
        self.peer_window
    }

    /// Largest data payload the peer accepts.
    pub fn peer_max_packet(&self) -> u32 {
        self.peer_max_packet
    }

    /// Inbound buffer capacity.
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Received bytes not yet read.
    pub fn available(&self) -> usize {
        self.filled - self.cursor
    }

    /// Bytes read since the last compaction.
    pub fn consumed(&self) -> usize {
        self.cursor
    }

    /// Bytes held in the buffer, read or not, since the last compaction.
    pub fn buffered(&self) -> usize {
        self.filled
    }

    /// Accept a data payload from the peer.
    pub fn receive_data(&mut self, data: &[u8]) -> Result<()> {
        if data.len() > self.local_max_packet as usize {
            return Err(SessionError::PacketTooLarge {
                size: data.len(),
                max: self.local_max_packet as usize,
            });
        }
        if data.len() > self.local_window as usize {
            return Err(SessionError::WindowExceeded {
                len: data.len(),
                window: self.local_window,
            });
        }

        // The window never exceeds the free space, so this cannot overrun.
        let end = self.filled + data.len();
        self.buffer[self.filled..end].copy_from_slice(data);
        self.filled = end;
        self.local_window -= data.len() as u32;
        Ok(())
    }

    /// Copy unread bytes into `out`, returning how many were copied.
    pub fn read(&mut self, out: &mut [u8]) -> usize {
        let count = out.len().min(self.available());
        out[..count].copy_from_slice(&self.buffer[self.cursor..self.cursor + count]);
        self.cursor += count;
        count
    }

    /// Bytes to advertise, once more than half the capacity has been read.
    pub fn pending_adjust(&self) -> Option<u32> {
        if self.cursor > self.capacity() / 2 {
            Some(self.cursor as u32)
        } else {
            None
        }
    }

    /// Credit the consumed bytes back to the window and compact the buffer.
    ///
    /// Call after the window adjustment for the returned amount was queued.
    pub fn commit_adjust(&mut self) -> u32 {
        let consumed = self.cursor;
        self.buffer.copy_within(self.cursor..self.filled, 0);
        self.filled -= consumed;
        self.cursor = 0;
        self.local_window += consumed as u32;
        consumed as u32
    }

    /// How much of `remaining` can go into the next data message.
    pub fn send_capacity(&self, remaining: usize) -> usize {
        remaining
            .min(self.peer_max_packet as usize)
            .min(MAX_CHANNEL_DATA)
            .min(self.peer_window as usize)
    }

    /// Account for data sent to the peer.
    pub fn consume_peer_window(&mut self, sent: usize) {
        debug_assert!(sent <= self.peer_window as usize);
        self.peer_window -= sent as u32;
    }

    /// Apply a window adjustment from the peer.
    pub fn add_peer_window(&mut self, bytes_to_add: u32) -> Result<()> {
        self.peer_window = self
            .peer_window
            .checked_add(bytes_to_add)
            .ok_or(SessionError::WindowOverflow {
                window: self.peer_window,
                bytes_to_add,
            })?;
        Ok(())
    }

    /// The peer will send no more data.
    pub fn mark_eof_received(&mut self) {
        self.eof_received = true;
    }

    /// We will send no more data.
    pub fn mark_eof_sent(&mut self) {
        self.eof_sent = true;
    }

    /// The peer closed the channel.
    pub fn mark_close_received(&mut self) {
        self.close_received = true;
    }

    /// We closed the channel.
    pub fn mark_close_sent(&mut self) {
        self.close_sent = true;
    }

    /// Whether the peer sent EOF.
    pub fn eof_received(&self) -> bool {
        self.eof_received
    }

    /// Whether we sent EOF.
    pub fn eof_sent(&self) -> bool {
        self.eof_sent
    }

    /// Whether the peer sent close.
    pub fn close_received(&self) -> bool {
        self.close_received
    }

    /// Whether we sent close.
    pub fn close_sent(&self) -> bool {
        self.close_sent
    }

    /// No more data will arrive.
    pub fn is_input_finished(&self) -> bool {
        self.eof_received || self.close_received
    }

    /// Whether we may still send data.
    pub fn can_send(&self) -> bool {
        !self.eof_sent && !self.close_sent && !self.close_received
    }

    /// Closed in both directions with nothing left to read.
    pub fn is_finished(&self) -> bool {
        self.close_sent && self.close_received && self.available() == 0
    }
}
