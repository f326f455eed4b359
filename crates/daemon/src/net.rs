//! Async drivers over the non-blocking connection engine.
//!
//! The engine never waits. Whenever it reports would-block, these helpers
//! park the task on socket readiness: readable always, writable too while
//! output is queued.

use std::future::Future;
use std::io;

use anyhow::{Context, Result};
use protocol::messages::DisconnectReason;
use protocol::Role;
use session::{Connection, HandshakeStatus, Progress, SessionError, Transport};
use tokio::net::TcpStream;

/// A tokio TCP stream as a connection transport.
#[derive(Debug)]
pub struct TcpTransport {
    stream: TcpStream,
}

impl TcpTransport {
    /// Wraps a connected stream.
    pub fn new(stream: TcpStream) -> Result<Self> {
        stream.set_nodelay(true).context("Failed to set TCP_NODELAY")?;
        Ok(Self { stream })
    }

    /// The underlying stream.
    pub fn get_ref(&self) -> &TcpStream {
        &self.stream
    }
}

impl Transport for TcpTransport {
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.try_read(buf)
    }

    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.try_write(buf)
    }
}

/// Connection over tokio TCP.
pub type TcpConnection = Connection<TcpTransport>;

/// Waits until the socket can move the connection forward.
pub fn ready(conn: &TcpConnection) -> impl Future<Output = io::Result<()>> + Send + '_ {
    let stream = conn.get_ref().get_ref();
    let wants_write = conn.pending_output() > 0;
    async move {
        if wants_write {
            tokio::select! {
                result = stream.readable() => result,
                result = stream.writable() => result,
            }
        } else {
            stream.readable().await
        }
    }
}

/// Processes packets already buffered or readable without waiting.
///
/// Returns whether anything was processed.
pub fn drain(conn: &mut TcpConnection) -> session::Result<bool> {
    let mut progressed = false;
    while conn.poll()?.is_ready() {
        progressed = true;
    }
    Ok(progressed)
}

/// Retries `op` until it makes progress, waiting on the socket in between.
pub async fn until_ready<T>(
    conn: &mut TcpConnection,
    mut op: impl FnMut(&mut TcpConnection) -> session::Result<Progress<T>>,
) -> session::Result<T> {
    loop {
        if let Progress::Ready(value) = op(conn)? {
            return Ok(value);
        }
        if drain(conn)? {
            continue;
        }
        ready(conn).await?;
    }
}

/// Runs `accept` or `connect` until the session channel is open.
///
/// The responder keeps waiting after a rejected attempt. The initiator gives
/// up, since retrying with the same credentials cannot succeed.
pub async fn handshake(conn: &mut TcpConnection) -> Result<()> {
    loop {
        let status = match conn.role() {
            Role::Responder => conn.accept(),
            Role::Initiator => conn.connect(),
        }
        .context("Handshake failed")?;

        match status {
            HandshakeStatus::Complete => return Ok(()),
            HandshakeStatus::WouldBlock => ready(conn)
                .await
                .context("Socket failed during handshake")?,
            HandshakeStatus::AuthRejected { attempts } => {
                tracing::warn!(attempts, role = ?conn.role(), "Authentication rejected");
                if conn.role() == Role::Initiator {
                    anyhow::bail!("Authentication rejected by server");
                }
            }
        }
    }
}

/// Sends all of `data` on the session channel and flushes it.
pub async fn send_all(conn: &mut TcpConnection, mut data: &[u8]) -> session::Result<()> {
    while !data.is_empty() {
        let sent = until_ready(conn, |c| c.stream_send(data)).await?;
        data = &data[sent..];
    }
    until_ready(conn, |c| c.flush()).await
}

/// Whether `err` is an ordinary end of the connection by the peer.
pub fn is_orderly_close(err: &SessionError) -> bool {
    matches!(
        err,
        SessionError::TransportClosed
            | SessionError::ChannelClosed(_)
            | SessionError::PeerDisconnected {
                reason: DisconnectReason::ByApplication,
                ..
            }
    )
}
