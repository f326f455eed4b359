//! Echo client.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use session::{Connection, Credentials, Progress};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::config::{ClientConfig, Config};
use crate::net::{self, TcpConnection, TcpTransport};

/// Credentials described by the client configuration.
pub fn credentials(config: &ClientConfig) -> Credentials {
    match &config.password {
        Some(password) => Credentials::password(config.username.clone(), password.clone()),
        None => Credentials::none(config.username.clone()),
    }
}

/// Connects to `addr` and completes the handshake.
pub async fn connect(addr: SocketAddr, config: &Config) -> Result<TcpConnection> {
    let stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("Failed to connect to {addr}"))?;
    let transport = TcpTransport::new(stream)?;

    let mut conn =
        Connection::initiator(transport, config.session.clone(), credentials(&config.client))
            .context("Failed to create connection")?;
    net::handshake(&mut conn).await?;

    if let Some(key) = conn.peer_host_key() {
        tracing::info!(address = %addr, fingerprint = %key.fingerprint(), "Connected");
    }
    if let Some(banner) = conn.banner() {
        tracing::info!(banner = %banner, "Server banner");
    }
    Ok(conn)
}

/// Sends `message` and waits for the same number of bytes to come back.
///
/// Sending and reading are interleaved so a message larger than the
/// windows cannot stall both sides.
pub async fn echo(conn: &mut TcpConnection, message: &[u8]) -> Result<Vec<u8>> {
    let mut reply = Vec::with_capacity(message.len());
    let mut buf = vec![0u8; 32 * 1024];
    let mut sent = 0;

    while reply.len() < message.len() {
        let mut progressed = false;
        if sent < message.len() {
            if let Progress::Ready(n) =
                conn.stream_send(&message[sent..]).context("Failed to send message")?
            {
                sent += n;
                progressed = n > 0;
            }
        }

        match conn.stream_read(&mut buf).context("Failed to read echo")? {
            Progress::Ready(0) => anyhow::bail!(
                "Server closed the channel after {} of {} bytes",
                reply.len(),
                message.len()
            ),
            Progress::Ready(n) => {
                reply.extend_from_slice(&buf[..n]);
                progressed = true;
            }
            Progress::WouldBlock => {}
        }

        if !progressed {
            wait(conn).await?;
        }
    }
    Ok(reply)
}

/// Copies `input` lines to the server and echoed bytes to `output`.
///
/// Returns once `input` ends and everything sent has come back, or when the
/// server closes the channel. Returns the number of bytes received.
pub async fn relay<R, W>(conn: &mut TcpConnection, input: R, output: &mut W) -> Result<u64>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = input.lines();
    let mut buf = vec![0u8; 32 * 1024];
    let mut pending: Vec<u8> = Vec::new();
    let mut sent = 0u64;
    let mut received = 0u64;
    let mut input_done = false;

    loop {
        let mut progressed = false;
        if !pending.is_empty() {
            if let Progress::Ready(n) = conn.stream_send(&pending).context("Failed to send input")? {
                pending.drain(..n);
                sent += n as u64;
                progressed = n > 0;
            }
        }

        match conn.stream_read(&mut buf).context("Failed to read from server")? {
            Progress::Ready(0) => break,
            Progress::Ready(n) => {
                output.write_all(&buf[..n]).await.context("Failed to write output")?;
                output.flush().await.context("Failed to flush output")?;
                received += n as u64;
                progressed = true;
            }
            Progress::WouldBlock => {
                if input_done && pending.is_empty() && received >= sent {
                    break;
                }
            }
        }
        if progressed {
            continue;
        }

        conn.flush().context("Failed to flush")?;
        if net::drain(conn).context("Failed to process server packets")? {
            continue;
        }
        let want_input = pending.is_empty() && !input_done;
        tokio::select! {
            line = lines.next_line(), if want_input => {
                match line.context("Failed to read input")? {
                    Some(line) => pending = format!("{line}\n").into_bytes(),
                    None => input_done = true,
                }
            }
            result = net::ready(conn) => result.context("Socket failed")?,
        }
    }

    tracing::debug!(sent, received, "Relay finished");
    Ok(received)
}

/// Parks until the connection can make progress again.
async fn wait(conn: &mut TcpConnection) -> Result<()> {
    conn.flush().context("Failed to flush")?;
    if !net::drain(conn).context("Failed to process server packets")? {
        net::ready(conn).await.context("Socket failed")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_with_password() {
        let config = ClientConfig {
            username: "alice".to_string(),
            password: Some("secret".to_string()),
        };
        let creds = credentials(&config);
        assert_eq!(creds, Credentials::password("alice", "secret"));
        // Debug output never shows the password
        let debug = format!("{creds:?}");
        assert!(debug.contains("alice"));
        assert!(!debug.contains("secret"));
    }

    #[test]
    fn test_credentials_without_password() {
        let config = ClientConfig {
            username: "bob".to_string(),
            password: None,
        };
        assert_eq!(credentials(&config), Credentials::none("bob"));
    }
}
