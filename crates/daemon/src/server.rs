//! Echo server.
//!
//! Each accepted TCP connection runs in its own tokio task. The task
//! completes the responder handshake, then writes back everything read from
//! the session channel until the client sends EOF.

use anyhow::{Context, Result};
use protocol::HostIdentity;
use session::{Connection, PasswordTable, SessionConfig};
use tokio::net::{TcpListener, TcpStream};

use crate::config::Config;
use crate::net::{self, TcpTransport};

/// Summary of one finished echo session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EchoSummary {
    /// Bytes echoed back to the client.
    pub echoed: u64,
    /// Key exchanges completed, including the initial one.
    pub key_exchanges: u32,
}

/// Settings shared by every connection the server accepts.
#[derive(Clone)]
pub struct EchoServer {
    session: SessionConfig,
    users: Vec<(String, String)>,
    host_identity: HostIdentity,
}

impl EchoServer {
    /// Creates a server from the loaded configuration.
    pub fn new(config: &Config, host_identity: HostIdentity) -> Self {
        Self {
            session: config.session.clone(),
            users: config
                .server
                .users
                .iter()
                .map(|(user, password)| (user.clone(), password.clone()))
                .collect(),
            host_identity,
        }
    }

    /// Fingerprint clients should pin.
    pub fn fingerprint(&self) -> String {
        self.host_identity.fingerprint()
    }

    /// Accepts connections forever, one task each.
    pub async fn run(&self, listener: TcpListener) -> Result<()> {
        let local = listener.local_addr().context("Failed to read listen address")?;
        tracing::info!(
            address = %local,
            fingerprint = %self.fingerprint(),
            users = self.users.len(),
            "Echo server listening"
        );

        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to accept connection");
                    continue;
                }
            };
            let server = self.clone();

            tokio::spawn(async move {
                match server.serve_connection(stream).await {
                    Ok(summary) => tracing::info!(
                        peer = %peer,
                        echoed = summary.echoed,
                        key_exchanges = summary.key_exchanges,
                        "Connection finished"
                    ),
                    Err(e) => {
                        tracing::warn!(peer = %peer, error = %format!("{e:#}"), "Connection failed")
                    }
                }
            });
        }
    }

    /// Runs one echo session to completion.
    pub async fn serve_connection(&self, stream: TcpStream) -> Result<EchoSummary> {
        let transport = TcpTransport::new(stream)?;
        let mut conn =
            Connection::responder(transport, self.session.clone(), self.host_identity.clone())
                .context("Failed to create connection")?;
        conn.set_authenticator(PasswordTable::new(self.users.iter().cloned()));

        net::handshake(&mut conn).await?;
        tracing::debug!(
            negotiated = ?conn.negotiated(),
            peer_software = ?conn.peer_version().map(|v| v.software.clone()),
            "Session channel open"
        );

        let mut summary = EchoSummary::default();
        let mut buf = vec![0u8; 32 * 1024];
        loop {
            let read = match net::until_ready(&mut conn, |c| c.stream_read(&mut buf)).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if net::is_orderly_close(&e) => break,
                Err(e) => return Err(e).context("Failed to read from client"),
            };
            match net::send_all(&mut conn, &buf[..read]).await {
                Ok(()) => summary.echoed += read as u64,
                Err(e) if net::is_orderly_close(&e) => break,
                Err(e) => return Err(e).context("Failed to echo to client"),
            }
        }

        summary.key_exchanges = conn.key_exchanges();
        if !conn.is_terminated() {
            if let Err(e) = conn.shutdown() {
                tracing::debug!(error = %e, "Shutdown after echo failed");
            }
        }
        Ok(summary)
    }
}
