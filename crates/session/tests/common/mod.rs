//! Shared fixtures for connection tests.

#![allow(dead_code)]

use protocol::HostIdentity;
use session::{
    Connection, Credentials, HandshakeStatus, MemoryPipe, PasswordTable, Progress, SessionConfig,
};

/// Upper bound on driver iterations before a test is declared stuck.
pub const MAX_ROUNDS: usize = 200_000;

pub struct Pair {
    pub client: Connection<MemoryPipe>,
    pub server: Connection<MemoryPipe>,
}

/// Default settings with a short software version.
pub fn config() -> SessionConfig {
    SessionConfig {
        software_version: "test".to_string(),
        ..Default::default()
    }
}

/// Server accepting `alice` / `secret`, client presenting those credentials.
pub fn pair_with(
    client_config: SessionConfig,
    server_config: SessionConfig,
    (client_end, server_end): (MemoryPipe, MemoryPipe),
) -> Pair {
    let mut server =
        Connection::responder(server_end, server_config, HostIdentity::generate()).unwrap();
    server.set_authenticator(PasswordTable::new([("alice", "secret")]));
    let client = Connection::initiator(
        client_end,
        client_config,
        Credentials::password("alice", "secret"),
    )
    .unwrap();
    Pair { client, server }
}

pub fn pair() -> Pair {
    pair_with(config(), config(), MemoryPipe::pair())
}

/// Rejection counts reported while driving a handshake.
#[derive(Debug, Default)]
pub struct Rejections {
    pub client: Vec<u32>,
    pub server: Vec<u32>,
}

/// Drive both handshakes to completion.
///
/// Once the server is done it keeps polling so it can answer the shell
/// request.
pub fn handshake(pair: &mut Pair) -> Rejections {
    let mut rejections = Rejections::default();
    let mut client_done = false;
    let mut server_done = false;

    for _ in 0..MAX_ROUNDS {
        if client_done && server_done {
            return rejections;
        }
        if !client_done {
            match pair.client.connect().unwrap() {
                HandshakeStatus::Complete => client_done = true,
                HandshakeStatus::AuthRejected { attempts } => rejections.client.push(attempts),
                HandshakeStatus::WouldBlock => {}
            }
        }
        if server_done {
            pair.server.poll().unwrap();
        } else {
            match pair.server.accept().unwrap() {
                HandshakeStatus::Complete => server_done = true,
                HandshakeStatus::AuthRejected { attempts } => rejections.server.push(attempts),
                HandshakeStatus::WouldBlock => {}
            }
        }
    }
    panic!(
        "handshake stuck: client {}, server {}",
        pair.client.state(),
        pair.server.state()
    );
}

/// Send `data` from `sender` and read it all on `receiver`.
pub fn transfer(
    sender: &mut Connection<MemoryPipe>,
    receiver: &mut Connection<MemoryPipe>,
    data: &[u8],
) -> Vec<u8> {
    let mut sent = 0;
    let mut received = Vec::with_capacity(data.len());
    let mut buf = vec![0u8; 4096];

    for _ in 0..MAX_ROUNDS {
        if received.len() == data.len() {
            return received;
        }
        if sent < data.len() {
            if let Progress::Ready(n) = sender.stream_send(&data[sent..]).unwrap() {
                sent += n;
            }
        } else {
            sender.poll().unwrap();
        }
        if let Progress::Ready(n) = receiver.stream_read(&mut buf).unwrap() {
            received.extend_from_slice(&buf[..n]);
        }
    }
    panic!(
        "transfer stuck: sent {sent}, received {} of {}",
        received.len(),
        data.len()
    );
}

/// Poll both sides until neither makes progress.
pub fn settle(pair: &mut Pair) {
    for _ in 0..MAX_ROUNDS {
        let client = pair.client.poll().unwrap();
        let server = pair.server.poll().unwrap();
        if client.is_would_block() && server.is_would_block() {
            return;
        }
    }
    panic!("connections never settled");
}

/// Deterministic filler data.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}
