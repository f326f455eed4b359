//! # Shellwire Session Engine
//!
//! Connection state for the Shellwire secure remote-shell transport: version
//! exchange, key exchange and re-keying, user authentication, and a
//! credit-based flow-controlled session channel.
//!
//! The engine is non-blocking and single-threaded. Each operation on a
//! [`Connection`] makes as much progress as its [`Transport`] allows and
//! returns [`Progress::WouldBlock`] or [`HandshakeStatus::WouldBlock`] when it
//! cannot continue; the caller retries once the transport is ready.
//!
//! ## Handshake
//!
//! ```text
//! Initiator                                   Responder
//!     │──────────── identification line ──────────▶│
//!     │◀─────────── identification line ───────────│
//!     │◀──────────────── KEXINIT ─────────────────▶│
//!     │───── KEX_GEX_REQUEST / KEX_DH_INIT ───────▶│
//!     │◀──────────────── ...REPLY ─────────────────│
//!     │◀──────────────── NEWKEYS ─────────────────▶│
//!     │─────────── SERVICE_REQUEST ───────────────▶│
//!     │◀────────── SERVICE_ACCEPT (+ banner) ──────│
//!     │─────────── USERAUTH_REQUEST ──────────────▶│
//!     │◀────────── USERAUTH_SUCCESS / FAILURE ─────│
//!     │─────────── CHANNEL_OPEN ──────────────────▶│
//!     │◀────────── CHANNEL_OPEN_CONFIRMATION ──────│
//!     │─────────── CHANNEL_REQUEST shell ─────────▶│
//!     │◀────────── CHANNEL_SUCCESS ────────────────│
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::HostIdentity;
//! use session::{Connection, Credentials, MemoryPipe, PasswordTable, SessionConfig};
//!
//! let (client_end, server_end) = MemoryPipe::pair();
//! let mut server =
//!     Connection::responder(server_end, SessionConfig::default(), HostIdentity::generate())
//!         .unwrap();
//! server.set_authenticator(PasswordTable::new([("alice", "secret")]));
//! let mut client = Connection::initiator(
//!     client_end,
//!     SessionConfig::default(),
//!     Credentials::password("alice", "secret"),
//! )
//! .unwrap();
//!
//! let mut client_done = false;
//! let mut server_done = false;
//! while !(client_done && server_done) {
//!     client_done = client.connect().unwrap().is_complete();
//!     if server_done {
//!         server.poll().unwrap();
//!     } else {
//!         server_done = server.accept().unwrap().is_complete();
//!     }
//! }
//! assert_eq!(client.session_id(), server.session_id());
//! ```
//!
//! ## Modules
//!
//! - [`connection`]: the connection and its public operations
//! - [`handshake`]: pure handshake state machines
//! - [`channel`]: flow-controlled channel accounting
//! - [`auth`]: authentication policy and credentials
//! - [`config`]: per-connection settings
//! - [`transport`]: non-blocking byte transport and an in-memory pipe
//! - [`error`]: errors and progress outcomes

pub mod auth;
pub mod channel;
pub mod config;
pub mod connection;
pub mod error;
pub mod handshake;
pub mod transport;

mod keying;
mod packet;

pub use auth::{AuthDecision, AuthRequest, Authenticator, Credentials, PasswordTable, RejectAll};
pub use channel::{Channel, MAX_CHANNEL_DATA};
pub use config::{ConfigError, SessionConfig, MAX_WINDOW_SIZE};
pub use connection::Connection;
pub use error::{ErrorCode, HandshakeStatus, Progress, Result, SessionError};
pub use handshake::{AcceptState, ConnectState, HandshakeState, Phase};
pub use packet::{HighwaterCallback, HighwaterSide, Stats};
pub use transport::{MemoryPipe, Transport};
