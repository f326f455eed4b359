//! # Shellwire Protocol Library
//!
//! Wire definitions and the cryptographic provider for the Shellwire secure
//! remote-shell transport. This crate is pure: it never touches sockets and
//! holds no connection state. The `session` crate drives it.
//!
//! ## Layers
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │            Protocol Messages            │  MessagePack-encoded
//! ├─────────────────────────────────────────┤
//! │          Packet Encryption              │  ChaCha20-Poly1305 / AES-256-GCM
//! ├─────────────────────────────────────────┤
//! │              Framing                    │  Length-prefixed, LZ4
//! ├─────────────────────────────────────────┤
//! │     Version identification lines        │  SHELLWIRE-2.0-<software>
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{FrameCodec, Message};
//! use protocol::messages::ServiceRequest;
//!
//! let message = Message::ServiceRequest(ServiceRequest {
//!     service: protocol::messages::SERVICE_USERAUTH.to_string(),
//! });
//! let payload = message.to_msgpack().unwrap();
//!
//! let codec = FrameCodec::new();
//! let body = codec.encode_body(&payload).unwrap();
//! let frame = codec.encode(&body).unwrap();
//! assert_eq!(frame.len(), 4 + body.len());
//! ```
//!
//! ## Modules
//!
//! - [`version`]: identification line building and parsing
//! - [`messages`]: protocol message definitions
//! - [`framing`]: frame codec with compression
//! - [`crypto`]: host keys, signatures and fingerprints
//! - [`kex`]: algorithm negotiation and key agreement
//! - [`error`]: error types

pub mod crypto;
pub mod error;
pub mod framing;
pub mod kex;
pub mod messages;
pub mod version;

pub use crypto::{HostIdentity, HostKey, Signature, FINGERPRINT_PREFIX};
pub use error::{ProtocolError, Result};
pub use framing::{
    FrameCodec, FrameFlags, AEAD_TAG_SIZE, COMPRESSION_THRESHOLD, FRAME_LENGTH_SIZE,
    MAX_BODY_SIZE, MAX_PAYLOAD_SIZE,
};
pub use kex::{
    Algorithm, CipherAlgorithm, CompressionAlgorithm, ExchangeTranscript, KexAlgorithm,
    KexOutput, KexPhase, KeyAgreement, Negotiated, NoiseKex, Role, SessionKeys,
};
pub use messages::Message;
pub use version::{identification_line, LineScan, VersionInfo, MAX_VERSION_LINE};
