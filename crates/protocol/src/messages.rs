//! Protocol message definitions for Shellwire.
//!
//! This module defines every message exchanged on a connection, from the
//! key exchange through authentication to channel traffic. All messages are
//! serialized using MessagePack and carried one per frame.

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Service name for user authentication.
pub const SERVICE_USERAUTH: &str = "shellwire-userauth";

/// Service name for the connection (channel) layer.
pub const SERVICE_CONNECTION: &str = "shellwire-connection";

/// Channel type for an interactive session.
pub const CHANNEL_TYPE_SESSION: &str = "session";

/// Channel request asking for the user's shell.
pub const CHANNEL_REQUEST_SHELL: &str = "shell";

/// Length of the random cookie carried in KEXINIT.
pub const KEX_COOKIE_LENGTH: usize = 16;

/// Top-level message enum containing all message types.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Message {
    // Transport layer
    /// Connection is being torn down.
    Disconnect(Disconnect),
    /// Padding traffic, must be discarded.
    Ignore(Ignore),
    /// Reply to a message we could not interpret.
    Unimplemented(Unimplemented),

    // Key exchange
    /// Algorithm lists offered by one side.
    KexInit(KexInit),
    /// Initiator asks for group parameters (group-exchange algorithms only).
    KexGexRequest(KexGexRequest),
    /// Responder supplies group parameters.
    KexGexGroup(KexGexGroup),
    /// Initiator's ephemeral key.
    KexDhInit(KexDhInit),
    /// Responder's ephemeral key, host key and signature.
    KexDhReply(KexDhReply),
    /// The sender switches to the freshly derived keys.
    NewKeys,

    // Services
    /// Request for a named service.
    ServiceRequest(ServiceRequest),
    /// The named service is available.
    ServiceAccept(ServiceAccept),

    // User authentication
    /// Authentication attempt.
    UserAuthRequest(UserAuthRequest),
    /// Authentication attempt failed.
    UserAuthFailure(UserAuthFailure),
    /// Authentication succeeded.
    UserAuthSuccess,
    /// Text to display before authentication completes.
    UserAuthBanner(UserAuthBanner),

    // Channels
    /// Request to open a channel.
    ChannelOpen(ChannelOpen),
    /// Channel open accepted.
    ChannelOpenConfirmation(ChannelOpenConfirmation),
    /// Channel open refused.
    ChannelOpenFailure(ChannelOpenFailure),
    /// Additional receive window granted to the peer.
    ChannelWindowAdjust(ChannelWindowAdjust),
    /// Channel payload.
    ChannelData(ChannelData),
    /// No more data will be sent on the channel.
    ChannelEof(ChannelEof),
    /// The channel is closed.
    ChannelClose(ChannelClose),
    /// Channel-specific request.
    ChannelRequest(ChannelRequest),
    /// Positive reply to a channel request.
    ChannelSuccess(ChannelSuccess),
    /// Negative reply to a channel request.
    ChannelFailure(ChannelFailure),
}

impl Message {
    /// Returns a short name for the message, used in logs and errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Disconnect(_) => "DISCONNECT",
            Message::Ignore(_) => "IGNORE",
            Message::Unimplemented(_) => "UNIMPLEMENTED",
            Message::KexInit(_) => "KEXINIT",
            Message::KexGexRequest(_) => "KEX_GEX_REQUEST",
            Message::KexGexGroup(_) => "KEX_GEX_GROUP",
            Message::KexDhInit(_) => "KEXDH_INIT",
            Message::KexDhReply(_) => "KEXDH_REPLY",
            Message::NewKeys => "NEWKEYS",
            Message::ServiceRequest(_) => "SERVICE_REQUEST",
            Message::ServiceAccept(_) => "SERVICE_ACCEPT",
            Message::UserAuthRequest(_) => "USERAUTH_REQUEST",
            Message::UserAuthFailure(_) => "USERAUTH_FAILURE",
            Message::UserAuthSuccess => "USERAUTH_SUCCESS",
            Message::UserAuthBanner(_) => "USERAUTH_BANNER",
            Message::ChannelOpen(_) => "CHANNEL_OPEN",
            Message::ChannelOpenConfirmation(_) => "CHANNEL_OPEN_CONFIRMATION",
            Message::ChannelOpenFailure(_) => "CHANNEL_OPEN_FAILURE",
            Message::ChannelWindowAdjust(_) => "CHANNEL_WINDOW_ADJUST",
            Message::ChannelData(_) => "CHANNEL_DATA",
            Message::ChannelEof(_) => "CHANNEL_EOF",
            Message::ChannelClose(_) => "CHANNEL_CLOSE",
            Message::ChannelRequest(_) => "CHANNEL_REQUEST",
            Message::ChannelSuccess(_) => "CHANNEL_SUCCESS",
            Message::ChannelFailure(_) => "CHANNEL_FAILURE",
        }
    }

    /// Whether the message may be exchanged while a key exchange is running.
    ///
    /// Only transport-layer and key-exchange messages qualify; everything
    /// else must wait until both sides have switched keys.
    pub fn allowed_during_kex(&self) -> bool {
        matches!(
            self,
            Message::Disconnect(_)
                | Message::Ignore(_)
                | Message::Unimplemented(_)
                | Message::KexInit(_)
                | Message::KexGexRequest(_)
                | Message::KexGexGroup(_)
                | Message::KexDhInit(_)
                | Message::KexDhReply(_)
                | Message::NewKeys
        )
    }

    /// Serialize the message to MessagePack bytes.
    ///
    /// Structs are written as maps so that payload-less variants such as
    /// [`Message::NewKeys`] decode without a content element.
    pub fn to_msgpack(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    /// Deserialize a message from MessagePack bytes.
    pub fn from_msgpack(bytes: &[u8]) -> Result<Self> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

// ============================================================================
// Transport Messages
// ============================================================================

/// Reason codes carried by DISCONNECT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisconnectReason {
    /// Host is not allowed to connect.
    HostNotAllowedToConnect,
    /// Peer violated the protocol.
    ProtocolError,
    /// Key exchange failed.
    KeyExchangeFailed,
    /// Packet integrity check failed.
    MacError,
    /// Requested service is not available.
    ServiceNotAvailable,
    /// Version not supported.
    ProtocolVersionNotSupported,
    /// Host key could not be verified.
    HostKeyNotVerifiable,
    /// Connection lost.
    ConnectionLost,
    /// Application closed the connection.
    ByApplication,
    /// Too many connections.
    TooManyConnections,
    /// User cancelled authentication.
    AuthCancelledByUser,
    /// Authentication attempts exhausted.
    NoMoreAuthMethodsAvailable,
}

impl DisconnectReason {
    /// Numeric reason code as registered for the secure shell transport.
    pub fn code(self) -> u32 {
        match self {
            DisconnectReason::HostNotAllowedToConnect => 1,
            DisconnectReason::ProtocolError => 2,
            DisconnectReason::KeyExchangeFailed => 3,
            DisconnectReason::MacError => 5,
            DisconnectReason::ServiceNotAvailable => 7,
            DisconnectReason::ProtocolVersionNotSupported => 8,
            DisconnectReason::HostKeyNotVerifiable => 9,
            DisconnectReason::ConnectionLost => 10,
            DisconnectReason::ByApplication => 11,
            DisconnectReason::TooManyConnections => 12,
            DisconnectReason::AuthCancelledByUser => 13,
            DisconnectReason::NoMoreAuthMethodsAvailable => 14,
        }
    }
}

/// Connection teardown notice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Disconnect {
    /// Why the connection is closing.
    pub reason: DisconnectReason,
    /// Human-readable description.
    pub description: String,
}

/// Padding message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ignore {
    /// Arbitrary data.
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

/// Reply to an uninterpretable packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unimplemented {
    /// Sequence number of the rejected packet.
    pub sequence: u32,
}

// ============================================================================
// Key Exchange Messages
// ============================================================================

/// Algorithm negotiation message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KexInit {
    /// Random bytes making each KEXINIT unique.
    #[serde(with = "serde_bytes")]
    pub cookie: Vec<u8>,
    /// Key exchange algorithms, most preferred first.
    pub kex_algorithms: Vec<String>,
    /// Cipher algorithms, most preferred first.
    pub cipher_algorithms: Vec<String>,
    /// Compression algorithms, most preferred first.
    pub compression_algorithms: Vec<String>,
}

/// Group-exchange parameter request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KexGexRequest {
    /// Minimum acceptable group size in bits.
    pub min_bits: u32,
    /// Preferred group size in bits.
    pub preferred_bits: u32,
    /// Maximum acceptable group size in bits.
    pub max_bits: u32,
}

/// Group-exchange parameters chosen by the responder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KexGexGroup {
    /// Parameters bound into the exchange transcript.
    #[serde(with = "serde_bytes")]
    pub parameters: Vec<u8>,
}

/// First key agreement message from the initiator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KexDhInit {
    /// Key agreement message carrying the initiator's ephemeral key.
    #[serde(with = "serde_bytes")]
    pub ephemeral: Vec<u8>,
}

/// Key agreement reply from the responder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KexDhReply {
    /// Responder's Ed25519 host key.
    #[serde(with = "serde_bytes")]
    pub host_key: Vec<u8>,
    /// Key agreement message carrying the responder's ephemeral key.
    #[serde(with = "serde_bytes")]
    pub ephemeral: Vec<u8>,
    /// Host key signature over the exchange hash.
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
}

// ============================================================================
// Service Messages
// ============================================================================

/// Service request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRequest {
    /// Requested service name.
    pub service: String,
}

/// Service accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceAccept {
    /// Accepted service name.
    pub service: String,
}

// ============================================================================
// Authentication Messages
// ============================================================================

/// Authentication method and its credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthMethod {
    /// Attempt without credentials.
    None,
    /// Plain password (protected by the transport encryption).
    Password {
        /// The password.
        password: String,
    },
}

impl AuthMethod {
    /// The method name as listed in USERAUTH_FAILURE.
    pub fn name(&self) -> &'static str {
        match self {
            AuthMethod::None => "none",
            AuthMethod::Password { .. } => "password",
        }
    }
}

/// Authentication attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAuthRequest {
    /// Claimed user name.
    pub username: String,
    /// Service to start after authentication.
    pub service: String,
    /// Method and credential.
    pub method: AuthMethod,
}

/// Authentication failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAuthFailure {
    /// Methods that may continue.
    pub methods: Vec<String>,
    /// Whether the attempt succeeded but more is required.
    pub partial_success: bool,
}

/// Pre-authentication banner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAuthBanner {
    /// Banner text.
    pub message: String,
    /// Language tag, usually empty.
    pub language: String,
}

// ============================================================================
// Channel Messages
// ============================================================================

/// Reason a channel open was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelOpenFailureReason {
    /// Administratively prohibited.
    AdministrativelyProhibited,
    /// Connect failed.
    ConnectFailed,
    /// Channel type not known.
    UnknownChannelType,
    /// No resources for another channel.
    ResourceShortage,
}

/// Channel open request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelOpen {
    /// Channel type, e.g. [`CHANNEL_TYPE_SESSION`].
    pub channel_type: String,
    /// Sender's local channel id.
    pub sender_channel: u32,
    /// Sender's initial receive window.
    pub initial_window: u32,
    /// Largest data payload the sender accepts.
    pub max_packet: u32,
}

/// Channel open accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelOpenConfirmation {
    /// The opener's channel id.
    pub recipient_channel: u32,
    /// The confirmer's channel id.
    pub sender_channel: u32,
    /// Confirmer's initial receive window.
    pub initial_window: u32,
    /// Largest data payload the confirmer accepts.
    pub max_packet: u32,
}

/// Channel open refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelOpenFailure {
    /// The opener's channel id.
    pub recipient_channel: u32,
    /// Reason code.
    pub reason: ChannelOpenFailureReason,
    /// Human-readable description.
    pub description: String,
}

/// Window credit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelWindowAdjust {
    /// Receiver's channel id.
    pub recipient_channel: u32,
    /// Bytes added to the window.
    pub bytes_to_add: u32,
}

/// Channel payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelData {
    /// Receiver's channel id.
    pub recipient_channel: u32,
    /// Payload bytes.
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

/// End of data on a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelEof {
    /// Receiver's channel id.
    pub recipient_channel: u32,
}

/// Channel close.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelClose {
    /// Receiver's channel id.
    pub recipient_channel: u32,
}

/// Channel-specific request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRequest {
    /// Receiver's channel id.
    pub recipient_channel: u32,
    /// Request name, e.g. [`CHANNEL_REQUEST_SHELL`].
    pub request: String,
    /// Whether a success/failure reply is expected.
    pub want_reply: bool,
}

/// Channel request succeeded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSuccess {
    /// Receiver's channel id.
    pub recipient_channel: u32,
}

/// Channel request failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelFailure {
    /// Receiver's channel id.
    pub recipient_channel: u32,
}
