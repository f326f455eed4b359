//! Errors and non-error outcomes of connection operations.
//!
//! "Would block" is never an error: operations that may stall on the
//! transport return [`Progress`] or [`HandshakeStatus`], and a rejected
//! authentication attempt is reported as [`HandshakeStatus::AuthRejected`].

use std::fmt;
use std::io;

use protocol::messages::{ChannelOpenFailureReason, DisconnectReason};
use protocol::{ProtocolError, Role};
use thiserror::Error;

use crate::config::ConfigError;
use crate::handshake::Phase;

/// Outcome of an operation that may stall on the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress<T> {
    /// The operation made progress.
    Ready(T),
    /// Nothing could be done right now; call again later.
    WouldBlock,
}

impl<T> Progress<T> {
    /// Whether the operation made progress.
    pub fn is_ready(&self) -> bool {
        matches!(self, Progress::Ready(_))
    }

    /// Whether the operation stalled.
    pub fn is_would_block(&self) -> bool {
        matches!(self, Progress::WouldBlock)
    }

    /// The ready value, if any.
    pub fn ready(self) -> Option<T> {
        match self {
            Progress::Ready(value) => Some(value),
            Progress::WouldBlock => None,
        }
    }

    /// Map the ready value.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Progress<U> {
        match self {
            Progress::Ready(value) => Progress::Ready(f(value)),
            Progress::WouldBlock => Progress::WouldBlock,
        }
    }
}

/// Outcome of one `accept()` / `connect()` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    /// The handshake finished; the session channel is open.
    Complete,
    /// The transport stalled; call again later.
    WouldBlock,
    /// An authentication attempt was rejected. The handshake can continue:
    /// the responder waits for another attempt, the initiator re-sends its
    /// (possibly updated) credentials on the next call.
    AuthRejected {
        /// Rejections so far on this connection.
        attempts: u32,
    },
}

impl HandshakeStatus {
    /// Whether the handshake finished.
    pub fn is_complete(&self) -> bool {
        matches!(self, HandshakeStatus::Complete)
    }
}

/// Errors returned by connection operations.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Codec or cryptographic failure.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// A message arrived that is not valid at this point.
    #[error("unexpected {message} in {context}")]
    UnexpectedMessage {
        /// Message kind.
        message: &'static str,
        /// Where it arrived.
        context: String,
    },

    /// The peer sent more channel data than the window allowed.
    #[error("peer sent {len} bytes with only {window} bytes of window left")]
    WindowExceeded {
        /// Payload length.
        len: usize,
        /// Remaining window.
        window: u32,
    },

    /// A window adjustment would overflow the window counter.
    #[error("window adjustment of {bytes_to_add} overflows a window of {window}")]
    WindowOverflow {
        /// Current window.
        window: u32,
        /// Requested addition.
        bytes_to_add: u32,
    },

    /// The peer sent a channel packet above the advertised maximum.
    #[error("channel packet of {size} bytes exceeds maximum of {max} bytes")]
    PacketTooLarge {
        /// Payload length.
        size: usize,
        /// Advertised maximum.
        max: usize,
    },

    /// The peer ended the connection.
    #[error("peer disconnected ({reason:?}): {description}")]
    PeerDisconnected {
        /// Reason code.
        reason: DisconnectReason,
        /// Peer-supplied description.
        description: String,
    },

    /// The transport reached end of stream.
    #[error("transport closed by peer")]
    TransportClosed,

    /// The responder's host key is not the one we expected.
    #[error("host key {actual} does not match expected {expected}")]
    HostKeyMismatch {
        /// Configured fingerprint.
        expected: String,
        /// Presented fingerprint.
        actual: String,
    },

    /// Too many authentication attempts were rejected.
    #[error("authentication failed after {attempts} attempts")]
    AuthAttemptsExceeded {
        /// Number of rejected attempts.
        attempts: u32,
    },

    /// The responder refused to open the session channel.
    #[error("channel open refused ({reason:?}): {description}")]
    ChannelOpenRefused {
        /// Reason code.
        reason: ChannelOpenFailureReason,
        /// Peer-supplied description.
        description: String,
    },

    /// The responder refused the shell request.
    #[error("shell request refused")]
    ShellRefused,

    /// No room for another channel.
    #[error("channel limit of {max} reached")]
    ChannelLimit {
        /// Configured maximum.
        max: usize,
    },

    /// A channel message named a channel we do not have.
    #[error("unknown channel {0}")]
    UnknownChannel(u32),

    /// The channel no longer accepts data from us.
    #[error("channel {0} is closed for sending")]
    ChannelClosed(u32),

    /// A packet sequence counter would wrap.
    #[error("packet sequence number exhausted")]
    SequenceExhausted,

    /// A key exchange is already running.
    #[error("key exchange already in progress")]
    KexInProgress,

    /// The operation is not valid in the current handshake phase.
    #[error("operation requires phase {required:?}, connection is at {current:?}")]
    InvalidPhase {
        /// Minimum phase required.
        required: Phase,
        /// Current phase.
        current: Phase,
    },

    /// The operation belongs to the other role.
    #[error("operation not available to the {0:?}")]
    WrongRole(Role),

    /// The connection was shut down by this side.
    #[error("connection has been shut down")]
    ShutDown,

    /// An earlier fatal error ended the connection.
    #[error("connection terminated by an earlier error ({})", .0.name())]
    Terminated(ErrorCode),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Transport I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Result type alias for session operations.
pub type Result<T> = std::result::Result<T, SessionError>;

impl SessionError {
    /// Stable code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            SessionError::Protocol(ProtocolError::Decryption(_)) => ErrorCode::Decrypt,
            SessionError::Protocol(ProtocolError::InvalidSignature(_)) => ErrorCode::BadSignature,
            SessionError::Protocol(ProtocolError::NoCommonAlgorithm { .. }) => {
                ErrorCode::NoCommonAlgorithm
            }
            SessionError::Protocol(ProtocolError::InvalidVersion(_)) => ErrorCode::Version,
            SessionError::Protocol(_) => ErrorCode::Protocol,
            SessionError::UnexpectedMessage { .. } => ErrorCode::UnexpectedMessage,
            SessionError::WindowExceeded { .. } | SessionError::WindowOverflow { .. } => {
                ErrorCode::Window
            }
            SessionError::PacketTooLarge { .. } => ErrorCode::PacketTooLarge,
            SessionError::PeerDisconnected { .. } => ErrorCode::PeerDisconnected,
            SessionError::TransportClosed => ErrorCode::TransportClosed,
            SessionError::HostKeyMismatch { .. } => ErrorCode::HostKeyMismatch,
            SessionError::AuthAttemptsExceeded { .. } => ErrorCode::AuthAttemptsExceeded,
            SessionError::ChannelOpenRefused { .. } => ErrorCode::ChannelOpenRefused,
            SessionError::ShellRefused => ErrorCode::ShellRefused,
            SessionError::ChannelLimit { .. } => ErrorCode::ChannelLimit,
            SessionError::UnknownChannel(_) => ErrorCode::UnknownChannel,
            SessionError::ChannelClosed(_) => ErrorCode::ChannelClosed,
            SessionError::SequenceExhausted => ErrorCode::SequenceExhausted,
            SessionError::KexInProgress => ErrorCode::KexInProgress,
            SessionError::InvalidPhase { .. } => ErrorCode::InvalidPhase,
            SessionError::WrongRole(_) => ErrorCode::WrongRole,
            SessionError::ShutDown => ErrorCode::ShutDown,
            SessionError::Terminated(_) => ErrorCode::Terminated,
            SessionError::Config(_) => ErrorCode::Config,
            SessionError::Io(_) => ErrorCode::Io,
        }
    }

    /// Whether the error ends the connection.
    ///
    /// Non-fatal errors are caller mistakes or scoped failures; the
    /// connection stays usable after them.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            SessionError::KexInProgress
                | SessionError::InvalidPhase { .. }
                | SessionError::WrongRole(_)
                | SessionError::ChannelClosed(_)
                | SessionError::ChannelLimit { .. }
                | SessionError::ShutDown
                | SessionError::Terminated(_)
                | SessionError::Config(_)
        )
    }

    /// Reason to report to the peer before tearing down, if any.
    pub(crate) fn disconnect_reason(&self) -> Option<DisconnectReason> {
        match self {
            SessionError::Protocol(ProtocolError::Decryption(_)) => Some(DisconnectReason::MacError),
            SessionError::Protocol(ProtocolError::InvalidVersion(_)) => {
                Some(DisconnectReason::ProtocolVersionNotSupported)
            }
            SessionError::Protocol(ProtocolError::NoCommonAlgorithm { .. })
            | SessionError::Protocol(ProtocolError::KeyExchange(_))
            | SessionError::Protocol(ProtocolError::InvalidSignature(_)) => {
                Some(DisconnectReason::KeyExchangeFailed)
            }
            SessionError::HostKeyMismatch { .. } => Some(DisconnectReason::HostKeyNotVerifiable),
            SessionError::Protocol(_)
            | SessionError::UnexpectedMessage { .. }
            | SessionError::WindowExceeded { .. }
            | SessionError::WindowOverflow { .. }
            | SessionError::PacketTooLarge { .. }
            | SessionError::UnknownChannel(_) => Some(DisconnectReason::ProtocolError),
            SessionError::ChannelOpenRefused { .. } | SessionError::ShellRefused => {
                Some(DisconnectReason::ByApplication)
            }
            _ => None,
        }
    }
}

/// Copyable error code recorded on the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Generic codec or crypto failure.
    Protocol,
    /// Packet authentication failed.
    Decrypt,
    /// Host signature did not verify.
    BadSignature,
    /// Algorithm negotiation failed.
    NoCommonAlgorithm,
    /// Bad identification line.
    Version,
    /// Out-of-sequence message.
    UnexpectedMessage,
    /// Window accounting violated.
    Window,
    /// Channel packet above maximum.
    PacketTooLarge,
    /// Peer sent DISCONNECT.
    PeerDisconnected,
    /// Transport end of stream.
    TransportClosed,
    /// Host key pin mismatch.
    HostKeyMismatch,
    /// Authentication attempt limit reached.
    AuthAttemptsExceeded,
    /// Channel open refused.
    ChannelOpenRefused,
    /// Shell request refused.
    ShellRefused,
    /// Channel limit reached.
    ChannelLimit,
    /// Unknown channel id.
    UnknownChannel,
    /// Channel closed for sending.
    ChannelClosed,
    /// Sequence counter exhausted.
    SequenceExhausted,
    /// Key exchange already running.
    KexInProgress,
    /// Operation not valid in the current phase.
    InvalidPhase,
    /// Operation not valid for this role.
    WrongRole,
    /// Connection shut down locally.
    ShutDown,
    /// Connection already failed.
    Terminated,
    /// Invalid configuration.
    Config,
    /// Transport I/O failure.
    Io,
}

impl ErrorCode {
    /// Stable upper-case name.
    pub fn name(self) -> &'static str {
        match self {
            ErrorCode::Protocol => "PROTOCOL",
            ErrorCode::Decrypt => "DECRYPT",
            ErrorCode::BadSignature => "BAD_SIGNATURE",
            ErrorCode::NoCommonAlgorithm => "NO_COMMON_ALGORITHM",
            ErrorCode::Version => "VERSION",
            ErrorCode::UnexpectedMessage => "UNEXPECTED_MESSAGE",
            ErrorCode::Window => "WINDOW",
            ErrorCode::PacketTooLarge => "PACKET_TOO_LARGE",
            ErrorCode::PeerDisconnected => "PEER_DISCONNECTED",
            ErrorCode::TransportClosed => "TRANSPORT_CLOSED",
            ErrorCode::HostKeyMismatch => "HOST_KEY_MISMATCH",
            ErrorCode::AuthAttemptsExceeded => "AUTH_ATTEMPTS_EXCEEDED",
            ErrorCode::ChannelOpenRefused => "CHANNEL_OPEN_REFUSED",
            ErrorCode::ShellRefused => "SHELL_REFUSED",
            ErrorCode::ChannelLimit => "CHANNEL_LIMIT",
            ErrorCode::UnknownChannel => "UNKNOWN_CHANNEL",
            ErrorCode::ChannelClosed => "CHANNEL_CLOSED",
            ErrorCode::SequenceExhausted => "SEQUENCE_EXHAUSTED",
            ErrorCode::KexInProgress => "KEX_IN_PROGRESS",
            ErrorCode::InvalidPhase => "INVALID_PHASE",
            ErrorCode::WrongRole => "WRONG_ROLE",
            ErrorCode::ShutDown => "SHUT_DOWN",
            ErrorCode::Terminated => "TERMINATED",
            ErrorCode::Config => "CONFIG",
            ErrorCode::Io => "IO",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
