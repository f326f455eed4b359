//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering codec and cryptographic failures.
#[derive(Debug, Error)]
pub enum ProtocolError {
    // Serialization errors
    /// Failed to serialize data.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Failed to deserialize data.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    // Cryptographic errors
    /// Encryption operation failed.
    #[error("encryption failed: {0}")]
    Encryption(String),

    /// Decryption operation failed.
    #[error("decryption failed: {0}")]
    Decryption(String),

    /// Signature verification failed.
    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    /// Invalid or malformed public key.
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    // Key exchange errors
    /// The key agreement failed.
    #[error("key exchange failed: {0}")]
    KeyExchange(String),

    /// Attempted to derive keys before the key agreement finished.
    #[error("key exchange incomplete: cannot derive keys before the exchange is finished")]
    KeyExchangeIncomplete,

    /// The two algorithm lists have nothing in common.
    #[error("no common {kind} algorithm (ours: {ours}, theirs: {theirs})")]
    NoCommonAlgorithm {
        /// Which list failed to match ("kex", "cipher", "compression").
        kind: &'static str,
        /// Our list, comma separated.
        ours: String,
        /// The peer's list, comma separated.
        theirs: String,
    },

    /// An algorithm name we do not implement.
    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    // Frame errors
    /// Frame exceeds maximum allowed size.
    #[error("frame too large: {size} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge {
        /// Actual frame size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// Frame content could not be interpreted.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    // Version exchange errors
    /// The peer's identification line is not acceptable.
    #[error("invalid version identification: {0}")]
    InvalidVersion(String),
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

// Conversions from underlying crate errors

impl From<rmp_serde::encode::Error> for ProtocolError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        ProtocolError::Serialization(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for ProtocolError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        ProtocolError::Deserialization(err.to_string())
    }
}

impl From<snow::Error> for ProtocolError {
    fn from(err: snow::Error) -> Self {
        match err {
            snow::Error::Decrypt => ProtocolError::Decryption(err.to_string()),
            snow::Error::Pattern(_) | snow::Error::Init(_) | snow::Error::Prereq(_) => {
                ProtocolError::KeyExchange(err.to_string())
            }
            snow::Error::State(_) | snow::Error::Input => {
                ProtocolError::KeyExchange(err.to_string())
            }
            _ => ProtocolError::Encryption(err.to_string()),
        }
    }
}

impl From<ed25519_dalek::SignatureError> for ProtocolError {
    fn from(err: ed25519_dalek::SignatureError) -> Self {
        ProtocolError::InvalidSignature(err.to_string())
    }
}
