//! Host keys, signatures and fingerprints.
//!
//! A responder proves its identity by signing the exchange hash of every key
//! exchange with its Ed25519 host key. Initiators identify hosts by the
//! OpenSSH-style fingerprint `SHA256:<unpadded base64 of SHA-256(public key)>`.

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use ed25519_dalek::{
    Signature as Ed25519Signature, Signer, SigningKey, Verifier, VerifyingKey, PUBLIC_KEY_LENGTH,
    SECRET_KEY_LENGTH, SIGNATURE_LENGTH,
};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{ProtocolError, Result};

/// Prefix of host key fingerprints.
pub const FINGERPRINT_PREFIX: &str = "SHA256:";

/// A 64-byte Ed25519 signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature(#[serde(with = "serde_bytes")] pub [u8; SIGNATURE_LENGTH]);

impl Signature {
    /// Creates a new Signature from raw bytes.
    pub fn from_bytes(bytes: [u8; SIGNATURE_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Parses a signature received on the wire.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; SIGNATURE_LENGTH] = bytes.try_into().map_err(|_| {
            ProtocolError::InvalidSignature(format!(
                "invalid signature length: expected {}, got {}",
                SIGNATURE_LENGTH,
                bytes.len()
            ))
        })?;
        Ok(Self(arr))
    }

    /// Returns the raw bytes of this signature.
    pub fn as_bytes(&self) -> &[u8; SIGNATURE_LENGTH] {
        &self.0
    }

    fn from_ed25519(sig: Ed25519Signature) -> Self {
        Self(sig.to_bytes())
    }

    fn as_ed25519(&self) -> Ed25519Signature {
        Ed25519Signature::from_bytes(&self.0)
    }
}

/// A host's long-term signing identity, secret key included.
#[derive(Clone)]
pub struct HostIdentity {
    signing_key: SigningKey,
    host_key: HostKey,
}

impl HostIdentity {
    /// Generates a new random host identity.
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::generate(&mut OsRng))
    }

    /// Restores a host identity from its secret key bytes.
    pub fn from_secret_key_bytes(bytes: &[u8; SECRET_KEY_LENGTH]) -> Self {
        Self::from_signing_key(SigningKey::from_bytes(bytes))
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let host_key = HostKey {
            verifying_key: signing_key.verifying_key(),
        };
        Self {
            signing_key,
            host_key,
        }
    }

    /// Returns the secret key bytes.
    ///
    /// Only use this for writing the key to protected storage.
    pub fn secret_key_bytes(&self) -> [u8; SECRET_KEY_LENGTH] {
        self.signing_key.to_bytes()
    }

    /// Returns the public half.
    pub fn host_key(&self) -> &HostKey {
        &self.host_key
    }

    /// Signs a message with the host's secret key.
    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature::from_ed25519(self.signing_key.sign(message))
    }

    /// Fingerprint of the public half.
    pub fn fingerprint(&self) -> String {
        self.host_key.fingerprint()
    }
}

impl std::fmt::Debug for HostIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostIdentity")
            .field("fingerprint", &self.fingerprint())
            .field("secret_key", &"[REDACTED]")
            .finish()
    }
}

/// A host's public key as presented during key exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostKey {
    #[serde(with = "verifying_key_serde")]
    verifying_key: VerifyingKey,
}

impl HostKey {
    /// Parses public key bytes received on the wire.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; PUBLIC_KEY_LENGTH] = bytes.try_into().map_err(|_| {
            ProtocolError::InvalidPublicKey(format!(
                "invalid public key length: expected {}, got {}",
                PUBLIC_KEY_LENGTH,
                bytes.len()
            ))
        })?;
        let verifying_key = VerifyingKey::from_bytes(&arr)
            .map_err(|e| ProtocolError::InvalidPublicKey(e.to_string()))?;
        Ok(Self { verifying_key })
    }

    /// Returns the public key bytes.
    pub fn to_bytes(&self) -> [u8; PUBLIC_KEY_LENGTH] {
        self.verifying_key.to_bytes()
    }

    /// Verifies a signature made by the matching host identity.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<()> {
        self.verifying_key
            .verify(message, &signature.as_ed25519())
            .map_err(ProtocolError::from)
    }

    /// `SHA256:` followed by the unpadded base64 digest of the key bytes.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.verifying_key.as_bytes());
        format!("{}{}", FINGERPRINT_PREFIX, STANDARD_NO_PAD.encode(digest))
    }

    /// Whether `expected` names this key.
    ///
    /// Accepts either the full fingerprint or the digest without its prefix.
    pub fn matches_fingerprint(&self, expected: &str) -> bool {
        let expected = expected.trim();
        let expected = expected.strip_prefix(FINGERPRINT_PREFIX).unwrap_or(expected);
        let ours = self.fingerprint();
        ours[FINGERPRINT_PREFIX.len()..] == *expected.trim_end_matches('=')
    }
}

impl std::fmt::Display for HostKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.fingerprint())
    }
}

mod verifying_key_serde {
    use ed25519_dalek::{VerifyingKey, PUBLIC_KEY_LENGTH};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(key: &VerifyingKey, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serde_bytes::Bytes::new(key.as_bytes()).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<VerifyingKey, D::Error>
    where
        D: Deserializer<'de>,
    {
        let bytes: serde_bytes::ByteBuf = Deserialize::deserialize(deserializer)?;
        let arr: [u8; PUBLIC_KEY_LENGTH] = bytes.as_slice().try_into().map_err(|_| {
            serde::de::Error::custom(format!(
                "invalid public key length: expected {}, got {}",
                PUBLIC_KEY_LENGTH,
                bytes.len()
            ))
        })?;
        VerifyingKey::from_bytes(&arr).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_identities_differ() {
        let a = HostIdentity::generate();
        let b = HostIdentity::generate();
        assert_ne!(a.secret_key_bytes(), b.secret_key_bytes());
        assert_ne!(a.host_key(), b.host_key());
    }

    #[test]
    fn test_restore_from_secret_bytes() {
        let original = HostIdentity::generate();
        let restored = HostIdentity::from_secret_key_bytes(&original.secret_key_bytes());
        assert_eq!(original.host_key(), restored.host_key());
        assert_eq!(original.fingerprint(), restored.fingerprint());
    }

    #[test]
    fn test_sign_and_verify() {
        let identity = HostIdentity::generate();
        let signature = identity.sign(b"exchange hash");
        assert!(identity.host_key().verify(b"exchange hash", &signature).is_ok());
        assert!(identity.host_key().verify(b"other hash", &signature).is_err());
    }

    #[test]
    fn test_verify_with_wrong_key_fails() {
        let signer = HostIdentity::generate();
        let other = HostIdentity::generate();
        let signature = signer.sign(b"message");
        assert!(other.host_key().verify(b"message", &signature).is_err());
    }

    #[test]
    fn test_corrupted_signature_fails() {
        let identity = HostIdentity::generate();
        let mut bytes = *identity.sign(b"message").as_bytes();
        bytes[0] ^= 0xFF;
        let corrupted = Signature::from_bytes(bytes);
        assert!(identity.host_key().verify(b"message", &corrupted).is_err());
    }

    #[test]
    fn test_signature_from_slice_length_checked() {
        assert!(matches!(
            Signature::from_slice(&[0u8; 10]),
            Err(ProtocolError::InvalidSignature(_))
        ));
    }

    #[test]
    fn test_host_key_from_bytes() {
        let identity = HostIdentity::generate();
        let bytes = identity.host_key().to_bytes();
        let parsed = HostKey::from_bytes(&bytes).unwrap();
        assert_eq!(&parsed, identity.host_key());

        assert!(matches!(
            HostKey::from_bytes(&bytes[..31]),
            Err(ProtocolError::InvalidPublicKey(_))
        ));
    }

    #[test]
    fn test_fingerprint_format() {
        let identity = HostIdentity::generate();
        let fingerprint = identity.fingerprint();
        assert!(fingerprint.starts_with("SHA256:"));
        // 32 digest bytes are 43 base64 characters without padding
        assert_eq!(fingerprint.len(), "SHA256:".len() + 43);
        assert!(!fingerprint.ends_with('='));
    }

    #[test]
    fn test_matches_fingerprint() {
        let identity = HostIdentity::generate();
        let key = identity.host_key();
        let fingerprint = key.fingerprint();
        assert!(key.matches_fingerprint(&fingerprint));
        assert!(key.matches_fingerprint(&fingerprint["SHA256:".len()..]));
        assert!(key.matches_fingerprint(&format!("{}=", fingerprint)));
        assert!(!HostIdentity::generate().host_key().matches_fingerprint(&fingerprint));
    }

    #[test]
    fn test_host_key_display_is_fingerprint() {
        let identity = HostIdentity::generate();
        assert_eq!(identity.host_key().to_string(), identity.fingerprint());
    }

    #[test]
    fn test_host_key_serialization() {
        let key = *HostIdentity::generate().host_key();

        let json = serde_json::to_string(&key).unwrap();
        let restored: HostKey = serde_json::from_str(&json).unwrap();
        assert_eq!(key, restored);

        let msgpack = rmp_serde::to_vec(&key).unwrap();
        let restored: HostKey = rmp_serde::from_slice(&msgpack).unwrap();
        assert_eq!(key, restored);
    }

    #[test]
    fn test_identity_debug_redacts_secret() {
        let debug = format!("{:?}", HostIdentity::generate());
        assert!(debug.contains("REDACTED"));
        assert!(debug.contains("fingerprint"));
    }
}
