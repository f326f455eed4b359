//! Algorithm negotiation, exchange transcripts and key agreement.
//!
//! Key agreement runs the Noise NN pattern over the KEXDH messages:
//!
//! ```text
//! -> e          (KexDhInit.ephemeral)
//! <- e, ee      (KexDhReply.ephemeral)
//! ```
//!
//! Everything negotiated before the agreement (both identification lines,
//! both KEXINIT payloads, group exchange parameters and, on re-key, the
//! session id) is hashed into the Noise prologue, so a tampered transcript
//! makes the two sides derive different keys. The exchange hash is
//! `SHA-256(handshake hash || host key)`; the responder signs it with its
//! host key. The first exchange hash of a connection becomes its session id.
//!
//! Once agreed, the keys run in stateless transport mode with the packet
//! sequence number as the nonce.

use std::fmt;

use rand::RngCore;
use sha2::{Digest, Sha256};
use snow::{Builder, HandshakeState, StatelessTransportState};

use crate::crypto::{HostIdentity, HostKey, Signature};
use crate::error::{ProtocolError, Result};
use crate::framing::MAX_BODY_SIZE;
use crate::messages::{KexDhReply, KexGexGroup, KexGexRequest, KexInit, KEX_COOKIE_LENGTH};

/// Group exchange lower bound requested by initiators.
pub const GEX_MIN_BITS: u32 = 1024;

/// Group exchange size requested by initiators.
pub const GEX_PREFERRED_BITS: u32 = 3072;

/// Group exchange upper bound requested by initiators.
pub const GEX_MAX_BITS: u32 = 8192;

/// Length of an exchange hash.
pub const EXCHANGE_HASH_LENGTH: usize = 32;

/// A named algorithm that can appear in a KEXINIT list.
pub trait Algorithm: Copy + Sized + 'static {
    /// Which list the algorithm belongs to, for error messages.
    const KIND: &'static str;

    /// Every supported algorithm, in default preference order.
    fn all() -> &'static [Self];

    /// Wire name.
    fn name(self) -> &'static str;

    /// Look up a wire name.
    fn from_name(name: &str) -> Option<Self> {
        Self::all().iter().copied().find(|alg| alg.name() == name)
    }

    /// Default preference list as wire names.
    fn default_names() -> Vec<String> {
        Self::all().iter().map(|alg| alg.name().to_string()).collect()
    }
}

/// Key exchange algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KexAlgorithm {
    /// X25519 with SHA-256.
    Curve25519Sha256,
    /// X25519 with BLAKE2s.
    Curve25519Blake2s,
    /// X25519 with SHA-256, preceded by a group exchange round.
    Curve25519GexSha256,
}

impl KexAlgorithm {
    /// Whether the initiator sends a group exchange request first.
    pub fn uses_group_exchange(self) -> bool {
        matches!(self, KexAlgorithm::Curve25519GexSha256)
    }

    fn noise_hash(self) -> &'static str {
        match self {
            KexAlgorithm::Curve25519Sha256 | KexAlgorithm::Curve25519GexSha256 => "SHA256",
            KexAlgorithm::Curve25519Blake2s => "BLAKE2s",
        }
    }
}

impl Algorithm for KexAlgorithm {
    const KIND: &'static str = "kex";

    fn all() -> &'static [Self] {
        &[
            KexAlgorithm::Curve25519Sha256,
            KexAlgorithm::Curve25519Blake2s,
            KexAlgorithm::Curve25519GexSha256,
        ]
    }

    fn name(self) -> &'static str {
        match self {
            KexAlgorithm::Curve25519Sha256 => "curve25519-sha256",
            KexAlgorithm::Curve25519Blake2s => "curve25519-blake2s",
            KexAlgorithm::Curve25519GexSha256 => "curve25519-gex-sha256",
        }
    }
}

/// Packet ciphers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CipherAlgorithm {
    /// ChaCha20-Poly1305.
    ChaCha20Poly1305,
    /// AES-256-GCM.
    Aes256Gcm,
}

impl CipherAlgorithm {
    fn noise_cipher(self) -> &'static str {
        match self {
            CipherAlgorithm::ChaCha20Poly1305 => "ChaChaPoly",
            CipherAlgorithm::Aes256Gcm => "AESGCM",
        }
    }
}

impl Algorithm for CipherAlgorithm {
    const KIND: &'static str = "cipher";

    fn all() -> &'static [Self] {
        &[CipherAlgorithm::ChaCha20Poly1305, CipherAlgorithm::Aes256Gcm]
    }

    fn name(self) -> &'static str {
        match self {
            CipherAlgorithm::ChaCha20Poly1305 => "chacha20-poly1305",
            CipherAlgorithm::Aes256Gcm => "aes256-gcm",
        }
    }
}

/// Payload compression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompressionAlgorithm {
    /// No compression.
    None,
    /// LZ4 block compression of large payloads.
    Lz4,
}

impl Algorithm for CompressionAlgorithm {
    const KIND: &'static str = "compression";

    fn all() -> &'static [Self] {
        &[CompressionAlgorithm::None, CompressionAlgorithm::Lz4]
    }

    fn name(self) -> &'static str {
        match self {
            CompressionAlgorithm::None => "none",
            CompressionAlgorithm::Lz4 => "lz4",
        }
    }
}

/// Pick the first initiator algorithm the responder also lists.
///
/// Names we do not implement are skipped on both sides.
pub fn negotiate<A: Algorithm>(initiator: &[String], responder: &[String]) -> Result<A> {
    initiator
        .iter()
        .filter(|name| responder.contains(*name))
        .find_map(|name| A::from_name(name))
        .ok_or_else(|| ProtocolError::NoCommonAlgorithm {
            kind: A::KIND,
            ours: initiator.join(","),
            theirs: responder.join(","),
        })
}

/// Verify that every name in a configured list is supported.
pub fn validate_names<A: Algorithm>(names: &[String]) -> Result<()> {
    if names.is_empty() {
        return Err(ProtocolError::UnsupportedAlgorithm(format!(
            "empty {} algorithm list",
            A::KIND
        )));
    }
    match names.iter().find(|name| A::from_name(name).is_none()) {
        Some(unknown) => Err(ProtocolError::UnsupportedAlgorithm(format!(
            "{} algorithm {:?}",
            A::KIND,
            unknown
        ))),
        None => Ok(()),
    }
}

/// The algorithms agreed for one key exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Negotiated {
    /// Key exchange method.
    pub kex: KexAlgorithm,
    /// Packet cipher.
    pub cipher: CipherAlgorithm,
    /// Payload compression.
    pub compression: CompressionAlgorithm,
}

impl Negotiated {
    /// Negotiate every list of two KEXINIT messages.
    pub fn from_kex_inits(initiator: &KexInit, responder: &KexInit) -> Result<Self> {
        Ok(Self {
            kex: negotiate(&initiator.kex_algorithms, &responder.kex_algorithms)?,
            cipher: negotiate(&initiator.cipher_algorithms, &responder.cipher_algorithms)?,
            compression: negotiate(
                &initiator.compression_algorithms,
                &responder.compression_algorithms,
            )?,
        })
    }
}

impl fmt::Display for Negotiated {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.kex.name(),
            self.cipher.name(),
            self.compression.name()
        )
    }
}

/// Build a KEXINIT with a fresh random cookie.
pub fn new_kex_init(kex: &[String], ciphers: &[String], compression: &[String]) -> KexInit {
    let mut cookie = vec![0u8; KEX_COOKIE_LENGTH];
    rand::thread_rng().fill_bytes(&mut cookie);
    KexInit {
        cookie,
        kex_algorithms: kex.to_vec(),
        cipher_algorithms: ciphers.to_vec(),
        compression_algorithms: compression.to_vec(),
    }
}

/// The group exchange request initiators send.
pub fn default_gex_request() -> KexGexRequest {
    KexGexRequest {
        min_bits: GEX_MIN_BITS,
        preferred_bits: GEX_PREFERRED_BITS,
        max_bits: GEX_MAX_BITS,
    }
}

/// Answer a group exchange request with fresh parameters.
pub fn answer_gex_request(request: &KexGexRequest) -> Result<KexGexGroup> {
    if request.min_bits > request.preferred_bits || request.preferred_bits > request.max_bits {
        return Err(ProtocolError::KeyExchange(format!(
            "inconsistent group size request {}/{}/{}",
            request.min_bits, request.preferred_bits, request.max_bits
        )));
    }
    let bits = request.preferred_bits.clamp(GEX_MIN_BITS, GEX_MAX_BITS);
    if bits < request.min_bits || bits > request.max_bits {
        return Err(ProtocolError::KeyExchange(format!(
            "no group between {} and {} bits",
            request.min_bits, request.max_bits
        )));
    }
    let mut parameters = vec![0u8; (bits / 8) as usize];
    rand::thread_rng().fill_bytes(&mut parameters);
    Ok(KexGexGroup { parameters })
}

/// Accumulates what both sides said before key agreement.
///
/// Each field is length-prefixed before hashing.
#[derive(Clone, Default)]
pub struct ExchangeTranscript {
    hasher: Sha256,
}

impl ExchangeTranscript {
    /// Start a transcript, bound to the session id on re-key.
    pub fn new(session_id: Option<&[u8]>) -> Self {
        let mut transcript = Self::default();
        transcript.absorb(b"shellwire-kex");
        transcript.absorb(session_id.unwrap_or_default());
        transcript
    }

    /// Add one field.
    pub fn absorb(&mut self, field: &[u8]) {
        self.hasher.update((field.len() as u32).to_be_bytes());
        self.hasher.update(field);
    }

    /// Add the identification lines and KEXINIT payloads, initiator first.
    pub fn absorb_negotiation(
        &mut self,
        initiator_version: &str,
        responder_version: &str,
        initiator_kex_init: &[u8],
        responder_kex_init: &[u8],
    ) {
        self.absorb(initiator_version.as_bytes());
        self.absorb(responder_version.as_bytes());
        self.absorb(initiator_kex_init);
        self.absorb(responder_kex_init);
    }

    /// Add a group exchange round.
    pub fn absorb_group_exchange(&mut self, request: &KexGexRequest, group: &KexGexGroup) {
        let mut sizes = Vec::with_capacity(12);
        sizes.extend_from_slice(&request.min_bits.to_be_bytes());
        sizes.extend_from_slice(&request.preferred_bits.to_be_bytes());
        sizes.extend_from_slice(&request.max_bits.to_be_bytes());
        self.absorb(&sizes);
        self.absorb(&group.parameters);
    }

    /// The Noise prologue.
    pub fn prologue(&self) -> [u8; 32] {
        self.hasher.clone().finalize().into()
    }
}

impl fmt::Debug for ExchangeTranscript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExchangeTranscript").finish_non_exhaustive()
    }
}

/// Phase of a key agreement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KexPhase {
    /// Initiator: ready to send the ephemeral key.
    InitiatorStart,
    /// Initiator: waiting for the reply.
    InitiatorWaitingForReply,
    /// Responder: waiting for the initiator's ephemeral key.
    ResponderStart,
    /// Agreement finished.
    Complete,
}

/// Role in the key agreement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Sends the first key agreement message (client).
    Initiator,
    /// Answers and signs (server).
    Responder,
}

/// Result of a finished key agreement.
pub struct KexOutput {
    /// Hash over the exchange, signed by the responder.
    pub exchange_hash: [u8; EXCHANGE_HASH_LENGTH],
    /// The responder's host key.
    pub host_key: HostKey,
    /// Keys for packets from here on.
    pub keys: SessionKeys,
}

impl fmt::Debug for KexOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KexOutput")
            .field("host_key", &self.host_key.fingerprint())
            .field("keys", &self.keys)
            .finish()
    }
}

/// A running key agreement.
pub trait KeyAgreement {
    /// Current phase.
    fn phase(&self) -> KexPhase;

    /// Whether the agreement has produced keys.
    fn is_complete(&self) -> bool {
        self.phase() == KexPhase::Complete
    }
}

/// Noise NN key agreement.
pub struct NoiseKex {
    handshake: Option<HandshakeState>,
    phase: KexPhase,
    role: Role,
    cipher: CipherAlgorithm,
    buffer: Vec<u8>,
}

impl NoiseKex {
    fn build(negotiated: &Negotiated, prologue: &[u8], role: Role) -> Result<Self> {
        let pattern = format!(
            "Noise_NN_25519_{}_{}",
            negotiated.cipher.noise_cipher(),
            negotiated.kex.noise_hash()
        );
        let params = pattern
            .parse()
            .map_err(|e| ProtocolError::KeyExchange(format!("invalid noise pattern: {}", e)))?;
        let builder = Builder::new(params).prologue(prologue);
        let (handshake, phase) = match role {
            Role::Initiator => (builder.build_initiator()?, KexPhase::InitiatorStart),
            Role::Responder => (builder.build_responder()?, KexPhase::ResponderStart),
        };
        Ok(Self {
            handshake: Some(handshake),
            phase,
            role,
            cipher: negotiated.cipher,
            buffer: vec![0u8; MAX_BODY_SIZE],
        })
    }

    /// Start as the initiator.
    pub fn new_initiator(negotiated: &Negotiated, prologue: &[u8]) -> Result<Self> {
        Self::build(negotiated, prologue, Role::Initiator)
    }

    /// Start as the responder.
    pub fn new_responder(negotiated: &Negotiated, prologue: &[u8]) -> Result<Self> {
        Self::build(negotiated, prologue, Role::Responder)
    }

    /// Role in the agreement.
    pub fn role(&self) -> Role {
        self.role
    }

    fn handshake_mut(&mut self) -> Result<&mut HandshakeState> {
        self.handshake
            .as_mut()
            .ok_or(ProtocolError::KeyExchangeIncomplete)
    }

    /// Initiator: produce the ephemeral key message.
    pub fn initiator_message(&mut self) -> Result<Vec<u8>> {
        if self.phase != KexPhase::InitiatorStart {
            return Err(ProtocolError::KeyExchange(format!(
                "cannot send ephemeral key in phase {:?}",
                self.phase
            )));
        }
        let mut buffer = std::mem::take(&mut self.buffer);
        let len = self.handshake_mut()?.write_message(&[], &mut buffer)?;
        let message = buffer[..len].to_vec();
        self.buffer = buffer;
        self.phase = KexPhase::InitiatorWaitingForReply;
        Ok(message)
    }

    /// Responder: consume the initiator's message and produce the signed
    /// reply together with the agreed keys.
    pub fn respond(
        &mut self,
        initiator_message: &[u8],
        host: &HostIdentity,
    ) -> Result<(KexDhReply, KexOutput)> {
        if self.phase != KexPhase::ResponderStart {
            return Err(ProtocolError::KeyExchange(format!(
                "cannot answer in phase {:?}",
                self.phase
            )));
        }
        let mut buffer = std::mem::take(&mut self.buffer);
        let handshake = self.handshake_mut()?;
        handshake.read_message(initiator_message, &mut buffer)?;
        let len = handshake.write_message(&[], &mut buffer)?;
        let ephemeral = buffer[..len].to_vec();
        self.buffer = buffer;

        let host_key = *host.host_key();
        let exchange_hash = self.exchange_hash(&host_key)?;
        let signature = host.sign(&exchange_hash);
        let keys = self.into_keys()?;

        let reply = KexDhReply {
            host_key: host_key.to_bytes().to_vec(),
            ephemeral,
            signature: signature.as_bytes().to_vec(),
        };
        Ok((
            reply,
            KexOutput {
                exchange_hash,
                host_key,
                keys,
            },
        ))
    }

    /// Initiator: consume the reply, verify the host signature and produce
    /// the agreed keys.
    pub fn finish(&mut self, reply: &KexDhReply) -> Result<KexOutput> {
        if self.phase != KexPhase::InitiatorWaitingForReply {
            return Err(ProtocolError::KeyExchange(format!(
                "unexpected reply in phase {:?}",
                self.phase
            )));
        }
        let host_key = HostKey::from_bytes(&reply.host_key)?;
        let signature = Signature::from_slice(&reply.signature)?;

        let mut buffer = std::mem::take(&mut self.buffer);
        self.handshake_mut()?.read_message(&reply.ephemeral, &mut buffer)?;
        self.buffer = buffer;

        let exchange_hash = self.exchange_hash(&host_key)?;
        host_key.verify(&exchange_hash, &signature)?;
        let keys = self.into_keys()?;
        Ok(KexOutput {
            exchange_hash,
            host_key,
            keys,
        })
    }

    fn exchange_hash(&self, host_key: &HostKey) -> Result<[u8; EXCHANGE_HASH_LENGTH]> {
        let handshake = self
            .handshake
            .as_ref()
            .ok_or(ProtocolError::KeyExchangeIncomplete)?;
        let mut hasher = Sha256::new();
        hasher.update(handshake.get_handshake_hash());
        hasher.update(host_key.to_bytes());
        Ok(hasher.finalize().into())
    }

    fn into_keys(&mut self) -> Result<SessionKeys> {
        let handshake = self
            .handshake
            .take()
            .ok_or(ProtocolError::KeyExchangeIncomplete)?;
        if !handshake.is_handshake_finished() {
            return Err(ProtocolError::KeyExchangeIncomplete);
        }
        let transport = handshake.into_stateless_transport_mode()?;
        self.phase = KexPhase::Complete;
        Ok(SessionKeys {
            transport,
            cipher: self.cipher,
        })
    }
}

impl KeyAgreement for NoiseKex {
    fn phase(&self) -> KexPhase {
        self.phase
    }
}

impl fmt::Debug for NoiseKex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NoiseKex")
            .field("phase", &self.phase)
            .field("role", &self.role)
            .field("cipher", &self.cipher)
            .finish()
    }
}

/// Packet keys for both directions.
///
/// Sealing and opening take the packet sequence number as the nonce, so
/// the keys themselves are immutable and can be shared.
pub struct SessionKeys {
    transport: StatelessTransportState,
    cipher: CipherAlgorithm,
}

impl SessionKeys {
    /// The cipher these keys use.
    pub fn cipher(&self) -> CipherAlgorithm {
        self.cipher
    }

    /// Encrypt an outgoing body.
    pub fn seal(&self, sequence: u32, plaintext: &[u8]) -> Result<Vec<u8>> {
        if plaintext.len() + crate::framing::AEAD_TAG_SIZE > MAX_BODY_SIZE {
            return Err(ProtocolError::Encryption(format!(
                "plaintext too large: {} bytes",
                plaintext.len()
            )));
        }
        let mut out = vec![0u8; plaintext.len() + crate::framing::AEAD_TAG_SIZE];
        let len = self
            .transport
            .write_message(u64::from(sequence), plaintext, &mut out)?;
        out.truncate(len);
        Ok(out)
    }

    /// Decrypt and authenticate an incoming body.
    pub fn open(&self, sequence: u32, ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.len() < crate::framing::AEAD_TAG_SIZE {
            return Err(ProtocolError::Decryption(format!(
                "ciphertext shorter than the authentication tag: {} bytes",
                ciphertext.len()
            )));
        }
        let mut out = vec![0u8; ciphertext.len()];
        let len = self
            .transport
            .read_message(u64::from(sequence), ciphertext, &mut out)?;
        out.truncate(len);
        Ok(out)
    }
}

impl fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionKeys")
            .field("cipher", &self.cipher)
            .field("keys", &"[REDACTED]")
            .finish()
    }
}
