//! Key exchange sub-machine.
//!
//! Runs both the first key exchange of a connection and every re-key. An
//! exchange starts when either side sends KEXINIT and ends once NEWKEYS has
//! been both sent and received. Between our KEXINIT and our NEWKEYS nothing
//! but key exchange traffic may be sent; between the peer's KEXINIT and its
//! NEWKEYS nothing else may be received.
//!
//! The initiator's first agreement message is sent by the handshake state
//! machine, which decides between a group exchange request and a direct
//! exchange. On re-key there is no handshake driving, so the initiator
//! starts the agreement itself as soon as the algorithms are negotiated.

use std::sync::Arc;

use protocol::kex::{answer_gex_request, default_gex_request, new_kex_init, EXCHANGE_HASH_LENGTH};
use protocol::messages::{KexDhInit, KexGexRequest, KexInit};
use protocol::{
    CompressionAlgorithm, ExchangeTranscript, HostIdentity, HostKey, KeyAgreement, Message,
    Negotiated, NoiseKex, ProtocolError, Role, SessionKeys,
};

use crate::config::SessionConfig;
use crate::error::{Result, SessionError};
use crate::packet::PacketIo;

/// What the key exchange needs to know about the connection.
pub(crate) struct KexContext<'a> {
    pub role: Role,
    /// Our identification line without terminator.
    pub local_version: &'a str,
    /// The peer's identification line without terminator.
    pub peer_version: &'a str,
    /// Set once the first exchange has completed.
    pub session_id: Option<&'a [u8]>,
    /// Responder only.
    pub host_identity: Option<&'a HostIdentity>,
    /// The host key agreed by the first exchange.
    pub known_host_key: Option<&'a HostKey>,
    pub config: &'a SessionConfig,
}

impl KexContext<'_> {
    fn versions(&self) -> (&str, &str) {
        match self.role {
            Role::Initiator => (self.local_version, self.peer_version),
            Role::Responder => (self.peer_version, self.local_version),
        }
    }
}

/// A finished exchange.
#[derive(Debug, Clone)]
pub(crate) struct KexCompleted {
    pub exchange_hash: [u8; EXCHANGE_HASH_LENGTH],
    pub host_key: HostKey,
    pub negotiated: Negotiated,
    pub rekey: bool,
}

/// Outcome of handling one key exchange message.
#[derive(Debug)]
pub(crate) enum KexEvent {
    /// Nothing the connection needs to act on.
    None,
    /// Both KEXINITs are known and the algorithms agreed.
    Negotiated(Negotiated),
    /// Both sides switched to the new keys.
    Completed(KexCompleted),
}

struct Agreed {
    exchange_hash: [u8; EXCHANGE_HASH_LENGTH],
    host_key: HostKey,
    keys: Arc<SessionKeys>,
}

/// State of the exchange in flight.
#[derive(Default)]
struct Exchange {
    local_init: Option<(KexInit, Vec<u8>)>,
    peer_init: Option<(KexInit, Vec<u8>)>,
    negotiated: Option<Negotiated>,
    transcript: Option<ExchangeTranscript>,
    gex_request: Option<KexGexRequest>,
    agreement: Option<NoiseKex>,
    agreed: Option<Agreed>,
    new_keys_sent: bool,
    new_keys_received: bool,
}

/// Drives key exchanges for one connection.
pub(crate) struct Keying {
    role: Role,
    exchange: Exchange,
    completed: u32,
}

fn unexpected(message: &Message, context: &str) -> SessionError {
    SessionError::UnexpectedMessage {
        message: message.kind(),
        context: context.to_string(),
    }
}

impl Keying {
    pub(crate) fn new(role: Role) -> Self {
        Self {
            role,
            exchange: Exchange::default(),
            completed: 0,
        }
    }

    /// Whether an exchange has started and not yet completed.
    pub(crate) fn in_progress(&self) -> bool {
        self.exchange.local_init.is_some() || self.exchange.peer_init.is_some()
    }

    /// We sent KEXINIT but not yet NEWKEYS.
    pub(crate) fn outbound_blocked(&self) -> bool {
        self.exchange.local_init.is_some() && !self.exchange.new_keys_sent
    }

    /// The peer sent KEXINIT but not yet NEWKEYS.
    pub(crate) fn inbound_restricted(&self) -> bool {
        self.exchange.peer_init.is_some() && !self.exchange.new_keys_received
    }

    /// Completed exchanges.
    pub(crate) fn completed(&self) -> u32 {
        self.completed
    }

    /// Start an exchange by sending our KEXINIT.
    pub(crate) fn begin(&mut self, ctx: &KexContext<'_>, io: &mut PacketIo) -> Result<()> {
        if self.in_progress() {
            return Err(SessionError::KexInProgress);
        }
        self.send_kex_init(ctx, io)
    }

    fn send_kex_init(&mut self, ctx: &KexContext<'_>, io: &mut PacketIo) -> Result<()> {
        let init = new_kex_init(
            &ctx.config.kex_algorithms,
            &ctx.config.cipher_algorithms,
            &ctx.config.compression_algorithms,
        );
        let message = Message::KexInit(init.clone());
        let payload = message.to_msgpack()?;
        io.queue(&message)?;
        self.exchange.local_init = Some((init, payload));
        tracing::debug!(role = ?self.role, rekey = self.completed > 0, "Sent KEXINIT");
        Ok(())
    }

    /// Initiator: send the first agreement message for the negotiated
    /// key exchange.
    pub(crate) fn start_agreement(&mut self, io: &mut PacketIo) -> Result<()> {
        let negotiated = self
            .exchange
            .negotiated
            .ok_or(ProtocolError::KeyExchangeIncomplete)?;
        if self.role != Role::Initiator {
            return Err(SessionError::WrongRole(self.role));
        }
        if self.exchange.gex_request.is_some() || self.exchange.agreement.is_some() {
            return Err(ProtocolError::KeyExchange("agreement already started".to_string()).into());
        }

        if negotiated.kex.uses_group_exchange() {
            let request = default_gex_request();
            io.queue(&Message::KexGexRequest(request.clone()))?;
            self.exchange.gex_request = Some(request);
            Ok(())
        } else {
            self.send_dh_init(negotiated, io)
        }
    }

    fn send_dh_init(&mut self, negotiated: Negotiated, io: &mut PacketIo) -> Result<()> {
        let prologue = self.prologue()?;
        let mut agreement = NoiseKex::new_initiator(&negotiated, &prologue)?;
        let ephemeral = agreement.initiator_message()?;
        io.queue(&Message::KexDhInit(KexDhInit { ephemeral }))?;
        self.exchange.agreement = Some(agreement);
        Ok(())
    }

    fn prologue(&self) -> Result<[u8; 32]> {
        let transcript = self
            .exchange
            .transcript
            .as_ref()
            .ok_or(ProtocolError::KeyExchangeIncomplete)?;
        Ok(transcript.prologue())
    }

    fn negotiate(&mut self, ctx: &KexContext<'_>, io: &mut PacketIo) -> Result<Negotiated> {
        let (Some(local), Some(peer)) = (&self.exchange.local_init, &self.exchange.peer_init)
        else {
            return Err(ProtocolError::KeyExchangeIncomplete.into());
        };
        let (initiator, responder) = match self.role {
            Role::Initiator => (local, peer),
            Role::Responder => (peer, local),
        };

        let negotiated = Negotiated::from_kex_inits(&initiator.0, &responder.0)?;
        let (initiator_version, responder_version) = ctx.versions();
        let mut transcript = ExchangeTranscript::new(ctx.session_id);
        transcript.absorb_negotiation(
            initiator_version,
            responder_version,
            &initiator.1,
            &responder.1,
        );

        self.exchange.negotiated = Some(negotiated);
        self.exchange.transcript = Some(transcript);
        tracing::debug!(role = ?self.role, algorithms = %negotiated, "Negotiated algorithms");

        if self.role == Role::Initiator && ctx.session_id.is_some() {
            self.start_agreement(io)?;
        }
        Ok(negotiated)
    }

    /// Handle one key exchange message.
    pub(crate) fn handle(
        &mut self,
        message: Message,
        payload: &[u8],
        ctx: &KexContext<'_>,
        io: &mut PacketIo,
    ) -> Result<KexEvent> {
        match message {
            Message::KexInit(init) => {
                if self.exchange.peer_init.is_some() {
                    return Err(unexpected(&Message::KexInit(init), "key exchange"));
                }
                self.exchange.peer_init = Some((init, payload.to_vec()));
                if self.exchange.local_init.is_none() {
                    self.send_kex_init(ctx, io)?;
                }
                let negotiated = self.negotiate(ctx, io)?;
                Ok(KexEvent::Negotiated(negotiated))
            }

            Message::KexGexRequest(request) => {
                let negotiated = match self.exchange.negotiated {
                    Some(n)
                        if self.role == Role::Responder
                            && n.kex.uses_group_exchange()
                            && self.exchange.gex_request.is_none() =>
                    {
                        n
                    }
                    _ => return Err(unexpected(&Message::KexGexRequest(request), "key exchange")),
                };
                let group = answer_gex_request(&request)?;
                let transcript = self
                    .exchange
                    .transcript
                    .as_mut()
                    .ok_or(ProtocolError::KeyExchangeIncomplete)?;
                transcript.absorb_group_exchange(&request, &group);
                let prologue = transcript.prologue();

                io.queue(&Message::KexGexGroup(group))?;
                self.exchange.gex_request = Some(request);
                self.exchange.agreement = Some(NoiseKex::new_responder(&negotiated, &prologue)?);
                Ok(KexEvent::None)
            }

            Message::KexGexGroup(group) => {
                let (negotiated, request) = match (self.exchange.negotiated, &self.exchange.gex_request) {
                    (Some(n), Some(request))
                        if self.role == Role::Initiator && self.exchange.agreement.is_none() =>
                    {
                        (n, request.clone())
                    }
                    _ => return Err(unexpected(&Message::KexGexGroup(group), "key exchange")),
                };
                self.exchange
                    .transcript
                    .as_mut()
                    .ok_or(ProtocolError::KeyExchangeIncomplete)?
                    .absorb_group_exchange(&request, &group);
                self.send_dh_init(negotiated, io)?;
                Ok(KexEvent::None)
            }

            Message::KexDhInit(init) => {
                let negotiated = match self.exchange.negotiated {
                    Some(n) if self.role == Role::Responder && self.exchange.agreed.is_none() => n,
                    _ => return Err(unexpected(&Message::KexDhInit(init), "key exchange")),
                };
                if self.exchange.agreement.is_none() {
                    if negotiated.kex.uses_group_exchange() {
                        return Err(unexpected(
                            &Message::KexDhInit(init),
                            "group exchange before its request",
                        ));
                    }
                    let prologue = self.prologue()?;
                    self.exchange.agreement = Some(NoiseKex::new_responder(&negotiated, &prologue)?);
                }
                let host = ctx.host_identity.ok_or_else(|| {
                    ProtocolError::KeyExchange("responder has no host identity".to_string())
                })?;
                let agreement = self
                    .exchange
                    .agreement
                    .as_mut()
                    .ok_or(ProtocolError::KeyExchangeIncomplete)?;
                let (reply, output) = agreement.respond(&init.ephemeral, host)?;

                io.queue(&Message::KexDhReply(reply))?;
                self.exchange.agreed = Some(Agreed {
                    exchange_hash: output.exchange_hash,
                    host_key: output.host_key,
                    keys: Arc::new(output.keys),
                });
                self.send_new_keys(io)?;
                Ok(self.try_complete())
            }

            Message::KexDhReply(reply) => {
                let waiting = self.role == Role::Initiator
                    && self.exchange.agreed.is_none()
                    && self
                        .exchange
                        .agreement
                        .as_ref()
                        .is_some_and(|a| !a.is_complete());
                if !waiting {
                    return Err(unexpected(&Message::KexDhReply(reply), "key exchange"));
                }
                let agreement = self
                    .exchange
                    .agreement
                    .as_mut()
                    .ok_or(ProtocolError::KeyExchangeIncomplete)?;
                let output = agreement.finish(&reply)?;
                verify_host_key(&output.host_key, ctx)?;

                self.exchange.agreed = Some(Agreed {
                    exchange_hash: output.exchange_hash,
                    host_key: output.host_key,
                    keys: Arc::new(output.keys),
                });
                self.send_new_keys(io)?;
                Ok(self.try_complete())
            }

            Message::NewKeys => {
                let keys = match &self.exchange.agreed {
                    Some(agreed) if !self.exchange.new_keys_received => Arc::clone(&agreed.keys),
                    _ => return Err(unexpected(&Message::NewKeys, "key exchange")),
                };
                io.activate_inbound(keys, self.compression());
                self.exchange.new_keys_received = true;
                tracing::debug!(role = ?self.role, "Inbound keys active");
                Ok(self.try_complete())
            }

            other => Err(unexpected(&other, "key exchange handler")),
        }
    }

    fn compression(&self) -> bool {
        self.exchange
            .negotiated
            .is_some_and(|n| n.compression == CompressionAlgorithm::Lz4)
    }

    fn send_new_keys(&mut self, io: &mut PacketIo) -> Result<()> {
        let keys = match &self.exchange.agreed {
            Some(agreed) => Arc::clone(&agreed.keys),
            None => return Err(ProtocolError::KeyExchangeIncomplete.into()),
        };
        io.queue(&Message::NewKeys)?;
        io.activate_outbound(keys, self.compression());
        self.exchange.new_keys_sent = true;
        tracing::debug!(role = ?self.role, "Outbound keys active");
        Ok(())
    }

    fn try_complete(&mut self) -> KexEvent {
        if !(self.exchange.new_keys_sent && self.exchange.new_keys_received) {
            return KexEvent::None;
        }
        let exchange = std::mem::take(&mut self.exchange);
        let (Some(agreed), Some(negotiated)) = (exchange.agreed, exchange.negotiated) else {
            return KexEvent::None;
        };
        let rekey = self.completed > 0;
        self.completed += 1;
        KexEvent::Completed(KexCompleted {
            exchange_hash: agreed.exchange_hash,
            host_key: agreed.host_key,
            negotiated,
            rekey,
        })
    }
}

fn verify_host_key(presented: &HostKey, ctx: &KexContext<'_>) -> Result<()> {
    if let Some(known) = ctx.known_host_key {
        if known != presented {
            return Err(SessionError::HostKeyMismatch {
                expected: known.fingerprint(),
                actual: presented.fingerprint(),
            });
        }
        return Ok(());
    }
    if let Some(expected) = &ctx.config.expected_host_key {
        if !presented.matches_fingerprint(expected) {
            return Err(SessionError::HostKeyMismatch {
                expected: expected.clone(),
                actual: presented.fingerprint(),
            });
        }
    }
    Ok(())
}

impl std::fmt::Debug for Keying {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keying")
            .field("role", &self.role)
            .field("in_progress", &self.in_progress())
            .field("negotiated", &self.exchange.negotiated)
            .field("completed", &self.completed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use protocol::kex::Algorithm;
    use protocol::KexAlgorithm;

    use super::*;
    use crate::error::Progress;
    use crate::transport::MemoryPipe;

    struct Side {
        keying: Keying,
        io: PacketIo,
        pipe: MemoryPipe,
        config: SessionConfig,
        host: Option<HostIdentity>,
        session_id: Option<[u8; 32]>,
        host_key: Option<HostKey>,
    }

    fn versions(role: Role) -> (&'static str, &'static str) {
        match role {
            Role::Initiator => ("SHELLWIRE-2.0-i", "SHELLWIRE-2.0-r"),
            Role::Responder => ("SHELLWIRE-2.0-r", "SHELLWIRE-2.0-i"),
        }
    }

    impl Side {
        fn new(role: Role, pipe: MemoryPipe, config: SessionConfig) -> Self {
            Self {
                keying: Keying::new(role),
                io: PacketIo::new(u64::MAX),
                pipe,
                config,
                host: (role == Role::Responder).then(HostIdentity::generate),
                session_id: None,
                host_key: None,
            }
        }

        fn begin(&mut self) -> Result<()> {
            let Side {
                keying,
                io,
                pipe,
                config,
                host,
                session_id,
                host_key,
            } = self;
            let (local_version, peer_version) = versions(keying.role);
            let ctx = KexContext {
                role: keying.role,
                local_version,
                peer_version,
                session_id: session_id.as_ref().map(|id| id.as_slice()),
                host_identity: host.as_ref(),
                known_host_key: host_key.as_ref(),
                config,
            };
            keying.begin(&ctx, io)?;
            io.flush(pipe)?;
            Ok(())
        }

        /// Process every packet that is waiting, returning the events.
        fn drain(&mut self) -> Result<Vec<KexEvent>> {
            let mut events = Vec::new();
            while let Progress::Ready(_) = self.io.fill(&mut self.pipe)? {}
            while let Some((message, payload)) = self.io.next_packet()? {
                let (local_version, peer_version) = versions(self.keying.role);
                let ctx = KexContext {
                    role: self.keying.role,
                    local_version,
                    peer_version,
                    session_id: self.session_id.as_ref().map(|id| id.as_slice()),
                    host_identity: self.host.as_ref(),
                    known_host_key: self.host_key.as_ref(),
                    config: &self.config,
                };
                let event = self.keying.handle(message, &payload, &ctx, &mut self.io)?;
                match &event {
                    KexEvent::Completed(done) => {
                        self.session_id.get_or_insert(done.exchange_hash);
                        self.host_key = Some(done.host_key);
                    }
                    KexEvent::Negotiated(_)
                        if self.keying.role == Role::Initiator && self.session_id.is_none() =>
                    {
                        self.keying.start_agreement(&mut self.io)?;
                    }
                    _ => {}
                }
                events.push(event);
            }
            self.io.flush(&mut self.pipe)?;
            Ok(events)
        }
    }

    fn pair(config: SessionConfig) -> (Side, Side) {
        let (a, b) = MemoryPipe::pair();
        (
            Side::new(Role::Initiator, a, config.clone()),
            Side::new(Role::Responder, b, config),
        )
    }

    /// Exchange packets until both sides go quiet.
    fn run(initiator: &mut Side, responder: &mut Side) -> Result<(Vec<KexEvent>, Vec<KexEvent>)> {
        let mut i_events = Vec::new();
        let mut r_events = Vec::new();
        for _ in 0..16 {
            let r = responder.drain()?;
            let i = initiator.drain()?;
            if r.is_empty() && i.is_empty() {
                break;
            }
            r_events.extend(r);
            i_events.extend(i);
        }
        Ok((i_events, r_events))
    }

    fn completed(events: &[KexEvent]) -> Vec<&KexCompleted> {
        events
            .iter()
            .filter_map(|e| match e {
                KexEvent::Completed(done) => Some(done),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_exchange_for_every_kex_algorithm() {
        for &kex in KexAlgorithm::all() {
            let config = SessionConfig {
                kex_algorithms: vec![kex.name().to_string()],
                ..Default::default()
            };
            let (mut initiator, mut responder) = pair(config);
            initiator.begin().unwrap();
            responder.begin().unwrap();

            let (i_events, r_events) = run(&mut initiator, &mut responder).unwrap();
            let i_done = completed(&i_events);
            let r_done = completed(&r_events);
            assert_eq!(i_done.len(), 1, "{}", kex.name());
            assert_eq!(r_done.len(), 1);
            assert_eq!(i_done[0].exchange_hash, r_done[0].exchange_hash);
            assert_eq!(i_done[0].negotiated.kex, kex);
            assert!(!i_done[0].rekey);
            assert!(!initiator.keying.in_progress());
            assert!(!responder.keying.in_progress());
        }
    }

    #[test]
    fn test_rekey_started_by_either_side() {
        let (mut initiator, mut responder) = pair(SessionConfig::default());
        initiator.begin().unwrap();
        responder.begin().unwrap();
        run(&mut initiator, &mut responder).unwrap();
        let session_id = initiator.session_id;

        for starter_is_initiator in [true, false] {
            if starter_is_initiator {
                initiator.begin().unwrap();
                assert!(initiator.keying.outbound_blocked());
            } else {
                responder.begin().unwrap();
            }
            let (i_events, r_events) = run(&mut initiator, &mut responder).unwrap();
            let i_done = completed(&i_events);
            assert_eq!(i_done.len(), 1);
            assert!(i_done[0].rekey);
            assert_eq!(completed(&r_events).len(), 1);
            assert_ne!(Some(i_done[0].exchange_hash), session_id);
        }
        assert_eq!(initiator.session_id, session_id);
        assert_eq!(initiator.keying.completed(), 3);
    }

    #[test]
    fn test_second_begin_refused() {
        let (mut initiator, _responder) = pair(SessionConfig::default());
        initiator.begin().unwrap();
        assert!(matches!(
            initiator.begin(),
            Err(SessionError::KexInProgress)
        ));
    }

    #[test]
    fn test_host_key_pin_mismatch() {
        let config = SessionConfig {
            expected_host_key: Some("SHA256:AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA".to_string()),
            ..Default::default()
        };
        let (mut initiator, mut responder) = pair(config);
        initiator.begin().unwrap();
        responder.begin().unwrap();
        let err = run(&mut initiator, &mut responder).unwrap_err();
        assert!(matches!(err, SessionError::HostKeyMismatch { .. }));
    }

    #[test]
    fn test_host_key_pin_match() {
        let (mut initiator, mut responder) = pair(SessionConfig::default());
        let fingerprint = responder.host.as_ref().unwrap().fingerprint();
        initiator.config.expected_host_key = Some(fingerprint);
        initiator.begin().unwrap();
        responder.begin().unwrap();
        run(&mut initiator, &mut responder).unwrap();
        assert_eq!(initiator.keying.completed(), 1);
    }

    #[test]
    fn test_no_common_cipher() {
        let (mut initiator, mut responder) = pair(SessionConfig::default());
        initiator.config.cipher_algorithms = vec!["aes256-gcm".to_string()];
        responder.config.cipher_algorithms = vec!["chacha20-poly1305".to_string()];
        initiator.begin().unwrap();
        responder.begin().unwrap();
        let err = run(&mut initiator, &mut responder).unwrap_err();
        assert!(matches!(
            err,
            SessionError::Protocol(ProtocolError::NoCommonAlgorithm { kind: "cipher", .. })
        ));
    }

    #[test]
    fn test_stray_new_keys_rejected() {
        let mut keying = Keying::new(Role::Responder);
        let mut io = PacketIo::new(u64::MAX);
        let config = SessionConfig::default();
        let ctx = KexContext {
            role: Role::Responder,
            local_version: "SHELLWIRE-2.0-r",
            peer_version: "SHELLWIRE-2.0-i",
            session_id: None,
            host_identity: None,
            known_host_key: None,
            config: &config,
        };
        assert!(matches!(
            keying.handle(Message::NewKeys, &[], &ctx, &mut io),
            Err(SessionError::UnexpectedMessage { message: "NEWKEYS", .. })
        ));
    }
}
