//! The connection: handshake driver, receive path and stream operations.
//!
//! Every public operation makes as much progress as the transport allows and
//! then returns. Progress is driven by the caller; there are no threads and
//! no timers. A single receive cycle reads at most one identification line
//! or one packet and processes it completely, so the receive path may
//! advance key exchange or channel state that has nothing to do with the
//! operation that triggered it.
//!
//! Errors returned from public operations are recorded on the connection.
//! Fatal ones end it: a best-effort DISCONNECT is sent and every later call
//! returns [`SessionError::Terminated`].

use std::collections::{BTreeMap, VecDeque};
use std::fmt;

use protocol::messages::{
    ChannelClose, ChannelData, ChannelEof, ChannelFailure, ChannelOpen, ChannelOpenConfirmation,
    ChannelOpenFailure, ChannelOpenFailureReason, ChannelRequest, ChannelSuccess,
    ChannelWindowAdjust, Disconnect, DisconnectReason, ServiceAccept, ServiceRequest,
    UserAuthBanner, UserAuthFailure, UserAuthRequest, CHANNEL_REQUEST_SHELL,
    CHANNEL_TYPE_SESSION, SERVICE_CONNECTION, SERVICE_USERAUTH,
};
use protocol::version::identification_line;
use protocol::{HostIdentity, HostKey, Message, Negotiated, Role, VersionInfo};

use crate::auth::{AuthDecision, AuthRequest, Authenticator, Credentials, RejectAll};
use crate::channel::Channel;
use crate::config::{ConfigError, SessionConfig};
use crate::error::{ErrorCode, HandshakeStatus, Progress, Result, SessionError};
use crate::handshake::{
    AcceptState, ConnectState, HandshakeState, Outbound, PeerProgress, Phase, Step,
};
use crate::keying::{KexCompleted, KexContext, KexEvent, Keying};
use crate::packet::{HighwaterSide, PacketIo, Stats};
use crate::transport::Transport;

/// Queued output above which `stream_send` stops accepting data.
const MAX_OUTPUT_BACKLOG: usize = 256 * 1024;

/// Methods offered to the peer after a rejected attempt.
const AUTH_METHODS: [&str; 2] = ["password", "none"];

/// Builds a [`KexContext`] from disjoint fields so the keying and the packet
/// I/O can still be borrowed mutably.
macro_rules! kex_context {
    ($conn:expr) => {
        KexContext {
            role: $conn.role,
            local_version: &$conn.local_version,
            peer_version: $conn
                .peer_version
                .as_ref()
                .map_or("", |info| info.line.as_str()),
            session_id: $conn.session_id.as_ref().map(|id| id.as_slice()),
            host_identity: $conn.host_identity.as_ref(),
            known_host_key: $conn.host_key.as_ref(),
            config: &$conn.config,
        }
    };
}

fn unexpected(message: &Message, context: impl Into<String>) -> SessionError {
    SessionError::UnexpectedMessage {
        message: message.kind(),
        context: context.into(),
    }
}

/// One secure session over a non-blocking transport.
pub struct Connection<T> {
    transport: T,
    role: Role,
    config: SessionConfig,

    state: HandshakeState,
    progress: PeerProgress,
    io: PacketIo,
    keying: Keying,

    host_identity: Option<HostIdentity>,
    credentials: Option<Credentials>,
    authenticator: Box<dyn Authenticator>,
    auth_rejections: u32,

    local_version: String,
    peer_version: Option<VersionInfo>,
    session_id: Option<[u8; 32]>,
    negotiated: Option<Negotiated>,
    host_key: Option<HostKey>,
    banner: Option<String>,

    channels: BTreeMap<u32, Channel>,
    next_channel_id: u32,
    pending_open: Option<u32>,
    primary: Option<u32>,

    deferred: VecDeque<Message>,
    last_error: Option<ErrorCode>,
    terminated: Option<ErrorCode>,
    shut_down: bool,
}

impl<T: Transport> Connection<T> {
    /// Create the server side of a connection.
    pub fn responder(transport: T, config: SessionConfig, host_identity: HostIdentity) -> Result<Self> {
        Self::new(transport, Role::Responder, config, Some(host_identity), None)
    }

    /// Create the client side of a connection.
    pub fn initiator(transport: T, config: SessionConfig, credentials: Credentials) -> Result<Self> {
        Self::new(transport, Role::Initiator, config, None, Some(credentials))
    }

    fn new(
        transport: T,
        role: Role,
        config: SessionConfig,
        host_identity: Option<HostIdentity>,
        credentials: Option<Credentials>,
    ) -> Result<Self> {
        config.validate()?;

        let local_version = identification_line(&config.software_version)
            .trim_end()
            .to_string();
        let state = match role {
            Role::Responder => HandshakeState::Accept(AcceptState::Begin),
            Role::Initiator => HandshakeState::Connect(ConnectState::Begin),
        };
        let progress = PeerProgress {
            request_shell: role == Role::Initiator && config.request_shell,
            ..Default::default()
        };

        tracing::debug!(role = ?role, version = %local_version, "Connection created");

        Ok(Self {
            transport,
            role,
            io: PacketIo::new(config.highwater_mark),
            config,
            state,
            progress,
            keying: Keying::new(role),
            host_identity,
            credentials,
            authenticator: Box::new(RejectAll),
            auth_rejections: 0,
            local_version,
            peer_version: None,
            session_id: None,
            negotiated: None,
            host_key: None,
            banner: None,
            channels: BTreeMap::new(),
            next_channel_id: 0,
            pending_open: None,
            primary: None,
            deferred: VecDeque::new(),
            last_error: None,
            terminated: None,
            shut_down: false,
        })
    }

    // ------------------------------------------------------------------
    // Public operations
    // ------------------------------------------------------------------

    /// Drive the responder handshake as far as the transport allows.
    pub fn accept(&mut self) -> Result<HandshakeStatus> {
        self.guarded(|conn| {
            conn.require_role(Role::Responder)?;
            conn.drive()
        })
    }

    /// Drive the initiator handshake as far as the transport allows.
    ///
    /// After [`HandshakeStatus::AuthRejected`], the next call sends a new
    /// authentication request with the current credentials.
    pub fn connect(&mut self) -> Result<HandshakeStatus> {
        self.guarded(|conn| {
            conn.require_role(Role::Initiator)?;
            conn.drive()
        })
    }

    /// Read session data into `buf`.
    ///
    /// Returns `Ready(0)` once the peer has sent EOF or closed the channel
    /// and everything buffered has been read.
    pub fn stream_read(&mut self, buf: &mut [u8]) -> Result<Progress<usize>> {
        self.guarded(|conn| conn.read_inner(buf))
    }

    /// Send session data, returning how much of `buf` was accepted.
    pub fn stream_send(&mut self, buf: &[u8]) -> Result<Progress<usize>> {
        self.guarded(|conn| conn.send_inner(buf))
    }

    /// Make progress for callers with their own event loop.
    ///
    /// Before the session channel is open this drives the handshake like
    /// `accept()` / `connect()`; afterwards it runs one receive cycle.
    /// A rejected authentication attempt counts as progress.
    pub fn poll(&mut self) -> Result<Progress<()>> {
        self.guarded(|conn| {
            if conn.phase() >= Phase::ChannelOpen {
                return conn.receive_cycle();
            }
            Ok(match conn.drive()? {
                HandshakeStatus::WouldBlock => Progress::WouldBlock,
                HandshakeStatus::Complete | HandshakeStatus::AuthRejected { .. } => {
                    Progress::Ready(())
                }
            })
        })
    }

    /// Write queued output to the transport.
    pub fn flush(&mut self) -> Result<Progress<()>> {
        self.guarded(|conn| conn.io.flush(&mut conn.transport))
    }

    /// Start a new key exchange on an authenticated connection.
    ///
    /// The exchange completes in the receive path; the session id does not
    /// change.
    pub fn trigger_rekey(&mut self) -> Result<()> {
        self.guarded(|conn| {
            conn.require_phase(Phase::Authenticated)?;
            if conn.keying.in_progress() {
                return Err(SessionError::KexInProgress);
            }
            let ctx = kex_context!(conn);
            conn.keying.begin(&ctx, &mut conn.io)?;
            tracing::info!(role = ?conn.role, "Re-key started");
            conn.io.flush(&mut conn.transport)?;
            Ok(())
        })
    }

    /// Close every channel and disconnect.
    ///
    /// Each step is best-effort and the output is flushed once; anything the
    /// transport does not take is abandoned. Calling it again does nothing.
    pub fn shutdown(&mut self) -> Result<()> {
        if self.shut_down {
            return Ok(());
        }
        self.shut_down = true;

        if self.state.version_sent() && self.terminated.is_none() {
            if !self.keying.outbound_blocked() {
                let ids: Vec<u32> = self.channels.keys().copied().collect();
                for id in ids {
                    if let Err(e) = self.close_channel(id) {
                        tracing::debug!(channel = id, error = %e, "Failed to close channel");
                    }
                }
            }

            let notice = Message::Disconnect(Disconnect {
                reason: DisconnectReason::ByApplication,
                description: "connection shut down".to_string(),
            });
            if let Err(e) = self.io.queue(&notice) {
                tracing::debug!(error = %e, "Failed to queue disconnect");
            }
            match self.io.flush(&mut self.transport) {
                Ok(Progress::Ready(())) => {}
                Ok(Progress::WouldBlock) => {
                    tracing::debug!(
                        pending = self.io.pending_output(),
                        "Abandoning unflushed output"
                    );
                }
                Err(e) => tracing::debug!(error = %e, "Failed to flush on shutdown"),
            }
        }

        self.channels.clear();
        self.deferred.clear();
        tracing::info!(role = ?self.role, "Connection shut down");
        Ok(())
    }

    /// Replace the authentication policy (responder).
    pub fn set_authenticator(&mut self, authenticator: impl Authenticator + 'static) {
        self.authenticator = Box::new(authenticator);
    }

    /// Replace the credentials used for the next authentication request
    /// (initiator).
    pub fn set_credentials(&mut self, credentials: Credentials) {
        self.credentials = Some(credentials);
    }

    /// Override the high-water mark and register a callback.
    pub fn set_highwater(
        &mut self,
        mark: u64,
        callback: impl FnMut(HighwaterSide, u64) + Send + 'static,
    ) -> Result<()> {
        if mark == 0 {
            return Err(ConfigError::InvalidHighwaterMark.into());
        }
        self.io.set_highwater(mark, Some(Box::new(callback)));
        Ok(())
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    /// Our role.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Current handshake state.
    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Role-independent handshake phase.
    pub fn phase(&self) -> Phase {
        self.state.phase()
    }

    /// Algorithms agreed by the most recent key exchange.
    pub fn negotiated(&self) -> Option<Negotiated> {
        self.negotiated
    }

    /// Exchange hash of the first key exchange.
    pub fn session_id(&self) -> Option<&[u8]> {
        self.session_id.as_ref().map(|id| id.as_slice())
    }

    /// Code of the most recent error.
    pub fn last_error(&self) -> Option<ErrorCode> {
        self.last_error
    }

    /// Name of the most recent error.
    pub fn last_error_name(&self) -> Option<&'static str> {
        self.last_error.map(ErrorCode::name)
    }

    /// Whether a fatal error ended the connection.
    pub fn is_terminated(&self) -> bool {
        self.terminated.is_some()
    }

    /// Byte and packet counters.
    pub fn stats(&self) -> Stats {
        self.io.stats()
    }

    /// The peer's identification line.
    pub fn peer_version(&self) -> Option<&VersionInfo> {
        self.peer_version.as_ref()
    }

    /// The responder's host key, as verified by the initiator.
    pub fn peer_host_key(&self) -> Option<&HostKey> {
        match self.role {
            Role::Initiator => self.host_key.as_ref(),
            Role::Responder => None,
        }
    }

    /// Banner received from the responder.
    pub fn banner(&self) -> Option<&str> {
        self.banner.as_deref()
    }

    /// Whether a key exchange is in flight.
    pub fn is_keying(&self) -> bool {
        self.keying.in_progress()
    }

    /// Completed key exchanges, the first one included.
    pub fn key_exchanges(&self) -> u32 {
        self.keying.completed()
    }

    /// Open channels.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// The session channel, while it is open.
    pub fn channel(&self) -> Option<&Channel> {
        self.session_channel().and_then(|id| self.channels.get(&id))
    }

    /// Rejected authentication attempts so far.
    pub fn auth_rejections(&self) -> u32 {
        self.auth_rejections
    }

    /// Queued bytes the transport has not taken yet.
    ///
    /// Event loops wait for writability as well as readability while this
    /// is non-zero.
    pub fn pending_output(&self) -> usize {
        self.io.pending_output()
    }

    /// Current high-water mark.
    pub fn highwater(&self) -> u64 {
        self.io.highwater_mark()
    }

    /// Settings in effect.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// The underlying transport.
    pub fn get_ref(&self) -> &T {
        &self.transport
    }

    /// The underlying transport, mutably.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    // ------------------------------------------------------------------
    // Error recording
    // ------------------------------------------------------------------

    fn guarded<R>(&mut self, op: impl FnOnce(&mut Self) -> Result<R>) -> Result<R> {
        if let Some(code) = self.terminated {
            return Err(SessionError::Terminated(code));
        }
        if self.shut_down {
            return Err(SessionError::ShutDown);
        }
        match op(self) {
            Ok(value) => Ok(value),
            Err(err) => {
                self.record(&err);
                Err(err)
            }
        }
    }

    fn record(&mut self, err: &SessionError) {
        let code = err.code();
        self.last_error = Some(code);
        if !err.is_fatal() {
            tracing::debug!(role = ?self.role, code = %code, error = %err, "Operation failed");
            return;
        }

        tracing::warn!(role = ?self.role, code = %code, error = %err, "Connection failed");
        self.terminated = Some(code);
        self.deferred.clear();

        if let Some(reason) = err.disconnect_reason() {
            if self.state.version_sent() {
                let notice = Message::Disconnect(Disconnect {
                    reason,
                    description: err.to_string(),
                });
                if self.io.queue(&notice).is_ok() {
                    let _ = self.io.flush(&mut self.transport);
                }
            }
        }
    }

    fn require_role(&self, role: Role) -> Result<()> {
        if self.role != role {
            return Err(SessionError::WrongRole(self.role));
        }
        Ok(())
    }

    fn require_phase(&self, required: Phase) -> Result<()> {
        let current = self.phase();
        if current < required {
            return Err(SessionError::InvalidPhase { required, current });
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Handshake driver
    // ------------------------------------------------------------------

    fn drive(&mut self) -> Result<HandshakeStatus> {
        loop {
            let (next, step) = self.state.advance(&self.progress);
            match step {
                Step::Done => {
                    self.io.flush(&mut self.transport)?;
                    return Ok(HandshakeStatus::Complete);
                }
                Step::Continue => self.transition(next),
                Step::Send(outbound) => {
                    self.send_outbound(outbound)?;
                    self.transition(next);
                }
                Step::Receive => {
                    let rejections = self.auth_rejections;
                    if self.receive_cycle()?.is_would_block() {
                        return Ok(HandshakeStatus::WouldBlock);
                    }
                    if self.auth_rejections > rejections {
                        self.io.flush(&mut self.transport)?;
                        return Ok(HandshakeStatus::AuthRejected {
                            attempts: self.auth_rejections,
                        });
                    }
                }
            }
        }
    }

    fn transition(&mut self, next: HandshakeState) {
        if next != self.state {
            tracing::debug!(
                role = ?self.role,
                from = %self.state,
                to = %next,
                phase = %next.phase(),
                "Handshake state advanced"
            );
            self.state = next;
        }
    }

    fn send_outbound(&mut self, outbound: Outbound) -> Result<()> {
        match outbound {
            Outbound::Version => {
                let line = format!("{}\r\n", self.local_version);
                self.io.queue_raw(line.as_bytes());
            }
            Outbound::KexInit => {
                // A peer KEXINIT handled by `poll` may already have made us
                // send ours.
                if !self.keying.in_progress() {
                    let ctx = kex_context!(self);
                    self.keying.begin(&ctx, &mut self.io)?;
                }
            }
            Outbound::KexGexRequest | Outbound::KexDhInit => {
                self.keying.start_agreement(&mut self.io)?;
            }
            Outbound::ServiceRequest => {
                self.send(Message::ServiceRequest(ServiceRequest {
                    service: SERVICE_USERAUTH.to_string(),
                }))?;
            }
            Outbound::ServiceAccept => {
                self.send(Message::ServiceAccept(ServiceAccept {
                    service: SERVICE_USERAUTH.to_string(),
                }))?;
                if let Some(message) = self.config.banner.clone() {
                    self.send(Message::UserAuthBanner(UserAuthBanner {
                        message,
                        language: String::new(),
                    }))?;
                }
            }
            Outbound::UserAuthRequest => {
                let credentials = self
                    .credentials
                    .clone()
                    .ok_or(SessionError::WrongRole(self.role))?;
                tracing::debug!(
                    username = %credentials.username,
                    method = credentials.method.name(),
                    attempt = self.auth_rejections + 1,
                    "Sending authentication request"
                );
                self.send(Message::UserAuthRequest(UserAuthRequest {
                    username: credentials.username,
                    service: SERVICE_CONNECTION.to_string(),
                    method: credentials.method,
                }))?;
                self.progress.auth_retry = false;
            }
            Outbound::ChannelOpen => {
                let id = self.allocate_channel_id();
                self.send(Message::ChannelOpen(ChannelOpen {
                    channel_type: CHANNEL_TYPE_SESSION.to_string(),
                    sender_channel: id,
                    initial_window: self.config.window_size,
                    max_packet: self.config.max_packet_size,
                }))?;
                self.pending_open = Some(id);
            }
            Outbound::ShellRequest => {
                let id = self.session_channel().ok_or(SessionError::ChannelClosed(0))?;
                let peer_id = self.channel_mut(id)?.peer_id();
                self.send(Message::ChannelRequest(ChannelRequest {
                    recipient_channel: peer_id,
                    request: CHANNEL_REQUEST_SHELL.to_string(),
                    want_reply: true,
                }))?;
            }
        }
        Ok(())
    }

    /// Queue a message, holding back anything but key exchange traffic
    /// while our side of a key exchange is in flight.
    fn send(&mut self, message: Message) -> Result<()> {
        if self.keying.outbound_blocked() && !message.allowed_during_kex() {
            tracing::trace!(kind = message.kind(), "Deferred until key exchange completes");
            self.deferred.push_back(message);
            return Ok(());
        }
        self.io.queue(&message)
    }

    fn release_deferred(&mut self) -> Result<()> {
        while !self.keying.outbound_blocked() {
            let Some(message) = self.deferred.pop_front() else {
                break;
            };
            self.io.queue(&message)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Receive path
    // ------------------------------------------------------------------

    /// Read and process one identification line or packet.
    fn receive_cycle(&mut self) -> Result<Progress<()>> {
        self.io.flush(&mut self.transport)?;
        loop {
            if !self.progress.version_received {
                if let Some(info) = self.io.next_version_line()? {
                    self.on_version(info);
                    return Ok(Progress::Ready(()));
                }
            } else if let Some((message, payload)) = self.io.next_packet()? {
                self.dispatch(message, &payload)?;
                self.io.flush(&mut self.transport)?;
                return Ok(Progress::Ready(()));
            }

            if self.io.fill(&mut self.transport)?.is_would_block() {
                return Ok(Progress::WouldBlock);
            }
        }
    }

    fn on_version(&mut self, info: VersionInfo) {
        tracing::debug!(
            role = ?self.role,
            protocol = %info.protocol,
            software = %info.software,
            "Received peer version"
        );
        self.progress.version_received = true;
        self.peer_version = Some(info);
    }

    fn dispatch(&mut self, message: Message, payload: &[u8]) -> Result<()> {
        match message {
            Message::Disconnect(notice) => {
                tracing::info!(
                    role = ?self.role,
                    reason = ?notice.reason,
                    description = %notice.description,
                    "Peer disconnected"
                );
                Err(SessionError::PeerDisconnected {
                    reason: notice.reason,
                    description: notice.description,
                })
            }
            Message::Ignore(_) => Ok(()),
            Message::Unimplemented(notice) => {
                tracing::debug!(seq = notice.sequence, "Peer did not implement a message");
                Ok(())
            }
            Message::KexInit(_)
            | Message::KexGexRequest(_)
            | Message::KexGexGroup(_)
            | Message::KexDhInit(_)
            | Message::KexDhReply(_)
            | Message::NewKeys => self.handle_kex(message, payload),
            other => {
                if self.keying.inbound_restricted() {
                    return Err(unexpected(&other, "key exchange"));
                }
                if self.session_id.is_none() {
                    return Err(unexpected(&other, "before key exchange"));
                }
                self.handle_session_message(other)
            }
        }
    }

    fn handle_kex(&mut self, message: Message, payload: &[u8]) -> Result<()> {
        let ctx = kex_context!(self);
        let event = self.keying.handle(message, payload, &ctx, &mut self.io)?;
        match event {
            KexEvent::None => {}
            KexEvent::Negotiated(negotiated) => {
                if self.session_id.is_none() {
                    self.progress.kex_negotiated = true;
                    self.progress.group_exchange = negotiated.kex.uses_group_exchange();
                }
            }
            KexEvent::Completed(done) => self.on_kex_completed(done)?,
        }
        self.release_deferred()
    }

    fn on_kex_completed(&mut self, done: KexCompleted) -> Result<()> {
        if self.session_id.is_none() {
            self.session_id = Some(done.exchange_hash);
            self.host_key = Some(done.host_key);
            self.progress.keys_established = true;
        }
        self.negotiated = Some(done.negotiated);
        tracing::info!(
            role = ?self.role,
            algorithms = %done.negotiated,
            host_key = %done.host_key,
            rekey = done.rekey,
            "Key exchange complete"
        );

        self.release_deferred()?;
        let ids: Vec<u32> = self.channels.keys().copied().collect();
        for id in ids {
            self.maybe_adjust_window(id)?;
        }
        Ok(())
    }

    fn handle_session_message(&mut self, message: Message) -> Result<()> {
        match message {
            Message::ServiceRequest(request) => self.on_service_request(request),
            Message::ServiceAccept(accept) => {
                if self.state != HandshakeState::Connect(ConnectState::ServiceRequestSent) {
                    return Err(unexpected(&Message::ServiceAccept(accept), self.state.to_string()));
                }
                tracing::debug!(service = %accept.service, "Service accepted");
                self.progress.service_accepted = true;
                Ok(())
            }
            Message::UserAuthRequest(request) => self.on_userauth_request(request),
            Message::UserAuthFailure(failure) => self.on_userauth_failure(failure),
            Message::UserAuthSuccess => {
                if self.state != HandshakeState::Connect(ConnectState::UserAuthSent) {
                    return Err(unexpected(&Message::UserAuthSuccess, self.state.to_string()));
                }
                tracing::info!(
                    attempts = self.auth_rejections + 1,
                    "Authentication succeeded"
                );
                self.progress.auth_succeeded = true;
                Ok(())
            }
            Message::UserAuthBanner(banner) => {
                if self.role != Role::Initiator || self.progress.auth_succeeded {
                    return Err(unexpected(&Message::UserAuthBanner(banner), self.state.to_string()));
                }
                tracing::info!(banner = %banner.message, "Received banner");
                self.banner = Some(banner.message);
                Ok(())
            }
            Message::ChannelOpen(open) => self.on_channel_open(open),
            Message::ChannelOpenConfirmation(confirmation) => {
                self.on_channel_open_confirmation(confirmation)
            }
            Message::ChannelOpenFailure(failure) => {
                if self.pending_open != Some(failure.recipient_channel) {
                    return Err(unexpected(&Message::ChannelOpenFailure(failure), "no pending open"));
                }
                self.pending_open = None;
                Err(SessionError::ChannelOpenRefused {
                    reason: failure.reason,
                    description: failure.description,
                })
            }
            Message::ChannelWindowAdjust(adjust) => {
                let channel = self.channel_mut(adjust.recipient_channel)?;
                channel.add_peer_window(adjust.bytes_to_add)?;
                tracing::trace!(
                    channel = adjust.recipient_channel,
                    bytes = adjust.bytes_to_add,
                    window = channel.peer_window(),
                    "Peer window adjusted"
                );
                Ok(())
            }
            Message::ChannelData(data) => {
                let channel = self.channel_mut(data.recipient_channel)?;
                if channel.is_input_finished() {
                    return Err(unexpected(&Message::ChannelData(data), "channel after EOF"));
                }
                channel.receive_data(&data.data)?;
                tracing::trace!(
                    channel = data.recipient_channel,
                    bytes = data.data.len(),
                    window = channel.local_window(),
                    "Channel data received"
                );
                Ok(())
            }
            Message::ChannelEof(eof) => {
                self.channel_mut(eof.recipient_channel)?.mark_eof_received();
                tracing::debug!(channel = eof.recipient_channel, "Peer sent EOF");
                Ok(())
            }
            Message::ChannelClose(close) => self.on_channel_close(close.recipient_channel),
            Message::ChannelRequest(request) => self.on_channel_request(request),
            Message::ChannelSuccess(success) => {
                if self.state == HandshakeState::Connect(ConnectState::ShellRequestSent) {
                    tracing::debug!(channel = success.recipient_channel, "Shell granted");
                    self.progress.shell_accepted = true;
                }
                Ok(())
            }
            Message::ChannelFailure(failure) => {
                if self.state == HandshakeState::Connect(ConnectState::ShellRequestSent) {
                    return Err(SessionError::ShellRefused);
                }
                tracing::debug!(channel = failure.recipient_channel, "Channel request refused");
                Ok(())
            }
            other => Err(unexpected(&other, "session")),
        }
    }

    fn on_service_request(&mut self, request: ServiceRequest) -> Result<()> {
        if self.role != Role::Responder
            || !self.progress.keys_established
            || self.progress.service_requested
        {
            return Err(unexpected(&Message::ServiceRequest(request), self.state.to_string()));
        }
        if request.service != SERVICE_USERAUTH {
            let context = format!("request for unknown service {:?}", request.service);
            return Err(unexpected(&Message::ServiceRequest(request), context));
        }
        tracing::debug!(service = %request.service, "Service requested");
        self.progress.service_requested = true;
        Ok(())
    }

    fn on_userauth_request(&mut self, request: UserAuthRequest) -> Result<()> {
        match self.state {
            HandshakeState::Accept(AcceptState::ServiceAccepted) => {}
            HandshakeState::Accept(state) if state > AcceptState::ServiceAccepted => {
                tracing::debug!("Ignoring authentication request after success");
                return Ok(());
            }
            _ => {
                return Err(unexpected(&Message::UserAuthRequest(request), self.state.to_string()));
            }
        }

        let attempt = self.auth_rejections + 1;
        let request = AuthRequest {
            username: request.username,
            service: request.service,
            method: request.method,
            attempt,
        };
        let decision = if request.service == SERVICE_CONNECTION {
            self.authenticator.authenticate(&request)
        } else {
            AuthDecision::Reject
        };

        match decision {
            AuthDecision::Accept => {
                self.send(Message::UserAuthSuccess)?;
                self.progress.auth_succeeded = true;
                tracing::info!(
                    username = %request.username,
                    method = request.method.name(),
                    attempt,
                    "User authenticated"
                );
            }
            AuthDecision::Reject => {
                self.auth_rejections = attempt;
                tracing::warn!(
                    username = %request.username,
                    method = request.method.name(),
                    attempt,
                    "Authentication rejected"
                );
                if attempt >= self.config.max_auth_attempts {
                    self.send(Message::Disconnect(Disconnect {
                        reason: DisconnectReason::NoMoreAuthMethodsAvailable,
                        description: "too many authentication failures".to_string(),
                    }))?;
                    let _ = self.io.flush(&mut self.transport);
                    return Err(SessionError::AuthAttemptsExceeded { attempts: attempt });
                }
                self.send(Message::UserAuthFailure(UserAuthFailure {
                    methods: AUTH_METHODS.iter().map(|m| m.to_string()).collect(),
                    partial_success: false,
                }))?;
            }
        }
        Ok(())
    }

    fn on_userauth_failure(&mut self, failure: UserAuthFailure) -> Result<()> {
        if self.state != HandshakeState::Connect(ConnectState::UserAuthSent)
            || self.progress.auth_retry
        {
            return Err(unexpected(&Message::UserAuthFailure(failure), self.state.to_string()));
        }
        self.auth_rejections += 1;
        self.progress.auth_retry = true;
        tracing::warn!(
            attempts = self.auth_rejections,
            methods = ?failure.methods,
            "Authentication rejected by peer"
        );
        Ok(())
    }

    fn refuse_channel(
        &mut self,
        peer_channel: u32,
        reason: ChannelOpenFailureReason,
        description: String,
    ) -> Result<()> {
        tracing::warn!(peer_channel, ?reason, %description, "Refusing channel open");
        self.send(Message::ChannelOpenFailure(ChannelOpenFailure {
            recipient_channel: peer_channel,
            reason,
            description,
        }))
    }

    fn on_channel_open(&mut self, open: ChannelOpen) -> Result<()> {
        if self.role != Role::Responder {
            return self.refuse_channel(
                open.sender_channel,
                ChannelOpenFailureReason::AdministrativelyProhibited,
                "initiator does not accept channels".to_string(),
            );
        }
        if !self.progress.auth_succeeded {
            return Err(unexpected(&Message::ChannelOpen(open), self.state.to_string()));
        }
        if open.max_packet == 0 {
            return Err(unexpected(&Message::ChannelOpen(open), "zero maximum packet size"));
        }
        if open.channel_type != CHANNEL_TYPE_SESSION {
            let description = format!("unsupported channel type {:?}", open.channel_type);
            return self.refuse_channel(
                open.sender_channel,
                ChannelOpenFailureReason::UnknownChannelType,
                description,
            );
        }
        if self.channels.len() >= self.config.max_channels {
            // Scoped to this open; the connection carries on.
            self.last_error = Some(ErrorCode::ChannelLimit);
            let description = SessionError::ChannelLimit {
                max: self.config.max_channels,
            }
            .to_string();
            return self.refuse_channel(
                open.sender_channel,
                ChannelOpenFailureReason::ResourceShortage,
                description,
            );
        }

        let id = self.allocate_channel_id();
        let channel = Channel::new(
            id,
            open.sender_channel,
            self.config.window_size,
            self.config.max_packet_size,
            open.initial_window,
            open.max_packet,
        );
        self.insert_channel(channel);
        self.send(Message::ChannelOpenConfirmation(ChannelOpenConfirmation {
            recipient_channel: open.sender_channel,
            sender_channel: id,
            initial_window: self.config.window_size,
            max_packet: self.config.max_packet_size,
        }))?;
        self.progress.channel_opened = true;
        Ok(())
    }

    fn on_channel_open_confirmation(&mut self, confirmation: ChannelOpenConfirmation) -> Result<()> {
        if self.pending_open != Some(confirmation.recipient_channel) {
            return Err(unexpected(
                &Message::ChannelOpenConfirmation(confirmation),
                "no pending open",
            ));
        }
        if confirmation.max_packet == 0 {
            return Err(unexpected(
                &Message::ChannelOpenConfirmation(confirmation),
                "zero maximum packet size",
            ));
        }
        self.pending_open = None;
        let channel = Channel::new(
            confirmation.recipient_channel,
            confirmation.sender_channel,
            self.config.window_size,
            self.config.max_packet_size,
            confirmation.initial_window,
            confirmation.max_packet,
        );
        self.insert_channel(channel);
        self.progress.channel_opened = true;
        Ok(())
    }

    fn insert_channel(&mut self, channel: Channel) {
        let id = channel.local_id();
        tracing::debug!(
            channel = id,
            peer_channel = channel.peer_id(),
            window = channel.local_window(),
            peer_window = channel.peer_window(),
            peer_max_packet = channel.peer_max_packet(),
            "Channel opened"
        );
        self.channels.insert(id, channel);
        self.primary.get_or_insert(id);
    }

    fn on_channel_close(&mut self, id: u32) -> Result<()> {
        let channel = self.channel_mut(id)?;
        channel.mark_close_received();
        let reply = (!channel.close_sent()).then(|| {
            channel.mark_close_sent();
            channel.peer_id()
        });
        tracing::debug!(channel = id, "Peer closed channel");
        if let Some(peer_id) = reply {
            self.send(Message::ChannelClose(ChannelClose {
                recipient_channel: peer_id,
            }))?;
        }
        self.reap(id);
        Ok(())
    }

    fn on_channel_request(&mut self, request: ChannelRequest) -> Result<()> {
        let peer_id = self.channel_mut(request.recipient_channel)?.peer_id();
        let granted = self.role == Role::Responder && request.request == CHANNEL_REQUEST_SHELL;
        tracing::debug!(
            channel = request.recipient_channel,
            request = %request.request,
            granted,
            "Channel request"
        );
        if !request.want_reply {
            return Ok(());
        }
        if granted {
            self.send(Message::ChannelSuccess(ChannelSuccess {
                recipient_channel: peer_id,
            }))
        } else {
            self.send(Message::ChannelFailure(ChannelFailure {
                recipient_channel: peer_id,
            }))
        }
    }

    // ------------------------------------------------------------------
    // Channels
    // ------------------------------------------------------------------

    fn allocate_channel_id(&mut self) -> u32 {
        while self.channels.contains_key(&self.next_channel_id)
            || self.pending_open == Some(self.next_channel_id)
        {
            self.next_channel_id = self.next_channel_id.wrapping_add(1);
        }
        let id = self.next_channel_id;
        self.next_channel_id = self.next_channel_id.wrapping_add(1);
        id
    }

    fn channel_mut(&mut self, id: u32) -> Result<&mut Channel> {
        self.channels
            .get_mut(&id)
            .ok_or(SessionError::UnknownChannel(id))
    }

    /// The channel stream operations act on.
    fn session_channel(&self) -> Option<u32> {
        self.primary
            .filter(|id| self.channels.contains_key(id))
            .or_else(|| self.channels.keys().next().copied())
    }

    /// Drop a channel once it is closed both ways and drained.
    fn reap(&mut self, id: u32) {
        if self.channels.get(&id).is_some_and(Channel::is_finished) {
            self.channels.remove(&id);
            tracing::debug!(channel = id, "Channel released");
        }
    }

    fn close_channel(&mut self, id: u32) -> Result<()> {
        let channel = self.channel_mut(id)?;
        let peer_id = channel.peer_id();
        let send_eof = !channel.eof_sent() && !channel.close_sent();
        let send_close = !channel.close_sent();
        if send_eof {
            channel.mark_eof_sent();
        }
        if send_close {
            channel.mark_close_sent();
        }

        if send_eof {
            self.io.queue(&Message::ChannelEof(ChannelEof {
                recipient_channel: peer_id,
            }))?;
        }
        if send_close {
            self.io.queue(&Message::ChannelClose(ChannelClose {
                recipient_channel: peer_id,
            }))?;
        }
        Ok(())
    }

    /// Advertise consumed bytes once more than half the buffer was read.
    ///
    /// Skipped while our side of a key exchange is in flight; a later read
    /// or the end of the exchange picks it up.
    fn maybe_adjust_window(&mut self, id: u32) -> Result<()> {
        if self.keying.outbound_blocked() {
            return Ok(());
        }
        let Some(channel) = self.channels.get_mut(&id) else {
            return Ok(());
        };
        if channel.close_sent() || channel.close_received() {
            return Ok(());
        }
        let Some(amount) = channel.pending_adjust() else {
            return Ok(());
        };

        self.io
            .queue(&Message::ChannelWindowAdjust(ChannelWindowAdjust {
                recipient_channel: channel.peer_id(),
                bytes_to_add: amount,
            }))?;
        channel.commit_adjust();
        tracing::debug!(
            channel = id,
            bytes = amount,
            window = channel.local_window(),
            "Window adjusted"
        );
        Ok(())
    }

    fn read_inner(&mut self, buf: &mut [u8]) -> Result<Progress<usize>> {
        self.require_phase(Phase::ChannelOpen)?;
        if buf.is_empty() {
            return Ok(Progress::Ready(0));
        }

        let id = loop {
            let Some(id) = self.session_channel() else {
                return Ok(Progress::Ready(0));
            };
            let channel = self.channel_mut(id)?;
            if channel.available() > 0 {
                break id;
            }
            if channel.is_input_finished() {
                self.reap(id);
                return Ok(Progress::Ready(0));
            }
            if self.receive_cycle()?.is_would_block() {
                return Ok(Progress::WouldBlock);
            }
        };

        let count = self.channel_mut(id)?.read(buf);
        tracing::trace!(channel = id, bytes = count, "Stream read");
        self.maybe_adjust_window(id)?;
        self.reap(id);
        self.io.flush(&mut self.transport)?;
        Ok(Progress::Ready(count))
    }

    fn send_inner(&mut self, buf: &[u8]) -> Result<Progress<usize>> {
        self.require_phase(Phase::ChannelOpen)?;
        if buf.is_empty() {
            return Ok(Progress::Ready(0));
        }
        let id = self
            .session_channel()
            .ok_or(SessionError::ChannelClosed(self.primary.unwrap_or_default()))?;
        if !self.channel_mut(id)?.can_send() {
            return Err(SessionError::ChannelClosed(id));
        }

        if self.keying.outbound_blocked() {
            self.receive_cycle()?;
            if self.keying.outbound_blocked() {
                return Ok(Progress::WouldBlock);
            }
        }
        if self.io.pending_output() >= MAX_OUTPUT_BACKLOG
            && self.io.flush(&mut self.transport)?.is_would_block()
            && self.io.pending_output() >= MAX_OUTPUT_BACKLOG
        {
            return Ok(Progress::WouldBlock);
        }
        if self.channel_mut(id)?.peer_window() == 0 {
            self.receive_cycle()?;
        }

        // The receive cycle may have closed the channel.
        let Some(channel) = self.channels.get_mut(&id) else {
            return Err(SessionError::ChannelClosed(id));
        };
        if !channel.can_send() {
            return Err(SessionError::ChannelClosed(id));
        }

        let mut sent = 0;
        while sent < buf.len() && self.io.pending_output() < MAX_OUTPUT_BACKLOG {
            let chunk = channel.send_capacity(buf.len() - sent);
            if chunk == 0 {
                break;
            }
            self.io.queue(&Message::ChannelData(ChannelData {
                recipient_channel: channel.peer_id(),
                data: buf[sent..sent + chunk].to_vec(),
            }))?;
            channel.consume_peer_window(chunk);
            sent += chunk;
        }
        tracing::trace!(
            channel = id,
            bytes = sent,
            peer_window = channel.peer_window(),
            "Stream send"
        );

        self.io.flush(&mut self.transport)?;
        if sent == 0 {
            return Ok(Progress::WouldBlock);
        }
        Ok(Progress::Ready(sent))
    }
}

impl<T> fmt::Debug for Connection<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("role", &self.role)
            .field("state", &self.state)
            .field("negotiated", &self.negotiated)
            .field("keying", &self.keying.in_progress())
            .field("channels", &self.channels.len())
            .field("io", &self.io)
            .field("last_error", &self.last_error)
            .field("terminated", &self.terminated)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::PasswordTable;
    use crate::transport::MemoryPipe;

    fn connected(server_config: SessionConfig) -> (Connection<MemoryPipe>, Connection<MemoryPipe>) {
        let (client_end, server_end) = MemoryPipe::pair();
        let mut server =
            Connection::responder(server_end, server_config, HostIdentity::generate()).unwrap();
        server.set_authenticator(PasswordTable::new([("alice", "secret")]));
        let mut client = Connection::initiator(
            client_end,
            SessionConfig::default(),
            Credentials::password("alice", "secret"),
        )
        .unwrap();

        let mut client_done = false;
        let mut server_done = false;
        for _ in 0..10_000 {
            if client_done && server_done {
                return (client, server);
            }
            client_done = client.connect().unwrap().is_complete();
            if server_done {
                server.poll().unwrap();
            } else {
                server_done = server.accept().unwrap().is_complete();
            }
        }
        panic!("handshake did not finish");
    }

    fn open_request(channel_type: &str, sender_channel: u32) -> ChannelOpen {
        ChannelOpen {
            channel_type: channel_type.to_string(),
            sender_channel,
            initial_window: 65536,
            max_packet: 32768,
        }
    }

    #[test]
    fn test_unknown_channel_type_refused() {
        let (mut client, mut server) = connected(SessionConfig::default());

        server.on_channel_open(open_request("x11", 9)).unwrap();
        server.flush().unwrap();
        assert_eq!(server.channel_count(), 1);

        client.pending_open = Some(9);
        assert!(matches!(
            client.poll(),
            Err(SessionError::ChannelOpenRefused {
                reason: ChannelOpenFailureReason::UnknownChannelType,
                ..
            })
        ));
    }

    #[test]
    fn test_channel_limit_is_scoped() {
        let (mut client, mut server) = connected(SessionConfig::default());

        server.on_channel_open(open_request("session", 4)).unwrap();
        assert_eq!(server.last_error(), Some(ErrorCode::ChannelLimit));
        assert!(!server.is_terminated());
        assert_eq!(server.channel_count(), 1);
        server.flush().unwrap();

        client.pending_open = Some(4);
        assert!(matches!(
            client.poll(),
            Err(SessionError::ChannelOpenRefused {
                reason: ChannelOpenFailureReason::ResourceShortage,
                ..
            })
        ));
    }

    #[test]
    fn test_second_channel_within_limit() {
        let config = SessionConfig {
            max_channels: 2,
            ..Default::default()
        };
        let (mut client, mut server) = connected(config);

        server.on_channel_open(open_request("session", 4)).unwrap();
        server.flush().unwrap();
        assert_eq!(server.channel_count(), 2);

        client.pending_open = Some(4);
        client.poll().unwrap();
        assert_eq!(client.channel_count(), 2);
        assert_eq!(client.channel().unwrap().local_id(), 0);
    }

    #[test]
    fn test_data_for_unknown_channel_is_fatal() {
        let (mut client, _server) = connected(SessionConfig::default());
        let data = Message::ChannelData(ChannelData {
            recipient_channel: 99,
            data: b"stray".to_vec(),
        });
        assert!(matches!(
            client.dispatch(data, &[]),
            Err(SessionError::UnknownChannel(99))
        ));
    }

    #[test]
    fn test_zero_max_packet_open_is_fatal() {
        let (_client, mut server) = connected(SessionConfig::default());
        let mut open = open_request("session", 4);
        open.max_packet = 0;
        assert!(matches!(
            server.on_channel_open(open),
            Err(SessionError::UnexpectedMessage { .. })
        ));
        assert_eq!(server.channel_count(), 1);
    }

    #[test]
    fn test_zero_max_packet_confirmation_is_fatal() {
        let (mut client, _server) = connected(SessionConfig::default());
        client.pending_open = Some(5);
        let confirmation = ChannelOpenConfirmation {
            recipient_channel: 5,
            sender_channel: 7,
            initial_window: 65536,
            max_packet: 0,
        };
        assert!(matches!(
            client.on_channel_open_confirmation(confirmation),
            Err(SessionError::UnexpectedMessage { .. })
        ));
        assert_eq!(client.channel_count(), 1);
    }

    #[test]
    fn test_shell_refusal() {
        let (mut client, _server) = connected(SessionConfig::default());
        client.state = HandshakeState::Connect(ConnectState::ShellRequestSent);
        let failure = Message::ChannelFailure(ChannelFailure {
            recipient_channel: 0,
        });
        assert!(matches!(
            client.handle_session_message(failure),
            Err(SessionError::ShellRefused)
        ));
    }

    #[test]
    fn test_channel_ids_skip_those_in_use() {
        let (mut client, _server) = connected(SessionConfig::default());
        client.next_channel_id = 0;
        assert_eq!(client.allocate_channel_id(), 1);
        client.pending_open = Some(2);
        assert_eq!(client.allocate_channel_id(), 3);
    }

    #[test]
    fn test_messages_deferred_during_key_exchange() {
        let (mut client, _server) = connected(SessionConfig::default());
        client.trigger_rekey().unwrap();
        client
            .send(Message::ChannelEof(ChannelEof {
                recipient_channel: 0,
            }))
            .unwrap();
        assert_eq!(client.deferred.len(), 1);
        assert!(matches!(
            client.stream_send(b"blocked").unwrap(),
            Progress::WouldBlock
        ));
    }
}
