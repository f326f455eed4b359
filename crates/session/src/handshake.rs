//! Handshake state machines.
//!
//! Each role has its own ordered state enum. `advance` is a pure function
//! of the current state and the facts the receive path has established so
//! far ([`PeerProgress`]); it returns the next state and the [`Step`] the
//! connection must perform to get there. The connection commits the new
//! state only once the step has succeeded, so a would-block never moves
//! the state.
//!
//! ```text
//! responder                          initiator
//! ---------                          ---------
//! Begin        -- version -->        Begin
//! VersionSent  <-- version --        VersionSent
//! KexInitSent  <-- kexinit -->       KexInitSent
//!                                    KexNegotiated -- gex request / dh init -->
//! KeyExchanged <-- newkeys -->       KexDhSent
//!              <-- service request   KeyExchanged
//! ServiceAccepted -- accept -->      ServiceRequestSent
//!              <-- userauth          UserAuthSent
//! Authenticated -- success -->       Authenticated
//!              <-- channel open      ChannelOpenSent
//! ChannelOpen  -- confirmation -->   ChannelConfirmed
//!              <-- shell request     ShellRequestSent
//!                  success -->       ChannelOpen
//! ```

use std::fmt;

/// Role-independent view of how far the handshake has come.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
    /// Nothing exchanged yet.
    Begin,
    /// Both identification lines are known.
    VersionExchanged,
    /// The first key exchange completed; traffic is encrypted.
    KeyExchanged,
    /// The authentication service was accepted.
    ServiceAccepted,
    /// The user is authenticated.
    Authenticated,
    /// The session channel is open.
    ChannelOpen,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Begin => "BEGIN",
            Phase::VersionExchanged => "VERSION_EXCHANGED",
            Phase::KeyExchanged => "KEY_EXCHANGED",
            Phase::ServiceAccepted => "SERVICE_ACCEPTED",
            Phase::Authenticated => "AUTHENTICATED",
            Phase::ChannelOpen => "CHANNEL_OPEN",
        };
        f.write_str(name)
    }
}

/// Something the connection must send to make progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outbound {
    /// Our identification line.
    Version,
    /// Our KEXINIT.
    KexInit,
    /// Initiator: group exchange request.
    KexGexRequest,
    /// Initiator: ephemeral key.
    KexDhInit,
    /// Initiator: ask for the authentication service.
    ServiceRequest,
    /// Responder: accept the authentication service.
    ServiceAccept,
    /// Initiator: present credentials.
    UserAuthRequest,
    /// Initiator: open the session channel.
    ChannelOpen,
    /// Initiator: ask for a shell on the session channel.
    ShellRequest,
}

/// What the connection does next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Queue a message, then commit the new state.
    Send(Outbound),
    /// Run one receive-and-process cycle; the state is unchanged.
    Receive,
    /// Commit the new state and advance again.
    Continue,
    /// The handshake is complete.
    Done,
}

/// Facts learned from the peer, set by the receive path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerProgress {
    /// The peer's identification line was parsed.
    pub version_received: bool,
    /// The first KEXINIT pair was negotiated.
    pub kex_negotiated: bool,
    /// The negotiated key exchange uses a group exchange round.
    pub group_exchange: bool,
    /// The first key exchange completed in both directions.
    pub keys_established: bool,
    /// Responder: the peer asked for the authentication service.
    pub service_requested: bool,
    /// Initiator: the responder accepted the authentication service.
    pub service_accepted: bool,
    /// Authentication succeeded.
    pub auth_succeeded: bool,
    /// Initiator: an attempt was rejected and a new request is due.
    pub auth_retry: bool,
    /// The session channel is open.
    pub channel_opened: bool,
    /// Initiator: a shell should be requested on the channel.
    pub request_shell: bool,
    /// Initiator: the shell request succeeded.
    pub shell_accepted: bool,
}

/// Responder states, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AcceptState {
    Begin,
    VersionSent,
    VersionExchanged,
    KexInitSent,
    KeyExchanged,
    ServiceAccepted,
    Authenticated,
    ChannelOpen,
}

impl AcceptState {
    /// Next state and the step that leads there.
    pub fn advance(self, progress: &PeerProgress) -> (AcceptState, Step) {
        use AcceptState::*;

        match self {
            Begin => (VersionSent, Step::Send(Outbound::Version)),
            VersionSent if progress.version_received => (VersionExchanged, Step::Continue),
            VersionSent => (VersionSent, Step::Receive),
            VersionExchanged => (KexInitSent, Step::Send(Outbound::KexInit)),
            KexInitSent if progress.keys_established => (KeyExchanged, Step::Continue),
            KexInitSent => (KexInitSent, Step::Receive),
            KeyExchanged if progress.service_requested => {
                (ServiceAccepted, Step::Send(Outbound::ServiceAccept))
            }
            KeyExchanged => (KeyExchanged, Step::Receive),
            ServiceAccepted if progress.auth_succeeded => (Authenticated, Step::Continue),
            ServiceAccepted => (ServiceAccepted, Step::Receive),
            Authenticated if progress.channel_opened => (ChannelOpen, Step::Continue),
            Authenticated => (Authenticated, Step::Receive),
            ChannelOpen => (ChannelOpen, Step::Done),
        }
    }

    /// Role-independent phase.
    pub fn phase(self) -> Phase {
        match self {
            AcceptState::Begin | AcceptState::VersionSent => Phase::Begin,
            AcceptState::VersionExchanged | AcceptState::KexInitSent => Phase::VersionExchanged,
            AcceptState::KeyExchanged => Phase::KeyExchanged,
            AcceptState::ServiceAccepted => Phase::ServiceAccepted,
            AcceptState::Authenticated => Phase::Authenticated,
            AcceptState::ChannelOpen => Phase::ChannelOpen,
        }
    }
}

/// Initiator states, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConnectState {
    Begin,
    VersionSent,
    VersionExchanged,
    KexInitSent,
    KexNegotiated,
    KexDhSent,
    KeyExchanged,
    ServiceRequestSent,
    ServiceAccepted,
    UserAuthSent,
    Authenticated,
    ChannelOpenSent,
    ChannelConfirmed,
    ShellRequestSent,
    ChannelOpen,
}

impl ConnectState {
    /// Next state and the step that leads there.
    pub fn advance(self, progress: &PeerProgress) -> (ConnectState, Step) {
        use ConnectState::*;

        match self {
            Begin => (VersionSent, Step::Send(Outbound::Version)),
            VersionSent if progress.version_received => (VersionExchanged, Step::Continue),
            VersionSent => (VersionSent, Step::Receive),
            VersionExchanged => (KexInitSent, Step::Send(Outbound::KexInit)),
            KexInitSent if progress.kex_negotiated => (KexNegotiated, Step::Continue),
            KexInitSent => (KexInitSent, Step::Receive),
            KexNegotiated if progress.group_exchange => {
                (KexDhSent, Step::Send(Outbound::KexGexRequest))
            }
            KexNegotiated => (KexDhSent, Step::Send(Outbound::KexDhInit)),
            KexDhSent if progress.keys_established => (KeyExchanged, Step::Continue),
            KexDhSent => (KexDhSent, Step::Receive),
            KeyExchanged => (ServiceRequestSent, Step::Send(Outbound::ServiceRequest)),
            ServiceRequestSent if progress.service_accepted => (ServiceAccepted, Step::Continue),
            ServiceRequestSent => (ServiceRequestSent, Step::Receive),
            ServiceAccepted => (UserAuthSent, Step::Send(Outbound::UserAuthRequest)),
            UserAuthSent if progress.auth_succeeded => (Authenticated, Step::Continue),
            // A rejected attempt is retried with a fresh request.
            UserAuthSent if progress.auth_retry => {
                (UserAuthSent, Step::Send(Outbound::UserAuthRequest))
            }
            UserAuthSent => (UserAuthSent, Step::Receive),
            Authenticated => (ChannelOpenSent, Step::Send(Outbound::ChannelOpen)),
            ChannelOpenSent if progress.channel_opened => (ChannelConfirmed, Step::Continue),
            ChannelOpenSent => (ChannelOpenSent, Step::Receive),
            ChannelConfirmed if progress.request_shell => {
                (ShellRequestSent, Step::Send(Outbound::ShellRequest))
            }
            ChannelConfirmed => (ChannelOpen, Step::Continue),
            ShellRequestSent if progress.shell_accepted => (ChannelOpen, Step::Continue),
            ShellRequestSent => (ShellRequestSent, Step::Receive),
            ChannelOpen => (ChannelOpen, Step::Done),
        }
    }

    /// Role-independent phase.
    pub fn phase(self) -> Phase {
        use ConnectState::*;

        match self {
            Begin | VersionSent => Phase::Begin,
            VersionExchanged | KexInitSent | KexNegotiated | KexDhSent => Phase::VersionExchanged,
            KeyExchanged | ServiceRequestSent => Phase::KeyExchanged,
            ServiceAccepted | UserAuthSent => Phase::ServiceAccepted,
            Authenticated | ChannelOpenSent | ChannelConfirmed | ShellRequestSent => {
                Phase::Authenticated
            }
            ChannelOpen => Phase::ChannelOpen,
        }
    }
}

/// The handshake state of either role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Responder.
    Accept(AcceptState),
    /// Initiator.
    Connect(ConnectState),
}

impl HandshakeState {
    /// Next state and the step that leads there.
    pub fn advance(self, progress: &PeerProgress) -> (HandshakeState, Step) {
        match self {
            HandshakeState::Accept(state) => {
                let (next, step) = state.advance(progress);
                (HandshakeState::Accept(next), step)
            }
            HandshakeState::Connect(state) => {
                let (next, step) = state.advance(progress);
                (HandshakeState::Connect(next), step)
            }
        }
    }

    /// Role-independent phase.
    pub fn phase(self) -> Phase {
        match self {
            HandshakeState::Accept(state) => state.phase(),
            HandshakeState::Connect(state) => state.phase(),
        }
    }

    /// Whether our identification line has been queued.
    pub fn version_sent(self) -> bool {
        match self {
            HandshakeState::Accept(state) => state > AcceptState::Begin,
            HandshakeState::Connect(state) => state > ConnectState::Begin,
        }
    }
}

impl fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeState::Accept(state) => write!(f, "{:?}", state),
            HandshakeState::Connect(state) => write!(f, "{:?}", state),
        }
    }
}
