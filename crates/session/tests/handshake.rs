//! Handshake integration tests over in-memory pipes.
//!
//! These tests verify the full connection setup:
//! - Version and key exchange
//! - Authentication retries and limits
//! - Host key pinning
//! - Shutdown before the channel opens

mod common;

use common::{config, handshake, pair, pair_with, Pair, MAX_ROUNDS};
use protocol::messages::DisconnectReason;
use protocol::kex::Algorithm;
use protocol::{CompressionAlgorithm, HostIdentity, Role};
use session::{
    AcceptState, AuthDecision, AuthRequest, ConnectState, Connection, Credentials, ErrorCode,
    HandshakeState, HandshakeStatus, MemoryPipe, Phase, SessionConfig, SessionError,
};

/// Drive both sides until one returns an error, returning
/// `(client_error, server_error)` as far as each got.
fn drive_until_error(pair: &mut Pair) -> (Option<SessionError>, Option<SessionError>) {
    let mut client_err = None;
    let mut server_err = None;
    for _ in 0..MAX_ROUNDS {
        if client_err.is_none() {
            if let Err(e) = pair.client.connect() {
                client_err = Some(e);
            }
        }
        if server_err.is_none() {
            if let Err(e) = pair.server.accept() {
                server_err = Some(e);
            }
        }
        if client_err.is_some() && server_err.is_some() {
            break;
        }
    }
    (client_err, server_err)
}

// =============================================================================
// Version and Key Exchange
// =============================================================================

#[test]
fn test_first_steps_are_deterministic() {
    let mut pair = pair();

    assert_eq!(pair.server.accept().unwrap(), HandshakeStatus::WouldBlock);
    assert_eq!(
        pair.server.state(),
        HandshakeState::Accept(AcceptState::VersionSent)
    );

    assert_eq!(pair.client.connect().unwrap(), HandshakeStatus::WouldBlock);
    assert_eq!(
        pair.client.state(),
        HandshakeState::Connect(ConnectState::KexInitSent)
    );
    assert_eq!(pair.client.phase(), Phase::VersionExchanged);
    assert_eq!(pair.client.peer_version().unwrap().software, "test");
}

#[test]
fn test_key_exchange_agrees_on_session_id() {
    let mut pair = pair();
    handshake(&mut pair);

    assert_eq!(pair.client.phase(), Phase::ChannelOpen);
    assert_eq!(pair.server.phase(), Phase::ChannelOpen);

    let client_id = pair.client.session_id().unwrap();
    assert_eq!(client_id.len(), 32);
    assert_eq!(Some(client_id), pair.server.session_id());
    assert_eq!(pair.client.negotiated(), pair.server.negotiated());

    assert_eq!(pair.server.peer_version().unwrap().software, "test");
    assert_eq!(pair.client.peer_version().unwrap().software, "test");
    assert_eq!(pair.client.key_exchanges(), 1);
    assert_eq!(pair.client.channel_count(), 1);
    assert_eq!(pair.server.channel_count(), 1);
    assert!(pair.client.peer_host_key().is_some());
    assert!(pair.server.peer_host_key().is_none());
    assert_eq!(pair.client.last_error(), None);
}

#[test]
fn test_every_kex_algorithm_completes() {
    for kex in ["curve25519-sha256", "curve25519-blake2s", "curve25519-gex-sha256"] {
        let client_config = SessionConfig {
            kex_algorithms: vec![kex.to_string()],
            ..config()
        };
        let mut pair = pair_with(client_config, config(), MemoryPipe::pair());
        handshake(&mut pair);

        let negotiated = pair.client.negotiated().unwrap();
        assert_eq!(negotiated.kex.name(), kex);
        assert_eq!(pair.client.session_id(), pair.server.session_id());
    }
}

#[test]
fn test_compression_negotiated_when_both_prefer_it() {
    let lz4 = SessionConfig {
        compression_algorithms: vec!["lz4".to_string(), "none".to_string()],
        ..config()
    };
    let mut pair = pair_with(lz4.clone(), lz4, MemoryPipe::pair());
    handshake(&mut pair);

    let negotiated = pair.client.negotiated().unwrap();
    assert_eq!(negotiated.compression, CompressionAlgorithm::Lz4);
}

#[test]
fn test_no_common_cipher_fails_both_sides() {
    let client_config = SessionConfig {
        cipher_algorithms: vec!["aes256-gcm".to_string()],
        ..config()
    };
    let server_config = SessionConfig {
        cipher_algorithms: vec!["chacha20-poly1305".to_string()],
        ..config()
    };
    let mut pair = pair_with(client_config, server_config, MemoryPipe::pair());

    let (client_err, _) = drive_until_error(&mut pair);
    assert!(matches!(client_err, Some(SessionError::Protocol(_))));
    assert_eq!(pair.client.last_error(), Some(ErrorCode::NoCommonAlgorithm));
    assert!(pair.client.is_terminated());
    assert!(matches!(
        pair.client.connect(),
        Err(SessionError::Terminated(ErrorCode::NoCommonAlgorithm))
    ));
}

#[test]
fn test_fragmented_transport_reaches_same_state() {
    let mut plain = pair();
    handshake(&mut plain);

    let (client_end, server_end) = MemoryPipe::pair();
    let pipes = (
        client_end.with_max_read(1).with_would_block_every(3),
        server_end.with_max_read(7).with_would_block_every(2),
    );
    let mut fragmented = pair_with(config(), config(), pipes);
    handshake(&mut fragmented);

    assert_eq!(fragmented.client.state(), plain.client.state());
    assert_eq!(fragmented.server.state(), plain.server.state());
    assert_eq!(fragmented.client.negotiated(), plain.client.negotiated());
    assert_eq!(
        fragmented.client.stats().tx_seq,
        plain.client.stats().tx_seq
    );
    assert_eq!(
        fragmented.server.stats().rx_seq,
        plain.server.stats().rx_seq
    );
    assert_eq!(
        fragmented.client.session_id(),
        fragmented.server.session_id()
    );
}

#[test]
fn test_preamble_lines_before_version_are_skipped() {
    let (client_end, server_end) = MemoryPipe::pair();
    client_end.inject(b"welcome to the test host\r\nplease behave\r\n");
    let mut pair = pair_with(config(), config(), (client_end, server_end));
    handshake(&mut pair);
    assert_eq!(pair.client.peer_version().unwrap().software, "test");
}

#[test]
fn test_poll_drives_responder_handshake() {
    let mut pair = pair();
    assert_eq!(pair.server.accept().unwrap(), HandshakeStatus::WouldBlock);

    let mut client_done = false;
    for _ in 0..MAX_ROUNDS {
        if client_done && pair.server.phase() == Phase::ChannelOpen {
            break;
        }
        if !client_done {
            client_done = pair.client.connect().unwrap().is_complete();
        }
        pair.server.poll().unwrap();
    }

    assert!(client_done);
    assert_eq!(pair.server.phase(), Phase::ChannelOpen);
    assert!(!pair.server.is_terminated());
    assert_eq!(pair.server.last_error(), None);
    assert_eq!(pair.server.channel_count(), 1);
    assert_eq!(pair.server.accept().unwrap(), HandshakeStatus::Complete);
}

#[test]
fn test_poll_drives_initiator_handshake() {
    let mut pair = pair();

    let mut server_done = false;
    for _ in 0..MAX_ROUNDS {
        if server_done && pair.client.phase() == Phase::ChannelOpen {
            break;
        }
        pair.client.poll().unwrap();
        if server_done {
            pair.server.poll().unwrap();
        } else {
            server_done = pair.server.accept().unwrap().is_complete();
        }
    }

    assert_eq!(pair.client.phase(), Phase::ChannelOpen);
    assert_eq!(pair.client.session_id(), pair.server.session_id());
}

// =============================================================================
// Authentication
// =============================================================================

#[test]
fn test_rejected_three_times_then_accepted() {
    let mut pair = pair();
    let mut calls = 0;
    pair.server
        .set_authenticator(move |request: &AuthRequest| {
            calls += 1;
            assert_eq!(request.attempt, calls);
            if calls > 3 {
                AuthDecision::Accept
            } else {
                AuthDecision::Reject
            }
        });

    let rejections = handshake(&mut pair);
    assert_eq!(rejections.server, vec![1, 2, 3]);
    assert_eq!(rejections.client, vec![1, 2, 3]);
    assert_eq!(pair.server.auth_rejections(), 3);
    assert_eq!(pair.client.phase(), Phase::ChannelOpen);
}

#[test]
fn test_updated_credentials_are_used_on_retry() {
    let (client_end, server_end) = MemoryPipe::pair();
    let mut server =
        Connection::responder(server_end, config(), HostIdentity::generate()).unwrap();
    server.set_authenticator(session::PasswordTable::new([("alice", "secret")]));
    let client = Connection::initiator(client_end, config(), Credentials::password("alice", "wrong"))
        .unwrap();
    let mut pair = Pair { client, server };

    let mut retried = false;
    for _ in 0..MAX_ROUNDS {
        if let HandshakeStatus::AuthRejected { attempts } = pair.client.connect().unwrap() {
            assert_eq!(attempts, 1);
            pair.client
                .set_credentials(Credentials::password("alice", "secret"));
            retried = true;
        }
        pair.server.accept().unwrap();
        if pair.client.phase() >= Phase::Authenticated {
            break;
        }
    }
    assert!(retried);
    assert_eq!(pair.server.auth_rejections(), 1);
    handshake(&mut pair);
}

#[test]
fn test_auth_attempt_limit_disconnects() {
    let server_config = SessionConfig {
        max_auth_attempts: 2,
        ..config()
    };
    let (client_end, server_end) = MemoryPipe::pair();
    let server =
        Connection::responder(server_end, server_config, HostIdentity::generate()).unwrap();
    let client =
        Connection::initiator(client_end, config(), Credentials::none("mallory")).unwrap();
    let mut pair = Pair { client, server };

    let (client_err, server_err) = drive_until_error(&mut pair);
    assert!(matches!(
        server_err,
        Some(SessionError::AuthAttemptsExceeded { attempts: 2 })
    ));
    assert!(matches!(
        client_err,
        Some(SessionError::PeerDisconnected {
            reason: DisconnectReason::NoMoreAuthMethodsAvailable,
            ..
        })
    ));
    assert_eq!(pair.client.auth_rejections(), 1);
}

#[test]
fn test_banner_reaches_initiator() {
    let server_config = SessionConfig {
        banner: Some("authorized use only".to_string()),
        ..config()
    };
    let mut pair = pair_with(config(), server_config, MemoryPipe::pair());
    handshake(&mut pair);
    assert_eq!(pair.client.banner(), Some("authorized use only"));
}

// =============================================================================
// Host Key Pinning
// =============================================================================

fn pinned_pair(identity: HostIdentity, fingerprint: String) -> Pair {
    let (client_end, server_end) = MemoryPipe::pair();
    let client_config = SessionConfig {
        expected_host_key: Some(fingerprint),
        ..config()
    };
    let mut server = Connection::responder(server_end, config(), identity).unwrap();
    server.set_authenticator(session::PasswordTable::new([("alice", "secret")]));
    let client = Connection::initiator(
        client_end,
        client_config,
        Credentials::password("alice", "secret"),
    )
    .unwrap();
    Pair { client, server }
}

#[test]
fn test_pinned_host_key_accepted() {
    let identity = HostIdentity::generate();
    let fingerprint = identity.fingerprint();
    let mut pair = pinned_pair(identity, fingerprint.clone());
    handshake(&mut pair);
    assert_eq!(pair.client.peer_host_key().unwrap().fingerprint(), fingerprint);
}

#[test]
fn test_pinned_host_key_mismatch() {
    let other = HostIdentity::generate().fingerprint();
    let mut pair = pinned_pair(HostIdentity::generate(), other);

    let (client_err, server_err) = drive_until_error(&mut pair);
    assert!(matches!(
        client_err,
        Some(SessionError::HostKeyMismatch { .. })
    ));
    assert!(matches!(
        server_err,
        Some(SessionError::PeerDisconnected {
            reason: DisconnectReason::HostKeyNotVerifiable,
            ..
        })
    ));
    assert!(pair.client.session_id().is_none());
}

// =============================================================================
// Misuse
// =============================================================================

#[test]
fn test_wrong_role_is_not_fatal() {
    let mut pair = pair();
    assert!(matches!(
        pair.client.accept(),
        Err(SessionError::WrongRole(Role::Initiator))
    ));
    assert!(matches!(
        pair.server.connect(),
        Err(SessionError::WrongRole(Role::Responder))
    ));
    assert_eq!(pair.client.last_error_name(), Some("WRONG_ROLE"));
    assert!(!pair.client.is_terminated());
    handshake(&mut pair);
}

#[test]
fn test_stream_ops_before_channel_open() {
    let mut pair = pair();
    let mut buf = [0u8; 16];
    assert!(matches!(
        pair.client.stream_read(&mut buf),
        Err(SessionError::InvalidPhase {
            required: Phase::ChannelOpen,
            current: Phase::Begin,
        })
    ));
    assert!(matches!(
        pair.client.stream_send(b"early"),
        Err(SessionError::InvalidPhase { .. })
    ));
    assert!(matches!(
        pair.client.trigger_rekey(),
        Err(SessionError::InvalidPhase {
            required: Phase::Authenticated,
            ..
        })
    ));
    handshake(&mut pair);
}

#[test]
fn test_invalid_config_rejected_at_construction() {
    let (client_end, _server_end) = MemoryPipe::pair();
    let bad = SessionConfig {
        max_auth_attempts: 0,
        ..config()
    };
    assert!(matches!(
        Connection::initiator(client_end, bad, Credentials::none("alice")),
        Err(SessionError::Config(_))
    ));
}

// =============================================================================
// Shutdown
// =============================================================================

#[test]
fn test_shutdown_before_channel_open() {
    let (client_end, server_end) = MemoryPipe::pair();
    let mut server =
        Connection::responder(server_end, config(), HostIdentity::generate()).unwrap();
    server.set_authenticator(|_: &AuthRequest| AuthDecision::Reject);
    let client =
        Connection::initiator(client_end, config(), Credentials::password("alice", "x")).unwrap();
    let mut pair = Pair { client, server };

    // Run until the client has seen its first rejection; nothing is in
    // flight in either direction at that point.
    let mut rejected = false;
    for _ in 0..MAX_ROUNDS {
        if let HandshakeStatus::AuthRejected { .. } = pair.client.connect().unwrap() {
            rejected = true;
            break;
        }
        pair.server.accept().unwrap();
    }
    assert!(rejected);
    assert!(pair.client.phase() < Phase::ChannelOpen);

    let before = pair.server.stats().rx_seq;
    pair.client.shutdown().unwrap();
    pair.client.shutdown().unwrap();
    assert!(matches!(
        pair.client.connect(),
        Err(SessionError::ShutDown)
    ));

    let err = loop {
        match pair.server.accept() {
            Ok(_) => continue,
            Err(e) => break e,
        }
    };
    assert!(matches!(
        err,
        SessionError::PeerDisconnected {
            reason: DisconnectReason::ByApplication,
            ..
        }
    ));
    assert_eq!(pair.server.stats().rx_seq - before, 1);
    assert_eq!(pair.server.channel_count(), 0);
    assert_eq!(pair.server.last_error(), Some(ErrorCode::PeerDisconnected));
}

#[test]
fn test_transport_closed_mid_handshake() {
    let mut pair = pair();
    pair.server.accept().unwrap();
    pair.server.get_ref().close();
    // The client still reads the version line the server already wrote.
    let err = loop {
        match pair.client.connect() {
            Ok(_) => continue,
            Err(e) => break e,
        }
    };
    assert!(matches!(err, SessionError::TransportClosed));
    assert!(pair.client.is_terminated());
}
