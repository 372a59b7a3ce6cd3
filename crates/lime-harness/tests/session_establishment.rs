//! End-to-end handshake coverage over in-memory transport pairs.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use lime_core::{
    AuthenticationOutcome, ChannelError, ClientEstablishment, NodeRegistrar, ServerAuthenticator,
    ServerEstablishment, Transport, establish_client, establish_server,
};
use lime_harness::{
    client_identity, establish_over, established_pair, server_node, transport_pair,
    transport_pair_with,
};
use lime_proto::{
    Authentication, DomainRole, Envelope, Identity, Node, SessionCompression, SessionEncryption,
    SessionState, reason::codes,
};

fn sent_session_states(envelopes: &[Envelope]) -> Vec<SessionState> {
    envelopes
        .iter()
        .filter_map(|envelope| match envelope {
            Envelope::Session(session) => Some(session.state),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn full_handshake_with_negotiation() {
    let (client_transport, server_transport) = transport_pair_with(
        vec![SessionCompression::None, SessionCompression::Gzip],
        vec![SessionEncryption::None, SessionEncryption::Tls],
    );
    let client_options = ClientEstablishment::guest(client_identity(), Some("work".to_string()));
    let server_options = ServerEstablishment {
        compression_options: vec![SessionCompression::None, SessionCompression::Gzip],
        encryption_options: vec![SessionEncryption::None, SessionEncryption::Tls],
        ..ServerEstablishment::guest()
    };

    let (client, server) = establish_over(
        client_transport.clone(),
        server_transport.clone(),
        &client_options,
        &server_options,
    )
    .await;

    assert_eq!(client.state(), SessionState::Established);
    assert_eq!(server.state(), SessionState::Established);
    assert_eq!(client.session_id(), server.session_id());
    assert!(client.session_id().is_some());

    // The addresses mirror each other across the pair.
    let registered: lime_proto::Node = "alice@localhost/work".parse().unwrap();
    assert_eq!(client.local_node(), Some(registered.clone()));
    assert_eq!(client.remote_node(), Some(server_node()));
    assert_eq!(server.remote_node(), Some(registered));

    // Negotiation happened and the confirmed options took effect on both
    // wires: the guest recipe prefers TLS and skips compression.
    assert!(sent_session_states(&client_transport.sent_envelopes())
        .contains(&SessionState::Negotiating));
    assert_eq!(client_transport.encryption(), SessionEncryption::Tls);
    assert_eq!(server_transport.encryption(), SessionEncryption::Tls);
    assert_eq!(client_transport.compression(), SessionCompression::None);
}

#[tokio::test]
async fn single_option_handshake_skips_negotiation() {
    let (client_transport, server_transport) = transport_pair();
    let client_options = ClientEstablishment::guest(client_identity(), None);
    let server_options = ServerEstablishment::guest();

    let (client, _server) = establish_over(
        client_transport.clone(),
        server_transport.clone(),
        &client_options,
        &server_options,
    )
    .await;

    assert_eq!(client.state(), SessionState::Established);
    let states = sent_session_states(&client_transport.sent_envelopes());
    assert!(!states.contains(&SessionState::Negotiating), "nothing to negotiate: {states:?}");
    let server_states = sent_session_states(&server_transport.sent_envelopes());
    assert!(!server_states.contains(&SessionState::Negotiating));
}

#[tokio::test]
async fn absent_instance_registers_as_default() {
    let (client_transport, server_transport) = transport_pair();
    let client_options = ClientEstablishment::guest(client_identity(), None);
    let server_options = ServerEstablishment::guest();
    let (client, server) =
        establish_over(client_transport, server_transport, &client_options, &server_options).await;

    let expected: lime_proto::Node = "alice@localhost/default".parse().unwrap();
    assert_eq!(client.local_node(), Some(expected.clone()));
    assert_eq!(server.remote_node(), Some(expected));
}

struct RejectEveryone;

#[async_trait]
impl ServerAuthenticator for RejectEveryone {
    async fn authenticate(
        &self,
        _identity: &Identity,
        _authentication: &Authentication,
        _transport_role: Option<DomainRole>,
    ) -> AuthenticationOutcome {
        AuthenticationOutcome::Granted(DomainRole::Unknown)
    }
}

#[tokio::test]
async fn rejected_credentials_fail_the_session() {
    let (client_transport, server_transport) = transport_pair();
    let config = lime_core::ChannelConfig::default();
    let client = lime_core::ClientChannel::new(client_transport, &config);
    let server = lime_core::ServerChannel::new(
        server_transport,
        &config,
        server_node(),
        "session-1".to_string(),
    );

    let client_options = ClientEstablishment::guest(client_identity(), None);
    let server_options =
        ServerEstablishment { authenticator: Box::new(RejectEveryone), ..ServerEstablishment::guest() };

    let (client_result, server_result) = tokio::join!(
        establish_client(&client, &client_options),
        establish_server(&server, &server_options),
    );

    assert!(matches!(server_result, Ok(None)));
    match client_result {
        Err(ChannelError::SessionFailed(reason)) => {
            assert_eq!(reason.code, codes::SESSION_AUTHENTICATION_FAILED);
        },
        other => panic!("expected authentication failure, got {other:?}"),
    }
    assert_eq!(client.state(), SessionState::Failed);
    assert_eq!(server.state(), SessionState::Failed);
}

#[tokio::test]
async fn graceful_finish_round_trip() {
    let (client_transport, server_transport) = transport_pair();
    let client_options = ClientEstablishment::guest(client_identity(), None);
    let server_options = ServerEstablishment::guest();
    let (client, server) = establish_over(
        client_transport.clone(),
        server_transport.clone(),
        &client_options,
        &server_options,
    )
    .await;

    let server_side = tokio::spawn(async move {
        let finishing = server.receive_session().await.unwrap();
        assert_eq!(finishing.state, SessionState::Finishing);
        server.send_finished_session().await;
        server
    });

    client.send_finishing_session().await.unwrap();
    let finished = client.receive_finished_session().await.unwrap();
    assert_eq!(finished.state, SessionState::Finished);

    let server = server_side.await.unwrap();
    assert_eq!(server.state(), SessionState::Finished);
    assert_eq!(client.state(), SessionState::Finished);
    assert!(!client.is_established());
}

#[tokio::test]
async fn finish_reply_is_kept_for_a_late_receiver() {
    let (client, server) = established_pair().await;

    let server_side = tokio::spawn(async move {
        let finishing = server.receive_session().await.unwrap();
        assert_eq!(finishing.state, SessionState::Finishing);
        server.send_finished_session().await;
    });

    client.send_finishing_session().await.unwrap();
    // Let the reply be adopted into the channel state before asking for
    // it; the buffered terminal envelope must still be served.
    while client.state() != SessionState::Finished {
        tokio::task::yield_now().await;
    }

    let finished = client.receive_finished_session().await.unwrap();
    assert_eq!(finished.state, SessionState::Finished);
    server_side.await.unwrap();
}

struct RecordingRegistrar {
    claimed: Arc<AtomicUsize>,
    released: Arc<AtomicUsize>,
}

#[async_trait]
impl NodeRegistrar for RecordingRegistrar {
    async fn register(&self, candidate: Node) -> Option<Node> {
        self.claimed.fetch_add(1, Ordering::SeqCst);
        Some(candidate.resolve_instance())
    }

    async fn unregister(&self, _node: Node) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn failed_establishment_releases_the_claimed_address() {
    let (client_transport, server_transport) = transport_pair();
    let config = lime_core::ChannelConfig::default();
    let client = lime_core::ClientChannel::new(client_transport, &config);
    let server = lime_core::ServerChannel::new(
        server_transport.clone(),
        &config,
        server_node(),
        "session-1".to_string(),
    );

    let claimed = Arc::new(AtomicUsize::new(0));
    let released = Arc::new(AtomicUsize::new(0));
    let server_options = ServerEstablishment {
        registrar: Box::new(RecordingRegistrar {
            claimed: claimed.clone(),
            released: released.clone(),
        }),
        ..ServerEstablishment::guest()
    };
    let server_task = tokio::spawn(async move { establish_server(&server, &server_options).await });

    let offer = client.start_new_session().await.unwrap();
    assert_eq!(offer.state, SessionState::Authenticating);

    // The established announcement is the server's next write; make it
    // fail after the address has been claimed.
    server_transport.fail_next_send();
    let identity = client_identity();
    let reply = client.authenticate_session(&identity, None, &Authentication::Guest);
    let _ = tokio::time::timeout(Duration::from_millis(100), reply).await;

    let result = server_task.await.unwrap();
    assert!(matches!(result, Err(ChannelError::Transport(_))));
    assert_eq!(claimed.load(Ordering::SeqCst), 1);
    assert_eq!(released.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn termination_is_idempotent() {
    let (client_transport, server_transport) = transport_pair();
    let client_options = ClientEstablishment::guest(client_identity(), None);
    let server_options = ServerEstablishment::guest();
    let (_client, server) = establish_over(
        client_transport,
        server_transport.clone(),
        &client_options,
        &server_options,
    )
    .await;

    server.send_finished_session().await;
    server.send_finished_session().await;
    server.close();

    assert_eq!(server_transport.close_count(), 1);
    assert_eq!(server.state(), SessionState::Finished);
}

#[tokio::test]
async fn empty_offer_lists_are_refused_locally() {
    let (_client_transport, server_transport) = transport_pair();
    let config = lime_core::ChannelConfig::default();
    let server = lime_core::ServerChannel::new(
        server_transport,
        &config,
        server_node(),
        "session-1".to_string(),
    );
    let server_options =
        ServerEstablishment { scheme_options: Vec::new(), ..ServerEstablishment::guest() };

    let result = establish_server(&server, &server_options).await;
    assert!(matches!(result, Err(ChannelError::InvalidOptions(_))));
}

#[tokio::test]
async fn unsupported_offer_is_refused_locally() {
    // Transport only does cleartext but the recipe offers TLS.
    let (_client_transport, server_transport) = transport_pair();
    let config = lime_core::ChannelConfig::default();
    let server = lime_core::ServerChannel::new(
        server_transport.clone(),
        &config,
        server_node(),
        "session-1".to_string(),
    );
    assert_eq!(server.transport().supported_encryption(), vec![SessionEncryption::None]);

    let server_options = ServerEstablishment {
        encryption_options: vec![SessionEncryption::None, SessionEncryption::Tls],
        ..ServerEstablishment::guest()
    };
    let result = establish_server(&server, &server_options).await;
    assert!(matches!(result, Err(ChannelError::InvalidOptions(_))));
}
