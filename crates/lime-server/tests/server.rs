//! Full-server scenarios over an in-memory listener.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use lime_core::{
    ChannelConfig, ChannelError, ClientChannel, ClientEstablishment, ServerChannel,
    establish_client,
};
use lime_harness::{MemoryConnector, memory_listener};
use lime_proto::reason::codes;
use lime_proto::{
    Command, CommandMethod, CommandStatus, Document, Identity, Message, Node, Notification,
    NotificationEvent, SessionState,
};
use lime_server::{EnvelopeConsumer, Server, ServerBuilder};

async fn start_server() -> (Server, MemoryConnector) {
    let (listener, connector) = memory_listener();
    let node: Node = "postmaster@localhost/server".parse().unwrap();
    let server = ServerBuilder::new(node).start(Arc::new(listener)).await.unwrap();
    (server, connector)
}

async fn connect(connector: &MemoryConnector, name: &str, instance: &str) -> ClientChannel {
    let transport = connector.connect();
    let channel = ClientChannel::new(transport, &ChannelConfig::default());
    let identity: Identity = format!("{name}@localhost").parse().unwrap();
    let options = ClientEstablishment::guest(identity, Some(instance.to_string()));
    establish_client(&channel, &options).await.unwrap();
    channel
}

#[tokio::test]
async fn clients_establish_and_register() {
    let (server, connector) = start_server().await;

    let alice = connect(&connector, "alice", "a").await;
    let bob = connect(&connector, "bob", "b").await;

    assert_eq!(alice.state(), SessionState::Established);
    assert_eq!(bob.state(), SessionState::Established);
    assert_eq!(server.registry().len(), 2);

    let nodes = server.registry().nodes();
    assert!(nodes.contains(&"alice@localhost/a".parse().unwrap()));
    assert!(nodes.contains(&"bob@localhost/b".parse().unwrap()));
}

#[tokio::test]
async fn messages_are_routed_between_registered_nodes() {
    let (_server, connector) = start_server().await;

    let alice = connect(&connector, "alice", "a").await;
    let bob = connect(&connector, "bob", "b").await;

    let to: Node = "bob@localhost/b".parse().unwrap();
    alice.send_message(Message::new(to, Document::text("hello bob"))).await.unwrap();

    let received = bob.receive_message().await.unwrap();
    assert_eq!(received.content, Document::text("hello bob"));
    assert_eq!(received.from, Some("alice@localhost/a".parse().unwrap()));
}

#[tokio::test]
async fn undeliverable_messages_fail_back_to_the_sender() {
    let (_server, connector) = start_server().await;
    let alice = connect(&connector, "alice", "a").await;

    let nobody: Node = "nobody@localhost/x".parse().unwrap();
    alice.send_message(Message::new(nobody, Document::text("void"))).await.unwrap();

    let notification = alice.receive_notification().await.unwrap();
    assert_eq!(notification.event, NotificationEvent::Failed);
    assert_eq!(notification.reason.map(|r| r.code), Some(codes::DISPATCH_ERROR));
}

struct SlowCommandConsumer;

#[async_trait]
impl EnvelopeConsumer for SlowCommandConsumer {
    async fn on_message(
        &self,
        channel: &Arc<ServerChannel>,
        message: Message,
    ) -> Result<(), ChannelError> {
        let id = message.id.clone().unwrap_or_default();
        channel.send_notification(Notification::new(id, NotificationEvent::Received)).await
    }

    async fn on_notification(
        &self,
        _channel: &Arc<ServerChannel>,
        _notification: Notification,
    ) -> Result<(), ChannelError> {
        Ok(())
    }

    async fn on_command(
        &self,
        _channel: &Arc<ServerChannel>,
        _command: Command,
    ) -> Result<(), ChannelError> {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(())
    }
}

#[tokio::test]
async fn stalled_command_consumer_does_not_block_messages() {
    let (listener, connector) = memory_listener();
    let node: Node = "postmaster@localhost/server".parse().unwrap();
    let _server = ServerBuilder::new(node.clone())
        .with_consumer(Arc::new(SlowCommandConsumer))
        .start(Arc::new(listener))
        .await
        .unwrap();
    let alice = connect(&connector, "alice", "a").await;

    // Park the command consumer with a one-way request.
    let mut stall = Command::new(CommandMethod::Get, "/slow");
    stall.id = None;
    alice.send_command(stall).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let message = Message::new(node, Document::text("still there?"));
    let id = message.id.clone().unwrap();
    alice.send_message(message).await.unwrap();

    // The message consumer runs on its own task, so the acknowledgement
    // arrives while the command callback is still sleeping.
    let notification = tokio::time::timeout(Duration::from_secs(1), alice.receive_notification())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(notification.id, Some(id));
    assert_eq!(notification.event, NotificationEvent::Received);
}

#[tokio::test]
async fn unknown_commands_get_a_failure_response() {
    let (_server, connector) = start_server().await;
    let alice = connect(&connector, "alice", "a").await;

    let request = Command::new(lime_proto::CommandMethod::Get, "/no-such-resource");
    let response = alice.process_command(request, Duration::from_secs(1)).await.unwrap();
    assert_eq!(response.status, Some(CommandStatus::Failure));
    assert_eq!(response.reason.map(|r| r.code), Some(codes::DISPATCH_ERROR));
}

#[tokio::test]
async fn finishing_unregisters_the_node() {
    let (server, connector) = start_server().await;
    let alice = connect(&connector, "alice", "a").await;
    assert_eq!(server.registry().len(), 1);

    alice.send_finishing_session().await.unwrap();
    let finished = alice.receive_finished_session().await.unwrap();
    assert_eq!(finished.state, SessionState::Finished);

    // Unregistration happens as the serving task unwinds.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    while !server.registry().is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "node was not unregistered");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn duplicate_addresses_are_refused() {
    let (server, connector) = start_server().await;
    let _alice = connect(&connector, "alice", "a").await;

    // Same identity and instance: the registry refuses the second claim.
    let transport = connector.connect();
    let channel = ClientChannel::new(transport, &ChannelConfig::default());
    let identity: Identity = "alice@localhost".parse().unwrap();
    let options = ClientEstablishment::guest(identity, Some("a".to_string()));
    let result = establish_client(&channel, &options).await;

    match result {
        Err(lime_core::ChannelError::SessionFailed(reason)) => {
            assert_eq!(reason.code, codes::SESSION_REGISTRATION_ERROR);
        },
        other => panic!("expected registration refusal, got {other:?}"),
    }
    assert_eq!(server.registry().len(), 1);
}

#[tokio::test]
async fn stopped_server_refuses_new_connections() {
    let (server, connector) = start_server().await;
    let _alice = connect(&connector, "alice", "a").await;

    server.stop();

    // The listener no longer hands connections to the server, so the
    // handshake cannot complete.
    let transport = connector.connect();
    let channel = ClientChannel::new(transport, &ChannelConfig::default());
    let options = ClientEstablishment::guest("bob@localhost".parse().unwrap(), None);
    let result = tokio::time::timeout(
        Duration::from_millis(100),
        establish_client(&channel, &options),
    )
    .await;
    assert!(result.is_err() || result.unwrap().is_err());

    // Established sessions keep working after stop.
    assert_eq!(server.registry().len(), 1);
}
