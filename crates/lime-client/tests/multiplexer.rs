//! Multiplexed channel: round-robin sends and merged receives.

mod common;

use std::time::Duration;

use lime_client::MultiplexerClientChannel;
use lime_core::ChannelError;
use lime_proto::{Command, CommandStatus, Document, Message, Notification, NotificationEvent};

use common::guest_builder;
use lime_harness::server_node;

#[tokio::test]
async fn sends_are_distributed_round_robin() {
    let (factory, builder, mut servers) = guest_builder();
    let multiplexer = MultiplexerClientChannel::establish(&builder, 2).await.unwrap();
    assert_eq!(factory.attempts(), 2);
    assert!(multiplexer.is_established());

    let server_a = servers.recv().await.unwrap();
    let server_b = servers.recv().await.unwrap();

    for i in 0..6 {
        let message = Message::new(server_node(), Document::text(format!("m{i}")));
        multiplexer.send_message(message).await.unwrap();
    }

    // Even indexes land on the first channel, odd on the second, each
    // stream in submission order.
    for (server, offset) in [(&server_a, 0), (&server_b, 1)] {
        for i in 0..3 {
            let received = server.receive_message().await.unwrap();
            assert_eq!(received.content, Document::text(format!("m{}", i * 2 + offset)));
        }
    }
}

#[tokio::test]
async fn receives_merge_all_underlying_channels() {
    let (_factory, builder, mut servers) = guest_builder();
    let multiplexer = MultiplexerClientChannel::establish(&builder, 2).await.unwrap();
    let server_a = servers.recv().await.unwrap();
    let server_b = servers.recv().await.unwrap();

    let to = server_a.remote_node().unwrap();
    server_a.send_message(Message::new(to.clone(), Document::text("from-a"))).await.unwrap();
    server_b.send_message(Message::new(to.clone(), Document::text("from-b"))).await.unwrap();
    server_a
        .send_notification(Notification::new("n-1", NotificationEvent::Consumed))
        .await
        .unwrap();

    let mut bodies = vec![
        multiplexer.receive_message().await.unwrap().content,
        multiplexer.receive_message().await.unwrap().content,
    ];
    bodies.sort_by_key(|document| document.value.to_string());
    assert_eq!(bodies, vec![Document::text("from-a"), Document::text("from-b")]);

    let notification = multiplexer.receive_notification().await.unwrap();
    assert_eq!(notification.event, NotificationEvent::Consumed);
}

#[tokio::test]
async fn process_command_resolves_across_channels() {
    let (_factory, builder, _servers) = guest_builder();
    let multiplexer = MultiplexerClientChannel::establish(&builder, 3).await.unwrap();

    // Each ping is answered by whichever server channel it was routed to.
    for _ in 0..4 {
        let response = multiplexer
            .process_command(Command::ping(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(response.status, Some(CommandStatus::Success));
    }
}

#[tokio::test]
async fn empty_channel_set_rejects_sends() {
    let multiplexer = MultiplexerClientChannel::over(Vec::new());
    assert!(!multiplexer.is_established());

    let message = Message::new(server_node(), Document::text("nowhere"));
    let result = multiplexer.send_message(message).await;
    assert!(matches!(result, Err(ChannelError::Closed)));
}

#[tokio::test]
async fn close_stops_all_channels() {
    let (_factory, builder, _servers) = guest_builder();
    let multiplexer = MultiplexerClientChannel::establish(&builder, 2).await.unwrap();

    multiplexer.close();
    assert!(!multiplexer.is_established());

    let message = Message::new(server_node(), Document::text("late"));
    assert!(multiplexer.send_message(message).await.is_err());
}
