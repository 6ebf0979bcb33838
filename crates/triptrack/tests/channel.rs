//! Realtime channel against a local socket.io server.

mod common;

use std::time::Duration;

use common::{event, position_update, TestServer, FRAME_TIMEOUT};
use triptrack::channel::{ChannelConfig, ChannelError, PositionReport, RealtimeChannel};
use triptrack::{ParticipantId, Position, TripId};

fn channel_for(server: &TestServer) -> RealtimeChannel {
    RealtimeChannel::new(ChannelConfig {
        server_url: server.url.clone(),
        connect_timeout: Duration::from_secs(5),
        ..ChannelConfig::default()
    })
}

#[tokio::test]
async fn test_connect_sends_token() {
    let mut server = TestServer::start(Some("secret")).await;
    let mut channel = channel_for(&server);

    channel.connect("secret").await.unwrap();
    assert!(channel.is_connected());
    assert_eq!(channel.session_id(), Some("engine-sid"));
    assert_eq!(server.expect("40").await, r#"40{"token":"secret"}"#);

    // Already connected: no second handshake.
    channel.connect("secret").await.unwrap();
    channel.disconnect().await;
}

#[tokio::test]
async fn test_connect_rejected() {
    let server = TestServer::start(Some("secret")).await;
    let mut channel = channel_for(&server);

    let err = channel.connect("wrong").await.unwrap_err();
    assert_eq!(err, ChannelError::Rejected("unauthorized".to_string()));
    assert!(!channel.is_connected());
}

#[tokio::test]
async fn test_join_and_publish() {
    let mut server = TestServer::start(None).await;
    let mut channel = channel_for(&server);
    channel.connect("").await.unwrap();
    assert_eq!(server.expect("40").await, "40");

    let trip = TripId::from("t1");
    channel.join_room(&trip).unwrap();
    channel.publish_position(&PositionReport::new(
        ParticipantId::from("u1"),
        trip.clone(),
        &Position::new(48.85, 2.35),
    ));

    let (name, data) = event(&server.expect("42").await);
    assert_eq!(name, "joinTrip");
    assert_eq!(data, "t1");

    let (name, data) = event(&server.expect("42").await);
    assert_eq!(name, "updatePosition");
    assert_eq!(
        data,
        serde_json::json!({"userId": "u1", "tripId": "t1", "latitude": 48.85, "longitude": 2.35})
    );

    channel.leave_room(&trip).unwrap();
    let (name, _) = event(&server.expect("42").await);
    assert_eq!(name, "leaveTrip");

    channel.disconnect().await;
    server.expect("41").await;
    server.expect("<close>").await;
}

#[tokio::test]
async fn test_receive_broadcast() {
    let server = TestServer::start(None).await;
    let mut channel = channel_for(&server);
    channel.connect("").await.unwrap();

    let mut first = channel.subscribe_positions().unwrap();
    let mut second = channel.subscribe_positions().unwrap();
    server.push(position_update("u2", 49.0, 1.1, 100));

    for subscription in [&mut first, &mut second] {
        let update = tokio::time::timeout(FRAME_TIMEOUT, subscription.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(update.participant_id.as_str(), "u2");
        assert!((update.position.latitude - 49.0).abs() < f64::EPSILON);
        assert_eq!(update.position.timestamp.timestamp_millis(), 100);
    }
    channel.disconnect().await;
}

#[tokio::test]
async fn test_broadcasts_keep_arrival_order() {
    let server = TestServer::start(None).await;
    let mut channel = channel_for(&server);
    channel.connect("").await.unwrap();

    let mut positions = channel.subscribe_positions().unwrap();
    server.push(position_update("u1", 1.0, 1.0, 100));
    server.push(position_update("u1", 2.0, 2.0, 90));

    let a = tokio::time::timeout(FRAME_TIMEOUT, positions.recv()).await.unwrap().unwrap();
    let b = tokio::time::timeout(FRAME_TIMEOUT, positions.recv()).await.unwrap().unwrap();
    assert!((a.position.latitude - 1.0).abs() < f64::EPSILON);
    assert!((b.position.latitude - 2.0).abs() < f64::EPSILON);
    channel.disconnect().await;
}

#[tokio::test]
async fn test_ping_answered() {
    let mut server = TestServer::start(None).await;
    let mut channel = channel_for(&server);
    channel.connect("").await.unwrap();

    server.push("2");
    assert_eq!(server.expect("3").await, "3");
    channel.disconnect().await;
}

#[tokio::test]
async fn test_nothing_delivered_after_disconnect() {
    let server = TestServer::start(None).await;
    let mut channel = channel_for(&server);
    channel.connect("").await.unwrap();

    let mut positions = channel.subscribe_positions().unwrap();
    let mut errors = channel.subscribe_errors().unwrap();
    channel.disconnect().await;
    server.push(position_update("u2", 49.0, 1.1, 100));

    assert!(positions.recv().await.is_none());
    assert!(errors.recv().await.is_none());
    assert!(!channel.is_connected());
    assert!(channel.subscribe_positions().is_err());

    // Safe to call again.
    channel.disconnect().await;
}

#[tokio::test]
async fn test_malformed_broadcast_reported() {
    let server = TestServer::start(None).await;
    let mut channel = channel_for(&server);
    channel.connect("").await.unwrap();

    let mut errors = channel.subscribe_errors().unwrap();
    let mut positions = channel.subscribe_positions().unwrap();
    server.push(r#"42["positionUpdate",{"userId":"u2"}]"#);
    server.push(position_update("u3", 1.0, 2.0, 5));

    let error = tokio::time::timeout(FRAME_TIMEOUT, errors.recv()).await.unwrap().unwrap();
    assert!(matches!(error, ChannelError::Protocol(_)));

    // The connection survives a bad frame.
    let update = tokio::time::timeout(FRAME_TIMEOUT, positions.recv()).await.unwrap().unwrap();
    assert_eq!(update.participant_id.as_str(), "u3");
    assert!(channel.is_connected());
    channel.disconnect().await;
}

#[tokio::test]
async fn test_server_close_reported() {
    let server = TestServer::start(None).await;
    let mut channel = channel_for(&server);
    channel.connect("").await.unwrap();

    let mut errors = channel.subscribe_errors().unwrap();
    server.close();

    let error = tokio::time::timeout(FRAME_TIMEOUT, errors.recv()).await.unwrap().unwrap();
    assert!(matches!(
        error,
        ChannelError::Closed(_) | ChannelError::Transport(_)
    ));
    assert!(!channel.is_connected());

    // Publishing on a lost connection is a quiet no-op.
    channel.publish_position(&PositionReport::new(
        ParticipantId::from("u1"),
        TripId::from("t1"),
        &Position::new(1.0, 2.0),
    ));
    channel.disconnect().await;
}

#[tokio::test]
async fn test_subscriptions_end_after_server_close() {
    let server = TestServer::start(None).await;
    let mut channel = channel_for(&server);
    channel.connect("").await.unwrap();

    let mut positions = channel.subscribe_positions().unwrap();
    let mut errors = channel.subscribe_errors().unwrap();
    server.push(position_update("u2", 49.0, 1.1, 100));
    server.close();

    // What arrived before the close is still delivered, then the stream ends.
    let update = tokio::time::timeout(FRAME_TIMEOUT, positions.recv()).await.unwrap().unwrap();
    assert_eq!(update.participant_id.as_str(), "u2");
    assert!(tokio::time::timeout(FRAME_TIMEOUT, positions.recv())
        .await
        .unwrap()
        .is_none());

    let error = tokio::time::timeout(FRAME_TIMEOUT, errors.recv()).await.unwrap().unwrap();
    assert!(matches!(
        error,
        ChannelError::Closed(_) | ChannelError::Transport(_)
    ));
    assert!(tokio::time::timeout(FRAME_TIMEOUT, errors.recv())
        .await
        .unwrap()
        .is_none());
    assert!(!channel.is_connected());

    channel.disconnect().await;
}
