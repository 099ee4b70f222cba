//! Broadcaster Integration Tests
//!
//! Tests for connection admission, room membership and delivery.

use std::sync::Arc;

use serde_json::json;
use vidcore::domain::EventKind;
use vidcore::realtime::{
    AdmissionError, Broadcaster, Handshake, RealtimeSettings, Room, StaticTokenVerifier,
};

fn broadcaster() -> Broadcaster {
    let verifier = StaticTokenVerifier::new()
        .with_token("tok-alice", "alice")
        .with_token("tok-bob", "bob");
    Broadcaster::new(Arc::new(verifier))
}

#[tokio::test]
async fn test_rejected_connections_never_join_a_room() {
    let broadcaster = broadcaster();

    let missing = broadcaster.connect(&Handshake::default()).await;
    assert!(matches!(missing, Err(AdmissionError::MissingToken)));

    let invalid = broadcaster.connect(&Handshake::with_token("forged")).await;
    assert!(matches!(invalid, Err(AdmissionError::InvalidToken(_))));

    assert_eq!(broadcaster.connection_count(), 0);
    assert_eq!(broadcaster.room_count(), 0);
    assert_eq!(
        broadcaster.broadcast(&Room::user("alice"), EventKind::GenericNotification, json!({})),
        0
    );
}

#[tokio::test]
async fn test_room_delivery_reaches_members_only() {
    let broadcaster = broadcaster();
    let mut alice = broadcaster.connect(&Handshake::with_token("tok-alice")).await.unwrap();
    let mut bob = broadcaster.connect(&Handshake::with_token("Bearer tok-bob")).await.unwrap();

    assert!(broadcaster.join(alice.id(), "video:42").unwrap());

    let delivered = broadcaster.broadcast(
        &Room::video("42"),
        EventKind::JobProgress,
        json!({ "jobId": "j-1", "progress": 40 }),
    );
    assert_eq!(delivered, 1);

    let event = alice.try_recv().expect("member receives the event");
    assert_eq!(event.kind, EventKind::JobProgress);
    assert_eq!(event.room, "video:42");
    assert_eq!(event.payload["progress"], 40);

    assert!(bob.try_recv().is_none());
}

#[tokio::test]
async fn test_user_room_is_joined_on_connect() {
    let broadcaster = broadcaster();
    let mut first = broadcaster.connect(&Handshake::with_token("tok-alice")).await.unwrap();
    let mut second = broadcaster.connect(&Handshake::with_token("tok-alice")).await.unwrap();

    assert_eq!(first.user_room(), Room::user("alice"));
    assert_eq!(broadcaster.members(&Room::user("alice")).len(), 2);

    let delivered = broadcaster.notify_user("alice", json!({ "message": "upload finished" }));
    assert_eq!(delivered, 2);

    for connection in [&mut first, &mut second] {
        let event = connection.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::GenericNotification);
        assert_eq!(event.payload["message"], "upload finished");
    }
}

#[tokio::test]
async fn test_cookie_handshake_is_admitted() {
    let settings = RealtimeSettings {
        session_cookie: "sid".to_string(),
        ..RealtimeSettings::default()
    };
    let verifier = StaticTokenVerifier::new().with_token("tok-carol", "carol");
    let broadcaster = Broadcaster::with_settings(Arc::new(verifier), settings);

    let connection = broadcaster
        .connect(&Handshake::with_cookies("theme=dark; sid=tok-carol"))
        .await
        .unwrap();

    assert_eq!(connection.identity().user_id, "carol");
    assert_eq!(
        broadcaster.identity_of(connection.id()).map(|i| i.user_id),
        Some("carol".to_string())
    );

    // Wrong cookie name means no token at all
    let wrong = broadcaster
        .connect(&Handshake::with_cookies("session=tok-carol"))
        .await;
    assert!(matches!(wrong, Err(AdmissionError::MissingToken)));
}

#[tokio::test]
async fn test_dropped_connection_leaves_every_room() {
    let broadcaster = broadcaster();
    let alice = broadcaster.connect(&Handshake::with_token("tok-alice")).await.unwrap();
    let id = alice.id();

    broadcaster.join(id, Room::channel("c-9")).unwrap();
    broadcaster.join(id, Room::job("j-1")).unwrap();
    assert_eq!(broadcaster.rooms_of(id).len(), 3);

    drop(alice);

    assert_eq!(broadcaster.connection_count(), 0);
    assert_eq!(broadcaster.room_count(), 0);
    assert!(broadcaster.members(&Room::channel("c-9")).is_empty());
    assert!(broadcaster.join(id, Room::video("1")).is_err());
}
