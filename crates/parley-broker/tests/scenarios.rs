//! End-to-end chat flows through the broker facade.

mod common;

use common::{general, start_broker, TestClient};
use parley_broker::{BrokerConfig, BrokerError, ConnectionState, ReplayBatch, ServerFrame};

#[tokio::test]
async fn test_join_late_disconnect_and_reattach() {
    let broker = start_broker(BrokerConfig::default());
    let a = TestClient::connect(&broker);
    let mut b = TestClient::connect(&broker);
    let session = broker.open_session(&b.id, "bob").await.unwrap();
    assert!(matches!(b.next_frame().await, ServerFrame::Session { .. }));

    // Nobody is in the room yet.
    let hi = broker.submit(&general(), "alice", "hi").await.unwrap();
    assert_eq!(hi.message.seq, 1);
    assert!(hi.report.is_empty());

    broker.join(&b.id, &general()).await.unwrap();

    let hello = broker.submit(&general(), "alice", "hello").await.unwrap();
    assert_eq!(hello.message.seq, 2);
    assert_eq!(hello.report.delivered, vec![b.id]);
    assert!(hello.report.failures.is_empty());
    assert_eq!(b.next_delivery().await, (2, "hello".to_string()));

    broker.disconnect(&b.id).await.unwrap();

    let bye = broker.submit(&general(), "alice", "bye").await.unwrap();
    assert_eq!(bye.message.seq, 3);
    assert!(bye.report.delivered.is_empty());

    let mut b2 = TestClient::connect(&broker);
    let batch = broker.reconnect(&session, &b2.id, 2).await.unwrap();
    match &batch {
        ReplayBatch::Messages(messages) => {
            assert_eq!(messages.len(), 1);
            assert_eq!(messages[0].seq, 3);
            assert_eq!(messages[0].text, "bye");
        }
        other => panic!("expected replay batch, got {:?}", other),
    }

    assert_eq!(
        b2.next_non_presence().await,
        ServerFrame::Session {
            session_id: session,
            conn_id: b2.id
        }
    );
    assert_eq!(b2.next_non_presence().await, batch.to_frame());

    // The reattached connection is back in the room.
    let after = broker.submit(&general(), "alice", "welcome back").await.unwrap();
    assert_eq!(after.report.delivered, vec![b2.id]);
    drop(a);
}

#[tokio::test]
async fn test_reattach_after_history_aged_out() {
    let broker = start_broker(BrokerConfig {
        replay_buffer_size: 5,
        ..Default::default()
    });
    let b = TestClient::connect(&broker);
    let session = broker.open_session(&b.id, "bob").await.unwrap();
    broker.join(&b.id, &general()).await.unwrap();
    broker.disconnect(&b.id).await.unwrap();

    for i in 1..=10 {
        broker
            .submit(&general(), "alice", format!("message {}", i))
            .await
            .unwrap();
    }

    let mut b2 = TestClient::connect(&broker);
    let batch = broker.reconnect(&session, &b2.id, 0).await.unwrap();

    assert!(batch.is_gap());
    assert!(matches!(b2.next_non_presence().await, ServerFrame::Session { .. }));
    assert_eq!(b2.next_non_presence().await, ServerFrame::ReplayGap);
}

#[tokio::test]
async fn test_reattach_within_buffer_is_complete() {
    let broker = start_broker(BrokerConfig {
        replay_buffer_size: 5,
        ..Default::default()
    });
    let b = TestClient::connect(&broker);
    let session = broker.open_session(&b.id, "bob").await.unwrap();
    broker.join(&b.id, &general()).await.unwrap();
    broker.disconnect(&b.id).await.unwrap();

    for i in 1..=10 {
        broker
            .submit(&general(), "alice", format!("message {}", i))
            .await
            .unwrap();
    }

    let b2 = TestClient::connect(&broker);
    let batch = broker.reconnect(&session, &b2.id, 5).await.unwrap();
    assert_eq!(batch.sequences(), vec![6, 7, 8, 9, 10]);
}

#[tokio::test(start_paused = true)]
async fn test_session_expires_after_grace_period() {
    let broker = start_broker(BrokerConfig {
        session_grace_period_ms: 1_000,
        session_sweep_interval_ms: 100,
        ..Default::default()
    });
    let b = TestClient::connect(&broker);
    let session = broker.open_session(&b.id, "bob").await.unwrap();
    broker.join(&b.id, &general()).await.unwrap();
    broker.disconnect(&b.id).await.unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(1_500)).await;
    assert_eq!(broker.sessions().session_count().await, 0);

    let b2 = TestClient::connect(&broker);
    let err = broker.reconnect(&session, &b2.id, 0).await.unwrap_err();
    assert!(matches!(err, BrokerError::SessionExpired(_)));
    assert_eq!(err.code(), "sessionExpired");
}

#[tokio::test]
async fn test_logout_ends_session() {
    let broker = start_broker(BrokerConfig::default());
    let b = TestClient::connect(&broker);
    let session = broker.open_session(&b.id, "bob").await.unwrap();
    broker.join(&b.id, &general()).await.unwrap();

    assert!(broker.logout(&session).await.unwrap());
    assert_eq!(broker.session_for(&b.id).await, None);

    // The connection itself stays in the room.
    let published = broker.submit(&general(), "alice", "still here").await.unwrap();
    assert_eq!(published.report.delivered, vec![b.id]);
}

#[tokio::test]
async fn test_unregister_twice_is_noop() {
    let broker = start_broker(BrokerConfig::default());
    let b = TestClient::connect(&broker);
    broker.join(&b.id, &general()).await.unwrap();

    assert!(broker.registry().unregister(&b.id).is_some());
    assert!(broker.registry().unregister(&b.id).is_none());
    assert_eq!(broker.disconnect(&b.id).await.unwrap(), None);
    assert!(broker.registry().list_by_room(&general()).is_empty());
}

#[tokio::test]
async fn test_room_sees_members_come_and_go() {
    let broker = start_broker(BrokerConfig::default());
    let mut a = TestClient::connect(&broker);
    broker.join(&a.id, &general()).await.unwrap();

    let b = TestClient::connect(&broker);
    let session = broker.open_session(&b.id, "bob").await.unwrap();
    broker.join(&b.id, &general()).await.unwrap();
    assert_eq!(a.next_presence(b.id).await, ConnectionState::Open);

    broker.disconnect(&b.id).await.unwrap();
    assert_eq!(a.next_presence(b.id).await, ConnectionState::Closed);

    // Reattaching brings the session back into the room under a new id.
    let b2 = TestClient::connect(&broker);
    broker.reconnect(&session, &b2.id, 0).await.unwrap();
    assert_eq!(a.next_presence(b2.id).await, ConnectionState::Open);
}
