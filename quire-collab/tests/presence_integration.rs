//! Presence (awareness) through a real hub.

use quire_collab::client::{ClientConfig, SyncClient};
use quire_collab::notify::SyncEvent;
use quire_collab::protocol::PeerInfo;
use quire_collab::server::{ServerConfig, SyncServer};
use quire_collab::session::SyncState;
use quire_core::{AwarenessState, AwarenessUpdate, SelectionRange};
use tokio::net::TcpListener;
use tokio::time::{sleep, timeout, Duration};
use uuid::Uuid;

async fn start_test_server() -> String {
    let _ = env_logger::builder().is_test(true).try_init();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = SyncServer::new(ServerConfig::for_testing(format!("127.0.0.1:{port}"))).unwrap();
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });
    format!("ws://127.0.0.1:{port}")
}

async fn connect(url: &str, name: &str, doc_id: Uuid) -> SyncClient {
    let mut client = SyncClient::new(PeerInfo::new(name), doc_id, ClientConfig::for_testing(url));
    client.start();
    timeout(Duration::from_secs(5), async {
        while client.sync_state().await != SyncState::Synced {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("client never reached Synced");
    client
}

/// Poll until `who` sees `user` in a state matching `pred`.
async fn wait_presence(who: &SyncClient, user: Uuid, pred: impl Fn(Option<&AwarenessState>) -> bool) {
    let result = timeout(Duration::from_secs(5), async {
        loop {
            if pred(who.remote_user(user).await.as_ref()) {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "presence of {user} never matched; have {:?}", who.remote_user(user).await);
}

#[tokio::test]
async fn test_presence_reaches_peer() {
    let url = start_test_server().await;
    let doc_id = Uuid::new_v4();
    let alice = connect(&url, "Alice", doc_id).await;
    let bob = connect(&url, "Bob", doc_id).await;

    alice.insert(0, "hello world").await.unwrap();
    alice.update_awareness(AwarenessUpdate::cursor(5)).await.unwrap();

    wait_presence(&bob, alice.peer_id(), |s| s.is_some_and(|s| s.cursor == Some(5))).await;
    let seen = bob.remote_user(alice.peer_id()).await.unwrap();
    assert_eq!(seen.display_name, "Alice");

    bob.update_awareness(AwarenessUpdate::selection(SelectionRange::new(6, 11)))
        .await
        .unwrap();
    wait_presence(&alice, bob.peer_id(), |s| {
        s.is_some_and(|s| s.selection == Some(SelectionRange::new(6, 11)))
    })
    .await;
}

#[tokio::test]
async fn test_late_joiner_sees_existing_presence() {
    let url = start_test_server().await;
    let doc_id = Uuid::new_v4();
    let alice = connect(&url, "Alice", doc_id).await;
    alice
        .update_awareness(AwarenessUpdate::display_name("Alice (desk)"))
        .await
        .unwrap();

    let bob = connect(&url, "Bob", doc_id).await;
    wait_presence(&bob, alice.peer_id(), |s| {
        s.is_some_and(|s| s.display_name == "Alice (desk)")
    })
    .await;
}

#[tokio::test]
async fn test_presence_survives_heartbeats() {
    let url = start_test_server().await;
    let doc_id = Uuid::new_v4();
    let alice = connect(&url, "Alice", doc_id).await;
    let bob = connect(&url, "Bob", doc_id).await;

    wait_presence(&bob, alice.peer_id(), |s| s.is_some()).await;
    // Several awareness timeouts pass; heartbeats keep Alice alive.
    sleep(Duration::from_millis(600)).await;
    assert!(bob.remote_user(alice.peer_id()).await.is_some());
    assert_eq!(bob.active_users().await.len(), 2);
}

#[tokio::test]
async fn test_close_announces_leave() {
    let url = start_test_server().await;
    let doc_id = Uuid::new_v4();
    let mut alice = connect(&url, "Alice", doc_id).await;
    let mut bob = connect(&url, "Bob", doc_id).await;
    let mut events = bob.take_event_rx().unwrap();

    wait_presence(&bob, alice.peer_id(), |s| s.is_some()).await;
    alice.close().await;
    wait_presence(&bob, alice.peer_id(), |s| s.is_none()).await;

    // Bob's UI was told: Alice present at some point, then gone.
    timeout(Duration::from_secs(2), async {
        let mut saw_alice = false;
        while let Some(event) = events.recv().await {
            if let SyncEvent::AwarenessChanged(users) = event {
                let present = users.iter().any(|u| u.user_id == alice.peer_id());
                if present {
                    saw_alice = true;
                } else if saw_alice {
                    return;
                }
            }
        }
        panic!("event channel closed");
    })
    .await
    .expect("no awareness event for Alice leaving");

    bob.close().await;
}
