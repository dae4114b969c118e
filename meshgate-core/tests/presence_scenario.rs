/*
    Presence scenario tests

    Several full nodes on one in-process mesh, driven in paused time:
    - peers appear in each other's online lists within one heartbeat interval
      of both being subscribed
    - a partitioned peer drops out once the offline timeout and a prune pass elapse
    - a peer that keeps heartbeating never drops out
    - chat reaches every other peer
*/

use std::time::Duration;

use meshgate_core::core_presence::PresenceEvent;
use meshgate_core::test_utils::{peer_names, test_config, test_mesh, wait_for_watch};
use meshgate_core::{NodeIdentity, RunningNode, ShutdownCoordinator, ShutdownSignal};

async fn start(mesh: &meshgate_core::LocalMesh, id: &str, name: &str, shutdown: &ShutdownCoordinator) -> RunningNode {
    mesh.node(NodeIdentity::new(id, name), test_config(name))
        .unwrap()
        .start(shutdown)
        .await
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_two_peers_see_each_other_then_one_leaves() {
    let mesh = test_mesh();
    let shutdown = ShutdownCoordinator::new();
    let alice = start(&mesh, "peerA", "alice", &shutdown).await;
    let bob = start(&mesh, "peerB", "bob", &shutdown).await;

    // whichever peer subscribed last missed the other's first beat;
    // the next one follows within a heartbeat interval
    for (node, other) in [(&alice, "bob"), (&bob, "alice")] {
        let mut online = node.presence().watch();
        let peers = wait_for_watch(&mut online, Duration::from_millis(1200), |p| !p.is_empty())
            .await
            .unwrap();
        assert_eq!(peer_names(&peers), vec![other]);
    }

    mesh.hub().set_partitioned("peerA", true);
    tokio::time::sleep(Duration::from_secs(6)).await;
    // one more prune pass at most
    let mut watch = bob.presence().watch();
    let peers = wait_for_watch(&mut watch, Duration::from_secs(3), |p| p.is_empty()).await;
    assert!(peers.is_ok());

    shutdown.shutdown(ShutdownSignal::Graceful);
    alice.join().await.unwrap();
    bob.join().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_heartbeating_peer_stays_online() {
    let mesh = test_mesh();
    let shutdown = ShutdownCoordinator::new();
    let alice = start(&mesh, "peerA", "alice", &shutdown).await;
    let bob = start(&mesh, "peerB", "bob", &shutdown).await;
    let mut events = bob.presence().events();

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(peer_names(&bob.presence().online_peers()), vec!["alice"]);

    while let Ok(event) = events.try_recv() {
        assert!(!matches!(event, PresenceEvent::PeerOffline(_)), "unexpected {:?}", event);
    }

    shutdown.shutdown(ShutdownSignal::Graceful);
    alice.join().await.unwrap();
    bob.join().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_online_list_is_sorted_by_name() {
    let mesh = test_mesh();
    let shutdown = ShutdownCoordinator::new();
    let observer = start(&mesh, "peer0", "observer", &shutdown).await;
    let _carol = start(&mesh, "peer3", "carol", &shutdown).await;
    let _alice = start(&mesh, "peer1", "alice", &shutdown).await;
    let _bob = start(&mesh, "peer2", "bob", &shutdown).await;

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(
        peer_names(&observer.presence().online_peers()),
        vec!["alice", "bob", "carol"]
    );
    shutdown.shutdown(ShutdownSignal::Graceful);
}

#[tokio::test(start_paused = true)]
async fn test_chat_reaches_other_peers_only() {
    let mesh = test_mesh();
    let shutdown = ShutdownCoordinator::new();
    let alice = start(&mesh, "peerA", "alice", &shutdown).await;
    let bob = start(&mesh, "peerB", "bob", &shutdown).await;
    let mut alice_events = alice.presence().events();
    let mut bob_events = bob.presence().events();

    tokio::time::sleep(Duration::from_millis(100)).await;
    alice.presence().send_chat("anyone here?").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut bob_chats = Vec::new();
    while let Ok(event) = bob_events.try_recv() {
        if let PresenceEvent::Chat { name, text, .. } = event {
            bob_chats.push((name, text));
        }
    }
    assert_eq!(bob_chats, vec![("alice".to_string(), "anyone here?".to_string())]);

    while let Ok(event) = alice_events.try_recv() {
        assert!(!matches!(event, PresenceEvent::Chat { .. }));
    }
    shutdown.shutdown(ShutdownSignal::Graceful);
}
