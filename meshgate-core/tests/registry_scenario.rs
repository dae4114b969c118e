/*
    Registry scenario tests

    Nodes sharing one registry credential converge on a common member list
    through the signed pointer, even when they join at different times and
    their writes race each other.
*/

use std::time::Duration;

use meshgate_core::core_registry::SyncStatus;
use meshgate_core::test_utils::{member_names, test_config, test_mesh, wait_for_watch};
use meshgate_core::{LocalMesh, NodeIdentity, RunningNode, ShutdownCoordinator, ShutdownSignal};

async fn start(mesh: &LocalMesh, id: &str, name: &str, shutdown: &ShutdownCoordinator) -> RunningNode {
    mesh.node(NodeIdentity::new(id, name), test_config(name))
        .unwrap()
        .start(shutdown)
        .await
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_staggered_peers_converge() {
    let mesh = test_mesh();
    let shutdown = ShutdownCoordinator::new();

    let alice = start(&mesh, "peerA", "alice", &shutdown).await;
    tokio::time::sleep(Duration::from_secs(5)).await;
    let bob = start(&mesh, "peerB", "bob", &shutdown).await;
    tokio::time::sleep(Duration::from_secs(5)).await;
    let carol = start(&mesh, "peerC", "carol", &shutdown).await;

    let everyone = vec!["alice", "bob", "carol"];
    for node in [&alice, &bob, &carol] {
        let mut members = node.registry().members();
        let view = wait_for_watch(&mut members, Duration::from_secs(180), |m| m.len() == 3)
            .await
            .unwrap();
        assert_eq!(member_names(&view), everyone);
    }

    // the stored snapshot agrees
    let record = mesh.pointers().current(&alice.registry_key()).unwrap();
    assert!(record.verify().is_ok());
    assert!(mesh.content().contains(&record.content_ref));

    shutdown.shutdown(ShutdownSignal::Graceful);
    for node in [alice, bob, carol] {
        node.join().await.unwrap();
    }
}

#[tokio::test(start_paused = true)]
async fn test_registry_outage_then_recovery() {
    let mesh = test_mesh();
    let shutdown = ShutdownCoordinator::new();
    mesh.pointers().set_reachable(false);

    let alice = start(&mesh, "peerA", "alice", &shutdown).await;
    let mut status = alice.registry().status();
    let waiting = wait_for_watch(&mut status, Duration::from_secs(30), |s| {
        *s == SyncStatus::WaitingForConnection
    })
    .await;
    assert!(waiting.is_ok());
    // local view still lists ourselves
    assert_eq!(member_names(&alice.registry().members().borrow()), vec!["alice"]);
    assert!(mesh.pointers().history().is_empty());

    mesh.pointers().set_reachable(true);
    let synced = wait_for_watch(&mut status, Duration::from_secs(30), |s| {
        matches!(s, SyncStatus::Synced { .. })
    })
    .await;
    assert!(synced.is_ok());
    assert_eq!(mesh.pointers().history().len(), 1);

    shutdown.shutdown(ShutdownSignal::Graceful);
    alice.join().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_publishes_respect_cooldown() {
    let mesh = test_mesh();
    let shutdown = ShutdownCoordinator::new();
    let alice = start(&mesh, "peerA", "alice", &shutdown).await;

    tokio::time::sleep(Duration::from_secs(5 * 60)).await;
    let history = mesh.pointers().history();
    assert!(history.len() >= 5);
    for pair in history.windows(2) {
        assert!(pair[1].at - pair[0].at >= Duration::from_secs(60));
        assert_eq!(pair[1].sequence, pair[0].sequence + 1);
    }

    shutdown.shutdown(ShutdownSignal::Graceful);
    alice.join().await.unwrap();
}
