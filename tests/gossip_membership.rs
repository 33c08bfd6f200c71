//! Fleet membership over the shared-file lease backend

use fleetcoord::membership::{MembershipHooks, MembershipOptions, NodeMetadata};
use fleetcoord::{CancelToken, Config, Error, LockBackend, MembershipService};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn node_config(name: &str, cluster: &str, port: u16) -> Config {
    let mut config = Config::default();
    config.node.name = name.into();
    config.node.cluster = cluster.into();
    config.node.port = port;
    config.gossip.bind_addr = "127.0.0.1:0".parse().unwrap();
    config.gossip.gossip_interval_ms = 20;
    config.gossip.probe_interval_ms = 100;
    config.gossip.suspicion_timeout_ms = 500;
    config.election.lease_duration_ms = 1_000;
    config.election.renew_deadline_ms = 600;
    config.election.retry_period_ms = 100;
    config.election.release_on_cancel = true;
    config.startup_timeout_secs = 5;
    config
}

/// Metadata updates are reported as joins too, so names may repeat.
#[derive(Default)]
struct Tracker {
    joined: Mutex<HashSet<String>>,
    left: Mutex<Vec<String>>,
}

impl MembershipHooks for Tracker {
    fn on_node_join(&self, node: &NodeMetadata) {
        self.joined.lock().insert(node.node_name.clone());
    }

    fn on_node_leave(&self, node: &NodeMetadata) {
        self.left.lock().push(node.node_name.clone());
    }
}

async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

async fn start(
    config: Config,
    locks: &LockBackend,
    cancel: &CancelToken,
    hooks: Option<Arc<Tracker>>,
) -> Arc<MembershipService> {
    let options = MembershipOptions {
        hooks: hooks.map(|h| h as Arc<dyn MembershipHooks>),
        metrics: None,
    };
    MembershipService::start(&config, locks, options, cancel)
        .await
        .unwrap()
}

#[tokio::test]
async fn test_three_nodes_converge_and_leave() {
    let dir = TempDir::new().unwrap();
    let locks = LockBackend::File(dir.path().to_path_buf());
    let cancel = CancelToken::new();
    let tracker = Arc::new(Tracker::default());

    let a = start(node_config("a", "east", 9001), &locks, &cancel, Some(tracker.clone())).await;
    let b = start(node_config("b", "west", 9002), &locks, &cancel, None).await;
    let c = start(node_config("c", "north", 9003), &locks, &cancel, None).await;

    for node in [&a, &b, &c] {
        assert!(eventually(|| node.members().len() == 3).await);
    }
    assert!(a.elector().is_leader());
    assert_eq!(c.elector().get_leader(), a.advertise_addr().to_string());
    assert_eq!(
        b.resolve("sensor-gateway", "north").unwrap(),
        "http://127.0.0.1:9003"
    );
    assert!(eventually(|| tracker.joined.lock().len() == 3).await);

    // Routes written anywhere reach everyone
    b.table().add("s-1", "west");
    c.table().add_many(&["s-2".to_string(), "s-3".to_string()], "north");
    for node in [&a, &b, &c] {
        assert!(eventually(|| node.table().len() == 3).await);
    }
    a.table().delete("s-2");
    assert!(eventually(|| c.table().get("s-2").is_none()).await);

    c.shutdown(Duration::from_secs(1)).await.unwrap();
    assert!(eventually(|| a.members().len() == 2).await);
    assert!(eventually(|| tracker.left.lock().contains(&"c".to_string())).await);
    assert!(matches!(
        a.resolve("sensor-gateway", "north"),
        Err(Error::Unavailable(_))
    ));

    cancel.cancel();
}

#[tokio::test]
async fn test_lease_passes_on_when_seed_leaves() {
    let dir = TempDir::new().unwrap();
    let locks = LockBackend::File(dir.path().to_path_buf());
    let cancel = CancelToken::new();

    let a = start(node_config("a", "east", 9011), &locks, &cancel, None).await;
    let b = start(node_config("b", "west", 9012), &locks, &cancel, None).await;
    assert!(eventually(|| b.members().len() == 2).await);
    let transitions = b.elector().leader_transitions();

    // a releases the lease on the way out, so b takes over without waiting
    // for it to expire
    a.shutdown(Duration::from_secs(1)).await.unwrap();
    assert!(eventually(|| b.elector().is_leader()).await);
    assert!(b.elector().leader_transitions() > transitions);
    assert!(eventually(|| b.members().len() == 1).await);

    cancel.cancel();
}
