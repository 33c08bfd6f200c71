//! Leader failover between two contenders sharing one lease

use async_trait::async_trait;
use fleetcoord::election::{
    DistributedLock, LeaderCallbacks, LeaderElectionConfig, LeaderElector, MemoryLock,
    MemoryLockStore,
};
use fleetcoord::CancelToken;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

const LEASE: &str = "sensor-gateway/default";

#[derive(Default)]
struct Recorder {
    leaders: Mutex<Vec<String>>,
    started: Mutex<usize>,
    stopped: Mutex<usize>,
}

impl Recorder {
    fn saw_leader(&self, identity: &str) -> usize {
        self.leaders.lock().iter().filter(|l| *l == identity).count()
    }
}

#[async_trait]
impl LeaderCallbacks for Recorder {
    async fn on_started_leading(&self, _leading: CancelToken) {
        *self.started.lock() += 1;
    }

    async fn on_stopped_leading(&self) {
        *self.stopped.lock() += 1;
    }

    async fn on_new_leader(&self, identity: &str) {
        self.leaders.lock().push(identity.to_string());
    }
}

fn contender(
    store: &Arc<MemoryLockStore>,
    identity: &str,
) -> (Arc<LeaderElector>, Arc<MemoryLock>, Arc<Recorder>) {
    let lock = Arc::new(store.handle(LEASE, identity));
    let recorder = Arc::new(Recorder::default());
    let config = LeaderElectionConfig::new(
        LEASE,
        lock.clone() as Arc<dyn DistributedLock>,
        recorder.clone(),
    )
    .with_timing(
        Duration::from_millis(600),
        Duration::from_millis(400),
        Duration::from_millis(100),
    );
    let elector = Arc::new(LeaderElector::new(config).unwrap());
    (elector, lock, recorder)
}

fn spawn_election(elector: &Arc<LeaderElector>, cancel: &CancelToken) {
    let elector = elector.clone();
    let cancel = cancel.clone();
    tokio::spawn(async move { elector.run_forever(&cancel).await });
}

async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..250 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn test_failover_after_leader_stops_renewing() {
    let store = MemoryLockStore::new();
    let cancel = CancelToken::new();
    let (a, lock_a, rec_a) = contender(&store, "A");
    let (b, _lock_b, rec_b) = contender(&store, "B");

    spawn_election(&a, &cancel);
    assert!(eventually(|| a.is_leader()).await, "A never acquired");

    spawn_election(&b, &cancel);
    assert!(eventually(|| rec_b.saw_leader("A") == 1).await);
    assert!(!b.is_leader());

    let before = store.peek(LEASE).unwrap().leader_transitions;

    // A can no longer reach the store, so it stops renewing
    lock_a.set_partitioned(true);
    assert!(eventually(|| b.is_leader()).await, "B never took over");
    assert!(!a.is_leader());
    assert_eq!(store.peek(LEASE).unwrap().leader_transitions, before + 1);
    assert_eq!(store.peek(LEASE).unwrap().holder_identity, "B");

    lock_a.set_partitioned(false);
    assert!(eventually(|| rec_a.saw_leader("B") == 1).await);
    assert!(eventually(|| rec_b.saw_leader("B") == 1).await);
    assert!(eventually(|| *rec_a.stopped.lock() >= 1).await);
    assert_eq!(*rec_b.started.lock(), 1);

    // B keeps the lease once A is back
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(b.is_leader());
    assert!(!a.is_leader());
    assert_eq!(rec_a.saw_leader("B"), 1);
    assert_eq!(store.peek(LEASE).unwrap().leader_transitions, before + 1);

    cancel.cancel();
}

#[tokio::test]
async fn test_single_leader_among_many() {
    let store = MemoryLockStore::new();
    let cancel = CancelToken::new();
    let electors: Vec<_> = (0..5)
        .map(|i| contender(&store, &format!("node-{}", i)).0)
        .collect();
    for elector in &electors {
        spawn_election(elector, &cancel);
    }

    assert!(eventually(|| electors.iter().any(|e| e.is_leader())).await);
    for _ in 0..20 {
        let leaders = electors.iter().filter(|e| e.is_leader()).count();
        assert!(leaders <= 1, "{} leaders at once", leaders);
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    let holder = store.peek(LEASE).unwrap().holder_identity;
    for elector in &electors {
        assert!(eventually(|| elector.get_leader() == holder).await);
    }

    cancel.cancel();
}
