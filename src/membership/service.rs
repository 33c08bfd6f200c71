//! Membership service: gossip transport + leader-driven bootstrap
//!
//! A node never picks its own seed. It contends for the fleet lease
//! `"{service}/{fleet}"` under its advertised gossip address; whoever holds
//! the lease is the seed. The first leader observation decides: the holder
//! joins nobody, everyone else joins the holder. Later leader changes re-join
//! the new holder when it is not already a known member.

use crate::common::{jitter, CancelToken, Config, Error, Metrics, Result, JITTER_FACTOR};
use crate::election::{LeaderCallbacks, LeaderElectionConfig, LeaderElector, LockBackend};
use crate::membership::broadcast::BroadcastQueue;
use crate::membership::delegate::{ClusterDelegate, Delegates, MembershipHooks, NodeDirectory};
use crate::membership::metadata::NodeMetadata;
use crate::membership::tcp::TcpGossip;
use crate::membership::transport::{GossipTransport, MemberState};
use crate::routing::RoutingTable;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// A member as reported by `GET /node`.
#[derive(Debug, Clone, Serialize)]
pub struct MemberInfo {
    pub name: String,
    pub addr: SocketAddr,
    pub state: MemberState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<NodeMetadata>,
}

/// Optional collaborators for [`MembershipService::start`].
#[derive(Default, Clone)]
pub struct MembershipOptions {
    pub hooks: Option<Arc<dyn MembershipHooks>>,
    pub metrics: Option<Arc<Metrics>>,
}

/// Election callbacks: publish each new fleet leader to the [`LeaderFollower`].
struct Bootstrap {
    identity: String,
    leader: watch::Sender<String>,
    metrics: Option<Arc<Metrics>>,
}

#[async_trait]
impl LeaderCallbacks for Bootstrap {
    async fn on_started_leading(&self, _leading: CancelToken) {
        info!(identity = %self.identity, "holding fleet lease; acting as gossip seed");
    }

    async fn on_stopped_leading(&self) {
        info!(identity = %self.identity, "no longer holding fleet lease");
    }

    async fn on_new_leader(&self, identity: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.record_leader_transition();
        }
        self.leader.send_replace(identity.to_string());
    }
}

/// Joins whichever node currently holds the fleet lease.
///
/// Runs beside the election loop so that a join retrying against an
/// unreachable leader never holds up later leader notifications.
struct LeaderFollower {
    identity: String,
    transport: Arc<dyn GossipTransport>,
    ready: watch::Sender<bool>,
    retry_period: Duration,
}

impl LeaderFollower {
    async fn run(self, mut leader: watch::Receiver<String>, cancel: CancelToken) {
        loop {
            let current = leader.borrow_and_update().clone();
            if !current.is_empty() {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = self.follow(&current) => {}
                    changed = leader.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        continue;
                    }
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                changed = leader.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }
    }

    fn is_member(&self, identity: &str) -> bool {
        self.transport
            .members()
            .iter()
            .any(|m| m.addr.to_string() == identity)
    }

    /// Seed the fleet, or retry joining `leader` until it answers.
    async fn follow(&self, leader: &str) {
        if leader == self.identity {
            info!("this node is the fleet seed");
            self.ready.send_replace(true);
            return;
        }
        if *self.ready.borrow() && self.is_member(leader) {
            info!(%leader, "new fleet leader is already a member");
            return;
        }

        let addrs = [leader.to_string()];
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.transport.join(&addrs).await {
                Ok(_) => {
                    info!(%leader, attempt, "joined fleet through leader");
                    self.ready.send_replace(true);
                    return;
                }
                Err(e) if !e.is_retryable() => {
                    error!(%leader, "could not join fleet leader: {}", e);
                    return;
                }
                Err(e) => warn!(%leader, attempt, "failed to join leader: {}", e),
            }
            tokio::time::sleep(jitter(self.retry_period, JITTER_FACTOR)).await;
        }
    }
}

pub struct MembershipService {
    local: NodeMetadata,
    advertise: SocketAddr,
    transport: Arc<dyn GossipTransport>,
    directory: Arc<NodeDirectory>,
    table: Arc<RoutingTable>,
    broadcasts: Arc<BroadcastQueue>,
    elector: Arc<LeaderElector>,
    cancel: CancelToken,
    election_task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for MembershipService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MembershipService")
            .field("node", &self.local.node_name)
            .field("advertise", &self.advertise)
            .field("elector", &self.elector)
            .finish()
    }
}

impl MembershipService {
    /// Start gossip, contend for the fleet lease and wait until this node is
    /// either the seed or joined to it. Gives up after
    /// `config.startup_timeout()` with [`Error::BootstrapTimeout`].
    pub async fn start(
        config: &Config,
        locks: &LockBackend,
        options: MembershipOptions,
        parent: &CancelToken,
    ) -> Result<Arc<Self>> {
        let node = &config.node;
        let local = NodeMetadata {
            node_name: node.name.clone(),
            service_name: node.service.clone(),
            private_ip: node.private_ip.clone(),
            public_ip: node.public_ip.clone(),
            cluster_name: node.cluster.clone(),
            port: node.port,
            capacity: node.capacity,
        };

        let broadcasts = Arc::new(BroadcastQueue::new(config.gossip.retransmit_mult));
        let table = Arc::new(RoutingTable::new(broadcasts.clone()));
        let directory = Arc::new(NodeDirectory::new());
        let mut delegate = ClusterDelegate::new(
            local.clone(),
            table.clone(),
            broadcasts.clone(),
            directory.clone(),
        );
        if let Some(hooks) = options.hooks {
            delegate = delegate.with_hooks(hooks);
        }
        if let Some(metrics) = &options.metrics {
            delegate = delegate.with_metrics(metrics.clone());
        }

        let fallback_ip = node
            .private_ip
            .parse::<IpAddr>()
            .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
        let gossip = TcpGossip::create(
            &node.name,
            &config.gossip,
            fallback_ip,
            Delegates::from_shared(Arc::new(delegate)),
        )
        .await?;
        let advertise = gossip.advertise_addr();
        let transport: Arc<dyn GossipTransport> = Arc::new(gossip);

        let identity = advertise.to_string();
        let lease_name = format!("{}/{}", node.service, node.fleet);
        let lock = match locks.open(&lease_name, &identity) {
            Ok(lock) => lock,
            Err(e) => {
                transport.shutdown().await;
                return Err(e);
            }
        };

        let (ready_tx, mut ready_rx) = watch::channel(false);
        let (leader_tx, leader_rx) = watch::channel(String::new());
        let callbacks = Arc::new(Bootstrap {
            identity: identity.clone(),
            leader: leader_tx,
            metrics: options.metrics.clone(),
        });
        let election = LeaderElectionConfig::new(lease_name.clone(), lock, callbacks)
            .with_timing(
                config.election.lease_duration(),
                config.election.renew_deadline(),
                config.election.retry_period(),
            )
            .with_release_on_cancel(config.election.release_on_cancel);
        let elector = match LeaderElector::new(election) {
            Ok(elector) => Arc::new(elector),
            Err(e) => {
                transport.shutdown().await;
                return Err(e);
            }
        };

        let cancel = parent.child();
        let follower = LeaderFollower {
            identity: identity.clone(),
            transport: transport.clone(),
            ready: ready_tx,
            retry_period: config.election.retry_period(),
        };
        tokio::spawn(follower.run(leader_rx, cancel.clone()));
        let task = {
            let elector = elector.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { elector.run_forever(&cancel).await })
        };

        let service = Arc::new(Self {
            local,
            advertise,
            transport,
            directory,
            table,
            broadcasts,
            elector,
            cancel,
            election_task: Mutex::new(Some(task)),
        });

        info!(
            node = %service.local.node_name,
            lease = %lease_name,
            gossip = %advertise,
            "waiting for fleet bootstrap"
        );
        let startup = config.startup_timeout();
        let outcome = tokio::select! {
            biased;
            _ = parent.cancelled() => Err(Error::Cancelled),
            waited = tokio::time::timeout(startup, ready_rx.wait_for(|ready| *ready)) => match waited {
                Ok(Ok(_)) => Ok(()),
                Ok(Err(_)) => Err(Error::Internal("bootstrap signal dropped".into())),
                Err(_) => Err(Error::BootstrapTimeout(startup)),
            },
        };
        if let Err(e) = outcome {
            service.stop_election().await;
            service.transport.shutdown().await;
            return Err(e);
        }

        info!(
            node = %service.local.node_name,
            members = service.transport.members().len(),
            "fleet membership established"
        );
        Ok(service)
    }

    pub fn local(&self) -> &NodeMetadata {
        &self.local
    }

    /// Gossip address this node advertises (also its lease identity).
    pub fn advertise_addr(&self) -> SocketAddr {
        self.advertise
    }

    pub fn table(&self) -> Arc<RoutingTable> {
        self.table.clone()
    }

    pub fn directory(&self) -> Arc<NodeDirectory> {
        self.directory.clone()
    }

    pub fn elector(&self) -> Arc<LeaderElector> {
        self.elector.clone()
    }

    pub fn broadcasts(&self) -> Arc<BroadcastQueue> {
        self.broadcasts.clone()
    }

    /// Live members with their decoded metadata.
    pub fn members(&self) -> Vec<MemberInfo> {
        self.transport
            .members()
            .into_iter()
            .map(|m| MemberInfo {
                meta: NodeMetadata::decode(&m.meta).ok(),
                name: m.name,
                addr: m.addr,
                state: m.state,
            })
            .collect()
    }

    /// HTTP base URL of a node serving `cluster` for `service`.
    pub fn resolve(&self, service: &str, cluster: &str) -> Result<String> {
        self.directory
            .find(service, cluster)
            .map(|meta| meta.http_base())
            .ok_or_else(|| Error::Unavailable(format!("{}/{}", service, cluster)))
    }

    /// Leave the fleet: stop contending (releasing the lease if configured)
    /// and announce departure, each bounded by `timeout`.
    pub async fn shutdown(&self, timeout: Duration) -> Result<()> {
        if tokio::time::timeout(timeout, self.stop_election())
            .await
            .is_err()
        {
            warn!("election loop did not stop within {:?}", timeout);
        }
        self.transport.leave(timeout).await
    }

    async fn stop_election(&self) {
        self.cancel.cancel();
        let task = self.election_task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("election task failed: {}", e);
            }
        }
    }
}

impl Drop for MembershipService {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::election::{DistributedLock, LeaseRecord, MemoryLockStore};

    fn node_config(name: &str, cluster: &str) -> Config {
        let mut config = Config::default();
        config.node.name = name.into();
        config.node.cluster = cluster.into();
        config.node.port = 8080;
        config.gossip.bind_addr = "127.0.0.1:0".parse().unwrap();
        config.gossip.gossip_interval_ms = 20;
        config.gossip.probe_interval_ms = 200;
        config.election.lease_duration_ms = 1_000;
        config.election.renew_deadline_ms = 600;
        config.election.retry_period_ms = 100;
        config.startup_timeout_secs = 5;
        config
    }

    async fn eventually<F: Fn() -> bool>(check: F) -> bool {
        for _ in 0..150 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_first_node_seeds_second_joins() {
        let locks = LockBackend::Memory(MemoryLockStore::new());
        let cancel = CancelToken::new();

        let a = MembershipService::start(
            &node_config("a", "east"),
            &locks,
            MembershipOptions::default(),
            &cancel,
        )
        .await
        .unwrap();
        let b = MembershipService::start(
            &node_config("b", "west"),
            &locks,
            MembershipOptions::default(),
            &cancel,
        )
        .await
        .unwrap();

        assert!(a.elector().is_leader());
        assert_eq!(b.elector().get_leader(), a.advertise_addr().to_string());
        assert_eq!(b.members().len(), 2);
        assert!(eventually(|| a.members().len() == 2).await);

        assert_eq!(
            b.resolve("sensor-gateway", "east").unwrap(),
            "http://127.0.0.1:8080"
        );
        assert!(matches!(
            a.resolve("sensor-gateway", "north"),
            Err(Error::Unavailable(_))
        ));

        a.table().add("s-1", "east");
        assert!(eventually(|| b.table().get("s-1").as_deref() == Some("east")).await);

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_join_merges_existing_routes() {
        let locks = LockBackend::Memory(MemoryLockStore::new());
        let cancel = CancelToken::new();

        let a = MembershipService::start(
            &node_config("a", "east"),
            &locks,
            MembershipOptions::default(),
            &cancel,
        )
        .await
        .unwrap();
        a.table().add("s-7", "east");

        let b = MembershipService::start(
            &node_config("b", "west"),
            &locks,
            MembershipOptions::default(),
            &cancel,
        )
        .await
        .unwrap();
        // push/pull during join carries the full table
        assert_eq!(b.table().get("s-7").as_deref(), Some("east"));
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_startup_times_out_when_leader_unreachable() {
        let store = MemoryLockStore::new();
        let ghost = store.handle("sensor-gateway/default", "127.0.0.1:1");
        let now = chrono::Utc::now();
        ghost
            .create(&LeaseRecord {
                holder_identity: "127.0.0.1:1".into(),
                lease_duration_ms: 60_000,
                acquire_time: now,
                renew_time: now,
                leader_transitions: 0,
            })
            .await
            .unwrap();

        let mut config = node_config("a", "east");
        config.startup_timeout_secs = 1;
        let result = MembershipService::start(
            &config,
            &LockBackend::Memory(store),
            MembershipOptions::default(),
            &CancelToken::new(),
        )
        .await;
        assert!(matches!(result, Err(Error::BootstrapTimeout(_))));
    }

    #[tokio::test]
    async fn test_join_retried_until_late_leader_answers() {
        // the lease names an address nobody listens on yet
        let reserved = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let seed_addr = reserved.local_addr().unwrap();
        drop(reserved);

        let store = MemoryLockStore::new();
        let holder = store.handle("sensor-gateway/default", &seed_addr.to_string());
        let now = chrono::Utc::now();
        holder
            .create(&LeaseRecord {
                holder_identity: seed_addr.to_string(),
                lease_duration_ms: 60_000,
                acquire_time: now,
                renew_time: now,
                leader_transitions: 0,
            })
            .await
            .unwrap();
        let locks = LockBackend::Memory(store);
        let cancel = CancelToken::new();

        let mut follower_config = node_config("b", "west");
        follower_config.startup_timeout_secs = 4;
        let follower = tokio::spawn({
            let locks = locks.clone();
            let cancel = cancel.clone();
            async move {
                MembershipService::start(
                    &follower_config,
                    &locks,
                    MembershipOptions::default(),
                    &cancel,
                )
                .await
            }
        });

        // several join attempts fail before the seed comes up
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        let mut seed_config = node_config("a", "east");
        seed_config.gossip.bind_addr = seed_addr;
        let seed = MembershipService::start(
            &seed_config,
            &locks,
            MembershipOptions::default(),
            &cancel,
        )
        .await
        .unwrap();
        assert!(seed.elector().is_leader());

        let follower = follower.await.unwrap().unwrap();
        assert_eq!(follower.elector().get_leader(), seed_addr.to_string());
        assert_eq!(follower.members().len(), 2);

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_shutdown_releases_lease() {
        let store = MemoryLockStore::new();
        let locks = LockBackend::Memory(store.clone());
        let cancel = CancelToken::new();

        let a = MembershipService::start(
            &node_config("a", "east"),
            &locks,
            MembershipOptions::default(),
            &cancel,
        )
        .await
        .unwrap();
        a.shutdown(Duration::from_secs(2)).await.unwrap();

        let record = store.peek("sensor-gateway/default").unwrap();
        assert!(record.holder_identity.is_empty());
    }
}
