//! SWIM-style gossip over short-lived TCP exchanges
//!
//! Every exchange is one connection carrying a length-prefixed bincode
//! frame and, for pings and push/pull, one reply frame. Three background
//! loops drive the protocol:
//!
//! - probe: ping one random live peer; a failed ping marks it suspect, and a
//!   suspect that stays silent past the suspicion timeout is declared dead
//! - gossip: piggyback queued member rumors and user broadcasts onto a
//!   message sent to a few random peers
//! - push/pull: swap full member lists and delegate state with one random
//!   peer, repairing whatever gossip lost
//!
//! Departed members are kept as tombstones for a while so stale rumors
//! cannot bring them back; a restarted node refutes its own tombstone by
//! raising its incarnation.

use crate::common::{CancelToken, Error, GossipConfig, Result};
use crate::membership::broadcast::BroadcastQueue;
use crate::membership::delegate::Delegates;
use crate::membership::metadata::META_MAX_SIZE;
use crate::membership::transport::{GossipTransport, Member, MemberState};
use async_trait::async_trait;
use futures_util::future::join_all;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

const MAX_FRAME_SIZE: usize = 8 * 1024 * 1024;
/// Budget for piggybacked payloads in one gossip message
const GOSSIP_PAYLOAD_LIMIT: usize = 64 * 1024;
/// Per-entry framing cost inside a gossip message (bincode length prefix)
const ENTRY_OVERHEAD: usize = 8;
/// Tombstones outlive the suspicion timeout by this factor
const TOMBSTONE_FACTOR: u32 = 6;

#[derive(Debug, Serialize, Deserialize)]
enum Frame {
    Ping {
        from: String,
        seq: u64,
    },
    Ack {
        seq: u64,
    },
    Gossip {
        from: String,
        members: Vec<Member>,
        user: Vec<Vec<u8>>,
    },
    PushPull {
        from: String,
        join: bool,
        members: Vec<Member>,
        state: Vec<u8>,
    },
}

async fn write_frame(stream: &mut TcpStream, frame: &Frame) -> Result<()> {
    let body = bincode::serialize(frame)?;
    if body.len() > MAX_FRAME_SIZE {
        return Err(Error::Transport(format!(
            "frame of {} bytes exceeds {}",
            body.len(),
            MAX_FRAME_SIZE
        )));
    }
    stream.write_u32(body.len() as u32).await?;
    stream.write_all(&body).await?;
    stream.flush().await?;
    Ok(())
}

async fn read_frame(stream: &mut TcpStream) -> Result<Frame> {
    let len = stream.read_u32().await? as usize;
    if len > MAX_FRAME_SIZE {
        return Err(Error::Transport(format!(
            "frame of {} bytes exceeds {}",
            len, MAX_FRAME_SIZE
        )));
    }
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    Ok(bincode::deserialize(&body)?)
}

struct Peer {
    member: Member,
    suspect_deadline: Option<Instant>,
    departed_at: Option<Instant>,
}

/// What applying a member rumor did to the local view.
enum Outcome {
    Stale,
    Accepted,
    Joined(Member),
    Updated(Member),
    Departed(Member),
}

struct Inner {
    name: String,
    advertise: SocketAddr,
    config: GossipConfig,
    delegates: Delegates,
    peers: Mutex<HashMap<String, Peer>>,
    incarnation: AtomicU64,
    rumors: BroadcastQueue,
    seq: AtomicU64,
    left: AtomicBool,
    cancel: CancelToken,
}

impl Inner {
    fn local_member(&self) -> Member {
        Member {
            name: self.name.clone(),
            addr: self.advertise,
            meta: self.delegates.messages.node_meta(META_MAX_SIZE),
            state: if self.left.load(Ordering::Acquire) {
                MemberState::Left
            } else {
                MemberState::Alive
            },
            incarnation: self.incarnation.load(Ordering::Acquire),
        }
    }

    /// Full member list including tombstones, for push/pull.
    fn member_snapshot(&self) -> Vec<Member> {
        let mut members = vec![self.local_member()];
        members.extend(self.peers.lock().values().map(|p| p.member.clone()));
        members
    }

    fn live_peers(&self) -> Vec<Member> {
        self.peers
            .lock()
            .values()
            .filter(|p| p.member.state.is_live())
            .map(|p| p.member.clone())
            .collect()
    }

    fn random_live_peers(&self, n: usize) -> Vec<Member> {
        let mut peers = self.live_peers();
        peers.shuffle(&mut rand::thread_rng());
        peers.truncate(n);
        peers
    }

    fn queue_rumor(&self, member: &Member) {
        match bincode::serialize(member) {
            Ok(buf) => self.rumors.enqueue(buf),
            Err(e) => warn!("failed to encode member rumor: {}", e),
        }
    }

    fn refresh_cluster_size(&self) {
        let live = self
            .peers
            .lock()
            .values()
            .filter(|p| p.member.state.is_live())
            .count();
        self.rumors.set_num_nodes(live + 1);
    }

    /// Apply a rumor about any member and fire the matching event.
    fn apply_member(&self, update: Member) {
        if update.name == self.name {
            self.refute(&update);
            return;
        }

        let outcome = self.merge_member(&update);
        if matches!(outcome, Outcome::Stale) {
            return;
        }
        self.queue_rumor(&update);
        self.refresh_cluster_size();

        let events = &self.delegates.events;
        match outcome {
            Outcome::Joined(member) => {
                debug!(peer = %member.name, addr = %member.addr, "member alive");
                events.notify_join(&member);
            }
            Outcome::Updated(member) => events.notify_update(&member),
            Outcome::Departed(member) => {
                debug!(peer = %member.name, state = ?member.state, "member gone");
                events.notify_leave(&member);
            }
            Outcome::Stale | Outcome::Accepted => {}
        }
    }

    fn merge_member(&self, update: &Member) -> Outcome {
        let now = Instant::now();
        let mut peers = self.peers.lock();

        let Some(peer) = peers.get_mut(&update.name) else {
            if !update.state.is_live() {
                return Outcome::Stale;
            }
            let suspect_deadline = (update.state == MemberState::Suspect)
                .then(|| now + self.config.suspicion_timeout());
            peers.insert(
                update.name.clone(),
                Peer {
                    member: update.clone(),
                    suspect_deadline,
                    departed_at: None,
                },
            );
            return Outcome::Joined(update.clone());
        };

        let current = &peer.member;
        let newer = update.incarnation > current.incarnation
            || (update.incarnation == current.incarnation
                && update.state.severity() > current.state.severity());
        if !newer {
            return Outcome::Stale;
        }

        let was_live = current.state.is_live();
        match update.state {
            MemberState::Alive => {
                let changed = current.meta != update.meta || current.addr != update.addr;
                peer.member = update.clone();
                peer.suspect_deadline = None;
                peer.departed_at = None;
                if !was_live {
                    Outcome::Joined(update.clone())
                } else if changed {
                    Outcome::Updated(update.clone())
                } else {
                    Outcome::Accepted
                }
            }
            MemberState::Suspect => {
                if !was_live {
                    return Outcome::Stale;
                }
                peer.member.state = MemberState::Suspect;
                peer.member.incarnation = update.incarnation;
                peer.suspect_deadline
                    .get_or_insert(now + self.config.suspicion_timeout());
                Outcome::Accepted
            }
            MemberState::Dead | MemberState::Left => {
                peer.member.state = update.state;
                peer.member.incarnation = update.incarnation;
                peer.suspect_deadline = None;
                peer.departed_at = Some(now);
                if was_live {
                    Outcome::Departed(peer.member.clone())
                } else {
                    Outcome::Accepted
                }
            }
        }
    }

    /// Someone thinks we are suspect or dead: outbid them.
    fn refute(&self, update: &Member) {
        if self.left.load(Ordering::Acquire) || update.state == MemberState::Alive {
            return;
        }
        let current = self.incarnation.load(Ordering::Acquire);
        if update.incarnation < current {
            return;
        }
        self.incarnation
            .store(update.incarnation + 1, Ordering::Release);
        debug!(
            state = ?update.state,
            incarnation = update.incarnation + 1,
            "refuting rumor about self"
        );
        self.queue_rumor(&self.local_member());
    }

    async fn exchange(&self, addr: SocketAddr, frame: &Frame) -> Result<Frame> {
        timeout(self.config.tcp_timeout(), async {
            let mut stream = TcpStream::connect(addr).await?;
            write_frame(&mut stream, frame).await?;
            read_frame(&mut stream).await
        })
        .await?
    }

    async fn send(&self, addr: SocketAddr, frame: &Frame) -> Result<()> {
        timeout(self.config.tcp_timeout(), async {
            let mut stream = TcpStream::connect(addr).await?;
            write_frame(&mut stream, frame).await
        })
        .await?
    }

    async fn push_pull(&self, addr: SocketAddr, join: bool) -> Result<()> {
        let frame = Frame::PushPull {
            from: self.name.clone(),
            join,
            members: self.member_snapshot(),
            state: self.delegates.messages.local_state(join),
        };
        match self.exchange(addr, &frame).await? {
            Frame::PushPull { members, state, .. } => {
                for member in members {
                    self.apply_member(member);
                }
                self.delegates.messages.merge_remote_state(&state, join);
                Ok(())
            }
            other => Err(Error::Transport(format!(
                "unexpected push/pull reply from {}: {:?}",
                addr, other
            ))),
        }
    }

    async fn handle_conn(self: Arc<Self>, mut stream: TcpStream) -> Result<()> {
        let frame = timeout(self.config.tcp_timeout(), read_frame(&mut stream)).await??;
        match frame {
            Frame::Ping { from, seq } => {
                trace!(peer = %from, seq, "ping");
                write_frame(&mut stream, &Frame::Ack { seq }).await?;
            }
            Frame::Gossip {
                from,
                members,
                user,
            } => {
                trace!(peer = %from, members = members.len(), user = user.len(), "gossip");
                for member in members {
                    self.apply_member(member);
                }
                for msg in &user {
                    self.delegates.messages.notify_msg(msg);
                }
            }
            Frame::PushPull {
                from,
                join,
                members,
                state,
            } => {
                debug!(peer = %from, join, "push/pull");
                let reply = Frame::PushPull {
                    from: self.name.clone(),
                    join,
                    members: self.member_snapshot(),
                    state: self.delegates.messages.local_state(join),
                };
                timeout(self.config.tcp_timeout(), write_frame(&mut stream, &reply)).await??;
                for member in members {
                    self.apply_member(member);
                }
                self.delegates.messages.merge_remote_state(&state, join);
            }
            Frame::Ack { .. } => {}
        }
        Ok(())
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        let inner = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = inner.handle_conn(stream).await {
                                debug!(%remote, "gossip connection failed: {}", e);
                            }
                        });
                    }
                    Err(e) => warn!("gossip accept failed: {}", e),
                },
            }
        }
    }

    async fn probe_round(&self) {
        if let Some(target) = self.random_live_peers(1).pop() {
            let seq = self.seq.fetch_add(1, Ordering::Relaxed);
            let ping = Frame::Ping {
                from: self.name.clone(),
                seq,
            };
            let acked = matches!(
                self.exchange(target.addr, &ping).await,
                Ok(Frame::Ack { seq: s }) if s == seq
            );
            if acked {
                let mut peers = self.peers.lock();
                if let Some(peer) = peers.get_mut(&target.name) {
                    if peer.member.state == MemberState::Suspect {
                        peer.member.state = MemberState::Alive;
                        peer.suspect_deadline = None;
                    }
                }
            } else {
                let current = self
                    .peers
                    .lock()
                    .get(&target.name)
                    .map(|p| p.member.clone());
                if let Some(mut suspect) = current.filter(|m| m.state == MemberState::Alive) {
                    debug!(peer = %suspect.name, "probe failed, suspecting");
                    suspect.state = MemberState::Suspect;
                    self.apply_member(suspect);
                }
            }
        }
        self.expire_suspects();
    }

    fn expire_suspects(&self) {
        let now = Instant::now();
        let tombstone_ttl = self.config.suspicion_timeout() * TOMBSTONE_FACTOR;
        let expired: Vec<Member> = {
            let mut peers = self.peers.lock();
            peers.retain(|_, p| {
                p.departed_at
                    .map_or(true, |at| now.duration_since(at) < tombstone_ttl)
            });
            peers
                .values()
                .filter(|p| p.suspect_deadline.is_some_and(|d| d <= now))
                .map(|p| p.member.clone())
                .collect()
        };
        for mut member in expired {
            info!(peer = %member.name, "suspect timed out, declaring dead");
            member.state = MemberState::Dead;
            self.apply_member(member);
        }
    }

    async fn gossip_round(&self) {
        let targets = self.random_live_peers(self.config.gossip_nodes.max(1));
        if targets.is_empty() {
            return;
        }
        let members: Vec<Member> = self
            .rumors
            .get_broadcasts(ENTRY_OVERHEAD, GOSSIP_PAYLOAD_LIMIT / 2)
            .iter()
            .filter_map(|buf| bincode::deserialize(buf).ok())
            .collect();
        let user = self
            .delegates
            .messages
            .get_broadcasts(ENTRY_OVERHEAD, GOSSIP_PAYLOAD_LIMIT / 2);
        if members.is_empty() && user.is_empty() {
            return;
        }

        let frame = Frame::Gossip {
            from: self.name.clone(),
            members,
            user,
        };
        let sends = targets.iter().map(|t| self.send(t.addr, &frame));
        for (target, result) in targets.iter().zip(join_all(sends).await) {
            if let Err(e) = result {
                debug!(peer = %target.name, "gossip send failed: {}", e);
            }
        }
    }

    async fn push_pull_round(&self) {
        if let Some(target) = self.random_live_peers(1).pop() {
            if let Err(e) = self.push_pull(target.addr, false).await {
                debug!(peer = %target.name, "push/pull failed: {}", e);
            }
        }
    }
}

/// TCP gossip transport.
pub struct TcpGossip {
    inner: Arc<Inner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TcpGossip {
    /// Bind the gossip listener and start the background loops.
    ///
    /// When `config.advertise_addr` is unset and the bind address is a
    /// wildcard, peers are told `fallback_ip` with the bound port.
    pub async fn create(
        name: &str,
        config: &GossipConfig,
        fallback_ip: IpAddr,
        delegates: Delegates,
    ) -> Result<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let bound = listener.local_addr()?;
        let advertise = config.advertise_addr.unwrap_or_else(|| {
            if bound.ip().is_unspecified() {
                SocketAddr::new(fallback_ip, bound.port())
            } else {
                bound
            }
        });

        let inner = Arc::new(Inner {
            name: name.to_string(),
            advertise,
            config: config.clone(),
            delegates,
            peers: Mutex::new(HashMap::new()),
            incarnation: AtomicU64::new(0),
            rumors: BroadcastQueue::new(config.retransmit_mult),
            seq: AtomicU64::new(0),
            left: AtomicBool::new(false),
            cancel: CancelToken::new(),
        });
        inner.delegates.events.notify_join(&inner.local_member());

        let mut tasks = vec![tokio::spawn(inner.clone().accept_loop(listener))];
        tasks.push(spawn_periodic(
            inner.clone(),
            config.probe_interval(),
            |inner| async move { inner.probe_round().await },
        ));
        tasks.push(spawn_periodic(
            inner.clone(),
            config.gossip_interval(),
            |inner| async move { inner.gossip_round().await },
        ));
        tasks.push(spawn_periodic(
            inner.clone(),
            config.push_pull_interval(),
            |inner| async move { inner.push_pull_round().await },
        ));

        info!(%bound, %advertise, node = %name, "gossip transport listening");
        Ok(Self {
            inner,
            tasks: Mutex::new(tasks),
        })
    }

    pub fn advertise_addr(&self) -> SocketAddr {
        self.inner.advertise
    }
}

fn spawn_periodic<F, Fut>(inner: Arc<Inner>, period: Duration, round: F) -> JoinHandle<()>
where
    F: Fn(Arc<Inner>) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = inner.cancel.cancelled() => break,
                _ = ticker.tick() => round(inner.clone()).await,
            }
        }
    })
}

#[async_trait]
impl GossipTransport for TcpGossip {
    async fn join(&self, addrs: &[String]) -> Result<usize> {
        let mut joined = 0;
        let mut last_error: Option<Error> = None;
        for addr in addrs {
            let resolved = match tokio::net::lookup_host(addr.as_str()).await {
                Ok(mut found) => found.next(),
                Err(e) => {
                    last_error = Some(e.into());
                    continue;
                }
            };
            let Some(resolved) = resolved else {
                last_error = Some(Error::JoinFailed(format!("{} did not resolve", addr)));
                continue;
            };
            if resolved == self.inner.advertise {
                continue;
            }
            match self.inner.push_pull(resolved, true).await {
                Ok(()) => {
                    info!(peer = %resolved, "joined gossip cluster");
                    joined += 1;
                }
                Err(e) => {
                    warn!(peer = %resolved, "join attempt failed: {}", e);
                    last_error = Some(e);
                }
            }
        }
        match (joined, last_error) {
            (0, Some(e)) => Err(Error::JoinFailed(e.to_string())),
            (n, _) => Ok(n),
        }
    }

    fn members(&self) -> Vec<Member> {
        let mut members = self.inner.live_peers();
        members.push(self.inner.local_member());
        members.sort_by(|a, b| a.name.cmp(&b.name));
        members
    }

    fn local_member(&self) -> Member {
        self.inner.local_member()
    }

    async fn leave(&self, within: Duration) -> Result<()> {
        if self.inner.left.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.inner.incarnation.fetch_add(1, Ordering::AcqRel);
        let farewell = Frame::Gossip {
            from: self.inner.name.clone(),
            members: vec![self.inner.local_member()],
            user: Vec::new(),
        };
        let peers = self.inner.live_peers();
        let sends = peers.iter().map(|p| self.inner.send(p.addr, &farewell));
        let announced = timeout(within, join_all(sends)).await;
        self.shutdown().await;

        match announced {
            Ok(results) => {
                let failed = results.iter().filter(|r| r.is_err()).count();
                info!(peers = peers.len(), failed, "left gossip cluster");
                Ok(())
            }
            Err(_) => Err(Error::Timeout(format!(
                "leave not announced within {:?}",
                within
            ))),
        }
    }

    async fn shutdown(&self) {
        self.inner.cancel.cancel();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

impl Drop for TcpGossip {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
    }
}
