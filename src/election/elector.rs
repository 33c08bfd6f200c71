//! Lease-based leader election
//!
//! One `LeaderElector` contends for one lease. It acquires with jittered
//! retries, renews inside a `renew_deadline` window, and reports leadership
//! changes through [`LeaderCallbacks`]. Callbacks are delivered in order by a
//! single dispatcher task; `on_started_leading` runs detached with a token
//! that is cancelled when leadership ends.

use crate::common::{jitter, CancelToken, Error, Result, JITTER_FACTOR};
use crate::election::lock::{DistributedLock, LeaseRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Lease granted when a leader gives the lease up voluntarily.
const RELEASED_LEASE: Duration = Duration::from_secs(1);

/// Check the timing relation every elector relies on:
/// `lease_duration > renew_deadline > retry_period * 1.2 > 0`.
pub fn validate_timing(
    lease_duration: Duration,
    renew_deadline: Duration,
    retry_period: Duration,
) -> Result<()> {
    if lease_duration.is_zero() {
        return Err(Error::InvalidConfig("lease duration must be positive".into()));
    }
    if renew_deadline.is_zero() {
        return Err(Error::InvalidConfig("renew deadline must be positive".into()));
    }
    if retry_period.is_zero() {
        return Err(Error::InvalidConfig("retry period must be positive".into()));
    }
    if lease_duration <= renew_deadline {
        return Err(Error::InvalidConfig(format!(
            "lease duration {:?} must be greater than renew deadline {:?}",
            lease_duration, renew_deadline
        )));
    }
    if renew_deadline.as_secs_f64() <= JITTER_FACTOR * retry_period.as_secs_f64() {
        return Err(Error::InvalidConfig(format!(
            "renew deadline {:?} must be greater than retry period {:?} x {}",
            renew_deadline, retry_period, JITTER_FACTOR
        )));
    }
    Ok(())
}

/// Leadership lifecycle hooks.
#[async_trait]
pub trait LeaderCallbacks: Send + Sync {
    /// Leadership acquired. Runs detached; `leading` is cancelled when
    /// leadership ends.
    async fn on_started_leading(&self, leading: CancelToken);

    /// Leadership lost or given up.
    async fn on_stopped_leading(&self);

    /// A different holder was observed (fires once per transition).
    async fn on_new_leader(&self, _identity: &str) {}

    /// `run` is about to return.
    async fn on_stop_running(&self) {}
}

/// Election settings. `lock` and `callbacks` are optional so that a missing
/// collaborator is reported as a configuration error instead of a panic.
#[derive(Clone)]
pub struct LeaderElectionConfig {
    pub name: String,
    pub lock: Option<Arc<dyn DistributedLock>>,
    pub callbacks: Option<Arc<dyn LeaderCallbacks>>,
    pub lease_duration: Duration,
    pub renew_deadline: Duration,
    pub retry_period: Duration,
    pub release_on_cancel: bool,
}

impl LeaderElectionConfig {
    pub fn new(
        name: impl Into<String>,
        lock: Arc<dyn DistributedLock>,
        callbacks: Arc<dyn LeaderCallbacks>,
    ) -> Self {
        Self {
            name: name.into(),
            lock: Some(lock),
            callbacks: Some(callbacks),
            lease_duration: Duration::from_secs(15),
            renew_deadline: Duration::from_secs(10),
            retry_period: Duration::from_secs(2),
            release_on_cancel: false,
        }
    }

    pub fn with_timing(
        mut self,
        lease_duration: Duration,
        renew_deadline: Duration,
        retry_period: Duration,
    ) -> Self {
        self.lease_duration = lease_duration;
        self.renew_deadline = renew_deadline;
        self.retry_period = retry_period;
        self
    }

    pub fn with_release_on_cancel(mut self, release: bool) -> Self {
        self.release_on_cancel = release;
        self
    }
}

/// Where an elector is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionState {
    Idle,
    Acquiring,
    Leading,
    Renewing,
    Released,
    Lost,
}

impl std::fmt::Display for ElectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ElectionState::Idle => write!(f, "idle"),
            ElectionState::Acquiring => write!(f, "acquiring"),
            ElectionState::Leading => write!(f, "leading"),
            ElectionState::Renewing => write!(f, "renewing"),
            ElectionState::Released => write!(f, "released"),
            ElectionState::Lost => write!(f, "lost"),
        }
    }
}

enum ElectorEvent {
    StartedLeading(CancelToken),
    StoppedLeading,
    NewLeader(String),
    StopRunning,
}

enum RenewOutcome {
    Lost,
    Cancelled,
}

/// Last record this elector saw, and when.
#[derive(Debug, Default)]
struct Observed {
    record: LeaseRecord,
    raw: Vec<u8>,
    observed_time: DateTime<Utc>,
    reported_leader: String,
}

pub struct LeaderElector {
    name: String,
    lock: Arc<dyn DistributedLock>,
    callbacks: Arc<dyn LeaderCallbacks>,
    lease_duration: Duration,
    renew_deadline: Duration,
    retry_period: Duration,
    release_on_cancel: bool,
    observed: Mutex<Observed>,
    state: Mutex<ElectionState>,
    events: mpsc::UnboundedSender<ElectorEvent>,
    pending_events: Mutex<Option<mpsc::UnboundedReceiver<ElectorEvent>>>,
}

impl std::fmt::Debug for LeaderElector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaderElector")
            .field("name", &self.name)
            .field("lock", &self.lock.describe())
            .field("state", &self.state())
            .finish()
    }
}

impl LeaderElector {
    /// Validate `config` and build an elector. Nothing is retried here.
    pub fn new(config: LeaderElectionConfig) -> Result<Self> {
        validate_timing(
            config.lease_duration,
            config.renew_deadline,
            config.retry_period,
        )?;
        let lock = config
            .lock
            .ok_or_else(|| Error::InvalidConfig("lock must not be empty".into()))?;
        let callbacks = config
            .callbacks
            .ok_or_else(|| Error::InvalidConfig("leader callbacks must be set".into()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        Ok(Self {
            name: config.name,
            lock,
            callbacks,
            lease_duration: config.lease_duration,
            renew_deadline: config.renew_deadline,
            retry_period: config.retry_period,
            release_on_cancel: config.release_on_cancel,
            observed: Mutex::new(Observed::default()),
            state: Mutex::new(ElectionState::Idle),
            events: tx,
            pending_events: Mutex::new(Some(rx)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn identity(&self) -> &str {
        self.lock.identity()
    }

    pub fn state(&self) -> ElectionState {
        *self.state.lock()
    }

    /// True while this elector holds an unexpired lease, as far as the local
    /// cache knows. Never touches the network.
    pub fn is_leader(&self) -> bool {
        let obs = self.observed.lock();
        obs.record.holder_identity == self.identity()
            && Utc::now() < obs.observed_time + self.lease_chrono()
    }

    /// Holder identity from the local cache (empty when unknown).
    pub fn get_leader(&self) -> String {
        self.observed.lock().record.holder_identity.clone()
    }

    /// Transition counter of the last observed record.
    pub fn leader_transitions(&self) -> u64 {
        self.observed.lock().record.leader_transitions
    }

    /// Liveness probe: fails only when this node is the recorded leader and
    /// has not renewed for longer than `lease_duration + tolerance`.
    pub fn check(&self, tolerance: Duration) -> Result<()> {
        let obs = self.observed.lock();
        if obs.record.holder_identity != self.identity() {
            return Ok(());
        }
        let since = (Utc::now() - obs.observed_time)
            .to_std()
            .unwrap_or_default();
        if since > self.lease_duration + tolerance {
            return Err(Error::LeaderStale(since));
        }
        Ok(())
    }

    /// Contend once: acquire, hold until the lease is lost or `cancel`
    /// fires, then return. Callers that want to keep contending use
    /// [`LeaderElector::run_forever`].
    pub async fn run(&self, cancel: &CancelToken) {
        self.ensure_dispatcher();
        self.set_state(ElectionState::Acquiring);

        if !self.acquire(cancel).await {
            self.set_state(ElectionState::Idle);
            self.dispatch(ElectorEvent::StopRunning);
            return;
        }

        self.lock.record_event("became leader");
        let leading = cancel.child();
        self.dispatch(ElectorEvent::StartedLeading(leading.clone()));
        self.set_state(ElectionState::Leading);

        let outcome = self.renew(cancel).await;

        leading.cancel();
        self.dispatch(ElectorEvent::StoppedLeading);
        self.lock.record_event("stopped leading");

        if self.release_on_cancel {
            self.release().await;
        }
        self.set_state(match outcome {
            RenewOutcome::Lost => ElectionState::Lost,
            RenewOutcome::Cancelled => ElectionState::Released,
        });
        self.dispatch(ElectorEvent::StopRunning);
    }

    /// Keep contending until `cancel` fires.
    pub async fn run_forever(&self, cancel: &CancelToken) {
        while !cancel.is_cancelled() {
            self.run(cancel).await;
            if !cancel.is_cancelled() {
                info!(lock = %self.lock.describe(), "re-entering election");
            }
        }
        self.set_state(ElectionState::Idle);
    }

    /// Retry until the lease is ours. Returns false if cancelled first.
    async fn acquire(&self, cancel: &CancelToken) -> bool {
        let desc = self.lock.describe();
        info!(lock = %desc, identity = %self.identity(), "attempting to acquire leader lease");
        loop {
            if cancel.is_cancelled() {
                return false;
            }
            if self.try_acquire_or_renew().await {
                info!(lock = %desc, identity = %self.identity(), "acquired lease");
                return true;
            }
            debug!(lock = %desc, "failed to acquire lease");
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(jitter(self.retry_period, JITTER_FACTOR)) => {}
            }
        }
    }

    /// Renew every retry period; give up when no attempt succeeds within
    /// `renew_deadline`. An attempt started inside the window is always
    /// finished, so a committed write is never dropped before it is cached.
    async fn renew(&self, cancel: &CancelToken) -> RenewOutcome {
        loop {
            self.set_state(ElectionState::Renewing);
            let deadline = Instant::now() + self.renew_deadline;
            let renewed = loop {
                if cancel.is_cancelled() {
                    return RenewOutcome::Cancelled;
                }
                if self.try_acquire_or_renew().await {
                    break true;
                }
                if Instant::now() >= deadline {
                    break false;
                }
                tokio::select! {
                    _ = cancel.cancelled() => return RenewOutcome::Cancelled,
                    _ = tokio::time::sleep_until(
                        std::cmp::min(Instant::now() + self.retry_period, deadline)
                    ) => {}
                }
                if Instant::now() >= deadline {
                    break false;
                }
            };

            if !renewed {
                warn!(lock = %self.lock.describe(), "failed to renew lease: leadership lost");
                return RenewOutcome::Lost;
            }
            self.set_state(ElectionState::Leading);

            tokio::select! {
                _ = cancel.cancelled() => return RenewOutcome::Cancelled,
                _ = tokio::time::sleep(self.retry_period) => {}
            }
        }
    }

    /// One acquisition/renewal attempt. Every lock call is bounded by
    /// `renew_deadline`; any failure just fails the attempt.
    pub async fn try_acquire_or_renew(&self) -> bool {
        self.ensure_dispatcher();
        let now = Utc::now();
        let mut desired = LeaseRecord {
            holder_identity: self.identity().to_string(),
            lease_duration_ms: self.lease_duration.as_millis() as u64,
            acquire_time: now,
            renew_time: now,
            leader_transitions: 0,
        };

        let (old, raw) = match self.bounded(self.lock.get()).await {
            Ok(found) => found,
            Err(Error::LeaseNotFound(_)) => {
                return match self.bounded(self.lock.create(&desired)).await {
                    Ok(()) => {
                        self.set_observed(desired);
                        true
                    }
                    Err(e) => {
                        warn!(lock = %self.lock.describe(), "error initially creating lease: {}", e);
                        false
                    }
                };
            }
            Err(e) => {
                warn!(lock = %self.lock.describe(), "error retrieving lease: {}", e);
                return false;
            }
        };

        {
            let mut obs = self.observed.lock();
            if obs.raw != raw {
                obs.record = old.clone();
                obs.raw = raw;
                obs.observed_time = now;
            }
        }
        self.report_transition();

        if old.is_held() && old.holder_identity != self.identity() && old.expires_at() > now {
            debug!(
                lock = %self.lock.describe(),
                holder = %old.holder_identity,
                "lease is held and has not yet expired"
            );
            return false;
        }

        if old.holder_identity == self.identity() {
            desired.acquire_time = old.acquire_time;
            desired.leader_transitions = old.leader_transitions;
        } else {
            desired.leader_transitions = old.leader_transitions + 1;
        }

        if let Err(e) = self.bounded(self.lock.update(&desired)).await {
            warn!(lock = %self.lock.describe(), "failed to update lease: {}", e);
            return false;
        }
        self.set_observed(desired);
        true
    }

    /// Give the lease up if we hold it. Returns true when released.
    pub async fn release(&self) -> bool {
        let transitions = {
            let obs = self.observed.lock();
            if obs.record.holder_identity != self.identity() {
                return false;
            }
            obs.record.leader_transitions
        };
        let now = Utc::now();
        let released = LeaseRecord {
            holder_identity: String::new(),
            lease_duration_ms: RELEASED_LEASE.as_millis() as u64,
            acquire_time: now,
            renew_time: now,
            leader_transitions: transitions,
        };
        match self.bounded(self.lock.update(&released)).await {
            Ok(()) => {
                info!(lock = %self.lock.describe(), "released lease");
                self.set_observed(released);
                true
            }
            Err(e) => {
                warn!(lock = %self.lock.describe(), "failed to release lease: {}", e);
                false
            }
        }
    }

    async fn bounded<T>(&self, op: impl std::future::Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.renew_deadline, op)
            .await
            .map_err(|_| Error::Timeout(format!("{} call", self.lock.describe())))?
    }

    /// Cache a record we wrote ourselves. Its renew time doubles as the
    /// observation time so that our own expiry matches what others compute.
    fn set_observed(&self, record: LeaseRecord) {
        {
            let mut obs = self.observed.lock();
            obs.raw = record.encode().unwrap_or_default();
            obs.observed_time = record.renew_time;
            obs.record = record;
        }
        self.report_transition();
    }

    fn report_transition(&self) {
        let holder = {
            let mut obs = self.observed.lock();
            if obs.record.holder_identity == obs.reported_leader {
                return;
            }
            obs.reported_leader = obs.record.holder_identity.clone();
            obs.reported_leader.clone()
        };
        if !holder.is_empty() {
            self.dispatch(ElectorEvent::NewLeader(holder));
        }
    }

    fn set_state(&self, state: ElectionState) {
        let mut current = self.state.lock();
        if *current != state {
            debug!(lock = %self.lock.describe(), from = %*current, to = %state, "election state");
            *current = state;
        }
    }

    fn dispatch(&self, event: ElectorEvent) {
        // the dispatcher only goes away with the elector itself
        let _ = self.events.send(event);
    }

    fn ensure_dispatcher(&self) {
        let Some(mut rx) = self.pending_events.lock().take() else {
            return;
        };
        let callbacks = Arc::clone(&self.callbacks);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    ElectorEvent::StartedLeading(token) => {
                        let callbacks = Arc::clone(&callbacks);
                        tokio::spawn(async move { callbacks.on_started_leading(token).await });
                    }
                    ElectorEvent::StoppedLeading => callbacks.on_stopped_leading().await,
                    ElectorEvent::NewLeader(identity) => callbacks.on_new_leader(&identity).await,
                    ElectorEvent::StopRunning => callbacks.on_stop_running().await,
                }
            }
        });
    }

    fn lease_chrono(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.lease_duration.as_millis() as i64)
    }
}
