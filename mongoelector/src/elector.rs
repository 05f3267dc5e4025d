//! Single-leader election on top of [`DistLock`].
//!
//! Every [`LeaderElector`] contending for the same key runs one background
//! worker that polls the lock: followers attempt a non-blocking acquire,
//! the leader renews its lease, and user callbacks fire on the transitions.
//! Each instance also publishes a status document every cycle, so any peer
//! can aggregate a live view of the whole cluster.
//!
//! ```rust,ignore
//! let store = Arc::new(MongoStore::new(client.database("coordination")));
//! store.ensure_indexes().await?;
//!
//! let elector = LeaderElector::builder("svc")
//!     .ttl(15)
//!     .on_leader(|| println!("promoted"))
//!     .on_leader_loss(|| println!("demoted"))
//!     .build(store)?;
//! elector.start()?;
//!
//! // Gate leader-only work on the published state.
//! if elector.is_leader() {
//!     // ...
//! }
//!
//! // Or watch transitions and drive your own machinery.
//! let mut state = elector.state_watch();
//! while state.changed().await.is_ok() {
//!     match *state.borrow() {
//!         ElectorState::Leader => { /* leader tasks */ }
//!         _ => { /* stand down */ }
//!     }
//! }
//! ```
//!
//! The poll interval is derived as `max(1s, ttl / 3)`: the election stays
//! safe as long as one interval is under half the TTL, and the factor of
//! three leaves margin for a transient store hiccup. A single failed renewal
//! therefore never flaps the leader; two consecutive failures do.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::distlock::{local_hostname, AcquireOptions, DistLock, LockOptions, Touch};
use crate::error::Error;
use crate::store::{CoordinationStore, NodeStatusDocument};

/// A state-transition callback. Runs on the worker, serialised with every
/// other callback of the same elector.
pub type Hook = Arc<dyn Fn() + Send + Sync>;

/// Where an elector's state machine currently sits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElectorState {
    /// Constructed, worker not yet polling.
    Starting,
    /// Contending: attempts a non-blocking acquire every poll.
    Follower,
    /// Holding the lease: renews it every poll.
    Leader,
    /// Stop requested; releasing leadership and cleaning up.
    Stopping,
    /// Terminal.
    Stopped,
}

impl ElectorState {
    /// Wire name of the state, as stored in status documents.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Follower => "follower",
            Self::Leader => "leader",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        }
    }

    /// Check if currently in `Leader` state.
    #[must_use]
    pub fn is_leader(&self) -> bool {
        matches!(self, Self::Leader)
    }
}

/// Configuration for a [`LeaderElector`], validated by
/// [`build`](ElectorBuilder::build).
pub struct ElectorBuilder {
    /// The name shared by every instance contending for this leadership.
    pub key: String,
    /// Lease TTL in whole seconds. Must be at least 2; defaults to 15.
    pub ttl: u64,
    /// Fired exactly once per acquisition, before `is_leader` flips true.
    pub on_leader: Option<Hook>,
    /// Fired exactly once per loss, including the loss implied by `stop`.
    pub on_leader_loss: Option<Hook>,
    /// Fired at the end of every poll cycle regardless of state.
    pub on_loop: Option<Hook>,
    /// Free-form version string published in the status document.
    pub app_version: Option<String>,
    /// Publish a status document every cycle and delete it on clean stop.
    pub report_status: bool,
}

impl ElectorBuilder {
    /// Builder for an election on `key` with the documented defaults.
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ttl: 15,
            on_leader: None,
            on_leader_loss: None,
            on_loop: None,
            app_version: None,
            report_status: true,
        }
    }

    /// Override the lease TTL in seconds.
    #[must_use]
    pub fn ttl(mut self, secs: u64) -> Self {
        self.ttl = secs;
        self
    }

    /// Callback fired on promotion to leader.
    #[must_use]
    pub fn on_leader(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_leader = Some(Arc::new(hook));
        self
    }

    /// Callback fired on leadership loss.
    #[must_use]
    pub fn on_leader_loss(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_leader_loss = Some(Arc::new(hook));
        self
    }

    /// Callback fired after every poll cycle.
    #[must_use]
    pub fn on_loop(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_loop = Some(Arc::new(hook));
        self
    }

    /// Version string to publish in this node's status document.
    #[must_use]
    pub fn app_version(mut self, version: impl Into<String>) -> Self {
        self.app_version = Some(version.into());
        self
    }

    /// Enable or disable status publication.
    #[must_use]
    pub fn report_status(mut self, enabled: bool) -> Self {
        self.report_status = enabled;
        self
    }

    /// Validate the configuration and construct the elector.
    ///
    /// # Errors
    /// [`Error::InvalidConfiguration`] when the key is empty or the TTL is
    /// under two seconds. Configuration problems never surface later.
    pub fn build(self, store: Arc<dyn CoordinationStore>) -> Result<LeaderElector, Error> {
        if self.key.is_empty() {
            return Err(Error::InvalidConfiguration(
                "election key may not be empty".into(),
            ));
        }
        if self.ttl < 2 {
            return Err(Error::InvalidConfiguration(
                "election ttl must be at least 2 seconds".into(),
            ));
        }
        let lock = DistLock::new(
            Arc::clone(&store),
            LockOptions::new(self.key.clone()).ttl(self.ttl),
        )?;
        let poll_interval = Duration::from_secs((self.ttl / 3).max(1));
        let owner_id = Uuid::new_v4();
        let (state_tx, _) = watch::channel(ElectorState::Starting);

        let inner = Inner {
            key: self.key,
            poll_interval,
            app_version: self.app_version,
            report_status: self.report_status,
            on_leader: self.on_leader,
            on_leader_loss: self.on_leader_loss,
            on_loop: self.on_loop,
            store,
            owner_id,
            host: local_hostname(),
            pid: std::process::id(),
            driver: AsyncMutex::new(Driver {
                lock,
                state: ElectorState::Starting,
                acquire_failures: 0,
                status_failures: 0,
            }),
            state_tx,
            shared: RwLock::new(Shared {
                node_status: None,
                cluster: Vec::new(),
            }),
            cancel: CancellationToken::new(),
            worker: parking_lot::Mutex::new(None),
            worker_active: AtomicBool::new(false),
        };
        let inner = Arc::new(inner);
        inner.shared.write().node_status = Some(inner.status_doc(ElectorState::Starting));
        Ok(LeaderElector { inner })
    }
}

/// Mutable election state. Owned by the background worker while it runs,
/// by whichever caller drives [`poll`](LeaderElector::poll) otherwise.
struct Driver {
    lock: DistLock,
    state: ElectorState,
    acquire_failures: u32,
    status_failures: u32,
}

/// Snapshots published for the property accessors, rebuilt every cycle.
struct Shared {
    node_status: Option<NodeStatusDocument>,
    cluster: Vec<NodeStatusDocument>,
}

struct Inner {
    key: String,
    poll_interval: Duration,
    app_version: Option<String>,
    report_status: bool,
    on_leader: Option<Hook>,
    on_leader_loss: Option<Hook>,
    on_loop: Option<Hook>,
    store: Arc<dyn CoordinationStore>,
    owner_id: Uuid,
    host: String,
    pid: u32,
    driver: AsyncMutex<Driver>,
    state_tx: watch::Sender<ElectorState>,
    shared: RwLock<Shared>,
    cancel: CancellationToken,
    worker: parking_lot::Mutex<Option<JoinHandle<()>>>,
    worker_active: AtomicBool,
}

impl Inner {
    fn publish_state(&self, state: ElectorState) {
        self.state_tx.send_replace(state);
    }

    /// Run a user callback, shielding the state machine from its panics.
    fn fire(&self, hook: Option<&Hook>, name: &'static str) {
        let Some(hook) = hook else { return };
        if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| (**hook)())).is_err() {
            tracing::error!(
                key = %self.key,
                callback = name,
                "callback panicked; election state unaffected"
            );
        }
    }

    fn status_doc(&self, state: ElectorState) -> NodeStatusDocument {
        NodeStatusDocument {
            election_key: self.key.clone(),
            owner_id: self.owner_id,
            host: self.host.clone(),
            pid: self.pid,
            app_version: self.app_version.clone(),
            is_leader: state.is_leader(),
            // placeholder until the store stamps its own clock on upsert
            ts_heartbeat: Utc::now(),
            state,
        }
    }

    /// One poll cycle: contend or renew, then publish status. Used by both
    /// the background worker and manual [`LeaderElector::poll`].
    async fn cycle(&self, d: &mut Driver) {
        if d.state == ElectorState::Starting {
            d.state = ElectorState::Follower;
            self.publish_state(ElectorState::Follower);
        }
        match d.state {
            ElectorState::Follower => {
                match d.lock.acquire(AcquireOptions::default().non_blocking()).await {
                    Ok(_) => {
                        tracing::info!(key = %self.key, "leadership acquired");
                        d.acquire_failures = 0;
                        self.fire(self.on_leader.as_ref(), "on_leader");
                        d.state = ElectorState::Leader;
                        self.publish_state(ElectorState::Leader);
                    }
                    Err(Error::LockExists { .. }) => {
                        d.acquire_failures = 0;
                    }
                    Err(Error::StoreUnavailable(err)) => {
                        // an unreachable store keeps a follower a follower
                        d.acquire_failures += 1;
                        tracing::warn!(
                            key = %self.key,
                            error = %err,
                            consecutive = d.acquire_failures,
                            "store unavailable during acquire attempt"
                        );
                    }
                    Err(err) => {
                        tracing::warn!(key = %self.key, error = %err, "acquire attempt failed");
                    }
                }
            }
            ElectorState::Leader => match d.lock.touch().await {
                Touch::Renewed { ts_expire } => {
                    tracing::debug!(key = %self.key, %ts_expire, "lease renewed");
                }
                Touch::Deferred { ts_expire } => {
                    tracing::debug!(key = %self.key, %ts_expire, "renewal deferred, still leader");
                }
                Touch::Lost => {
                    tracing::warn!(key = %self.key, "leadership lost");
                    self.fire(self.on_leader_loss.as_ref(), "on_leader_loss");
                    d.state = ElectorState::Follower;
                    self.publish_state(ElectorState::Follower);
                }
            },
            _ => return,
        }
        self.refresh_status(d).await;
        self.fire(self.on_loop.as_ref(), "on_loop");
    }

    async fn refresh_status(&self, d: &mut Driver) {
        let status = self.status_doc(d.state);
        if self.report_status {
            match self.store.upsert_status(&status).await {
                Ok(()) => d.status_failures = 0,
                Err(err) => {
                    d.status_failures += 1;
                    tracing::warn!(
                        key = %self.key,
                        error = %err,
                        consecutive = d.status_failures,
                        "status publication failed"
                    );
                }
            }
        }
        let cluster = match self.store.list_statuses(&self.key).await {
            Ok(rows) => Some(rows),
            Err(err) => {
                tracing::debug!(key = %self.key, error = %err, "cluster status read failed");
                None
            }
        };
        let mut shared = self.shared.write();
        shared.node_status = Some(status);
        if let Some(rows) = cluster {
            shared.cluster = rows;
        }
    }

    /// Leader back to follower: best-effort lease delete, then the loss
    /// callback, then the observable state flip, in that order.
    async fn demote(&self, d: &mut Driver) {
        if let Err(err) = d.lock.release(false).await {
            tracing::warn!(
                key = %self.key,
                error = %err,
                "failed to delete lease during demotion, leaving it to expire"
            );
        }
        self.fire(self.on_leader_loss.as_ref(), "on_leader_loss");
        d.state = ElectorState::Follower;
        self.publish_state(ElectorState::Follower);
    }

    async fn shutdown(&self, d: &mut Driver) {
        let was_leader = d.state.is_leader();
        d.state = ElectorState::Stopping;
        self.publish_state(ElectorState::Stopping);

        if was_leader {
            // bounded: a wedged store must not hold up process shutdown
            let deadline = 2 * self.poll_interval;
            match tokio::time::timeout(deadline, d.lock.release(false)).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    tracing::warn!(
                        key = %self.key,
                        error = %err,
                        "lease delete failed during stop, leaving it to expire"
                    );
                }
                Err(_) => {
                    tracing::warn!(
                        key = %self.key,
                        "lease release ran past its deadline, leaving it to expire"
                    );
                }
            }
            self.fire(self.on_leader_loss.as_ref(), "on_leader_loss");
        }

        if self.report_status {
            let delete = self.store.delete_status(&self.key, self.owner_id);
            match tokio::time::timeout(self.poll_interval, delete).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    tracing::warn!(key = %self.key, error = %err, "status delete failed during stop");
                }
                Err(_) => {
                    tracing::warn!(key = %self.key, "status delete ran past its deadline");
                }
            }
        }

        d.state = ElectorState::Stopped;
        self.shared.write().node_status = Some(self.status_doc(ElectorState::Stopped));
        self.publish_state(ElectorState::Stopped);
        tracing::info!(key = %self.key, "elector stopped");
    }

    async fn run_worker(self: Arc<Self>) {
        tracing::info!(key = %self.key, "election worker started");
        loop {
            {
                let mut d = self.driver.lock().await;
                if !self.cancel.is_cancelled() {
                    self.cycle(&mut d).await;
                }
            }
            if self.cancel.is_cancelled() {
                break;
            }
            tokio::select! {
                () = self.cancel.cancelled() => break,
                () = tokio::time::sleep(self.poll_interval) => {}
            }
        }
        {
            let mut d = self.driver.lock().await;
            self.shutdown(&mut d).await;
        }
        self.worker_active.store(false, Ordering::Release);
        tracing::info!(key = %self.key, "election worker terminated");
    }
}

/// A long-lived leader-election coordinator for one key.
///
/// Cheap to clone; clones share the same election instance, which is how a
/// callback can keep a handle around to schedule a [`stop`](Self::stop)
/// from a spawned task. Callbacks themselves are synchronous and therefore
/// cannot await `stop` in place; the self-deadlock the protocol forbids is
/// unrepresentable.
#[derive(Clone)]
pub struct LeaderElector {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for LeaderElector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaderElector")
            .field("key", &self.inner.key)
            .field("poll_interval", &self.inner.poll_interval)
            .field("app_version", &self.inner.app_version)
            .field("report_status", &self.inner.report_status)
            .field("owner_id", &self.inner.owner_id)
            .field("host", &self.inner.host)
            .field("pid", &self.inner.pid)
            .finish()
    }
}

impl LeaderElector {
    /// Start configuring an election for `key`.
    #[must_use]
    pub fn builder(key: impl Into<String>) -> ElectorBuilder {
        ElectorBuilder::new(key)
    }

    /// The election key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.inner.key
    }

    /// This instance's stable identity, as published in status documents.
    #[must_use]
    pub fn owner_id(&self) -> Uuid {
        self.inner.owner_id
    }

    /// Derived worker cadence: `max(1s, ttl / 3)`.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        self.inner.poll_interval
    }

    /// Launch the background worker. A no-op while already running.
    ///
    /// Must be called within a Tokio runtime.
    ///
    /// # Errors
    /// [`Error::ElectorStopped`] once the elector has terminally stopped.
    pub fn start(&self) -> Result<(), Error> {
        if self.inner.cancel.is_cancelled() {
            return Err(Error::ElectorStopped);
        }
        let mut worker = self.inner.worker.lock();
        if worker.is_some() {
            tracing::debug!(key = %self.inner.key, "elector already running");
            return Ok(());
        }
        self.inner.worker_active.store(true, Ordering::Release);
        *worker = Some(tokio::spawn(Arc::clone(&self.inner).run_worker()));
        Ok(())
    }

    /// Start the worker and only return once the elector has fully stopped
    /// (via [`stop`](Self::stop) from another task or a callback-scheduled
    /// stop).
    ///
    /// # Errors
    /// [`Error::ElectorStopped`] once the elector has terminally stopped.
    pub async fn run(&self) -> Result<(), Error> {
        self.start()?;
        let mut state = self.inner.state_tx.subscribe();
        loop {
            let current = *state.borrow_and_update();
            if current == ElectorState::Stopped {
                return Ok(());
            }
            if state.changed().await.is_err() {
                return Ok(());
            }
        }
    }

    /// Request termination and wait for the worker to reach `stopped`.
    ///
    /// The worker finishes any in-flight poll first; if it held leadership,
    /// release is attempted with a `2 × poll_interval` deadline, after which
    /// the lease is simply left to expire. Safe to call repeatedly and from
    /// multiple tasks.
    pub async fn stop(&self) {
        self.inner.cancel.cancel();
        let handle = self.inner.worker.lock().take();
        if let Some(handle) = handle {
            if handle.await.is_err() {
                tracing::error!(key = %self.inner.key, "election worker panicked during stop");
            }
        }
        // covers the never-started and panicked-worker paths
        let mut d = self.inner.driver.lock().await;
        if d.state != ElectorState::Stopped {
            self.inner.shutdown(&mut d).await;
        }
        self.inner.worker_active.store(false, Ordering::Release);
    }

    /// Execute one poll cycle synchronously, with the same transitions and
    /// callbacks the background worker would produce. Intended for tests.
    ///
    /// # Errors
    /// [`Error::ElectorRunning`] while the background worker is live;
    /// [`Error::ElectorStopped`] after terminal stop.
    pub async fn poll(&self) -> Result<(), Error> {
        if self.inner.worker_active.load(Ordering::Acquire) {
            return Err(Error::ElectorRunning);
        }
        if self.inner.cancel.is_cancelled() {
            return Err(Error::ElectorStopped);
        }
        let mut d = self.inner.driver.lock().await;
        if d.state == ElectorState::Stopped {
            return Err(Error::ElectorStopped);
        }
        self.inner.cycle(&mut d).await;
        Ok(())
    }

    /// Relinquish leadership now, firing `on_leader_loss`, while staying in
    /// the election. Absent other contenders this node typically regains
    /// the key on its next poll. A no-op when not leading.
    pub async fn release(&self) {
        let mut d = self.inner.driver.lock().await;
        if d.state.is_leader() {
            tracing::info!(key = %self.inner.key, "relinquishing leadership on request");
            self.inner.demote(&mut d).await;
        }
    }

    /// Current state-machine position.
    #[must_use]
    pub fn state(&self) -> ElectorState {
        *self.inner.state_tx.borrow()
    }

    /// Whether this instance currently leads. Once this reads `true`, the
    /// `on_leader` callback for that acquisition has already returned.
    #[must_use]
    pub fn is_leader(&self) -> bool {
        self.state().is_leader()
    }

    /// Whether the background worker is live.
    #[must_use]
    pub fn running(&self) -> bool {
        self.inner.worker_active.load(Ordering::Acquire)
    }

    /// Watch every state transition, e.g. to gate leader-only components.
    #[must_use]
    pub fn state_watch(&self) -> watch::Receiver<ElectorState> {
        self.inner.state_tx.subscribe()
    }

    /// This node's latest status document, as last published.
    #[must_use]
    pub fn node_status(&self) -> Option<NodeStatusDocument> {
        self.inner.shared.read().node_status.clone()
    }

    /// Snapshot of every contender's status document, rebuilt each poll.
    #[must_use]
    pub fn cluster_detail(&self) -> Vec<NodeStatusDocument> {
        self.inner.shared.read().cluster.clone()
    }

    /// The status entry currently flagged leader, if the snapshot has one.
    #[must_use]
    pub fn leader_node(&self) -> Option<NodeStatusDocument> {
        self.inner
            .shared
            .read()
            .cluster
            .iter()
            .find(|node| node.is_leader)
            .cloned()
    }

    /// Whether a live lease exists for the key, held by anyone. Reads the
    /// store directly rather than any cached state.
    ///
    /// # Errors
    /// [`Error::StoreUnavailable`] on transport failure.
    pub async fn leader_exists(&self) -> Result<bool, Error> {
        match self.inner.store.find(&self.inner.key).await? {
            Some(doc) => Ok(doc.ts_expire > self.inner.store.server_now().await?),
            None => Ok(false),
        }
    }
}
