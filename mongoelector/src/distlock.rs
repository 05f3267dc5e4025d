//! Distributed mutually-exclusive leases.
//!
//! A [`DistLock`] is one actor contending for a named key. Whoever installs
//! the lock document owns the key until `ts_expire` passes on the *store*
//! clock; an owner that keeps [`touch`](DistLock::touch)-ing keeps the key,
//! an owner that goes silent is stolen from. The instance itself is
//! stateless between calls apart from the in-memory record of the lease it
//! last installed.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::runtime::Handle;
use uuid::Uuid;

use crate::error::Error;
use crate::store::{CasOutcome, CoordinationStore, LockDocument, StoreError};

/// Lock construction parameters. `key` is required; everything else has the
/// documented default.
#[derive(Debug, Clone)]
pub struct LockOptions {
    /// The lock name.
    pub key: String,
    /// Declared lease length in whole seconds. Must be at least 1.
    pub ttl: u64,
    /// Refuse to acquire when the host clock has drifted too far from the
    /// store clock.
    pub time_paranoid: bool,
    /// Drift tolerance for the paranoia check.
    pub max_offset: Duration,
}

impl LockOptions {
    /// Options for `key` with a 600s TTL and a paranoid 500ms drift bound.
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ttl: 600,
            time_paranoid: true,
            max_offset: Duration::from_millis(500),
        }
    }

    /// Override the lease TTL in seconds.
    #[must_use]
    pub fn ttl(mut self, secs: u64) -> Self {
        self.ttl = secs;
        self
    }

    /// Enable or disable the clock-drift check on acquire.
    #[must_use]
    pub fn time_paranoid(mut self, enabled: bool) -> Self {
        self.time_paranoid = enabled;
        self
    }

    /// Override the tolerated clock drift.
    #[must_use]
    pub fn max_offset(mut self, max: Duration) -> Self {
        self.max_offset = max;
        self
    }
}

/// Per-call acquire behavior.
#[derive(Debug, Clone, Copy)]
pub struct AcquireOptions {
    /// Poll until the key is won (or `timeout` passes) instead of failing
    /// fast with [`Error::LockExists`].
    pub blocking: bool,
    /// Give up after this long when `blocking`.
    pub timeout: Option<Duration>,
    /// Sleep between acquisition attempts when `blocking`.
    pub step: Duration,
    /// Administrative override: evict whoever holds the key first.
    pub force: bool,
}

impl Default for AcquireOptions {
    fn default() -> Self {
        Self {
            blocking: true,
            timeout: None,
            step: Duration::from_millis(250),
            force: false,
        }
    }
}

impl AcquireOptions {
    /// Fail fast with [`Error::LockExists`] instead of polling.
    #[must_use]
    pub fn non_blocking(mut self) -> Self {
        self.blocking = false;
        self
    }

    /// Bound how long a blocking acquire polls.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Override the poll sleep.
    #[must_use]
    pub fn step(mut self, step: Duration) -> Self {
        self.step = step;
        self
    }

    /// Evict the current holder regardless of expiry.
    #[must_use]
    pub fn force(mut self) -> Self {
        self.force = true;
        self
    }
}

/// The lease this instance believes it holds: the fingerprint it minted and
/// the store-clock expiry it last wrote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lease {
    /// Fingerprint minted for this acquisition.
    pub owner_id: Uuid,
    /// Store-clock instant the lease lapses unless touched.
    pub ts_expire: DateTime<Utc>,
}

/// Outcome of a renewal attempt. Routine loss is a value, not an error;
/// callers must handle it either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Touch {
    /// The lease was renewed; it now lapses at `ts_expire`.
    Renewed {
        /// The freshly written store-clock expiry.
        ts_expire: DateTime<Utc>,
    },
    /// A transport blip kept the renewal from being confirmed. The lease is
    /// still presumed held until `ts_expire`; a second consecutive blip is
    /// reported as [`Touch::Lost`]. One hiccup must not flap a leader.
    Deferred {
        /// The last expiry this instance successfully wrote.
        ts_expire: DateTime<Utc>,
    },
    /// The lease is gone: stolen, released, expired and replaced, or never
    /// acquired. The in-memory record has been cleared.
    Lost,
}

impl Touch {
    /// True when the lease is no longer held.
    #[must_use]
    pub fn is_lost(&self) -> bool {
        matches!(self, Self::Lost)
    }
}

/// One actor in the distributed locking problem.
///
/// Multiple `DistLock` instances in one process are independent; nothing is
/// coordinated statically. The in-memory lease record is owned exclusively
/// by this instance and only mutated through `&mut self`.
pub struct DistLock {
    store: Arc<dyn CoordinationStore>,
    key: String,
    ttl: u64,
    time_paranoid: bool,
    max_offset: Duration,
    host: String,
    pid: u32,
    lease: Option<Lease>,
    touch_failures: u32,
}

impl std::fmt::Debug for DistLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistLock")
            .field("key", &self.key)
            .field("ttl", &self.ttl)
            .field("time_paranoid", &self.time_paranoid)
            .field("max_offset", &self.max_offset)
            .field("host", &self.host)
            .field("pid", &self.pid)
            .field("lease", &self.lease)
            .field("touch_failures", &self.touch_failures)
            .finish()
    }
}

pub(crate) fn local_hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string())
}

impl DistLock {
    /// Create a lock actor for `options.key` against `store`.
    ///
    /// # Errors
    /// [`Error::InvalidConfiguration`] when the key is empty or the TTL is
    /// below one second. Never fails later for configuration reasons.
    pub fn new(store: Arc<dyn CoordinationStore>, options: LockOptions) -> Result<Self, Error> {
        if options.key.is_empty() {
            return Err(Error::InvalidConfiguration("lock key may not be empty".into()));
        }
        if options.ttl < 1 {
            return Err(Error::InvalidConfiguration(
                "lock ttl must be at least 1 second".into(),
            ));
        }
        Ok(Self {
            store,
            key: options.key,
            ttl: options.ttl,
            time_paranoid: options.time_paranoid,
            max_offset: options.max_offset,
            host: local_hostname(),
            pid: std::process::id(),
            lease: None,
            touch_failures: 0,
        })
    }

    /// The lock name this actor contends for.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Snapshot of the lease this instance believes it holds. Purely the
    /// in-memory record; [`owned`](Self::owned) is the authoritative check.
    #[must_use]
    pub fn lease(&self) -> Option<Lease> {
        self.lease
    }

    fn ttl_delta(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.ttl).unwrap_or(i64::MAX))
    }

    async fn check_clock_offset(&self) -> Result<(), Error> {
        let server = self.store.server_now().await?;
        let offset = (server - Utc::now()).abs();
        let max = chrono::Duration::from_std(self.max_offset).unwrap_or(chrono::Duration::MAX);
        if offset > max {
            return Err(Error::ClockOffset {
                offset: offset.to_std().unwrap_or_default(),
                max: self.max_offset,
            });
        }
        Ok(())
    }

    /// Attempt to install a lock document for the key.
    ///
    /// Each iteration mints a fresh owner fingerprint, tries a conditional
    /// insert, and on collision steals the document if its expiry has passed
    /// on the store clock. Losing any conditional step is treated as a lost
    /// race, not an error.
    ///
    /// # Errors
    /// - [`Error::LockExists`] for a non-blocking call that collided;
    /// - [`Error::AcquireTimeout`] when a blocking call exhausts `timeout`;
    /// - [`Error::ClockOffset`] when paranoid and the host clock has drifted;
    /// - [`Error::StoreUnavailable`] on transport failure (callers choose
    ///   their own retry policy).
    pub async fn acquire(&mut self, options: AcquireOptions) -> Result<Lease, Error> {
        if self.time_paranoid {
            self.check_clock_offset().await?;
        }
        let started = tokio::time::Instant::now();
        loop {
            let now = self.store.server_now().await?;
            let lease = Lease {
                owner_id: Uuid::new_v4(),
                ts_expire: now + self.ttl_delta(),
            };
            let doc = LockDocument {
                key: self.key.clone(),
                owner_id: lease.owner_id,
                host: self.host.clone(),
                pid: self.pid,
                ts_created: now,
                ts_expire: lease.ts_expire,
                ttl: self.ttl,
            };

            if self.install(&doc, now, options.force).await? {
                tracing::debug!(key = %self.key, owner_id = %lease.owner_id, "lock acquired");
                self.lease = Some(lease);
                self.touch_failures = 0;
                return Ok(lease);
            }

            if !options.blocking {
                return Err(Error::LockExists {
                    key: self.key.clone(),
                });
            }
            tokio::time::sleep(options.step).await;
            if let Some(timeout) = options.timeout {
                let waited = started.elapsed();
                if waited >= timeout {
                    return Err(Error::AcquireTimeout {
                        key: self.key.clone(),
                        waited,
                    });
                }
            }
        }
    }

    /// One insert-or-steal attempt. `Ok(false)` means a live holder (or a
    /// lost steal race) and the caller should poll again.
    async fn install(
        &self,
        doc: &LockDocument,
        now: DateTime<Utc>,
        force: bool,
    ) -> Result<bool, Error> {
        if self.store.create_if_absent(doc).await? == CasOutcome::Applied {
            return Ok(true);
        }

        if force {
            tracing::warn!(key = %self.key, "force-evicting current lock holder");
            self.store.delete_any(&self.key).await?;
            return Ok(self.store.create_if_absent(doc).await? == CasOutcome::Applied);
        }

        let Some(existing) = self.store.find(&self.key).await? else {
            // holder vanished between insert and read; next poll wins
            return Ok(false);
        };
        if existing.ts_expire > now {
            return Ok(false);
        }

        // expired: steal, conditional on the document we just read
        tracing::debug!(
            key = %self.key,
            expired_owner = %existing.owner_id,
            "stealing expired lock"
        );
        if self
            .store
            .delete_if_match(&self.key, existing.owner_id)
            .await?
            == CasOutcome::Rejected
        {
            return Ok(false);
        }
        Ok(self.store.create_if_absent(doc).await? == CasOutcome::Applied)
    }

    /// Renew the lease by pushing `ts_expire` forward on the store clock.
    ///
    /// Returns [`Touch::Lost`] without raising when the lease is gone; loss
    /// is a normal outcome every caller has to handle. A never-acquired lock
    /// reports loss immediately, without a store round-trip.
    pub async fn touch(&mut self) -> Touch {
        let Some(lease) = self.lease else {
            return Touch::Lost;
        };
        match self.renew(lease.owner_id).await {
            Ok(Some(ts_expire)) => {
                self.touch_failures = 0;
                self.lease = Some(Lease {
                    owner_id: lease.owner_id,
                    ts_expire,
                });
                Touch::Renewed { ts_expire }
            }
            Ok(None) => {
                tracing::debug!(key = %self.key, "lease no longer ours");
                self.touch_failures = 0;
                self.lease = None;
                Touch::Lost
            }
            Err(err) => {
                self.touch_failures += 1;
                if self.touch_failures >= 2 {
                    tracing::warn!(
                        key = %self.key,
                        error = %err,
                        "second consecutive renewal failure, treating lease as lost"
                    );
                    self.touch_failures = 0;
                    self.lease = None;
                    Touch::Lost
                } else {
                    tracing::warn!(key = %self.key, error = %err, "renewal deferred");
                    Touch::Deferred {
                        ts_expire: lease.ts_expire,
                    }
                }
            }
        }
    }

    async fn renew(&self, owner_id: Uuid) -> Result<Option<DateTime<Utc>>, StoreError> {
        let now = self.store.server_now().await?;
        let ts_expire = now + self.ttl_delta();
        match self
            .store
            .update_expiry_if_match(&self.key, owner_id, ts_expire)
            .await?
        {
            CasOutcome::Applied => Ok(Some(ts_expire)),
            CasOutcome::Rejected => Ok(None),
        }
    }

    /// Give the key up. Deleting a document we no longer own is a no-op
    /// unless `force`, which evicts whoever holds it. The in-memory lease
    /// record is cleared either way.
    ///
    /// # Errors
    /// [`Error::StoreUnavailable`] on transport failure.
    pub async fn release(&mut self, force: bool) -> Result<(), Error> {
        let lease = self.lease.take();
        self.touch_failures = 0;
        if force {
            self.store.delete_any(&self.key).await?;
            tracing::debug!(key = %self.key, "lock force-released");
            return Ok(());
        }
        if let Some(lease) = lease {
            match self.store.delete_if_match(&self.key, lease.owner_id).await? {
                CasOutcome::Applied => tracing::debug!(key = %self.key, "lock released"),
                CasOutcome::Rejected => {
                    tracing::debug!(key = %self.key, "lock already replaced, nothing to release");
                }
            }
        }
        Ok(())
    }

    /// Whether a live (unexpired) lease exists for the key, held by anyone.
    ///
    /// # Errors
    /// [`Error::StoreUnavailable`] on transport failure.
    pub async fn locked(&self) -> Result<bool, Error> {
        match self.store.find(&self.key).await? {
            Some(doc) => Ok(doc.ts_expire > self.store.server_now().await?),
            None => Ok(false),
        }
    }

    /// Whether the key is held by *this* instance's current lease.
    ///
    /// Always re-reads the store; the in-memory fingerprint is only the
    /// comparator.
    ///
    /// # Errors
    /// [`Error::StoreUnavailable`] on transport failure.
    pub async fn owned(&self) -> Result<bool, Error> {
        let Some(lease) = self.lease else {
            return Ok(false);
        };
        match self.store.find(&self.key).await? {
            Some(doc) => {
                Ok(doc.owner_id == lease.owner_id && doc.ts_expire > self.store.server_now().await?)
            }
            None => Ok(false),
        }
    }

    /// The raw lock document, expired or not.
    ///
    /// # Errors
    /// [`Error::StoreUnavailable`] on transport failure.
    pub async fn get_current(&self) -> Result<Option<LockDocument>, Error> {
        Ok(self.store.find(&self.key).await?)
    }

    /// Scoped acquisition: acquire, run `fut`, release.
    ///
    /// Release happens on every exit path. If this future is dropped while
    /// `fut` is still running, a guard schedules a best-effort conditional
    /// delete of the lease on the runtime, so a cancelled critical section
    /// does not pin the key until expiry.
    ///
    /// # Errors
    /// Anything [`acquire`](Self::acquire) or [`release`](Self::release)
    /// reports; the future's own output is returned untouched.
    pub async fn with_lock<F: Future>(
        &mut self,
        options: AcquireOptions,
        fut: F,
    ) -> Result<F::Output, Error> {
        let lease = self.acquire(options).await?;
        let mut guard = ReleaseGuard {
            store: Arc::clone(&self.store),
            key: self.key.clone(),
            owner_id: lease.owner_id,
            armed: true,
        };
        let output = fut.await;
        guard.armed = false;
        self.release(false).await?;
        Ok(output)
    }
}

/// Schedules a conditional delete when dropped mid-flight.
struct ReleaseGuard {
    store: Arc<dyn CoordinationStore>,
    key: String,
    owner_id: Uuid,
    armed: bool,
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(handle) = Handle::try_current() else {
            return;
        };
        let store = Arc::clone(&self.store);
        let key = std::mem::take(&mut self.key);
        let owner_id = self.owner_id;
        handle.spawn(async move {
            if let Err(err) = store.delete_if_match(&key, owner_id).await {
                tracing::warn!(key = %key, error = %err, "failed to release cancelled lock");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    fn lock(store: &Arc<MemoryStore>, key: &str, ttl: u64) -> DistLock {
        let options = LockOptions::new(key).ttl(ttl).time_paranoid(false);
        DistLock::new(Arc::clone(store) as Arc<dyn CoordinationStore>, options).unwrap()
    }

    #[test]
    fn construction_rejects_bad_options() {
        let store = Arc::new(MemoryStore::new());
        let err = DistLock::new(store.clone(), LockOptions::new("k").ttl(0)).unwrap_err();
        assert!(matches!(err, Error::InvalidConfiguration(_)));
        let err = DistLock::new(store, LockOptions::new("")).unwrap_err();
        assert!(matches!(err, Error::InvalidConfiguration(_)));
    }

    #[tokio::test]
    async fn acquire_then_release_round_trip() {
        let store = Arc::new(MemoryStore::new());
        let mut lock = lock(&store, "k", 5);

        assert!(!lock.locked().await.unwrap());
        lock.acquire(AcquireOptions::default()).await.unwrap();
        assert!(lock.locked().await.unwrap());
        assert!(lock.owned().await.unwrap());

        lock.release(false).await.unwrap();
        assert!(!lock.locked().await.unwrap());
        assert!(lock.lease().is_none());

        // the key is immediately reusable
        lock.acquire(AcquireOptions::default()).await.unwrap();
        assert!(lock.owned().await.unwrap());
    }

    #[tokio::test]
    async fn non_blocking_contention_has_one_winner() {
        let store = Arc::new(MemoryStore::new());
        let mut a = lock(&store, "k", 5);
        let mut b = lock(&store, "k", 5);

        a.acquire(AcquireOptions::default().non_blocking())
            .await
            .unwrap();
        let err = b
            .acquire(AcquireOptions::default().non_blocking())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::LockExists { .. }));
        assert!(!b.owned().await.unwrap());
        assert_eq!(store.lock_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn blocking_acquire_wins_after_release() {
        let store = Arc::new(MemoryStore::new());
        let mut a = lock(&store, "k", 5);
        let mut b = lock(&store, "k", 5);

        a.acquire(AcquireOptions::default()).await.unwrap();
        let holder = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            a.release(false).await.unwrap();
        });

        let options = AcquireOptions::default().timeout(Duration::from_secs(6));
        b.acquire(options).await.unwrap();
        assert!(b.owned().await.unwrap());
        holder.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn blocking_acquire_times_out() {
        let store = Arc::new(MemoryStore::new());
        let mut a = lock(&store, "k", 60);
        let mut b = lock(&store, "k", 60);

        a.acquire(AcquireOptions::default()).await.unwrap();
        let err = b
            .acquire(AcquireOptions::default().timeout(Duration::from_secs(2)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AcquireTimeout { .. }));
        assert!(a.owned().await.unwrap());
    }

    #[tokio::test]
    async fn expired_lock_is_stolen() {
        let store = Arc::new(MemoryStore::new());
        let mut a = lock(&store, "k", 2);
        let mut b = lock(&store, "k", 2);

        a.acquire(AcquireOptions::default()).await.unwrap();
        store.advance(Duration::from_secs(3));

        b.acquire(AcquireOptions::default()).await.unwrap();
        assert!(b.owned().await.unwrap());

        // the evicted owner finds out on its next renewal
        assert!(a.touch().await.is_lost());
        assert!(a.lease().is_none());
        assert!(matches!(b.touch().await, Touch::Renewed { .. }));
    }

    #[tokio::test]
    async fn force_acquire_evicts_live_holder() {
        let store = Arc::new(MemoryStore::new());
        let mut a = lock(&store, "k", 60);
        let mut b = lock(&store, "k", 60);

        a.acquire(AcquireOptions::default()).await.unwrap();
        b.acquire(AcquireOptions::default().non_blocking().force())
            .await
            .unwrap();
        assert!(b.owned().await.unwrap());
        assert!(a.touch().await.is_lost());
    }

    #[tokio::test]
    async fn touch_without_acquire_reports_loss_without_store_calls() {
        let store = Arc::new(MemoryStore::new());
        let mut lock = lock(&store, "k", 5);
        // any store traffic would trip the injected fault
        store.fail_updates(u32::MAX);
        assert!(lock.touch().await.is_lost());
    }

    #[tokio::test]
    async fn touch_renews_expiry() {
        let store = Arc::new(MemoryStore::new());
        let mut lock = lock(&store, "k", 5);
        let lease = lock.acquire(AcquireOptions::default()).await.unwrap();

        store.advance(Duration::from_secs(2));
        match lock.touch().await {
            Touch::Renewed { ts_expire } => assert!(ts_expire > lease.ts_expire),
            other => panic!("expected renewal, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn single_transport_blip_defers_instead_of_losing() {
        let store = Arc::new(MemoryStore::new());
        let mut lock = lock(&store, "k", 5);
        let lease = lock.acquire(AcquireOptions::default()).await.unwrap();

        store.fail_updates(1);
        assert_eq!(
            lock.touch().await,
            Touch::Deferred {
                ts_expire: lease.ts_expire
            }
        );
        // the blip passed, the next touch succeeds and resets the counter
        assert!(matches!(lock.touch().await, Touch::Renewed { .. }));
    }

    #[tokio::test]
    async fn two_consecutive_transport_failures_lose_the_lease() {
        let store = Arc::new(MemoryStore::new());
        let mut lock = lock(&store, "k", 5);
        lock.acquire(AcquireOptions::default()).await.unwrap();

        store.fail_updates(2);
        assert!(matches!(lock.touch().await, Touch::Deferred { .. }));
        assert!(lock.touch().await.is_lost());
        assert!(lock.lease().is_none());
    }

    #[tokio::test]
    async fn release_of_non_owned_lease_is_a_noop() {
        let store = Arc::new(MemoryStore::new());
        let mut a = lock(&store, "k", 2);
        let mut b = lock(&store, "k", 2);

        a.acquire(AcquireOptions::default()).await.unwrap();
        store.advance(Duration::from_secs(3));
        b.acquire(AcquireOptions::default()).await.unwrap();

        // a's lease was replaced; releasing must not evict b
        a.release(false).await.unwrap();
        assert!(b.owned().await.unwrap());

        // the administrative override does evict b
        a.release(true).await.unwrap();
        assert!(!b.owned().await.unwrap());
    }

    #[tokio::test]
    async fn clock_paranoia_rejects_skewed_hosts() {
        let store = Arc::new(MemoryStore::new());
        store.set_skew(chrono::Duration::seconds(1));

        let options = LockOptions::new("k")
            .ttl(5)
            .max_offset(Duration::from_millis(100));
        let mut paranoid =
            DistLock::new(store.clone() as Arc<dyn CoordinationStore>, options.clone()).unwrap();
        let err = paranoid.acquire(AcquireOptions::default()).await.unwrap_err();
        assert!(matches!(err, Error::ClockOffset { .. }));

        let mut relaxed = DistLock::new(
            store as Arc<dyn CoordinationStore>,
            options.time_paranoid(false),
        )
        .unwrap();
        relaxed.acquire(AcquireOptions::default()).await.unwrap();
        assert!(relaxed.owned().await.unwrap());
    }

    #[tokio::test]
    async fn acquire_propagates_transport_errors() {
        let store = Arc::new(MemoryStore::new());
        let mut lock = lock(&store, "k", 5);
        store.fail_creates(1);
        let err = lock.acquire(AcquireOptions::default()).await.unwrap_err();
        assert!(matches!(err, Error::StoreUnavailable(_)));
        assert!(lock.lease().is_none());
    }

    #[tokio::test]
    async fn with_lock_releases_on_completion() {
        let store = Arc::new(MemoryStore::new());
        let mut lock = lock(&store, "k", 5);

        let out = lock
            .with_lock(AcquireOptions::default(), async { 7 })
            .await
            .unwrap();
        assert_eq!(out, 7);
        assert!(!lock.locked().await.unwrap());
    }

    #[tokio::test]
    async fn with_lock_releases_when_cancelled() {
        let store = Arc::new(MemoryStore::new());

        let handle = {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                let mut lock = lock(&store, "k", 60);
                lock.with_lock(AcquireOptions::default(), std::future::pending::<()>())
                    .await
                    .unwrap();
            })
        };
        // let the task win the key, then cancel it mid-critical-section
        while store.lock_count() == 0 {
            tokio::task::yield_now().await;
        }
        handle.abort();
        let _ = handle.await;

        while store.lock_count() != 0 {
            tokio::task::yield_now().await;
        }
    }
}
