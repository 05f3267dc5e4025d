//! In-memory [`CoordinationStore`] for unit tests.
//!
//! Mirrors the semantics the Mongo adapter gets from the server: conditional
//! writes are atomic under one mutex, the unique key constraint rejects
//! duplicate inserts, and `server_now` reports a store clock that tests can
//! skew independently of the host clock.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use super::{CasOutcome, CoordinationStore, LockDocument, NodeStatusDocument, StoreError};

#[derive(Debug, thiserror::Error)]
#[error("injected transport fault")]
struct InjectedFault;

#[derive(Default)]
struct Faults {
    create: u32,
    update: u32,
    status: u32,
}

struct State {
    locks: HashMap<String, LockDocument>,
    statuses: HashMap<(String, Uuid), NodeStatusDocument>,
    skew: Duration,
    faults: Faults,
}

impl Default for State {
    fn default() -> Self {
        Self {
            locks: HashMap::new(),
            statuses: HashMap::new(),
            skew: Duration::zero(),
            faults: Faults::default(),
        }
    }
}

#[derive(Default)]
pub(crate) struct MemoryStore {
    state: Mutex<State>,
}

fn take_fault(counter: &mut u32) -> Result<(), StoreError> {
    if *counter > 0 {
        *counter -= 1;
        return Err(StoreError::transport(InjectedFault));
    }
    Ok(())
}

impl MemoryStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Jump the store clock forward, e.g. to expire a live lease.
    pub(crate) fn advance(&self, by: std::time::Duration) {
        let mut state = self.state.lock();
        state.skew = state.skew + Duration::from_std(by).unwrap();
    }

    /// Fix the store clock `skew` away from the host clock.
    pub(crate) fn set_skew(&self, skew: Duration) {
        self.state.lock().skew = skew;
    }

    /// Fail the next `n` expiry updates with a transport error.
    pub(crate) fn fail_updates(&self, n: u32) {
        self.state.lock().faults.update = n;
    }

    /// Fail the next `n` status upserts with a transport error.
    pub(crate) fn fail_status_writes(&self, n: u32) {
        self.state.lock().faults.status = n;
    }

    /// Fail the next `n` lock inserts with a transport error.
    pub(crate) fn fail_creates(&self, n: u32) {
        self.state.lock().faults.create = n;
    }

    pub(crate) fn lock_count(&self) -> usize {
        self.state.lock().locks.len()
    }

    pub(crate) fn status_count(&self) -> usize {
        self.state.lock().statuses.len()
    }

    fn now(state: &State) -> DateTime<Utc> {
        Utc::now() + state.skew
    }
}

#[async_trait::async_trait]
impl CoordinationStore for MemoryStore {
    async fn create_if_absent(&self, doc: &LockDocument) -> Result<CasOutcome, StoreError> {
        let mut state = self.state.lock();
        take_fault(&mut state.faults.create)?;
        if state.locks.contains_key(&doc.key) {
            return Ok(CasOutcome::Rejected);
        }
        state.locks.insert(doc.key.clone(), doc.clone());
        Ok(CasOutcome::Applied)
    }

    async fn update_expiry_if_match(
        &self,
        key: &str,
        owner_id: Uuid,
        ts_expire: DateTime<Utc>,
    ) -> Result<CasOutcome, StoreError> {
        let mut state = self.state.lock();
        take_fault(&mut state.faults.update)?;
        match state.locks.get_mut(key) {
            Some(doc) if doc.owner_id == owner_id => {
                doc.ts_expire = ts_expire;
                Ok(CasOutcome::Applied)
            }
            _ => Ok(CasOutcome::Rejected),
        }
    }

    async fn delete_if_match(&self, key: &str, owner_id: Uuid) -> Result<CasOutcome, StoreError> {
        let mut state = self.state.lock();
        match state.locks.get(key) {
            Some(doc) if doc.owner_id == owner_id => {
                state.locks.remove(key);
                Ok(CasOutcome::Applied)
            }
            _ => Ok(CasOutcome::Rejected),
        }
    }

    async fn delete_any(&self, key: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        state.locks.remove(key);
        Ok(())
    }

    async fn find(&self, key: &str) -> Result<Option<LockDocument>, StoreError> {
        let state = self.state.lock();
        Ok(state.locks.get(key).cloned())
    }

    async fn server_now(&self) -> Result<DateTime<Utc>, StoreError> {
        let state = self.state.lock();
        Ok(Self::now(&state))
    }

    async fn upsert_status(&self, doc: &NodeStatusDocument) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        take_fault(&mut state.faults.status)?;
        let mut doc = doc.clone();
        doc.ts_heartbeat = Self::now(&state);
        state
            .statuses
            .insert((doc.election_key.clone(), doc.owner_id), doc);
        Ok(())
    }

    async fn delete_status(&self, election_key: &str, owner_id: Uuid) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        take_fault(&mut state.faults.status)?;
        state
            .statuses
            .remove(&(election_key.to_string(), owner_id));
        Ok(())
    }

    async fn list_statuses(
        &self,
        election_key: &str,
    ) -> Result<Vec<NodeStatusDocument>, StoreError> {
        let state = self.state.lock();
        let mut rows: Vec<_> = state
            .statuses
            .values()
            .filter(|doc| doc.election_key == election_key)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.owner_id.cmp(&b.owner_id));
        Ok(rows)
    }
}
