//! Narrow capability over the document store.
//!
//! The lock and election layers never talk to a driver directly; they go
//! through [`CoordinationStore`], which exposes exactly the conditional
//! operations the lease protocol needs. Conditional misses (`Rejected`) are
//! ordinary outcomes, not errors; only transport failures surface as
//! [`StoreError`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

mod mongo;

#[cfg(test)]
pub(crate) mod memory;

pub use mongo::MongoStore;

/// Default collection holding lock documents.
pub const DEFAULT_LOCK_COLLECTION: &str = "mongolocker";
/// Default collection holding node status documents.
pub const DEFAULT_STATUS_COLLECTION: &str = "mongoelector_status";

/// A transport or driver failure. Propagated unchanged through the lock
/// layer; precondition misses are never wrapped in this.
#[derive(Debug, thiserror::Error)]
#[error("store transport failure: {0}")]
pub struct StoreError(#[source] Box<dyn std::error::Error + Send + Sync>);

impl StoreError {
    /// Wrap a driver error.
    pub fn transport(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self(Box::new(err))
    }
}

/// Outcome of a conditional single-document write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    /// The precondition held and the write took effect.
    Applied,
    /// The precondition failed (document present, absent, or owned by
    /// someone else). The store was not modified by this call.
    Rejected,
}

/// One lease over a lock key. At most one of these exists per `key` at any
/// store-observed instant; the unique index on `key` collapses insert races
/// to a single winner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockDocument {
    /// The lock name.
    pub key: String,
    /// Fresh fingerprint minted for this acquisition; never reused.
    #[serde(with = "bson::serde_helpers::uuid_1_as_binary")]
    pub owner_id: Uuid,
    /// Informational hostname of the owner.
    pub host: String,
    /// Informational process id of the owner.
    pub pid: u32,
    /// Store-clock time the lease was created.
    #[serde(with = "bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub ts_created: DateTime<Utc>,
    /// Absolute store-clock expiry. Any contender whose read-time exceeds
    /// this may steal.
    #[serde(with = "bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub ts_expire: DateTime<Utc>,
    /// Declared lease length in seconds, for introspection.
    pub ttl: u64,
}

/// Per-instance election status row, keyed by `(election_key, owner_id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatusDocument {
    /// Groups instances contending for the same leadership.
    pub election_key: String,
    /// Stable for the lifetime of the elector instance (distinct from the
    /// per-acquisition lock fingerprints).
    #[serde(with = "bson::serde_helpers::uuid_1_as_binary")]
    pub owner_id: Uuid,
    /// Informational hostname of the instance.
    pub host: String,
    /// Informational process id of the instance.
    pub pid: u32,
    /// Application version supplied at construction, if any.
    #[serde(default)]
    pub app_version: Option<String>,
    /// Last observed leadership state of this instance.
    pub is_leader: bool,
    /// Stamped with the store clock on every upsert.
    #[serde(with = "bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub ts_heartbeat: DateTime<Utc>,
    /// Where the instance's election state machine currently sits.
    pub state: crate::elector::ElectorState,
}

/// Conditional single-document operations the lease protocol is built on.
///
/// Every conditional write must be atomic at the store. Implementations must
/// guarantee a unique index on the lock `key` so concurrent
/// [`create_if_absent`](CoordinationStore::create_if_absent) calls collapse
/// to one winner, and must preserve unrelated document fields across the
/// patch issued by
/// [`update_expiry_if_match`](CoordinationStore::update_expiry_if_match).
#[async_trait::async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Install `doc` if no document exists for its key.
    async fn create_if_absent(&self, doc: &LockDocument) -> Result<CasOutcome, StoreError>;

    /// Move the expiry of `key` forward, provided it is still owned by
    /// `owner_id`. Leaves every other field untouched.
    async fn update_expiry_if_match(
        &self,
        key: &str,
        owner_id: Uuid,
        ts_expire: DateTime<Utc>,
    ) -> Result<CasOutcome, StoreError>;

    /// Delete the document for `key`, provided it is still owned by
    /// `owner_id`.
    async fn delete_if_match(&self, key: &str, owner_id: Uuid) -> Result<CasOutcome, StoreError>;

    /// Delete the document for `key` regardless of owner. Backs the
    /// administrative `force` paths; deleting an absent key is not an error.
    async fn delete_any(&self, key: &str) -> Result<(), StoreError>;

    /// Point-read of the lock document for `key`.
    async fn find(&self, key: &str) -> Result<Option<LockDocument>, StoreError>;

    /// The store's notion of now. All expiry comparisons use this clock,
    /// never the client's.
    async fn server_now(&self) -> Result<DateTime<Utc>, StoreError>;

    /// Insert or refresh the status row for `(doc.election_key,
    /// doc.owner_id)`, stamping `ts_heartbeat` with the store clock.
    async fn upsert_status(&self, doc: &NodeStatusDocument) -> Result<(), StoreError>;

    /// Remove the status row for a cleanly stopping instance.
    async fn delete_status(&self, election_key: &str, owner_id: Uuid) -> Result<(), StoreError>;

    /// Snapshot of every status row contending for `election_key`.
    async fn list_statuses(
        &self,
        election_key: &str,
    ) -> Result<Vec<NodeStatusDocument>, StoreError>;
}
