//! [`CoordinationStore`] over the official MongoDB driver.

use bson::doc;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use mongodb::error::{ErrorKind, WriteError, WriteFailure};
use mongodb::options::IndexOptions;
use mongodb::{Collection, Database, IndexModel};
use uuid::Uuid;

use super::{
    CasOutcome, CoordinationStore, LockDocument, NodeStatusDocument, StoreError,
    DEFAULT_LOCK_COLLECTION, DEFAULT_STATUS_COLLECTION,
};

/// Production store adapter over a [`mongodb::Database`].
///
/// All conditional operations are single-document `insert_one` /
/// `update_one` / `delete_one` calls, so the store's single-document
/// atomicity carries the protocol. Call [`ensure_indexes`](Self::ensure_indexes)
/// once per deployment before contending.
#[derive(Clone)]
pub struct MongoStore {
    db: Database,
    locks: Collection<LockDocument>,
    statuses: Collection<NodeStatusDocument>,
}

impl MongoStore {
    /// Adapter over `db` using the default collection names.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self::with_collections(db, DEFAULT_LOCK_COLLECTION, DEFAULT_STATUS_COLLECTION)
    }

    /// Adapter over `db` with explicit collection names.
    #[must_use]
    pub fn with_collections(db: Database, lock_collection: &str, status_collection: &str) -> Self {
        let locks = db.collection(lock_collection);
        let statuses = db.collection(status_collection);
        Self { db, locks, statuses }
    }

    /// Create the unique indexes the protocol relies on: `key` on the lock
    /// collection, `(election_key, owner_id)` on the status collection.
    pub async fn ensure_indexes(&self) -> Result<(), StoreError> {
        let lock_index = IndexModel::builder()
            .keys(doc! { "key": 1 })
            .options(IndexOptions::builder().unique(true).build())
            .build();
        self.locks
            .create_index(lock_index)
            .await
            .map_err(StoreError::transport)?;

        let status_index = IndexModel::builder()
            .keys(doc! { "election_key": 1, "owner_id": 1 })
            .options(IndexOptions::builder().unique(true).build())
            .build();
        self.statuses
            .create_index(status_index)
            .await
            .map_err(StoreError::transport)?;
        Ok(())
    }
}

fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    matches!(
        *err.kind,
        ErrorKind::Write(WriteFailure::WriteError(WriteError { code: 11000, .. }))
    )
}

#[async_trait::async_trait]
impl CoordinationStore for MongoStore {
    async fn create_if_absent(&self, doc: &LockDocument) -> Result<CasOutcome, StoreError> {
        match self.locks.insert_one(doc).await {
            Ok(_) => Ok(CasOutcome::Applied),
            Err(err) if is_duplicate_key(&err) => Ok(CasOutcome::Rejected),
            Err(err) => Err(StoreError::transport(err)),
        }
    }

    async fn update_expiry_if_match(
        &self,
        key: &str,
        owner_id: Uuid,
        ts_expire: DateTime<Utc>,
    ) -> Result<CasOutcome, StoreError> {
        let filter = doc! { "key": key, "owner_id": bson::Uuid::from_uuid_1(owner_id) };
        let update = doc! { "$set": { "ts_expire": bson::DateTime::from_chrono(ts_expire) } };
        let result = self
            .locks
            .update_one(filter, update)
            .await
            .map_err(StoreError::transport)?;
        if result.matched_count == 1 {
            Ok(CasOutcome::Applied)
        } else {
            Ok(CasOutcome::Rejected)
        }
    }

    async fn delete_if_match(&self, key: &str, owner_id: Uuid) -> Result<CasOutcome, StoreError> {
        let filter = doc! { "key": key, "owner_id": bson::Uuid::from_uuid_1(owner_id) };
        let result = self
            .locks
            .delete_one(filter)
            .await
            .map_err(StoreError::transport)?;
        if result.deleted_count == 1 {
            Ok(CasOutcome::Applied)
        } else {
            Ok(CasOutcome::Rejected)
        }
    }

    async fn delete_any(&self, key: &str) -> Result<(), StoreError> {
        self.locks
            .delete_one(doc! { "key": key })
            .await
            .map_err(StoreError::transport)?;
        Ok(())
    }

    async fn find(&self, key: &str) -> Result<Option<LockDocument>, StoreError> {
        self.locks
            .find_one(doc! { "key": key })
            .await
            .map_err(StoreError::transport)
    }

    async fn server_now(&self) -> Result<DateTime<Utc>, StoreError> {
        // `hello` is unprivileged and cheap; its localTime is the store
        // clock every expiry comparison is anchored to.
        let reply = self
            .db
            .run_command(doc! { "hello": 1 })
            .await
            .map_err(StoreError::transport)?;
        let local_time = reply
            .get_datetime("localTime")
            .map_err(StoreError::transport)?;
        Ok(local_time.to_chrono())
    }

    async fn upsert_status(&self, doc: &NodeStatusDocument) -> Result<(), StoreError> {
        let filter = doc! {
            "election_key": &doc.election_key,
            "owner_id": bson::Uuid::from_uuid_1(doc.owner_id),
        };
        let update = doc! {
            "$set": {
                "host": &doc.host,
                "pid": doc.pid,
                "app_version": doc.app_version.as_deref(),
                "is_leader": doc.is_leader,
                "state": doc.state.as_str(),
            },
            "$setOnInsert": {
                "election_key": &doc.election_key,
                "owner_id": bson::Uuid::from_uuid_1(doc.owner_id),
            },
            // heartbeat is stamped store-side so consumers compare one clock
            "$currentDate": { "ts_heartbeat": true },
        };
        self.statuses
            .update_one(filter, update)
            .upsert(true)
            .await
            .map_err(StoreError::transport)?;
        Ok(())
    }

    async fn delete_status(&self, election_key: &str, owner_id: Uuid) -> Result<(), StoreError> {
        self.statuses
            .delete_one(doc! {
                "election_key": election_key,
                "owner_id": bson::Uuid::from_uuid_1(owner_id),
            })
            .await
            .map_err(StoreError::transport)?;
        Ok(())
    }

    async fn list_statuses(
        &self,
        election_key: &str,
    ) -> Result<Vec<NodeStatusDocument>, StoreError> {
        let cursor = self
            .statuses
            .find(doc! { "election_key": election_key })
            .await
            .map_err(StoreError::transport)?;
        cursor.try_collect().await.map_err(StoreError::transport)
    }
}
