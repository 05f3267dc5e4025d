//! Lock smoke test against a live mongod.
//!
//! Run with `MONGODB_URI` pointing at a reachable deployment (defaults to
//! `mongodb://localhost:27017`). Uses its own database and cleans up after
//! itself.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{ensure, Context};
use mongoelector::{AcquireOptions, DistLock, Error, LockOptions, MongoStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let uri = std::env::var("MONGODB_URI").unwrap_or_else(|_| "mongodb://localhost:27017".into());
    let client = mongodb::Client::with_uri_str(&uri).await?;
    let db = client.database("mongoelector_e2e");
    db.drop().await?;

    let store = Arc::new(MongoStore::new(db.clone()));
    store.ensure_indexes().await?;

    // single node: acquire, inspect, release
    let mut a = DistLock::new(store.clone(), LockOptions::new("e2e-lock").ttl(5))?;
    ensure!(!a.locked().await?, "fresh key must be unlocked");
    a.acquire(AcquireOptions::default()).await?;
    ensure!(a.owned().await?, "holder must observe ownership");
    let doc = a
        .get_current()
        .await?
        .context("lock document must exist")?;
    tracing::info!(owner_id = %doc.owner_id, host = %doc.host, "lock installed");

    // contention: a second actor fails fast, then wins after release
    let mut b = DistLock::new(store.clone(), LockOptions::new("e2e-lock").ttl(5))?;
    match b.acquire(AcquireOptions::default().non_blocking()).await {
        Err(Error::LockExists { .. }) => {}
        other => anyhow::bail!("expected collision, got {other:?}"),
    }
    a.release(false).await?;
    b.acquire(
        AcquireOptions::default().timeout(Duration::from_secs(6)),
    )
    .await?;
    ensure!(b.owned().await?, "contender must win after release");

    // expiry steal: a silent holder is evicted
    let mut short = DistLock::new(store.clone(), LockOptions::new("e2e-steal").ttl(2))?;
    short.acquire(AcquireOptions::default()).await?;
    tokio::time::sleep(Duration::from_secs(3)).await;
    let mut thief = DistLock::new(store.clone(), LockOptions::new("e2e-steal").ttl(2))?;
    thief.acquire(AcquireOptions::default()).await?;
    ensure!(thief.owned().await?, "thief must own the expired key");
    ensure!(
        short.touch().await.is_lost(),
        "evicted holder must observe loss on touch"
    );

    db.drop().await?;
    tracing::info!("lock e2e passed");
    Ok(())
}
