//! Election handoff smoke test against a live mongod.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::ensure;
use mongoelector::{CoordinationStore, LeaderElector, MongoStore};

fn elector(
    store: &Arc<MongoStore>,
    events: &Arc<AtomicUsize>,
) -> anyhow::Result<LeaderElector> {
    let on_leader = Arc::clone(events);
    let on_loss = Arc::clone(events);
    Ok(LeaderElector::builder("e2e-svc")
        .ttl(6)
        .app_version(env!("CARGO_PKG_VERSION"))
        .on_leader(move || {
            on_leader.fetch_add(1, Ordering::SeqCst);
        })
        .on_leader_loss(move || {
            on_loss.fetch_add(1000, Ordering::SeqCst);
        })
        .build(Arc::clone(store) as Arc<dyn CoordinationStore>)?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let uri = std::env::var("MONGODB_URI").unwrap_or_else(|_| "mongodb://localhost:27017".into());
    let client = mongodb::Client::with_uri_str(&uri).await?;
    let db = client.database("mongoelector_e2e");
    db.drop().await?;

    let store = Arc::new(MongoStore::new(db.clone()));
    store.ensure_indexes().await?;

    let e1_events = Arc::new(AtomicUsize::new(0));
    let e2_events = Arc::new(AtomicUsize::new(0));
    let e1 = elector(&store, &e1_events)?;
    let e2 = elector(&store, &e2_events)?;

    e1.start()?;
    e2.start()?;

    // exactly one of the two wins
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !(e1.is_leader() || e2.is_leader()) {
        ensure!(tokio::time::Instant::now() < deadline, "no leader elected");
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    ensure!(
        e1.is_leader() != e2.is_leader(),
        "exactly one node may lead"
    );
    let (winner, loser, winner_events) = if e1.is_leader() {
        (e1.clone(), e2.clone(), &e1_events)
    } else {
        (e2.clone(), e1.clone(), &e2_events)
    };
    ensure!(loser.leader_exists().await?, "loser must see the lease");

    // both instances publish status; either view converges on two entries
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while winner.cluster_detail().len() < 2 {
        ensure!(
            tokio::time::Instant::now() < deadline,
            "cluster view did not converge"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    let cluster = winner.cluster_detail();
    ensure!(
        cluster.iter().filter(|n| n.is_leader).count() == 1,
        "cluster view must contain one leader"
    );

    // stopping the winner hands leadership to the loser within 2 polls
    winner.stop().await;
    ensure!(
        winner_events.load(Ordering::SeqCst) == 1001,
        "winner must have fired on_leader and on_leader_loss exactly once"
    );
    let deadline = tokio::time::Instant::now() + 2 * loser.poll_interval() + Duration::from_secs(1);
    while !loser.is_leader() {
        ensure!(
            tokio::time::Instant::now() < deadline,
            "leadership did not hand off"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    loser.stop().await;

    db.drop().await?;
    tracing::info!("election e2e passed");
    Ok(())
}
