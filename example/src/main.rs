use leaselock::memory::MemoryCoordinator;
use leaselock::{Coordinator, Error, LockManager, LockOptions};
use log::{info, warn};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

const KEY: &str = "/lock";

// Two callers race for the same key: A holds it, B gives up after its TTL,
// C gets it once A lets go. C then holds it until Ctrl-C or until the lock
// is lost.
async fn run<C: Coordinator>(locks: LockManager<C>, stop: CancellationToken) -> anyhow::Result<()> {
    let a = locks
        .try_lock(&stop, KEY, LockOptions::with_ttl(Duration::from_secs(10)))
        .await?;
    info!("A holds {KEY} (session {})", a.session_id());

    let start = Instant::now();
    match locks
        .try_lock(&stop, KEY, LockOptions::with_ttl(Duration::from_millis(200)))
        .await
    {
        Err(Error::Timeout(ttl)) => info!("B timed out after {:?} (ttl {ttl:?})", start.elapsed()),
        Err(e) => warn!("B failed: {e}"),
        Ok(_) => warn!("B got the lock while A held it"),
    }

    let c = {
        let locks = locks.clone();
        let stop = stop.clone();
        tokio::spawn(async move {
            locks
                .try_lock(&stop, KEY, LockOptions::with_ttl(Duration::from_secs(10)))
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    a.unlock();
    info!("A unlocked");

    let c = c.await??;
    info!("C holds {KEY} (session {}), Ctrl-C to release", c.session_id());

    tokio::select! {
        _ = stop.cancelled() => info!("stopping"),
        _ = c.lost() => warn!("C lost the lock"),
    }

    c.unlock();
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let stop = CancellationToken::new();
    let on_signal = stop.clone();
    ctrlc::set_handler(move || on_signal.cancel())?;

    #[cfg(feature = "spanner")]
    if let Ok(db) = std::env::var("SPANNER_DB") {
        let svc = leaselock::spanner::SpannerCoordinator::builder()
            .db(db)
            .connect()
            .await?;
        let locks = LockManager::builder()
            .session_ttl(Duration::from_secs(5))
            .build(svc);
        return run(locks, stop).await;
    }

    let locks = LockManager::builder()
        .session_ttl(Duration::from_secs(2))
        .build(MemoryCoordinator::new());
    run(locks, stop).await?;

    // Give the background release a moment before the runtime goes away.
    tokio::time::sleep(Duration::from_millis(100)).await;
    Ok(())
}
