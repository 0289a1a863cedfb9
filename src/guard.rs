use crate::coordinator::{Mutex, Session};
use log::*;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Release {
    /// The lock scope was cancelled: unlock, or an abandoned acquisition.
    Cancelled,
    SessionLost,
}

/// Watches a held lock and tears it down exactly once.
///
/// Takes ownership of the session and its mutex. Whichever of session loss
/// and `scope` cancellation comes first, `scope` ends up cancelled, the mutex
/// is unlocked within `grace`, and the session is closed.
pub(crate) fn spawn<S: Session>(
    session: S,
    mutex: S::Mutex,
    scope: CancellationToken,
    grace: Duration,
) -> JoinHandle<Release> {
    tokio::spawn(async move {
        let done = session.done();
        let reason = tokio::select! {
            _ = scope.cancelled() => Release::Cancelled,
            _ = done.cancelled() => Release::SessionLost,
        };

        scope.cancel();
        match reason {
            Release::SessionLost => {
                warn!("lock lost: key={}, session={}", mutex.key(), session.id())
            }
            Release::Cancelled => {
                debug!("releasing lock: key={}, session={}", mutex.key(), session.id())
            }
        }

        match timeout(grace, mutex.unlock()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("unlock failed: key={}: {e}", mutex.key()),
            Err(_) => warn!("unlock timed out after {grace:?}: key={}", mutex.key()),
        }

        if let Err(e) = session.close().await {
            warn!("session close failed: session={}: {e}", session.id());
        }

        reason
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::Coordinator;
    use crate::memory::MemoryCoordinator;

    #[tokio::test]
    async fn cancel_releases_and_closes() {
        let svc = MemoryCoordinator::new();
        let session = svc.create_session(Duration::from_secs(1)).await.unwrap();
        let id = session.id().to_string();
        let mutex = session.mutex("/k");
        mutex.lock().await.unwrap();

        let scope = CancellationToken::new();
        let h = spawn(session, mutex, scope.clone(), Duration::from_secs(1));
        scope.cancel();

        assert_eq!(h.await.unwrap(), Release::Cancelled);
        assert_eq!(svc.holder("/k"), None);
        assert!(!svc.is_alive(&id));
    }

    #[tokio::test]
    async fn session_loss_cancels_scope() {
        let svc = MemoryCoordinator::new();
        let session = svc.create_session(Duration::from_secs(1)).await.unwrap();
        let id = session.id().to_string();
        let mutex = session.mutex("/k");
        mutex.lock().await.unwrap();

        let scope = CancellationToken::new();
        let h = spawn(session, mutex, scope.clone(), Duration::from_secs(1));
        svc.revoke(&id);

        assert_eq!(h.await.unwrap(), Release::SessionLost);
        assert!(scope.is_cancelled());
        assert_eq!(svc.holder("/k"), None);
    }
}
