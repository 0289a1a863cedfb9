use crate::coordinator::{Coordinator, Mutex, Session};
use crate::deadline::Deadline;
use crate::error::{Error, Result};
use crate::guard;
use futures::FutureExt;
use log::*;
use scopeguard::ScopeGuard;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// One acquisition attempt, as handed to the worker.
pub(crate) struct LockRequest {
    pub key: String,
    pub scope: CancellationToken,
    pub deadline: Deadline,
    pub session_ttl: Duration,
    pub unlock_grace: Duration,
}

#[derive(Debug)]
pub(crate) struct Acquired {
    pub session_id: String,
}

pub(crate) type Outcome = Result<Acquired>;

/// Starts the acquisition in the background. Exactly one outcome is sent on
/// `tx`; if nobody is listening anymore the scope is cancelled so that a late
/// success is torn down by its guard.
pub(crate) fn spawn<C: Coordinator>(
    coordinator: Arc<C>,
    req: LockRequest,
    tx: oneshot::Sender<Outcome>,
) {
    tokio::spawn(async move {
        let scope = req.scope.clone();
        let key = req.key.clone();
        let outcome = match AssertUnwindSafe(acquire(coordinator.as_ref(), req))
            .catch_unwind()
            .await
        {
            Ok(outcome) => outcome,
            Err(panic) => Err(Error::WorkerFailed(panic_message(panic.as_ref()))),
        };

        if let Err(e) = &outcome {
            debug!("acquire failed: key={key}: {e}");
            scope.cancel();
        }

        if tx.send(outcome).is_err() {
            debug!("outcome abandoned: key={key}");
            scope.cancel();
        }
    });
}

async fn acquire<C: Coordinator>(coordinator: &C, req: LockRequest) -> Outcome {
    let LockRequest {
        key,
        scope,
        deadline,
        session_ttl,
        unlock_grace,
    } = req;

    let session = tokio::select! {
        biased;
        _ = scope.cancelled() => return Err(Error::Cancelled),
        res = coordinator.create_session(session_ttl) => res.map_err(Error::SessionCreate)?,
    };

    // Any early return from here on closes the session.
    let session = scopeguard::guard(session, close_detached::<C::Session>);
    let mutex = session.mutex(&key);

    match deadline.run(mutex.lock()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return Err(Error::Lock(e)),
        Err(expired) => return Err(expired.into()),
    }

    if session.is_done() {
        warn!("session {} died right after locking {key}", session.id());
        match timeout(unlock_grace, mutex.unlock()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("unlock failed: key={key}: {e}"),
            Err(_) => warn!("unlock timed out after {unlock_grace:?}: key={key}"),
        }
        return Err(Error::SessionLost);
    }

    let session = ScopeGuard::into_inner(session);
    let session_id = session.id().to_string();
    info!("lock acquired: key={key}, session={session_id}");

    guard::spawn(session, mutex, scope, unlock_grace);
    Ok(Acquired { session_id })
}

fn close_detached<S: Session>(session: S) {
    match Handle::try_current() {
        Ok(rt) => {
            rt.spawn(async move {
                if let Err(e) = session.close().await {
                    warn!("session close failed: session={}: {e}", session.id());
                }
            });
        }
        Err(_) => error!("no runtime to close session {}", session.id()),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{Fault, MemoryCoordinator};

    fn request(key: &str, scope: &CancellationToken, ttl: Duration) -> LockRequest {
        LockRequest {
            key: key.to_string(),
            scope: scope.clone(),
            deadline: Deadline::after(scope, ttl),
            session_ttl: Duration::from_secs(1),
            unlock_grace: Duration::from_secs(1),
        }
    }

    async fn run(svc: &MemoryCoordinator, req: LockRequest) -> Outcome {
        let (tx, rx) = oneshot::channel();
        spawn(Arc::new(svc.clone()), req, tx);
        rx.await.unwrap()
    }

    #[tokio::test]
    async fn success_starts_guard() {
        let svc = MemoryCoordinator::new();
        let scope = CancellationToken::new();
        let acquired = run(&svc, request("/w", &scope, Duration::from_secs(1)))
            .await
            .unwrap();
        assert_eq!(svc.holder("/w").as_deref(), Some(acquired.session_id.as_str()));

        scope.cancel();
        assert!(svc.wait_released("/w", Duration::from_secs(1)).await);
        assert!(!svc.is_alive(&acquired.session_id));
    }

    #[tokio::test]
    async fn session_create_failure_is_verbatim() {
        let svc = MemoryCoordinator::new();
        svc.inject(Fault::SessionCreate("lease grant refused".into()));
        let scope = CancellationToken::new();
        let err = run(&svc, request("/w", &scope, Duration::from_secs(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SessionCreate(_)));
        assert_eq!(err.to_string(), "lease grant refused");
        assert!(scope.is_cancelled());
    }

    #[tokio::test]
    async fn lock_failure_closes_session() {
        let svc = MemoryCoordinator::new();
        svc.inject(Fault::Lock("mutex backend down".into()));
        let scope = CancellationToken::new();
        let err = run(&svc, request("/w", &scope, Duration::from_secs(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Lock(_)));
        assert!(svc.wait_no_sessions(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn session_lost_after_lock_is_failure() {
        let svc = MemoryCoordinator::new();
        svc.inject(Fault::LoseSessionOnLock);
        let scope = CancellationToken::new();
        let err = run(&svc, request("/w", &scope, Duration::from_secs(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SessionLost));
        assert_eq!(svc.holder("/w"), None);
    }

    #[tokio::test]
    async fn panic_becomes_outcome() {
        let svc = MemoryCoordinator::new();
        svc.inject(Fault::PanicOnLock);
        let scope = CancellationToken::new();
        let err = run(&svc, request("/w", &scope, Duration::from_secs(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::WorkerFailed(ref m) if m.contains("injected")));
        assert!(svc.wait_no_sessions(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn deadline_inside_worker_is_timeout() {
        let svc = MemoryCoordinator::new();
        let holder = svc.create_session(Duration::from_secs(1)).await.unwrap();
        holder.mutex("/w").lock().await.unwrap();

        let scope = CancellationToken::new();
        let err = run(&svc, request("/w", &scope, Duration::from_millis(100)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(d) if d == Duration::from_millis(100)));
        assert_eq!(svc.holder("/w").as_deref(), Some(holder.id()));
    }
}
