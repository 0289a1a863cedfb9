use crate::config::{LockBuilder, LockOptions, LockerConfig};
use crate::coordinator::Coordinator;
use crate::deadline::Deadline;
use crate::error::{Error, Result};
use crate::worker::{self, LockRequest};
use async_trait::async_trait;
use log::*;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Anything that can take an exclusive, per-key lock.
#[async_trait]
pub trait Locker: Send + Sync {
    /// Makes a single attempt to lock `key`, waiting at most the TTL from
    /// `opts`. Cancelling `ctx` aborts the attempt; it has no effect on a lock
    /// already returned.
    async fn try_lock(
        &self,
        ctx: &CancellationToken,
        key: &str,
        opts: LockOptions,
    ) -> Result<LockHandle>;
}

/// Releases a held lock. Unlocking more than once does nothing, and dropping
/// the unlocker unlocks.
#[derive(Debug)]
#[must_use = "dropping the unlocker releases the lock"]
pub struct Unlocker {
    scope: CancellationToken,
}

impl Unlocker {
    /// Starts the release and returns immediately; the mutex is unlocked and
    /// the session closed in the background.
    pub fn unlock(&self) {
        self.scope.cancel();
    }
}

impl Drop for Unlocker {
    fn drop(&mut self) {
        self.scope.cancel();
    }
}

/// A held lock.
///
/// `lifetime()` is cancelled as soon as the lock is gone, whether through
/// `unlock`, session loss, or the handle being dropped.
#[derive(Debug)]
#[must_use = "dropping the handle releases the lock"]
pub struct LockHandle {
    key: String,
    session_id: String,
    unlocker: Unlocker,
    lifetime: CancellationToken,
}

impl LockHandle {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Id of the coordination session backing this lock.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn unlock(&self) {
        self.unlocker.unlock()
    }

    pub fn lifetime(&self) -> CancellationToken {
        self.lifetime.clone()
    }

    pub fn is_held(&self) -> bool {
        !self.lifetime.is_cancelled()
    }

    /// Resolves when the lock is lost or released.
    pub async fn lost(&self) {
        self.lifetime.cancelled().await
    }

    pub fn into_parts(self) -> (Unlocker, CancellationToken) {
        (self.unlocker, self.lifetime)
    }
}

/// Hands out locks backed by sessions from a `Coordinator`.
pub struct LockManager<C> {
    coordinator: Arc<C>,
    config: LockerConfig,
}

impl<C> Clone for LockManager<C> {
    fn clone(&self) -> Self {
        Self {
            coordinator: Arc::clone(&self.coordinator),
            config: self.config,
        }
    }
}

impl LockManager<()> {
    pub fn builder() -> LockBuilder {
        LockBuilder::default()
    }
}

impl<C: Coordinator> LockManager<C> {
    pub fn new(coordinator: C) -> Self {
        Self::with_config(coordinator, LockerConfig::default())
    }

    pub fn with_config(coordinator: C, config: LockerConfig) -> Self {
        Self {
            coordinator: Arc::new(coordinator),
            config,
        }
    }

    pub fn config(&self) -> &LockerConfig {
        &self.config
    }

    pub fn coordinator(&self) -> &C {
        &self.coordinator
    }

    pub async fn try_lock(
        &self,
        ctx: &CancellationToken,
        key: &str,
        opts: LockOptions,
    ) -> Result<LockHandle> {
        if key.is_empty() {
            return Err(Error::EmptyKey);
        }
        let ttl = opts.resolve(&self.config);

        // Detached from `ctx`: it outlives the call when the lock is taken.
        let scope = CancellationToken::new();
        let deadline = Deadline::after(&scope, ttl);

        // Cancels the scope on every way out of here except success,
        // including this future being dropped mid-race.
        let abandon = scope.clone().drop_guard();

        let (tx, mut rx) = oneshot::channel();
        worker::spawn(
            Arc::clone(&self.coordinator),
            LockRequest {
                key: key.to_string(),
                scope: scope.clone(),
                deadline: deadline.clone(),
                session_ttl: self.config.session_ttl,
                unlock_grace: self.config.unlock_grace,
            },
            tx,
        );

        let outcome = tokio::select! {
            biased;
            _ = ctx.cancelled() => Err(Error::Cancelled),
            _ = deadline.elapsed() => Err(Error::Timeout(deadline.ttl())),
            res = &mut rx => match res {
                Ok(outcome) => outcome,
                Err(_) => Err(Error::WorkerFailed("worker exited without an outcome".into())),
            },
        };

        match outcome {
            Ok(acquired) => {
                let scope = abandon.disarm();
                debug!("locked {key} (session {})", acquired.session_id);
                Ok(LockHandle {
                    key: key.to_string(),
                    session_id: acquired.session_id,
                    unlocker: Unlocker {
                        scope: scope.clone(),
                    },
                    lifetime: scope,
                })
            }
            Err(e) => {
                debug!("try_lock {key} failed: {e}");
                drop(abandon);
                Err(e)
            }
        }
    }
}

#[async_trait]
impl<C: Coordinator> Locker for LockManager<C> {
    async fn try_lock(
        &self,
        ctx: &CancellationToken,
        key: &str,
        opts: LockOptions,
    ) -> Result<LockHandle> {
        LockManager::try_lock(self, ctx, key, opts).await
    }
}
