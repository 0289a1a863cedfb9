//! The coordination service the lock is built on.
//!
//! A service hands out sessions, leases that stay alive while the service can
//! renew them, and per-key mutexes scoped to a session. Closing or losing a
//! session releases every mutex it holds.

use async_trait::async_trait;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[async_trait]
pub trait Coordinator: Send + Sync + 'static {
    type Session: Session;

    /// Opens a session whose lease is renewed every fraction of `ttl`.
    async fn create_session(&self, ttl: Duration) -> anyhow::Result<Self::Session>;
}

#[async_trait]
pub trait Session: Send + Sync + 'static {
    type Mutex: Mutex;

    fn id(&self) -> &str;

    /// Cancelled once the lease is lost: expiry, partition, or a close from
    /// anywhere.
    fn done(&self) -> CancellationToken;

    fn is_done(&self) -> bool {
        self.done().is_cancelled()
    }

    /// Ends the session. Safe to call on a session the service already closed.
    async fn close(&self) -> anyhow::Result<()>;

    fn mutex(&self, key: &str) -> Self::Mutex;
}

#[async_trait]
pub trait Mutex: Send + Sync + 'static {
    fn key(&self) -> &str;

    /// Waits until the key is held by this mutex's session.
    ///
    /// Must be cancel-safe: dropping the future abandons the wait. A grant
    /// racing the drop stays with the session and is released on close.
    async fn lock(&self) -> anyhow::Result<()>;

    async fn unlock(&self) -> anyhow::Result<()>;
}
