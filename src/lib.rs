//! A distributed try-lock built on a coordination service that offers
//! session leases and per-key mutexes.
//!
//! Each `try_lock` opens its own session, waits a bounded time for the key,
//! and hands back a [`LockHandle`]. The handle's lifetime token is cancelled
//! when the lock goes away, be it through an explicit unlock or because the
//! session backing it died.
//!
//! ```no_run
//! use leaselock::{LockManager, LockOptions, memory::MemoryCoordinator};
//! use std::time::Duration;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> leaselock::Result<()> {
//! let locks = LockManager::builder()
//!     .session_ttl(Duration::from_secs(2))
//!     .build(MemoryCoordinator::new());
//!
//! let ctx = CancellationToken::new();
//! let lock = locks
//!     .try_lock(&ctx, "/jobs/reindex", LockOptions::with_ttl(Duration::from_secs(10)))
//!     .await?;
//!
//! tokio::select! {
//!     _ = lock.lost() => log::warn!("lost the lock"),
//!     _ = tokio::time::sleep(Duration::from_secs(5)) => lock.unlock(),
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod coordinator;
mod deadline;
pub mod error;
mod guard;
pub mod manager;
pub mod memory;
#[cfg(feature = "spanner")]
pub mod spanner;
mod worker;

pub use config::{DEFAULT_TTL, LockBuilder, LockOptions, LockerConfig};
pub use coordinator::{Coordinator, Mutex, Session};
pub use error::{Error, Result};
pub use manager::{LockHandle, LockManager, Locker, Unlocker};
