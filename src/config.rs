use crate::coordinator::Coordinator;
use crate::manager::LockManager;
use std::time::Duration;

/// Fallback for every duration left unset or zero.
pub const DEFAULT_TTL: Duration = Duration::from_secs(1);

/// Manager-wide settings, fixed at build time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockerConfig {
    /// Maximum time `try_lock` waits for the mutex when the call sets no TTL.
    pub wait_ttl: Duration,
    /// Liveness TTL of the session backing each lock. Unrelated to `wait_ttl`.
    pub session_ttl: Duration,
    /// Bound on the unlock issued after the lock's own scope is gone.
    pub unlock_grace: Duration,
}

impl Default for LockerConfig {
    fn default() -> Self {
        Self {
            wait_ttl: DEFAULT_TTL,
            session_ttl: DEFAULT_TTL,
            unlock_grace: DEFAULT_TTL,
        }
    }
}

fn or_default(d: Duration) -> Duration {
    if d.is_zero() { DEFAULT_TTL } else { d }
}

/// Per-call options for `try_lock`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LockOptions {
    /// Maximum time to wait for acquisition. Ignored once the lock is held.
    pub ttl: Option<Duration>,
}

impl LockOptions {
    pub fn with_ttl(ttl: Duration) -> Self {
        Self { ttl: Some(ttl) }
    }

    /// The wait TTL for this call: the call's own TTL if set and non-zero,
    /// otherwise the manager's.
    pub(crate) fn resolve(&self, config: &LockerConfig) -> Duration {
        match self.ttl {
            Some(ttl) if !ttl.is_zero() => ttl,
            _ => or_default(config.wait_ttl),
        }
    }
}

#[derive(Default)]
pub struct LockBuilder {
    wait_ttl: Duration,
    session_ttl: Duration,
    unlock_grace: Duration,
}

impl LockBuilder {
    pub fn new() -> LockBuilder {
        LockBuilder::default()
    }

    pub fn wait_ttl(mut self, ttl: Duration) -> LockBuilder {
        self.wait_ttl = ttl;
        self
    }

    pub fn session_ttl(mut self, ttl: Duration) -> LockBuilder {
        self.session_ttl = ttl;
        self
    }

    pub fn unlock_grace(mut self, grace: Duration) -> LockBuilder {
        self.unlock_grace = grace;
        self
    }

    pub fn config(&self) -> LockerConfig {
        LockerConfig {
            wait_ttl: or_default(self.wait_ttl),
            session_ttl: or_default(self.session_ttl),
            unlock_grace: or_default(self.unlock_grace),
        }
    }

    pub fn build<C: Coordinator>(self, coordinator: C) -> LockManager<C> {
        LockManager::with_config(coordinator, self.config())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_falls_back_to_default() {
        let config = LockBuilder::new()
            .wait_ttl(Duration::ZERO)
            .session_ttl(Duration::from_millis(300))
            .config();
        assert_eq!(config.wait_ttl, DEFAULT_TTL);
        assert_eq!(config.session_ttl, Duration::from_millis(300));
        assert_eq!(config.unlock_grace, DEFAULT_TTL);
    }

    #[test]
    fn call_ttl_overrides_manager() {
        let config = LockBuilder::new().wait_ttl(Duration::from_secs(5)).config();
        assert_eq!(LockOptions::default().resolve(&config), Duration::from_secs(5));
        assert_eq!(
            LockOptions::with_ttl(Duration::from_millis(200)).resolve(&config),
            Duration::from_millis(200)
        );
        assert_eq!(
            LockOptions::with_ttl(Duration::ZERO).resolve(&config),
            Duration::from_secs(5)
        );
    }
}
