use crate::error::Error;
use std::future::Future;
use std::time::Duration;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;

// Far enough out to never fire; tokio rejects instants that overflow.
const FOREVER: Duration = Duration::from_secs(86400 * 365 * 30);

/// `from + d`, capped at a far-future instant instead of overflowing.
pub(crate) fn instant_after(from: Instant, d: Duration) -> Instant {
    from.checked_add(d).unwrap_or(from + FOREVER)
}

/// Why a deadline-bound wait ended early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Expired {
    Cancelled,
    TimedOut(Duration),
}

impl From<Expired> for Error {
    fn from(e: Expired) -> Self {
        match e {
            Expired::Cancelled => Error::Cancelled,
            Expired::TimedOut(ttl) => Error::Timeout(ttl),
        }
    }
}

/// A cancellation scope bounded by a TTL measured from construction.
#[derive(Debug, Clone)]
pub(crate) struct Deadline {
    scope: CancellationToken,
    at: Instant,
    ttl: Duration,
}

impl Deadline {
    pub(crate) fn after(scope: &CancellationToken, ttl: Duration) -> Self {
        let at = instant_after(Instant::now(), ttl);
        Self {
            scope: scope.clone(),
            at,
            ttl,
        }
    }

    pub(crate) fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Resolves once the TTL has elapsed. The scope is not watched here.
    pub(crate) async fn elapsed(&self) {
        sleep_until(self.at).await
    }

    /// Drives `fut` until it finishes, the scope is cancelled, or the TTL
    /// runs out. Cancellation wins ties.
    pub(crate) async fn run<F: Future>(&self, fut: F) -> Result<F::Output, Expired> {
        tokio::select! {
            biased;
            _ = self.scope.cancelled() => Err(Expired::Cancelled),
            _ = sleep_until(self.at) => Err(Expired::TimedOut(self.ttl)),
            out = fut => Ok(out),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future;

    #[tokio::test]
    async fn completes_before_deadline() {
        let scope = CancellationToken::new();
        let d = Deadline::after(&scope, Duration::from_secs(5));
        assert_eq!(d.run(async { 7 }).await, Ok(7));
    }

    #[tokio::test]
    async fn times_out() {
        let scope = CancellationToken::new();
        let d = Deadline::after(&scope, Duration::from_millis(50));
        let start = std::time::Instant::now();
        let res = d.run(future::pending::<()>()).await;
        assert_eq!(res, Err(Expired::TimedOut(Duration::from_millis(50))));
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn scope_cancellation_wins() {
        let scope = CancellationToken::new();
        let d = Deadline::after(&scope, Duration::from_secs(5));
        scope.cancel();
        assert_eq!(d.run(async { 1 }).await, Err(Expired::Cancelled));
    }

    #[tokio::test]
    async fn huge_ttl_does_not_overflow() {
        let scope = CancellationToken::new();
        let d = Deadline::after(&scope, Duration::MAX);
        assert_eq!(d.ttl(), Duration::MAX);
        assert_eq!(d.run(async { "ok" }).await, Ok("ok"));
    }
}
