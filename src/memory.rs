//! In-process coordination service.
//!
//! Behaves like an etcd lease + mutex pair: a session is a lease renewed by a
//! background keepalive, waiters on a key are served in FIFO order, and a
//! session that is closed or misses its TTL releases everything it holds.
//! Also carries hooks for driving failures from tests.

use crate::coordinator::{Coordinator, Mutex, Session};
use crate::deadline::instant_after;
use anyhow::{anyhow, bail};
use async_trait::async_trait;
use log::*;
use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{Notify, oneshot};
use tokio::time::{Instant, sleep, timeout_at};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// One-shot failures consumed by the next matching call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// The next `create_session` fails with this message.
    SessionCreate(String),
    /// The next `lock` fails with this message.
    Lock(String),
    /// The next `lock` succeeds, then its session is revoked before it returns.
    LoseSessionOnLock,
    /// The next `lock` holds the key this long before returning.
    DelayLock(Duration),
    /// The next `lock` panics. Only built for unit tests and the `test-util`
    /// feature.
    #[cfg(any(test, feature = "test-util"))]
    PanicOnLock,
}

#[derive(Clone, Default)]
pub struct MemoryCoordinator {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    state: std::sync::Mutex<State>,
    changed: Notify,
}

#[derive(Default)]
struct State {
    sessions: HashMap<String, Lease>,
    keys: HashMap<String, KeyState>,
    faults: VecDeque<Fault>,
    keepalive_suspended: bool,
}

struct Lease {
    done: CancellationToken,
    ttl: Duration,
    expires_at: Instant,
}

#[derive(Default)]
struct KeyState {
    holder: Option<String>,
    waiters: VecDeque<Waiter>,
}

struct Waiter {
    session: String,
    tx: oneshot::Sender<()>,
}

impl KeyState {
    /// Passes the key to the first waiter that is still around.
    fn hand_off(&mut self, sessions: &HashMap<String, Lease>) {
        self.holder = None;
        while let Some(w) = self.waiters.pop_front() {
            if !sessions.contains_key(&w.session) {
                continue;
            }
            self.holder = Some(w.session);
            if w.tx.send(()).is_ok() {
                return;
            }
            self.holder = None;
        }
    }

    fn is_idle(&self) -> bool {
        self.holder.is_none() && self.waiters.is_empty()
    }
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_fault(&self, pick: impl Fn(&Fault) -> bool) -> Option<Fault> {
        let mut st = self.state();
        let i = st.faults.iter().position(pick)?;
        st.faults.remove(i)
    }

    fn revoke(&self, id: &str) -> bool {
        let revoked = {
            let mut st = self.state();
            let State { sessions, keys, .. } = &mut *st;
            match sessions.remove(id) {
                None => false,
                Some(lease) => {
                    lease.done.cancel();
                    for ks in keys.values_mut() {
                        ks.waiters.retain(|w| w.session != id);
                        if ks.holder.as_deref() == Some(id) {
                            ks.hand_off(sessions);
                        }
                    }
                    keys.retain(|_, ks| !ks.is_idle());
                    true
                }
            }
        };
        if revoked {
            debug!("session revoked: {id}");
            self.changed.notify_waiters();
        }
        revoked
    }

    /// Extends the lease, or expires it when keepalives are suspended and the
    /// TTL has run out. Returns false once the session is gone.
    fn renew(&self, id: &str) -> bool {
        let expired = {
            let mut st = self.state();
            let suspended = st.keepalive_suspended;
            let Some(lease) = st.sessions.get_mut(id) else {
                return false;
            };
            let now = Instant::now();
            if !suspended {
                lease.expires_at = instant_after(now, lease.ttl);
                return true;
            }
            now >= lease.expires_at
        };
        if expired {
            info!("session expired: {id}");
            self.revoke(id);
            return false;
        }
        true
    }
}

async fn keepalive(inner: Weak<Inner>, id: String, ttl: Duration, done: CancellationToken) {
    let ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(2);
    let (min, max) = ((ms / 10 * 5).max(1), (ms / 10 * 8).max(1));
    loop {
        let pause = rand::thread_rng().gen_range(min..=max);
        tokio::select! {
            _ = done.cancelled() => return,
            _ = sleep(Duration::from_millis(pause)) => {}
        }

        let Some(svc) = inner.upgrade() else {
            return;
        };
        if !svc.renew(&id) {
            return;
        }
    }
}

impl MemoryCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a fault for the next matching call.
    pub fn inject(&self, fault: Fault) {
        self.inner.state().faults.push_back(fault);
    }

    /// Stops (or resumes) lease renewal for every session, as in a partition.
    /// Sessions then expire at their next liveness check past the TTL.
    pub fn suspend_keepalive(&self, suspended: bool) {
        self.inner.state().keepalive_suspended = suspended;
    }

    /// Kills a session from outside its owner. Returns false if it was gone.
    pub fn revoke(&self, session_id: &str) -> bool {
        self.inner.revoke(session_id)
    }

    /// The session currently holding `key`.
    pub fn holder(&self, key: &str) -> Option<String> {
        self.inner.state().keys.get(key)?.holder.clone()
    }

    pub fn is_alive(&self, session_id: &str) -> bool {
        self.inner.state().sessions.contains_key(session_id)
    }

    pub fn session_count(&self) -> usize {
        self.inner.state().sessions.len()
    }

    /// Waits up to `within` for `key` to be free. Returns whether it is.
    pub async fn wait_released(&self, key: &str, within: Duration) -> bool {
        self.wait_until(within, |st| {
            st.keys.get(key).is_none_or(|ks| ks.holder.is_none())
        })
        .await
    }

    /// Waits up to `within` for every session to be closed.
    pub async fn wait_no_sessions(&self, within: Duration) -> bool {
        self.wait_until(within, |st| st.sessions.is_empty()).await
    }

    async fn wait_until(&self, within: Duration, cond: impl Fn(&State) -> bool) -> bool {
        let deadline = instant_after(Instant::now(), within);
        loop {
            let changed = self.inner.changed.notified();
            if cond(&*self.inner.state()) {
                return true;
            }
            if timeout_at(deadline, changed).await.is_err() {
                return cond(&*self.inner.state());
            }
        }
    }
}

#[async_trait]
impl Coordinator for MemoryCoordinator {
    type Session = MemorySession;

    async fn create_session(&self, ttl: Duration) -> anyhow::Result<MemorySession> {
        if let Some(Fault::SessionCreate(msg)) =
            self.inner.take_fault(|f| matches!(f, Fault::SessionCreate(_)))
        {
            bail!(msg);
        }

        let id = Uuid::new_v4().to_string();
        let done = CancellationToken::new();
        self.inner.state().sessions.insert(
            id.clone(),
            Lease {
                done: done.clone(),
                ttl,
                expires_at: instant_after(Instant::now(), ttl),
            },
        );
        tokio::spawn(keepalive(
            Arc::downgrade(&self.inner),
            id.clone(),
            ttl,
            done.clone(),
        ));
        debug!("session created: {id}, ttl={ttl:?}");

        Ok(MemorySession {
            inner: self.inner.clone(),
            id,
            done,
        })
    }
}

pub struct MemorySession {
    inner: Arc<Inner>,
    id: String,
    done: CancellationToken,
}

#[async_trait]
impl Session for MemorySession {
    type Mutex = MemoryMutex;

    fn id(&self) -> &str {
        &self.id
    }

    fn done(&self) -> CancellationToken {
        self.done.clone()
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.inner.revoke(&self.id);
        Ok(())
    }

    fn mutex(&self, key: &str) -> MemoryMutex {
        MemoryMutex {
            inner: self.inner.clone(),
            session: self.id.clone(),
            key: key.to_string(),
        }
    }
}

pub struct MemoryMutex {
    inner: Arc<Inner>,
    session: String,
    key: String,
}

#[async_trait]
impl Mutex for MemoryMutex {
    fn key(&self) -> &str {
        &self.key
    }

    async fn lock(&self) -> anyhow::Result<()> {
        let inner = &self.inner;
        if let Some(Fault::Lock(msg)) = inner.take_fault(|f| matches!(f, Fault::Lock(_))) {
            bail!(msg);
        }
        #[cfg(any(test, feature = "test-util"))]
        if inner.take_fault(|f| *f == Fault::PanicOnLock).is_some() {
            panic!("injected panic while locking {}", self.key);
        }
        let delay = match inner.take_fault(|f| matches!(f, Fault::DelayLock(_))) {
            Some(Fault::DelayLock(d)) => Some(d),
            _ => None,
        };
        let lose = inner.take_fault(|f| *f == Fault::LoseSessionOnLock).is_some();

        let wait = {
            let mut st = inner.state();
            if !st.sessions.contains_key(&self.session) {
                bail!("session closed");
            }
            let ks = st.keys.entry(self.key.clone()).or_default();
            match &ks.holder {
                None => {
                    ks.holder = Some(self.session.clone());
                    None
                }
                Some(h) if *h == self.session => None,
                Some(_) => {
                    let (tx, rx) = oneshot::channel();
                    ks.waiters.push_back(Waiter {
                        session: self.session.clone(),
                        tx,
                    });
                    Some(rx)
                }
            }
        };
        inner.changed.notify_waiters();

        if let Some(rx) = wait {
            rx.await.map_err(|_| anyhow!("session closed"))?;
        }
        if let Some(d) = delay {
            sleep(d).await;
        }
        if lose {
            inner.revoke(&self.session);
        }
        Ok(())
    }

    async fn unlock(&self) -> anyhow::Result<()> {
        {
            let mut st = self.inner.state();
            let State { sessions, keys, .. } = &mut *st;
            if let Some(ks) = keys.get_mut(&self.key) {
                if ks.holder.as_deref() == Some(self.session.as_str()) {
                    ks.hand_off(sessions);
                }
                if ks.is_idle() {
                    keys.remove(&self.key);
                }
            }
        }
        self.inner.changed.notify_waiters();
        Ok(())
    }
}
