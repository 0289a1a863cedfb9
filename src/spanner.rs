//! Cloud Spanner coordination service.
//!
//! Expects two tables:
//!
//! ```sql
//! CREATE TABLE lease_sessions (
//!     id STRING(MAX) NOT NULL,
//!     ttl_ms INT64 NOT NULL,
//!     heartbeat TIMESTAMP OPTIONS (allow_commit_timestamp=true),
//! ) PRIMARY KEY (id);
//!
//! CREATE TABLE lease_locks (
//!     name STRING(MAX) NOT NULL,
//!     session STRING(MAX),
//!     token TIMESTAMP OPTIONS (allow_commit_timestamp=true),
//! ) PRIMARY KEY (name);
//! ```
//!
//! A session is a row heartbeated with commit timestamps; it counts as alive
//! while its last heartbeat is younger than its TTL. A lock row belongs to
//! whichever live session claimed it last.

use crate::coordinator::{Coordinator, Mutex, Session};
use anyhow::bail;
use async_trait::async_trait;
use exp_backoff::BackoffBuilder;
use google_cloud_spanner::client::{Client, ClientConfig};
use google_cloud_spanner::statement::Statement;
use log::*;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const POLL_MIN_MS: u64 = 100;
const POLL_MAX_MS: u64 = 1000;

// Runs one DML statement in its own read-write transaction and returns the
// affected row count.
async fn exec(client: &Client, stmt: Statement) -> anyhow::Result<i64> {
    let mut tx = client.begin_read_write_transaction().await?;
    let res = tx.update(stmt).await;
    let (_, count) = tx.end(res, None).await?;
    Ok(count)
}

pub struct SpannerBuilder {
    db: String,
    sessions_table: String,
    locks_table: String,
}

impl SpannerBuilder {
    pub fn new() -> SpannerBuilder {
        SpannerBuilder {
            db: String::new(),
            sessions_table: "lease_sessions".to_string(),
            locks_table: "lease_locks".to_string(),
        }
    }

    /// Full database path: `projects/{p}/instances/{i}/databases/{d}`.
    pub fn db(mut self, db: String) -> SpannerBuilder {
        self.db = db;
        self
    }

    pub fn sessions_table(mut self, table: String) -> SpannerBuilder {
        self.sessions_table = table;
        self
    }

    pub fn locks_table(mut self, table: String) -> SpannerBuilder {
        self.locks_table = table;
        self
    }

    pub async fn connect(self) -> anyhow::Result<SpannerCoordinator> {
        if self.db.is_empty() {
            bail!("spanner database path not set");
        }
        let config = ClientConfig::default().with_auth().await?;
        let client = Client::new(self.db.clone(), config).await?;
        info!(
            "connected: db={}, sessions={}, locks={}",
            self.db, self.sessions_table, self.locks_table
        );

        Ok(SpannerCoordinator {
            client: Arc::new(client),
            tables: Arc::new(Tables {
                sessions: self.sessions_table,
                locks: self.locks_table,
            }),
        })
    }
}

struct Tables {
    sessions: String,
    locks: String,
}

pub struct SpannerCoordinator {
    client: Arc<Client>,
    tables: Arc<Tables>,
}

impl SpannerCoordinator {
    pub fn builder() -> SpannerBuilder {
        SpannerBuilder::new()
    }

    /// The session currently recorded as holding `key`, live or not.
    pub async fn holder(&self, key: &str) -> anyhow::Result<Option<String>> {
        let mut stmt = Statement::new(format!(
            "select session from {} where name = @name",
            self.tables.locks
        ));
        stmt.add_param("name", &key.to_string());
        let mut tx = self.client.single().await?;
        let mut iter = tx.query(stmt).await?;
        if let Some(row) = iter.next().await? {
            return Ok(row.column_by_name::<Option<String>>("session")?);
        }
        Ok(None)
    }

    /// Removes every Spanner session held by the client. Sessions and locks
    /// still open here are left to expire.
    pub async fn close(self) {
        match Arc::try_unwrap(self.client) {
            Ok(client) => client.close().await,
            Err(_) => warn!("spanner client still in use, not closing"),
        }
    }
}

#[async_trait]
impl Coordinator for SpannerCoordinator {
    type Session = SpannerSession;

    async fn create_session(&self, ttl: Duration) -> anyhow::Result<SpannerSession> {
        let id = Uuid::new_v4().to_string();
        let mut stmt = Statement::new(format!(
            "insert into {} (id, ttl_ms, heartbeat) values (@id, @ttl, PENDING_COMMIT_TIMESTAMP())",
            self.tables.sessions
        ));
        stmt.add_param("id", &id);
        stmt.add_param("ttl", &i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX));
        exec(&self.client, stmt).await?;

        let done = CancellationToken::new();
        tokio::spawn(heartbeat(
            self.client.clone(),
            self.tables.clone(),
            id.clone(),
            ttl,
            done.clone(),
        ));
        debug!("session created: {id}, ttl={ttl:?}");

        Ok(SpannerSession {
            client: self.client.clone(),
            tables: self.tables.clone(),
            id,
            done,
        })
    }
}

async fn heartbeat(
    client: Arc<Client>,
    tables: Arc<Tables>,
    id: String,
    ttl: Duration,
    done: CancellationToken,
) {
    let ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(2);
    let min = (ms / 10) * 5;
    let max = (ms / 10) * 8;

    // The backoff is unit-agnostic; its values are used as milliseconds.
    let mut bo = BackoffBuilder::new().initial_ns(min).max_ns(max).build();
    let mut last_ok = Instant::now();
    loop {
        let pause = loop {
            let tmp = bo.pause();
            if tmp >= min {
                break tmp.min(max);
            }
        };

        tokio::select! {
            _ = done.cancelled() => return,
            _ = sleep(Duration::from_millis(pause)) => {}
        }

        let mut stmt = Statement::new(format!(
            "update {} set heartbeat = PENDING_COMMIT_TIMESTAMP() where id = @id",
            tables.sessions
        ));
        stmt.add_param("id", &id);
        match exec(&client, stmt).await {
            Ok(0) => {
                warn!("session row gone: {id}");
                done.cancel();
                return;
            }
            Ok(_) => last_ok = Instant::now(),
            Err(e) => {
                warn!("heartbeat failed: session={id}: {e}");
                if last_ok.elapsed() >= ttl {
                    warn!("session expired: {id}");
                    done.cancel();
                    return;
                }
            }
        }
    }
}

pub struct SpannerSession {
    client: Arc<Client>,
    tables: Arc<Tables>,
    id: String,
    done: CancellationToken,
}

#[async_trait]
impl Session for SpannerSession {
    type Mutex = SpannerMutex;

    fn id(&self) -> &str {
        &self.id
    }

    fn done(&self) -> CancellationToken {
        self.done.clone()
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.done.cancel();

        let mut stmt = Statement::new(format!(
            "update {} set session = NULL where session = @id",
            self.tables.locks
        ));
        stmt.add_param("id", &self.id);
        exec(&self.client, stmt).await?;

        let mut stmt = Statement::new(format!(
            "delete from {} where id = @id",
            self.tables.sessions
        ));
        stmt.add_param("id", &self.id);
        exec(&self.client, stmt).await?;
        Ok(())
    }

    fn mutex(&self, key: &str) -> SpannerMutex {
        SpannerMutex {
            client: self.client.clone(),
            tables: self.tables.clone(),
            session: self.id.clone(),
            key: key.to_string(),
            done: self.done.clone(),
        }
    }
}

pub struct SpannerMutex {
    client: Arc<Client>,
    tables: Arc<Tables>,
    session: String,
    key: String,
    done: CancellationToken,
}

impl SpannerMutex {
    async fn claim(&self) -> anyhow::Result<bool> {
        let mut stmt = Statement::new(format!(
            "insert or ignore into {} (name, session, token) \
             values (@name, @session, PENDING_COMMIT_TIMESTAMP())",
            self.tables.locks
        ));
        stmt.add_param("name", &self.key);
        stmt.add_param("session", &self.session);
        if exec(&self.client, stmt).await? == 1 {
            return Ok(true);
        }

        // Take over a row that is free, already ours, or held by a session
        // whose heartbeat is older than its TTL.
        let mut stmt = Statement::new(format!(
            "update {locks} set session = @session, token = PENDING_COMMIT_TIMESTAMP() \
             where name = @name and (session is null or session = @session or session not in \
             (select id from {sessions} \
             where timestamp_diff(current_timestamp(), heartbeat, millisecond) < ttl_ms))",
            locks = self.tables.locks,
            sessions = self.tables.sessions,
        ));
        stmt.add_param("name", &self.key);
        stmt.add_param("session", &self.session);
        Ok(exec(&self.client, stmt).await? == 1)
    }
}

#[async_trait]
impl Mutex for SpannerMutex {
    fn key(&self) -> &str {
        &self.key
    }

    async fn lock(&self) -> anyhow::Result<()> {
        let mut bo = BackoffBuilder::new()
            .initial_ns(POLL_MIN_MS)
            .max_ns(POLL_MAX_MS)
            .build();
        loop {
            if self.done.is_cancelled() {
                bail!("session closed");
            }
            if self.claim().await? {
                return Ok(());
            }

            let pause = bo.pause().clamp(POLL_MIN_MS, POLL_MAX_MS);
            tokio::select! {
                _ = self.done.cancelled() => bail!("session closed"),
                _ = sleep(Duration::from_millis(pause)) => {}
            }
        }
    }

    async fn unlock(&self) -> anyhow::Result<()> {
        let mut stmt = Statement::new(format!(
            "update {} set session = NULL where name = @name and session = @session",
            self.tables.locks
        ));
        stmt.add_param("name", &self.key);
        stmt.add_param("session", &self.session);
        exec(&self.client, stmt).await?;
        Ok(())
    }
}
