use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use serde::Serialize;
use sqlx::SqlitePool;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::StorageConfig;
use crate::db::schema::SchemaManager;
use crate::db::{checkpoint, open_sqlite_pool};
use crate::environment::Environment;
use crate::AppResult;

/// Lifecycle of the single database handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnState {
    Idle,
    Opening,
    Open,
    ClosingScheduled,
    Closed,
}

#[derive(Debug)]
struct Inner {
    state: ConnState,
    pool: Option<SqlitePool>,
    db_path: Option<PathBuf>,
    ref_count: usize,
    /// Bumped whenever a pending close is cancelled or replaced; a close task
    /// only acts when its generation is still current.
    close_generation: u64,
    pending_close: Option<JoinHandle<()>>,
    environment: Option<Environment>,
    schema_verified: bool,
}

impl Inner {
    fn cancel_pending_close(&mut self) {
        self.close_generation = self.close_generation.wrapping_add(1);
        if let Some(handle) = self.pending_close.take() {
            handle.abort();
            debug!(target: "keepsake", event = "db_idle_close_cancelled");
        }
        if self.state == ConnState::ClosingScheduled {
            self.state = ConnState::Open;
        }
    }

    fn ready_pool(&self) -> Option<SqlitePool> {
        match self.state {
            ConnState::Open | ConnState::ClosingScheduled => self.pool.clone(),
            _ => None,
        }
    }
}

#[derive(Debug)]
struct Shared {
    config: StorageConfig,
    inner: Mutex<Inner>,
    /// Serializes open and close so a close never races an open.
    open_lock: tokio::sync::Mutex<()>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn resolve_environment(&self, inner: &mut Inner) -> Environment {
        *inner
            .environment
            .get_or_insert_with(|| self.config.environment.unwrap_or_else(Environment::detect))
    }
}

/// Owns the one database handle: opens it lazily, reference counts callers
/// and closes it after an idle grace period.
#[derive(Debug, Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

/// Keeps the handle counted as in use until dropped.
#[derive(Debug)]
struct Claim {
    shared: Arc<Shared>,
}

impl Drop for Claim {
    fn drop(&mut self) {
        release(&self.shared);
    }
}

#[derive(Debug)]
pub struct ConnectionLease {
    pool: SqlitePool,
    _claim: Claim,
}

impl ConnectionLease {
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

impl ConnectionManager {
    pub fn new(config: StorageConfig) -> Self {
        let environment = config.environment;
        Self {
            shared: Arc::new(Shared {
                config,
                inner: Mutex::new(Inner {
                    state: ConnState::Idle,
                    pool: None,
                    db_path: None,
                    ref_count: 0,
                    close_generation: 0,
                    pending_close: None,
                    environment,
                    schema_verified: false,
                }),
                open_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn config(&self) -> &StorageConfig {
        &self.shared.config
    }

    pub fn state(&self) -> ConnState {
        self.shared.lock().state
    }

    pub fn ref_count(&self) -> usize {
        self.shared.lock().ref_count
    }

    pub fn is_open(&self) -> bool {
        self.shared.lock().ready_pool().is_some()
    }

    pub fn is_schema_verified(&self) -> bool {
        self.shared.lock().schema_verified
    }

    /// The active environment. Chosen once, on first use, unless switched.
    pub fn environment(&self) -> Environment {
        let mut inner = self.shared.lock();
        self.shared.resolve_environment(&mut inner)
    }

    pub fn active_db_path(&self) -> PathBuf {
        let environment = self.environment();
        self.shared.config.db_path(environment)
    }

    /// Count a caller in and hand out the open handle, opening it first if
    /// needed. Cancels any pending idle close.
    pub async fn acquire(&self) -> AppResult<ConnectionLease> {
        {
            let mut inner = self.shared.lock();
            inner.ref_count += 1;
            inner.cancel_pending_close();
        }
        let claim = Claim {
            shared: Arc::clone(&self.shared),
        };
        let pool = self.ensure_open().await?;
        Ok(ConnectionLease {
            pool,
            _claim: claim,
        })
    }

    pub async fn with_connection<F, Fut, R>(&self, f: F) -> AppResult<R>
    where
        F: FnOnce(SqlitePool) -> Fut,
        Fut: Future<Output = AppResult<R>>,
    {
        let lease = self.acquire().await?;
        let result = f(lease.pool().clone()).await;
        drop(lease);
        result
    }

    async fn ensure_open(&self) -> AppResult<SqlitePool> {
        if let Some(pool) = self.shared.lock().ready_pool() {
            return Ok(pool);
        }
        let _open = self.shared.open_lock.lock().await;
        let environment = {
            let mut inner = self.shared.lock();
            if let Some(pool) = inner.ready_pool() {
                return Ok(pool);
            }
            inner.state = ConnState::Opening;
            inner.schema_verified = false;
            self.shared.resolve_environment(&mut inner)
        };
        let db_path = self.shared.config.db_path(environment);

        let opened = async {
            let pool = open_sqlite_pool(&db_path).await?;
            if let Err(err) = SchemaManager::ensure_schema(&pool).await {
                pool.close().await;
                return Err(err);
            }
            Ok(pool)
        }
        .await;

        let mut inner = self.shared.lock();
        match opened {
            Ok(pool) => {
                inner.pool = Some(pool.clone());
                inner.db_path = Some(db_path.clone());
                inner.state = ConnState::Open;
                inner.schema_verified = true;
                info!(
                    target: "keepsake",
                    event = "db_connection_open",
                    environment = %environment,
                    path = %db_path.display()
                );
                Ok(pool)
            }
            Err(err) => {
                inner.pool = None;
                inner.db_path = None;
                inner.state = ConnState::Closed;
                error!(
                    target: "keepsake",
                    event = "db_connection_open_failed",
                    environment = %environment,
                    path = %db_path.display(),
                    error = %err
                );
                Err(err.with_context("environment", environment.as_str()))
            }
        }
    }

    /// Close the handle immediately, regardless of outstanding callers.
    /// The next acquire reopens and re-verifies the schema.
    pub async fn close_now(&self) {
        let _open = self.shared.open_lock.lock().await;
        let pool = {
            let mut inner = self.shared.lock();
            inner.cancel_pending_close();
            inner.schema_verified = false;
            inner.db_path = None;
            if inner.pool.is_some() {
                inner.state = ConnState::Closed;
            }
            inner.pool.take()
        };
        if let Some(pool) = pool {
            close_pool(pool, "forced").await;
        }
    }

    /// Point the engine at a different database file.
    pub async fn switch_environment(&self, environment: Environment) {
        self.close_now().await;
        let previous = {
            let mut inner = self.shared.lock();
            inner.environment.replace(environment)
        };
        info!(
            target: "keepsake",
            event = "db_environment_switched",
            from = previous.map(Environment::as_str).unwrap_or("unset"),
            to = environment.as_str()
        );
    }

    pub async fn reinitialize(&self) {
        self.close_now().await;
        info!(target: "keepsake", event = "db_reinitialize");
    }
}

fn release(shared: &Arc<Shared>) {
    let mut inner = shared.lock();
    inner.ref_count = inner.ref_count.saturating_sub(1);
    if inner.ref_count > 0 || inner.state != ConnState::Open {
        return;
    }
    let Ok(runtime) = Handle::try_current() else {
        // No runtime to run the timer on; the handle stays open until the
        // next explicit close.
        warn!(target: "keepsake", event = "db_idle_close_skipped", reason = "no_runtime");
        return;
    };
    inner.cancel_pending_close();
    let generation = inner.close_generation;
    let delay = shared.config.idle_close_delay;
    let weak: Weak<Shared> = Arc::downgrade(shared);
    inner.state = ConnState::ClosingScheduled;
    inner.pending_close = Some(runtime.spawn(async move {
        tokio::time::sleep(delay).await;
        if let Some(shared) = weak.upgrade() {
            close_if_idle(&shared, generation).await;
        }
    }));
    debug!(
        target: "keepsake",
        event = "db_idle_close_scheduled",
        delay_ms = delay.as_millis() as u64
    );
}

async fn close_if_idle(shared: &Shared, generation: u64) {
    let _open = shared.open_lock.lock().await;
    let pool = {
        let mut inner = shared.lock();
        let current = inner.close_generation == generation
            && inner.ref_count == 0
            && inner.state == ConnState::ClosingScheduled;
        if !current {
            return;
        }
        inner.pending_close = None;
        inner.state = ConnState::Closed;
        inner.schema_verified = false;
        inner.db_path = None;
        inner.pool.take()
    };
    if let Some(pool) = pool {
        close_pool(pool, "idle").await;
    }
}

async fn close_pool(pool: SqlitePool, reason: &'static str) {
    if let Err(err) = checkpoint(&pool).await {
        warn!(target: "keepsake", event = "db_close_checkpoint_failed", error = %err);
    }
    pool.close().await;
    info!(target: "keepsake", event = "db_connection_closed", reason);
}
