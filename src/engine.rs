//! The storage engine: one instance per application, passed by reference to
//! whatever needs to read or write persisted data.
//!
//! Every operation that touches the database file goes through the
//! [`OperationQueue`], so loads, saves, backups and restores observe a single
//! total order.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tokio::task;
use tracing::{debug, info, warn};

use crate::config::StorageConfig;
use crate::db::backup::{
    AutoBackupOutcome, BackupInfo, BackupService, CreateBackupResult, DeleteBackupResult,
    RestoreOptions, RestoreResult,
};
use crate::db::connection::{ConnState, ConnectionManager};
use crate::db::health::{self, DbHealthCheck};
use crate::db::metadata::BackupKind;
use crate::db::queue::OperationQueue;
use crate::db::schema::read_schema_version;
use crate::db::{run_in_tx, write_atomic};
use crate::environment::Environment;
use crate::migrations::MigrationRegistry;
use crate::models::{AppData, ExpensesState, IncomeState, NotesState, SaveScope};
use crate::scheduler::AutoBackupScheduler;
use crate::store::cache::{ChangeSummary, Snapshot, StorageCache};
use crate::store::expenses::ExpenseExport;
use crate::store::{expenses, income, notes, settings};
use crate::{AppError, AppResult};

const PARTS: [SaveScope; 4] = [
    SaveScope::Notes,
    SaveScope::Expenses,
    SaveScope::Income,
    SaveScope::Settings,
];

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeReport {
    pub scope: SaveScope,
    pub changed: bool,
    pub summary: ChangeSummary,
}

/// What a save did. `written` is false when change detection found nothing
/// to persist.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveReport {
    pub written: bool,
    pub scopes: Vec<ScopeReport>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageStatus {
    pub environment: Environment,
    pub db_path: PathBuf,
    pub backup_dir: PathBuf,
    pub connection: ConnState,
    pub schema_version: Option<String>,
    pub last_saved: Option<String>,
    pub health: DbHealthCheck,
    pub notes: i64,
    pub expenses: i64,
    pub income: i64,
    pub pending_operations: usize,
}

#[derive(Debug, Default)]
struct PendingWrite {
    notes: Option<NotesState>,
    expenses: Option<ExpensesState>,
    income: Option<IncomeState>,
    settings: Option<BTreeMap<String, Value>>,
}

#[derive(Debug)]
struct EngineInner {
    config: StorageConfig,
    connections: ConnectionManager,
    queue: OperationQueue,
    cache: Mutex<StorageCache>,
    registry: Arc<MigrationRegistry>,
    backups: BackupService,
    write_transactions: AtomicU64,
}

#[derive(Debug, Clone)]
pub struct StorageEngine {
    inner: Arc<EngineInner>,
}

impl StorageEngine {
    pub fn new(config: StorageConfig) -> Self {
        Self::with_registry(config, MigrationRegistry::builtin())
    }

    pub fn with_registry(config: StorageConfig, registry: MigrationRegistry) -> Self {
        let registry = Arc::new(registry);
        let connections = ConnectionManager::new(config.clone());
        let backups = BackupService::new(connections.clone(), Arc::clone(&registry));
        Self {
            inner: Arc::new(EngineInner {
                queue: OperationQueue::new(config.queue_timeout),
                config,
                connections,
                cache: Mutex::new(StorageCache::default()),
                registry,
                backups,
                write_transactions: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &StorageConfig {
        &self.inner.config
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.inner.connections
    }

    pub fn registry(&self) -> &MigrationRegistry {
        &self.inner.registry
    }

    pub fn environment(&self) -> Environment {
        self.inner.connections.environment()
    }

    pub fn db_path(&self) -> PathBuf {
        self.inner.connections.active_db_path()
    }

    pub fn backup_dir(&self) -> &Path {
        self.inner.backups.backup_dir()
    }

    /// Write transactions committed by saves since the engine was built.
    pub fn write_transactions(&self) -> u64 {
        self.inner.write_transactions.load(Ordering::SeqCst)
    }

    /// Load every collection, retrying transient failures with the handle
    /// closed and reopened between attempts.
    pub async fn load_data(&self) -> AppResult<AppData> {
        let attempts = self.inner.config.load_retries.max(1);
        let mut attempt = 1;
        loop {
            let inner = Arc::clone(&self.inner);
            let loaded = self
                .inner
                .queue
                .run("load_data", move || async move { inner.load().await })
                .await;
            match loaded {
                Ok(data) => return Ok(data),
                Err(err) if err.is_transient() && attempt < attempts => {
                    warn!(
                        target: "keepsake",
                        event = "load_retry",
                        attempt,
                        attempts,
                        code = %err.code(),
                        error = %err
                    );
                    self.inner.connections.close_now().await;
                    tokio::time::sleep(self.inner.config.load_retry_delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err.with_context("attempts", attempt.to_string())),
            }
        }
    }

    /// Persist the parts of `data` selected by `scope` that differ from the
    /// last load or save.
    pub async fn save_data(&self, data: AppData, scope: SaveScope) -> AppResult<SaveReport> {
        let inner = Arc::clone(&self.inner);
        self.inner
            .queue
            .run("save_data", move || async move { inner.save(data, scope).await })
            .await
    }

    pub async fn create_backup(&self, description: Option<String>) -> AppResult<CreateBackupResult> {
        let inner = Arc::clone(&self.inner);
        self.inner
            .queue
            .run("create_backup", move || async move {
                Ok(inner.backups.create_backup(description, BackupKind::Manual).await)
            })
            .await
    }

    pub async fn list_backups(&self) -> AppResult<Vec<BackupInfo>> {
        self.inner.backups.list_backups().await
    }

    pub async fn restore_from_backup(
        &self,
        filename: &str,
        options: RestoreOptions,
    ) -> AppResult<RestoreResult> {
        let inner = Arc::clone(&self.inner);
        let filename = filename.to_string();
        self.inner
            .queue
            .run("restore_backup", move || async move {
                let result = inner.backups.restore_from_backup(&filename, options).await;
                if result.success {
                    inner.cache().clear();
                }
                Ok(result)
            })
            .await
    }

    pub async fn delete_backup(&self, filename: &str) -> AppResult<DeleteBackupResult> {
        let inner = Arc::clone(&self.inner);
        let filename = filename.to_string();
        self.inner
            .queue
            .run("delete_backup", move || async move {
                Ok(inner.backups.delete_backup(&filename))
            })
            .await
    }

    /// One scheduler tick: back up if overdue, then trim old auto backups.
    pub async fn run_auto_backup(&self) -> AppResult<AutoBackupOutcome> {
        let inner = Arc::clone(&self.inner);
        self.inner
            .queue
            .run("auto_backup", move || async move {
                inner
                    .backups
                    .run_auto_backup_tick(Utc::now(), &inner.config.auto_backup)
                    .await
            })
            .await
    }

    pub async fn cleanup_auto_backups(&self, max: usize) -> AppResult<usize> {
        let inner = Arc::clone(&self.inner);
        self.inner
            .queue
            .run("cleanup_auto_backups", move || async move {
                inner.backups.cleanup_auto_backups(max).await
            })
            .await
    }

    /// Start the periodic auto-backup task, unless disabled in config.
    pub fn start_auto_backup(&self) -> Option<AutoBackupScheduler> {
        let auto = &self.inner.config.auto_backup;
        if !auto.enabled {
            info!(target: "keepsake", event = "auto_backup_disabled");
            return None;
        }
        Some(AutoBackupScheduler::spawn(self.clone(), auto.interval))
    }

    pub async fn switch_environment(&self, environment: Environment) -> AppResult<()> {
        let inner = Arc::clone(&self.inner);
        self.inner
            .queue
            .run("switch_environment", move || async move {
                inner.connections.switch_environment(environment).await;
                inner.cache().clear();
                Ok(())
            })
            .await
    }

    pub async fn reinitialize(&self) -> AppResult<()> {
        let inner = Arc::clone(&self.inner);
        self.inner
            .queue
            .run("reinitialize", move || async move {
                inner.connections.reinitialize().await;
                inner.cache().clear();
                Ok(())
            })
            .await
    }

    /// Write the current expenses as a portable JSON document.
    pub async fn export_expenses_to_json(&self, path: &Path) -> AppResult<ExpenseExport> {
        let inner = Arc::clone(&self.inner);
        let path = path.to_path_buf();
        self.inner
            .queue
            .run("export_expenses", move || async move {
                let environment = inner.connections.environment();
                let lease = inner.connections.acquire().await?;
                let state = run_in_tx(lease.pool(), |conn| {
                    Box::pin(async move { expenses::load(conn).await })
                })
                .await?;
                drop(lease);

                let export = ExpenseExport::from_state(&state, environment);
                let payload = serde_json::to_vec_pretty(&export)?;
                let target = path.clone();
                task::spawn_blocking(move || write_atomic(&target, &payload))
                    .await
                    .map_err(|err| {
                        AppError::new("STORE/TASK", "Export task panicked")
                            .with_context("error", err.to_string())
                    })?
                    .map_err(|err| {
                        AppError::from(err)
                            .with_context("operation", "write_expense_export")
                            .with_context("path", path.display().to_string())
                    })?;
                info!(
                    target: "keepsake",
                    event = "expenses_exported",
                    path = %path.display(),
                    count = export.expenses.len()
                );
                Ok(export)
            })
            .await
    }

    /// Read an expense export of any known version and save it as the
    /// current expense collection.
    pub async fn import_expenses_from_json(&self, path: &Path) -> AppResult<SaveReport> {
        let raw = {
            let owned = path.to_path_buf();
            task::spawn_blocking(move || fs::read_to_string(&owned))
                .await
                .map_err(|err| {
                    AppError::new("STORE/TASK", "Import task panicked")
                        .with_context("error", err.to_string())
                })?
                .map_err(|err| {
                    AppError::from(err)
                        .with_context("operation", "read_expense_export")
                        .with_context("path", path.display().to_string())
                })?
        };
        let export = ExpenseExport::parse(&raw, &self.inner.registry)?;
        info!(
            target: "keepsake",
            event = "expenses_import_parsed",
            path = %path.display(),
            source_version = %export.version,
            count = export.expenses.len()
        );
        let data = AppData {
            expenses: export.into_state(),
            ..AppData::default()
        };
        self.save_data(data, SaveScope::Expenses).await
    }

    pub async fn status(&self) -> AppResult<StorageStatus> {
        let inner = Arc::clone(&self.inner);
        self.inner
            .queue
            .run("status", move || async move { inner.status().await })
            .await
    }
}

impl EngineInner {
    fn cache(&self) -> MutexGuard<'_, StorageCache> {
        self.cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn load(&self) -> AppResult<AppData> {
        let lease = self.connections.acquire().await?;
        let data = run_in_tx(lease.pool(), |conn| {
            Box::pin(async move {
                let notes = notes::load(conn).await?;
                let expenses = expenses::load(conn).await?;
                let income = income::load(conn).await?;
                let settings = settings::load_app_settings(conn).await?;
                Ok(AppData {
                    notes,
                    expenses,
                    income,
                    settings,
                })
            })
        })
        .await?;
        drop(lease);

        let snapshots = [
            (SaveScope::Notes, notes::snapshot(&data.notes)?),
            (SaveScope::Expenses, expenses::snapshot(&data.expenses)?),
            (SaveScope::Income, income::snapshot(&data.income)?),
            (SaveScope::Settings, settings_snapshot(&data.settings)),
        ];
        let mut cache = self.cache();
        for (scope, snapshot) in snapshots {
            cache.store(scope, snapshot);
        }
        drop(cache);

        info!(
            target: "keepsake",
            event = "data_loaded",
            notes = data.notes.notes.len(),
            folders = data.notes.folders.len(),
            expenses = data.expenses.expenses.len(),
            income = data.income.entries.len()
        );
        Ok(data)
    }

    async fn save(&self, data: AppData, scope: SaveScope) -> AppResult<SaveReport> {
        let mut pending = PendingWrite::default();
        let mut fresh: Vec<(SaveScope, Snapshot)> = Vec::new();
        let mut reports = Vec::new();

        {
            let cache = self.cache();
            for part in PARTS.into_iter().filter(|part| scope.includes(*part)) {
                let snapshot = match part {
                    SaveScope::Notes => {
                        let state = notes::prepare(&data.notes)?;
                        let snapshot = notes::snapshot(&state)?;
                        pending.notes = Some(state);
                        snapshot
                    }
                    SaveScope::Expenses => {
                        let (state, _) = expenses::prepare(&data.expenses);
                        let snapshot = expenses::snapshot(&state)?;
                        pending.expenses = Some(state);
                        snapshot
                    }
                    SaveScope::Income => {
                        let state = income::prepare(&data.income);
                        let snapshot = income::snapshot(&state)?;
                        pending.income = Some(state);
                        snapshot
                    }
                    SaveScope::Settings | SaveScope::All => {
                        pending.settings = Some(data.settings.clone());
                        settings_snapshot(&data.settings)
                    }
                };
                let summary = snapshot.diff(cache.get(part));
                let changed = summary.has_changes();
                if changed {
                    debug!(
                        target: "keepsake",
                        event = "save_changes_detected",
                        scope = part.as_str(),
                        added = summary.added.len(),
                        removed = summary.removed.len(),
                        modified = summary.modified.len(),
                        extras_changed = summary.extras_changed
                    );
                    fresh.push((part, snapshot));
                } else {
                    pending.discard(part);
                }
                reports.push(ScopeReport {
                    scope: part,
                    changed,
                    summary,
                });
            }
        }

        if fresh.is_empty() {
            debug!(target: "keepsake", event = "save_skipped_unchanged", scope = scope.as_str());
            return Ok(SaveReport {
                written: false,
                scopes: reports,
            });
        }

        let lease = self.connections.acquire().await?;
        let last_saved = run_in_tx(lease.pool(), move |conn| {
            Box::pin(async move {
                if let Some(state) = &pending.notes {
                    notes::persist(conn, state).await?;
                }
                if let Some(state) = &pending.expenses {
                    expenses::persist(conn, state).await?;
                }
                if let Some(state) = &pending.income {
                    income::persist(conn, state).await?;
                }
                if let Some(state) = &pending.settings {
                    settings::persist_app_settings(conn, state).await?;
                }
                settings::touch_last_saved(conn).await
            })
        })
        .await?;
        drop(lease);
        self.write_transactions.fetch_add(1, Ordering::SeqCst);

        let written_scopes: Vec<&'static str> = fresh.iter().map(|(part, _)| part.as_str()).collect();
        let mut cache = self.cache();
        for (part, snapshot) in fresh {
            cache.store(part, snapshot);
        }
        drop(cache);

        info!(
            target: "keepsake",
            event = "data_saved",
            scope = scope.as_str(),
            written = ?written_scopes,
            last_saved = %last_saved
        );
        Ok(SaveReport {
            written: true,
            scopes: reports,
        })
    }

    async fn status(&self) -> AppResult<StorageStatus> {
        let environment = self.connections.environment();
        let lease = self.connections.acquire().await?;
        let schema_version = read_schema_version(lease.pool()).await?;
        let health = health::run_quick_check(lease.pool()).await;
        let (last_saved, notes, expenses, income) = run_in_tx(lease.pool(), |conn| {
            Box::pin(async move {
                let last_saved = settings::read_last_saved(conn).await?;
                let notes = notes::count(conn).await?;
                let expenses = expenses::count(conn).await?;
                let income = income::count(conn).await?;
                Ok((last_saved, notes, expenses, income))
            })
        })
        .await?;
        let connection = self.connections.state();
        drop(lease);

        Ok(StorageStatus {
            environment,
            db_path: self.connections.active_db_path(),
            backup_dir: self.backups.backup_dir().to_path_buf(),
            connection,
            schema_version,
            last_saved,
            health,
            notes,
            expenses,
            income,
            pending_operations: self.queue.pending(),
        })
    }
}

impl PendingWrite {
    fn discard(&mut self, part: SaveScope) {
        match part {
            SaveScope::Notes => self.notes = None,
            SaveScope::Expenses => self.expenses = None,
            SaveScope::Income => self.income = None,
            SaveScope::Settings => self.settings = None,
            SaveScope::All => {}
        }
    }
}

fn settings_snapshot(settings: &BTreeMap<String, Value>) -> Snapshot {
    Snapshot::from_extras(Value::Object(
        settings
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{IncomeEntry, Note};
    use chrono::NaiveDate;
    use serde_json::json;
    use tempfile::tempdir;

    fn engine_in(dir: &Path) -> StorageEngine {
        let mut config = StorageConfig::new(dir).with_environment(Environment::Test);
        config.idle_close_delay = std::time::Duration::from_millis(20);
        StorageEngine::new(config)
    }

    #[tokio::test]
    async fn unchanged_scope_skips_the_write() {
        let dir = tempdir().unwrap();
        let engine = engine_in(dir.path());
        let mut data = engine.load_data().await.unwrap();
        data.notes.notes.push(Note::new("n1", "Groceries", "{}"));

        let first = engine.save_data(data.clone(), SaveScope::Notes).await.unwrap();
        assert!(first.written);
        let second = engine.save_data(data, SaveScope::Notes).await.unwrap();
        assert!(!second.written);
        assert_eq!(engine.write_transactions(), 1);
    }

    #[tokio::test]
    async fn scope_limits_what_is_compared() {
        let dir = tempdir().unwrap();
        let engine = engine_in(dir.path());
        let mut data = engine.load_data().await.unwrap();
        data.income.entries.push(IncomeEntry {
            id: "i1".into(),
            date: NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(),
            amount: 120.0,
            hours: Some(4),
            minutes: None,
        });
        data.settings.insert("theme".into(), json!("dark"));

        let report = engine.save_data(data.clone(), SaveScope::Income).await.unwrap();
        assert!(report.written);
        assert_eq!(report.scopes.len(), 1);
        assert_eq!(report.scopes[0].scope, SaveScope::Income);

        let reloaded = engine.load_data().await.unwrap();
        assert_eq!(reloaded.income.entries.len(), 1);
        assert!(reloaded.settings.is_empty());
    }

    #[tokio::test]
    async fn failed_save_leaves_cache_untouched() {
        let dir = tempdir().unwrap();
        let engine = engine_in(dir.path());
        let mut data = engine.load_data().await.unwrap();
        data.notes.notes.push(Note::new("dup", "One", "{}"));
        data.notes.notes.push(Note::new("dup", "Two", "{}"));

        let err = engine.save_data(data, SaveScope::Notes).await.unwrap_err();
        assert_eq!(err.code(), "VALIDATION/DUPLICATE_ID");
        assert_eq!(engine.write_transactions(), 0);
    }

    #[tokio::test]
    async fn status_reports_counts_and_version() {
        let dir = tempdir().unwrap();
        let engine = engine_in(dir.path());
        let mut data = engine.load_data().await.unwrap();
        data.notes.notes.push(Note::new("n1", "A", "{}"));
        engine.save_data(data, SaveScope::All).await.unwrap();

        let status = engine.status().await.unwrap();
        assert_eq!(status.environment, Environment::Test);
        assert_eq!(status.notes, 1);
        assert_eq!(status.schema_version.as_deref(), Some(crate::migrations::SCHEMA_VERSION));
        assert!(status.health.passed);
        assert!(status.last_saved.is_some());
    }
}
