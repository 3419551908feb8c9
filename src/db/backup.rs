use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use fs2::available_space;
use rusqlite::{backup::Backup, Connection, OpenFlags, OptionalExtension};
use serde::Serialize;
use tokio::task;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::AutoBackupConfig;
use crate::db::connection::ConnectionManager;
use crate::db::metadata::{
    self, backup_file_name, export_path, metadata_path, parse_backup_file_name,
    validate_backup_file_name, BackupKind, BackupMetadata, DB_EXTENSION,
};
use crate::db::schema::read_schema_version;
use crate::db::{checkpoint, health, journal_bytes, run_in_tx, sidecar_path, swap, sync_dir, write_atomic};
use crate::environment::Environment;
use crate::migrations::{compare_versions, MigrationRegistry, LEGACY_BACKUP_VERSION, SCHEMA_VERSION};
use crate::store::expenses::{self, ExpenseExport};
use crate::time::now_ms;
use crate::{AppError, AppResult};

const PARTIAL_SUFFIX: &str = ".partial";
const REQUIRED_FREE_MULTIPLIER: f64 = 1.2;
const EMPTY_DB_REQUIRED_BYTES: u64 = 100_000_000;
const MAX_NAME_ATTEMPTS: i64 = 100;
const SAFETY_BACKUP_DESCRIPTION: &str = "Automatic backup before restore";
const AUTO_BACKUP_DESCRIPTION: &str = "Automatic backup";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupInfo {
    pub filename: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    /// False for backups that predate metadata sidecars; their metadata was
    /// reconstructed from the file name.
    pub has_metadata_file: bool,
    pub metadata: BackupMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateBackupResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup: Option<BackupInfo>,
}

impl CreateBackupResult {
    fn failed(err: &AppError) -> Self {
        Self {
            success: false,
            error: Some(err.message().to_string()),
            error_code: Some(err.code().to_string()),
            backup: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreOptions {
    /// Allow a test backup to replace production data.
    pub skip_environment_check: bool,
    pub skip_safety_backup: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    pub requires_migration: bool,
    pub source_version: Option<String>,
    pub target_version: String,
    /// File name of the pre-restore safety backup, when one was taken.
    pub safety_backup: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteBackupResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub removed_files: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoBackupOutcome {
    pub created: Option<BackupInfo>,
    pub removed: usize,
}

/// Creates, lists, restores and deletes point-in-time copies of the live
/// database.
#[derive(Debug, Clone)]
pub struct BackupService {
    connections: ConnectionManager,
    registry: Arc<MigrationRegistry>,
    backup_dir: PathBuf,
    export_expenses: bool,
}

struct CreateJob {
    db_path: PathBuf,
    backup_dir: PathBuf,
    environment: Environment,
    kind: BackupKind,
    description: Option<String>,
    version: String,
    export: Option<ExpenseExport>,
}

impl BackupService {
    pub fn new(connections: ConnectionManager, registry: Arc<MigrationRegistry>) -> Self {
        let config = connections.config();
        let backup_dir = config.resolved_backup_dir();
        let export_expenses = config.export_expenses_on_backup;
        Self {
            connections,
            registry,
            backup_dir,
            export_expenses,
        }
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    pub async fn create_backup(
        &self,
        description: Option<String>,
        kind: BackupKind,
    ) -> CreateBackupResult {
        match self.try_create(description, kind).await {
            Ok(info) => {
                info!(
                    target: "keepsake",
                    event = "backup_created",
                    file = %info.filename,
                    kind = ?info.metadata.kind,
                    environment = %info.metadata.environment,
                    size_bytes = info.size_bytes
                );
                CreateBackupResult {
                    success: true,
                    error: None,
                    error_code: None,
                    backup: Some(info),
                }
            }
            Err(err) => {
                warn!(
                    target: "keepsake",
                    event = "backup_create_failed",
                    code = %err.code(),
                    error = %err
                );
                CreateBackupResult::failed(&err)
            }
        }
    }

    async fn try_create(&self, description: Option<String>, kind: BackupKind) -> AppResult<BackupInfo> {
        let environment = self.connections.environment();
        let db_path = self.connections.active_db_path();
        if !db_path.exists() {
            return Err(AppError::new(
                "DB_BACKUP/SOURCE_MISSING",
                "source database does not exist",
            )
            .with_context("path", db_path.display().to_string()));
        }

        let lease = self.connections.acquire().await?;
        checkpoint(lease.pool()).await?;
        let version = read_schema_version(lease.pool())
            .await?
            .unwrap_or_else(|| SCHEMA_VERSION.to_string());
        let export = if self.export_expenses {
            let loaded = run_in_tx(lease.pool(), |conn| {
                Box::pin(async move { expenses::load(conn).await })
            })
            .await;
            match loaded {
                Ok(state) => Some(ExpenseExport::from_state(&state, environment)),
                Err(err) => {
                    warn!(target: "keepsake", event = "backup_export_skipped", error = %err);
                    None
                }
            }
        } else {
            None
        };

        let job = CreateJob {
            db_path,
            backup_dir: self.backup_dir.clone(),
            environment,
            kind,
            description,
            version,
            export,
        };
        let created = task::spawn_blocking(move || create_backup_sync(job))
            .await
            .map_err(|err| {
                AppError::new("DB_BACKUP/TASK", "Backup task panicked")
                    .with_context("error", err.to_string())
            })?;
        drop(lease);
        created
    }

    /// Every backup in the directory, newest first.
    pub async fn list_backups(&self) -> AppResult<Vec<BackupInfo>> {
        let dir = self.backup_dir.clone();
        task::spawn_blocking(move || list_backups_sync(&dir))
            .await
            .map_err(|err| {
                AppError::new("DB_BACKUP/TASK", "Backup listing task panicked")
                    .with_context("error", err.to_string())
            })?
    }

    pub async fn restore_from_backup(&self, filename: &str, options: RestoreOptions) -> RestoreResult {
        let mut result = RestoreResult {
            success: false,
            error: None,
            error_code: None,
            requires_migration: false,
            source_version: None,
            target_version: SCHEMA_VERSION.to_string(),
            safety_backup: None,
        };
        match self.try_restore(filename, options, &mut result).await {
            Ok(()) => {
                result.success = true;
                info!(
                    target: "keepsake",
                    event = "backup_restored",
                    file = filename,
                    source_version = result.source_version.as_deref().unwrap_or("unknown"),
                    target_version = %result.target_version,
                    safety_backup = result.safety_backup.as_deref().unwrap_or("none")
                );
            }
            Err(err) => {
                warn!(
                    target: "keepsake",
                    event = "backup_restore_refused",
                    file = filename,
                    code = %err.code(),
                    error = %err
                );
                result.error = Some(err.message().to_string());
                result.error_code = Some(err.code().to_string());
            }
        }
        result
    }

    async fn try_restore(
        &self,
        filename: &str,
        options: RestoreOptions,
        result: &mut RestoreResult,
    ) -> AppResult<()> {
        validate_backup_file_name(filename)?;
        let path = self.backup_dir.join(filename);
        if !path.is_file() {
            return Err(AppError::new("DB_BACKUP/NOT_FOUND", "Backup file does not exist")
                .with_context("file", filename.to_string()));
        }
        let backup = describe_backup(&path)?;
        let metadata = backup.metadata;
        result.source_version = Some(metadata.version.clone());

        let target = self.connections.environment();
        if metadata.environment == Environment::Test
            && target == Environment::Production
            && !options.skip_environment_check
        {
            return Err(AppError::new(
                "DB_BACKUP/ENVIRONMENT_MISMATCH",
                "Refusing to restore a test backup over production data",
            )
            .with_context("backup_environment", metadata.environment.as_str())
            .with_context("target_environment", target.as_str()));
        }

        let same_version = matches!(
            compare_versions(&metadata.version, SCHEMA_VERSION),
            Ok(std::cmp::Ordering::Equal)
        );
        if !same_version && !self.registry.can_migrate(&metadata.version, SCHEMA_VERSION) {
            result.requires_migration = true;
            return Err(AppError::new(
                "DB_BACKUP/INCOMPATIBLE_VERSION",
                format!(
                    "Backup version {} cannot be migrated to {}",
                    metadata.version, SCHEMA_VERSION
                ),
            )
            .with_context("source_version", metadata.version.clone())
            .with_context("target_version", SCHEMA_VERSION));
        }

        let verify_path = path.clone();
        let expected_sha = metadata.sha256.clone();
        task::spawn_blocking(move || verify_backup_file(&verify_path, expected_sha.as_deref()))
            .await
            .map_err(|err| {
                AppError::new("DB_BACKUP/TASK", "Backup verification task panicked")
                    .with_context("error", err.to_string())
            })??;

        let live_path = self.connections.active_db_path();
        if !options.skip_safety_backup && live_path.exists() {
            let safety = self
                .create_backup(Some(SAFETY_BACKUP_DESCRIPTION.to_string()), BackupKind::PreRestore)
                .await;
            match safety.backup {
                Some(info) if safety.success => result.safety_backup = Some(info.filename),
                _ => warn!(
                    target: "keepsake",
                    event = "safety_backup_failed",
                    error = safety.error.as_deref().unwrap_or("unknown")
                ),
            }
        }

        self.connections.close_now().await;
        let source = path.clone();
        task::spawn_blocking(move || swap::restore_file_into_place(&source, &live_path))
            .await
            .map_err(|err| {
                AppError::new("DB_BACKUP/TASK", "Restore task panicked")
                    .with_context("error", err.to_string())
            })??;
        Ok(())
    }

    /// Remove a backup and its sidecars. Missing sidecars are fine.
    pub fn delete_backup(&self, filename: &str) -> DeleteBackupResult {
        let mut result = DeleteBackupResult {
            success: false,
            error: None,
            removed_files: Vec::new(),
        };
        if let Err(err) = validate_backup_file_name(filename) {
            result.error = Some(err.message().to_string());
            return result;
        }
        let path = self.backup_dir.join(filename);
        if let Err(err) = fs::remove_file(&path) {
            let message = if err.kind() == io::ErrorKind::NotFound {
                "Backup file does not exist".to_string()
            } else {
                err.to_string()
            };
            warn!(target: "keepsake", event = "backup_delete_failed", file = filename, error = %err);
            result.error = Some(message);
            return result;
        }
        result.removed_files.push(filename.to_string());

        for sidecar in [metadata_path(&path), export_path(&path)] {
            match fs::remove_file(&sidecar) {
                Ok(()) => result.removed_files.push(file_name_of(&sidecar)),
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => warn!(
                    target: "keepsake",
                    event = "backup_sidecar_delete_failed",
                    path = %sidecar.display(),
                    error = %err
                ),
            }
        }
        info!(target: "keepsake", event = "backup_deleted", file = filename);
        result.success = true;
        result
    }

    /// Create an auto backup when the newest one for the active environment
    /// is older than the interval, then trim old auto backups.
    pub async fn run_auto_backup_tick(
        &self,
        now: DateTime<Utc>,
        config: &AutoBackupConfig,
    ) -> AppResult<AutoBackupOutcome> {
        let environment = self.connections.environment();
        let newest = self
            .list_backups()
            .await?
            .into_iter()
            .filter(|b| b.metadata.kind == BackupKind::Auto && b.metadata.environment == environment)
            .map(|b| b.metadata.created_at)
            .max();
        let interval = chrono::Duration::from_std(config.interval)
            .unwrap_or_else(|_| chrono::Duration::hours(24));
        let due = newest.map(|at| now - at >= interval).unwrap_or(true);

        let mut outcome = AutoBackupOutcome::default();
        if due {
            let created = self
                .create_backup(Some(AUTO_BACKUP_DESCRIPTION.to_string()), BackupKind::Auto)
                .await;
            match created.backup {
                Some(info) if created.success => outcome.created = Some(info),
                _ if created.error_code.as_deref() == Some("DB_BACKUP/SOURCE_MISSING") => {
                    debug!(target: "keepsake", event = "auto_backup_skipped", reason = "no_database");
                }
                _ => {
                    return Err(AppError::new(
                        created.error_code.as_deref().unwrap_or("DB_BACKUP/AUTO_FAILED"),
                        created.error.unwrap_or_else(|| "Auto backup failed".to_string()),
                    ));
                }
            }
        } else {
            debug!(target: "keepsake", event = "auto_backup_not_due");
        }
        outcome.removed = self.cleanup_auto_backups(config.max_auto_backups).await?;
        Ok(outcome)
    }

    /// Delete the oldest auto backups of the active environment beyond `max`.
    /// Manual and pre-restore backups are never touched.
    pub async fn cleanup_auto_backups(&self, max: usize) -> AppResult<usize> {
        let environment = self.connections.environment();
        let mut autos: Vec<BackupInfo> = self
            .list_backups()
            .await?
            .into_iter()
            .filter(|b| b.metadata.kind == BackupKind::Auto && b.metadata.environment == environment)
            .collect();
        autos.sort_by(|a, b| b.metadata.created_at.cmp(&a.metadata.created_at));

        let mut removed = 0;
        for stale in autos.iter().skip(max) {
            if self.delete_backup(&stale.filename).success {
                removed += 1;
            }
        }
        if removed > 0 {
            info!(target: "keepsake", event = "auto_backups_trimmed", removed, max);
        }
        Ok(removed)
    }
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn verify_backup_file(path: &Path, expected_sha: Option<&str>) -> AppResult<()> {
    health::ensure_file_healthy(path)?;
    if let Some(expected) = expected_sha {
        let actual = metadata::file_sha256(path)?;
        if !actual.eq_ignore_ascii_case(expected) {
            return Err(AppError::new(
                "DB_BACKUP/CHECKSUM_MISMATCH",
                "Backup file does not match its recorded checksum",
            )
            .with_context("path", path.display().to_string())
            .with_context("expected", expected.to_string())
            .with_context("actual", actual));
        }
    }
    Ok(())
}

fn create_backup_sync(job: CreateJob) -> AppResult<BackupInfo> {
    let root = &job.backup_dir;
    fs::create_dir_all(root).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "create_backups_dir")
            .with_context("path", root.display().to_string())
    })?;

    let db_size = fs::metadata(&job.db_path)
        .map_err(|err| {
            AppError::from(err)
                .with_context("operation", "db_metadata")
                .with_context("path", job.db_path.display().to_string())
        })?
        .len();
    let required = required_free_bytes(db_size.saturating_add(journal_bytes(&job.db_path)));
    let available = free_disk_space(root)?;
    if available < required {
        return Err(AppError::new(
            "DB_BACKUP/LOW_DISK",
            format!("Not enough disk space (need ~{}).", format_bytes(required)),
        )
        .with_context("available_bytes", available.to_string())
        .with_context("required_bytes", required.to_string()));
    }

    // Millisecond precision, so the name and the recorded time agree.
    let start = DateTime::<Utc>::from_timestamp_millis(now_ms()).unwrap_or_else(Utc::now);
    let (final_path, created_at) = unique_backup_path(root, job.kind, job.environment, start)?;
    let partial = sidecar_path(&final_path, PARTIAL_SUFFIX);
    let copied = (|| -> AppResult<()> {
        run_sqlite_backup(&job.db_path, &partial)?;
        fs::rename(&partial, &final_path).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "finalize_backup")
                .with_context("from", partial.display().to_string())
                .with_context("to", final_path.display().to_string())
        })?;
        fs::File::open(&final_path)?.sync_all().ok();
        sync_dir(root).ok();
        Ok(())
    })();
    if let Err(err) = copied {
        let _ = fs::remove_file(&partial);
        return Err(err);
    }

    let finished = (|| -> AppResult<BackupInfo> {
        let sha = metadata::file_sha256(&final_path)?;
        let size = fs::metadata(&final_path).map(|m| m.len()).unwrap_or(db_size);

        let mut has_expense_export = false;
        if let Some(export) = &job.export {
            let target = export_path(&final_path);
            let written = serde_json::to_vec_pretty(export)
                .map_err(AppError::from)
                .and_then(|payload| write_atomic(&target, &payload).map_err(AppError::from));
            match written {
                Ok(()) => has_expense_export = true,
                Err(err) => warn!(
                    target: "keepsake",
                    event = "backup_export_write_failed",
                    path = %target.display(),
                    error = %err
                ),
            }
        }

        let metadata = BackupMetadata {
            id: Uuid::new_v4().to_string(),
            created_at,
            version: job.version.clone(),
            environment: job.environment,
            description: job.description.clone().filter(|d| !d.trim().is_empty()),
            has_expense_export,
            kind: job.kind,
            app_version: Some(env!("CARGO_PKG_VERSION").to_string()),
            db_size_bytes: size,
            sha256: Some(sha),
        };
        metadata::write_metadata(&metadata_path(&final_path), &metadata)?;
        sync_dir(root).ok();

        Ok(BackupInfo {
            filename: file_name_of(&final_path),
            path: final_path.clone(),
            size_bytes: size,
            has_metadata_file: true,
            metadata,
        })
    })();

    if finished.is_err() {
        let _ = fs::remove_file(&final_path);
        let _ = fs::remove_file(export_path(&final_path));
        let _ = fs::remove_file(metadata_path(&final_path));
    }
    finished
}

fn unique_backup_path(
    root: &Path,
    kind: BackupKind,
    environment: Environment,
    start: DateTime<Utc>,
) -> AppResult<(PathBuf, DateTime<Utc>)> {
    for offset in 0..MAX_NAME_ATTEMPTS {
        let at = start + chrono::Duration::milliseconds(offset);
        let candidate = root.join(backup_file_name(kind, environment, &at));
        if !candidate.exists() && !sidecar_path(&candidate, PARTIAL_SUFFIX).exists() {
            return Ok((candidate, at));
        }
    }
    Err(AppError::new(
        "DB_BACKUP/NAME_COLLISION",
        "Unable to allocate backup file name",
    ))
}

fn run_sqlite_backup(src: &Path, dest: &Path) -> AppResult<()> {
    let src_flags = OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_URI;
    let src_conn = Connection::open_with_flags(src, src_flags).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "open_source_db")
            .with_context("path", src.display().to_string())
    })?;
    let mut dest_conn = Connection::open(dest).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "create_backup_db")
            .with_context("path", dest.display().to_string())
    })?;

    {
        let backup = Backup::new(&src_conn, &mut dest_conn)
            .map_err(|err| AppError::from(err).with_context("operation", "backup_init"))?;
        backup
            .run_to_completion(256, Duration::ZERO, None)
            .map_err(|err| AppError::from(err).with_context("operation", "backup_step"))?;
    }

    // The copy must stand alone without a -wal sidecar.
    if let Err(err) =
        dest_conn.query_row("PRAGMA journal_mode=DELETE;", [], |row| row.get::<_, String>(0))
    {
        warn!(target: "keepsake", event = "backup_journal_mode_failed", error = %err);
    }

    dest_conn
        .close()
        .map_err(|(_, err)| AppError::from(err).with_context("operation", "close_backup_db"))?;
    src_conn
        .close()
        .map_err(|(_, err)| AppError::from(err).with_context("operation", "close_source_db"))?;
    Ok(())
}

/// Pair a backup file with its metadata, reconstructing metadata from the
/// file name when the sidecar is missing or unreadable.
pub fn describe_backup(path: &Path) -> AppResult<BackupInfo> {
    let filename = file_name_of(path);
    let file_meta = fs::metadata(path).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "backup_metadata")
            .with_context("path", path.display().to_string())
    })?;
    let size_bytes = file_meta.len();

    let sidecar = metadata_path(path);
    if sidecar.exists() {
        match metadata::read_metadata(&sidecar) {
            Ok(metadata) => {
                return Ok(BackupInfo {
                    filename,
                    path: path.to_path_buf(),
                    size_bytes,
                    has_metadata_file: true,
                    metadata,
                })
            }
            Err(err) => warn!(
                target: "keepsake",
                event = "backup_metadata_unreadable",
                path = %sidecar.display(),
                error = %err
            ),
        }
    }

    let parsed = parse_backup_file_name(&filename);
    let modified = file_meta
        .modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| DateTime::<Utc>::from(SystemTime::UNIX_EPOCH));
    let metadata = BackupMetadata {
        id: filename.trim_end_matches(DB_EXTENSION).to_string(),
        created_at: parsed
            .as_ref()
            .and_then(|p| p.created_at)
            .unwrap_or(modified),
        version: read_backup_version(path).unwrap_or_else(|| LEGACY_BACKUP_VERSION.to_string()),
        environment: parsed
            .as_ref()
            .map(|p| p.environment)
            .unwrap_or(Environment::Production),
        description: None,
        has_expense_export: export_path(path).exists(),
        kind: parsed.as_ref().map(|p| p.kind).unwrap_or_default(),
        app_version: None,
        db_size_bytes: size_bytes,
        sha256: None,
    };
    Ok(BackupInfo {
        filename,
        path: path.to_path_buf(),
        size_bytes,
        has_metadata_file: false,
        metadata,
    })
}

/// Schema version recorded inside a backup database, if it has one.
fn read_backup_version(path: &Path) -> Option<String> {
    let conn = match Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY) {
        Ok(conn) => conn,
        Err(err) => {
            debug!(target: "keepsake", event = "backup_version_unreadable", path = %path.display(), error = %err);
            return None;
        }
    };
    let has_table = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'metadata'",
            [],
            |row| row.get::<_, i64>(0),
        )
        .optional();
    match has_table {
        Ok(Some(_)) => {}
        Ok(None) => return None,
        Err(err) => {
            debug!(target: "keepsake", event = "backup_version_unreadable", path = %path.display(), error = %err);
            return None;
        }
    }
    conn.query_row("SELECT version FROM metadata WHERE id = 1", [], |row| {
        row.get::<_, String>(0)
    })
    .optional()
    .unwrap_or_else(|err| {
        warn!(target: "keepsake", event = "backup_version_unreadable", path = %path.display(), error = %err);
        None
    })
}

fn list_backups_sync(root: &Path) -> AppResult<Vec<BackupInfo>> {
    if !root.exists() {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    for entry in fs::read_dir(root).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "read_backups_dir")
            .with_context("path", root.display().to_string())
    })? {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!(target: "keepsake", event = "skip_invalid_backup_entry", error = %err);
                continue;
            }
        };
        let path = entry.path();
        let name = file_name_of(&path);
        if !path.is_file() || parse_backup_file_name(&name).is_none() {
            continue;
        }
        match describe_backup(&path) {
            Ok(info) => out.push(info),
            Err(err) => warn!(
                target: "keepsake",
                event = "skip_backup_invalid",
                path = %path.display(),
                error = %err
            ),
        }
    }
    out.sort_by(|a, b| {
        b.metadata
            .created_at
            .cmp(&a.metadata.created_at)
            .then_with(|| b.filename.cmp(&a.filename))
    });
    Ok(out)
}

fn required_free_bytes(db_size: u64) -> u64 {
    if db_size == 0 {
        return EMPTY_DB_REQUIRED_BYTES;
    }
    ((db_size as f64 * REQUIRED_FREE_MULTIPLIER).ceil()) as u64
}

fn free_disk_space(path: &Path) -> AppResult<u64> {
    if let Ok(fake) = env::var("KEEPSAKE_BACKUP_FAKE_FREE_BYTES") {
        if let Ok(value) = fake.trim().parse::<u64>() {
            return Ok(value);
        }
    }
    let target = if path.exists() {
        path.to_path_buf()
    } else {
        path.parent()
            .map(Path::to_path_buf)
            .or_else(|| env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("/"))
    };
    available_space(&target).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "available_space")
            .with_context("path", target.display().to_string())
    })
}

fn format_bytes(bytes: u64) -> String {
    if bytes == 0 {
        return "0 MB".to_string();
    }
    let mb = (bytes as f64) / 1_000_000.0;
    if mb < 1.0 {
        "1 MB".to_string()
    } else {
        format!("{:.0} MB", mb.ceil())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    #[test]
    fn required_space_has_headroom() {
        assert_eq!(required_free_bytes(0), EMPTY_DB_REQUIRED_BYTES);
        assert_eq!(required_free_bytes(1_000), 1_200);
    }

    #[test]
    fn bytes_render_in_megabytes() {
        assert_eq!(format_bytes(0), "0 MB");
        assert_eq!(format_bytes(10), "1 MB");
        assert_eq!(format_bytes(2_500_000), "3 MB");
    }

    #[test]
    fn legacy_backup_metadata_is_reconstructed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("backup-test-2024-01-02T03-04-05-006Z.db");
        fs::write(&path, b"legacy").unwrap();

        let info = describe_backup(&path).unwrap();
        assert!(!info.has_metadata_file);
        assert_eq!(info.metadata.version, LEGACY_BACKUP_VERSION);
        assert_eq!(info.metadata.environment, Environment::Test);
        assert_eq!(info.metadata.kind, BackupKind::Manual);
        assert_eq!(
            info.metadata.created_at,
            Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap() + chrono::Duration::milliseconds(6)
        );
    }

    #[test]
    fn legacy_backup_version_comes_from_its_metadata_table() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("backup-test-2024-01-02T03-04-05-006Z.db");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE metadata (id INTEGER PRIMARY KEY, version TEXT NOT NULL);
             INSERT INTO metadata (id, version) VALUES (1, '0.0.4');",
        )
        .unwrap();
        drop(conn);

        let info = describe_backup(&path).unwrap();
        assert!(!info.has_metadata_file);
        assert_eq!(info.metadata.version, "0.0.4");
    }

    #[test]
    fn database_without_metadata_table_counts_as_legacy() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("backup-2024-01-02T03-04-05-006Z.db");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch("CREATE TABLE notes (id TEXT PRIMARY KEY);").unwrap();
        drop(conn);

        assert_eq!(read_backup_version(&path), None);
        assert_eq!(describe_backup(&path).unwrap().metadata.version, LEGACY_BACKUP_VERSION);
    }

    #[test]
    fn listing_skips_foreign_files_and_sorts_newest_first() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("backup-2024-01-01T00-00-00-000Z.db"), b"a").unwrap();
        fs::write(dir.path().join("backup-2024-03-01T00-00-00-000Z.db"), b"b").unwrap();
        fs::write(dir.path().join("notes.txt"), b"ignore").unwrap();
        fs::write(dir.path().join("backup-2024-03-01T00-00-00-000Z.db.meta.json.tmp"), b"x").unwrap();

        let listed = list_backups_sync(dir.path()).unwrap();
        let names: Vec<&str> = listed.iter().map(|b| b.filename.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "backup-2024-03-01T00-00-00-000Z.db",
                "backup-2024-01-01T00-00-00-000Z.db"
            ]
        );
    }

    #[test]
    fn unique_path_steps_past_collisions() {
        let dir = tempdir().unwrap();
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let (first, at) = unique_backup_path(dir.path(), BackupKind::Auto, Environment::Test, start).unwrap();
        assert_eq!(at, start);
        fs::write(&first, b"taken").unwrap();
        let (second, next_at) =
            unique_backup_path(dir.path(), BackupKind::Auto, Environment::Test, start).unwrap();
        assert_ne!(first, second);
        assert_eq!(next_at, start + chrono::Duration::milliseconds(1));
    }
}
