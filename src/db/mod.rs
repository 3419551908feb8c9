use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::future::BoxFuture;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{ConnectOptions, SqliteConnection, SqlitePool};
use tracing::{debug, error, info, warn};

use crate::{AppError, AppResult};

pub mod backup;
pub mod connection;
pub mod health;
pub mod metadata;
pub mod queue;
pub mod schema;
pub mod swap;

/// Files SQLite keeps next to the main database file.
pub const JOURNAL_SUFFIXES: [&str; 3] = ["-wal", "-shm", "-journal"];

/// Open the single connection handle for `db_path`.
///
/// The pool is capped at one connection; callers share it through
/// [`connection::ConnectionManager`].
pub async fn open_sqlite_pool(db_path: &Path) -> AppResult<SqlitePool> {
    if let Some(parent) = db_path.parent() {
        fs::create_dir_all(parent).map_err(|err| {
            error!(
                target: "keepsake",
                event = "data_dir_create_failed",
                error = %err,
                path = %parent.display()
            );
            AppError::from(err)
                .with_context("operation", "create_data_dir")
                .with_context("path", parent.display().to_string())
        })?;
    }

    let opts = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full)
        .foreign_keys(true)
        .busy_timeout(Duration::from_millis(5000))
        .log_statements(log::LevelFilter::Off);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(30))
        .after_connect(|conn, _| {
            Box::pin(async move {
                sqlx::query("PRAGMA wal_autocheckpoint = 1000;")
                    .execute(&mut *conn)
                    .await?;
                Ok::<_, sqlx::Error>(())
            })
        })
        .connect_with(opts)
        .await
        .map_err(|err| {
            AppError::from(err)
                .with_context("operation", "open_db")
                .with_context("path", db_path.display().to_string())
        })?;

    log_effective_pragmas(&pool, db_path).await;
    Ok(pool)
}

async fn log_effective_pragmas(pool: &SqlitePool, db_path: &Path) {
    let (sqlite_ver,): (String,) = sqlx::query_as("select sqlite_version()")
        .fetch_one(pool)
        .await
        .unwrap_or((String::from("unknown"),));

    let jm: (String,) = sqlx::query_as("PRAGMA journal_mode;")
        .fetch_one(pool)
        .await
        .unwrap_or((String::from("unknown"),));

    let sync: (i64,) = sqlx::query_as("PRAGMA synchronous;")
        .fetch_one(pool)
        .await
        .unwrap_or((i64::MIN,));

    info!(
        target: "keepsake",
        event = "db_open",
        path = %db_path.display(),
        sqlite_version = %sqlite_ver,
        journal_mode = %jm.0,
        synchronous = %sync.0
    );

    if !jm.0.eq_ignore_ascii_case("wal") {
        warn!(
            target: "keepsake",
            event = "db_open_warning",
            msg = "journal_mode != WAL; running with reduced crash safety"
        );
    }
}

/// Run work inside a transaction. Commits on success, rolls back on error.
pub async fn run_in_tx<R, F>(pool: &SqlitePool, f: F) -> AppResult<R>
where
    F: for<'c> FnOnce(&'c mut SqliteConnection) -> BoxFuture<'c, AppResult<R>>,
{
    let mut tx = pool.begin().await?;
    debug!(target: "keepsake", event = "db_tx_begin");
    match f(&mut *tx).await {
        Ok(val) => {
            tx.commit().await?;
            debug!(target: "keepsake", event = "db_tx_commit");
            Ok(val)
        }
        Err(e) => {
            if let Err(rb) = tx.rollback().await {
                error!(target: "keepsake", event = "db_tx_rollback_failed", error = %rb);
            } else {
                warn!(target: "keepsake", event = "db_tx_rollback", error = %e);
            }
            Err(e)
        }
    }
}

/// Flush the write-ahead log into the main database file so that a plain
/// file copy is self-consistent.
pub async fn checkpoint(pool: &SqlitePool) -> AppResult<()> {
    let (busy, log_frames, checkpointed): (i64, i64, i64) =
        sqlx::query_as("PRAGMA wal_checkpoint(TRUNCATE);")
            .fetch_one(pool)
            .await
            .map_err(|err| AppError::from(err).with_context("operation", "wal_checkpoint"))?;
    if busy != 0 {
        warn!(
            target: "keepsake",
            event = "wal_checkpoint_busy",
            log_frames,
            checkpointed
        );
    } else {
        debug!(target: "keepsake", event = "wal_checkpoint", log_frames, checkpointed);
    }
    Ok(())
}

pub fn sidecar_path(base: &Path, suffix: &str) -> PathBuf {
    let mut os = OsString::from(base.as_os_str());
    os.push(suffix);
    PathBuf::from(os)
}

/// Bytes currently held in WAL / shared-memory / rollback journal files.
pub fn journal_bytes(db_path: &Path) -> u64 {
    JOURNAL_SUFFIXES
        .iter()
        .map(|suffix| {
            fs::metadata(sidecar_path(db_path, suffix))
                .map(|meta| meta.len())
                .unwrap_or(0)
        })
        .sum()
}

/// Write `bytes` to `path` through a temporary sibling and a rename.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let tmp = sidecar_path(path, ".tmp");
    {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    if let Err(err) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(err);
    }
    Ok(())
}

pub(crate) fn sync_dir(path: &Path) -> io::Result<()> {
    File::open(path)?.sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn sidecar_appends_suffix() {
        let base = Path::new("/data/appdata.db");
        assert_eq!(
            sidecar_path(base, "-wal"),
            PathBuf::from("/data/appdata.db-wal")
        );
    }

    #[test]
    fn write_atomic_replaces_content() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("meta.json");
        write_atomic(&path, b"first").unwrap();
        write_atomic(&path, b"second").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"second");
        assert!(!sidecar_path(&path, ".tmp").exists());
    }

    #[tokio::test]
    async fn run_in_tx_rolls_back_on_error() {
        let dir = tempdir().unwrap();
        let pool = open_sqlite_pool(&dir.path().join("tx.db")).await.unwrap();
        sqlx::query("CREATE TABLE t (val TEXT UNIQUE);")
            .execute(&pool)
            .await
            .unwrap();

        let res: AppResult<()> = run_in_tx(&pool, |conn| {
            Box::pin(async move {
                sqlx::query("INSERT INTO t (val) VALUES ('dup');")
                    .execute(&mut *conn)
                    .await?;
                sqlx::query("INSERT INTO t (val) VALUES ('dup');")
                    .execute(&mut *conn)
                    .await?;
                Ok(())
            })
        })
        .await;
        assert!(res.is_err());

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM t;")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 0);
        pool.close().await;
    }

    #[tokio::test]
    async fn journal_mode_is_wal() {
        let dir = tempdir().unwrap();
        let pool = open_sqlite_pool(&dir.path().join("wal.db")).await.unwrap();
        let mode: String = sqlx::query_scalar("PRAGMA journal_mode;")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(mode.to_ascii_lowercase(), "wal");
        checkpoint(&pool).await.unwrap();
        pool.close().await;
    }
}
