use std::cmp::Ordering;

use serde::Serialize;
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{error, info, warn};

use crate::db::run_in_tx;
use crate::migrations::{compare_versions, SCHEMA_VERSION};
use crate::{AppError, AppResult};

const CREATE_TABLES: &[(&str, &str)] = &[
    (
        "notes",
        "CREATE TABLE IF NOT EXISTS notes (\
           id TEXT PRIMARY KEY,\
           title TEXT NOT NULL DEFAULT '',\
           content TEXT NOT NULL DEFAULT '',\
           tags TEXT NOT NULL DEFAULT '[]',\
           folder_id TEXT NOT NULL DEFAULT 'inbox',\
           created_at TEXT NOT NULL,\
           updated_at TEXT NOT NULL,\
           archived INTEGER NOT NULL DEFAULT 0\
         )",
    ),
    (
        "folders",
        "CREATE TABLE IF NOT EXISTS folders (\
           id TEXT PRIMARY KEY,\
           name TEXT,\
           position INTEGER NOT NULL DEFAULT 0\
         )",
    ),
    (
        "expenses",
        "CREATE TABLE IF NOT EXISTS expenses (\
           id TEXT PRIMARY KEY,\
           name TEXT NOT NULL,\
           amount REAL NOT NULL DEFAULT 0,\
           category TEXT NOT NULL DEFAULT '',\
           payment_method TEXT NOT NULL DEFAULT '',\
           due_date TEXT,\
           is_recurring INTEGER NOT NULL DEFAULT 0,\
           recurrence TEXT,\
           is_paid INTEGER NOT NULL DEFAULT 0,\
           payment_date TEXT,\
           expense_type TEXT NOT NULL DEFAULT 'need',\
           importance TEXT NOT NULL DEFAULT 'none',\
           notify INTEGER NOT NULL DEFAULT 0,\
           parent_expense_id TEXT,\
           monthly_overrides TEXT NOT NULL DEFAULT '{}',\
           is_modified INTEGER NOT NULL DEFAULT 0,\
           initial_state TEXT\
         )",
    ),
    (
        "income_entries",
        "CREATE TABLE IF NOT EXISTS income_entries (\
           id TEXT PRIMARY KEY,\
           date TEXT NOT NULL,\
           amount REAL NOT NULL DEFAULT 0,\
           hours INTEGER,\
           minutes INTEGER\
         )",
    ),
    (
        "settings",
        "CREATE TABLE IF NOT EXISTS settings (\
           key TEXT PRIMARY KEY,\
           value TEXT NOT NULL\
         )",
    ),
    (
        "metadata",
        "CREATE TABLE IF NOT EXISTS metadata (\
           id INTEGER PRIMARY KEY CHECK (id = 1),\
           last_saved TEXT,\
           version TEXT NOT NULL\
         )",
    ),
];

const CREATE_NOTE_FOLDERS: &str = "CREATE TABLE note_folders (\
       id TEXT PRIMARY KEY,\
       name TEXT NOT NULL,\
       parent_id TEXT,\
       position INTEGER NOT NULL DEFAULT 0,\
       archived INTEGER NOT NULL DEFAULT 0\
     )";

/// Columns that older database files may lack: (table, column, definition).
const ADDED_COLUMNS: &[(&str, &str, &str)] = &[
    ("notes", "folder_id", "TEXT NOT NULL DEFAULT 'inbox'"),
    ("notes", "archived", "INTEGER NOT NULL DEFAULT 0"),
    ("expenses", "expense_type", "TEXT NOT NULL DEFAULT 'need'"),
    ("expenses", "importance", "TEXT NOT NULL DEFAULT 'none'"),
    ("expenses", "notify", "INTEGER NOT NULL DEFAULT 0"),
    ("expenses", "parent_expense_id", "TEXT"),
    ("expenses", "monthly_overrides", "TEXT NOT NULL DEFAULT '{}'"),
    ("expenses", "is_modified", "INTEGER NOT NULL DEFAULT 0"),
    ("expenses", "initial_state", "TEXT"),
    ("income_entries", "hours", "INTEGER"),
    ("income_entries", "minutes", "INTEGER"),
    ("metadata", "last_saved", "TEXT"),
];

const REQUIRED_COLUMNS: &[(&str, &[&str])] = &[
    (
        "notes",
        &[
            "id",
            "title",
            "content",
            "tags",
            "folder_id",
            "created_at",
            "updated_at",
            "archived",
        ],
    ),
    (
        "note_folders",
        &["id", "name", "parent_id", "position", "archived"],
    ),
    (
        "expenses",
        &[
            "id",
            "name",
            "amount",
            "category",
            "payment_method",
            "due_date",
            "is_recurring",
            "recurrence",
            "is_paid",
            "payment_date",
            "expense_type",
            "importance",
            "notify",
            "parent_expense_id",
            "monthly_overrides",
            "is_modified",
            "initial_state",
        ],
    ),
    (
        "income_entries",
        &["id", "date", "amount", "hours", "minutes"],
    ),
    ("settings", &["key", "value"]),
    ("metadata", &["id", "last_saved", "version"]),
];

/// What a call to [`SchemaManager::ensure_schema`] changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaReport {
    pub added_columns: Vec<String>,
    pub created_note_folders: bool,
    pub previous_version: Option<String>,
    pub version: String,
}

/// Creates and upgrades the on-disk schema. Runs once per connection open.
pub struct SchemaManager;

impl SchemaManager {
    pub async fn ensure_schema(pool: &SqlitePool) -> AppResult<SchemaReport> {
        let previous_version = Self::guard_recorded_version(pool).await?;

        let mut report = run_in_tx(pool, |conn| {
            Box::pin(async move {
                for (table, sql) in CREATE_TABLES {
                    sqlx::query(sql).execute(&mut *conn).await.map_err(|err| {
                        AppError::from(err)
                            .with_context("operation", "create_table")
                            .with_context("table", *table)
                    })?;
                }
                let added_columns = ensure_columns(conn).await?;
                let created_note_folders = ensure_note_folders(conn).await?;
                Ok(SchemaReport {
                    added_columns,
                    created_note_folders,
                    previous_version: None,
                    version: SCHEMA_VERSION.to_string(),
                })
            })
        })
        .await?;

        Self::verify(pool).await?;

        sqlx::query(
            "INSERT INTO metadata (id, version) VALUES (1, ?1) \
             ON CONFLICT(id) DO UPDATE SET version = excluded.version",
        )
        .bind(SCHEMA_VERSION)
        .execute(pool)
        .await
        .map_err(|err| AppError::from(err).with_context("operation", "record_schema_version"))?;

        report.previous_version = previous_version;
        info!(
            target: "keepsake",
            event = "schema_ready",
            version = SCHEMA_VERSION,
            previous_version = report.previous_version.as_deref().unwrap_or("none"),
            added_columns = report.added_columns.len(),
            created_note_folders = report.created_note_folders
        );
        Ok(report)
    }

    /// Fail when any required column is missing after migrations ran.
    pub async fn verify(pool: &SqlitePool) -> AppResult<()> {
        for (table, columns) in REQUIRED_COLUMNS {
            let present: Vec<String> =
                sqlx::query_scalar("SELECT name FROM pragma_table_info(?1)")
                    .bind(*table)
                    .fetch_all(pool)
                    .await
                    .map_err(|err| {
                        AppError::from(err)
                            .with_context("operation", "verify_schema")
                            .with_context("table", *table)
                    })?;
            for column in columns.iter() {
                if !present.iter().any(|name| name == column) {
                    error!(
                        target: "keepsake",
                        event = "schema_verification_failed",
                        table = *table,
                        column = *column
                    );
                    return Err(AppError::new(
                        "SCHEMA/MISSING_COLUMN",
                        format!("Required column {table}.{column} is missing"),
                    )
                    .with_context("table", *table)
                    .with_context("column", *column));
                }
            }
        }
        Ok(())
    }

    /// A file written by a newer build is never opened for writing.
    async fn guard_recorded_version(pool: &SqlitePool) -> AppResult<Option<String>> {
        let recorded = read_schema_version(pool).await?;
        if let Some(version) = &recorded {
            match compare_versions(version, SCHEMA_VERSION) {
                Ok(Ordering::Greater) => {
                    return Err(AppError::new(
                        "SCHEMA/NEWER_VERSION",
                        "Database was written by a newer version of the application",
                    )
                    .with_context("database_version", version.clone())
                    .with_context("supported_version", SCHEMA_VERSION));
                }
                Ok(_) => {}
                Err(err) => warn!(
                    target: "keepsake",
                    event = "schema_version_unreadable",
                    version = %version,
                    error = %err
                ),
            }
        }
        Ok(recorded)
    }
}

/// Schema version recorded in the metadata row, if the table and row exist.
pub async fn read_schema_version(pool: &SqlitePool) -> AppResult<Option<String>> {
    let has_table: Option<i64> = sqlx::query_scalar(
        "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'metadata'",
    )
    .fetch_optional(pool)
    .await?;
    if has_table.is_none() {
        return Ok(None);
    }
    let version: Option<String> = sqlx::query_scalar("SELECT version FROM metadata WHERE id = 1")
        .fetch_optional(pool)
        .await
        .map_err(|err| AppError::from(err).with_context("operation", "read_schema_version"))?;
    Ok(version)
}

async fn column_exists(conn: &mut SqliteConnection, table: &str, column: &str) -> AppResult<bool> {
    let exists: Option<i64> =
        sqlx::query_scalar("SELECT 1 FROM pragma_table_info(?1) WHERE name = ?2")
            .bind(table)
            .bind(column)
            .fetch_optional(&mut *conn)
            .await?;
    Ok(exists.is_some())
}

async fn ensure_columns(conn: &mut SqliteConnection) -> AppResult<Vec<String>> {
    let mut added = Vec::new();
    for (table, column, definition) in ADDED_COLUMNS {
        if column_exists(conn, table, column).await? {
            continue;
        }
        let sql = format!("ALTER TABLE {table} ADD COLUMN {column} {definition}");
        sqlx::query(&sql).execute(&mut *conn).await.map_err(|err| {
            error!(
                target: "keepsake",
                event = "schema_add_column_failed",
                table = *table,
                column = *column,
                error = %err
            );
            AppError::from(err)
                .with_context("operation", "add_column")
                .with_context("table", *table)
                .with_context("column", *column)
        })?;
        info!(target: "keepsake", event = "schema_column_added", table = *table, column = *column);
        added.push(format!("{table}.{column}"));
    }
    Ok(added)
}

/// The hierarchical folder table replaced the flat `folders` table. It is
/// created empty; legacy rows are reconciled by the notes store on load.
async fn ensure_note_folders(conn: &mut SqliteConnection) -> AppResult<bool> {
    let exists: Option<i64> = sqlx::query_scalar(
        "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'note_folders'",
    )
    .fetch_optional(&mut *conn)
    .await?;
    if exists.is_some() {
        return Ok(false);
    }
    sqlx::query(CREATE_NOTE_FOLDERS)
        .execute(&mut *conn)
        .await
        .map_err(|err| AppError::from(err).with_context("operation", "create_note_folders"))?;
    info!(target: "keepsake", event = "schema_table_created", table = "note_folders");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_sqlite_pool;
    use tempfile::tempdir;

    #[tokio::test]
    async fn fresh_database_gets_current_schema() {
        let dir = tempdir().unwrap();
        let pool = open_sqlite_pool(&dir.path().join("fresh.db")).await.unwrap();

        let report = SchemaManager::ensure_schema(&pool).await.unwrap();
        assert!(report.added_columns.is_empty());
        assert!(report.created_note_folders);
        assert_eq!(report.previous_version, None);
        assert_eq!(
            read_schema_version(&pool).await.unwrap().as_deref(),
            Some(SCHEMA_VERSION)
        );

        let again = SchemaManager::ensure_schema(&pool).await.unwrap();
        assert!(!again.created_note_folders);
        assert_eq!(again.previous_version.as_deref(), Some(SCHEMA_VERSION));
        pool.close().await;
    }

    #[tokio::test]
    async fn newer_database_is_refused() {
        let dir = tempdir().unwrap();
        let pool = open_sqlite_pool(&dir.path().join("future.db")).await.unwrap();
        SchemaManager::ensure_schema(&pool).await.unwrap();
        sqlx::query("UPDATE metadata SET version = '9.9.9' WHERE id = 1")
            .execute(&pool)
            .await
            .unwrap();

        let err = SchemaManager::ensure_schema(&pool).await.unwrap_err();
        assert_eq!(err.code(), "SCHEMA/NEWER_VERSION");
        pool.close().await;
    }

    #[tokio::test]
    async fn verify_reports_missing_column() {
        let dir = tempdir().unwrap();
        let pool = open_sqlite_pool(&dir.path().join("broken.db")).await.unwrap();
        SchemaManager::ensure_schema(&pool).await.unwrap();
        sqlx::query("DROP TABLE income_entries")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("CREATE TABLE income_entries (id TEXT PRIMARY KEY, date TEXT, amount REAL, hours INTEGER)")
            .execute(&pool)
            .await
            .unwrap();

        let err = SchemaManager::verify(&pool).await.unwrap_err();
        assert_eq!(err.code(), "SCHEMA/MISSING_COLUMN");
        assert_eq!(err.context().get("column").map(String::as_str), Some("minutes"));
        pool.close().await;
    }
}
