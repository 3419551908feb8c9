use std::path::Path;
use std::time::Instant;

use rusqlite::{Connection, OpenFlags};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use crate::{AppError, AppResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbHealthCheck {
    pub name: String,
    pub passed: bool,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl DbHealthCheck {
    fn quick_check() -> Self {
        DbHealthCheck {
            name: "quick_check".to_string(),
            passed: true,
            duration_ms: 0,
            details: None,
        }
    }

    fn record(&mut self, outcome: Result<String, String>) {
        match outcome {
            Ok(result) if result.eq_ignore_ascii_case("ok") => {}
            Ok(result) => {
                self.passed = false;
                self.details = Some(result);
            }
            Err(err) => {
                self.passed = false;
                self.details = Some(format!("quick_check failed: {err}"));
            }
        }
    }
}

/// `PRAGMA quick_check` against the live handle.
pub async fn run_quick_check(pool: &SqlitePool) -> DbHealthCheck {
    let start = Instant::now();
    let mut check = DbHealthCheck::quick_check();
    let outcome = sqlx::query_scalar::<_, String>("PRAGMA quick_check;")
        .fetch_one(pool)
        .await
        .map_err(|err| err.to_string());
    check.record(outcome);
    check.duration_ms = start.elapsed().as_millis() as u64;
    check
}

/// `PRAGMA quick_check` against a database file opened read-only. Blocking.
pub fn check_file(path: &Path) -> DbHealthCheck {
    let start = Instant::now();
    let mut check = DbHealthCheck::quick_check();
    let outcome = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)
        .and_then(|conn| conn.query_row("PRAGMA quick_check;", [], |row| row.get::<_, String>(0)))
        .map_err(|err| err.to_string());
    check.record(outcome);
    check.duration_ms = start.elapsed().as_millis() as u64;
    check
}

/// Fail with `DB_BACKUP/INTEGRITY` unless the file passes `quick_check`.
pub fn ensure_file_healthy(path: &Path) -> AppResult<()> {
    let check = check_file(path);
    if check.passed {
        return Ok(());
    }
    Err(AppError::new(
        "DB_BACKUP/INTEGRITY",
        "Backup file failed the integrity check",
    )
    .with_context("path", path.display().to_string())
    .with_context("details", check.details.unwrap_or_default()))
}
