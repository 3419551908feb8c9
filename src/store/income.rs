use chrono::NaiveDate;
use serde_json::Value;
use sqlx::{Row, SqliteConnection};
use tracing::{error, warn};

use crate::models::{IncomeEntry, IncomeState};
use crate::store::cache::Snapshot;
use crate::time::parse_timestamp;
use crate::{AppError, AppResult};

const DATE_FORMAT: &str = "%Y-%m-%d";

/// Keep one entry per calendar date; the last submitted entry wins.
pub fn prepare(state: &IncomeState) -> IncomeState {
    let mut prepared = state.clone();
    let dropped = prepared.dedupe_by_date();
    if dropped > 0 {
        warn!(target: "keepsake", event = "income_duplicate_dates_dropped", count = dropped);
    }
    prepared
}

pub fn snapshot(state: &IncomeState) -> AppResult<Snapshot> {
    Snapshot::build(&state.entries, |e: &IncomeEntry| e.id.as_str(), Value::Null)
}

fn parse_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), DATE_FORMAT)
        .ok()
        .or_else(|| parse_timestamp(raw).map(|ts| ts.date_naive()))
}

fn optional_u32(raw: Option<i64>) -> Option<u32> {
    raw.and_then(|value| u32::try_from(value).ok())
}

pub async fn load(conn: &mut SqliteConnection) -> AppResult<IncomeState> {
    let rows = sqlx::query("SELECT id, date, amount, hours, minutes FROM income_entries ORDER BY date, id")
        .fetch_all(&mut *conn)
        .await
        .map_err(|err| AppError::from(err).with_context("operation", "load_income"))?;

    let mut entries = Vec::with_capacity(rows.len());
    for row in rows {
        let id: String = row.try_get("id")?;
        let raw_date: Option<String> = row.try_get("date")?;
        let Some(date) = raw_date.as_deref().and_then(parse_date) else {
            // Left in place on disk; persist never deletes rows it cannot read.
            error!(
                target: "keepsake",
                event = "income_row_unreadable",
                id = %id,
                date = raw_date.as_deref().unwrap_or("NULL"),
                reason = "unparseable_date"
            );
            continue;
        };
        entries.push(IncomeEntry {
            id,
            date,
            amount: row.try_get::<Option<f64>, _>("amount")?.unwrap_or_default(),
            hours: optional_u32(row.try_get("hours")?),
            minutes: optional_u32(row.try_get("minutes")?),
        });
    }
    Ok(IncomeState { entries })
}

/// Replace the readable income rows with `state`. Rows whose date cannot
/// be parsed stay untouched unless `state` reuses their id.
pub async fn persist(conn: &mut SqliteConnection, state: &IncomeState) -> AppResult<()> {
    let stored: Vec<(String, Option<String>)> = sqlx::query_as("SELECT id, date FROM income_entries")
        .fetch_all(&mut *conn)
        .await
        .map_err(|err| AppError::from(err).with_context("operation", "read_income_ids"))?;
    for (id, raw_date) in stored {
        if raw_date.as_deref().and_then(parse_date).is_none() {
            continue;
        }
        sqlx::query("DELETE FROM income_entries WHERE id = ?1")
            .bind(&id)
            .execute(&mut *conn)
            .await
            .map_err(|err| {
                AppError::from(err)
                    .with_context("operation", "clear_income")
                    .with_context("id", id.clone())
            })?;
    }
    for entry in &state.entries {
        sqlx::query(
            "INSERT INTO income_entries (id, date, amount, hours, minutes) VALUES (?1, ?2, ?3, ?4, ?5) \
             ON CONFLICT(id) DO UPDATE SET date = excluded.date, amount = excluded.amount, \
             hours = excluded.hours, minutes = excluded.minutes",
        )
        .bind(&entry.id)
        .bind(entry.date.format(DATE_FORMAT).to_string())
        .bind(entry.amount)
        .bind(entry.hours.map(i64::from))
        .bind(entry.minutes.map(i64::from))
        .execute(&mut *conn)
        .await
        .map_err(|err| {
            AppError::from(err)
                .with_context("operation", "insert_income")
                .with_context("id", entry.id.clone())
        })?;
    }
    Ok(())
}

pub async fn count(conn: &mut SqliteConnection) -> AppResult<i64> {
    Ok(sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM income_entries")
        .fetch_one(&mut *conn)
        .await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dates_parse_from_older_shapes() {
        let expected = NaiveDate::from_ymd_opt(2024, 6, 3).unwrap();
        assert_eq!(parse_date("2024-06-03"), Some(expected));
        assert_eq!(parse_date("2024-06-03T10:00:00Z"), Some(expected));
        assert_eq!(parse_date("June third"), None);
    }

    #[test]
    fn negative_hours_are_dropped() {
        assert_eq!(optional_u32(Some(-1)), None);
        assert_eq!(optional_u32(Some(8)), Some(8));
    }
}
