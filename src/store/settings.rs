use std::collections::BTreeMap;

use chrono::Utc;
use serde_json::Value;
use sqlx::{Row, SqliteConnection};
use tracing::warn;

use crate::time::format_timestamp;
use crate::{AppError, AppResult};

pub const EXPENSE_CATEGORIES: &str = "expense_categories";
pub const EXPENSE_CATEGORY_COLORS: &str = "expense_categoryColors";
pub const EXPENSE_PAYMENT_METHODS: &str = "expense_paymentMethods";
pub const EXPENSE_SELECTED_MONTH: &str = "expense_selectedMonth";
pub const EXPENSE_OVERVIEW_MODE: &str = "expense_overviewMode";

/// Prefix for free-form application settings (theme and friends).
pub const APP_SETTINGS_PREFIX: &str = "settings_";

/// Every settings row, values decoded from their JSON text.
pub async fn read_all(conn: &mut SqliteConnection) -> AppResult<BTreeMap<String, Value>> {
    let rows = sqlx::query("SELECT key, value FROM settings")
        .fetch_all(&mut *conn)
        .await
        .map_err(|err| AppError::from(err).with_context("operation", "read_settings"))?;
    let mut out = BTreeMap::new();
    for row in rows {
        let key: String = row.try_get("key")?;
        let raw: String = row.try_get("value")?;
        let value = serde_json::from_str(&raw).unwrap_or_else(|err| {
            warn!(
                target: "keepsake",
                event = "settings_value_not_json",
                key = %key,
                error = %err
            );
            Value::String(raw)
        });
        out.insert(key, value);
    }
    Ok(out)
}

pub async fn put(conn: &mut SqliteConnection, key: &str, value: &Value) -> AppResult<()> {
    let encoded = serde_json::to_string(value)?;
    sqlx::query(
        "INSERT INTO settings (key, value) VALUES (?1, ?2) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
    )
    .bind(key)
    .bind(encoded)
    .execute(&mut *conn)
    .await
    .map_err(|err| {
        AppError::from(err)
            .with_context("operation", "write_setting")
            .with_context("key", key.to_string())
    })?;
    Ok(())
}

/// Application settings with the key prefix stripped.
pub async fn load_app_settings(conn: &mut SqliteConnection) -> AppResult<BTreeMap<String, Value>> {
    let all = read_all(conn).await?;
    Ok(all
        .into_iter()
        .filter_map(|(key, value)| {
            key.strip_prefix(APP_SETTINGS_PREFIX)
                .map(|name| (name.to_string(), value))
        })
        .collect())
}

/// Replace every prefixed application setting with `settings`.
pub async fn persist_app_settings(
    conn: &mut SqliteConnection,
    settings: &BTreeMap<String, Value>,
) -> AppResult<()> {
    sqlx::query("DELETE FROM settings WHERE key LIKE 'settings\\_%' ESCAPE '\\'")
        .execute(&mut *conn)
        .await
        .map_err(|err| AppError::from(err).with_context("operation", "clear_app_settings"))?;
    for (name, value) in settings {
        put(conn, &format!("{APP_SETTINGS_PREFIX}{name}"), value).await?;
    }
    Ok(())
}

/// Stamp the metadata row with the time of the last successful save.
pub async fn touch_last_saved(conn: &mut SqliteConnection) -> AppResult<String> {
    let now = format_timestamp(&Utc::now());
    sqlx::query("UPDATE metadata SET last_saved = ?1 WHERE id = 1")
        .bind(&now)
        .execute(&mut *conn)
        .await
        .map_err(|err| AppError::from(err).with_context("operation", "touch_last_saved"))?;
    Ok(now)
}

pub async fn read_last_saved(conn: &mut SqliteConnection) -> AppResult<Option<String>> {
    let value: Option<Option<String>> =
        sqlx::query_scalar("SELECT last_saved FROM metadata WHERE id = 1")
            .fetch_optional(&mut *conn)
            .await?;
    Ok(value.flatten())
}
