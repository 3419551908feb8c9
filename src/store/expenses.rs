use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::{Row, SqliteConnection};
use tracing::warn;

use crate::environment::Environment;
use crate::migrations::{Document, MigrationRegistry, LEGACY_BACKUP_VERSION, SCHEMA_VERSION};
use crate::models::{
    Expense, ExpenseType, ExpensesState, Importance, InitialState, MonthlyOverride,
    RecurrenceSettings,
};
use crate::store::cache::Snapshot;
use crate::store::{decode_json, settings};
use crate::time::{format_timestamp, parse_timestamp};
use crate::{AppError, AppResult};

/// Counts of rows adjusted while enforcing the recurring-expense rules.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InvariantRepairs {
    pub cleared_recurring_flags: usize,
    pub filled_initial_states: usize,
    pub orphaned_occurrences: usize,
}

/// Enforce the occurrence rules on a copy of `state`.
///
/// Occurrences never carry `isRecurring` and always carry `initialState`.
/// Occurrences whose template is gone are kept and only counted.
pub fn prepare(state: &ExpensesState) -> (ExpensesState, InvariantRepairs) {
    let mut prepared = state.clone();
    let repairs = enforce_invariants(&mut prepared);
    if repairs.cleared_recurring_flags > 0 {
        warn!(
            target: "keepsake",
            event = "expense_occurrence_recurring_cleared",
            count = repairs.cleared_recurring_flags
        );
    }
    if repairs.orphaned_occurrences > 0 {
        warn!(
            target: "keepsake",
            event = "expense_orphaned_occurrences",
            count = repairs.orphaned_occurrences
        );
    }
    (prepared, repairs)
}

fn enforce_invariants(state: &mut ExpensesState) -> InvariantRepairs {
    let mut repairs = InvariantRepairs::default();
    for expense in &mut state.expenses {
        if expense.enforce_occurrence_invariant() {
            repairs.cleared_recurring_flags += 1;
        }
        if expense.ensure_initial_state() {
            repairs.filled_initial_states += 1;
        }
    }
    repairs.orphaned_occurrences = state.orphaned_occurrences().len();
    repairs
}

pub fn snapshot(state: &ExpensesState) -> AppResult<Snapshot> {
    let extras = json!({
        "categories": state.categories,
        "categoryColors": state.category_colors,
        "paymentMethods": state.payment_methods,
        "selectedMonth": state.selected_month,
        "overviewMode": state.overview_mode,
    });
    Snapshot::build(&state.expenses, |e: &Expense| e.id.as_str(), extras)
}

fn enum_text<T: Serialize>(value: &T) -> String {
    serde_json::to_value(value)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default()
}

fn enum_from_text<T: DeserializeOwned + Default>(raw: Option<String>) -> T {
    raw.and_then(|text| serde_json::from_value(Value::String(text)).ok())
        .unwrap_or_default()
}

fn optional_timestamp(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.as_deref().and_then(parse_timestamp)
}

pub async fn load(conn: &mut SqliteConnection) -> AppResult<ExpensesState> {
    let rows = sqlx::query(
        "SELECT id, name, amount, category, payment_method, due_date, is_recurring, recurrence, \
                is_paid, payment_date, expense_type, importance, notify, parent_expense_id, \
                monthly_overrides, is_modified, initial_state \
         FROM expenses ORDER BY due_date IS NULL, due_date, id",
    )
    .fetch_all(&mut *conn)
    .await
    .map_err(|err| AppError::from(err).with_context("operation", "load_expenses"))?;

    let mut expenses = Vec::with_capacity(rows.len());
    for row in rows {
        let id: String = row.try_get("id")?;
        let recurrence: Option<RecurrenceSettings> =
            decode_json(row.try_get("recurrence")?, "expenses.recurrence", &id);
        let monthly_overrides: BTreeMap<String, MonthlyOverride> = decode_json(
            row.try_get("monthly_overrides")?,
            "expenses.monthly_overrides",
            &id,
        );
        let initial_state: Option<InitialState> =
            decode_json(row.try_get("initial_state")?, "expenses.initial_state", &id);
        expenses.push(Expense {
            name: row.try_get("name")?,
            amount: row.try_get::<Option<f64>, _>("amount")?.unwrap_or_default(),
            category: row.try_get::<Option<String>, _>("category")?.unwrap_or_default(),
            payment_method: row
                .try_get::<Option<String>, _>("payment_method")?
                .unwrap_or_default(),
            due_date: optional_timestamp(row.try_get("due_date")?),
            is_recurring: row.try_get::<i64, _>("is_recurring")? != 0,
            recurrence,
            is_paid: row.try_get::<i64, _>("is_paid")? != 0,
            payment_date: optional_timestamp(row.try_get("payment_date")?),
            expense_type: enum_from_text::<ExpenseType>(row.try_get("expense_type")?),
            importance: enum_from_text::<Importance>(row.try_get("importance")?),
            notify: row.try_get::<i64, _>("notify")? != 0,
            parent_expense_id: row
                .try_get::<Option<String>, _>("parent_expense_id")?
                .filter(|p| !p.is_empty()),
            monthly_overrides,
            is_modified: row.try_get::<i64, _>("is_modified")? != 0,
            initial_state,
            id,
        });
    }

    let stored = settings::read_all(conn).await?;
    let mut state = ExpensesState {
        expenses,
        ..ExpensesState::default()
    };
    apply_settings(&mut state, &stored);

    let repairs = enforce_invariants(&mut state);
    if repairs.filled_initial_states > 0 || repairs.cleared_recurring_flags > 0 {
        warn!(
            target: "keepsake",
            event = "expenses_repaired_on_load",
            filled_initial_states = repairs.filled_initial_states,
            cleared_recurring_flags = repairs.cleared_recurring_flags
        );
    }
    Ok(state)
}

fn setting<T: DeserializeOwned>(stored: &BTreeMap<String, Value>, key: &str) -> Option<T> {
    let value = stored.get(key)?;
    match serde_json::from_value(value.clone()) {
        Ok(decoded) => Some(decoded),
        Err(err) => {
            warn!(target: "keepsake", event = "setting_decode_failed", key, error = %err);
            None
        }
    }
}

fn apply_settings(state: &mut ExpensesState, stored: &BTreeMap<String, Value>) {
    if let Some(categories) = setting(stored, settings::EXPENSE_CATEGORIES) {
        state.categories = categories;
    }
    if let Some(colors) = setting(stored, settings::EXPENSE_CATEGORY_COLORS) {
        state.category_colors = colors;
    }
    if let Some(methods) = setting(stored, settings::EXPENSE_PAYMENT_METHODS) {
        state.payment_methods = methods;
    }
    if let Some(month) = setting::<Option<String>>(stored, settings::EXPENSE_SELECTED_MONTH) {
        state.selected_month = month;
    }
    if let Some(mode) = setting(stored, settings::EXPENSE_OVERVIEW_MODE) {
        state.overview_mode = mode;
    }
}

fn encode_optional<T: Serialize>(value: &Option<T>) -> AppResult<Option<String>> {
    value
        .as_ref()
        .map(|v| serde_json::to_string(v).map_err(AppError::from))
        .transpose()
}

/// Replace every expense row and the scalar expense settings. Runs inside the
/// caller's transaction.
pub async fn persist(conn: &mut SqliteConnection, state: &ExpensesState) -> AppResult<()> {
    sqlx::query("DELETE FROM expenses")
        .execute(&mut *conn)
        .await
        .map_err(|err| AppError::from(err).with_context("operation", "clear_expenses"))?;

    for expense in &state.expenses {
        let recurrence = encode_optional(&expense.recurrence)?;
        let overrides = serde_json::to_string(&expense.monthly_overrides)?;
        let initial_state = encode_optional(&expense.initial_state)?;
        sqlx::query(
            "INSERT INTO expenses (id, name, amount, category, payment_method, due_date, \
                 is_recurring, recurrence, is_paid, payment_date, expense_type, importance, \
                 notify, parent_expense_id, monthly_overrides, is_modified, initial_state) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
        )
        .bind(&expense.id)
        .bind(&expense.name)
        .bind(expense.amount)
        .bind(&expense.category)
        .bind(&expense.payment_method)
        .bind(expense.due_date.as_ref().map(format_timestamp))
        .bind(expense.is_recurring as i64)
        .bind(recurrence)
        .bind(expense.is_paid as i64)
        .bind(expense.payment_date.as_ref().map(format_timestamp))
        .bind(enum_text(&expense.expense_type))
        .bind(enum_text(&expense.importance))
        .bind(expense.notify as i64)
        .bind(expense.parent_expense_id.as_deref())
        .bind(overrides)
        .bind(expense.is_modified as i64)
        .bind(initial_state)
        .execute(&mut *conn)
        .await
        .map_err(|err| {
            AppError::from(err)
                .with_context("operation", "insert_expense")
                .with_context("id", expense.id.clone())
        })?;
    }

    settings::put(conn, settings::EXPENSE_CATEGORIES, &json!(state.categories)).await?;
    settings::put(
        conn,
        settings::EXPENSE_CATEGORY_COLORS,
        &json!(state.category_colors),
    )
    .await?;
    settings::put(
        conn,
        settings::EXPENSE_PAYMENT_METHODS,
        &json!(state.payment_methods),
    )
    .await?;
    settings::put(
        conn,
        settings::EXPENSE_SELECTED_MONTH,
        &json!(state.selected_month),
    )
    .await?;
    settings::put(conn, settings::EXPENSE_OVERVIEW_MODE, &json!(state.overview_mode)).await?;
    Ok(())
}

pub async fn count(conn: &mut SqliteConnection) -> AppResult<i64> {
    Ok(sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM expenses")
        .fetch_one(&mut *conn)
        .await?)
}

/// Portable expense snapshot written next to backups and used for
/// cross-version recovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpenseExport {
    pub version: String,
    pub exported_at: DateTime<Utc>,
    pub environment: Environment,
    #[serde(default)]
    pub expenses: Vec<Expense>,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub category_colors: BTreeMap<String, String>,
    #[serde(default)]
    pub payment_methods: Vec<String>,
    #[serde(default)]
    pub selected_month: Option<String>,
    #[serde(default = "default_overview_mode")]
    pub overview_mode: String,
}

fn default_overview_mode() -> String {
    ExpensesState::default().overview_mode
}

impl ExpenseExport {
    pub fn from_state(state: &ExpensesState, environment: Environment) -> Self {
        Self {
            version: SCHEMA_VERSION.to_string(),
            exported_at: Utc::now(),
            environment,
            expenses: state.expenses.clone(),
            categories: state.categories.clone(),
            category_colors: state.category_colors.clone(),
            payment_methods: state.payment_methods.clone(),
            selected_month: state.selected_month.clone(),
            overview_mode: state.overview_mode.clone(),
        }
    }

    pub fn into_state(self) -> ExpensesState {
        ExpensesState {
            expenses: self.expenses,
            categories: self.categories,
            category_colors: self.category_colors,
            payment_methods: self.payment_methods,
            selected_month: self.selected_month,
            overview_mode: self.overview_mode,
        }
    }

    /// Parse an export of any known version, migrating it forward first.
    /// Documents without a version predate versioned exports.
    pub fn parse(raw: &str, registry: &MigrationRegistry) -> AppResult<Self> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|err| AppError::from(err).with_context("operation", "parse_expense_export"))?;
        let Value::Object(document) = value else {
            return Err(AppError::new(
                "VALIDATION/EXPORT_SHAPE",
                "Expense export must be a JSON object",
            ));
        };
        let from = document
            .get("version")
            .and_then(Value::as_str)
            .unwrap_or(LEGACY_BACKUP_VERSION)
            .to_string();
        let migrated: Document = registry
            .migrate(document, &from, SCHEMA_VERSION)
            .map_err(|err| AppError::from(err).with_context("source_version", from.clone()))?;
        serde_json::from_value(Value::Object(migrated)).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "validate_expense_export")
                .with_context("source_version", from)
        })
    }
}
