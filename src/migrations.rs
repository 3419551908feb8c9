//! Forward-only transforms over loosely-typed data documents.
//!
//! Restore compatibility checks and JSON imports both walk this chain. Steps
//! operate on a [`Document`] (a JSON object) because they handle shapes the
//! current model types no longer describe; callers validate into strong types
//! only after the chain has completed.

use std::cmp::Ordering;

use semver::Version;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{info, warn};

/// Schema version written by this build.
pub const SCHEMA_VERSION: &str = "0.0.5";

/// Version assumed for backups that predate metadata sidecars.
pub const LEGACY_BACKUP_VERSION: &str = "0.0.3";

/// Upper bound on chain length; guards against accidental cycles.
const MAX_CHAIN_STEPS: usize = 64;

pub type Document = Map<String, Value>;

type MigrateFn = fn(Document) -> Result<Document, String>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MigrationError {
    #[error("invalid version string: {0}")]
    InvalidVersion(String),
    #[error("cannot migrate backwards from {from} to {to}")]
    Downgrade { from: String, to: String },
    #[error("no migration path from {from} to {to}")]
    NoPath { from: String, to: String },
    #[error("migration {from} -> {to} failed: {reason}")]
    StepFailed {
        from: String,
        to: String,
        reason: String,
    },
}

#[derive(Clone)]
pub struct MigrationStep {
    pub from_version: String,
    pub to_version: String,
    pub description: String,
    migrate: MigrateFn,
}

impl MigrationStep {
    pub fn new(
        from_version: impl Into<String>,
        to_version: impl Into<String>,
        description: impl Into<String>,
        migrate: MigrateFn,
    ) -> Self {
        Self {
            from_version: from_version.into(),
            to_version: to_version.into(),
            description: description.into(),
            migrate,
        }
    }

    pub fn apply(&self, data: Document) -> Result<Document, String> {
        (self.migrate)(data)
    }
}

impl std::fmt::Debug for MigrationStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationStep")
            .field("from_version", &self.from_version)
            .field("to_version", &self.to_version)
            .field("description", &self.description)
            .finish()
    }
}

/// Parse `major[.minor[.patch]]`, padding missing components with zero.
pub fn parse_version(raw: &str) -> Result<Version, MigrationError> {
    let trimmed = raw.trim().trim_start_matches('v');
    let parts: Vec<&str> = trimmed.split('.').collect();
    let padded = match parts.len() {
        1 => format!("{trimmed}.0.0"),
        2 => format!("{trimmed}.0"),
        _ => trimmed.to_string(),
    };
    Version::parse(&padded).map_err(|_| MigrationError::InvalidVersion(raw.to_string()))
}

/// Numeric comparison of two version strings.
pub fn compare_versions(a: &str, b: &str) -> Result<Ordering, MigrationError> {
    Ok(parse_version(a)?.cmp(&parse_version(b)?))
}

#[derive(Debug, Clone, Default)]
pub struct MigrationRegistry {
    steps: Vec<MigrationStep>,
}

impl MigrationRegistry {
    pub fn empty() -> Self {
        Self { steps: Vec::new() }
    }

    /// Registry with every step this build knows about.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register(MigrationStep::new(
            "0.0.3",
            "0.0.4",
            "Expenses gain type, importance and notify",
            add_expense_classification,
        ));
        registry.register(MigrationStep::new(
            "0.0.4",
            "0.0.5",
            "Recurring occurrences carry initialState and isModified",
            add_occurrence_initial_state,
        ));
        registry
    }

    pub fn register(&mut self, step: MigrationStep) {
        self.steps.push(step);
    }

    pub fn steps(&self) -> &[MigrationStep] {
        &self.steps
    }

    /// Resolve the ordered list of steps leading from `from` to `to`.
    pub fn path(&self, from: &str, to: &str) -> Result<Vec<&MigrationStep>, MigrationError> {
        let target = parse_version(to)?;
        let mut current = parse_version(from)?;
        match current.cmp(&target) {
            Ordering::Equal => return Ok(Vec::new()),
            Ordering::Greater => {
                return Err(MigrationError::Downgrade {
                    from: from.to_string(),
                    to: to.to_string(),
                })
            }
            Ordering::Less => {}
        }

        let mut chain = Vec::new();
        while current < target {
            if chain.len() >= MAX_CHAIN_STEPS {
                break;
            }
            let next = self.steps.iter().find(|step| {
                parse_version(&step.from_version)
                    .map(|v| v == current)
                    .unwrap_or(false)
            });
            let Some(step) = next else {
                break;
            };
            current = parse_version(&step.to_version)?;
            chain.push(step);
        }

        if current == target {
            Ok(chain)
        } else {
            Err(MigrationError::NoPath {
                from: from.to_string(),
                to: to.to_string(),
            })
        }
    }

    pub fn can_migrate(&self, from: &str, to: &str) -> bool {
        self.path(from, to).is_ok()
    }

    /// Run every step between `from` and `to` over `data`.
    ///
    /// The returned document has its `version` field set to `to`.
    pub fn migrate(&self, mut data: Document, from: &str, to: &str) -> Result<Document, MigrationError> {
        let chain = self.path(from, to)?;
        for step in chain {
            data = step.apply(data).map_err(|reason| {
                warn!(
                    target: "keepsake",
                    event = "migration_step_failed",
                    from = %step.from_version,
                    to = %step.to_version,
                    reason = %reason
                );
                MigrationError::StepFailed {
                    from: step.from_version.clone(),
                    to: step.to_version.clone(),
                    reason,
                }
            })?;
            info!(
                target: "keepsake",
                event = "migration_step_applied",
                from = %step.from_version,
                to = %step.to_version,
                description = %step.description
            );
        }
        data.insert("version".into(), Value::String(to.to_string()));
        Ok(data)
    }
}

fn expenses_mut(data: &mut Document) -> Result<Option<&mut Vec<Value>>, String> {
    match data.get_mut("expenses") {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Array(items)) => Ok(Some(items)),
        Some(_) => Err("`expenses` must be an array".to_string()),
    }
}

fn add_expense_classification(mut data: Document) -> Result<Document, String> {
    if let Some(items) = expenses_mut(&mut data)? {
        for item in items.iter_mut() {
            let Value::Object(expense) = item else {
                return Err("expense entries must be objects".to_string());
            };
            expense
                .entry("type")
                .or_insert_with(|| Value::String("need".into()));
            expense
                .entry("importance")
                .or_insert_with(|| Value::String("none".into()));
            expense.entry("notify").or_insert(Value::Bool(false));
        }
    }
    Ok(data)
}

fn add_occurrence_initial_state(mut data: Document) -> Result<Document, String> {
    if let Some(items) = expenses_mut(&mut data)? {
        for item in items.iter_mut() {
            let Value::Object(expense) = item else {
                return Err("expense entries must be objects".to_string());
            };
            let is_occurrence = expense
                .get("parentExpenseId")
                .map(|v| !v.is_null())
                .unwrap_or(false);
            expense.entry("isModified").or_insert(Value::Bool(false));
            if !is_occurrence {
                continue;
            }
            expense.insert("isRecurring".into(), Value::Bool(false));
            let needs_initial = expense
                .get("initialState")
                .map(Value::is_null)
                .unwrap_or(true);
            if needs_initial {
                let mut initial = Map::new();
                initial.insert(
                    "amount".into(),
                    expense.get("amount").cloned().unwrap_or(Value::from(0.0)),
                );
                initial.insert(
                    "dueDate".into(),
                    expense.get("dueDate").cloned().unwrap_or(Value::Null),
                );
                initial.insert(
                    "paymentMethod".into(),
                    expense
                        .get("paymentMethod")
                        .cloned()
                        .unwrap_or_else(|| Value::String(String::new())),
                );
                expense.insert("initialState".into(), Value::Object(initial));
            }
        }
    }
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn chain_walks_forward() {
        let registry = MigrationRegistry::builtin();
        assert!(registry.can_migrate("0.0.4", "0.0.5"));
        assert!(registry.can_migrate("0.0.3", SCHEMA_VERSION));
        assert!(registry.can_migrate(SCHEMA_VERSION, SCHEMA_VERSION));
    }

    #[test]
    fn chain_refuses_backwards_and_unknown() {
        let registry = MigrationRegistry::builtin();
        assert!(!registry.can_migrate("0.0.5", "0.0.4"));
        assert!(!registry.can_migrate("9.9.9", SCHEMA_VERSION));
        assert!(!registry.can_migrate("0.0.1", SCHEMA_VERSION));
        assert!(!registry.can_migrate("not-a-version", SCHEMA_VERSION));
        assert!(matches!(
            registry.path("0.0.5", "0.0.4"),
            Err(MigrationError::Downgrade { .. })
        ));
    }

    #[test]
    fn broken_chain_is_not_migratable() {
        let mut registry = MigrationRegistry::empty();
        registry.register(MigrationStep::new("1.0.0", "1.1.0", "a", Ok));
        registry.register(MigrationStep::new("1.2.0", "1.3.0", "b", Ok));
        assert!(registry.can_migrate("1.0.0", "1.1.0"));
        assert!(!registry.can_migrate("1.0.0", "1.3.0"));
    }

    #[test]
    fn version_comparison_is_numeric() {
        assert_eq!(compare_versions("0.0.10", "0.0.9").unwrap(), Ordering::Greater);
        assert_eq!(compare_versions("1.2", "1.2.0").unwrap(), Ordering::Equal);
        assert!(compare_versions("abc", "1.0.0").is_err());
    }

    #[test]
    fn migrate_fills_expense_defaults() {
        let registry = MigrationRegistry::builtin();
        let data = doc(json!({
            "version": "0.0.3",
            "expenses": [
                { "id": "t", "amount": 1500.0, "isRecurring": true },
                { "id": "o", "amount": 1500.0, "dueDate": "2024-02-01T00:00:00Z",
                  "paymentMethod": "card", "parentExpenseId": "t", "isRecurring": true }
            ]
        }));

        let migrated = registry.migrate(data, "0.0.3", SCHEMA_VERSION).unwrap();
        assert_eq!(migrated["version"], json!(SCHEMA_VERSION));
        let expenses = migrated["expenses"].as_array().unwrap();
        assert_eq!(expenses[0]["type"], json!("need"));
        assert_eq!(expenses[0]["importance"], json!("none"));
        assert!(expenses[0].get("initialState").is_none());
        assert_eq!(expenses[1]["isRecurring"], json!(false));
        assert_eq!(expenses[1]["initialState"]["amount"], json!(1500.0));
        assert_eq!(expenses[1]["initialState"]["paymentMethod"], json!("card"));
    }

    #[test]
    fn failing_step_reports_versions() {
        let registry = MigrationRegistry::builtin();
        let data = doc(json!({ "expenses": "oops" }));
        let err = registry.migrate(data, "0.0.3", "0.0.4").unwrap_err();
        assert!(matches!(err, MigrationError::StepFailed { ref from, .. } if from == "0.0.3"));
    }
}
