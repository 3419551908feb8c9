#![allow(clippy::unwrap_used, clippy::expect_used)]

mod util;

use std::fs;

use anyhow::Result;
use keepsake_lib::models::{ExpenseType, Importance};
use keepsake_lib::{AppData, Environment, SaveScope, SCHEMA_VERSION};
use tempfile::tempdir;

use util::{at, engine_in, rent_with_occurrences};

#[tokio::test]
async fn export_then_import_into_another_environment() -> Result<()> {
    let dir = tempdir()?;
    let engine = engine_in(dir.path(), Environment::Test);
    engine.load_data().await?;
    let mut data = AppData::default();
    data.expenses.expenses = rent_with_occurrences(at(2024, 1, 1), 4);
    data.expenses.categories = vec!["housing".into()];
    engine.save_data(data.clone(), SaveScope::Expenses).await?;

    let path = dir.path().join("expenses.json");
    let export = engine.export_expenses_to_json(&path).await?;
    assert_eq!(export.version, SCHEMA_VERSION);
    assert_eq!(export.environment, Environment::Test);
    assert_eq!(export.expenses.len(), 5);

    let other = tempdir()?;
    let target = engine_in(other.path(), Environment::Production);
    target.load_data().await?;
    let report = target.import_expenses_from_json(&path).await?;
    assert!(report.written);

    let loaded = target.load_data().await?;
    let mut ids: Vec<String> = loaded.expenses.expenses.iter().map(|e| e.id.clone()).collect();
    ids.sort();
    let mut expected: Vec<String> = data.expenses.expenses.iter().map(|e| e.id.clone()).collect();
    expected.sort();
    assert_eq!(ids, expected);
    assert_eq!(loaded.expenses.categories, vec!["housing".to_string()]);

    // Importing the same file again changes nothing.
    assert!(!target.import_expenses_from_json(&path).await?.written);
    Ok(())
}

#[tokio::test]
async fn unversioned_export_is_migrated_on_import() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("legacy.json");
    fs::write(
        &path,
        r#"{
            "exportedAt": "2023-06-01T00:00:00Z",
            "environment": "production",
            "expenses": [
                {"id": "gym", "name": "Gym", "amount": 40, "isRecurring": true,
                 "dueDate": "2023-06-01T00:00:00Z"},
                {"id": "gym-1", "name": "Gym", "amount": 40, "isRecurring": true,
                 "parentExpenseId": "gym", "dueDate": "2023-07-01T00:00:00Z",
                 "paymentMethod": "card"}
            ]
        }"#,
    )?;

    let engine = engine_in(dir.path(), Environment::Test);
    engine.load_data().await?;
    engine.import_expenses_from_json(&path).await?;

    let loaded = engine.load_data().await?;
    assert_eq!(loaded.expenses.expenses.len(), 2);
    for expense in &loaded.expenses.expenses {
        assert_eq!(expense.expense_type, ExpenseType::Need);
        assert_eq!(expense.importance, Importance::None);
    }
    let occurrence = loaded
        .expenses
        .expenses
        .iter()
        .find(|e| e.id == "gym-1")
        .expect("occurrence");
    assert!(!occurrence.is_recurring);
    let initial = occurrence.initial_state.as_ref().expect("initial state");
    assert_eq!(initial.amount, 40.0);
    assert_eq!(initial.payment_method, "card");
    Ok(())
}

#[tokio::test]
async fn export_from_a_newer_build_is_refused() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("future.json");
    fs::write(
        &path,
        r#"{"version": "9.9.9", "exportedAt": "2030-01-01T00:00:00Z",
            "environment": "test", "expenses": []}"#,
    )?;

    let engine = engine_in(dir.path(), Environment::Test);
    engine.load_data().await?;
    let err = engine.import_expenses_from_json(&path).await.unwrap_err();
    assert_eq!(err.code(), "MIGRATION/DOWNGRADE");
    assert_eq!(engine.write_transactions(), 0);
    Ok(())
}

#[tokio::test]
async fn malformed_export_reports_a_parse_error() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("broken.json");
    fs::write(&path, "[1, 2, 3]")?;

    let engine = engine_in(dir.path(), Environment::Test);
    let err = engine.import_expenses_from_json(&path).await.unwrap_err();
    assert_eq!(err.code(), "VALIDATION/EXPORT_SHAPE");
    Ok(())
}

#[tokio::test]
async fn missing_export_file_names_the_path() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("absent.json");

    let engine = engine_in(dir.path(), Environment::Test);
    engine.load_data().await?;
    let err = engine.import_expenses_from_json(&path).await.unwrap_err();
    assert_eq!(err.code(), "IO/NotFound");
    assert_eq!(
        err.context().get("path").map(String::as_str),
        Some(path.display().to_string().as_str())
    );
    assert_eq!(err.context().get("operation").map(String::as_str), Some("read_expense_export"));
    assert_eq!(engine.write_transactions(), 0);
    Ok(())
}
