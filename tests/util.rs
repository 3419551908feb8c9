#![allow(clippy::unwrap_used, clippy::expect_used, dead_code)]

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Months, TimeZone, Utc};
use keepsake_lib::models::{Expense, Folder, Frequency, Note, RecurrenceSettings};
use keepsake_lib::{Environment, StorageConfig, StorageEngine};

pub fn config_in(dir: &Path, environment: Environment) -> StorageConfig {
    let mut config = StorageConfig::new(dir).with_environment(environment);
    config.idle_close_delay = Duration::from_millis(25);
    config.load_retry_delay = Duration::from_millis(10);
    config
}

pub fn engine_in(dir: &Path, environment: Environment) -> StorageEngine {
    StorageEngine::new(config_in(dir, environment))
}

pub fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, 9, 0, 0).unwrap()
}

pub fn note(id: &str, folder: &str) -> Note {
    let mut note = Note::new(id, format!("Note {id}"), r#"{"ops":[{"insert":"hello\n"}]}"#);
    note.folder = folder.to_string();
    note.created_at = at(2024, 1, 1);
    note.updated_at = at(2024, 1, 2);
    note.tags.insert("home".into());
    note
}

pub fn folders() -> Vec<Folder> {
    vec![
        Folder::inbox(),
        Folder::new("work", "Work", None),
        Folder::new("work/reports", "Reports", Some("work".into())),
    ]
}

pub fn rent_template(start: DateTime<Utc>) -> Expense {
    let mut template = Expense::new("rent", "Rent", 1500.0);
    template.category = "housing".into();
    template.payment_method = "transfer".into();
    template.due_date = Some(start);
    template.is_recurring = true;
    template.recurrence = Some(RecurrenceSettings {
        frequency: Frequency::Monthly,
        interval: 1,
        occurrences: Some(12),
    });
    template
}

/// The template plus `count` monthly occurrences starting at `start`.
pub fn rent_with_occurrences(start: DateTime<Utc>, count: u32) -> Vec<Expense> {
    let template = rent_template(start);
    let mut all = vec![template.clone()];
    for month in 0..count {
        let due = start + Months::new(month);
        all.push(Expense::occurrence_of(&template, due));
    }
    all
}

pub fn sorted_by_id<T: Clone, F: Fn(&T) -> String>(items: &[T], key: F) -> Vec<T> {
    let mut out = items.to_vec();
    out.sort_by_key(|item| key(item));
    out
}
