//! Typed load and save per domain.
//!
//! Each store reads its tables into model types and writes them back with a
//! full replace inside the caller's transaction. Change detection lives in
//! [`cache`]; the engine decides whether a write is needed at all.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use tracing::warn;

use crate::time::parse_timestamp;

pub mod cache;
pub mod expenses;
pub mod income;
pub mod notes;
pub mod settings;

pub use cache::{ChangeSummary, Snapshot, StorageCache};
pub use expenses::ExpenseExport;

/// Decode a JSON text column, falling back to the type's default when the
/// column is empty or malformed.
pub(crate) fn decode_json<T>(raw: Option<String>, column: &str, id: &str) -> T
where
    T: DeserializeOwned + Default,
{
    let Some(raw) = raw.filter(|text| !text.trim().is_empty()) else {
        return T::default();
    };
    match serde_json::from_str(&raw) {
        Ok(value) => value,
        Err(err) => {
            warn!(
                target: "keepsake",
                event = "json_column_decode_failed",
                column,
                id,
                error = %err
            );
            T::default()
        }
    }
}

pub(crate) fn timestamp_or_epoch(raw: Option<String>) -> DateTime<Utc> {
    raw.as_deref()
        .and_then(parse_timestamp)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn malformed_json_falls_back_to_default() {
        let tags: BTreeSet<String> = decode_json(Some("not json".into()), "notes.tags", "n1");
        assert!(tags.is_empty());
        let tags: BTreeSet<String> = decode_json(Some(r#"["a","b"]"#.into()), "notes.tags", "n1");
        assert_eq!(tags.len(), 2);
        let none: Option<u8> = decode_json(None, "x", "y");
        assert_eq!(none, None);
    }

    #[test]
    fn bad_timestamps_become_epoch() {
        assert_eq!(timestamp_or_epoch(Some("garbage".into())), DateTime::<Utc>::default());
        assert_eq!(timestamp_or_epoch(None).timestamp(), 0);
    }
}
