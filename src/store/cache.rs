//! Change detection for entity collections.
//!
//! A [`Snapshot`] is the normalized form of a collection: records keyed and
//! therefore sorted by id, each rendered to JSON so dates and enums compare
//! by their canonical text. Building one is pure and never touches the
//! database.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

use crate::models::SaveScope;
use crate::{AppError, AppResult};

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Snapshot {
    records: BTreeMap<String, Value>,
    /// Scalar state that travels alongside the collection.
    extras: Value,
}

impl Snapshot {
    /// Normalize `records`, rejecting duplicate ids.
    pub fn build<'a, T, I, F>(records: I, id_of: F, extras: Value) -> AppResult<Self>
    where
        T: Serialize + 'a,
        I: IntoIterator<Item = &'a T>,
        F: Fn(&T) -> &str,
    {
        let mut normalized = BTreeMap::new();
        for record in records {
            let id = id_of(record).to_string();
            let value = serde_json::to_value(record)
                .map_err(|err| AppError::from(err).with_context("operation", "normalize_record"))?;
            if normalized.insert(id.clone(), value).is_some() {
                return Err(AppError::new(
                    "VALIDATION/DUPLICATE_ID",
                    "Collection contains the same id more than once",
                )
                .with_context("id", id));
            }
        }
        Ok(Self {
            records: normalized,
            extras,
        })
    }

    /// A snapshot with no keyed records, for scalar-only state.
    pub fn from_extras(extras: Value) -> Self {
        Self {
            records: BTreeMap::new(),
            extras,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Differences between `previous` and this snapshot. With no previous
    /// snapshot every record counts as added.
    pub fn diff(&self, previous: Option<&Snapshot>) -> ChangeSummary {
        let Some(previous) = previous else {
            return ChangeSummary {
                added: self.records.keys().cloned().collect(),
                removed: Vec::new(),
                modified: Vec::new(),
                extras_changed: true,
            };
        };

        let mut summary = ChangeSummary {
            extras_changed: self.extras != previous.extras,
            ..ChangeSummary::default()
        };
        for (id, value) in &self.records {
            match previous.records.get(id) {
                None => summary.added.push(id.clone()),
                Some(old) if old != value => summary.modified.push(id.clone()),
                Some(_) => {}
            }
        }
        summary.removed = previous
            .records
            .keys()
            .filter(|id| !self.records.contains_key(*id))
            .cloned()
            .collect();
        summary
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeSummary {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub modified: Vec<String>,
    pub extras_changed: bool,
}

impl ChangeSummary {
    pub fn has_changes(&self) -> bool {
        self.extras_changed
            || !self.added.is_empty()
            || !self.removed.is_empty()
            || !self.modified.is_empty()
    }
}

/// Last known-good snapshot per collection. Process local and never
/// authoritative: an empty slot simply means the next save writes.
#[derive(Debug, Default)]
pub struct StorageCache {
    notes: Option<Snapshot>,
    expenses: Option<Snapshot>,
    income: Option<Snapshot>,
    settings: Option<Snapshot>,
}

impl StorageCache {
    fn slot_mut(&mut self, scope: SaveScope) -> Option<&mut Option<Snapshot>> {
        match scope {
            SaveScope::Notes => Some(&mut self.notes),
            SaveScope::Expenses => Some(&mut self.expenses),
            SaveScope::Income => Some(&mut self.income),
            SaveScope::Settings => Some(&mut self.settings),
            SaveScope::All => None,
        }
    }

    pub fn get(&self, scope: SaveScope) -> Option<&Snapshot> {
        match scope {
            SaveScope::Notes => self.notes.as_ref(),
            SaveScope::Expenses => self.expenses.as_ref(),
            SaveScope::Income => self.income.as_ref(),
            SaveScope::Settings => self.settings.as_ref(),
            SaveScope::All => None,
        }
    }

    pub fn store(&mut self, scope: SaveScope, snapshot: Snapshot) {
        if let Some(slot) = self.slot_mut(scope) {
            *slot = Some(snapshot);
        }
    }

    pub fn clear(&mut self) {
        *self = StorageCache::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Serialize)]
    struct Row {
        id: String,
        value: i32,
    }

    fn row(id: &str, value: i32) -> Row {
        Row {
            id: id.to_string(),
            value,
        }
    }

    fn snap(rows: &[Row]) -> Snapshot {
        Snapshot::build(rows, |r: &Row| r.id.as_str(), json!({"mode": "month"})).unwrap()
    }

    #[test]
    fn order_does_not_matter() {
        let a = snap(&[row("1", 1), row("2", 2)]);
        let b = snap(&[row("2", 2), row("1", 1)]);
        assert_eq!(a, b);
        assert!(!b.diff(Some(&a)).has_changes());
    }

    #[test]
    fn diff_lists_each_kind_of_change() {
        let before = snap(&[row("1", 1), row("2", 2)]);
        let after = snap(&[row("2", 20), row("3", 3)]);
        let summary = after.diff(Some(&before));
        assert_eq!(summary.added, vec!["3"]);
        assert_eq!(summary.removed, vec!["1"]);
        assert_eq!(summary.modified, vec!["2"]);
        assert!(!summary.extras_changed);
    }

    #[test]
    fn first_snapshot_is_all_added() {
        let summary = snap(&[row("1", 1)]).diff(None);
        assert!(summary.has_changes());
        assert_eq!(summary.added, vec!["1"]);
    }

    #[test]
    fn duplicate_ids_rejected() {
        let err = Snapshot::build(&[row("1", 1), row("1", 2)], |r: &Row| r.id.as_str(), Value::Null)
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION/DUPLICATE_ID");
    }

    #[test]
    fn cache_slots_are_independent() {
        let mut cache = StorageCache::default();
        cache.store(SaveScope::Notes, snap(&[row("1", 1)]));
        assert!(cache.get(SaveScope::Notes).is_some());
        assert!(cache.get(SaveScope::Expenses).is_none());
        cache.store(SaveScope::All, snap(&[]));
        assert!(cache.get(SaveScope::All).is_none());
        cache.clear();
        assert!(cache.get(SaveScope::Notes).is_none());
    }
}
