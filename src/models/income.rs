use std::collections::HashMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomeEntry {
    pub id: String,
    pub date: NaiveDate,
    pub amount: f64,
    #[serde(default)]
    pub hours: Option<u32>,
    #[serde(default)]
    pub minutes: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomeState {
    #[serde(default)]
    pub entries: Vec<IncomeEntry>,
}

impl IncomeState {
    /// Keep one entry per date; the last one submitted for a date wins.
    /// Returns the number of dropped entries.
    pub fn dedupe_by_date(&mut self) -> usize {
        let mut last_index: HashMap<NaiveDate, usize> = HashMap::new();
        for (idx, entry) in self.entries.iter().enumerate() {
            last_index.insert(entry.date, idx);
        }
        let before = self.entries.len();
        let mut idx = 0;
        self.entries.retain(|entry| {
            let keep = last_index.get(&entry.date) == Some(&idx);
            idx += 1;
            keep
        });
        before - self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, date: &str, amount: f64) -> IncomeEntry {
        IncomeEntry {
            id: id.into(),
            date: NaiveDate::parse_from_str(date, "%Y-%m-%d").unwrap(),
            amount,
            hours: None,
            minutes: None,
        }
    }

    #[test]
    fn dedupe_keeps_last_entry_per_date() {
        let mut state = IncomeState {
            entries: vec![
                entry("a", "2024-01-01", 100.0),
                entry("b", "2024-01-02", 50.0),
                entry("c", "2024-01-01", 120.0),
            ],
        };
        assert_eq!(state.dedupe_by_date(), 1);
        let ids: Vec<&str> = state.entries.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);
    }
}
