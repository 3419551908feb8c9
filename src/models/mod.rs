use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod expense;
pub mod income;
pub mod note;

pub use expense::{
    Expense, ExpenseType, ExpensesState, Frequency, Importance, InitialState, MonthlyOverride,
    RecurrenceSettings,
};
pub use income::{IncomeEntry, IncomeState};
pub use note::{Folder, Note, NotesState, INBOX_FOLDER_ID};

/// Everything the engine persists, grouped by domain.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppData {
    #[serde(default)]
    pub notes: NotesState,
    #[serde(default)]
    pub expenses: ExpensesState,
    #[serde(default)]
    pub income: IncomeState,
    /// Free-form application settings (theme and friends), stored under the
    /// `settings_` key prefix.
    #[serde(default)]
    pub settings: BTreeMap<String, Value>,
}

/// Which part of [`AppData`] a save should diff and persist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SaveScope {
    All,
    Notes,
    Expenses,
    Income,
    Settings,
}

impl SaveScope {
    pub fn includes(self, part: SaveScope) -> bool {
        self == SaveScope::All || self == part
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SaveScope::All => "all",
            SaveScope::Notes => "notes",
            SaveScope::Expenses => "expenses",
            SaveScope::Income => "income",
            SaveScope::Settings => "settings",
        }
    }
}
