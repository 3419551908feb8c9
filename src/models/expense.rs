use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    Daily,
    Weekly,
    Biweekly,
    Monthly,
    Quarterly,
    Yearly,
}

fn default_interval() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecurrenceSettings {
    pub frequency: Frequency,
    #[serde(default = "default_interval")]
    pub interval: u32,
    /// Number of occurrences to generate; open-ended when absent.
    #[serde(default)]
    pub occurrences: Option<u32>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExpenseType {
    #[default]
    Need,
    Want,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Importance {
    #[default]
    None,
    Medium,
    High,
    Critical,
}

/// Amount, due date and payment method captured when an occurrence was
/// generated from its template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitialState {
    pub amount: f64,
    #[serde(default)]
    pub due_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub payment_method: String,
}

/// Sparse per-period override; `None` fields inherit from the expense.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonthlyOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_paid: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Expense {
    pub id: String,
    pub name: String,
    pub amount: f64,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub payment_method: String,
    #[serde(default)]
    pub due_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_recurring: bool,
    #[serde(default)]
    pub recurrence: Option<RecurrenceSettings>,
    #[serde(default)]
    pub is_paid: bool,
    #[serde(default)]
    pub payment_date: Option<DateTime<Utc>>,
    #[serde(default, rename = "type")]
    pub expense_type: ExpenseType,
    #[serde(default)]
    pub importance: Importance,
    #[serde(default)]
    pub notify: bool,
    #[serde(default)]
    pub parent_expense_id: Option<String>,
    /// Keyed by period (`YYYY-MM`).
    #[serde(default)]
    pub monthly_overrides: BTreeMap<String, MonthlyOverride>,
    #[serde(default)]
    pub is_modified: bool,
    #[serde(default)]
    pub initial_state: Option<InitialState>,
}

impl Expense {
    pub fn new(id: impl Into<String>, name: impl Into<String>, amount: f64) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            amount,
            category: String::new(),
            payment_method: String::new(),
            due_date: None,
            is_recurring: false,
            recurrence: None,
            is_paid: false,
            payment_date: None,
            expense_type: ExpenseType::Need,
            importance: Importance::None,
            notify: false,
            parent_expense_id: None,
            monthly_overrides: BTreeMap::new(),
            is_modified: false,
            initial_state: None,
        }
    }

    pub fn is_template(&self) -> bool {
        self.is_recurring && self.parent_expense_id.is_none()
    }

    pub fn is_occurrence(&self) -> bool {
        self.parent_expense_id.is_some()
    }

    /// Build one concrete billing instance of `template` due at `due_date`.
    pub fn occurrence_of(template: &Expense, due_date: DateTime<Utc>) -> Expense {
        let mut occurrence = Expense {
            id: uuid::Uuid::new_v4().to_string(),
            due_date: Some(due_date),
            is_recurring: false,
            recurrence: None,
            is_paid: false,
            payment_date: None,
            parent_expense_id: Some(template.id.clone()),
            monthly_overrides: BTreeMap::new(),
            is_modified: false,
            initial_state: None,
            ..template.clone()
        };
        occurrence.initial_state = Some(occurrence.current_state());
        occurrence
    }

    fn current_state(&self) -> InitialState {
        InitialState {
            amount: self.amount,
            due_date: self.due_date,
            payment_method: self.payment_method.clone(),
        }
    }

    /// Fill in a missing `initial_state` on occurrences from the row's own
    /// values. Returns true when something was added.
    pub fn ensure_initial_state(&mut self) -> bool {
        if self.is_occurrence() && self.initial_state.is_none() {
            self.initial_state = Some(self.current_state());
            return true;
        }
        false
    }

    /// Occurrences never carry the recurring flag themselves.
    /// Returns true when the flag had to be cleared.
    pub fn enforce_occurrence_invariant(&mut self) -> bool {
        if self.is_occurrence() && self.is_recurring {
            self.is_recurring = false;
            self.recurrence = None;
            return true;
        }
        false
    }

    /// Whether the tracked fields moved away from the captured initial state.
    pub fn diverges_from_initial(&self) -> bool {
        match &self.initial_state {
            Some(initial) => {
                initial.amount != self.amount
                    || initial.due_date != self.due_date
                    || initial.payment_method != self.payment_method
            }
            None => false,
        }
    }

    /// Restore amount, due date and payment method from the initial state.
    pub fn reset_to_initial(&mut self) {
        if let Some(initial) = self.initial_state.clone() {
            self.amount = initial.amount;
            self.due_date = initial.due_date;
            self.payment_method = initial.payment_method;
            self.is_modified = false;
        }
    }
}

fn default_overview_mode() -> String {
    "month".to_string()
}

/// The expense collection together with the scalar settings that travel
/// alongside it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpensesState {
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

impl Default for ExpensesState {
    fn default() -> Self {
        Self {
            expenses: Vec::new(),
            categories: Vec::new(),
            category_colors: BTreeMap::new(),
            payment_methods: Vec::new(),
            selected_month: None,
            overview_mode: default_overview_mode(),
        }
    }
}

impl ExpensesState {
    /// Occurrences whose template is no longer part of the collection.
    pub fn orphaned_occurrences(&self) -> Vec<&Expense> {
        let ids: HashSet<&str> = self.expenses.iter().map(|e| e.id.as_str()).collect();
        self.expenses
            .iter()
            .filter(|e| {
                e.parent_expense_id
                    .as_deref()
                    .map(|parent| !ids.contains(parent))
                    .unwrap_or(false)
            })
            .collect()
    }

    /// Remove a template. Its occurrences are kept unless `cascade` is set.
    /// Returns the ids that were removed.
    pub fn remove_template(&mut self, template_id: &str, cascade: bool) -> Vec<String> {
        let mut removed = Vec::new();
        self.expenses.retain(|expense| {
            let is_target = expense.id == template_id;
            let is_child = cascade && expense.parent_expense_id.as_deref() == Some(template_id);
            if is_target || is_child {
                removed.push(expense.id.clone());
                false
            } else {
                true
            }
        });
        removed
    }
}
