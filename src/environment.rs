use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::AppError;

pub const PRODUCTION_DB_FILE: &str = "appdata.db";
pub const TEST_DB_FILE: &str = "appdata-test.db";

/// Selects which database file the engine works against.
///
/// The test database holds synthetic data and is kept apart from production
/// so that it can never silently replace real records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Production,
    Test,
}

impl Environment {
    pub fn db_file_name(self) -> &'static str {
        match self {
            Environment::Production => PRODUCTION_DB_FILE,
            Environment::Test => TEST_DB_FILE,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Environment::Production => "production",
            Environment::Test => "test",
        }
    }

    /// Environment used when nothing else was configured.
    pub fn detect() -> Self {
        if is_dev_build() {
            Environment::Test
        } else {
            Environment::Production
        }
    }
}

/// Development builds default to the isolated test database.
pub fn is_dev_build() -> bool {
    cfg!(debug_assertions)
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Environment {
    type Err = AppError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "production" | "prod" => Ok(Environment::Production),
            "test" | "dev" | "development" => Ok(Environment::Test),
            other => Err(AppError::new(
                "CONFIG/INVALID_ENVIRONMENT",
                format!("Unknown environment `{other}`"),
            )),
        }
    }
}
