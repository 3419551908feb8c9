//! Local persistence for notes, expenses and income.
//!
//! [`StorageEngine`] is the entry point: it owns the single SQLite handle,
//! serializes every operation through a queue, skips writes that would not
//! change anything, and manages backups with restore safety checks.

pub mod config;
pub mod db;
pub mod engine;
pub mod environment;
mod error;
pub mod logging;
pub mod migrations;
pub mod models;
pub mod scheduler;
pub mod store;
pub mod time;

pub use config::{AutoBackupConfig, StorageConfig};
pub use db::backup::{
    AutoBackupOutcome, BackupInfo, BackupService, CreateBackupResult, DeleteBackupResult,
    RestoreOptions, RestoreResult,
};
pub use db::connection::{ConnState, ConnectionManager};
pub use db::metadata::{BackupKind, BackupMetadata};
pub use db::queue::OperationQueue;
pub use db::schema::SchemaManager;
pub use engine::{SaveReport, ScopeReport, StorageEngine, StorageStatus};
pub use environment::Environment;
pub use error::{AppError, AppResult};
pub use logging::{init_logging, init_logging_with_file};
pub use migrations::{MigrationRegistry, MigrationStep, SCHEMA_VERSION};
pub use models::{AppData, SaveScope};
pub use scheduler::AutoBackupScheduler;
