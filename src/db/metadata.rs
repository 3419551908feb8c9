use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::db::{sidecar_path, write_atomic};
use crate::environment::Environment;
use crate::{AppError, AppResult};

pub const DB_EXTENSION: &str = ".db";
pub const METADATA_SUFFIX: &str = ".meta.json";
pub const EXPORT_SUFFIX: &str = "-expenses.json";

const BACKUP_PREFIX: &str = "backup";
const PRE_RESTORE_PREFIX: &str = "pre-restore";
const TEST_MARKER: &str = "test";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H-%M-%S-%3fZ";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackupKind {
    #[default]
    Manual,
    Auto,
    PreRestore,
}

impl BackupKind {
    fn file_prefix(self) -> &'static str {
        match self {
            BackupKind::Manual | BackupKind::Auto => BACKUP_PREFIX,
            BackupKind::PreRestore => PRE_RESTORE_PREFIX,
        }
    }
}

/// Sidecar written next to every backup as `<name>.db.meta.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupMetadata {
    pub id: String,
    pub created_at: DateTime<Utc>,
    /// Schema version of the database at the time of the backup.
    pub version: String,
    pub environment: Environment,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub has_expense_export: bool,
    #[serde(default)]
    pub kind: BackupKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_version: Option<String>,
    #[serde(default)]
    pub db_size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

/// What can be recovered from a backup file name alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedBackupName {
    pub kind: BackupKind,
    pub environment: Environment,
    pub created_at: Option<DateTime<Utc>>,
}

pub fn backup_file_name(kind: BackupKind, environment: Environment, at: &DateTime<Utc>) -> String {
    let env_marker = match environment {
        Environment::Production => String::new(),
        Environment::Test => format!("-{TEST_MARKER}"),
    };
    format!(
        "{}{}-{}{}",
        kind.file_prefix(),
        env_marker,
        at.format(TIMESTAMP_FORMAT),
        DB_EXTENSION
    )
}

pub fn parse_backup_file_name(name: &str) -> Option<ParsedBackupName> {
    let stem = name.strip_suffix(DB_EXTENSION)?;
    let (kind, rest) = if let Some(rest) = stem.strip_prefix(PRE_RESTORE_PREFIX) {
        (BackupKind::PreRestore, rest)
    } else if let Some(rest) = stem.strip_prefix(BACKUP_PREFIX) {
        (BackupKind::Manual, rest)
    } else {
        return None;
    };
    let rest = rest.strip_prefix('-')?;
    let (environment, stamp) = match rest.strip_prefix(TEST_MARKER) {
        Some(stamp) if stamp.starts_with('-') => (Environment::Test, &stamp[1..]),
        _ => (Environment::Production, rest),
    };
    Some(ParsedBackupName {
        kind,
        environment,
        created_at: parse_stamp(stamp),
    })
}

fn parse_stamp(stamp: &str) -> Option<DateTime<Utc>> {
    for fmt in [TIMESTAMP_FORMAT, "%Y-%m-%dT%H-%M-%SZ", "%Y%m%d-%H%M%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(stamp, fmt) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    None
}

pub fn metadata_path(backup_path: &Path) -> PathBuf {
    sidecar_path(backup_path, METADATA_SUFFIX)
}

pub fn export_path(backup_path: &Path) -> PathBuf {
    let name = backup_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let stem = name.strip_suffix(DB_EXTENSION).unwrap_or(&name);
    backup_path.with_file_name(format!("{stem}{EXPORT_SUFFIX}"))
}

/// Reject names that could escape the backup directory.
pub fn validate_backup_file_name(name: &str) -> AppResult<()> {
    let invalid = name.is_empty()
        || name.contains('/')
        || name.contains('\\')
        || name.contains("..")
        || !name.ends_with(DB_EXTENSION);
    if invalid {
        return Err(AppError::new(
            "DB_BACKUP/INVALID_PATH",
            "Backup name must be a plain .db file inside the backups directory",
        )
        .with_context("name", name.to_string()));
    }
    Ok(())
}

pub fn read_metadata(path: &Path) -> AppResult<BackupMetadata> {
    let bytes = fs::read(path).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "read_backup_metadata")
            .with_context("path", path.display().to_string())
    })?;
    serde_json::from_slice(&bytes).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "parse_backup_metadata")
            .with_context("path", path.display().to_string())
    })
}

pub fn write_metadata(path: &Path, metadata: &BackupMetadata) -> AppResult<()> {
    let payload = serde_json::to_vec_pretty(metadata)
        .map_err(|err| AppError::from(err).with_context("operation", "serialize_backup_metadata"))?;
    write_atomic(path, &payload).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "write_backup_metadata")
            .with_context("path", path.display().to_string())
    })
}

pub fn file_sha256(path: &Path) -> AppResult<String> {
    let mut file = File::open(path).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "open_for_hashing")
            .with_context("path", path.display().to_string())
    })?;
    let mut hasher = Sha256::new();
    let mut buf = [0_u8; 8192];
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}
