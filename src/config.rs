use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::environment::Environment;

pub const APP_DIR_NAME: &str = "com.keepsake.app";
const BACKUP_DIR_NAME: &str = "backups";

const DEFAULT_IDLE_CLOSE: Duration = Duration::from_secs(2);
const DEFAULT_QUEUE_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_LOAD_RETRIES: u32 = 3;
const DEFAULT_LOAD_RETRY_DELAY: Duration = Duration::from_millis(500);
const DEFAULT_AUTO_BACKUP_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);
const DEFAULT_MAX_AUTO_BACKUPS: usize = 7;
const HARD_MAX_AUTO_BACKUPS: usize = 50;
const MAX_AUTO_BACKUP_HOURS: u64 = 24 * 366;

#[derive(Debug, Clone)]
pub struct AutoBackupConfig {
    pub enabled: bool,
    pub interval: Duration,
    pub max_auto_backups: usize,
}

impl Default for AutoBackupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: DEFAULT_AUTO_BACKUP_INTERVAL,
            max_auto_backups: DEFAULT_MAX_AUTO_BACKUPS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Directory holding `appdata.db` / `appdata-test.db`.
    pub data_dir: PathBuf,
    /// User-chosen backup location; `<data_dir>/backups` when unset.
    pub backup_dir: Option<PathBuf>,
    /// Forces the environment instead of probing the build type.
    pub environment: Option<Environment>,
    pub idle_close_delay: Duration,
    pub queue_timeout: Duration,
    pub load_retries: u32,
    pub load_retry_delay: Duration,
    pub export_expenses_on_backup: bool,
    pub auto_backup: AutoBackupConfig,
}

impl StorageConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            backup_dir: None,
            environment: None,
            idle_close_delay: DEFAULT_IDLE_CLOSE,
            queue_timeout: DEFAULT_QUEUE_TIMEOUT,
            load_retries: DEFAULT_LOAD_RETRIES,
            load_retry_delay: DEFAULT_LOAD_RETRY_DELAY,
            export_expenses_on_backup: true,
            auto_backup: AutoBackupConfig::default(),
        }
    }

    /// Build a configuration from `KEEPSAKE_*` environment variables,
    /// falling back to the platform data directory.
    pub fn from_env() -> Self {
        let data_dir = env::var_os("KEEPSAKE_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(default_data_dir);
        let mut config = Self::new(data_dir);

        config.backup_dir = env::var_os("KEEPSAKE_BACKUP_DIR").map(PathBuf::from);
        config.environment = env::var("KEEPSAKE_ENV")
            .ok()
            .and_then(|value| value.parse::<Environment>().ok());

        if let Some(ms) = env_u64("KEEPSAKE_IDLE_CLOSE_MS") {
            config.idle_close_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64("KEEPSAKE_QUEUE_TIMEOUT_MS").filter(|ms| *ms > 0) {
            config.queue_timeout = Duration::from_millis(ms);
        }
        if let Some(hours) = env_u64("KEEPSAKE_AUTO_BACKUP_HOURS").filter(|h| *h > 0) {
            config.auto_backup.interval = auto_backup_interval(hours);
        }
        if let Some(max) = env_u64("KEEPSAKE_MAX_AUTO_BACKUPS").filter(|max| *max > 0) {
            config.auto_backup.max_auto_backups = (max as usize).min(HARD_MAX_AUTO_BACKUPS);
        }
        config
    }

    pub fn with_environment(mut self, environment: Environment) -> Self {
        self.environment = Some(environment);
        self
    }

    pub fn with_backup_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.backup_dir = Some(dir.into());
        self
    }

    pub fn db_path(&self, environment: Environment) -> PathBuf {
        self.data_dir.join(environment.db_file_name())
    }

    pub fn resolved_backup_dir(&self) -> PathBuf {
        self.backup_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join(BACKUP_DIR_NAME))
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }
}

/// Auto backup period for a configured number of hours, capped at a year.
fn auto_backup_interval(hours: u64) -> Duration {
    Duration::from_secs(hours.min(MAX_AUTO_BACKUP_HOURS) * 60 * 60)
}

fn env_u64(key: &str) -> Option<u64> {
    env::var(key).ok().and_then(|value| value.trim().parse::<u64>().ok())
}

fn default_data_dir() -> PathBuf {
    let base = dirs::data_dir()
        .or_else(|| env::current_dir().ok())
        .unwrap_or_else(env::temp_dir);
    base.join(APP_DIR_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = StorageConfig::new("/tmp/keepsake");
        assert_eq!(config.idle_close_delay, Duration::from_secs(2));
        assert_eq!(config.queue_timeout, Duration::from_secs(10));
        assert_eq!(config.load_retries, 3);
        assert_eq!(config.auto_backup.max_auto_backups, DEFAULT_MAX_AUTO_BACKUPS);
        assert_eq!(
            config.resolved_backup_dir(),
            PathBuf::from("/tmp/keepsake/backups")
        );
    }

    #[test]
    fn huge_auto_backup_hours_are_capped() {
        assert_eq!(auto_backup_interval(6), Duration::from_secs(6 * 3600));
        assert_eq!(
            auto_backup_interval(u64::MAX),
            Duration::from_secs(MAX_AUTO_BACKUP_HOURS * 3600)
        );
    }

    #[test]
    fn db_path_follows_environment() {
        let config = StorageConfig::new("/data");
        assert_eq!(
            config.db_path(Environment::Production),
            PathBuf::from("/data/appdata.db")
        );
        assert_eq!(
            config.db_path(Environment::Test),
            PathBuf::from("/data/appdata-test.db")
        );
    }

    #[test]
    fn backup_dir_override_wins() {
        let config = StorageConfig::new("/data").with_backup_dir("/elsewhere");
        assert_eq!(config.resolved_backup_dir(), PathBuf::from("/elsewhere"));
    }
}
