#![allow(clippy::unwrap_used, clippy::expect_used)]

mod util;

use anyhow::Result;
use keepsake_lib::{AppData, Environment, SaveScope};
use tempfile::tempdir;

use util::{engine_in, note};

// Lives in its own binary: the override is process-wide.
#[tokio::test]
async fn backup_refuses_when_disk_is_nearly_full() -> Result<()> {
    std::env::set_var("KEEPSAKE_BACKUP_FAKE_FREE_BYTES", "1");

    let dir = tempdir()?;
    let engine = engine_in(dir.path(), Environment::Test);
    engine.load_data().await?;
    let mut data = AppData::default();
    data.notes.notes = vec![note("n1", "inbox")];
    engine.save_data(data, SaveScope::Notes).await?;

    let result = engine.create_backup(None).await?;
    assert!(!result.success);
    assert_eq!(result.error_code.as_deref(), Some("DB_BACKUP/LOW_DISK"));
    assert!(result.error.unwrap_or_default().starts_with("Not enough disk space"));
    assert!(engine.list_backups().await?.is_empty());
    Ok(())
}
