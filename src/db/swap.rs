use std::fs::{self, File};
use std::io;
use std::path::Path;

use tracing::{info, warn};

use crate::db::{sidecar_path, sync_dir, JOURNAL_SUFFIXES};
use crate::{AppError, AppResult};

const RESTORE_PARTIAL_SUFFIX: &str = ".restore-partial";

fn sync_file(path: &Path) -> io::Result<()> {
    let file = File::open(path)?;
    file.sync_all()
}

fn remove_if_present(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}

/// Delete WAL, shared-memory and rollback journal files left next to
/// `live_path`. Failures are logged and skipped. Returns the number of files
/// removed.
pub fn remove_stale_journals(live_path: &Path) -> usize {
    let mut removed = 0;
    for suffix in JOURNAL_SUFFIXES {
        let sidecar = sidecar_path(live_path, suffix);
        match remove_if_present(&sidecar) {
            Ok(true) => removed += 1,
            Ok(false) => {}
            Err(err) => warn!(
                target: "keepsake",
                event = "stale_journal_remove_failed",
                path = %sidecar.display(),
                error = %err
            ),
        }
    }
    removed
}

/// Replace the live database file with a copy of `source`.
///
/// The copy lands in a sibling partial file first and is promoted with a
/// rename, so a crash mid-copy leaves the live file untouched. The connection
/// to `live_path` must be closed before calling this.
pub fn restore_file_into_place(source: &Path, live_path: &Path) -> AppResult<()> {
    let parent = live_path.parent().ok_or_else(|| {
        AppError::new(
            "DB_SWAP/NO_PARENT",
            "Database path does not have a parent directory",
        )
        .with_context("path", live_path.display().to_string())
    })?;
    fs::create_dir_all(parent).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "create_data_dir")
            .with_context("path", parent.display().to_string())
    })?;

    let partial = sidecar_path(live_path, RESTORE_PARTIAL_SUFFIX);
    remove_if_present(&partial).ok();

    let copied = fs::copy(source, &partial).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "copy_backup")
            .with_context("from", source.display().to_string())
            .with_context("to", partial.display().to_string())
    });
    let copied = match copied {
        Ok(bytes) => bytes,
        Err(err) => {
            remove_if_present(&partial).ok();
            return Err(err);
        }
    };
    if let Err(err) = sync_file(&partial) {
        remove_if_present(&partial).ok();
        return Err(AppError::from(err)
            .with_context("operation", "sync_restore_copy")
            .with_context("path", partial.display().to_string()));
    }

    let removed = remove_stale_journals(live_path);

    if let Err(err) = fs::rename(&partial, live_path) {
        remove_if_present(&partial).ok();
        return Err(AppError::from(err)
            .with_context("operation", "promote_restored_db")
            .with_context("from", partial.display().to_string())
            .with_context("to", live_path.display().to_string()));
    }

    sync_file(live_path).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "sync_live_db")
            .with_context("path", live_path.display().to_string())
    })?;
    sync_dir(parent).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "sync_parent_dir")
            .with_context("path", parent.display().to_string())
    })?;

    info!(
        target: "keepsake",
        event = "db_restored_into_place",
        source = %source.display(),
        live = %live_path.display(),
        bytes = copied,
        stale_journals_removed = removed
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_file(path: &Path, contents: &[u8]) {
        std::fs::write(path, contents).expect("write file");
    }

    #[test]
    fn restore_replaces_live_and_drops_journals() {
        let dir = tempdir().unwrap();
        let live = dir.path().join("appdata.db");
        let backup = dir.path().join("backup.db");
        write_file(&live, b"old");
        write_file(&sidecar_path(&live, "-wal"), b"stale wal");
        write_file(&sidecar_path(&live, "-shm"), b"stale shm");
        write_file(&backup, b"new");

        restore_file_into_place(&backup, &live).expect("restore succeeds");

        assert_eq!(std::fs::read(&live).unwrap(), b"new".as_slice());
        assert!(backup.exists(), "backup must be copied, not moved");
        assert!(!sidecar_path(&live, "-wal").exists());
        assert!(!sidecar_path(&live, "-shm").exists());
        assert!(!sidecar_path(&live, RESTORE_PARTIAL_SUFFIX).exists());
    }

    #[test]
    fn restore_creates_missing_live_file() {
        let dir = tempdir().unwrap();
        let live = dir.path().join("data").join("appdata-test.db");
        let backup = dir.path().join("backup.db");
        write_file(&backup, b"snapshot");

        restore_file_into_place(&backup, &live).expect("restore succeeds");
        assert_eq!(std::fs::read(&live).unwrap(), b"snapshot".as_slice());
    }

    #[test]
    fn missing_source_leaves_live_untouched() {
        let dir = tempdir().unwrap();
        let live = dir.path().join("appdata.db");
        write_file(&live, b"keep me");

        let err = restore_file_into_place(&dir.path().join("nope.db"), &live)
            .expect_err("missing source rejected");
        assert_eq!(err.code(), "IO/NotFound");
        assert_eq!(std::fs::read(&live).unwrap(), b"keep me".as_slice());
    }
}
