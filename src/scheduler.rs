use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::engine::StorageEngine;

/// Periodic auto-backup task. The first tick fires immediately, so an
/// overdue backup is taken right after startup; a backup that is not yet due
/// is skipped by the tick itself.
#[derive(Debug)]
pub struct AutoBackupScheduler {
    stop: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl AutoBackupScheduler {
    pub fn spawn(engine: StorageEngine, period: Duration) -> Self {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let period = period.max(Duration::from_millis(1));
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(
                target: "keepsake",
                event = "auto_backup_scheduler_started",
                period_secs = period.as_secs()
            );
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        match engine.run_auto_backup().await {
                            Ok(outcome) => {
                                if let Some(created) = &outcome.created {
                                    info!(
                                        target: "keepsake",
                                        event = "auto_backup_tick",
                                        created = %created.filename,
                                        removed = outcome.removed
                                    );
                                }
                            }
                            Err(err) => warn!(
                                target: "keepsake",
                                event = "auto_backup_tick_failed",
                                code = %err.code(),
                                error = %err
                            ),
                        }
                    }
                }
            }
            info!(target: "keepsake", event = "auto_backup_scheduler_stopped");
        });
        Self {
            stop: Some(stop_tx),
            handle: Some(handle),
        }
    }

    /// Stop ticking and wait for an in-flight tick to finish.
    pub async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.handle.take() {
            if let Err(err) = handle.await {
                warn!(target: "keepsake", event = "auto_backup_scheduler_join_failed", error = %err);
            }
        }
    }
}

impl Drop for AutoBackupScheduler {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::environment::Environment;
    use tempfile::tempdir;

    #[tokio::test]
    async fn first_tick_creates_an_auto_backup() {
        let dir = tempdir().unwrap();
        let config = StorageConfig::new(dir.path()).with_environment(Environment::Test);
        let engine = StorageEngine::new(config);
        engine.load_data().await.unwrap();

        let scheduler = AutoBackupScheduler::spawn(engine.clone(), Duration::from_secs(3600));
        let mut found = Vec::new();
        for _ in 0..50 {
            found = engine.list_backups().await.unwrap();
            if !found.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        scheduler.stop().await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].metadata.kind, crate::db::metadata::BackupKind::Auto);
    }
}
