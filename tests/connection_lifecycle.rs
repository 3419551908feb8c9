#![allow(clippy::unwrap_used, clippy::expect_used)]

mod util;

use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use keepsake_lib::{AppData, ConnState, Environment, SaveScope};
use tempfile::tempdir;

use util::{engine_in, note};

#[tokio::test]
async fn handle_closes_when_idle_and_reopens_on_demand() -> Result<()> {
    let dir = tempdir()?;
    let engine = engine_in(dir.path(), Environment::Test);

    engine.load_data().await?;
    assert_eq!(engine.connections().ref_count(), 0);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(engine.connections().state(), ConnState::Closed);

    let mut data = AppData::default();
    data.notes.notes = vec![note("n1", "inbox")];
    engine.save_data(data, SaveScope::Notes).await?;
    assert!(engine.connections().is_schema_verified());
    assert_eq!(engine.load_data().await?.notes.notes.len(), 1);
    Ok(())
}

#[tokio::test]
async fn concurrent_saves_are_applied_in_submission_order() -> Result<()> {
    let dir = tempdir()?;
    let engine = engine_in(dir.path(), Environment::Test);
    engine.load_data().await?;

    let mut saves = Vec::new();
    for idx in 0..5 {
        let mut data = AppData::default();
        data.notes.notes = (0..=idx).map(|n| note(&format!("n{n}"), "inbox")).collect();
        saves.push(engine.save_data(data, SaveScope::Notes));
    }
    // join_all polls in order, so the saves enter the queue in order.
    for report in futures::future::join_all(saves).await {
        assert!(report?.written);
    }

    let loaded = engine.load_data().await?;
    assert_eq!(loaded.notes.notes.len(), 5);
    assert_eq!(engine.write_transactions(), 5);
    Ok(())
}

#[tokio::test]
async fn switching_environment_points_at_the_other_file() -> Result<()> {
    let dir = tempdir()?;
    let engine = engine_in(dir.path(), Environment::Test);
    engine.load_data().await?;
    let mut data = AppData::default();
    data.notes.notes = vec![note("synthetic", "inbox")];
    engine.save_data(data, SaveScope::Notes).await?;

    engine.switch_environment(Environment::Production).await?;
    assert_eq!(engine.environment(), Environment::Production);
    assert!(engine.db_path().ends_with("appdata.db"));
    assert!(engine.load_data().await?.notes.notes.is_empty());

    // The cache was reset, so saving the same note here is a real write.
    let mut data = AppData::default();
    data.notes.notes = vec![note("synthetic", "inbox")];
    assert!(engine.save_data(data, SaveScope::Notes).await?.written);

    engine.switch_environment(Environment::Test).await?;
    assert_eq!(engine.load_data().await?.notes.notes.len(), 1);
    assert!(dir.path().join("appdata.db").exists());
    assert!(dir.path().join("appdata-test.db").exists());
    Ok(())
}

#[tokio::test]
async fn reinitialize_keeps_data_and_reverifies_schema() -> Result<()> {
    let dir = tempdir()?;
    let engine = engine_in(dir.path(), Environment::Test);
    engine.load_data().await?;
    let mut data = AppData::default();
    data.notes.notes = vec![note("n1", "inbox")];
    engine.save_data(data.clone(), SaveScope::Notes).await?;

    engine.reinitialize().await?;
    assert!(!engine.connections().is_open());
    assert!(!engine.connections().is_schema_verified());

    // Cache cleared: the first save after reinitialize writes again.
    assert!(engine.save_data(data, SaveScope::Notes).await?.written);
    assert_eq!(engine.write_transactions(), 2);
    Ok(())
}

#[tokio::test]
async fn load_retries_while_another_process_holds_the_write_lock() -> Result<()> {
    let dir = tempdir()?;
    let engine = engine_in(dir.path(), Environment::Test);
    engine.load_data().await?;
    let mut data = AppData::default();
    data.notes.notes = vec![note("kept", "inbox")];
    engine.save_data(data, SaveScope::Notes).await?;
    engine.connections().close_now().await;

    let path = engine.db_path();
    let (locked_tx, locked_rx) = mpsc::channel();
    let holder = thread::spawn(move || -> rusqlite::Result<()> {
        let conn = rusqlite::Connection::open(&path)?;
        conn.execute_batch("BEGIN EXCLUSIVE;")?;
        let _ = locked_tx.send(());
        thread::sleep(Duration::from_millis(6500));
        conn.execute_batch("COMMIT;")
    });
    locked_rx.recv()?;

    let started = Instant::now();
    let loaded = engine.load_data().await?;
    assert!(started.elapsed() >= Duration::from_secs(5));
    assert_eq!(loaded.notes.notes.len(), 1);
    assert_eq!(loaded.notes.notes[0].id, "kept");
    holder.join().expect("lock holder thread")?;
    Ok(())
}

#[tokio::test]
async fn permanent_load_failures_are_not_retried() -> Result<()> {
    let dir = tempdir()?;
    let engine = engine_in(dir.path(), Environment::Test);
    engine.load_data().await?;
    engine.connections().close_now().await;

    let conn = rusqlite::Connection::open(engine.db_path())?;
    conn.execute("UPDATE metadata SET version = '9.9.9' WHERE id = 1", [])?;
    drop(conn);

    let started = Instant::now();
    let err = engine.load_data().await.unwrap_err();
    assert_eq!(err.code(), "SCHEMA/NEWER_VERSION");
    assert!(!err.is_transient());
    assert_eq!(err.context().get("attempts").map(String::as_str), Some("1"));
    assert!(started.elapsed() < Duration::from_secs(2));
    Ok(())
}
