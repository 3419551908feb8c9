use std::collections::BTreeSet;

use serde_json::{json, Map};
use sqlx::{Row, SqliteConnection};
use tracing::{info, warn};

use crate::models::{Folder, Note, NotesState};
use crate::store::cache::Snapshot;
use crate::store::{decode_json, timestamp_or_epoch};
use crate::time::format_timestamp;
use crate::{AppError, AppResult};

/// Validate and normalize a notes collection before it is written.
///
/// Folder cycles are rejected. Dangling parents move to the root and notes
/// pointing at unknown folders move to the inbox.
pub fn prepare(state: &NotesState) -> AppResult<NotesState> {
    let mut prepared = state.clone();
    prepared.validate_folder_tree()?;
    let reparented = prepared.repair_folder_parents();
    let reassigned = prepared.ensure_valid_folders();
    if reparented > 0 || reassigned > 0 {
        warn!(
            target: "keepsake",
            event = "notes_folders_repaired",
            reparented,
            reassigned
        );
    }
    Ok(prepared)
}

pub fn snapshot(state: &NotesState) -> AppResult<Snapshot> {
    let mut folders = Map::new();
    for folder in &state.folders {
        folders.insert(folder.id.clone(), serde_json::to_value(folder)?);
    }
    Snapshot::build(&state.notes, |n: &Note| n.id.as_str(), json!({ "folders": folders }))
}

pub async fn load(conn: &mut SqliteConnection) -> AppResult<NotesState> {
    let rows = sqlx::query(
        "SELECT id, title, content, tags, folder_id, created_at, updated_at, archived \
         FROM notes ORDER BY created_at, id",
    )
    .fetch_all(&mut *conn)
    .await
    .map_err(|err| AppError::from(err).with_context("operation", "load_notes"))?;

    let mut notes = Vec::with_capacity(rows.len());
    for row in rows {
        let id: String = row.try_get("id")?;
        let created_at = timestamp_or_epoch(row.try_get("created_at")?);
        let updated_at: Option<String> = row.try_get("updated_at")?;
        notes.push(Note {
            title: row.try_get::<Option<String>, _>("title")?.unwrap_or_default(),
            content: row.try_get::<Option<String>, _>("content")?.unwrap_or_default(),
            tags: decode_json::<BTreeSet<String>>(row.try_get("tags")?, "notes.tags", &id),
            folder: row
                .try_get::<Option<String>, _>("folder_id")?
                .filter(|f| !f.is_empty())
                .unwrap_or_else(|| crate::models::INBOX_FOLDER_ID.to_string()),
            updated_at: updated_at
                .as_deref()
                .and_then(crate::time::parse_timestamp)
                .unwrap_or(created_at),
            created_at,
            archived: row.try_get::<i64, _>("archived")? != 0,
            id,
        });
    }

    let mut folders = load_folders(conn).await?;
    if folders.is_empty() {
        folders = load_legacy_folders(conn).await?;
    }

    let mut state = NotesState { notes, folders };
    let reparented = state.repair_folder_parents();
    let reassigned = state.ensure_valid_folders();
    if reparented > 0 || reassigned > 0 {
        warn!(
            target: "keepsake",
            event = "notes_folders_repaired_on_load",
            reparented,
            reassigned
        );
    }
    Ok(state)
}

async fn load_folders(conn: &mut SqliteConnection) -> AppResult<Vec<Folder>> {
    let rows = sqlx::query(
        "SELECT id, name, parent_id, position, archived FROM note_folders ORDER BY position, id",
    )
    .fetch_all(&mut *conn)
    .await
    .map_err(|err| AppError::from(err).with_context("operation", "load_note_folders"))?;
    let mut folders = Vec::with_capacity(rows.len());
    for row in rows {
        folders.push(Folder {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            parent_id: row.try_get("parent_id")?,
            order: row.try_get("position")?,
            archived: row.try_get::<i64, _>("archived")? != 0,
        });
    }
    Ok(folders)
}

/// Derive the hierarchy from the flat table, where ids carry the full path.
async fn load_legacy_folders(conn: &mut SqliteConnection) -> AppResult<Vec<Folder>> {
    let rows = sqlx::query("SELECT id, name, position FROM folders ORDER BY position, id")
        .fetch_all(&mut *conn)
        .await
        .map_err(|err| AppError::from(err).with_context("operation", "load_legacy_folders"))?;
    let mut folders = Vec::with_capacity(rows.len());
    for row in rows {
        let id: String = row.try_get("id")?;
        let name: Option<String> = row.try_get("name")?;
        let position: i64 = row.try_get("position")?;
        folders.push(Folder::from_legacy(&id, name.as_deref(), position));
    }
    if !folders.is_empty() {
        info!(
            target: "keepsake",
            event = "legacy_folders_derived",
            count = folders.len()
        );
    }
    Ok(folders)
}

/// Replace every note and folder row with `state`. Runs inside the caller's
/// transaction.
pub async fn persist(conn: &mut SqliteConnection, state: &NotesState) -> AppResult<()> {
    sqlx::query("DELETE FROM notes")
        .execute(&mut *conn)
        .await
        .map_err(|err| AppError::from(err).with_context("operation", "clear_notes"))?;
    for note in &state.notes {
        let tags = serde_json::to_string(&note.tags)?;
        sqlx::query(
            "INSERT INTO notes (id, title, content, tags, folder_id, created_at, updated_at, archived) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )
        .bind(&note.id)
        .bind(&note.title)
        .bind(&note.content)
        .bind(tags)
        .bind(&note.folder)
        .bind(format_timestamp(&note.created_at))
        .bind(format_timestamp(&note.updated_at))
        .bind(note.archived as i64)
        .execute(&mut *conn)
        .await
        .map_err(|err| {
            AppError::from(err)
                .with_context("operation", "insert_note")
                .with_context("id", note.id.clone())
        })?;
    }

    sqlx::query("DELETE FROM note_folders")
        .execute(&mut *conn)
        .await
        .map_err(|err| AppError::from(err).with_context("operation", "clear_note_folders"))?;
    for folder in &state.folders {
        sqlx::query(
            "INSERT INTO note_folders (id, name, parent_id, position, archived) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(&folder.id)
        .bind(&folder.name)
        .bind(folder.parent_id.as_deref())
        .bind(folder.order)
        .bind(folder.archived as i64)
        .execute(&mut *conn)
        .await
        .map_err(|err| {
            AppError::from(err)
                .with_context("operation", "insert_note_folder")
                .with_context("id", folder.id.clone())
        })?;
    }
    Ok(())
}

/// Number of note rows, for status output.
pub async fn count(conn: &mut SqliteConnection) -> AppResult<i64> {
    Ok(sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM notes")
        .fetch_one(&mut *conn)
        .await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::INBOX_FOLDER_ID;

    #[test]
    fn prepare_rejects_cycles() {
        let state = NotesState {
            notes: Vec::new(),
            folders: vec![
                Folder::new("a", "A", Some("b".into())),
                Folder::new("b", "B", Some("a".into())),
            ],
        };
        assert_eq!(prepare(&state).unwrap_err().code(), "VALIDATION/FOLDER_CYCLE");
    }

    #[test]
    fn snapshot_ignores_folder_order() {
        let mut note = Note::new("n1", "Shopping", "{}");
        note.folder = "b".into();
        let a = NotesState {
            notes: vec![note.clone()],
            folders: vec![Folder::new("a", "A", None), Folder::new("b", "B", None)],
        };
        let mut b = a.clone();
        b.folders.reverse();
        assert_eq!(snapshot(&a).unwrap(), snapshot(&b).unwrap());

        let prepared = prepare(&a).unwrap();
        assert!(prepared.folders.iter().any(|f| f.id == INBOX_FOLDER_ID));
    }
}
