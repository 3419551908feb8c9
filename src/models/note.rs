use std::collections::{BTreeSet, HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{AppError, AppResult};

/// Root folder every note falls back to.
pub const INBOX_FOLDER_ID: &str = "inbox";
const INBOX_FOLDER_NAME: &str = "Inbox";
/// Separator used by legacy path-encoded folder ids (`parent/child`).
pub const LEGACY_PATH_SEPARATOR: char = '/';

fn default_folder() -> String {
    INBOX_FOLDER_ID.to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Note {
    pub id: String,
    pub title: String,
    /// Opaque rich-text payload produced by the editor.
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default = "default_folder")]
    pub folder: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub archived: bool,
}

impl Note {
    pub fn new(id: impl Into<String>, title: impl Into<String>, content: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            title: title.into(),
            content: content.into(),
            tags: BTreeSet::new(),
            folder: default_folder(),
            created_at: now,
            updated_at: now,
            archived: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Folder {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub order: i64,
    #[serde(default)]
    pub archived: bool,
}

impl Folder {
    pub fn new(id: impl Into<String>, name: impl Into<String>, parent_id: Option<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            parent_id,
            order: 0,
            archived: false,
        }
    }

    pub fn inbox() -> Self {
        Self::new(INBOX_FOLDER_ID, INBOX_FOLDER_NAME, None)
    }

    /// Rebuild a folder from the legacy flat table, where the id carries the
    /// full ancestry path.
    pub fn from_legacy(id: &str, name: Option<&str>, order: i64) -> Self {
        let parent_id = id
            .rsplit_once(LEGACY_PATH_SEPARATOR)
            .map(|(parent, _)| parent.to_string())
            .filter(|parent| !parent.is_empty());
        let fallback = id.rsplit(LEGACY_PATH_SEPARATOR).next().unwrap_or(id);
        Self {
            id: id.to_string(),
            name: name
                .filter(|n| !n.trim().is_empty())
                .unwrap_or(fallback)
                .to_string(),
            parent_id,
            order,
            archived: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotesState {
    #[serde(default)]
    pub notes: Vec<Note>,
    #[serde(default)]
    pub folders: Vec<Folder>,
}

impl NotesState {
    /// Point notes with unknown folders at the inbox, creating the inbox when
    /// needed. Returns the number of reassigned notes.
    pub fn ensure_valid_folders(&mut self) -> usize {
        let known: HashSet<&str> = self.folders.iter().map(|f| f.id.as_str()).collect();
        let needs_inbox = !known.contains(INBOX_FOLDER_ID);
        let mut reassigned = 0;
        let orphaned: Vec<usize> = self
            .notes
            .iter()
            .enumerate()
            .filter(|(_, note)| note.folder != INBOX_FOLDER_ID && !known.contains(note.folder.as_str()))
            .map(|(idx, _)| idx)
            .collect();
        for idx in orphaned {
            self.notes[idx].folder = default_folder();
            reassigned += 1;
        }
        if needs_inbox {
            self.folders.push(Folder::inbox());
        }
        reassigned
    }

    /// Move folders whose parent no longer exists to the root.
    pub fn repair_folder_parents(&mut self) -> usize {
        let known: HashSet<String> = self.folders.iter().map(|f| f.id.clone()).collect();
        let mut repaired = 0;
        for folder in &mut self.folders {
            let dangling = folder
                .parent_id
                .as_ref()
                .map(|parent| !known.contains(parent) || parent == &folder.id)
                .unwrap_or(false);
            if dangling {
                folder.parent_id = None;
                repaired += 1;
            }
        }
        repaired
    }

    /// Reject folder trees that contain a parent cycle or duplicate ids.
    pub fn validate_folder_tree(&self) -> AppResult<()> {
        let mut parents: HashMap<&str, Option<&str>> = HashMap::new();
        for folder in &self.folders {
            if parents
                .insert(folder.id.as_str(), folder.parent_id.as_deref())
                .is_some()
            {
                return Err(AppError::new(
                    "VALIDATION/DUPLICATE_FOLDER",
                    "Folder ids must be unique",
                )
                .with_context("folder_id", folder.id.clone()));
            }
        }

        for folder in &self.folders {
            let mut seen: HashSet<&str> = HashSet::new();
            let mut cursor = Some(folder.id.as_str());
            while let Some(id) = cursor {
                if !seen.insert(id) {
                    return Err(AppError::new(
                        "VALIDATION/FOLDER_CYCLE",
                        "Folder hierarchy contains a cycle",
                    )
                    .with_context("folder_id", folder.id.clone()));
                }
                cursor = parents.get(id).copied().flatten();
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note_in(id: &str, folder: &str) -> Note {
        let mut note = Note::new(id, id, "");
        note.folder = folder.to_string();
        note
    }

    #[test]
    fn unknown_folders_fall_back_to_inbox() {
        let mut state = NotesState {
            notes: vec![note_in("a", "work"), note_in("b", "gone")],
            folders: vec![Folder::new("work", "Work", None)],
        };
        assert_eq!(state.ensure_valid_folders(), 1);
        assert_eq!(state.notes[0].folder, "work");
        assert_eq!(state.notes[1].folder, INBOX_FOLDER_ID);
        assert!(state.folders.iter().any(|f| f.id == INBOX_FOLDER_ID));
    }

    #[test]
    fn cycle_is_rejected() {
        let state = NotesState {
            notes: Vec::new(),
            folders: vec![
                Folder::new("a", "A", Some("b".into())),
                Folder::new("b", "B", Some("a".into())),
            ],
        };
        let err = state.validate_folder_tree().unwrap_err();
        assert_eq!(err.code(), "VALIDATION/FOLDER_CYCLE");
    }

    #[test]
    fn dangling_parent_moves_to_root() {
        let mut state = NotesState {
            notes: Vec::new(),
            folders: vec![Folder::new("a", "A", Some("missing".into()))],
        };
        assert_eq!(state.repair_folder_parents(), 1);
        assert_eq!(state.folders[0].parent_id, None);
        state.validate_folder_tree().unwrap();
    }

    #[test]
    fn legacy_ids_encode_ancestry() {
        let folder = Folder::from_legacy("projects/home/garden", None, 2);
        assert_eq!(folder.parent_id.as_deref(), Some("projects/home"));
        assert_eq!(folder.name, "garden");
        assert_eq!(folder.order, 2);

        let root = Folder::from_legacy("projects", Some("Projects"), 0);
        assert_eq!(root.parent_id, None);
        assert_eq!(root.name, "Projects");
    }
}
