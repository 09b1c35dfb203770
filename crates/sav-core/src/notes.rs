//! SAV notes: the editable list shown next to the photos, and the editor widget.

use serde::{Deserialize, Serialize};

use crate::{Note, NoteAsset};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum NoteError {
    #[error("note text is empty")]
    BlankText,
    #[error("note '{0}' not found")]
    UnknownNote(String),
    #[error("deleting note '{0}' needs confirmation")]
    NotConfirmed(String),
    #[error("no note is being edited")]
    NotEditing,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NoteBook {
    notes: Vec<Note>,
}

fn dedup_ids(ids: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(ids.len());
    for id in ids {
        if !id.trim().is_empty() && !out.contains(id) {
            out.push(id.clone());
        }
    }
    out
}

pub fn new_note_id() -> String {
    format!("note-{}", uuid::Uuid::new_v4())
}

impl NoteBook {
    pub fn new(notes: Vec<Note>) -> Self {
        Self { notes }
    }

    pub fn notes(&self) -> &[Note] {
        &self.notes
    }

    pub fn get(&self, id: &str) -> Option<&Note> {
        self.notes.iter().find(|n| n.id == id)
    }

    fn position(&self, id: &str) -> Result<usize, NoteError> {
        self.notes
            .iter()
            .position(|n| n.id == id)
            .ok_or_else(|| NoteError::UnknownNote(id.to_string()))
    }

    /// Create a note, or update the one with `id`.
    ///
    /// Blank text is refused unless the note already carries assets, so an
    /// empty note can never be created.
    pub fn upsert_note(
        &mut self,
        id: Option<&str>,
        text: &str,
        photo_ids: &[String],
    ) -> Result<&Note, NoteError> {
        let existing = id.and_then(|id| self.notes.iter().position(|n| n.id == id));
        let has_assets = existing.is_some_and(|i| !self.notes[i].assets.is_empty());
        if text.trim().is_empty() && !has_assets {
            return Err(NoteError::BlankText);
        }

        let idx = match existing {
            Some(i) => {
                let note = &mut self.notes[i];
                note.text = text.to_string();
                note.photo_ids = dedup_ids(photo_ids);
                i
            }
            None => {
                let id = id
                    .filter(|id| !id.trim().is_empty())
                    .map(str::to_string)
                    .unwrap_or_else(new_note_id);
                self.notes.push(Note {
                    id,
                    text: text.to_string(),
                    photo_ids: dedup_ids(photo_ids),
                    assets: vec![],
                });
                self.notes.len() - 1
            }
        };
        Ok(&self.notes[idx])
    }

    pub fn delete_note(&mut self, id: &str, confirmed: bool) -> Result<Note, NoteError> {
        let idx = self.position(id)?;
        if !confirmed {
            return Err(NoteError::NotConfirmed(id.to_string()));
        }
        Ok(self.notes.remove(idx))
    }

    /// Merge uploaded assets into a note; an asset already present (same
    /// `asset_id`) is replaced in place, so repeating a merge is harmless.
    pub fn merge_assets(&mut self, note_id: &str, assets: &[NoteAsset]) -> Result<&Note, NoteError> {
        let idx = self.position(note_id)?;
        let note = &mut self.notes[idx];
        for asset in assets {
            match note.assets.iter_mut().find(|a| a.asset_id == asset.asset_id) {
                Some(slot) => *slot = asset.clone(),
                None => note.assets.push(asset.clone()),
            }
        }
        Ok(&self.notes[idx])
    }

    pub fn remove_asset(&mut self, note_id: &str, asset_id: &str) -> Result<bool, NoteError> {
        let idx = self.position(note_id)?;
        let assets = &mut self.notes[idx].assets;
        let before = assets.len();
        assets.retain(|a| a.asset_id != asset_id);
        Ok(assets.len() != before)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum EditTarget {
    New,
    Existing(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum EditorState {
    Idle,
    Editing {
        target: EditTarget,
        text: String,
        photo_ids: Vec<String>,
    },
    Saved {
        id: String,
    },
}

/// The note editing widget: `Idle → Editing(New) → Saved`,
/// `Idle → Editing(Existing) ↔ Saved`; a confirmed delete returns to `Idle`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NoteEditor {
    state: EditorState,
}

impl Default for NoteEditor {
    fn default() -> Self {
        Self {
            state: EditorState::Idle,
        }
    }
}

impl NoteEditor {
    pub fn state(&self) -> &EditorState {
        &self.state
    }

    pub fn begin_new(&mut self) {
        self.state = EditorState::Editing {
            target: EditTarget::New,
            text: String::new(),
            photo_ids: vec![],
        };
    }

    pub fn begin_edit(&mut self, book: &NoteBook, id: &str) -> Result<(), NoteError> {
        let note = book
            .get(id)
            .ok_or_else(|| NoteError::UnknownNote(id.to_string()))?;
        self.state = EditorState::Editing {
            target: EditTarget::Existing(note.id.clone()),
            text: note.text.clone(),
            photo_ids: note.photo_ids.clone(),
        };
        Ok(())
    }

    /// `Saved → Editing(Existing)` on the note that was just saved.
    pub fn resume(&mut self, book: &NoteBook) -> Result<(), NoteError> {
        match &self.state {
            EditorState::Saved { id } => {
                let id = id.clone();
                self.begin_edit(book, &id)
            }
            _ => Err(NoteError::NotEditing),
        }
    }

    pub fn set_text(&mut self, value: &str) -> Result<(), NoteError> {
        match &mut self.state {
            EditorState::Editing { text, .. } => {
                *text = value.to_string();
                Ok(())
            }
            _ => Err(NoteError::NotEditing),
        }
    }

    /// Link or unlink a photo key; returns whether it is now linked.
    pub fn toggle_photo(&mut self, key: &str) -> Result<bool, NoteError> {
        match &mut self.state {
            EditorState::Editing { photo_ids, .. } => {
                if let Some(pos) = photo_ids.iter().position(|p| p == key) {
                    photo_ids.remove(pos);
                    Ok(false)
                } else {
                    photo_ids.push(key.to_string());
                    Ok(true)
                }
            }
            _ => Err(NoteError::NotEditing),
        }
    }

    /// Write the draft into `book`. On failure the editor stays in `Editing`.
    pub fn save(&mut self, book: &mut NoteBook) -> Result<String, NoteError> {
        let EditorState::Editing {
            target,
            text,
            photo_ids,
        } = &self.state
        else {
            return Err(NoteError::NotEditing);
        };
        let id = match target {
            EditTarget::New => None,
            EditTarget::Existing(id) => Some(id.as_str()),
        };
        let saved = book.upsert_note(id, text, photo_ids)?.id.clone();
        self.state = EditorState::Saved { id: saved.clone() };
        Ok(saved)
    }

    pub fn cancel(&mut self) {
        self.state = EditorState::Idle;
    }

    pub fn delete(&mut self, book: &mut NoteBook, id: &str, confirmed: bool) -> Result<Note, NoteError> {
        let removed = book.delete_note(id, confirmed)?;
        self.state = EditorState::Idle;
        Ok(removed)
    }
}
