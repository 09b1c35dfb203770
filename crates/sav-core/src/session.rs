//! View state of the SAV desk: one session, or a chantier aggregating several.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::notes::{NoteBook, NoteEditor};
use crate::photos::{aggregate_photos, effective_annotation, split_photo_key, AggregatedPhoto};
use crate::{Annotation, Chantier, ContactCandidate, Installer, Note, SavItem, Session};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DeskError {
    #[error("photo '{0}' is not on this desk")]
    UnknownPhoto(String),
    #[error("session '{0}' is not on this desk")]
    UnknownSession(String),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ContextError {
    #[error("jobsite context is not in edit mode")]
    NotEditing,
}

/// What the desk was opened on. Mutations target the chantier when there is one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeskScope {
    Session { session_id: String },
    Chantier { chantier_id: String, session_ids: Vec<String> },
}

impl DeskScope {
    pub fn is_chantier(&self) -> bool {
        matches!(self, DeskScope::Chantier { .. })
    }

    /// Id of the record that owns notes, context and publication.
    pub fn owner_id(&self) -> &str {
        match self {
            DeskScope::Session { session_id } => session_id,
            DeskScope::Chantier { chantier_id, .. } => chantier_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IncludeChange {
    pub key: String,
    pub session_id: String,
    pub photo_id: String,
    pub include: bool,
}

impl IncludeChange {
    /// Body of `PATCH /sessions/{session_id}` for this change.
    pub fn patch_body(&self) -> Value {
        json!({ "photos": [{ "id": self.photo_id, "include_in_report": self.include }] })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DraftChange {
    pub key: String,
    pub session_id: String,
    pub photo_id: String,
    pub draft: Annotation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhotoRef {
    pub session_id: String,
    pub photo_id: String,
}

/// Body of the publish call: the curated selection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PublishSelection {
    pub photos: Vec<PhotoRef>,
    pub notes: Vec<Note>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub general_note: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct JobsiteContext {
    #[serde(default)]
    pub installer: Installer,
    #[serde(default)]
    pub reference: String,
    #[serde(default)]
    pub product_id: String,
}

/// Jobsite context behind an explicit edit/save toggle.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ContextEditor {
    saved: JobsiteContext,
    draft: Option<JobsiteContext>,
}

impl ContextEditor {
    pub fn new(saved: JobsiteContext) -> Self {
        Self { saved, draft: None }
    }

    pub fn is_editing(&self) -> bool {
        self.draft.is_some()
    }

    pub fn current(&self) -> &JobsiteContext {
        self.draft.as_ref().unwrap_or(&self.saved)
    }

    pub fn begin_edit(&mut self) {
        if self.draft.is_none() {
            self.draft = Some(self.saved.clone());
        }
    }

    fn draft_mut(&mut self) -> Result<&mut JobsiteContext, ContextError> {
        self.draft.as_mut().ok_or(ContextError::NotEditing)
    }

    /// Fill the installer from a CRM autocomplete pick.
    pub fn pick_installer(&mut self, contact: &ContactCandidate) -> Result<(), ContextError> {
        self.draft_mut()?.installer = Installer {
            name: contact.name.clone(),
            phone: contact.phone.clone(),
            company: contact.company.clone(),
            email: contact.email.clone(),
        };
        Ok(())
    }

    pub fn set_installer(&mut self, installer: Installer) -> Result<(), ContextError> {
        self.draft_mut()?.installer = installer;
        Ok(())
    }

    pub fn set_reference(&mut self, reference: &str) -> Result<(), ContextError> {
        self.draft_mut()?.reference = reference.trim().to_string();
        Ok(())
    }

    pub fn set_product(&mut self, product_id: &str) -> Result<(), ContextError> {
        self.draft_mut()?.product_id = product_id.trim().to_string();
        Ok(())
    }

    /// Leave edit mode keeping the draft. Returns the patch of changed fields,
    /// or `None` when nothing changed.
    pub fn save(&mut self) -> Result<Option<Value>, ContextError> {
        let draft = self.draft.take().ok_or(ContextError::NotEditing)?;
        let mut patch = serde_json::Map::new();
        if draft.installer != self.saved.installer {
            patch.insert("installer".into(), json!(draft.installer));
        }
        if draft.reference != self.saved.reference {
            patch.insert("reference".into(), json!(draft.reference));
        }
        if draft.product_id != self.saved.product_id {
            patch.insert("product_id".into(), json!(draft.product_id));
        }
        self.saved = draft;
        Ok((!patch.is_empty()).then_some(Value::Object(patch)))
    }

    pub fn cancel(&mut self) {
        self.draft = None;
    }
}

fn context_of(chantier: Option<&Chantier>, sessions: &[Session]) -> JobsiteContext {
    let first = sessions.first();
    let installer = match chantier.and_then(|c| c.contact.as_ref()) {
        Some(c) => Installer {
            name: c.name.clone(),
            phone: c.phone.clone(),
            company: c.company.clone(),
            email: c.email.clone(),
        },
        None => first.map(|s| s.installer.clone()).unwrap_or_default(),
    };
    let reference = chantier
        .map(|c| c.reference.clone())
        .filter(|r| !r.is_empty())
        .or_else(|| first.and_then(|s| s.reference.clone()))
        .unwrap_or_default();
    JobsiteContext {
        installer,
        reference,
        product_id: first.and_then(|s| s.product_id.clone()).unwrap_or_default(),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionDesk {
    scope: DeskScope,
    chantier: Option<Chantier>,
    sessions: Vec<Session>,
    photos: Vec<AggregatedPhoto>,
    include: HashMap<String, bool>,
    /// Keys whose include flag awaits a save, with the edit number of the
    /// latest toggle.
    pending_include: HashMap<String, u64>,
    include_edits: u64,
    pub notes: NoteBook,
    pub editor: NoteEditor,
    pub general_note: String,
    pub context: ContextEditor,
}

impl SessionDesk {
    pub fn load(item: SavItem) -> Self {
        let (scope, chantier, sessions) = match item {
            SavItem::Session { session } => (
                DeskScope::Session {
                    session_id: session.id.clone(),
                },
                None,
                vec![session],
            ),
            SavItem::Chantier { chantier, sessions } => (
                DeskScope::Chantier {
                    chantier_id: chantier.id.clone(),
                    session_ids: sessions.iter().map(|s| s.id.clone()).collect(),
                },
                Some(chantier),
                sessions,
            ),
        };

        let (notes, general_note) = match &chantier {
            Some(c) => (c.notes.clone(), c.general_note.clone()),
            None => (
                sessions.first().map(|s| s.notes.clone()).unwrap_or_default(),
                sessions.first().and_then(|s| s.general_note.clone()),
            ),
        };
        let context = ContextEditor::new(context_of(chantier.as_ref(), &sessions));
        let photos = aggregate_photos(&sessions);
        let include = photos
            .iter()
            .map(|p| (p.key.clone(), p.photo.include_in_report))
            .collect();

        Self {
            scope,
            chantier,
            sessions,
            photos,
            include,
            pending_include: HashMap::new(),
            include_edits: 0,
            notes: NoteBook::new(notes),
            editor: NoteEditor::default(),
            general_note: general_note.unwrap_or_default(),
            context,
        }
    }

    pub fn scope(&self) -> &DeskScope {
        &self.scope
    }

    pub fn chantier(&self) -> Option<&Chantier> {
        self.chantier.as_ref()
    }

    pub fn sessions(&self) -> &[Session] {
        &self.sessions
    }

    pub fn photos(&self) -> &[AggregatedPhoto] {
        &self.photos
    }

    pub fn photo(&self, key: &str) -> Option<&AggregatedPhoto> {
        self.photos.iter().find(|p| p.key == key)
    }

    pub fn is_included(&self, key: &str) -> bool {
        self.include.get(key).copied().unwrap_or(false)
    }

    pub fn is_pending(&self, key: &str) -> bool {
        self.pending_include.contains_key(key)
    }

    /// Edit number of the latest unsaved toggle of `key`.
    pub fn include_edit(&self, key: &str) -> Option<u64> {
        self.pending_include.get(key).copied()
    }

    /// Flip "include in report" locally and return the change to persist.
    pub fn toggle_include(&mut self, key: &str) -> Result<IncludeChange, DeskError> {
        let photo = self
            .photo(key)
            .ok_or_else(|| DeskError::UnknownPhoto(key.to_string()))?;
        let (session_id, photo_id) = (photo.session_id.clone(), photo.photo_id.clone());
        let include = !self.is_included(key);
        self.include.insert(key.to_string(), include);
        self.include_edits += 1;
        self.pending_include.insert(key.to_string(), self.include_edits);
        Ok(IncludeChange {
            key: key.to_string(),
            session_id,
            photo_id,
            include,
        })
    }

    /// The save that carried toggle `edit` of `key` finished, successfully or
    /// not. The local value stays as the user left it; a newer toggle keeps the
    /// key pending.
    pub fn settle_include(&mut self, key: &str, edit: u64) {
        if self.pending_include.get(key) == Some(&edit) {
            self.pending_include.remove(key);
        }
    }

    /// Take a fresh copy of a session from the server without reverting flags
    /// the user changed and that are still in flight.
    pub fn apply_server_session(&mut self, session: Session) -> Result<(), DeskError> {
        let slot = self
            .sessions
            .iter_mut()
            .find(|s| s.id == session.id)
            .ok_or_else(|| DeskError::UnknownSession(session.id.clone()))?;
        *slot = session;
        self.photos = aggregate_photos(&self.sessions);
        for photo in &self.photos {
            if !self.pending_include.contains_key(&photo.key) {
                self.include
                    .insert(photo.key.clone(), photo.photo.include_in_report);
            }
        }
        Ok(())
    }

    /// Merge `patch` into the photo's draft; `None` fields leave the draft as is.
    pub fn edit_draft(&mut self, key: &str, patch: Annotation) -> Result<DraftChange, DeskError> {
        let (session_id, photo_id) = split_photo_key(key)
            .map(|(s, p)| (s.to_string(), p.to_string()))
            .ok_or_else(|| DeskError::UnknownPhoto(key.to_string()))?;
        let entry = self
            .photos
            .iter_mut()
            .find(|p| p.key == key)
            .ok_or_else(|| DeskError::UnknownPhoto(key.to_string()))?;
        let mut draft = entry.photo.draft.clone().unwrap_or_default();
        if patch.status.is_some() {
            draft.status = patch.status;
        }
        if patch.comment.is_some() {
            draft.comment = patch.comment;
        }
        if patch.visual_url.is_some() {
            draft.visual_url = patch.visual_url;
        }
        entry.photo.draft = Some(draft.clone());

        if let Some(session) = self.sessions.iter_mut().find(|s| s.id == session_id) {
            if let Some(photo) = session.photos.iter_mut().find(|p| p.id == photo_id) {
                photo.draft = Some(draft.clone());
            }
        }
        Ok(DraftChange {
            key: key.to_string(),
            session_id,
            photo_id,
            draft,
        })
    }

    pub fn effective_annotation(&self, key: &str) -> Option<Annotation> {
        self.photo(key).map(|p| effective_annotation(&p.photo))
    }

    pub fn set_general_note(&mut self, text: &str) {
        self.general_note = text.to_string();
    }

    /// Body of the PATCH that autosaves notes on the owning record.
    pub fn notes_patch(&self) -> Value {
        json!({
            "notes": self.notes.notes(),
            "general_note": self.general_note,
        })
    }

    /// Included photos (in display order), notes and general note.
    pub fn publish_selection(&self) -> PublishSelection {
        let photos = self
            .photos
            .iter()
            .filter(|p| self.is_included(&p.key))
            .map(|p| PhotoRef {
                session_id: p.session_id.clone(),
                photo_id: p.photo_id.clone(),
            })
            .collect();
        let general_note = Some(self.general_note.trim().to_string()).filter(|g| !g.is_empty());
        PublishSelection {
            photos,
            notes: self.notes.notes().to_vec(),
            general_note,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn chantier_item() -> SavItem {
        serde_json::from_value(json!({
            "kind": "chantier",
            "chantier": {
                "id": "c1", "reference": "CH-1",
                "contact": {"name": "Ana", "phone": "06"},
                "notes": [{"id": "n1", "text": "Existing", "photo_ids": ["s1__p1"]}],
                "general_note": "Overall fine"
            },
            "sessions": [
                {"id": "s1", "product_id": 4, "photos": [
                    {"id": "p1", "url": "/a.jpg", "include_in_report": true},
                    {"id": "p2", "url": "/b.jpg"}
                ]},
                {"id": "s2", "photos": [{"id": "p1", "url": "/c.jpg"}]}
            ]
        }))
        .unwrap()
    }

    #[test]
    fn chantier_desk_aggregates_child_sessions() {
        let desk = SessionDesk::load(chantier_item());
        assert!(desk.scope().is_chantier());
        assert_eq!(desk.scope().owner_id(), "c1");
        let keys: Vec<_> = desk.photos().iter().map(|p| p.key.as_str()).collect();
        assert_eq!(keys, vec!["s1__p1", "s1__p2", "s2__p1"]);
        assert!(desk.is_included("s1__p1"));
        assert!(!desk.is_included("s2__p1"));
        assert_eq!(desk.notes.notes().len(), 1);
        assert_eq!(desk.context.current().reference, "CH-1");
        assert_eq!(desk.context.current().installer.name, "Ana");
        assert_eq!(desk.context.current().product_id, "4");
    }

    #[test]
    fn optimistic_toggle_survives_server_refresh() {
        let mut desk = SessionDesk::load(chantier_item());
        let change = desk.toggle_include("s2__p1").unwrap();
        assert_eq!(
            change,
            IncludeChange {
                key: "s2__p1".into(),
                session_id: "s2".into(),
                photo_id: "p1".into(),
                include: true,
            }
        );
        assert_eq!(
            change.patch_body(),
            json!({"photos": [{"id": "p1", "include_in_report": true}]})
        );

        // A stale server copy arrives while the PATCH is in flight.
        let stale = desk.sessions()[1].clone();
        desk.apply_server_session(stale.clone()).unwrap();
        assert!(desk.is_included("s2__p1"));

        // The PATCH fails silently: the local state is kept.
        let edit = desk.include_edit("s2__p1").unwrap();
        desk.settle_include("s2__p1", edit);
        assert!(desk.is_included("s2__p1"));
        assert!(!desk.is_pending("s2__p1"));

        // Once settled, the server value is authoritative again.
        let mut fresh = stale;
        fresh.photos[0].include_in_report = true;
        desk.apply_server_session(fresh).unwrap();
        assert!(desk.is_included("s2__p1"));
    }

    #[test]
    fn toggle_during_inflight_save_stays_pending() {
        let mut desk = SessionDesk::load(chantier_item());
        desk.toggle_include("s2__p1").unwrap();
        let first = desk.include_edit("s2__p1").unwrap();

        // The first save is in flight when the user flips the photo back.
        desk.toggle_include("s2__p1").unwrap();
        assert!(!desk.is_included("s2__p1"));
        desk.settle_include("s2__p1", first);
        assert!(desk.is_pending("s2__p1"));

        // The server still holds the first toggle's value.
        let mut server = desk.sessions()[1].clone();
        server.photos[0].include_in_report = true;
        desk.apply_server_session(server).unwrap();
        assert!(!desk.is_included("s2__p1"));

        let latest = desk.include_edit("s2__p1").unwrap();
        assert!(latest > first);
        desk.settle_include("s2__p1", latest);
        assert!(!desk.is_pending("s2__p1"));
    }

    #[test]
    fn unknown_photo_is_rejected() {
        let mut desk = SessionDesk::load(chantier_item());
        assert_eq!(
            desk.toggle_include("s9__p1"),
            Err(DeskError::UnknownPhoto("s9__p1".into()))
        );
        assert!(desk.edit_draft("bad", Annotation::default()).is_err());
    }

    #[test]
    fn draft_edits_merge_field_by_field() {
        let mut desk = SessionDesk::load(chantier_item());
        desk.edit_draft(
            "s1__p2",
            Annotation {
                status: Some("ko".into()),
                ..Default::default()
            },
        )
        .unwrap();
        let change = desk
            .edit_draft(
                "s1__p2",
                Annotation {
                    comment: Some("scratch".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(change.session_id, "s1");
        assert_eq!(change.draft.status.as_deref(), Some("ko"));
        assert_eq!(change.draft.comment.as_deref(), Some("scratch"));
        assert_eq!(
            desk.effective_annotation("s1__p2").unwrap().comment.as_deref(),
            Some("scratch")
        );
        assert!(desk.sessions()[0].photos[1].draft.is_some());
    }

    #[test]
    fn publish_selection_maps_keys_back_to_origin() {
        let mut desk = SessionDesk::load(chantier_item());
        desk.toggle_include("s2__p1").unwrap();
        desk.set_general_note("  ");
        let sel = desk.publish_selection();
        assert_eq!(
            sel.photos,
            vec![
                PhotoRef { session_id: "s1".into(), photo_id: "p1".into() },
                PhotoRef { session_id: "s2".into(), photo_id: "p1".into() },
            ]
        );
        assert_eq!(sel.notes.len(), 1);
        assert_eq!(sel.general_note, None);
    }

    #[test]
    fn single_session_desk_owns_its_notes() {
        let item: SavItem = serde_json::from_value(json!({
            "kind": "session",
            "session": {"id": "s7", "reference": "R7", "notes": [{"id": "n", "text": "t"}],
                        "installer": {"name": "Bo"}}
        }))
        .unwrap();
        let desk = SessionDesk::load(item);
        assert_eq!(desk.scope().owner_id(), "s7");
        assert_eq!(desk.notes.notes()[0].id, "n");
        assert_eq!(desk.context.current().installer.name, "Bo");
        assert_eq!(desk.notes_patch()["general_note"], json!(""));
    }

    #[test]
    fn context_edits_need_edit_mode_and_yield_diff() {
        let mut editor = ContextEditor::new(JobsiteContext {
            installer: Installer { name: "Ana".into(), ..Default::default() },
            reference: "R1".into(),
            product_id: "p1".into(),
        });
        assert_eq!(editor.set_reference("R2"), Err(ContextError::NotEditing));
        assert_eq!(editor.save(), Err(ContextError::NotEditing));

        editor.begin_edit();
        editor.set_reference(" R2 ").unwrap();
        editor
            .pick_installer(&ContactCandidate {
                name: "Bo".into(),
                phone: "07".into(),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(editor.current().reference, "R2");
        let patch = editor.save().unwrap().unwrap();
        assert_eq!(patch["reference"], json!("R2"));
        assert_eq!(patch["installer"]["phone"], json!("07"));
        assert!(patch.get("product_id").is_none());
        assert!(!editor.is_editing());

        editor.begin_edit();
        editor.set_product("p9").unwrap();
        editor.cancel();
        assert_eq!(editor.current().product_id, "p1");

        editor.begin_edit();
        assert_eq!(editor.save(), Ok(None));
    }
}
