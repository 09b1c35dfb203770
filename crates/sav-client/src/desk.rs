//! The SAV desk wired to the backend: optimistic local edits, debounced
//! autosave per field, and the publish flow.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use sav_core::merge::merge_patch;
use sav_core::notes::NoteError;
use sav_core::session::{
    ContextEditor, ContextError, DeskError, DeskScope, DraftChange, IncludeChange, SessionDesk,
};
use sav_core::{Annotation, Note};

use crate::api::{ApiClient, PublishReceipt, Upload};
use crate::debounce::Debouncer;
use crate::error::{ApiError, DeskFlowError};
use crate::{CONTEXT_QUIET, DRAFT_QUIET, INCLUDE_QUIET, NOTES_QUIET};

/// What an autosave timer is keyed on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SaveKey {
    Include(String),
    Draft(String),
    Notes,
    Context,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuietPeriods {
    pub include: Duration,
    pub draft: Duration,
    pub notes: Duration,
    pub context: Duration,
}

impl Default for QuietPeriods {
    fn default() -> Self {
        Self {
            include: INCLUDE_QUIET,
            draft: DRAFT_QUIET,
            notes: NOTES_QUIET,
            context: CONTEXT_QUIET,
        }
    }
}

impl QuietPeriods {
    pub fn uniform(period: Duration) -> Self {
        Self {
            include: period,
            draft: period,
            notes: period,
            context: period,
        }
    }

    fn for_key(&self, key: &SaveKey) -> Duration {
        match key {
            SaveKey::Include(_) => self.include,
            SaveKey::Draft(_) => self.draft,
            SaveKey::Notes => self.notes,
            SaveKey::Context => self.context,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PublishOutcome {
    pub receipt: PublishReceipt,
    /// Link to the public page, when the backend or the settings allow building one.
    pub public_url: Option<String>,
    /// Whether the notification webhook accepted the call.
    pub notified: bool,
}

/// The backend's own url wins; otherwise `{public_base}/{chantier|session}/{slug}`.
pub fn public_report_url(public_base: &str, scope: &DeskScope, receipt: &PublishReceipt) -> Option<String> {
    if let Some(url) = receipt.url.as_deref().filter(|u| !u.trim().is_empty()) {
        return Some(url.to_string());
    }
    let base = public_base.trim().trim_end_matches('/');
    let slug = receipt.slug.as_deref().filter(|s| !s.trim().is_empty())?;
    if base.is_empty() {
        return None;
    }
    let kind = if scope.is_chantier() { "chantier" } else { "session" };
    Some(format!("{base}/{kind}/{slug}"))
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Everything a save needs; cloned into each timer.
#[derive(Clone)]
struct Saver {
    api: ApiClient,
    desk: Arc<Mutex<SessionDesk>>,
    /// Context patches saved locally but not sent yet, merged together.
    context_patch: Arc<Mutex<Value>>,
    /// Held for the whole of a save; saves go out one at a time.
    turn: Arc<tokio::sync::Mutex<()>>,
}

impl Saver {
    async fn save(&self, key: &SaveKey) -> Result<(), ApiError> {
        let _turn = self.turn.lock().await;
        self.send(key).await
    }

    /// Wait until no save is in flight.
    async fn settled(&self) {
        drop(self.turn.lock().await);
    }

    fn has_unsent_context(&self) -> bool {
        !lock(&self.context_patch).is_null()
    }

    /// Send the current local value for `key`. Values are read at send time so
    /// a coalesced burst persists the last edit.
    async fn send(&self, key: &SaveKey) -> Result<(), ApiError> {
        match key {
            SaveKey::Include(photo_key) => {
                let (change, edit) = {
                    let desk = lock(&self.desk);
                    let change = desk.photo(photo_key).map(|p| IncludeChange {
                        key: p.key.clone(),
                        session_id: p.session_id.clone(),
                        photo_id: p.photo_id.clone(),
                        include: desk.is_included(photo_key),
                    });
                    (change, desk.include_edit(photo_key))
                };
                let Some(change) = change else {
                    return Ok(());
                };
                let res = self
                    .api
                    .patch_session(&change.session_id, &change.patch_body())
                    .await;
                // Settled either way: the local value stays as the user left it.
                if let Some(edit) = edit {
                    lock(&self.desk).settle_include(photo_key, edit);
                }
                res.map(drop)
            }
            SaveKey::Draft(photo_key) => {
                let draft = {
                    let desk = lock(&self.desk);
                    desk.photo(photo_key).map(|p| {
                        (
                            p.session_id.clone(),
                            p.photo_id.clone(),
                            p.photo.draft.clone().unwrap_or_default(),
                        )
                    })
                };
                match draft {
                    Some((session_id, photo_id, draft)) => {
                        self.api.save_photo_draft(&session_id, &photo_id, &draft).await
                    }
                    None => Ok(()),
                }
            }
            SaveKey::Notes => {
                let (scope, body) = {
                    let desk = lock(&self.desk);
                    (desk.scope().clone(), desk.notes_patch())
                };
                self.api.patch(&scope, &body).await.map(drop)
            }
            SaveKey::Context => {
                let patch = std::mem::take(&mut *lock(&self.context_patch));
                if patch.is_null() {
                    return Ok(());
                }
                let scope = lock(&self.desk).scope().clone();
                let res = self.api.patch(&scope, &patch).await;
                if res.is_err() {
                    // Keep the fields for the next attempt, under any newer edit.
                    let mut slot = lock(&self.context_patch);
                    let mut unsent = patch;
                    if !slot.is_null() {
                        merge_patch(&mut unsent, &slot);
                    }
                    *slot = unsent;
                }
                res.map(drop)
            }
        }
    }
}

pub struct DeskController {
    saver: Saver,
    saves: Debouncer<SaveKey>,
    quiet: QuietPeriods,
}

impl DeskController {
    pub fn new(api: ApiClient, desk: SessionDesk) -> Self {
        Self {
            saver: Saver {
                api,
                desk: Arc::new(Mutex::new(desk)),
                context_patch: Arc::new(Mutex::new(Value::Null)),
                turn: Arc::new(tokio::sync::Mutex::new(())),
            },
            saves: Debouncer::new(),
            quiet: QuietPeriods::default(),
        }
    }

    /// Load `/sav/item/{key}`; `None` when the key matches nothing.
    pub async fn open(api: ApiClient, key: &str) -> Result<Option<Self>, ApiError> {
        let item = api.sav_item(key).await?;
        Ok(item.map(|item| {
            let desk = SessionDesk::load(item);
            info!(key, owner = desk.scope().owner_id(), photos = desk.photos().len(), "desk opened");
            Self::new(api, desk)
        }))
    }

    pub fn with_quiet_periods(mut self, quiet: QuietPeriods) -> Self {
        self.quiet = quiet;
        self
    }

    pub fn read<R>(&self, f: impl FnOnce(&SessionDesk) -> R) -> R {
        f(&lock(&self.saver.desk))
    }

    pub fn scope(&self) -> DeskScope {
        self.read(|d| d.scope().clone())
    }

    pub fn pending_saves(&self) -> Vec<SaveKey> {
        self.saves.pending()
    }

    fn schedule(&self, key: SaveKey) {
        let saver = self.saver.clone();
        let delay = self.quiet.for_key(&key);
        let label = key.clone();
        self.saves.schedule(key, delay, async move {
            match saver.save(&label).await {
                Ok(()) => debug!(key = ?label, "autosaved"),
                Err(e) => warn!(key = ?label, error = %e, "autosave failed"),
            }
        });
    }

    /// Send every pending autosave now instead of waiting for its timer, and
    /// wait for saves already in flight. Context fields left over by a failed
    /// save are sent again.
    pub async fn flush(&self) -> Result<(), ApiError> {
        self.saver.settled().await;
        let mut keys: Vec<SaveKey> = self
            .saves
            .pending()
            .into_iter()
            .filter(|key| self.saves.cancel(key))
            .collect();
        if !keys.contains(&SaveKey::Context) && self.saver.has_unsent_context() {
            keys.push(SaveKey::Context);
        }
        let mut first_error = None;
        for key in keys {
            if let Err(e) = self.saver.save(&key).await {
                warn!(key = ?key, error = %e, "flush failed");
                first_error.get_or_insert(e);
            }
        }
        self.saver.settled().await;
        first_error.map_or(Ok(()), Err)
    }

    /// Forget pending autosaves, e.g. once the record itself was deleted.
    pub fn discard_pending(&self) {
        self.saves.cancel_all();
    }

    // --- Photos ---

    pub fn toggle_include(&self, key: &str) -> Result<IncludeChange, DeskError> {
        let change = lock(&self.saver.desk).toggle_include(key)?;
        self.schedule(SaveKey::Include(key.to_string()));
        Ok(change)
    }

    pub fn edit_draft(&self, key: &str, patch: Annotation) -> Result<DraftChange, DeskError> {
        let change = lock(&self.saver.desk).edit_draft(key, patch)?;
        self.schedule(SaveKey::Draft(key.to_string()));
        Ok(change)
    }

    /// Upload an annotated rendition of a photo and point its draft at it.
    pub async fn upload_annotated_image(&self, key: &str, file: Upload) -> Result<String, DeskFlowError> {
        let (session_id, photo_id) = self
            .read(|d| d.photo(key).map(|p| (p.session_id.clone(), p.photo_id.clone())))
            .ok_or_else(|| DeskError::UnknownPhoto(key.to_string()))?;
        let uploaded = self
            .saver
            .api
            .upload_annotated_image(&session_id, &photo_id, file)
            .await?;
        self.edit_draft(
            key,
            Annotation {
                visual_url: Some(uploaded.annotated_url.clone()),
                ..Default::default()
            },
        )?;
        Ok(uploaded.annotated_url)
    }

    /// Pull fresh copies of every session on the desk. Pending include flags survive.
    pub async fn refresh(&self) -> Result<(), DeskFlowError> {
        let ids: Vec<String> = self.read(|d| d.sessions().iter().map(|s| s.id.clone()).collect());
        for id in ids {
            if let Some(session) = self.saver.api.session(&id).await? {
                lock(&self.saver.desk).apply_server_session(session)?;
            }
        }
        Ok(())
    }

    // --- Notes ---

    pub fn save_note(&self, id: Option<&str>, text: &str, photo_ids: &[String]) -> Result<Note, NoteError> {
        let note = lock(&self.saver.desk)
            .notes
            .upsert_note(id, text, photo_ids)?
            .clone();
        self.schedule(SaveKey::Notes);
        Ok(note)
    }

    /// Requires `confirmed`; nothing is sent otherwise.
    pub fn delete_note(&self, id: &str, confirmed: bool) -> Result<Note, NoteError> {
        let removed = {
            let mut guard = lock(&self.saver.desk);
            let desk = &mut *guard;
            desk.editor.delete(&mut desk.notes, id, confirmed)?
        };
        self.schedule(SaveKey::Notes);
        Ok(removed)
    }

    pub fn set_general_note(&self, text: &str) {
        lock(&self.saver.desk).set_general_note(text);
        self.schedule(SaveKey::Notes);
    }

    pub async fn upload_note_asset(&self, note_id: &str, file: Upload) -> Result<Note, DeskFlowError> {
        if self.read(|d| d.notes.get(note_id).is_none()) {
            return Err(NoteError::UnknownNote(note_id.to_string()).into());
        }
        // The note may only exist locally until its autosave runs.
        if self.saves.cancel(&SaveKey::Notes) {
            self.saver.save(&SaveKey::Notes).await?;
        }
        let scope = self.scope();
        let asset = self.saver.api.upload_note_asset(&scope, note_id, file).await?;
        let note = lock(&self.saver.desk)
            .notes
            .merge_assets(note_id, &[asset])?
            .clone();
        Ok(note)
    }

    pub async fn delete_note_asset(&self, note_id: &str, asset_id: &str) -> Result<bool, DeskFlowError> {
        if self.read(|d| d.notes.get(note_id).is_none()) {
            return Err(NoteError::UnknownNote(note_id.to_string()).into());
        }
        let scope = self.scope();
        self.saver
            .api
            .delete_note_asset(&scope, note_id, asset_id)
            .await?;
        Ok(lock(&self.saver.desk).notes.remove_asset(note_id, asset_id)?)
    }

    // --- Jobsite context ---

    /// Run `edit` against the context editor, entering edit mode first.
    pub fn edit_context<R>(
        &self,
        edit: impl FnOnce(&mut ContextEditor) -> Result<R, ContextError>,
    ) -> Result<R, ContextError> {
        let mut desk = lock(&self.saver.desk);
        desk.context.begin_edit();
        edit(&mut desk.context)
    }

    pub fn cancel_context_edit(&self) {
        lock(&self.saver.desk).context.cancel();
    }

    /// Leave edit mode and queue the changed fields; returns them.
    pub fn save_context(&self) -> Result<Option<Value>, ContextError> {
        let patch = lock(&self.saver.desk).context.save()?;
        if let Some(patch) = &patch {
            merge_patch(&mut lock(&self.saver.context_patch), patch);
            self.schedule(SaveKey::Context);
        }
        Ok(patch)
    }

    // --- Publication ---

    /// Flush pending edits, publish the curated selection, then notify the
    /// webhook. A notification failure is logged and does not fail the publish.
    pub async fn publish(&self, public_base: &str) -> Result<PublishOutcome, ApiError> {
        self.flush().await?;
        let (scope, selection) = self.read(|d| (d.scope().clone(), d.publish_selection()));
        let receipt = self.saver.api.publish(&scope, &selection).await?;
        info!(
            owner = scope.owner_id(),
            photos = selection.photos.len(),
            notes = selection.notes.len(),
            "published"
        );
        let notified = self
            .saver
            .api
            .notify_published_best_effort(&scope, &receipt)
            .await;
        Ok(PublishOutcome {
            public_url: public_report_url(public_base, &scope, &receipt),
            receipt,
            notified,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chantier() -> DeskScope {
        DeskScope::Chantier {
            chantier_id: "c1".into(),
            session_ids: vec![],
        }
    }

    #[test]
    fn public_url_prefers_backend_link() {
        let receipt = PublishReceipt {
            slug: Some("abc".into()),
            url: Some("https://r.test/x".into()),
        };
        assert_eq!(
            public_report_url("https://pub.test", &chantier(), &receipt).as_deref(),
            Some("https://r.test/x")
        );
    }

    #[test]
    fn public_url_built_from_slug() {
        let receipt = PublishReceipt {
            slug: Some("abc".into()),
            url: None,
        };
        assert_eq!(
            public_report_url("https://pub.test/", &chantier(), &receipt).as_deref(),
            Some("https://pub.test/chantier/abc")
        );
        let session = DeskScope::Session { session_id: "s1".into() };
        assert_eq!(
            public_report_url("https://pub.test", &session, &receipt).as_deref(),
            Some("https://pub.test/session/abc")
        );
        assert_eq!(public_report_url("", &session, &receipt), None);
        assert_eq!(public_report_url("https://pub.test", &session, &PublishReceipt::default()), None);
    }

    #[test]
    fn quiet_periods_per_key() {
        let q = QuietPeriods::default();
        assert_eq!(q.for_key(&SaveKey::Include("k".into())), INCLUDE_QUIET);
        assert_eq!(q.for_key(&SaveKey::Notes), NOTES_QUIET);
        let u = QuietPeriods::uniform(Duration::from_millis(5));
        assert_eq!(u.for_key(&SaveKey::Context), Duration::from_millis(5));
    }
}
