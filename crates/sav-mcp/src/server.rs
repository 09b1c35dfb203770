use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use rmcp::{
    handler::server::{router::tool::ToolRouter, wrapper::Parameters},
    model::{CallToolResult, Content, ServerCapabilities, ServerInfo},
    schemars, tool, tool_handler, tool_router, ErrorData as McpError, ServerHandler,
};
use sav_client::desk::SaveKey;
use sav_client::{
    ApiClient, ContactSearch, DeskController, LatestOnly, PhotoRequest, SearchSource, Upload,
};
use sav_core::inbox::{facets, project_rows, InboxFilter, InboxRow, SeenStore};
use sav_core::link::{build_link, LinkForm};
use sav_core::photos::normalize_asset_url;
use sav_core::report::{PhotoViewer, ReportView};
use sav_core::rules::{visible_fields, visible_groups, Rule};
use sav_core::session::{DeskScope, SessionDesk};
use sav_core::{
    apply_env_overrides, config_dir, read_settings, read_settings_in, settings_configured,
    write_settings_in, Annotation, ConsoleSettings, ContactCandidate, Installer, Product, Sheet,
    StepGroup,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

// --- Request types ---

#[derive(Debug, Deserialize, schemars::JsonSchema)]
struct UpdateSettingsRequest {
    /// Origin of the REST backend, e.g. "https://api.example.com"
    api_base: Option<String>,
    /// Origin of the notification webhook service
    webhook_base: Option<String>,
    /// Business WhatsApp number installers are sent to
    whatsapp_number: Option<String>,
    /// Origin used to build public report links
    public_base: Option<String>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
struct QueryRequest {
    /// Search text (at least 2 characters)
    query: String,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
struct EditLinkRequest {
    /// Start from an empty form before applying the other fields
    #[serde(default)]
    reset: bool,
    /// Index into the last lookup_people results
    contact_index: Option<usize>,
    /// Explicit contact, used when no lookup result fits
    contact: Option<ContactCandidate>,
    /// Chantier reference the installer works on
    chantier_ref: Option<String>,
    /// Product id from list_products. Changing it clears sheet, intro values and steps.
    product_id: Option<String>,
    /// Sheet id of the selected product. Changing it clears intro values and steps.
    sheet_id: Option<String>,
    /// Intro field values by key; an empty string clears a value
    intro_values: Option<BTreeMap<String, String>>,
    /// Step keys whose checkbox to flip
    toggle_steps: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
struct ExamplePhotoRequest {
    /// Step key from the link form
    step: String,
}

#[derive(Debug, Clone, Copy, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "lowercase")]
enum ReportKind {
    Chantier,
    Session,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
struct ReportRequest {
    /// "chantier" or "session"
    kind: ReportKind,
    /// Public slug of the report
    slug: String,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
struct ReportPhotoRequest {
    /// "chantier" or "session"
    kind: ReportKind,
    /// Public slug of the report
    slug: String,
    /// Gallery index to open
    index: usize,
    /// Moves after opening: positive = next, negative = previous (wraps around)
    #[serde(default)]
    moves: i64,
    /// Show the annotated rendition when there is one
    #[serde(default)]
    annotated: bool,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
struct RowKeyRequest {
    /// Inbox row key, e.g. "chantier:12" or "session:abc"
    key: String,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
struct UpdateRowRequest {
    /// Inbox row key, e.g. "chantier:12" or "session:abc"
    key: String,
    /// New workflow status
    status: Option<String>,
    /// New owner; an empty string unassigns
    owner: Option<String>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
struct AttachRequest {
    /// Session to attach
    session_id: String,
    /// Chantier receiving the session
    chantier_id: String,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
struct DeleteItemRequest {
    /// Inbox row key, e.g. "chantier:12" or "session:abc"
    key: String,
    /// Must be true: deletion is irreversible
    #[serde(default)]
    confirm: bool,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
struct OpenItemRequest {
    /// Session id or chantier id, as accepted by /sav/item/{key}
    key: String,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
struct PhotoKeyRequest {
    /// Photo key "sessionId__photoId" from open_item
    photo_key: String,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
struct AnnotationRequest {
    /// Photo key "sessionId__photoId" from open_item
    photo_key: String,
    /// Review status, e.g. "ok", "ko", "to_check"
    status: Option<String>,
    /// Free-text comment shown with the photo
    comment: Option<String>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
struct ImageUploadRequest {
    /// Photo key "sessionId__photoId" from open_item
    photo_key: String,
    /// Image bytes, base64-encoded
    data_base64: String,
    /// File name sent with the upload
    filename: String,
    /// MIME type, default "image/png"
    mime_type: Option<String>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
struct SaveNoteRequest {
    /// Id of the note to update; omit to create a new note
    note_id: Option<String>,
    /// Note text. May be blank only for a note that already has assets.
    text: String,
    /// Photo keys the note refers to
    #[serde(default)]
    photo_keys: Vec<String>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
struct DeleteNoteRequest {
    note_id: String,
    /// Must be true: deletion is irreversible
    #[serde(default)]
    confirm: bool,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
struct GeneralNoteRequest {
    /// Text of the general note of the report
    text: String,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
struct NoteAssetRequest {
    note_id: String,
    /// File bytes, base64-encoded
    data_base64: String,
    filename: String,
    /// MIME type, default "application/octet-stream"
    mime_type: Option<String>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
struct DeleteNoteAssetRequest {
    note_id: String,
    asset_id: String,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
struct EditContextRequest {
    /// Index into the last search_crm results, fills the installer
    contact_index: Option<usize>,
    /// Installer identity typed by hand
    installer: Option<Installer>,
    /// Jobsite reference
    reference: Option<String>,
    /// Product id
    product_id: Option<String>,
    /// Save and leave edit mode (default true); false keeps editing
    save: Option<bool>,
}

// --- Console state ---

#[derive(Clone)]
struct Backend {
    api: ApiClient,
    people: ContactSearch,
    crm: ContactSearch,
}

#[derive(Default)]
struct LinkDraft {
    form: LinkForm,
    products: Vec<Product>,
    groups: Vec<StepGroup>,
}

impl LinkDraft {
    fn sheet(&self) -> Option<&Sheet> {
        self.products
            .iter()
            .find(|p| p.id == self.form.product_id)
            .and_then(|p| p.sheet(&self.form.sheet_id))
    }
}

struct InboxState {
    rows: Vec<InboxRow>,
    seen: SeenStore,
}

struct Console {
    settings: Mutex<ConsoleSettings>,
    backend: Mutex<Option<Backend>>,
    link: Mutex<LinkDraft>,
    steps_latest: LatestOnly,
    inbox: Mutex<InboxState>,
    desk: tokio::sync::Mutex<Option<DeskController>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// --- Result helpers ---

fn ok_text(text: impl Into<String>) -> Result<CallToolResult, McpError> {
    Ok(CallToolResult::success(vec![Content::text(text.into())]))
}

fn err_text(text: impl Into<String>) -> Result<CallToolResult, McpError> {
    Ok(CallToolResult::error(vec![Content::text(text.into())]))
}

fn ok_json<T: Serialize>(value: &T) -> Result<CallToolResult, McpError> {
    match serde_json::to_string_pretty(value) {
        Ok(json) => ok_text(json),
        Err(e) => err_text(format!("Serialization error: {}", e)),
    }
}

fn base64_decode(input: &str) -> Result<Vec<u8>, String> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD
        .decode(input.trim())
        .map_err(|e| e.to_string())
}

/// "chantier:12" → chantier 12, "session:abc" → session abc.
fn scope_for_key(key: &str) -> Option<DeskScope> {
    match key.split_once(':') {
        Some(("chantier", id)) if !id.is_empty() => Some(DeskScope::Chantier {
            chantier_id: id.to_string(),
            session_ids: vec![],
        }),
        Some(("session", id)) if !id.is_empty() => Some(DeskScope::Session {
            session_id: id.to_string(),
        }),
        _ => None,
    }
}

/// Apply `moves` next/previous steps; whole laps around the gallery are skipped.
fn move_viewer(viewer: &mut PhotoViewer, moves: i64, gallery_len: usize) {
    if gallery_len == 0 {
        return;
    }
    let steps = moves.unsigned_abs() % gallery_len as u64;
    for _ in 0..steps {
        if moves > 0 {
            viewer.next();
        } else {
            viewer.previous();
        }
    }
}

fn link_summary(draft: &LinkDraft) -> Value {
    let form = &draft.form;
    let sheet = draft.sheet();
    let fields: Vec<Value> = sheet
        .map(|s| visible_fields(&s.intro_fields, &form.intro_values))
        .unwrap_or_default()
        .into_iter()
        .map(|f| {
            json!({
                "key": f.key,
                "label": f.label,
                "type": f.kind,
                "required": f.required,
                "options": f.options,
                "value": form.intro_values.get(&f.key),
                "depends_on": f.show_if.as_ref().and_then(|r| Rule::from_field_rule(r).source().map(str::to_string)),
            })
        })
        .collect();
    let groups: Vec<Value> = visible_groups(&draft.groups, &form.intro_values)
        .into_iter()
        .map(|g| {
            let steps: Vec<Value> = g
                .keys
                .iter()
                .map(|k| {
                    json!({
                        "key": k,
                        "label": g.labels.get(k).unwrap_or(k),
                        "selected": form.selected_steps.contains(k),
                    })
                })
                .collect();
            json!({
                "category": g.category,
                "steps": steps,
                "depends_on": g.show_if.as_ref().and_then(|r| Rule::from_group_rule(r).source().map(str::to_string)),
            })
        })
        .collect();
    let missing: Vec<String> = form
        .missing_fields(sheet, &draft.groups)
        .iter()
        .map(|m| m.to_string())
        .collect();
    json!({
        "contact": form.contact,
        "chantier_ref": form.chantier_ref,
        "product_id": form.product_id,
        "sheet_id": form.sheet_id,
        "intro_fields": fields,
        "step_groups": groups,
        "selected_steps": form.effective_steps(&draft.groups),
        "missing": missing,
        "controls": form.controls(sheet, &draft.groups),
    })
}

fn desk_summary(desk: &SessionDesk, api_base: &str, pending: &[SaveKey]) -> Value {
    let photos: Vec<Value> = desk
        .photos()
        .iter()
        .map(|p| {
            json!({
                "key": p.key,
                "url": normalize_asset_url(api_base, &p.photo.url),
                "annotated_url": p.photo.annotated_url.as_deref().and_then(|u| normalize_asset_url(api_base, u)),
                "step": p.photo.step_key,
                "included": desk.is_included(&p.key),
                "saving": desk.is_pending(&p.key),
                "annotation": desk.effective_annotation(&p.key),
            })
        })
        .collect();
    json!({
        "scope": desk.scope(),
        "context": desk.context.current(),
        "editing_context": desk.context.is_editing(),
        "photos": photos,
        "notes": desk.notes.notes(),
        "general_note": desk.general_note,
        "pending_saves": pending.len(),
    })
}

// --- Server ---

#[derive(Clone)]
pub struct SavServer {
    tool_router: ToolRouter<Self>,
    console: Arc<Console>,
}

const NOT_CONFIGURED: &str =
    "The API base URL is not configured. Use update_settings or set SAV_API_BASE.";
const NO_DESK: &str = "No item is open. Use open_item first.";

#[tool_router]
impl SavServer {
    pub fn new() -> Self {
        let settings = read_settings();
        Self {
            tool_router: Self::tool_router(),
            console: Arc::new(Console {
                settings: Mutex::new(settings),
                backend: Mutex::new(None),
                link: Mutex::new(LinkDraft::default()),
                steps_latest: LatestOnly::new(),
                inbox: Mutex::new(InboxState {
                    rows: vec![],
                    seen: SeenStore::open(&config_dir()),
                }),
                desk: tokio::sync::Mutex::new(None),
            }),
        }
    }

    fn settings(&self) -> ConsoleSettings {
        lock(&self.console.settings).clone()
    }

    fn backend(&self) -> Result<Backend, String> {
        let mut slot = lock(&self.console.backend);
        if let Some(backend) = slot.as_ref() {
            return Ok(backend.clone());
        }
        let settings = self.settings();
        if !settings_configured(&settings) {
            return Err(NOT_CONFIGURED.to_string());
        }
        let api = ApiClient::from_settings(&settings).map_err(|e| e.user_message())?;
        let backend = Backend {
            people: ContactSearch::new(api.clone(), SearchSource::People),
            crm: ContactSearch::new(api.clone(), SearchSource::Crm),
            api,
        };
        *slot = Some(backend.clone());
        Ok(backend)
    }

    // --- Settings ---

    #[tool(description = "Show the console settings (API base, webhook base, WhatsApp number, public base) and whether the backend is configured")]
    fn get_settings(&self) -> Result<CallToolResult, McpError> {
        let settings = self.settings();
        ok_json(&json!({
            "settings": settings,
            "configured": settings_configured(&settings),
            "config_dir": config_dir(),
        }))
    }

    #[tool(description = "Update console settings. Values are written to ~/.sav-console/settings.json; SAV_* environment variables still take precedence.")]
    fn update_settings(
        &self,
        Parameters(req): Parameters<UpdateSettingsRequest>,
    ) -> Result<CallToolResult, McpError> {
        let dir = config_dir();
        let mut file = read_settings_in(&dir);
        let updates = [
            (req.api_base, &mut file.api_base),
            (req.webhook_base, &mut file.webhook_base),
            (req.whatsapp_number, &mut file.whatsapp_number),
            (req.public_base, &mut file.public_base),
        ];
        for (value, slot) in updates {
            if let Some(value) = value {
                *slot = value.trim().to_string();
            }
        }
        if let Err(e) = write_settings_in(&dir, &file) {
            return err_text(format!("Failed to write settings: {}", e));
        }
        let effective = apply_env_overrides(file, |k| std::env::var(k).ok());
        *lock(&self.console.settings) = effective.clone();
        *lock(&self.console.backend) = None;
        info!(configured = settings_configured(&effective), "settings updated");
        ok_json(&effective)
    }

    // --- Link generator ---

    #[tool(description = "Look up installers in the people directory (search-as-you-type). Results are numbered for edit_link's contact_index.")]
    async fn lookup_people(
        &self,
        Parameters(req): Parameters<QueryRequest>,
    ) -> Result<CallToolResult, McpError> {
        let backend = match self.backend() {
            Ok(b) => b,
            Err(e) => return err_text(e),
        };
        match backend.people.type_query(&req.query).await {
            Ok(Some(list)) if list.is_empty() => ok_text("No matching people."),
            Ok(Some(list)) => ok_text(
                list.iter()
                    .enumerate()
                    .map(|(i, c)| format!("{}. {} ({})", i, c.label(), c.phone))
                    .collect::<Vec<_>>()
                    .join("\n"),
            ),
            Ok(None) => ok_text("A newer search superseded this one."),
            Err(e) => err_text(e.user_message()),
        }
    }

    #[tool(description = "List products and their sheets")]
    async fn list_products(&self) -> Result<CallToolResult, McpError> {
        let backend = match self.backend() {
            Ok(b) => b,
            Err(e) => return err_text(e),
        };
        match backend.api.products().await {
            Ok(products) => {
                let listing: Vec<Value> = products
                    .iter()
                    .map(|p| {
                        json!({
                            "id": p.id,
                            "name": p.name,
                            "sheets": p.sheets.iter().map(|s| json!({"id": s.id, "name": s.name})).collect::<Vec<_>>(),
                        })
                    })
                    .collect();
                lock(&self.console.link).products = products;
                ok_json(&listing)
            }
            Err(e) => err_text(e.user_message()),
        }
    }

    #[tool(
        description = "Edit the WhatsApp link form: contact, chantier reference, product, sheet, intro field values and step checkboxes. Returns the visible fields and step groups, the missing items and whether the link can be generated."
    )]
    async fn edit_link(
        &self,
        Parameters(req): Parameters<EditLinkRequest>,
    ) -> Result<CallToolResult, McpError> {
        let backend = match self.backend() {
            Ok(b) => b,
            Err(e) => return err_text(e),
        };

        let needs_products = (req.product_id.is_some() || req.sheet_id.is_some())
            && lock(&self.console.link).products.is_empty();
        if needs_products {
            match backend.api.products().await {
                Ok(products) => lock(&self.console.link).products = products,
                Err(e) => return err_text(e.user_message()),
            }
        }

        let contact = match (req.contact_index, req.contact) {
            (Some(i), _) => match backend.people.results().get(i) {
                Some(c) => Some(c.clone()),
                None => return err_text(format!("No lookup result #{}. Run lookup_people first.", i)),
            },
            (None, contact) => contact,
        };

        let load_steps = {
            let mut draft = lock(&self.console.link);
            if req.reset {
                draft.form = LinkForm::default();
                draft.groups.clear();
            }
            let before = (draft.form.product_id.clone(), draft.form.sheet_id.clone());
            if let Some(contact) = &contact {
                draft.form.select_contact(contact);
            }
            if let Some(reference) = &req.chantier_ref {
                draft.form.chantier_ref = reference.trim().to_string();
            }
            if let Some(product_id) = &req.product_id {
                if !draft.products.iter().any(|p| &p.id == product_id) {
                    return err_text(format!("Unknown product '{}'.", product_id));
                }
                draft.form.set_product(product_id);
            }
            if let Some(sheet_id) = &req.sheet_id {
                let known = draft
                    .products
                    .iter()
                    .find(|p| p.id == draft.form.product_id)
                    .is_some_and(|p| p.sheet(sheet_id).is_some());
                if !known {
                    return err_text(format!("Sheet '{}' does not belong to the selected product.", sheet_id));
                }
                draft.form.set_sheet(sheet_id);
            }
            let after = (draft.form.product_id.clone(), draft.form.sheet_id.clone());
            if after != before {
                draft.groups.clear();
            }
            (after != before && !after.0.is_empty() && !after.1.is_empty()).then_some(after)
        };

        if let Some((product_id, sheet_id)) = load_steps {
            let ticket = self.console.steps_latest.issue();
            match backend.api.steps(&product_id, &sheet_id).await {
                Ok(groups) if self.console.steps_latest.is_current(ticket) => {
                    lock(&self.console.link).groups = groups;
                }
                Ok(_) => {}
                Err(e) => return err_text(e.user_message()),
            }
        }

        let mut draft = lock(&self.console.link);
        for (key, value) in req.intro_values.unwrap_or_default() {
            draft.form.set_intro_value(&key, value.trim());
        }
        for step in req.toggle_steps.unwrap_or_default() {
            if !draft.groups.iter().any(|g| g.keys.contains(&step)) {
                return err_text(format!("Unknown step '{}'.", step));
            }
            draft.form.toggle_step(&step);
        }
        ok_json(&link_summary(&draft))
    }

    #[tool(description = "Get the example photo for a step of the selected product and sheet")]
    async fn example_photo(
        &self,
        Parameters(req): Parameters<ExamplePhotoRequest>,
    ) -> Result<CallToolResult, McpError> {
        let backend = match self.backend() {
            Ok(b) => b,
            Err(e) => return err_text(e),
        };
        let (product_id, sheet_id) = {
            let draft = lock(&self.console.link);
            (draft.form.product_id.clone(), draft.form.sheet_id.clone())
        };
        if product_id.is_empty() || sheet_id.is_empty() {
            return err_text("Select a product and a sheet with edit_link first.");
        }
        match backend.api.example_photo(&product_id, &sheet_id, &req.step).await {
            Ok(Some(photo)) => ok_json(&json!({
                "url": normalize_asset_url(backend.api.api_base().as_str(), &photo.url),
                "caption": photo.caption,
            })),
            Ok(None) => ok_text("No example photo for this step."),
            Err(e) => err_text(e.user_message()),
        }
    }

    #[tool(description = "Generate the WhatsApp deep link for the current link form. Fails with the list of missing items when the form is incomplete.")]
    fn generate_link(&self) -> Result<CallToolResult, McpError> {
        let number = self.settings().whatsapp_number;
        let draft = lock(&self.console.link);
        match build_link(&number, &draft.form, draft.sheet(), &draft.groups) {
            Ok(link) => ok_json(&link),
            Err(e) => err_text(e.to_string()),
        }
    }

    // --- Public reports ---

    #[tool(description = "Read a published report (chantier or session) by its public slug: title, general note, notes with excerpts, and the photo gallery")]
    async fn get_public_report(
        &self,
        Parameters(req): Parameters<ReportRequest>,
    ) -> Result<CallToolResult, McpError> {
        match self.load_report(req.kind, &req.slug).await {
            Ok(Some(view)) => ok_json(&view),
            Ok(None) => ok_text("Report not found."),
            Err(e) => err_text(e),
        }
    }

    #[tool(description = "Open one photo of a published report full screen, optionally moving next/previous and switching to the annotated rendition")]
    async fn view_report_photo(
        &self,
        Parameters(req): Parameters<ReportPhotoRequest>,
    ) -> Result<CallToolResult, McpError> {
        let view = match self.load_report(req.kind, &req.slug).await {
            Ok(Some(view)) => view,
            Ok(None) => return ok_text("Report not found."),
            Err(e) => return err_text(e),
        };
        let Some(mut viewer) = PhotoViewer::open(&view, req.index) else {
            return err_text(format!(
                "Photo #{} does not exist; the gallery has {} photos.",
                req.index,
                view.gallery.len()
            ));
        };
        move_viewer(&mut viewer, req.moves, view.gallery.len());
        let annotated = req.annotated && viewer.toggle_annotated(&view);
        let entry = &view.gallery[viewer.index()];
        ok_json(&json!({
            "index": viewer.index(),
            "count": view.gallery.len(),
            "url": viewer.current_url(&view),
            "annotated": annotated,
            "caption": entry.caption,
            "notes": entry.note_ids,
        }))
    }

    async fn load_report(&self, kind: ReportKind, slug: &str) -> Result<Option<ReportView>, String> {
        let backend = self.backend()?;
        let report = match kind {
            ReportKind::Chantier => backend.api.public_chantier(slug).await,
            ReportKind::Session => backend.api.public_session(slug).await,
        }
        .map_err(|e| e.user_message())?;
        let base = backend.api.api_base().to_string();
        Ok(report.and_then(|r| ReportView::from_report(&r, &base)))
    }

    // --- Inbox ---

    #[tool(description = "List SAV chantiers and unattached sessions, newest activity first, with client-side status/owner/search filters. Rows with new activity since mark_seen are flagged unseen.")]
    async fn inbox(
        &self,
        Parameters(filter): Parameters<InboxFilter>,
    ) -> Result<CallToolResult, McpError> {
        let backend = match self.backend() {
            Ok(b) => b,
            Err(e) => return err_text(e),
        };
        let overview = match backend.api.sav_overview().await {
            Ok(o) => o,
            Err(e) => return err_text(e.user_message()),
        };
        let rows = project_rows(&overview);
        let mut inbox = lock(&self.console.inbox);
        if let Err(e) = inbox.seen.retain_rows(&rows) {
            warn!(error = %e, "could not prune seen store");
        }
        let (statuses, owners) = facets(&rows);
        let listed: Vec<Value> = filter
            .apply(&rows)
            .into_iter()
            .map(|r| {
                json!({
                    "key": r.key(),
                    "kind": r.kind,
                    "title": r.title,
                    "reference": r.reference,
                    "status": r.status,
                    "owner": r.owner,
                    "installer": r.installer,
                    "photos": r.photo_count,
                    "sessions": r.session_count,
                    "last_activity": r.last_activity,
                    "unseen": inbox.seen.is_unseen(r),
                })
            })
            .collect();
        let total = rows.len();
        inbox.rows = rows;
        ok_json(&json!({
            "total": total,
            "shown": listed.len(),
            "statuses": statuses,
            "owners": owners,
            "rows": listed,
        }))
    }

    #[tool(description = "Mark an inbox row as seen so it is no longer highlighted until new activity arrives")]
    fn mark_seen(&self, Parameters(req): Parameters<RowKeyRequest>) -> Result<CallToolResult, McpError> {
        let mut inbox = lock(&self.console.inbox);
        let InboxState { rows, seen } = &mut *inbox;
        let Some(row) = rows.iter().find(|r| r.key() == req.key) else {
            return err_text(format!("Row '{}' is not in the last inbox listing.", req.key));
        };
        match seen.mark_seen(row) {
            Ok(()) => ok_text(format!("Marked '{}' as seen.", req.key)),
            Err(e) => err_text(format!("Failed to save seen state: {}", e)),
        }
    }

    #[tool(description = "Change the status and/or owner of a chantier or session")]
    async fn update_row(
        &self,
        Parameters(req): Parameters<UpdateRowRequest>,
    ) -> Result<CallToolResult, McpError> {
        let backend = match self.backend() {
            Ok(b) => b,
            Err(e) => return err_text(e),
        };
        let listed = lock(&self.console.inbox)
            .rows
            .iter()
            .find(|r| r.key() == req.key)
            .map(InboxRow::scope);
        let Some(scope) = listed.or_else(|| scope_for_key(&req.key)) else {
            return err_text(format!("Invalid row key '{}'.", req.key));
        };
        let mut patch = serde_json::Map::new();
        if let Some(status) = req.status {
            patch.insert("status".into(), json!(status.trim()));
        }
        if let Some(owner) = req.owner {
            patch.insert("owner".into(), json!(owner.trim()));
        }
        if patch.is_empty() {
            return err_text("Nothing to change: give a status or an owner.");
        }
        match backend.api.patch(&scope, &Value::Object(patch)).await {
            Ok(_) => ok_text(format!("Updated '{}'.", req.key)),
            Err(e) => err_text(e.user_message()),
        }
    }

    #[tool(description = "List intake sessions with their chantier, if any. Use it to pick a session for attach_session.")]
    async fn list_sessions(&self) -> Result<CallToolResult, McpError> {
        let backend = match self.backend() {
            Ok(b) => b,
            Err(e) => return err_text(e),
        };
        match backend.api.sessions_list().await {
            Ok(sessions) => {
                let listing: Vec<Value> = sessions
                    .iter()
                    .map(|s| {
                        json!({
                            "id": s.id,
                            "chantier_id": s.chantier_id,
                            "installer": s.installer.name,
                            "reference": s.reference,
                            "status": s.status,
                            "photos": s.photo_count,
                            "last_activity": s.last_activity,
                        })
                    })
                    .collect();
                ok_json(&listing)
            }
            Err(e) => err_text(e.user_message()),
        }
    }

    #[tool(description = "Attach a session to a chantier")]
    async fn attach_session(
        &self,
        Parameters(req): Parameters<AttachRequest>,
    ) -> Result<CallToolResult, McpError> {
        let backend = match self.backend() {
            Ok(b) => b,
            Err(e) => return err_text(e),
        };
        match backend.api.attach_session(&req.session_id, &req.chantier_id).await {
            Ok(()) => ok_text(format!(
                "Session '{}' attached to chantier '{}'.",
                req.session_id, req.chantier_id
            )),
            Err(e) => err_text(e.user_message()),
        }
    }

    #[tool(description = "Delete a chantier or session. Irreversible: requires confirm=true, otherwise nothing is sent.")]
    async fn delete_item(
        &self,
        Parameters(req): Parameters<DeleteItemRequest>,
    ) -> Result<CallToolResult, McpError> {
        let Some(scope) = scope_for_key(&req.key) else {
            return err_text(format!("Invalid row key '{}'.", req.key));
        };
        if !req.confirm {
            return err_text(format!(
                "Deleting '{}' is irreversible. Call again with confirm=true to proceed.",
                req.key
            ));
        }
        let backend = match self.backend() {
            Ok(b) => b,
            Err(e) => return err_text(e),
        };
        if let Err(e) = backend.api.delete(&scope).await {
            return err_text(e.user_message());
        }
        let mut desk = self.console.desk.lock().await;
        let open_here = desk.as_ref().is_some_and(|d| {
            let open = d.scope();
            open.is_chantier() == scope.is_chantier() && open.owner_id() == scope.owner_id()
        });
        if open_here {
            if let Some(closed) = desk.take() {
                closed.discard_pending();
            }
        }
        lock(&self.console.inbox).rows.retain(|r| r.key() != req.key);
        info!(key = %req.key, "item deleted");
        ok_text(format!("Deleted '{}'.", req.key))
    }

    #[tool(description = "Ask an installer over WhatsApp to send photos")]
    async fn request_photos(
        &self,
        Parameters(req): Parameters<PhotoRequest>,
    ) -> Result<CallToolResult, McpError> {
        let backend = match self.backend() {
            Ok(b) => b,
            Err(e) => return err_text(e),
        };
        if req.phone.trim().is_empty() {
            return err_text("A phone number is required.");
        }
        match backend.api.request_photos(&req).await {
            Ok(()) => ok_text(format!("Photo request sent to {}.", req.phone)),
            Err(e) => err_text(e.user_message()),
        }
    }

    // --- Desk ---

    #[tool(description = "Open a session or chantier on the desk. A chantier aggregates the photos of all its sessions; photo keys are \"sessionId__photoId\". Pending edits of the previously open item are saved first.")]
    async fn open_item(
        &self,
        Parameters(req): Parameters<OpenItemRequest>,
    ) -> Result<CallToolResult, McpError> {
        let backend = match self.backend() {
            Ok(b) => b,
            Err(e) => return err_text(e),
        };
        let mut desk = self.console.desk.lock().await;
        if let Some(previous) = desk.as_ref() {
            if let Err(e) = previous.flush().await {
                warn!(error = %e, "pending edits of the previous item were not saved");
            }
        }
        match DeskController::open(backend.api.clone(), &req.key).await {
            Ok(Some(controller)) => {
                let summary = controller.read(|d| {
                    desk_summary(d, backend.api.api_base().as_str(), &controller.pending_saves())
                });
                *desk = Some(controller);
                ok_json(&summary)
            }
            Ok(None) => ok_text(format!("Nothing found for '{}'.", req.key)),
            Err(e) => err_text(e.user_message()),
        }
    }

    #[tool(description = "Show the open item: photos with include flags and annotations, notes, general note, jobsite context and pending saves")]
    async fn desk_status(&self) -> Result<CallToolResult, McpError> {
        let api_base = self.settings().api_base;
        let desk = self.console.desk.lock().await;
        let Some(controller) = desk.as_ref() else {
            return err_text(NO_DESK);
        };
        let summary = controller.read(|d| desk_summary(d, &api_base, &controller.pending_saves()));
        ok_json(&summary)
    }

    #[tool(description = "Reload the sessions of the open item from the backend. Include flags still being saved keep their local value.")]
    async fn refresh_desk(&self) -> Result<CallToolResult, McpError> {
        let desk = self.console.desk.lock().await;
        let Some(controller) = desk.as_ref() else {
            return err_text(NO_DESK);
        };
        match controller.refresh().await {
            Ok(()) => ok_text("Desk refreshed."),
            Err(e) => err_text(e.user_message()),
        }
    }

    #[tool(description = "Flip \"include in report\" for a photo. Applied immediately, saved after a short pause.")]
    async fn toggle_include(
        &self,
        Parameters(req): Parameters<PhotoKeyRequest>,
    ) -> Result<CallToolResult, McpError> {
        let desk = self.console.desk.lock().await;
        let Some(controller) = desk.as_ref() else {
            return err_text(NO_DESK);
        };
        match controller.toggle_include(&req.photo_key) {
            Ok(change) => ok_text(format!(
                "{} is now {} the report.",
                change.key,
                if change.include { "in" } else { "out of" }
            )),
            Err(e) => err_text(e.to_string()),
        }
    }

    #[tool(description = "Edit the annotation draft (status, comment) of a photo. Saved after a short pause; unspecified fields keep their value.")]
    async fn edit_annotation(
        &self,
        Parameters(req): Parameters<AnnotationRequest>,
    ) -> Result<CallToolResult, McpError> {
        let desk = self.console.desk.lock().await;
        let Some(controller) = desk.as_ref() else {
            return err_text(NO_DESK);
        };
        let patch = Annotation {
            status: req.status,
            comment: req.comment,
            visual_url: None,
        };
        match controller.edit_draft(&req.photo_key, patch) {
            Ok(change) => ok_json(&change.draft),
            Err(e) => err_text(e.to_string()),
        }
    }

    #[tool(description = "Upload an annotated rendition of a photo (base64 image) and attach it to the photo's draft")]
    async fn upload_annotated_image(
        &self,
        Parameters(req): Parameters<ImageUploadRequest>,
    ) -> Result<CallToolResult, McpError> {
        let bytes = match base64_decode(&req.data_base64) {
            Ok(b) => b,
            Err(e) => return err_text(format!("Invalid base64 data: {}", e)),
        };
        let desk = self.console.desk.lock().await;
        let Some(controller) = desk.as_ref() else {
            return err_text(NO_DESK);
        };
        let upload = Upload {
            bytes,
            filename: req.filename,
            mime_type: req.mime_type.unwrap_or_else(|| "image/png".to_string()),
        };
        match controller.upload_annotated_image(&req.photo_key, upload).await {
            Ok(url) => ok_text(format!("Annotated image stored at {}.", url)),
            Err(e) => err_text(e.user_message()),
        }
    }

    #[tool(description = "Create a note (omit note_id) or update one, with the photos it refers to. Saved after a short pause.")]
    async fn save_note(
        &self,
        Parameters(req): Parameters<SaveNoteRequest>,
    ) -> Result<CallToolResult, McpError> {
        let desk = self.console.desk.lock().await;
        let Some(controller) = desk.as_ref() else {
            return err_text(NO_DESK);
        };
        match controller.save_note(req.note_id.as_deref(), &req.text, &req.photo_keys) {
            Ok(note) => ok_json(&note),
            Err(e) => err_text(e.to_string()),
        }
    }

    #[tool(description = "Delete a note. Irreversible: requires confirm=true, otherwise nothing changes.")]
    async fn delete_note(
        &self,
        Parameters(req): Parameters<DeleteNoteRequest>,
    ) -> Result<CallToolResult, McpError> {
        let desk = self.console.desk.lock().await;
        let Some(controller) = desk.as_ref() else {
            return err_text(NO_DESK);
        };
        match controller.delete_note(&req.note_id, req.confirm) {
            Ok(note) => ok_text(format!("Deleted note '{}'.", note.id)),
            Err(e) => err_text(e.to_string()),
        }
    }

    #[tool(description = "Set the general note of the report. Saved after a short pause.")]
    async fn set_general_note(
        &self,
        Parameters(req): Parameters<GeneralNoteRequest>,
    ) -> Result<CallToolResult, McpError> {
        let desk = self.console.desk.lock().await;
        let Some(controller) = desk.as_ref() else {
            return err_text(NO_DESK);
        };
        controller.set_general_note(&req.text);
        ok_text("General note updated.")
    }

    #[tool(description = "Upload a visual asset (base64 file) to a note")]
    async fn upload_note_asset(
        &self,
        Parameters(req): Parameters<NoteAssetRequest>,
    ) -> Result<CallToolResult, McpError> {
        let bytes = match base64_decode(&req.data_base64) {
            Ok(b) => b,
            Err(e) => return err_text(format!("Invalid base64 data: {}", e)),
        };
        let desk = self.console.desk.lock().await;
        let Some(controller) = desk.as_ref() else {
            return err_text(NO_DESK);
        };
        let upload = Upload {
            bytes,
            filename: req.filename,
            mime_type: req
                .mime_type
                .unwrap_or_else(|| "application/octet-stream".to_string()),
        };
        match controller.upload_note_asset(&req.note_id, upload).await {
            Ok(note) => ok_json(&note),
            Err(e) => err_text(e.user_message()),
        }
    }

    #[tool(description = "Remove a visual asset from a note")]
    async fn delete_note_asset(
        &self,
        Parameters(req): Parameters<DeleteNoteAssetRequest>,
    ) -> Result<CallToolResult, McpError> {
        let desk = self.console.desk.lock().await;
        let Some(controller) = desk.as_ref() else {
            return err_text(NO_DESK);
        };
        match controller.delete_note_asset(&req.note_id, &req.asset_id).await {
            Ok(true) => ok_text(format!("Removed asset '{}'.", req.asset_id)),
            Ok(false) => ok_text(format!("Asset '{}' was not on the note.", req.asset_id)),
            Err(e) => err_text(e.user_message()),
        }
    }

    #[tool(description = "Search the CRM for installer contacts. Results are numbered for edit_context's contact_index.")]
    async fn search_crm(
        &self,
        Parameters(req): Parameters<QueryRequest>,
    ) -> Result<CallToolResult, McpError> {
        let backend = match self.backend() {
            Ok(b) => b,
            Err(e) => return err_text(e),
        };
        match backend.crm.type_query(&req.query).await {
            Ok(Some(list)) if list.is_empty() => ok_text("No matching contacts."),
            Ok(Some(list)) => ok_text(
                list.iter()
                    .enumerate()
                    .map(|(i, c)| format!("{}. {} ({})", i, c.label(), c.phone))
                    .collect::<Vec<_>>()
                    .join("\n"),
            ),
            Ok(None) => ok_text("A newer search superseded this one."),
            Err(e) => err_text(e.user_message()),
        }
    }

    #[tool(description = "Edit the jobsite context (installer, reference, product) of the open item. Enters edit mode, applies the fields, and saves unless save=false.")]
    async fn edit_context(
        &self,
        Parameters(req): Parameters<EditContextRequest>,
    ) -> Result<CallToolResult, McpError> {
        let picked = match req.contact_index {
            Some(i) => {
                let backend = match self.backend() {
                    Ok(b) => b,
                    Err(e) => return err_text(e),
                };
                match backend.crm.results().get(i) {
                    Some(c) => Some(c.clone()),
                    None => return err_text(format!("No CRM result #{}. Run search_crm first.", i)),
                }
            }
            None => None,
        };
        let desk = self.console.desk.lock().await;
        let Some(controller) = desk.as_ref() else {
            return err_text(NO_DESK);
        };
        let edited = controller.edit_context(|ctx| {
            if let Some(contact) = &picked {
                ctx.pick_installer(contact)?;
            }
            if let Some(installer) = req.installer {
                ctx.set_installer(installer)?;
            }
            if let Some(reference) = &req.reference {
                ctx.set_reference(reference)?;
            }
            if let Some(product_id) = &req.product_id {
                ctx.set_product(product_id)?;
            }
            Ok(ctx.current().clone())
        });
        let current = match edited {
            Ok(c) => c,
            Err(e) => return err_text(e.to_string()),
        };
        if !req.save.unwrap_or(true) {
            return ok_json(&json!({ "editing": true, "context": current }));
        }
        match controller.save_context() {
            Ok(Some(patch)) => ok_json(&json!({ "saved": patch, "context": current })),
            Ok(None) => ok_text("No change to save."),
            Err(e) => err_text(e.to_string()),
        }
    }

    #[tool(description = "Discard unsaved jobsite context edits")]
    async fn cancel_context_edit(&self) -> Result<CallToolResult, McpError> {
        let desk = self.console.desk.lock().await;
        let Some(controller) = desk.as_ref() else {
            return err_text(NO_DESK);
        };
        controller.cancel_context_edit();
        ok_text("Context edits discarded.")
    }

    #[tool(description = "Publish the open item: saves pending edits, posts the included photos, notes and general note, then notifies the messaging webhook (a webhook failure does not undo the publication)")]
    async fn publish(&self) -> Result<CallToolResult, McpError> {
        let public_base = self.settings().public_base;
        let desk = self.console.desk.lock().await;
        let Some(controller) = desk.as_ref() else {
            return err_text(NO_DESK);
        };
        match controller.publish(&public_base).await {
            Ok(outcome) => ok_json(&outcome),
            Err(e) => err_text(e.user_message()),
        }
    }
}

const INSTRUCTIONS: &str = "\
SAV console for after-sales service of product installations.

- Link generator: lookup_people → edit_link (contact, chantier reference, product, sheet, intro fields, steps) → generate_link. Fields and step groups appear or disappear with the intro values.
- Inbox: inbox lists chantiers and unattached sessions; mark_seen clears the unseen highlight; update_row, list_sessions + attach_session, delete_item (confirm=true) and request_photos act on rows.
- Desk: open_item, then toggle_include / edit_annotation / save_note / set_general_note / edit_context, and publish. Edits apply locally at once and are saved after a short pause.
- Public reports: get_public_report and view_report_photo read published pages by slug.";

#[tool_handler]
impl ServerHandler for SavServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some(INSTRUCTIONS.into()),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use sav_core::GroupRule;

    #[test]
    fn row_keys_map_to_scopes() {
        assert_eq!(
            scope_for_key("chantier:12"),
            Some(DeskScope::Chantier {
                chantier_id: "12".into(),
                session_ids: vec![]
            })
        );
        assert_eq!(
            scope_for_key("session:s-1"),
            Some(DeskScope::Session {
                session_id: "s-1".into()
            })
        );
        assert_eq!(scope_for_key("session:"), None);
        assert_eq!(scope_for_key("12"), None);
    }

    #[test]
    fn viewer_moves_wrap_without_walking_every_lap() {
        let report: sav_core::PublicReport = serde_json::from_value(json!({
            "title": "CH-1",
            "photos": [
                {"id": "a", "url": "https://cdn.test/a.jpg"},
                {"id": "b", "url": "https://cdn.test/b.jpg"},
                {"id": "c", "url": "https://cdn.test/c.jpg"}
            ]
        }))
        .unwrap();
        let view = ReportView::from_report(&report, "https://api.test").unwrap();
        let len = view.gallery.len();

        let mut viewer = PhotoViewer::open(&view, 0).unwrap();
        move_viewer(&mut viewer, 4, len);
        assert_eq!(viewer.index(), 1);
        move_viewer(&mut viewer, -2, len);
        assert_eq!(viewer.index(), 2);
        move_viewer(&mut viewer, i64::MAX, len);
        assert_eq!(viewer.index(), (2 + (i64::MAX as u64 % 3) as usize) % 3);
        move_viewer(&mut viewer, i64::MIN, len);
        assert!(viewer.index() < len);
    }

    #[test]
    fn base64_payloads_decode() {
        assert_eq!(base64_decode(" aGk= ").unwrap(), b"hi".to_vec());
        assert!(base64_decode("***").is_err());
    }

    #[test]
    fn link_summary_hides_dependent_groups() {
        let product: Product = serde_json::from_value(json!({
            "id": "pac", "name": "Heat pump",
            "sheets": [{"id": "s1", "name": "Install", "introFields": [
                {"key": "height", "label": "Height", "type": "number", "required": true}
            ]}]
        }))
        .unwrap();
        let mut draft = LinkDraft {
            products: vec![product],
            groups: vec![StepGroup {
                category: "Roof".into(),
                keys: vec!["roof".into()],
                labels: Default::default(),
                show_if: Some(GroupRule {
                    field: "height".into(),
                    allowed_values: vec!["high".into()],
                }),
            }],
            ..Default::default()
        };
        draft.form.set_product("pac");
        draft.form.set_sheet("s1");

        let summary = link_summary(&draft);
        assert_eq!(summary["intro_fields"][0]["key"], json!("height"));
        assert_eq!(summary["step_groups"], json!([]));
        assert_eq!(summary["controls"]["copy_enabled"], json!(false));

        draft.form.set_intro_value("height", "high");
        let summary = link_summary(&draft);
        assert_eq!(summary["step_groups"][0]["depends_on"], json!("height"));
        assert_eq!(summary["step_groups"][0]["steps"][0]["label"], json!("roof"));
    }
}
