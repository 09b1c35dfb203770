pub mod inbox;
pub mod link;
pub mod merge;
pub mod notes;
pub mod photos;
pub mod report;
pub mod rules;
pub mod session;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

// --- Types (as served by the backend) ---

/// Backend ids arrive either as strings or as integers depending on the table.
fn de_id<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Str(String),
        Int(i64),
    }
    Ok(match Raw::deserialize(d)? {
        Raw::Str(s) => s,
        Raw::Int(n) => n.to_string(),
    })
}

fn de_opt_id<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Str(String),
        Int(i64),
    }
    Ok(match Option::<Raw>::deserialize(d)? {
        Some(Raw::Str(s)) if !s.is_empty() => Some(s),
        Some(Raw::Int(n)) => Some(n.to_string()),
        _ => None,
    })
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, schemars::JsonSchema)]
pub struct ContactCandidate {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub company: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub display: String,
}

impl ContactCandidate {
    /// Text shown in the autocomplete list.
    pub fn label(&self) -> String {
        if !self.display.trim().is_empty() {
            return self.display.clone();
        }
        match (self.name.trim(), self.company.trim()) {
            (n, "") => n.to_string(),
            ("", c) => c.to_string(),
            (n, c) => format!("{n} — {c}"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Product {
    #[serde(deserialize_with = "de_id")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub sheets: Vec<Sheet>,
}

impl Product {
    pub fn sheet(&self, sheet_id: &str) -> Option<&Sheet> {
        self.sheets.iter().find(|s| s.id == sheet_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Sheet {
    #[serde(deserialize_with = "de_id")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, alias = "intro_fields")]
    pub intro_fields: Vec<IntroField>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    Number,
    Select,
    Phone,
    Email,
    /// Also what any unknown type decodes to.
    #[default]
    #[serde(other)]
    Text,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FieldOption {
    pub value: String,
    #[serde(default)]
    pub label: String,
}

/// Raw intro-field rule, e.g. `{"field": "surface", "rule": ">=30", "mapTo": {"large": 50}}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FieldRule {
    pub field: String,
    pub rule: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub map_to: HashMap<String, f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IntroField {
    pub key: String,
    #[serde(default)]
    pub label: String,
    #[serde(default, rename = "type")]
    pub kind: FieldKind,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<FieldOption>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub show_if: Option<FieldRule>,
}

/// Raw step-group rule: the group shows when `field` holds one of `allowedValues`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GroupRule {
    pub field: String,
    #[serde(default)]
    pub allowed_values: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StepGroup {
    pub category: String,
    #[serde(default)]
    pub keys: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub show_if: Option<GroupRule>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, schemars::JsonSchema)]
pub struct Installer {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub company: String,
    #[serde(default)]
    pub email: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Annotation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visual_url: Option<String>,
}

impl Annotation {
    pub fn is_empty(&self) -> bool {
        self.status.is_none() && self.comment.is_none() && self.visual_url.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Photo {
    #[serde(deserialize_with = "de_id")]
    pub id: String,
    #[serde(default)]
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotated_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_key: Option<String>,
    #[serde(default)]
    pub include_in_report: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published: Option<Annotation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub draft: Option<Annotation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub received_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NoteAsset {
    #[serde(deserialize_with = "de_id")]
    pub asset_id: String,
    #[serde(default)]
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// An SAV item: free text plus linked photos and uploaded visuals.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Note {
    #[serde(deserialize_with = "de_id")]
    pub id: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub photo_ids: Vec<String>,
    #[serde(default)]
    pub assets: Vec<NoteAsset>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Session {
    #[serde(deserialize_with = "de_id")]
    pub id: String,
    #[serde(default, deserialize_with = "de_opt_id", skip_serializing_if = "Option::is_none")]
    pub chantier_id: Option<String>,
    #[serde(default)]
    pub installer: Installer,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    #[serde(default, deserialize_with = "de_opt_id", skip_serializing_if = "Option::is_none")]
    pub product_id: Option<String>,
    #[serde(default, deserialize_with = "de_opt_id", skip_serializing_if = "Option::is_none")]
    pub sheet_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default)]
    pub photos: Vec<Photo>,
    #[serde(default)]
    pub notes: Vec<Note>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub general_note: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_slug: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chantier {
    #[serde(deserialize_with = "de_id")]
    pub id: String,
    #[serde(default)]
    pub reference: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact: Option<ContactCandidate>,
    #[serde(default)]
    pub participants: Vec<ContactCandidate>,
    #[serde(default)]
    pub notes: Vec<Note>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub general_note: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_slug: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<DateTime<Utc>>,
}

/// Payload of `GET /sav/item/{key}`: a key resolves to a lone session or to a
/// chantier with its child sessions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SavItem {
    Session {
        session: Session,
    },
    Chantier {
        chantier: Chantier,
        #[serde(default)]
        sessions: Vec<Session>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionSummary {
    #[serde(deserialize_with = "de_id")]
    pub id: String,
    #[serde(default, deserialize_with = "de_opt_id", skip_serializing_if = "Option::is_none")]
    pub chantier_id: Option<String>,
    #[serde(default)]
    pub installer: Installer,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default)]
    pub photo_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChantierSummary {
    #[serde(deserialize_with = "de_id")]
    pub id: String,
    #[serde(default)]
    pub reference: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact: Option<ContactCandidate>,
    #[serde(default)]
    pub sessions: Vec<SessionSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<DateTime<Utc>>,
}

/// Payload of `GET /sav/overview`.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct SavOverview {
    #[serde(default)]
    pub chantiers: Vec<ChantierSummary>,
    #[serde(default, alias = "sessions")]
    pub orphan_sessions: Vec<SessionSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PublishedPhoto {
    #[serde(deserialize_with = "de_id")]
    pub id: String,
    #[serde(default)]
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotated_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

/// Published report served at `/chantiers/public/{slug}` or `/sessions/public/{slug}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PublicReport {
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub general_note: Option<String>,
    #[serde(default)]
    pub notes: Vec<Note>,
    #[serde(default)]
    pub photos: Vec<PublishedPhoto>,
    #[serde(default = "default_published")]
    pub published: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
}

fn default_published() -> bool {
    true
}

// --- Storage ---

/// Resolve the console's config directory (~/.sav-console/).
pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".sav-console")
}

/// Write a file atomically (temp file + rename) inside `dir`.
pub(crate) fn write_atomic(dir: &Path, file_name: &str, data: &str) -> Result<(), CoreError> {
    fs::create_dir_all(dir)?;
    let tmp = dir.join(format!(".{}.tmp", file_name));
    let path = dir.join(file_name);
    fs::write(&tmp, data)?;
    fs::rename(&tmp, &path)?;
    Ok(())
}

// --- Console settings ---

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConsoleSettings {
    /// Origin of the REST backend, e.g. "https://api.example.com".
    pub api_base: String,
    /// Origin of the outbound notification webhook service.
    #[serde(default)]
    pub webhook_base: String,
    /// Business WhatsApp number installers are sent to.
    #[serde(default)]
    pub whatsapp_number: String,
    /// Origin used to build public report links.
    #[serde(default)]
    pub public_base: String,
}

const SETTINGS_FILE: &str = "settings.json";

pub const ENV_API_BASE: &str = "SAV_API_BASE";
pub const ENV_WEBHOOK_BASE: &str = "SAV_WEBHOOK_BASE";
pub const ENV_WHATSAPP_NUMBER: &str = "SAV_WHATSAPP_NUMBER";
pub const ENV_PUBLIC_BASE: &str = "SAV_PUBLIC_BASE";

/// Read settings from `dir`, falling back to defaults when absent or unreadable.
pub fn read_settings_in(dir: &Path) -> ConsoleSettings {
    let path = dir.join(SETTINGS_FILE);
    if !path.exists() {
        return ConsoleSettings::default();
    }
    fs::read_to_string(&path)
        .ok()
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default()
}

pub fn write_settings_in(dir: &Path, settings: &ConsoleSettings) -> Result<(), CoreError> {
    let json = serde_json::to_string_pretty(settings)?;
    write_atomic(dir, SETTINGS_FILE, &json)
}

/// Overlay non-empty environment values on top of the file settings.
pub fn apply_env_overrides(
    mut settings: ConsoleSettings,
    lookup: impl Fn(&str) -> Option<String>,
) -> ConsoleSettings {
    let pick = |key: &str, slot: &mut String| {
        if let Some(v) = lookup(key).filter(|v| !v.trim().is_empty()) {
            *slot = v.trim().to_string();
        }
    };
    pick(ENV_API_BASE, &mut settings.api_base);
    pick(ENV_WEBHOOK_BASE, &mut settings.webhook_base);
    pick(ENV_WHATSAPP_NUMBER, &mut settings.whatsapp_number);
    pick(ENV_PUBLIC_BASE, &mut settings.public_base);
    settings
}

/// Settings file in the config directory plus environment overrides.
pub fn read_settings() -> ConsoleSettings {
    apply_env_overrides(read_settings_in(&config_dir()), |k| std::env::var(k).ok())
}

pub fn write_settings(settings: &ConsoleSettings) -> Result<(), CoreError> {
    write_settings_in(&config_dir(), settings)
}

pub fn settings_configured(settings: &ConsoleSettings) -> bool {
    let base = settings.api_base.trim();
    base.starts_with("http://") || base.starts_with("https://")
}
