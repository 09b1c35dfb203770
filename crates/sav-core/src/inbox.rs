//! Inbox: flat rows projected from `/sav/overview`, client-side filters, and
//! the "unseen" highlight.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::session::DeskScope;
use crate::{write_atomic, ChantierSummary, CoreError, SavOverview, SessionSummary};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowKind {
    Chantier,
    Session,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InboxRow {
    pub kind: RowKind,
    /// Backend id; also the key accepted by `/sav/item/{key}`.
    pub id: String,
    pub title: String,
    pub reference: String,
    pub status: String,
    pub owner: String,
    pub installer: String,
    pub photo_count: usize,
    pub session_count: usize,
    pub last_activity: Option<DateTime<Utc>>,
}

impl InboxRow {
    /// Unique across kinds.
    pub fn key(&self) -> String {
        match self.kind {
            RowKind::Chantier => format!("chantier:{}", self.id),
            RowKind::Session => format!("session:{}", self.id),
        }
    }

    /// Record targeted by the row's administrative actions.
    pub fn scope(&self) -> DeskScope {
        match self.kind {
            RowKind::Chantier => DeskScope::Chantier {
                chantier_id: self.id.clone(),
                session_ids: vec![],
            },
            RowKind::Session => DeskScope::Session {
                session_id: self.id.clone(),
            },
        }
    }

    /// Changes whenever new activity or photos arrive.
    pub fn signature(&self) -> String {
        let at = self
            .last_activity
            .map(|t| t.to_rfc3339())
            .unwrap_or_default();
        format!("{}|{}", at, self.photo_count)
    }
}

fn first_non_empty(candidates: &[Option<&str>]) -> String {
    candidates
        .iter()
        .flatten()
        .map(|s| s.trim())
        .find(|s| !s.is_empty())
        .unwrap_or_default()
        .to_string()
}

fn chantier_row(c: &ChantierSummary) -> InboxRow {
    let contact_name = c.contact.as_ref().map(|p| p.name.as_str());
    let first_installer = c.sessions.first().map(|s| s.installer.name.as_str());
    let last_activity = c
        .sessions
        .iter()
        .filter_map(|s| s.last_activity)
        .chain(c.last_activity)
        .max();
    InboxRow {
        kind: RowKind::Chantier,
        id: c.id.clone(),
        title: first_non_empty(&[c.title.as_deref(), Some(c.reference.as_str()), contact_name, Some(c.id.as_str())]),
        reference: c.reference.clone(),
        status: c.status.clone().unwrap_or_default(),
        owner: c.owner.clone().unwrap_or_default(),
        installer: first_non_empty(&[contact_name, first_installer]),
        photo_count: c.sessions.iter().map(|s| s.photo_count).sum(),
        session_count: c.sessions.len(),
        last_activity,
    }
}

fn session_row(s: &SessionSummary) -> InboxRow {
    InboxRow {
        kind: RowKind::Session,
        id: s.id.clone(),
        title: first_non_empty(&[Some(s.installer.name.as_str()), s.reference.as_deref(), Some(s.id.as_str())]),
        reference: s.reference.clone().unwrap_or_default(),
        status: s.status.clone().unwrap_or_default(),
        owner: s.owner.clone().unwrap_or_default(),
        installer: s.installer.name.clone(),
        photo_count: s.photo_count,
        session_count: 1,
        last_activity: s.last_activity,
    }
}

/// Chantiers and unattached sessions as rows, most recent activity first.
pub fn project_rows(overview: &SavOverview) -> Vec<InboxRow> {
    let mut rows: Vec<InboxRow> = overview
        .chantiers
        .iter()
        .map(chantier_row)
        .chain(
            overview
                .orphan_sessions
                .iter()
                .filter(|s| s.chantier_id.is_none())
                .map(session_row),
        )
        .collect();
    rows.sort_by(|a, b| {
        b.last_activity
            .cmp(&a.last_activity)
            .then_with(|| a.key().cmp(&b.key()))
    });
    rows
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct InboxFilter {
    /// Exact status, case-insensitive.
    #[serde(default)]
    pub status: Option<String>,
    /// Exact owner, case-insensitive; an empty string selects unassigned rows.
    #[serde(default)]
    pub owner: Option<String>,
    /// Free text matched against id, title, reference, installer and owner.
    #[serde(default)]
    pub search: String,
}

impl InboxFilter {
    pub fn matches(&self, row: &InboxRow) -> bool {
        let eq = |a: &str, b: &str| a.trim().eq_ignore_ascii_case(b.trim());
        if let Some(status) = self.status.as_deref().filter(|s| !s.trim().is_empty()) {
            if !eq(&row.status, status) {
                return false;
            }
        }
        if let Some(owner) = self.owner.as_deref() {
            if !eq(&row.owner, owner) {
                return false;
            }
        }
        let needle = self.search.trim().to_lowercase();
        if needle.is_empty() {
            return true;
        }
        [&row.id, &row.title, &row.reference, &row.installer, &row.owner]
            .iter()
            .any(|field| field.to_lowercase().contains(&needle))
    }

    pub fn apply<'a>(&self, rows: &'a [InboxRow]) -> Vec<&'a InboxRow> {
        rows.iter().filter(|r| self.matches(r)).collect()
    }
}

/// Distinct non-empty statuses and owners, for the filter pickers.
pub fn facets(rows: &[InboxRow]) -> (Vec<String>, Vec<String>) {
    let statuses: BTreeSet<String> = rows
        .iter()
        .map(|r| r.status.clone())
        .filter(|s| !s.is_empty())
        .collect();
    let owners: BTreeSet<String> = rows
        .iter()
        .map(|r| r.owner.clone())
        .filter(|s| !s.is_empty())
        .collect();
    (statuses.into_iter().collect(), owners.into_iter().collect())
}

// --- Seen signatures ---

const SEEN_FILE: &str = "seen.json";

/// Last signature the operator looked at, per row key. Persisted locally.
#[derive(Debug, Clone)]
pub struct SeenStore {
    dir: PathBuf,
    entries: HashMap<String, String>,
}

impl SeenStore {
    /// Open the store in `dir`; a missing or corrupt file starts empty.
    pub fn open(dir: &Path) -> Self {
        let entries = std::fs::read_to_string(dir.join(SEEN_FILE))
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default();
        Self {
            dir: dir.to_path_buf(),
            entries,
        }
    }

    pub fn is_unseen(&self, row: &InboxRow) -> bool {
        self.entries.get(&row.key()) != Some(&row.signature())
    }

    pub fn mark_seen(&mut self, row: &InboxRow) -> Result<(), CoreError> {
        self.entries.insert(row.key(), row.signature());
        self.save()
    }

    /// Drop entries for rows that no longer exist.
    pub fn retain_rows(&mut self, rows: &[InboxRow]) -> Result<(), CoreError> {
        let keys: BTreeSet<String> = rows.iter().map(InboxRow::key).collect();
        let before = self.entries.len();
        self.entries.retain(|k, _| keys.contains(k));
        if self.entries.len() != before {
            self.save()?;
        }
        Ok(())
    }

    fn save(&self) -> Result<(), CoreError> {
        let json = serde_json::to_string_pretty(&self.entries)?;
        write_atomic(&self.dir, SEEN_FILE, &json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn overview() -> SavOverview {
        serde_json::from_value(json!({
            "chantiers": [{
                "id": 1, "reference": "CH-001", "status": "open", "owner": "Marc",
                "contact": {"name": "Durand"},
                "last_activity": "2024-03-01T08:00:00Z",
                "sessions": [
                    {"id": "s1", "photo_count": 3, "last_activity": "2024-03-04T08:00:00Z", "installer": {"name": "Paul"}},
                    {"id": "s2", "photo_count": 2}
                ]
            }],
            "orphan_sessions": [
                {"id": "s9", "photo_count": 1, "status": "new", "installer": {"name": "Zoé"},
                 "last_activity": "2024-03-05T08:00:00Z"},
                {"id": "s10", "reference": "R-10", "status": "Open"},
                {"id": "s11", "chantier_id": 1}
            ]
        }))
        .unwrap()
    }

    #[test]
    fn projection_flattens_and_sorts_by_activity() {
        let rows = project_rows(&overview());
        let ids: Vec<_> = rows.iter().map(|r| r.key()).collect();
        assert_eq!(ids, vec!["session:s9", "chantier:1", "session:s10"]);

        let chantier = &rows[1];
        assert_eq!(chantier.title, "CH-001");
        assert_eq!(chantier.installer, "Durand");
        assert_eq!(chantier.photo_count, 5);
        assert_eq!(chantier.session_count, 2);
        assert_eq!(
            chantier.last_activity,
            Some("2024-03-04T08:00:00Z".parse().unwrap())
        );
        assert_eq!(rows[2].title, "R-10");
        assert_eq!(chantier.scope().owner_id(), "1");
        assert!(!rows[0].scope().is_chantier());
    }

    #[test]
    fn filters_combine_status_owner_and_search() {
        let rows = project_rows(&overview());
        let by_status = InboxFilter {
            status: Some("OPEN".into()),
            ..Default::default()
        };
        let keys: Vec<_> = by_status.apply(&rows).iter().map(|r| r.key()).collect();
        assert_eq!(keys, vec!["chantier:1", "session:s10"]);

        let unassigned = InboxFilter {
            owner: Some(String::new()),
            ..Default::default()
        };
        assert_eq!(unassigned.apply(&rows).len(), 2);

        let search = InboxFilter {
            search: " zoé ".into(),
            ..Default::default()
        };
        assert_eq!(search.apply(&rows)[0].id, "s9");

        let (statuses, owners) = facets(&rows);
        assert_eq!(statuses, vec!["Open", "new", "open"]);
        assert_eq!(owners, vec!["Marc"]);
    }

    #[test]
    fn unseen_flips_with_signature_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let mut rows = project_rows(&overview());
        let mut store = SeenStore::open(dir.path());
        assert!(store.is_unseen(&rows[0]));

        store.mark_seen(&rows[0]).unwrap();
        assert!(!store.is_unseen(&rows[0]));
        let reopened = SeenStore::open(dir.path());
        assert!(!reopened.is_unseen(&rows[0]));

        rows[0].photo_count += 1;
        assert!(reopened.is_unseen(&rows[0]));
    }

    #[test]
    fn retain_rows_prunes_deleted_items() {
        let dir = tempfile::tempdir().unwrap();
        let rows = project_rows(&overview());
        let mut store = SeenStore::open(dir.path());
        for row in &rows {
            store.mark_seen(row).unwrap();
        }
        store.retain_rows(&rows[..1]).unwrap();
        let reopened = SeenStore::open(dir.path());
        assert!(!reopened.is_unseen(&rows[0]));
        assert!(reopened.is_unseen(&rows[1]));
    }
}
