//! Read-only view of a published report: gallery, collapsible text blocks and
//! the full-screen photo viewer.

use serde::Serialize;

use crate::photos::normalize_asset_url;
use crate::PublicReport;

/// Collapsed text blocks show at most this much before "show more".
pub const EXCERPT_CHARS: usize = 280;
pub const EXCERPT_LINES: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Excerpt {
    pub text: String,
    /// Whether the block overflows and needs a "show more" control.
    pub truncated: bool,
}

pub fn excerpt(text: &str, max_chars: usize, max_lines: usize) -> Excerpt {
    let text = text.trim();
    let mut cut: Option<usize> = None;

    if let Some((idx, _)) = text.match_indices('\n').nth(max_lines.saturating_sub(1)) {
        cut = Some(idx);
    }
    if let Some((idx, _)) = text.char_indices().nth(max_chars) {
        cut = Some(cut.map_or(idx, |c| c.min(idx)));
    }

    match cut {
        None => Excerpt {
            text: text.to_string(),
            truncated: false,
        },
        Some(idx) => {
            let head = &text[..idx];
            // Prefer breaking on a word boundary when one is reasonably close.
            let head = match head.rfind(char::is_whitespace) {
                Some(ws) if ws > idx / 2 => &head[..ws],
                _ => head,
            };
            Excerpt {
                text: format!("{}…", head.trim_end()),
                truncated: true,
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GalleryEntry {
    pub id: String,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotated_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caption: Option<Excerpt>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Ids of the notes that reference this photo.
    pub note_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NoteBlock {
    pub id: String,
    pub excerpt: Excerpt,
    pub full_text: String,
    pub photo_ids: Vec<String>,
    pub asset_urls: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportView {
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub general_note: Option<Excerpt>,
    pub notes: Vec<NoteBlock>,
    pub gallery: Vec<GalleryEntry>,
}

impl ReportView {
    /// `None` when the report is not published: the page shows "not found".
    pub fn from_report(report: &PublicReport, asset_base: &str) -> Option<Self> {
        if !report.published {
            return None;
        }
        let notes: Vec<NoteBlock> = report
            .notes
            .iter()
            .filter(|n| !n.text.trim().is_empty() || !n.assets.is_empty())
            .map(|n| NoteBlock {
                id: n.id.clone(),
                excerpt: excerpt(&n.text, EXCERPT_CHARS, EXCERPT_LINES),
                full_text: n.text.clone(),
                photo_ids: n.photo_ids.clone(),
                asset_urls: n
                    .assets
                    .iter()
                    .filter_map(|a| normalize_asset_url(asset_base, &a.url))
                    .collect(),
            })
            .collect();

        let gallery = report
            .photos
            .iter()
            .filter_map(|p| {
                let url = normalize_asset_url(asset_base, &p.url)?;
                Some(GalleryEntry {
                    id: p.id.clone(),
                    url,
                    annotated_url: p
                        .annotated_url
                        .as_deref()
                        .and_then(|u| normalize_asset_url(asset_base, u)),
                    caption: p
                        .caption
                        .as_deref()
                        .filter(|c| !c.trim().is_empty())
                        .map(|c| excerpt(c, EXCERPT_CHARS, EXCERPT_LINES)),
                    status: p.status.clone(),
                    note_ids: notes
                        .iter()
                        .filter(|n| n.photo_ids.contains(&p.id))
                        .map(|n| n.id.clone())
                        .collect(),
                })
            })
            .collect();

        Some(Self {
            title: report.title.clone(),
            reference: report.reference.clone(),
            general_note: report
                .general_note
                .as_deref()
                .filter(|g| !g.trim().is_empty())
                .map(|g| excerpt(g, EXCERPT_CHARS, EXCERPT_LINES)),
            notes,
            gallery,
        })
    }
}

/// Full-screen single-photo viewer over a report gallery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PhotoViewer {
    index: usize,
    len: usize,
    show_annotated: bool,
}

impl PhotoViewer {
    pub fn open(view: &ReportView, index: usize) -> Option<Self> {
        (index < view.gallery.len()).then_some(Self {
            index,
            len: view.gallery.len(),
            show_annotated: false,
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn next(&mut self) {
        self.index = (self.index + 1) % self.len;
        self.show_annotated = false;
    }

    pub fn previous(&mut self) {
        self.index = (self.index + self.len - 1) % self.len;
        self.show_annotated = false;
    }

    /// Switch between original and annotated; a no-op when there is no annotated image.
    pub fn toggle_annotated(&mut self, view: &ReportView) -> bool {
        let has_annotated = view
            .gallery
            .get(self.index)
            .is_some_and(|e| e.annotated_url.is_some());
        if has_annotated {
            self.show_annotated = !self.show_annotated;
        }
        self.show_annotated
    }

    pub fn current_url<'a>(&self, view: &'a ReportView) -> Option<&'a str> {
        let entry = view.gallery.get(self.index)?;
        match (&entry.annotated_url, self.show_annotated) {
            (Some(annotated), true) => Some(annotated.as_str()),
            _ => Some(entry.url.as_str()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn report() -> PublicReport {
        serde_json::from_value(json!({
            "title": "Chantier Dupont",
            "general_note": "All good",
            "notes": [
                {"id": "n1", "text": "Valve replaced", "photo_ids": ["p1"],
                 "assets": [{"asset_id": "a1", "url": "/uploads/a1.png"}]},
                {"id": "n2", "text": "   "}
            ],
            "photos": [
                {"id": "p1", "url": "/m/p1.jpg", "annotated_url": "/m/p1-ann.jpg"},
                {"id": "p2", "url": "https://cdn.test/p2.jpg", "caption": "Front"},
                {"id": "p3", "url": ""}
            ]
        }))
        .unwrap()
    }

    #[test]
    fn short_text_is_not_truncated() {
        let e = excerpt("  hello  ", 10, 3);
        assert_eq!(e, Excerpt { text: "hello".into(), truncated: false });
    }

    #[test]
    fn long_text_breaks_on_word_boundary() {
        let e = excerpt("alpha beta gamma delta", 13, 10);
        assert!(e.truncated);
        assert_eq!(e.text, "alpha beta…");
    }

    #[test]
    fn too_many_lines_overflow() {
        let e = excerpt("a\nb\nc\nd", 100, 2);
        assert!(e.truncated);
        assert_eq!(e.text, "a\nb…");
    }

    #[test]
    fn multibyte_text_is_cut_on_char_boundary() {
        let e = excerpt("ééééé", 3, 5);
        assert_eq!(e.text, "ééé…");
    }

    #[test]
    fn report_view_normalizes_and_links() {
        let view = ReportView::from_report(&report(), "https://api.test").unwrap();
        assert_eq!(view.notes.len(), 1);
        assert_eq!(view.notes[0].asset_urls, vec!["https://api.test/uploads/a1.png"]);
        assert_eq!(view.gallery.len(), 2);
        assert_eq!(view.gallery[0].url, "https://api.test/m/p1.jpg");
        assert_eq!(view.gallery[0].note_ids, vec!["n1"]);
        assert_eq!(view.gallery[1].caption.as_ref().unwrap().text, "Front");
    }

    #[test]
    fn unpublished_report_is_not_found() {
        let mut r = report();
        r.published = false;
        assert!(ReportView::from_report(&r, "").is_none());
    }

    #[test]
    fn viewer_wraps_and_toggles_only_with_annotation() {
        let view = ReportView::from_report(&report(), "").unwrap();
        assert!(PhotoViewer::open(&view, 5).is_none());

        let mut viewer = PhotoViewer::open(&view, 0).unwrap();
        assert_eq!(viewer.current_url(&view), Some("/m/p1.jpg"));
        assert!(viewer.toggle_annotated(&view));
        assert_eq!(viewer.current_url(&view), Some("/m/p1-ann.jpg"));

        viewer.next();
        assert_eq!(viewer.index(), 1);
        assert!(!viewer.toggle_annotated(&view));
        viewer.next();
        assert_eq!(viewer.index(), 0);
        viewer.previous();
        assert_eq!(viewer.index(), 1);
    }
}
