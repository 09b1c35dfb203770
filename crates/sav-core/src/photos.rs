//! Photo helpers: multi-session aggregation, annotation merging, asset URLs.

use serde::Serialize;

use crate::{Annotation, Photo, Session};

const KEY_SEPARATOR: &str = "__";

/// Composite key namespacing a photo by its origin session.
pub fn photo_key(session_id: &str, photo_id: &str) -> String {
    format!("{session_id}{KEY_SEPARATOR}{photo_id}")
}

/// Reverse of [`photo_key`]: `(session_id, photo_id)`.
pub fn split_photo_key(key: &str) -> Option<(&str, &str)> {
    let (session_id, photo_id) = key.split_once(KEY_SEPARATOR)?;
    if session_id.is_empty() || photo_id.is_empty() {
        return None;
    }
    Some((session_id, photo_id))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregatedPhoto {
    pub key: String,
    pub session_id: String,
    pub photo_id: String,
    pub photo: Photo,
}

/// Flatten the photos of several sessions into one list keyed `sessionId__photoId`.
///
/// Sessions keep the order given, photos keep their order inside a session.
/// A key seen twice keeps its first occurrence.
pub fn aggregate_photos(sessions: &[Session]) -> Vec<AggregatedPhoto> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for session in sessions {
        for photo in &session.photos {
            let key = photo_key(&session.id, &photo.id);
            if !seen.insert(key.clone()) {
                continue;
            }
            out.push(AggregatedPhoto {
                key,
                session_id: session.id.clone(),
                photo_id: photo.id.clone(),
                photo: photo.clone(),
            });
        }
    }
    out
}

/// Draft fields override the published ones, field by field.
pub fn effective_annotation(photo: &Photo) -> Annotation {
    let published = photo.published.clone().unwrap_or_default();
    match &photo.draft {
        None => published,
        Some(draft) => Annotation {
            status: draft.status.clone().or(published.status),
            comment: draft.comment.clone().or(published.comment),
            visual_url: draft.visual_url.clone().or(published.visual_url),
        },
    }
}

/// Turn whatever the backend stored for an asset into something loadable.
///
/// Absolute, `data:` and `blob:` URLs pass through, protocol-relative ones get
/// `https:`, anything else is joined onto `base`.
pub fn normalize_asset_url(base: &str, raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let lower = raw.to_ascii_lowercase();
    if ["http://", "https://", "data:", "blob:"]
        .iter()
        .any(|p| lower.starts_with(p))
    {
        return Some(raw.to_string());
    }
    if let Some(rest) = raw.strip_prefix("//") {
        return Some(format!("https://{rest}"));
    }
    let base = base.trim().trim_end_matches('/');
    if base.is_empty() {
        return Some(raw.to_string());
    }
    Some(format!("{}/{}", base, raw.trim_start_matches('/')))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(id: &str, photos: &[&str]) -> Session {
        serde_json::from_value(serde_json::json!({
            "id": id,
            "photos": photos.iter().map(|p| serde_json::json!({"id": p, "url": format!("/m/{p}.jpg")})).collect::<Vec<_>>(),
        }))
        .unwrap()
    }

    #[test]
    fn same_photo_id_in_two_sessions_gets_two_keys() {
        let merged = aggregate_photos(&[session("s1", &["p1"]), session("s2", &["p1"])]);
        let keys: Vec<_> = merged.iter().map(|p| p.key.as_str()).collect();
        assert_eq!(keys, vec!["s1__p1", "s2__p1"]);
        assert_eq!(merged[1].session_id, "s2");
        assert_eq!(merged[1].photo_id, "p1");
        assert_eq!(split_photo_key(&merged[0].key), Some(("s1", "p1")));
    }

    #[test]
    fn duplicate_keys_keep_first_occurrence() {
        let merged = aggregate_photos(&[session("s1", &["a", "b", "a"])]);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn sessions_keep_the_given_order_whatever_their_dates() {
        let mut late = session("late", &["x", "w"]);
        late.created_at = Some("2024-05-02T10:00:00Z".parse().unwrap());
        let mut early = session("early", &["y"]);
        early.created_at = Some("2024-05-01T10:00:00Z".parse().unwrap());
        let undated = session("undated", &["z"]);

        let merged = aggregate_photos(&[undated, late, early]);
        let keys: Vec<_> = merged.iter().map(|p| p.key.as_str()).collect();
        assert_eq!(keys, vec!["undated__z", "late__x", "late__w", "early__y"]);
    }

    #[test]
    fn split_rejects_malformed_keys() {
        assert_eq!(split_photo_key("p1"), None);
        assert_eq!(split_photo_key("__p1"), None);
        assert_eq!(split_photo_key("s1__"), None);
    }

    #[test]
    fn draft_fields_override_published() {
        let mut photo = session("s", &["p"]).photos.remove(0);
        photo.published = Some(Annotation {
            status: Some("ok".into()),
            comment: Some("fine".into()),
            visual_url: None,
        });
        photo.draft = Some(Annotation {
            status: Some("ko".into()),
            ..Default::default()
        });
        let eff = effective_annotation(&photo);
        assert_eq!(eff.status.as_deref(), Some("ko"));
        assert_eq!(eff.comment.as_deref(), Some("fine"));
        assert!(eff.visual_url.is_none());
    }

    #[test]
    fn asset_urls_are_normalized() {
        let base = "https://cdn.test/";
        assert_eq!(normalize_asset_url(base, " "), None);
        assert_eq!(
            normalize_asset_url(base, "HTTPS://x.test/a.jpg").as_deref(),
            Some("HTTPS://x.test/a.jpg")
        );
        assert_eq!(
            normalize_asset_url(base, "//img.test/a.jpg").as_deref(),
            Some("https://img.test/a.jpg")
        );
        assert_eq!(
            normalize_asset_url(base, "/uploads/a.jpg").as_deref(),
            Some("https://cdn.test/uploads/a.jpg")
        );
        assert_eq!(
            normalize_asset_url(base, "uploads/a.jpg").as_deref(),
            Some("https://cdn.test/uploads/a.jpg")
        );
        assert_eq!(normalize_asset_url("", "a.jpg").as_deref(), Some("a.jpg"));
    }
}
