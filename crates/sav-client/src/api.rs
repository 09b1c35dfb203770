//! Typed client of the backend REST API and of the notification webhooks.

use std::time::Duration;

use reqwest::multipart::{Form, Part};
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};
use url::Url;

use sav_core::session::{DeskScope, PublishSelection};
use sav_core::{
    Annotation, ConsoleSettings, ContactCandidate, NoteAsset, Product, PublicReport, SavItem,
    SavOverview, Session, SessionSummary, StepGroup,
};

use crate::error::{map_reqwest_error, ApiError};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Lists come back either bare or wrapped in an object.
#[derive(Deserialize)]
#[serde(untagged)]
enum ListBody<T> {
    Bare(Vec<T>),
    Wrapped {
        #[serde(
            alias = "results",
            alias = "contacts",
            alias = "people",
            alias = "products",
            alias = "steps",
            alias = "groups",
            alias = "sessions"
        )]
        items: Vec<T>,
    },
}

impl<T> ListBody<T> {
    fn into_vec(self) -> Vec<T> {
        match self {
            ListBody::Bare(items) | ListBody::Wrapped { items } => items,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExamplePhoto {
    pub url: String,
    #[serde(default)]
    pub caption: Option<String>,
}

/// What the backend answers to a publish call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PublishReceipt {
    #[serde(default, alias = "public_slug")]
    pub slug: Option<String>,
    #[serde(default, alias = "public_url")]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnnotatedUpload {
    #[serde(alias = "url")]
    pub annotated_url: String,
}

/// Body of `POST /actions/whatsapp/request-photos`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct PhotoRequest {
    pub phone: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chantier_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// A file to send as the `file` part of a multipart upload.
#[derive(Debug, Clone)]
pub struct Upload {
    pub bytes: Vec<u8>,
    pub filename: String,
    pub mime_type: String,
}

impl Upload {
    fn into_part(self) -> Result<Part, ApiError> {
        Part::bytes(self.bytes)
            .file_name(self.filename)
            .mime_str(&self.mime_type)
            .map_err(|e| ApiError::Decode(format!("mime type: {e}")))
    }
}

fn parse_base(raw: &str, what: &'static str) -> Result<Url, ApiError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(ApiError::NotConfigured(what));
    }
    let url = Url::parse(raw)?;
    if !matches!(url.scheme(), "http" | "https") || url.cannot_be_a_base() {
        return Err(ApiError::InvalidUrl(raw.to_string()));
    }
    Ok(url)
}

fn scope_segments(scope: &DeskScope) -> [&str; 2] {
    match scope {
        DeskScope::Session { session_id } => ["sessions", session_id.as_str()],
        DeskScope::Chantier { chantier_id, .. } => ["chantiers", chantier_id.as_str()],
    }
}

#[derive(Debug, Clone)]
pub struct ApiClient {
    http: Client,
    api_base: Url,
    webhook_base: Option<Url>,
}

impl ApiClient {
    pub fn new(api_base: &str, webhook_base: Option<&str>) -> Result<Self, ApiError> {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(map_reqwest_error)?;
        Ok(Self {
            http,
            api_base: parse_base(api_base, "API base URL")?,
            webhook_base: webhook_base
                .filter(|w| !w.trim().is_empty())
                .map(|w| parse_base(w, "Webhook base URL"))
                .transpose()?,
        })
    }

    pub fn from_settings(settings: &ConsoleSettings) -> Result<Self, ApiError> {
        Self::new(&settings.api_base, Some(settings.webhook_base.as_str()))
    }

    pub fn api_base(&self) -> &Url {
        &self.api_base
    }

    /// Base origin + path segments (each percent-encoded) + query pairs.
    pub fn endpoint(&self, segments: &[&str], query: &[(&str, &str)]) -> Result<Url, ApiError> {
        join_url(&self.api_base, segments, query)
    }

    fn webhook(&self, hook: &str) -> Result<Url, ApiError> {
        let base = self
            .webhook_base
            .as_ref()
            .ok_or(ApiError::NotConfigured("Webhook base URL"))?;
        join_url(base, &[hook], &[])
    }

    async fn send(&self, req: RequestBuilder) -> Result<Response, ApiError> {
        let res = req.send().await.map_err(map_reqwest_error)?;
        let status = res.status();
        if status.is_success() {
            return Ok(res);
        }
        let body = res.text().await.unwrap_or_default();
        debug!(status = status.as_u16(), "backend returned an error status");
        Err(ApiError::Http {
            status: status.as_u16(),
            body,
        })
    }

    async fn read_json<T: DeserializeOwned>(res: Response) -> Result<T, ApiError> {
        let text = res.text().await.map_err(map_reqwest_error)?;
        let text = if text.trim().is_empty() { "null" } else { text.as_str() };
        Ok(serde_json::from_str(text)?)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, ApiError> {
        debug!(%url, "GET");
        let res = self.send(self.http.get(url)).await?;
        Self::read_json(res).await
    }

    /// GET where a 404 is the "not found" state rather than an error.
    async fn get_optional<T: DeserializeOwned>(&self, url: Url) -> Result<Option<T>, ApiError> {
        match self.get_json::<Option<T>>(url).await {
            Err(e) if e.is_not_found() => Ok(None),
            other => other,
        }
    }

    async fn get_list<T: DeserializeOwned>(&self, url: Url) -> Result<Vec<T>, ApiError> {
        let body: Option<ListBody<T>> = self.get_json(url).await?;
        Ok(body.map(ListBody::into_vec).unwrap_or_default())
    }

    async fn send_json<B, T>(&self, method: Method, url: Url, body: &B) -> Result<T, ApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        debug!(%method, %url, "send");
        let res = self.send(self.http.request(method, url).json(body)).await?;
        Self::read_json(res).await
    }

    // --- Lookups ---

    pub async fn lookup_people(&self, query: &str) -> Result<Vec<ContactCandidate>, ApiError> {
        self.get_list(self.endpoint(&["people", "lookup"], &[("q", query)])?)
            .await
    }

    pub async fn search_contacts(&self, query: &str) -> Result<Vec<ContactCandidate>, ApiError> {
        self.get_list(self.endpoint(&["contacts", "search"], &[("q", query)])?)
            .await
    }

    pub async fn products(&self) -> Result<Vec<Product>, ApiError> {
        self.get_list(self.endpoint(&["products"], &[])?).await
    }

    pub async fn steps(&self, product_id: &str, sheet_id: &str) -> Result<Vec<StepGroup>, ApiError> {
        self.get_list(self.endpoint(&["steps"], &[("product", product_id), ("sheet", sheet_id)])?)
            .await
    }

    pub async fn example_photo(
        &self,
        product_id: &str,
        sheet_id: &str,
        step: &str,
    ) -> Result<Option<ExamplePhoto>, ApiError> {
        let url = self.endpoint(
            &["example-photo"],
            &[("product", product_id), ("sheet", sheet_id), ("step", step)],
        )?;
        self.get_optional(url).await
    }

    // --- Reports, sessions and the SAV overview ---

    pub async fn public_chantier(&self, slug: &str) -> Result<Option<PublicReport>, ApiError> {
        if slug.trim().is_empty() {
            return Ok(None);
        }
        self.get_optional(self.endpoint(&["chantiers", "public", slug], &[])?)
            .await
    }

    pub async fn public_session(&self, slug: &str) -> Result<Option<PublicReport>, ApiError> {
        if slug.trim().is_empty() {
            return Ok(None);
        }
        self.get_optional(self.endpoint(&["sessions", "public", slug], &[])?)
            .await
    }

    pub async fn sav_overview(&self) -> Result<SavOverview, ApiError> {
        let overview: Option<SavOverview> =
            self.get_json(self.endpoint(&["sav", "overview"], &[])?).await?;
        Ok(overview.unwrap_or_default())
    }

    pub async fn sav_item(&self, key: &str) -> Result<Option<SavItem>, ApiError> {
        self.get_optional(self.endpoint(&["sav", "item", key], &[])?)
            .await
    }

    pub async fn session(&self, id: &str) -> Result<Option<Session>, ApiError> {
        self.get_optional(self.endpoint(&["sessions", id], &[])?)
            .await
    }

    pub async fn sessions_list(&self) -> Result<Vec<SessionSummary>, ApiError> {
        self.get_list(self.endpoint(&["sessions", "list"], &[])?)
            .await
    }

    // --- Mutations ---

    pub async fn publish(
        &self,
        scope: &DeskScope,
        selection: &PublishSelection,
    ) -> Result<PublishReceipt, ApiError> {
        let [kind, id] = scope_segments(scope);
        let receipt: Option<PublishReceipt> = self
            .send_json(Method::POST, self.endpoint(&[kind, id, "publish"], &[])?, selection)
            .await?;
        Ok(receipt.unwrap_or_default())
    }

    /// `PATCH /sessions/{id}` or `/chantiers/{id}`; returns whatever the backend echoes.
    pub async fn patch(&self, scope: &DeskScope, patch: &Value) -> Result<Value, ApiError> {
        let [kind, id] = scope_segments(scope);
        self.send_json(Method::PATCH, self.endpoint(&[kind, id], &[])?, patch)
            .await
    }

    pub async fn patch_session(&self, session_id: &str, patch: &Value) -> Result<Value, ApiError> {
        self.send_json(Method::PATCH, self.endpoint(&["sessions", session_id], &[])?, patch)
            .await
    }

    pub async fn save_photo_draft(
        &self,
        session_id: &str,
        photo_id: &str,
        draft: &Annotation,
    ) -> Result<(), ApiError> {
        let url = self.endpoint(&["sessions", session_id, "photos", photo_id, "draft"], &[])?;
        let _: Value = self.send_json(Method::POST, url, draft).await?;
        Ok(())
    }

    pub async fn attach_session(&self, session_id: &str, chantier_id: &str) -> Result<(), ApiError> {
        let url = self.endpoint(&["sessions", session_id, "attach"], &[])?;
        let _: Value = self
            .send_json(Method::POST, url, &json!({ "chantier_id": chantier_id }))
            .await?;
        Ok(())
    }

    /// Callers must have obtained the operator's confirmation first.
    pub async fn delete(&self, scope: &DeskScope) -> Result<(), ApiError> {
        let [kind, id] = scope_segments(scope);
        let url = self.endpoint(&[kind, id], &[])?;
        debug!(%url, "DELETE");
        self.send(self.http.delete(url)).await?;
        Ok(())
    }

    pub async fn upload_annotated_image(
        &self,
        session_id: &str,
        photo_id: &str,
        file: Upload,
    ) -> Result<AnnotatedUpload, ApiError> {
        let url = self.endpoint(&["sessions", session_id, "photos", photo_id, "annotated"], &[])?;
        let form = Form::new().part("file", file.into_part()?);
        let res = self.send(self.http.post(url).multipart(form)).await?;
        Self::read_json(res).await
    }

    pub async fn upload_note_asset(
        &self,
        scope: &DeskScope,
        note_id: &str,
        file: Upload,
    ) -> Result<NoteAsset, ApiError> {
        let [kind, id] = scope_segments(scope);
        let url = self.endpoint(&[kind, id, "notes", note_id, "assets"], &[])?;
        let form = Form::new().part("file", file.into_part()?);
        let res = self.send(self.http.post(url).multipart(form)).await?;
        Self::read_json(res).await
    }

    pub async fn delete_note_asset(
        &self,
        scope: &DeskScope,
        note_id: &str,
        asset_id: &str,
    ) -> Result<(), ApiError> {
        let [kind, id] = scope_segments(scope);
        let url = self.endpoint(&[kind, id, "notes", note_id, "assets", "delete"], &[])?;
        let form = Form::new().text("asset_id", asset_id.to_string());
        self.send(self.http.post(url).multipart(form)).await?;
        Ok(())
    }

    pub async fn request_photos(&self, request: &PhotoRequest) -> Result<(), ApiError> {
        let url = self.endpoint(&["actions", "whatsapp", "request-photos"], &[])?;
        let _: Value = self.send_json(Method::POST, url, request).await?;
        Ok(())
    }

    // --- Notification webhooks ---

    pub async fn notify_published(
        &self,
        scope: &DeskScope,
        receipt: &PublishReceipt,
    ) -> Result<(), ApiError> {
        let (hook, body) = match scope {
            DeskScope::Session { session_id } => (
                "notify-session-published",
                json!({ "session_id": session_id, "slug": receipt.slug, "url": receipt.url }),
            ),
            DeskScope::Chantier { chantier_id, .. } => (
                "notify-chantier-published",
                json!({ "chantier_id": chantier_id, "slug": receipt.slug, "url": receipt.url }),
            ),
        };
        let url = self.webhook(hook)?;
        let _: Value = self.send_json(Method::POST, url, &body).await?;
        Ok(())
    }

    /// Fire the notification; a failure is logged and never propagated.
    pub async fn notify_published_best_effort(&self, scope: &DeskScope, receipt: &PublishReceipt) -> bool {
        match self.notify_published(scope, receipt).await {
            Ok(()) => true,
            Err(e) => {
                warn!(owner = scope.owner_id(), error = %e, "publish notification failed");
                false
            }
        }
    }
}

fn join_url(base: &Url, segments: &[&str], query: &[(&str, &str)]) -> Result<Url, ApiError> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| ApiError::InvalidUrl(base.to_string()))?
        .pop_if_empty()
        .extend(segments);
    if !query.is_empty() {
        url.query_pairs_mut().extend_pairs(query);
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> ApiClient {
        ApiClient::new("https://api.test/v1/", Some("https://hooks.test")).unwrap()
    }

    #[test]
    fn endpoint_joins_and_encodes() {
        let c = client();
        assert_eq!(
            c.endpoint(&["sav", "item", "a/b c"], &[]).unwrap().as_str(),
            "https://api.test/v1/sav/item/a%2Fb%20c"
        );
        assert_eq!(
            c.endpoint(&["contacts", "search"], &[("q", "Dupont & fils")])
                .unwrap()
                .as_str(),
            "https://api.test/v1/contacts/search?q=Dupont+%26+fils"
        );
        assert_eq!(
            c.webhook("notify-session-published").unwrap().as_str(),
            "https://hooks.test/notify-session-published"
        );
    }

    #[test]
    fn missing_bases_are_reported() {
        assert_eq!(
            ApiClient::new("  ", None).unwrap_err(),
            ApiError::NotConfigured("API base URL")
        );
        assert!(matches!(
            ApiClient::new("ftp://x", None).unwrap_err(),
            ApiError::InvalidUrl(_)
        ));
        let c = ApiClient::new("http://localhost:8000", Some("")).unwrap();
        assert_eq!(
            c.webhook("x").unwrap_err(),
            ApiError::NotConfigured("Webhook base URL")
        );
    }

    #[test]
    fn lists_decode_bare_or_wrapped() {
        let bare: ListBody<ContactCandidate> = serde_json::from_str(r#"[{"name": "A"}]"#).unwrap();
        assert_eq!(bare.into_vec().len(), 1);
        let wrapped: ListBody<ContactCandidate> =
            serde_json::from_str(r#"{"results": [{"name": "A"}, {"name": "B"}]}"#).unwrap();
        assert_eq!(wrapped.into_vec().len(), 2);
    }

    #[test]
    fn receipt_accepts_public_field_names() {
        let r: PublishReceipt =
            serde_json::from_str(r#"{"public_slug": "abc", "public_url": "https://p/abc"}"#).unwrap();
        assert_eq!(r.slug.as_deref(), Some("abc"));
        assert_eq!(r.url.as_deref(), Some("https://p/abc"));
    }
}
