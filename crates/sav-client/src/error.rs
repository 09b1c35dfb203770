use sav_core::notes::NoteError;
use sav_core::session::{ContextError, DeskError};
use thiserror::Error;

/// Longest slice of a response body carried into a user-facing message.
const BODY_EXCERPT: usize = 200;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApiError {
    #[error("network error: {0}")]
    Transport(String),
    #[error("request timed out")]
    Timeout,
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("unexpected response: {0}")]
    Decode(String),
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
    #[error("{0} is not configured")]
    NotConfigured(&'static str),
}

impl ApiError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ApiError::Http { status: 404, .. })
    }

    /// Short text for a toast or inline message.
    pub fn user_message(&self) -> String {
        match self {
            ApiError::Transport(_) | ApiError::Timeout => {
                "Network error, check your connection and try again.".to_string()
            }
            ApiError::Http { status, body } => {
                let body = body.trim();
                if body.is_empty() {
                    format!("Request failed (HTTP {status}).")
                } else {
                    let excerpt: String = body.chars().take(BODY_EXCERPT).collect();
                    format!("Request failed (HTTP {status}): {excerpt}")
                }
            }
            ApiError::Decode(_) => "The server sent an unexpected response.".to_string(),
            ApiError::InvalidUrl(url) => format!("Invalid address: {url}"),
            ApiError::NotConfigured(what) => format!("{what} is not configured."),
        }
    }
}

pub(crate) fn map_reqwest_error(e: reqwest::Error) -> ApiError {
    if e.is_timeout() {
        ApiError::Timeout
    } else if e.is_decode() {
        ApiError::Decode(e.to_string())
    } else {
        ApiError::Transport(e.to_string())
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(e: serde_json::Error) -> Self {
        ApiError::Decode(e.to_string())
    }
}

impl From<url::ParseError> for ApiError {
    fn from(e: url::ParseError) -> Self {
        ApiError::InvalidUrl(e.to_string())
    }
}

/// Failure of a desk action: either the local edit was refused or the
/// backend call failed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeskFlowError {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Desk(#[from] DeskError),
    #[error(transparent)]
    Note(#[from] NoteError),
    #[error(transparent)]
    Context(#[from] ContextError),
}

impl DeskFlowError {
    pub fn user_message(&self) -> String {
        match self {
            DeskFlowError::Api(e) => e.user_message(),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_message_carries_body_excerpt() {
        let err = ApiError::Http {
            status: 409,
            body: "  session already published  ".into(),
        };
        assert_eq!(
            err.user_message(),
            "Request failed (HTTP 409): session already published"
        );

        let long = ApiError::Http {
            status: 500,
            body: "x".repeat(1000),
        };
        assert!(long.user_message().len() < 260);
    }

    #[test]
    fn empty_body_and_not_found() {
        let err = ApiError::Http {
            status: 404,
            body: String::new(),
        };
        assert!(err.is_not_found());
        assert_eq!(err.user_message(), "Request failed (HTTP 404).");
        assert!(!ApiError::Timeout.is_not_found());
    }

    #[test]
    fn desk_errors_keep_their_text() {
        let err = DeskFlowError::from(NoteError::BlankText);
        assert_eq!(err.user_message(), "note text is empty");
        let err = DeskFlowError::from(ApiError::NotConfigured("Webhook base"));
        assert_eq!(err.user_message(), "Webhook base is not configured.");
    }
}
