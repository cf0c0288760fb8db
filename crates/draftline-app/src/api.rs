// HTTP client for the draft service's REST endpoints: the authoritative
// snapshot, pick submission and the owner's start request.

use async_trait::async_trait;
use draftline_core::draft::{DraftState, PickRejection};
use draftline_core::protocol::DraftSnapshot;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Machine-readable reason in a rejection body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionCode {
    AlreadyTaken,
    CategoryConflict,
    NotYourTurn,
    SessionNotActive,
    #[serde(other)]
    Other,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("rejected ({code:?}): {message}")]
    Rejected { code: RejectionCode, message: String },

    #[error("server returned {status}: {message}")]
    Status { status: u16, message: String },
}

impl ApiError {
    /// Translate a server rejection into the local rejection type, filling
    /// in what the body leaves out from the current state.
    pub fn as_rejection(
        &self,
        state: &DraftState,
        submitter: &str,
        item_id: &str,
    ) -> Option<PickRejection> {
        let ApiError::Rejected { code, .. } = self else {
            return None;
        };
        let rejection = match code {
            RejectionCode::AlreadyTaken => PickRejection::AlreadyTaken(item_id.to_string()),
            RejectionCode::CategoryConflict => PickRejection::CategoryConflict {
                user_id: submitter.to_string(),
                categories: state.item(item_id)?.categories.clone(),
            },
            RejectionCode::NotYourTurn => PickRejection::NotYourTurn {
                submitter: submitter.to_string(),
                holder: state.current_holder()?.clone(),
            },
            RejectionCode::SessionNotActive => PickRejection::SessionNotActive,
            RejectionCode::Other => return None,
        };
        Some(rejection)
    }
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    code: Option<RejectionCode>,
    #[serde(default)]
    message: String,
}

// ---------------------------------------------------------------------------
// DraftApi
// ---------------------------------------------------------------------------

/// The collaborator endpoints the live session calls.
#[async_trait]
pub trait DraftApi: Send + Sync + 'static {
    async fn fetch_snapshot(&self, draft_id: &str) -> Result<DraftSnapshot, ApiError>;

    /// Submit a pick. The response is the state after the pick.
    async fn submit_pick(&self, draft_id: &str, item_id: &str) -> Result<DraftSnapshot, ApiError>;

    /// Owner-only.
    async fn start_draft(&self, draft_id: &str) -> Result<DraftSnapshot, ApiError>;
}

/// `DraftApi` over HTTPS with a bearer token.
pub struct HttpDraftApi {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpDraftApi {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        let base_url: String = base_url.into();
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    fn draft_url(&self, draft_id: &str) -> String {
        format!("{}/drafts/{draft_id}", self.base_url)
    }

    async fn execute(&self, request: reqwest::RequestBuilder) -> Result<DraftSnapshot, ApiError> {
        let response = request
            .bearer_auth(&self.token)
            .header("accept", "application/json")
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(response.json::<DraftSnapshot>().await?);
        }

        let text = response.text().await.unwrap_or_default();
        match serde_json::from_str::<ErrorBody>(&text) {
            Ok(ErrorBody {
                code: Some(code),
                message,
            }) => {
                debug!("Request rejected with {code:?}: {message}");
                Err(ApiError::Rejected { code, message })
            }
            Ok(ErrorBody { message, .. }) if !message.is_empty() => {
                warn!("HTTP {status}: {message}");
                Err(ApiError::Status {
                    status: status.as_u16(),
                    message,
                })
            }
            _ => {
                warn!("HTTP {status} with unrecognized body");
                Err(ApiError::Status {
                    status: status.as_u16(),
                    message: text,
                })
            }
        }
    }
}

#[async_trait]
impl DraftApi for HttpDraftApi {
    async fn fetch_snapshot(&self, draft_id: &str) -> Result<DraftSnapshot, ApiError> {
        self.execute(self.http.get(self.draft_url(draft_id))).await
    }

    async fn submit_pick(&self, draft_id: &str, item_id: &str) -> Result<DraftSnapshot, ApiError> {
        let body = serde_json::json!({ "itemId": item_id });
        let url = format!("{}/picks", self.draft_url(draft_id));
        self.execute(self.http.post(url).json(&body)).await
    }

    async fn start_draft(&self, draft_id: &str) -> Result<DraftSnapshot, ApiError> {
        let url = format!("{}/start", self.draft_url(draft_id));
        self.execute(self.http.post(url)).await
    }
}
