//! HTTP client for the direct-message API.
//!
//! Every endpoint answers `{ "data": ... }`. A 403 from any endpoint means
//! the caller is not logged in.

use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;

use dmchat_proto::api::{
    ApiResponse, ConversationInfo, ConversationSummary, HISTORY_PATH, INFO_PATH, Identity,
    LIST_PATH, USER_HEADER, WHOAMI_PATH,
};
use dmchat_proto::message::{ConversationId, Message, Offset};

use crate::history::HistoryFetcher;

/// Request timeout for API calls.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Errors returned by API calls.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The server does not recognize the caller (HTTP 403).
    #[error("not logged in")]
    Unauthorized,

    /// The server answered with an unexpected status.
    #[error("API returned status {status}")]
    Status {
        /// HTTP status code.
        status: u16,
    },

    /// The request failed or the body could not be decoded.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
}

/// Who is logged in.
pub trait IdentityApi: Send + Sync {
    /// Look up the logged-in user.
    fn whoami(&self) -> impl std::future::Future<Output = Result<Identity, ApiError>> + Send;
}

/// Conversation metadata lookups.
pub trait ConversationDirectory: Send + Sync {
    /// Display metadata for one conversation.
    fn conversation_info(
        &self,
        conversation: &ConversationId,
    ) -> impl std::future::Future<Output = Result<ConversationInfo, ApiError>> + Send;

    /// Every conversation the caller takes part in.
    fn list_conversations(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<ConversationSummary>, ApiError>> + Send;
}

/// reqwest-backed client for the direct-message API.
#[derive(Clone)]
pub struct HttpApi {
    base_url: String,
    user: Option<String>,
    http: Client,
}

impl HttpApi {
    /// Create a client for `base_url`.
    ///
    /// `user` is sent in the user header on every request and stands in for
    /// a browser session cookie.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Http`] if the HTTP client cannot be built.
    pub fn new(
        base_url: impl Into<String>,
        user: Option<String>,
        connect_timeout: Duration,
    ) -> Result<Self, ApiError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self {
            base_url: base_url.into(),
            user,
            http,
        })
    }

    fn url(&self, path: &str) -> String {
        let base = self.base_url.trim_end_matches('/');
        let path = path.trim_start_matches('/');
        format!("{base}/{path}")
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, ApiError> {
        let mut request = self.http.get(self.url(path)).query(query);
        if let Some(user) = &self.user {
            request = request.header(USER_HEADER, user);
        }
        let response = request.send().await?;
        match response.status() {
            StatusCode::FORBIDDEN => Err(ApiError::Unauthorized),
            status if !status.is_success() => Err(ApiError::Status {
                status: status.as_u16(),
            }),
            _ => {
                let body: ApiResponse<T> = response.json().await?;
                Ok(body.data)
            }
        }
    }
}

impl HistoryFetcher for HttpApi {
    async fn fetch_page(
        &self,
        conversation: &ConversationId,
        offset: &Offset,
    ) -> Result<Vec<Message>, ApiError> {
        let path = format!("{HISTORY_PATH}/{conversation}");
        let page: Vec<Message> = self
            .get_json(&path, &[("offset", offset.to_string())])
            .await?;
        tracing::debug!(%conversation, %offset, len = page.len(), "fetched history page");
        Ok(page)
    }
}

impl IdentityApi for HttpApi {
    async fn whoami(&self) -> Result<Identity, ApiError> {
        self.get_json(WHOAMI_PATH, &[]).await
    }
}

impl ConversationDirectory for HttpApi {
    async fn conversation_info(
        &self,
        conversation: &ConversationId,
    ) -> Result<ConversationInfo, ApiError> {
        self.get_json(&format!("{INFO_PATH}/{conversation}"), &[])
            .await
    }

    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>, ApiError> {
        self.get_json(LIST_PATH, &[]).await
    }
}
