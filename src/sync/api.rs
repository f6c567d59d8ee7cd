//! Remote Store Client - HTTP communication with the Eunio backend
//!
//! Handles document push/pull against the remote preference store:
//! - Bearer-token authentication (token cached in memory)
//! - 404 on pull means "no remote document yet", not an error
//! - Every failure is classified retryable or fatal in one place
//!
//! The engine consumes the narrow [`RemoteStore`] trait; [`HttpRemoteStore`]
//! is the production implementation.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::{PreferenceError, SyncFailureReason, SyncOperation};
use crate::models::PreferenceDocument;

const DEFAULT_API_BASE_URL: &str = "https://api.eunio.app/v1";

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    /// The remote store could not be reached at all
    #[error("no connectivity: {0}")]
    NoConnectivity(String),

    /// The server answered and refused the document
    #[error("request rejected by server: {0}")]
    Rejected(String),

    /// Authentication was rejected; retrying cannot help
    #[error("authentication rejected by server")]
    Unauthorized,

    #[error("rate limit exceeded")]
    RateLimited,

    #[error("server error: {0}")]
    Server(String),

    #[error("invalid response from server")]
    InvalidResponse,
}

impl RemoteError {
    /// Whether the sync coordinator should back off and retry
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RemoteError::NoConnectivity(_) | RemoteError::RateLimited | RemoteError::Server(_)
        )
    }

    /// The user-presentable failure category
    pub fn failure_reason(&self) -> SyncFailureReason {
        match self {
            RemoteError::NoConnectivity(_) => SyncFailureReason::NoConnectivity,
            _ => SyncFailureReason::RemoteRejected,
        }
    }

    pub fn into_preference_error(self, operation: SyncOperation) -> PreferenceError {
        PreferenceError::Sync {
            operation,
            reason: self.failure_reason(),
            retryable: self.is_retryable(),
            message: self.to_string(),
        }
    }
}

// ============================================================================
// Remote Store Interface
// ============================================================================

/// Narrow interface to the remote preference document store
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Upload the document; overwrites the remote copy for this user
    async fn push_document(&self, doc: &PreferenceDocument) -> Result<(), RemoteError>;

    /// Fetch the remote document; `None` when the user has never synced
    async fn pull_document(&self, user_id: &str) -> Result<Option<PreferenceDocument>, RemoteError>;
}

// ============================================================================
// HTTP Client
// ============================================================================

/// HTTP client for the Eunio preference store
pub struct HttpRemoteStore {
    client: Client,
    base_url: String,
    /// Bearer token (cached in memory)
    access_token: Arc<RwLock<Option<String>>>,
}

impl HttpRemoteStore {
    /// Create a client against the production backend
    pub fn new() -> Self {
        Self::with_base_url(DEFAULT_API_BASE_URL)
    }

    /// Create a client against a custom backend (used by tests)
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()
                .expect("Failed to create HTTP client"),
            base_url: base_url.into(),
            access_token: Arc::new(RwLock::new(None)),
        }
    }

    /// Set access token (after login)
    pub async fn set_token(&self, token: String) {
        let mut guard = self.access_token.write().await;
        *guard = Some(token);
    }

    /// Clear token (logout)
    pub async fn clear_token(&self) {
        let mut guard = self.access_token.write().await;
        *guard = None;
    }

    async fn bearer(&self) -> Result<String, RemoteError> {
        self.access_token
            .read()
            .await
            .clone()
            .ok_or(RemoteError::Unauthorized)
    }
}

impl Default for HttpRemoteStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    async fn push_document(&self, doc: &PreferenceDocument) -> Result<(), RemoteError> {
        let token = self.bearer().await?;

        let response = self
            .client
            .put(format!("{}/preferences/{}", self.base_url, doc.user_id))
            .bearer_auth(token)
            .json(doc)
            .send()
            .await
            .map_err(map_transport_error)?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(handle_error(response).await)
        }
    }

    async fn pull_document(
        &self,
        user_id: &str,
    ) -> Result<Option<PreferenceDocument>, RemoteError> {
        let token = self.bearer().await?;

        let response = self
            .client
            .get(format!("{}/preferences/{}", self.base_url, user_id))
            .bearer_auth(token)
            .send()
            .await
            .map_err(map_transport_error)?;

        // 404 means the user has never pushed (first sync)
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        if !response.status().is_success() {
            return Err(handle_error(response).await);
        }

        let doc = response
            .json::<PreferenceDocument>()
            .await
            .map_err(|_| RemoteError::InvalidResponse)?;
        Ok(Some(doc))
    }
}

// ============================================================================
// Error Mapping
// ============================================================================

/// Classify transport-level reqwest failures
fn map_transport_error(err: reqwest::Error) -> RemoteError {
    if err.is_connect() || err.is_timeout() || err.is_request() {
        RemoteError::NoConnectivity(err.to_string())
    } else {
        RemoteError::InvalidResponse
    }
}

/// Convert an error response to RemoteError
async fn handle_error(response: reqwest::Response) -> RemoteError {
    let status = response.status();

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => RemoteError::Unauthorized,
        StatusCode::TOO_MANY_REQUESTS => RemoteError::RateLimited,
        s if s.is_server_error() => {
            let msg = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            RemoteError::Server(msg)
        }
        _ => {
            let msg = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            RemoteError::Rejected(format!("{}: {}", status, msg))
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
