//! Remote state bucket bootstrap over the GCS JSON API.
//!
//! Provisioner plugins call [`GcsBackend::ensure_bucket`] before
//! `terraform init` so the state backend exists. The call is idempotent:
//! the bucket is created only when the lookup reports it absent.

use reqwest::blocking::Client;
use reqwest::StatusCode;
use serde_json::json;
use thiserror::Error;

const DEFAULT_BASE_URL: &str = "https://storage.googleapis.com/storage/v1";

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("network error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("failed to check bucket {bucket}: {status}")]
    Lookup { bucket: String, status: StatusCode },
    #[error("failed to create bucket {bucket}: {status}: {body}")]
    Create {
        bucket: String,
        status: StatusCode,
        body: String,
    },
}

/// What `ensure_bucket` actually did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureOutcome {
    AlreadyExists,
    Created,
}

/// Minimal GCS client for state-backend bootstrap.
pub struct GcsBackend {
    base_url: String,
    client: Client,
    auth_token: Option<String>,
}

impl GcsBackend {
    pub fn new() -> Self {
        Self::with_base_url(DEFAULT_BASE_URL)
    }

    /// Point the client at a different endpoint; tests use this to talk
    /// to a local mock server.
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: Client::new(),
            auth_token: None,
        }
    }

    /// Bearer token for the storage API, when ambient credentials are not
    /// available as a metadata server.
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    /// Create `bucket` under `project_id` unless it already exists.
    pub fn ensure_bucket(
        &self,
        bucket: &str,
        project_id: &str,
    ) -> Result<EnsureOutcome, BackendError> {
        let lookup_url = format!("{}/b/{bucket}", self.base_url);
        let response = self.authorized(self.client.get(&lookup_url)).send()?;

        match response.status() {
            StatusCode::OK => {
                tracing::info!("backend bucket {bucket} exists");
                return Ok(EnsureOutcome::AlreadyExists);
            }
            StatusCode::NOT_FOUND => {}
            status => {
                return Err(BackendError::Lookup {
                    bucket: bucket.to_owned(),
                    status,
                })
            }
        }

        tracing::info!("creating backend bucket {bucket}");
        let create_url = format!("{}/b?project={project_id}", self.base_url);
        let response = self
            .authorized(self.client.post(&create_url))
            .json(&json!({ "name": bucket }))
            .send()?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().unwrap_or_default();
            return Err(BackendError::Create {
                bucket: bucket.to_owned(),
                status,
                body,
            });
        }

        tracing::info!("backend bucket {bucket} created");
        Ok(EnsureOutcome::Created)
    }

    fn authorized(
        &self,
        request: reqwest::blocking::RequestBuilder,
    ) -> reqwest::blocking::RequestBuilder {
        match &self.auth_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

impl Default for GcsBackend {
    fn default() -> Self {
        Self::new()
    }
}
