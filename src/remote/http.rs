//! reqwest-backed marketplace backend.

use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use std::time::Duration;
use url::Url;

use super::{FetchRemote, RemoteError, SubmitReceipt, SubmitRemote};
use crate::queue::PendingOperation;

/// Header carrying the queued operation id on every submit attempt.
pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// HTTP client for the marketplace REST API
///
/// Reads and submits carry their own per-request timeouts; uploads with
/// images legitimately take longer than a listing fetch.
#[derive(Clone)]
pub struct HttpBackend {
  client: Client,
  base_url: Url,
  submit_path: String,
  token: Option<String>,
  fetch_timeout: Duration,
  submit_timeout: Duration,
}

impl HttpBackend {
  /// `timeout` bounds reads and, until [`with_submit_timeout`](Self::with_submit_timeout)
  /// says otherwise, submits.
  pub fn new(base_url: &str, timeout: Duration, token: Option<String>) -> Result<Self> {
    // Url::join drops the last segment unless the base ends with a slash
    let mut base = base_url.to_string();
    if !base.ends_with('/') {
      base.push('/');
    }
    let base_url = Url::parse(&base).map_err(|e| eyre!("Invalid backend url {}: {}", base_url, e))?;

    let client = Client::builder()
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      base_url,
      submit_path: "listings".to_string(),
      token,
      fetch_timeout: timeout,
      submit_timeout: timeout,
    })
  }

  pub fn with_submit_timeout(mut self, timeout: Duration) -> Self {
    self.submit_timeout = timeout;
    self
  }

  /// Endpoint (relative to the base url) that queued payloads are POSTed to.
  pub fn with_submit_path(mut self, path: impl Into<String>) -> Self {
    self.submit_path = path.into();
    self
  }

  fn url(&self, path: &str) -> Result<Url, RemoteError> {
    self
      .base_url
      .join(path.trim_start_matches('/'))
      .map_err(|e| RemoteError::Transport(format!("invalid path {}: {}", path, e)))
  }

  fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
    match &self.token {
      Some(token) => request.bearer_auth(token),
      None => request,
    }
  }

  /// GET `path` and decode the JSON body.
  pub async fn fetch_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, RemoteError> {
    let url = self.url(path)?;
    let response = self
      .authorize(self.client.get(url))
      .timeout(self.fetch_timeout)
      .send()
      .await
      .map_err(|e| map_error(e, self.fetch_timeout))?;

    let response = check_status(response).await?;
    response
      .json::<T>()
      .await
      .map_err(|e| RemoteError::Decode(e.to_string()))
  }

  async fn post_operation(&self, operation: &PendingOperation) -> Result<SubmitReceipt, RemoteError> {
    let url = self.url(&self.submit_path)?;
    let response = self
      .authorize(self.client.post(url))
      .header(IDEMPOTENCY_HEADER, &operation.id)
      .json(&operation.payload)
      .timeout(self.submit_timeout)
      .send()
      .await
      .map_err(|e| map_error(e, self.submit_timeout))?;

    let response = check_status(response).await?;
    response
      .json::<SubmitReceipt>()
      .await
      .map_err(|e| RemoteError::Decode(e.to_string()))
  }

}

fn map_error(e: reqwest::Error, limit: Duration) -> RemoteError {
  if e.is_timeout() {
    RemoteError::Timeout(limit)
  } else if e.is_connect() {
    RemoteError::Offline
  } else if e.is_decode() {
    RemoteError::Decode(e.to_string())
  } else {
    RemoteError::Transport(e.to_string())
  }
}

async fn check_status(response: Response) -> Result<Response, RemoteError> {
  let status = response.status();
  if status.is_success() {
    return Ok(response);
  }

  let message = response.text().await.unwrap_or_default();
  Err(RemoteError::Rejected {
    status: status.as_u16(),
    message,
  })
}

impl FetchRemote for HttpBackend {
  fn fetch<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<serde_json::Value, RemoteError>> {
    self.fetch_json::<serde_json::Value>(path).boxed()
  }
}

impl SubmitRemote for HttpBackend {
  fn submit<'a>(
    &'a self,
    operation: &'a PendingOperation,
  ) -> BoxFuture<'a, Result<SubmitReceipt, RemoteError>> {
    self.post_operation(operation).boxed()
  }
}
