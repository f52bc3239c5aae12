//! HTTP client for the remote system of record.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use url::Url;

use txqueue_common::{Error, Result};
use txqueue_sync::{RemoteEndpoint, SubmitResponse, Transaction};

/// Posts each transaction as JSON to a fixed URL.
///
/// A 2xx body is the `SubmitResponse`. 409 means the remote already has the
/// transaction and 400/422 mean it refused the payload. Everything else,
/// including timeouts and connection failures, is a transport error.
pub struct HttpEndpoint {
    http: Client,
    url: Url,
}

impl HttpEndpoint {
    /// Create a client for `url` with a per-request `timeout`.
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let url = Url::parse(url)
            .map_err(|e| Error::InvalidInput(format!("Invalid endpoint URL '{}': {}", url, e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::InvalidInput(format!(
                "Endpoint URL must be http or https, got '{}'",
                url.scheme()
            )));
        }

        let http = Client::builder()
            .user_agent(concat!("txqueue/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { http, url })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

/// Map a non-2xx answer to a submission outcome.
fn classify_rejection(status: StatusCode, body: String) -> Result<SubmitResponse> {
    let message = if body.trim().is_empty() {
        status.to_string()
    } else {
        body
    };

    match status {
        StatusCode::CONFLICT => Ok(SubmitResponse::duplicate(message)),
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
            Ok(SubmitResponse::invalid(message))
        }
        _ => Err(Error::Network(format!("API error: {} - {}", status, message))),
    }
}

#[async_trait]
impl RemoteEndpoint for HttpEndpoint {
    async fn submit(&self, transaction: &Transaction) -> Result<SubmitResponse> {
        let response = self
            .http
            .post(self.url.clone())
            .header("Idempotency-Key", transaction.id.as_str())
            .json(transaction)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::Timeout(format!("Submitting {}: {}", transaction.id, e))
                } else {
                    Error::Network(format!("Failed to submit {}: {}", transaction.id, e))
                }
            })?;

        let status = response.status();
        if status.is_success() {
            response
                .json()
                .await
                .map_err(|e| Error::Network(format!("Failed to parse response: {}", e)))
        } else {
            let body = response.text().await.unwrap_or_default();
            classify_rejection(status, body)
        }
    }
}
