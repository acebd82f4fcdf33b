//! Shared REST plumbing: one `reqwest` client and status classification.

use provision::error::{AdapterError, AdapterErrorKind};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub fn client() -> Result<Client, AdapterError> {
    Client::builder()
        .user_agent(concat!("k1/", env!("CARGO_PKG_VERSION")))
        .pool_idle_timeout(Duration::from_secs(90))
        .timeout(Duration::from_secs(60))
        .connect_timeout(Duration::from_secs(10))
        .build()
        .map_err(|e| AdapterError::new(AdapterErrorKind::CommandFailed, format!("http client: {}", e)))
}

/// Map an HTTP status to the adapter taxonomy.
pub fn classify(status: StatusCode) -> AdapterErrorKind {
    match status {
        StatusCode::UNAUTHORIZED => AdapterErrorKind::AuthInvalid,
        StatusCode::FORBIDDEN => AdapterErrorKind::ScopeInsufficient,
        StatusCode::NOT_FOUND => AdapterErrorKind::NotFound,
        StatusCode::CONFLICT | StatusCode::UNPROCESSABLE_ENTITY => AdapterErrorKind::ResourceExists,
        StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => AdapterErrorKind::Transient,
        s if s.is_server_error() => AdapterErrorKind::Transient,
        _ => AdapterErrorKind::CommandFailed,
    }
}

fn transport(what: &str, e: reqwest::Error) -> AdapterError {
    if e.is_timeout() || e.is_connect() || e.is_request() {
        AdapterError::transient(format!("{}: {}", what, e))
    } else {
        AdapterError::new(AdapterErrorKind::CommandFailed, format!("{}: {}", what, e))
    }
}

/// Send and return the response if its status is a success.
pub async fn send(
    request: RequestBuilder,
    what: &str,
    cancel: &CancellationToken,
) -> Result<Response, AdapterError> {
    let response = tokio::select! {
        result = request.send() => result.map_err(|e| transport(what, e))?,
        _ = cancel.cancelled() => return Err(AdapterError::cancelled(what)),
    };
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    tracing::debug!("[Http] {} returned {}: {}", what, status, body);
    Err(AdapterError::new(classify(status), format!("{} returned {}", what, status)).with_stderr(&body))
}

pub async fn json<T: DeserializeOwned>(
    request: RequestBuilder,
    what: &str,
    cancel: &CancellationToken,
) -> Result<T, AdapterError> {
    let response = send(request, what, cancel).await?;
    response.json::<T>().await.map_err(|e| {
        AdapterError::new(AdapterErrorKind::CommandFailed, format!("{}: invalid response: {}", what, e))
    })
}
