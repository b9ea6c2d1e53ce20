//! Shared HTTP plumbing for the backend adapters
//!
//! Adapters never retry: a failed request surfaces as a [`BackendError`] and
//! the engine tries again on its next poll cycle.

use std::time::Duration;

use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;

use crate::error::BackendError;

/// Build a client with the per-request timeout applied
pub fn client(timeout: Duration) -> Result<Client, BackendError> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| BackendError::transport("client setup", e))
}

/// Join a base URL and a relative path with exactly one slash
pub fn endpoint(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// Send a request and return the body of a 2xx response
pub async fn send(operation: &'static str, request: RequestBuilder) -> Result<Vec<u8>, BackendError> {
    let response = request
        .send()
        .await
        .map_err(|e| BackendError::transport(operation, e))?;

    let status = response.status();
    let body = response
        .bytes()
        .await
        .map_err(|e| BackendError::transport(operation, e))?
        .to_vec();

    if !status.is_success() {
        return Err(BackendError::Status {
            operation,
            status: status.as_u16(),
            body: String::from_utf8_lossy(&body).into_owned(),
        });
    }
    Ok(body)
}

/// Send a request and decode a 2xx JSON body
pub async fn send_json<T: DeserializeOwned>(
    operation: &'static str,
    request: RequestBuilder,
) -> Result<T, BackendError> {
    let body = send(operation, request).await?;
    serde_json::from_slice(&body).map_err(|e| BackendError::invalid(operation, e.to_string()))
}

/// Send a request and return a 2xx body as text
pub async fn send_text(operation: &'static str, request: RequestBuilder) -> Result<String, BackendError> {
    let body = send(operation, request).await?;
    Ok(String::from_utf8_lossy(&body).into_owned())
}
