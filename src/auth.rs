//! WebSocket auth token bootstrap
//!
//! Private feeds need a short-lived token obtained over REST before the
//! subscription is sent. The token is not refreshed here; callers fetch a new
//! one and resubscribe when it expires.

use chrono::Utc;
use reqwest::header::CONTENT_TYPE;
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::{FeedError, Result};

const TOKEN_PATH: &str = "/0/private/GetWebSocketsToken";

/// Token passed on private-feed subscriptions
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AuthToken {
    pub token: String,
    /// Lifetime in seconds if unused
    pub expires: u64,
}

impl AuthToken {
    pub fn new(token: impl Into<String>, expires: u64) -> Self {
        Self {
            token: token.into(),
            expires,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.token
    }
}

/// Produces the authentication headers for a private REST call
#[cfg_attr(test, mockall::automock)]
pub trait RequestSigner: Send + Sync {
    fn sign(&self, path: &str, nonce: u64, body: &str) -> Result<Vec<(String, String)>>;
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    error: Vec<String>,
    result: Option<T>,
}

/// Fetch a WebSocket token from the REST API
pub async fn fetch_ws_token(
    http: &reqwest::Client,
    rest_endpoint: &str,
    signer: &dyn RequestSigner,
) -> Result<AuthToken> {
    let nonce = Utc::now().timestamp_millis().max(0) as u64;
    let body = format!("nonce={}", nonce);
    let url = format!("{}{}", rest_endpoint.trim_end_matches('/'), TOKEN_PATH);

    let mut request = http
        .post(&url)
        .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(body.clone());
    for (name, value) in signer.sign(TOKEN_PATH, nonce, &body)? {
        request = request.header(name, value);
    }

    debug!(url = %url, nonce, "Requesting WebSocket token");
    let response = request.send().await?;
    let status = response.status();
    let text = response.text().await?;

    let token = parse_token_response(&text).map_err(|e| match e {
        FeedError::RestApi(reason) if !status.is_success() => {
            FeedError::RestApi(format!("HTTP {}: {}", status, reason))
        }
        other => other,
    })?;

    info!(expires = token.expires, "WebSocket token obtained");
    Ok(token)
}

/// Parse the `{"error": [...], "result": {...}}` envelope
pub fn parse_token_response(body: &str) -> Result<AuthToken> {
    let envelope: Envelope<AuthToken> = serde_json::from_str(body)
        .map_err(|e| FeedError::RestApi(format!("Invalid token response: {}", e)))?;

    if !envelope.error.is_empty() {
        return Err(FeedError::RestApi(envelope.error.join(", ")));
    }

    envelope
        .result
        .ok_or_else(|| FeedError::RestApi("Token response without result".to_string()))
}
