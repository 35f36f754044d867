//! OAuth token endpoints for Google accounts.
use reqwest::{Client, StatusCode};
use serde::Deserialize;

use crate::provider::{ProviderError, ProviderResult};

pub const CALENDAR_SCOPE: &str = "https://www.googleapis.com/auth/calendar.events \
    https://www.googleapis.com/auth/calendar.readonly";

#[derive(Debug, Deserialize)]
pub struct OAuthToken {
    pub access_token: String,
    pub expires_in: Option<u64>,
    pub refresh_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OAuthErrorBody {
    error: Option<String>,
}

async fn token_request(client: &Client, url: String, form: &[(&str, &str)]) -> ProviderResult<OAuthToken> {
    let resp = client
        .post(url)
        .form(form)
        .send()
        .await
        .map_err(|e| ProviderError::Transient(e.to_string()))?;

    let status = resp.status();
    if status.is_success() {
        return resp
            .json::<OAuthToken>()
            .await
            .map_err(|e| ProviderError::Permanent(format!("Malformed token response: {}", e)));
    }

    let body = resp.text().await.unwrap_or_default();
    let reason = serde_json::from_str::<OAuthErrorBody>(&body)
        .ok()
        .and_then(|b| b.error)
        .unwrap_or_else(|| body.clone());
    match status {
        StatusCode::TOO_MANY_REQUESTS => Err(ProviderError::RateLimited { retry_after: None }),
        s if s.is_server_error() => Err(ProviderError::Transient(format!("{}: {}", s, reason))),
        // invalid_grant means the refresh token was revoked; retrying won't help
        s => Err(ProviderError::Permanent(format!("Token request rejected ({}): {}", s, reason))),
    }
}

pub async fn refresh_access_token(
    client: &Client,
    oauth_url: &str,
    client_id: &str,
    client_secret: &str,
    refresh_token: &str,
) -> ProviderResult<OAuthToken> {
    token_request(
        client,
        format!("{}/token", oauth_url.trim_end_matches('/')),
        &[
            ("client_id", client_id),
            ("client_secret", client_secret),
            ("refresh_token", refresh_token),
            ("grant_type", "refresh_token"),
        ],
    )
    .await
}

pub async fn exchange_code_for_token(
    client: &Client,
    oauth_url: &str,
    client_id: &str,
    client_secret: &str,
    code: &str,
    redirect_uri: &str,
) -> ProviderResult<OAuthToken> {
    token_request(
        client,
        format!("{}/token", oauth_url.trim_end_matches('/')),
        &[
            ("client_id", client_id),
            ("client_secret", client_secret),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("grant_type", "authorization_code"),
        ],
    )
    .await
}

pub fn authorization_url(client_id: &str, redirect_uri: &str) -> String {
    format!(
        "https://accounts.google.com/o/oauth2/v2/auth?client_id={}&redirect_uri={}&response_type=code&scope={}&access_type=offline&prompt=consent",
        urlencoding::encode(client_id),
        urlencoding::encode(redirect_uri),
        urlencoding::encode(CALENDAR_SCOPE)
    )
}
