//! Token acquisition.
//!
//! The consent step happens in the user's browser. Since nothing listens on
//! the redirect URI, the user copies the redirect URL from the browser's
//! address bar and pastes it back; [`parse_authorization_input`] accepts
//! that URL, the older `code#state` form, or a bare code.

mod client;

pub use client::OAuthClient;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Tokens are treated as expired this long before their stated expiry.
const EXPIRY_BUFFER_MS: i64 = 5 * 60 * 1000;

const PKCE_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

#[derive(Debug, Error)]
pub enum OAuthError {
    #[error("Invalid OAuth URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Authorization code not found. Paste the full URL from your browser's address bar.")]
    MissingCode,

    #[error("OAuth state mismatch: the pasted URL belongs to a different login attempt")]
    StateMismatch,

    #[error("No OAuth application configured. Run `token-vault login --client-id ...` first.")]
    NotConfigured,

    #[error("No refresh token stored; run `token-vault rotate` to obtain a new token")]
    NoRefreshToken,

    #[error("Token rejected by provider (invalid_grant). Run `token-vault rotate` to re-authenticate.")]
    InvalidGrant,

    #[error("Token endpoint returned {status}: {body}")]
    Endpoint { status: u16, body: String },

    #[error("Failed to reach token endpoint: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Malformed token response: {0}")]
    Malformed(String),
}

/// OAuth application registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthApp {
    pub client_id: String,
    /// Installed-app secret; not confidential for desktop flows.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    pub authorize_url: String,
    pub token_url: String,
    pub redirect_uri: String,
    #[serde(default)]
    pub scopes: Vec<String>,
}

impl OAuthApp {
    /// Build the browser consent URL for a PKCE authorization-code flow.
    pub fn authorize_url(&self, challenge: &str, state: &str) -> Result<String, OAuthError> {
        let mut url = url::Url::parse(&self.authorize_url)?;

        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.client_id)
            .append_pair("redirect_uri", &self.redirect_uri)
            .append_pair("scope", &self.scopes.join(" "))
            .append_pair("code_challenge", challenge)
            .append_pair("code_challenge_method", "S256")
            .append_pair("state", state)
            .append_pair("access_type", "offline");

        Ok(url.to_string())
    }
}

/// PKCE verifier/challenge pair plus the state issued with it.
#[derive(Debug, Clone)]
pub struct PendingAuthorization {
    pub verifier: String,
    pub challenge: String,
    pub state: String,
}

impl PendingAuthorization {
    pub fn new() -> Self {
        let (verifier, challenge) = generate_pkce();
        Self {
            verifier,
            challenge,
            state: generate_state(),
        }
    }
}

impl Default for PendingAuthorization {
    fn default() -> Self {
        Self::new()
    }
}

/// The credential artifact in its raw, in-memory form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// Unix millis; `None` means the provider gave no expiry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
    /// Unix millis.
    pub obtained_at: i64,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl Credential {
    /// Build a credential from a token-endpoint JSON response received at `now_ms`.
    pub fn from_token_response(
        data: &serde_json::Value,
        now_ms: i64,
    ) -> Result<Self, OAuthError> {
        let access_token = data["access_token"]
            .as_str()
            .ok_or_else(|| OAuthError::Malformed("no access_token in response".to_string()))?;

        Ok(Self {
            access_token: access_token.to_string(),
            refresh_token: data["refresh_token"].as_str().map(str::to_string),
            token_type: data["token_type"]
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(default_token_type),
            scope: data["scope"].as_str().map(str::to_string),
            expires_at: data["expires_in"]
                .as_i64()
                .map(|secs| now_ms + secs * 1000),
            obtained_at: now_ms,
        })
    }

    /// True once `now_ms` is within the expiry buffer of `expires_at`.
    pub fn is_expired_at(&self, now_ms: i64) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at < now_ms + EXPIRY_BUFFER_MS,
            None => false,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(chrono::Utc::now().timestamp_millis())
    }
}

/// Generate PKCE code verifier and challenge.
pub fn generate_pkce() -> (String, String) {
    let mut rng = rand::thread_rng();
    let verifier: String = (0..43)
        .map(|_| PKCE_CHARSET[rng.gen_range(0..PKCE_CHARSET.len())] as char)
        .collect();

    (verifier.clone(), pkce_challenge(&verifier))
}

fn pkce_challenge(verifier: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

/// Generate a random OAuth state value.
pub fn generate_state() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill(&mut bytes);
    hex::encode(bytes)
}

/// Split pasted authorization input into `(code, state)`.
pub fn parse_authorization_input(input: &str) -> Result<(String, Option<String>), OAuthError> {
    let input = input.trim();
    let (code, state) = if let Ok(url) = url::Url::parse(input) {
        let code = url
            .query_pairs()
            .find(|(k, _)| k == "code")
            .map(|(_, v)| v.to_string());
        let state = url
            .query_pairs()
            .find(|(k, _)| k == "state")
            .map(|(_, v)| v.to_string());
        (code.unwrap_or_default(), state)
    } else if let Some((code, state)) = input.split_once('#') {
        (code.to_string(), Some(state.to_string()))
    } else {
        (input.to_string(), None)
    };

    if code.is_empty() {
        return Err(OAuthError::MissingCode);
    }
    Ok((code, state))
}
