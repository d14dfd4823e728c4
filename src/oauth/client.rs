use super::{parse_authorization_input, Credential, OAuthApp, OAuthError, PendingAuthorization};

/// Talks to an OAuth token endpoint.
#[derive(Debug, Clone)]
pub struct OAuthClient {
    http: reqwest::Client,
    app: OAuthApp,
}

impl OAuthClient {
    pub fn new(app: OAuthApp) -> Self {
        Self {
            http: reqwest::Client::new(),
            app,
        }
    }

    pub fn app(&self) -> &OAuthApp {
        &self.app
    }

    /// Exchange pasted authorization input for a credential.
    ///
    /// When the pasted input carries a state, it must equal the state issued
    /// with `pending`.
    pub async fn exchange_code(
        &self,
        pending: &PendingAuthorization,
        input: &str,
    ) -> Result<Credential, OAuthError> {
        let (code, state) = parse_authorization_input(input)?;
        if let Some(state) = state {
            if state != pending.state {
                return Err(OAuthError::StateMismatch);
            }
        }

        let form = authorization_code_form(&self.app, code, &pending.verifier);

        tracing::info!("Exchanging authorization code at {}", self.app.token_url);
        let data = self.post_form(&form).await?;
        Credential::from_token_response(&data, chrono::Utc::now().timestamp_millis())
    }

    /// Refresh `credential`, keeping its refresh token if the provider does
    /// not issue a new one.
    pub async fn refresh(&self, credential: &Credential) -> Result<Credential, OAuthError> {
        let refresh_token = credential
            .refresh_token
            .as_deref()
            .ok_or(OAuthError::NoRefreshToken)?;

        let form = refresh_form(&self.app, refresh_token);

        tracing::info!("Refreshing OAuth token");
        let data = self.post_form(&form).await?;
        let refreshed =
            Credential::from_token_response(&data, chrono::Utc::now().timestamp_millis())?;
        Ok(merge_refreshed(credential, refreshed))
    }

    async fn post_form(
        &self,
        form: &[(&str, String)],
    ) -> Result<serde_json::Value, OAuthError> {
        let response = self
            .http
            .post(&self.app.token_url)
            .header("Accept", "application/json")
            .form(form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!("Token endpoint failed with status {}: {}", status, body);
            return Err(classify_failure(status, body));
        }

        response
            .json()
            .await
            .map_err(|e| OAuthError::Malformed(e.to_string()))
    }
}

fn with_client_auth(app: &OAuthApp, mut form: Vec<(&'static str, String)>) -> Vec<(&'static str, String)> {
    form.push(("client_id", app.client_id.clone()));
    if let Some(secret) = &app.client_secret {
        form.push(("client_secret", secret.clone()));
    }
    form
}

fn authorization_code_form(
    app: &OAuthApp,
    code: String,
    verifier: &str,
) -> Vec<(&'static str, String)> {
    with_client_auth(
        app,
        vec![
            ("grant_type", "authorization_code".to_string()),
            ("code", code),
            ("redirect_uri", app.redirect_uri.clone()),
            ("code_verifier", verifier.to_string()),
        ],
    )
}

fn refresh_form(app: &OAuthApp, refresh_token: &str) -> Vec<(&'static str, String)> {
    with_client_auth(
        app,
        vec![
            ("grant_type", "refresh_token".to_string()),
            ("refresh_token", refresh_token.to_string()),
        ],
    )
}

/// Providers may omit the refresh token and scope from a refresh response;
/// both carry over from the previous credential.
fn merge_refreshed(previous: &Credential, mut refreshed: Credential) -> Credential {
    if refreshed.refresh_token.is_none() {
        refreshed.refresh_token = previous.refresh_token.clone();
    }
    if refreshed.scope.is_none() {
        refreshed.scope = previous.scope.clone();
    }
    refreshed
}

fn classify_failure(status: reqwest::StatusCode, body: String) -> OAuthError {
    if (status == reqwest::StatusCode::BAD_REQUEST || status == reqwest::StatusCode::UNAUTHORIZED)
        && body.to_lowercase().contains("invalid_grant")
    {
        return OAuthError::InvalidGrant;
    }
    OAuthError::Endpoint {
        status: status.as_u16(),
        body,
    }
}
