//! Registration of decryption keys with the CI provider.

use async_trait::async_trait;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error(
        "CI provider does not know repository {0:?}. If the repository was renamed or \
         transferred, the cached slug is stale: run `token-vault slug fix`."
    )]
    RepositoryNotFound(String),

    #[error("CI provider rejected the API token (status {0})")]
    Unauthorized(u16),

    #[error("CI provider returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("Failed to reach CI provider: {0}")]
    Http(#[from] reqwest::Error),

    #[error(
        "CI variables for {slug} are out of sync: {registered} was updated but {missing} \
         was not ({source}). CI cannot decrypt until you re-run `token-vault encrypt`."
    )]
    Inconsistent {
        slug: String,
        registered: String,
        missing: String,
        #[source]
        source: Box<RegistryError>,
    },
}

/// A store of private CI environment variables for one repository.
#[async_trait]
pub trait KeyRegistry: Send + Sync {
    /// Read-only probe that `slug` exists and the credentials may list its variables.
    async fn verify(&self, slug: &str) -> Result<(), RegistryError>;

    /// Create or overwrite a private variable `name` for `slug`.
    async fn register(&self, slug: &str, name: &str, value: &str) -> Result<(), RegistryError>;
}

/// Travis CI API v3 env-var registry.
#[derive(Debug, Clone)]
pub struct TravisRegistry {
    http: reqwest::Client,
    api_url: String,
    token: String,
}

impl TravisRegistry {
    pub fn new(api_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_url: api_url.into(),
            token: token.into(),
        }
    }

    fn env_vars_url(&self, slug: &str) -> String {
        format!(
            "{}/repo/{}/env_vars",
            self.api_url.trim_end_matches('/'),
            url::form_urlencoded::byte_serialize(slug.as_bytes()).collect::<String>()
        )
    }

    fn env_var_url(&self, slug: &str, id: &str) -> String {
        format!(
            "{}/repo/{}/env_var/{}",
            self.api_url.trim_end_matches('/'),
            url::form_urlencoded::byte_serialize(slug.as_bytes()).collect::<String>(),
            id
        )
    }

    fn request(&self, method: reqwest::Method, url: String) -> reqwest::RequestBuilder {
        self.http
            .request(method, url)
            .header("Travis-API-Version", "3")
            .header("User-Agent", concat!("token-vault/", env!("CARGO_PKG_VERSION")))
            .header("Authorization", format!("token {}", self.token))
    }

    /// Id of an existing variable called `name`, if any.
    async fn find_existing(&self, slug: &str, name: &str) -> Result<Option<String>, RegistryError> {
        let response = self
            .request(reqwest::Method::GET, self.env_vars_url(slug))
            .send()
            .await?;
        let body: serde_json::Value = check(slug, response).await?.json().await?;
        Ok(existing_id(&body, name))
    }
}

fn existing_id(body: &serde_json::Value, name: &str) -> Option<String> {
    body["env_vars"].as_array()?.iter().find_map(|var| {
        (var["name"].as_str() == Some(name))
            .then(|| var["id"].as_str().map(str::to_string))
            .flatten()
    })
}

async fn check(slug: &str, response: reqwest::Response) -> Result<reqwest::Response, RegistryError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    tracing::error!("CI API request failed with status {}: {}", status, body);
    Err(classify(slug, status, body))
}

fn classify(slug: &str, status: reqwest::StatusCode, body: String) -> RegistryError {
    match status {
        reqwest::StatusCode::NOT_FOUND => RegistryError::RepositoryNotFound(slug.to_string()),
        reqwest::StatusCode::UNAUTHORIZED | reqwest::StatusCode::FORBIDDEN => {
            RegistryError::Unauthorized(status.as_u16())
        }
        _ => RegistryError::Api {
            status: status.as_u16(),
            body,
        },
    }
}

#[async_trait]
impl KeyRegistry for TravisRegistry {
    async fn verify(&self, slug: &str) -> Result<(), RegistryError> {
        let response = self
            .request(reqwest::Method::GET, self.env_vars_url(slug))
            .send()
            .await?;
        check(slug, response).await?;
        tracing::debug!("CI provider accepted access to {}", slug);
        Ok(())
    }

    async fn register(&self, slug: &str, name: &str, value: &str) -> Result<(), RegistryError> {
        let body = json!({
            "env_var.name": name,
            "env_var.value": value,
            "env_var.public": false,
        });

        let request = match self.find_existing(slug, name).await? {
            Some(id) => {
                tracing::info!("Updating CI variable {} for {}", name, slug);
                self.request(reqwest::Method::PATCH, self.env_var_url(slug, &id))
            }
            None => {
                tracing::info!("Creating CI variable {} for {}", name, slug);
                self.request(reqwest::Method::POST, self.env_vars_url(slug))
            }
        };

        check(slug, request.json(&body).send().await?).await?;
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls_encode_the_slug() {
        let registry = TravisRegistry::new("https://api.travis-ci.com/", "t");
        assert_eq!(
            registry.env_vars_url("octo/widgets"),
            "https://api.travis-ci.com/repo/octo%2Fwidgets/env_vars"
        );
        assert_eq!(
            registry.env_var_url("octo/widgets", "abc-123"),
            "https://api.travis-ci.com/repo/octo%2Fwidgets/env_var/abc-123"
        );
    }

    #[test]
    fn not_found_points_at_stale_slug() {
        let err = classify("old/widgets", reqwest::StatusCode::NOT_FOUND, String::new());
        assert!(matches!(&err, RegistryError::RepositoryNotFound(s) if s == "old/widgets"));
        assert!(err.to_string().contains("slug fix"));

        assert!(matches!(
            classify("a/b", reqwest::StatusCode::FORBIDDEN, String::new()),
            RegistryError::Unauthorized(403)
        ));
        assert!(matches!(
            classify("a/b", reqwest::StatusCode::BAD_GATEWAY, "oops".to_string()),
            RegistryError::Api { status: 502, .. }
        ));
    }

    #[test]
    fn existing_variable_is_found_by_name() {
        let body = json!({
            "env_vars": [
                { "id": "1", "name": "OTHER" },
                { "id": "2", "name": "encrypted_abc_key" }
            ]
        });
        assert_eq!(existing_id(&body, "encrypted_abc_key").as_deref(), Some("2"));
        assert_eq!(existing_id(&body, "encrypted_abc_iv"), None);
        assert_eq!(existing_id(&json!({}), "x"), None);
    }
}
