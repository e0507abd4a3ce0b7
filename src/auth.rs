//! Token provider capability.
//!
//! Image builds need a fresh short-lived credential per clone. The
//! mechanism that mints them is external; drydock only consumes this
//! capability and never caches what it returns.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use crate::config::AuthConfig;

/// Source of short-lived clone credentials.
///
/// Called once per clone. Implementations must not cache tokens on
/// behalf of callers; drydock treats every fetch as single-use.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Fetches a fresh credential.
    async fn fetch(&self) -> Result<String>;
}

/// Reads the token from an environment variable on every fetch.
///
/// Suitable when an external agent keeps the variable current.
pub struct EnvTokenProvider {
    var: String,
}

impl EnvTokenProvider {
    /// Creates a provider reading from `var`.
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

#[async_trait]
impl TokenProvider for EnvTokenProvider {
    async fn fetch(&self) -> Result<String> {
        let token = std::env::var(&self.var)
            .with_context(|| format!("Token variable {} is not set", self.var))?;
        if token.is_empty() {
            anyhow::bail!("Token variable {} is empty", self.var);
        }
        Ok(token)
    }
}

/// Fetches tokens from an HTTP endpoint returning `{"token": "..."}`.
///
/// Matches the GitHub App installation-token shape without binding
/// drydock to GitHub's signing scheme; the endpoint owns that.
pub struct EndpointTokenProvider {
    client: reqwest::Client,
    url: String,
    bearer: Option<String>,
}

impl EndpointTokenProvider {
    /// Creates a provider POSTing to `url`, optionally with a bearer credential.
    pub fn new(url: impl Into<String>, bearer: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            bearer,
        }
    }
}

#[async_trait]
impl TokenProvider for EndpointTokenProvider {
    async fn fetch(&self) -> Result<String> {
        debug!("Fetching clone token from {}", self.url);

        let mut request = self.client.post(&self.url);
        if let Some(ref bearer) = self.bearer {
            request = request.bearer_auth(bearer);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("Token endpoint request failed: {}", self.url))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Token endpoint returned {status}: {body}");
        }

        let payload: serde_json::Value = response
            .json()
            .await
            .context("Token endpoint returned invalid JSON")?;

        payload
            .get("token")
            .and_then(|t| t.as_str())
            .map(ToString::to_string)
            .context("Token endpoint response has no \"token\" field")
    }
}

/// Fixed token, for tests.
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    /// Creates a provider that always returns `token`.
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn fetch(&self) -> Result<String> {
        Ok(self.token.clone())
    }
}

/// Builds the configured provider.
pub fn provider_from_config(auth: &AuthConfig) -> Result<Arc<dyn TokenProvider>> {
    match auth.provider.as_str() {
        "env" => Ok(Arc::new(EnvTokenProvider::new(auth.token_env.clone()))),
        "endpoint" => {
            let url = auth
                .endpoint_url
                .clone()
                .context("auth.endpoint_url is required when auth.provider = \"endpoint\"")?;
            let bearer = match auth.bearer_env {
                Some(ref var) => Some(
                    std::env::var(var)
                        .with_context(|| format!("Bearer variable {var} is not set"))?,
                ),
                None => None,
            };
            Ok(Arc::new(EndpointTokenProvider::new(url, bearer)))
        }
        other => anyhow::bail!("Unknown auth provider: {other} (expected \"env\" or \"endpoint\")"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_provider() {
        let provider = StaticTokenProvider::new("ghs_test");
        assert_eq!(provider.fetch().await.unwrap(), "ghs_test");
    }

    #[tokio::test]
    async fn test_env_provider_missing_var() {
        let provider = EnvTokenProvider::new("DRYDOCK_TEST_TOKEN_DOES_NOT_EXIST");
        let err = provider.fetch().await.unwrap_err();
        assert!(err.to_string().contains("DRYDOCK_TEST_TOKEN_DOES_NOT_EXIST"));
    }

    #[test]
    fn test_provider_from_config_env() {
        let auth = AuthConfig::default();
        assert!(provider_from_config(&auth).is_ok());
    }

    #[test]
    fn test_provider_from_config_endpoint_requires_url() {
        let auth = AuthConfig {
            provider: "endpoint".to_string(),
            endpoint_url: None,
            ..AuthConfig::default()
        };
        assert!(provider_from_config(&auth).is_err());
    }

    #[test]
    fn test_provider_from_config_unknown() {
        let auth = AuthConfig {
            provider: "vault".to_string(),
            ..AuthConfig::default()
        };
        let Err(err) = provider_from_config(&auth) else {
            panic!("unknown provider was accepted");
        };
        assert!(err.to_string().contains("Unknown auth provider"));
    }
}
