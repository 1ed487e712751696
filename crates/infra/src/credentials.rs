//! Short-lived credentials for the queue backend.
//!
//! When the backend authenticates with a cloud-managed identity, tokens expire
//! after a bounded lifetime and the queue manager rotates connections before
//! that happens. Providers only fetch tokens; the rotation policy lives in the
//! manager.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

/// An access token plus its absolute expiry.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    token: String,
    expires_at: DateTime<Utc>,
}

impl Credential {
    pub fn new(token: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            token: token.into(),
            expires_at,
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Remaining lifetime; zero once expired.
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at - now).to_std().unwrap_or(Duration::ZERO)
    }
}

impl core::fmt::Debug for Credential {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("identity endpoint request failed: {0}")]
    Request(String),

    #[error("identity endpoint returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed token response: {0}")]
    Malformed(String),

    #[error("no credential available: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn get_token(&self) -> Result<Credential, CredentialError>;
}

/// Always hands out the same credential. Useful for password-style auth
/// where the "token" does not expire in practice.
#[derive(Debug, Clone)]
pub struct StaticCredentialProvider {
    credential: Credential,
}

impl StaticCredentialProvider {
    pub fn new(credential: Credential) -> Self {
        Self { credential }
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentialProvider {
    async fn get_token(&self) -> Result<Credential, CredentialError> {
        Ok(self.credential.clone())
    }
}

pub const IMDS_TOKEN_ENDPOINT: &str = "http://169.254.169.254/metadata/identity/oauth2/token";
const IMDS_API_VERSION: &str = "2018-02-01";

#[derive(Debug, Deserialize)]
struct ImdsTokenResponse {
    access_token: String,
    /// Unix seconds, sent as a string.
    expires_on: String,
}

/// Fetches managed-identity tokens from the instance metadata service.
#[derive(Debug, Clone)]
pub struct ImdsCredentialProvider {
    client: reqwest::Client,
    endpoint: String,
    resource: String,
    client_id: Option<String>,
}

impl ImdsCredentialProvider {
    pub fn new(resource: impl Into<String>) -> Result<Self, CredentialError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| CredentialError::Request(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: IMDS_TOKEN_ENDPOINT.to_owned(),
            resource: resource.into(),
            client_id: None,
        })
    }

    /// Select a user-assigned identity.
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

#[async_trait]
impl CredentialProvider for ImdsCredentialProvider {
    async fn get_token(&self) -> Result<Credential, CredentialError> {
        let mut query = vec![
            ("api-version", IMDS_API_VERSION),
            ("resource", self.resource.as_str()),
        ];
        if let Some(client_id) = &self.client_id {
            query.push(("client_id", client_id.as_str()));
        }

        let response = self
            .client
            .get(&self.endpoint)
            .header("Metadata", "true")
            .query(&query)
            .send()
            .await
            .map_err(|e| CredentialError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CredentialError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body: ImdsTokenResponse = response
            .json()
            .await
            .map_err(|e| CredentialError::Malformed(e.to_string()))?;
        let credential = parse_token_response(body)?;
        debug!(expires_at = %credential.expires_at(), "acquired managed identity token");
        Ok(credential)
    }
}

fn parse_token_response(body: ImdsTokenResponse) -> Result<Credential, CredentialError> {
    let seconds: i64 = body
        .expires_on
        .trim()
        .parse()
        .map_err(|_| CredentialError::Malformed(format!("expires_on: {}", body.expires_on)))?;
    let expires_at = Utc
        .timestamp_opt(seconds, 0)
        .single()
        .ok_or_else(|| CredentialError::Malformed(format!("expires_on out of range: {seconds}")))?;
    Ok(Credential::new(body.access_token, expires_at))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_output_redacts_the_token() {
        let credential = Credential::new("secret-token", Utc::now());
        let printed = format!("{credential:?}");
        assert!(!printed.contains("secret-token"));
        assert!(printed.contains("redacted"));
    }

    #[test]
    fn remaining_saturates_at_zero() {
        let credential = Credential::new("t", Utc::now() - chrono::Duration::minutes(1));
        assert!(credential.is_expired(Utc::now()));
        assert_eq!(credential.remaining(Utc::now()), Duration::ZERO);
    }

    #[test]
    fn token_response_expiry_is_unix_seconds() {
        let credential = parse_token_response(ImdsTokenResponse {
            access_token: "abc".into(),
            expires_on: "1700000000".into(),
        })
        .unwrap();
        assert_eq!(credential.token(), "abc");
        assert_eq!(credential.expires_at().timestamp(), 1_700_000_000);
    }

    #[test]
    fn malformed_expiry_is_rejected() {
        let err = parse_token_response(ImdsTokenResponse {
            access_token: "abc".into(),
            expires_on: "soon".into(),
        })
        .unwrap_err();
        assert!(matches!(err, CredentialError::Malformed(_)));
    }

    #[tokio::test]
    async fn static_provider_returns_its_credential() {
        let expires = Utc::now() + chrono::Duration::hours(1);
        let provider = StaticCredentialProvider::new(Credential::new("pw", expires));
        assert_eq!(provider.get_token().await.unwrap().expires_at(), expires);
    }
}
