//! Bearer token acquisition for the CRM and the Google APIs.

use std::fmt;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::http::ApiClient;
use crate::AdapterError;

pub const GOOGLE_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
pub const SALESFORCE_LOGIN_URL: &str = "https://login.salesforce.com";

/// Short-lived access token. `instance_url` is only set by Salesforce.
#[derive(Clone, PartialEq, Eq)]
pub struct BearerToken {
    pub access_token: String,
    pub instance_url: Option<String>,
}

impl BearerToken {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            instance_url: None,
        }
    }
}

impl fmt::Debug for BearerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BearerToken")
            .field("access_token", &"<redacted>")
            .field("instance_url", &self.instance_url)
            .finish()
    }
}

/// Capability-scoped source of bearer tokens. Implementations fetch a fresh
/// token on every call.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn bearer_token(&self) -> Result<BearerToken, AdapterError>;
}

/// Fixed token, for local runs against sandboxes and for tests.
#[derive(Debug, Clone)]
pub struct StaticTokenProvider(pub BearerToken);

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn bearer_token(&self) -> Result<BearerToken, AdapterError> {
        Ok(self.0.clone())
    }
}

#[derive(Clone)]
pub struct GoogleOAuthCredentials {
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
}

impl fmt::Debug for GoogleOAuthCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GoogleOAuthCredentials")
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct GoogleTokenResponse {
    access_token: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
}

/// Refresh-token grant against Google's OAuth endpoint. Shared by Ads,
/// Sheets, Drive and Gmail.
#[derive(Debug, Clone)]
pub struct GoogleOAuthProvider {
    http: ApiClient,
    credentials: GoogleOAuthCredentials,
    token_uri: String,
}

impl GoogleOAuthProvider {
    pub fn new(http: ApiClient, credentials: GoogleOAuthCredentials) -> Self {
        Self {
            http,
            credentials,
            token_uri: GOOGLE_TOKEN_URI.to_string(),
        }
    }

    pub fn with_token_uri(mut self, token_uri: impl Into<String>) -> Self {
        self.token_uri = token_uri.into();
        self
    }
}

#[async_trait]
impl TokenProvider for GoogleOAuthProvider {
    async fn bearer_token(&self) -> Result<BearerToken, AdapterError> {
        let request = self.http.inner().post(&self.token_uri).form(&[
            ("grant_type", "refresh_token"),
            ("client_id", self.credentials.client_id.as_str()),
            ("client_secret", self.credentials.client_secret.as_str()),
            ("refresh_token", self.credentials.refresh_token.as_str()),
        ]);
        let resp: GoogleTokenResponse = self
            .http
            .send_json("google oauth", request)
            .await
            .map_err(|e| AdapterError::Auth(format!("google token refresh: {e}")))?;
        debug!("google access token refreshed");
        google_bearer(resp)
    }
}

fn google_bearer(resp: GoogleTokenResponse) -> Result<BearerToken, AdapterError> {
    match resp.access_token {
        Some(token) if !token.is_empty() => Ok(BearerToken::new(token)),
        _ => Err(AdapterError::Auth(format!(
            "google token response has no access_token ({})",
            resp.error_description
                .or(resp.error)
                .unwrap_or_else(|| "no error given".to_string())
        ))),
    }
}

#[derive(Clone)]
pub struct SalesforceCredentials {
    pub client_id: String,
    pub client_secret: String,
    pub username: String,
    pub password: String,
    pub security_token: String,
    pub login_url: String,
}

impl fmt::Debug for SalesforceCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SalesforceCredentials")
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .field("login_url", &self.login_url)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct SalesforceTokenResponse {
    access_token: Option<String>,
    instance_url: Option<String>,
}

/// OAuth username-password flow. The token response also names the org's
/// instance URL, which the record source queries against.
#[derive(Debug, Clone)]
pub struct SalesforcePasswordProvider {
    http: ApiClient,
    credentials: SalesforceCredentials,
}

impl SalesforcePasswordProvider {
    pub fn new(http: ApiClient, credentials: SalesforceCredentials) -> Self {
        Self { http, credentials }
    }

    fn token_url(&self) -> String {
        format!(
            "{}/services/oauth2/token",
            self.credentials.login_url.trim_end_matches('/')
        )
    }
}

#[async_trait]
impl TokenProvider for SalesforcePasswordProvider {
    async fn bearer_token(&self) -> Result<BearerToken, AdapterError> {
        let password = format!(
            "{}{}",
            self.credentials.password, self.credentials.security_token
        );
        let request = self.http.inner().post(self.token_url()).form(&[
            ("grant_type", "password"),
            ("client_id", self.credentials.client_id.as_str()),
            ("client_secret", self.credentials.client_secret.as_str()),
            ("username", self.credentials.username.as_str()),
            ("password", password.as_str()),
        ]);
        let resp: SalesforceTokenResponse = self
            .http
            .send_json("salesforce oauth", request)
            .await
            .map_err(|e| AdapterError::Auth(format!("salesforce login: {e}")))?;
        salesforce_bearer(resp)
    }
}

fn salesforce_bearer(resp: SalesforceTokenResponse) -> Result<BearerToken, AdapterError> {
    match (resp.access_token, resp.instance_url) {
        (Some(access_token), Some(instance_url)) => Ok(BearerToken {
            access_token,
            instance_url: Some(instance_url),
        }),
        _ => Err(AdapterError::Auth(
            "salesforce token response does not contain access_token and instance_url".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn salesforce_token_requires_instance_url() {
        let ok: SalesforceTokenResponse = serde_json::from_str(
            r#"{"access_token":"00D!abc","instance_url":"https://acme.my.salesforce.com","token_type":"Bearer"}"#,
        )
        .unwrap();
        let token = salesforce_bearer(ok).unwrap();
        assert_eq!(token.access_token, "00D!abc");
        assert_eq!(token.instance_url.as_deref(), Some("https://acme.my.salesforce.com"));

        let missing: SalesforceTokenResponse =
            serde_json::from_str(r#"{"access_token":"00D!abc"}"#).unwrap();
        assert!(matches!(salesforce_bearer(missing), Err(AdapterError::Auth(_))));
    }

    #[test]
    fn google_token_error_description_is_surfaced() {
        let resp: GoogleTokenResponse = serde_json::from_str(
            r#"{"error":"invalid_grant","error_description":"Token has been expired or revoked."}"#,
        )
        .unwrap();
        let err = google_bearer(resp).unwrap_err();
        assert!(err.to_string().contains("expired or revoked"));
    }

    #[test]
    fn debug_output_never_contains_secrets() {
        let token = BearerToken::new("ya29.secret");
        assert!(!format!("{token:?}").contains("ya29"));

        let creds = SalesforceCredentials {
            client_id: "cid".into(),
            client_secret: "shh".into(),
            username: "ops@example.com".into(),
            password: "hunter2".into(),
            security_token: "tok".into(),
            login_url: SALESFORCE_LOGIN_URL.into(),
        };
        let rendered = format!("{creds:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(!rendered.contains("shh"));
    }

    #[test]
    fn salesforce_token_url_tolerates_trailing_slash() {
        let http = ApiClient::new(&Default::default()).unwrap();
        let provider = SalesforcePasswordProvider::new(
            http,
            SalesforceCredentials {
                client_id: String::new(),
                client_secret: String::new(),
                username: String::new(),
                password: String::new(),
                security_token: String::new(),
                login_url: "https://test.salesforce.com/".into(),
            },
        );
        assert_eq!(
            provider.token_url(),
            "https://test.salesforce.com/services/oauth2/token"
        );
    }

    #[tokio::test]
    async fn static_provider_returns_its_token() {
        let provider = StaticTokenProvider(BearerToken::new("fixed"));
        assert_eq!(provider.bearer_token().await.unwrap().access_token, "fixed");
    }
}
