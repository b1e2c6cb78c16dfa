//! OAuth2 authorization-code clients for the OAuth providers
//!
//! - **Atlassian** (issue tracker): `auth.atlassian.com`, JSON token requests
//!   authenticated with the client secret.
//! - **Azure DevOps** (work items): `app.vssps.visualstudio.com`, form token
//!   requests authenticated with a JWT-bearer client assertion. The code (or
//!   refresh token) travels in the `assertion` field.

use crate::config::ProviderSettings;
use crate::domain::ProviderType;
use crate::integration::Credentials;
use crate::providers::http::transport_error;
use crate::{BridgeError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::Client;
use serde::{Deserialize, Deserializer};
use std::fmt;

const JWT_BEARER_ASSERTION: &str = "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

/// Token endpoint of one OAuth provider
#[async_trait]
pub trait TokenEndpoint: Send + Sync {
    /// Browser URL that starts the handshake, carrying `state`
    fn authorize_url(&self, state: &str) -> Result<String>;

    /// Exchange an authorization code for tokens
    async fn exchange_code(&self, code: &str) -> Result<TokenGrant>;

    /// Refresh an access token
    ///
    /// A rejected grant (HTTP 400/401, `invalid_grant`) is reported as
    /// [`BridgeError::TokenInvalid`]; network trouble as
    /// [`BridgeError::ProviderUnavailable`].
    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant>;
}

/// Successful token response
#[derive(Clone, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,

    #[serde(default)]
    pub refresh_token: Option<String>,

    /// Azure DevOps sends this as a string
    #[serde(default, deserialize_with = "lenient_seconds")]
    pub expires_in: Option<i64>,
}

impl TokenGrant {
    /// Credentials expiring relative to `now`
    ///
    /// Providers that do not rotate refresh tokens omit them from refresh
    /// responses; `previous_refresh` is kept in that case.
    pub fn into_credentials(self, now: DateTime<Utc>, previous_refresh: Option<String>) -> Credentials {
        Credentials {
            access_token: self.access_token,
            refresh_token: self.refresh_token.or(previous_refresh),
            expires_at: self.expires_in.map(|secs| now + Duration::seconds(secs)),
        }
    }
}

impl fmt::Debug for TokenGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenGrant")
            .field("access_token", &"[REDACTED]")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

fn lenient_seconds<'de, D>(deserializer: D) -> std::result::Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumberOrString {
        Number(i64),
        String(String),
    }

    match Option::<NumberOrString>::deserialize(deserializer)? {
        None => Ok(None),
        Some(NumberOrString::Number(n)) => Ok(Some(n)),
        Some(NumberOrString::String(s)) => s
            .trim()
            .parse()
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

/// Error response from a token endpoint
#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    #[serde(alias = "Error")]
    error: String,
    #[serde(default, alias = "ErrorDescription")]
    error_description: Option<String>,
}

/// Which token protocol dialect to speak
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OAuthFlavor {
    Atlassian,
    AzureDevOps,
}

/// HTTP client for one provider's OAuth endpoints
pub struct OAuthClient {
    flavor: OAuthFlavor,
    http: Client,
    auth_base_url: String,
    client_id: String,
    client_secret: String,
    redirect_uri: String,
    scopes: Vec<String>,
}

impl OAuthClient {
    pub fn new(
        flavor: OAuthFlavor,
        http: Client,
        auth_base_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        redirect_uri: impl Into<String>,
        scopes: Vec<String>,
    ) -> Self {
        Self {
            flavor,
            http,
            auth_base_url: auth_base_url.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            redirect_uri: redirect_uri.into(),
            scopes,
        }
    }

    /// Build from configuration; `Ok(None)` for the board provider
    pub fn from_settings(
        provider: ProviderType,
        settings: &ProviderSettings,
        timeout: std::time::Duration,
    ) -> Result<Option<Self>> {
        let flavor = match provider {
            ProviderType::IssueTracker => OAuthFlavor::Atlassian,
            ProviderType::WorkItem => OAuthFlavor::AzureDevOps,
            ProviderType::Board => return Ok(None),
        };

        let http = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("bugbridge/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Some(Self::new(
            flavor,
            http,
            settings.auth_base_url(provider),
            settings.require_client_id(provider)?,
            settings.client_secret(provider)?,
            settings.require_redirect_uri(provider)?,
            settings.scopes(provider),
        )))
    }

    fn provider_name(&self) -> &'static str {
        match self.flavor {
            OAuthFlavor::Atlassian => "Jira",
            OAuthFlavor::AzureDevOps => "Azure DevOps",
        }
    }

    fn token_url(&self) -> String {
        match self.flavor {
            OAuthFlavor::Atlassian => format!("{}/oauth/token", self.auth_base_url),
            OAuthFlavor::AzureDevOps => format!("{}/oauth2/token", self.auth_base_url),
        }
    }

    async fn request_token(&self, grant: Grant<'_>) -> Result<TokenGrant> {
        let url = self.token_url();
        tracing::debug!(provider = self.provider_name(), url = %url, grant = grant.kind(), "Requesting OAuth token");

        let request = match self.flavor {
            OAuthFlavor::Atlassian => {
                let mut body = serde_json::json!({
                    "client_id": self.client_id,
                    "client_secret": self.client_secret,
                });
                match grant {
                    Grant::Code(code) => {
                        body["grant_type"] = "authorization_code".into();
                        body["code"] = code.into();
                        body["redirect_uri"] = self.redirect_uri.as_str().into();
                    }
                    Grant::Refresh(token) => {
                        body["grant_type"] = "refresh_token".into();
                        body["refresh_token"] = token.into();
                    }
                }
                self.http.post(&url).json(&body)
            }
            OAuthFlavor::AzureDevOps => {
                let (grant_type, assertion) = match grant {
                    Grant::Code(code) => (JWT_BEARER_GRANT, code),
                    Grant::Refresh(token) => ("refresh_token", token),
                };
                self.http.post(&url).form(&[
                    ("client_assertion_type", JWT_BEARER_ASSERTION),
                    ("client_assertion", self.client_secret.as_str()),
                    ("grant_type", grant_type),
                    ("assertion", assertion),
                    ("redirect_uri", self.redirect_uri.as_str()),
                ])
            }
        };

        let response = request
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();

        if !status.is_success() {
            let detail = serde_json::from_str::<TokenErrorResponse>(&text)
                .map(|err| match err.error_description {
                    Some(desc) => format!("{}: {}", err.error, desc),
                    None => err.error,
                })
                .unwrap_or_else(|_| text.clone());

            return Err(match status.as_u16() {
                400 | 401 => BridgeError::TokenInvalid(format!(
                    "{} rejected the {}: {}",
                    self.provider_name(),
                    grant.kind(),
                    detail
                )),
                429 | 500..=599 => BridgeError::unavailable(format!(
                    "{} token endpoint returned HTTP {}",
                    self.provider_name(),
                    status.as_u16()
                )),
                code => BridgeError::ProviderApi {
                    status: code,
                    body: detail,
                },
            });
        }

        serde_json::from_str::<TokenGrant>(&text).map_err(|e| BridgeError::ProviderApi {
            status: status.as_u16(),
            body: format!("Failed to parse token response: {}", e),
        })
    }
}

#[derive(Debug, Clone, Copy)]
enum Grant<'a> {
    Code(&'a str),
    Refresh(&'a str),
}

impl Grant<'_> {
    fn kind(&self) -> &'static str {
        match self {
            Grant::Code(_) => "authorization code",
            Grant::Refresh(_) => "refresh token",
        }
    }
}

#[async_trait]
impl TokenEndpoint for OAuthClient {
    fn authorize_url(&self, state: &str) -> Result<String> {
        let scope = self.scopes.join(" ");
        let url = match self.flavor {
            OAuthFlavor::Atlassian => format!(
                "{}/authorize?\
                 audience=api.atlassian.com&\
                 client_id={}&\
                 scope={}&\
                 redirect_uri={}&\
                 state={}&\
                 response_type=code&\
                 prompt=consent",
                self.auth_base_url,
                urlencoding::encode(&self.client_id),
                urlencoding::encode(&scope),
                urlencoding::encode(&self.redirect_uri),
                urlencoding::encode(state)
            ),
            OAuthFlavor::AzureDevOps => format!(
                "{}/oauth2/authorize?\
                 client_id={}&\
                 response_type=Assertion&\
                 state={}&\
                 scope={}&\
                 redirect_uri={}",
                self.auth_base_url,
                urlencoding::encode(&self.client_id),
                urlencoding::encode(state),
                urlencoding::encode(&scope),
                urlencoding::encode(&self.redirect_uri)
            ),
        };
        Ok(url)
    }

    async fn exchange_code(&self, code: &str) -> Result<TokenGrant> {
        self.request_token(Grant::Code(code)).await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant> {
        self.request_token(Grant::Refresh(refresh_token)).await
    }
}

impl fmt::Debug for OAuthClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthClient")
            .field("flavor", &self.flavor)
            .field("auth_base_url", &self.auth_base_url)
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .finish()
    }
}
