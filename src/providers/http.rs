//! Shared HTTP plumbing for provider adapters
//!
//! Every request goes through the adapter's rate limiter and is classified
//! the same way:
//!
//! | Outcome                         | Error                  |
//! |---------------------------------|------------------------|
//! | connect failure, timeout        | `ProviderUnavailable`  |
//! | 5xx                             | `ProviderUnavailable`  |
//! | 429                             | `ProviderUnavailable` + `Retry-After` |
//! | 401                             | `TokenInvalid`         |
//! | other 4xx                       | `ProviderApi`          |
//! | undecodable 2xx body            | `ProviderApi`          |

use super::rate_limit::ApiRateLimiter;
use crate::domain::ProviderType;
use crate::retry::parse_retry_after;
use crate::{BridgeError, Result};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;

/// Rate-limited HTTP client for one provider
#[derive(Debug, Clone)]
pub struct ProviderHttp {
    provider: ProviderType,
    client: Client,
    limiter: ApiRateLimiter,
}

impl ProviderHttp {
    pub fn new(provider: ProviderType, timeout: Duration, requests_per_second: u32) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("bugbridge/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            provider,
            client,
            limiter: ApiRateLimiter::new(requests_per_second),
        })
    }

    pub fn request(&self, method: Method, url: &str) -> RequestBuilder {
        self.client
            .request(method, url)
            .header("Accept", "application/json")
    }

    /// Send and classify; only 2xx responses are returned
    pub async fn send(&self, request: RequestBuilder) -> Result<Response> {
        self.limiter.wait().await;

        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();

        if status.is_success() {
            tracing::debug!(provider = %self.provider, status = status.as_u16(), url = %response.url(), "Provider request succeeded");
            return Ok(response);
        }

        Err(self.classify(response).await)
    }

    /// Send and decode a JSON body
    pub async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let response = self.send(request).await?;
        self.decode(response).await
    }

    /// Decode a successful response body
    pub async fn decode<T: DeserializeOwned>(&self, response: Response) -> Result<T> {
        let status = response.status().as_u16();
        let text = response.text().await.map_err(transport_error)?;

        serde_json::from_str(&text).map_err(|e| BridgeError::ProviderApi {
            status,
            body: format!(
                "Failed to decode {} response: {}",
                self.provider.display_name(),
                e
            ),
        })
    }

    /// Send, discarding the body
    pub async fn send_empty(&self, request: RequestBuilder) -> Result<()> {
        self.send(request).await?;
        Ok(())
    }

    async fn classify(&self, response: Response) -> BridgeError {
        let status = response.status();
        let retry_after = parse_retry_after(
            response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok()),
        );
        let body = response.text().await.unwrap_or_default();
        let name = self.provider.display_name();

        match status {
            StatusCode::UNAUTHORIZED => {
                tracing::warn!(provider = %self.provider, "Provider rejected the access token");
                BridgeError::TokenInvalid(format!("{} returned HTTP 401: {}", name, body))
            }
            StatusCode::TOO_MANY_REQUESTS => {
                tracing::warn!(provider = %self.provider, retry_after = ?retry_after, "Provider rate limit hit");
                BridgeError::ProviderUnavailable {
                    message: format!("{} rate limit exceeded", name),
                    retry_after,
                }
            }
            s if s.is_server_error() => BridgeError::ProviderUnavailable {
                message: format!("{} returned HTTP {}", name, s.as_u16()),
                retry_after,
            },
            s => BridgeError::ProviderApi {
                status: s.as_u16(),
                body,
            },
        }
    }
}

/// Map a failed send to the error taxonomy
pub(crate) fn transport_error(e: reqwest::Error) -> BridgeError {
    if e.is_timeout() {
        BridgeError::unavailable(format!("request timed out: {}", e))
    } else if e.is_connect() || e.is_request() || e.is_body() {
        BridgeError::unavailable(format!("network error: {}", e))
    } else if e.is_decode() {
        BridgeError::ProviderApi {
            status: e.status().map(|s| s.as_u16()).unwrap_or(0),
            body: format!("undecodable response: {}", e),
        }
    } else {
        BridgeError::Http(e)
    }
}
