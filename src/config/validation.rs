//! Configuration validation
//!
//! Validates BugBridge configuration for correctness:
//! - Timeouts and rate limits are non-zero
//! - Provider URLs are http(s)
//! - Referenced environment variables are set

use super::bridge_config::BridgeConfig;
use super::provider_settings::ProviderSettings;
use crate::domain::ProviderType;
use crate::BridgeError;

/// Validation error details
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub provider: Option<ProviderType>,
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            provider: None,
            field: field.into(),
            message: message.into(),
        }
    }

    fn with_provider(mut self, provider: ProviderType) -> Self {
        self.provider = Some(provider);
        self
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(provider) = self.provider {
            write!(f, "[{}] {}: {}", provider, self.field, self.message)
        } else {
            write!(f, "{}: {}", self.field, self.message)
        }
    }
}

/// Validation result
pub type ValidationResult = std::result::Result<(), Vec<ValidationError>>;

/// Validate a BugBridge configuration
pub fn validate_config(config: &BridgeConfig) -> ValidationResult {
    let mut errors = Vec::new();

    if config.request_timeout_secs == 0 {
        errors.push(ValidationError::new(
            "request_timeout_secs",
            "Request timeout must be greater than 0",
        ));
    }

    if config.secret_key_env.trim().is_empty() {
        errors.push(ValidationError::new(
            "secret_key_env",
            "Secret key environment variable name cannot be empty",
        ));
    } else if std::env::var(&config.secret_key_env).is_err() {
        // Key may be injected at runtime by the host process
        tracing::warn!(
            env_var = %config.secret_key_env,
            "Credential encryption key not set (stored integrations cannot be decrypted)"
        );
    }

    for provider in ProviderType::ALL {
        let settings = config.providers.get(provider);
        errors.extend(
            validate_provider(provider, settings)
                .into_iter()
                .map(|e| e.with_provider(provider)),
        );
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Validate one provider's settings
fn validate_provider(provider: ProviderType, settings: &ProviderSettings) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if settings.requests_per_second == 0 {
        errors.push(ValidationError::new(
            "requests_per_second",
            "Rate limit must be greater than 0",
        ));
    }

    if let Some(ref url) = settings.api_base_url {
        if !is_http_url(url) {
            errors.push(ValidationError::new(
                "api_base_url",
                format!("Invalid API URL: {}", url),
            ));
        }
    }

    if let Some(ref url) = settings.auth_base_url {
        if !is_http_url(url) {
            errors.push(ValidationError::new(
                "auth_base_url",
                format!("Invalid authorization server URL: {}", url),
            ));
        }
    }

    if let Some(ref uri) = settings.redirect_uri {
        if !is_http_url(uri) {
            errors.push(ValidationError::new(
                "redirect_uri",
                format!("Invalid redirect URI: {}", uri),
            ));
        }
    }

    if let Some(ref env_var) = settings.client_secret_env {
        let env_var = env_var.trim_start_matches('$');
        if std::env::var(env_var).is_err() {
            tracing::warn!(
                provider = %provider,
                env_var = %env_var,
                "Environment variable not set (this may be intentional if set at runtime)"
            );
        }
    }

    // OAuth clients need every piece of the handshake or none of it
    if provider.uses_oauth() && settings.client_id.is_some() {
        if settings.client_secret_env.is_none() {
            errors.push(ValidationError::new(
                "client_secret_env",
                "client_id is set but client_secret_env is missing",
            ));
        }
        if settings.redirect_uri.is_none() {
            errors.push(ValidationError::new(
                "redirect_uri",
                "client_id is set but redirect_uri is missing",
            ));
        }
    }

    errors
}

fn is_http_url(url: &str) -> bool {
    url.starts_with("https://") || url.starts_with("http://")
}

/// Validate configuration and return a Result
pub fn validate_config_result(config: &BridgeConfig) -> crate::Result<()> {
    validate_config(config).map_err(|errors| {
        let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
        BridgeError::Config(format!(
            "Configuration validation failed:\n  - {}",
            messages.join("\n  - ")
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = BridgeConfig::new();
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_zero_timeout() {
        let mut config = BridgeConfig::new();
        config.request_timeout_secs = 0;

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "request_timeout_secs");
    }

    #[test]
    fn test_zero_rate_is_reported_per_provider() {
        let mut config = BridgeConfig::new();
        config.providers.board.requests_per_second = 0;

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].provider, Some(ProviderType::Board));
        assert!(errors[0].to_string().starts_with("[board]"));
    }

    #[test]
    fn test_invalid_urls() {
        let mut config = BridgeConfig::new();
        config.providers.issue_tracker.api_base_url = Some("api.atlassian.com".to_string());
        config.providers.work_item.auth_base_url = Some("ftp://example.com".to_string());

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn test_partial_oauth_client() {
        let mut config = BridgeConfig::new();
        config.providers.work_item.client_id = Some("app-id".to_string());

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<&str> = errors.iter().map(|e| e.field.as_str()).collect();
        assert!(fields.contains(&"client_secret_env"));
        assert!(fields.contains(&"redirect_uri"));
    }

    #[test]
    fn test_board_key_does_not_need_oauth_settings() {
        let mut config = BridgeConfig::new();
        config.providers.board.client_id = Some("trello-key".to_string());
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_validate_config_result_joins_messages() {
        let mut config = BridgeConfig::new();
        config.request_timeout_secs = 0;
        config.providers.issue_tracker.requests_per_second = 0;

        let err = validate_config_result(&config).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("request_timeout_secs"));
        assert!(message.contains("[issue_tracker] requests_per_second"));
    }
}
