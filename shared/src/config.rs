use serde::{Deserialize, Serialize};

use crate::capabilities::{HostPolicy, ValidatedUrl, MAX_TIMEOUT_MS};
use crate::error::ValidationError;

/// Runtime settings for the client core. Shells usually ship these as JSON
/// next to the app bundle; every field has a default.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientConfig {
    /// Backend REST root, e.g. `https://api.example.com/api`.
    pub api_base_url: String,
    /// Object-store multipart upload endpoint.
    pub upload_endpoint: String,
    /// Unsigned upload preset sent with every object upload.
    pub upload_preset: String,
    pub allow_private_hosts: bool,
    pub request_timeout_ms: u64,
    pub upload_timeout_ms: u64,
    /// Bytes per streamed chunk; progress is reported per chunk.
    pub upload_chunk_size: usize,
    pub max_upload_bytes: u64,
    pub max_concurrent_uploads: usize,
    pub max_name_length: usize,
    /// Session key under which the bearer token is persisted.
    pub token_key: String,
    pub event_buffer: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base_url: "https://api.cloudstore.app/api".to_string(),
            upload_endpoint: "https://api.cloudinary.com/v1_1/cloudstore/raw/upload".to_string(),
            upload_preset: "cloudstore_unsigned".to_string(),
            allow_private_hosts: false,
            request_timeout_ms: 30_000,
            upload_timeout_ms: 120_000,
            upload_chunk_size: 256 * 1024,
            max_upload_bytes: 100 * 1024 * 1024,
            max_concurrent_uploads: 4,
            max_name_length: 255,
            token_key: "jwt".to_string(),
            event_buffer: 256,
        }
    }
}

impl ClientConfig {
    pub fn from_json(json: &str) -> Result<Self, ValidationError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ValidationError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        self.api_url()?;
        self.upload_url()?;
        if self.upload_preset.trim().is_empty() {
            return Err(ValidationError::Config("upload_preset must not be empty".into()));
        }
        for (name, value) in [
            ("request_timeout_ms", self.request_timeout_ms),
            ("upload_timeout_ms", self.upload_timeout_ms),
        ] {
            if value == 0 || value > MAX_TIMEOUT_MS {
                return Err(ValidationError::Config(format!(
                    "{name} must be between 1 and {MAX_TIMEOUT_MS}"
                )));
            }
        }
        if self.upload_chunk_size < 1024 {
            return Err(ValidationError::Config(
                "upload_chunk_size should be at least 1024 bytes".into(),
            ));
        }
        if self.max_upload_bytes == 0 {
            return Err(ValidationError::Config("max_upload_bytes must be > 0".into()));
        }
        if self.max_concurrent_uploads == 0 {
            return Err(ValidationError::Config(
                "max_concurrent_uploads must be > 0".into(),
            ));
        }
        if self.max_name_length == 0 {
            return Err(ValidationError::Config("max_name_length must be > 0".into()));
        }
        if self.token_key.trim().is_empty() {
            return Err(ValidationError::Config("token_key must not be empty".into()));
        }
        if self.event_buffer == 0 {
            return Err(ValidationError::Config("event_buffer must be > 0".into()));
        }
        Ok(())
    }

    pub fn host_policy(&self) -> HostPolicy {
        if self.allow_private_hosts {
            HostPolicy::AllowPrivate
        } else {
            HostPolicy::PublicOnly
        }
    }

    pub fn api_url(&self) -> Result<ValidatedUrl, ValidationError> {
        ValidatedUrl::with_policy(&self.api_base_url, self.host_policy())
            .map_err(|e| ValidationError::Config(format!("api_base_url: {e}")))
    }

    pub fn upload_url(&self) -> Result<ValidatedUrl, ValidationError> {
        ValidatedUrl::with_policy(&self.upload_endpoint, self.host_policy())
            .map_err(|e| ValidationError::Config(format!("upload_endpoint: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(ClientConfig::default().validate().is_ok());
    }

    #[test]
    fn test_from_json_fills_defaults() {
        let config = ClientConfig::from_json(
            r#"{"api_base_url": "https://files.example.com/api", "max_concurrent_uploads": 2}"#,
        )
        .unwrap();
        assert_eq!(config.api_base_url, "https://files.example.com/api");
        assert_eq!(config.max_concurrent_uploads, 2);
        assert_eq!(config.token_key, "jwt");
    }

    #[test]
    fn test_from_json_rejects_unknown_fields() {
        assert!(ClientConfig::from_json(r#"{"api_base": "x"}"#).is_err());
    }

    #[test]
    fn test_validation_failures() {
        let config = ClientConfig {
            max_concurrent_uploads: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ClientConfig {
            request_timeout_ms: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ClientConfig {
            upload_preset: " ".into(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_local_backend_needs_opt_in() {
        let config = ClientConfig {
            api_base_url: "http://localhost:8080/api".into(),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ClientConfig {
            allow_private_hosts: true,
            ..config
        };
        assert!(config.validate().is_ok());
    }
}
