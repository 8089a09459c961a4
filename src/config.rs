//! Backend endpoint configuration.
//!
//! The deployment endpoint and key come from the environment at startup and
//! are never user input. A client may additionally supply a
//! [`BackendOverride`] for a secondary backend; it is sanitized here and
//! persisted by [`crate::settings`].

use std::collections::HashMap;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::model::{ModelLimits, TransitionPolicy};
use crate::{AppError, ErrorKind, DEFAULT_NAME_CACHE_SIZE};

pub const BACKEND_URL_VAR: &str = "HELPDESK_BACKEND_URL";
pub const BACKEND_KEY_VAR: &str = "HELPDESK_BACKEND_ANON_KEY";

pub const MAX_URL_LENGTH: usize = 2048;
pub const MAX_KEY_LENGTH: usize = 4096;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{name} is not set")]
    Missing { name: &'static str },

    #[error("invalid backend URL: {reason}")]
    InvalidUrl { reason: String },

    #[error("invalid API key: {reason}")]
    InvalidKey { reason: &'static str },

    #[error("the override must not reuse the deployment credentials")]
    ReusesDeploymentKey,

    #[error("{field} {reason}")]
    Invalid { field: &'static str, reason: &'static str },
}

impl From<ConfigError> for AppError {
    fn from(e: ConfigError) -> Self {
        match e {
            ConfigError::Missing { .. } => {
                AppError::new(ErrorKind::InvalidState, "The app is not configured").with_detail(e.to_string())
            }
            _ => AppError::new(ErrorKind::Validation, e.to_string()),
        }
    }
}

fn is_loopback(host: &str) -> bool {
    matches!(host, "localhost" | "127.0.0.1" | "::1" | "[::1]")
}

/// Parses and normalizes an endpoint: https only (plain http for loopback
/// hosts), no credentials, query or fragment, no trailing slash.
pub fn sanitize_endpoint(raw: &str) -> Result<String, ConfigError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ConfigError::InvalidUrl {
            reason: "URL cannot be empty".into(),
        });
    }
    if trimmed.len() > MAX_URL_LENGTH {
        return Err(ConfigError::InvalidUrl {
            reason: format!("URL exceeds maximum length of {MAX_URL_LENGTH} bytes"),
        });
    }

    let url = Url::parse(trimmed).map_err(|e| ConfigError::InvalidUrl { reason: e.to_string() })?;
    let host = url
        .host_str()
        .ok_or_else(|| ConfigError::InvalidUrl {
            reason: "URL must have a host".into(),
        })?
        .to_lowercase();

    match url.scheme() {
        "https" => {}
        "http" if is_loopback(&host) => {}
        other => {
            return Err(ConfigError::InvalidUrl {
                reason: format!("scheme '{other}' is not allowed, use https"),
            })
        }
    }
    if !url.username().is_empty() || url.password().is_some() {
        return Err(ConfigError::InvalidUrl {
            reason: "credentials in URL are not allowed".into(),
        });
    }
    if url.query().is_some() || url.fragment().is_some() {
        return Err(ConfigError::InvalidUrl {
            reason: "query strings and fragments are not allowed".into(),
        });
    }

    Ok(url.as_str().trim_end_matches('/').to_string())
}

pub fn validate_key(key: &SecretString) -> Result<(), ConfigError> {
    let key = key.expose_secret();
    if key.trim().is_empty() {
        return Err(ConfigError::InvalidKey {
            reason: "key cannot be empty",
        });
    }
    if key.len() > MAX_KEY_LENGTH {
        return Err(ConfigError::InvalidKey {
            reason: "key is too long",
        });
    }
    if key.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(ConfigError::InvalidKey {
            reason: "key must be a single printable token",
        });
    }
    Ok(())
}

/// Deployment-time backend endpoint.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    endpoint: String,
    anon_key: SecretString,
}

impl BackendConfig {
    pub fn new(url: &str, anon_key: SecretString) -> Result<Self, ConfigError> {
        let endpoint = sanitize_endpoint(url)?;
        validate_key(&anon_key)?;
        Ok(Self { endpoint, anon_key })
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_map(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        Self::from_lookup(|name| vars.get(name).cloned())
    }

    fn from_lookup(lookup: impl Fn(&'static str) -> Option<String>) -> Result<Self, ConfigError> {
        let url = lookup(BACKEND_URL_VAR).ok_or(ConfigError::Missing { name: BACKEND_URL_VAR })?;
        let key = lookup(BACKEND_KEY_VAR).ok_or(ConfigError::Missing { name: BACKEND_KEY_VAR })?;
        Self::new(&url, SecretString::new(key))
    }

    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    #[must_use]
    pub fn anon_key(&self) -> &SecretString {
        &self.anon_key
    }
}

/// Client-supplied endpoint for the secondary backend.
#[derive(Debug, Clone)]
pub struct BackendOverride {
    endpoint: String,
    api_key: SecretString,
}

impl BackendOverride {
    pub fn new(url: &str, api_key: SecretString, deployment: Option<&BackendConfig>) -> Result<Self, ConfigError> {
        let endpoint = sanitize_endpoint(url)?;
        validate_key(&api_key)?;
        if let Some(deployment) = deployment {
            // blake3::Hash equality is constant-time.
            let supplied = blake3::hash(api_key.expose_secret().as_bytes());
            let default = blake3::hash(deployment.anon_key.expose_secret().as_bytes());
            if supplied == default {
                return Err(ConfigError::ReusesDeploymentKey);
            }
        }
        Ok(Self { endpoint, api_key })
    }

    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    #[must_use]
    pub fn api_key(&self) -> &SecretString {
        &self.api_key
    }
}

/// The backend a client connects to.
#[derive(Debug, Clone)]
pub enum BackendTarget {
    Deployment(BackendConfig),
    /// Secondary backend chosen by the user.
    Override(BackendOverride),
}

impl BackendTarget {
    #[must_use]
    pub fn endpoint(&self) -> &str {
        match self {
            Self::Deployment(config) => config.endpoint(),
            Self::Override(o) => o.endpoint(),
        }
    }

    #[must_use]
    pub fn api_key(&self) -> &SecretString {
        match self {
            Self::Deployment(config) => config.anon_key(),
            Self::Override(o) => o.api_key(),
        }
    }

    #[must_use]
    pub const fn is_override(&self) -> bool {
        matches!(self, Self::Override(_))
    }
}

/// Knobs for one signed-in session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub transition_policy: TransitionPolicy,
    pub name_cache_size: usize,
    pub limits: ModelLimits,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            transition_policy: TransitionPolicy::default(),
            name_cache_size: DEFAULT_NAME_CACHE_SIZE,
            limits: ModelLimits::default(),
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name_cache_size == 0 {
            return Err(ConfigError::Invalid {
                field: "name_cache_size",
                reason: "must be > 0",
            });
        }
        if self.limits.toasts == 0 {
            return Err(ConfigError::Invalid {
                field: "limits.toasts",
                reason: "must be > 0",
            });
        }
        if self.limits.notification_history == 0 {
            return Err(ConfigError::Invalid {
                field: "limits.notification_history",
                reason: "must be > 0",
            });
        }
        Ok(())
    }
}
