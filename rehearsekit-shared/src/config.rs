//! Configuration management for the RehearseKit client

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Fallback API origin for plain-HTTP development setups
pub const DEFAULT_API_URL: &str = "http://localhost:8000";

/// Fallback progress channel origin for plain-HTTP development setups
pub const DEFAULT_WS_URL: &str = "ws://localhost:8001";

/// Environment override for [`ApiConfig::api_url`]
pub const API_URL_ENV: &str = "REHEARSEKIT_API_URL";

/// Environment override for [`ProgressConfig::ws_url`]
pub const WS_URL_ENV: &str = "REHEARSEKIT_WS_URL";

/// Longest credential lifetime accepted from configuration (ten years)
pub const MAX_CREDENTIAL_TTL_SECS: u64 = 10 * 365 * 24 * 60 * 60;

/// Main configuration for the RehearseKit client
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Backend API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Progress channel configuration
    #[serde(default)]
    pub progress: ProgressConfig,

    /// Session lifecycle configuration
    #[serde(default)]
    pub session: SessionConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Backend API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// API origin used when the host is not reached over https
    pub api_url: Option<String>,

    /// Identity endpoint path
    pub identity_path: String,

    /// Credential refresh endpoint path
    pub refresh_path: String,

    /// Logout notification endpoint path
    pub logout_path: String,

    /// Request timeout (seconds)
    pub timeout_secs: u64,
}

/// Progress channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressConfig {
    /// Channel origin used when the host is not reached over https
    pub ws_url: Option<String>,

    /// Path prefix forwarded by the reverse proxy to the progress service
    pub path_prefix: String,

    /// Automatic reconnects before giving up
    pub max_reconnect_attempts: u32,

    /// Base reconnect delay (milliseconds), multiplied by the attempt number
    pub reconnect_base_delay_ms: u64,
}

/// Where credentials are persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialStoreKind {
    Keyring,
    Memory,
}

/// Session lifecycle configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Proactive credential renewal interval (seconds)
    pub renewal_interval_secs: u64,

    /// Lifetime of a stored access credential (seconds)
    pub access_ttl_secs: u64,

    /// Lifetime of a stored refresh credential (seconds)
    pub refresh_ttl_secs: u64,

    /// Credential store backend
    pub store: CredentialStoreKind,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (json, pretty)
    pub format: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            api_url: None,
            identity_path: "/api/auth/me".to_string(),
            refresh_path: "/api/auth/refresh".to_string(),
            logout_path: "/api/auth/logout".to_string(),
            timeout_secs: 30,
        }
    }
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            ws_url: None,
            path_prefix: "/ws".to_string(),
            max_reconnect_attempts: 5,
            reconnect_base_delay_ms: 1000,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            renewal_interval_secs: 20 * 60 * 60, // inside the 24h access lifetime
            access_ttl_secs: 24 * 60 * 60,
            refresh_ttl_secs: 7 * 24 * 60 * 60,
            store: CredentialStoreKind::Keyring,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl ApiConfig {
    /// Configured API origin, then the environment, then the development default
    pub fn resolved_api_url(&self) -> String {
        self.api_url
            .clone()
            .or_else(|| std::env::var(API_URL_ENV).ok())
            .unwrap_or_else(|| DEFAULT_API_URL.to_string())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl ProgressConfig {
    /// Configured channel origin, then the environment, then the development default
    pub fn resolved_ws_url(&self) -> String {
        self.ws_url
            .clone()
            .or_else(|| std::env::var(WS_URL_ENV).ok())
            .unwrap_or_else(|| DEFAULT_WS_URL.to_string())
    }

    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }
}

impl SessionConfig {
    pub fn renewal_interval(&self) -> Duration {
        Duration::from_secs(self.renewal_interval_secs)
    }

    pub fn access_ttl(&self) -> chrono::Duration {
        ttl_duration(self.access_ttl_secs)
    }

    pub fn refresh_ttl(&self) -> chrono::Duration {
        ttl_duration(self.refresh_ttl_secs)
    }
}

/// Lifetimes beyond the accepted maximum are clamped rather than overflowing
fn ttl_duration(secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(secs.min(MAX_CREDENTIAL_TTL_SECS) as i64)
}

impl ClientConfig {
    /// Load configuration from file or create default
    pub fn load_or_default(config_path: Option<&str>) -> crate::Result<Self> {
        match config_path {
            Some(path) => {
                let content = std::fs::read_to_string(path)?;
                let config: ClientConfig = serde_json::from_str(&content)?;
                config.validate()?;
                Ok(config)
            }
            None => Ok(Self::default()),
        }
    }

    /// Save configuration to file
    pub fn save(&self, config_path: &str) -> crate::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(config_path, content)?;
        Ok(())
    }

    /// Reject settings that would make the session or channel layers misbehave
    pub fn validate(&self) -> crate::Result<()> {
        for (name, ttl) in [
            ("session.access_ttl_secs", self.session.access_ttl_secs),
            ("session.refresh_ttl_secs", self.session.refresh_ttl_secs),
        ] {
            if ttl == 0 || ttl > MAX_CREDENTIAL_TTL_SECS {
                return Err(crate::RehearseError::Config(format!(
                    "{name} must be between 1 and {MAX_CREDENTIAL_TTL_SECS}, got {ttl}"
                )));
            }
        }

        if self.session.renewal_interval_secs == 0 {
            return Err(crate::RehearseError::Config(
                "session.renewal_interval_secs must be positive".to_string(),
            ));
        }

        if self.session.renewal_interval_secs >= self.session.access_ttl_secs {
            return Err(crate::RehearseError::Config(
                "session.renewal_interval_secs must be shorter than session.access_ttl_secs"
                    .to_string(),
            ));
        }

        for path in [
            &self.api.identity_path,
            &self.api.refresh_path,
            &self.api.logout_path,
        ] {
            if !path.starts_with('/') {
                return Err(crate::RehearseError::Config(format!(
                    "endpoint path must start with '/': {path}"
                )));
            }
        }

        Ok(())
    }
}
