//! Configuration for the AD authentication service.
//!
//! The service is configured via a TOML file, with support for environment
//! variable interpolation using `${VAR_NAME}` syntax.
//!
//! # Example
//!
//! ```toml
//! [federation]
//! entity_id = "https://auth.example.com/saml"
//! acs_url = "https://auth.example.com/auth/ad/acs"
//! metadata_url = "https://adfs.example.com/FederationMetadata/2007-06/FederationMetadata.xml"
//!
//! [role_mapping]
//! default_role = "ROLE_UNAUTHENTICATED"
//! strategy = "highest_priority"
//!
//! [[role_mapping.rules]]
//! ad_group = "CN=Buerokratt-Admins"
//! role = "ROLE_ADMINISTRATOR"
//! priority = 1
//! ```

mod cache;
mod federation;
mod observability;
mod resilience;
mod role_mapping;
mod server;

use std::path::Path;

pub use cache::*;
pub use federation::*;
pub use observability::*;
pub use resilience::*;
pub use role_mapping::*;
use serde::{Deserialize, Serialize};
pub use server::*;

/// Root configuration.
///
/// Only `[federation]` is required. Every other section has defaults that
/// match the reference AD FS deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AdAuthConfig {
    /// HTTP server configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Trust relationship with the identity provider.
    pub federation: FederationConfig,

    /// Group-to-role mapping policy.
    #[serde(default)]
    pub role_mapping: RoleMappingPolicy,

    /// Retry and circuit breaker settings for calls to the IdP.
    #[serde(default)]
    pub resilience: ResilienceConfig,

    /// In-memory cache used for role lookups and replay detection.
    #[serde(default)]
    pub cache: MemoryCacheConfig,

    /// Logging configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl AdAuthConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(e, path.as_ref().to_path_buf()))?;

        Self::from_str(&contents)
    }

    /// Parse configuration from a TOML string.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(contents: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(contents)?;

        let mut config: AdAuthConfig = toml::from_str(&expanded).map_err(ConfigError::Parse)?;

        config.validate()?;

        Ok(config)
    }

    /// Fail-fast validation. Runs once at load time so that a bad trust
    /// configuration never reaches the request path.
    fn validate(&mut self) -> Result<(), ConfigError> {
        self.federation.validate()?;
        self.role_mapping.validate()?;
        self.resilience.validate()?;
        self.cache.validate()?;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {1}: {0}")]
    Io(std::io::Error, std::path::PathBuf),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),

    #[error("Configuration validation error: {0}")]
    Validation(String),
}

fn expand_env_vars(input: &str) -> Result<String, ConfigError> {
    let re = regex::Regex::new(r"\$\{([^}]+)\}")
        .map_err(|e| ConfigError::Validation(format!("invalid interpolation pattern: {e}")))?;
    let mut result = String::with_capacity(input.len());

    for line in input.lines() {
        let comment_pos = line.find('#');

        // Only expand variables that appear before a comment marker
        let mut line_result = String::with_capacity(line.len());
        let mut last_end = 0;

        for cap in re.captures_iter(line) {
            let Some(whole) = cap.get(0) else {
                continue;
            };

            if let Some(pos) = comment_pos
                && whole.start() >= pos
            {
                continue;
            }

            line_result.push_str(&line[last_end..whole.start()]);

            let var_name = &cap[1];
            let value = std::env::var(var_name)
                .map_err(|_| ConfigError::EnvVarNotFound(var_name.to_string()))?;
            line_result.push_str(&value);

            last_end = whole.end();
        }

        line_result.push_str(&line[last_end..]);
        result.push_str(&line_result);
        result.push('\n');
    }

    if !input.ends_with('\n') && result.ends_with('\n') {
        result.pop();
    }

    Ok(result)
}

pub(crate) fn default_true() -> bool {
    true
}
