//! Logic for loading configuration in to an object model
use std::collections::HashSet;
use std::time::Duration;

use displaydoc::Display;
use schemars::JsonSchema;
use schemars::r#gen::SchemaSettings;
use schemars::schema::RootSchema;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::operation::Operation;

const DEFAULT_HOOKS_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_RETRY_MAX_ATTEMPTS: u32 = 40;
const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(50);
const DEFAULT_PLAN_CACHE_TTL: Duration = Duration::from_secs(60 * 60);
const DEFAULT_PLAN_CACHE_CAPACITY: u64 = 1024;
const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(5);

/// Configuration error.
#[derive(Debug, Error, Display)]
#[non_exhaustive]
pub enum ConfigurationError {
    /// could not deserialize configuration: {0}
    DeserializeConfigError(String),

    /// {message}: {error}
    InvalidConfiguration {
        message: &'static str,
        error: String,
    },
}

/// The configuration for the gateway.
///
/// Can be created through `serde::Deserialize` from various formats,
/// or inline in Rust code with `serde_json::json!` and `serde_json::from_value`.
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields, default)]
pub struct Configuration {
    /// Connection to the external hook server.
    pub hooks: Hooks,

    /// Prepared plan cache.
    pub plan_cache: PlanCache,

    /// Streaming responses (live queries and subscriptions).
    pub streaming: Streaming,

    /// Operations exposed as HTTP endpoints.
    pub operations: Vec<Operation>,
}

impl Configuration {
    /// Parse and validate a YAML configuration document.
    pub fn from_yaml_str(raw_yaml: &str) -> Result<Self, ConfigurationError> {
        let configuration: Configuration = if raw_yaml.trim().is_empty() {
            Configuration::default()
        } else {
            serde_yaml::from_str(raw_yaml)
                .map_err(|e| ConfigurationError::DeserializeConfigError(e.to_string()))?
        };
        configuration.validate()?;
        Ok(configuration)
    }

    /// Parse and validate a JSON configuration document.
    pub fn from_json_value(value: serde_json::Value) -> Result<Self, ConfigurationError> {
        let configuration: Configuration = serde_json::from_value(value)
            .map_err(|e| ConfigurationError::DeserializeConfigError(e.to_string()))?;
        configuration.validate()?;
        Ok(configuration)
    }

    /// Checks the constraints serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let mut names = HashSet::new();
        for operation in &self.operations {
            if operation.name.is_empty() {
                return Err(ConfigurationError::InvalidConfiguration {
                    message: "operation name must not be empty",
                    error: operation.content.clone(),
                });
            }
            if !names.insert(operation.name.as_str()) {
                return Err(ConfigurationError::InvalidConfiguration {
                    message: "duplicate operation name",
                    error: operation.name.clone(),
                });
            }
            if operation.hooks.any_enabled() && self.hooks.url.as_deref().unwrap_or("").is_empty()
            {
                return Err(ConfigurationError::InvalidConfiguration {
                    message: "hooks are enabled but no hook server url is configured",
                    error: operation.name.clone(),
                });
            }
            if operation.live_query.enabled && operation.live_query.polling_interval.is_zero() {
                return Err(ConfigurationError::InvalidConfiguration {
                    message: "live query polling interval must be greater than zero",
                    error: operation.name.clone(),
                });
            }
        }
        if let Some(url) = self.hooks.url.as_deref().filter(|url| !url.is_empty()) {
            reqwest::Url::parse(url).map_err(|e| ConfigurationError::InvalidConfiguration {
                message: "invalid hook server url",
                error: e.to_string(),
            })?;
        }
        if self.plan_cache.capacity == 0 {
            return Err(ConfigurationError::InvalidConfiguration {
                message: "plan cache capacity must be greater than zero",
                error: "0".to_string(),
            });
        }
        Ok(())
    }
}

/// Generate the JSON schema for the configuration.
pub fn generate_config_schema() -> RootSchema {
    let settings = SchemaSettings::draft07().with(|s| {
        s.option_nullable = true;
        s.option_add_null_type = false;
        s.inline_subschemas = true;
    });
    let generator = settings.into_generator();
    generator.into_root_schema_for::<Configuration>()
}

/// Connection to the external hook server.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields, default)]
pub struct Hooks {
    /// Base URL of the hook server, hooks are called at `<url>/operation/<name>/<hook>`
    pub url: Option<String>,

    /// Timeout of a single hook call in human-readable format; defaults to 60s
    #[serde(
        deserialize_with = "humantime_serde::deserialize",
        serialize_with = "humantime_serde::serialize"
    )]
    #[schemars(with = "String")]
    pub timeout: Duration,

    /// Retry policy for transport failures
    pub retry: Retry,
}

impl Default for Hooks {
    fn default() -> Self {
        Self {
            url: None,
            timeout: DEFAULT_HOOKS_TIMEOUT,
            retry: Retry::default(),
        }
    }
}

/// Retry policy for hook calls.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields, default)]
pub struct Retry {
    /// Maximum number of retries after the first attempt; defaults to 40
    pub max_attempts: u32,

    /// Constant delay between attempts; defaults to 50ms
    #[serde(
        deserialize_with = "humantime_serde::deserialize",
        serialize_with = "humantime_serde::serialize"
    )]
    #[schemars(with = "String")]
    pub delay: Duration,
}

impl Default for Retry {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RETRY_MAX_ATTEMPTS,
            delay: DEFAULT_RETRY_DELAY,
        }
    }
}

/// Prepared plan cache.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields, default)]
pub struct PlanCache {
    /// Time to live of a prepared plan; defaults to 1h
    #[serde(
        deserialize_with = "humantime_serde::deserialize",
        serialize_with = "humantime_serde::serialize"
    )]
    #[schemars(with = "String")]
    pub ttl: Duration,

    /// Maximum number of prepared plans kept in memory
    pub capacity: u64,
}

impl Default for PlanCache {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_PLAN_CACHE_TTL,
            capacity: DEFAULT_PLAN_CACHE_CAPACITY,
        }
    }
}

/// Streaming responses.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields, default)]
pub struct Streaming {
    /// Interval of keep-alive pings on idle streams; 0s disables them. Defaults to 5s
    #[serde(
        deserialize_with = "humantime_serde::deserialize",
        serialize_with = "humantime_serde::serialize"
    )]
    #[schemars(with = "String")]
    pub ping_interval: Duration,
}

impl Streaming {
    pub(crate) fn ping_interval(&self) -> Option<Duration> {
        (!self.ping_interval.is_zero()).then_some(self.ping_interval)
    }
}

impl Default for Streaming {
    fn default() -> Self {
        Self {
            ping_interval: DEFAULT_PING_INTERVAL,
        }
    }
}

#[cfg(test)]
mod tests;
