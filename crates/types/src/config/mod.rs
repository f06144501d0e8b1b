//! Configuration types for the consortium network orchestrator.
//!
//! Configuration is loaded from TOML files and environment variables.
//! All config structs validate their values at construction time via
//! fallible builders. Post-deserialization validation is available via
//! the `validate()` method on each struct.

mod logging;
mod timeouts;

pub use logging::*;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use snafu::Snafu;
pub use timeouts::*;

/// Configuration error.
///
/// Returned when a configuration value is outside its valid range, violates
/// a cross-field constraint, or cannot be loaded.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ConfigError {
    /// A configuration value is invalid.
    #[snafu(display("invalid config: {message}"))]
    Validation {
        /// Description of the validation failure.
        message: String,
    },

    /// Configuration sources could not be read.
    #[snafu(display("failed to load config: {message}"))]
    Load {
        /// Description of the load failure.
        message: String,
    },

    /// Configuration could not be deserialized.
    #[snafu(display("failed to parse config: {message}"))]
    Parse {
        /// Description of the parse failure.
        message: String,
    },
}

/// Default governance API version appended to cluster requests.
fn default_api_version() -> String {
    "2024-07-01".to_string()
}

/// Top-level orchestrator configuration.
///
/// # Example
///
/// ```no_run
/// # use consortium_types::config::OrchestratorConfig;
/// let config = OrchestratorConfig::load(Some("orchestrator.toml")).expect("valid config");
/// assert!(!config.api_version.is_empty());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct OrchestratorConfig {
    /// Wait budgets for polls and commits.
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    /// Governance API version sent as the `api-version` query parameter.
    #[serde(default = "default_api_version")]
    pub api_version: String,
    /// Log level passed to newly created nodes.
    #[serde(default)]
    pub node_log_level: Option<String>,
    /// Logging setup.
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[bon::bon]
impl OrchestratorConfig {
    /// Creates a new orchestrator configuration with validation.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if any nested value is out of range.
    #[builder]
    pub fn new(
        #[builder(default)] timeouts: TimeoutConfig,
        #[builder(default = default_api_version(), into)] api_version: String,
        #[builder(into)] node_log_level: Option<String>,
        #[builder(default)] logging: LoggingConfig,
    ) -> Result<Self, ConfigError> {
        let config = Self { timeouts, api_version, node_log_level, logging };
        config.validate()?;
        Ok(config)
    }
}

impl OrchestratorConfig {
    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if any value is out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api_version.trim().is_empty() {
            return Err(ConfigError::Validation {
                message: "api_version must not be empty".to_string(),
            });
        }
        self.timeouts.validate()?;
        self.logging.validate()
    }

    /// Loads configuration from a file and environment variables.
    ///
    /// Supports TOML format. Environment variables override file values using
    /// the `CONSORTIUM__` prefix and `__` as the nesting separator
    /// (e.g. `CONSORTIUM__TIMEOUTS__NODE_STATE=90s`).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Load`] if a source cannot be read,
    /// [`ConfigError::Parse`] if the merged document does not deserialize, and
    /// [`ConfigError::Validation`] if a value is out of range.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let builder = config::Config::builder();

        let builder = if let Some(path) = path {
            builder.add_source(config::File::with_name(path))
        } else {
            builder
                .add_source(config::File::with_name("consortium").required(false))
                .add_source(config::File::with_name("/etc/consortium/config").required(false))
        };

        let builder = builder.add_source(
            config::Environment::with_prefix("CONSORTIUM").separator("__").try_parsing(true),
        );

        let merged =
            builder.build().map_err(|e| ConfigError::Load { message: e.to_string() })?;

        let config: Self =
            merged.try_deserialize().map_err(|e| ConfigError::Parse { message: e.to_string() })?;
        config.validate()?;
        Ok(config)
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            timeouts: TimeoutConfig::default(),
            api_version: default_api_version(),
            node_log_level: None,
            logging: LoggingConfig::default(),
        }
    }
}

/// Duration serialization using humantime format.
mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::{io::Write, time::Duration};

    use super::*;

    #[test]
    fn test_orchestrator_config_defaults_are_valid() {
        let config = OrchestratorConfig::builder().build().expect("defaults should be valid");
        assert_eq!(config.api_version, "2024-07-01");
        assert_eq!(config.timeouts, TimeoutConfig::default());
        assert!(config.node_log_level.is_none());
    }

    #[test]
    fn test_orchestrator_config_rejects_blank_api_version() {
        let result = OrchestratorConfig::builder().api_version("  ").build();
        assert!(matches!(result, Err(ConfigError::Validation { .. })));
    }

    #[test]
    fn test_load_from_toml_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
api_version = "2023-06-01-preview"
node_log_level = "Debug"

[timeouts]
node_state = "90s"
trust_commit = "4m"

[logging]
format = "json"
"#
        )
        .unwrap();

        let path = file.path().to_str().unwrap().to_string();
        let config = OrchestratorConfig::load(Some(&path)).unwrap();
        assert_eq!(config.api_version, "2023-06-01-preview");
        assert_eq!(config.node_log_level.as_deref(), Some("Debug"));
        assert_eq!(config.timeouts.node_state, Duration::from_secs(90));
        assert_eq!(config.timeouts.trust_commit, Duration::from_secs(240));
        assert_eq!(config.timeouts.certificate, Duration::from_secs(300));
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_load_rejects_invalid_timeouts() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[timeouts]
poll_interval = "10m"
"#
        )
        .unwrap();

        let path = file.path().to_str().unwrap().to_string();
        let result = OrchestratorConfig::load(Some(&path));
        assert!(matches!(result, Err(ConfigError::Validation { .. })), "got {result:?}");
    }

    #[test]
    fn test_load_missing_file_is_load_error() {
        let result = OrchestratorConfig::load(Some("/nonexistent/consortium-config"));
        assert!(matches!(result, Err(ConfigError::Load { .. })));
    }
}
