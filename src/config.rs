use std::path::Path;

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml, Yaml};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::discovery::ParameterMap;
use crate::error::ConfigError;

/// Environment variable prefix; nested keys are separated with `__`.
pub const ENV_PREFIX: &str = "DBAUTOSTART_";

/// Class name that selects [`crate::trigger::XQueryStartupTrigger`].
pub const XQUERY_TRIGGER_CLASS: &str = "XQueryStartupTrigger";

/// Configuration for the autostart runner
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub startup: StartupConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default level for this crate's targets, overridden by `RUST_LOG`
    #[serde(default = "default_level")]
    pub level: String,

    /// `compact` or `json`
    #[serde(default = "default_format")]
    pub format: String,
}

fn default_level() -> String {
    "info".to_string()
}

fn default_format() -> String {
    "compact".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            format: default_format(),
        }
    }
}

/// The `<startup>` section: triggers run once the database has booted
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StartupConfig {
    #[serde(default)]
    pub triggers: Vec<TriggerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerConfig {
    /// Trigger implementation, short or fully qualified class name
    pub class: String,

    #[serde(default, rename = "parameter")]
    pub parameters: Vec<Parameter>,
}

/// A single `name = value` trigger parameter. Values are kept untyped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub value: Value,
}

impl TriggerConfig {
    /// Group the parameters by name. Names keep the order of their first
    /// appearance and values keep their configuration order.
    pub fn parameter_map(&self) -> ParameterMap {
        let mut map = ParameterMap::new();
        for parameter in &self.parameters {
            map.entry(parameter.name.clone())
                .or_default()
                .push(parameter.value.clone());
        }
        map
    }

    pub fn is_xquery_trigger(&self) -> bool {
        self.class == XQUERY_TRIGGER_CLASS
            || self.class.ends_with(&format!(".{}", XQUERY_TRIGGER_CLASS))
    }
}

impl Config {
    /// Load configuration from defaults, an optional TOML or YAML file and
    /// `DBAUTOSTART_*` environment variables, in increasing priority. A given
    /// file must exist; it is not searched for in parent directories.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));

        if let Some(path) = path {
            figment = match path.extension().and_then(|e| e.to_str()) {
                Some("yaml") | Some("yml") => figment.merge(Yaml::file_exact(path)),
                _ => figment.merge(Toml::file_exact(path)),
            };
        }

        let config: Config = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document on top of the defaults, without consulting the
    /// environment.
    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        let config: Config = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::string(toml))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !matches!(self.logging.format.as_str(), "compact" | "json") {
            return Err(ConfigError::Invalid {
                key: "logging.format".to_string(),
                reason: format!("must be 'compact' or 'json', got '{}'", self.logging.format),
            });
        }

        for (idx, trigger) in self.startup.triggers.iter().enumerate() {
            if trigger.class.trim().is_empty() {
                return Err(ConfigError::Invalid {
                    key: format!("startup.triggers[{}].class", idx),
                    reason: "must not be empty".to_string(),
                });
            }
        }

        Ok(())
    }

    /// Configured triggers handled by the XQuery startup trigger.
    pub fn xquery_triggers(&self) -> impl Iterator<Item = &TriggerConfig> {
        self.startup
            .triggers
            .iter()
            .filter(|t| t.is_xquery_trigger())
    }
}
