use std::collections::HashSet;
use std::{env, fs, path::Path};

use anyhow::Context;
use serde::Deserialize;

use crate::core::error::HorseError;
use crate::core::queue::QueueOptions;
use crate::core::rider::validate_queue_name;

pub const ENV_CONFIG: &str = "HORSEMQ_CONFIG";
pub const ENV_LOG_LEVEL: &str = "HORSEMQ_LOG_LEVEL";
pub const ENV_AUTO_QUEUE_CREATION: &str = "HORSEMQ_AUTO_QUEUE_CREATION";

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BrokerConfig {
    pub auto_queue_creation: bool,
    pub auto_destroy_interval_ms: u64,
    pub log_level: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            auto_queue_creation: true,
            auto_destroy_interval_ms: 1000,
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AuthConfig {
    /// Client ids allowed to create, remove and reconfigure queues. Empty
    /// means everyone.
    pub admins: Vec<String>,
}

/// A queue declared at start-up.
#[derive(Debug, Deserialize, Clone)]
pub struct QueueDeclaration {
    pub name: String,
    #[serde(flatten)]
    pub options: QueueOptions,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub broker: BrokerConfig,
    pub auth: AuthConfig,
    pub queue_defaults: QueueOptions,
    pub queues: Vec<QueueDeclaration>,
}

impl Config {
    /// Applies `HORSEMQ_*` overrides read through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), HorseError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(level) = lookup(ENV_LOG_LEVEL) {
            self.broker.log_level = level;
        }
        if let Some(v) = lookup(ENV_AUTO_QUEUE_CREATION) {
            self.broker.auto_queue_creation = match v.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                other => {
                    return Err(HorseError::Config(format!(
                        "{ENV_AUTO_QUEUE_CREATION}: expected a boolean, got '{other}'"
                    )))
                }
            };
        }
        Ok(())
    }

    /// Checks queue names and rejects duplicate declarations.
    pub fn validate(&self) -> Result<(), HorseError> {
        let mut seen = HashSet::new();
        for queue in &self.queues {
            validate_queue_name(&queue.name)?;
            if !seen.insert(queue.name.as_str()) {
                return Err(HorseError::Config(format!("queue '{}' declared twice", queue.name)));
            }
        }
        Ok(())
    }
}

/// Reads a TOML file, applies environment overrides and validates the result.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, anyhow::Error> {
    let path = path.as_ref();
    let raw: String =
        fs::read_to_string(path).with_context(|| format!("reading config {}", path.display()))?;
    let mut config: Config = toml::from_str(&raw)?;
    config.apply_overrides(|key| env::var(key).ok())?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn overrides_replace_file_values() {
        let mut cfg = Config::default();
        let vars: HashMap<&str, &str> = [(ENV_LOG_LEVEL, "debug"), (ENV_AUTO_QUEUE_CREATION, "off")].into();
        cfg.apply_overrides(|k| vars.get(k).map(|v| v.to_string())).unwrap();

        assert_eq!(cfg.broker.log_level, "debug");
        assert!(!cfg.broker.auto_queue_creation);
    }

    #[test]
    fn bad_boolean_override_is_rejected() {
        let mut cfg = Config::default();
        let err = cfg
            .apply_overrides(|k| (k == ENV_AUTO_QUEUE_CREATION).then(|| "maybe".to_string()))
            .unwrap_err();
        assert!(matches!(err, HorseError::Config(_)));
    }

    #[test]
    fn duplicate_queue_declarations_fail_validation() {
        let cfg: Config = toml::from_str(
            r#"
            [[queues]]
            name = "orders"

            [[queues]]
            name = "orders"
            queue_type = "pull"
            "#,
        )
        .unwrap();
        assert!(cfg.validate().is_err());
    }
}
