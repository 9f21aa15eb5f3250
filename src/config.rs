use crate::error::{Result, SdkError};
use crate::primitives::Address;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_MESSAGE_PREFIX: &str = "\x19Ethereum Signed Message:\n";

#[derive(Debug, Deserialize, Clone, Serialize, Default)]
pub struct AppConfig {
    pub keeper: KeeperConfig,
    pub metadata: ServiceConfig,
    pub consumption: ServiceConfig,
    pub secret_store: ServiceConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
pub struct KeeperConfig {
    pub node_uri: String,
    pub poll_interval_ms: Option<u64>,
    pub receipt_poll_attempts: Option<u32>,
    pub gas_limit: Option<u64>,
    pub message_prefix: Option<String>,
    /// Contract name to deployed address.
    #[serde(default)]
    pub contracts: BTreeMap<String, Address>,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
pub struct ServiceConfig {
    pub uri: String,
    pub timeout_seconds: Option<u64>,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: Option<String>,
}

impl Default for KeeperConfig {
    fn default() -> Self {
        Self {
            node_uri: "http://localhost:8545".to_string(),
            poll_interval_ms: Some(500),
            receipt_poll_attempts: Some(120),
            gas_limit: None,
            message_prefix: None,
            contracts: BTreeMap::new(),
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            uri: "http://localhost:5000".to_string(),
            timeout_seconds: Some(30),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: Some("pretty".to_string()),
        }
    }
}

impl KeeperConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.unwrap_or(500))
    }

    pub fn message_prefix(&self) -> &str {
        self.message_prefix.as_deref().unwrap_or(DEFAULT_MESSAGE_PREFIX)
    }

    pub fn contract_address(&self, name: &str) -> Result<Address> {
        self.contracts
            .get(name)
            .copied()
            .ok_or_else(|| SdkError::Config(format!("No address configured for contract {}", name)))
    }
}

impl ServiceConfig {
    pub fn with_uri(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            ..Self::default()
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds.unwrap_or(30))
    }
}

impl AppConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config_str = std::fs::read_to_string(path)
            .map_err(|e| SdkError::Config(format!("Failed to read config file: {}", e)))?;

        let config: AppConfig = toml::from_str(&config_str)
            .map_err(|e| SdkError::Config(format!("Failed to parse config file: {}", e)))?;

        Ok(config)
    }

    pub fn load_with_env_overrides<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(keeper_url) = std::env::var("KEEPER_URL") {
            self.keeper.node_uri = keeper_url;
        }

        if let Ok(aquarius_url) = std::env::var("AQUARIUS_URL") {
            self.metadata.uri = aquarius_url;
        }

        if let Ok(brizo_url) = std::env::var("BRIZO_URL") {
            self.consumption.uri = brizo_url;
        }

        if let Ok(secret_store_url) = std::env::var("SECRET_STORE_URL") {
            self.secret_store.uri = secret_store_url;
        }

        if let Ok(log_level) = std::env::var("RUST_LOG") {
            self.logging.level = log_level;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.keeper.node_uri.is_empty() {
            return Err(SdkError::Config("Keeper node URI cannot be empty".to_string()));
        }

        if self.keeper.poll_interval_ms == Some(0) {
            return Err(SdkError::Config("Keeper poll interval cannot be 0".to_string()));
        }

        for (name, service) in [
            ("metadata", &self.metadata),
            ("consumption", &self.consumption),
            ("secret_store", &self.secret_store),
        ] {
            if service.uri.is_empty() {
                return Err(SdkError::Config(format!("{} URI cannot be empty", name)));
            }
        }

        if let Some(format) = &self.logging.format {
            if format != "json" && format != "pretty" {
                return Err(SdkError::Config(format!("Unknown log format '{}'", format)));
            }
        }

        Ok(())
    }

    pub fn is_json_logging(&self) -> bool {
        self.logging.format.as_deref() == Some("json")
    }
}

pub fn create_default_config_file<P: AsRef<Path>>(path: P) -> Result<()> {
    let default_config = AppConfig::default();
    let toml_str = toml::to_string_pretty(&default_config)
        .map_err(|e| SdkError::Config(format!("Failed to serialize default config: {}", e)))?;

    std::fs::write(path, toml_str)
        .map_err(|e| SdkError::Config(format!("Failed to write default config file: {}", e)))?;

    Ok(())
}
