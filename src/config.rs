//! Application configuration.
//!
//! Layered, lowest priority first: built-in defaults, a TOML/JSON/YAML file
//! (`cryptotrader.toml` unless `--config` is given), then environment
//! variables such as `CRYPTOTRADER__RISK__MAX_OPEN_POSITIONS=3`.

use std::path::Path;

use ::config::{Config, Environment, File};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::allocation::AllocationConfig;
use crate::bot::BotConfig;
use crate::broker::{PaperBrokerConfig, RestBrokerConfig};
use crate::execution::ExecutionConfig;
use crate::risk::RiskConfig;
use crate::signals::ScorerConfig;
use crate::trading::SizingConfig;

/// Config file looked up in the working directory when none is given.
pub const DEFAULT_CONFIG_FILE: &str = "cryptotrader";

const ENV_PREFIX: &str = "CRYPTOTRADER";
const ENV_SEPARATOR: &str = "__";

/// Every component's configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database_url: String,
    pub bot: BotConfig,
    pub scorer: ScorerConfig,
    pub execution: ExecutionConfig,
    pub risk: RiskConfig,
    pub sizing: SizingConfig,
    pub allocation: AllocationConfig,
    pub paper: PaperBrokerConfig,
    pub rest: RestBrokerConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite:./cryptotrader.db?mode=rwc".to_string(),
            bot: BotConfig::default(),
            scorer: ScorerConfig::default(),
            execution: ExecutionConfig::default(),
            risk: RiskConfig::default(),
            sizing: SizingConfig::default(),
            allocation: AllocationConfig::default(),
            paper: PaperBrokerConfig::default(),
            rest: RestBrokerConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration, requiring `path` to exist when given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let defaults = Config::try_from(&AppConfig::default())
            .context("Failed to serialize default configuration")?;

        let file = match path {
            Some(p) => File::from(p).required(true),
            None => File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };

        let settings = Config::builder()
            .add_source(defaults)
            .add_source(file)
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator(ENV_SEPARATOR)
                    .separator(ENV_SEPARATOR)
                    .list_separator(",")
                    .with_list_parse_key("bot.symbols")
                    .with_list_parse_key("paper.symbols")
                    .with_list_parse_key("rest.symbols")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to load configuration")?;

        settings
            .try_deserialize()
            .context("Invalid configuration")
    }

    /// Copy safe to print: secrets are masked.
    pub fn redacted(&self) -> Self {
        let mut config = self.clone();
        if config.rest.api_key.is_some() {
            config.rest.api_key = Some("********".to_string());
        }
        config
    }
}
