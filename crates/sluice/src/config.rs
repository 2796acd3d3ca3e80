//! Runner configuration file
//!
//! One file configures one source: either a `spool:` or a `cdc:` section,
//! plus optional `sink:` and `run:` settings. `${VAR}` and `${VAR:-default}`
//! are expanded from the environment before parsing.
//!
//! ```yaml
//! name: incoming
//! spool:
//!   files_directory: ${SPOOL_DIR:-/var/spool/incoming}
//!   file_name_pattern: "*.csv"
//!   data_format:
//!     format: DELIMITED
//!     header_line: WITH_HEADER
//! sink:
//!   format: json
//! ```

use crate::sink::SinkConfig;
use anyhow::{bail, Context, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sluice_cdc::CdcConfig;
use sluice_spool::SpoolConfig;
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;
use validator::Validate;

/// Pattern: ${VAR} or ${VAR:-default}
static ENV_VAR_REGEX: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*)(?::-([^}]*))?\}")
        .expect("env var regex pattern is invalid - this is a bug")
});

/// Root configuration
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
pub struct SluiceConfig {
    /// Source name; keys the persisted cursor
    #[serde(default = "default_name")]
    pub name: String,

    /// Directory spooler
    #[serde(default)]
    pub spool: Option<SpoolConfig>,

    /// Change-data-capture source
    #[serde(default)]
    pub cdc: Option<CdcConfig>,

    /// Output settings
    #[serde(default)]
    pub sink: SinkConfig,

    /// Consumer loop settings
    #[serde(default)]
    pub run: RunSettings,
}

fn default_name() -> String {
    "sluice".to_string()
}

/// Consumer loop settings
#[derive(Debug, Clone, Deserialize, Serialize, Validate, JsonSchema)]
pub struct RunSettings {
    /// How long one poll waits for a batch (milliseconds)
    #[serde(default = "default_poll_timeout_ms")]
    #[validate(range(min = 1, max = 600000))]
    pub poll_timeout_ms: u64,

    /// Stop after this many batches
    #[serde(default)]
    pub max_batches: Option<u64>,

    /// Stop at the first poll that returns nothing or an empty batch
    #[serde(default)]
    pub stop_when_idle: bool,
}

fn default_poll_timeout_ms() -> u64 {
    1000
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            poll_timeout_ms: default_poll_timeout_ms(),
            max_batches: None,
            stop_when_idle: false,
        }
    }
}

impl RunSettings {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

/// The configured source
#[derive(Debug, Clone)]
pub enum Engine {
    Spool(SpoolConfig),
    Cdc(CdcConfig),
}

impl SluiceConfig {
    /// Load, expand, parse and validate a config file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_yaml(&content)
    }

    /// Parse and validate YAML after environment expansion.
    pub fn from_yaml(content: &str) -> Result<Self> {
        let expanded = Self::expand_env_vars(content);
        let config: Self =
            serde_yaml::from_str(&expanded).context("Failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// Expand environment variables in the format ${VAR} or ${VAR:-default}
    pub fn expand_env_vars(content: &str) -> String {
        ENV_VAR_REGEX
            .replace_all(content, |caps: &regex::Captures| {
                let var_name = &caps[1];
                let default = caps.get(2).map(|m| m.as_str());
                std::env::var(var_name).unwrap_or_else(|_| default.unwrap_or("").to_string())
            })
            .to_string()
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            bail!("'name' must not be empty");
        }
        self.run
            .validate()
            .map_err(|e| anyhow::anyhow!("run settings: {}", e))?;
        match self.engine()? {
            Engine::Spool(spool) => spool.check().context("spool config")?,
            Engine::Cdc(cdc) => cdc.check().context("cdc config")?,
        }
        Ok(())
    }

    /// The one configured source.
    pub fn engine(&self) -> Result<Engine> {
        match (&self.spool, &self.cdc) {
            (Some(spool), None) => Ok(Engine::Spool(spool.clone())),
            (None, Some(cdc)) => Ok(Engine::Cdc(cdc.clone())),
            (Some(_), Some(_)) => bail!("configure either 'spool' or 'cdc', not both"),
            (None, None) => bail!("no source configured: add a 'spool' or 'cdc' section"),
        }
    }
}
