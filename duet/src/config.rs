use std::{
    fs,
    path::{Path, PathBuf},
};

use clap::ValueEnum;
use duet_telemetry::TelemetryConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    composition::CompositionMode,
    cost::PrivacyCost,
    ledger::DEFAULT_EXHAUSTION_FLOOR,
};

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum ConfigFormat {
    Auto,
    Toml,
    Yaml,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {format:?} config: {details}")]
    Parse {
        format: ConfigFormat,
        details: String,
    },
    #[error("configuration invalid: {0}")]
    Validation(String),
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct DuetConfig {
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub mechanism: MechanismConfig,
    #[serde(default)]
    pub journal: JournalConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Defaults for ledgers created lazily on a dataset's first query.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct LedgerConfig {
    #[serde(default = "default_budget_epsilon")]
    pub default_epsilon: f64,
    #[serde(default)]
    pub default_delta: f64,
    #[serde(default)]
    pub composition: CompositionMode,
    #[serde(default = "default_exhaustion_floor")]
    pub exhaustion_floor: f64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            default_epsilon: default_budget_epsilon(),
            default_delta: 0.0,
            composition: CompositionMode::Basic,
            exhaustion_floor: default_exhaustion_floor(),
        }
    }
}

impl LedgerConfig {
    pub fn default_budget(&self) -> PrivacyCost {
        PrivacyCost {
            epsilon: self.default_epsilon,
            delta: self.default_delta,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct MechanismConfig {
    /// Fixed seed for reproducible noise. Leave unset outside tests and demos.
    #[serde(default)]
    pub noise_seed: Option<u64>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct JournalConfig {
    /// JSON-lines journal location; ledgers are memory-only when unset.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

const fn default_budget_epsilon() -> f64 {
    1.0
}

const fn default_exhaustion_floor() -> f64 {
    DEFAULT_EXHAUSTION_FLOOR
}

impl DuetConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let budget = self.ledger.default_budget();
        budget
            .validate()
            .map_err(|err| ConfigError::Validation(format!("ledger default budget: {err}")))?;
        if budget.epsilon <= 0.0 {
            return Err(ConfigError::Validation(
                "ledger default epsilon must be greater than zero".into(),
            ));
        }
        self.ledger
            .composition
            .validate()
            .map_err(|err| ConfigError::Validation(err.to_string()))?;
        if self.ledger.composition.slack() > 0.0 && self.ledger.composition.slack() >= budget.delta
        {
            return Err(ConfigError::Validation(
                "advanced composition slack must be smaller than the default delta".into(),
            ));
        }
        if !self.ledger.exhaustion_floor.is_finite() || self.ledger.exhaustion_floor < 0.0 {
            return Err(ConfigError::Validation(
                "exhaustion floor must be a non-negative number".into(),
            ));
        }
        if self.telemetry.flush_interval_ms == 0 {
            return Err(ConfigError::Validation(
                "telemetry flush interval must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    pub fn sample() -> Self {
        Self {
            ledger: LedgerConfig {
                default_epsilon: 1.0,
                default_delta: 1e-5,
                composition: CompositionMode::Advanced { slack: 1e-6 },
                exhaustion_floor: default_exhaustion_floor(),
            },
            mechanism: MechanismConfig {
                noise_seed: Some(7),
            },
            journal: JournalConfig::default(),
            telemetry: TelemetryConfig::sample("duet-sample"),
        }
    }
}

pub fn load_config(path: &Path, format: ConfigFormat) -> Result<DuetConfig, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_config(&contents, resolve_format(path, format))
}

pub fn parse_config(contents: &str, format: ConfigFormat) -> Result<DuetConfig, ConfigError> {
    let parse_error = |details: String| ConfigError::Parse { format, details };
    let config: DuetConfig = match format {
        ConfigFormat::Yaml => {
            serde_yaml::from_str(contents).map_err(|err| parse_error(err.to_string()))?
        }
        ConfigFormat::Toml | ConfigFormat::Auto => {
            toml::from_str(contents).map_err(|err| parse_error(err.to_string()))?
        }
    };
    config.validate()?;
    Ok(config)
}

fn resolve_format(path: &Path, format: ConfigFormat) -> ConfigFormat {
    match format {
        ConfigFormat::Auto => match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => ConfigFormat::Yaml,
            _ => ConfigFormat::Toml,
        },
        _ => format,
    }
}
