//! Engine configuration.
//!
//! One TOML file groups every component's settings; sections left out fall
//! back to their defaults. See `config/default.toml`.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backtest::ExecutionConfig;
use crate::drift::{DriftConfig, DriftRegistry};
use crate::ensemble::CombinerConfig;
use crate::error::{EngineError, EngineResult};
use crate::metrics::MetricsConfig;
use crate::walkforward::{OrchestratorConfig, SplitConfig, WalkForwardOrchestrator};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid config: {0}")]
    Invalid(#[from] EngineError),
}

/// Settings for every component.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub splits: SplitConfig,
    #[serde(default)]
    pub combiner: CombinerConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub drift: DriftConfig,
}

impl EngineConfig {
    /// Load and validate a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.to_path_buf()));
        }
        Self::from_toml(&fs::read_to_string(path)?)
    }

    /// Parse and validate TOML text.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> EngineResult<()> {
        self.orchestrator().validate()?;
        self.drift.validate()
    }

    /// Orchestrator wired with these settings.
    pub fn orchestrator(&self) -> WalkForwardOrchestrator {
        WalkForwardOrchestrator::new()
            .with_split_config(self.splits.clone())
            .with_combiner_config(self.combiner.clone())
            .with_execution_config(self.execution.clone())
            .with_metrics_config(self.metrics.clone())
            .with_orchestrator_config(self.orchestrator.clone())
    }

    pub fn drift_registry(&self) -> EngineResult<DriftRegistry> {
        DriftRegistry::new(self.drift.clone())
    }
}
