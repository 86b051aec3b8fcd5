//! Run configuration read from a TOML file.
//!
//! Every field has a default, so a minimal configuration only names the input:
//!
//! ```toml
//! data_path = "measurements.tsv"
//! ```

use crate::features::sampling::SamplingPolicy;
use crate::learn::balance::BalanceStrategy;
use crate::learn::estimate::SearchGrid;
use crate::learn::model::ModelKind;
use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    /// Measurement table with ID, TIME, VARIABLE, VALUE, AGE and BMI columns.
    pub data_path: String,
    pub output_dir: String,
    /// Single-byte column separator of the input table.
    pub separator: char,
    /// Measurement variables to use. Empty selects every variable in the data.
    pub variables: Vec<String>,
    pub val_share: f64,
    pub test_share: f64,
    pub seed: u64,
    pub normalize: bool,
    pub sampling: SamplingPolicy,
    pub model: ModelKind,
    pub balancing: BalanceStrategy,
    pub search: SearchGrid,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            data_path: String::new(),
            output_dir: "vigil_output".to_string(),
            separator: '\t',
            variables: Vec::new(),
            val_share: 0.25,
            test_share: 0.2,
            seed: 0,
            normalize: true,
            sampling: SamplingPolicy::default(),
            model: ModelKind::RandomForest,
            balancing: BalanceStrategy::None,
            search: SearchGrid::default(),
        }
    }
}

impl PipelineConfig {
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_string(),
            source,
        })?;
        let config: Self = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.data_path.is_empty() {
            return Err(ConfigError::Invalid("data_path is required".to_string()));
        }
        if !self.separator.is_ascii() {
            return Err(ConfigError::Invalid(format!(
                "separator must be a single ASCII character, got '{}'",
                self.separator
            )));
        }
        if self.search.cv_folds < 2 {
            return Err(ConfigError::Invalid(format!(
                "search.cv_folds must be at least 2, got {}",
                self.search.cv_folds
            )));
        }
        Ok(())
    }

    pub fn separator_byte(&self) -> u8 {
        u8::try_from(self.separator).unwrap_or(b'\t')
    }
}
