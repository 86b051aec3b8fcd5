use crate::learn::estimate::Hyperparameters;
use crate::learn::forest::RandomForest;
use crate::learn::logistic::LogisticModel;
use crate::learn::metrics::DECISION_THRESHOLD;
use ndarray::{Array1, ArrayView2};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use thiserror::Error;

/// Classifier family selected for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelKind {
    #[serde(rename = "LR")]
    LogisticRegression,
    #[serde(rename = "RF")]
    RandomForest,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Classifier {
    Logistic(LogisticModel),
    Forest(RandomForest),
}

impl Classifier {
    pub fn n_features(&self) -> usize {
        match self {
            Classifier::Logistic(model) => model.coefficients.len(),
            Classifier::Forest(forest) => forest.n_features,
        }
    }

    /// Probability of the positive class per row.
    pub fn predict_proba(&self, x: ArrayView2<f64>) -> Array1<f64> {
        match self {
            Classifier::Logistic(model) => model.predict_proba(x),
            Classifier::Forest(forest) => forest.predict_proba(x),
        }
    }

    /// Hard 0/1 predictions at the default decision threshold.
    pub fn predict(&self, x: ArrayView2<f64>) -> Array1<f64> {
        self.predict_proba(x)
            .mapv(|p| if p > DECISION_THRESHOLD { 1.0 } else { 0.0 })
    }
}

/// A custom error type for model loading, saving, and prediction.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to parse model file: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("Failed to serialize model: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error(
        "Model was trained on {expected} features but the input has {found}. The feature layout must match training."
    )]
    MismatchedFeatureCount { expected: usize, found: usize },

    #[error("Model file lists {names} feature names for a classifier with {features} features.")]
    InconsistentModel { names: usize, features: usize },
}

/// The persisted artifact of a run: the classifier plus everything needed to
/// score new feature windows with it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainedClassifier {
    pub feature_names: Vec<String>,
    pub params: Hyperparameters,
    pub classifier: Classifier,
}

impl TrainedClassifier {
    /// Saves the model to a human-readable TOML file.
    pub fn save(&self, path: &str) -> Result<(), ModelError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut writer = BufWriter::new(File::create(path)?);
        writer.write_all(toml_string.as_bytes())?;
        writer.flush()?;
        Ok(())
    }

    /// Loads a model from a TOML file and checks that its parts agree.
    pub fn load(path: &str) -> Result<Self, ModelError> {
        let toml_string = std::fs::read_to_string(path)?;
        let model: Self = toml::from_str(&toml_string)?;
        if model.feature_names.len() != model.classifier.n_features() {
            return Err(ModelError::InconsistentModel {
                names: model.feature_names.len(),
                features: model.classifier.n_features(),
            });
        }
        Ok(model)
    }

    pub fn predict_proba(&self, x: ArrayView2<f64>) -> Result<Array1<f64>, ModelError> {
        let expected = self.classifier.n_features();
        if x.ncols() != expected {
            return Err(ModelError::MismatchedFeatureCount {
                expected,
                found: x.ncols(),
            });
        }
        Ok(self.classifier.predict_proba(x))
    }
}
