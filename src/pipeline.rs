//! # End-to-end Run Orchestration
//!
//! `run` drives every stage from the raw measurement table to the written
//! artifacts:
//!
//! 1.  Load the table and split patients into train / validation / test.
//! 2.  Fit standardization and imputation medians on the training patients only,
//!     then apply them to all three partitions.
//! 3.  Sample labeled feature windows from each partition.
//! 4.  Optionally rebalance the training windows, train and select a classifier
//!     against the test windows, then evaluate and explain it on the validation
//!     windows.
//!
//! `sample` stops after step 3 and writes the feature tables; `infer` scores a
//! previously written feature table with a saved model.

use crate::cohort::data::{Cohort, DataError, load_measurements_with_separator};
use crate::cohort::scale::{Standardizer, restrict_to_variables};
use crate::cohort::split::{PatientSplit, SplitError, is_disjoint, split_patients};
use crate::config::{ConfigError, PipelineConfig};
use crate::features::sampling::{
    LabeledSamples, SamplingError, SamplingReport, prepare_feature_vectors,
};
use crate::features::window::{FeatureError, ImputationReference};
use crate::files::{
    FileError, read_feature_table, write_attributions, write_labeled_samples, write_pr_curve,
    write_predictions,
};
use crate::learn::balance::{BalanceError, balance};
use crate::learn::estimate::{EstimationError, Hyperparameters, train_model};
use crate::learn::metrics::{ConfusionMatrix, DECISION_THRESHOLD, evaluate_probabilities};
use crate::learn::model::{Classifier, ModelError, ModelKind, TrainedClassifier};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const MODEL_FILE: &str = "model.toml";
pub const REPORT_FILE: &str = "report.toml";
pub const PREDICTIONS_FILE: &str = "predictions.tsv";
pub const PR_CURVE_FILE: &str = "pr_curve.tsv";
pub const ATTRIBUTIONS_FILE: &str = "attributions.tsv";

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Failed to load measurements: {0}")]
    Data(#[from] DataError),
    #[error("Failed to split patients: {0}")]
    Split(#[from] SplitError),
    #[error("Failed to build features: {0}")]
    Feature(#[from] FeatureError),
    #[error("Failed to sample windows: {0}")]
    Sampling(#[from] SamplingError),
    #[error("Failed to rebalance training windows: {0}")]
    Balance(#[from] BalanceError),
    #[error("Model estimation failed: {0}")]
    Estimation(#[from] EstimationError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    File(#[from] FileError),
    #[error("Failed to serialize the run report: {0}")]
    Report(#[from] toml::ser::Error),
    #[error("Failed to create output directory '{path}': {source}")]
    OutputDir {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("Failed to write '{path}': {source}")]
    Write {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("Patient partitions overlap; a patient was assigned to more than one split.")]
    OverlappingSplits,
    #[error(
        "Feature columns do not match the model. Expected [{expected}], found [{found}]."
    )]
    FeatureMismatch { expected: String, found: String },
}

/// Windows sampled from each partition plus the fitted preprocessing.
#[derive(Debug, Clone)]
pub struct PreparedSamples {
    pub variables: Vec<String>,
    pub standardizer: Option<Standardizer>,
    pub reference: ImputationReference,
    pub train: LabeledSamples,
    pub val: LabeledSamples,
    pub test: LabeledSamples,
    pub reports: SplitReports,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitReports {
    pub train: SamplingReport,
    pub val: SamplingReport,
    pub test: SamplingReport,
}

/// Summary written to `report.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub model: ModelKind,
    pub params: Hyperparameters,
    pub variables: Vec<String>,
    pub test_auc: f64,
    pub base_auc: f64,
    pub optimized_auc: f64,
    pub validation_auc: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sensitivity: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub specificity: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub precision: Option<f64>,
    pub confusion: ConfusionMatrix,
    pub windows: SplitReports,
    pub top_features: Vec<RankedFeature>,
    /// Mean decrease in Gini impurity per feature; forests only.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub impurity_importances: Vec<ImpurityImportance>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedFeature {
    pub name: String,
    pub mean_abs_attribution: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImpurityImportance {
    pub name: String,
    pub importance: f64,
}

/// Forest impurity importances by feature, largest first. Empty for other classifiers.
fn impurity_importances(classifier: &Classifier, names: &[String]) -> Vec<ImpurityImportance> {
    let Classifier::Forest(forest) = classifier else {
        return Vec::new();
    };
    names
        .iter()
        .zip(&forest.feature_importances)
        .map(|(name, &importance)| ImpurityImportance {
            name: name.clone(),
            importance,
        })
        .sorted_by(|a, b| b.importance.total_cmp(&a.importance))
        .collect()
}

/// Measurement variables to model: the configured list, or every variable in the
/// data in natural order when none are configured.
fn requested_variables(config: &PipelineConfig, cohort: &Cohort) -> Vec<String> {
    if !config.variables.is_empty() {
        return config.variables.iter().cloned().unique().collect();
    }
    cohort
        .patients
        .iter()
        .flat_map(|p| p.measurements.iter().map(|m| m.variable.clone()))
        .unique()
        .sorted_by(|a, b| natord::compare(a, b))
        .collect()
}

/// Keeps the variables that the training partition actually measures, in the
/// requested order.
fn variables_present_in(train: &Cohort, requested: &[String]) -> Vec<String> {
    let present: ahash::AHashSet<&str> = train
        .patients
        .iter()
        .flat_map(|p| p.measurements.iter().map(|m| m.variable.as_str()))
        .collect();
    requested
        .iter()
        .filter(|v| {
            let found = present.contains(v.as_str());
            if !found {
                log::warn!("{v} not in training set; it is dropped everywhere.");
            }
            found
        })
        .cloned()
        .collect()
}

/// Loads, splits, preprocesses and samples the configured cohort.
pub fn prepare_samples(config: &PipelineConfig) -> Result<PreparedSamples, PipelineError> {
    config.validate()?;
    config.sampling.validate()?;
    let cohort = load_measurements_with_separator(&config.data_path, config.separator_byte())?;
    let requested = requested_variables(config, &cohort);
    log::info!(
        "Loaded {} patients with {} measurements; {} variables requested",
        cohort.len(),
        cohort.num_measurements(),
        requested.len()
    );

    let split = split_patients(&cohort, config.val_share, config.test_share, config.seed)?;
    if !is_disjoint(&split) {
        return Err(PipelineError::OverlappingSplits);
    }

    let variables = variables_present_in(&split.train, &requested);
    if variables.is_empty() {
        return Err(FeatureError::NoVariables.into());
    }

    let (split, standardizer) = if config.normalize {
        let standardizer = Standardizer::fit(&split.train, &variables);
        let scaled = PatientSplit {
            train: standardizer.transform(&split.train),
            val: standardizer.transform(&split.val),
            test: standardizer.transform(&split.test),
        };
        (scaled, Some(standardizer))
    } else {
        let restricted = PatientSplit {
            train: restrict_to_variables(&split.train, &variables),
            val: restrict_to_variables(&split.val, &variables),
            test: restrict_to_variables(&split.test, &variables),
        };
        (restricted, None)
    };

    let reference = ImputationReference::from_training(&split.train, &variables)?;

    log::info!("Sampling training windows");
    let (train, train_report) =
        prepare_feature_vectors(&split.train, &variables, &reference, &config.sampling)?;
    log::info!("Sampling validation windows");
    let (val, val_report) =
        prepare_feature_vectors(&split.val, &variables, &reference, &config.sampling)?;
    log::info!("Sampling test windows");
    let (test, test_report) =
        prepare_feature_vectors(&split.test, &variables, &reference, &config.sampling)?;

    Ok(PreparedSamples {
        variables,
        standardizer,
        reference,
        train,
        val,
        test,
        reports: SplitReports {
            train: train_report,
            val: val_report,
            test: test_report,
        },
    })
}

fn create_output_dir(dir: &str) -> Result<PathBuf, PipelineError> {
    fs::create_dir_all(dir).map_err(|source| PipelineError::OutputDir {
        path: dir.to_string(),
        source,
    })?;
    Ok(PathBuf::from(dir))
}

/// Samples all partitions and writes `{train,val,test}_features.tsv`.
pub fn sample(config: &PipelineConfig) -> Result<PreparedSamples, PipelineError> {
    let prepared = prepare_samples(config)?;
    let out = create_output_dir(&config.output_dir)?;
    for (name, samples) in [
        ("train", &prepared.train),
        ("val", &prepared.val),
        ("test", &prepared.test),
    ] {
        let path = out.join(format!("{name}_features.tsv"));
        write_labeled_samples(&path, samples)?;
        log::info!("Wrote {} {name} windows to '{}'", samples.len(), path.display());
    }
    Ok(prepared)
}

/// Runs the full pipeline and writes the model, report, validation predictions,
/// precision-recall curve and feature attributions.
pub fn run(config: &PipelineConfig) -> Result<RunReport, PipelineError> {
    let prepared = prepare_samples(config)?;
    let out = create_output_dir(&config.output_dir)?;

    let train = balance(&prepared.train, config.balancing, config.seed)?;
    let outcome = train_model(
        train.x.view(),
        train.y.view(),
        prepared.test.x.view(),
        prepared.test.y.view(),
        config.model,
        &config.search,
    )?;

    let val = &prepared.val;
    log::info!("Evaluating on {} validation windows", val.len());
    let probabilities = outcome.classifier.predict_proba(val.x.view());
    let evaluation = evaluate_probabilities(val.y.view(), probabilities.view());

    let attributions = outcome.explainer.explain(val.x.view());
    let ranked = attributions.ranked(&val.feature_names);
    for (name, importance) in ranked.iter().take(10) {
        log::info!("  {name}: {importance:.4}");
    }
    let impurity = impurity_importances(&outcome.classifier, &train.feature_names);
    if !impurity.is_empty() {
        log::info!("Top forest impurity importances:");
        for entry in impurity.iter().take(10) {
            log::info!("  {}: {:.4}", entry.name, entry.importance);
        }
    }

    let artifact = TrainedClassifier {
        feature_names: train.feature_names.clone(),
        params: outcome.params,
        classifier: outcome.classifier,
    };
    let model_path = out.join(MODEL_FILE);
    artifact.save(&model_path.to_string_lossy())?;
    log::info!("Model saved to '{}'", model_path.display());

    write_predictions(
        &out.join(PREDICTIONS_FILE),
        Some(val.patient_ids.as_slice()),
        Some(val.y.view()),
        probabilities.view(),
        DECISION_THRESHOLD,
    )?;
    write_pr_curve(&out.join(PR_CURVE_FILE), &evaluation.curve)?;
    write_attributions(&out.join(ATTRIBUTIONS_FILE), &ranked)?;

    let report = RunReport {
        model: config.model,
        params: outcome.params,
        variables: prepared.variables.clone(),
        test_auc: outcome.test_auc,
        base_auc: outcome.base_auc,
        optimized_auc: outcome.optimized_auc,
        validation_auc: evaluation.auc,
        sensitivity: evaluation.confusion.sensitivity(),
        specificity: evaluation.confusion.specificity(),
        precision: evaluation.confusion.precision(),
        confusion: evaluation.confusion,
        windows: prepared.reports,
        top_features: ranked
            .iter()
            .map(|(name, value)| RankedFeature {
                name: name.to_string(),
                mean_abs_attribution: *value,
            })
            .collect(),
        impurity_importances: impurity,
    };
    write_report(&out.join(REPORT_FILE), &report)?;
    Ok(report)
}

fn write_report(path: &Path, report: &RunReport) -> Result<(), PipelineError> {
    let text = toml::to_string_pretty(report)?;
    fs::write(path, text).map_err(|source| PipelineError::Write {
        path: path.display().to_string(),
        source,
    })
}

/// Scores a feature table written by `sample` (or laid out the same way) with a
/// saved model. Returns the predicted probabilities.
pub fn infer(
    features_path: &Path,
    model_path: &str,
    output_path: &Path,
) -> Result<ndarray::Array1<f64>, PipelineError> {
    let model = TrainedClassifier::load(model_path)?;
    let table = read_feature_table(features_path)?;
    if table.feature_names != model.feature_names {
        return Err(PipelineError::FeatureMismatch {
            expected: model.feature_names.join(", "),
            found: table.feature_names.join(", "),
        });
    }
    log::info!(
        "Scoring {} windows from '{}' with {}",
        table.x.nrows(),
        features_path.display(),
        model.params
    );
    let probabilities = model.predict_proba(table.x.view())?;
    if let Some(labels) = &table.labels {
        evaluate_probabilities(labels.view(), probabilities.view());
    }
    write_predictions(
        output_path,
        table.patient_ids.as_deref(),
        table.labels.as_ref().map(|l| l.view()),
        probabilities.view(),
        DECISION_THRESHOLD,
    )?;
    log::info!("Predictions saved to '{}'", output_path.display());
    Ok(probabilities)
}
