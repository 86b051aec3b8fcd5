// learn/estimate.rs

//! # Model Estimation and Hyperparameter Search
//!
//! This module orchestrates classifier fitting. Two models are fitted for every
//! training run:
//!
//! 1.  **Default model:** the classifier with its stock hyperparameters
//!     (logistic regression: ridge, `C = 1`; random forest: 100 trees, `sqrt`
//!     features per split, unlimited depth).
//!
//! 2.  **Searched model:** an exhaustive grid search scored by mean accuracy over
//!     stratified k-fold cross-validation, refitted on all training rows with
//!     the winning hyperparameters.
//!
//! Both are scored by AUC on the held-out test windows and the better one is
//! kept. Ties keep the default model.

use crate::learn::explain::Explainer;
use crate::learn::forest::{ForestParams, MaxFeatures, fit_forest};
use crate::learn::logistic::{LogisticParams, Penalty, fit_logistic};
use crate::learn::metrics::{ConfusionMatrix, DECISION_THRESHOLD, auc};
use crate::learn::model::{Classifier, ModelKind};
use itertools::iproduct;
use ndarray::{ArrayView1, ArrayView2, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// A comprehensive error type for the model estimation process.
#[derive(Error, Debug)]
pub enum EstimationError {
    #[error("A linear system solve failed. The penalized Hessian may be singular. Error: {0}")]
    LinearSystemSolveFailed(ndarray_linalg::error::LinalgError),

    #[error("The training set is empty.")]
    EmptyTrainingSet,

    #[error("Feature matrix has {rows} rows but {labels} labels were given.")]
    DimensionMismatch { rows: usize, labels: usize },

    #[error("Training labels contain a single class; both outcomes are needed to fit a classifier.")]
    SingleClass,

    #[error("Invalid hyperparameter: {0}")]
    InvalidParameter(String),

    #[error(
        "Cannot build {folds} stratified folds: the largest class has only {largest_class} rows."
    )]
    TooFewRowsForFolds { folds: usize, largest_class: usize },

    #[error("The hyperparameter grid for {0:?} is empty.")]
    EmptyGrid(ModelKind),
}

/// Hyperparameters of either classifier family.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "model", rename_all = "lowercase")]
pub enum Hyperparameters {
    Logistic(LogisticParams),
    Forest(ForestParams),
}

impl Hyperparameters {
    /// Stock hyperparameters of `kind`.
    pub fn defaults(kind: ModelKind, seed: u64) -> Self {
        match kind {
            ModelKind::LogisticRegression => Hyperparameters::Logistic(LogisticParams::default()),
            ModelKind::RandomForest => Hyperparameters::Forest(ForestParams {
                seed,
                ..ForestParams::default()
            }),
        }
    }

    pub fn kind(&self) -> ModelKind {
        match self {
            Hyperparameters::Logistic(_) => ModelKind::LogisticRegression,
            Hyperparameters::Forest(_) => ModelKind::RandomForest,
        }
    }

    pub fn fit(
        &self,
        x: ArrayView2<f64>,
        y: ArrayView1<f64>,
    ) -> Result<Classifier, EstimationError> {
        match self {
            Hyperparameters::Logistic(params) => fit_logistic(x, y, params).map(Classifier::Logistic),
            Hyperparameters::Forest(params) => fit_forest(x, y, params).map(Classifier::Forest),
        }
    }
}

impl fmt::Display for Hyperparameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Hyperparameters::Logistic(p) => write!(f, "LR({p})"),
            Hyperparameters::Forest(p) => write!(f, "RF({p})"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogisticGrid {
    pub penalties: Vec<Penalty>,
    pub c_values: Vec<f64>,
    pub max_iter: usize,
}

impl Default for LogisticGrid {
    fn default() -> Self {
        Self {
            penalties: vec![Penalty::L1, Penalty::L2],
            c_values: vec![0.001, 0.01, 0.1, 1.0, 10.0, 100.0, 1000.0],
            max_iter: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForestGrid {
    pub n_estimators: Vec<usize>,
    pub max_features: Vec<MaxFeatures>,
    pub max_depth: Vec<usize>,
}

impl Default for ForestGrid {
    fn default() -> Self {
        Self {
            n_estimators: vec![500, 600],
            max_features: vec![MaxFeatures::Sqrt, MaxFeatures::Log2, MaxFeatures::Fraction(0.33)],
            max_depth: vec![3, 5, 7, 9, 11],
        }
    }
}

/// Search space and cross-validation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchGrid {
    pub logistic: LogisticGrid,
    pub forest: ForestGrid,
    pub cv_folds: usize,
    /// Seed for forest bootstraps.
    pub seed: u64,
}

impl Default for SearchGrid {
    fn default() -> Self {
        Self {
            logistic: LogisticGrid::default(),
            forest: ForestGrid::default(),
            cv_folds: 10,
            seed: 0,
        }
    }
}

impl SearchGrid {
    /// All hyperparameter combinations for `kind`, in grid order.
    pub fn candidates(&self, kind: ModelKind) -> Vec<Hyperparameters> {
        match kind {
            ModelKind::LogisticRegression => {
                iproduct!(&self.logistic.penalties, &self.logistic.c_values)
                    .map(|(&penalty, &c)| {
                        Hyperparameters::Logistic(LogisticParams {
                            penalty,
                            c,
                            max_iter: self.logistic.max_iter,
                            ..LogisticParams::default()
                        })
                    })
                    .collect()
            }
            ModelKind::RandomForest => iproduct!(
                &self.forest.n_estimators,
                &self.forest.max_features,
                &self.forest.max_depth
            )
            .map(|(&n_estimators, &max_features, &max_depth)| {
                Hyperparameters::Forest(ForestParams {
                    n_estimators,
                    max_features,
                    max_depth: Some(max_depth),
                    seed: self.seed,
                    ..ForestParams::default()
                })
            })
            .collect(),
        }
    }
}

/// Test-fold row indices for stratified k-fold cross-validation without
/// shuffling. Rows of each class are dealt to folds in contiguous runs whose
/// sizes balance the class counts across folds.
pub fn stratified_folds(
    y: ArrayView1<f64>,
    n_folds: usize,
) -> Result<Vec<Vec<usize>>, EstimationError> {
    if n_folds < 2 {
        return Err(EstimationError::InvalidParameter(format!(
            "cross-validation needs at least 2 folds, got {n_folds}"
        )));
    }
    let labels: Vec<usize> = y.iter().map(|&v| usize::from(v > 0.5)).collect();
    let counts = [
        labels.iter().filter(|&&l| l == 0).count(),
        labels.iter().filter(|&&l| l == 1).count(),
    ];
    let largest_class = counts[0].max(counts[1]);
    if n_folds > largest_class {
        return Err(EstimationError::TooFewRowsForFolds {
            folds: n_folds,
            largest_class,
        });
    }
    let smallest = counts.iter().copied().filter(|&c| c > 0).min().unwrap_or(0);
    if smallest < n_folds {
        log::warn!(
            "The least populated class has only {smallest} rows, fewer than the {n_folds} folds."
        );
    }

    // Fold i takes every n_folds-th entry of the sorted labels starting at i.
    let sorted: Vec<usize> = (0..counts[0]).map(|_| 0).chain((0..counts[1]).map(|_| 1)).collect();
    let mut allocation = vec![[0usize; 2]; n_folds];
    for (position, &label) in sorted.iter().enumerate() {
        allocation[position % n_folds][label] += 1;
    }

    let mut folds = vec![Vec::new(); n_folds];
    for class in 0..2 {
        let mut assigned = (0..n_folds).flat_map(|f| std::iter::repeat_n(f, allocation[f][class]));
        for (row, &label) in labels.iter().enumerate() {
            if label == class {
                if let Some(fold) = assigned.next() {
                    folds[fold].push(row);
                }
            }
        }
    }
    for fold in &mut folds {
        fold.sort_unstable();
    }
    Ok(folds)
}

fn accuracy(classifier: &Classifier, x: ArrayView2<f64>, y: ArrayView1<f64>) -> f64 {
    let p = classifier.predict_proba(x);
    ConfusionMatrix::at_threshold(y, p.view(), DECISION_THRESHOLD)
        .accuracy()
        .unwrap_or(0.0)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateScore {
    pub params: Hyperparameters,
    pub mean_accuracy: f64,
}

/// Result of a cross-validated grid search.
#[derive(Debug, Clone)]
pub struct SearchOutcome {
    pub best: Hyperparameters,
    pub best_score: f64,
    pub scores: Vec<CandidateScore>,
    /// The best candidate refitted on all rows.
    pub refit: Classifier,
}

/// Scores every candidate by mean cross-validated accuracy and refits the best.
pub fn grid_search(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    candidates: &[Hyperparameters],
    n_folds: usize,
) -> Result<SearchOutcome, EstimationError> {
    let Some(first) = candidates.first() else {
        return Err(EstimationError::InvalidParameter(
            "no hyperparameter candidates to search".to_string(),
        ));
    };
    let folds = stratified_folds(y, n_folds)?;
    let splits: Vec<(Vec<usize>, &Vec<usize>)> = folds
        .iter()
        .map(|test| {
            let train = (0..y.len()).filter(|i| test.binary_search(i).is_err()).collect();
            (train, test)
        })
        .collect();

    log::info!(
        "Grid search over {} candidates with {} folds ({} fits)",
        candidates.len(),
        n_folds,
        candidates.len() * n_folds
    );

    let scores: Vec<CandidateScore> = candidates
        .par_iter()
        .map(|params| -> Result<CandidateScore, EstimationError> {
            let mut total = 0.0;
            for (train, test) in &splits {
                let x_train = x.select(Axis(0), train);
                let y_train = y.select(Axis(0), train);
                let model = params.fit(x_train.view(), y_train.view())?;
                let x_test = x.select(Axis(0), test);
                let y_test = y.select(Axis(0), test);
                total += accuracy(&model, x_test.view(), y_test.view());
            }
            let mean_accuracy = total / splits.len() as f64;
            log::debug!("{params}: mean CV accuracy {mean_accuracy:.4}");
            Ok(CandidateScore {
                params: *params,
                mean_accuracy,
            })
        })
        .collect::<Result<_, _>>()?;

    let mut best = CandidateScore {
        params: *first,
        mean_accuracy: f64::NEG_INFINITY,
    };
    for score in &scores {
        if score.mean_accuracy > best.mean_accuracy {
            best = score.clone();
        }
    }
    log::info!(
        "Best parameters: {} (mean CV accuracy {:.4})",
        best.params,
        best.mean_accuracy
    );

    let refit = best.params.fit(x, y)?;
    Ok(SearchOutcome {
        best: best.params,
        best_score: best.mean_accuracy,
        scores,
        refit,
    })
}

/// The classifier kept after comparing the default and searched models.
#[derive(Debug, Clone)]
pub struct TrainingOutcome {
    pub classifier: Classifier,
    pub params: Hyperparameters,
    /// AUC of the kept classifier on the test windows.
    pub test_auc: f64,
    pub base_auc: f64,
    pub optimized_auc: f64,
    pub search: SearchOutcome,
    pub explainer: Explainer,
}

/// Fits default and grid-searched classifiers on the training windows and keeps
/// whichever scores the higher AUC on the test windows.
pub fn train_model(
    x_train: ArrayView2<f64>,
    y_train: ArrayView1<f64>,
    x_test: ArrayView2<f64>,
    y_test: ArrayView1<f64>,
    kind: ModelKind,
    grid: &SearchGrid,
) -> Result<TrainingOutcome, EstimationError> {
    if x_train.nrows() == 0 {
        return Err(EstimationError::EmptyTrainingSet);
    }
    if x_train.nrows() != y_train.len() {
        return Err(EstimationError::DimensionMismatch {
            rows: x_train.nrows(),
            labels: y_train.len(),
        });
    }
    let positives = y_train.iter().filter(|&&v| v > 0.5).count();
    if positives == 0 || positives == y_train.len() {
        return Err(EstimationError::SingleClass);
    }
    let candidates = grid.candidates(kind);
    if candidates.is_empty() {
        return Err(EstimationError::EmptyGrid(kind));
    }

    log::info!(
        "Training {kind:?} on {} windows ({positives} positive)",
        y_train.len()
    );
    let search = grid_search(x_train, y_train, &candidates, grid.cv_folds)?;

    let base_params = Hyperparameters::defaults(kind, grid.seed);
    let base = base_params.fit(x_train, y_train)?;
    let base_auc = auc(y_test, base.predict_proba(x_test).view());
    log::info!("Performance on test set with default model ({base_params}): AUC {base_auc:.4}");

    let optimized_auc = auc(y_test, search.refit.predict_proba(x_test).view());
    log::info!(
        "Performance on test set with optimized model ({}): AUC {optimized_auc:.4}",
        search.best
    );
    if optimized_auc > 0.0 {
        log::info!(
            "Improvement of {:.2}%.",
            100.0 * (optimized_auc - base_auc) / optimized_auc
        );
    }

    let (classifier, params) = if optimized_auc > base_auc {
        (search.refit.clone(), search.best)
    } else {
        (base, base_params)
    };
    let explainer = Explainer::new(&classifier, x_train);

    Ok(TrainingOutcome {
        classifier,
        params,
        test_auc: base_auc.max(optimized_auc),
        base_auc,
        optimized_auc,
        search,
        explainer,
    })
}
