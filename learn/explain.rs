//! # Feature Attributions
//!
//! Per-window additive explanations of a fitted classifier. Every row's
//! attributions satisfy `base_value + sum(values[row]) == model_output(row)`:
//!
//! - **Logistic regression:** exact linear attributions on the log-odds scale,
//!   `w_j * (x_j - mean_j)` against the training-set feature means.
//! - **Random forest:** path attributions on the probability scale. Walking a
//!   row down a tree, each split credits its feature with the change in node
//!   positive fraction; contributions are averaged over trees.

use crate::learn::forest::RandomForest;
use crate::learn::model::Classifier;
use ndarray::{Array1, Array2, ArrayView2, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Scale on which attributions sum to the model output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputScale {
    LogOdds,
    Probability,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Explainer {
    Linear {
        intercept: f64,
        coefficients: Array1<f64>,
        background_mean: Array1<f64>,
    },
    Tree(RandomForest),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Attributions {
    pub base_value: f64,
    /// One row per explained window, one column per feature.
    pub values: Array2<f64>,
    pub scale: OutputScale,
}

impl Explainer {
    /// Builds an explainer for `classifier`. Linear attributions are taken
    /// relative to the column means of `background`.
    pub fn new(classifier: &Classifier, background: ArrayView2<f64>) -> Self {
        match classifier {
            Classifier::Logistic(model) => {
                let coefficients = Array1::from_vec(model.coefficients.clone());
                let background_mean = background
                    .mean_axis(Axis(0))
                    .unwrap_or_else(|| Array1::zeros(coefficients.len()));
                Explainer::Linear {
                    intercept: model.intercept,
                    coefficients,
                    background_mean,
                }
            }
            Classifier::Forest(forest) => Explainer::Tree(forest.clone()),
        }
    }

    pub fn explain(&self, x: ArrayView2<f64>) -> Attributions {
        match self {
            Explainer::Linear {
                intercept,
                coefficients,
                background_mean,
            } => {
                let values = (&x - background_mean) * coefficients;
                Attributions {
                    base_value: intercept + coefficients.dot(background_mean),
                    values,
                    scale: OutputScale::LogOdds,
                }
            }
            Explainer::Tree(forest) => path_attributions(forest, x),
        }
    }
}

fn path_attributions(forest: &RandomForest, x: ArrayView2<f64>) -> Attributions {
    let n_trees = forest.trees.len().max(1) as f64;
    let base_value = forest
        .trees
        .iter()
        .map(|t| t.nodes.first().map_or(0.0, |root| root.value))
        .sum::<f64>()
        / n_trees;

    let rows: Vec<Vec<f64>> = x
        .axis_iter(Axis(0))
        .into_par_iter()
        .map(|row| {
            let mut contributions = vec![0.0; x.ncols()];
            for tree in &forest.trees {
                let path = tree.decision_path(row);
                for pair in path.windows(2) {
                    let parent = &tree.nodes[pair[0]];
                    let child = &tree.nodes[pair[1]];
                    contributions[parent.feature] += (child.value - parent.value) / n_trees;
                }
            }
            contributions
        })
        .collect();

    let mut values = Array2::zeros((x.nrows(), x.ncols()));
    for (mut target, row) in values.axis_iter_mut(Axis(0)).zip(rows) {
        target.assign(&Array1::from_vec(row));
    }
    Attributions {
        base_value,
        values,
        scale: OutputScale::Probability,
    }
}

impl Attributions {
    /// Mean absolute attribution per feature.
    pub fn mean_abs(&self) -> Array1<f64> {
        self.values
            .mapv(f64::abs)
            .mean_axis(Axis(0))
            .unwrap_or_else(|| Array1::zeros(self.values.ncols()))
    }

    /// Features ordered by decreasing mean absolute attribution.
    pub fn ranked<'a>(&self, feature_names: &'a [String]) -> Vec<(&'a str, f64)> {
        let mut ranked: Vec<(&str, f64)> = feature_names
            .iter()
            .map(String::as_str)
            .zip(self.mean_abs())
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
        ranked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::learn::forest::{ForestParams, fit_forest};
    use crate::learn::logistic::LogisticModel;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn linear_attributions_sum_to_log_odds() {
        let model = LogisticModel {
            intercept: 0.3,
            coefficients: vec![2.0, -1.0],
            converged: true,
            iterations: 1,
        };
        let background = array![[0.0, 1.0], [2.0, 3.0]];
        let classifier = Classifier::Logistic(model.clone());
        let explainer = Explainer::new(&classifier, background.view());
        let x = array![[1.0, 1.0], [3.0, -2.0]];
        let attributions = explainer.explain(x.view());
        assert_eq!(attributions.scale, OutputScale::LogOdds);
        // Means are (1, 2): base = 0.3 + 2 - 2.
        assert_abs_diff_eq!(attributions.base_value, 0.3, epsilon = 1e-12);
        let log_odds = model.decision_function(x.view());
        for (row, expected) in attributions.values.rows().into_iter().zip(log_odds) {
            assert_abs_diff_eq!(attributions.base_value + row.sum(), expected, epsilon = 1e-12);
        }
    }

    #[test]
    fn tree_attributions_sum_to_probability() {
        let x = array![
            [0.0, 5.0],
            [1.0, 4.0],
            [2.0, 3.0],
            [3.0, 2.0],
            [4.0, 1.0],
            [5.0, 0.0],
            [6.0, 1.0],
            [7.0, 2.0]
        ];
        let y = array![0.0, 0.0, 0.0, 1.0, 1.0, 1.0, 1.0, 0.0];
        let forest = fit_forest(
            x.view(),
            y.view(),
            &ForestParams {
                n_estimators: 15,
                seed: 4,
                ..ForestParams::default()
            },
        )
        .unwrap();
        let probabilities = forest.predict_proba(x.view());
        let attributions = Explainer::new(&Classifier::Forest(forest), x.view()).explain(x.view());
        assert_eq!(attributions.scale, OutputScale::Probability);
        for (row, expected) in attributions.values.rows().into_iter().zip(probabilities) {
            assert_abs_diff_eq!(attributions.base_value + row.sum(), expected, epsilon = 1e-9);
        }
    }

    #[test]
    fn ranking_orders_by_mean_absolute_value() {
        let attributions = Attributions {
            base_value: 0.0,
            values: array![[0.1, -0.9], [-0.3, 0.5]],
            scale: OutputScale::LogOdds,
        };
        let names = vec!["AGE".to_string(), "BMI".to_string()];
        let ranked = attributions.ranked(&names);
        assert_eq!(ranked[0].0, "BMI");
        assert_abs_diff_eq!(ranked[0].1, 0.7, epsilon = 1e-12);
        assert_abs_diff_eq!(ranked[1].1, 0.2, epsilon = 1e-12);
    }
}
