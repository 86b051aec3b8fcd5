//! # Random Forest Classifier
//!
//! Bagged CART trees grown on Gini impurity. Each tree sees a bootstrap sample
//! of the rows and a random subset of `max_features` candidate features at
//! every split; if none of those admits a split, further features are tried
//! until one does. Trees are grown in parallel, each from its own seeded RNG, so
//! a forest is reproducible for a given seed regardless of thread count.
//!
//! Trees are stored as flat node arrays, which keeps prediction a tight loop and
//! lets the fitted forest serialize to TOML without nesting.

use crate::learn::estimate::EstimationError;
use ndarray::{Array1, ArrayView1, ArrayView2, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of candidate features examined per split.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum MaxFeatures {
    Sqrt,
    Log2,
    Fraction(f64),
    All,
}

impl MaxFeatures {
    pub fn resolve(&self, n_features: usize) -> usize {
        let n = n_features as f64;
        let raw = match *self {
            MaxFeatures::Sqrt => n.sqrt().floor() as usize,
            MaxFeatures::Log2 => n.log2().floor() as usize,
            MaxFeatures::Fraction(f) => (f * n).floor() as usize,
            MaxFeatures::All => n_features,
        };
        raw.clamp(1, n_features.max(1))
    }
}

impl fmt::Display for MaxFeatures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MaxFeatures::Sqrt => f.write_str("sqrt"),
            MaxFeatures::Log2 => f.write_str("log2"),
            MaxFeatures::Fraction(v) => write!(f, "{v}"),
            MaxFeatures::All => f.write_str("all"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ForestParams {
    pub n_estimators: usize,
    pub max_features: MaxFeatures,
    /// `None` grows every tree until its leaves are pure or too small to split.
    pub max_depth: Option<usize>,
    pub min_samples_split: usize,
    pub seed: u64,
}

impl Default for ForestParams {
    fn default() -> Self {
        Self {
            n_estimators: 100,
            max_features: MaxFeatures::Sqrt,
            max_depth: None,
            min_samples_split: 2,
            seed: 0,
        }
    }
}

impl fmt::Display for ForestParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "n_estimators={}, max_features={}, max_depth={}",
            self.n_estimators,
            self.max_features,
            self.max_depth
                .map_or_else(|| "none".to_string(), |d| d.to_string())
        )
    }
}

/// One node of a flattened tree. Leaves have `left == right == 0`, which no
/// child can be because the root sits at index 0.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub feature: usize,
    pub threshold: f64,
    pub left: usize,
    pub right: usize,
    /// Fraction of positive training rows that reached the node.
    pub value: f64,
    pub samples: usize,
}

impl Node {
    fn leaf(value: f64, samples: usize) -> Self {
        Self {
            feature: 0,
            threshold: 0.0,
            left: 0,
            right: 0,
            value,
            samples,
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.left == 0 && self.right == 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionTree {
    pub nodes: Vec<Node>,
}

impl DecisionTree {
    /// Node indices visited by `row`, root first, leaf last.
    pub fn decision_path(&self, row: ArrayView1<f64>) -> Vec<usize> {
        let mut path = vec![0];
        let mut current = 0;
        while !self.nodes[current].is_leaf() {
            let node = &self.nodes[current];
            current = if row[node.feature] <= node.threshold {
                node.left
            } else {
                node.right
            };
            path.push(current);
        }
        path
    }

    pub fn predict_row(&self, row: ArrayView1<f64>) -> f64 {
        let mut current = 0;
        loop {
            let node = &self.nodes[current];
            if node.is_leaf() {
                return node.value;
            }
            current = if row[node.feature] <= node.threshold {
                node.left
            } else {
                node.right
            };
        }
    }

    pub fn depth(&self) -> usize {
        fn walk(nodes: &[Node], index: usize) -> usize {
            let node = &nodes[index];
            if node.is_leaf() {
                0
            } else {
                1 + walk(nodes, node.left).max(walk(nodes, node.right))
            }
        }
        walk(&self.nodes, 0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RandomForest {
    pub trees: Vec<DecisionTree>,
    pub n_features: usize,
    /// Mean decrease in impurity, normalized to sum to one.
    pub feature_importances: Vec<f64>,
}

impl RandomForest {
    pub fn predict_proba(&self, x: ArrayView2<f64>) -> Array1<f64> {
        let n_trees = self.trees.len().max(1) as f64;
        let probs: Vec<f64> = x
            .axis_iter(Axis(0))
            .into_par_iter()
            .map(|row| self.trees.iter().map(|t| t.predict_row(row)).sum::<f64>() / n_trees)
            .collect();
        Array1::from_vec(probs)
    }
}

/// Grows a forest on labels in {0, 1}.
pub fn fit_forest(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    params: &ForestParams,
) -> Result<RandomForest, EstimationError> {
    let (n, p) = x.dim();
    if n == 0 {
        return Err(EstimationError::EmptyTrainingSet);
    }
    if n != y.len() {
        return Err(EstimationError::DimensionMismatch {
            rows: n,
            labels: y.len(),
        });
    }
    if params.n_estimators == 0 {
        return Err(EstimationError::InvalidParameter(
            "n_estimators must be at least 1".to_string(),
        ));
    }
    if let MaxFeatures::Fraction(f) = params.max_features {
        if !(f > 0.0 && f <= 1.0) {
            return Err(EstimationError::InvalidParameter(format!(
                "max_features fraction must lie in (0, 1], got {f}"
            )));
        }
    }

    log::debug!("Growing random forest ({params}) on {n} rows x {p} features");
    let grown: Vec<(DecisionTree, Vec<f64>)> = (0..params.n_estimators)
        .into_par_iter()
        .map(|t| {
            let mut rng = StdRng::seed_from_u64(params.seed.wrapping_add(t as u64));
            let bootstrap: Vec<usize> = (0..n).map(|_| rng.gen_range(0..n)).collect();
            internal::grow_tree(x, y, bootstrap, params, &mut rng)
        })
        .collect();

    let mut importances = vec![0.0; p];
    let mut trees = Vec::with_capacity(grown.len());
    for (tree, tree_importance) in grown {
        let total: f64 = tree_importance.iter().sum();
        if total > 0.0 {
            for (acc, v) in importances.iter_mut().zip(&tree_importance) {
                *acc += v / total;
            }
        }
        trees.push(tree);
    }
    let total: f64 = importances.iter().sum();
    if total > 0.0 {
        importances.iter_mut().for_each(|v| *v /= total);
    }

    Ok(RandomForest {
        trees,
        n_features: p,
        feature_importances: importances,
    })
}

mod internal {
    use super::*;

    fn gini(positives: f64, total: f64) -> f64 {
        if total <= 0.0 {
            return 0.0;
        }
        let q = positives / total;
        2.0 * q * (1.0 - q)
    }

    struct Split {
        feature: usize,
        threshold: f64,
        /// Weighted impurity of the two children, `n_l * g_l + n_r * g_r`.
        child_impurity: f64,
    }

    /// Best threshold on one feature, or `None` when the feature is constant.
    fn best_split_on(
        x: ArrayView2<f64>,
        y: ArrayView1<f64>,
        rows: &mut [usize],
        feature: usize,
        total_positive: f64,
    ) -> Option<Split> {
        if rows.len() < 2 {
            return None;
        }
        rows.sort_by(|&a, &b| x[[a, feature]].total_cmp(&x[[b, feature]]));
        let n = rows.len() as f64;
        let mut best: Option<Split> = None;
        let mut left_positive = 0.0;
        for k in 0..rows.len() - 1 {
            left_positive += y[rows[k]];
            let here = x[[rows[k], feature]];
            let next = x[[rows[k + 1], feature]];
            if here >= next {
                continue;
            }
            let n_left = (k + 1) as f64;
            let n_right = n - n_left;
            let impurity = n_left * gini(left_positive, n_left)
                + n_right * gini(total_positive - left_positive, n_right);
            if best.as_ref().is_none_or(|b| impurity < b.child_impurity) {
                let mut threshold = here + (next - here) / 2.0;
                if threshold >= next {
                    threshold = here;
                }
                best = Some(Split {
                    feature,
                    threshold,
                    child_impurity: impurity,
                });
            }
        }
        best
    }

    /// Grows one tree; returns it with its unnormalized impurity decreases.
    pub(super) fn grow_tree(
        x: ArrayView2<f64>,
        y: ArrayView1<f64>,
        bootstrap: Vec<usize>,
        params: &ForestParams,
        rng: &mut StdRng,
    ) -> (DecisionTree, Vec<f64>) {
        let p = x.ncols();
        let mtry = params.max_features.resolve(p);
        let mut importances = vec![0.0; p];
        let mut nodes = vec![Node::leaf(0.0, 0)];
        let mut features: Vec<usize> = (0..p).collect();
        let mut stack: Vec<(usize, Vec<usize>, usize)> = vec![(0, bootstrap, 0)];

        while let Some((index, mut rows, depth)) = stack.pop() {
            let total = rows.len() as f64;
            let positive: f64 = rows.iter().map(|&i| y[i]).sum();
            let value = if total > 0.0 { positive / total } else { 0.0 };
            nodes[index] = Node::leaf(value, rows.len());

            let node_impurity = gini(positive, total);
            let depth_reached = params.max_depth.is_some_and(|d| depth >= d);
            if depth_reached || rows.len() < params.min_samples_split || node_impurity <= 0.0 {
                continue;
            }

            features.shuffle(rng);
            let mut best: Option<Split> = None;
            for (visited, &feature) in features.iter().enumerate() {
                if visited >= mtry && best.is_some() {
                    break;
                }
                if let Some(split) = best_split_on(x, y, &mut rows, feature, positive) {
                    if best
                        .as_ref()
                        .is_none_or(|b| split.child_impurity < b.child_impurity)
                    {
                        best = Some(split);
                    }
                }
            }
            let Some(split) = best else {
                continue;
            };

            importances[split.feature] += total * node_impurity - split.child_impurity;
            let (left_rows, right_rows): (Vec<usize>, Vec<usize>) = rows
                .iter()
                .copied()
                .partition(|&i| x[[i, split.feature]] <= split.threshold);

            let left = nodes.len();
            let right = left + 1;
            nodes.push(Node::leaf(0.0, 0));
            nodes.push(Node::leaf(0.0, 0));
            nodes[index] = Node {
                feature: split.feature,
                threshold: split.threshold,
                left,
                right,
                value,
                samples: rows.len(),
            };
            stack.push((right, right_rows, depth + 1));
            stack.push((left, left_rows, depth + 1));
        }

        (DecisionTree { nodes }, importances)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::learn::metrics::auc;
    use ndarray::{Array2, array};
    use rand_distr::StandardNormal;

    /// Label depends on the sign agreement of the first two features (XOR),
    /// the third feature is noise.
    fn xor_data(n: usize, seed: u64) -> (Array2<f64>, Array1<f64>) {
        let mut rng = StdRng::seed_from_u64(seed);
        let x = Array2::from_shape_fn((n, 3), |_| rng.sample::<f64, _>(StandardNormal));
        let y = x
            .rows()
            .into_iter()
            .map(|r| if (r[0] > 0.0) == (r[1] > 0.0) { 1.0 } else { 0.0 })
            .collect();
        (x, y)
    }

    #[test]
    fn max_features_resolution() {
        assert_eq!(MaxFeatures::Sqrt.resolve(20), 4);
        assert_eq!(MaxFeatures::Log2.resolve(20), 4);
        assert_eq!(MaxFeatures::Fraction(0.33).resolve(20), 6);
        assert_eq!(MaxFeatures::Fraction(0.01).resolve(20), 1);
        assert_eq!(MaxFeatures::All.resolve(20), 20);
        assert_eq!(MaxFeatures::Log2.resolve(1), 1);
    }

    #[test]
    fn single_tree_separates_a_threshold() {
        let x = array![[0.0], [1.0], [2.0], [3.0]];
        let y = array![0.0, 0.0, 1.0, 1.0];
        let params = ForestParams {
            n_estimators: 1,
            max_features: MaxFeatures::All,
            ..ForestParams::default()
        };
        let mut rng = StdRng::seed_from_u64(0);
        let (tree, importances) =
            internal::grow_tree(x.view(), y.view(), vec![0, 1, 2, 3], &params, &mut rng);
        assert_eq!(tree.nodes.len(), 3);
        assert_eq!(tree.nodes[0].threshold, 1.5);
        assert_eq!(tree.predict_row(array![0.5].view()), 0.0);
        assert_eq!(tree.predict_row(array![2.5].view()), 1.0);
        assert_eq!(tree.decision_path(array![2.5].view()), vec![0, 2]);
        // Root impurity 4 * 0.5 drops to zero.
        assert_eq!(importances, vec![2.0]);
    }

    #[test]
    fn forest_learns_interaction() {
        let (x, y) = xor_data(600, 1);
        let (x_test, y_test) = xor_data(300, 2);
        let params = ForestParams {
            n_estimators: 50,
            max_features: MaxFeatures::All,
            ..ForestParams::default()
        };
        let forest = fit_forest(x.view(), y.view(), &params).unwrap();
        let p = forest.predict_proba(x_test.view());
        assert!(auc(y_test.view(), p.view()) > 0.9);
        assert!(p.iter().all(|&v| (0.0..=1.0).contains(&v)));

        let total: f64 = forest.feature_importances.iter().sum();
        assert!((total - 1.0).abs() < 1e-9);
        assert!(forest.feature_importances[2] < forest.feature_importances[0]);
        assert!(forest.feature_importances[2] < forest.feature_importances[1]);
    }

    #[test]
    fn depth_limit_is_respected() {
        let (x, y) = xor_data(200, 4);
        let params = ForestParams {
            n_estimators: 5,
            max_depth: Some(3),
            ..ForestParams::default()
        };
        let forest = fit_forest(x.view(), y.view(), &params).unwrap();
        assert!(forest.trees.iter().all(|t| t.depth() <= 3));
    }

    #[test]
    fn same_seed_same_forest() {
        let (x, y) = xor_data(150, 9);
        let params = ForestParams {
            n_estimators: 8,
            seed: 42,
            ..ForestParams::default()
        };
        let a = fit_forest(x.view(), y.view(), &params).unwrap();
        let b = fit_forest(x.view(), y.view(), &params).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn rejects_invalid_parameters() {
        let x = array![[0.0], [1.0]];
        let y = array![0.0, 1.0];
        let params = ForestParams {
            n_estimators: 0,
            ..ForestParams::default()
        };
        assert!(matches!(
            fit_forest(x.view(), y.view(), &params),
            Err(EstimationError::InvalidParameter(_))
        ));
        let params = ForestParams {
            max_features: MaxFeatures::Fraction(1.5),
            ..ForestParams::default()
        };
        assert!(fit_forest(x.view(), y.view(), &params).is_err());
    }
}
