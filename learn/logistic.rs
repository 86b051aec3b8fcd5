//! # Penalized Logistic Regression
//!
//! Fits `C * sum(log-loss) + R(w)` with an unpenalized intercept, where `R` is
//! either `0.5 * ||w||^2` (ridge) or `||w||_1` (lasso). A larger `C` means weaker
//! regularization.
//!
//! - Ridge: damped Newton-Raphson on the full objective, solving the penalized
//!   Hessian system with `ndarray-linalg` and halving the step whenever the
//!   objective fails to decrease.
//! - Lasso: iteratively reweighted least squares, where each quadratic
//!   approximation is minimized by cyclic coordinate descent with soft
//!   thresholding.

use crate::learn::estimate::EstimationError;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, s};
use ndarray_linalg::Solve;
use serde::{Deserialize, Serialize};
use std::fmt;

const MAX_STEP_HALVINGS: usize = 30;
const MIN_IRLS_WEIGHT: f64 = 1e-5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Penalty {
    L1,
    L2,
}

impl fmt::Display for Penalty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Penalty::L1 => "l1",
            Penalty::L2 => "l2",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LogisticParams {
    pub penalty: Penalty,
    /// Inverse regularization strength.
    pub c: f64,
    pub max_iter: usize,
    pub tolerance: f64,
}

impl Default for LogisticParams {
    fn default() -> Self {
        Self {
            penalty: Penalty::L2,
            c: 1.0,
            max_iter: 1000,
            tolerance: 1e-6,
        }
    }
}

impl fmt::Display for LogisticParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "penalty={}, C={}", self.penalty, self.c)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogisticModel {
    pub intercept: f64,
    pub coefficients: Vec<f64>,
    pub converged: bool,
    pub iterations: usize,
}

impl LogisticModel {
    /// Linear predictor (log-odds) per row.
    pub fn decision_function(&self, x: ArrayView2<f64>) -> Array1<f64> {
        let w = ArrayView1::from(self.coefficients.as_slice());
        x.dot(&w) + self.intercept
    }

    pub fn predict_proba(&self, x: ArrayView2<f64>) -> Array1<f64> {
        self.decision_function(x).mapv(sigmoid)
    }
}

pub fn sigmoid(eta: f64) -> f64 {
    if eta >= 0.0 {
        1.0 / (1.0 + (-eta).exp())
    } else {
        let e = eta.exp();
        e / (1.0 + e)
    }
}

/// `log(1 + exp(eta))` without overflow.
fn softplus(eta: f64) -> f64 {
    if eta > 0.0 {
        eta + (-eta).exp().ln_1p()
    } else {
        eta.exp().ln_1p()
    }
}

/// Penalized objective at `beta = [intercept, w...]`.
fn objective(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    beta: &Array1<f64>,
    params: &LogisticParams,
) -> f64 {
    let eta = linear_predictor(x, beta);
    let loss: f64 = eta
        .iter()
        .zip(y.iter())
        .map(|(&e, &t)| softplus(e) - t * e)
        .sum();
    let w = beta.slice(s![1..]);
    let penalty = match params.penalty {
        Penalty::L2 => 0.5 * w.dot(&w),
        Penalty::L1 => w.iter().map(|v| v.abs()).sum(),
    };
    params.c * loss + penalty
}

fn linear_predictor(x: ArrayView2<f64>, beta: &Array1<f64>) -> Array1<f64> {
    x.dot(&beta.slice(s![1..])) + beta[0]
}

/// Fits a penalized logistic regression on labels in {0, 1}.
pub fn fit_logistic(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    params: &LogisticParams,
) -> Result<LogisticModel, EstimationError> {
    if x.nrows() == 0 {
        return Err(EstimationError::EmptyTrainingSet);
    }
    if x.nrows() != y.len() {
        return Err(EstimationError::DimensionMismatch {
            rows: x.nrows(),
            labels: y.len(),
        });
    }
    if !(params.c.is_finite() && params.c > 0.0) {
        return Err(EstimationError::InvalidParameter(format!(
            "C must be positive and finite, got {}",
            params.c
        )));
    }

    let (beta, converged, iterations) = match params.penalty {
        Penalty::L2 => internal::newton_ridge(x, y, params)?,
        Penalty::L1 => internal::irls_lasso(x, y, params),
    };
    if !converged {
        log::warn!(
            "Logistic regression ({params}) did not converge within {} iterations.",
            params.max_iter
        );
    }
    Ok(LogisticModel {
        intercept: beta[0],
        coefficients: beta.slice(s![1..]).to_vec(),
        converged,
        iterations,
    })
}

mod internal {
    use super::*;

    pub(super) fn newton_ridge(
        x: ArrayView2<f64>,
        y: ArrayView1<f64>,
        params: &LogisticParams,
    ) -> Result<(Array1<f64>, bool, usize), EstimationError> {
        let (n, p) = x.dim();
        let mut x_aug = Array2::ones((n, p + 1));
        x_aug.slice_mut(s![.., 1..]).assign(&x);

        let mut beta = Array1::<f64>::zeros(p + 1);
        let mut current = objective(x, y, &beta, params);

        for iter in 1..=params.max_iter {
            let prob = linear_predictor(x, &beta).mapv(sigmoid);
            let residual = &prob - &y;
            let mut gradient = x_aug.t().dot(&residual) * params.c;
            let mut ridge = beta.clone();
            ridge[0] = 0.0;
            gradient += &ridge;

            let curvature = prob.mapv(|q| (q * (1.0 - q)).max(1e-12) * params.c);
            let weighted = &x_aug * &curvature.view().insert_axis(Axis(1));
            let mut hessian = x_aug.t().dot(&weighted);
            for j in 1..=p {
                hessian[[j, j]] += 1.0;
            }
            hessian[[0, 0]] += 1e-10;

            let direction = hessian
                .solve(&gradient)
                .map_err(EstimationError::LinearSystemSolveFailed)?;

            let mut step = 1.0;
            let mut accepted = None;
            for _ in 0..MAX_STEP_HALVINGS {
                let trial = &beta - &(&direction * step);
                let value = objective(x, y, &trial, params);
                if value.is_finite() && value <= current {
                    accepted = Some((trial, value));
                    break;
                }
                step *= 0.5;
            }
            let Some((trial, value)) = accepted else {
                log::debug!("Step halving exhausted at iteration {iter}; keeping current estimate");
                return Ok((beta, true, iter));
            };

            let change = direction.iter().fold(0.0_f64, |m, d| m.max((d * step).abs()));
            log::debug!("Newton iteration {iter}: objective {value:.6e}, max step {change:.3e}");
            beta = trial;
            let relative = (current - value).abs() / current.abs().max(1.0);
            current = value;
            if change < params.tolerance || relative < 1e-14 {
                return Ok((beta, true, iter));
            }
        }
        Ok((beta, false, params.max_iter))
    }

    fn soft_threshold(value: f64, threshold: f64) -> f64 {
        if value > threshold {
            value - threshold
        } else if value < -threshold {
            value + threshold
        } else {
            0.0
        }
    }

    pub(super) fn irls_lasso(
        x: ArrayView2<f64>,
        y: ArrayView1<f64>,
        params: &LogisticParams,
    ) -> (Array1<f64>, bool, usize) {
        let (n, p) = x.dim();
        let mut beta = Array1::<f64>::zeros(p + 1);
        let mut current = objective(x, y, &beta, params);

        for iter in 1..=params.max_iter {
            let eta = linear_predictor(x, &beta);
            let mut weights = Array1::zeros(n);
            let mut residual = Array1::zeros(n);
            for i in 0..n {
                let q = sigmoid(eta[i]);
                let w = (q * (1.0 - q)).max(MIN_IRLS_WEIGHT);
                weights[i] = w;
                // Working response minus the current linear predictor.
                residual[i] = (y[i] - q) / w;
            }
            let weight_sum = weights.sum();
            let column_curvature: Vec<f64> = (0..p)
                .map(|j| {
                    let col = x.column(j);
                    params.c * col.iter().zip(weights.iter()).map(|(v, w)| w * v * v).sum::<f64>()
                })
                .collect();

            let mut candidate = beta.clone();
            for _ in 0..params.max_iter {
                let mut max_change = 0.0_f64;

                let shift = weights.dot(&residual) / weight_sum;
                candidate[0] += shift;
                residual -= shift;
                max_change = max_change.max(shift.abs());

                for j in 0..p {
                    let col = x.column(j);
                    let old = candidate[j + 1];
                    let new = if column_curvature[j] > 0.0 {
                        let rho: f64 = col
                            .iter()
                            .zip(weights.iter())
                            .zip(residual.iter())
                            .map(|((v, w), r)| w * v * (r + v * old))
                            .sum::<f64>()
                            * params.c;
                        soft_threshold(rho, 1.0) / column_curvature[j]
                    } else {
                        0.0
                    };
                    let delta = new - old;
                    if delta != 0.0 {
                        residual.scaled_add(-delta, &col);
                        candidate[j + 1] = new;
                        max_change = max_change.max(delta.abs());
                    }
                }
                if max_change < params.tolerance {
                    break;
                }
            }

            // Backtrack towards the previous estimate if the quadratic model overshot.
            let direction = &candidate - &beta;
            let mut step = 1.0;
            let mut accepted = None;
            for _ in 0..MAX_STEP_HALVINGS {
                let trial = &beta + &(&direction * step);
                let value = objective(x, y, &trial, params);
                if value.is_finite() && value <= current + 1e-12 * current.abs().max(1.0) {
                    accepted = Some((trial, value));
                    break;
                }
                step *= 0.5;
            }
            let Some((trial, value)) = accepted else {
                return (beta, true, iter);
            };

            let change = direction.iter().fold(0.0_f64, |m, d| m.max((d * step).abs()));
            log::debug!("IRLS iteration {iter}: objective {value:.6e}, max change {change:.3e}");
            beta = trial;
            current = value;
            if change < params.tolerance {
                return (beta, true, iter);
            }
        }
        (beta, false, params.max_iter)
    }
}
