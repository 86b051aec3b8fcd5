//! Discrimination metrics for binary classifiers.

use ndarray::ArrayView1;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Probability above which a window is predicted positive.
pub const DECISION_THRESHOLD: f64 = 0.5;

/// Area Under ROC Curve (AUC) - Mann-Whitney implementation
pub fn auc(y: ArrayView1<f64>, p: ArrayView1<f64>) -> f64 {
    assert_eq!(y.len(), p.len());
    let n = y.len();
    let n_pos = y.iter().filter(|&&t| t > 0.5).count() as f64;
    let n_neg = n as f64 - n_pos;
    if n_pos == 0.0 || n_neg == 0.0 {
        return 0.5;
    }

    // Sort indices by prediction score ascending
    let mut idx: Vec<usize> = (0..n).collect();
    idx.sort_by(|&i, &j| p[i].partial_cmp(&p[j]).unwrap_or(Ordering::Equal));

    // Tied scores share their average rank
    let mut ranks = vec![0.0; n];
    let mut i = 0;
    while i < n {
        let mut j = i + 1;
        while j < n && p[idx[j]] == p[idx[i]] {
            j += 1;
        }
        let avg_rank = (i + j - 1) as f64 / 2.0 + 1.0;
        for &k in &idx[i..j] {
            ranks[k] = avg_rank;
        }
        i = j;
    }

    let sum_ranks_pos: f64 = (0..n).filter(|&i| y[i] > 0.5).map(|i| ranks[i]).sum();

    // AUC = U/(n_pos*n_neg) where U = sum_ranks_pos - n_pos*(n_pos+1)/2
    (sum_ranks_pos - n_pos * (n_pos + 1.0) / 2.0) / (n_pos * n_neg)
}

/// Counts of a thresholded prediction against the truth.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfusionMatrix {
    pub tn: usize,
    pub fp: usize,
    #[serde(rename = "fn")]
    pub fn_: usize,
    pub tp: usize,
}

impl ConfusionMatrix {
    /// Positive prediction means probability strictly above `threshold`.
    pub fn at_threshold(y: ArrayView1<f64>, p: ArrayView1<f64>, threshold: f64) -> Self {
        assert_eq!(y.len(), p.len());
        let mut cm = Self::default();
        for (&truth, &prob) in y.iter().zip(p.iter()) {
            match (truth > 0.5, prob > threshold) {
                (false, false) => cm.tn += 1,
                (false, true) => cm.fp += 1,
                (true, false) => cm.fn_ += 1,
                (true, true) => cm.tp += 1,
            }
        }
        cm
    }

    fn ratio(num: usize, den: usize) -> Option<f64> {
        (den > 0).then(|| num as f64 / den as f64)
    }

    pub fn sensitivity(&self) -> Option<f64> {
        Self::ratio(self.tp, self.tp + self.fn_)
    }

    pub fn specificity(&self) -> Option<f64> {
        Self::ratio(self.tn, self.tn + self.fp)
    }

    pub fn precision(&self) -> Option<f64> {
        Self::ratio(self.tp, self.tp + self.fp)
    }

    pub fn recall(&self) -> Option<f64> {
        self.sensitivity()
    }

    pub fn accuracy(&self) -> Option<f64> {
        Self::ratio(self.tp + self.tn, self.tp + self.tn + self.fp + self.fn_)
    }
}

/// Precision and recall at every distinct score threshold.
///
/// Entries run from the lowest threshold to the highest; the final point
/// (precision 1, recall 0) has no threshold.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PrecisionRecallCurve {
    pub precision: Vec<f64>,
    pub recall: Vec<f64>,
    pub thresholds: Vec<f64>,
}

pub fn precision_recall_curve(y: ArrayView1<f64>, p: ArrayView1<f64>) -> PrecisionRecallCurve {
    assert_eq!(y.len(), p.len());
    let mut idx: Vec<usize> = (0..y.len()).collect();
    idx.sort_by(|&i, &j| p[j].partial_cmp(&p[i]).unwrap_or(Ordering::Equal));

    // Cumulative counts at each distinct threshold, highest score first.
    let mut tps = Vec::new();
    let mut fps = Vec::new();
    let mut thresholds = Vec::new();
    let (mut tp, mut fp) = (0usize, 0usize);
    for (pos, &i) in idx.iter().enumerate() {
        if y[i] > 0.5 {
            tp += 1;
        } else {
            fp += 1;
        }
        let last_of_run = idx.get(pos + 1).is_none_or(|&next| p[next] != p[i]);
        if last_of_run {
            tps.push(tp);
            fps.push(fp);
            thresholds.push(p[i]);
        }
    }

    let total_pos = tps.last().copied().unwrap_or(0);
    let mut precision: Vec<f64> = tps
        .iter()
        .zip(&fps)
        .map(|(&t, &f)| t as f64 / (t + f) as f64)
        .collect();
    let mut recall: Vec<f64> = tps
        .iter()
        .map(|&t| {
            if total_pos == 0 {
                1.0
            } else {
                t as f64 / total_pos as f64
            }
        })
        .collect();

    precision.reverse();
    recall.reverse();
    thresholds.reverse();
    precision.push(1.0);
    recall.push(0.0);

    PrecisionRecallCurve {
        precision,
        recall,
        thresholds,
    }
}

/// Everything reported for one evaluated split.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub auc: f64,
    pub confusion: ConfusionMatrix,
    pub curve: PrecisionRecallCurve,
}

/// Scores predicted probabilities `p` against labels `y`.
pub fn evaluate_probabilities(y: ArrayView1<f64>, p: ArrayView1<f64>) -> Evaluation {
    let evaluation = Evaluation {
        auc: auc(y, p),
        confusion: ConfusionMatrix::at_threshold(y, p, DECISION_THRESHOLD),
        curve: precision_recall_curve(y, p),
    };
    log_evaluation(&evaluation);
    evaluation
}

fn fmt_ratio(value: Option<f64>) -> String {
    value.map_or_else(|| "n/a".to_string(), |v| format!("{v:.2}"))
}

fn log_evaluation(evaluation: &Evaluation) {
    let cm = &evaluation.confusion;
    log::info!("Model performance (AUC): {:.4}", evaluation.auc);
    log::info!("TN: {} FP: {} FN: {} TP: {}", cm.tn, cm.fp, cm.fn_, cm.tp);
    log::info!(
        "sens: {} spec: {} precision: {}",
        fmt_ratio(cm.sensitivity()),
        fmt_ratio(cm.specificity()),
        fmt_ratio(cm.precision())
    );
}
