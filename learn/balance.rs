//! Random class rebalancing of labeled windows.

use crate::features::sampling::LabeledSamples;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BalanceStrategy {
    #[default]
    None,
    /// Drop majority-class windows down to the minority count.
    Undersample,
    /// Duplicate minority-class windows up to the majority count.
    Oversample,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum BalanceError {
    #[error("Cannot rebalance {rows} windows that all belong to one class.")]
    SingleClass { rows: usize },
}

/// Rebalances `samples` with `strategy`. `BalanceStrategy::None` returns the
/// input unchanged.
pub fn balance(
    samples: &LabeledSamples,
    strategy: BalanceStrategy,
    seed: u64,
) -> Result<LabeledSamples, BalanceError> {
    let undersample = match strategy {
        BalanceStrategy::None => return Ok(samples.clone()),
        BalanceStrategy::Undersample => true,
        BalanceStrategy::Oversample => false,
    };
    let (negatives, positives): (Vec<usize>, Vec<usize>) =
        (0..samples.len()).partition(|&i| samples.y[i] <= 0.5);
    if negatives.is_empty() || positives.is_empty() {
        return Err(BalanceError::SingleClass {
            rows: samples.len(),
        });
    }
    let (minority, majority) = if positives.len() < negatives.len() {
        (positives, negatives)
    } else {
        (negatives, positives)
    };

    let mut rng = StdRng::seed_from_u64(seed);
    let indices = if undersample {
        let kept: Vec<usize> = majority
            .choose_multiple(&mut rng, minority.len())
            .copied()
            .collect();
        class_ordered(samples, minority.iter().chain(&kept).copied())
    } else {
        let extra = majority.len() - minority.len();
        let mut indices: Vec<usize> = (0..samples.len()).collect();
        indices.extend((0..extra).map(|_| minority[rng.gen_range(0..minority.len())]));
        indices
    };

    let balanced = samples.select(&indices);
    log::info!(
        "Rebalanced training windows ({strategy:?}): {} negative / {} positive -> {} negative / {} positive",
        samples.n_negative(),
        samples.n_positive(),
        balanced.n_negative(),
        balanced.n_positive()
    );
    Ok(balanced)
}

/// Negative rows first, then positive rows, each in ascending row order.
fn class_ordered(samples: &LabeledSamples, rows: impl Iterator<Item = usize>) -> Vec<usize> {
    let mut rows: Vec<usize> = rows.collect();
    rows.sort_unstable_by_key(|&i| (samples.y[i] > 0.5, i));
    rows
}
