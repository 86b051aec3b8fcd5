//! Patient-level train / validation / test partitioning.
//!
//! Splitting happens on patient IDs, never on rows, so every stay ends up in
//! exactly one partition. The first cut separates the validation patients from
//! everything else; the second cut takes the test patients out of the remainder.

use crate::cohort::data::Cohort;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use std::collections::HashSet;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum SplitError {
    #[error("The {name} share must lie strictly between 0 and 1, got {value}.")]
    InvalidShare { name: &'static str, value: f64 },
    #[error(
        "Cannot hold out a {share} share of {patients} patients: one side of the split would be empty."
    )]
    TooFewPatients { patients: usize, share: f64 },
}

/// The three disjoint patient partitions.
#[derive(Debug, Clone)]
pub struct PatientSplit {
    pub train: Cohort,
    pub val: Cohort,
    pub test: Cohort,
}

/// Splits `cohort` into train/val/test. `val_share` is taken from the whole cohort,
/// `test_share` from what remains after removing the validation patients.
pub fn split_patients(
    cohort: &Cohort,
    val_share: f64,
    test_share: f64,
    seed: u64,
) -> Result<PatientSplit, SplitError> {
    validate_share("validation", val_share)?;
    validate_share("test", test_share)?;

    let ids: Vec<String> = cohort.patients.iter().map(|p| p.id.clone()).collect();
    let (train_full_ids, val_ids) = holdout(&ids, val_share, seed)?;
    let (train_ids, test_ids) = holdout(&train_full_ids, test_share, seed)?;

    let split = PatientSplit {
        train: cohort.subset(&train_ids.into_iter().collect()),
        val: cohort.subset(&val_ids.into_iter().collect()),
        test: cohort.subset(&test_ids.into_iter().collect()),
    };

    log::info!(
        "Split {} patients ({} measurements): train {} ({}), val {} ({}), test {} ({})",
        cohort.len(),
        cohort.num_measurements(),
        split.train.len(),
        split.train.num_measurements(),
        split.val.len(),
        split.val.num_measurements(),
        split.test.len(),
        split.test.num_measurements(),
    );
    Ok(split)
}

fn validate_share(name: &'static str, value: f64) -> Result<(), SplitError> {
    if value > 0.0 && value < 1.0 {
        Ok(())
    } else {
        Err(SplitError::InvalidShare { name, value })
    }
}

/// Shuffles `ids` and returns `(kept, held_out)`, holding out `ceil(share * n)` IDs.
fn holdout(
    ids: &[String],
    share: f64,
    seed: u64,
) -> Result<(Vec<String>, Vec<String>), SplitError> {
    let n = ids.len();
    let n_held_out = (share * n as f64).ceil() as usize;
    if n_held_out == 0 || n_held_out >= n {
        return Err(SplitError::TooFewPatients { patients: n, share });
    }

    let mut shuffled = ids.to_vec();
    let mut rng = StdRng::seed_from_u64(seed);
    shuffled.shuffle(&mut rng);
    let kept = shuffled.split_off(n_held_out);
    Ok((kept, shuffled))
}

/// True when no patient ID appears in more than one partition.
pub fn is_disjoint(split: &PatientSplit) -> bool {
    let mut seen = HashSet::new();
    [&split.train, &split.val, &split.test]
        .iter()
        .flat_map(|c| c.patients.iter())
        .all(|p| seen.insert(p.id.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cohort::data::{Measurement, PatientRecord};
    use chrono::NaiveDate;

    fn cohort_of(n: usize) -> Cohort {
        let t0 = NaiveDate::from_ymd_opt(2021, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        Cohort::new(
            (0..n)
                .map(|i| PatientRecord {
                    id: format!("p{i}"),
                    age: Some(60.0),
                    bmi: Some(24.0),
                    destination: None,
                    measurements: vec![Measurement {
                        time: t0,
                        variable: "HR".to_string(),
                        value: 70.0,
                        department: None,
                    }],
                })
                .collect(),
        )
    }

    #[test]
    fn split_sizes_follow_ceiling_rule() {
        let cohort = cohort_of(100);
        let split = split_patients(&cohort, 0.25, 0.2, 0).unwrap();
        assert_eq!(split.val.len(), 25);
        assert_eq!(split.test.len(), 15);
        assert_eq!(split.train.len(), 60);
        assert!(is_disjoint(&split));
    }

    #[test]
    fn split_is_reproducible_for_a_seed() {
        let cohort = cohort_of(40);
        let a = split_patients(&cohort, 0.25, 0.2, 7).unwrap();
        let b = split_patients(&cohort, 0.25, 0.2, 7).unwrap();
        assert_eq!(a.val.ids(), b.val.ids());
        assert_eq!(a.test.ids(), b.test.ids());

        let c = split_patients(&cohort, 0.25, 0.2, 8).unwrap();
        assert_ne!(a.val.ids(), c.val.ids());
    }

    #[test]
    fn every_patient_lands_in_one_partition() {
        let cohort = cohort_of(17);
        let split = split_patients(&cohort, 0.3, 0.3, 3).unwrap();
        assert_eq!(split.train.len() + split.val.len() + split.test.len(), 17);
        assert!(is_disjoint(&split));
    }

    #[test]
    fn rejects_out_of_range_shares() {
        let cohort = cohort_of(10);
        assert_eq!(
            split_patients(&cohort, 0.0, 0.2, 0).unwrap_err(),
            SplitError::InvalidShare {
                name: "validation",
                value: 0.0
            }
        );
        assert!(matches!(
            split_patients(&cohort, 0.2, 1.0, 0),
            Err(SplitError::InvalidShare { name: "test", .. })
        ));
    }

    #[test]
    fn rejects_cohorts_too_small_to_split() {
        let cohort = cohort_of(1);
        assert!(matches!(
            split_patients(&cohort, 0.25, 0.2, 0),
            Err(SplitError::TooFewPatients { patients: 1, .. })
        ));
    }
}
