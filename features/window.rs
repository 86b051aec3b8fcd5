//! # Feature Window Construction
//!
//! A feature window is the fixed-length snapshot of a patient at one cutoff time:
//! the two demographic covariates followed by the `depth` most recent values of
//! every model variable observed at or before the cutoff.
//!
//! Gaps are filled in two ways. A variable seen fewer than `depth` times is padded
//! with copies of its most recent value; a variable never seen is filled with the
//! training-set median. Demographics missing for a patient fall back to the
//! training median as well, so every window is complete and finite.

use crate::cohort::data::{Cohort, PatientRecord};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

pub const DEMOGRAPHIC_FEATURES: [&str; 2] = ["AGE", "BMI"];

#[derive(Error, Debug, PartialEq)]
pub enum FeatureError {
    #[error(
        "No training values exist for '{0}', so it cannot be imputed. Remove it from the variable list."
    )]
    MissingTrainingValues(String),
    #[error("The feature window must hold at least one value per variable.")]
    ZeroDepth,
    #[error("The variable list is empty.")]
    NoVariables,
    #[error("Non-finite feature '{feature}' produced for patient '{patient}'.")]
    NonFinite { patient: String, feature: String },
}

/// Training-set medians used to fill missing values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImputationReference {
    pub variable_medians: BTreeMap<String, f64>,
    pub age_median: f64,
    pub bmi_median: f64,
}

impl ImputationReference {
    /// Collects medians from the training cohort. Demographic medians are taken
    /// over patients that have both AGE and BMI.
    pub fn from_training(train: &Cohort, variables: &[String]) -> Result<Self, FeatureError> {
        if variables.is_empty() {
            return Err(FeatureError::NoVariables);
        }
        let mut per_variable: BTreeMap<String, Vec<f64>> = variables
            .iter()
            .map(|v| (v.clone(), Vec::new()))
            .collect();
        for measurement in train.patients.iter().flat_map(|p| p.measurements.iter()) {
            if let Some(values) = per_variable.get_mut(&measurement.variable) {
                values.push(measurement.value);
            }
        }

        let mut variable_medians = BTreeMap::new();
        for (variable, mut values) in per_variable {
            let value = median(&mut values)
                .ok_or_else(|| FeatureError::MissingTrainingValues(variable.clone()))?;
            variable_medians.insert(variable, value);
        }

        let (mut ages, mut bmis): (Vec<f64>, Vec<f64>) = train
            .patients
            .iter()
            .filter_map(|p| p.age.zip(p.bmi))
            .unzip();
        let age_median = median(&mut ages)
            .ok_or_else(|| FeatureError::MissingTrainingValues(DEMOGRAPHIC_FEATURES[0].into()))?;
        let bmi_median = median(&mut bmis)
            .ok_or_else(|| FeatureError::MissingTrainingValues(DEMOGRAPHIC_FEATURES[1].into()))?;

        Ok(Self {
            variable_medians,
            age_median,
            bmi_median,
        })
    }
}

/// Median with the two middle values averaged for even lengths.
pub fn median(values: &mut [f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(f64::total_cmp);
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        Some((values[mid - 1] + values[mid]) / 2.0)
    } else {
        Some(values[mid])
    }
}

/// Column names matching the layout produced by `PatientSeries::window`.
pub fn feature_names(variables: &[String], depth: usize) -> Vec<String> {
    let mut names: Vec<String> = DEMOGRAPHIC_FEATURES.iter().map(|s| s.to_string()).collect();
    for variable in variables {
        names.extend((1..=depth).map(|k| format!("{variable}[{k}]")));
    }
    names
}

/// A patient's measurements regrouped per model variable, each series sorted by time.
#[derive(Debug, Clone)]
pub struct PatientSeries<'a> {
    patient: &'a PatientRecord,
    series: Vec<Vec<(NaiveDateTime, f64)>>,
}

impl<'a> PatientSeries<'a> {
    pub fn new(patient: &'a PatientRecord, variables: &[String]) -> Self {
        let mut series = vec![Vec::new(); variables.len()];
        for measurement in &patient.measurements {
            if let Some(slot) = variables.iter().position(|v| *v == measurement.variable) {
                series[slot].push((measurement.time, measurement.value));
            }
        }
        Self { patient, series }
    }

    /// Builds the window for `cutoff`. `variables` must be the list the series
    /// was built with.
    pub fn window(
        &self,
        cutoff: NaiveDateTime,
        depth: usize,
        variables: &[String],
        reference: &ImputationReference,
    ) -> Vec<f64> {
        let mut window = Vec::with_capacity(DEMOGRAPHIC_FEATURES.len() + depth * variables.len());
        window.push(self.patient.age.unwrap_or(reference.age_median));
        window.push(self.patient.bmi.unwrap_or(reference.bmi_median));

        for (variable, series) in variables.iter().zip(&self.series) {
            let seen = series.partition_point(|(time, _)| *time <= cutoff);
            if seen == 0 {
                let fill = reference
                    .variable_medians
                    .get(variable)
                    .copied()
                    .unwrap_or(f64::NAN);
                window.extend(std::iter::repeat_n(fill, depth));
                continue;
            }

            let start = seen.saturating_sub(depth);
            let recent = &series[start..seen];
            window.extend(recent.iter().map(|(_, value)| *value));
            let latest = recent[recent.len() - 1].1;
            window.extend(std::iter::repeat_n(latest, depth - recent.len()));
        }
        window
    }
}

/// One-shot helper for a single cutoff.
pub fn feature_window(
    patient: &PatientRecord,
    cutoff: NaiveDateTime,
    depth: usize,
    variables: &[String],
    reference: &ImputationReference,
) -> Vec<f64> {
    PatientSeries::new(patient, variables).window(cutoff, depth, variables, reference)
}
