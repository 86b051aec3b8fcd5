//! # Labeled Window Sampling
//!
//! Every patient is walked backward in time from an event timestamp, producing
//! one feature window per cutoff. The event is death (last measurement of a
//! patient who died), ICU admission (first ICU measurement) or, for patients
//! without the outcome, the end of the stay.
//!
//! The prediction-gap policy decides the labels. For a patient with the outcome,
//! cutoffs inside `[event - gap - pred_window, event - gap]` are positive, sampled
//! every `int_pos` hours. Earlier cutoffs of the same patient are negative, sampled
//! every `int_neg` hours. All cutoffs of a patient without the outcome are
//! negative. Patients observed for less than `gap` hours before their event
//! cannot be labeled and are skipped.

use crate::cohort::data::{Cohort, PatientRecord, hours, hours_between};
use crate::features::window::{FeatureError, ImputationReference, PatientSeries, feature_names};
use chrono::NaiveDateTime;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use ndarray::{Array1, Array2};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::io::IsTerminal;
use thiserror::Error;

/// Which outcome defines a positive patient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LabelType {
    /// In-hospital death, read from the discharge destination.
    Mortality,
    /// ICU admission, read from the department of each measurement.
    Icu,
}

/// Timing of the sampled windows, all durations in hours.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingPolicy {
    pub pred_window: f64,
    pub gap: f64,
    pub int_neg: f64,
    pub int_pos: f64,
    /// Number of most recent values per variable in each window.
    pub feature_window: usize,
    pub label: LabelType,
    /// Substring of `DEST` marking a death.
    pub mortality_marker: String,
    /// Substring of `DEPARTMENT` marking an ICU ward.
    pub icu_marker: String,
}

impl Default for SamplingPolicy {
    fn default() -> Self {
        Self {
            pred_window: 72.0,
            gap: 0.0,
            int_neg: 24.0,
            int_pos: 24.0,
            feature_window: 3,
            label: LabelType::Mortality,
            mortality_marker: "died".to_string(),
            icu_marker: "ICU".to_string(),
        }
    }
}

/// Longest duration, in hours, a policy field may span.
pub const MAX_POLICY_HOURS: f64 = 1_000_000.0;

impl SamplingPolicy {
    pub fn validate(&self) -> Result<(), SamplingError> {
        let finite_non_negative = |name: &'static str, value: f64| {
            if value.is_finite() && (0.0..=MAX_POLICY_HOURS).contains(&value) {
                Ok(())
            } else {
                Err(SamplingError::InvalidPolicy(format!(
                    "{name} must be between 0 and {MAX_POLICY_HOURS} hours (got {value})"
                )))
            }
        };
        finite_non_negative("pred_window", self.pred_window)?;
        finite_non_negative("gap", self.gap)?;
        for (name, value) in [("int_neg", self.int_neg), ("int_pos", self.int_pos)] {
            if !(value.is_finite() && value > 0.0 && value <= MAX_POLICY_HOURS) {
                return Err(SamplingError::InvalidPolicy(format!(
                    "{name} must be a positive number of hours up to {MAX_POLICY_HOURS} (got {value})"
                )));
            }
        }
        if self.feature_window == 0 {
            return Err(SamplingError::Feature(FeatureError::ZeroDepth));
        }
        Ok(())
    }

    /// Event time when the patient has the outcome, `None` otherwise.
    pub fn outcome_event(&self, patient: &PatientRecord) -> Option<NaiveDateTime> {
        match self.label {
            LabelType::Mortality => patient
                .destination
                .as_deref()
                .filter(|d| d.contains(self.mortality_marker.as_str()))
                .and_then(|_| patient.last_time()),
            LabelType::Icu => patient
                .measurements
                .iter()
                .find(|m| {
                    m.department
                        .as_deref()
                        .is_some_and(|d| d.contains(self.icu_marker.as_str()))
                })
                .map(|m| m.time),
        }
    }
}

#[derive(Error, Debug, PartialEq)]
pub enum SamplingError {
    #[error(transparent)]
    Feature(#[from] FeatureError),
    #[error("Invalid sampling policy: {0}")]
    InvalidPolicy(String),
    #[error("Labeling by {label:?} needs the '{column}' column, which is absent or empty.")]
    MissingLabelColumn {
        label: LabelType,
        column: &'static str,
    },
    #[error("No feature windows could be sampled from {patients} patients.")]
    NoSamples { patients: usize },
}

/// Feature matrix with labels, one row per sampled window.
#[derive(Debug, Clone, PartialEq)]
pub struct LabeledSamples {
    /// Shape: [n_windows, 2 + feature_window * n_variables].
    pub x: Array2<f64>,
    /// 1.0 for positive windows, 0.0 for negative windows.
    pub y: Array1<f64>,
    pub feature_names: Vec<String>,
    /// Source patient of each row.
    pub patient_ids: Vec<String>,
}

impl LabeledSamples {
    pub fn len(&self) -> usize {
        self.y.len()
    }

    pub fn is_empty(&self) -> bool {
        self.y.is_empty()
    }

    pub fn n_positive(&self) -> usize {
        self.y.iter().filter(|&&v| v > 0.5).count()
    }

    pub fn n_negative(&self) -> usize {
        self.len() - self.n_positive()
    }

    /// Rows at `indices`, in that order. Indices may repeat.
    pub fn select(&self, indices: &[usize]) -> LabeledSamples {
        LabeledSamples {
            x: self.x.select(ndarray::Axis(0), indices),
            y: indices.iter().map(|&i| self.y[i]).collect(),
            feature_names: self.feature_names.clone(),
            patient_ids: indices.iter().map(|&i| self.patient_ids[i].clone()).collect(),
        }
    }
}

/// Counts reported after sampling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SamplingReport {
    pub positive_patients: usize,
    pub negative_patients: usize,
    /// Patients with less than `gap` hours of data before their event.
    pub skipped_patients: usize,
    pub positive_samples: usize,
    pub negative_samples: usize,
}

/// Windows drawn from a single patient.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PatientSamples {
    pub has_outcome: bool,
    pub skipped: bool,
    pub positive: Vec<Vec<f64>>,
    pub negative: Vec<Vec<f64>>,
}

/// `floor(window / step) - 1` cutoffs starting at `start` and stepping back by `step`.
/// The walk ends early at the earliest representable timestamp.
pub fn cutoffs(start: NaiveDateTime, step_hours: f64, window_hours: f64) -> Vec<NaiveDateTime> {
    let count = ((window_hours / step_hours).floor() as i64 - 1).max(0) as usize;
    let Some(step) = hours(step_hours) else {
        return Vec::new();
    };
    std::iter::successors(Some(start), |t| t.checked_sub_signed(step))
        .take(count)
        .collect()
}

/// Samples all windows of one patient under `policy`.
pub fn sample_patient(
    patient: &PatientRecord,
    variables: &[String],
    reference: &ImputationReference,
    policy: &SamplingPolicy,
) -> PatientSamples {
    let Some(first) = patient.first_time() else {
        return PatientSamples {
            skipped: true,
            ..PatientSamples::default()
        };
    };
    let outcome = policy.outcome_event(patient);
    let event = match (outcome, patient.last_time()) {
        (Some(event), _) | (None, Some(event)) => event,
        (None, None) => first,
    };
    let observed = hours_between(first, event);
    let has_outcome = outcome.is_some();

    if observed < policy.gap {
        return PatientSamples {
            has_outcome,
            skipped: true,
            ..PatientSamples::default()
        };
    }

    let series = PatientSeries::new(patient, variables);
    let window = |cutoff: NaiveDateTime| {
        series.window(cutoff, policy.feature_window, variables, reference)
    };

    let before_event = |span: f64| hours(span).and_then(|d| event.checked_sub_signed(d));

    if has_outcome {
        let positive = before_event(policy.gap)
            .map(|start| cutoffs(start, policy.int_pos, policy.pred_window))
            .unwrap_or_default()
            .into_iter()
            .map(window)
            .collect();
        let negative = before_event(policy.gap + policy.pred_window)
            .map(|start| {
                cutoffs(start, policy.int_neg, observed - policy.pred_window - policy.gap)
            })
            .unwrap_or_default()
            .into_iter()
            .map(window)
            .collect();
        PatientSamples {
            has_outcome,
            skipped: false,
            positive,
            negative,
        }
    } else {
        let negative = cutoffs(event, policy.int_neg, observed)
            .into_iter()
            .map(window)
            .collect();
        PatientSamples {
            has_outcome,
            skipped: false,
            positive: Vec::new(),
            negative,
        }
    }
}

fn create_progress_bar(len: u64, message: &str) -> ProgressBar {
    let draw_target = if std::io::stderr().is_terminal() {
        ProgressDrawTarget::stderr_with_hz(20)
    } else {
        ProgressDrawTarget::hidden()
    };

    let pb = ProgressBar::with_draw_target(Some(len), draw_target);
    if let Ok(style) =
        ProgressStyle::with_template("> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
    {
        pb.set_style(style.progress_chars("█▉▊▋▌▍▎▏  "));
    }
    pb.set_message(message.to_string());
    pb
}

/// Samples labeled feature windows from every patient of `cohort`.
///
/// Rows are ordered positives first, then negatives; within each block rows
/// follow cohort order, with the negatives of outcome patients ahead of the
/// negatives of the remaining patients.
pub fn prepare_feature_vectors(
    cohort: &Cohort,
    variables: &[String],
    reference: &ImputationReference,
    policy: &SamplingPolicy,
) -> Result<(LabeledSamples, SamplingReport), SamplingError> {
    policy.validate()?;
    if variables.is_empty() {
        return Err(FeatureError::NoVariables.into());
    }
    match policy.label {
        LabelType::Mortality if cohort.patients.iter().all(|p| p.destination.is_none()) => {
            return Err(SamplingError::MissingLabelColumn {
                label: policy.label,
                column: "DEST",
            });
        }
        LabelType::Icu if !cohort.has_departments() => {
            return Err(SamplingError::MissingLabelColumn {
                label: policy.label,
                column: "DEPARTMENT",
            });
        }
        _ => {}
    }
    log::info!("Labeling windows for {:?}", policy.label);

    let pb = create_progress_bar(cohort.len() as u64, "patients sampled");
    let per_patient: Vec<PatientSamples> = cohort
        .patients
        .par_iter()
        .map(|patient| {
            let samples = sample_patient(patient, variables, reference, policy);
            pb.inc(1);
            samples
        })
        .collect();
    pb.finish_and_clear();

    let mut report = SamplingReport::default();
    let mut positive_rows: Vec<(&str, &[f64])> = Vec::new();
    let mut outcome_negative_rows: Vec<(&str, &[f64])> = Vec::new();
    let mut other_negative_rows: Vec<(&str, &[f64])> = Vec::new();
    for (patient, samples) in cohort.patients.iter().zip(&per_patient) {
        if samples.has_outcome {
            report.positive_patients += 1;
        } else {
            report.negative_patients += 1;
        }
        if samples.skipped {
            report.skipped_patients += 1;
            continue;
        }
        let id = patient.id.as_str();
        positive_rows.extend(samples.positive.iter().map(|v| (id, v.as_slice())));
        let negatives = if samples.has_outcome {
            &mut outcome_negative_rows
        } else {
            &mut other_negative_rows
        };
        negatives.extend(samples.negative.iter().map(|v| (id, v.as_slice())));
    }
    report.positive_samples = positive_rows.len();
    report.negative_samples = outcome_negative_rows.len() + other_negative_rows.len();

    log::info!(
        "Outcome patients: {}, other patients: {}, skipped for too little data: {}",
        report.positive_patients,
        report.negative_patients,
        report.skipped_patients
    );
    log::info!(
        "Positive windows: {}, negative windows: {}",
        report.positive_samples,
        report.negative_samples
    );

    let names = feature_names(variables, policy.feature_window);
    let rows: Vec<(&str, &[f64])> = positive_rows
        .into_iter()
        .chain(outcome_negative_rows)
        .chain(other_negative_rows)
        .collect();
    if rows.is_empty() {
        return Err(SamplingError::NoSamples {
            patients: cohort.len(),
        });
    }

    let width = names.len();
    let mut x = Array2::zeros((rows.len(), width));
    for (i, (id, values)) in rows.iter().enumerate() {
        if let Some(j) = values.iter().position(|v| !v.is_finite()) {
            return Err(FeatureError::NonFinite {
                patient: id.to_string(),
                feature: names[j].clone(),
            }
            .into());
        }
        x.row_mut(i).assign(&ndarray::ArrayView1::from(*values));
    }
    let y = Array1::from_iter(
        (0..rows.len()).map(|i| if i < report.positive_samples { 1.0 } else { 0.0 }),
    );

    Ok((
        LabeledSamples {
            x,
            y,
            feature_names: names,
            patient_ids: rows.iter().map(|(id, _)| id.to_string()).collect(),
        },
        report,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cohort::data::Measurement;
    use chrono::NaiveDate;
    use std::collections::BTreeMap;

    fn at(hour: i64) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2021, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
            + chrono::Duration::hours(hour)
    }

    fn hourly_patient(id: &str, stay_hours: i64, destination: &str) -> PatientRecord {
        PatientRecord {
            id: id.to_string(),
            age: Some(0.0),
            bmi: Some(0.0),
            destination: Some(destination.to_string()),
            measurements: (0..=stay_hours)
                .map(|h| Measurement {
                    time: at(h),
                    variable: "HR".to_string(),
                    value: h as f64,
                    department: Some(if h >= stay_hours / 2 { "ICU" } else { "ward" }.into()),
                })
                .collect(),
        }
    }

    fn reference() -> ImputationReference {
        ImputationReference {
            variable_medians: BTreeMap::from([("HR".to_string(), 0.0)]),
            age_median: 0.0,
            bmi_median: 0.0,
        }
    }

    fn policy() -> SamplingPolicy {
        SamplingPolicy {
            pred_window: 24.0,
            gap: 6.0,
            int_neg: 12.0,
            int_pos: 6.0,
            feature_window: 1,
            ..SamplingPolicy::default()
        }
    }

    #[test]
    fn cutoff_count_is_floor_minus_one() {
        let cuts = cutoffs(at(100), 6.0, 24.0);
        assert_eq!(cuts, vec![at(100), at(94), at(88)]);
        assert!(cutoffs(at(0), 6.0, 5.0).is_empty());
        assert!(cutoffs(at(0), 6.0, -10.0).is_empty());
    }

    #[test]
    fn outcome_patient_gets_positive_then_negative_windows() {
        let patient = hourly_patient("a", 96, "died in hospital");
        let samples = sample_patient(&patient, &["HR".to_string()], &reference(), &policy());
        assert!(samples.has_outcome);
        // Positive cutoffs at 90, 84, 78 (event 96, gap 6).
        let positive: Vec<f64> = samples.positive.iter().map(|w| w[2]).collect();
        assert_eq!(positive, vec![90.0, 84.0, 78.0]);
        // Negative cutoffs start at 66 and cover floor(66 / 12) - 1 = 4 steps.
        let negative: Vec<f64> = samples.negative.iter().map(|w| w[2]).collect();
        assert_eq!(negative, vec![66.0, 54.0, 42.0, 30.0]);
    }

    #[test]
    fn other_patient_samples_back_from_discharge() {
        let patient = hourly_patient("b", 48, "home");
        let samples = sample_patient(&patient, &["HR".to_string()], &reference(), &policy());
        assert!(!samples.has_outcome);
        assert!(samples.positive.is_empty());
        let negative: Vec<f64> = samples.negative.iter().map(|w| w[2]).collect();
        assert_eq!(negative, vec![48.0, 36.0, 24.0]);
    }

    #[test]
    fn short_stays_are_skipped() {
        let patient = hourly_patient("c", 4, "died");
        let samples = sample_patient(&patient, &["HR".to_string()], &reference(), &policy());
        assert!(samples.skipped);
        assert!(samples.positive.is_empty() && samples.negative.is_empty());
    }

    #[test]
    fn icu_event_is_first_icu_measurement() {
        let patient = hourly_patient("d", 96, "home");
        let icu = SamplingPolicy {
            label: LabelType::Icu,
            ..policy()
        };
        assert_eq!(icu.outcome_event(&patient), Some(at(48)));
        let samples = sample_patient(&patient, &["HR".to_string()], &reference(), &icu);
        let positive: Vec<f64> = samples.positive.iter().map(|w| w[2]).collect();
        assert_eq!(positive, vec![42.0, 36.0, 30.0]);
    }

    #[test]
    fn matrix_orders_positives_first() {
        let cohort = Cohort::new(vec![
            hourly_patient("1", 48, "home"),
            hourly_patient("2", 96, "died"),
            hourly_patient("3", 2, "home"),
        ]);
        let (samples, report) =
            prepare_feature_vectors(&cohort, &["HR".to_string()], &reference(), &policy())
                .unwrap();
        assert_eq!(report.positive_patients, 1);
        assert_eq!(report.negative_patients, 2);
        assert_eq!(report.skipped_patients, 1);
        assert_eq!(report.positive_samples, 3);
        assert_eq!(report.negative_samples, 4 + 3);
        assert_eq!(samples.x.shape(), &[10, 3]);
        assert_eq!(samples.n_positive(), 3);
        assert_eq!(&samples.patient_ids[..4], &["2", "2", "2", "2"]);
        assert_eq!(samples.patient_ids[7], "1");
        assert_eq!(samples.feature_names, vec!["AGE", "BMI", "HR[1]"]);
    }

    #[test]
    fn missing_label_column_is_reported() {
        let mut patient = hourly_patient("1", 48, "home");
        for m in &mut patient.measurements {
            m.department = None;
        }
        let cohort = Cohort::new(vec![patient]);
        let icu = SamplingPolicy {
            label: LabelType::Icu,
            ..policy()
        };
        let err =
            prepare_feature_vectors(&cohort, &["HR".to_string()], &reference(), &icu).unwrap_err();
        assert_eq!(
            err,
            SamplingError::MissingLabelColumn {
                label: LabelType::Icu,
                column: "DEPARTMENT"
            }
        );
    }

    #[test]
    fn invalid_policy_is_rejected() {
        let bad = SamplingPolicy {
            int_pos: 0.0,
            ..policy()
        };
        assert!(matches!(bad.validate(), Err(SamplingError::InvalidPolicy(_))));
    }

    #[test]
    fn oversized_durations_are_rejected() {
        let huge_window = SamplingPolicy {
            pred_window: 1e10,
            ..policy()
        };
        assert!(matches!(
            huge_window.validate(),
            Err(SamplingError::InvalidPolicy(_))
        ));
        let huge_step = SamplingPolicy {
            int_neg: 1e10,
            ..policy()
        };
        assert!(matches!(
            huge_step.validate(),
            Err(SamplingError::InvalidPolicy(_))
        ));

        let patient = hourly_patient("a", 96, "died");
        let err = prepare_feature_vectors(
            &Cohort::new(vec![patient]),
            &["HR".to_string()],
            &reference(),
            &huge_window,
        )
        .unwrap_err();
        assert!(matches!(err, SamplingError::InvalidPolicy(_)));
    }

    #[test]
    fn unrepresentable_spans_drop_their_windows() {
        // Skips validation to reach the timestamp arithmetic directly.
        let unbounded = SamplingPolicy {
            pred_window: 1e10,
            int_pos: 1e9,
            ..policy()
        };
        let patient = hourly_patient("a", 96, "died");
        let samples = sample_patient(&patient, &["HR".to_string()], &reference(), &unbounded);
        assert!(samples.has_outcome);
        assert!(!samples.skipped);
        assert!(samples.positive.len() <= 9);
        assert!(samples.negative.is_empty());
    }

    #[test]
    fn cutoff_walk_stops_at_earliest_timestamp() {
        let cuts = cutoffs(NaiveDateTime::MIN, 1.0, 10.0);
        assert_eq!(cuts, vec![NaiveDateTime::MIN]);
        assert!(cutoffs(at(0), 1e20, 1e21).is_empty());
    }

    #[test]
    fn unmeasured_variable_without_median_is_non_finite() {
        let patient = hourly_patient("a", 96, "died");
        let variables = vec!["HR".to_string(), "CRP".to_string()];
        let err = prepare_feature_vectors(
            &Cohort::new(vec![patient]),
            &variables,
            &reference(),
            &policy(),
        )
        .unwrap_err();
        match err {
            SamplingError::Feature(FeatureError::NonFinite { patient, feature }) => {
                assert_eq!(patient, "a");
                assert!(feature.starts_with("CRP"), "unexpected feature {feature}");
            }
            other => panic!("Expected NonFinite, got {:?}", other),
        }
    }
}
