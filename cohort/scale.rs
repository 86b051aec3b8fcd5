//! Per-variable standardization fitted on the training partition only.

use crate::cohort::data::{Cohort, PatientRecord};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Mean and scale of a single standardized quantity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScalerParams {
    pub mean: f64,
    /// Population standard deviation; 1.0 when the training values are constant.
    pub scale: f64,
}

impl ScalerParams {
    /// Fits on `values`, or returns `None` when there is nothing to fit.
    pub fn fit(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        let std = variance.sqrt();
        let scale = if std > f64::EPSILON * mean.abs().max(1.0) {
            std
        } else {
            1.0
        };
        Some(Self { mean, scale })
    }

    pub fn apply(&self, value: f64) -> f64 {
        (value - self.mean) / self.scale
    }
}

/// Scalers for every model variable plus the two demographic covariates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Standardizer {
    pub variables: BTreeMap<String, ScalerParams>,
    pub age: Option<ScalerParams>,
    pub bmi: Option<ScalerParams>,
}

impl Standardizer {
    /// Fits one scaler per requested variable on the training cohort. Variables
    /// that never occur in training get no scaler and are later dropped.
    pub fn fit(train: &Cohort, variables: &[String]) -> Self {
        let mut per_variable: BTreeMap<String, Vec<f64>> = variables
            .iter()
            .map(|v| (v.clone(), Vec::new()))
            .collect();
        for measurement in train.patients.iter().flat_map(|p| p.measurements.iter()) {
            if let Some(values) = per_variable.get_mut(&measurement.variable) {
                values.push(measurement.value);
            }
        }

        let mut fitted = BTreeMap::new();
        for (variable, values) in per_variable {
            match ScalerParams::fit(&values) {
                Some(params) => {
                    fitted.insert(variable, params);
                }
                None => log::warn!("{variable} not in training set; it is dropped everywhere."),
            }
        }

        let ages: Vec<f64> = train.patients.iter().filter_map(|p| p.age).collect();
        let bmis: Vec<f64> = train.patients.iter().filter_map(|p| p.bmi).collect();

        Self {
            variables: fitted,
            age: ScalerParams::fit(&ages),
            bmi: ScalerParams::fit(&bmis),
        }
    }

    /// Standardizes a cohort, dropping measurements of variables without a scaler.
    pub fn transform(&self, cohort: &Cohort) -> Cohort {
        let patients = cohort
            .patients
            .iter()
            .map(|patient| {
                let measurements = patient
                    .measurements
                    .iter()
                    .filter_map(|m| {
                        self.variables.get(&m.variable).map(|params| {
                            let mut scaled = m.clone();
                            scaled.value = params.apply(m.value);
                            scaled
                        })
                    })
                    .collect();
                PatientRecord {
                    id: patient.id.clone(),
                    age: scale_optional(patient.age, self.age),
                    bmi: scale_optional(patient.bmi, self.bmi),
                    destination: patient.destination.clone(),
                    measurements,
                }
            })
            .collect();
        Cohort { patients }
    }

    /// The variables that survived fitting, in sorted order.
    pub fn fitted_variables(&self) -> Vec<String> {
        self.variables.keys().cloned().collect()
    }
}

fn scale_optional(value: Option<f64>, params: Option<ScalerParams>) -> Option<f64> {
    match (value, params) {
        (Some(v), Some(p)) => Some(p.apply(v)),
        (v, _) => v,
    }
}

/// Drops measurements of variables outside `variables` without rescaling.
pub fn restrict_to_variables(cohort: &Cohort, variables: &[String]) -> Cohort {
    let keep: HashSet<&str> = variables.iter().map(String::as_str).collect();
    let patients = cohort
        .patients
        .iter()
        .map(|patient| PatientRecord {
            measurements: patient
                .measurements
                .iter()
                .filter(|m| keep.contains(m.variable.as_str()))
                .cloned()
                .collect(),
            ..patient.clone()
        })
        .collect();
    Cohort { patients }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cohort::data::Measurement;
    use approx::assert_abs_diff_eq;
    use chrono::{NaiveDate, NaiveDateTime};

    fn at(hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2021, 1, 1)
            .unwrap()
            .and_hms_opt(hour, 0, 0)
            .unwrap()
    }

    fn patient(id: &str, age: Option<f64>, rows: &[(&str, f64)]) -> PatientRecord {
        PatientRecord {
            id: id.to_string(),
            age,
            bmi: Some(25.0),
            destination: None,
            measurements: rows
                .iter()
                .enumerate()
                .map(|(i, (variable, value))| Measurement {
                    time: at(i as u32),
                    variable: variable.to_string(),
                    value: *value,
                    department: None,
                })
                .collect(),
        }
    }

    #[test]
    fn scaler_uses_population_std() {
        let params = ScalerParams::fit(&[1.0, 2.0, 3.0, 4.0]).unwrap();
        assert_abs_diff_eq!(params.mean, 2.5, epsilon = 1e-12);
        assert_abs_diff_eq!(params.scale, 1.25_f64.sqrt(), epsilon = 1e-12);
    }

    #[test]
    fn constant_values_get_unit_scale() {
        let params = ScalerParams::fit(&[7.0, 7.0, 7.0]).unwrap();
        assert_abs_diff_eq!(params.scale, 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(params.apply(7.0), 0.0, epsilon = 1e-12);
        assert!(ScalerParams::fit(&[]).is_none());
    }

    #[test]
    fn fit_on_train_applies_to_other_splits() {
        let train = Cohort::new(vec![
            patient("a", Some(50.0), &[("HR", 60.0), ("HR", 80.0), ("SBP", 100.0)]),
            patient("b", Some(70.0), &[("SBP", 140.0)]),
        ]);
        let variables = vec!["HR".to_string(), "SBP".to_string(), "RR".to_string()];
        let scaler = Standardizer::fit(&train, &variables);
        assert_eq!(scaler.fitted_variables(), vec!["HR", "SBP"]);

        let val = Cohort::new(vec![patient(
            "c",
            None,
            &[("HR", 90.0), ("RR", 20.0), ("TEMP", 37.0)],
        )]);
        let scaled = scaler.transform(&val);
        let c = &scaled.patients[0];
        assert_eq!(c.measurements.len(), 1);
        assert_abs_diff_eq!(c.measurements[0].value, 2.0, epsilon = 1e-12);
        assert_eq!(c.age, None);
        assert_abs_diff_eq!(c.bmi.unwrap(), 0.0, epsilon = 1e-12);

        let scaled_train = scaler.transform(&train);
        assert_abs_diff_eq!(scaled_train.patients[0].age.unwrap(), -1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(scaled_train.patients[1].age.unwrap(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn restrict_keeps_raw_values() {
        let cohort = Cohort::new(vec![patient("a", None, &[("HR", 60.0), ("TEMP", 37.0)])]);
        let restricted = restrict_to_variables(&cohort, &["HR".to_string()]);
        assert_eq!(restricted.patients[0].measurements.len(), 1);
        assert_abs_diff_eq!(restricted.patients[0].measurements[0].value, 60.0);
    }
}
