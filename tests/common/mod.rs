#![allow(dead_code)]

use chrono::{Duration, NaiveDate, NaiveDateTime};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

pub const HEADER: &str = "ID\tTIME\tVARIABLE\tVALUE\tAGE\tBMI\tDEST\tDEPARTMENT";

/// Hours covered by every synthetic stay; measurements every 6 hours from 0.
pub const STAY_HOURS: i64 = 234;

fn start() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2021, 3, 1)
        .unwrap()
        .and_hms_opt(8, 0, 0)
        .unwrap()
}

/// Writes a cohort where every `outcome_every`-th patient dies and shows a
/// raised heart rate during the last 72 hours of the stay. The same patients
/// spend their last 24 hours in the ICU.
pub fn write_cohort(dir: &Path, n_patients: usize, outcome_every: usize, seed: u64) -> PathBuf {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut text = String::from(HEADER);
    text.push('\n');
    for p in 0..n_patients {
        let dies = p % outcome_every == 0;
        let age = 50.0 + (p % 30) as f64;
        let bmi = 20.0 + (p % 10) as f64;
        let dest = if dies { "died" } else { "home" };
        for h in (0..=STAY_HOURS).step_by(6) {
            let late = h > STAY_HOURS - 72;
            let department = if dies && h > STAY_HOURS - 24 { "ICU" } else { "WARD" };
            let time = (start() + Duration::hours(h)).format("%Y-%m-%d %H:%M:%S");
            let baseline = if dies && late { 125.0 } else { 72.0 };
            let hr = baseline + rng.gen_range(-4.0..4.0);
            let crp = 10.0 + rng.gen_range(0.0..5.0);
            for (variable, value) in [("HR", hr), ("CRP", crp)] {
                writeln!(
                    text,
                    "P{p}\t{time}\t{variable}\t{value:.3}\t{age}\t{bmi}\t{dest}\t{department}"
                )
                .unwrap();
            }
        }
    }
    let path = dir.join("measurements.tsv");
    fs::write(&path, text).unwrap();
    path
}

/// A configuration with a small search space so the tests stay quick.
pub fn small_config(data_path: &Path, output_dir: &Path, model: &str) -> String {
    format!(
        r#"data_path = "{}"
output_dir = "{}"
variables = ["HR", "CRP"]
model = "{model}"

[sampling]
pred_window = 72.0
int_pos = 24.0
int_neg = 24.0
feature_window = 3

[search]
cv_folds = 3

[search.logistic]
penalties = ["l1", "l2"]
c_values = [0.1, 1.0]

[search.forest]
n_estimators = [15]
max_features = [{{ kind = "sqrt" }}]
max_depth = [3]
"#,
        data_path.display(),
        output_dir.display()
    )
}
