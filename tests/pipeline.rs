mod common;

use std::fs;
use std::process::Command;

use approx::assert_abs_diff_eq;
use tempfile::tempdir;
use vigil::config::PipelineConfig;
use vigil::features::sampling::LabelType;
use vigil::learn::estimate::Hyperparameters;
use vigil::learn::model::{ModelKind, TrainedClassifier};
use vigil::pipeline::{self, RunReport};

fn config_for(model: &str) -> (tempfile::TempDir, PipelineConfig) {
    let tmp = tempdir().expect("temporary directory");
    let data = common::write_cohort(tmp.path(), 60, 2, 11);
    let out = tmp.path().join("out");
    let text = common::small_config(&data, &out, model);
    let config: PipelineConfig = toml::from_str(&text).expect("parse config");
    (tmp, config)
}

#[test]
fn logistic_run_writes_all_artifacts() {
    let (tmp, config) = config_for("LR");
    let report = pipeline::run(&config).expect("pipeline run");

    assert_eq!(report.model, ModelKind::LogisticRegression);
    assert!(matches!(report.params, Hyperparameters::Logistic(_)));
    assert_eq!(report.variables, vec!["HR".to_string(), "CRP".to_string()]);
    assert!(report.validation_auc > 0.9, "AUC {}", report.validation_auc);
    assert_eq!(report.test_auc, report.base_auc.max(report.optimized_auc));
    assert_eq!(report.top_features.len(), 2 + 3 * 2);
    assert!(report.top_features[0].name.starts_with("HR["));
    assert!(report.impurity_importances.is_empty());

    let out = tmp.path().join("out");
    for file in [
        pipeline::MODEL_FILE,
        pipeline::REPORT_FILE,
        pipeline::PREDICTIONS_FILE,
        pipeline::PR_CURVE_FILE,
        pipeline::ATTRIBUTIONS_FILE,
    ] {
        assert!(out.join(file).exists(), "{file} missing");
    }

    let written: RunReport =
        toml::from_str(&fs::read_to_string(out.join(pipeline::REPORT_FILE)).unwrap())
            .expect("report parses");
    assert_eq!(written.confusion, report.confusion);
    assert_eq!(written.windows, report.windows);

    let model = TrainedClassifier::load(out.join(pipeline::MODEL_FILE).to_str().unwrap())
        .expect("model loads");
    assert_eq!(model.feature_names[..2], ["AGE".to_string(), "BMI".to_string()]);

    let predictions = fs::read_to_string(out.join(pipeline::PREDICTIONS_FILE)).unwrap();
    let rows = predictions.lines().count() - 1;
    let val = report.windows.val;
    assert_eq!(rows, val.positive_samples + val.negative_samples);
}

#[test]
fn forest_run_then_infer_on_sampled_windows() {
    let (tmp, config) = config_for("RF");
    let report = pipeline::run(&config).expect("pipeline run");
    assert!(matches!(report.params, Hyperparameters::Forest(_)));
    assert!(report.validation_auc > 0.9, "AUC {}", report.validation_auc);
    assert_eq!(report.impurity_importances.len(), 2 + 3 * 2);
    let total: f64 = report.impurity_importances.iter().map(|e| e.importance).sum();
    assert_abs_diff_eq!(total, 1.0, epsilon = 1e-9);
    assert!(
        report
            .impurity_importances
            .windows(2)
            .all(|w| w[0].importance >= w[1].importance)
    );

    let prepared = pipeline::sample(&config).expect("sampling");
    let out = tmp.path().join("out");
    for name in ["train", "val", "test"] {
        assert!(out.join(format!("{name}_features.tsv")).exists());
    }

    let scored = tmp.path().join("scored.tsv");
    let probabilities = pipeline::infer(
        &out.join("val_features.tsv"),
        out.join(pipeline::MODEL_FILE).to_str().unwrap(),
        &scored,
    )
    .expect("inference");
    assert_eq!(probabilities.len(), prepared.val.len());
    assert!(probabilities.iter().all(|p| (0.0..=1.0).contains(p)));
    assert!(
        fs::read_to_string(&scored)
            .unwrap()
            .starts_with("ID\tLABEL\tPROBABILITY\tPREDICTION\n")
    );
}

#[test]
fn icu_labeling_and_undersampling() {
    let (_tmp, mut config) = config_for("LR");
    config.sampling.label = LabelType::Icu;
    config.balancing = vigil::learn::balance::BalanceStrategy::Undersample;
    let report = pipeline::run(&config).expect("pipeline run");
    assert!(report.windows.train.positive_patients > 0);
    assert!(report.validation_auc > 0.9, "AUC {}", report.validation_auc);
}

#[test]
fn splits_partition_the_patients() {
    let (_tmp, config) = config_for("LR");
    let prepared = pipeline::prepare_samples(&config).expect("prepare");
    let patients = |r: &vigil::features::sampling::SamplingReport| {
        r.positive_patients + r.negative_patients
    };
    // 60 patients: 15 validation, then 9 of the remaining 45 for testing.
    assert_eq!(patients(&prepared.reports.val), 15);
    assert_eq!(patients(&prepared.reports.test), 9);
    assert_eq!(patients(&prepared.reports.train), 36);

    let mut ids: Vec<&String> = prepared
        .train
        .patient_ids
        .iter()
        .chain(&prepared.val.patient_ids)
        .chain(&prepared.test.patient_ids)
        .collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 60);
}

#[test]
fn infer_rejects_mismatched_features() {
    let (tmp, config) = config_for("LR");
    pipeline::run(&config).expect("pipeline run");
    let table = tmp.path().join("other.tsv");
    fs::write(&table, "AGE\tBMI\n1\t2\n").unwrap();
    let model = tmp.path().join("out").join(pipeline::MODEL_FILE);
    let err = pipeline::infer(&table, model.to_str().unwrap(), &tmp.path().join("p.tsv"))
        .unwrap_err();
    assert!(matches!(err, pipeline::PipelineError::FeatureMismatch { .. }));
}

#[test]
fn cli_run_with_overrides() {
    let tmp = tempdir().expect("temporary directory");
    let data = common::write_cohort(tmp.path(), 40, 2, 5);
    let config_path = tmp.path().join("config.toml");
    fs::write(
        &config_path,
        common::small_config(&data, &tmp.path().join("ignored"), "RF"),
    )
    .unwrap();
    let out = tmp.path().join("cli_out");

    let status = Command::new(env!("CARGO_BIN_EXE_vigil"))
        .args([
            "run",
            "--config",
            config_path.to_str().unwrap(),
            "--output-dir",
            out.to_str().unwrap(),
            "--model",
            "lr",
            "--seed",
            "3",
        ])
        .status()
        .expect("run vigil cli");
    assert!(status.success(), "CLI exited with status {status:?}");
    assert!(out.join("model.toml").exists());
    assert!(!tmp.path().join("ignored").exists());

    let model = TrainedClassifier::load(out.join("model.toml").to_str().unwrap()).unwrap();
    assert!(matches!(model.params, Hyperparameters::Logistic(_)));
}
