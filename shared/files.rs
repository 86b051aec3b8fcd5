//! Tab-separated output tables and the feature-table reader used for inference.

use crate::features::sampling::LabeledSamples;
use crate::learn::metrics::PrecisionRecallCurve;
use ndarray::{Array1, Array2, ArrayView1};
use std::io;
use std::path::Path;
use thiserror::Error;

pub const ID_COLUMN: &str = "ID";
pub const LABEL_COLUMN: &str = "LABEL";

#[derive(Error, Debug)]
pub enum FileError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Malformed table: {0}")]
    Csv(#[from] csv::Error),
    #[error("Could not parse '{value}' in column '{column}' at row {row} as a number.")]
    Parse {
        value: String,
        column: String,
        row: usize,
    },
    #[error("Table '{0}' has no feature columns.")]
    NoFeatures(String),
}

fn tsv_writer(path: &Path) -> Result<csv::Writer<std::fs::File>, FileError> {
    Ok(csv::WriterBuilder::new().delimiter(b'\t').from_path(path)?)
}

/// Writes one row per window: `ID`, `LABEL`, then every feature.
pub fn write_labeled_samples(path: &Path, samples: &LabeledSamples) -> Result<(), FileError> {
    let mut writer = tsv_writer(path)?;
    let header = [ID_COLUMN, LABEL_COLUMN]
        .into_iter()
        .chain(samples.feature_names.iter().map(String::as_str));
    writer.write_record(header)?;
    for ((id, label), row) in samples
        .patient_ids
        .iter()
        .zip(samples.y.iter())
        .zip(samples.x.rows())
    {
        let mut record = Vec::with_capacity(row.len() + 2);
        record.push(id.clone());
        record.push(format!("{}", *label as u8));
        record.extend(row.iter().map(f64::to_string));
        writer.write_record(&record)?;
    }
    writer.flush()?;
    Ok(())
}

/// A feature table as read back from disk.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureTable {
    pub patient_ids: Option<Vec<String>>,
    pub feature_names: Vec<String>,
    pub x: Array2<f64>,
    pub labels: Option<Array1<f64>>,
}

/// Reads a tab-separated feature table. `ID` and `LABEL` columns are optional;
/// every other column is a numeric feature.
pub fn read_feature_table(path: &Path) -> Result<FeatureTable, FileError> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .from_path(path)?;
    let headers = reader.headers()?.clone();
    let id_index = headers.iter().position(|h| h == ID_COLUMN);
    let label_index = headers.iter().position(|h| h == LABEL_COLUMN);
    let feature_indices: Vec<usize> = (0..headers.len())
        .filter(|&i| Some(i) != id_index && Some(i) != label_index)
        .collect();
    if feature_indices.is_empty() {
        return Err(FileError::NoFeatures(path.display().to_string()));
    }

    let parse = |record: &csv::StringRecord, column: usize, row: usize| {
        let value = record.get(column).unwrap_or("");
        value.trim().parse::<f64>().map_err(|_| FileError::Parse {
            value: value.to_string(),
            column: headers.get(column).unwrap_or("").to_string(),
            row,
        })
    };

    let mut ids = Vec::new();
    let mut labels = Vec::new();
    let mut values = Vec::new();
    let mut n_rows = 0;
    for (row, record) in reader.records().enumerate() {
        let record = record?;
        if let Some(i) = id_index {
            ids.push(record.get(i).unwrap_or("").to_string());
        }
        if let Some(i) = label_index {
            labels.push(parse(&record, i, row + 1)?);
        }
        for &column in &feature_indices {
            values.push(parse(&record, column, row + 1)?);
        }
        n_rows += 1;
    }

    let x = Array2::from_shape_vec((n_rows, feature_indices.len()), values)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok(FeatureTable {
        patient_ids: id_index.map(|_| ids),
        feature_names: feature_indices
            .iter()
            .map(|&i| headers.get(i).unwrap_or("").to_string())
            .collect(),
        x,
        labels: label_index.map(|_| Array1::from_vec(labels)),
    })
}

/// Writes per-window probabilities with the hard prediction at `threshold`.
pub fn write_predictions(
    path: &Path,
    patient_ids: Option<&[String]>,
    labels: Option<ArrayView1<f64>>,
    probabilities: ArrayView1<f64>,
    threshold: f64,
) -> Result<(), FileError> {
    let mut writer = tsv_writer(path)?;
    let mut header = Vec::new();
    if patient_ids.is_some() {
        header.push(ID_COLUMN);
    }
    if labels.is_some() {
        header.push(LABEL_COLUMN);
    }
    header.extend(["PROBABILITY", "PREDICTION"]);
    writer.write_record(&header)?;

    for (row, &p) in probabilities.iter().enumerate() {
        let mut record = Vec::with_capacity(header.len());
        if let Some(ids) = patient_ids {
            record.push(ids.get(row).cloned().unwrap_or_default());
        }
        if let Some(labels) = labels {
            record.push(format!("{}", labels[row] as u8));
        }
        record.push(format!("{p:.6}"));
        record.push(u8::from(p > threshold).to_string());
        writer.write_record(&record)?;
    }
    writer.flush()?;
    Ok(())
}

pub fn write_pr_curve(path: &Path, curve: &PrecisionRecallCurve) -> Result<(), FileError> {
    let mut writer = tsv_writer(path)?;
    writer.write_record(["THRESHOLD", "PRECISION", "RECALL"])?;
    for (i, (precision, recall)) in curve.precision.iter().zip(&curve.recall).enumerate() {
        let threshold = curve
            .thresholds
            .get(i)
            .map_or_else(String::new, |t| format!("{t:.6}"));
        writer.write_record([threshold, format!("{precision:.6}"), format!("{recall:.6}")])?;
    }
    writer.flush()?;
    Ok(())
}

/// Writes features ranked by mean absolute attribution.
pub fn write_attributions(path: &Path, ranked: &[(&str, f64)]) -> Result<(), FileError> {
    let mut writer = tsv_writer(path)?;
    writer.write_record(["FEATURE", "MEAN_ABS_ATTRIBUTION"])?;
    for (feature, importance) in ranked {
        writer.write_record([feature.to_string(), format!("{importance:.6}")])?;
    }
    writer.flush()?;
    Ok(())
}
