//! Writes a [`ValidationReport`] as tab-separated tables plus a TOML summary.
//!
//! Undefined metrics are written as `NA` in the tables and as `nan` in the
//! summary, so downstream readers never see an empty cell.

use crate::bootstrap::InstabilityResult;
use crate::pipeline::ValidationReport;
use csv::{Writer, WriterBuilder};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("Failed to create report file '{path}': {source}")]
    Create {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to write report table: {0}")]
    Csv(#[from] csv::Error),
    #[error("Failed to write report file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to serialize the report summary: {0}")]
    Toml(#[from] toml::ser::Error),
}

pub const SUMMARY_FILE: &str = "summary.toml";
pub const DISCRIMINATION_FILE: &str = "discrimination.tsv";
pub const CALIBRATION_FILE: &str = "calibration.tsv";
pub const CALIBRATION_CURVES_FILE: &str = "calibration_curves.tsv";
pub const COMPARISONS_FILE: &str = "comparisons.tsv";
pub const NET_BENEFIT_FILE: &str = "net_benefit.tsv";
pub const SUBJECT_INSTABILITY_FILE: &str = "subject_instability.tsv";
pub const STABILITY_CURVES_FILE: &str = "stability_curves.tsv";
pub const STABILITY_BANDS_FILE: &str = "stability_bands.tsv";

#[derive(Debug, Serialize)]
struct Summary<'a> {
    subjects: usize,
    events: usize,
    prevalence: f64,
    imputed_values: usize,
    iterations_requested: usize,
    iterations_completed: usize,
    iterations_skipped: usize,
    iterations_timed_out: usize,
    models: Vec<ModelSummary<'a>>,
}

#[derive(Debug, Serialize)]
struct ModelSummary<'a> {
    name: &'a str,
    formula: &'a str,
    c_statistic: f64,
    c_statistic_lower: f64,
    c_statistic_upper: f64,
    calibration_intercept: f64,
    calibration_slope: f64,
    calibration_in_the_large: f64,
    brier: f64,
    observed_expected: f64,
    ici: f64,
    aic: f64,
    succeeded: usize,
    requested: usize,
    failure_rate: f64,
    instability_index: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    instability_unavailable: Option<&'a str>,
    failures: &'a BTreeMap<String, usize>,
}

/// Writes every report file into `dir`, creating it if needed, and returns the paths written.
pub fn write_report(report: &ValidationReport, dir: &Path) -> Result<Vec<PathBuf>, ReportError> {
    fs::create_dir_all(dir).map_err(|source| ReportError::Create {
        path: dir.to_path_buf(),
        source,
    })?;
    let written = vec![
        write_summary(report, &dir.join(SUMMARY_FILE))?,
        write_discrimination(report, &dir.join(DISCRIMINATION_FILE))?,
        write_calibration(report, &dir.join(CALIBRATION_FILE))?,
        write_calibration_curves(report, &dir.join(CALIBRATION_CURVES_FILE))?,
        write_comparisons(report, &dir.join(COMPARISONS_FILE))?,
        write_net_benefit(report, &dir.join(NET_BENEFIT_FILE))?,
        write_subject_instability(report, &dir.join(SUBJECT_INSTABILITY_FILE))?,
        write_stability_curves(report, &dir.join(STABILITY_CURVES_FILE))?,
        write_stability_bands(report, &dir.join(STABILITY_BANDS_FILE))?,
    ];
    log::info!("Wrote {} report files to '{}'", written.len(), dir.display());
    Ok(written)
}

fn tsv_writer(path: &Path) -> Result<Writer<File>, ReportError> {
    let file = File::create(path).map_err(|source| ReportError::Create {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(WriterBuilder::new().delimiter(b'\t').from_writer(file))
}

fn value(v: f64) -> String {
    if v.is_nan() { "NA".to_string() } else { format!("{v:.12}") }
}

fn optional(v: Option<f64>) -> String {
    v.map(value).unwrap_or_else(|| "NA".to_string())
}

fn write_summary(report: &ValidationReport, path: &Path) -> Result<PathBuf, ReportError> {
    let models = report
        .models
        .iter()
        .zip(&report.stability.models)
        .map(|(model, stability)| {
            let (instability_index, unavailable) = match &stability.instability {
                InstabilityResult::Available(result) => (result.instability_index, None),
                InstabilityResult::Unavailable { reason } => (f64::NAN, Some(reason.as_str())),
            };
            ModelSummary {
                name: &model.name,
                formula: &model.formula,
                c_statistic: model.discrimination.c_statistic,
                c_statistic_lower: model.discrimination.lower,
                c_statistic_upper: model.discrimination.upper,
                calibration_intercept: model.calibration.intercept,
                calibration_slope: model.calibration.slope,
                calibration_in_the_large: model.calibration.in_the_large,
                brier: model.calibration.brier,
                observed_expected: model.calibration.observed_expected,
                ici: model.calibration.ici,
                aic: model.aic,
                succeeded: stability.succeeded,
                requested: stability.requested,
                failure_rate: stability.failure_rate,
                instability_index,
                instability_unavailable: unavailable,
                failures: &stability.failures,
            }
        })
        .collect();
    let summary = Summary {
        subjects: report.subject_ids.len(),
        events: report.outcomes.iter().filter(|&&y| y == 1.0).count(),
        prevalence: report.prevalence,
        imputed_values: report.imputed_values,
        iterations_requested: report.stability.requested,
        iterations_completed: report.stability.completed,
        iterations_skipped: report.stability.skipped,
        iterations_timed_out: report.stability.timed_out,
        models,
    };
    fs::write(path, toml::to_string_pretty(&summary)?)?;
    Ok(path.to_path_buf())
}

fn write_discrimination(report: &ValidationReport, path: &Path) -> Result<PathBuf, ReportError> {
    let mut wtr = tsv_writer(path)?;
    wtr.write_record([
        "model",
        "c_statistic",
        "standard_error",
        "lower_95",
        "upper_95",
        "events",
        "non_events",
        "degenerate",
    ])?;
    for model in &report.models {
        let d = &model.discrimination;
        wtr.write_record([
            model.name.clone(),
            value(d.c_statistic),
            value(d.standard_error),
            value(d.lower),
            value(d.upper),
            d.events.to_string(),
            d.non_events.to_string(),
            d.degenerate.to_string(),
        ])?;
    }
    wtr.flush()?;
    Ok(path.to_path_buf())
}

fn write_calibration(report: &ValidationReport, path: &Path) -> Result<PathBuf, ReportError> {
    let mut wtr = tsv_writer(path)?;
    wtr.write_record([
        "model",
        "intercept",
        "slope",
        "in_the_large",
        "brier",
        "observed_expected",
        "ici",
        "degenerate",
    ])?;
    for model in &report.models {
        let c = &model.calibration;
        wtr.write_record([
            model.name.clone(),
            value(c.intercept),
            value(c.slope),
            value(c.in_the_large),
            value(c.brier),
            value(c.observed_expected),
            value(c.ici),
            c.degenerate.to_string(),
        ])?;
    }
    wtr.flush()?;
    Ok(path.to_path_buf())
}

fn write_calibration_curves(report: &ValidationReport, path: &Path) -> Result<PathBuf, ReportError> {
    let mut wtr = tsv_writer(path)?;
    wtr.write_record(["model", "predicted", "observed"])?;
    for model in &report.models {
        let curve = &model.calibration.curve;
        for (x, y) in curve.grid.iter().zip(&curve.observed) {
            wtr.write_record([model.name.clone(), value(*x), value(*y)])?;
        }
    }
    wtr.flush()?;
    Ok(path.to_path_buf())
}

fn write_comparisons(report: &ValidationReport, path: &Path) -> Result<PathBuf, ReportError> {
    let comparison = &report.comparison;
    let mut wtr = tsv_writer(path)?;
    wtr.write_record(["test", "first", "second", "statistic", "df", "p_value", "note"])?;
    for info in &comparison.information {
        wtr.write_record([
            "aic".to_string(),
            info.model.clone(),
            String::new(),
            value(info.aic),
            info.parameters.to_string(),
            "NA".to_string(),
            format!("deviance {}", value(info.deviance)),
        ])?;
    }
    for pair in &comparison.pairs {
        wtr.write_record([
            "likelihood_ratio".to_string(),
            pair.reduced.clone(),
            pair.full.clone(),
            value(pair.statistic),
            pair.df.to_string(),
            value(pair.p_value),
            if pair.nested { "nested" } else { "not nested" }.to_string(),
        ])?;
    }
    for probe in &comparison.linearity {
        wtr.write_record([
            "linearity".to_string(),
            probe.predictor.clone(),
            format!("rcs({}, {})", probe.predictor, probe.knots),
            value(probe.statistic),
            probe.df.to_string(),
            value(probe.p_value),
            probe.failure.clone().unwrap_or_default(),
        ])?;
    }
    wtr.flush()?;
    Ok(path.to_path_buf())
}

fn write_net_benefit(report: &ValidationReport, path: &Path) -> Result<PathBuf, ReportError> {
    let curve = &report.decision_curve;
    let mut wtr = tsv_writer(path)?;
    let mut header = vec![
        "threshold".to_string(),
        "flagged".to_string(),
        "treat_all".to_string(),
        "treat_none".to_string(),
    ];
    header.extend(curve.model_names.iter().cloned());
    wtr.write_record(&header)?;
    for row in &curve.rows {
        let mut record = vec![
            value(row.threshold),
            row.flagged.to_string(),
            optional(row.treat_all),
            optional(row.treat_none),
        ];
        record.extend(row.models.iter().map(|v| optional(*v)));
        wtr.write_record(&record)?;
    }
    wtr.flush()?;
    Ok(path.to_path_buf())
}

fn write_subject_instability(
    report: &ValidationReport,
    path: &Path,
) -> Result<PathBuf, ReportError> {
    let mut wtr = tsv_writer(path)?;
    wtr.write_record([
        "subject_id",
        "model",
        "outcome",
        "reference_prediction",
        "mape",
        "bootstrap_mean",
        "bootstrap_sd",
    ])?;
    for (model, stability) in report.models.iter().zip(&report.stability.models) {
        let per_subject = stability.instability.available();
        for (i, id) in report.subject_ids.iter().enumerate() {
            let at = |values: Option<&Vec<f64>>| optional(values.and_then(|v| v.get(i).copied()));
            wtr.write_record([
                id.clone(),
                model.name.clone(),
                value(report.outcomes[i]),
                at(Some(&model.predictions)),
                at(per_subject.map(|s| &s.mape)),
                at(per_subject.map(|s| &s.mean)),
                at(per_subject.map(|s| &s.sd)),
            ])?;
        }
    }
    wtr.flush()?;
    Ok(path.to_path_buf())
}

fn write_stability_curves(report: &ValidationReport, path: &Path) -> Result<PathBuf, ReportError> {
    let mut wtr = tsv_writer(path)?;
    wtr.write_record(["model", "iteration", "predicted", "observed"])?;
    for stability in &report.stability.models {
        let grid = &stability.reference_curve.grid;
        let reference = std::iter::once((0, &stability.reference_curve.observed));
        let resampled = stability.curves.iter().map(|(i, c)| (*i, c));
        for (iteration, curve) in reference.chain(resampled) {
            for (x, y) in grid.iter().zip(curve) {
                wtr.write_record([
                    stability.model.clone(),
                    iteration.to_string(),
                    value(*x),
                    value(*y),
                ])?;
            }
        }
    }
    wtr.flush()?;
    Ok(path.to_path_buf())
}

fn write_stability_bands(report: &ValidationReport, path: &Path) -> Result<PathBuf, ReportError> {
    let mut wtr = tsv_writer(path)?;
    wtr.write_record(["model", "predicted", "lower_2_5", "median", "upper_97_5"])?;
    for stability in &report.stability.models {
        for band in &stability.bands {
            wtr.write_record([
                stability.model.clone(),
                value(band.predicted),
                value(band.lower),
                value(band.median),
                value(band.upper),
            ])?;
        }
    }
    wtr.flush()?;
    Ok(path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn undefined_values_are_written_as_na() {
        assert_eq!(value(f64::NAN), "NA");
        assert_eq!(value(0.25), "0.250000000000");
        assert_eq!(optional(None), "NA");
        assert_eq!(optional(Some(f64::NAN)), "NA");
        assert_eq!(optional(Some(-1.0)), "-1.000000000000");
    }

    #[test]
    fn unwritable_directory_is_reported_with_its_path() {
        let tmp = tempdir().unwrap();
        let blocker = tmp.path().join("taken");
        fs::write(&blocker, "not a directory").unwrap();
        let err = tsv_writer(&blocker.join("table.tsv")).unwrap_err();
        match err {
            ReportError::Create { path, .. } => assert!(path.ends_with("table.tsv")),
            other => panic!("unexpected error {other:?}"),
        }
    }
}
