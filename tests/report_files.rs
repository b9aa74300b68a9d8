mod common;

use common::score_cohort;
use riskval::bootstrap::RunControl;
use riskval::config::ValidationConfig;
use riskval::data::load_cohort;
use riskval::model::IrlsFitter;
use riskval::pipeline::{ValidationError, run_validation};
use riskval::progress::NoopProgress;
use riskval::report::{
    NET_BENEFIT_FILE, SUBJECT_INSTABILITY_FILE, SUMMARY_FILE, write_report,
};
use std::fs;
use std::process::Command;
use tempfile::tempdir;

const TWO_MODEL_CONFIG: &str = r#"
[data]
outcome = "event"
predictors = ["score", "age"]

[bootstrap]
iterations = 8
seed = 42

[imputation]
targets = [{ column = "age", auxiliaries = ["score", "event"] }]

[[models]]
name = "score alone"
terms = [{ predictor = "score" }]

[[models]]
name = "score + age"
terms = [{ predictor = "score" }, { predictor = "age" }]
"#;

fn read_rows(path: &std::path::Path) -> Vec<Vec<String>> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .from_path(path)
        .expect("open table");
    reader
        .records()
        .map(|r| r.expect("row").iter().map(str::to_string).collect())
        .collect()
}

#[test]
fn incomplete_tsv_cohort_is_imputed_validated_and_written() {
    let tmp = tempdir().expect("temporary directory");
    let cohort = score_cohort(400, 21, 0.03);
    let cohort_path = tmp.path().join("cohort.tsv");
    cohort.write_tsv(&cohort_path);
    let missing = cohort.age.iter().filter(|a| a.is_nan()).count();
    assert!(missing > 0);

    let config = ValidationConfig::from_toml(TWO_MODEL_CONFIG).expect("config");
    let loaded = load_cohort(
        &cohort_path,
        &config.data.id_column,
        &config.data.predictors,
        &config.data.outcome,
    )
    .expect("load cohort");
    assert_eq!(loaded.ids[0], "S00001");
    assert_eq!(loaded.data.missing_count("age"), missing);

    let report = run_validation(
        &config,
        loaded,
        &IrlsFitter::default(),
        RunControl::default(),
        &NoopProgress,
    )
    .expect("validation run");
    assert_eq!(report.imputed_values, missing);
    assert_eq!(report.models.len(), 2);
    assert_eq!(report.comparison.pairs.len(), 1);
    assert!(report.comparison.pairs[0].nested);
    assert!(!report.comparison.linearity.is_empty());

    let out = tmp.path().join("report");
    let written = write_report(&report, &out).expect("write report");
    assert_eq!(written.len(), 9);
    assert!(written.iter().all(|p| p.exists()));

    let net_benefit = read_rows(&out.join(NET_BENEFIT_FILE));
    assert_eq!(
        net_benefit[0],
        ["threshold", "flagged", "treat_all", "treat_none", "score alone", "score + age"]
    );
    assert_eq!(net_benefit.len(), 1 + 51);

    let subjects = read_rows(&out.join(SUBJECT_INSTABILITY_FILE));
    assert_eq!(subjects.len(), 1 + 2 * 400);
    assert!(subjects[1..].iter().all(|row| row[4] != "NA"));

    let summary: toml::Table = fs::read_to_string(out.join(SUMMARY_FILE))
        .expect("read summary")
        .parse()
        .expect("summary is TOML");
    assert_eq!(summary["subjects"].as_integer(), Some(400));
    assert_eq!(summary["iterations_completed"].as_integer(), Some(8));
    assert_eq!(summary["models"].as_array().map(Vec::len), Some(2));
}

#[test]
fn missing_values_outside_the_imputation_targets_are_named() {
    let cohort = score_cohort(300, 21, 0.05);
    let missing = cohort.age.iter().filter(|a| a.is_nan()).count();
    assert!(missing > 0);
    let config = ValidationConfig::from_toml(&TWO_MODEL_CONFIG.replace(
        r#"targets = [{ column = "age", auxiliaries = ["score", "event"] }]"#,
        "targets = []",
    ))
    .expect("config");

    let err = run_validation(
        &config,
        cohort.loaded(&["score", "age"]),
        &IrlsFitter::default(),
        RunControl::default(),
        &NoopProgress,
    )
    .expect_err("age is incomplete and not imputed");
    match &err {
        ValidationError::MissingImputationTarget { column, missing: m } => {
            assert_eq!(column, "age");
            assert_eq!(*m, missing);
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert!(err.to_string().contains("[imputation] targets"));
}

#[test]
fn cli_writes_example_config_and_validates_with_it() {
    let tmp = tempdir().expect("temporary directory");
    let exe = env!("CARGO_BIN_EXE_riskval");

    let config_path = tmp.path().join("example.toml");
    let status = Command::new(exe)
        .args(["example-config", "--output", config_path.to_str().expect("path str")])
        .status()
        .expect("run riskval cli");
    assert!(status.success(), "CLI exited with status {status:?}");
    let example = ValidationConfig::load(&config_path).expect("example config loads");
    assert_eq!(example, ValidationConfig::example());

    let cohort_path = tmp.path().join("cohort.tsv");
    score_cohort(300, 4, 0.0).write_tsv(&cohort_path);
    let config_path = tmp.path().join("validation.toml");
    fs::write(&config_path, TWO_MODEL_CONFIG).expect("write config");

    let out = tmp.path().join("out");
    let status = Command::new(exe)
        .args([
            "validate",
            cohort_path.to_str().expect("path str"),
            "--config",
            config_path.to_str().expect("path str"),
            "--out",
            out.to_str().expect("path str"),
            "--iterations",
            "4",
            "--threads",
            "2",
        ])
        .status()
        .expect("run riskval cli");
    assert!(status.success(), "CLI exited with status {status:?}");
    assert!(out.join(SUMMARY_FILE).exists());
}

#[test]
fn cli_rejects_unknown_predictors() {
    let tmp = tempdir().expect("temporary directory");
    let cohort_path = tmp.path().join("cohort.tsv");
    score_cohort(100, 2, 0.0).write_tsv(&cohort_path);
    let config_path = tmp.path().join("validation.toml");
    fs::write(
        &config_path,
        TWO_MODEL_CONFIG.replace("{ predictor = \"age\" }", "{ predictor = \"bmi\" }"),
    )
    .expect("write config");

    let output = Command::new(env!("CARGO_BIN_EXE_riskval"))
        .args([
            "validate",
            cohort_path.to_str().expect("path str"),
            "--config",
            config_path.to_str().expect("path str"),
        ])
        .current_dir(tmp.path())
        .output()
        .expect("run riskval cli");
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("bmi"));
}
