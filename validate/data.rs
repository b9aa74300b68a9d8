//! # Cohort Data Model and Loading
//!
//! Holds the tabular structures the validation engine operates on and the
//! single entry point for user-provided cohort files.
//!
//! - Missing predictor values are stored as `NaN` inside an `ndarray` matrix.
//!   Outcomes are exactly 0 or 1 and may never be missing.
//! - Two typed handles separate the roles a dataset can play. A
//!   [`ReferenceCohort`] is the fixed set of subjects every model is scored
//!   on. A [`FittingSample`] is a completed dataset a model may be fitted on
//!   and offers no scoring path, so a resample can never be scored by accident.
//! - Loading uses the `polars` CSV reader on tab-separated files, like the
//!   rest of the tooling around this engine.

use ahash::AHashMap;
use ndarray::{Array1, Array2, ArrayView1, Axis};
use polars::prelude::*;
use rand::Rng;
use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

/// Column names shared by every row of a dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    pub predictors: Vec<String>,
    pub outcome: String,
}

impl Schema {
    pub fn new(predictors: Vec<String>, outcome: impl Into<String>) -> Self {
        Self {
            predictors,
            outcome: outcome.into(),
        }
    }

    pub fn predictor_index(&self, name: &str) -> Option<usize> {
        self.predictors.iter().position(|p| p == name)
    }

    /// True when `name` is a predictor or the outcome.
    pub fn has_column(&self, name: &str) -> bool {
        name == self.outcome || self.predictor_index(name).is_some()
    }
}

/// A comprehensive error type for data loading and dataset construction.
#[derive(Error, Debug)]
pub enum DataError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    PolarsError(#[from] PolarsError),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error(
        "The required column '{0}' was not found in the input file. Please check spelling and case."
    )]
    ColumnNotFound(String),
    #[error(
        "The column '{column_name}' could not be converted to the expected type '{expected_type}'. (Found type: {found_type})"
    )]
    ColumnWrongType {
        column_name: String,
        expected_type: &'static str,
        found_type: String,
    },
    #[error("Missing values were found in the outcome column '{0}'. Outcomes must be complete.")]
    MissingOutcome(String),
    #[error("Outcome value {value} in row {row} is not 0 or 1.")]
    NonBinaryOutcome { row: usize, value: f64 },
    #[error("Infinite values were found in column '{0}'. Only finite values or nulls are allowed.")]
    NonFiniteValuesFound(String),
    #[error(
        "Input file contains only {found} data rows, but at least {required} are required for validation."
    )]
    InsufficientRows { found: usize, required: usize },
    #[error("Subject identifier '{0}' occurs more than once.")]
    DuplicateSubjectId(String),
    #[error("Data row {row} has no value in the subject identifier column '{column}'.")]
    MissingSubjectId { column: String, row: usize },
    #[error("Dataset shape mismatch: {0}")]
    ShapeMismatch(String),
    #[error("A fitting sample must be complete, but column '{column}' has {missing} missing values.")]
    IncompleteFittingSample { column: String, missing: usize },
}

/// An ordered sequence of rows sharing one schema.
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    schema: Arc<Schema>,
    /// Shape `[n_rows, n_predictors]`, `NaN` marks a missing value.
    predictors: Array2<f64>,
    outcomes: Array1<f64>,
}

impl Dataset {
    pub fn new(
        schema: Arc<Schema>,
        predictors: Array2<f64>,
        outcomes: Array1<f64>,
    ) -> Result<Self, DataError> {
        if predictors.ncols() != schema.predictors.len() {
            return Err(DataError::ShapeMismatch(format!(
                "{} predictor columns for a schema of {}",
                predictors.ncols(),
                schema.predictors.len()
            )));
        }
        if predictors.nrows() != outcomes.len() {
            return Err(DataError::ShapeMismatch(format!(
                "{} predictor rows but {} outcomes",
                predictors.nrows(),
                outcomes.len()
            )));
        }
        if let Some((row, &value)) = outcomes
            .iter()
            .enumerate()
            .find(|&(_, &v)| v != 0.0 && v != 1.0)
        {
            return Err(DataError::NonBinaryOutcome { row, value });
        }
        for (j, column) in predictors.axis_iter(Axis(1)).enumerate() {
            if column.iter().any(|v| v.is_infinite()) {
                return Err(DataError::NonFiniteValuesFound(schema.predictors[j].clone()));
            }
        }
        Ok(Self {
            schema,
            predictors,
            outcomes,
        })
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn n_rows(&self) -> usize {
        self.outcomes.len()
    }

    pub fn predictors(&self) -> &Array2<f64> {
        &self.predictors
    }

    pub fn outcomes(&self) -> &Array1<f64> {
        &self.outcomes
    }

    /// Values of a predictor or of the outcome column.
    pub fn column(&self, name: &str) -> Option<ArrayView1<'_, f64>> {
        if name == self.schema.outcome {
            return Some(self.outcomes.view());
        }
        self.schema
            .predictor_index(name)
            .map(|j| self.predictors.column(j))
    }

    pub fn missing_count(&self, name: &str) -> usize {
        self.column(name)
            .map(|c| c.iter().filter(|v| v.is_nan()).count())
            .unwrap_or(0)
    }

    pub fn is_complete(&self) -> bool {
        !self.predictors.iter().any(|v| v.is_nan())
    }

    pub fn prevalence(&self) -> f64 {
        self.outcomes.mean().unwrap_or(f64::NAN)
    }

    /// Copies the given rows, in order and with repetition, into a dataset.
    pub fn select_rows(&self, rows: &[usize]) -> Dataset {
        Dataset {
            schema: Arc::clone(&self.schema),
            predictors: self.predictors.select(Axis(0), rows),
            outcomes: self.outcomes.select(Axis(0), rows),
        }
    }

    /// Draws `n_rows` rows uniformly with replacement.
    pub fn resample<R: Rng>(&self, rng: &mut R) -> Dataset {
        let n = self.n_rows();
        let rows: Vec<usize> = (0..n).map(|_| rng.gen_range(0..n)).collect();
        self.select_rows(&rows)
    }

    /// Replaces a predictor column, leaving everything else untouched.
    pub(crate) fn replace_predictor(&mut self, index: usize, values: Array1<f64>) {
        self.predictors.column_mut(index).assign(&values);
    }
}

/// One row of the reference cohort together with its attached predictions.
#[derive(Debug, Clone, PartialEq)]
pub struct Subject<'a> {
    pub id: &'a str,
    /// Predictor values in schema order, `None` where the raw value was missing.
    pub predictors: Vec<Option<f64>>,
    pub outcome: bool,
    /// Predicted probability per model, in model name order.
    pub predictions: Vec<(&'a str, f64)>,
}

/// The fixed cohort every fitted model is scored on.
///
/// Row `i` of `raw`, `completed` and of every attached prediction vector all
/// belong to the subject `ids[i]`; that alignment never changes during a run.
#[derive(Debug, Clone)]
pub struct ReferenceCohort {
    ids: Vec<String>,
    id_index: AHashMap<String, usize>,
    raw: Dataset,
    completed: Dataset,
    predictions: BTreeMap<String, Array1<f64>>,
}

impl ReferenceCohort {
    /// Builds the cohort from raw rows and their single-pass imputed completion.
    pub fn new(ids: Vec<String>, raw: Dataset, completed: Dataset) -> Result<Self, DataError> {
        if ids.len() != raw.n_rows() || completed.n_rows() != raw.n_rows() {
            return Err(DataError::ShapeMismatch(format!(
                "{} subject ids, {} raw rows, {} completed rows",
                ids.len(),
                raw.n_rows(),
                completed.n_rows()
            )));
        }
        if raw.schema() != completed.schema() || raw.outcomes() != completed.outcomes() {
            return Err(DataError::ShapeMismatch(
                "completed rows do not share the raw schema and outcomes".to_string(),
            ));
        }
        ensure_complete(&completed)?;

        let mut id_index = AHashMap::with_capacity(ids.len());
        for (i, id) in ids.iter().enumerate() {
            if id_index.insert(id.clone(), i).is_some() {
                return Err(DataError::DuplicateSubjectId(id.clone()));
            }
        }
        Ok(Self {
            ids,
            id_index,
            raw,
            completed,
            predictions: BTreeMap::new(),
        })
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.id_index.get(id).copied()
    }

    /// The rows as loaded, including missing values; the resampling population.
    pub fn raw(&self) -> &Dataset {
        &self.raw
    }

    /// The rows after single-pass imputation; what models are scored on.
    pub fn completed(&self) -> &Dataset {
        &self.completed
    }

    pub fn outcomes(&self) -> &Array1<f64> {
        self.completed.outcomes()
    }

    /// Attaches (or overwrites) a model's predictions, one per subject in row order.
    pub fn attach_predictions(
        &mut self,
        model: &str,
        predictions: Array1<f64>,
    ) -> Result<(), DataError> {
        if predictions.len() != self.len() {
            return Err(DataError::ShapeMismatch(format!(
                "{} predictions for {} subjects",
                predictions.len(),
                self.len()
            )));
        }
        self.predictions.insert(model.to_string(), predictions);
        Ok(())
    }

    pub fn predictions(&self, model: &str) -> Option<&Array1<f64>> {
        self.predictions.get(model)
    }

    pub fn subject(&self, row: usize) -> Option<Subject<'_>> {
        let id = self.ids.get(row)?;
        let predictors = self
            .raw
            .predictors()
            .row(row)
            .iter()
            .map(|&v| if v.is_nan() { None } else { Some(v) })
            .collect();
        let predictions = self
            .predictions
            .iter()
            .map(|(name, values)| (name.as_str(), values[row]))
            .collect();
        Some(Subject {
            id,
            predictors,
            outcome: self.raw.outcomes()[row] == 1.0,
            predictions,
        })
    }

    pub fn subject_by_id(&self, id: &str) -> Option<Subject<'_>> {
        self.position(id).and_then(|row| self.subject(row))
    }
}

/// A complete dataset a model may be fitted on, tagged with the bootstrap
/// iteration that produced it (0 for the reference fit).
#[derive(Debug, Clone)]
pub struct FittingSample {
    iteration: usize,
    data: Dataset,
}

impl FittingSample {
    pub fn new(iteration: usize, data: Dataset) -> Result<Self, DataError> {
        ensure_complete(&data)?;
        Ok(Self { iteration, data })
    }

    /// The iteration-0 sample: the completed reference cohort itself.
    pub fn reference(cohort: &ReferenceCohort) -> Self {
        Self {
            iteration: 0,
            data: cohort.completed().clone(),
        }
    }

    pub fn iteration(&self) -> usize {
        self.iteration
    }

    pub fn data(&self) -> &Dataset {
        &self.data
    }
}

fn ensure_complete(data: &Dataset) -> Result<(), DataError> {
    for name in &data.schema().predictors {
        let missing = data.missing_count(name);
        if missing > 0 {
            return Err(DataError::IncompleteFittingSample {
                column: name.clone(),
                missing,
            });
        }
    }
    Ok(())
}

/// A cohort file as loaded, before imputation.
#[derive(Debug)]
pub struct LoadedCohort {
    pub ids: Vec<String>,
    pub data: Dataset,
}

/// Loads a tab-separated cohort file. `id_column` may be absent, in which
/// case sequential 1-based identifiers are generated.
pub fn load_cohort(
    path: &Path,
    id_column: &str,
    predictors: &[String],
    outcome: &str,
) -> Result<LoadedCohort, DataError> {
    internal::load_cohort(path, id_column, predictors, outcome)
}

/// Internal module for the polars-backed loading logic.
mod internal {
    use super::*;

    pub(super) const MINIMUM_ROWS: usize = 20;

    fn extract_nullable_column(df: &DataFrame, column_name: &str) -> Result<Vec<f64>, DataError> {
        let series = df.column(column_name)?;
        let casted = series
            .cast(&DataType::Float64)
            .map_err(|_| DataError::ColumnWrongType {
                column_name: column_name.to_string(),
                expected_type: "f64 (numeric)",
                found_type: format!("{:?}", series.dtype()),
            })?;
        // A cast that produces more nulls than the source had means non-numeric text.
        if casted.null_count() > series.null_count() {
            return Err(DataError::ColumnWrongType {
                column_name: column_name.to_string(),
                expected_type: "f64 (numeric)",
                found_type: format!("{:?}", series.dtype()),
            });
        }
        let values: Vec<f64> = casted
            .f64()?
            .into_iter()
            .map(|v| v.unwrap_or(f64::NAN))
            .collect();
        if values.iter().any(|v| v.is_infinite()) {
            return Err(DataError::NonFiniteValuesFound(column_name.to_string()));
        }
        Ok(values)
    }

    fn build_subject_ids(df: &DataFrame, id_column: &str, n: usize) -> Result<Vec<String>, DataError> {
        if !df.get_column_names().iter().any(|c| c.as_str() == id_column) {
            log::info!("No '{id_column}' column found; generating sequential subject ids");
            return Ok((1..=n).map(|i| i.to_string()).collect());
        }

        let series = df.column(id_column)?;
        let mut ids = Vec::with_capacity(n);
        for i in 0..n {
            let text = match series.get(i).unwrap_or(AnyValue::Null) {
                AnyValue::Null => String::new(),
                AnyValue::String(text) => text.trim().to_string(),
                other => other.to_string(),
            };
            // A generated id could collide with a real one.
            if text.is_empty() {
                return Err(DataError::MissingSubjectId {
                    column: id_column.to_string(),
                    row: i + 1,
                });
            }
            ids.push(text);
        }
        Ok(ids)
    }

    pub(super) fn load_cohort(
        path: &Path,
        id_column: &str,
        predictors: &[String],
        outcome: &str,
    ) -> Result<LoadedCohort, DataError> {
        log::info!("Loading cohort from '{}'", path.display());

        let df = CsvReader::new(File::open(path)?)
            .with_options(
                CsvReadOptions::default()
                    .with_has_header(true)
                    .with_parse_options(CsvParseOptions::default().with_separator(b'\t')),
            )
            .finish()?;

        if df.height() < MINIMUM_ROWS {
            return Err(DataError::InsufficientRows {
                found: df.height(),
                required: MINIMUM_ROWS,
            });
        }

        let columns_set: HashSet<String> = df
            .get_column_names()
            .into_iter()
            .map(|s| s.to_string())
            .collect();
        for col_name in predictors.iter().map(String::as_str).chain([outcome]) {
            if !columns_set.contains(col_name) {
                return Err(DataError::ColumnNotFound(col_name.to_string()));
            }
        }

        let n = df.height();
        let outcome_values = extract_nullable_column(&df, outcome)?;
        if outcome_values.iter().any(|v| v.is_nan()) {
            return Err(DataError::MissingOutcome(outcome.to_string()));
        }

        let mut matrix = Array2::zeros((n, predictors.len()));
        for (j, name) in predictors.iter().enumerate() {
            let values = extract_nullable_column(&df, name)?;
            let missing = values.iter().filter(|v| v.is_nan()).count();
            if missing > 0 {
                log::info!(
                    "Column '{name}' has {missing} missing values ({:.2}%)",
                    100.0 * missing as f64 / n as f64
                );
            }
            matrix.column_mut(j).assign(&Array1::from_vec(values));
        }

        let ids = build_subject_ids(&df, id_column, n)?;
        let schema = Arc::new(Schema::new(predictors.to_vec(), outcome));
        let data = Dataset::new(schema, matrix, Array1::from_vec(outcome_values))?;
        log::info!(
            "Loaded {} subjects, {} predictors, outcome prevalence {:.3}",
            n,
            predictors.len(),
            data.prevalence()
        );
        Ok(LoadedCohort { ids, data })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::io::Write;

    fn small_dataset() -> Dataset {
        let schema = Arc::new(Schema::new(vec!["score".into(), "age".into()], "outcome"));
        Dataset::new(
            schema,
            array![[1.0, 50.0], [2.0, f64::NAN], [3.0, 70.0]],
            array![0.0, 1.0, 1.0],
        )
        .unwrap()
    }

    #[test]
    fn dataset_rejects_non_binary_outcomes() {
        let schema = Arc::new(Schema::new(vec!["score".into()], "outcome"));
        let err = Dataset::new(schema, array![[1.0], [2.0]], array![0.0, 2.0]).unwrap_err();
        assert!(matches!(err, DataError::NonBinaryOutcome { row: 1, .. }));
    }

    #[test]
    fn column_lookup_covers_outcome_and_missingness() {
        let data = small_dataset();
        assert_eq!(data.column("outcome").unwrap().to_vec(), vec![0.0, 1.0, 1.0]);
        assert_eq!(data.missing_count("age"), 1);
        assert_eq!(data.missing_count("score"), 0);
        assert!(!data.is_complete());
        assert!(data.column("bmi").is_none());
    }

    #[test]
    fn resample_keeps_size_and_schema() {
        let data = small_dataset();
        let mut rng = StdRng::seed_from_u64(3);
        let resampled = data.resample(&mut rng);
        assert_eq!(resampled.n_rows(), 3);
        assert_eq!(resampled.schema(), data.schema());
    }

    #[test]
    fn fitting_sample_requires_complete_rows() {
        let err = FittingSample::new(1, small_dataset()).unwrap_err();
        assert!(matches!(
            err,
            DataError::IncompleteFittingSample { ref column, missing: 1 } if column == "age"
        ));
    }

    #[test]
    fn reference_cohort_rejects_duplicate_ids() {
        let mut completed = small_dataset();
        completed.replace_predictor(1, array![50.0, 60.0, 70.0]);
        let ids = vec!["a".to_string(), "b".to_string(), "a".to_string()];
        let err = ReferenceCohort::new(ids, small_dataset(), completed).unwrap_err();
        assert!(matches!(err, DataError::DuplicateSubjectId(ref id) if id == "a"));
    }

    #[test]
    fn subjects_expose_raw_values_and_predictions() {
        let mut completed = small_dataset();
        completed.replace_predictor(1, array![50.0, 60.0, 70.0]);
        let ids = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let mut cohort = ReferenceCohort::new(ids, small_dataset(), completed).unwrap();
        cohort
            .attach_predictions("score alone", array![0.1, 0.2, 0.3])
            .unwrap();
        let subject = cohort.subject_by_id("b").unwrap();
        assert_eq!(subject.predictors, vec![Some(2.0), None]);
        assert!(subject.outcome);
        assert_eq!(subject.predictions, vec![("score alone", 0.2)]);
        assert!(cohort.attach_predictions("bad", array![0.1]).is_err());
    }

    #[test]
    fn load_cohort_reads_nulls_as_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cohort.tsv");
        let mut file = File::create(&path).unwrap();
        writeln!(file, "id\tscore\tage\toutcome").unwrap();
        for i in 0..25 {
            let age = if i == 3 { String::new() } else { format!("{}", 40 + i) };
            writeln!(file, "s{i}\t{}\t{age}\t{}", i % 9 + 1, i % 2).unwrap();
        }
        drop(file);

        let loaded = load_cohort(
            &path,
            "id",
            &["score".to_string(), "age".to_string()],
            "outcome",
        )
        .unwrap();
        assert_eq!(loaded.ids.len(), 25);
        assert_eq!(loaded.ids[0], "s0");
        assert_eq!(loaded.data.missing_count("age"), 1);
        assert!(loaded.data.predictors()[(3, 1)].is_nan());
    }

    #[test]
    fn load_cohort_rejects_blank_subject_ids() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cohort.tsv");
        let mut file = File::create(&path).unwrap();
        writeln!(file, "id\tscore\toutcome").unwrap();
        for i in 1..=25 {
            // Row 2 is blank, while a later row carries the id "2".
            let id = if i == 2 { String::new() } else { (i - 1).max(1).to_string() };
            writeln!(file, "{id}\t{}\t{}", i % 9 + 1, i % 2).unwrap();
        }
        drop(file);

        let err = load_cohort(&path, "id", &["score".to_string()], "outcome").unwrap_err();
        assert!(matches!(
            err,
            DataError::MissingSubjectId { ref column, row: 2 } if column == "id"
        ));
    }

    #[test]
    fn load_cohort_requires_minimum_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiny.tsv");
        std::fs::write(&path, "score\toutcome\n1\t0\n2\t1\n").unwrap();
        let err = load_cohort(&path, "id", &["score".to_string()], "outcome").unwrap_err();
        assert!(matches!(err, DataError::InsufficientRows { found: 2, .. }));
    }
}
