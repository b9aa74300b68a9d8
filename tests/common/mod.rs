//! Synthetic cohorts shared by the integration tests.

use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use riskval::config::ValidationConfig;
use riskval::data::{Dataset, LoadedCohort, Schema};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

pub const OUTCOME: &str = "event";

/// A simulated cohort scored with an integer risk score from 1 to 9.
///
/// The true model is `logit P(event) = -3.14 + 0.35 * score`, which gives a
/// prevalence close to 20%. Age is a noisy function of the score and is
/// missing for a small share of subjects when requested.
pub struct SyntheticCohort {
    pub ids: Vec<String>,
    pub score: Vec<f64>,
    pub age: Vec<f64>,
    pub risk: Vec<f64>,
    pub outcome: Vec<f64>,
}

pub fn score_cohort(n: usize, seed: u64, missing_age: f64) -> SyntheticCohort {
    let mut rng = StdRng::seed_from_u64(seed);
    let noise = Normal::new(0.0, 8.0).unwrap();
    let mut cohort = SyntheticCohort {
        ids: Vec::with_capacity(n),
        score: Vec::with_capacity(n),
        age: Vec::with_capacity(n),
        risk: Vec::with_capacity(n),
        outcome: Vec::with_capacity(n),
    };
    for i in 0..n {
        let score = rng.gen_range(1..=9) as f64;
        let eta = -3.14 + 0.35 * score;
        let risk = 1.0 / (1.0 + (-eta).exp());
        let outcome = if rng.gen_range(0.0..1.0) < risk { 1.0 } else { 0.0 };
        let age = if rng.gen_range(0.0..1.0) < missing_age {
            f64::NAN
        } else {
            (50.0 + 3.0 * score + noise.sample(&mut rng)).round()
        };
        cohort.ids.push(format!("S{:05}", i + 1));
        cohort.score.push(score);
        cohort.age.push(age);
        cohort.risk.push(risk);
        cohort.outcome.push(outcome);
    }
    cohort
}

impl SyntheticCohort {
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// The cohort as the loader would return it, with the given predictors.
    pub fn loaded(&self, predictors: &[&str]) -> LoadedCohort {
        let n = self.len();
        let mut matrix = Array2::zeros((n, predictors.len()));
        for (j, name) in predictors.iter().enumerate() {
            let column = match *name {
                "score" => &self.score,
                "age" => &self.age,
                other => panic!("unknown synthetic column {other}"),
            };
            matrix.column_mut(j).assign(&Array1::from_vec(column.clone()));
        }
        let schema = Arc::new(Schema::new(
            predictors.iter().map(|s| s.to_string()).collect(),
            OUTCOME,
        ));
        let data = Dataset::new(schema, matrix, Array1::from_vec(self.outcome.clone()))
            .expect("synthetic cohort is valid");
        LoadedCohort {
            ids: self.ids.clone(),
            data,
        }
    }

    /// Writes a tab-separated cohort file; missing ages are empty cells.
    pub fn write_tsv(&self, path: &Path) {
        let mut file = std::fs::File::create(path).expect("create cohort file");
        writeln!(file, "id\tscore\tage\t{OUTCOME}").unwrap();
        for i in 0..self.len() {
            let age = if self.age[i].is_nan() {
                String::new()
            } else {
                format!("{}", self.age[i])
            };
            writeln!(
                file,
                "{}\t{}\t{}\t{}",
                self.ids[i], self.score[i], age, self.outcome[i]
            )
            .unwrap();
        }
    }
}

/// A configuration validating the score alone with `iterations` bootstrap iterations.
pub fn score_alone_config(iterations: usize, seed: u64) -> ValidationConfig {
    ValidationConfig::from_toml(&format!(
        r#"
[data]
outcome = "{OUTCOME}"
predictors = ["score"]

[bootstrap]
iterations = {iterations}
seed = {seed}

[[models]]
name = "score alone"
terms = [{{ predictor = "score" }}]
"#
    ))
    .expect("valid test configuration")
}
