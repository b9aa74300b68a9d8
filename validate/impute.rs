//! Single imputation of incomplete predictor columns by predictive mean matching.
//!
//! For every target column, a linear model of the target on its auxiliary
//! columns is fitted on the rows where everything is observed. Each missing
//! entry is then filled with the observed value of a donor drawn at random
//! from the `donors` observed rows whose predicted target is closest to the
//! incomplete row's prediction. Donated values are always real observations,
//! so imputed integer scores stay integers.

use crate::data::Dataset;
use crate::irls::{FitFailure, IrlsOptions, fit_glm};
use crate::model::LinkFunction;
use ndarray::{Array1, Array2};
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A column to complete and the columns used to predict it. The outcome may
/// be listed as an auxiliary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImputationTarget {
    pub column: String,
    pub auxiliaries: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImputationPlan {
    pub targets: Vec<ImputationTarget>,
    /// Size of the donor pool for predictive mean matching.
    pub donors: usize,
    /// Fewest usable observed rows a target needs before imputation is attempted.
    pub min_observed: usize,
    /// Above this missing fraction single imputation is no longer a reasonable
    /// simplification; exceeding it only logs a warning.
    pub max_missing_fraction: f64,
}

impl Default for ImputationPlan {
    fn default() -> Self {
        Self {
            targets: Vec::new(),
            donors: 5,
            min_observed: 10,
            max_missing_fraction: 0.05,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ImputationError {
    #[error(
        "Column '{column}' has only {observed} usable observed rows; at least {required} are needed to impute it."
    )]
    DataInsufficiency {
        column: String,
        observed: usize,
        required: usize,
    },
    #[error("Imputation refers to unknown column '{0}'.")]
    UnknownColumn(String),
    #[error("The outcome column '{0}' cannot be an imputation target.")]
    OutcomeTarget(String),
    #[error("The imputation model for '{column}' could not be fitted: {source}")]
    RegressionFailed { column: String, source: FitFailure },
}

impl ImputationPlan {
    /// Checks that every referenced column exists in the dataset's schema.
    pub fn validate_columns(&self, data: &Dataset) -> Result<(), ImputationError> {
        let schema = data.schema();
        for target in &self.targets {
            if target.column == schema.outcome {
                return Err(ImputationError::OutcomeTarget(target.column.clone()));
            }
            for name in std::iter::once(&target.column).chain(target.auxiliaries.iter()) {
                if !schema.has_column(name) {
                    return Err(ImputationError::UnknownColumn(name.clone()));
                }
            }
        }
        Ok(())
    }

    /// Returns a copy of `data` with every target column completed.
    ///
    /// A dataset without missing values in the targets is returned unchanged and
    /// consumes no randomness.
    pub fn impute<R: Rng>(&self, data: &Dataset, rng: &mut R) -> Result<Dataset, ImputationError> {
        self.validate_columns(data)?;
        let mut completed = data.clone();
        for target in &self.targets {
            let missing = completed.missing_count(&target.column);
            if missing == 0 {
                continue;
            }
            let fraction = missing as f64 / completed.n_rows() as f64;
            if fraction > self.max_missing_fraction {
                log::warn!(
                    "Column '{}' is {:.1}% missing, above the {:.1}% ceiling for single imputation",
                    target.column,
                    100.0 * fraction,
                    100.0 * self.max_missing_fraction
                );
            }
            let values = self.impute_column(&completed, target, rng)?;
            let index = completed
                .schema()
                .predictor_index(&target.column)
                .ok_or_else(|| ImputationError::UnknownColumn(target.column.clone()))?;
            completed.replace_predictor(index, values);
            log::debug!("Imputed {missing} values of '{}'", target.column);
        }
        Ok(completed)
    }

    fn impute_column<R: Rng>(
        &self,
        data: &Dataset,
        target: &ImputationTarget,
        rng: &mut R,
    ) -> Result<Array1<f64>, ImputationError> {
        let column_of = |name: &String| {
            data.column(name)
                .ok_or_else(|| ImputationError::UnknownColumn(name.clone()))
        };
        let y = column_of(&target.column)?;
        let auxiliaries = target
            .auxiliaries
            .iter()
            .map(column_of)
            .collect::<Result<Vec<_>, _>>()?;
        let n = data.n_rows();

        let observed: Vec<usize> = (0..n)
            .filter(|&i| !y[i].is_nan() && auxiliaries.iter().all(|a| !a[i].is_nan()))
            .collect();
        let required = self.min_observed.max(auxiliaries.len() + 2);
        if observed.len() < required {
            return Err(ImputationError::DataInsufficiency {
                column: target.column.clone(),
                observed: observed.len(),
                required,
            });
        }

        // Recipients with a missing auxiliary are predicted at that auxiliary's mean.
        let means: Vec<f64> = auxiliaries
            .iter()
            .map(|a| {
                let (sum, count) = a
                    .iter()
                    .filter(|v| !v.is_nan())
                    .fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
                sum / count.max(1) as f64
            })
            .collect();
        let design = Array2::from_shape_fn((n, auxiliaries.len() + 1), |(i, j)| {
            if j == 0 {
                1.0
            } else {
                let v = auxiliaries[j - 1][i];
                if v.is_nan() { means[j - 1] } else { v }
            }
        });

        let x_observed = design.select(ndarray::Axis(0), &observed);
        let y_observed = Array1::from_iter(observed.iter().map(|&i| y[i]));
        let fit = fit_glm(
            x_observed.view(),
            y_observed.view(),
            None,
            LinkFunction::Identity,
            &IrlsOptions::default(),
        )
        .map_err(|source| ImputationError::RegressionFailed {
            column: target.column.clone(),
            source,
        })?;
        let predicted = design.dot(&fit.beta);

        // Donor pool ordered by predicted value.
        let mut pool: Vec<(f64, f64)> = observed.iter().map(|&i| (predicted[i], y[i])).collect();
        pool.sort_by(|a, b| a.0.total_cmp(&b.0));
        let k = self.donors.clamp(1, pool.len());

        let mut values = y.to_owned();
        for i in (0..n).filter(|&i| y[i].is_nan()) {
            let (lo, hi) = nearest_window(&pool, predicted[i], k);
            let pick = rng.gen_range(lo..hi);
            values[i] = pool[pick].1;
        }
        Ok(values)
    }
}

/// Half-open index range of the `k` pool entries whose predictions are closest to `target`.
fn nearest_window(pool: &[(f64, f64)], target: f64, k: usize) -> (usize, usize) {
    let split = pool.partition_point(|&(p, _)| p < target);
    let (mut lo, mut hi) = (split, split);
    while hi - lo < k {
        let take_left = match (lo > 0, hi < pool.len()) {
            (true, true) => (target - pool[lo - 1].0) <= (pool[hi].0 - target),
            (true, false) => true,
            (false, true) => false,
            (false, false) => break,
        };
        if take_left {
            lo -= 1;
        } else {
            hi += 1;
        }
    }
    (lo, hi)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Schema;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::sync::Arc;

    fn plan_for(column: &str, auxiliaries: &[&str]) -> ImputationPlan {
        ImputationPlan {
            targets: vec![ImputationTarget {
                column: column.to_string(),
                auxiliaries: auxiliaries.iter().map(|s| s.to_string()).collect(),
            }],
            min_observed: 5,
            ..ImputationPlan::default()
        }
    }

    fn cohort(n: usize, missing_rows: &[usize]) -> Dataset {
        let schema = Arc::new(Schema::new(vec!["score".into(), "age".into()], "outcome"));
        let predictors = Array2::from_shape_fn((n, 2), |(i, j)| match j {
            0 => (i % 9 + 1) as f64,
            _ if missing_rows.contains(&i) => f64::NAN,
            _ => 40.0 + 2.0 * (i % 9) as f64,
        });
        let outcomes = Array1::from_shape_fn(n, |i| if i % 4 == 0 { 1.0 } else { 0.0 });
        Dataset::new(schema, predictors, outcomes).unwrap()
    }

    #[test]
    fn complete_data_is_returned_unchanged() {
        let data = cohort(40, &[]);
        let mut rng = StdRng::seed_from_u64(1);
        let imputed = plan_for("age", &["score", "outcome"]).impute(&data, &mut rng).unwrap();
        assert_eq!(imputed, data);
    }

    #[test]
    fn missing_values_are_filled_with_observed_donors() {
        let data = cohort(60, &[3, 17, 42]);
        let mut rng = StdRng::seed_from_u64(2);
        let imputed = plan_for("age", &["score"]).impute(&data, &mut rng).unwrap();
        assert!(imputed.is_complete());
        let observed: Vec<f64> = data
            .column("age")
            .unwrap()
            .iter()
            .copied()
            .filter(|v| !v.is_nan())
            .collect();
        for row in [3, 17, 42] {
            let value = imputed.predictors()[(row, 1)];
            assert!(observed.contains(&value));
            // Age is an exact function of score here, so the nearest donors agree.
            let expected = 40.0 + 2.0 * (data.predictors()[(row, 0)] - 1.0);
            assert_eq!(value, expected);
        }
        assert_eq!(imputed.column("score"), data.column("score"));
        assert_eq!(imputed.outcomes(), data.outcomes());
    }

    #[test]
    fn imputation_is_reproducible_for_a_seed() {
        let data = cohort(60, &[5, 6, 7, 8]);
        let plan = plan_for("age", &["outcome"]);
        let first = plan.impute(&data, &mut StdRng::seed_from_u64(9)).unwrap();
        let second = plan.impute(&data, &mut StdRng::seed_from_u64(9)).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn too_few_observed_rows_is_data_insufficiency() {
        let missing: Vec<usize> = (0..8).collect();
        let data = cohort(10, &missing);
        let mut rng = StdRng::seed_from_u64(4);
        let err = plan_for("age", &["score"]).impute(&data, &mut rng).unwrap_err();
        assert!(matches!(
            err,
            ImputationError::DataInsufficiency { observed: 2, .. }
        ));
    }

    #[test]
    fn unknown_columns_and_outcome_targets_are_rejected() {
        let data = cohort(20, &[1]);
        let mut rng = StdRng::seed_from_u64(5);
        assert_eq!(
            plan_for("age", &["bmi"]).impute(&data, &mut rng).unwrap_err(),
            ImputationError::UnknownColumn("bmi".to_string())
        );
        assert_eq!(
            plan_for("outcome", &["score"]).impute(&data, &mut rng).unwrap_err(),
            ImputationError::OutcomeTarget("outcome".to_string())
        );
    }

    #[test]
    fn nearest_window_prefers_closest_entries() {
        let pool = [(0.0, 0.0), (1.0, 1.0), (2.0, 2.0), (10.0, 10.0)];
        assert_eq!(nearest_window(&pool, 1.6, 2), (1, 3));
        assert_eq!(nearest_window(&pool, -5.0, 2), (0, 2));
        assert_eq!(nearest_window(&pool, 50.0, 10), (0, 4));
        assert_eq!(nearest_window(&[(3.0, 3.0)], 0.0, 1), (0, 1));
    }
}
