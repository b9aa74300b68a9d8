use crate::basis::{BasisError, SplineKnots};
use crate::data::{Dataset, FittingSample, ReferenceCohort};
use crate::irls::{FitFailure, IrlsOptions, fit_glm};
use ndarray::{Array1, Array2, ArrayView1, s};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// --- Public Data Structures ---

/// Defines the link function, connecting the linear predictor to the mean response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkFunction {
    /// The logit link, for binary outcomes (logistic regression).
    /// Maps probabilities (0, 1) to the real line (-inf, +inf).
    Logit,
    /// The identity link, for continuous outcomes (used by the imputation model).
    Identity,
}

/// How a predictor enters the linear predictor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transform {
    Linear,
    /// Restricted cubic spline with knots at default quantiles of the fitting sample.
    RestrictedSpline { knots: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Term {
    pub predictor: String,
    pub transform: Transform,
}

impl Term {
    pub fn linear(predictor: impl Into<String>) -> Self {
        Self {
            predictor: predictor.into(),
            transform: Transform::Linear,
        }
    }

    pub fn spline(predictor: impl Into<String>, knots: usize) -> Self {
        Self {
            predictor: predictor.into(),
            transform: Transform::RestrictedSpline { knots },
        }
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.transform {
            Transform::Linear => write!(f, "{}", self.predictor),
            Transform::RestrictedSpline { knots } => write!(f, "rcs({}, {knots})", self.predictor),
        }
    }
}

/// A named logistic model formula, e.g. "score + age".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub name: String,
    pub terms: Vec<Term>,
}

impl ModelSpec {
    pub fn new(name: impl Into<String>, terms: Vec<Term>) -> Self {
        Self {
            name: name.into(),
            terms,
        }
    }

    /// Human-readable right-hand side of the formula.
    pub fn formula(&self) -> String {
        let rhs: Vec<String> = self.terms.iter().map(Term::to_string).collect();
        format!("outcome ~ {}", rhs.join(" + "))
    }
}

/// The expansion of one term as frozen at fit time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FittedTerm {
    Linear { predictor: String },
    RestrictedSpline { predictor: String, knots: SplineKnots },
}

impl FittedTerm {
    fn predictor(&self) -> &str {
        match self {
            FittedTerm::Linear { predictor } | FittedTerm::RestrictedSpline { predictor, .. } => {
                predictor.as_str()
            }
        }
    }

    fn num_columns(&self) -> usize {
        match self {
            FittedTerm::Linear { .. } => 1,
            FittedTerm::RestrictedSpline { knots, .. } => knots.num_columns(),
        }
    }

    fn column_names(&self) -> Vec<String> {
        match self {
            FittedTerm::Linear { predictor } => vec![predictor.clone()],
            FittedTerm::RestrictedSpline { predictor, knots } => (0..knots.num_columns())
                .map(|j| {
                    if j == 0 {
                        predictor.clone()
                    } else {
                        format!("{predictor}{}", "'".repeat(j))
                    }
                })
                .collect(),
        }
    }

    fn expand(&self, values: ArrayView1<f64>) -> Result<Array2<f64>, BasisError> {
        match self {
            FittedTerm::Linear { .. } => Ok(values.to_owned().insert_axis(ndarray::Axis(1))),
            FittedTerm::RestrictedSpline { knots, .. } => knots.basis(values),
        }
    }
}

/// A logistic model fitted on one sample. Prediction re-applies the frozen
/// term expansions, so it is valid on rows the model never saw.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FittedModel {
    pub name: String,
    pub terms: Vec<FittedTerm>,
    /// Intercept first, then the term columns in order.
    pub coefficients: Array1<f64>,
    pub standard_errors: Array1<f64>,
    /// -2 log-likelihood at the solution.
    pub deviance: f64,
    pub iterations: usize,
    pub n_obs: usize,
}

/// Custom error type for prediction.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Predictor '{0}' required by the model is not in the dataset.")]
    MissingPredictor(String),
    #[error("Predictor '{predictor}' has {missing} missing values; impute before scoring.")]
    MissingValues { predictor: String, missing: usize },
    #[error("Underlying basis function generation failed during prediction: {0}")]
    BasisError(#[from] BasisError),
    #[error(
        "Internal error: the design has {columns} columns but the model has {coefficients} coefficients."
    )]
    InternalStackingError { columns: usize, coefficients: usize },
}

impl FittedModel {
    pub fn num_parameters(&self) -> usize {
        self.coefficients.len()
    }

    /// Akaike information criterion.
    pub fn aic(&self) -> f64 {
        self.deviance + 2.0 * self.num_parameters() as f64
    }

    /// Coefficient labels aligned with `coefficients`.
    pub fn coefficient_names(&self) -> Vec<String> {
        std::iter::once("(intercept)".to_string())
            .chain(self.terms.iter().flat_map(FittedTerm::column_names))
            .collect()
    }

    /// Predicts event probabilities for every row of `data`.
    ///
    /// # Returns
    /// An `Array1<f64>` of probabilities in `[0, 1]`, one per row, or a
    /// `ModelError` if a required predictor is absent or incomplete.
    pub fn predict(&self, data: &Dataset) -> Result<Array1<f64>, ModelError> {
        let x = self.design_matrix(data)?;
        if x.ncols() != self.coefficients.len() {
            return Err(ModelError::InternalStackingError {
                columns: x.ncols(),
                coefficients: self.coefficients.len(),
            });
        }
        let eta = x.dot(&self.coefficients);
        Ok(eta.mapv(inverse_logit))
    }

    /// Scores the completed reference cohort, one probability per subject in row order.
    pub fn score(&self, cohort: &ReferenceCohort) -> Result<Array1<f64>, ModelError> {
        self.predict(cohort.completed())
    }

    fn design_matrix(&self, data: &Dataset) -> Result<Array2<f64>, ModelError> {
        let n = data.n_rows();
        let total: usize = 1 + self.terms.iter().map(FittedTerm::num_columns).sum::<usize>();
        let mut x = Array2::zeros((n, total));
        x.column_mut(0).fill(1.0);
        let mut offset = 1;
        for term in &self.terms {
            let values = data
                .column(term.predictor())
                .ok_or_else(|| ModelError::MissingPredictor(term.predictor().to_string()))?;
            let missing = values.iter().filter(|v| v.is_nan()).count();
            if missing > 0 {
                return Err(ModelError::MissingValues {
                    predictor: term.predictor().to_string(),
                    missing,
                });
            }
            let block = term.expand(values)?;
            x.slice_mut(s![.., offset..offset + block.ncols()])
                .assign(&block);
            offset += block.ncols();
        }
        Ok(x)
    }
}

/// Numerically safe logistic function; never returns NaN for finite input.
pub fn inverse_logit(eta: f64) -> f64 {
    let e = eta.clamp(-700.0, 700.0);
    1.0 / (1.0 + f64::exp(-e))
}

/// Log-odds of a probability, clamped away from 0 and 1.
pub fn logit(p: f64) -> f64 {
    let p = p.clamp(1e-12, 1.0 - 1e-12);
    (p / (1.0 - p)).ln()
}

/// The model-fitting capability the validation engine depends on.
///
/// Implementations must be usable from many bootstrap iterations at once.
pub trait ModelFitter: Sync {
    fn fit(&self, spec: &ModelSpec, sample: &FittingSample) -> Result<FittedModel, FitFailure>;
}

/// Maximum-likelihood logistic regression by IRLS.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct IrlsFitter {
    pub options: IrlsOptions,
}

impl IrlsFitter {
    pub fn new(options: IrlsOptions) -> Self {
        Self { options }
    }
}

impl ModelFitter for IrlsFitter {
    fn fit(&self, spec: &ModelSpec, sample: &FittingSample) -> Result<FittedModel, FitFailure> {
        let data = sample.data();
        let mut terms = Vec::with_capacity(spec.terms.len());
        for term in &spec.terms {
            let values = data
                .column(&term.predictor)
                .ok_or_else(|| FitFailure::UnknownPredictor(term.predictor.clone()))?;
            terms.push(match term.transform {
                Transform::Linear => FittedTerm::Linear {
                    predictor: term.predictor.clone(),
                },
                Transform::RestrictedSpline { knots } => FittedTerm::RestrictedSpline {
                    predictor: term.predictor.clone(),
                    knots: SplineKnots::from_quantiles(values, knots)?,
                },
            });
        }

        let mut model = FittedModel {
            name: spec.name.clone(),
            terms,
            coefficients: Array1::zeros(0),
            standard_errors: Array1::zeros(0),
            deviance: f64::NAN,
            iterations: 0,
            n_obs: data.n_rows(),
        };
        let x = model.design_matrix(data).map_err(|err| match err {
            ModelError::BasisError(basis) => FitFailure::Basis(basis),
            ModelError::MissingPredictor(name) => FitFailure::UnknownPredictor(name),
            _ => FitFailure::NonFinite,
        })?;

        let fit = fit_glm(
            x.view(),
            data.outcomes().view(),
            None,
            LinkFunction::Logit,
            &self.options,
        )?;
        log::debug!(
            "Fitted '{}' on iteration {} in {} IRLS iterations (deviance {:.4})",
            spec.name,
            sample.iteration(),
            fit.iterations,
            fit.deviance
        );
        model.standard_errors = fit.standard_errors();
        model.coefficients = fit.beta;
        model.deviance = fit.deviance;
        model.iterations = fit.iterations;
        Ok(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Schema;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::sync::Arc;

    fn simulated_cohort(n: usize, seed: u64) -> ReferenceCohort {
        let mut rng = StdRng::seed_from_u64(seed);
        let schema = Arc::new(Schema::new(vec!["score".into(), "age".into()], "outcome"));
        let mut predictors = Array2::zeros((n, 2));
        let mut outcomes = Array1::zeros(n);
        for i in 0..n {
            let score = rng.gen_range(1..=9) as f64;
            let age = rng.gen_range(30.0..90.0);
            let p = inverse_logit(-3.5 + 0.35 * score + 0.01 * age);
            predictors[(i, 0)] = score;
            predictors[(i, 1)] = age;
            outcomes[i] = if rng.gen_range(0.0..1.0) < p { 1.0 } else { 0.0 };
        }
        let data = Dataset::new(schema, predictors, outcomes).unwrap();
        let ids = (0..n).map(|i| format!("s{i}")).collect();
        ReferenceCohort::new(ids, data.clone(), data).unwrap()
    }

    #[test]
    fn predictions_are_probabilities_on_unseen_rows() {
        let train = simulated_cohort(800, 1);
        let score_on = simulated_cohort(300, 2);
        let spec = ModelSpec::new("score + age", vec![Term::linear("score"), Term::linear("age")]);
        let model = IrlsFitter::default()
            .fit(&spec, &FittingSample::reference(&train))
            .unwrap();
        let probs = model.score(&score_on).unwrap();
        assert_eq!(probs.len(), 300);
        assert!(probs.iter().all(|&p| (0.0..=1.0).contains(&p)));
        assert_eq!(model.num_parameters(), 3);
        assert_eq!(model.coefficient_names(), vec!["(intercept)", "score", "age"]);
    }

    #[test]
    fn spline_knots_are_frozen_at_fit_time() {
        let train = simulated_cohort(1000, 3);
        let spec = ModelSpec::new("rcs(age)", vec![Term::spline("age", 4)]);
        let model = IrlsFitter::default()
            .fit(&spec, &FittingSample::reference(&train))
            .unwrap();
        assert_eq!(model.num_parameters(), 4);
        assert_eq!(model.coefficient_names()[3], "age''");

        // Scoring a subset reuses the training knots, so predictions agree row by row.
        let full = model.predict(train.completed()).unwrap();
        let subset = train.completed().select_rows(&[5, 10, 15]);
        let partial = model.predict(&subset).unwrap();
        for (k, row) in [5, 10, 15].into_iter().enumerate() {
            assert!((full[row] - partial[k]).abs() < 1e-15);
        }
    }

    #[test]
    fn scoring_incomplete_rows_is_rejected() {
        let train = simulated_cohort(400, 4);
        let spec = ModelSpec::new("score alone", vec![Term::linear("score")]);
        let model = IrlsFitter::default()
            .fit(&spec, &FittingSample::reference(&train))
            .unwrap();
        let schema = Arc::new(Schema::new(vec!["score".into(), "age".into()], "outcome"));
        let incomplete = Dataset::new(
            schema,
            ndarray::array![[f64::NAN, 50.0]],
            ndarray::array![0.0],
        )
        .unwrap();
        assert!(matches!(
            model.predict(&incomplete),
            Err(ModelError::MissingValues { missing: 1, .. })
        ));
    }

    #[test]
    fn formula_and_logit_helpers() {
        let spec = ModelSpec::new("x", vec![Term::spline("score", 5), Term::linear("age")]);
        assert_eq!(spec.formula(), "outcome ~ rcs(score, 5) + age");
        assert!((inverse_logit(logit(0.3)) - 0.3).abs() < 1e-12);
        assert_eq!(inverse_logit(f64::INFINITY), 1.0);
        assert!(inverse_logit(-1e6) >= 0.0);
    }
}
