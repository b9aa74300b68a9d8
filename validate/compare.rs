//! Likelihood-based comparison of the candidate models on the reference fit.

use crate::data::FittingSample;
use crate::model::{FittedModel, ModelFitter, ModelSpec, Term, Transform};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use statrs::distribution::{ChiSquared, ContinuousCDF};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InformationCriterion {
    pub model: String,
    pub deviance: f64,
    pub parameters: usize,
    pub aic: f64,
}

/// Likelihood-ratio statistic between two fitted models. The model with fewer
/// parameters is always `reduced`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairwiseComparison {
    pub reduced: String,
    pub full: String,
    pub statistic: f64,
    pub df: usize,
    /// Chi-squared tail probability; `NaN` when `df` is zero or the pair is
    /// not nested.
    pub p_value: f64,
    /// Whether the reduced model is a special case of the full one, so that the
    /// chi-squared reference distribution applies.
    pub nested: bool,
}

/// Test of a linear term against a restricted cubic spline of the same predictor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearityProbe {
    pub predictor: String,
    pub knots: usize,
    pub statistic: f64,
    pub df: usize,
    pub p_value: f64,
    /// Why the probe could not be computed, when it could not.
    pub failure: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelComparison {
    pub information: Vec<InformationCriterion>,
    pub pairs: Vec<PairwiseComparison>,
    pub linearity: Vec<LinearityProbe>,
}

pub fn information_criterion(model: &FittedModel) -> InformationCriterion {
    InformationCriterion {
        model: model.name.clone(),
        deviance: model.deviance,
        parameters: model.num_parameters(),
        aic: model.aic(),
    }
}

/// True when every term of `reduced` is spanned by the terms of `full`.
/// A linear term is spanned by a spline of the same predictor, whose first
/// column is the predictor itself.
pub fn is_nested(reduced: &ModelSpec, full: &ModelSpec) -> bool {
    reduced.terms.iter().all(|term| {
        full.terms.iter().any(|candidate| {
            candidate.predictor == term.predictor
                && match (term.transform, candidate.transform) {
                    (Transform::Linear, _) => true,
                    (
                        Transform::RestrictedSpline { knots: a },
                        Transform::RestrictedSpline { knots: b },
                    ) => a == b,
                    (Transform::RestrictedSpline { .. }, Transform::Linear) => false,
                }
        })
    })
}

pub fn likelihood_ratio(
    a: (&ModelSpec, &FittedModel),
    b: (&ModelSpec, &FittedModel),
) -> PairwiseComparison {
    let (reduced, full) = if a.1.num_parameters() <= b.1.num_parameters() {
        (a, b)
    } else {
        (b, a)
    };
    let statistic = (reduced.1.deviance - full.1.deviance).max(0.0);
    let df = full.1.num_parameters() - reduced.1.num_parameters();
    let nested = df > 0 && is_nested(reduced.0, full.0);
    PairwiseComparison {
        reduced: reduced.1.name.clone(),
        full: full.1.name.clone(),
        statistic,
        df,
        p_value: if nested {
            chi_squared_tail(statistic, df)
        } else {
            f64::NAN
        },
        nested,
    }
}

fn chi_squared_tail(statistic: f64, df: usize) -> f64 {
    if df == 0 || !statistic.is_finite() {
        return f64::NAN;
    }
    match ChiSquared::new(df as f64) {
        Ok(dist) => dist.sf(statistic),
        Err(_) => f64::NAN,
    }
}

/// Fits a univariable linear and spline model for each predictor and tests
/// the spline's nonlinear columns.
pub fn linearity_probes<F: ModelFitter + ?Sized>(
    fitter: &F,
    sample: &FittingSample,
    predictors: &[String],
    knots: usize,
) -> Vec<LinearityProbe> {
    predictors
        .iter()
        .map(|predictor| {
            let linear = ModelSpec::new(predictor.clone(), vec![Term::linear(predictor.clone())]);
            let spline = ModelSpec::new(
                format!("rcs({predictor}, {knots})"),
                vec![Term::spline(predictor.clone(), knots)],
            );
            let fits = fitter
                .fit(&linear, sample)
                .and_then(|l| fitter.fit(&spline, sample).map(|s| (l, s)));
            match fits {
                Ok((l, s)) => {
                    let comparison = likelihood_ratio((&linear, &l), (&spline, &s));
                    log::info!(
                        "Linearity of '{predictor}': LR {:.3} on {} df (p = {:.4})",
                        comparison.statistic,
                        comparison.df,
                        comparison.p_value
                    );
                    LinearityProbe {
                        predictor: predictor.clone(),
                        knots,
                        statistic: comparison.statistic,
                        df: comparison.df,
                        p_value: comparison.p_value,
                        failure: None,
                    }
                }
                Err(failure) => {
                    log::warn!("Linearity probe for '{predictor}' failed: {failure}");
                    LinearityProbe {
                        predictor: predictor.clone(),
                        knots,
                        statistic: f64::NAN,
                        df: knots.saturating_sub(2),
                        p_value: f64::NAN,
                        failure: Some(failure.to_string()),
                    }
                }
            }
        })
        .collect()
}

/// AIC per model and a likelihood-ratio statistic for every model pair.
pub fn compare_models(fitted: &[(&ModelSpec, &FittedModel)]) -> ModelComparison {
    let information = fitted.iter().map(|(_, m)| information_criterion(m)).collect();
    let pairs = fitted
        .iter()
        .tuple_combinations()
        .map(|(a, b)| likelihood_ratio(*a, *b))
        .collect();
    ModelComparison {
        information,
        pairs,
        linearity: Vec::new(),
    }
}
