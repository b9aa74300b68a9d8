use crate::basis::BasisError;
use crate::faer_ndarray::FaerCholesky;
use crate::model::LinkFunction;
use faer::Side;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Iteration limits for the IRLS loop.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IrlsOptions {
    pub max_iterations: usize,
    /// Relative deviance change below which the fit is declared converged.
    pub tolerance: f64,
    pub max_step_halvings: usize,
    /// A fitted |eta| beyond this value means some fitted probabilities are
    /// numerically 0 or 1, i.e. (quasi-)complete separation.
    pub separation_threshold: f64,
}

impl Default for IrlsOptions {
    fn default() -> Self {
        Self {
            max_iterations: 25,
            tolerance: 1e-8,
            max_step_halvings: 30,
            separation_threshold: 30.0,
        }
    }
}

/// Why a single model fit produced no usable coefficients.
///
/// In the bootstrap these are recovered per (iteration, model) pair and counted;
/// they never abort the run.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FitFailure {
    #[error("IRLS did not converge within {iterations} iterations (last relative deviance change {last_change:.3e}).")]
    NonConvergence { iterations: usize, last_change: f64 },

    #[error("Quasi-complete separation: fitted |eta| reached {max_abs_eta:.1}.")]
    QuasiSeparation { max_abs_eta: f64 },

    #[error("The weighted design matrix is singular (collinear predictors).")]
    SingularDesign,

    #[error("The outcome is constant in the fitting sample; a logistic model is not identifiable.")]
    DegenerateOutcome,

    #[error("Spline basis construction failed: {0}")]
    Basis(#[from] BasisError),

    #[error("Non-finite values appeared during fitting.")]
    NonFinite,

    #[error("The fitting sample has {rows} rows but the design has {columns} columns.")]
    TooFewRows { rows: usize, columns: usize },

    #[error("Predictor '{0}' is not in the fitting sample.")]
    UnknownPredictor(String),
}

impl FitFailure {
    /// Short stable label used in diagnostics tables.
    pub fn kind(&self) -> &'static str {
        match self {
            FitFailure::NonConvergence { .. } => "non_convergence",
            FitFailure::QuasiSeparation { .. } => "quasi_separation",
            FitFailure::SingularDesign => "singular_design",
            FitFailure::DegenerateOutcome => "degenerate_outcome",
            FitFailure::Basis(_) => "basis",
            FitFailure::NonFinite => "non_finite",
            FitFailure::TooFewRows { .. } => "too_few_rows",
            FitFailure::UnknownPredictor(_) => "unknown_predictor",
        }
    }
}

/// Result of a converged GLM fit.
#[derive(Debug, Clone)]
pub struct GlmFit {
    pub beta: Array1<f64>,
    /// `(X'WX)^-1`, scaled by the residual variance for the identity link.
    pub covariance: Array2<f64>,
    /// Binomial deviance (-2 log-likelihood) for the logit link, RSS for identity.
    pub deviance: f64,
    pub iterations: usize,
    pub max_abs_eta: f64,
}

impl GlmFit {
    pub fn standard_errors(&self) -> Array1<f64> {
        self.covariance.diag().mapv(|v| v.max(0.0).sqrt())
    }
}

/// Fits a generalized linear model by iteratively reweighted least squares.
///
/// `offset` enters the linear predictor with a fixed coefficient of one.
/// The logit link runs the full loop with step halving on non-finite values or
/// deviance increases; the identity link is ordinary least squares in one solve.
pub fn fit_glm(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    offset: Option<ArrayView1<f64>>,
    link: LinkFunction,
    options: &IrlsOptions,
) -> Result<GlmFit, FitFailure> {
    let (n, p) = x.dim();
    if n <= p {
        return Err(FitFailure::TooFewRows {
            rows: n,
            columns: p,
        });
    }
    if x.iter().chain(y.iter()).any(|v| !v.is_finite()) {
        return Err(FitFailure::NonFinite);
    }
    let offset = match offset {
        Some(o) => o.to_owned(),
        None => Array1::zeros(n),
    };

    match link {
        LinkFunction::Identity => fit_least_squares(x, y, &offset),
        LinkFunction::Logit => fit_logistic(x, y, &offset, options),
    }
}

fn fit_least_squares(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    offset: &Array1<f64>,
) -> Result<GlmFit, FitFailure> {
    let (n, p) = x.dim();
    let weights = Array1::ones(n);
    let target = &y - offset;
    let (beta, xtwx_inverse) = solve_weighted_least_squares(x, target.view(), weights.view())?;
    let eta = x.dot(&beta) + offset;
    let rss = calculate_deviance(y, &eta, LinkFunction::Identity);
    let sigma2 = rss / (n - p) as f64;
    Ok(GlmFit {
        beta,
        covariance: xtwx_inverse * sigma2,
        deviance: rss,
        iterations: 1,
        max_abs_eta: eta.iter().fold(0.0_f64, |m, v| m.max(v.abs())),
    })
}

fn fit_logistic(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    offset: &Array1<f64>,
    options: &IrlsOptions,
) -> Result<GlmFit, FitFailure> {
    let positives = y.iter().filter(|&&v| v > 0.5).count();
    if positives == 0 || positives == y.len() {
        return Err(FitFailure::DegenerateOutcome);
    }

    // Start from mu = (y + 0.5) / 2 as glm() does for the binomial family.
    let mu_start = y.mapv(|v| (v + 0.5) / 2.0);
    let mut eta = mu_start.mapv(|m| (m / (1.0 - m)).ln());
    let (mut mu, mut weights, mut z) = update_glm_vectors(y, &eta, LinkFunction::Logit);
    let mut last_deviance = calculate_deviance(y, &mu, LinkFunction::Logit);
    let mut beta_current: Option<Array1<f64>> = None;
    let mut last_change = f64::INFINITY;

    for iter in 1..=options.max_iterations {
        let working = &z - offset;
        let mut beta_trial = solve_weighted_least_squares(x, working.view(), weights.view())?.0;

        let mut eta_trial = x.dot(&beta_trial) + offset;
        let (mut mu_trial, _, _) = update_glm_vectors(y, &eta_trial, LinkFunction::Logit);
        let mut deviance_trial = calculate_deviance(y, &mu_trial, LinkFunction::Logit);

        // Step halving towards the previous coefficients when the step is invalid
        // or increases the deviance. The first step has nothing to halve towards.
        if let Some(previous) = &beta_current {
            let mut step_halving_count = 0;
            while (!deviance_trial.is_finite() || deviance_trial > last_deviance)
                && step_halving_count < options.max_step_halvings
            {
                beta_trial = previous + &((&beta_trial - previous) * 0.5);
                eta_trial = x.dot(&beta_trial) + offset;
                mu_trial = update_glm_vectors(y, &eta_trial, LinkFunction::Logit).0;
                deviance_trial = calculate_deviance(y, &mu_trial, LinkFunction::Logit);
                step_halving_count += 1;
            }
            if step_halving_count > 0 {
                log::debug!(
                    "IRLS iteration {iter}: step halving applied {step_halving_count} times"
                );
            }
            if !deviance_trial.is_finite() {
                log::warn!(
                    "IRLS failed to find a valid step after {step_halving_count} halvings"
                );
                return Err(FitFailure::NonFinite);
            }
        } else if !deviance_trial.is_finite() {
            return Err(FitFailure::NonFinite);
        }

        last_change = (deviance_trial - last_deviance).abs() / (deviance_trial.abs() + 0.1);
        log::debug!(
            "IRLS iteration {iter}: deviance {deviance_trial:.6e}, relative change {last_change:.3e}"
        );

        eta = eta_trial;
        last_deviance = deviance_trial;
        (mu, weights, z) = update_glm_vectors(y, &eta, LinkFunction::Logit);
        beta_current = Some(beta_trial.clone());

        if last_change < options.tolerance {
            // Refresh the covariance at the converged weights.
            let working = &z - offset;
            let xtwx_inverse =
                solve_weighted_least_squares(x, working.view(), weights.view())?.1;
            let max_abs_eta = eta.iter().fold(0.0_f64, |m, v| m.max(v.abs()));
            if max_abs_eta > options.separation_threshold {
                log::warn!(
                    "IRLS converged with max |eta| = {max_abs_eta:.1}; treating as separation"
                );
                return Err(FitFailure::QuasiSeparation { max_abs_eta });
            }
            return Ok(GlmFit {
                beta: beta_trial,
                covariance: xtwx_inverse,
                deviance: last_deviance,
                iterations: iter,
                max_abs_eta,
            });
        }
    }

    let max_abs_eta = eta.iter().fold(0.0_f64, |m, v| m.max(v.abs()));
    if max_abs_eta > options.separation_threshold {
        return Err(FitFailure::QuasiSeparation { max_abs_eta });
    }
    log::warn!(
        "IRLS failed to converge after {} iterations (mean fitted probability {:.4})",
        options.max_iterations,
        mu.mean().unwrap_or(f64::NAN)
    );
    Err(FitFailure::NonConvergence {
        iterations: options.max_iterations,
        last_change,
    })
}

/// Solves `(X'WX) beta = X'Wz`, returning `beta` and `(X'WX)^-1`.
fn solve_weighted_least_squares(
    x: ArrayView2<f64>,
    z: ArrayView1<f64>,
    weights: ArrayView1<f64>,
) -> Result<(Array1<f64>, Array2<f64>), FitFailure> {
    let p = x.ncols();
    let xw = &x * &weights.insert_axis(Axis(1));
    let xtwx = xw.t().dot(&x);
    let xtwz = xw.t().dot(&z);
    let factor = xtwx
        .cholesky(Side::Lower)
        .map_err(|_| FitFailure::SingularDesign)?;
    let beta = factor.solve_vec(&xtwz);
    if !beta.iter().all(|b| b.is_finite()) {
        return Err(FitFailure::NonFinite);
    }
    let inverse = factor.inverse(p);
    // A tiny pivot passes the factorization but shows up as an exploding inverse.
    let ill_conditioned = inverse
        .diag()
        .iter()
        .zip(xtwx.diag().iter())
        .any(|(&inv, &d)| !inv.is_finite() || inv <= 0.0 || inv * d > 1e10);
    if ill_conditioned {
        return Err(FitFailure::SingularDesign);
    }
    Ok((beta, inverse))
}

/// Computes the mean, IRLS weights, and working response for the current `eta`.
pub fn update_glm_vectors(
    y: ArrayView1<f64>,
    eta: &Array1<f64>,
    link: LinkFunction,
) -> (Array1<f64>, Array1<f64>, Array1<f64>) {
    const MIN_WEIGHT: f64 = 1e-10;
    const PROB_EPS: f64 = 1e-12;

    match link {
        LinkFunction::Logit => {
            // Clamp eta to prevent overflow in exp
            let eta_clamped = eta.mapv(|e| e.clamp(-700.0, 700.0));
            let mut mu = eta_clamped.mapv(|e| 1.0 / (1.0 + (-e).exp()));
            mu.mapv_inplace(|v| v.clamp(PROB_EPS, 1.0 - PROB_EPS));
            let weights = (&mu * &mu.mapv(|m| 1.0 - m)).mapv(|v| v.max(MIN_WEIGHT));
            let residual = &y - &mu;
            let z = &eta_clamped + &(&residual / &weights);
            (mu, weights, z)
        }
        LinkFunction::Identity => {
            let mu = eta.clone();
            let weights = Array1::ones(eta.len());
            let z = y.to_owned();
            (mu, weights, z)
        }
    }
}

/// Binomial deviance for the logit link, residual sum of squares for identity.
pub fn calculate_deviance(y: ArrayView1<f64>, mu: &Array1<f64>, link: LinkFunction) -> f64 {
    const EPS: f64 = 1e-12;
    match link {
        LinkFunction::Logit => {
            let total = ndarray::Zip::from(y).and(mu).fold(0.0, |acc, &yi, &mui| {
                let mui_c = mui.clamp(EPS, 1.0 - EPS);
                acc - (yi * mui_c.ln() + (1.0 - yi) * (1.0 - mui_c).ln())
            });
            2.0 * total
        }
        LinkFunction::Identity => ndarray::Zip::from(y)
            .and(mu)
            .fold(0.0, |acc, &yi, &mui| acc + (yi - mui).powi(2)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array2, array, concatenate};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn with_intercept(x: &Array1<f64>) -> Array2<f64> {
        let ones = Array1::<f64>::ones(x.len());
        concatenate![Axis(1), ones.insert_axis(Axis(1)), x.view().insert_axis(Axis(1))]
    }

    #[test]
    fn least_squares_recovers_exact_line() {
        let x = array![0.0, 1.0, 2.0, 3.0, 4.0];
        let y = x.mapv(|v| 2.0 + 3.0 * v);
        let fit = fit_glm(
            with_intercept(&x).view(),
            y.view(),
            None,
            LinkFunction::Identity,
            &IrlsOptions::default(),
        )
        .unwrap();
        assert_abs_diff_eq!(fit.beta[0], 2.0, epsilon = 1e-10);
        assert_abs_diff_eq!(fit.beta[1], 3.0, epsilon = 1e-10);
        assert_abs_diff_eq!(fit.deviance, 0.0, epsilon = 1e-16);
    }

    #[test]
    fn logistic_fit_recovers_generating_coefficients() {
        let mut rng = StdRng::seed_from_u64(7);
        let n = 5000;
        let x = Array1::from_shape_fn(n, |_| rng.gen_range(-2.0..2.0));
        let y = x.mapv(|v| {
            let p = 1.0 / (1.0 + f64::exp(-(-1.0 + 0.8 * v)));
            if rng.gen_range(0.0..1.0) < p { 1.0 } else { 0.0 }
        });
        let fit = fit_glm(
            with_intercept(&x).view(),
            y.view(),
            None,
            LinkFunction::Logit,
            &IrlsOptions::default(),
        )
        .unwrap();
        assert!((fit.beta[0] + 1.0).abs() < 0.15, "intercept {}", fit.beta[0]);
        assert!((fit.beta[1] - 0.8).abs() < 0.15, "slope {}", fit.beta[1]);
        assert!(fit.iterations < 10);
        assert!(fit.standard_errors().iter().all(|se| *se > 0.0 && *se < 0.1));
    }

    #[test]
    fn intercept_only_logistic_matches_log_odds() {
        let y = array![1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0];
        let x = Array2::ones((y.len(), 1));
        let fit = fit_glm(x.view(), y.view(), None, LinkFunction::Logit, &IrlsOptions::default())
            .unwrap();
        assert_abs_diff_eq!(fit.beta[0], (2.0_f64 / 6.0).ln(), epsilon = 1e-8);
    }

    #[test]
    fn perfect_separation_is_a_fit_failure() {
        let x = array![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0];
        let y = array![0.0, 0.0, 0.0, 0.0, 1.0, 1.0, 1.0, 1.0];
        let result = fit_glm(
            with_intercept(&x).view(),
            y.view(),
            None,
            LinkFunction::Logit,
            &IrlsOptions::default(),
        );
        assert!(matches!(
            result,
            Err(FitFailure::QuasiSeparation { .. })
                | Err(FitFailure::NonConvergence { .. })
                | Err(FitFailure::SingularDesign)
        ));
    }

    #[test]
    fn constant_outcome_is_degenerate() {
        let x = array![1.0, 2.0, 3.0, 4.0];
        let y = array![0.0, 0.0, 0.0, 0.0];
        let result = fit_glm(
            with_intercept(&x).view(),
            y.view(),
            None,
            LinkFunction::Logit,
            &IrlsOptions::default(),
        );
        assert_eq!(result.unwrap_err(), FitFailure::DegenerateOutcome);
    }

    #[test]
    fn collinear_design_is_singular() {
        let x = array![[1.0, 1.0, 2.0], [1.0, 2.0, 4.0], [1.0, 3.0, 6.0], [1.0, 4.0, 8.0], [1.0, 5.0, 10.0]];
        let y = array![0.0, 1.0, 0.0, 1.0, 1.0];
        let result = fit_glm(x.view(), y.view(), None, LinkFunction::Logit, &IrlsOptions::default());
        assert!(matches!(
            result,
            Err(FitFailure::SingularDesign) | Err(FitFailure::NonFinite)
        ));
    }

    #[test]
    fn offset_shifts_intercept() {
        let y = array![1.0, 0.0, 1.0, 0.0, 0.0, 1.0, 0.0, 0.0];
        let x = Array2::ones((y.len(), 1));
        let offset = Array1::from_elem(y.len(), 0.5);
        let plain = fit_glm(x.view(), y.view(), None, LinkFunction::Logit, &IrlsOptions::default())
            .unwrap();
        let shifted = fit_glm(
            x.view(),
            y.view(),
            Some(offset.view()),
            LinkFunction::Logit,
            &IrlsOptions::default(),
        )
        .unwrap();
        assert_abs_diff_eq!(plain.beta[0] - shifted.beta[0], 0.5, epsilon = 1e-8);
    }
}
