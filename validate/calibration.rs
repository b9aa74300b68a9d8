//! Calibration of predicted probabilities against observed outcomes.
//!
//! Two views are produced: a LOWESS smooth of the outcome on the predicted
//! probability, and the logistic recalibration regression
//! `logit P(y = 1) = a + b * logit(p)`. Metrics that cannot be estimated on
//! the given data are reported as `NaN` and flagged, never returned as errors.

use crate::irls::{IrlsOptions, fit_glm};
use crate::model::{LinkFunction, logit};
use ndarray::{Array1, Array2, ArrayView1};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationOptions {
    /// Fraction of the subjects in each local LOWESS fit.
    pub span: f64,
    /// Number of evenly spaced points the curve is evaluated on.
    pub grid_points: usize,
}

impl Default for CalibrationOptions {
    fn default() -> Self {
        Self {
            span: 2.0 / 3.0,
            grid_points: 50,
        }
    }
}

/// A smoothed calibration curve sampled on a fixed grid of predicted risk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationCurve {
    pub grid: Vec<f64>,
    pub observed: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    pub intercept: f64,
    pub slope: f64,
    /// Calibration-in-the-large: the intercept with `logit(p)` as a fixed offset.
    pub in_the_large: f64,
    pub brier: f64,
    pub observed_expected: f64,
    /// Mean absolute distance between the smoothed curve and the identity,
    /// weighted by the distribution of predictions.
    pub ici: f64,
    pub curve: CalibrationCurve,
    /// True when any metric above had to be reported as `NaN`.
    pub degenerate: bool,
}

/// Computes every calibration metric for one model's predictions.
pub fn assess(
    predictions: ArrayView1<f64>,
    outcomes: ArrayView1<f64>,
    options: &CalibrationOptions,
) -> Calibration {
    let n = predictions.len() as f64;
    let brier = predictions
        .iter()
        .zip(outcomes.iter())
        .map(|(p, y)| (p - y).powi(2))
        .sum::<f64>()
        / n;
    let expected: f64 = predictions.sum();
    let observed_expected = if expected > 0.0 {
        outcomes.sum() / expected
    } else {
        f64::NAN
    };

    let (intercept, slope) = recalibration(predictions, outcomes);
    let in_the_large = calibration_in_the_large(predictions, outcomes);

    let grid = prediction_grid(predictions, options.grid_points);
    let (curve, ici) = match Lowess::fit(predictions, outcomes, options.span) {
        Some(smooth) => {
            let observed = grid.iter().map(|&x| smooth.evaluate(x)).collect();
            let ici = predictions
                .iter()
                .map(|&p| (smooth.evaluate(p) - p).abs())
                .sum::<f64>()
                / n;
            (CalibrationCurve { grid, observed }, ici)
        }
        None => {
            let observed = vec![f64::NAN; grid.len()];
            (CalibrationCurve { grid, observed }, f64::NAN)
        }
    };

    let degenerate = [intercept, slope, in_the_large, brier, observed_expected, ici]
        .iter()
        .any(|v| v.is_nan());
    if degenerate {
        log::warn!(
            "Calibration metrics partly undefined (slope {slope:.3}, intercept {intercept:.3}, CITL {in_the_large:.3})"
        );
    }
    Calibration {
        intercept,
        slope,
        in_the_large,
        brier,
        observed_expected,
        ici,
        curve,
        degenerate,
    }
}

/// Intercept and slope of the logistic regression of the outcome on `logit(p)`.
fn recalibration(predictions: ArrayView1<f64>, outcomes: ArrayView1<f64>) -> (f64, f64) {
    let n = predictions.len();
    let x = Array2::from_shape_fn((n, 2), |(i, j)| {
        if j == 0 { 1.0 } else { logit(predictions[i]) }
    });
    match fit_glm(x.view(), outcomes, None, LinkFunction::Logit, &IrlsOptions::default()) {
        Ok(fit) => (fit.beta[0], fit.beta[1]),
        Err(err) => {
            log::debug!("Calibration slope regression failed: {err}");
            (f64::NAN, f64::NAN)
        }
    }
}

fn calibration_in_the_large(predictions: ArrayView1<f64>, outcomes: ArrayView1<f64>) -> f64 {
    let n = predictions.len();
    let x = Array2::ones((n, 1));
    let offset: Array1<f64> = predictions.mapv(logit);
    match fit_glm(
        x.view(),
        outcomes,
        Some(offset.view()),
        LinkFunction::Logit,
        &IrlsOptions::default(),
    ) {
        Ok(fit) => fit.beta[0],
        Err(err) => {
            log::debug!("Calibration-in-the-large regression failed: {err}");
            f64::NAN
        }
    }
}

/// Evenly spaced points between the 1st and 99th percentiles of `predictions`.
pub fn prediction_grid(predictions: ArrayView1<f64>, points: usize) -> Vec<f64> {
    let mut sorted: Vec<f64> = predictions.iter().copied().filter(|p| !p.is_nan()).collect();
    if sorted.is_empty() || points == 0 {
        return Vec::new();
    }
    sorted.sort_by(f64::total_cmp);
    let lo = quantile_sorted(&sorted, 0.01);
    let hi = quantile_sorted(&sorted, 0.99);
    if points == 1 || hi <= lo {
        return vec![lo];
    }
    let step = (hi - lo) / (points - 1) as f64;
    (0..points).map(|i| lo + step * i as f64).collect()
}

/// Type 7 quantile of already sorted, non-empty data.
pub(crate) fn quantile_sorted(sorted: &[f64], probability: f64) -> f64 {
    let position = (sorted.len() - 1) as f64 * probability.clamp(0.0, 1.0);
    let lower = position.floor() as usize;
    let upper = position.ceil() as usize;
    let fraction = position - lower as f64;
    sorted[lower] * (1.0 - fraction) + sorted[upper] * fraction
}

/// Locally weighted linear regression with tricube weights, without
/// robustness iterations.
#[derive(Debug, Clone)]
pub struct Lowess {
    xs: Vec<f64>,
    ys: Vec<f64>,
    window: usize,
}

impl Lowess {
    /// Returns `None` for empty input.
    pub fn fit(x: ArrayView1<f64>, y: ArrayView1<f64>, span: f64) -> Option<Self> {
        if x.is_empty() || x.len() != y.len() {
            return None;
        }
        let mut pairs: Vec<(f64, f64)> = x.iter().copied().zip(y.iter().copied()).collect();
        pairs.sort_by(|a, b| a.0.total_cmp(&b.0));
        let n = pairs.len();
        let window = ((span * n as f64).ceil() as usize).clamp(1, n);
        let (xs, ys) = pairs.into_iter().unzip();
        Some(Self { xs, ys, window })
    }

    /// The smoothed value at `x0`, clipped to [0, 1].
    pub fn evaluate(&self, x0: f64) -> f64 {
        let (lo, hi) = self.neighbourhood(x0);
        let radius = (x0 - self.xs[lo]).abs().max((self.xs[hi - 1] - x0).abs());

        let (mut sw, mut swx, mut swy, mut swxx, mut swxy) = (0.0, 0.0, 0.0, 0.0, 0.0);
        for (&x, &y) in self.xs[lo..hi].iter().zip(&self.ys[lo..hi]) {
            let w = if radius > 0.0 {
                let u = ((x - x0).abs() / radius).min(1.0);
                (1.0 - u * u * u).powi(3)
            } else {
                1.0
            };
            sw += w;
            swx += w * x;
            swy += w * y;
            swxx += w * x * x;
            swxy += w * x * y;
        }

        let value = if sw <= 0.0 {
            self.ys[lo..hi].iter().sum::<f64>() / (hi - lo) as f64
        } else {
            let denominator = sw * swxx - swx * swx;
            if denominator.abs() <= 1e-12 * sw * sw.max(swxx) {
                swy / sw
            } else {
                let b = (sw * swxy - swx * swy) / denominator;
                let a = (swy - b * swx) / sw;
                a + b * x0
            }
        };
        value.clamp(0.0, 1.0)
    }

    /// The `window` sorted points nearest to `x0`, as a half-open range.
    fn neighbourhood(&self, x0: f64) -> (usize, usize) {
        let split = self.xs.partition_point(|&x| x < x0);
        let (mut lo, mut hi) = (split, split);
        while hi - lo < self.window {
            let take_left = match (lo > 0, hi < self.xs.len()) {
                (true, true) => x0 - self.xs[lo - 1] <= self.xs[hi] - x0,
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
}

/// The LOWESS curve of `outcomes` on `predictions`, sampled at `grid`.
pub fn smoothed_curve(
    predictions: ArrayView1<f64>,
    outcomes: ArrayView1<f64>,
    grid: &[f64],
    span: f64,
) -> Vec<f64> {
    match Lowess::fit(predictions, outcomes, span) {
        Some(smooth) => grid.iter().map(|&x| smooth.evaluate(x)).collect(),
        None => vec![f64::NAN; grid.len()],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::inverse_logit;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn well_calibrated(n: usize, seed: u64) -> (Array1<f64>, Array1<f64>) {
        let mut rng = StdRng::seed_from_u64(seed);
        let p = Array1::from_shape_fn(n, |_| inverse_logit(rng.gen_range(-3.0..1.5)));
        let y = p.mapv(|pi| if rng.gen_range(0.0..1.0) < pi { 1.0 } else { 0.0 });
        (p, y)
    }

    #[test]
    fn calibrated_predictions_have_unit_slope_and_zero_intercept() {
        let (p, y) = well_calibrated(20_000, 11);
        let cal = assess(p.view(), y.view(), &CalibrationOptions::default());
        assert!(!cal.degenerate);
        assert!((cal.slope - 1.0).abs() < 0.08, "slope {}", cal.slope);
        assert!(cal.intercept.abs() < 0.08, "intercept {}", cal.intercept);
        assert!(cal.in_the_large.abs() < 0.05);
        assert!((cal.observed_expected - 1.0).abs() < 0.05);
        assert!(cal.ici < 0.03, "ici {}", cal.ici);
        assert_eq!(cal.curve.grid.len(), 50);
        assert!(cal.curve.observed.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn overconfident_predictions_have_slope_below_one() {
        let (p, y) = well_calibrated(20_000, 12);
        // Doubling the log-odds spreads predictions too far.
        let stretched = p.mapv(|v| inverse_logit(2.0 * logit(v)));
        let cal = assess(stretched.view(), y.view(), &CalibrationOptions::default());
        assert!((cal.slope - 0.5).abs() < 0.06, "slope {}", cal.slope);
    }

    #[test]
    fn brier_and_observed_expected_by_hand() {
        let p = array![0.2, 0.4, 0.6, 0.8];
        let y = array![0.0, 1.0, 0.0, 1.0];
        let cal = assess(p.view(), y.view(), &CalibrationOptions::default());
        assert_abs_diff_eq!(cal.brier, (0.04 + 0.36 + 0.36 + 0.04) / 4.0, epsilon = 1e-12);
        assert_abs_diff_eq!(cal.observed_expected, 2.0 / 2.0, epsilon = 1e-12);
    }

    #[test]
    fn constant_predictions_give_nan_slope_not_a_failure() {
        let p = Array1::from_elem(30, 0.25);
        let y = Array1::from_shape_fn(30, |i| if i % 4 == 0 { 1.0 } else { 0.0 });
        let cal = assess(p.view(), y.view(), &CalibrationOptions::default());
        assert!(cal.degenerate);
        assert!(cal.slope.is_nan());
        assert!(cal.brier.is_finite());
    }

    #[test]
    fn lowess_reproduces_a_straight_line() {
        let x = Array1::linspace(0.0, 1.0, 101);
        let y = x.mapv(|v| 0.1 + 0.5 * v);
        let smooth = Lowess::fit(x.view(), y.view(), 0.3).unwrap();
        for &x0 in &[0.0, 0.25, 0.5, 0.99] {
            assert_abs_diff_eq!(smooth.evaluate(x0), 0.1 + 0.5 * x0, epsilon = 1e-10);
        }
    }

    #[test]
    fn grid_spans_central_percentiles() {
        let p = Array1::linspace(0.0, 1.0, 101);
        let grid = prediction_grid(p.view(), 5);
        assert_eq!(grid.len(), 5);
        assert_abs_diff_eq!(grid[0], 0.01, epsilon = 1e-12);
        assert_abs_diff_eq!(grid[4], 0.99, epsilon = 1e-12);
        assert_eq!(prediction_grid(Array1::from_elem(4, 0.3).view(), 5), vec![0.3]);
    }
}
