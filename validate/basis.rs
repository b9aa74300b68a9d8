use ndarray::{Array2, ArrayView1};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The smallest and largest knot counts with a default quantile placement.
pub const MIN_SPLINE_KNOTS: usize = 3;
pub const MAX_SPLINE_KNOTS: usize = 7;

/// A comprehensive error type for all operations within the basis module.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BasisError {
    #[error("Restricted cubic splines support 3 to 7 knots, but {0} were requested.")]
    UnsupportedKnotCount(usize),

    #[error("Quantile knot placement requires a non-empty column.")]
    QuantileDataMissing,

    #[error("Only {distinct} distinct knot locations could be placed; at least 3 are required.")]
    TooFewDistinctKnots { distinct: usize },

    #[error("Knot vector must be strictly increasing.")]
    UnsortedKnots,

    #[error("Cannot evaluate a spline basis at a non-finite value ({0}).")]
    NonFiniteInput(f64),
}

/// Knot locations of a restricted cubic spline, frozen at fit time so that
/// prediction on new rows applies the identical expansion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplineKnots {
    knots: Vec<f64>,
}

impl SplineKnots {
    /// Places `num_knots` knots at the conventional quantiles of `data`
    /// (Harrell's defaults), dropping duplicate locations.
    pub fn from_quantiles(data: ArrayView1<f64>, num_knots: usize) -> Result<Self, BasisError> {
        let probabilities = default_knot_quantiles(num_knots)?;
        if data.is_empty() {
            return Err(BasisError::QuantileDataMissing);
        }
        let mut knots = internal::quantiles(data, probabilities);
        knots.dedup_by(|a, b| (*a - *b).abs() <= f64::EPSILON * b.abs().max(1.0));
        Self::from_locations(knots)
    }

    /// Uses explicit knot locations, which must be strictly increasing.
    pub fn from_locations(knots: Vec<f64>) -> Result<Self, BasisError> {
        if knots.len() < MIN_SPLINE_KNOTS {
            return Err(BasisError::TooFewDistinctKnots {
                distinct: knots.len(),
            });
        }
        if knots.windows(2).any(|w| w[1] <= w[0]) {
            return Err(BasisError::UnsortedKnots);
        }
        Ok(Self { knots })
    }

    pub fn locations(&self) -> &[f64] {
        &self.knots
    }

    /// Number of design columns produced: the linear term plus `k - 2` cubic terms.
    pub fn num_columns(&self) -> usize {
        self.knots.len() - 1
    }

    /// Expands `data` into the restricted cubic spline basis.
    ///
    /// The first column is `x` itself; column `j + 1` is
    ///
    /// ```text
    /// (x - t_j)^3_+ - (x - t_{k-1})^3_+ (t_k - t_j) / (t_k - t_{k-1})
    ///               + (x - t_k)^3_+     (t_{k-1} - t_j) / (t_k - t_{k-1})
    /// ```
    ///
    /// divided by `(t_k - t_1)^2` so the nonlinear columns stay on the scale of `x`.
    /// The resulting function is linear beyond the boundary knots.
    pub fn basis(&self, data: ArrayView1<f64>) -> Result<Array2<f64>, BasisError> {
        let mut basis = Array2::zeros((data.len(), self.num_columns()));
        for (i, &x) in data.iter().enumerate() {
            if !x.is_finite() {
                return Err(BasisError::NonFiniteInput(x));
            }
            let mut row = basis.row_mut(i);
            row[0] = x;
            for (j, value) in internal::nonlinear_terms(x, &self.knots).enumerate() {
                row[j + 1] = value;
            }
        }
        Ok(basis)
    }
}

/// Harrell's default quantile locations for 3 to 7 knots.
pub fn default_knot_quantiles(num_knots: usize) -> Result<&'static [f64], BasisError> {
    match num_knots {
        3 => Ok(&[0.10, 0.50, 0.90]),
        4 => Ok(&[0.05, 0.35, 0.65, 0.95]),
        5 => Ok(&[0.05, 0.275, 0.50, 0.725, 0.95]),
        6 => Ok(&[0.05, 0.23, 0.41, 0.59, 0.77, 0.95]),
        7 => Ok(&[0.025, 0.1833, 0.3417, 0.50, 0.6583, 0.8167, 0.975]),
        other => Err(BasisError::UnsupportedKnotCount(other)),
    }
}

/// Internal module for implementation details not exposed in the public API.
mod internal {
    use super::*;

    /// Calculates quantiles at the given probabilities using linear interpolation (Type 7 in R).
    pub(super) fn quantiles(data: ArrayView1<f64>, probabilities: &[f64]) -> Vec<f64> {
        let mut sorted_data = data.to_vec();
        sorted_data.sort_unstable_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let n = sorted_data.len();
        probabilities
            .iter()
            .map(|&p| {
                let float_idx = (n as f64 - 1.0) * p;
                let lower_idx = float_idx.floor() as usize;
                let upper_idx = float_idx.ceil() as usize;

                if lower_idx == upper_idx {
                    sorted_data[lower_idx]
                } else {
                    let fraction = float_idx - lower_idx as f64;
                    sorted_data[lower_idx] * (1.0 - fraction) + sorted_data[upper_idx] * fraction
                }
            })
            .collect()
    }

    pub(super) fn nonlinear_terms(x: f64, knots: &[f64]) -> impl Iterator<Item = f64> + '_ {
        let k = knots.len();
        let t_last = knots[k - 1];
        let t_penult = knots[k - 2];
        let tail_span = t_last - t_penult;
        let norm = (t_last - knots[0]).powi(2);
        let cube = |v: f64| if v > 0.0 { v * v * v } else { 0.0 };

        knots[..k - 2].iter().map(move |&t_j| {
            let value = cube(x - t_j) - cube(x - t_penult) * (t_last - t_j) / tail_span
                + cube(x - t_last) * (t_penult - t_j) / tail_span;
            value / norm
        })
    }
}
