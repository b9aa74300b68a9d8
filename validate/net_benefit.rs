//! Decision-curve analysis.
//!
//! At a risk threshold `pt` a subject is treated when the predicted risk is at
//! least `pt`. Net benefit weighs false positives by the odds of the threshold:
//! `NB = TP/N - FP/N * pt / (1 - pt)`. The odds diverge as `pt` approaches 1,
//! so thresholds above `upper_bound` are never evaluated silently.

use ndarray::ArrayView1;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum NetBenefitError {
    #[error("Threshold grid step must be positive, got {0}.")]
    NonPositiveStep(f64),
    #[error("Threshold grid minimum {0} is below 0.")]
    NegativeMinimum(f64),
    #[error("Threshold grid minimum {min} exceeds its maximum {max}.")]
    InvertedRange { min: f64, max: f64 },
    #[error("Threshold upper bound must lie strictly between 0 and 1, got {0}.")]
    InvalidUpperBound(f64),
    #[error("Threshold grid {name} must be finite, got {value}.")]
    NonFiniteBound { name: &'static str, value: f64 },
    #[error("Threshold grid of {0:.0} points is too large.")]
    GridTooLarge(f64),
}

/// What happens to thresholds above the upper bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdPolicy {
    /// Keep the row, mark it, and report no net benefit for it.
    #[default]
    Flag,
    /// Remove the threshold from the grid.
    Clip,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdGrid {
    pub min: f64,
    pub max: f64,
    pub step: f64,
    pub upper_bound: f64,
    pub policy: ThresholdPolicy,
}

impl Default for ThresholdGrid {
    fn default() -> Self {
        Self {
            min: 0.0,
            max: 0.5,
            step: 0.01,
            upper_bound: 0.99,
            policy: ThresholdPolicy::Flag,
        }
    }
}

const MAX_GRID_POINTS: usize = 100_000;

impl ThresholdGrid {
    pub fn validate(&self) -> Result<(), NetBenefitError> {
        for (name, value) in [("min", self.min), ("max", self.max), ("step", self.step)] {
            if value.is_infinite() {
                return Err(NetBenefitError::NonFiniteBound { name, value });
            }
        }
        if !(self.step > 0.0) {
            return Err(NetBenefitError::NonPositiveStep(self.step));
        }
        if !(self.min >= 0.0) {
            return Err(NetBenefitError::NegativeMinimum(self.min));
        }
        if !(self.min <= self.max) {
            return Err(NetBenefitError::InvertedRange {
                min: self.min,
                max: self.max,
            });
        }
        if !(self.upper_bound > 0.0 && self.upper_bound < 1.0) {
            return Err(NetBenefitError::InvalidUpperBound(self.upper_bound));
        }
        let count = self.point_span() + 1.0;
        if !(count <= MAX_GRID_POINTS as f64) {
            return Err(NetBenefitError::GridTooLarge(count));
        }
        Ok(())
    }

    // Steps between min and max, floored. Only cast once validated.
    fn point_span(&self) -> f64 {
        ((self.max - self.min) / self.step + 1e-9).floor()
    }

    /// Grid points with their flag. Clipped thresholds are omitted.
    pub fn thresholds(&self) -> Result<Vec<(f64, bool)>, NetBenefitError> {
        self.validate()?;
        let points = (0..=self.point_span() as usize)
            .map(|i| self.min + self.step * i as f64)
            // A threshold of exactly 1 has infinite odds whatever the bound.
            .map(|pt| (pt, pt > self.upper_bound || pt >= 1.0))
            .filter(|&(_, flagged)| !(flagged && self.policy == ThresholdPolicy::Clip))
            .collect();
        Ok(points)
    }
}

/// Net benefit of one strategy at one threshold. `None` for flagged thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetBenefitRow {
    pub threshold: f64,
    pub flagged: bool,
    pub treat_all: Option<f64>,
    pub treat_none: Option<f64>,
    /// One value per model, in the order the models were given.
    pub models: Vec<Option<f64>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionCurve {
    pub model_names: Vec<String>,
    pub rows: Vec<NetBenefitRow>,
}

/// Net benefit of treating subjects with `prediction >= threshold`.
pub fn model_net_benefit(
    predictions: ArrayView1<f64>,
    outcomes: ArrayView1<f64>,
    threshold: f64,
) -> f64 {
    let n = outcomes.len() as f64;
    let (tp, fp) = predictions
        .iter()
        .zip(outcomes.iter())
        .filter(|&(&p, _)| p >= threshold)
        .fold((0usize, 0usize), |(tp, fp), (_, &y)| {
            if y == 1.0 { (tp + 1, fp) } else { (tp, fp + 1) }
        });
    tp as f64 / n - fp as f64 / n * threshold_odds(threshold)
}

/// Net benefit of treating every subject.
pub fn treat_all_net_benefit(prevalence: f64, threshold: f64) -> f64 {
    prevalence - (1.0 - prevalence) * threshold_odds(threshold)
}

fn threshold_odds(threshold: f64) -> f64 {
    threshold / (1.0 - threshold)
}

/// The decision curve for several models over the same outcomes.
pub fn decision_curve(
    models: &[(&str, ArrayView1<f64>)],
    outcomes: ArrayView1<f64>,
    grid: &ThresholdGrid,
) -> Result<DecisionCurve, NetBenefitError> {
    let thresholds = grid.thresholds()?;
    let prevalence = outcomes.mean().unwrap_or(f64::NAN);
    let rows = thresholds
        .into_iter()
        .map(|(threshold, flagged)| {
            if flagged {
                return NetBenefitRow {
                    threshold,
                    flagged,
                    treat_all: None,
                    treat_none: None,
                    models: vec![None; models.len()],
                };
            }
            NetBenefitRow {
                threshold,
                flagged,
                treat_all: Some(treat_all_net_benefit(prevalence, threshold)),
                treat_none: Some(0.0),
                models: models
                    .iter()
                    .map(|(_, p)| Some(model_net_benefit(p.view(), outcomes, threshold)))
                    .collect(),
            }
        })
        .collect::<Vec<_>>();
    let flagged = rows.iter().filter(|r| r.flagged).count();
    if flagged > 0 {
        log::warn!(
            "{flagged} net-benefit thresholds above {} were flagged and not evaluated",
            grid.upper_bound
        );
    }
    Ok(DecisionCurve {
        model_names: models.iter().map(|(name, _)| name.to_string()).collect(),
        rows,
    })
}
