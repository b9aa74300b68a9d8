//! Concordance (c-statistic) of predicted risk against a binary outcome.

use ndarray::ArrayView1;
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};

/// The c-statistic with its Hanley–McNeil 95% confidence interval.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Discrimination {
    pub c_statistic: f64,
    pub standard_error: f64,
    pub lower: f64,
    pub upper: f64,
    pub events: usize,
    pub non_events: usize,
    /// Set when the statistic is undefined: an empty outcome class or
    /// predictions that are all tied. Every numeric field is then `NaN`.
    pub degenerate: bool,
}

impl Discrimination {
    fn undefined(events: usize, non_events: usize) -> Self {
        Self {
            c_statistic: f64::NAN,
            standard_error: f64::NAN,
            lower: f64::NAN,
            upper: f64::NAN,
            events,
            non_events,
            degenerate: true,
        }
    }
}

/// Computes the c-statistic by mid-ranks; tied event/non-event pairs count one half.
pub fn c_statistic(predictions: ArrayView1<f64>, outcomes: ArrayView1<f64>) -> Discrimination {
    let events = outcomes.iter().filter(|&&y| y == 1.0).count();
    let non_events = outcomes.len() - events;
    if events == 0 || non_events == 0 {
        log::warn!("c-statistic undefined: {events} events and {non_events} non-events");
        return Discrimination::undefined(events, non_events);
    }
    let first = predictions[0];
    if predictions.iter().all(|&p| p == first) {
        log::warn!("c-statistic undefined: all {} predictions are tied", predictions.len());
        return Discrimination::undefined(events, non_events);
    }

    let ranks = mid_ranks(predictions);
    let event_rank_sum: f64 = ranks
        .iter()
        .zip(outcomes.iter())
        .filter(|&(_, &y)| y == 1.0)
        .map(|(r, _)| r)
        .sum();
    let n1 = events as f64;
    let n0 = non_events as f64;
    let auc = (event_rank_sum - n1 * (n1 + 1.0) / 2.0) / (n1 * n0);

    let standard_error = hanley_mcneil_se(auc, n1, n0);
    let z = standard_normal_quantile(0.975);
    Discrimination {
        c_statistic: auc,
        standard_error,
        lower: (auc - z * standard_error).clamp(0.0, 1.0),
        upper: (auc + z * standard_error).clamp(0.0, 1.0),
        events,
        non_events,
        degenerate: false,
    }
}

/// Average 1-based ranks, with ties sharing the mean of the positions they span.
fn mid_ranks(values: ArrayView1<f64>) -> Vec<f64> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| values[a].total_cmp(&values[b]));
    let mut ranks = vec![0.0; values.len()];
    let mut start = 0;
    while start < order.len() {
        let mut end = start + 1;
        while end < order.len() && values[order[end]] == values[order[start]] {
            end += 1;
        }
        // Positions start..end hold 1-based ranks start+1..=end.
        let rank = (start + 1 + end) as f64 / 2.0;
        for &idx in &order[start..end] {
            ranks[idx] = rank;
        }
        start = end;
    }
    ranks
}

fn hanley_mcneil_se(auc: f64, n1: f64, n0: f64) -> f64 {
    let q1 = auc / (2.0 - auc);
    let q2 = 2.0 * auc * auc / (1.0 + auc);
    let variance = (auc * (1.0 - auc)
        + (n1 - 1.0) * (q1 - auc * auc)
        + (n0 - 1.0) * (q2 - auc * auc))
        / (n1 * n0);
    variance.max(0.0).sqrt()
}

pub(crate) fn standard_normal_quantile(p: f64) -> f64 {
    match Normal::new(0.0, 1.0) {
        Ok(normal) => normal.inverse_cdf(p),
        Err(_) => f64::NAN,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn perfect_ranking_gives_one() {
        let p = array![0.1, 0.2, 0.3, 0.8, 0.9];
        let y = array![0.0, 0.0, 0.0, 1.0, 1.0];
        let d = c_statistic(p.view(), y.view());
        assert_eq!(d.c_statistic, 1.0);
        assert_eq!(d.upper, 1.0);
        assert!(!d.degenerate);
    }

    #[test]
    fn ties_count_one_half() {
        // One event and one non-event at the same prediction: c = 0.5.
        let p = array![0.4, 0.4];
        let y = array![1.0, 0.0];
        let tied = c_statistic(array![0.4, 0.4, 0.9].view(), array![1.0, 0.0, 0.0].view());
        assert_abs_diff_eq!(tied.c_statistic, 0.25, epsilon = 1e-12);
        assert!(c_statistic(p.view(), y.view()).degenerate);
    }

    #[test]
    fn matches_pairwise_definition() {
        let p = array![0.05, 0.3, 0.3, 0.6, 0.2, 0.7, 0.3, 0.9];
        let y = array![0.0, 1.0, 0.0, 1.0, 0.0, 0.0, 1.0, 1.0];
        let mut concordant = 0.0;
        let mut pairs = 0.0;
        for i in 0..p.len() {
            for j in 0..p.len() {
                if y[i] == 1.0 && y[j] == 0.0 {
                    pairs += 1.0;
                    if p[i] > p[j] {
                        concordant += 1.0;
                    } else if p[i] == p[j] {
                        concordant += 0.5;
                    }
                }
            }
        }
        let d = c_statistic(p.view(), y.view());
        assert_abs_diff_eq!(d.c_statistic, concordant / pairs, epsilon = 1e-12);
        assert!(d.lower <= d.c_statistic && d.c_statistic <= d.upper);
    }

    #[test]
    fn invariant_under_monotone_transform() {
        let p = array![0.05, 0.3, 0.31, 0.6, 0.2, 0.7, 0.33, 0.9, 0.1];
        let y = array![0.0, 1.0, 0.0, 1.0, 0.0, 0.0, 1.0, 1.0, 0.0];
        let base = c_statistic(p.view(), y.view());
        let transformed = p.mapv(|v: f64| (v / (1.0 - v)).ln() * 3.0 + 1.0);
        let after = c_statistic(transformed.view(), y.view());
        assert_eq!(base.c_statistic, after.c_statistic);
    }

    #[test]
    fn constant_predictions_and_single_class_are_nan() {
        let constant = c_statistic(array![0.2, 0.2, 0.2].view(), array![0.0, 1.0, 0.0].view());
        assert!(constant.degenerate && constant.c_statistic.is_nan() && constant.lower.is_nan());
        let single = c_statistic(array![0.1, 0.5, 0.9].view(), array![1.0, 1.0, 1.0].view());
        assert!(single.degenerate && single.c_statistic.is_nan());
        assert_eq!(single.non_events, 0);
    }

    #[test]
    fn hanley_mcneil_reference_value() {
        // Hanley & McNeil (1982), table 1: A = 0.8, 50 events, 50 non-events.
        let se = hanley_mcneil_se(0.8, 50.0, 50.0);
        assert_abs_diff_eq!(se, 0.0445, epsilon = 5e-4);
        assert_abs_diff_eq!(standard_normal_quantile(0.975), 1.959964, epsilon = 1e-5);
    }
}
