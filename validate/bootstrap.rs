//! # Bootstrap Stability Engine
//!
//! Estimates how much each subject's predicted risk would change had the
//! models been fitted on a different sample from the same population.
//!
//! Iteration 0 is the reference fit on the completed reference cohort.
//! Iterations `1..B` each draw `N` rows with replacement from the raw
//! reference rows, impute the resample with their own RNG, refit every model
//! and score the *fixed* completed reference cohort. Only scoring on the
//! reference rows makes per-subject comparisons across iterations meaningful.
//!
//! Iterations run on a rayon pool and fold into owned
//! [`StabilityAccumulator`]s that are reduced pairwise; nothing is shared
//! mutably between workers except the cancellation flag.

use crate::calibration::{CalibrationCurve, prediction_grid, quantile_sorted, smoothed_curve};
use crate::data::{FittingSample, ReferenceCohort};
use crate::impute::{ImputationError, ImputationPlan};
use crate::irls::FitFailure;
use crate::model::{FittedModel, ModelFitter, ModelSpec};
use crate::progress::{BootstrapProgress, ValidationStage};
use ndarray::{Array1, Zip};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;

// ========================================================================================
//                                 Configuration & control
// ========================================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct BootstrapConfig {
    /// Total iterations `B`, counting the reference fit as iteration 0.
    pub iterations: usize,
    pub seed: u64,
    /// Worker threads; `None` uses the global rayon pool.
    pub threads: Option<usize>,
    pub iteration_timeout: Option<Duration>,
    /// Above this fraction of failed resampled fits a model's instability is
    /// reported as unavailable.
    pub max_failure_rate: f64,
    pub curve_span: f64,
    pub curve_points: usize,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            iterations: 200,
            seed: 1,
            threads: None,
            iteration_timeout: None,
            max_failure_rate: 0.5,
            curve_span: 2.0 / 3.0,
            curve_points: 50,
        }
    }
}

/// Run deadline and cooperative cancellation. Iterations that have not
/// started when either trips are skipped; running iterations finish.
#[derive(Debug, Clone, Default)]
pub struct RunControl {
    deadline: Option<Instant>,
    cancelled: Arc<AtomicBool>,
}

impl RunControl {
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Clones share the flag, so any clone can stop the run from another thread.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    fn should_stop(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
            || self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }
}

// ========================================================================================
//                                        Errors
// ========================================================================================

/// Why one model produced no predictions in one iteration. Recovered and counted.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum IterationFailure {
    #[error(transparent)]
    Fit(#[from] FitFailure),
    #[error("Imputation of the resample failed: {0}")]
    Imputation(#[from] ImputationError),
    #[error("The imputed resample is still incomplete: {0}")]
    IncompleteSample(String),
    #[error("Scoring the reference cohort failed: {0}")]
    Scoring(String),
    #[error("The iteration exceeded its time budget after {elapsed_ms} ms.")]
    TimedOut { elapsed_ms: u128 },
}

impl IterationFailure {
    pub fn kind(&self) -> &'static str {
        match self {
            IterationFailure::Fit(failure) => failure.kind(),
            IterationFailure::Imputation(_) => "imputation",
            IterationFailure::IncompleteSample(_) => "incomplete_sample",
            IterationFailure::Scoring(_) => "scoring",
            IterationFailure::TimedOut { .. } => "timed_out",
        }
    }
}

#[derive(Error, Debug)]
pub enum BootstrapError {
    #[error("At least 2 bootstrap iterations are required (the reference fit plus one resample), got {0}.")]
    TooFewIterations(usize),
    #[error("The reference fit of model '{model}' failed: {source}")]
    ReferenceFit {
        model: String,
        source: IterationFailure,
    },
    #[error("The reference record holds {found} models but {expected} were specified.")]
    ReferenceMismatch { expected: usize, found: usize },
    #[error("Failed to build the bootstrap thread pool: {0}")]
    ThreadPool(String),
}

// ========================================================================================
//                                  Single iterations
// ========================================================================================

/// Per model, either the predictions on the reference cohort (one per subject,
/// in cohort row order) or why there are none.
#[derive(Debug, Clone)]
pub struct IterationRecord {
    pub iteration: usize,
    pub predictions: Vec<Result<Array1<f64>, IterationFailure>>,
}

/// The reference models and their iteration-0 record.
#[derive(Debug, Clone)]
pub struct ReferenceFit {
    pub models: Vec<FittedModel>,
    pub record: IterationRecord,
}

/// One seed per iteration drawn from a master generator; index 0 belongs to
/// the reference fit, which consumes no randomness.
pub fn derive_seeds(master: u64, iterations: usize) -> Vec<u64> {
    let mut rng = StdRng::seed_from_u64(master);
    (0..iterations).map(|_| rng.next_u64()).collect()
}

/// Fits every model on `sample` and scores the completed reference cohort.
/// Failures are isolated per model.
pub fn fit_and_score<F: ModelFitter + ?Sized>(
    fitter: &F,
    specs: &[ModelSpec],
    sample: &FittingSample,
    cohort: &ReferenceCohort,
    budget: Option<(Instant, Duration)>,
) -> Vec<Result<(FittedModel, Array1<f64>), IterationFailure>> {
    let over_budget = || match budget {
        Some((started, limit)) if started.elapsed() > limit => Some(IterationFailure::TimedOut {
            elapsed_ms: started.elapsed().as_millis(),
        }),
        _ => None,
    };
    specs
        .iter()
        .map(|spec| {
            if let Some(timeout) = over_budget() {
                return Err(timeout);
            }
            let model = fitter.fit(spec, sample)?;
            let predictions = model
                .score(cohort)
                .map_err(|err| IterationFailure::Scoring(err.to_string()))?;
            if let Some(timeout) = over_budget() {
                return Err(timeout);
            }
            Ok((model, predictions))
        })
        .collect()
}

/// Runs one bootstrap iteration: resample, impute, fit, predict on reference.
///
/// The result depends only on the arguments, so iterations can run in any
/// order on any thread.
pub fn run_iteration<F: ModelFitter + ?Sized>(
    iteration: usize,
    seed: u64,
    cohort: &ReferenceCohort,
    specs: &[ModelSpec],
    plan: &ImputationPlan,
    fitter: &F,
    timeout: Option<Duration>,
) -> IterationRecord {
    let started = Instant::now();
    let sample = if iteration == 0 {
        Ok(FittingSample::reference(cohort))
    } else {
        let mut rng = StdRng::seed_from_u64(seed);
        let resample = cohort.raw().resample(&mut rng);
        plan.impute(&resample, &mut rng)
            .map_err(IterationFailure::from)
            .and_then(|data| {
                FittingSample::new(iteration, data)
                    .map_err(|err| IterationFailure::IncompleteSample(err.to_string()))
            })
    };

    let mut predictions: Vec<Result<Array1<f64>, IterationFailure>> = match sample {
        Ok(sample) => fit_and_score(
            fitter,
            specs,
            &sample,
            cohort,
            timeout.map(|limit| (started, limit)),
        )
        .into_iter()
        .map(|result| result.map(|(_, predictions)| predictions))
        .collect(),
        Err(failure) => vec![Err(failure); specs.len()],
    };

    // A timeout fails the whole iteration, including models that finished in time.
    let timeout = predictions.iter().find_map(|result| match result {
        Err(failure @ IterationFailure::TimedOut { .. }) => Some(failure.clone()),
        _ => None,
    });
    if let Some(timeout) = timeout {
        predictions = vec![Err(timeout); specs.len()];
    }

    for (spec, result) in specs.iter().zip(&predictions) {
        if let Err(failure) = result {
            log::debug!("Iteration {iteration}: model '{}' failed: {failure}", spec.name);
        }
    }
    IterationRecord {
        iteration,
        predictions,
    }
}

/// Fits every model on the completed reference cohort. Any failure is fatal.
pub fn reference_fit<F: ModelFitter + ?Sized>(
    fitter: &F,
    specs: &[ModelSpec],
    cohort: &ReferenceCohort,
) -> Result<ReferenceFit, BootstrapError> {
    let sample = FittingSample::reference(cohort);
    let mut models = Vec::with_capacity(specs.len());
    let mut predictions = Vec::with_capacity(specs.len());
    for (spec, result) in specs
        .iter()
        .zip(fit_and_score(fitter, specs, &sample, cohort, None))
    {
        let (model, scores) = result.map_err(|source| BootstrapError::ReferenceFit {
            model: spec.name.clone(),
            source,
        })?;
        log::info!(
            "Reference fit of '{}': {} parameters, deviance {:.3}, {} IRLS iterations",
            spec.name,
            model.num_parameters(),
            model.deviance,
            model.iterations
        );
        models.push(model);
        predictions.push(Ok(scores));
    }
    Ok(ReferenceFit {
        models,
        record: IterationRecord {
            iteration: 0,
            predictions,
        },
    })
}

// ========================================================================================
//                                      Aggregation
// ========================================================================================

/// Read-only inputs every accumulator needs: the reference predictions, the
/// reference outcomes and the calibration grid fixed by iteration 0.
#[derive(Debug, Clone)]
pub struct StabilityContext {
    names: Vec<String>,
    reference: Vec<Array1<f64>>,
    outcomes: Array1<f64>,
    grids: Vec<Vec<f64>>,
    span: f64,
}

impl StabilityContext {
    pub fn new(
        specs: &[ModelSpec],
        reference: &IterationRecord,
        cohort: &ReferenceCohort,
        span: f64,
        grid_points: usize,
    ) -> Result<Self, BootstrapError> {
        if reference.predictions.len() != specs.len() {
            return Err(BootstrapError::ReferenceMismatch {
                expected: specs.len(),
                found: reference.predictions.len(),
            });
        }
        let mut predictions = Vec::with_capacity(specs.len());
        for (spec, result) in specs.iter().zip(&reference.predictions) {
            match result {
                Ok(p) => predictions.push(p.clone()),
                Err(failure) => {
                    return Err(BootstrapError::ReferenceFit {
                        model: spec.name.clone(),
                        source: failure.clone(),
                    });
                }
            }
        }
        let grids = predictions
            .iter()
            .map(|p| prediction_grid(p.view(), grid_points))
            .collect();
        Ok(Self {
            names: specs.iter().map(|s| s.name.clone()).collect(),
            reference: predictions,
            outcomes: cohort.outcomes().clone(),
            grids,
            span,
        })
    }

    fn subjects(&self) -> usize {
        self.outcomes.len()
    }
}

#[derive(Debug, Clone)]
struct ModelTally {
    absolute_deviation: Array1<f64>,
    sum: Array1<f64>,
    sum_squares: Array1<f64>,
    succeeded: usize,
    failures: BTreeMap<&'static str, usize>,
    curves: Vec<(usize, Vec<f64>)>,
}

impl ModelTally {
    fn new(subjects: usize) -> Self {
        Self {
            absolute_deviation: Array1::zeros(subjects),
            sum: Array1::zeros(subjects),
            sum_squares: Array1::zeros(subjects),
            succeeded: 0,
            failures: BTreeMap::new(),
            curves: Vec::new(),
        }
    }

    fn merge(mut self, other: ModelTally) -> Self {
        self.absolute_deviation += &other.absolute_deviation;
        self.sum += &other.sum;
        self.sum_squares += &other.sum_squares;
        self.succeeded += other.succeeded;
        for (kind, count) in other.failures {
            *self.failures.entry(kind).or_insert(0) += count;
        }
        self.curves.extend(other.curves);
        self
    }
}

/// Running sums for every model; the only state that survives an iteration.
#[derive(Debug, Clone)]
pub struct StabilityAccumulator {
    tallies: Vec<ModelTally>,
    attempted: usize,
    skipped: usize,
    timed_out: usize,
}

impl StabilityAccumulator {
    pub fn new(context: &StabilityContext) -> Self {
        Self {
            tallies: (0..context.names.len())
                .map(|_| ModelTally::new(context.subjects()))
                .collect(),
            attempted: 0,
            skipped: 0,
            timed_out: 0,
        }
    }

    /// Folds one iteration's predictions in and drops them.
    pub fn absorb(&mut self, record: IterationRecord, context: &StabilityContext) {
        self.attempted += 1;
        let mut timed_out = false;
        for (m, result) in record.predictions.into_iter().enumerate() {
            let tally = &mut self.tallies[m];
            match result {
                Ok(predictions) => {
                    Zip::from(&mut tally.absolute_deviation)
                        .and(&predictions)
                        .and(&context.reference[m])
                        .for_each(|acc, &p, &p0| *acc += (p - p0).abs());
                    tally.sum += &predictions;
                    tally.sum_squares += &predictions.mapv(|p| p * p);
                    tally.succeeded += 1;
                    let curve = smoothed_curve(
                        predictions.view(),
                        context.outcomes.view(),
                        &context.grids[m],
                        context.span,
                    );
                    tally.curves.push((record.iteration, curve));
                }
                Err(failure) => {
                    timed_out |= matches!(failure, IterationFailure::TimedOut { .. });
                    *tally.failures.entry(failure.kind()).or_insert(0) += 1;
                }
            }
        }
        if timed_out {
            self.timed_out += 1;
        }
    }

    /// Records an iteration that was never started.
    pub fn skip(&mut self) {
        self.skipped += 1;
    }

    pub fn merge(mut self, other: StabilityAccumulator) -> Self {
        self.tallies = self
            .tallies
            .into_iter()
            .zip(other.tallies)
            .map(|(a, b)| a.merge(b))
            .collect();
        self.attempted += other.attempted;
        self.skipped += other.skipped;
        self.timed_out += other.timed_out;
        self
    }

    /// Turns the running sums into the per-model stability report.
    pub fn finish(
        self,
        context: &StabilityContext,
        requested: usize,
        max_failure_rate: f64,
    ) -> StabilityReport {
        let attempted = self.attempted;
        let models = self
            .tallies
            .into_iter()
            .enumerate()
            .map(|(m, tally)| {
                let reference_curve = CalibrationCurve {
                    grid: context.grids[m].clone(),
                    observed: smoothed_curve(
                        context.reference[m].view(),
                        context.outcomes.view(),
                        &context.grids[m],
                        context.span,
                    ),
                };
                summarize_model(
                    &context.names[m],
                    tally,
                    attempted,
                    requested,
                    max_failure_rate,
                    reference_curve,
                )
            })
            .collect();
        StabilityReport {
            requested,
            completed: attempted + 1,
            skipped: self.skipped,
            timed_out: self.timed_out,
            models,
        }
    }
}

fn summarize_model(
    name: &str,
    mut tally: ModelTally,
    attempted: usize,
    requested: usize,
    max_failure_rate: f64,
    reference_curve: CalibrationCurve,
) -> ModelStability {
    let failed: usize = tally.failures.values().sum();
    let failure_rate = if attempted > 0 {
        failed as f64 / attempted as f64
    } else {
        f64::NAN
    };
    let k = tally.succeeded;

    let instability = if attempted == 0 {
        InstabilityResult::Unavailable {
            reason: "no resampled iteration was completed".to_string(),
        }
    } else if failure_rate > max_failure_rate {
        InstabilityResult::Unavailable {
            reason: format!(
                "{failed} of {attempted} resampled fits failed ({:.1}%), above the {:.1}% ceiling",
                100.0 * failure_rate,
                100.0 * max_failure_rate
            ),
        }
    } else if k == 0 {
        InstabilityResult::Unavailable {
            reason: "no resampled fit succeeded".to_string(),
        }
    } else {
        let kf = k as f64;
        let mape = tally.absolute_deviation.mapv(|d| d / kf);
        let mean = tally.sum.mapv(|s| s / kf);
        let sd = Zip::from(&tally.sum_squares)
            .and(&mean)
            .map_collect(|&ss, &mu| {
                if k < 2 {
                    f64::NAN
                } else {
                    ((ss - kf * mu * mu) / (kf - 1.0)).max(0.0).sqrt()
                }
            });
        let instability_index = mape.mean().unwrap_or(f64::NAN);
        log::info!("Model '{name}': instability index {instability_index:.5} over {k} resampled fits");
        InstabilityResult::Available(SubjectInstability {
            instability_index,
            mape: mape.to_vec(),
            mean: mean.to_vec(),
            sd: sd.to_vec(),
        })
    };
    if let InstabilityResult::Unavailable { reason } = &instability {
        log::warn!("Instability of '{name}' unavailable: {reason}");
    }

    tally.curves.sort_by_key(|(iteration, _)| *iteration);
    let bands = calibration_bands(&reference_curve.grid, &tally.curves);
    ModelStability {
        model: name.to_string(),
        requested,
        attempted,
        succeeded: k + 1,
        failures: tally
            .failures
            .into_iter()
            .map(|(kind, count)| (kind.to_string(), count))
            .collect(),
        failure_rate,
        instability,
        reference_curve,
        curves: tally.curves,
        bands,
    }
}

/// Pointwise 2.5%, 50% and 97.5% quantiles of the bootstrap curves.
fn calibration_bands(grid: &[f64], curves: &[(usize, Vec<f64>)]) -> Vec<CalibrationBand> {
    grid.iter()
        .enumerate()
        .map(|(j, &x)| {
            let mut values: Vec<f64> = curves
                .iter()
                .filter_map(|(_, curve)| curve.get(j).copied())
                .filter(|v| !v.is_nan())
                .collect();
            if values.is_empty() {
                return CalibrationBand {
                    predicted: x,
                    lower: f64::NAN,
                    median: f64::NAN,
                    upper: f64::NAN,
                };
            }
            values.sort_by(f64::total_cmp);
            CalibrationBand {
                predicted: x,
                lower: quantile_sorted(&values, 0.025),
                median: quantile_sorted(&values, 0.5),
                upper: quantile_sorted(&values, 0.975),
            }
        })
        .collect()
}

// ========================================================================================
//                                       Results
// ========================================================================================

/// Per-subject instability, one entry per reference subject in row order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubjectInstability {
    /// Mean of the per-subject MAPE.
    pub instability_index: f64,
    /// Mean absolute difference from the reference prediction.
    pub mape: Vec<f64>,
    pub mean: Vec<f64>,
    pub sd: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum InstabilityResult {
    Available(SubjectInstability),
    Unavailable { reason: String },
}

impl InstabilityResult {
    pub fn available(&self) -> Option<&SubjectInstability> {
        match self {
            InstabilityResult::Available(result) => Some(result),
            InstabilityResult::Unavailable { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationBand {
    pub predicted: f64,
    pub lower: f64,
    pub median: f64,
    pub upper: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelStability {
    pub model: String,
    /// Iterations requested, including the reference fit.
    pub requested: usize,
    /// Resampled iterations that ran.
    pub attempted: usize,
    /// Successful fits, including the reference fit.
    pub succeeded: usize,
    /// Failed resampled fits by kind.
    pub failures: BTreeMap<String, usize>,
    pub failure_rate: f64,
    pub instability: InstabilityResult,
    pub reference_curve: CalibrationCurve,
    /// Calibration curve per successful resampled iteration, by iteration.
    pub curves: Vec<(usize, Vec<f64>)>,
    pub bands: Vec<CalibrationBand>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StabilityReport {
    pub requested: usize,
    /// Iterations that ran, including the reference fit.
    pub completed: usize,
    pub skipped: usize,
    pub timed_out: usize,
    pub models: Vec<ModelStability>,
}

// ========================================================================================
//                                       The engine
// ========================================================================================

pub struct BootstrapEngine<'a, F: ModelFitter + ?Sized> {
    pub cohort: &'a ReferenceCohort,
    pub specs: &'a [ModelSpec],
    pub plan: &'a ImputationPlan,
    pub fitter: &'a F,
    pub config: &'a BootstrapConfig,
    pub control: RunControl,
}

impl<F: ModelFitter + ?Sized> BootstrapEngine<'_, F> {
    /// Runs iterations `1..B` against the given iteration-0 record.
    pub fn run(
        &self,
        reference: &IterationRecord,
        progress: &dyn BootstrapProgress,
    ) -> Result<StabilityReport, BootstrapError> {
        let iterations = self.config.iterations;
        if iterations < 2 {
            return Err(BootstrapError::TooFewIterations(iterations));
        }
        let context = StabilityContext::new(
            self.specs,
            reference,
            self.cohort,
            self.config.curve_span,
            self.config.curve_points,
        )?;
        let seeds = derive_seeds(self.config.seed, iterations);

        log::info!(
            "Running {} resampled iterations for {} models on {} subjects",
            iterations - 1,
            self.specs.len(),
            self.cohort.len()
        );
        progress.on_stage_start(ValidationStage::Bootstrap, iterations - 1);
        let work = || {
            (1..iterations)
                .into_par_iter()
                .map(|iteration| {
                    if self.control.should_stop() {
                        return None;
                    }
                    let record = run_iteration(
                        iteration,
                        seeds[iteration],
                        self.cohort,
                        self.specs,
                        self.plan,
                        self.fitter,
                        self.config.iteration_timeout,
                    );
                    progress.on_iteration_complete(iteration);
                    Some(record)
                })
                .fold(
                    || StabilityAccumulator::new(&context),
                    |mut acc, record| {
                        match record {
                            Some(record) => acc.absorb(record, &context),
                            None => acc.skip(),
                        }
                        acc
                    },
                )
                .reduce(|| StabilityAccumulator::new(&context), StabilityAccumulator::merge)
        };
        let accumulator = match self.config.threads {
            Some(threads) => rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .build()
                .map_err(|err| BootstrapError::ThreadPool(err.to_string()))?
                .install(work),
            None => work(),
        };
        progress.on_stage_finish(ValidationStage::Bootstrap);

        let report = accumulator.finish(&context, iterations, self.config.max_failure_rate);
        if report.skipped > 0 {
            log::warn!(
                "Stopped early: {} of {} iterations completed, {} skipped",
                report.completed,
                report.requested,
                report.skipped
            );
        } else {
            log::info!("Completed all {} iterations", report.requested);
        }
        Ok(report)
    }
}
