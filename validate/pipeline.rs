//! End-to-end validation run: impute, fit the reference models, evaluate them
//! once, then bootstrap their stability.

use crate::bootstrap::{
    BootstrapEngine, BootstrapError, RunControl, StabilityReport, reference_fit,
};
use crate::calibration::{Calibration, assess};
use crate::compare::{ModelComparison, compare_models, linearity_probes};
use crate::config::{ConfigError, ValidationConfig};
use crate::data::{DataError, FittingSample, LoadedCohort, ReferenceCohort};
use crate::discrimination::{Discrimination, c_statistic};
use crate::impute::ImputationError;
use crate::model::{FittedModel, ModelFitter};
use crate::net_benefit::{DecisionCurve, NetBenefitError, decision_curve};
use crate::progress::{BootstrapProgress, ValidationStage};
use crate::report::ReportError;
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use thiserror::Error;

/// Every way a validation run can stop.
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Data(#[from] DataError),
    #[error("Single-pass imputation failed: {0}")]
    Imputation(#[from] ImputationError),
    #[error(transparent)]
    NetBenefit(#[from] NetBenefitError),
    #[error(transparent)]
    Bootstrap(#[from] BootstrapError),
    #[error(transparent)]
    Report(#[from] ReportError),
    #[error(
        "Predictor '{column}' has {missing} missing values but is not an imputation target. Add it to [imputation] targets or complete the column."
    )]
    MissingImputationTarget { column: String, missing: usize },
}

/// A coefficient with its label and standard error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Coefficient {
    pub term: String,
    pub estimate: f64,
    pub standard_error: f64,
}

/// Everything computed once on the reference fit of one model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelValidation {
    pub name: String,
    pub formula: String,
    pub coefficients: Vec<Coefficient>,
    pub deviance: f64,
    pub aic: f64,
    pub discrimination: Discrimination,
    pub calibration: Calibration,
    /// Predicted risk per subject, in cohort row order.
    pub predictions: Vec<f64>,
}

impl ModelValidation {
    fn new(
        model: &FittedModel,
        formula: String,
        cohort: &ReferenceCohort,
        config: &ValidationConfig,
    ) -> Self {
        let predictions = cohort
            .predictions(&model.name)
            .map(|p| p.to_vec())
            .unwrap_or_default();
        let p = ndarray::ArrayView1::from(&predictions[..]);
        let outcomes = cohort.outcomes().view();
        let discrimination = c_statistic(p, outcomes);
        let calibration = assess(p, outcomes, &config.calibration);
        log::info!(
            "Model '{}': c = {:.3} ({:.3} to {:.3}), calibration slope {:.3}, intercept {:.3}",
            model.name,
            discrimination.c_statistic,
            discrimination.lower,
            discrimination.upper,
            calibration.slope,
            calibration.intercept
        );
        let coefficients = model
            .coefficient_names()
            .into_iter()
            .zip(model.coefficients.iter().zip(model.standard_errors.iter()))
            .map(|(term, (&estimate, &standard_error))| Coefficient {
                term,
                estimate,
                standard_error,
            })
            .collect();
        Self {
            name: model.name.clone(),
            formula,
            coefficients,
            deviance: model.deviance,
            aic: model.aic(),
            discrimination,
            calibration,
            predictions,
        }
    }
}

/// The full result of a validation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub subject_ids: Vec<String>,
    pub outcomes: Vec<f64>,
    pub prevalence: f64,
    /// Missing predictor values filled by the single-pass imputation.
    pub imputed_values: usize,
    pub models: Vec<ModelValidation>,
    pub comparison: ModelComparison,
    pub decision_curve: DecisionCurve,
    pub stability: StabilityReport,
}

/// Runs the complete validation protocol on a loaded cohort.
pub fn run_validation<F: ModelFitter + ?Sized>(
    config: &ValidationConfig,
    loaded: LoadedCohort,
    fitter: &F,
    control: RunControl,
    progress: &dyn BootstrapProgress,
) -> Result<ValidationReport, ValidationError> {
    config.validate()?;
    let specs = config.model_specs();

    // Single-pass imputation draws from its own stream, independent of the bootstrap seeds.
    progress.on_stage_start(ValidationStage::Imputation, loaded.data.n_rows());
    let mut rng = StdRng::seed_from_u64(config.bootstrap.seed ^ 0x5EED_1A7E);
    let completed = config.imputation.impute(&loaded.data, &mut rng)?;
    if let Some(column) = completed
        .schema()
        .predictors
        .iter()
        .find(|column| completed.missing_count(column) > 0)
    {
        return Err(ValidationError::MissingImputationTarget {
            column: column.clone(),
            missing: completed.missing_count(column),
        });
    }
    let imputed_values = loaded.data.predictors().iter().filter(|v| v.is_nan()).count();
    let mut cohort = ReferenceCohort::new(loaded.ids, loaded.data, completed)?;
    progress.on_stage_finish(ValidationStage::Imputation);
    log::info!(
        "Reference cohort: {} subjects, {} events, {} imputed values",
        cohort.len(),
        cohort.outcomes().sum(),
        imputed_values
    );

    progress.on_stage_start(ValidationStage::ReferenceFit, specs.len());
    let reference = reference_fit(fitter, &specs, &cohort)?;
    for (model, predictions) in reference.models.iter().zip(&reference.record.predictions) {
        if let Ok(p) = predictions {
            cohort.attach_predictions(&model.name, p.clone())?;
        }
    }
    let models: Vec<ModelValidation> = reference
        .models
        .iter()
        .zip(&specs)
        .map(|(model, spec)| ModelValidation::new(model, spec.formula(), &cohort, config))
        .collect();

    let paired: Vec<_> = specs.iter().zip(reference.models.iter()).collect();
    let mut comparison = compare_models(&paired);
    comparison.linearity = linearity_probes(
        fitter,
        &FittingSample::reference(&cohort),
        &config.linearity_predictors(),
        config.comparison.linearity_knots,
    );

    let curves: Vec<(&str, ndarray::ArrayView1<f64>)> = models
        .iter()
        .map(|m| (m.name.as_str(), ndarray::ArrayView1::from(&m.predictions[..])))
        .collect();
    let decision_curve = decision_curve(&curves, cohort.outcomes().view(), &config.net_benefit)?;
    progress.on_stage_finish(ValidationStage::ReferenceFit);

    let control = match config.deadline() {
        Some(budget) => control.with_deadline(Instant::now() + budget),
        None => control,
    };
    let bootstrap_config = config.bootstrap_config();
    let engine = BootstrapEngine {
        cohort: &cohort,
        specs: &specs,
        plan: &config.imputation,
        fitter,
        config: &bootstrap_config,
        control,
    };
    let stability = engine.run(&reference.record, progress)?;

    Ok(ValidationReport {
        subject_ids: cohort.ids().to_vec(),
        outcomes: cohort.outcomes().to_vec(),
        prevalence: cohort.completed().prevalence(),
        imputed_values,
        models,
        comparison,
        decision_curve,
        stability,
    })
}
