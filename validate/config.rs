//! The TOML run configuration and its validation.
//!
//! Every check happens here, before any data is touched, so a run never fails
//! on a configuration mistake after minutes of bootstrapping.

use crate::basis::{MAX_SPLINE_KNOTS, MIN_SPLINE_KNOTS};
use crate::bootstrap::BootstrapConfig;
use crate::calibration::CalibrationOptions;
use crate::impute::{ImputationPlan, ImputationTarget};
use crate::irls::IrlsOptions;
use crate::model::{ModelSpec, Term};
use crate::net_benefit::{NetBenefitError, ThresholdGrid};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML configuration: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize configuration to TOML: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("No models are configured; at least one [[models]] entry is required.")]
    NoModels,
    #[error("Model '{0}' has no terms.")]
    EmptyModel(String),
    #[error("Model name '{0}' is used more than once.")]
    DuplicateModel(String),
    #[error("Model '{model}' uses '{predictor}', which is not listed in data.predictors.")]
    UnknownPredictor { model: String, predictor: String },
    #[error("Model '{model}' asks for a {knots}-knot spline; 3 to 7 knots are supported.")]
    UnsupportedKnots { model: String, knots: usize },
    #[error("Imputation target or auxiliary '{0}' is neither a predictor nor the outcome.")]
    UnknownImputationColumn(String),
    #[error("The outcome '{0}' cannot be an imputation target.")]
    OutcomeImputationTarget(String),
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
    #[error("Invalid net-benefit threshold grid: {0}")]
    NetBenefit(#[from] NetBenefitError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataConfig {
    #[serde(default = "default_id_column")]
    pub id_column: String,
    pub outcome: String,
    pub predictors: Vec<String>,
}

fn default_id_column() -> String {
    "id".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapSection {
    /// Total iterations, counting the reference fit.
    pub iterations: usize,
    pub seed: u64,
    pub threads: Option<usize>,
    pub iteration_timeout_secs: Option<f64>,
    /// Wall-clock budget for the whole bootstrap.
    pub deadline_secs: Option<f64>,
    pub max_failure_rate: f64,
}

impl Default for BootstrapSection {
    fn default() -> Self {
        let defaults = BootstrapConfig::default();
        Self {
            iterations: defaults.iterations,
            seed: defaults.seed,
            threads: None,
            iteration_timeout_secs: None,
            deadline_secs: None,
            max_failure_rate: defaults.max_failure_rate,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComparisonSection {
    /// Knots of the spline each linear predictor is tested against.
    pub linearity_knots: usize,
    /// Predictors to probe; empty means every predictor used by a model.
    pub linearity_predictors: Vec<String>,
}

impl Default for ComparisonSection {
    fn default() -> Self {
        Self {
            linearity_knots: 3,
            linearity_predictors: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TermConfig {
    pub predictor: String,
    /// Restricted cubic spline with this many knots; linear when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spline_knots: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub name: String,
    pub terms: Vec<TermConfig>,
}

/// The complete run configuration as written in `validation.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationConfig {
    pub data: DataConfig,
    #[serde(default)]
    pub bootstrap: BootstrapSection,
    #[serde(default)]
    pub imputation: ImputationPlan,
    #[serde(default)]
    pub calibration: CalibrationOptions,
    #[serde(default)]
    pub net_benefit: ThresholdGrid,
    #[serde(default)]
    pub comparison: ComparisonSection,
    #[serde(default)]
    pub fitter: IrlsOptions,
    pub models: Vec<ModelConfig>,
}

impl ValidationConfig {
    /// Loads and validates a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        let config = Self::from_toml(&text)?;
        log::info!(
            "Loaded configuration from '{}': {} models, B = {}",
            path.display(),
            config.models.len(),
            config.bootstrap.iterations
        );
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let predictors: HashSet<&str> = self.data.predictors.iter().map(String::as_str).collect();

        if self.models.is_empty() {
            return Err(ConfigError::NoModels);
        }
        let mut names = HashSet::new();
        for model in &self.models {
            if !names.insert(model.name.as_str()) {
                return Err(ConfigError::DuplicateModel(model.name.clone()));
            }
            if model.terms.is_empty() {
                return Err(ConfigError::EmptyModel(model.name.clone()));
            }
            for term in &model.terms {
                if !predictors.contains(term.predictor.as_str()) {
                    return Err(ConfigError::UnknownPredictor {
                        model: model.name.clone(),
                        predictor: term.predictor.clone(),
                    });
                }
                if let Some(knots) = term.spline_knots {
                    if !(MIN_SPLINE_KNOTS..=MAX_SPLINE_KNOTS).contains(&knots) {
                        return Err(ConfigError::UnsupportedKnots {
                            model: model.name.clone(),
                            knots,
                        });
                    }
                }
            }
        }

        for target in &self.imputation.targets {
            if target.column == self.data.outcome {
                return Err(ConfigError::OutcomeImputationTarget(target.column.clone()));
            }
            for column in std::iter::once(&target.column).chain(&target.auxiliaries) {
                if *column != self.data.outcome && !predictors.contains(column.as_str()) {
                    return Err(ConfigError::UnknownImputationColumn(column.clone()));
                }
            }
        }
        if self.imputation.donors == 0 {
            return Err(invalid("imputation.donors", "must be at least 1"));
        }
        if !(self.imputation.max_missing_fraction >= 0.0
            && self.imputation.max_missing_fraction <= 1.0)
        {
            return Err(invalid("imputation.max_missing_fraction", "must lie in [0, 1]"));
        }

        let bootstrap = &self.bootstrap;
        if bootstrap.iterations < 2 {
            return Err(invalid(
                "bootstrap.iterations",
                "must be at least 2 (the reference fit plus one resample)",
            ));
        }
        if bootstrap.threads == Some(0) {
            return Err(invalid("bootstrap.threads", "must be at least 1 when set"));
        }
        if !(bootstrap.max_failure_rate >= 0.0 && bootstrap.max_failure_rate <= 1.0) {
            return Err(invalid("bootstrap.max_failure_rate", "must lie in [0, 1]"));
        }
        for (field, value) in [
            ("bootstrap.iteration_timeout_secs", bootstrap.iteration_timeout_secs),
            ("bootstrap.deadline_secs", bootstrap.deadline_secs),
        ] {
            if value.is_some_and(|secs| !(secs.is_finite() && secs > 0.0)) {
                return Err(invalid(field, "must be a positive number of seconds"));
            }
        }

        if !(self.calibration.span > 0.0 && self.calibration.span <= 1.0) {
            return Err(invalid("calibration.span", "must lie in (0, 1]"));
        }
        if self.calibration.grid_points < 2 {
            return Err(invalid("calibration.grid_points", "must be at least 2"));
        }
        if !(MIN_SPLINE_KNOTS..=MAX_SPLINE_KNOTS).contains(&self.comparison.linearity_knots) {
            return Err(invalid("comparison.linearity_knots", "must be between 3 and 7"));
        }
        for predictor in &self.comparison.linearity_predictors {
            if !predictors.contains(predictor.as_str()) {
                return Err(ConfigError::UnknownPredictor {
                    model: "linearity probe".to_string(),
                    predictor: predictor.clone(),
                });
            }
        }
        if self.fitter.max_iterations == 0 || !(self.fitter.tolerance > 0.0) {
            return Err(invalid(
                "fitter",
                "max_iterations and tolerance must be positive",
            ));
        }

        self.net_benefit.validate()?;
        Ok(())
    }

    pub fn model_specs(&self) -> Vec<ModelSpec> {
        self.models
            .iter()
            .map(|model| {
                let terms = model
                    .terms
                    .iter()
                    .map(|term| match term.spline_knots {
                        Some(knots) => Term::spline(term.predictor.clone(), knots),
                        None => Term::linear(term.predictor.clone()),
                    })
                    .collect();
                ModelSpec::new(model.name.clone(), terms)
            })
            .collect()
    }

    pub fn bootstrap_config(&self) -> BootstrapConfig {
        BootstrapConfig {
            iterations: self.bootstrap.iterations,
            seed: self.bootstrap.seed,
            threads: self.bootstrap.threads,
            iteration_timeout: self.bootstrap.iteration_timeout_secs.map(Duration::from_secs_f64),
            max_failure_rate: self.bootstrap.max_failure_rate,
            curve_span: self.calibration.span,
            curve_points: self.calibration.grid_points,
        }
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.bootstrap.deadline_secs.map(Duration::from_secs_f64)
    }

    /// Predictors probed for nonlinearity: the configured list, or every
    /// predictor that enters some model, in first-use order.
    pub fn linearity_predictors(&self) -> Vec<String> {
        if !self.comparison.linearity_predictors.is_empty() {
            return self.comparison.linearity_predictors.clone();
        }
        let mut seen = HashSet::new();
        self.models
            .iter()
            .flat_map(|m| m.terms.iter())
            .filter(|t| seen.insert(t.predictor.clone()))
            .map(|t| t.predictor.clone())
            .collect()
    }

    /// An example configuration with every section filled in.
    pub fn example() -> Self {
        Self {
            data: DataConfig {
                id_column: default_id_column(),
                outcome: "death_90d".to_string(),
                predictors: vec!["score".to_string(), "age".to_string()],
            },
            bootstrap: BootstrapSection::default(),
            imputation: ImputationPlan {
                targets: vec![ImputationTarget {
                    column: "age".to_string(),
                    auxiliaries: vec!["score".to_string(), "death_90d".to_string()],
                }],
                ..ImputationPlan::default()
            },
            calibration: CalibrationOptions::default(),
            net_benefit: ThresholdGrid::default(),
            comparison: ComparisonSection::default(),
            fitter: IrlsOptions::default(),
            models: vec![
                ModelConfig {
                    name: "score alone".to_string(),
                    terms: vec![TermConfig {
                        predictor: "score".to_string(),
                        spline_knots: None,
                    }],
                },
                ModelConfig {
                    name: "rcs(score) + age".to_string(),
                    terms: vec![
                        TermConfig {
                            predictor: "score".to_string(),
                            spline_knots: Some(5),
                        },
                        TermConfig {
                            predictor: "age".to_string(),
                            spline_knots: None,
                        },
                    ],
                },
            ],
        }
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field,
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{IrlsFitter, Transform};
    use crate::net_benefit::ThresholdPolicy;

    const MINIMAL: &str = r#"
[data]
outcome = "death_90d"
predictors = ["score", "age"]

[[models]]
name = "score alone"
terms = [{ predictor = "score" }]
"#;

    #[test]
    fn minimal_configuration_takes_defaults() {
        let config = ValidationConfig::from_toml(MINIMAL).unwrap();
        assert_eq!(config.data.id_column, "id");
        assert_eq!(config.bootstrap.iterations, 200);
        assert_eq!(config.imputation.donors, 5);
        assert_eq!(config.net_benefit.upper_bound, 0.99);
        assert_eq!(config.comparison.linearity_knots, 3);
        assert_eq!(config.linearity_predictors(), vec!["score"]);
        assert_eq!(config.bootstrap_config().curve_points, 50);
    }

    #[test]
    fn full_configuration_round_trips() {
        let example = ValidationConfig::example();
        let text = example.to_toml().unwrap();
        let parsed = ValidationConfig::from_toml(&text).unwrap();
        assert_eq!(parsed, example);
        let specs = parsed.model_specs();
        assert_eq!(
            specs[1].terms[0].transform,
            Transform::RestrictedSpline { knots: 5 }
        );
    }

    #[test]
    fn sections_parse_from_handwritten_toml() {
        let text = format!(
            "{MINIMAL}
[bootstrap]
iterations = 50
seed = 2024
threads = 2
iteration_timeout_secs = 10.0

[net_benefit]
max = 0.999
step = 0.001
policy = \"clip\"

[[imputation.targets]]
column = \"age\"
auxiliaries = [\"score\", \"death_90d\"]
"
        );
        let config = ValidationConfig::from_toml(&text).unwrap();
        assert_eq!(config.bootstrap.seed, 2024);
        assert_eq!(config.net_benefit.policy, ThresholdPolicy::Clip);
        assert_eq!(config.imputation.targets.len(), 1);
        assert_eq!(
            config.bootstrap_config().iteration_timeout,
            Some(Duration::from_secs(10))
        );
    }

    #[test]
    fn fitter_options_are_handed_to_the_fitter() {
        let text = format!("{MINIMAL}\n[fitter]\nmax_iterations = 40\n");
        let config = ValidationConfig::from_toml(&text).unwrap();
        let fitter = IrlsFitter::new(config.fitter);
        assert_eq!(fitter.options.max_iterations, 40);
        assert_eq!(fitter.options, config.fitter);
        assert_eq!(fitter.options.tolerance, IrlsOptions::default().tolerance);
    }

    #[test]
    fn invalid_configurations_are_rejected_before_any_work() {
        let unknown = MINIMAL.replace("{ predictor = \"score\" }", "{ predictor = \"bmi\" }");
        assert!(matches!(
            ValidationConfig::from_toml(&unknown),
            Err(ConfigError::UnknownPredictor { .. })
        ));

        let knots = MINIMAL.replace(
            "{ predictor = \"score\" }",
            "{ predictor = \"score\", spline_knots = 9 }",
        );
        assert!(matches!(
            ValidationConfig::from_toml(&knots),
            Err(ConfigError::UnsupportedKnots { knots: 9, .. })
        ));

        let grid = format!("{MINIMAL}\n[net_benefit]\nstep = -0.1\n");
        assert!(matches!(
            ValidationConfig::from_toml(&grid),
            Err(ConfigError::NetBenefit(NetBenefitError::NonPositiveStep(_)))
        ));

        let unbounded = format!("{MINIMAL}\n[net_benefit]\nmax = inf\n");
        assert!(matches!(
            ValidationConfig::from_toml(&unbounded),
            Err(ConfigError::NetBenefit(NetBenefitError::NonFiniteBound { name: "max", .. }))
        ));

        let iterations = format!("{MINIMAL}\n[bootstrap]\niterations = 1\n");
        assert!(matches!(
            ValidationConfig::from_toml(&iterations),
            Err(ConfigError::InvalidValue {
                field: "bootstrap.iterations",
                ..
            })
        ));

        let no_models = "models = []\n[data]\noutcome = \"y\"\npredictors = [\"x\"]\n";
        assert!(matches!(
            ValidationConfig::from_toml(no_models),
            Err(ConfigError::NoModels)
        ));
    }
}
