use std::fmt;

/// Phases of a validation run reported to an observer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ValidationStage {
    Imputation,
    ReferenceFit,
    Bootstrap,
}

impl ValidationStage {
    pub fn describe(self) -> &'static str {
        match self {
            Self::Imputation => "single-pass imputation",
            Self::ReferenceFit => "reference model fits",
            Self::Bootstrap => "bootstrap iterations",
        }
    }
}

impl fmt::Display for ValidationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// Observer for reporting incremental progress through a validation run.
///
/// Bootstrap iterations complete on worker threads, so every method takes
/// `&self` and implementations must be `Sync`.
pub trait BootstrapProgress: Sync {
    fn on_stage_start(&self, stage: ValidationStage, total: usize) {
        let _ = (stage, total);
    }
    fn on_iteration_complete(&self, iteration: usize) {
        let _ = iteration;
    }
    fn on_stage_finish(&self, stage: ValidationStage) {
        let _ = stage;
    }
}

#[derive(Default)]
pub struct NoopProgress;

impl BootstrapProgress for NoopProgress {}
