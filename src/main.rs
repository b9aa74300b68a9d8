#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

use clap::{Args, CommandFactory, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::io::IsTerminal;
use std::path::PathBuf;
use std::process;
use std::sync::Mutex;
use std::time::Instant;

use riskval::bootstrap::RunControl;
use riskval::config::ValidationConfig;
use riskval::data::load_cohort;
use riskval::model::IrlsFitter;
use riskval::pipeline::{ValidationError, run_validation};
use riskval::progress::{BootstrapProgress, ValidationStage};
use riskval::report::write_report;

#[derive(Parser)]
#[command(
    name = "riskval",
    version,
    about = "Bootstrap validation and prediction instability for clinical risk scores",
    long_about = "Fits one or more logistic risk models on a cohort, evaluates discrimination, \
                 calibration and net benefit on the reference fit, and measures how much each \
                 subject's predicted risk moves across bootstrap refits."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Args)]
struct ValidateArgs {
    /// Tab-separated cohort table with an id column, predictors and a 0/1 outcome
    cohort: PathBuf,

    /// Run configuration in TOML
    #[arg(long, value_name = "TOML")]
    config: PathBuf,

    /// Directory the report tables are written into
    #[arg(long, default_value = "validation_report")]
    out: PathBuf,

    /// Override the number of bootstrap iterations (including the reference fit)
    #[arg(long)]
    iterations: Option<usize>,

    /// Override the master seed
    #[arg(long)]
    seed: Option<u64>,

    /// Worker threads for the bootstrap
    #[arg(long)]
    threads: Option<usize>,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the configured models on a cohort
    Validate(ValidateArgs),
    /// Print a starting configuration to adapt
    ExampleConfig {
        /// Write to this file instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

fn create_progress_bar(len: u64, message: &str) -> ProgressBar {
    let draw_target = if std::io::stderr().is_terminal() {
        ProgressDrawTarget::stderr_with_hz(20)
    } else {
        ProgressDrawTarget::hidden()
    };

    let pb = ProgressBar::with_draw_target(Some(len), draw_target);
    if let Ok(style) = ProgressStyle::with_template(
        "\n> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
    ) {
        pb.set_style(style.progress_chars("█▉▊▋▌▍▎▏  "));
    }
    pb.set_message(message.to_string());
    pb
}

/// Draws a bar for the bootstrap stage and logs the others.
#[derive(Default)]
struct TerminalProgress {
    bar: Mutex<Option<ProgressBar>>,
}

impl BootstrapProgress for TerminalProgress {
    fn on_stage_start(&self, stage: ValidationStage, total: usize) {
        if stage == ValidationStage::Bootstrap {
            if let Ok(mut slot) = self.bar.lock() {
                *slot = Some(create_progress_bar(total as u64, "resampled fits"));
            }
        } else {
            log::info!("Starting {stage}");
        }
    }

    fn on_iteration_complete(&self, iteration: usize) {
        if let Ok(slot) = self.bar.lock() {
            if let Some(bar) = slot.as_ref() {
                bar.inc(1);
                log::trace!("Iteration {iteration} done");
            }
        }
    }

    fn on_stage_finish(&self, stage: ValidationStage) {
        if let Ok(mut slot) = self.bar.lock() {
            if let Some(bar) = slot.take() {
                bar.finish_and_clear();
            }
        }
        log::debug!("Finished {stage}");
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let Cli { command } = cli;

    let result: Result<(), Box<dyn std::error::Error>> = match command {
        Some(Commands::Validate(args)) => validate(args).map_err(|e| e.into()),
        Some(Commands::ExampleConfig { output }) => example_config(output),
        None => {
            if let Err(e) = Cli::command().print_help() {
                eprintln!("Error: {e}");
            }
            println!();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn validate(args: ValidateArgs) -> Result<(), ValidationError> {
    let start_time = Instant::now();
    let mut config = ValidationConfig::load(&args.config)?;
    if let Some(iterations) = args.iterations {
        config.bootstrap.iterations = iterations;
    }
    if let Some(seed) = args.seed {
        config.bootstrap.seed = seed;
    }
    if args.threads.is_some() {
        config.bootstrap.threads = args.threads;
    }

    let loaded = load_cohort(
        &args.cohort,
        &config.data.id_column,
        &config.data.predictors,
        &config.data.outcome,
    )?;
    let fitter = IrlsFitter::new(config.fitter);
    let progress = TerminalProgress::default();
    let report = run_validation(&config, loaded, &fitter, RunControl::default(), &progress)?;

    let written = write_report(&report, &args.out)?;
    for path in &written {
        log::info!("Wrote {}", path.display());
    }
    eprintln!(
        "> Validated {} models on {} subjects in {:.1?}",
        report.models.len(),
        report.subject_ids.len(),
        start_time.elapsed()
    );
    Ok(())
}

fn example_config(output: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let text = ValidationConfig::example().to_toml()?;
    match output {
        Some(path) => {
            std::fs::write(&path, text)?;
            eprintln!("> Wrote example configuration to {}", path.display());
        }
        None => print!("{text}"),
    }
    Ok(())
}
