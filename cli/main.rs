#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

use clap::{Args, CommandFactory, Parser, Subcommand};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process;

use hemitraj::config::{DEFAULT_PREDICTOR, DEFAULT_WAVE};
use hemitraj::pipeline::{identify_significant_interactions, run_repeated_measures};
use hemitraj::{AnalysisPlan, ExperimentConfig};

#[derive(Parser)]
#[command(
    name = "hemitraj",
    about = "Repeated-measures hemisphere-by-class trajectory analysis of neuroimaging features",
    long_about = "Fits one linear mixed-effects model per imaging feature with a hemisphere by \
                 class-label interaction, subject and site/family random intercepts, and applies \
                 Benjamini-Hochberg correction within each modality and interaction term."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Args, Debug, Clone)]
struct ExperimentArgs {
    /// Root of the data store holding one directory per analysis version
    #[arg(long, value_name = "DIR")]
    data_root: PathBuf,

    /// Analysis version (directory name under the data root)
    #[arg(long, value_name = "NAME")]
    analysis_version: String,

    /// Experiment number; outputs go to <version>/exp_<N>
    #[arg(long, value_name = "N", default_value_t = 1)]
    experiment: u32,

    /// Wave identifier used in input and output file names
    #[arg(long, default_value = DEFAULT_WAVE)]
    wave: String,

    /// TOML analysis plan; built-in defaults are used for anything it omits
    #[arg(long, value_name = "PATH")]
    plan: Option<PathBuf>,
}

impl ExperimentArgs {
    fn config(&self) -> ExperimentConfig {
        ExperimentConfig::new(
            &self.data_root,
            &self.analysis_version,
            self.experiment,
            &self.wave,
        )
    }

    fn load_plan(&self) -> Result<AnalysisPlan, Box<dyn std::error::Error>> {
        match &self.plan {
            Some(path) => {
                log::info!("Loading analysis plan from '{}'", path.display());
                Ok(AnalysisPlan::load(path)?)
            }
            None => Ok(AnalysisPlan::default()),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Fit every (modality, feature) model and write the aggregated coefficient table
    #[command(about = "Fit repeated-measures mixed models")]
    Fit {
        #[command(flatten)]
        experiment: ExperimentArgs,

        /// Categorical predictor crossed with hemisphere
        #[arg(long, default_value = DEFAULT_PREDICTOR)]
        predictor: String,

        /// Worker threads for model fitting (default: all cores)
        #[arg(long, value_name = "N")]
        threads: Option<usize>,
    },

    /// Apply stratified FDR correction to a fitted coefficient table
    #[command(about = "Identify significant hemisphere interactions")]
    Identify {
        #[command(flatten)]
        experiment: ExperimentArgs,
    },

    /// Fit all models, then identify significant interactions
    #[command(about = "Run both stages")]
    Run {
        #[command(flatten)]
        experiment: ExperimentArgs,

        /// Categorical predictor crossed with hemisphere
        #[arg(long, default_value = DEFAULT_PREDICTOR)]
        predictor: String,

        /// Worker threads for model fitting (default: all cores)
        #[arg(long, value_name = "N")]
        threads: Option<usize>,
    },

    /// Write the built-in analysis plan as an editable TOML file
    #[command(about = "Write the default analysis plan")]
    Plan {
        #[arg(value_name = "OUTPUT")]
        output: PathBuf,
    },
}

/// Copies every log record to stderr and to the experiment log file.
struct TeeWriter {
    file: File,
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::stderr().write_all(buf)?;
        self.file.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()?;
        self.file.flush()
    }
}

fn init_logging(log_path: Option<&Path>) {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    builder.format_timestamp_secs();

    let mut open_error = None;
    if let Some(path) = log_path {
        let opened = path
            .parent()
            .map_or(Ok(()), fs::create_dir_all)
            .and_then(|_| File::options().create(true).append(true).open(path));
        match opened {
            Ok(file) => {
                builder.target(env_logger::Target::Pipe(Box::new(TeeWriter { file })));
            }
            Err(e) => open_error = Some((path.to_path_buf(), e)),
        }
    }
    builder.init();

    if let Some((path, e)) = open_error {
        log::warn!(
            "Could not open log file '{}' ({e}); logging to stderr only.",
            path.display()
        );
    }
}

fn with_threads(mut plan: AnalysisPlan, threads: Option<usize>) -> AnalysisPlan {
    if threads.is_some() {
        plan.batch.threads = threads;
    }
    plan
}

fn run_fit(
    experiment: ExperimentArgs,
    predictor: String,
    threads: Option<usize>,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = experiment.config();
    let plan = with_threads(experiment.load_plan()?, threads);
    let summary = run_repeated_measures(&config, &plan, &predictor)?;
    log::info!(
        "{} of {} models fitted ({} without convergence); {} coefficient rows written.",
        summary.batch.converged + summary.batch.not_converged,
        summary.batch.total(),
        summary.batch.not_converged,
        summary.rows_written
    );
    Ok(())
}

fn run_identify(experiment: ExperimentArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = experiment.config();
    let plan = experiment.load_plan()?;
    let summary = identify_significant_interactions(&config, &plan)?;
    log::info!(
        "{} rows corrected; report saved to {}, corrected table to {}",
        summary.rows_corrected,
        summary.report_path.display(),
        summary.corrected_path.display()
    );
    Ok(())
}

fn run_both(
    experiment: ExperimentArgs,
    predictor: String,
    threads: Option<usize>,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = experiment.config();
    let mut plan = with_threads(experiment.load_plan()?, threads);
    plan.predictor = plan.predictor_named(&predictor);
    run_repeated_measures(&config, &plan, &predictor)?;
    let summary = identify_significant_interactions(&config, &plan)?;
    log::info!(
        "Analysis complete: {} significant stratum/strata in {}",
        summary.significant_strata,
        summary.report_path.display()
    );
    Ok(())
}

fn write_default_plan(output: &Path) -> Result<(), Box<dyn std::error::Error>> {
    AnalysisPlan::default().save(output)?;
    println!("Default analysis plan written to: {}", output.display());
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    let Cli { command } = cli;

    let log_path = match &command {
        Some(Commands::Fit { experiment, .. })
        | Some(Commands::Identify { experiment })
        | Some(Commands::Run { experiment, .. }) => Some(experiment.config().log_path()),
        _ => None,
    };
    init_logging(log_path.as_deref());

    let result = match command {
        Some(Commands::Fit {
            experiment,
            predictor,
            threads,
        }) => run_fit(experiment, predictor, threads),
        Some(Commands::Identify { experiment }) => run_identify(experiment),
        Some(Commands::Run {
            experiment,
            predictor,
            threads,
        }) => run_both(experiment, predictor, threads),
        Some(Commands::Plan { output }) => write_default_plan(&output),
        None => {
            let _ = Cli::command().print_help();
            println!();
            Ok(())
        }
    };

    if let Err(e) = result {
        log::error!("Error: {e}");
        process::exit(1);
    }
}
