//! # Batch Model Fitter
//!
//! Fits one mixed model per (modality, feature) pair. Fits are independent and read
//! the shared, immutable feature table, so features within a modality are fitted on
//! a bounded rayon pool; results come back in declaration order regardless of which
//! worker finished first.
//!
//! Every pair produces exactly one [`FitOutcome`]. A solver error never escapes this
//! module: it becomes `FitOutcome::Failed` and the batch moves on.

use std::io::IsTerminal;
use std::time::{Duration, Instant};

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use rayon::prelude::*;
use thiserror::Error;

use crate::catalog::AnalysisInputs;
use crate::config::BatchPlan;
use crate::mixed::{FactorSpec, FeatureTable, FitError, MixedModelSolver, ModalityPlan, SolverFit, SpecTemplate};

#[derive(Error, Debug)]
pub enum BatchError {
    #[error("Failed to build the model-fitting thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

/// A successful fit, tagged with where it came from.
#[derive(Debug, Clone)]
pub struct FitResult {
    pub modality: String,
    pub feature: String,
    pub formula: String,
    pub fit: SolverFit,
}

impl FitResult {
    pub fn converged(&self) -> bool {
        self.fit.converged
    }
}

#[derive(Debug)]
pub struct FitFailure {
    pub modality: String,
    pub feature: String,
    pub error: FitError,
}

/// The three first-class results of a single model fit.
#[derive(Debug)]
pub enum FitOutcome {
    Converged(FitResult),
    /// The optimizer stopped short; the estimates are still used downstream.
    NotConverged(FitResult),
    Failed(FitFailure),
}

impl FitOutcome {
    /// The fitted coefficients, if the solver produced any.
    pub fn result(&self) -> Option<&FitResult> {
        match self {
            FitOutcome::Converged(result) | FitOutcome::NotConverged(result) => Some(result),
            FitOutcome::Failed(_) => None,
        }
    }

    pub fn modality(&self) -> &str {
        match self {
            FitOutcome::Converged(r) | FitOutcome::NotConverged(r) => &r.modality,
            FitOutcome::Failed(f) => &f.modality,
        }
    }

    pub fn feature(&self) -> &str {
        match self {
            FitOutcome::Converged(r) | FitOutcome::NotConverged(r) => &r.feature,
            FitOutcome::Failed(f) => &f.feature,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchOptions {
    pub threads: usize,
    pub fit_timeout: Option<Duration>,
}

impl From<&BatchPlan> for BatchOptions {
    fn from(plan: &BatchPlan) -> Self {
        Self {
            threads: plan.worker_threads(),
            fit_timeout: plan.fit_timeout(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub converged: usize,
    pub not_converged: usize,
    pub failed: usize,
}

impl BatchSummary {
    pub fn tally(outcomes: &[FitOutcome]) -> Self {
        outcomes.iter().fold(Self::default(), |mut acc, outcome| {
            match outcome {
                FitOutcome::Converged(_) => acc.converged += 1,
                FitOutcome::NotConverged(_) => acc.not_converged += 1,
                FitOutcome::Failed(_) => acc.failed += 1,
            }
            acc
        })
    }

    pub fn total(&self) -> usize {
        self.converged + self.not_converged + self.failed
    }
}

fn create_progress_bar(len: u64, message: &str) -> ProgressBar {
    let draw_target = if std::io::stderr().is_terminal() {
        ProgressDrawTarget::stderr_with_hz(20)
    } else {
        ProgressDrawTarget::hidden()
    };
    let pb = ProgressBar::with_draw_target(Some(len), draw_target);
    let style = ProgressStyle::with_template(
        "\n> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
    )
    .map(|style| style.progress_chars("█▉▊▋▌▍▎▏  "))
    .unwrap_or_else(|_| ProgressStyle::default_bar());
    pb.set_style(style);
    pb.set_message(message.to_string());
    pb
}

/// Fits every (modality, feature) pair of `inputs`, modality by modality in plan
/// order and feature by feature in catalog order.
pub fn fit_all<S: MixedModelSolver>(
    solver: &S,
    template: &SpecTemplate,
    predictor: &FactorSpec,
    inputs: &AnalysisInputs,
    options: &BatchOptions,
) -> Result<Vec<FitOutcome>, BatchError> {
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(options.threads.max(1))
        .build()?;
    log::info!(
        "Fitting {} models on {} worker thread(s).",
        inputs.total_features(),
        pool.current_num_threads()
    );

    let pb = create_progress_bar(inputs.total_features() as u64, "Fitting mixed models...");
    let mut outcomes = Vec::with_capacity(inputs.total_features());

    for entry in &inputs.work {
        log::info!("Fitting LMEs for: {}", entry.modality.name);
        let modality_outcomes: Vec<FitOutcome> = pool.install(|| {
            entry
                .features
                .par_iter()
                .map(|feature| {
                    let outcome = fit_one(
                        solver,
                        template,
                        predictor,
                        &entry.modality,
                        feature,
                        &inputs.table,
                        options.fit_timeout,
                    );
                    pb.inc(1);
                    outcome
                })
                .collect()
        });
        outcomes.extend(modality_outcomes);
    }
    pb.finish_and_clear();

    let summary = BatchSummary::tally(&outcomes);
    log::info!(
        "Batch complete: {} converged, {} not converged, {} failed.",
        summary.converged,
        summary.not_converged,
        summary.failed
    );
    Ok(outcomes)
}

/// Builds the specification for one pair, runs the solver and classifies the result.
pub fn fit_one<S: MixedModelSolver>(
    solver: &S,
    template: &SpecTemplate,
    predictor: &FactorSpec,
    modality: &ModalityPlan,
    feature: &str,
    table: &FeatureTable,
    fit_timeout: Option<Duration>,
) -> FitOutcome {
    let spec = template.build(modality, feature, predictor);
    let formula = spec.formula();
    log::info!("Fitting model for: {feature}");
    log::debug!("{formula}");

    let deadline = fit_timeout.map(|limit| Instant::now() + limit);
    match solver.fit(&spec, table, deadline) {
        Ok(fit) => {
            log::debug!(
                "{feature}: {} observations, REML criterion {:.4}, {} iterations, residual variance {:.4}",
                fit.n_obs,
                fit.reml_criterion,
                fit.iterations.map_or_else(|| "unknown".to_string(), |n| n.to_string()),
                fit.residual_variance
            );
            for component in &fit.variance_components {
                log::debug!(
                    "{feature}: variance of {} intercept {:.4}",
                    component.grouping,
                    component.variance
                );
            }
            let result = FitResult {
                modality: modality.name.clone(),
                feature: feature.to_string(),
                formula,
                fit,
            };
            if result.converged() {
                FitOutcome::Converged(result)
            } else {
                log::warn!(
                    "Model did not converge for {} in {}; its estimates are kept.",
                    feature,
                    modality.name
                );
                FitOutcome::NotConverged(result)
            }
        }
        Err(error) => {
            log::error!("Model failed for {} in {}: {}", feature, modality.name, error);
            FitOutcome::Failed(FitFailure {
                modality: modality.name.clone(),
                feature: feature.to_string(),
                error,
            })
        }
    }
}
