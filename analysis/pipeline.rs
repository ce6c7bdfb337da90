//! The two entry points of an analysis run.
//!
//! `run_repeated_measures` reads the feature table and catalog, fits every model and
//! writes the aggregated coefficient table. `identify_significant_interactions` reads
//! that table back, applies the stratified FDR correction and writes the significance
//! report plus the per-row corrected table. Each takes its configuration explicitly.

use std::path::PathBuf;

use thiserror::Error;

use crate::batch::{BatchError, BatchOptions, BatchSummary, fit_all};
use crate::catalog::{InputError, load_inputs};
use crate::config::{AnalysisPlan, ExperimentConfig, PlanError};
use crate::extract::{AggregatedResult, AggregatedRow};
use crate::fdr::{StratifiedCorrector, StratumFailure};
use crate::io::{OutputError, read_aggregated, write_aggregated, write_corrected, write_report};
use crate::mixed::{FactorSpec, MixedModelSolver, RemlSolver};

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Invalid analysis plan: {0}")]
    Plan(#[from] PlanError),

    #[error("Input error: {0}")]
    Input(#[from] InputError),

    #[error("Model fitting could not start: {0}")]
    Batch(#[from] BatchError),

    #[error("Output error: {0}")]
    Output(#[from] OutputError),

    #[error("FDR correction failed for {} stratum/strata: {}", .0.len(), describe_failures(.0))]
    StrataFailed(Vec<StratumFailure>),
}

fn describe_failures(failures: &[StratumFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{} / {} ({})", f.modality, f.term, f.error))
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FitStageSummary {
    pub batch: BatchSummary,
    pub rows_written: usize,
    pub output_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentifyStageSummary {
    pub rows_corrected: usize,
    pub significant_strata: usize,
    pub report_path: PathBuf,
    pub corrected_path: PathBuf,
}

/// Fits every (modality, feature) model with the built-in REML solver and writes the
/// aggregated coefficient table.
pub fn run_repeated_measures(
    config: &ExperimentConfig,
    plan: &AnalysisPlan,
    predictor: &str,
) -> Result<FitStageSummary, PipelineError> {
    let solver = RemlSolver::new(plan.solver.clone());
    run_repeated_measures_with(&solver, config, plan, predictor)
}

/// As [`run_repeated_measures`], with a caller-supplied solver.
pub fn run_repeated_measures_with<S: MixedModelSolver>(
    solver: &S,
    config: &ExperimentConfig,
    plan: &AnalysisPlan,
    predictor: &str,
) -> Result<FitStageSummary, PipelineError> {
    plan.validate()?;
    let predictor = plan.predictor_named(predictor);
    log::info!(
        "Repeated-measures analysis of wave {} (version {}, experiment {}), predictor '{}'",
        config.wave,
        config.version_name,
        config.experiment_number,
        predictor.column
    );

    let inputs = load_inputs(config, plan, &predictor)?;
    let outcomes = fit_all(
        solver,
        &plan.model,
        &predictor,
        &inputs,
        &BatchOptions::from(&plan.batch),
    )?;

    let whitelist = plan.whitelist(&predictor);
    let aggregated = AggregatedResult::from_outcomes(&outcomes, &whitelist);
    if aggregated.is_empty() {
        log::warn!("No model produced any effect of interest; the coefficient table will be empty.");
    }

    let output_path = config.coefficients_path();
    write_aggregated(&output_path, &aggregated)?;
    log::info!(
        "Repeated analysis complete for {}. Results saved to: {}",
        config.wave,
        output_path.display()
    );

    Ok(FitStageSummary {
        batch: BatchSummary::tally(&outcomes),
        rows_written: aggregated.len(),
        output_path,
    })
}

/// The predictor the coefficient table was fitted with, read from its interaction
/// terms (`<hemisphere contrast>:<column><level>` over the plan's predictor levels).
/// Falls back to the plan's predictor when no row carries such a term.
fn fitted_predictor(plan: &AnalysisPlan, rows: &[AggregatedRow]) -> FactorSpec {
    let prefixes: Vec<String> = plan
        .model
        .hemisphere
        .contrast_labels()
        .into_iter()
        .map(|label| format!("{label}:"))
        .collect();

    let mut columns: Vec<&str> = Vec::new();
    for row in rows {
        let Some(rest) = prefixes
            .iter()
            .find_map(|prefix| row.effect_name.strip_prefix(prefix.as_str()))
        else {
            continue;
        };
        let Some(column) = plan
            .predictor
            .levels
            .iter()
            .skip(1)
            .find_map(|level| rest.strip_suffix(level.as_str()))
        else {
            continue;
        };
        if !column.is_empty() && !columns.contains(&column) {
            columns.push(column);
        }
    }

    match columns.as_slice() {
        [] => plan.predictor.clone(),
        [column] => {
            if *column != plan.predictor.column {
                log::info!(
                    "The coefficient table was fitted with predictor '{column}' (plan names '{}'); correcting its terms.",
                    plan.predictor.column
                );
            }
            plan.predictor_named(column)
        }
        several => {
            let chosen = several
                .iter()
                .find(|c| **c == plan.predictor.column)
                .unwrap_or(&several[0]);
            log::warn!(
                "The coefficient table mixes predictors {}; correcting the terms of '{chosen}'.",
                several.join(", ")
            );
            plan.predictor_named(chosen)
        }
    }
}

/// Applies the stratified FDR correction to the aggregated table of a previous fit
/// stage and writes the significance report and the corrected table.
///
/// Both files are written even when some strata fail; the failures are then
/// returned as [`PipelineError::StrataFailed`].
pub fn identify_significant_interactions(
    config: &ExperimentConfig,
    plan: &AnalysisPlan,
) -> Result<IdentifyStageSummary, PipelineError> {
    plan.validate()?;
    let aggregated = read_aggregated(&config.coefficients_path())?;
    log::info!(
        "Loaded {} coefficient rows from {}",
        aggregated.len(),
        config.coefficients_path().display()
    );

    let predictor = fitted_predictor(plan, aggregated.rows());
    let whitelist = plan.whitelist(&predictor);
    let corrector = StratifiedCorrector::from_plan(plan, &whitelist);
    let outcome = corrector.correct(aggregated.rows());
    if !aggregated.is_empty() && outcome.corrected.is_empty() && outcome.failures.is_empty() {
        log::warn!(
            "None of the {} coefficient rows matches a correction term for predictor '{}'; the report will be empty.",
            aggregated.len(),
            predictor.column
        );
    }

    let report_path = config.report_path();
    let corrected_path = config.corrected_path();
    write_report(&report_path, &outcome.report)?;
    write_corrected(&corrected_path, &outcome.corrected)?;
    log::info!(
        "{} significant stratum/strata written to {}",
        outcome.report.n_strata(),
        report_path.display()
    );

    if !outcome.failures.is_empty() {
        return Err(PipelineError::StrataFailed(outcome.failures));
    }

    Ok(IdentifyStageSummary {
        rows_corrected: outcome.corrected.len(),
        significant_strata: outcome.report.n_strata(),
        report_path,
        corrected_path,
    })
}
