//! # Effect Extractor & Aggregator
//!
//! Reduces each fitted effect table to the whitelisted predictor effects and
//! concatenates them into one long-format table: one row per (modality, feature,
//! effect), in fit order, carrying the fit's convergence flag alongside.

use serde::{Deserialize, Serialize};

use crate::batch::{FitOutcome, FitResult};
use crate::mixed::EffectWhitelist;

/// One whitelisted coefficient of one fitted model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedRow {
    pub effect_name: String,
    pub estimate: f64,
    pub ci_lower: f64,
    pub ci_upper: f64,
    pub std_error: f64,
    pub df: f64,
    pub t_stat: f64,
    pub p_value: f64,
    pub converged: bool,
    pub modality: String,
    pub feature: String,
}

/// Column order of the persisted aggregated table.
pub const AGGREGATED_COLUMNS: [&str; 11] = [
    "effect_name",
    "estimate",
    "ci_lower",
    "ci_upper",
    "std_error",
    "df",
    "t_stat",
    "p_value",
    "converged",
    "modality",
    "feature",
];

/// Keeps the whitelisted rows of one fit's effect table, in effect-table order.
/// A fit with none of the whitelisted names yields no rows.
pub fn extract(result: &FitResult, whitelist: &EffectWhitelist) -> Vec<AggregatedRow> {
    result
        .fit
        .coefficients
        .iter()
        .filter(|c| whitelist.contains(&c.name))
        .map(|c| AggregatedRow {
            effect_name: c.name.clone(),
            estimate: c.estimate,
            ci_lower: c.ci_lower,
            ci_upper: c.ci_upper,
            std_error: c.std_error,
            df: c.df,
            t_stat: c.t_stat,
            p_value: c.p_value,
            converged: result.converged(),
            modality: result.modality.clone(),
            feature: result.feature.clone(),
        })
        .collect()
}

/// The concatenation of every fit's whitelisted rows. Immutable once built.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AggregatedResult {
    rows: Vec<AggregatedRow>,
}

impl AggregatedResult {
    pub fn from_rows(rows: Vec<AggregatedRow>) -> Self {
        Self { rows }
    }

    /// Aggregates a batch in outcome order; failed fits contribute nothing.
    pub fn from_outcomes(outcomes: &[FitOutcome], whitelist: &EffectWhitelist) -> Self {
        let mut rows = Vec::with_capacity(outcomes.len() * whitelist.len());
        for result in outcomes.iter().filter_map(FitOutcome::result) {
            let extracted = extract(result, whitelist);
            if extracted.is_empty() {
                log::warn!(
                    "The fit of {} in {} reported none of the effects of interest.",
                    result.feature,
                    result.modality
                );
            }
            rows.extend(extracted);
        }
        Self { rows }
    }

    pub fn rows(&self) -> &[AggregatedRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}
