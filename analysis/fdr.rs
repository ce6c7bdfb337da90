//! # Stratified FDR Correction
//!
//! Benjamini–Hochberg correction applied independently inside each
//! (modality, effect term) stratum of the aggregated coefficient table. Which terms
//! form strata is a configuration choice: by default only the hemisphere-by-predictor
//! interaction terms are corrected, and main predictor contrasts are left out.
//!
//! A stratum whose p-values are malformed is never corrected and never reported as
//! significant. It is recorded as a [`StratumFailure`] and the other strata proceed.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{AnalysisPlan, CorrectionScope};
use crate::extract::AggregatedRow;
use crate::mixed::EffectWhitelist;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FdrError {
    #[error("p-value #{index} is {value}, which is not a probability in [0, 1].")]
    InvalidPValue { index: usize, value: f64 },

    #[error("The FDR level must lie strictly between 0 and 1; got {0}.")]
    InvalidAlpha(f64),
}

/// Benjamini–Hochberg output, aligned with the input p-values.
#[derive(Debug, Clone, PartialEq)]
pub struct BhAdjustment {
    pub q_values: Vec<f64>,
    pub significant: Vec<bool>,
}

/// Benjamini–Hochberg step-up procedure at level `alpha`.
///
/// Returns one q-value and one rejection flag per input p-value, in input order.
/// q-values are the running minimum of `p_(i) * n / i` taken from the largest p-value
/// down, capped at 1. The rejection set is every hypothesis ranked at or below the
/// largest `i` with `p_(i) <= alpha * i / n`. A single p-value is returned unchanged.
pub fn benjamini_hochberg(p_values: &[f64], alpha: f64) -> Result<BhAdjustment, FdrError> {
    if !(alpha > 0.0 && alpha < 1.0) {
        return Err(FdrError::InvalidAlpha(alpha));
    }
    if let Some((index, &value)) = p_values
        .iter()
        .enumerate()
        .find(|&(_, &p)| !(0.0..=1.0).contains(&p))
    {
        return Err(FdrError::InvalidPValue { index, value });
    }

    let n = p_values.len();
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| p_values[a].total_cmp(&p_values[b]));

    let mut q_values = vec![0.0; n];
    let mut running_min = 1.0_f64;
    for (rank0, &idx) in order.iter().enumerate().rev() {
        let rank = (rank0 + 1) as f64;
        running_min = running_min.min(p_values[idx] * n as f64 / rank);
        q_values[idx] = running_min;
    }

    let cutoff = order
        .iter()
        .enumerate()
        .filter(|&(rank0, &idx)| p_values[idx] <= alpha * (rank0 + 1) as f64 / n as f64)
        .map(|(rank0, _)| rank0)
        .max();
    let mut significant = vec![false; n];
    if let Some(cutoff) = cutoff {
        for &idx in &order[..=cutoff] {
            significant[idx] = true;
        }
    }

    Ok(BhAdjustment {
        q_values,
        significant,
    })
}

/// modality → effect term → significant features, in table order.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SignificanceReport {
    strata: BTreeMap<String, BTreeMap<String, Vec<String>>>,
}

impl SignificanceReport {
    pub fn insert(&mut self, modality: &str, term: &str, features: Vec<String>) {
        self.strata
            .entry(modality.to_string())
            .or_default()
            .insert(term.to_string(), features);
    }

    pub fn features(&self, modality: &str, term: &str) -> Option<&[String]> {
        self.strata
            .get(modality)
            .and_then(|terms| terms.get(term))
            .map(Vec::as_slice)
    }

    pub fn contains_modality(&self, modality: &str) -> bool {
        self.strata.contains_key(modality)
    }

    pub fn is_empty(&self) -> bool {
        self.strata.is_empty()
    }

    /// Number of (modality, term) strata with at least one significant feature.
    pub fn n_strata(&self) -> usize {
        self.strata.values().map(BTreeMap::len).sum()
    }
}

/// One corrected row of the aggregated table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrectedRow {
    pub modality: String,
    pub effect_name: String,
    pub feature: String,
    pub p_value: f64,
    pub q_value: f64,
    pub significant: bool,
}

pub const CORRECTED_COLUMNS: [&str; 6] = [
    "modality",
    "effect_name",
    "feature",
    "p_value",
    "q_value",
    "significant",
];

#[derive(Debug, Clone, PartialEq)]
pub struct StratumFailure {
    pub modality: String,
    pub term: String,
    pub error: FdrError,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct CorrectionOutcome {
    pub report: SignificanceReport,
    pub corrected: Vec<CorrectedRow>,
    pub failures: Vec<StratumFailure>,
}

/// Partitions aggregated rows into (modality, term) strata and corrects each.
#[derive(Debug, Clone, PartialEq)]
pub struct StratifiedCorrector {
    terms: Vec<String>,
    alpha: f64,
}

impl StratifiedCorrector {
    pub fn new(terms: Vec<String>, alpha: f64) -> Self {
        Self { terms, alpha }
    }

    /// The strata terms implied by the plan's correction scope.
    pub fn from_plan(plan: &AnalysisPlan, whitelist: &EffectWhitelist) -> Self {
        let mut terms = whitelist.interactions().to_vec();
        if plan.correction.scope == CorrectionScope::InteractionsAndMainEffects {
            terms.extend(whitelist.main_effects().iter().cloned());
        }
        Self::new(terms, plan.correction.alpha)
    }

    pub fn terms(&self) -> &[String] {
        &self.terms
    }

    /// Modalities are visited in order of first appearance, terms in configured
    /// order; rows for terms outside the configuration are not corrected.
    pub fn correct(&self, rows: &[AggregatedRow]) -> CorrectionOutcome {
        let mut modalities: Vec<&str> = Vec::new();
        for row in rows {
            if !modalities.contains(&row.modality.as_str()) {
                modalities.push(&row.modality);
            }
        }

        let mut outcome = CorrectionOutcome::default();
        for modality in modalities {
            for term in &self.terms {
                let stratum: Vec<&AggregatedRow> = rows
                    .iter()
                    .filter(|r| r.modality == modality && &r.effect_name == term)
                    .collect();
                if stratum.is_empty() {
                    continue;
                }
                let p_values: Vec<f64> = stratum.iter().map(|r| r.p_value).collect();
                let adjustment = match benjamini_hochberg(&p_values, self.alpha) {
                    Ok(adjustment) => adjustment,
                    Err(error) => {
                        log::error!("FDR correction failed for {modality} / {term}: {error}");
                        outcome.failures.push(StratumFailure {
                            modality: modality.to_string(),
                            term: term.clone(),
                            error,
                        });
                        continue;
                    }
                };

                let mut significant_features = Vec::new();
                for (i, row) in stratum.iter().enumerate() {
                    if adjustment.significant[i] {
                        significant_features.push(row.feature.clone());
                    }
                    outcome.corrected.push(CorrectedRow {
                        modality: modality.to_string(),
                        effect_name: term.clone(),
                        feature: row.feature.clone(),
                        p_value: row.p_value,
                        q_value: adjustment.q_values[i],
                        significant: adjustment.significant[i],
                    });
                }

                if !significant_features.is_empty() {
                    log::info!(
                        "{modality} / {term}: {} of {} features significant at FDR {}",
                        significant_features.len(),
                        stratum.len(),
                        self.alpha
                    );
                    outcome.report.insert(modality, term, significant_features);
                }
            }
        }
        outcome
    }
}
