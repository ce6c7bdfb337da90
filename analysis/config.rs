//! # Configuration
//!
//! Two explicit configuration objects are passed into every entry point; nothing in
//! the crate holds path or version state of its own.
//!
//! - [`ExperimentConfig`] names one run (data-store root, analysis version,
//!   experiment number, wave) and derives every input and output path from it.
//! - [`AnalysisPlan`] is the declared constant table of the analysis: modalities and
//!   their adjustment covariates, the covariate template, the predictor's levels, the
//!   FDR policy and the numerical settings. It is serialized as TOML, and a plan file
//!   only needs to name the fields it changes.

use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::mixed::{EffectWhitelist, FactorSpec, ModalityPlan, SolverSettings, SpecTemplate};

pub const DEFAULT_WAVE: &str = "baseline_year_1_arm_1";
pub const DEFAULT_PREDICTOR: &str = "class_label";

/// Identifies one analysis run and resolves its file layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExperimentConfig {
    pub data_root: PathBuf,
    pub version_name: String,
    pub experiment_number: u32,
    pub wave: String,
}

impl ExperimentConfig {
    pub fn new(data_root: impl Into<PathBuf>, version_name: &str, experiment_number: u32, wave: &str) -> Self {
        Self {
            data_root: data_root.into(),
            version_name: version_name.to_string(),
            experiment_number,
            wave: wave.to_string(),
        }
    }

    pub fn version_dir(&self) -> PathBuf {
        self.data_root.join(&self.version_name)
    }

    pub fn processed_data_dir(&self) -> PathBuf {
        self.version_dir().join("processed_data")
    }

    pub fn features_path(&self) -> PathBuf {
        self.processed_data_dir().join(format!(
            "mri_all_features_with_traj_long_rescaled-{}.csv",
            self.wave
        ))
    }

    pub fn catalog_path(&self) -> PathBuf {
        self.processed_data_dir().join("features_of_interest.json")
    }

    pub fn experiment_dir(&self) -> PathBuf {
        self.version_dir().join(format!("exp_{}", self.experiment_number))
    }

    pub fn results_dir(&self) -> PathBuf {
        self.experiment_dir().join("results")
    }

    pub fn log_path(&self) -> PathBuf {
        self.experiment_dir().join("experiment.log")
    }

    /// Output 1: the aggregated coefficient table.
    pub fn coefficients_path(&self) -> PathBuf {
        self.results_dir()
            .join(format!("repeated_bilateral_traj_results-{}.csv", self.wave))
    }

    /// Output 2: the nested significance report.
    pub fn report_path(&self) -> PathBuf {
        self.results_dir()
            .join(format!("sig_interaction_terms-{}.json", self.wave))
    }

    /// Output 3: q-values and significance flags of every corrected row.
    pub fn corrected_path(&self) -> PathBuf {
        self.results_dir()
            .join(format!("fdr_corrected_terms-{}.csv", self.wave))
    }
}

/// Which whitelisted effects enter the FDR correction stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CorrectionScope {
    /// Only hemisphere-by-predictor interaction terms are corrected and reported.
    #[default]
    InteractionsOnly,
    /// Main predictor contrasts are corrected as strata of their own as well.
    InteractionsAndMainEffects,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrectionPlan {
    pub alpha: f64,
    pub scope: CorrectionScope,
}

impl Default for CorrectionPlan {
    fn default() -> Self {
        Self {
            alpha: 0.05,
            scope: CorrectionScope::InteractionsOnly,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct BatchPlan {
    /// Worker threads for model fitting; all available cores when unset.
    pub threads: Option<usize>,
    /// Wall-clock limit per model fit; a fit that exceeds it is skipped.
    pub fit_timeout_secs: Option<u64>,
}

impl BatchPlan {
    pub fn worker_threads(&self) -> usize {
        self.threads.unwrap_or_else(num_cpus::get).max(1)
    }

    pub fn fit_timeout(&self) -> Option<Duration> {
        self.fit_timeout_secs.map(Duration::from_secs)
    }
}

#[derive(Error, Debug)]
pub enum PlanError {
    #[error("Failed to read or write plan file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML plan file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize plan to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("The plan declares no modalities.")]
    NoModalities,
    #[error("Modality '{0}' is declared more than once.")]
    DuplicateModality(String),
    #[error("Factor '{0}' needs at least two declared levels.")]
    TooFewLevels(String),
    #[error("The FDR level must lie strictly between 0 and 1; got {0}.")]
    InvalidAlpha(f64),
}

/// The declared constant table of an analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisPlan {
    pub categorical_columns: Vec<String>,
    pub modalities: Vec<ModalityPlan>,
    pub model: SpecTemplate,
    pub predictor: FactorSpec,
    pub correction: CorrectionPlan,
    pub solver: SolverSettings,
    pub batch: BatchPlan,
}

impl Default for AnalysisPlan {
    fn default() -> Self {
        Self {
            categorical_columns: [
                "src_subject_id",
                "class_label",
                "demo_sex_v2",
                "img_device_label",
                "hemisphere",
                "site_id_l",
                "rel_family_id",
                "demo_comb_income_v2",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            modalities: vec![
                ModalityPlan::new("bilateral_cortical_thickness", "smri_thick_cdk_mean"),
                ModalityPlan::new("bilateral_cortical_volume", "smri_vol_scs_intracranialv"),
                ModalityPlan::new("bilateral_cortical_surface_area", "smri_area_cdk_total"),
                ModalityPlan::new("bilateral_subcortical_volume", "smri_vol_scs_intracranialv"),
                ModalityPlan::new("bilateral_tract_FA", "FA_all_dti_atlas_tract_fibers"),
                ModalityPlan::new("bilateral_tract_MD", "MD_all_dti_atlas_tract_fibers"),
            ],
            model: SpecTemplate::default(),
            predictor: FactorSpec::new(DEFAULT_PREDICTOR, &["0", "1", "2", "3"]),
            correction: CorrectionPlan::default(),
            solver: SolverSettings::default(),
            batch: BatchPlan::default(),
        }
    }
}

impl AnalysisPlan {
    /// Loads a plan from a TOML file; fields the file omits keep their defaults.
    pub fn load(path: &Path) -> Result<Self, PlanError> {
        let toml_string = fs::read_to_string(path)?;
        let plan: Self = toml::from_str(&toml_string)?;
        plan.validate()?;
        Ok(plan)
    }

    pub fn save(&self, path: &Path) -> Result<(), PlanError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), PlanError> {
        if self.modalities.is_empty() {
            return Err(PlanError::NoModalities);
        }
        for (i, modality) in self.modalities.iter().enumerate() {
            if self.modalities[..i].iter().any(|m| m.name == modality.name) {
                return Err(PlanError::DuplicateModality(modality.name.clone()));
            }
        }
        for factor in [&self.model.hemisphere, &self.predictor] {
            if factor.levels.len() < 2 {
                return Err(PlanError::TooFewLevels(factor.column.clone()));
            }
        }
        let alpha = self.correction.alpha;
        if !(alpha > 0.0 && alpha < 1.0) {
            return Err(PlanError::InvalidAlpha(alpha));
        }
        Ok(())
    }

    /// The predictor factor under a (possibly overridden) column name.
    pub fn predictor_named(&self, column: &str) -> FactorSpec {
        FactorSpec {
            column: column.to_string(),
            levels: self.predictor.levels.clone(),
        }
    }

    /// Factor columns whose levels are fixed by the plan rather than the data.
    pub fn declared_factors(&self, predictor: &FactorSpec) -> Vec<(String, Vec<String>)> {
        vec![
            (
                self.model.hemisphere.column.clone(),
                self.model.hemisphere.levels.clone(),
            ),
            (predictor.column.clone(), predictor.levels.clone()),
        ]
    }

    pub fn whitelist(&self, predictor: &FactorSpec) -> EffectWhitelist {
        EffectWhitelist::from_factors(&self.model.hemisphere, predictor)
    }
}
