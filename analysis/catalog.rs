//! # Feature Catalog Loader
//!
//! Resolves the two inputs of a run: the rectangular feature table for one wave and
//! the modality → feature-list catalog. Both are validated against the analysis plan
//! before any model is fitted, so every problem with the inputs surfaces as one fatal
//! [`InputError`] instead of as hundreds of failed fits.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use ahash::AHashSet;
use itertools::Itertools;
use polars::prelude::*;
use thiserror::Error;

use crate::config::{AnalysisPlan, ExperimentConfig};
use crate::mixed::{DataError, FactorSpec, FeatureTable, ModalityPlan};

#[derive(Error, Debug)]
pub enum InputError {
    #[error("The feature table '{0}' does not exist. Was the data-preparation step run for this wave?")]
    FeatureTableNotFound(PathBuf),

    #[error("The feature catalog '{0}' does not exist.")]
    CatalogNotFound(PathBuf),

    #[error("IO error while reading inputs: {0}")]
    IoError(#[from] std::io::Error),

    #[error("The feature catalog '{path}' is not a mapping of modality names to feature lists: {source}")]
    CatalogParse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Error from the underlying Polars DataFrame library: {0}")]
    PolarsError(#[from] PolarsError),

    #[error("The feature table could not be converted: {0}")]
    Data(#[from] DataError),

    #[error("The catalog has no feature list for modality '{0}', which the analysis plan declares.")]
    MissingModality(String),

    #[error("Feature '{feature}' of modality '{modality}' is not a column of the feature table.")]
    FeatureNotInTable { modality: String, feature: String },

    #[error("The feature table lacks the model column(s) {0:?}.")]
    MissingColumns(Vec<String>),
}

/// Modality name → ordered feature names, as delivered by data preparation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FeatureCatalog {
    modalities: BTreeMap<String, Vec<String>>,
}

/// The features of one declared modality, in catalog order and without repeats.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModalityFeatures {
    pub modality: ModalityPlan,
    pub features: Vec<String>,
}

/// Everything the batch fitter consumes: the typed table and the ordered work list.
#[derive(Debug, Clone)]
pub struct AnalysisInputs {
    pub table: FeatureTable,
    pub work: Vec<ModalityFeatures>,
}

impl AnalysisInputs {
    pub fn total_features(&self) -> usize {
        self.work.iter().map(|m| m.features.len()).sum()
    }
}

impl FeatureCatalog {
    pub fn new(modalities: BTreeMap<String, Vec<String>>) -> Self {
        Self { modalities }
    }

    pub fn load(path: &Path) -> Result<Self, InputError> {
        if !path.exists() {
            return Err(InputError::CatalogNotFound(path.to_path_buf()));
        }
        let text = fs::read_to_string(path)?;
        let modalities = serde_json::from_str(&text).map_err(|source| InputError::CatalogParse {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self { modalities })
    }

    pub fn features(&self, modality: &str) -> Option<&[String]> {
        self.modalities.get(modality).map(Vec::as_slice)
    }

    /// Orders the catalog by the plan's declared modalities. A declared modality
    /// without a catalog entry is fatal; catalog entries the plan does not declare are
    /// ignored.
    pub fn resolve(&self, modalities: &[ModalityPlan]) -> Result<Vec<ModalityFeatures>, InputError> {
        for name in self.modalities.keys() {
            if !modalities.iter().any(|m| &m.name == name) {
                log::warn!("Catalog modality '{name}' is not declared in the analysis plan and will be skipped.");
            }
        }

        modalities
            .iter()
            .map(|modality| {
                let listed = self
                    .features(&modality.name)
                    .ok_or_else(|| InputError::MissingModality(modality.name.clone()))?;
                let features: Vec<String> = listed.iter().unique().cloned().collect();
                if features.len() < listed.len() {
                    log::warn!(
                        "Modality '{}' lists {} duplicate feature name(s); each feature is fitted once.",
                        modality.name,
                        listed.len() - features.len()
                    );
                }
                if features.is_empty() {
                    log::warn!("Modality '{}' has an empty feature list.", modality.name);
                }
                Ok(ModalityFeatures {
                    modality: modality.clone(),
                    features,
                })
            })
            .collect()
    }
}

/// Loads and validates the catalog and the feature table of one run.
pub fn load_inputs(
    config: &ExperimentConfig,
    plan: &AnalysisPlan,
    predictor: &FactorSpec,
) -> Result<AnalysisInputs, InputError> {
    let catalog = FeatureCatalog::load(&config.catalog_path())?;
    let work = catalog.resolve(&plan.modalities)?;
    let table = load_feature_table(&config.features_path(), plan, predictor, &work)?;
    Ok(AnalysisInputs { table, work })
}

/// Reads the feature table CSV and keeps only the columns some model reads.
pub fn load_feature_table(
    path: &Path,
    plan: &AnalysisPlan,
    predictor: &FactorSpec,
    work: &[ModalityFeatures],
) -> Result<FeatureTable, InputError> {
    if !path.exists() {
        return Err(InputError::FeatureTableNotFound(path.to_path_buf()));
    }
    log::info!("Loading feature table from '{}'", path.display());

    let df = CsvReader::new(File::open(path)?)
        .with_options(
            CsvReadOptions::default()
                .with_has_header(true)
                .with_infer_schema_length(None),
        )
        .finish()?;

    let present: AHashSet<String> = df
        .get_column_names()
        .into_iter()
        .map(|s| s.to_string())
        .collect();

    for entry in work {
        if let Some(feature) = entry.features.iter().find(|f| !present.contains(*f)) {
            return Err(InputError::FeatureNotInTable {
                modality: entry.modality.name.clone(),
                feature: feature.clone(),
            });
        }
    }

    let model = &plan.model;
    let grouping: Vec<&String> = std::iter::once(&model.subject_column)
        .chain(model.nesting_columns.iter())
        .collect();
    let mut covariates: Vec<&String> = model.base_covariates.iter().collect();
    covariates.extend(work.iter().map(|m| &m.modality.adjustment_covariate));

    // Factors: the two declared factors, the grouping columns, and whichever
    // configured categorical covariates the models use.
    let categorical: Vec<String> = [&model.hemisphere.column, &predictor.column]
        .into_iter()
        .chain(grouping.iter().copied())
        .chain(
            covariates
                .iter()
                .copied()
                .filter(|c| plan.categorical_columns.contains(*c)),
        )
        .unique()
        .cloned()
        .collect();
    let numeric: Vec<String> = covariates
        .iter()
        .copied()
        .filter(|c| !categorical.contains(*c))
        .chain(work.iter().flat_map(|m| m.features.iter()))
        .unique()
        .cloned()
        .collect();

    let missing: Vec<String> = categorical
        .iter()
        .chain(numeric.iter())
        .filter(|c| !present.contains(*c))
        .cloned()
        .collect();
    if !missing.is_empty() {
        return Err(InputError::MissingColumns(missing));
    }

    let declared = plan.declared_factors(predictor);
    let table = FeatureTable::from_dataframe(&df, &categorical, &declared, &numeric)?;
    log::info!(
        "Loaded {} observations; {} factor and {} numeric columns are in use.",
        table.n_rows(),
        categorical.len(),
        numeric.len()
    );
    Ok(table)
}
