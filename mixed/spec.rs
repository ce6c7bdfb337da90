//! # Model Specification
//!
//! Builds the complete, explicit description of one repeated-measures model: the
//! response feature, the fixed-effect terms (hemisphere crossed with the predictor,
//! the base covariates and the modality's adjustment covariate) and the two random
//! intercepts (subject, and family nested within site).
//!
//! The specification is the single source of truth for coefficient names. The design
//! builder names its columns with [`factor_level_label`] and [`interaction_label`],
//! and the effect whitelist is derived from the same declared factor levels, so the
//! names the extractor filters on can never drift from the names the solver emits.

use itertools::Itertools;
use serde::{Deserialize, Serialize};

/// Name of the intercept coefficient in every fitted effect table.
pub const INTERCEPT_LABEL: &str = "(Intercept)";

/// A categorical variable with a declared level set. The first level is the reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactorSpec {
    pub column: String,
    pub levels: Vec<String>,
}

impl FactorSpec {
    pub fn new(column: &str, levels: &[&str]) -> Self {
        Self {
            column: column.to_string(),
            levels: levels.iter().map(|l| l.to_string()).collect(),
        }
    }

    /// Coefficient labels of the non-reference levels under treatment coding.
    pub fn contrast_labels(&self) -> Vec<String> {
        self.levels
            .iter()
            .skip(1)
            .map(|level| factor_level_label(&self.column, level))
            .collect()
    }
}

/// A modality and the global measure its models adjust for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModalityPlan {
    pub name: String,
    pub adjustment_covariate: String,
}

impl ModalityPlan {
    pub fn new(name: &str, adjustment_covariate: &str) -> Self {
        Self {
            name: name.to_string(),
            adjustment_covariate: adjustment_covariate.to_string(),
        }
    }
}

/// One fixed-effect term of the model formula.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FixedTerm {
    Main(String),
    Interaction(String, String),
}

/// A random intercept for the grouping formed by one or more columns. Several
/// columns form a nested grouping whose levels are the observed combinations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RandomIntercept {
    pub columns: Vec<String>,
}

impl RandomIntercept {
    /// The grouping expression as written inside `(1|...)`.
    pub fn grouping_label(&self) -> String {
        self.columns.join(":")
    }
}

/// The fixed parts shared by every model in an analysis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpecTemplate {
    pub base_covariates: Vec<String>,
    pub hemisphere: FactorSpec,
    pub subject_column: String,
    pub nesting_columns: Vec<String>,
}

impl Default for SpecTemplate {
    fn default() -> Self {
        Self {
            base_covariates: [
                "interview_age",
                "age2",
                "demo_sex_v2",
                "img_device_label",
                "demo_comb_income_v2",
                "BMI_zscore",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            hemisphere: FactorSpec::new("hemisphere", &["Left", "Right"]),
            subject_column: "src_subject_id".to_string(),
            nesting_columns: vec!["site_id_l".to_string(), "rel_family_id".to_string()],
        }
    }
}

impl SpecTemplate {
    /// Builds the specification for one (modality, feature) pair. Pure and
    /// deterministic: identical inputs give identical specifications.
    pub fn build(
        &self,
        modality: &ModalityPlan,
        feature: &str,
        predictor: &FactorSpec,
    ) -> ModelSpecification {
        let mut fixed_terms = Vec::with_capacity(self.base_covariates.len() + 4);
        fixed_terms.push(FixedTerm::Main(self.hemisphere.column.clone()));
        fixed_terms.push(FixedTerm::Main(predictor.column.clone()));
        fixed_terms.extend(
            self.base_covariates
                .iter()
                .map(|covariate| FixedTerm::Main(covariate.clone())),
        );
        fixed_terms.push(FixedTerm::Main(modality.adjustment_covariate.clone()));
        fixed_terms.push(FixedTerm::Interaction(
            self.hemisphere.column.clone(),
            predictor.column.clone(),
        ));

        let random_terms = vec![
            RandomIntercept {
                columns: vec![self.subject_column.clone()],
            },
            RandomIntercept {
                columns: self.nesting_columns.clone(),
            },
        ];

        ModelSpecification {
            response: feature.to_string(),
            modality: modality.name.clone(),
            hemisphere: self.hemisphere.clone(),
            predictor: predictor.clone(),
            covariates: self
                .base_covariates
                .iter()
                .cloned()
                .chain(std::iter::once(modality.adjustment_covariate.clone()))
                .collect(),
            fixed_terms,
            random_terms,
        }
    }
}

/// The complete description of one mixed model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpecification {
    pub response: String,
    pub modality: String,
    pub hemisphere: FactorSpec,
    pub predictor: FactorSpec,
    /// Adjustment covariates in formula order (base list, then the modality's measure).
    pub covariates: Vec<String>,
    /// Fixed terms in coefficient order: main effects first, then interactions.
    pub fixed_terms: Vec<FixedTerm>,
    pub random_terms: Vec<RandomIntercept>,
}

impl ModelSpecification {
    /// Renders the model as an lme4-style formula.
    pub fn formula(&self) -> String {
        let random = self
            .random_terms
            .iter()
            .map(|term| format!("(1|{})", term.grouping_label()))
            .join(" + ");
        format!(
            "{} ~ {} * {} + {} + {}",
            self.response,
            self.hemisphere.column,
            self.predictor.column,
            self.covariates.join(" + "),
            random
        )
    }

    /// Factors whose levels are fixed by the specification rather than the data.
    pub fn declared_factors(&self) -> [&FactorSpec; 2] {
        [&self.hemisphere, &self.predictor]
    }

    /// Every column the model reads, without duplicates.
    pub fn required_columns(&self) -> Vec<String> {
        let mut columns = vec![self.response.clone()];
        for term in &self.fixed_terms {
            match term {
                FixedTerm::Main(column) => columns.push(column.clone()),
                FixedTerm::Interaction(a, b) => {
                    columns.push(a.clone());
                    columns.push(b.clone());
                }
            }
        }
        for term in &self.random_terms {
            columns.extend(term.columns.iter().cloned());
        }
        columns.into_iter().unique().collect()
    }

    pub fn effects_of_interest(&self) -> EffectWhitelist {
        EffectWhitelist::from_factors(&self.hemisphere, &self.predictor)
    }
}

/// Whether a whitelisted effect is a main predictor contrast or a
/// hemisphere-by-predictor interaction contrast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EffectKind {
    Main,
    Interaction,
}

/// The effect names kept from every fit, derived from declared factor levels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectWhitelist {
    main_effects: Vec<String>,
    interactions: Vec<String>,
}

impl EffectWhitelist {
    /// Main effects are the predictor's non-reference levels; interactions cross the
    /// hemisphere's non-reference levels with them.
    pub fn from_factors(hemisphere: &FactorSpec, predictor: &FactorSpec) -> Self {
        let main_effects = predictor.contrast_labels();
        let interactions = predictor
            .contrast_labels()
            .iter()
            .flat_map(|predictor_label| {
                hemisphere
                    .contrast_labels()
                    .into_iter()
                    .map(move |hemi_label| interaction_label(&hemi_label, predictor_label))
            })
            .collect();
        Self {
            main_effects,
            interactions,
        }
    }

    pub fn main_effects(&self) -> &[String] {
        &self.main_effects
    }

    pub fn interactions(&self) -> &[String] {
        &self.interactions
    }

    pub fn kind_of(&self, effect_name: &str) -> Option<EffectKind> {
        if self.main_effects.iter().any(|e| e == effect_name) {
            Some(EffectKind::Main)
        } else if self.interactions.iter().any(|e| e == effect_name) {
            Some(EffectKind::Interaction)
        } else {
            None
        }
    }

    pub fn contains(&self, effect_name: &str) -> bool {
        self.kind_of(effect_name).is_some()
    }

    pub fn len(&self) -> usize {
        self.main_effects.len() + self.interactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Coefficient label of a factor level under treatment coding, e.g. `class_label1`.
pub fn factor_level_label(column: &str, level: &str) -> String {
    format!("{column}{level}")
}

/// Coefficient label of an interaction column, e.g. `hemisphereRight:class_label1`.
pub fn interaction_label(left: &str, right: &str) -> String {
    format!("{left}:{right}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn class_label() -> FactorSpec {
        FactorSpec::new("class_label", &["0", "1", "2", "3"])
    }

    #[test]
    fn formula_matches_lme4_layout() {
        let template = SpecTemplate::default();
        let modality = ModalityPlan::new("bilateral_cortical_volume", "smri_vol_scs_intracranialv");
        let spec = template.build(&modality, "roiA", &class_label());
        assert_eq!(
            spec.formula(),
            "roiA ~ hemisphere * class_label + interview_age + age2 + demo_sex_v2 + \
             img_device_label + demo_comb_income_v2 + BMI_zscore + smri_vol_scs_intracranialv + \
             (1|src_subject_id) + (1|site_id_l:rel_family_id)"
        );
    }

    #[test]
    fn modality_adjustment_is_appended_after_base_covariates() {
        let template = SpecTemplate::default();
        let modality = ModalityPlan::new("bilateral_cortical_thickness", "smri_thick_cdk_mean");
        let spec = template.build(&modality, "roiB", &class_label());
        assert_eq!(spec.covariates.last().unwrap(), "smri_thick_cdk_mean");
        assert_eq!(spec.covariates.len(), 7);
        assert_eq!(
            spec.fixed_terms.last().unwrap(),
            &FixedTerm::Interaction("hemisphere".into(), "class_label".into())
        );
    }

    #[test]
    fn build_is_reproducible() {
        let template = SpecTemplate::default();
        let modality = ModalityPlan::new("bilateral_tract_FA", "FA_all_dti_atlas_tract_fibers");
        let first = template.build(&modality, "fa_tract", &class_label());
        let second = template.build(&modality, "fa_tract", &class_label());
        assert_eq!(first, second);
    }

    #[test]
    fn whitelist_is_derived_from_declared_levels() {
        let whitelist = EffectWhitelist::from_factors(
            &FactorSpec::new("hemisphere", &["Left", "Right"]),
            &class_label(),
        );
        assert_eq!(
            whitelist.main_effects(),
            &["class_label1", "class_label2", "class_label3"]
        );
        assert_eq!(
            whitelist.interactions(),
            &[
                "hemisphereRight:class_label1",
                "hemisphereRight:class_label2",
                "hemisphereRight:class_label3"
            ]
        );
        assert_eq!(whitelist.kind_of("class_label2"), Some(EffectKind::Main));
        assert_eq!(whitelist.kind_of("Class_label2"), None);
        assert_eq!(whitelist.len(), 6);
    }

    #[test]
    fn required_columns_cover_grouping_and_are_unique() {
        let template = SpecTemplate::default();
        let modality = ModalityPlan::new("bilateral_subcortical_volume", "smri_vol_scs_intracranialv");
        let spec = template.build(&modality, "roiC", &class_label());
        let columns = spec.required_columns();
        assert_eq!(columns[0], "roiC");
        assert!(columns.contains(&"rel_family_id".to_string()));
        assert_eq!(columns.iter().filter(|c| *c == "hemisphere").count(), 1);
    }
}
