//! # Design Construction
//!
//! Turns a [`ModelSpecification`] and a [`FeatureTable`] into the numeric objects the
//! REML solver works on: the response vector, the fixed-effect design matrix with
//! R-compatible column names, and one level code per row for each random intercept.
//!
//! Factors use treatment coding against their first level. Only complete cases enter
//! the model: a row with a missing response, covariate or grouping level is dropped
//! for that model alone.

use ahash::AHashMap;
use ndarray::{Array1, Array2};
use thiserror::Error;

use super::data::{ColumnData, FactorColumn, FeatureTable};
use super::spec::{
    FactorSpec, FixedTerm, INTERCEPT_LABEL, ModelSpecification, factor_level_label,
    interaction_label,
};

#[derive(Error, Debug)]
pub enum DesignError {
    #[error("The model requires column '{0}', which is not present in the feature table.")]
    MissingColumn(String),

    #[error("Column '{0}' must be numeric to be used as a response.")]
    ExpectedNumeric(String),

    #[error("Grouping column '{0}' must be categorical.")]
    GroupingNotCategorical(String),

    #[error(
        "Factor '{0}' has fewer than two observed levels in the model's rows; contrasts cannot be formed."
    )]
    SingleLevelFactor(String),

    #[error("The reference level '{level}' of factor '{column}' does not occur in the model's rows.")]
    ReferenceLevelAbsent { column: String, level: String },

    #[error("Factor '{column}' has level '{level}' in the model's rows, which the model does not declare.")]
    UndeclaredLevel { column: String, level: String },

    #[error("No complete observations remain for response '{0}' after dropping missing values.")]
    NoCompleteRows(String),
}

/// Level codes of one random-intercept grouping over the rows used by a model.
#[derive(Debug, Clone)]
pub struct GroupingCodes {
    pub label: String,
    pub codes: Vec<usize>,
    pub n_levels: usize,
}

/// Numeric inputs for one model fit.
#[derive(Debug, Clone)]
pub struct DesignMatrices {
    pub y: Array1<f64>,
    pub x: Array2<f64>,
    pub column_names: Vec<String>,
    pub groupings: Vec<GroupingCodes>,
    /// Indices into the feature table of the rows that entered the model.
    pub rows_used: Vec<usize>,
    /// Declared contrast columns that had no observations and were left out.
    pub dropped_columns: Vec<String>,
}

impl DesignMatrices {
    pub fn n_obs(&self) -> usize {
        self.y.len()
    }

    pub fn n_coefficients(&self) -> usize {
        self.x.ncols()
    }
}

/// A fixed-effect variable expanded into its named design columns.
struct EncodedVariable {
    columns: Vec<(String, Array1<f64>)>,
}

pub fn build_design(
    spec: &ModelSpecification,
    table: &FeatureTable,
) -> Result<DesignMatrices, DesignError> {
    let required = spec.required_columns();
    for column in &required {
        if !table.has_column(column) {
            return Err(DesignError::MissingColumn(column.clone()));
        }
    }
    let response = table
        .numeric(&spec.response)
        .ok_or_else(|| DesignError::ExpectedNumeric(spec.response.clone()))?;
    for term in &spec.random_terms {
        for column in &term.columns {
            if table.factor(column).is_none() {
                return Err(DesignError::GroupingNotCategorical(column.clone()));
            }
        }
    }

    let rows_used = complete_rows(table, &required);
    if rows_used.is_empty() {
        return Err(DesignError::NoCompleteRows(spec.response.clone()));
    }
    let n = rows_used.len();

    let mut encoded: AHashMap<&str, EncodedVariable> = AHashMap::new();
    let mut dropped_columns = Vec::new();
    for term in &spec.fixed_terms {
        let names: Vec<&str> = match term {
            FixedTerm::Main(column) => vec![column.as_str()],
            FixedTerm::Interaction(a, b) => vec![a.as_str(), b.as_str()],
        };
        for name in names {
            if encoded.contains_key(name) {
                continue;
            }
            let declared = spec
                .declared_factors()
                .into_iter()
                .find(|factor| factor.column == name);
            let variable = encode_variable(name, table, &rows_used, declared, &mut dropped_columns)?;
            encoded.insert(name, variable);
        }
    }

    let mut column_names = vec![INTERCEPT_LABEL.to_string()];
    let mut columns = vec![Array1::ones(n)];
    for term in &spec.fixed_terms {
        match term {
            FixedTerm::Main(column) => {
                for (label, values) in &encoded[column.as_str()].columns {
                    column_names.push(label.clone());
                    columns.push(values.clone());
                }
            }
            FixedTerm::Interaction(a, b) => {
                // The left factor varies fastest, as in R's model.matrix.
                for (right_label, right_values) in &encoded[b.as_str()].columns {
                    for (left_label, left_values) in &encoded[a.as_str()].columns {
                        column_names.push(interaction_label(left_label, right_label));
                        columns.push(left_values * right_values);
                    }
                }
            }
        }
    }

    let mut x = Array2::zeros((n, columns.len()));
    for (j, values) in columns.iter().enumerate() {
        x.column_mut(j).assign(values);
    }

    let y = Array1::from_iter(rows_used.iter().map(|&row| response[row]));

    let groupings = spec
        .random_terms
        .iter()
        .map(|term| {
            let factors: Vec<&FactorColumn> = term
                .columns
                .iter()
                .filter_map(|column| table.factor(column))
                .collect();
            grouping_codes(&term.grouping_label(), &factors, &rows_used)
        })
        .collect();

    Ok(DesignMatrices {
        y,
        x,
        column_names,
        groupings,
        rows_used,
        dropped_columns,
    })
}

fn complete_rows(table: &FeatureTable, columns: &[String]) -> Vec<usize> {
    (0..table.n_rows())
        .filter(|&row| {
            columns.iter().all(|column| match table.column(column) {
                Some(ColumnData::Numeric(values)) => values[row].is_finite(),
                Some(ColumnData::Factor(factor)) => factor.codes()[row].is_some(),
                None => false,
            })
        })
        .collect()
}

fn encode_variable(
    name: &str,
    table: &FeatureTable,
    rows: &[usize],
    declared: Option<&FactorSpec>,
    dropped_columns: &mut Vec<String>,
) -> Result<EncodedVariable, DesignError> {
    let factor = match table.column(name) {
        Some(ColumnData::Numeric(values)) => {
            let column = Array1::from_iter(rows.iter().map(|&row| values[row]));
            return Ok(EncodedVariable {
                columns: vec![(name.to_string(), column)],
            });
        }
        Some(ColumnData::Factor(factor)) => factor,
        None => return Err(DesignError::MissingColumn(name.to_string())),
    };

    let mut observed = vec![false; factor.levels().len()];
    for &row in rows {
        if let Some(code) = factor.codes()[row] {
            observed[code as usize] = true;
        }
    }

    // Coding levels as indices into the table's level list, reference first.
    let coding: Vec<usize> = match declared {
        Some(spec) => {
            for (code, level) in factor.levels().iter().enumerate() {
                if observed[code] && !spec.levels.contains(level) {
                    return Err(DesignError::UndeclaredLevel {
                        column: name.to_string(),
                        level: level.clone(),
                    });
                }
            }
            let mut coding = Vec::with_capacity(spec.levels.len());
            for (position, level) in spec.levels.iter().enumerate() {
                let code = factor.levels().iter().position(|l| l == level);
                match code {
                    Some(code) if observed[code] => coding.push(code),
                    _ if position == 0 => {
                        return Err(DesignError::ReferenceLevelAbsent {
                            column: name.to_string(),
                            level: level.clone(),
                        });
                    }
                    _ => {
                        let label = factor_level_label(name, level);
                        log::warn!(
                            "Level '{level}' of '{name}' has no observations; dropping column {label}."
                        );
                        dropped_columns.push(label);
                    }
                }
            }
            coding
        }
        None => (0..factor.levels().len()).filter(|&code| observed[code]).collect(),
    };

    if declared.is_none() && coding.len() < 2 {
        return Err(DesignError::SingleLevelFactor(name.to_string()));
    }

    let columns = coding
        .iter()
        .skip(1)
        .map(|&code| {
            let label = factor_level_label(name, &factor.levels()[code]);
            let values = Array1::from_iter(rows.iter().map(|&row| {
                if factor.codes()[row] == Some(code as u32) {
                    1.0
                } else {
                    0.0
                }
            }));
            (label, values)
        })
        .collect();

    Ok(EncodedVariable { columns })
}

fn grouping_codes(label: &str, factors: &[&FactorColumn], rows: &[usize]) -> GroupingCodes {
    let mut index: AHashMap<Vec<u32>, usize> = AHashMap::new();
    let mut codes = Vec::with_capacity(rows.len());
    for &row in rows {
        // Complete-case filtering guarantees every grouping code is present.
        let key: Vec<u32> = factors
            .iter()
            .map(|factor| factor.codes()[row].unwrap_or(u32::MAX))
            .collect();
        let next = index.len();
        codes.push(*index.entry(key).or_insert(next));
    }
    GroupingCodes {
        label: label.to_string(),
        codes,
        n_levels: index.len(),
    }
}

/// Partitions rows into independent clusters: two rows share a cluster when they are
/// connected through a common level of any grouping. The marginal covariance of the
/// response is block diagonal over these clusters. Clusters are ordered by their
/// first row and list rows in ascending order.
pub fn partition_clusters(groupings: &[GroupingCodes], n: usize) -> Vec<Vec<usize>> {
    let mut parent: Vec<usize> = (0..n).collect();

    fn find(parent: &mut [usize], mut i: usize) -> usize {
        while parent[i] != i {
            parent[i] = parent[parent[i]];
            i = parent[i];
        }
        i
    }

    for grouping in groupings {
        let mut first_row: Vec<Option<usize>> = vec![None; grouping.n_levels];
        for (row, &code) in grouping.codes.iter().enumerate() {
            match first_row[code] {
                None => first_row[code] = Some(row),
                Some(anchor) => {
                    let a = find(&mut parent, anchor);
                    let b = find(&mut parent, row);
                    if a != b {
                        parent[a.max(b)] = a.min(b);
                    }
                }
            }
        }
    }

    let mut cluster_of_root: AHashMap<usize, usize> = AHashMap::new();
    let mut clusters: Vec<Vec<usize>> = Vec::new();
    for row in 0..n {
        let root = find(&mut parent, row);
        let next = clusters.len();
        let cluster = *cluster_of_root.entry(root).or_insert(next);
        if cluster == clusters.len() {
            clusters.push(Vec::new());
        }
        clusters[cluster].push(row);
    }
    clusters
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mixed::spec::{ModalityPlan, SpecTemplate};

    fn levels(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    fn small_table() -> FeatureTable {
        let n = 8;
        let mut table = FeatureTable::new(n);
        let hemis: Vec<Option<&str>> = (0..n)
            .map(|i| Some(if i % 2 == 0 { "Left" } else { "Right" }))
            .collect();
        table
            .insert_factor(
                "hemisphere",
                FactorColumn::from_declared("hemisphere", &hemis, &levels(&["Left", "Right"]))
                    .unwrap(),
            )
            .unwrap();
        let classes: Vec<Option<&str>> = ["0", "0", "1", "1", "0", "0", "1", "1"]
            .iter()
            .map(|s| Some(*s))
            .collect();
        table
            .insert_factor(
                "class_label",
                FactorColumn::from_declared("class_label", &classes, &levels(&["0", "1"]))
                    .unwrap(),
            )
            .unwrap();
        let subjects: Vec<Option<String>> = (0..n).map(|i| Some(format!("s{}", i / 2))).collect();
        table
            .insert_factor("src_subject_id", FactorColumn::from_observed(&subjects))
            .unwrap();
        let sites: Vec<Option<&str>> = (0..n).map(|_| Some("site01")).collect();
        table
            .insert_factor("site_id_l", FactorColumn::from_observed(&sites))
            .unwrap();
        let families: Vec<Option<String>> = (0..n).map(|i| Some(format!("f{}", i / 4))).collect();
        table
            .insert_factor("rel_family_id", FactorColumn::from_observed(&families))
            .unwrap();
        let sexes: Vec<Option<&str>> = ["1", "1", "2", "2", "1", "1", "2", "2"]
            .iter()
            .map(|s| Some(*s))
            .collect();
        table
            .insert_factor("sex", FactorColumn::from_observed(&sexes))
            .unwrap();
        table
            .insert_numeric("age", vec![9.0, 9.0, 10.0, 10.0, 11.0, 11.0, 9.5, 9.5])
            .unwrap();
        table
            .insert_numeric("icv", vec![1.0, 1.0, 1.1, 1.1, 0.9, 0.9, 1.2, 1.2])
            .unwrap();
        table
            .insert_numeric(
                "roiA",
                vec![1.0, 1.2, 1.4, f64::NAN, 0.8, 0.9, 1.3, 1.6],
            )
            .unwrap();
        table
    }

    fn small_spec() -> ModelSpecification {
        let template = SpecTemplate {
            base_covariates: vec!["age".into(), "sex".into()],
            ..SpecTemplate::default()
        };
        template.build(
            &ModalityPlan::new("bilateral_cortical_volume", "icv"),
            "roiA",
            &FactorSpec::new("class_label", &["0", "1"]),
        )
    }

    #[test]
    fn columns_follow_treatment_coding_and_formula_order() {
        let design = build_design(&small_spec(), &small_table()).unwrap();
        assert_eq!(
            design.column_names,
            vec![
                "(Intercept)",
                "hemisphereRight",
                "class_label1",
                "age",
                "sex2",
                "icv",
                "hemisphereRight:class_label1"
            ]
        );
    }

    #[test]
    fn incomplete_rows_are_dropped() {
        let design = build_design(&small_spec(), &small_table()).unwrap();
        assert_eq!(design.n_obs(), 7);
        assert!(!design.rows_used.contains(&3));
        // Only table row 7 is a complete right-hemisphere class-1 observation.
        assert_eq!(design.x.column(6).sum(), 1.0);
    }

    #[test]
    fn nested_grouping_uses_level_combinations() {
        let design = build_design(&small_spec(), &small_table()).unwrap();
        assert_eq!(design.groupings[0].label, "src_subject_id");
        assert_eq!(design.groupings[0].n_levels, 4);
        assert_eq!(design.groupings[1].label, "site_id_l:rel_family_id");
        assert_eq!(design.groupings[1].n_levels, 2);
    }

    #[test]
    fn clusters_follow_shared_grouping_levels() {
        let design = build_design(&small_spec(), &small_table()).unwrap();
        let clusters = partition_clusters(&design.groupings, design.n_obs());
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0], vec![0, 1, 2]);
        assert_eq!(clusters[1], vec![3, 4, 5, 6]);
    }

    #[test]
    fn unobserved_declared_level_is_dropped_with_record() {
        let template = SpecTemplate {
            base_covariates: vec!["age".into()],
            ..SpecTemplate::default()
        };
        let spec = template.build(
            &ModalityPlan::new("bilateral_cortical_volume", "icv"),
            "roiA",
            &FactorSpec::new("class_label", &["0", "1", "2"]),
        );
        let mut table = small_table();
        let classes: Vec<Option<&str>> = ["0", "0", "1", "1", "0", "0", "1", "1"]
            .iter()
            .map(|s| Some(*s))
            .collect();
        table
            .insert_factor(
                "class_label",
                FactorColumn::from_declared(
                    "class_label",
                    &classes,
                    &levels(&["0", "1", "2"]),
                )
                .unwrap(),
            )
            .unwrap();
        let design = build_design(&spec, &table).unwrap();
        assert_eq!(design.dropped_columns, vec!["class_label2"]);
        assert!(!design.column_names.iter().any(|c| c.contains("class_label2")));
    }

    #[test]
    fn missing_column_is_an_error() {
        let mut spec = small_spec();
        spec.response = "roiZ".into();
        let err = build_design(&spec, &small_table()).unwrap_err();
        assert!(matches!(err, DesignError::MissingColumn(ref c) if c == "roiZ"));
    }
}
