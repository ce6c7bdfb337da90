//! # Feature Table
//!
//! The typed, in-memory form of the subject-level feature table. Every column is
//! either numeric (missing values stored as `NaN`) or a factor with a fixed, finite
//! set of levels. The model solver never sees free text: categorical covariates are
//! converted into `FactorColumn`s once, when the table is loaded, so that every model
//! fitted against the table codes them identically.
//!
//! - Declared factors (hemisphere, the class-label predictor) carry their levels in
//!   declaration order; the first level is the reference. A value outside the
//!   declared set is an input error.
//! - Undeclared factors take their observed levels in sorted order, which matches how
//!   R builds factor levels from character data.

use ahash::AHashMap;
use ndarray::Array1;
use polars::prelude::*;
use thiserror::Error;

/// A comprehensive error type for converting tabular input into a `FeatureTable`.
#[derive(Error, Debug)]
pub enum DataError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    PolarsError(#[from] PolarsError),

    #[error(
        "The required column '{0}' was not found in the feature table. Please check spelling and case."
    )]
    ColumnNotFound(String),

    #[error(
        "The column '{column_name}' could not be converted to the expected type '{expected_type}'. (Found type: {found_type})"
    )]
    ColumnWrongType {
        column_name: String,
        expected_type: &'static str,
        found_type: String,
    },

    #[error("Column '{column_name}' has {found} rows, but the table has {expected}.")]
    LengthMismatch {
        column_name: String,
        expected: usize,
        found: usize,
    },

    #[error(
        "Column '{column_name}' contains the level '{level}', which is not among its declared levels {declared:?}."
    )]
    UndeclaredLevel {
        column_name: String,
        level: String,
        declared: Vec<String>,
    },

    #[error("Column '{0}' declares no levels; a factor needs at least one.")]
    EmptyLevelSet(String),
}

/// A categorical column: the ordered level set plus one level code per row.
#[derive(Debug, Clone, PartialEq)]
pub struct FactorColumn {
    levels: Vec<String>,
    codes: Vec<Option<u32>>,
}

impl FactorColumn {
    /// Builds a factor whose levels are the sorted distinct observed values.
    pub fn from_observed<S: AsRef<str>>(values: &[Option<S>]) -> Self {
        let mut levels: Vec<String> = values
            .iter()
            .flatten()
            .map(|v| v.as_ref().to_string())
            .collect();
        levels.sort_unstable();
        levels.dedup();
        let index: AHashMap<&str, u32> = levels
            .iter()
            .enumerate()
            .map(|(i, level)| (level.as_str(), i as u32))
            .collect();
        let codes = values
            .iter()
            .map(|v| v.as_ref().and_then(|s| index.get(s.as_ref()).copied()))
            .collect();
        Self { levels, codes }
    }

    /// Builds a factor against a declared level set. The first declared level is
    /// the reference level.
    pub fn from_declared<S: AsRef<str>>(
        column_name: &str,
        values: &[Option<S>],
        declared: &[String],
    ) -> Result<Self, DataError> {
        if declared.is_empty() {
            return Err(DataError::EmptyLevelSet(column_name.to_string()));
        }
        let index: AHashMap<&str, u32> = declared
            .iter()
            .enumerate()
            .map(|(i, level)| (level.as_str(), i as u32))
            .collect();
        let mut codes = Vec::with_capacity(values.len());
        for value in values {
            match value {
                None => codes.push(None),
                Some(raw) => match index.get(raw.as_ref()) {
                    Some(&code) => codes.push(Some(code)),
                    None => {
                        return Err(DataError::UndeclaredLevel {
                            column_name: column_name.to_string(),
                            level: raw.as_ref().to_string(),
                            declared: declared.to_vec(),
                        });
                    }
                },
            }
        }
        Ok(Self {
            levels: declared.to_vec(),
            codes,
        })
    }

    pub fn levels(&self) -> &[String] {
        &self.levels
    }

    pub fn codes(&self) -> &[Option<u32>] {
        &self.codes
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }
}

/// One column of the feature table.
#[derive(Debug, Clone)]
pub enum ColumnData {
    Numeric(Array1<f64>),
    Factor(FactorColumn),
}

/// A rectangular dataset, one row per (subject, hemisphere) observation.
#[derive(Debug, Clone)]
pub struct FeatureTable {
    n_rows: usize,
    columns: AHashMap<String, ColumnData>,
}

impl FeatureTable {
    pub fn new(n_rows: usize) -> Self {
        Self {
            n_rows,
            columns: AHashMap::new(),
        }
    }

    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.contains_key(name)
    }

    pub fn column(&self, name: &str) -> Option<&ColumnData> {
        self.columns.get(name)
    }

    pub fn numeric(&self, name: &str) -> Option<&Array1<f64>> {
        match self.columns.get(name) {
            Some(ColumnData::Numeric(values)) => Some(values),
            _ => None,
        }
    }

    pub fn factor(&self, name: &str) -> Option<&FactorColumn> {
        match self.columns.get(name) {
            Some(ColumnData::Factor(factor)) => Some(factor),
            _ => None,
        }
    }

    pub fn insert_numeric(&mut self, name: &str, values: Vec<f64>) -> Result<(), DataError> {
        self.check_length(name, values.len())?;
        self.columns
            .insert(name.to_string(), ColumnData::Numeric(Array1::from_vec(values)));
        Ok(())
    }

    pub fn insert_factor(&mut self, name: &str, factor: FactorColumn) -> Result<(), DataError> {
        self.check_length(name, factor.len())?;
        self.columns
            .insert(name.to_string(), ColumnData::Factor(factor));
        Ok(())
    }

    fn check_length(&self, name: &str, found: usize) -> Result<(), DataError> {
        if found != self.n_rows {
            return Err(DataError::LengthMismatch {
                column_name: name.to_string(),
                expected: self.n_rows,
                found,
            });
        }
        Ok(())
    }

    /// Converts a Polars `DataFrame` into a `FeatureTable`.
    ///
    /// `categorical` columns become factors (with `declared` level sets where one is
    /// given); `numeric` columns are cast to `f64` with nulls mapped to `NaN`.
    /// Columns named in neither list are not carried over.
    pub fn from_dataframe(
        df: &DataFrame,
        categorical: &[String],
        declared: &[(String, Vec<String>)],
        numeric: &[String],
    ) -> Result<Self, DataError> {
        let mut table = Self::new(df.height());

        for name in categorical {
            let values = extract_string_column(df, name)?;
            let factor = match declared.iter().find(|(column, _)| column == name) {
                Some((_, levels)) => FactorColumn::from_declared(name, &values, levels)?,
                None => FactorColumn::from_observed(&values),
            };
            table.insert_factor(name, factor)?;
        }

        for name in numeric {
            if table.has_column(name) {
                continue;
            }
            let values = extract_numeric_column(df, name)?;
            table.insert_numeric(name, values)?;
        }

        Ok(table)
    }
}

fn extract_numeric_column(df: &DataFrame, column_name: &str) -> Result<Vec<f64>, DataError> {
    let series = df
        .column(column_name)
        .map_err(|_| DataError::ColumnNotFound(column_name.to_string()))?;

    let casted = match series.cast(&DataType::Float64) {
        Ok(casted) => casted,
        Err(_) => {
            return Err(DataError::ColumnWrongType {
                column_name: column_name.to_string(),
                expected_type: "f64 (numeric)",
                found_type: format!("{:?}", series.dtype()),
            });
        }
    };

    // The non-strict cast turns unparseable text into nulls; more nulls than the source
    // column had means the column is not numeric.
    if casted.null_count() > series.null_count() {
        return Err(DataError::ColumnWrongType {
            column_name: column_name.to_string(),
            expected_type: "f64 (numeric)",
            found_type: format!("{:?}", series.dtype()),
        });
    }

    let chunked = casted.f64()?.rechunk();
    Ok(chunked
        .into_iter()
        .map(|value| value.unwrap_or(f64::NAN))
        .collect())
}

fn extract_string_column(df: &DataFrame, column_name: &str) -> Result<Vec<Option<String>>, DataError> {
    let series = df
        .column(column_name)
        .map_err(|_| DataError::ColumnNotFound(column_name.to_string()))?;
    let casted = series.cast(&DataType::String)?;
    let chunked = casted.as_materialized_series().str()?.rechunk();
    Ok(chunked
        .into_iter()
        .map(|value| value.map(|s| s.to_string()))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn observed_levels_are_sorted_and_missing_values_stay_missing() {
        let values = vec![Some("2"), None, Some("1"), Some("2")];
        let factor = FactorColumn::from_observed(&values);
        assert_eq!(factor.levels(), &["1".to_string(), "2".to_string()]);
        assert_eq!(factor.codes(), &[Some(1), None, Some(0), Some(1)]);
    }

    #[test]
    fn declared_levels_keep_declaration_order() {
        let declared = vec!["Left".to_string(), "Right".to_string()];
        let values = vec![Some("Right"), Some("Left")];
        let factor = FactorColumn::from_declared("hemisphere", &values, &declared).unwrap();
        assert_eq!(factor.levels()[0], "Left");
        assert_eq!(factor.codes(), &[Some(1), Some(0)]);
    }

    #[test]
    fn undeclared_level_is_rejected() {
        let declared = vec!["Left".to_string(), "Right".to_string()];
        let values = vec![Some("Both")];
        let err = FactorColumn::from_declared("hemisphere", &values, &declared).unwrap_err();
        assert!(matches!(err, DataError::UndeclaredLevel { ref level, .. } if level == "Both"));
    }

    #[test]
    fn dataframe_conversion_types_columns() {
        let df = DataFrame::new(vec![
            Series::new("class_label".into(), vec![0i64, 1, 3]).into(),
            Series::new("roiA".into(), vec![Some(1.5), None, Some(2.5)]).into(),
            Series::new("site_id_l".into(), vec!["site02", "site01", "site02"]).into(),
        ])
        .unwrap();

        let table = FeatureTable::from_dataframe(
            &df,
            &["class_label".to_string(), "site_id_l".to_string()],
            &[(
                "class_label".to_string(),
                ["0", "1", "2", "3"].iter().map(|l| l.to_string()).collect(),
            )],
            &["roiA".to_string()],
        )
        .unwrap();

        assert_eq!(table.n_rows(), 3);
        let class = table.factor("class_label").unwrap();
        assert_eq!(class.levels().len(), 4);
        assert_eq!(class.codes(), &[Some(0), Some(1), Some(3)]);
        let roi = table.numeric("roiA").unwrap();
        assert_eq!(roi[0], 1.5);
        assert!(roi[1].is_nan());
        assert_eq!(table.factor("site_id_l").unwrap().levels()[0], "site01");
    }

    #[test]
    fn text_in_numeric_column_is_rejected() {
        let df = DataFrame::new(vec![Series::new("roiA".into(), vec!["a", "b"]).into()]).unwrap();
        let err = FeatureTable::from_dataframe(&df, &[], &[], &["roiA".to_string()]).unwrap_err();
        assert!(matches!(err, DataError::ColumnWrongType { .. }));
    }

    #[test]
    fn length_mismatch_is_reported() {
        let mut table = FeatureTable::new(3);
        let err = table.insert_numeric("x", vec![1.0]).unwrap_err();
        assert!(matches!(err, DataError::LengthMismatch { expected: 3, found: 1, .. }));
    }
}
