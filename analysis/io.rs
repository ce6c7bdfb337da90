//! Result persistence: the aggregated coefficient table, the corrected table and the
//! significance report.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::ser::{PrettyFormatter, Serializer};
use thiserror::Error;

use crate::extract::{AGGREGATED_COLUMNS, AggregatedResult, AggregatedRow};
use crate::fdr::{CORRECTED_COLUMNS, CorrectedRow, SignificanceReport};

#[derive(Error, Debug)]
pub enum OutputError {
    #[error("Could not write '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("CSV error in '{path}': {source}")]
    Csv { path: PathBuf, source: csv::Error },

    #[error("Failed to serialize the significance report: {0}")]
    Json(#[from] serde_json::Error),

    #[error("The aggregated coefficient table '{0}' does not exist. Run the fit stage first.")]
    MissingTable(PathBuf),
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> OutputError + '_ {
    move |source| OutputError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn csv_error(path: &Path) -> impl FnOnce(csv::Error) -> OutputError + '_ {
    move |source| OutputError::Csv {
        path: path.to_path_buf(),
        source,
    }
}

fn ensure_parent(path: &Path) -> Result<(), OutputError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_error(parent))?;
    }
    Ok(())
}

/// Writes rows under an explicit header, so an empty table still has one.
fn write_table<T: Serialize>(path: &Path, header: &[&str], rows: &[T]) -> Result<(), OutputError> {
    ensure_parent(path)?;
    let file = File::create(path).map_err(io_error(path))?;
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(BufWriter::new(file));
    writer.write_record(header).map_err(csv_error(path))?;
    for row in rows {
        writer.serialize(row).map_err(csv_error(path))?;
    }
    writer.flush().map_err(io_error(path))?;
    Ok(())
}

pub fn write_aggregated(path: &Path, aggregated: &AggregatedResult) -> Result<(), OutputError> {
    write_table(path, &AGGREGATED_COLUMNS, aggregated.rows())
}

pub fn read_aggregated(path: &Path) -> Result<AggregatedResult, OutputError> {
    if !path.exists() {
        return Err(OutputError::MissingTable(path.to_path_buf()));
    }
    let mut reader = csv::Reader::from_path(path).map_err(csv_error(path))?;
    let rows = reader
        .deserialize::<AggregatedRow>()
        .collect::<Result<Vec<_>, _>>()
        .map_err(csv_error(path))?;
    Ok(AggregatedResult::from_rows(rows))
}

pub fn write_corrected(path: &Path, rows: &[CorrectedRow]) -> Result<(), OutputError> {
    write_table(path, &CORRECTED_COLUMNS, rows)
}

/// Renders the report as JSON with four-space indentation and sorted keys.
pub fn render_report(report: &SignificanceReport) -> Result<Vec<u8>, OutputError> {
    let mut buffer = Vec::new();
    let mut serializer = Serializer::with_formatter(&mut buffer, PrettyFormatter::with_indent(b"    "));
    report.serialize(&mut serializer)?;
    Ok(buffer)
}

pub fn write_report(path: &Path, report: &SignificanceReport) -> Result<(), OutputError> {
    ensure_parent(path)?;
    let bytes = render_report(report)?;
    let mut file = BufWriter::new(File::create(path).map_err(io_error(path))?);
    file.write_all(&bytes).map_err(io_error(path))?;
    file.flush().map_err(io_error(path))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn row(feature: &str, effect: &str, p: f64, converged: bool) -> AggregatedRow {
        AggregatedRow {
            effect_name: effect.to_string(),
            estimate: -0.012345678901234,
            ci_lower: -0.05,
            ci_upper: 0.025,
            std_error: 0.0191,
            df: 1784.0,
            t_stat: -0.6464,
            p_value: p,
            converged,
            modality: "bilateral_subcortical_volume".to_string(),
            feature: feature.to_string(),
        }
    }

    #[test]
    fn aggregated_table_round_trips_in_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("results").join("table.csv");
        let aggregated = AggregatedResult::from_rows(vec![
            row("roiB", "class_label1", 0.5182736451, true),
            row("roiB", "hemisphereRight:class_label1", 1.0e-9, true),
            row("roiA", "hemisphereRight:class_label3", 0.049999999, false),
        ]);
        write_aggregated(&path, &aggregated).unwrap();
        let back = read_aggregated(&path).unwrap();
        assert_eq!(back, aggregated);
    }

    #[test]
    fn empty_table_keeps_its_header() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("table.csv");
        write_aggregated(&path, &AggregatedResult::default()).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text.trim_end(), AGGREGATED_COLUMNS.join(","));
        assert!(read_aggregated(&path).unwrap().is_empty());
    }

    #[test]
    fn missing_table_is_reported() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            read_aggregated(&dir.path().join("absent.csv")),
            Err(OutputError::MissingTable(_))
        ));
    }

    #[test]
    fn report_uses_four_space_indent_and_sorted_keys() {
        let mut report = SignificanceReport::default();
        report.insert(
            "bilateral_tract_FA",
            "hemisphereRight:class_label2",
            vec!["fa2".to_string(), "fa1".to_string()],
        );
        report.insert(
            "bilateral_cortical_volume",
            "hemisphereRight:class_label1",
            vec!["roiA".to_string()],
        );
        let text = String::from_utf8(render_report(&report).unwrap()).unwrap();
        let expected = r#"{
    "bilateral_cortical_volume": {
        "hemisphereRight:class_label1": [
            "roiA"
        ]
    },
    "bilateral_tract_FA": {
        "hemisphereRight:class_label2": [
            "fa2",
            "fa1"
        ]
    }
}"#;
        assert_eq!(text, expected);
    }

    #[test]
    fn empty_report_is_an_empty_object() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("report.json");
        write_report(&path, &SignificanceReport::default()).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "{}");
    }
}
