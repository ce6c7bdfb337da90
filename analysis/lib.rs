#![deny(dead_code)]
#![deny(unused_imports)]
pub mod batch;
pub mod catalog;
pub mod config;
pub mod extract;
pub mod fdr;
pub mod io;
pub mod pipeline;

#[path = "../mixed/lib.rs"]
pub mod mixed;

pub use config::{AnalysisPlan, CorrectionScope, ExperimentConfig};
pub use pipeline::{PipelineError, identify_significant_interactions, run_repeated_measures};
