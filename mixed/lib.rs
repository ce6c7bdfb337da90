#![deny(dead_code)]
#![deny(unused_imports)]

pub mod data;
pub mod design;
pub mod reml;
pub mod spec;
pub mod types;

pub use data::{DataError, FactorColumn, FeatureTable};
pub use reml::{RemlSolver, SolverSettings};
pub use spec::{EffectKind, EffectWhitelist, FactorSpec, ModalityPlan, ModelSpecification, SpecTemplate};
pub use types::{Coefficient, FitError, MixedModelSolver, SolverFit, VarianceComponent};
