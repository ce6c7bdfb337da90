use std::time::{Duration, Instant};

use thiserror::Error;

use super::data::FeatureTable;
use super::design::DesignError;
use super::spec::ModelSpecification;

/// One row of a fitted model's effect table.
#[derive(Debug, Clone, PartialEq)]
pub struct Coefficient {
    pub name: String,
    pub estimate: f64,
    pub ci_lower: f64,
    pub ci_upper: f64,
    pub std_error: f64,
    pub df: f64,
    pub t_stat: f64,
    pub p_value: f64,
}

/// Estimated variance of one random intercept.
#[derive(Debug, Clone, PartialEq)]
pub struct VarianceComponent {
    pub grouping: String,
    pub variance: f64,
}

/// Everything a solver reports for one successful fit.
#[derive(Debug, Clone)]
pub struct SolverFit {
    pub coefficients: Vec<Coefficient>,
    pub converged: bool,
    pub variance_components: Vec<VarianceComponent>,
    pub residual_variance: f64,
    pub reml_criterion: f64,
    pub n_obs: usize,
    /// Optimizer iterations, when the optimizer reported them.
    pub iterations: Option<usize>,
}

impl SolverFit {
    pub fn coefficient(&self, name: &str) -> Option<&Coefficient> {
        self.coefficients.iter().find(|c| c.name == name)
    }
}

/// Reasons a single model fit produced no result.
#[derive(Error, Debug)]
pub enum FitError {
    #[error("Design construction failed: {0}")]
    Design(#[from] DesignError),

    #[error("Only {n_obs} complete observations for {n_coefficients} fixed-effect coefficients.")]
    InsufficientObservations {
        n_obs: usize,
        n_coefficients: usize,
    },

    #[error(
        "A cluster of {rows} connected observations exceeds the dense limit of {limit} rows; the grouping factors are too heavily crossed."
    )]
    ClusterTooLarge { rows: usize, limit: usize },

    #[error("The fixed-effect cross-product is singular; the design is not identifiable. Error: {0}")]
    SingularFixedEffects(ndarray_linalg::error::LinalgError),

    #[error("A covariance block could not be factorised: {0}")]
    CovarianceFactorisation(ndarray_linalg::error::LinalgError),

    #[error("The {quantity} of '{coefficient}' is {value}; the fixed-effect covariance is numerically broken.")]
    NonFiniteInference {
        coefficient: String,
        quantity: &'static str,
        value: f64,
    },

    #[error("The REML criterion is not finite at the starting values.")]
    NonFiniteCriterion,

    #[error("The fit exceeded its wall-clock limit after {0:?}.")]
    Timeout(Duration),

    #[error("Could not evaluate the reference distribution: {0}")]
    Distribution(String),

    #[error("Solver failure: {0}")]
    Solver(String),
}

/// The external mixed-model capability: fit a specification against the table and
/// return the coefficient table with a convergence flag, or fail.
///
/// Implementations must be shareable across worker threads. When a deadline is given
/// the solver should stop and return [`FitError::Timeout`] once it has passed.
pub trait MixedModelSolver: Sync {
    fn fit(
        &self,
        spec: &ModelSpecification,
        table: &FeatureTable,
        deadline: Option<Instant>,
    ) -> Result<SolverFit, FitError>;
}
