use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SsfError {
    #[error("invalid model: {0}")]
    Model(String),

    #[error("initialization failed: {0}")]
    Initialization(String),

    #[error("diffuse initialization did not converge: {remaining} diffuse direction(s) left after {periods} periods")]
    DiffuseNotConverged { remaining: usize, periods: usize },

    #[error("non-positive prediction error variance {variance} at period {pos}")]
    NonPositiveVariance { pos: usize, variance: f64 },

    #[error("negative state variance {value} at period {pos}")]
    NegativeStateVariance { pos: usize, value: f64 },

    #[error("CKMS filter did not reach steady state after {iterations} iterations")]
    CkmsNotConverged { iterations: usize },

    #[error("Cholesky decomposition failed: {0}")]
    CholeskyFailed(String),

    #[error("degenerate likelihood: {0}")]
    DegenerateLikelihood(String),

    #[error("parameter length mismatch: expected {expected}, got {got}")]
    ParamLengthMismatch { expected: usize, got: usize },

    #[error("optimization failed: {0}")]
    OptimizationFailed(String),

    #[error("data error: {0}")]
    DataError(String),
}

/// Coarse classification of [`SsfError`], following how the failure should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The model description is inconsistent. Raised at construction time.
    Model,
    /// No valid initial state could be produced for a filter pass.
    Initialization,
    /// A filter pass hit a numerical failure.
    Filter,
    /// The observations cannot be processed by the requested algorithm.
    Data,
    /// Numerical optimization failed as a whole.
    Optimization,
}

impl SsfError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SsfError::Model(_) | SsfError::ParamLengthMismatch { .. } => ErrorKind::Model,
            SsfError::Initialization(_) | SsfError::DiffuseNotConverged { .. } => {
                ErrorKind::Initialization
            }
            SsfError::NonPositiveVariance { .. }
            | SsfError::NegativeStateVariance { .. }
            | SsfError::CkmsNotConverged { .. }
            | SsfError::CholeskyFailed(_)
            | SsfError::DegenerateLikelihood(_) => ErrorKind::Filter,
            SsfError::DataError(_) => ErrorKind::Data,
            SsfError::OptimizationFailed(_) => ErrorKind::Optimization,
        }
    }
}

pub type Result<T> = std::result::Result<T, SsfError>;
