//! State-space filtering and smoothing.
//!
//! Exact diffuse initialization, ordinary / square-root / augmented / CKMS
//! Kalman filters, diffuse likelihood, fixed-interval smoothing, composite
//! structural models and maximum-likelihood estimation of BSM variances.

pub mod error;
pub mod types;
pub mod state_space;
pub mod state;
pub mod components;
pub mod arima;
pub mod composite;
pub mod bsm;
pub mod initialization;
pub mod kalman;
pub mod sqrt_filter;
pub mod akf;
pub mod ckms;
pub mod multivariate;
pub mod likelihood;
pub mod storage;
pub mod smoother;
pub mod params;
pub mod optimizer;
pub mod forecast;
pub mod simulate;
pub mod batch;

pub use bsm::{BsmComponent, BsmSpec, BsmVariances};
pub use composite::{CompositeBuilder, CompositeSsf};
pub use error::{ErrorKind, Result, SsfError};
pub use likelihood::{compute_likelihood, DiffuseLikelihood};
pub use optimizer::{fit_bsm, fit_bsm_with_start};
pub use smoother::{smooth, SmoothingResults};
pub use state::{State, UpdateInformation};
pub use state_space::{
    Ssf, SsfComponent, SsfDynamics, SsfInitialization, SsfLoading, SsfMeasurement,
};
pub use storage::FilteringStorage;
pub use types::{
    CkmsConfig, FilterAlgorithm, FilterConfig, FitConfig, FitMethod, FitResult,
};
