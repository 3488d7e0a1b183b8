//! Rayon-based parallel batch processing.
//!
//! Every task builds its own model and filter state; nothing mutable is
//! shared between tasks.

use rayon::prelude::*;

use crate::bsm::BsmSpec;
use crate::error::Result;
use crate::forecast::{forecast_pipeline, ForecastResult};
use crate::likelihood::{compute_likelihood, DiffuseLikelihood};
use crate::optimizer;
use crate::state_space::Ssf;
use crate::types::{FilterConfig, FitConfig, FitResult};

/// Likelihood of one model for many series in parallel.
pub fn batch_loglike(
    ssf: &Ssf,
    series: &[Vec<Option<f64>>],
    config: &FilterConfig,
) -> Vec<Result<DiffuseLikelihood>> {
    series
        .par_iter()
        .map(|data| compute_likelihood(ssf, data, config))
        .collect()
}

/// Log-likelihood of one series at many BSM variance ratio vectors.
pub fn batch_loglike_params(
    data: &[Option<f64>],
    spec: &BsmSpec,
    ratios_list: &[Vec<f64>],
    config: &FilterConfig,
) -> Vec<Result<f64>> {
    ratios_list
        .par_iter()
        .map(|ratios| {
            let model = spec.build_from_ratios(ratios)?;
            Ok(compute_likelihood(model.ssf(), data, config)?.loglike)
        })
        .collect()
}

/// Fit the same BSM to many series in parallel.
pub fn batch_fit(
    series: &[Vec<Option<f64>>],
    spec: &BsmSpec,
    config: &FitConfig,
) -> Vec<Result<FitResult>> {
    series
        .par_iter()
        .map(|data| optimizer::fit_bsm(data, spec, config))
        .collect()
}

/// Forecast many series in parallel; `ratios_list[i]` parameterizes `series[i]`.
pub fn batch_forecast(
    series: &[Vec<Option<f64>>],
    spec: &BsmSpec,
    ratios_list: &[Vec<f64>],
    config: &FilterConfig,
    steps: usize,
    alpha: f64,
) -> Vec<Result<ForecastResult>> {
    series
        .par_iter()
        .zip(ratios_list.par_iter())
        .map(|(data, ratios)| {
            let model = spec.build_from_ratios(ratios)?;
            forecast_pipeline(model.ssf(), data, config, steps, alpha)
        })
        .collect()
}
