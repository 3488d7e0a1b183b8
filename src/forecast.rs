use crate::error::{Result, SsfError};
use crate::likelihood::compute_likelihood;
use crate::state::State;
use crate::state_space::Ssf;
use crate::storage::FilteringStorage;
use crate::types::FilterConfig;

/// H-step ahead forecast result.
#[derive(Debug, Clone)]
pub struct ForecastResult {
    /// Forecast means E[y_{n+h}] for h = 1..steps.
    pub mean: Vec<f64>,
    /// Forecast variances Var[y_{n+h}], scaled by the likelihood scale.
    pub variance: Vec<f64>,
    /// Lower confidence interval bounds.
    pub ci_lower: Vec<f64>,
    /// Upper confidence interval bounds.
    pub ci_upper: Vec<f64>,
}

/// One-step-ahead residuals. `None` on missing periods and on observations
/// absorbed by the diffuse initialization.
#[derive(Debug, Clone)]
pub struct ResidualOutput {
    /// Raw prediction errors e_t.
    pub residuals: Vec<Option<f64>>,
    /// Standardized residuals e_t / sqrt(F_t * scale).
    pub standardized_residuals: Vec<Option<f64>>,
}

/// Forecasts for periods `start`, `start + 1`, ... from the predicted state
/// at `start`:
///   y_hat = Z a,  F = (Z P Z' + h) * scale,
///   a <- T a,     P <- T P T' + S S'
pub fn forecast(
    ssf: &Ssf,
    start: usize,
    state: &State,
    scale: f64,
    steps: usize,
    alpha: f64,
) -> Result<ForecastResult> {
    if !(alpha.is_finite() && alpha > 0.0 && alpha < 1.0) {
        return Err(SsfError::DataError(format!(
            "alpha must be in (0, 1), got {}",
            alpha
        )));
    }
    if !scale.is_finite() || scale <= 0.0 {
        return Err(SsfError::DataError(format!(
            "scale must be > 0, got {}",
            scale
        )));
    }
    let z_alpha = z_score(1.0 - alpha / 2.0);

    let mut mean = Vec::with_capacity(steps);
    let mut variance = Vec::with_capacity(steps);
    let mut ci_lower = Vec::with_capacity(steps);
    let mut ci_upper = Vec::with_capacity(steps);

    let mut current = state.clone();
    for h in 0..steps {
        let m = ssf.matrices(start + h);
        let y_hat = m.z.dot(&current.a);
        let f = ((m.z.dot(&(&current.p * &m.z)) + m.h) * scale).max(0.0);
        let se = f.sqrt();

        mean.push(y_hat);
        variance.push(f);
        ci_lower.push(y_hat - z_alpha * se);
        ci_upper.push(y_hat + z_alpha * se);

        current.next_with(&m);
    }

    Ok(ForecastResult {
        mean,
        variance,
        ci_lower,
        ci_upper,
    })
}

/// Residuals of a stored filter pass, standardized with `scale`.
pub fn compute_residuals(storage: &FilteringStorage, scale: f64) -> ResidualOutput {
    let sd = scale.max(0.0).sqrt();
    let standardized_residuals = storage
        .standardized_residuals()
        .into_iter()
        .map(|r| r.map(|v| if sd > 0.0 { v / sd } else { 0.0 }))
        .collect();
    ResidualOutput {
        residuals: storage.prediction_errors(),
        standardized_residuals,
    }
}

/// Filter `data`, then forecast `steps` periods past its end.
pub fn forecast_pipeline(
    ssf: &Ssf,
    data: &[Option<f64>],
    config: &FilterConfig,
    steps: usize,
    alpha: f64,
) -> Result<ForecastResult> {
    let ll = compute_likelihood(ssf, data, config)?;
    let storage = FilteringStorage::filter(ssf, data)?;
    let end = storage.end_state().ok_or_else(|| {
        SsfError::DataError("filter pass produced no end state".into())
    })?;
    forecast(ssf, data.len(), end, ll.scale, steps, alpha)
}

/// Filter `data` and return its residuals.
pub fn residuals_pipeline(
    ssf: &Ssf,
    data: &[Option<f64>],
    config: &FilterConfig,
) -> Result<ResidualOutput> {
    let ll = compute_likelihood(ssf, data, config)?;
    let storage = FilteringStorage::filter(ssf, data)?;
    Ok(compute_residuals(&storage, ll.scale))
}

/// Approximate inverse normal CDF (Abramowitz & Stegun 26.2.23).
pub fn z_score(p: f64) -> f64 {
    if p <= 0.0 {
        return f64::NEG_INFINITY;
    }
    if p >= 1.0 {
        return f64::INFINITY;
    }
    if (p - 0.5).abs() < 1e-15 {
        return 0.0;
    }
    let (sign, q) = if p < 0.5 { (-1.0, p) } else { (1.0, 1.0 - p) };
    let t = (-2.0 * q.ln()).sqrt();

    const C: [f64; 3] = [2.515517, 0.802853, 0.010328];
    const D: [f64; 3] = [1.432788, 0.189269, 0.001308];
    let x = t - (C[0] + C[1] * t + C[2] * t * t) / (1.0 + D[0] * t + D[1] * t * t + D[2] * t * t * t);
    sign * x
}
