use crate::error::{Result, SsfError};

/// Bounds of the unconstrained (log) space. exp(-30) ~ 1e-13 stands in for
/// a zero ratio.
pub const LOG_RATIO_BOUNDS: (f64, f64) = (-30.0, 20.0);

/// Unconstrained value -> variance ratio (exp).
pub fn constrain_ratio(x: f64) -> f64 {
    x.exp()
}

/// Variance ratio -> unconstrained value (log), clamped to `LOG_RATIO_BOUNDS`.
/// Returns error if r < 0.
pub fn unconstrain_ratio(r: f64) -> Result<f64> {
    if !r.is_finite() || r < 0.0 {
        return Err(SsfError::DataError(format!(
            "variance ratio must be finite and >= 0, got {}",
            r
        )));
    }
    let (lo, hi) = LOG_RATIO_BOUNDS;
    if r == 0.0 {
        return Ok(lo);
    }
    Ok(r.ln().clamp(lo, hi))
}

/// Map an unconstrained optimizer vector to variance ratios.
pub fn transform_params(unconstrained: &[f64]) -> Vec<f64> {
    unconstrained.iter().map(|&x| constrain_ratio(x)).collect()
}

/// Map variance ratios to the unconstrained optimizer vector.
pub fn untransform_params(ratios: &[f64], expected: usize) -> Result<Vec<f64>> {
    if ratios.len() != expected {
        return Err(SsfError::ParamLengthMismatch {
            expected,
            got: ratios.len(),
        });
    }
    ratios.iter().map(|&r| unconstrain_ratio(r)).collect()
}

/// Default starting ratios: one tenth of the scale for every free component.
pub fn default_start_ratios(n_params: usize) -> Vec<f64> {
    vec![0.1; n_params]
}
