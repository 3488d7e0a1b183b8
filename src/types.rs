/// Filter variant used to evaluate a likelihood.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterAlgorithm {
    /// Exact diffuse initialization followed by the direct covariance filter.
    Ordinary,
    /// Exact diffuse initialization followed by the array square-root filter.
    SquareRoot,
    /// Augmented (de Jong) filter, diffuse effects profiled out at the end.
    Augmented,
    /// Exact diffuse initialization followed by the Chandrasekhar (CKMS) recursions.
    /// Time-invariant models only.
    Ckms,
}

/// Steady-state detection for the CKMS filter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CkmsConfig {
    /// Relative change of the innovation variance and gain below which the
    /// recursion is considered stationary.
    pub tolerance: f64,
    /// Number of periods after which a non-stationary recursion is an error.
    pub max_iter: usize,
}

impl Default for CkmsConfig {
    fn default() -> Self {
        Self {
            tolerance: 1e-12,
            max_iter: 10_000,
        }
    }
}

/// Filter configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FilterConfig {
    pub algorithm: FilterAlgorithm,
    /// If true, the scale factor is concentrated out of the likelihood.
    pub concentrate_scale: bool,
    pub ckms: CkmsConfig,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            algorithm: FilterAlgorithm::Ordinary,
            concentrate_scale: true,
            ckms: CkmsConfig::default(),
        }
    }
}

impl FilterConfig {
    pub fn with_algorithm(algorithm: FilterAlgorithm) -> Self {
        Self {
            algorithm,
            ..Default::default()
        }
    }
}

/// Optimizer used for maximum likelihood estimation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FitMethod {
    /// Box-constrained L-BFGS-B, Nelder-Mead fallback.
    Lbfgsb,
    /// Unconstrained L-BFGS with More-Thuente line search.
    Lbfgs,
    NelderMead,
}

impl FitMethod {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "lbfgsb" | "l-bfgs-b" => Some(FitMethod::Lbfgsb),
            "lbfgs" => Some(FitMethod::Lbfgs),
            "nelder-mead" | "nm" => Some(FitMethod::NelderMead),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            FitMethod::Lbfgsb => "lbfgsb",
            FitMethod::Lbfgs => "lbfgs",
            FitMethod::NelderMead => "nelder-mead",
        }
    }
}

/// Estimation configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FitConfig {
    pub method: FitMethod,
    pub maxiter: u64,
    pub filter: FilterConfig,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            method: FitMethod::Lbfgsb,
            maxiter: 500,
            filter: FilterConfig::default(),
        }
    }
}

/// Fit result returned by the optimizer.
#[derive(Debug, Clone)]
pub struct FitResult {
    /// Optimal parameters (variance ratios of the free components).
    pub params: Vec<f64>,
    /// Variances of all components, scaled by the concentrated sigma2.
    pub variances: Vec<f64>,
    pub loglike: f64,
    pub scale: f64,
    pub n_obs: usize,
    pub n_params: usize,
    pub n_iter: u64,
    pub converged: bool,
    pub method: String,
    /// Euclidean norm of the log-likelihood gradient at `params`.
    pub gradient_norm: f64,
    pub aic: f64,
    pub bic: f64,
}

impl FitResult {
    /// Fill AIC/BIC from the log-likelihood. The scale counts as a parameter.
    pub fn with_information_criteria(mut self) -> Self {
        let k = (self.n_params + 1) as f64;
        self.aic = -2.0 * self.loglike + 2.0 * k;
        self.bic = -2.0 * self.loglike + k * (self.n_obs as f64).ln();
        self
    }
}

/// Convert a series where NaN marks missing values into explicit observations.
pub fn observations_from_nan(values: &[f64]) -> Vec<Option<f64>> {
    values
        .iter()
        .map(|&v| if v.is_nan() { None } else { Some(v) })
        .collect()
}

/// Wrap a complete series.
pub fn observations(values: &[f64]) -> Vec<Option<f64>> {
    values.iter().map(|&v| Some(v)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_config() {
        let config = FilterConfig::default();
        assert_eq!(config.algorithm, FilterAlgorithm::Ordinary);
        assert!(config.concentrate_scale);
        assert!(config.ckms.max_iter > 0);
    }

    #[test]
    fn test_fit_method_from_str() {
        assert_eq!(FitMethod::from_str("lbfgsb"), Some(FitMethod::Lbfgsb));
        assert_eq!(FitMethod::from_str("nm"), Some(FitMethod::NelderMead));
        assert_eq!(FitMethod::from_str("lbfgs"), Some(FitMethod::Lbfgs));
        assert_eq!(FitMethod::from_str("bfgs"), None);
    }

    #[test]
    fn test_observations_from_nan() {
        let obs = observations_from_nan(&[1.0, f64::NAN, 0.0]);
        assert_eq!(obs, vec![Some(1.0), None, Some(0.0)]);
    }

    #[test]
    fn test_information_criteria() {
        let r = FitResult {
            params: vec![0.1],
            variances: vec![0.1, 1.0],
            loglike: -100.0,
            scale: 1.0,
            n_obs: 100,
            n_params: 1,
            n_iter: 5,
            converged: true,
            method: "lbfgsb".into(),
            gradient_norm: 0.0,
            aic: 0.0,
            bic: 0.0,
        }
        .with_information_criteria();
        assert!((r.aic - 204.0).abs() < 1e-10);
        assert!((r.bic - (200.0 + 2.0 * 100f64.ln())).abs() < 1e-10);
    }
}
