use std::f64::consts::PI;

use crate::akf::{augmented_filter, AugmentedDiffuse};
use crate::ckms::ckms_filter;
use crate::error::{Result, SsfError};
use crate::initialization::DiffuseUpdateInformation;
use crate::kalman::{diffuse_filter, DiffuseFilteringResults, FilteringResults};
use crate::multivariate::{MultivariateFilteringResults, MultivariateUpdateInformation};
use crate::sqrt_filter::sqrt_filter;
use crate::state::{State, UpdateInformation};
use crate::state_space::Ssf;
use crate::types::{FilterAlgorithm, FilterConfig};

/// Diffuse log-likelihood and its components.
///
/// With m = n - nd:
///   concentrated:  ll = -0.5 * (m ln(2 pi) + m (1 + ln(ssq / m)) + ldet + lddet)
///   otherwise:     ll = -0.5 * (m ln(2 pi) + ssq + ldet + lddet)
#[derive(Debug, Clone, PartialEq)]
pub struct DiffuseLikelihood {
    /// Number of observations used.
    pub n: usize,
    /// Number of diffuse effects removed from the likelihood.
    pub nd: usize,
    /// Sum of squared standardized prediction errors.
    pub ssq: f64,
    /// Sum of log prediction error variances.
    pub ldet: f64,
    /// Log-determinant of the diffuse part.
    pub lddet: f64,
    pub concentrated: bool,
    pub loglike: f64,
    /// Concentrated scale ssq / m, or 1 when the scale is not concentrated.
    pub scale: f64,
}

impl DiffuseLikelihood {
    pub fn new(
        n: usize,
        nd: usize,
        ssq: f64,
        ldet: f64,
        lddet: f64,
        concentrated: bool,
    ) -> Result<Self> {
        if n <= nd {
            return Err(SsfError::DegenerateLikelihood(format!(
                "{} observation(s) for {} diffuse effect(s)",
                n, nd
            )));
        }
        let m = (n - nd) as f64;
        let (loglike, scale) = if concentrated {
            let sigma2 = ssq / m;
            if sigma2 <= State::ZERO * State::ZERO {
                return Err(SsfError::DegenerateLikelihood(format!(
                    "concentrated scale {} is zero",
                    sigma2
                )));
            }
            let ll = -0.5 * (m * (2.0 * PI).ln() + m * (1.0 + sigma2.ln()) + ldet + lddet);
            (ll, sigma2)
        } else {
            let ll = -0.5 * (m * (2.0 * PI).ln() + ssq + ldet + lddet);
            (ll, 1.0)
        };
        if !loglike.is_finite() {
            return Err(SsfError::DegenerateLikelihood(format!(
                "non-finite log-likelihood {}",
                loglike
            )));
        }
        Ok(Self {
            n,
            nd,
            ssq,
            ldet,
            lddet,
            concentrated,
            loglike,
            scale,
        })
    }

    /// Effective number of observations n - nd.
    pub fn n_effective(&self) -> usize {
        self.n - self.nd
    }

    pub fn sigma2(&self) -> f64 {
        self.scale
    }
}

/// Accumulates the likelihood terms of a filter pass.
#[derive(Debug, Clone, Default)]
pub struct LikelihoodAccumulator {
    n: usize,
    nd: usize,
    ssq: f64,
    ldet: f64,
    lddet: f64,
}

impl LikelihoodAccumulator {
    /// Ordinary observation with prediction error `e` and variance `v`.
    pub fn add(&mut self, e: f64, v: f64) {
        self.n += 1;
        self.ssq += e * e / v;
        self.ldet += v.ln();
    }

    /// Close an augmented pass: the sum of squares becomes the one with the
    /// diffuse effects profiled out.
    pub fn profile_diffuse(&mut self, diffuse: &AugmentedDiffuse) -> Result<()> {
        self.nd += diffuse.nd();
        self.lddet += diffuse.log_det()?;
        self.ssq = diffuse.ssq();
        Ok(())
    }

    /// Fails with `DegenerateLikelihood` if the sum of squares is negative or
    /// NaN, which only happens after a numerical breakdown of the filter.
    pub fn finish(self, concentrated: bool) -> Result<DiffuseLikelihood> {
        if self.ssq.is_nan() || self.ssq < 0.0 {
            return Err(SsfError::DegenerateLikelihood(format!(
                "sum of squares {} is negative",
                self.ssq
            )));
        }
        DiffuseLikelihood::new(
            self.n,
            self.nd,
            self.ssq,
            self.ldet,
            self.lddet,
            concentrated,
        )
    }
}

impl FilteringResults for LikelihoodAccumulator {
    fn save(&mut self, _pos: usize, info: &UpdateInformation) {
        self.add(info.e, info.v);
    }

    fn save_absorbed(&mut self, _pos: usize) {
        self.n += 1;
    }
}

impl DiffuseFilteringResults for LikelihoodAccumulator {
    fn save_diffuse(&mut self, _pos: usize, info: &DiffuseUpdateInformation) {
        if info.is_diffuse() {
            self.n += 1;
            self.nd += 1;
            self.lddet += info.fi.ln();
        } else {
            self.add(info.e, info.f);
        }
    }
}

impl MultivariateFilteringResults for LikelihoodAccumulator {
    fn save(&mut self, _pos: usize, info: &MultivariateUpdateInformation) {
        self.n += info.u.len();
        self.ssq += info.u.norm_squared();
        self.ldet += 2.0 * info.r.diagonal().iter().map(|x| x.ln()).sum::<f64>();
    }

    fn save_absorbed(&mut self, _pos: usize, _equation: usize) {
        self.n += 1;
    }
}

/// Log-likelihood of a univariate model with the chosen filter variant.
pub fn compute_likelihood(
    ssf: &Ssf,
    data: &[Option<f64>],
    config: &FilterConfig,
) -> Result<DiffuseLikelihood> {
    let mut acc = LikelihoodAccumulator::default();
    match config.algorithm {
        FilterAlgorithm::Ordinary => {
            diffuse_filter(ssf, data, &mut acc)?;
        }
        FilterAlgorithm::SquareRoot => {
            sqrt_filter(ssf, data, &mut acc)?;
        }
        FilterAlgorithm::Augmented => {
            let diffuse = augmented_filter(ssf, data, &mut acc)?;
            acc.profile_diffuse(&diffuse)?;
        }
        FilterAlgorithm::Ckms => {
            ckms_filter(ssf, data, &config.ckms, &mut acc)?;
        }
    }
    acc.finish(config.concentrate_scale)
}
