//! Augmented Kalman filter (de Jong).
//!
//! The diffuse effects delta enter the initial state as B delta. The filter
//! runs the ordinary recursion on (a, P) and carries the columns A with
//! a(delta) = a + A delta. Each observation adds the regression row
//! E = A'Z, e = y - Z'a to the least squares problem in delta, kept in
//! information form: an upper triangular R with R'R = sum E E' / F and
//! z = R^-T sum E e / F. Rows are folded in with Givens rotations, so the
//! profiled sum of squares is a sum of squared residuals.
//!
//! An observation with F = 0 but E != 0 is an exact linear constraint on
//! delta. It is solved for one direction of delta, which is then removed
//! from the problem.

use nalgebra::{DMatrix, DVector};

use crate::error::{Result, SsfError};
use crate::kalman::FilteringResults;
use crate::state::{State, UpdateInformation};
use crate::state_space::{Ssf, SystemCache};

/// Least squares problem of the diffuse effects.
///
/// The original effects are delta = w0 + W xi, where xi are the directions
/// not yet fixed by exact constraints.
#[derive(Debug, Clone)]
pub struct AugmentedDiffuse {
    r: DMatrix<f64>,
    z: DVector<f64>,
    ssq: f64,
    w0: DVector<f64>,
    w: DMatrix<f64>,
    lddet: f64,
}

impl AugmentedDiffuse {
    pub fn new(nd: usize) -> Self {
        Self {
            r: DMatrix::zeros(nd, nd),
            z: DVector::zeros(nd),
            ssq: 0.0,
            w0: DVector::zeros(nd),
            w: DMatrix::identity(nd, nd),
            lddet: 0.0,
        }
    }

    /// Number of diffuse effects.
    pub fn nd(&self) -> usize {
        self.w0.len()
    }

    /// Number of effects still estimated by least squares.
    pub fn remaining(&self) -> usize {
        self.z.len()
    }

    /// Sum of squared standardized residuals with delta profiled out.
    pub fn ssq(&self) -> f64 {
        self.ssq
    }

    /// Add the standardized regressors `x = E / sqrt(F)` and residual
    /// `b = e / sqrt(F)` of one observation.
    pub(crate) fn add(&mut self, x: &DVector<f64>, b: f64) {
        let m = self.remaining();
        let mut x = x.clone();
        let mut b = b;
        for j in 0..m {
            if x[j] == 0.0 {
                continue;
            }
            let rjj = self.r[(j, j)];
            let rho = rjj.hypot(x[j]);
            let (c, s) = (rjj / rho, x[j] / rho);
            for k in j..m {
                let (rk, xk) = (self.r[(j, k)], x[k]);
                self.r[(j, k)] = c * rk + s * xk;
                x[k] = c * xk - s * rk;
            }
            let zj = self.z[j];
            self.z[j] = c * zj + s * b;
            b = c * b - s * zj;
        }
        self.ssq += b * b;
    }

    /// Impose the exact constraint `E' xi = e` of an observation without
    /// noise. `a` and `a_cols` are moved onto the remaining directions.
    ///
    /// Returns false when no direction is left or `E` is negligible.
    pub(crate) fn absorb(
        &mut self,
        e: f64,
        e_cols: &DVector<f64>,
        a: &mut DVector<f64>,
        a_cols: &mut DMatrix<f64>,
    ) -> bool {
        let m = self.remaining();
        let n2 = e_cols.norm_squared();
        if m == 0 || n2 <= State::ZERO {
            return false;
        }
        // Householder reflection H with H E = gamma e1.
        let norm = n2.sqrt();
        let sign = if e_cols[0] >= 0.0 { 1.0 } else { -1.0 };
        let mut v = e_cols.clone();
        v[0] += sign * norm;
        let h = DMatrix::identity(m, m) - &v * v.transpose() * (2.0 / v.norm_squared());
        let c = e / (-sign * norm);

        let ah = &*a_cols * &h;
        a.axpy(c, &ah.column(0), 1.0);
        *a_cols = ah.columns(1, m - 1).into_owned();

        let wh = &self.w * &h;
        self.w0.axpy(c, &wh.column(0), 1.0);
        self.w = wh.columns(1, m - 1).into_owned();

        // Re-triangularize the remaining problem.
        let rh = &self.r * &h;
        let rows = rh.columns(1, m - 1).into_owned();
        let rhs = &self.z - rh.column(0) * c;
        self.r = DMatrix::zeros(m - 1, m - 1);
        self.z = DVector::zeros(m - 1);
        for i in 0..m {
            self.add(&rows.row(i).transpose(), rhs[i]);
        }
        self.lddet += n2.ln();
        true
    }

    fn check_identified(&self) -> Result<()> {
        if self.remaining() == 0 {
            return Ok(());
        }
        let diag = self.r.diagonal();
        let max = diag.amax();
        if max == 0.0 || diag.iter().any(|x| x.abs() <= f64::EPSILON.sqrt() * max) {
            return Err(SsfError::Initialization(
                "diffuse effects are not identified by the data (singular augmented matrix)"
                    .into(),
            ));
        }
        Ok(())
    }

    /// Diffuse term of the likelihood: ln det of the normal equations, plus
    /// ln |E|^2 of every absorbed constraint.
    pub fn log_det(&self) -> Result<f64> {
        self.check_identified()?;
        Ok(self.lddet + self.r.diagonal().iter().map(|x| (x * x).ln()).sum::<f64>())
    }

    /// GLS estimate of the diffuse effects.
    pub fn diffuse_effects(&self) -> Result<DVector<f64>> {
        self.check_identified()?;
        if self.remaining() == 0 {
            return Ok(self.w0.clone());
        }
        let xi = self.r.solve_upper_triangular(&self.z).ok_or_else(|| {
            SsfError::Initialization("singular augmented matrix".into())
        })?;
        Ok(&self.w0 + &self.w * xi)
    }
}

/// Augmented filter over the whole series. `results` receives the
/// prediction errors of the non-augmented part.
pub fn augmented_filter<R>(
    ssf: &Ssf,
    data: &[Option<f64>],
    results: &mut R,
) -> Result<AugmentedDiffuse>
where
    R: FilteringResults + ?Sized,
{
    let cache = SystemCache::new(ssf);
    let mut state = ssf.initial_state()?;
    let mut a_cols = ssf.initialization.diffuse_constraints();
    let mut diffuse = AugmentedDiffuse::new(a_cols.ncols());

    for (pos, obs) in data.iter().enumerate() {
        let m = cache.at(pos);
        if results.needs_states() {
            results.save_state(pos, &state);
        }
        match *obs {
            None => results.save_missing(pos),
            Some(y) => {
                let info = UpdateInformation::compute(&state, &m.z, m.h, y);
                let e_cols = a_cols.tr_mul(&m.z);
                if info.v <= State::ZERO {
                    if !diffuse.absorb(info.e, &e_cols, &mut state.a, &mut a_cols) {
                        return Err(SsfError::NonPositiveVariance {
                            pos,
                            variance: info.v,
                        });
                    }
                    results.save_absorbed(pos);
                } else {
                    let sqrt_v = info.v.sqrt();
                    diffuse.add(&(&e_cols / sqrt_v), info.e / sqrt_v);
                    // A -= K E
                    a_cols.ger(-1.0 / info.v, &info.m, &e_cols, 1.0);
                    results.save(pos, &info);
                    state.update(pos, &info)?;
                }
            }
        }
        state.next_with(&m);
        a_cols = &m.t * &a_cols;
    }
    Ok(diffuse)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::LocalLevel;
    use crate::likelihood::LikelihoodAccumulator;
    use crate::types::observations;

    #[test]
    fn test_local_level_diffuse_terms() {
        // q = 1, h = 1, y = [1, 3].
        let ssf = Ssf::from_component(LocalLevel::new(1.0).unwrap(), Some(1.0)).unwrap();
        let mut acc = LikelihoodAccumulator::default();
        let diffuse = augmented_filter(&ssf, &observations(&[1.0, 3.0]), &mut acc).unwrap();

        // Period 0: a = 0, P = 0, F = 1, E = 1.
        // Period 1: a = 0, P = 1, A = 1, F = 2, E = 1.
        // S = 1 + 1/2, s = 1 + 3/2, raw ssq = 1 + 9/2.
        let delta = diffuse.diffuse_effects().unwrap();
        assert!((delta[0] - 2.5 / 1.5).abs() < 1e-14);
        assert!((diffuse.log_det().unwrap() - 1.5f64.ln()).abs() < 1e-14);
        assert!((diffuse.ssq() - (5.5 - 2.5 * 2.5 / 1.5)).abs() < 1e-12);
    }

    #[test]
    fn test_noise_free_observation_fixes_the_level() {
        // q = 1, no noise, y = [2, 3]. Period 0 has F = 0 and E = 1: the
        // level is exactly 2. Period 1: a = 2, P = 1, e = 1.
        let ssf = Ssf::from_component(LocalLevel::new(1.0).unwrap(), None).unwrap();
        let mut acc = LikelihoodAccumulator::default();
        let diffuse = augmented_filter(&ssf, &observations(&[2.0, 3.0]), &mut acc).unwrap();

        assert_eq!(diffuse.nd(), 1);
        assert_eq!(diffuse.remaining(), 0);
        let delta = diffuse.diffuse_effects().unwrap();
        assert!((delta[0] - 2.0).abs() < 1e-14);
        assert!(diffuse.log_det().unwrap().abs() < 1e-14);
        assert!((diffuse.ssq() - 1.0).abs() < 1e-14);
    }

    #[test]
    fn test_degenerate_observation_without_diffuse_part_rejected() {
        // Both observations of the same noise-free level: the second one has
        // F = 0 and nothing left to absorb it.
        let ssf = Ssf::from_component(LocalLevel::new(0.0).unwrap(), None).unwrap();
        let mut acc = LikelihoodAccumulator::default();
        let err = augmented_filter(&ssf, &observations(&[2.0, 2.0]), &mut acc).unwrap_err();
        assert!(matches!(err, SsfError::NonPositiveVariance { pos: 1, .. }));
    }

    #[test]
    fn test_unidentified_effects_rejected() {
        let ssf = Ssf::from_component(LocalLevel::new(1.0).unwrap(), Some(1.0)).unwrap();
        let mut acc = LikelihoodAccumulator::default();
        let diffuse = augmented_filter(&ssf, &[None, None], &mut acc).unwrap();
        let err = diffuse.log_det().unwrap_err();
        assert!(matches!(err, SsfError::Initialization(_)));
        assert!(diffuse.diffuse_effects().is_err());
    }
}
