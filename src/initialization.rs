use log::debug;
use nalgebra::{DMatrix, DVector};

use crate::error::{Result, SsfError};
use crate::kalman::DiffuseFilteringResults;
use crate::state::{check_covariance, State};
use crate::state_space::{Ssf, SystemCache};

/// Approximate initial state: the diffuse part is replaced by a large finite
/// variance.
#[derive(Debug, Clone)]
pub struct KalmanInit {
    /// Initial state vector a_0.
    pub initial_state: DVector<f64>,
    /// Initial state covariance Pf0 + kappa * B B'.
    pub initial_state_cov: DMatrix<f64>,
    /// Number of initial observations to skip in the likelihood.
    pub loglikelihood_burn: usize,
}

impl KalmanInit {
    /// Approximate diffuse initialization.
    ///
    /// - a_0 = a0
    /// - P_0 = Pf0 + kappa * Pi0
    /// - burn = number of diffuse directions
    pub fn approximate_diffuse(ssf: &Ssf, kappa: f64) -> Result<Self> {
        let state = ssf.initial_state()?;
        let pi0 = ssf.initialization.pi0();
        Ok(Self {
            initial_state: state.a,
            initial_state_cov: state.p + pi0 * kappa,
            loglikelihood_burn: ssf.diffuse_dim(),
        })
    }

    /// Default kappa value.
    pub fn default_kappa() -> f64 {
        1e6
    }

    pub fn state(&self) -> State {
        State::new(self.initial_state.clone(), self.initial_state_cov.clone())
    }
}

/// State of the diffuse phase: the finite part (a, Pf) and a basis B of the
/// remaining diffuse directions, Pi = B B'.
#[derive(Debug, Clone)]
pub struct DiffuseState {
    pub state: State,
    pub b: DMatrix<f64>,
}

impl DiffuseState {
    pub fn pi(&self) -> DMatrix<f64> {
        &self.b * self.b.transpose()
    }

    /// Remaining diffuse rank.
    pub fn rank(&self) -> usize {
        self.b.ncols()
    }
}

/// Per-observation scratch of the diffuse phase.
#[derive(Debug, Clone, PartialEq)]
pub struct DiffuseUpdateInformation {
    /// Prediction error y - Z'a.
    pub e: f64,
    /// Finite part of the error variance, Z'Pf Z + H.
    pub f: f64,
    /// Diffuse part of the error variance, Z'Pi Z.
    pub fi: f64,
    /// Pf Z.
    pub m: DVector<f64>,
    /// Pi Z.
    pub mi: DVector<f64>,
}

impl DiffuseUpdateInformation {
    /// True when the observation carries information on the diffuse effects.
    pub fn is_diffuse(&self) -> bool {
        self.fi > State::ZERO
    }
}

/// Exact diffuse initialization (Durbin-Koopman), run on a square-root form of
/// the diffuse covariance so that Pi stays positive semi-definite.
///
/// Every informative observation removes one diffuse direction; the filter
/// then continues with the ordinary recursion from the returned state.
pub struct DiffuseInitializer<'a> {
    ssf: &'a Ssf,
    cache: SystemCache<'a>,
}

impl<'a> DiffuseInitializer<'a> {
    pub fn new(ssf: &'a Ssf) -> Self {
        Self {
            ssf,
            cache: SystemCache::new(ssf),
        }
    }

    /// Run the diffuse phase over `data`.
    ///
    /// Returns the first position handled by the ordinary filter and the
    /// predicted state at that position. Fails with `DiffuseNotConverged` when
    /// diffuse directions remain at the end of the data.
    pub fn initialize<R>(&self, data: &[Option<f64>], results: &mut R) -> Result<(usize, State)>
    where
        R: DiffuseFilteringResults + ?Sized,
    {
        let state = self.ssf.initial_state()?;
        let b = self.ssf.initialization.diffuse_constraints();
        let mut dstate = DiffuseState { state, b };

        if dstate.rank() == 0 {
            results.close_diffuse(0);
            return Ok((0, dstate.state));
        }

        let mut pos = 0;
        let mut pivots = 0;
        while pos < data.len() && dstate.rank() > 0 {
            let m = self.cache.at(pos);
            if results.needs_states() {
                results.save_diffuse_state(pos, &dstate);
            }
            match data[pos] {
                None => results.save_missing(pos),
                Some(y) => {
                    let info = self.update(pos, &mut dstate, &m.z, m.h, y)?;
                    if info.is_diffuse() {
                        pivots += 1;
                    }
                    results.save_diffuse(pos, &info);
                }
            }
            dstate.state.next_with(&m);
            dstate.b = &m.t * &dstate.b;
            pos += 1;
        }

        if dstate.rank() > 0 {
            return Err(SsfError::DiffuseNotConverged {
                remaining: dstate.rank(),
                periods: pos,
            });
        }
        debug!("diffuse phase closed at period {} after {} pivot(s)", pos, pivots);
        results.close_diffuse(pos);
        Ok((pos, dstate.state))
    }

    fn update(
        &self,
        pos: usize,
        dstate: &mut DiffuseState,
        z: &DVector<f64>,
        h: f64,
        y: f64,
    ) -> Result<DiffuseUpdateInformation> {
        let bz = dstate.b.tr_mul(z);
        let fi = bz.norm_squared();
        let mi = &dstate.b * &bz;
        let mf = &dstate.state.p * z;
        let f = z.dot(&mf) + h;
        let e = y - z.dot(&dstate.state.a);
        let info = DiffuseUpdateInformation {
            e,
            f,
            fi,
            m: mf,
            mi,
        };

        let state = &mut dstate.state;
        if info.is_diffuse() {
            // a += Mi e / Fi
            // Pf -= (Mi Mf' + Mf Mi') / Fi - Mi Mi' F / Fi^2
            state.a.axpy(e / fi, &info.mi, 1.0);
            state.p.ger(-1.0 / fi, &info.mi, &info.m, 1.0);
            state.p.ger(-1.0 / fi, &info.m, &info.mi, 1.0);
            state.p.ger(f / (fi * fi), &info.mi, &info.mi, 1.0);
            check_covariance(&mut state.p, pos)?;
            dstate.b = reduce_basis(&dstate.b, &bz);
        } else {
            if f <= State::ZERO {
                return Err(SsfError::NonPositiveVariance { pos, variance: f });
            }
            state.a.axpy(e / f, &info.m, 1.0);
            state.p.ger(-1.0 / f, &info.m, &info.m, 1.0);
            check_covariance(&mut state.p, pos)?;
        }
        Ok(info)
    }
}

/// Remove the direction B'z from the diffuse basis: B (I - u u') B' with
/// u = B'z / |B'z| is rewritten as C C', C having one column less.
///
/// A Householder reflection H maps B'z onto the first axis, so B H has its
/// first column along B B'z and the remaining columns span the rest.
fn reduce_basis(b: &DMatrix<f64>, bz: &DVector<f64>) -> DMatrix<f64> {
    let k = b.ncols();
    let norm = bz.norm();
    let mut v = bz.clone();
    let sign = if bz[0] >= 0.0 { 1.0 } else { -1.0 };
    v[0] += sign * norm;
    let vv = v.norm_squared();
    let mut bh = b.clone();
    if vv > 0.0 {
        let bv = b * &v;
        bh.ger(-2.0 / vv, &bv, &v, 1.0);
    }
    bh.columns(1, k - 1).into_owned()
}
