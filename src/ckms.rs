//! Chandrasekhar-type (CKMS) recursions for time-invariant models.
//!
//! Instead of P_t the filter propagates a low-rank factorization of its
//! increment, P_{t+1} - P_t = L_t M_t L_t', together with the unnormalized
//! gain K_t = T P_t Z and the error variance F_t:
//!
//!   zl      = L_t' Z
//!   F_{t+1} = F_t + zl' M_t zl
//!   K_{t+1} = K_t + T L_t M_t zl
//!   L_{t+1} = T L_t - K_t zl' / F_t
//!   M_{t+1} = M_t - M_t zl zl' M_t / F_{t+1}
//!
//! Once F and K stop moving the recursion reduces to a fixed-gain update.

use log::debug;
use nalgebra::{DMatrix, DVector};

use crate::error::{Result, SsfError};
use crate::initialization::DiffuseInitializer;
use crate::kalman::{DiffuseFilteringResults, FilteringResults};
use crate::state::{State, UpdateInformation};
use crate::state_space::Ssf;
use crate::types::CkmsConfig;

/// Fixed point reached by the CKMS recursion.
#[derive(Debug, Clone)]
pub struct SteadyState {
    /// First period filtered with the steady-state gain.
    pub position: usize,
    /// Innovation variance.
    pub f: f64,
    /// Unnormalized gain T P Z.
    pub k: DVector<f64>,
}

struct Recursion {
    f: f64,
    k: DVector<f64>,
    l: DMatrix<f64>,
    m: DMatrix<f64>,
}

impl Recursion {
    /// Factor P_1 - P_0 by a symmetric eigen decomposition, keeping the
    /// non-negligible eigenvalues (the increment is indefinite in general).
    fn new(
        t: &DMatrix<f64>,
        v: &DMatrix<f64>,
        z: &DVector<f64>,
        h: f64,
        p: &DMatrix<f64>,
        tolerance: f64,
    ) -> Self {
        let pz = p * z;
        let f = z.dot(&pz) + h;
        let k = t * &pz;
        let mut dp = t * p * t.transpose() + v - p;
        if f > State::ZERO {
            dp.ger(-1.0 / f, &k, &k, 1.0);
        }
        let dp = (&dp + dp.transpose()) * 0.5;
        let eig = dp.symmetric_eigen();
        let scale = eig.eigenvalues.iter().fold(0.0_f64, |acc, x| acc.max(x.abs()));
        let keep: Vec<usize> = (0..eig.eigenvalues.len())
            .filter(|&i| eig.eigenvalues[i].abs() > tolerance.max(State::ZERO * scale))
            .collect();
        let d = p.nrows();
        let mut l = DMatrix::zeros(d, keep.len());
        let mut m = DMatrix::zeros(keep.len(), keep.len());
        for (j, &i) in keep.iter().enumerate() {
            l.set_column(j, &eig.eigenvectors.column(i));
            m[(j, j)] = eig.eigenvalues[i];
        }
        Self { f, k, l, m }
    }

    /// Advance (F, K, L, M) by one period. Returns true when F and K moved
    /// by less than `tolerance` (relative).
    fn advance(&mut self, t: &DMatrix<f64>, z: &DVector<f64>, tolerance: f64) -> bool {
        if self.l.ncols() == 0 {
            return true;
        }
        let zl = self.l.tr_mul(z);
        let mzl = &self.m * &zl;
        let df = zl.dot(&mzl);
        let dk = t * (&self.l * &mzl);
        let f_next = self.f + df;

        let mut l_next = t * &self.l;
        l_next.ger(-1.0 / self.f, &self.k, &zl, 1.0);
        self.m.ger(-1.0 / f_next, &mzl, &mzl, 1.0);

        let converged = df.abs() <= tolerance * self.f.abs()
            && dk.amax() <= tolerance * self.k.amax().max(1.0);
        self.k += dk;
        self.f = f_next;
        self.l = l_next;
        converged
    }
}

/// CKMS filter over the ordinary phase, from the predicted state at `start`.
///
/// Requires a time-invariant model and no missing value after `start`.
/// Returns the steady state if it was reached before the end of the data.
///
/// P is not propagated: `results` gets the prediction errors and variances
/// only (`UpdateInformation::m` is empty and no state is saved).
pub fn ckms_ordinary_filter<R>(
    ssf: &Ssf,
    data: &[Option<f64>],
    start: usize,
    state: State,
    config: &CkmsConfig,
    results: &mut R,
) -> Result<Option<SteadyState>>
where
    R: FilteringResults + ?Sized,
{
    if !ssf.is_time_invariant() {
        return Err(SsfError::Model(
            "the CKMS filter requires a time-invariant model".into(),
        ));
    }
    if let Some(pos) = (start..data.len()).find(|&i| data[i].is_none()) {
        return Err(SsfError::DataError(format!(
            "the CKMS filter does not handle missing values (period {})",
            pos
        )));
    }
    if start >= data.len() {
        return Ok(None);
    }

    let sys = ssf.matrices(0);
    let v = sys.v();
    let mut rec = Recursion::new(&sys.t, &v, &sys.z, sys.h, &state.p, config.tolerance);
    let mut a = state.a;
    let mut steady: Option<SteadyState> = None;
    let mut iterations = 0;

    for (pos, obs) in data.iter().enumerate().skip(start) {
        let y = match *obs {
            Some(y) => y,
            None => continue,
        };
        if rec.f <= State::ZERO {
            return Err(SsfError::NonPositiveVariance {
                pos,
                variance: rec.f,
            });
        }
        let e = y - sys.z.dot(&a);
        results.save(
            pos,
            &UpdateInformation {
                e,
                v: rec.f,
                m: DVector::zeros(0),
            },
        );
        a = &sys.t * &a + &rec.k * (e / rec.f);

        if steady.is_none() {
            if rec.advance(&sys.t, &sys.z, config.tolerance) {
                debug!("CKMS steady state reached at period {}", pos + 1);
                steady = Some(SteadyState {
                    position: pos + 1,
                    f: rec.f,
                    k: rec.k.clone(),
                });
            } else {
                iterations += 1;
                if iterations >= config.max_iter {
                    return Err(SsfError::CkmsNotConverged { iterations });
                }
            }
        }
    }
    Ok(steady)
}

/// Exact diffuse initialization followed by the CKMS recursions.
pub fn ckms_filter<R>(
    ssf: &Ssf,
    data: &[Option<f64>],
    config: &CkmsConfig,
    results: &mut R,
) -> Result<Option<SteadyState>>
where
    R: DiffuseFilteringResults + ?Sized,
{
    if !ssf.is_time_invariant() {
        return Err(SsfError::Model(
            "the CKMS filter requires a time-invariant model".into(),
        ));
    }
    let (end, state) = DiffuseInitializer::new(ssf).initialize(data, results)?;
    ckms_ordinary_filter(ssf, data, end, state, config, results)
}
