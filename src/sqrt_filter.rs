//! Array (square-root) Kalman filter.
//!
//! The predicted covariance is carried as a factor L with P = L L'. One step
//! triangularizes the pre-array
//!
//! ```text
//!   [ sqrt(H)  Z'L  0 ]        [ sqrt(F)  0     0 ]
//!   [ 0        TL   S ]  Q  =  [ Kb       L+    0 ]
//! ```
//!
//! with Q orthogonal, giving sqrt(F), the normalized gain Kb = T P Z / sqrt(F)
//! and the next factor L+ at once. P never has to be formed.

use nalgebra::{DMatrix, DVector};

use crate::error::{Result, SsfError};
use crate::initialization::DiffuseInitializer;
use crate::kalman::{DiffuseFilteringResults, FilteringResults};
use crate::state::{State, UpdateInformation};
use crate::state_space::{Ssf, SystemCache};

/// Lower-triangular L with L L' = A A', A having at least as many columns as
/// rows. Diagonal of L is non-negative.
pub fn tria(a: &DMatrix<f64>) -> DMatrix<f64> {
    let n = a.nrows();
    if a.ncols() < n {
        let mut padded = DMatrix::zeros(n, n);
        padded.columns_mut(0, a.ncols()).copy_from(a);
        return tria(&padded);
    }
    let mut r = a.transpose().qr().r();
    for i in 0..r.nrows() {
        if r[(i, i)] < 0.0 {
            r.row_mut(i).neg_mut();
        }
    }
    r.transpose()
}

/// Factor L of a covariance matrix, P = L L' (d x d).
///
/// Cholesky when P is positive definite, otherwise a symmetric eigen
/// decomposition with negative eigenvalues set to zero.
pub fn covariance_factor(p: &DMatrix<f64>) -> DMatrix<f64> {
    if let Some(chol) = p.clone().cholesky() {
        return chol.l();
    }
    let eig = p.clone().symmetric_eigen();
    let mut l = eig.eigenvectors;
    for (j, lambda) in eig.eigenvalues.iter().enumerate() {
        let sd = lambda.max(0.0).sqrt();
        l.column_mut(j).scale_mut(sd);
    }
    l
}

/// Square-root filter on the ordinary phase, from the predicted state at
/// `start`. Returns the prediction for `data.len()`.
pub fn sqrt_ordinary_filter<R>(
    ssf: &Ssf,
    data: &[Option<f64>],
    start: usize,
    state: State,
    results: &mut R,
) -> Result<State>
where
    R: FilteringResults + ?Sized,
{
    let d = ssf.dim();
    let cache = SystemCache::new(ssf);
    let mut a = state.a;
    let mut l = covariance_factor(&state.p);

    for (pos, obs) in data.iter().enumerate().skip(start) {
        let m = cache.at(pos);
        if results.needs_states() {
            results.save_state(pos, &State::new(a.clone(), &l * l.transpose()));
        }
        let q = m.s.ncols();
        let tl = &m.t * &l;
        match *obs {
            None => {
                results.save_missing(pos);
                let mut pre = DMatrix::zeros(d, d + q);
                pre.columns_mut(0, d).copy_from(&tl);
                pre.columns_mut(d, q).copy_from(&m.s);
                l = tria(&pre);
                a = &m.t * &a;
            }
            Some(y) => {
                let zl = l.tr_mul(&m.z);
                let mut pre = DMatrix::zeros(d + 1, 1 + d + q);
                pre[(0, 0)] = m.h.sqrt();
                pre.view_mut((0, 1), (1, d)).copy_from(&zl.transpose());
                pre.view_mut((1, 1), (d, d)).copy_from(&tl);
                pre.view_mut((1, 1 + d), (d, q)).copy_from(&m.s);
                let post = tria(&pre);

                let sqrt_f = post[(0, 0)];
                let f = sqrt_f * sqrt_f;
                if f <= State::ZERO {
                    return Err(SsfError::NonPositiveVariance { pos, variance: f });
                }
                let e = y - m.z.dot(&a);
                let info = UpdateInformation {
                    e,
                    v: f,
                    m: &l * &zl,
                };
                results.save(pos, &info);

                let kb: DVector<f64> = post.view((1, 0), (d, 1)).column(0).into_owned();
                a = &m.t * &a + kb * (e / sqrt_f);
                l = post.view((1, 1), (d, d)).into_owned();
            }
        }
    }
    Ok(State::new(a, &l * l.transpose()))
}

/// Exact diffuse initialization followed by the square-root filter.
pub fn sqrt_filter<R>(ssf: &Ssf, data: &[Option<f64>], results: &mut R) -> Result<State>
where
    R: DiffuseFilteringResults + ?Sized,
{
    let (end, state) = DiffuseInitializer::new(ssf).initialize(data, results)?;
    sqrt_ordinary_filter(ssf, data, end, state, results)
}
