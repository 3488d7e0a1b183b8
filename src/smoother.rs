//! Fixed-interval smoother (Durbin-Koopman disturbance form).
//!
//! Ordinary periods, backwards from r_{n-1} = 0, N_{n-1} = 0:
//!   L_t     = T - K Z',  K = T P Z / F
//!   r_{t-1} = Z e / F + L_t' r_t
//!   N_{t-1} = Z Z' / F + L_t' N_t L_t
//!   a^_t    = a_t + P_t r_{t-1},  V_t = P_t - P_t N_{t-1} P_t
//!
//! Diffuse periods use the exact initial recursions on (r0, r1) and
//! (N0, N1, N2).

use nalgebra::{DMatrix, DVector};

use crate::composite::CompositeSsf;
use crate::error::{Result, SsfError};
use crate::initialization::DiffuseUpdateInformation;
use crate::state::{symmetrize, State};
use crate::state_space::{Ssf, SystemCache};
use crate::storage::{FilteringStorage, PeriodInfo};

/// Smoothed states a_{t|n} and their covariances V_{t|n}.
#[derive(Debug, Clone)]
pub struct SmoothingResults {
    a: Vec<DVector<f64>>,
    v: Vec<DMatrix<f64>>,
}

impl SmoothingResults {
    pub fn len(&self) -> usize {
        self.a.len()
    }

    pub fn is_empty(&self) -> bool {
        self.a.is_empty()
    }

    pub fn a(&self, pos: usize) -> Option<&DVector<f64>> {
        self.a.get(pos)
    }

    pub fn v(&self, pos: usize) -> Option<&DMatrix<f64>> {
        self.v.get(pos)
    }

    /// Smoothed mean of state element `item` over all periods.
    pub fn item(&self, item: usize) -> Vec<f64> {
        self.a.iter().map(|a| a[item]).collect()
    }

    /// Smoothed mean of component `i` of a composite model at `pos`.
    pub fn component_mean(&self, model: &CompositeSsf, i: usize, pos: usize) -> Result<DVector<f64>> {
        let range = model.component_range(i)?;
        let a = self.at(pos)?;
        Ok(a.rows(range.start, range.len()).into_owned())
    }

    /// Smoothed covariance block of component `i` at `pos`.
    pub fn component_variance(
        &self,
        model: &CompositeSsf,
        i: usize,
        pos: usize,
    ) -> Result<DMatrix<f64>> {
        let range = model.component_range(i)?;
        let v = self.v.get(pos).ok_or_else(|| out_of_range(pos, self.len()))?;
        Ok(v.view((range.start, range.start), (range.len(), range.len())).into_owned())
    }

    /// Smoothed signal Z_i' a_i of component `i` over all periods.
    pub fn component_signal(&self, model: &CompositeSsf, i: usize) -> Result<Vec<f64>> {
        (0..self.len())
            .map(|pos| model.component_signal(pos, &self.a[pos], i))
            .collect()
    }

    fn at(&self, pos: usize) -> Result<&DVector<f64>> {
        self.a.get(pos).ok_or_else(|| out_of_range(pos, self.len()))
    }
}

fn out_of_range(pos: usize, len: usize) -> SsfError {
    SsfError::DataError(format!("period {} out of range ({} periods)", pos, len))
}

/// Filter `data` and smooth the result.
pub fn smooth(ssf: &Ssf, data: &[Option<f64>]) -> Result<SmoothingResults> {
    let storage = FilteringStorage::filter(ssf, data)?;
    smooth_storage(ssf, &storage)
}

/// Backward pass over a stored filter trajectory.
pub fn smooth_storage(ssf: &Ssf, storage: &FilteringStorage) -> Result<SmoothingResults> {
    let n = storage.len();
    let d = ssf.dim();
    let cache = SystemCache::new(ssf);
    let mut a_s = vec![DVector::zeros(d); n];
    let mut v_s = vec![DMatrix::zeros(d, d); n];

    let mut r = DVector::zeros(d);
    let mut nm = DMatrix::zeros(d, d);
    let end = storage.diffuse_end();

    for pos in (end..n).rev() {
        let m = cache.at(pos);
        let state = predicted(storage, pos)?;
        match storage.info(pos) {
            Some(PeriodInfo::Ordinary(info)) => {
                let k = &m.t * &info.m / info.v;
                let mut l = m.t.clone();
                l.ger(-1.0, &k, &m.z, 1.0);
                r = &m.z * (info.e / info.v) + l.tr_mul(&r);
                nm = &m.z * m.z.transpose() / info.v + l.transpose() * &nm * &l;
            }
            _ => {
                r = m.t.tr_mul(&r);
                nm = m.t.transpose() * &nm * &m.t;
            }
        }
        symmetrize(&mut nm);
        a_s[pos] = &state.a + &state.p * &r;
        let mut v = &state.p - &state.p * &nm * &state.p;
        symmetrize(&mut v);
        v_s[pos] = v;
    }

    if end > 0 {
        let mut sm = DiffuseSmoother {
            r0: r,
            r1: DVector::zeros(d),
            n0: nm,
            n1: DMatrix::zeros(d, d),
            n2: DMatrix::zeros(d, d),
        };
        for pos in (0..end).rev() {
            let m = cache.at(pos);
            let state = predicted(storage, pos)?;
            let pi = storage.pi(pos).ok_or_else(|| {
                SsfError::DataError(format!("no diffuse covariance stored for period {}", pos))
            })?;
            match storage.info(pos) {
                Some(PeriodInfo::Diffuse(info)) => sm.update(&m.t, &m.z, info),
                _ => sm.skip(&m.t),
            }
            a_s[pos] = &state.a + &state.p * &sm.r0 + pi * &sm.r1;
            v_s[pos] = sm.variance(&state.p, pi);
        }
    }

    Ok(SmoothingResults { a: a_s, v: v_s })
}

fn predicted(storage: &FilteringStorage, pos: usize) -> Result<&State> {
    storage
        .predicted(pos)
        .ok_or_else(|| SsfError::DataError(format!("no predicted state stored for period {}", pos)))
}

struct DiffuseSmoother {
    r0: DVector<f64>,
    r1: DVector<f64>,
    n0: DMatrix<f64>,
    n1: DMatrix<f64>,
    n2: DMatrix<f64>,
}

impl DiffuseSmoother {
    fn update(&mut self, t: &DMatrix<f64>, z: &DVector<f64>, info: &DiffuseUpdateInformation) {
        let zz = z * z.transpose();
        if info.is_diffuse() {
            let f1 = 1.0 / info.fi;
            let f2 = -info.f * f1 * f1;
            let k0 = t * &info.mi * f1;
            let k1 = t * (&info.m * f1 + &info.mi * f2);
            let mut l0 = t.clone();
            l0.ger(-1.0, &k0, z, 1.0);
            let l1 = -(&k1 * z.transpose());

            let r1 = z * (info.e * f1) + l0.tr_mul(&self.r1) + l1.tr_mul(&self.r0);
            let r0 = l0.tr_mul(&self.r0);

            let l0t = l0.transpose();
            let l1t = l1.transpose();
            let n0 = &l0t * &self.n0 * &l0;
            // N1 pairs Pi on the left with Pf on the right and is not symmetric.
            let n1 = &zz * f1 + &l0t * &self.n1 * &l0 + &l1t * &self.n0 * &l0;
            let n2 = &zz * f2
                + &l0t * &self.n2 * &l0
                + &l0t * &self.n1 * &l1
                + &l1t * self.n1.transpose() * &l0
                + &l1t * &self.n0 * &l1;

            self.r0 = r0;
            self.r1 = r1;
            self.n0 = n0;
            self.n1 = n1;
            self.n2 = n2;
        } else {
            let k0 = t * &info.m / info.f;
            let mut l0 = t.clone();
            l0.ger(-1.0, &k0, z, 1.0);
            let l0t = l0.transpose();
            self.r0 = z * (info.e / info.f) + l0.tr_mul(&self.r0);
            self.r1 = t.tr_mul(&self.r1);
            self.n0 = &zz / info.f + &l0t * &self.n0 * &l0;
            self.n1 = t.transpose() * &self.n1 * &l0;
            self.n2 = t.transpose() * &self.n2 * t;
        }
        symmetrize(&mut self.n0);
        symmetrize(&mut self.n2);
    }

    fn skip(&mut self, t: &DMatrix<f64>) {
        let tt = t.transpose();
        self.r0 = t.tr_mul(&self.r0);
        self.r1 = t.tr_mul(&self.r1);
        self.n0 = &tt * &self.n0 * t;
        self.n1 = &tt * &self.n1 * t;
        self.n2 = &tt * &self.n2 * t;
    }

    /// V = Pf - Pf N0 Pf - (Pi N1 Pf)' - Pi N1 Pf - Pi N2 Pi
    fn variance(&self, pf: &DMatrix<f64>, pi: &DMatrix<f64>) -> DMatrix<f64> {
        let pin1pf = pi * &self.n1 * pf;
        let mut v = pf - pf * &self.n0 * pf - pin1pf.transpose() - &pin1pf - pi * &self.n2 * pi;
        symmetrize(&mut v);
        v
    }
}
