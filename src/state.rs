use nalgebra::{DMatrix, DVector};

use crate::error::{Result, SsfError};
use crate::state_space::{SsfDynamics, SsfInitialization, SystemMatrices};

/// Gaussian belief on the state vector: mean `a` and covariance `p`.
///
/// In a filter pass the state holds the one-step-ahead prediction
/// a_{t|t-1}, P_{t|t-1} before `update` and the filtered a_{t|t}, P_{t|t}
/// after it.
#[derive(Debug, Clone, PartialEq)]
pub struct State {
    pub a: DVector<f64>,
    pub p: DMatrix<f64>,
}

impl State {
    /// Absolute tolerance used by every filter: variances at or below it are
    /// treated as zero, negative covariance diagonals above `-ZERO` are
    /// clamped to zero.
    ///
    /// The tolerance does not scale with the data. Models whose variances
    /// are all of the order of `ZERO` or smaller are taken as degenerate;
    /// such series should be rescaled, or fitted with a concentrated scale
    /// and variances expressed relative to it.
    pub const ZERO: f64 = 1e-9;

    pub fn new(a: DVector<f64>, p: DMatrix<f64>) -> Self {
        Self { a, p }
    }

    /// (a0, Pf0) of a model. The diffuse part is handled by the caller.
    pub fn from_initialization(init: &dyn SsfInitialization) -> Result<Self> {
        let d = init.dim();
        let a = init.a0()?;
        let p = init.pf0()?;
        if a.len() != d || p.nrows() != d || p.ncols() != d {
            return Err(SsfError::Initialization(format!(
                "initial state has dimension {} / {}x{}, expected {}",
                a.len(),
                p.nrows(),
                p.ncols(),
                d
            )));
        }
        if a.iter().any(|x| !x.is_finite()) || p.iter().any(|x| !x.is_finite()) {
            return Err(SsfError::Initialization(
                "initial state contains non-finite values".into(),
            ));
        }
        Ok(Self { a, p })
    }

    pub fn dim(&self) -> usize {
        self.a.len()
    }

    /// Prediction step: a <- T a, P <- T P T' + S S'.
    pub fn next(&mut self, pos: usize, dynamics: &dyn SsfDynamics) {
        let t = dynamics.t(pos);
        let s = dynamics.s(pos);
        self.predict(&t, &s);
    }

    pub(crate) fn next_with(&mut self, m: &SystemMatrices) {
        self.predict(&m.t, &m.s);
    }

    fn predict(&mut self, t: &DMatrix<f64>, s: &DMatrix<f64>) {
        self.a = t * &self.a;
        let mut p = t * &self.p * t.transpose();
        p.gemm(1.0, s, &s.transpose(), 1.0);
        symmetrize(&mut p);
        self.p = p;
    }

    /// Correction step: a <- a + M e / v, P <- P - M M' / v.
    ///
    /// The caller guarantees `info.v > ZERO`; missing observations skip this
    /// step entirely. Fails with `NegativeStateVariance` when a diagonal
    /// element of P drops below `-ZERO`.
    pub fn update(&mut self, pos: usize, info: &UpdateInformation) -> Result<()> {
        self.a.axpy(info.e / info.v, &info.m, 1.0);
        self.p.ger(-1.0 / info.v, &info.m, &info.m, 1.0);
        check_covariance(&mut self.p, pos)
    }
}

/// Per-observation scratch of the univariate filters.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateInformation {
    /// Prediction error y - Z'a.
    pub e: f64,
    /// Prediction error variance F = Z'PZ + H.
    pub v: f64,
    /// M = P Z, so that the gain is K = M / v.
    pub m: DVector<f64>,
}

impl UpdateInformation {
    /// Prediction error, its variance and P Z for observation `y`.
    pub fn compute(state: &State, z: &DVector<f64>, h: f64, y: f64) -> Self {
        let m = &state.p * z;
        let v = z.dot(&m) + h;
        let e = y - z.dot(&state.a);
        Self { e, v, m }
    }

    pub fn gain(&self) -> DVector<f64> {
        &self.m / self.v
    }

    pub fn standardized_residual(&self) -> f64 {
        self.e / self.v.sqrt()
    }
}

/// Force exact symmetry: P <- (P + P') / 2.
pub(crate) fn symmetrize(p: &mut DMatrix<f64>) {
    let n = p.nrows();
    for i in 0..n {
        for j in (i + 1)..n {
            let avg = 0.5 * (p[(i, j)] + p[(j, i)]);
            p[(i, j)] = avg;
            p[(j, i)] = avg;
        }
    }
}

/// Symmetrize and clamp tiny negative variances to zero.
pub(crate) fn check_covariance(p: &mut DMatrix<f64>, pos: usize) -> Result<()> {
    symmetrize(p);
    for i in 0..p.nrows() {
        let v = p[(i, i)];
        if v < 0.0 {
            if v < -State::ZERO {
                return Err(SsfError::NegativeStateVariance { pos, value: v });
            }
            p[(i, i)] = 0.0;
        }
    }
    Ok(())
}
