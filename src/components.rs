//! Structural model families: level, trend, seasonal, noise and regression
//! blocks. Each one implements the three state roles and can be wrapped into
//! an [`SsfComponent`](crate::state_space::SsfComponent).

use std::f64::consts::PI;

use nalgebra::{DMatrix, DVector};

use crate::error::{Result, SsfError};
use crate::state_space::{SsfDynamics, SsfInitialization, SsfLoading};

fn check_variance(name: &str, v: f64) -> Result<f64> {
    if !v.is_finite() || v < 0.0 {
        return Err(SsfError::Model(format!(
            "{} variance must be finite and >= 0, got {}",
            name, v
        )));
    }
    Ok(v)
}

/// Random walk: mu_{t+1} = mu_t + eta_t, diffuse start.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalLevel {
    variance: f64,
}

impl LocalLevel {
    pub fn new(variance: f64) -> Result<Self> {
        Ok(Self {
            variance: check_variance("level", variance)?,
        })
    }

    pub fn variance(&self) -> f64 {
        self.variance
    }
}

impl SsfInitialization for LocalLevel {
    fn dim(&self) -> usize {
        1
    }
    fn diffuse_dim(&self) -> usize {
        1
    }
    fn a0(&self) -> Result<DVector<f64>> {
        Ok(DVector::zeros(1))
    }
    fn pf0(&self) -> Result<DMatrix<f64>> {
        Ok(DMatrix::zeros(1, 1))
    }
    fn diffuse_constraints(&self) -> DMatrix<f64> {
        DMatrix::identity(1, 1)
    }
}

impl SsfDynamics for LocalLevel {
    fn innovations_dim(&self) -> usize {
        1
    }
    fn is_time_invariant(&self) -> bool {
        true
    }
    fn t(&self, _pos: usize) -> DMatrix<f64> {
        DMatrix::identity(1, 1)
    }
    fn s(&self, _pos: usize) -> DMatrix<f64> {
        DMatrix::from_element(1, 1, self.variance.sqrt())
    }
}

impl SsfLoading for LocalLevel {
    fn is_time_invariant(&self) -> bool {
        true
    }
    fn z(&self, _pos: usize) -> DVector<f64> {
        DVector::from_element(1, 1.0)
    }
}

/// Level and slope:
///   mu_{t+1} = mu_t + nu_t + eta_t
///   nu_{t+1} = nu_t + zeta_t
#[derive(Debug, Clone, PartialEq)]
pub struct LocalLinearTrend {
    level_variance: f64,
    slope_variance: f64,
}

impl LocalLinearTrend {
    pub fn new(level_variance: f64, slope_variance: f64) -> Result<Self> {
        Ok(Self {
            level_variance: check_variance("level", level_variance)?,
            slope_variance: check_variance("slope", slope_variance)?,
        })
    }
}

impl SsfInitialization for LocalLinearTrend {
    fn dim(&self) -> usize {
        2
    }
    fn diffuse_dim(&self) -> usize {
        2
    }
    fn a0(&self) -> Result<DVector<f64>> {
        Ok(DVector::zeros(2))
    }
    fn pf0(&self) -> Result<DMatrix<f64>> {
        Ok(DMatrix::zeros(2, 2))
    }
    fn diffuse_constraints(&self) -> DMatrix<f64> {
        DMatrix::identity(2, 2)
    }
}

impl SsfDynamics for LocalLinearTrend {
    fn innovations_dim(&self) -> usize {
        2
    }
    fn is_time_invariant(&self) -> bool {
        true
    }
    fn t(&self, _pos: usize) -> DMatrix<f64> {
        DMatrix::from_row_slice(2, 2, &[1.0, 1.0, 0.0, 1.0])
    }
    fn s(&self, _pos: usize) -> DMatrix<f64> {
        let mut s = DMatrix::zeros(2, 2);
        s[(0, 0)] = self.level_variance.sqrt();
        s[(1, 1)] = self.slope_variance.sqrt();
        s
    }
}

impl SsfLoading for LocalLinearTrend {
    fn is_time_invariant(&self) -> bool {
        true
    }
    fn z(&self, _pos: usize) -> DVector<f64> {
        DVector::from_vec(vec![1.0, 0.0])
    }
}

/// Seasonal specification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeasonalModel {
    /// gamma_{t+1} = -(gamma_t + ... + gamma_{t-s+2}) + omega_t
    Dummy,
    /// Sum of s/2 stochastic trigonometric cycles with a common variance.
    Trigonometric,
}

/// Seasonal block of period `period` (state dimension period - 1, fully diffuse).
#[derive(Debug, Clone, PartialEq)]
pub struct Seasonal {
    period: usize,
    model: SeasonalModel,
    variance: f64,
}

impl Seasonal {
    pub fn new(period: usize, model: SeasonalModel, variance: f64) -> Result<Self> {
        if period < 2 {
            return Err(SsfError::Model(format!(
                "seasonal period must be >= 2, got {}",
                period
            )));
        }
        Ok(Self {
            period,
            model,
            variance: check_variance("seasonal", variance)?,
        })
    }

    pub fn period(&self) -> usize {
        self.period
    }

    pub fn model(&self) -> SeasonalModel {
        self.model
    }

    fn n_pairs(&self) -> usize {
        (self.period - 1) / 2
    }
}

impl SsfInitialization for Seasonal {
    fn dim(&self) -> usize {
        self.period - 1
    }
    fn diffuse_dim(&self) -> usize {
        self.period - 1
    }
    fn a0(&self) -> Result<DVector<f64>> {
        Ok(DVector::zeros(self.period - 1))
    }
    fn pf0(&self) -> Result<DMatrix<f64>> {
        let d = self.period - 1;
        Ok(DMatrix::zeros(d, d))
    }
    fn diffuse_constraints(&self) -> DMatrix<f64> {
        let d = self.period - 1;
        DMatrix::identity(d, d)
    }
}

impl SsfDynamics for Seasonal {
    fn innovations_dim(&self) -> usize {
        match self.model {
            SeasonalModel::Dummy => 1,
            SeasonalModel::Trigonometric => self.period - 1,
        }
    }

    fn is_time_invariant(&self) -> bool {
        true
    }

    fn t(&self, _pos: usize) -> DMatrix<f64> {
        let d = self.period - 1;
        let mut t = DMatrix::zeros(d, d);
        match self.model {
            SeasonalModel::Dummy => {
                for j in 0..d {
                    t[(0, j)] = -1.0;
                }
                for i in 1..d {
                    t[(i, i - 1)] = 1.0;
                }
            }
            SeasonalModel::Trigonometric => {
                for j in 0..self.n_pairs() {
                    let lambda = 2.0 * PI * (j + 1) as f64 / self.period as f64;
                    let (sin, cos) = lambda.sin_cos();
                    let i = 2 * j;
                    t[(i, i)] = cos;
                    t[(i, i + 1)] = sin;
                    t[(i + 1, i)] = -sin;
                    t[(i + 1, i + 1)] = cos;
                }
                if self.period % 2 == 0 {
                    t[(d - 1, d - 1)] = -1.0;
                }
            }
        }
        t
    }

    fn s(&self, _pos: usize) -> DMatrix<f64> {
        let d = self.period - 1;
        let sd = self.variance.sqrt();
        match self.model {
            SeasonalModel::Dummy => {
                let mut s = DMatrix::zeros(d, 1);
                s[(0, 0)] = sd;
                s
            }
            SeasonalModel::Trigonometric => DMatrix::identity(d, d) * sd,
        }
    }
}

impl SsfLoading for Seasonal {
    fn is_time_invariant(&self) -> bool {
        true
    }

    fn z(&self, _pos: usize) -> DVector<f64> {
        let d = self.period - 1;
        let mut z = DVector::zeros(d);
        match self.model {
            SeasonalModel::Dummy => z[0] = 1.0,
            SeasonalModel::Trigonometric => {
                for j in 0..self.n_pairs() {
                    z[2 * j] = 1.0;
                }
                if self.period % 2 == 0 {
                    z[d - 1] = 1.0;
                }
            }
        }
        z
    }
}

/// White noise carried in the state (irregular as a component).
#[derive(Debug, Clone, PartialEq)]
pub struct Noise {
    variance: f64,
}

impl Noise {
    pub fn new(variance: f64) -> Result<Self> {
        Ok(Self {
            variance: check_variance("noise", variance)?,
        })
    }
}

impl SsfInitialization for Noise {
    fn dim(&self) -> usize {
        1
    }
    fn diffuse_dim(&self) -> usize {
        0
    }
    fn a0(&self) -> Result<DVector<f64>> {
        Ok(DVector::zeros(1))
    }
    fn pf0(&self) -> Result<DMatrix<f64>> {
        Ok(DMatrix::from_element(1, 1, self.variance))
    }
    fn diffuse_constraints(&self) -> DMatrix<f64> {
        DMatrix::zeros(1, 0)
    }
}

impl SsfDynamics for Noise {
    fn innovations_dim(&self) -> usize {
        1
    }
    fn is_time_invariant(&self) -> bool {
        true
    }
    fn t(&self, _pos: usize) -> DMatrix<f64> {
        DMatrix::zeros(1, 1)
    }
    fn s(&self, _pos: usize) -> DMatrix<f64> {
        DMatrix::from_element(1, 1, self.variance.sqrt())
    }
}

impl SsfLoading for Noise {
    fn is_time_invariant(&self) -> bool {
        true
    }
    fn z(&self, _pos: usize) -> DVector<f64> {
        DVector::from_element(1, 1.0)
    }
}

/// Fixed regression effects x_t' beta with diffuse beta. The loading is the
/// regressor row at each period (zero beyond the sample).
#[derive(Debug, Clone, PartialEq)]
pub struct Regression {
    x: DMatrix<f64>,
}

impl Regression {
    /// `x` is n x k, one row per period.
    pub fn new(x: DMatrix<f64>) -> Result<Self> {
        if x.ncols() == 0 {
            return Err(SsfError::Model("regression needs at least one regressor".into()));
        }
        if x.iter().any(|v| !v.is_finite()) {
            return Err(SsfError::Model("regressors must be finite".into()));
        }
        Ok(Self { x })
    }

    pub fn from_columns(columns: &[Vec<f64>]) -> Result<Self> {
        let k = columns.len();
        let n = columns.first().map_or(0, |c| c.len());
        if let Some((j, c)) = columns.iter().enumerate().find(|(_, c)| c.len() != n) {
            return Err(SsfError::DataError(format!(
                "regressor {} has {} rows, expected {}",
                j,
                c.len(),
                n
            )));
        }
        Regression::new(DMatrix::from_fn(n, k, |i, j| columns[j][i]))
    }

    pub fn n_regressors(&self) -> usize {
        self.x.ncols()
    }
}

impl SsfInitialization for Regression {
    fn dim(&self) -> usize {
        self.x.ncols()
    }
    fn diffuse_dim(&self) -> usize {
        self.x.ncols()
    }
    fn a0(&self) -> Result<DVector<f64>> {
        Ok(DVector::zeros(self.x.ncols()))
    }
    fn pf0(&self) -> Result<DMatrix<f64>> {
        let k = self.x.ncols();
        Ok(DMatrix::zeros(k, k))
    }
    fn diffuse_constraints(&self) -> DMatrix<f64> {
        let k = self.x.ncols();
        DMatrix::identity(k, k)
    }
}

impl SsfDynamics for Regression {
    fn innovations_dim(&self) -> usize {
        0
    }
    fn is_time_invariant(&self) -> bool {
        true
    }
    fn t(&self, _pos: usize) -> DMatrix<f64> {
        let k = self.x.ncols();
        DMatrix::identity(k, k)
    }
    fn s(&self, _pos: usize) -> DMatrix<f64> {
        DMatrix::zeros(self.x.ncols(), 0)
    }
}

impl SsfLoading for Regression {
    fn is_time_invariant(&self) -> bool {
        false
    }
    fn z(&self, pos: usize) -> DVector<f64> {
        if pos < self.x.nrows() {
            self.x.row(pos).transpose()
        } else {
            DVector::zeros(self.x.ncols())
        }
    }
}
