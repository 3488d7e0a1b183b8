//! Linear Gaussian state-space description.
//!
//! State equation:  a_{t+1} = T_t * a_t + S_t * eta_t,   eta_t ~ N(0, I)
//! Observation:     y_t     = Z_t' * a_t + eps_t,        eps_t ~ N(0, H_t)
//!
//! The initial state is a_0 = a0 + B * delta + xi, with xi ~ N(0, Pf0) and
//! delta a vector of `diffuse_dim` diffuse (infinite-variance) effects, so
//! that Pi0 = B * B'.
//!
//! A model is split along four roles (initialization, dynamics, loading,
//! measurement error). Model families implement the first three on one struct
//! and are wrapped into an [`SsfComponent`]; components are combined by
//! [`crate::composite::CompositeSsf`].

use std::borrow::Cow;
use std::sync::Arc;

use nalgebra::{DMatrix, DVector};

use crate::error::{Result, SsfError};
use crate::state::State;

/// Initial distribution of the state vector.
pub trait SsfInitialization: Send + Sync {
    /// State dimension `d`.
    fn dim(&self) -> usize;

    /// Number of diffuse directions `nd` (0 <= nd <= d).
    fn diffuse_dim(&self) -> usize;

    /// Finite part of the initial mean.
    fn a0(&self) -> Result<DVector<f64>>;

    /// Finite part of the initial covariance (d x d).
    fn pf0(&self) -> Result<DMatrix<f64>>;

    /// Basis B (d x nd) of the diffuse directions.
    fn diffuse_constraints(&self) -> DMatrix<f64>;

    /// Pi0 = B * B'.
    fn pi0(&self) -> DMatrix<f64> {
        let b = self.diffuse_constraints();
        &b * b.transpose()
    }
}

/// Transition of the state between t and t+1.
pub trait SsfDynamics: Send + Sync {
    /// Number of columns of the innovation loading S.
    fn innovations_dim(&self) -> usize;

    fn is_time_invariant(&self) -> bool;

    /// Transition matrix T(pos), d x d.
    fn t(&self, pos: usize) -> DMatrix<f64>;

    /// Innovation loading S(pos), d x innovations_dim, with V = S * S'.
    fn s(&self, pos: usize) -> DMatrix<f64>;

    /// Innovation covariance V(pos).
    fn v(&self, pos: usize) -> DMatrix<f64> {
        let s = self.s(pos);
        &s * s.transpose()
    }
}

/// Observation loading.
pub trait SsfLoading: Send + Sync {
    fn is_time_invariant(&self) -> bool;

    /// Loading vector Z(pos), length d.
    fn z(&self, pos: usize) -> DVector<f64>;
}

/// Measurement-noise variance of a univariate observation.
pub trait SsfMeasurement: Send + Sync {
    fn is_time_invariant(&self) -> bool {
        true
    }

    fn h(&self, pos: usize) -> f64;
}

/// Constant measurement-noise variance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConstantMeasurement(pub f64);

impl SsfMeasurement for ConstantMeasurement {
    fn h(&self, _pos: usize) -> f64 {
        self.0
    }
}

/// Time-invariant loading vector.
#[derive(Debug, Clone, PartialEq)]
pub struct ConstantLoading(pub DVector<f64>);

impl SsfLoading for ConstantLoading {
    fn is_time_invariant(&self) -> bool {
        true
    }

    fn z(&self, _pos: usize) -> DVector<f64> {
        self.0.clone()
    }
}

/// The three state roles of one model block, shared between models.
#[derive(Clone)]
pub struct SsfComponent {
    pub initialization: Arc<dyn SsfInitialization>,
    pub dynamics: Arc<dyn SsfDynamics>,
    pub loading: Arc<dyn SsfLoading>,
}

impl SsfComponent {
    /// Wrap a model family implementing all three state roles.
    pub fn new<C>(component: C) -> Self
    where
        C: SsfInitialization + SsfDynamics + SsfLoading + 'static,
    {
        let c = Arc::new(component);
        let initialization: Arc<dyn SsfInitialization> = c.clone();
        let dynamics: Arc<dyn SsfDynamics> = c.clone();
        let loading: Arc<dyn SsfLoading> = c;
        Self {
            initialization,
            dynamics,
            loading,
        }
    }

    pub fn dim(&self) -> usize {
        self.initialization.dim()
    }

    pub fn is_time_invariant(&self) -> bool {
        self.dynamics.is_time_invariant() && self.loading.is_time_invariant()
    }
}

/// A complete univariate state-space model.
#[derive(Clone)]
pub struct Ssf {
    pub initialization: Arc<dyn SsfInitialization>,
    pub dynamics: Arc<dyn SsfDynamics>,
    pub loading: Arc<dyn SsfLoading>,
    pub measurement: Option<Arc<dyn SsfMeasurement>>,
}

impl std::fmt::Debug for Ssf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ssf")
            .field("dim", &self.dim())
            .field("diffuse_dim", &self.diffuse_dim())
            .field("measurement", &self.measurement.is_some())
            .finish()
    }
}

impl Ssf {
    /// Build a model and check that all roles agree on the state dimension.
    pub fn new(
        component: SsfComponent,
        measurement: Option<Arc<dyn SsfMeasurement>>,
    ) -> Result<Self> {
        let ssf = Self {
            initialization: component.initialization,
            dynamics: component.dynamics,
            loading: component.loading,
            measurement,
        };
        ssf.validate()?;
        Ok(ssf)
    }

    /// Convenience constructor for a single model family.
    pub fn from_component<C>(component: C, measurement_variance: Option<f64>) -> Result<Self>
    where
        C: SsfInitialization + SsfDynamics + SsfLoading + 'static,
    {
        let measurement = match measurement_variance {
            Some(h) => Some(Arc::new(ConstantMeasurement(h)) as Arc<dyn SsfMeasurement>),
            None => None,
        };
        Ssf::new(SsfComponent::new(component), measurement)
    }

    pub fn dim(&self) -> usize {
        self.initialization.dim()
    }

    pub fn diffuse_dim(&self) -> usize {
        self.initialization.diffuse_dim()
    }

    pub fn h(&self, pos: usize) -> f64 {
        self.measurement.as_ref().map_or(0.0, |m| m.h(pos))
    }

    pub fn is_time_invariant(&self) -> bool {
        self.dynamics.is_time_invariant()
            && self.loading.is_time_invariant()
            && self.measurement.as_ref().map_or(true, |m| m.is_time_invariant())
    }

    /// System matrices at `pos`.
    pub fn matrices(&self, pos: usize) -> SystemMatrices {
        SystemMatrices {
            t: self.dynamics.t(pos),
            s: self.dynamics.s(pos),
            z: self.loading.z(pos),
            h: self.h(pos),
        }
    }

    /// Initial state (a0, Pf0), ignoring the diffuse part.
    pub fn initial_state(&self) -> Result<State> {
        State::from_initialization(self.initialization.as_ref())
    }

    fn validate(&self) -> Result<()> {
        let d = self.dim();
        if d == 0 {
            return Err(SsfError::Model("state dimension must be > 0".into()));
        }
        let nd = self.diffuse_dim();
        if nd > d {
            return Err(SsfError::Model(format!(
                "diffuse dimension {} exceeds state dimension {}",
                nd, d
            )));
        }

        let m = self.matrices(0);
        if m.t.nrows() != d || m.t.ncols() != d {
            return Err(SsfError::Model(format!(
                "T matrix dimension mismatch: expected {}x{}, got {}x{}",
                d,
                d,
                m.t.nrows(),
                m.t.ncols()
            )));
        }
        if m.s.nrows() != d || m.s.ncols() != self.dynamics.innovations_dim() {
            return Err(SsfError::Model(format!(
                "S matrix dimension mismatch: expected {}x{}, got {}x{}",
                d,
                self.dynamics.innovations_dim(),
                m.s.nrows(),
                m.s.ncols()
            )));
        }
        if m.z.len() != d {
            return Err(SsfError::Model(format!(
                "Z vector length mismatch: expected {}, got {}",
                d,
                m.z.len()
            )));
        }
        if !m.h.is_finite() || m.h < 0.0 {
            return Err(SsfError::Model(format!(
                "measurement variance must be finite and >= 0, got {}",
                m.h
            )));
        }

        let b = self.initialization.diffuse_constraints();
        if b.nrows() != d || b.ncols() != nd {
            return Err(SsfError::Model(format!(
                "diffuse constraints must be {}x{}, got {}x{}",
                d,
                nd,
                b.nrows(),
                b.ncols()
            )));
        }
        if nd > 0 {
            let rank = numerical_rank(&b);
            if rank != nd {
                return Err(SsfError::Model(format!(
                    "diffuse constraints have rank {} but diffuse dimension is {}",
                    rank, nd
                )));
            }
        }
        Ok(())
    }
}

/// T, S, Z and H of one period.
#[derive(Debug, Clone)]
pub struct SystemMatrices {
    pub t: DMatrix<f64>,
    pub s: DMatrix<f64>,
    pub z: DVector<f64>,
    pub h: f64,
}

impl SystemMatrices {
    pub fn v(&self) -> DMatrix<f64> {
        &self.s * self.s.transpose()
    }
}

/// Hands out system matrices per period, computing them once for
/// time-invariant models.
pub(crate) struct SystemCache<'a> {
    ssf: &'a Ssf,
    fixed: Option<SystemMatrices>,
}

impl<'a> SystemCache<'a> {
    pub(crate) fn new(ssf: &'a Ssf) -> Self {
        let fixed = if ssf.is_time_invariant() {
            Some(ssf.matrices(0))
        } else {
            None
        };
        Self { ssf, fixed }
    }

    pub(crate) fn at(&self, pos: usize) -> Cow<'_, SystemMatrices> {
        match &self.fixed {
            Some(m) => Cow::Borrowed(m),
            None => Cow::Owned(self.ssf.matrices(pos)),
        }
    }
}

/// Number of singular values above `State::ZERO` relative to the largest one.
pub(crate) fn numerical_rank(m: &DMatrix<f64>) -> usize {
    if m.nrows() == 0 || m.ncols() == 0 {
        return 0;
    }
    let sv = m.clone().svd(false, false).singular_values;
    let smax = sv.iter().cloned().fold(0.0_f64, f64::max);
    if smax <= 0.0 {
        return 0;
    }
    sv.iter().filter(|&&s| s > State::ZERO * smax).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::{LocalLevel, LocalLinearTrend};

    struct BadInit;

    impl SsfInitialization for BadInit {
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
            // Two identical columns: rank 1.
            DMatrix::from_row_slice(2, 2, &[1.0, 1.0, 0.0, 0.0])
        }
    }

    #[test]
    fn test_from_component_dimensions() {
        let ssf = Ssf::from_component(LocalLinearTrend::new(0.1, 0.01).unwrap(), Some(1.0)).unwrap();
        assert_eq!(ssf.dim(), 2);
        assert_eq!(ssf.diffuse_dim(), 2);
        assert!(ssf.is_time_invariant());
        assert!((ssf.h(10) - 1.0).abs() < 1e-15);
        let m = ssf.matrices(3);
        assert!((m.t[(0, 1)] - 1.0).abs() < 1e-15);
        assert_eq!(m.z.len(), 2);
    }

    #[test]
    fn test_rank_deficient_diffuse_constraints_rejected() {
        let level = Arc::new(LocalLevel::new(1.0).unwrap());
        let trend = Arc::new(LocalLinearTrend::new(1.0, 1.0).unwrap());
        let component = SsfComponent {
            initialization: Arc::new(BadInit),
            dynamics: trend.clone(),
            loading: trend,
        };
        let err = Ssf::new(component, None).unwrap_err();
        assert!(matches!(err, SsfError::Model(_)), "{}", err);

        // Dimension mismatch between roles.
        let component = SsfComponent {
            initialization: Arc::new(BadInit),
            dynamics: level.clone(),
            loading: level,
        };
        assert!(Ssf::new(component, None).is_err());
    }

    #[test]
    fn test_negative_measurement_rejected() {
        let err = Ssf::from_component(LocalLevel::new(1.0).unwrap(), Some(-1.0)).unwrap_err();
        assert!(matches!(err, SsfError::Model(_)));
    }

    #[test]
    fn test_numerical_rank() {
        let m = DMatrix::from_row_slice(3, 2, &[1.0, 0.0, 0.0, 1.0, 0.0, 0.0]);
        assert_eq!(numerical_rank(&m), 2);
        let m = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 2.0, 4.0]);
        assert_eq!(numerical_rank(&m), 1);
    }
}
