//! Vector observations: several equations share one state.
//!
//! y_t = Z_t a_t + eps_t, eps_t ~ N(0, H_t), Z_t stacking one loading per
//! equation. The update orthogonalizes the prediction errors with the
//! Cholesky factor R of F = Z P Z' + H, so with a single equation it reduces
//! to the univariate update (U = e / sqrt(F), K = P Z / sqrt(F)).
//! Diffuse effects are handled by augmentation. A present equation with zero
//! prediction error variance is an exact constraint on them: it is absorbed
//! when it involves the diffuse effects and dropped otherwise.

use std::sync::Arc;

use nalgebra::{DMatrix, DVector};

use crate::akf::AugmentedDiffuse;
use crate::error::{Result, SsfError};
use crate::likelihood::{DiffuseLikelihood, LikelihoodAccumulator};
use crate::state::{check_covariance, State};
use crate::state_space::{Ssf, SsfDynamics, SsfInitialization, SsfLoading};

/// Covariance of the measurement errors of all equations.
pub trait SsfMeasurements: Send + Sync {
    fn count(&self) -> usize;

    fn is_time_invariant(&self) -> bool {
        true
    }

    /// H(pos), count x count.
    fn h(&self, pos: usize) -> DMatrix<f64>;
}

/// Constant measurement covariance.
#[derive(Debug, Clone, PartialEq)]
pub struct ConstantMeasurements {
    h: DMatrix<f64>,
}

impl ConstantMeasurements {
    pub fn new(h: DMatrix<f64>) -> Result<Self> {
        if !h.is_square() {
            return Err(SsfError::Model(format!(
                "measurement covariance must be square, got {}x{}",
                h.nrows(),
                h.ncols()
            )));
        }
        if (&h - h.transpose()).amax() > State::ZERO || h.diagonal().iter().any(|v| *v < 0.0) {
            return Err(SsfError::Model(
                "measurement covariance must be symmetric with a non-negative diagonal".into(),
            ));
        }
        Ok(Self { h })
    }

    /// Independent measurement errors.
    pub fn diagonal(variances: &[f64]) -> Result<Self> {
        Self::new(DMatrix::from_diagonal(&DVector::from_column_slice(variances)))
    }
}

impl SsfMeasurements for ConstantMeasurements {
    fn count(&self) -> usize {
        self.h.nrows()
    }

    fn h(&self, _pos: usize) -> DMatrix<f64> {
        self.h.clone()
    }
}

/// State-space model with several observation equations.
#[derive(Clone)]
pub struct MultivariateSsf {
    pub initialization: Arc<dyn SsfInitialization>,
    pub dynamics: Arc<dyn SsfDynamics>,
    pub loadings: Vec<Arc<dyn SsfLoading>>,
    pub measurements: Option<Arc<dyn SsfMeasurements>>,
}

impl MultivariateSsf {
    pub fn new(
        initialization: Arc<dyn SsfInitialization>,
        dynamics: Arc<dyn SsfDynamics>,
        loadings: Vec<Arc<dyn SsfLoading>>,
        measurements: Option<Arc<dyn SsfMeasurements>>,
    ) -> Result<Self> {
        let d = initialization.dim();
        if loadings.is_empty() {
            return Err(SsfError::Model("multivariate model without equations".into()));
        }
        if let Some((i, z)) = loadings
            .iter()
            .map(|l| l.z(0))
            .enumerate()
            .find(|(_, z)| z.len() != d)
        {
            return Err(SsfError::Model(format!(
                "loading {} has length {}, expected {}",
                i,
                z.len(),
                d
            )));
        }
        if let Some(h) = &measurements {
            if h.count() != loadings.len() {
                return Err(SsfError::Model(format!(
                    "{} measurement variances for {} equations",
                    h.count(),
                    loadings.len()
                )));
            }
        }
        let t = dynamics.t(0);
        if t.shape() != (d, d) || dynamics.s(0).nrows() != d {
            return Err(SsfError::Model(format!(
                "dynamics do not match state dimension {}",
                d
            )));
        }
        Ok(Self {
            initialization,
            dynamics,
            loadings,
            measurements,
        })
    }

    /// Single-equation view of a univariate model.
    pub fn from_univariate(ssf: &Ssf) -> Result<Self> {
        let measurements: Option<Arc<dyn SsfMeasurements>> = match &ssf.measurement {
            Some(m) if m.is_time_invariant() => {
                Some(Arc::new(ConstantMeasurements::diagonal(&[m.h(0)])?))
            }
            Some(_) => {
                return Err(SsfError::Model(
                    "time-varying measurement noise is not supported here".into(),
                ))
            }
            None => None,
        };
        MultivariateSsf::new(
            ssf.initialization.clone(),
            ssf.dynamics.clone(),
            vec![ssf.loading.clone()],
            measurements,
        )
    }

    pub fn dim(&self) -> usize {
        self.initialization.dim()
    }

    pub fn equations(&self) -> usize {
        self.loadings.len()
    }

    /// Z(pos), one row per equation.
    pub fn z(&self, pos: usize) -> DMatrix<f64> {
        let d = self.dim();
        let mut z = DMatrix::zeros(self.loadings.len(), d);
        for (i, l) in self.loadings.iter().enumerate() {
            z.set_row(i, &l.z(pos).transpose());
        }
        z
    }

    pub fn h(&self, pos: usize) -> DMatrix<f64> {
        match &self.measurements {
            Some(m) => m.h(pos),
            None => DMatrix::zeros(self.loadings.len(), self.loadings.len()),
        }
    }
}

/// Update scratch for a vector observation.
#[derive(Debug, Clone, PartialEq)]
pub struct MultivariateUpdateInformation {
    /// Equations used at this period (present and non-degenerate).
    pub equations: Vec<usize>,
    /// Orthogonalized prediction errors R^-1 e.
    pub u: DVector<f64>,
    /// Lower Cholesky factor of the prediction error covariance.
    pub r: DMatrix<f64>,
    /// Gain P Z' R'^-1, so that a += K U and P -= K K'.
    pub k: DMatrix<f64>,
}

impl MultivariateUpdateInformation {
    /// Returns `None` when no usable equation is left.
    pub fn compute(
        pos: usize,
        state: &State,
        z: &DMatrix<f64>,
        h: &DMatrix<f64>,
        y: &[Option<f64>],
    ) -> Result<Option<Self>> {
        let present: Vec<usize> = (0..y.len()).filter(|&i| y[i].is_some()).collect();
        let zp_all = z * &state.p;
        // Drop equations with (numerically) zero variance.
        let equations: Vec<usize> = present
            .into_iter()
            .filter(|&i| zp_all.row(i).dot(&z.row(i)) + h[(i, i)] >= State::ZERO)
            .collect();
        if equations.is_empty() {
            return Ok(None);
        }
        let zs = z.select_rows(equations.iter());
        let zp = zp_all.select_rows(equations.iter());
        let hs = h.select_rows(equations.iter()).select_columns(equations.iter());
        let f = &zp * zs.transpose() + hs;
        let r = f
            .cholesky()
            .ok_or_else(|| {
                SsfError::CholeskyFailed(format!(
                    "prediction error covariance at period {} is not positive definite",
                    pos
                ))
            })?
            .l();

        let za = z * &state.a;
        let e = DVector::from_iterator(
            equations.len(),
            equations.iter().map(|&i| y[i].map_or(0.0, |v| v - za[i])),
        );
        let u = solve_lower(&r, &e, pos)?;
        let g = solve_lower_matrix(&r, &zp, pos)?;
        Ok(Some(Self {
            equations,
            u,
            r,
            k: g.transpose(),
        }))
    }
}

fn solve_lower(r: &DMatrix<f64>, b: &DVector<f64>, pos: usize) -> Result<DVector<f64>> {
    r.solve_lower_triangular(b).ok_or_else(|| {
        SsfError::CholeskyFailed(format!("singular Cholesky factor at period {}", pos))
    })
}

fn solve_lower_matrix(r: &DMatrix<f64>, b: &DMatrix<f64>, pos: usize) -> Result<DMatrix<f64>> {
    r.solve_lower_triangular(b).ok_or_else(|| {
        SsfError::CholeskyFailed(format!("singular Cholesky factor at period {}", pos))
    })
}

/// Receives the output of a multivariate filter pass.
pub trait MultivariateFilteringResults {
    fn save(&mut self, pos: usize, info: &MultivariateUpdateInformation);

    fn save_missing(&mut self, _pos: usize) {}

    /// Equation without noise turned into an exact constraint on the
    /// diffuse effects.
    fn save_absorbed(&mut self, _pos: usize, _equation: usize) {}
}

/// Augmented filter on vector observations. `data[pos]` holds one entry per
/// equation, `None` for an absent equation.
pub fn multivariate_filter<R>(
    ssf: &MultivariateSsf,
    data: &[Vec<Option<f64>>],
    results: &mut R,
) -> Result<AugmentedDiffuse>
where
    R: MultivariateFilteringResults + ?Sized,
{
    let neq = ssf.equations();
    let mut state = State::from_initialization(ssf.initialization.as_ref())?;
    let mut a_cols = ssf.initialization.diffuse_constraints();
    let mut diffuse = AugmentedDiffuse::new(a_cols.ncols());

    for (pos, y) in data.iter().enumerate() {
        if y.len() != neq {
            return Err(SsfError::DataError(format!(
                "period {} has {} values for {} equations",
                pos,
                y.len(),
                neq
            )));
        }
        let z = ssf.z(pos);
        let h = ssf.h(pos);
        let mut used = y.clone();
        let mut absorbed = 0;
        for i in 0..neq {
            let Some(yi) = y[i] else { continue };
            let zi = z.row(i).transpose();
            if (&state.p * &zi).dot(&zi) + h[(i, i)] >= State::ZERO {
                continue;
            }
            used[i] = None;
            let e = yi - zi.dot(&state.a);
            let e_cols = a_cols.tr_mul(&zi);
            if diffuse.absorb(e, &e_cols, &mut state.a, &mut a_cols) {
                results.save_absorbed(pos, i);
                absorbed += 1;
            }
        }
        match MultivariateUpdateInformation::compute(pos, &state, &z, &h, &used)? {
            None if absorbed == 0 => results.save_missing(pos),
            None => {}
            Some(info) => {
                let zs = z.select_rows(info.equations.iter());
                let e_cols = solve_lower_matrix(&info.r, &(zs * &a_cols), pos)?;
                for (j, u) in info.u.iter().enumerate() {
                    diffuse.add(&e_cols.row(j).transpose(), *u);
                }
                // A -= K E
                a_cols -= &info.k * &e_cols;
                state.a += &info.k * &info.u;
                state.p -= &info.k * info.k.transpose();
                check_covariance(&mut state.p, pos)?;
                results.save(pos, &info);
            }
        }
        state.next(pos, ssf.dynamics.as_ref());
        a_cols = ssf.dynamics.t(pos) * a_cols;
    }
    Ok(diffuse)
}

/// Diffuse log-likelihood of a multivariate model.
pub fn multivariate_likelihood(
    ssf: &MultivariateSsf,
    data: &[Vec<Option<f64>>],
    concentrated: bool,
) -> Result<DiffuseLikelihood> {
    let mut acc = LikelihoodAccumulator::default();
    let diffuse = multivariate_filter(ssf, data, &mut acc)?;
    acc.profile_diffuse(&diffuse)?;
    acc.finish(concentrated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::LocalLevel;
    use crate::likelihood::compute_likelihood;
    use crate::state_space::{ConstantLoading, SsfComponent, SsfMeasurement};
    use crate::types::{observations, FilterAlgorithm, FilterConfig};

    /// Two equations y_i = mu + eps_i (Var eps = [1, 2]) written as a
    /// univariate series: each period becomes two sub-periods and the level
    /// only moves after the second one.
    struct Interleaved {
        q: f64,
    }

    impl SsfInitialization for Interleaved {
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

    impl SsfDynamics for Interleaved {
        fn innovations_dim(&self) -> usize {
            1
        }
        fn is_time_invariant(&self) -> bool {
            false
        }
        fn t(&self, _pos: usize) -> DMatrix<f64> {
            DMatrix::identity(1, 1)
        }
        fn s(&self, pos: usize) -> DMatrix<f64> {
            let v = if pos % 2 == 1 { self.q } else { 0.0 };
            DMatrix::from_element(1, 1, v.sqrt())
        }
    }

    impl SsfLoading for Interleaved {
        fn is_time_invariant(&self) -> bool {
            true
        }
        fn z(&self, _pos: usize) -> DVector<f64> {
            DVector::from_element(1, 1.0)
        }
    }

    impl SsfMeasurement for Interleaved {
        fn is_time_invariant(&self) -> bool {
            false
        }
        fn h(&self, pos: usize) -> f64 {
            if pos % 2 == 0 {
                1.0
            } else {
                2.0
            }
        }
    }

    fn bivariate_level(q: f64) -> MultivariateSsf {
        let level = Arc::new(LocalLevel::new(q).unwrap());
        let loading: Arc<dyn SsfLoading> = level.clone();
        MultivariateSsf::new(
            level.clone(),
            level,
            vec![loading.clone(), loading],
            Some(Arc::new(ConstantMeasurements::diagonal(&[1.0, 2.0]).unwrap())),
        )
        .unwrap()
    }

    fn data() -> Vec<Vec<Option<f64>>> {
        vec![
            vec![Some(1.0), Some(1.5)],
            vec![Some(2.0), None],
            vec![None, None],
            vec![Some(0.5), Some(1.0)],
            vec![None, Some(3.0)],
            vec![Some(2.5), Some(2.0)],
        ]
    }

    #[test]
    fn test_single_equation_matches_univariate() {
        let ssf = Ssf::from_component(LocalLevel::new(0.5).unwrap(), Some(1.5)).unwrap();
        let y = [1.0, 0.2, 1.7, 2.2, 1.9, 3.0, 2.4];
        let uni = compute_likelihood(&ssf, &observations(&y), &FilterConfig::default()).unwrap();
        let multi = multivariate_likelihood(
            &MultivariateSsf::from_univariate(&ssf).unwrap(),
            &y.iter().map(|&v| vec![Some(v)]).collect::<Vec<_>>(),
            true,
        )
        .unwrap();
        assert!((uni.loglike - multi.loglike).abs() < 1e-10, "{} vs {}", uni.loglike, multi.loglike);
        assert_eq!(multi.nd, 1);
    }

    #[test]
    fn test_matches_sequential_processing() {
        let q = 0.3;
        let multi = multivariate_likelihood(&bivariate_level(q), &data(), false).unwrap();

        let interleaved = Arc::new(Interleaved { q });
        let ssf = Ssf::new(
            SsfComponent {
                initialization: interleaved.clone(),
                dynamics: interleaved.clone(),
                loading: interleaved.clone(),
            },
            Some(interleaved),
        )
        .unwrap();
        let flat: Vec<Option<f64>> = data().into_iter().flatten().collect();
        let config = FilterConfig {
            concentrate_scale: false,
            ..FilterConfig::with_algorithm(FilterAlgorithm::Augmented)
        };
        let uni = compute_likelihood(&ssf, &flat, &config).unwrap();
        assert_eq!(multi.n, uni.n);
        assert!((uni.loglike - multi.loglike).abs() < 1e-10, "{} vs {}", uni.loglike, multi.loglike);
    }

    #[test]
    fn test_absent_equation_is_ignored() {
        let level = Arc::new(LocalLevel::new(0.3).unwrap());
        let loading: Arc<dyn SsfLoading> = level.clone();
        let single = MultivariateSsf::new(
            level.clone(),
            level,
            vec![loading],
            Some(Arc::new(ConstantMeasurements::diagonal(&[1.0]).unwrap())),
        )
        .unwrap();
        let first: Vec<Vec<Option<f64>>> = data().iter().map(|v| vec![v[0]]).collect();
        let with_missing: Vec<Vec<Option<f64>>> = data().iter().map(|v| vec![v[0], None]).collect();
        let l1 = multivariate_likelihood(&single, &first, true).unwrap();
        let l2 = multivariate_likelihood(&bivariate_level(0.3), &with_missing, true).unwrap();
        assert!((l1.loglike - l2.loglike).abs() < 1e-12);
    }

    #[test]
    fn test_degenerate_equation_dropped() {
        let level = Arc::new(LocalLevel::new(0.3).unwrap());
        let loading: Arc<dyn SsfLoading> = level.clone();
        let zero: Arc<dyn SsfLoading> = Arc::new(ConstantLoading(DVector::zeros(1)));
        let with_zero = MultivariateSsf::new(
            level.clone(),
            level,
            vec![loading.clone(), loading, zero],
            Some(Arc::new(ConstantMeasurements::diagonal(&[1.0, 2.0, 0.0]).unwrap())),
        )
        .unwrap();
        let extended: Vec<Vec<Option<f64>>> = data()
            .into_iter()
            .map(|mut v| {
                v.push(Some(0.0));
                v
            })
            .collect();
        let l1 = multivariate_likelihood(&with_zero, &extended, true).unwrap();
        let l2 = multivariate_likelihood(&bivariate_level(0.3), &data(), true).unwrap();
        assert!((l1.loglike - l2.loglike).abs() < 1e-12);
    }

    #[test]
    fn test_noise_free_equation_is_absorbed() {
        // y1 = mu, y2 = mu + eps (Var eps = 1), q = 1, not concentrated.
        // Period 0: y1 fixes mu = 2, y2 leaves e = 1 with F = 1.
        // Period 1: P = 1, e = [0.5, 1.5], F = [[1, 1], [1, 2]], e'F^-1 e = 1.25.
        let level = Arc::new(LocalLevel::new(1.0).unwrap());
        let loading: Arc<dyn SsfLoading> = level.clone();
        let ssf = MultivariateSsf::new(
            level.clone(),
            level,
            vec![loading.clone(), loading],
            Some(Arc::new(ConstantMeasurements::diagonal(&[0.0, 1.0]).unwrap())),
        )
        .unwrap();
        let data = vec![vec![Some(2.0), Some(3.0)], vec![Some(2.5), Some(3.5)]];
        let ll = multivariate_likelihood(&ssf, &data, false).unwrap();
        assert_eq!(ll.n, 4);
        assert_eq!(ll.nd, 1);
        assert!((ll.ssq - 2.25).abs() < 1e-12);
        assert!(ll.ldet.abs() < 1e-12);
        assert!(ll.lddet.abs() < 1e-12);
        let expected = -0.5 * (3.0 * (2.0 * std::f64::consts::PI).ln() + 2.25);
        assert!((ll.loglike - expected).abs() < 1e-12);
    }

    #[test]
    fn test_noise_free_single_equation_matches_univariate() {
        let ssf = Ssf::from_component(LocalLevel::new(1.0).unwrap(), None).unwrap();
        let y = [1.0, 2.5, 2.0, 4.0, 3.5, 5.0];
        let uni = compute_likelihood(&ssf, &observations(&y), &FilterConfig::default()).unwrap();
        let multi = multivariate_likelihood(
            &MultivariateSsf::from_univariate(&ssf).unwrap(),
            &y.iter().map(|&v| vec![Some(v)]).collect::<Vec<_>>(),
            true,
        )
        .unwrap();
        assert_eq!((multi.n, multi.nd), (uni.n, uni.nd));
        assert_eq!((multi.n, multi.nd), (6, 1));
        assert!((uni.loglike - multi.loglike).abs() < 1e-10, "{} vs {}", uni.loglike, multi.loglike);
    }

    #[test]
    fn test_wrong_row_length() {
        let err = multivariate_likelihood(&bivariate_level(0.3), &[vec![Some(1.0)]], true).unwrap_err();
        assert!(matches!(err, SsfError::DataError(_)));
    }
}
