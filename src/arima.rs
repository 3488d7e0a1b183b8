//! SARIMA(p,d,q)(P,D,Q)s as a state-space block (Harvey representation).
//!
//! State: [differencing states (d + s*D) | ARMA states (max(p + sP, q + sQ + 1))].
//! The differencing states carry the unknown starting values of the
//! integrated process and are diffuse; the ARMA block starts from its
//! stationary distribution.

use nalgebra::{DMatrix, DVector};

use crate::error::{Result, SsfError};
use crate::state::State;
use crate::state_space::{SsfDynamics, SsfInitialization, SsfLoading};

/// SARIMA orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SarimaOrder {
    pub p: usize,
    pub d: usize,
    pub q: usize,
    /// Seasonal AR order (P).
    pub pp: usize,
    /// Seasonal differencing order (D).
    pub dd: usize,
    /// Seasonal MA order (Q).
    pub qq: usize,
    /// Seasonal period.
    pub s: usize,
}

impl SarimaOrder {
    pub fn new(p: usize, d: usize, q: usize, pp: usize, dd: usize, qq: usize, s: usize) -> Self {
        Self { p, d, q, pp, dd, qq, s }
    }

    /// Non-seasonal ARIMA(p, d, q).
    pub fn arima(p: usize, d: usize, q: usize) -> Self {
        Self::new(p, d, q, 0, 0, 0, 0)
    }

    /// Airline model (0,1,1)(0,1,1)s.
    pub fn airline(s: usize) -> Self {
        Self::new(0, 1, 1, 0, 1, 1, s)
    }

    /// Expanded AR order: p + s*P
    pub fn k_ar(&self) -> usize {
        self.p + self.s * self.pp
    }

    /// Expanded MA order: q + s*Q
    pub fn k_ma(&self) -> usize {
        self.q + self.s * self.qq
    }

    /// ARMA block dimension: max(k_ar, k_ma + 1)
    pub fn k_order(&self) -> usize {
        std::cmp::max(self.k_ar(), self.k_ma() + 1)
    }

    /// Differencing block dimension: d + s*D
    pub fn k_states_diff(&self) -> usize {
        self.d + self.s * self.dd
    }

    pub fn k_states(&self) -> usize {
        self.k_order() + self.k_states_diff()
    }
}

/// Product of two polynomials given by increasing powers.
pub fn polymul(a: &[f64], b: &[f64]) -> Vec<f64> {
    if a.is_empty() || b.is_empty() {
        return Vec::new();
    }
    let mut r = vec![0.0; a.len() + b.len() - 1];
    for (i, &ai) in a.iter().enumerate() {
        for (j, &bj) in b.iter().enumerate() {
            r[i + j] += ai * bj;
        }
    }
    r
}

/// 1 + sign * (c_1 L^lag + c_2 L^(2 lag) + ...)
fn lag_polynomial(coeffs: &[f64], lag: usize, sign: f64) -> Vec<f64> {
    let mut p = vec![0.0; coeffs.len() * lag + 1];
    p[0] = 1.0;
    for (i, &c) in coeffs.iter().enumerate() {
        p[(i + 1) * lag] = sign * c;
    }
    p
}

/// SARIMA block with innovation variance `variance`.
#[derive(Debug, Clone, PartialEq)]
pub struct Sarima {
    order: SarimaOrder,
    variance: f64,
    /// Expanded AR polynomial phi(L) Phi(L^s), phi_0 = 1.
    ar: Vec<f64>,
    /// Expanded MA polynomial theta(L) Theta(L^s), theta_0 = 1.
    ma: Vec<f64>,
}

impl Sarima {
    /// `ar`, `ma`, `sar`, `sma` follow the sign conventions
    /// (1 - phi_1 L - ...) and (1 + theta_1 L + ...).
    pub fn new(
        order: SarimaOrder,
        ar: &[f64],
        ma: &[f64],
        sar: &[f64],
        sma: &[f64],
        variance: f64,
    ) -> Result<Self> {
        if order.dd > 1 {
            return Err(SsfError::Model(
                "seasonal differencing D > 1 is not supported".into(),
            ));
        }
        if (order.dd > 0 || order.pp > 0 || order.qq > 0) && order.s < 2 {
            return Err(SsfError::Model(format!(
                "seasonal terms require a seasonal period s >= 2, got s={}",
                order.s
            )));
        }
        let lengths = [
            ("ar", ar.len(), order.p),
            ("ma", ma.len(), order.q),
            ("sar", sar.len(), order.pp),
            ("sma", sma.len(), order.qq),
        ];
        if let Some((name, got, expected)) = lengths.iter().find(|(_, got, exp)| got != exp) {
            return Err(SsfError::Model(format!(
                "{} coefficients: expected {}, got {}",
                name, expected, got
            )));
        }
        if !variance.is_finite() || variance <= 0.0 {
            return Err(SsfError::Model(format!(
                "innovation variance must be > 0, got {}",
                variance
            )));
        }
        let s = order.s.max(1);
        Ok(Self {
            order,
            variance,
            ar: polymul(&lag_polynomial(ar, 1, -1.0), &lag_polynomial(sar, s, -1.0)),
            ma: polymul(&lag_polynomial(ma, 1, 1.0), &lag_polynomial(sma, s, 1.0)),
        })
    }

    pub fn order(&self) -> &SarimaOrder {
        &self.order
    }

    /// Expanded AR polynomial.
    pub fn reduced_ar(&self) -> &[f64] {
        &self.ar
    }

    /// Expanded MA polynomial.
    pub fn reduced_ma(&self) -> &[f64] {
        &self.ma
    }

    /// Companion matrix of the ARMA block.
    fn arma_transition(&self) -> DMatrix<f64> {
        let ko = self.order.k_order();
        let mut t = DMatrix::zeros(ko, ko);
        for i in 0..ko {
            if let Some(&c) = self.ar.get(i + 1) {
                t[(i, 0)] = -c;
            }
        }
        for i in 0..ko.saturating_sub(1) {
            t[(i, i + 1)] = 1.0;
        }
        t
    }

    /// Loading of the innovation on the ARMA block: (1, theta_1, ...).
    fn arma_selection(&self) -> DVector<f64> {
        let ko = self.order.k_order();
        DVector::from_fn(ko, |i, _| self.ma.get(i).copied().unwrap_or(0.0))
    }

    /// Stationary covariance of the ARMA block: P = T P T' + R R' sigma2,
    /// solved as vec(P) = (I - T kron T)^-1 vec(R R' sigma2).
    pub fn stationary_covariance(&self) -> Result<DMatrix<f64>> {
        let ko = self.order.k_order();
        let t = self.arma_transition();
        let r = self.arma_selection();
        let rqr = &r * r.transpose() * self.variance;

        let lhs = DMatrix::<f64>::identity(ko * ko, ko * ko) - t.kronecker(&t);
        let rhs = DVector::from_column_slice(rqr.as_slice());
        let vec_p = lhs.lu().solve(&rhs).ok_or_else(|| {
            SsfError::Initialization(
                "AR polynomial has a unit root: no stationary covariance".into(),
            )
        })?;
        let mut p = DMatrix::from_column_slice(ko, ko, vec_p.as_slice());
        p = (&p + p.transpose()) * 0.5;

        let scale = p.diagonal().amax().max(1.0);
        let min_eig = p
            .clone()
            .symmetric_eigen()
            .eigenvalues
            .iter()
            .fold(f64::INFINITY, |acc, &x| acc.min(x));
        if !min_eig.is_finite() || min_eig < -State::ZERO * scale {
            return Err(SsfError::Initialization(
                "AR polynomial is not stationary: covariance is not positive semi-definite".into(),
            ));
        }
        Ok(p)
    }
}

impl SsfInitialization for Sarima {
    fn dim(&self) -> usize {
        self.order.k_states()
    }

    fn diffuse_dim(&self) -> usize {
        self.order.k_states_diff()
    }

    fn a0(&self) -> Result<DVector<f64>> {
        Ok(DVector::zeros(self.order.k_states()))
    }

    fn pf0(&self) -> Result<DMatrix<f64>> {
        let k = self.order.k_states();
        let sd = self.order.k_states_diff();
        let ko = self.order.k_order();
        let mut p = DMatrix::zeros(k, k);
        p.view_mut((sd, sd), (ko, ko))
            .copy_from(&self.stationary_covariance()?);
        Ok(p)
    }

    fn diffuse_constraints(&self) -> DMatrix<f64> {
        let k = self.order.k_states();
        let sd = self.order.k_states_diff();
        let mut b = DMatrix::zeros(k, sd);
        for i in 0..sd {
            b[(i, i)] = 1.0;
        }
        b
    }
}

impl SsfDynamics for Sarima {
    fn innovations_dim(&self) -> usize {
        1
    }

    fn is_time_invariant(&self) -> bool {
        true
    }

    /// 1. Regular differencing block: upper triangular ones
    /// 2. Seasonal differencing: s x s cyclic shift
    /// 3. Regular differencing states pick up the last seasonal state
    /// 4. Differencing states pick up the first ARMA state
    /// 5. ARMA companion block
    fn t(&self, _pos: usize) -> DMatrix<f64> {
        let o = &self.order;
        let (d, dd, s) = (o.d, o.dd, o.s);
        let sd = o.k_states_diff();
        let ko = o.k_order();
        let mut t = DMatrix::zeros(o.k_states(), o.k_states());

        for i in 0..d {
            for j in i..d {
                t[(i, j)] = 1.0;
            }
        }
        for layer in 0..dd {
            let base = d + layer * s;
            t[(base, base + s - 1)] = 1.0;
            for i in 0..(s - 1) {
                t[(base + i + 1, base + i)] = 1.0;
            }
        }
        if dd > 0 {
            let last_seasonal = d + s * dd - 1;
            for i in 0..d {
                t[(i, last_seasonal)] = 1.0;
            }
        }
        for i in 0..d {
            t[(i, sd)] = 1.0;
        }
        for layer in 0..dd {
            t[(d + layer * s, sd)] = 1.0;
        }
        t.view_mut((sd, sd), (ko, ko))
            .copy_from(&self.arma_transition());
        t
    }

    fn s(&self, _pos: usize) -> DMatrix<f64> {
        let o = &self.order;
        let sd = o.k_states_diff();
        let mut s = DMatrix::zeros(o.k_states(), 1);
        let r = self.arma_selection() * self.variance.sqrt();
        s.view_mut((sd, 0), (o.k_order(), 1)).copy_from(&r);
        s
    }
}

impl SsfLoading for Sarima {
    fn is_time_invariant(&self) -> bool {
        true
    }

    /// Ones on the regular differencing states, the last state of each
    /// seasonal layer and the first ARMA state.
    fn z(&self, _pos: usize) -> DVector<f64> {
        let o = &self.order;
        let sd = o.k_states_diff();
        let mut z = DVector::zeros(o.k_states());
        for i in 0..o.d {
            z[i] = 1.0;
        }
        for layer in 0..o.dd {
            z[o.d + (layer + 1) * o.s - 1] = 1.0;
        }
        z[sd] = 1.0;
        z
    }
}
