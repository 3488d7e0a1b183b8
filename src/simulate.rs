//! Draws from a state-space model.
//!
//!   alpha_{t+1} = T alpha_t + S eta_t,  eta_t ~ N(0, I)
//!   y_t         = Z alpha_t + eps_t,    eps_t ~ N(0, h)
//!
//! The diffuse part of the initial state is fixed at `a0` (or at the
//! supplied initial state); the finite part is drawn from N(0, Pf0).

use nalgebra::DVector;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, StandardNormal};

use crate::error::{Result, SsfError};
use crate::sqrt_filter::covariance_factor;
use crate::state_space::{Ssf, SystemCache};

/// Simulated trajectory.
#[derive(Debug, Clone)]
pub struct Simulation {
    /// States alpha_0 .. alpha_{n-1}.
    pub states: Vec<DVector<f64>>,
    pub observations: Vec<f64>,
}

fn standard_normal(rng: &mut StdRng, n: usize) -> DVector<f64> {
    DVector::from_fn(n, |_, _| StandardNormal.sample(rng))
}

/// Simulate `n` periods starting from `a0` plus a draw of N(0, Pf0).
pub fn simulate(ssf: &Ssf, n: usize, seed: u64) -> Result<Simulation> {
    let a0 = ssf.initialization.a0()?;
    simulate_from(ssf, n, &a0, seed)
}

/// Simulate `n` periods from `initial` plus a draw of N(0, Pf0).
pub fn simulate_from(
    ssf: &Ssf,
    n: usize,
    initial: &DVector<f64>,
    seed: u64,
) -> Result<Simulation> {
    let dim = ssf.dim();
    if initial.len() != dim {
        return Err(SsfError::Model(format!(
            "initial state has length {}, model dimension is {}",
            initial.len(),
            dim
        )));
    }
    let mut rng = StdRng::seed_from_u64(seed);
    let cache = SystemCache::new(ssf);

    let lf = covariance_factor(&ssf.initialization.pf0()?);
    let mut alpha = initial + &lf * standard_normal(&mut rng, dim);

    let mut states = Vec::with_capacity(n);
    let mut observations = Vec::with_capacity(n);
    for t in 0..n {
        let m = cache.at(t);
        let eps: f64 = StandardNormal.sample(&mut rng);
        observations.push(m.z.dot(&alpha) + m.h.max(0.0).sqrt() * eps);
        states.push(alpha.clone());

        let eta = standard_normal(&mut rng, m.s.ncols());
        alpha = &m.t * &alpha + &m.s * eta;
    }
    Ok(Simulation {
        states,
        observations,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::LocalLevel;

    #[test]
    fn test_simulate_shapes_and_seed() {
        let ssf = Ssf::from_component(LocalLevel::new(0.1).unwrap(), Some(1.0)).unwrap();
        let a = simulate(&ssf, 20, 42).unwrap();
        let b = simulate(&ssf, 20, 42).unwrap();
        let c = simulate(&ssf, 20, 43).unwrap();
        assert_eq!(a.states.len(), 20);
        assert_eq!(a.observations.len(), 20);
        assert_eq!(a.observations, b.observations);
        assert_ne!(a.observations, c.observations);
    }

    #[test]
    fn test_no_noise_follows_state() {
        let ssf = Ssf::from_component(LocalLevel::new(1.0).unwrap(), None).unwrap();
        let sim = simulate_from(&ssf, 10, &DVector::from_element(1, 5.0), 7).unwrap();
        assert_eq!(sim.states[0][0], 5.0);
        for (s, y) in sim.states.iter().zip(&sim.observations) {
            assert!((s[0] - y).abs() < 1e-15);
        }
    }

    #[test]
    fn test_wrong_initial_length() {
        let ssf = Ssf::from_component(LocalLevel::new(1.0).unwrap(), None).unwrap();
        assert!(simulate_from(&ssf, 5, &DVector::zeros(2), 1).is_err());
    }
}
