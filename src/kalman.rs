use crate::error::{Result, SsfError};
use crate::initialization::{DiffuseInitializer, DiffuseState, DiffuseUpdateInformation};
use crate::state::{State, UpdateInformation};
use crate::state_space::{Ssf, SystemCache};

/// Receives the output of a filter pass, period by period.
///
/// For every period the filter calls `save_state` (if `needs_states`) with the
/// predicted state, then exactly one of `save`, `save_missing` or
/// `save_absorbed`.
pub trait FilteringResults {
    fn save(&mut self, pos: usize, info: &UpdateInformation);

    fn save_missing(&mut self, _pos: usize) {}

    /// Observation without noise that was turned into an exact constraint on
    /// the diffuse effects (augmented filter only).
    fn save_absorbed(&mut self, _pos: usize) {}

    fn needs_states(&self) -> bool {
        false
    }

    fn save_state(&mut self, _pos: usize, _state: &State) {}
}

/// Filter output including the diffuse phase.
pub trait DiffuseFilteringResults: FilteringResults {
    fn save_diffuse(&mut self, pos: usize, info: &DiffuseUpdateInformation);

    fn save_diffuse_state(&mut self, _pos: usize, _state: &DiffuseState) {}

    /// Called once with the first period of the ordinary phase.
    fn close_diffuse(&mut self, _end: usize) {}
}

/// Direct covariance filter from `start` to the end of `data`, starting from
/// the predicted state at `start`. Returns the prediction for `data.len()`.
///
/// Uses the standard Kalman recursion:
///   - e_t = y_t - Z' a_t,  F_t = Z' P_t Z + H
///   - a_{t|t} = a_t + P_t Z e_t / F_t,  P_{t|t} = P_t - P_t Z Z' P_t / F_t
///   - a_{t+1} = T a_{t|t},  P_{t+1} = T P_{t|t} T' + S S'
pub fn ordinary_filter<R>(
    ssf: &Ssf,
    data: &[Option<f64>],
    start: usize,
    mut state: State,
    results: &mut R,
) -> Result<State>
where
    R: FilteringResults + ?Sized,
{
    let cache = SystemCache::new(ssf);
    for (pos, obs) in data.iter().enumerate().skip(start) {
        let m = cache.at(pos);
        if results.needs_states() {
            results.save_state(pos, &state);
        }
        match *obs {
            None => results.save_missing(pos),
            Some(y) => {
                let info = UpdateInformation::compute(&state, &m.z, m.h, y);
                if info.v <= State::ZERO {
                    return Err(SsfError::NonPositiveVariance {
                        pos,
                        variance: info.v,
                    });
                }
                results.save(pos, &info);
                state.update(pos, &info)?;
            }
        }
        state.next_with(&m);
    }
    Ok(state)
}

/// Exact diffuse filter: diffuse initialization followed by the direct
/// covariance filter. For models without diffuse effects this is the
/// ordinary filter started at (a0, Pf0).
pub fn diffuse_filter<R>(ssf: &Ssf, data: &[Option<f64>], results: &mut R) -> Result<State>
where
    R: DiffuseFilteringResults + ?Sized,
{
    let (end, state) = DiffuseInitializer::new(ssf).initialize(data, results)?;
    ordinary_filter(ssf, data, end, state, results)
}
