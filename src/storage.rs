use nalgebra::DMatrix;

use crate::error::Result;
use crate::initialization::{DiffuseState, DiffuseUpdateInformation};
use crate::kalman::{diffuse_filter, DiffuseFilteringResults, FilteringResults};
use crate::state::{State, UpdateInformation};
use crate::state_space::Ssf;

/// What the filter did at one period.
#[derive(Debug, Clone, PartialEq)]
pub enum PeriodInfo {
    Missing,
    Ordinary(UpdateInformation),
    Diffuse(DiffuseUpdateInformation),
}

/// Full trajectory of a filter pass: predicted states, the diffuse
/// covariance of the diffuse phase and the update information of every
/// period. Input of the smoother.
#[derive(Debug, Clone, Default)]
pub struct FilteringStorage {
    states: Vec<State>,
    pi: Vec<DMatrix<f64>>,
    infos: Vec<PeriodInfo>,
    diffuse_end: usize,
    end_state: Option<State>,
}

impl FilteringStorage {
    /// Exact diffuse filter over `data`, keeping everything.
    pub fn filter(ssf: &Ssf, data: &[Option<f64>]) -> Result<Self> {
        let mut storage = FilteringStorage::default();
        let end = diffuse_filter(ssf, data, &mut storage)?;
        storage.end_state = Some(end);
        Ok(storage)
    }

    pub fn len(&self) -> usize {
        self.infos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }

    /// First period of the ordinary phase.
    pub fn diffuse_end(&self) -> usize {
        self.diffuse_end
    }

    /// Predicted state a_{t|t-1}, P_{t|t-1} (finite part in the diffuse phase).
    pub fn predicted(&self, pos: usize) -> Option<&State> {
        self.states.get(pos)
    }

    /// Diffuse covariance Pi_t, for periods of the diffuse phase.
    pub fn pi(&self, pos: usize) -> Option<&DMatrix<f64>> {
        self.pi.get(pos)
    }

    pub fn info(&self, pos: usize) -> Option<&PeriodInfo> {
        self.infos.get(pos)
    }

    /// Prediction for the period following the sample.
    pub fn end_state(&self) -> Option<&State> {
        self.end_state.as_ref()
    }

    /// Filtered mean a_{t|t}.
    pub fn filtered(&self, pos: usize) -> Option<State> {
        let state = self.states.get(pos)?;
        let mut filtered = state.clone();
        match self.infos.get(pos)? {
            PeriodInfo::Missing => {}
            PeriodInfo::Ordinary(info) => {
                filtered.a.axpy(info.e / info.v, &info.m, 1.0);
                filtered.p.ger(-1.0 / info.v, &info.m, &info.m, 1.0);
            }
            PeriodInfo::Diffuse(info) if info.is_diffuse() => {
                filtered.a.axpy(info.e / info.fi, &info.mi, 1.0);
                filtered.p.ger(-1.0 / info.fi, &info.mi, &info.m, 1.0);
                filtered.p.ger(-1.0 / info.fi, &info.m, &info.mi, 1.0);
                filtered.p.ger(info.f / (info.fi * info.fi), &info.mi, &info.mi, 1.0);
            }
            PeriodInfo::Diffuse(info) => {
                filtered.a.axpy(info.e / info.f, &info.m, 1.0);
                filtered.p.ger(-1.0 / info.f, &info.m, &info.m, 1.0);
            }
        }
        Some(filtered)
    }

    /// Standardized one-step-ahead prediction errors e / sqrt(F). `None` for
    /// missing periods and for observations absorbed by the diffuse effects.
    pub fn standardized_residuals(&self) -> Vec<Option<f64>> {
        self.infos
            .iter()
            .map(|info| match info {
                PeriodInfo::Ordinary(u) => Some(u.standardized_residual()),
                PeriodInfo::Diffuse(d) if !d.is_diffuse() => Some(d.e / d.f.sqrt()),
                _ => None,
            })
            .collect()
    }

    /// Raw one-step-ahead prediction errors, with the same convention as
    /// `standardized_residuals`.
    pub fn prediction_errors(&self) -> Vec<Option<f64>> {
        self.infos
            .iter()
            .map(|info| match info {
                PeriodInfo::Ordinary(u) => Some(u.e),
                PeriodInfo::Diffuse(d) if !d.is_diffuse() => Some(d.e),
                _ => None,
            })
            .collect()
    }
}

impl FilteringResults for FilteringStorage {
    fn save(&mut self, _pos: usize, info: &UpdateInformation) {
        self.infos.push(PeriodInfo::Ordinary(info.clone()));
    }

    fn save_missing(&mut self, _pos: usize) {
        self.infos.push(PeriodInfo::Missing);
    }

    fn needs_states(&self) -> bool {
        true
    }

    fn save_state(&mut self, _pos: usize, state: &State) {
        self.states.push(state.clone());
    }
}

impl DiffuseFilteringResults for FilteringStorage {
    fn save_diffuse(&mut self, _pos: usize, info: &DiffuseUpdateInformation) {
        self.infos.push(PeriodInfo::Diffuse(info.clone()));
    }

    fn save_diffuse_state(&mut self, _pos: usize, state: &DiffuseState) {
        self.states.push(state.state.clone());
        self.pi.push(state.pi());
    }

    fn close_diffuse(&mut self, end: usize) {
        self.diffuse_end = end;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::{LocalLevel, LocalLinearTrend};
    use crate::types::observations;

    #[test]
    fn test_storage_layout() {
        let ssf = Ssf::from_component(LocalLinearTrend::new(0.1, 0.01).unwrap(), Some(1.0)).unwrap();
        let mut data = observations(&[1.0, 2.0, 3.5, 4.0, 5.0]);
        data[3] = None;
        let storage = FilteringStorage::filter(&ssf, &data).unwrap();
        assert_eq!(storage.len(), 5);
        assert_eq!(storage.diffuse_end(), 2);
        assert!(storage.pi(1).is_some());
        assert!(storage.pi(2).is_none());
        assert_eq!(storage.info(3), Some(&PeriodInfo::Missing));
        let res = storage.standardized_residuals();
        assert_eq!(res[0], None);
        assert_eq!(res[1], None);
        assert!(res[2].is_some());
        assert_eq!(res[3], None);
        assert!(storage.end_state().is_some());
    }

    #[test]
    fn test_filtered_state_local_level() {
        let ssf = Ssf::from_component(LocalLevel::new(1.0).unwrap(), Some(1.0)).unwrap();
        let storage = FilteringStorage::filter(&ssf, &observations(&[2.0, 4.0])).unwrap();
        // After the diffuse pivot the filtered level is the observation.
        let f0 = storage.filtered(0).unwrap();
        assert!((f0.a[0] - 2.0).abs() < 1e-14);
        assert!((f0.p[(0, 0)] - 1.0).abs() < 1e-14);
        // Period 1: P = 2, F = 3, a = 2 + 2/3 * 2.
        let f1 = storage.filtered(1).unwrap();
        assert!((f1.a[0] - (2.0 + 4.0 / 3.0)).abs() < 1e-14);
        assert!((f1.p[(0, 0)] - 2.0 / 3.0).abs() < 1e-14);
    }
}
