//! Basic structural model: level (+ slope) + seasonal + irregular.
//!
//! The model is parameterised by variance ratios relative to one scale
//! component (the irregular when present, the level otherwise); the scale
//! itself is concentrated out of the likelihood.

use crate::components::{LocalLevel, LocalLinearTrend, Seasonal, SeasonalModel};
use crate::composite::CompositeSsf;
use crate::error::{Result, SsfError};

/// Variance component of a BSM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BsmComponent {
    Level,
    Slope,
    Seasonal,
    Noise,
}

/// Which components a BSM carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BsmSpec {
    pub level: bool,
    pub slope: bool,
    /// Seasonal period and seasonal model.
    pub seasonal: Option<(usize, SeasonalModel)>,
    pub noise: bool,
}

impl BsmSpec {
    pub fn new(
        level: bool,
        slope: bool,
        seasonal: Option<(usize, SeasonalModel)>,
        noise: bool,
    ) -> Result<Self> {
        let spec = Self {
            level,
            slope,
            seasonal,
            noise,
        };
        spec.validate()?;
        Ok(spec)
    }

    /// Local level + irregular.
    pub fn local_level() -> Self {
        Self {
            level: true,
            slope: false,
            seasonal: None,
            noise: true,
        }
    }

    /// Level + slope + dummy seasonal + irregular.
    pub fn basic(period: usize) -> Self {
        Self {
            level: true,
            slope: true,
            seasonal: Some((period, SeasonalModel::Dummy)),
            noise: true,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.slope && !self.level {
            return Err(SsfError::Model("a slope requires a level".into()));
        }
        if !self.level && !self.noise {
            return Err(SsfError::Model(
                "a BSM needs a level or an irregular component".into(),
            ));
        }
        if let Some((period, _)) = self.seasonal {
            if period < 2 {
                return Err(SsfError::Model(format!(
                    "seasonal period must be >= 2, got {}",
                    period
                )));
            }
        }
        Ok(())
    }

    /// Variance components present, in the order level, slope, seasonal, noise.
    pub fn components(&self) -> Vec<BsmComponent> {
        let mut c = Vec::with_capacity(4);
        if self.level {
            c.push(BsmComponent::Level);
        }
        if self.slope {
            c.push(BsmComponent::Slope);
        }
        if self.seasonal.is_some() {
            c.push(BsmComponent::Seasonal);
        }
        if self.noise {
            c.push(BsmComponent::Noise);
        }
        c
    }

    /// Component whose variance is concentrated out.
    pub fn scale_component(&self) -> BsmComponent {
        if self.noise {
            BsmComponent::Noise
        } else {
            BsmComponent::Level
        }
    }

    /// Components with a free variance ratio, in parameter order.
    pub fn free_components(&self) -> Vec<BsmComponent> {
        let scale = self.scale_component();
        self.components()
            .into_iter()
            .filter(|&c| c != scale)
            .collect()
    }

    pub fn n_params(&self) -> usize {
        self.free_components().len()
    }

    /// Number of diffuse states: level, slope and period - 1 seasonal states.
    pub fn diffuse_dim(&self) -> usize {
        usize::from(self.level)
            + usize::from(self.slope)
            + self.seasonal.map_or(0, |(period, _)| period - 1)
    }

    /// Variances with the scale component at 1 and the free ones at `ratios`.
    pub fn variances_from_ratios(&self, ratios: &[f64], scale: f64) -> Result<BsmVariances> {
        let free = self.free_components();
        if ratios.len() != free.len() {
            return Err(SsfError::ParamLengthMismatch {
                expected: free.len(),
                got: ratios.len(),
            });
        }
        let mut variances = BsmVariances::default();
        variances.set(self.scale_component(), scale);
        for (&c, &r) in free.iter().zip(ratios) {
            variances.set(c, r * scale);
        }
        Ok(variances)
    }

    /// Composite model: [trend block | seasonal block], irregular as measurement noise.
    pub fn build(&self, variances: &BsmVariances) -> Result<CompositeSsf> {
        self.validate()?;
        let mut builder = CompositeSsf::builder();
        if self.slope {
            builder = builder.add(LocalLinearTrend::new(variances.level, variances.slope)?);
        } else if self.level {
            builder = builder.add(LocalLevel::new(variances.level)?);
        }
        if let Some((period, model)) = self.seasonal {
            builder = builder.add(Seasonal::new(period, model, variances.seasonal)?);
        }
        if self.noise {
            builder = builder.measurement(variances.noise);
        }
        builder.build()
    }

    /// Model with unit scale and the given ratios.
    pub fn build_from_ratios(&self, ratios: &[f64]) -> Result<CompositeSsf> {
        self.build(&self.variances_from_ratios(ratios, 1.0)?)
    }
}

/// Variances of the BSM disturbances; entries of absent components are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BsmVariances {
    pub level: f64,
    pub slope: f64,
    pub seasonal: f64,
    pub noise: f64,
}

impl BsmVariances {
    pub fn get(&self, component: BsmComponent) -> f64 {
        match component {
            BsmComponent::Level => self.level,
            BsmComponent::Slope => self.slope,
            BsmComponent::Seasonal => self.seasonal,
            BsmComponent::Noise => self.noise,
        }
    }

    pub fn set(&mut self, component: BsmComponent, value: f64) {
        match component {
            BsmComponent::Level => self.level = value,
            BsmComponent::Slope => self.slope = value,
            BsmComponent::Seasonal => self.seasonal = value,
            BsmComponent::Noise => self.noise = value,
        }
    }

    /// Variances of the components present in `spec`, in `spec.components()` order.
    pub fn to_vec(&self, spec: &BsmSpec) -> Vec<f64> {
        spec.components().into_iter().map(|c| self.get(c)).collect()
    }
}
