//! Sums of independent state-space blocks.
//!
//! The combined state is the concatenation of the component states:
//! T, S, Pf0 and B are block diagonal, Z is the concatenation of the
//! component loadings (the observation is the sum of all components plus an
//! optional measurement noise).

use std::ops::Range;
use std::sync::Arc;

use nalgebra::{DMatrix, DVector};

use crate::error::{Result, SsfError};
use crate::state_space::{
    ConstantMeasurement, Ssf, SsfComponent, SsfDynamics, SsfInitialization, SsfLoading,
    SsfMeasurement,
};

/// Block bookkeeping shared by the three roles of a composite model.
#[derive(Clone)]
struct Blocks {
    components: Vec<SsfComponent>,
    /// Start of each component in the state vector.
    positions: Vec<usize>,
    /// Start of each component in the innovation vector.
    innovation_positions: Vec<usize>,
    /// Start of each component among the diffuse directions.
    diffuse_positions: Vec<usize>,
    dim: usize,
    innovations_dim: usize,
    diffuse_dim: usize,
}

impl Blocks {
    fn new(components: Vec<SsfComponent>) -> Self {
        let mut positions = Vec::with_capacity(components.len());
        let mut innovation_positions = Vec::with_capacity(components.len());
        let mut diffuse_positions = Vec::with_capacity(components.len());
        let (mut dim, mut innovations_dim, mut diffuse_dim) = (0, 0, 0);
        for c in &components {
            positions.push(dim);
            innovation_positions.push(innovations_dim);
            diffuse_positions.push(diffuse_dim);
            dim += c.initialization.dim();
            innovations_dim += c.dynamics.innovations_dim();
            diffuse_dim += c.initialization.diffuse_dim();
        }
        Self {
            components,
            positions,
            innovation_positions,
            diffuse_positions,
            dim,
            innovations_dim,
            diffuse_dim,
        }
    }

    fn check(&self) -> Result<()> {
        if self.components.is_empty() {
            return Err(SsfError::Model("composite model without components".into()));
        }
        for (i, c) in self.components.iter().enumerate() {
            let d = c.initialization.dim();
            let t = c.dynamics.t(0);
            let s = c.dynamics.s(0);
            let z = c.loading.z(0);
            let b = c.initialization.diffuse_constraints();
            if t.shape() != (d, d)
                || s.shape() != (d, c.dynamics.innovations_dim())
                || z.len() != d
                || b.shape() != (d, c.initialization.diffuse_dim())
            {
                return Err(SsfError::Model(format!(
                    "component {} has inconsistent block sizes (dim {})",
                    i, d
                )));
            }
        }
        Ok(())
    }
}

impl SsfInitialization for Blocks {
    fn dim(&self) -> usize {
        self.dim
    }

    fn diffuse_dim(&self) -> usize {
        self.diffuse_dim
    }

    fn a0(&self) -> Result<DVector<f64>> {
        let mut a = DVector::zeros(self.dim);
        for (c, &p) in self.components.iter().zip(&self.positions) {
            let ai = c.initialization.a0()?;
            a.rows_mut(p, ai.len()).copy_from(&ai);
        }
        Ok(a)
    }

    fn pf0(&self) -> Result<DMatrix<f64>> {
        let mut pf = DMatrix::zeros(self.dim, self.dim);
        for (c, &p) in self.components.iter().zip(&self.positions) {
            let pi = c.initialization.pf0()?;
            pf.view_mut((p, p), pi.shape()).copy_from(&pi);
        }
        Ok(pf)
    }

    fn diffuse_constraints(&self) -> DMatrix<f64> {
        let mut b = DMatrix::zeros(self.dim, self.diffuse_dim);
        for ((c, &p), &q) in self
            .components
            .iter()
            .zip(&self.positions)
            .zip(&self.diffuse_positions)
        {
            if c.initialization.diffuse_dim() > 0 {
                let bi = c.initialization.diffuse_constraints();
                b.view_mut((p, q), bi.shape()).copy_from(&bi);
            }
        }
        b
    }
}

impl SsfDynamics for Blocks {
    fn innovations_dim(&self) -> usize {
        self.innovations_dim
    }

    fn is_time_invariant(&self) -> bool {
        self.components.iter().all(|c| c.dynamics.is_time_invariant())
    }

    fn t(&self, pos: usize) -> DMatrix<f64> {
        let mut t = DMatrix::zeros(self.dim, self.dim);
        for (c, &p) in self.components.iter().zip(&self.positions) {
            let ti = c.dynamics.t(pos);
            t.view_mut((p, p), ti.shape()).copy_from(&ti);
        }
        t
    }

    fn s(&self, pos: usize) -> DMatrix<f64> {
        let mut s = DMatrix::zeros(self.dim, self.innovations_dim);
        for ((c, &p), &q) in self
            .components
            .iter()
            .zip(&self.positions)
            .zip(&self.innovation_positions)
        {
            if c.dynamics.innovations_dim() > 0 {
                let si = c.dynamics.s(pos);
                s.view_mut((p, q), si.shape()).copy_from(&si);
            }
        }
        s
    }
}

impl SsfLoading for Blocks {
    fn is_time_invariant(&self) -> bool {
        self.components.iter().all(|c| c.loading.is_time_invariant())
    }

    fn z(&self, pos: usize) -> DVector<f64> {
        let mut z = DVector::zeros(self.dim);
        for (c, &p) in self.components.iter().zip(&self.positions) {
            let zi = c.loading.z(pos);
            z.rows_mut(p, zi.len()).copy_from(&zi);
        }
        z
    }
}

/// Builder for [`CompositeSsf`].
#[derive(Default)]
pub struct CompositeBuilder {
    components: Vec<SsfComponent>,
    measurement: Option<Arc<dyn SsfMeasurement>>,
}

impl CompositeBuilder {
    /// Append a model family as the next block.
    pub fn add<C>(self, component: C) -> Self
    where
        C: SsfInitialization + SsfDynamics + SsfLoading + 'static,
    {
        self.add_component(SsfComponent::new(component))
    }

    pub fn add_component(mut self, component: SsfComponent) -> Self {
        self.components.push(component);
        self
    }

    /// Constant measurement-noise variance.
    pub fn measurement(self, h: f64) -> Self {
        self.measurement_model(Arc::new(ConstantMeasurement(h)))
    }

    pub fn measurement_model(mut self, measurement: Arc<dyn SsfMeasurement>) -> Self {
        self.measurement = Some(measurement);
        self
    }

    pub fn build(self) -> Result<CompositeSsf> {
        let blocks = Blocks::new(self.components);
        blocks.check()?;
        let positions = blocks.positions.clone();
        let dims = blocks
            .components
            .iter()
            .map(|c| c.initialization.dim())
            .collect();
        let components = blocks.components.clone();
        let ssf = Ssf::new(SsfComponent::new(blocks), self.measurement)?;
        Ok(CompositeSsf {
            components,
            positions,
            dims,
            ssf,
        })
    }
}

/// A model made of independent blocks, with the offsets needed to read
/// per-component results back out of the combined state.
#[derive(Clone)]
pub struct CompositeSsf {
    components: Vec<SsfComponent>,
    positions: Vec<usize>,
    dims: Vec<usize>,
    ssf: Ssf,
}

impl std::fmt::Debug for CompositeSsf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeSsf")
            .field("positions", &self.positions)
            .field("dims", &self.dims)
            .field("ssf", &self.ssf)
            .finish()
    }
}

impl CompositeSsf {
    pub fn builder() -> CompositeBuilder {
        CompositeBuilder::default()
    }

    /// Starting offset of each component in the state vector.
    pub fn components_position(&self) -> &[usize] {
        &self.positions
    }

    pub fn component_dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn component_count(&self) -> usize {
        self.components.len()
    }

    pub fn component(&self, i: usize) -> Option<&SsfComponent> {
        self.components.get(i)
    }

    /// State indices of component `i`.
    pub fn component_range(&self, i: usize) -> Result<Range<usize>> {
        match (self.positions.get(i), self.dims.get(i)) {
            (Some(&p), Some(&d)) => Ok(p..p + d),
            _ => Err(SsfError::Model(format!(
                "component {} out of range ({} components)",
                i,
                self.components.len()
            ))),
        }
    }

    /// Contribution Z_i(pos)' a_i of component `i` to the observation.
    pub fn component_signal(&self, pos: usize, a: &DVector<f64>, i: usize) -> Result<f64> {
        let range = self.component_range(i)?;
        let zi = self.components[i].loading.z(pos);
        Ok(zi.dot(&a.rows(range.start, range.len())))
    }

    /// Same model with component `i` replaced. The other components are
    /// shared, only the block bookkeeping is rebuilt.
    pub fn replace(&self, i: usize, component: SsfComponent) -> Result<CompositeSsf> {
        if i >= self.components.len() {
            return Err(SsfError::Model(format!(
                "component {} out of range ({} components)",
                i,
                self.components.len()
            )));
        }
        let mut components = self.components.clone();
        components[i] = component;
        let builder = CompositeBuilder {
            components,
            measurement: self.ssf.measurement.clone(),
        };
        builder.build()
    }

    /// The whole model viewed as one block, for nesting.
    pub fn as_component(&self) -> SsfComponent {
        SsfComponent {
            initialization: self.ssf.initialization.clone(),
            dynamics: self.ssf.dynamics.clone(),
            loading: self.ssf.loading.clone(),
        }
    }

    pub fn ssf(&self) -> &Ssf {
        &self.ssf
    }

    pub fn into_ssf(self) -> Ssf {
        self.ssf
    }
}
