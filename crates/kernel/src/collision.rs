//! Collision kernels: the pairwise coalescence weight K(i, j).
//!
//! A kernel writes one non-negative weight per candidate pair at the
//! population index of the pair's first slot. The engine then scales it into
//! a collision probability.

use std::fmt;

use crate::array::{Array, Multiplier, Scalar};
use crate::backend::{Backend, Primitive};
use crate::error::{Error, Result};
use crate::population::Population;

/// Pairwise coalescence weight evaluated once per pair per step.
pub trait CollisionKernel: Send {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Write K for every pair of the active index into
    /// `output[index[2k]]`. `is_first` marks the first slot of each pair by
    /// position in the index.
    fn evaluate(
        &self,
        backend: &dyn Backend,
        population: &Population,
        is_first: &Array,
        output: &mut Array,
    ) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Constant kernel
// ---------------------------------------------------------------------------

/// K(i, j) = c.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConstantKernel {
    /// Kernel value.
    pub c: f64,
}

impl CollisionKernel for ConstantKernel {
    fn name(&self) -> &str {
        "constant"
    }

    fn evaluate(
        &self,
        backend: &dyn Backend,
        _population: &Population,
        _is_first: &Array,
        output: &mut Array,
    ) -> Result<()> {
        backend.fill(output, Scalar::Float(self.c))
    }
}

// ---------------------------------------------------------------------------
// Golovin (additive) kernel
// ---------------------------------------------------------------------------

/// Golovin's additive kernel, K(i, j) = b (v_i + v_j).
///
/// Built from `sum_pair` and `multiply` so it runs on every backend.
#[derive(Debug, Clone, PartialEq)]
pub struct GolovinKernel {
    /// Rate constant.
    pub b: f64,
    /// Name of the per-droplet volume attribute.
    pub attribute: String,
}

impl GolovinKernel {
    /// Golovin kernel over the `volume` attribute.
    pub fn new(b: f64) -> Self {
        Self {
            b,
            attribute: "volume".to_string(),
        }
    }
}

impl CollisionKernel for GolovinKernel {
    fn name(&self) -> &str {
        "golovin"
    }

    fn evaluate(
        &self,
        backend: &dyn Backend,
        population: &Population,
        _is_first: &Array,
        output: &mut Array,
    ) -> Result<()> {
        let volume = population.attribute(&self.attribute).ok_or_else(|| {
            Error::shape(
                Primitive::SumPair,
                format!("Golovin kernel needs attribute '{}'", self.attribute),
            )
        })?;
        backend.sum_pair(output, volume, population.index())?;
        backend.multiply(output, Multiplier::Scalar(Scalar::Float(self.b)))
    }
}

// ---------------------------------------------------------------------------
// Closure adapter
// ---------------------------------------------------------------------------

/// Read-only view of one super-droplet handed to a [`PairwiseKernel`].
#[derive(Clone, Copy)]
pub struct DropletState<'a> {
    population: &'a Population,
    id: usize,
}

impl<'a> DropletState<'a> {
    /// Population index.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Multiplicity.
    pub fn multiplicity(&self) -> i64 {
        self.population
            .multiplicity()
            .i64s(Primitive::Array)
            .map(|n| n[self.id])
            .unwrap_or_default()
    }

    /// Per-droplet value of attribute `name`, if present.
    pub fn attribute(&self, name: &str) -> Option<f64> {
        self.population
            .attribute(name)
            .and_then(|a| a.f64s(Primitive::Array).ok())
            .map(|v| v[self.id])
    }
}

impl fmt::Debug for DropletState<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DropletState")
            .field("id", &self.id)
            .field("multiplicity", &self.multiplicity())
            .finish()
    }
}

/// Wraps a pure function of two droplets as a collision kernel.
///
/// The closure runs on the host against the population arrays, so it is
/// independent of the backend in use.
pub struct PairwiseKernel<F> {
    name: String,
    f: F,
}

impl<F> PairwiseKernel<F>
where
    F: Fn(&DropletState<'_>, &DropletState<'_>) -> f64 + Send,
{
    /// Named closure kernel.
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

impl<F> CollisionKernel for PairwiseKernel<F>
where
    F: Fn(&DropletState<'_>, &DropletState<'_>) -> f64 + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn evaluate(
        &self,
        _backend: &dyn Backend,
        population: &Population,
        _is_first: &Array,
        output: &mut Array,
    ) -> Result<()> {
        let p = Primitive::SumPair;
        if output.len() != population.len() {
            return Err(Error::shape(
                p,
                format!(
                    "kernel output of length {} for {} super-droplets",
                    output.len(),
                    population.len()
                ),
            ));
        }
        let active = population.index().active(p)?;
        let out = output.f64s_mut(p)?;
        for pair in active.chunks_exact(2) {
            let (j, k) = (pair[0] as usize, pair[1] as usize);
            if j >= out.len() || k >= out.len() {
                return Err(Error::InvalidIndex {
                    primitive: p,
                    position: 0,
                    value: j.max(k) as i64,
                    reason: "out of range",
                });
            }
            let a = DropletState { population, id: j };
            let b = DropletState { population, id: k };
            out[j] = (self.f)(&a, &b);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::{BoundedArray, Dtype};
    use crate::backend::{create_backend, BackendKind, BackendOptions};

    fn pop() -> Population {
        let mut pop = Population::new(
            vec![1, 2, 3, 4],
            vec![("volume".into(), vec![1.0, 2.0, 3.0, 4.0])],
        )
        .unwrap();
        *pop.index_mut() = BoundedArray::from_indices(vec![2, 0, 3, 1]);
        pop
    }

    #[test]
    fn golovin_sums_volumes_at_first_slot() {
        let backend = create_backend(BackendKind::Reference, BackendOptions::default()).unwrap();
        let pop = pop();
        let is_first = Array::zeros(&[4], Dtype::Bool).unwrap();
        let mut out = Array::zeros(&[4], Dtype::Float).unwrap();
        GolovinKernel::new(1.5)
            .evaluate(backend.as_ref(), &pop, &is_first, &mut out)
            .unwrap();
        assert_eq!(out.f64s(Primitive::SumPair).unwrap(), &[0.0, 0.0, 6.0, 9.0]);
    }

    #[test]
    fn golovin_reports_missing_attribute() {
        let backend = create_backend(BackendKind::Reference, BackendOptions::default()).unwrap();
        let is_first = Array::zeros(&[4], Dtype::Bool).unwrap();
        let mut out = Array::zeros(&[4], Dtype::Float).unwrap();
        let kernel = GolovinKernel {
            b: 1.0,
            attribute: "radius".into(),
        };
        assert!(kernel
            .evaluate(backend.as_ref(), &pop(), &is_first, &mut out)
            .is_err());
    }

    #[test]
    fn closure_kernel_matches_golovin() {
        let backend = create_backend(BackendKind::Optimized, BackendOptions::default()).unwrap();
        let pop = pop();
        let is_first = Array::zeros(&[4], Dtype::Bool).unwrap();
        let mut expected = Array::zeros(&[4], Dtype::Float).unwrap();
        let mut out = Array::zeros(&[4], Dtype::Float).unwrap();
        GolovinKernel::new(2.0)
            .evaluate(backend.as_ref(), &pop, &is_first, &mut expected)
            .unwrap();
        let kernel = PairwiseKernel::new("additive", |a: &DropletState<'_>, b: &DropletState<'_>| {
            2.0 * (a.attribute("volume").unwrap_or(0.0) + b.attribute("volume").unwrap_or(0.0))
        });
        kernel
            .evaluate(backend.as_ref(), &pop, &is_first, &mut out)
            .unwrap();
        assert_eq!(out, expected);
        assert_eq!(kernel.name(), "additive");
    }

    #[test]
    fn closure_sees_multiplicities() {
        let backend = create_backend(BackendKind::Reference, BackendOptions::default()).unwrap();
        let pop = pop();
        let is_first = Array::zeros(&[4], Dtype::Bool).unwrap();
        let mut out = Array::zeros(&[4], Dtype::Float).unwrap();
        PairwiseKernel::new("product", |a: &DropletState<'_>, b: &DropletState<'_>| {
            (a.multiplicity() * b.multiplicity()) as f64
        })
        .evaluate(backend.as_ref(), &pop, &is_first, &mut out)
        .unwrap();
        assert_eq!(out.f64s(Primitive::SumPair).unwrap(), &[0.0, 0.0, 3.0, 8.0]);
    }
}
