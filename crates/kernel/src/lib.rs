//! Super-Droplet Method coalescence kernel
//!
//! This crate provides the collision-coalescence core of a super-droplet
//! (particle-based, Monte-Carlo) cloud microphysics model. The engine is written
//! once against a small set of bulk array primitives and runs unchanged on any
//! backend implementing them.
//!
//! # Modules
//! - [`array`] -- Host buffers (`Array`), scalars and the bounded index view.
//! - [`backend`] -- The `Backend` trait, primitive catalogue and backend selection.
//! - [`backends`] -- Reference, optimized and rayon-parallel CPU backends.
//! - [`population`] -- Struct-of-arrays super-droplet storage.
//! - [`collision`] -- Collision kernels (constant, Golovin, closure adapter).
//! - [`coalescence`] -- Gamma policies, the pair update and the timestep engine.
//! - [`error`] -- Error type shared by every primitive.

#![warn(missing_docs)]

pub mod array;
pub mod backend;
pub mod backends;
pub mod coalescence;
pub mod collision;
pub mod error;
pub mod population;

#[cfg(feature = "gpu")]
#[allow(missing_docs)]
pub mod gpu;

pub use array::{Array, BoundedArray, Dtype, Multiplier, Scalar, Storage};
pub use backend::{
    available_backends, create_backend, scoped_call, Backend, BackendKind, BackendOptions,
    CallOptions, Capabilities, Gap, Primitive,
};
pub use coalescence::{
    normalization, Coalescence, CoalescenceSettings, CoalescenceStats, FullCoalescence,
    GammaPolicy, StepReport,
};
pub use collision::{CollisionKernel, ConstantKernel, DropletState, GolovinKernel, PairwiseKernel};
pub use error::{Error, Result};
pub use population::Population;

#[cfg(feature = "gpu")]
pub use gpu::{gpu_available, AcceleratorBackend};

// ---------------------------------------------------------------------------
// Simulation driver
// ---------------------------------------------------------------------------

/// Conservation metrics for a simulation snapshot.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ConservationMetrics {
    /// Per attribute: (name, initial total, current total, relative drift).
    pub attributes: Vec<AttributeDrift>,
    /// Real droplets represented at start.
    pub initial_droplets: i64,
    /// Real droplets represented now.
    pub droplets: i64,
    /// Active super-droplets.
    pub super_droplets: usize,
}

/// Drift of one extensive total.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct AttributeDrift {
    /// Attribute name.
    pub name: String,
    /// `sum(n * attr)` at construction.
    pub initial: f64,
    /// `sum(n * attr)` now.
    pub current: f64,
    /// `|current - initial| / |initial|`.
    pub drift: f64,
}

impl ConservationMetrics {
    /// Largest drift over all attributes.
    pub fn max_drift(&self) -> f64 {
        self.attributes.iter().map(|a| a.drift).fold(0.0, f64::max)
    }
}

/// A population, an engine and the backend that runs it.
///
/// Owns everything needed to advance the run. The population is readable and
/// writable between steps through [`Simulation::population`] and
/// [`Simulation::population_mut`].
pub struct Simulation {
    backend: Box<dyn Backend>,
    population: Population,
    engine: Coalescence,
    /// Initial totals for conservation tracking, in attribute order.
    initial_totals: Vec<f64>,
    initial_droplets: i64,
    steps: u64,
    checkpoint: Option<Checkpoint>,
}

/// Saved state for rollback.
struct Checkpoint {
    population: Population,
    steps: u64,
    rng_position: u128,
}

impl Simulation {
    /// Create a simulation. Initial totals are recorded for [`Self::metrics`].
    pub fn new(backend: Box<dyn Backend>, population: Population, engine: Coalescence) -> Result<Self> {
        let initial_totals = population
            .attribute_names()
            .iter()
            .map(|name| population.total_extensive(name))
            .collect::<Result<Vec<_>>>()?;
        let initial_droplets = population.total_multiplicity()?;
        tracing::info!(
            backend = %backend.kind(),
            kernel = engine.kernel().name(),
            super_droplets = population.active_len(),
            droplets = initial_droplets,
            "simulation created"
        );
        Ok(Self {
            backend,
            population,
            engine,
            initial_totals,
            initial_droplets,
            steps: 0,
            checkpoint: None,
        })
    }

    /// Execute one coalescence step. A failure leaves the population in an
    /// unspecified state; the run should be aborted.
    pub fn step(&mut self) -> Result<StepReport> {
        let report = self
            .engine
            .step(self.backend.as_ref(), &mut self.population)?;
        self.steps += 1;
        tracing::debug!(
            step = self.steps,
            active = report.active_after,
            pairs = report.stats.pairs,
            collisions = report.stats.collisions,
            deaths = report.stats.deaths,
            drift = report.conservation_drift,
            "step"
        );
        Ok(report)
    }

    /// Steps executed so far.
    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// Backend in use.
    pub fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    /// Engine in use.
    pub fn engine(&self) -> &Coalescence {
        &self.engine
    }

    /// Read back the current population.
    pub fn population(&self) -> &Population {
        &self.population
    }

    /// Mutable population, for exchange between steps.
    pub fn population_mut(&mut self) -> &mut Population {
        &mut self.population
    }

    /// Active super-droplets.
    pub fn super_droplet_count(&self) -> usize {
        self.population.active_len()
    }

    /// Conservation metrics against the totals at construction.
    pub fn metrics(&self) -> Result<ConservationMetrics> {
        let attributes = self
            .population
            .attribute_names()
            .iter()
            .zip(&self.initial_totals)
            .map(|(name, &initial)| {
                let current = self.population.total_extensive(name)?;
                Ok(AttributeDrift {
                    name: name.clone(),
                    initial,
                    current,
                    drift: coalescence::relative_drift(initial, current),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(ConservationMetrics {
            attributes,
            initial_droplets: self.initial_droplets,
            droplets: self.population.total_multiplicity()?,
            super_droplets: self.population.active_len(),
        })
    }

    /// Save a checkpoint of the population and of the backend's random
    /// stream position.
    pub fn save_checkpoint(&mut self) {
        self.checkpoint = Some(Checkpoint {
            population: self.population.clone(),
            steps: self.steps,
            rng_position: self.backend.rng_position(),
        });
    }

    /// Restore the last saved checkpoint, undoing any steps since save.
    /// Steps taken afterwards replay the same draws. Returns false when there
    /// is none.
    pub fn restore_checkpoint(&mut self) -> bool {
        if let Some(checkpoint) = self.checkpoint.take() {
            self.population = checkpoint.population;
            self.steps = checkpoint.steps;
            self.backend.seek_rng(checkpoint.rng_position);
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn simulation(kind: BackendKind) -> Simulation {
        let backend = create_backend(kind, BackendOptions::default()).unwrap();
        let population = Population::new(
            vec![100; 16],
            vec![("volume".into(), (1..=16).map(f64::from).collect())],
        )
        .unwrap();
        let engine = Coalescence::new(
            CoalescenceSettings::new(1.0, 1.0),
            Box::new(GolovinKernel::new(0.01)),
        );
        Simulation::new(backend, population, engine).unwrap()
    }

    #[test]
    fn steps_conserve_volume() {
        let mut sim = simulation(BackendKind::Reference);
        for _ in 0..20 {
            sim.step().unwrap();
        }
        let metrics = sim.metrics().unwrap();
        assert_eq!(sim.steps(), 20);
        assert!(metrics.max_drift() < 1e-9, "drift {}", metrics.max_drift());
        assert!(metrics.droplets <= metrics.initial_droplets);
        assert_eq!(metrics.super_droplets, sim.super_droplet_count());
    }

    #[test]
    fn checkpoint_round_trip() {
        let mut sim = simulation(BackendKind::Optimized);
        assert!(!sim.restore_checkpoint());
        sim.save_checkpoint();
        let saved = sim.population().clone();
        for _ in 0..5 {
            sim.step().unwrap();
        }
        assert!(sim.restore_checkpoint());
        assert_eq!(sim.population(), &saved);
        assert_eq!(sim.steps(), 0);
    }

    #[test]
    fn restored_run_replays_the_same_steps() {
        for kind in [BackendKind::Reference, BackendKind::Optimized, BackendKind::Parallel] {
            let mut sim = simulation(kind);
            sim.step().unwrap();
            sim.save_checkpoint();
            let first: Vec<StepReport> = (0..5).map(|_| sim.step().unwrap()).collect();
            let after_first = sim.population().clone();

            assert!(sim.restore_checkpoint());
            let replay: Vec<StepReport> = (0..5).map(|_| sim.step().unwrap()).collect();
            assert_eq!(first, replay, "{kind}");
            assert_eq!(sim.population(), &after_first, "{kind}");
        }
    }

    #[test]
    fn simulation_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<Simulation>();
    }
}
