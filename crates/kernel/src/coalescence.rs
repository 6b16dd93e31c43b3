//! The coalescence engine: one Monte-Carlo collision step over a population.
//!
//! Each step pairs the active super-droplets at random, evaluates the
//! collision kernel per pair, turns it into an integer number of collision
//! events (`gamma`) and applies them to multiplicities and extensive
//! attributes. Every stage is a backend primitive, so the same engine runs on
//! all backends.

use serde::{Deserialize, Serialize};

use crate::array::{Array, Dtype, Multiplier, Scalar};
use crate::backend::Backend;
use crate::collision::CollisionKernel;
use crate::error::{Error, Result};
use crate::population::Population;

// ---------------------------------------------------------------------------
// Policies
// ---------------------------------------------------------------------------

/// How the continuous collision probability becomes an integer event count.
///
/// `u` is the pair's uniform draw in `[0, 1)`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum GammaPolicy {
    /// `ceil(p - u)`: `floor(p)` plus one more event with probability equal
    /// to the fractional part of `p`.
    #[default]
    StochasticRound,
    /// `floor(p)`, ignoring the draw.
    Floor,
    /// `floor(p * u)`.
    Scaled,
}

/// What happens when a pair's donor is completely absorbed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FullCoalescence {
    /// Donor multiplicity drops to zero and the slot is compacted away.
    #[default]
    Purge,
    /// Receiver droplets are split evenly over both slots.
    Split,
}

// ---------------------------------------------------------------------------
// Statistics and reports
// ---------------------------------------------------------------------------

/// Outcome counts of one `coalescence` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoalescenceStats {
    /// Candidate pairs.
    pub pairs: usize,
    /// Pairs with at least one applied event.
    pub coalescing_pairs: usize,
    /// Applied events, summed over pairs.
    pub collisions: u64,
    /// Super-droplets whose multiplicity dropped to zero.
    pub deaths: usize,
}

impl CoalescenceStats {
    pub(crate) fn new(pairs: usize) -> Self {
        Self {
            pairs,
            ..Self::default()
        }
    }

    pub(crate) fn record(&mut self, g: i64, death: bool) {
        self.coalescing_pairs += 1;
        self.collisions += g as u64;
        if death {
            self.deaths += 1;
        }
    }
}

/// Summary of one engine step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StepReport {
    /// Active super-droplets before the step.
    pub active_before: usize,
    /// Active super-droplets after compaction.
    pub active_after: usize,
    /// Update statistics.
    pub stats: CoalescenceStats,
    /// Largest relative drift of an extensive total (0 when not checked).
    pub conservation_drift: f64,
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Engine parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CoalescenceSettings {
    /// Timestep (s).
    pub dt: f64,
    /// Volume of the domain the super-droplets share (m^3).
    pub dv: f64,
    /// Probability-to-count conversion.
    #[serde(default)]
    pub gamma_policy: GammaPolicy,
    /// Full-coalescence handling.
    #[serde(default)]
    pub full_coalescence: FullCoalescence,
    /// Check that every extensive total is unchanged after each step.
    #[serde(default = "default_verify")]
    pub verify_conservation: bool,
    /// Relative tolerance of the conservation check.
    #[serde(default = "default_tolerance")]
    pub conservation_tolerance: f64,
}

fn default_verify() -> bool {
    true
}

fn default_tolerance() -> f64 {
    1e-9
}

impl CoalescenceSettings {
    /// Settings with default policies for the given timestep and volume.
    pub fn new(dt: f64, dv: f64) -> Self {
        Self {
            dt,
            dv,
            gamma_policy: GammaPolicy::default(),
            full_coalescence: FullCoalescence::default(),
            verify_conservation: default_verify(),
            conservation_tolerance: default_tolerance(),
        }
    }
}

/// Scale from kernel value to per-pair probability for `length` active
/// super-droplets.
///
/// Sampling `length / 2` disjoint pairs stands in for all
/// `length (length - 1) / 2` candidate pairs, so each sampled pair carries the
/// ratio of the two counts.
pub fn normalization(dt: f64, dv: f64, length: usize) -> f64 {
    if length < 2 {
        return 0.0;
    }
    let candidates = (length * (length - 1)) as f64 / 2.0;
    let sampled = (length / 2) as f64;
    dt / dv * candidates / sampled
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Scratch buffers, sized for one population.
struct Scratch {
    is_first: Array,
    probability: Array,
    n_max: Array,
    rand: Array,
    gamma: Array,
}

impl Scratch {
    fn allocate(backend: &dyn Backend, n: usize) -> Result<Self> {
        let pairs = n / 2;
        Ok(Self {
            is_first: backend.array(&[n], Dtype::Bool)?,
            probability: backend.array(&[n], Dtype::Float)?,
            n_max: backend.array(&[n], Dtype::Float)?,
            rand: backend.array(&[pairs], Dtype::Float)?,
            gamma: backend.array(&[pairs], Dtype::Float)?,
        })
    }

    fn population_len(&self) -> usize {
        self.probability.len()
    }
}

/// Monte-Carlo coalescence engine.
pub struct Coalescence {
    settings: CoalescenceSettings,
    kernel: Box<dyn CollisionKernel>,
    scratch: Option<Scratch>,
}

impl Coalescence {
    /// Engine with the given kernel. Scratch buffers are allocated on the
    /// first step.
    pub fn new(settings: CoalescenceSettings, kernel: Box<dyn CollisionKernel>) -> Self {
        Self {
            settings,
            kernel,
            scratch: None,
        }
    }

    /// Current settings.
    pub fn settings(&self) -> &CoalescenceSettings {
        &self.settings
    }

    /// Kernel in use.
    pub fn kernel(&self) -> &dyn CollisionKernel {
        self.kernel.as_ref()
    }

    /// Advance `population` by one timestep.
    ///
    /// Fails on the first primitive error; the population may then be
    /// partially updated and should not be stepped further.
    pub fn step(&mut self, backend: &dyn Backend, population: &mut Population) -> Result<StepReport> {
        // Empty slots left by construction or by external writes
        if population.active_len() > 0 {
            let (multiplicity, _, index) = population.parts_mut();
            if backend.amin(multiplicity, index)? == Scalar::Int(0) {
                backend.remove_zeros(multiplicity, index)?;
            }
        }

        let active_before = population.active_len();
        if active_before < 2 {
            return Ok(StepReport {
                active_before,
                active_after: active_before,
                ..StepReport::default()
            });
        }

        let n = population.len();
        let scratch = match self.scratch.take() {
            Some(scratch) if scratch.population_len() == n => scratch,
            _ => Scratch::allocate(backend, n)?,
        };
        let scratch = self.scratch.insert(scratch);
        let settings = self.settings;

        let totals_before = if settings.verify_conservation {
            Some(extensive_totals(population)?)
        } else {
            None
        };

        // Random pairing
        backend.shuffle(population.index_mut(), 0)?;
        backend.is_first_in_pair(&mut scratch.is_first, population.index())?;

        // Kernel -> probability
        backend.fill(&mut scratch.probability, Scalar::Float(0.0))?;
        self.kernel
            .evaluate(backend, population, &scratch.is_first, &mut scratch.probability)?;
        backend.max_pair(&mut scratch.n_max, population.multiplicity(), population.index())?;
        backend.multiply(&mut scratch.probability, Multiplier::Elementwise(&scratch.n_max))?;
        let norm = normalization(settings.dt, settings.dv, active_before);
        backend.multiply(&mut scratch.probability, Multiplier::Scalar(Scalar::Float(norm)))?;

        // Probability -> events
        backend.urand(&mut scratch.rand)?;
        backend.compute_gamma(
            &mut scratch.gamma,
            &scratch.probability,
            &scratch.rand,
            population.index(),
            settings.gamma_policy,
        )?;

        let (multiplicity, extensive, index) = population.parts_mut();
        let stats = backend.coalescence(
            multiplicity,
            extensive,
            &scratch.gamma,
            index,
            settings.full_coalescence,
        )?;
        if stats.deaths > 0 {
            backend.remove_zeros(multiplicity, index)?;
        }

        let conservation_drift = match totals_before {
            Some(before) => check_conservation(population, &before, settings.conservation_tolerance)?,
            None => 0.0,
        };

        Ok(StepReport {
            active_before,
            active_after: population.active_len(),
            stats,
            conservation_drift,
        })
    }
}

fn extensive_totals(population: &Population) -> Result<Vec<f64>> {
    population
        .attribute_names()
        .iter()
        .map(|name| population.total_extensive(name))
        .collect()
}

/// Relative drift of a total; absolute drift when the initial total is zero.
pub(crate) fn relative_drift(before: f64, after: f64) -> f64 {
    if before.abs() > 0.0 {
        ((after - before) / before).abs()
    } else {
        (after - before).abs()
    }
}

/// Largest relative drift across attributes, or `MassNotConserved` for the
/// first attribute over `tolerance`.
fn check_conservation(population: &Population, before: &[f64], tolerance: f64) -> Result<f64> {
    let mut worst = 0.0_f64;
    for (name, &b) in population.attribute_names().iter().zip(before) {
        let after = population.total_extensive(name)?;
        let drift = relative_drift(b, after);
        if !(drift <= tolerance) {
            return Err(Error::MassNotConserved {
                attribute: name.clone(),
                before: b,
                after,
                relative_error: drift,
            });
        }
        worst = worst.max(drift);
    }
    Ok(worst)
}
