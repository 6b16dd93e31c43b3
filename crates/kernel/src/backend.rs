//! The backend abstraction: one trait, four interchangeable implementations.
//!
//! The engine is written once against [`Backend`]; the concrete backend is
//! chosen at construction time through [`create_backend`] and never inspected
//! again. Cross-cutting call behaviour (device synchronisation, tracing) is
//! passed explicitly as [`CallOptions`] and applied by [`scoped_call`].

use std::fmt;
use std::str::FromStr;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::array::{Array, BoundedArray, Dtype, Multiplier, Scalar};
use crate::backends::{OptimizedBackend, ParallelBackend, ReferenceBackend};
use crate::coalescence::{CoalescenceStats, FullCoalescence, GammaPolicy};
use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Primitive catalogue
// ---------------------------------------------------------------------------

/// Names of the backend primitives, used in errors, traces and capability
/// tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum Primitive {
    Array,
    Fill,
    Multiply,
    Add,
    Floor,
    Urand,
    Amin,
    Amax,
    Shuffle,
    Argsort,
    StableArgsort,
    RemoveZeros,
    IsFirstInPair,
    SumPair,
    MaxPair,
    ComputeGamma,
    Coalescence,
}

impl Primitive {
    /// Every primitive, in catalogue order.
    pub const ALL: [Primitive; 17] = [
        Primitive::Array,
        Primitive::Fill,
        Primitive::Multiply,
        Primitive::Add,
        Primitive::Floor,
        Primitive::Urand,
        Primitive::Amin,
        Primitive::Amax,
        Primitive::Shuffle,
        Primitive::Argsort,
        Primitive::StableArgsort,
        Primitive::RemoveZeros,
        Primitive::IsFirstInPair,
        Primitive::SumPair,
        Primitive::MaxPair,
        Primitive::ComputeGamma,
        Primitive::Coalescence,
    ];

    /// Snake-case name.
    pub fn name(&self) -> &'static str {
        match self {
            Primitive::Array => "array",
            Primitive::Fill => "fill",
            Primitive::Multiply => "multiply",
            Primitive::Add => "add",
            Primitive::Floor => "floor",
            Primitive::Urand => "urand",
            Primitive::Amin => "amin",
            Primitive::Amax => "amax",
            Primitive::Shuffle => "shuffle",
            Primitive::Argsort => "argsort",
            Primitive::StableArgsort => "stable_argsort",
            Primitive::RemoveZeros => "remove_zeros",
            Primitive::IsFirstInPair => "is_first_in_pair",
            Primitive::SumPair => "sum_pair",
            Primitive::MaxPair => "max_pair",
            Primitive::ComputeGamma => "compute_gamma",
            Primitive::Coalescence => "coalescence",
        }
    }
}

impl fmt::Display for Primitive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ---------------------------------------------------------------------------
// Backend selection
// ---------------------------------------------------------------------------

/// Which backend implementation to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum BackendKind {
    /// Naive sequential loops; the semantic yardstick for the others.
    #[default]
    Reference,
    /// Sequential, slice-oriented passes.
    Optimized,
    /// Multi-core data parallelism.
    Parallel,
    /// GPU compute shaders (requires the `gpu` feature).
    Accelerator,
}

impl BackendKind {
    /// Every backend kind.
    pub const ALL: [BackendKind; 4] = [
        BackendKind::Reference,
        BackendKind::Optimized,
        BackendKind::Parallel,
        BackendKind::Accelerator,
    ];

    /// Lower-case name.
    pub fn name(&self) -> &'static str {
        match self {
            BackendKind::Reference => "reference",
            BackendKind::Optimized => "optimized",
            BackendKind::Parallel => "parallel",
            BackendKind::Accelerator => "accelerator",
        }
    }

    /// Documented capability gaps of this backend.
    pub fn capabilities(&self) -> Capabilities {
        match self {
            BackendKind::Reference | BackendKind::Optimized | BackendKind::Parallel => {
                Capabilities { gaps: &[] }
            }
            BackendKind::Accelerator => Capabilities {
                gaps: &[
                    Gap {
                        primitive: Primitive::Fill,
                        dtype: Some(Dtype::Bool),
                        note: "boolean buffers are host-only",
                    },
                    Gap {
                        primitive: Primitive::Shuffle,
                        dtype: Some(Dtype::Bool),
                        note: "boolean buffers are host-only",
                    },
                    Gap {
                        primitive: Primitive::Shuffle,
                        dtype: None,
                        note: "2-D arrays are not shuffled on the device",
                    },
                ],
            },
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "reference" => Ok(BackendKind::Reference),
            "optimized" => Ok(BackendKind::Optimized),
            "parallel" => Ok(BackendKind::Parallel),
            "accelerator" | "gpu" => Ok(BackendKind::Accelerator),
            other => Err(format!("unknown backend '{other}'")),
        }
    }
}

/// One documented hole in a backend's coverage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gap {
    /// Primitive concerned.
    pub primitive: Primitive,
    /// Dtype concerned; `None` means a shape restriction instead.
    pub dtype: Option<Dtype>,
    /// Human-readable description.
    pub note: &'static str,
}

/// Capability table of a backend. Anything not listed as a gap is supported
/// for every dtype the primitive itself is defined on.
#[derive(Debug, Clone, Copy)]
pub struct Capabilities {
    /// Known gaps.
    pub gaps: &'static [Gap],
}

impl Capabilities {
    /// Whether `primitive` is available for `dtype`.
    pub fn supports(&self, primitive: Primitive, dtype: Dtype) -> bool {
        !self
            .gaps
            .iter()
            .any(|g| g.primitive == primitive && g.dtype == Some(dtype))
    }

    /// Whether `primitive` is available for `array`, taking shape gaps into
    /// account for arrays of more than one dimension.
    pub fn supports_array(&self, primitive: Primitive, array: &Array) -> bool {
        self.supports(primitive, array.dtype())
            && (array.ndim() < 2
                || !self
                    .gaps
                    .iter()
                    .any(|g| g.primitive == primitive && g.dtype.is_none()))
    }
}

// ---------------------------------------------------------------------------
// Scoped call wrapper
// ---------------------------------------------------------------------------

/// Per-call behaviour applied around every primitive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallOptions {
    /// Block until the device has finished the call.
    #[serde(default)]
    pub synchronize: bool,
    /// Emit a `tracing` debug event per call with its duration.
    #[serde(default)]
    pub trace: bool,
}

/// Construction parameters shared by every backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendOptions {
    /// Seed of the backend's random stream.
    pub seed: u64,
    /// Call wrapper configuration.
    #[serde(default)]
    pub call: CallOptions,
}

impl Default for BackendOptions {
    fn default() -> Self {
        Self {
            seed: 44,
            call: CallOptions::default(),
        }
    }
}

/// Run `run` as primitive `primitive` of backend `kind`, applying `options`.
///
/// `synchronize` is the backend's completion hook; it is invoked after the
/// call when requested, whether or not the call succeeded.
pub fn scoped_call<T>(
    primitive: Primitive,
    kind: BackendKind,
    options: CallOptions,
    run: impl FnOnce() -> Result<T>,
    synchronize: impl FnOnce(),
) -> Result<T> {
    let start = options.trace.then(Instant::now);
    let result = run();
    if options.synchronize {
        synchronize();
    }
    if let Some(start) = start {
        tracing::debug!(
            backend = %kind,
            primitive = %primitive,
            elapsed_us = start.elapsed().as_micros() as u64,
            ok = result.is_ok(),
            "primitive call"
        );
    }
    result
}

// ---------------------------------------------------------------------------
// Backend trait
// ---------------------------------------------------------------------------

/// Bulk array primitives the coalescence engine is written against.
///
/// Every operation reads and writes whole buffers. Operations taking a
/// [`BoundedArray`] index never touch entries beyond its active length. Pair
/// operations address pair `k` as `(index[2k], index[2k + 1])` for
/// `k < length / 2`.
pub trait Backend: Send + Sync {
    /// Which implementation this is.
    fn kind(&self) -> BackendKind;

    /// Capability table.
    fn capabilities(&self) -> Capabilities {
        self.kind().capabilities()
    }

    /// Block until every submitted operation has completed.
    fn synchronize(&self) {}

    /// Current position of the random stream.
    fn rng_position(&self) -> u128;

    /// Move the random stream back (or forward) to a position taken from
    /// [`Self::rng_position`]; later draws repeat the ones made from there.
    fn seek_rng(&self, position: u128);

    /// Zero-initialised buffer.
    fn array(&self, shape: &[usize], dtype: Dtype) -> Result<Array> {
        Array::zeros(shape, dtype)
    }

    /// Assign `value` to every element.
    fn fill(&self, data: &mut Array, value: Scalar) -> Result<()>;

    /// In-place product with a scalar or an equally shaped array.
    fn multiply(&self, data: &mut Array, multiplier: Multiplier<'_>) -> Result<()>;

    /// In-place elementwise sum.
    fn add(&self, data: &mut Array, other: &Array) -> Result<()>;

    /// Elementwise floor toward negative infinity.
    fn floor(&self, data: &mut Array) -> Result<()>;

    /// Independent uniform draws in `[0, 1)`.
    fn urand(&self, data: &mut Array) -> Result<()>;

    /// Minimum of `data[index[0..length]]`.
    fn amin(&self, data: &Array, index: &BoundedArray) -> Result<Scalar>;

    /// Maximum of `data[index[0..length]]`.
    fn amax(&self, data: &Array, index: &BoundedArray) -> Result<Scalar>;

    /// Random permutation of the first `length` entries along `axis`.
    fn shuffle(&self, data: &mut BoundedArray, axis: usize) -> Result<()>;

    /// Order the active index by `data`, ties broken by index value.
    fn argsort(&self, data: &Array, index: &mut BoundedArray) -> Result<()>;

    /// Order the active index by `data`, ties kept in their original order.
    fn stable_argsort(&self, data: &Array, index: &mut BoundedArray) -> Result<()>;

    /// Move entries referencing zeros behind the others (both groups keep
    /// their order), shrink the active length and return it.
    fn remove_zeros(&self, data: &Array, index: &mut BoundedArray) -> Result<usize>;

    /// Mark even slots of the paired region.
    fn is_first_in_pair(&self, output: &mut Array, index: &BoundedArray) -> Result<()>;

    /// `output[index[2k]] = values[index[2k]] + values[index[2k+1]]`.
    fn sum_pair(&self, output: &mut Array, values: &Array, index: &BoundedArray) -> Result<()>;

    /// `output[index[2k]] = max(values[index[2k]], values[index[2k+1]])`.
    fn max_pair(&self, output: &mut Array, values: &Array, index: &BoundedArray) -> Result<()>;

    /// Integer collision counts per pair from the probability at the first
    /// slot and the pair's uniform draw.
    fn compute_gamma(
        &self,
        gamma: &mut Array,
        probability: &Array,
        rand: &Array,
        index: &BoundedArray,
        policy: GammaPolicy,
    ) -> Result<()>;

    /// Apply `gamma[k]` collisions to every pair, updating multiplicities and
    /// per-droplet extensive attributes in place.
    fn coalescence(
        &self,
        multiplicity: &mut Array,
        extensive: &mut [Array],
        gamma: &Array,
        index: &BoundedArray,
        policy: FullCoalescence,
    ) -> Result<CoalescenceStats>;
}

/// Create a backend of the given kind.
///
/// Fails with [`Error::BackendUnavailable`] for the accelerator when the crate
/// is built without the `gpu` feature or no suitable adapter exists.
pub fn create_backend(kind: BackendKind, options: BackendOptions) -> Result<Box<dyn Backend>> {
    tracing::info!(backend = %kind, seed = options.seed, "creating backend");
    match kind {
        BackendKind::Reference => Ok(Box::new(ReferenceBackend::new(options))),
        BackendKind::Optimized => Ok(Box::new(OptimizedBackend::new(options))),
        BackendKind::Parallel => Ok(Box::new(ParallelBackend::new(options))),
        #[cfg(feature = "gpu")]
        BackendKind::Accelerator => Ok(Box::new(crate::gpu::AcceleratorBackend::new(options)?)),
        #[cfg(not(feature = "gpu"))]
        BackendKind::Accelerator => Err(Error::BackendUnavailable(
            "accelerator backend requires the 'gpu' feature".to_string(),
        )),
    }
}

/// Backend kinds that can be created in this build and on this host.
pub fn available_backends() -> Vec<BackendKind> {
    #[allow(unused_mut)]
    let mut kinds = vec![
        BackendKind::Reference,
        BackendKind::Optimized,
        BackendKind::Parallel,
    ];
    #[cfg(feature = "gpu")]
    {
        if crate::gpu::gpu_available() {
            kinds.push(BackendKind::Accelerator);
        }
    }
    kinds
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_round_trips_through_name() {
        for kind in BackendKind::ALL {
            assert_eq!(kind.name().parse::<BackendKind>().unwrap(), kind);
        }
        assert!("cuda".parse::<BackendKind>().is_err());
    }

    #[test]
    fn accelerator_documents_its_gaps() {
        let caps = BackendKind::Accelerator.capabilities();
        assert!(!caps.supports(Primitive::Fill, Dtype::Bool));
        assert!(caps.supports(Primitive::Fill, Dtype::Float));
        assert!(BackendKind::Reference
            .capabilities()
            .supports(Primitive::Shuffle, Dtype::Bool));

        let rows = Array::zeros(&[3, 2], Dtype::Int).unwrap();
        let flat = Array::zeros(&[6], Dtype::Int).unwrap();
        assert!(!caps.supports_array(Primitive::Shuffle, &rows));
        assert!(caps.supports_array(Primitive::Shuffle, &flat));
        assert!(caps.supports_array(Primitive::Fill, &rows));
    }

    #[test]
    fn scoped_call_runs_sync_hook_when_requested() {
        let mut synced = false;
        let options = CallOptions {
            synchronize: true,
            trace: true,
        };
        let out = scoped_call(
            Primitive::Fill,
            BackendKind::Reference,
            options,
            || Ok(7),
            || synced = true,
        )
        .unwrap();
        assert_eq!(out, 7);
        assert!(synced);
    }

    #[test]
    fn scoped_call_skips_sync_by_default() {
        let mut synced = false;
        let err = scoped_call::<()>(
            Primitive::Floor,
            BackendKind::Optimized,
            CallOptions::default(),
            || Err(Error::dtype(Primitive::Floor, Dtype::Bool)),
            || synced = true,
        );
        assert!(err.is_err());
        assert!(!synced);
    }

    #[cfg(not(feature = "gpu"))]
    #[test]
    fn accelerator_unavailable_without_feature() {
        let err = create_backend(BackendKind::Accelerator, BackendOptions::default());
        assert!(matches!(err, Err(Error::BackendUnavailable(_))));
    }
}
