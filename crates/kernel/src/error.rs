//! Error type shared by every backend and by the coalescence engine.

use crate::array::Dtype;
use crate::backend::{BackendKind, Primitive};

/// Errors raised by array primitives and by the coalescence engine.
///
/// Primitive errors surface immediately; the engine never recovers from them
/// locally and a failed step leaves the caller to abort the run.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The buffer dtype is outside the set the primitive is defined for.
    #[error("{primitive} does not support dtype {dtype}")]
    UnsupportedDtype {
        /// Primitive that rejected the input.
        primitive: Primitive,
        /// Offending dtype.
        dtype: Dtype,
    },

    /// Operand shapes or lengths disagree.
    #[error("shape mismatch in {primitive}: {detail}")]
    ShapeMismatch {
        /// Primitive that rejected the input.
        primitive: Primitive,
        /// What disagreed.
        detail: String,
    },

    /// The backend has no implementation for this primitive and input.
    #[error("{primitive} is not implemented by the {backend} backend: {detail}")]
    NotImplemented {
        /// Missing primitive.
        primitive: Primitive,
        /// Backend that lacks it.
        backend: BackendKind,
        /// Which input combination is missing.
        detail: String,
    },

    /// An active index entry is out of range or repeated.
    #[error("invalid index in {primitive}: position {position} holds {value} ({reason})")]
    InvalidIndex {
        /// Primitive that validated the index.
        primitive: Primitive,
        /// Position inside the index array.
        position: usize,
        /// Value stored at that position.
        value: i64,
        /// Why the value is rejected.
        reason: &'static str,
    },

    /// A pair received a negative or non-finite collision count.
    #[error("gamma {value} for pair {pair} is negative or not a number")]
    InvalidGamma {
        /// Pair offset `k` (slots `2k`, `2k + 1`).
        pair: usize,
        /// Offending gamma.
        value: f64,
    },

    /// The kernel produced a negative or NaN collision probability for a pair.
    #[error("collision probability {value} for pair {pair} (population index {index}) is negative or not a number")]
    InvalidProbability {
        /// Pair offset `k`.
        pair: usize,
        /// Population index of the first-in-pair slot.
        index: usize,
        /// Offending probability.
        value: f64,
    },

    /// A multiplicity would become (or already is) negative.
    #[error("negative multiplicity {value} at population index {index}{}", pair_suffix(.pair))]
    NegativeMultiplicity {
        /// Pair that produced the value, when raised by the update.
        pair: Option<usize>,
        /// Population index of the super-droplet.
        index: usize,
        /// Offending multiplicity.
        value: i64,
    },

    /// The population total of an extensive attribute drifted.
    #[error(
        "{attribute} not conserved: before {before:e}, after {after:e} (relative error {relative_error:e})"
    )]
    MassNotConserved {
        /// Attribute name.
        attribute: String,
        /// Total before the update.
        before: f64,
        /// Total after the update.
        after: f64,
        /// |after - before| / |before|.
        relative_error: f64,
    },

    /// The requested backend cannot be created in this build or on this host.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// A device operation failed after the backend was created.
    #[error("device error: {0}")]
    Device(String),
}

fn pair_suffix(pair: &Option<usize>) -> String {
    match pair {
        Some(k) => format!(" (pair {k})"),
        None => String::new(),
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Shorthand for a [`Error::ShapeMismatch`].
    pub fn shape(primitive: Primitive, detail: impl Into<String>) -> Self {
        Self::ShapeMismatch {
            primitive,
            detail: detail.into(),
        }
    }

    /// Shorthand for an [`Error::UnsupportedDtype`].
    pub fn dtype(primitive: Primitive, dtype: Dtype) -> Self {
        Self::UnsupportedDtype { primitive, dtype }
    }

    /// Shorthand for an [`Error::NotImplemented`].
    pub fn not_implemented(
        primitive: Primitive,
        backend: BackendKind,
        detail: impl Into<String>,
    ) -> Self {
        Self::NotImplemented {
            primitive,
            backend,
            detail: detail.into(),
        }
    }

    /// Whether this is an [`Error::NotImplemented`].
    pub fn is_not_implemented(&self) -> bool {
        matches!(self, Self::NotImplemented { .. })
    }
}
