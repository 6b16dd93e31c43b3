//! Validation and per-pair arithmetic shared by every backend.
//!
//! Backends differ in how they loop, not in what they compute: the gamma
//! rounding, the pair update and the key comparison all live here so that the
//! integer outputs of every backend agree bit for bit.

use std::borrow::Cow;
use std::cmp::Ordering;

use crate::array::{Array, BoundedArray, Dtype, Multiplier, Scalar, Storage};
use crate::backend::Primitive;
use crate::coalescence::{FullCoalescence, GammaPolicy};
use crate::error::{Error, Result};

// ---- Validation ----

pub(crate) fn require_1d(primitive: Primitive, array: &Array) -> Result<()> {
    if array.ndim() != 1 {
        return Err(Error::shape(
            primitive,
            format!("expected a 1-D array, got shape {:?}", array.shape()),
        ));
    }
    Ok(())
}

pub(crate) fn require_same_shape(primitive: Primitive, a: &Array, b: &Array) -> Result<()> {
    if a.shape() != b.shape() {
        return Err(Error::shape(
            primitive,
            format!("shapes {:?} and {:?} differ", a.shape(), b.shape()),
        ));
    }
    Ok(())
}

pub(crate) fn require_numeric(primitive: Primitive, array: &Array) -> Result<()> {
    match array.dtype() {
        Dtype::Float | Dtype::Int => Ok(()),
        other => Err(Error::dtype(primitive, other)),
    }
}

pub(crate) fn require_min_len(
    primitive: Primitive,
    what: &str,
    array: &Array,
    min: usize,
) -> Result<()> {
    if array.len() < min {
        return Err(Error::shape(
            primitive,
            format!("{what} holds {} entries, {min} required", array.len()),
        ));
    }
    Ok(())
}

/// Dtype rule for binary numeric updates (`multiply`, `add`, pair ops):
/// float targets accept float or int operands, int targets accept int only.
pub(crate) fn check_binary(primitive: Primitive, target: Dtype, operand: Dtype) -> Result<()> {
    match (target, operand) {
        (Dtype::Float, Dtype::Float) | (Dtype::Float, Dtype::Int) | (Dtype::Int, Dtype::Int) => {
            Ok(())
        }
        (Dtype::Bool, _) => Err(Error::dtype(primitive, Dtype::Bool)),
        (_, other) => Err(Error::dtype(primitive, other)),
    }
}

// ---- Typed operand views ----

/// Target and operand of a binary numeric update, after dtype promotion.
pub(crate) enum Binary<'a> {
    Float(&'a mut [f64], Cow<'a, [f64]>),
    Int(&'a mut [i64], &'a [i64]),
}

/// Resolve `target op= operand` under the binary dtype rule; int operands of
/// float targets are widened.
pub(crate) fn binary<'a>(
    primitive: Primitive,
    target: &'a mut Array,
    operand: &'a Array,
) -> Result<Binary<'a>> {
    check_binary(primitive, target.dtype(), operand.dtype())?;
    let target_dtype = target.dtype();
    match (target.storage_mut(), operand.storage()) {
        (Storage::Float(t), Storage::Float(o)) => Ok(Binary::Float(t, Cow::Borrowed(o))),
        (Storage::Float(t), Storage::Int(o)) => Ok(Binary::Float(
            t,
            Cow::Owned(o.iter().map(|&x| x as f64).collect()),
        )),
        (Storage::Int(t), Storage::Int(o)) => Ok(Binary::Int(t, o)),
        _ => Err(Error::dtype(primitive, target_dtype)),
    }
}

/// Target and value of a scalar update.
pub(crate) enum ScalarTarget<'a> {
    Float(&'a mut [f64], f64),
    Int(&'a mut [i64], i64),
    Bool(&'a mut [bool], bool),
}

/// Resolve a scalar multiply under the binary dtype rule.
pub(crate) fn scalar_multiply(data: &mut Array, value: Scalar) -> Result<ScalarTarget<'_>> {
    let p = Primitive::Multiply;
    check_binary(p, data.dtype(), value.dtype())?;
    scalar_target(p, data, value)
}

/// Resolve a fill: float targets accept float or int values, others their
/// own dtype only.
pub(crate) fn fill_target(data: &mut Array, value: Scalar) -> Result<ScalarTarget<'_>> {
    let p = Primitive::Fill;
    match (data.dtype(), value.dtype()) {
        (Dtype::Float, Dtype::Float)
        | (Dtype::Float, Dtype::Int)
        | (Dtype::Int, Dtype::Int)
        | (Dtype::Bool, Dtype::Bool) => scalar_target(p, data, value),
        (_, other) => Err(Error::dtype(p, other)),
    }
}

fn scalar_target(primitive: Primitive, data: &mut Array, value: Scalar) -> Result<ScalarTarget<'_>> {
    let dtype = data.dtype();
    match (data.storage_mut(), value) {
        (Storage::Float(v), Scalar::Float(x)) => Ok(ScalarTarget::Float(v, x)),
        (Storage::Float(v), Scalar::Int(x)) => Ok(ScalarTarget::Float(v, x as f64)),
        (Storage::Int(v), Scalar::Int(x)) => Ok(ScalarTarget::Int(v, x)),
        (Storage::Bool(v), Scalar::Bool(x)) => Ok(ScalarTarget::Bool(v, x)),
        _ => Err(Error::dtype(primitive, dtype)),
    }
}

/// Read-only numeric view.
#[derive(Clone, Copy)]
pub(crate) enum Numeric<'a> {
    Float(&'a [f64]),
    Int(&'a [i64]),
}

pub(crate) fn numeric(primitive: Primitive, data: &Array) -> Result<Numeric<'_>> {
    match data.storage() {
        Storage::Float(v) => Ok(Numeric::Float(v)),
        Storage::Int(v) => Ok(Numeric::Int(v)),
        Storage::Bool(_) => Err(Error::dtype(primitive, Dtype::Bool)),
    }
}

impl Numeric<'_> {
    pub fn cmp(&self, a: usize, b: usize) -> Ordering {
        match self {
            Numeric::Float(v) => cmp_f64(v[a], v[b]),
            Numeric::Int(v) => v[a].cmp(&v[b]),
        }
    }

    pub fn is_zero(&self, i: usize) -> bool {
        match self {
            Numeric::Float(v) => v[i] == 0.0,
            Numeric::Int(v) => v[i] == 0,
        }
    }

    pub fn scalar(&self, i: usize) -> Scalar {
        match self {
            Numeric::Float(v) => Scalar::Float(v[i]),
            Numeric::Int(v) => Scalar::Int(v[i]),
        }
    }
}

/// Checks of `multiply` ahead of any device work.
pub(crate) fn check_multiply(data: &Array, multiplier: &Multiplier<'_>) -> Result<()> {
    let p = Primitive::Multiply;
    match multiplier {
        Multiplier::Scalar(s) => check_binary(p, data.dtype(), s.dtype()),
        Multiplier::Elementwise(other) => {
            check_binary(p, data.dtype(), other.dtype())?;
            require_same_shape(p, data, other)
        }
    }
}

/// Checks of `add`.
pub(crate) fn check_add(data: &Array, other: &Array) -> Result<()> {
    check_binary(Primitive::Add, data.dtype(), other.dtype())?;
    require_same_shape(Primitive::Add, data, other)
}

/// Checks of `floor`: defined on floats, the identity on integers.
pub(crate) fn check_floor(data: &Array) -> Result<()> {
    require_numeric(Primitive::Floor, data)
}

/// Active index entries, checked to reference `[0, extent)`.
pub(crate) fn index_values<'a>(
    primitive: Primitive,
    index: &'a BoundedArray,
    extent: usize,
) -> Result<&'a [i64]> {
    require_1d(primitive, index.array())?;
    if index.length() > index.array().len() {
        return Err(Error::shape(
            primitive,
            format!(
                "active length {} exceeds index size {}",
                index.length(),
                index.array().len()
            ),
        ));
    }
    let active = index.active(primitive)?;
    for (position, &value) in active.iter().enumerate() {
        if value < 0 || value as usize >= extent {
            return Err(Error::InvalidIndex {
                primitive,
                position,
                value,
                reason: "out of range",
            });
        }
    }
    Ok(active)
}

/// Reject repeated entries; required wherever pairs are updated in place.
pub(crate) fn check_unique(primitive: Primitive, active: &[i64], extent: usize) -> Result<()> {
    let mut seen = vec![false; extent];
    for (position, &value) in active.iter().enumerate() {
        let slot = &mut seen[value as usize];
        if *slot {
            return Err(Error::InvalidIndex {
                primitive,
                position,
                value,
                reason: "duplicate",
            });
        }
        *slot = true;
    }
    Ok(())
}

/// Checked inputs of `coalescence`.
pub(crate) struct CoalescenceInputs<'a> {
    pub active: &'a [i64],
    pub gamma: &'a [f64],
    pub pairs: usize,
}

pub(crate) fn check_coalescence<'a>(
    multiplicity: &Array,
    extensive: &[Array],
    gamma: &'a Array,
    index: &'a BoundedArray,
) -> Result<CoalescenceInputs<'a>> {
    let p = Primitive::Coalescence;
    require_1d(p, multiplicity)?;
    multiplicity.i64s(p)?;
    let n = multiplicity.len();
    for attr in extensive {
        require_1d(p, attr)?;
        attr.f64s(p)?;
        if attr.len() != n {
            return Err(Error::shape(
                p,
                format!("attribute of length {} for {n} super-droplets", attr.len()),
            ));
        }
    }
    let active = index_values(p, index, n)?;
    check_unique(p, active, n)?;
    let pairs = active.len() / 2;
    require_1d(p, gamma)?;
    let gamma = gamma.f64s(p)?;
    if gamma.len() < pairs {
        return Err(Error::shape(
            p,
            format!("gamma holds {} entries for {pairs} pairs", gamma.len()),
        ));
    }
    Ok(CoalescenceInputs {
        active,
        gamma,
        pairs,
    })
}

/// Checked inputs of `compute_gamma`.
pub(crate) struct GammaInputs<'a> {
    pub active: &'a [i64],
    pub probability: &'a [f64],
    pub rand: &'a [f64],
    pub pairs: usize,
}

pub(crate) fn check_gamma<'a>(
    gamma: &Array,
    probability: &'a Array,
    rand: &'a Array,
    index: &'a BoundedArray,
) -> Result<GammaInputs<'a>> {
    let p = Primitive::ComputeGamma;
    for a in [gamma, probability, rand] {
        require_1d(p, a)?;
    }
    gamma.f64s(p)?;
    let probability_values = probability.f64s(p)?;
    let rand_values = rand.f64s(p)?;
    let active = index_values(p, index, probability.len())?;
    let pairs = active.len() / 2;
    require_min_len(p, "gamma", gamma, pairs)?;
    require_min_len(p, "rand", rand, pairs)?;
    for (pair, slots) in active.chunks_exact(2).enumerate() {
        let j = slots[0] as usize;
        let value = probability_values[j];
        if !(value >= 0.0) {
            return Err(Error::InvalidProbability {
                pair,
                index: j,
                value,
            });
        }
    }
    Ok(GammaInputs {
        active,
        probability: probability_values,
        rand: rand_values,
        pairs,
    })
}

/// Shape and dtype checks of `sum_pair` / `max_pair`; returns the active index.
pub(crate) fn check_pair_op<'a>(
    primitive: Primitive,
    output: &Array,
    values: &Array,
    index: &'a BoundedArray,
) -> Result<&'a [i64]> {
    require_1d(primitive, output)?;
    require_1d(primitive, values)?;
    check_binary(primitive, output.dtype(), values.dtype())?;
    if output.len() != values.len() {
        return Err(Error::shape(
            primitive,
            format!(
                "output of length {} for values of length {}",
                output.len(),
                values.len()
            ),
        ));
    }
    index_values(primitive, index, values.len())
}

/// Checks of `amin` / `amax`; returns the active index.
pub(crate) fn check_reduction<'a>(
    primitive: Primitive,
    data: &Array,
    index: &'a BoundedArray,
) -> Result<&'a [i64]> {
    require_1d(primitive, data)?;
    require_numeric(primitive, data)?;
    let active = index_values(primitive, index, data.len())?;
    if active.is_empty() {
        return Err(Error::shape(primitive, "reduction over an empty index"));
    }
    Ok(active)
}

/// Checks of `argsort`, `stable_argsort` and `remove_zeros`.
pub(crate) fn check_ordering(
    primitive: Primitive,
    data: &Array,
    index: &BoundedArray,
) -> Result<()> {
    require_1d(primitive, data)?;
    require_numeric(primitive, data)?;
    index_values(primitive, index, data.len())?;
    Ok(())
}

/// Checks of `is_first_in_pair`.
pub(crate) fn check_first_in_pair(output: &Array, index: &BoundedArray) -> Result<()> {
    let p = Primitive::IsFirstInPair;
    require_1d(p, output)?;
    output.bools(p)?;
    require_1d(p, index.array())?;
    index.active(p)?;
    require_min_len(p, "output", output, index.length())
}

/// Checks of `shuffle`; returns `(rows, cols)` of the row-major layout.
pub(crate) fn check_shuffle(data: &BoundedArray, axis: usize) -> Result<(usize, usize)> {
    let p = Primitive::Shuffle;
    let shape = data.array().shape();
    let (rows, cols) = match shape {
        [n] => (*n, 1),
        [r, c] => (*r, *c),
        _ => return Err(Error::shape(p, format!("unsupported shape {shape:?}"))),
    };
    if axis >= shape.len() {
        return Err(Error::shape(
            p,
            format!("axis {axis} out of range for shape {shape:?}"),
        ));
    }
    if data.length() > shape[axis] {
        return Err(Error::shape(
            p,
            format!(
                "length {} exceeds axis {axis} of shape {shape:?}",
                data.length()
            ),
        ));
    }
    Ok((rows, cols))
}

// ---- Ordering ----

/// Total order on float keys: IEEE order, `-0.0 == 0.0`, NaN last.
pub(crate) fn cmp_f64(a: f64, b: f64) -> Ordering {
    match a.partial_cmp(&b) {
        Some(order) => order,
        None => a.is_nan().cmp(&b.is_nan()),
    }
}

/// Apply `perm` (new position -> old position) to rows or columns of a
/// row-major buffer.
pub(crate) fn permute_axis<T: Copy>(
    values: &mut [T],
    rows: usize,
    cols: usize,
    axis: usize,
    perm: &[usize],
) {
    if axis == 0 {
        let old: Vec<T> = values[..perm.len() * cols].to_vec();
        for (new, &from) in perm.iter().enumerate() {
            values[new * cols..(new + 1) * cols].copy_from_slice(&old[from * cols..(from + 1) * cols]);
        }
    } else {
        for r in 0..rows {
            let row = &mut values[r * cols..(r + 1) * cols];
            let old: Vec<T> = row[..perm.len()].to_vec();
            for (new, &from) in perm.iter().enumerate() {
                row[new] = old[from];
            }
        }
    }
}

/// Apply a permutation to the storage of any dtype.
pub(crate) fn permute_storage(
    storage: &mut Storage,
    rows: usize,
    cols: usize,
    axis: usize,
    perm: &[usize],
) {
    match storage {
        Storage::Float(v) => permute_axis(v, rows, cols, axis, perm),
        Storage::Int(v) => permute_axis(v, rows, cols, axis, perm),
        Storage::Bool(v) => permute_axis(v, rows, cols, axis, perm),
    }
}

// ---- Gamma and pair update ----

/// Integer collision count from a continuous probability and a uniform draw.
pub(crate) fn round_gamma(probability: f64, u: f64, policy: GammaPolicy) -> f64 {
    let g = match policy {
        GammaPolicy::StochasticRound => (probability - u).ceil(),
        GammaPolicy::Floor => probability.floor(),
        GammaPolicy::Scaled => (probability * u).floor(),
    };
    if g == 0.0 {
        0.0
    } else {
        g
    }
}

/// What happens to the donor slot of a coalescing pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    /// Donor keeps a positive multiplicity.
    Partial,
    /// Donor is emptied; its content moved to the receiver.
    Purge,
    /// Receiver's droplets are split over both slots.
    Split,
}

/// Result of the integer part of a pair update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PairPlan {
    /// Slot with the larger multiplicity.
    pub donor: usize,
    /// Slot receiving the donor's droplets.
    pub receiver: usize,
    /// Applied collision count.
    pub g: i64,
    pub n_donor: i64,
    pub n_receiver: i64,
    pub outcome: Outcome,
}

impl PairPlan {
    pub fn is_death(&self) -> bool {
        self.n_donor == 0
    }

    pub fn apply_multiplicity(&self, n: &mut [i64]) {
        n[self.donor] = self.n_donor;
        n[self.receiver] = self.n_receiver;
    }

    /// Update one per-droplet extensive attribute.
    pub fn apply_attribute(&self, values: &mut [f64]) {
        let merged = values[self.receiver] + self.g as f64 * values[self.donor];
        values[self.receiver] = merged;
        match self.outcome {
            Outcome::Partial => {}
            Outcome::Purge => values[self.donor] = 0.0,
            Outcome::Split => values[self.donor] = merged,
        }
    }
}

/// Integer part of the update of pair `pair` over slots `a` and `b`.
///
/// Returns `None` when the pair does not coalesce this step.
pub(crate) fn plan_pair(
    pair: usize,
    a: usize,
    b: usize,
    n: &[i64],
    gamma: f64,
    policy: FullCoalescence,
) -> Result<Option<PairPlan>> {
    if !(gamma >= 0.0) {
        return Err(Error::InvalidGamma { pair, value: gamma });
    }
    let (donor, receiver) = if n[a] < n[b] { (b, a) } else { (a, b) };
    let (n_donor, n_receiver) = (n[donor], n[receiver]);
    if n_receiver < 0 {
        return Err(Error::NegativeMultiplicity {
            pair: Some(pair),
            index: receiver,
            value: n_receiver,
        });
    }
    if n_receiver == 0 {
        return Ok(None);
    }

    let ratio = n_donor / n_receiver;
    let floored = gamma.floor();
    let g = if floored >= ratio as f64 {
        ratio
    } else {
        floored as i64
    };
    if g == 0 {
        return Ok(None);
    }

    let remaining = n_donor - g * n_receiver;
    if remaining < 0 {
        return Err(Error::NegativeMultiplicity {
            pair: Some(pair),
            index: donor,
            value: remaining,
        });
    }

    let plan = if remaining > 0 {
        PairPlan {
            donor,
            receiver,
            g,
            n_donor: remaining,
            n_receiver,
            outcome: Outcome::Partial,
        }
    } else {
        match policy {
            FullCoalescence::Purge => PairPlan {
                donor,
                receiver,
                g,
                n_donor: 0,
                n_receiver,
                outcome: Outcome::Purge,
            },
            FullCoalescence::Split => {
                let half = n_receiver / 2;
                PairPlan {
                    donor,
                    receiver,
                    g,
                    n_donor: half,
                    n_receiver: n_receiver - half,
                    outcome: Outcome::Split,
                }
            }
        }
    };
    Ok(Some(plan))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn float_order_treats_signed_zero_equal_and_nan_last() {
        assert_eq!(cmp_f64(-0.0, 0.0), Ordering::Equal);
        assert_eq!(cmp_f64(f64::NAN, 1.0), Ordering::Greater);
        assert_eq!(cmp_f64(1.0, f64::NAN), Ordering::Less);
        assert_eq!(cmp_f64(f64::NAN, f64::NAN), Ordering::Equal);
    }

    #[test]
    fn stochastic_round_adds_event_below_fraction() {
        assert_eq!(round_gamma(2.3, 0.2, GammaPolicy::StochasticRound), 3.0);
        assert_eq!(round_gamma(2.3, 0.5, GammaPolicy::StochasticRound), 2.0);
        assert_eq!(round_gamma(0.0, 0.7, GammaPolicy::StochasticRound).to_bits(), 0);
        assert_eq!(round_gamma(2.3, 0.2, GammaPolicy::Floor), 2.0);
        assert_eq!(round_gamma(2.5, 0.5, GammaPolicy::Scaled), 1.0);
    }

    #[test]
    fn partial_plan_keeps_donor_alive() {
        let n = [5, 3];
        let plan = plan_pair(0, 0, 1, &n, 2.0, FullCoalescence::Purge)
            .unwrap()
            .unwrap();
        assert_eq!(plan.g, 1);
        assert_eq!(plan.n_donor, 2);
        assert_eq!(plan.outcome, Outcome::Partial);

        let mut v = [10.0, 6.0];
        plan.apply_attribute(&mut v);
        assert_eq!(v, [10.0, 16.0]);
    }

    #[test]
    fn donor_is_the_larger_slot() {
        let n = [3, 5];
        let plan = plan_pair(0, 0, 1, &n, 1.0, FullCoalescence::Purge)
            .unwrap()
            .unwrap();
        assert_eq!(plan.donor, 1);
        assert_eq!(plan.receiver, 0);
    }

    #[test]
    fn zero_receiver_or_gamma_skips() {
        assert!(plan_pair(0, 0, 1, &[4, 0], 3.0, FullCoalescence::Purge)
            .unwrap()
            .is_none());
        assert!(plan_pair(0, 0, 1, &[4, 2], 0.9, FullCoalescence::Purge)
            .unwrap()
            .is_none());
    }

    #[test]
    fn invalid_gamma_is_rejected() {
        for g in [-1.0, f64::NAN] {
            let err = plan_pair(4, 0, 1, &[4, 2], g, FullCoalescence::Purge).unwrap_err();
            assert!(matches!(err, Error::InvalidGamma { pair: 4, .. }));
        }
    }

    #[test]
    fn split_divides_receiver() {
        let plan = plan_pair(0, 0, 1, &[4, 2], 2.0, FullCoalescence::Split)
            .unwrap()
            .unwrap();
        assert_eq!((plan.n_donor, plan.n_receiver), (1, 1));
        let mut v = [1.0, 3.0];
        plan.apply_attribute(&mut v);
        assert_eq!(v, [5.0, 5.0]);
    }

    #[test]
    fn permute_columns_of_2d_buffer() {
        let mut v = vec![0, 1, 2, 10, 11, 12];
        permute_axis(&mut v, 2, 3, 1, &[1, 0]);
        assert_eq!(v, vec![1, 0, 2, 11, 10, 12]);
        permute_axis(&mut v, 2, 3, 0, &[1, 0]);
        assert_eq!(v, vec![11, 10, 12, 1, 0, 2]);
    }
}
