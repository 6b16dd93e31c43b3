//! Optimized sequential backend.
//!
//! Same semantics as the reference backend, written as slice and iterator
//! passes: in-place partitioning, unstable sorts with explicit tie-breaks, and
//! an attribute-major coalescence pass that touches each attribute buffer once.

use parking_lot::Mutex;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use super::common::{self, Binary, ScalarTarget};
use crate::array::{Array, BoundedArray, Multiplier, Scalar, Storage};
use crate::backend::{scoped_call, Backend, BackendKind, BackendOptions, CallOptions, Primitive};
use crate::coalescence::{CoalescenceStats, FullCoalescence, GammaPolicy};
use crate::error::Result;

/// Tight single-threaded implementation.
pub struct OptimizedBackend {
    call: CallOptions,
    rng: Mutex<ChaCha8Rng>,
}

impl OptimizedBackend {
    /// Create an optimized backend seeded from `options`.
    pub fn new(options: BackendOptions) -> Self {
        Self {
            call: options.call,
            rng: Mutex::new(ChaCha8Rng::seed_from_u64(options.seed)),
        }
    }

    fn run<T>(&self, primitive: Primitive, f: impl FnOnce() -> Result<T>) -> Result<T> {
        scoped_call(primitive, BackendKind::Optimized, self.call, f, || {})
    }

    fn sort_index(&self, primitive: Primitive, data: &Array, index: &mut BoundedArray) -> Result<()> {
        common::check_ordering(primitive, data, index)?;
        let keys = common::numeric(primitive, data)?;
        let length = index.length();
        let values = &mut index.array_mut().i64s_mut(primitive)?[..length];

        let stable = primitive == Primitive::StableArgsort;
        let mut entries: Vec<(usize, i64)> = values.iter().copied().enumerate().collect();
        entries.sort_unstable_by(|&(pa, a), &(pb, b)| {
            keys.cmp(a as usize, b as usize)
                .then_with(|| if stable { pa.cmp(&pb) } else { a.cmp(&b) })
        });
        values
            .iter_mut()
            .zip(&entries)
            .for_each(|(slot, &(_, v))| *slot = v);
        Ok(())
    }

    fn reduce(&self, primitive: Primitive, data: &Array, index: &BoundedArray) -> Result<Scalar> {
        let active = common::check_reduction(primitive, data, index)?;
        let values = common::numeric(primitive, data)?;
        let want_min = primitive == Primitive::Amin;
        let best = active
            .iter()
            .map(|&i| i as usize)
            .reduce(|best, i| {
                let order = values.cmp(i, best);
                if (want_min && order.is_lt()) || (!want_min && order.is_gt()) {
                    i
                } else {
                    best
                }
            })
            .unwrap_or_default();
        Ok(values.scalar(best))
    }

    fn pair_op(
        &self,
        primitive: Primitive,
        output: &mut Array,
        values: &Array,
        index: &BoundedArray,
    ) -> Result<()> {
        let active = common::check_pair_op(primitive, output, values, index)?;
        let sum = primitive == Primitive::SumPair;
        match common::binary(primitive, output, values)? {
            Binary::Float(out, vals) => {
                for pair in active.chunks_exact(2) {
                    let (j, m) = (pair[0] as usize, pair[1] as usize);
                    let (a, b) = (vals[j], vals[m]);
                    out[j] = if sum { a + b } else if a >= b { a } else { b };
                }
            }
            Binary::Int(out, vals) => {
                for pair in active.chunks_exact(2) {
                    let (j, m) = (pair[0] as usize, pair[1] as usize);
                    let (a, b) = (vals[j], vals[m]);
                    out[j] = if sum { a.wrapping_add(b) } else { a.max(b) };
                }
            }
        }
        Ok(())
    }
}

impl Backend for OptimizedBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Optimized
    }

    fn rng_position(&self) -> u128 {
        self.rng.lock().get_word_pos()
    }

    fn seek_rng(&self, position: u128) {
        self.rng.lock().set_word_pos(position);
    }

    fn fill(&self, data: &mut Array, value: Scalar) -> Result<()> {
        self.run(Primitive::Fill, || {
            match common::fill_target(data, value)? {
                ScalarTarget::Float(v, x) => v.fill(x),
                ScalarTarget::Int(v, x) => v.fill(x),
                ScalarTarget::Bool(v, x) => v.fill(x),
            }
            Ok(())
        })
    }

    fn multiply(&self, data: &mut Array, multiplier: Multiplier<'_>) -> Result<()> {
        self.run(Primitive::Multiply, || {
            common::check_multiply(data, &multiplier)?;
            match multiplier {
                Multiplier::Scalar(s) => match common::scalar_multiply(data, s)? {
                    ScalarTarget::Float(v, x) => v.iter_mut().for_each(|e| *e *= x),
                    ScalarTarget::Int(v, x) => v.iter_mut().for_each(|e| *e = e.wrapping_mul(x)),
                    ScalarTarget::Bool(..) => {}
                },
                Multiplier::Elementwise(other) => {
                    match common::binary(Primitive::Multiply, data, other)? {
                        Binary::Float(v, o) => v.iter_mut().zip(o.iter()).for_each(|(e, x)| *e *= x),
                        Binary::Int(v, o) => v
                            .iter_mut()
                            .zip(o)
                            .for_each(|(e, x)| *e = e.wrapping_mul(*x)),
                    }
                }
            }
            Ok(())
        })
    }

    fn add(&self, data: &mut Array, other: &Array) -> Result<()> {
        self.run(Primitive::Add, || {
            common::check_add(data, other)?;
            match common::binary(Primitive::Add, data, other)? {
                Binary::Float(v, o) => v.iter_mut().zip(o.iter()).for_each(|(e, x)| *e += x),
                Binary::Int(v, o) => v
                    .iter_mut()
                    .zip(o)
                    .for_each(|(e, x)| *e = e.wrapping_add(*x)),
            }
            Ok(())
        })
    }

    fn floor(&self, data: &mut Array) -> Result<()> {
        self.run(Primitive::Floor, || {
            common::check_floor(data)?;
            if let Storage::Float(v) = data.storage_mut() {
                v.iter_mut().for_each(|e| *e = e.floor());
            }
            Ok(())
        })
    }

    fn urand(&self, data: &mut Array) -> Result<()> {
        self.run(Primitive::Urand, || {
            let v = data.f64s_mut(Primitive::Urand)?;
            let mut rng = self.rng.lock();
            v.iter_mut().for_each(|e| *e = rng.gen());
            Ok(())
        })
    }

    fn amin(&self, data: &Array, index: &BoundedArray) -> Result<Scalar> {
        self.run(Primitive::Amin, || self.reduce(Primitive::Amin, data, index))
    }

    fn amax(&self, data: &Array, index: &BoundedArray) -> Result<Scalar> {
        self.run(Primitive::Amax, || self.reduce(Primitive::Amax, data, index))
    }

    fn shuffle(&self, data: &mut BoundedArray, axis: usize) -> Result<()> {
        self.run(Primitive::Shuffle, || {
            let (rows, cols) = common::check_shuffle(data, axis)?;
            let length = data.length();
            let mut rng = self.rng.lock();
            if data.array().ndim() == 1 {
                match data.array_mut().storage_mut() {
                    Storage::Float(v) => v[..length].shuffle(&mut *rng),
                    Storage::Int(v) => v[..length].shuffle(&mut *rng),
                    Storage::Bool(v) => v[..length].shuffle(&mut *rng),
                }
            } else {
                let mut perm: Vec<usize> = (0..length).collect();
                perm.shuffle(&mut *rng);
                common::permute_storage(data.array_mut().storage_mut(), rows, cols, axis, &perm);
            }
            Ok(())
        })
    }

    fn argsort(&self, data: &Array, index: &mut BoundedArray) -> Result<()> {
        self.run(Primitive::Argsort, || {
            self.sort_index(Primitive::Argsort, data, index)
        })
    }

    fn stable_argsort(&self, data: &Array, index: &mut BoundedArray) -> Result<()> {
        self.run(Primitive::StableArgsort, || {
            self.sort_index(Primitive::StableArgsort, data, index)
        })
    }

    fn remove_zeros(&self, data: &Array, index: &mut BoundedArray) -> Result<usize> {
        let p = Primitive::RemoveZeros;
        self.run(p, || {
            common::check_ordering(p, data, index)?;
            let values = common::numeric(p, data)?;
            let length = index.length();
            let idx = &mut index.array_mut().i64s_mut(p)?[..length];

            let mut zeros = Vec::new();
            let mut write = 0;
            for read in 0..idx.len() {
                let v = idx[read];
                if values.is_zero(v as usize) {
                    zeros.push(v);
                } else {
                    idx[write] = v;
                    write += 1;
                }
            }
            idx[write..].copy_from_slice(&zeros);
            index.set_length(write)?;
            Ok(write)
        })
    }

    fn is_first_in_pair(&self, output: &mut Array, index: &BoundedArray) -> Result<()> {
        let p = Primitive::IsFirstInPair;
        self.run(p, || {
            common::check_first_in_pair(output, index)?;
            let length = index.length();
            let paired = length & !1;
            output.bools_mut(p)?[..length]
                .iter_mut()
                .enumerate()
                .for_each(|(i, flag)| *flag = i < paired && i & 1 == 0);
            Ok(())
        })
    }

    fn sum_pair(&self, output: &mut Array, values: &Array, index: &BoundedArray) -> Result<()> {
        self.run(Primitive::SumPair, || {
            self.pair_op(Primitive::SumPair, output, values, index)
        })
    }

    fn max_pair(&self, output: &mut Array, values: &Array, index: &BoundedArray) -> Result<()> {
        self.run(Primitive::MaxPair, || {
            self.pair_op(Primitive::MaxPair, output, values, index)
        })
    }

    fn compute_gamma(
        &self,
        gamma: &mut Array,
        probability: &Array,
        rand: &Array,
        index: &BoundedArray,
        policy: GammaPolicy,
    ) -> Result<()> {
        let p = Primitive::ComputeGamma;
        self.run(p, || {
            let inputs = common::check_gamma(gamma, probability, rand, index)?;
            let out = &mut gamma.f64s_mut(p)?[..inputs.pairs];
            for ((g, pair), &u) in out
                .iter_mut()
                .zip(inputs.active.chunks_exact(2))
                .zip(inputs.rand)
            {
                *g = common::round_gamma(inputs.probability[pair[0] as usize], u, policy);
            }
            Ok(())
        })
    }

    fn coalescence(
        &self,
        multiplicity: &mut Array,
        extensive: &mut [Array],
        gamma: &Array,
        index: &BoundedArray,
        policy: FullCoalescence,
    ) -> Result<CoalescenceStats> {
        let p = Primitive::Coalescence;
        self.run(p, || {
            let inputs = common::check_coalescence(multiplicity, extensive, gamma, index)?;
            let n = multiplicity.i64s_mut(p)?;
            let mut stats = CoalescenceStats::new(inputs.pairs);
            let mut plans = Vec::new();
            for (k, (pair, &g)) in inputs
                .active
                .chunks_exact(2)
                .zip(inputs.gamma)
                .enumerate()
            {
                if let Some(plan) =
                    common::plan_pair(k, pair[0] as usize, pair[1] as usize, n, g, policy)?
                {
                    plans.push(plan);
                }
            }
            for plan in &plans {
                plan.apply_multiplicity(n);
                stats.record(plan.g, plan.is_death());
            }
            for attr in extensive.iter_mut() {
                let values = attr.f64s_mut(p)?;
                plans.iter().for_each(|plan| plan.apply_attribute(values));
            }
            Ok(stats)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::Dtype;

    #[test]
    fn remove_zeros_keeps_both_groups_in_order() {
        let backend = OptimizedBackend::new(BackendOptions::default());
        let data = Array::from_i64(vec![0, 1, 0, 1, 1, 1, 1, 1]);
        let mut idx = BoundedArray::identity(8);
        let new_length = backend.remove_zeros(&data, &mut idx).unwrap();
        assert_eq!(new_length, 6);
        assert_eq!(
            idx.array().i64s(Primitive::RemoveZeros).unwrap(),
            &[1, 3, 4, 5, 6, 7, 0, 2]
        );
    }

    #[test]
    fn shuffle_leaves_tail_untouched() {
        let backend = OptimizedBackend::new(BackendOptions { seed: 7, ..Default::default() });
        let mut view = BoundedArray::new(Array::from_i64((0..10).collect()), 4).unwrap();
        backend.shuffle(&mut view, 0).unwrap();
        let values = view.array().i64s(Primitive::Shuffle).unwrap();
        assert_eq!(&values[4..], &[4, 5, 6, 7, 8, 9]);
        let mut head = values[..4].to_vec();
        head.sort_unstable();
        assert_eq!(head, vec![0, 1, 2, 3]);
    }

    #[test]
    fn is_first_in_pair_excludes_trailing_odd() {
        let backend = OptimizedBackend::new(BackendOptions::default());
        let mut out = Array::zeros(&[5], Dtype::Bool).unwrap();
        backend
            .is_first_in_pair(&mut out, &BoundedArray::identity(5))
            .unwrap();
        assert_eq!(
            out.bools(Primitive::IsFirstInPair).unwrap(),
            &[true, false, true, false, false]
        );
    }
}
