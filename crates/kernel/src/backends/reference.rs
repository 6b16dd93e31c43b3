//! Sequential reference backend.
//!
//! Every primitive is a plain indexed loop over the buffers. This backend
//! defines the expected output of every other backend and is the yardstick of
//! the cross-validation suite, so clarity wins over speed here.

use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use super::common::{self, Binary, Numeric, ScalarTarget};
use crate::array::{Array, BoundedArray, Multiplier, Scalar};
use crate::backend::{scoped_call, Backend, BackendKind, BackendOptions, CallOptions, Primitive};
use crate::coalescence::{CoalescenceStats, FullCoalescence, GammaPolicy};
use crate::error::Result;

/// Naive sequential implementation of every primitive.
pub struct ReferenceBackend {
    call: CallOptions,
    rng: Mutex<ChaCha8Rng>,
}

impl ReferenceBackend {
    /// Create a reference backend seeded from `options`.
    pub fn new(options: BackendOptions) -> Self {
        Self {
            call: options.call,
            rng: Mutex::new(ChaCha8Rng::seed_from_u64(options.seed)),
        }
    }

    fn run<T>(&self, primitive: Primitive, f: impl FnOnce() -> Result<T>) -> Result<T> {
        scoped_call(primitive, BackendKind::Reference, self.call, f, || {})
    }

    fn sort_index(&self, data: &Array, index: &mut BoundedArray, primitive: Primitive) -> Result<()> {
        common::check_ordering(primitive, data, index)?;
        let keys = common::numeric(primitive, data)?;
        let length = index.length();
        let values = index.array_mut().i64s_mut(primitive)?;

        let mut order: Vec<i64> = values[..length].to_vec();
        // Stable sort: equal keys keep their current relative order.
        order.sort_by(|&a, &b| {
            let by_key = keys.cmp(a as usize, b as usize);
            if primitive == Primitive::Argsort {
                by_key.then(a.cmp(&b))
            } else {
                by_key
            }
        });
        for i in 0..length {
            values[i] = order[i];
        }
        Ok(())
    }

    fn pair_op(
        &self,
        primitive: Primitive,
        output: &mut Array,
        values: &Array,
        index: &BoundedArray,
    ) -> Result<()> {
        let active = common::check_pair_op(primitive, output, values, index)?;
        let pairs = active.len() / 2;
        match common::binary(primitive, output, values)? {
            Binary::Float(out, vals) => {
                for k in 0..pairs {
                    let j = active[2 * k] as usize;
                    let m = active[2 * k + 1] as usize;
                    out[j] = if primitive == Primitive::SumPair {
                        vals[j] + vals[m]
                    } else if vals[j] >= vals[m] {
                        vals[j]
                    } else {
                        vals[m]
                    };
                }
            }
            Binary::Int(out, vals) => {
                for k in 0..pairs {
                    let j = active[2 * k] as usize;
                    let m = active[2 * k + 1] as usize;
                    out[j] = if primitive == Primitive::SumPair {
                        vals[j].wrapping_add(vals[m])
                    } else if vals[j] >= vals[m] {
                        vals[j]
                    } else {
                        vals[m]
                    };
                }
            }
        }
        Ok(())
    }

    fn reduce(&self, primitive: Primitive, data: &Array, index: &BoundedArray) -> Result<Scalar> {
        let active = common::check_reduction(primitive, data, index)?;
        let values = common::numeric(primitive, data)?;
        let mut best = active[0] as usize;
        for &i in &active[1..] {
            let i = i as usize;
            let better = match primitive {
                Primitive::Amin => values.cmp(i, best).is_lt(),
                _ => values.cmp(i, best).is_gt(),
            };
            if better {
                best = i;
            }
        }
        Ok(values.scalar(best))
    }
}

impl Backend for ReferenceBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Reference
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
                ScalarTarget::Float(v, x) => {
                    for i in 0..v.len() {
                        v[i] = x;
                    }
                }
                ScalarTarget::Int(v, x) => {
                    for i in 0..v.len() {
                        v[i] = x;
                    }
                }
                ScalarTarget::Bool(v, x) => {
                    for i in 0..v.len() {
                        v[i] = x;
                    }
                }
            }
            Ok(())
        })
    }

    fn multiply(&self, data: &mut Array, multiplier: Multiplier<'_>) -> Result<()> {
        self.run(Primitive::Multiply, || {
            common::check_multiply(data, &multiplier)?;
            match multiplier {
                Multiplier::Scalar(s) => match common::scalar_multiply(data, s)? {
                    ScalarTarget::Float(v, x) => {
                        for i in 0..v.len() {
                            v[i] = v[i] * x;
                        }
                    }
                    ScalarTarget::Int(v, x) => {
                        for i in 0..v.len() {
                            v[i] = v[i].wrapping_mul(x);
                        }
                    }
                    ScalarTarget::Bool(..) => {}
                },
                Multiplier::Elementwise(other) => {
                    match common::binary(Primitive::Multiply, data, other)? {
                        Binary::Float(v, o) => {
                            for i in 0..v.len() {
                                v[i] = v[i] * o[i];
                            }
                        }
                        Binary::Int(v, o) => {
                            for i in 0..v.len() {
                                v[i] = v[i].wrapping_mul(o[i]);
                            }
                        }
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
                Binary::Float(v, o) => {
                    for i in 0..v.len() {
                        v[i] = v[i] + o[i];
                    }
                }
                Binary::Int(v, o) => {
                    for i in 0..v.len() {
                        v[i] = v[i].wrapping_add(o[i]);
                    }
                }
            }
            Ok(())
        })
    }

    fn floor(&self, data: &mut Array) -> Result<()> {
        self.run(Primitive::Floor, || {
            common::check_floor(data)?;
            if let Ok(v) = data.f64s_mut(Primitive::Floor) {
                for i in 0..v.len() {
                    v[i] = v[i].floor();
                }
            }
            Ok(())
        })
    }

    fn urand(&self, data: &mut Array) -> Result<()> {
        self.run(Primitive::Urand, || {
            let v = data.f64s_mut(Primitive::Urand)?;
            let mut rng = self.rng.lock();
            for i in 0..v.len() {
                v[i] = rng.gen::<f64>();
            }
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

            // Fisher-Yates over positions, then apply to the buffer.
            let mut perm: Vec<usize> = (0..length).collect();
            let mut rng = self.rng.lock();
            for i in (1..length).rev() {
                let j = rng.gen_range(0..=i);
                perm.swap(i, j);
            }
            drop(rng);

            common::permute_storage(data.array_mut().storage_mut(), rows, cols, axis, &perm);
            Ok(())
        })
    }

    fn argsort(&self, data: &Array, index: &mut BoundedArray) -> Result<()> {
        self.run(Primitive::Argsort, || {
            self.sort_index(data, index, Primitive::Argsort)
        })
    }

    fn stable_argsort(&self, data: &Array, index: &mut BoundedArray) -> Result<()> {
        self.run(Primitive::StableArgsort, || {
            self.sort_index(data, index, Primitive::StableArgsort)
        })
    }

    fn remove_zeros(&self, data: &Array, index: &mut BoundedArray) -> Result<usize> {
        let p = Primitive::RemoveZeros;
        self.run(p, || {
            common::check_ordering(p, data, index)?;
            let values: Numeric<'_> = common::numeric(p, data)?;
            let length = index.length();
            let idx = index.array_mut().i64s_mut(p)?;

            let mut kept = Vec::with_capacity(length);
            let mut zeros = Vec::new();
            for i in 0..length {
                if values.is_zero(idx[i] as usize) {
                    zeros.push(idx[i]);
                } else {
                    kept.push(idx[i]);
                }
            }
            let new_length = kept.len();
            for (i, v) in kept.into_iter().chain(zeros).enumerate() {
                idx[i] = v;
            }
            index.set_length(new_length)?;
            Ok(new_length)
        })
    }

    fn is_first_in_pair(&self, output: &mut Array, index: &BoundedArray) -> Result<()> {
        let p = Primitive::IsFirstInPair;
        self.run(p, || {
            common::check_first_in_pair(output, index)?;
            let length = index.length();
            let paired = 2 * (length / 2);
            let out = output.bools_mut(p)?;
            for i in 0..length {
                out[i] = i % 2 == 0 && i < paired;
            }
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
            let out = gamma.f64s_mut(p)?;
            for k in 0..inputs.pairs {
                let j = inputs.active[2 * k] as usize;
                out[k] = common::round_gamma(inputs.probability[j], inputs.rand[k], policy);
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
            let mut plans = Vec::with_capacity(inputs.pairs);
            for k in 0..inputs.pairs {
                let a = inputs.active[2 * k] as usize;
                let b = inputs.active[2 * k + 1] as usize;
                if let Some(plan) = common::plan_pair(k, a, b, n, inputs.gamma[k], policy)? {
                    plans.push(plan);
                }
            }

            // Nothing is written until every pair has been planned.
            let mut stats = CoalescenceStats::new(inputs.pairs);
            for plan in &plans {
                plan.apply_multiplicity(n);
                for attr in extensive.iter_mut() {
                    plan.apply_attribute(attr.f64s_mut(p)?);
                }
                stats.record(plan.g, plan.is_death());
            }
            Ok(stats)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::Dtype;
    use crate::error::Error;

    fn backend() -> ReferenceBackend {
        ReferenceBackend::new(BackendOptions::default())
    }

    #[test]
    fn fill_rejects_bool_into_float() {
        let mut a = Array::zeros(&[3], Dtype::Float).unwrap();
        let err = backend().fill(&mut a, Scalar::Bool(true)).unwrap_err();
        assert!(matches!(err, Error::UnsupportedDtype { dtype: Dtype::Bool, .. }));
        backend().fill(&mut a, Scalar::Int(2)).unwrap();
        assert_eq!(a.f64s(Primitive::Fill).unwrap(), &[2.0, 2.0, 2.0]);
    }

    #[test]
    fn multiply_int_by_float_scalar_is_unsupported() {
        let mut a = Array::from_i64(vec![1, 2]);
        let err = backend()
            .multiply(&mut a, Multiplier::Scalar(Scalar::Float(0.7)))
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedDtype { dtype: Dtype::Float, .. }));
        backend()
            .multiply(&mut a, Multiplier::Scalar(Scalar::Int(-5)))
            .unwrap();
        assert_eq!(a.i64s(Primitive::Multiply).unwrap(), &[-5, -10]);
    }

    #[test]
    fn add_checks_shapes() {
        let mut a = Array::from_f64(vec![1.0, 2.0]);
        let b = Array::from_f64(vec![1.0]);
        assert!(matches!(
            backend().add(&mut a, &b),
            Err(Error::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn floor_is_identity_on_ints() {
        let mut a = Array::from_i64(vec![3, -4]);
        backend().floor(&mut a).unwrap();
        assert_eq!(a.i64s(Primitive::Floor).unwrap(), &[3, -4]);
        let mut f = Array::from_f64(vec![1.5, -1.5]);
        backend().floor(&mut f).unwrap();
        assert_eq!(f.f64s(Primitive::Floor).unwrap(), &[1.0, -2.0]);
    }

    #[test]
    fn urand_is_seeded() {
        let mut a = Array::zeros(&[16], Dtype::Float).unwrap();
        let mut b = Array::zeros(&[16], Dtype::Float).unwrap();
        backend().urand(&mut a).unwrap();
        backend().urand(&mut b).unwrap();
        assert_eq!(a, b);
        assert!(a
            .f64s(Primitive::Urand)
            .unwrap()
            .iter()
            .all(|&x| (0.0..1.0).contains(&x)));
    }

    #[test]
    fn amin_over_index_subset() {
        let data = Array::from_f64(vec![5.0, -1.0, 3.0, 0.5]);
        let idx = BoundedArray::new(Array::from_i64(vec![3, 2, 1, 0]), 2).unwrap();
        assert_eq!(backend().amin(&data, &idx).unwrap(), Scalar::Float(0.5));
        assert_eq!(backend().amax(&data, &idx).unwrap(), Scalar::Float(3.0));
        let empty = BoundedArray::new(Array::from_i64(vec![0]), 0).unwrap();
        assert!(backend().amin(&data, &empty).is_err());
    }

    #[test]
    fn argsort_breaks_ties_by_index_value() {
        let data = Array::from_i64(vec![1, 0, 1, 0]);
        let mut idx = BoundedArray::from_indices(vec![2, 0, 3, 1]);
        backend().argsort(&data, &mut idx).unwrap();
        assert_eq!(idx.active(Primitive::Argsort).unwrap(), &[1, 3, 0, 2]);

        let mut idx = BoundedArray::from_indices(vec![2, 0, 3, 1]);
        backend().stable_argsort(&data, &mut idx).unwrap();
        assert_eq!(idx.active(Primitive::StableArgsort).unwrap(), &[3, 1, 2, 0]);
    }

    #[test]
    fn pair_ops_write_first_slot_only() {
        let values = Array::from_i64(vec![1, 4, 2, 8, 9]);
        let idx = BoundedArray::from_indices(vec![3, 0, 2, 1, 4]);
        let mut out = Array::zeros(&[5], Dtype::Float).unwrap();
        backend().max_pair(&mut out, &values, &idx).unwrap();
        assert_eq!(out.f64s(Primitive::MaxPair).unwrap(), &[0.0, 0.0, 4.0, 8.0, 0.0]);
        backend().sum_pair(&mut out, &values, &idx).unwrap();
        assert_eq!(out.f64s(Primitive::SumPair).unwrap(), &[0.0, 0.0, 6.0, 9.0, 0.0]);
    }

    #[test]
    fn failed_coalescence_leaves_arrays_untouched() {
        let mut n = Array::from_i64(vec![5, 3, 4, 2]);
        let mut attrs = vec![Array::from_f64(vec![10.0, 6.0, 1.0, 3.0])];
        let gamma = Array::from_f64(vec![2.0, f64::NAN]);
        let idx = BoundedArray::identity(4);
        let err = backend()
            .coalescence(&mut n, &mut attrs, &gamma, &idx, FullCoalescence::Purge)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidGamma { pair: 1, .. }));
        assert_eq!(n, Array::from_i64(vec![5, 3, 4, 2]));
        assert_eq!(attrs[0], Array::from_f64(vec![10.0, 6.0, 1.0, 3.0]));
    }

    #[test]
    fn coalescence_rejects_duplicate_index() {
        let mut n = Array::from_i64(vec![5, 3]);
        let mut attrs = vec![Array::from_f64(vec![1.0, 1.0])];
        let gamma = Array::from_f64(vec![1.0]);
        let idx = BoundedArray::from_indices(vec![0, 0]);
        let err = backend()
            .coalescence(&mut n, &mut attrs, &gamma, &idx, FullCoalescence::Purge)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidIndex { reason: "duplicate", .. }));
    }
}
