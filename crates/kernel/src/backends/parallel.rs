//! Data-parallel multi-core backend built on rayon.
//!
//! Elementwise work, reductions and sorts run as rayon parallel iterators.
//! Pair updates run in two phases: every pair is planned in parallel against
//! the pre-update multiplicities (pairs are disjoint, so plans never depend on
//! each other), then the plans are scattered without conflicts.
//!
//! Random numbers come from counter-based ChaCha streams: each call takes a new
//! stream id and each chunk seeks to its own word offset, so the draws do not
//! depend on the number of worker threads.

use std::sync::atomic::{AtomicU64, Ordering};

use rand::{Rng, RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;

use super::common::{self, Binary, PairPlan, ScalarTarget};
use crate::array::{Array, BoundedArray, Multiplier, Scalar, Storage};
use crate::backend::{scoped_call, Backend, BackendKind, BackendOptions, CallOptions, Primitive};
use crate::coalescence::{CoalescenceStats, FullCoalescence, GammaPolicy};
use crate::error::Result;

/// Elements per random-number chunk.
const RNG_CHUNK: usize = 4096;

/// Multi-core implementation.
pub struct ParallelBackend {
    call: CallOptions,
    seed: u64,
    stream: AtomicU64,
}

impl ParallelBackend {
    /// Create a parallel backend seeded from `options`.
    pub fn new(options: BackendOptions) -> Self {
        Self {
            call: options.call,
            seed: options.seed,
            stream: AtomicU64::new(0),
        }
    }

    fn run<T>(&self, primitive: Primitive, f: impl FnOnce() -> Result<T>) -> Result<T> {
        scoped_call(primitive, BackendKind::Parallel, self.call, f, || {})
    }

    /// Generator positioned at 64-bit draw `offset` of a fresh stream.
    fn generator(&self, stream: u64, offset: usize) -> ChaCha8Rng {
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        rng.set_stream(stream);
        // Two 32-bit words per 64-bit draw.
        rng.set_word_pos(2 * offset as u128);
        rng
    }

    fn next_stream(&self) -> u64 {
        self.stream.fetch_add(1, Ordering::Relaxed)
    }

    fn sort_index(&self, primitive: Primitive, data: &Array, index: &mut BoundedArray) -> Result<()> {
        common::check_ordering(primitive, data, index)?;
        let keys = common::numeric(primitive, data)?;
        let length = index.length();
        let values = &mut index.array_mut().i64s_mut(primitive)?[..length];

        let stable = primitive == Primitive::StableArgsort;
        let mut entries: Vec<(usize, i64)> = values.par_iter().copied().enumerate().collect();
        entries.par_sort_unstable_by(|&(pa, a), &(pb, b)| {
            keys.cmp(a as usize, b as usize)
                .then_with(|| if stable { pa.cmp(&pb) } else { a.cmp(&b) })
        });
        values
            .par_iter_mut()
            .zip(entries.par_iter())
            .for_each(|(slot, &(_, v))| *slot = v);
        Ok(())
    }

    fn reduce(&self, primitive: Primitive, data: &Array, index: &BoundedArray) -> Result<Scalar> {
        let active = common::check_reduction(primitive, data, index)?;
        let values = common::numeric(primitive, data)?;
        let want_min = primitive == Primitive::Amin;
        let best = active
            .par_iter()
            .map(|&i| i as usize)
            .reduce_with(|left, right| {
                let order = values.cmp(right, left);
                if (want_min && order.is_lt()) || (!want_min && order.is_gt()) {
                    right
                } else {
                    left
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
                let updates: Vec<(usize, f64)> = active
                    .par_chunks_exact(2)
                    .map(|pair| {
                        let (j, m) = (pair[0] as usize, pair[1] as usize);
                        let (a, b) = (vals[j], vals[m]);
                        (j, if sum { a + b } else if a >= b { a } else { b })
                    })
                    .collect();
                updates.into_iter().for_each(|(j, v)| out[j] = v);
            }
            Binary::Int(out, vals) => {
                let updates: Vec<(usize, i64)> = active
                    .par_chunks_exact(2)
                    .map(|pair| {
                        let (j, m) = (pair[0] as usize, pair[1] as usize);
                        let (a, b) = (vals[j], vals[m]);
                        (j, if sum { a.wrapping_add(b) } else { a.max(b) })
                    })
                    .collect();
                updates.into_iter().for_each(|(j, v)| out[j] = v);
            }
        }
        Ok(())
    }
}

/// Reorder the first `perm.len()` elements: `values[i] = old[perm[i]]`.
fn gather_prefix<T: Copy + Send + Sync>(values: &mut [T], perm: &[usize]) {
    let old: Vec<T> = values[..perm.len()].to_vec();
    values[..perm.len()]
        .par_iter_mut()
        .zip(perm.par_iter())
        .for_each(|(slot, &from)| *slot = old[from]);
}

impl Backend for ParallelBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Parallel
    }

    /// Draws are keyed by stream id, so the stream counter is the position.
    fn rng_position(&self) -> u128 {
        u128::from(self.stream.load(Ordering::Relaxed))
    }

    fn seek_rng(&self, position: u128) {
        self.stream.store(position as u64, Ordering::Relaxed);
    }

    fn fill(&self, data: &mut Array, value: Scalar) -> Result<()> {
        self.run(Primitive::Fill, || {
            match common::fill_target(data, value)? {
                ScalarTarget::Float(v, x) => v.par_iter_mut().for_each(|e| *e = x),
                ScalarTarget::Int(v, x) => v.par_iter_mut().for_each(|e| *e = x),
                ScalarTarget::Bool(v, x) => v.par_iter_mut().for_each(|e| *e = x),
            }
            Ok(())
        })
    }

    fn multiply(&self, data: &mut Array, multiplier: Multiplier<'_>) -> Result<()> {
        self.run(Primitive::Multiply, || {
            common::check_multiply(data, &multiplier)?;
            match multiplier {
                Multiplier::Scalar(s) => match common::scalar_multiply(data, s)? {
                    ScalarTarget::Float(v, x) => v.par_iter_mut().for_each(|e| *e *= x),
                    ScalarTarget::Int(v, x) => {
                        v.par_iter_mut().for_each(|e| *e = e.wrapping_mul(x))
                    }
                    ScalarTarget::Bool(..) => {}
                },
                Multiplier::Elementwise(other) => {
                    match common::binary(Primitive::Multiply, data, other)? {
                        Binary::Float(v, o) => v
                            .par_iter_mut()
                            .zip(o.par_iter())
                            .for_each(|(e, x)| *e *= x),
                        Binary::Int(v, o) => v
                            .par_iter_mut()
                            .zip(o.par_iter())
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
                Binary::Float(v, o) => v
                    .par_iter_mut()
                    .zip(o.par_iter())
                    .for_each(|(e, x)| *e += x),
                Binary::Int(v, o) => v
                    .par_iter_mut()
                    .zip(o.par_iter())
                    .for_each(|(e, x)| *e = e.wrapping_add(*x)),
            }
            Ok(())
        })
    }

    fn floor(&self, data: &mut Array) -> Result<()> {
        self.run(Primitive::Floor, || {
            common::check_floor(data)?;
            if let Storage::Float(v) = data.storage_mut() {
                v.par_iter_mut().for_each(|e| *e = e.floor());
            }
            Ok(())
        })
    }

    fn urand(&self, data: &mut Array) -> Result<()> {
        self.run(Primitive::Urand, || {
            let v = data.f64s_mut(Primitive::Urand)?;
            let stream = self.next_stream();
            v.par_chunks_mut(RNG_CHUNK)
                .enumerate()
                .for_each(|(c, chunk)| {
                    let mut rng = self.generator(stream, c * RNG_CHUNK);
                    chunk.iter_mut().for_each(|e| *e = rng.gen());
                });
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

            // Random-key sort: ties in the 64-bit keys fall back to position.
            let stream = self.next_stream();
            let mut keys = vec![0u64; length];
            keys.par_chunks_mut(RNG_CHUNK)
                .enumerate()
                .for_each(|(c, chunk)| {
                    let mut rng = self.generator(stream, c * RNG_CHUNK);
                    chunk.iter_mut().for_each(|k| *k = rng.next_u64());
                });
            let mut perm: Vec<usize> = (0..length).collect();
            perm.par_sort_unstable_by_key(|&p| (keys[p], p));

            if data.array().ndim() == 1 {
                match data.array_mut().storage_mut() {
                    Storage::Float(v) => gather_prefix(v, &perm),
                    Storage::Int(v) => gather_prefix(v, &perm),
                    Storage::Bool(v) => gather_prefix(v, &perm),
                }
            } else {
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

            let (kept, zeros): (Vec<i64>, Vec<i64>) = idx
                .par_iter()
                .copied()
                .partition(|&v| !values.is_zero(v as usize));
            let new_length = kept.len();
            idx[..new_length].copy_from_slice(&kept);
            idx[new_length..].copy_from_slice(&zeros);
            index.set_length(new_length)?;
            Ok(new_length)
        })
    }

    fn is_first_in_pair(&self, output: &mut Array, index: &BoundedArray) -> Result<()> {
        let p = Primitive::IsFirstInPair;
        self.run(p, || {
            common::check_first_in_pair(output, index)?;
            let length = index.length();
            let paired = length & !1;
            output.bools_mut(p)?[..length]
                .par_iter_mut()
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
            let probability = inputs.probability;
            gamma.f64s_mut(p)?[..inputs.pairs]
                .par_iter_mut()
                .zip(inputs.active.par_chunks_exact(2))
                .zip(inputs.rand[..inputs.pairs].par_iter())
                .for_each(|((g, pair), &u)| {
                    *g = common::round_gamma(probability[pair[0] as usize], u, policy);
                });
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

            let planned: Vec<Result<Option<PairPlan>>> = {
                let n = multiplicity.i64s(p)?;
                inputs
                    .active
                    .par_chunks_exact(2)
                    .zip(inputs.gamma[..inputs.pairs].par_iter())
                    .enumerate()
                    .map(|(k, (pair, &g))| {
                        common::plan_pair(k, pair[0] as usize, pair[1] as usize, n, g, policy)
                    })
                    .collect()
            };
            // Sequential scan so the lowest failing pair is the one reported.
            let mut plans = Vec::with_capacity(planned.len());
            for plan in planned {
                if let Some(plan) = plan? {
                    plans.push(plan);
                }
            }

            let n = multiplicity.i64s_mut(p)?;
            let mut stats = CoalescenceStats::new(inputs.pairs);
            for plan in &plans {
                plan.apply_multiplicity(n);
                stats.record(plan.g, plan.is_death());
            }
            extensive.par_iter_mut().try_for_each(|attr| -> Result<()> {
                let values = attr.f64s_mut(p)?;
                plans.iter().for_each(|plan| plan.apply_attribute(values));
                Ok(())
            })?;
            Ok(stats)
        })
    }
}
