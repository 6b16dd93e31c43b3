//! Conformance suite for SDM kernel backends
//!
//! Every primitive of a candidate backend is run on the same inputs as the
//! reference backend and the outputs are compared: integer and boolean
//! results exactly, float results to a relative tolerance of
//! [`FLOAT_TOLERANCE`]. Random primitives (`urand`, `shuffle`) are checked by
//! property instead, since each backend owns its own stream.
//!
//! Inputs sweep 1-D sizes [`SIZES`] plus 2-D layouts, active lengths of zero,
//! half and full, and ascending, descending and random index orders. All data
//! is drawn from a seeded ChaCha stream so failures reproduce.

pub mod analytical;

#[cfg(test)]
mod tests;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use sdm_kernel::{
    create_backend, Array, Backend, BackendKind, BackendOptions, BoundedArray, Capabilities,
    Dtype, Error, FullCoalescence, GammaPolicy, Multiplier, Primitive, Scalar, Storage,
};
use std::fmt;

/// 1-D sizes every primitive is exercised on.
pub const SIZES: [usize; 5] = [1, 2, 3, 8, 87];

/// Relative tolerance of float comparisons.
pub const FLOAT_TOLERANCE: f64 = 1e-12;

/// Seed of both the data stream and the backends under test.
pub const SEED: u64 = 44;

/// Order of the entries of a generated index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexOrder {
    /// `0, 1, .., n - 1`
    Ascending,
    /// `n - 1, .., 0`
    Descending,
    /// Seeded random permutation
    Random,
}

/// Active length of a generated index relative to its capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Length {
    /// No active entries
    Zero,
    /// `n / 2` active entries
    Middle,
    /// Every entry active
    Full,
}

impl Length {
    fn of(self, n: usize) -> usize {
        match self {
            Length::Zero => 0,
            Length::Middle => n / 2,
            Length::Full => n,
        }
    }
}

const ORDERS: [IndexOrder; 3] = [IndexOrder::Ascending, IndexOrder::Descending, IndexOrder::Random];
const LENGTHS: [Length; 3] = [Length::Zero, Length::Middle, Length::Full];

/// Result of checking one primitive over all its cases
#[derive(Debug)]
pub struct CheckResult {
    /// Check name
    pub name: String,
    /// Whether every case passed
    pub passed: bool,
    /// Cases executed
    pub cases: usize,
    /// Cases skipped for a documented capability gap
    pub skipped: usize,
    /// First failures, if any
    pub message: Option<String>,
}

/// Result of running the whole suite against one backend
#[derive(Debug)]
pub struct SuiteResult {
    /// Backend under test
    pub backend: BackendKind,
    /// Whether every check passed
    pub passed: bool,
    /// Individual check results
    pub checks: Vec<CheckResult>,
}

impl SuiteResult {
    /// Failed checks.
    pub fn failures(&self) -> impl Iterator<Item = &CheckResult> {
        self.checks.iter().filter(|c| !c.passed)
    }

    /// Print a summary of the suite result
    pub fn print_summary(&self) {
        println!("\n{}", "=".repeat(80));
        println!("Backend: {}", self.backend);
        println!("{}", "=".repeat(80));
        println!("Status: {}", if self.passed { "PASSED" } else { "FAILED" });
        let cases: usize = self.checks.iter().map(|c| c.cases).sum();
        let skipped: usize = self.checks.iter().map(|c| c.skipped).sum();
        println!("Cases: {} ({} skipped)", cases, skipped);
        println!("\nPrimitive Checks:");
        for check in &self.checks {
            let status = if check.passed { "PASS" } else { "FAIL" };
            print!("  [{}] {} ({} cases", status, check.name, check.cases);
            if check.skipped > 0 {
                print!(", {} skipped", check.skipped);
            }
            print!(")");
            if let Some(ref msg) = check.message {
                print!(" - {}", msg);
            }
            println!();
        }
        println!("{}", "=".repeat(80));
    }
}

/// Outcome of a single case.
enum Outcome {
    Passed,
    Skipped,
}

type CaseResult = Result<Outcome, String>;

/// Running tally of one check.
struct Tally {
    name: &'static str,
    cases: usize,
    skipped: usize,
    failures: Vec<String>,
}

/// Failures listed in a check's message.
const MAX_REPORTED: usize = 3;

impl Tally {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            cases: 0,
            skipped: 0,
            failures: Vec::new(),
        }
    }

    fn record(&mut self, label: impl fmt::Display, result: CaseResult) {
        self.cases += 1;
        match result {
            Ok(Outcome::Passed) => {}
            Ok(Outcome::Skipped) => self.skipped += 1,
            Err(e) => self.failures.push(format!("{label}: {e}")),
        }
    }

    fn finish(self) -> CheckResult {
        let passed = self.failures.is_empty();
        let message = if passed {
            None
        } else {
            let mut shown: Vec<String> = self.failures.iter().take(MAX_REPORTED).cloned().collect();
            if self.failures.len() > MAX_REPORTED {
                shown.push(format!("{} more", self.failures.len() - MAX_REPORTED));
            }
            Some(shown.join("; "))
        };
        CheckResult {
            name: self.name.to_string(),
            passed,
            cases: self.cases,
            skipped: self.skipped,
            message,
        }
    }
}

// ---------------------------------------------------------------------------
// Comparison
// ---------------------------------------------------------------------------

/// Float equality within [`FLOAT_TOLERANCE`]; NaN matches NaN.
pub fn close(expected: f64, actual: f64) -> bool {
    expected == actual
        || (expected.is_nan() && actual.is_nan())
        || (expected - actual).abs() <= FLOAT_TOLERANCE * expected.abs().max(actual.abs())
}

fn exact<T: PartialEq + fmt::Debug>(expected: &[T], actual: &[T]) -> Result<(), String> {
    if expected.len() != actual.len() {
        return Err(format!("length {} vs {}", expected.len(), actual.len()));
    }
    match expected.iter().zip(actual).position(|(e, a)| e != a) {
        Some(i) => Err(format!(
            "element {i}: expected {:?}, got {:?}",
            expected[i], actual[i]
        )),
        None => Ok(()),
    }
}

fn approx(expected: &[f64], actual: &[f64]) -> Result<(), String> {
    if expected.len() != actual.len() {
        return Err(format!("length {} vs {}", expected.len(), actual.len()));
    }
    match expected
        .iter()
        .zip(actual)
        .position(|(&e, &a)| !close(e, a))
    {
        Some(i) => Err(format!(
            "element {i}: expected {:e}, got {:e}",
            expected[i], actual[i]
        )),
        None => Ok(()),
    }
}

/// Compare two arrays: shapes and dtypes equal, integers and booleans
/// exactly, floats within tolerance.
pub fn compare_arrays(expected: &Array, actual: &Array) -> Result<(), String> {
    if expected.shape() != actual.shape() {
        return Err(format!(
            "shape {:?} vs {:?}",
            expected.shape(),
            actual.shape()
        ));
    }
    match (expected.storage(), actual.storage()) {
        (Storage::Float(e), Storage::Float(a)) => approx(e, a),
        (Storage::Int(e), Storage::Int(a)) => exact(e, a),
        (Storage::Bool(e), Storage::Bool(a)) => exact(e, a),
        _ => Err(format!("dtype {} vs {}", expected.dtype(), actual.dtype())),
    }
}

fn compare_scalars(expected: Scalar, actual: Scalar) -> Result<(), String> {
    let same = match (expected, actual) {
        (Scalar::Float(e), Scalar::Float(a)) => close(e, a),
        (e, a) => e == a,
    };
    if same {
        Ok(())
    } else {
        Err(format!("expected {expected:?}, got {actual:?}"))
    }
}

// ---------------------------------------------------------------------------
// Input generation
// ---------------------------------------------------------------------------

fn float_values(rng: &mut ChaCha8Rng, n: usize) -> Vec<f64> {
    (0..n).map(|_| rng.gen_range(-10.0..10.0)).collect()
}

/// Values from a small set so that sorts see ties and `remove_zeros` sees
/// zeros.
fn tied_array(rng: &mut ChaCha8Rng, dtype: Dtype, n: usize) -> Array {
    match dtype {
        Dtype::Float => Array::from_f64((0..n).map(|_| rng.gen_range(0..5) as f64 * 0.5).collect()),
        _ => Array::from_i64((0..n).map(|_| rng.gen_range(0..5) - 1).collect()),
    }
}

fn random_array(rng: &mut ChaCha8Rng, dtype: Dtype, shape: &[usize]) -> Array {
    let len: usize = shape.iter().product();
    let storage = match dtype {
        Dtype::Float => Storage::Float(float_values(rng, len)),
        Dtype::Int => Storage::Int((0..len).map(|_| rng.gen_range(-50..50)).collect()),
        Dtype::Bool => Storage::Bool((0..len).map(|_| rng.gen_bool(0.5)).collect()),
    };
    // Shapes come from the fixed tables below and always match.
    Array::with_shape(storage.clone(), shape).unwrap_or_else(|_| Array::from_storage(storage))
}

fn index(rng: &mut ChaCha8Rng, n: usize, order: IndexOrder, length: Length) -> BoundedArray {
    let mut values: Vec<i64> = (0..n as i64).collect();
    match order {
        IndexOrder::Ascending => {}
        IndexOrder::Descending => values.reverse(),
        IndexOrder::Random => {
            for i in (1..n).rev() {
                values.swap(i, rng.gen_range(0..=i));
            }
        }
    }
    let mut index = BoundedArray::from_indices(values);
    // Length::of never exceeds n.
    let _ = index.set_length(length.of(n));
    index
}

/// Shapes of the elementwise checks: every 1-D size plus two 2-D layouts.
fn shapes() -> Vec<Vec<usize>> {
    let mut shapes: Vec<Vec<usize>> = SIZES.iter().map(|&n| vec![n]).collect();
    shapes.push(vec![3, 5]);
    shapes.push(vec![2, 87]);
    shapes
}

/// Every (size, order, length) index case.
fn index_cases() -> impl Iterator<Item = (usize, IndexOrder, Length)> {
    SIZES.into_iter().flat_map(|n| {
        ORDERS
            .into_iter()
            .flat_map(move |o| LENGTHS.into_iter().map(move |l| (n, o, l)))
    })
}

// ---------------------------------------------------------------------------
// Suite
// ---------------------------------------------------------------------------

/// A candidate backend paired with the reference it is checked against.
pub struct Conformance {
    kind: BackendKind,
    reference: Box<dyn Backend>,
    candidate: Box<dyn Backend>,
    capabilities: Capabilities,
    rng: ChaCha8Rng,
}

impl Conformance {
    /// Create both backends. Fails when the candidate is unavailable here.
    pub fn new(kind: BackendKind) -> Result<Self, String> {
        let options = BackendOptions {
            seed: SEED,
            ..BackendOptions::default()
        };
        let reference = create_backend(BackendKind::Reference, options)
            .map_err(|e| format!("reference backend: {e}"))?;
        let candidate =
            create_backend(kind, options).map_err(|e| format!("{kind} backend: {e}"))?;
        Ok(Self {
            kind,
            reference,
            candidate,
            capabilities: kind.capabilities(),
            rng: ChaCha8Rng::seed_from_u64(SEED),
        })
    }

    /// Run every check.
    pub fn run(&mut self) -> SuiteResult {
        tracing::info!("Running conformance suite: {}", self.kind);
        let checks = vec![
            self.check_fill(),
            self.check_multiply(),
            self.check_add(),
            self.check_floor(),
            self.check_urand(),
            self.check_reduction(Primitive::Amin),
            self.check_reduction(Primitive::Amax),
            self.check_shuffle(),
            self.check_sort(Primitive::Argsort),
            self.check_sort(Primitive::StableArgsort),
            self.check_remove_zeros(),
            self.check_first_in_pair(),
            self.check_pair_op(Primitive::SumPair),
            self.check_pair_op(Primitive::MaxPair),
            self.check_compute_gamma(),
            self.check_coalescence(),
        ];
        let passed = checks.iter().all(|c| c.passed);
        tracing::info!(
            "Conformance suite {}: {}",
            self.kind,
            if passed { "passed" } else { "failed" }
        );
        SuiteResult {
            backend: self.kind,
            passed,
            checks,
        }
    }

    /// Unwrap a candidate result. `Ok(None)` when the call hit a documented
    /// capability gap.
    fn candidate<T>(
        &self,
        primitive: Primitive,
        array: &Array,
        result: sdm_kernel::Result<T>,
    ) -> Result<Option<T>, String> {
        match result {
            Ok(value) => Ok(Some(value)),
            Err(e)
                if e.is_not_implemented()
                    && !self.capabilities.supports_array(primitive, array) =>
            {
                Ok(None)
            }
            Err(e) => Err(format!("{} failed: {}", self.kind, e)),
        }
    }

    fn reference<T>(result: sdm_kernel::Result<T>) -> Result<T, String> {
        result.map_err(|e| format!("reference failed: {e}"))
    }

    // -- elementwise ---------------------------------------------------------

    fn check_fill(&mut self) -> CheckResult {
        let mut tally = Tally::new("fill");
        for shape in shapes() {
            for (dtype, value) in [
                (Dtype::Float, Scalar::Float(2.5)),
                (Dtype::Int, Scalar::Int(-3)),
                (Dtype::Bool, Scalar::Bool(true)),
            ] {
                let result = self.fill_case(&shape, dtype, value);
                tally.record(format_args!("{dtype} {shape:?}"), result);
            }
        }
        tally.finish()
    }

    fn fill_case(&mut self, shape: &[usize], dtype: Dtype, value: Scalar) -> CaseResult {
        let data = random_array(&mut self.rng, dtype, shape);
        let mut expected = data.clone();
        Self::reference(self.reference.fill(&mut expected, value))?;
        let mut actual = data.clone();
        let result = self.candidate.fill(&mut actual, value);
        if self.candidate(Primitive::Fill, &data, result)?.is_none() {
            return Ok(Outcome::Skipped);
        }
        compare_arrays(&expected, &actual)?;
        Ok(Outcome::Passed)
    }

    fn check_multiply(&mut self) -> CheckResult {
        let mut tally = Tally::new("multiply");
        for shape in shapes() {
            for (dtype, scalar) in [(Dtype::Float, Scalar::Float(1.75)), (Dtype::Int, Scalar::Int(-3))] {
                for elementwise in [false, true] {
                    let result = self.multiply_case(&shape, dtype, scalar, elementwise);
                    let mode = if elementwise { "elementwise" } else { "scalar" };
                    tally.record(format_args!("{dtype} {shape:?} {mode}"), result);
                }
            }
        }
        tally.finish()
    }

    fn multiply_case(
        &mut self,
        shape: &[usize],
        dtype: Dtype,
        scalar: Scalar,
        elementwise: bool,
    ) -> CaseResult {
        let data = random_array(&mut self.rng, dtype, shape);
        let other = random_array(&mut self.rng, dtype, shape);
        let multiplier = || {
            if elementwise {
                Multiplier::Elementwise(&other)
            } else {
                Multiplier::Scalar(scalar)
            }
        };
        let mut expected = data.clone();
        Self::reference(self.reference.multiply(&mut expected, multiplier()))?;
        let mut actual = data.clone();
        let result = self.candidate.multiply(&mut actual, multiplier());
        if self.candidate(Primitive::Multiply, &data, result)?.is_none() {
            return Ok(Outcome::Skipped);
        }
        compare_arrays(&expected, &actual)?;
        Ok(Outcome::Passed)
    }

    fn check_add(&mut self) -> CheckResult {
        let mut tally = Tally::new("add");
        for shape in shapes() {
            for dtype in [Dtype::Float, Dtype::Int] {
                let data = random_array(&mut self.rng, dtype, &shape);
                let other = random_array(&mut self.rng, dtype, &shape);
                let result = (|| -> CaseResult {
                    let mut expected = data.clone();
                    Self::reference(self.reference.add(&mut expected, &other))?;
                    let mut actual = data.clone();
                    let result = self.candidate.add(&mut actual, &other);
                    if self.candidate(Primitive::Add, &data, result)?.is_none() {
                        return Ok(Outcome::Skipped);
                    }
                    compare_arrays(&expected, &actual)?;
                    Ok(Outcome::Passed)
                })();
                tally.record(format_args!("{dtype} {shape:?}"), result);
            }
        }
        tally.finish()
    }

    fn check_floor(&mut self) -> CheckResult {
        let mut tally = Tally::new("floor");
        for shape in shapes() {
            for dtype in [Dtype::Float, Dtype::Int] {
                let data = random_array(&mut self.rng, dtype, &shape);
                let result = (|| -> CaseResult {
                    let mut expected = data.clone();
                    Self::reference(self.reference.floor(&mut expected))?;
                    let mut actual = data.clone();
                    let result = self.candidate.floor(&mut actual);
                    if self.candidate(Primitive::Floor, &data, result)?.is_none() {
                        return Ok(Outcome::Skipped);
                    }
                    compare_arrays(&expected, &actual)?;
                    Ok(Outcome::Passed)
                })();
                tally.record(format_args!("{dtype} {shape:?}"), result);
            }
        }
        tally.finish()
    }

    fn check_urand(&mut self) -> CheckResult {
        let mut tally = Tally::new("urand");
        for shape in shapes() {
            let result = (|| -> CaseResult {
                let mut first = Array::zeros(&shape, Dtype::Float).map_err(|e| e.to_string())?;
                let result = self.candidate.urand(&mut first);
                if self.candidate(Primitive::Urand, &first, result)?.is_none() {
                    return Ok(Outcome::Skipped);
                }
                let mut second = Array::zeros(&shape, Dtype::Float).map_err(|e| e.to_string())?;
                self.candidate(Primitive::Urand, &first, self.candidate.urand(&mut second))?;
                let a = first.f64s(Primitive::Urand).map_err(|e| e.to_string())?;
                let b = second.f64s(Primitive::Urand).map_err(|e| e.to_string())?;
                if let Some(v) = a.iter().chain(b).find(|v| !(0.0..1.0).contains(*v)) {
                    return Err(format!("draw {v} outside [0, 1)"));
                }
                if a.len() >= 8 && a == b {
                    return Err("consecutive draws repeat".to_string());
                }
                Ok(Outcome::Passed)
            })();
            tally.record(format_args!("{shape:?}"), result);
        }
        tally.finish()
    }

    // -- index & ordering ----------------------------------------------------

    fn check_reduction(&mut self, primitive: Primitive) -> CheckResult {
        let mut tally = Tally::new(primitive.name());
        for (n, order, length) in index_cases() {
            for dtype in [Dtype::Float, Dtype::Int] {
                let data = random_array(&mut self.rng, dtype, &[n]);
                let idx = index(&mut self.rng, n, order, length);
                let run = |backend: &dyn Backend| {
                    if primitive == Primitive::Amin {
                        backend.amin(&data, &idx)
                    } else {
                        backend.amax(&data, &idx)
                    }
                };
                let result = match (run(self.reference.as_ref()), run(self.candidate.as_ref())) {
                    (Ok(e), Ok(a)) => compare_scalars(e, a).map(|_| Outcome::Passed),
                    // An empty index must be rejected by both.
                    (Err(_), Err(_)) if idx.length() == 0 => Ok(Outcome::Passed),
                    (Err(e), _) => Err(format!("reference failed: {e}")),
                    (Ok(_), Err(e)) => self
                        .candidate::<Scalar>(primitive, &data, Err(e))
                        .map(|_| Outcome::Skipped),
                };
                tally.record(format_args!("{dtype} n={n} {order:?} {length:?}"), result);
            }
        }
        tally.finish()
    }

    fn check_shuffle(&mut self) -> CheckResult {
        let mut tally = Tally::new("shuffle");
        for (n, order, length) in index_cases() {
            let idx = index(&mut self.rng, n, order, length);
            let result = self.shuffle_case(idx, 0);
            tally.record(format_args!("n={n} {order:?} {length:?}"), result);
        }
        for n in SIZES {
            for (shape, axis) in [(vec![n, 3], 0), (vec![3, n], 1)] {
                for length in LENGTHS {
                    let values: Vec<i64> = (0..(3 * n) as i64).collect();
                    let array = Array::with_shape(Storage::Int(values), &shape)
                        .map_err(|e| e.to_string());
                    let result = array.and_then(|array| {
                        let bounded = BoundedArray::new(array, length.of(n))
                            .map_err(|e| e.to_string())?;
                        self.shuffle_case(bounded, axis)
                    });
                    tally.record(format_args!("{shape:?} axis {axis} {length:?}"), result);
                }
            }
        }
        tally.finish()
    }

    /// Shuffle must permute the active slices along `axis`, keep each slice
    /// intact and leave the tail alone.
    fn shuffle_case(&mut self, data: BoundedArray, axis: usize) -> CaseResult {
        let mut shuffled = data.clone();
        let result = self.candidate.shuffle(&mut shuffled, axis);
        if self
            .candidate(Primitive::Shuffle, data.array(), result)?
            .is_none()
        {
            return Ok(Outcome::Skipped);
        }
        let slices = |b: &BoundedArray| -> Result<Vec<Vec<i64>>, String> {
            let shape = b.array().shape().to_vec();
            let values = b.array().i64s(Primitive::Shuffle).map_err(|e| e.to_string())?;
            let (rows, cols) = match shape[..] {
                [n] => (n, 1),
                [r, c] => (r, c),
                _ => return Err(format!("unexpected shape {shape:?}")),
            };
            let count = if axis == 0 { rows } else { cols };
            Ok((0..count)
                .map(|s| {
                    if axis == 0 {
                        values[s * cols..(s + 1) * cols].to_vec()
                    } else {
                        (0..rows).map(|r| values[r * cols + s]).collect()
                    }
                })
                .collect())
        };
        let before = slices(&data)?;
        let after = slices(&shuffled)?;
        let length = data.length();
        if before[length..] != after[length..] {
            return Err("inactive tail modified".to_string());
        }
        let mut a = before[..length].to_vec();
        let mut b = after[..length].to_vec();
        a.sort();
        b.sort();
        if a != b {
            return Err("active slices are not a permutation of the input".to_string());
        }
        Ok(Outcome::Passed)
    }

    fn check_sort(&mut self, primitive: Primitive) -> CheckResult {
        let mut tally = Tally::new(primitive.name());
        for (n, order, length) in index_cases() {
            for dtype in [Dtype::Float, Dtype::Int] {
                let data = tied_array(&mut self.rng, dtype, n);
                let idx = index(&mut self.rng, n, order, length);
                let run = |backend: &dyn Backend, idx: &mut BoundedArray| {
                    if primitive == Primitive::Argsort {
                        backend.argsort(&data, idx)
                    } else {
                        backend.stable_argsort(&data, idx)
                    }
                };
                let result = (|| -> CaseResult {
                    let mut expected = idx.clone();
                    Self::reference(run(self.reference.as_ref(), &mut expected))?;
                    let mut actual = idx.clone();
                    let result = run(self.candidate.as_ref(), &mut actual);
                    if self.candidate(primitive, &data, result)?.is_none() {
                        return Ok(Outcome::Skipped);
                    }
                    compare_arrays(expected.array(), actual.array())?;
                    Ok(Outcome::Passed)
                })();
                tally.record(format_args!("{dtype} n={n} {order:?} {length:?}"), result);
            }
        }
        tally.finish()
    }

    fn check_remove_zeros(&mut self) -> CheckResult {
        let mut tally = Tally::new("remove_zeros");
        for (n, order, length) in index_cases() {
            for dtype in [Dtype::Float, Dtype::Int] {
                let data = tied_array(&mut self.rng, dtype, n);
                let idx = index(&mut self.rng, n, order, length);
                let result = (|| -> CaseResult {
                    let mut expected = idx.clone();
                    let expected_len =
                        Self::reference(self.reference.remove_zeros(&data, &mut expected))?;
                    let mut actual = idx.clone();
                    let result = self.candidate.remove_zeros(&data, &mut actual);
                    let Some(actual_len) = self.candidate(Primitive::RemoveZeros, &data, result)?
                    else {
                        return Ok(Outcome::Skipped);
                    };
                    if expected_len != actual_len || actual.length() != actual_len {
                        return Err(format!(
                            "new length {actual_len} (index {}), expected {expected_len}",
                            actual.length()
                        ));
                    }
                    compare_arrays(expected.array(), actual.array())?;
                    Ok(Outcome::Passed)
                })();
                tally.record(format_args!("{dtype} n={n} {order:?} {length:?}"), result);
            }
        }
        tally.finish()
    }

    // -- pairing -------------------------------------------------------------

    fn check_first_in_pair(&mut self) -> CheckResult {
        let mut tally = Tally::new("is_first_in_pair");
        for (n, order, length) in index_cases() {
            let idx = index(&mut self.rng, n, order, length);
            let output = random_array(&mut self.rng, Dtype::Bool, &[n]);
            let result = (|| -> CaseResult {
                let mut expected = output.clone();
                Self::reference(self.reference.is_first_in_pair(&mut expected, &idx))?;
                let mut actual = output.clone();
                let result = self.candidate.is_first_in_pair(&mut actual, &idx);
                if self
                    .candidate(Primitive::IsFirstInPair, &output, result)?
                    .is_none()
                {
                    return Ok(Outcome::Skipped);
                }
                compare_arrays(&expected, &actual)?;
                Ok(Outcome::Passed)
            })();
            tally.record(format_args!("n={n} {order:?} {length:?}"), result);
        }
        tally.finish()
    }

    fn check_pair_op(&mut self, primitive: Primitive) -> CheckResult {
        let mut tally = Tally::new(primitive.name());
        for (n, order, length) in index_cases() {
            for dtype in [Dtype::Float, Dtype::Int] {
                let values = random_array(&mut self.rng, dtype, &[n]);
                let output = random_array(&mut self.rng, dtype, &[n]);
                let idx = index(&mut self.rng, n, order, length);
                let run = |backend: &dyn Backend, out: &mut Array| {
                    if primitive == Primitive::SumPair {
                        backend.sum_pair(out, &values, &idx)
                    } else {
                        backend.max_pair(out, &values, &idx)
                    }
                };
                let result = (|| -> CaseResult {
                    let mut expected = output.clone();
                    Self::reference(run(self.reference.as_ref(), &mut expected))?;
                    let mut actual = output.clone();
                    let result = run(self.candidate.as_ref(), &mut actual);
                    if self.candidate(primitive, &values, result)?.is_none() {
                        return Ok(Outcome::Skipped);
                    }
                    compare_arrays(&expected, &actual)?;
                    Ok(Outcome::Passed)
                })();
                tally.record(format_args!("{dtype} n={n} {order:?} {length:?}"), result);
            }
        }
        tally.finish()
    }

    // -- coalescence ---------------------------------------------------------

    fn check_compute_gamma(&mut self) -> CheckResult {
        let mut tally = Tally::new("compute_gamma");
        for (n, order, length) in index_cases() {
            for policy in [
                GammaPolicy::StochasticRound,
                GammaPolicy::Floor,
                GammaPolicy::Scaled,
            ] {
                let probability =
                    Array::from_f64((0..n).map(|_| self.rng.gen_range(0.0..5.0)).collect());
                let rand = Array::from_f64((0..n / 2).map(|_| self.rng.gen::<f64>()).collect());
                let gamma = Array::from_f64(vec![0.0; n / 2]);
                let idx = index(&mut self.rng, n, order, length);
                let result = (|| -> CaseResult {
                    let mut expected = gamma.clone();
                    Self::reference(
                        self.reference
                            .compute_gamma(&mut expected, &probability, &rand, &idx, policy),
                    )?;
                    let mut actual = gamma.clone();
                    let result = self
                        .candidate
                        .compute_gamma(&mut actual, &probability, &rand, &idx, policy);
                    if self
                        .candidate(Primitive::ComputeGamma, &probability, result)?
                        .is_none()
                    {
                        return Ok(Outcome::Skipped);
                    }
                    compare_arrays(&expected, &actual)?;
                    Ok(Outcome::Passed)
                })();
                tally.record(format_args!("n={n} {order:?} {length:?} {policy:?}"), result);
            }
        }

        // Negative probability of the second pair.
        let probability = Array::from_f64(vec![0.5, 0.0, -0.25, 0.0]);
        let rand = Array::from_f64(vec![0.5, 0.5]);
        let idx = BoundedArray::identity(4);
        let result = (|| -> CaseResult {
            let mut gamma = Array::from_f64(vec![0.0; 2]);
            let expected = self.reference.compute_gamma(
                &mut gamma,
                &probability,
                &rand,
                &idx,
                GammaPolicy::StochasticRound,
            );
            let actual = self.candidate.compute_gamma(
                &mut gamma,
                &probability,
                &rand,
                &idx,
                GammaPolicy::StochasticRound,
            );
            match (expected, actual) {
                (
                    Err(Error::InvalidProbability { pair: 1, .. }),
                    Err(Error::InvalidProbability { pair: 1, .. }),
                ) => Ok(Outcome::Passed),
                (e, a) => Err(format!("expected {e:?}, got {a:?}")),
            }
        })();
        tally.record("negative probability", result);
        tally.finish()
    }

    fn check_coalescence(&mut self) -> CheckResult {
        let mut tally = Tally::new("coalescence");
        for (n, order, length) in index_cases() {
            for policy in [FullCoalescence::Purge, FullCoalescence::Split] {
                let multiplicity =
                    Array::from_i64((0..n).map(|_| self.rng.gen_range(0..50)).collect());
                let extensive = vec![
                    Array::from_f64((0..n).map(|_| self.rng.gen_range(0.1..3.0)).collect()),
                    Array::from_f64((0..n).map(|_| self.rng.gen_range(1.0..100.0)).collect()),
                ];
                let gamma = Array::from_f64(
                    (0..n / 2)
                        .map(|_| [0.0, 1.0, 2.0, 3.0, 7.5][self.rng.gen_range(0..5)])
                        .collect(),
                );
                let idx = index(&mut self.rng, n, order, length);
                let result =
                    self.coalescence_case(&multiplicity, &extensive, &gamma, &idx, policy);
                tally.record(format_args!("n={n} {order:?} {length:?} {policy:?}"), result);
            }
        }

        // Invalid gamma must be rejected the same way.
        let multiplicity = Array::from_i64(vec![4, 2, 3, 3]);
        let extensive = vec![Array::from_f64(vec![1.0; 4])];
        let gamma = Array::from_f64(vec![1.0, -1.0]);
        let idx = BoundedArray::identity(4);
        let result = (|| -> CaseResult {
            let mut m = multiplicity.clone();
            let mut e = extensive.clone();
            let expected = self
                .reference
                .coalescence(&mut m, &mut e, &gamma, &idx, FullCoalescence::Purge);
            let mut m = multiplicity.clone();
            let mut e = extensive.clone();
            let actual = self
                .candidate
                .coalescence(&mut m, &mut e, &gamma, &idx, FullCoalescence::Purge);
            match (expected, actual) {
                (Err(e), Err(a)) if std::mem::discriminant(&e) == std::mem::discriminant(&a) => {
                    Ok(Outcome::Passed)
                }
                (e, a) => Err(format!("expected {e:?}, got {a:?}")),
            }
        })();
        tally.record("negative gamma", result);
        tally.finish()
    }

    fn coalescence_case(
        &self,
        multiplicity: &Array,
        extensive: &[Array],
        gamma: &Array,
        idx: &BoundedArray,
        policy: FullCoalescence,
    ) -> CaseResult {
        let mut expected_n = multiplicity.clone();
        let mut expected_attrs = extensive.to_vec();
        let expected_stats = Self::reference(self.reference.coalescence(
            &mut expected_n,
            &mut expected_attrs,
            gamma,
            idx,
            policy,
        ))?;

        let mut actual_n = multiplicity.clone();
        let mut actual_attrs = extensive.to_vec();
        let result = self
            .candidate
            .coalescence(&mut actual_n, &mut actual_attrs, gamma, idx, policy);
        let Some(actual_stats) = self.candidate(Primitive::Coalescence, multiplicity, result)?
        else {
            return Ok(Outcome::Skipped);
        };

        compare_arrays(&expected_n, &actual_n).map_err(|e| format!("multiplicity {e}"))?;
        for (k, (e, a)) in expected_attrs.iter().zip(&actual_attrs).enumerate() {
            compare_arrays(e, a).map_err(|err| format!("attribute {k} {err}"))?;
        }
        if expected_stats != actual_stats {
            return Err(format!(
                "stats {actual_stats:?}, expected {expected_stats:?}"
            ));
        }
        Ok(Outcome::Passed)
    }
}

/// Run the suite against `kind`.
pub fn run_suite(kind: BackendKind) -> Result<SuiteResult, String> {
    Ok(Conformance::new(kind)?.run())
}
