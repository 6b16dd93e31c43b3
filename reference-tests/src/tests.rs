//! Conformance suite run via cargo test
//!
//! One test per backend; each fails with the list of failed checks.

use crate::analytical::GolovinDecay;
use crate::{close, compare_arrays, run_suite, SuiteResult};
use sdm_kernel::{Array, BackendKind};

fn assert_passes(result: SuiteResult) {
    result.print_summary();
    let failed: Vec<String> = result
        .failures()
        .map(|c| format!("{}: {}", c.name, c.message.clone().unwrap_or_default()))
        .collect();
    assert!(result.passed, "{} failed:\n{}", result.backend, failed.join("\n"));
}

#[test]
fn test_reference_against_itself() {
    assert_passes(run_suite(BackendKind::Reference).unwrap());
}

#[test]
fn test_optimized_backend() {
    assert_passes(run_suite(BackendKind::Optimized).unwrap());
}

#[test]
fn test_parallel_backend() {
    assert_passes(run_suite(BackendKind::Parallel).unwrap());
}

#[cfg(feature = "gpu")]
#[test]
fn test_accelerator_backend() {
    if !sdm_kernel::gpu_available() {
        eprintln!("no suitable GPU adapter, skipping");
        return;
    }
    let result = run_suite(BackendKind::Accelerator).unwrap();
    let skipped: usize = result.checks.iter().map(|c| c.skipped).sum();
    assert!(skipped > 0, "documented gaps should be skipped, not run");
    assert_passes(result);
}

#[cfg(not(feature = "gpu"))]
#[test]
fn test_accelerator_unavailable() {
    assert!(run_suite(BackendKind::Accelerator).is_err());
}

#[test]
fn test_every_primitive_is_checked() {
    let result = run_suite(BackendKind::Reference).unwrap();
    assert_eq!(result.checks.len(), 16);
    assert!(result.checks.iter().all(|c| c.cases > 0 && c.skipped == 0));
}

#[test]
fn test_float_comparison() {
    assert!(close(1.0, 1.0 + 1e-13));
    assert!(!close(1.0, 1.0 + 1e-9));
    assert!(close(f64::NAN, f64::NAN));
    assert!(close(0.0, -0.0));
    assert!(compare_arrays(&Array::from_i64(vec![1, 2]), &Array::from_i64(vec![1, 3])).is_err());
    assert!(compare_arrays(&Array::from_i64(vec![1]), &Array::from_f64(vec![1.0])).is_err());
}

#[test]
fn test_golovin_number_decay() {
    let check = GolovinDecay::default().run(BackendKind::Parallel).unwrap();
    assert!(check.passed, "{}", check.message.unwrap_or_default());
}

#[test]
fn test_golovin_decay_matches_on_reference() {
    let case = GolovinDecay {
        n_sd: 1 << 11,
        samples: 1,
        tolerance: 0.15,
        ..GolovinDecay::default()
    };
    let check = case.run(BackendKind::Reference).unwrap();
    assert!(check.passed, "{}", check.message.unwrap_or_default());
}
