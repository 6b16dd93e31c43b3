//! Conformance suite binary entry point
//!
//! Runs the suite against every backend available in this build and exits
//! non-zero when any check fails.

use reference_tests::analytical::GolovinDecay;
use reference_tests::{run_suite, SuiteResult};
use sdm_kernel::{available_backends, BackendKind};

fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_target(false)
        .init();

    tracing::info!("SDM Backend Conformance Suite");
    tracing::info!("=============================");

    let backends = available_backends();
    tracing::info!("Found {} backends", backends.len());
    for kind in BackendKind::ALL {
        if !backends.contains(&kind) {
            tracing::warn!("Backend {} unavailable in this build, skipping", kind);
        }
    }

    let mut results: Vec<SuiteResult> = Vec::new();
    let mut passed_count = 0;
    let mut failed_count = 0;

    for kind in backends {
        match run_suite(kind) {
            Ok(result) => {
                if result.passed {
                    passed_count += 1;
                } else {
                    failed_count += 1;
                }
                result.print_summary();
                results.push(result);
            }
            Err(e) => {
                eprintln!("\nERROR running suite for {}: {}", kind, e);
                failed_count += 1;
            }
        }
    }

    // Physical reference on the fastest CPU backend
    match GolovinDecay::default().run(BackendKind::Parallel) {
        Ok(check) => {
            let status = if check.passed { "PASS" } else { "FAIL" };
            println!("\n[{}] {} - {}", status, check.name, check.message.unwrap_or_default());
            if !check.passed {
                failed_count += 1;
            }
        }
        Err(e) => {
            eprintln!("\nERROR running Golovin decay: {}", e);
            failed_count += 1;
        }
    }

    // Print overall summary
    println!("\n{}", "=".repeat(80));
    println!("OVERALL SUMMARY");
    println!("{}", "=".repeat(80));
    println!("Backends tested: {}", results.len());
    println!("Passed: {}", passed_count);
    println!("Failed: {}", failed_count);
    println!("{}", "=".repeat(80));

    // Exit with error code if any backend failed
    if failed_count > 0 {
        std::process::exit(1);
    }
}
