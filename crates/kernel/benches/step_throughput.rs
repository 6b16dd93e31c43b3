//! Coalescence step throughput per backend.
//!
//! Run with: cargo bench -p sdm-kernel --bench step_throughput
//! Add `--features gpu` to include the accelerator.

use std::time::Instant;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use sdm_kernel::{
    available_backends, create_backend, BackendKind, BackendOptions, Coalescence,
    CoalescenceSettings, GolovinKernel, Population, Simulation,
};

fn exponential_population(n_sd: usize, seed: u64) -> Population {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mean_volume = 3.0e-15;
    let volume = (0..n_sd)
        .map(|_| -mean_volume * (1.0 - rng.gen::<f64>()).ln())
        .collect();
    Population::new(vec![1_000_000; n_sd], vec![("volume".into(), volume)])
        .expect("valid population")
}

fn simulation(kind: BackendKind, n_sd: usize) -> Option<Simulation> {
    let backend = match create_backend(kind, BackendOptions::default()) {
        Ok(backend) => backend,
        Err(e) => {
            println!("{:>12} skipped: {e}", kind.name());
            return None;
        }
    };
    let mut settings = CoalescenceSettings::new(1.0, 1e6);
    // Totals are checked separately; keep the timed loop to the update itself.
    settings.verify_conservation = false;
    let engine = Coalescence::new(settings, Box::new(GolovinKernel::new(1.5e3)));
    Some(Simulation::new(backend, exponential_population(n_sd, 44), engine).expect("simulation"))
}

fn main() {
    println!("=== Coalescence Step Throughput ===\n");

    // (super-droplets, steps) -- fewer steps at larger counts
    let configs = [(1 << 10, 200), (1 << 14, 50), (1 << 17, 10), (1 << 20, 3)];

    println!(
        "{:>12} {:>10} {:>8} {:>10} {:>12} {:>12}",
        "Backend", "SDs", "Steps", "Time (s)", "steps/s", "ms/step"
    );

    for kind in available_backends() {
        for &(n_sd, steps) in &configs {
            let Some(mut sim) = simulation(kind, n_sd) else {
                break;
            };
            // Warmup
            sim.step().expect("warmup step");

            let start = Instant::now();
            for _ in 0..steps {
                sim.step().expect("step");
            }
            let elapsed = start.elapsed().as_secs_f64();
            let sps = steps as f64 / elapsed;
            let ms = elapsed * 1000.0 / steps as f64;

            println!(
                "{:>12} {:>10} {:>8} {:>10.3} {:>12.1} {:>12.3}",
                kind.name(),
                n_sd,
                steps,
                elapsed,
                sps,
                ms
            );
        }
    }
}
