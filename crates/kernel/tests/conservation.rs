//! Conservation of droplet totals under the coalescence update.
//!
//! Random populations and collision counts are pushed through every CPU
//! backend; each extensive total `sum(n * attr)` must survive to round-off
//! and no multiplicity may go negative.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use sdm_kernel::{
    create_backend, Array, BackendKind, BackendOptions, BoundedArray, Coalescence,
    CoalescenceSettings, ConstantKernel, DropletState, Error, FullCoalescence, GammaPolicy,
    GolovinKernel, PairwiseKernel, Population, Primitive, Simulation,
};

const CPU: [BackendKind; 3] = [
    BackendKind::Reference,
    BackendKind::Optimized,
    BackendKind::Parallel,
];

const TOLERANCE: f64 = 1e-9;

struct Case {
    multiplicity: Vec<i64>,
    attributes: Vec<Vec<f64>>,
    gamma: Vec<f64>,
    index: Vec<i64>,
}

fn random_case(rng: &mut ChaCha8Rng, n: usize) -> Case {
    let multiplicity = (0..n).map(|_| rng.gen_range(0..2_000)).collect();
    let attributes = (0..2)
        .map(|_| (0..n).map(|_| rng.gen_range(1e-3..10.0)).collect())
        .collect();
    let gamma = (0..n / 2)
        .map(|_| {
            if rng.gen_bool(0.3) {
                0.0
            } else {
                rng.gen_range(0.0..50.0)
            }
        })
        .collect();
    let mut index: Vec<i64> = (0..n as i64).collect();
    for i in (1..n).rev() {
        index.swap(i, rng.gen_range(0..=i));
    }
    Case {
        multiplicity,
        attributes,
        gamma,
        index,
    }
}

fn total(n: &[i64], attr: &[f64]) -> f64 {
    n.iter().zip(attr).map(|(&n, &a)| n as f64 * a).sum()
}

fn relative(before: f64, after: f64) -> f64 {
    if before == 0.0 {
        after.abs()
    } else {
        ((after - before) / before).abs()
    }
}

#[test]
fn random_updates_conserve_every_attribute() {
    let mut rng = ChaCha8Rng::seed_from_u64(2024);
    for kind in CPU {
        let backend = create_backend(kind, BackendOptions::default()).unwrap();
        for policy in [FullCoalescence::Purge, FullCoalescence::Split] {
            for n in [2usize, 3, 8, 87, 1000] {
                let case = random_case(&mut rng, n);
                let before: Vec<f64> = case
                    .attributes
                    .iter()
                    .map(|a| total(&case.multiplicity, a))
                    .collect();
                let droplets_before: i64 = case.multiplicity.iter().sum();

                let mut mult = Array::from_i64(case.multiplicity.clone());
                let mut attrs: Vec<Array> = case
                    .attributes
                    .iter()
                    .cloned()
                    .map(Array::from_f64)
                    .collect();
                let gamma = Array::from_f64(case.gamma.clone());
                let index = BoundedArray::from_indices(case.index.clone());
                let stats = backend
                    .coalescence(&mut mult, &mut attrs, &gamma, &index, policy)
                    .unwrap();

                let n_after = mult.i64s(Primitive::Coalescence).unwrap();
                assert!(n_after.iter().all(|&m| m >= 0), "{kind} {policy:?} n={n}");
                for (attr, &b) in attrs.iter().zip(&before) {
                    let after = total(n_after, attr.f64s(Primitive::Coalescence).unwrap());
                    let drift = relative(b, after);
                    assert!(drift < TOLERANCE, "{kind} {policy:?} n={n}: drift {drift:e}");
                }
                let droplets_after: i64 = n_after.iter().sum();
                assert!(droplets_after <= droplets_before, "{kind}");
                assert!(stats.coalescing_pairs <= stats.pairs);
                assert!(stats.deaths <= stats.coalescing_pairs);
            }
        }
    }
}

#[test]
fn cpu_backends_agree_on_deterministic_update() {
    let mut rng = ChaCha8Rng::seed_from_u64(99);
    let case = random_case(&mut rng, 500);
    let mut results = Vec::new();
    for kind in CPU {
        let backend = create_backend(kind, BackendOptions::default()).unwrap();
        let mut mult = Array::from_i64(case.multiplicity.clone());
        let mut attrs: Vec<Array> = case
            .attributes
            .iter()
            .cloned()
            .map(Array::from_f64)
            .collect();
        let gamma = Array::from_f64(case.gamma.clone());
        let index = BoundedArray::from_indices(case.index.clone());
        let stats = backend
            .coalescence(&mut mult, &mut attrs, &gamma, &index, FullCoalescence::Purge)
            .unwrap();
        results.push((mult, attrs, stats));
    }
    for other in &results[1..] {
        assert_eq!(other, &results[0]);
    }
}

fn population(rng: &mut ChaCha8Rng, n: usize) -> Population {
    let multiplicity = (0..n).map(|_| rng.gen_range(1..10_000)).collect();
    let volume = (0..n).map(|_| rng.gen_range(1e-18..1e-15)).collect();
    let mass = (0..n).map(|_| rng.gen_range(1e-15..1e-12)).collect();
    Population::new(
        multiplicity,
        vec![("volume".into(), volume), ("mass".into(), mass)],
    )
    .unwrap()
}

#[test]
fn simulation_conserves_over_many_steps() {
    for kind in CPU {
        for policy in [
            GammaPolicy::StochasticRound,
            GammaPolicy::Floor,
            GammaPolicy::Scaled,
        ] {
            let mut rng = ChaCha8Rng::seed_from_u64(5);
            let backend = create_backend(kind, BackendOptions::default()).unwrap();
            let mut settings = CoalescenceSettings::new(1.0, 1e-6);
            settings.gamma_policy = policy;
            let engine = Coalescence::new(settings, Box::new(GolovinKernel::new(1.5e3)));
            let mut sim = Simulation::new(backend, population(&mut rng, 256), engine).unwrap();

            let mut last_active = sim.super_droplet_count();
            for _ in 0..50 {
                let report = sim.step().unwrap();
                assert!(report.active_after <= report.active_before);
                assert_eq!(report.active_before, last_active);
                last_active = report.active_after;
            }
            let metrics = sim.metrics().unwrap();
            assert!(
                metrics.max_drift() < TOLERANCE,
                "{kind} {policy:?}: drift {:e}",
                metrics.max_drift()
            );
            assert!(metrics.droplets <= metrics.initial_droplets);
            assert_eq!(metrics.attributes.len(), 2);
        }
    }
}

#[test]
fn large_constant_kernel_drives_population_down() {
    let mut rng = ChaCha8Rng::seed_from_u64(17);
    let backend = create_backend(BackendKind::Optimized, BackendOptions::default()).unwrap();
    let engine = Coalescence::new(
        CoalescenceSettings::new(1.0, 1.0),
        Box::new(ConstantKernel { c: 1.0 }),
    );
    let mut sim = Simulation::new(backend, population(&mut rng, 64), engine).unwrap();
    for _ in 0..30 {
        sim.step().unwrap();
    }
    let metrics = sim.metrics().unwrap();
    assert!(metrics.droplets < metrics.initial_droplets);
    assert!(metrics.max_drift() < TOLERANCE);
    let n = sim.population().multiplicity().i64s(Primitive::Array).unwrap();
    assert!(n.iter().all(|&m| m >= 0));
}

#[test]
fn closure_kernel_runs_through_the_engine() {
    let mut rng = ChaCha8Rng::seed_from_u64(31);
    let backend = create_backend(BackendKind::Parallel, BackendOptions::default()).unwrap();
    let kernel = PairwiseKernel::new(
        "volume-difference",
        |a: &DropletState<'_>, b: &DropletState<'_>| {
            let va = a.attribute("volume").unwrap_or(0.0);
            let vb = b.attribute("volume").unwrap_or(0.0);
            1e3 * (va - vb).abs()
        },
    );
    let engine = Coalescence::new(CoalescenceSettings::new(1.0, 1e-6), Box::new(kernel));
    let mut sim = Simulation::new(backend, population(&mut rng, 128), engine).unwrap();
    for _ in 0..10 {
        sim.step().unwrap();
    }
    assert!(sim.metrics().unwrap().max_drift() < TOLERANCE);
}

#[test]
fn negative_kernel_weight_fails_on_every_seed() {
    for kind in CPU {
        for seed in 0..20 {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            let options = BackendOptions {
                seed,
                ..BackendOptions::default()
            };
            let backend = create_backend(kind, options).unwrap();
            let kernel = PairwiseKernel::new(
                "negative",
                |_: &DropletState<'_>, _: &DropletState<'_>| -0.3,
            );
            let engine = Coalescence::new(CoalescenceSettings::new(1.0, 1e-6), Box::new(kernel));
            let mut sim = Simulation::new(backend, population(&mut rng, 16), engine).unwrap();
            let err = sim.step().unwrap_err();
            assert!(
                matches!(err, Error::InvalidProbability { pair: 0, .. }),
                "{kind} seed {seed}: {err}"
            );
            assert!(err.to_string().contains("pair 0"));
        }
    }
}

#[test]
fn nan_kernel_weight_fails() {
    let backend = create_backend(BackendKind::Reference, BackendOptions::default()).unwrap();
    let engine = Coalescence::new(
        CoalescenceSettings::new(1.0, 1.0),
        Box::new(ConstantKernel { c: f64::NAN }),
    );
    let mut rng = ChaCha8Rng::seed_from_u64(3);
    let mut sim = Simulation::new(backend, population(&mut rng, 8), engine).unwrap();
    let err = sim.step().unwrap_err();
    assert!(matches!(err, Error::InvalidProbability { .. }), "{err}");
}
