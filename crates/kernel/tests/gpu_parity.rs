//! Accelerator-vs-reference parity.
//!
//! Runs the deterministic primitives on both backends with identical inputs
//! and compares the results. Integer outputs must match exactly, float
//! outputs to 1e-12 relative. Skipped when no adapter with 64-bit shader
//! support is present.

#![cfg(feature = "gpu")]

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use sdm_kernel::{
    create_backend, gpu_available, Array, Backend, BackendKind, BackendOptions, BoundedArray,
    Coalescence, CoalescenceSettings, Dtype, FullCoalescence, GammaPolicy, GolovinKernel,
    Multiplier, Population, Primitive, Scalar, Simulation,
};

fn backends() -> Option<(Box<dyn Backend>, Box<dyn Backend>)> {
    if !gpu_available() {
        eprintln!("no suitable GPU adapter, skipping");
        return None;
    }
    let reference = create_backend(BackendKind::Reference, BackendOptions::default()).unwrap();
    let accelerator = create_backend(BackendKind::Accelerator, BackendOptions::default()).unwrap();
    Some((reference, accelerator))
}

fn assert_close(a: &[f64], b: &[f64]) {
    assert_eq!(a.len(), b.len());
    for (i, (&x, &y)) in a.iter().zip(b).enumerate() {
        let scale = x.abs().max(y.abs()).max(f64::MIN_POSITIVE);
        assert!(
            x == y || (x - y).abs() / scale < 1e-12,
            "element {i}: {x} vs {y}"
        );
    }
}

fn random_f64(rng: &mut ChaCha8Rng, n: usize) -> Vec<f64> {
    (0..n).map(|_| rng.gen_range(-100.0..100.0)).collect()
}

fn shuffled(rng: &mut ChaCha8Rng, n: usize) -> Vec<i64> {
    let mut v: Vec<i64> = (0..n as i64).collect();
    for i in (1..n).rev() {
        v.swap(i, rng.gen_range(0..=i));
    }
    v
}

#[test]
fn elementwise_matches() {
    let Some((cpu, gpu)) = backends() else { return };
    let mut rng = ChaCha8Rng::seed_from_u64(1);
    for n in [1usize, 3, 87, 4096] {
        let a = random_f64(&mut rng, n);
        let b = random_f64(&mut rng, n);
        let run = |backend: &dyn Backend| {
            let mut x = Array::from_f64(a.clone());
            let other = Array::from_f64(b.clone());
            backend.add(&mut x, &other).unwrap();
            backend
                .multiply(&mut x, Multiplier::Scalar(Scalar::Float(0.37)))
                .unwrap();
            backend.multiply(&mut x, Multiplier::Elementwise(&other)).unwrap();
            backend.floor(&mut x).unwrap();
            x.f64s(Primitive::Floor).unwrap().to_vec()
        };
        assert_close(&run(cpu.as_ref()), &run(gpu.as_ref()));

        let mut filled = Array::zeros(&[n], Dtype::Int).unwrap();
        gpu.fill(&mut filled, Scalar::Int(-7)).unwrap();
        assert!(filled.i64s(Primitive::Fill).unwrap().iter().all(|&v| v == -7));
    }
}

#[test]
fn reductions_and_sorts_match() {
    let Some((cpu, gpu)) = backends() else { return };
    let mut rng = ChaCha8Rng::seed_from_u64(2);
    for n in [2usize, 8, 87, 1000] {
        let data = Array::from_i64((0..n).map(|_| rng.gen_range(-20..20)).collect());
        let mut index = BoundedArray::from_indices(shuffled(&mut rng, n));
        index.set_length(n - n / 4).unwrap();

        assert_eq!(cpu.amin(&data, &index).unwrap(), gpu.amin(&data, &index).unwrap());
        assert_eq!(cpu.amax(&data, &index).unwrap(), gpu.amax(&data, &index).unwrap());

        for stable in [false, true] {
            let mut a = index.clone();
            let mut b = index.clone();
            if stable {
                cpu.stable_argsort(&data, &mut a).unwrap();
                gpu.stable_argsort(&data, &mut b).unwrap();
            } else {
                cpu.argsort(&data, &mut a).unwrap();
                gpu.argsort(&data, &mut b).unwrap();
            }
            assert_eq!(a, b, "n={n} stable={stable}");
        }
    }
}

#[test]
fn remove_zeros_and_pairs_match() {
    let Some((cpu, gpu)) = backends() else { return };
    let mut rng = ChaCha8Rng::seed_from_u64(3);
    for n in [3usize, 8, 257] {
        let mult = Array::from_i64((0..n).map(|_| rng.gen_range(0..3)).collect());
        let values = Array::from_f64(random_f64(&mut rng, n));
        let index = BoundedArray::from_indices(shuffled(&mut rng, n));

        let mut a = index.clone();
        let mut b = index.clone();
        assert_eq!(
            cpu.remove_zeros(&mult, &mut a).unwrap(),
            gpu.remove_zeros(&mult, &mut b).unwrap()
        );
        assert_eq!(a, b);

        for op in [Primitive::SumPair, Primitive::MaxPair] {
            let mut x = Array::zeros(&[n], Dtype::Float).unwrap();
            let mut y = Array::zeros(&[n], Dtype::Float).unwrap();
            if op == Primitive::SumPair {
                cpu.sum_pair(&mut x, &values, &index).unwrap();
                gpu.sum_pair(&mut y, &values, &index).unwrap();
            } else {
                cpu.max_pair(&mut x, &values, &index).unwrap();
                gpu.max_pair(&mut y, &values, &index).unwrap();
            }
            assert_close(x.f64s(op).unwrap(), y.f64s(op).unwrap());
        }

        let mut x = Array::zeros(&[n], Dtype::Bool).unwrap();
        let mut y = Array::zeros(&[n], Dtype::Bool).unwrap();
        cpu.is_first_in_pair(&mut x, &index).unwrap();
        gpu.is_first_in_pair(&mut y, &index).unwrap();
        assert_eq!(x, y);
    }
}

#[test]
fn gamma_and_coalescence_match() {
    let Some((cpu, gpu)) = backends() else { return };
    let mut rng = ChaCha8Rng::seed_from_u64(4);
    let n = 1001;
    let index = BoundedArray::from_indices(shuffled(&mut rng, n));
    let probability = Array::from_f64((0..n).map(|_| rng.gen_range(0.0..6.0)).collect());
    let rand = Array::from_f64((0..n / 2).map(|_| rng.gen::<f64>()).collect());

    for policy in [
        GammaPolicy::StochasticRound,
        GammaPolicy::Floor,
        GammaPolicy::Scaled,
    ] {
        let mut x = Array::zeros(&[n / 2], Dtype::Float).unwrap();
        let mut y = Array::zeros(&[n / 2], Dtype::Float).unwrap();
        cpu.compute_gamma(&mut x, &probability, &rand, &index, policy)
            .unwrap();
        gpu.compute_gamma(&mut y, &probability, &rand, &index, policy)
            .unwrap();
        assert_eq!(x, y, "{policy:?}");
    }

    let multiplicity: Vec<i64> = (0..n).map(|_| rng.gen_range(0..500)).collect();
    let attribute: Vec<f64> = (0..n).map(|_| rng.gen_range(0.1..4.0)).collect();
    let gamma = Array::from_f64((0..n / 2).map(|_| f64::from(rng.gen_range(0..4))).collect());
    for policy in [FullCoalescence::Purge, FullCoalescence::Split] {
        let mut ma = Array::from_i64(multiplicity.clone());
        let mut mb = ma.clone();
        let mut aa = vec![Array::from_f64(attribute.clone())];
        let mut ab = aa.clone();
        let sa = cpu.coalescence(&mut ma, &mut aa, &gamma, &index, policy).unwrap();
        let sb = gpu.coalescence(&mut mb, &mut ab, &gamma, &index, policy).unwrap();
        assert_eq!(ma, mb, "{policy:?}");
        assert_eq!(sa, sb, "{policy:?}");
        assert_close(
            aa[0].f64s(Primitive::Coalescence).unwrap(),
            ab[0].f64s(Primitive::Coalescence).unwrap(),
        );
    }
}

#[test]
fn accelerator_reports_pair_errors() {
    let Some((_, gpu)) = backends() else { return };
    let mut mult = Array::from_i64(vec![4, 2, 3, 3]);
    let mut attrs = vec![Array::from_f64(vec![1.0; 4])];
    let gamma = Array::from_f64(vec![0.0, -1.0]);
    let index = BoundedArray::identity(4);
    let err = gpu
        .coalescence(&mut mult, &mut attrs, &gamma, &index, FullCoalescence::Purge)
        .unwrap_err();
    assert!(matches!(err, sdm_kernel::Error::InvalidGamma { pair: 1, .. }));
    assert_eq!(mult.i64s(Primitive::Coalescence).unwrap(), &[4, 2, 3, 3]);
}

#[test]
fn accelerator_simulation_conserves_volume() {
    if !gpu_available() {
        return;
    }
    let backend = create_backend(BackendKind::Accelerator, BackendOptions::default()).unwrap();
    let population = Population::new(
        vec![1000; 512],
        vec![("volume".into(), (0..512).map(|i| 1e-15 * (1.0 + i as f64)).collect())],
    )
    .unwrap();
    let engine = Coalescence::new(
        CoalescenceSettings::new(1.0, 1e-6),
        Box::new(GolovinKernel::new(1.5e3)),
    );
    let mut sim = Simulation::new(backend, population, engine).unwrap();
    for _ in 0..20 {
        sim.step().unwrap();
    }
    assert!(sim.metrics().unwrap().max_drift() < 1e-9);
}
