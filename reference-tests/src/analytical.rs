//! Analytical reference: Golovin kernel number decay
//!
//! With K = b (v1 + v2) the number concentration obeys dN/dt = -b N L, where
//! L is the (conserved) liquid volume concentration, so
//! N(t) = N0 exp(-b L t) independently of the initial spectrum.

use crate::CheckResult;
use sdm_kernel::{BackendKind, CallOptions, FullCoalescence, GammaPolicy};
use sdm_orchestrator::build_simulation;
use sdm_orchestrator::config::{KernelConfig, SimulationConfig, SpectrumConfig};

/// Golovin decay case parameters
#[derive(Debug, Clone)]
pub struct GolovinDecay {
    /// Super-droplets
    pub n_sd: usize,
    /// Rate constant b (1/s)
    pub b: f64,
    /// Initial number concentration (1/m^3)
    pub n0: f64,
    /// Mean initial droplet volume (m^3)
    pub mean_volume: f64,
    /// Timestep (s)
    pub dt: f64,
    /// Steps between comparisons
    pub sample_every: u64,
    /// Number of comparisons
    pub samples: usize,
    /// Allowed relative error of N(t)
    pub tolerance: f64,
}

impl Default for GolovinDecay {
    fn default() -> Self {
        Self {
            n_sd: 1 << 13,
            b: 1500.0,
            n0: 2f64.powi(23),
            // 30.531 um radius
            mean_volume: 4.0 / 3.0 * std::f64::consts::PI * 30.531e-6_f64.powi(3),
            dt: 1.0,
            sample_every: 200,
            samples: 3,
            tolerance: 0.1,
        }
    }
}

/// Parcel volume the super-droplets share (m^3)
const PARCEL_VOLUME: f64 = 1e6;

impl GolovinDecay {
    fn config(&self, backend: BackendKind) -> SimulationConfig {
        SimulationConfig {
            name: "golovin-decay".to_string(),
            backend,
            seed: 44,
            n_sd: self.n_sd,
            dt: self.dt,
            dv: PARCEL_VOLUME,
            max_timesteps: Some(self.sample_every * self.samples as u64),
            max_time: None,
            kernel: KernelConfig::Golovin { b: self.b },
            spectrum: SpectrumConfig::Exponential {
                total_number: self.n0 * PARCEL_VOLUME,
                mean_volume: self.mean_volume,
            },
            gamma_policy: GammaPolicy::StochasticRound,
            full_coalescence: FullCoalescence::Purge,
            verify_conservation: true,
            call_options: CallOptions::default(),
        }
    }

    /// Run the case on `backend` and compare N(t) at every sample.
    pub fn run(&self, backend: BackendKind) -> Result<CheckResult, String> {
        tracing::info!("Running Golovin decay on {}", backend);
        let config = self.config(backend);
        config.validate()?;
        let mut sim = build_simulation(&config)?;

        let initial = sim.metrics().map_err(|e| e.to_string())?;
        let n_start = initial.initial_droplets as f64;
        let liquid = initial.attributes[0].initial / PARCEL_VOLUME;

        let mut worst = 0.0_f64;
        let mut issues = Vec::new();
        for sample in 1..=self.samples {
            for _ in 0..self.sample_every {
                sim.step().map_err(|e| e.to_string())?;
            }
            let t = (sample as u64 * self.sample_every) as f64 * self.dt;
            let expected = n_start * (-self.b * liquid * t).exp();
            let actual = sim.metrics().map_err(|e| e.to_string())?.droplets as f64;
            let error = (actual - expected).abs() / expected;
            tracing::debug!(
                "t={:.0}s N={:.4e} expected={:.4e} error={:.2}%",
                t,
                actual,
                expected,
                error * 100.0
            );
            worst = worst.max(error);
            if error > self.tolerance {
                issues.push(format!(
                    "t={:.0}s: N/N0 {:.4} vs {:.4}",
                    t,
                    actual / n_start,
                    expected / n_start
                ));
            }
        }

        let drift = sim.metrics().map_err(|e| e.to_string())?.max_drift();
        if drift > 1e-9 {
            issues.push(format!("volume drift {:e}", drift));
        }

        Ok(CheckResult {
            name: "Golovin number decay".to_string(),
            passed: issues.is_empty(),
            cases: self.samples,
            skipped: 0,
            message: Some(if issues.is_empty() {
                format!(
                    "max error {:.2}% (limit {:.0}%), {} super-droplets left",
                    worst * 100.0,
                    self.tolerance * 100.0,
                    sim.super_droplet_count()
                )
            } else {
                issues.join(", ")
            }),
        })
    }
}
