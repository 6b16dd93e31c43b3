//! Domain setup: initial super-droplet population

use crate::config::{SimulationConfig, SpectrumConfig};
use sdm_kernel::Population;

/// Name of the per-droplet volume attribute.
pub const VOLUME: &str = "volume";

/// Set up the initial population described by `config.spectrum`.
///
/// Super-droplet `i` sits at the `(i + 0.5) / n_sd` quantile of the spectrum
/// and every super-droplet carries `round(total_number / n_sd)` real droplets.
pub fn setup_population(config: &SimulationConfig) -> Result<Population, String> {
    let n_sd = config.n_sd;
    let (multiplicity, volume) = match config.spectrum {
        SpectrumConfig::Exponential {
            total_number,
            mean_volume,
        } => {
            let per_sd = (total_number / n_sd as f64).round() as i64;
            let volume: Vec<f64> = (0..n_sd)
                .map(|i| exponential_quantile(mean_volume, (i as f64 + 0.5) / n_sd as f64))
                .collect();
            (vec![per_sd; n_sd], volume)
        }
    };

    let population = Population::new(multiplicity, vec![(VOLUME.to_string(), volume)])
        .map_err(|e| format!("Invalid initial population: {}", e))?;

    tracing::info!(
        "Population setup complete: {} super-droplets, {} droplets, volume {:.4e} m^3",
        population.len(),
        population.total_multiplicity().unwrap_or_default(),
        population.total_extensive(VOLUME).unwrap_or_default()
    );

    Ok(population)
}

/// Inverse CDF of the exponential distribution with mean `mean`.
fn exponential_quantile(mean: f64, q: f64) -> f64 {
    -mean * (1.0 - q).ln()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KernelConfig;
    use sdm_kernel::{BackendKind, CallOptions, FullCoalescence, GammaPolicy, Primitive};

    fn config(n_sd: usize, total_number: f64, mean_volume: f64) -> SimulationConfig {
        SimulationConfig {
            name: "test".to_string(),
            backend: BackendKind::Reference,
            seed: 44,
            n_sd,
            dt: 1.0,
            dv: 1.0,
            max_timesteps: Some(1),
            max_time: None,
            kernel: KernelConfig::Golovin { b: 1500.0 },
            spectrum: SpectrumConfig::Exponential {
                total_number,
                mean_volume,
            },
            gamma_policy: GammaPolicy::StochasticRound,
            full_coalescence: FullCoalescence::Purge,
            verify_conservation: true,
            call_options: CallOptions::default(),
        }
    }

    #[test]
    fn test_equal_multiplicities() {
        let pop = setup_population(&config(8, 1000.0, 1e-15)).unwrap();
        assert_eq!(pop.len(), 8);
        assert_eq!(pop.active_len(), 8);
        // 1000 / 8 = 125
        assert!(pop
            .multiplicity()
            .i64s(Primitive::Array)
            .unwrap()
            .iter()
            .all(|&n| n == 125));
    }

    #[test]
    fn test_volumes_follow_quantiles() {
        let mean = 3.0e-15;
        let pop = setup_population(&config(4, 400.0, mean)).unwrap();
        let v = pop.attribute(VOLUME).unwrap().f64s(Primitive::Array).unwrap();
        // Slots 0 and 1 sit at q = 0.125 and q = 0.375.
        assert!((v[0] - (-mean * (0.875_f64).ln())).abs() < 1e-27);
        assert!((v[1] - (-mean * (0.625_f64).ln())).abs() < 1e-27);
        assert!(v.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_mean_volume_recovered() {
        let mean = 1e-15;
        let n_sd = 1 << 14;
        let pop = setup_population(&config(n_sd, 1e9, mean)).unwrap();
        let v = pop.attribute(VOLUME).unwrap().f64s(Primitive::Array).unwrap();
        let sample_mean = v.iter().sum::<f64>() / n_sd as f64;
        assert!((sample_mean - mean).abs() / mean < 1e-3);
    }
}
