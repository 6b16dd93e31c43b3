//! Configuration parsing and validation for coalescence runs

use sdm_kernel::{BackendKind, CallOptions, FullCoalescence, GammaPolicy};
use serde::{Deserialize, Serialize};
use std::fs;

/// Main simulation configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Human-readable simulation name
    pub name: String,
    /// Which array backend executes the primitives
    #[serde(default)]
    pub backend: BackendKind,
    /// Seed of the backend's random stream
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Number of super-droplets
    pub n_sd: usize,
    /// Timestep (seconds)
    pub dt: f64,
    /// Volume of the simulated parcel (m^3)
    pub dv: f64,
    /// Stop after this many timesteps
    pub max_timesteps: Option<u64>,
    /// Stop after this much simulated time (seconds)
    pub max_time: Option<f64>,
    /// Collision kernel
    pub kernel: KernelConfig,
    /// Initial droplet size spectrum
    pub spectrum: SpectrumConfig,
    /// Probability-to-count conversion
    #[serde(default)]
    pub gamma_policy: GammaPolicy,
    /// Full-coalescence handling
    #[serde(default)]
    pub full_coalescence: FullCoalescence,
    /// Check conservation of every extensive attribute after each step
    #[serde(default = "default_verify_conservation")]
    pub verify_conservation: bool,
    /// Per-primitive call behaviour
    #[serde(default)]
    pub call_options: CallOptions,
}

/// Collision kernel selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum KernelConfig {
    /// Golovin's additive kernel, K = b (v1 + v2)
    Golovin {
        /// Rate constant (1/s)
        b: f64,
    },
    /// Constant kernel, K = c
    Constant {
        /// Kernel value (m^3/s)
        c: f64,
    },
}

/// Initial size spectrum
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SpectrumConfig {
    /// Exponential in volume: n(v) = N / v0 exp(-v / v0)
    Exponential {
        /// Real droplets in the parcel
        total_number: f64,
        /// Mean droplet volume v0 (m^3)
        mean_volume: f64,
    },
}

// Default values
fn default_seed() -> u64 {
    44
}

fn default_verify_conservation() -> bool {
    true
}

impl SimulationConfig {
    /// Load configuration from a JSON file
    pub fn load(path: &str) -> Result<Self, String> {
        let contents = fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file {}: {}", path, e))?;
        Self::from_json_str(&contents)
    }

    /// Parse and validate configuration from a JSON string
    pub fn from_json_str(contents: &str) -> Result<Self, String> {
        let config: SimulationConfig = serde_json::from_str(contents)
            .map_err(|e| format!("Failed to parse config JSON: {}", e))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.n_sd < 2 {
            return Err("n_sd must be at least 2".to_string());
        }

        if !(self.dt > 0.0) || !self.dt.is_finite() {
            return Err("dt must be positive".to_string());
        }
        if !(self.dv > 0.0) || !self.dv.is_finite() {
            return Err("dv must be positive".to_string());
        }

        match self.kernel {
            KernelConfig::Golovin { b } if !(b >= 0.0) => {
                return Err("Golovin rate constant b must be non-negative".to_string());
            }
            KernelConfig::Constant { c } if !(c >= 0.0) => {
                return Err("Constant kernel value c must be non-negative".to_string());
            }
            _ => {}
        }

        match self.spectrum {
            SpectrumConfig::Exponential {
                total_number,
                mean_volume,
            } => {
                if !(total_number > 0.0) {
                    return Err("Spectrum total_number must be positive".to_string());
                }
                if !(mean_volume > 0.0) {
                    return Err("Spectrum mean_volume must be positive".to_string());
                }
                if total_number / (self.n_sd as f64) < 0.5 {
                    return Err(format!(
                        "total_number {} is too small for {} super-droplets",
                        total_number, self.n_sd
                    ));
                }
                if total_number / (self.n_sd as f64) > i64::MAX as f64 {
                    return Err("total_number overflows the multiplicity range".to_string());
                }
            }
        }

        // Check max_timesteps
        if let Some(max_timesteps) = self.max_timesteps {
            if max_timesteps == 0 {
                return Err("max_timesteps must be at least 1".to_string());
            }
        }

        // Check max_time
        if let Some(max_time) = self.max_time {
            if !(max_time > 0.0) {
                return Err("max_time must be positive".to_string());
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GOLOVIN: &str = r#"{
        "name": "golovin",
        "n_sd": 1024,
        "dt": 1.0,
        "dv": 1000000.0,
        "max_timesteps": 3600,
        "kernel": { "Golovin": { "b": 1500.0 } },
        "spectrum": { "Exponential": { "total_number": 1e14, "mean_volume": 3.0e-15 } }
    }"#;

    fn config() -> SimulationConfig {
        SimulationConfig::from_json_str(GOLOVIN).unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = config();
        assert_eq!(config.backend, BackendKind::Reference);
        assert_eq!(config.seed, 44);
        assert_eq!(config.gamma_policy, GammaPolicy::StochasticRound);
        assert_eq!(config.full_coalescence, FullCoalescence::Purge);
        assert!(config.verify_conservation);
        assert_eq!(config.call_options, CallOptions::default());
        assert_eq!(config.max_time, None);
        assert_eq!(config.kernel, KernelConfig::Golovin { b: 1500.0 });
    }

    #[test]
    fn test_explicit_fields() {
        let json = r#"{
            "name": "constant",
            "backend": "Parallel",
            "seed": 7,
            "n_sd": 64,
            "dt": 0.5,
            "dv": 1.0,
            "max_time": 10.0,
            "kernel": { "Constant": { "c": 1e-9 } },
            "spectrum": { "Exponential": { "total_number": 6400.0, "mean_volume": 1e-15 } },
            "gamma_policy": "Floor",
            "full_coalescence": "Split",
            "verify_conservation": false,
            "call_options": { "synchronize": true, "trace": true }
        }"#;
        let config = SimulationConfig::from_json_str(json).unwrap();
        assert_eq!(config.backend, BackendKind::Parallel);
        assert_eq!(config.seed, 7);
        assert_eq!(config.gamma_policy, GammaPolicy::Floor);
        assert_eq!(config.full_coalescence, FullCoalescence::Split);
        assert!(!config.verify_conservation);
        assert!(config.call_options.synchronize && config.call_options.trace);
    }

    #[test]
    fn test_validation_n_sd() {
        let mut config = config();
        config.n_sd = 1;
        assert!(config.validate().is_err());
        config.n_sd = 2;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_timestep_and_volume() {
        let mut config = config();
        config.dt = 0.0;
        assert!(config.validate().is_err());
        config.dt = 1.0;
        config.dv = f64::NAN;
        assert!(config.validate().is_err());
        config.dv = 1.0;
        config.max_time = Some(-1.0);
        assert!(config.validate().is_err());
        config.max_time = None;
        config.max_timesteps = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_kernel_and_spectrum() {
        let mut config = config();
        config.kernel = KernelConfig::Constant { c: -1.0 };
        assert!(config.validate().is_err());
        config.kernel = KernelConfig::Constant { c: 0.0 };
        assert!(config.validate().is_ok());

        config.spectrum = SpectrumConfig::Exponential {
            total_number: 10.0,
            mean_volume: 1e-15,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_errors() {
        assert!(SimulationConfig::from_json_str("{").is_err());
        assert!(SimulationConfig::from_json_str(r#"{"name": "x"}"#).is_err());
        let err = SimulationConfig::load("/nonexistent/config.json").unwrap_err();
        assert!(err.contains("Failed to read config file"));
    }
}
