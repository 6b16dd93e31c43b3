//! Orchestration Layer
//!
//! This crate wires the SDM kernel into a runnable simulation:
//! - JSON configuration loading and validation
//! - Initial super-droplet population from a size spectrum
//! - Backend and collision kernel selection
//! - Simulation runner with lifecycle management

#![warn(missing_docs)]

pub mod config;
pub mod domain;
pub mod runner;

pub use config::SimulationConfig;
pub use runner::{RunLimits, SimulationRunner};

use sdm_kernel::{
    create_backend, BackendOptions, Coalescence, CoalescenceSettings, CollisionKernel,
    ConstantKernel, GolovinKernel, Simulation,
};

/// Create a complete simulation from a configuration file
///
/// This function performs the full simulation setup pipeline:
/// 1. Load and validate the configuration
/// 2. Build the initial population from the configured spectrum
/// 3. Create the backend and the coalescence engine
/// 4. Wrap in a SimulationRunner for lifecycle management
///
/// # Arguments
/// * `config_path` - Path to the JSON configuration file
///
/// # Returns
/// A `SimulationRunner` ready to be started, or an error if setup fails
///
/// # Example
/// ```no_run
/// use sdm_orchestrator::create_simulation;
///
/// let runner = create_simulation("configs/golovin.json")?;
/// runner.start();
/// let simulation = runner.join()?;
/// println!("{} super-droplets left", simulation.super_droplet_count());
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub fn create_simulation(config_path: &str) -> Result<SimulationRunner, Box<dyn std::error::Error>> {
    tracing::info!("Creating simulation from config: {}", config_path);

    let config = SimulationConfig::load(config_path)?;
    tracing::info!("Configuration loaded: {}", config.name);

    Ok(create_runner(&config)?)
}

/// Build a runner for an already validated configuration.
pub fn create_runner(config: &SimulationConfig) -> Result<SimulationRunner, String> {
    let simulation = build_simulation(config)?;
    tracing::info!("Creating simulation runner...");
    let runner = SimulationRunner::new(
        simulation,
        RunLimits {
            dt: config.dt,
            max_timesteps: config.max_timesteps,
            max_time: config.max_time,
        },
    );
    tracing::info!("Simulation ready to start");
    Ok(runner)
}

/// Assemble backend, population and engine for `config`.
pub fn build_simulation(config: &SimulationConfig) -> Result<Simulation, String> {
    let population = domain::setup_population(config)?;

    tracing::info!("Creating {} backend...", config.backend);
    let backend = create_backend(
        config.backend,
        BackendOptions {
            seed: config.seed,
            call: config.call_options,
        },
    )
    .map_err(|e| format!("Backend {} could not be created: {}", config.backend, e))?;

    let settings = CoalescenceSettings {
        gamma_policy: config.gamma_policy,
        full_coalescence: config.full_coalescence,
        verify_conservation: config.verify_conservation,
        ..CoalescenceSettings::new(config.dt, config.dv)
    };
    let engine = Coalescence::new(settings, create_kernel(&config.kernel));

    Simulation::new(backend, population, engine).map_err(|e| e.to_string())
}

/// Create the collision kernel named by the configuration.
pub fn create_kernel(kernel: &config::KernelConfig) -> Box<dyn CollisionKernel> {
    match *kernel {
        config::KernelConfig::Golovin { b } => Box::new(GolovinKernel::new(b)),
        config::KernelConfig::Constant { c } => Box::new(ConstantKernel { c }),
    }
}
