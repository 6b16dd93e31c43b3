//! Simulation runner with lifecycle management
//!
//! This module provides the `SimulationRunner` which owns a `Simulation` on a
//! background thread and exposes start, pause, resume and status tracking.

use parking_lot::Mutex;
use sdm_kernel::{Simulation, StepReport};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Runner state enum
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunnerState {
    /// Simulation created but not yet started
    Created,
    /// Simulation actively running
    Running,
    /// Simulation paused
    Paused,
    /// Simulation finished (reached stopping condition)
    Finished,
    /// A step failed; see `error_message`
    Error,
}

/// Shared state between the runner thread and control interface
struct SharedState {
    /// Current runner state
    state: RunnerState,
    /// Current simulation time (seconds)
    sim_time: f64,
    /// Number of timesteps executed
    timestep_count: u64,
    /// Report of the most recent step
    last_report: Option<StepReport>,
    /// Most recent error message (if state is Error)
    error_message: Option<String>,
}

/// Stop conditions and timestep of a run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunLimits {
    /// Timestep (seconds)
    pub dt: f64,
    /// Stop after this many timesteps
    pub max_timesteps: Option<u64>,
    /// Stop after this much simulated time (seconds)
    pub max_time: Option<f64>,
}

/// Handle for controlling and querying a running simulation
pub struct SimulationRunner {
    /// Shared state (protected by mutex)
    shared: Arc<Mutex<SharedState>>,
    /// Handle to the background thread; yields the simulation back on exit
    thread_handle: Option<thread::JoinHandle<Simulation>>,
}

impl SimulationRunner {
    /// Create a new simulation runner around `simulation`.
    ///
    /// The thread is spawned immediately but waits for [`Self::start`].
    pub fn new(simulation: Simulation, limits: RunLimits) -> Self {
        let shared = Arc::new(Mutex::new(SharedState {
            state: RunnerState::Created,
            sim_time: 0.0,
            timestep_count: 0,
            last_report: None,
            error_message: None,
        }));

        let shared_clone = Arc::clone(&shared);

        let thread_handle =
            thread::spawn(move || run_simulation_loop(simulation, shared_clone, limits));

        Self {
            shared,
            thread_handle: Some(thread_handle),
        }
    }

    /// Get current runner state
    pub fn state(&self) -> RunnerState {
        self.shared.lock().state.clone()
    }

    /// Get current simulation time (seconds)
    pub fn sim_time(&self) -> f64 {
        self.shared.lock().sim_time
    }

    /// Get current timestep count
    pub fn timestep_count(&self) -> u64 {
        self.shared.lock().timestep_count
    }

    /// Report of the most recent completed step
    pub fn last_report(&self) -> Option<StepReport> {
        self.shared.lock().last_report
    }

    /// Get error message if state is Error
    pub fn error_message(&self) -> Option<String> {
        self.shared.lock().error_message.clone()
    }

    /// Pause the simulation
    pub fn pause(&self) {
        let mut state = self.shared.lock();
        if state.state == RunnerState::Running {
            state.state = RunnerState::Paused;
        }
    }

    /// Resume the simulation
    pub fn resume(&self) {
        let mut state = self.shared.lock();
        if state.state == RunnerState::Paused {
            state.state = RunnerState::Running;
        }
    }

    /// Start the simulation (transition from Created to Running)
    pub fn start(&self) {
        let mut state = self.shared.lock();
        if state.state == RunnerState::Created {
            state.state = RunnerState::Running;
        }
    }

    /// Ask the thread to stop after the current step.
    pub fn stop(&self) {
        let mut state = self.shared.lock();
        if matches!(
            state.state,
            RunnerState::Created | RunnerState::Running | RunnerState::Paused
        ) {
            state.state = RunnerState::Finished;
        }
    }

    /// Wait for the simulation thread to complete and take the simulation
    /// back for read-out.
    ///
    /// Blocks until a stop condition is reached, so a runner that was never
    /// started must be stopped first.
    pub fn join(mut self) -> Result<Simulation, String> {
        let handle = self
            .thread_handle
            .take()
            .ok_or_else(|| "Runner thread already joined".to_string())?;
        handle.join().map_err(|_| "Thread panicked".to_string())
    }
}

impl Drop for SimulationRunner {
    fn drop(&mut self) {
        // Signal the thread to exit
        let mut state = self.shared.lock();
        if matches!(
            state.state,
            RunnerState::Created | RunnerState::Running | RunnerState::Paused
        ) {
            state.state = RunnerState::Finished;
        }
    }
}

/// Main simulation loop executed in background thread
fn run_simulation_loop(
    mut simulation: Simulation,
    shared: Arc<Mutex<SharedState>>,
    limits: RunLimits,
) -> Simulation {
    // Wait for start signal
    loop {
        let state = shared.lock().state.clone();
        match state {
            RunnerState::Created => {
                thread::sleep(Duration::from_millis(10));
            }
            RunnerState::Running => break,
            _ => return simulation,
        }
    }

    let start_wall_time = Instant::now();
    let mut sim_time = 0.0_f64;
    let mut timestep_count = 0_u64;

    loop {
        let current_state = shared.lock().state.clone();

        match current_state {
            RunnerState::Running => {
                let report = match simulation.step() {
                    Ok(report) => report,
                    Err(e) => {
                        tracing::error!("Simulation aborted at step {}: {}", timestep_count + 1, e);
                        let mut guard = shared.lock();
                        guard.state = RunnerState::Error;
                        guard.error_message = Some(e.to_string());
                        break;
                    }
                };

                sim_time += limits.dt;
                timestep_count += 1;

                {
                    let mut guard = shared.lock();
                    guard.sim_time = sim_time;
                    guard.timestep_count = timestep_count;
                    guard.last_report = Some(report);
                }

                if let Some(max_steps) = limits.max_timesteps {
                    if timestep_count >= max_steps {
                        tracing::info!(
                            "Simulation finished: reached max_timesteps = {}",
                            max_steps
                        );
                        shared.lock().state = RunnerState::Finished;
                        break;
                    }
                }

                if let Some(max_t) = limits.max_time {
                    if sim_time >= max_t {
                        tracing::info!("Simulation finished: reached max_time = {:.3}s", max_t);
                        shared.lock().state = RunnerState::Finished;
                        break;
                    }
                }

                if timestep_count % 100 == 0 {
                    let wall_time = start_wall_time.elapsed().as_secs_f64();
                    tracing::info!(
                        "Step {}: sim_time={:.2}s, super_droplets={}, collisions={}, wall_time={:.2}s",
                        timestep_count,
                        sim_time,
                        report.active_after,
                        report.stats.collisions,
                        wall_time,
                    );
                }
            }
            RunnerState::Paused => {
                thread::sleep(Duration::from_millis(50));
            }
            RunnerState::Finished | RunnerState::Error | RunnerState::Created => break,
        }
    }

    tracing::info!(
        "Simulation thread exiting: {} timesteps, {:.4}s simulated, {} super-droplets",
        timestep_count,
        sim_time,
        simulation.super_droplet_count()
    );
    simulation
}

#[cfg(test)]
mod tests {
    use super::*;
    use sdm_kernel::{
        create_backend, BackendKind, BackendOptions, Coalescence, CoalescenceSettings,
        ConstantKernel, GolovinKernel, Population,
    };

    fn simulation(kernel: Box<dyn sdm_kernel::CollisionKernel>) -> Simulation {
        let backend = create_backend(BackendKind::Optimized, BackendOptions::default()).unwrap();
        let population = Population::new(
            vec![50; 64],
            vec![("volume".into(), (1..=64).map(|i| 1e-15 * i as f64).collect())],
        )
        .unwrap();
        let engine = Coalescence::new(CoalescenceSettings::new(1.0, 1e-6), kernel);
        Simulation::new(backend, population, engine).unwrap()
    }

    fn limits(max_timesteps: Option<u64>, max_time: Option<f64>) -> RunLimits {
        RunLimits {
            dt: 1.0,
            max_timesteps,
            max_time,
        }
    }

    #[test]
    fn test_runner_lifecycle() {
        let runner = SimulationRunner::new(
            simulation(Box::new(GolovinKernel::new(1.5e3))),
            limits(Some(10), None),
        );

        // Initially Created
        assert_eq!(runner.state(), RunnerState::Created);

        runner.start();
        assert_eq!(runner.state(), RunnerState::Running);

        thread::sleep(Duration::from_millis(100));
        assert!(runner.timestep_count() <= 10);

        let sim = runner.join().unwrap();
        assert_eq!(sim.steps(), 10);
        assert!(sim.metrics().unwrap().max_drift() < 1e-9);
    }

    #[test]
    fn test_runner_stops_on_max_time() {
        let runner = SimulationRunner::new(
            simulation(Box::new(GolovinKernel::new(1.5e3))),
            limits(None, Some(4.5)),
        );
        runner.start();
        let shared = Arc::clone(&runner.shared);
        let sim = runner.join().unwrap();
        assert_eq!(sim.steps(), 5);
        let guard = shared.lock();
        assert_eq!(guard.state, RunnerState::Finished);
        assert!((guard.sim_time - 5.0).abs() < 1e-12);
        assert!(guard.last_report.is_some());
    }

    #[test]
    fn test_runner_pause_resume() {
        let runner = SimulationRunner::new(
            simulation(Box::new(GolovinKernel::new(1.5e3))),
            limits(Some(2_000), None),
        );

        runner.start();
        thread::sleep(Duration::from_millis(20));

        runner.pause();
        thread::sleep(Duration::from_millis(100));
        if runner.state() == RunnerState::Paused {
            let steps_paused = runner.timestep_count();
            thread::sleep(Duration::from_millis(100));

            // Allow for one step in flight when the pause landed
            let steps_after_pause = runner.timestep_count();
            assert!(
                steps_after_pause <= steps_paused + 1,
                "Steps should not advance while paused: before={}, after={}",
                steps_paused,
                steps_after_pause
            );

            runner.resume();
            assert_eq!(runner.state(), RunnerState::Running);
        } else {
            // Already reached the stop condition
            assert_eq!(runner.state(), RunnerState::Finished);
        }

        let sim = runner.join().unwrap();
        assert_eq!(sim.steps(), 2_000);
    }

    #[test]
    fn test_runner_records_step_error() {
        // A negative kernel yields negative collision probabilities.
        let runner = SimulationRunner::new(
            simulation(Box::new(ConstantKernel { c: -1.0 })),
            limits(Some(10), None),
        );
        runner.start();
        let shared = Arc::clone(&runner.shared);
        let sim = runner.join().unwrap();
        assert_eq!(sim.steps(), 0);
        let guard = shared.lock();
        assert_eq!(guard.state, RunnerState::Error);
        let message = guard.error_message.clone().unwrap();
        assert!(message.contains("probability"), "{message}");
    }

    #[test]
    fn test_stop_before_start() {
        let runner = SimulationRunner::new(
            simulation(Box::new(GolovinKernel::new(1.0))),
            limits(Some(10), None),
        );
        runner.stop();
        let sim = runner.join().unwrap();
        assert_eq!(sim.steps(), 0);
    }
}
