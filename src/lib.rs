//! Library exports for the daemon, benchmarks and tests.
/// App root resolution.
pub mod app_dirs;
pub(crate) mod atomic_file;
/// Committed learnable state and rollback.
pub mod checkpoint;
/// Wall-clock sources.
pub mod clock;
/// Differentially private contributions to a shared model.
pub mod federated;
/// Record of finished sessions.
pub mod history;
pub(crate) mod http_client;
/// Incremental and spike-timing learners.
pub mod learn;
/// Logging setup.
pub mod logging;
/// Local classifiers.
pub mod ml;
/// Session state machine.
pub mod orchestrator;
/// Sensitive-data screening.
pub mod privacy;
/// Pending training samples.
pub mod queue;
/// Replay memory.
pub mod replay;
/// Device resource readings and gates.
pub mod resources;
/// Time-of-day training windows.
pub mod scheduler;
/// Background worker and polling loops.
pub mod service;
/// Persistent configuration.
pub mod settings;
