//! Privileged network-scanning helper: service registration, the daemon
//! socket server, and the multiplexed client used to talk to it.

pub mod client;
pub mod connection;
pub mod engine;
mod error;
pub mod launchd;
mod logging;
pub mod operation;
pub mod paths;
pub mod protocol;
pub mod registration;
mod runtime;
pub mod settings;

pub use client::{OperationClient, OperationHandle};
pub use connection::Connection;
pub use engine::{EngineError, ScanEngine, SidecarEngine};
pub use error::DaemonError;
pub use launchd::{generate_plist, LaunchdRegistry};
pub use logging::init_tracing;
pub use operation::{discard_progress, OperationError, Outcome, ProgressSink};
pub use registration::{RegistrationError, RegistrationManager, ServiceRegistry, SimulatedRegistry};
pub use runtime::{run, serve, start_blocking};
pub use settings::SettingsLauncher;
