//! netprobe core library — domain types, configuration, errors.
//!
//! - [`types`] — registration status, operation identity and lifecycle, error classes
//! - [`config`] — `~/.netprobe/config.yaml` load / save
//! - [`error`] — [`ConfigError`]

pub mod config;
pub mod error;
pub mod types;

pub use config::{Config, LogFormat};
pub use error::ConfigError;
pub use types::{
    DaemonStatus, ErrorClass, OperationId, OperationKind, OperationState, RegistrationOutcome,
    ResultCode,
};
