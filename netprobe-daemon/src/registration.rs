//! Lifecycle of the privileged service registration.
//!
//! Registration and approval are decoupled: `register` asks the OS to install
//! the service and returns immediately, while the user may approve it in
//! system settings at any later point. The manager therefore never caches a
//! status; every query goes back to the backend.

use std::sync::{Arc, Mutex};

use thiserror::Error;

use netprobe_core::{DaemonStatus, ErrorClass, RegistrationOutcome, ResultCode};

/// Failure side of a registration request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistrationError {
    /// Permanent: the platform cannot host the service.
    #[error("privileged helper is not available on this platform: {0}")]
    NotAvailable(String),

    /// The registration subsystem refused or failed; may be transient.
    #[error("registration failed: {0}")]
    Failed(String),
}

impl RegistrationError {
    pub fn code(&self) -> ResultCode {
        match self {
            RegistrationError::NotAvailable(_) => ResultCode::NotAvailable,
            RegistrationError::Failed(_) => ResultCode::Error,
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            RegistrationError::NotAvailable(_) => ErrorClass::Unsupported,
            RegistrationError::Failed(_) => ErrorClass::Transient,
        }
    }
}

/// Authoritative source of registration state.
pub trait ServiceRegistry {
    fn register(&self) -> Result<RegistrationOutcome, RegistrationError>;
    fn unregister(&self) -> Result<(), RegistrationError>;
    fn status(&self) -> DaemonStatus;
}

impl<R: ServiceRegistry + ?Sized> ServiceRegistry for Arc<R> {
    fn register(&self) -> Result<RegistrationOutcome, RegistrationError> {
        (**self).register()
    }

    fn unregister(&self) -> Result<(), RegistrationError> {
        (**self).unregister()
    }

    fn status(&self) -> DaemonStatus {
        (**self).status()
    }
}

/// Requests registration transitions and reports the current status.
pub struct RegistrationManager<R> {
    registry: R,
}

impl<R: ServiceRegistry> RegistrationManager<R> {
    pub fn new(registry: R) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &R {
        &self.registry
    }

    /// Ask the OS to register the service. May surface an approval prompt;
    /// never waits for it.
    pub fn register(&self) -> Result<RegistrationOutcome, RegistrationError> {
        let result = self.registry.register();
        match &result {
            Ok(RegistrationOutcome::Registered) => {
                tracing::info!("privileged helper registered");
            }
            Ok(RegistrationOutcome::PendingApproval) => {
                tracing::info!("privileged helper registered, waiting for user approval");
            }
            Err(err) => tracing::warn!(error = %err, "privileged helper registration failed"),
        }
        result
    }

    pub fn unregister(&self) -> Result<(), RegistrationError> {
        let result = self.registry.unregister();
        match &result {
            Ok(()) => tracing::info!("privileged helper unregistered"),
            Err(err) => tracing::warn!(error = %err, "privileged helper unregistration failed"),
        }
        result
    }

    pub fn status(&self) -> DaemonStatus {
        let status = self.registry.status();
        tracing::debug!(status = %status, "queried privileged helper status");
        status
    }

    pub fn is_registered_and_enabled(&self) -> bool {
        self.status() == DaemonStatus::Enabled
    }

    pub fn requires_approval(&self) -> bool {
        self.status() == DaemonStatus::RequiresApproval
    }

    /// Diagnostic for the current status, only when it is `Error`.
    pub fn error_message(&self) -> Option<String> {
        self.status().diagnostic().map(str::to_owned)
    }
}

// ---------------------------------------------------------------------------
// In-memory backend
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
struct SimulatedState {
    registered: bool,
    approved: bool,
    needs_approval: bool,
    unavailable: Option<String>,
    failure: Option<String>,
}

/// Registry whose approval is driven from outside, the way a user toggles
/// the service in system settings.
///
/// Clones share state, so a test can hold one handle while the manager owns
/// another.
#[derive(Debug, Clone, Default)]
pub struct SimulatedRegistry {
    state: Arc<Mutex<SimulatedState>>,
}

impl SimulatedRegistry {
    /// Registration succeeds immediately, no approval step.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registered services stay in `RequiresApproval` until [`approve`](Self::approve).
    pub fn requiring_approval() -> Self {
        let registry = Self::default();
        registry.with_state(|state| state.needs_approval = true);
        registry
    }

    /// The user flips the switch in system settings.
    pub fn approve(&self) {
        self.with_state(|state| state.approved = true);
    }

    /// The user turns the service back off.
    pub fn revoke(&self) {
        self.with_state(|state| state.approved = false);
    }

    pub fn make_unavailable(&self, reason: impl Into<String>) {
        let reason = reason.into();
        self.with_state(|state| state.unavailable = Some(reason));
    }

    /// Make the registration subsystem report `message` until cleared.
    pub fn fail_with(&self, message: impl Into<String>) {
        let message = message.into();
        self.with_state(|state| state.failure = Some(message));
    }

    pub fn clear_failure(&self) {
        self.with_state(|state| state.failure = None);
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut SimulatedState) -> T) -> T {
        let mut guard = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut guard)
    }
}

impl ServiceRegistry for SimulatedRegistry {
    fn register(&self) -> Result<RegistrationOutcome, RegistrationError> {
        self.with_state(|state| {
            if let Some(reason) = &state.unavailable {
                return Err(RegistrationError::NotAvailable(reason.clone()));
            }
            if let Some(message) = &state.failure {
                return Err(RegistrationError::Failed(message.clone()));
            }
            state.registered = true;
            if state.needs_approval && !state.approved {
                Ok(RegistrationOutcome::PendingApproval)
            } else {
                Ok(RegistrationOutcome::Registered)
            }
        })
    }

    fn unregister(&self) -> Result<(), RegistrationError> {
        self.with_state(|state| {
            if let Some(reason) = &state.unavailable {
                return Err(RegistrationError::NotAvailable(reason.clone()));
            }
            if let Some(message) = &state.failure {
                return Err(RegistrationError::Failed(message.clone()));
            }
            state.registered = false;
            Ok(())
        })
    }

    fn status(&self) -> DaemonStatus {
        self.with_state(|state| {
            if let Some(reason) = &state.unavailable {
                DaemonStatus::NotAvailable(reason.clone())
            } else if let Some(message) = &state.failure {
                DaemonStatus::Error(message.clone())
            } else if !state.registered {
                DaemonStatus::NotRegistered
            } else if state.needs_approval && !state.approved {
                DaemonStatus::RequiresApproval
            } else {
                DaemonStatus::Enabled
            }
        })
    }
}
