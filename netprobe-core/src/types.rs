//! Domain types shared by the daemon, its client and the CLI.
//!
//! Integer result codes only exist at the boundary ([`ResultCode`]); everything
//! inside the workspace matches on the tagged enums.

use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Boundary result codes
// ---------------------------------------------------------------------------

/// Integer codes reported across the registration boundary.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultCode {
    Success = 0,
    NotRegistered = 1,
    RequiresApproval = 2,
    Error = 3,
    NotAvailable = 4,
}

impl ResultCode {
    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

impl From<i32> for ResultCode {
    fn from(code: i32) -> Self {
        match code {
            0 => Self::Success,
            1 => Self::NotRegistered,
            2 => Self::RequiresApproval,
            4 => Self::NotAvailable,
            _ => Self::Error,
        }
    }
}

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

/// Current state of the privileged service registration.
///
/// Always derived from the authoritative source at query time; never cached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum DaemonStatus {
    /// Registered and enabled.
    Enabled,
    NotRegistered,
    /// Registered, waiting for the user to approve it in system settings.
    RequiresApproval,
    /// The registration subsystem reported a failure.
    Error(String),
    /// The platform cannot host the service at all.
    NotAvailable(String),
}

impl DaemonStatus {
    pub fn code(&self) -> ResultCode {
        match self {
            DaemonStatus::Enabled => ResultCode::Success,
            DaemonStatus::NotRegistered => ResultCode::NotRegistered,
            DaemonStatus::RequiresApproval => ResultCode::RequiresApproval,
            DaemonStatus::Error(_) => ResultCode::Error,
            DaemonStatus::NotAvailable(_) => ResultCode::NotAvailable,
        }
    }

    /// Diagnostic text, present only in the `Error` state. The reason behind
    /// `NotAvailable` is reachable through the variant itself.
    pub fn diagnostic(&self) -> Option<&str> {
        match self {
            DaemonStatus::Error(message) => Some(message.as_str()),
            _ => None,
        }
    }

    /// Human-readable summary suitable for status output.
    pub fn describe(&self) -> String {
        match self {
            DaemonStatus::Enabled => "helper daemon is registered and enabled".to_string(),
            DaemonStatus::NotRegistered => "helper daemon is not registered".to_string(),
            DaemonStatus::RequiresApproval => {
                "helper daemon requires approval in system settings".to_string()
            }
            DaemonStatus::Error(message) => format!("helper daemon error: {message}"),
            DaemonStatus::NotAvailable(reason) => format!("helper daemon unavailable: {reason}"),
        }
    }
}

impl fmt::Display for DaemonStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DaemonStatus::Enabled => write!(f, "enabled"),
            DaemonStatus::NotRegistered => write!(f, "not_registered"),
            DaemonStatus::RequiresApproval => write!(f, "requires_approval"),
            DaemonStatus::Error(_) => write!(f, "error"),
            DaemonStatus::NotAvailable(_) => write!(f, "not_available"),
        }
    }
}

/// Successful result of a registration request.
///
/// Waiting for the user is not a failure, so it lives on the `Ok` side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationOutcome {
    Registered,
    PendingApproval,
}

impl RegistrationOutcome {
    pub fn code(self) -> ResultCode {
        match self {
            RegistrationOutcome::Registered => ResultCode::Success,
            RegistrationOutcome::PendingApproval => ResultCode::RequiresApproval,
        }
    }
}

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

/// Identifier correlating frames, sinks and cancellation for one operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(pub String);

impl OperationId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for OperationId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for OperationId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    PrivilegeCheck,
    Discover,
    Scan,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::PrivilegeCheck => "check",
            OperationKind::Discover => "discover",
            OperationKind::Scan => "scan",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a single operation: `Pending → Running → terminal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl OperationState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OperationState::Completed | OperationState::Failed | OperationState::Cancelled
        )
    }

    /// Terminal states never change; everything else moves forward only.
    pub fn can_transition_to(self, next: OperationState) -> bool {
        match (self, next) {
            (OperationState::Pending, OperationState::Pending) => false,
            (OperationState::Pending, _) => true,
            (OperationState::Running, OperationState::Pending | OperationState::Running) => false,
            (OperationState::Running, _) => true,
            _ => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Error taxonomy
// ---------------------------------------------------------------------------

/// Classes callers branch on; message text is for display only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Feature absent on this platform. Never retry.
    Unsupported,
    /// Not a failure: the user has to act (approve the service).
    NeedsUserAction,
    /// Channel trouble; reconnect and retry.
    Transient,
    /// Malformed request or daemon-side failure; retrying the same payload won't help.
    Rejected,
    /// Ended by the caller.
    Cancelled,
}

impl ErrorClass {
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorClass::Transient)
    }
}
