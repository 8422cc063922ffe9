//! Registration → approval → enabled, the way a user walks through it.

use netprobe_core::{DaemonStatus, RegistrationOutcome, ResultCode};
use netprobe_daemon::{RegistrationManager, SettingsLauncher, SimulatedRegistry};

#[test]
fn approval_in_settings_enables_the_service() {
    let registry = SimulatedRegistry::requiring_approval();
    let manager = RegistrationManager::new(registry.clone());
    let launcher = SettingsLauncher::with_command(vec!["true".to_string()]);

    let outcome = manager.register().expect("register");
    assert_eq!(outcome, RegistrationOutcome::PendingApproval);
    assert_eq!(outcome.code(), ResultCode::RequiresApproval);
    assert!(manager.requires_approval());

    assert!(launcher.open_approval_settings());
    assert_eq!(
        manager.status(),
        DaemonStatus::RequiresApproval,
        "opening settings is not approval"
    );

    registry.approve();
    assert!(manager.is_registered_and_enabled());
    assert_eq!(manager.status().code(), ResultCode::Success);
    assert_eq!(manager.error_message(), None);
}

#[test]
fn registering_an_approved_service_again_is_harmless() {
    let registry = SimulatedRegistry::requiring_approval();
    let manager = RegistrationManager::new(registry.clone());
    manager.register().unwrap();
    registry.approve();

    assert_eq!(manager.register().unwrap(), RegistrationOutcome::Registered);
    assert_eq!(manager.status(), DaemonStatus::Enabled);
}

#[test]
fn registration_errors_carry_diagnostics() {
    let registry = SimulatedRegistry::new();
    registry.fail_with("Bootstrap failed: 5: Input/output error");
    let manager = RegistrationManager::new(registry);

    let err = manager.register().unwrap_err();
    assert_eq!(err.code(), ResultCode::Error);
    assert!(err.class().is_retryable());
    assert!(err.to_string().contains("Input/output error"));
    assert_eq!(
        manager.error_message().as_deref(),
        Some("Bootstrap failed: 5: Input/output error")
    );
}
