//! Boundary result-code mapping for `netprobe-core` types.
//!
//! Each `#[case]` is isolated — no shared state.

use netprobe_core::{DaemonStatus, RegistrationOutcome, ResultCode};
use rstest::rstest;

#[rstest]
#[case(0, ResultCode::Success)]
#[case(1, ResultCode::NotRegistered)]
#[case(2, ResultCode::RequiresApproval)]
#[case(3, ResultCode::Error)]
#[case(4, ResultCode::NotAvailable)]
#[case(99, ResultCode::Error)]
#[case(-1, ResultCode::Error)]
fn integer_codes_map_to_result_codes(#[case] raw: i32, #[case] expected: ResultCode) {
    assert_eq!(ResultCode::from(raw), expected);
}

#[rstest]
#[case(ResultCode::Success, 0)]
#[case(ResultCode::NotRegistered, 1)]
#[case(ResultCode::RequiresApproval, 2)]
#[case(ResultCode::Error, 3)]
#[case(ResultCode::NotAvailable, 4)]
fn result_codes_have_stable_integer_values(#[case] code: ResultCode, #[case] raw: i32) {
    assert_eq!(code.as_i32(), raw);
}

#[rstest]
#[case(DaemonStatus::Enabled, ResultCode::Success)]
#[case(DaemonStatus::NotRegistered, ResultCode::NotRegistered)]
#[case(DaemonStatus::RequiresApproval, ResultCode::RequiresApproval)]
#[case(DaemonStatus::Error("launchctl exploded".into()), ResultCode::Error)]
#[case(DaemonStatus::NotAvailable("linux".into()), ResultCode::NotAvailable)]
fn status_reports_its_code(#[case] status: DaemonStatus, #[case] code: ResultCode) {
    assert_eq!(status.code(), code);
}

#[rstest]
#[case(DaemonStatus::Enabled, None)]
#[case(DaemonStatus::NotRegistered, None)]
#[case(DaemonStatus::RequiresApproval, None)]
#[case(DaemonStatus::Error("bad plist".into()), Some("bad plist"))]
#[case(DaemonStatus::NotAvailable("needs macOS 13".into()), None)]
fn only_error_states_carry_diagnostics(
    #[case] status: DaemonStatus,
    #[case] diagnostic: Option<&str>,
) {
    assert_eq!(status.diagnostic(), diagnostic);
}

#[test]
fn pending_approval_is_not_an_error_code() {
    assert_eq!(RegistrationOutcome::Registered.code(), ResultCode::Success);
    assert_eq!(
        RegistrationOutcome::PendingApproval.code(),
        ResultCode::RequiresApproval
    );
}
