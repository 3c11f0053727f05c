//! Shared PID controller: rate computation and cross-handle visibility.

mod common;

use common::unique_name;
use semian::{PingOutcome, RequestOutcome, SharedPidController};

#[test]
fn proportional_only_controller_matches_the_closed_form() {
    let name = unique_name("closedform");
    let pid = SharedPidController::new(&name, 0.9, 0.0, 0.0, 1.0, 0.01, 0o660).unwrap();

    for _ in 0..10 {
        pid.record_request(RequestOutcome::Success).unwrap();
    }
    for _ in 0..90 {
        pid.record_request(RequestOutcome::Error).unwrap();
    }

    // err_rate 0.9, ideal 0.01, no shedding and no pings yet:
    // rate = clamp(0.9 * (0.9 - 0.01)) = 0.801
    let rate = pid.update().unwrap();
    assert!((rate - 0.801).abs() < 1e-9, "rate = {rate}");

    let quiet = pid.update().unwrap();
    assert!(quiet <= rate, "idle window must not raise the rate");

    pid.remove();
}

#[test]
fn ping_failures_offset_the_shedding_term() {
    let name = unique_name("pings");
    let pid = SharedPidController::new(&name, 1.0, 0.0, 0.0, 1.0, 0.1, 0o660).unwrap();

    // First window: all errors, no pings. health = 0.9, so rate = 0.9.
    for _ in 0..10 {
        pid.record_request(RequestOutcome::Error).unwrap();
    }
    let first = pid.update().unwrap();
    assert!((first - 0.9).abs() < 1e-9, "first = {first}");

    for _ in 0..10 {
        pid.record_request(RequestOutcome::Error).unwrap();
        pid.record_ping(PingOutcome::Failure).unwrap();
    }
    // health = (1 - 0.1) - (0.9 - 1.0) = 1.0 -> clamped to full shedding.
    let second = pid.update().unwrap();
    assert_eq!(second, 1.0);

    pid.remove();
}

#[test]
fn rejected_requests_do_not_count_toward_the_error_rate() {
    let name = unique_name("rejected");
    let pid = SharedPidController::new(&name, 1.0, 0.0, 0.0, 1.0, 0.5, 0o660).unwrap();

    pid.record_request(RequestOutcome::Success).unwrap();
    pid.record_request(RequestOutcome::Rejected).unwrap();
    pid.record_request(RequestOutcome::Rejected).unwrap();

    pid.update().unwrap();
    let metrics = pid.metrics().unwrap();
    assert_eq!(metrics.error_rate, 0.0);

    pid.remove();
}

#[test]
fn handles_in_the_same_process_share_state() {
    let name = unique_name("share");
    let a = SharedPidController::new(&name, 0.9, 0.0, 0.0, 1.0, 0.01, 0o660).unwrap();
    let b = SharedPidController::new(&name, 0.9, 0.0, 0.0, 1.0, 0.01, 0o660).unwrap();

    for _ in 0..4 {
        a.record_request(RequestOutcome::Error).unwrap();
    }
    let rate = b.update().unwrap();
    assert!(rate > 0.0);
    assert_eq!(a.rejection_rate().unwrap(), b.rejection_rate().unwrap());

    b.destroy();
    a.remove();
}

#[test]
fn integral_term_accumulates_across_windows() {
    let name = unique_name("integral");
    let pid = SharedPidController::new(&name, 0.0, 0.1, 0.0, 1.0, 0.01, 0o660).unwrap();

    pid.record_request(RequestOutcome::Error).unwrap();
    pid.update().unwrap();
    let first = pid.metrics().unwrap().integral;

    pid.record_request(RequestOutcome::Error).unwrap();
    pid.update().unwrap();
    let second = pid.metrics().unwrap().integral;

    assert!(second > first, "integral must accumulate: {first} -> {second}");

    pid.remove();
}
