//! Refusal paths of the generation entry point: the execution-consent flag
//! and configuration validation. Kept in their own binary so the consent
//! flag can be manipulated without racing the scenario tests.

use std::sync::Mutex;

use forjar::config::{Configuration, CoverageMetricSet};
use forjar::generator::{generate, CONSENT_ENV};
use forjar::lang::Project;
use forjar::ExitCode;

// the tests toggle a process-wide flag, so they must not interleave
static ENV_LOCK: Mutex<()> = Mutex::new(());

fn project() -> Project {
    Project::new().with_module("m", "def id(x: int) -> int { return x }")
}

#[test]
fn missing_consent_flag_aborts_with_dedicated_exit_code() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|p| p.into_inner());
    std::env::remove_var(CONSENT_ENV);
    let error = generate(&project(), "m", &Configuration::default()).unwrap_err();
    assert_eq!(error.exit_code(), ExitCode::ConsentMissing);
}

#[test]
fn invalid_configuration_aborts_with_exit_code_one() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|p| p.into_inner());
    std::env::set_var(CONSENT_ENV, "1");
    let mut config = Configuration::default();
    config.coverage_metrics = CoverageMetricSet {
        branch: false,
        line: false,
        checked: false,
    };
    let error = generate(&project(), "m", &config).unwrap_err();
    assert_eq!(error.exit_code(), ExitCode::Configuration);
}

#[test]
fn unknown_module_is_a_setup_failure() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|p| p.into_inner());
    std::env::set_var(CONSENT_ENV, "1");
    let error = generate(&project(), "missing", &Configuration::default()).unwrap_err();
    assert_eq!(error.exit_code(), ExitCode::Setup);
}

#[test]
fn excluded_target_module_is_rejected() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|p| p.into_inner());
    std::env::set_var(CONSENT_ENV, "1");
    let mut config = Configuration::default();
    config.exclude_modules = vec!["m".to_string()];
    let error = generate(&project(), "m", &config).unwrap_err();
    assert_eq!(error.exit_code(), ExitCode::Configuration);
}
