mod common;

use pretty_assertions::assert_eq;

use testsmith::config::TestGenConfig;
use testsmith::control::CancelToken;
use testsmith::orchestrator::{run, Collaborators, RunMode};
use testsmith::report::UnitStatus;

use common::*;

const COVERAGE_MARKER: &str = "Existing tests reach";

fn coverage_config(passes: u32) -> TestGenConfig {
    TestGenConfig {
        use_coverage: true,
        coverage_threshold: 75.0,
        coverage_passes: passes,
        ..gtest_config()
    }
}

/// First request gets the base test, coverage requests get the edge case.
fn gateway() -> FakeGateway {
    FakeGateway::new(|prompt, _| {
        if prompt.user.contains(COVERAGE_MARKER) {
            Ok(ADD_EDGE_TEST.to_string())
        } else {
            Ok(ADD_TEST.to_string())
        }
    })
}

#[test]
fn coverage_met_on_first_measurement_needs_no_extra_cycle() {
    let project = add_project();
    let cfg = coverage_config(1);
    let gw = gateway();
    let tc = FakeToolchain::passing();
    let cov = FakeCoverage::new(vec![90.0]);

    let collab = Collaborators {
        gateway: &gw,
        toolchain: &tc,
        coverage: Some(&cov),
        mode: RunMode::Generate,
    };
    let report = run(project.path(), &cfg, &collab, &CancelToken::new()).unwrap();

    let unit = &report.units[0];
    assert_eq!(unit.status, UnitStatus::Passed);
    assert_eq!(unit.coverage_cycles, 0);
    assert!(unit.coverage.as_ref().unwrap().passed);
    assert_eq!(cov.calls(), 1);
    assert_eq!(gw.calls(), 1);
    assert_eq!(report.exit_code(), 0);
}

#[test]
fn below_threshold_runs_one_extra_cycle_then_recovers() {
    let project = add_project();
    let cfg = coverage_config(1);
    let gw = gateway();
    let tc = FakeToolchain::passing();
    let cov = FakeCoverage::new(vec![50.0, 80.0]);

    let collab = Collaborators {
        gateway: &gw,
        toolchain: &tc,
        coverage: Some(&cov),
        mode: RunMode::Generate,
    };
    let report = run(project.path(), &cfg, &collab, &CancelToken::new()).unwrap();

    let unit = &report.units[0];
    assert_eq!(unit.coverage_cycles, 1);
    assert_eq!(cov.calls(), 2);
    assert!(unit.coverage.as_ref().unwrap().passed);
    assert_eq!(
        unit.test_cases,
        vec!["AddTest.PositiveNumbers".to_string(), "AddTest.NegativeNumbers".to_string()]
    );

    let prompts = gw.prompts();
    assert_eq!(prompts.len(), 2);
    assert!(!prompts[0].contains(COVERAGE_MARKER));
    assert!(prompts[1].contains("50.0%"));
    assert_eq!(report.exit_code(), 0);
}

#[test]
fn exhausted_coverage_budget_finishes_with_a_warning() {
    let project = add_project();
    let cfg = coverage_config(1);
    let gw = gateway();
    let tc = FakeToolchain::passing();
    let cov = FakeCoverage::new(vec![40.0]);

    let collab = Collaborators {
        gateway: &gw,
        toolchain: &tc,
        coverage: Some(&cov),
        mode: RunMode::Generate,
    };
    let report = run(project.path(), &cfg, &collab, &CancelToken::new()).unwrap();

    let unit = &report.units[0];
    // Exactly one extra generation cycle, then the final measurement.
    assert_eq!(unit.coverage_cycles, 1);
    assert_eq!(cov.calls(), 2);
    assert_eq!(gw.calls(), 2);
    assert!(!unit.coverage.as_ref().unwrap().passed);

    assert_eq!(report.counts.below_threshold, 1);
    assert_eq!(report.warnings.len(), 1);
    assert!(report.warnings[0].contains("below threshold"));
    assert_eq!(report.exit_code(), 1);
}

#[test]
fn disabled_coverage_is_never_measured() {
    let project = add_project();
    let cfg = TestGenConfig {
        use_coverage: false,
        ..coverage_config(1)
    };
    let gw = gateway();
    let tc = FakeToolchain::passing();
    let cov = FakeCoverage::new(vec![10.0]);

    let collab = Collaborators {
        gateway: &gw,
        toolchain: &tc,
        coverage: Some(&cov),
        mode: RunMode::Generate,
    };
    let report = run(project.path(), &cfg, &collab, &CancelToken::new()).unwrap();

    assert_eq!(cov.calls(), 0);
    assert!(report.units[0].coverage.is_none());
    assert_eq!(report.exit_code(), 0);
}
