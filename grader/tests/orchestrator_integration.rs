//! Orchestrator integration tests against the mock runtime.
//!
//! Covers pool bounding, per-unit timeout watchdogs, failure isolation,
//! staging cleanup, PDF round-trips, and build-failure short-circuiting.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use grader::builder::BuildRequest;
use grader::config::LaunchOptions;
use grader::error::GradeError;
use grader::orchestrator::Orchestrator;
use grader::runtime::{RuntimeFactory, UnitState};
use grader::score::UnitStatus;
use grader::staging::StagedUnit;
use grader_testkit::{submission_fixtures, MockImageBuilder, MockRuntimeFactory, MockScript};

fn orchestrator(factory: &Arc<MockRuntimeFactory>, options: LaunchOptions) -> Orchestrator {
    let factory: Arc<dyn RuntimeFactory> = Arc::clone(factory) as Arc<dyn RuntimeFactory>;
    Orchestrator::new(factory, options)
}

fn build_request() -> BuildRequest {
    BuildRequest {
        dockerfile: PathBuf::from("Dockerfile"),
        archive: PathBuf::from("autograder.zip"),
        base_image: "ubuntu:24.04".to_string(),
        tag: "hw01".to_string(),
        config_overrides: serde_json::json!({}),
    }
}

#[tokio::test]
async fn every_submission_gets_exactly_one_outcome() {
    let (_dir, submissions) = submission_fixtures(5).unwrap();
    let factory = Arc::new(MockRuntimeFactory::new());

    let reports = orchestrator(&factory, LaunchOptions::new(2))
        .launch("grading:hw01", submissions.clone())
        .await;

    assert_eq!(reports.len(), 5);
    assert_eq!(factory.created_count(), 5);

    // Report rows stay in submission order with per-unit identity.
    for (report, submission) in reports.iter().zip(&submissions) {
        assert_eq!(&report.submission, submission);
        assert_eq!(report.status, UnitStatus::Completed);
        assert!(report.unit_id.is_some());
    }

    // No unit scheduled twice: each basename appears exactly once.
    let mut graded: Vec<String> = factory
        .records()
        .into_iter()
        .map(|record| record.submission)
        .collect();
    graded.sort();
    let mut expected: Vec<String> = submissions
        .iter()
        .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    expected.sort();
    assert_eq!(graded, expected);
}

#[tokio::test]
async fn lifecycle_calls_are_exact_and_staging_is_unique() {
    let (_dir, submissions) = submission_fixtures(6).unwrap();
    let factory = Arc::new(MockRuntimeFactory::new());

    orchestrator(&factory, LaunchOptions::new(6))
        .launch("grading:hw01", submissions)
        .await;

    let records = factory.records();
    assert_eq!(records.len(), 6);

    let mut all_staged = Vec::new();
    for record in &records {
        assert_eq!(record.start_calls, 1);
        assert_eq!(record.finalize_calls, 1);
        assert!(record.finalized_from_terminal);
        assert_eq!(record.kill_effective + record.kill_noop, 0);
        all_staged.extend(record.staged_locals.iter().cloned());
    }

    // Staged paths never collide across fully concurrent units.
    let distinct: std::collections::HashSet<_> = all_staged.iter().collect();
    assert_eq!(distinct.len(), all_staged.len());

    // And staging is gone once the run returns.
    for path in &all_staged {
        assert!(!path.exists(), "staging leak: {}", path.display());
    }
}

#[tokio::test]
async fn timed_out_unit_is_killed_and_isolated() {
    let (_dir, submissions) = submission_fixtures(3).unwrap();
    let factory = Arc::new(MockRuntimeFactory::new());
    factory.script_for(
        "sub01.ipynb",
        MockScript::hanging(Duration::from_secs(30)),
    );

    let options = LaunchOptions::new(2).with_timeout(Duration::from_millis(250));
    let reports = orchestrator(&factory, options)
        .launch("grading:hw01", submissions)
        .await;

    assert_eq!(reports[0].status, UnitStatus::Completed);
    assert_eq!(reports[1].status, UnitStatus::TimedOut);
    assert_eq!(reports[2].status, UnitStatus::Completed);

    // Watchdog killed only the hanging unit, and captured its logs.
    let hung = factory.record_for("sub01.ipynb").unwrap();
    assert_eq!(hung.kill_effective, 1);
    assert_eq!(hung.finalize_calls, 1);
    assert!(reports[1]
        .logs
        .as_deref()
        .unwrap()
        .contains("still executing"));
    assert!(reports[1].score.is_none());
}

#[tokio::test]
async fn nonzero_exit_fails_only_that_unit() {
    let (_dir, submissions) = submission_fixtures(3).unwrap();
    let factory = Arc::new(MockRuntimeFactory::new());
    factory.script_for("sub02.ipynb", MockScript::failing(1));

    let reports = orchestrator(&factory, LaunchOptions::new(3))
        .launch("grading:hw01", submissions)
        .await;

    assert_eq!(reports[0].status, UnitStatus::Completed);
    assert_eq!(reports[1].status, UnitStatus::Completed);
    assert_eq!(reports[2].status, UnitStatus::ExecutionFailed);
    assert!(reports[2]
        .logs
        .as_deref()
        .unwrap()
        .contains("autograder crashed with exit 1"));
    assert!(reports[2].error.as_deref().unwrap().contains("exit"));
}

#[tokio::test]
async fn create_failure_reports_without_aborting_siblings() {
    let (_dir, submissions) = submission_fixtures(3).unwrap();
    let factory = Arc::new(MockRuntimeFactory::new());
    factory.script_for("sub00.ipynb", MockScript::unschedulable());

    let reports = orchestrator(&factory, LaunchOptions::new(2))
        .launch("grading:hw01", submissions)
        .await;

    assert_eq!(reports[0].status, UnitStatus::CreateFailed);
    assert!(reports[0].unit_id.is_none());
    assert_eq!(reports[1].status, UnitStatus::Completed);
    assert_eq!(reports[2].status, UnitStatus::Completed);
}

#[tokio::test]
async fn scores_flatten_with_exact_percent() {
    let (_dir, submissions) = submission_fixtures(1).unwrap();
    let factory = Arc::new(MockRuntimeFactory::new());

    let reports = orchestrator(&factory, LaunchOptions::new(1))
        .launch("grading:hw01", submissions)
        .await;

    let score = reports[0].score.as_ref().unwrap();
    assert_eq!(score.file, "sub00");
    assert_eq!(score.total, 8.0);
    assert_eq!(score.possible, 10.0);
    assert_eq!(score.percent_correct, 0.8);
    assert_eq!(score.scores.len(), 2);
}

#[tokio::test]
async fn pdf_round_trips_into_output_dir() {
    let (dir, submissions) = submission_fixtures(1).unwrap();
    let pdf_dir = dir.path().join("pdfs");
    let factory = Arc::new(MockRuntimeFactory::new());
    factory.set_default_script(MockScript::passing().with_pdf(b"%PDF-1.4 graded".to_vec()));

    let options = LaunchOptions::new(1).with_pdf_dir(&pdf_dir);
    let reports = orchestrator(&factory, options)
        .launch("grading:hw01", submissions)
        .await;

    assert_eq!(reports[0].status, UnitStatus::Completed);
    let published = pdf_dir.join("sub00.pdf");
    assert_eq!(std::fs::read(&published).unwrap(), b"%PDF-1.4 graded");

    // The staging temp copy is gone.
    let record = factory.record_for("sub00.ipynb").unwrap();
    for staged in &record.staged_locals {
        assert!(!staged.exists());
    }
}

#[tokio::test]
async fn pool_size_bounds_parallelism() {
    let (_dir, submissions) = submission_fixtures(4).unwrap();
    let factory = Arc::new(MockRuntimeFactory::new());
    factory.set_default_script({
        let mut script = MockScript::passing();
        script.run_for = Duration::from_millis(100);
        script
    });

    // Serial: four 100ms units take at least 400ms.
    let start = Instant::now();
    orchestrator(&factory, LaunchOptions::new(1))
        .launch("grading:hw01", submissions.clone())
        .await;
    assert!(start.elapsed() >= Duration::from_millis(400));

    // Fully parallel: the same batch finishes well under serial time.
    let start = Instant::now();
    orchestrator(&factory, LaunchOptions::new(4))
        .launch("grading:hw01", submissions)
        .await;
    assert!(start.elapsed() < Duration::from_millis(400));
}

#[tokio::test]
async fn keep_units_flag_reaches_backends() {
    let (_dir, submissions) = submission_fixtures(1).unwrap();
    let factory = Arc::new(MockRuntimeFactory::new());

    orchestrator(&factory, LaunchOptions::new(1).with_keep_units(true))
        .launch("grading:hw01", submissions)
        .await;

    assert!(factory.record_for("sub00.ipynb").unwrap().kept);
}

#[tokio::test]
async fn build_failure_aborts_before_scheduling() {
    let (_dir, submissions) = submission_fixtures(2).unwrap();
    let factory = Arc::new(MockRuntimeFactory::new());
    let builder = MockImageBuilder::failing();

    let result = orchestrator(&factory, LaunchOptions::new(2))
        .run(&builder, &build_request(), submissions)
        .await;

    assert!(matches!(result, Err(GradeError::Build(_))));
    assert_eq!(builder.build_count(), 1);
    assert_eq!(factory.created_count(), 0);
}

#[tokio::test]
async fn run_builds_once_then_grades_everything() {
    let (_dir, submissions) = submission_fixtures(3).unwrap();
    let factory = Arc::new(MockRuntimeFactory::new());
    let builder = MockImageBuilder::returning("grading:hw01");

    let reports = orchestrator(&factory, LaunchOptions::new(2))
        .run(&builder, &build_request(), submissions)
        .await
        .unwrap();

    assert_eq!(builder.build_count(), 1);
    assert_eq!(reports.len(), 3);
    assert!(reports.iter().all(|r| r.is_success()));
}

#[tokio::test]
async fn kill_after_natural_exit_is_a_noop() {
    let (_dir, submissions) = submission_fixtures(1).unwrap();
    let factory = Arc::new(MockRuntimeFactory::new());

    let staged = StagedUnit::prepare(&submissions[0], false).await.unwrap();
    let unit = factory
        .create(grader::runtime::RuntimeSpec {
            image: "grading:hw01".to_string(),
            command: vec!["/autograder/run_autograder".to_string()],
            binds: staged.bindings(),
            network: Default::default(),
            keep_unit: false,
        })
        .await
        .unwrap();

    unit.start().await.unwrap();
    let exit = unit.wait().await.unwrap();
    assert!(exit.success());
    assert_eq!(unit.state(), UnitState::Completed);

    unit.kill().await.unwrap();
    assert_eq!(unit.state(), UnitState::Completed);
    let record = factory.record_for("sub00.ipynb").unwrap();
    assert_eq!(record.kill_effective, 0);
    assert_eq!(record.kill_noop, 1);

    unit.finalize().await.unwrap();
    assert_eq!(unit.state(), UnitState::Finalized);
    // Finalize is accepted exactly once.
    assert!(unit.finalize().await.is_err());
}
