//! Parallel grading engine.
//!
//! Fans one grading unit out per submission over a fixed-size worker
//! pool. Each worker fully completes one unit (stage, create, start,
//! watchdogged wait, logs, finalize, score) before pulling the next
//! submission; the launch joins every worker before returning. Failures
//! resolve at the unit boundary: a unit's error becomes its report row
//! and siblings keep running.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, error, info, warn, Instrument};

use crate::builder::{BuildRequest, ImageBuilder};
use crate::config::LaunchOptions;
use crate::error::{GradeError, RuntimeError};
use crate::runtime::{RuntimeFactory, RuntimeSpec, UNIT_ENTRY_COMMAND};
use crate::score::{submission_stem, ScoreRecord, UnitReport};
use crate::staging::StagedUnit;
use crate::telemetry;

/// Drives grading runs against one runtime substrate.
pub struct Orchestrator {
    factory: Arc<dyn RuntimeFactory>,
    options: LaunchOptions,
}

impl Orchestrator {
    pub fn new(factory: Arc<dyn RuntimeFactory>, options: LaunchOptions) -> Self {
        Self { factory, options }
    }

    pub fn options(&self) -> &LaunchOptions {
        &self.options
    }

    /// Build the grading image, then launch every submission against it.
    ///
    /// A build failure is fatal and returns before any unit is scheduled;
    /// once the image exists, the run always produces one report row per
    /// submission.
    pub async fn run(
        &self,
        builder: &dyn ImageBuilder,
        build: &BuildRequest,
        submissions: Vec<PathBuf>,
    ) -> Result<Vec<UnitReport>, GradeError> {
        let span = telemetry::image_build_span(build.image());
        let image = match builder.build_image(build).instrument(span).await {
            Ok(image) => {
                telemetry::record_image_built(&image, "built");
                image
            }
            Err(err) => {
                telemetry::record_image_built(build.image(), "failed");
                return Err(err.into());
            }
        };
        Ok(self.launch(&image, submissions).await)
    }

    /// Grade every submission in the shared image, `concurrency` units at
    /// a time. Returns one report row per submission, in submission
    /// order; completion order is arbitrary.
    pub async fn launch(&self, image: &str, submissions: Vec<PathBuf>) -> Vec<UnitReport> {
        let total = submissions.len();
        if total == 0 {
            return Vec::new();
        }
        let workers = self.options.concurrency.clamp(1, total);
        info!(total, workers, image, "launching grading units");

        let originals = submissions.clone();
        let queue: Arc<Mutex<VecDeque<(usize, PathBuf)>>> =
            Arc::new(Mutex::new(submissions.into_iter().enumerate().collect()));
        let slots: Arc<Mutex<Vec<Option<UnitReport>>>> = {
            let mut empty = Vec::with_capacity(total);
            empty.resize_with(total, || None);
            Arc::new(Mutex::new(empty))
        };

        let mut handles = Vec::with_capacity(workers);
        for worker in 0..workers {
            let queue = Arc::clone(&queue);
            let slots = Arc::clone(&slots);
            let factory = Arc::clone(&self.factory);
            let options = self.options.clone();
            let image = image.to_string();

            handles.push(tokio::spawn(async move {
                loop {
                    let next = queue.lock().await.pop_front();
                    let Some((index, submission)) = next else {
                        debug!(worker, "worker drained");
                        break;
                    };
                    let report = grade_unit(&factory, &options, &image, &submission).await;
                    slots.lock().await[index] = Some(report);
                }
            }));
        }

        // Full join: the call does not return until every unit is
        // terminal.
        for handle in handles {
            if let Err(err) = handle.await {
                error!(error = %err, "grading worker panicked");
            }
        }

        drop(queue);
        let slots = match Arc::try_unwrap(slots) {
            Ok(mutex) => mutex.into_inner(),
            Err(shared) => shared.lock().await.drain(..).collect(),
        };
        let mut reports = Vec::with_capacity(total);
        for (index, slot) in slots.into_iter().enumerate() {
            match slot {
                Some(report) => reports.push(report),
                // A panicked worker leaves its slot empty; the submission
                // still gets an explicit terminal outcome.
                None => {
                    let submission = originals[index].clone();
                    let file = submission_stem(&submission);
                    reports.push(UnitReport::failed(
                        submission,
                        file,
                        None,
                        GradeError::Unit(RuntimeError::Environment(
                            "grading worker terminated before producing an outcome".to_string(),
                        )),
                    ));
                }
            }
        }

        let failed = reports.iter().filter(|r| !r.is_success()).count();
        info!(
            completed = reports.len() - failed,
            failed, "grading run finished"
        );
        reports
    }
}

/// Grade one submission, converting every failure into its report row.
async fn grade_unit(
    factory: &Arc<dyn RuntimeFactory>,
    options: &LaunchOptions,
    image: &str,
    submission: &Path,
) -> UnitReport {
    let file = submission_stem(submission);
    let timer = telemetry::record_unit_start();
    let span = telemetry::unit_grade_span(submission.to_string_lossy());

    let report = match run_unit(factory, options, image, submission)
        .instrument(span)
        .await
    {
        Ok(graded) => UnitReport::completed(
            submission.to_path_buf(),
            file,
            Some(graded.unit_id),
            graded.score,
        ),
        Err(failure) => {
            warn!(
                submission = %submission.display(),
                unit = failure.unit_id.as_deref().unwrap_or("-"),
                error = %failure.error,
                "unit failed"
            );
            UnitReport::failed(
                submission.to_path_buf(),
                file,
                failure.unit_id,
                failure.error,
            )
        }
    };
    telemetry::record_unit_graded(&report.file, report.status.as_str());
    telemetry::record_unit_end(timer, report.status.as_str());
    report
}

struct GradedUnit {
    unit_id: String,
    score: ScoreRecord,
}

struct UnitFailure {
    error: GradeError,
    unit_id: Option<String>,
}

impl UnitFailure {
    fn early(error: GradeError) -> Self {
        Self {
            error,
            unit_id: None,
        }
    }
}

/// The per-unit algorithm. Staging is scoped: on every exit path the
/// staged files are removed, by the explicit cleanup on success or by
/// `Drop` when an error propagates first.
async fn run_unit(
    factory: &Arc<dyn RuntimeFactory>,
    options: &LaunchOptions,
    image: &str,
    submission: &Path,
) -> Result<GradedUnit, UnitFailure> {
    let mut staged = StagedUnit::prepare(submission, options.pdf_dir.is_some())
        .await
        .map_err(|err| UnitFailure::early(GradeError::StagingIo(err)))?;

    let spec = RuntimeSpec {
        image: image.to_string(),
        command: UNIT_ENTRY_COMMAND.iter().map(|s| s.to_string()).collect(),
        binds: staged.bindings(),
        network: options.network,
        keep_unit: options.keep_units,
    };

    let unit = factory
        .create(spec)
        .await
        .map_err(|err| UnitFailure::early(GradeError::UnitCreate(err)))?;
    let unit_id = unit.unit_id().to_string();
    info!(unit = %unit_id, submission = %submission.display(), "grading started");

    let fail = |error: GradeError| UnitFailure {
        error,
        unit_id: Some(unit_id.clone()),
    };

    unit.start().await.map_err(|err| fail(err.into()))?;

    // Watchdog: the wait is raced against the deadline; on elapse the
    // pending wait is dropped, the unit killed, and the terminal state
    // observed with a second wait.
    let mut deadline_hit: Option<Duration> = None;
    let exit = match options.timeout {
        Some(limit) => match tokio::time::timeout(limit, unit.wait()).await {
            Ok(result) => result.map_err(|err| fail(err.into()))?,
            Err(_) => {
                warn!(unit = %unit_id, ?limit, "unit exceeded deadline, killing");
                deadline_hit = Some(limit);
                unit.kill().await.map_err(|err| fail(err.into()))?;
                unit.wait().await.map_err(|err| fail(err.into()))?
            }
        },
        None => unit.wait().await.map_err(|err| fail(err.into()))?,
    };

    // Logs are captured regardless of outcome.
    let logs = match unit.logs().await {
        Ok(logs) => logs,
        Err(err) => {
            warn!(unit = %unit_id, error = %err, "log capture failed");
            String::new()
        }
    };
    debug!(unit = %unit_id, exit = exit.code, "unit logs:\n{logs}");

    unit.finalize().await.map_err(|err| fail(err.into()))?;

    if let Some(limit) = deadline_hit {
        return Err(fail(GradeError::Timeout { limit, logs }));
    }
    if !exit.success() {
        return Err(fail(GradeError::UnitExecution {
            exit_code: exit.code,
            logs,
        }));
    }

    let score = ScoreRecord::from_results_file(staged.results_path(), staged.stem())
        .map_err(&fail)?;
    if let Some(pdf_dir) = &options.pdf_dir {
        staged
            .publish_pdf(pdf_dir)
            .await
            .map_err(|err| fail(GradeError::StagingIo(err)))?;
    }

    // Best-effort: a cleanup error must not mask the grading outcome.
    if let Err(err) = staged.cleanup() {
        warn!(unit = %unit_id, error = %err, "staging cleanup failed");
    }

    Ok(GradedUnit { unit_id, score })
}
