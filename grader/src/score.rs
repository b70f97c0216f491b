use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::GradeError;

/// The result artifact a compute unit writes to its fixed results path.
///
/// Per-test entries carry the obtained and obtainable score; `total` and
/// `possible` are the aggregates over all tests.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GradingResults {
    pub tests: Vec<TestResult>,
    pub total: f64,
    pub possible: f64,
}

/// One graded test inside [`GradingResults`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TestResult {
    pub name: String,
    pub score: f64,
    pub possible: f64,
}

impl GradingResults {
    /// Fraction of possible points obtained; 0.0 when nothing was
    /// obtainable.
    pub fn percent_correct(&self) -> f64 {
        if self.possible == 0.0 {
            0.0
        } else {
            self.total / self.possible
        }
    }
}

/// One submission's flattened grading row: test name → obtained score,
/// plus the aggregates and the submission's file identifier.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScoreRecord {
    /// Submission file stem (basename without extension).
    pub file: String,
    /// Obtained score per test, in name order.
    pub scores: BTreeMap<String, f64>,
    pub total: f64,
    pub possible: f64,
    pub percent_correct: f64,
}

impl ScoreRecord {
    /// Flatten a unit's result artifact into a report row.
    pub fn from_results(results: &GradingResults, file: impl Into<String>) -> Self {
        let scores = results
            .tests
            .iter()
            .map(|t| (t.name.clone(), t.score))
            .collect();
        Self {
            file: file.into(),
            scores,
            total: results.total,
            possible: results.possible,
            percent_correct: results.percent_correct(),
        }
    }

    /// Read and flatten the staged result artifact at `path`.
    pub fn from_results_file(path: &Path, file: impl Into<String>) -> Result<Self, GradeError> {
        let raw = std::fs::read_to_string(path)?;
        let results: GradingResults =
            serde_json::from_str(&raw).map_err(GradeError::ResultDecode)?;
        Ok(Self::from_results(&results, file))
    }
}

/// Terminal status of one grading unit, always explicit in the report.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum UnitStatus {
    /// Unit ran to completion and produced a score.
    Completed,
    /// The substrate could not allocate the unit.
    CreateFailed,
    /// The unit ran and exited non-zero.
    ExecutionFailed,
    /// The watchdog killed the unit at its deadline.
    TimedOut,
    /// Local staging copy/cleanup failed.
    StagingFailed,
    /// The result artifact was missing or unparseable.
    ResultDecodeFailed,
    /// Backend lifecycle call failed outside the cases above.
    RuntimeFailed,
}

impl UnitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnitStatus::Completed => "completed",
            UnitStatus::CreateFailed => "create_failed",
            UnitStatus::ExecutionFailed => "execution_failed",
            UnitStatus::TimedOut => "timed_out",
            UnitStatus::StagingFailed => "staging_failed",
            UnitStatus::ResultDecodeFailed => "result_decode_failed",
            UnitStatus::RuntimeFailed => "runtime_failed",
        }
    }
}

impl std::fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the aggregate report, in submission order.
#[derive(Clone, Debug, Serialize)]
pub struct UnitReport {
    /// Path to the graded submission.
    pub submission: PathBuf,
    /// Submission file stem.
    pub file: String,
    /// Opaque compute-unit identifier, when allocation got that far.
    pub unit_id: Option<String>,
    pub status: UnitStatus,
    /// Present iff `status == Completed`.
    pub score: Option<ScoreRecord>,
    /// Captured unit logs, attached to failures.
    pub logs: Option<String>,
    /// Failure description, `None` on success.
    pub error: Option<String>,
    pub graded_at: DateTime<Utc>,
}

impl UnitReport {
    pub fn completed(
        submission: PathBuf,
        file: String,
        unit_id: Option<String>,
        score: ScoreRecord,
    ) -> Self {
        Self {
            submission,
            file,
            unit_id,
            status: UnitStatus::Completed,
            score: Some(score),
            logs: None,
            error: None,
            graded_at: Utc::now(),
        }
    }

    pub fn failed(
        submission: PathBuf,
        file: String,
        unit_id: Option<String>,
        error: GradeError,
    ) -> Self {
        let status = match &error {
            GradeError::UnitCreate(_) => UnitStatus::CreateFailed,
            GradeError::UnitExecution { .. } => UnitStatus::ExecutionFailed,
            GradeError::Timeout { .. } => UnitStatus::TimedOut,
            GradeError::StagingIo(_) => UnitStatus::StagingFailed,
            GradeError::ResultDecode(_) => UnitStatus::ResultDecodeFailed,
            GradeError::Unit(_) | GradeError::Build(_) => UnitStatus::RuntimeFailed,
        };
        Self {
            submission,
            file,
            unit_id,
            status,
            score: None,
            logs: error.logs().map(str::to_string),
            error: Some(error.to_string()),
            graded_at: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == UnitStatus::Completed
    }
}

/// File stem used as the submission's identifier in report rows.
pub fn submission_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn results() -> GradingResults {
        GradingResults {
            tests: vec![
                TestResult {
                    name: "q1".to_string(),
                    score: 3.0,
                    possible: 4.0,
                },
                TestResult {
                    name: "q2".to_string(),
                    score: 5.0,
                    possible: 6.0,
                },
            ],
            total: 8.0,
            possible: 10.0,
        }
    }

    #[test]
    fn percent_correct_is_exact() {
        assert_eq!(results().percent_correct(), 0.8);
    }

    #[test]
    fn percent_correct_guards_zero_possible() {
        let empty = GradingResults {
            tests: vec![],
            total: 0.0,
            possible: 0.0,
        };
        assert_eq!(empty.percent_correct(), 0.0);
    }

    #[test]
    fn flatten_keeps_per_test_scores_and_identity() {
        let record = ScoreRecord::from_results(&results(), "hw01-ada");
        assert_eq!(record.file, "hw01-ada");
        assert_eq!(record.scores.get("q1"), Some(&3.0));
        assert_eq!(record.scores.get("q2"), Some(&5.0));
        assert_eq!(record.percent_correct, 0.8);
    }

    #[test]
    fn artifact_round_trips_through_json() {
        let raw = serde_json::to_string(&results()).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.json");
        std::fs::write(&path, raw).unwrap();

        let record = ScoreRecord::from_results_file(&path, "hw01-ada").unwrap();
        assert_eq!(record.total, 8.0);
        assert_eq!(record.possible, 10.0);
    }

    #[test]
    fn garbage_artifact_is_a_decode_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.json");
        std::fs::write(&path, "not json").unwrap();

        let err = ScoreRecord::from_results_file(&path, "hw01").unwrap_err();
        assert!(matches!(err, GradeError::ResultDecode(_)));
    }

    #[test]
    fn submission_stem_drops_extension() {
        assert_eq!(
            submission_stem(Path::new("/tmp/subs/hw01-ada.ipynb")),
            "hw01-ada"
        );
    }
}
