use std::time::Duration;

use crate::runtime::UnitState;

/// Errors raised by a runtime backend while driving one compute unit.
///
/// These stay internal to the backend layer; the orchestrator converts
/// them into [`GradeError`] variants at the unit boundary.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("docker api error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("control plane request failed: {0}")]
    ControlPlane(#[from] reqwest::Error),

    #[error("control plane returned {status} for {op}: {body}")]
    ApiStatus {
        op: &'static str,
        status: u16,
        body: String,
    },

    #[error("{op} retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted {
        op: &'static str,
        attempts: u32,
        last: String,
    },

    #[error("unit {unit_id} is {state:?}, {op} not permitted")]
    InvalidState {
        unit_id: String,
        op: &'static str,
        state: UnitState,
    },

    #[error("cluster environment unavailable: {0}")]
    Environment(String),

    #[error("{tool} exited with status {status}: {stderr}")]
    CopyTool {
        tool: &'static str,
        status: i32,
        stderr: String,
    },

    #[error("unit file staging failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while producing a grading image.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("docker api error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("image build reported: {0}")]
    Build(String),

    #[error("autograder archive unreadable: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("autograder config invalid: {0}")]
    Config(#[from] serde_json::Error),

    #[error("build context i/o failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Per-run and per-unit failure taxonomy.
///
/// `Build` is the only fatal variant: it aborts a run before any unit is
/// scheduled. Every other variant resolves at the unit boundary and becomes
/// that unit's [`UnitReport`](crate::score::UnitReport) row without
/// affecting siblings.
#[derive(Debug, thiserror::Error)]
pub enum GradeError {
    #[error("image build failed: {0}")]
    Build(#[from] BuildError),

    #[error("could not allocate compute unit: {0}")]
    UnitCreate(#[source] RuntimeError),

    #[error("unit exited with code {exit_code}")]
    UnitExecution { exit_code: i64, logs: String },

    #[error("unit exceeded its {limit:?} deadline and was killed")]
    Timeout { limit: Duration, logs: String },

    #[error("staging i/o failed: {0}")]
    StagingIo(#[from] std::io::Error),

    #[error("result artifact could not be decoded: {0}")]
    ResultDecode(#[source] serde_json::Error),

    #[error("compute unit error: {0}")]
    Unit(#[from] RuntimeError),
}

impl GradeError {
    /// Logs captured for the failure, when the unit got far enough to
    /// produce any.
    pub fn logs(&self) -> Option<&str> {
        match self {
            GradeError::UnitExecution { logs, .. } | GradeError::Timeout { logs, .. } => {
                Some(logs.as_str())
            }
            _ => None,
        }
    }
}
