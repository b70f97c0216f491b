/// Shared cluster job plumbing: manifest construction, REST client,
/// bounded backoff, poll loops.
pub mod cluster;
/// Local Docker daemon backend.
pub mod docker;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::config::{ClusterJobConfig, RuntimeKind};
use crate::error::RuntimeError;

pub use cluster::kube::{KubeBackend, KubeRuntimeFactory};
pub use cluster::openshift::{OpenshiftBackend, OpenshiftRuntimeFactory};
pub use docker::{DockerBackend, DockerRuntimeFactory};

/// In-unit directory the submission is mounted under.
pub const UNIT_SUBMISSION_DIR: &str = "/autograder/submission";

/// In-unit path the grading run writes its result artifact to.
pub const UNIT_RESULTS_PATH: &str = "/autograder/results/results.json";

/// Fixed entry command executed inside every compute unit.
pub const UNIT_ENTRY_COMMAND: &[&str] = &["/autograder/run_autograder"];

/// In-unit path for the staged submission file.
pub fn unit_submission_path(basename: &str) -> String {
    format!("{UNIT_SUBMISSION_DIR}/{basename}")
}

/// In-unit path a generated notebook PDF is written to.
pub fn unit_pdf_path(stem: &str) -> String {
    format!("{UNIT_SUBMISSION_DIR}/{stem}.pdf")
}

/// One local-path-to-unit-path binding staged into a compute unit before
/// start and copied back during finalize.
#[derive(Clone, Debug)]
pub struct VolumeBinding {
    pub local: PathBuf,
    pub remote: String,
}

/// Everything a factory needs to allocate one compute unit.
#[derive(Clone, Debug)]
pub struct RuntimeSpec {
    /// Image reference the unit runs.
    pub image: String,
    /// Entry command; the orchestrator always passes
    /// [`UNIT_ENTRY_COMMAND`].
    pub command: Vec<String>,
    /// Staged input/output bindings.
    pub binds: Vec<VolumeBinding>,
    pub network: crate::config::NetworkPolicy,
    /// Skip deleting the unit in `finalize`.
    pub keep_unit: bool,
}

/// Terminal exit of a compute unit.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct UnitExit {
    pub code: i64,
}

impl UnitExit {
    pub const SUCCESS: UnitExit = UnitExit { code: 0 };
    /// Exit recorded for force-killed units (128 + SIGKILL).
    pub const KILLED: UnitExit = UnitExit { code: 137 };

    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// Lifecycle state of one compute unit.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UnitState {
    Created,
    Running,
    Completed,
    Failed,
    Killed,
    Finalized,
}

impl UnitState {
    /// Completed, Failed, or Killed.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UnitState::Completed | UnitState::Failed | UnitState::Killed
        )
    }
}

/// Guarded state machine every backend embeds.
///
/// Enforces the transition contract shared by all substrates: `kill` on a
/// terminal unit is a no-op, and `finalize` is accepted exactly once, only
/// after a terminal state.
#[derive(Debug)]
pub struct UnitLifecycle {
    unit_id: String,
    inner: Mutex<LifecycleInner>,
}

#[derive(Debug)]
struct LifecycleInner {
    state: UnitState,
    exit: Option<UnitExit>,
}

impl UnitLifecycle {
    pub fn new(unit_id: impl Into<String>) -> Self {
        Self {
            unit_id: unit_id.into(),
            inner: Mutex::new(LifecycleInner {
                state: UnitState::Created,
                exit: None,
            }),
        }
    }

    pub fn unit_id(&self) -> &str {
        &self.unit_id
    }

    pub fn state(&self) -> UnitState {
        self.inner.lock().state
    }

    /// Terminal exit recorded by `mark_exited`/`mark_killed`, if any.
    pub fn recorded_exit(&self) -> Option<UnitExit> {
        self.inner.lock().exit
    }

    /// `Created → Running`.
    pub fn mark_running(&self) -> Result<(), RuntimeError> {
        let mut inner = self.inner.lock();
        if inner.state != UnitState::Created {
            return Err(self.invalid("start", inner.state));
        }
        inner.state = UnitState::Running;
        Ok(())
    }

    /// `Running → Completed | Failed`, recording the exit. Keeps an
    /// earlier terminal state (and exit) when already terminal, so a
    /// late natural exit never overwrites a kill.
    pub fn mark_exited(&self, exit: UnitExit) -> UnitExit {
        let mut inner = self.inner.lock();
        if inner.state.is_terminal() || inner.state == UnitState::Finalized {
            return inner.exit.unwrap_or(exit);
        }
        inner.state = if exit.success() {
            UnitState::Completed
        } else {
            UnitState::Failed
        };
        inner.exit = Some(exit);
        exit
    }

    /// Transition to `Killed` unless already terminal. Returns whether
    /// the caller should perform the substrate kill (false = no-op).
    pub fn mark_killed(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state.is_terminal() || inner.state == UnitState::Finalized {
            return false;
        }
        inner.state = UnitState::Killed;
        inner.exit = Some(UnitExit::KILLED);
        true
    }

    /// Terminal state `→ Finalized`, exactly once.
    pub fn mark_finalized(&self) -> Result<(), RuntimeError> {
        let mut inner = self.inner.lock();
        if !inner.state.is_terminal() {
            return Err(self.invalid("finalize", inner.state));
        }
        inner.state = UnitState::Finalized;
        Ok(())
    }

    fn invalid(&self, op: &'static str, state: UnitState) -> RuntimeError {
        RuntimeError::InvalidState {
            unit_id: self.unit_id.clone(),
            op,
            state,
        }
    }
}

/// One compute unit's lifecycle, exclusively owned by one grading unit.
///
/// Call order: `start` once, `wait` until a terminal exit (re-entrant
/// after `kill`), `kill` at most as needed (idempotent), `logs` any time
/// after start, `finalize` exactly once after a terminal `wait`/`kill`.
#[async_trait]
pub trait RuntimeBackend: Send + Sync {
    /// Explicitly transition the allocated unit to running.
    async fn start(&self) -> Result<(), RuntimeError>;

    /// Block until the unit reaches a terminal state and return its exit.
    ///
    /// The local substrate uses the daemon's native blocking wait; cluster
    /// substrates sleep-poll the job's terminal condition. The returned
    /// future is cancel-safe: dropping it (e.g. at a watchdog deadline)
    /// leaves the unit running.
    async fn wait(&self) -> Result<UnitExit, RuntimeError>;

    /// Force `Running → Killed`. No-op when already terminal.
    async fn kill(&self) -> Result<(), RuntimeError>;

    /// Opaque substrate identifier for logging/correlation.
    fn unit_id(&self) -> &str;

    /// Current lifecycle state.
    fn state(&self) -> UnitState;

    /// Unit log text, tail-bounded on remote substrates.
    async fn logs(&self) -> Result<String, RuntimeError>;

    /// Copy bound output paths back to local staging, then delete the
    /// unit unless its keep flag is set.
    async fn finalize(&self) -> Result<(), RuntimeError>;
}

/// Allocates compute units for one substrate.
#[async_trait]
pub trait RuntimeFactory: Send + Sync {
    async fn create(&self, spec: RuntimeSpec) -> Result<Box<dyn RuntimeBackend>, RuntimeError>;
}

/// Construct the factory for an explicitly named substrate.
///
/// Callers resolve the name themselves (e.g. via
/// [`RuntimeKind::from_env`](crate::config::RuntimeKind::from_env));
/// nothing in here consults the environment for selection.
pub fn runtime_factory(
    kind: RuntimeKind,
    cluster: ClusterJobConfig,
) -> Result<Arc<dyn RuntimeFactory>, RuntimeError> {
    Ok(match kind {
        RuntimeKind::Local => Arc::new(DockerRuntimeFactory::from_local_daemon()?),
        RuntimeKind::Kube => Arc::new(KubeRuntimeFactory::new(cluster)),
        RuntimeKind::Openshift => Arc::new(OpenshiftRuntimeFactory::new(cluster)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_happy_path() {
        let lc = UnitLifecycle::new("unit-1");
        assert_eq!(lc.state(), UnitState::Created);
        lc.mark_running().unwrap();
        assert_eq!(lc.state(), UnitState::Running);
        let exit = lc.mark_exited(UnitExit::SUCCESS);
        assert!(exit.success());
        assert_eq!(lc.state(), UnitState::Completed);
        lc.mark_finalized().unwrap();
        assert_eq!(lc.state(), UnitState::Finalized);
    }

    #[test]
    fn nonzero_exit_marks_failed() {
        let lc = UnitLifecycle::new("unit-1");
        lc.mark_running().unwrap();
        lc.mark_exited(UnitExit { code: 1 });
        assert_eq!(lc.state(), UnitState::Failed);
    }

    #[test]
    fn kill_on_terminal_unit_is_noop() {
        let lc = UnitLifecycle::new("unit-1");
        lc.mark_running().unwrap();
        lc.mark_exited(UnitExit::SUCCESS);
        assert!(!lc.mark_killed());
        assert_eq!(lc.state(), UnitState::Completed);
        assert_eq!(lc.recorded_exit(), Some(UnitExit::SUCCESS));
    }

    #[test]
    fn kill_records_killed_exit_and_late_wait_sees_it() {
        let lc = UnitLifecycle::new("unit-1");
        lc.mark_running().unwrap();
        assert!(lc.mark_killed());
        assert_eq!(lc.state(), UnitState::Killed);
        // A natural exit arriving after the kill does not overwrite it.
        let exit = lc.mark_exited(UnitExit::SUCCESS);
        assert_eq!(exit, UnitExit::KILLED);
        assert_eq!(lc.state(), UnitState::Killed);
    }

    #[test]
    fn finalize_requires_terminal_state() {
        let lc = UnitLifecycle::new("unit-1");
        assert!(matches!(
            lc.mark_finalized(),
            Err(RuntimeError::InvalidState { op: "finalize", .. })
        ));
        lc.mark_running().unwrap();
        assert!(lc.mark_finalized().is_err());
        lc.mark_exited(UnitExit::SUCCESS);
        lc.mark_finalized().unwrap();
        // Exactly once.
        assert!(lc.mark_finalized().is_err());
    }

    #[test]
    fn double_start_rejected() {
        let lc = UnitLifecycle::new("unit-1");
        lc.mark_running().unwrap();
        assert!(matches!(
            lc.mark_running(),
            Err(RuntimeError::InvalidState { op: "start", .. })
        ));
    }
}
