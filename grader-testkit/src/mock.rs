use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use grader::builder::{BuildRequest, ImageBuilder};
use grader::error::{BuildError, RuntimeError};
use grader::runtime::{
    RuntimeBackend, RuntimeFactory, RuntimeSpec, UnitExit, UnitLifecycle, UnitState,
    UNIT_RESULTS_PATH, UNIT_SUBMISSION_DIR,
};
use grader::score::GradingResults;

use crate::fixtures::passing_results;

/// Scripted behavior for one mock compute unit.
#[derive(Clone, Debug)]
pub struct MockScript {
    /// Exit code the unit reports from `wait`.
    pub exit_code: i64,
    /// Simulated execution time before the unit exits on its own.
    pub run_for: Duration,
    /// Log text returned from `logs`.
    pub logs: String,
    /// Result artifact written to the staged results path on `finalize`.
    pub results: Option<GradingResults>,
    /// PDF bytes written to the staged PDF path on `finalize`.
    pub pdf: Option<Vec<u8>>,
    /// Make `create` fail, simulating an unreachable control plane.
    pub fail_create: bool,
}

impl MockScript {
    /// Unit that exits 0 quickly with an 8/10 result artifact.
    pub fn passing() -> Self {
        Self::default()
    }

    /// Unit that exits with `code` and writes no results.
    pub fn failing(code: i64) -> Self {
        Self {
            exit_code: code,
            results: None,
            logs: format!("autograder crashed with exit {code}\n"),
            ..Self::default()
        }
    }

    /// Unit that keeps running for `run_for` (to be killed by a
    /// watchdog).
    pub fn hanging(run_for: Duration) -> Self {
        Self {
            run_for,
            results: None,
            logs: "still executing notebook...\n".to_string(),
            ..Self::default()
        }
    }

    /// Unit whose `create` fails.
    pub fn unschedulable() -> Self {
        Self {
            fail_create: true,
            ..Self::default()
        }
    }

    pub fn with_results(mut self, results: GradingResults) -> Self {
        self.results = Some(results);
        self
    }

    pub fn with_pdf(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.pdf = Some(bytes.into());
        self
    }

    pub fn with_logs(mut self, logs: impl Into<String>) -> Self {
        self.logs = logs.into();
        self
    }
}

impl Default for MockScript {
    fn default() -> Self {
        Self {
            exit_code: 0,
            run_for: Duration::from_millis(10),
            logs: "grading ok\n".to_string(),
            results: Some(passing_results(8.0, 10.0)),
            pdf: None,
            fail_create: false,
        }
    }
}

/// Everything one mock unit observed, for assertions.
#[derive(Clone, Debug, Default)]
pub struct UnitRecord {
    pub unit_id: String,
    /// Basename of the staged submission this unit was bound to.
    pub submission: String,
    /// Local staging paths from the unit's volume bindings.
    pub staged_locals: Vec<PathBuf>,
    pub start_calls: u32,
    pub wait_calls: u32,
    /// Kills that actually transitioned the unit.
    pub kill_effective: u32,
    /// Kills ignored because the unit was already terminal.
    pub kill_noop: u32,
    pub log_calls: u32,
    pub finalize_calls: u32,
    /// State observed at the moment finalize was accepted.
    pub finalized_from_terminal: bool,
    pub kept: bool,
}

/// Allocates [`MockBackend`] units and keeps a record per unit.
///
/// Scripts are keyed by submission basename; unmatched submissions get
/// the default script.
#[derive(Default)]
pub struct MockRuntimeFactory {
    scripts: Mutex<HashMap<String, MockScript>>,
    default_script: Mutex<MockScript>,
    records: Mutex<Vec<Arc<Mutex<UnitRecord>>>>,
    created: AtomicUsize,
}

impl MockRuntimeFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the unit for one submission basename.
    pub fn script_for(&self, basename: impl Into<String>, script: MockScript) {
        self.scripts.lock().insert(basename.into(), script);
    }

    pub fn set_default_script(&self, script: MockScript) {
        *self.default_script.lock() = script;
    }

    /// Snapshot of every unit's record, in creation order.
    pub fn records(&self) -> Vec<UnitRecord> {
        self.records
            .lock()
            .iter()
            .map(|record| record.lock().clone())
            .collect()
    }

    /// Record for the unit bound to `basename`.
    pub fn record_for(&self, basename: &str) -> Option<UnitRecord> {
        self.records()
            .into_iter()
            .find(|record| record.submission == basename)
    }

    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RuntimeFactory for MockRuntimeFactory {
    async fn create(&self, spec: RuntimeSpec) -> Result<Box<dyn RuntimeBackend>, RuntimeError> {
        let submission = spec
            .binds
            .iter()
            .find(|bind| {
                bind.remote.starts_with(UNIT_SUBMISSION_DIR) && !bind.remote.ends_with(".pdf")
            })
            .and_then(|bind| bind.remote.rsplit('/').next())
            .unwrap_or("")
            .to_string();

        let script = self
            .scripts
            .lock()
            .get(&submission)
            .cloned()
            .unwrap_or_else(|| self.default_script.lock().clone());
        if script.fail_create {
            return Err(RuntimeError::Environment(
                "mock control plane unreachable".to_string(),
            ));
        }

        let n = self.created.fetch_add(1, Ordering::SeqCst);
        let unit_id = format!("mock-unit-{n}");
        let record = Arc::new(Mutex::new(UnitRecord {
            unit_id: unit_id.clone(),
            submission,
            staged_locals: spec.binds.iter().map(|b| b.local.clone()).collect(),
            kept: spec.keep_unit,
            ..UnitRecord::default()
        }));
        self.records.lock().push(Arc::clone(&record));

        Ok(Box::new(MockBackend {
            script,
            spec,
            lifecycle: UnitLifecycle::new(unit_id),
            record,
            killed: Notify::new(),
        }))
    }
}

/// In-process compute unit with scripted behavior.
pub struct MockBackend {
    script: MockScript,
    spec: RuntimeSpec,
    lifecycle: UnitLifecycle,
    record: Arc<Mutex<UnitRecord>>,
    killed: Notify,
}

#[async_trait]
impl RuntimeBackend for MockBackend {
    async fn start(&self) -> Result<(), RuntimeError> {
        self.lifecycle.mark_running()?;
        self.record.lock().start_calls += 1;
        Ok(())
    }

    async fn wait(&self) -> Result<UnitExit, RuntimeError> {
        self.record.lock().wait_calls += 1;
        if let Some(exit) = self.lifecycle.recorded_exit() {
            return Ok(exit);
        }
        tokio::select! {
            _ = tokio::time::sleep(self.script.run_for) => {
                Ok(self.lifecycle.mark_exited(UnitExit { code: self.script.exit_code }))
            }
            _ = self.killed.notified() => {
                Ok(self.lifecycle.recorded_exit().unwrap_or(UnitExit::KILLED))
            }
        }
    }

    async fn kill(&self) -> Result<(), RuntimeError> {
        if self.lifecycle.mark_killed() {
            self.record.lock().kill_effective += 1;
            self.killed.notify_waiters();
        } else {
            self.record.lock().kill_noop += 1;
        }
        Ok(())
    }

    fn unit_id(&self) -> &str {
        self.lifecycle.unit_id()
    }

    fn state(&self) -> UnitState {
        self.lifecycle.state()
    }

    async fn logs(&self) -> Result<String, RuntimeError> {
        self.record.lock().log_calls += 1;
        Ok(self.script.logs.clone())
    }

    async fn finalize(&self) -> Result<(), RuntimeError> {
        let terminal = self.lifecycle.state().is_terminal();
        self.lifecycle.mark_finalized()?;
        {
            let mut record = self.record.lock();
            record.finalize_calls += 1;
            record.finalized_from_terminal = terminal;
        }

        // Copy-back: drop the scripted artifacts onto the staged paths,
        // the way a real backend copies bound outputs out of the unit.
        for bind in &self.spec.binds {
            if bind.remote == UNIT_RESULTS_PATH {
                if let Some(results) = &self.script.results {
                    let raw = serde_json::to_vec(results)
                        .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err))?;
                    tokio::fs::write(&bind.local, raw).await?;
                }
            } else if bind.remote.ends_with(".pdf") {
                if let Some(pdf) = &self.script.pdf {
                    tokio::fs::write(&bind.local, pdf).await?;
                }
            }
        }
        Ok(())
    }
}

/// Image builder that returns a fixed reference without touching any
/// daemon, or fails when scripted to.
pub struct MockImageBuilder {
    image: String,
    fail: bool,
    builds: AtomicUsize,
}

impl MockImageBuilder {
    pub fn returning(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            fail: false,
            builds: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            image: String::new(),
            fail: true,
            builds: AtomicUsize::new(0),
        }
    }

    pub fn build_count(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ImageBuilder for MockImageBuilder {
    async fn build_image(&self, _request: &BuildRequest) -> Result<String, BuildError> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(BuildError::Build("mock build failure".to_string()));
        }
        Ok(self.image.clone())
    }
}
