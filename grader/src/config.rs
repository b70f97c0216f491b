use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Environment setting naming the runtime substrate. Read by
/// [`RuntimeKind::from_env`]; factories always take the parsed kind
/// explicitly.
pub const RUNTIME_ENV: &str = "GRADER_RUNTIME";

/// Environment setting naming the image builder implementation.
pub const BUILDER_ENV: &str = "GRADER_BUILDER";

/// Environment setting holding the image repository prefix used for
/// cluster image references.
pub const IMAGE_REPO_ENV: &str = "GRADER_IMAGE_REPO";

/// Which runtime substrate executes compute units.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub enum RuntimeKind {
    /// Local Docker daemon.
    #[default]
    Local,
    /// Kubernetes batch jobs.
    Kube,
    /// OpenShift batch jobs.
    Openshift,
}

impl RuntimeKind {
    /// Resolve the substrate from [`RUNTIME_ENV`], defaulting to `Local`
    /// when unset.
    pub fn from_env() -> Result<Self, UnknownKind> {
        match std::env::var(RUNTIME_ENV) {
            Ok(value) => value.parse(),
            Err(_) => Ok(Self::Local),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RuntimeKind::Local => "local",
            RuntimeKind::Kube => "kube",
            RuntimeKind::Openshift => "openshift",
        }
    }
}

impl FromStr for RuntimeKind {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" | "docker" => Ok(RuntimeKind::Local),
            "kube" | "kubernetes" => Ok(RuntimeKind::Kube),
            "openshift" => Ok(RuntimeKind::Openshift),
            other => Err(UnknownKind {
                setting: RUNTIME_ENV,
                value: other.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which builder implementation produces grading images.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub enum BuilderKind {
    /// Local Docker daemon build.
    #[default]
    Local,
}

impl BuilderKind {
    /// Resolve the builder from [`BUILDER_ENV`], defaulting to `Local`.
    pub fn from_env() -> Result<Self, UnknownKind> {
        match std::env::var(BUILDER_ENV) {
            Ok(value) => value.parse(),
            Err(_) => Ok(Self::Local),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BuilderKind::Local => "local",
        }
    }
}

impl FromStr for BuilderKind {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" | "docker" => Ok(BuilderKind::Local),
            other => Err(UnknownKind {
                setting: BUILDER_ENV,
                value: other.to_string(),
            }),
        }
    }
}

/// A selection setting named an implementation this build does not know.
#[derive(Debug, thiserror::Error)]
#[error("{setting} names unknown implementation {value:?}")]
pub struct UnknownKind {
    pub setting: &'static str,
    pub value: String,
}

/// Whether compute units get outbound network access.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub enum NetworkPolicy {
    /// Default: the unit keeps the substrate's normal networking.
    #[default]
    Enabled,
    /// Networking disabled ("none").
    Disabled,
}

/// Options for one orchestrator launch.
#[derive(Clone, Debug)]
pub struct LaunchOptions {
    /// Number of simultaneously active compute units (worker pool size).
    pub concurrency: usize,
    /// Per-unit wall-clock deadline; `None` disables the watchdog.
    pub timeout: Option<Duration>,
    /// Network policy applied to every unit.
    pub network: NetworkPolicy,
    /// Directory receiving generated notebook PDFs; `None` skips PDF
    /// staging entirely.
    pub pdf_dir: Option<PathBuf>,
    /// Keep compute units around after grading instead of deleting them.
    pub keep_units: bool,
}

impl LaunchOptions {
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency,
            timeout: None,
            network: NetworkPolicy::Enabled,
            pdf_dir: None,
            keep_units: false,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_network(mut self, network: NetworkPolicy) -> Self {
        self.network = network;
        self
    }

    pub fn with_pdf_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.pdf_dir = Some(dir.into());
        self
    }

    pub fn with_keep_units(mut self, keep: bool) -> Self {
        self.keep_units = keep;
        self
    }
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self::new(1)
    }
}

/// How a cluster job's init container gates the main container until
/// input staging has completed.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ReadinessGate {
    /// Init container sleeps a fixed number of seconds.
    FixedDelay { seconds: u64 },
    /// Init container loops until the orchestrator copies a marker file
    /// to `path` after staging.
    SentinelFile { path: String },
}

/// Bounded retry/backoff policy for control-plane calls.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts before giving up.
    pub attempts: u32,
    /// Delay before the first retry; doubles per attempt.
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay_ms: 500,
        }
    }
}

/// Tunables for the declarative job description submitted by the cluster
/// backends. The scheduler side of this contract drifted across
/// deployments, so every field is configuration rather than a constant.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClusterJobConfig {
    /// Namespace to submit jobs into; discovered from the environment
    /// when unset.
    pub namespace: Option<String>,
    /// Repository prefix prepended to image references
    /// (e.g. `registry.example.org/grading`).
    pub image_repo: Option<String>,
    /// Interval between terminal-condition polls.
    pub poll_interval: Duration,
    /// `activeDeadlineSeconds` on the submitted job.
    pub active_deadline_secs: u64,
    /// `backoffLimit` on the submitted job.
    pub backoff_limit: u32,
    /// CPU request/limit for both containers.
    pub cpu: String,
    /// Memory request/limit for both containers.
    pub memory: String,
    /// Ephemeral-storage request/limit for both containers.
    pub ephemeral_storage: String,
    /// `sizeLimit` of the shared submission volume.
    pub volume_size_limit: String,
    /// How the init container gates the main container on staging.
    /// `None` lets each variant pick its conventional gate.
    pub readiness: Option<ReadinessGate>,
    /// Lines of log tail fetched from remote units.
    pub log_tail_lines: u32,
    /// Retry/backoff policy for control-plane calls.
    pub retry: RetryConfig,
}

impl ClusterJobConfig {
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn with_image_repo(mut self, repo: impl Into<String>) -> Self {
        self.image_repo = Some(repo.into());
        self
    }

    pub fn with_readiness(mut self, readiness: ReadinessGate) -> Self {
        self.readiness = Some(readiness);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Image repository prefix, falling back to [`IMAGE_REPO_ENV`].
    pub fn image_repo(&self) -> Option<String> {
        self.image_repo
            .clone()
            .or_else(|| std::env::var(IMAGE_REPO_ENV).ok())
    }
}

impl Default for ClusterJobConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            image_repo: None,
            poll_interval: Duration::from_secs(5),
            active_deadline_secs: 3600,
            backoff_limit: 1,
            cpu: "1".to_string(),
            memory: "1G".to_string(),
            ephemeral_storage: "1G".to_string(),
            volume_size_limit: "100Mi".to_string(),
            readiness: None,
            log_tail_lines: 100,
            retry: RetryConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_kind_parses_aliases() {
        assert_eq!("docker".parse::<RuntimeKind>().unwrap(), RuntimeKind::Local);
        assert_eq!(
            "Kubernetes".parse::<RuntimeKind>().unwrap(),
            RuntimeKind::Kube
        );
        assert_eq!(
            "openshift".parse::<RuntimeKind>().unwrap(),
            RuntimeKind::Openshift
        );
        assert!("slurm".parse::<RuntimeKind>().is_err());
    }

    #[test]
    fn launch_options_builder() {
        let opts = LaunchOptions::new(4)
            .with_timeout(Duration::from_secs(30))
            .with_network(NetworkPolicy::Disabled)
            .with_keep_units(true);
        assert_eq!(opts.concurrency, 4);
        assert_eq!(opts.timeout, Some(Duration::from_secs(30)));
        assert_eq!(opts.network, NetworkPolicy::Disabled);
        assert!(opts.keep_units);
        assert!(opts.pdf_dir.is_none());
    }
}
