//! OpenShift job backend.
//!
//! Same declarative job contract as the Kubernetes variant with the
//! platform's conventions: file copies through `oc cp`, namespace
//! discovery via `oc project -q` (falling back to the service-account
//! file), and a sentinel-file readiness gate released by copying a
//! marker into the init container once staging is done.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::OnceCell;
use tracing::debug;

use crate::config::{ClusterJobConfig, ReadinessGate};
use crate::error::RuntimeError;
use crate::runtime::cluster::{ClusterApi, ClusterUnit, ClusterVariant, SERVICEACCOUNT_DIR};
use crate::runtime::{RuntimeBackend, RuntimeFactory, RuntimeSpec, UnitExit, UnitState};

/// Marker the init container waits on before handing over to grading.
pub const READY_SENTINEL: &str = "/tmp/.grader_ready";

fn default_gate() -> ReadinessGate {
    ReadinessGate::SentinelFile {
        path: READY_SENTINEL.to_string(),
    }
}

const VARIANT: ClusterVariant = ClusterVariant {
    name: "openshift",
    copy_tool: "oc",
    default_readiness: default_gate,
};

/// Allocates [`OpenshiftBackend`] units, sharing one control-plane client.
pub struct OpenshiftRuntimeFactory {
    config: ClusterJobConfig,
    api: OnceCell<Arc<ClusterApi>>,
}

impl OpenshiftRuntimeFactory {
    pub fn new(config: ClusterJobConfig) -> Self {
        Self {
            config,
            api: OnceCell::new(),
        }
    }

    async fn api(&self) -> Result<Arc<ClusterApi>, RuntimeError> {
        let api = self
            .api
            .get_or_try_init(|| async {
                let namespace = match &self.config.namespace {
                    Some(namespace) => namespace.clone(),
                    None => current_project().await?,
                };
                ClusterApi::in_cluster(namespace).await.map(Arc::new)
            })
            .await?;
        Ok(Arc::clone(api))
    }
}

#[async_trait]
impl RuntimeFactory for OpenshiftRuntimeFactory {
    async fn create(&self, spec: RuntimeSpec) -> Result<Box<dyn RuntimeBackend>, RuntimeError> {
        let api = self.api().await?;
        let unit = ClusterUnit::submit(api, self.config.clone(), VARIANT, spec).await?;
        Ok(Box::new(OpenshiftBackend { unit }))
    }
}

/// Current project per the `oc` client, falling back to the mounted
/// service-account namespace.
async fn current_project() -> Result<String, RuntimeError> {
    let output = tokio::process::Command::new("oc")
        .args(["project", "-q"])
        .output()
        .await;
    if let Ok(output) = output {
        if output.status.success() {
            let project = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if !project.is_empty() {
                return Ok(project);
            }
        }
        debug!("oc project lookup failed, trying service account namespace");
    }
    let raw = tokio::fs::read_to_string(format!("{SERVICEACCOUNT_DIR}/namespace"))
        .await
        .map_err(|err| {
            RuntimeError::Environment(format!("project discovery failed: {err}"))
        })?;
    Ok(raw.trim().to_string())
}

/// One OpenShift job driven through the shared [`ClusterUnit`] lifecycle.
pub struct OpenshiftBackend {
    unit: ClusterUnit,
}

#[async_trait]
impl RuntimeBackend for OpenshiftBackend {
    async fn start(&self) -> Result<(), RuntimeError> {
        self.unit.start()
    }

    async fn wait(&self) -> Result<UnitExit, RuntimeError> {
        self.unit.wait().await
    }

    async fn kill(&self) -> Result<(), RuntimeError> {
        self.unit.kill().await
    }

    fn unit_id(&self) -> &str {
        self.unit.unit_id()
    }

    fn state(&self) -> UnitState {
        self.unit.state()
    }

    async fn logs(&self) -> Result<String, RuntimeError> {
        self.unit.logs().await
    }

    async fn finalize(&self) -> Result<(), RuntimeError> {
        self.unit.finalize().await
    }
}
