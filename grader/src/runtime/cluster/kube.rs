//! Kubernetes job backend.
//!
//! Runs in-cluster: the namespace comes from the mounted service-account
//! files and file copies go through `kubectl cp`. The readiness gate
//! defaults to a fixed staging delay.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::OnceCell;

use crate::config::{ClusterJobConfig, ReadinessGate};
use crate::error::RuntimeError;
use crate::runtime::cluster::{ClusterApi, ClusterUnit, ClusterVariant, SERVICEACCOUNT_DIR};
use crate::runtime::{RuntimeBackend, RuntimeFactory, RuntimeSpec, UnitExit, UnitState};

fn default_gate() -> ReadinessGate {
    ReadinessGate::FixedDelay { seconds: 20 }
}

const VARIANT: ClusterVariant = ClusterVariant {
    name: "kube",
    copy_tool: "kubectl",
    default_readiness: default_gate,
};

/// Allocates [`KubeBackend`] units. The control-plane client is built on
/// first use and shared by every unit of the run.
pub struct KubeRuntimeFactory {
    config: ClusterJobConfig,
    api: OnceCell<Arc<ClusterApi>>,
}

impl KubeRuntimeFactory {
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
                    None => current_namespace().await?,
                };
                ClusterApi::in_cluster(namespace).await.map(Arc::new)
            })
            .await?;
        Ok(Arc::clone(api))
    }
}

#[async_trait]
impl RuntimeFactory for KubeRuntimeFactory {
    async fn create(&self, spec: RuntimeSpec) -> Result<Box<dyn RuntimeBackend>, RuntimeError> {
        let api = self.api().await?;
        let unit = ClusterUnit::submit(api, self.config.clone(), VARIANT, spec).await?;
        Ok(Box::new(KubeBackend { unit }))
    }
}

/// Namespace of the pod this process runs in.
async fn current_namespace() -> Result<String, RuntimeError> {
    let raw = tokio::fs::read_to_string(format!("{SERVICEACCOUNT_DIR}/namespace"))
        .await
        .map_err(|err| {
            RuntimeError::Environment(format!("service account namespace unreadable: {err}"))
        })?;
    Ok(raw.trim().to_string())
}

/// One Kubernetes job driven through the shared [`ClusterUnit`] lifecycle.
pub struct KubeBackend {
    unit: ClusterUnit,
}

#[async_trait]
impl RuntimeBackend for KubeBackend {
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
