//! Shared plumbing for the cluster job backends.
//!
//! Both variants submit a declarative `batch/v1` Job and then poll: first
//! for the scheduler-assigned pod name (the scheduler offers no push
//! notification), then for the job's terminal condition. File staging in
//! and out of the pod goes through the variant's copy tool (`kubectl cp`
//! or `oc cp`), since the control plane has no file-transfer primitive.

pub mod kube;
pub mod openshift;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::config::{ClusterJobConfig, ReadinessGate, RetryConfig};
use crate::error::RuntimeError;
use crate::runtime::{
    RuntimeSpec, UnitExit, UnitLifecycle, UnitState, VolumeBinding, UNIT_SUBMISSION_DIR,
};

/// Mounted service-account credentials inside a cluster pod.
const SERVICEACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

/// Name of the grading container in the job template.
const MAIN_CONTAINER: &str = "grading";

/// Name of the init container gating start on staged input.
const INIT_CONTAINER: &str = "init-filewait";

/// Tagged constants distinguishing the two scheduler variants.
#[derive(Clone, Copy, Debug)]
pub struct ClusterVariant {
    pub name: &'static str,
    /// CLI used for pod file copies.
    pub copy_tool: &'static str,
    /// Gate applied when the config leaves readiness unset.
    pub default_readiness: fn() -> ReadinessGate,
}

/// Retry `call` with doubling delays until it succeeds or the attempt
/// budget is spent.
pub async fn with_backoff<T, F, Fut>(
    op: &'static str,
    retry: RetryConfig,
    mut call: F,
) -> Result<T, RuntimeError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RuntimeError>>,
{
    let mut delay = Duration::from_millis(retry.base_delay_ms);
    let mut last = String::new();
    for attempt in 1..=retry.attempts.max(1) {
        match call().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                warn!(op, attempt, error = %err, "control plane call failed");
                last = err.to_string();
            }
        }
        if attempt < retry.attempts {
            tokio::time::sleep(delay).await;
            delay *= 2;
        }
    }
    Err(RuntimeError::RetriesExhausted {
        op,
        attempts: retry.attempts.max(1),
        last,
    })
}

/// Minimal JSON client for the scheduler's REST API.
///
/// `reqwest::Client` pools connections and is safe for concurrent use, so
/// one instance is shared across all units of a run.
#[derive(Clone, Debug)]
pub struct ClusterApi {
    client: reqwest::Client,
    base_url: String,
    token: String,
    namespace: String,
}

impl ClusterApi {
    /// Authenticate with the in-cluster service account.
    pub async fn in_cluster(namespace: String) -> Result<Self, RuntimeError> {
        let host = std::env::var("KUBERNETES_SERVICE_HOST").map_err(|_| {
            RuntimeError::Environment("KUBERNETES_SERVICE_HOST is not set".to_string())
        })?;
        let port = std::env::var("KUBERNETES_SERVICE_PORT_HTTPS")
            .unwrap_or_else(|_| "443".to_string());
        let token = tokio::fs::read_to_string(format!("{SERVICEACCOUNT_DIR}/token"))
            .await
            .map_err(|err| {
                RuntimeError::Environment(format!("service account token unreadable: {err}"))
            })?
            .trim()
            .to_string();

        let mut builder = reqwest::Client::builder();
        if let Ok(ca) = tokio::fs::read(format!("{SERVICEACCOUNT_DIR}/ca.crt")).await {
            builder = builder.add_root_certificate(reqwest::Certificate::from_pem(&ca)?);
        }

        Ok(Self {
            client: builder.build()?,
            base_url: format!("https://{host}:{port}"),
            token,
            namespace,
        })
    }

    /// Client against an explicit API endpoint (out-of-cluster use).
    pub fn new(base_url: String, token: String, namespace: String) -> Result<Self, RuntimeError> {
        Ok(Self {
            client: reqwest::Client::builder().build()?,
            base_url,
            token,
            namespace,
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn jobs_url(&self) -> String {
        format!(
            "{}/apis/batch/v1/namespaces/{}/jobs",
            self.base_url, self.namespace
        )
    }

    pub async fn create_job(&self, manifest: &Value) -> Result<Value, RuntimeError> {
        let response = self
            .client
            .post(self.jobs_url())
            .bearer_auth(&self.token)
            .json(manifest)
            .send()
            .await?;
        Self::json_or_status("create_job", response).await
    }

    pub async fn get_job(&self, name: &str) -> Result<Value, RuntimeError> {
        let response = self
            .client
            .get(format!("{}/{}", self.jobs_url(), name))
            .bearer_auth(&self.token)
            .send()
            .await?;
        Self::json_or_status("get_job", response).await
    }

    /// Delete the job and its pods. A missing job is not an error; kill
    /// and finalize race against natural completion.
    pub async fn delete_job(&self, name: &str) -> Result<(), RuntimeError> {
        let response = self
            .client
            .delete(format!("{}/{}", self.jobs_url(), name))
            .bearer_auth(&self.token)
            .json(&json!({ "propagationPolicy": "Background" }))
            .send()
            .await?;
        if response.status().as_u16() == 404 || response.status().is_success() {
            return Ok(());
        }
        Err(RuntimeError::ApiStatus {
            op: "delete_job",
            status: response.status().as_u16(),
            body: response.text().await.unwrap_or_default(),
        })
    }

    /// Name of the pod the scheduler assigned to `job_name`, once one
    /// exists.
    pub async fn pod_for_job(&self, job_name: &str) -> Result<Option<String>, RuntimeError> {
        let url = format!(
            "{}/api/v1/namespaces/{}/pods",
            self.base_url, self.namespace
        );
        let response = self
            .client
            .get(url)
            .bearer_auth(&self.token)
            .query(&[("labelSelector", format!("job-name={job_name}"))])
            .send()
            .await?;
        let pods = Self::json_or_status("list_pods", response).await?;
        Ok(pods["items"]
            .as_array()
            .and_then(|items| items.first())
            .and_then(|pod| pod["metadata"]["name"].as_str())
            .map(str::to_string))
    }

    /// Tail-bounded log text from the pod's main container.
    pub async fn pod_log(&self, pod: &str, tail_lines: u32) -> Result<String, RuntimeError> {
        let url = format!(
            "{}/api/v1/namespaces/{}/pods/{}/log",
            self.base_url, self.namespace, pod
        );
        let response = self
            .client
            .get(url)
            .bearer_auth(&self.token)
            .query(&[
                ("container", MAIN_CONTAINER.to_string()),
                ("tailLines", tail_lines.to_string()),
            ])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(RuntimeError::ApiStatus {
                op: "pod_log",
                status: response.status().as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        Ok(response.text().await?)
    }

    async fn json_or_status(
        op: &'static str,
        response: reqwest::Response,
    ) -> Result<Value, RuntimeError> {
        if !response.status().is_success() {
            return Err(RuntimeError::ApiStatus {
                op,
                status: response.status().as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        Ok(response.json().await?)
    }
}

/// HTTP(S) proxy settings passed through into compute units.
fn proxy_env() -> Vec<Value> {
    let mut env = Vec::new();
    for key in ["HTTP_PROXY", "HTTPS_PROXY"] {
        if let Ok(value) = std::env::var(key) {
            env.push(json!({ "name": key.to_lowercase(), "value": value }));
            env.push(json!({ "name": key, "value": value }));
        }
    }
    env
}

fn gate_command(gate: &ReadinessGate) -> String {
    match gate {
        ReadinessGate::FixedDelay { seconds } => {
            format!("echo \"waiting {seconds}s for staging\"; sleep {seconds}")
        }
        ReadinessGate::SentinelFile { path } => format!(
            "until [ -f {path} ]; do echo \"waiting for staging marker\"; sleep 2; done"
        ),
    }
}

/// Declarative job description for one compute unit.
pub fn job_manifest(
    spec: &RuntimeSpec,
    image_ref: &str,
    config: &ClusterJobConfig,
    gate: &ReadinessGate,
) -> Value {
    let env = Value::Array(proxy_env());
    let resources = json!({
        "limits": {
            "cpu": config.cpu,
            "memory": config.memory,
            "ephemeral-storage": config.ephemeral_storage,
        },
        "requests": {
            "cpu": config.cpu,
            "memory": config.memory,
            "ephemeral-storage": config.ephemeral_storage,
        },
    });
    let volume_mounts = json!([{
        "mountPath": UNIT_SUBMISSION_DIR,
        "name": "submission-volume",
    }]);

    json!({
        "apiVersion": "batch/v1",
        "kind": "Job",
        "metadata": {
            "generateName": "grading-unit-",
            "labels": { "app": "grader" },
        },
        "spec": {
            "activeDeadlineSeconds": config.active_deadline_secs,
            "backoffLimit": config.backoff_limit,
            "template": {
                "spec": {
                    "containers": [{
                        "name": MAIN_CONTAINER,
                        "image": image_ref,
                        "command": spec.command.clone(),
                        "env": env.clone(),
                        "volumeMounts": volume_mounts.clone(),
                        "resources": resources.clone(),
                    }],
                    "initContainers": [{
                        "name": INIT_CONTAINER,
                        "image": "busybox:latest",
                        "command": ["sh", "-c", gate_command(gate)],
                        "env": env,
                        "volumeMounts": volume_mounts,
                        "resources": resources,
                    }],
                    "volumes": [{
                        "name": "submission-volume",
                        "emptyDir": { "sizeLimit": config.volume_size_limit },
                    }],
                    "restartPolicy": "Never",
                }
            }
        }
    })
}

/// Image reference with the configured repository prefix applied.
pub fn compose_image_ref(config: &ClusterJobConfig, image: &str) -> String {
    match config.image_repo() {
        Some(repo) => format!("{}/{}", repo.trim_end_matches('/'), image),
        None => image.to_string(),
    }
}

async fn run_copy_tool(tool: &'static str, args: &[String]) -> Result<(), RuntimeError> {
    debug!(tool, ?args, "pod copy");
    let output = tokio::process::Command::new(tool)
        .args(args)
        .output()
        .await?;
    if !output.status.success() {
        return Err(RuntimeError::CopyTool {
            tool,
            status: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    Ok(())
}

/// One cluster job's lifecycle, shared by both variants.
pub struct ClusterUnit {
    api: Arc<ClusterApi>,
    config: ClusterJobConfig,
    variant: ClusterVariant,
    spec: RuntimeSpec,
    job_name: String,
    pod_name: String,
    lifecycle: UnitLifecycle,
}

impl ClusterUnit {
    /// Submit the job, discover its pod, and stage the bound inputs.
    pub async fn submit(
        api: Arc<ClusterApi>,
        config: ClusterJobConfig,
        variant: ClusterVariant,
        spec: RuntimeSpec,
    ) -> Result<Self, RuntimeError> {
        let gate = config
            .readiness
            .clone()
            .unwrap_or_else(variant.default_readiness);
        let image_ref = compose_image_ref(&config, &spec.image);
        let manifest = job_manifest(&spec, &image_ref, &config, &gate);

        let created =
            with_backoff("create_job", config.retry, || api.create_job(&manifest)).await?;
        let job_name = created["metadata"]["name"]
            .as_str()
            .ok_or_else(|| RuntimeError::ApiStatus {
                op: "create_job",
                status: 200,
                body: "created job carries no metadata.name".to_string(),
            })?
            .to_string();

        // Identifier discovery polls until the scheduler assigns a pod;
        // transient list errors just delay the next attempt.
        let pod_name = loop {
            match api.pod_for_job(&job_name).await {
                Ok(Some(pod)) => break pod,
                Ok(None) => {}
                Err(err) => warn!(job = %job_name, error = %err, "pod lookup failed"),
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        };
        info!(scheduler = variant.name, job = %job_name, pod = %pod_name, "cluster job submitted");

        let lifecycle = UnitLifecycle::new(pod_name.clone());
        let unit = Self {
            api,
            config,
            variant,
            spec,
            job_name,
            pod_name,
            lifecycle,
        };

        unit.stage_inputs(&gate).await?;
        Ok(unit)
    }

    /// Copy bound inputs into the init container's shared volume, then
    /// release the gate when it waits on a sentinel.
    async fn stage_inputs(&self, gate: &ReadinessGate) -> Result<(), RuntimeError> {
        for bind in &self.spec.binds {
            if bind.remote.starts_with(UNIT_SUBMISSION_DIR) {
                self.copy_in(bind).await?;
            }
        }
        if let ReadinessGate::SentinelFile { path } = gate {
            let marker = tempfile::NamedTempFile::new()?;
            self.copy_local_in(marker.path(), path).await?;
        }
        Ok(())
    }

    async fn copy_in(&self, bind: &VolumeBinding) -> Result<(), RuntimeError> {
        self.copy_local_in(&bind.local, &bind.remote).await
    }

    async fn copy_local_in(
        &self,
        local: &std::path::Path,
        remote: &str,
    ) -> Result<(), RuntimeError> {
        let args = vec![
            "cp".to_string(),
            local.to_string_lossy().into_owned(),
            format!(
                "{}/{}:{}",
                self.api.namespace(),
                self.pod_name,
                remote
            ),
            "-c".to_string(),
            INIT_CONTAINER.to_string(),
        ];
        run_copy_tool(self.variant.copy_tool, &args).await
    }

    async fn copy_out(&self, bind: &VolumeBinding) -> Result<(), RuntimeError> {
        let args = vec![
            "cp".to_string(),
            format!(
                "{}/{}:{}",
                self.api.namespace(),
                self.pod_name,
                bind.remote
            ),
            bind.local.to_string_lossy().into_owned(),
            "-c".to_string(),
            MAIN_CONTAINER.to_string(),
        ];
        run_copy_tool(self.variant.copy_tool, &args).await
    }

    pub fn lifecycle(&self) -> &UnitLifecycle {
        &self.lifecycle
    }

    pub fn state(&self) -> UnitState {
        self.lifecycle.state()
    }

    pub fn unit_id(&self) -> &str {
        self.lifecycle.unit_id()
    }

    pub fn start(&self) -> Result<(), RuntimeError> {
        // Submission already scheduled the job; the explicit transition
        // just arms the state machine.
        self.lifecycle.mark_running()
    }

    /// Sleep-poll the job's terminal condition.
    pub async fn wait(&self) -> Result<UnitExit, RuntimeError> {
        loop {
            if let Some(exit) = self.lifecycle.recorded_exit() {
                return Ok(exit);
            }
            let job = match with_backoff("get_job", self.config.retry, || {
                self.api.get_job(&self.job_name)
            })
            .await
            {
                Ok(job) => job,
                Err(err) => {
                    // A concurrent kill deletes the job out from under
                    // the poll; its recorded exit wins.
                    if let Some(exit) = self.lifecycle.recorded_exit() {
                        return Ok(exit);
                    }
                    return Err(err);
                }
            };

            if job_condition(&job, "Failed") {
                return Ok(self.lifecycle.mark_exited(UnitExit { code: 1 }));
            }
            if job_condition(&job, "Complete") {
                return Ok(self.lifecycle.mark_exited(UnitExit::SUCCESS));
            }
            debug!(job = %self.job_name, "job still running");
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    /// Force-terminate by deleting the job. No-op when already terminal.
    pub async fn kill(&self) -> Result<(), RuntimeError> {
        if !self.lifecycle.mark_killed() {
            return Ok(());
        }
        with_backoff("delete_job", self.config.retry, || {
            self.api.delete_job(&self.job_name)
        })
        .await
    }

    pub async fn logs(&self) -> Result<String, RuntimeError> {
        with_backoff("pod_log", self.config.retry, || {
            self.api.pod_log(&self.pod_name, self.config.log_tail_lines)
        })
        .await
    }

    /// Copy bound outputs back to staging, then delete the job unless
    /// the unit is kept.
    pub async fn finalize(&self) -> Result<(), RuntimeError> {
        self.lifecycle.mark_finalized()?;

        // Killed units have nothing to copy; their pod is already gone.
        if self.lifecycle.recorded_exit() != Some(UnitExit::KILLED) {
            for bind in &self.spec.binds {
                self.copy_out(bind).await?;
            }
        }

        if self.spec.keep_unit {
            debug!(job = %self.job_name, "keeping job per request");
            return Ok(());
        }
        with_backoff("delete_job", self.config.retry, || {
            self.api.delete_job(&self.job_name)
        })
        .await
    }
}

fn job_condition(job: &Value, kind: &str) -> bool {
    job["status"]["conditions"]
        .as_array()
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c["type"] == kind && c["status"] == "True")
        })
        .unwrap_or(false)
}
