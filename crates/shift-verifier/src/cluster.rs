//! External collaborators: routing-config application, ingress resolution
//! and backend readiness.
//!
//! The orchestrator only sees the traits. [`KubectlCluster`] implements all
//! three by shelling out to `kubectl`; [`StaticIngress`] skips resolution when
//! the ingress address is already known.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use tokio::process::Command;
use tracing::{debug, info};

use crate::errors::ClusterError;
use crate::types::Endpoint;

/// A declarative routing change, applied as a whole.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingManifest {
    pub name: String,
    pub path: PathBuf,
}

impl RoutingManifest {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
        }
    }
}

impl fmt::Display for RoutingManifest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.path.display())
    }
}

/// Applies and removes routing configuration. Both operations are idempotent.
#[async_trait]
pub trait RoutingConfig: Send + Sync {
    async fn apply_routing_config(&self, manifest: &RoutingManifest) -> Result<(), ClusterError>;

    async fn delete_routing_config(&self, manifest: &RoutingManifest)
        -> Result<(), ClusterError>;
}

/// Locates the externally reachable address to probe.
#[async_trait]
pub trait IngressResolver: Send + Sync {
    async fn resolve_ingress(&self) -> Result<Endpoint, ClusterError>;
}

/// Reports whether every backend pod matching a label selector is Ready.
#[async_trait]
pub trait BackendReadiness: Send + Sync {
    async fn backends_ready(&self, selector: &str) -> Result<bool, ClusterError>;
}

/// Ingress already known (e.g. from `SHIFT_INGRESS_HOST`/`SHIFT_INGRESS_PORT`).
#[derive(Debug, Clone)]
pub struct StaticIngress(pub Endpoint);

#[async_trait]
impl IngressResolver for StaticIngress {
    async fn resolve_ingress(&self) -> Result<Endpoint, ClusterError> {
        Ok(self.0.clone())
    }
}

/// Which gateway service exposes the probed port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngressService {
    pub namespace: String,
    pub service: String,
    pub port_name: String,
}

impl Default for IngressService {
    fn default() -> Self {
        Self {
            namespace: "istio-system".to_string(),
            service: "istio-ingressgateway".to_string(),
            port_name: "tcp".to_string(),
        }
    }
}

/// `kubectl`-backed implementation of the cluster collaborators.
#[derive(Debug, Clone)]
pub struct KubectlCluster {
    namespace: String,
    kubeconfig: Option<PathBuf>,
    ingress: IngressService,
}

impl KubectlCluster {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            kubeconfig: None,
            ingress: IngressService::default(),
        }
    }

    #[must_use]
    pub fn with_kubeconfig(mut self, kubeconfig: Option<PathBuf>) -> Self {
        self.kubeconfig = kubeconfig;
        self
    }

    #[must_use]
    pub fn with_ingress(mut self, ingress: IngressService) -> Self {
        self.ingress = ingress;
        self
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Run kubectl and return stdout, mapping non-zero exits to errors.
    async fn kubectl(&self, args: &[&str]) -> Result<String, ClusterError> {
        let mut command = Command::new("kubectl");
        if let Some(kubeconfig) = &self.kubeconfig {
            command.arg("--kubeconfig").arg(kubeconfig);
        }
        command.args(args);

        let rendered = format!("kubectl {}", args.join(" "));
        debug!(target: "shift.cluster", command = %rendered, "Running kubectl");

        let output = command
            .output()
            .await
            .map_err(|source| ClusterError::Spawn {
                command: rendered.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(ClusterError::CommandFailed {
                command: rendered,
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn manifest_path(manifest: &RoutingManifest) -> String {
        manifest.path.to_string_lossy().into_owned()
    }
}

#[async_trait]
impl RoutingConfig for KubectlCluster {
    async fn apply_routing_config(&self, manifest: &RoutingManifest) -> Result<(), ClusterError> {
        let path = Self::manifest_path(manifest);
        self.kubectl(&["apply", "-n", &self.namespace, "-f", &path])
            .await?;
        info!(
            target: "shift.cluster",
            manifest = %manifest.name,
            namespace = %self.namespace,
            "Applied routing configuration"
        );
        Ok(())
    }

    async fn delete_routing_config(
        &self,
        manifest: &RoutingManifest,
    ) -> Result<(), ClusterError> {
        let path = Self::manifest_path(manifest);
        self.kubectl(&[
            "delete",
            "-n",
            &self.namespace,
            "-f",
            &path,
            "--ignore-not-found=true",
        ])
        .await?;
        info!(
            target: "shift.cluster",
            manifest = %manifest.name,
            namespace = %self.namespace,
            "Deleted routing configuration"
        );
        Ok(())
    }
}

#[async_trait]
impl IngressResolver for KubectlCluster {
    async fn resolve_ingress(&self) -> Result<Endpoint, ClusterError> {
        let command = format!(
            "kubectl get service {} -n {}",
            self.ingress.service, self.ingress.namespace
        );
        let json = self
            .kubectl(&[
                "get",
                "service",
                &self.ingress.service,
                "-n",
                &self.ingress.namespace,
                "-o",
                "json",
            ])
            .await?;
        parse_ingress(&json, &self.ingress.port_name).map_err(|message| {
            ClusterError::InvalidOutput { command, message }
        })
    }
}

#[async_trait]
impl BackendReadiness for KubectlCluster {
    async fn backends_ready(&self, selector: &str) -> Result<bool, ClusterError> {
        let json = self
            .kubectl(&["get", "pods", "-n", &self.namespace, "-l", selector, "-o", "json"])
            .await?;
        pods_ready(&json).map_err(|message| ClusterError::InvalidOutput {
            command: format!("kubectl get pods -l {selector}"),
            message,
        })
    }
}

#[derive(Debug, Deserialize)]
struct Service {
    spec: ServiceSpec,
    #[serde(default)]
    status: ServiceStatus,
}

#[derive(Debug, Deserialize)]
struct ServiceSpec {
    #[serde(default)]
    ports: Vec<ServicePort>,
}

#[derive(Debug, Deserialize)]
struct ServicePort {
    #[serde(default)]
    name: Option<String>,
    port: u16,
}

#[derive(Debug, Default, Deserialize)]
struct ServiceStatus {
    #[serde(default, rename = "loadBalancer")]
    load_balancer: LoadBalancerStatus,
}

#[derive(Debug, Default, Deserialize)]
struct LoadBalancerStatus {
    #[serde(default)]
    ingress: Vec<LoadBalancerIngress>,
}

#[derive(Debug, Deserialize)]
struct LoadBalancerIngress {
    ip: Option<String>,
    hostname: Option<String>,
}

/// Extract the load-balancer address and the named port from a
/// `kubectl get service -o json` document.
fn parse_ingress(json: &str, port_name: &str) -> Result<Endpoint, String> {
    let service: Service = serde_json::from_str(json).map_err(|e| e.to_string())?;

    let host = service
        .status
        .load_balancer
        .ingress
        .iter()
        .find_map(|ingress| ingress.ip.clone().or_else(|| ingress.hostname.clone()))
        .ok_or_else(|| "service has no load balancer ingress address".to_string())?;

    let port = service
        .spec
        .ports
        .iter()
        .find(|p| p.name.as_deref() == Some(port_name))
        .map(|p| p.port)
        .ok_or_else(|| format!("service has no port named {port_name}"))?;

    Ok(Endpoint::new(host, port))
}

#[derive(Debug, Deserialize)]
struct PodList {
    #[serde(default)]
    items: Vec<Pod>,
}

#[derive(Debug, Deserialize)]
struct Pod {
    #[serde(default)]
    status: PodStatus,
}

#[derive(Debug, Default, Deserialize)]
struct PodStatus {
    #[serde(default)]
    conditions: Vec<PodCondition>,
}

#[derive(Debug, Deserialize)]
struct PodCondition {
    #[serde(rename = "type")]
    kind: String,
    status: String,
}

/// True when the list is non-empty and every pod has `Ready=True`.
fn pods_ready(json: &str) -> Result<bool, String> {
    let pods: PodList = serde_json::from_str(json).map_err(|e| e.to_string())?;
    if pods.items.is_empty() {
        return Ok(false);
    }
    Ok(pods.items.iter().all(|pod| {
        pod.status
            .conditions
            .iter()
            .any(|c| c.kind == "Ready" && c.status == "True")
    }))
}
