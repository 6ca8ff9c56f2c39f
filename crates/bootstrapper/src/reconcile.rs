//! Applying manifests through the host's kubectl and post-init cluster
//! adjustments.

use std::time::Duration;

use anyhow::Context;
use command_runner::{Cmd, Runner};
use k8s_openapi::api::rbac::v1::{ClusterRoleBinding, RoleRef, Subject};
use kube::api::{ObjectMeta, PostParams};
use kube::error::ErrorResponse;
use kube::{Api, Client};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::constants::{binary_path, guest_kubeconfig, GUEST_ADDONS_DIR};
use crate::error::RetriableError;

/// How long a single `kubectl apply` may take.
pub const KUBECTL_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a single API server call may take before it counts as a
/// transient failure.
pub const API_TIMEOUT: Duration = Duration::from_secs(10);

/// The binding that makes `kube-system:default` a cluster admin.
pub const RBAC_NAME: &str = "minikube-rbac";

/// Selects the addon objects the reconciler owns.
pub const ADDON_SELECTOR: &str =
    "kubernetes.io/cluster-service!=true,addonmanager.kubernetes.io/mode=Reconcile";

/// Kinds the reconciler may prune.
pub const PRUNE_WHITELIST: [&str; 14] = [
    "core/v1/ConfigMap",
    "core/v1/Endpoints",
    "core/v1/Namespace",
    "core/v1/PersistentVolumeClaim",
    "core/v1/PersistentVolume",
    "core/v1/Pod",
    "core/v1/ReplicationController",
    "core/v1/Secret",
    "core/v1/Service",
    "batch/v1/Job",
    "apps/v1/DaemonSet",
    "apps/v1/Deployment",
    "apps/v1/ReplicaSet",
    "apps/v1/StatefulSet",
];

/// `sudo <binRoot>/kubectl --kubeconfig=<kubeconfig> <args>`.
pub fn kubectl_cmd<I, S>(kubernetes_version: &str, args: I) -> Cmd
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    Cmd::new("sudo")
        .arg(binary_path(kubernetes_version, "kubectl"))
        .arg(format!("--kubeconfig={}", guest_kubeconfig()))
        .args(args)
}

/// Applies the manifest at `path` on the host.
#[instrument(level = "info", skip(runner))]
pub async fn apply_manifest(
    runner: &dyn Runner,
    kubernetes_version: &str,
    path: &str,
) -> anyhow::Result<()> {
    let cmd = kubectl_cmd(kubernetes_version, ["apply", "-f", path]).timeout(KUBECTL_TIMEOUT);
    runner
        .run_cmd(cmd)
        .await
        .with_context(|| format!("applying {}", path))?;
    Ok(())
}

/// Deletes whatever the manifest at `path` created.
#[instrument(level = "info", skip(runner))]
pub async fn delete_manifest(
    runner: &dyn Runner,
    kubernetes_version: &str,
    path: &str,
) -> anyhow::Result<()> {
    let cmd = kubectl_cmd(
        kubernetes_version,
        ["delete", "--ignore-not-found", "-f", path],
    )
    .timeout(KUBECTL_TIMEOUT);
    runner
        .run_cmd(cmd)
        .await
        .with_context(|| format!("deleting {}", path))?;
    Ok(())
}

/// The command that brings the cluster's addons in line with the addons
/// directory, pruning objects whose manifests were removed.
pub fn reconcile_addons_cmd(kubernetes_version: &str) -> Cmd {
    let mut args = vec![
        "apply".to_string(),
        "-f".to_string(),
        GUEST_ADDONS_DIR.to_string(),
        "-l".to_string(),
        ADDON_SELECTOR.to_string(),
        "--prune=true".to_string(),
    ];
    args.extend(PRUNE_WHITELIST.iter().map(|gvk| format!("--prune-whitelist={}", gvk)));
    args.push("--recursive".to_string());
    kubectl_cmd(kubernetes_version, args).timeout(KUBECTL_TIMEOUT)
}

/// Runs one addon reconcile pass.
pub async fn reconcile_addons(runner: &dyn Runner, kubernetes_version: &str) -> anyhow::Result<()> {
    runner
        .run_cmd(reconcile_addons_cmd(kubernetes_version))
        .await
        .context("reconciling addons")?;
    Ok(())
}

/// Reconciles addons every `interval` until `cancel` fires. Failed passes are
/// logged and retried on the next tick.
pub async fn run_addon_reconciler(
    runner: &dyn Runner,
    kubernetes_version: &str,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("addon reconciler stopped");
                return;
            }
            _ = ticker.tick() => {
                if let Err(e) = reconcile_addons(runner, kubernetes_version).await {
                    warn!(error = %e, "addon reconcile failed");
                }
            }
        }
    }
}

fn rbac_binding() -> ClusterRoleBinding {
    ClusterRoleBinding {
        metadata: ObjectMeta {
            name: Some(RBAC_NAME.to_string()),
            ..Default::default()
        },
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "ClusterRole".to_string(),
            name: "cluster-admin".to_string(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: "default".to_string(),
            namespace: Some("kube-system".to_string()),
            api_group: None,
        }]),
    }
}

fn is_timeout(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            if io.kind() == std::io::ErrorKind::TimedOut {
                return true;
            }
        }
        if e.to_string().contains("timed out") {
            return true;
        }
        current = e.source();
    }
    false
}

/// Makes `kube-system:default` a cluster admin through the API server.
/// Timeouts are reported as [`RetriableError`].
#[instrument(level = "info", skip(client))]
pub async fn elevate_kube_system_privileges(client: &Client) -> anyhow::Result<()> {
    let bindings: Api<ClusterRoleBinding> = Api::all(client.clone());

    let existing = tokio::time::timeout(API_TIMEOUT, bindings.get(RBAC_NAME)).await;
    match existing {
        Err(elapsed) => return Err(RetriableError(elapsed.into()).into()),
        Ok(Ok(_)) => {
            debug!(name = RBAC_NAME, "cluster role binding already exists");
            return Ok(());
        }
        Ok(Err(kube::Error::Api(ErrorResponse { code: 404, .. }))) => (),
        Ok(Err(e)) if is_timeout(&e) => return Err(RetriableError(e.into()).into()),
        Ok(Err(e)) => return Err(e).context("looking up cluster role binding"),
    }

    let created = tokio::time::timeout(
        API_TIMEOUT,
        bindings.create(&PostParams::default(), &rbac_binding()),
    )
    .await;
    match created {
        Err(elapsed) => Err(RetriableError(elapsed.into()).into()),
        Ok(Ok(_)) | Ok(Err(kube::Error::Api(ErrorResponse { code: 409, .. }))) => {
            info!(name = RBAC_NAME, "kube-system:default elevated to cluster-admin");
            Ok(())
        }
        Ok(Err(e)) if is_timeout(&e) => Err(RetriableError(e.into()).into()),
        Ok(Err(e)) => Err(e).context("creating cluster role binding"),
    }
}

/// The same elevation done with the host's kubectl, for when the API server
/// is not reachable from here.
#[instrument(level = "info", skip(runner))]
pub async fn elevate_with_kubectl(runner: &dyn Runner, kubernetes_version: &str) -> anyhow::Result<()> {
    let get = kubectl_cmd(kubernetes_version, ["get", "clusterrolebinding", RBAC_NAME]);
    if runner.run_cmd(get).await.is_ok() {
        debug!(name = RBAC_NAME, "cluster role binding already exists");
        return Ok(());
    }
    let create = kubectl_cmd(
        kubernetes_version,
        [
            "create",
            "clusterrolebinding",
            RBAC_NAME,
            "--clusterrole=cluster-admin",
            "--serviceaccount=kube-system:default",
        ],
    )
    .timeout(KUBECTL_TIMEOUT);
    match runner.run_cmd(create).await {
        Ok(_) => Ok(()),
        Err(e)
            if e
                .result()
                .map(|r| r.stderr_str().contains("AlreadyExists"))
                .unwrap_or(false) =>
        {
            Ok(())
        }
        Err(command_runner::RunError::TimedOut { command, timeout }) => Err(RetriableError(
            anyhow::anyhow!("{} timed out after {:?}", command, timeout),
        )
        .into()),
        Err(e) => Err(e).context("creating cluster role binding"),
    }
}

/// Lowers the API server's OOM score adjustment to -10 so the kernel kills
/// workloads before it.
#[instrument(level = "debug", skip(runner))]
pub async fn adjust_resource_limits(runner: &dyn Runner) -> anyhow::Result<()> {
    let res = runner
        .run_cmd(Cmd::shell("cat /proc/$(pgrep kube-apiserver)/oom_adj"))
        .await
        .context("reading kube-apiserver oom_adj")?;
    let current: i32 = res
        .stdout_str()
        .trim()
        .parse()
        .with_context(|| format!("parsing oom_adj {:?}", res.stdout_str()))?;
    debug!(current, "kube-apiserver oom_adj");
    if current < 0 {
        return Ok(());
    }
    runner
        .run_cmd(Cmd::shell(
            "echo -10 | sudo tee /proc/$(pgrep kube-apiserver)/oom_adj",
        ))
        .await
        .context("lowering kube-apiserver oom_adj")?;
    info!("kube-apiserver oom_adj set to -10");
    Ok(())
}
