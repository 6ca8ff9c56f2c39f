//! Brings a cluster to its desired state.
//!
//! A [`Bootstrapper`] drives one host through its [`Runner`]. Each call to
//! [`Bootstrapper::reconcile`] runs the whole sequence from runtime selection
//! to addon apply; nothing is cached between calls, so an interrupted
//! reconcile is simply run again.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use command_runner::backoff::{BackoffStrategy, ExponentialBackoffStrategy};
use command_runner::{Asset, InitSystem, RunError, Runner};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::addons::apply_addons;
use crate::binaries::{host_arch, transfer_binaries, BinaryCache};
use crate::cni::Cni;
use crate::config::ClusterConfig;
use crate::constants::{kubeadm_yaml_path, split_guest_path};
use crate::cruntime::{Runtime, RuntimeConfig};
use crate::driver::is_kic;
use crate::error::{is_retriable, BootstrapError};
use crate::kubeadm::{cri_socket_uri, init_cmd, reset_cmd, KubeadmParams};
use crate::kubelet::{kubelet_flags, render_units, restart_kubelet, stop_kubelet, write_units};
use crate::nodes::NodeCache;
use crate::reconcile::{
    adjust_resource_limits, elevate_kube_system_privileges, elevate_with_kubectl, run_addon_reconciler,
};
use crate::versions::parse_version;

/// How long RBAC elevation keeps retrying API server timeouts.
const ELEVATE_BUDGET: Duration = Duration::from_secs(120);

/// Provisions a single-node cluster on one host.
pub struct Bootstrapper {
    runner: Arc<dyn Runner>,
    cache: Arc<dyn BinaryCache>,
    client: Option<kube::Client>,
    nodes: NodeCache,
    cancel: CancellationToken,
    arch: String,
}

impl Bootstrapper {
    /// Creates a bootstrapper for the host behind `runner`, pulling
    /// Kubernetes binaries from `cache`.
    pub fn new(runner: Arc<dyn Runner>, cache: Arc<dyn BinaryCache>) -> Self {
        Bootstrapper {
            runner,
            cache,
            client: None,
            nodes: NodeCache::new(),
            cancel: CancellationToken::new(),
            arch: host_arch().to_string(),
        }
    }

    /// Talks to the API server directly instead of through the host's kubectl.
    pub fn with_client(mut self, client: kube::Client) -> Self {
        self.client = Some(client);
        self
    }

    /// Stops at the next phase boundary, and abandons the running phase, once
    /// `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Overrides the host architecture used to pick binaries and images.
    pub fn with_arch(mut self, arch: impl Into<String>) -> Self {
        self.arch = arch.into();
        self
    }

    /// Nodes provisioned so far.
    pub fn nodes(&self) -> &NodeCache {
        &self.nodes
    }

    async fn phase<T, F>(&self, name: &'static str, fut: F) -> anyhow::Result<T>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        if self.cancel.is_cancelled() {
            return Err(BootstrapError::Cancelled.into());
        }
        let start = Instant::now();
        let res = tokio::select! {
            _ = self.cancel.cancelled() => {
                warn!(phase = name, "cancelled");
                return Err(BootstrapError::Cancelled.into());
            }
            res = fut => res,
        };
        debug!(phase = name, elapsed = ?start.elapsed(), ok = res.is_ok(), "phase finished");
        res.with_context(|| format!("{} failed", name))
    }

    fn runtime(&self, cc: &ClusterConfig, init: InitSystem) -> anyhow::Result<Runtime> {
        let config = RuntimeConfig::from_kubernetes_config(&cc.kubernetes_config, init)?;
        Ok(Runtime::new(&cc.kubernetes_config.container_runtime, config)?)
    }

    /// Runs one full pass: disable other runtimes and enable the chosen one,
    /// write kubeadm and kubelet configs, transfer binaries, `kubeadm init`,
    /// install the CNI, apply addons, elevate `kube-system:default` and
    /// protect the API server from the OOM killer.
    #[instrument(level = "info", skip(self, cc), fields(cluster = %cc.name))]
    pub async fn reconcile(&self, cc: &ClusterConfig) -> anyhow::Result<()> {
        cc.validate()?;
        let runner = self.runner.as_ref();
        let k8s = &cc.kubernetes_config;
        let version = k8s.kubernetes_version.as_str();
        let node = cc.control_plane()?;

        let init = InitSystem::detect(runner).await;
        let runtime = self.runtime(cc, init)?;
        let cni = Cni::new(cc)?;
        info!(
            version,
            runtime = runtime.name(),
            cni = cni.name(),
            ?init,
            "reconciling cluster"
        );
        for n in &cc.nodes {
            self.nodes.record(n).await;
        }

        self.phase("container runtime", runtime.enable(runner)).await?;

        let params = self
            .phase("configuration", async {
                let cgroup_driver = runtime.manager().cgroup_driver(runner).await?;
                let params = KubeadmParams::new(
                    cc,
                    &runtime.manager().socket_path(),
                    &cgroup_driver,
                    &cni.cidr(),
                )?;
                let path = kubeadm_yaml_path();
                let (dir, name) = split_guest_path(&path);
                runner
                    .copy(&Asset::from_bytes(params.render()?, dir, name, "0640")?)
                    .await?;

                let flags = kubelet_flags(cc, node, &runtime, cni.is_enabled())?;
                let units = render_units(version, &flags, &runtime)?;
                write_units(runner, init, &units).await?;
                Ok(params)
            })
            .await?;

        self.phase(
            "binary transfer",
            transfer_binaries(runner, self.cache.as_ref(), version, &self.arch),
        )
        .await?;

        self.phase("kubeadm init", async {
            if init == InitSystem::SysV {
                restart_kubelet(runner, init).await?;
            }
            match runner.run_cmd(init_cmd(&params, is_kic(&cc.driver))).await {
                Ok(res) => {
                    debug!(output = %res.stdout_str(), "kubeadm init succeeded");
                    Ok(())
                }
                Err(RunError::ExitStatus(res)) => Err(BootstrapError::bootstrap_failure(&res).into()),
                Err(e) => Err(e.into()),
            }
        })
        .await?;

        self.phase("CNI", cni.apply(runner, &runtime)).await?;
        self.phase("addons", apply_addons(runner, cc, &self.arch))
            .await?;
        self.phase("RBAC elevation", self.elevate(version)).await?;

        if let Err(e) = self
            .phase("resource limits", adjust_resource_limits(runner))
            .await
        {
            if crate::error::is_cancelled(&e) {
                return Err(e);
            }
            warn!(error = %e, "unable to adjust kube-apiserver OOM score");
        }

        info!(version, "cluster is up");
        Ok(())
    }

    /// Elevates `kube-system:default`, retrying API server timeouts.
    async fn elevate(&self, version: &str) -> anyhow::Result<()> {
        let mut backoff =
            ExponentialBackoffStrategy::new(Duration::from_millis(500), Duration::from_secs(10));
        let start = Instant::now();
        loop {
            let res = match &self.client {
                Some(client) => elevate_kube_system_privileges(client).await,
                None => elevate_with_kubectl(self.runner.as_ref(), version).await,
            };
            match res {
                Err(e) if is_retriable(&e) && start.elapsed() < ELEVATE_BUDGET => {
                    debug!(error = %e, "API server not ready, retrying");
                    backoff.wait().await;
                }
                other => return other,
            }
        }
    }

    /// Keeps the cluster's addons in line with the addons directory, one
    /// prune-apply pass every `interval`, until the cancellation token fires.
    pub fn spawn_addon_reconciler(&self, cc: &ClusterConfig, interval: Duration) -> JoinHandle<()> {
        let runner = self.runner.clone();
        let cancel = self.cancel.clone();
        let version = cc.kubernetes_config.kubernetes_version.clone();
        info!(?interval, "starting addon reconciler");
        tokio::spawn(async move {
            run_addon_reconciler(runner.as_ref(), &version, interval, cancel).await
        })
    }

    /// Stops kubelet and tears the control plane down with `kubeadm reset`.
    #[instrument(level = "info", skip(self, cc), fields(cluster = %cc.name))]
    pub async fn delete_cluster(&self, cc: &ClusterConfig) -> anyhow::Result<()> {
        let runner = self.runner.as_ref();
        let init = InitSystem::detect(runner).await;
        let runtime = self.runtime(cc, init)?;
        let version = parse_version(&cc.kubernetes_config.kubernetes_version)?;

        if let Err(e) = self.phase("kubelet stop", stop_kubelet(runner, init)).await {
            if crate::error::is_cancelled(&e) {
                return Err(e);
            }
            warn!(error = %e, "kubelet did not stop cleanly");
        }
        let socket = cri_socket_uri(&runtime.manager().socket_path(), &version);
        self.phase("kubeadm reset", async {
            runner
                .run_cmd(reset_cmd(&cc.kubernetes_config.kubernetes_version, &socket))
                .await?;
            Ok(())
        })
        .await?;
        for n in &cc.nodes {
            self.nodes.forget(&n.name).await;
        }
        info!("cluster deleted");
        Ok(())
    }
}
