//! Container runtime management.
//!
//! Docker, containerd, CRI-O and rkt each implement [`Manager`]. A
//! [`Runtime`] picks one of them by name and runs the shared enable protocol:
//! every other runtime is disabled first, so at most one runtime is active on
//! a host at any time.
//!
//! ```text
//! Inactive -> Enabling -> Active -> Disabling -> Inactive
//! ```

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use command_runner::sysinit::ServiceManager;
use command_runner::{Asset, Cmd, InitSystem, Runner};
use semver::Version;
use tracing::{debug, info, instrument, warn};

use crate::config::KubernetesConfig;
use crate::constants::{split_guest_path, CONTAINERD_SOCKET, CRICTL_CONFIG, CRIO_SOCKET, DOCKER_SOCKET};
use crate::error::BootstrapError;
use crate::versions::parse_version;

mod containerd;
mod crio;
mod docker;
mod rkt;

pub use containerd::{parse_containerd_snapshotter, Containerd};
pub use crio::CriO;
pub use docker::Docker;
pub use rkt::Rkt;

/// Lifecycle of a runtime on a host.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    /// Not running.
    Inactive,
    /// Being configured and started.
    Enabling,
    /// Running.
    Active,
    /// Being stopped.
    Disabling,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            State::Inactive => "inactive",
            State::Enabling => "enabling",
            State::Active => "active",
            State::Disabling => "disabling",
        };
        f.write_str(s)
    }
}

/// Settings every runtime shares.
#[derive(Clone, Debug, PartialEq)]
pub struct RuntimeConfig {
    /// Kubernetes version the runtime serves.
    pub kubernetes_version: Version,
    /// Registry control plane images come from.
    pub image_repository: String,
    /// Registries reachable without TLS.
    pub insecure_registries: Vec<String>,
    /// Socket override.
    pub socket: Option<String>,
    /// Cgroup driver to configure.
    pub cgroup_driver: String,
    /// The host's init system.
    pub init: InitSystem,
}

impl RuntimeConfig {
    /// Derives the runtime settings from a cluster's Kubernetes config.
    pub fn from_kubernetes_config(
        k8s: &KubernetesConfig,
        init: InitSystem,
    ) -> Result<Self, BootstrapError> {
        Ok(RuntimeConfig {
            kubernetes_version: parse_version(&k8s.kubernetes_version)?,
            image_repository: k8s.image_repository.clone(),
            insecure_registries: k8s.insecure_registries.clone(),
            socket: k8s.cri_socket.clone(),
            cgroup_driver: "cgroupfs".to_string(),
            init,
        })
    }

    pub(crate) fn services<'r>(&self, runner: &'r dyn Runner) -> ServiceManager<'r> {
        ServiceManager::new(runner, self.init)
    }
}

/// What every container runtime can do.
#[async_trait]
pub trait Manager: Send + Sync {
    /// Display name.
    fn name(&self) -> &'static str;

    /// The settings this runtime was built with.
    fn config(&self) -> &RuntimeConfig;

    /// The unit whose state decides whether the runtime is active.
    fn service(&self) -> &'static str;

    /// The binary whose presence decides whether the runtime is available.
    fn binary(&self) -> &'static str;

    /// The CRI socket.
    fn socket_path(&self) -> String;

    /// Flags kubelet needs to talk to this runtime.
    fn kubelet_options(&self) -> BTreeMap<String, String>;

    /// Whether the runtime's unit is running.
    async fn active(&self, runner: &dyn Runner) -> bool {
        self.config().services(runner).active(self.service()).await
    }

    /// Fails if the runtime is not installed.
    async fn available(&self, runner: &dyn Runner) -> anyhow::Result<()> {
        match runner.run_cmd(Cmd::new("which").arg(self.binary())).await {
            Ok(_) => Ok(()),
            Err(e) => Err(BootstrapError::RuntimeUnavailable {
                runtime: self.name().to_string(),
                reason: e.to_string(),
            }
            .into()),
        }
    }

    /// Writes runtime-specific configuration before the runtime is started.
    async fn prepare(&self, runner: &dyn Runner) -> anyhow::Result<()>;

    /// Starts the runtime's units.
    async fn start(&self, runner: &dyn Runner) -> anyhow::Result<()> {
        self.config().services(runner).restart(self.service()).await
    }

    /// Stops the runtime's units.
    async fn stop(&self, runner: &dyn Runner) -> anyhow::Result<()> {
        self.config().services(runner).stop(self.service()).await
    }

    /// Loads an image tarball already on the host.
    async fn load_image(&self, runner: &dyn Runner, path: &str) -> anyhow::Result<()>;

    /// The cgroup driver the runtime is configured with.
    async fn cgroup_driver(&self, runner: &dyn Runner) -> anyhow::Result<String>;

    /// The runtime's version string.
    async fn version(&self, runner: &dyn Runner) -> anyhow::Result<String>;

    /// Whether `image` is present with the given id.
    async fn image_exists(&self, runner: &dyn Runner, image: &str, sha: &str) -> bool;

    /// Ids of Kubernetes containers in `namespaces` (all when empty).
    async fn list_containers(
        &self,
        runner: &dyn Runner,
        namespaces: &[String],
    ) -> anyhow::Result<Vec<String>>;

    /// Removes containers.
    async fn kill_containers(&self, runner: &dyn Runner, ids: &[String]) -> anyhow::Result<()>;

    /// Stops containers.
    async fn stop_containers(&self, runner: &dyn Runner, ids: &[String]) -> anyhow::Result<()>;

    /// A shell command that prints a container's logs.
    fn container_log_cmd(&self, id: &str, len: Option<u32>, follow: bool) -> String;
}

/// One of the supported runtimes.
pub enum Runtime {
    /// Docker with dockershim.
    Docker(Docker),
    /// containerd.
    Containerd(Containerd),
    /// CRI-O, also used for any other CRI runtime reached through a socket.
    CriO(CriO),
    /// rkt.
    Rkt(Rkt),
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Runtime").field(&self.manager().name()).finish()
    }
}

impl Runtime {
    /// Builds the runtime named `name`: `docker`, `containerd`, `crio` (or
    /// `cri-o`), `rkt`, or `remote` for a generic CRI runtime at the
    /// configured socket.
    pub fn new(name: &str, config: RuntimeConfig) -> Result<Runtime, BootstrapError> {
        match name.to_lowercase().as_str() {
            "" | "docker" => Ok(Runtime::Docker(Docker::new(config))),
            "containerd" => Ok(Runtime::Containerd(Containerd::new(config))),
            "crio" | "cri-o" => Ok(Runtime::CriO(CriO::new(config))),
            "remote" => {
                if config.socket.is_none() {
                    return Err(BootstrapError::config(
                        "the remote container runtime needs a CRI socket",
                    ));
                }
                Ok(Runtime::CriO(CriO::new(config)))
            }
            "rkt" => Ok(Runtime::Rkt(Rkt::new(config))),
            other => Err(BootstrapError::config(format!(
                "unknown container runtime {:?}",
                other
            ))),
        }
    }

    /// Every known runtime, built with `config`.
    pub fn all(config: &RuntimeConfig) -> Vec<Runtime> {
        let mut shared = config.clone();
        shared.socket = None;
        vec![
            Runtime::Docker(Docker::new(shared.clone())),
            Runtime::Containerd(Containerd::new(shared.clone())),
            Runtime::CriO(CriO::new(shared.clone())),
            Runtime::Rkt(Rkt::new(shared)),
        ]
    }

    /// The runtime's capabilities.
    pub fn manager(&self) -> &dyn Manager {
        match self {
            Runtime::Docker(r) => r,
            Runtime::Containerd(r) => r,
            Runtime::CriO(r) => r,
            Runtime::Rkt(r) => r,
        }
    }

    /// Display name.
    pub fn name(&self) -> &'static str {
        self.manager().name()
    }

    /// Whether this is a CRI runtime other than dockershim.
    pub fn is_cri(&self) -> bool {
        matches!(self, Runtime::Containerd(_) | Runtime::CriO(_))
    }

    fn same_kind(&self, other: &Runtime) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }

    /// Disables every other runtime, checks they stayed down, then prepares
    /// and starts this one. Enabling an active runtime only disables the
    /// others.
    #[instrument(level = "info", skip(self, runner), fields(runtime = self.name()))]
    pub async fn enable(&self, runner: &dyn Runner) -> anyhow::Result<()> {
        let me = self.manager();
        me.available(runner).await?;
        self.disable_others(runner).await?;

        if me.active(runner).await {
            debug!(runtime = me.name(), state = %State::Active, "already active");
            return Ok(());
        }
        info!(runtime = me.name(), from = %State::Inactive, to = %State::Enabling, "runtime state");
        me.prepare(runner).await?;
        me.start(runner).await?;
        info!(runtime = me.name(), from = %State::Enabling, to = %State::Active, "runtime state");
        Ok(())
    }

    /// Stops the runtime. Disabling an inactive runtime does nothing.
    pub async fn disable(&self, runner: &dyn Runner) -> anyhow::Result<()> {
        let me = self.manager();
        if !me.active(runner).await {
            debug!(runtime = me.name(), state = %State::Inactive, "already inactive");
            return Ok(());
        }
        info!(runtime = me.name(), from = %State::Active, to = %State::Disabling, "runtime state");
        me.stop(runner).await?;
        info!(runtime = me.name(), from = %State::Disabling, to = %State::Inactive, "runtime state");
        Ok(())
    }

    async fn disable_others(&self, runner: &dyn Runner) -> anyhow::Result<()> {
        let me = self.manager();
        let others: Vec<Runtime> = Runtime::all(me.config())
            .into_iter()
            .filter(|r| !r.same_kind(self))
            .collect();
        for other in &others {
            if let Err(e) = other.disable(runner).await {
                warn!(runtime = other.name(), error = %e, "failed to disable");
            }
        }
        for other in &others {
            if other.manager().active(runner).await {
                return Err(BootstrapError::MutualExclusion(other.name().to_string()).into());
            }
        }
        Ok(())
    }
}

/// The default socket for a runtime name.
pub fn default_socket(name: &str) -> &'static str {
    match name {
        "containerd" => CONTAINERD_SOCKET,
        "crio" | "cri-o" | "remote" => CRIO_SOCKET,
        _ => DOCKER_SOCKET,
    }
}

/// Flags kubelet needs for a CRI runtime at `socket`.
pub(crate) fn cri_kubelet_options(socket: &str) -> BTreeMap<String, String> {
    let endpoint = format!("unix://{}", socket);
    let mut opts = BTreeMap::new();
    opts.insert("container-runtime".to_string(), "remote".to_string());
    opts.insert("container-runtime-endpoint".to_string(), endpoint.clone());
    opts.insert("image-service-endpoint".to_string(), endpoint);
    opts.insert("runtime-request-timeout".to_string(), "15m".to_string());
    opts
}

/// Points crictl at `socket`.
pub(crate) async fn populate_crictl_config(runner: &dyn Runner, socket: &str) -> anyhow::Result<()> {
    let contents = format!(
        "runtime-endpoint: unix://{socket}\nimage-endpoint: unix://{socket}\n",
        socket = socket
    );
    let (dir, name) = split_guest_path(CRICTL_CONFIG);
    runner.copy(&Asset::from_bytes(contents, dir, name, "0644")?).await
}

/// Loads br_netfilter and turns on IPv4 forwarding.
pub(crate) async fn enable_ip_forwarding(runner: &dyn Runner) -> anyhow::Result<()> {
    if let Err(e) = runner
        .run_cmd(Cmd::new("sudo").args(["modprobe", "br_netfilter"]))
        .await
    {
        warn!(error = %e, "br_netfilter could not be loaded, bridged traffic may bypass iptables");
    }
    runner
        .run_cmd(Cmd::shell("sudo sh -c \"echo 1 > /proc/sys/net/ipv4/ip_forward\""))
        .await?;
    Ok(())
}

/// Runs a `crictl` subcommand over `ids`, doing nothing when there are none.
pub(crate) async fn crictl(runner: &dyn Runner, action: &[&str], ids: &[String]) -> anyhow::Result<()> {
    if ids.is_empty() {
        return Ok(());
    }
    runner
        .run_cmd(
            Cmd::new("sudo")
                .arg("crictl")
                .args(action.iter().copied())
                .args(ids.iter().cloned()),
        )
        .await?;
    Ok(())
}

/// `crictl logs` for CRI runtimes.
pub(crate) fn crictl_log_cmd(id: &str, len: Option<u32>, follow: bool) -> String {
    let mut cmd = "sudo /usr/bin/crictl logs".to_string();
    if let Some(n) = len {
        cmd.push_str(&format!(" --tail {}", n));
    }
    if follow {
        cmd.push_str(" --follow");
    }
    cmd.push(' ');
    cmd.push_str(id);
    cmd
}
