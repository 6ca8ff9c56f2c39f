//! Pod networking.
//!
//! [`Cni::new`] turns the cluster's `cni` setting into one of the supported
//! plugins, picking a default when none was asked for. Each plugin knows its
//! pod CIDR and how to install itself on the host.

use std::fmt;

use async_trait::async_trait;
use command_runner::{Cmd, Runner};
use tracing::{debug, info, instrument};

use crate::config::{ClusterConfig, KubernetesConfig};
use crate::constants::{cni_conf_path, BRIDGE_CONFLIST, CNI_CONF_DIR, CNI_DISABLED_SUFFIX, DEFAULT_POD_CIDR};
use crate::cruntime::Runtime;
use crate::driver::is_kic;
use crate::error::BootstrapError;
use crate::versions::parse_version;

mod bridge;
mod custom;
mod manifest;

pub use bridge::Bridge;
pub use custom::Custom;
pub use manifest::{Manifest, ManifestKind};

/// What every CNI can do.
#[async_trait]
pub trait CniManager: Send + Sync {
    /// Display name.
    fn name(&self) -> &'static str;

    /// The pod network the CNI hands addresses out of.
    fn cidr(&self) -> String;

    /// Installs the CNI on the host. `runtime` is the active container
    /// runtime.
    async fn apply(&self, runner: &dyn Runner, runtime: &Runtime) -> anyhow::Result<()>;
}

/// Pod networks and version a CNI is rendered for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CniConfig {
    /// Kubernetes version, for the host's kubectl.
    pub kubernetes_version: String,
    /// IPv4 pod network.
    pub pod_cidr_v4: Option<String>,
    /// IPv6 pod network.
    pub pod_cidr_v6: Option<String>,
    /// Number of nodes in the cluster.
    pub nodes: usize,
}

impl CniConfig {
    /// Pod networks from the cluster config. A `pod-network-cidr` override
    /// replaces the primary family's network.
    pub fn from_cluster(cc: &ClusterConfig) -> Result<CniConfig, BootstrapError> {
        let k8s = &cc.kubernetes_config;
        let (mut v4, mut v6) = k8s.pod_cidrs()?;
        if let Some(cidr) = k8s.pod_network_cidr_override() {
            if v4.is_some() || !cidr.contains(':') {
                v4 = Some(cidr.to_string());
            } else {
                v6 = Some(cidr.to_string());
            }
        }
        Ok(CniConfig {
            kubernetes_version: k8s.kubernetes_version.clone(),
            pod_cidr_v4: v4,
            pod_cidr_v6: v6,
            nodes: cc.nodes.len(),
        })
    }

    /// The primary pod network.
    pub fn cidr(&self) -> String {
        self.pod_cidr_v4
            .clone()
            .or_else(|| self.pod_cidr_v6.clone())
            .unwrap_or_else(|| DEFAULT_POD_CIDR.to_string())
    }
}

/// A CNI that installs nothing.
#[derive(Clone, Debug)]
pub struct Disabled {
    config: CniConfig,
}

#[async_trait]
impl CniManager for Disabled {
    fn name(&self) -> &'static str {
        "disabled"
    }

    fn cidr(&self) -> String {
        self.config.cidr()
    }

    async fn apply(&self, _runner: &dyn Runner, _runtime: &Runtime) -> anyhow::Result<()> {
        debug!("CNI disabled, nothing to apply");
        Ok(())
    }
}

/// One of the supported CNIs.
#[derive(Clone, Debug)]
pub enum Cni {
    /// The bridge plugin with host-local IPAM.
    Bridge(Bridge),
    /// kindnet.
    KindNet(Manifest),
    /// Calico.
    Calico(Manifest),
    /// Flannel.
    Flannel(Manifest),
    /// Cilium.
    Cilium(Manifest),
    /// A manifest supplied by the user.
    Custom(Custom),
    /// No CNI.
    Disabled(Disabled),
}

/// The plugin a default resolves to, before it is configured.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DefaultChoice {
    /// kindnet.
    KindNet,
    /// bridge.
    Bridge,
    /// No CNI.
    Disabled,
}

/// Picks a CNI when the user did not name one.
pub fn choose_default(
    driver: &str,
    k8s: &KubernetesConfig,
    nodes: usize,
) -> Result<DefaultChoice, BootstrapError> {
    let runtime = k8s.container_runtime.to_lowercase();
    let cri = matches!(runtime.as_str(), "containerd" | "crio" | "cri-o" | "remote");
    let kic = is_kic(driver);

    if kic && cri {
        return Ok(DefaultChoice::KindNet);
    }
    if nodes > 1 {
        return Ok(DefaultChoice::KindNet);
    }
    if cri {
        return Ok(DefaultChoice::Bridge);
    }
    if kic && matches!(runtime.as_str(), "" | "docker") {
        let version = parse_version(&k8s.kubernetes_version)?;
        if version < semver::Version::new(1, 24, 0) {
            return Ok(DefaultChoice::Disabled);
        }
        return Ok(DefaultChoice::Bridge);
    }
    Ok(DefaultChoice::Disabled)
}

impl Cni {
    /// Resolves the cluster's `cni` setting: empty, `auto` or `true` picks a
    /// default, `false` disables, a known name selects that CNI, and anything
    /// that looks like a path is a custom manifest.
    pub fn new(cc: &ClusterConfig) -> Result<Cni, BootstrapError> {
        let config = CniConfig::from_cluster(cc)?;
        let requested = cc.kubernetes_config.cni.trim();
        let cni = match requested.to_lowercase().as_str() {
            "" | "auto" | "true" => match choose_default(&cc.driver, &cc.kubernetes_config, config.nodes)? {
                DefaultChoice::KindNet => Cni::KindNet(Manifest::new(ManifestKind::KindNet, config)),
                DefaultChoice::Bridge => Cni::Bridge(Bridge::new(config)?),
                DefaultChoice::Disabled => Cni::Disabled(Disabled { config }),
            },
            "false" | "none" | "disabled" => Cni::Disabled(Disabled { config }),
            "bridge" => Cni::Bridge(Bridge::new(config)?),
            "kindnet" => Cni::KindNet(Manifest::new(ManifestKind::KindNet, config)),
            "calico" => Cni::Calico(Manifest::new(ManifestKind::Calico, config)),
            "flannel" => Cni::Flannel(Manifest::new(ManifestKind::Flannel, config)),
            "cilium" => Cni::Cilium(Manifest::new(ManifestKind::Cilium, config)),
            _ if looks_like_path(requested) => Cni::Custom(Custom::new(requested, config)),
            other => {
                return Err(BootstrapError::config(format!(
                    "unknown CNI {:?}: expected auto, false, bridge, kindnet, calico, flannel, cilium or a manifest path",
                    other
                )))
            }
        };
        debug!(requested, chosen = cni.name(), "CNI selected");
        Ok(cni)
    }

    /// The CNI's capabilities.
    pub fn manager(&self) -> &dyn CniManager {
        match self {
            Cni::Bridge(c) => c,
            Cni::KindNet(c) | Cni::Calico(c) | Cni::Flannel(c) | Cni::Cilium(c) => c,
            Cni::Custom(c) => c,
            Cni::Disabled(c) => c,
        }
    }

    /// Display name.
    pub fn name(&self) -> &'static str {
        self.manager().name()
    }

    /// The pod network.
    pub fn cidr(&self) -> String {
        self.manager().cidr()
    }

    /// Whether a CNI will be installed.
    pub fn is_enabled(&self) -> bool {
        !matches!(self, Cni::Disabled(_))
    }

    /// Installs the CNI.
    pub async fn apply(&self, runner: &dyn Runner, runtime: &Runtime) -> anyhow::Result<()> {
        info!(cni = self.name(), cidr = %self.cidr(), "configuring CNI");
        self.manager().apply(runner, runtime).await
    }
}

impl fmt::Display for Cni {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn looks_like_path(s: &str) -> bool {
    s.contains('/') || s.ends_with(".yaml") || s.ends_with(".yml") || s.ends_with(".json")
}

/// Renames bridge and podman configs in the CNI config directory so the
/// runtime does not pick them over the installed CNI.
#[instrument(level = "debug", skip(runner))]
pub async fn disable_conflicting_configs(runner: &dyn Runner) -> anyhow::Result<()> {
    let listing = match runner
        .run_cmd(Cmd::new("sudo").args(["ls", CNI_CONF_DIR]))
        .await
    {
        Ok(res) => res.stdout_str(),
        Err(e) => {
            debug!(error = %e, "no CNI config directory");
            return Ok(());
        }
    };
    for name in listing.split_whitespace() {
        let conflicting = name == BRIDGE_CONFLIST || name.contains("bridge") || name.contains("podman");
        if !conflicting || name.ends_with(CNI_DISABLED_SUFFIX) {
            continue;
        }
        let path = cni_conf_path(name);
        runner
            .run_cmd(Cmd::new("sudo").args(["mv", &path, &format!("{}{}", path, CNI_DISABLED_SUFFIX)]))
            .await?;
        info!(config = name, "disabled conflicting CNI config");
    }
    Ok(())
}
