use async_trait::async_trait;
use command_runner::{Asset, Runner};
use minijinja::context;

use super::{disable_conflicting_configs, CniConfig, CniManager};
use crate::constants::{cni_manifest_path, split_guest_path, CNI_CONF_DIR};
use crate::cruntime::Runtime;
use crate::reconcile::apply_manifest;
use crate::templates;

const KINDNET_TEMPLATE: &str = include_str!("../../templates/cni/kindnet.yaml");
const CALICO_TEMPLATE: &str = include_str!("../../templates/cni/calico.yaml");
const FLANNEL_TEMPLATE: &str = include_str!("../../templates/cni/flannel.yaml");
const CILIUM_TEMPLATE: &str = include_str!("../../templates/cni/cilium.yaml");

const KINDNET_IMAGE: &str = "kindest/kindnetd:v20210326-1e038dc5";
const CALICO_VERSION: &str = "v3.24.5";
const FLANNEL_IMAGE: &str = "docker.io/flannel/flannel:v0.20.2";
const CILIUM_VERSION: &str = "v1.12.3";

/// CNIs installed from a rendered manifest.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ManifestKind {
    /// kindnet.
    KindNet,
    /// Calico.
    Calico,
    /// Flannel.
    Flannel,
    /// Cilium.
    Cilium,
}

/// A CNI installed by applying a rendered manifest with the host's kubectl.
#[derive(Clone, Debug)]
pub struct Manifest {
    kind: ManifestKind,
    config: CniConfig,
}

impl Manifest {
    /// Creates the CNI.
    pub fn new(kind: ManifestKind, config: CniConfig) -> Manifest {
        Manifest { kind, config }
    }

    /// The rendered manifest.
    pub fn render(&self) -> anyhow::Result<String> {
        let cidr = self.config.cidr();
        match self.kind {
            ManifestKind::KindNet => templates::render(
                "kindnet",
                KINDNET_TEMPLATE,
                context! { image => KINDNET_IMAGE, pod_cidr => cidr, cni_conf_dir => CNI_CONF_DIR },
            ),
            ManifestKind::Calico => templates::render(
                "calico",
                CALICO_TEMPLATE,
                context! {
                    cni_image => format!("docker.io/calico/cni:{}", CALICO_VERSION),
                    node_image => format!("docker.io/calico/node:{}", CALICO_VERSION),
                    controllers_image => format!("docker.io/calico/kube-controllers:{}", CALICO_VERSION),
                    pod_cidr => cidr,
                    cni_conf_dir => CNI_CONF_DIR,
                },
            ),
            ManifestKind::Flannel => templates::render(
                "flannel",
                FLANNEL_TEMPLATE,
                context! { image => FLANNEL_IMAGE, pod_cidr => cidr, cni_conf_dir => CNI_CONF_DIR },
            ),
            ManifestKind::Cilium => templates::render(
                "cilium",
                CILIUM_TEMPLATE,
                context! {
                    agent_image => format!("quay.io/cilium/cilium:{}", CILIUM_VERSION),
                    operator_image => format!("quay.io/cilium/operator-generic:{}", CILIUM_VERSION),
                    pod_cidr => cidr,
                    cni_conf_dir => CNI_CONF_DIR,
                },
            ),
        }
    }
}

#[async_trait]
impl CniManager for Manifest {
    fn name(&self) -> &'static str {
        match self.kind {
            ManifestKind::KindNet => "kindnet",
            ManifestKind::Calico => "calico",
            ManifestKind::Flannel => "flannel",
            ManifestKind::Cilium => "cilium",
        }
    }

    fn cidr(&self) -> String {
        self.config.cidr()
    }

    async fn apply(&self, runner: &dyn Runner, _runtime: &Runtime) -> anyhow::Result<()> {
        disable_conflicting_configs(runner).await?;
        let path = cni_manifest_path();
        let (dir, name) = split_guest_path(&path);
        runner
            .copy(&Asset::from_bytes(self.render()?, dir, name, "0644")?)
            .await?;
        apply_manifest(runner, &self.config.kubernetes_version, &path).await
    }
}
