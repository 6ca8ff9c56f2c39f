//! Cluster addons.
//!
//! Each addon is a fixed list of templated manifests written to the guest
//! addons directory. Images are resolved per cluster: the user's overrides
//! first, then the mirror table when the cluster pulls from a mirror.

use std::collections::BTreeMap;

use command_runner::{Asset, Runner};
use lazy_static::lazy_static;
use serde::Serialize;
use tracing::{info, instrument};

use crate::config::ClusterConfig;
use crate::constants::{addon_path, GUEST_ADDONS_DIR};
use crate::error::BootstrapError;
use crate::images::{rewrite_images, MirrorTable};
use crate::reconcile::{apply_manifest, delete_manifest};
use crate::templates;

/// The storage-provisioner image tag.
pub const STORAGE_PROVISIONER_VERSION: &str = "v5";

/// Image repository whose clusters get their addon images from the mirror
/// table.
pub const MIRROR_REPOSITORY: &str = "registry.cn-hangzhou.aliyuncs.com/google_containers";

/// One manifest of an addon.
#[derive(Clone, Debug)]
pub struct AddonAsset {
    /// Template source.
    pub template: &'static str,
    /// File name in the addons directory.
    pub target_name: &'static str,
    /// Octal permissions.
    pub permissions: &'static str,
}

impl AddonAsset {
    fn new(template: &'static str, target_name: &'static str) -> Self {
        AddonAsset {
            template,
            target_name,
            permissions: "0640",
        }
    }

    /// Where the rendered manifest lands on the guest.
    pub fn target_path(&self) -> String {
        addon_path(self.target_name)
    }
}

/// A named set of manifests and the images they reference.
#[derive(Clone, Debug)]
pub struct Addon {
    /// Addon name, as used in the cluster config.
    pub name: &'static str,
    /// Manifests, applied in order.
    pub assets: Vec<AddonAsset>,
    /// Default image per image name, without registry.
    pub images: BTreeMap<String, String>,
    /// Default registry per image name.
    pub registries: BTreeMap<String, String>,
}

fn map(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
    entries
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

lazy_static! {
    static ref ADDONS: Vec<Addon> = vec![
        Addon {
            name: "storage-provisioner",
            assets: vec![AddonAsset::new(
                include_str!("../templates/addons/storage-provisioner.yaml"),
                "storage-provisioner.yaml",
            )],
            images: map(&[(
                "StorageProvisioner",
                format!("k8s-minikube/storage-provisioner:{}", STORAGE_PROVISIONER_VERSION).as_str(),
            )]),
            registries: map(&[("StorageProvisioner", "gcr.io")]),
        },
        Addon {
            name: "default-storageclass",
            assets: vec![AddonAsset::new(
                include_str!("../templates/addons/storageclass.yaml"),
                "storageclass.yaml",
            )],
            images: BTreeMap::new(),
            registries: BTreeMap::new(),
        },
        Addon {
            name: "metallb",
            assets: vec![
                AddonAsset::new(include_str!("../templates/addons/metallb.yaml"), "metallb.yaml"),
                AddonAsset::new(
                    include_str!("../templates/addons/metallb-config.yaml"),
                    "metallb-config.yaml",
                ),
            ],
            images: map(&[
                ("Controller", "metallb/controller:v0.9.6"),
                ("Speaker", "metallb/speaker:v0.9.6"),
            ]),
            registries: BTreeMap::new(),
        },
        Addon {
            name: "ingress",
            assets: vec![AddonAsset::new(
                include_str!("../templates/addons/ingress-deploy.yaml"),
                "ingress-deploy.yaml",
            )],
            images: map(&[
                ("IngressController", "ingress-nginx/controller:v1.2.1"),
                ("KubeWebhookCertgenCreate", "ingress-nginx/kube-webhook-certgen:v1.1.1"),
                ("KubeWebhookCertgenPatch", "ingress-nginx/kube-webhook-certgen:v1.1.1"),
            ]),
            registries: map(&[
                ("IngressController", "k8s.gcr.io"),
                ("KubeWebhookCertgenCreate", "k8s.gcr.io"),
                ("KubeWebhookCertgenPatch", "k8s.gcr.io"),
            ]),
        },
        Addon {
            name: "metrics-server",
            assets: vec![AddonAsset::new(
                include_str!("../templates/addons/metrics-server.yaml"),
                "metrics-server.yaml",
            )],
            images: map(&[("MetricsServer", "metrics-server/metrics-server:v0.6.1")]),
            registries: map(&[("MetricsServer", "k8s.gcr.io")]),
        },
    ];
}

/// Every known addon, in the order they are applied.
pub fn all() -> &'static [Addon] {
    &ADDONS
}

/// Looks an addon up by name.
pub fn find(name: &str) -> Result<&'static Addon, BootstrapError> {
    ADDONS
        .iter()
        .find(|a| a.name == name)
        .ok_or_else(|| BootstrapError::config(format!("unknown addon {:?}", name)))
}

/// The mirror table to use for a cluster: the embedded one when the cluster
/// pulls from the mirror repository, none otherwise.
pub fn mirrors_for(cc: &ClusterConfig) -> MirrorTable {
    if cc.kubernetes_config.image_repository.trim_end_matches('/') == MIRROR_REPOSITORY {
        MirrorTable::embedded()
    } else {
        MirrorTable::default()
    }
}

/// Values addon templates are rendered with.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct AddonParams {
    /// Guest architecture.
    pub arch: String,
    /// `-<arch>` on anything but amd64.
    pub exotic_arch: String,
    /// The cluster's image repository.
    pub image_repository: String,
    /// First MetalLB address.
    #[serde(rename = "LoadBalancerStartIP")]
    pub load_balancer_start_ip: String,
    /// Last MetalLB address.
    #[serde(rename = "LoadBalancerEndIP")]
    pub load_balancer_end_ip: String,
    /// `namespace/secret` of the ingress default certificate.
    pub custom_ingress_cert: String,
    /// storage-provisioner image tag.
    pub storage_provisioner_version: String,
    /// Full image reference per image name.
    pub images: BTreeMap<String, String>,
}

impl AddonParams {
    /// Parameters for rendering `addon` in cluster `cc` on an `arch` guest.
    pub fn new(addon: &Addon, cc: &ClusterConfig, arch: &str, mirrors: &MirrorTable) -> AddonParams {
        let rewritten = rewrite_images(
            &addon.images,
            &addon.registries,
            &cc.custom_addon_images,
            &cc.custom_addon_registries,
            mirrors,
        );
        let images = addon
            .images
            .keys()
            .filter_map(|name| rewritten.reference(name).map(|r| (name.clone(), r)))
            .collect();
        AddonParams {
            arch: arch.to_string(),
            exotic_arch: if arch == "amd64" {
                String::new()
            } else {
                format!("-{}", arch)
            },
            image_repository: cc.kubernetes_config.image_repository.clone(),
            load_balancer_start_ip: cc.load_balancer_start_ip.clone(),
            load_balancer_end_ip: cc.load_balancer_end_ip.clone(),
            custom_ingress_cert: cc.custom_ingress_cert.clone(),
            storage_provisioner_version: STORAGE_PROVISIONER_VERSION.to_string(),
            images,
        }
    }
}

/// Renders every manifest of `addon` into assets bound for the guest.
pub fn render_addon(addon: &Addon, params: &AddonParams) -> anyhow::Result<Vec<Asset>> {
    addon
        .assets
        .iter()
        .map(|a| {
            let rendered = templates::render(a.target_name, a.template, params)?;
            Ok(Asset::from_bytes(rendered, GUEST_ADDONS_DIR, a.target_name, a.permissions)?)
        })
        .collect()
}

async fn write_addon(
    runner: &dyn Runner,
    cc: &ClusterConfig,
    addon: &Addon,
    arch: &str,
) -> anyhow::Result<Vec<Asset>> {
    let params = AddonParams::new(addon, cc, arch, &mirrors_for(cc));
    let assets = render_addon(addon, &params)?;
    for asset in &assets {
        runner.copy(asset).await?;
    }
    Ok(assets)
}

/// Writes an addon's manifests to the guest and applies them.
#[instrument(level = "info", skip(runner, cc))]
pub async fn enable_addon(
    runner: &dyn Runner,
    cc: &ClusterConfig,
    name: &str,
    arch: &str,
) -> anyhow::Result<()> {
    let addon = find(name)?;
    let version = &cc.kubernetes_config.kubernetes_version;
    for asset in write_addon(runner, cc, addon, arch).await? {
        apply_manifest(runner, version, &asset.target_path()).await?;
    }
    info!(addon = name, "addon enabled");
    Ok(())
}

/// Deletes what an addon created and removes its manifests from the guest.
#[instrument(level = "info", skip(runner, cc))]
pub async fn disable_addon(
    runner: &dyn Runner,
    cc: &ClusterConfig,
    name: &str,
    arch: &str,
) -> anyhow::Result<()> {
    let addon = find(name)?;
    let version = &cc.kubernetes_config.kubernetes_version;
    for asset in write_addon(runner, cc, addon, arch).await?.iter().rev() {
        delete_manifest(runner, version, &asset.target_path()).await?;
        runner.remove(asset).await?;
    }
    info!(addon = name, "addon disabled");
    Ok(())
}

/// Enables every addon the cluster config turns on, in registry order.
pub async fn apply_addons(runner: &dyn Runner, cc: &ClusterConfig, arch: &str) -> anyhow::Result<()> {
    for name in cc.addons.iter().filter(|(_, on)| **on).map(|(n, _)| n) {
        find(name)?;
    }
    for addon in all().iter().filter(|a| cc.addon_enabled(a.name)) {
        enable_addon(runner, cc, addon.name, arch).await?;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::kubeadm::parse_documents;
    use command_runner::fake::{FakeFile, FakeRunner};
    use command_runner::AssetSource;

    fn cluster() -> ClusterConfig {
        ClusterConfig::default_for("minikube", "v1.23.0")
    }

    fn render(name: &str, cc: &ClusterConfig, arch: &str) -> Vec<String> {
        let addon = find(name).unwrap();
        let params = AddonParams::new(addon, cc, arch, &mirrors_for(cc));
        render_addon(addon, &params)
            .unwrap()
            .iter()
            .map(|a| match a.source() {
                AssetSource::Memory(b) => String::from_utf8(b.clone()).unwrap(),
                other => panic!("unexpected source {:?}", other),
            })
            .collect()
    }

    #[test]
    fn every_addon_renders_valid_yaml() {
        let mut cc = cluster();
        cc.load_balancer_start_ip = "192.168.49.100".to_string();
        cc.load_balancer_end_ip = "192.168.49.120".to_string();
        for addon in all() {
            for doc in render(addon.name, &cc, "amd64") {
                let parsed = parse_documents(&doc).unwrap();
                assert!(!parsed.is_empty(), "{}", addon.name);
            }
        }
    }

    #[test]
    fn storage_provisioner_uses_default_image() {
        let rendered = render("storage-provisioner", &cluster(), "amd64").join("");
        assert!(rendered.contains("image: gcr.io/k8s-minikube/storage-provisioner:v5"));
    }

    #[test]
    fn user_overrides_win() {
        let mut cc = cluster();
        cc.custom_addon_images
            .insert("MetricsServer".to_string(), "my/metrics:v1".to_string());
        cc.custom_addon_registries
            .insert("MetricsServer".to_string(), "registry.local:5000".to_string());
        let rendered = render("metrics-server", &cc, "arm64").join("");
        assert!(rendered.contains("image: registry.local:5000/my/metrics:v1"));
        assert!(rendered.contains("kubernetes.io/arch: arm64"));
    }

    #[test]
    fn mirror_repository_rewrites_images() {
        let mut cc = cluster();
        cc.kubernetes_config.image_repository = MIRROR_REPOSITORY.to_string();
        let rendered = render("storage-provisioner", &cc, "amd64").join("");
        assert!(rendered.contains(
            "image: registry.cn-hangzhou.aliyuncs.com/google_containers/storage-provisioner:v5"
        ));
    }

    #[test]
    fn metallb_gets_address_range() {
        let mut cc = cluster();
        cc.load_balancer_start_ip = "10.0.0.10".to_string();
        cc.load_balancer_end_ip = "10.0.0.20".to_string();
        let rendered = render("metallb", &cc, "amd64");
        assert_eq!(rendered.len(), 2);
        assert!(rendered[1].contains("- 10.0.0.10-10.0.0.20"));
        assert!(rendered[0].contains("image: metallb/speaker:v0.9.6"));
    }

    #[test]
    fn ingress_cert_is_optional() {
        let mut cc = cluster();
        assert!(!render("ingress", &cc, "amd64")[0].contains("default-ssl-certificate"));
        cc.custom_ingress_cert = "kube-system/mkcert".to_string();
        assert!(render("ingress", &cc, "amd64")[0]
            .contains("--default-ssl-certificate=kube-system/mkcert"));
    }

    #[test]
    fn exotic_arch() {
        let cc = cluster();
        let addon = find("storage-provisioner").unwrap();
        let mirrors = MirrorTable::default();
        assert_eq!(AddonParams::new(addon, &cc, "amd64", &mirrors).exotic_arch, "");
        assert_eq!(AddonParams::new(addon, &cc, "arm64", &mirrors).exotic_arch, "-arm64");
    }

    #[tokio::test]
    async fn enabling_twice_leaves_the_same_state() {
        let runner = FakeRunner::new();
        let cc = cluster();
        apply_addons(&runner, &cc, "amd64").await.unwrap();
        let first = runner.files_under(GUEST_ADDONS_DIR);
        apply_addons(&runner, &cc, "amd64").await.unwrap();
        let second = runner.files_under(GUEST_ADDONS_DIR);

        let contents = |m: &BTreeMap<String, FakeFile>| {
            m.iter()
                .map(|(k, v)| (k.clone(), v.contents.clone()))
                .collect::<Vec<_>>()
        };
        assert_eq!(contents(&first), contents(&second));
        assert_eq!(first.len(), 2);
        assert!(first.contains_key(&addon_path("storage-provisioner.yaml")));
        assert!(first.contains_key(&addon_path("storageclass.yaml")));
    }

    #[tokio::test]
    async fn disable_deletes_and_removes() {
        let runner = FakeRunner::new();
        let cc = cluster();
        enable_addon(&runner, &cc, "metrics-server", "amd64").await.unwrap();
        assert!(runner.has_file(&addon_path("metrics-server.yaml")));
        disable_addon(&runner, &cc, "metrics-server", "amd64").await.unwrap();
        assert!(!runner.has_file(&addon_path("metrics-server.yaml")));
        assert_eq!(runner.commands_containing("delete --ignore-not-found").len(), 1);
    }

    #[tokio::test]
    async fn unknown_addon_is_rejected() {
        let runner = FakeRunner::new();
        let mut cc = cluster();
        cc.addons.insert("dashboard-of-doom".to_string(), true);
        let err = apply_addons(&runner, &cc, "amd64").await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BootstrapError>(),
            Some(BootstrapError::Configuration(_))
        ));
        assert!(runner.commands().is_empty());
    }
}
