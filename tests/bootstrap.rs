use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Arc;

use bootstrapper::binaries::DirectoryCache;
use bootstrapper::cni::Cni;
use bootstrapper::config::Node;
use bootstrapper::constants::{
    addon_path, binary_path, cni_conf_path, cni_manifest_path, kubeadm_yaml_path, BRIDGE_CONFLIST,
    DOCKER_REPOSITORIES_JSON, FAKE_CNI_CONF, KUBELET_SYSTEMD_DROPIN, KUBERNETES_BINARIES,
};
use bootstrapper::cruntime::{Runtime, RuntimeConfig};
use bootstrapper::images::{rewrite_images, MirrorTable};
use bootstrapper::kubeadm::parse_documents;
use bootstrapper::kubelet::kubelet_flags;
use bootstrapper::{Bootstrapper, ClusterConfig};
use command_runner::fake::FakeRunner;
use command_runner::sysinit::{CONTAINERD, CRIO, DOCKER};
use command_runner::InitSystem;

fn cluster(driver: &str, runtime: &str, version: &str) -> ClusterConfig {
    let mut cc = ClusterConfig::default_for("minikube", version);
    cc.driver = driver.to_string();
    cc.kubernetes_config.container_runtime = runtime.to_string();
    cc.nodes[0].name = "minikube".to_string();
    cc.nodes[0].ip = "192.168.49.2".to_string();
    cc
}

fn guest(version: &str) -> FakeRunner {
    let runner = FakeRunner::new();
    for name in KUBERNETES_BINARIES.iter() {
        runner.put_file(binary_path(version, name), "bin");
    }
    runner
}

fn bootstrapper(runner: &FakeRunner) -> (tempfile::TempDir, Bootstrapper) {
    let cache = tempfile::tempdir().unwrap();
    let b = Bootstrapper::new(
        Arc::new(runner.clone()),
        Arc::new(DirectoryCache::new(cache.path())),
    )
    .with_arch("amd64");
    (cache, b)
}

fn kinds(yaml: &str) -> Vec<String> {
    parse_documents(yaml)
        .unwrap()
        .iter()
        .map(|doc| doc["kind"].as_str().unwrap().to_string())
        .collect()
}

#[tokio::test]
async fn fresh_docker_cluster() {
    let runner = guest("v1.23.0");
    runner.put_file(DOCKER_REPOSITORIES_JSON, r#"{"Repositories":{}}"#);
    runner.set_active(CONTAINERD, true);
    let (_cache, b) = bootstrapper(&runner);

    b.reconcile(&cluster("docker", "docker", "v1.23.0")).await.unwrap();

    let kubeadm = runner.file_string(&kubeadm_yaml_path()).unwrap();
    assert!(kubeadm.contains("apiVersion: kubeadm.k8s.io/v1beta3"));
    assert_eq!(
        kinds(&kubeadm),
        vec![
            "InitConfiguration",
            "ClusterConfiguration",
            "KubeletConfiguration",
            "KubeProxyConfiguration"
        ]
    );

    let dropin = runner.file_string(KUBELET_SYSTEMD_DROPIN).unwrap();
    assert!(dropin.contains("--container-runtime=docker"));
    assert!(!dropin.contains("--network-plugin"));

    assert!(!runner.has_file(&cni_conf_path(BRIDGE_CONFLIST)));
    assert!(!runner.has_file(&cni_manifest_path()));

    assert!(runner.has_file(&addon_path("storage-provisioner.yaml")));
    assert!(runner.has_file(&addon_path("storageclass.yaml")));
    assert!(runner.has_file(DOCKER_REPOSITORIES_JSON));

    assert_eq!(runner.active_services(), vec![DOCKER.to_string()]);
    assert_eq!(runner.commands_containing("kubeadm init").len(), 1);
    assert_eq!(runner.commands_containing("clusterrolebinding minikube-rbac").len(), 1);
}

#[tokio::test]
async fn fresh_containerd_cluster() {
    let runner = guest("v1.27.0");
    runner.set_active(DOCKER, true);
    runner.set_active(CRIO, true);
    let (_cache, b) = bootstrapper(&runner);

    b.reconcile(&cluster("docker", "containerd", "v1.27.0")).await.unwrap();

    let kubeadm = runner.file_string(&kubeadm_yaml_path()).unwrap();
    assert!(kubeadm.contains("apiVersion: kubeadm.k8s.io/v1beta3"));

    let dropin = runner.file_string(KUBELET_SYSTEMD_DROPIN).unwrap();
    assert!(dropin.contains("--container-runtime=remote"));
    assert!(dropin.contains("--container-runtime-endpoint=unix:///run/containerd/containerd.sock"));

    let manifest = runner.file_string(&cni_manifest_path()).unwrap();
    assert!(manifest.contains("kindnet"));
    assert!(!runner.has_file(&cni_conf_path(BRIDGE_CONFLIST)));

    assert_eq!(runner.active_services(), vec![CONTAINERD.to_string()]);
}

#[tokio::test]
async fn reconcile_runs_phases_in_order() {
    let runner = guest("v1.27.0");
    let (_cache, b) = bootstrapper(&runner);
    b.reconcile(&cluster("docker", "containerd", "v1.27.0")).await.unwrap();

    let commands = runner.commands();
    let position = |needle: &str| {
        commands
            .iter()
            .position(|c| c.contains(needle))
            .unwrap_or_else(|| panic!("{} never ran", needle))
    };
    let order = [
        position("systemctl restart containerd"),
        position("kubeadm init"),
        position(&format!("apply -f {}", cni_manifest_path())),
        position("storage-provisioner.yaml"),
        position("clusterrolebinding"),
        position("oom_adj"),
    ];
    assert!(order.windows(2).all(|w| w[0] < w[1]), "{:?}", order);
}

#[tokio::test]
async fn unprefixed_version_uses_one_binary_dir() {
    let runner = FakeRunner::new();
    for name in KUBERNETES_BINARIES.iter() {
        runner.put_file(format!("/var/lib/minikube/binaries/v1.23.0/{}", name), "bin");
    }
    let (_cache, b) = bootstrapper(&runner);
    b.reconcile(&cluster("docker", "docker", "1.23.0")).await.unwrap();

    let init = runner.commands_containing("kubeadm init");
    assert_eq!(init.len(), 1);
    assert!(init[0].contains("PATH=\"/var/lib/minikube/binaries/v1.23.0:$PATH\""));
    let dropin = runner.file_string(KUBELET_SYSTEMD_DROPIN).unwrap();
    assert!(dropin.contains("/var/lib/minikube/binaries/v1.23.0/kubelet"));
    for cmd in runner.commands_containing("kubectl") {
        assert!(cmd.contains("/var/lib/minikube/binaries/v1.23.0/kubectl"), "{}", cmd);
    }
    assert!(runner.files_under("/var/lib/minikube/binaries/1.23.0").is_empty());
}

#[tokio::test]
async fn reconcile_twice_leaves_the_same_addons() {
    let runner = guest("v1.23.0");
    let (_cache, b) = bootstrapper(&runner);
    let cc = cluster("docker", "docker", "v1.23.0");

    b.reconcile(&cc).await.unwrap();
    let first: BTreeMap<_, _> = runner
        .files_under(&addon_path(""))
        .into_iter()
        .map(|(k, v)| (k, v.contents))
        .collect();
    b.reconcile(&cc).await.unwrap();
    let second: BTreeMap<_, _> = runner
        .files_under(&addon_path(""))
        .into_iter()
        .map(|(k, v)| (k, v.contents))
        .collect();
    assert_eq!(first, second);
}

#[test]
fn mirrored_images() {
    let mut images = BTreeMap::new();
    images.insert(
        "kube-apiserver".to_string(),
        "k8s.gcr.io/kube-apiserver:v1.23.0".to_string(),
    );
    let mirrors = MirrorTable::from_entries(vec![(
        "k8s.gcr.io/kube-apiserver",
        "mirror.example.com/k8s-apiserver",
    )]);
    let before = images.clone();

    let out = rewrite_images(&images, &BTreeMap::new(), &BTreeMap::new(), &BTreeMap::new(), &mirrors);
    assert_eq!(out.images["kube-apiserver"], "k8s-apiserver:v1.23.0");
    assert_eq!(out.registries["kube-apiserver"], "mirror.example.com");
    assert_eq!(images, before);
}

#[test]
fn three_nodes_always_get_kindnet() {
    for runtime in ["docker", "containerd", "crio"] {
        for driver in ["docker", "kvm2", "none"] {
            let mut cc = cluster(driver, runtime, "v1.23.0");
            for i in 2..=3 {
                cc.nodes.push(Node {
                    name: format!("minikube-m0{}", i),
                    control_plane: false,
                    ..Default::default()
                });
            }
            assert_eq!(Cni::new(&cc).unwrap().name(), "kindnet", "{} {}", driver, runtime);
        }
    }
}

#[tokio::test]
async fn custom_cni() {
    let mut manifest = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
    writeln!(manifest, "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: my-cni").unwrap();

    let mut cc = cluster("kvm2", "containerd", "v1.23.0");
    cc.kubernetes_config.cni = manifest.path().display().to_string();
    let cni = Cni::new(&cc).unwrap();
    assert_eq!(cni.name(), "custom");

    let config = RuntimeConfig::from_kubernetes_config(&cc.kubernetes_config, InitSystem::Systemd).unwrap();
    let runtime = Runtime::new("containerd", config).unwrap();
    let runner = FakeRunner::new();
    cni.apply(&runner, &runtime).await.unwrap();

    assert!(runner.has_file(&cni_conf_path(FAKE_CNI_CONF)));
    assert!(runner.has_file(&cni_manifest_path()));
    assert_eq!(runner.restarts(CONTAINERD), 1);
}

#[test]
fn version_gated_kubelet_option() {
    let flags_for = |version: &str| {
        let mut cc = cluster("kvm2", "docker", version);
        cc.kubernetes_config
            .extra_options
            .push("kubelet.cadvisor-port=0".parse().unwrap());
        let config = RuntimeConfig::from_kubernetes_config(&cc.kubernetes_config, InitSystem::Systemd).unwrap();
        let runtime = Runtime::new("docker", config).unwrap();
        kubelet_flags(&cc, &cc.nodes[0], &runtime, false).unwrap()
    };
    assert_eq!(flags_for("v1.11.0").get("cadvisor-port").map(String::as_str), Some("0"));
    assert_eq!(flags_for("v1.11.1000").get("cadvisor-port").map(String::as_str), Some("0"));
    assert_eq!(flags_for("v1.12.0").get("cadvisor-port"), None);
    assert_eq!(flags_for("v1.19.0").get("cadvisor-port"), None);
}
