//! kubelet unit generation and lifecycle.
//!
//! On systemd hosts kubelet runs from a base unit plus a drop-in carrying the
//! real `ExecStart`. SysV hosts get an init script that runs a restart
//! wrapper, which re-reads the same drop-in, so both modes share one source
//! of truth for kubelet's command line.

use std::collections::BTreeMap;
use std::time::Duration;

use command_runner::backoff::{retry, ExponentialBackoffStrategy};
use command_runner::sysinit::{ServiceManager, KUBELET};
use command_runner::{Asset, InitSystem, Runner};
use minijinja::context;
use semver::Version;
use tracing::{info, instrument};

use crate::config::{ClusterConfig, Node};
use crate::constants::{
    binary_root, split_guest_path, KUBELET_INIT_SCRIPT, KUBELET_SERVICE_FILE,
    KUBELET_SYSTEMD_DROPIN, SYSV_RESTART_WRAPPER,
};
use crate::cruntime::Runtime;
use crate::templates;
use crate::versions::{effective_options, parse_version, KUBELET as KUBELET_COMPONENT};

const DROPIN_TEMPLATE: &str = include_str!("../templates/kubelet/10-kubeadm.conf");
const SERVICE_TEMPLATE: &str = include_str!("../templates/kubelet/kubelet.service");
const INIT_TEMPLATE: &str = include_str!("../templates/kubelet/kubelet.init");
const RESTART_WRAPPER: &str = include_str!("../templates/kubelet/restart_wrapper.sh");

/// How long [`stop_kubelet`] waits for the unit to settle.
pub const STOP_BUDGET: Duration = Duration::from_secs(60);

/// The unit kubelet should start after for a runtime.
pub fn runtime_unit(runtime: &Runtime) -> &'static str {
    match runtime {
        Runtime::Docker(_) => "docker.socket",
        Runtime::Containerd(_) => "containerd.service",
        Runtime::CriO(_) => "crio.service",
        Runtime::Rkt(_) => "rkt-api.service",
    }
}

/// kubelet's flags for `node`, sorted by name.
pub fn kubelet_flags(
    cc: &ClusterConfig,
    node: &Node,
    runtime: &Runtime,
    cni_enabled: bool,
) -> anyhow::Result<BTreeMap<String, String>> {
    let k8s = &cc.kubernetes_config;
    let version = parse_version(&k8s.kubernetes_version)?;
    let mut flags = effective_options(k8s, &version)?.get(KUBELET_COMPONENT);

    for (k, v) in runtime.manager().kubelet_options() {
        flags.entry(k).or_insert(v);
    }
    if !node.name.is_empty() {
        flags.insert("hostname-override".to_string(), node.name.clone());
    }
    if !node.ip.is_empty() {
        flags.insert("node-ip".to_string(), node.ip.clone());
    }
    if uses_network_plugin_flag(&version) && (cni_enabled || k8s.network_plugin == "cni") {
        flags.insert("network-plugin".to_string(), "cni".to_string());
    }
    Ok(flags)
}

/// kubelet dropped `--network-plugin` together with dockershim in 1.24.
fn uses_network_plugin_flag(version: &Version) -> bool {
    version < &Version::new(1, 24, 0)
}

/// Renders flags as `--key=value` pairs.
pub fn render_flags(flags: &BTreeMap<String, String>) -> String {
    flags
        .iter()
        .map(|(k, v)| format!("--{}={}", k, v))
        .collect::<Vec<_>>()
        .join(" ")
}

/// The rendered unit files for one node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KubeletUnits {
    /// The systemd drop-in with kubelet's `ExecStart`.
    pub dropin: String,
    /// The base systemd unit.
    pub service: String,
    /// The SysV init script.
    pub init_script: String,
}

/// Renders every kubelet unit file.
pub fn render_units(
    kubernetes_version: &str,
    flags: &BTreeMap<String, String>,
    runtime: &Runtime,
) -> anyhow::Result<KubeletUnits> {
    let bin_root = binary_root(kubernetes_version);
    let dropin = templates::render(
        "10-kubeadm.conf",
        DROPIN_TEMPLATE,
        context! {
            wants => runtime_unit(runtime),
            bin_root => &bin_root,
            flags => render_flags(flags),
        },
    )?;
    let service = templates::render(
        "kubelet.service",
        SERVICE_TEMPLATE,
        context! { bin_root => &bin_root },
    )?;
    let init_script = templates::render(
        "kubelet.init",
        INIT_TEMPLATE,
        context! {
            bin_root => &bin_root,
            wrapper => SYSV_RESTART_WRAPPER,
            unit_path => KUBELET_SYSTEMD_DROPIN,
        },
    )?;
    Ok(KubeletUnits {
        dropin,
        service,
        init_script,
    })
}

fn asset(contents: &str, path: &str, perms: &str) -> anyhow::Result<Asset> {
    let (dir, name) = split_guest_path(path);
    Ok(Asset::from_bytes(contents.as_bytes().to_vec(), dir, name, perms)?)
}

/// Writes the unit files for `init`. The drop-in is always written since the
/// SysV wrapper reads its `ExecStart` too.
#[instrument(level = "info", skip(runner, units))]
pub async fn write_units(
    runner: &dyn Runner,
    init: InitSystem,
    units: &KubeletUnits,
) -> anyhow::Result<()> {
    runner
        .copy(&asset(&units.dropin, KUBELET_SYSTEMD_DROPIN, "0644")?)
        .await?;
    match init {
        InitSystem::Systemd => {
            runner
                .copy(&asset(&units.service, KUBELET_SERVICE_FILE, "0644")?)
                .await?;
            ServiceManager::new(runner, init).daemon_reload().await
        }
        InitSystem::SysV => {
            runner
                .copy(&asset(RESTART_WRAPPER, SYSV_RESTART_WRAPPER, "0755")?)
                .await?;
            runner
                .copy(&asset(&units.init_script, KUBELET_INIT_SCRIPT, "0755")?)
                .await
        }
    }
}

/// (Re)starts kubelet. It is never enabled at boot.
pub async fn restart_kubelet(runner: &dyn Runner, init: InitSystem) -> anyhow::Result<()> {
    ServiceManager::new(runner, init).restart(KUBELET).await
}

/// Stops kubelet and waits up to a minute for the unit to reach `dead` or
/// `failed`.
#[instrument(level = "info", skip(runner))]
pub async fn stop_kubelet(runner: &dyn Runner, init: InitSystem) -> anyhow::Result<()> {
    let svc = ServiceManager::new(runner, init);
    let mut backoff =
        ExponentialBackoffStrategy::new(Duration::from_millis(500), Duration::from_secs(5));
    retry(&mut backoff, STOP_BUDGET, || async move {
        svc.stop(KUBELET).await?;
        match svc.sub_state(KUBELET).await?.as_str() {
            "dead" | "failed" => Ok(()),
            other => Err(anyhow::anyhow!("kubelet is still {}", other)),
        }
    })
    .await?;
    info!("kubelet stopped");
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cruntime::RuntimeConfig;
    use command_runner::fake::FakeRunner;

    fn runtime(name: &str, version: &str) -> Runtime {
        let cc = ClusterConfig::default_for("minikube", version);
        let cfg =
            RuntimeConfig::from_kubernetes_config(&cc.kubernetes_config, InitSystem::Systemd).unwrap();
        Runtime::new(name, cfg).unwrap()
    }

    fn node() -> Node {
        Node {
            name: "minikube".to_string(),
            ip: "192.168.49.2".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn docker_flags_for_1_23() {
        let cc = ClusterConfig::default_for("minikube", "v1.23.0");
        let flags = kubelet_flags(&cc, &node(), &runtime("docker", "v1.23.0"), false).unwrap();
        let rendered = render_flags(&flags);
        assert!(rendered.contains("--container-runtime=docker"));
        assert!(rendered.contains("--hostname-override=minikube"));
        assert!(rendered.contains("--node-ip=192.168.49.2"));
        assert!(!rendered.contains("network-plugin"));
        assert!(!rendered.contains("cadvisor-port"));
        let keys: Vec<_> = flags.keys().cloned().collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }

    #[test]
    fn network_plugin_flag_stops_at_1_24() {
        let cc = ClusterConfig::default_for("minikube", "v1.23.0");
        let flags = kubelet_flags(&cc, &node(), &runtime("containerd", "v1.23.0"), true).unwrap();
        assert_eq!(flags["network-plugin"], "cni");

        let cc = ClusterConfig::default_for("minikube", "v1.24.0");
        let flags = kubelet_flags(&cc, &node(), &runtime("containerd", "v1.24.0"), true).unwrap();
        assert!(!flags.contains_key("network-plugin"));
    }

    #[test]
    fn dropin_wants_runtime_unit() {
        let cc = ClusterConfig::default_for("minikube", "v1.27.0");
        let rt = runtime("containerd", "v1.27.0");
        let flags = kubelet_flags(&cc, &node(), &rt, true).unwrap();
        let units = render_units("v1.27.0", &flags, &rt).unwrap();
        assert!(units.dropin.contains("Wants=containerd.service"));
        assert!(units.dropin.contains(
            "ExecStart=/var/lib/minikube/binaries/v1.27.0/kubelet --bootstrap-kubeconfig="
        ));
        assert!(units.dropin.contains(
            "--container-runtime=remote --container-runtime-endpoint=unix:///run/containerd/containerd.sock"
        ));
        assert!(units.service.contains("Restart=always"));
        assert!(units.service.contains("RestartSec=600ms"));
    }

    #[tokio::test]
    async fn systemd_units_are_written() {
        let runner = FakeRunner::new();
        let rt = runtime("docker", "v1.23.0");
        let cc = ClusterConfig::default_for("minikube", "v1.23.0");
        let units = render_units("v1.23.0", &kubelet_flags(&cc, &node(), &rt, false).unwrap(), &rt)
            .unwrap();
        write_units(&runner, InitSystem::Systemd, &units).await.unwrap();
        assert!(runner.has_file(KUBELET_SYSTEMD_DROPIN));
        assert!(runner.has_file(KUBELET_SERVICE_FILE));
        assert!(!runner.has_file(KUBELET_INIT_SCRIPT));
        assert_eq!(runner.commands_containing("daemon-reload").len(), 1);
    }

    #[tokio::test]
    async fn sysv_units_are_written() {
        let runner = FakeRunner::new().with_sysv();
        let rt = runtime("crio", "v1.23.0");
        let cc = ClusterConfig::default_for("minikube", "v1.23.0");
        let units = render_units("v1.23.0", &kubelet_flags(&cc, &node(), &rt, true).unwrap(), &rt)
            .unwrap();
        write_units(&runner, InitSystem::SysV, &units).await.unwrap();
        let script = runner.file(KUBELET_INIT_SCRIPT).unwrap();
        assert_eq!(script.permissions, "0755");
        let script = String::from_utf8(script.contents).unwrap();
        assert!(script.contains("start-stop-daemon"));
        assert!(script.contains(KUBELET_SYSTEMD_DROPIN));
        assert!(runner.has_file(SYSV_RESTART_WRAPPER));
        assert!(runner.has_file(KUBELET_SYSTEMD_DROPIN));
    }

    #[tokio::test]
    async fn stop_waits_for_dead() {
        let runner = FakeRunner::new();
        runner.set_active(KUBELET, true);
        stop_kubelet(&runner, InitSystem::Systemd).await.unwrap();
        assert!(!runner.is_active(KUBELET));
    }
}
