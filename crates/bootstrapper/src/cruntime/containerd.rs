use std::collections::BTreeMap;

use async_trait::async_trait;
use command_runner::sysinit::CONTAINERD;
use command_runner::{Asset, Cmd, Runner};
use lazy_static::lazy_static;
use minijinja::context;
use regex::Regex;
use tracing::debug;

use super::{
    cri_kubelet_options, crictl, crictl_log_cmd, enable_ip_forwarding, populate_crictl_config,
    Manager, RuntimeConfig,
};
use crate::constants::{split_guest_path, CONTAINERD_CONFIG, CONTAINERD_SOCKET};
use crate::images::pause_image;
use crate::templates;

const CONFIG_TEMPLATE: &str = include_str!("../../templates/cruntime/containerd-config.toml");

/// Snapshotter used when the existing config does not name one.
pub const DEFAULT_SNAPSHOTTER: &str = "overlayfs";

lazy_static! {
    static ref SNAPSHOTTER: Regex =
        Regex::new(r#"(?m)^\s*snapshotter\s*=\s*["']([^"']+)["']"#).expect("valid regex");
}

/// Finds the snapshotter an existing containerd config uses. Handles the
/// single-quoted nested-table style of config v3, the double-quoted v1.7
/// style, and a bare `snapshotter = "..."` line.
pub fn parse_containerd_snapshotter(config: &str) -> String {
    SNAPSHOTTER
        .captures(config)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| DEFAULT_SNAPSHOTTER.to_string())
}

/// containerd with its built-in CRI plugin.
#[derive(Clone, Debug)]
pub struct Containerd {
    config: RuntimeConfig,
}

impl Containerd {
    /// Creates the runtime.
    pub fn new(config: RuntimeConfig) -> Self {
        Containerd { config }
    }

    /// Renders `config.toml`, keeping `snapshotter`.
    pub fn render_config(&self, snapshotter: &str) -> anyhow::Result<String> {
        templates::render(
            "containerd-config.toml",
            CONFIG_TEMPLATE,
            context! {
                sandbox_image => pause_image(&self.config.image_repository, &self.config.kubernetes_version),
                snapshotter => snapshotter,
                systemd_cgroup => self.config.cgroup_driver == "systemd",
                insecure_registries => &self.config.insecure_registries,
            },
        )
    }

    async fn existing_snapshotter(&self, runner: &dyn Runner) -> String {
        match runner
            .run_cmd(Cmd::new("sudo").args(["cat", CONTAINERD_CONFIG]))
            .await
        {
            Ok(res) => parse_containerd_snapshotter(&res.stdout_str()),
            Err(e) => {
                debug!(error = %e, "no existing containerd config");
                DEFAULT_SNAPSHOTTER.to_string()
            }
        }
    }
}

#[async_trait]
impl Manager for Containerd {
    fn name(&self) -> &'static str {
        "containerd"
    }

    fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    fn service(&self) -> &'static str {
        CONTAINERD
    }

    fn binary(&self) -> &'static str {
        "containerd"
    }

    fn socket_path(&self) -> String {
        self.config
            .socket
            .clone()
            .unwrap_or_else(|| CONTAINERD_SOCKET.to_string())
    }

    fn kubelet_options(&self) -> BTreeMap<String, String> {
        cri_kubelet_options(&self.socket_path())
    }

    async fn prepare(&self, runner: &dyn Runner) -> anyhow::Result<()> {
        let snapshotter = self.existing_snapshotter(runner).await;
        let rendered = self.render_config(&snapshotter)?;
        let (dir, name) = split_guest_path(CONTAINERD_CONFIG);
        runner
            .copy(&Asset::from_bytes(rendered, dir, name, "0644")?)
            .await?;
        populate_crictl_config(runner, &self.socket_path()).await?;
        enable_ip_forwarding(runner).await
    }

    /// containerd pulls images itself, so there is nothing to load.
    async fn load_image(&self, _runner: &dyn Runner, path: &str) -> anyhow::Result<()> {
        debug!(path, "image loading is a no-op for containerd");
        Ok(())
    }

    async fn cgroup_driver(&self, runner: &dyn Runner) -> anyhow::Result<String> {
        let res = runner
            .run_cmd(Cmd::new("sudo").args(["cat", CONTAINERD_CONFIG]))
            .await;
        Ok(match res {
            Ok(r) if r.stdout_str().contains("SystemdCgroup = true") => "systemd".to_string(),
            _ => self.config.cgroup_driver.clone(),
        })
    }

    async fn version(&self, runner: &dyn Runner) -> anyhow::Result<String> {
        let res = runner
            .run_cmd(Cmd::new("containerd").arg("--version"))
            .await?;
        // containerd containerd.io 1.6.8 9cd3357b7fd7218e4aec3eae239db1f68a5a6ec6
        let out = res.stdout_str();
        Ok(out
            .split_whitespace()
            .nth(2)
            .unwrap_or_else(|| out.trim())
            .to_string())
    }

    async fn image_exists(&self, runner: &dyn Runner, image: &str, sha: &str) -> bool {
        match runner
            .run_cmd(Cmd::new("sudo").args(["ctr", "-n=k8s.io", "images", "check"]))
            .await
        {
            Ok(res) => res
                .stdout_str()
                .lines()
                .any(|l| l.contains(image) && l.contains(sha)),
            Err(_) => false,
        }
    }

    async fn list_containers(
        &self,
        _runner: &dyn Runner,
        _namespaces: &[String],
    ) -> anyhow::Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn kill_containers(&self, runner: &dyn Runner, ids: &[String]) -> anyhow::Result<()> {
        crictl(runner, &["rm"], ids).await
    }

    async fn stop_containers(&self, runner: &dyn Runner, ids: &[String]) -> anyhow::Result<()> {
        crictl(runner, &["stop"], ids).await
    }

    fn container_log_cmd(&self, id: &str, len: Option<u32>, follow: bool) -> String {
        crictl_log_cmd(id, len, follow)
    }
}
