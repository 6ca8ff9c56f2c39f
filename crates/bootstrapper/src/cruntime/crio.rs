use std::collections::BTreeMap;

use async_trait::async_trait;
use command_runner::sysinit::CRIO;
use command_runner::{Cmd, Runner};
use tracing::debug;

use super::{
    cri_kubelet_options, crictl, crictl_log_cmd, enable_ip_forwarding, populate_crictl_config,
    Manager, RuntimeConfig,
};
use crate::constants::{CRIO_CONFIG, CRIO_SOCKET};
use crate::images::pause_image;

/// CRI-O, or any CRI runtime reached through a user-supplied socket.
#[derive(Clone, Debug)]
pub struct CriO {
    config: RuntimeConfig,
}

impl CriO {
    /// Creates the runtime.
    pub fn new(config: RuntimeConfig) -> Self {
        CriO { config }
    }

    async fn set_pause_image(&self, runner: &dyn Runner) -> anyhow::Result<()> {
        let image = pause_image(&self.config.image_repository, &self.config.kubernetes_version);
        let script = format!(
            "sudo sed -i 's|^.*pause_image = .*$|pause_image = \"{}\"|' {}",
            image, CRIO_CONFIG
        );
        runner.run_cmd(Cmd::shell(script)).await?;
        Ok(())
    }
}

#[async_trait]
impl Manager for CriO {
    fn name(&self) -> &'static str {
        "CRI-O"
    }

    fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    fn service(&self) -> &'static str {
        CRIO
    }

    fn binary(&self) -> &'static str {
        "crio"
    }

    fn socket_path(&self) -> String {
        self.config
            .socket
            .clone()
            .unwrap_or_else(|| CRIO_SOCKET.to_string())
    }

    fn kubelet_options(&self) -> BTreeMap<String, String> {
        cri_kubelet_options(&self.socket_path())
    }

    async fn prepare(&self, runner: &dyn Runner) -> anyhow::Result<()> {
        populate_crictl_config(runner, &self.socket_path()).await?;
        self.set_pause_image(runner).await?;
        enable_ip_forwarding(runner).await
    }

    async fn load_image(&self, runner: &dyn Runner, path: &str) -> anyhow::Result<()> {
        runner
            .run_cmd(Cmd::new("sudo").args(["podman", "load", "-i", path]))
            .await?;
        Ok(())
    }

    async fn cgroup_driver(&self, runner: &dyn Runner) -> anyhow::Result<String> {
        let res = runner
            .run_cmd(Cmd::new("sudo").args(["crio", "config"]))
            .await;
        Ok(match res {
            Ok(r) => r
                .stdout_str()
                .lines()
                .map(str::trim)
                .find_map(|l| l.strip_prefix("cgroup_manager = "))
                .map(|v| v.trim_matches('"').to_string())
                .unwrap_or_else(|| self.config.cgroup_driver.clone()),
            Err(e) => {
                debug!(error = %e, "crio config unavailable");
                self.config.cgroup_driver.clone()
            }
        })
    }

    async fn version(&self, runner: &dyn Runner) -> anyhow::Result<String> {
        let res = runner.run_cmd(Cmd::new("crio").arg("--version")).await?;
        // crio version 1.22.0
        Ok(res
            .stdout_str()
            .lines()
            .find_map(|l| {
                l.strip_prefix("crio version ")
                    .or_else(|| l.strip_prefix("Version:"))
            })
            .map(|v| v.trim().to_string())
            .unwrap_or_default())
    }

    async fn image_exists(&self, runner: &dyn Runner, image: &str, sha: &str) -> bool {
        match runner
            .run_cmd(Cmd::new("sudo").args(["podman", "image", "inspect", "--format", "{{.Id}}", image]))
            .await
        {
            Ok(res) => res.stdout_str().contains(sha),
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

#[cfg(test)]
mod test {
    use super::*;
    use crate::constants::CRICTL_CONFIG;
    use crate::cruntime::test::config;
    use command_runner::fake::FakeRunner;

    #[tokio::test]
    async fn prepare_points_crictl_and_pause_image() {
        let runner = FakeRunner::new();
        CriO::new(config("v1.23.0")).prepare(&runner).await.unwrap();

        assert_eq!(
            runner.file_string(CRICTL_CONFIG).unwrap(),
            "runtime-endpoint: unix:///var/run/crio/crio.sock\nimage-endpoint: unix:///var/run/crio/crio.sock\n"
        );
        let sed = runner.commands_containing("pause_image");
        assert_eq!(sed.len(), 1);
        assert!(sed[0].contains("k8s.gcr.io/pause:3.6"));
        assert!(runner
            .commands_containing("modprobe br_netfilter")
            .first()
            .is_some());
    }

    #[tokio::test]
    async fn missing_br_netfilter_is_not_fatal() {
        let runner = FakeRunner::new();
        runner.set_response("sudo modprobe br_netfilter", "", 1);
        CriO::new(config("v1.23.0")).prepare(&runner).await.unwrap();
        assert_eq!(runner.commands_containing("ip_forward").len(), 1);
    }

    #[tokio::test]
    async fn cgroup_manager_is_read_from_crio_config() {
        let runner = FakeRunner::new();
        runner.set_response("sudo crio config", "[crio.runtime]\ncgroup_manager = \"systemd\"\n", 0);
        let driver = CriO::new(config("v1.23.0")).cgroup_driver(&runner).await.unwrap();
        assert_eq!(driver, "systemd");
    }

    #[tokio::test]
    async fn loads_images_with_podman() {
        let runner = FakeRunner::new();
        CriO::new(config("v1.23.0"))
            .load_image(&runner, "/var/lib/minikube/images/pause_3.6")
            .await
            .unwrap();
        assert_eq!(
            runner.commands(),
            vec!["sudo podman load -i /var/lib/minikube/images/pause_3.6"]
        );
    }
}
