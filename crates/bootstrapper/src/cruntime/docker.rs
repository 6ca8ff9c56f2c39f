use std::collections::BTreeMap;

use async_trait::async_trait;
use command_runner::sysinit::DOCKER;
use command_runner::{Asset, Cmd, Runner};
use serde_json::json;
use tracing::{info, instrument};

use super::{Manager, RuntimeConfig};
use crate::constants::{split_guest_path, DOCKER_DAEMON_CONFIG, DOCKER_SOCKET};
use crate::storage::ReferenceStore;

const DOCKER_SOCKET_UNIT: &str = "docker.socket";

/// Docker, with kubelet talking to it through dockershim.
#[derive(Clone, Debug)]
pub struct Docker {
    config: RuntimeConfig,
}

impl Docker {
    /// Creates the runtime.
    pub fn new(config: RuntimeConfig) -> Self {
        Docker { config }
    }

    /// The `daemon.json` written before Docker starts.
    pub fn daemon_config(&self) -> anyhow::Result<String> {
        let mut cfg = json!({
            "exec-opts": [format!("native.cgroupdriver={}", self.config.cgroup_driver)],
            "log-driver": "json-file",
            "log-opts": { "max-size": "100m" },
            "storage-driver": "overlay2",
        });
        if !self.config.insecure_registries.is_empty() {
            cfg["insecure-registries"] = json!(self.config.insecure_registries);
        }
        Ok(serde_json::to_string_pretty(&cfg)?)
    }

    /// Extracts a preloaded image tarball into `/var`, keeping every image
    /// the daemon already knew about, then restarts Docker.
    #[instrument(level = "info", skip(self, runner))]
    pub async fn preload(&self, runner: &dyn Runner, tarball: &str) -> anyhow::Result<()> {
        let store = ReferenceStore::new();
        store.save(runner).await?;
        runner
            .run_cmd(Cmd::new("sudo").args(["tar", "-I", "lz4", "-C", "/var", "-xf", tarball]))
            .await?;
        store.save(runner).await?;
        store.update(runner).await?;
        runner
            .run_cmd(Cmd::new("sudo").args(["rm", "-f", tarball]))
            .await?;
        info!(tarball, "preloaded images extracted");
        self.config.services(runner).restart(DOCKER).await
    }
}

#[async_trait]
impl Manager for Docker {
    fn name(&self) -> &'static str {
        "Docker"
    }

    fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    fn service(&self) -> &'static str {
        DOCKER
    }

    fn binary(&self) -> &'static str {
        "docker"
    }

    fn socket_path(&self) -> String {
        self.config
            .socket
            .clone()
            .unwrap_or_else(|| DOCKER_SOCKET.to_string())
    }

    fn kubelet_options(&self) -> BTreeMap<String, String> {
        let mut opts = BTreeMap::new();
        opts.insert("container-runtime".to_string(), "docker".to_string());
        opts
    }

    async fn prepare(&self, runner: &dyn Runner) -> anyhow::Result<()> {
        let (dir, name) = split_guest_path(DOCKER_DAEMON_CONFIG);
        runner
            .copy(&Asset::from_bytes(self.daemon_config()?, dir, name, "0644")?)
            .await
    }

    async fn start(&self, runner: &dyn Runner) -> anyhow::Result<()> {
        let svc = self.config.services(runner);
        svc.unmask(DOCKER).await?;
        svc.enable(DOCKER_SOCKET_UNIT).await?;
        svc.restart(DOCKER).await
    }

    /// Stops the socket first, otherwise socket activation brings the daemon
    /// straight back.
    async fn stop(&self, runner: &dyn Runner) -> anyhow::Result<()> {
        let svc = self.config.services(runner);
        svc.force_stop(DOCKER_SOCKET_UNIT).await?;
        svc.force_stop(DOCKER).await?;
        svc.disable(DOCKER_SOCKET_UNIT).await?;
        svc.mask(DOCKER).await
    }

    async fn load_image(&self, runner: &dyn Runner, path: &str) -> anyhow::Result<()> {
        runner
            .run_cmd(Cmd::new("docker").args(["load", "-i", path]))
            .await?;
        Ok(())
    }

    async fn cgroup_driver(&self, runner: &dyn Runner) -> anyhow::Result<String> {
        let res = runner
            .run_cmd(Cmd::new("docker").args(["info", "--format", "{{.CgroupDriver}}"]))
            .await?;
        let driver = res.stdout_str().trim().to_string();
        if driver.is_empty() {
            return Ok(self.config.cgroup_driver.clone());
        }
        Ok(driver)
    }

    async fn version(&self, runner: &dyn Runner) -> anyhow::Result<String> {
        let res = runner
            .run_cmd(Cmd::new("docker").args(["version", "--format", "{{.Server.Version}}"]))
            .await?;
        Ok(res.stdout_str().trim().to_string())
    }

    async fn image_exists(&self, runner: &dyn Runner, image: &str, sha: &str) -> bool {
        match runner
            .run_cmd(Cmd::new("docker").args(["image", "inspect", "--format", "{{.Id}}", image]))
            .await
        {
            Ok(res) => res.stdout_str().contains(sha),
            Err(_) => false,
        }
    }

    async fn list_containers(
        &self,
        runner: &dyn Runner,
        namespaces: &[String],
    ) -> anyhow::Result<Vec<String>> {
        let mut cmd = Cmd::new("docker").args(["ps", "-a", "--format", "{{.ID}}"]);
        if namespaces.is_empty() {
            cmd = cmd.args(["--filter", "name=k8s_"]);
        }
        for ns in namespaces {
            cmd = cmd.arg("--filter").arg(format!("label=io.kubernetes.pod.namespace={}", ns));
        }
        let res = runner.run_cmd(cmd).await?;
        Ok(res
            .stdout_str()
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    async fn kill_containers(&self, runner: &dyn Runner, ids: &[String]) -> anyhow::Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        runner
            .run_cmd(Cmd::new("docker").args(["rm", "-f"]).args(ids.iter().cloned()))
            .await?;
        Ok(())
    }

    async fn stop_containers(&self, runner: &dyn Runner, ids: &[String]) -> anyhow::Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        runner
            .run_cmd(Cmd::new("docker").arg("stop").args(ids.iter().cloned()))
            .await?;
        Ok(())
    }

    fn container_log_cmd(&self, id: &str, len: Option<u32>, follow: bool) -> String {
        let mut cmd = "docker logs".to_string();
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
}
