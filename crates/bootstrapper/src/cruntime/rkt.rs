use std::collections::BTreeMap;

use async_trait::async_trait;
use command_runner::sysinit::{RKT, RKT_API, RKT_METADATA};
use command_runner::{Cmd, Runner};

use super::{Manager, RuntimeConfig};

/// rkt, driven through its API and metadata services.
#[derive(Clone, Debug)]
pub struct Rkt {
    config: RuntimeConfig,
}

impl Rkt {
    /// Creates the runtime.
    pub fn new(config: RuntimeConfig) -> Self {
        Rkt { config }
    }
}

#[async_trait]
impl Manager for Rkt {
    fn name(&self) -> &'static str {
        "rkt"
    }

    fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    fn service(&self) -> &'static str {
        RKT_API
    }

    fn binary(&self) -> &'static str {
        RKT
    }

    fn socket_path(&self) -> String {
        self.config.socket.clone().unwrap_or_default()
    }

    fn kubelet_options(&self) -> BTreeMap<String, String> {
        let mut opts = BTreeMap::new();
        opts.insert("container-runtime".to_string(), "rkt".to_string());
        opts
    }

    async fn prepare(&self, _runner: &dyn Runner) -> anyhow::Result<()> {
        Ok(())
    }

    async fn start(&self, runner: &dyn Runner) -> anyhow::Result<()> {
        let svc = self.config.services(runner);
        svc.restart(RKT_API).await?;
        svc.restart(RKT_METADATA).await
    }

    async fn stop(&self, runner: &dyn Runner) -> anyhow::Result<()> {
        let svc = self.config.services(runner);
        svc.stop(RKT_API).await?;
        svc.stop(RKT_METADATA).await
    }

    async fn load_image(&self, runner: &dyn Runner, path: &str) -> anyhow::Result<()> {
        runner
            .run_cmd(Cmd::new("sudo").args(["rkt", "fetch", "--insecure-options=image", path]))
            .await?;
        Ok(())
    }

    async fn cgroup_driver(&self, _runner: &dyn Runner) -> anyhow::Result<String> {
        Ok(self.config.cgroup_driver.clone())
    }

    async fn version(&self, runner: &dyn Runner) -> anyhow::Result<String> {
        let res = runner.run_cmd(Cmd::new("rkt").arg("version")).await?;
        Ok(res
            .stdout_str()
            .lines()
            .find_map(|l| l.strip_prefix("rkt Version:"))
            .map(|v| v.trim().to_string())
            .unwrap_or_default())
    }

    async fn image_exists(&self, runner: &dyn Runner, image: &str, _sha: &str) -> bool {
        match runner
            .run_cmd(Cmd::new("sudo").args(["rkt", "image", "list", "--no-legend"]))
            .await
        {
            Ok(res) => res.stdout_str().contains(image),
            Err(_) => false,
        }
    }

    async fn list_containers(
        &self,
        runner: &dyn Runner,
        _namespaces: &[String],
    ) -> anyhow::Result<Vec<String>> {
        let res = runner
            .run_cmd(Cmd::new("sudo").args(["rkt", "list", "--no-legend", "--full"]))
            .await?;
        Ok(res
            .stdout_str()
            .lines()
            .filter_map(|l| l.split_whitespace().next())
            .map(String::from)
            .collect())
    }

    async fn kill_containers(&self, runner: &dyn Runner, ids: &[String]) -> anyhow::Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        runner
            .run_cmd(Cmd::new("sudo").args(["rkt", "rm"]).args(ids.iter().cloned()))
            .await?;
        Ok(())
    }

    async fn stop_containers(&self, runner: &dyn Runner, ids: &[String]) -> anyhow::Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        runner
            .run_cmd(Cmd::new("sudo").args(["rkt", "stop"]).args(ids.iter().cloned()))
            .await?;
        Ok(())
    }

    fn container_log_cmd(&self, id: &str, len: Option<u32>, follow: bool) -> String {
        let mut cmd = format!("sudo journalctl -M rkt-{}", id);
        if let Some(n) = len {
            cmd.push_str(&format!(" -n {}", n));
        }
        if follow {
            cmd.push_str(" -f");
        }
        cmd
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cruntime::test::config;
    use command_runner::fake::FakeRunner;

    #[tokio::test]
    async fn start_and_stop_both_services() {
        let runner = FakeRunner::new();
        let rkt = Rkt::new(config("v1.10.0"));
        rkt.start(&runner).await.unwrap();
        assert!(runner.is_active(RKT_API));
        assert!(runner.is_active(RKT_METADATA));
        assert!(rkt.active(&runner).await);
        rkt.stop(&runner).await.unwrap();
        assert!(runner.active_services().is_empty());
    }

    #[test]
    fn kubelet_flags() {
        assert_eq!(
            Rkt::new(config("v1.10.0")).kubelet_options()["container-runtime"],
            "rkt"
        );
    }
}
