use std::path::PathBuf;

use async_trait::async_trait;
use command_runner::{Asset, Runner};
use serde_json::json;
use tracing::info;

use super::{CniConfig, CniManager};
use crate::constants::{cni_manifest_path, split_guest_path, CNI_CONF_DIR, FAKE_CNI_CONF};
use crate::cruntime::Runtime;
use crate::reconcile::apply_manifest;

/// A CNI manifest supplied by the user.
#[derive(Clone, Debug)]
pub struct Custom {
    manifest: PathBuf,
    config: CniConfig,
}

impl Custom {
    /// `manifest` is a path on the machine running the bootstrapper.
    pub fn new(manifest: impl Into<PathBuf>, config: CniConfig) -> Custom {
        Custom {
            manifest: manifest.into(),
            config,
        }
    }
}

/// A loopback config so the runtime reports its network ready before the
/// custom CNI has written its own.
fn fake_conf() -> anyhow::Result<Vec<u8>> {
    Ok(serde_json::to_vec_pretty(&json!({
        "cniVersion": "0.3.1",
        "name": "minikube-fake",
        "type": "loopback",
    }))?)
}

#[async_trait]
impl CniManager for Custom {
    fn name(&self) -> &'static str {
        "custom"
    }

    fn cidr(&self) -> String {
        self.config.cidr()
    }

    async fn apply(&self, runner: &dyn Runner, runtime: &Runtime) -> anyhow::Result<()> {
        let path = cni_manifest_path();
        let (dir, name) = split_guest_path(&path);
        let manifest = Asset::from_file(&self.manifest, dir, name, "0644").await?;

        runner
            .copy(&Asset::from_bytes(fake_conf()?, CNI_CONF_DIR, FAKE_CNI_CONF, "0644")?)
            .await?;
        let manager = runtime.manager();
        info!(runtime = manager.name(), "restarting runtime to pick up CNI config");
        manager.config().services(runner).restart(manager.service()).await?;

        runner.copy(&manifest).await?;
        apply_manifest(runner, &self.config.kubernetes_version, &path).await
    }
}
