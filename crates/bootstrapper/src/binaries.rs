//! Transfer of the version-pinned Kubernetes binaries to the host.

use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use command_runner::{Asset, Cmd, Runner};
use futures::future::try_join_all;
use tracing::{debug, info, instrument};

use crate::constants::{binary_root, KUBERNETES_BINARIES};
use crate::error::BootstrapError;
use crate::versions::version_tag;

/// The Kubernetes name for the architecture this binary was built for.
pub fn host_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "arm" => "arm",
        "powerpc64" => "ppc64le",
        "s390x" => "s390x",
        other => other,
    }
}

/// Somewhere Kubernetes binaries can be found locally.
#[async_trait]
pub trait BinaryCache: Send + Sync {
    /// Returns a local path to `name` for `version` on `linux/<arch>`.
    async fn cache_binary(&self, name: &str, version: &str, arch: &str) -> anyhow::Result<PathBuf>;
}

/// A cache laid out as `<root>/linux/<arch>/<version>/<name>`.
#[derive(Clone, Debug)]
pub struct DirectoryCache {
    root: PathBuf,
}

impl DirectoryCache {
    /// A cache rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        DirectoryCache { root: root.into() }
    }

    /// Where `name` would live in the cache. The version directory is always
    /// `v`-prefixed.
    pub fn path_for(&self, name: &str, version: &str, arch: &str) -> PathBuf {
        self.root
            .join("linux")
            .join(arch)
            .join(version_tag(version))
            .join(name)
    }

    /// The cache root.
    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl BinaryCache for DirectoryCache {
    async fn cache_binary(&self, name: &str, version: &str, arch: &str) -> anyhow::Result<PathBuf> {
        let path = self.path_for(name, version, arch);
        match tokio::fs::metadata(&path).await {
            Ok(m) if m.is_file() => Ok(path),
            _ => Err(BootstrapError::Transfer {
                path: path.display().to_string(),
                reason: format!("{} {} is not in the binary cache", name, version),
            }
            .into()),
        }
    }
}

/// Reports whether kubeadm, kubelet and kubectl are already on the host.
pub async fn binaries_exist(runner: &dyn Runner, version: &str) -> bool {
    let dir = binary_root(version);
    match runner.run_cmd(Cmd::new("sudo").args(["ls", &dir])).await {
        Ok(res) => {
            let out = res.stdout_str();
            let present: Vec<&str> = out.split_whitespace().collect();
            KUBERNETES_BINARIES.iter().all(|b| present.contains(b))
        }
        Err(_) => false,
    }
}

async fn transfer_one(
    runner: &dyn Runner,
    cache: &dyn BinaryCache,
    name: &str,
    version: &str,
    arch: &str,
) -> anyhow::Result<()> {
    let src = cache.cache_binary(name, version, arch).await?;
    let asset = Asset::from_file(&src, binary_root(version), name, "0755")
        .await
        .with_context(|| format!("reading cached {}", src.display()))?;
    runner.copy(&asset).await.map_err(|e| {
        anyhow::Error::new(BootstrapError::Transfer {
            path: asset.target_path(),
            reason: e.to_string(),
        })
    })?;
    debug!(name, version, "binary transferred");
    Ok(())
}

/// Copies the three binaries to the host concurrently. Returns the first
/// failure; the remaining transfers are dropped.
#[instrument(level = "info", skip(runner, cache))]
pub async fn transfer_binaries(
    runner: &dyn Runner,
    cache: &dyn BinaryCache,
    version: &str,
    arch: &str,
) -> anyhow::Result<()> {
    if binaries_exist(runner, version).await {
        info!(version, "binaries already present");
        return Ok(());
    }
    try_join_all(
        KUBERNETES_BINARIES
            .iter()
            .map(|name| transfer_one(runner, cache, name, version, arch)),
    )
    .await?;
    Ok(())
}
