//! Docker's image reference store (`repositories.json`).
//!
//! Extracting a preloaded image tarball into `/var` overwrites the store with
//! the tarball's copy, forgetting every image the daemon already knew about.
//! [`ReferenceStore`] snapshots the file before and after the extraction and
//! writes back the merge of all snapshots.

use std::collections::BTreeMap;

use anyhow::Context;
use command_runner::{Asset, Runner};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use crate::constants::{split_guest_path, DOCKER_REPOSITORIES_JSON};

/// `repository -> (reference -> image id)`.
pub type Repositories = BTreeMap<String, BTreeMap<String, String>>;

/// The on-disk shape of `repositories.json`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoriesFile {
    /// Every known repository.
    #[serde(rename = "Repositories", default)]
    pub repositories: Repositories,
}

/// Merges snapshots in order. For each `(repository, reference)` the last
/// snapshot that mentions it wins.
pub fn merge(snapshots: &[Repositories]) -> Repositories {
    let mut merged = Repositories::new();
    for snapshot in snapshots {
        for (repo, refs) in snapshot {
            let entry = merged.entry(repo.clone()).or_default();
            for (reference, id) in refs {
                entry.insert(reference.clone(), id.clone());
            }
        }
    }
    merged
}

/// Snapshots of a host's `repositories.json`.
#[derive(Debug, Default)]
pub struct ReferenceStore {
    snapshots: Mutex<Vec<Repositories>>,
}

impl ReferenceStore {
    /// An empty store.
    pub fn new() -> Self {
        ReferenceStore::default()
    }

    /// Reads the host's `repositories.json` into a new snapshot. A missing
    /// file counts as an empty snapshot.
    #[instrument(level = "debug", skip(self, runner))]
    pub async fn save(&self, runner: &dyn Runner) -> anyhow::Result<()> {
        let repos = read(runner).await?;
        self.snapshots.lock().await.push(repos);
        Ok(())
    }

    /// Writes the merge of every snapshot back to the host. With fewer than
    /// two snapshots there is nothing to merge and nothing is written.
    #[instrument(level = "debug", skip(self, runner))]
    pub async fn update(&self, runner: &dyn Runner) -> anyhow::Result<()> {
        let snapshots = self.snapshots.lock().await;
        if snapshots.len() < 2 {
            debug!(snapshots = snapshots.len(), "nothing to merge");
            return Ok(());
        }
        let file = RepositoriesFile {
            repositories: merge(&snapshots),
        };
        let contents = serde_json::to_vec(&file)?;
        let (dir, name) = split_guest_path(DOCKER_REPOSITORIES_JSON);
        runner
            .copy(&Asset::from_bytes(contents, dir, name, "0644")?)
            .await
            .context("writing merged repositories.json")
    }

    /// How many snapshots have been taken.
    pub async fn len(&self) -> usize {
        self.snapshots.lock().await.len()
    }

    /// Reports whether no snapshot has been taken.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

async fn read(runner: &dyn Runner) -> anyhow::Result<Repositories> {
    let file = match runner.readable_file(DOCKER_REPOSITORIES_JSON).await {
        Ok(f) => f,
        Err(e) => {
            debug!(error = %e, "no repositories.json yet");
            return Ok(Repositories::new());
        }
    };
    let contents = file.read_all().await?;
    if contents.iter().all(u8::is_ascii_whitespace) {
        return Ok(Repositories::new());
    }
    let parsed: RepositoriesFile =
        serde_json::from_slice(&contents).context("parsing repositories.json")?;
    Ok(parsed.repositories)
}

#[cfg(test)]
mod test {
    use super::*;
    use command_runner::fake::FakeRunner;

    fn repos(entries: &[(&str, &str, &str)]) -> Repositories {
        let mut r = Repositories::new();
        for (repo, reference, id) in entries {
            r.entry(repo.to_string())
                .or_default()
                .insert(reference.to_string(), id.to_string());
        }
        r
    }

    #[test]
    fn last_writer_wins() {
        let a = repos(&[("busybox", "busybox:latest", "sha256:aaa")]);
        let b = repos(&[
            ("busybox", "busybox:latest", "sha256:bbb"),
            ("busybox", "busybox:1.34", "sha256:ccc"),
        ]);
        let merged = merge(&[a, b]);
        assert_eq!(merged["busybox"]["busybox:latest"], "sha256:bbb");
        assert_eq!(merged["busybox"]["busybox:1.34"], "sha256:ccc");
    }

    #[test]
    fn disjoint_merge_is_associative() {
        let a = repos(&[("a", "a:1", "sha256:1")]);
        let b = repos(&[("b", "b:1", "sha256:2")]);
        let c = repos(&[("c", "c:1", "sha256:3")]);
        let left = merge(&[merge(&[a.clone(), b.clone()]), c.clone()]);
        let right = merge(&[a, merge(&[b, c])]);
        assert_eq!(left, right);
    }

    #[tokio::test]
    async fn single_snapshot_update_writes_nothing() {
        let runner = FakeRunner::new();
        let store = ReferenceStore::new();
        store.save(&runner).await.unwrap();
        store.update(&runner).await.unwrap();
        assert!(!runner.has_file(DOCKER_REPOSITORIES_JSON));
    }

    #[tokio::test]
    async fn update_restores_forgotten_images() {
        let runner = FakeRunner::new();
        runner.put_file(
            DOCKER_REPOSITORIES_JSON,
            r#"{"Repositories":{"nginx":{"nginx:latest":"sha256:111"}}}"#,
        );
        let store = ReferenceStore::new();
        store.save(&runner).await.unwrap();

        runner.put_file(
            DOCKER_REPOSITORIES_JSON,
            r#"{"Repositories":{"k8s.gcr.io/pause":{"k8s.gcr.io/pause:3.6":"sha256:222"}}}"#,
        );
        store.save(&runner).await.unwrap();
        store.update(&runner).await.unwrap();

        let written: RepositoriesFile =
            serde_json::from_str(&runner.file_string(DOCKER_REPOSITORIES_JSON).unwrap()).unwrap();
        assert_eq!(written.repositories["nginx"]["nginx:latest"], "sha256:111");
        assert_eq!(
            written.repositories["k8s.gcr.io/pause"]["k8s.gcr.io/pause:3.6"],
            "sha256:222"
        );
    }
}
