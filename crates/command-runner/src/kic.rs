//! A runner that drives a container through the OCI CLI (`docker` or
//! `podman`), as the container drivers do.

use anyhow::Context;
use async_trait::async_trait;
use tracing::{debug, warn};

use crate::assets::{Asset, AssetSource};
use crate::command::{
    parse_stat, touch_time, Cmd, ReadableFile, RunError, RunResult, Runner,
    StartedCmd, STAT_FORMAT,
};
use crate::exec::execute;

/// Runs commands inside a container with `<oci> exec`.
#[derive(Clone, Debug)]
pub struct KicRunner {
    oci_binary: String,
    container: String,
    privileged: bool,
}

impl KicRunner {
    /// Creates a runner for `container` driven by `oci_binary`.
    pub fn new(oci_binary: impl Into<String>, container: impl Into<String>) -> Self {
        KicRunner {
            oci_binary: oci_binary.into(),
            container: container.into(),
            privileged: true,
        }
    }

    /// Sets whether commands run with `--privileged`.
    pub fn privileged(mut self, privileged: bool) -> Self {
        self.privileged = privileged;
        self
    }

    /// The OCI binary in use.
    pub fn oci_binary(&self) -> &str {
        &self.oci_binary
    }

    /// The container commands run in.
    pub fn container(&self) -> &str {
        &self.container
    }

    /// Wraps `cmd` in an `exec` invocation against the container.
    pub fn wrap(&self, cmd: Cmd) -> Cmd {
        let mut args = vec!["exec".to_string()];
        if self.privileged {
            args.push("--privileged".to_string());
        }
        if cmd.stdin_bytes().is_some() {
            args.push("-i".to_string());
        }
        if cmd.is_tty() {
            args.push("-t".to_string());
        }
        if let Some(dir) = cmd.working_dir() {
            args.push("-w".to_string());
            args.push(dir.to_string_lossy().into_owned());
        }
        for (k, v) in cmd.envs() {
            args.push("-e".to_string());
            args.push(format!("{}={}", k, v));
        }
        args.push(self.container.clone());
        args.extend(cmd.argv());
        let program = self.oci_binary.clone();
        cmd.rewrap(program, args)
    }

    fn host(&self, args: &[&str]) -> Cmd {
        Cmd::new(self.oci_binary.clone()).args(args.iter().copied())
    }
}

#[async_trait]
impl Runner for KicRunner {
    async fn run_cmd(&self, cmd: Cmd) -> Result<RunResult, RunError> {
        execute(self.wrap(cmd)).await
    }

    async fn start_cmd(&self, cmd: Cmd) -> Result<StartedCmd, RunError> {
        let wrapped = self.wrap(cmd);
        Ok(StartedCmd::spawn(wrapped.to_string(), execute(wrapped)))
    }

    async fn copy(&self, asset: &Asset) -> anyhow::Result<()> {
        if asset.length() == 0 {
            warn!(target = %asset.target_path(), "copying zero-byte asset");
        }
        let target = asset.target_path();
        self.run_cmd(Cmd::new("sudo").args(["mkdir", "-p", asset.target_dir()]))
            .await
            .with_context(|| format!("unable to create {}", asset.target_dir()))?;

        // `<oci> cp` needs a local path, so memory assets are staged first.
        let mut staged = None;
        let source = match asset.source() {
            AssetSource::File(p) => p.clone(),
            AssetSource::Memory(bytes) => {
                let mut tmp = tempfile::NamedTempFile::new()?;
                std::io::Write::write_all(&mut tmp, bytes)?;
                let path = tmp.path().to_path_buf();
                debug!(staged = ?path, "staged memory asset");
                staged = Some(tmp);
                path
            }
        };
        let dest = format!("{}:{}", self.container, target);
        let source = source.to_string_lossy().into_owned();
        execute(self.host(&["cp", source.as_str(), dest.as_str()]))
            .await
            .with_context(|| format!("unable to copy to {}", dest))?;
        drop(staged);

        self.run_cmd(Cmd::new("sudo").args(["chmod", asset.octal_mode().as_str(), target.as_str()]))
            .await?;
        if let Some(modtime) = asset.modtime() {
            self.run_cmd(Cmd::new("sudo").args(["touch", "-d", touch_time(modtime).as_str(), target.as_str()]))
                .await?;
        }
        Ok(())
    }

    async fn remove(&self, asset: &Asset) -> anyhow::Result<()> {
        let target = asset.target_path();
        self.run_cmd(Cmd::new("sudo").args(["rm", "-f", target.as_str()]))
            .await
            .with_context(|| format!("unable to remove {}", target))?;
        Ok(())
    }

    async fn readable_file(&self, path: &str) -> anyhow::Result<ReadableFile> {
        let stat = self
            .run_cmd(Cmd::new("sudo").args(["stat", "-c", STAT_FORMAT, path]))
            .await?;
        let (perms, length, modtime) = parse_stat(&stat.stdout_str())
            .with_context(|| format!("unexpected stat output for {}", path))?;
        let contents = self.run_cmd(Cmd::new("sudo").args(["cat", path])).await?;
        Ok(ReadableFile::new(
            path,
            perms,
            length,
            modtime,
            Box::new(std::io::Cursor::new(contents.stdout)),
        ))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn wraps_commands_in_exec() {
        let runner = KicRunner::new("docker", "minikube");
        let wrapped = runner.wrap(Cmd::new("sudo").args(["systemctl", "restart", "docker"]));
        assert_eq!(
            wrapped.argv(),
            vec![
                "docker", "exec", "--privileged", "minikube", "sudo", "systemctl", "restart",
                "docker"
            ]
        );
    }

    #[test]
    fn adds_interactive_dir_and_env() {
        let runner = KicRunner::new("podman", "mk").privileged(false);
        let wrapped = runner.wrap(
            Cmd::new("cat")
                .stdin("x")
                .dir("/var/tmp")
                .env("A", "1")
                .env("B", "2"),
        );
        assert_eq!(
            wrapped.argv(),
            vec!["podman", "exec", "-i", "-w", "/var/tmp", "-e", "A=1", "-e", "B=2", "mk", "cat"]
        );
        assert_eq!(wrapped.stdin_bytes(), Some(&b"x"[..]));
    }

    #[test]
    fn terminal_is_requested_only_for_tty_callers() {
        let runner = KicRunner::new("docker", "mk");
        let mut cmd = Cmd::new("ls");
        cmd.tty = true;
        assert!(runner.wrap(cmd).argv().contains(&"-t".to_string()));
        assert!(!runner.wrap(Cmd::new("ls")).argv().contains(&"-t".to_string()));
    }
}
