//! A runner that drives a VM over SSH.
//!
//! Sessions are multiplexed over one persistent control connection owned by
//! the system `ssh` client. The connection is opened lazily on first use,
//! with exponential backoff, and reopened after the transport drops.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::assets::Asset;
use crate::backoff::{retry, ExponentialBackoffStrategy};
use crate::command::{
    parse_stat, render_argv, shell_quote, touch_time, Cmd, ReadableFile, RunError, RunResult,
    Runner, StartedCmd, STAT_FORMAT,
};
use crate::exec::execute;

/// How long to keep trying to open the control connection.
pub const CONNECT_BUDGET: Duration = Duration::from_secs(60);

/// Files up to this size are always transferred.
pub const SKIP_CHECK_THRESHOLD: u64 = 2048;

/// ssh exits with this code when the transport itself failed.
const SSH_TRANSPORT_EXIT: i32 = 255;

/// Connection parameters for a guest.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SshTarget {
    /// Hostname or IP.
    pub host: String,
    /// Port sshd listens on.
    pub port: u16,
    /// Login user.
    pub user: String,
    /// Private key to authenticate with.
    pub key_path: PathBuf,
}

/// A persistent SSH client. Cheap to share behind an [`Arc`].
#[derive(Debug)]
pub struct SshClient {
    target: SshTarget,
    ssh_binary: String,
    control_dir: PathBuf,
    connected: Mutex<bool>,
}

impl SshClient {
    /// Creates a client. No connection is made until the first command.
    pub fn new(target: SshTarget) -> Self {
        SshClient {
            target,
            ssh_binary: "ssh".to_string(),
            control_dir: std::env::temp_dir(),
            connected: Mutex::new(false),
        }
    }

    /// Uses a different `ssh` binary.
    pub fn with_ssh_binary(mut self, binary: impl Into<String>) -> Self {
        self.ssh_binary = binary.into();
        self
    }

    /// The guest this client talks to.
    pub fn target(&self) -> &SshTarget {
        &self.target
    }

    /// Options shared by every invocation.
    pub fn base_args(&self) -> Vec<String> {
        let control_path = self.control_dir.join("mk-ssh-%C");
        let mut args: Vec<String> = [
            "-F",
            "/dev/null",
            "-o",
            "ConnectTimeout=10",
            "-o",
            "StrictHostKeyChecking=no",
            "-o",
            "UserKnownHostsFile=/dev/null",
            "-o",
            "LogLevel=quiet",
            "-o",
            "PasswordAuthentication=no",
            "-o",
            "IdentitiesOnly=yes",
            "-o",
            "ControlMaster=auto",
            "-o",
            "ControlPersist=10m",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        args.push("-o".to_string());
        args.push(format!("ControlPath={}", control_path.display()));
        args.push("-i".to_string());
        args.push(self.target.key_path.display().to_string());
        args.push("-p".to_string());
        args.push(self.target.port.to_string());
        args.push(format!("{}@{}", self.target.user, self.target.host));
        args
    }

    /// Opens the control connection if it is not open, retrying with
    /// backoff for up to [`CONNECT_BUDGET`].
    #[instrument(level = "debug", skip(self), fields(host = %self.target.host))]
    pub async fn connect(&self) -> Result<(), RunError> {
        let mut connected = self.connected.lock().await;
        if *connected {
            return Ok(());
        }
        let mut backoff = ExponentialBackoffStrategy::default();
        retry(&mut backoff, CONNECT_BUDGET, || {
            let probe = Cmd::new(self.ssh_binary.clone())
                .args(self.base_args())
                .arg("true");
            execute(probe)
        })
        .await?;
        info!(host = %self.target.host, port = self.target.port, "ssh connection established");
        *connected = true;
        Ok(())
    }

    /// Closes the control connection.
    pub async fn close(&self) {
        let mut connected = self.connected.lock().await;
        let mut args = self.base_args();
        let dest = args.pop().unwrap_or_default();
        let cmd = Cmd::new(self.ssh_binary.clone())
            .args(args)
            .args(["-O", "exit"])
            .arg(dest);
        if let Err(e) = execute(cmd).await {
            debug!(error = %e, "closing ssh control connection");
        }
        *connected = false;
    }

    async fn mark_disconnected(&self) {
        *self.connected.lock().await = false;
    }

    /// Builds the local `ssh` invocation for a remote command line.
    pub fn session_cmd(&self, cmd: Cmd) -> Cmd {
        let remote = remote_command_line(&cmd);
        let mut args = self.base_args();
        if cmd.is_tty() {
            args.insert(0, "-t".to_string());
        }
        args.push("--".to_string());
        args.push(remote);
        let program = self.ssh_binary.clone();
        cmd.rewrap(program, args)
    }

    /// Runs a command in a fresh session, stdin included.
    pub(crate) async fn session(&self, cmd: Cmd) -> Result<RunResult, RunError> {
        self.connect().await?;
        match execute(self.session_cmd(cmd)).await {
            Err(RunError::ExitStatus(result)) if result.exit_code == SSH_TRANSPORT_EXIT => {
                warn!(command = %result.command(), "ssh transport failed, will reconnect");
                self.mark_disconnected().await;
                let mut result = *result;
                result.exit_code = -1;
                Err(RunError::Transport {
                    result: Box::new(result),
                    source: std::io::Error::new(
                        std::io::ErrorKind::ConnectionAborted,
                        "ssh connection lost",
                    ),
                })
            }
            other => other,
        }
    }
}

/// Renders the remote side of a command: environment, working directory,
/// then the quoted argv.
pub fn remote_command_line(cmd: &Cmd) -> String {
    let mut line = String::new();
    if let Some(dir) = cmd.working_dir() {
        line.push_str(&format!("cd {} && ", shell_quote(&dir.to_string_lossy())));
    }
    if !cmd.envs().is_empty() {
        line.push_str("env ");
        for (k, v) in cmd.envs() {
            line.push_str(&shell_quote(&format!("{}={}", k, v)));
            line.push(' ');
        }
    }
    line.push_str(&render_argv(&cmd.argv()));
    line
}

/// Frames an asset for `scp -t`: the `C<mode> <length> <name>` header, the
/// raw bytes, then a terminating NUL.
pub fn scp_frame(octal_mode: &str, name: &str, contents: &[u8]) -> Vec<u8> {
    let header = format!("C{} {} {}\n", octal_mode, contents.len(), name);
    let mut frame = Vec::with_capacity(header.len() + contents.len() + 1);
    frame.extend_from_slice(header.as_bytes());
    frame.extend_from_slice(contents);
    frame.push(0);
    frame
}

/// Runs commands on a VM over SSH.
#[derive(Clone, Debug)]
pub struct SshRunner {
    client: Arc<SshClient>,
}

impl SshRunner {
    /// Creates a runner over a shared client.
    pub fn new(client: Arc<SshClient>) -> Self {
        SshRunner { client }
    }

    /// The underlying client.
    pub fn client(&self) -> &Arc<SshClient> {
        &self.client
    }

    /// Reports whether `asset` is already on the guest with the same size and
    /// modification time.
    async fn already_present(&self, asset: &Asset) -> bool {
        let modtime = match asset.modtime() {
            Some(m) => m,
            None => return false,
        };
        let target = asset.target_path();
        let res = match self
            .client
            .session(Cmd::new("sudo").args(["stat", "-c", STAT_FORMAT, target.as_str()]))
            .await
        {
            Ok(r) => r,
            Err(_) => return false,
        };
        match parse_stat(&res.stdout_str()) {
            Some((_, size, Some(remote))) => {
                size == asset.length() && same_second(remote, modtime)
            }
            _ => false,
        }
    }
}

fn same_second(a: SystemTime, b: SystemTime) -> bool {
    let secs = |t: SystemTime| t.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).ok();
    secs(a) == secs(b)
}

#[async_trait]
impl Runner for SshRunner {
    async fn run_cmd(&self, cmd: Cmd) -> Result<RunResult, RunError> {
        if cmd.stdin_bytes().is_some() {
            return Err(RunError::NotImplemented(format!("{}: stdin over ssh", cmd)));
        }
        self.client.session(cmd).await
    }

    async fn start_cmd(&self, cmd: Cmd) -> Result<StartedCmd, RunError> {
        if cmd.stdin_bytes().is_some() {
            return Err(RunError::NotImplemented(format!("{}: stdin over ssh", cmd)));
        }
        let client = self.client.clone();
        Ok(StartedCmd::spawn(cmd.to_string(), async move {
            client.session(cmd).await
        }))
    }

    #[instrument(level = "debug", skip(self, asset), fields(target = %asset.target_path()))]
    async fn copy(&self, asset: &Asset) -> anyhow::Result<()> {
        if asset.length() == 0 {
            warn!(target = %asset.target_path(), "copying zero-byte asset");
        }
        if asset.length() > SKIP_CHECK_THRESHOLD && self.already_present(asset).await {
            debug!(target = %asset.target_path(), "already present, skipping transfer");
            return Ok(());
        }
        let dir = shell_quote(asset.target_dir());
        let contents = asset.contents().await?;
        let frame = scp_frame(&asset.octal_mode(), asset.target_name(), &contents);
        self.client
            .session(
                Cmd::shell(format!("sudo mkdir -p {dir} && sudo scp -t {dir}", dir = dir))
                    .stdin(frame),
            )
            .await
            .with_context(|| format!("unable to scp {}", asset.target_path()))?;
        if let Some(modtime) = asset.modtime() {
            let target = asset.target_path();
            self.client
                .session(Cmd::new("sudo").args(["touch", "-d", touch_time(modtime).as_str(), target.as_str()]))
                .await?;
        }
        Ok(())
    }

    async fn remove(&self, asset: &Asset) -> anyhow::Result<()> {
        let target = asset.target_path();
        self.client
            .session(Cmd::new("sudo").args(["rm", "-f", target.as_str()]))
            .await
            .with_context(|| format!("unable to remove {}", target))?;
        Ok(())
    }

    async fn readable_file(&self, path: &str) -> anyhow::Result<ReadableFile> {
        let stat = self
            .client
            .session(Cmd::new("sudo").args(["stat", "-c", STAT_FORMAT, path]))
            .await?;
        let (perms, length, modtime) = parse_stat(&stat.stdout_str())
            .with_context(|| format!("unexpected stat output for {}", path))?;
        let contents = self.client.session(Cmd::new("sudo").args(["cat", path])).await?;
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

    fn client() -> SshClient {
        SshClient::new(SshTarget {
            host: "192.168.49.2".to_string(),
            port: 22,
            user: "docker".to_string(),
            key_path: PathBuf::from("/home/me/.minikube/machines/minikube/id_rsa"),
        })
    }

    #[test]
    fn frames_scp_payload() {
        let frame = scp_frame("0644", "kubeadm.yaml", b"abc");
        assert_eq!(frame, b"C0644 3 kubeadm.yaml\nabc\x00".to_vec());
    }

    #[test]
    fn zero_byte_frame_still_has_header_and_terminator() {
        let frame = scp_frame("0755", "empty", b"");
        assert_eq!(frame, b"C0755 0 empty\n\x00".to_vec());
    }

    #[test]
    fn remote_line_carries_env_and_dir() {
        let cmd = Cmd::new("kubeadm")
            .args(["init", "--config", "/var/tmp/minikube/kubeadm.yaml"])
            .env("PATH", "/var/lib/minikube/binaries/v1.23.0:$PATH")
            .dir("/var/tmp/minikube");
        assert_eq!(
            remote_command_line(&cmd),
            "cd /var/tmp/minikube && env 'PATH=/var/lib/minikube/binaries/v1.23.0:$PATH' kubeadm init --config /var/tmp/minikube/kubeadm.yaml"
        );
    }

    #[test]
    fn session_uses_control_connection() {
        let cmd = client().session_cmd(Cmd::new("uptime"));
        let argv = cmd.argv();
        assert_eq!(argv[0], "ssh");
        assert!(argv.iter().any(|a| a == "ControlMaster=auto"));
        assert!(argv.iter().any(|a| a.starts_with("ControlPath=")));
        assert_eq!(argv[argv.len() - 3], "docker@192.168.49.2");
        assert_eq!(argv[argv.len() - 2], "--");
        assert_eq!(argv[argv.len() - 1], "uptime");
    }

    #[tokio::test]
    async fn stdin_is_not_supported() {
        let runner = SshRunner::new(Arc::new(client()));
        let err = runner
            .run_cmd(Cmd::new("cat").stdin("data"))
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::NotImplemented(_)));
        assert_eq!(err.exit_code(), -1);
    }
}
