//! Process execution shared by every runner, and the [`LocalRunner`] that
//! drives the machine this process runs on.

use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;
use std::process::Stdio;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::assets::Asset;
use crate::command::{
    parse_stat, tee, touch_time, Cmd, ReadableFile, RunError, RunResult, Runner, StartedCmd,
    STAT_FORMAT,
};

/// Commands slower than this are logged with their elapsed time.
pub(crate) const SLOW_COMMAND: Duration = Duration::from_secs(1);

/// Spawns `cmd` as a local process and collects its result.
///
/// Stdout and stderr are captured in full and also copied to the caller's
/// sinks. The process is killed if the command times out or is cancelled.
pub(crate) async fn execute(cmd: Cmd) -> Result<RunResult, RunError> {
    let argv = cmd.argv();
    let command_line = cmd.to_string();
    let Cmd {
        program,
        args,
        env,
        dir,
        stdin,
        stdout,
        stderr,
        timeout,
        cancel,
        ..
    } = cmd;

    let mut command = Command::new(&program);
    command
        .args(&args)
        .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .kill_on_drop(true);
    if let Some(d) = dir.as_ref() {
        command.current_dir(d);
    }

    debug!(command = %command_line, "running");
    let start = Instant::now();
    let mut child = command
        .spawn()
        .map_err(|e| RunError::transport(argv.clone(), e))?;

    let child_stdin = child.stdin.take();
    let child_stdout = child.stdout.take();
    let child_stderr = child.stderr.take();

    let feed = async move {
        if let (Some(mut pipe), Some(bytes)) = (child_stdin, stdin) {
            pipe.write_all(&bytes).await?;
            pipe.shutdown().await?;
        }
        Ok::<(), std::io::Error>(())
    };
    let out = async move {
        match child_stdout {
            Some(p) => tee(p, stdout).await,
            None => Ok(Vec::new()),
        }
    };
    let err = async move {
        match child_stderr {
            Some(p) => tee(p, stderr).await,
            None => Ok(Vec::new()),
        }
    };
    let work = async {
        let (fed, out, err, status) = tokio::join!(feed, out, err, child.wait());
        (fed, out, err, status)
    };

    let cancelled = async {
        match cancel {
            Some(token) => token.cancelled().await,
            None => futures::future::pending::<()>().await,
        }
    };
    let timed_out = async {
        match timeout {
            Some(t) => tokio::time::sleep(t).await,
            None => futures::future::pending::<()>().await,
        }
    };

    let (fed, out, err, status) = tokio::select! {
        res = work => res,
        _ = cancelled => {
            return Err(RunError::Cancelled { command: command_line });
        }
        _ = timed_out => {
            return Err(RunError::TimedOut {
                command: command_line,
                timeout: timeout.unwrap_or_default(),
            });
        }
    };

    let duration = start.elapsed();
    if duration > SLOW_COMMAND {
        info!(command = %command_line, elapsed = ?duration, "completed");
    }

    let mut result = RunResult {
        args: argv,
        exit_code: -1,
        stdout: out.unwrap_or_default(),
        stderr: err.unwrap_or_default(),
        duration,
    };
    let status = match status {
        Ok(s) => s,
        Err(e) => return Err(RunError::Transport { result: Box::new(result), source: e }),
    };
    // A command that stops reading stdin early is not a transport failure.
    if let Err(e) = fed {
        if e.kind() != ErrorKind::BrokenPipe {
            return Err(RunError::Transport { result: Box::new(result), source: e });
        }
    }
    match status.code() {
        Some(0) => {
            result.exit_code = 0;
            Ok(result)
        }
        Some(code) => {
            result.exit_code = code;
            Err(RunError::ExitStatus(Box::new(result)))
        }
        None => Err(RunError::Transport {
            result: Box::new(result),
            source: std::io::Error::new(ErrorKind::Interrupted, "terminated by signal"),
        }),
    }
}

/// Runs commands on the machine this process is running on, as the "none"
/// driver does.
#[derive(Clone, Debug, Default)]
pub struct LocalRunner;

impl LocalRunner {
    /// Creates a local runner.
    pub fn new() -> Self {
        LocalRunner
    }

    async fn copy_privileged(&self, asset: &Asset) -> anyhow::Result<()> {
        let dir = asset.target_dir().to_string();
        let target = asset.target_path();
        let contents = asset.contents().await?;
        self.run_cmd(Cmd::new("sudo").args(["mkdir", "-p", dir.as_str()]))
            .await?;
        self.run_cmd(
            Cmd::new("sudo")
                .args(["tee", target.as_str()])
                .stdin(contents),
        )
        .await?;
        self.run_cmd(Cmd::new("sudo").args(["chmod", asset.octal_mode().as_str(), target.as_str()]))
            .await?;
        if let Some(modtime) = asset.modtime() {
            self.run_cmd(Cmd::new("sudo").args(["touch", "-d", touch_time(modtime).as_str(), target.as_str()]))
                .await?;
        }
        Ok(())
    }

    async fn copy_direct(&self, asset: &Asset) -> std::io::Result<()> {
        let target = asset.target_path();
        tokio::fs::create_dir_all(asset.target_dir()).await?;
        let contents = asset.contents().await?;
        tokio::fs::write(&target, &contents).await?;
        tokio::fs::set_permissions(&target, std::fs::Permissions::from_mode(asset.mode())).await?;
        if let Some(modtime) = asset.modtime() {
            let file = tokio::fs::OpenOptions::new().write(true).open(&target).await?;
            file.into_std().await.set_modified(modtime)?;
        }
        Ok(())
    }
}

#[async_trait]
impl Runner for LocalRunner {
    async fn run_cmd(&self, cmd: Cmd) -> Result<RunResult, RunError> {
        execute(cmd).await
    }

    async fn start_cmd(&self, cmd: Cmd) -> Result<StartedCmd, RunError> {
        Ok(StartedCmd::spawn(cmd.to_string(), execute(cmd)))
    }

    async fn copy(&self, asset: &Asset) -> anyhow::Result<()> {
        if asset.length() == 0 {
            warn!(target = %asset.target_path(), "copying zero-byte asset");
        }
        match self.copy_direct(asset).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::PermissionDenied => {
                debug!(target = %asset.target_path(), "permission denied, copying with sudo");
                self.copy_privileged(asset).await
            }
            Err(e) => Err(e).with_context(|| format!("unable to copy {}", asset.target_path())),
        }
    }

    async fn remove(&self, asset: &Asset) -> anyhow::Result<()> {
        let target = asset.target_path();
        match tokio::fs::remove_file(&target).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) if e.kind() == ErrorKind::PermissionDenied => {
                self.run_cmd(Cmd::new("sudo").args(["rm", "-f", target.as_str()]))
                    .await?;
                Ok(())
            }
            Err(e) => Err(e).with_context(|| format!("unable to remove {}", target)),
        }
    }

    async fn readable_file(&self, path: &str) -> anyhow::Result<ReadableFile> {
        let res = self
            .run_cmd(Cmd::new("stat").args(["-c", STAT_FORMAT, path]))
            .await?;
        let (perms, length, modtime) = parse_stat(&res.stdout_str())
            .with_context(|| format!("unexpected stat output for {}", path))?;
        let file = tokio::fs::File::open(path)
            .await
            .with_context(|| format!("unable to open {}", path))?;
        Ok(ReadableFile::new(path, perms, length, modtime, Box::new(file)))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::UNIX_EPOCH;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let runner = LocalRunner::new();
        let res = runner
            .run_cmd(Cmd::shell("echo hello; echo oops >&2"))
            .await
            .expect("command should succeed");
        assert_eq!(res.exit_code, 0);
        assert_eq!(res.stdout_str(), "hello\n");
        assert_eq!(res.stderr_str(), "oops\n");
    }

    #[tokio::test]
    async fn non_zero_exit_keeps_output() {
        let runner = LocalRunner::new();
        let err = runner
            .run_cmd(Cmd::shell("echo partial; exit 3"))
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), 3);
        let result = err.result().expect("exit status carries a result");
        assert_eq!(result.stdout_str(), "partial\n");
    }

    #[tokio::test]
    async fn missing_program_is_a_transport_error() {
        let runner = LocalRunner::new();
        let err = runner
            .run_cmd(Cmd::new("/definitely/not/a/binary"))
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::Transport { .. }));
        assert_eq!(err.exit_code(), -1);
    }

    #[tokio::test]
    async fn stdin_env_and_dir_are_respected() {
        let dir = tempfile::tempdir().unwrap();
        let runner = LocalRunner::new();
        let res = runner
            .run_cmd(
                Cmd::shell("cat; echo \" $GREETING\"; pwd")
                    .stdin("from stdin")
                    .env("GREETING", "hi")
                    .dir(dir.path()),
            )
            .await
            .unwrap();
        let out = res.stdout_str();
        assert!(out.starts_with("from stdin hi\n"));
        let canonical = std::fs::canonicalize(dir.path()).unwrap();
        assert!(out.contains(canonical.to_str().unwrap()));
    }

    #[tokio::test]
    async fn caller_sinks_see_every_byte() {
        let (client, mut server) = tokio::io::duplex(1 << 16);
        let runner = LocalRunner::new();
        let res = runner
            .run_cmd(Cmd::shell("seq 1 1000").stdout(Box::new(client)))
            .await
            .unwrap();
        let mut seen = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut server, &mut seen)
            .await
            .unwrap();
        assert_eq!(seen, res.stdout);
    }

    #[tokio::test]
    async fn timeout_kills_the_command() {
        let runner = LocalRunner::new();
        let err = runner
            .run_cmd(Cmd::new("sleep").arg("5").timeout(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::TimedOut { .. }));
    }

    #[tokio::test]
    async fn cancellation_stops_the_command() {
        let token = CancellationToken::new();
        token.cancel();
        let runner = LocalRunner::new();
        let err = runner
            .run_cmd(Cmd::new("sleep").arg("5").cancel_on(token))
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::Cancelled { .. }));
    }

    #[tokio::test]
    async fn start_then_wait() {
        let runner = LocalRunner::new();
        let started = runner.start_cmd(Cmd::shell("echo later")).await.unwrap();
        let res = runner.wait_cmd(started).await.unwrap();
        assert_eq!(res.stdout_str(), "later\n");
    }

    #[tokio::test]
    async fn copy_applies_permissions_and_modtime() {
        let dir = tempfile::tempdir().unwrap();
        let target_dir = dir.path().join("nested/dir");
        let modtime = UNIX_EPOCH + Duration::from_secs(1_600_000_000);
        let asset = Asset::from_bytes("payload", target_dir.to_str().unwrap(), "file", "0640")
            .unwrap()
            .with_modtime(modtime);

        let runner = LocalRunner::new();
        runner.copy(&asset).await.expect("copy should succeed");

        let meta = std::fs::metadata(target_dir.join("file")).unwrap();
        assert_eq!(meta.permissions().mode() & 0o7777, 0o640);
        assert_eq!(meta.modified().unwrap(), modtime);

        let readable = runner
            .readable_file(target_dir.join("file").to_str().unwrap())
            .await
            .unwrap();
        assert_eq!(readable.permissions, "640");
        assert_eq!(readable.length, 7);
        assert_eq!(readable.read_all().await.unwrap(), b"payload".to_vec());

        runner.remove(&asset).await.unwrap();
        assert!(!target_dir.join("file").exists());
        runner.remove(&asset).await.expect("second remove is a no-op");
    }

    #[tokio::test]
    async fn zero_byte_copy_is_permitted() {
        let dir = tempfile::tempdir().unwrap();
        let asset = Asset::from_bytes(Vec::new(), dir.path().to_str().unwrap(), "empty", "0644")
            .unwrap();
        LocalRunner::new().copy(&asset).await.unwrap();
        assert_eq!(std::fs::metadata(dir.path().join("empty")).unwrap().len(), 0);
    }
}
