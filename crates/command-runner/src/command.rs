//! The [`Runner`] capability and the types that flow through it.

use std::fmt;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::assets::Asset;

/// A caller supplied writer that receives a copy of a command's output.
pub type Sink = Box<dyn AsyncWrite + Send + Unpin>;

/// Number of trailing output lines included in error messages.
const OUTPUT_TAIL_LINES: usize = 20;

/// A command to run on a host.
///
/// ```
/// use command_runner::Cmd;
///
/// let cmd = Cmd::new("sudo").args(["systemctl", "is-active", "--quiet", "service", "docker"]);
/// assert_eq!(cmd.to_string(), "sudo systemctl is-active --quiet service docker");
/// ```
pub struct Cmd {
    pub(crate) program: String,
    pub(crate) args: Vec<String>,
    pub(crate) env: Vec<(String, String)>,
    pub(crate) dir: Option<PathBuf>,
    pub(crate) stdin: Option<Vec<u8>>,
    pub(crate) stdout: Option<Sink>,
    pub(crate) stderr: Option<Sink>,
    pub(crate) tty: bool,
    pub(crate) timeout: Option<Duration>,
    pub(crate) cancel: Option<CancellationToken>,
}

impl Cmd {
    /// Creates a command running `program` with no arguments.
    pub fn new(program: impl Into<String>) -> Self {
        Cmd {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            dir: None,
            stdin: None,
            stdout: None,
            stderr: None,
            tty: false,
            timeout: None,
            cancel: None,
        }
    }

    /// Creates a command that runs `script` through `/bin/bash -c`.
    pub fn shell(script: impl Into<String>) -> Self {
        Cmd::new("/bin/bash").arg("-c").arg(script)
    }

    /// Appends an argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Sets an environment variable for the command.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Sets the working directory.
    pub fn dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    /// Feeds `bytes` to the command's stdin.
    pub fn stdin(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(bytes.into());
        self
    }

    /// Tees stdout to `sink` in addition to the captured buffer.
    pub fn stdout(mut self, sink: Sink) -> Self {
        self.stdout = Some(sink);
        self
    }

    /// Tees stderr to `sink` in addition to the captured buffer.
    pub fn stderr(mut self, sink: Sink) -> Self {
        self.stderr = Some(sink);
        self
    }

    /// Tees output to this process's own stdout and stderr. The command is
    /// marked as terminal-attached when either of them is a terminal.
    pub fn attach_terminal(mut self) -> Self {
        use std::io::IsTerminal;
        self.tty = std::io::stdout().is_terminal() || std::io::stderr().is_terminal();
        self.stdout = Some(Box::new(tokio::io::stdout()));
        self.stderr = Some(Box::new(tokio::io::stderr()));
        self
    }

    /// Fails the command with [`RunError::TimedOut`] after `timeout`.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Fails the command with [`RunError::Cancelled`] once `token` fires.
    pub fn cancel_on(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// The program to run.
    pub fn program(&self) -> &str {
        &self.program
    }

    /// The program followed by its arguments.
    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.program.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }

    /// Environment set on the command.
    pub fn envs(&self) -> &[(String, String)] {
        &self.env
    }

    /// Working directory set on the command.
    pub fn working_dir(&self) -> Option<&PathBuf> {
        self.dir.as_ref()
    }

    /// Bytes to feed on stdin.
    pub fn stdin_bytes(&self) -> Option<&[u8]> {
        self.stdin.as_deref()
    }

    /// Whether the caller's output is a terminal.
    pub fn is_tty(&self) -> bool {
        self.tty
    }

    /// Replaces the argv while keeping the IO, timeout and cancellation
    /// settings. Environment and working directory are dropped, since the
    /// wrapping command is expected to carry them.
    pub(crate) fn rewrap(self, program: impl Into<String>, args: Vec<String>) -> Cmd {
        Cmd {
            program: program.into(),
            args,
            env: Vec::new(),
            dir: None,
            stdin: self.stdin,
            stdout: self.stdout,
            stderr: self.stderr,
            tty: self.tty,
            timeout: self.timeout,
            cancel: self.cancel,
        }
    }
}

impl fmt::Display for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", render_argv(&self.argv()))
    }
}

impl fmt::Debug for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cmd")
            .field("argv", &self.argv())
            .field("env", &self.env)
            .field("dir", &self.dir)
            .field("stdin", &self.stdin.as_ref().map(Vec::len))
            .field("tty", &self.tty)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// The outcome of a command. Output is captured even when the command fails.
#[derive(Clone, Debug, Default)]
pub struct RunResult {
    /// The argv that was run on the host.
    pub args: Vec<String>,
    /// Process exit code; `-1` when the transport failed.
    pub exit_code: i32,
    /// Captured stdout.
    pub stdout: Vec<u8>,
    /// Captured stderr.
    pub stderr: Vec<u8>,
    /// Wall time spent.
    pub duration: Duration,
}

impl RunResult {
    /// The command line, for logs and error messages.
    pub fn command(&self) -> String {
        render_argv(&self.args)
    }

    /// Captured stdout as (lossy) UTF-8.
    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Captured stderr as (lossy) UTF-8.
    pub fn stderr_str(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    /// Captured stdout and stderr, as shown in error messages.
    pub fn output(&self) -> String {
        let mut out = String::new();
        if !self.stdout.is_empty() {
            out.push_str("-- stdout --\n");
            out.push_str(&tail(&self.stdout_str(), OUTPUT_TAIL_LINES));
            out.push('\n');
        }
        if !self.stderr.is_empty() {
            out.push_str("-- stderr --\n");
            out.push_str(&tail(&self.stderr_str(), OUTPUT_TAIL_LINES));
            out.push('\n');
        }
        out
    }
}

fn tail(s: &str, lines: usize) -> String {
    let all: Vec<&str> = s.trim_end().lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}

/// Errors from running a command.
#[derive(Error, Debug)]
pub enum RunError {
    /// The command ran and exited non-zero.
    #[error("{}: exit status {} after {:?}\n{}", .0.command(), .0.exit_code, .0.duration, .0.output())]
    ExitStatus(Box<RunResult>),
    /// The command could not be run or its output could not be collected.
    #[error("{}: {source}", .result.command())]
    Transport {
        /// What was captured before the failure; the exit code is `-1`.
        result: Box<RunResult>,
        /// The underlying transport failure.
        #[source]
        source: std::io::Error,
    },
    /// The command's cancellation token fired.
    #[error("{command}: cancelled")]
    Cancelled {
        /// The command line.
        command: String,
    },
    /// The command ran past its timeout.
    #[error("{command}: timed out after {timeout:?}")]
    TimedOut {
        /// The command line.
        command: String,
        /// The timeout that elapsed.
        timeout: Duration,
    },
    /// The runner cannot perform this operation.
    #[error("{0}: not implemented")]
    NotImplemented(String),
}

impl RunError {
    pub(crate) fn transport(args: Vec<String>, source: std::io::Error) -> Self {
        RunError::Transport {
            result: Box::new(RunResult {
                args,
                exit_code: -1,
                ..Default::default()
            }),
            source,
        }
    }

    /// The captured result, when the command got far enough to have one.
    pub fn result(&self) -> Option<&RunResult> {
        match self {
            RunError::ExitStatus(r) => Some(r),
            RunError::Transport { result, .. } => Some(result),
            _ => None,
        }
    }

    /// The exit code: the process's own when it exited, `-1` otherwise.
    pub fn exit_code(&self) -> i32 {
        match self {
            RunError::ExitStatus(r) => r.exit_code,
            _ => -1,
        }
    }
}

/// A command started in the background with [`Runner::start_cmd`].
#[derive(Debug)]
pub struct StartedCmd {
    command: String,
    handle: JoinHandle<Result<RunResult, RunError>>,
}

impl StartedCmd {
    pub(crate) fn spawn<F>(command: String, fut: F) -> Self
    where
        F: std::future::Future<Output = Result<RunResult, RunError>> + Send + 'static,
    {
        StartedCmd {
            command,
            handle: tokio::spawn(fut),
        }
    }

    /// The command line.
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Waits for the command to finish.
    pub async fn wait(self) -> Result<RunResult, RunError> {
        match self.handle.await {
            Ok(res) => res,
            Err(e) => Err(RunError::transport(
                vec![self.command],
                std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
            )),
        }
    }
}

/// A file on a host opened for reading.
pub struct ReadableFile {
    /// Path on the host.
    pub path: String,
    /// Octal permissions, e.g. `"644"`.
    pub permissions: String,
    /// Size in bytes.
    pub length: u64,
    /// Last modification time, when the host reported one.
    pub modtime: Option<SystemTime>,
    reader: Box<dyn AsyncRead + Send + Unpin>,
}

impl ReadableFile {
    /// Wraps a reader with the file's metadata.
    pub fn new(
        path: impl Into<String>,
        permissions: impl Into<String>,
        length: u64,
        modtime: Option<SystemTime>,
        reader: Box<dyn AsyncRead + Send + Unpin>,
    ) -> Self {
        ReadableFile {
            path: path.into(),
            permissions: permissions.into(),
            length,
            modtime,
            reader,
        }
    }

    /// The byte stream.
    pub fn reader(&mut self) -> &mut (dyn AsyncRead + Send + Unpin) {
        &mut *self.reader
    }

    /// Reads the rest of the stream.
    pub async fn read_all(mut self) -> std::io::Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.length as usize);
        self.reader.read_to_end(&mut buf).await?;
        Ok(buf)
    }
}

impl fmt::Debug for ReadableFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadableFile")
            .field("path", &self.path)
            .field("permissions", &self.permissions)
            .field("length", &self.length)
            .field("modtime", &self.modtime)
            .finish()
    }
}

/// A uniform way to run commands and move files on a host.
///
/// Runners are cheap handles; the transport underneath (a local process, an
/// OCI `exec`, an SSH session) is set up per command.
///
/// `run_cmd` returns `Err` iff the command exited non-zero or the transport
/// failed; the captured output is available from the error either way.
#[async_trait]
pub trait Runner: Send + Sync {
    /// Runs a command to completion.
    async fn run_cmd(&self, cmd: Cmd) -> Result<RunResult, RunError>;

    /// Starts a command in the background.
    async fn start_cmd(&self, cmd: Cmd) -> Result<StartedCmd, RunError>;

    /// Waits for a command started with [`Runner::start_cmd`].
    async fn wait_cmd(&self, started: StartedCmd) -> Result<RunResult, RunError> {
        started.wait().await
    }

    /// Places an asset on the host, creating its directory, applying its
    /// permissions and preserving its modification time when it has one.
    async fn copy(&self, asset: &Asset) -> anyhow::Result<()>;

    /// Removes an asset's target from the host.
    async fn remove(&self, asset: &Asset) -> anyhow::Result<()>;

    /// Opens a file on the host for reading.
    async fn readable_file(&self, path: &str) -> anyhow::Result<ReadableFile>;
}

/// Quotes `s` for a POSIX shell when it contains anything beyond a
/// conservative set of safe characters.
pub fn shell_quote(s: &str) -> String {
    let safe = !s.is_empty()
        && s.chars().all(|c| {
            c.is_ascii_alphanumeric()
                || matches!(c, '-' | '_' | '.' | '/' | ':' | '=' | ',' | '+' | '@' | '%')
        });
    if safe {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', r#"'\''"#))
    }
}

/// Renders an argv as a shell-readable command line.
pub fn render_argv(args: &[String]) -> String {
    args.iter()
        .map(|a| shell_quote(a))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Formats a modification time the way `touch -d` accepts it.
pub fn touch_time(t: SystemTime) -> String {
    let dt: DateTime<Utc> = t.into();
    dt.format("%Y-%m-%d %H:%M:%S%.9f %z").to_string()
}

/// The `stat` format understood by [`parse_stat`].
pub const STAT_FORMAT: &str = "%a %s %y";

/// Parses a line of `stat -c "%a %s %y"` output into permissions, size and
/// modification time.
pub fn parse_stat(line: &str) -> Option<(String, u64, Option<SystemTime>)> {
    let mut parts = line.trim().splitn(3, ' ');
    let perms = parts.next()?.to_string();
    let size = parts.next()?.parse().ok()?;
    let modtime = parts.next().and_then(|t| {
        DateTime::parse_from_str(t.trim(), "%Y-%m-%d %H:%M:%S%.f %z")
            .ok()
            .map(SystemTime::from)
    });
    Some((perms, size, modtime))
}

/// Copies everything from `src` into a buffer and into `sink`, if any.
pub(crate) async fn tee(
    mut src: impl AsyncRead + Unpin,
    mut sink: Option<Sink>,
) -> std::io::Result<Vec<u8>> {
    let mut captured = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = src.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        captured.extend_from_slice(&buf[..n]);
        if let Some(s) = sink.as_mut() {
            s.write_all(&buf[..n]).await?;
        }
    }
    if let Some(s) = sink.as_mut() {
        s.flush().await?;
    }
    Ok(captured)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::UNIX_EPOCH;

    #[test]
    fn quoting_leaves_safe_words_alone() {
        assert_eq!(shell_quote("kubeadm"), "kubeadm");
        assert_eq!(shell_quote("--config=/var/tmp/minikube/kubeadm.yaml"), "--config=/var/tmp/minikube/kubeadm.yaml");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), r#"'it'\''s'"#);
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn stat_output_parses() {
        let (perms, size, modtime) =
            parse_stat("755 4096 2021-06-01 10:11:12.000000000 +0000").expect("should parse");
        assert_eq!(perms, "755");
        assert_eq!(size, 4096);
        let secs = modtime
            .expect("modtime should parse")
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs();
        assert_eq!(secs, 1622542272);
        assert!(parse_stat("garbage").is_none());
    }

    #[test]
    fn touch_time_round_trips_through_stat_format() {
        let t = UNIX_EPOCH + Duration::from_secs(1622542272);
        let rendered = touch_time(t);
        assert_eq!(rendered, "2021-06-01 10:11:12.000000000 +0000");
        let (_, _, parsed) = parse_stat(&format!("644 1 {}", rendered)).unwrap();
        assert_eq!(parsed, Some(t));
    }

    #[test]
    fn output_keeps_the_tail() {
        let stdout = (0..30).map(|i| format!("line {}\n", i)).collect::<String>();
        let result = RunResult {
            args: vec!["ls".to_string()],
            exit_code: 1,
            stdout: stdout.into_bytes(),
            stderr: b"boom".to_vec(),
            duration: Duration::from_millis(5),
        };
        let out = result.output();
        assert!(!out.contains("line 9\n"));
        assert!(out.contains("line 29"));
        assert!(out.contains("-- stderr --\nboom"));
    }

    #[test]
    fn errors_expose_exit_codes() {
        let err = RunError::ExitStatus(Box::new(RunResult {
            args: vec!["false".to_string()],
            exit_code: 1,
            ..Default::default()
        }));
        assert_eq!(err.exit_code(), 1);
        let err = RunError::transport(
            vec!["ssh".to_string()],
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone"),
        );
        assert_eq!(err.exit_code(), -1);
        assert_eq!(err.result().map(|r| r.exit_code), Some(-1));
    }

    #[tokio::test]
    async fn tee_fills_buffer_and_sink() {
        let (client, mut server) = tokio::io::duplex(64);
        let reader = std::io::Cursor::new(b"hello world".to_vec());
        let captured = tee(reader, Some(Box::new(client))).await.unwrap();
        assert_eq!(captured, b"hello world".to_vec());
        let mut seen = Vec::new();
        server.read_to_end(&mut seen).await.unwrap();
        assert_eq!(seen, b"hello world".to_vec());
    }
}
