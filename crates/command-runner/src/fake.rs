//! An in-memory [`Runner`] for tests.
//!
//! `FakeRunner` records every command it is asked to run, emulates the unit
//! states of a systemd (or SysV) host, keeps copied files in memory, and
//! answers a small set of file commands (`cat`, `stat`, `test`, `ls`, `mv`,
//! `rm`, `tee`) from that in-memory filesystem. Anything else succeeds with
//! empty output unless a response was scripted for its prefix.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;

use crate::assets::Asset;
use crate::command::{
    render_argv, touch_time, Cmd, ReadableFile, RunError, RunResult, Runner, StartedCmd,
};

/// A file held by a [`FakeRunner`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FakeFile {
    /// File contents.
    pub contents: Vec<u8>,
    /// Octal permissions, as `chmod` would be given them.
    pub permissions: String,
    /// Modification time, if one was preserved.
    pub modtime: Option<SystemTime>,
}

#[derive(Clone, Debug)]
struct Response {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    exit_code: i32,
}

#[derive(Debug, Default)]
struct State {
    commands: Vec<String>,
    sysv: bool,
    active: BTreeSet<String>,
    restarts: HashMap<String, usize>,
    files: BTreeMap<String, FakeFile>,
    responses: Vec<(String, Response)>,
    missing: HashSet<String>,
}

/// A scriptable in-memory host.
#[derive(Clone, Debug, Default)]
pub struct FakeRunner {
    state: Arc<Mutex<State>>,
}

impl FakeRunner {
    /// Creates a systemd host with nothing running.
    pub fn new() -> Self {
        FakeRunner::default()
    }

    /// Makes the host report SysV init instead of systemd.
    pub fn with_sysv(self) -> Self {
        self.lock().sysv = true;
        self
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Answers every command whose rendered command line starts with `prefix`
    /// with `stdout` and `exit_code`. Later scripts win over earlier ones.
    pub fn set_response(&self, prefix: impl Into<String>, stdout: impl Into<Vec<u8>>, exit_code: i32) {
        self.lock().responses.push((
            prefix.into(),
            Response {
                stdout: stdout.into(),
                stderr: Vec::new(),
                exit_code,
            },
        ));
    }

    /// Makes `which <binary>` fail.
    pub fn set_missing(&self, binary: impl Into<String>) {
        self.lock().missing.insert(binary.into());
    }

    /// Marks a unit as running or stopped.
    pub fn set_active(&self, svc: &str, active: bool) {
        let mut state = self.lock();
        if active {
            state.active.insert(svc.to_string());
        } else {
            state.active.remove(svc);
        }
    }

    /// Reports whether a unit is running.
    pub fn is_active(&self, svc: &str) -> bool {
        self.lock().active.contains(svc)
    }

    /// Units currently running.
    pub fn active_services(&self) -> Vec<String> {
        self.lock().active.iter().cloned().collect()
    }

    /// How many times a unit was restarted.
    pub fn restarts(&self, svc: &str) -> usize {
        self.lock().restarts.get(svc).copied().unwrap_or(0)
    }

    /// Every command run so far, rendered as command lines.
    pub fn commands(&self) -> Vec<String> {
        self.lock().commands.clone()
    }

    /// Forgets recorded commands.
    pub fn clear_commands(&self) {
        self.lock().commands.clear();
    }

    /// Commands containing `needle`.
    pub fn commands_containing(&self, needle: &str) -> Vec<String> {
        self.lock()
            .commands
            .iter()
            .filter(|c| c.contains(needle))
            .cloned()
            .collect()
    }

    /// Places a file on the host.
    pub fn put_file(&self, path: impl Into<String>, contents: impl Into<Vec<u8>>) {
        self.lock().files.insert(
            path.into(),
            FakeFile {
                contents: contents.into(),
                permissions: "0644".to_string(),
                modtime: None,
            },
        );
    }

    /// A file on the host.
    pub fn file(&self, path: &str) -> Option<FakeFile> {
        self.lock().files.get(path).cloned()
    }

    /// A file's contents as a string.
    pub fn file_string(&self, path: &str) -> Option<String> {
        self.file(path)
            .map(|f| String::from_utf8_lossy(&f.contents).into_owned())
    }

    /// Reports whether a file exists.
    pub fn has_file(&self, path: &str) -> bool {
        self.lock().files.contains_key(path)
    }

    /// Every file whose path starts with `prefix`.
    pub fn files_under(&self, prefix: &str) -> BTreeMap<String, FakeFile> {
        self.lock()
            .files
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    fn respond(&self, cmd: &Cmd) -> Response {
        let line = cmd.to_string();
        let mut state = self.lock();
        state.commands.push(line.clone());
        if let Some((_, r)) = state
            .responses
            .iter()
            .rev()
            .find(|(prefix, _)| line.starts_with(prefix.as_str()))
        {
            return r.clone();
        }

        let argv = cmd.argv();
        let mut args: Vec<&str> = argv.iter().map(String::as_str).collect();
        if args.first() == Some(&"sudo") {
            args.remove(0);
        }
        builtin(&mut state, &args, cmd.stdin_bytes())
    }
}

fn ok(stdout: impl Into<Vec<u8>>) -> Response {
    Response {
        stdout: stdout.into(),
        stderr: Vec::new(),
        exit_code: 0,
    }
}

fn fail(stderr: &str) -> Response {
    Response {
        stdout: Vec::new(),
        stderr: stderr.as_bytes().to_vec(),
        exit_code: 1,
    }
}

fn builtin(state: &mut State, args: &[&str], stdin: Option<&[u8]>) -> Response {
    match args {
        ["systemctl", "--version"] => {
            if state.sysv {
                fail("systemctl: command not found")
            } else {
                ok("systemd 249\n")
            }
        }
        ["systemctl", "is-active", "--quiet", "service", svc] => {
            if state.active.contains(*svc) {
                ok("")
            } else {
                Response { exit_code: 3, ..fail("") }
            }
        }
        ["systemctl", "start", svc] | ["service", svc, "start"] => {
            state.active.insert(svc.to_string());
            ok("")
        }
        ["systemctl", "restart", svc] | ["service", svc, "restart"] => {
            state.active.insert(svc.to_string());
            *state.restarts.entry(svc.to_string()).or_default() += 1;
            ok("")
        }
        ["systemctl", "stop", svc]
        | ["systemctl", "stop", "-f", svc]
        | ["systemctl", "disable", "--now", svc]
        | ["service", svc, "stop"] => {
            state.active.remove(*svc);
            ok("")
        }
        ["systemctl", "enable", "--now", svc] => {
            state.active.insert(svc.to_string());
            ok("")
        }
        ["systemctl", "show", "-p", "SubState", "--value", svc] => {
            if state.active.contains(*svc) {
                ok("running\n")
            } else {
                ok("dead\n")
            }
        }
        ["service", svc, "status"] => {
            if state.active.contains(*svc) {
                ok("")
            } else {
                Response { exit_code: 3, ..fail("") }
            }
        }
        ["which", bin] | ["command", "-v", bin] => {
            if state.missing.contains(*bin) {
                fail("")
            } else {
                ok(format!("/usr/bin/{}\n", bin))
            }
        }
        ["cat", path] => match state.files.get(*path) {
            Some(f) => ok(f.contents.clone()),
            None => fail("No such file or directory"),
        },
        ["stat", "-c", format, path] => match state.files.get(*path) {
            Some(f) => {
                let modtime = touch_time(f.modtime.unwrap_or(SystemTime::UNIX_EPOCH));
                let perms = f.permissions.trim_start_matches('0');
                let line = format
                    .replace("%a", if perms.is_empty() { "0" } else { perms })
                    .replace("%s", &f.contents.len().to_string())
                    .replace("%y", &modtime);
                ok(format!("{}\n", line))
            }
            None => fail("No such file or directory"),
        },
        ["test", "-f", path] => {
            if state.files.contains_key(*path) {
                ok("")
            } else {
                fail("")
            }
        }
        ["test", "-d", path] => {
            let dir = format!("{}/", path.trim_end_matches('/'));
            if state.files.keys().any(|k| k.starts_with(&dir)) {
                ok("")
            } else {
                fail("")
            }
        }
        ["ls", path] => {
            let dir = format!("{}/", path.trim_end_matches('/'));
            let names: BTreeSet<String> = state
                .files
                .keys()
                .filter_map(|k| k.strip_prefix(&dir))
                .map(|rest| rest.split('/').next().unwrap_or(rest).to_string())
                .collect();
            let mut out = names.into_iter().collect::<Vec<_>>().join("\n");
            if !out.is_empty() {
                out.push('\n');
            }
            ok(out)
        }
        ["mv", from, to] => match state.files.remove(*from) {
            Some(f) => {
                state.files.insert(to.to_string(), f);
                ok("")
            }
            None => fail("No such file or directory"),
        },
        ["rm", rest @ ..] => {
            let recursive = rest.iter().any(|a| a.starts_with('-') && a.contains('r'));
            for path in rest.iter().filter(|a| !a.starts_with('-')) {
                state.files.remove(*path);
                if recursive {
                    let dir = format!("{}/", path.trim_end_matches('/'));
                    state.files.retain(|k, _| !k.starts_with(&dir));
                }
            }
            ok("")
        }
        ["tee", path] => {
            let contents = stdin.map(<[u8]>::to_vec).unwrap_or_default();
            state.files.insert(
                path.to_string(),
                FakeFile {
                    contents: contents.clone(),
                    permissions: "0644".to_string(),
                    modtime: None,
                },
            );
            ok(contents)
        }
        ["chmod", mode, path] => {
            if let Some(f) = state.files.get_mut(*path) {
                f.permissions = mode.to_string();
            }
            ok("")
        }
        _ => ok(""),
    }
}

#[async_trait]
impl Runner for FakeRunner {
    async fn run_cmd(&self, cmd: Cmd) -> Result<RunResult, RunError> {
        let response = self.respond(&cmd);
        let result = RunResult {
            args: cmd.argv(),
            exit_code: response.exit_code,
            stdout: response.stdout,
            stderr: response.stderr,
            duration: Duration::from_millis(1),
        };
        if result.exit_code == 0 {
            Ok(result)
        } else {
            Err(RunError::ExitStatus(Box::new(result)))
        }
    }

    async fn start_cmd(&self, cmd: Cmd) -> Result<StartedCmd, RunError> {
        let runner = self.clone();
        Ok(StartedCmd::spawn(render_argv(&cmd.argv()), async move {
            runner.run_cmd(cmd).await
        }))
    }

    async fn copy(&self, asset: &Asset) -> anyhow::Result<()> {
        let contents = asset.contents().await?;
        self.lock().files.insert(
            asset.target_path(),
            FakeFile {
                contents,
                permissions: asset.octal_mode(),
                modtime: asset.modtime(),
            },
        );
        Ok(())
    }

    async fn remove(&self, asset: &Asset) -> anyhow::Result<()> {
        self.lock().files.remove(&asset.target_path());
        Ok(())
    }

    async fn readable_file(&self, path: &str) -> anyhow::Result<ReadableFile> {
        let file = self
            .file(path)
            .ok_or_else(|| anyhow::anyhow!("{}: no such file", path))?;
        Ok(ReadableFile::new(
            path,
            file.permissions.trim_start_matches('0').to_string(),
            file.contents.len() as u64,
            file.modtime,
            Box::new(std::io::Cursor::new(file.contents)),
        ))
    }
}
