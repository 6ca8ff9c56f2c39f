//! Uniform command execution and file transfer for the hosts a cluster runs
//! on.
//!
//! Every host, whether it is the local machine, a container reached through
//! `docker exec`, or a VM reached over SSH, is driven through the [`Runner`]
//! trait. Runners capture stdout and stderr in full, copy [`Asset`]s with
//! their permissions and modification times, and expose a service manager
//! ([`sysinit::ServiceManager`]) for systemd or SysV hosts.
//!
//! ```no_run
//! use command_runner::{Cmd, LocalRunner, Runner};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let runner = LocalRunner::new();
//! let res = runner.run_cmd(Cmd::new("uname").arg("-m")).await?;
//! println!("arch: {}", res.stdout_str().trim());
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]

pub mod assets;
pub mod backoff;
mod command;
mod exec;
#[cfg(any(test, feature = "fake"))]
pub mod fake;
pub mod kic;
pub mod ssh;
pub mod sysinit;

pub use assets::{Asset, AssetError, AssetSource};
pub use command::{
    parse_stat, render_argv, shell_quote, touch_time, Cmd, ReadableFile, RunError, RunResult,
    Runner, Sink, StartedCmd, STAT_FORMAT,
};
pub use exec::LocalRunner;
pub use kic::KicRunner;
pub use ssh::{SshClient, SshRunner, SshTarget};
pub use sysinit::{InitSystem, ServiceError, ServiceManager};
