//! Error kinds surfaced by the bootstrapper.
//!
//! Operations return `anyhow::Result`; the kinds here are attached so callers
//! can classify a failure with `downcast_ref`.

use command_runner::RunResult;
use thiserror::Error;

/// Why a bootstrap step failed.
#[derive(Error, Debug)]
pub enum BootstrapError {
    /// Invalid user input: unknown component, bad version, bad permissions,
    /// unknown CNI, conflicting IP families and the like.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// The requested container runtime is not installed on the host.
    #[error("container runtime {runtime} is not available: {reason}")]
    RuntimeUnavailable {
        /// The runtime that was asked for.
        runtime: String,
        /// What the availability probe reported.
        reason: String,
    },
    /// Another runtime stayed active after being disabled.
    #[error("container runtime {0} is still active after being disabled")]
    MutualExclusion(String),
    /// A copy, read or remove on the host failed.
    #[error("transfer of {path} failed: {reason}")]
    Transfer {
        /// The guest path involved.
        path: String,
        /// The underlying failure.
        reason: String,
    },
    /// `kubeadm` exited non-zero. Its output is attached verbatim.
    #[error("{command} failed with exit code {exit_code}\nstdout:\n{stdout}\nstderr:\n{stderr}")]
    BootstrapFailure {
        /// The command line.
        command: String,
        /// kubeadm's exit code.
        exit_code: i32,
        /// Captured stdout.
        stdout: String,
        /// Captured stderr.
        stderr: String,
    },
    /// The cancellation signal fired.
    #[error("cancelled")]
    Cancelled,
}

impl BootstrapError {
    /// Shorthand for [`BootstrapError::Configuration`].
    pub fn config(msg: impl Into<String>) -> Self {
        BootstrapError::Configuration(msg.into())
    }

    /// Builds a [`BootstrapError::BootstrapFailure`] from a command result.
    pub fn bootstrap_failure(result: &RunResult) -> Self {
        BootstrapError::BootstrapFailure {
            command: result.command(),
            exit_code: result.exit_code,
            stdout: result.stdout_str(),
            stderr: result.stderr_str(),
        }
    }
}

/// Marks a failure as worth retrying, such as a timeout talking to the API
/// server.
#[derive(Error, Debug)]
#[error("temporary error: {0}")]
pub struct RetriableError(#[source] pub anyhow::Error);

/// Reports whether `err` (or anything it wraps) is a [`RetriableError`].
pub fn is_retriable(err: &anyhow::Error) -> bool {
    err.chain().any(|e| e.is::<RetriableError>())
}

/// Reports whether `err` (or anything it wraps) is a cancellation.
pub fn is_cancelled(err: &anyhow::Error) -> bool {
    err.chain().any(|e| {
        matches!(e.downcast_ref::<BootstrapError>(), Some(BootstrapError::Cancelled))
            || matches!(
                e.downcast_ref::<command_runner::RunError>(),
                Some(command_runner::RunError::Cancelled { .. })
            )
    })
}
