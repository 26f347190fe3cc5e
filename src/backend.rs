//! Execution backends: the capability to run one isolated command.
//!
//! The backend system mirrors a factory/handle split:
//!
//! - [`Backend`] - starts an isolated instance for a [`JobDescriptor`]
//! - [`Instance`] - one started instance that can be awaited, killed,
//!   drained of its output and removed
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                        Backend                           │
//! │  start(&JobDescriptor) ─────────► Instance               │
//! └───────────────────────────────────────┼──────────────────┘
//!                                         ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │                        Instance                          │
//! │  wait()            ───► InstanceExit                     │
//! │  kill()                                                  │
//! │  collect_output()  (stdout/stderr + writable mounts)     │
//! │  remove()                                                │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Backends never decide the outcome of a job: they report raw exit data
//! and faults, and the [`LifecycleController`](crate::lifecycle::LifecycleController)
//! turns those into an [`ExecutionOutcome`](crate::job::ExecutionOutcome)
//! while guaranteeing cleanup.
//!
//! # Built-in Backends
//!
//! | Backend | Module | Description |
//! |---------|--------|-------------|
//! | Docker | [`docker`] | Ephemeral container per job on the local engine |
//! | Device | [`device`] | One remote board reached over `ssh` |

pub mod device;
pub mod docker;

#[cfg(test)]
pub(crate) mod mock;

use std::path::Path;

use async_trait::async_trait;

use crate::job::JobDescriptor;

/// Result type for backend operations.
pub type BackendResult<T> = Result<T, BackendError>;

/// Errors raised by a backend.
///
/// A program that runs and exits non-zero is not an error; it is reported
/// through [`InstanceExit::status_code`].
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// The instance could not be created or started.
    #[error("Failed to start instance: {0}")]
    StartFailed(String),

    /// Waiting for termination failed (engine unreachable, protocol error).
    #[error("Failed to wait for instance: {0}")]
    WaitFailed(String),

    #[error("Failed to kill instance: {0}")]
    KillFailed(String),

    #[error("Failed to remove instance: {0}")]
    RemoveFailed(String),

    /// Copying files into or out of the instance failed.
    #[error("Failed to transfer files: {0}")]
    TransferFailed(String),

    #[error("Connection error: {0}")]
    Connection(String),

    /// A backend call did not finish within its allotted time.
    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Raw termination report of an instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceExit {
    /// Program exit code.
    pub status_code: i64,
    /// Engine-level error reported alongside the exit, if any.
    pub error: Option<String>,
}

impl InstanceExit {
    pub fn code(status_code: i64) -> Self {
        Self {
            status_code,
            error: None,
        }
    }

    pub fn engine_error(message: impl Into<String>) -> Self {
        Self {
            status_code: -1,
            error: Some(message.into()),
        }
    }
}

/// One started, isolated execution.
#[async_trait]
pub trait Instance: Send + Sync {
    /// Identifier for logs and postmortem inspection.
    fn id(&self) -> &str;

    /// Blocks until the instance terminates.
    ///
    /// Not bounded by any timeout; callers race it against the job's budget.
    /// Dropping the returned future must leave the instance killable.
    async fn wait(&self) -> BackendResult<InstanceExit>;

    /// Forcibly stops the instance.
    async fn kill(&self) -> BackendResult<()>;

    /// Writes the instance's stdout and stderr to the given host files and
    /// copies any writable mount contents back to the host.
    /// Must complete before [`remove`](Self::remove) is called.
    async fn collect_output(&self, stdout: &Path, stderr: &Path) -> BackendResult<()>;

    /// Reclaims the instance and everything it holds.
    async fn remove(&self) -> BackendResult<()>;
}

/// Factory for isolated instances.
///
/// Implementations must be shareable across worker tasks.
#[async_trait]
pub trait Backend: Send + Sync {
    /// The instance type started by this backend.
    type Instance: Instance;

    /// Starts `job` detached and returns its handle.
    ///
    /// If startup fails half-way the backend reclaims whatever it created
    /// before returning the error.
    async fn start(&self, job: &JobDescriptor) -> BackendResult<Self::Instance>;

    /// Backend name for logging.
    fn name(&self) -> &str;
}
