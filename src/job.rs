//! Job descriptors and execution outcomes.
//!
//! A [`JobDescriptor`] describes one isolated, resource-bounded command
//! execution: which image (or device) runs it, the shell command, the bind
//! mount table, and the memory and wall-clock limits. Descriptors are built
//! once per pipeline stage with the fluent builder methods and are only ever
//! read afterwards.
//!
//! The result of running a descriptor is an [`ExecutionOutcome`]. Expected
//! failures (a program exiting non-zero, a job running out of time) and
//! infrastructure faults are distinct variants, so callers never need a
//! catch-all error handler to tell them apart.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use compiler_judge::job::{JobDescriptor, Mount, StageKind};
//!
//! let job = JobDescriptor::new("compile", "openjdk:17-oracle", "java -jar compiler.jar -S test.sy")
//!     .kind(StageKind::Compile)
//!     .working_dir("/compiler")
//!     .mount(Mount::read_only("/tmp/case/test.sy", "/compiler/test.sy"))
//!     .mount(Mount::read_write("/tmp/case", "/output/"))
//!     .memory_limit(256 * 1024 * 1024)
//!     .timeout(Duration::from_secs(60));
//!
//! assert_eq!(job.mounts.len(), 2);
//! assert!(job.instance_name.ends_with("compile"));
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;

use crate::backend::InstanceExit;

/// Access mode of a bind mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountMode {
    ReadOnly,
    ReadWrite,
}

/// A single entry of a job's mount table.
///
/// A container path ending in `/` denotes a directory mount; anything else
/// is a single file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    /// Path on the host.
    pub host: PathBuf,
    /// Path inside the isolated instance.
    pub container: String,
    pub mode: MountMode,
}

impl Mount {
    /// Creates a read-only mount.
    pub fn read_only(host: impl Into<PathBuf>, container: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            container: container.into(),
            mode: MountMode::ReadOnly,
        }
    }

    /// Creates a read-write mount.
    pub fn read_write(host: impl Into<PathBuf>, container: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            container: container.into(),
            mode: MountMode::ReadWrite,
        }
    }

    /// Returns `true` if the mount binds a directory rather than a file.
    pub fn is_dir(&self) -> bool {
        self.container.ends_with('/')
    }

    /// Returns `true` for read-write mounts.
    pub fn is_writable(&self) -> bool {
        self.mode == MountMode::ReadWrite
    }

    /// Formats the mount as a Docker bind specification
    /// (`host:container:ro|rw`).
    pub fn to_bind(&self) -> String {
        let mode = match self.mode {
            MountMode::ReadOnly => "ro",
            MountMode::ReadWrite => "rw",
        };
        format!(
            "{}:{}:{}",
            self.host.display(),
            self.container.trim_end_matches('/'),
            mode
        )
    }

    /// Makes sure the host side of the mount exists before the job starts.
    ///
    /// Read-write targets are created (an empty file or a directory);
    /// a missing read-only source is an error, since binding it would make
    /// the engine silently create an empty directory in its place.
    pub fn prepare(&self) -> std::io::Result<()> {
        if self.host.exists() {
            return Ok(());
        }
        match self.mode {
            MountMode::ReadOnly => Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("mount source {} does not exist", self.host.display()),
            )),
            MountMode::ReadWrite if self.is_dir() => std::fs::create_dir_all(&self.host),
            MountMode::ReadWrite => {
                if let Some(parent) = self.host.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::File::create(&self.host).map(|_| ())
            }
        }
    }
}

/// Where a job executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecTarget {
    /// An ephemeral container on the local engine.
    Local,
    /// A leased remote device from the device pool.
    Device,
}

/// Logical role of a job within a pipeline.
///
/// Used to derive the verdict when the job is the first one that fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StageKind {
    /// One-time compiler build.
    Build,
    /// Source to IR / assembly.
    Compile,
    /// Assembly to ELF.
    Assemble,
    /// Program execution (native, emulated or interpreted).
    Run,
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StageKind::Build => "build",
            StageKind::Compile => "compile",
            StageKind::Assemble => "assemble",
            StageKind::Run => "run",
        };
        f.write_str(s)
    }
}

/// Description of one isolated job.
#[derive(Debug, Clone)]
pub struct JobDescriptor {
    /// Human-readable job name (`compile`, `run-qemu`, ...).
    pub name: String,
    /// Unique name of the backing instance (container name, remote directory).
    pub instance_name: String,
    pub kind: StageKind,
    pub target: ExecTarget,
    /// Image identity for container backends; ignored by devices.
    pub image: String,
    /// Shell command, run as `/bin/sh -c <command>`.
    pub command: String,
    pub working_dir: String,
    pub mounts: Vec<Mount>,
    /// Memory limit in bytes.
    pub memory_limit: Option<i64>,
    /// Wall-clock limit for the whole job.
    pub timeout: Duration,
    /// Host directory that receives the instance's stdout and stderr.
    pub output_dir: PathBuf,
}

impl JobDescriptor {
    /// Creates a descriptor with a unique instance name, no mounts, no memory
    /// limit and a 60 second timeout.
    pub fn new(
        name: impl Into<String>,
        image: impl Into<String>,
        command: impl Into<String>,
    ) -> Self {
        let name = name.into();
        let short_id = uuid::Uuid::new_v4().simple().to_string();
        let instance_name = sanitize_name(&format!("judge-{}-{}", &short_id[..8], name));
        Self {
            name,
            instance_name,
            kind: StageKind::Run,
            target: ExecTarget::Local,
            image: image.into(),
            command: command.into(),
            working_dir: "/".to_string(),
            mounts: Vec::new(),
            memory_limit: None,
            timeout: Duration::from_secs(60),
            output_dir: std::env::temp_dir(),
        }
    }

    /// Overrides the generated instance name. Characters the engine does
    /// not accept are replaced with `_`.
    pub fn instance_name(mut self, name: impl AsRef<str>) -> Self {
        self.instance_name = sanitize_name(name.as_ref());
        self
    }

    pub fn kind(mut self, kind: StageKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn target(mut self, target: ExecTarget) -> Self {
        self.target = target;
        self
    }

    pub fn image(mut self, image: impl Into<String>) -> Self {
        self.image = image.into();
        self
    }

    pub fn command(mut self, command: impl Into<String>) -> Self {
        self.command = command.into();
        self
    }

    pub fn working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = dir.into();
        self
    }

    /// Adds a bind mount.
    pub fn mount(mut self, mount: Mount) -> Self {
        self.mounts.push(mount);
        self
    }

    pub fn memory_limit(mut self, bytes: i64) -> Self {
        self.memory_limit = Some(bytes);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    /// Docker bind strings for the whole mount table.
    pub fn binds(&self) -> Vec<String> {
        self.mounts.iter().map(Mount::to_bind).collect()
    }

    /// Host paths of the files receiving the instance's stdout and stderr.
    pub fn log_paths(&self) -> (PathBuf, PathBuf) {
        log_paths(&self.output_dir, &self.name)
    }

    /// Prepares every mount of the table, see [`Mount::prepare`].
    pub fn prepare_mounts(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.output_dir)?;
        self.mounts.iter().try_for_each(Mount::prepare)
    }
}

fn log_paths(dir: &Path, name: &str) -> (PathBuf, PathBuf) {
    (
        dir.join(format!("{}.stdout.log", name)),
        dir.join(format!("{}.stderr.log", name)),
    )
}

/// Replaces characters outside `[A-Za-z0-9_.-]` so the name is accepted as a
/// container name.
pub fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Terminal status of one job. Exactly one variant per completed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    /// The program exited with code zero.
    Success,
    /// The program reported failure. Expected; recorded as a verdict.
    NonZeroExit(i64),
    /// The job exceeded its wall-clock budget and was killed.
    TimedOut,
    /// Engine-level fault: unreachable backend, protocol error, resource
    /// exhaustion, engine-reported container error.
    InternalError(String),
}

impl ExecutionOutcome {
    /// Classifies an instance's exit report.
    ///
    /// An engine-reported error wins over the program exit code.
    pub fn from_exit(exit: &InstanceExit) -> Self {
        match (&exit.error, exit.status_code) {
            (Some(err), _) => ExecutionOutcome::InternalError(err.clone()),
            (None, 0) => ExecutionOutcome::Success,
            (None, code) => ExecutionOutcome::NonZeroExit(code),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionOutcome::Success)
    }
}

impl fmt::Display for ExecutionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionOutcome::Success => write!(f, "success"),
            ExecutionOutcome::NonZeroExit(code) => write!(f, "exit {}", code),
            ExecutionOutcome::TimedOut => write!(f, "timed out"),
            ExecutionOutcome::InternalError(cause) => write!(f, "internal error: {}", cause),
        }
    }
}
