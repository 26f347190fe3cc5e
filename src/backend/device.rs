//! Remote device backend.
//!
//! Runs jobs on a physical board (a Raspberry Pi or similar) reachable over
//! SSH. Each [`DeviceBackend`] is bound to exactly one device address; the
//! [`DevicePool`](crate::device_pool::DevicePool) hands them out exclusively,
//! so a device never runs two jobs at once.
//!
//! # Job Layout on the Device
//!
//! A job's mount table is re-rooted under a per-job directory:
//!
//! ```text
//! <work_dir>/<instance_name>/compiler/test.elf   <- /compiler/test.elf
//! <work_dir>/<instance_name>/output/             <- /output/
//! ```
//!
//! Mount sources are shipped as one tar stream over `ssh` before the command
//! starts. After the command ends, writable mounts are streamed back the
//! same way, and the job directory is deleted on removal.
//!
//! The command runs in its own session under `setsid`, and its process group
//! id is recorded in `<job root>/.pid`. Killing an instance kills that whole
//! group on the device, not just the local `ssh` client.
//!
//! # Example Configuration
//!
//! ```toml
//! [devices]
//! addresses = ["pi@192.168.1.21", "pi@192.168.1.22"]
//! port = 22
//! key_path = "~/.ssh/id_ed25519"
//! work_dir = "/tmp/compiler-judge"
//! ```
//!
//! # Limitations
//!
//! - Uses the system `ssh` binary; key-based authentication only
//! - The memory limit is applied as `ulimit -v` (virtual memory, in KiB)
//! - An `ssh` exit status of 255 is treated as a connection failure
//! - Every auxiliary `ssh` call is bounded by `command_timeout_secs`

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Child;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{Backend, BackendError, BackendResult, Instance, InstanceExit};
use crate::config::DevicesConfig;
use crate::job::{JobDescriptor, Mount};

/// How long to wait for the output readers once the command has ended.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// `ssh` exits with 255 when the connection itself fails.
const SSH_CONNECTION_FAILURE: i32 = 255;

/// Holds the process group id of the running command, inside the job root.
const PID_FILE: &str = ".pid";

/// Connection parameters for one device.
#[derive(Debug, Clone)]
struct SshTarget {
    destination: String,
    options: Vec<String>,
    /// Bound for [`SshTarget::run`].
    timeout: Duration,
}

impl SshTarget {
    fn command(&self, remote_cmd: &str) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new("ssh");
        cmd.args(&self.options);
        cmd.arg(&self.destination);
        cmd.arg(remote_cmd);
        cmd
    }

    /// Runs a short remote command to completion, feeding `input` on stdin.
    ///
    /// The local `ssh` process is killed if the call exceeds the target's
    /// timeout.
    async fn run(&self, remote_cmd: &str, input: Option<&[u8]>) -> BackendResult<std::process::Output> {
        let mut cmd = self.command(remote_cmd);
        cmd.stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| BackendError::Connection(format!("{}: {}", self.destination, e)))?;

        let exchange = async move {
            if let Some(data) = input
                && let Some(mut stdin) = child.stdin.take()
            {
                stdin.write_all(data).await?;
                stdin.shutdown().await?;
            }
            child.wait_with_output().await
        };

        tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| {
                BackendError::Timeout(format!(
                    "ssh to {} did not finish within {}s",
                    self.destination,
                    self.timeout.as_secs()
                ))
            })?
            .map_err(BackendError::from)
    }
}

/// Backend bound to a single remote device.
pub struct DeviceBackend {
    target: SshTarget,
    work_dir: String,
}

impl DeviceBackend {
    /// Creates a backend for the device at `address` (`user@host` or `host`).
    pub fn new(address: &str, config: &DevicesConfig) -> Self {
        let mut options = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", config.connect_timeout_secs),
            "-o".to_string(),
            "ServerAliveInterval=5".to_string(),
            "-o".to_string(),
            "ServerAliveCountMax=3".to_string(),
        ];

        if config.disable_host_key_check {
            options.push("-o".to_string());
            options.push("StrictHostKeyChecking=no".to_string());
            options.push("-o".to_string());
            options.push("UserKnownHostsFile=/dev/null".to_string());
        }

        if let Some(key_path) = &config.key_path {
            let key = shellexpand::tilde(&key_path.to_string_lossy()).into_owned();
            options.push("-i".to_string());
            options.push(key);
        }

        options.push("-p".to_string());
        options.push(config.port.to_string());

        Self {
            target: SshTarget {
                destination: address.to_string(),
                options,
                timeout: Duration::from_secs(config.command_timeout_secs),
            },
            work_dir: config.work_dir.trim_end_matches('/').to_string(),
        }
    }

    /// The device address this backend is bound to.
    pub fn address(&self) -> &str {
        &self.target.destination
    }

    fn job_root(&self, job: &JobDescriptor) -> String {
        format!("{}/{}", self.work_dir, job.instance_name)
    }
}

#[async_trait]
impl Backend for DeviceBackend {
    type Instance = DeviceInstance;

    async fn start(&self, job: &JobDescriptor) -> BackendResult<DeviceInstance> {
        let root = self.job_root(job);

        let archive = mount_archive(&job.mounts)
            .map_err(|e| BackendError::TransferFailed(e.to_string()))?;
        let setup = format!(
            "mkdir -p {root} && tar -C {root} -xf -",
            root = shell_words::quote(&root)
        );
        let output = self.target.run(&setup, Some(&archive)).await?;
        if !output.status.success() {
            // The directory may exist partially; drop it before reporting.
            match self.target.run(&remove_command(&root), None).await {
                Ok(cleanup) if !cleanup.status.success() => warn!(
                    "Failed to clean up {} on {}: {}",
                    root,
                    self.address(),
                    String::from_utf8_lossy(&cleanup.stderr).trim()
                ),
                Err(e) => warn!("Failed to clean up {} on {}: {}", root, self.address(), e),
                Ok(_) => {}
            }
            return Err(BackendError::StartFailed(format!(
                "{}: {}",
                self.address(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let mut cmd = self.target.command(&remote_command(&root, job));
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| BackendError::StartFailed(format!("{}: {}", self.address(), e)))?;

        let stdout_task = child.stdout.take().map(|mut out| {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                out.read_to_end(&mut buf).await?;
                Ok::<_, std::io::Error>(buf)
            })
        });
        let stderr_task = child.stderr.take().map(|mut err| {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                err.read_to_end(&mut buf).await?;
                Ok::<_, std::io::Error>(buf)
            })
        });

        debug!("Started {} on device {}", job.instance_name, self.address());

        Ok(DeviceInstance {
            name: job.instance_name.clone(),
            root,
            target: self.target.clone(),
            writable: job.mounts.iter().filter(|m| m.is_writable()).cloned().collect(),
            child: Mutex::new(child),
            stdout_task: Mutex::new(stdout_task),
            stderr_task: Mutex::new(stderr_task),
        })
    }

    fn name(&self) -> &str {
        self.address()
    }
}

/// A command running on a remote device.
pub struct DeviceInstance {
    name: String,
    root: String,
    target: SshTarget,
    writable: Vec<Mount>,
    child: Mutex<Child>,
    stdout_task: Mutex<Option<OutputReader>>,
    stderr_task: Mutex<Option<OutputReader>>,
}

type OutputReader = JoinHandle<std::io::Result<Vec<u8>>>;

impl DeviceInstance {
    async fn copy_back(&self, mount: &Mount) -> BackendResult<()> {
        let remote = reroot(&self.root, &mount.container);
        if mount.is_dir() {
            let cmd = format!("tar -C {} -cf - .", shell_words::quote(&remote));
            let output = self.target.run(&cmd, None).await?;
            if !output.status.success() {
                return Err(BackendError::TransferFailed(format!(
                    "{}: {}",
                    remote,
                    String::from_utf8_lossy(&output.stderr).trim()
                )));
            }
            std::fs::create_dir_all(&mount.host)?;
            tar::Archive::new(output.stdout.as_slice()).unpack(&mount.host)?;
        } else {
            let cmd = format!("cat {}", shell_words::quote(&remote));
            let output = self.target.run(&cmd, None).await?;
            if !output.status.success() {
                return Err(BackendError::TransferFailed(format!(
                    "{}: {}",
                    remote,
                    String::from_utf8_lossy(&output.stderr).trim()
                )));
            }
            tokio::fs::write(&mount.host, output.stdout).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Instance for DeviceInstance {
    fn id(&self) -> &str {
        &self.name
    }

    async fn wait(&self) -> BackendResult<InstanceExit> {
        let status = self
            .child
            .lock()
            .await
            .wait()
            .await
            .map_err(|e| BackendError::WaitFailed(e.to_string()))?;

        Ok(match status.code() {
            Some(SSH_CONNECTION_FAILURE) => InstanceExit::engine_error(format!(
                "lost connection to {}",
                self.target.destination
            )),
            Some(code) => InstanceExit::code(code as i64),
            None => InstanceExit::engine_error("ssh terminated by signal"),
        })
    }

    async fn kill(&self) -> BackendResult<()> {
        let remote = self
            .target
            .run(&kill_command(&self.root), None)
            .await
            .map_err(|e| BackendError::KillFailed(format!("{}: {}", self.name, e)));

        // The remote group is gone (or unreachable); drop the local session too.
        if let Err(e) = self.child.lock().await.start_kill() {
            debug!("Local ssh session of {} already gone: {}", self.name, e);
        }

        let output = remote?;
        if output.status.success() {
            Ok(())
        } else {
            Err(BackendError::KillFailed(format!(
                "{}: {}",
                self.name,
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }

    async fn collect_output(&self, stdout: &Path, stderr: &Path) -> BackendResult<()> {
        let out = drain(self.stdout_task.lock().await.take()).await?;
        let err = drain(self.stderr_task.lock().await.take()).await?;
        tokio::fs::write(stdout, out).await?;
        tokio::fs::write(stderr, err).await?;

        for mount in &self.writable {
            self.copy_back(mount).await?;
        }
        Ok(())
    }

    async fn remove(&self) -> BackendResult<()> {
        let output = self
            .target
            .run(&remove_command(&self.root), None)
            .await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(BackendError::RemoveFailed(format!(
                "{}: {}",
                self.root,
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }
}

/// Waits for an output reader. Partial output is never returned as if it
/// were complete.
async fn drain(task: Option<OutputReader>) -> BackendResult<Vec<u8>> {
    let Some(task) = task else {
        return Ok(Vec::new());
    };
    match tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, task).await {
        Ok(Ok(Ok(buf))) => Ok(buf),
        Ok(Ok(Err(e))) => Err(BackendError::TransferFailed(format!(
            "reading remote output: {}",
            e
        ))),
        Ok(Err(e)) => Err(BackendError::TransferFailed(format!(
            "output reader failed: {}",
            e
        ))),
        Err(_) => Err(BackendError::Timeout(format!(
            "remote output not drained within {}s",
            OUTPUT_DRAIN_TIMEOUT.as_secs()
        ))),
    }
}

/// Shell command run over `ssh` for a job rooted at `root`.
///
/// The job's command becomes the leader of a new session, so its pid is
/// also the id of the process group [`kill_command`] targets. The exit
/// status of the command is the exit status of the whole script.
fn remote_command(root: &str, job: &JobDescriptor) -> String {
    let mut script = format!(
        "cd {} && ",
        shell_words::quote(&reroot(root, &job.working_dir))
    );
    if let Some(bytes) = job.memory_limit.filter(|b| *b > 0) {
        script.push_str(&format!("ulimit -v {} && ", bytes / 1024));
    }
    script.push_str(&format!(
        "{{ setsid /bin/sh -c {} & echo $! > {}; wait $!; }}",
        shell_words::quote(&job.command),
        shell_words::quote(&format!("{}/{}", root, PID_FILE))
    ));
    script
}

/// Kills the process group recorded for `root`. Succeeds when the group was
/// killed or had already exited.
fn kill_command(root: &str) -> String {
    format!(
        "pid=$(cat {}) && {{ kill -KILL -- -$pid 2>/dev/null || ! kill -0 -- -$pid 2>/dev/null; }}",
        shell_words::quote(&format!("{}/{}", root, PID_FILE))
    )
}

fn remove_command(root: &str) -> String {
    format!("rm -rf {}", shell_words::quote(root))
}

/// Maps an absolute instance path under the job's remote root.
fn reroot(root: &str, container_path: &str) -> String {
    let relative = container_path.trim_start_matches('/').trim_end_matches('/');
    if relative.is_empty() {
        root.to_string()
    } else {
        format!("{}/{}", root, relative)
    }
}

/// Packs every mount source into a tar stream laid out by container path.
fn mount_archive(mounts: &[Mount]) -> std::io::Result<Vec<u8>> {
    let mut archive = tar::Builder::new(Vec::new());

    for mount in mounts {
        let entry = PathBuf::from(mount.container.trim_start_matches('/').trim_end_matches('/'));
        if mount.host.is_dir() {
            archive.append_dir_all(&entry, &mount.host)?;
        } else {
            archive.append_path_with_name(&mount.host, &entry)?;
        }
    }

    archive.into_inner()
}
