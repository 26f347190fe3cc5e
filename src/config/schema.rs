//! Configuration schema.
//!
//! All types deserialize from TOML. Optional sections and fields fall back
//! to the defaults listed on each type.
//!
//! # Schema Overview
//!
//! ```text
//! Config (root)
//! ├── JudgeConfig      - Parallelism, limits, run type, debug switches
//! ├── CompilerConfig   - Compiler sources, build output, libraries
//! ├── TestcasesConfig  - Test case tree and selection
//! ├── DockerConfig     - Engine endpoint and images
//! ├── DevicesConfig    - Remote boards for the `rpi` run type
//! └── ReportConfig     - Log directory and report formats
//! ```

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::pipeline::commands::{JAVA_IMAGE, SYSY_IMAGE};
use crate::pipeline::plan::RunType;

/// Root configuration.
///
/// # Example
///
/// ```
/// use compiler_judge::config::Config;
///
/// let config: Config = toml::from_str(r#"
///     [judge]
///     run_type = "qemu-arm"
///
///     [compiler]
///     src = "compiler/src"
///     build = "compiler/target"
///
///     [testcases]
///     base = "testcases"
/// "#).unwrap();
///
/// assert_eq!(config.judge.num_parallel, 4);
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub judge: JudgeConfig,

    pub compiler: CompilerConfig,

    pub testcases: TestcasesConfig,

    #[serde(default)]
    pub docker: DockerConfig,

    /// Only needed by run types that execute on remote boards.
    #[serde(default)]
    pub devices: DevicesConfig,

    #[serde(default)]
    pub report: ReportConfig,
}

/// Core judge settings.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `num_parallel` | 4 |
/// | `timeout_secs` | 60 |
/// | `memory_limit` | `"256m"` |
/// | `rebuild_compiler` | true |
/// | `cache_source` | false |
/// | `keep_containers` | false |
/// | `emit_llvm` | false |
/// | `kill_failure_threshold` | 3 |
///
/// # Example
///
/// ```toml
/// [judge]
/// num_parallel = 8
/// timeout_secs = 30
/// memory_limit = "512m"
/// run_type = "both"
/// jvm_options = "-Xss512m"
/// opt_options = "-O2"
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JudgeConfig {
    /// Number of test cases in flight at once.
    #[serde(default = "default_num_parallel")]
    pub num_parallel: usize,

    /// Wall-clock limit of every job, in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Memory limit of every container: bytes, or a number with a `k`, `m`
    /// or `g` suffix.
    #[serde(default = "default_memory_limit")]
    pub memory_limit: String,

    pub run_type: RunType,

    /// Build `compiler.jar` before running test cases.
    #[serde(default = "default_true")]
    pub rebuild_compiler: bool,

    /// Archive the compiler sources into the run directory.
    #[serde(default)]
    pub cache_source: bool,

    /// Leave containers and remote job directories behind for inspection.
    #[serde(default)]
    pub keep_containers: bool,

    /// Also emit LLVM IR when compiling to assembly.
    #[serde(default)]
    pub emit_llvm: bool,

    /// Extra arguments for `java`.
    #[serde(default)]
    pub jvm_options: String,

    /// Extra arguments for the compiler (optimisation flags).
    #[serde(default)]
    pub opt_options: String,

    /// Kill failures tolerated before each further one is logged as an error.
    #[serde(default = "default_kill_failure_threshold")]
    pub kill_failure_threshold: usize,
}

fn default_num_parallel() -> usize {
    4
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_memory_limit() -> String {
    "256m".to_string()
}

fn default_true() -> bool {
    true
}

fn default_kill_failure_threshold() -> usize {
    crate::lifecycle::DEFAULT_KILL_FAILURE_THRESHOLD
}

/// Location of the compiler under test.
///
/// ```toml
/// [compiler]
/// src = "~/compiler/src"
/// build = "~/compiler/target"
/// lib = "~/compiler/lib"
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CompilerConfig {
    /// Java source tree.
    pub src: PathBuf,

    /// Build directory; receives `compiler.jar`.
    pub build: PathBuf,

    /// Directory of `*.jar` libraries the compiler depends on.
    pub lib: Option<PathBuf>,
}

impl CompilerConfig {
    pub fn jar(&self) -> PathBuf {
        self.build.join("compiler.jar")
    }
}

/// Test case tree and selection.
///
/// An empty `select` runs every test case.
///
/// ```toml
/// [testcases]
/// base = "testcases"
/// select = ["functional", "performance/fft*"]
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TestcasesConfig {
    pub base: PathBuf,

    #[serde(default)]
    pub select: Vec<String>,
}

/// Docker engine endpoint and images.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DockerConfig {
    /// Engine address such as `tcp://10.0.0.5:2375`. Uses the local socket
    /// when unset.
    pub host: Option<String>,

    #[serde(default = "default_java_image")]
    pub java_image: String,

    #[serde(default = "default_sysy_image")]
    pub sysy_image: String,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            host: None,
            java_image: default_java_image(),
            sysy_image: default_sysy_image(),
        }
    }
}

fn default_java_image() -> String {
    JAVA_IMAGE.to_string()
}

fn default_sysy_image() -> String {
    SYSY_IMAGE.to_string()
}

/// Remote boards reached over `ssh`.
///
/// # Example
///
/// ```toml
/// [devices]
/// addresses = ["pi@192.168.1.21", "pi@192.168.1.22"]
/// key_path = "~/.ssh/id_ed25519"
/// disable_host_key_check = true
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DevicesConfig {
    /// One entry per board, `user@host` or `host`.
    #[serde(default)]
    pub addresses: Vec<String>,

    #[serde(default = "default_ssh_port")]
    pub port: u16,

    /// Private key; `~` is expanded.
    pub key_path: Option<PathBuf>,

    /// Directory on the boards under which job directories are created.
    #[serde(default = "default_device_work_dir")]
    pub work_dir: String,

    #[serde(default)]
    pub disable_host_key_check: bool,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Upper bound for each auxiliary `ssh` call (upload, copy-back, kill,
    /// cleanup).
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
}

impl Default for DevicesConfig {
    fn default() -> Self {
        Self {
            addresses: Vec::new(),
            port: default_ssh_port(),
            key_path: None,
            work_dir: default_device_work_dir(),
            disable_host_key_check: false,
            connect_timeout_secs: default_connect_timeout(),
            command_timeout_secs: default_command_timeout(),
        }
    }
}

fn default_ssh_port() -> u16 {
    22
}

fn default_device_work_dir() -> String {
    "/tmp/compiler-judge".to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_command_timeout() -> u64 {
    60
}

/// Log directory and report formats.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReportConfig {
    /// Parent of the per-run directories.
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    #[serde(default = "default_true")]
    pub html: bool,

    #[serde(default = "default_true")]
    pub json: bool,

    #[serde(default = "default_true")]
    pub text: bool,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            log_dir: default_log_dir(),
            html: true,
            json: true,
            text: true,
        }
    }
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}
