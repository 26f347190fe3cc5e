//! Configuration loading and validation.
//!
//! The file format is TOML; see [`schema`] for every section and its
//! defaults. Paths may start with `~`, which is expanded on load.

pub mod schema;

pub use schema::*;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};

use crate::pipeline::plan::RunType;

/// Semantic configuration errors, found after parsing.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("judge.num_parallel must be at least 1")]
    ZeroParallelism,

    #[error("judge.timeout_secs must be at least 1")]
    ZeroTimeout,

    #[error("Invalid memory limit '{0}': expected bytes or a number with a k, m or g suffix")]
    InvalidMemoryLimit(String),

    #[error("Run type '{0}' needs at least one address in [devices]")]
    NoDevices(RunType),
}

/// Starter configuration written by `init`.
pub const EXAMPLE_CONFIG: &str = r#"[judge]
num_parallel = 4
timeout_secs = 60
memory_limit = "256m"
run_type = "qemu-arm"
rebuild_compiler = true
jvm_options = ""
opt_options = ""

[compiler]
src = "compiler/src"
build = "compiler/target"
# lib = "compiler/lib"

[testcases]
base = "testcases"
select = ["functional"]

[docker]
java_image = "openjdk:17-oracle"
sysy_image = "sysy:tobisc"

# [devices]
# addresses = ["pi@192.168.1.21"]
# key_path = "~/.ssh/id_ed25519"

[report]
log_dir = "logs"
"#;

impl Config {
    /// Checks constraints serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.judge.num_parallel == 0 {
            return Err(ConfigError::ZeroParallelism);
        }
        if self.judge.timeout_secs == 0 {
            return Err(ConfigError::ZeroTimeout);
        }
        parse_memory_limit(&self.judge.memory_limit)?;
        if self.judge.run_type.needs_devices() && self.devices.addresses.is_empty() {
            return Err(ConfigError::NoDevices(self.judge.run_type));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.judge.timeout_secs)
    }

    pub fn memory_limit_bytes(&self) -> Result<i64, ConfigError> {
        parse_memory_limit(&self.judge.memory_limit)
    }

    fn expand_paths(&mut self) {
        self.compiler.src = expand(&self.compiler.src);
        self.compiler.build = expand(&self.compiler.build);
        self.compiler.lib = self.compiler.lib.as_deref().map(expand);
        self.testcases.base = expand(&self.testcases.base);
        self.devices.key_path = self.devices.key_path.as_deref().map(expand);
        self.report.log_dir = expand(&self.report.log_dir);
    }
}

fn expand(path: &Path) -> PathBuf {
    PathBuf::from(shellexpand::tilde(&path.to_string_lossy()).into_owned())
}

/// Parses `512k`, `256m`, `1g` (case-insensitive, optional trailing `b`)
/// or a plain byte count.
pub fn parse_memory_limit(limit: &str) -> Result<i64, ConfigError> {
    let invalid = || ConfigError::InvalidMemoryLimit(limit.to_string());

    let s = limit.trim().to_ascii_lowercase();
    let s = s.strip_suffix('b').unwrap_or(&s);
    let (digits, multiplier) = match s.chars().last() {
        Some('k') => (&s[..s.len() - 1], 1i64 << 10),
        Some('m') => (&s[..s.len() - 1], 1i64 << 20),
        Some('g') => (&s[..s.len() - 1], 1i64 << 30),
        Some(c) if c.is_ascii_digit() => (s, 1),
        _ => return Err(invalid()),
    };

    let value: i64 = digits.parse().map_err(|_| invalid())?;
    if value <= 0 {
        return Err(invalid());
    }
    value.checked_mul(multiplier).ok_or_else(invalid)
}

/// Loads, expands and validates the configuration file at `path`.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config = parse(&content)
        .with_context(|| format!("Invalid config file: {}", path.display()))?;

    Ok(config)
}

/// Loads configuration from a TOML string.
///
/// ```
/// use compiler_judge::config::load_config_str;
///
/// let config = load_config_str(r#"
///     [judge]
///     run_type = "llvm"
///     num_parallel = 2
///
///     [compiler]
///     src = "src"
///     build = "target"
///
///     [testcases]
///     base = "cases"
/// "#)?;
///
/// assert_eq!(config.judge.num_parallel, 2);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config_str(content: &str) -> Result<Config> {
    parse(content)
}

fn parse(content: &str) -> Result<Config> {
    let mut config: Config = toml::from_str(content).context("Failed to parse config")?;
    config.expand_paths();
    config.validate()?;
    Ok(config)
}
