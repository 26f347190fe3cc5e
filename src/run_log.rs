//! Per-run log directory and logging setup.
//!
//! Every run gets an identifier `%Y_%m_%d_%H_%M_%S_<pid>` and a directory
//! `<log_dir>/<run_id>/` holding:
//!
//! ```text
//! <run_id>/
//!   judge.toml              copy of the configuration
//!   <run_id>.log            text log (no ANSI colours)
//!   src.tar                 compiler sources, when cache_source is set
//!   <series>/<name>/        private output directory of each test case
//!   result_<run_id>.html|json|txt
//! ```

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Formats a run identifier.
pub fn run_id_at(time: DateTime<Local>, pid: u32) -> String {
    format!("{}_{}", time.format("%Y_%m_%d_%H_%M_%S"), pid)
}

/// The directory of one run.
#[derive(Debug, Clone)]
pub struct RunLog {
    pub run_id: String,
    pub dir: PathBuf,
}

impl RunLog {
    /// Creates `<log_dir>/<run_id>/` and copies the configuration into it.
    pub fn create(log_dir: &Path, config_path: Option<&Path>) -> Result<Self> {
        let run_id = run_id_at(Local::now(), std::process::id());
        Self::create_with_id(log_dir, run_id, config_path)
    }

    pub fn create_with_id(log_dir: &Path, run_id: String, config_path: Option<&Path>) -> Result<Self> {
        let dir = std::path::absolute(log_dir.join(&run_id))
            .with_context(|| format!("Invalid log directory {}", log_dir.display()))?;
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create log directory {}", dir.display()))?;

        if let Some(config_path) = config_path
            && let Some(name) = config_path.file_name()
        {
            std::fs::copy(config_path, dir.join(name))
                .with_context(|| format!("Failed to copy {} into the log directory", config_path.display()))?;
        }

        Ok(Self { run_id, dir })
    }

    pub fn log_file(&self) -> PathBuf {
        self.dir.join(format!("{}.log", self.run_id))
    }
}

/// Installs the global subscriber: human-readable output on stderr and,
/// when given, a plain copy appended to `log_file`.
///
/// `RUST_LOG` overrides the level chosen by `verbose`.
pub fn init_tracing(verbose: bool, log_file: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }));

    let file_layer = match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_target(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(file_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(())
}
