//! compiler-judge: a sandboxed build-and-run harness for grading student
//! compilers.
//!
//! Every test case goes through a short pipeline of isolated jobs (compile,
//! assemble, run), each executed in an ephemeral container or on a leased
//! remote board, and the program's output is judged against an expected
//! answer.
//!
//! # Architecture
//!
//! The main components are:
//!
//! - **Backends**: start, await, kill and remove one isolated execution
//!   (Docker containers, remote boards over ssh)
//! - **Lifecycle**: bounded execution of one job with guaranteed cleanup
//! - **Pipeline**: the ordered, short-circuiting stages of one test case
//! - **Device pool**: exclusive leases on a fixed set of remote boards
//! - **Scheduler**: bounded worker pool over all test cases
//! - **Report**: console progress and HTML / JSON / text reports
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use compiler_judge::config::load_config;
//! use compiler_judge::orchestrator::Orchestrator;
//! use compiler_judge::report::ConsoleReporter;
//! use compiler_judge::run_log::RunLog;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let path = std::path::Path::new("judge.toml");
//!     let config = load_config(path)?;
//!     let run_log = RunLog::create(&config.report.log_dir, Some(path))?;
//!
//!     let result = Orchestrator::new(config, run_log)
//!         .run(Arc::new(ConsoleReporter::new(false)))
//!         .await?;
//!     std::process::exit(result.exit_code());
//! }
//! ```

pub mod backend;
pub mod config;
pub mod device_pool;
pub mod job;
pub mod judge;
pub mod lifecycle;
pub mod orchestrator;
pub mod pipeline;
pub mod report;
pub mod run_log;
pub mod scheduler;
pub mod setup;
pub mod testcase;

// Re-export commonly used types
pub use backend::{Backend, Instance};
pub use config::{Config, load_config};
pub use job::{ExecutionOutcome, JobDescriptor};
pub use judge::{TestCaseResult, Verdict};
pub use lifecycle::LifecycleController;
pub use orchestrator::{Orchestrator, RunResult};
pub use report::Reporter;
