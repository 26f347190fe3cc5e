//! End-to-end judge run.
//!
//! # Execution Flow
//!
//! 1. **Setup**: archive the compiler sources (optional) and build
//!    `compiler.jar`. A failure here aborts the run before any test case.
//! 2. **Discovery**: find the selected test cases.
//! 3. **Planning**: map the run type to its stage table.
//! 4. **Execution**: run every test case through the [`Scheduler`], which
//!    returns only after all workers finished and the device pool is idle.
//! 5. **Reporting**: write the HTML, JSON and text reports into the run
//!    directory.
//!
//! ```text
//!   Config ──► setup ──► discover ──► PipelinePlan
//!                                          │
//!                 DockerBackend ──┐        ▼
//!   DevicePool<DeviceBackend> ────┴──► Scheduler::run_all
//!                                          │ barrier
//!                                          ▼
//!                              RunSummary + reports
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result, bail};
use tracing::{info, warn};

use crate::backend::device::DeviceBackend;
use crate::backend::docker::DockerBackend;
use crate::config::Config;
use crate::device_pool::DevicePool;
use crate::judge::{AnswerJudge, TestCaseResult};
use crate::lifecycle::LifecycleController;
use crate::pipeline::PipelineRunner;
use crate::pipeline::plan::{PipelinePlan, PlanSettings};
use crate::report::{self, Reporter, RunSummary};
use crate::run_log::RunLog;
use crate::scheduler::Scheduler;
use crate::{setup, testcase};

/// Results of a finished run.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub summary: RunSummary,
    /// One entry per test case, in completion order.
    pub results: Vec<TestCaseResult>,
    /// Report files written into the run directory.
    pub reports: Vec<PathBuf>,
}

impl RunResult {
    pub fn success(&self) -> bool {
        self.summary.success()
    }

    /// 0 when every test case was accepted, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        self.summary.exit_code()
    }
}

/// Ties configuration, backends, scheduler and reports together.
pub struct Orchestrator {
    config: Config,
    run_log: RunLog,
}

impl Orchestrator {
    pub fn new(config: Config, run_log: RunLog) -> Self {
        Self { config, run_log }
    }

    /// Runs setup, all selected test cases and reporting.
    ///
    /// # Errors
    ///
    /// Returns an error if setup fails (engine unreachable, compiler build
    /// failed, test case tree unreadable) or if the reports cannot be
    /// written. Failures inside a test case never surface here.
    pub async fn run(&self, reporter: Arc<dyn Reporter>) -> Result<RunResult> {
        let start = Instant::now();
        let config = &self.config;
        let run_id = &self.run_log.run_id;
        let run_dir = &self.run_log.dir;

        let docker = DockerBackend::new(&config.docker, run_id.as_str())
            .context("Failed to connect to the container engine")?;
        let controller = LifecycleController::new()
            .keep_instances(config.judge.keep_containers)
            .kill_failure_threshold(config.judge.kill_failure_threshold);

        if config.judge.cache_source {
            setup::archive_source(&config.compiler.src, &run_dir.join("src.tar"))?;
        }

        if config.judge.rebuild_compiler {
            setup::build_compiler(&controller, &docker, config, run_id, run_dir).await?;
        } else if !config.compiler.jar().is_file() {
            bail!(
                "{} does not exist and rebuild_compiler is disabled",
                config.compiler.jar().display()
            );
        }

        let cases = testcase::discover(&config.testcases.base, &config.testcases.select)?;
        if cases.is_empty() {
            warn!("No test cases selected under {}", config.testcases.base.display());
        }

        let devices = if config.judge.run_type.needs_devices() {
            let boards = config
                .devices
                .addresses
                .iter()
                .map(|address| DeviceBackend::new(address, &config.devices))
                .collect();
            info!("Using {} remote devices", config.devices.addresses.len());
            Some(DevicePool::new(boards)?)
        } else {
            None
        };

        let plan = PipelinePlan::new(
            config.judge.run_type,
            config.judge.emit_llvm,
            PlanSettings {
                run_id: run_id.clone(),
                case_root: run_dir.clone(),
                compiler_jar: config.compiler.jar(),
                compiler_lib: config.compiler.lib.clone(),
                java_image: config.docker.java_image.clone(),
                sysy_image: config.docker.sysy_image.clone(),
                jvm_options: config.judge.jvm_options.clone(),
                opt_options: config.judge.opt_options.clone(),
                memory_limit: Some(config.memory_limit_bytes()?),
                timeout: config.timeout(),
            },
        );
        info!(
            "Run type {}: {}",
            plan.run_type(),
            plan.stage_names().join(" -> ")
        );

        let scheduler = Scheduler::new(
            PipelineRunner::new(controller, docker, devices),
            plan,
            Arc::new(AnswerJudge),
            reporter.clone(),
            config.judge.num_parallel,
        );

        reporter.on_run_start(cases.len()).await;
        let results = scheduler.run_all(cases).await;

        let kill_failures = scheduler.runner().controller().kill_failures();
        if kill_failures > 0 {
            warn!("{} instances could not be killed during this run", kill_failures);
        }

        let summary = RunSummary::new(run_id.as_str(), &results, start.elapsed());
        reporter.on_run_complete(&summary).await;

        let reports = report::write_reports(run_dir, &results, &summary, &config.report)?;
        for path in &reports {
            info!("Wrote {}", path.display());
        }

        Ok(RunResult {
            summary,
            results,
            reports,
        })
    }
}
