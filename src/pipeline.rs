//! Per-test-case pipelines.
//!
//! A [`Pipeline`] is the ordered list of stages one test case goes through
//! (compile, optionally assemble, run). [`PipelineRunner::run`] executes the
//! stages strictly in order and stops at the first stage whose outcome is
//! not success. Local stages run on the container backend; device stages
//! lease a board from the [`DevicePool`] for the duration of that stage only.
//!
//! Which stages a pipeline contains is decided once per run by
//! [`plan::PipelinePlan`].

pub mod commands;
pub mod plan;

use std::path::PathBuf;
use std::time::Duration;

use tracing::{debug, warn};

use crate::backend::Backend;
use crate::device_pool::DevicePool;
use crate::job::{ExecTarget, ExecutionOutcome, JobDescriptor};
use crate::lifecycle::{JobReport, LifecycleController};
use crate::testcase::TestCase;

/// Files produced by a run stage that the judge compares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JudgedOutput {
    pub output: PathBuf,
    pub perf: PathBuf,
}

/// One pipeline stage.
#[derive(Debug, Clone)]
pub struct Stage {
    pub job: JobDescriptor,
    /// Set on run stages.
    pub judged: Option<JudgedOutput>,
}

/// The stages of one test case.
#[derive(Debug, Clone)]
pub struct Pipeline {
    pub case: TestCase,
    /// Private output directory of the test case, mounted as `/output/`.
    pub case_dir: PathBuf,
    /// Input fed to run stages.
    pub input: PathBuf,
    pub stages: Vec<Stage>,
}

impl Pipeline {
    pub fn judged_outputs(&self) -> impl Iterator<Item = &JudgedOutput> {
        self.stages.iter().filter_map(|s| s.judged.as_ref())
    }
}

/// Records of the stages that were attempted, in order.
#[derive(Debug, Clone, Default)]
pub struct PipelineReport {
    pub stages: Vec<JobReport>,
}

impl PipelineReport {
    /// The stage that stopped the pipeline, if any.
    pub fn failure(&self) -> Option<&JobReport> {
        self.stages.iter().find(|r| !r.outcome.is_success())
    }

    pub fn is_success(&self) -> bool {
        self.failure().is_none()
    }

    pub fn duration(&self) -> Duration {
        self.stages.iter().map(|r| r.duration).sum()
    }
}

/// Executes pipelines against a local backend and an optional device pool.
pub struct PipelineRunner<L: Backend, R: Backend> {
    controller: LifecycleController,
    local: L,
    devices: Option<DevicePool<R>>,
}

impl<L: Backend, R: Backend> PipelineRunner<L, R> {
    pub fn new(controller: LifecycleController, local: L, devices: Option<DevicePool<R>>) -> Self {
        Self {
            controller,
            local,
            devices,
        }
    }

    pub fn controller(&self) -> &LifecycleController {
        &self.controller
    }

    pub fn devices(&self) -> Option<&DevicePool<R>> {
        self.devices.as_ref()
    }

    /// Runs the stages in order, stopping at the first failure.
    pub async fn run(&self, pipeline: &Pipeline) -> PipelineReport {
        let mut report = PipelineReport::default();

        for stage in &pipeline.stages {
            let record = self.run_stage(&stage.job).await;
            let failed = !record.outcome.is_success();
            if failed {
                debug!(
                    "{}: stage {} stopped the pipeline ({})",
                    pipeline.case.full_name(),
                    record.name,
                    record.outcome
                );
            }
            report.stages.push(record);
            if failed {
                break;
            }
        }

        report
    }

    async fn run_stage(&self, job: &JobDescriptor) -> JobReport {
        match job.target {
            ExecTarget::Local => self.controller.run_job(job, &self.local).await,
            ExecTarget::Device => {
                let Some(pool) = &self.devices else {
                    return unavailable(job, "no device pool configured".to_string());
                };
                match pool.acquire().await {
                    Ok(lease) => {
                        let record = self.controller.run_job(job, &*lease).await;
                        lease.release();
                        record
                    }
                    Err(e) => {
                        warn!("Cannot lease a device for {}: {}", job.instance_name, e);
                        unavailable(job, e.to_string())
                    }
                }
            }
        }
    }
}

fn unavailable(job: &JobDescriptor, cause: String) -> JobReport {
    JobReport {
        name: job.name.clone(),
        kind: job.kind,
        target: job.target,
        backend: "none".to_string(),
        outcome: ExecutionOutcome::InternalError(cause),
        duration: Duration::ZERO,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::{Behavior, MockBackend, Script};
    use crate::job::{Mount, StageKind};
    use tempfile::TempDir;

    fn pipeline(dir: &TempDir, stages: &[(&str, StageKind, ExecTarget)]) -> Pipeline {
        let case = TestCase {
            series: "functional".into(),
            name: "00_main".into(),
            source: dir.path().join("00_main.sy"),
            input: None,
            answer: dir.path().join("00_main.out"),
        };
        let stages = stages
            .iter()
            .map(|(name, kind, target)| Stage {
                job: JobDescriptor::new(*name, "img", "true")
                    .instance_name(format!("case-{}", name))
                    .kind(*kind)
                    .target(*target)
                    .output_dir(dir.path())
                    .mount(Mount::read_write(dir.path(), "/output/")),
                judged: None,
            })
            .collect();
        Pipeline {
            case,
            case_dir: dir.path().to_path_buf(),
            input: dir.path().join("input.txt"),
            stages,
        }
    }

    #[tokio::test]
    async fn test_stages_run_in_order() {
        let dir = TempDir::new().unwrap();
        let local = MockBackend::new();
        let state = local.state.clone();
        let runner = PipelineRunner::<_, MockBackend>::new(LifecycleController::new(), local, None);

        let p = pipeline(
            &dir,
            &[
                ("compile", StageKind::Compile, ExecTarget::Local),
                ("genelf", StageKind::Assemble, ExecTarget::Local),
                ("run-qemu", StageKind::Run, ExecTarget::Local),
            ],
        );
        let report = runner.run(&p).await;

        assert!(report.is_success());
        assert_eq!(state.jobs(), vec!["compile", "genelf", "run-qemu"]);
    }

    #[tokio::test]
    async fn test_first_failure_short_circuits() {
        let dir = TempDir::new().unwrap();
        let local = MockBackend::new().on("case-genelf", Script::new(Behavior::Exit(2)));
        let state = local.state.clone();
        let runner = PipelineRunner::<_, MockBackend>::new(LifecycleController::new(), local, None);

        let p = pipeline(
            &dir,
            &[
                ("compile", StageKind::Compile, ExecTarget::Local),
                ("genelf", StageKind::Assemble, ExecTarget::Local),
                ("run-qemu", StageKind::Run, ExecTarget::Local),
            ],
        );
        let report = runner.run(&p).await;

        let failure = report.failure().unwrap();
        assert_eq!(failure.name, "genelf");
        assert_eq!(failure.outcome, ExecutionOutcome::NonZeroExit(2));
        assert_eq!(report.stages.len(), 2);
        assert_eq!(state.jobs(), vec!["compile", "genelf"]);
    }

    #[tokio::test]
    async fn test_device_stage_leases_per_stage() {
        let dir = TempDir::new().unwrap();
        let board = MockBackend::named("pi@board");
        let board_state = board.state.clone();
        let pool = DevicePool::new(vec![board]).unwrap();
        let runner = PipelineRunner::new(LifecycleController::new(), MockBackend::new(), Some(pool));

        let p = pipeline(
            &dir,
            &[
                ("compile", StageKind::Compile, ExecTarget::Local),
                ("run-device", StageKind::Run, ExecTarget::Device),
            ],
        );
        let report = runner.run(&p).await;

        assert!(report.is_success());
        assert_eq!(report.stages[1].backend, "pi@board");
        assert_eq!(board_state.jobs(), vec!["run-device"]);
        assert_eq!(runner.devices().unwrap().outstanding(), 0);
    }

    #[tokio::test]
    async fn test_device_stage_without_pool_is_internal_error() {
        let dir = TempDir::new().unwrap();
        let runner = PipelineRunner::<_, MockBackend>::new(
            LifecycleController::new(),
            MockBackend::new(),
            None,
        );

        let p = pipeline(&dir, &[("run-device", StageKind::Run, ExecTarget::Device)]);
        let report = runner.run(&p).await;

        assert!(matches!(
            report.failure().unwrap().outcome,
            ExecutionOutcome::InternalError(_)
        ));
    }
}
