//! Container lifecycle control.
//!
//! [`LifecycleController::run_job`] drives one job through
//! `prepare -> start -> wait (bounded) -> collect -> remove` and maps every
//! way that can go wrong onto an [`ExecutionOutcome`]. It never returns an
//! error and never leaves an instance behind: whatever happens after a
//! successful start, removal is attempted exactly once (unless instances
//! are explicitly kept for debugging).
//!
//! `wait` is bounded by the job's own timeout. Every other backend call
//! (start, kill, collect, remove) is bounded by the controller's phase
//! timeout, so `run_job` returns within `timeout + 4 * phase_timeout` even
//! when a backend stops responding.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use futures::FutureExt;
use tracing::{debug, error, info, warn};

use crate::backend::{Backend, Instance};
use crate::job::{ExecTarget, ExecutionOutcome, JobDescriptor, StageKind};

/// Kill failures tolerated silently (at `warn`) before each further one is
/// logged at `error`.
pub const DEFAULT_KILL_FAILURE_THRESHOLD: usize = 3;

/// Bound for each backend call other than `wait`.
pub const DEFAULT_PHASE_TIMEOUT: Duration = Duration::from_secs(120);

/// Record of one executed job.
#[derive(Debug, Clone)]
pub struct JobReport {
    pub name: String,
    pub kind: StageKind,
    pub target: ExecTarget,
    /// Name of the backend that ran the job.
    pub backend: String,
    pub outcome: ExecutionOutcome,
    pub duration: Duration,
}

/// Runs jobs on a backend with guaranteed cleanup.
///
/// Shared by every worker of a run; the only mutable state is the kill
/// failure counter.
#[derive(Debug)]
pub struct LifecycleController {
    keep_instances: bool,
    kill_failure_threshold: usize,
    phase_timeout: Duration,
    kill_failures: AtomicUsize,
}

impl Default for LifecycleController {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleController {
    pub fn new() -> Self {
        Self {
            keep_instances: false,
            kill_failure_threshold: DEFAULT_KILL_FAILURE_THRESHOLD,
            phase_timeout: DEFAULT_PHASE_TIMEOUT,
            kill_failures: AtomicUsize::new(0),
        }
    }

    /// Leave instances in place after they finish, for postmortem inspection.
    pub fn keep_instances(mut self, keep: bool) -> Self {
        self.keep_instances = keep;
        self
    }

    pub fn kill_failure_threshold(mut self, threshold: usize) -> Self {
        self.kill_failure_threshold = threshold;
        self
    }

    pub fn phase_timeout(mut self, timeout: Duration) -> Self {
        self.phase_timeout = timeout;
        self
    }

    /// Number of kill attempts that failed so far.
    pub fn kill_failures(&self) -> usize {
        self.kill_failures.load(Ordering::SeqCst)
    }

    /// Runs `job` on `backend` and reports its outcome.
    pub async fn run_job<B: Backend>(&self, job: &JobDescriptor, backend: &B) -> JobReport {
        let started = Instant::now();
        let outcome = self.execute(job, backend).await;
        let duration = started.elapsed();

        debug!(
            "Job {} on {} finished in {:.2}s: {}",
            job.instance_name,
            backend.name(),
            duration.as_secs_f64(),
            outcome
        );

        JobReport {
            name: job.name.clone(),
            kind: job.kind,
            target: job.target,
            backend: backend.name().to_string(),
            outcome,
            duration,
        }
    }

    async fn execute<B: Backend>(&self, job: &JobDescriptor, backend: &B) -> ExecutionOutcome {
        if let Err(e) = job.prepare_mounts() {
            warn!("Cannot prepare mounts for {}: {}", job.instance_name, e);
            return ExecutionOutcome::InternalError(format!("prepare mounts: {}", e));
        }

        let instance = match tokio::time::timeout(self.phase_timeout, backend.start(job)).await {
            Ok(Ok(instance)) => instance,
            Ok(Err(e)) => {
                warn!("Failed to start {} on {}: {}", job.instance_name, backend.name(), e);
                return ExecutionOutcome::InternalError(e.to_string());
            }
            Err(_elapsed) => {
                warn!(
                    "Starting {} on {} did not finish within {}s",
                    job.instance_name,
                    backend.name(),
                    self.phase_timeout.as_secs_f64()
                );
                return ExecutionOutcome::InternalError("start timed out".to_string());
            }
        };

        let wait = AssertUnwindSafe(instance.wait()).catch_unwind();
        let outcome = match tokio::time::timeout(job.timeout, wait).await {
            Ok(Ok(Ok(exit))) => ExecutionOutcome::from_exit(&exit),
            Ok(Ok(Err(e))) => {
                warn!("Waiting for {} failed: {}", instance.id(), e);
                self.kill(&instance).await;
                ExecutionOutcome::InternalError(e.to_string())
            }
            Ok(Err(_panic)) => {
                error!("Backend panicked while waiting for {}", instance.id());
                self.kill(&instance).await;
                ExecutionOutcome::InternalError("backend panicked while waiting".to_string())
            }
            Err(_elapsed) => {
                info!(
                    "{} exceeded its {}s budget, killing",
                    instance.id(),
                    job.timeout.as_secs_f64()
                );
                self.kill(&instance).await;
                ExecutionOutcome::TimedOut
            }
        };

        // Artifacts are copied out before the instance is reclaimed.
        let (stdout, stderr) = job.log_paths();
        let collect = instance.collect_output(&stdout, &stderr);
        match tokio::time::timeout(self.phase_timeout, collect).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Failed to collect output of {}: {}", instance.id(), e),
            Err(_elapsed) => warn!("Collecting output of {} timed out", instance.id()),
        }

        if self.keep_instances {
            info!("Keeping instance {}", instance.id());
        } else {
            match tokio::time::timeout(self.phase_timeout, instance.remove()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Failed to remove {}: {}", instance.id(), e),
                Err(_elapsed) => warn!("Removing {} timed out", instance.id()),
            }
        }

        outcome
    }

    /// Best-effort kill. Failures never change the outcome; they are counted
    /// and escalated to `error` once the threshold is passed.
    async fn kill<I: Instance>(&self, instance: &I) {
        let e = match tokio::time::timeout(self.phase_timeout, instance.kill()).await {
            Ok(Ok(())) => return,
            Ok(Err(e)) => e.to_string(),
            Err(_elapsed) => format!("no response within {}s", self.phase_timeout.as_secs_f64()),
        };

        let failures = self.kill_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if failures > self.kill_failure_threshold {
            error!(
                "Failed to kill {} ({} kill failures this run): {}",
                instance.id(),
                failures,
                e
            );
        } else {
            warn!("Failed to kill {}: {}", instance.id(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::{Behavior, MockBackend, Script};
    use crate::job::Mount;
    use tempfile::TempDir;

    fn job(dir: &TempDir, name: &str) -> JobDescriptor {
        JobDescriptor::new(name, "img", "true")
            .output_dir(dir.path())
            .mount(Mount::read_write(dir.path().join("out"), "/output/"))
            .timeout(Duration::from_millis(200))
    }

    #[tokio::test]
    async fn test_success() {
        let dir = TempDir::new().unwrap();
        let backend = MockBackend::new().otherwise(Script::new(Behavior::Exit(0)).stdout("hello"));
        let controller = LifecycleController::new();

        let report = controller.run_job(&job(&dir, "compile"), &backend).await;

        assert_eq!(report.outcome, ExecutionOutcome::Success);
        assert_eq!(report.name, "compile");
        assert_eq!(backend.state.removed(), 1);
        assert_eq!(backend.state.live(), 0);
        let stdout = std::fs::read_to_string(dir.path().join("compile.stdout.log")).unwrap();
        assert_eq!(stdout, "hello");
    }

    #[tokio::test]
    async fn test_non_zero_exit() {
        let dir = TempDir::new().unwrap();
        let backend = MockBackend::new().otherwise(Script::new(Behavior::Exit(3)));
        let report = LifecycleController::new()
            .run_job(&job(&dir, "run"), &backend)
            .await;

        assert_eq!(report.outcome, ExecutionOutcome::NonZeroExit(3));
        assert_eq!(backend.state.killed(), 0);
        assert_eq!(backend.state.removed(), 1);
    }

    #[tokio::test]
    async fn test_timeout_kills_and_removes() {
        let dir = TempDir::new().unwrap();
        let backend = MockBackend::new().otherwise(Script::new(Behavior::Hang));
        let started = Instant::now();

        let report = LifecycleController::new()
            .run_job(&job(&dir, "run"), &backend)
            .await;

        assert_eq!(report.outcome, ExecutionOutcome::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(backend.state.killed(), 1);
        assert_eq!(backend.state.removed(), 1);
        assert_eq!(backend.state.live(), 0);
    }

    #[tokio::test]
    async fn test_wait_failure_is_internal_error() {
        let dir = TempDir::new().unwrap();
        let backend = MockBackend::new().otherwise(Script::new(Behavior::WaitFails));
        let report = LifecycleController::new()
            .run_job(&job(&dir, "run"), &backend)
            .await;

        assert!(matches!(report.outcome, ExecutionOutcome::InternalError(_)));
        assert_eq!(backend.state.killed(), 1);
        assert_eq!(backend.state.removed(), 1);
    }

    #[tokio::test]
    async fn test_engine_error_is_internal_error() {
        let dir = TempDir::new().unwrap();
        let backend = MockBackend::new()
            .otherwise(Script::new(Behavior::EngineError("out of memory".into())));
        let report = LifecycleController::new()
            .run_job(&job(&dir, "run"), &backend)
            .await;

        assert_eq!(
            report.outcome,
            ExecutionOutcome::InternalError("out of memory".into())
        );
        assert_eq!(backend.state.removed(), 1);
    }

    #[tokio::test]
    async fn test_start_failure_creates_nothing() {
        let dir = TempDir::new().unwrap();
        let backend = MockBackend::new().otherwise(Script::new(Behavior::StartFails));
        let report = LifecycleController::new()
            .run_job(&job(&dir, "run"), &backend)
            .await;

        assert!(matches!(report.outcome, ExecutionOutcome::InternalError(_)));
        assert_eq!(backend.state.started(), 0);
        assert_eq!(backend.state.removed(), 0);
    }

    #[tokio::test]
    async fn test_missing_read_only_mount_is_not_started() {
        let dir = TempDir::new().unwrap();
        let backend = MockBackend::new();
        let job = job(&dir, "genelf").mount(Mount::read_only(
            dir.path().join("test.S"),
            "/compiler/test.S",
        ));

        let report = LifecycleController::new().run_job(&job, &backend).await;

        assert!(matches!(report.outcome, ExecutionOutcome::InternalError(_)));
        assert_eq!(backend.state.started(), 0);
    }

    #[tokio::test]
    async fn test_panicking_wait_is_cleaned_up() {
        let dir = TempDir::new().unwrap();
        let backend = MockBackend::new().otherwise(Script::new(Behavior::Panic));
        let report = LifecycleController::new()
            .run_job(&job(&dir, "run"), &backend)
            .await;

        assert!(matches!(report.outcome, ExecutionOutcome::InternalError(_)));
        assert_eq!(backend.state.removed(), 1);
    }

    #[tokio::test]
    async fn test_keep_instances_skips_removal() {
        let dir = TempDir::new().unwrap();
        let backend = MockBackend::new();
        let report = LifecycleController::new()
            .keep_instances(true)
            .run_job(&job(&dir, "run"), &backend)
            .await;

        assert_eq!(report.outcome, ExecutionOutcome::Success);
        assert_eq!(backend.state.removed(), 0);
        assert_eq!(backend.state.live(), 1);
    }

    #[tokio::test]
    async fn test_kill_failures_are_counted_not_fatal() {
        let dir = TempDir::new().unwrap();
        let backend = MockBackend::new().otherwise(Script::new(Behavior::HangUnkillable));
        let controller = LifecycleController::new().kill_failure_threshold(1);

        for _ in 0..3 {
            let report = controller.run_job(&job(&dir, "run"), &backend).await;
            assert_eq!(report.outcome, ExecutionOutcome::TimedOut);
        }

        assert_eq!(controller.kill_failures(), 3);
        assert_eq!(backend.state.removed(), 3);
        assert_eq!(backend.state.live(), 0);
    }

    #[tokio::test]
    async fn test_output_collected_before_removal() {
        let dir = TempDir::new().unwrap();
        let backend = MockBackend::new().otherwise(Script::new(Behavior::Exit(0)).stdout("42"));

        let report = LifecycleController::new()
            .run_job(&job(&dir, "run"), &backend)
            .await;

        assert_eq!(report.outcome, ExecutionOutcome::Success);
        assert_eq!(backend.state.collected(), 1);
        assert_eq!(backend.state.removed(), 1);
    }

    #[tokio::test]
    async fn test_failed_collection_still_removes() {
        let dir = TempDir::new().unwrap();
        let backend = MockBackend::new().otherwise(Script::new(Behavior::Exit(0)).collect_fails());

        let report = LifecycleController::new()
            .run_job(&job(&dir, "run"), &backend)
            .await;

        assert_eq!(report.outcome, ExecutionOutcome::Success);
        assert_eq!(backend.state.collected(), 0);
        assert_eq!(backend.state.removed(), 1);
        assert_eq!(backend.state.live(), 0);
    }

    #[tokio::test]
    async fn test_hanging_collection_is_bounded() {
        let dir = TempDir::new().unwrap();
        let backend = MockBackend::new().otherwise(Script::new(Behavior::Exit(0)).collect_hangs());
        let controller = LifecycleController::new().phase_timeout(Duration::from_millis(200));

        let report = tokio::time::timeout(
            Duration::from_secs(3),
            controller.run_job(&job(&dir, "run"), &backend),
        )
        .await
        .expect("run_job must not hang on a stuck collection");

        assert_eq!(report.outcome, ExecutionOutcome::Success);
        assert_eq!(backend.state.removed(), 1);
        assert_eq!(backend.state.live(), 0);
    }

    #[tokio::test]
    async fn test_hanging_start_is_internal_error() {
        let dir = TempDir::new().unwrap();
        let backend = MockBackend::new().otherwise(Script::new(Behavior::StartHangs));
        let controller = LifecycleController::new().phase_timeout(Duration::from_millis(200));

        let report = tokio::time::timeout(
            Duration::from_secs(3),
            controller.run_job(&job(&dir, "run"), &backend),
        )
        .await
        .expect("run_job must not hang on a stuck start");

        assert_eq!(
            report.outcome,
            ExecutionOutcome::InternalError("start timed out".into())
        );
        assert_eq!(backend.state.started(), 0);
    }
}
