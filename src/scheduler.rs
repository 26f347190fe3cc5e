//! Parallel execution of test cases.
//!
//! [`Scheduler::run_all`] starts a fixed number of workers that pull test
//! cases from a shared queue. Each worker owns one pipeline at a time:
//!
//! ```text
//!   queue ──► worker 0 ──► build pipeline ──► run stages ──► judge ──┐
//!         ──► worker 1 ──► ...                                      ├──► ResultSet
//!         ──► worker N ──► ...                                      ┘
//! ```
//!
//! Anything that goes wrong inside one test case, including a panic, is
//! turned into an `InternalError` result for that case only. Once the queue
//! is empty the scheduler waits for every worker and then for the device pool
//! to become idle before returning the results.

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::FutureExt;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::backend::Backend;
use crate::judge::{Judge, TestCaseResult};
use crate::pipeline::PipelineRunner;
use crate::pipeline::plan::PipelinePlan;
use crate::report::Reporter;
use crate::testcase::TestCase;

/// Append-only collection of results in completion order.
#[derive(Debug, Default)]
pub struct ResultSet {
    results: Mutex<Vec<TestCaseResult>>,
}

impl ResultSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, result: TestCaseResult) {
        self.lock().push(result);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn snapshot(&self) -> Vec<TestCaseResult> {
        self.lock().clone()
    }

    pub fn into_inner(self) -> Vec<TestCaseResult> {
        self.results.into_inner().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock(&self) -> MutexGuard<'_, Vec<TestCaseResult>> {
        self.results.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Runs test cases on a bounded number of workers.
///
/// The device pool is drained at the end of [`run_all`](Self::run_all), so a
/// scheduler that has device stages runs once.
pub struct Scheduler<L: Backend, R: Backend> {
    runner: Arc<PipelineRunner<L, R>>,
    plan: Arc<PipelinePlan>,
    judge: Arc<dyn Judge>,
    reporter: Arc<dyn Reporter>,
    concurrency: usize,
}

impl<L, R> Scheduler<L, R>
where
    L: Backend + 'static,
    R: Backend + 'static,
{
    pub fn new(
        runner: PipelineRunner<L, R>,
        plan: PipelinePlan,
        judge: Arc<dyn Judge>,
        reporter: Arc<dyn Reporter>,
        concurrency: usize,
    ) -> Self {
        Self {
            runner: Arc::new(runner),
            plan: Arc::new(plan),
            judge,
            reporter,
            concurrency: concurrency.max(1),
        }
    }

    pub fn runner(&self) -> &PipelineRunner<L, R> {
        &self.runner
    }

    /// Runs every test case and returns one result per case, in completion
    /// order.
    pub async fn run_all(&self, cases: Vec<TestCase>) -> Vec<TestCaseResult> {
        let total = cases.len();
        let workers = self.concurrency.min(total);
        info!("Running {} test cases on {} workers", total, workers);

        let queue = Arc::new(Mutex::new(VecDeque::from(cases)));
        let results = Arc::new(ResultSet::new());

        let mut set = JoinSet::new();
        for id in 0..workers {
            let worker = Worker {
                id,
                runner: self.runner.clone(),
                plan: self.plan.clone(),
                judge: self.judge.clone(),
                reporter: self.reporter.clone(),
            };
            let queue = queue.clone();
            let results = results.clone();
            set.spawn(async move { worker.work(&queue, &results).await });
        }

        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined {
                error!("Worker ended abnormally: {}", e);
            }
        }

        if let Some(pool) = self.runner.devices() {
            debug!("Waiting for {} device leases to return", pool.outstanding());
            pool.drain_and_wait_idle().await;
        }

        let results = match Arc::try_unwrap(results) {
            Ok(results) => results.into_inner(),
            Err(shared) => shared.snapshot(),
        };
        if results.len() != total {
            warn!("{} of {} test cases produced no result", total - results.len(), total);
        }
        results
    }
}

struct Worker<L: Backend, R: Backend> {
    id: usize,
    runner: Arc<PipelineRunner<L, R>>,
    plan: Arc<PipelinePlan>,
    judge: Arc<dyn Judge>,
    reporter: Arc<dyn Reporter>,
}

impl<L: Backend, R: Backend> Worker<L, R> {
    async fn work(&self, queue: &Mutex<VecDeque<TestCase>>, results: &ResultSet) {
        loop {
            let next = queue.lock().unwrap_or_else(PoisonError::into_inner).pop_front();
            let Some(case) = next else {
                break;
            };

            debug!("Worker {} picked {}", self.id, case.full_name());
            let result = match AssertUnwindSafe(self.run_case(&case)).catch_unwind().await {
                Ok(result) => result,
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    error!("Worker {} panicked on {}: {}", self.id, case.full_name(), message);
                    TestCaseResult::internal_error(&case, format!("worker panicked: {}", message))
                }
            };

            self.reporter.on_case_complete(&result).await;
            results.push(result);
        }
    }

    async fn run_case(&self, case: &TestCase) -> TestCaseResult {
        let pipeline = match self.plan.build(case) {
            Ok(pipeline) => pipeline,
            Err(e) => {
                warn!("Cannot prepare {}: {}", case.full_name(), e);
                return TestCaseResult::internal_error(case, format!("cannot prepare case directory: {}", e));
            }
        };

        let report = self.runner.run(&pipeline).await;
        let mut result = TestCaseResult::from_report(&pipeline, &report);
        if !report.is_success() {
            return result;
        }

        // Judging reads answer and output files.
        let judge = self.judge.clone();
        let judged = tokio::task::spawn_blocking(move || {
            judge.judge(&pipeline, &mut result);
            result
        })
        .await;
        match judged {
            Ok(result) => result,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(e) => TestCaseResult::internal_error(case, format!("judge did not run: {}", e)),
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::{Behavior, MockBackend, MockState, Script};
    use crate::device_pool::DevicePool;
    use crate::judge::{AnswerJudge, Verdict};
    use crate::lifecycle::LifecycleController;
    use crate::pipeline::Pipeline;
    use crate::pipeline::plan::{PlanSettings, RunType};
    use crate::report::NullReporter;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            std::fs::create_dir_all(dir.path().join("build")).unwrap();
            std::fs::write(dir.path().join("build/compiler.jar"), "").unwrap();
            std::fs::create_dir_all(dir.path().join("cases/functional")).unwrap();
            Self { dir }
        }

        fn case(&self, name: &str, answer: &str) -> TestCase {
            let series = self.dir.path().join("cases/functional");
            std::fs::write(series.join(format!("{name}.sy")), "int main() { return 0; }").unwrap();
            std::fs::write(series.join(format!("{name}.out")), answer).unwrap();
            TestCase {
                series: "functional".into(),
                name: name.into(),
                source: series.join(format!("{name}.sy")),
                input: None,
                answer: series.join(format!("{name}.out")),
            }
        }

        fn plan(&self, run_type: RunType, timeout: Duration) -> PipelinePlan {
            let root = self.dir.path();
            PipelinePlan::new(
                run_type,
                false,
                PlanSettings {
                    run_id: "test".into(),
                    case_root: root.join("run"),
                    compiler_jar: root.join("build/compiler.jar"),
                    compiler_lib: None,
                    java_image: "java".into(),
                    sysy_image: "sysy".into(),
                    jvm_options: String::new(),
                    opt_options: String::new(),
                    memory_limit: None,
                    timeout,
                },
            )
        }
    }

    fn scheduler<R: Backend + 'static>(
        local: MockBackend,
        devices: Option<DevicePool<R>>,
        plan: PipelinePlan,
        judge: Arc<dyn Judge>,
        concurrency: usize,
    ) -> Scheduler<MockBackend, R> {
        Scheduler::new(
            PipelineRunner::new(LifecycleController::new(), local, devices),
            plan,
            judge,
            Arc::new(NullReporter),
            concurrency,
        )
    }

    /// Compiles to `test.ll`, then prints `3` from the run stage. Scripts
    /// already registered on `base` take precedence.
    fn llvm_backend(base: MockBackend) -> MockBackend {
        base.on("_compile", Script::new(Behavior::Exit(0)).file("test.ll", "; ir"))
            .on(
                "_run-llvm",
                Script::new(Behavior::Exit(0))
                    .stdout("3\n")
                    .file("output.txt", "3\n")
                    .file("perf.txt", "TOTAL: 0H-0M-0S-120us\n"),
            )
    }

    fn find<'a>(results: &'a [TestCaseResult], name: &str) -> &'a TestCaseResult {
        results.iter().find(|r| r.name == name).unwrap()
    }

    #[tokio::test]
    async fn test_compile_and_run_accepted() {
        let fx = Fixture::new();
        let local = llvm_backend(MockBackend::new());
        let state = local.state.clone();
        let plan = fx.plan(RunType::Llvm, Duration::from_secs(5));
        let s = scheduler::<MockBackend>(local, None, plan, Arc::new(AnswerJudge), 2);

        let results = s.run_all(vec![fx.case("00_main", "3\n")]).await;

        assert_eq!(results.len(), 1);
        let r = &results[0];
        assert_eq!(r.verdict, Verdict::Accepted, "{}", r.comment);
        assert_eq!(r.perf.as_deref(), Some("0H-0M-0S-120us"));
        let stdout = r.stdout.as_ref().unwrap();
        assert_eq!(std::fs::read_to_string(stdout).unwrap(), "3\n");

        let case_dir = fx.dir.path().join("run/functional/00_main");
        assert_eq!(
            std::fs::read_to_string(case_dir.join("run-llvm.stdout.log")).unwrap(),
            "3\n"
        );
        assert_eq!(state.jobs(), vec!["compile", "run-llvm"]);
        assert_eq!(state.live(), 0);
    }

    #[tokio::test]
    async fn test_compile_failure_skips_run() {
        let fx = Fixture::new();
        let local = MockBackend::new().on("_compile", Script::new(Behavior::Exit(1)));
        let state = local.state.clone();
        let plan = fx.plan(RunType::Llvm, Duration::from_secs(5));
        let s = scheduler::<MockBackend>(local, None, plan, Arc::new(AnswerJudge), 2);

        let results = s.run_all(vec![fx.case("00_main", "0\n")]).await;

        assert_eq!(results[0].verdict, Verdict::CompileError);
        assert_eq!(results[0].comment, "compile failed: exit 1");
        assert_eq!(state.jobs(), vec!["compile"]);
    }

    #[tokio::test]
    async fn test_hanging_run_is_killed_and_removed() {
        let fx = Fixture::new();
        let local = MockBackend::new()
            .on("_compile", Script::new(Behavior::Exit(0)).file("test.ll", ""))
            .on("_run-llvm", Script::new(Behavior::Hang));
        let state = local.state.clone();
        let plan = fx.plan(RunType::Llvm, Duration::from_millis(200));
        let s = scheduler::<MockBackend>(local, None, plan, Arc::new(AnswerJudge), 1);

        let results = s.run_all(vec![fx.case("00_main", "0\n")]).await;

        assert_eq!(results[0].verdict, Verdict::TimeLimitExceeded);
        assert_eq!(results[0].comment, "run-llvm timed out");
        assert_eq!(state.killed(), 1);
        assert_eq!(state.removed(), 2);
        assert_eq!(state.live(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_device_runs_limited_by_pool() {
        let fx = Fixture::new();
        let local = MockBackend::new()
            .on("_compile", Script::new(Behavior::Exit(0)).file("test.S", ""));
        let fleet = Arc::new(MockState::default());
        let run = Script::new(Behavior::Sleep(Duration::from_millis(30), 0)).file("output.txt", "0\n");
        let boards = vec![
            MockBackend::named("pi@board-1").sharing(fleet.clone()).otherwise(run.clone()),
            MockBackend::named("pi@board-2").sharing(fleet.clone()).otherwise(run),
        ];
        let pool = DevicePool::new(boards).unwrap();
        let plan = fx.plan(RunType::Rpi, Duration::from_secs(5));
        let s = scheduler(local, Some(pool), plan, Arc::new(AnswerJudge), 5);

        let cases = (0..5).map(|i| fx.case(&format!("case_{i}"), "0\n")).collect();
        let results = s.run_all(cases).await;

        assert_eq!(results.len(), 5);
        assert!(results.iter().all(|r| r.verdict == Verdict::Accepted));
        assert_eq!(fleet.started(), 5);
        assert_eq!(fleet.max_live(), 2);
        assert_eq!(fleet.live(), 0);
        assert_eq!(s.runner().devices().unwrap().outstanding(), 0);
    }

    struct PanickingJudge(&'static str);

    impl Judge for PanickingJudge {
        fn judge(&self, pipeline: &Pipeline, result: &mut TestCaseResult) {
            if pipeline.case.name == self.0 {
                panic!("judge exploded on {}", self.0);
            }
            AnswerJudge.judge(pipeline, result);
        }
    }

    #[tokio::test]
    async fn test_fault_in_one_case_is_isolated() {
        let fx = Fixture::new();
        let local = llvm_backend(MockBackend::new().on("bad_compile", Script::new(Behavior::Panic)));
        let state = local.state.clone();
        let plan = fx.plan(RunType::Llvm, Duration::from_secs(5));
        let s = scheduler::<MockBackend>(local, None, plan, Arc::new(PanickingJudge("boom")), 3);

        let cases = vec![
            fx.case("a", "3\n"),
            fx.case("boom", "3\n"),
            fx.case("bad", "3\n"),
            fx.case("b", "3\n"),
        ];
        let results = s.run_all(cases).await;

        assert_eq!(results.len(), 4);
        assert_eq!(find(&results, "a").verdict, Verdict::Accepted);
        assert_eq!(find(&results, "b").verdict, Verdict::Accepted);

        let boom = find(&results, "boom");
        assert_eq!(boom.verdict, Verdict::InternalError);
        assert!(boom.comment.contains("judge exploded"));

        let bad = find(&results, "bad");
        assert_eq!(bad.verdict, Verdict::InternalError);
        assert!(bad.comment.starts_with("compile internal error"));
        assert_eq!(state.live(), 0);
    }

    #[tokio::test]
    async fn test_unpreparable_case_is_internal_error() {
        let fx = Fixture::new();
        let plan = fx.plan(RunType::Llvm, Duration::from_secs(5));
        // A file where the case directory's parent should be.
        std::fs::create_dir_all(fx.dir.path().join("run")).unwrap();
        std::fs::write(fx.dir.path().join("run/functional"), "").unwrap();
        let s = scheduler::<MockBackend>(MockBackend::new(), None, plan, Arc::new(AnswerJudge), 1);

        let results = s.run_all(vec![fx.case("00_main", "0\n")]).await;

        assert_eq!(results[0].verdict, Verdict::InternalError);
        assert!(results[0].comment.starts_with("cannot prepare case directory"));
    }

    #[tokio::test]
    async fn test_empty_run() {
        let fx = Fixture::new();
        let plan = fx.plan(RunType::Interpreter, Duration::from_secs(1));
        let s = scheduler::<MockBackend>(MockBackend::new(), None, plan, Arc::new(AnswerJudge), 4);

        assert!(s.run_all(Vec::new()).await.is_empty());
    }

    #[test]
    fn test_result_set_appends() {
        let set = ResultSet::new();
        let case = TestCase {
            series: "s".into(),
            name: "n".into(),
            source: Path::new("n.sy").into(),
            input: None,
            answer: Path::new("n.out").into(),
        };
        set.push(TestCaseResult::internal_error(&case, "x"));
        set.push(TestCaseResult::internal_error(&case, "y"));

        assert_eq!(set.len(), 2);
        assert_eq!(set.snapshot()[1].comment, "y");
        assert_eq!(set.into_inner().len(), 2);
    }
}
