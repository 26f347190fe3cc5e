//! Scripted backend for tests.
//!
//! Behaviors are matched against the job's instance name, so a test can make
//! one stage of one test case misbehave while everything else succeeds.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::{Backend, BackendError, BackendResult, Instance, InstanceExit};
use crate::job::JobDescriptor;

#[derive(Debug, Clone)]
pub enum Behavior {
    /// Exit immediately with the given code.
    Exit(i64),
    /// Sleep, then exit with the given code.
    Sleep(Duration, i64),
    /// Never terminate on its own.
    Hang,
    /// Never terminate, and refuse to be killed.
    HangUnkillable,
    /// Terminate with an engine-reported error.
    EngineError(String),
    /// The wait call itself fails.
    WaitFails,
    /// Creation fails.
    StartFails,
    /// Creation never completes.
    StartHangs,
    /// Panic while being awaited.
    Panic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Collect {
    Ok,
    Fails,
    Hangs,
}

#[derive(Debug, Clone)]
pub struct Script {
    pub behavior: Behavior,
    pub stdout: String,
    /// Files written into the job's writable directory mount on exit.
    pub files: Vec<(String, String)>,
    pub collect: Collect,
}

impl Script {
    pub fn new(behavior: Behavior) -> Self {
        Self {
            behavior,
            stdout: String::new(),
            files: Vec::new(),
            collect: Collect::Ok,
        }
    }

    pub fn collect_fails(mut self) -> Self {
        self.collect = Collect::Fails;
        self
    }

    pub fn collect_hangs(mut self) -> Self {
        self.collect = Collect::Hangs;
        self
    }

    pub fn stdout(mut self, stdout: impl Into<String>) -> Self {
        self.stdout = stdout.into();
        self
    }

    pub fn file(mut self, name: impl Into<String>, content: impl Into<String>) -> Self {
        self.files.push((name.into(), content.into()));
        self
    }
}

/// Counters shared by a mock backend and its instances.
#[derive(Debug, Default)]
pub struct MockState {
    pub started: AtomicUsize,
    pub killed: AtomicUsize,
    pub collected: AtomicUsize,
    pub removed: AtomicUsize,
    pub live: Mutex<HashSet<String>>,
    pub max_live: AtomicUsize,
    pub jobs: Mutex<Vec<String>>,
}

impl MockState {
    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn killed(&self) -> usize {
        self.killed.load(Ordering::SeqCst)
    }

    /// Successful output collections.
    pub fn collected(&self) -> usize {
        self.collected.load(Ordering::SeqCst)
    }

    pub fn removed(&self) -> usize {
        self.removed.load(Ordering::SeqCst)
    }

    pub fn live(&self) -> usize {
        self.live.lock().unwrap().len()
    }

    pub fn max_live(&self) -> usize {
        self.max_live.load(Ordering::SeqCst)
    }

    /// Job names in start order.
    pub fn jobs(&self) -> Vec<String> {
        self.jobs.lock().unwrap().clone()
    }
}

pub struct MockBackend {
    name: String,
    scripts: Vec<(String, Script)>,
    fallback: Script,
    pub state: Arc<MockState>,
}

impl MockBackend {
    /// A backend whose jobs all exit 0.
    pub fn new() -> Self {
        Self::named("mock")
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            scripts: Vec::new(),
            fallback: Script::new(Behavior::Exit(0)),
            state: Arc::new(MockState::default()),
        }
    }

    /// Shares counters with other backends, so several mock devices can be
    /// observed as one fleet.
    pub fn sharing(mut self, state: Arc<MockState>) -> Self {
        self.state = state;
        self
    }

    /// Registers `script` for jobs whose instance name contains `pattern`.
    /// The first matching registration wins.
    pub fn on(mut self, pattern: impl Into<String>, script: Script) -> Self {
        self.scripts.push((pattern.into(), script));
        self
    }

    pub fn otherwise(mut self, script: Script) -> Self {
        self.fallback = script;
        self
    }

    fn script_for(&self, job: &JobDescriptor) -> &Script {
        self.scripts
            .iter()
            .find(|(pattern, _)| job.instance_name.contains(pattern.as_str()))
            .map(|(_, script)| script)
            .unwrap_or(&self.fallback)
    }
}

#[async_trait]
impl Backend for MockBackend {
    type Instance = MockInstance;

    async fn start(&self, job: &JobDescriptor) -> BackendResult<MockInstance> {
        let script = self.script_for(job).clone();
        match script.behavior {
            Behavior::StartFails => {
                return Err(BackendError::StartFailed("scripted start failure".into()));
            }
            Behavior::StartHangs => std::future::pending::<()>().await,
            _ => {}
        }

        self.state.started.fetch_add(1, Ordering::SeqCst);
        self.state.jobs.lock().unwrap().push(job.name.clone());
        {
            let mut live = self.state.live.lock().unwrap();
            live.insert(job.instance_name.clone());
            self.state.max_live.fetch_max(live.len(), Ordering::SeqCst);
        }

        let files_dir = job
            .mounts
            .iter()
            .find(|m| m.is_writable() && m.is_dir())
            .map(|m| m.host.clone())
            .unwrap_or_else(|| job.output_dir.clone());

        Ok(MockInstance {
            name: job.instance_name.clone(),
            script,
            files_dir,
            state: self.state.clone(),
            removed: AtomicBool::new(false),
        })
    }

    fn name(&self) -> &str {
        &self.name
    }
}

pub struct MockInstance {
    name: String,
    script: Script,
    files_dir: PathBuf,
    state: Arc<MockState>,
    removed: AtomicBool,
}

impl MockInstance {
    fn write_files(&self) -> BackendResult<()> {
        for (name, content) in &self.script.files {
            std::fs::write(self.files_dir.join(name), content)?;
        }
        Ok(())
    }
}

#[async_trait]
impl Instance for MockInstance {
    fn id(&self) -> &str {
        &self.name
    }

    async fn wait(&self) -> BackendResult<InstanceExit> {
        match &self.script.behavior {
            Behavior::Exit(code) => {
                tokio::task::yield_now().await;
                self.write_files()?;
                Ok(InstanceExit::code(*code))
            }
            Behavior::Sleep(duration, code) => {
                tokio::time::sleep(*duration).await;
                self.write_files()?;
                Ok(InstanceExit::code(*code))
            }
            Behavior::Hang | Behavior::HangUnkillable => std::future::pending().await,
            Behavior::EngineError(msg) => Ok(InstanceExit::engine_error(msg.clone())),
            Behavior::WaitFails => Err(BackendError::WaitFailed("scripted wait failure".into())),
            Behavior::StartFails | Behavior::StartHangs => unreachable!("never started"),
            Behavior::Panic => panic!("scripted panic in {}", self.name),
        }
    }

    async fn kill(&self) -> BackendResult<()> {
        if matches!(self.script.behavior, Behavior::HangUnkillable) {
            return Err(BackendError::KillFailed("scripted kill failure".into()));
        }
        self.state.killed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn collect_output(&self, stdout: &Path, stderr: &Path) -> BackendResult<()> {
        if self.removed.load(Ordering::SeqCst) {
            return Err(BackendError::TransferFailed(format!(
                "{} was removed before its output was collected",
                self.name
            )));
        }
        match self.script.collect {
            Collect::Ok => {}
            Collect::Fails => {
                return Err(BackendError::TransferFailed("scripted collect failure".into()));
            }
            Collect::Hangs => std::future::pending::<()>().await,
        }

        tokio::fs::write(stdout, &self.script.stdout).await?;
        tokio::fs::write(stderr, "").await?;
        self.state.collected.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn remove(&self) -> BackendResult<()> {
        self.removed.store(true, Ordering::SeqCst);
        self.state.removed.fetch_add(1, Ordering::SeqCst);
        self.state.live.lock().unwrap().remove(&self.name);
        Ok(())
    }
}
