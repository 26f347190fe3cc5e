//! Verdicts and per-test-case results.
//!
//! A [`TestCaseResult`] is derived once from a pipeline's report: if a stage
//! failed, the verdict and comment come from that stage alone. Only a fully
//! successful pipeline is handed to a [`Judge`], which compares the run
//! stages' output files against the expected answer.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::job::{ExecutionOutcome, StageKind};
use crate::pipeline::{Pipeline, PipelineReport};
use crate::testcase::TestCase;

/// Final classification of a test case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    #[serde(rename = "AC")]
    Accepted,
    #[serde(rename = "WA")]
    WrongAnswer,
    #[serde(rename = "CE")]
    CompileError,
    #[serde(rename = "AE")]
    AssembleError,
    #[serde(rename = "RE")]
    RuntimeError,
    #[serde(rename = "TLE")]
    TimeLimitExceeded,
    #[serde(rename = "IE")]
    InternalError,
}

impl Verdict {
    /// Every verdict, in report order.
    pub const ALL: [Verdict; 7] = [
        Verdict::Accepted,
        Verdict::WrongAnswer,
        Verdict::CompileError,
        Verdict::AssembleError,
        Verdict::RuntimeError,
        Verdict::TimeLimitExceeded,
        Verdict::InternalError,
    ];

    pub fn is_accepted(self) -> bool {
        self == Verdict::Accepted
    }

    pub fn code(self) -> &'static str {
        match self {
            Verdict::Accepted => "AC",
            Verdict::WrongAnswer => "WA",
            Verdict::CompileError => "CE",
            Verdict::AssembleError => "AE",
            Verdict::RuntimeError => "RE",
            Verdict::TimeLimitExceeded => "TLE",
            Verdict::InternalError => "IE",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Result record of one test case.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCaseResult {
    pub series: String,
    pub name: String,
    pub verdict: Verdict,
    pub comment: String,
    /// Performance line reported by the run stage, if any.
    pub perf: Option<String>,
    pub stdin: PathBuf,
    pub stdout: Option<PathBuf>,
    pub answer: PathBuf,
    pub duration_secs: f64,
}

impl TestCaseResult {
    /// Derives the result from the last attempted stage of `report`.
    ///
    /// A fully successful pipeline yields a provisional `Accepted` that the
    /// judge may still overturn.
    pub fn from_report(pipeline: &Pipeline, report: &PipelineReport) -> Self {
        let (verdict, comment) = match report.failure() {
            None => (Verdict::Accepted, String::new()),
            Some(stage) => {
                let verdict = match (&stage.outcome, stage.kind) {
                    (ExecutionOutcome::TimedOut, _) => Verdict::TimeLimitExceeded,
                    (ExecutionOutcome::InternalError(_), _) => Verdict::InternalError,
                    (ExecutionOutcome::NonZeroExit(_), StageKind::Compile) => Verdict::CompileError,
                    (ExecutionOutcome::NonZeroExit(_), StageKind::Assemble) => Verdict::AssembleError,
                    (ExecutionOutcome::NonZeroExit(_), StageKind::Run) => Verdict::RuntimeError,
                    (ExecutionOutcome::NonZeroExit(_), StageKind::Build) => Verdict::InternalError,
                    (ExecutionOutcome::Success, _) => Verdict::Accepted,
                };
                (verdict, stage_comment(&stage.name, &stage.outcome))
            }
        };

        Self {
            series: pipeline.case.series.clone(),
            name: pipeline.case.name.clone(),
            verdict,
            comment,
            perf: None,
            stdin: pipeline.input.clone(),
            stdout: pipeline.judged_outputs().last().map(|j| j.output.clone()),
            answer: pipeline.case.answer.clone(),
            duration_secs: report.duration().as_secs_f64(),
        }
    }

    /// Result for a test case whose pipeline could not be built or run.
    pub fn internal_error(case: &TestCase, cause: impl Into<String>) -> Self {
        Self {
            series: case.series.clone(),
            name: case.name.clone(),
            verdict: Verdict::InternalError,
            comment: cause.into(),
            perf: None,
            stdin: case.input.clone().unwrap_or_default(),
            stdout: None,
            answer: case.answer.clone(),
            duration_secs: 0.0,
        }
    }

    pub fn full_name(&self) -> String {
        format!("{}/{}", self.series, self.name)
    }
}

fn stage_comment(stage: &str, outcome: &ExecutionOutcome) -> String {
    match outcome {
        ExecutionOutcome::Success => String::new(),
        ExecutionOutcome::NonZeroExit(code) => format!("{} failed: exit {}", stage, code),
        ExecutionOutcome::TimedOut => format!("{} timed out", stage),
        ExecutionOutcome::InternalError(cause) => format!("{} internal error: {}", stage, cause),
    }
}

/// Decides the verdict of a test case whose pipeline fully succeeded.
pub trait Judge: Send + Sync {
    fn judge(&self, pipeline: &Pipeline, result: &mut TestCaseResult);
}

static PERF_TOTAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*TOTAL:\s*(.+?)\s*$").unwrap());

/// Compares every judged output with the expected answer.
///
/// Lines are compared with trailing whitespace removed, and trailing blank
/// lines are ignored.
#[derive(Debug, Default, Clone, Copy)]
pub struct AnswerJudge;

impl Judge for AnswerJudge {
    fn judge(&self, pipeline: &Pipeline, result: &mut TestCaseResult) {
        let answer = match std::fs::read_to_string(&pipeline.case.answer) {
            Ok(answer) => answer,
            Err(e) => {
                result.verdict = Verdict::InternalError;
                result.comment = format!("cannot read answer: {}", e);
                return;
            }
        };

        for judged in pipeline.judged_outputs() {
            let file = display_name(&judged.output);
            match std::fs::read_to_string(&judged.output) {
                Ok(output) if same_output(&output, &answer) => {}
                Ok(_) => {
                    result.verdict = Verdict::WrongAnswer;
                    result.comment = format!("{} differs from answer", file);
                    return;
                }
                Err(_) => {
                    result.verdict = Verdict::WrongAnswer;
                    result.comment = format!("{} was not produced", file);
                    return;
                }
            }

            if let Some(perf) = read_perf(&judged.perf) {
                result.perf = Some(perf);
            }
        }
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn normalized(text: &str) -> Vec<&str> {
    let mut lines: Vec<&str> = text.lines().map(str::trim_end).collect();
    while lines.last().is_some_and(|l| l.is_empty()) {
        lines.pop();
    }
    lines
}

/// Line-wise comparison ignoring trailing whitespace and trailing blank lines.
pub fn same_output(output: &str, answer: &str) -> bool {
    normalized(output) == normalized(answer)
}

fn read_perf(path: &Path) -> Option<String> {
    let text = std::fs::read_to_string(path).ok()?;
    PERF_TOTAL
        .captures(&text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}
