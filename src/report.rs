//! Result reporting.
//!
//! Reporters receive events while the scheduler runs; report artifacts are
//! written once the scheduler's barrier has completed:
//!
//! | File | Content |
//! |------|---------|
//! | `result_<run_id>.html` | Table of all results, see [`html`] |
//! | `result_<run_id>.json` | The result records as a JSON array |
//! | `result_<run_id>.txt` | Plain summary, also printed to stdout |

pub mod html;

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::Serialize;

use crate::config::ReportConfig;
use crate::judge::{TestCaseResult, Verdict};

/// Aggregated counts of a finished run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub total: usize,
    pub accepted: usize,
    /// Count per verdict, in [`Verdict::ALL`] order, zero counts omitted.
    pub counts: Vec<(Verdict, usize)>,
    pub duration_secs: f64,
}

impl RunSummary {
    pub fn new(run_id: impl Into<String>, results: &[TestCaseResult], duration: Duration) -> Self {
        let counts = Verdict::ALL
            .iter()
            .map(|v| (*v, results.iter().filter(|r| r.verdict == *v).count()))
            .filter(|(_, n)| *n > 0)
            .collect();

        Self {
            run_id: run_id.into(),
            total: results.len(),
            accepted: results.iter().filter(|r| r.verdict.is_accepted()).count(),
            counts,
            duration_secs: duration.as_secs_f64(),
        }
    }

    /// All test cases accepted.
    pub fn success(&self) -> bool {
        self.accepted == self.total
    }

    pub fn exit_code(&self) -> i32 {
        if self.success() { 0 } else { 1 }
    }
}

/// Receives events during a run.
#[async_trait]
pub trait Reporter: Send + Sync {
    /// Called once the test cases are known.
    async fn on_run_start(&self, total: usize);

    /// Called as each test case completes, in completion order.
    async fn on_case_complete(&self, result: &TestCaseResult);

    async fn on_run_complete(&self, summary: &RunSummary);
}

/// A reporter that does nothing.
pub struct NullReporter;

#[async_trait]
impl Reporter for NullReporter {
    async fn on_run_start(&self, _total: usize) {}
    async fn on_case_complete(&self, _result: &TestCaseResult) {}
    async fn on_run_complete(&self, _summary: &RunSummary) {}
}

/// Fans events out to several reporters.
pub struct MultiReporter {
    reporters: Vec<Box<dyn Reporter>>,
}

impl MultiReporter {
    pub fn new() -> Self {
        Self {
            reporters: Vec::new(),
        }
    }

    pub fn with_reporter<R: Reporter + 'static>(mut self, reporter: R) -> Self {
        self.reporters.push(Box::new(reporter));
        self
    }
}

impl Default for MultiReporter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Reporter for MultiReporter {
    async fn on_run_start(&self, total: usize) {
        for reporter in &self.reporters {
            reporter.on_run_start(total).await;
        }
    }

    async fn on_case_complete(&self, result: &TestCaseResult) {
        for reporter in &self.reporters {
            reporter.on_case_complete(result).await;
        }
    }

    async fn on_run_complete(&self, summary: &RunSummary) {
        for reporter in &self.reporters {
            reporter.on_run_complete(summary).await;
        }
    }
}

/// Progress bar on the terminal, with a line per non-accepted test case.
pub struct ConsoleReporter {
    progress: Mutex<Option<indicatif::ProgressBar>>,
    verbose: bool,
}

impl ConsoleReporter {
    pub fn new(verbose: bool) -> Self {
        Self {
            progress: Mutex::new(None),
            verbose,
        }
    }
}

fn styled(verdict: Verdict) -> console::StyledObject<&'static str> {
    let code = verdict.code();
    match verdict {
        Verdict::Accepted => console::style(code).green(),
        Verdict::InternalError => console::style(code).red().bold(),
        Verdict::TimeLimitExceeded => console::style(code).yellow(),
        _ => console::style(code).red(),
    }
}

#[async_trait]
impl Reporter for ConsoleReporter {
    async fn on_run_start(&self, total: usize) {
        println!("Running {} test cases", total);
        let pb = indicatif::ProgressBar::new(total as u64);
        let style = indicatif::ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
            .unwrap_or_else(|_| indicatif::ProgressStyle::default_bar())
            .progress_chars("#>-");
        pb.set_style(style);
        if let Ok(mut progress) = self.progress.lock() {
            *progress = Some(pb);
        }
    }

    async fn on_case_complete(&self, result: &TestCaseResult) {
        let Ok(progress) = self.progress.lock() else {
            return;
        };
        if let Some(pb) = progress.as_ref() {
            pb.inc(1);
            if self.verbose || !result.verdict.is_accepted() {
                let mut line = format!("{:<4} {}", styled(result.verdict), result.full_name());
                if !result.comment.is_empty() {
                    line.push_str(&format!("  {}", console::style(&result.comment).dim()));
                }
                pb.println(line);
            }
        }
    }

    async fn on_run_complete(&self, summary: &RunSummary) {
        if let Ok(mut progress) = self.progress.lock()
            && let Some(pb) = progress.take()
        {
            pb.finish_and_clear();
        }

        println!();
        println!("Results:");
        for (verdict, count) in &summary.counts {
            println!("  {:<4} {}", styled(*verdict), count);
        }
        println!("  Duration: {:.1}s", summary.duration_secs);
        println!();
        if summary.success() {
            println!("{}", console::style("All test cases accepted!").green().bold());
        } else {
            println!(
                "{}",
                console::style(format!("{}/{} accepted", summary.accepted, summary.total))
                    .red()
                    .bold()
            );
        }
    }
}

/// Plain-text rendering of the results, one line per test case.
pub fn pretty_result(results: &[TestCaseResult], summary: &RunSummary) -> String {
    let width = results
        .iter()
        .map(|r| r.series.len() + r.name.len() + 1)
        .max()
        .unwrap_or(0);

    let mut out = String::new();
    for r in results {
        let line = format!(
            "{:<width$}  {:<4}  {:<20}  {}",
            r.full_name(),
            r.verdict.code(),
            r.perf.as_deref().unwrap_or("-"),
            r.comment,
            width = width
        );
        out.push_str(line.trim_end());
        out.push('\n');
    }
    out.push('\n');

    let counts: Vec<String> = summary
        .counts
        .iter()
        .map(|(v, n)| format!("{} {}", v.code(), n))
        .collect();
    out.push_str(&format!(
        "{}/{} accepted ({})\n",
        summary.accepted,
        summary.total,
        counts.join(", ")
    ));
    out
}

/// Paths of the report files of a run.
pub fn report_path(run_dir: &Path, run_id: &str, extension: &str) -> PathBuf {
    run_dir.join(format!("result_{}.{}", run_id, extension))
}

/// Writes the enabled report artifacts into `run_dir`.
///
/// Results are sorted by series and name first. Returns the paths written.
pub fn write_reports(
    run_dir: &Path,
    results: &[TestCaseResult],
    summary: &RunSummary,
    config: &ReportConfig,
) -> anyhow::Result<Vec<PathBuf>> {
    let mut sorted = results.to_vec();
    sorted.sort_by(|a, b| (&a.series, &a.name).cmp(&(&b.series, &b.name)));

    let mut written = Vec::new();

    if config.html {
        let path = report_path(run_dir, &summary.run_id, "html");
        let content = html::render(&sorted, summary)?;
        std::fs::write(&path, content)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        written.push(path);
    }

    if config.json {
        let path = report_path(run_dir, &summary.run_id, "json");
        let content = serde_json::to_string_pretty(&sorted)?;
        std::fs::write(&path, content)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        written.push(path);
    }

    if config.text {
        let path = report_path(run_dir, &summary.run_id, "txt");
        std::fs::write(&path, pretty_result(&sorted, summary))
            .with_context(|| format!("Failed to write {}", path.display()))?;
        written.push(path);
    }

    Ok(written)
}

/// Reads the JSON results of a previous run.
pub fn load_results(path: &Path) -> anyhow::Result<Vec<TestCaseResult>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read results from {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse results in {}", path.display()))
}
