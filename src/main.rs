//! compiler-judge CLI - grade a compiler against a tree of test cases.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;

use compiler_judge::config::{self, EXAMPLE_CONFIG};
use compiler_judge::orchestrator::Orchestrator;
use compiler_judge::report::{self, ConsoleReporter, MultiReporter, RunSummary};
use compiler_judge::run_log::{self, RunLog};
use compiler_judge::testcase;

#[derive(Parser)]
#[command(name = "compiler-judge")]
#[command(about = "Sandboxed build-and-run harness for grading compilers", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "judge.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the compiler and judge all selected test cases
    Run {
        /// Override the number of test cases run in parallel
        #[arg(short, long)]
        parallel: Option<usize>,

        /// Leave containers behind for inspection
        #[arg(long)]
        keep_containers: bool,

        /// Use the existing compiler.jar instead of rebuilding it
        #[arg(long)]
        no_rebuild: bool,
    },

    /// List the selected test cases without running them
    Collect {
        #[arg(short, long, value_enum, default_value_t = Format::Text)]
        format: Format,
    },

    /// Print the results of a previous run from its JSON report
    Show {
        /// Path to result_<run_id>.json
        results: PathBuf,
    },

    /// Validate configuration file
    Validate,

    /// Write a starter configuration file
    Init,
}

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            parallel,
            keep_containers,
            no_rebuild,
        } => run_judge(&cli.config, parallel, keep_containers, no_rebuild, cli.verbose).await,
        Commands::Collect { format } => {
            run_log::init_tracing(cli.verbose, None)?;
            collect_cases(&cli.config, format)
        }
        Commands::Show { results } => show_results(&results),
        Commands::Validate => validate_config(&cli.config),
        Commands::Init => init_config(&cli.config),
    }
}

async fn run_judge(
    config_path: &Path,
    parallel: Option<usize>,
    keep_containers: bool,
    no_rebuild: bool,
    verbose: bool,
) -> Result<()> {
    let mut config = config::load_config(config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    // Apply overrides
    if let Some(parallel) = parallel {
        config.judge.num_parallel = parallel;
    }
    if keep_containers {
        config.judge.keep_containers = true;
    }
    if no_rebuild {
        config.judge.rebuild_compiler = false;
    }
    config.validate()?;

    let run_log = RunLog::create(&config.report.log_dir, Some(config_path))?;
    run_log::init_tracing(verbose, Some(&run_log.log_file()))?;
    info!("Loaded configuration from {}", config_path.display());
    info!("Run {} logging to {}", run_log.run_id, run_log.dir.display());

    let reporter = MultiReporter::new().with_reporter(ConsoleReporter::new(verbose));
    let result = Orchestrator::new(config, run_log.clone())
        .run(Arc::new(reporter))
        .await?;

    println!();
    for path in &result.reports {
        println!("Report: {}", path.display());
    }
    println!("log name: {}", run_log.run_id);

    std::process::exit(result.exit_code());
}

fn collect_cases(config_path: &Path, format: Format) -> Result<()> {
    let config = config::load_config(config_path)?;
    let cases = testcase::discover(&config.testcases.base, &config.testcases.select)?;

    match format {
        Format::Json => {
            let json = serde_json::to_string_pretty(&cases)?;
            println!("{}", json);
        }
        Format::Text => {
            println!("Discovered {} test cases:", cases.len());
            for case in &cases {
                let input = if case.input.is_some() { " [input]" } else { "" };
                println!("  {}{}", case.full_name(), input);
            }
        }
    }

    Ok(())
}

fn show_results(path: &Path) -> Result<()> {
    let mut results = report::load_results(path)?;
    results.sort_by(|a, b| (&a.series, &a.name).cmp(&(&b.series, &b.name)));

    let run_id = path
        .file_stem()
        .and_then(|s| s.to_str())
        .map(|s| s.trim_start_matches("result_").to_string())
        .unwrap_or_default();
    let duration: f64 = results.iter().map(|r| r.duration_secs).sum();
    let summary = RunSummary::new(run_id, &results, Duration::from_secs_f64(duration));

    print!("{}", report::pretty_result(&results, &summary));
    std::process::exit(summary.exit_code());
}

fn validate_config(config_path: &Path) -> Result<()> {
    match config::load_config(config_path) {
        Ok(config) => {
            println!("Configuration is valid!");
            println!();
            println!("Settings:");
            println!("  Run type: {}", config.judge.run_type);
            println!("  Parallel: {}", config.judge.num_parallel);
            println!("  Timeout: {}s", config.judge.timeout_secs);
            println!("  Memory limit: {}", config.judge.memory_limit);
            println!("  Compiler sources: {}", config.compiler.src.display());
            println!("  Test cases: {}", config.testcases.base.display());
            if config.judge.run_type.needs_devices() {
                println!("  Devices: {}", config.devices.addresses.join(", "));
            }

            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            std::process::exit(1);
        }
    }
}

fn init_config(path: &Path) -> Result<()> {
    if path.exists() {
        eprintln!(
            "{} already exists. Remove it first or edit manually.",
            path.display()
        );
        std::process::exit(1);
    }

    std::fs::write(path, EXAMPLE_CONFIG)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    println!("Created {}", path.display());
    println!();
    println!("Edit the configuration as needed, then run:");
    println!("  compiler-judge run");

    Ok(())
}
