//! One-time setup before any test case runs.
//!
//! The compiler under test is built into `compiler.jar` by a single job in
//! the JDK image:
//!
//! ```text
//!   <src>   ──ro──► /project/src/
//!   <build> ──rw──► /project/target/   receives src.txt and compiler.jar
//!   <lib>   ──ro──► /project/lib/
//! ```
//!
//! A failed build is fatal for the whole run.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tracing::info;

use crate::backend::Backend;
use crate::config::Config;
use crate::job::{JobDescriptor, Mount, StageKind};
use crate::lifecycle::LifecycleController;
use crate::pipeline::commands;

/// Minimum timeout of the build job.
const BUILD_TIMEOUT: Duration = Duration::from_secs(300);

/// Builds `compiler.jar` into the configured build directory.
///
/// The job's stdout and stderr land in `log_dir` as `build.stdout.log` and
/// `build.stderr.log`.
pub async fn build_compiler<B: Backend>(
    controller: &LifecycleController,
    backend: &B,
    config: &Config,
    run_id: &str,
    log_dir: &Path,
) -> Result<PathBuf> {
    let compiler = &config.compiler;
    std::fs::create_dir_all(&compiler.build)
        .with_context(|| format!("Failed to create build directory {}", compiler.build.display()))?;

    let sources = java_sources(&compiler.src)?;
    if sources.is_empty() {
        bail!("No .java files under {}", compiler.src.display());
    }
    let listing: String = sources.iter().map(|s| format!("{}\n", s)).collect();
    std::fs::write(compiler.build.join("src.txt"), listing)
        .context("Failed to write src.txt")?;

    let classpath = match &compiler.lib {
        Some(lib) => library_jars(lib)?,
        None => Vec::new(),
    };

    let mut job = JobDescriptor::new("build", &config.docker.java_image, commands::build(&classpath))
        .instance_name(format!("judge_{}_build", run_id))
        .kind(StageKind::Build)
        .working_dir("/project")
        .timeout(config.timeout().max(BUILD_TIMEOUT))
        .output_dir(log_dir)
        .mount(Mount::read_only(&compiler.src, "/project/src/"))
        .mount(Mount::read_write(&compiler.build, "/project/target/"));
    if let Some(lib) = &compiler.lib {
        job = job.mount(Mount::read_only(lib, "/project/lib/"));
    }

    info!("Building compiler from {} source files", sources.len());
    let report = controller.run_job(&job, backend).await;
    if !report.outcome.is_success() {
        bail!(
            "Compiler build failed ({}), see {}",
            report.outcome,
            job.log_paths().1.display()
        );
    }

    let jar = compiler.jar();
    if !jar.is_file() {
        bail!("Compiler build finished but {} is missing", jar.display());
    }
    info!("Built {} in {:.1}s", jar.display(), report.duration.as_secs_f64());
    Ok(jar)
}

/// `src/...` paths of every `.java` file under `src`, sorted.
fn java_sources(src: &Path) -> Result<Vec<String>> {
    let mut files = Vec::new();
    collect_files(src, src, "java", &mut files)
        .with_context(|| format!("Failed to scan compiler sources in {}", src.display()))?;
    Ok(files.into_iter().map(|rel| format!("src/{}", rel)).collect())
}

/// Container paths of every `.jar` under `lib`, sorted.
fn library_jars(lib: &Path) -> Result<Vec<String>> {
    let mut files = Vec::new();
    collect_files(lib, lib, "jar", &mut files)
        .with_context(|| format!("Failed to scan libraries in {}", lib.display()))?;
    Ok(files.into_iter().map(|rel| format!("/project/lib/{}", rel)).collect())
}

fn collect_files(root: &Path, dir: &Path, extension: &str, out: &mut Vec<String>) -> std::io::Result<()> {
    let mut entries: Vec<_> = std::fs::read_dir(dir)?.collect::<Result<_, _>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            collect_files(root, &path, extension, out)?;
        } else if path.extension().is_some_and(|e| e == extension)
            && let Ok(rel) = path.strip_prefix(root)
        {
            out.push(rel.to_string_lossy().replace('\\', "/"));
        }
    }
    Ok(())
}

/// Writes the compiler source tree to `dest` as a tar archive.
pub fn archive_source(src: &Path, dest: &Path) -> Result<()> {
    let file = std::fs::File::create(dest)
        .with_context(|| format!("Failed to create {}", dest.display()))?;
    let mut builder = tar::Builder::new(file);
    builder
        .append_dir_all("src", src)
        .with_context(|| format!("Failed to archive {}", src.display()))?;
    builder.finish().context("Failed to finish source archive")?;
    info!("Archived compiler sources to {}", dest.display());
    Ok(())
}
