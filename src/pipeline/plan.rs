//! Run types and the stage table they select.
//!
//! The run type is a closed enum parsed from configuration, so an unknown
//! value is rejected when the configuration is loaded. [`PipelinePlan::new`]
//! maps it to a fixed list of stage templates once per run; building a
//! test case's [`Pipeline`] only fills in paths.
//!
//! | Run type | Stages |
//! |----------|--------|
//! | `interpreter` | interpret |
//! | `llvm` | compile (llvm), run-llvm |
//! | `qemu-arm` | compile (asm), genelf (arm), run-qemu (arm) |
//! | `qemu-riscv` | compile (asm), genelf (riscv), run-qemu (riscv) |
//! | `rpi` | compile (asm), genelf (arm), run-device |
//! | `both` | compile (llvm + asm), run-llvm, genelf (arm), run-qemu (arm) |

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::commands::{self, Arch, Emit};
use super::{JudgedOutput, Pipeline, Stage};
use crate::job::{ExecTarget, JobDescriptor, Mount, StageKind};
use crate::testcase::TestCase;

/// Which toolchain path test cases take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunType {
    Interpreter,
    Llvm,
    QemuArm,
    QemuRiscv,
    Rpi,
    Both,
}

impl RunType {
    /// Returns `true` if some stage runs on a remote device.
    pub fn needs_devices(self) -> bool {
        matches!(self, RunType::Rpi)
    }
}

impl fmt::Display for RunType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RunType::Interpreter => "interpreter",
            RunType::Llvm => "llvm",
            RunType::QemuArm => "qemu-arm",
            RunType::QemuRiscv => "qemu-riscv",
            RunType::Rpi => "rpi",
            RunType::Both => "both",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StageTemplate {
    Interpret,
    Compile(Emit),
    GenElf(Arch),
    RunLlvm { output: &'static str, perf: &'static str },
    RunQemu(Arch),
    RunDevice,
}

impl StageTemplate {
    fn name(self) -> &'static str {
        match self {
            StageTemplate::Interpret => "interpret",
            StageTemplate::Compile(_) => "compile",
            StageTemplate::GenElf(_) => "genelf",
            StageTemplate::RunLlvm { .. } => "run-llvm",
            StageTemplate::RunQemu(_) => "run-qemu",
            StageTemplate::RunDevice => "run-device",
        }
    }
}

fn stage_table(run_type: RunType, emit_llvm: bool) -> Vec<StageTemplate> {
    use StageTemplate::*;

    let asm = if emit_llvm { Emit::All } else { Emit::Asm };
    let run_llvm = RunLlvm {
        output: "output.txt",
        perf: "perf.txt",
    };

    match run_type {
        RunType::Interpreter => vec![Interpret],
        RunType::Llvm => vec![Compile(Emit::Llvm), run_llvm],
        RunType::QemuArm => vec![Compile(asm), GenElf(Arch::Arm), RunQemu(Arch::Arm)],
        RunType::QemuRiscv => vec![Compile(asm), GenElf(Arch::Riscv), RunQemu(Arch::Riscv)],
        RunType::Rpi => vec![Compile(asm), GenElf(Arch::Arm), RunDevice],
        RunType::Both => vec![
            Compile(Emit::All),
            RunLlvm {
                output: "output.llvm.txt",
                perf: "perf.llvm.txt",
            },
            GenElf(Arch::Arm),
            RunQemu(Arch::Arm),
        ],
    }
}

/// Run-wide inputs every pipeline shares.
#[derive(Debug, Clone)]
pub struct PlanSettings {
    /// Prefix of instance names, unique per run.
    pub run_id: String,
    /// Root under which each test case gets `<series>/<name>/`.
    pub case_root: PathBuf,
    pub compiler_jar: PathBuf,
    pub compiler_lib: Option<PathBuf>,
    pub java_image: String,
    pub sysy_image: String,
    pub jvm_options: String,
    pub opt_options: String,
    pub memory_limit: Option<i64>,
    pub timeout: Duration,
}

/// The stage table of a run, ready to be instantiated per test case.
#[derive(Debug, Clone)]
pub struct PipelinePlan {
    run_type: RunType,
    stages: Vec<StageTemplate>,
    settings: PlanSettings,
}

impl PipelinePlan {
    pub fn new(run_type: RunType, emit_llvm: bool, settings: PlanSettings) -> Self {
        Self {
            run_type,
            stages: stage_table(run_type, emit_llvm),
            settings,
        }
    }

    pub fn run_type(&self) -> RunType {
        self.run_type
    }

    /// Stage names in execution order.
    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Private directory of a test case.
    pub fn case_dir(&self, case: &TestCase) -> PathBuf {
        self.settings.case_root.join(&case.series).join(&case.name)
    }

    /// Creates the case directory (replacing a stale one) and builds the
    /// test case's pipeline.
    pub fn build(&self, case: &TestCase) -> std::io::Result<Pipeline> {
        let case_dir = self.case_dir(case);
        if case_dir.exists() {
            std::fs::remove_dir_all(&case_dir)?;
        }
        std::fs::create_dir_all(&case_dir)?;

        let input = match &case.input {
            Some(input) => input.clone(),
            None => {
                let empty = case_dir.join("input.txt");
                std::fs::write(&empty, "")?;
                empty
            }
        };

        let stages = self
            .stages
            .iter()
            .map(|template| self.stage(*template, case, &case_dir, &input))
            .collect();

        Ok(Pipeline {
            case: case.clone(),
            case_dir,
            input,
            stages,
        })
    }

    fn stage(&self, template: StageTemplate, case: &TestCase, case_dir: &Path, input: &Path) -> Stage {
        let s = &self.settings;
        let instance = format!(
            "judge_{}_{}_{}_{}",
            s.run_id,
            case.series,
            case.name,
            template.name()
        );

        let mut job = JobDescriptor::new(template.name(), "", "")
            .instance_name(instance)
            .working_dir("/compiler")
            .timeout(s.timeout)
            .output_dir(case_dir);
        if let Some(limit) = s.memory_limit {
            job = job.memory_limit(limit);
        }

        let output_mount = Mount::read_write(case_dir, "/output/");
        let input_mount = Mount::read_only(input, "/compiler/input.txt");
        let judged = |output: &str, perf: &str| {
            Some(JudgedOutput {
                output: case_dir.join(output),
                perf: case_dir.join(perf),
            })
        };

        let (job, judged) = match template {
            StageTemplate::Interpret => (
                self.with_compiler(job, case)
                    .kind(StageKind::Run)
                    .mount(input_mount)
                    .mount(output_mount)
                    .image(&s.java_image)
                    .command(commands::interpret(&s.jvm_options, &s.opt_options)),
                judged("output.txt", "perf.txt"),
            ),
            StageTemplate::Compile(emit) => (
                self.with_compiler(job, case)
                    .kind(StageKind::Compile)
                    .mount(output_mount)
                    .image(&s.java_image)
                    .command(commands::compile(emit, &s.jvm_options, &s.opt_options)),
                None,
            ),
            StageTemplate::GenElf(arch) => (
                job.kind(StageKind::Assemble)
                    .mount(Mount::read_only(case_dir.join("test.S"), "/compiler/test.S"))
                    .mount(Mount::read_write(case_dir.join("test.elf"), "/compiler/test.elf"))
                    .mount(output_mount)
                    .image(&s.sysy_image)
                    .command(commands::genelf(arch)),
                None,
            ),
            StageTemplate::RunLlvm { output, perf } => (
                job.kind(StageKind::Run)
                    .mount(Mount::read_only(case_dir.join("test.ll"), "/compiler/test.ll"))
                    .mount(input_mount)
                    .mount(output_mount)
                    .image(&s.sysy_image)
                    .command(commands::run_llvm(output, perf)),
                judged(output, perf),
            ),
            StageTemplate::RunQemu(arch) => (
                job.kind(StageKind::Run)
                    .mount(Mount::read_only(case_dir.join("test.elf"), "/compiler/test.elf"))
                    .mount(input_mount)
                    .mount(output_mount)
                    .image(&s.sysy_image)
                    .command(commands::run_qemu(arch, "output.txt", "perf.txt")),
                judged("output.txt", "perf.txt"),
            ),
            StageTemplate::RunDevice => (
                job.kind(StageKind::Run)
                    .target(ExecTarget::Device)
                    .mount(Mount::read_only(case_dir.join("test.elf"), "/compiler/test.elf"))
                    .mount(input_mount)
                    .mount(output_mount)
                    .command(commands::run_native("output.txt", "perf.txt")),
                judged("output.txt", "perf.txt"),
            ),
        };

        Stage { job, judged }
    }

    fn with_compiler(&self, job: JobDescriptor, case: &TestCase) -> JobDescriptor {
        let job = job
            .mount(Mount::read_only(&self.settings.compiler_jar, "/compiler/compiler.jar"))
            .mount(Mount::read_only(&case.source, "/compiler/test.sy"));
        match &self.settings.compiler_lib {
            Some(lib) => job.mount(Mount::read_only(lib, "/project/lib/")),
            None => job,
        }
    }
}
