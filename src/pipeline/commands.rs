//! Toolchain command lines.
//!
//! Every stage runs its command as `/bin/sh -c <command>` with the working
//! directory set to `/compiler`. Diagnostics go to files in the `/output/`
//! mount so they survive the instance. Run commands append the program's
//! exit code as the last line of the output file, which is what answer
//! files expect.

use std::fmt;

/// Image providing the JDK used to build, run and interpret the compiler.
pub const JAVA_IMAGE: &str = "openjdk:17-oracle";

/// Image providing the LLVM, cross assemblers and QEMU user emulators.
pub const SYSY_IMAGE: &str = "sysy:tobisc";

/// Target architecture of generated assembly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    Arm,
    Riscv,
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Arch::Arm => "arm",
            Arch::Riscv => "riscv",
        })
    }
}

/// What the compile stage emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Emit {
    /// `test.ll`
    Llvm,
    /// `test.S`
    Asm,
    /// `test.ll` and `test.S`
    All,
}

/// Builds `compiler.jar` from the sources listed in `target/src.txt`.
///
/// `classpath` is the `:`-separated list of library jars (may be empty);
/// the same jars separated by spaces go into the manifest.
pub fn build(classpath: &[String]) -> String {
    let cp = if classpath.is_empty() {
        String::new()
    } else {
        format!("-cp {}", classpath.join(":"))
    };
    format!(
        "javac -d target -encoding 'utf-8' {cp} @target/src.txt; r=$?; if [ $r -ne 0 ]; then exit $r; fi; \
         cd target; echo '**' > .gitignore; mkdir -p META-INF; \
         printf 'Manifest-Version: 1.0\\r\\nClass-Path: {libs}\\r\\nMain-Class: Compiler\\r\\n\\r\\n' > META-INF/MANIFEST.MF; \
         jar -cvfm compiler.jar META-INF/MANIFEST.MF *",
        cp = cp,
        libs = classpath.join(" "),
    )
}

pub fn compile(emit: Emit, jvm: &str, opt: &str) -> String {
    let (flags, artifacts) = match emit {
        Emit::Llvm => ("-emit-llvm -o test.ll", "test.ll"),
        Emit::Asm => ("-S -o test.S", "test.S"),
        Emit::All => ("-emit-llvm -o test.ll -S -o test.S", "test.S test.ll"),
    };
    format!(
        "java {jvm} -jar compiler.jar {flags} test.sy {opt} 2>/output/compile.log; r=$?; \
         cp {artifacts} /output/; exit $r"
    )
}

/// Compiles and interprets in one step.
pub fn interpret(jvm: &str, opt: &str) -> String {
    format!(
        "java {jvm} -jar compiler.jar -I test.sy {opt} <input.txt >output.txt 2>/output/perf.txt; r=$?; {}",
        finish_output("output.txt", "output.txt", "/output/")
    )
}

pub fn genelf(arch: Arch) -> String {
    format!("ARCH={arch} sysy-asm2elf.sh test.S 2>/output/genelf.log")
}

pub fn run_llvm(output: &str, perf: &str) -> String {
    format!(
        "sysy-run-llvm.sh test.ll <input.txt >output.txt 2>/output/{perf}; r=$?; {}",
        finish_output("output.txt", output, "/output/")
    )
}

pub fn run_qemu(arch: Arch, output: &str, perf: &str) -> String {
    format!(
        "ARCH={arch} sysy-run-elf.sh test.elf <input.txt >output.txt 2>/output/{perf}; r=$?; {}",
        finish_output("output.txt", output, "/output/")
    )
}

/// Runs the ELF natively. Paths are relative: on a device the job's mounts
/// are re-rooted under its own working directory.
pub fn run_native(output: &str, perf: &str) -> String {
    format!(
        "chmod +x test.elf; ./test.elf <input.txt >output.txt 2>../output/{perf}; r=$?; {}",
        finish_output("output.txt", output, "../output/")
    )
}

/// Terminates `file` with a newline if needed, appends the exit code in `$r`
/// and copies it to `dest_dir/name`.
fn finish_output(file: &str, name: &str, dest_dir: &str) -> String {
    format!(
        "if [ ! -z \"$(tail -c 1 {file})\" ]; then echo >> {file}; fi; echo $r >> {file}; cp {file} {dest_dir}{name}"
    )
}
