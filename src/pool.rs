//! The preprocess and compile pools (spec §4.2, §4.3): the actual child
//! processes behind the `Spawn*` [`crate::dispatcher::Action`]s.
//!
//! Concurrency is gated entirely by the dispatcher's running-count checks
//! in `start_jobs` (spec §5: "parallelism is entirely delegated to child
//! processes") — these functions just run one process each and report back
//! what happened. The event loop in `daemon.rs` is expected to
//! `tokio::spawn` each call and feed the `ProcessOutcome` back into
//! `Dispatcher::on_process_finished`.

use std::ffi::OsString;
use std::path::Path;
use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::compiler_args::CompilerArgs;
use crate::dispatcher::ProcessOutcome;
use crate::errors::Result;
use crate::job::Job;

/// Runs the compiler in `-E` mode, capturing the preprocessed translation
/// unit on stdout (spec §4.2). Any `-o`/`-c`/`-S` already present is
/// stripped so stdout carries the preprocessed text rather than writing an
/// object file.
pub async fn run_preprocess(job: &Job) -> Result<ProcessOutcome> {
    // job.argv[0] is the compiler's own name (spec §4.11 ClientJob shape);
    // only argv[1..] are real arguments.
    let argv = rewrite_for_preprocess(&job.argv[1..]);
    let output = Command::new(&job.resolved_compiler_path)
        .args(&argv)
        .current_dir(&job.cwd)
        .envs(job.env.iter().cloned())
        .stdin(Stdio::null())
        .output()
        .await?;

    Ok(ProcessOutcome { success: output.status.success(), stdout: Vec::new(), stderr: output.stderr, artifact: output.stdout })
}

/// Runs the job exactly as the shim would have (spec §4.5 step 2, Local
/// branch): the real argv, the real cwd, the real output path. The compiler
/// writes the object file itself; `artifact` is unused.
pub async fn run_compile_local(job: &Job) -> Result<ProcessOutcome> {
    let output = Command::new(&job.resolved_compiler_path)
        .args(job.argv[1..].iter().cloned())
        .current_dir(&job.cwd)
        .envs(job.env.iter().cloned())
        .stdin(Stdio::null())
        .output()
        .await?;

    Ok(ProcessOutcome { success: output.status.success(), stdout: output.stdout, stderr: output.stderr, artifact: Vec::new() })
}

/// Compiles an already-preprocessed translation unit on behalf of a peer
/// (spec §4.6): the preprocessed bytes are piped over the child's stdin with
/// the source argument replaced by `-`, argv is rewritten to compile into a
/// scratch object, and the object bytes are read back as `artifact` for the
/// `JobResponse` (spec §4.4).
pub async fn run_compile_remote_serve(job: &Job) -> Result<ProcessOutcome> {
    let preprocessed = job.preprocessed.as_deref().unwrap_or(&[]);

    let object = tempfile::Builder::new().suffix(".o").tempfile()?;

    let argv = rewrite_for_remote_compile(&job.compiler_args, object.path());
    let mut child = Command::new(&job.resolved_compiler_path)
        .args(&argv)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let mut stdin = child.stdin.take().expect("spawned with piped stdin");
    stdin.write_all(preprocessed).await?;
    drop(stdin); // EOF, so the compiler stops waiting for more input

    let output = child.wait_with_output().await?;

    if !output.status.success() {
        return Ok(ProcessOutcome { success: false, stdout: output.stdout, stderr: output.stderr, artifact: Vec::new() });
    }

    let artifact = std::fs::read(object.path())?;
    Ok(ProcessOutcome { success: true, stdout: output.stdout, stderr: output.stderr, artifact })
}

fn rewrite_for_preprocess(argv: &[OsString]) -> Vec<OsString> {
    let mut out = Vec::with_capacity(argv.len() + 1);
    let mut iter = argv.iter().peekable();
    while let Some(arg) = iter.next() {
        let s = arg.to_string_lossy();
        if s == "-o" {
            iter.next(); // drop the path too
        } else if s == "-c" || s == "-S" {
            // dropped: -E below supersedes it
        } else {
            out.push(arg.clone());
        }
    }
    out.push(OsString::from("-E"));
    out
}

/// Builds the argv the remote side actually runs: `-x <language>` plus `-`
/// in place of the source path (the preprocessed bytes arrive over stdin,
/// not as a file we can point at), the caller's flags with anything that
/// references a file absent on this host stripped, and `-o` pointed at the
/// scratch object (spec §4.3: "stripping `-I…`, `-MF`, `-MT`, `-MMD`
/// (they reference files absent on this host)").
fn rewrite_for_remote_compile(args: &CompilerArgs, object_path: &Path) -> Vec<OsString> {
    let mut out: Vec<OsString> = vec![OsString::from("-x"), OsString::from(args.language.as_str()), OsString::from("-c")];
    out.extend(strip_host_local_flags(&args.flags));
    out.push(OsString::from("-o"));
    out.push(object_path.as_os_str().to_owned());
    out.push(OsString::from("-"));
    out
}

/// Drops `-I…`, `-MF …`/`-MF…`, `-MT …`/`-MT…`, and `-MMD` (spec §4.3):
/// these name paths or files on the job's originating host, which don't
/// exist here.
fn strip_host_local_flags(flags: &[OsString]) -> Vec<OsString> {
    let mut out = Vec::with_capacity(flags.len());
    let mut iter = flags.iter().peekable();
    while let Some(arg) = iter.next() {
        let s = arg.to_string_lossy();
        if s == "-MMD" {
            continue;
        } else if s == "-I" || s == "-MF" || s == "-MT" {
            iter.next(); // drop the separate-form value too
        } else if s.starts_with("-I") || s.starts_with("-MF") || s.starts_with("-MT") {
            // attached form, e.g. -Ipath, -MFfile.d
        } else {
            out.push(arg.clone());
        }
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::compiler_args::Language;
    use std::path::PathBuf;

    fn ov(args: &[&str]) -> Vec<OsString> {
        args.iter().map(OsString::from).collect()
    }

    #[test]
    fn preprocess_rewrite_strips_output_and_mode_flags() {
        let rewritten = rewrite_for_preprocess(&ov(&["-c", "hello.c", "-o", "hello.o", "-Wall"]));
        assert_eq!(rewritten, ov(&["hello.c", "-Wall", "-E"]));
    }

    #[test]
    fn remote_compile_rewrite_reads_stdin_and_strips_host_local_flags() {
        let args = CompilerArgs {
            mode: crate::compiler_args::Mode::Compile,
            language: Language::C,
            source_files: vec![PathBuf::from("hello.c")],
            object_file: Some(PathBuf::from("hello.o")),
            flags: vec![
                OsString::from("-O2"),
                OsString::from("-I"),
                OsString::from("/home/alice/include"),
                OsString::from("-Ivendor"),
                OsString::from("-MMD"),
                OsString::from("-MF"),
                OsString::from("dep.d"),
            ],
        };
        let rewritten = rewrite_for_remote_compile(&args, Path::new("/tmp/a.o"));
        assert_eq!(rewritten, ov(&["-x", "cpp-output", "-c", "-O2", "-o", "/tmp/a.o", "-"]));
    }

    #[test]
    fn remote_compile_rewrite_tags_language_for_stdin_input() {
        let args = CompilerArgs {
            mode: crate::compiler_args::Mode::Compile,
            language: Language::Cxx,
            source_files: vec![PathBuf::from("hello.cc")],
            object_file: None,
            flags: vec![],
        };
        let rewritten = rewrite_for_remote_compile(&args, Path::new("/tmp/b.o"));
        assert_eq!(rewritten, ov(&["-x", "c++-cpp-output", "-c", "-o", "/tmp/b.o", "-"]));
    }
}
