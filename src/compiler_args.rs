//! Compiler-argument parsing (spec §4.12). The real system treats this as an
//! external collaborator (`parse_args(argv) -> CompilerArgs`); we implement
//! just enough of it, in the style of the teacher's `compiler/c.rs`
//! `ParsedArguments`, to drive the dispatcher's backpressure rule (§4.3):
//! single-source `Compile`/`Assemble` invocations are the only ones ever
//! eligible for remote dispatch.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Compile,
    Assemble,
    Preprocess,
    Link,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Language {
    C,
    Cxx,
    ObjectiveC,
    ObjectiveCxx,
}

impl Language {
    pub fn from_extension(path: &Path) -> Option<Self> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("c") => Some(Language::C),
            Some("cc") | Some("cpp") | Some("cxx") | Some("C") => Some(Language::Cxx),
            Some("m") => Some(Language::ObjectiveC),
            Some("mm") => Some(Language::ObjectiveCxx),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Language::C => "cpp-output",
            Language::Cxx => "c++-cpp-output",
            Language::ObjectiveC => "objective-c-cpp-output",
            Language::ObjectiveCxx => "objective-c++-cpp-output",
        }
    }
}

/// The subset of a parsed commandline the dispatcher needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompilerArgs {
    pub mode: Mode,
    pub language: Language,
    pub source_files: Vec<PathBuf>,
    pub object_file: Option<PathBuf>,
    pub flags: Vec<OsString>,
}

impl Default for CompilerArgs {
    fn default() -> Self {
        CompilerArgs {
            mode: Mode::Compile,
            language: Language::C,
            source_files: vec![PathBuf::from("a.c")],
            object_file: Some(PathBuf::from("a.o")),
            flags: vec![],
        }
    }
}

impl CompilerArgs {
    /// Only a single-source `Compile`/`Assemble` invocation is ever eligible
    /// to be dispatched remotely (spec §4.3 backpressure rule): multi-source,
    /// link, and preprocess-only invocations always stay local.
    pub fn is_remotable_shape(&self) -> bool {
        matches!(self.mode, Mode::Compile | Mode::Assemble) && self.source_files.len() == 1
    }

    pub fn output_path(&self) -> PathBuf {
        self.object_file.clone().unwrap_or_else(|| {
            self.source_files
                .first()
                .map(|s| s.with_extension("o"))
                .unwrap_or_else(|| PathBuf::from("a.o"))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompilerArguments {
    Ok(CompilerArgs),
    CannotCache(&'static str),
    NotCompilation,
}

/// Minimal GCC/Clang-style commandline parser. Recognizes the flags named
/// in spec §4.12; anything else is treated as an opaque flag passed through
/// verbatim (`flags`).
pub fn parse_args(argv: &[OsString]) -> CompilerArguments {
    if argv.is_empty() {
        return CompilerArguments::NotCompilation;
    }

    let mut mode = Mode::Link;
    let mut object_file: Option<PathBuf> = None;
    let mut source_files = Vec::new();
    let mut flags = Vec::new();
    let mut saw_arch = 0u32;
    let mut iter = argv.iter().peekable();

    while let Some(arg) = iter.next() {
        let s = arg.to_string_lossy();
        if s == "-v" || s == "--version" || s == "-dumpversion" {
            return CompilerArguments::NotCompilation;
        } else if s == "-c" {
            mode = Mode::Compile;
        } else if s == "-E" {
            mode = Mode::Preprocess;
        } else if s == "-S" {
            mode = Mode::Assemble;
        } else if s == "-o" {
            if let Some(path) = iter.next() {
                object_file = Some(PathBuf::from(path));
            }
        } else if s == "-arch" {
            saw_arch += 1;
            if let Some(next) = iter.next() {
                flags.push(arg.clone());
                flags.push(next.clone());
            }
        } else if s.starts_with('-') {
            flags.push(arg.clone());
        } else {
            let path = PathBuf::from(arg);
            if Language::from_extension(&path).is_some() {
                source_files.push(path);
            } else {
                // Not a recognized source extension: treat as a non-source
                // positional argument (e.g. an object file being linked).
                flags.push(arg.clone());
            }
        }
    }

    if source_files.is_empty() {
        return CompilerArguments::NotCompilation;
    }
    if saw_arch > 1 {
        return CompilerArguments::CannotCache("multiple -arch flags in one invocation");
    }

    let language = Language::from_extension(&source_files[0]).unwrap_or(Language::C);

    CompilerArguments::Ok(CompilerArgs { mode, language, source_files, object_file, flags })
}

#[cfg(test)]
mod test {
    use super::*;

    fn ov(args: &[&str]) -> Vec<OsString> {
        args.iter().map(OsString::from).collect()
    }

    #[test]
    fn single_source_compile_is_remotable() {
        let args = parse_args(&ov(&["-c", "hello.c", "-o", "hello.o"]));
        match args {
            CompilerArguments::Ok(a) => {
                assert_eq!(a.mode, Mode::Compile);
                assert!(a.is_remotable_shape());
                assert_eq!(a.output_path(), PathBuf::from("hello.o"));
            }
            other => panic!("expected Ok, got {:?}", other),
        }
    }

    #[test]
    fn link_mode_is_never_remotable() {
        let args = parse_args(&ov(&["a.o", "b.o", "-o", "prog"]));
        match args {
            CompilerArguments::Ok(a) => {
                assert!(!a.is_remotable_shape());
            }
            other => panic!("expected Ok, got {:?}", other),
        }
    }

    #[test]
    fn multi_source_is_never_remotable() {
        let args = parse_args(&ov(&["-c", "a.c", "b.c"]));
        match args {
            CompilerArguments::Ok(a) => assert!(!a.is_remotable_shape()),
            other => panic!("expected Ok, got {:?}", other),
        }
    }

    #[test]
    fn preprocess_only_is_never_remotable() {
        let args = parse_args(&ov(&["-E", "hello.c"]));
        match args {
            CompilerArguments::Ok(a) => {
                assert_eq!(a.mode, Mode::Preprocess);
                assert!(!a.is_remotable_shape());
            }
            other => panic!("expected Ok, got {:?}", other),
        }
    }

    #[test]
    fn version_query_is_not_a_compilation() {
        assert_eq!(parse_args(&ov(&["--version"])), CompilerArguments::NotCompilation);
        assert_eq!(parse_args(&ov(&[])), CompilerArguments::NotCompilation);
    }

    #[test]
    fn repeated_arch_cannot_cache() {
        let args = parse_args(&ov(&["-c", "hello.c", "-arch", "x86_64", "-arch", "arm64"]));
        assert_eq!(args, CompilerArguments::CannotCache("multiple -arch flags in one invocation"));
    }

    #[test]
    fn default_object_derived_from_source_stem() {
        let args = parse_args(&ov(&["-c", "hello.c"]));
        match args {
            CompilerArguments::Ok(a) => assert_eq!(a.output_path(), PathBuf::from("hello.o")),
            other => panic!("expected Ok, got {:?}", other),
        }
    }
}
