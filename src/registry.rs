//! `CompilerRegistry` (spec §4.10, §4.13) — an external collaborator in the
//! core spec, implemented here as a small, real, in-memory default so the
//! crate builds end to end. No package distribution: if a peer advertises a
//! key we don't know, we just drop the advertisement (never fetch a
//! compiler we don't have).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::job::{CompilerKey, CompilerType};

#[derive(Debug, Clone)]
pub struct CompilerRecord {
    pub path: PathBuf,
    pub env: Vec<(String, String)>,
}

pub trait CompilerRegistry: Send + Sync {
    fn find_by_path(&self, path: &Path) -> Option<CompilerKey>;
    fn find_by_key(&self, key: &CompilerKey) -> Option<CompilerRecord>;
    /// Registers `path`, fingerprinting it and returning the derived key.
    fn init(&mut self, path: &Path) -> crate::errors::Result<CompilerKey>;
}

/// Fingerprints a compiler binary by running it with `--version` and
/// pattern-matching the banner, the same trick `icecc`/`distcc`/`sccache`
/// all use since there's no ABI-stable way to ask a compiler what it is.
pub fn fingerprint(path: &Path) -> crate::errors::Result<CompilerKey> {
    let output = Command::new(path).arg("--version").output()?;
    let banner = String::from_utf8_lossy(&output.stdout);
    let first_line = banner.lines().next().unwrap_or("");

    let compiler_type = if first_line.contains("clang") {
        if first_line.contains("Apple") {
            CompilerType::ClangApple
        } else {
            CompilerType::Clang
        }
    } else if first_line.contains("GCC") || first_line.contains("gcc") {
        CompilerType::GCC
    } else {
        CompilerType::Unknown
    };

    let major_version = first_line
        .split(|c: char| !c.is_ascii_digit() && c != '.')
        .find(|tok| !tok.is_empty() && tok.chars().next().unwrap().is_ascii_digit())
        .and_then(|tok| tok.split('.').next())
        .and_then(|v| v.parse::<i32>().ok())
        .unwrap_or(0);

    let target = Command::new(path)
        .arg("-dumpmachine")
        .output()
        .ok()
        .filter(|o| o.status.success())
        .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
        .unwrap_or_else(|| std::env::consts::ARCH.to_string());

    Ok(CompilerKey::new(compiler_type, major_version, target))
}

/// The default, in-memory registry: populated at startup by probing `$PATH`
/// (spec §4.13), queried thereafter by path or by key.
#[derive(Default)]
pub struct InMemoryRegistry {
    by_path: HashMap<PathBuf, CompilerKey>,
    by_key: HashMap<CompilerKey, CompilerRecord>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        InMemoryRegistry { by_path: HashMap::new(), by_key: HashMap::new() }
    }

    /// Probes `$PATH` for the usual compiler names, registering whichever
    /// resolve (spec §4.13). Failures to fingerprint an individual
    /// candidate are swallowed — we simply don't advertise that one.
    pub fn probe_path(&mut self) {
        for name in ["cc", "gcc", "g++", "clang", "clang++"] {
            if let Ok(path) = which::which(name) {
                let _ = self.init(&path);
            }
        }
    }
}

impl CompilerRegistry for InMemoryRegistry {
    fn find_by_path(&self, path: &Path) -> Option<CompilerKey> {
        self.by_path.get(path).cloned()
    }

    fn find_by_key(&self, key: &CompilerKey) -> Option<CompilerRecord> {
        self.by_key.get(key).cloned()
    }

    fn init(&mut self, path: &Path) -> crate::errors::Result<CompilerKey> {
        let key = fingerprint(path)?;
        self.by_path.insert(path.to_path_buf(), key.clone());
        self.by_key.insert(key.clone(), CompilerRecord { path: path.to_path_buf(), env: vec![] });
        Ok(key)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn init_registers_both_indexes() {
        let mut registry = InMemoryRegistry::new();
        // Use `true` as a stand-in "compiler": fingerprinting any binary
        // that doesn't understand --version just yields CompilerType::Unknown,
        // which is fine for exercising the bookkeeping.
        let path = which::which("true").unwrap_or_else(|_| PathBuf::from("/bin/true"));
        let key = registry.init(&path).unwrap();
        assert_eq!(registry.find_by_path(&path), Some(key.clone()));
        assert!(registry.find_by_key(&key).is_some());
    }

    #[test]
    fn unknown_key_is_none() {
        let registry = InMemoryRegistry::new();
        let key = CompilerKey::new(CompilerType::GCC, 99, "bogus-target");
        assert!(registry.find_by_key(&key).is_none());
    }
}
