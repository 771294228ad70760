//! Architectural Enforcement
//!
//! Source scanners shared by the integration tests of this package. The
//! tests hold the connection engine in `ipc/core/src` to two rules:
//! - No blocking sleeps, and async sleeps only on retry or backoff paths
//! - No blocking file or network I/O inside async functions
//!
//! The scanners are line based. Test modules are skipped from the first
//! `#[cfg(test)]` line of a file onwards.

use std::fs;
use std::path::{Path, PathBuf};

/// Production sources checked by the tests
pub fn core_source_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../ipc/core/src")
}

/// Every `.rs` file below `dir`, sorted
pub fn rust_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.path().extension().and_then(|ext| ext.to_str()) == Some("rs"))
        .map(walkdir::DirEntry::into_path)
        .collect();
    files.sort();
    files
}

/// Read a file, keeping only the lines before its test module
pub fn production_source(path: &Path) -> Vec<String> {
    let Ok(content) = fs::read_to_string(path) else {
        return Vec::new();
    };
    content
        .lines()
        .take_while(|line| line.trim() != "#[cfg(test)]")
        .map(str::to_string)
        .collect()
}

/// The code part of a line, without a trailing `//` comment
pub fn strip_comment(line: &str) -> &str {
    line.split("//").next().unwrap_or(line)
}

/// Whether a trimmed line starts a function definition
pub fn is_fn_signature(line: &str) -> bool {
    let mut rest = line.trim();
    for prefix in ["pub(crate) ", "pub(super) ", "pub ", "const ", "unsafe "] {
        rest = rest.strip_prefix(prefix).unwrap_or(rest);
    }
    rest.starts_with("fn ") || rest.starts_with("async fn ")
}

/// Signature of the function enclosing line `idx`, if any
pub fn enclosing_fn<'a, S: AsRef<str>>(lines: &'a [S], idx: usize) -> Option<&'a str> {
    let end = (idx + 1).min(lines.len());
    for line in lines[..end].iter().rev() {
        let line = line.as_ref().trim();
        if is_fn_signature(line) {
            return Some(line);
        }
        if line.starts_with("impl ") || line.starts_with("mod ") {
            return None;
        }
    }
    None
}

/// Whether line `idx` sits inside an `async fn`
pub fn is_in_async_fn<S: AsRef<str>>(lines: &[S], idx: usize) -> bool {
    enclosing_fn(lines, idx).is_some_and(|signature| signature.contains("async fn "))
}

/// One offending line
#[derive(Debug)]
pub struct Violation {
    pub path: PathBuf,
    pub line: usize,
    pub text: String,
    pub reason: &'static str,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{} - {}: {}",
            self.path.display(),
            self.line,
            self.reason,
            self.text.trim()
        )
    }
}

/// Run `check` over every production line below `dir`
pub fn scan<F>(dir: &Path, check: F) -> Vec<Violation>
where
    F: Fn(&[String], usize) -> Option<&'static str>,
{
    let mut violations = Vec::new();
    for path in rust_files(dir) {
        let lines = production_source(&path);
        for idx in 0..lines.len() {
            if let Some(reason) = check(&lines, idx) {
                violations.push(Violation {
                    path: path.clone(),
                    line: idx + 1,
                    text: lines[idx].clone(),
                    reason,
                });
            }
        }
    }
    violations
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fn_signature_detection() {
        assert!(is_fn_signature("pub async fn connect(&self) {"));
        assert!(is_fn_signature("pub(crate) fn install("));
        assert!(is_fn_signature("fn drop(&mut self) {"));
        assert!(!is_fn_signature("let f = fn_pointer;"));
        assert!(!is_fn_signature("// fn commented"));
    }

    #[test]
    fn test_async_context_detection() {
        let code = [
            "impl Thing {",
            "    pub async fn run(&self) {",
            "        let data = std::fs::read(\"x\");",
            "    }",
            "    fn sync_helper() {",
            "        let data = std::fs::read(\"y\");",
            "    }",
            "}",
        ];
        assert!(is_in_async_fn(&code, 2));
        assert!(!is_in_async_fn(&code, 5));
        assert!(!is_in_async_fn(&code, 0));
    }

    #[test]
    fn test_core_sources_found() {
        let files = rust_files(&core_source_dir());
        assert!(files.iter().any(|path| path.ends_with("actor.rs")));
    }
}
