//! Integration Test: Blocking I/O Prohibition
//!
//! **Policy**: async functions in the connection engine MUST NOT use blocking
//! file or network I/O.
//! **Required**: `tokio::fs` and `tokio::net` inside async code.
//! **Acceptable**: `std::fs` in synchronous functions such as config loading
//! before the runtime starts, or `Drop` implementations.

use architectural_enforcement::{core_source_dir, is_in_async_fn, scan, strip_comment, Violation};

/// Std networking types that block the calling thread
const BLOCKING_NET: &[&str] = &[
    "std::net::TcpStream",
    "std::net::TcpListener",
    "std::net::UdpSocket",
    "std::os::unix::net::",
];

#[test]
fn test_no_blocking_io_in_production_code() {
    let violations = find_blocking_io_violations();

    if !violations.is_empty() {
        eprintln!("\nBlocking I/O found in production code:\n");
        for violation in &violations {
            eprintln!("  {violation}");
        }
        eprintln!("\nForbidden: std::fs in async fns, std socket types anywhere");
        eprintln!("Required: tokio::fs, tokio::net\n");

        panic!("Found {} blocking I/O violation(s)", violations.len());
    }
}

fn find_blocking_io_violations() -> Vec<Violation> {
    scan(&core_source_dir(), |lines, idx| {
        let code = strip_comment(&lines[idx]);
        if BLOCKING_NET.iter().any(|pattern| code.contains(pattern)) {
            return Some("Blocking network I/O");
        }
        if code.contains("std::fs::") && !code.trim_start().starts_with("use ") && is_in_async_fn(lines, idx) {
            return Some("Blocking file I/O in async fn");
        }
        if code.contains("std::process::Command") {
            return Some("Blocking process I/O");
        }
        None
    })
}
