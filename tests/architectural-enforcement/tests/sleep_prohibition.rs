//! Integration Test: Sleep Prohibition
//!
//! **Policy**: the connection engine waits on I/O, channels and timers, never
//! on a blocking sleep.
//! **Exceptions**: `tokio::time::sleep` on retry and backoff paths (dial
//! retries, setup-write backoff, accept error backoff).

use architectural_enforcement::{core_source_dir, scan, strip_comment, Violation};

/// Lines around a sleep searched for retry context
const CONTEXT_BEFORE: usize = 15;
const CONTEXT_AFTER: usize = 5;

#[test]
fn test_no_sleep_in_production_code() {
    let violations = find_sleep_violations();

    if !violations.is_empty() {
        eprintln!("\nSleep calls found in production code:\n");
        for violation in &violations {
            eprintln!("  {violation}");
        }
        eprintln!("\nAcceptable: tokio::time::sleep in retry or backoff loops");
        eprintln!("Forbidden: std::thread::sleep, sleeping to wait for an event\n");

        panic!("Found {} sleep violation(s)", violations.len());
    }
}

fn find_sleep_violations() -> Vec<Violation> {
    scan(&core_source_dir(), |lines, idx| {
        let code = strip_comment(&lines[idx]);
        if code.contains("thread::sleep(") {
            return Some("Blocking sleep");
        }
        if (code.contains("::sleep(") || code.contains(".sleep(")) && !is_retry_context(lines, idx) {
            return Some("Sleep outside retry/backoff");
        }
        None
    })
}

/// Whether nearby lines describe a retry or backoff
fn is_retry_context(lines: &[String], idx: usize) -> bool {
    let start = idx.saturating_sub(CONTEXT_BEFORE);
    let end = (idx + CONTEXT_AFTER).min(lines.len());

    lines[start..end].iter().any(|line| {
        let line = line.to_lowercase();
        line.contains("retry") || line.contains("backoff") || line.contains("reconnect")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(code: &[&str]) -> Vec<String> {
        code.iter().map(|line| line.to_string()).collect()
    }

    #[test]
    fn test_retry_sleep_allowed() {
        let code = lines(&[
            "loop {",
            "    if attempt_failed { continue; }",
            "    tokio::time::sleep(retry_interval).await;",
            "}",
        ]);
        assert!(is_retry_context(&code, 2));
    }

    #[test]
    fn test_polling_sleep_detected() {
        let code = lines(&[
            "loop {",
            "    if ready() { break; }",
            "    tokio::time::sleep(Duration::from_millis(10)).await;",
            "}",
        ]);
        assert!(!is_retry_context(&code, 2));
    }
}
