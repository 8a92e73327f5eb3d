//! Test and lint execution.
//!
//! The orchestrator only needs pass/fail plus raw output; pass/fail counts
//! are scraped from common runner summaries when present.

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::errors::Result;
use crate::util::{shell_quote, tail_chars};

// "5 passed", "test result: ok. 12 passed; 0 failed", "Tests: 1 failed, 4 passed"
static PASSED_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d+) passed").unwrap());
static FAILED_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d+) failed").unwrap());

const OUTPUT_TAIL: usize = 8000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckKind {
    Lint,
    Test,
}

impl std::fmt::Display for CheckKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CheckKind::Lint => write!(f, "lint"),
            CheckKind::Test => write!(f, "test"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckOutcome {
    pub kind: CheckKind,
    pub command: String,
    pub passed: bool,
    #[serde(default)]
    pub exit_code: Option<i32>,
    pub output: String,
    #[serde(default)]
    pub passed_count: Option<u32>,
    #[serde(default)]
    pub failed_count: Option<u32>,
    #[serde(default)]
    pub duration_ms: u64,
}

impl CheckOutcome {
    /// Build an outcome, scraping counts from the output.
    pub fn new(kind: CheckKind, command: &str, passed: bool, exit_code: Option<i32>, output: String) -> Self {
        let (passed_count, failed_count) = parse_counts(&output);
        Self {
            kind,
            command: command.to_string(),
            passed,
            exit_code,
            output: tail_chars(&output, OUTPUT_TAIL),
            passed_count,
            failed_count,
            duration_ms: 0,
        }
    }
}

/// Sum every "N passed" / "N failed" occurrence; `None` when absent.
pub fn parse_counts(output: &str) -> (Option<u32>, Option<u32>) {
    let sum = |re: &Regex| -> Option<u32> {
        let mut found = false;
        let mut total = 0u32;
        for cap in re.captures_iter(output) {
            if let Ok(n) = cap[1].parse::<u32>() {
                found = true;
                total = total.saturating_add(n);
            }
        }
        found.then_some(total)
    };
    (sum(&PASSED_REGEX), sum(&FAILED_REGEX))
}

/// Runs a lint or test command inside a working tree.
#[async_trait]
pub trait CheckRunner: Send + Sync {
    async fn run(
        &self,
        working_dir: &Path,
        command: &str,
        kind: CheckKind,
        target: Option<&str>,
    ) -> Result<CheckOutcome>;
}

/// Runs commands through `sh -c` with a timeout.
pub struct ShellCheckRunner {
    timeout: Duration,
}

impl ShellCheckRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl CheckRunner for ShellCheckRunner {
    async fn run(
        &self,
        working_dir: &Path,
        command: &str,
        kind: CheckKind,
        target: Option<&str>,
    ) -> Result<CheckOutcome> {
        let full = match target {
            Some(target) if !target.trim().is_empty() => format!("{command} {}", shell_quote(target.trim())),
            _ => command.to_string(),
        };
        info!(%kind, command = %full, dir = %working_dir.display(), "running check");
        let start = Instant::now();

        let child = Command::new("sh")
            .arg("-c")
            .arg(&full)
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        let child = match child {
            Ok(child) => child,
            Err(e) => {
                return Ok(CheckOutcome::new(kind, &full, false, None, format!("failed to spawn: {e}")));
            }
        };

        let mut outcome = match timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
                let stderr = String::from_utf8_lossy(&output.stderr);
                if !stderr.trim().is_empty() {
                    text.push_str("\n--- stderr ---\n");
                    text.push_str(&stderr);
                }
                CheckOutcome::new(kind, &full, output.status.success(), output.status.code(), text)
            }
            Ok(Err(e)) => CheckOutcome::new(kind, &full, false, None, format!("failed to wait: {e}")),
            Err(_) => {
                warn!(%kind, command = %full, "check timed out");
                CheckOutcome::new(
                    kind,
                    &full,
                    false,
                    None,
                    format!("timed out after {}s", self.timeout.as_secs()),
                )
            }
        };
        outcome.duration_ms = start.elapsed().as_millis() as u64;
        debug!(%kind, passed = outcome.passed, duration_ms = outcome.duration_ms, "check finished");
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_counts_cargo() {
        let out = "test result: ok. 12 passed; 0 failed; 0 ignored\n\
                   test result: FAILED. 3 passed; 2 failed; 0 ignored";
        assert_eq!(parse_counts(out), (Some(15), Some(2)));
    }

    #[test]
    fn test_parse_counts_pytest_and_none() {
        assert_eq!(parse_counts("==== 4 passed, 1 failed in 0.2s ===="), (Some(4), Some(1)));
        assert_eq!(parse_counts("all good"), (None, None));
    }

    #[tokio::test]
    async fn test_shell_runner_pass_and_fail() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ShellCheckRunner::new(Duration::from_secs(10));

        let ok = runner
            .run(dir.path(), "echo '2 passed'", CheckKind::Test, None)
            .await
            .unwrap();
        assert!(ok.passed);
        assert_eq!(ok.passed_count, Some(2));

        let bad = runner
            .run(dir.path(), "echo nope >&2; exit 1", CheckKind::Lint, None)
            .await
            .unwrap();
        assert!(!bad.passed);
        assert_eq!(bad.exit_code, Some(1));
        assert!(bad.output.contains("nope"));
    }

    #[tokio::test]
    async fn test_shell_runner_appends_target() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ShellCheckRunner::new(Duration::from_secs(10));
        let outcome = runner
            .run(dir.path(), "echo", CheckKind::Test, Some("tests/api.rs"))
            .await
            .unwrap();
        assert_eq!(outcome.command, "echo tests/api.rs");
        assert!(outcome.output.contains("tests/api.rs"));
    }

    #[tokio::test]
    async fn test_shell_runner_quotes_target() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ShellCheckRunner::new(Duration::from_secs(10));
        let outcome = runner
            .run(dir.path(), "echo", CheckKind::Test, Some("x; touch pwned $(touch also)"))
            .await
            .unwrap();
        assert!(outcome.passed);
        assert!(outcome.output.contains("x; touch pwned $(touch also)"));
        assert!(!dir.path().join("pwned").exists());
        assert!(!dir.path().join("also").exists());
    }

    #[tokio::test]
    async fn test_shell_runner_timeout_is_a_failure() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ShellCheckRunner::new(Duration::from_secs(1));
        let outcome = runner.run(dir.path(), "sleep 5", CheckKind::Test, None).await.unwrap();
        assert!(!outcome.passed);
        assert!(outcome.output.contains("timed out"));
    }
}
