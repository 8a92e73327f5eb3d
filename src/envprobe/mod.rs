//! Read-only observation of a registered environment over ssh.
//!
//! Every command passes the allow-list first: the program must be listed for
//! the environment and the command line may not contain shell
//! metacharacters. Programs with mutating modes (`systemctl`, `journalctl`,
//! `find`) are further limited to their read-only forms, and following a
//! log is refused. A denied command is reported, never rewritten.

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::errors::{Result, ShipyardError};
use crate::registry::EnvironmentConfig;
use crate::util::tail_chars;

const FORBIDDEN_CHARS: &[char] = &[';', '|', '&', '$', '`', '<', '>', '(', ')', '\n', '\r', '\\'];

const LOG_TAIL_LINES: u32 = 200;

const SYSTEMCTL_READ_ONLY: &[&str] = &[
    "status",
    "show",
    "cat",
    "is-active",
    "is-enabled",
    "is-failed",
    "list-units",
    "list-unit-files",
    "list-timers",
    "list-sockets",
];

const JOURNALCTL_MUTATING: &[&str] = &[
    "--vacuum-size",
    "--vacuum-time",
    "--vacuum-files",
    "--rotate",
    "--flush",
    "--sync",
    "--relinquish-var",
    "--smart-relinquish-var",
    "--setup-keys",
    "--update-catalog",
];

const FIND_MUTATING: &[&str] = &["-delete", "-exec", "-execdir", "-ok", "-okdir", "-fprint", "-fprint0", "-fprintf", "-fls"];

/// Flags that never return, which would hold the probe until its timeout.
const FOLLOW_FLAGS: &[&str] = &["-f", "-F", "--follow"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub command: String,
    pub success: bool,
    #[serde(default)]
    pub exit_code: Option<i32>,
    pub output: String,
}

/// Error-pattern matches found in a set of observations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorScan {
    pub total_matches: usize,
    pub failed_commands: Vec<String>,
    /// First few matching lines, for the report.
    pub samples: Vec<String>,
}

impl ErrorScan {
    pub fn is_clean(&self) -> bool {
        self.total_matches == 0 && self.failed_commands.is_empty()
    }
}

/// Reject commands outside the environment's allow-list.
pub fn check_allowed(env: &EnvironmentConfig, command: &str) -> Result<()> {
    let deny = |reason: String| ShipyardError::CommandDenied {
        environment: env.name.clone(),
        command: command.to_string(),
        reason,
    };
    if let Some(c) = command.chars().find(|c| FORBIDDEN_CHARS.contains(c)) {
        return Err(deny(format!("shell metacharacter '{}' is not allowed", c.escape_default())));
    }
    let program = command
        .split_whitespace()
        .next()
        .ok_or_else(|| deny("empty command".to_string()))?;
    let base = program.rsplit('/').next().unwrap_or(program);
    if !env
        .allowed_commands
        .iter()
        .any(|allowed| allowed == program || allowed == base)
    {
        return Err(deny(format!("'{base}' is not in the allow-list")));
    }
    let args: Vec<&str> = command.split_whitespace().skip(1).collect();
    match read_only_violation(base, &args) {
        Some(reason) => Err(deny(reason)),
        None => Ok(()),
    }
}

/// `--follow`, or a short-flag cluster such as `-fn` that includes it.
fn is_follow(flag: &str) -> bool {
    FOLLOW_FLAGS.contains(&flag)
        || (flag.starts_with('-') && !flag.starts_with("--") && flag.contains(['f', 'F']))
}

/// Why `program args` could change the environment or never finish, if it could.
fn read_only_violation(program: &str, args: &[&str]) -> Option<String> {
    // `--flag=value` is judged by its flag.
    let flag = |arg: &&str| arg.split('=').next().unwrap_or_default().to_string();
    match program {
        "systemctl" => {
            let verb = args.iter().find(|a| !a.starts_with('-'))?;
            (!SYSTEMCTL_READ_ONLY.contains(verb))
                .then(|| format!("'systemctl {verb}' is not a read-only systemctl command"))
        }
        "journalctl" => args
            .iter()
            .map(flag)
            .find(|f| JOURNALCTL_MUTATING.contains(&f.as_str()) || is_follow(f))
            .map(|f| format!("journalctl {f} is not allowed in a probe")),
        "tail" => args
            .iter()
            .map(flag)
            .find(|f| is_follow(f))
            .map(|f| format!("tail {f} never finishes")),
        "find" => args
            .iter()
            .find(|a| FIND_MUTATING.contains(*a))
            .map(|a| format!("find {a} is not allowed in a probe")),
        _ => None,
    }
}

/// The probe commands plus one tail per configured log path.
pub fn planned_commands(env: &EnvironmentConfig) -> Vec<String> {
    let mut commands = env.probe_commands.clone();
    commands.extend(
        env.log_paths
            .iter()
            .map(|path| format!("tail -n {LOG_TAIL_LINES} {path}")),
    );
    commands
}

/// Count error-pattern matches line by line. Invalid patterns are input errors.
pub fn scan_errors(env: &EnvironmentConfig, observations: &[Observation]) -> Result<ErrorScan> {
    let patterns = env
        .error_patterns
        .iter()
        .map(|p| {
            Regex::new(p).map_err(|e| {
                ShipyardError::InvalidInput(format!(
                    "environment '{}' has an invalid error pattern '{p}': {e}",
                    env.name
                ))
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let mut scan = ErrorScan::default();
    for observation in observations {
        if !observation.success {
            scan.failed_commands.push(observation.command.clone());
        }
        for line in observation.output.lines() {
            let hits: usize = patterns.iter().map(|re| re.find_iter(line).count()).sum();
            if hits > 0 {
                scan.total_matches += hits;
                if scan.samples.len() < 20 {
                    scan.samples.push(line.trim().to_string());
                }
            }
        }
    }
    Ok(scan)
}

#[async_trait]
pub trait EnvironmentProbe: Send + Sync {
    /// Run one read-only command. Callers check the allow-list first.
    async fn observe(&self, env: &EnvironmentConfig, command: &str) -> Result<Observation>;
}

/// Validate then run every planned command, stopping at the first denial.
pub async fn probe_all(probe: &dyn EnvironmentProbe, env: &EnvironmentConfig) -> Result<Vec<Observation>> {
    let commands = planned_commands(env);
    for command in &commands {
        check_allowed(env, command)?;
    }
    let mut observations = Vec::with_capacity(commands.len());
    for command in &commands {
        observations.push(probe.observe(env, command).await?);
    }
    info!(environment = %env.name, commands = observations.len(), "environment probed");
    Ok(observations)
}

/// Runs commands with `ssh` in batch mode.
pub struct SshProbe {
    timeout: Duration,
}

impl SshProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn ssh_args(env: &EnvironmentConfig, command: &str) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "ConnectTimeout=10".to_string(),
        ];
        if let Some(port) = env.port {
            args.push("-p".to_string());
            args.push(port.to_string());
        }
        args.push(env.host.clone());
        args.push("--".to_string());
        args.push(command.to_string());
        args
    }
}

impl Default for SshProbe {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

#[async_trait]
impl EnvironmentProbe for SshProbe {
    async fn observe(&self, env: &EnvironmentConfig, command: &str) -> Result<Observation> {
        check_allowed(env, command)?;
        debug!(environment = %env.name, %command, "ssh observe");

        let child = Command::new("ssh")
            .args(Self::ssh_args(env, command))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| anyhow::anyhow!("Failed to spawn ssh: {e}"))?;

        let observation = match timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
                let stderr = String::from_utf8_lossy(&output.stderr);
                if !stderr.trim().is_empty() {
                    text.push_str(&stderr);
                }
                Observation {
                    command: command.to_string(),
                    success: output.status.success(),
                    exit_code: output.status.code(),
                    output: tail_chars(&text, 16_000),
                }
            }
            Ok(Err(e)) => return Err(anyhow::anyhow!("Failed to wait for ssh: {e}").into()),
            Err(_) => Observation {
                command: command.to_string(),
                success: false,
                exit_code: None,
                output: format!("timed out after {}s", self.timeout.as_secs()),
            },
        };
        Ok(observation)
    }
}
