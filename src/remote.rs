// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Remote command execution. Production runs shell out to the `ssh` binary;
//! tests substitute an in-process executor (see test_env.rs).

use std::{fmt, future::Future, time::Duration};

use async_trait::async_trait;
use log::{debug, warn};
use tokio::process::Command;

#[derive(Debug)]
pub enum ExecError {
    /// The local process could not be spawned at all.
    Spawn { cmd: String, err: std::io::Error },
    /// The remote command exited nonzero.
    Failed {
        cmd: String,
        status: Option<i32>,
        stderr: String,
    },
    /// The command succeeded but its output was not what we expect.
    Parse { cmd: String, what: String },
}

impl ExecError {
    pub fn parse(cmd: &str, what: impl Into<String>) -> Self {
        ExecError::Parse {
            cmd: cmd.to_string(),
            what: what.into(),
        }
    }
}

impl fmt::Display for ExecError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ExecError::Spawn { cmd, err } => write!(f, "could not spawn '{cmd}': {err}"),
            ExecError::Failed {
                cmd,
                status,
                stderr,
            } => {
                let status = match status {
                    Some(code) => code.to_string(),
                    None => "signal".to_string(),
                };
                write!(f, "'{cmd}' exited {status}: {}", stderr.trim_end())
            }
            ExecError::Parse { cmd, what } => write!(f, "bad output from '{cmd}': {what}"),
        }
    }
}

impl std::error::Error for ExecError {}

/// Raw outcome of a remote command, status included. Most callers want
/// `Executor::run` instead, which turns nonzero exit into an error.
#[derive(Debug, Clone, Default)]
pub struct RawOutput {
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone, Default)]
pub struct CmdOutput {
    pub stdout: String,
    pub stderr: String,
}

#[async_trait]
pub trait Executor: Send + Sync + fmt::Debug {
    /// Run `cmd` on the node with the given hostname and capture its output.
    /// A nonzero exit is not an error at this level.
    async fn exec(&self, hostname: &str, cmd: &str) -> Result<RawOutput, ExecError>;

    /// Run `cmd`, treating nonzero exit as a failure.
    async fn run(&self, hostname: &str, cmd: &str) -> Result<CmdOutput, ExecError> {
        let raw = self.exec(hostname, cmd).await?;
        if raw.status != Some(0) {
            return Err(ExecError::Failed {
                cmd: format!("{hostname}: {cmd}"),
                status: raw.status,
                stderr: raw.stderr,
            });
        }
        Ok(CmdOutput {
            stdout: raw.stdout,
            stderr: raw.stderr,
        })
    }
}

/// Executor that reaches nodes by spawning `ssh <user>@<hostname> <cmd>`.
#[derive(Debug, Clone)]
pub struct SshExecutor {
    user: String,
}

impl SshExecutor {
    pub fn new(user: &str) -> Self {
        SshExecutor {
            user: user.to_string(),
        }
    }
}

#[async_trait]
impl Executor for SshExecutor {
    async fn exec(&self, hostname: &str, cmd: &str) -> Result<RawOutput, ExecError> {
        debug!("{hostname}: {cmd}");
        let output = Command::new("ssh")
            .args(["-o", "BatchMode=yes", "-o", "StrictHostKeyChecking=no"])
            .arg(format!("{}@{}", self.user, hostname))
            .arg(cmd)
            .output()
            .await
            .map_err(|err| ExecError::Spawn {
                cmd: format!("ssh {hostname}"),
                err,
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        if !stderr.is_empty() {
            debug!("{hostname}: stderr: {}", stderr.trim_end());
        }
        Ok(RawOutput {
            status: output.status.code(),
            stdout,
            stderr,
        })
    }
}

/// Deserialize a command's JSON stdout, tagging parse failures with the
/// command that produced them.
pub fn parse_json<T: serde::de::DeserializeOwned>(cmd: &str, raw: &str) -> Result<T, ExecError> {
    serde_json::from_str(raw).map_err(|e| ExecError::parse(cmd, e.to_string()))
}

/// Fixed-delay retry budget for transient remote failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, delay: Duration) -> Self {
        RetryPolicy {
            attempts: attempts.max(1),
            delay,
        }
    }

    /// Single attempt, no waiting.
    pub fn once() -> Self {
        RetryPolicy::new(1, Duration::ZERO)
    }
}

/// Run `op` until it succeeds or the budget is spent, sleeping the fixed
/// delay between attempts. Callers pass operations whose failures are all
/// transient; anything that must not be retried is returned by other means.
pub async fn retry<T, E, F, Fut>(policy: RetryPolicy, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if attempt < policy.attempts => {
                warn!("attempt {attempt}/{}: {e}", policy.attempts);
                attempt += 1;
                tokio::time::sleep(policy.delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use tokio::runtime::Runtime;

    #[test]
    fn retry_stops_at_budget() {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let calls = AtomicU32::new(0);
            let res: Result<(), ExecError> =
                retry(RetryPolicy::new(3, Duration::ZERO), || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(ExecError::parse("x", "always fails"))
                })
                .await;
            assert!(res.is_err());
            assert_eq!(calls.load(Ordering::SeqCst), 3);
        });
    }

    #[test]
    fn retry_returns_first_success() {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let calls = AtomicU32::new(0);
            let res: Result<u32, ExecError> =
                retry(RetryPolicy::new(5, Duration::ZERO), || async {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        Err(ExecError::parse("x", "not yet"))
                    } else {
                        Ok(n)
                    }
                })
                .await;
            assert_eq!(res.unwrap(), 2);
            assert_eq!(calls.load(Ordering::SeqCst), 3);
        });
    }
}
