//! Thin wrapper around the `docker` CLI.
//!
//! Every invocation is bounded by a timeout; a non-zero exit is turned
//! into a [`DockerError::Failed`] carrying the command's stderr.

use std::ffi::OsStr;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, trace};

/// Errors from running the docker CLI.
#[derive(Debug, Error)]
pub enum DockerError {
    #[error("failed to run {binary}: {reason}")]
    Spawn { binary: String, reason: String },

    #[error("`docker {command}` exited with {status}: {stderr}")]
    Failed {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("`docker {command}` timed out after {after:?}")]
    Timeout { command: String, after: Duration },
}

impl DockerError {
    /// Whether the failure says the object does not exist.
    pub fn is_not_found(&self) -> bool {
        match self {
            DockerError::Failed { stderr, .. } => {
                let stderr = stderr.to_ascii_lowercase();
                stderr.contains("no such") || stderr.contains("not found")
            }
            _ => false,
        }
    }
}

/// Handle for invoking the docker CLI.
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: PathBuf,
    timeout: Duration,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl DockerCli {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            timeout: Duration::from_secs(60),
        }
    }

    /// Bound every docker invocation by `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run `docker <args>` and return trimmed stdout.
    pub async fn run<I, S>(&self, args: I) -> Result<String, DockerError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let args: Vec<_> = args.into_iter().map(|a| a.as_ref().to_os_string()).collect();
        let command = args
            .iter()
            .map(|a| a.to_string_lossy())
            .collect::<Vec<_>>()
            .join(" ");

        trace!(%command, "docker invocation");

        let child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| DockerError::Spawn {
                binary: self.binary.display().to_string(),
                reason: e.to_string(),
            })?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(DockerError::Spawn {
                    binary: self.binary.display().to_string(),
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                return Err(DockerError::Timeout {
                    command,
                    after: self.timeout,
                });
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            debug!(%command, status = %output.status, %stderr, "docker command failed");
            return Err(DockerError::Failed {
                command,
                status: output.status.to_string(),
                stderr,
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let cli = DockerCli::new("/nonexistent/docker-binary");
        let err = cli.run(["version"]).await.unwrap_err();
        assert!(matches!(err, DockerError::Spawn { .. }));
    }

    #[test]
    fn not_found_detection() {
        let err = DockerError::Failed {
            command: "network rm x".to_string(),
            status: "exit status: 1".to_string(),
            stderr: "Error: No such network: x".to_string(),
        };
        assert!(err.is_not_found());

        let err = DockerError::Timeout {
            command: "ps".to_string(),
            after: Duration::from_secs(1),
        };
        assert!(!err.is_not_found());
    }
}
