//! Salesforce CLI subprocess bridge.
//!
//! Every remote call in the pipeline bottoms out here: the authenticated
//! `sf` CLI is invoked as a subprocess with piped stdio and a deadline, and
//! its outcome is classified into the error taxonomy **at this boundary**;
//! callers never string-match stderr themselves.
//!
//! The bridge is stateless; concurrent invocations are safe and each call
//! spawns its own subprocess. It performs no throttling of its own: token
//! acquisition against the rate limiter happens in the callers, before the
//! subprocess is spawned.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::Result;
use serde_json::Value;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::Config;

/// Grace period between SIGTERM and SIGKILL for a timed-out subprocess.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Classified failure of a remote call. The variants mirror the pipeline's
/// retry policy: `Syntactic` and `Consistency` are never retried, the rest
/// are.
#[derive(Debug, Clone, Error)]
pub enum RemoteError {
    /// Transient network/subprocess failure.
    #[error("transport error: {0}")]
    Transport(String),
    /// Remote rate/quota refusal (`REQUEST_LIMIT_EXCEEDED`).
    #[error("quota exceeded: {0}")]
    Quota(String),
    /// Malformed query or argument; retrying cannot help.
    #[error("syntactic error: {0}")]
    Syntactic(String),
    /// Deadline elapsed while waiting on the subprocess or a token.
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    /// Response parsed but did not have the expected shape.
    #[error("malformed response: {0}")]
    Consistency(String),
}

impl RemoteError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RemoteError::Transport(_) | RemoteError::Quota(_) | RemoteError::Timeout(_)
        )
    }

    pub fn is_quota(&self) -> bool {
        matches!(self, RemoteError::Quota(_))
    }

    pub fn is_syntactic(&self) -> bool {
        matches!(self, RemoteError::Syntactic(_))
    }
}

/// Raw result of one CLI invocation. Non-zero exit is data, not an error.
#[derive(Debug, Clone)]
pub struct CliResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CliResult {
    /// Classify this result. `Ok(())` for exit 0; otherwise the marker table:
    /// quota markers → [`RemoteError::Quota`], malformed-query markers →
    /// [`RemoteError::Syntactic`], anything else → [`RemoteError::Transport`].
    pub fn classify(&self) -> std::result::Result<(), RemoteError> {
        if self.exit_code == 0 {
            return Ok(());
        }
        let combined = format!("{}\n{}", self.stdout, self.stderr);
        const QUOTA_MARKERS: &[&str] =
            &["REQUEST_LIMIT_EXCEEDED", "TotalRequests Limit exceeded"];
        const SYNTACTIC_MARKERS: &[&str] = &[
            "MALFORMED_QUERY",
            "INVALID_FIELD",
            "INVALID_TYPE",
            "INVALID_QUERY_FILTER_OPERATOR",
            "unexpected argument",
        ];
        if QUOTA_MARKERS.iter().any(|m| combined.contains(m)) {
            return Err(RemoteError::Quota(truncate(&combined, 400)));
        }
        if SYNTACTIC_MARKERS.iter().any(|m| combined.contains(m)) {
            return Err(RemoteError::Syntactic(truncate(&combined, 400)));
        }
        Err(RemoteError::Transport(truncate(&combined, 400)))
    }
}

fn truncate(s: &str, max: usize) -> String {
    let s = s.trim();
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &s[..end])
    }
}

/// Handle to the resolved Salesforce CLI.
#[derive(Debug, Clone)]
pub struct SfCli {
    bin: PathBuf,
    alias: Option<String>,
    timeout: Duration,
}

impl SfCli {
    /// Resolve the CLI executable: the configured path if set, otherwise a
    /// PATH probe of `sf` then `sfdx` with `--version` (5 s timeout each).
    pub async fn resolve(config: &Config) -> Result<Self> {
        let timeout = Duration::from_secs(config.org.cli_timeout_secs);
        let alias = config.org_alias();

        if let Some(path) = &config.org.sf_path {
            if !path.exists() {
                anyhow::bail!("org.sf_path '{}' does not exist", path.display());
            }
            return Ok(Self {
                bin: path.clone(),
                alias,
                timeout,
            });
        }

        for candidate in ["sf", "sfdx"] {
            let probe = Command::new(candidate)
                .arg("--version")
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .kill_on_drop(true)
                .status();
            match tokio::time::timeout(Duration::from_secs(5), probe).await {
                Ok(Ok(status)) if status.success() => {
                    debug!(bin = candidate, "resolved Salesforce CLI");
                    return Ok(Self {
                        bin: PathBuf::from(candidate),
                        alias,
                        timeout,
                    });
                }
                _ => continue,
            }
        }
        anyhow::bail!(
            "Salesforce CLI not found on PATH. Install via: npm install --global @salesforce/cli"
        )
    }

    /// Construct without probing; used by tests pointing at a stub script.
    pub fn with_binary(bin: PathBuf, alias: Option<String>, timeout: Duration) -> Self {
        Self {
            bin,
            alias,
            timeout,
        }
    }

    /// Run the CLI once. Returns the captured result for any exit code;
    /// `Err` only for spawn failures ([`RemoteError::Transport`]) and
    /// deadline expiry ([`RemoteError::Timeout`]).
    pub async fn run(
        &self,
        args: &[&str],
        stdin_data: Option<&str>,
    ) -> std::result::Result<CliResult, RemoteError> {
        let mut cmd = Command::new(&self.bin);
        cmd.args(args);
        if let Some(alias) = &self.alias {
            cmd.arg("-o").arg(alias);
        }
        cmd.stdin(if stdin_data.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

        debug!(bin = %self.bin.display(), ?args, "spawning CLI");
        let mut child = cmd
            .spawn()
            .map_err(|e| RemoteError::Transport(format!("spawn {}: {}", self.bin.display(), e)))?;

        // Readers drain before stdin is written so a chatty child can never
        // deadlock against a full pipe.
        let stdout = child.stdout.take().expect("stdout piped");
        let stderr = child.stderr.take().expect("stderr piped");
        let stdout_task = tokio::spawn(read_to_string(stdout));
        let stderr_task = tokio::spawn(read_to_string(stderr));

        if let (Some(data), Some(mut stdin)) = (stdin_data, child.stdin.take()) {
            let bytes = data.as_bytes().to_vec();
            // Writing can only fail if the child already exited; the exit
            // status will carry the real story.
            let _ = stdin.write_all(&bytes).await;
            drop(stdin);
        }

        let status = match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => return Err(RemoteError::Transport(format!("wait: {}", e))),
            Err(_) => {
                self.terminate(&mut child).await;
                return Err(RemoteError::Timeout(self.timeout));
            }
        };

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();
        Ok(CliResult {
            exit_code: status.code().unwrap_or(-1),
            stdout,
            stderr,
        })
    }

    /// Run and classify in one step, returning stdout on success.
    pub async fn run_checked(
        &self,
        args: &[&str],
        stdin_data: Option<&str>,
    ) -> std::result::Result<String, RemoteError> {
        let result = self.run(args, stdin_data).await?;
        result.classify()?;
        Ok(result.stdout)
    }

    /// Run a SOQL query via `sf data query --json` and return the `records`
    /// array. A parse failure or missing `result.records` is a
    /// [`RemoteError::Consistency`].
    pub async fn query(
        &self,
        soql: &str,
        tooling: bool,
    ) -> std::result::Result<Vec<Value>, RemoteError> {
        let mut args = vec!["data", "query", "--query", soql, "--json"];
        if tooling {
            args.push("--use-tooling-api");
        }
        let stdout = self.run_checked(&args, None).await?;
        parse_query_records(&stdout)
    }

    /// Run a `SELECT COUNT()` query and return `result.totalSize`.
    pub async fn query_count(&self, soql: &str) -> std::result::Result<u64, RemoteError> {
        let args = vec!["data", "query", "--query", soql, "--json"];
        let stdout = self.run_checked(&args, None).await?;
        parse_query_total_size(&stdout)
    }

    /// SIGTERM, grace period, SIGKILL.
    async fn terminate(&self, child: &mut tokio::process::Child) {
        if let Some(pid) = child.id() {
            warn!(pid, "CLI call exceeded deadline, terminating");
            #[cfg(unix)]
            {
                use nix::sys::signal::{kill, Signal};
                use nix::unistd::Pid;
                let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
            }
            if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_err() {
                let _ = child.kill().await;
            }
        } else {
            let _ = child.kill().await;
        }
    }
}

async fn read_to_string<R: tokio::io::AsyncRead + Unpin>(mut reader: R) -> String {
    use tokio::io::AsyncReadExt;
    let mut buf = Vec::new();
    let _ = reader.read_to_end(&mut buf).await;
    String::from_utf8_lossy(&buf).into_owned()
}

/// Extract `result.records` from `sf data query --json` output.
pub fn parse_query_records(stdout: &str) -> std::result::Result<Vec<Value>, RemoteError> {
    let parsed: Value = serde_json::from_str(stdout)
        .map_err(|e| RemoteError::Consistency(format!("query output is not JSON: {}", e)))?;
    parsed
        .get("result")
        .and_then(|r| r.get("records"))
        .and_then(|r| r.as_array())
        .cloned()
        .ok_or_else(|| RemoteError::Consistency("missing result.records in query output".into()))
}

/// Extract `result.totalSize`, the row count of a `SELECT COUNT()` query.
pub fn parse_query_total_size(stdout: &str) -> std::result::Result<u64, RemoteError> {
    let parsed: Value = serde_json::from_str(stdout)
        .map_err(|e| RemoteError::Consistency(format!("query output is not JSON: {}", e)))?;
    parsed
        .get("result")
        .and_then(|r| r.get("totalSize"))
        .and_then(|v| v.as_u64())
        .ok_or_else(|| RemoteError::Consistency("missing result.totalSize in query output".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(exit_code: i32, stderr: &str) -> CliResult {
        CliResult {
            exit_code,
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }

    #[test]
    fn exit_zero_is_ok() {
        assert!(result(0, "").classify().is_ok());
    }

    #[test]
    fn quota_marker_classifies_as_quota() {
        let err = result(1, "ERROR: REQUEST_LIMIT_EXCEEDED: TotalRequests Limit exceeded.")
            .classify()
            .unwrap_err();
        assert!(err.is_quota());
        assert!(err.is_retryable());
    }

    #[test]
    fn malformed_query_is_syntactic() {
        let err = result(1, "MALFORMED_QUERY: unexpected token").classify().unwrap_err();
        assert!(err.is_syntactic());
        assert!(!err.is_retryable());
    }

    #[test]
    fn unrecognized_failure_is_transport() {
        let err = result(1, "ENOTFOUND login.salesforce.com").classify().unwrap_err();
        assert!(matches!(err, RemoteError::Transport(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn parses_query_records() {
        let stdout = r#"{"status":0,"result":{"records":[{"Name":"Account"}],"totalSize":1,"done":true}}"#;
        let records = parse_query_records(stdout).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["Name"], "Account");
    }

    #[test]
    fn missing_records_is_consistency() {
        let err = parse_query_records(r#"{"status":0,"result":{}}"#).unwrap_err();
        assert!(matches!(err, RemoteError::Consistency(_)));
    }

    #[test]
    fn total_size_for_count_query() {
        let stdout = r#"{"status":0,"result":{"records":[],"totalSize":4211,"done":true}}"#;
        assert_eq!(parse_query_total_size(stdout).unwrap(), 4211);
    }

    #[tokio::test]
    async fn stub_script_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("sf");
        std::fs::write(&script, "#!/bin/sh\necho '{\"status\":0,\"result\":{\"records\":[],\"totalSize\":0,\"done\":true}}'\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        let cli = SfCli::with_binary(script, None, Duration::from_secs(10));
        let records = cli.query("SELECT Id FROM Account", false).await.unwrap();
        assert!(records.is_empty());
    }
}
