// External command runner
//
// Used for local web-server introspection (`apachectl -M`). Output is captured and
// returned even on non-zero exit; the caller decides what success means.

use anyhow::{Context, Result};
use log::{debug, warn};
use std::process::Stdio;
use std::time::Instant;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::time::{timeout, Duration};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u128,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

fn is_transient_exec_error(e: &anyhow::Error) -> bool {
    let msg = e.to_string().to_ascii_lowercase();
    msg.contains("timed out")
        || msg.contains("temporarily")
        || msg.contains("busy")
        || msg.contains("resource")
}

async fn run_once(program: &str, args: &[String], timeout_dur: Duration) -> Result<CommandOutput> {
    let started = Instant::now();

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("Failed to spawn command '{}'", program))?;

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow::anyhow!("Failed to capture stdout of '{}'", program))?;
    let mut stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow::anyhow!("Failed to capture stderr of '{}'", program))?;

    let stdout_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        stdout.read_to_end(&mut buf).await?;
        Ok::<String, std::io::Error>(String::from_utf8_lossy(&buf).to_string())
    });
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        stderr.read_to_end(&mut buf).await?;
        Ok::<String, std::io::Error>(String::from_utf8_lossy(&buf).to_string())
    });

    let status = match timeout(timeout_dur, child.wait()).await {
        Ok(status) => status.with_context(|| format!("Command wait failed ({})", program))?,
        Err(_) => {
            if let Err(e) = child.kill().await {
                warn!(
                    "[PHASE: command] [STEP: run] Failed to kill timed-out process (program={}): {}",
                    program, e
                );
            }
            anyhow::bail!(
                "Command timed out after {}ms (program={})",
                timeout_dur.as_millis(),
                program
            );
        }
    };

    let out = CommandOutput {
        exit_code: status.code(),
        stdout: stdout_task
            .await
            .context("stdout join failed")?
            .context("stdout read failed")?,
        stderr: stderr_task
            .await
            .context("stderr join failed")?
            .context("stderr read failed")?,
        duration_ms: started.elapsed().as_millis(),
    };

    debug!(
        "[PHASE: command] [STEP: run] Command finished (program={}, exit_code={:?}, duration_ms={}, stdout_len={})",
        program,
        out.exit_code,
        out.duration_ms,
        out.stdout.len()
    );
    Ok(out)
}

/// Run `program` with a timeout, retrying up to twice on transient failures.
pub async fn run_cmd_with_timeout(
    program: &str,
    args: &[String],
    timeout_dur: Duration,
) -> Result<CommandOutput> {
    let strategy = ExponentialBackoff::from_millis(200)
        .factor(2)
        .max_delay(Duration::from_secs(2))
        .take(2)
        .map(jitter);

    RetryIf::spawn(
        strategy,
        || run_once(program, args, timeout_dur),
        |e: &anyhow::Error| {
            let transient = is_transient_exec_error(e);
            if transient {
                warn!(
                    "[PHASE: command] [STEP: retry] Transient failure; retrying (program={}, err={})",
                    program, e
                );
            }
            transient
        },
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_are_detected() {
        assert!(is_transient_exec_error(&anyhow::anyhow!("Command timed out after 10ms")));
        assert!(!is_transient_exec_error(&anyhow::anyhow!("No such file or directory")));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let out = run_cmd_with_timeout("sh", &["-c".into(), "echo hello; exit 3".into()], Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out.exit_code, Some(3));
        assert!(!out.success());
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn missing_program_is_an_error() {
        let err = run_cmd_with_timeout("definitely-not-a-real-binary-xyz", &[], Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Failed to spawn"), "{}", err);
    }
}
