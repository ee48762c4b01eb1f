//! Runner that hands each action to an external command
//!
//! The command runs through `sh -c`, gets the action body on stdin and the
//! step identity in `TIDELINE_OPERATION`, `TIDELINE_VERSION` and
//! `TIDELINE_NAME`. A non-zero exit status fails the step, as does exiting
//! before the body could be delivered.

use std::io::{Read, Write};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};
use tideline::migration::{Operation, RunOutcome, RunRequest, Runner, RunnerError};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone)]
pub struct CommandRunner {
    command: String,
    timeout: Option<Duration>,
}

impl CommandRunner {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            timeout: None,
        }
    }

    /// Kill the command and fail the step after `timeout`
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Wait for the child, enforcing the timeout from `start`
    fn wait(
        &self,
        mut child: Child,
        start: Instant,
    ) -> Result<(std::process::ExitStatus, String), RunnerError> {
        // Drain stderr concurrently so a chatty command cannot fill the pipe
        let stderr = child.stderr.take().map(|mut pipe| {
            std::thread::spawn(move || {
                let mut out = String::new();
                let _ = pipe.read_to_string(&mut out);
                out
            })
        });
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    let stderr = stderr
                        .and_then(|reader| reader.join().ok())
                        .unwrap_or_default();
                    return Ok((status, stderr));
                }
                Ok(None) => {}
                Err(e) => return Err(RunnerError::Failed(format!("waiting for runner: {e}"))),
            }
            if let Some(timeout) = self.timeout {
                if start.elapsed() >= timeout {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(RunnerError::TimedOut(timeout));
                }
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }
}

impl Runner for CommandRunner {
    fn run(&self, request: &RunRequest<'_>) -> Result<RunOutcome, RunnerError> {
        // The covered migrations already ran; only the record changes
        if request.operation == Operation::Squash {
            return Ok(RunOutcome {
                detail: Some("squash is recorded only".to_string()),
            });
        }

        log::debug!("Running '{}' for {} {}", self.command, request.operation, request.version);
        let start = Instant::now();
        let mut command = Command::new("sh");
        command.arg("-c").arg(&self.command);
        // Keep terminal interrupts away from the step; the engine stops between steps
        #[cfg(unix)]
        std::os::unix::process::CommandExt::process_group(&mut command, 0);
        let mut child = command
            .env("TIDELINE_OPERATION", request.operation.as_str())
            .env("TIDELINE_VERSION", request.version.as_str())
            .env("TIDELINE_NAME", request.name)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| RunnerError::Failed(format!("failed to start '{}': {e}", self.command)))?;

        // Feed stdin off-thread so a command that never reads it still times out
        let writer = child.stdin.take().map(|mut stdin| {
            let body = request.action.body.clone().into_bytes();
            std::thread::spawn(move || stdin.write_all(&body))
        });

        let (status, stderr) = self.wait(child, start)?;
        let delivered = match writer.map(std::thread::JoinHandle::join) {
            None | Some(Ok(Ok(()))) => Ok(()),
            Some(Ok(Err(e))) => Err(e.to_string()),
            Some(Err(_)) => Err("stdin writer panicked".to_string()),
        };

        let stderr = stderr.trim();
        if !status.success() {
            return Err(RunnerError::Failed(if stderr.is_empty() {
                format!("runner exited with {status}")
            } else {
                format!("runner exited with {status}: {stderr}")
            }));
        }
        if let Err(e) = delivered {
            return Err(RunnerError::Failed(format!(
                "runner exited before reading the whole action: {e}"
            )));
        }
        Ok(RunOutcome::default())
    }
}

/// Runner used when no command is configured; every step fails
#[derive(Debug, Clone, Copy, Default)]
pub struct UnconfiguredRunner;

impl Runner for UnconfiguredRunner {
    fn run(&self, request: &RunRequest<'_>) -> Result<RunOutcome, RunnerError> {
        if request.operation == Operation::Squash {
            return Ok(RunOutcome::default());
        }
        Err(RunnerError::Failed(
            "no runner command configured; pass --runner or set TIDELINE__MIGRATIONS__RUNNER_COMMAND"
                .to_string(),
        ))
    }
}
