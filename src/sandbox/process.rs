//! Out-of-process strategy: one worker process per run.

use super::worker::{WorkerReply, WorkerRequest, WORKER_ROLE};
use super::{ResultKind, Sandbox, SandboxOutcome, SandboxRequest, SandboxResult};
use crate::config::types::{GradeError, Result, SandboxConfig};
use crate::observability::audit::events;
use crate::observability::metrics::get_metrics;
use crate::runtime::RunIo;
use log::{debug, warn};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::io::{Read, Write};
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Runs entries in a re-executed `gradebox --internal-role sandbox-worker`.
///
/// A worker that outlives its budget gets SIGTERM, then SIGKILL after the
/// grace period. A worker killed by SIGKILL that the supervisor did not
/// send is reported as [`SandboxResult::OutOfMemory`].
#[derive(Clone, Debug)]
pub struct OutOfProcessSandbox {
    config: SandboxConfig,
    worker_exe: PathBuf,
}

impl OutOfProcessSandbox {
    /// Sandbox re-executing the current binary
    pub fn new(config: SandboxConfig) -> Result<Self> {
        let worker_exe = std::env::current_exe()?;
        Ok(Self { config, worker_exe })
    }

    pub fn with_worker_exe(mut self, worker_exe: PathBuf) -> Self {
        self.worker_exe = worker_exe;
        self
    }

    fn spawn_worker(&self) -> Result<Child> {
        Command::new(&self.worker_exe)
            .arg("--internal-role")
            .arg(WORKER_ROLE)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| {
                GradeError::Worker(format!(
                    "spawn {} failed: {}",
                    self.worker_exe.display(),
                    e
                ))
            })
    }

    /// Poll until exit or budget expiry; returns the status and whether the
    /// supervisor had to terminate the worker
    fn supervise(&self, child: &mut Child, timeout: Duration) -> Result<(ExitStatus, bool)> {
        let started = Instant::now();
        let pid = child.id();
        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Ok((status, false)),
                Ok(None) if started.elapsed() > timeout => break,
                Ok(None) => std::thread::sleep(POLL_INTERVAL),
                Err(e) => return Err(GradeError::Worker(format!("wait(worker {}): {}", pid, e))),
            }
        }

        debug!("worker {} exceeded {:?}, sending SIGTERM", pid, timeout);
        if let Err(e) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            warn!("SIGTERM to worker {} failed: {}", pid, e);
        }
        let grace_started = Instant::now();
        while grace_started.elapsed() < self.config.grace_period {
            if let Ok(Some(status)) = child.try_wait() {
                return Ok((status, true));
            }
            std::thread::sleep(POLL_INTERVAL);
        }

        let _ = child.kill();
        let status = child
            .wait()
            .map_err(|e| GradeError::Worker(format!("reap worker {}: {}", pid, e)))?;
        get_metrics().workers_killed.inc();
        Ok((status, true))
    }
}

impl Sandbox for OutOfProcessSandbox {
    fn config(&self) -> &SandboxConfig {
        &self.config
    }

    fn run(&self, request: &SandboxRequest) -> Result<SandboxOutcome> {
        let started = Instant::now();
        let timeout = request.timeout.unwrap_or(self.config.timeout);
        let correlation = request.correlation.as_ref();
        let entry = request.entry.to_string();

        let payload = serde_json::to_string(&WorkerRequest::new(request.clone(), &self.config))?;
        let mut child = self.spawn_worker()?;
        let pid = child.id();
        events::run_start(&entry, format!("pid:{}", pid), correlation);
        let metrics = get_metrics();
        metrics.active_runs.inc();

        if let Some(mut stdin) = child.stdin.take() {
            // a worker that already died surfaces through its exit status
            let _ = stdin.write_all(payload.as_bytes()).and_then(|_| stdin.write_all(b"\n"));
        }

        let (tx, rx) = crossbeam_channel::bounded(1);
        if let Some(mut stdout) = child.stdout.take() {
            std::thread::spawn(move || {
                let mut reply = String::new();
                let _ = stdout.read_to_string(&mut reply);
                let _ = tx.send(reply);
            });
        }

        let supervised = self.supervise(&mut child, timeout);
        metrics.active_runs.dec();
        let (status, terminated) = supervised?;
        let reply = rx.recv_timeout(self.config.grace_period).unwrap_or_default();

        let io = RunIo::new(self.config.stdin, self.config.stdout, self.config.stderr);
        let result = if terminated {
            events::worker_killed(pid, "SIGTERM/SIGKILL", correlation);
            events::run_timeout(&entry, timeout.as_millis(), correlation);
            SandboxResult::Timeout
        } else if status.signal() == Some(Signal::SIGKILL as i32) {
            SandboxResult::OutOfMemory
        } else {
            match serde_json::from_str::<WorkerReply>(reply.trim()) {
                Ok(WorkerReply::Completed { result, stdout, stderr }) => {
                    io.stdout.write(&stdout);
                    io.stderr.write(&stderr);
                    result.into_result()
                }
                Ok(WorkerReply::LoaderDefect { unit, routine, reason }) => {
                    return Err(GradeError::LoaderDefect { unit, routine, reason })
                }
                Ok(WorkerReply::Error { message }) => {
                    return Err(GradeError::Worker(format!("worker {}: {}", pid, message)))
                }
                Err(e) => {
                    return Err(GradeError::Worker(format!(
                        "worker {} exited with {} without a valid reply: {}",
                        pid, status, e
                    )))
                }
            }
        };

        let elapsed = started.elapsed();
        metrics.record_run(result.kind(), elapsed);
        match result.kind() {
            ResultKind::IllegalOperation => {
                events::illegal_operation(result.violation().message_text(), correlation)
            }
            ResultKind::OutOfMemory => events::heap_exhausted(&entry, correlation),
            _ => {}
        }
        events::run_end(&entry, &result.kind().to_string(), elapsed.as_millis(), correlation);

        Ok(SandboxOutcome {
            result,
            stdout: io.stdout.captured(),
            stderr: io.stderr.captured(),
            elapsed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_worker_binary_is_a_worker_error() {
        let sandbox = OutOfProcessSandbox::new(SandboxConfig::default())
            .unwrap()
            .with_worker_exe(PathBuf::from("/nonexistent/gradebox-worker"));
        let request = SandboxRequest::new(
            std::sync::Arc::new(Vec::new()),
            Vec::new(),
            crate::unit::CallSite::new("Main", "main", &[]),
            Vec::new(),
        );
        let err = sandbox.run(&request).unwrap_err();
        assert!(matches!(err, GradeError::Worker(_)));
    }
}
