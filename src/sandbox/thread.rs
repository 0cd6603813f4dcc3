//! In-process strategy: one dedicated worker thread per run.

use super::{
    execute_entry, ResultKind, Sandbox, SandboxOutcome, SandboxRequest, SandboxResult,
    WORKER_STACK_SIZE,
};
use crate::config::types::{GradeError, Result, SandboxConfig};
use crate::loader::IsolatedLoader;
use crate::observability::audit::events;
use crate::observability::metrics::get_metrics;
use crate::runtime::{CancellationToken, RunEnv, RunIo};
use crate::unit::WireValue;
use crossbeam_channel::RecvTimeoutError;
use log::{debug, warn};
use std::time::Instant;

/// Runs entries on a worker thread inside the grading process.
///
/// A worker that ignores cancellation cannot be stopped; after the grace
/// period it is abandoned and keeps running detached.
#[derive(Clone, Debug)]
pub struct InProcessSandbox {
    config: SandboxConfig,
}

impl InProcessSandbox {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }
}

impl Sandbox for InProcessSandbox {
    fn config(&self) -> &SandboxConfig {
        &self.config
    }

    fn run(&self, request: &SandboxRequest) -> Result<SandboxOutcome> {
        let started = Instant::now();
        let timeout = request.timeout.unwrap_or(self.config.timeout);
        let correlation = request.correlation.as_ref();

        let mut loader = IsolatedLoader::from_config(&self.config);
        if let Some(c) = correlation {
            loader = loader.with_correlation(c.clone());
        }
        let context = loader.load(&request.sandboxed, &request.support)?;
        let context_id = context.id();

        let io = RunIo::new(self.config.stdin, self.config.stdout, self.config.stderr);
        let observer = io.clone();
        let token = CancellationToken::new();
        let env = RunEnv::new(io, token.clone(), &self.config);

        let entry = request.entry.clone();
        let args = request.args.iter().cloned().map(WireValue::into_value).collect();
        let result_type = request.result_type.clone();
        let worker_name = format!("gradebox-worker-{}", context_id);

        events::run_start(&entry.to_string(), context_id.to_string(), correlation);
        let metrics = get_metrics();
        metrics.active_runs.inc();

        let (tx, rx) = crossbeam_channel::bounded(1);
        let handle = std::thread::Builder::new()
            .name(worker_name.clone())
            .stack_size(WORKER_STACK_SIZE)
            .spawn(move || {
                let (result, _env) = execute_entry(&context, &entry, args, result_type.as_deref(), env);
                // receiver gone means the supervisor already gave up on us
                let _ = tx.send(result);
            })
            .map_err(|e| {
                metrics.active_runs.dec();
                GradeError::Worker(format!("failed to spawn worker thread: {}", e))
            })?;

        let result = match rx.recv_timeout(timeout) {
            Ok(result) => {
                let _ = handle.join();
                result
            }
            Err(RecvTimeoutError::Timeout) => {
                debug!("{} exceeded {:?}, requesting cancellation", worker_name, timeout);
                token.cancel();
                match rx.recv_timeout(self.config.grace_period) {
                    Ok(_) | Err(RecvTimeoutError::Disconnected) => {
                        let _ = handle.join();
                    }
                    Err(RecvTimeoutError::Timeout) => {
                        warn!(
                            "{} ignored cancellation for {:?}; abandoning it",
                            worker_name, self.config.grace_period
                        );
                        metrics.workers_abandoned.inc();
                        events::worker_abandoned(
                            &worker_name,
                            self.config.grace_period.as_millis(),
                            correlation,
                        );
                    }
                }
                events::run_timeout(&request.entry.to_string(), timeout.as_millis(), correlation);
                SandboxResult::Timeout
            }
            Err(RecvTimeoutError::Disconnected) => {
                metrics.active_runs.dec();
                let reason = match handle.join() {
                    Err(panic) => panic
                        .downcast_ref::<String>()
                        .cloned()
                        .or_else(|| panic.downcast_ref::<&str>().map(|s| s.to_string()))
                        .unwrap_or_else(|| "unknown panic".to_string()),
                    Ok(()) => "worker exited without a result".to_string(),
                };
                return Err(GradeError::Worker(format!("{} panicked: {}", worker_name, reason)));
            }
        };

        let elapsed = started.elapsed();
        metrics.active_runs.dec();
        metrics.record_run(result.kind(), elapsed);
        if result.kind() == ResultKind::IllegalOperation {
            events::illegal_operation(result.violation().message_text(), correlation);
        }
        events::run_end(
            &request.entry.to_string(),
            &result.kind().to_string(),
            elapsed.as_millis(),
            correlation,
        );

        Ok(SandboxOutcome {
            result,
            stdout: observer.stdout.captured(),
            stderr: observer.stderr.captured(),
            elapsed,
        })
    }
}
