/// Security event logging for gradebox
/// Records capability violations, abandoned workers and run lifecycle as
/// structured JSON lines alongside the regular log output.
///
/// Event schema:
/// - Correlation IDs (request_id, run_id, test, repetition)
/// - Event types: run start/end, gated call sites, violations, timeouts,
///   abandoned workers, loader defects
use crate::config::types::{GradeError, Result};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::SystemTime;
use uuid::Uuid;

/// Security event severity levels
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SecuritySeverity {
    Critical,
    High,
    Medium,
    Low,
}

/// Types of security events we track
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SecurityEventType {
    // Lifecycle events
    RunStart,
    RunEnd,

    // Loader events
    CallSiteGated,
    LoaderDefect,

    // Run outcome events
    IllegalOperation,
    RunTimeout,
    HeapExhausted,

    // Termination events
    WorkerAbandoned,
    WorkerKilled,
}

/// Correlation identifiers for event tracking
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelationIds {
    /// Unique request identifier (one grading request)
    pub request_id: String,
    /// Unique run identifier (one sandboxed execution)
    pub run_id: String,
    /// Display name of the test operation, if any
    pub test: Option<String>,
    /// Repetition number, starting at 1
    pub repetition: Option<u32>,
}

impl CorrelationIds {
    /// Create new correlation IDs for a request
    pub fn new() -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            run_id: Uuid::new_v4().to_string(),
            test: None,
            repetition: None,
        }
    }

    /// Same request, fresh run identifier
    pub fn next_run(&self) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            ..self.clone()
        }
    }

    pub fn with_test(mut self, test: String) -> Self {
        self.test = Some(test);
        self
    }

    pub fn with_repetition(mut self, repetition: u32) -> Self {
        self.repetition = Some(repetition);
        self
    }
}

impl Default for CorrelationIds {
    fn default() -> Self {
        Self::new()
    }
}

impl SecurityEventType {
    /// Get the default severity for this event type
    pub fn default_severity(&self) -> SecuritySeverity {
        match self {
            SecurityEventType::RunStart => SecuritySeverity::Low,
            SecurityEventType::RunEnd => SecuritySeverity::Low,

            SecurityEventType::CallSiteGated => SecuritySeverity::Low,
            SecurityEventType::LoaderDefect => SecuritySeverity::Critical,

            SecurityEventType::IllegalOperation => SecuritySeverity::High,
            SecurityEventType::RunTimeout => SecuritySeverity::Medium,
            SecurityEventType::HeapExhausted => SecuritySeverity::Medium,

            SecurityEventType::WorkerAbandoned => SecuritySeverity::High,
            SecurityEventType::WorkerKilled => SecuritySeverity::Medium,
        }
    }
}

/// Individual security event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub event_type: SecurityEventType,
    pub severity: SecuritySeverity,
    pub timestamp: SystemTime,
    pub details: String,
    pub correlation: Option<CorrelationIds>,
    pub unit: Option<String>,
    pub context_id: Option<String>,
    pub worker_pid: Option<u32>,
}

impl SecurityEvent {
    /// Create a new security event with default severity
    pub fn new(event_type: SecurityEventType, details: String) -> Self {
        let severity = event_type.default_severity();
        Self {
            event_type,
            severity,
            timestamp: SystemTime::now(),
            details,
            correlation: None,
            unit: None,
            context_id: None,
            worker_pid: None,
        }
    }

    /// Builder pattern methods for optional fields
    pub fn with_unit(mut self, unit: String) -> Self {
        self.unit = Some(unit);
        self
    }

    pub fn with_context_id(mut self, context_id: String) -> Self {
        self.context_id = Some(context_id);
        self
    }

    pub fn with_worker_pid(mut self, pid: u32) -> Self {
        self.worker_pid = Some(pid);
        self
    }

    pub fn with_severity(mut self, severity: SecuritySeverity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_correlation(mut self, correlation: CorrelationIds) -> Self {
        self.correlation = Some(correlation);
        self
    }
}

/// Security logger that handles both structured logging and audit trail
pub struct SecurityLogger {
    audit_file: Arc<Mutex<File>>,
    audit_path: PathBuf,
}

impl SecurityLogger {
    /// Create a new security logger
    pub fn new(audit_path: Option<PathBuf>) -> Result<Self> {
        let audit_path = audit_path.unwrap_or_else(|| {
            std::env::temp_dir()
                .join("gradebox")
                .join("security-audit.log")
        });

        if let Some(parent) = audit_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                GradeError::Config(format!("Failed to create security log directory: {}", e))
            })?;
        }

        let audit_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&audit_path)
            .map_err(|e| {
                GradeError::Config(format!("Failed to open security audit log: {}", e))
            })?;

        Ok(Self {
            audit_file: Arc::new(Mutex::new(audit_file)),
            audit_path,
        })
    }

    /// Structured JSON line for an event
    pub fn render(event: &SecurityEvent) -> serde_json::Value {
        let mut log_entry = serde_json::json!({
            "timestamp": event.timestamp
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            "event_type": event.event_type,
            "severity": event.severity,
            "details": event.details,
            "process_id": std::process::id(),
        });

        if let Some(correlation) = &event.correlation {
            log_entry["correlation"] = serde_json::json!({
                "request_id": correlation.request_id,
                "run_id": correlation.run_id,
                "test": correlation.test,
                "repetition": correlation.repetition,
            });
        }
        if let Some(unit) = &event.unit {
            log_entry["unit"] = serde_json::json!(unit);
        }
        if let Some(context_id) = &event.context_id {
            log_entry["context_id"] = serde_json::json!(context_id);
        }
        if let Some(pid) = event.worker_pid {
            log_entry["worker_pid"] = serde_json::json!(pid);
        }
        log_entry
    }

    /// Log a security event
    pub fn log_security_event(&self, event: SecurityEvent) {
        let log_entry = Self::render(&event);
        log_to_standard_logger(&event);

        if let Ok(mut file) = self.audit_file.lock() {
            if let Err(e) = writeln!(file, "{}", log_entry) {
                error!("Failed to write to security audit log: {}", e);
            }
            if let Err(e) = file.flush() {
                error!("Failed to flush security audit log: {}", e);
            }
        } else {
            error!("Failed to acquire lock on security audit file");
        }
    }

    /// Get the audit log file path
    pub fn audit_path(&self) -> &PathBuf {
        &self.audit_path
    }
}

fn log_to_standard_logger(event: &SecurityEvent) {
    match event.severity {
        SecuritySeverity::Critical => {
            error!("SECURITY CRITICAL: {:?} - {}", event.event_type, event.details);
        }
        SecuritySeverity::High => {
            error!("SECURITY HIGH: {:?} - {}", event.event_type, event.details);
        }
        SecuritySeverity::Medium => {
            warn!("SECURITY MEDIUM: {:?} - {}", event.event_type, event.details);
        }
        SecuritySeverity::Low => {
            info!("SECURITY LOW: {:?} - {}", event.event_type, event.details);
        }
    }
}

/// Global security logger instance
static SECURITY_LOGGER: OnceLock<SecurityLogger> = OnceLock::new();

/// Initialize the global security logger
pub fn init_security_logger(audit_path: Option<PathBuf>) -> Result<()> {
    match SecurityLogger::new(audit_path.clone()) {
        Ok(logger) => {
            if SECURITY_LOGGER.set(logger).is_err() {
                error!("Security logger already initialized");
            } else {
                info!("Security logger initialized");
            }
        }
        Err(e) => {
            // If caller did not force a path, attempt user-writable fallback paths.
            if audit_path.is_none() {
                let fallback_paths = vec![
                    std::env::temp_dir().join(format!(
                        "gradebox-security-audit-{}.log",
                        nix::unistd::geteuid()
                    )),
                    std::env::var_os("HOME")
                        .map(PathBuf::from)
                        .unwrap_or_else(std::env::temp_dir)
                        .join(".gradebox")
                        .join("security-audit.log"),
                ];

                for fallback in fallback_paths {
                    match SecurityLogger::new(Some(fallback.clone())) {
                        Ok(logger) => {
                            if SECURITY_LOGGER.set(logger).is_err() {
                                error!("Security logger already initialized");
                            } else {
                                warn!(
                                    "Security logger initialized using fallback path: {}",
                                    fallback.display()
                                );
                            }
                            return Ok(());
                        }
                        Err(fallback_err) => {
                            warn!(
                                "Failed to initialize fallback security logger at {}: {}",
                                fallback.display(),
                                fallback_err
                            );
                        }
                    }
                }

                warn!(
                    "Security logger unavailable (all paths failed). Continuing with log-only security events: {}",
                    e
                );
                return Ok(());
            }

            error!("Failed to initialize security logger: {}", e);
            return Err(e);
        }
    }
    Ok(())
}

/// Log a security event using the global logger
pub fn log_security_event(event: SecurityEvent) {
    if let Some(logger) = SECURITY_LOGGER.get() {
        logger.log_security_event(event);
    } else {
        log_to_standard_logger(&event);
    }
}

/// Convenience functions for common security events
pub mod events {
    use super::*;

    fn with_correlation(event: SecurityEvent, correlation: Option<&CorrelationIds>) -> SecurityEvent {
        match correlation {
            Some(c) => event.with_correlation(c.clone()),
            None => event,
        }
    }

    /// Log the start of a sandboxed run
    pub fn run_start(entry: &str, context_id: String, correlation: Option<&CorrelationIds>) {
        let event = SecurityEvent::new(
            SecurityEventType::RunStart,
            format!("Run started: {}", entry),
        )
        .with_context_id(context_id);
        log_security_event(with_correlation(event, correlation));
    }

    /// Log the classified end of a sandboxed run
    pub fn run_end(entry: &str, outcome: &str, elapsed_ms: u128, correlation: Option<&CorrelationIds>) {
        let event = SecurityEvent::new(
            SecurityEventType::RunEnd,
            format!("Run ended: {} -> {} after {} ms", entry, outcome, elapsed_ms),
        );
        log_security_event(with_correlation(event, correlation));
    }

    /// Log a capability violation raised by sandboxed code
    pub fn illegal_operation(message: &str, correlation: Option<&CorrelationIds>) {
        let event = SecurityEvent::new(
            SecurityEventType::IllegalOperation,
            format!("Capability violation: {}", message),
        );
        log_security_event(with_correlation(event, correlation));
    }

    /// Log a run that exceeded its wall-clock budget
    pub fn run_timeout(entry: &str, timeout_ms: u128, correlation: Option<&CorrelationIds>) {
        let event = SecurityEvent::new(
            SecurityEventType::RunTimeout,
            format!("Run of {} exceeded {} ms", entry, timeout_ms),
        );
        log_security_event(with_correlation(event, correlation));
    }

    /// Log an exhausted allocation budget
    pub fn heap_exhausted(entry: &str, correlation: Option<&CorrelationIds>) {
        let event = SecurityEvent::new(
            SecurityEventType::HeapExhausted,
            format!("Run of {} exhausted its allocation budget", entry),
        );
        log_security_event(with_correlation(event, correlation));
    }

    /// Log a worker thread that ignored cancellation and was left running
    pub fn worker_abandoned(worker: &str, grace_ms: u128, correlation: Option<&CorrelationIds>) {
        let event = SecurityEvent::new(
            SecurityEventType::WorkerAbandoned,
            format!("Worker {} did not stop within {} ms grace; abandoned", worker, grace_ms),
        );
        log_security_event(with_correlation(event, correlation));
    }

    /// Log a worker process terminated by the supervisor
    pub fn worker_killed(pid: u32, signal: &str, correlation: Option<&CorrelationIds>) {
        let event = SecurityEvent::new(
            SecurityEventType::WorkerKilled,
            format!("Worker process {} terminated with {}", pid, signal),
        )
        .with_worker_pid(pid);
        log_security_event(with_correlation(event, correlation));
    }

    /// Log a unit the loader failed to rewrite
    pub fn loader_defect(unit: &str, reason: &str) {
        let event = SecurityEvent::new(
            SecurityEventType::LoaderDefect,
            format!("Loader failed to rewrite {}: {}", unit, reason),
        )
        .with_unit(unit.to_string());
        log_security_event(event);
    }
}
