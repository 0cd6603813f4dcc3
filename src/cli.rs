use crate::config::config::load_harness_config;
use crate::config::policy::{default_whitelist_text, CallPolicy};
use crate::config::types::{HarnessConfig, IsolationStrategy};
use crate::config::validator::validate_config;
use crate::report::grade_submission;
use crate::sandbox::worker::{run_worker_role, WORKER_ROLE};
use crate::unit::compiler::read_units;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Internal role selector (hidden; used by the out-of-process sandbox)
    #[arg(long, hide = true)]
    internal_role: Option<String>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Grade a submission against a test suite and print the report as JSON
    Grade {
        /// Submitted units (JSON)
        #[arg(long)]
        submission: PathBuf,
        /// Test units (JSON)
        #[arg(long)]
        tests: PathBuf,
        /// Grading configuration file (JSON)
        #[arg(long)]
        config: Option<PathBuf>,
        /// Repetitions per test operation
        #[arg(long)]
        repetitions: Option<u32>,
        /// Additional whitelist entries, one signature per line
        #[arg(long)]
        whitelist: Option<PathBuf>,
        /// Run every repetition in a separate worker process
        #[arg(long)]
        out_of_process: bool,
        /// Name recorded in the report (defaults to the submission file stem)
        #[arg(long)]
        name: Option<String>,
        /// Refuse configurations with validation errors
        #[arg(long)]
        strict: bool,
        /// Append security events to this file
        #[arg(long)]
        audit_log: Option<PathBuf>,
        /// Print Prometheus metrics to stderr when done
        #[arg(long)]
        metrics: bool,
    },
    /// Print the default call whitelist, or check a whitelist file
    Whitelist {
        /// Whitelist file to parse; prints the effective whitelist
        #[arg(long)]
        check: Option<PathBuf>,
    },
}

pub fn run() -> Result<()> {
    // Initialize structured logging
    env_logger::init();

    let cli = Cli::parse();
    if let Some(role) = cli.internal_role.as_deref() {
        if role == WORKER_ROLE {
            return run_worker_role().map_err(Into::into);
        }
        return Err(anyhow::anyhow!("unsupported internal role: {}", role));
    }

    let command = cli.command.ok_or_else(|| anyhow::anyhow!("missing command"))?;
    match command {
        Commands::Grade {
            submission,
            tests,
            config,
            repetitions,
            whitelist,
            out_of_process,
            name,
            strict,
            audit_log,
            metrics,
        } => {
            crate::observability::audit::init_security_logger(audit_log)?;

            let mut harness_config = match &config {
                Some(path) => load_harness_config(path)
                    .with_context(|| format!("loading config {}", path.display()))?,
                None => HarnessConfig::default(),
            };
            if let Some(repetitions) = repetitions {
                harness_config.repetitions = repetitions;
            }
            if out_of_process {
                harness_config.sandbox.strategy = IsolationStrategy::OutOfProcess;
            }
            if let Some(path) = &whitelist {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("reading whitelist {}", path.display()))?;
                let mut policy = harness_config
                    .sandbox
                    .policy
                    .as_deref()
                    .cloned()
                    .unwrap_or_else(CallPolicy::default_baseline);
                policy.extend_from_text(&text)?;
                harness_config.sandbox.policy = Some(Arc::new(policy));
            }

            let validation = validate_config(&harness_config, strict)?;
            for warning in &validation.warnings {
                log::warn!("config: {}", warning);
            }
            for error in &validation.errors {
                log::error!("config: {}", error);
            }

            let units = read_units(&submission)
                .with_context(|| format!("reading submission {}", submission.display()))?;
            let test_units =
                read_units(&tests).with_context(|| format!("reading tests {}", tests.display()))?;
            let name = name.unwrap_or_else(|| {
                submission
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "submission".to_string())
            });

            let report = grade_submission(&name, units, test_units, &harness_config)?;
            println!("{}", serde_json::to_string_pretty(&report)?);

            if metrics {
                eprint!(
                    "{}",
                    crate::observability::metrics::get_metrics().export_prometheus()
                );
            }
            if report.load_failure.is_some() {
                std::process::exit(2);
            }
            Ok(())
        }
        Commands::Whitelist { check } => {
            match check {
                Some(path) => {
                    let policy = CallPolicy::from_file(&path)?;
                    print!("{}", policy.serialize());
                }
                None => print!("{}", default_whitelist_text()),
            }
            Ok(())
        }
    }
}
