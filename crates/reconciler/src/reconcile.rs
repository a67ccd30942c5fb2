use crate::observer::{ProcessMap, ProcessObserver};
use crate::output::append_report;
use fleetstate_core::{
    display_name_from_id, FileObservation, FleetConfig, Mismatch, MismatchDetail,
    ProcessObservation, ReconciliationReport, StateError,
};
use fleetstate_store::{scan_state_dir, Fields, StateWriter};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{info, warn};

pub type FileMap = BTreeMap<String, FileObservation>;

/// Compares state files with the live process table, optionally rewriting
/// the files to match what is actually running.
pub struct Reconciler {
    config: FleetConfig,
    auto_fix: bool,
    observer: ProcessObserver,
}

impl Reconciler {
    pub fn new(config: FleetConfig, auto_fix: bool, observer: ProcessObserver) -> Self {
        Self {
            config,
            auto_fix,
            observer,
        }
    }

    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    /// Observe processes and state files, then reconcile them.
    pub fn reconcile(&self) -> ReconciliationReport {
        let processes = self.observer.observe();
        let files = scan_state_dir(&self.config.state_dir);
        self.reconcile_with(&processes, &files)
    }

    /// Single pass over already-collected observations.
    pub fn reconcile_with(&self, processes: &ProcessMap, files: &FileMap) -> ReconciliationReport {
        let mut report = ReconciliationReport::new(processes.len(), files.len());

        for (bot_id, process) in processes {
            if files.contains_key(bot_id) {
                continue;
            }
            report.push_mismatch(Mismatch {
                bot_id: bot_id.clone(),
                detail: MismatchDetail::RunningButNoStateFile {
                    process: process.clone(),
                },
            });
            if self.auto_fix {
                match self.create_state_file(bot_id, process) {
                    Ok(()) => report.mark_fixed(bot_id),
                    Err(e) => warn!(bot_id = %bot_id, error = %e, "Failed to create state file"),
                }
            }
        }

        for (bot_id, file_state) in files {
            if processes.contains_key(bot_id) || !file_state.status.is_live() {
                continue;
            }
            report.push_mismatch(Mismatch {
                bot_id: bot_id.clone(),
                detail: MismatchDetail::StateSaysRunningButProcessMissing {
                    file_state: file_state.clone(),
                },
            });
            if self.auto_fix {
                match self.mark_stopped(bot_id) {
                    Ok(true) => report.mark_fixed(bot_id),
                    Ok(false) => warn!(bot_id = %bot_id, "State file vanished before it could be fixed"),
                    Err(e) => warn!(bot_id = %bot_id, error = %e, "Failed to mark bot stopped"),
                }
            }
        }

        info!(
            processes = report.processes_found,
            state_files = report.state_files_found,
            mismatches = report.mismatches.len(),
            fixed = report.fixed.len(),
            healthy = report.healthy,
            "Reconciliation complete"
        );
        report
    }

    /// Reconcile once and append the report to the reconciliation log.
    /// A log write failure is reported but does not fail the run.
    pub fn run_once(&self) -> ReconciliationReport {
        let report = self.reconcile();
        let log = self.config.reconciliation_log();
        if let Err(e) = append_report(&log, &report) {
            warn!(path = %log.display(), error = %e, "Failed to append reconciliation log");
        }
        report
    }

    /// Reconcile forever, sleeping the configured interval between passes.
    /// Passes never overlap. There is no shutdown path; the process is
    /// expected to be killed.
    pub async fn run_daemon<F>(&self, mut on_report: F)
    where
        F: FnMut(&ReconciliationReport),
    {
        let interval = Duration::from_secs(self.config.reconcile_interval_secs);
        info!(interval_secs = interval.as_secs(), auto_fix = self.auto_fix, "Starting reconciliation daemon");
        loop {
            let report = self.run_once();
            on_report(&report);
            tokio::time::sleep(interval).await;
        }
    }

    fn create_state_file(&self, bot_id: &str, process: &ProcessObservation) -> Result<(), StateError> {
        let name = display_name_from_id(bot_id);
        let writer = StateWriter::open(&self.config, bot_id, Some(&name))?;

        let mut fields = Fields::new();
        fields.insert("status".into(), Value::from("running"));
        fields.insert("pid".into(), serde_json::to_value(process.pid)?);
        fields.insert("started_at".into(), serde_json::to_value(process.started_at)?);
        fields.insert("reconciled".into(), Value::Bool(true));
        writer.update(fields)?;

        info!(bot_id = %bot_id, pid = ?process.pid, "Created state file for running bot");
        Ok(())
    }

    /// Returns `Ok(false)` if the file no longer exists.
    fn mark_stopped(&self, bot_id: &str) -> Result<bool, StateError> {
        let writer = StateWriter::open(&self.config, bot_id, None)?;
        if !writer.path().exists() {
            return Ok(false);
        }

        let mut fields = Fields::new();
        fields.insert("status".into(), Value::from("stopped"));
        fields.insert("reconciled".into(), Value::Bool(true));
        writer.update(fields)?;

        info!(bot_id = %bot_id, "Marked bot stopped");
        Ok(true)
    }
}
