use fleetstate_core::{ReconciliationReport, StateError};
use fleetstate_store::append_json_line;
use std::fmt::Write as _;
use std::path::Path;

/// Append `report` to the reconciliation log as one JSON line.
pub fn append_report(path: &Path, report: &ReconciliationReport) -> Result<(), StateError> {
    append_json_line(path, report)
}

/// Human-readable rendering for the terminal.
pub fn format_report(report: &ReconciliationReport) -> String {
    let sep = "=".repeat(60);
    let mut out = String::new();
    let _ = writeln!(out, "{sep}");
    let _ = writeln!(out, "STATE RECONCILIATION REPORT");
    let _ = writeln!(out, "{sep}");
    let _ = writeln!(out, "Timestamp: {}", report.timestamp.to_rfc3339());
    let _ = writeln!(out, "Processes Found: {}", report.processes_found);
    let _ = writeln!(out, "State Files Found: {}", report.state_files_found);

    if report.healthy {
        let _ = writeln!(out, "\n✅ All states reconciled");
    } else {
        let _ = writeln!(out, "\n⚠️  {} mismatch(es) found:", report.mismatches.len());
        for m in &report.mismatches {
            let _ = writeln!(out, "  - {}: {}", m.bot_id, m.kind().as_str());
        }
    }

    if !report.fixed.is_empty() {
        let _ = writeln!(out, "\n🔧 Fixed: {}", report.fixed.join(", "));
    }
    let _ = write!(out, "{sep}");
    out
}
