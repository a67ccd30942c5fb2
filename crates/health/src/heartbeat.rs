use chrono::{DateTime, Duration, Utc};
use fleetstate_core::{BotState, BotStatus, FleetConfig, StateError, DEFAULT_STALE_AFTER_MINUTES};
use fleetstate_store::{load_all_states, write_json_atomic};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::process::Command;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertThresholds {
    pub tokens_remaining: u64,
    pub disk_percent: u8,
    pub bot_downtime_minutes: i64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            tokens_remaining: 10_000_000,
            disk_percent: 85,
            bot_downtime_minutes: DEFAULT_STALE_AFTER_MINUTES,
            extra: Map::new(),
        }
    }
}

/// Persisted between heartbeat runs. Key names match the file other
/// agent tooling reads.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatState {
    #[serde(rename = "lastChecks", default)]
    pub last_checks: Map<String, Value>,
    #[serde(rename = "alertThresholds", default)]
    pub alert_thresholds: AlertThresholds,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl HeartbeatState {
    /// Missing file gives defaults. A file that does not parse is logged
    /// and replaced with defaults on the next save.
    pub fn load(path: &Path) -> Self {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %e, "Cannot read heartbeat state");
                }
                return Self::default();
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(state) => state,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Heartbeat state is malformed, using defaults");
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), StateError> {
        write_json_atomic(path, self)
    }

    pub fn mark_checked(&mut self, check: &str, at: DateTime<Utc>) {
        self.last_checks
            .insert(check.to_string(), Value::String(at.to_rfc3339()));
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StaleBot {
    pub bot_id: String,
    pub status: BotStatus,
    /// `None` when the bot never stamped an update.
    pub minutes_since_update: Option<i64>,
}

/// Bots whose state claims they are live but whose last update is older
/// than `max_age`.
pub fn stale_bots(
    states: &BTreeMap<String, BotState>,
    now: DateTime<Utc>,
    max_age: Duration,
) -> Vec<StaleBot> {
    states
        .iter()
        .filter(|(_, state)| state.status.is_live())
        .filter_map(|(bot_id, state)| {
            let age = state.last_update.map(|t| now - t);
            match age {
                Some(age) if age <= max_age => None,
                _ => Some(StaleBot {
                    bot_id: bot_id.clone(),
                    status: state.status.clone(),
                    minutes_since_update: age.map(|a| a.num_minutes()),
                }),
            }
        })
        .collect()
}

/// Capacity percentage from `df -P` output (second line, fifth column).
pub fn parse_df_capacity(output: &str) -> Option<u8> {
    let line = output.lines().nth(1)?;
    let field = line.split_whitespace().nth(4)?;
    field.trim_end_matches('%').parse().ok()
}

fn disk_usage_percent(path: &Path) -> Option<u8> {
    let output = match Command::new("df").arg("-P").arg(path).output() {
        Ok(output) if output.status.success() => output,
        Ok(output) => {
            warn!(status = %output.status, "df exited with an error");
            return None;
        }
        Err(e) => {
            warn!(error = %e, "Failed to run df");
            return None;
        }
    };
    parse_df_capacity(&String::from_utf8_lossy(&output.stdout))
}

/// Out-of-range minute counts in the state file fall back to the default.
fn downtime_threshold(minutes: i64) -> Duration {
    match Duration::try_minutes(minutes) {
        Some(d) if minutes >= 0 => d,
        _ => {
            warn!(minutes, "Invalid bot_downtime_minutes, using default");
            Duration::minutes(DEFAULT_STALE_AFTER_MINUTES)
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct HeartbeatOutcome {
    pub alerts: Vec<String>,
}

impl HeartbeatOutcome {
    pub fn is_ok(&self) -> bool {
        self.alerts.is_empty()
    }
}

/// Run the disk and bot freshness checks, then persist the heartbeat state.
pub fn run_heartbeat(config: &FleetConfig) -> Result<HeartbeatOutcome, StateError> {
    let disk = disk_usage_percent(&config.workspace).or_else(|| disk_usage_percent(Path::new("/")));
    run_checks(config, disk, Utc::now())
}

fn run_checks(
    config: &FleetConfig,
    disk_percent: Option<u8>,
    now: DateTime<Utc>,
) -> Result<HeartbeatOutcome, StateError> {
    let mut state = HeartbeatState::load(&config.heartbeat_state_file);
    let thresholds = state.alert_thresholds.clone();
    let mut alerts = Vec::new();

    match disk_percent {
        Some(pct) => {
            debug!(disk_percent = pct, "Disk usage");
            if pct >= thresholds.disk_percent {
                alerts.push(format!(
                    "Disk usage at {pct}% (threshold {}%)",
                    thresholds.disk_percent
                ));
            }
            state.mark_checked("disk", now);
        }
        None => warn!("Disk usage unavailable"),
    }

    let states = load_all_states(&config.state_dir);
    let max_age = downtime_threshold(thresholds.bot_downtime_minutes);
    for stale in stale_bots(&states, now, max_age) {
        let alert = match stale.minutes_since_update {
            Some(mins) => format!(
                "Bot {} reports {} but last update was {mins} min ago",
                stale.bot_id, stale.status
            ),
            None => format!(
                "Bot {} reports {} but has never updated",
                stale.bot_id, stale.status
            ),
        };
        alerts.push(alert);
    }
    state.mark_checked("bots", now);

    state.save(&config.heartbeat_state_file)?;
    info!(alerts = alerts.len(), bots = states.len(), "Heartbeat complete");
    Ok(HeartbeatOutcome { alerts })
}

pub fn format_heartbeat(outcome: &HeartbeatOutcome) -> String {
    if outcome.is_ok() {
        return "HEARTBEAT_OK".to_string();
    }
    let mut out = String::from("⚠️ ALERTS:");
    for alert in &outcome.alerts {
        out.push_str("\n  - ");
        out.push_str(alert);
    }
    out
}
