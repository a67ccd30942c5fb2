use crate::StateError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_RECONCILE_INTERVAL_SECS: u64 = 300;
pub const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_STALE_AFTER_MINUTES: i64 = 15;

/// Paths and intervals shared by every fleet tool.
///
/// Built once by the caller and handed to each component; nothing in the
/// library falls back to a process-wide default location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FleetConfig {
    pub workspace: PathBuf,
    pub state_dir: PathBuf,
    pub log_dir: PathBuf,
    pub heartbeat_state_file: PathBuf,
    pub reconcile_interval_secs: u64,
    pub probe_timeout_secs: u64,
    /// Env files read in order; later files override earlier ones.
    pub env_files: Vec<PathBuf>,
}

/// Optional overrides loaded from a TOML file. Relative paths resolve
/// against the workspace.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FleetConfigFile {
    pub state_dir: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
    pub heartbeat_state_file: Option<PathBuf>,
    pub reconcile_interval_secs: Option<u64>,
    pub probe_timeout_secs: Option<u64>,
    pub env_files: Option<Vec<PathBuf>>,
}

impl FleetConfig {
    /// Default layout under a workspace directory.
    pub fn from_workspace(workspace: impl Into<PathBuf>) -> Self {
        let workspace = workspace.into();
        Self {
            state_dir: workspace.join("state"),
            log_dir: workspace.join("logs"),
            heartbeat_state_file: workspace.join("memory").join("heartbeat-state.json"),
            reconcile_interval_secs: DEFAULT_RECONCILE_INTERVAL_SECS,
            probe_timeout_secs: DEFAULT_PROBE_TIMEOUT_SECS,
            env_files: [".env", ".env.local", ".env.alerts"]
                .iter()
                .map(|name| workspace.join(name))
                .collect(),
            workspace,
        }
    }

    /// Workspace defaults, overlaid with a TOML file when one is given.
    pub fn load(workspace: impl Into<PathBuf>, file: Option<&Path>) -> Result<Self, StateError> {
        let mut config = Self::from_workspace(workspace);
        if let Some(path) = file {
            let text = std::fs::read_to_string(path)?;
            let overrides: FleetConfigFile = toml::from_str(&text).map_err(|e| {
                StateError::ConfigError(format!("{}: {}", path.display(), e))
            })?;
            config.apply(overrides);
            tracing::debug!(path = %path.display(), "Loaded config overrides");
        }
        Ok(config)
    }

    pub fn apply(&mut self, overrides: FleetConfigFile) {
        let ws = self.workspace.clone();
        let resolve = |p: PathBuf| if p.is_absolute() { p } else { ws.join(p) };

        if let Some(p) = overrides.state_dir {
            self.state_dir = resolve(p);
        }
        if let Some(p) = overrides.log_dir {
            self.log_dir = resolve(p);
        }
        if let Some(p) = overrides.heartbeat_state_file {
            self.heartbeat_state_file = resolve(p);
        }
        if let Some(secs) = overrides.reconcile_interval_secs {
            self.reconcile_interval_secs = secs;
        }
        if let Some(secs) = overrides.probe_timeout_secs {
            self.probe_timeout_secs = secs;
        }
        if let Some(files) = overrides.env_files {
            self.env_files = files.into_iter().map(resolve).collect();
        }
    }

    pub fn state_file(&self, bot_id: &str) -> PathBuf {
        self.state_dir.join(format!("{bot_id}.json"))
    }

    pub fn reconciliation_log(&self) -> PathBuf {
        self.log_dir.join("reconciliation.log")
    }

    pub fn connectivity_log(&self) -> PathBuf {
        self.log_dir.join("connectivity.log")
    }
}
