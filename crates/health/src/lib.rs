//! Operational health checks around the bot fleet: configuration
//! validation, external API connectivity and the periodic heartbeat.

pub mod envfile;
pub mod heartbeat;
pub mod probes;
pub mod validate;

pub use envfile::{collect_config, load_env_file, parse_env, EnvMap};
pub use heartbeat::{
    format_heartbeat, parse_df_capacity, run_heartbeat, stale_bots, AlertThresholds,
    HeartbeatOutcome, HeartbeatState, StaleBot,
};
pub use probes::{
    default_probes, format_connectivity_report, ConnectivityReport, ConnectivityTester, Endpoints,
    Probe, ProbeClient, ProbeError, TestResult,
};
pub use validate::{
    format_config_report, validate_config, ApiTest, ConfigKey, ConfigReport, KeyProbe, MissingKey,
    CONFIG_KEYS,
};
