use crate::envfile::EnvMap;
use crate::probes::{ProbeClient, ProbeError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyProbe {
    Brave,
    Telegram,
}

#[derive(Debug, Clone, Copy)]
pub struct ConfigKey {
    pub key: &'static str,
    pub description: &'static str,
    pub optional: bool,
    pub probe: Option<KeyProbe>,
}

pub const CONFIG_KEYS: &[ConfigKey] = &[
    ConfigKey {
        key: "BRAVE_API_KEY",
        description: "Brave Search API for web searches",
        optional: false,
        probe: Some(KeyProbe::Brave),
    },
    ConfigKey {
        key: "MOONSHOT_API_KEY",
        description: "Moonshot LLM API (primary)",
        optional: true,
        probe: None,
    },
    ConfigKey {
        key: "OKX_API_KEY",
        description: "OKX exchange API key",
        optional: true,
        probe: None,
    },
    ConfigKey {
        key: "OKX_API_SECRET",
        description: "OKX exchange API secret",
        optional: true,
        probe: None,
    },
    ConfigKey {
        key: "TELEGRAM_BOT_TOKEN",
        description: "Telegram bot token for notifications",
        optional: true,
        probe: Some(KeyProbe::Telegram),
    },
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissingKey {
    pub key: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiTest {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigReport {
    pub timestamp: DateTime<Utc>,
    pub configs_checked: usize,
    pub present: Vec<String>,
    pub missing_required: Vec<MissingKey>,
    pub missing_optional: Vec<MissingKey>,
    pub api_tests: BTreeMap<String, ApiTest>,
    pub healthy: bool,
}

/// Check `keys` against the merged configuration. With a client, present
/// keys that have a probe are also tested against their API; without one
/// (quick mode) no network calls are made.
///
/// The report is unhealthy if a required key is missing or a required
/// key's probe fails. Optional keys never affect health.
pub async fn validate_config(
    keys: &[ConfigKey],
    configs: &EnvMap,
    client: Option<&ProbeClient>,
) -> ConfigReport {
    let mut report = ConfigReport {
        timestamp: Utc::now(),
        configs_checked: keys.len(),
        present: Vec::new(),
        missing_required: Vec::new(),
        missing_optional: Vec::new(),
        api_tests: BTreeMap::new(),
        healthy: true,
    };

    for entry in keys {
        let value = configs.get(entry.key).filter(|v| !v.is_empty());
        let Some(value) = value else {
            let missing = MissingKey {
                key: entry.key.to_string(),
                description: entry.description.to_string(),
            };
            if entry.optional {
                report.missing_optional.push(missing);
            } else {
                warn!(key = entry.key, "Required config missing");
                report.missing_required.push(missing);
                report.healthy = false;
            }
            continue;
        };

        report.present.push(entry.key.to_string());
        let (Some(client), Some(probe)) = (client, entry.probe) else {
            continue;
        };
        let test = run_key_probe(client, probe, value).await;
        if !test.success && !entry.optional {
            report.healthy = false;
        }
        report.api_tests.insert(entry.key.to_string(), test);
    }

    info!(
        present = report.present.len(),
        missing_required = report.missing_required.len(),
        missing_optional = report.missing_optional.len(),
        healthy = report.healthy,
        "Config validation complete"
    );
    report
}

async fn run_key_probe(client: &ProbeClient, probe: KeyProbe, value: &str) -> ApiTest {
    let outcome: Result<String, ProbeError> = match probe {
        KeyProbe::Brave => client
            .brave_search(value, "test")
            .await
            .map(|_| "API key valid".to_string()),
        KeyProbe::Telegram => client
            .telegram_get_me(value)
            .await
            .map(|_| "Token valid".to_string()),
    };
    match outcome {
        Ok(message) => ApiTest {
            success: true,
            message,
        },
        Err(e) => ApiTest {
            success: false,
            message: e.to_string(),
        },
    }
}

pub fn format_config_report(report: &ConfigReport) -> String {
    let sep = "=".repeat(60);
    let mut out = String::new();
    let _ = writeln!(out, "{sep}");
    let _ = writeln!(out, "CONFIGURATION VALIDATION REPORT");
    let _ = writeln!(out, "{sep}");

    if report.healthy {
        let _ = writeln!(out, "✅ All required configurations present");
    } else {
        let _ = writeln!(out, "❌ Configuration issues found");
    }

    let _ = writeln!(
        out,
        "\n📋 Configs Present: {}/{}",
        report.present.len(),
        report.configs_checked
    );
    for key in &report.present {
        let ok = report.api_tests.get(key).map(|t| t.success).unwrap_or(true);
        let _ = writeln!(out, "  {} {key}", if ok { "✅" } else { "❌" });
    }

    if !report.missing_required.is_empty() {
        let _ = writeln!(out, "\n⚠️  Missing Required ({}):", report.missing_required.len());
        for item in &report.missing_required {
            let _ = writeln!(out, "  ❌ {}: {}", item.key, item.description);
        }
    }

    if !report.missing_optional.is_empty() {
        let _ = writeln!(out, "\nℹ️  Missing Optional ({}):", report.missing_optional.len());
        for item in &report.missing_optional {
            let _ = writeln!(out, "  ⚪ {}: {}", item.key, item.description);
        }
    }

    if !report.api_tests.is_empty() {
        let _ = writeln!(out, "\n🔌 API Connectivity Tests:");
        for (key, test) in &report.api_tests {
            let mark = if test.success { "✅" } else { "❌" };
            let _ = writeln!(out, "  {mark} {key}: {}", test.message);
        }
    }
    let _ = write!(out, "{sep}");
    out
}
