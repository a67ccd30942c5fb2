//! HTTP connectivity probes for the external services the fleet depends on.
//!
//! Every probe resolves to a [`TestResult`]; transport errors, timeouts and
//! missing credentials are reported as failed results rather than errors.

use crate::envfile::EnvMap;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::time::{Duration, Instant};
use tracing::{debug, info};

pub const BRAVE_SEARCH_URL: &str = "https://api.search.brave.com/res/v1/web/search";
pub const TELEGRAM_API_URL: &str = "https://api.telegram.org";

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("{0} not configured")]
    NotConfigured(&'static str),
    #[error("HTTP {0}")]
    Status(u16),
    #[error("{0}")]
    Rejected(&'static str),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

/// Base URLs the probes talk to.
#[derive(Debug, Clone)]
pub struct Endpoints {
    pub brave_search: String,
    pub telegram_api: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            brave_search: BRAVE_SEARCH_URL.to_string(),
            telegram_api: TELEGRAM_API_URL.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TelegramResponse {
    #[serde(default)]
    ok: bool,
    result: Option<TelegramBot>,
}

#[derive(Debug, Deserialize)]
struct TelegramBot {
    username: Option<String>,
}

/// Shared HTTP client with a per-request timeout.
#[derive(Debug, Clone)]
pub struct ProbeClient {
    http: reqwest::Client,
    endpoints: Endpoints,
}

impl ProbeClient {
    pub fn new(timeout: Duration) -> Result<Self, ProbeError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            endpoints: Endpoints::default(),
        })
    }

    pub fn with_endpoints(mut self, endpoints: Endpoints) -> Self {
        self.endpoints = endpoints;
        self
    }

    /// One-result search against Brave. 401 means the key was rejected.
    pub async fn brave_search(&self, api_key: &str, query: &str) -> Result<u16, ProbeError> {
        let resp = self
            .http
            .get(&self.endpoints.brave_search)
            .header("X-Subscription-Token", api_key)
            .query(&[("q", query), ("count", "1")])
            .send()
            .await?;

        let status = resp.status();
        debug!(status = status.as_u16(), "Brave search response");
        if status.is_success() {
            Ok(status.as_u16())
        } else if status == reqwest::StatusCode::UNAUTHORIZED {
            Err(ProbeError::Rejected("API key invalid or expired"))
        } else {
            Err(ProbeError::Status(status.as_u16()))
        }
    }

    /// Telegram `getMe`. Returns the bot's username.
    pub async fn telegram_get_me(&self, token: &str) -> Result<String, ProbeError> {
        let url = format!("{}/bot{}/getMe", self.endpoints.telegram_api, token);
        let resp = self.http.get(url).send().await?;
        if !resp.status().is_success() {
            return Err(ProbeError::Rejected("Invalid token or API error"));
        }
        let body: TelegramResponse = resp.json().await?;
        if !body.ok {
            return Err(ProbeError::Rejected("Invalid token or API error"));
        }
        Ok(body
            .result
            .and_then(|bot| bot.username)
            .unwrap_or_else(|| "unknown".to_string()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResult {
    pub service: String,
    pub success: bool,
    pub latency_ms: f64,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl TestResult {
    fn finish(service: &str, started: Instant, outcome: Result<String, ProbeError>) -> Self {
        let latency_ms = match &outcome {
            Err(ProbeError::NotConfigured(_)) => 0.0,
            _ => round2(started.elapsed().as_secs_f64() * 1000.0),
        };
        let (success, message) = match outcome {
            Ok(message) => (true, message),
            Err(e) => (false, e.to_string()),
        };
        Self {
            service: service.to_string(),
            success,
            latency_ms,
            message,
            timestamp: Utc::now(),
        }
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

#[async_trait]
pub trait Probe: Send + Sync {
    /// Short name matched by the `--service` filter.
    fn key(&self) -> &'static str;

    async fn run(&self, client: &ProbeClient, env: &EnvMap) -> TestResult;
}

fn credential<'a>(env: &'a EnvMap, key: &str) -> Option<&'a str> {
    env.get(key).map(String::as_str).filter(|v| !v.is_empty())
}

/// Moonshot calls are made by the agent runtime; only the key is checked.
pub struct MoonshotProbe;

#[async_trait]
impl Probe for MoonshotProbe {
    fn key(&self) -> &'static str {
        "moonshot"
    }

    async fn run(&self, _client: &ProbeClient, env: &EnvMap) -> TestResult {
        let started = Instant::now();
        let outcome = match credential(env, "MOONSHOT_API_KEY") {
            Some(_) => Ok("API key configured".to_string()),
            None => Err(ProbeError::NotConfigured("API key")),
        };
        TestResult::finish("Moonshot", started, outcome)
    }
}

pub struct BraveSearchProbe;

#[async_trait]
impl Probe for BraveSearchProbe {
    fn key(&self) -> &'static str {
        "brave"
    }

    async fn run(&self, client: &ProbeClient, env: &EnvMap) -> TestResult {
        let started = Instant::now();
        let outcome = match credential(env, "BRAVE_API_KEY") {
            Some(key) => client
                .brave_search(key, "connectivity test")
                .await
                .map(|code| format!("HTTP {code}")),
            None => Err(ProbeError::NotConfigured("API key")),
        };
        TestResult::finish("Brave Search", started, outcome)
    }
}

pub struct TelegramProbe;

#[async_trait]
impl Probe for TelegramProbe {
    fn key(&self) -> &'static str {
        "telegram"
    }

    async fn run(&self, client: &ProbeClient, env: &EnvMap) -> TestResult {
        let started = Instant::now();
        let outcome = match credential(env, "TELEGRAM_BOT_TOKEN") {
            Some(token) => client.telegram_get_me(token).await.map(|name| format!("@{name}")),
            None => Err(ProbeError::NotConfigured("Bot token")),
        };
        TestResult::finish("Telegram", started, outcome)
    }
}

pub fn default_probes() -> Vec<Box<dyn Probe>> {
    vec![
        Box::new(MoonshotProbe),
        Box::new(BraveSearchProbe),
        Box::new(TelegramProbe),
    ]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectivityReport {
    pub timestamp: DateTime<Utc>,
    pub tests_run: usize,
    pub healthy: bool,
    pub results: Vec<TestResult>,
}

impl ConnectivityReport {
    pub fn failed(&self) -> impl Iterator<Item = &TestResult> {
        self.results.iter().filter(|r| !r.success)
    }
}

pub struct ConnectivityTester {
    client: ProbeClient,
    probes: Vec<Box<dyn Probe>>,
}

impl ConnectivityTester {
    pub fn new(client: ProbeClient, probes: Vec<Box<dyn Probe>>) -> Self {
        Self { client, probes }
    }

    /// Run probes one after another. `filter` keeps probes whose key
    /// contains it, ignoring case.
    pub async fn run_all(&self, env: &EnvMap, filter: Option<&str>) -> ConnectivityReport {
        let filter = filter.map(str::to_lowercase);
        let mut results = Vec::new();
        for probe in &self.probes {
            if let Some(f) = &filter {
                if !probe.key().contains(f.as_str()) {
                    continue;
                }
            }
            let result = probe.run(&self.client, env).await;
            info!(
                service = %result.service,
                success = result.success,
                latency_ms = result.latency_ms,
                "Probe finished"
            );
            results.push(result);
        }

        ConnectivityReport {
            timestamp: Utc::now(),
            tests_run: results.len(),
            healthy: results.iter().all(|r| r.success),
            results,
        }
    }
}

pub fn format_connectivity_report(report: &ConnectivityReport) -> String {
    let sep = "=".repeat(60);
    let mut out = String::new();
    let _ = writeln!(out, "{sep}");
    let _ = writeln!(out, "API CONNECTIVITY TEST REPORT");
    let _ = writeln!(out, "{sep}");
    let _ = writeln!(out, "Timestamp: {}", report.timestamp.to_rfc3339());
    let _ = writeln!(out, "Tests Run: {}", report.tests_run);

    if report.healthy {
        let _ = writeln!(out, "\n✅ All services connected");
    } else {
        let _ = writeln!(out, "\n⚠️  {} service(s) failed", report.failed().count());
    }

    let _ = writeln!(out, "\n📊 Results:");
    for r in &report.results {
        let mark = if r.success { "✅" } else { "❌" };
        let _ = writeln!(out, "  {mark} {}: {} ({}ms)", r.service, r.message, r.latency_ms);
    }
    let _ = write!(out, "{sep}");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unreachable_client() -> ProbeClient {
        ProbeClient::new(Duration::from_secs(2))
            .unwrap()
            .with_endpoints(Endpoints {
                brave_search: "http://127.0.0.1:1/search".to_string(),
                telegram_api: "http://127.0.0.1:1".to_string(),
            })
    }

    fn env(pairs: &[(&str, &str)]) -> EnvMap {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[tokio::test]
    async fn test_missing_keys_fail_without_network() {
        let tester = ConnectivityTester::new(unreachable_client(), default_probes());
        let report = tester.run_all(&EnvMap::new(), None).await;

        assert_eq!(report.tests_run, 3);
        assert!(!report.healthy);
        assert!(report.results.iter().all(|r| r.latency_ms == 0.0));
        assert_eq!(report.results[0].message, "API key not configured");
        assert_eq!(report.results[2].message, "Bot token not configured");
    }

    #[tokio::test]
    async fn test_moonshot_only_checks_key() {
        let tester = ConnectivityTester::new(unreachable_client(), default_probes());
        let report = tester
            .run_all(&env(&[("MOONSHOT_API_KEY", "sk-1")]), Some("MOON"))
            .await;

        assert_eq!(report.tests_run, 1);
        assert!(report.healthy);
        assert_eq!(report.results[0].service, "Moonshot");
    }

    #[tokio::test]
    async fn test_unreachable_host_is_failed_result() {
        let tester = ConnectivityTester::new(unreachable_client(), default_probes());
        let report = tester
            .run_all(&env(&[("BRAVE_API_KEY", "abc"), ("TELEGRAM_BOT_TOKEN", "1:x")]), None)
            .await;

        let brave = report.results.iter().find(|r| r.service == "Brave Search").unwrap();
        assert!(!brave.success);
        assert!(!brave.message.is_empty());
        let telegram = report.results.iter().find(|r| r.service == "Telegram").unwrap();
        assert!(!telegram.success);
        assert!(!report.healthy);
    }

    #[tokio::test]
    async fn test_filter_with_no_match_is_healthy() {
        let tester = ConnectivityTester::new(unreachable_client(), default_probes());
        let report = tester.run_all(&EnvMap::new(), Some("okx")).await;
        assert_eq!(report.tests_run, 0);
        assert!(report.healthy);
    }

    #[test]
    fn test_format_marks_failures() {
        let report = ConnectivityReport {
            timestamp: Utc::now(),
            tests_run: 1,
            healthy: false,
            results: vec![TestResult {
                service: "Telegram".to_string(),
                success: false,
                latency_ms: 0.0,
                message: "Bot token not configured".to_string(),
                timestamp: Utc::now(),
            }],
        };
        let text = format_connectivity_report(&report);
        assert!(text.contains("1 service(s) failed"));
        assert!(text.contains("❌ Telegram: Bot token not configured"));
    }
}
