use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fleetstate_core::FleetConfig;
use fleetstate_health::{
    collect_config, default_probes, format_config_report, format_connectivity_report,
    format_heartbeat, run_heartbeat, validate_config, ConnectivityTester, ProbeClient, CONFIG_KEYS,
};
use fleetstate_reconciler::{format_report, ProcessObserver, Reconciler};
use fleetstate_store::{append_json_line, clear_all_states, load_all_states, Fields, StateWriter};
use serde_json::Value;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "fleetctl")]
#[command(about = "Bot fleet state tools: publish, reconcile and health-check trading bot state")]
#[command(version)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines on stderr
    #[arg(long)]
    log_json: bool,

    /// Workspace directory (default: ~/.openclaw/workspace)
    #[arg(short, long, env = "FLEET_WORKSPACE")]
    workspace: Option<PathBuf>,

    /// TOML file overriding workspace defaults
    #[arg(short, long, env = "FLEET_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compare running bot processes against their state files
    Reconcile {
        /// Keep reconciling on an interval
        #[arg(long)]
        daemon: bool,

        /// Rewrite state files to match the process table
        #[arg(long)]
        fix: bool,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,

        /// Seconds between daemon passes
        #[arg(long)]
        interval: Option<u64>,
    },

    /// Read or update one bot's state file
    State {
        /// Bot identifier (state file base name)
        bot_id: String,

        /// Display name used when the file is created
        #[arg(long)]
        name: Option<String>,

        #[command(subcommand)]
        action: Option<StateAction>,
    },

    /// Print every bot's state
    StateList,

    /// Delete every state file
    StateClear,

    /// Check configuration keys across env files and the environment
    ValidateConfig {
        /// Skip API calls
        #[arg(long)]
        quick: bool,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Probe external APIs
    Connectivity {
        /// Only run probes whose name contains this
        #[arg(long)]
        service: Option<String>,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run the periodic disk and bot freshness checks
    Heartbeat,
}

#[derive(Subcommand)]
enum StateAction {
    /// Print the current record
    Show,
    Running,
    Paused,
    Stopped,
    /// Mark the bot errored
    Error { message: String },
    /// Record a closed trade
    Trade {
        #[arg(allow_negative_numbers = true)]
        pnl: f64,
        side: String,
    },
    /// Set the open position, or clear it when no side is given
    Position {
        #[arg(requires = "size")]
        side: Option<String>,
        size: Option<f64>,
        entry_price: Option<f64>,
    },
    /// Merge arbitrary KEY=VALUE fields (values parsed as JSON when possible)
    Set {
        #[arg(value_parser = parse_field, required = true)]
        fields: Vec<(String, Value)>,
    },
}

fn parse_field(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got `{raw}`"))?;
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // Logs go to stderr so JSON reports on stdout stay parseable
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    let subscriber = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if cli.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    let workspace = match cli.workspace {
        Some(path) => path,
        None => default_workspace()?,
    };
    let config = FleetConfig::load(&workspace, cli.config.as_deref())
        .with_context(|| format!("loading config for {}", workspace.display()))?;

    match cli.command {
        Commands::Reconcile {
            daemon,
            fix,
            json,
            interval,
        } => reconcile(config, daemon, fix, json, interval).await,
        Commands::State {
            bot_id,
            name,
            action,
        } => state(&config, &bot_id, name.as_deref(), action.unwrap_or(StateAction::Show)),
        Commands::StateList => {
            let states = load_all_states(&config.state_dir);
            println!("{}", serde_json::to_string_pretty(&states)?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::StateClear => {
            let removed = clear_all_states(&config.state_dir)?;
            tracing::info!(removed, dir = %config.state_dir.display(), "Cleared state files");
            println!("Removed {removed} state file(s)");
            Ok(ExitCode::SUCCESS)
        }
        Commands::ValidateConfig { quick, json } => validate(&config, quick, json).await,
        Commands::Connectivity { service, json } => connectivity(&config, service, json).await,
        Commands::Heartbeat => {
            let outcome = run_heartbeat(&config)?;
            println!("{}", format_heartbeat(&outcome));
            Ok(exit_code(outcome.is_ok()))
        }
    }
}

fn default_workspace() -> Result<PathBuf> {
    let home = std::env::var_os("HOME").context("HOME is not set; pass --workspace")?;
    Ok(PathBuf::from(home).join(".openclaw").join("workspace"))
}

fn exit_code(healthy: bool) -> ExitCode {
    if healthy {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    }
}

async fn reconcile(
    mut config: FleetConfig,
    daemon: bool,
    fix: bool,
    json: bool,
    interval: Option<u64>,
) -> Result<ExitCode> {
    if let Some(secs) = interval {
        config.reconcile_interval_secs = secs;
    }
    let reconciler = Reconciler::new(config, fix, ProcessObserver::system());

    if daemon {
        reconciler
            .run_daemon(|report| {
                if !json {
                    println!("{}", format_report(report));
                }
            })
            .await;
        return Ok(ExitCode::SUCCESS);
    }

    let report = reconciler.run_once();
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", format_report(&report));
    }
    Ok(exit_code(report.healthy))
}

fn state(
    config: &FleetConfig,
    bot_id: &str,
    name: Option<&str>,
    action: StateAction,
) -> Result<ExitCode> {
    if let StateAction::Show = action {
        let writer = StateWriter::open(config, bot_id, name)?;
        println!("{}", serde_json::to_string_pretty(&writer.get_state()?)?);
        return Ok(ExitCode::SUCCESS);
    }

    let writer = StateWriter::new(config, bot_id, name)?;
    let state = match action {
        StateAction::Show => writer.get_state()?,
        StateAction::Running => writer.set_running(None)?,
        StateAction::Paused => writer.set_paused()?,
        StateAction::Stopped => writer.set_stopped()?,
        StateAction::Error { message } => writer.set_error(&message)?,
        StateAction::Trade { pnl, side } => writer.record_trade(pnl, &side)?,
        StateAction::Position {
            side,
            size,
            entry_price,
        } => writer.update_position(side.as_deref(), size.unwrap_or(0.0), entry_price)?,
        StateAction::Set { fields } => writer.update(fields.into_iter().collect::<Fields>())?,
    };
    tracing::info!(bot_id, status = %state.status, "State updated");
    println!("{}", serde_json::to_string_pretty(&state)?);
    Ok(ExitCode::SUCCESS)
}

async fn validate(config: &FleetConfig, quick: bool, json: bool) -> Result<ExitCode> {
    let configs = collect_config(&config.env_files, std::env::vars());
    let client = if quick {
        None
    } else {
        Some(ProbeClient::new(Duration::from_secs(config.probe_timeout_secs))?)
    };

    let report = validate_config(CONFIG_KEYS, &configs, client.as_ref()).await;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", format_config_report(&report));
    }
    Ok(exit_code(report.healthy))
}

async fn connectivity(config: &FleetConfig, service: Option<String>, json: bool) -> Result<ExitCode> {
    let env = collect_config(&config.env_files, std::env::vars());
    let client = ProbeClient::new(Duration::from_secs(config.probe_timeout_secs))?;
    let tester = ConnectivityTester::new(client, default_probes());

    let report = tester.run_all(&env, service.as_deref()).await;
    let log = config.connectivity_log();
    if let Err(e) = append_json_line(&log, &report) {
        tracing::warn!(path = %log.display(), error = %e, "Failed to append connectivity log");
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", format_connectivity_report(&report));
    }
    Ok(exit_code(report.healthy))
}
