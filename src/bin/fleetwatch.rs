//! Fleet Watch Binary
//!
//! Connects to the daemons behind a list of servers and logs their live
//! state until interrupted.
//!
//! Usage:
//!   fleetwatch --panel-url https://panel.example.com --servers 1a2b3c4d,5e6f7a8b
//!
//! Environment:
//!   FLEET_SERVERS - Comma-separated server ids
//!   PANEL_URL - Panel base URL (issues daemon credentials)
//!   PANEL_API_KEY - Bearer key for the panel (optional)
//!   PANEL_SESSION_COOKIE - Session cookie for the panel (optional)
//!   PANEL_ORIGIN - Origin header presented to daemons (default: panel URL)
//!   LIVE_* - Connection tuning, see `ManagerConfig::from_env`

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fleet_live::live::{InboundEvent, LiveDeps};
use fleet_live::{FleetRegistry, ManagerConfig, PanelConfig};

#[derive(Parser, Debug)]
#[command(name = "fleetwatch")]
#[command(about = "Fleet Watch - live daemon sessions for a list of servers")]
struct Args {
    /// Server ids to watch (comma-separated)
    #[arg(long, env = "FLEET_SERVERS")]
    servers: String,

    /// Panel base URL
    #[arg(long, env = "PANEL_URL")]
    panel_url: String,

    /// Panel API key
    #[arg(long, env = "PANEL_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Panel session cookie
    #[arg(long, env = "PANEL_SESSION_COOKIE", hide_env_values = true)]
    session_cookie: Option<String>,

    /// Origin header for daemon sockets
    #[arg(long, env = "PANEL_ORIGIN")]
    origin: Option<String>,

    /// Snapshot report interval in seconds
    #[arg(long, env = "FLEET_REPORT_SECS", default_value = "30")]
    report_secs: u64,

    /// Log console output of every server
    #[arg(long, default_value_t = false)]
    follow_console: bool,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fleet_live=info,fleetwatch=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let args = Args::parse();

    let servers: Vec<String> = args
        .servers
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if servers.is_empty() {
        bail!("no servers given");
    }

    let mut panel = PanelConfig::new(args.panel_url);
    panel.api_key = args.api_key;
    panel.session_cookie = args.session_cookie;
    panel.origin = args.origin.or_else(|| Some(panel.base_url.clone()));

    info!("Starting Fleet Watch");
    info!("  Panel: {}", panel.base_url);
    info!("  Servers: {}", servers.len());

    let config = ManagerConfig::from_env();
    let deps = LiveDeps::from_panel(&panel, config)?;
    let suspend = deps.suspend.clone();
    let registry = FleetRegistry::init(deps);

    let results = registry.connect_many(&servers).await;
    for (id, outcome) in &results {
        if !outcome.is_connected() {
            warn!(entity = %id, outcome = ?outcome, "initial_connect_failed");
        }
    }

    for id in &servers {
        let Some(conn) = registry.connection(id) else {
            continue;
        };

        conn.add_auth_observer(Arc::new(|entity: &str, renewal: bool| {
            info!(entity = %entity, renewal, "session_authenticated");
        }));

        let mut events = conn.subscribe();
        let follow_console = args.follow_console;
        let entity = id.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(InboundEvent::ConsoleOutput(line)) if follow_console => {
                        info!(entity = %entity, "{}", line);
                    }
                    Ok(InboundEvent::BackupCompleted) => {
                        info!(entity = %entity, "backup_completed");
                    }
                    Ok(InboundEvent::InstallCompleted) => {
                        info!(entity = %entity, "install_completed");
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(entity = %entity, skipped, "event_stream_lagged");
                    }
                    Err(RecvError::Closed) => return,
                }
            }
        });

        if args.follow_console {
            conn.request_logs().await;
        }
    }

    let mut report = interval(Duration::from_secs(args.report_secs.max(1)));
    report.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = report.tick() => {
                log_fleet(&registry);
            }
            _ = &mut shutdown => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    // Silence notices while everything comes down
    suspend.suspend();
    registry.teardown().await;

    info!("Fleet watch stopped");
    Ok(())
}

fn log_fleet(registry: &FleetRegistry) {
    for id in registry.ids() {
        let Some(conn) = registry.connection(&id) else {
            continue;
        };
        let view = conn.view();
        let snapshot = registry.snapshot(&id);
        let (cpu, memory) = snapshot
            .metrics
            .as_ref()
            .map_or((0, 0), |m| (m.cpu_percent, m.memory_bytes));

        info!(
            entity = %id,
            status = %view.status,
            liveness = %view.liveness,
            daemon_status = snapshot.status.as_deref().unwrap_or("-"),
            latency = ?view.latency,
            cpu_percent = cpu,
            memory_bytes = memory,
            counters = %conn.counters().summary(),
            "fleet_snapshot"
        );
    }
}
