//! Ferro Station - main entry point
//!
//! Opens the measurement device, starts the ingestion pipeline for one
//! inspection session, and drives it from a small operator console on stdin:
//!
//! ```text
//! part <number>   declare the next part under test
//! close           close the current part and run its disposition
//! status          print a ledger snapshot
//! end             end the session and exit
//! ```

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ferro_common::db::{init_database, SqliteGateway};
use ferro_common::events::{EventBus, StationEvent};
use ferro_common::types::{DispositionChoice, Part, SessionInfo, ThresholdSet};
use ferro_station::config::StationConfig;
use ferro_station::lifecycle::{AutoPassAuthority, DispositionAuthority};
use ferro_station::pipeline::IngestionPipeline;
use ferro_station::StationHandle;

/// Command-line arguments for ferro-station
#[derive(Parser, Debug)]
#[command(name = "ferro-station")]
#[command(about = "Measurement ingestion and part test lifecycle engine")]
#[command(version)]
struct Args {
    /// Path to the TOML bootstrap config
    #[arg(short, long, env = "FERRO_CONFIG")]
    config: Option<PathBuf>,

    /// Override the device node from the config
    #[arg(long, env = "FERRO_DEVICE")]
    device: Option<PathBuf>,

    /// Override the database path from the config
    #[arg(long, env = "FERRO_DATABASE")]
    database: Option<PathBuf>,

    /// Operator name for this session
    #[arg(long)]
    operator: String,

    /// Supervisor id for this session
    #[arg(long, default_value = "")]
    supervisor: String,

    /// Company name
    #[arg(long, default_value = "")]
    company: String,

    /// Machine identifier
    #[arg(long, default_value = "")]
    machine_id: String,

    /// Description shared by every part in this session
    #[arg(long)]
    part_description: String,

    /// Minimum acceptable headshot current
    #[arg(long)]
    headshot_threshold: f64,

    /// Minimum acceptable coilshot current
    #[arg(long)]
    coilshot_threshold: f64,

    /// Run unattended: clean parts pass, failed parts are not retested
    #[arg(long)]
    auto: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => StationConfig::load(path).context("Failed to load config")?,
        None => StationConfig::default(),
    };
    if let Some(device) = args.device.clone() {
        config.device_path = device;
    }
    if let Some(database) = args.database.clone() {
        config.database_path = database;
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("ferro_station={0},ferro_common={0}", config.logging.level).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Ferro Station");
    info!("Device: {}", config.device_path.display());

    let pool = init_database(&config.database_path)
        .await
        .context("Failed to initialize database")?;
    let gateway = Arc::new(SqliteGateway::new(pool));

    let device = tokio::fs::File::open(&config.device_path)
        .await
        .with_context(|| format!("Failed to open device {}", config.device_path.display()))?;

    let session = SessionInfo::new(
        args.operator.clone(),
        args.supervisor.clone(),
        args.company.clone(),
        args.machine_id.clone(),
        args.part_description.clone(),
        ThresholdSet {
            headshot: args.headshot_threshold,
            coilshot: args.coilshot_threshold,
        },
    );

    let bus = Arc::new(EventBus::new(256));
    spawn_event_logger(Arc::clone(&bus));

    let authority: Arc<dyn DispositionAuthority> = if args.auto {
        Arc::new(AutoPassAuthority)
    } else {
        Arc::new(ConsoleAuthority)
    };

    let options = config.pipeline_options().context("Invalid pipeline config")?;
    let mut pipeline =
        IngestionPipeline::start(device, session, gateway, authority, bus, options).await;
    let handle = pipeline.handle();

    tokio::select! {
        _ = console_loop(handle.clone()) => {}
        _ = shutdown_signal() => {
            info!("Shutdown signal received");
            if let Err(e) = handle.end_session().await {
                warn!("Could not end session cleanly: {e}");
            }
        }
    }

    pipeline.stop().await;
    info!("Shutdown complete");
    Ok(())
}

/// Forward engine events to the log
fn spawn_event_logger(bus: Arc<EventBus>) {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = rx.recv().await {
            match &event {
                StationEvent::ShotRecorded { part, channel, shot, .. } => {
                    info!(
                        "Part {part} {channel} shot {}: {:.2} A / {:.3} s ({:?})",
                        shot.index + 1,
                        shot.current,
                        shot.duration,
                        shot.outcome
                    );
                }
                StationEvent::PartDisposed { part, disposition, .. } => {
                    info!("Part {part}: {disposition}");
                }
                StationEvent::DeviceFault { message, .. } => {
                    warn!("Device fault: {message}");
                }
                other => info!("{other:?}"),
            }
        }
    });
}

/// Minimal operator console over stdin; returns when the session ends
async fn console_loop(handle: StationHandle) {
    loop {
        let Some(line) = read_stdin_line().await else {
            return;
        };
        let mut words = line.split_whitespace();
        match (words.next(), words.next()) {
            (Some("part"), Some(number)) => match number.parse::<u32>() {
                Ok(base) => match handle.open_part(base).await {
                    Ok(key) => println!("Part {key} under test"),
                    Err(e) => println!("{e}"),
                },
                Err(_) => println!("Part number must be a whole number"),
            },
            (Some("close"), None) => match handle.close_part().await {
                Ok(outcome) => match outcome.retest {
                    Some(retest) => println!(
                        "Part {}: {}; retest {retest} under test",
                        outcome.part, outcome.disposition
                    ),
                    None => println!("Part {}: {}", outcome.part, outcome.disposition),
                },
                Err(e) => println!("{e}"),
            },
            (Some("status"), None) => match handle.snapshot().await {
                Ok(snapshot) => {
                    for part in &snapshot.parts {
                        println!(
                            "Part {}: {:?} head[{}] coil[{}]",
                            part.key,
                            part.state,
                            part.headshot.len(),
                            part.coilshot.len()
                        );
                    }
                    println!(
                        "Totals: {} tested, {} accepted, {} rejected",
                        snapshot.summary.total_parts,
                        snapshot.summary.accepted,
                        snapshot.summary.rejected
                    );
                }
                Err(e) => println!("{e}"),
            },
            (Some("end"), None) => {
                match handle.end_session().await {
                    Ok(summary) => println!(
                        "Session ended: {} tested, {} accepted, {} rejected",
                        summary.total_parts, summary.accepted, summary.rejected
                    ),
                    Err(e) => println!("{e}"),
                }
                return;
            }
            (None, _) => {}
            _ => println!("Commands: part <number> | close | status | end"),
        }
    }
}

/// Operator prompts on the console, answering the disposition questions
struct ConsoleAuthority;

#[async_trait]
impl DispositionAuthority for ConsoleAuthority {
    async fn ask_crack_or_retest(&self, part: &Part) -> DispositionChoice {
        loop {
            let answer =
                prompt(&format!("Crack detected on part {}? [y]es/[n]o/[r]etest: ", part.key))
                    .await;
            match answer.trim().to_lowercase().as_str() {
                "y" | "yes" => {
                    let path = prompt("Evidence image path (blank for none): ").await;
                    let path = path.trim();
                    return DispositionChoice::Crack {
                        evidence_path: (!path.is_empty()).then(|| path.to_string()),
                    };
                }
                "n" | "no" => return DispositionChoice::Pass,
                "r" | "retest" => return DispositionChoice::Retest,
                _ => continue,
            }
        }
    }

    async fn confirm_retest_after_error(&self, part: &Part) -> bool {
        let answer =
            prompt(&format!("Part {} failed measurement. Retest? [y/n]: ", part.key)).await;
        matches!(answer.trim().to_lowercase().as_str(), "y" | "yes")
    }
}

async fn prompt(message: &str) -> String {
    print!("{message}");
    let _ = std::io::stdout().flush();
    read_stdin_line().await.unwrap_or_default()
}

/// One line from stdin without tying up the async runtime
async fn read_stdin_line() -> Option<String> {
    tokio::task::spawn_blocking(|| {
        let mut line = String::new();
        match std::io::stdin().read_line(&mut line) {
            Ok(0) => None,
            Ok(_) => Some(line),
            Err(_) => None,
        }
    })
    .await
    .ok()
    .flatten()
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
