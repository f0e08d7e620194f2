use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tokio::time::{sleep, Duration};

use run_tracker_rs::sensors::{SimulatedPositionSource, SimulatedStepSource};
use run_tracker_rs::{
    ChannelObserver, JsonFileStore, PersistenceSink, SessionCoordinator, SessionId,
    SessionSummary, StartOutcome, StaticPermissionGate, TrackerConfig, TrackerSignal,
};

#[derive(Parser, Debug)]
#[command(name = "run_tracker")]
#[command(about = "Running session tracker - steps + GPS fused into one session record", long_about = None)]
struct Args {
    /// JSON config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Session storage directory (overrides the config file)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Record a session from simulated sensors
    Run {
        /// Duration in seconds (0 = until Ctrl-C)
        #[arg(long, default_value = "60")]
        duration: u64,

        /// Simulated running speed (m/s)
        #[arg(long, default_value = "3.0")]
        speed: f64,

        /// Simulated cadence (steps per minute)
        #[arg(long, default_value = "170")]
        cadence: f64,

        /// Refuse the sensor permission request
        #[arg(long)]
        deny_permission: bool,
    },
    /// List stored sessions, newest first
    List,
    /// Print the summary of one session
    Show {
        id: String,

        /// Print the whole record, fixes and snapshots included
        #[arg(long)]
        full: bool,
    },
    /// Delete a stored session
    Delete { id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => TrackerConfig::load(path)?,
        None => TrackerConfig::default(),
    };
    if let Some(dir) = args.data_dir {
        config.data_dir = dir;
    }
    config.validate()?;

    match args.command {
        Command::Run {
            duration,
            speed,
            cadence,
            deny_permission,
        } => run_session(config, duration, speed, cadence, deny_permission).await,
        Command::List => list_sessions(&config),
        Command::Show { id, full } => show_session(&config, &SessionId::from(id), full),
        Command::Delete { id } => delete_session(&config, &SessionId::from(id)),
    }
}

async fn run_session(
    config: TrackerConfig,
    duration: u64,
    speed: f64,
    cadence: f64,
    deny_permission: bool,
) -> Result<()> {
    let store = Arc::new(
        JsonFileStore::open(&config.data_dir)
            .with_context(|| format!("opening {}", config.data_dir.display()))?,
    );
    let gate = Arc::new(StaticPermissionGate::new(!deny_permission));
    let steps = Arc::new(SimulatedStepSource::new(12_000, cadence));
    let positions = Arc::new(SimulatedPositionSource::new((37.7749, -122.4194), speed));

    println!("[{}] Run Tracker Starting", ts_now());
    println!("  Duration: {} seconds (0=continuous)", duration);
    println!("  Speed: {:.1} m/s, cadence: {:.0} spm", speed, cadence);
    println!("  Data Dir: {}", config.data_dir.display());

    let mut coordinator = SessionCoordinator::new(gate, steps, positions, store, config);
    let (observer, mut signals) = ChannelObserver::channel();
    coordinator.subscribe(Arc::new(observer));

    if let StartOutcome::Started(id) = coordinator.start().await.context("starting session")? {
        println!("[{}] Recording session {}", ts_now(), id);
    }

    let deadline = async move {
        if duration == 0 {
            std::future::pending::<()>().await
        } else {
            sleep(Duration::from_secs(duration)).await
        }
    };
    tokio::pin!(deadline);

    let mut last_printed = 0;
    loop {
        tokio::select! {
            _ = &mut deadline => {
                println!("[{}] Duration reached, stopping...", ts_now());
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                println!("[{}] Interrupted, stopping...", ts_now());
                break;
            }
            Some(signal) = signals.recv() => report_signal(&signal, &mut last_printed),
        }
    }

    let Some(report) = coordinator.stop().await? else {
        return Ok(());
    };
    if let Some(err) = &report.persist_error {
        eprintln!("[{}] Session closed but not saved: {}", ts_now(), err);
    }

    let session = &report.session;
    println!("\n=== Session {} ===", session.id);
    println!("Duration: {}", format_duration(session.duration_seconds));
    println!("Steps: {}", session.steps);
    println!("Distance: {:.3} km", session.distance_km);
    println!("Average speed: {:.2} km/h", session.average_speed_kmh);
    if let Some(pace) = run_tracker_rs::geo_filter::pace_min_per_km(session.average_speed_kmh) {
        println!("Average pace: {}/km", format_pace(pace));
    }

    Ok(())
}

fn report_signal(signal: &TrackerSignal, last_printed: &mut u64) {
    match signal {
        TrackerSignal::AggregatesChanged(agg) => {
            if agg.elapsed_seconds != *last_printed && agg.elapsed_seconds % 5 == 0 {
                *last_printed = agg.elapsed_seconds;
                let pace = agg
                    .pace_min_per_km
                    .map(format_pace)
                    .unwrap_or_else(|| "--:--".to_string());
                println!(
                    "[{}] {} | {} steps | {:.3} km | {:.1} km/h | pace {}/km",
                    ts_now(),
                    format_duration(agg.elapsed_seconds),
                    agg.steps,
                    agg.distance_km,
                    agg.speed_kmh,
                    pace
                );
            }
        }
        TrackerSignal::Error(err) => log::warn!("[session] {}", err),
        TrackerSignal::StateChanged(state) => log::debug!("[session] state -> {}", state),
    }
}

fn list_sessions(config: &TrackerConfig) -> Result<()> {
    let store = JsonFileStore::open(&config.data_dir)?;
    let sessions = store.list_sessions()?;
    if sessions.is_empty() {
        println!("No sessions in {}", config.data_dir.display());
        return Ok(());
    }

    for session in sessions {
        let status = if session.is_open() { " (open)" } else { "" };
        println!(
            "{}  {}  {:>8}  {:>7.3} km  {:>5.2} km/h{}",
            session.id,
            session.start_time.format("%Y-%m-%d %H:%M"),
            format_duration(session.duration_seconds),
            session.distance_km,
            session.average_speed_kmh,
            status
        );
    }
    Ok(())
}

fn show_session(config: &TrackerConfig, id: &SessionId, full: bool) -> Result<()> {
    let store = JsonFileStore::open(&config.data_dir)?;
    let record = store
        .load_session(id)?
        .with_context(|| format!("no session {}", id))?;

    if full {
        println!("{}", record.to_json()?);
        return Ok(());
    }

    let summary = SessionSummary::from_record(&record);
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn delete_session(config: &TrackerConfig, id: &SessionId) -> Result<()> {
    let store = JsonFileStore::open(&config.data_dir)?;
    if store.delete_session(id)? {
        println!("Deleted {}", id);
    } else {
        println!("No session {}", id);
    }
    Ok(())
}

fn format_duration(seconds: u64) -> String {
    let (h, m, s) = (seconds / 3600, (seconds % 3600) / 60, seconds % 60);
    if h > 0 {
        format!("{}:{:02}:{:02}", h, m, s)
    } else {
        format!("{:02}:{:02}", m, s)
    }
}

fn format_pace(min_per_km: f64) -> String {
    let total_secs = (min_per_km * 60.0).round() as u64;
    format!("{}:{:02}", total_secs / 60, total_secs % 60)
}

fn ts_now() -> String {
    Utc::now().format("%H:%M:%S").to_string()
}
