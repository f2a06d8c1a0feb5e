use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};

use safety_monitor_rs::audio::{SegmentEnergyExtractor, SimulatedMicrophone};
use safety_monitor_rs::fusion::{FixedLocation, Location, LocationProvider, NoLocation};
use safety_monitor_rs::notifier::{JsonlSurface, LogSurface};
use safety_monitor_rs::permissions::StaticPermissions;
use safety_monitor_rs::sensors::{AccelSource, SimulatedAccelSource, SourceFactory, TermuxAccelSource};
use safety_monitor_rs::{
    AlertNotifier, BackgroundExecutionHost, HostCollaborators, ManualTriggerPolicy, RiskFusionClient,
    ServiceConfig,
};

#[derive(Parser, Debug)]
#[command(name = "safety_monitor")]
#[command(about = "Background fall detection with audio verification and remote risk fusion", long_about = None)]
struct Args {
    /// JSON config file; flags below override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Duration in seconds (0 = until Ctrl-C)
    #[arg(long, value_name = "SECONDS", default_value = "0")]
    duration: u64,

    /// Risk fusion service base URL
    #[arg(long)]
    endpoint: Option<String>,

    /// Trigger threshold in m/s²
    #[arg(long)]
    threshold: Option<f64>,

    /// Manual SOS policy (force_alert, score_threshold, follow_decision)
    #[arg(long)]
    manual_policy: Option<ManualTriggerPolicy>,

    /// Use the simulated accelerometer with an impact every N seconds
    #[arg(long, value_name = "SECONDS")]
    simulate_impacts: Option<u64>,

    /// Output directory
    #[arg(long)]
    output_dir: Option<String>,

    #[arg(long, requires = "lng", allow_hyphen_values = true)]
    lat: Option<f64>,

    #[arg(long, requires = "lat", allow_hyphen_values = true)]
    lng: Option<f64>,
}

enum Command {
    Sos,
    Foreground(bool),
    Status,
}

fn parse_command(line: &str) -> Option<Command> {
    match line.trim().to_ascii_lowercase().as_str() {
        "sos" => Some(Command::Sos),
        "bg" => Some(Command::Foreground(false)),
        "fg" => Some(Command::Foreground(true)),
        "status" => Some(Command::Status),
        _ => None,
    }
}

async fn read_commands(tx: mpsc::Sender<Command>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        match parse_command(&line) {
            Some(command) => {
                if tx.send(command).await.is_err() {
                    break;
                }
            }
            None => log::warn!("Unknown command {:?} (expected sos, bg, fg, status)", line.trim()),
        }
    }
}

fn pick_sources(config: &ServiceConfig, simulate_impacts: Option<u64>) -> SourceFactory {
    if simulate_impacts.is_none() {
        let mut probe = TermuxAccelSource::new();
        match probe.open() {
            Ok(()) => {
                probe.close();
                log::info!("Using termux-sensor accelerometer");
                return Arc::new(|| Box::new(TermuxAccelSource::new()) as Box<dyn AccelSource>);
            }
            Err(e) => log::warn!("termux-sensor unavailable ({}), using simulated accelerometer", e),
        }
    }

    let impact_every = simulate_impacts.map(|secs| secs * 1000 / config.sample_interval_ms.max(1));
    log::info!(
        "Simulated accelerometer{}",
        simulate_impacts
            .map(|s| format!(", impact every {s}s"))
            .unwrap_or_default()
    );
    Arc::new(move || Box::new(SimulatedAccelSource::new(impact_every)) as Box<dyn AccelSource>)
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => ServiceConfig::from_json_file(path)?,
        None => ServiceConfig::default(),
    };
    if let Some(endpoint) = args.endpoint.clone() {
        config.endpoint = endpoint;
    }
    if let Some(threshold) = args.threshold {
        config.trigger_threshold = threshold;
    }
    if let Some(policy) = args.manual_policy {
        config.manual_trigger_policy = policy;
    }
    if let Some(dir) = args.output_dir.clone() {
        config.output_dir = dir;
    }
    config.validate()?;

    log::info!("Safety Monitor starting");
    log::info!("  Duration: {} seconds (0=continuous)", args.duration);
    log::info!("  Endpoint: {}", config.endpoint);
    log::info!("  Threshold: {:.1} m/s²", config.trigger_threshold);
    log::info!("  Manual policy: {:?}", config.manual_trigger_policy);
    log::info!("  Output Dir: {}", config.output_dir);

    std::fs::create_dir_all(&config.output_dir)
        .with_context(|| format!("creating {}", config.output_dir))?;

    let location: Arc<dyn LocationProvider> = match (args.lat, args.lng) {
        (Some(latitude), Some(longitude)) => Arc::new(FixedLocation(Location { latitude, longitude })),
        _ => Arc::new(NoLocation),
    };
    let notifier = Arc::new(AlertNotifier::new(vec![
        Box::new(LogSurface),
        Box::new(JsonlSurface::new(PathBuf::from(&config.output_dir).join("alerts.jsonl"))),
    ]));
    let collaborators = HostCollaborators {
        sources: pick_sources(&config, args.simulate_impacts),
        microphone: Arc::new(SimulatedMicrophone::new(0.2)),
        extractor: Arc::new(SegmentEnergyExtractor),
        permissions: Arc::new(StaticPermissions::granted()),
        evaluator: Arc::new(RiskFusionClient::from_config(&config)?),
        location,
        notifier,
    };

    let mut host = BackgroundExecutionHost::new(config, collaborators);
    host.start()?;
    log::info!("Monitoring. Type 'sos', 'bg', 'fg' or 'status' and press Enter");

    let (command_tx, mut commands) = mpsc::channel(8);
    tokio::spawn(read_commands(command_tx));

    let deadline = async {
        if args.duration > 0 {
            sleep(Duration::from_secs(args.duration)).await;
        } else {
            std::future::pending::<()>().await;
        }
    };
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => {
                log::info!("Duration reached, stopping...");
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                log::info!("Interrupted, stopping...");
                break;
            }
            Some(command) = commands.recv() => match command {
                Command::Sos => {
                    if let Err(e) = host.request_manual() {
                        log::warn!("SOS not accepted: {}", e);
                    }
                }
                Command::Foreground(foreground) => host.set_foreground(foreground),
                Command::Status => log::info!("{}", host.status().summary()),
            },
        }
    }

    host.stop().await?;
    let status = host.status();
    let summary_path = PathBuf::from(&host.config().output_dir).join(format!(
        "summary_{}.json",
        chrono::Utc::now().format("%Y%m%d_%H%M%S")
    ));
    std::fs::write(&summary_path, serde_json::to_string_pretty(&status)?)?;
    log::info!("Summary saved to {}", summary_path.display());
    log::info!("{}", status.summary());
    Ok(())
}
