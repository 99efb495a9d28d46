use anyhow::Result;
use clap::Parser;
use framepulse::{
    ActivitySource, ControllerState, EventBus, FileCredentials, FramepulseConfig, HttpTransport,
    MachineContext, TelemetryQueue, UploadCoordinator, UploadWorker,
};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "framepulse")]
#[command(about = "Game performance telemetry pipeline with durable uploads")]
#[command(version)]
#[command(long_about = "Collects per-frame timing samples, smooths them into live FPS and \
1% low metrics, gates session recording on player activity, and ships finalized session \
summaries to a remote endpoint through a crash-safe write-ahead-logged upload queue.")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "framepulse.toml", help = "Path to TOML configuration file")]
    config: String,

    /// Enable debug logging (most verbose)
    #[arg(short, long, help = "Enable debug level logging")]
    debug: bool,

    /// Enable verbose logging (info level)
    #[arg(short, long, help = "Enable verbose info level logging")]
    verbose: bool,

    /// Enable quiet mode (errors only)
    #[arg(short, long, help = "Enable quiet mode - only log errors")]
    quiet: bool,

    /// Validate configuration and exit
    #[arg(long, help = "Validate configuration file and exit without starting the pipeline")]
    validate_config: bool,

    /// Print default configuration and exit
    #[arg(long, help = "Print default configuration in TOML format and exit")]
    print_config: bool,

    /// Override log format (json, pretty, compact)
    #[arg(long, value_name = "FORMAT", help = "Log output format: json, pretty, or compact")]
    log_format: Option<String>,

    /// Name reported for the simulated game session
    #[arg(long, default_value = "Simulated Game", help = "Game name attached to session payloads")]
    game: String,
}

/// Stand-in activity probe for the simulated capture source.
///
/// Reports the game always foregrounded with held gameplay keys, so the
/// gate activates as soon as polling starts. A platform probe (foreground
/// window + keyboard + controller state) replaces this on real hardware.
struct SimulatedActivity;

impl ActivitySource for SimulatedActivity {
    fn is_game_in_foreground(&self) -> bool {
        true
    }

    fn is_key_down(&self, _key: u16) -> bool {
        true
    }

    fn controller_state(&self, _index: usize) -> Option<ControllerState> {
        None
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Handle special modes that don't require full initialization
    if args.print_config {
        print_default_config()?;
        return Ok(());
    }

    // Initialize logging
    init_logging(&args)?;

    info!("Starting framepulse v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration file: {}", args.config);

    // Load and validate configuration
    let config = match FramepulseConfig::load_from_file(&args.config) {
        Ok(config) => {
            info!("Configuration loaded successfully from: {}", args.config);
            config
        }
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    if args.validate_config {
        match config.validate() {
            Ok(()) => {
                info!("Configuration validation successful");
                println!("✓ Configuration is valid");
                return Ok(());
            }
            Err(e) => {
                error!("Configuration validation failed: {}", e);
                eprintln!("✗ Configuration validation failed: {}", e);
                std::process::exit(1);
            }
        }
    }
    config.validate()?;

    run_pipeline(config, &args.game).await
}

async fn run_pipeline(config: FramepulseConfig, game: &str) -> Result<()> {
    let shutdown = CancellationToken::new();
    let event_bus = EventBus::new(config.system.event_bus_capacity);

    // Durable queue: replay anything a previous run left undelivered
    let queue = Arc::new(TelemetryQueue::new(
        &config.queue.wal_path,
        config.queue.capacity,
    ));
    let restored = queue.restore().await?;
    if restored > 0 {
        info!("Resuming delivery of {} records from a previous run", restored);
    }

    let transport = Arc::new(HttpTransport::new(
        config.upload.url.clone(),
        Duration::from_secs(config.upload.request_timeout_secs),
    ));
    let credentials = Arc::new(FileCredentials::new(&config.upload.token_path));
    let context = MachineContext::default();

    let worker = UploadWorker::spawn(
        config.upload.clone(),
        Arc::clone(&queue),
        transport.clone(),
        credentials.clone(),
        context.clone(),
        event_bus.clone(),
        &shutdown,
    );

    let mut coordinator = UploadCoordinator::new(
        config.clone(),
        event_bus,
        Arc::clone(&queue),
        transport,
        credentials,
    );
    coordinator.configure_environment(context);

    // Synthetic ~60 FPS capture source until a real frame provider is wired in
    let (sample_tx, sample_rx) = mpsc::channel(256);
    let generator_token = shutdown.clone();
    let generator = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(16));
        loop {
            tokio::select! {
                _ = generator_token.cancelled() => break,
                _ = interval.tick() => {
                    let frametime = 16.0 + rand::rng().random_range(0.0..2.0);
                    if sample_tx.send(frametime).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    coordinator.start(game, Arc::new(SimulatedActivity), sample_rx);
    info!("Pipeline running, press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");

    shutdown.cancel();
    let _ = generator.await;

    // Final best-effort upload of whatever the session accumulated
    let outcome = coordinator.stop_and_upload().await;
    info!("Final session upload outcome: {:?}", outcome);

    worker.shutdown().await;
    info!("framepulse stopped");
    Ok(())
}

fn init_logging(args: &Args) -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

    // Determine log level based on flags
    let log_level = if args.debug {
        "debug"
    } else if args.verbose {
        "info"
    } else if args.quiet {
        "error"
    } else {
        "warn"
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("framepulse={}", log_level)));

    let fmt_layer = match args.log_format.as_deref() {
        Some("json") => fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .boxed(),
        Some("compact") => fmt::layer()
            .compact()
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .boxed(),
        Some("pretty") | None => fmt::layer()
            .pretty()
            .with_target(true)
            .with_thread_ids(args.debug)
            .with_file(args.debug)
            .with_line_number(args.debug)
            .boxed(),
        Some(format) => {
            eprintln!("Warning: Unknown log format '{}', using default", format);
            fmt::layer()
                .with_target(true)
                .with_thread_ids(args.debug)
                .with_file(args.debug)
                .with_line_number(args.debug)
                .boxed()
        }
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(env_filter)
        .init();

    Ok(())
}

/// Print default configuration in TOML format
fn print_default_config() -> Result<()> {
    println!("# Framepulse Configuration File");
    println!("# This is the default configuration with all available options");
    println!();
    println!("{}", toml::to_string_pretty(&FramepulseConfig::default())?);
    Ok(())
}
