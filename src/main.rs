use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use rustls::crypto::{ring, CryptoProvider};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use avatar_stream::audio::{enumerate_microphones, AlsaBackend};
use avatar_stream::config;
use avatar_stream::events::EventBus;
use avatar_stream::session::{
    ConnectionState, LoggingSink, RenderTargets, SinkKind, WsSessionFactory,
};
use avatar_stream::view::AvatarView;

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

/// avatar-stream command line arguments
#[derive(Parser, Debug)]
#[command(name = "avatar-stream")]
#[command(version, about = "Stream microphone audio to a remote AI avatar", long_about = None)]
struct CliArgs {
    /// Configuration file (TOML)
    #[arg(short = 'c', long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Session endpoint (overrides config and environment)
    #[arg(long, value_name = "URL")]
    url: Option<String>,

    /// ALSA capture device (overrides config and environment)
    #[arg(short = 'd', long, value_name = "NAME")]
    device: Option<String>,

    /// List capture devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Do not start recording automatically once connected
    #[arg(long)]
    no_auto_record: bool,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    init_logging(args.log_level, args.verbose);

    // Required by rustls 0.23+ for wss:// endpoints
    if CryptoProvider::install_default(ring::default_provider()).is_err() {
        tracing::debug!("rustls crypto provider already installed");
    }

    if args.list_devices {
        let devices = tokio::task::spawn_blocking(enumerate_microphones).await??;
        if devices.is_empty() {
            println!("No capture devices found");
        }
        for device in devices {
            println!(
                "{:<12} {} (rates: {:?}, mono: {})",
                device.name, device.description, device.sample_rates, device.supports_mono
            );
        }
        return Ok(());
    }

    tracing::info!("Starting avatar-stream v{}", env!("CARGO_PKG_VERSION"));

    let mut config = config::load(args.config.as_deref()).await?;
    if let Some(url) = args.url {
        config.session.url = url;
    }
    if let Some(device) = args.device {
        config.capture.device = device;
    }
    config.validate()?;

    tracing::info!("Session endpoint: {}", config.session.url);
    tracing::info!(
        "Capture device: {} @ {}Hz, {} samples per block",
        config.capture.device,
        config.capture.sample_rate,
        config.capture.block_size
    );

    let events = Arc::new(EventBus::new());
    spawn_event_logger(events.subscribe());

    // Headless: frames from the avatar are only counted
    let video_sink = Arc::new(LoggingSink::new(SinkKind::Video));
    let audio_sink = Arc::new(LoggingSink::new(SinkKind::Audio));
    let targets = RenderTargets::new();
    targets.attach_video(video_sink.clone());
    targets.attach_audio(audio_sink.clone());

    let view = AvatarView::new(
        &config,
        Arc::new(AlsaBackend::new()),
        Arc::new(WsSessionFactory),
        targets,
        events.clone(),
    );
    view.mount();

    tracing::info!("Commands: r = toggle recording, s = status, q = quit");

    let mut auto_record = !args.no_auto_record;
    let mut connection = view.connection_watch();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("Shutdown signal received");
                break;
            }
            changed = connection.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *connection.borrow_and_update();
                if state == ConnectionState::Connected && auto_record {
                    auto_record = false;
                    let recording = view.toggle_recording().await;
                    tracing::info!("Recording: {}", recording);
                }
                if state.is_terminal() {
                    tracing::warn!("{}", view.status_view().message);
                }
            }
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => match line.trim() {
                    "r" => {
                        let recording = view.toggle_recording().await;
                        tracing::info!("Recording: {}", recording);
                        if let Some(error) = view.mic_error_message() {
                            tracing::warn!("Microphone: {}", error);
                        }
                    }
                    "s" => println!("{}", serde_json::to_string_pretty(&view.status_view())?),
                    "q" => break,
                    "" => {}
                    other => tracing::warn!("Unknown command '{}' (use r, s or q)", other),
                },
                Ok(None) => {
                    tracing::debug!("stdin closed, waiting for Ctrl-C");
                    stdin_open = false;
                }
                Err(e) => {
                    tracing::warn!("Failed to read stdin: {}", e);
                    stdin_open = false;
                }
            },
        }
    }

    view.unmount().await;

    let dispatch = view.dispatch_stats();
    tracing::info!(
        "Audio chunks: {} forwarded, {} dropped, {} rejected; avatar frames: {} video, {} audio",
        dispatch.forwarded,
        dispatch.dropped,
        dispatch.rejected,
        video_sink.frames(),
        audio_sink.frames()
    );
    tracing::info!("avatar-stream stopped");
    Ok(())
}

/// Log every published event as JSON
fn spawn_event_logger(mut rx: broadcast::Receiver<avatar_stream::events::AvatarEvent>) {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(json) => tracing::info!("event: {}", json),
                    Err(e) => tracing::warn!("Failed to serialize event: {}", e),
                },
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("Event logger lagged, {} events skipped", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

/// Initialize logging with tracing
fn init_logging(level: LogLevel, verbose_count: u8) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "avatar_stream=error,tungstenite=error",
        LogLevel::Warn => "avatar_stream=warn,tungstenite=warn",
        LogLevel::Info => "avatar_stream=info,tungstenite=warn",
        LogLevel::Verbose => "avatar_stream=debug,tungstenite=info",
        LogLevel::Debug => "avatar_stream=debug,tungstenite=debug",
        LogLevel::Trace => "avatar_stream=trace,tungstenite=debug",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}
