use std::net::SocketAddr;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use autocast::capture::TestPatternSource;
use autocast::config::{ActivationConfig, CodecMode, StreamConfig};
use autocast::events::{EventBus, StreamEvent};
use autocast::stream::PipelineController;
use autocast::transport::tcp::{TcpTransportSink, DEFAULT_VIEWER_QUEUE};
use autocast::video::encoder::EncoderRegistry;
use autocast::video::format::PixelLayout;

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

/// autocast command line arguments
#[derive(Parser, Debug)]
#[command(name = "autocast")]
#[command(version, about = "Stream a capture source only while viewers are connected", long_about = None)]
struct CliArgs {
    /// Source name shown in logs and events
    #[arg(short = 'n', long, value_name = "NAME", default_value = "autocast")]
    name: String,

    /// Address viewers connect to
    #[arg(short = 'a', long, value_name = "ADDRESS", default_value = "0.0.0.0:5600")]
    listen: SocketAddr,

    /// Capture width
    #[arg(long, default_value_t = 1280)]
    width: u32,

    /// Capture height
    #[arg(long, default_value_t = 720)]
    height: u32,

    /// Target frame rate (29.97 and other NTSC rates are exact)
    #[arg(short = 'f', long, default_value_t = 30.0)]
    fps: f64,

    /// Output codec (raw, h264, hevc)
    #[arg(short = 'c', long, default_value = "raw")]
    codec: CodecMode,

    /// Encoder bitrate in bits per second (derived from resolution and rate if unset)
    #[arg(short = 'b', long, value_name = "BPS")]
    bitrate: Option<u64>,

    /// Pixel layout of the test pattern (bgra, i420, i420-full, nv12, nv12-full)
    #[arg(long, value_name = "LAYOUT", default_value = "nv12")]
    pattern_format: PixelLayout,

    /// Capture continuously, even with no viewers
    #[arg(long)]
    always_on: bool,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl CliArgs {
    fn stream_config(&self) -> StreamConfig {
        StreamConfig {
            source_name: self.name.clone(),
            width: self.width,
            height: self.height,
            fps: self.fps,
            codec: self.codec,
            bitrate_bps: self.bitrate,
            activation: ActivationConfig {
                always_on: self.always_on,
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_level, args.verbose);

    tracing::info!("Starting autocast v{}", env!("CARGO_PKG_VERSION"));

    let config = args.stream_config();
    if let Err(e) = config.validate() {
        tracing::error!("{}", e);
        std::process::exit(2);
    }
    let config = Arc::new(config);

    let registry = Arc::new(EncoderRegistry::with_builtin());
    for encoder in registry.encoders() {
        tracing::info!(
            "Encoder backend: {} ({}, {})",
            encoder.name,
            encoder.codec,
            if encoder.is_hardware { "hardware" } else { "software" }
        );
    }
    if config.codec.is_encoded() && !registry.supports(config.codec) {
        tracing::warn!(
            "No {} encoder available; frames will be dropped until one appears",
            config.codec
        );
    }

    let sink = match TcpTransportSink::bind(args.listen, DEFAULT_VIEWER_QUEUE).await {
        Ok(sink) => Arc::new(sink),
        Err(e) => {
            tracing::error!("Cannot start transport: {}", e);
            std::process::exit(1);
        }
    };
    let source = Arc::new(TestPatternSource::new(config.source_name.clone(), args.pattern_format)?);

    let events = Arc::new(EventBus::new());
    spawn_event_logger(events.subscribe());

    let controller = PipelineController::new(
        config.clone(),
        source,
        sink.clone(),
        registry,
        events,
    );
    if let Err(e) = controller.start().await {
        tracing::error!("Cannot start stream: {}", e);
        controller.shutdown().await;
        sink.shutdown().await;
        std::process::exit(if e.is_fatal() { 1 } else { 2 });
    }

    tracing::info!("Viewers can connect to {}", sink.local_addr());

    shutdown_signal().await;
    tracing::info!("Shutting down...");

    controller.shutdown().await;
    sink.shutdown().await;

    let stats = controller.stats();
    tracing::info!(
        "Sent {} frames, dropped {}",
        stats.pipeline.frames_sent,
        stats.pipeline.total_dropped()
    );
    Ok(())
}

/// Initialize logging
fn init_logging(level: LogLevel, verbose_count: u8) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "autocast=error",
        LogLevel::Warn => "autocast=warn",
        LogLevel::Info => "autocast=info",
        LogLevel::Verbose => "autocast=debug,openh264=info",
        LogLevel::Debug => "autocast=debug,openh264=debug",
        LogLevel::Trace => "autocast=trace,openh264=debug",
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

/// Log stream events that are not already reported where they happen
fn spawn_event_logger(mut rx: broadcast::Receiver<StreamEvent>) {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event @ StreamEvent::StatsUpdate { .. }) => {
                    if let Ok(json) = serde_json::to_string(&event) {
                        tracing::trace!("{}", json);
                    }
                }
                Ok(event) => {
                    tracing::debug!("Event {}", event.event_name());
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::debug!("Event logger lagged, skipped {} events", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
}
