use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use camola_serve::encode::{Compression, OutputFormat};
use camola_serve::lifecycle::{self, Coordinator, Exit};
use camola_serve::{Camera, CameraConfig, ServeConfig};
use clap::Parser;
use tokio::net::TcpListener;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Exposure time (in us)
    #[arg(short, long, env = "CAMOLA_EXPOSURE", default_value_t = 103_656.0)]
    exposure: f64,

    /// Gain (in dB)
    #[arg(short, long, env = "CAMOLA_GAIN", default_value_t = 10.000_000_15)]
    gain: f64,

    /// Address to serve frames on
    #[arg(short, long, env = "CAMOLA_LISTEN", default_value = "0.0.0.0:8000")]
    listen: SocketAddr,

    /// Device path, index or stub://WIDTHxHEIGHT (default: first device found)
    #[arg(short, long, env = "CAMOLA_DEVICE")]
    device: Option<String>,

    /// Acquisition buffers handed to the device
    #[arg(long, default_value_t = 2)]
    buffers: usize,

    /// Acquire timeout in milliseconds
    #[arg(long, default_value_t = 1000)]
    timeout_ms: u64,

    /// Target frames per second (0 = as fast as the device allows)
    #[arg(long, default_value_t = 0)]
    frame_rate: u32,

    /// Image format served to clients
    #[arg(long, value_enum, default_value_t = OutputFormat::Png)]
    format: OutputFormat,

    /// PNG compression level
    #[arg(long, value_enum, default_value_t = Compression::Fast)]
    compression: Compression,

    /// JPEG quality (1-100)
    #[arg(long, default_value_t = 90)]
    jpeg_quality: u8,

    /// Delay after starting acquisition before reading frames, in milliseconds
    #[arg(long, default_value_t = 1000)]
    settle_ms: u64,

    /// Seconds to wait for in-flight work on shutdown
    #[arg(long, default_value_t = 5)]
    grace_secs: u64,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

impl From<Args> for ServeConfig {
    fn from(args: Args) -> Self {
        Self {
            camera: CameraConfig {
                device: args.device,
                exposure_us: args.exposure,
                gain_db: args.gain,
                frame_rate: args.frame_rate,
                buffers: args.buffers,
                acquire_timeout: Duration::from_millis(args.timeout_ms),
                settle: Duration::from_millis(args.settle_ms),
                format: args.format,
                compression: args.compression,
                jpeg_quality: args.jpeg_quality,
            },
            listen: args.listen,
            grace: Duration::from_secs(args.grace_secs),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    let config = ServeConfig::from(args);

    let camera = Camera::open(&config.camera).context("Failed to open camera")?;

    let listener = TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("Failed to listen on {}", config.listen))?;

    let signals = lifecycle::listen_for_signals().context("Failed to install signal handlers")?;

    let exit = Coordinator::new(camera, listener, config.grace)
        .run(signals)
        .await;

    tracing::info!("Quitting.");
    match exit {
        Exit::Clean => Ok(()),
        Exit::Failed => bail!("Camera stopped with an error"),
        Exit::Forced => {
            // Blocking device reads would otherwise hold up runtime teardown
            std::process::exit(1);
        }
    }
}
