//! Capture daemon: one session per invocation.
//!
//! Runs a capture session until interrupted. Exits non-zero only on fatal
//! transport or configuration failure; sporadic malformed packets and
//! storage faults are logged, counted, and survived.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use xcapture::{CaptureConfig, CaptureSession, ConfigSnapshot};

#[derive(Debug, Parser)]
#[command(name = "xcapture-daemon", about = "X-engine stream capture daemon")]
struct Args {
    /// Capture configuration file (TOML); layered under XCAPTURE_* env vars.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Hardware-layer configuration snapshot (TOML), as exported by the
    /// control tooling at arm time.
    #[arg(short, long)]
    snapshot: PathBuf,
}

fn load_snapshot(path: &PathBuf) -> xcapture::Result<ConfigSnapshot> {
    config::Config::builder()
        .add_source(config::File::from(path.as_path()))
        .build()
        .and_then(|c| c.try_deserialize::<ConfigSnapshot>())
        .map_err(|e| xcapture::CaptureError::Config(format!("snapshot {}: {e}", path.display())))
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let result = run(args).await;
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "capture session failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> xcapture::Result<()> {
    let config = CaptureConfig::load(args.config.as_deref())?;
    let snapshot = load_snapshot(&args.snapshot)?;

    let session = CaptureSession::start(config, snapshot).await?;

    let stop = session.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, stopping session");
            stop.stop();
        }
    });

    // Returns on interrupt-initiated drain or a fatal worker error.
    session.wait().await
}
