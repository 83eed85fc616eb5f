//! Kiosk Session Demo
//!
//! Walks one booth session end to end against the simulated camera:
//! 1. Spawn the session controller with the kiosk property map
//! 2. Start acquisition and wait for the session to go active
//! 3. Count live view frames for a moment
//! 4. Fire a handful of captures and print each capture-ready event
//! 5. Shut down and show the final status
//!
//! Usage: cargo run -p demos --bin kiosk_session -- --captures 3

use anyhow::{Context, Result};
use booth_camera::SimulatedDriver;
use booth_reclaim::ReclaimConfig;
use booth_session::{OutboundEvent, SessionConfig, SessionController, SessionState};
use clap::Parser;
use log::info;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast::error::RecvError;
use tokio::time::timeout;

const ACTIVE_WAIT: Duration = Duration::from_secs(10);
const PREVIEW_WINDOW: Duration = Duration::from_secs(1);

#[derive(Parser)]
struct CliArgs {
    /// Session config (JSON); defaults are used when omitted
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, default_value = "3")]
    captures: usize,

    /// Override retry.max_attempts
    #[arg(long)]
    max_attempts: Option<u32>,

    /// Where downloaded captures land
    #[arg(long, default_value = "./images/demo")]
    capture_dir: PathBuf,
}

fn load_config(args: &CliArgs) -> Result<SessionConfig> {
    let mut config = match &args.config {
        Some(path) => SessionConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        // The simulated body does not need anything reclaimed.
        None => SessionConfig {
            reclaim: ReclaimConfig {
                process_patterns: Vec::new(),
                settle_ms: 0,
            },
            ..SessionConfig::default()
        },
    };
    config.capture_dir = args.capture_dir.clone();
    if let Some(max_attempts) = args.max_attempts {
        config.retry.max_attempts = max_attempts;
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = CliArgs::parse();
    let config = load_config(&args)?;
    println!("🔧 Session config:\n{}", serde_json::to_string_pretty(&config)?);

    let driver = SimulatedDriver::new();
    let (session, controller) =
        SessionController::spawn_with_process_reclaimer(Arc::new(driver.clone()), config)?;
    let mut events = session.subscribe();

    println!("📷 Starting session...");
    session.start().await?;
    let status = timeout(ACTIVE_WAIT, session.wait_for(|s| {
        matches!(s.state, SessionState::Active | SessionState::Failed)
    }))
    .await
    .context("session never settled")??;
    if status.state == SessionState::Failed {
        anyhow::bail!("camera unavailable: {:?}", status.last_error);
    }
    println!("✅ Active on {}", status.device.unwrap_or_default());

    let started = Instant::now();
    let mut frames = 0usize;
    while started.elapsed() < PREVIEW_WINDOW {
        match timeout(PREVIEW_WINDOW, events.recv()).await {
            Ok(Ok(OutboundEvent::PreviewFrame(_))) => frames += 1,
            Ok(Ok(_)) | Ok(Err(RecvError::Lagged(_))) => {}
            Ok(Err(RecvError::Closed)) | Err(_) => break,
        }
    }
    println!("🎞️  {frames} live view frames in {PREVIEW_WINDOW:?}");

    for shot in 1..=args.captures {
        session.trigger_capture().await?;
        loop {
            match timeout(ACTIVE_WAIT, events.recv()).await {
                Ok(Ok(OutboundEvent::CaptureReady(data))) => {
                    println!("📸 Capture {shot}: {} bytes of data URL", data.len());
                    break;
                }
                Ok(Ok(_)) | Ok(Err(RecvError::Lagged(_))) => continue,
                Ok(Err(RecvError::Closed)) => anyhow::bail!("controller went away"),
                Err(_) => {
                    println!("⚠️  Capture {shot} never arrived");
                    break;
                }
            }
        }
    }

    session.shutdown().await?;
    let status = session.query_status();
    info!("final status: {}", serde_json::to_string(&status)?);
    println!("🏁 Session {} ({} handles still open)", status.state, driver.open_handles());

    drop(session);
    controller.await?;
    Ok(())
}
