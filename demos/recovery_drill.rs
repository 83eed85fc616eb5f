//! Recovery Drill
//!
//! Runs the controller against a simulated camera and breaks it on
//! purpose, printing every state change as the controller reclaims and
//! reacquires:
//!   * fatal live view error
//!   * driver fault pushed through the event sink
//!   * hung live view poll
//!   * body unplugged until retries run out, then plugged back in
//!
//! Usage: cargo run -p demos --bin recovery_drill

use anyhow::{Context, Result};
use booth_camera::{SimOp, SimulatedDriver};
use booth_reclaim::ReclaimConfig;
use booth_session::{Backoff, SessionConfig, SessionController, SessionHandle, SessionState};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};

const SETTLE_WAIT: Duration = Duration::from_secs(15);

#[derive(Parser)]
struct CliArgs {
    /// Session config (JSON); drill-friendly timings are used when omitted
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override retry.max_attempts
    #[arg(long)]
    max_attempts: Option<u32>,
}

fn drill_config() -> SessionConfig {
    let mut config = SessionConfig {
        preview_period_ms: 20,
        device_timeout_ms: 500,
        capture_dir: PathBuf::from("./images/drill"),
        reclaim: ReclaimConfig {
            process_patterns: Vec::new(),
            settle_ms: 100,
        },
        ..SessionConfig::default()
    };
    config.retry.backoff = Backoff::Exponential {
        initial_ms: 100,
        max_ms: 800,
    };
    config
}

async fn settle(session: &SessionHandle, label: &str) -> Result<SessionState> {
    // Let the controller notice the fault before waiting for a resting state.
    sleep(Duration::from_millis(50)).await;
    let status = timeout(
        SETTLE_WAIT,
        session.wait_for(|s| matches!(s.state, SessionState::Active | SessionState::Failed)),
    )
    .await
    .with_context(|| format!("{label}: controller did not settle"))??;
    let icon = if status.state == SessionState::Active { "✅" } else { "❌" };
    println!(
        "{icon} {label}: {} (attempts {}, last error {:?})",
        status.state, status.attempts, status.last_error
    );
    Ok(status.state)
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = CliArgs::parse();
    let mut config = match &args.config {
        Some(path) => SessionConfig::from_file(path)?,
        None => drill_config(),
    };
    if let Some(max_attempts) = args.max_attempts {
        config.retry.max_attempts = max_attempts;
    }

    let driver = SimulatedDriver::new();
    let (session, controller) =
        SessionController::spawn_with_process_reclaimer(Arc::new(driver.clone()), config)?;

    let mut transitions = session.watch_status();
    let printer = tokio::spawn(async move {
        let mut last = None;
        while transitions.changed().await.is_ok() {
            let state = transitions.borrow_and_update().state;
            if last != Some(state) {
                println!("   ↳ {state}");
                last = Some(state);
            }
        }
    });

    session.start().await?;
    settle(&session, "cold start").await?;

    println!("💥 Fatal live view error");
    driver.fail_polls(1, true);
    settle(&session, "after live view crash").await?;

    println!("💥 Driver fault");
    driver.inject_fault("usb bus reset");
    settle(&session, "after driver fault").await?;

    println!("💥 Live view hangs");
    driver.hang(SimOp::Poll);
    sleep(Duration::from_millis(800)).await;
    driver.unhang(SimOp::Poll);
    settle(&session, "after hang").await?;

    println!("🔌 Body unplugged");
    driver.detach();
    driver.fail_polls(1, true);
    settle(&session, "unplugged").await?;

    println!("🔌 Body plugged back in");
    driver.attach();
    session.start().await?;
    settle(&session, "restart").await?;

    println!(
        "🏁 opens {}, closes {}, handles open {}",
        driver.open_calls(),
        driver.close_calls(),
        driver.open_handles()
    );
    session.shutdown().await?;
    drop(session);
    controller.await?;
    printer.await?;
    Ok(())
}
