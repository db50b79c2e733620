//! Demo worker
//!
//! Simulates a job in fixed steps, reports progress to the agent and stops
//! cooperatively when the agent cancels it.
//!
//! Environment: `WORKERD_CONFIG` (TOML file), the `WORKERD_*` connection
//! variables, `WORKERD_DEMO_STEPS` and `WORKERD_DEMO_FAIL_AT`.

use std::env;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::time::{sleep, Duration};
use tracing::{info, warn};
use workerd_control::{ControlConfig, ControlDaemon, LifecycleState};

const ENV_CONFIG: &str = "WORKERD_CONFIG";
const ENV_STEPS: &str = "WORKERD_DEMO_STEPS";
const ENV_FAIL_AT: &str = "WORKERD_DEMO_FAIL_AT";
const STEP_DELAY: Duration = Duration::from_millis(200);

#[tokio::main]
async fn main() -> Result<()> {
    let filter = env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    let mut config = match env::var(ENV_CONFIG) {
        Ok(path) => ControlConfig::load(Path::new(&path))
            .with_context(|| format!("loading worker config from {}", path))?,
        Err(_) => ControlConfig::default(),
    };
    config.apply_env();
    config.validate()?;

    let steps = env_u32(ENV_STEPS).unwrap_or(10).max(1);
    let fail_at = env_u32(ENV_FAIL_AT);

    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = stop.clone();
    let daemon = ControlDaemon::builder(config)
        .on_cancel(move || stop_flag.store(true, Ordering::SeqCst))
        .connect()
        .await?;
    info!(identity = %daemon.identity(), steps, "Demo job started");

    let outcome = run_job(&daemon, &stop, steps, fail_at).await;
    if let Err(err) = &outcome {
        daemon.report_failure(err.to_string());
    }
    daemon.shutdown().await;
    info!(state = %daemon.state(), "Demo worker exiting");
    outcome
}

async fn run_job(
    daemon: &ControlDaemon,
    stop: &AtomicBool,
    steps: u32,
    fail_at: Option<u32>,
) -> Result<()> {
    for step in 1..=steps {
        if stop.load(Ordering::SeqCst) {
            info!(step, "Job cancelled by agent");
            return Ok(());
        }
        if daemon.state() == LifecycleState::Faulted {
            warn!(step, "Control connection lost; abandoning job");
            return Ok(());
        }
        if fail_at == Some(step) {
            bail!("simulated failure at step {}", step);
        }
        sleep(STEP_DELAY).await;
        daemon.report_progress(f64::from(step) / f64::from(steps))?;
    }
    Ok(())
}

fn env_u32(key: &str) -> Option<u32> {
    let raw = env::var(key).ok()?;
    match raw.trim().parse::<u32>() {
        Ok(value) => Some(value),
        Err(err) => {
            warn!("Invalid {} value '{}': {}", key, raw, err);
            None
        }
    }
}
