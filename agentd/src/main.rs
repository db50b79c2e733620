//! agentd
//!
//! Reference agent service for worker control connections. Accepts workers,
//! checks their `register` frame, logs status and progress, acknowledges
//! status frames and can cancel a worker after a number of progress reports.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::signal;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use workerd_control::auth::{self, Registration};
use workerd_control::codec::{self, DEFAULT_MAX_FRAME_BYTES};
use workerd_control::frame::{
    ACTION_ACK, ACTION_CANCEL, ACTION_PROGRESS, ACTION_REGISTER, ACTION_STATUS,
};
use workerd_control::ipc::{BoxedStream, DEFAULT_AGENT_ADDR};
use workerd_control::AgentAddress;

/// Registrations older or newer than this are rejected when signed.
const MAX_CLOCK_SKEW_SECS: u64 = 300;

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

#[derive(Parser, Debug)]
#[command(name = "agentd", version, about = "Agent service for worker control connections")]
struct Cli {
    /// Socket path or tcp://host:port address
    #[arg(long, default_value = DEFAULT_AGENT_ADDR)]
    socket: String,

    /// Shared registration secret (or use AGENTD_SECRET / WORKERD_SECRET)
    #[arg(long)]
    secret: Option<String>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Do not acknowledge status frames
    #[arg(long)]
    no_ack: bool,

    /// Cancel each worker after it has reported progress N times
    #[arg(long, value_name = "N")]
    cancel_after: Option<u32>,
}

#[derive(Clone, Debug)]
struct Policy {
    secret: Option<Arc<str>>,
    ack: bool,
    cancel_after: Option<u32>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(log_filter(cli.debug, std::env::var("RUST_LOG").ok()))
        .with_writer(io::stderr)
        .init();

    let secret = cli
        .secret
        .or_else(|| std::env::var("AGENTD_SECRET").ok())
        .or_else(|| std::env::var("WORKERD_SECRET").ok())
        .filter(|secret| !secret.trim().is_empty());
    if secret.is_none() {
        warn!("No secret configured - worker registrations are not verified");
    }
    let policy = Policy {
        secret: secret.map(Arc::from),
        ack: !cli.no_ack,
        cancel_after: cli.cancel_after.filter(|n| *n > 0),
    };

    let address: AgentAddress = cli.socket.parse()?;
    let listener = address
        .bind()
        .await
        .with_context(|| format!("binding {}", address))?;
    info!(%address, ack = policy.ack, cancel_after = ?policy.cancel_after, "agentd listening");

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    spawn_signal_handlers(Arc::new(shutdown_tx));

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok(stream) => {
                    let policy = policy.clone();
                    let shutdown = shutdown_rx.clone();
                    tokio::spawn(async move {
                        if let Err(err) = handle_connection(stream, policy, shutdown).await {
                            warn!("Worker connection ended with error: {:#}", err);
                        }
                    });
                }
                Err(err) => error!("Failed to accept worker connection: {}", err),
            },
        }
    }

    drop(listener);
    info!("agentd stopped");
    Ok(())
}

async fn handle_connection(
    stream: BoxedStream,
    policy: Policy,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let (read_half, mut writer) = tokio::io::split(stream);
    let mut lines = BufReader::new(read_half).lines();
    let mut worker: Option<String> = None;
    let mut progress_reports = 0u32;
    let mut cancel_sent = false;

    loop {
        let line = tokio::select! {
            _ = shutdown.changed() => break,
            line = lines.next_line() => line.context("reading worker frame")?,
        };
        let Some(line) = line else {
            break;
        };
        if line.trim().is_empty() {
            continue;
        }
        let parts = match codec::decode_bounded(line.as_bytes(), DEFAULT_MAX_FRAME_BYTES) {
            Ok(parts) => parts,
            Err(err) => {
                warn!(worker = ?worker, "Dropping worker frame: {}", err);
                continue;
            }
        };
        let Some((action, args)) = parts.split_first() else {
            continue;
        };

        match action.as_str() {
            ACTION_REGISTER => match check_registration(args, &policy) {
                Some(identity) => {
                    info!(%identity, "Worker registered");
                    worker = Some(identity);
                }
                None => return Ok(()),
            },
            _ if worker.is_none() => {
                warn!(%action, "Frame before registration; closing connection");
                return Ok(());
            }
            ACTION_STATUS => {
                let state = args.first().map(String::as_str).unwrap_or("");
                let message = args.get(1).map(String::as_str).unwrap_or("");
                info!(worker = ?worker, %state, %message, "Worker status");
                if policy.ack {
                    send_frame(&mut writer, &[ACTION_ACK]).await?;
                }
            }
            ACTION_PROGRESS => {
                let fraction = args.first().map(String::as_str).unwrap_or("");
                info!(worker = ?worker, progress = %fraction, "Worker progress");
                progress_reports += 1;
                if !cancel_sent && policy.cancel_after.is_some_and(|n| progress_reports >= n) {
                    info!(worker = ?worker, "Cancelling worker");
                    send_frame(&mut writer, &[ACTION_CANCEL]).await?;
                    cancel_sent = true;
                }
            }
            other => {
                warn!(worker = ?worker, action = %other, "Ignoring unknown worker action");
            }
        }
    }

    debug!(worker = ?worker, "Worker connection closed");
    Ok(())
}

/// `--debug` wins over `RUST_LOG`, which wins over `info`.
fn log_filter(debug: bool, rust_log: Option<String>) -> String {
    if debug {
        return "debug".to_string();
    }
    rust_log
        .filter(|filter| !filter.trim().is_empty())
        .unwrap_or_else(|| "info".to_string())
}

/// Identity of a well-formed, correctly signed registration.
fn check_registration(args: &[String], policy: &Policy) -> Option<String> {
    let Some(registration) = Registration::from_args(args) else {
        warn!("Rejecting worker: malformed register frame");
        return None;
    };
    if registration.identity.trim().is_empty() {
        warn!("Rejecting worker: empty identity");
        return None;
    }
    if let Some(secret) = &policy.secret {
        if auth::now_ts().abs_diff(registration.ts) > MAX_CLOCK_SKEW_SECS {
            warn!(identity = %registration.identity, "Rejecting worker: stale registration");
            return None;
        }
        if !auth::verify(&registration, secret) {
            warn!(identity = %registration.identity, "Rejecting worker: bad signature");
            return None;
        }
    }
    Some(registration.identity)
}

async fn send_frame<W>(writer: &mut W, parts: &[&str]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let line = codec::encode_line(parts)?;
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

fn spawn_signal_handlers(shutdown: Arc<watch::Sender<bool>>) {
    let ctrl_c_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C; shutting down agentd");
            request_shutdown(&ctrl_c_shutdown);
        }
    });

    #[cfg(unix)]
    {
        let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(err) => {
                warn!("Failed to install SIGTERM handler: {}", err);
                return;
            }
        };
        tokio::spawn(async move {
            if sigterm.recv().await.is_some() {
                info!("Received SIGTERM; shutting down agentd");
                request_shutdown(&shutdown);
            }
        });
    }
}

fn request_shutdown(shutdown: &watch::Sender<bool>) {
    if SHUTDOWN_REQUESTED.swap(true, Ordering::SeqCst) {
        return;
    }
    shutdown.send_replace(true);
}
