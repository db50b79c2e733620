//! Worker-facing control daemon.
//!
//! One `ControlDaemon` per worker process, constructed explicitly and passed
//! to the business logic. It composes a [`Connection`], a [`StatusTracker`]
//! and an [`ActionDispatchTable`]:
//!
//! - construction connects, moves to `Running` and announces it;
//! - `report_progress` / `report_failure` update the tracker and send
//!   best-effort frames (transport errors are logged, never returned);
//! - inbound `cancel` flips the tracker to `Cancelled` and runs the
//!   cancellation callback once;
//! - `shutdown` sends one terminal status and closes the connection.
//!
//! A lost connection marks the worker `Faulted`. There is no reconnect; the
//! supervisor is expected to restart the worker.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::config::ControlConfig;
use crate::connection::{Connection, ConnectionState, DisconnectCallback, DisconnectReason};
use crate::dispatch::{ActionDispatchTable, ActionHandler};
use crate::error::{ConnectionError, ControlError, StatusError};
use crate::frame::{ControlAction, WorkerReport, ACTION_CANCEL};
use crate::ipc::AgentAddress;
use crate::status::{LifecycleState, StatusSnapshot, StatusTracker};

pub type CancelCallback = Box<dyn FnOnce() + Send + 'static>;

pub struct ControlDaemonBuilder {
    config: ControlConfig,
    on_cancel: Option<CancelCallback>,
    on_disconnect: Option<DisconnectCallback>,
    actions: Vec<(String, ActionHandler)>,
}

impl ControlDaemonBuilder {
    pub fn new(config: ControlConfig) -> Self {
        Self {
            config,
            on_cancel: None,
            on_disconnect: None,
            actions: Vec::new(),
        }
    }

    /// Runs once, on the receive loop, when a `cancel` frame moves the worker
    /// to `Cancelled`. Expected to stop the business logic cooperatively.
    pub fn on_cancel<F>(mut self, callback: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.on_cancel = Some(Box::new(callback));
        self
    }

    /// Runs after the built-in disconnect handling.
    pub fn on_disconnect<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(DisconnectReason) + Send + 'static,
    {
        self.on_disconnect = Some(Box::new(callback));
        self
    }

    /// Handle an inbound action; one handler per name, last registration wins.
    /// A `cancel` handler runs after the built-in transition to `Cancelled`
    /// and `on_cancel`, for every `cancel` frame. An `ack` handler replaces
    /// the built-in debug log.
    pub fn register_action<F>(mut self, action: impl Into<String>, handler: F) -> Self
    where
        F: FnMut(&[String]) + Send + 'static,
    {
        self.actions.push((action.into(), Box::new(handler)));
        self
    }

    /// Connect to the configured agent. Failure here is fatal for the worker.
    pub async fn connect(self) -> Result<ControlDaemon, ControlError> {
        if let Err(err) = self.config.validate() {
            error!(identity = %self.config.identity, "Invalid control configuration: {}", err);
            return Err(err.into());
        }
        let tracker = Arc::new(StatusTracker::new());
        match self.open_connection().await {
            Ok(connection) => self.wire(connection, tracker),
            Err(err) => {
                tracker.fault(err.to_string());
                error!(
                    identity = %self.config.identity,
                    address = %self.config.address,
                    state = %tracker.state(),
                    "Control plane unavailable: {}",
                    err
                );
                Err(err.into())
            }
        }
    }

    /// Wire the daemon over an already-connected [`Connection`].
    pub fn attach(self, connection: Connection) -> Result<ControlDaemon, ControlError> {
        if connection.state() != ConnectionState::Connected {
            return Err(ConnectionError::Handshake(format!(
                "connection is {:?}, expected Connected",
                connection.state()
            ))
            .into());
        }
        self.wire(connection, Arc::new(StatusTracker::new()))
    }

    async fn open_connection(&self) -> Result<Connection, ConnectionError> {
        let address: AgentAddress = self.config.address.parse()?;
        Connection::open(
            &address,
            self.config.identity.clone(),
            self.config.connect_options(),
        )
        .await
    }

    fn wire(
        self,
        connection: Connection,
        tracker: Arc<StatusTracker>,
    ) -> Result<ControlDaemon, ControlError> {
        let identity = connection.identity().to_string();
        tracker.set_state(LifecycleState::Running)?;

        let mut table = ActionDispatchTable::new();
        let mut user_cancel = None;
        for (action, handler) in self.actions {
            match ControlAction::parse(&action) {
                ControlAction::Cancel => user_cancel = Some(handler),
                _ => table.register(&action, handler),
            }
        }
        table.register(
            ACTION_CANCEL,
            cancel_handler(identity.clone(), tracker.clone(), self.on_cancel, user_cancel),
        );

        let disconnect_tracker = tracker.clone();
        let disconnect_identity = identity.clone();
        let user_disconnect = self.on_disconnect;
        connection.on_disconnect(move |reason| {
            match &reason {
                DisconnectReason::Closed => {
                    debug!(identity = %disconnect_identity, "Control connection closed")
                }
                _ => {
                    warn!(identity = %disconnect_identity, "Lost control connection: {}", reason);
                    if !disconnect_tracker.is_terminal() {
                        disconnect_tracker.fault(format!("control connection lost: {}", reason));
                    }
                }
            }
            if let Some(callback) = user_disconnect {
                callback(reason);
            }
        });

        let daemon = ControlDaemon {
            identity: identity.clone(),
            connection,
            tracker,
            shut_down: AtomicBool::new(false),
        };
        daemon.send_best_effort(&WorkerReport::Status {
            state: LifecycleState::Running,
            message: String::new(),
        });

        let frame_identity = identity;
        daemon.connection.start_receiving(move |parts| {
            if let Err(err) = table.dispatch(parts) {
                warn!(identity = %frame_identity, "Dropping inbound frame: {}", err);
            }
        })?;

        info!(identity = %daemon.identity, "Control daemon running");
        Ok(daemon)
    }
}

fn cancel_handler(
    identity: String,
    tracker: Arc<StatusTracker>,
    mut on_cancel: Option<CancelCallback>,
    mut user_handler: Option<ActionHandler>,
) -> impl FnMut(&[String]) + Send + 'static {
    move |args: &[String]| {
        match tracker.set_state(LifecycleState::Cancelled) {
            Ok(LifecycleState::Cancelled) => {
                debug!(%identity, "Duplicate cancel ignored");
            }
            Ok(previous) => {
                info!(%identity, %previous, "Cancellation requested by agent");
                if let Some(callback) = on_cancel.take() {
                    callback();
                }
            }
            Err(err) => {
                warn!(%identity, "Ignoring cancel: {}", err);
            }
        }
        if let Some(handler) = user_handler.as_mut() {
            handler(args);
        }
    }
}

pub struct ControlDaemon {
    identity: String,
    connection: Connection,
    tracker: Arc<StatusTracker>,
    shut_down: AtomicBool,
}

impl ControlDaemon {
    /// Shorthand for `ControlDaemonBuilder::new(config).connect()`.
    pub async fn connect(config: ControlConfig) -> Result<Self, ControlError> {
        ControlDaemonBuilder::new(config).connect().await
    }

    pub fn builder(config: ControlConfig) -> ControlDaemonBuilder {
        ControlDaemonBuilder::new(config)
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn state(&self) -> LifecycleState {
        self.tracker.state()
    }

    pub fn status(&self) -> StatusSnapshot {
        self.tracker.snapshot()
    }

    pub fn is_cancelled(&self) -> bool {
        self.tracker.state() == LifecycleState::Cancelled
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Record `progress` and report it. Only the range check can fail.
    pub fn report_progress(&self, progress: f64) -> Result<(), StatusError> {
        self.tracker.set_progress(progress)?;
        self.send_best_effort(&WorkerReport::Progress(progress));
        Ok(())
    }

    /// Mark the worker `Faulted` and report `message`. The caller is expected
    /// to shut down soon after.
    pub fn report_failure(&self, message: impl Into<String>) {
        let message = message.into();
        let previous = self.tracker.fault(message.clone());
        warn!(identity = %self.identity, %previous, "Worker failure reported: {}", message);
        self.send_best_effort(&WorkerReport::Status {
            state: LifecycleState::Faulted,
            message,
        });
    }

    /// Send the terminal status and close the connection. Idempotent.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        // Faulted and Cancelled are kept; everything else completes.
        if let Err(err) = self.tracker.set_state(LifecycleState::Completed) {
            debug!(identity = %self.identity, "Keeping final state: {}", err);
        }
        let snapshot = self.tracker.snapshot();
        let message = match snapshot.state {
            LifecycleState::Faulted => snapshot.error_message.unwrap_or_default(),
            _ => String::new(),
        };
        self.send_best_effort(&WorkerReport::Status {
            state: snapshot.state,
            message,
        });
        self.connection.close().await;
        info!(identity = %self.identity, state = %snapshot.state, "Control daemon shut down");
    }

    fn send_best_effort(&self, report: &WorkerReport) {
        if let Err(err) = self.connection.send_report(report) {
            warn!(
                identity = %self.identity,
                "Dropping {} frame: {}",
                report.to_parts()[0],
                err
            );
        }
    }
}

impl Drop for ControlDaemon {
    fn drop(&mut self) {
        if !self.shut_down.load(Ordering::SeqCst) {
            warn!(identity = %self.identity, "Control daemon dropped without shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use tokio::io::{
        duplex, AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines, ReadHalf, WriteHalf,
    };

    use crate::codec;
    use crate::connection::ConnectOptions;
    use crate::error::ConfigError;

    const WAIT: Duration = Duration::from_secs(2);

    type AgentLines = Lines<BufReader<ReadHalf<DuplexStream>>>;

    fn attached(
        builder: ControlDaemonBuilder,
    ) -> (ControlDaemon, AgentLines, WriteHalf<DuplexStream>) {
        let (local, remote) = duplex(64 * 1024);
        let connection =
            Connection::from_stream(local, "worker:unit", ConnectOptions::default()).unwrap();
        let daemon = builder.attach(connection).unwrap();
        let (read, write) = tokio::io::split(remote);
        (daemon, BufReader::new(read).lines(), write)
    }

    async fn next_frame(lines: &mut AgentLines) -> Option<Vec<String>> {
        let line = tokio::time::timeout(WAIT, lines.next_line())
            .await
            .unwrap()
            .unwrap()?;
        Some(codec::decode(line.as_bytes()).unwrap())
    }

    async fn push(write: &mut WriteHalf<DuplexStream>, parts: &[&str]) {
        write
            .write_all(&codec::encode_line(parts).unwrap())
            .await
            .unwrap();
    }

    async fn wait_until<F: Fn() -> bool>(condition: F) {
        tokio::time::timeout(WAIT, async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    #[test]
    fn attach_requires_a_connected_connection() {
        let connection = Connection::new("worker:idle", ConnectOptions::default()).unwrap();
        let result = ControlDaemonBuilder::new(ControlConfig::default()).attach(connection);
        assert!(matches!(
            result,
            Err(ControlError::Connection(ConnectionError::Handshake(_)))
        ));
    }

    #[tokio::test]
    async fn attach_announces_running_and_obeys_cancel() {
        let cancels = Arc::new(AtomicUsize::new(0));
        let counter = cancels.clone();
        let builder = ControlDaemonBuilder::new(ControlConfig::default()).on_cancel(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let (daemon, mut lines, mut write) = attached(builder);
        assert_eq!(daemon.identity(), "worker:unit");
        assert_eq!(daemon.state(), LifecycleState::Running);

        assert_eq!(next_frame(&mut lines).await.unwrap()[0], "register");
        assert_eq!(
            next_frame(&mut lines).await.unwrap(),
            ["status", "running", ""]
        );

        push(&mut write, &["cancel"]).await;
        wait_until(|| daemon.is_cancelled()).await;
        assert_eq!(cancels.load(Ordering::SeqCst), 1);

        daemon.shutdown().await;
        assert_eq!(
            next_frame(&mut lines).await.unwrap(),
            ["status", "cancelled", ""]
        );
        assert!(next_frame(&mut lines).await.is_none());
    }

    #[tokio::test]
    async fn cancel_after_failure_is_ignored() {
        let cancels = Arc::new(AtomicUsize::new(0));
        let acks = Arc::new(AtomicUsize::new(0));
        let (cancel_counter, ack_counter) = (cancels.clone(), acks.clone());
        let builder = ControlDaemonBuilder::new(ControlConfig::default())
            .on_cancel(move || {
                cancel_counter.fetch_add(1, Ordering::SeqCst);
            })
            .register_action("ack", move |_args| {
                ack_counter.fetch_add(1, Ordering::SeqCst);
            });
        let (daemon, mut lines, mut write) = attached(builder);

        daemon.report_failure("boom");
        push(&mut write, &["cancel"]).await;
        push(&mut write, &["ack"]).await;
        wait_until(|| acks.load(Ordering::SeqCst) == 1).await;

        assert_eq!(daemon.state(), LifecycleState::Faulted);
        assert_eq!(cancels.load(Ordering::SeqCst), 0);

        daemon.shutdown().await;
        let frames: Vec<Vec<String>> = {
            let mut frames = Vec::new();
            while let Some(frame) = next_frame(&mut lines).await {
                frames.push(frame);
            }
            frames
        };
        assert_eq!(frames.len(), 4);
        assert_eq!(frames[2], ["status", "faulted", "boom"]);
        assert_eq!(frames[3], ["status", "faulted", "boom"]);
    }

    #[tokio::test]
    async fn zero_frame_limit_is_refused_before_connecting() {
        let mut config = ControlConfig::new("/nonexistent/agentd.sock", "worker:unit");
        config.max_frame_bytes = 0;
        let result = ControlDaemon::connect(config).await;
        assert!(matches!(
            result,
            Err(ControlError::Config(ConfigError::InvalidValue { key, .. })) if key == "max_frame_bytes"
        ));
    }

    #[tokio::test]
    async fn user_cancel_handler_runs_after_the_builtin_transition() {
        let cancels = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let counter = cancels.clone();
        let sink = seen.clone();
        let builder = ControlDaemonBuilder::new(ControlConfig::default())
            .on_cancel(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .register_action("cancel", move |args| {
                sink.lock().unwrap().push(args.to_vec());
            });
        let (daemon, _lines, mut write) = attached(builder);

        push(&mut write, &["cancel", "deadline"]).await;
        push(&mut write, &["cancel"]).await;
        wait_until(|| seen.lock().unwrap().len() == 2).await;

        assert!(daemon.is_cancelled());
        assert_eq!(cancels.load(Ordering::SeqCst), 1);
        assert_eq!(
            *seen.lock().unwrap(),
            [vec!["deadline".to_string()], Vec::new()]
        );
        daemon.shutdown().await;
    }

    #[tokio::test]
    async fn progress_outside_the_range_is_refused() {
        let (daemon, _lines, _write) =
            attached(ControlDaemonBuilder::new(ControlConfig::default()));
        assert!(daemon.report_progress(1.0).is_ok());
        assert!(matches!(
            daemon.report_progress(1.01),
            Err(StatusError::InvalidArgument(_))
        ));
        assert_eq!(daemon.status().progress, 1.0);
        daemon.shutdown().await;
    }
}
