//! One logical connection to the agent service.
//!
//! `Unconnected → Connected → Closed`. Outbound frames go through an
//! unbounded queue drained by a writer task, so [`Connection::send`] never
//! waits on the network. Inbound frames are read by a dedicated receive loop
//! and handed to the frame callback one at a time, in arrival order.
//! Reconnection is not this type's concern.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf,
    WriteHalf,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::auth;
use crate::codec::{self, DEFAULT_MAX_FRAME_BYTES, FRAME_DELIMITER};
use crate::config::{DEFAULT_CLOSE_TIMEOUT_MS, DEFAULT_CONNECT_TIMEOUT_MS};
use crate::error::{ConnectionError, SendError};
use crate::frame::WorkerReport;
use crate::ipc::{AgentAddress, BoxedStream};

type FrameReader = BufReader<ReadHalf<BoxedStream>>;
type FrameWriter = WriteHalf<BoxedStream>;
pub type DisconnectCallback = Box<dyn FnOnce(DisconnectReason) + Send + 'static>;

#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Shared secret used to sign the registration frame.
    pub secret: Option<String>,
    pub connect_timeout: Duration,
    /// Upper bound for `close()` to wait on the writer and receive loop.
    pub close_timeout: Duration,
    pub max_frame_bytes: usize,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            secret: None,
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            close_timeout: Duration::from_millis(DEFAULT_CLOSE_TIMEOUT_MS),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Unconnected,
    Connected,
    Closed,
}

/// Why the receive loop stopped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DisconnectReason {
    /// `close()` was called locally.
    Closed,
    /// The agent hung up.
    EndOfStream,
    TransportError(String),
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DisconnectReason::Closed => f.write_str("closed locally"),
            DisconnectReason::EndOfStream => f.write_str("agent closed the connection"),
            DisconnectReason::TransportError(err) => write!(f, "transport error: {}", err),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// State shared with the receive loop.
struct Shared {
    identity: String,
    state: Mutex<ConnectionState>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
}

impl Shared {
    /// Stop accepting sends. Already-queued frames still drain.
    fn mark_closed(&self) {
        *lock(&self.state) = ConnectionState::Closed;
        lock(&self.outbound).take();
    }
}

pub struct Connection {
    shared: Arc<Shared>,
    options: ConnectOptions,
    reader: Mutex<Option<FrameReader>>,
    on_disconnect: Mutex<Option<DisconnectCallback>>,
    close_tx: watch::Sender<bool>,
    close_requested: AtomicBool,
    receiving: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Connection {
    /// An unconnected connection for `identity`.
    pub fn new(identity: impl Into<String>, options: ConnectOptions) -> Result<Self, ConnectionError> {
        let identity = identity.into();
        if identity.trim().is_empty() {
            return Err(ConnectionError::EmptyIdentity);
        }
        if options.max_frame_bytes == 0 {
            return Err(ConnectionError::InvalidOptions(
                "max_frame_bytes must be greater than zero".into(),
            ));
        }
        let (close_tx, _) = watch::channel(false);
        Ok(Self {
            shared: Arc::new(Shared {
                identity,
                state: Mutex::new(ConnectionState::Unconnected),
                outbound: Mutex::new(None),
            }),
            options,
            reader: Mutex::new(None),
            on_disconnect: Mutex::new(None),
            close_tx,
            close_requested: AtomicBool::new(false),
            receiving: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Connect to `address` and register. No retry on failure.
    pub async fn open(
        address: &AgentAddress,
        identity: impl Into<String>,
        options: ConnectOptions,
    ) -> Result<Self, ConnectionError> {
        let connection = Self::new(identity, options)?;
        connection.connect(address).await?;
        Ok(connection)
    }

    /// Wrap an already-open duplex stream and register over it.
    pub fn from_stream<S>(
        stream: S,
        identity: impl Into<String>,
        options: ConnectOptions,
    ) -> Result<Self, ConnectionError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let connection = Self::new(identity, options)?;
        connection.attach(Box::new(stream))?;
        Ok(connection)
    }

    pub async fn connect(&self, address: &AgentAddress) -> Result<(), ConnectionError> {
        self.ensure_unconnected()?;
        let timeout_ms = self.options.connect_timeout.as_millis() as u64;
        debug!(identity = %self.shared.identity, %address, "Connecting to agent");
        let stream = match timeout(self.options.connect_timeout, address.connect()).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(ConnectionError::Unreachable {
                    address: address.to_string(),
                    source,
                })
            }
            Err(_) => {
                return Err(ConnectionError::Timeout {
                    address: address.to_string(),
                    timeout_ms,
                })
            }
        };
        self.attach(stream)?;
        info!(identity = %self.shared.identity, %address, "Connected to agent");
        Ok(())
    }

    fn ensure_unconnected(&self) -> Result<(), ConnectionError> {
        match *lock(&self.shared.state) {
            ConnectionState::Unconnected => Ok(()),
            other => Err(ConnectionError::Handshake(format!(
                "connection is {:?}, expected Unconnected",
                other
            ))),
        }
    }

    /// Split the stream, start the writer and queue the registration frame.
    fn attach(&self, stream: BoxedStream) -> Result<(), ConnectionError> {
        self.ensure_unconnected()?;
        let (read_half, write_half) = tokio::io::split(stream);
        let (tx, rx) = mpsc::unbounded_channel();

        let registration =
            auth::registration_report(&self.shared.identity, self.options.secret.as_deref());
        let line = codec::encode_line(&registration.to_parts())
            .map_err(|err| ConnectionError::Handshake(err.to_string()))?;
        tx.send(line)
            .map_err(|_| ConnectionError::Handshake("writer unavailable".into()))?;

        let writer = tokio::spawn(write_loop(write_half, rx, self.shared.identity.clone()));
        lock(&self.tasks).push(writer);
        *lock(&self.reader) = Some(BufReader::new(read_half));
        *lock(&self.shared.outbound) = Some(tx);
        *lock(&self.shared.state) = ConnectionState::Connected;
        Ok(())
    }

    pub fn identity(&self) -> &str {
        &self.shared.identity
    }

    pub fn state(&self) -> ConnectionState {
        *lock(&self.shared.state)
    }

    /// Queue a frame for transmission. Returns once queued, not once delivered.
    pub fn send<S: AsRef<str>>(&self, parts: &[S]) -> Result<(), SendError> {
        let line = codec::encode_line(parts)?;
        let outbound = lock(&self.shared.outbound);
        match outbound.as_ref() {
            Some(tx) => tx.send(line).map_err(|_| SendError::Closed),
            None => Err(SendError::Closed),
        }
    }

    pub fn send_report(&self, report: &WorkerReport) -> Result<(), SendError> {
        self.send(&report.to_parts())
    }

    /// Called once when the receive loop ends. Register before
    /// [`Connection::start_receiving`].
    pub fn on_disconnect<F>(&self, callback: F)
    where
        F: FnOnce(DisconnectReason) + Send + 'static,
    {
        *lock(&self.on_disconnect) = Some(Box::new(callback));
    }

    /// Spawn the receive loop. `on_frame` runs on the loop itself, once per
    /// frame, so a slow handler delays the next frame.
    pub fn start_receiving<F>(&self, on_frame: F) -> Result<(), ConnectionError>
    where
        F: FnMut(Vec<String>) + Send + 'static,
    {
        if self.receiving.swap(true, Ordering::SeqCst) {
            return Err(ConnectionError::AlreadyReceiving);
        }
        let reader = lock(&self.reader).take().ok_or_else(|| {
            ConnectionError::Handshake("connection is not connected".into())
        })?;
        let on_disconnect = lock(&self.on_disconnect).take();
        let close_rx = self.close_tx.subscribe();
        let handle = tokio::spawn(receive_loop(
            reader,
            close_rx,
            self.shared.clone(),
            self.options.max_frame_bytes,
            on_frame,
            on_disconnect,
        ));
        lock(&self.tasks).push(handle);
        Ok(())
    }

    /// Idempotent. Flushes already-queued frames, then waits for the writer
    /// and receive loop up to `close_timeout` before aborting them.
    pub async fn close(&self) {
        if self.close_requested.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.mark_closed();
        self.close_tx.send_replace(true);
        lock(&self.reader).take();

        let tasks: Vec<JoinHandle<()>> = lock(&self.tasks).drain(..).collect();
        let deadline = tokio::time::Instant::now() + self.options.close_timeout;
        for mut task in tasks {
            if join_by(&mut task, deadline).await.is_err() {
                warn!(
                    identity = %self.shared.identity,
                    "Connection task did not stop within {}ms; aborting",
                    self.options.close_timeout.as_millis()
                );
                task.abort();
            }
        }
        debug!(identity = %self.shared.identity, "Connection closed");
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close_tx.send_replace(true);
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
    }
}

async fn join_by(
    task: &mut JoinHandle<()>,
    deadline: tokio::time::Instant,
) -> Result<(), tokio::time::error::Elapsed> {
    tokio::time::timeout_at(deadline, task).await.map(|_| ())
}

async fn write_loop(
    mut writer: FrameWriter,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    identity: String,
) {
    while let Some(line) = rx.recv().await {
        if let Err(err) = writer.write_all(&line).await {
            warn!(%identity, "Failed to write control frame: {}", err);
            break;
        }
        if let Err(err) = writer.flush().await {
            warn!(%identity, "Failed to flush control frame: {}", err);
            break;
        }
    }
    let _ = writer.shutdown().await;
}

enum FrameRead {
    Frame,
    Oversized,
    Eof,
}

/// Read one delimited frame into `buf` without letting it grow past `limit`.
async fn read_frame(
    reader: &mut FrameReader,
    buf: &mut Vec<u8>,
    limit: usize,
) -> std::io::Result<FrameRead> {
    let cap = limit as u64 + 1;
    let n = (&mut *reader).take(cap).read_until(FRAME_DELIMITER, buf).await?;
    if n == 0 {
        return Ok(FrameRead::Eof);
    }
    if buf.last() == Some(&FRAME_DELIMITER) {
        buf.pop();
        return Ok(FrameRead::Frame);
    }
    if buf.len() <= limit {
        // Stream ended mid-frame
        return Ok(FrameRead::Eof);
    }
    // Skip the rest of the oversized frame
    loop {
        buf.clear();
        let n = (&mut *reader).take(cap).read_until(FRAME_DELIMITER, buf).await?;
        if n == 0 {
            return Ok(FrameRead::Eof);
        }
        if buf.last() == Some(&FRAME_DELIMITER) {
            return Ok(FrameRead::Oversized);
        }
    }
}

async fn receive_loop<F>(
    mut reader: FrameReader,
    mut close_rx: watch::Receiver<bool>,
    shared: Arc<Shared>,
    max_frame_bytes: usize,
    mut on_frame: F,
    on_disconnect: Option<DisconnectCallback>,
) where
    F: FnMut(Vec<String>) + Send + 'static,
{
    let identity = shared.identity.clone();
    let mut buf = Vec::with_capacity(256);

    let reason = loop {
        if *close_rx.borrow() {
            break DisconnectReason::Closed;
        }
        buf.clear();
        let read = tokio::select! {
            biased;
            _ = close_rx.changed() => break DisconnectReason::Closed,
            read = read_frame(&mut reader, &mut buf, max_frame_bytes) => read,
        };
        match read {
            Ok(FrameRead::Frame) => {
                if buf.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                let parts = match codec::decode(&buf) {
                    Ok(parts) => parts,
                    Err(err) => {
                        warn!(%identity, "Dropping inbound frame: {}", err);
                        continue;
                    }
                };
                let action = parts[0].clone();
                // A panicking handler loses its frame, not the connection.
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| on_frame(parts))) {
                    error!(
                        %identity,
                        %action,
                        "Frame handler panicked: {}",
                        panic_message(payload.as_ref())
                    );
                }
            }
            Ok(FrameRead::Oversized) => {
                warn!(%identity, limit = max_frame_bytes, "Dropping oversized inbound frame");
            }
            Ok(FrameRead::Eof) => break DisconnectReason::EndOfStream,
            Err(err) => break DisconnectReason::TransportError(err.to_string()),
        }
    };

    if reason != DisconnectReason::Closed {
        shared.mark_closed();
    }
    debug!(%identity, ?reason, "Receive loop stopped");
    if let Some(callback) = on_disconnect {
        callback(reason);
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}
