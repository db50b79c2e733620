//! Fake agent service for integration tests: accepts one worker connection,
//! records every decoded frame and can write frames back.

#![allow(dead_code)]

use std::time::Duration;

use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use workerd_control::codec;
use workerd_control::ipc::{AgentListener, BoxedStream};
use workerd_control::{AgentAddress, ControlConfig};

pub const WAIT: Duration = Duration::from_secs(2);
pub const QUIET: Duration = Duration::from_millis(150);

pub struct FakeAgent {
    pub address: String,
    _dir: Option<TempDir>,
    frames: mpsc::UnboundedReceiver<Vec<String>>,
    writer_rx: Option<oneshot::Receiver<WriteHalf<BoxedStream>>>,
    writer: Option<WriteHalf<BoxedStream>>,
    reader_task: JoinHandle<()>,
}

impl FakeAgent {
    #[cfg(unix)]
    pub async fn unix() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("agent.sock").to_string_lossy().to_string();
        Self::serve(AgentAddress::Unix(path), Some(dir)).await
    }

    pub async fn tcp() -> Self {
        let address: AgentAddress = "tcp://127.0.0.1:0".parse().expect("tcp address");
        Self::serve(address, None).await
    }

    async fn serve(address: AgentAddress, dir: Option<TempDir>) -> Self {
        let listener: AgentListener = address.bind().await.expect("bind agent listener");
        let address = listener
            .local_address()
            .expect("local address")
            .to_string();
        let (frame_tx, frames) = mpsc::unbounded_channel();
        let (writer_tx, writer_rx) = oneshot::channel();
        let reader_task = tokio::spawn(async move {
            let Ok(stream) = listener.accept().await else {
                return;
            };
            let (read, write) = tokio::io::split(stream);
            let _ = writer_tx.send(write);
            let mut lines = BufReader::new(read).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Ok(parts) = codec::decode(line.as_bytes()) {
                    let _ = frame_tx.send(parts);
                }
            }
        });
        Self {
            address,
            _dir: dir,
            frames,
            writer_rx: Some(writer_rx),
            writer: None,
            reader_task,
        }
    }

    pub fn config(&self, identity: &str) -> ControlConfig {
        ControlConfig::new(self.address.clone(), identity)
    }

    /// Next frame from the worker, `None` once the worker hung up.
    pub async fn next_frame(&mut self) -> Option<Vec<String>> {
        timeout(WAIT, self.frames.recv())
            .await
            .expect("timed out waiting for a worker frame")
    }

    /// Skip the `register` and initial `status` frames.
    pub async fn expect_handshake(&mut self, identity: &str) {
        let register = self.next_frame().await.expect("register frame");
        assert_eq!(register[0], "register");
        assert_eq!(register[1], identity);
        assert_eq!(
            self.next_frame().await.expect("initial status"),
            ["status", "running", ""]
        );
    }

    pub async fn expect_silence(&mut self) {
        assert!(
            timeout(QUIET, self.frames.recv()).await.is_err(),
            "worker sent an unexpected frame or hung up"
        );
    }

    async fn writer(&mut self) -> &mut WriteHalf<BoxedStream> {
        if self.writer.is_none() {
            let rx = self.writer_rx.take().expect("writer already taken");
            let writer = timeout(WAIT, rx)
                .await
                .expect("worker never connected")
                .expect("agent reader stopped");
            self.writer = Some(writer);
        }
        self.writer.as_mut().expect("writer present")
    }

    pub async fn send(&mut self, parts: &[&str]) {
        let line = codec::encode_line(parts).expect("encode");
        self.send_raw(&line).await;
    }

    pub async fn send_raw(&mut self, raw: &[u8]) {
        let writer = self.writer().await;
        writer.write_all(raw).await.expect("agent write");
        writer.flush().await.expect("agent flush");
    }

    /// Drop the connection from the agent side.
    pub async fn hang_up(&mut self) {
        let _ = self.writer().await;
        self.writer.take();
        self.reader_task.abort();
    }
}

pub async fn wait_until<F: Fn() -> bool>(condition: F) {
    timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
