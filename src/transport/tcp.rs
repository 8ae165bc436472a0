//! Framed TCP client for the remote collector.
//!
//! Frames are a u32 big-endian length prefix followed by the record bytes.
//! `send` enqueues onto a bounded transmit backlog drained by an internal
//! sender task; when the backlog is full, `send` waits (backpressure). The
//! sender can be rate-limited to a maximum number of frames per second.
//!
//! A connection failure kills the sender task; every later `send` is
//! rejected so the watcher checkpoints and stops instead of buffering
//! unbounded data in memory.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use super::TransportError;

/// Bounded transmit backlog capacity.
const BACKLOG_CAPACITY: usize = 4096;

pub struct TcpClient {
    tx: mpsc::Sender<Vec<u8>>,
    backlog: Arc<AtomicUsize>,
    peer: String,
    task: tokio::task::JoinHandle<()>,
}

impl TcpClient {
    /// Connect and start the sender task. `txrate` caps frames per second;
    /// zero means unlimited.
    pub async fn connect(host: &str, port: u16, txrate: u32) -> std::io::Result<Self> {
        let peer = format!("{host}:{port}");
        let stream = TcpStream::connect((host, port)).await?;
        stream.set_nodelay(true)?;

        let (tx, rx) = mpsc::channel(BACKLOG_CAPACITY);
        let backlog = Arc::new(AtomicUsize::new(0));
        let task = tokio::spawn(sender_task(stream, rx, backlog.clone(), txrate, peer.clone()));

        Ok(Self {
            tx,
            backlog,
            peer,
            task,
        })
    }

    pub async fn send(&mut self, frame: Vec<u8>) -> Result<(), TransportError> {
        // Count before enqueueing so the sender's decrement can never win
        // the race and underflow.
        self.backlog.fetch_add(1, Ordering::Relaxed);
        if self.tx.send(frame).await.is_err() {
            // Sender task is gone (write failure); nothing will drain.
            self.backlog.fetch_sub(1, Ordering::Relaxed);
            return Err(TransportError::Reject);
        }
        Ok(())
    }

    /// Frames enqueued but not yet written to the socket.
    pub fn pending(&self) -> usize {
        self.backlog.load(Ordering::Relaxed)
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }
}

impl Drop for TcpClient {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn sender_task(
    mut stream: TcpStream,
    mut rx: mpsc::Receiver<Vec<u8>>,
    backlog: Arc<AtomicUsize>,
    txrate: u32,
    peer: String,
) {
    let gap = if txrate > 0 {
        Some(Duration::from_secs_f64(1.0 / f64::from(txrate)))
    } else {
        None
    };

    while let Some(frame) = rx.recv().await {
        let len = (frame.len() as u32).to_be_bytes();
        let result = async {
            stream.write_all(&len).await?;
            stream.write_all(&frame).await?;
            stream.flush().await
        }
        .await;

        if let Err(e) = result {
            tracing::error!("collector write to {} failed: {}", peer, e);
            // Dropping rx closes the channel; pending senders see Reject.
            return;
        }
        backlog.fetch_sub(1, Ordering::Relaxed);

        if let Some(gap) = gap {
            tokio::time::sleep(gap).await;
        }
    }
}
