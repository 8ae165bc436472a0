//! Record sinks: the framed TCP collector client and the flat-file
//! development sink. Both accept opaque byte frames, one record per frame.

pub mod file;
pub mod tcp;

use std::time::Duration;

use thiserror::Error;

use self::file::FileSink;
use self::tcp::TcpClient;

/// How long a drain may wait for the transmit backlog to empty.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(180);
const DRAIN_POLL: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum TransportError {
    /// The transmit backlog did not empty within the drain timeout.
    #[error("transmit backlog did not drain within {0:?}")]
    Stall(Duration),
    /// The sink refused the frame (sender gone / connection dead).
    #[error("frame rejected by transport")]
    Reject,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The record sink the watcher ships into.
pub enum Transport {
    Tcp(TcpClient),
    File(FileSink),
}

impl Transport {
    /// Hand one frame to the sink. Awaits backlog capacity (backpressure);
    /// a synchronous reject is fatal to the caller's current batch.
    pub async fn send(&mut self, frame: Vec<u8>) -> Result<(), TransportError> {
        match self {
            Transport::Tcp(client) => client.send(frame).await,
            Transport::File(sink) => sink.send(&frame),
        }
    }

    /// Frames accepted but not yet written to the wire.
    pub fn pending(&self) -> usize {
        match self {
            Transport::Tcp(client) => client.pending(),
            Transport::File(_) => 0,
        }
    }

    /// Wait for the transmit backlog to empty to at most one frame.
    /// A file sink never stalls.
    pub async fn drain(&self) -> Result<(), TransportError> {
        if matches!(self, Transport::File(_)) {
            return Ok(());
        }
        let start = tokio::time::Instant::now();
        while self.pending() > 1 {
            if start.elapsed() > DRAIN_TIMEOUT {
                return Err(TransportError::Stall(DRAIN_TIMEOUT));
            }
            tokio::time::sleep(DRAIN_POLL).await;
        }
        Ok(())
    }

    pub fn describe(&self) -> String {
        match self {
            Transport::Tcp(client) => format!("tcp {}", client.peer()),
            Transport::File(sink) => format!("file {}", sink.path().display()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_file_sink_never_stalls() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");
        let mut t = Transport::File(FileSink::open(&path).unwrap());

        t.send(b"{\"ae\":\"a\"}".to_vec()).await.unwrap();
        t.send(b"{\"ae\":\"e\"}".to_vec()).await.unwrap();
        assert_eq!(t.pending(), 0);
        t.drain().await.unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "{\"ae\":\"a\"}\n{\"ae\":\"e\"}\n");
    }
}
