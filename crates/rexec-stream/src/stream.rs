//! Bidirectional byte stream abstraction shared by every transport.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use rexec_core::{Dimensions, TransportFailure};

/// Something that happened on the read side of a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// A chunk of raw output
    Data(Vec<u8>),
    /// The remote side closed the stream
    Closed,
    /// The stream reported an error; it should be treated as closed
    Error(String),
}

/// Result of a single write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Data was handed to the transport in full
    Flushed,
    /// Data was buffered; wait for `drained()` before assuming delivery
    Pending,
}

/// Write half of a stream.
#[async_trait]
pub trait StreamWriter: Send + Sync {
    /// Write bytes.
    async fn write(&self, data: &[u8]) -> Result<WriteOutcome, TransportFailure>;

    /// Resolve once every pending write has drained.
    async fn drained(&self);

    /// Report a new window size, when the transport supports it.
    async fn resize(&self, _dimensions: Dimensions) -> Result<(), TransportFailure> {
        Ok(())
    }

    /// Close the stream from our side.
    async fn close(&self);

    /// Whether the stream is known to be closed.
    fn is_closed(&self) -> bool;
}

/// A shell stream: a shared write half plus the event receiver.
///
/// The receiver is single-consumer; whoever runs a command owns it for the
/// duration of that command.
pub struct ShellStream {
    /// Write half
    pub writer: Arc<dyn StreamWriter>,
    /// Read half
    pub events: mpsc::UnboundedReceiver<StreamEvent>,
}

impl ShellStream {
    /// Build a stream from its halves.
    pub fn new(writer: Arc<dyn StreamWriter>, events: mpsc::UnboundedReceiver<StreamEvent>) -> Self {
        Self { writer, events }
    }

    /// Split into halves.
    pub fn into_parts(self) -> (Arc<dyn StreamWriter>, mpsc::UnboundedReceiver<StreamEvent>) {
        (self.writer, self.events)
    }
}

impl std::fmt::Debug for ShellStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShellStream")
            .field("closed", &self.writer.is_closed())
            .finish_non_exhaustive()
    }
}

/// Write and, if the transport buffered the data, wait for the drain signal.
///
/// Fails with `TransportFailure::Timeout` if the drain does not arrive within
/// `drain_timeout`.
pub async fn write_with_drain(
    writer: &dyn StreamWriter,
    data: &[u8],
    drain_timeout: Duration,
) -> Result<(), TransportFailure> {
    if writer.is_closed() {
        return Err(TransportFailure::Closed);
    }

    match writer.write(data).await? {
        WriteOutcome::Flushed => Ok(()),
        WriteOutcome::Pending => {
            debug!("Write of {} bytes pending, waiting for drain", data.len());
            match tokio::time::timeout(drain_timeout, writer.drained()).await {
                Ok(()) => Ok(()),
                Err(_) => {
                    let millis = drain_timeout.as_millis() as u64;
                    warn!("Stream did not drain within {}ms", millis);
                    Err(TransportFailure::Timeout(millis))
                }
            }
        }
    }
}
