//! In-memory stream pair for plugin transports and tests.
//!
//! `ChannelStream::pair()` returns the `ShellStream` a session consumes plus a
//! `RemoteEnd` that plays the remote shell: it sees every write and can push
//! output, close the stream, or simulate a congested transport.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Notify};
use tracing::debug;

use rexec_core::{Dimensions, TransportFailure};

use crate::stream::{ShellStream, StreamEvent, StreamWriter, WriteOutcome};

/// How the simulated transport treats writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WriteMode {
    /// Every write is flushed immediately
    Immediate = 0,
    /// Writes are buffered until `RemoteEnd::drain` is called
    Buffered = 1,
    /// Writes fail with `NotWritable`
    Rejecting = 2,
}

impl WriteMode {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => WriteMode::Buffered,
            2 => WriteMode::Rejecting,
            _ => WriteMode::Immediate,
        }
    }
}

#[derive(Debug)]
struct Shared {
    closed: AtomicBool,
    pending: AtomicBool,
    mode: AtomicU8,
    drain: Notify,
}

/// Write half of a channel stream.
#[derive(Debug)]
pub struct ChannelWriter {
    shared: Arc<Shared>,
    written: mpsc::UnboundedSender<Vec<u8>>,
    events: mpsc::UnboundedSender<StreamEvent>,
    window: watch::Sender<Option<Dimensions>>,
}

#[async_trait]
impl StreamWriter for ChannelWriter {
    async fn write(&self, data: &[u8]) -> Result<WriteOutcome, TransportFailure> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(TransportFailure::Closed);
        }

        let mode = WriteMode::from_u8(self.shared.mode.load(Ordering::SeqCst));
        if mode == WriteMode::Rejecting {
            return Err(TransportFailure::NotWritable);
        }

        self.written
            .send(data.to_vec())
            .map_err(|_| TransportFailure::WriteFailed("remote end dropped".to_string()))?;

        if mode == WriteMode::Buffered {
            self.shared.pending.store(true, Ordering::SeqCst);
            return Ok(WriteOutcome::Pending);
        }
        Ok(WriteOutcome::Flushed)
    }

    async fn drained(&self) {
        loop {
            let notified = self.shared.drain.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if !self.shared.pending.load(Ordering::SeqCst)
                || self.shared.closed.load(Ordering::SeqCst)
            {
                return;
            }
            notified.await;
        }
    }

    async fn resize(&self, dimensions: Dimensions) -> Result<(), TransportFailure> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(TransportFailure::Closed);
        }
        self.window.send_replace(Some(dimensions));
        Ok(())
    }

    async fn close(&self) {
        if !self.shared.closed.swap(true, Ordering::SeqCst) {
            debug!("Channel stream closed locally");
            let _ = self.events.send(StreamEvent::Closed);
            self.shared.drain.notify_waiters();
        }
    }

    fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }
}

/// The remote side of a channel stream.
#[derive(Debug)]
pub struct RemoteEnd {
    shared: Arc<Shared>,
    events: mpsc::UnboundedSender<StreamEvent>,
    written: mpsc::UnboundedReceiver<Vec<u8>>,
    window: watch::Receiver<Option<Dimensions>>,
}

impl RemoteEnd {
    /// Push output towards the session. Returns false once the stream is closed.
    pub fn send(&self, data: impl AsRef<[u8]>) -> bool {
        if self.shared.closed.load(Ordering::SeqCst) {
            return false;
        }
        self.events
            .send(StreamEvent::Data(data.as_ref().to_vec()))
            .is_ok()
    }

    /// Close the stream from the remote side.
    pub fn close(&self) {
        if !self.shared.closed.swap(true, Ordering::SeqCst) {
            let _ = self.events.send(StreamEvent::Closed);
            self.shared.drain.notify_waiters();
        }
    }

    /// Report a stream error; the stream counts as closed afterwards.
    pub fn fail(&self, message: impl Into<String>) {
        if !self.shared.closed.swap(true, Ordering::SeqCst) {
            let _ = self.events.send(StreamEvent::Error(message.into()));
            self.shared.drain.notify_waiters();
        }
    }

    /// Wait for the next write from the session side.
    pub async fn next_write(&mut self) -> Option<Vec<u8>> {
        self.written.recv().await
    }

    /// Wait for the next write and decode it lossily.
    pub async fn next_write_str(&mut self) -> Option<String> {
        self.next_write()
            .await
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Everything written so far that has not been read yet.
    pub fn take_written(&mut self) -> Vec<u8> {
        let mut out = Vec::new();
        while let Ok(chunk) = self.written.try_recv() {
            out.extend(chunk);
        }
        out
    }

    /// Switch the simulated write behavior.
    pub fn set_write_mode(&self, mode: WriteMode) {
        self.shared.mode.store(mode as u8, Ordering::SeqCst);
    }

    /// Flush buffered writes and wake drain waiters.
    pub fn drain(&self) {
        self.shared.pending.store(false, Ordering::SeqCst);
        self.shared.drain.notify_waiters();
    }

    /// Last window size reported by the session.
    pub fn window_size(&self) -> Option<Dimensions> {
        *self.window.borrow()
    }

    /// Whether either side closed the stream.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }
}

/// Constructor for in-memory stream pairs.
pub struct ChannelStream;

impl ChannelStream {
    /// Create a connected `ShellStream` / `RemoteEnd` pair.
    pub fn pair() -> (ShellStream, RemoteEnd) {
        let shared = Arc::new(Shared {
            closed: AtomicBool::new(false),
            pending: AtomicBool::new(false),
            mode: AtomicU8::new(WriteMode::Immediate as u8),
            drain: Notify::new(),
        });
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (written_tx, written_rx) = mpsc::unbounded_channel();
        let (window_tx, window_rx) = watch::channel(None);

        let writer = ChannelWriter {
            shared: Arc::clone(&shared),
            written: written_tx,
            events: events_tx.clone(),
            window: window_tx,
        };
        let remote = RemoteEnd {
            shared,
            events: events_tx,
            written: written_rx,
            window: window_rx,
        };

        (ShellStream::new(Arc::new(writer), events_rx), remote)
    }
}
