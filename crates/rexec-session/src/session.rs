//! Remote shell session.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rexec_core::{
    ConnectionId, DestinationKey, Dimensions, SessionId, SessionInfo, SessionStatus,
    TransportFailure, TransportKind,
};
use rexec_stream::{write_with_drain, ShellStream, StreamEvent, StreamWriter};
use tokio::sync::{mpsc, watch, Mutex, MutexGuard};
use tracing::{debug, info};

/// One logical shell on a physical connection.
///
/// Commands run one at a time: the runner holds the event receiver for the
/// whole execution, and later commands queue on its lock.
pub struct Session {
    /// Session identifier
    id: SessionId,

    /// Reuse identity of the connection
    destination: DestinationKey,

    /// Transport that opened the shell
    transport: TransportKind,

    /// Physical connection the shell lives on
    connection_id: ConnectionId,

    /// Write half of the shell stream
    writer: Arc<dyn StreamWriter>,

    /// Read half of the shell stream
    events: Mutex<mpsc::UnboundedReceiver<StreamEvent>>,

    /// Current status
    status: watch::Sender<SessionStatus>,

    /// Bound on waiting for a buffered write to drain
    drain_timeout: Duration,

    /// Session creation time
    created_at: DateTime<Utc>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("destination", &self.destination)
            .field("transport", &self.transport)
            .field("connection_id", &self.connection_id)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Wrap an open shell stream.
    pub fn new(
        destination: DestinationKey,
        transport: TransportKind,
        connection_id: ConnectionId,
        stream: ShellStream,
        drain_timeout: Duration,
    ) -> Self {
        let id = SessionId::new();
        let (writer, events) = stream.into_parts();
        let (status, _) = watch::channel(SessionStatus::Ready);
        info!("Session {} ready on {} via {}", id, destination, transport);
        Self {
            id,
            destination,
            transport,
            connection_id,
            writer,
            events: Mutex::new(events),
            status,
            drain_timeout,
            created_at: Utc::now(),
        }
    }

    /// Get the session ID.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Reuse identity of the underlying connection.
    pub fn destination(&self) -> &DestinationKey {
        &self.destination
    }

    /// Transport kind.
    pub fn transport_kind(&self) -> &TransportKind {
        &self.transport
    }

    /// Physical connection.
    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    /// Creation time.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Current status.
    pub fn status(&self) -> SessionStatus {
        *self.status.borrow()
    }

    /// Watch status changes.
    pub fn subscribe_status(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    /// Whether the session can no longer run commands.
    pub fn is_closed(&self) -> bool {
        self.status() == SessionStatus::Closed || self.writer.is_closed()
    }

    /// Snapshot for listings.
    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id,
            destination: self.destination.clone(),
            transport: self.transport.clone(),
            status: self.status(),
        }
    }

    /// Write half of the stream.
    pub fn writer(&self) -> Arc<dyn StreamWriter> {
        Arc::clone(&self.writer)
    }

    /// Type `data` into the shell, waiting for a full buffer to drain.
    pub async fn send_input(&self, data: &[u8]) -> Result<(), TransportFailure> {
        if self.status() == SessionStatus::Closed {
            return Err(TransportFailure::Closed);
        }
        write_with_drain(self.writer.as_ref(), data, self.drain_timeout).await
    }

    /// Change the window size.
    pub async fn resize(&self, dimensions: Dimensions) -> Result<(), TransportFailure> {
        debug!("Resizing session {} to {}x{}", self.id, dimensions.rows, dimensions.cols);
        self.writer.resize(dimensions).await
    }

    /// Close the shell. Idempotent.
    pub async fn close(&self) {
        if self.status() != SessionStatus::Closed {
            info!("Closing session {}", self.id);
        }
        self.set_status(SessionStatus::Closed);
        self.writer.close().await;
    }

    pub(crate) fn set_status(&self, status: SessionStatus) {
        self.status.send_if_modified(|current| {
            // Closed is terminal.
            if *current == status || *current == SessionStatus::Closed {
                return false;
            }
            *current = status;
            true
        });
    }

    pub(crate) async fn lock_events(&self) -> MutexGuard<'_, mpsc::UnboundedReceiver<StreamEvent>> {
        self.events.lock().await
    }
}
