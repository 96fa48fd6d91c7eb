//! Local shell on a pseudo-terminal, exposed as a `ShellStream`.

use async_trait::async_trait;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task;
use tracing::{debug, error, info, warn};

use rexec_core::{Dimensions, Error, Result, TransportFailure};

use crate::stream::{ShellStream, StreamEvent, StreamWriter, WriteOutcome};

/// Write half of a PTY-backed stream.
pub struct PtyWriter {
    master: Arc<Mutex<Option<Box<dyn MasterPty + Send>>>>,
    child: Arc<Mutex<Option<Box<dyn Child + Send + Sync>>>>,
    writer: Arc<Mutex<Option<Box<dyn Write + Send>>>>,
    closed: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<StreamEvent>,
}

impl std::fmt::Debug for PtyWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtyWriter")
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

/// Spawner for local PTY shells.
pub struct PtyStream;

impl PtyStream {
    /// Spawn `command` on a fresh pseudo-terminal.
    ///
    /// Must be called from within a tokio runtime; reads run on the blocking pool.
    ///
    /// # Example
    /// ```no_run
    /// use rexec_stream::PtyStream;
    /// use rexec_core::Dimensions;
    ///
    /// # async fn example() -> rexec_core::Result<()> {
    /// let stream = PtyStream::spawn("/bin/bash", &[], Dimensions::new(24, 80), None)?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn spawn(
        command: &str,
        args: &[String],
        dimensions: Dimensions,
        cwd: Option<&str>,
    ) -> Result<ShellStream> {
        info!(
            "Spawning PTY: command='{}' args={:?}, dimensions={}x{}, cwd={:?}",
            command, args, dimensions.rows, dimensions.cols, cwd
        );

        let pty_system = native_pty_system();
        let pair = pty_system.openpty(pty_size(dimensions)).map_err(|e| {
            error!("Failed to open PTY: {}", e);
            Error::Connect(format!("Failed to open PTY: {e}"))
        })?;

        let mut cmd = CommandBuilder::new(command);
        for arg in args {
            cmd.arg(arg);
        }
        if let Some(dir) = cwd {
            debug!("Setting working directory to: {}", dir);
            cmd.cwd(dir);
        }

        let child = pair.slave.spawn_command(cmd).map_err(|e| {
            error!("Failed to spawn command '{}': {}", command, e);
            Error::Connect(format!("Failed to spawn command: {e}"))
        })?;
        // The slave end belongs to the child now.
        drop(pair.slave);

        let writer = pair
            .master
            .take_writer()
            .map_err(|e| Error::Connect(format!("Failed to take writer: {e}")))?;
        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| Error::Connect(format!("Failed to clone reader: {e}")))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        spawn_reader(reader, tx.clone(), Arc::clone(&closed));

        info!("PTY spawned successfully: command='{}'", command);

        let writer = PtyWriter {
            master: Arc::new(Mutex::new(Some(pair.master))),
            child: Arc::new(Mutex::new(Some(child))),
            writer: Arc::new(Mutex::new(Some(writer))),
            closed,
            events: tx,
        };
        Ok(ShellStream::new(Arc::new(writer), rx))
    }
}

fn pty_size(dimensions: Dimensions) -> PtySize {
    PtySize {
        rows: dimensions.rows,
        cols: dimensions.cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

/// Blocking reads on a dedicated thread, forwarded as stream events.
fn spawn_reader(
    mut reader: Box<dyn Read + Send>,
    tx: mpsc::UnboundedSender<StreamEvent>,
    closed: Arc<AtomicBool>,
) {
    task::spawn_blocking(move || {
        let mut buffer = vec![0u8; 4096];
        loop {
            match reader.read(&mut buffer) {
                Ok(0) => {
                    debug!("PTY reader reached EOF");
                    if !closed.swap(true, Ordering::SeqCst) {
                        let _ = tx.send(StreamEvent::Closed);
                    }
                    break;
                }
                Ok(n) => {
                    if tx.send(StreamEvent::Data(buffer[..n].to_vec())).is_err() {
                        break; // Receiver dropped
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    // EIO is how Linux reports a hung-up PTY.
                    debug!("PTY read error: {}", e);
                    if !closed.swap(true, Ordering::SeqCst) {
                        let _ = tx.send(StreamEvent::Closed);
                    }
                    break;
                }
            }
        }
    });
}

#[async_trait]
impl StreamWriter for PtyWriter {
    async fn write(&self, data: &[u8]) -> std::result::Result<WriteOutcome, TransportFailure> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportFailure::Closed);
        }
        debug!("Writing {} bytes to PTY", data.len());

        let writer = Arc::clone(&self.writer);
        let data = data.to_vec();
        task::spawn_blocking(move || {
            let mut writer_lock = writer
                .lock()
                .map_err(|e| TransportFailure::WriteFailed(format!("Lock error: {e}")))?;
            let writer = writer_lock.as_mut().ok_or(TransportFailure::NotWritable)?;
            writer
                .write_all(&data)
                .and_then(|_| writer.flush())
                .map_err(|e| TransportFailure::WriteFailed(e.to_string()))
        })
        .await
        .map_err(|e| TransportFailure::WriteFailed(e.to_string()))??;

        Ok(WriteOutcome::Flushed)
    }

    async fn drained(&self) {}

    async fn resize(&self, dimensions: Dimensions) -> std::result::Result<(), TransportFailure> {
        info!("Resizing PTY to {}x{}", dimensions.rows, dimensions.cols);
        let master_lock = self
            .master
            .lock()
            .map_err(|e| TransportFailure::WriteFailed(format!("Lock error: {e}")))?;
        let master = master_lock.as_ref().ok_or(TransportFailure::Closed)?;
        master
            .resize(pty_size(dimensions))
            .map_err(|e| TransportFailure::WriteFailed(format!("Resize failed: {e}")))
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Closing PTY stream");

        if let Ok(mut writer) = self.writer.lock() {
            writer.take();
        }
        match self.child.lock() {
            Ok(mut child) => {
                if let Some(mut child) = child.take() {
                    if let Err(e) = child.kill() {
                        warn!("Failed to kill PTY child: {}", e);
                    }
                }
            }
            Err(e) => warn!("Child lock error during close: {}", e),
        }
        if let Ok(mut master) = self.master.lock() {
            master.take();
        }
        let _ = self.events.send(StreamEvent::Closed);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
