//! Local shell transport over a pseudo-terminal.

use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;
use rexec_core::{ConnectionId, Destination, Dimensions, Error, Result, TransportKind};
use rexec_stream::{PtyStream, ShellStream};
use tracing::{debug, info};

use crate::transport::{ConnectOutcome, Transport};

/// Runs commands in a shell on this machine.
#[derive(Debug)]
pub struct LocalTransport {
    shell: String,
    args: Vec<String>,
    cwd: Option<String>,
    connections: Mutex<HashSet<ConnectionId>>,
}

impl Default for LocalTransport {
    fn default() -> Self {
        let shell = std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string());
        Self::new(shell, Vec::new())
    }
}

impl LocalTransport {
    /// Transport spawning `shell` with `args`.
    pub fn new(shell: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            shell: shell.into(),
            args,
            cwd: None,
            connections: Mutex::new(HashSet::new()),
        }
    }

    /// Start shells in `cwd`.
    pub fn with_cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    fn connections(&self) -> std::sync::MutexGuard<'_, HashSet<ConnectionId>> {
        self.connections.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Transport for LocalTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Local
    }

    async fn connect(&self, _destination: &Destination) -> Result<ConnectOutcome> {
        let id = ConnectionId::generate();
        self.connections().insert(id.clone());
        debug!("Local connection {} ready", id);
        Ok(ConnectOutcome::Connected(id))
    }

    async fn open_shell(&self, connection: &ConnectionId, dimensions: Dimensions) -> Result<ShellStream> {
        if !self.connections().contains(connection) {
            return Err(Error::Connect(format!("unknown local connection {connection}")));
        }
        info!("Spawning local shell {} ({}x{})", self.shell, dimensions.cols, dimensions.rows);
        PtyStream::spawn(&self.shell, &self.args, dimensions, self.cwd.as_deref())
    }

    async fn disconnect(&self, connection: &ConnectionId) -> Result<()> {
        self.connections().remove(connection);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_and_disconnect() {
        let transport = LocalTransport::new("/bin/sh", Vec::new());
        let id = match transport.connect(&Destination::local()).await.unwrap() {
            ConnectOutcome::Connected(id) => id,
            other => panic!("unexpected outcome {other:?}"),
        };
        transport.disconnect(&id).await.unwrap();
        let err = transport
            .open_shell(&id, Dimensions::new(24, 80))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Connect(_)));
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn test_local_shell_runs() {
        let transport = LocalTransport::new("/bin/sh", Vec::new());
        let ConnectOutcome::Connected(id) = transport.connect(&Destination::local()).await.unwrap() else {
            panic!("local connect needs no challenge");
        };
        let stream = transport.open_shell(&id, Dimensions::new(24, 80)).await.unwrap();
        stream.writer.close().await;
    }
}
