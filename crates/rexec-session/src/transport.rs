//! Transport contract and registry.
//!
//! A transport turns a [`Destination`] into physical connections and opens
//! shell streams on them. SSH clients and plugin transports live outside
//! this crate and plug in through [`Transport`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use rexec_core::{ConnectionId, Destination, Dimensions, Error, Result, TransportKind};
use rexec_stream::ShellStream;
use serde::{Deserialize, Serialize};

/// Two-factor or keyboard-interactive challenge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MfaChallenge {
    /// Prompt text shown to the user
    pub prompt: String,
    /// Whether the answer may be echoed
    #[serde(default)]
    pub echo: bool,
}

/// Result of a connection attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// Authenticated and ready for shells
    Connected(ConnectionId),
    /// The server wants an answer before authentication completes
    MfaRequired {
        /// Half-open connection awaiting the answer
        connection_id: ConnectionId,
        /// Challenge to forward to the user
        challenge: MfaChallenge,
    },
}

/// A way of reaching destinations.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Kind served by this transport.
    fn kind(&self) -> TransportKind;

    /// Establish a physical connection.
    async fn connect(&self, destination: &Destination) -> Result<ConnectOutcome>;

    /// Answer a pending challenge on a half-open connection.
    async fn answer_mfa(&self, connection: &ConnectionId, _response: &str) -> Result<ConnectOutcome> {
        Err(Error::Connect(format!(
            "{} transport does not support challenges ({})",
            self.kind(),
            connection
        )))
    }

    /// Open a new shell on an established connection.
    async fn open_shell(&self, connection: &ConnectionId, dimensions: Dimensions) -> Result<ShellStream>;

    /// Tear down a physical connection.
    async fn disconnect(&self, connection: &ConnectionId) -> Result<()>;

    /// Ask the transport to reload its asset list, where it has one.
    async fn refresh_assets(&self, _connection: &ConnectionId) -> Result<()> {
        Ok(())
    }
}

/// Transports by kind.
#[derive(Clone, Default)]
pub struct TransportRegistry {
    transports: HashMap<TransportKind, Arc<dyn Transport>>,
}

impl TransportRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `transport` under its kind, replacing any previous one.
    pub fn register(&mut self, transport: Arc<dyn Transport>) {
        self.transports.insert(transport.kind(), transport);
    }

    /// Transport for `kind`.
    pub fn get(&self, kind: &TransportKind) -> Result<Arc<dyn Transport>> {
        self.transports
            .get(kind)
            .cloned()
            .ok_or_else(|| Error::TransportUnavailable(kind.to_string()))
    }

    /// Whether `kind` is served.
    pub fn contains(&self, kind: &TransportKind) -> bool {
        self.transports.contains_key(kind)
    }

    /// Registered kinds.
    pub fn kinds(&self) -> impl Iterator<Item = &TransportKind> {
        self.transports.keys()
    }
}

impl std::fmt::Debug for TransportRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.transports.keys()).finish()
    }
}
