//! Session, command and destination types.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a logical session (one shell on one connection).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Create a new random session ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl From<Uuid> for SessionId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for one command execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct CommandId(Uuid);

impl CommandId {
    /// Create a new random command ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CommandId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CommandId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier a transport hands back for a physical connection.
///
/// Transports own the format; rexec treats it as opaque.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Wrap a transport-supplied identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh identifier for transports without their own ids.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Borrow the raw identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// How a destination is reached.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Shell on the local machine through a pseudo-terminal
    Local,
    /// Plain SSH to the destination
    DirectSsh,
    /// SSH to a JumpServer-style bastion, then menu navigation to the target
    Bastion,
    /// Transport supplied by a named plugin
    Plugin(String),
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Local => f.write_str("local"),
            TransportKind::DirectSsh => f.write_str("ssh"),
            TransportKind::Bastion => f.write_str("bastion"),
            TransportKind::Plugin(name) => write!(f, "plugin:{name}"),
        }
    }
}

/// Login material for a destination.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Credentials {
    /// Login user name
    pub username: String,
    /// Password, if password authentication is used
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Path to a private key, if key authentication is used
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key_path: Option<String>,
}

impl Credentials {
    /// Credentials with only a user name.
    pub fn user(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            ..Self::default()
        }
    }

    /// Attach a password.
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("private_key_path", &self.private_key_path)
            .finish()
    }
}

/// Where the bastion should take us once its menu is reached.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct BastionTarget {
    /// Asset address typed at the menu prompt
    pub target_host: String,
    /// Account id to pick when the asset has several accounts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account: Option<String>,
    /// Password for the target account, if the bastion asks for one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_password: Option<String>,
}

impl std::fmt::Debug for BastionTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BastionTarget")
            .field("target_host", &self.target_host)
            .field("account", &self.account)
            .field(
                "target_password",
                &self.target_password.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

/// A destination to open sessions against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
    /// Host name or address (the bastion itself for `TransportKind::Bastion`)
    pub host: String,
    /// Port
    pub port: u16,
    /// Login material
    pub credentials: Credentials,
    /// Transport used to reach `host`
    pub transport: TransportKind,
    /// Menu navigation target, only for bastion destinations
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bastion: Option<BastionTarget>,
}

impl Destination {
    /// A shell on the local machine.
    pub fn local() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 0,
            credentials: Credentials::default(),
            transport: TransportKind::Local,
            bastion: None,
        }
    }

    /// A plain SSH destination.
    pub fn ssh(host: impl Into<String>, port: u16, credentials: Credentials) -> Self {
        Self {
            host: host.into(),
            port,
            credentials,
            transport: TransportKind::DirectSsh,
            bastion: None,
        }
    }

    /// A target reached through a bastion menu.
    pub fn via_bastion(
        bastion_host: impl Into<String>,
        port: u16,
        credentials: Credentials,
        target: BastionTarget,
    ) -> Self {
        Self {
            host: bastion_host.into(),
            port,
            credentials,
            transport: TransportKind::Bastion,
            bastion: Some(target),
        }
    }

    /// Identity used for connection reuse.
    pub fn key(&self) -> DestinationKey {
        DestinationKey {
            host: self.host.clone(),
            port: self.port,
            username: self.credentials.username.clone(),
        }
    }
}

/// Reuse identity of a physical connection: (host, port, username).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DestinationKey {
    /// Host
    pub host: String,
    /// Port
    pub port: u16,
    /// User name
    pub username: String,
}

impl std::fmt::Display for DestinationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}:{}", self.username, self.host, self.port)
    }
}

/// Status of a logical session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Connection or handshake in progress
    Connecting,
    /// Ready to run a command
    Ready,
    /// A command is executing
    Busy,
    /// Stream closed or session destroyed
    Closed,
}

/// Information about a live session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    /// Session identifier
    pub id: SessionId,
    /// Reuse identity of the underlying connection
    pub destination: DestinationKey,
    /// Transport kind
    pub transport: TransportKind,
    /// Current status
    pub status: SessionStatus,
}
