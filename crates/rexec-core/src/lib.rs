//! # rexec-core
//!
//! Core types for rexec.
//!
//! This crate contains all fundamental types with **no internal dependencies**
//! on other rexec crates. It provides:
//!
//! - Identifier types (SessionId, CommandId, ConnectionId)
//! - Destination and transport descriptions
//! - Interaction request types shared by the detector and the host UI
//! - Key types for input injection
//! - Error types
//! - YAML configuration and logging bootstrap
//!
//! ## Architecture
//!
//! This is Layer 0 in the architecture - all other crates depend on this one,
//! but this crate has no dependencies on other rexec crates.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod geometry;
pub mod interaction;
pub mod key;
pub mod logging;
pub mod session;

// Re-export commonly used types
pub use config::{
    BastionSettings, CustomRuleConfig, DetectorSettings, LoggingSettings, RexecConfig,
    RunnerSettings, SessionSettings,
};
pub use error::{Error, Result, TransportFailure};
pub use geometry::Dimensions;
pub use interaction::{
    ConfirmValues, ExitKey, InteractionReason, InteractionRequest, InteractionType,
    MAX_PROMPT_HINT_CHARS,
};
pub use key::Key;
pub use logging::{init_logging, LogFormat};
pub use session::{
    BastionTarget, CommandId, ConnectionId, Credentials, Destination, DestinationKey, SessionId,
    SessionInfo, SessionStatus, TransportKind,
};
