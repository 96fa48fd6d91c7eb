//! # rexec-session
//!
//! Session management for rexec.
//!
//! This crate provides:
//! - Marker-wrapped command execution over a shell stream
//! - Per-command interaction watching and routing of host answers
//! - Transports and a connection pool shared by sessions on one destination
//! - Bastion menu navigation up to a usable shell
//! - The `SessionManager` tying these together
//!
//! ## Architecture
//!
//! This is Layer 3 in the architecture - it depends on rexec-core,
//! rexec-stream and rexec-detector, and owns all IO and timers.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod handshake;
pub mod local;
pub mod manager;
pub mod marker;
pub mod pool;
pub mod router;
pub mod runner;
pub mod session;
pub mod transport;
pub mod watch;

// Re-export commonly used types
pub use handshake::{
    run_handshake, AccountOption, BastionHandshake, HandshakeConfig, HandshakeHost,
    HandshakePhase, HandshakeProgress, NoHandshakeHost,
};
pub use local::LocalTransport;
pub use manager::{
    CommandEvent, CommandHandle, RunOptions, SessionManager, SessionManagerBuilder,
    SessionManagerConfig,
};
pub use marker::{wrap_command, MarkerPair};
pub use pool::ConnectionPool;
pub use router::InteractionRouter;
pub use runner::{
    CommandExecution, CompletionReason, ExecutionState, MarkerParser, RunOutcome,
    RunnerCallbacks, RunnerConfig, RunnerControl,
};
pub use session::Session;
pub use transport::{ConnectOutcome, MfaChallenge, Transport, TransportRegistry};
pub use watch::{spawn_watch, HostEvent, OutputGate, WatchContext, WatchInput};
