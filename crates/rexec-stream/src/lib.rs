//! # rexec-stream
//!
//! Byte stream plumbing for rexec.
//!
//! This crate provides:
//! - The `StreamWriter` trait and `ShellStream` pair every transport hands out
//! - Backpressure-aware writes (`write_with_drain`)
//! - A local pseudo-terminal stream built on portable-pty
//! - An in-memory stream pair for plugin transports and tests
//! - A persistent ANSI filter that reports alternate-screen transitions
//!
//! ## Architecture
//!
//! This is Layer 1 in the architecture - it depends on rexec-core and is
//! consumed by the detector and session crates.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod ansi;
pub mod memory;
pub mod pty;
pub mod stream;

// Re-export commonly used types
pub use ansi::{strip_ansi, AltScreen, AnsiFilter, FilteredChunk};
pub use memory::{ChannelStream, ChannelWriter, RemoteEnd, WriteMode};
pub use pty::{PtyStream, PtyWriter};
pub use stream::{write_with_drain, ShellStream, StreamEvent, StreamWriter, WriteOutcome};
