//! # rexec-detector
//!
//! Interaction detection for rexec.
//!
//! This crate decides when a remote command is waiting for a human:
//! - Versioned rule tables (quick prompts, pagers, exit keys, TUI programs)
//! - Stateless matching: quick rules, the generic prompt heuristic, pagers
//! - Full-screen program classification from the command text
//! - Output hashing for silence detection
//! - The optional language-model classifier contract and its strict schema
//! - The per-command `InteractionDetector` state machine
//!
//! ## Architecture
//!
//! This is Layer 2 in the architecture - it depends on rexec-core and
//! rexec-stream. The detector performs no IO; rexec-session drives it.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod classifier;
pub mod detector;
pub mod hash;
pub mod quick;
pub mod rules;
pub mod tui;

// Re-export commonly used types
pub use classifier::{
    ClassifierError, ClassifierVerdict, ClassifyRequest, InteractionClassifier, VerdictExitKey,
};
pub use detector::{DetectorConfig, DetectorEvent, InteractionDetector};
pub use hash::{HashCheck, OutputHasher};
pub use quick::{last_line, try_quick_match, QuickMatch};
pub use rules::{builtin_rules, RuleSet, RULESET_VERSION};
pub use tui::{classify_command, TuiCategory};
