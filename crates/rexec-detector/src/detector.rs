//! The per-command interaction detector.
//!
//! [`InteractionDetector`] is a sans-IO state machine. The owner feeds it
//! filtered output chunks and calls [`InteractionDetector::poll`] when
//! [`InteractionDetector::next_deadline`] is reached; every call returns the
//! [`DetectorEvent`]s the owner must act on. All timers are plain deadlines,
//! so rescheduling one simply overwrites the previous value.
//!
//! Per chunk, in priority order:
//!
//! 1. pager status lines raise a `pager` interaction at once
//! 2. alternate-screen transitions open the pager observation window and arm
//!    the TUI silence timer
//! 3. while the alternate screen is active no line rules run
//! 4. quick rules raise at once
//! 5. the generic prompt heuristic raises after the debounce window
//!
//! Independently, a backoff timer hashes the recent output and either asks
//! the classifier (output changed) or counts towards the silence popup
//! (output unchanged).

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use rexec_core::{
    CommandId, ConfirmValues, DetectorSettings, ExitKey, InteractionReason, InteractionRequest,
    InteractionType,
};
use rexec_stream::{AltScreen, FilteredChunk};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::classifier::{ClassifierError, ClassifierVerdict, ClassifyRequest};
use crate::hash::{tail_chars, HashCheck, OutputHasher};
use crate::quick::last_line;
use crate::rules::RuleSet;
use crate::tui::{classify_command, TuiCategory};

// Lines of context handed to the quick matcher (options sit above the prompt).
const CONTEXT_LINES: usize = 24;

// Dismissals before the detector backs off to slow polling.
const SLOW_MODE_DISMISSALS: u32 = 2;

// Dismissals before all further prompts are suppressed.
const SUPPRESS_DISMISSALS: u32 = 3;

/// Runtime detector configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectorConfig {
    /// Quiet period before a heuristic prompt is raised
    pub debounce: Duration,
    /// First deep-check delay
    pub initial_timeout: Duration,
    /// Backoff ceiling
    pub max_timeout: Duration,
    /// Deep checks per command before scheduling stops
    pub max_calls: u32,
    /// Unchanged hashes in a row that force the silence popup
    pub max_hash_unchanged_count: u32,
    /// Absolute silence that forces the silence popup
    pub max_silent_timeout: Duration,
    /// Characters hashed per check
    pub hash_window_chars: usize,
    /// Alternate-screen silence before a TUI is cancelled
    pub tui_silence: Duration,
    /// Cancel deadline for TUI commands that never switch screens
    pub tui_backstop: Duration,
    /// Wait for a pager pattern after entering the alternate screen
    pub pager_observation: Duration,
    /// Output tail kept for hints and the classifier
    pub output_buffer_chars: usize,
    /// Completed lines kept
    pub line_buffer_lines: usize,
    /// Network retries before giving up on the classifier
    pub classifier_max_retries: u32,
    /// First retry delay, doubled per attempt
    pub classifier_retry_base: Duration,
    /// Deep-check period in slow mode
    pub slow_poll: Duration,
    /// Locale passed to the classifier
    pub locale: String,
}

impl From<&DetectorSettings> for DetectorConfig {
    fn from(s: &DetectorSettings) -> Self {
        Self {
            debounce: Duration::from_millis(s.debounce_ms),
            initial_timeout: Duration::from_millis(s.initial_timeout_ms),
            max_timeout: Duration::from_millis(s.max_timeout_ms),
            max_calls: s.max_calls,
            max_hash_unchanged_count: s.max_hash_unchanged_count,
            max_silent_timeout: Duration::from_millis(s.max_silent_timeout_ms),
            hash_window_chars: s.hash_window_chars,
            tui_silence: Duration::from_millis(s.tui_silence_ms),
            tui_backstop: Duration::from_millis(s.tui_backstop_ms),
            pager_observation: Duration::from_millis(s.pager_observation_ms),
            output_buffer_chars: s.output_buffer_chars,
            line_buffer_lines: s.line_buffer_lines,
            classifier_max_retries: s.classifier_max_retries,
            classifier_retry_base: Duration::from_millis(s.classifier_retry_base_ms),
            slow_poll: Duration::from_millis(s.slow_poll_ms),
            locale: s.locale.clone(),
        }
    }
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self::from(&DetectorSettings::default())
    }
}

/// Something the owner of the detector must act on.
#[derive(Debug, Clone, PartialEq)]
pub enum DetectorEvent {
    /// Show this interaction; the detector is paused until resumed or dismissed
    InteractionNeeded(InteractionRequest),
    /// An interaction was detected while prompts are suppressed
    InteractionSuppressed(InteractionRequest),
    /// A full-screen program without a pager took over the terminal
    AlternateScreenEntered,
    /// A listed full-screen program was cancelled
    TuiDetected {
        /// Classification of the command
        category: TuiCategory,
    },
    /// Write the interrupt key to the stream
    SendInterrupt,
    /// Ask the classifier, then report back through `on_classification`
    Classify(ClassifyRequest),
}

/// Per-command interaction detector.
#[derive(Debug)]
pub struct InteractionDetector {
    command_id: CommandId,
    command: String,
    config: DetectorConfig,
    rules: Arc<RuleSet>,
    classifier_enabled: bool,
    tui_category: TuiCategory,

    lines: VecDeque<(u64, String)>,
    pending: String,
    pending_cr: bool,
    line_seq: u64,
    recent: String,
    paused_output: String,
    hasher: OutputHasher,
    answered_seq: Option<u64>,
    cancelled_prompt_seq: Option<u64>,

    paused: bool,
    suppressed: bool,
    disposed: bool,
    dismiss_count: u32,
    slow_mode: bool,
    in_alt_screen: bool,
    pager_seen: bool,
    tui_handled: bool,
    silence_raised: bool,

    debounce_at: Option<Instant>,
    pending_prompt: Option<(u64, InteractionRequest)>,
    deep_check_at: Option<Instant>,
    pager_window_at: Option<Instant>,
    tui_silence_at: Option<Instant>,
    tui_backstop_at: Option<Instant>,
    retry_at: Option<Instant>,

    current_timeout: Duration,
    calls: u32,
    unchanged_count: u32,
    silent_since: Instant,

    generation: u64,
    in_flight: Option<u64>,
    attempt: u32,
}

impl InteractionDetector {
    /// Create a detector for one command and arm its first timers.
    pub fn new(
        command_id: CommandId,
        command: impl Into<String>,
        config: DetectorConfig,
        rules: Arc<RuleSet>,
        classifier_enabled: bool,
        now: Instant,
    ) -> Self {
        let command = command.into();
        let tui_category = classify_command(&rules, &command);
        let hasher = OutputHasher::new(config.hash_window_chars);
        let current_timeout = config.initial_timeout;

        let mut detector = Self {
            command_id,
            command,
            config,
            rules,
            classifier_enabled,
            tui_category,
            lines: VecDeque::new(),
            pending: String::new(),
            pending_cr: false,
            line_seq: 0,
            recent: String::new(),
            paused_output: String::new(),
            hasher,
            answered_seq: None,
            cancelled_prompt_seq: None,
            paused: false,
            suppressed: false,
            disposed: false,
            dismiss_count: 0,
            slow_mode: false,
            in_alt_screen: false,
            pager_seen: false,
            tui_handled: false,
            silence_raised: false,
            debounce_at: None,
            pending_prompt: None,
            deep_check_at: None,
            pager_window_at: None,
            tui_silence_at: None,
            tui_backstop_at: None,
            retry_at: None,
            current_timeout,
            calls: 0,
            unchanged_count: 0,
            silent_since: now,
            generation: 0,
            in_flight: None,
            attempt: 0,
        };

        detector.schedule_deep_check(now);
        detector.arm_backstop(now);
        debug!(
            "Detector for {} created (tui category {:?})",
            detector.command_id, detector.tui_category
        );
        detector
    }

    /// Command this detector watches.
    pub fn command_id(&self) -> CommandId {
        self.command_id
    }

    /// TUI classification of the command.
    pub fn tui_category(&self) -> TuiCategory {
        self.tui_category
    }

    /// Whether an interaction is currently shown.
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Whether prompts are suppressed.
    pub fn is_suppressed(&self) -> bool {
        self.suppressed
    }

    /// Whether the detector is in slow polling mode.
    pub fn is_slow_mode(&self) -> bool {
        self.slow_mode
    }

    /// Whether the detector has been disposed.
    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// Number of dismissals since the last unsuppress.
    pub fn dismiss_count(&self) -> u32 {
        self.dismiss_count
    }

    /// Completed lines currently buffered, oldest first.
    pub fn buffered_lines(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().map(|(_, line)| line.as_str())
    }

    /// Earliest pending deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        if self.disposed {
            return None;
        }
        [
            self.debounce_at,
            self.deep_check_at,
            self.pager_window_at,
            self.tui_silence_at,
            self.tui_backstop_at,
            self.retry_at,
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// Process one output chunk.
    pub fn feed(&mut self, chunk: &FilteredChunk, now: Instant) -> Vec<DetectorEvent> {
        let mut events = Vec::new();
        if self.disposed {
            return events;
        }

        if self.paused {
            self.paused_output.push_str(&chunk.text);
            match chunk.alt_screen {
                Some(AltScreen::Entered) => self.in_alt_screen = true,
                Some(AltScreen::Exited) => self.in_alt_screen = false,
                None => {}
            }
            return events;
        }

        let text = chunk.text.as_str();
        if !text.is_empty() {
            self.record(text);
            // New output cancels a prompt still inside its debounce window.
            if let Some((seq, _)) = self.pending_prompt.take() {
                self.debounce_at = None;
                self.cancelled_prompt_seq = Some(seq);
            }
        }

        match chunk.alt_screen {
            Some(AltScreen::Exited) => {
                debug!("Command {} left the alternate screen", self.command_id);
                self.in_alt_screen = false;
                self.pager_seen = false;
                self.pager_window_at = None;
                self.tui_silence_at = None;
            }
            Some(AltScreen::Entered) => {
                debug!("Command {} entered the alternate screen", self.command_id);
                self.in_alt_screen = true;
                self.pager_seen = false;
                self.pager_window_at = Some(now + self.config.pager_observation);
                self.arm_tui_silence(now);
            }
            None => {}
        }

        if !text.is_empty() {
            if let Some(rule) = self.rules.match_pager(text) {
                self.pager_seen = true;
                self.pager_window_at = None;
                self.tui_silence_at = None;
                self.tui_backstop_at = None;
                let exit_key = self
                    .rules
                    .detect_exit_key(text)
                    .unwrap_or_else(|| ExitKey::new("q", false));
                debug!("Pager rule {} matched for {}", rule, self.command_id);
                let request = InteractionRequest::new(
                    self.command_id,
                    InteractionType::Pager,
                    last_line(text),
                    InteractionReason::Pager,
                )
                .with_exit_key(Some(exit_key));
                let (seq, _) = self.candidate();
                self.raise(request, seq, &mut events);
                return events;
            }
        }

        if self.in_alt_screen {
            if !text.is_empty() && chunk.alt_screen.is_none() {
                self.arm_tui_silence(now);
            }
            return events;
        }

        if !text.is_empty() {
            self.evaluate_rules(now, &mut events);
        }
        events
    }

    /// Fire every timer whose deadline has passed.
    pub fn poll(&mut self, now: Instant) -> Vec<DetectorEvent> {
        let mut events = Vec::new();
        if self.disposed || self.paused {
            return events;
        }

        if due(self.debounce_at, now) {
            self.debounce_at = None;
            if let Some((seq, request)) = self.pending_prompt.take() {
                debug!("Prompt heuristic settled for {}", self.command_id);
                self.raise(request, seq, &mut events);
                if self.paused {
                    return events;
                }
            }
        }

        if due(self.pager_window_at, now) {
            self.pager_window_at = None;
            if self.in_alt_screen && !self.pager_seen {
                info!("Command {} is running a full-screen program", self.command_id);
                events.push(DetectorEvent::AlternateScreenEntered);
            }
        }

        if due(self.tui_silence_at, now) || due(self.tui_backstop_at, now) {
            self.tui_silence_at = None;
            self.tui_backstop_at = None;
            if self.tui_category.auto_cancels() && !self.tui_handled {
                self.tui_handled = true;
                info!(
                    "Cancelling full-screen command {} ({:?})",
                    self.command_id, self.tui_category
                );
                events.push(DetectorEvent::SendInterrupt);
                events.push(DetectorEvent::TuiDetected {
                    category: self.tui_category,
                });
            }
        }

        if due(self.retry_at, now) {
            self.retry_at = None;
            events.push(self.start_classification());
        }

        if due(self.deep_check_at, now) {
            self.deep_check_at = None;
            self.deep_check(now, &mut events);
        }

        events
    }

    /// Deliver the classifier's answer for the request tagged `generation`.
    pub fn on_classification(
        &mut self,
        generation: u64,
        result: Result<serde_json::Value, ClassifierError>,
        now: Instant,
    ) -> Vec<DetectorEvent> {
        let mut events = Vec::new();
        if self.disposed || self.in_flight != Some(generation) {
            debug!("Dropping stale classifier answer for {}", self.command_id);
            return events;
        }
        self.in_flight = None;
        if self.paused {
            return events;
        }

        let (seq, line) = self.candidate();
        let hint = if line.trim().is_empty() {
            self.last_nonempty_line()
        } else {
            line
        };

        let verdict = match result.and_then(ClassifierVerdict::from_value) {
            Ok(verdict) => verdict,
            Err(err) if err.is_retryable() => {
                if self.attempt < self.config.classifier_max_retries {
                    let delay = self.config.classifier_retry_base * 2u32.saturating_pow(self.attempt);
                    self.attempt += 1;
                    warn!(
                        "Classifier call for {} failed ({}), retry {} in {:?}",
                        self.command_id, err, self.attempt, delay
                    );
                    self.retry_at = Some(now + delay);
                } else {
                    warn!(
                        "Classifier unavailable for {} after {} retries",
                        self.command_id, self.attempt
                    );
                    self.attempt = 0;
                    let request = InteractionRequest::new(
                        self.command_id,
                        InteractionType::Freeform,
                        &hint,
                        InteractionReason::ServiceUnavailable,
                    );
                    self.raise(request, seq, &mut events);
                }
                return events;
            }
            Err(err) => {
                warn!("Unusable classifier answer for {}: {}", self.command_id, err);
                self.attempt = 0;
                let request = InteractionRequest::new(
                    self.command_id,
                    InteractionType::Freeform,
                    &hint,
                    InteractionReason::ClassifierDegraded,
                );
                self.raise(request, seq, &mut events);
                return events;
            }
        };

        self.attempt = 0;
        if !verdict.needs_interaction {
            debug!("Classifier says {} needs no input", self.command_id);
            return events;
        }

        let interaction_type = verdict.interaction_type.unwrap_or(InteractionType::Freeform);
        let prompt_hint = verdict.prompt_hint.clone().unwrap_or(hint);
        let exit_key = self
            .rules
            .detect_exit_key(&self.recent)
            .or_else(|| verdict.exit_key());

        let mut request = InteractionRequest::new(
            self.command_id,
            interaction_type,
            &prompt_hint,
            InteractionReason::Classifier,
        )
        .with_options(verdict.options.clone())
        .with_exit_key(exit_key);
        if interaction_type == InteractionType::Confirm {
            request = request.with_confirm_values(
                verdict
                    .confirm_values
                    .clone()
                    .unwrap_or_else(|| ConfirmValues::new("y", "n", None)),
            );
        }
        self.raise(request, seq, &mut events);
        events
    }

    /// The shown interaction was answered or cancelled.
    pub fn resume(&mut self, now: Instant) -> Vec<DetectorEvent> {
        if self.disposed || !self.paused {
            return Vec::new();
        }
        self.paused = false;

        // Output that arrived while paused goes into the buffers in order.
        let buffered = std::mem::take(&mut self.paused_output);
        if !buffered.is_empty() {
            self.record(&buffered);
        }

        self.reset_backoff(now);
        self.schedule_deep_check(now);
        if self.in_alt_screen && !self.pager_seen {
            self.arm_tui_silence(now);
        } else if !self.in_alt_screen {
            self.pager_seen = false;
            self.arm_backstop(now);
        }
        debug!("Detector for {} resumed", self.command_id);
        Vec::new()
    }

    /// The shown interaction was closed without an answer.
    pub fn dismiss(&mut self, now: Instant) -> Vec<DetectorEvent> {
        if self.disposed {
            return Vec::new();
        }
        self.dismiss_count += 1;
        if self.dismiss_count >= SLOW_MODE_DISMISSALS && !self.slow_mode {
            info!("Detector for {} switched to slow polling", self.command_id);
            self.slow_mode = true;
        }
        if self.dismiss_count >= SUPPRESS_DISMISSALS && !self.suppressed {
            info!(
                "Suppressing prompts for {} after {} dismissals",
                self.command_id, self.dismiss_count
            );
            self.suppressed = true;
        }
        self.resume(now)
    }

    /// Stop raising interactions; detections are reported as suppressed.
    pub fn suppress(&mut self) {
        self.suppressed = true;
    }

    /// Undo suppression and reset dismissals and backoff.
    pub fn unsuppress(&mut self, now: Instant) {
        if self.disposed {
            return;
        }
        self.suppressed = false;
        self.slow_mode = false;
        self.dismiss_count = 0;
        self.silence_raised = false;
        self.calls = 0;
        self.reset_backoff(now);
        if !self.paused {
            self.schedule_deep_check(now);
        }
    }

    /// Tear down all state; every later call is a no-op.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        self.clear_timers();
        self.pending_prompt = None;
        self.in_flight = None;
        self.lines.clear();
        self.pending.clear();
        self.recent.clear();
        self.paused_output.clear();
        self.hasher.reset();
        debug!("Detector for {} disposed", self.command_id);
    }

    fn evaluate_rules(&mut self, now: Instant, events: &mut Vec<DetectorEvent>) {
        let (seq, line) = self.candidate();
        if line.trim().is_empty() || self.answered_seq.is_some_and(|a| seq <= a) {
            return;
        }

        let context = self.context();
        if let Some(m) = self.rules.try_quick_match(&context) {
            debug!("Quick rule {} matched for {}", m.rule, self.command_id);
            let mut request = InteractionRequest::new(
                self.command_id,
                m.interaction_type,
                &m.line,
                InteractionReason::QuickRule,
            )
            .with_options(m.options)
            .with_exit_key(self.rules.detect_exit_key(&context));
            if let Some(values) = m.confirm_values {
                request = request.with_confirm_values(values);
            }
            self.raise(request, seq, events);
            return;
        }

        // The heuristic only looks at an unterminated line.
        if self.pending.trim().is_empty() || self.cancelled_prompt_seq == Some(seq) {
            return;
        }
        if let Some(interaction_type) = self.rules.match_prompt_heuristic(&line) {
            let request = InteractionRequest::new(
                self.command_id,
                interaction_type,
                &line,
                InteractionReason::PromptHeuristic,
            )
            .with_exit_key(self.rules.detect_exit_key(&context));
            self.pending_prompt = Some((seq, request));
            self.debounce_at = Some(now + self.config.debounce);
        }
    }

    fn deep_check(&mut self, now: Instant, events: &mut Vec<DetectorEvent>) {
        self.calls += 1;

        match self.hasher.check() {
            HashCheck::Changed => {
                self.unchanged_count = 0;
                self.silent_since = now;
                self.silence_raised = false;
                self.current_timeout = self.config.initial_timeout;
                if self.classifier_enabled && self.in_flight.is_none() && !self.in_alt_screen {
                    self.attempt = 0;
                    events.push(self.start_classification());
                }
            }
            HashCheck::Unchanged => {
                self.unchanged_count += 1;
                self.current_timeout = (self.current_timeout * 2).min(self.config.max_timeout);
            }
        }

        let silent_for = now.saturating_duration_since(self.silent_since);
        if !self.silence_raised
            && (self.unchanged_count >= self.config.max_hash_unchanged_count
                || silent_for >= self.config.max_silent_timeout)
        {
            self.silence_raised = true;
            info!(
                "Command {} silent for {:?} ({} unchanged checks)",
                self.command_id, silent_for, self.unchanged_count
            );
            let (seq, line) = self.candidate();
            let hint = if line.trim().is_empty() {
                self.last_nonempty_line()
            } else {
                line
            };
            let request = InteractionRequest::new(
                self.command_id,
                InteractionType::Freeform,
                &hint,
                InteractionReason::Silence,
            )
            .with_exit_key(self.rules.detect_exit_key(&self.recent));
            self.raise(request, seq, events);
            if self.paused {
                return;
            }
        }

        self.schedule_deep_check(now);
    }

    fn start_classification(&mut self) -> DetectorEvent {
        self.generation += 1;
        self.in_flight = Some(self.generation);
        DetectorEvent::Classify(ClassifyRequest {
            command_id: self.command_id,
            command: self.command.clone(),
            recent_output: self.recent.clone(),
            locale: self.config.locale.clone(),
            attempt: self.attempt,
        })
    }

    /// Generation tag of the classifier call in flight.
    pub fn classification_in_flight(&self) -> Option<u64> {
        self.in_flight
    }

    fn raise(
        &mut self,
        request: InteractionRequest,
        seq: u64,
        events: &mut Vec<DetectorEvent>,
    ) {
        self.answered_seq = Some(self.answered_seq.map_or(seq, |a| a.max(seq)));

        if self.suppressed {
            debug!(
                "Suppressed {:?} interaction for {}",
                request.interaction_type, self.command_id
            );
            events.push(DetectorEvent::InteractionSuppressed(request));
            return;
        }

        info!(
            "Interaction needed for {}: {:?} ({:?})",
            self.command_id, request.interaction_type, request.reason
        );
        self.paused = true;
        self.clear_timers();
        self.pending_prompt = None;
        self.in_flight = None;
        events.push(DetectorEvent::InteractionNeeded(request));
    }

    fn record(&mut self, text: &str) {
        self.hasher.push(text);

        self.recent.push_str(text);
        let limit = self.config.output_buffer_chars.max(1);
        if self.recent.len() > limit * 2 {
            self.recent = tail_chars(&self.recent, limit).to_string();
        }

        for c in text.chars() {
            match c {
                '\n' => {
                    self.pending_cr = false;
                    self.commit_line();
                }
                '\r' => self.pending_cr = true,
                _ => {
                    if self.pending_cr {
                        // A bare carriage return rewrites the line.
                        self.pending_cr = false;
                        self.pending.clear();
                        self.line_seq += 1;
                    }
                    self.pending.push(c);
                }
            }
        }

        if self.pending.len() > limit * 2 {
            self.pending = tail_chars(&self.pending, limit).to_string();
        }
    }

    fn commit_line(&mut self) {
        let line = std::mem::take(&mut self.pending);
        self.lines.push_back((self.line_seq, line));
        self.line_seq += 1;
        while self.lines.len() > self.config.line_buffer_lines.max(1) {
            self.lines.pop_front();
        }
    }

    /// The line a prompt would be on: the unterminated line if any, else the
    /// last completed one.
    fn candidate(&self) -> (u64, String) {
        if !self.pending.trim().is_empty() {
            return (self.line_seq, self.pending.clone());
        }
        match self.lines.back() {
            Some((seq, line)) => (*seq, line.clone()),
            None => (self.line_seq, String::new()),
        }
    }

    fn context(&self) -> String {
        let skip = self.lines.len().saturating_sub(CONTEXT_LINES);
        let mut context: Vec<&str> = self
            .lines
            .iter()
            .skip(skip)
            .map(|(_, line)| line.as_str())
            .collect();
        if !self.pending.trim().is_empty() {
            context.push(&self.pending);
        }
        context.join("\n")
    }

    fn last_nonempty_line(&self) -> String {
        self.recent
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or("")
            .to_string()
    }

    fn reset_backoff(&mut self, now: Instant) {
        self.current_timeout = self.config.initial_timeout;
        self.unchanged_count = 0;
        self.silent_since = now;
        self.retry_at = None;
        self.attempt = 0;
    }

    fn schedule_deep_check(&mut self, now: Instant) {
        if self.calls >= self.config.max_calls {
            debug!("Deep checks exhausted for {}", self.command_id);
            self.deep_check_at = None;
            return;
        }
        let delay = if self.slow_mode {
            self.config.slow_poll
        } else {
            self.current_timeout
        };
        self.deep_check_at = Some(now + delay);
    }

    fn arm_tui_silence(&mut self, now: Instant) {
        if self.tui_category.auto_cancels() && !self.tui_handled && !self.pager_seen {
            self.tui_silence_at = Some(now + self.config.tui_silence);
        }
    }

    fn arm_backstop(&mut self, now: Instant) {
        if self.tui_category.auto_cancels() && !self.tui_handled {
            self.tui_backstop_at = Some(now + self.config.tui_backstop);
        }
    }

    fn clear_timers(&mut self) {
        self.debounce_at = None;
        self.deep_check_at = None;
        self.pager_window_at = None;
        self.tui_silence_at = None;
        self.tui_backstop_at = None;
        self.retry_at = None;
    }
}

fn due(deadline: Option<Instant>, now: Instant) -> bool {
    deadline.is_some_and(|at| at <= now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn detector(command: &str, classifier: bool, now: Instant) -> InteractionDetector {
        InteractionDetector::new(
            CommandId::new(),
            command,
            DetectorConfig::default(),
            Arc::new(RuleSet::builtin()),
            classifier,
            now,
        )
    }

    fn text(s: &str) -> FilteredChunk {
        FilteredChunk {
            text: s.to_string(),
            alt_screen: None,
        }
    }

    fn alt(s: &str, transition: AltScreen) -> FilteredChunk {
        FilteredChunk {
            text: s.to_string(),
            alt_screen: Some(transition),
        }
    }

    fn needed(events: &[DetectorEvent]) -> Vec<&InteractionRequest> {
        events
            .iter()
            .filter_map(|e| match e {
                DetectorEvent::InteractionNeeded(r) => Some(r),
                _ => None,
            })
            .collect()
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_apt_confirm_raised_without_debounce() {
        let t0 = Instant::now();
        let mut d = detector("sudo apt upgrade", false, t0);
        let events = d.feed(
            &text("The following packages will be upgraded:\n  curl\nDo you want to continue? [Y/n] "),
            t0,
        );
        let raised = needed(&events);
        assert_eq!(raised.len(), 1);
        assert_eq!(raised[0].interaction_type, InteractionType::Confirm);
        assert_eq!(
            raised[0].confirm_values,
            Some(ConfirmValues::new("Y", "n", Some("Y")))
        );
        assert_eq!(raised[0].reason, InteractionReason::QuickRule);
        assert!(d.is_paused());
        assert_eq!(d.next_deadline(), None);
    }

    #[test]
    fn test_answered_prompt_is_not_raised_again() {
        let t0 = Instant::now();
        let mut d = detector("sudo ls", false, t0);
        assert_eq!(needed(&d.feed(&text("[sudo] password for ops: "), t0)).len(), 1);
        d.resume(t0);
        assert!(needed(&d.feed(&text("\r\n"), t0)).is_empty());
        assert!(needed(&d.feed(&text("file-a\nfile-b\n"), t0)).is_empty());
        assert_eq!(
            needed(&d.feed(&text("Sorry, try again.\n[sudo] password for ops: "), t0)).len(),
            1
        );
    }

    #[test]
    fn test_output_while_paused_is_merged_in_order() {
        let t0 = Instant::now();
        let mut d = detector("deploy", false, t0);
        d.feed(&text("first\nPassword: "), t0);
        assert!(d.is_paused());
        assert!(d.feed(&text("\nsecond\nthird\n"), t0).is_empty());
        d.resume(t0);
        let lines: Vec<&str> = d.buffered_lines().collect();
        assert_eq!(lines, vec!["first", "Password: ", "second", "third"]);
    }

    #[test]
    fn test_heuristic_prompt_waits_for_debounce() {
        let t0 = Instant::now();
        let mut d = detector("./configure", false, t0);
        assert!(d.feed(&text("Enter install path:"), t0).is_empty());
        assert_eq!(d.next_deadline(), Some(t0 + ms(300)));
        assert!(d.poll(t0 + ms(299)).is_empty());
        let events = d.poll(t0 + ms(300));
        let raised = needed(&events);
        assert_eq!(raised.len(), 1);
        assert_eq!(raised[0].interaction_type, InteractionType::Freeform);
        assert_eq!(raised[0].reason, InteractionReason::PromptHeuristic);
    }

    #[test]
    fn test_heuristic_prompt_cancelled_by_more_output() {
        let t0 = Instant::now();
        let mut d = detector("make", false, t0);
        d.feed(&text("Checking file:"), t0);
        d.feed(&text(" ok\nbuilding\n"), t0 + ms(100));
        assert!(needed(&d.poll(t0 + ms(400))).is_empty());
        assert!(!d.is_paused());
    }

    #[test]
    fn test_heuristic_secret_keyword_is_password() {
        let t0 = Instant::now();
        let mut d = detector("vault login", false, t0);
        d.feed(&text("Enter secret value:"), t0);
        let events = d.poll(t0 + ms(300));
        assert_eq!(needed(&events)[0].interaction_type, InteractionType::Password);
    }

    #[test]
    fn test_man_pager() {
        let t0 = Instant::now();
        let mut d = detector("man ls", false, t0);
        assert_eq!(d.tui_category(), TuiCategory::NonBlacklist);
        assert!(d
            .feed(&alt("LS(1)  User Commands  LS(1)\nNAME\n  ls - list\n", AltScreen::Entered), t0)
            .is_empty());
        let events = d.feed(&text("\n(END)"), t0 + ms(50));
        let raised = needed(&events);
        assert_eq!(raised.len(), 1);
        assert_eq!(raised[0].interaction_type, InteractionType::Pager);
        assert_eq!(raised[0].exit_key, Some(ExitKey::new("q", false)));
        // No full-screen notice once the pager is known.
        d.resume(t0 + ms(100));
        assert!(!d
            .poll(t0 + ms(1000))
            .contains(&DetectorEvent::AlternateScreenEntered));
    }

    #[test]
    fn test_vim_is_cancelled_after_silence() {
        let t0 = Instant::now();
        let mut d = detector("vim file.txt", false, t0);
        assert_eq!(d.tui_category(), TuiCategory::Always);
        d.feed(&alt("~\n~\n\"file.txt\" 0L, 0B", AltScreen::Entered), t0);

        let events = d.poll(t0 + ms(400));
        assert_eq!(events, vec![DetectorEvent::AlternateScreenEntered]);

        assert!(d.poll(t0 + ms(1499)).is_empty());
        let events = d.poll(t0 + ms(1500));
        assert_eq!(
            events,
            vec![
                DetectorEvent::SendInterrupt,
                DetectorEvent::TuiDetected {
                    category: TuiCategory::Always
                }
            ]
        );
        assert!(d.poll(t0 + ms(9000)).iter().all(|e| !matches!(
            e,
            DetectorEvent::SendInterrupt | DetectorEvent::TuiDetected { .. }
        )));
    }

    #[test]
    fn test_tui_silence_rearmed_by_output() {
        let t0 = Instant::now();
        let mut d = detector("htop", false, t0);
        d.feed(&alt("CPU", AltScreen::Entered), t0);
        d.feed(&text("CPU 3%"), t0 + ms(1000));
        assert!(!d.poll(t0 + ms(1500)).contains(&DetectorEvent::SendInterrupt));
        assert!(d.poll(t0 + ms(2500)).contains(&DetectorEvent::SendInterrupt));
    }

    #[test]
    fn test_backstop_without_alt_screen() {
        let t0 = Instant::now();
        let mut d = detector("top", false, t0);
        d.feed(&text("top - 10:00:01 up 3 days\n"), t0);
        let events = d.poll(t0 + ms(8000));
        assert!(events.contains(&DetectorEvent::SendInterrupt));
    }

    #[test]
    fn test_batch_mode_top_is_never_cancelled() {
        let t0 = Instant::now();
        let mut d = detector("top -b -n 1", false, t0);
        d.feed(&text("top - 10:00:01 up 3 days\n"), t0);
        assert!(!d.poll(t0 + ms(8000)).contains(&DetectorEvent::SendInterrupt));
    }

    #[test]
    fn test_non_blacklist_alt_screen_not_cancelled() {
        let t0 = Instant::now();
        let mut d = detector("./dashboard", false, t0);
        d.feed(&alt("status", AltScreen::Entered), t0);
        let events = d.poll(t0 + ms(2000));
        assert_eq!(events, vec![DetectorEvent::AlternateScreenEntered]);
    }

    #[test]
    fn test_alt_screen_exit_clears_tui_timer() {
        let t0 = Instant::now();
        let mut d = detector("less notes.txt", false, t0);
        d.feed(&alt("notes", AltScreen::Entered), t0);
        d.feed(&alt("$ ", AltScreen::Exited), t0 + ms(100));
        assert!(d.poll(t0 + ms(2000)).is_empty());
    }

    #[test]
    fn test_rules_skipped_in_alt_screen() {
        let t0 = Instant::now();
        let mut d = detector("nano notes", false, t0);
        let events = d.feed(&alt("Password: ", AltScreen::Entered), t0);
        assert!(needed(&events).is_empty());
    }

    #[test]
    fn test_silence_popup_after_unchanged_hashes() {
        let t0 = Instant::now();
        let mut d = detector("./long-job", false, t0);
        d.feed(&text("working"), t0);

        // Changed at 5s, then unchanged at 10s, 20s and 40s.
        assert!(d.poll(t0 + ms(5_000)).is_empty());
        assert_eq!(d.next_deadline(), Some(t0 + ms(10_000)));
        assert!(d.poll(t0 + ms(10_000)).is_empty());
        assert_eq!(d.next_deadline(), Some(t0 + ms(20_000)));
        assert!(d.poll(t0 + ms(20_000)).is_empty());
        assert_eq!(d.next_deadline(), Some(t0 + ms(40_000)));
        let events = d.poll(t0 + ms(40_000));
        let raised = needed(&events);
        assert_eq!(raised.len(), 1);
        assert_eq!(raised[0].reason, InteractionReason::Silence);
        assert_eq!(raised[0].interaction_type, InteractionType::Freeform);
    }

    #[test]
    fn test_changed_output_asks_classifier() {
        let t0 = Instant::now();
        let mut d = detector("./installer", true, t0);
        d.feed(&text("Choose a flavour"), t0);
        let events = d.poll(t0 + ms(5_000));
        let request = match &events[..] {
            [DetectorEvent::Classify(request)] => request.clone(),
            other => panic!("unexpected events {other:?}"),
        };
        assert_eq!(request.command, "./installer");
        assert_eq!(request.attempt, 0);

        let generation = d.classification_in_flight().unwrap();
        let events = d.on_classification(
            generation,
            Ok(json!({
                "needsInteraction": true,
                "interactionType": "select",
                "promptHint": "Choose a flavour",
                "options": ["vanilla", "chocolate"],
                "exitKey": { "key": "Ctrl+C" }
            })),
            t0 + ms(5_100),
        );
        let raised = needed(&events);
        assert_eq!(raised[0].interaction_type, InteractionType::Select);
        assert_eq!(raised[0].options, vec!["vanilla", "chocolate"]);
        assert_eq!(raised[0].exit_key, Some(ExitKey::new("Ctrl+C", false)));
        assert_eq!(raised[0].reason, InteractionReason::Classifier);
    }

    #[test]
    fn test_rule_exit_key_beats_classifier() {
        let t0 = Instant::now();
        let mut d = detector("./repl", true, t0);
        d.feed(&text("Type 'exit' to quit\n> "), t0);
        d.poll(t0 + ms(5_000));
        let generation = d.classification_in_flight().unwrap();
        let events = d.on_classification(
            generation,
            Ok(json!({
                "needsInteraction": true,
                "exitKey": { "key": "Ctrl+D" }
            })),
            t0 + ms(5_001),
        );
        assert_eq!(needed(&events)[0].exit_key, Some(ExitKey::new("exit", true)));
    }

    #[test]
    fn test_invalid_classifier_answer_degrades() {
        let t0 = Instant::now();
        let mut d = detector("./installer", true, t0);
        d.feed(&text("something"), t0);
        d.poll(t0 + ms(5_000));
        let generation = d.classification_in_flight().unwrap();
        let events = d.on_classification(generation, Ok(json!("not an object")), t0 + ms(5_001));
        let raised = needed(&events);
        assert_eq!(raised[0].interaction_type, InteractionType::Freeform);
        assert_eq!(raised[0].reason, InteractionReason::ClassifierDegraded);
    }

    #[test]
    fn test_network_errors_retry_then_service_unavailable() {
        let t0 = Instant::now();
        let mut d = detector("./installer", true, t0);
        d.feed(&text("something"), t0);
        d.poll(t0 + ms(5_000));

        let mut now = t0 + ms(5_000);
        for attempt in 0..3u32 {
            let generation = d.classification_in_flight().unwrap();
            let events = d.on_classification(
                generation,
                Err(ClassifierError::Network(anyhow::anyhow!("timeout"))),
                now,
            );
            assert!(events.is_empty());
            let delay = ms(2_000 * 2u64.pow(attempt));
            now += delay;
            let events = d.poll(now);
            assert!(events
                .iter()
                .any(|e| matches!(e, DetectorEvent::Classify(r) if r.attempt == attempt + 1)));
        }

        let generation = d.classification_in_flight().unwrap();
        let events = d.on_classification(
            generation,
            Err(ClassifierError::Network(anyhow::anyhow!("timeout"))),
            now,
        );
        assert_eq!(needed(&events)[0].reason, InteractionReason::ServiceUnavailable);
    }

    #[test]
    fn test_stale_classifier_answer_ignored() {
        let t0 = Instant::now();
        let mut d = detector("./installer", true, t0);
        d.feed(&text("something"), t0);
        d.poll(t0 + ms(5_000));
        let generation = d.classification_in_flight().unwrap();
        d.feed(&text("\nPassword: "), t0 + ms(5_010));
        assert!(d.is_paused());
        d.resume(t0 + ms(6_000));
        let events = d.on_classification(
            generation,
            Ok(json!({ "needsInteraction": true })),
            t0 + ms(6_001),
        );
        assert!(events.is_empty());
    }

    #[test]
    fn test_dismissals_slow_down_then_suppress() {
        let t0 = Instant::now();
        let mut d = detector("./wizard", false, t0);
        for i in 0..3 {
            let events = d.feed(&text(&format!("\nstep {i} password: ")), t0);
            assert_eq!(needed(&events).len(), 1);
            d.dismiss(t0);
        }
        assert!(d.is_slow_mode());
        assert!(d.is_suppressed());
        assert_eq!(d.next_deadline(), Some(t0 + ms(60_000)));

        let events = d.feed(&text("\nfinal password: "), t0);
        assert!(matches!(events[..], [DetectorEvent::InteractionSuppressed(_)]));
        assert!(!d.is_paused());

        d.unsuppress(t0);
        assert_eq!(d.dismiss_count(), 0);
        assert!(!d.is_slow_mode());
        assert_eq!(d.next_deadline(), Some(t0 + ms(5_000)));
        let events = d.feed(&text("\nanother password: "), t0);
        assert_eq!(needed(&events).len(), 1);
    }

    #[test]
    fn test_dispose_stops_everything() {
        let t0 = Instant::now();
        let mut d = detector("vim", true, t0);
        d.dispose();
        assert!(d.is_disposed());
        assert_eq!(d.next_deadline(), None);
        assert!(d.feed(&text("Password: "), t0).is_empty());
        assert!(d.poll(t0 + ms(100_000)).is_empty());
    }

    #[test]
    fn test_deep_checks_stop_after_max_calls() {
        let t0 = Instant::now();
        let config = DetectorConfig {
            max_calls: 2,
            max_hash_unchanged_count: 100,
            max_silent_timeout: Duration::from_secs(100_000),
            ..DetectorConfig::default()
        };
        let mut d = InteractionDetector::new(
            CommandId::new(),
            "sleep 600",
            config,
            Arc::new(RuleSet::builtin()),
            false,
            t0,
        );
        d.poll(t0 + ms(5_000));
        d.poll(t0 + ms(15_000));
        assert_eq!(d.next_deadline(), None);
    }
}
