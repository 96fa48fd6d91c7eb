//! Marker-based command runner.
//!
//! A command is sent to an interactive shell wrapped between two markers.
//! [`MarkerParser`] turns the shell's output back into lines, drops
//! everything before the start marker (the shell's echo of the command),
//! and reads the exit status printed after the end marker. The same output,
//! with markers and echo removed, is what an interaction detector sees.
//! [`CommandExecution`] owns one run: it filters ANSI sequences, reports
//! through [`RunnerCallbacks`], enforces the timeout, and completes exactly
//! once. [`run`] drives an execution against a live stream.
//!
//! The runner holds no reference to sessions or detectors; callers observe
//! it only through the callbacks.

use std::collections::VecDeque;
use std::time::Duration;

use regex::Regex;
use rexec_core::{CommandId, Error, Result, RexecConfig, TransportFailure};
use rexec_stream::{
    write_with_drain, AltScreen, AnsiFilter, FilteredChunk, StreamEvent, StreamWriter,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::marker::{wrap_command, MarkerPair};

/// Runtime runner configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerConfig {
    /// Forced completion if no end marker arrives
    pub command_timeout: Duration,
    /// Quiet time before an unterminated line is released
    pub half_line_delay: Duration,
    /// Shell used to run commands; empty runs them with `eval`
    pub login_shell: String,
    /// Marker prefix
    pub marker_prefix: String,
    /// Lines kept in the execution's output buffer
    pub max_output_lines: usize,
    /// Bytes that submit a line
    pub enter_sequence: String,
    /// Bound on waiting for a buffered write to drain
    pub drain_timeout: Duration,
}

impl From<&RexecConfig> for RunnerConfig {
    fn from(config: &RexecConfig) -> Self {
        Self {
            command_timeout: Duration::from_millis(config.runner.command_timeout_ms),
            half_line_delay: Duration::from_millis(config.runner.half_line_delay_ms),
            login_shell: config.runner.login_shell.clone(),
            marker_prefix: config.runner.marker_prefix.clone(),
            max_output_lines: config.session.max_output_lines,
            enter_sequence: config.session.enter_sequence.clone(),
            drain_timeout: Duration::from_millis(config.session.input_drain_timeout_ms),
        }
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self::from(&RexecConfig::default())
    }
}

/// How an execution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionReason {
    /// The end marker and exit status were seen
    EndMarker,
    /// No end marker within the command timeout
    Timeout,
    /// The stream closed or failed before the end marker
    StreamClosed,
    /// The caller forced termination
    Terminated,
    /// The wrapped command could not be written
    WriteFailed,
}

/// Final result of an execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOutcome {
    /// Whether the command itself finished (end marker seen)
    pub completed: bool,
    /// Exit status, 0 until one is observed
    pub exit_code: i32,
    /// How the execution ended
    pub reason: CompletionReason,
}

impl RunOutcome {
    /// Whether completion was forced by a timeout or a lost stream.
    ///
    /// The remote command's true state is unknown in that case.
    pub fn timed_out(&self) -> bool {
        matches!(
            self.reason,
            CompletionReason::Timeout | CompletionReason::StreamClosed
        )
    }
}

/// Lifecycle of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    /// Waiting for the start marker
    NotStarted,
    /// Start marker seen
    Started,
    /// Terminal; never changes again
    Completed,
}

/// Control messages accepted while a command runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerControl {
    /// Complete now without waiting for the remote side
    Terminate,
}

/// Predicate deciding whether a line is the shell echoing the command.
pub type EchoFilter = Box<dyn Fn(&str) -> bool + Send + Sync>;

/// Echo filter matching the wrapped command line, also after a prompt.
pub fn default_echo_filter(wrapped: &str) -> EchoFilter {
    let needle = wrapped.trim().to_string();
    Box::new(move |line: &str| {
        let line = line.trim();
        !needle.is_empty() && (line == needle || line.ends_with(needle.as_str()))
    })
}

/// Output of the marker parser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParserEvent {
    /// The start marker was seen
    Started,
    /// One line of command output
    Line(String),
    /// The end marker was seen, with the exit status if it parsed
    Finished {
        /// Exit status
        exit_code: Option<i32>,
    },
}

/// Sans-IO line reassembly and marker detection.
pub struct MarkerParser {
    start: String,
    end: String,
    end_pattern: Regex,
    echo: EchoFilter,
    half_line_delay: Duration,
    started: bool,
    finished: bool,
    pending: String,
    pending_cr: bool,
    // Tail of the current line already released by the half-line timer
    released: String,
    // Bytes of `pending` already handed out as visible output
    forwarded: usize,
    visible: String,
    half_line_at: Option<Instant>,
}

impl std::fmt::Debug for MarkerParser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarkerParser")
            .field("started", &self.started)
            .field("finished", &self.finished)
            .field("pending", &self.pending)
            .finish_non_exhaustive()
    }
}

impl MarkerParser {
    /// Create a parser for `markers`.
    pub fn new(markers: &MarkerPair, echo: EchoFilter, half_line_delay: Duration) -> Result<Self> {
        let end_pattern = Regex::new(&format!("{}:(\\d+)", regex::escape(markers.end())))
            .map_err(|e| Error::InvalidInput(format!("bad end marker: {e}")))?;
        Ok(Self {
            start: markers.start().to_string(),
            end: markers.end().to_string(),
            end_pattern,
            echo,
            half_line_delay,
            started: false,
            finished: false,
            pending: String::new(),
            pending_cr: false,
            released: String::new(),
            forwarded: 0,
            visible: String::new(),
            half_line_at: None,
        })
    }

    /// Whether the start marker has been seen.
    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Whether the end marker has been seen.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Half-line release deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.half_line_at
    }

    /// Command output seen since the last call, with markers and echo
    /// removed. Completed lines end with `\n`; an unterminated line is
    /// handed out as it grows, minus any tail that may begin the end marker.
    pub fn take_visible(&mut self) -> String {
        std::mem::take(&mut self.visible)
    }

    /// Consume a chunk of ANSI-free text.
    pub fn feed(&mut self, text: &str, now: Instant) -> Vec<ParserEvent> {
        let mut events = Vec::new();
        if self.finished {
            return events;
        }

        for c in text.chars() {
            if self.pending_cr {
                match c {
                    '\n' => {
                        self.pending_cr = false;
                        self.terminate_line(&mut events);
                        continue;
                    }
                    '\r' => continue,
                    _ => {
                        self.pending_cr = false;
                        self.terminate_line(&mut events);
                    }
                }
            }
            if self.finished {
                break;
            }
            match c {
                '\n' => self.terminate_line(&mut events),
                '\r' => self.pending_cr = true,
                _ => self.pending.push(c),
            }
            if self.finished {
                break;
            }
        }

        // Every chunk restarts the half-line timer.
        self.half_line_at = if self.started && !self.finished && !self.pending.is_empty() {
            Some(now + self.half_line_delay)
        } else {
            None
        };
        self.forward_partial();
        events
    }

    /// Release an unterminated line whose timer has expired.
    pub fn poll(&mut self, now: Instant) -> Vec<ParserEvent> {
        let mut events = Vec::new();
        if !self.half_line_at.is_some_and(|at| at <= now) {
            return events;
        }
        self.half_line_at = None;

        if !self.started || self.finished || self.pending.is_empty() {
            return events;
        }
        if self.holds_end_marker() {
            return events;
        }

        let line = std::mem::take(&mut self.pending);
        if let Some(rest) = line.get(self.forwarded..) {
            self.visible.push_str(rest);
        }
        self.forwarded = 0;
        self.released.push_str(&line);
        self.released = tail_chars(&self.released, self.end.chars().count()).to_string();
        if !(self.echo)(&line) {
            events.push(ParserEvent::Line(line));
        }
        events
    }

    /// Emit whatever is still buffered; used when completion is forced.
    pub fn flush(&mut self) -> Vec<ParserEvent> {
        self.half_line_at = None;
        self.pending_cr = false;
        let line = std::mem::take(&mut self.pending);
        if self.started && !self.finished && !line.is_empty() && !(self.echo)(&line) {
            vec![ParserEvent::Line(line)]
        } else {
            Vec::new()
        }
    }

    fn terminate_line(&mut self, events: &mut Vec<ParserEvent>) {
        let line = std::mem::take(&mut self.pending);
        let released = std::mem::take(&mut self.released);
        let forwarded = std::mem::replace(&mut self.forwarded, 0);

        if !self.started {
            if line.contains(&self.start) {
                debug!("Start marker seen");
                self.started = true;
                events.push(ParserEvent::Started);
            }
            return;
        }

        // A marker may straddle text the half-line timer already released.
        let joined = format!("{released}{line}");
        if let Some(caps) = self.end_pattern.captures(&joined) {
            let marker_at = caps
                .get(0)
                .map_or(0, |m| m.start())
                .saturating_sub(released.len());
            let before = &line[..marker_at.min(line.len())];
            if let Some(rest) = before.get(forwarded..) {
                self.visible.push_str(rest);
            }
            if !before.is_empty() && !(self.echo)(before) {
                events.push(ParserEvent::Line(before.to_string()));
            }
            let exit_code = caps.get(1).and_then(|m| m.as_str().parse::<i32>().ok());
            debug!("End marker seen, exit code {:?}", exit_code);
            self.finished = true;
            events.push(ParserEvent::Finished { exit_code });
            return;
        }

        if line.is_empty() && !released.is_empty() {
            // The break after a released half line.
            self.visible.push('\n');
            return;
        }
        if (self.echo)(&line) {
            return;
        }
        if let Some(rest) = line.get(forwarded..) {
            self.visible.push_str(rest);
        }
        self.visible.push('\n');
        events.push(ParserEvent::Line(line));
    }

    /// Hand out the safe part of the unterminated line.
    fn forward_partial(&mut self) {
        if !self.started || self.finished || (self.echo)(&self.pending) {
            return;
        }
        let safe = marker_tail_start(&self.pending, &self.end).unwrap_or(self.pending.len());
        if safe > self.forwarded {
            self.visible.push_str(&self.pending[self.forwarded..safe]);
            self.forwarded = safe;
        }
    }

    /// Whether the unterminated line must wait for more output: it starts
    /// like the end marker at the beginning of a line, or contains it.
    fn holds_end_marker(&self) -> bool {
        let at_line_start = self.released.is_empty();
        (at_line_start && self.end.starts_with(self.pending.as_str()))
            || self.pending.contains(self.end.as_str())
    }
}

/// Byte offset of the first tail of `pending` that could begin `marker`.
fn marker_tail_start(pending: &str, marker: &str) -> Option<usize> {
    pending.char_indices().map(|(i, _)| i).find(|&i| {
        let tail = &pending[i..];
        marker.starts_with(tail) || tail.starts_with(marker)
    })
}

fn tail_chars(text: &str, max_chars: usize) -> &str {
    if max_chars == 0 {
        return "";
    }
    match text.char_indices().rev().nth(max_chars - 1) {
        Some((i, _)) => &text[i..],
        None => text,
    }
}

/// Optional observers of one execution.
#[derive(Default)]
pub struct RunnerCallbacks {
    /// Each output line, in arrival order
    pub on_line: Option<Box<dyn FnMut(&str) + Send>>,
    /// Command output for an interaction detector: ANSI-free, after the
    /// start marker, without markers or echo
    pub on_chunk: Option<Box<dyn FnMut(&FilteredChunk) + Send>>,
    /// The exit status, when one is observed
    pub on_exit_code: Option<Box<dyn FnMut(i32) + Send>>,
    /// Completion, exactly once
    pub on_completed: Option<Box<dyn FnMut(&RunOutcome) + Send>>,
    /// After completion, exactly once; the session may take the next command
    pub on_continue: Option<Box<dyn FnMut() + Send>>,
}

impl RunnerCallbacks {
    /// No observers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Observe lines.
    pub fn on_line(mut self, f: impl FnMut(&str) + Send + 'static) -> Self {
        self.on_line = Some(Box::new(f));
        self
    }

    /// Observe command output as a detector should see it.
    pub fn on_chunk(mut self, f: impl FnMut(&FilteredChunk) + Send + 'static) -> Self {
        self.on_chunk = Some(Box::new(f));
        self
    }

    /// Observe the exit status.
    pub fn on_exit_code(mut self, f: impl FnMut(i32) + Send + 'static) -> Self {
        self.on_exit_code = Some(Box::new(f));
        self
    }

    /// Observe completion.
    pub fn on_completed(mut self, f: impl FnMut(&RunOutcome) + Send + 'static) -> Self {
        self.on_completed = Some(Box::new(f));
        self
    }

    /// Observe the continue signal.
    pub fn on_continue(mut self, f: impl FnMut() + Send + 'static) -> Self {
        self.on_continue = Some(Box::new(f));
        self
    }
}

impl std::fmt::Debug for RunnerCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunnerCallbacks")
            .field("on_line", &self.on_line.is_some())
            .field("on_chunk", &self.on_chunk.is_some())
            .field("on_exit_code", &self.on_exit_code.is_some())
            .field("on_completed", &self.on_completed.is_some())
            .field("on_continue", &self.on_continue.is_some())
            .finish()
    }
}

/// One run of a command on a session.
#[derive(Debug)]
pub struct CommandExecution {
    id: CommandId,
    command: String,
    wrapped: String,
    markers: MarkerPair,
    parser: MarkerParser,
    filter: AnsiFilter,
    callbacks: RunnerCallbacks,
    output: VecDeque<String>,
    max_output_lines: usize,
    exit_code: i32,
    state: ExecutionState,
    outcome: Option<RunOutcome>,
    timeout: Duration,
    timeout_at: Instant,
}

impl CommandExecution {
    /// Prepare an execution with freshly generated markers.
    pub fn new(
        id: CommandId,
        command: &str,
        cwd: Option<&str>,
        config: &RunnerConfig,
        callbacks: RunnerCallbacks,
        now: Instant,
    ) -> Result<Self> {
        let markers = MarkerPair::generate(&config.marker_prefix);
        Self::with_markers(id, command, markers, cwd, config, callbacks, now)
    }

    /// Prepare an execution with the given markers.
    pub fn with_markers(
        id: CommandId,
        command: &str,
        markers: MarkerPair,
        cwd: Option<&str>,
        config: &RunnerConfig,
        callbacks: RunnerCallbacks,
        now: Instant,
    ) -> Result<Self> {
        let wrapped = wrap_command(command, &markers, cwd, &config.login_shell);
        let parser = MarkerParser::new(
            &markers,
            default_echo_filter(&wrapped),
            config.half_line_delay,
        )?;
        Ok(Self {
            id,
            command: command.to_string(),
            wrapped,
            markers,
            parser,
            filter: AnsiFilter::new(),
            callbacks,
            output: VecDeque::new(),
            max_output_lines: config.max_output_lines.max(1),
            exit_code: 0,
            state: ExecutionState::NotStarted,
            outcome: None,
            timeout: config.command_timeout,
            timeout_at: now + config.command_timeout,
        })
    }

    /// Replace the echo filter.
    pub fn with_echo_filter(mut self, echo: EchoFilter) -> Result<Self> {
        self.parser = MarkerParser::new(&self.markers, echo, self.parser.half_line_delay)?;
        Ok(self)
    }

    /// Command identifier.
    pub fn id(&self) -> CommandId {
        self.id
    }

    /// Command as submitted.
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Line written to the shell.
    pub fn wrapped_command(&self) -> &str {
        &self.wrapped
    }

    /// Markers of this execution.
    pub fn markers(&self) -> &MarkerPair {
        &self.markers
    }

    /// Lifecycle state.
    pub fn state(&self) -> ExecutionState {
        self.state
    }

    /// Exit status observed so far (0 by default).
    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }

    /// Buffered output lines, oldest first.
    pub fn output(&self) -> impl Iterator<Item = &str> {
        self.output.iter().map(String::as_str)
    }

    /// Final outcome once completed.
    pub fn outcome(&self) -> Option<&RunOutcome> {
        self.outcome.as_ref()
    }

    /// Next timer this execution needs.
    pub fn next_deadline(&self) -> Option<Instant> {
        if self.outcome.is_some() {
            return None;
        }
        Some(match self.parser.next_deadline() {
            Some(half_line) => half_line.min(self.timeout_at),
            None => self.timeout_at,
        })
    }

    /// Process raw bytes from the stream.
    pub fn on_data(&mut self, bytes: &[u8], now: Instant) -> Option<RunOutcome> {
        if self.outcome.is_some() {
            return None;
        }
        let chunk = self.filter.filter(bytes);
        let events = self.parser.feed(&chunk.text, now);
        let alt_screen = if self.parser.is_started() {
            chunk.alt_screen
        } else {
            None
        };
        self.forward_visible(alt_screen);
        self.apply(events)
    }

    /// Fire expired timers.
    pub fn on_tick(&mut self, now: Instant) -> Option<RunOutcome> {
        if self.outcome.is_some() {
            return None;
        }
        if now >= self.timeout_at {
            return self.complete(CompletionReason::Timeout);
        }
        let events = self.parser.poll(now);
        self.forward_visible(None);
        self.apply(events)
    }

    /// Complete the execution. Only the first call has any effect; later
    /// calls return `None` and invoke no callbacks.
    pub fn complete(&mut self, reason: CompletionReason) -> Option<RunOutcome> {
        if self.outcome.is_some() {
            return None;
        }

        if reason != CompletionReason::EndMarker {
            for event in self.parser.flush() {
                if let ParserEvent::Line(line) = event {
                    self.emit_line(line);
                }
            }
        }
        match reason {
            CompletionReason::Timeout => self.emit_line(format!(
                "[rexec] command timed out after {}s without completing",
                self.timeout.as_secs()
            )),
            CompletionReason::StreamClosed => {
                self.emit_line("[rexec] stream closed before the command completed".to_string())
            }
            _ => {}
        }

        let outcome = RunOutcome {
            completed: reason == CompletionReason::EndMarker,
            exit_code: self.exit_code,
            reason,
        };
        info!(
            "Command {} completed: reason={:?}, exit_code={}",
            self.id, reason, self.exit_code
        );
        self.state = ExecutionState::Completed;
        self.outcome = Some(outcome.clone());

        if let Some(on_completed) = self.callbacks.on_completed.as_mut() {
            on_completed(&outcome);
        }
        if let Some(on_continue) = self.callbacks.on_continue.as_mut() {
            on_continue();
        }
        Some(outcome)
    }

    fn apply(&mut self, events: Vec<ParserEvent>) -> Option<RunOutcome> {
        for event in events {
            match event {
                ParserEvent::Started => {
                    debug!("Command {} started", self.id);
                    self.state = ExecutionState::Started;
                }
                ParserEvent::Line(line) => self.emit_line(line),
                ParserEvent::Finished { exit_code } => {
                    if let Some(code) = exit_code {
                        self.exit_code = code;
                        if let Some(on_exit_code) = self.callbacks.on_exit_code.as_mut() {
                            on_exit_code(code);
                        }
                    }
                    return self.complete(CompletionReason::EndMarker);
                }
            }
        }
        None
    }

    fn forward_visible(&mut self, alt_screen: Option<AltScreen>) {
        let text = self.parser.take_visible();
        if text.is_empty() && alt_screen.is_none() {
            return;
        }
        if let Some(on_chunk) = self.callbacks.on_chunk.as_mut() {
            on_chunk(&FilteredChunk { text, alt_screen });
        }
    }

    fn emit_line(&mut self, line: String) {
        if let Some(on_line) = self.callbacks.on_line.as_mut() {
            on_line(&line);
        }
        self.output.push_back(line);
        while self.output.len() > self.max_output_lines {
            self.output.pop_front();
        }
    }
}

/// Drive `execution` on a stream until it completes.
///
/// Writes the wrapped command, then consumes stream events, timers and
/// control messages. A failed write completes the execution with
/// `WriteFailed` and is returned as the error.
pub async fn run(
    writer: &dyn StreamWriter,
    events: &mut mpsc::UnboundedReceiver<StreamEvent>,
    execution: &mut CommandExecution,
    mut control: Option<&mut mpsc::UnboundedReceiver<RunnerControl>>,
    config: &RunnerConfig,
) -> std::result::Result<RunOutcome, TransportFailure> {
    info!("Running command {}: {}", execution.id(), execution.command());

    let mut line = execution.wrapped_command().to_string();
    line.push_str(&config.enter_sequence);
    if let Err(failure) = write_with_drain(writer, line.as_bytes(), config.drain_timeout).await {
        warn!(
            "Writing command {} failed: {}",
            execution.id(),
            failure.code()
        );
        execution.complete(CompletionReason::WriteFailed);
        return Err(failure);
    }

    loop {
        if let Some(outcome) = execution.outcome() {
            return Ok(outcome.clone());
        }
        let deadline = execution
            .next_deadline()
            .unwrap_or_else(|| Instant::now() + config.command_timeout);

        tokio::select! {
            biased;

            message = recv_control(&mut control) => match message {
                Some(RunnerControl::Terminate) => {
                    info!("Command {} terminated by caller", execution.id());
                    execution.complete(CompletionReason::Terminated);
                }
                None => control = None,
            },

            event = events.recv() => match event {
                Some(StreamEvent::Data(bytes)) => {
                    execution.on_data(&bytes, Instant::now());
                }
                Some(StreamEvent::Error(message)) => {
                    warn!("Stream error during {}: {}", execution.id(), message);
                    execution.complete(CompletionReason::StreamClosed);
                }
                Some(StreamEvent::Closed) | None => {
                    warn!("Stream closed during {}", execution.id());
                    execution.complete(CompletionReason::StreamClosed);
                }
            },

            _ = tokio::time::sleep_until(deadline) => {
                execution.on_tick(Instant::now());
            }
        }
    }
}

async fn recv_control(
    control: &mut Option<&mut mpsc::UnboundedReceiver<RunnerControl>>,
) -> Option<RunnerControl> {
    match control {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rexec_stream::ChannelStream;
    use std::sync::{Arc, Mutex};

    fn markers() -> MarkerPair {
        MarkerPair::new("<<S-1>>", "<<E-1>>")
    }

    fn parser() -> MarkerParser {
        MarkerParser::new(&markers(), Box::new(|_| false), Duration::from_millis(500)).unwrap()
    }

    fn lines(events: &[ParserEvent]) -> Vec<&str> {
        events
            .iter()
            .filter_map(|e| match e {
                ParserEvent::Line(l) => Some(l.as_str()),
                _ => None,
            })
            .collect()
    }

    #[derive(Default, Clone)]
    struct Recorded {
        lines: Arc<Mutex<Vec<String>>>,
        exit_codes: Arc<Mutex<Vec<i32>>>,
        completed: Arc<Mutex<Vec<RunOutcome>>>,
        continued: Arc<Mutex<usize>>,
    }

    impl Recorded {
        fn callbacks(&self) -> RunnerCallbacks {
            let lines = Arc::clone(&self.lines);
            let codes = Arc::clone(&self.exit_codes);
            let completed = Arc::clone(&self.completed);
            let continued = Arc::clone(&self.continued);
            RunnerCallbacks::new()
                .on_line(move |l| lines.lock().unwrap().push(l.to_string()))
                .on_exit_code(move |c| codes.lock().unwrap().push(c))
                .on_completed(move |o| completed.lock().unwrap().push(o.clone()))
                .on_continue(move || *continued.lock().unwrap() += 1)
        }

        fn lines(&self) -> Vec<String> {
            self.lines.lock().unwrap().clone()
        }
    }

    fn execution(recorded: &Recorded, now: Instant) -> CommandExecution {
        CommandExecution::with_markers(
            CommandId::new(),
            "make test",
            markers(),
            None,
            &RunnerConfig::default(),
            recorded.callbacks(),
            now,
        )
        .unwrap()
    }

    #[test]
    fn test_lines_before_start_are_dropped() {
        let now = Instant::now();
        let mut p = parser();
        let events = p.feed("$ printf stuff\r\n<<S-1>>\r\nhello\r\nworld\r\n", now);
        assert_eq!(events[0], ParserEvent::Started);
        assert_eq!(lines(&events), vec!["hello", "world"]);
    }

    #[test]
    fn test_end_marker_exit_code() {
        let now = Instant::now();
        let mut p = parser();
        p.feed("<<S-1>>\n", now);
        let events = p.feed("done\n<<E-1>>:42\n$ ", now);
        assert_eq!(lines(&events), vec!["done"]);
        assert_eq!(events.last(), Some(&ParserEvent::Finished { exit_code: Some(42) }));
        assert!(p.is_finished());
        assert!(p.feed("more\n", now).is_empty());
    }

    #[test]
    fn test_output_without_trailing_newline_before_end_marker() {
        let now = Instant::now();
        let mut p = parser();
        p.feed("<<S-1>>\n", now);
        let events = p.feed("no newline<<E-1>>:0\n", now);
        assert_eq!(lines(&events), vec!["no newline"]);
    }

    #[test]
    fn test_lines_split_across_chunks() {
        let now = Instant::now();
        let mut p = parser();
        p.feed("<<S-", now);
        let events = p.feed("1>>\r", now);
        assert!(events.is_empty());
        let events = p.feed("\nab", now);
        assert_eq!(events, vec![ParserEvent::Started]);
        let events = p.feed("c\r\n", now);
        assert_eq!(lines(&events), vec!["abc"]);
    }

    #[test]
    fn test_bare_carriage_returns_split_lines() {
        let now = Instant::now();
        let mut p = parser();
        p.feed("<<S-1>>\n", now);
        let events = p.feed("10%\r50%\r\r\n", now);
        assert_eq!(lines(&events), vec!["10%", "50%"]);
    }

    #[test]
    fn test_half_line_release() {
        let now = Instant::now();
        let mut p = parser();
        p.feed("<<S-1>>\n", now);
        p.feed("Password:", now);
        assert_eq!(p.next_deadline(), Some(now + Duration::from_millis(500)));
        assert!(p.poll(now + Duration::from_millis(499)).is_empty());
        let events = p.poll(now + Duration::from_millis(500));
        assert_eq!(lines(&events), vec!["Password:"]);
        // The line break that follows the answer adds no empty line.
        assert!(p.feed("\r\n", now).is_empty());
        assert_eq!(lines(&p.feed("ok\n", now)), vec!["ok"]);
    }

    #[test]
    fn test_half_line_timer_restarts_on_data() {
        let now = Instant::now();
        let mut p = parser();
        p.feed("<<S-1>>\n", now);
        p.feed("Pass", now);
        p.feed("word:", now + Duration::from_millis(300));
        assert_eq!(p.next_deadline(), Some(now + Duration::from_millis(800)));
    }

    #[test]
    fn test_no_half_line_release_before_start() {
        let now = Instant::now();
        let mut p = parser();
        p.feed("$ ", now);
        assert_eq!(p.next_deadline(), None);
    }

    #[test]
    fn test_partial_end_marker_is_not_released() {
        let now = Instant::now();
        let mut p = parser();
        p.feed("<<S-1>>\n", now);
        p.feed("<<E-", now);
        assert!(p.poll(now + Duration::from_secs(1)).is_empty());
        let events = p.feed("1>>:3\n", now + Duration::from_secs(1));
        assert_eq!(events, vec![ParserEvent::Finished { exit_code: Some(3) }]);
    }

    #[test]
    fn test_mid_line_tail_is_released() {
        let now = Instant::now();
        let mut p = parser();
        p.feed("<<S-1>>\n", now);
        p.feed("progress <<", now);
        let events = p.poll(now + Duration::from_millis(500));
        assert_eq!(lines(&events), vec!["progress <<"]);
    }

    #[test]
    fn test_end_marker_after_released_half_line() {
        let now = Instant::now();
        let mut p = parser();
        p.feed("<<S-1>>\n", now);
        p.feed("abc<<E-", now);
        let later = now + Duration::from_millis(500);
        assert_eq!(lines(&p.poll(later)), vec!["abc<<E-"]);
        let events = p.feed("1>>:4\n", later);
        assert_eq!(events, vec![ParserEvent::Finished { exit_code: Some(4) }]);
    }

    #[test]
    fn test_visible_output_skips_markers_and_echo() {
        let now = Instant::now();
        let echo: EchoFilter = Box::new(|line| line.trim() == "make test");
        let mut p = MarkerParser::new(&markers(), echo, Duration::from_millis(500)).unwrap();

        p.feed("make test\r\n<<S-1>>\r\nhello\r\nmake test\r\nPassword: ", now);
        assert_eq!(p.take_visible(), "hello\nPassword: ");
        assert_eq!(p.take_visible(), "");

        p.feed("\r\nok\r\n<<E-1>>:0\r\n", now);
        assert_eq!(p.take_visible(), "\nok\n");
    }

    #[test]
    fn test_visible_output_holds_possible_marker() {
        let now = Instant::now();
        let mut p = parser();
        p.feed("<<S-1>>\n", now);
        p.feed("done<<E", now);
        assert_eq!(p.take_visible(), "done");
        p.feed("-1>>:0\n", now);
        assert_eq!(p.take_visible(), "");
        assert!(p.is_finished());
    }

    #[test]
    fn test_detector_chunks_never_carry_markers() {
        let now = Instant::now();
        let chunks = Arc::new(Mutex::new(String::new()));
        let seen = Arc::clone(&chunks);
        let callbacks = RunnerCallbacks::new()
            .on_chunk(move |chunk| seen.lock().unwrap().push_str(&chunk.text));
        let markers = MarkerPair::generate("__REXEC");
        let mut exec = CommandExecution::with_markers(
            CommandId::new(),
            "sleep 100",
            markers.clone(),
            None,
            &RunnerConfig::default(),
            callbacks,
            now,
        )
        .unwrap();
        let echo = format!("{}\r\n", exec.wrapped_command());

        exec.on_data(echo.as_bytes(), now);
        exec.on_data(format!("{}\r\n", markers.start()).as_bytes(), now);
        exec.on_data(b"still running", now);
        exec.on_tick(now + Duration::from_secs(1));
        exec.on_data(format!("\r\n{}:0\r\n", markers.end()).as_bytes(), now);

        let seen = chunks.lock().unwrap();
        assert_eq!(*seen, "still running\n");
        assert!(!seen.contains(markers.start()));
        assert!(!seen.contains(markers.end()));
    }

    #[test]
    fn test_echo_filter_after_start() {
        let now = Instant::now();
        let echo: EchoFilter = Box::new(|line| line.trim() == "make test");
        let mut p = MarkerParser::new(&markers(), echo, Duration::from_millis(500)).unwrap();
        let events = p.feed("<<S-1>>\nmake test\nbuilding\n", now);
        assert_eq!(lines(&events), vec!["building"]);
    }

    #[test]
    fn test_execution_completes_once() {
        let now = Instant::now();
        let recorded = Recorded::default();
        let mut exec = execution(&recorded, now);

        let outcome = exec.on_data(b"<<S-1>>\r\nok\r\n<<E-1>>:7\r\n", now).unwrap();
        assert_eq!(outcome.exit_code, 7);
        assert!(outcome.completed);
        assert!(!outcome.timed_out());

        assert!(exec.complete(CompletionReason::StreamClosed).is_none());
        assert!(exec.on_data(b"late\n", now).is_none());
        assert_eq!(recorded.completed.lock().unwrap().len(), 1);
        assert_eq!(*recorded.continued.lock().unwrap(), 1);
        assert_eq!(*recorded.exit_codes.lock().unwrap(), vec![7]);
        assert_eq!(exec.state(), ExecutionState::Completed);
    }

    #[test]
    fn test_execution_strips_ansi() {
        let now = Instant::now();
        let recorded = Recorded::default();
        let mut exec = execution(&recorded, now);
        exec.on_data(b"<<S-1>>\r\n\x1b[32mgreen\x1b[0m\r\n", now);
        assert_eq!(recorded.lines(), vec!["green"]);
        assert_eq!(exec.state(), ExecutionState::Started);
    }

    #[test]
    fn test_execution_timeout() {
        let now = Instant::now();
        let recorded = Recorded::default();
        let mut exec = execution(&recorded, now);
        exec.on_data(b"<<S-1>>\r\npartial", now);

        let timeout_at = now + RunnerConfig::default().command_timeout;
        let outcome = exec.on_tick(timeout_at).unwrap();
        assert!(outcome.timed_out());
        assert!(!outcome.completed);
        assert_eq!(outcome.exit_code, 0);
        let lines = recorded.lines();
        assert_eq!(lines[0], "partial");
        assert!(lines[1].contains("timed out"));
    }

    #[test]
    fn test_output_buffer_is_bounded() {
        let now = Instant::now();
        let config = RunnerConfig {
            max_output_lines: 2,
            ..RunnerConfig::default()
        };
        let mut exec = CommandExecution::with_markers(
            CommandId::new(),
            "seq 3",
            markers(),
            None,
            &config,
            RunnerCallbacks::new(),
            now,
        )
        .unwrap();
        exec.on_data(b"<<S-1>>\n1\n2\n3\n", now);
        assert_eq!(exec.output().collect::<Vec<_>>(), vec!["2", "3"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_against_channel_stream() {
        let (stream, mut remote) = ChannelStream::pair();
        let (writer, mut events) = stream.into_parts();
        let recorded = Recorded::default();
        let mut exec = execution(&recorded, Instant::now());
        let wrapped = exec.wrapped_command().to_string();

        let shell = tokio::spawn(async move {
            let written = remote.next_write_str().await.unwrap();
            assert!(written.ends_with('\r'));
            remote.send(format!("{}\r\n", written.trim_end()));
            remote.send("<<S-1>>\r\nline one\r\n");
            remote.send("line two\r\n<<E-1>>:3\r\n$ ");
            remote
        });

        let outcome = run(
            writer.as_ref(),
            &mut events,
            &mut exec,
            None,
            &RunnerConfig::default(),
        )
        .await
        .unwrap();
        let _remote = shell.await.unwrap();

        assert_eq!(outcome.exit_code, 3);
        assert_eq!(outcome.reason, CompletionReason::EndMarker);
        assert_eq!(recorded.lines(), vec!["line one", "line two"]);
        assert!(!recorded.lines().contains(&wrapped));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stream_closed_before_end() {
        let (stream, remote) = ChannelStream::pair();
        let (writer, mut events) = stream.into_parts();
        let recorded = Recorded::default();
        let mut exec = execution(&recorded, Instant::now());

        remote.send("<<S-1>>\r\nworking\r\n");
        remote.close();

        let outcome = run(
            writer.as_ref(),
            &mut events,
            &mut exec,
            None,
            &RunnerConfig::default(),
        )
        .await
        .unwrap();
        assert_eq!(outcome.reason, CompletionReason::StreamClosed);
        assert!(outcome.timed_out());
        assert_eq!(*recorded.continued.lock().unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_times_out() {
        let (stream, _remote) = ChannelStream::pair();
        let (writer, mut events) = stream.into_parts();
        let config = RunnerConfig {
            command_timeout: Duration::from_secs(2),
            ..RunnerConfig::default()
        };
        let recorded = Recorded::default();
        let mut exec = CommandExecution::with_markers(
            CommandId::new(),
            "sleep 100",
            markers(),
            None,
            &config,
            recorded.callbacks(),
            Instant::now(),
        )
        .unwrap();

        let outcome = run(writer.as_ref(), &mut events, &mut exec, None, &config)
            .await
            .unwrap();
        assert_eq!(outcome.reason, CompletionReason::Timeout);
        assert!(recorded.lines().last().unwrap().contains("timed out after 2s"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_terminate() {
        let (stream, _remote) = ChannelStream::pair();
        let (writer, mut events) = stream.into_parts();
        let (control_tx, mut control_rx) = mpsc::unbounded_channel();
        let recorded = Recorded::default();
        let mut exec = execution(&recorded, Instant::now());

        control_tx.send(RunnerControl::Terminate).unwrap();
        let outcome = run(
            writer.as_ref(),
            &mut events,
            &mut exec,
            Some(&mut control_rx),
            &RunnerConfig::default(),
        )
        .await
        .unwrap();
        assert_eq!(outcome.reason, CompletionReason::Terminated);
        assert!(!outcome.timed_out());
        assert_eq!(recorded.completed.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_run_write_failure_still_continues() {
        let (stream, remote) = ChannelStream::pair();
        let (writer, mut events) = stream.into_parts();
        remote.close();
        let recorded = Recorded::default();
        let mut exec = execution(&recorded, Instant::now());

        let err = run(
            writer.as_ref(),
            &mut events,
            &mut exec,
            None,
            &RunnerConfig::default(),
        )
        .await
        .unwrap_err();
        assert_eq!(err, TransportFailure::Closed);
        assert_eq!(*recorded.continued.lock().unwrap(), 1);
        assert_eq!(
            exec.outcome().map(|o| o.reason),
            Some(CompletionReason::WriteFailed)
        );
    }
}
