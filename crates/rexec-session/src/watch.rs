//! Interaction watch task.
//!
//! One task per watched command owns the [`InteractionDetector`], its
//! timers and the classifier calls. Everything reaches it as a
//! [`WatchInput`] message, so the detector is only ever touched from one
//! place. While an interaction is shown, the command's output lines wait
//! in an [`OutputGate`] until the host answers, cancels or dismisses it.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rexec_core::{CommandId, ExitKey, InteractionRequest, Key, TransportFailure};
use rexec_detector::{ClassifierError, DetectorEvent, InteractionClassifier, InteractionDetector, TuiCategory};
use rexec_stream::{write_with_drain, FilteredChunk, StreamWriter};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Notification for the UI/host.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HostEvent {
    /// Show an input prompt for a command
    InteractionNeeded(InteractionRequest),
    /// A prompt was detected but prompts are suppressed for the command
    InteractionSuppressed(InteractionRequest),
    /// A full-screen program was cancelled automatically
    TuiDetected {
        /// Command that ran the program
        command_id: CommandId,
        /// Classification of the command
        category: TuiCategory,
    },
    /// A full-screen program without a pager took over the terminal
    AlternateScreenEntered {
        /// Command that entered the alternate screen
        command_id: CommandId,
    },
}

/// Message to a watch task.
#[derive(Debug)]
pub enum WatchInput {
    /// Output of the command
    Chunk(FilteredChunk),
    /// Answer the shown interaction
    Submit {
        /// Text to type
        input: String,
        /// Whether Enter follows the text
        append_newline: bool,
        /// Result of the write
        reply: oneshot::Sender<Result<(), TransportFailure>>,
    },
    /// Leave the program instead of answering
    Cancel {
        /// Result of the write
        reply: oneshot::Sender<Result<(), TransportFailure>>,
    },
    /// Close the prompt without answering
    Dismiss,
    /// Stop raising prompts
    Suppress,
    /// Raise prompts again
    Unsuppress,
    /// Classifier answer for the call tagged `generation`
    Classified {
        /// Generation tag from the detector
        generation: u64,
        /// Raw answer
        result: Result<serde_json::Value, ClassifierError>,
    },
    /// The command completed
    Stop,
}

/// Holds a command's output lines back while an interaction is shown.
///
/// Lines pass straight to the sink while the gate is open. Held lines are
/// delivered in order on release.
#[derive(Clone)]
pub struct OutputGate {
    held: Arc<Mutex<Option<Vec<String>>>>,
    sink: Arc<dyn Fn(String) + Send + Sync>,
}

impl OutputGate {
    /// Open gate delivering lines to `sink`.
    pub fn new(sink: impl Fn(String) + Send + Sync + 'static) -> Self {
        Self {
            held: Arc::new(Mutex::new(None)),
            sink: Arc::new(sink),
        }
    }

    /// Deliver `line`, or keep it while the gate is closed.
    pub fn emit(&self, line: &str) {
        let mut held = self.lock();
        match held.as_mut() {
            Some(lines) => lines.push(line.to_string()),
            None => (self.sink)(line.to_string()),
        }
    }

    /// Start holding lines back.
    pub fn hold(&self) {
        self.lock().get_or_insert_with(Vec::new);
    }

    /// Deliver everything held and open the gate.
    pub fn release(&self) {
        let mut held = self.lock();
        if let Some(lines) = held.take() {
            if !lines.is_empty() {
                debug!("Releasing {} held output lines", lines.len());
            }
            for line in lines {
                (self.sink)(line);
            }
        }
    }

    /// Whether lines are being held back.
    pub fn is_holding(&self) -> bool {
        self.lock().is_some()
    }

    fn lock(&self) -> MutexGuard<'_, Option<Vec<String>>> {
        self.held.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for OutputGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputGate")
            .field("holding", &self.is_holding())
            .finish_non_exhaustive()
    }
}

/// Collaborators a watch task talks to.
#[derive(Clone)]
pub struct WatchContext {
    /// Stream the command runs on
    pub writer: Arc<dyn StreamWriter>,
    /// Optional classifier
    pub classifier: Option<Arc<dyn InteractionClassifier>>,
    /// Host notifications
    pub host: broadcast::Sender<HostEvent>,
    /// Bytes that submit a line
    pub enter_sequence: String,
    /// Bound on waiting for a buffered write to drain
    pub drain_timeout: Duration,
    /// Output lines held while an interaction is shown
    pub output: Option<OutputGate>,
}

impl std::fmt::Debug for WatchContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchContext")
            .field("classifier", &self.classifier.is_some())
            .field("enter_sequence", &self.enter_sequence)
            .field("drain_timeout", &self.drain_timeout)
            .field("output", &self.output)
            .finish_non_exhaustive()
    }
}

/// Start a watch task for `detector`.
///
/// The task ends on [`WatchInput::Stop`] or when every sender is dropped,
/// and disposes the detector on the way out.
pub fn spawn_watch(
    detector: InteractionDetector,
    context: WatchContext,
) -> (mpsc::UnboundedSender<WatchInput>, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(watch_loop(detector, context, rx, tx.downgrade()));
    (tx, task)
}

struct Watch {
    detector: InteractionDetector,
    context: WatchContext,
    inputs: mpsc::WeakUnboundedSender<WatchInput>,
    exit_key: Option<ExitKey>,
}

async fn watch_loop(
    detector: InteractionDetector,
    context: WatchContext,
    mut rx: mpsc::UnboundedReceiver<WatchInput>,
    inputs: mpsc::WeakUnboundedSender<WatchInput>,
) {
    let mut watch = Watch {
        detector,
        context,
        inputs,
        exit_key: None,
    };

    loop {
        let deadline = watch.detector.next_deadline();
        tokio::select! {
            input = rx.recv() => match input {
                Some(WatchInput::Stop) | None => break,
                Some(input) => watch.handle_input(input).await,
            },
            _ = sleep_until(deadline) => {
                let events = watch.detector.poll(Instant::now());
                watch.dispatch(events).await;
            }
        }
    }

    debug!("Watch for {} stopped", watch.command_id());
    watch.release_output();
    watch.detector.dispose();
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

impl Watch {
    fn command_id(&self) -> CommandId {
        self.detector.command_id()
    }

    async fn handle_input(&mut self, input: WatchInput) {
        let now = Instant::now();
        let events = match input {
            WatchInput::Chunk(chunk) => self.detector.feed(&chunk, now),
            WatchInput::Submit {
                input,
                append_newline,
                reply,
            } => {
                let mut bytes = input.into_bytes();
                if append_newline {
                    bytes.extend_from_slice(self.context.enter_sequence.as_bytes());
                }
                let result = self.write(&bytes).await;
                self.exit_key = None;
                let events = self.detector.resume(Instant::now());
                self.release_output();
                let _ = reply.send(result);
                events
            }
            WatchInput::Cancel { reply } => {
                let bytes = match self.exit_key.take() {
                    Some(key) => key.to_bytes(&self.context.enter_sequence),
                    None => Key::interrupt().to_escape_sequence(),
                };
                let result = self.write(&bytes).await;
                let events = self.detector.resume(Instant::now());
                self.release_output();
                let _ = reply.send(result);
                events
            }
            WatchInput::Dismiss => {
                self.exit_key = None;
                let events = self.detector.dismiss(now);
                self.release_output();
                events
            }
            WatchInput::Suppress => {
                self.detector.suppress();
                Vec::new()
            }
            WatchInput::Unsuppress => {
                self.detector.unsuppress(now);
                Vec::new()
            }
            WatchInput::Classified { generation, result } => {
                self.detector.on_classification(generation, result, now)
            }
            WatchInput::Stop => Vec::new(),
        };
        self.dispatch(events).await;
    }

    async fn dispatch(&mut self, events: Vec<DetectorEvent>) {
        let command_id = self.command_id();
        for event in events {
            match event {
                DetectorEvent::InteractionNeeded(request) => {
                    info!(
                        "Interaction needed for {}: {:?} ({:?})",
                        command_id, request.interaction_type, request.reason
                    );
                    self.exit_key = request.exit_key.clone();
                    if let Some(output) = &self.context.output {
                        output.hold();
                    }
                    self.notify(HostEvent::InteractionNeeded(request));
                }
                DetectorEvent::InteractionSuppressed(request) => {
                    self.notify(HostEvent::InteractionSuppressed(request));
                }
                DetectorEvent::AlternateScreenEntered => {
                    self.notify(HostEvent::AlternateScreenEntered { command_id });
                }
                DetectorEvent::TuiDetected { category } => {
                    info!("Cancelled full-screen program for {}", command_id);
                    self.notify(HostEvent::TuiDetected {
                        command_id,
                        category,
                    });
                }
                DetectorEvent::SendInterrupt => {
                    if let Err(failure) = self.write(&Key::interrupt().to_escape_sequence()).await {
                        warn!("Interrupt for {} failed: {}", command_id, failure.code());
                    }
                }
                DetectorEvent::Classify(request) => self.classify(request),
            }
        }
    }

    fn classify(&self, request: rexec_detector::ClassifyRequest) {
        let (Some(classifier), Some(generation)) = (
            self.context.classifier.clone(),
            self.detector.classification_in_flight(),
        ) else {
            return;
        };
        let inputs = self.inputs.clone();
        debug!(
            "Classifying output of {} (attempt {})",
            request.command_id, request.attempt
        );
        tokio::spawn(async move {
            let result = classifier.classify(request).await;
            if let Some(tx) = inputs.upgrade() {
                let _ = tx.send(WatchInput::Classified { generation, result });
            }
        });
    }

    fn release_output(&self) {
        if let Some(output) = &self.context.output {
            output.release();
        }
    }

    fn notify(&self, event: HostEvent) {
        // No subscribers is fine; the host may not listen.
        let _ = self.context.host.send(event);
    }

    async fn write(&self, bytes: &[u8]) -> Result<(), TransportFailure> {
        write_with_drain(self.context.writer.as_ref(), bytes, self.context.drain_timeout).await
    }
}
