//! Scripted transports and shells for the scenario tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use rexec_core::{
    ConnectionId, Credentials, Destination, Dimensions, InteractionRequest, Result, TransportKind,
};
use rexec_detector::{ClassifierError, ClassifyRequest, InteractionClassifier};
use rexec_session::{CommandEvent, CommandHandle, ConnectOutcome, HostEvent, SessionManager, Transport};
use rexec_stream::{ChannelStream, RemoteEnd, ShellStream};
use tokio::sync::{broadcast, mpsc};

/// Transport whose shells are driven by the test.
pub struct ScriptedTransport {
    kind: TransportKind,
    shells: mpsc::UnboundedSender<FakeShell>,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new(kind: TransportKind) -> (Arc<Self>, mpsc::UnboundedReceiver<FakeShell>) {
        let (shells, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            kind,
            shells,
            connects: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
        });
        (transport, rx)
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    fn kind(&self) -> TransportKind {
        self.kind.clone()
    }

    async fn connect(&self, _destination: &Destination) -> Result<ConnectOutcome> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(ConnectOutcome::Connected(ConnectionId::generate()))
    }

    async fn open_shell(&self, _connection: &ConnectionId, _dimensions: Dimensions) -> Result<ShellStream> {
        let (stream, remote) = ChannelStream::pair();
        let _ = self.shells.send(FakeShell { remote });
        Ok(stream)
    }

    async fn disconnect(&self, _connection: &ConnectionId) -> Result<()> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// A wrapped command as the remote shell received it.
#[derive(Debug, Clone)]
pub struct CommandLine {
    pub raw: String,
    pub start: String,
    pub end: String,
}

/// The remote side of one shell.
pub struct FakeShell {
    remote: RemoteEnd,
}

impl FakeShell {
    pub fn send(&self, text: impl AsRef<str>) {
        self.remote.send(text.as_ref());
    }

    pub async fn next_write(&mut self) -> String {
        self.remote
            .next_write_str()
            .await
            .expect("session stream closed")
    }

    /// Read the next wrapped command and recover its markers.
    pub async fn next_command(&mut self) -> CommandLine {
        let raw = self.next_write().await;
        let start = Regex::new(r"printf '%s%s\\n' '([^']*)' '([^']*)'").unwrap();
        let end = Regex::new(r"printf '%s%s:%s\\n' '([^']*)' '([^']*)'").unwrap();
        let s = start.captures(&raw).expect("start marker");
        let e = end.captures(&raw).expect("end marker");
        CommandLine {
            start: format!("{}{}", &s[1], &s[2]),
            end: format!("{}{}", &e[1], &e[2]),
            raw,
        }
    }

    /// Echo the command line and print the start marker, like a shell would.
    pub fn start(&self, command: &CommandLine) {
        self.send(format!("{}\r\n{}\r\n", command.raw.trim_end(), command.start));
    }

    pub fn finish(&self, command: &CommandLine, exit_code: i32) {
        self.send(format!("{}:{}\r\n", command.end, exit_code));
    }

    pub fn close(&self) {
        self.remote.close();
    }

    pub fn is_closed(&self) -> bool {
        self.remote.is_closed()
    }
}

impl CommandLine {
    /// Fail if `text` shows either marker or the wrapped command line.
    pub fn assert_hidden_in(&self, text: &str) {
        assert!(!text.contains(&self.start), "start marker visible in {text:?}");
        assert!(!text.contains(&self.end), "end marker visible in {text:?}");
        assert!(!text.contains("printf"), "wrapped command visible in {text:?}");
    }
}

/// Classifier that records what it is asked and never asks for input.
pub struct RecordingClassifier {
    requests: mpsc::UnboundedSender<ClassifyRequest>,
}

impl RecordingClassifier {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ClassifyRequest>) {
        let (requests, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { requests }), rx)
    }
}

#[async_trait]
impl InteractionClassifier for RecordingClassifier {
    async fn classify(&self, request: ClassifyRequest) -> std::result::Result<serde_json::Value, ClassifierError> {
        let _ = self.requests.send(request);
        Ok(serde_json::json!({ "needsInteraction": false }))
    }
}

pub fn manager(transport: Arc<ScriptedTransport>) -> SessionManager {
    SessionManager::builder().transport(transport).build()
}

pub fn ssh(host: &str) -> Destination {
    Destination::ssh(host, 22, Credentials::user("ops"))
}

/// Next prompt shown to the host, skipping other notifications.
pub async fn next_interaction(host: &mut broadcast::Receiver<HostEvent>) -> InteractionRequest {
    loop {
        if let HostEvent::InteractionNeeded(request) = host.recv().await.unwrap() {
            return request;
        }
    }
}

/// Every event of a command until its task is done.
pub async fn drain_events(handle: &mut CommandHandle) -> Vec<CommandEvent> {
    let mut events = Vec::new();
    while let Some(event) = handle.next_event().await {
        events.push(event);
    }
    events
}

/// Events that arrive within `window`.
pub async fn events_within(handle: &mut CommandHandle, window: Duration) -> Vec<CommandEvent> {
    let deadline = tokio::time::Instant::now() + window;
    let mut events = Vec::new();
    while let Ok(Some(event)) = tokio::time::timeout_at(deadline, handle.next_event()).await {
        events.push(event);
    }
    events
}

pub fn lines(events: &[CommandEvent]) -> Vec<&str> {
    events
        .iter()
        .filter_map(|e| match e {
            CommandEvent::Line(line) => Some(line.as_str()),
            _ => None,
        })
        .collect()
}
