//! Session manager: connection setup, command execution, interaction
//! routing and teardown.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rexec_core::{
    CommandId, ConnectionId, Destination, DestinationKey, Dimensions, Error, Result, RexecConfig,
    SessionId, SessionInfo, SessionStatus, TransportFailure, TransportKind,
};
use rexec_detector::{DetectorConfig, InteractionClassifier, InteractionDetector, RuleSet};
use rexec_stream::ShellStream;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::handshake::{run_handshake, HandshakeConfig, HandshakeHost, HandshakeProgress, NoHandshakeHost};
use crate::local::LocalTransport;
use crate::pool::ConnectionPool;
use crate::router::InteractionRouter;
use crate::runner::{self, CommandExecution, CompletionReason, RunOutcome, RunnerCallbacks, RunnerConfig, RunnerControl};
use crate::session::Session;
use crate::transport::{ConnectOutcome, Transport, TransportRegistry};
use crate::watch::{spawn_watch, HostEvent, OutputGate, WatchContext, WatchInput};

// Capacity of the host notification channel.
const HOST_EVENT_CAPACITY: usize = 256;

/// Configuration for session manager.
#[derive(Debug, Clone)]
pub struct SessionManagerConfig {
    /// Maximum number of concurrent sessions
    pub max_sessions: usize,

    /// Window size of new shells
    pub dimensions: Dimensions,

    /// Bound on waiting for a buffered write to drain
    pub drain_timeout: Duration,

    /// Runner settings
    pub runner: RunnerConfig,

    /// Detector settings
    pub detector: DetectorConfig,

    /// Bastion handshake settings
    pub handshake: HandshakeConfig,
}

impl From<&RexecConfig> for SessionManagerConfig {
    fn from(config: &RexecConfig) -> Self {
        Self {
            max_sessions: config.session.max_sessions,
            dimensions: config.session.default_dimensions(),
            drain_timeout: Duration::from_millis(config.session.input_drain_timeout_ms),
            runner: RunnerConfig::from(config),
            detector: DetectorConfig::from(&config.detector),
            handshake: HandshakeConfig::from(config),
        }
    }
}

impl Default for SessionManagerConfig {
    fn default() -> Self {
        Self::from(&RexecConfig::default())
    }
}

/// Per-command options.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Directory to run in
    pub cwd: Option<String>,
    /// Watch the command for interactive prompts
    pub watch: bool,
    /// Override of the command timeout
    pub timeout: Option<Duration>,
}

impl RunOptions {
    /// Options that watch the command for prompts.
    pub fn watched() -> Self {
        Self {
            watch: true,
            ..Self::default()
        }
    }

    /// Run in `cwd`.
    pub fn with_cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Override the command timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Event of a running command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandEvent {
    /// One line of output
    Line(String),
    /// Exit status of the command
    ExitCode(i32),
    /// The execution completed
    Completed(RunOutcome),
    /// The stream failed
    Error(TransportFailure),
}

/// Handle to a command started with [`SessionManager::run`].
#[derive(Debug)]
pub struct CommandHandle {
    id: CommandId,
    session_id: SessionId,
    events: mpsc::UnboundedReceiver<CommandEvent>,
    control: mpsc::UnboundedSender<RunnerControl>,
    task: JoinHandle<Result<RunOutcome>>,
}

impl CommandHandle {
    /// Command identifier, used for interaction routing.
    pub fn id(&self) -> CommandId {
        self.id
    }

    /// Session the command runs on.
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Next event; `None` once the command is done and all events are read.
    pub async fn next_event(&mut self) -> Option<CommandEvent> {
        self.events.recv().await
    }

    /// Complete now without waiting for the remote side.
    ///
    /// The remote command may still be running afterwards.
    pub fn force_terminate(&self) {
        if self.control.send(RunnerControl::Terminate).is_err() {
            debug!("Command {} already finished", self.id);
        }
    }

    /// Wait for the outcome.
    pub async fn wait(self) -> Result<RunOutcome> {
        self.task
            .await
            .map_err(|e| Error::Other(format!("command task failed: {e}")))?
    }
}

/// Builder for [`SessionManager`].
pub struct SessionManagerBuilder {
    config: SessionManagerConfig,
    transports: TransportRegistry,
    classifier: Option<Arc<dyn InteractionClassifier>>,
    handshake_host: Arc<dyn HandshakeHost>,
    rules: RuleSet,
}

impl Default for SessionManagerBuilder {
    fn default() -> Self {
        let mut transports = TransportRegistry::new();
        transports.register(Arc::new(LocalTransport::default()));
        Self {
            config: SessionManagerConfig::default(),
            transports,
            classifier: None,
            handshake_host: Arc::new(NoHandshakeHost),
            rules: RuleSet::builtin(),
        }
    }
}

impl SessionManagerBuilder {
    /// Apply a loaded configuration, including custom detector rules.
    pub fn config(mut self, config: &RexecConfig) -> Result<Self> {
        self.config = SessionManagerConfig::from(config);
        self.rules = RuleSet::with_custom_rules(&config.detector.custom_rules)?;
        Ok(self)
    }

    /// Replace the runtime settings.
    pub fn settings(mut self, config: SessionManagerConfig) -> Self {
        self.config = config;
        self
    }

    /// Register a transport, replacing any of the same kind.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transports.register(transport);
        self
    }

    /// Install a classifier for ambiguous output.
    pub fn classifier(mut self, classifier: Arc<dyn InteractionClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    /// Install the host answering handshake questions.
    pub fn handshake_host(mut self, host: Arc<dyn HandshakeHost>) -> Self {
        self.handshake_host = host;
        self
    }

    /// Replace the detector rule tables.
    pub fn rules(mut self, rules: RuleSet) -> Self {
        self.rules = rules;
        self
    }

    /// Build the manager.
    pub fn build(self) -> SessionManager {
        let (host_events, _) = broadcast::channel(HOST_EVENT_CAPACITY);
        SessionManager {
            inner: Arc::new(Inner {
                config: self.config,
                transports: self.transports,
                sessions: RwLock::new(HashMap::new()),
                pool: Mutex::new(ConnectionPool::new()),
                running: Mutex::new(HashMap::new()),
                watched: Mutex::new(HashMap::new()),
                router: InteractionRouter::new(),
                host_events,
                classifier: self.classifier,
                handshake_host: self.handshake_host,
                rules: Arc::new(self.rules),
            }),
        }
    }
}

/// Session manager for remote shells.
///
/// Owns the sessions, the connection pool and the interaction router.
/// Cloning is cheap; clones share state.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

struct Inner {
    config: SessionManagerConfig,
    transports: TransportRegistry,
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
    pool: Mutex<ConnectionPool>,
    running: Mutex<HashMap<CommandId, mpsc::UnboundedSender<RunnerControl>>>,
    // Watched command currently running on each session
    watched: Mutex<HashMap<SessionId, CommandId>>,
    router: InteractionRouter,
    host_events: broadcast::Sender<HostEvent>,
    classifier: Option<Arc<dyn InteractionClassifier>>,
    handshake_host: Arc<dyn HandshakeHost>,
    rules: Arc<RuleSet>,
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("config", &self.inner.config)
            .field("transports", &self.inner.transports)
            .finish_non_exhaustive()
    }
}

impl SessionManager {
    /// Create a session manager with default configuration and the local
    /// transport.
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Start building a session manager.
    pub fn builder() -> SessionManagerBuilder {
        SessionManagerBuilder::default()
    }

    /// Runtime settings.
    pub fn config(&self) -> &SessionManagerConfig {
        &self.inner.config
    }

    /// Subscribe to host notifications (prompts, TUI cancellation).
    pub fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.inner.host_events.subscribe()
    }

    /// Open a session, reusing a pooled connection when one exists.
    pub async fn open_session(&self, destination: &Destination) -> Result<SessionId> {
        let inner = &self.inner;
        let max = inner.config.max_sessions;
        if inner.sessions.read().await.len() >= max {
            return Err(Error::SessionLimitReached(max));
        }
        if destination.transport == TransportKind::Bastion && destination.bastion.is_none() {
            return Err(Error::InvalidInput(
                "bastion destination needs a target".to_string(),
            ));
        }

        let transport = inner.transports.get(&destination.transport)?;
        let key = destination.key();
        let kind = transport.kind();
        info!("Opening session to {} via {}", key, kind);

        let connection_id = inner.acquire_connection(destination, &transport).await?;
        let stream = match inner
            .open_shell(destination, &transport, &connection_id)
            .await
        {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Opening shell on {} failed: {}", key, e);
                inner.release_connection(&key, &kind).await;
                return Err(e);
            }
        };

        let session = Arc::new(Session::new(
            key,
            kind,
            connection_id,
            stream,
            inner.config.drain_timeout,
        ));
        let id = session.id();
        inner.sessions.write().await.insert(id, session);
        Ok(id)
    }

    /// Run `command` on a session.
    ///
    /// Commands on one session run one after another; a second call queues
    /// behind the first.
    pub async fn run(
        &self,
        session_id: SessionId,
        command: &str,
        options: RunOptions,
    ) -> Result<CommandHandle> {
        let session = self.get_session(session_id).await?;
        if session.is_closed() {
            return Err(Error::SessionClosed(session_id));
        }

        let command_id = CommandId::new();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        self.inner
            .running
            .lock()
            .await
            .insert(command_id, control_tx.clone());

        let inner = Arc::clone(&self.inner);
        let command = command.to_string();
        let task = tokio::spawn(async move {
            inner
                .execute(session, command_id, command, options, events_tx, control_rx)
                .await
        });

        Ok(CommandHandle {
            id: command_id,
            session_id,
            events: events_rx,
            control: control_tx,
            task,
        })
    }

    /// Force completion of a running command.
    pub async fn force_terminate(&self, command_id: CommandId) -> Result<()> {
        let running = self.inner.running.lock().await;
        let control = running
            .get(&command_id)
            .ok_or(Error::CommandNotFound(command_id))?;
        control
            .send(RunnerControl::Terminate)
            .map_err(|_| Error::CommandNotFound(command_id))
    }

    /// Type text into a session.
    ///
    /// While a watched command runs on the session, the text answers its
    /// interaction: detection resumes and held output is delivered.
    pub async fn send_input(&self, session_id: SessionId, text: &str) -> Result<()> {
        let session = self.get_session(session_id).await?;
        let watched = self.inner.watched.lock().await.get(&session_id).copied();
        if let Some(command_id) = watched {
            match self.inner.router.submit(command_id, text, false).await {
                // Finished in the meantime; type into the shell directly.
                Err(Error::CommandNotFound(_)) => {}
                Err(Error::Transport(TransportFailure::Closed)) => {
                    self.inner.discard_session(&session).await;
                    return Err(Error::SessionClosed(session_id));
                }
                other => return other,
            }
        }
        match session.send_input(text.as_bytes()).await {
            Ok(()) => Ok(()),
            Err(TransportFailure::Closed) => {
                self.inner.discard_session(&session).await;
                Err(Error::SessionClosed(session_id))
            }
            Err(failure) => Err(failure.into()),
        }
    }

    /// Answer the prompt shown for a command.
    pub async fn submit_interaction(
        &self,
        command_id: CommandId,
        input: &str,
        append_newline: bool,
    ) -> Result<()> {
        self.inner.router.submit(command_id, input, append_newline).await
    }

    /// Leave the program instead of answering its prompt.
    pub async fn cancel_interaction(&self, command_id: CommandId) -> Result<()> {
        self.inner.router.cancel(command_id).await
    }

    /// Close a prompt without answering.
    pub fn dismiss_interaction(&self, command_id: CommandId) -> Result<()> {
        self.inner.router.dismiss(command_id)
    }

    /// Stop raising prompts for a command.
    pub fn suppress_interaction(&self, command_id: CommandId) -> Result<()> {
        self.inner.router.suppress(command_id)
    }

    /// Raise prompts for a command again.
    pub fn unsuppress_interaction(&self, command_id: CommandId) -> Result<()> {
        self.inner.router.unsuppress(command_id)
    }

    /// Get a session by ID.
    pub async fn get_session(&self, session_id: SessionId) -> Result<Arc<Session>> {
        self.inner
            .sessions
            .read()
            .await
            .get(&session_id)
            .cloned()
            .ok_or(Error::SessionNotFound(session_id))
    }

    /// List all sessions.
    pub async fn list_sessions(&self) -> Vec<SessionInfo> {
        self.inner
            .sessions
            .read()
            .await
            .values()
            .map(|s| s.info())
            .collect()
    }

    /// Get the number of active sessions.
    pub async fn session_count(&self) -> usize {
        self.inner.sessions.read().await.len()
    }

    /// Number of physical connections in the pool.
    pub async fn pool_size(&self) -> usize {
        self.inner.pool.lock().await.len()
    }

    /// Number of commands watched for prompts.
    pub fn watched_commands(&self) -> usize {
        self.inner.router.len()
    }

    /// Change a session's window size.
    pub async fn resize(&self, session_id: SessionId, dimensions: Dimensions) -> Result<()> {
        if !dimensions.is_valid() {
            return Err(Error::InvalidInput(format!(
                "invalid dimensions {}x{}",
                dimensions.rows, dimensions.cols
            )));
        }
        let session = self.get_session(session_id).await?;
        session.resize(dimensions).await.map_err(Error::from)
    }

    /// Ask the session's transport to reload its asset list.
    pub async fn refresh_assets(&self, session_id: SessionId) -> Result<()> {
        let session = self.get_session(session_id).await?;
        let transport = self.inner.transports.get(session.transport_kind())?;
        transport.refresh_assets(session.connection_id()).await
    }

    /// Close a session; the connection goes once its last session is gone.
    pub async fn close_session(&self, session_id: SessionId) -> Result<()> {
        let session = self
            .inner
            .sessions
            .write()
            .await
            .remove(&session_id)
            .ok_or(Error::SessionNotFound(session_id))?;
        session.close().await;
        self.inner
            .release_connection(session.destination(), session.transport_kind())
            .await;
        Ok(())
    }

    /// Tear everything down.
    ///
    /// Best effort: failures are logged and the remaining resources are
    /// still released.
    pub async fn dispose(&self) {
        let inner = &self.inner;
        for (command_id, control) in inner.running.lock().await.drain() {
            debug!("Terminating {} on dispose", command_id);
            let _ = control.send(RunnerControl::Terminate);
        }

        let sessions: Vec<Arc<Session>> = inner
            .sessions
            .write()
            .await
            .drain()
            .map(|(_, s)| s)
            .collect();
        let count = sessions.len();
        for session in sessions {
            session.close().await;
        }

        let connections = inner.pool.lock().await.drain();
        for connection in connections {
            if let Err(e) = connection
                .transport
                .disconnect(&connection.connection_id)
                .await
            {
                warn!("Disconnecting {} failed: {}", connection.connection_id, e);
            }
        }
        info!("Session manager disposed ({} sessions closed)", count);
    }
}

impl Inner {
    async fn acquire_connection(
        &self,
        destination: &Destination,
        transport: &Arc<dyn Transport>,
    ) -> Result<ConnectionId> {
        let key = destination.key();
        let kind = transport.kind();
        if let Some(id) = self.pool.lock().await.acquire(&key, &kind) {
            return Ok(id);
        }

        let id = self.connect(destination, transport.as_ref()).await?;

        let mut pool = self.pool.lock().await;
        if let Some(existing) = pool.acquire(&key, &kind) {
            // Another open raced us to the same destination.
            drop(pool);
            if let Err(e) = transport.disconnect(&id).await {
                warn!("Disconnecting duplicate connection {} failed: {}", id, e);
            }
            return Ok(existing);
        }
        pool.insert(key, id.clone(), Arc::clone(transport));
        Ok(id)
    }

    async fn connect(&self, destination: &Destination, transport: &dyn Transport) -> Result<ConnectionId> {
        let host = self.handshake_host.as_ref();
        let mut outcome = transport.connect(destination).await?;
        loop {
            let (connection_id, challenge) = match outcome {
                ConnectOutcome::Connected(id) => {
                    info!("Connected to {} ({})", destination.key(), id);
                    return Ok(id);
                }
                ConnectOutcome::MfaRequired {
                    connection_id,
                    challenge,
                } => (connection_id, challenge),
            };

            host.progress(&HandshakeProgress::MfaPrompted);
            let answer = tokio::time::timeout(
                self.config.handshake.mfa_timeout,
                host.answer_mfa(&challenge.prompt),
            )
            .await
            .ok()
            .flatten();
            let Some(answer) = answer else {
                let _ = transport.disconnect(&connection_id).await;
                return Err(Error::Connect(format!(
                    "two-factor challenge for {} was not answered",
                    destination.key()
                )));
            };

            outcome = match transport.answer_mfa(&connection_id, &answer).await {
                Ok(next) => {
                    host.progress(&HandshakeProgress::MfaAccepted);
                    next
                }
                Err(e) => {
                    host.progress(&HandshakeProgress::MfaRejected);
                    let _ = transport.disconnect(&connection_id).await;
                    return Err(e);
                }
            };
        }
    }

    async fn open_shell(
        &self,
        destination: &Destination,
        transport: &Arc<dyn Transport>,
        connection_id: &ConnectionId,
    ) -> Result<ShellStream> {
        let stream = transport
            .open_shell(connection_id, self.config.dimensions)
            .await?;
        let Some(target) = &destination.bastion else {
            return Ok(stream);
        };

        let (writer, mut events) = stream.into_parts();
        if let Err(e) = run_handshake(
            writer.as_ref(),
            &mut events,
            target,
            &self.config.handshake,
            self.handshake_host.as_ref(),
        )
        .await
        {
            writer.close().await;
            return Err(e);
        }
        Ok(ShellStream::new(writer, events))
    }

    async fn release_connection(&self, key: &DestinationKey, kind: &TransportKind) {
        let released = self.pool.lock().await.release(key, kind);
        if let Some(connection) = released {
            debug!("Last session on {} gone, disconnecting", key);
            if let Err(e) = connection
                .transport
                .disconnect(&connection.connection_id)
                .await
            {
                warn!("Disconnecting {} failed: {}", connection.connection_id, e);
            }
        }
    }

    async fn discard_session(&self, session: &Arc<Session>) {
        session.close().await;
        let removed = self.sessions.write().await.remove(&session.id());
        if removed.is_some() {
            info!("Session {} removed after its stream closed", session.id());
            self.release_connection(session.destination(), session.transport_kind())
                .await;
        }
    }

    async fn execute(
        self: Arc<Self>,
        session: Arc<Session>,
        command_id: CommandId,
        command: String,
        options: RunOptions,
        events: mpsc::UnboundedSender<CommandEvent>,
        mut control: mpsc::UnboundedReceiver<RunnerControl>,
    ) -> Result<RunOutcome> {
        let mut stream_events = session.lock_events().await;
        session.set_status(SessionStatus::Busy);

        let mut config = self.config.runner.clone();
        if let Some(timeout) = options.timeout {
            config.command_timeout = timeout;
        }
        let writer = session.writer();
        let now = Instant::now();
        let lines = events.clone();
        let output = OutputGate::new(move |line| {
            let _ = lines.send(CommandEvent::Line(line));
        });

        // The route guard stops the watch task on every exit path.
        let (watch_inputs, route) = if options.watch {
            let detector = InteractionDetector::new(
                command_id,
                command.clone(),
                self.config.detector.clone(),
                Arc::clone(&self.rules),
                self.classifier.is_some(),
                now,
            );
            let (inputs, _task) = spawn_watch(
                detector,
                WatchContext {
                    writer: Arc::clone(&writer),
                    classifier: self.classifier.clone(),
                    host: self.host_events.clone(),
                    enter_sequence: config.enter_sequence.clone(),
                    drain_timeout: self.config.drain_timeout,
                    output: Some(output.clone()),
                },
            );
            let route = self.router.register(command_id, inputs.clone());
            self.watched.lock().await.insert(session.id(), command_id);
            (Some(inputs), Some(route))
        } else {
            (None, None)
        };

        let callbacks = command_callbacks(&events, output, watch_inputs);
        let result = match CommandExecution::new(
            command_id,
            &command,
            options.cwd.as_deref(),
            &config,
            callbacks,
            now,
        ) {
            Ok(mut execution) => {
                runner::run(
                    writer.as_ref(),
                    &mut stream_events,
                    &mut execution,
                    Some(&mut control),
                    &config,
                )
                .await
                .map_err(Error::from)
            }
            Err(e) => Err(e),
        };

        if route.is_some() {
            self.watched.lock().await.remove(&session.id());
        }
        drop(route);
        drop(stream_events);
        self.running.lock().await.remove(&command_id);

        match result {
            Ok(outcome) => {
                if outcome.reason == CompletionReason::StreamClosed {
                    self.discard_session(&session).await;
                } else {
                    session.set_status(SessionStatus::Ready);
                }
                Ok(outcome)
            }
            Err(Error::Transport(failure)) => {
                let _ = events.send(CommandEvent::Error(failure.clone()));
                if failure == TransportFailure::Closed {
                    self.discard_session(&session).await;
                } else {
                    session.set_status(SessionStatus::Ready);
                }
                Err(Error::Transport(failure))
            }
            Err(e) => {
                session.set_status(SessionStatus::Ready);
                Err(e)
            }
        }
    }
}

fn command_callbacks(
    events: &mpsc::UnboundedSender<CommandEvent>,
    output: OutputGate,
    watch_inputs: Option<mpsc::UnboundedSender<WatchInput>>,
) -> RunnerCallbacks {
    let lines = output.clone();
    let exit_output = output.clone();
    let codes = events.clone();
    let completed = events.clone();
    // Lines held for an unanswered prompt still precede the exit status.
    let mut callbacks = RunnerCallbacks::new()
        .on_line(move |line| lines.emit(line))
        .on_exit_code(move |code| {
            exit_output.release();
            let _ = codes.send(CommandEvent::ExitCode(code));
        })
        .on_completed(move |outcome| {
            output.release();
            let _ = completed.send(CommandEvent::Completed(outcome.clone()));
        });
    if let Some(inputs) = watch_inputs {
        callbacks = callbacks.on_chunk(move |chunk| {
            let _ = inputs.send(WatchInput::Chunk(chunk.clone()));
        });
    }
    callbacks
}
