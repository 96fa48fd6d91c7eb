//! JumpServer-style bastion menu navigation.
//!
//! After the SSH login to the bastion, its text menu must be driven to the
//! target host before the shell can run commands:
//!
//! ```text
//! connecting --Opt>--> input_ip --password:--> input_password --$--> connected
//!                         |  \--ID>--> select_user --answer--> (as input_ip)
//!                         \--no assets--> failed
//! ```
//!
//! [`BastionHandshake`] is the sans-IO state machine; [`run_handshake`]
//! drives it over a shell stream and asks a [`HandshakeHost`] for the
//! human steps (account choice and one-time codes).

use std::time::Duration;

use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use rexec_core::{BastionSettings, BastionTarget, Error, Result, RexecConfig};
use rexec_stream::{write_with_drain, AnsiFilter, StreamEvent, StreamWriter};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

lazy_static! {
    static ref MENU: Pattern = Pattern::new("menu", r"Opt>\s*$");
    static ref NO_ASSETS: Pattern = Pattern::new(
        "no_assets",
        r"(?i)(no\s+assets?|asset\s+not\s+found|没有(找到)?(任何)?资产|无资产|未找到资产)",
    );
    static ref ACCOUNT_PROMPT: Pattern = Pattern::new("account_prompt", r"(?m)^\s*ID>\s*$");
    static ref ACCOUNT_HEADER: Pattern =
        Pattern::new("account_header", r"(?i)\bID\s*\|\s*Name\s*\|\s*Username\b");
    static ref PASSWORD: Pattern =
        Pattern::new("password", r"(?i)(password|密码)[^:：\n]{0,40}[:：]\s*$");
    static ref AUTH_FAILURE: Pattern = Pattern::new(
        "auth_failure",
        r"(?i)(permission denied|authentication failed|auth failed|incorrect password|wrong password|access denied|密码错误|认证失败)",
    );
    static ref MFA: Pattern = Pattern::new(
        "mfa",
        r"(?i)(otp|mfa|verification code|one[- ]time|验证码|动态码)[^:：\n]{0,40}[:：]\s*$",
    );
    static ref SHELL_PROMPT: Pattern = Pattern::new("shell_prompt", r"[\$#%]\s*$");
    static ref LAST_LOGIN: Pattern = Pattern::new("last_login", r"(?i)last login:");
}

/// A built-in bastion pattern; one that fails to compile never matches.
struct Pattern(Option<Regex>);

impl Pattern {
    fn new(name: &str, pattern: &str) -> Self {
        match Regex::new(pattern) {
            Ok(regex) => Self(Some(regex)),
            Err(e) => {
                error!("Bastion pattern '{}' failed to compile: {}", name, e);
                Self(None)
            }
        }
    }

    fn is_match(&self, text: &str) -> bool {
        self.0.as_ref().is_some_and(|regex| regex.is_match(text))
    }

    #[cfg(test)]
    fn is_compiled(&self) -> bool {
        self.0.is_some()
    }
}

// Accumulated handshake output kept for matching.
const MAX_BUFFER_BYTES: usize = 16 * 1024;

/// Runtime handshake configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeConfig {
    /// Whole-handshake deadline
    pub connect_timeout: Duration,
    /// Pause before a password is typed
    pub password_delay: Duration,
    /// How long a one-time code is awaited
    pub mfa_timeout: Duration,
    /// How long an account choice is awaited
    pub user_selection_timeout: Duration,
    /// Bound on waiting for a buffered write to drain
    pub drain_timeout: Duration,
}

impl From<&BastionSettings> for HandshakeConfig {
    fn from(s: &BastionSettings) -> Self {
        Self {
            connect_timeout: Duration::from_millis(s.connect_timeout_ms),
            password_delay: Duration::from_millis(s.password_delay_ms),
            mfa_timeout: Duration::from_millis(s.mfa_timeout_ms),
            user_selection_timeout: Duration::from_millis(s.user_selection_timeout_ms),
            drain_timeout: Duration::from_secs(5),
        }
    }
}

impl From<&RexecConfig> for HandshakeConfig {
    fn from(config: &RexecConfig) -> Self {
        Self {
            drain_timeout: Duration::from_millis(config.session.input_drain_timeout_ms),
            ..Self::from(&config.bastion)
        }
    }
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self::from(&RexecConfig::default())
    }
}

/// Handshake phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandshakePhase {
    /// Waiting for the bastion menu
    Connecting,
    /// Target host sent
    InputIp,
    /// Choosing an account on the target
    SelectUser,
    /// Target password requested
    InputPassword,
    /// Shell on the target reached
    Connected,
    /// Gave up
    Failed,
}

/// Account offered by the bastion for the target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountOption {
    /// Id typed at the `ID>` prompt
    pub id: String,
    /// Display name
    pub name: String,
    /// Login user
    pub username: String,
}

/// Progress notification for the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HandshakeProgress {
    /// Phase transition
    PhaseChanged {
        /// Previous phase
        from: HandshakePhase,
        /// New phase
        to: HandshakePhase,
    },
    /// A one-time code was requested
    MfaPrompted,
    /// The code was accepted
    MfaAccepted,
    /// The code was rejected
    MfaRejected,
}

/// Bytes to type into the bastion.
#[derive(Clone, PartialEq, Eq)]
pub struct HandshakeWrite {
    /// Raw bytes
    pub data: Vec<u8>,
    /// Whether the bytes are a secret and must not be logged
    pub secret: bool,
}

impl std::fmt::Debug for HandshakeWrite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.secret {
            f.write_str("HandshakeWrite(<redacted>)")
        } else {
            write!(f, "HandshakeWrite({:?})", String::from_utf8_lossy(&self.data))
        }
    }
}

/// What the driver must do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeAction {
    /// Type into the stream
    Write(HandshakeWrite),
    /// Tell the host
    Progress(HandshakeProgress),
    /// Ask the host to choose an account, then call `select_account`
    SelectAccount(Vec<AccountOption>),
    /// Ask the host for a one-time code, then call `answer_mfa`
    MfaPrompt(String),
    /// The target shell is reachable
    Connected,
    /// The attempt failed
    Failed(String),
    /// No phase reached `Connected` in time
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Awaiting {
    Nothing,
    Account,
    Mfa,
}

/// Sans-IO bastion menu state machine.
#[derive(Debug)]
pub struct BastionHandshake {
    target: BastionTarget,
    config: HandshakeConfig,
    phase: HandshakePhase,
    buffer: String,
    awaiting: Awaiting,
    accounts: Vec<AccountOption>,
    pending_write: Option<(Instant, HandshakeWrite)>,
    password_sent: bool,
    mfa_answered: bool,
    timeout_at: Instant,
}

impl BastionHandshake {
    /// Start a handshake towards `target`.
    pub fn new(target: BastionTarget, config: HandshakeConfig, now: Instant) -> Self {
        let timeout_at = now + config.connect_timeout;
        Self {
            target,
            config,
            phase: HandshakePhase::Connecting,
            buffer: String::new(),
            awaiting: Awaiting::Nothing,
            accounts: Vec::new(),
            pending_write: None,
            password_sent: false,
            mfa_answered: false,
            timeout_at,
        }
    }

    /// Current phase.
    pub fn phase(&self) -> HandshakePhase {
        self.phase
    }

    /// Whether the handshake reached a terminal phase.
    pub fn is_finished(&self) -> bool {
        matches!(self.phase, HandshakePhase::Connected | HandshakePhase::Failed)
    }

    /// Accounts offered at the last `ID>` prompt.
    pub fn accounts(&self) -> &[AccountOption] {
        &self.accounts
    }

    /// Deadline of the whole handshake, fixed when it starts.
    pub fn deadline(&self) -> Instant {
        self.timeout_at
    }

    /// Next timer; only the overall deadline while the host is being asked.
    pub fn next_deadline(&self) -> Option<Instant> {
        if self.is_finished() {
            return None;
        }
        Some(match &self.pending_write {
            Some((at, _)) if self.awaiting == Awaiting::Nothing => (*at).min(self.timeout_at),
            _ => self.timeout_at,
        })
    }

    /// Consume ANSI-free output from the bastion.
    pub fn feed(&mut self, text: &str, now: Instant) -> Vec<HandshakeAction> {
        let mut actions = Vec::new();
        if self.is_finished() {
            return actions;
        }
        self.buffer.push_str(text);
        if self.buffer.len() > MAX_BUFFER_BYTES {
            let mut cut = self.buffer.len() - MAX_BUFFER_BYTES;
            while !self.buffer.is_char_boundary(cut) {
                cut += 1;
            }
            self.buffer.drain(..cut);
        }
        if self.awaiting == Awaiting::Nothing {
            self.evaluate(now, &mut actions);
        }
        actions
    }

    /// Fire expired timers.
    pub fn poll(&mut self, now: Instant) -> Vec<HandshakeAction> {
        let mut actions = Vec::new();
        if self.is_finished() {
            return actions;
        }
        if now >= self.timeout_at {
            warn!(
                "Bastion handshake to {} timed out in phase {:?}",
                self.target.target_host, self.phase
            );
            self.phase = HandshakePhase::Failed;
            self.awaiting = Awaiting::Nothing;
            self.pending_write = None;
            actions.push(HandshakeAction::TimedOut);
            return actions;
        }
        if self.awaiting != Awaiting::Nothing {
            return actions;
        }
        if self.pending_write.as_ref().is_some_and(|(at, _)| *at <= now) {
            if let Some((_, write)) = self.pending_write.take() {
                debug!("Typing target password");
                self.password_sent = true;
                self.buffer.clear();
                actions.push(HandshakeAction::Write(write));
            }
        }
        actions
    }

    /// The host chose `account_id`.
    pub fn select_account(&mut self, account_id: &str, now: Instant) -> Vec<HandshakeAction> {
        let mut actions = self.poll(now);
        if self.phase != HandshakePhase::SelectUser || self.awaiting != Awaiting::Account {
            return actions;
        }
        self.awaiting = Awaiting::Nothing;
        self.answer_account(account_id, &mut actions);
        actions
    }

    /// The host answered the one-time code prompt.
    pub fn answer_mfa(&mut self, response: &str, now: Instant) -> Vec<HandshakeAction> {
        let mut actions = self.poll(now);
        if self.is_finished() || self.awaiting != Awaiting::Mfa {
            return actions;
        }
        self.awaiting = Awaiting::Nothing;
        self.mfa_answered = true;
        self.buffer.clear();
        actions.push(HandshakeAction::Write(HandshakeWrite {
            data: format!("{response}\r").into_bytes(),
            secret: true,
        }));
        actions
    }

    /// Give up, for instance when the host did not answer.
    pub fn abandon(&mut self, reason: &str) -> Vec<HandshakeAction> {
        if self.is_finished() {
            return Vec::new();
        }
        self.awaiting = Awaiting::Nothing;
        let mut actions = Vec::new();
        self.fail(reason.to_string(), &mut actions);
        actions
    }

    fn evaluate(&mut self, now: Instant, actions: &mut Vec<HandshakeAction>) {
        match self.phase {
            HandshakePhase::Connecting => self.on_connecting(actions),
            HandshakePhase::InputIp | HandshakePhase::SelectUser => {
                self.after_selection(now, actions)
            }
            HandshakePhase::InputPassword => self.on_password(actions),
            HandshakePhase::Connected | HandshakePhase::Failed => {}
        }
    }

    fn on_connecting(&mut self, actions: &mut Vec<HandshakeAction>) {
        if self.mfa_answered && AUTH_FAILURE.is_match(&self.buffer) {
            actions.push(HandshakeAction::Progress(HandshakeProgress::MfaRejected));
            self.fail("bastion rejected the one-time code".to_string(), actions);
            return;
        }
        if MFA.is_match(&self.buffer) {
            if self.mfa_answered {
                actions.push(HandshakeAction::Progress(HandshakeProgress::MfaRejected));
            }
            let prompt = last_line(&self.buffer).to_string();
            self.awaiting = Awaiting::Mfa;
            self.buffer.clear();
            actions.push(HandshakeAction::Progress(HandshakeProgress::MfaPrompted));
            actions.push(HandshakeAction::MfaPrompt(prompt));
            return;
        }
        if MENU.is_match(&self.buffer) {
            if self.mfa_answered {
                self.mfa_answered = false;
                actions.push(HandshakeAction::Progress(HandshakeProgress::MfaAccepted));
            }
            info!("Bastion menu reached, selecting {}", self.target.target_host);
            actions.push(HandshakeAction::Write(HandshakeWrite {
                data: format!("{}\r", self.target.target_host).into_bytes(),
                secret: false,
            }));
            self.transition(HandshakePhase::InputIp, actions);
        }
    }

    fn after_selection(&mut self, now: Instant, actions: &mut Vec<HandshakeAction>) {
        if NO_ASSETS.is_match(&self.buffer) {
            self.fail(format!("no assets match {}", self.target.target_host), actions);
        } else if AUTH_FAILURE.is_match(&self.buffer) {
            self.fail(format!("authentication to {} failed", self.target.target_host), actions);
        } else if self.phase == HandshakePhase::InputIp
            && (ACCOUNT_PROMPT.is_match(&self.buffer) || ACCOUNT_HEADER.is_match(&self.buffer))
        {
            // Wait for the prompt itself before answering.
            if !ACCOUNT_PROMPT.is_match(&self.buffer) {
                return;
            }
            self.accounts = parse_accounts(&self.buffer);
            self.transition(HandshakePhase::SelectUser, actions);
            self.choose_account(actions);
        } else if PASSWORD.is_match(&self.buffer) {
            self.transition(HandshakePhase::InputPassword, actions);
            match self.target.target_password.clone() {
                Some(password) => {
                    let at = now + self.config.password_delay;
                    self.pending_write = Some((
                        at,
                        HandshakeWrite {
                            data: format!("{password}\r").into_bytes(),
                            secret: true,
                        },
                    ));
                }
                None => self.fail(
                    format!("{} asks for a password but none is configured", self.target.target_host),
                    actions,
                ),
            }
        } else if is_shell_ready(&self.buffer) {
            self.connected(actions);
        } else if self.phase == HandshakePhase::InputIp && MENU.is_match(&self.buffer) {
            self.fail(
                format!("{} does not match exactly one asset", self.target.target_host),
                actions,
            );
        }
    }

    fn on_password(&mut self, actions: &mut Vec<HandshakeAction>) {
        if !self.password_sent {
            return;
        }
        if AUTH_FAILURE.is_match(&self.buffer) || PASSWORD.is_match(&self.buffer) {
            self.fail(format!("password for {} was rejected", self.target.target_host), actions);
        } else if is_shell_ready(&self.buffer) {
            self.connected(actions);
        }
    }

    fn choose_account(&mut self, actions: &mut Vec<HandshakeAction>) {
        if self.accounts.is_empty() {
            self.fail("bastion offered no accounts".to_string(), actions);
            return;
        }
        let Some(wanted) = self.target.account.clone() else {
            self.awaiting = Awaiting::Account;
            actions.push(HandshakeAction::SelectAccount(self.accounts.clone()));
            return;
        };
        let chosen = self
            .accounts
            .iter()
            .find(|a| a.id == wanted || a.username == wanted || a.name == wanted)
            .map(|a| a.id.clone());
        match chosen {
            Some(id) => self.answer_account(&id, actions),
            None => self.fail(format!("account {wanted} is not offered"), actions),
        }
    }

    fn answer_account(&mut self, account_id: &str, actions: &mut Vec<HandshakeAction>) {
        debug!("Selecting account {}", account_id);
        self.buffer.clear();
        actions.push(HandshakeAction::Write(HandshakeWrite {
            data: format!("{account_id}\r").into_bytes(),
            secret: false,
        }));
    }

    fn transition(&mut self, to: HandshakePhase, actions: &mut Vec<HandshakeAction>) {
        let from = self.phase;
        if from == to {
            return;
        }
        info!("Bastion handshake: {:?} -> {:?}", from, to);
        self.phase = to;
        self.buffer.clear();
        actions.push(HandshakeAction::Progress(HandshakeProgress::PhaseChanged { from, to }));
    }

    fn connected(&mut self, actions: &mut Vec<HandshakeAction>) {
        self.transition(HandshakePhase::Connected, actions);
        self.pending_write = None;
        actions.push(HandshakeAction::Connected);
    }

    fn fail(&mut self, reason: String, actions: &mut Vec<HandshakeAction>) {
        warn!("Bastion handshake failed: {}", reason);
        self.transition(HandshakePhase::Failed, actions);
        self.pending_write = None;
        actions.push(HandshakeAction::Failed(reason));
    }
}

fn last_line(text: &str) -> &str {
    text.lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .map(str::trim)
        .unwrap_or("")
}

fn is_shell_ready(buffer: &str) -> bool {
    let line = last_line(buffer);
    !MENU.is_match(line) && (SHELL_PROMPT.is_match(line) || LAST_LOGIN.is_match(buffer))
}

/// Parse a `ID | Name | Username` table.
pub fn parse_accounts(text: &str) -> Vec<AccountOption> {
    text.lines()
        .filter_map(|line| {
            let cols: Vec<&str> = line.split('|').map(str::trim).collect();
            if cols.len() < 3 {
                return None;
            }
            let id = cols[0];
            let valid = !id.is_empty()
                && !id.eq_ignore_ascii_case("id")
                && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
                && !id.chars().all(|c| c == '-');
            valid.then(|| AccountOption {
                id: id.to_string(),
                name: cols[1].to_string(),
                username: cols[2].to_string(),
            })
        })
        .collect()
}

/// Human steps of the handshake.
///
/// Every method has a default that declines, so a host only implements
/// what it can show.
#[async_trait]
pub trait HandshakeHost: Send + Sync {
    /// Choose an account id for `target_host`.
    async fn select_account(&self, _target_host: &str, _accounts: &[AccountOption]) -> Option<String> {
        None
    }

    /// Answer a one-time code prompt.
    async fn answer_mfa(&self, _prompt: &str) -> Option<String> {
        None
    }

    /// Observe progress.
    fn progress(&self, _progress: &HandshakeProgress) {}
}

/// Host that declines every question.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHandshakeHost;

impl HandshakeHost for NoHandshakeHost {}

/// Navigate the bastion menu on an open shell.
pub async fn run_handshake(
    writer: &dyn StreamWriter,
    events: &mut mpsc::UnboundedReceiver<StreamEvent>,
    target: &BastionTarget,
    config: &HandshakeConfig,
    host: &dyn HandshakeHost,
) -> Result<()> {
    let mut handshake = BastionHandshake::new(target.clone(), config.clone(), Instant::now());
    let mut filter = AnsiFilter::new();
    let mut queue = std::collections::VecDeque::new();

    loop {
        while let Some(action) = queue.pop_front() {
            match action {
                HandshakeAction::Write(write) => {
                    write_with_drain(writer, &write.data, config.drain_timeout).await?;
                }
                HandshakeAction::Progress(progress) => host.progress(&progress),
                HandshakeAction::SelectAccount(accounts) => {
                    let until =
                        (Instant::now() + config.user_selection_timeout).min(handshake.deadline());
                    let choice = tokio::time::timeout_at(
                        until,
                        host.select_account(&target.target_host, &accounts),
                    )
                    .await
                    .ok()
                    .flatten();
                    let now = Instant::now();
                    queue.extend(match choice {
                        Some(id) => handshake.select_account(&id, now),
                        None if now >= handshake.deadline() => handshake.poll(now),
                        None => handshake.abandon("no account was selected"),
                    });
                }
                HandshakeAction::MfaPrompt(prompt) => {
                    let until = (Instant::now() + config.mfa_timeout).min(handshake.deadline());
                    let answer = tokio::time::timeout_at(until, host.answer_mfa(&prompt))
                        .await
                        .ok()
                        .flatten();
                    let now = Instant::now();
                    queue.extend(match answer {
                        Some(code) => handshake.answer_mfa(&code, now),
                        None if now >= handshake.deadline() => handshake.poll(now),
                        None => handshake.abandon("one-time code was not provided"),
                    });
                }
                HandshakeAction::Connected => {
                    info!("Reached {} through the bastion", target.target_host);
                    return Ok(());
                }
                HandshakeAction::Failed(reason) => return Err(Error::HandshakeFailed(reason)),
                HandshakeAction::TimedOut => {
                    return Err(Error::HandshakeTimeout(config.connect_timeout.as_millis() as u64))
                }
            }
        }

        let deadline = handshake.next_deadline().unwrap_or_else(|| handshake.deadline());
        tokio::select! {
            event = events.recv() => match event {
                Some(StreamEvent::Data(bytes)) => {
                    let chunk = filter.filter(&bytes);
                    queue.extend(handshake.feed(&chunk.text, Instant::now()));
                }
                Some(StreamEvent::Error(message)) => {
                    return Err(Error::HandshakeFailed(format!("stream error: {message}")));
                }
                Some(StreamEvent::Closed) | None => {
                    return Err(Error::HandshakeFailed("stream closed during handshake".to_string()));
                }
            },
            _ = tokio::time::sleep_until(deadline) => {
                queue.extend(handshake.poll(Instant::now()));
            }
        }
    }
}
