//! Configuration types for rexec.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

use crate::{Dimensions, Error, InteractionType, LogFormat};

/// Top-level configuration loaded from a YAML file.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RexecConfig {
    /// Session manager settings
    pub session: SessionSettings,
    /// Marker runner settings
    pub runner: RunnerSettings,
    /// Interaction detector settings
    pub detector: DetectorSettings,
    /// Bastion handshake settings
    pub bastion: BastionSettings,
    /// Logging settings
    pub logging: LoggingSettings,
}

impl RexecConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let path = path.as_ref();
        debug!("Loading configuration from {}", path.display());
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML string.
    pub fn from_yaml(yaml: &str) -> crate::Result<Self> {
        let config: RexecConfig =
            serde_yaml::from_str(yaml).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> crate::Result<()> {
        let session = &self.session;
        require_nonzero("session.max_sessions", session.max_sessions as u64)?;
        require_nonzero("session.input_drain_timeout_ms", session.input_drain_timeout_ms)?;
        require_nonzero("session.max_output_lines", session.max_output_lines as u64)?;
        if !session.default_dimensions().is_valid() {
            return Err(Error::Config("session dimensions must be > 0".to_string()));
        }
        if session.enter_sequence.is_empty() {
            return Err(Error::Config(
                "session.enter_sequence cannot be empty".to_string(),
            ));
        }

        let runner = &self.runner;
        require_nonzero("runner.command_timeout_ms", runner.command_timeout_ms)?;
        require_nonzero("runner.half_line_delay_ms", runner.half_line_delay_ms)?;
        if runner.marker_prefix.trim().is_empty()
            || !runner
                .marker_prefix
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(Error::Config(
                "runner.marker_prefix must be non-empty [A-Za-z0-9_]".to_string(),
            ));
        }

        let detector = &self.detector;
        require_nonzero("detector.debounce_ms", detector.debounce_ms)?;
        require_nonzero("detector.initial_timeout_ms", detector.initial_timeout_ms)?;
        require_nonzero("detector.max_calls", detector.max_calls as u64)?;
        require_nonzero(
            "detector.max_hash_unchanged_count",
            detector.max_hash_unchanged_count as u64,
        )?;
        require_nonzero("detector.max_silent_timeout_ms", detector.max_silent_timeout_ms)?;
        require_nonzero("detector.hash_window_chars", detector.hash_window_chars as u64)?;
        require_nonzero("detector.tui_silence_ms", detector.tui_silence_ms)?;
        require_nonzero("detector.tui_backstop_ms", detector.tui_backstop_ms)?;
        require_nonzero("detector.output_buffer_chars", detector.output_buffer_chars as u64)?;
        require_nonzero("detector.line_buffer_lines", detector.line_buffer_lines as u64)?;
        if detector.max_timeout_ms < detector.initial_timeout_ms {
            return Err(Error::Config(
                "detector.max_timeout_ms must be >= detector.initial_timeout_ms".to_string(),
            ));
        }
        if detector.debounce_ms >= detector.tui_silence_ms {
            return Err(Error::Config(
                "detector.debounce_ms must be < detector.tui_silence_ms".to_string(),
            ));
        }
        for rule in &detector.custom_rules {
            rule.validate()?;
        }

        let bastion = &self.bastion;
        require_nonzero("bastion.connect_timeout_ms", bastion.connect_timeout_ms)?;
        require_nonzero("bastion.mfa_timeout_ms", bastion.mfa_timeout_ms)?;
        require_nonzero(
            "bastion.user_selection_timeout_ms",
            bastion.user_selection_timeout_ms,
        )?;

        self.logging.log_format()?;

        Ok(())
    }
}

fn require_nonzero(name: &str, value: u64) -> crate::Result<()> {
    if value == 0 {
        return Err(Error::Config(format!("{name} must be > 0")));
    }
    Ok(())
}

/// Session manager settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Maximum number of live logical sessions
    pub max_sessions: usize,
    /// How long `send_input` waits for a drain signal
    pub input_drain_timeout_ms: u64,
    /// Bytes appended when input asks for a newline
    pub enter_sequence: String,
    /// Default pseudo-terminal rows
    pub default_rows: u16,
    /// Default pseudo-terminal columns
    pub default_cols: u16,
    /// Lines kept in a command's accumulated output
    pub max_output_lines: usize,
}

impl SessionSettings {
    /// Default window size as `Dimensions`.
    pub fn default_dimensions(&self) -> Dimensions {
        Dimensions::new(self.default_rows, self.default_cols)
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            max_sessions: 10,
            input_drain_timeout_ms: 5000,
            enter_sequence: "\r".to_string(),
            default_rows: 24,
            default_cols: 80,
            max_output_lines: 100_000,
        }
    }
}

/// Marker runner settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerSettings {
    /// Hard limit before a command completes as timed out
    pub command_timeout_ms: u64,
    /// Delay before an unterminated fragment is released as a line
    pub half_line_delay_ms: u64,
    /// Login shell prefix; empty runs the command directly
    pub login_shell: String,
    /// Prefix of generated markers
    pub marker_prefix: String,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            command_timeout_ms: 300_000,
            half_line_delay_ms: 500,
            login_shell: "bash -l -c".to_string(),
            marker_prefix: "__REXEC".to_string(),
        }
    }
}

/// Interaction detector settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorSettings {
    /// Quiet period before a heuristic prompt fires
    pub debounce_ms: u64,
    /// First deep-check delay
    pub initial_timeout_ms: u64,
    /// Deep-check delay ceiling
    pub max_timeout_ms: u64,
    /// Deep checks allowed per command
    pub max_calls: u32,
    /// Unchanged-hash checks before the silence popup
    pub max_hash_unchanged_count: u32,
    /// Absolute silence before the silence popup
    pub max_silent_timeout_ms: u64,
    /// Trailing characters hashed per deep check
    pub hash_window_chars: usize,
    /// Alternate-screen silence before a TUI is cancelled
    pub tui_silence_ms: u64,
    /// Backstop for TUIs that never enter the alternate screen
    pub tui_backstop_ms: u64,
    /// Window after alternate-screen entry during which a pager may show up
    pub pager_observation_ms: u64,
    /// Raw output kept for hashing and classification
    pub output_buffer_chars: usize,
    /// Lines kept for rule matching
    pub line_buffer_lines: usize,
    /// Network retries before the service-unavailable popup
    pub classifier_max_retries: u32,
    /// Base delay between classifier retries
    pub classifier_retry_base_ms: u64,
    /// Deep-check delay once the user dismissed twice
    pub slow_poll_ms: u64,
    /// Locale passed to the classifier
    pub locale: String,
    /// Extra quick rules
    pub custom_rules: Vec<CustomRuleConfig>,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            debounce_ms: 300,
            initial_timeout_ms: 5000,
            max_timeout_ms: 60_000,
            max_calls: 20,
            max_hash_unchanged_count: 3,
            max_silent_timeout_ms: 30_000,
            hash_window_chars: 500,
            tui_silence_ms: 1500,
            tui_backstop_ms: 8000,
            pager_observation_ms: 400,
            output_buffer_chars: 8192,
            line_buffer_lines: 200,
            classifier_max_retries: 3,
            classifier_retry_base_ms: 2000,
            slow_poll_ms: 60_000,
            locale: "en".to_string(),
            custom_rules: vec![],
        }
    }
}

/// Site-specific quick rule, appended after the built-in table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomRuleConfig {
    /// Rule name (identifier)
    pub name: String,
    /// Regular expression matched against the last line
    pub pattern: String,
    /// Interaction raised on match
    pub interaction_type: InteractionType,
}

impl CustomRuleConfig {
    /// Validate the rule configuration.
    pub fn validate(&self) -> crate::Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Config("custom rule name cannot be empty".to_string()));
        }

        regex::Regex::new(&self.pattern).map_err(|e| {
            Error::Config(format!("Invalid regex pattern '{}': {}", self.name, e))
        })?;

        Ok(())
    }
}

/// Bastion handshake settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BastionSettings {
    /// Whole-handshake deadline
    pub connect_timeout_ms: u64,
    /// Pause before a password is typed
    pub password_delay_ms: u64,
    /// How long a two-factor answer is awaited
    pub mfa_timeout_ms: u64,
    /// How long an account choice is awaited
    pub user_selection_timeout_ms: u64,
}

impl Default for BastionSettings {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 35_000,
            password_delay_ms: 300,
            mfa_timeout_ms: 120_000,
            user_selection_timeout_ms: 120_000,
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Filter directive (trace, debug, info, warn, error, or an `EnvFilter` string)
    pub level: String,
    /// `text` or `json`
    pub format: String,
}

impl LoggingSettings {
    /// Parsed output format.
    pub fn log_format(&self) -> crate::Result<LogFormat> {
        self.format.parse()
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RexecConfig::default();
        assert_eq!(config.session.max_sessions, 10);
        assert_eq!(config.session.enter_sequence, "\r");
        assert_eq!(config.runner.command_timeout_ms, 300_000);
        assert_eq!(config.runner.half_line_delay_ms, 500);
        assert_eq!(config.detector.debounce_ms, 300);
        assert_eq!(config.detector.hash_window_chars, 500);
        assert_eq!(config.bastion.connect_timeout_ms, 35_000);
        assert_eq!(config.logging.log_format().unwrap(), LogFormat::Text);
    }

    #[test]
    fn test_config_validation() {
        let config = RexecConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_max_sessions() {
        let mut config = RexecConfig::default();
        config.session.max_sessions = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_backoff_bounds() {
        let mut config = RexecConfig::default();
        config.detector.max_timeout_ms = 1000;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max_timeout_ms"));
    }

    #[test]
    fn test_debounce_must_be_below_tui_silence() {
        let mut config = RexecConfig::default();
        config.detector.debounce_ms = 2000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_marker_prefix_must_be_shell_safe() {
        let mut config = RexecConfig::default();
        config.runner.marker_prefix = "__X'; rm".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_log_format() {
        let yaml = r#"
logging:
  format: xml
"#;
        assert!(RexecConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
session:
  max_sessions: 4
  enter_sequence: "\n"

runner:
  command_timeout_ms: 60000
  login_shell: ""

detector:
  debounce_ms: 150
  max_calls: 5
  locale: zh

bastion:
  connect_timeout_ms: 10000

logging:
  level: debug
  format: json
"#;

        let config = RexecConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.session.max_sessions, 4);
        assert_eq!(config.session.enter_sequence, "\n");
        assert_eq!(config.session.input_drain_timeout_ms, 5000);
        assert_eq!(config.runner.command_timeout_ms, 60_000);
        assert!(config.runner.login_shell.is_empty());
        assert_eq!(config.detector.debounce_ms, 150);
        assert_eq!(config.detector.max_calls, 5);
        assert_eq!(config.detector.locale, "zh");
        assert_eq!(config.detector.tui_silence_ms, 1500);
        assert_eq!(config.bastion.connect_timeout_ms, 10_000);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.log_format().unwrap(), LogFormat::Json);
    }

    #[test]
    fn test_custom_rules() {
        let yaml = r#"
detector:
  custom_rules:
    - name: "vault_unseal"
      pattern: "Unseal Key \\(will be hidden\\):\\s*$"
      interaction_type: password
"#;

        let config = RexecConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.detector.custom_rules.len(), 1);
        assert_eq!(config.detector.custom_rules[0].name, "vault_unseal");
        assert_eq!(
            config.detector.custom_rules[0].interaction_type,
            InteractionType::Password
        );
    }

    #[test]
    fn test_invalid_regex_pattern() {
        let yaml = r#"
detector:
  custom_rules:
    - name: "bad_pattern"
      pattern: "([unclosed"
      interaction_type: freeform
"#;

        let result = RexecConfig::from_yaml(yaml);
        assert!(result.is_err());
    }

    #[test]
    fn test_empty_rule_name() {
        let rule = CustomRuleConfig {
            name: "".to_string(),
            pattern: "test".to_string(),
            interaction_type: InteractionType::Enter,
        };
        assert!(rule.validate().is_err());
    }
}
