//! Optional language-model fallback for ambiguous output.
//!
//! The detector never calls a model itself. It emits a [`ClassifyRequest`],
//! the host forwards it to whatever [`InteractionClassifier`] it has, and the
//! raw JSON answer comes back to the detector, which treats it as untrusted:
//! it is parsed against [`ClassifierVerdict`] with unknown fields rejected and
//! every string and list length checked.

use async_trait::async_trait;
use rexec_core::{CommandId, ConfirmValues, ExitKey, InteractionType, MAX_PROMPT_HINT_CHARS};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Most options a verdict may carry.
pub const MAX_VERDICT_OPTIONS: usize = 20;
/// Longest option a verdict may carry.
pub const MAX_OPTION_CHARS: usize = 100;
/// Longest exit key a verdict may carry.
pub const MAX_EXIT_KEY_CHARS: usize = 16;

/// What the classifier is asked about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassifyRequest {
    /// Command being watched
    pub command_id: CommandId,
    /// Command text as submitted
    pub command: String,
    /// Bounded tail of the ANSI-stripped output
    pub recent_output: String,
    /// Locale for the prompt hint
    pub locale: String,
    /// Zero for the first call, incremented on every retry
    pub attempt: u32,
}

/// Classifier failure.
#[derive(Debug, Error)]
pub enum ClassifierError {
    /// The call did not complete; retried with backoff
    #[error("classifier unreachable: {0}")]
    Network(#[from] anyhow::Error),

    /// The answer was not the expected JSON shape
    #[error("unparseable classifier response: {0}")]
    Parse(String),

    /// The answer parsed but broke a bound
    #[error("invalid classifier response: {0}")]
    Invalid(String),
}

impl ClassifierError {
    /// Whether the detector should try again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ClassifierError::Network(_))
    }
}

/// External collaborator that classifies output.
///
/// Implementations return the model's raw structured answer. Hosts without
/// a model simply never install one; the detector then relies on rules and
/// silence detection alone.
#[async_trait]
pub trait InteractionClassifier: Send + Sync {
    /// Classify the output of one command.
    async fn classify(
        &self,
        request: ClassifyRequest,
    ) -> Result<serde_json::Value, ClassifierError>;
}

/// Exit key suggested by the classifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct VerdictExitKey {
    /// Key name or literal text
    #[schemars(length(min = 1, max = 16))]
    pub key: String,
    /// Whether Enter must follow
    #[serde(default)]
    pub needs_newline: bool,
}

/// Structured classifier answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct ClassifierVerdict {
    /// Whether the program is waiting for input
    pub needs_interaction: bool,
    /// Kind of input expected
    #[serde(default)]
    pub interaction_type: Option<InteractionType>,
    /// Short explanation shown to the user
    #[serde(default)]
    #[schemars(length(max = 200))]
    pub prompt_hint: Option<String>,
    /// Choices for a selection
    #[serde(default)]
    #[schemars(length(max = 20))]
    pub options: Vec<String>,
    /// Tokens for a confirmation
    #[serde(default)]
    pub confirm_values: Option<ConfirmValues>,
    /// How to leave the program
    #[serde(default)]
    pub exit_key: Option<VerdictExitKey>,
}

impl ClassifierVerdict {
    /// Parse and validate a raw answer.
    pub fn from_value(value: serde_json::Value) -> Result<Self, ClassifierError> {
        let verdict: Self =
            serde_json::from_value(value).map_err(|e| ClassifierError::Parse(e.to_string()))?;
        verdict.validate()?;
        Ok(verdict)
    }

    /// Check the bounds the schema advertises.
    pub fn validate(&self) -> Result<(), ClassifierError> {
        if let Some(hint) = &self.prompt_hint {
            if hint.chars().count() > MAX_PROMPT_HINT_CHARS {
                return Err(ClassifierError::Invalid(format!(
                    "promptHint longer than {MAX_PROMPT_HINT_CHARS} characters"
                )));
            }
        }

        if self.options.len() > MAX_VERDICT_OPTIONS {
            return Err(ClassifierError::Invalid(format!(
                "more than {MAX_VERDICT_OPTIONS} options"
            )));
        }
        if let Some(option) = self
            .options
            .iter()
            .find(|o| o.is_empty() || o.chars().count() > MAX_OPTION_CHARS)
        {
            return Err(ClassifierError::Invalid(format!(
                "option {option:?} is empty or too long"
            )));
        }

        if let Some(values) = &self.confirm_values {
            if values.yes.is_empty() || values.no.is_empty() {
                return Err(ClassifierError::Invalid(
                    "confirmValues needs both tokens".to_string(),
                ));
            }
        }

        if let Some(exit) = &self.exit_key {
            let len = exit.key.chars().count();
            if len == 0 || len > MAX_EXIT_KEY_CHARS {
                return Err(ClassifierError::Invalid(format!(
                    "exitKey must be 1-{MAX_EXIT_KEY_CHARS} characters"
                )));
            }
        }

        if self.needs_interaction
            && self.interaction_type == Some(InteractionType::Select)
            && self.options.is_empty()
        {
            return Err(ClassifierError::Invalid(
                "select verdict without options".to_string(),
            ));
        }

        Ok(())
    }

    /// Suggested exit key in the shared representation.
    pub fn exit_key(&self) -> Option<ExitKey> {
        self.exit_key
            .as_ref()
            .map(|k| ExitKey::new(k.key.clone(), k.needs_newline))
    }

    /// JSON schema handed to the model caller.
    pub fn json_schema() -> schemars::Schema {
        schemars::schema_for!(ClassifierVerdict)
    }
}
