//! Interaction requests raised when a remote process waits for a human.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{CommandId, Key};

/// Upper bound on the prompt hint shown to the user.
pub const MAX_PROMPT_HINT_CHARS: usize = 200;

/// Kind of input the remote side is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum InteractionType {
    /// Yes/no style confirmation
    Confirm,
    /// Pick one of several options
    Select,
    /// Secret input, must not be echoed
    Password,
    /// A pager waiting for a keypress
    Pager,
    /// Just press Enter
    Enter,
    /// Arbitrary text
    Freeform,
}

/// Accept/reject tokens for a confirmation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ConfirmValues {
    /// Token that accepts
    pub yes: String,
    /// Token that rejects
    pub no: String,
    /// Token chosen on a bare Enter, when the prompt advertises one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

impl ConfirmValues {
    /// Build confirm values.
    pub fn new(yes: impl Into<String>, no: impl Into<String>, default: Option<&str>) -> Self {
        Self {
            yes: yes.into(),
            no: no.into(),
            default: default.map(str::to_string),
        }
    }
}

/// Key sequence that leaves the waiting program.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitKey {
    /// Key name (`q`, `Ctrl+C`) or literal text (`exit`)
    pub key: String,
    /// Whether Enter must follow the key
    pub needs_newline: bool,
}

impl ExitKey {
    /// Build an exit key.
    pub fn new(key: impl Into<String>, needs_newline: bool) -> Self {
        Self {
            key: key.into(),
            needs_newline,
        }
    }

    /// Bytes to write: a parsed key's escape sequence, else the literal text.
    pub fn to_bytes(&self, enter_sequence: &str) -> Vec<u8> {
        let mut bytes = match Key::parse(&self.key) {
            Ok(key) => key.to_escape_sequence(),
            Err(_) => self.key.as_bytes().to_vec(),
        };
        if self.needs_newline {
            bytes.extend_from_slice(enter_sequence.as_bytes());
        }
        bytes
    }
}

/// Why an interaction was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionReason {
    /// A quick pattern rule matched
    QuickRule,
    /// Generic colon/question-mark prompt survived the debounce window
    PromptHeuristic,
    /// A pager status line was seen
    Pager,
    /// A full-screen program was detected
    Tui,
    /// Output stopped changing for too long
    Silence,
    /// The language-model classifier said input is needed
    Classifier,
    /// The classifier answered with something unusable
    ClassifierDegraded,
    /// The classifier kept failing with network errors
    ServiceUnavailable,
}

/// Request for human input on behalf of one command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InteractionRequest {
    /// Command waiting for input
    pub command_id: CommandId,
    /// Kind of input expected
    pub interaction_type: InteractionType,
    /// Text shown to the user, at most `MAX_PROMPT_HINT_CHARS` characters
    pub prompt_hint: String,
    /// Choices for `Select`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
    /// Tokens for `Confirm`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirm_values: Option<ConfirmValues>,
    /// How to leave the program instead of answering
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_key: Option<ExitKey>,
    /// What raised this request
    pub reason: InteractionReason,
}

impl InteractionRequest {
    /// Create a request, clamping the hint to `MAX_PROMPT_HINT_CHARS`.
    pub fn new(
        command_id: CommandId,
        interaction_type: InteractionType,
        prompt_hint: &str,
        reason: InteractionReason,
    ) -> Self {
        Self {
            command_id,
            interaction_type,
            prompt_hint: clamp_hint(prompt_hint),
            options: Vec::new(),
            confirm_values: None,
            exit_key: None,
            reason,
        }
    }

    /// Attach selectable options.
    pub fn with_options(mut self, options: Vec<String>) -> Self {
        self.options = options;
        self
    }

    /// Attach confirmation tokens.
    pub fn with_confirm_values(mut self, values: ConfirmValues) -> Self {
        self.confirm_values = Some(values);
        self
    }

    /// Attach an exit key.
    pub fn with_exit_key(mut self, exit_key: Option<ExitKey>) -> Self {
        self.exit_key = exit_key;
        self
    }
}

/// Keep the trailing `MAX_PROMPT_HINT_CHARS` characters; the end of the output
/// is where the prompt is.
fn clamp_hint(hint: &str) -> String {
    let hint = hint.trim();
    let count = hint.chars().count();
    if count <= MAX_PROMPT_HINT_CHARS {
        return hint.to_string();
    }
    hint.chars().skip(count - MAX_PROMPT_HINT_CHARS).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_hint_is_clamped_from_the_end() {
        let long = format!("{}Password:", "x".repeat(400));
        let request = InteractionRequest::new(
            CommandId::new(),
            InteractionType::Password,
            &long,
            InteractionReason::QuickRule,
        );
        assert_eq!(request.prompt_hint.chars().count(), MAX_PROMPT_HINT_CHARS);
        assert!(request.prompt_hint.ends_with("Password:"));
    }

    #[test]
    fn test_prompt_hint_multibyte() {
        let long = "密".repeat(250);
        let request = InteractionRequest::new(
            CommandId::new(),
            InteractionType::Freeform,
            &long,
            InteractionReason::Silence,
        );
        assert_eq!(request.prompt_hint.chars().count(), MAX_PROMPT_HINT_CHARS);
    }

    #[test]
    fn test_interaction_type_serialization() {
        let json = serde_json::to_string(&InteractionType::Freeform).unwrap();
        assert_eq!(json, "\"freeform\"");
        let parsed: InteractionType = serde_json::from_str("\"pager\"").unwrap();
        assert_eq!(parsed, InteractionType::Pager);
        assert!(serde_json::from_str::<InteractionType>("\"modal\"").is_err());
    }

    #[test]
    fn test_exit_key_bytes() {
        assert_eq!(ExitKey::new("q", false).to_bytes("\r"), b"q");
        assert_eq!(ExitKey::new("Ctrl+C", false).to_bytes("\r"), vec![0x03]);
        assert_eq!(ExitKey::new("exit", true).to_bytes("\r"), b"exit\r");
        assert_eq!(ExitKey::new(":q!", true).to_bytes("\n"), b":q!\n");
    }

    #[test]
    fn test_request_builders() {
        let request = InteractionRequest::new(
            CommandId::new(),
            InteractionType::Confirm,
            "Do you want to continue? [Y/n]",
            InteractionReason::QuickRule,
        )
        .with_confirm_values(ConfirmValues::new("Y", "n", Some("Y")));

        let values = request.confirm_values.unwrap();
        assert_eq!(values.yes, "Y");
        assert_eq!(values.no, "n");
        assert_eq!(values.default.as_deref(), Some("Y"));
    }
}
