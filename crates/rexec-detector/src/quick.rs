//! Stateless matching against the rule tables.

use rexec_core::{ConfirmValues, ExitKey, InteractionType};

use crate::rules::{builtin_rules, RuleSet};

/// Longest line the generic prompt heuristic accepts.
pub const MAX_PROMPT_LINE_CHARS: usize = 150;

/// Result of a quick-rule match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuickMatch {
    /// Name of the rule that matched
    pub rule: String,
    /// Interaction to raise
    pub interaction_type: InteractionType,
    /// Accept/reject tokens for confirmations
    pub confirm_values: Option<ConfirmValues>,
    /// Numbered options for selections
    pub options: Vec<String>,
    /// The line that matched
    pub line: String,
}

/// Last line of `text`, ignoring trailing line breaks.
pub fn last_line(text: &str) -> &str {
    let trimmed = text.trim_end_matches(['\r', '\n']);
    let line = trimmed.rsplit('\n').next().unwrap_or(trimmed);
    line.rsplit('\r').next().unwrap_or(line)
}

/// Quick-match `text` against the built-in tables.
pub fn try_quick_match(text: &str) -> Option<QuickMatch> {
    builtin_rules().try_quick_match(text)
}

impl RuleSet {
    /// Match the last line of `text` against the quick rules, then the
    /// numbered-selection rule. Earlier lines are only used for options.
    pub fn try_quick_match(&self, text: &str) -> Option<QuickMatch> {
        let line = last_line(text);
        if line.trim().is_empty() {
            return None;
        }

        if let Some(rule) = self.quick.iter().find(|rule| rule.pattern.is_match(line)) {
            return Some(QuickMatch {
                rule: rule.name.clone(),
                interaction_type: rule.interaction_type,
                confirm_values: rule.confirm.map(|spec| spec.values()),
                options: Vec::new(),
                line: line.to_string(),
            });
        }

        let select_prompt = self.select_prompt.as_ref()?;
        if select_prompt.is_match(line) {
            let options = self.parse_select_options(text);
            if options.len() >= 2 {
                return Some(QuickMatch {
                    rule: "select_prompt".to_string(),
                    interaction_type: InteractionType::Select,
                    confirm_values: None,
                    options,
                    line: line.to_string(),
                });
            }
        }

        None
    }

    /// Contiguous numbered option lines directly above the last line.
    pub fn parse_select_options(&self, text: &str) -> Vec<String> {
        let Some(option_rx) = self.select_option.as_ref() else {
            return Vec::new();
        };

        let trimmed = text.trim_end_matches(['\r', '\n']);
        let mut lines: Vec<&str> = trimmed.split('\n').map(|l| l.trim_end_matches('\r')).collect();
        lines.pop(); // the prompt itself

        let mut options = Vec::new();
        for line in lines.iter().rev() {
            if line.trim().is_empty() && options.is_empty() {
                continue;
            }
            match option_rx.captures(line) {
                Some(caps) => options.push(caps[2].to_string()),
                None => break,
            }
        }
        options.reverse();
        options
    }

    /// Generic colon/question-mark prompt heuristic.
    ///
    /// Returns the tentative interaction type: `Password` when the line names a
    /// secret, `Freeform` otherwise.
    pub fn match_prompt_heuristic(&self, line: &str) -> Option<InteractionType> {
        let line = line.trim_end();
        if line.is_empty() || line.chars().count() > MAX_PROMPT_LINE_CHARS {
            return None;
        }
        if !line.ends_with([':', '?', '：', '？']) {
            return None;
        }
        if self.prompt_exclusions.iter().any(|rx| rx.is_match(line)) {
            return None;
        }

        let lower = line.to_lowercase();
        if !self.prompt_keywords.iter().any(|kw| lower.contains(kw)) {
            return None;
        }

        if self.secret_keywords.iter().any(|kw| lower.contains(kw)) {
            Some(InteractionType::Password)
        } else {
            Some(InteractionType::Freeform)
        }
    }

    /// Name of the first pager rule that matches `text`.
    pub fn match_pager(&self, text: &str) -> Option<&'static str> {
        let text = text.trim_end();
        if text.is_empty() {
            return None;
        }
        self.pager
            .iter()
            .find(|rule| rule.pattern.is_match(text))
            .map(|rule| rule.name)
    }

    /// Exit key advertised by the program, scanning newest lines first.
    pub fn detect_exit_key(&self, text: &str) -> Option<ExitKey> {
        for line in text.lines().rev() {
            for rule in &self.exit_keys {
                let Some(caps) = rule.pattern.captures(line) else {
                    continue;
                };
                let key = match rule.key {
                    Some(key) => key.to_string(),
                    None => match caps.get(1) {
                        Some(m) => m.as_str().to_string(),
                        None => continue,
                    },
                };
                return Some(ExitKey::new(key, rule.needs_newline));
            }
        }
        None
    }
}
