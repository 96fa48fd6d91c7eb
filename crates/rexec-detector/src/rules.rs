//! Versioned rule tables for interaction detection.
//!
//! Every table is plain ordered data so tests can enumerate rules one by one.
//! Patterns are compiled once into `BUILTIN`; a pattern that fails to compile
//! is logged and left out (the `test_all_builtin_patterns_compile` test keeps
//! that from ever happening in a release).

use lazy_static::lazy_static;
use regex::Regex;
use tracing::error;

use rexec_core::{ConfirmValues, CustomRuleConfig, Error, InteractionType, Result};

/// Version of the built-in tables.
pub const RULESET_VERSION: u32 = 3;

/// Confirmation tokens attached to a quick rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfirmSpec {
    /// Accept token
    pub yes: &'static str,
    /// Reject token
    pub no: &'static str,
    /// Token a bare Enter selects
    pub default: Option<&'static str>,
}

impl ConfirmSpec {
    /// Owned values for an interaction request.
    pub fn values(&self) -> ConfirmValues {
        ConfirmValues::new(self.yes, self.no, self.default)
    }
}

/// Quick rule: matched against the newest line, fires with no debounce.
#[derive(Debug, Clone)]
pub struct QuickRule {
    /// Rule name
    pub name: String,
    /// Compiled pattern
    pub pattern: Regex,
    /// Interaction raised on match
    pub interaction_type: InteractionType,
    /// Tokens for confirm rules
    pub confirm: Option<ConfirmSpec>,
}

/// Pager status-line rule.
#[derive(Debug, Clone)]
pub struct PagerRule {
    /// Rule name
    pub name: &'static str,
    /// Compiled pattern
    pub pattern: Regex,
}

/// Rule that recognizes how the program says it can be left.
#[derive(Debug, Clone)]
pub struct ExitKeyRule {
    /// Rule name
    pub name: &'static str,
    /// Compiled pattern
    pub pattern: Regex,
    /// Fixed key, or `None` to use capture group 1
    pub key: Option<&'static str>,
    /// Whether Enter must follow
    pub needs_newline: bool,
}

/// Interactive program that is safe with one of the listed arguments.
///
/// `"*"` in `batch_args` means any positional argument makes it one-shot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConditionalTui {
    /// Program name
    pub program: &'static str,
    /// Arguments that make it non-interactive
    pub batch_args: &'static [&'static str],
}

/// Complete, versioned set of detection tables.
#[derive(Debug, Clone)]
pub struct RuleSet {
    /// Table version
    pub version: u32,
    /// Quick rules in priority order
    pub quick: Vec<QuickRule>,
    /// Pager status lines
    pub pager: Vec<PagerRule>,
    /// Keywords a generic prompt must contain
    pub prompt_keywords: Vec<&'static str>,
    /// Keywords that make a generic prompt a password prompt
    pub secret_keywords: Vec<&'static str>,
    /// Lines that are never prompts
    pub prompt_exclusions: Vec<Regex>,
    /// Exit-key hints in priority order
    pub exit_keys: Vec<ExitKeyRule>,
    /// Programs that are always full-screen
    pub tui_always: Vec<&'static str>,
    /// Programs that are full-screen unless run in batch mode
    pub tui_conditional: Vec<ConditionalTui>,
    /// Prompt that introduces a numbered option list
    pub select_prompt: Option<Regex>,
    /// One numbered option line
    pub select_option: Option<Regex>,
}

// Quick rules: (name, pattern, type, confirm tokens).
const QUICK_TABLE: &[(&str, &str, InteractionType, Option<ConfirmSpec>)] = &[
    (
        "password_prompt",
        r"(?i)(password|passphrase|passcode|密码|口令)[^:：\n]{0,60}[:：]\s*$",
        InteractionType::Password,
        None,
    ),
    (
        "one_time_code",
        r"(?i)\b(verification code|one-time (pass)?code|otp|2fa code|mfa code|token code)[^:\n]{0,30}:\s*$",
        InteractionType::Password,
        None,
    ),
    (
        "confirm_default_yes",
        r"\[Y/n\]",
        InteractionType::Confirm,
        Some(ConfirmSpec {
            yes: "Y",
            no: "n",
            default: Some("Y"),
        }),
    ),
    (
        "confirm_default_no",
        r"\[y/N\]",
        InteractionType::Confirm,
        Some(ConfirmSpec {
            yes: "y",
            no: "N",
            default: Some("N"),
        }),
    ),
    (
        "confirm_brackets",
        r"(?i)\[y/n\]",
        InteractionType::Confirm,
        Some(ConfirmSpec {
            yes: "y",
            no: "n",
            default: None,
        }),
    ),
    (
        "confirm_yes_no",
        r"(?i)\(yes/no(/\[fingerprint\])?\)",
        InteractionType::Confirm,
        Some(ConfirmSpec {
            yes: "yes",
            no: "no",
            default: None,
        }),
    ),
    (
        "confirm_parens",
        r"(?i)\(y/n\)",
        InteractionType::Confirm,
        Some(ConfirmSpec {
            yes: "y",
            no: "n",
            default: None,
        }),
    ),
    (
        "press_enter",
        r"(?i)\b(press|hit)\s+(<?enter>?|<?return>?|any key)(\s+key)?\b",
        InteractionType::Enter,
        None,
    ),
    (
        "press_enter_zh",
        r"按\s*(回车|enter|任意键)",
        InteractionType::Enter,
        None,
    ),
    (
        "destructive_question",
        r"(?i)\b(delete|remove|overwrite|drop|destroy|erase|format|purge|truncate|wipe|uninstall|replace)\b[^\n]*\?\s*$",
        InteractionType::Confirm,
        Some(ConfirmSpec {
            yes: "y",
            no: "n",
            default: None,
        }),
    ),
];

const PAGER_TABLE: &[(&str, &str)] = &[
    ("more", r"--\s*More\s*--"),
    ("end", r"\(END\)\s*$"),
    ("less_lines", r"(?m)\blines \d+-\d+(/\d+)?( \d+%)?( \(END\))?\s*$"),
    ("man_status", r"(?i)Manual page \S+ line \d+"),
    ("less_help", r"(?i)\(press h for help or q to quit\)"),
];

const PROMPT_KEYWORDS: &[&str] = &[
    "password",
    "passphrase",
    "username",
    "user name",
    "login",
    "continue",
    "confirm",
    "proceed",
    "token",
    "path",
    "directory",
    "file",
    "name",
    "email",
    "enter",
    "input",
    "choose",
    "select",
    "overwrite",
    "key",
    "code",
    "host",
    "port",
    "value",
    "answer",
    "密码",
    "用户名",
    "确认",
    "继续",
    "输入",
];

const SECRET_KEYWORDS: &[&str] = &["password", "passphrase", "secret", "密码", "口令"];

const PROMPT_EXCLUSIONS: &[&str] = &[
    // Log level prefixes
    r"(?i)^\s*[\[(]?(trace|debug|info|notice|warn|warning|error|err|fatal|critical)[\])]?[\s:|-]",
    // Timestamps
    r"^\s*[\[(]?\d{4}[-/]\d{2}[-/]\d{2}[ T]\d{2}:\d{2}",
    r"^\s*[\[(]?\d{2}:\d{2}:\d{2}",
    // URLs
    r"(?i)\b[a-z][a-z0-9+.-]*://",
    // key=value lines
    r"^\s*[\w.-]+\s*=\s*\S",
];

const EXIT_KEY_TABLE: &[(&str, &str, Option<&str>, bool)] = &[
    (
        "vim_quit",
        r"(?i)type\s+(:q\S*)\s+and\s+press\s+<?enter>?",
        None,
        true,
    ),
    (
        "type_word_to_quit",
        r#"(?i)type\s+['"]?(exit|quit|\\q|\.exit|\.quit)['"]?\s+to\s+(quit|exit|leave)"#,
        None,
        true,
    ),
    (
        "press_q",
        r#"(?i)(press\s+)?['"]?\bq['"]?\s+to\s+(quit|exit)"#,
        Some("q"),
        false,
    ),
    (
        "ctrl_c",
        r"(?i)(ctrl|control)[-+ ]?c\s+to\s+(quit|exit|stop|cancel|abort)",
        Some("Ctrl+C"),
        false,
    ),
    (
        "ctrl_d",
        r"(?i)(ctrl|control)[-+ ]?d\s+to\s+(quit|exit)",
        Some("Ctrl+D"),
        false,
    ),
    ("press_q_zh", r"按\s*q\s*(键)?\s*退出", Some("q"), false),
    (
        "type_word_zh",
        r"输入\s*(exit|quit)\s*(以)?退出",
        None,
        true,
    ),
    (
        "ctrl_c_zh",
        r"(?i)按\s*ctrl\s*[+-]?\s*c\s*(键)?\s*(退出|停止|取消)",
        Some("Ctrl+C"),
        false,
    ),
];

const TUI_ALWAYS: &[&str] = &[
    "vim", "vi", "nvim", "vimdiff", "view", "nano", "pico", "emacs", "micro", "joe", "tmux",
    "screen", "byobu", "htop", "btop", "atop", "nmon", "glances", "iotop", "iftop", "nethogs",
    "mc", "ranger", "nnn", "lf", "tig", "lazygit", "lazydocker", "k9s", "ncdu", "cmatrix",
    "watch", "alsamixer", "nmtui", "ctop", "bmon",
];

const TUI_CONDITIONAL: &[ConditionalTui] = &[
    ConditionalTui {
        program: "top",
        batch_args: &["-b", "-n", "--batch"],
    },
    ConditionalTui {
        program: "mysql",
        batch_args: &["-e", "--execute", "-B", "--batch"],
    },
    ConditionalTui {
        program: "mariadb",
        batch_args: &["-e", "--execute", "-B", "--batch"],
    },
    ConditionalTui {
        program: "psql",
        batch_args: &["-c", "--command", "-f", "--file", "-l", "--list"],
    },
    ConditionalTui {
        program: "sqlite3",
        batch_args: &["-batch", "-cmd", "*"],
    },
    ConditionalTui {
        program: "redis-cli",
        batch_args: &["*"],
    },
    ConditionalTui {
        program: "mongosh",
        batch_args: &["--eval", "-f", "--file"],
    },
    ConditionalTui {
        program: "python",
        batch_args: &["-c", "-m", "-V", "--version", "*"],
    },
    ConditionalTui {
        program: "python3",
        batch_args: &["-c", "-m", "-V", "--version", "*"],
    },
    ConditionalTui {
        program: "node",
        batch_args: &["-e", "-p", "--eval", "--print", "-v", "--version", "*"],
    },
    ConditionalTui {
        program: "sftp",
        batch_args: &["-b"],
    },
    ConditionalTui {
        program: "ftp",
        batch_args: &["-n", "-s"],
    },
];

const SELECT_PROMPT: &str =
    r"(?i)(select|choose|pick|enter (your )?(choice|selection|number)|which one|请选择|选择)[^\n]*[:：?？>]\s*$";

const SELECT_OPTION: &str = r"^\s*[\[(]?(\d{1,3})[\]).:]\s+(\S.*?)\s*$";

fn compile(name: &str, pattern: &str) -> Option<Regex> {
    match Regex::new(pattern) {
        Ok(regex) => Some(regex),
        Err(e) => {
            error!("Built-in rule '{}' failed to compile: {}", name, e);
            None
        }
    }
}

lazy_static! {
    static ref BUILTIN: RuleSet = RuleSet::build();
}

/// Shared reference to the built-in tables.
pub fn builtin_rules() -> &'static RuleSet {
    &BUILTIN
}

impl RuleSet {
    /// The built-in tables.
    pub fn builtin() -> Self {
        BUILTIN.clone()
    }

    /// Built-in tables plus site-specific quick rules appended after them.
    pub fn with_custom_rules(custom: &[CustomRuleConfig]) -> Result<Self> {
        let mut rules = Self::builtin();
        for rule in custom {
            let pattern = Regex::new(&rule.pattern).map_err(|e| {
                Error::Config(format!("Invalid regex pattern '{}': {}", rule.name, e))
            })?;
            rules.quick.push(QuickRule {
                name: rule.name.clone(),
                pattern,
                interaction_type: rule.interaction_type,
                confirm: (rule.interaction_type == InteractionType::Confirm).then_some(
                    ConfirmSpec {
                        yes: "y",
                        no: "n",
                        default: None,
                    },
                ),
            });
        }
        Ok(rules)
    }

    fn build() -> Self {
        let quick = QUICK_TABLE
            .iter()
            .filter_map(|(name, pattern, interaction_type, confirm)| {
                compile(name, pattern).map(|pattern| QuickRule {
                    name: name.to_string(),
                    pattern,
                    interaction_type: *interaction_type,
                    confirm: *confirm,
                })
            })
            .collect();

        let pager = PAGER_TABLE
            .iter()
            .filter_map(|(name, pattern)| {
                compile(name, pattern).map(|pattern| PagerRule {
                    name: *name,
                    pattern,
                })
            })
            .collect();

        let prompt_exclusions = PROMPT_EXCLUSIONS
            .iter()
            .filter_map(|pattern| compile("prompt_exclusion", pattern))
            .collect();

        let exit_keys = EXIT_KEY_TABLE
            .iter()
            .filter_map(|(name, pattern, key, needs_newline)| {
                compile(name, pattern).map(|pattern| ExitKeyRule {
                    name: *name,
                    pattern,
                    key: *key,
                    needs_newline: *needs_newline,
                })
            })
            .collect();

        Self {
            version: RULESET_VERSION,
            quick,
            pager,
            prompt_keywords: PROMPT_KEYWORDS.to_vec(),
            secret_keywords: SECRET_KEYWORDS.to_vec(),
            prompt_exclusions,
            exit_keys,
            tui_always: TUI_ALWAYS.to_vec(),
            tui_conditional: TUI_CONDITIONAL.to_vec(),
            select_prompt: compile("select_prompt", SELECT_PROMPT),
            select_option: compile("select_option", SELECT_OPTION),
        }
    }

    /// Number of table entries, for diagnostics.
    pub fn rule_count(&self) -> usize {
        self.quick.len() + self.pager.len() + self.exit_keys.len() + self.prompt_exclusions.len()
    }
}

impl Default for RuleSet {
    fn default() -> Self {
        Self::builtin()
    }
}
