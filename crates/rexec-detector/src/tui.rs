//! Full-screen program classification from the command text.

use serde::{Deserialize, Serialize};

use crate::rules::{ConditionalTui, RuleSet};

/// How likely a command is to take over the terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TuiCategory {
    /// Editors, multiplexers, monitors: always interactive
    Always,
    /// Interactive unless run with a batch argument
    Conditional,
    /// Not on any list; only an alternate-screen switch reveals a TUI
    NonBlacklist,
    /// A listed tool in batch mode, or an empty command
    None,
}

impl TuiCategory {
    /// Whether the detector may cancel this program on its own.
    pub fn auto_cancels(&self) -> bool {
        matches!(self, TuiCategory::Always | TuiCategory::Conditional)
    }
}

// Prefixes that run the next word as the real program.
const WRAPPERS: &[&str] = &["sudo", "doas", "exec", "time", "nohup", "nice", "env", "command"];

// sudo options that take a value.
const SUDO_VALUE_FLAGS: &[&str] = &["-u", "-g", "-h", "-p", "-C", "-D", "-r", "-t", "-U"];

/// Classify `command` against the TUI tables of `rules`.
pub fn classify_command(rules: &RuleSet, command: &str) -> TuiCategory {
    let Some((program, args)) = primary_program(command) else {
        return TuiCategory::None;
    };

    if rules.tui_always.iter().any(|p| *p == program) {
        return TuiCategory::Always;
    }

    if let Some(entry) = rules.tui_conditional.iter().find(|c| c.program == program) {
        return if runs_in_batch_mode(entry, &args) {
            TuiCategory::None
        } else {
            TuiCategory::Conditional
        };
    }

    TuiCategory::NonBlacklist
}

fn runs_in_batch_mode(entry: &ConditionalTui, args: &[String]) -> bool {
    args.iter().any(|arg| {
        entry.batch_args.iter().any(|flag| {
            if *flag == "*" {
                return !arg.starts_with('-');
            }
            arg.as_str() == *flag
                || (flag.starts_with("--") && arg.starts_with(&format!("{flag}=")))
                || (!flag.starts_with("--")
                    && flag.len() == 2
                    && arg.starts_with(*flag)
                    && arg.len() > 2)
        })
    })
}

/// Program basename and its arguments from the first pipeline segment, after
/// stripping env assignments and wrapper commands.
fn primary_program(command: &str) -> Option<(String, Vec<String>)> {
    let segment = first_segment(command);
    let mut words = segment.split_whitespace().map(unquote).peekable();

    loop {
        let word = words.next()?;
        if is_env_assignment(&word) {
            continue;
        }
        if WRAPPERS.contains(&word.as_str()) {
            if word == "sudo" || word == "doas" {
                skip_sudo_options(&mut words);
            }
            continue;
        }
        let program = word.rsplit('/').next().unwrap_or(&word).to_string();
        return Some((program, words.collect()));
    }
}

fn skip_sudo_options<I: Iterator<Item = String>>(words: &mut std::iter::Peekable<I>) {
    while let Some(next) = words.peek() {
        if !next.starts_with('-') {
            break;
        }
        let takes_value = SUDO_VALUE_FLAGS.contains(&next.as_str());
        words.next();
        if takes_value {
            words.next();
        }
    }
}

fn first_segment(command: &str) -> &str {
    let end = ["|", "&&", ";", "||"]
        .iter()
        .filter_map(|sep| command.find(sep))
        .min()
        .unwrap_or(command.len());
    &command[..end]
}

fn is_env_assignment(word: &str) -> bool {
    match word.split_once('=') {
        Some((name, _)) => {
            !name.is_empty()
                && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
                && !name.starts_with(|c: char| c.is_ascii_digit())
        }
        None => false,
    }
}

fn unquote(word: &str) -> String {
    word.trim_matches(|c| c == '\'' || c == '"').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::builtin_rules;

    fn classify(command: &str) -> TuiCategory {
        classify_command(builtin_rules(), command)
    }

    #[test]
    fn test_always() {
        assert_eq!(classify("vim file.txt"), TuiCategory::Always);
        assert_eq!(classify("/usr/bin/htop"), TuiCategory::Always);
        assert_eq!(classify("sudo -u root nano /etc/hosts"), TuiCategory::Always);
        assert_eq!(classify("TERM=xterm tmux attach"), TuiCategory::Always);
    }

    #[test]
    fn test_conditional() {
        assert_eq!(classify("top"), TuiCategory::Conditional);
        assert_eq!(classify("top -b -n 1"), TuiCategory::None);
        assert_eq!(classify("mysql -u root"), TuiCategory::Conditional);
        assert_eq!(classify("mysql -u root -e 'select 1'"), TuiCategory::None);
        assert_eq!(classify("psql --command=\"select 1\""), TuiCategory::None);
        assert_eq!(classify("python3"), TuiCategory::Conditional);
        assert_eq!(classify("python3 manage.py migrate"), TuiCategory::None);
        assert_eq!(classify("top -n1"), TuiCategory::None);
    }

    #[test]
    fn test_pipeline_uses_first_segment() {
        assert_eq!(classify("cat log | less"), TuiCategory::NonBlacklist);
        assert_eq!(classify("vim a; echo done"), TuiCategory::Always);
    }

    #[test]
    fn test_unknown_and_empty() {
        assert_eq!(classify("ls -la"), TuiCategory::NonBlacklist);
        assert_eq!(classify("   "), TuiCategory::None);
        assert_eq!(classify("sudo"), TuiCategory::None);
    }

    #[test]
    fn test_auto_cancel() {
        assert!(TuiCategory::Always.auto_cancels());
        assert!(TuiCategory::Conditional.auto_cancels());
        assert!(!TuiCategory::NonBlacklist.auto_cancels());
        assert!(!TuiCategory::None.auto_cancels());
    }
}
