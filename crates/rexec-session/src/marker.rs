//! Command markers and command wrapping.

use chrono::Utc;
use uuid::Uuid;

/// Start/end sentinels for one command execution.
///
/// The wrapped command prints each marker from two separately quoted halves,
/// so the shell's echo of the command line never contains a whole marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkerPair {
    start: String,
    end: String,
}

impl MarkerPair {
    /// Fresh markers from the current time and a random suffix.
    pub fn generate(prefix: &str) -> Self {
        let stamp = Utc::now().timestamp_millis();
        let suffix = Uuid::new_v4().simple().to_string();
        let suffix = &suffix[..12];
        Self {
            start: format!("{prefix}_S_{stamp}_{suffix}"),
            end: format!("{prefix}_E_{stamp}_{suffix}"),
        }
    }

    /// Markers with fixed text.
    pub fn new(start: impl Into<String>, end: impl Into<String>) -> Self {
        Self {
            start: start.into(),
            end: end.into(),
        }
    }

    /// Start marker.
    pub fn start(&self) -> &str {
        &self.start
    }

    /// End marker, printed as `<end>:<exit status>`.
    pub fn end(&self) -> &str {
        &self.end
    }
}

/// Single-quote `text` for a POSIX shell.
pub fn shell_quote(text: &str) -> String {
    let mut quoted = String::with_capacity(text.len() + 2);
    quoted.push('\'');
    for c in text.chars() {
        if c == '\'' {
            quoted.push_str("'\\''");
        } else {
            quoted.push(c);
        }
    }
    quoted.push('\'');
    quoted
}

fn split_quoted(marker: &str) -> String {
    let mid = marker.len() / 2;
    let mid = (mid..=marker.len())
        .find(|i| marker.is_char_boundary(*i))
        .unwrap_or(marker.len());
    format!("{} {}", shell_quote(&marker[..mid]), shell_quote(&marker[mid..]))
}

/// Build the line sent to the remote shell.
///
/// Prints the start marker, runs `command` (through `login_shell` unless it
/// is empty, optionally after `cd cwd`), then prints the end marker followed
/// by `:` and the exit status.
pub fn wrap_command(
    command: &str,
    markers: &MarkerPair,
    cwd: Option<&str>,
    login_shell: &str,
) -> String {
    let body = if login_shell.trim().is_empty() {
        format!("eval {}", shell_quote(command))
    } else {
        format!("{} {}", login_shell.trim(), shell_quote(command))
    };
    let body = match cwd {
        Some(dir) if !dir.is_empty() => format!("cd {} && {}", shell_quote(dir), body),
        _ => body,
    };

    format!(
        "printf '%s%s\\n' {}; {}; __rexec_rc=$?; printf '%s%s:%s\\n' {} \"$__rexec_rc\"",
        split_quoted(markers.start()),
        body,
        split_quoted(markers.end()),
    )
}
