//! Keyboard input types for exit keys, interrupts and pager navigation.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Keyboard key that can be injected into a remote stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Key {
    // Character keys
    /// Regular character
    Char(char),

    // Navigation
    /// Up arrow
    Up,
    /// Down arrow
    Down,
    /// Left arrow
    Left,
    /// Right arrow
    Right,
    /// Home key
    Home,
    /// End key
    End,
    /// Page Up
    PageUp,
    /// Page Down
    PageDown,

    // Actions
    /// Enter/Return key
    Enter,
    /// Tab key
    Tab,
    /// Escape key
    Escape,
    /// Backspace key
    Backspace,
    /// Delete key
    Delete,
    /// Space key
    Space,

    /// Function key F1..F12 (`mc` quits on F10)
    F(u8),

    // Modified keys
    /// Ctrl + letter
    Ctrl(char),
    /// Alt + character
    Alt(char),
}

impl Key {
    /// The interrupt key (Ctrl+C).
    pub fn interrupt() -> Self {
        Key::Ctrl('c')
    }

    /// Parse key from string representation.
    ///
    /// Examples:
    /// - "q" -> Key::Char('q')
    /// - "Ctrl+c", "ctrl+C", "^C" -> Key::Ctrl('c')
    /// - "Alt+f" -> Key::Alt('f')
    /// - "Enter" -> Key::Enter
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();

        let lower = s.to_ascii_lowercase();
        let ctrl_rest = lower
            .strip_prefix("ctrl+")
            .or_else(|| lower.strip_prefix("ctrl-"))
            .or_else(|| lower.strip_prefix('^').filter(|rest| !rest.is_empty()));
        if let Some(rest) = ctrl_rest {
            let mut chars = rest.chars();
            return match (chars.next(), chars.next()) {
                (Some(ch), None) if ch.is_ascii_lowercase() => Ok(Key::Ctrl(ch)),
                _ => Err(Error::InvalidInput(format!("Invalid Ctrl key: {s}"))),
            };
        }

        if let Some(rest) = s.strip_prefix("Alt+") {
            let mut chars = rest.chars();
            return match (chars.next(), chars.next()) {
                (Some(ch), None) => Ok(Key::Alt(ch)),
                _ => Err(Error::InvalidInput(format!("Invalid Alt key: {s}"))),
            };
        }

        // Handle named keys
        match lower.as_str() {
            "enter" | "return" => return Ok(Key::Enter),
            "tab" => return Ok(Key::Tab),
            "escape" | "esc" => return Ok(Key::Escape),
            "backspace" => return Ok(Key::Backspace),
            "delete" | "del" => return Ok(Key::Delete),
            "space" => return Ok(Key::Space),
            "up" => return Ok(Key::Up),
            "down" => return Ok(Key::Down),
            "left" => return Ok(Key::Left),
            "right" => return Ok(Key::Right),
            "home" => return Ok(Key::Home),
            "end" => return Ok(Key::End),
            "pageup" | "pgup" => return Ok(Key::PageUp),
            "pagedown" | "pgdn" => return Ok(Key::PageDown),
            _ => {}
        }

        if let Some(n) = lower.strip_prefix('f').and_then(|n| n.parse::<u8>().ok()) {
            if (1..=12).contains(&n) {
                return Ok(Key::F(n));
            }
        }

        // Single character
        let mut chars = s.chars();
        match (chars.next(), chars.next()) {
            (Some(ch), None) => Ok(Key::Char(ch)),
            _ => Err(Error::InvalidInput(format!("Unknown key: {s}"))),
        }
    }

    /// Convert key to terminal escape sequence bytes.
    pub fn to_escape_sequence(&self) -> Vec<u8> {
        match self {
            Key::Char(c) => c.to_string().into_bytes(),
            Key::Enter => vec![0x0D], // CR
            Key::Tab => vec![0x09],
            Key::Escape => vec![0x1B],
            Key::Backspace => vec![0x7F],
            Key::Delete => b"\x1b[3~".to_vec(),
            Key::Space => vec![0x20],
            Key::Up => b"\x1b[A".to_vec(),
            Key::Down => b"\x1b[B".to_vec(),
            Key::Right => b"\x1b[C".to_vec(),
            Key::Left => b"\x1b[D".to_vec(),
            Key::Home => b"\x1b[H".to_vec(),
            Key::End => b"\x1b[F".to_vec(),
            Key::PageUp => b"\x1b[5~".to_vec(),
            Key::PageDown => b"\x1b[6~".to_vec(),
            Key::F(n) => match n {
                1 => b"\x1bOP".to_vec(),
                2 => b"\x1bOQ".to_vec(),
                3 => b"\x1bOR".to_vec(),
                4 => b"\x1bOS".to_vec(),
                5 => b"\x1b[15~".to_vec(),
                6 => b"\x1b[17~".to_vec(),
                7 => b"\x1b[18~".to_vec(),
                8 => b"\x1b[19~".to_vec(),
                9 => b"\x1b[20~".to_vec(),
                10 => b"\x1b[21~".to_vec(),
                11 => b"\x1b[23~".to_vec(),
                _ => b"\x1b[24~".to_vec(),
            },
            Key::Ctrl(c) => {
                // Ctrl+A = 0x01, Ctrl+Z = 0x1A
                let code = (*c as u8).to_ascii_lowercase() - b'a' + 1;
                vec![code]
            }
            Key::Alt(c) => {
                // Alt sends ESC prefix
                let mut seq = vec![0x1B];
                seq.extend(c.to_string().bytes());
                seq
            }
        }
    }
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Key::Char(c) => write!(f, "{c}"),
            Key::Up => write!(f, "Up"),
            Key::Down => write!(f, "Down"),
            Key::Left => write!(f, "Left"),
            Key::Right => write!(f, "Right"),
            Key::Home => write!(f, "Home"),
            Key::End => write!(f, "End"),
            Key::PageUp => write!(f, "PageUp"),
            Key::PageDown => write!(f, "PageDown"),
            Key::Enter => write!(f, "Enter"),
            Key::Tab => write!(f, "Tab"),
            Key::Escape => write!(f, "Escape"),
            Key::Backspace => write!(f, "Backspace"),
            Key::Delete => write!(f, "Delete"),
            Key::Space => write!(f, "Space"),
            Key::F(n) => write!(f, "F{n}"),
            Key::Ctrl(c) => write!(f, "Ctrl+{}", c.to_ascii_uppercase()),
            Key::Alt(c) => write!(f, "Alt+{c}"),
        }
    }
}
