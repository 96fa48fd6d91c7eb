//! ANSI escape filtering with alternate-screen tracking.
//!
//! The filter keeps one VTE state machine per stream, so an escape sequence
//! split across two chunks is still recognized and removed. Printable text,
//! CR, LF and TAB pass through; backspace erases the previous character on
//! the current line. DECSET/DECRST 1049, 1047 and 47 are reported as
//! alternate-screen transitions.

use vte::{Params, Perform};

/// Alternate-screen transition seen in a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AltScreen {
    /// A full-screen program switched to the alternate buffer
    Entered,
    /// The alternate buffer was left
    Exited,
}

/// Clean text of one chunk plus the alternate-screen transition it carried.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilteredChunk {
    /// Output with escape sequences removed
    pub text: String,
    /// `Exited` whenever an exit was seen, even if an enter followed it
    pub alt_screen: Option<AltScreen>,
}

#[derive(Debug, Default)]
struct Sink {
    text: String,
    entered: bool,
    exited: bool,
}

impl Perform for Sink {
    fn print(&mut self, c: char) {
        self.text.push(c);
    }

    fn execute(&mut self, byte: u8) {
        match byte {
            b'\n' => self.text.push('\n'),
            b'\r' => self.text.push('\r'),
            b'\t' => self.text.push('\t'),
            // Backspace
            0x08 => {
                if matches!(self.text.chars().last(), Some(c) if c != '\n' && c != '\r') {
                    self.text.pop();
                }
            }
            _ => {}
        }
    }

    fn hook(&mut self, _params: &Params, _intermediates: &[u8], _ignore: bool, _c: char) {}

    fn put(&mut self, _byte: u8) {}

    fn unhook(&mut self) {}

    fn osc_dispatch(&mut self, _params: &[&[u8]], _bell_terminated: bool) {}

    fn csi_dispatch(&mut self, params: &Params, intermediates: &[u8], _ignore: bool, c: char) {
        if intermediates.first() != Some(&b'?') || !(c == 'h' || c == 'l') {
            return;
        }
        let alt = params
            .iter()
            .any(|p| matches!(p.first(), Some(&1049) | Some(&1047) | Some(&47)));
        if alt {
            if c == 'h' {
                self.entered = true;
            } else {
                self.exited = true;
            }
        }
    }

    fn esc_dispatch(&mut self, _intermediates: &[u8], _ignore: bool, _byte: u8) {}
}

/// Streaming ANSI filter.
pub struct AnsiFilter {
    parser: vte::Parser,
    sink: Sink,
}

impl std::fmt::Debug for AnsiFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnsiFilter").finish_non_exhaustive()
    }
}

impl Default for AnsiFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl AnsiFilter {
    /// Create a filter in the ground state.
    pub fn new() -> Self {
        Self {
            parser: vte::Parser::new(),
            sink: Sink::default(),
        }
    }

    /// Filter one chunk.
    pub fn filter(&mut self, bytes: &[u8]) -> FilteredChunk {
        for byte in bytes {
            self.parser.advance(&mut self.sink, *byte);
        }

        let sink = std::mem::take(&mut self.sink);
        let alt_screen = if sink.exited {
            Some(AltScreen::Exited)
        } else if sink.entered {
            Some(AltScreen::Entered)
        } else {
            None
        };
        FilteredChunk {
            text: sink.text,
            alt_screen,
        }
    }
}

/// One-shot filtering of a complete string.
pub fn strip_ansi(input: &str) -> String {
    AnsiFilter::new().filter(input.as_bytes()).text
}
