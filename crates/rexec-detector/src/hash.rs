//! Output hashing for silence detection.

/// FNV-1a over the UTF-8 bytes of `text`.
pub fn fnv1a(text: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in text.bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

/// Outcome of a hash comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashCheck {
    /// Output tail differs from the previous check
    Changed,
    /// Output tail is the same as at the previous check
    Unchanged,
}

/// Hashes the trailing `window` characters of output received since the
/// previous check. With no new output the previous hash is reused, so a
/// stalled program reads as unchanged.
#[derive(Debug, Clone)]
pub struct OutputHasher {
    window: usize,
    since_last: String,
    last_hash: Option<u64>,
}

impl OutputHasher {
    /// Create a hasher over `window` characters.
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            since_last: String::new(),
            last_hash: None,
        }
    }

    /// Record new output.
    pub fn push(&mut self, text: &str) {
        self.since_last.push_str(text);
        // Keep the buffer bounded; only the tail is ever hashed.
        if self.since_last.len() > self.window * 8 {
            self.since_last = tail_chars(&self.since_last, self.window).to_string();
        }
    }

    /// Compare the current window with the previous check.
    pub fn check(&mut self) -> HashCheck {
        if self.since_last.is_empty() {
            return match self.last_hash {
                Some(_) => HashCheck::Unchanged,
                None => {
                    self.last_hash = Some(fnv1a(""));
                    HashCheck::Unchanged
                }
            };
        }

        let hash = fnv1a(tail_chars(&self.since_last, self.window));
        self.since_last.clear();

        let result = match self.last_hash {
            Some(previous) if previous == hash => HashCheck::Unchanged,
            _ => HashCheck::Changed,
        };
        self.last_hash = Some(hash);
        result
    }

    /// Forget everything.
    pub fn reset(&mut self) {
        self.since_last.clear();
        self.last_hash = None;
    }
}

/// The trailing `n` characters of `text`.
pub fn tail_chars(text: &str, n: usize) -> &str {
    match text.char_indices().rev().nth(n.saturating_sub(1)) {
        Some((idx, _)) if n > 0 => &text[idx..],
        _ if n == 0 => "",
        _ => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fnv1a_known_values() {
        assert_eq!(fnv1a(""), 0xcbf29ce484222325);
        assert_eq!(fnv1a("a"), 0xaf63dc4c8601ec8c);
    }

    #[test]
    fn test_tail_chars() {
        assert_eq!(tail_chars("hello", 3), "llo");
        assert_eq!(tail_chars("hi", 10), "hi");
        assert_eq!(tail_chars("密码输入", 2), "输入");
        assert_eq!(tail_chars("abc", 0), "");
    }

    #[test]
    fn test_first_output_is_a_change() {
        let mut hasher = OutputHasher::new(500);
        hasher.push("building...\n");
        assert_eq!(hasher.check(), HashCheck::Changed);
    }

    #[test]
    fn test_no_output_is_unchanged() {
        let mut hasher = OutputHasher::new(500);
        assert_eq!(hasher.check(), HashCheck::Unchanged);
        hasher.push("x");
        assert_eq!(hasher.check(), HashCheck::Changed);
        assert_eq!(hasher.check(), HashCheck::Unchanged);
    }

    #[test]
    fn test_repeated_identical_output_is_unchanged() {
        let mut hasher = OutputHasher::new(500);
        hasher.push("spinner |");
        assert_eq!(hasher.check(), HashCheck::Changed);
        hasher.push("spinner |");
        assert_eq!(hasher.check(), HashCheck::Unchanged);
        hasher.push("spinner /");
        assert_eq!(hasher.check(), HashCheck::Changed);
    }

    #[test]
    fn test_only_window_is_hashed() {
        let mut hasher = OutputHasher::new(4);
        hasher.push("aaaa-tail");
        hasher.check();
        hasher.push("bbbb-tail");
        assert_eq!(hasher.check(), HashCheck::Unchanged);
    }

    #[test]
    fn test_buffer_stays_bounded() {
        let mut hasher = OutputHasher::new(10);
        for _ in 0..1000 {
            hasher.push("0123456789");
        }
        assert!(hasher.since_last.len() <= 10 * 8 + 10);
    }
}
