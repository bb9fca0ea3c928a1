//! Echo suppression: filters assistant text that re-emits, verbatim, the
//! content of a tool result some backends echo back after tool execution.
//!
//! Matching is incremental across deltas. Withheld text is never lost: a
//! divergence mid-match flushes everything held back, because a prefix
//! shared with the expected echo is not proof of an echo.

use std::collections::VecDeque;

/// FIFO matcher over expected echo strings.
#[derive(Debug, Default)]
pub struct EchoSuppressor {
    expected: VecDeque<String>,
    /// Bytes of the queue head already matched by earlier deltas. Always a
    /// char boundary of the head.
    matched: usize,
}

impl EchoSuppressor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers text the backend is expected to echo next. Call right
    /// after recording a tool result whose content the backend re-emits.
    /// Empty strings are ignored.
    pub fn expect_echo(&mut self, text: impl Into<String>) {
        let text = text.into();
        if !text.is_empty() {
            self.expected.push_back(text);
        }
    }

    /// Number of echoes still queued, counting a partially-matched head.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.expected.len()
    }

    /// Filters one text delta, returning the portion to forward.
    ///
    /// While the queue head keeps matching, content is suppressed. On
    /// divergence the withheld prefix plus the rest of the delta are
    /// forwarded and the head is popped. On full consumption the head is
    /// popped and any excess is matched against the next queued echo.
    pub fn filter_delta(&mut self, delta: &str) -> String {
        let mut out = String::new();
        let mut rest = delta;

        while !rest.is_empty() {
            let Some(head) = self.expected.front() else {
                out.push_str(rest);
                break;
            };

            let remaining = &head[self.matched..];
            let matched_len = common_prefix_bytes(remaining, rest);

            if matched_len == remaining.len() {
                // Head fully consumed inside this delta.
                self.expected.pop_front();
                self.matched = 0;
                rest = &rest[matched_len..];
            } else if matched_len == rest.len() {
                // Delta entirely absorbed into the pending match.
                self.matched += matched_len;
                rest = "";
            } else {
                // Divergence: this was never the echo. Forward the withheld
                // prefix and the rest of the delta, then resume normally.
                out.push_str(&head[..self.matched]);
                out.push_str(rest);
                self.expected.pop_front();
                self.matched = 0;
                rest = "";
            }
        }

        out
    }

    /// Clears queue and accumulator at run boundaries.
    pub fn reset(&mut self) {
        self.expected.clear();
        self.matched = 0;
    }
}

/// Byte length of the longest common char-aligned prefix.
fn common_prefix_bytes(a: &str, b: &str) -> usize {
    let mut len = 0;
    let mut a_chars = a.chars();
    let mut b_chars = b.chars();
    loop {
        match (a_chars.next(), b_chars.next()) {
            (Some(x), Some(y)) if x == y => len += x.len_utf8(),
            _ => break,
        }
    }
    len
}
