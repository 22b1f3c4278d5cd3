//! Text shaping for the chat boundary.
//!
//! The chat adapter renders what the core hands it; these helpers keep the
//! core's output inside the platform caps so the adapter never has to
//! truncate blindly.

use crate::limits::{CHAT_MESSAGE_CAP, EMBED_FIELD_CAP};

/// Truncate `text` to at most `max` characters.
///
/// Operates on characters, not bytes, so multi-byte input never splits a
/// code point.
pub fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    text.chars().take(max).collect()
}

/// Split `text` into chunks of at most `cap` characters.
///
/// Each split prefers the last newline inside the window so chat messages
/// break between lines; when a window has no usable newline the split is a
/// hard cut at the cap. Newlines consumed as split points are dropped.
pub fn split_for_chat(text: &str, cap: usize) -> Vec<String> {
    if cap == 0 {
        return Vec::new();
    }

    let mut chunks = Vec::new();
    let mut rest = text;

    while rest.chars().count() > cap {
        let cut = byte_index_of_char(rest, cap);
        let window = &rest[..cut];

        let (head, tail) = match window.rfind('\n') {
            Some(pos) if pos > 0 => (&rest[..pos], &rest[pos + 1..]),
            _ => (&rest[..cut], &rest[cut..]),
        };
        chunks.push(head.to_string());
        rest = tail;
    }

    if !rest.is_empty() || chunks.is_empty() {
        chunks.push(rest.to_string());
    }
    chunks
}

/// Split at the chat-message cap.
pub fn split_chat_message(text: &str) -> Vec<String> {
    split_for_chat(text, CHAT_MESSAGE_CAP)
}

/// Split at the embed-field cap.
pub fn split_embed_field(text: &str) -> Vec<String> {
    split_for_chat(text, EMBED_FIELD_CAP)
}

/// Byte offset of the `n`-th character, or the string length when shorter.
fn byte_index_of_char(s: &str, n: usize) -> usize {
    s.char_indices().nth(n).map(|(i, _)| i).unwrap_or(s.len())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_is_noop_under_cap() {
        assert_eq!(truncate_chars("short", 60), "short");
    }

    #[test]
    fn truncate_counts_chars_not_bytes() {
        let s = "äöü".repeat(30);
        let out = truncate_chars(&s, 60);
        assert_eq!(out.chars().count(), 60);
    }

    #[test]
    fn split_prefers_last_newline() {
        let text = "aaaa\nbbbb\ncccc";
        let chunks = split_for_chat(text, 10);
        assert_eq!(chunks, vec!["aaaa\nbbbb", "cccc"]);
    }

    #[test]
    fn split_hard_cuts_without_newline() {
        let text = "a".repeat(25);
        let chunks = split_for_chat(&text, 10);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 10);
        assert_eq!(chunks[1].len(), 10);
        assert_eq!(chunks[2].len(), 5);
    }

    #[test]
    fn split_within_cap_returns_single_chunk() {
        assert_eq!(split_chat_message("hello"), vec!["hello"]);
        assert_eq!(split_embed_field("hello"), vec!["hello"]);
    }

    #[test]
    fn split_empty_input_returns_single_empty_chunk() {
        assert_eq!(split_for_chat("", 10), vec![""]);
    }

    #[test]
    fn split_ignores_leading_newline_in_window() {
        // A newline at position 0 would make an empty chunk; hard cut instead.
        let text = format!("\n{}", "a".repeat(15));
        let chunks = split_for_chat(&text, 10);
        assert!(chunks.iter().all(|c| !c.is_empty()));
    }

    #[test]
    fn every_chunk_respects_the_cap() {
        let text = "line one\nline two\nline three and some more text\nend";
        for chunk in split_for_chat(text, 12) {
            assert!(chunk.chars().count() <= 12, "chunk too long: {chunk:?}");
        }
    }
}
