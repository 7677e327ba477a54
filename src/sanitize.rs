//! Terminal output sanitization.
//!
//! Pure, stateless text transforms that turn raw interactive-shell output
//! into clean text: ANSI/VT100 escape stripping, backspace resolution, and
//! line-ending normalization. Nothing here knows about commands, prompts,
//! or device state.

use std::borrow::Cow;

use once_cell::sync::Lazy;
use regex::Regex;

/// CSI escape-sequence grammar: ESC `[` parameter bytes, intermediate bytes,
/// terminated by a final byte in `@`..`~`.
static ANSI_ESCAPE: Lazy<Regex> =
    Lazy::new(|| match Regex::new(r"\x1B\[[0-?]*[ -/]*[@-~]") {
        Ok(re) => re,
        Err(err) => panic!("invalid ANSI escape regex: {err}"),
    });

/// Removes ANSI/VT100 control sequences.
pub fn strip_ansi(text: &str) -> Cow<'_, str> {
    ANSI_ESCAPE.replace_all(text, "")
}

/// Resolves backspace characters against the preceding output.
///
/// Each `\x08` removes itself and the character immediately before it;
/// repeated backspaces cascade. A backspace with nothing before it is
/// dropped with no effect.
pub fn resolve_backspaces(text: &str) -> String {
    let mut stack: Vec<char> = Vec::with_capacity(text.len());
    for ch in text.chars() {
        if ch != '\u{8}' {
            stack.push(ch);
        } else {
            stack.pop();
        }
    }
    stack.into_iter().collect()
}

/// Normalizes `\r\n` and bare `\r` line endings to `\n`.
pub fn normalize_newlines(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\r', "\n")
}

/// Full sanitization pipeline: strip ANSI sequences, resolve backspaces,
/// normalize line endings.
pub fn sanitize(text: &str) -> String {
    normalize_newlines(&resolve_backspaces(&strip_ansi(text)))
}

/// Sanitizes raw bytes read from a shell channel (lossy UTF-8 front end).
pub fn sanitize_bytes(raw: &[u8]) -> String {
    sanitize(&String::from_utf8_lossy(raw))
}

/// Drops lines matching `pattern` from `text`.
///
/// Used to remove residual prompt lines from captured command output.
pub fn filter_lines(text: &str, pattern: &Regex) -> String {
    text.lines()
        .filter(|line| !pattern.is_match(line))
        .collect::<Vec<_>>()
        .join("\n")
}
