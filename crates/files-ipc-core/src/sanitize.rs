//! Scrubbing of failure text before it reaches the wire.
//!
//! Adapter and runtime failures can embed filesystem paths, GUIDs, tokens,
//! IP addresses and port numbers. Everything wire-bound passes through
//! [`sanitize_error_message`]; the unscrubbed original goes to the host log
//! only. Over-scrubbing is acceptable, leaking is not.

use std::sync::LazyLock;

use regex::Regex;

/// Upper bound on a sanitized message, in characters.
const MAX_MESSAGE_CHARS: usize = 300;

static WINDOWS_PATH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"[A-Za-z]:[\\/][^\s"']*"#).expect("static regex"));

static UNC_PATH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"\\\\[^\s"']+"#).expect("static regex"));

static GUID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}")
        .expect("static regex")
});

static UNIX_PATH: LazyLock<Regex> = LazyLock::new(|| {
    // Leading boundary keeps `application/json` intact while catching
    // `/home/user/file` and ` /tmp`.
    Regex::new(r#"(^|[\s"'(=,:])(/[\w.\-]+(?:/[\w.\-]+)*)"#).expect("static regex")
});

static IPV4: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(?:\d{1,3}\.){3}\d{1,3}\b").expect("static regex"));

static COLON_PORT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r":\d{2,5}\b").expect("static regex"));

static NAMED_PORT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bport\s+\d{1,5}\b").expect("static regex"));

static LONG_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z0-9+/_\-]{20,}={0,2}").expect("static regex"));

static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("static regex"));

/// Coarse classification of a failure for collapse decisions.
///
/// Access-control and cryptographic failures often carry the most sensitive
/// detail (ACL entries, key material context), so they are collapsed to a
/// fixed string rather than scrubbed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Permission / access-control failure.
    AccessDenied,
    /// Key, cipher, or token-store failure.
    Cryptographic,
    /// Everything else; scrubbed normally.
    Other,
}

/// Scrubs a failure message for the wire.
///
/// Substitutions, in order: Windows and UNC paths, GUIDs, Unix paths, IPv4
/// literals, port numbers, long base64-ish tokens; then whitespace collapse
/// and truncation to at most 300 characters at a word boundary.
#[must_use]
pub fn sanitize_error_message(message: &str) -> String {
    let scrubbed = WINDOWS_PATH.replace_all(message, "[path]");
    let scrubbed = UNC_PATH.replace_all(&scrubbed, "[path]");
    let scrubbed = GUID.replace_all(&scrubbed, "[guid]");
    let scrubbed = UNIX_PATH.replace_all(&scrubbed, "$1[path]");
    let scrubbed = IPV4.replace_all(&scrubbed, "[ip]");
    let scrubbed = COLON_PORT.replace_all(&scrubbed, ":[port]");
    let scrubbed = NAMED_PORT.replace_all(&scrubbed, "port [port]");
    let scrubbed = LONG_TOKEN.replace_all(&scrubbed, "[token]");
    let collapsed = WHITESPACE.replace_all(&scrubbed, " ");
    truncate_at_word_boundary(collapsed.trim(), MAX_MESSAGE_CHARS)
}

/// Scrubs a classified failure for the wire.
///
/// Access-denied and cryptographic failures collapse to a fixed string with
/// no detail at all; other classes go through
/// [`sanitize_error_message`].
#[must_use]
pub fn sanitize_failure(class: FailureClass, message: &str) -> String {
    match class {
        FailureClass::AccessDenied | FailureClass::Cryptographic => {
            "ExceptionKind: Access denied".to_string()
        }
        FailureClass::Other => sanitize_error_message(message),
    }
}

/// Cuts `text` to at most `max` characters, preferring the last space
/// before the limit.
fn truncate_at_word_boundary(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let hard_cut: String = text.chars().take(max).collect();
    match hard_cut.rfind(' ') {
        Some(pos) if pos > 0 => hard_cut[..pos].to_string(),
        _ => hard_cut,
    }
}
