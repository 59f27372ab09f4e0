//! Output scrubbing applied to every piece of text that leaves a session.
//!
//! The secret set is captured once and never changes afterwards; the
//! redactor is shared behind an `Arc` by the manager and every backend.

use mission_utils_string::take_bytes_at_char_boundary;
use serde_json::Value;

use crate::config::RedactionSettings;

pub const MASK: &str = "***";

/// Longest scheme the stripper removes; a split `javascript:` must be held.
const SCHEME: &str = "javascript:";
/// Streamed text held back waiting for a tag to close is released past this.
const MAX_HELD_MARKUP_BYTES: usize = 16 * 1024;

/// Elements dropped together with their contents.
const BLOCK_ELEMENTS: &[&str] = &["script", "style", "iframe", "object", "template"];
/// Elements dropped as a single tag.
const VOID_ELEMENTS: &[&str] = &["embed", "link", "meta", "base"];

#[derive(Debug, Clone, Default)]
pub struct SecretRedactor {
    /// Longest first so that a secret containing another is masked whole.
    secrets: Vec<String>,
}

impl SecretRedactor {
    pub fn new<I, S>(secrets: I, min_len: usize) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut secrets: Vec<String> = secrets
            .into_iter()
            .map(Into::into)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty() && value.len() >= min_len)
            .collect();
        secrets.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        secrets.dedup();
        Self { secrets }
    }

    /// Collect the values of secret-looking environment variables of this
    /// process.
    pub fn from_env(settings: &RedactionSettings) -> Self {
        Self::from_vars(std::env::vars(), settings)
    }

    pub fn from_vars<I>(vars: I, settings: &RedactionSettings) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let patterns: Vec<String> = settings
            .secret_name_patterns
            .iter()
            .map(|pattern| pattern.to_ascii_uppercase())
            .collect();
        let secrets = vars.into_iter().filter_map(|(name, value)| {
            let upper = name.to_ascii_uppercase();
            patterns
                .iter()
                .any(|pattern| upper.contains(pattern.as_str()))
                .then_some(value)
        });
        let redactor = Self::new(secrets, settings.min_secret_len);
        tracing::debug!(count = redactor.secrets.len(), "secret redactor initialised");
        redactor
    }

    pub fn secret_count(&self) -> usize {
        self.secrets.len()
    }

    fn max_secret_len(&self) -> usize {
        self.secrets.first().map_or(0, String::len)
    }

    /// Length of the prefix of `text` that can be redacted now without
    /// splitting a secret, a `javascript:` scheme or a tag. A tag that is
    /// still open holds everything after it, up to a size limit.
    fn releasable_len(&self, text: &str) -> usize {
        let hold = self.max_secret_len().max(SCHEME.len()).saturating_sub(1);
        let mut cut = take_bytes_at_char_boundary(text, text.len().saturating_sub(hold)).len();

        let lower = text.to_ascii_lowercase();
        let (mut spans, unfinished) = markup_spans(&lower);
        if let Some(open) = unfinished {
            let floor = take_bytes_at_char_boundary(
                text,
                text.len().saturating_sub(MAX_HELD_MARKUP_BYTES),
            )
            .len();
            cut = cut.min(open.max(floor));
        }
        spans.extend(
            lower
                .match_indices(SCHEME)
                .map(|(at, _)| (at, at + SCHEME.len())),
        );
        for secret in &self.secrets {
            spans.extend(
                text.match_indices(secret.as_str())
                    .map(|(at, _)| (at, at + secret.len())),
            );
        }

        // Pull the cut back to the start of anything it would split.
        while let Some(start) = spans
            .iter()
            .filter(|&&(start, end)| start < cut && end > cut)
            .map(|&(start, _)| start)
            .min()
        {
            cut = start;
        }
        cut
    }

    /// Mask secrets and strip executable markup.
    pub fn redact(&self, text: &str) -> String {
        strip_unsafe_markup(&self.mask_secrets(text))
    }

    pub fn mask_secrets(&self, text: &str) -> String {
        let mut scrubbed = text.to_string();
        for secret in &self.secrets {
            if scrubbed.contains(secret.as_str()) {
                scrubbed = scrubbed.replace(secret.as_str(), MASK);
            }
        }
        scrubbed
    }

    /// Apply [`Self::redact`] to every string (keys included) in a JSON value.
    pub fn redact_json(&self, value: &Value) -> Value {
        match value {
            Value::String(text) => Value::String(self.redact(text)),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.redact_json(v)).collect()),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(key, v)| (self.redact(key), self.redact_json(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }
}

/// Redaction for text that arrives in pieces.
///
/// Redacting each piece on its own misses a secret or tag split across two
/// pieces, so the undecided tail of the stream is carried over until the
/// next piece or [`StreamingRedaction::finish`].
#[derive(Debug, Default)]
pub struct StreamingRedaction {
    pending: String,
}

impl StreamingRedaction {
    /// Append `chunk` and return the redacted text that is safe to release.
    pub fn push(&mut self, redactor: &SecretRedactor, chunk: &str) -> String {
        self.pending.push_str(chunk);
        let cut = redactor.releasable_len(&self.pending);
        if cut == 0 {
            return String::new();
        }
        let rest = self.pending.split_off(cut);
        let released = std::mem::replace(&mut self.pending, rest);
        redactor.redact(&released)
    }

    /// Redact and release whatever is still held.
    pub fn finish(&mut self, redactor: &SecretRedactor) -> String {
        if self.pending.is_empty() {
            return String::new();
        }
        redactor.redact(&std::mem::take(&mut self.pending))
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Spans of complete tags and script-like blocks in `lower`, plus the
/// offset of the first `<` whose tag or block is not finished yet.
fn markup_spans(lower: &str) -> (Vec<(usize, usize)>, Option<usize>) {
    let mut spans = Vec::new();
    let mut pos = 0;
    while let Some(offset) = lower[pos..].find('<') {
        let start = pos + offset;
        let rest = &lower[start + 1..];
        if rest.is_empty() {
            return (spans, Some(start));
        }
        if let Some(name) = element_name(rest, BLOCK_ELEMENTS) {
            let closing = format!("</{name}");
            let end = lower[start..].find(&closing).and_then(|close| {
                let close = start + close;
                lower[close..].find('>').map(|end| close + end + 1)
            });
            match end {
                Some(end) => spans.push((start, end)),
                None => return (spans, Some(start)),
            }
        } else if opens_tag(rest) {
            match tag_end(lower, start) {
                Some(end) => spans.push((start, end)),
                None => return (spans, Some(start)),
            }
        }
        pos = start + 1;
    }
    (spans, None)
}

/// Remove markup that could execute when rendered: script-like elements with
/// their bodies, embedding tags, tags carrying `on*=` handlers and
/// `javascript:` URLs.
pub fn strip_unsafe_markup(text: &str) -> String {
    if !text.contains('<') && !contains_ignore_ascii_case(text, SCHEME) {
        return text.to_string();
    }
    let lower = text.to_ascii_lowercase();
    let mut out = String::with_capacity(text.len());
    let mut pos = 0;
    while let Some(offset) = lower[pos..].find('<') {
        let start = pos + offset;
        out.push_str(&text[pos..start]);
        let rest = &lower[start + 1..];

        if let Some(name) = element_name(rest, BLOCK_ELEMENTS) {
            let closing = format!("</{name}");
            pos = match lower[start..].find(&closing) {
                Some(close) => {
                    let close = start + close;
                    match lower[close..].find('>') {
                        Some(end) => close + end + 1,
                        None => text.len(),
                    }
                }
                None => text.len(),
            };
            continue;
        }

        let is_tag = opens_tag(rest);
        match tag_end(&lower, start) {
            Some(end) if is_tag => {
                let tag = &lower[start..end];
                let unsafe_tag = element_name(rest, VOID_ELEMENTS).is_some()
                    || rest.starts_with('/') && element_name(&rest[1..], BLOCK_ELEMENTS).is_some()
                    || has_event_handler(tag)
                    || tag.contains("javascript:");
                if !unsafe_tag {
                    out.push_str(&text[start..end]);
                }
                pos = end;
            }
            None if is_tag && has_event_handler(&lower[start..]) => {
                // An unterminated tag that already carries a handler.
                pos = text.len();
            }
            _ => {
                out.push('<');
                pos = start + 1;
            }
        }
    }
    out.push_str(&text[pos..]);
    remove_ignore_ascii_case(&out, SCHEME)
}

fn opens_tag(rest: &str) -> bool {
    rest.chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '/')
}

/// End (exclusive) of the tag opening at `start`. A `>` inside a quoted
/// attribute value does not close the tag.
fn tag_end(lower: &str, start: usize) -> Option<usize> {
    let bytes = lower.as_bytes();
    let mut quote: Option<u8> = None;
    let mut after_equals = false;
    for (i, &b) in bytes.iter().enumerate().skip(start + 1) {
        if let Some(q) = quote {
            if b == q {
                quote = None;
            }
            continue;
        }
        match b {
            b'>' => return Some(i + 1),
            b'=' => after_equals = true,
            b'"' | b'\'' if after_equals => {
                quote = Some(b);
                after_equals = false;
            }
            b if b.is_ascii_whitespace() => {}
            _ => after_equals = false,
        }
    }
    None
}

/// Returns the element name when `rest` (text after `<`) opens one of `names`.
fn element_name<'a>(rest: &str, names: &[&'a str]) -> Option<&'a str> {
    names.iter().copied().find(|name| {
        rest.starts_with(name)
            && rest[name.len()..]
                .chars()
                .next()
                .is_none_or(|c| c.is_ascii_whitespace() || c == '>' || c == '/')
    })
}

fn has_event_handler(tag: &str) -> bool {
    let bytes = tag.as_bytes();
    let mut i = 0;
    while let Some(found) = tag[i..].find("on") {
        let at = i + found;
        let preceded = at > 0 && (bytes[at - 1].is_ascii_whitespace() || bytes[at - 1] == b'/');
        if preceded {
            let mut j = at + 2;
            while j < bytes.len() && bytes[j].is_ascii_alphabetic() {
                j += 1;
            }
            while j < bytes.len() && bytes[j].is_ascii_whitespace() {
                j += 1;
            }
            if j > at + 2 && bytes.get(j) == Some(&b'=') {
                return true;
            }
        }
        i = at + 2;
    }
    false
}

fn contains_ignore_ascii_case(haystack: &str, needle: &str) -> bool {
    haystack.to_ascii_lowercase().contains(needle)
}

fn remove_ignore_ascii_case(text: &str, needle: &str) -> String {
    let lower = text.to_ascii_lowercase();
    if !lower.contains(needle) {
        return text.to_string();
    }
    let mut out = String::with_capacity(text.len());
    let mut pos = 0;
    while let Some(offset) = lower[pos..].find(needle) {
        out.push_str(&text[pos..pos + offset]);
        pos += offset + needle.len();
    }
    out.push_str(&text[pos..]);
    out
}
