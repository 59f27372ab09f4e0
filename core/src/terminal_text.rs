//! Pure helpers for reading an interactive terminal: escape-sequence
//! stripping, UTF-8 reassembly across reads, and prompt detection over a
//! rolling window of recent output.

use mission_utils_string::take_bytes_at_char_boundary;
use mission_utils_string::take_last_bytes_at_char_boundary;

use crate::config::TerminalPatterns;

const DETECTION_TRIM_AT: usize = 2_500;
const DETECTION_KEEP: usize = 2_000;
const QUESTION_PREVIEW_BYTES: usize = 200;
/// An unterminated escape longer than this is flushed rather than held.
const MAX_HELD_ESCAPE_BYTES: usize = 4 * 1024;

const ESC: char = '\u{1b}';
const BEL: char = '\u{07}';

/// Remove terminal control sequences and control characters.
///
/// Printable text (prompt markers such as `>` or `❯` included) survives;
/// cursor-forward moves become a single space so words stay apart; carriage
/// returns are dropped and line feeds and tabs kept.
pub fn strip_ansi(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            ESC => match chars.next() {
                Some('[') => {
                    let mut final_byte = None;
                    for next in chars.by_ref() {
                        if ('\u{40}'..='\u{7e}').contains(&next) {
                            final_byte = Some(next);
                            break;
                        }
                    }
                    if final_byte == Some('C') {
                        out.push(' ');
                    }
                }
                Some(']') | Some('P') | Some('X') | Some('^') | Some('_') => {
                    // String sequences end with BEL or ESC \.
                    while let Some(next) = chars.next() {
                        if next == BEL {
                            break;
                        }
                        if next == ESC && chars.peek() == Some(&'\\') {
                            chars.next();
                            break;
                        }
                    }
                }
                Some('(') | Some(')') | Some('*') | Some('+') => {
                    chars.next();
                }
                _ => {}
            },
            '\n' | '\t' => out.push(c),
            c if c.is_control() => {}
            c => out.push(c),
        }
    }
    out
}

/// Byte offset of a trailing escape sequence that has not seen its
/// terminator yet.
fn unterminated_escape(input: &str) -> Option<usize> {
    let mut chars = input.char_indices().peekable();
    while let Some((start, c)) = chars.next() {
        if c != ESC {
            continue;
        }
        let complete = match chars.next() {
            None => false,
            Some((_, '[')) => chars
                .by_ref()
                .any(|(_, next)| ('\u{40}'..='\u{7e}').contains(&next)),
            Some((_, ']' | 'P' | 'X' | '^' | '_')) => loop {
                match chars.next() {
                    None => break false,
                    Some((_, BEL)) => break true,
                    Some((_, ESC)) => match chars.peek() {
                        None => break false,
                        Some((_, '\\')) => {
                            chars.next();
                            break true;
                        }
                        Some(_) => {}
                    },
                    Some(_) => {}
                }
            },
            Some((_, '(' | ')' | '*' | '+')) => chars.next().is_some(),
            Some(_) => true,
        };
        if !complete {
            return Some(start);
        }
    }
    None
}

/// [`strip_ansi`] over a stream of reads. A sequence cut off at the end of
/// one read is held until its terminator arrives.
#[derive(Debug, Default)]
pub struct AnsiStripper {
    pending: String,
}

impl AnsiStripper {
    pub fn push(&mut self, chunk: &str) -> String {
        self.pending.push_str(chunk);
        let text = std::mem::take(&mut self.pending);
        match unterminated_escape(&text) {
            Some(start) if text.len() - start <= MAX_HELD_ESCAPE_BYTES => {
                self.pending = text[start..].to_string();
                strip_ansi(&text[..start])
            }
            _ => strip_ansi(&text),
        }
    }

    pub fn finish(&mut self) -> String {
        strip_ansi(&std::mem::take(&mut self.pending))
    }
}

/// Decode `bytes` appended to any incomplete sequence left by the previous
/// read. An incomplete trailing sequence is kept for the next call.
pub fn decode_utf8_chunk(pending: &mut Vec<u8>, bytes: &[u8]) -> String {
    pending.extend_from_slice(bytes);
    match std::str::from_utf8(pending) {
        Ok(text) => {
            let text = text.to_string();
            pending.clear();
            text
        }
        Err(err) if err.error_len().is_none() => {
            let valid = err.valid_up_to();
            let text = String::from_utf8_lossy(&pending[..valid]).into_owned();
            pending.drain(..valid);
            text
        }
        Err(_) => {
            let text = String::from_utf8_lossy(pending).into_owned();
            pending.clear();
            text
        }
    }
}

/// Rolling window of recent, already stripped output.
#[derive(Debug, Default)]
pub struct DetectionBuffer {
    text: String,
}

impl DetectionBuffer {
    pub fn push(&mut self, text: &str) {
        self.text.push_str(text);
        if self.text.len() > DETECTION_TRIM_AT {
            self.text = take_last_bytes_at_char_boundary(&self.text, DETECTION_KEEP).to_string();
        }
    }

    pub fn clear(&mut self) {
        self.text.clear();
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Last non-empty line, used to label auto-approvals.
    pub fn last_line(&self) -> &str {
        let line = self
            .text
            .lines()
            .rev()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .unwrap_or_default();
        take_bytes_at_char_boundary(line, QUESTION_PREVIEW_BYTES)
    }
}

/// Configurable triggers for task injection and auto-approval.
#[derive(Debug, Clone)]
pub struct PromptDetector {
    patterns: TerminalPatterns,
}

impl PromptDetector {
    pub fn new(patterns: TerminalPatterns) -> Self {
        Self { patterns }
    }

    pub fn is_ready(&self, recent: &str) -> bool {
        self.patterns.ready.is_match(recent)
    }

    pub fn is_confirmation(&self, recent: &str) -> bool {
        self.patterns.confirmation.is_match(recent)
    }
}
