//! Mutable per-session state owned by the manager.

use std::collections::VecDeque;

use chrono::DateTime;
use chrono::Utc;
use mission_protocol::JournalEntry;
use mission_protocol::SessionConfig;
use mission_protocol::SessionId;
use mission_protocol::SessionRecord;
use mission_protocol::SessionStatus;
use mission_utils_string::take_last_bytes_at_char_boundary;
use serde::Serialize;

/// Oldest journal entries are dropped past this count.
const MAX_JOURNAL_ENTRIES: usize = 1_000;

/// Append-only output with a byte ceiling. Once the ceiling is hit the
/// oldest text is dropped and the buffer remembers that its prefix is gone.
#[derive(Debug, Clone)]
pub struct OutputBuffer {
    chunks: VecDeque<String>,
    total_bytes: usize,
    max_bytes: usize,
    truncated_prefix: bool,
}

impl OutputBuffer {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            total_bytes: 0,
            max_bytes,
            truncated_prefix: false,
        }
    }

    pub fn push(&mut self, chunk: &str) {
        if chunk.is_empty() {
            return;
        }
        self.total_bytes = self.total_bytes.saturating_add(chunk.len());
        self.chunks.push_back(chunk.to_string());

        let mut excess = self.total_bytes.saturating_sub(self.max_bytes);
        while excess > 0 {
            match self.chunks.front_mut() {
                Some(front) if excess >= front.len() => {
                    excess -= front.len();
                    self.total_bytes = self.total_bytes.saturating_sub(front.len());
                    self.chunks.pop_front();
                    self.truncated_prefix = true;
                }
                Some(front) => {
                    let keep = take_last_bytes_at_char_boundary(front, front.len() - excess);
                    let removed = front.len() - keep.len();
                    *front = keep.to_string();
                    self.total_bytes = self.total_bytes.saturating_sub(removed);
                    self.truncated_prefix = true;
                    break;
                }
                None => break,
            }
        }
    }

    pub fn text(&self) -> String {
        let mut aggregated = String::with_capacity(self.total_bytes);
        for chunk in &self.chunks {
            aggregated.push_str(chunk);
        }
        aggregated
    }

    pub fn len(&self) -> usize {
        self.total_bytes
    }

    pub fn is_empty(&self) -> bool {
        self.total_bytes == 0
    }

    pub fn was_truncated(&self) -> bool {
        self.truncated_prefix
    }
}

#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    pub config: SessionConfig,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub cost_usd: f64,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub tool_calls: u64,
    pub output: OutputBuffer,
    pub error_message: Option<String>,
    pub conversation_id: Option<String>,
    pub restart_count: u32,
    pub completed_at: Option<DateTime<Utc>>,
    pub journal: VecDeque<JournalEntry>,
}

impl Session {
    pub fn new(id: SessionId, config: SessionConfig, output_max_bytes: usize) -> Self {
        Self {
            id,
            config,
            status: SessionStatus::Starting,
            created_at: Utc::now(),
            cost_usd: 0.0,
            tokens_in: 0,
            tokens_out: 0,
            tool_calls: 0,
            output: OutputBuffer::new(output_max_bytes),
            error_message: None,
            conversation_id: None,
            restart_count: 0,
            completed_at: None,
            journal: VecDeque::new(),
        }
    }

    pub fn add_journal(&mut self, entry: JournalEntry) {
        if self.journal.len() == MAX_JOURNAL_ENTRIES {
            self.journal.pop_front();
        }
        self.journal.push_back(entry);
    }

    /// Returns the previous status when it actually changed.
    pub fn set_status(&mut self, status: SessionStatus) -> Option<SessionStatus> {
        if self.status == status {
            return None;
        }
        let old = self.status;
        self.status = status;
        if status.is_terminal() {
            self.completed_at = Some(Utc::now());
        } else {
            self.completed_at = None;
        }
        Some(old)
    }

    /// Counters only ever grow. Returns whether anything changed.
    pub fn add_usage(&mut self, cost_usd: f64, tokens_in: u64, tokens_out: u64) -> bool {
        let cost = if cost_usd.is_finite() && cost_usd > 0.0 {
            cost_usd
        } else {
            0.0
        };
        self.cost_usd += cost;
        self.tokens_in = self.tokens_in.saturating_add(tokens_in);
        self.tokens_out = self.tokens_out.saturating_add(tokens_out);
        cost > 0.0 || tokens_in > 0 || tokens_out > 0
    }

    pub fn record_tool_call(&mut self) {
        self.tool_calls = self.tool_calls.saturating_add(1);
    }

    /// Partial chunks are appended as-is; complete messages end with a newline.
    pub fn append_output(&mut self, text: &str, partial: bool) {
        self.output.push(text);
        if !partial && !text.ends_with('\n') {
            self.output.push("\n");
        }
    }

    pub fn record(&self) -> SessionRecord {
        SessionRecord {
            id: self.id.clone(),
            machine_id: self.config.machine_id.clone(),
            mode: self.config.mode,
            approval_mode: self.config.approval_mode,
            status: self.status,
            task: self.config.task.clone(),
            cost: self.cost_usd,
            tokens_in: self.tokens_in,
            tokens_out: self.tokens_out,
            tool_calls: self.tool_calls,
            restart_count: self.restart_count,
            error_message: self.error_message.clone(),
            conversation_id: self.conversation_id.clone(),
            created_at: self.created_at,
            completed_at: self.completed_at,
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            record: self.record(),
            output: self.output.text(),
            output_truncated: self.output.was_truncated(),
        }
    }
}

/// Read-only view returned by `get_session`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    #[serde(flatten)]
    pub record: SessionRecord,
    pub output: String,
    pub output_truncated: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use mission_protocol::ExecutionMode;
    use pretty_assertions::assert_eq;

    #[test]
    fn output_buffer_drops_oldest_bytes() {
        let mut buffer = OutputBuffer::new(8);
        buffer.push("abcd");
        buffer.push("efgh");
        assert!(!buffer.was_truncated());

        buffer.push("ij");
        assert_eq!(buffer.text(), "cdefghij");
        assert_eq!(buffer.len(), 8);
        assert!(buffer.was_truncated());

        buffer.push("0123456789");
        assert_eq!(buffer.text(), "23456789");
    }

    #[test]
    fn output_buffer_trims_on_char_boundary() {
        let mut buffer = OutputBuffer::new(4);
        buffer.push("ééé");
        assert_eq!(buffer.text(), "éé");
        assert!(buffer.len() <= 4);
    }

    #[test]
    fn usage_never_decreases() {
        let config = SessionConfig::new(ExecutionMode::Streaming, "/tmp", "task");
        let mut session = Session::new(SessionId::from("s"), config, 1024);

        assert!(session.add_usage(0.5, 10, 3));
        assert!(!session.add_usage(-1.0, 0, 0));
        assert!(!session.add_usage(f64::NAN, 0, 0));
        assert_eq!(
            (session.cost_usd, session.tokens_in, session.tokens_out),
            (0.5, 10, 3)
        );
    }

    #[test]
    fn terminal_status_sets_completion_time() {
        let config = SessionConfig::new(ExecutionMode::Worker, "/tmp", "task");
        let mut session = Session::new(SessionId::from("s"), config, 1024);

        assert_eq!(
            session.set_status(SessionStatus::Working),
            Some(SessionStatus::Starting)
        );
        assert_eq!(session.set_status(SessionStatus::Working), None);
        assert!(session.completed_at.is_none());

        session.set_status(SessionStatus::Done);
        assert!(session.record().completed_at.is_some());

        session.set_status(SessionStatus::Working);
        assert!(session.completed_at.is_none());
    }

    #[test]
    fn journal_keeps_the_newest_entries() {
        use mission_protocol::JournalEntryKind;

        let config = SessionConfig::new(ExecutionMode::Streaming, "/tmp", "task");
        let mut session = Session::new(SessionId::from("s"), config, 1024);
        for n in 0..=MAX_JOURNAL_ENTRIES {
            session.add_journal(JournalEntry::new(JournalEntryKind::Output, n.to_string()));
        }
        assert_eq!(session.journal.len(), MAX_JOURNAL_ENTRIES);
        assert_eq!(session.journal.front().map(|e| e.content.as_str()), Some("1"));
    }

    #[test]
    fn complete_messages_end_with_newline() {
        let config = SessionConfig::new(ExecutionMode::Streaming, "/tmp", "task");
        let mut session = Session::new(SessionId::from("s"), config, 1024);
        session.append_output("Hel", true);
        session.append_output("lo", true);
        session.append_output("done", false);
        assert_eq!(session.snapshot().output, "Hellodone\n");
    }
}
