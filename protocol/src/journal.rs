use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use strum_macros::Display;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JournalEntryKind {
    /// Lifecycle notes: creation, follow-ups, mode changes, kills, summaries.
    Output,
    Error,
    ToolCall,
    AutoApproved,
    /// A permission question handed to a human.
    Prompt,
}

/// One line of a session's activity journal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JournalEntry {
    #[serde(rename = "type")]
    pub kind: JournalEntryKind,
    pub content: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

impl JournalEntry {
    pub fn new(kind: JournalEntryKind, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
            metadata: Value::Null,
            created_at: Utc::now(),
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}
