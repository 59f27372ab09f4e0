//! Human-approval queue used by the permission gate.
//!
//! The gate only needs the [`ApprovalQueue`] trait. [`PromptQueue`] is the
//! in-process implementation: prompts wait on a oneshot channel until
//! somebody answers them through the manager's `respond` call.

use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use mission_protocol::SessionId;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::sync::oneshot;
use uuid::Uuid;

pub const ALLOW_OPTION: &str = "Allow";
pub const DENY_OPTION: &str = "Deny";

const PROMPT_ANNOUNCE_CAPACITY: usize = 64;

/// Command fragments that always go to a human.
const DANGEROUS_PATTERNS: &[&str] = &[
    "rm -rf",
    "rm -r /",
    "del /s",
    "rmdir /s",
    "format ",
    "mkfs",
    "dd if=",
    "npm publish",
    "npm unpublish",
    "git push --force",
    "git reset --hard",
    "deploy",
    "kubectl",
    "docker push",
    "shutdown",
    "reboot",
];

const READ_MARKERS: &[&str] = &["read", "glob", "grep", "search"];
const WRITE_MARKERS: &[&str] = &["write", "edit"];

const SAFE_COMMANDS: &[&str] = &[
    "npm test", "npx tsc", "npx vitest", "npm run", "git status", "git diff", "git log",
    "git branch", "git add", "git commit", "ls", "cat", "head", "tail", "find", "wc", "echo",
    "pwd", "whoami", "which", "cp ", "mv ", "mkdir ", "node ", "python ", "npx ", "cd ", "tree",
    "sort", "uniq", "diff ", "cargo test", "cargo check", "cargo build",
];

/// Answers that count as approval.
const AFFIRMATIVE_ANSWERS: &[&str] = &[
    "1", "allow", "allowed", "approve", "approved", "yes", "y", "ok", "always",
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ApprovalError {
    #[error("prompt {prompt_id} was cancelled")]
    Cancelled { prompt_id: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AutoApproval {
    Resolved { answer: String, reason: String },
    Unresolved { reason: String },
}

/// A question waiting for a human.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptRequest {
    pub id: String,
    pub session_id: SessionId,
    pub question: String,
    pub options: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait ApprovalQueue: Send + Sync {
    /// Queue a question and suspend until it is answered or cancelled.
    async fn enqueue_and_wait(
        &self,
        session_id: &SessionId,
        question: &str,
        options: &[String],
    ) -> Result<String, ApprovalError>;

    async fn try_auto_approve(&self, session_id: &SessionId, question: &str) -> AutoApproval;

    /// Deliver an answer. Without a prompt id the oldest pending prompt of
    /// the session is answered. Returns false when nothing was waiting.
    fn answer(&self, session_id: &SessionId, prompt_id: Option<&str>, value: &str) -> bool;

    /// Release every pending wait of the session with [`ApprovalError::Cancelled`].
    fn cancel_session(&self, session_id: &SessionId);
}

/// Pure auto-approval rules for tool-approval questions.
pub fn evaluate_auto_approval(question: &str) -> AutoApproval {
    let q = question.to_lowercase();
    if let Some(danger) = DANGEROUS_PATTERNS.iter().find(|p| q.contains(*p)) {
        return AutoApproval::Unresolved {
            reason: format!("dangerous pattern detected: {danger}"),
        };
    }
    let resolved = |reason: String| AutoApproval::Resolved {
        answer: ALLOW_OPTION.to_string(),
        reason,
    };
    if READ_MARKERS.iter().any(|m| q.contains(m)) {
        return resolved("read operation".to_string());
    }
    if WRITE_MARKERS.iter().any(|m| q.contains(m)) {
        return resolved("file write/edit".to_string());
    }
    if let Some(safe) = SAFE_COMMANDS.iter().find(|c| q.contains(*c)) {
        return resolved(format!("safe command ({})", safe.trim()));
    }
    resolved("no dangerous pattern detected".to_string())
}

pub fn answer_allows(answer: &str) -> bool {
    let answer = answer.trim().to_ascii_lowercase();
    AFFIRMATIVE_ANSWERS.contains(&answer.as_str())
}

struct PendingPrompt {
    request: PromptRequest,
    tx: oneshot::Sender<String>,
}

pub struct PromptQueue {
    pending: StdMutex<Vec<PendingPrompt>>,
    announcements: broadcast::Sender<PromptRequest>,
}

impl Default for PromptQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl PromptQueue {
    pub fn new() -> Self {
        let (announcements, _) = broadcast::channel(PROMPT_ANNOUNCE_CAPACITY);
        Self {
            pending: StdMutex::new(Vec::new()),
            announcements,
        }
    }

    /// New prompts are announced here as they are queued.
    pub fn subscribe(&self) -> broadcast::Receiver<PromptRequest> {
        self.announcements.subscribe()
    }

    pub fn pending(&self) -> Vec<PromptRequest> {
        match self.pending.lock() {
            Ok(pending) => pending
                .iter()
                .filter(|p| !p.tx.is_closed())
                .map(|p| p.request.clone())
                .collect(),
            Err(_) => Vec::new(),
        }
    }
}

#[async_trait]
impl ApprovalQueue for PromptQueue {
    async fn enqueue_and_wait(
        &self,
        session_id: &SessionId,
        question: &str,
        options: &[String],
    ) -> Result<String, ApprovalError> {
        let request = PromptRequest {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.clone(),
            question: question.to_string(),
            options: options.to_vec(),
            created_at: Utc::now(),
        };
        let prompt_id = request.id.clone();
        let (tx, rx) = oneshot::channel();
        match self.pending.lock() {
            Ok(mut pending) => pending.push(PendingPrompt {
                request: request.clone(),
                tx,
            }),
            Err(_) => return Err(ApprovalError::Cancelled { prompt_id }),
        }
        tracing::info!(session_id = %session_id, prompt_id = %prompt_id, "prompt queued");
        let _ = self.announcements.send(request);
        rx.await.map_err(|_| ApprovalError::Cancelled { prompt_id })
    }

    async fn try_auto_approve(&self, session_id: &SessionId, question: &str) -> AutoApproval {
        let outcome = evaluate_auto_approval(question);
        match &outcome {
            AutoApproval::Resolved { reason, .. } => {
                tracing::info!(session_id = %session_id, reason = %reason, "prompt auto-approved");
            }
            AutoApproval::Unresolved { reason } => {
                tracing::info!(session_id = %session_id, reason = %reason, "prompt escalated");
            }
        }
        outcome
    }

    fn answer(&self, session_id: &SessionId, prompt_id: Option<&str>, value: &str) -> bool {
        let Ok(mut pending) = self.pending.lock() else {
            return false;
        };
        // Waiters that went away (cancelled gate checks) are skipped.
        pending.retain(|p| !p.tx.is_closed());
        let position = pending.iter().position(|p| {
            &p.request.session_id == session_id
                && prompt_id.is_none_or(|id| p.request.id == id)
        });
        let Some(position) = position else {
            return false;
        };
        let prompt = pending.remove(position);
        prompt.tx.send(value.to_string()).is_ok()
    }

    fn cancel_session(&self, session_id: &SessionId) {
        if let Ok(mut pending) = self.pending.lock() {
            // Dropping the senders wakes the waiters with `Cancelled`.
            pending.retain(|p| &p.request.session_id != session_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn dangerous_commands_escalate() {
        assert!(matches!(
            evaluate_auto_approval("Bash: rm -rf /tmp/project"),
            AutoApproval::Unresolved { .. }
        ));
        assert!(matches!(
            evaluate_auto_approval("Bash: git push --force origin main"),
            AutoApproval::Unresolved { .. }
        ));
    }

    #[test]
    fn routine_tools_resolve_to_allow() {
        for question in ["Read: src/lib.rs", "Edit: README.md", "Bash: git status", "Bash: make"] {
            match evaluate_auto_approval(question) {
                AutoApproval::Resolved { answer, .. } => assert_eq!(answer, ALLOW_OPTION),
                other => panic!("expected {question} to resolve, got {other:?}"),
            }
        }
    }

    #[test]
    fn answer_mapping() {
        assert!(answer_allows("Allow"));
        assert!(answer_allows(" 1 "));
        assert!(answer_allows("yes"));
        assert!(!answer_allows("Deny"));
        assert!(!answer_allows("2"));
        assert!(!answer_allows(""));
    }

    #[tokio::test]
    async fn answer_wakes_the_waiter() {
        let queue = Arc::new(PromptQueue::new());
        let session = SessionId::from("s1");
        let mut announced = queue.subscribe();

        let waiter = tokio::spawn({
            let queue = Arc::clone(&queue);
            let session = session.clone();
            async move {
                queue
                    .enqueue_and_wait(&session, "Bash: make", &[ALLOW_OPTION.to_string()])
                    .await
            }
        });

        let prompt = announced.recv().await.unwrap();
        assert_eq!(prompt.session_id, session);
        assert_eq!(queue.pending().len(), 1);
        assert!(queue.answer(&session, Some(&prompt.id), "Allow"));
        assert_eq!(waiter.await.unwrap(), Ok("Allow".to_string()));
        assert!(!queue.answer(&session, None, "Allow"));
    }

    #[tokio::test]
    async fn cancel_session_releases_waiters() {
        let queue = Arc::new(PromptQueue::new());
        let session = SessionId::from("s1");
        let mut announced = queue.subscribe();
        let waiter = tokio::spawn({
            let queue = Arc::clone(&queue);
            let session = session.clone();
            async move { queue.enqueue_and_wait(&session, "Bash: make", &[]).await }
        });
        let _ = announced.recv().await.unwrap();

        queue.cancel_session(&session);
        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(ApprovalError::Cancelled { .. })));
    }

    #[tokio::test]
    async fn answers_only_reach_their_own_session() {
        let queue = Arc::new(PromptQueue::new());
        let mut announced = queue.subscribe();
        let _waiter = tokio::spawn({
            let queue = Arc::clone(&queue);
            async move {
                queue
                    .enqueue_and_wait(&SessionId::from("a"), "Bash: make", &[])
                    .await
            }
        });
        let _ = announced.recv().await.unwrap();
        assert!(!queue.answer(&SessionId::from("b"), None, "Allow"));
        assert!(queue.answer(&SessionId::from("a"), None, "Allow"));
    }
}
