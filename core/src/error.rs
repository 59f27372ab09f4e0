use mission_protocol::SessionId;
use mission_protocol::SessionStatus;
use thiserror::Error;

/// Errors returned by the manager's control calls.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session config is missing a working directory")]
    MissingCwd,
    #[error("invalid session config: {reason}")]
    InvalidConfig { reason: String },
    #[error("session {session_id} already exists")]
    AlreadyExists { session_id: SessionId },
    #[error("unknown session id {session_id}")]
    UnknownSession { session_id: SessionId },
    #[error("session {session_id} already has an active run")]
    Busy { session_id: SessionId },
    #[error("session {session_id} is {status} and cannot accept input")]
    NotAccepting {
        session_id: SessionId,
        status: SessionStatus,
    },
    #[error("session {session_id} has no pending prompt to answer")]
    NoPendingPrompt { session_id: SessionId },
    #[error("failed to write input to session {session_id}")]
    WriteInput { session_id: SessionId },
}

impl SessionError {
    pub(crate) fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    pub(crate) fn unknown(session_id: &SessionId) -> Self {
        Self::UnknownSession {
            session_id: session_id.clone(),
        }
    }
}
