use serde::Deserialize;
use serde::Serialize;
use strum_macros::Display;
use strum_macros::EnumString;

/// Lifecycle of a session.
///
/// `starting -> working <-> waiting_for_input -> {idle, done, error}`.
/// `idle` goes back to `working` on a follow-up message and `error` goes back
/// to `working` when the restart supervisor re-invokes the backend.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SessionStatus {
    Starting,
    Working,
    WaitingForInput,
    Idle,
    Done,
    Error,
}

impl SessionStatus {
    /// True while a backend owns the session.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Starting | Self::Working | Self::WaitingForInput)
    }

    /// Statuses that `kill_all` leaves untouched.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }

    /// Statuses from which a `respond` call starts a new turn.
    pub fn accepts_follow_up(self) -> bool {
        matches!(self, Self::Idle | Self::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::str::FromStr;

    #[test]
    fn status_serializes_as_snake_case() {
        let json = serde_json::to_string(&SessionStatus::WaitingForInput).unwrap();
        assert_eq!(json, "\"waiting_for_input\"");
        assert_eq!(SessionStatus::WaitingForInput.to_string(), "waiting_for_input");
        assert_eq!(
            SessionStatus::from_str("idle").unwrap(),
            SessionStatus::Idle
        );
    }

    #[test]
    fn only_idle_and_done_accept_follow_ups() {
        assert!(SessionStatus::Idle.accepts_follow_up());
        assert!(SessionStatus::Done.accepts_follow_up());
        assert!(!SessionStatus::Error.accepts_follow_up());
        assert!(!SessionStatus::Working.accepts_follow_up());
    }
}
