//! Wire types shared between the session manager and its callers.
//!
//! Everything in this crate is plain data: configuration accepted on spawn,
//! the status machine, outbound events and the records written to storage.

pub mod config;
pub mod events;
pub mod journal;
pub mod record;
mod session_id;
pub mod status;

pub use config::ApprovalMode;
pub use config::EffortLevel;
pub use config::ExecutionMode;
pub use config::NetworkPolicyConfig;
pub use config::SessionConfig;
pub use config::ToolServerConfig;
pub use events::EventBody;
pub use events::OutboundEvent;
pub use journal::JournalEntry;
pub use journal::JournalEntryKind;
pub use record::HealthSnapshot;
pub use record::SessionHandle;
pub use record::SessionRecord;
pub use session_id::SessionId;
pub use status::SessionStatus;
