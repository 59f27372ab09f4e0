//! Root of the `mission-core` library.
//!
//! Spawns and supervises coding-agent sessions across three execution
//! backends, gates every tool use through the permission policy and streams
//! redacted session events to subscribers.

// Prevent accidental direct writes to stdout/stderr in library code. All
// user-visible output must go through the event stream or tracing.
#![deny(clippy::print_stdout, clippy::print_stderr)]

pub mod agent;
pub mod approval;
pub mod backend;
pub mod config;
mod error;
mod manager;
pub mod network_policy;
pub mod permission;
pub mod redact;
mod session;
pub mod store;
mod supervisor;
pub mod terminal_text;

pub use approval::ApprovalQueue;
pub use approval::PromptQueue;
pub use approval::PromptRequest;
pub use config::ManagerConfig;
pub use error::SessionError;
pub use manager::Backends;
pub use manager::KILLED_BY_USER;
pub use manager::ManagerServices;
pub use manager::SERVER_SHUTDOWN;
pub use manager::SessionManager;
pub use redact::SecretRedactor;
pub use session::OutputBuffer;
pub use session::Session;
pub use session::SessionSnapshot;
pub use store::InMemorySessionStore;
pub use store::JsonFileSessionStore;
pub use store::SessionStore;
pub use supervisor::RestartDecision;
pub use supervisor::RestartPolicy;
pub use supervisor::decide as decide_restart;
