//! Shared types for the orchestration workspace.
//!
//! Every other crate speaks in terms of these types: the durable
//! [`WorkInstance`] record and its [`HistoryEntry`] log, the
//! [`EventEnvelope`] carried by the outbox, the [`WaitRegistration`]s the
//! engine derives on replay, and the [`OrchestrationEvent`]s published on
//! the [`EventBus`].

pub mod configs;
pub mod envelope;
pub mod events;
pub mod history;
pub mod instance;
pub mod registration;
pub mod status;

pub use configs::*;
pub use envelope::*;
pub use events::*;
pub use history::*;
pub use instance::*;
pub use registration::*;
pub use status::*;
