//! Chat domain model: message records, the conversation store, and the
//! stream event vocabulary providers map into.

pub mod events;
pub mod message;
pub mod store;

pub use events::{ResponseFragment, StreamEvent};
pub use message::{ChatMessage, MessageId, MessagePatch, Role};
pub use store::{ConversationSnapshot, ConversationStore};
