//! Data models for the customer-service backend.
//!
//! - `UserProfile`: the signed-in agent, kept as the backend sent it
//! - `Conversation`, `TransferRequest`: queue entries and the transfer action body
//! - `QueueFilters`, `QueuePage`: queue query parameters and paginated results

pub mod conversation;
pub mod queue;
pub mod user;

pub use conversation::{Conversation, ConversationId, TransferRequest};
pub use queue::{QueueFilters, QueuePage, ALL_FEMININE, ALL_MASCULINE, DEFAULT_PAGE_SIZE};
pub use user::UserProfile;
