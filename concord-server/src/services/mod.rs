//! Business-logic services over the stores.
//!
//! Each service owns its slice of the data model and publishes cache
//! invalidations for the list prefixes it serves. Cross-service references
//! go by id only.

pub mod auth;
pub mod chat;
pub mod friend;
pub mod guild;

pub use auth::AuthService;
pub use chat::{ChatEvent, ChatService, Notifier};
pub use friend::FriendService;
pub use guild::GuildService;
