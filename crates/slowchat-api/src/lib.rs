pub mod auth;
pub mod chats;
pub mod error;
pub mod messages;
pub mod middleware;
pub mod oauth;
pub mod reactions;
pub mod router;
pub mod state;
pub mod users;


pub use router::app;
pub use state::{AppState, AppStateInner, AuthSettings};
