/// tgstream - chat message stream client
///
/// Keeps the selected conversation's messages loaded, ordered and
/// de-duplicated while history pages in from a REST backend and new
/// messages arrive over a live WebSocket channel.

pub mod error;
pub mod config;
pub mod message_types;
pub mod window;
pub mod source;
pub mod controller;
pub mod connection;
pub mod viewport;
pub mod utils;
pub mod cli_app;

pub use error::{StreamError, Result};
pub use config::Config;
pub use controller::{LoadOutcome, MessageStreamController, StreamState};
pub use connection::ConnectionManager;
pub use window::{merge_incoming, ConversationWindow};
