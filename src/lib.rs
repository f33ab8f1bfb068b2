//! Campus Match - Live match service for spontaneous student chats
//!
//! This crate pairs students uniformly at random from a shared candidate
//! pool and manages the resulting one-on-one chat sessions: the search
//! lifecycle, the ordered message log, and partner departure handling.

pub mod channel;
pub mod config;
pub mod error;
pub mod events;
pub mod metrics;
pub mod pool;
pub mod service;
pub mod session;
pub mod types;
pub mod utils;

// Re-export commonly used types and traits
pub use error::{LiveMatchError, Result};
pub use types::*;

// Re-export key components
pub use channel::{ChannelProvider, InProcessChannelRouter};
pub use events::SessionEventSink;
pub use pool::{CandidatePool, InMemoryCandidatePool};
pub use session::{MatchSessionManager, SessionInstance};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
