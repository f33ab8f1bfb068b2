//! Session state machine and orchestration

pub mod instance;
pub mod manager;

pub use instance::SessionInstance;
pub use manager::{MatchSessionManager, SessionStats};
