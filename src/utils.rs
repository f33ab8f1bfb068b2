//! Utility functions for the live match service

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Generate a new unique session ID
pub fn generate_session_id() -> Uuid {
    Uuid::new_v4()
}

/// Generate a new unique channel endpoint ID
pub fn generate_channel_id() -> Uuid {
    Uuid::new_v4()
}

/// Get the current UTC timestamp
pub fn current_timestamp() -> DateTime<Utc> {
    Utc::now()
}

/// Key identifying the channel between two users, independent of direction
pub fn pair_key(a: &str, b: &str) -> String {
    if a <= b {
        format!("{a}::{b}")
    } else {
        format!("{b}::{a}")
    }
}
