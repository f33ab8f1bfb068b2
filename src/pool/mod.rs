//! Candidate pool: the set of users currently willing to be matched
//!
//! The pool is shared across all users' sessions. Its contract with the
//! session manager is limited to request-pairing, cancel-pairing, and the
//! asynchronous match-found signal delivered on the session's queue.

pub mod memory;

pub use memory::InMemoryCandidatePool;

use crate::error::Result;
use crate::types::{Candidate, SignalSender, UserId};
use async_trait::async_trait;

/// Trait for the shared pool of searching users
#[async_trait]
pub trait CandidatePool: Send + Sync {
    /// Register a user as searching; a resolved pairing arrives later as a
    /// `SessionSignal::MatchFound` on `signals`, never as a return value.
    async fn register_searching(&self, candidate: Candidate, signals: SignalSender) -> Result<()>;

    /// Withdraw a user from the pool. Withdrawing a user who is no longer
    /// registered (already matched, or never registered) is a no-op.
    async fn cancel_searching(&self, user_id: &UserId) -> Result<()>;

    /// Number of users currently waiting for a partner
    async fn searching_count(&self) -> usize;
}

/// Mock candidate pool for testing
#[derive(Debug, Default)]
pub struct MockCandidatePool {
    registered: std::sync::Mutex<Vec<Candidate>>,
    cancelled: std::sync::Mutex<Vec<UserId>>,
}

impl MockCandidatePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Candidates registered so far (for testing)
    pub fn registered(&self) -> Vec<Candidate> {
        self.registered
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    /// User IDs withdrawn so far (for testing)
    pub fn cancelled(&self) -> Vec<UserId> {
        self.cancelled.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl CandidatePool for MockCandidatePool {
    async fn register_searching(&self, candidate: Candidate, _signals: SignalSender) -> Result<()> {
        if let Ok(mut registered) = self.registered.lock() {
            registered.push(candidate);
        }
        Ok(())
    }

    async fn cancel_searching(&self, user_id: &UserId) -> Result<()> {
        if let Ok(mut cancelled) = self.cancelled.lock() {
            cancelled.push(user_id.clone());
        }
        Ok(())
    }

    async fn searching_count(&self) -> usize {
        self.registered.lock().map(|r| r.len()).unwrap_or(0)
    }
}
