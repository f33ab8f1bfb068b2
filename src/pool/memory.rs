//! In-memory candidate pool with atomic uniform-random pairing
//!
//! All mutation happens under a single lock acquisition, so two searchers can
//! never be handed the same third party and no user can be matched twice.

use crate::error::{LiveMatchError, Result};
use crate::types::{Candidate, SessionSignal, SignalSender, UserId};
use async_trait::async_trait;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, warn};

use super::CandidatePool;

struct PoolEntry {
    candidate: Candidate,
    signals: SignalSender,
}

/// Process-local candidate pool shared by every session manager
#[derive(Default)]
pub struct InMemoryCandidatePool {
    entries: Mutex<HashMap<UserId, PoolEntry>>,
}

impl InMemoryCandidatePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove entries whose session queue has gone away (user navigated away
    /// or logged out without cancelling). Returns how many were removed.
    pub fn prune_disconnected(&self) -> usize {
        let mut entries = match self.entries.lock() {
            Ok(entries) => entries,
            Err(_) => return 0,
        };

        let before = entries.len();
        entries.retain(|user_id, entry| {
            let alive = !entry.signals.is_closed();
            if !alive {
                debug!("Pruning disconnected candidate '{}'", user_id);
            }
            alive
        });
        before - entries.len()
    }

    /// Pick a uniform-random searching user other than `exclude`
    ///
    /// Candidates with a closed signal queue are skipped; the caller prunes
    /// them on the next sweep.
    fn pick_partner(
        entries: &mut HashMap<UserId, PoolEntry>,
        exclude: &UserId,
    ) -> Option<PoolEntry> {
        let eligible: Vec<UserId> = entries
            .iter()
            .filter(|(user_id, entry)| *user_id != exclude && !entry.signals.is_closed())
            .map(|(user_id, _)| user_id.clone())
            .collect();

        if eligible.is_empty() {
            return None;
        }

        let index = rand::thread_rng().gen_range(0..eligible.len());
        entries.remove(&eligible[index])
    }
}

#[async_trait]
impl CandidatePool for InMemoryCandidatePool {
    async fn register_searching(&self, candidate: Candidate, signals: SignalSender) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| LiveMatchError::PoolUnavailable {
                reason: "Failed to acquire candidate pool lock".to_string(),
            })?;

        // Re-registering replaces any stale entry for the same user
        if entries.remove(&candidate.user_id).is_some() {
            debug!(
                "Replacing stale pool entry for user '{}'",
                candidate.user_id
            );
        }

        // Try partners until one accepts the notification or none remain;
        // both removals below happen under the same lock, which is what makes
        // the pairing atomic with respect to other registrations.
        while let Some(partner) = Self::pick_partner(&mut entries, &candidate.user_id) {
            let to_partner = SessionSignal::MatchFound {
                partner: candidate.clone(),
                greeting: None,
            };
            if partner.signals.send(to_partner).is_err() {
                debug!(
                    "Candidate '{}' vanished before pairing, trying another",
                    partner.candidate.user_id
                );
                continue;
            }

            let to_self = SessionSignal::MatchFound {
                partner: partner.candidate.clone(),
                greeting: None,
            };
            if signals.send(to_self).is_err() {
                // Our side went away after the partner was already told; the
                // partner's session will discover this via delivery failures.
                warn!(
                    "User '{}' disconnected while being paired with '{}'",
                    candidate.user_id, partner.candidate.user_id
                );
            } else {
                debug!(
                    "Paired '{}' with '{}'",
                    candidate.user_id, partner.candidate.user_id
                );
            }
            return Ok(());
        }

        debug!(
            "No partner available, user '{}' is now waiting",
            candidate.user_id
        );
        entries.insert(candidate.user_id.clone(), PoolEntry { candidate, signals });
        Ok(())
    }

    async fn cancel_searching(&self, user_id: &UserId) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| LiveMatchError::PoolUnavailable {
                reason: "Failed to acquire candidate pool lock".to_string(),
            })?;

        // Absent means the user was already matched or never registered
        if entries.remove(user_id).is_none() {
            debug!("Cancel for user '{}' found no pool entry", user_id);
        }
        Ok(())
    }

    async fn searching_count(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }
}
