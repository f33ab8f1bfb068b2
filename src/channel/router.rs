//! In-process channel router pairing two matched endpoints
//!
//! Endpoints are keyed by the unordered user-id pair. Messages ride the
//! receiving session's signal queue, which preserves per-sender FIFO order;
//! the two senders' streams interleave in arrival order with no cross-sender
//! total order.

use crate::error::{LiveMatchError, Result};
use crate::types::{ChannelId, SessionId, SessionSignal, SignalSender, UserId};
use crate::utils::{current_timestamp, generate_channel_id, pair_key};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

use super::{ChannelHandle, ChannelProvider};

struct Endpoint {
    id: ChannelId,
    user_id: UserId,
    inbound: SignalSender,
}

/// Router delivering messages between matched users in the same process
#[derive(Default)]
pub struct InProcessChannelRouter {
    pairs: Mutex<HashMap<String, Vec<Endpoint>>>,
}

impl InProcessChannelRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of pair keys with at least one open endpoint
    pub fn open_pairs(&self) -> usize {
        self.pairs.lock().map(|pairs| pairs.len()).unwrap_or(0)
    }

    fn lock_pairs(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Vec<Endpoint>>>> {
        self.pairs
            .lock()
            .map_err(|_| {
                LiveMatchError::InternalError {
                    message: "Failed to acquire channel router lock".to_string(),
                }
                .into()
            })
    }
}

#[async_trait]
impl ChannelProvider for InProcessChannelRouter {
    async fn open(
        &self,
        _session_id: SessionId,
        self_id: &UserId,
        partner_id: &UserId,
        inbound: SignalSender,
    ) -> Result<ChannelHandle> {
        let key = pair_key(self_id, partner_id);
        let mut pairs = self.lock_pairs()?;
        let endpoints = pairs.entry(key.clone()).or_default();

        // A reopened endpoint for the same user replaces the stale one
        endpoints.retain(|endpoint| endpoint.user_id != *self_id);

        let id = generate_channel_id();
        endpoints.push(Endpoint {
            id,
            user_id: self_id.clone(),
            inbound,
        });

        debug!("Opened channel endpoint for '{}' on pair {}", self_id, key);
        Ok(ChannelHandle {
            id,
            owner: self_id.clone(),
            key,
        })
    }

    async fn send(&self, handle: &ChannelHandle, text: &str) -> Result<()> {
        let pairs = self.lock_pairs()?;

        let endpoints = pairs
            .get(&handle.key)
            .ok_or_else(|| LiveMatchError::ChannelClosed {
                reason: format!("no endpoints on pair {}", handle.key),
            })?;

        let own = endpoints
            .iter()
            .find(|endpoint| endpoint.id == handle.id)
            .ok_or_else(|| LiveMatchError::ChannelClosed {
                reason: "sending endpoint already closed".to_string(),
            })?;

        let peer = endpoints
            .iter()
            .find(|endpoint| endpoint.user_id != handle.owner);

        let delivered = match peer {
            Some(peer) => peer
                .inbound
                .send(SessionSignal::MessageArrived {
                    text: text.to_string(),
                    sent_at: current_timestamp(),
                })
                .is_ok(),
            None => false,
        };

        if !delivered {
            // Fire-and-forget contract: report asynchronously on the
            // sender's own queue instead of failing the call
            let _ = own.inbound.send(SessionSignal::DeliveryFailed {
                reason: "partner endpoint not reachable".to_string(),
            });
        }

        Ok(())
    }

    async fn close(&self, handle: &ChannelHandle) -> Result<()> {
        let mut pairs = self.lock_pairs()?;

        if let Some(endpoints) = pairs.get_mut(&handle.key) {
            endpoints.retain(|endpoint| endpoint.id != handle.id);

            if let Some(peer) = endpoints
                .iter()
                .find(|endpoint| endpoint.user_id != handle.owner)
            {
                let _ = peer.inbound.send(SessionSignal::PeerClosed);
            }

            if endpoints.is_empty() {
                pairs.remove(&handle.key);
            }
        }

        debug!("Closed channel endpoint for '{}'", handle.owner);
        Ok(())
    }
}
