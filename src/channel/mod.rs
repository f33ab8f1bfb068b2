//! Message channel: the delivery path between two matched users
//!
//! The wire protocol is delegated; this module defines the session-facing
//! contract (open, fire-and-forget send, close, plus asynchronous inbound
//! signals) and an in-process implementation satisfying the per-sender FIFO
//! ordering guarantee.

pub mod router;

pub use router::InProcessChannelRouter;

use crate::error::Result;
use crate::types::{ChannelId, SessionId, SignalSender, UserId};
use async_trait::async_trait;

/// Handle to one side of an open channel
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    pub id: ChannelId,
    pub owner: UserId,
    pub key: String,
}

/// Trait for opening and using message channels between matched users
#[async_trait]
pub trait ChannelProvider: Send + Sync {
    /// Open this side's endpoint; the partner's messages and peer-close
    /// notifications arrive on `inbound`.
    async fn open(
        &self,
        session_id: SessionId,
        self_id: &UserId,
        partner_id: &UserId,
        inbound: SignalSender,
    ) -> Result<ChannelHandle>;

    /// Forward a message to the partner, fire-and-forget: delivery failure is
    /// reported later as a `SessionSignal::DeliveryFailed` on the sender's
    /// own queue, not as an error here.
    async fn send(&self, handle: &ChannelHandle, text: &str) -> Result<()>;

    /// Close this side's endpoint and notify a still-connected peer
    async fn close(&self, handle: &ChannelHandle) -> Result<()>;
}

/// Mock channel provider for testing
#[derive(Debug, Default)]
pub struct MockChannelProvider {
    opened: std::sync::Mutex<Vec<(UserId, UserId)>>,
    sent: std::sync::Mutex<Vec<String>>,
    closed: std::sync::Mutex<Vec<ChannelId>>,
}

impl MockChannelProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn opened(&self) -> Vec<(UserId, UserId)> {
        self.opened.lock().map(|o| o.clone()).unwrap_or_default()
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn closed_count(&self) -> usize {
        self.closed.lock().map(|c| c.len()).unwrap_or(0)
    }
}

#[async_trait]
impl ChannelProvider for MockChannelProvider {
    async fn open(
        &self,
        _session_id: SessionId,
        self_id: &UserId,
        partner_id: &UserId,
        _inbound: SignalSender,
    ) -> Result<ChannelHandle> {
        if let Ok(mut opened) = self.opened.lock() {
            opened.push((self_id.clone(), partner_id.clone()));
        }
        Ok(ChannelHandle {
            id: crate::utils::generate_channel_id(),
            owner: self_id.clone(),
            key: crate::utils::pair_key(self_id, partner_id),
        })
    }

    async fn send(&self, _handle: &ChannelHandle, text: &str) -> Result<()> {
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(text.to_string());
        }
        Ok(())
    }

    async fn close(&self, handle: &ChannelHandle) -> Result<()> {
        if let Ok(mut closed) = self.closed.lock() {
            closed.push(handle.id);
        }
        Ok(())
    }
}
