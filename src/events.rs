//! Session event subscriptions exposed to the UI layer

use crate::error::Result;
use crate::types::{DeliveryWarning, MessageReceived, PartnerLeft, SearchExpired, StateChanged};
use async_trait::async_trait;
use tracing::{info, warn};

/// Trait for delivering session events to the interface layer
#[async_trait]
pub trait SessionEventSink: Send + Sync {
    /// The session moved between lifecycle states
    async fn state_changed(&self, event: StateChanged) -> Result<()>;

    /// A partner message was appended to the log
    async fn message_received(&self, event: MessageReceived) -> Result<()>;

    /// The partner ended the chat or disconnected
    async fn partner_left(&self, event: PartnerLeft) -> Result<()>;

    /// An outbound message could not be delivered (transient warning)
    async fn delivery_warning(&self, event: DeliveryWarning) -> Result<()>;

    /// A configured search timeout elapsed without a match
    async fn search_expired(&self, event: SearchExpired) -> Result<()>;
}

/// Event sink that records everything to the tracing log
///
/// Used by the service binary, where no interactive UI is attached.
#[derive(Debug, Default)]
pub struct LoggingEventSink;

impl LoggingEventSink {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SessionEventSink for LoggingEventSink {
    async fn state_changed(&self, event: StateChanged) -> Result<()> {
        info!(
            "Session {} ({}) moved {} -> {}",
            event.session_id, event.user_id, event.previous, event.current
        );
        Ok(())
    }

    async fn message_received(&self, event: MessageReceived) -> Result<()> {
        info!(
            "Session {} received message #{} ({} chars)",
            event.session_id,
            event.message.message_id,
            event.message.text.len()
        );
        Ok(())
    }

    async fn partner_left(&self, event: PartnerLeft) -> Result<()> {
        info!(
            "Session {}: partner '{}' left the chat",
            event.session_id, event.partner.name
        );
        Ok(())
    }

    async fn delivery_warning(&self, event: DeliveryWarning) -> Result<()> {
        warn!(
            "Session {}: message delivery failed ({})",
            event.session_id, event.reason
        );
        Ok(())
    }

    async fn search_expired(&self, event: SearchExpired) -> Result<()> {
        info!(
            "Session {}: no match found after {}s",
            event.session_id, event.waited_seconds
        );
        Ok(())
    }
}

/// Mock event sink for testing
#[derive(Debug, Default)]
pub struct MockEventSink {
    events: std::sync::Mutex<Vec<String>>,
    messages: std::sync::Mutex<Vec<MessageReceived>>,
    transitions: std::sync::Mutex<Vec<StateChanged>>,
}

impl MockEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get all recorded event types in arrival order (for testing)
    pub fn event_types(&self) -> Vec<String> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Count events of a specific type (for testing)
    pub fn count_events_of_type(&self, event_type: &str) -> usize {
        self.event_types()
            .iter()
            .filter(|e| e.as_str() == event_type)
            .count()
    }

    /// Get recorded message_received payloads (for testing)
    pub fn received_messages(&self) -> Vec<MessageReceived> {
        self.messages.lock().map(|m| m.clone()).unwrap_or_default()
    }

    /// Get recorded state transitions (for testing)
    pub fn state_transitions(&self) -> Vec<StateChanged> {
        self.transitions
            .lock()
            .map(|t| t.clone())
            .unwrap_or_default()
    }

    fn record(&self, event_type: &str) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event_type.to_string());
        }
    }
}

#[async_trait]
impl SessionEventSink for MockEventSink {
    async fn state_changed(&self, event: StateChanged) -> Result<()> {
        self.record("StateChanged");
        if let Ok(mut transitions) = self.transitions.lock() {
            transitions.push(event);
        }
        Ok(())
    }

    async fn message_received(&self, event: MessageReceived) -> Result<()> {
        self.record("MessageReceived");
        if let Ok(mut messages) = self.messages.lock() {
            messages.push(event);
        }
        Ok(())
    }

    async fn partner_left(&self, _event: PartnerLeft) -> Result<()> {
        self.record("PartnerLeft");
        Ok(())
    }

    async fn delivery_warning(&self, _event: DeliveryWarning) -> Result<()> {
        self.record("DeliveryWarning");
        Ok(())
    }

    async fn search_expired(&self, _event: SearchExpired) -> Result<()> {
        self.record("SearchExpired");
        Ok(())
    }
}
