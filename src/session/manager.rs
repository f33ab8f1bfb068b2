//! Session orchestration
//!
//! `MatchSessionManager` owns one user's `SessionInstance` and wires it to the
//! candidate pool, the message channel, and the event sink. Collaborators
//! never touch the instance directly: everything asynchronous arrives as a
//! `SessionSignal` on the session's queue, and a single background task drains
//! that queue one signal at a time while user-facing operations share the same
//! lock. Within a session nothing ever runs concurrently.

use crate::channel::{ChannelHandle, ChannelProvider};
use crate::error::{LiveMatchError, Result};
use crate::events::SessionEventSink;
use crate::metrics::MetricsCollector;
use crate::pool::CandidatePool;
use crate::session::instance::SessionInstance;
use crate::types::{
    Candidate, ChatMessage, DeliveryWarning, EndReason, MessageReceived, PartnerLeft,
    SearchExpired, SessionId, SessionSignal, SessionState, SignalReceiver, SignalSender,
    StateChanged, StudentProfile, UserId,
};
use crate::utils::current_timestamp;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

/// Mutable session state guarded by one lock
///
/// The instance, the channel endpoint, and the search generation move
/// together; holding them under a single mutex is what makes skip and
/// cancel atomic with respect to incoming signals.
struct SessionInner {
    instance: SessionInstance,
    channel_handle: Option<ChannelHandle>,
    /// Incremented every time a search starts or stops; timeout timers carry
    /// the generation they were armed with so stale timers can be ignored
    generation: u64,
    search_started: Option<Instant>,
}

/// Snapshot of one session for the stats endpoint
#[derive(Debug, Clone, serde::Serialize)]
pub struct SessionStats {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub state: SessionState,
    pub message_count: usize,
    pub partner_name: Option<String>,
}

/// Manages one user's live match session end to end
pub struct MatchSessionManager {
    user_id: UserId,
    profile: StudentProfile,
    pool: Arc<dyn CandidatePool>,
    channel: Arc<dyn ChannelProvider>,
    events: Arc<dyn SessionEventSink>,
    metrics: Option<Arc<MetricsCollector>>,
    search_timeout: Option<Duration>,
    signal_tx: SignalSender,
    inner: Mutex<SessionInner>,
}

impl MatchSessionManager {
    /// Create a session manager and spawn its signal loop
    pub fn new(
        user_id: impl Into<UserId>,
        profile: StudentProfile,
        pool: Arc<dyn CandidatePool>,
        channel: Arc<dyn ChannelProvider>,
        events: Arc<dyn SessionEventSink>,
        metrics: Option<Arc<MetricsCollector>>,
        search_timeout: Option<Duration>,
    ) -> Arc<Self> {
        let user_id = user_id.into();
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();

        let manager = Arc::new(Self {
            user_id: user_id.clone(),
            profile,
            pool,
            channel,
            events,
            metrics,
            search_timeout,
            signal_tx,
            inner: Mutex::new(SessionInner {
                instance: SessionInstance::new(user_id),
                channel_handle: None,
                generation: 0,
                search_started: None,
            }),
        });

        manager.spawn_signal_loop(signal_rx);
        manager
    }

    /// Sender half of this session's signal queue
    ///
    /// Handed to the pool and the channel at registration time; exposed so
    /// external collaborators can feed signals the same way.
    pub fn signal_sender(&self) -> SignalSender {
        self.signal_tx.clone()
    }

    /// Start searching for a partner
    ///
    /// Valid from Idle and from Ended (which starts a fresh session). The
    /// state change and the pool registration happen under one lock, so a
    /// match can never land on a session that is not Searching.
    pub async fn start_search(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;

        let previous = inner.instance.state();
        inner.instance.begin_search()?;

        inner.generation += 1;
        let generation = inner.generation;
        inner.search_started = Some(Instant::now());

        let candidate = Candidate::new(self.user_id.clone(), self.profile.clone());
        if let Err(e) = self
            .pool
            .register_searching(candidate, self.signal_tx.clone())
            .await
        {
            // Roll back so the session does not wait on a pool it never joined
            let _ = inner.instance.cancel_search();
            inner.search_started = None;
            return Err(e);
        }

        self.arm_search_timer(generation);

        if let Some(metrics) = &self.metrics {
            metrics.record_search_started();
        }

        info!(user_id = %self.user_id, session_id = %inner.instance.id(), "Search started");
        self.emit_state_changed(&inner, previous, SessionState::Searching)
            .await;

        Ok(())
    }

    /// Abandon an outstanding search and return to Idle
    pub async fn cancel_search(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;

        inner.instance.cancel_search()?;
        inner.generation += 1;
        inner.search_started = None;

        if let Err(e) = self.pool.cancel_searching(&self.user_id).await {
            warn!(user_id = %self.user_id, error = %e, "Failed to deregister from pool");
        }

        if let Some(metrics) = &self.metrics {
            metrics.record_search_cancelled();
        }

        info!(user_id = %self.user_id, session_id = %inner.instance.id(), "Search cancelled");
        self.emit_state_changed(&inner, SessionState::Searching, SessionState::Idle)
            .await;

        Ok(())
    }

    /// Send a chat message to the current partner
    ///
    /// Appends to the log and forwards over the channel. Forwarding is
    /// fire-and-forget: a delivery failure comes back later as a
    /// `DeliveryFailed` signal and is surfaced as a warning, never as an
    /// error here and never by ending the session.
    pub async fn send_message(&self, text: &str) -> Result<ChatMessage> {
        let mut inner = self.inner.lock().await;

        let message = inner.instance.append_outgoing(text)?;

        let handle = inner
            .channel_handle
            .as_ref()
            .ok_or(LiveMatchError::ChannelClosed {
                reason: "no open channel for matched session".to_string(),
            })?;

        if let Err(e) = self.channel.send(handle, &message.text).await {
            warn!(user_id = %self.user_id, error = %e, "Outbound send failed");
            let _ = self.signal_tx.send(SessionSignal::DeliveryFailed {
                reason: e.to_string(),
            });
        }

        if let Some(metrics) = &self.metrics {
            metrics.record_message_sent();
        }

        Ok(message)
    }

    /// End the current match and immediately search again
    ///
    /// The old session's log and identity are discarded. Closing the channel,
    /// resetting the instance, and re-registering with the pool all happen
    /// under one lock, so no collaborator observes the intermediate state.
    pub async fn skip(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;

        let skipped = inner.instance.skip_to_search()?;
        inner.generation += 1;
        let generation = inner.generation;
        inner.search_started = Some(Instant::now());

        if let Some(handle) = inner.channel_handle.take() {
            if let Err(e) = self.channel.close(&handle).await {
                warn!(user_id = %self.user_id, error = %e, "Failed to close channel on skip");
            }
        }

        // The old session is already torn down at this point. If the pool
        // rejects the re-registration the session cannot stay Searching with
        // no slot behind it, so it ends instead and the error is surfaced.
        let candidate = Candidate::new(self.user_id.clone(), self.profile.clone());
        if let Err(e) = self
            .pool
            .register_searching(candidate, self.signal_tx.clone())
            .await
        {
            warn!(
                user_id = %self.user_id,
                error = %e,
                "Re-registration failed after skip, ending session"
            );
            inner.instance.finish(EndReason::UserEnded)?;
            inner.generation += 1;
            inner.search_started = None;
            if let Some(metrics) = &self.metrics {
                metrics.record_session_ended(EndReason::UserEnded);
            }
            self.emit_state_changed(&inner, SessionState::Matched, SessionState::Ended)
                .await;
            return Err(e);
        }

        self.arm_search_timer(generation);

        if let Some(metrics) = &self.metrics {
            metrics.record_skip();
            metrics.record_search_started();
        }

        info!(
            user_id = %self.user_id,
            skipped_partner = %skipped.user_id,
            session_id = %inner.instance.id(),
            "Skipped to a new search"
        );
        self.emit_state_changed(&inner, SessionState::Matched, SessionState::Searching)
            .await;

        Ok(())
    }

    /// End the session
    ///
    /// Valid from Matched and Searching. The message log stays readable as a
    /// snapshot after this returns.
    pub async fn end(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;

        let previous = inner.instance.state();
        inner.instance.finish(EndReason::UserEnded)?;
        inner.generation += 1;
        inner.search_started = None;

        if previous == SessionState::Searching {
            if let Err(e) = self.pool.cancel_searching(&self.user_id).await {
                warn!(user_id = %self.user_id, error = %e, "Failed to deregister from pool");
            }
        }

        if let Some(handle) = inner.channel_handle.take() {
            if let Err(e) = self.channel.close(&handle).await {
                warn!(user_id = %self.user_id, error = %e, "Failed to close channel on end");
            }
        }

        if let Some(metrics) = &self.metrics {
            metrics.record_session_ended(EndReason::UserEnded);
        }

        info!(user_id = %self.user_id, session_id = %inner.instance.id(), "Session ended by user");
        self.emit_state_changed(&inner, previous, SessionState::Ended)
            .await;

        Ok(())
    }

    /// Current lifecycle state
    pub async fn current_state(&self) -> SessionState {
        self.inner.lock().await.instance.state()
    }

    /// Current partner, present exactly when Matched
    pub async fn current_partner(&self) -> Option<Candidate> {
        self.inner.lock().await.instance.partner().cloned()
    }

    /// Snapshot of the message log, oldest first
    pub async fn message_log(&self) -> Vec<ChatMessage> {
        self.inner.lock().await.instance.message_log()
    }

    /// Identifier of the current session
    pub async fn session_id(&self) -> SessionId {
        self.inner.lock().await.instance.id()
    }

    /// Stats snapshot for monitoring
    pub async fn stats(&self) -> SessionStats {
        let inner = self.inner.lock().await;
        SessionStats {
            session_id: inner.instance.id(),
            user_id: self.user_id.clone(),
            state: inner.instance.state(),
            message_count: inner.instance.message_log().len(),
            partner_name: inner.instance.partner().map(|p| p.profile.name.clone()),
        }
    }

    fn spawn_signal_loop(self: &Arc<Self>, mut signal_rx: SignalReceiver) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(signal) = signal_rx.recv().await {
                let Some(manager) = weak.upgrade() else { break };
                if let Err(e) = manager.handle_signal(signal).await {
                    error!(user_id = %manager.user_id, error = %e, "Signal handling failed");
                }
            }
            debug!("Session signal loop stopped");
        });
    }

    async fn handle_signal(&self, signal: SessionSignal) -> Result<()> {
        match signal {
            SessionSignal::MatchFound { partner, greeting } => {
                self.handle_match_found(partner, greeting).await
            }
            SessionSignal::MessageArrived { text, sent_at } => {
                self.handle_message_arrived(text, sent_at).await
            }
            SessionSignal::PeerClosed => self.handle_peer_closed().await,
            SessionSignal::DeliveryFailed { reason } => self.handle_delivery_failed(reason).await,
            SessionSignal::SearchTimedOut { generation } => {
                self.handle_search_timed_out(generation).await
            }
        }
    }

    async fn handle_match_found(&self, partner: Candidate, greeting: Option<String>) -> Result<()> {
        let mut inner = self.inner.lock().await;

        // A match resolved while a cancel, skip, or end was racing it lands
        // here after the state already moved on; it is ignored, not an error
        if inner.instance.state() != SessionState::Searching {
            debug!(
                user_id = %self.user_id,
                partner = %partner.user_id,
                state = %inner.instance.state(),
                "Ignoring late match"
            );
            return Ok(());
        }

        // The pool consumed both entries at pairing time, so a failed channel
        // open cannot leave the session Searching with no pool slot behind
        // it. The match is abandoned and the session falls back to Idle.
        let handle = match self
            .channel
            .open(
                inner.instance.id(),
                &self.user_id,
                &partner.user_id,
                self.signal_tx.clone(),
            )
            .await
        {
            Ok(handle) => handle,
            Err(e) => {
                warn!(
                    user_id = %self.user_id,
                    partner = %partner.user_id,
                    error = %e,
                    "Channel open failed, abandoning match"
                );

                let waited_seconds = inner
                    .search_started
                    .take()
                    .map(|s| s.elapsed().as_secs())
                    .unwrap_or_default();
                inner.instance.cancel_search()?;
                inner.generation += 1;

                if let Some(metrics) = &self.metrics {
                    metrics.record_search_expired();
                }

                self.emit_event(
                    self.events
                        .search_expired(SearchExpired {
                            session_id: inner.instance.id(),
                            waited_seconds,
                            timestamp: current_timestamp(),
                        })
                        .await,
                );
                self.emit_state_changed(&inner, SessionState::Searching, SessionState::Idle)
                    .await;
                return Ok(());
            }
        };

        let had_greeting = greeting.as_deref().is_some_and(|g| !g.trim().is_empty());
        inner
            .instance
            .record_match(partner.clone(), greeting.as_deref())?;
        inner.channel_handle = Some(handle);
        inner.generation += 1;

        if let Some(metrics) = &self.metrics {
            let wait = inner
                .search_started
                .take()
                .map(|s| s.elapsed())
                .unwrap_or_default();
            metrics.record_match_made(wait);
        }

        info!(
            user_id = %self.user_id,
            partner = %partner.user_id,
            session_id = %inner.instance.id(),
            "Matched"
        );
        self.emit_state_changed(&inner, SessionState::Searching, SessionState::Matched)
            .await;

        if had_greeting {
            if let Some(message) = inner.instance.message_log().last() {
                self.emit_event(
                    self.events
                        .message_received(MessageReceived {
                            session_id: inner.instance.id(),
                            message: message.clone(),
                        })
                        .await,
                );
            }
        }

        Ok(())
    }

    async fn handle_message_arrived(
        &self,
        text: String,
        sent_at: chrono::DateTime<chrono::Utc>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;

        match inner.instance.append_incoming(&text, sent_at) {
            Some(message) => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_message_received(true);
                }
                self.emit_event(
                    self.events
                        .message_received(MessageReceived {
                            session_id: inner.instance.id(),
                            message,
                        })
                        .await,
                );
            }
            None => {
                // Arrived in the window between the peer sending and this
                // side processing its own termination
                debug!(
                    user_id = %self.user_id,
                    state = %inner.instance.state(),
                    "Discarding message outside a match"
                );
                if let Some(metrics) = &self.metrics {
                    metrics.record_message_received(false);
                }
            }
        }

        Ok(())
    }

    async fn handle_peer_closed(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;

        if inner.instance.state() != SessionState::Matched {
            debug!(
                user_id = %self.user_id,
                state = %inner.instance.state(),
                "Ignoring peer close outside a match"
            );
            return Ok(());
        }

        let partner = inner
            .instance
            .partner()
            .map(|p| p.profile.clone())
            .ok_or(LiveMatchError::InternalError {
                message: "matched session has no partner".to_string(),
            })?;

        inner.instance.finish(EndReason::PartnerLeft)?;
        inner.generation += 1;

        if let Some(handle) = inner.channel_handle.take() {
            if let Err(e) = self.channel.close(&handle).await {
                debug!(user_id = %self.user_id, error = %e, "Channel already gone on peer close");
            }
        }

        if let Some(metrics) = &self.metrics {
            metrics.record_session_ended(EndReason::PartnerLeft);
        }

        info!(user_id = %self.user_id, session_id = %inner.instance.id(), "Partner left");
        self.emit_event(
            self.events
                .partner_left(PartnerLeft {
                    session_id: inner.instance.id(),
                    partner,
                    timestamp: current_timestamp(),
                })
                .await,
        );
        self.emit_state_changed(&inner, SessionState::Matched, SessionState::Ended)
            .await;

        Ok(())
    }

    async fn handle_delivery_failed(&self, reason: String) -> Result<()> {
        let inner = self.inner.lock().await;

        warn!(
            user_id = %self.user_id,
            session_id = %inner.instance.id(),
            reason = %reason,
            "Message delivery failed"
        );

        if let Some(metrics) = &self.metrics {
            metrics.record_delivery_failure();
        }

        self.emit_event(
            self.events
                .delivery_warning(DeliveryWarning {
                    session_id: inner.instance.id(),
                    reason,
                    timestamp: current_timestamp(),
                })
                .await,
        );

        Ok(())
    }

    async fn handle_search_timed_out(&self, generation: u64) -> Result<()> {
        let mut inner = self.inner.lock().await;

        // A timer armed for an earlier search fires after the session moved
        // on; the generation check makes it a no-op
        if generation != inner.generation || inner.instance.state() != SessionState::Searching {
            debug!(user_id = %self.user_id, generation, "Ignoring stale search timer");
            return Ok(());
        }

        inner.instance.cancel_search()?;
        inner.generation += 1;
        inner.search_started = None;

        if let Err(e) = self.pool.cancel_searching(&self.user_id).await {
            warn!(user_id = %self.user_id, error = %e, "Failed to deregister from pool");
        }

        let waited_seconds = self.search_timeout.map(|t| t.as_secs()).unwrap_or_default();

        if let Some(metrics) = &self.metrics {
            metrics.record_search_expired();
        }

        let condition = LiveMatchError::NoMatchFound { waited_seconds };
        info!(user_id = %self.user_id, "Search expired: {}", condition);
        self.emit_event(
            self.events
                .search_expired(SearchExpired {
                    session_id: inner.instance.id(),
                    waited_seconds,
                    timestamp: current_timestamp(),
                })
                .await,
        );
        self.emit_state_changed(&inner, SessionState::Searching, SessionState::Idle)
            .await;

        Ok(())
    }

    fn arm_search_timer(&self, generation: u64) {
        let Some(timeout) = self.search_timeout else {
            return;
        };

        let signal_tx = self.signal_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = signal_tx.send(SessionSignal::SearchTimedOut { generation });
        });
    }

    async fn emit_state_changed(
        &self,
        inner: &SessionInner,
        previous: SessionState,
        current: SessionState,
    ) {
        self.emit_event(
            self.events
                .state_changed(StateChanged {
                    session_id: inner.instance.id(),
                    user_id: self.user_id.clone(),
                    previous,
                    current,
                    timestamp: current_timestamp(),
                })
                .await,
        );
    }

    /// Event sink failures are logged, never propagated into operations
    fn emit_event(&self, result: Result<()>) {
        if let Err(e) = result {
            warn!(user_id = %self.user_id, error = %e, "Event sink failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MockChannelProvider;
    use crate::events::MockEventSink;
    use crate::pool::MockCandidatePool;
    use crate::utils::current_timestamp;

    fn test_profile(name: &str) -> StudentProfile {
        StudentProfile {
            name: name.to_string(),
            university: "Test University".to_string(),
            major: "Computer Science".to_string(),
            interests: vec!["chess".to_string()],
            is_online: true,
        }
    }

    struct Harness {
        manager: Arc<MatchSessionManager>,
        pool: Arc<MockCandidatePool>,
        channel: Arc<MockChannelProvider>,
        events: Arc<MockEventSink>,
    }

    fn harness_with_timeout(search_timeout: Option<Duration>) -> Harness {
        let pool = Arc::new(MockCandidatePool::new());
        let channel = Arc::new(MockChannelProvider::new());
        let events = Arc::new(MockEventSink::new());

        let manager = MatchSessionManager::new(
            "alice",
            test_profile("Alice"),
            pool.clone(),
            channel.clone(),
            events.clone(),
            None,
            search_timeout,
        );

        Harness {
            manager,
            pool,
            channel,
            events,
        }
    }

    fn harness() -> Harness {
        harness_with_timeout(None)
    }

    /// Let the signal loop drain queued signals
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    fn partner_candidate() -> Candidate {
        Candidate::new("bob", test_profile("Bob"))
    }

    async fn matched_harness() -> Harness {
        let h = harness();
        h.manager.start_search().await.unwrap();
        h.manager
            .signal_sender()
            .send(SessionSignal::MatchFound {
                partner: partner_candidate(),
                greeting: None,
            })
            .unwrap();
        settle().await;
        assert_eq!(h.manager.current_state().await, SessionState::Matched);
        h
    }

    #[tokio::test]
    async fn test_start_search_registers_with_pool() {
        let h = harness();

        h.manager.start_search().await.unwrap();

        assert_eq!(h.manager.current_state().await, SessionState::Searching);
        let registered = h.pool.registered();
        assert_eq!(registered.len(), 1);
        assert_eq!(registered[0].user_id, "alice");
        assert_eq!(h.events.count_events_of_type("StateChanged"), 1);
    }

    #[tokio::test]
    async fn test_start_search_while_searching_fails() {
        let h = harness();

        h.manager.start_search().await.unwrap();
        assert!(h.manager.start_search().await.is_err());
        assert_eq!(h.pool.registered().len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_search_deregisters() {
        let h = harness();

        h.manager.start_search().await.unwrap();
        h.manager.cancel_search().await.unwrap();

        assert_eq!(h.manager.current_state().await, SessionState::Idle);
        assert_eq!(h.pool.cancelled(), vec!["alice".to_string()]);
    }

    #[tokio::test]
    async fn test_double_cancel_fails() {
        let h = harness();

        h.manager.start_search().await.unwrap();
        h.manager.cancel_search().await.unwrap();

        assert!(h.manager.cancel_search().await.is_err());
        assert_eq!(h.manager.current_state().await, SessionState::Idle);
    }

    #[tokio::test]
    async fn test_match_found_opens_channel() {
        let h = matched_harness().await;

        let partner = h.manager.current_partner().await.unwrap();
        assert_eq!(partner.user_id, "bob");
        assert_eq!(
            h.channel.opened(),
            vec![("alice".to_string(), "bob".to_string())]
        );
    }

    #[tokio::test]
    async fn test_greeting_seeds_log_as_partner_message() {
        let h = harness();
        h.manager.start_search().await.unwrap();

        h.manager
            .signal_sender()
            .send(SessionSignal::MatchFound {
                partner: partner_candidate(),
                greeting: Some("Hey! Nice to meet you!".to_string()),
            })
            .unwrap();
        settle().await;

        let log = h.manager.message_log().await;
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].sender, crate::types::MessageSender::Partner);
        assert_eq!(log[0].text, "Hey! Nice to meet you!");
        assert_eq!(log[0].message_id, 1);
        assert_eq!(h.events.count_events_of_type("MessageReceived"), 1);
    }

    #[tokio::test]
    async fn test_late_match_after_cancel_is_ignored() {
        let h = harness();

        h.manager.start_search().await.unwrap();
        h.manager.cancel_search().await.unwrap();

        h.manager
            .signal_sender()
            .send(SessionSignal::MatchFound {
                partner: partner_candidate(),
                greeting: None,
            })
            .unwrap();
        settle().await;

        assert_eq!(h.manager.current_state().await, SessionState::Idle);
        assert!(h.manager.current_partner().await.is_none());
        assert!(h.channel.opened().is_empty());
    }

    #[tokio::test]
    async fn test_send_message_appends_and_forwards() {
        let h = matched_harness().await;

        let message = h.manager.send_message("  hello bob  ").await.unwrap();

        assert_eq!(message.text, "hello bob");
        assert_eq!(message.message_id, 1);
        assert_eq!(h.channel.sent(), vec!["hello bob".to_string()]);
        assert_eq!(h.manager.message_log().await.len(), 1);
    }

    #[tokio::test]
    async fn test_send_message_outside_match_fails() {
        let h = harness();

        assert!(h.manager.send_message("hello").await.is_err());

        h.manager.start_search().await.unwrap();
        assert!(h.manager.send_message("hello").await.is_err());
    }

    #[tokio::test]
    async fn test_empty_message_rejected() {
        let h = matched_harness().await;

        assert!(h.manager.send_message("   ").await.is_err());
        assert!(h.manager.message_log().await.is_empty());
    }

    #[tokio::test]
    async fn test_incoming_message_appended_in_order() {
        let h = matched_harness().await;

        h.manager.send_message("hi").await.unwrap();
        h.manager
            .signal_sender()
            .send(SessionSignal::MessageArrived {
                text: "hi back".to_string(),
                sent_at: current_timestamp(),
            })
            .unwrap();
        settle().await;

        let log = h.manager.message_log().await;
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].text, "hi");
        assert_eq!(log[1].text, "hi back");
        assert!(log[0].message_id < log[1].message_id);
    }

    #[tokio::test]
    async fn test_message_after_end_is_discarded() {
        let h = matched_harness().await;

        h.manager.end().await.unwrap();
        h.manager
            .signal_sender()
            .send(SessionSignal::MessageArrived {
                text: "too late".to_string(),
                sent_at: current_timestamp(),
            })
            .unwrap();
        settle().await;

        assert!(h.manager.message_log().await.is_empty());
        assert_eq!(h.events.count_events_of_type("MessageReceived"), 0);
    }

    #[tokio::test]
    async fn test_peer_closed_ends_session_with_partner_left() {
        let h = matched_harness().await;

        h.manager
            .signal_sender()
            .send(SessionSignal::PeerClosed)
            .unwrap();
        settle().await;

        assert_eq!(h.manager.current_state().await, SessionState::Ended);
        assert!(h.manager.current_partner().await.is_none());
        assert_eq!(h.events.count_events_of_type("PartnerLeft"), 1);

        // Already ended by the peer, a local end is now invalid
        assert!(h.manager.end().await.is_err());
        assert_eq!(h.events.count_events_of_type("PartnerLeft"), 1);
    }

    #[tokio::test]
    async fn test_delivery_failure_warns_without_ending() {
        let h = matched_harness().await;

        h.manager.send_message("hello").await.unwrap();
        h.manager
            .signal_sender()
            .send(SessionSignal::DeliveryFailed {
                reason: "partner endpoint gone".to_string(),
            })
            .unwrap();
        settle().await;

        assert_eq!(h.events.count_events_of_type("DeliveryWarning"), 1);
        assert_eq!(h.manager.current_state().await, SessionState::Matched);
        assert_eq!(h.manager.message_log().await.len(), 1);
    }

    #[tokio::test]
    async fn test_skip_discards_log_and_researches() {
        let h = matched_harness().await;
        let old_session = h.manager.session_id().await;

        h.manager.send_message("hello").await.unwrap();
        h.manager.skip().await.unwrap();

        assert_eq!(h.manager.current_state().await, SessionState::Searching);
        assert!(h.manager.message_log().await.is_empty());
        assert_ne!(h.manager.session_id().await, old_session);
        assert_eq!(h.pool.registered().len(), 2);
        assert_eq!(h.channel.closed_count(), 1);
    }

    #[tokio::test]
    async fn test_end_keeps_log_snapshot() {
        let h = matched_harness().await;

        h.manager.send_message("first").await.unwrap();
        h.manager
            .signal_sender()
            .send(SessionSignal::MessageArrived {
                text: "second".to_string(),
                sent_at: current_timestamp(),
            })
            .unwrap();
        settle().await;

        h.manager.end().await.unwrap();

        assert_eq!(h.manager.current_state().await, SessionState::Ended);
        let log = h.manager.message_log().await;
        assert_eq!(log.len(), 2);
        assert_eq!(h.channel.closed_count(), 1);
    }

    #[tokio::test]
    async fn test_restart_after_end_mints_new_session() {
        let h = matched_harness().await;
        let old_session = h.manager.session_id().await;

        h.manager.send_message("bye").await.unwrap();
        h.manager.end().await.unwrap();
        h.manager.start_search().await.unwrap();

        assert_eq!(h.manager.current_state().await, SessionState::Searching);
        assert_ne!(h.manager.session_id().await, old_session);
        assert!(h.manager.message_log().await.is_empty());
    }

    #[tokio::test]
    async fn test_search_timeout_returns_to_idle() {
        let h = harness_with_timeout(Some(Duration::from_millis(30)));

        h.manager.start_search().await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert_eq!(h.manager.current_state().await, SessionState::Idle);
        assert_eq!(h.pool.cancelled(), vec!["alice".to_string()]);
        assert_eq!(h.events.count_events_of_type("SearchExpired"), 1);
    }

    #[tokio::test]
    async fn test_stale_timer_ignored_after_match() {
        let h = harness_with_timeout(Some(Duration::from_millis(40)));

        h.manager.start_search().await.unwrap();
        h.manager
            .signal_sender()
            .send(SessionSignal::MatchFound {
                partner: partner_candidate(),
                greeting: None,
            })
            .unwrap();
        settle().await;
        tokio::time::sleep(Duration::from_millis(80)).await;

        // The timer armed for the search must not disturb the match
        assert_eq!(h.manager.current_state().await, SessionState::Matched);
        assert_eq!(h.events.count_events_of_type("SearchExpired"), 0);
    }

    #[tokio::test]
    async fn test_stats_snapshot() {
        let h = matched_harness().await;
        h.manager.send_message("hello").await.unwrap();

        let stats = h.manager.stats().await;
        assert_eq!(stats.user_id, "alice");
        assert_eq!(stats.state, SessionState::Matched);
        assert_eq!(stats.message_count, 1);
        assert_eq!(stats.partner_name.as_deref(), Some("Bob"));
    }

    /// Channel provider whose open always fails
    struct BrokenChannelProvider;

    #[async_trait::async_trait]
    impl ChannelProvider for BrokenChannelProvider {
        async fn open(
            &self,
            _session_id: SessionId,
            _self_id: &UserId,
            _partner_id: &UserId,
            _inbound: SignalSender,
        ) -> Result<ChannelHandle> {
            Err(LiveMatchError::ChannelClosed {
                reason: "router offline".to_string(),
            }
            .into())
        }

        async fn send(&self, _handle: &ChannelHandle, _text: &str) -> Result<()> {
            Ok(())
        }

        async fn close(&self, _handle: &ChannelHandle) -> Result<()> {
            Ok(())
        }
    }

    /// Pool that accepts the first registration and rejects every later one
    struct SingleShotPool {
        registrations: std::sync::Mutex<u32>,
    }

    impl SingleShotPool {
        fn new() -> Self {
            Self {
                registrations: std::sync::Mutex::new(0),
            }
        }
    }

    #[async_trait::async_trait]
    impl CandidatePool for SingleShotPool {
        async fn register_searching(
            &self,
            _candidate: Candidate,
            _signals: SignalSender,
        ) -> Result<()> {
            let mut count = self.registrations.lock().unwrap();
            *count += 1;
            if *count > 1 {
                return Err(LiveMatchError::PoolUnavailable {
                    reason: "pool shutting down".to_string(),
                }
                .into());
            }
            Ok(())
        }

        async fn cancel_searching(&self, _user_id: &UserId) -> Result<()> {
            Ok(())
        }

        async fn searching_count(&self) -> usize {
            0
        }
    }

    #[tokio::test]
    async fn test_failed_channel_open_returns_search_to_idle() {
        let pool = Arc::new(MockCandidatePool::new());
        let events = Arc::new(MockEventSink::new());
        let manager = MatchSessionManager::new(
            "alice",
            test_profile("Alice"),
            pool.clone(),
            Arc::new(BrokenChannelProvider),
            events.clone(),
            None,
            None,
        );

        manager.start_search().await.unwrap();
        manager
            .signal_sender()
            .send(SessionSignal::MatchFound {
                partner: partner_candidate(),
                greeting: None,
            })
            .unwrap();
        settle().await;

        // The pool consumed both entries when it paired, so the session
        // falls back to Idle rather than lingering in Searching forever
        assert_eq!(manager.current_state().await, SessionState::Idle);
        assert!(manager.current_partner().await.is_none());
        assert_eq!(events.count_events_of_type("SearchExpired"), 1);
        let transitions = events.state_transitions();
        assert_eq!(transitions.last().unwrap().current, SessionState::Idle);

        // The session stays usable afterwards
        manager.start_search().await.unwrap();
        assert_eq!(manager.current_state().await, SessionState::Searching);
        assert_eq!(pool.registered().len(), 2);
    }

    #[tokio::test]
    async fn test_skip_with_unavailable_pool_ends_session() {
        let pool = Arc::new(SingleShotPool::new());
        let channel = Arc::new(MockChannelProvider::new());
        let events = Arc::new(MockEventSink::new());
        let manager = MatchSessionManager::new(
            "alice",
            test_profile("Alice"),
            pool,
            channel.clone(),
            events.clone(),
            None,
            None,
        );

        manager.start_search().await.unwrap();
        manager
            .signal_sender()
            .send(SessionSignal::MatchFound {
                partner: partner_candidate(),
                greeting: None,
            })
            .unwrap();
        settle().await;
        assert_eq!(manager.current_state().await, SessionState::Matched);

        // Re-registration is rejected, so the skip fails closed to Ended
        // instead of reporting Searching with no pool entry behind it
        assert!(manager.skip().await.is_err());
        assert_eq!(manager.current_state().await, SessionState::Ended);
        assert!(manager.current_partner().await.is_none());
        assert_eq!(channel.closed_count(), 1);
        let transitions = events.state_transitions();
        assert_eq!(transitions.last().unwrap().current, SessionState::Ended);
    }
}
