//! Session instance implementation and lifecycle management
//!
//! This module contains the core state machine for one user's live match
//! session: state transitions, the ordered message log, and input validation.
//! It is purely synchronous; the manager drives it from serialized callbacks.

use crate::error::{LiveMatchError, Result};
use crate::types::{
    Candidate, ChatMessage, EndReason, MessageSender, SessionId, SessionState, UserId,
};
use crate::utils::{current_timestamp, generate_session_id};
use chrono::{DateTime, Utc};

/// Core state machine for a single user's session
///
/// Invariant: `partner` is `Some` if and only if `state == Matched`.
#[derive(Debug, Clone)]
pub struct SessionInstance {
    id: SessionId,
    user_id: UserId,
    state: SessionState,
    partner: Option<Candidate>,
    started_at: Option<DateTime<Utc>>,
    matched_at: Option<DateTime<Utc>>,
    log: Vec<ChatMessage>,
    next_message_id: u64,
    end_reason: Option<EndReason>,
}

impl SessionInstance {
    /// Create a new session in the Idle state
    pub fn new(user_id: impl Into<UserId>) -> Self {
        Self {
            id: generate_session_id(),
            user_id: user_id.into(),
            state: SessionState::Idle,
            partner: None,
            started_at: None,
            matched_at: None,
            log: Vec::new(),
            next_message_id: 1,
            end_reason: None,
        }
    }

    /// Get session ID
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Get the owning user's ID
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// Get current state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Get the matched partner, present only while Matched
    pub fn partner(&self) -> Option<&Candidate> {
        self.partner.as_ref()
    }

    /// Get when searching began for the current session
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    /// Get when the current match was made
    pub fn matched_at(&self) -> Option<DateTime<Utc>> {
        self.matched_at
    }

    /// Get why the session ended, once it has
    pub fn end_reason(&self) -> Option<EndReason> {
        self.end_reason
    }

    /// Snapshot of the ordered message log
    pub fn message_log(&self) -> Vec<ChatMessage> {
        self.log.clone()
    }

    /// Begin searching for a partner
    ///
    /// Valid from Idle and from Ended; starting over from Ended mints a fresh
    /// session with a new ID and an empty log.
    pub fn begin_search(&mut self) -> Result<()> {
        match self.state {
            SessionState::Idle => {}
            SessionState::Ended => self.reset_for_new_session(),
            state => {
                return Err(LiveMatchError::InvalidState {
                    operation: "start_search",
                    state,
                }
                .into())
            }
        }

        self.state = SessionState::Searching;
        self.started_at = Some(current_timestamp());
        Ok(())
    }

    /// Abandon an outstanding search and return to Idle
    ///
    /// Fails when not Searching; a second cancel in a row is therefore an
    /// error, never a silent success.
    pub fn cancel_search(&mut self) -> Result<()> {
        if self.state != SessionState::Searching {
            return Err(LiveMatchError::InvalidState {
                operation: "cancel_search",
                state: self.state,
            }
            .into());
        }

        self.state = SessionState::Idle;
        Ok(())
    }

    /// Record a resolved pairing
    ///
    /// Fails when not Searching; the caller treats that failure as a late
    /// match to be ignored rather than a crash. Clears the log and seeds it
    /// with the partner's greeting when the protocol supplies one.
    pub fn record_match(&mut self, partner: Candidate, greeting: Option<&str>) -> Result<()> {
        if self.state != SessionState::Searching {
            return Err(LiveMatchError::InvalidState {
                operation: "on_matched",
                state: self.state,
            }
            .into());
        }

        self.state = SessionState::Matched;
        self.partner = Some(partner);
        self.matched_at = Some(current_timestamp());
        self.log.clear();
        self.next_message_id = 1;

        if let Some(text) = greeting {
            let trimmed = text.trim();
            if !trimmed.is_empty() {
                self.push_message(MessageSender::Partner, trimmed, current_timestamp());
            }
        }

        Ok(())
    }

    /// Append an outgoing message authored by the local user
    pub fn append_outgoing(&mut self, text: &str) -> Result<ChatMessage> {
        if self.state != SessionState::Matched {
            return Err(LiveMatchError::InvalidState {
                operation: "send_message",
                state: self.state,
            }
            .into());
        }

        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(LiveMatchError::EmptyMessage.into());
        }

        Ok(self.push_message(MessageSender::Me, trimmed, current_timestamp()))
    }

    /// Append an incoming message from the partner
    ///
    /// Returns `None` when the session is not Matched: a message can
    /// legitimately arrive in the window before this side has processed its
    /// own termination, and is silently discarded.
    pub fn append_incoming(&mut self, text: &str, sent_at: DateTime<Utc>) -> Option<ChatMessage> {
        if self.state != SessionState::Matched {
            return None;
        }

        Some(self.push_message(MessageSender::Partner, text, sent_at))
    }

    /// End the current match and immediately become Searching again
    ///
    /// Returns the skipped partner. The old session's log and identity are
    /// discarded; the caller re-registers with the pool under the same lock
    /// so no collaborator observes an intermediate state.
    pub fn skip_to_search(&mut self) -> Result<Candidate> {
        if self.state != SessionState::Matched {
            return Err(LiveMatchError::InvalidState {
                operation: "skip",
                state: self.state,
            }
            .into());
        }

        // partner is Some whenever state is Matched
        let skipped = self.partner.take().ok_or(LiveMatchError::InternalError {
            message: "matched session has no partner".to_string(),
        })?;

        self.reset_for_new_session();
        self.state = SessionState::Searching;
        self.started_at = Some(current_timestamp());

        Ok(skipped)
    }

    /// Transition to Ended
    ///
    /// Valid from Matched and Searching. The message log is kept readable as
    /// a snapshot; the partner association is released to uphold the
    /// partner-iff-matched invariant.
    pub fn finish(&mut self, reason: EndReason) -> Result<()> {
        match self.state {
            SessionState::Matched | SessionState::Searching => {}
            state => {
                return Err(LiveMatchError::InvalidState {
                    operation: "end",
                    state,
                }
                .into())
            }
        }

        self.state = SessionState::Ended;
        self.partner = None;
        self.end_reason = Some(reason);
        Ok(())
    }

    /// Check the structural invariants; used by tests after every transition
    pub fn invariants_hold(&self) -> bool {
        let partner_iff_matched = self.partner.is_some() == (self.state == SessionState::Matched);
        let ids_strictly_increasing = self.log.windows(2).all(|w| w[0].message_id < w[1].message_id);
        let ids_owned = self.log.iter().all(|m| m.session_id == self.id);
        partner_iff_matched && ids_strictly_increasing && ids_owned
    }

    fn push_message(
        &mut self,
        sender: MessageSender,
        text: &str,
        sent_at: DateTime<Utc>,
    ) -> ChatMessage {
        let message = ChatMessage {
            message_id: self.next_message_id,
            session_id: self.id,
            sender,
            text: text.to_string(),
            sent_at,
        };
        self.next_message_id += 1;
        self.log.push(message.clone());
        message
    }

    fn reset_for_new_session(&mut self) {
        self.id = generate_session_id();
        self.partner = None;
        self.started_at = None;
        self.matched_at = None;
        self.log.clear();
        self.next_message_id = 1;
        self.end_reason = None;
    }
}
