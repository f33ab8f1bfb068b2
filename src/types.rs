//! Common types used throughout the live match service

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Unique identifier for users
pub type UserId = String;

/// Unique identifier for sessions
pub type SessionId = Uuid;

/// Unique identifier for channel endpoints
pub type ChannelId = Uuid;

/// Lifecycle state of one user's live match session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    /// Session exists but the user has not started matching
    Idle,
    /// Waiting for the candidate pool to yield a partner
    Searching,
    /// Linked to a partner and able to exchange messages
    Matched,
    /// Terminated by either side; the message log stays readable
    Ended,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Idle => write!(f, "Idle"),
            SessionState::Searching => write!(f, "Searching"),
            SessionState::Matched => write!(f, "Matched"),
            SessionState::Ended => write!(f, "Ended"),
        }
    }
}

/// Which side of the session authored a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageSender {
    Me,
    Partner,
}

/// Why a session reached the Ended state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndReason {
    /// The local user ended the chat
    UserEnded,
    /// The partner ended the chat or disconnected
    PartnerLeft,
}

/// One message within a matched session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Monotonically increasing within the owning session, starting at 1
    pub message_id: u64,
    pub session_id: SessionId,
    pub sender: MessageSender,
    pub text: String,
    pub sent_at: DateTime<Utc>,
}

/// Public profile shown for a matched partner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudentProfile {
    pub name: String,
    pub university: String,
    pub major: String,
    pub interests: Vec<String>,
    pub is_online: bool,
}

/// Candidate pool entry: a user currently willing to be matched
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub user_id: UserId,
    pub profile: StudentProfile,
    pub registered_at: DateTime<Utc>,
}

impl Candidate {
    pub fn new(user_id: impl Into<UserId>, profile: StudentProfile) -> Self {
        Self {
            user_id: user_id.into(),
            profile,
            registered_at: Utc::now(),
        }
    }
}

/// Asynchronous signals delivered to one session's serialized event queue
///
/// The candidate pool, the message channel, and timeout timers all feed this
/// queue; the manager drains it one signal at a time, so callbacks never
/// overlap within a session.
#[derive(Debug, Clone)]
pub enum SessionSignal {
    /// The pool resolved a pairing; `greeting` optionally seeds the log
    /// as the partner's first message when the protocol supplies one
    MatchFound {
        partner: Candidate,
        greeting: Option<String>,
    },
    /// The partner sent a message over the channel
    MessageArrived {
        text: String,
        sent_at: DateTime<Utc>,
    },
    /// The partner closed their channel endpoint
    PeerClosed,
    /// Delivery of an outbound message failed; reported asynchronously,
    /// never as an error from send_message
    DeliveryFailed { reason: String },
    /// A configured search timeout elapsed; `generation` ties the timer
    /// to the search that armed it
    SearchTimedOut { generation: u64 },
}

/// Sending half of a session's signal queue
pub type SignalSender = mpsc::UnboundedSender<SessionSignal>;

/// Receiving half of a session's signal queue
pub type SignalReceiver = mpsc::UnboundedReceiver<SessionSignal>;

/// Event emitted whenever the session transitions between states
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateChanged {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub previous: SessionState,
    pub current: SessionState,
    pub timestamp: DateTime<Utc>,
}

/// Event emitted when a partner message is appended to the log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageReceived {
    pub session_id: SessionId,
    pub message: ChatMessage,
}

/// Event emitted when the partner ends the chat or disconnects
///
/// Distinct from a self-initiated end so the interface can explain
/// "the other person left".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartnerLeft {
    pub session_id: SessionId,
    pub partner: StudentProfile,
    pub timestamp: DateTime<Utc>,
}

/// Event emitted when an outbound message could not be delivered
///
/// Policy: surfaced as a transient warning; the session is not ended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryWarning {
    pub session_id: SessionId,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

/// Event emitted when a search expires without finding a partner
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchExpired {
    pub session_id: SessionId,
    pub waited_seconds: u64,
    pub timestamp: DateTime<Utc>,
}
