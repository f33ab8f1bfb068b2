//! Integration tests for the full live match lifecycle
//!
//! These tests wire two session managers through the real in-memory
//! candidate pool and the real in-process message router, covering the
//! whole flow from search to match to chat to ending.

use campus_match::channel::InProcessChannelRouter;
use campus_match::events::MockEventSink;
use campus_match::pool::{CandidatePool, InMemoryCandidatePool};
use campus_match::session::MatchSessionManager;
use campus_match::types::{MessageSender, SessionState, StudentProfile};
use std::sync::Arc;
use std::time::Duration;

struct World {
    pool: Arc<InMemoryCandidatePool>,
    router: Arc<InProcessChannelRouter>,
}

impl World {
    fn new() -> Self {
        Self {
            pool: Arc::new(InMemoryCandidatePool::new()),
            router: Arc::new(InProcessChannelRouter::new()),
        }
    }

    fn spawn_user(
        &self,
        user_id: &str,
        search_timeout: Option<Duration>,
    ) -> (Arc<MatchSessionManager>, Arc<MockEventSink>) {
        let events = Arc::new(MockEventSink::new());
        let manager = MatchSessionManager::new(
            user_id,
            profile(user_id),
            self.pool.clone(),
            self.router.clone(),
            events.clone(),
            None,
            search_timeout,
        );
        (manager, events)
    }
}

fn profile(name: &str) -> StudentProfile {
    StudentProfile {
        name: name.to_string(),
        university: "State University".to_string(),
        major: "Physics".to_string(),
        interests: vec!["climbing".to_string()],
        is_online: true,
    }
}

/// Let signal loops drain their queues
async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn two_searchers_get_matched_to_each_other() {
    let world = World::new();
    let (alice, _) = world.spawn_user("alice", None);
    let (bob, _) = world.spawn_user("bob", None);

    alice.start_search().await.unwrap();
    assert_eq!(alice.current_state().await, SessionState::Searching);
    assert_eq!(world.pool.searching_count().await, 1);

    bob.start_search().await.unwrap();
    settle().await;

    assert_eq!(alice.current_state().await, SessionState::Matched);
    assert_eq!(bob.current_state().await, SessionState::Matched);
    assert_eq!(alice.current_partner().await.unwrap().user_id, "bob");
    assert_eq!(bob.current_partner().await.unwrap().user_id, "alice");
    assert_eq!(world.pool.searching_count().await, 0);
    assert_eq!(world.router.open_pairs(), 1);
}

#[tokio::test]
async fn lone_searcher_waits() {
    let world = World::new();
    let (alice, _) = world.spawn_user("alice", None);

    alice.start_search().await.unwrap();
    settle().await;

    assert_eq!(alice.current_state().await, SessionState::Searching);
    assert!(alice.current_partner().await.is_none());
    assert_eq!(world.pool.searching_count().await, 1);
}

#[tokio::test]
async fn cancelled_searcher_is_not_matched() {
    let world = World::new();
    let (alice, _) = world.spawn_user("alice", None);
    let (bob, _) = world.spawn_user("bob", None);

    alice.start_search().await.unwrap();
    alice.cancel_search().await.unwrap();
    assert_eq!(alice.current_state().await, SessionState::Idle);

    bob.start_search().await.unwrap();
    settle().await;

    assert_eq!(alice.current_state().await, SessionState::Idle);
    assert_eq!(bob.current_state().await, SessionState::Searching);

    // A second cancel is an error, never a silent success
    assert!(alice.cancel_search().await.is_err());
}

#[tokio::test]
async fn messages_flow_both_ways_in_order() {
    let world = World::new();
    let (alice, alice_events) = world.spawn_user("alice", None);
    let (bob, _) = world.spawn_user("bob", None);

    alice.start_search().await.unwrap();
    bob.start_search().await.unwrap();
    settle().await;

    alice.send_message("hey, what do you study?").await.unwrap();
    settle().await;
    bob.send_message("physics, you?").await.unwrap();
    settle().await;

    let alice_log = alice.message_log().await;
    assert_eq!(alice_log.len(), 2);
    assert_eq!(alice_log[0].sender, MessageSender::Me);
    assert_eq!(alice_log[0].text, "hey, what do you study?");
    assert_eq!(alice_log[1].sender, MessageSender::Partner);
    assert_eq!(alice_log[1].text, "physics, you?");
    assert!(alice_log[0].message_id < alice_log[1].message_id);

    let bob_log = bob.message_log().await;
    assert_eq!(bob_log.len(), 2);
    assert_eq!(bob_log[0].sender, MessageSender::Partner);
    assert_eq!(bob_log[1].sender, MessageSender::Me);

    assert_eq!(alice_events.count_events_of_type("MessageReceived"), 1);
}

#[tokio::test]
async fn ending_notifies_partner_exactly_once() {
    let world = World::new();
    let (alice, _) = world.spawn_user("alice", None);
    let (bob, bob_events) = world.spawn_user("bob", None);

    alice.start_search().await.unwrap();
    bob.start_search().await.unwrap();
    settle().await;

    alice.send_message("gotta go, bye!").await.unwrap();
    settle().await;
    alice.end().await.unwrap();
    settle().await;

    assert_eq!(alice.current_state().await, SessionState::Ended);
    assert_eq!(bob.current_state().await, SessionState::Ended);
    assert_eq!(bob_events.count_events_of_type("PartnerLeft"), 1);
    assert_eq!(world.router.open_pairs(), 0);

    // The log stays readable as a snapshot on both sides
    assert_eq!(alice.message_log().await.len(), 1);
    assert_eq!(bob.message_log().await.len(), 1);

    // The chat is over on both sides
    assert!(alice.send_message("one more thing").await.is_err());
    assert!(bob.end().await.is_err());
    assert_eq!(bob_events.count_events_of_type("PartnerLeft"), 1);
}

#[tokio::test]
async fn skip_ends_for_partner_and_researches() {
    let world = World::new();
    let (alice, _) = world.spawn_user("alice", None);
    let (bob, bob_events) = world.spawn_user("bob", None);

    alice.start_search().await.unwrap();
    bob.start_search().await.unwrap();
    settle().await;

    alice.send_message("hi").await.unwrap();
    settle().await;

    let old_session = alice.session_id().await;
    alice.skip().await.unwrap();
    settle().await;

    // Alice is searching again under a fresh session with an empty log
    assert_eq!(alice.current_state().await, SessionState::Searching);
    assert_ne!(alice.session_id().await, old_session);
    assert!(alice.message_log().await.is_empty());
    assert_eq!(world.pool.searching_count().await, 1);

    // Bob experienced it as the partner leaving
    assert_eq!(bob.current_state().await, SessionState::Ended);
    assert_eq!(bob_events.count_events_of_type("PartnerLeft"), 1);
    assert_eq!(bob.message_log().await.len(), 1);
}

#[tokio::test]
async fn skipped_pair_can_be_rematched() {
    let world = World::new();
    let (alice, _) = world.spawn_user("alice", None);
    let (bob, _) = world.spawn_user("bob", None);

    alice.start_search().await.unwrap();
    bob.start_search().await.unwrap();
    settle().await;

    alice.skip().await.unwrap();
    settle().await;

    // Bob starts over; with no one else waiting they meet again
    bob.start_search().await.unwrap();
    settle().await;

    assert_eq!(alice.current_state().await, SessionState::Matched);
    assert_eq!(bob.current_state().await, SessionState::Matched);
    assert_eq!(alice.current_partner().await.unwrap().user_id, "bob");
}

#[tokio::test]
async fn restart_after_end_gets_fresh_session() {
    let world = World::new();
    let (alice, _) = world.spawn_user("alice", None);
    let (bob, _) = world.spawn_user("bob", None);

    alice.start_search().await.unwrap();
    bob.start_search().await.unwrap();
    settle().await;

    alice.send_message("hello").await.unwrap();
    settle().await;
    let old_session = alice.session_id().await;
    alice.end().await.unwrap();
    settle().await;

    alice.start_search().await.unwrap();

    assert_eq!(alice.current_state().await, SessionState::Searching);
    assert_ne!(alice.session_id().await, old_session);
    assert!(alice.message_log().await.is_empty());
}

#[tokio::test]
async fn search_timeout_returns_to_idle_and_leaves_pool() {
    let world = World::new();
    let (alice, alice_events) = world.spawn_user("alice", Some(Duration::from_millis(60)));

    alice.start_search().await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert_eq!(alice.current_state().await, SessionState::Idle);
    assert_eq!(world.pool.searching_count().await, 0);
    assert_eq!(alice_events.count_events_of_type("SearchExpired"), 1);

    // A later searcher finds nobody
    let (bob, _) = world.spawn_user("bob", None);
    bob.start_search().await.unwrap();
    settle().await;
    assert_eq!(bob.current_state().await, SessionState::Searching);
}

#[tokio::test]
async fn three_searchers_yield_one_pair_and_one_waiter() {
    let world = World::new();
    let (alice, _) = world.spawn_user("alice", None);
    let (bob, _) = world.spawn_user("bob", None);
    let (carol, _) = world.spawn_user("carol", None);

    alice.start_search().await.unwrap();
    bob.start_search().await.unwrap();
    carol.start_search().await.unwrap();
    settle().await;

    let states = [
        alice.current_state().await,
        bob.current_state().await,
        carol.current_state().await,
    ];
    let matched = states
        .iter()
        .filter(|s| **s == SessionState::Matched)
        .count();
    let searching = states
        .iter()
        .filter(|s| **s == SessionState::Searching)
        .count();

    assert_eq!(matched, 2);
    assert_eq!(searching, 1);
    assert_eq!(world.pool.searching_count().await, 1);
    assert_eq!(world.router.open_pairs(), 1);
}
