// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::doc_markdown,
    clippy::future_not_send,
    clippy::missing_panics_doc,
    clippy::missing_errors_doc
)]

//! Integration tests for sending and receiving direct messages.
//!
//! Covers acknowledged delivery with retries against the loopback server,
//! a full session driving the reconciliation engine, and the WebSocket
//! channel against the reference server.

use std::sync::Arc;
use std::time::Duration;

use dmchat::channel::loopback::{AckBehavior, LoopbackServer};
use dmchat::channel::ws::WsConnector;
use dmchat::channel::{ChannelConnector, ChannelError, DeliveryChannel};
use dmchat::log::InMemoryLog;
use dmchat::pipeline::{RetryConfig, SendOutcome, SendPipeline};
use dmchat::session::{SessionConfig, SessionEvent, spawn_session};
use dmchat_proto::message::{ConversationId, EventName, Message, MessageId, Offset};
use dmchat_server::server::{ServerState, start_server_with_state};
use dmchat_server::store::ConversationStore;
use tokio::sync::mpsc;

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

fn conv(id: &str) -> ConversationId {
    ConversationId::new(id)
}

fn fast_retry(retry_times: i32) -> RetryConfig {
    RetryConfig {
        retry_times,
        ack_timeout: Duration::from_millis(50),
    }
}

/// Wait for the first event matching `pred`, skipping others.
async fn wait_for<F>(events: &mut mpsc::Receiver<SessionEvent>, mut pred: F) -> SessionEvent
where
    F: FnMut(&SessionEvent) -> bool,
{
    tokio::time::timeout(EVENT_TIMEOUT, async {
        loop {
            let event = events.recv().await.expect("session ended");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for session event")
}

fn contents(messages: &[Message]) -> Vec<&str> {
    messages.iter().map(|m| m.content.as_str()).collect()
}

fn has_content(event: &SessionEvent, content: &str) -> bool {
    matches!(event, SessionEvent::Messages(list) if list.iter().any(|m| m.content == content))
}

// =============================================================================
// Send pipeline against the loopback server
// =============================================================================

#[tokio::test(start_paused = true)]
async fn two_timeouts_then_ack_takes_three_attempts() {
    let server = LoopbackServer::default();
    server.script_acks([AckBehavior::Timeout, AckBehavior::Timeout]);
    let (channel, _inbound) = server
        .connector(16)
        .connect(&conv("1"), &Offset::Latest)
        .await
        .unwrap();

    let pipeline = SendPipeline::new(RetryConfig::default());
    let outcome = pipeline.submit(&channel, "hello", "alice").await.unwrap();

    assert_eq!(outcome.attempts(), 3);
    let confirmed = outcome.confirmed().expect("message should be confirmed");
    assert!(confirmed.is_confirmed());
    assert_eq!(confirmed.content, "hello");

    let attempts = server.attempts();
    let budgets: Vec<i32> = attempts.iter().map(|m| m.ext.retry_times).collect();
    assert_eq!(budgets, vec![3, 2, 1]);
    assert!(attempts.iter().all(|m| m.id.is_none()));
    assert_eq!(server.messages(&conv("1")).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn exhausted_budget_abandons_after_four_attempts() {
    let server = LoopbackServer::default();
    server.script_acks(vec![AckBehavior::Timeout; 4]);
    let (channel, _inbound) = server
        .connector(16)
        .connect(&conv("1"), &Offset::Latest)
        .await
        .unwrap();

    let outcome = SendPipeline::new(RetryConfig::default())
        .submit(&channel, "lost", "alice")
        .await
        .unwrap();

    match outcome {
        SendOutcome::Abandoned {
            attempts,
            last_error,
            ..
        } => {
            assert_eq!(attempts, 4);
            assert!(matches!(last_error, ChannelError::Timeout(_)));
        }
        SendOutcome::Confirmed { .. } => panic!("expected the message to be abandoned"),
    }
    assert!(server.messages(&conv("1")).is_empty());
}

// =============================================================================
// Session over the loopback server
// =============================================================================

#[tokio::test]
async fn session_sends_and_receives() {
    let server = LoopbackServer::default();
    let config = SessionConfig {
        retry: fast_retry(3),
        ..SessionConfig::default()
    };
    let (handle, mut events, _task) = spawn_session(
        server.connector(16),
        server.clone(),
        InMemoryLog::new(),
        server.clone(),
        config,
    );

    handle.open(conv("1")).await.unwrap();
    wait_for(&mut events, |e| {
        matches!(e, SessionEvent::ConnectionStatus { connected: true, .. })
    })
    .await;

    handle.send_text("hi there").await.unwrap();
    let event = wait_for(&mut events, |e| has_content(e, "hi there")).await;
    let SessionEvent::Messages(list) = event else {
        unreachable!()
    };
    assert!(list.iter().all(Message::is_confirmed));

    server.post(&conv("1"), "bob", "hello back");
    let event = wait_for(&mut events, |e| has_content(e, "hello back")).await;
    let SessionEvent::Messages(list) = event else {
        unreachable!()
    };
    assert_eq!(contents(&list), vec!["hi there", "hello back"]);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn session_rejects_invalid_input_without_transmitting() {
    let server = LoopbackServer::default();
    let (handle, mut events, _task) = spawn_session(
        server.connector(16),
        server.clone(),
        InMemoryLog::new(),
        server.clone(),
        SessionConfig::default(),
    );

    handle.open(conv("1")).await.unwrap();
    wait_for(&mut events, |e| {
        matches!(e, SessionEvent::ConnectionStatus { connected: true, .. })
    })
    .await;

    handle.send_text("").await.unwrap();
    wait_for(&mut events, |e| matches!(e, SessionEvent::InputRejected(_))).await;

    handle.send_text("x".repeat(5001)).await.unwrap();
    wait_for(&mut events, |e| matches!(e, SessionEvent::InputRejected(_))).await;

    assert!(server.attempts().is_empty());
}

#[tokio::test]
async fn session_reports_abandoned_send() {
    let server = LoopbackServer::default();
    server.script_acks([AckBehavior::Timeout, AckBehavior::Timeout]);
    let config = SessionConfig {
        retry: fast_retry(1),
        ..SessionConfig::default()
    };
    let (handle, mut events, _task) = spawn_session(
        server.connector(16),
        server.clone(),
        InMemoryLog::new(),
        server.clone(),
        config,
    );

    handle.open(conv("1")).await.unwrap();
    wait_for(&mut events, |e| {
        matches!(e, SessionEvent::ConnectionStatus { connected: true, .. })
    })
    .await;

    handle.send_text("never arrives").await.unwrap();
    let event = wait_for(&mut events, |e| matches!(e, SessionEvent::SendAbandoned { .. })).await;
    match event {
        SessionEvent::SendAbandoned {
            content, attempts, ..
        } => {
            assert_eq!(content, "never arrives");
            assert_eq!(attempts, 2);
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn session_shows_hello_once_after_two_lost_acks() {
    let server = LoopbackServer::default();
    // Ids 1..=41 go to another conversation, so the next id is 42.
    server.seed(&conv("0"), 41, "bob");
    server.script_acks([AckBehavior::Timeout, AckBehavior::Timeout]);
    let config = SessionConfig {
        retry: fast_retry(3),
        ..SessionConfig::default()
    };
    let (handle, mut events, _task) = spawn_session(
        server.connector(16),
        server.clone(),
        InMemoryLog::new(),
        server.clone(),
        config,
    );

    handle.open(conv("1")).await.unwrap();
    let mut connected = false;
    let mut loaded = false;
    wait_for(&mut events, |e| {
        connected |= matches!(e, SessionEvent::ConnectionStatus { connected: true, .. });
        loaded |= matches!(e, SessionEvent::Loading(false));
        connected && loaded
    })
    .await;

    handle.send_text("hello").await.unwrap();
    let event = wait_for(&mut events, |e| has_content(e, "hello")).await;
    let SessionEvent::Messages(list) = event else {
        unreachable!()
    };

    assert_eq!(list.len(), 1);
    assert_eq!(list[0].id, Some(MessageId::new("42")));
    assert_eq!(list[0].content, "hello");
    assert_eq!(server.attempts().len(), 3);
}

#[tokio::test]
async fn session_redirects_to_login_when_logged_out() {
    let server = LoopbackServer::default();
    server.log_out();
    let (_handle, mut events, _task) = spawn_session(
        server.connector(16),
        server.clone(),
        InMemoryLog::new(),
        server.clone(),
        SessionConfig::default(),
    );

    wait_for(&mut events, |e| matches!(e, SessionEvent::RedirectToLogin)).await;
}

#[tokio::test]
async fn session_reports_server_side_disconnect() {
    let server = LoopbackServer::default();
    let (handle, mut events, _task) = spawn_session(
        server.connector(16),
        server.clone(),
        InMemoryLog::new(),
        server.clone(),
        SessionConfig::default(),
    );

    handle.open(conv("1")).await.unwrap();
    wait_for(&mut events, |e| {
        matches!(e, SessionEvent::ConnectionStatus { connected: true, .. })
    })
    .await;

    server.kick(&conv("1"));
    wait_for(&mut events, |e| {
        matches!(e, SessionEvent::ConnectionStatus { connected: false, .. })
    })
    .await;
}

// =============================================================================
// WebSocket channel against the reference server
// =============================================================================

async fn start_server() -> (String, Arc<ServerState>) {
    let state = Arc::new(ServerState::new(ConversationStore::new()));
    let (addr, _handle) = start_server_with_state("127.0.0.1:0", Arc::clone(&state))
        .await
        .unwrap();
    (format!("ws://{addr}"), state)
}

async fn wait_for_subscribers(state: &ServerState, conversation: &ConversationId, count: usize) {
    for _ in 0..200 {
        if state.subscriber_count(conversation).await == count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("expected {count} subscribers");
}

#[tokio::test]
async fn ws_send_is_acknowledged_and_pushed_to_peer() {
    let (ws_host, state) = start_server().await;
    let connector = WsConnector::new(ws_host, Duration::from_secs(5), 16);

    let (alice, _alice_inbound) = connector.connect(&conv("1"), &Offset::Latest).await.unwrap();
    let (_bob, mut bob_inbound) = connector.connect(&conv("1"), &Offset::Latest).await.unwrap();
    wait_for_subscribers(&state, &conv("1"), 2).await;

    let outcome = SendPipeline::new(RetryConfig::default())
        .submit(&alice, "over the wire", "alice")
        .await
        .unwrap();
    let confirmed = outcome.confirmed().expect("ack expected");
    assert_eq!(confirmed.id, Some(MessageId::new("1")));

    let pushed = tokio::time::timeout(EVENT_TIMEOUT, bob_inbound.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(pushed.content, "over the wire");
    assert_eq!(pushed.id, Some(MessageId::new("1")));
}

#[tokio::test]
async fn ws_lost_ack_is_retried_without_duplicating() {
    let (ws_host, state) = start_server().await;
    state.drop_next_acks(2);
    let connector = WsConnector::new(ws_host, Duration::from_secs(5), 16);
    let (channel, _inbound) = connector.connect(&conv("7"), &Offset::Latest).await.unwrap();

    let pipeline = SendPipeline::new(RetryConfig {
        retry_times: 3,
        ack_timeout: Duration::from_millis(300),
    });
    let outcome = pipeline.submit(&channel, "exactly once", "alice").await.unwrap();

    assert_eq!(outcome.attempts(), 3);
    assert!(outcome.confirmed().is_some());
    assert_eq!(state.store.len(&conv("7")).await, 1);
}

#[tokio::test]
async fn ws_wrong_event_is_rejected_by_server() {
    let (ws_host, _state) = start_server().await;
    let connector = WsConnector::new(ws_host, Duration::from_secs(5), 16);
    let (channel, _inbound) = connector.connect(&conv("1"), &Offset::Latest).await.unwrap();

    let result = channel
        .send(
            &EventName::for_conversation(&conv("2")),
            &Message::speculative("misrouted", "alice"),
            Duration::from_secs(2),
        )
        .await;
    assert!(matches!(result, Err(ChannelError::Rejected(_))));
}

#[tokio::test]
async fn ws_server_close_ends_inbound_stream() {
    let (ws_host, state) = start_server().await;
    let connector = WsConnector::new(ws_host, Duration::from_secs(5), 16);
    let (channel, mut inbound) = connector.connect(&conv("1"), &Offset::Latest).await.unwrap();

    wait_for_subscribers(&state, &conv("1"), 1).await;
    state.close_all_connections().await;

    let closed = tokio::time::timeout(EVENT_TIMEOUT, inbound.recv()).await.unwrap();
    assert!(closed.is_none());
    assert!(!channel.is_connected());
}
