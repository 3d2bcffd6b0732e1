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

//! Integration tests for switching the active conversation.
//!
//! These tests validate:
//! - a page requested for a conversation that is no longer active is dropped
//! - the old subscription is torn down before the new one is requested
//! - the composer is cleared on switch
//! - subscriptions resume from the newest message in the local log
//! - a restarted client receives what it missed while offline

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;

use dmchat::api::{ApiError, HttpApi};
use dmchat::channel::loopback::{AckBehavior, LoopbackChannel, LoopbackConnector, LoopbackServer};
use dmchat::channel::ws::WsConnector;
use dmchat::channel::{ChannelConnector, ChannelError, Inbound};
use dmchat::history::{HistoryFetcher, InMemoryHistory};
use dmchat::log::{FileLog, InMemoryLog, MessageLog};
use dmchat::pipeline::RetryConfig;
use dmchat::session::{SessionCommand, SessionConfig, SessionEvent, SessionHandle, spawn_session};
use dmchat_proto::message::{ConversationId, Message, MessageId, Offset, ValidationError};
use dmchat_server::server::{ServerState, start_server_with_state};
use dmchat_server::store::ConversationStore;

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

fn conv(id: &str) -> ConversationId {
    ConversationId::new(id)
}

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

/// Collect every event that arrives within `window`.
async fn drain_for(events: &mut mpsc::Receiver<SessionEvent>, window: Duration) -> Vec<SessionEvent> {
    let mut seen = Vec::new();
    while let Ok(Some(event)) = tokio::time::timeout(window, events.recv()).await {
        seen.push(event);
    }
    seen
}

/// Wait until the first page of `id` is merged and its channel is up.
async fn wait_ready(events: &mut mpsc::Receiver<SessionEvent>, id: &str) {
    let mut connected = false;
    let mut loaded = false;
    wait_for(events, |e| {
        connected |= connected_to(e, id);
        loaded |= matches!(e, SessionEvent::Loading(false));
        connected && loaded
    })
    .await;
}

fn connected_to(event: &SessionEvent, id: &str) -> bool {
    matches!(
        event,
        SessionEvent::ConnectionStatus { conversation, connected: true } if conversation.as_str() == id
    )
}

fn has_content(event: &SessionEvent, content: &str) -> bool {
    matches!(event, SessionEvent::Messages(list) if list.iter().any(|m| m.content == content))
}

// =============================================================================
// Test doubles
// =============================================================================

/// History whose pages for one conversation wait until released.
struct GatedHistory {
    inner: InMemoryHistory,
    gated: ConversationId,
    gate: Arc<Notify>,
}

impl HistoryFetcher for GatedHistory {
    async fn fetch_page(
        &self,
        conversation: &ConversationId,
        offset: &Offset,
    ) -> Result<Vec<Message>, ApiError> {
        if *conversation == self.gated {
            self.gate.notified().await;
        }
        self.inner.fetch_page(conversation, offset).await
    }
}

/// Connector that records how many subscriptions to `watched` are live
/// whenever a connection is requested.
struct RecordingConnector {
    inner: LoopbackConnector,
    server: LoopbackServer,
    watched: ConversationId,
    observed: Arc<Mutex<Vec<usize>>>,
}

impl ChannelConnector for RecordingConnector {
    type Channel = LoopbackChannel;

    async fn connect(
        &self,
        conversation: &ConversationId,
        resume: &Offset,
    ) -> Result<(LoopbackChannel, Inbound), ChannelError> {
        if *conversation != self.watched {
            self.observed
                .lock()
                .push(self.server.subscriber_count(&self.watched));
        }
        self.inner.connect(conversation, resume).await
    }
}

// =============================================================================
// Switching between conversations
// =============================================================================

#[tokio::test]
async fn page_for_previous_conversation_is_discarded() {
    let history = InMemoryHistory::default();
    history.push(&conv("A"), Message::confirmed("1", "from A", "alice"));
    history.push(&conv("B"), Message::confirmed("2", "from B", "bob"));
    let gate = Arc::new(Notify::new());
    let server = LoopbackServer::default();

    let (handle, mut events, _task) = spawn_session(
        server.connector(16),
        GatedHistory {
            inner: history,
            gated: conv("A"),
            gate: Arc::clone(&gate),
        },
        InMemoryLog::new(),
        server.clone(),
        SessionConfig::default(),
    );

    handle.open(conv("A")).await.unwrap();
    handle.open(conv("B")).await.unwrap();
    wait_for(&mut events, |e| has_content(e, "from B")).await;

    gate.notify_one();
    let later = drain_for(&mut events, Duration::from_millis(200)).await;
    assert!(!later.iter().any(|e| has_content(e, "from A")));
}

#[tokio::test]
async fn old_subscription_is_torn_down_before_new_one_is_requested() {
    let server = LoopbackServer::default();
    let observed = Arc::new(Mutex::new(Vec::new()));
    let connector = RecordingConnector {
        inner: server.connector(16),
        server: server.clone(),
        watched: conv("A"),
        observed: Arc::clone(&observed),
    };
    let (handle, mut events, _task) = spawn_session(
        connector,
        server.clone(),
        InMemoryLog::new(),
        server.clone(),
        SessionConfig::default(),
    );

    handle.open(conv("A")).await.unwrap();
    wait_for(&mut events, |e| connected_to(e, "A")).await;
    assert_eq!(server.subscriber_count(&conv("A")), 1);

    handle.open(conv("B")).await.unwrap();
    wait_for(&mut events, |e| connected_to(e, "B")).await;

    assert_eq!(*observed.lock(), vec![0]);
    assert_eq!(server.subscriber_count(&conv("A")), 0);
    assert_eq!(server.subscriber_count(&conv("B")), 1);

    // A push to the old conversation no longer reaches the view.
    server.post(&conv("A"), "alice", "too late");
    let later = drain_for(&mut events, Duration::from_millis(200)).await;
    assert!(!later.iter().any(|e| has_content(e, "too late")));
}

#[tokio::test]
async fn switching_clears_the_composer() {
    let server = LoopbackServer::default();
    let (handle, mut events, _task) = spawn_session(
        server.connector(16),
        server.clone(),
        InMemoryLog::new(),
        server.clone(),
        SessionConfig::default(),
    );

    handle.open(conv("A")).await.unwrap();
    wait_for(&mut events, |e| connected_to(e, "A")).await;
    handle
        .send(SessionCommand::Input("half-written".to_string()))
        .await
        .unwrap();

    handle.open(conv("B")).await.unwrap();
    wait_for(&mut events, |e| matches!(e, SessionEvent::ComposerCleared)).await;
    wait_for(&mut events, |e| connected_to(e, "B")).await;

    handle.send(SessionCommand::Submit).await.unwrap();
    let event = wait_for(&mut events, |e| matches!(e, SessionEvent::InputRejected(_))).await;
    assert_eq!(event, SessionEvent::InputRejected(ValidationError::Empty));
    assert!(server.attempts().is_empty());
}

#[tokio::test]
async fn reopening_the_active_conversation_is_a_no_op() {
    let server = LoopbackServer::default();
    let (handle, mut events, _task) = spawn_session(
        server.connector(16),
        server.clone(),
        InMemoryLog::new(),
        server.clone(),
        SessionConfig::default(),
    );

    handle.open(conv("A")).await.unwrap();
    wait_for(&mut events, |e| connected_to(e, "A")).await;
    handle.open(conv("A")).await.unwrap();
    drain_for(&mut events, Duration::from_millis(100)).await;

    assert_eq!(server.connections().len(), 1);
}

#[tokio::test]
async fn send_pending_on_previous_conversation_is_not_reported() {
    let server = LoopbackServer::default();
    server.script_acks([AckBehavior::Timeout]);
    let config = SessionConfig {
        retry: RetryConfig {
            retry_times: 3,
            ack_timeout: Duration::from_millis(100),
        },
        ..SessionConfig::default()
    };
    let (handle, mut events, _task) = spawn_session(
        server.connector(16),
        server.clone(),
        InMemoryLog::new(),
        server.clone(),
        config,
    );

    handle.open(conv("A")).await.unwrap();
    wait_ready(&mut events, "A").await;
    handle.send_text("unacknowledged").await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    // The retry after the timeout finds A's channel closed and gives up.
    handle.open(conv("B")).await.unwrap();
    wait_for(&mut events, |e| connected_to(e, "B")).await;
    let later = drain_for(&mut events, Duration::from_millis(400)).await;

    assert_eq!(server.attempts().len(), 1);
    assert!(
        !later
            .iter()
            .any(|e| matches!(e, SessionEvent::SendAbandoned { .. }))
    );
}

// =============================================================================
// Resume offsets
// =============================================================================

#[tokio::test]
async fn subscription_resumes_from_newest_logged_message() {
    let dir = tempfile::tempdir().unwrap();
    let log = FileLog::open(dir.path()).await.unwrap();
    for id in ["5", "6", "7"] {
        log.append(&conv("1"), &Message::confirmed(id, "logged", "bob"))
            .await
            .unwrap();
    }

    let server = LoopbackServer::default();
    let (handle, mut events, _task) = spawn_session(
        server.connector(16),
        server.clone(),
        log,
        server.clone(),
        SessionConfig::default(),
    );

    handle.open(conv("1")).await.unwrap();
    wait_for(&mut events, |e| connected_to(e, "1")).await;
    handle.open(conv("2")).await.unwrap();
    wait_for(&mut events, |e| connected_to(e, "2")).await;

    assert_eq!(
        server.connections(),
        vec![
            (conv("1"), Offset::Before(MessageId::new("7"))),
            (conv("2"), Offset::Latest),
        ]
    );
}

#[tokio::test]
async fn pushes_and_confirmed_sends_are_logged() {
    let dir = tempfile::tempdir().unwrap();
    let server = LoopbackServer::default();
    let (handle, mut events, task) = spawn_session(
        server.connector(16),
        server.clone(),
        FileLog::open(dir.path()).await.unwrap(),
        server.clone(),
        SessionConfig::default(),
    );

    handle.open(conv("1")).await.unwrap();
    wait_ready(&mut events, "1").await;
    server.post(&conv("1"), "bob", "incoming");
    wait_for(&mut events, |e| has_content(e, "incoming")).await;
    handle.send_text("outgoing").await.unwrap();
    wait_for(&mut events, |e| has_content(e, "outgoing")).await;

    handle.shutdown().await.unwrap();
    task.await.unwrap();

    let log = FileLog::open(dir.path()).await.unwrap();
    let logged = log.load(&conv("1")).await.unwrap();
    let contents: Vec<_> = logged.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec!["incoming", "outgoing"]);
    assert!(logged.iter().all(Message::is_confirmed));
}

async fn start_client(
    addr: SocketAddr,
    log_dir: &Path,
) -> (SessionHandle, mpsc::Receiver<SessionEvent>, JoinHandle<()>) {
    let api = HttpApi::new(
        format!("http://{addr}"),
        Some("alice".to_string()),
        Duration::from_secs(5),
    )
    .unwrap();
    spawn_session(
        WsConnector::new(format!("ws://{addr}"), Duration::from_secs(5), 16),
        api.clone(),
        FileLog::open(log_dir).await.unwrap(),
        api,
        SessionConfig::default(),
    )
}

#[tokio::test]
async fn restarted_client_receives_messages_missed_while_offline() {
    let state = Arc::new(ServerState::new(ConversationStore::new()));
    let (addr, _server) = start_server_with_state("127.0.0.1:0", Arc::clone(&state))
        .await
        .unwrap();
    let dir = tempfile::tempdir().unwrap();

    // First run: receive one live message, then quit.
    let (handle, mut events, task) = start_client(addr, dir.path()).await;
    handle.open(conv("1")).await.unwrap();
    wait_ready(&mut events, "1").await;
    state.post(&conv("1"), "bob", "while online").await;
    wait_for(&mut events, |e| has_content(e, "while online")).await;
    handle.shutdown().await.unwrap();
    task.await.unwrap();

    state.post(&conv("1"), "bob", "while offline 1").await;
    state.post(&conv("1"), "bob", "while offline 2").await;

    // Second run resumes after "while online".
    let (handle, mut events, _task) = start_client(addr, dir.path()).await;
    handle.open(conv("1")).await.unwrap();
    let event = wait_for(&mut events, |e| has_content(e, "while offline 2")).await;
    let SessionEvent::Messages(list) = event else {
        unreachable!()
    };
    let offline: Vec<_> = list
        .iter()
        .filter(|m| m.content.starts_with("while offline"))
        .collect();
    assert_eq!(offline.len(), 2);
}
