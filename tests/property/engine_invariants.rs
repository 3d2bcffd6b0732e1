// Test-specific lint overrides: property tests use unwrap/expect freely.
#![allow(clippy::unwrap_used, clippy::expect_used)]

//! Property-based tests for the reconciliation engine.
//!
//! Drives the engine with random interleavings of history pages, pushes,
//! confirmations, scroll triggers, stale answers, and conversation
//! switches, and checks after every step that:
//! 1. No message id appears twice and every displayed message has an id.
//! 2. Once an empty page is merged, no further request is issued until
//!    the conversation is reopened.
//! 3. Answers to requests that are no longer in flight change nothing.
//! 4. Messages for a conversation other than the active one are ignored.
//! 5. A merged page never reorders what was already shown: the previous
//!    list is a suffix of the new one.
//! 6. Only the oldest displayed message can trigger a fill, and the cursor
//!    never moves to a newer message.

use std::collections::HashSet;

use proptest::prelude::*;

use dmchat::engine::{EngineState, FetchRequest, ReadyState, ReconciliationEngine};
use dmchat_proto::api::select_page;
use dmchat_proto::message::{ConversationId, Message, MessageId, Offset};

const PAGE_SIZE: usize = 5;

#[derive(Debug, Clone)]
enum Op {
    /// Answer the request in flight from the server's history.
    DeliverPage,
    /// Answer the request in flight with an error.
    FailPage,
    /// The server pushes message `n`.
    Push(u32),
    /// One of the user's sends is confirmed as message `n`.
    Confirm(u32),
    /// A push for another conversation.
    ForeignPush(u32),
    /// The oldest displayed message scrolls into view.
    ScrollTop,
    /// A scroll trigger for the displayed message at this index.
    ScrollAt(usize),
    /// Replay the previous request after it was answered.
    StalePage,
    /// Switch away and back.
    Reopen,
}

fn arb_op(max_id: u32) -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => Just(Op::DeliverPage),
        1 => Just(Op::FailPage),
        2 => (1..=max_id + 5).prop_map(Op::Push),
        1 => (1..=max_id + 5).prop_map(Op::Confirm),
        1 => (1..=max_id).prop_map(Op::ForeignPush),
        3 => Just(Op::ScrollTop),
        1 => (0..40usize).prop_map(Op::ScrollAt),
        1 => Just(Op::StalePage),
        1 => Just(Op::Reopen),
    ]
}

fn history(count: u32) -> Vec<Message> {
    (1..=count)
        .map(|i| Message::confirmed(i.to_string(), format!("m{i}"), "bob"))
        .collect()
}

fn message(n: u32) -> Message {
    Message::confirmed(n.to_string(), format!("m{n}"), "bob")
}

struct Harness {
    engine: ReconciliationEngine,
    conversation: ConversationId,
    server: Vec<Message>,
    in_flight: Option<FetchRequest>,
    answered: Option<FetchRequest>,
    exhausted: bool,
}

impl Harness {
    fn new(count: u32) -> Self {
        let conversation = ConversationId::new("main");
        let mut engine = ReconciliationEngine::new();
        let (request, _) = engine.activate(conversation.clone());
        Self {
            engine,
            conversation,
            server: history(count),
            in_flight: Some(request),
            answered: None,
            exhausted: false,
        }
    }

    fn apply(&mut self, op: &Op) {
        match op {
            Op::DeliverPage => {
                if let Some(request) = self.in_flight.take() {
                    let page = select_page(&self.server, &request.offset, PAGE_SIZE);
                    if page.is_empty() {
                        self.exhausted = true;
                    }
                    let before: Vec<Message> = self.engine.messages().to_vec();
                    let outcome = self.engine.apply_page(&request, page);
                    assert!(outcome.changed);
                    assert!(
                        self.engine.messages().ends_with(&before),
                        "merge reordered the existing list"
                    );
                    self.answered = Some(request);
                }
            }
            Op::FailPage => {
                if let Some(request) = self.in_flight.take() {
                    let before = self.engine.cursor().clone();
                    self.engine.page_failed(&request);
                    assert_eq!(self.engine.cursor(), &before);
                    assert_eq!(self.engine.state(), EngineState::Ready(ReadyState::Stable));
                }
            }
            Op::Push(n) => {
                self.engine.apply_push(&self.conversation, message(*n));
            }
            Op::Confirm(n) => {
                self.engine.apply_confirmed(&self.conversation, message(*n));
            }
            Op::ForeignPush(n) => {
                let outcome = self
                    .engine
                    .apply_push(&ConversationId::new("other"), message(*n));
                assert!(!outcome.changed);
            }
            Op::ScrollTop => {
                let Some(oldest) = self.engine.messages().first().and_then(|m| m.id.clone())
                else {
                    return;
                };
                let request = self.engine.on_scroll_top(&oldest);
                if self.exhausted || self.in_flight.is_some() {
                    assert!(request.is_none());
                }
                if let Some(request) = request {
                    assert_eq!(request.offset, Offset::Before(oldest));
                    self.in_flight = Some(request);
                }
            }
            Op::ScrollAt(index) => {
                let messages = self.engine.messages();
                if messages.is_empty() {
                    return;
                }
                let index = index % messages.len();
                if index == 0 {
                    return;
                }
                let Some(id) = messages[index].id.clone() else {
                    return;
                };
                let cursor = self.engine.cursor().clone();
                let state = self.engine.state();
                assert!(self.engine.on_scroll_top(&id).is_none());
                assert_eq!(self.engine.cursor(), &cursor);
                assert_eq!(self.engine.state(), state);
            }
            Op::StalePage => {
                if let Some(stale) = self.answered.clone() {
                    if self.in_flight.as_ref() == Some(&stale) {
                        return;
                    }
                    let before: Vec<Message> = self.engine.messages().to_vec();
                    let page = select_page(&self.server, &stale.offset, PAGE_SIZE);
                    let outcome = self.engine.apply_page(&stale, page);
                    assert!(!outcome.changed);
                    assert_eq!(self.engine.messages(), before.as_slice());
                }
            }
            Op::Reopen => {
                let old_epoch = self.engine.epoch();
                self.engine.activate(ConversationId::new("elsewhere"));
                let (request, _) = self.engine.activate(self.conversation.clone());
                assert!(self.engine.epoch() > old_epoch);
                assert!(self.engine.messages().is_empty());
                self.in_flight = Some(request);
                self.exhausted = false;
            }
        }
    }

    fn check_invariants(&self) {
        let mut seen: HashSet<&MessageId> = HashSet::new();
        for message in self.engine.messages() {
            let id = message.id.as_ref().expect("displayed message without id");
            assert!(seen.insert(id), "duplicate id {id}");
        }
        assert_eq!(self.engine.is_loading(), self.in_flight.is_some());
        if self.exhausted {
            assert!(!self.engine.has_more());
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn engine_invariants_hold(
        count in 0u32..30,
        ops in prop::collection::vec(arb_op(30), 1..60),
    ) {
        let mut harness = Harness::new(count);
        for op in &ops {
            harness.apply(op);
            harness.check_invariants();
        }
    }

    #[test]
    fn paging_to_the_end_shows_the_whole_history(count in 0u32..40) {
        let mut harness = Harness::new(count);
        for _ in 0..20 {
            harness.apply(&Op::DeliverPage);
            harness.apply(&Op::ScrollTop);
        }
        harness.apply(&Op::DeliverPage);

        let ids: Vec<u32> = harness
            .engine
            .messages()
            .iter()
            .map(|m| m.id.as_ref().unwrap().as_str().parse().unwrap())
            .collect();
        let expected: Vec<u32> = (1..=count).collect();
        prop_assert_eq!(ids, expected);
        prop_assert!(!harness.engine.has_more());
    }
}
