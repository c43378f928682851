use std::collections::VecDeque;

use super::*;
use crate::config::Settings;
use async_trait::async_trait;
use chrono::TimeZone;
use shared::domain::{ConversationId, MessageId, UserId};
use tokio::sync::Mutex as AsyncMutex;

const SELF: UserId = UserId(7);
const PEER: UserId = UserId(8);
const CONV: ConversationId = ConversationId(1);

fn ts(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis).unwrap()
}

fn payload(id: i64, sender: UserId, body: &str, millis: i64) -> MessagePayload {
    MessagePayload {
        id: MessageId(id),
        conversation_id: CONV,
        sender_id: sender,
        message: body.to_string(),
        time: ts(millis),
        attachments: Vec::new(),
    }
}

fn optimistic(body: &str, millis: i64) -> Message {
    Message {
        key: MessageKey::Local("tmp-1".to_string()),
        conversation_id: CONV,
        sender_id: SELF,
        body: body.to_string(),
        attachments: Vec::new(),
        sent_at: ts(millis),
        seen: false,
        provenance: Provenance::Optimistic,
        failed: false,
    }
}

fn tolerance() -> ChronoDuration {
    ChronoDuration::milliseconds(5_000)
}

struct ScriptedHistory {
    pages: AsyncMutex<VecDeque<Result<Vec<MessagePayload>, FetchError>>>,
}

impl ScriptedHistory {
    fn new(pages: Vec<Result<Vec<MessagePayload>, FetchError>>) -> Arc<Self> {
        Arc::new(Self {
            pages: AsyncMutex::new(pages.into()),
        })
    }
}

#[async_trait]
impl MessageHistory for ScriptedHistory {
    async fn fetch_messages(
        &self,
        conversation_id: ConversationId,
        page: u32,
        _sort: SortOrder,
        _search: Option<&str>,
    ) -> Result<Vec<MessagePayload>, FetchError> {
        self.pages.lock().await.pop_front().unwrap_or_else(|| {
            Err(FetchError::Messages {
                conversation_id,
                page,
                reason: "script exhausted".into(),
            })
        })
    }
}

fn offline_transport() -> Arc<Transport> {
    Transport::new(&Settings::default()).expect("transport")
}

fn synchronizer(
    pages: Vec<Result<Vec<MessagePayload>, FetchError>>,
) -> Arc<MessageSynchronizer> {
    MessageSynchronizer::new(
        offline_transport(),
        ScriptedHistory::new(pages),
        SELF,
        tolerance(),
    )
}

#[test]
fn echo_replaces_optimistic_slot_in_place() {
    let mut state = ConversationState::default();
    state.messages.push(optimistic("hello", 1000));

    let outcome = reconcile_payload(&mut state, &payload(55, SELF, "hello", 1000), tolerance());

    assert!(matches!(outcome, MergeOutcome::Confirmed(_)));
    assert_eq!(state.messages.len(), 1);
    let message = &state.messages[0];
    assert_eq!(message.key, MessageKey::Server(MessageId(55)));
    assert_eq!(message.provenance, Provenance::Confirmed);
    assert!(!state
        .messages
        .iter()
        .any(|m| m.key == MessageKey::Local("tmp-1".to_string())));
}

#[test]
fn identical_body_outside_tolerance_is_a_new_message() {
    let mut state = ConversationState::default();
    state.messages.push(optimistic("hello", 0));

    let outcome = reconcile_payload(&mut state, &payload(56, SELF, "hello", 10_000), tolerance());

    assert!(matches!(outcome, MergeOutcome::Appended(_)));
    assert_eq!(state.messages.len(), 2);
}

#[test]
fn duplicate_server_id_is_dropped() {
    let mut state = ConversationState::default();
    reconcile_payload(&mut state, &payload(9, PEER, "hi", 100), tolerance());
    let outcome = reconcile_payload(&mut state, &payload(9, PEER, "hi", 100), tolerance());

    assert_eq!(outcome, MergeOutcome::Duplicate);
    assert_eq!(state.messages.len(), 1);
}

#[test]
fn sequence_orders_by_timestamp_then_identifier() {
    let mut state = ConversationState::default();
    reconcile_payload(&mut state, &payload(3, PEER, "third", 30), tolerance());
    reconcile_payload(&mut state, &payload(1, PEER, "first", 10), tolerance());
    reconcile_payload(&mut state, &payload(2, PEER, "second", 20), tolerance());

    let ids: Vec<MessageKey> = state.messages.iter().map(|m| m.key.clone()).collect();
    assert_eq!(
        ids,
        vec![
            MessageKey::Server(MessageId(1)),
            MessageKey::Server(MessageId(2)),
            MessageKey::Server(MessageId(3)),
        ]
    );
}

#[test]
fn server_key_sorts_before_local_on_timestamp_tie() {
    let mut messages = vec![optimistic("b", 50)];
    messages.push(Message {
        key: MessageKey::Server(MessageId(4)),
        ..optimistic("a", 50)
    });
    sort_sequence(&mut messages);
    assert_eq!(messages[0].key, MessageKey::Server(MessageId(4)));
}

#[tokio::test]
async fn send_then_echo_grows_sequence_by_exactly_one() {
    let sync = synchronizer(Vec::new());
    assert_eq!(sync.snapshot(CONV).await.len(), 0);

    let sent = sync.send_message(CONV, "hello", Vec::new()).await;
    assert_eq!(sync.snapshot(CONV).await.len(), 1);
    assert_eq!(sent.provenance, Provenance::Optimistic);

    sync.on_inbound_message(MessagePayload {
        id: MessageId(55),
        conversation_id: CONV,
        sender_id: SELF,
        message: "hello".into(),
        time: sent.sent_at,
        attachments: Vec::new(),
    })
    .await;

    let messages = sync.snapshot(CONV).await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].key, MessageKey::Server(MessageId(55)));
    assert_eq!(messages[0].provenance, Provenance::Confirmed);
}

#[tokio::test]
async fn live_event_during_history_fetch_is_not_lost() {
    let sync = synchronizer(Vec::new());

    let generation = sync.begin_history_fetch(CONV).await;
    sync.on_inbound_message(payload(2, PEER, "m2", 20)).await;
    sync.apply_history_result(
        CONV,
        generation,
        Ok(vec![payload(3, PEER, "m3", 30), payload(1, PEER, "m1", 10)]),
    )
    .await
    .expect("history applies");

    let ids: Vec<MessageKey> = sync
        .snapshot(CONV)
        .await
        .iter()
        .map(|m| m.key.clone())
        .collect();
    assert_eq!(
        ids,
        vec![
            MessageKey::Server(MessageId(1)),
            MessageKey::Server(MessageId(2)),
            MessageKey::Server(MessageId(3)),
        ]
    );
    assert_eq!(sync.phase(CONV).await, ConversationPhase::Ready);
}

#[tokio::test]
async fn stale_history_fetch_is_discarded() {
    let sync = synchronizer(Vec::new());

    let stale = sync.begin_history_fetch(CONV).await;
    let fresh = sync.begin_history_fetch(CONV).await;
    sync.apply_history_result(CONV, fresh, Ok(vec![payload(1, PEER, "fresh", 10)]))
        .await
        .expect("fresh applies");
    sync.apply_history_result(CONV, stale, Ok(vec![payload(99, PEER, "stale", 5)]))
        .await
        .expect("stale resolution is silently discarded");

    let messages = sync.snapshot(CONV).await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].key, MessageKey::Server(MessageId(1)));
}

#[tokio::test]
async fn reconnect_reconciliation_yields_superset() {
    let sync = synchronizer(vec![Ok(vec![
        payload(2, PEER, "m2", 20),
        payload(3, PEER, "m3", 30),
    ])]);

    sync.on_inbound_message(payload(1, PEER, "m1", 10)).await;
    sync.on_inbound_message(payload(2, PEER, "m2", 20)).await;

    sync.reconcile_after_reconnect(CONV).await.expect("reconcile");

    let ids: Vec<MessageKey> = sync
        .snapshot(CONV)
        .await
        .iter()
        .map(|m| m.key.clone())
        .collect();
    assert_eq!(
        ids,
        vec![
            MessageKey::Server(MessageId(1)),
            MessageKey::Server(MessageId(2)),
            MessageKey::Server(MessageId(3)),
        ]
    );
}

#[tokio::test]
async fn history_failure_degrades_but_keeps_accepting_live_events() {
    let sync = synchronizer(vec![Err(FetchError::Messages {
        conversation_id: CONV,
        page: 1,
        reason: "boom".into(),
    })]);

    sync.on_inbound_message(payload(1, PEER, "m1", 10)).await;
    let result = sync.load_history(CONV).await;
    assert!(result.is_err());
    assert_eq!(sync.phase(CONV).await, ConversationPhase::Ready);
    assert!(sync.history_error(CONV).await);
    assert_eq!(sync.snapshot(CONV).await.len(), 1);

    sync.on_inbound_message(payload(2, PEER, "m2", 20)).await;
    assert_eq!(sync.snapshot(CONV).await.len(), 2);
}

#[tokio::test]
async fn expired_send_marks_optimistic_message_failed() {
    let sync = synchronizer(Vec::new());
    sync.send_message(CONV, "unsent", Vec::new()).await;

    sync.mark_send_failed(CONV, "unsent").await;

    let messages = sync.snapshot(CONV).await;
    assert_eq!(messages.len(), 1);
    assert!(messages[0].failed);
    assert_eq!(messages[0].provenance, Provenance::Optimistic);
}

#[tokio::test]
async fn peer_seen_flips_confirmed_messages_only() {
    let sync = synchronizer(Vec::new());
    sync.on_inbound_message(payload(1, SELF, "delivered", 10)).await;
    sync.send_message(CONV, "pending", Vec::new()).await;

    sync.mark_seen_by_peer(CONV).await;

    let messages = sync.snapshot(CONV).await;
    let delivered = messages
        .iter()
        .find(|m| m.key == MessageKey::Server(MessageId(1)))
        .expect("confirmed message");
    let pending = messages
        .iter()
        .find(|m| m.provenance == Provenance::Optimistic)
        .expect("optimistic message");
    assert!(delivered.seen);
    assert!(!pending.seen);
}

#[tokio::test]
async fn removed_conversation_discards_inflight_fetch() {
    let sync = synchronizer(Vec::new());
    let generation = sync.begin_history_fetch(CONV).await;
    sync.remove_conversation(CONV).await;
    sync.apply_history_result(CONV, generation, Ok(vec![payload(1, PEER, "late", 10)]))
        .await
        .expect("discarded");
    assert!(sync.snapshot(CONV).await.is_empty());
}
