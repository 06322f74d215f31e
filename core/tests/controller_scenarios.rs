/// Controller scenarios with fetches resolved by hand, in whatever order the test picks
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use std::sync::Arc;
use tgstream_core::config::Config;
use tgstream_core::connection::{dispatch_payload, Dispatch};
use tgstream_core::message_types::{Direction, Message};
use tgstream_core::source::{LoadPurpose, LoadRequest, MessageSource};
use tgstream_core::utils::event_emitter::{EventEmitter, WindowEvent};
use tgstream_core::viewport::UpdateKind;
use tgstream_core::{LoadOutcome, MessageStreamController, Result, StreamError, StreamState};
use tokio::sync::{mpsc, oneshot};

type Reply = oneshot::Sender<Result<Vec<Message>>>;

/// Every fetch is handed to the test, which answers it through the `Reply`
struct ScriptedSource {
    calls: mpsc::UnboundedSender<(LoadRequest, Reply)>,
}

#[async_trait]
impl MessageSource for ScriptedSource {
    async fn fetch_messages(&self, request: &LoadRequest) -> Result<Vec<Message>> {
        let (tx, rx) = oneshot::channel();
        self.calls
            .send((request.clone(), tx))
            .map_err(|_| StreamError::Connection("test harness gone".to_string()))?;
        rx.await
            .map_err(|_| StreamError::Connection("reply dropped".to_string()))?
    }
}

fn setup() -> (
    MessageStreamController,
    mpsc::UnboundedReceiver<(LoadRequest, Reply)>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let controller = MessageStreamController::new(
        Arc::new(ScriptedSource { calls: tx }),
        &Config::default(),
        EventEmitter::new(),
    );
    (controller, rx)
}

fn msg(conversation_id: i64, id: i64) -> Message {
    Message {
        id,
        conversation_id,
        timestamp: Utc.timestamp_opt(1_700_000_000 + id * 60, 0).unwrap(),
        direction: Direction::Incoming,
        body: format!("{}:{}", conversation_id, id),
        attachment: None,
        sender_id: None,
        sender_name: Some("Ann".to_string()),
        sender_avatar_ref: None,
        reply_to_id: None,
        forward_from_id: None,
    }
}

fn page(conversation_id: i64, ids: impl Iterator<Item = i64>) -> Vec<Message> {
    ids.map(|id| msg(conversation_id, id)).collect()
}

fn live_frame(conversation_id: i64, id: i64) -> String {
    serde_json::json!({
        "type": "new_message",
        "data": {
            "id": id,
            "chat_id": conversation_id,
            "sender_name": "Ann",
            "text": "live",
            "date": Utc.timestamp_opt(1_700_000_000 + id * 60, 0).unwrap().to_rfc3339(),
            "has_media": false,
            "is_outgoing": false,
        }
    })
    .to_string()
}

async fn ids(controller: &MessageStreamController) -> Vec<i64> {
    controller.snapshot().await.iter().map(|m| m.id).collect()
}

/// Select a conversation and answer phase 1 with `ids`
async fn open_with(
    controller: &MessageStreamController,
    calls: &mut mpsc::UnboundedReceiver<(LoadRequest, Reply)>,
    conversation_id: i64,
    first_page: Vec<Message>,
) {
    let task = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.select_conversation(conversation_id).await })
    };
    let (request, reply) = calls.recv().await.unwrap();
    assert_eq!(request.purpose, LoadPurpose::Initial);
    reply.send(Ok(first_page)).unwrap();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_sparse_history_skips_backfill() {
    let (controller, mut calls) = setup();

    let task = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.select_conversation(42).await })
    };

    let (request, reply) = calls.recv().await.unwrap();
    assert_eq!(request, LoadRequest::initial(42, 15));
    assert!(!request.include_media());
    // unsorted on purpose
    reply.send(Ok(page(42, [103, 100, 105, 101, 104, 102].into_iter()))).unwrap();

    assert_eq!(task.await.unwrap().unwrap(), LoadOutcome::Loaded { added: 6 });
    assert_eq!(ids(&controller).await, vec![100, 101, 102, 103, 104, 105]);
    assert_eq!(controller.state().await, StreamState::Ready);
    assert!(!controller.is_backfilling().await);

    controller.wait_for_backfill().await;
    assert!(calls.try_recv().is_err(), "no backfill expected for 6 < 10 messages");
}

#[tokio::test]
async fn test_full_first_page_triggers_backfill_behind_oldest() {
    let (controller, mut calls) = setup();
    let mut events = controller.emitter().subscribe();

    open_with(&controller, &mut calls, 5, page(5, 86..=100)).await;
    assert!(controller.is_backfilling().await);

    let (request, reply) = calls.recv().await.unwrap();
    assert_eq!(request, LoadRequest::older_than(5, 86, 35, LoadPurpose::Backfill));
    assert!(request.include_media());
    reply.send(Ok(page(5, 51..=85))).unwrap();
    controller.wait_for_backfill().await;

    assert_eq!(ids(&controller).await, (51..=100).collect::<Vec<_>>());
    assert!(!controller.is_backfilling().await);

    let kinds: Vec<UpdateKind> = [events.recv().await.unwrap(), events.recv().await.unwrap()]
        .into_iter()
        .map(|e| match e {
            WindowEvent::Updated { kind, .. } => kind,
            other => panic!("unexpected event {:?}", other),
        })
        .collect();
    assert_eq!(kinds, vec![UpdateKind::Reset, UpdateKind::TopInsert]);
}

/// Backfill, an older page and a live message all in flight together;
/// `older_first` flips which fetch resolves first.
async fn race(older_first: bool) -> Vec<i64> {
    let (controller, mut calls) = setup();
    open_with(&controller, &mut calls, 5, page(5, 86..=100)).await;
    let (_, backfill_reply) = calls.recv().await.unwrap();

    assert!(controller.append_live(msg(5, 101)).await);

    let older = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.load_older().await })
    };
    let (request, older_reply) = calls.recv().await.unwrap();
    assert_eq!(request, LoadRequest::older_than(5, 86, 50, LoadPurpose::Older));

    if older_first {
        older_reply.send(Ok(page(5, 36..=85))).unwrap();
        assert_eq!(older.await.unwrap(), LoadOutcome::Loaded { added: 50 });
        backfill_reply.send(Ok(page(5, 51..=85))).unwrap();
        controller.wait_for_backfill().await;
    } else {
        backfill_reply.send(Ok(page(5, 51..=85))).unwrap();
        controller.wait_for_backfill().await;
        older_reply.send(Ok(page(5, 36..=85))).unwrap();
        assert_eq!(older.await.unwrap(), LoadOutcome::Loaded { added: 15 });
    }

    ids(&controller).await
}

#[tokio::test]
async fn test_arrival_order_does_not_change_window() {
    let a = race(true).await;
    let b = race(false).await;
    assert_eq!(a, b);
    assert_eq!(a, (36..=101).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_switch_before_first_page_discards_old_result() {
    for old_resolves_first in [true, false] {
        let (controller, mut calls) = setup();

        let first = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.select_conversation(1).await })
        };
        let (_, reply_x) = calls.recv().await.unwrap();

        let second = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.select_conversation(2).await })
        };
        let (request_y, reply_y) = calls.recv().await.unwrap();
        assert_eq!(request_y.conversation_id, 2);

        if old_resolves_first {
            reply_x.send(Ok(page(1, 1..=3))).unwrap();
            reply_y.send(Ok(page(2, 10..=12))).unwrap();
        } else {
            reply_y.send(Ok(page(2, 10..=12))).unwrap();
            reply_x.send(Ok(page(1, 1..=3))).unwrap();
        }

        assert_eq!(first.await.unwrap().unwrap(), LoadOutcome::Cancelled);
        assert_eq!(second.await.unwrap().unwrap(), LoadOutcome::Loaded { added: 3 });
        assert_eq!(controller.selected_conversation().await, Some(2));
        assert_eq!(ids(&controller).await, vec![10, 11, 12]);
    }
}

#[tokio::test]
async fn test_stale_failure_is_not_surfaced() {
    let (controller, mut calls) = setup();

    let first = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.select_conversation(1).await })
    };
    let (_, reply_x) = calls.recv().await.unwrap();
    let second = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.select_conversation(2).await })
    };
    let (_, reply_y) = calls.recv().await.unwrap();

    reply_x.send(Err(StreamError::Status(502, "bad gateway".to_string()))).unwrap();
    assert_eq!(first.await.unwrap().unwrap(), LoadOutcome::Cancelled);

    reply_y.send(Ok(page(2, 1..=2))).unwrap();
    second.await.unwrap().unwrap();
    assert_eq!(controller.state().await, StreamState::Ready);
}

#[tokio::test]
async fn test_older_page_from_previous_selection_is_dropped() {
    let (controller, mut calls) = setup();
    open_with(&controller, &mut calls, 1, page(1, 20..=25)).await;

    let older = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.load_older().await })
    };
    let (_, older_reply) = calls.recv().await.unwrap();

    open_with(&controller, &mut calls, 2, page(2, 100..=102)).await;
    older_reply.send(Ok(page(1, 1..=19))).unwrap();

    assert_eq!(older.await.unwrap(), LoadOutcome::Cancelled);
    assert_eq!(ids(&controller).await, vec![100, 101, 102]);
    assert!(!controller.is_loading_older().await);
}

#[tokio::test]
async fn test_load_older_is_not_reentrant() {
    let (controller, mut calls) = setup();
    open_with(&controller, &mut calls, 1, page(1, 20..=25)).await;

    let older = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.load_older().await })
    };
    let (request, reply) = calls.recv().await.unwrap();
    assert_eq!(request.cursor_message_id, 20);
    assert!(controller.is_loading_older().await);

    assert_eq!(controller.load_older().await, LoadOutcome::Skipped);
    assert!(calls.try_recv().is_err());

    reply.send(Ok(page(1, 10..=19))).unwrap();
    assert_eq!(older.await.unwrap(), LoadOutcome::Loaded { added: 10 });
}

#[tokio::test]
async fn test_background_failures_leave_window_untouched() {
    let (controller, mut calls) = setup();
    open_with(&controller, &mut calls, 3, page(3, 41..=60)).await;

    let (_, backfill_reply) = calls.recv().await.unwrap();
    backfill_reply.send(Err(StreamError::Timeout("slow".to_string()))).unwrap();
    controller.wait_for_backfill().await;
    assert_eq!(controller.state().await, StreamState::Ready);
    assert_eq!(ids(&controller).await, (41..=60).collect::<Vec<_>>());

    let older = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.load_older().await })
    };
    let (_, reply) = calls.recv().await.unwrap();
    reply.send(Err(StreamError::Status(500, "boom".to_string()))).unwrap();
    assert_eq!(older.await.unwrap(), LoadOutcome::Failed);
    assert_eq!(ids(&controller).await, (41..=60).collect::<Vec<_>>());

    // the next scroll retries the same cursor
    let again = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.load_older().await })
    };
    let (request, reply) = calls.recv().await.unwrap();
    assert_eq!(request.cursor_message_id, 41);
    reply.send(Ok(page(3, 30..=40))).unwrap();
    assert_eq!(again.await.unwrap(), LoadOutcome::Loaded { added: 11 });
}

#[tokio::test]
async fn test_empty_older_page_marks_history_exhausted() {
    let (controller, mut calls) = setup();
    open_with(&controller, &mut calls, 3, page(3, 1..=4)).await;

    let older = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.load_older().await })
    };
    let (_, reply) = calls.recv().await.unwrap();
    reply.send(Ok(Vec::new())).unwrap();
    assert_eq!(older.await.unwrap(), LoadOutcome::Empty);

    assert_eq!(controller.load_older().await, LoadOutcome::Exhausted);
    assert!(calls.try_recv().is_err());

    // re-selecting clears the marker
    open_with(&controller, &mut calls, 3, page(3, 1..=4)).await;
    assert!(!controller.is_exhausted().await);
}

#[tokio::test]
async fn test_duplicate_live_delivery_keeps_one_entry() {
    let (controller, mut calls) = setup();
    open_with(&controller, &mut calls, 42, page(42, 1..=3)).await;

    assert_eq!(dispatch_payload(&live_frame(42, 9), &controller).await, Dispatch::Delivered);
    assert_eq!(dispatch_payload(&live_frame(42, 9), &controller).await, Dispatch::Duplicate);

    let window = controller.snapshot().await;
    assert_eq!(window.iter().filter(|m| m.id == 9).count(), 1);
    assert_eq!(window.last().map(|m| m.id), Some(9));
}

#[tokio::test]
async fn test_live_event_for_other_conversation_is_dropped() {
    let (controller, mut calls) = setup();
    open_with(&controller, &mut calls, 2, page(2, 1..=3)).await;

    assert_eq!(dispatch_payload(&live_frame(1, 50), &controller).await, Dispatch::Discarded);
    assert_eq!(ids(&controller).await, vec![1, 2, 3]);

    // switching to the other conversation does not replay it
    open_with(&controller, &mut calls, 1, page(1, 10..=12)).await;
    assert_eq!(ids(&controller).await, vec![10, 11, 12]);
}

#[tokio::test]
async fn test_live_message_during_initial_load_is_kept() {
    let (controller, mut calls) = setup();

    let task = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.select_conversation(8).await })
    };
    let (_, reply) = calls.recv().await.unwrap();
    assert_eq!(controller.state().await, StreamState::InitialLoading);

    assert_eq!(dispatch_payload(&live_frame(8, 7), &controller).await, Dispatch::Delivered);
    reply.send(Ok(page(8, 4..=7))).unwrap();
    task.await.unwrap().unwrap();

    assert_eq!(ids(&controller).await, vec![4, 5, 6, 7]);
}

#[tokio::test]
async fn test_retry_after_initial_failure() {
    let (controller, mut calls) = setup();

    let task = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.select_conversation(4).await })
    };
    let (_, reply) = calls.recv().await.unwrap();
    reply.send(Err(StreamError::Status(500, "down".to_string()))).unwrap();
    assert!(task.await.unwrap().is_err());
    assert_eq!(controller.state().await, StreamState::Failed);

    // pushed while the pane shows the failure; must survive the reload
    assert_eq!(dispatch_payload(&live_frame(4, 9), &controller).await, Dispatch::Delivered);

    let retry = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.retry().await })
    };
    let (request, reply) = calls.recv().await.unwrap();
    assert_eq!(request, LoadRequest::initial(4, 15));
    reply.send(Ok(page(4, 1..=2))).unwrap();
    assert_eq!(retry.await.unwrap().unwrap(), LoadOutcome::Loaded { added: 2 });
    assert_eq!(ids(&controller).await, vec![1, 2, 9]);
    assert_eq!(controller.retry().await.unwrap(), LoadOutcome::Skipped);
}

#[tokio::test]
async fn test_backfill_from_previous_selection_is_dropped() {
    for late_page in [Vec::new(), page(1, 51..=85)] {
        let (controller, mut calls) = setup();
        open_with(&controller, &mut calls, 1, page(1, 86..=100)).await;
        let (request, backfill_reply) = calls.recv().await.unwrap();
        assert_eq!(request.purpose, LoadPurpose::Backfill);

        open_with(&controller, &mut calls, 2, page(2, 1..=3)).await;
        let mut events = controller.emitter().subscribe();

        backfill_reply.send(Ok(late_page)).unwrap();
        controller.wait_for_backfill().await;

        assert_eq!(ids(&controller).await, vec![1, 2, 3]);
        assert_eq!(controller.selected_conversation().await, Some(2));
        assert!(!controller.is_exhausted().await);
        assert!(!controller.is_backfilling().await);
        assert!(events.try_recv().is_err(), "no window event for a stale backfill");
    }
}

#[tokio::test]
async fn test_deselect_during_initial_load_cancels_it() {
    let (controller, mut calls) = setup();
    let mut events = controller.emitter().subscribe();

    let task = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.select_conversation(7).await })
    };
    let (_, reply) = calls.recv().await.unwrap();
    controller.deselect().await;
    reply.send(Ok(page(7, 1..=20))).unwrap();

    assert_eq!(task.await.unwrap().unwrap(), LoadOutcome::Cancelled);
    assert_eq!(controller.state().await, StreamState::Idle);
    assert_eq!(controller.selected_conversation().await, None);
    assert!(controller.snapshot().await.is_empty());
    assert!(events.try_recv().is_err());
    assert!(calls.try_recv().is_err(), "cancelled load must not backfill");
}
