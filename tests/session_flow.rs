mod common;

use chatsync::connection::ConnectionState;
use chatsync::models::{Message, Role};
use chatsync::session::{SessionHooks, TurnOutcome};
use common::{eventually, fast_config, Harness, Script};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const HELLO_TURN: &str = "event: connected\ndata: {}\n\n\
                          event: llm_chunk\ndata: {\"content\":\"Hel\"}\n\n\
                          event: llm_chunk\ndata: {\"content\":\"lo\"}\n\n\
                          event: llm_complete\ndata: {\"content\":\"Hello\",\"message_id\":\"srv-reply-1\"}\n\n";

#[derive(Default)]
struct RecordingHooks {
    replies: Mutex<Vec<String>>,
    failures: Mutex<Vec<String>>,
}

impl SessionHooks for RecordingHooks {
    fn on_assistant_message(&self, message: &Message) {
        self.replies.lock().unwrap().push(message.content.clone());
    }

    fn on_turn_failed(&self, _conversation_id: &str, reason: &str) {
        self.failures.lock().unwrap().push(reason.to_string());
    }
}

#[tokio::test]
async fn completed_turn_persists_the_final_text() {
    let mut harness = Harness::new(vec![Script::Body(HELLO_TURN)]).await;
    let hooks = Arc::new(RecordingHooks::default());
    harness.session = harness.session.clone().with_hooks(hooks.clone());
    harness.synced_conversation("c1").await;

    let outcome = harness.session.send_message("c1", "Hi").await.unwrap();
    let reply = match outcome {
        TurnOutcome::Completed(reply) => reply,
        other => panic!("unexpected outcome {:?}", other),
    };
    assert_eq!(reply.content, "Hello");
    assert_eq!(reply.server_id.as_deref(), Some("srv-reply-1"));
    assert!(reply.synced);

    let history = harness.session.history("c1").await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].role, Role::User);
    assert_eq!(history[0].server_id.as_deref(), Some("srv-msg-1"));
    assert!(history[0].synced);
    assert!(!history[0].optimistic);
    assert_eq!(history[1].role, Role::Assistant);
    assert_eq!(history[1].content, "Hello");

    let status = harness.session.status();
    assert!(status.partial.is_empty());
    assert!(status.error.is_none());
    assert!(!status.pending_sync);
    assert_eq!(status.connection, ConnectionState::Disconnected);
    assert!(harness.session.registry().is_empty());
    assert_eq!(*hooks.replies.lock().unwrap(), vec!["Hello"]);
}

#[tokio::test]
async fn completion_without_text_persists_the_buffer() {
    let turn = "event: llm_chunk\ndata: {\"content\":\"Hel\"}\n\n\
                event: llm_chunk\ndata: {\"delta\":{\"text\":\"lo\"}}\n\n\
                data: [DONE]\n\n";
    let harness = Harness::new(vec![Script::Body(turn)]).await;
    harness.synced_conversation("c1").await;

    let outcome = harness.session.send_message("c1", "Hi").await.unwrap();
    assert!(matches!(outcome, TurnOutcome::Completed(ref m) if m.content == "Hello"));
}

#[tokio::test]
async fn stream_errors_discard_the_partial_reply() {
    let turn = "event: llm_chunk\ndata: {\"content\":\"Hal\"}\n\n\
                event: error\ndata: {\"message\":\"model overloaded\"}\n\n";
    let mut harness = Harness::new(vec![Script::Body(turn)]).await;
    let hooks = Arc::new(RecordingHooks::default());
    harness.session = harness.session.clone().with_hooks(hooks.clone());
    harness.synced_conversation("c1").await;

    let outcome = harness.session.send_message("c1", "Hi").await.unwrap();
    assert_eq!(outcome, TurnOutcome::Failed("model overloaded".to_string()));

    let history = harness.session.history("c1").await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].role, Role::User);

    let status = harness.session.status();
    assert_eq!(status.error.as_deref(), Some("model overloaded"));
    assert!(status.partial.is_empty());
    assert_eq!(*hooks.failures.lock().unwrap(), vec!["model overloaded"]);
}

#[tokio::test]
async fn stalled_stream_times_out() {
    let mut config = fast_config();
    config.stall_timeout = Duration::from_millis(300);
    let harness = Harness::with_config(
        vec![Script::Hang("event: connected\ndata: {}\n\nevent: llm_chunk\ndata: {\"content\":\"Hel\"}\n\n")],
        config,
    )
    .await;
    harness.synced_conversation("c1").await;

    let outcome = harness.session.send_message("c1", "Hi").await.unwrap();
    assert_eq!(outcome, TurnOutcome::TimedOut);

    let history = harness.session.history("c1").await.unwrap();
    assert_eq!(history.len(), 1);
    let status = harness.session.status();
    assert!(status.error.unwrap().contains("Timed out"));
    assert!(status.partial.is_empty());
    assert!(harness.session.registry().is_empty());
}

#[tokio::test]
async fn exhausted_retries_fail_the_turn() {
    let harness = Harness::new(vec![Script::Fail, Script::Fail, Script::Fail, Script::Fail]).await;
    harness.synced_conversation("c1").await;

    let outcome = harness.session.send_message("c1", "Hi").await.unwrap();
    match outcome {
        TurnOutcome::Failed(reason) => assert!(reason.contains("after 3 retries")),
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(harness.source.opens(), 4);
    assert_eq!(harness.session.history("c1").await.unwrap().len(), 1);
}

#[tokio::test]
async fn stop_ends_the_turn_without_a_reply() {
    let harness = Harness::new(vec![Script::Hang("event: connected\ndata: {}\n\n")]).await;
    harness.synced_conversation("c1").await;

    let session = harness.session.clone();
    let turn = tokio::spawn(async move { session.send_message("c1", "Hi").await });
    let registry = harness.session.registry().clone();
    eventually(|| {
        let registry = registry.clone();
        async move { registry.is_live("c1") }
    })
    .await;

    assert!(harness.session.stop("c1"));
    let outcome = turn.await.unwrap().unwrap();
    assert_eq!(outcome, TurnOutcome::Stopped);
    assert_eq!(harness.session.history("c1").await.unwrap().len(), 1);
    assert!(harness.session.registry().is_empty());
}

#[tokio::test]
async fn offline_sends_are_queued_and_replayed() {
    let harness = Harness::new(vec![]).await;
    harness.synced_conversation("c1").await;
    harness.api.set_offline(true);

    let outcome = harness.session.send_message("c1", "Hi").await.unwrap();
    let queued = match outcome {
        TurnOutcome::Queued(message) => message,
        other => panic!("unexpected outcome {:?}", other),
    };
    assert!(harness.session.status().pending_sync);
    assert_eq!(harness.source.opens(), 0);
    let stored = harness.storage.get_message(&queued.local_id).await.unwrap().unwrap();
    assert!(!stored.synced);
    assert!(stored.optimistic);

    harness.api.set_offline(false);
    let report = harness.session.sync_pending().await.unwrap();
    assert_eq!(report.synced, 1);
    assert!(!harness.session.status().pending_sync);
    let stored = harness.storage.get_message("srv-msg-1").await.unwrap().unwrap();
    assert_eq!(stored.local_id, queued.local_id);
    assert!(stored.synced);
}

#[tokio::test]
async fn offline_conversations_move_to_their_server_id() {
    let harness = Harness::new(vec![Script::Body(HELLO_TURN)]).await;
    harness.api.set_offline(true);

    let conv = harness.session.start_conversation("Trip").await.unwrap();
    assert!(conv.has_temporary_id());
    assert!(!conv.synced);
    let outcome = harness.session.send_message(&conv.id, "Hi").await.unwrap();
    assert!(matches!(outcome, TurnOutcome::Queued(_)));
    assert!(harness.session.delete_conversation(&conv.id).await.is_err());

    harness.api.set_offline(false);
    let report = harness.session.sync_pending().await.unwrap();
    assert_eq!(report.conversations_synced, 1);
    assert_eq!(report.synced, 1);

    assert!(harness.storage.get_conversation(&conv.id).await.unwrap().is_none());
    let history = harness.session.history("srv-conv-1").await.unwrap();
    assert_eq!(history.len(), 1);
    assert!(history[0].synced);
    assert_eq!(
        *harness.api.sent.lock().unwrap(),
        vec![("srv-conv-1".to_string(), "Hi".to_string())]
    );

    // Now it can go
    harness.session.delete_conversation("srv-conv-1").await.unwrap();
    assert!(harness.session.conversations().await.unwrap().is_empty());
}

#[tokio::test]
async fn recovering_the_stream_replays_older_messages() {
    let harness = Harness::new(vec![Script::Fail, Script::Body(HELLO_TURN)]).await;
    let conv = harness.synced_conversation("c1").await;
    let stale = Message::optimistic_user(&conv.id, "earlier");
    harness.storage.save_message(&stale).await.unwrap();

    let outcome = harness.session.send_message("c1", "Hi").await.unwrap();
    assert!(matches!(outcome, TurnOutcome::Completed(_)));
    assert_eq!(harness.source.opens(), 2);

    let storage = harness.storage.clone();
    eventually(|| {
        let storage = storage.clone();
        async move { storage.count_unsynced_messages().await.unwrap() == 0 }
    })
    .await;
    let mut sent = harness.api.sent_contents();
    sent.sort();
    assert_eq!(sent, vec!["Hi", "earlier"]);
}

#[tokio::test]
async fn reused_frame_ids_do_not_collide_across_turns() {
    // Each turn is a fresh stream, so the server restarts its frame ids
    let first = "event: llm_chunk\ndata: {\"content\":\"o\"}\n\n\
                 id: 2\nevent: llm_complete\ndata: {\"content\":\"one\"}\n\n";
    let second = "event: llm_chunk\ndata: {\"content\":\"t\"}\n\n\
                  id: 2\nevent: llm_complete\ndata: {\"content\":\"two\"}\n\n";
    let harness = Harness::new(vec![Script::Body(first), Script::Body(second)]).await;
    harness.synced_conversation("c1").await;

    for (text, expected) in [("Hi", "one"), ("Again", "two")] {
        let outcome = harness.session.send_message("c1", text).await.unwrap();
        assert!(
            matches!(outcome, TurnOutcome::Completed(ref m) if m.content == expected),
            "unexpected outcome {:?}",
            outcome
        );
        let status = harness.session.status();
        assert!(status.error.is_none());
        assert!(status.partial.is_empty());
        assert_eq!(status.connection, ConnectionState::Disconnected);
    }

    let history = harness.session.history("c1").await.unwrap();
    let replies: Vec<_> = history
        .iter()
        .filter(|m| m.role == Role::Assistant)
        .map(|m| m.content.as_str())
        .collect();
    assert_eq!(history.len(), 4);
    assert_eq!(replies, vec!["one", "two"]);
}

#[tokio::test]
async fn a_reconnect_mid_reply_does_not_repeat_text() {
    // The first stream drops after "Hel"; the reopened one replays the reply
    let dropped = "event: llm_chunk\ndata: {\"content\":\"Hel\"}\n\n";
    let replayed = "event: llm_chunk\ndata: {\"content\":\"Hel\"}\n\n\
                    event: llm_chunk\ndata: {\"content\":\"lo\"}\n\n\
                    data: [DONE]\n\n";
    let harness = Harness::new(vec![Script::Body(dropped), Script::Body(replayed)]).await;
    harness.synced_conversation("c1").await;

    let outcome = harness.session.send_message("c1", "Hi").await.unwrap();
    assert!(
        matches!(outcome, TurnOutcome::Completed(ref m) if m.content == "Hello"),
        "unexpected outcome {:?}",
        outcome
    );
    assert_eq!(harness.source.opens(), 2);

    let history = harness.session.history("c1").await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].content, "Hello");
    assert!(harness.session.status().partial.is_empty());
}

#[tokio::test]
async fn backoff_longer_than_the_stall_window_still_reports_retries() {
    let mut config = fast_config();
    // Shorter than the 350ms the three retries wait in total
    config.stall_timeout = Duration::from_millis(100);
    let harness = Harness::with_config(
        vec![Script::Fail, Script::Fail, Script::Fail, Script::Fail],
        config,
    )
    .await;
    harness.synced_conversation("c1").await;

    let outcome = harness.session.send_message("c1", "Hi").await.unwrap();
    match outcome {
        TurnOutcome::Failed(reason) => assert!(reason.contains("after 3 retries")),
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(harness.source.opens(), 4);
}

#[tokio::test]
async fn status_shows_partial_text_while_streaming() {
    let turn = "event: llm_chunk\ndata: {\"content\":\"Hel\"}\n\n\
                event: llm_chunk\ndata: {\"content\":\"lo\"}\n\n";
    let harness = Harness::new(vec![Script::Hang(turn)]).await;
    harness.synced_conversation("c1").await;

    let session = harness.session.clone();
    let turn = tokio::spawn(async move { session.send_message("c1", "Hi").await });
    let watched = harness.session.clone();
    eventually(|| {
        let watched = watched.clone();
        async move {
            let status = watched.status();
            status.partial == "Hello" && status.connection == ConnectionState::Connected
        }
    })
    .await;
    assert_eq!(harness.session.status().conversation_id.as_deref(), Some("c1"));

    harness.session.stop("c1");
    assert_eq!(turn.await.unwrap().unwrap(), TurnOutcome::Stopped);
    // Nothing partial survives a stop
    assert!(harness.session.status().partial.is_empty());
    assert_eq!(harness.session.history("c1").await.unwrap().len(), 1);
}
