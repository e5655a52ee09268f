use super::*;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::client::WorkflowApi;
use crate::core::config::ChatSettings;
use crate::core::error::{ChatError, ClientError};
use crate::core::session::MessageRole;
use crate::core::workflow::{ResponseStatus, WorkflowRequest, WorkflowResponse};
use crate::storage::SessionStore;
use crate::stream::{decode_stream, EventStream};

type Chunk = Result<Vec<u8>, String>;

/// What the fake service does for the next call.
enum Script {
    /// Stream these chunks, then end.
    Chunks(Vec<&'static str>),
    /// Stream whatever the test pushes into the channel.
    Channel(mpsc::Receiver<Chunk>),
    /// Refuse to open the stream.
    Reject(ClientError),
    Execute(Result<WorkflowResponse, ClientError>),
}

#[derive(Default)]
struct FakeApi {
    scripts: Mutex<VecDeque<Script>>,
    requests: Mutex<Vec<WorkflowRequest>>,
}

impl FakeApi {
    fn with(scripts: impl IntoIterator<Item = Script>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into_iter().collect()),
            requests: Mutex::default(),
        })
    }

    fn next_script(&self, request: WorkflowRequest) -> Script {
        self.requests.lock().unwrap().push(request);
        self.scripts
            .lock()
            .unwrap()
            .pop_front()
            .expect("unexpected workflow call")
    }

    fn requests(&self) -> Vec<WorkflowRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl WorkflowApi for FakeApi {
    async fn execute(&self, request: WorkflowRequest) -> Result<WorkflowResponse, ClientError> {
        match self.next_script(request) {
            Script::Execute(result) => result,
            _ => panic!("execute called on a streaming script"),
        }
    }

    async fn stream(
        &self,
        request: WorkflowRequest,
        cancel: CancellationToken,
    ) -> Result<EventStream, ClientError> {
        match self.next_script(request) {
            Script::Chunks(chunks) => {
                let source = tokio_stream::iter(chunks.into_iter().map(Ok::<_, String>));
                Ok(decode_stream(source, cancel))
            }
            Script::Channel(rx) => Ok(decode_stream(ReceiverStream::new(rx), cancel)),
            Script::Reject(e) => Err(e),
            Script::Execute(_) => panic!("stream called on an execute script"),
        }
    }
}

fn engine(api: Arc<FakeApi>) -> ChatEngine {
    ChatEngine::new(api, SessionStore::in_memory(), ChatSettings::default())
}

fn chunk(s: &str) -> Chunk {
    Ok(s.as_bytes().to_vec())
}

/// Wait until the store shows `content` for the message.
async fn wait_for_content(store: &SessionStore, session_id: &str, expected: &str) -> String {
    for _ in 0..200 {
        if let Some(session) = store.session(session_id) {
            if let Some(msg) = session.streaming_message() {
                if msg.content == expected {
                    return msg.id.clone();
                }
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("content never reached {expected:?}");
}

fn assert_idle(store: &SessionStore) {
    assert!(!store.is_streaming());
    for session in store.sessions() {
        assert!(session.streaming_message().is_none());
    }
}

#[tokio::test]
async fn test_streamed_reply_accumulates() {
    let api = FakeApi::with([Script::Chunks(vec![
        "event: data\ndata: Hel",
        "lo\n\nevent: data\ndata: , wor",
        "ld\n\nevent: done\ndata: !\n\n",
    ])]);
    let engine = engine(api.clone());

    let reply = engine
        .send(None, "greet me", CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(reply.outcome, ReplyOutcome::Completed);
    assert_eq!(reply.content, "Hello, world!");

    let session = engine.store().session(&reply.session_id).unwrap();
    assert_eq!(session.messages.len(), 2);
    assert_eq!(session.messages[0].role, MessageRole::User);
    assert_eq!(session.messages[0].content, "greet me");
    assert_eq!(session.messages[1].id, reply.message_id);
    assert_eq!(session.messages[1].content, "Hello, world!");
    assert_idle(engine.store());

    let requests = api.requests();
    assert_eq!(requests[0].workflow, "agent");
    assert_eq!(requests[0].input, "greet me");
    assert_eq!(requests[0].timeout, Some(180));
}

#[tokio::test]
async fn test_send_creates_session_when_none_active() {
    let api = FakeApi::with([Script::Chunks(vec!["data: ok\n", "data: done\n"])]);
    let engine = engine(api);
    assert!(engine.store().current_session().is_none());

    let reply = engine
        .send(None, "hi", CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(
        engine.store().active_session_id().as_deref(),
        Some(reply.session_id.as_str())
    );
    assert_eq!(reply.content, "ok");
}

#[tokio::test]
async fn test_exhaustion_without_done_still_cleans_up() {
    let api = FakeApi::with([Script::Chunks(vec!["data: partial\n"])]);
    let engine = engine(api);

    let reply = engine
        .send(None, "hi", CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(reply.outcome, ReplyOutcome::Completed);
    assert_eq!(reply.content, "partial");
    assert_idle(engine.store());
}

#[tokio::test]
async fn test_cancel_after_two_chunks_keeps_partial_content() {
    let (tx, rx) = mpsc::channel(8);
    let api = FakeApi::with([Script::Channel(rx)]);
    let engine = engine(api);
    let session_id = engine.store().create_session(None);
    let cancel = CancellationToken::new();

    let task = {
        let engine = engine.clone();
        let session_id = session_id.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { engine.send(Some(&session_id), "hi", cancel).await })
    };

    tx.send(chunk("event: data\ndata: one \n\n")).await.unwrap();
    tx.send(chunk("event: data\ndata: two\n\n")).await.unwrap();
    wait_for_content(engine.store(), &session_id, "one two").await;
    assert!(engine.store().is_streaming());

    cancel.cancel();
    let reply = task.await.unwrap().unwrap();

    assert_eq!(reply.outcome, ReplyOutcome::Cancelled);
    assert_eq!(reply.content, "one two");
    let session = engine.store().session(&session_id).unwrap();
    assert_eq!(session.message(&reply.message_id).unwrap().content, "one two");
    assert_idle(engine.store());

    // Nothing arriving after the cancel is applied
    let _ = tx.send(chunk("data: three\n")).await;
    let session = engine.store().session(&session_id).unwrap();
    assert_eq!(session.message(&reply.message_id).unwrap().content, "one two");
}

#[tokio::test]
async fn test_dropping_send_future_cleans_up() {
    let (tx, rx) = mpsc::channel(8);
    let api = FakeApi::with([Script::Channel(rx)]);
    let engine = engine(api);
    let session_id = engine.store().create_session(None);

    let task = {
        let engine = engine.clone();
        let session_id = session_id.clone();
        tokio::spawn(async move {
            engine
                .send(Some(&session_id), "hi", CancellationToken::new())
                .await
        })
    };

    tx.send(chunk("data: half\n")).await.unwrap();
    wait_for_content(engine.store(), &session_id, "half").await;

    task.abort();
    let _ = task.await;

    assert_idle(engine.store());
    let session = engine.store().session(&session_id).unwrap();
    assert_eq!(session.messages[1].content, "half");
}

#[tokio::test]
async fn test_error_event_replaces_content_and_stops() {
    let api = FakeApi::with([Script::Chunks(vec![
        "event: data\ndata: some text\n\n",
        "event: error\ndata: {\"error\":\"workflow crashed\"}\n\n",
        "event: data\ndata: ignored\n\n",
    ])]);
    let engine = engine(api);

    let reply = engine
        .send(None, "hi", CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(reply.outcome, ReplyOutcome::Failed("workflow crashed".into()));
    assert_eq!(reply.content, "错误: workflow crashed");
    let session = engine.store().session(&reply.session_id).unwrap();
    assert_eq!(session.messages[1].content, "错误: workflow crashed");
    assert_idle(engine.store());
}

#[tokio::test]
async fn test_rejected_stream_becomes_error_marker() {
    let api = FakeApi::with([Script::Reject(ClientError::Http {
        status: 500,
        body: "oops".into(),
    })]);
    let engine = engine(api);

    let reply = engine
        .send(None, "hi", CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(reply.content, "错误: HTTP 500: oops");
    assert!(matches!(reply.outcome, ReplyOutcome::Failed(_)));
    assert_idle(engine.store());
}

#[tokio::test]
async fn test_transport_failure_mid_stream() {
    let (tx, rx) = mpsc::channel(8);
    tx.send(chunk("data: partial\n")).await.unwrap();
    tx.send(Err("connection reset".to_string())).await.unwrap();
    drop(tx);

    let api = FakeApi::with([Script::Channel(rx)]);
    let engine = engine(api);

    let reply = engine
        .send(None, "hi", CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(reply.content, "错误: Stream error: connection reset");
    assert_idle(engine.store());
}

#[tokio::test]
async fn test_non_streaming_mode() {
    let api = FakeApi::with([
        Script::Execute(Ok(WorkflowResponse {
            status: ResponseStatus::Success,
            result: Some("full answer".into()),
            error: None,
        })),
        Script::Execute(Ok(WorkflowResponse {
            status: ResponseStatus::Success,
            result: None,
            error: None,
        })),
        Script::Execute(Err(ClientError::Business("quota exceeded".into()))),
    ]);
    let engine = engine(api.clone());
    engine.set_use_streaming(false);
    assert!(!engine.settings().use_streaming);

    let ok = engine
        .send(None, "q1", CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(ok.outcome, ReplyOutcome::Completed);
    assert_eq!(ok.content, "full answer");

    let empty = engine
        .send(None, "q2", CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(empty.content, "错误: unknown error");

    let failed = engine
        .send(None, "q3", CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(failed.content, "错误: quota exceeded");

    let session = engine.store().current_session().unwrap();
    assert_eq!(session.messages.len(), 6);
    assert_idle(engine.store());
    assert_eq!(api.requests().len(), 3);
}

#[tokio::test]
async fn test_busy_session_refuses_second_send() {
    let (tx, rx) = mpsc::channel(8);
    let api = FakeApi::with([Script::Channel(rx)]);
    let engine = engine(api.clone());
    let session_id = engine.store().create_session(None);

    let task = {
        let engine = engine.clone();
        let session_id = session_id.clone();
        tokio::spawn(async move {
            engine
                .send(Some(&session_id), "first", CancellationToken::new())
                .await
        })
    };
    tx.send(chunk("data: working\n")).await.unwrap();
    wait_for_content(engine.store(), &session_id, "working").await;

    let err = engine
        .send(Some(&session_id), "second", CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ChatError::Busy));
    assert_eq!(engine.store().session(&session_id).unwrap().messages.len(), 2);

    drop(tx);
    task.await.unwrap().unwrap();
    assert_eq!(api.requests().len(), 1);
    assert_idle(engine.store());
}

#[tokio::test]
async fn test_send_to_missing_session() {
    let engine = engine(FakeApi::with([]));
    let err = engine
        .send(Some("missing"), "hi", CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ChatError::Store(_)));
}

#[tokio::test]
async fn test_concurrent_sessions_stay_separate() {
    let (tx_a, rx_a) = mpsc::channel(8);
    let (tx_b, rx_b) = mpsc::channel(8);
    let api = FakeApi::with([Script::Channel(rx_a), Script::Channel(rx_b)]);
    let engine = engine(api);
    let a = engine.store().create_session(Some("a"));
    let b = engine.store().create_session(Some("b"));

    let spawn = |session_id: String| {
        let engine = engine.clone();
        tokio::spawn(async move {
            engine
                .send(Some(&session_id), "go", CancellationToken::new())
                .await
        })
    };
    let task_a = spawn(a.clone());
    wait_for_content(engine.store(), &a, "").await;
    let task_b = spawn(b.clone());
    wait_for_content(engine.store(), &b, "").await;

    for i in 0..5 {
        tx_a.send(chunk(&format!("data: a{i}\n"))).await.unwrap();
        tx_b.send(chunk(&format!("data: b{i}\n"))).await.unwrap();
    }
    drop(tx_a);
    drop(tx_b);

    let reply_a = task_a.await.unwrap().unwrap();
    let reply_b = task_b.await.unwrap().unwrap();

    assert_eq!(reply_a.content, "a0a1a2a3a4");
    assert_eq!(reply_b.content, "b0b1b2b3b4");
    assert_eq!(reply_a.session_id, a);
    assert_eq!(reply_b.session_id, b);
    assert_idle(engine.store());
}

#[tokio::test]
async fn test_run_reports_progress() {
    let api = FakeApi::with([Script::Chunks(vec![
        "data: a\n",
        "data: b\n",
        "event: done\ndata: c\n",
    ])]);
    let engine = engine(api);

    let (mut rx, _cancel) = engine.run(None, "hi".into());
    let mut deltas = String::new();
    let mut started = false;
    let mut finished = None;
    while let Some(event) = rx.recv().await {
        match event {
            ChatEvent::Started { .. } => started = true,
            ChatEvent::Delta { text } => deltas.push_str(&text),
            ChatEvent::Finished(reply) => finished = Some(reply),
            ChatEvent::Error { error } => panic!("unexpected error: {error}"),
        }
    }

    assert!(started);
    assert_eq!(deltas, "abc");
    assert_eq!(finished.unwrap().content, "abc");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_sends_to_one_session_leave_one_exchange() {
    let (tx, rx) = mpsc::channel(8);
    let api = FakeApi::with([Script::Channel(rx)]);
    let engine = engine(api.clone());
    let session_id = engine.store().create_session(None);

    let tasks: Vec<_> = (0..8)
        .map(|i| {
            let engine = engine.clone();
            let session_id = session_id.clone();
            tokio::spawn(async move {
                engine
                    .send(Some(&session_id), &format!("send {i}"), CancellationToken::new())
                    .await
            })
        })
        .collect();

    // Hold the winner's stream open until every loser has been refused
    wait_for_content(engine.store(), &session_id, "").await;
    tokio::time::timeout(Duration::from_secs(5), async {
        while tasks.iter().filter(|t| t.is_finished()).count() < 7 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    tx.send(chunk("data: reply\n")).await.unwrap();
    drop(tx);

    let mut completed = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(reply) => {
                assert_eq!(reply.content, "reply");
                completed += 1;
            }
            Err(ChatError::Busy) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    assert_eq!(completed, 1);
    assert_eq!(api.requests().len(), 1);
    let session = engine.store().session(&session_id).unwrap();
    assert_eq!(session.messages.len(), 2);
    assert_eq!(session.messages[0].role, MessageRole::User);
    assert_eq!(session.messages[1].content, "reply");
    assert_idle(engine.store());
}
