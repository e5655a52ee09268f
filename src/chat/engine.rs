use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::client::WorkflowApi;
use crate::core::config::ChatSettings;
use crate::core::error::{ChatError, StoreError};
use crate::core::session::NewMessage;
use crate::core::workflow::{ResponseStatus, WorkflowRequest};
use crate::storage::SessionStore;
use crate::stream::StreamEvent;

/// Prefix of the content that replaces a failed reply.
pub const ERROR_MARKER_PREFIX: &str = "错误: ";

fn error_marker(message: impl std::fmt::Display) -> String {
    format!("{ERROR_MARKER_PREFIX}{message}")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyOutcome {
    /// The reply ran to completion.
    Completed,
    /// The reply was replaced with an error marker.
    Failed(String),
    /// Stopped by the caller; partial content is kept.
    Cancelled,
}

/// Final state of one assistant reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub session_id: String,
    pub message_id: String,
    pub content: String,
    pub outcome: ReplyOutcome,
}

/// Progress of a reply started with [`ChatEngine::run`].
#[derive(Debug, Clone)]
pub enum ChatEvent {
    Started {
        session_id: String,
        message_id: String,
    },
    Delta {
        text: String,
    },
    Finished(Reply),
    /// The send was refused or could not start.
    Error {
        error: String,
    },
}

/// Clears the message streaming flag and the global indicator when dropped,
/// so the cleanup runs however the send ends, including when its future is
/// dropped mid-stream.
struct StreamGuard {
    store: SessionStore,
    session_id: String,
    message_id: String,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        if let Err(e) = self
            .store
            .set_message_streaming(&self.session_id, &self.message_id, false)
        {
            tracing::debug!(error = %e, "streaming flag already gone");
        }
        self.store.set_streaming(false);
    }
}

#[derive(Clone)]
pub struct ChatEngine {
    api: Arc<dyn WorkflowApi>,
    store: SessionStore,
    settings: Arc<RwLock<ChatSettings>>,
}

impl ChatEngine {
    pub fn new(api: Arc<dyn WorkflowApi>, store: SessionStore, settings: ChatSettings) -> Self {
        Self {
            api,
            store,
            settings: Arc::new(RwLock::new(settings)),
        }
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn settings(&self) -> ChatSettings {
        self.settings
            .read()
            .map(|s| s.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }

    pub fn set_use_streaming(&self, use_streaming: bool) {
        let mut guard = self.settings.write().unwrap_or_else(|e| e.into_inner());
        guard.use_streaming = use_streaming;
    }

    /// Run [`send`](Self::send) on its own task, reporting progress on the
    /// returned channel. Cancel through the returned token.
    pub fn run(
        &self,
        session_id: Option<String>,
        input: String,
    ) -> (mpsc::Receiver<ChatEvent>, CancellationToken) {
        let (tx, rx) = mpsc::channel(256);
        let cancel = CancellationToken::new();

        let engine = self.clone();
        let cancel_clone = cancel.clone();

        tokio::spawn(async move {
            let result = engine
                .send_inner(session_id.as_deref(), &input, cancel_clone, Some(&tx))
                .await;

            let event = match result {
                Ok(reply) => ChatEvent::Finished(reply),
                Err(e) => ChatEvent::Error {
                    error: e.to_string(),
                },
            };
            let _ = tx.send(event).await;
        });

        (rx, cancel)
    }

    /// Send `input` to the configured workflow and apply the reply.
    ///
    /// Targets `session_id`, or the active session, creating one if there is
    /// none. Fails with [`ChatError::Busy`] while the target session already
    /// has a reply streaming. Transport and in-band failures do not fail the
    /// call; they end up in the reply as an error marker.
    pub async fn send(
        &self,
        session_id: Option<&str>,
        input: &str,
        cancel: CancellationToken,
    ) -> Result<Reply, ChatError> {
        self.send_inner(session_id, input, cancel, None).await
    }

    async fn send_inner(
        &self,
        session_id: Option<&str>,
        input: &str,
        cancel: CancellationToken,
        events: Option<&mpsc::Sender<ChatEvent>>,
    ) -> Result<Reply, ChatError> {
        let session_id = self.resolve_session(session_id);
        let settings = self.settings();

        let (_, message_id) = self
            .store
            .start_reply(&session_id, NewMessage::user(input))
            .map_err(|e| match e {
                StoreError::StreamInProgress { .. } => ChatError::Busy,
                other => other.into(),
            })?;

        let _guard = StreamGuard {
            store: self.store.clone(),
            session_id: session_id.clone(),
            message_id: message_id.clone(),
        };
        tracing::debug!(
            session = %session_id,
            message = %message_id,
            streaming = settings.use_streaming,
            "reply started"
        );
        if let Some(tx) = events {
            let _ = tx
                .send(ChatEvent::Started {
                    session_id: session_id.clone(),
                    message_id: message_id.clone(),
                })
                .await;
        }

        let request = WorkflowRequest::new(&settings.workflow, input)
            .with_timeout(settings.timeout_secs);
        let (content, outcome) = if settings.use_streaming {
            self.apply_stream(&session_id, &message_id, request, cancel, events)
                .await
        } else {
            self.apply_execute(&session_id, &message_id, request, cancel)
                .await
        };

        match &outcome {
            ReplyOutcome::Failed(error) => {
                tracing::warn!(session = %session_id, error = %error, "reply failed")
            }
            ReplyOutcome::Cancelled => tracing::info!(session = %session_id, "reply cancelled"),
            ReplyOutcome::Completed => {
                tracing::debug!(session = %session_id, chars = content.len(), "reply completed")
            }
        }

        Ok(Reply {
            session_id,
            message_id,
            content,
            outcome,
        })
    }

    /// The given session, else the active one, else a new one.
    fn resolve_session(&self, session_id: Option<&str>) -> String {
        match session_id {
            Some(id) => id.to_string(),
            None => match self.store.current_session() {
                Some(session) => session.id,
                None => self.store.create_session(None),
            },
        }
    }

    /// Fold stream events into the message. Content always holds the full
    /// accumulated text.
    async fn apply_stream(
        &self,
        session_id: &str,
        message_id: &str,
        request: WorkflowRequest,
        cancel: CancellationToken,
        events: Option<&mpsc::Sender<ChatEvent>>,
    ) -> (String, ReplyOutcome) {
        let mut stream = match self.api.stream(request, cancel.clone()).await {
            Ok(stream) => stream,
            Err(e) => return self.fail(session_id, message_id, e.to_string()),
        };

        let mut content = String::new();
        while let Some(item) = stream.next().await {
            let chunk = match item {
                Ok(StreamEvent::Data(chunk)) => chunk,
                Ok(StreamEvent::Done(last)) => {
                    if let Some(last) = last.filter(|l| !l.is_empty()) {
                        content.push_str(&last);
                        self.store
                            .update_message_content(session_id, message_id, &content);
                        emit_delta(events, last).await;
                    }
                    return (content, ReplyOutcome::Completed);
                }
                Ok(StreamEvent::Error(message)) => {
                    return self.fail(session_id, message_id, message);
                }
                Err(e) => return self.fail(session_id, message_id, e.to_string()),
            };

            content.push_str(&chunk);
            self.store
                .update_message_content(session_id, message_id, &content);
            emit_delta(events, chunk).await;
        }

        let outcome = if cancel.is_cancelled() {
            ReplyOutcome::Cancelled
        } else {
            ReplyOutcome::Completed
        };
        (content, outcome)
    }

    async fn apply_execute(
        &self,
        session_id: &str,
        message_id: &str,
        request: WorkflowRequest,
        cancel: CancellationToken,
    ) -> (String, ReplyOutcome) {
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return (String::new(), ReplyOutcome::Cancelled),
            response = self.api.execute(request) => response,
        };

        match response {
            Ok(resp) => match (resp.status, resp.result) {
                (ResponseStatus::Success, Some(result)) if !result.is_empty() => {
                    self.store
                        .update_message_content(session_id, message_id, &result);
                    (result, ReplyOutcome::Completed)
                }
                _ => {
                    let error = resp
                        .error
                        .filter(|e| !e.is_empty())
                        .unwrap_or_else(|| "unknown error".to_string());
                    self.fail(session_id, message_id, error)
                }
            },
            Err(e) => self.fail(session_id, message_id, e.to_string()),
        }
    }

    fn fail(&self, session_id: &str, message_id: &str, error: String) -> (String, ReplyOutcome) {
        let marker = error_marker(&error);
        self.store
            .update_message_content(session_id, message_id, &marker);
        (marker, ReplyOutcome::Failed(error))
    }
}

async fn emit_delta(events: Option<&mpsc::Sender<ChatEvent>>, text: String) {
    if let Some(tx) = events {
        let _ = tx.send(ChatEvent::Delta { text }).await;
    }
}
