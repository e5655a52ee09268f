use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};

use super::backend::{load_json, save_json, MemoryStorage, StateStorage};
use crate::core::error::StoreError;
use crate::core::session::{Message, NewMessage, Session, DEFAULT_SESSION_TITLE};

/// Storage key of the persisted chat document.
pub const CHAT_STORE_KEY: &str = "chat-store";

/// Full in-memory chat state. Only part of it is persisted, see [`PersistedChat`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatState {
    /// Most recently created first.
    pub sessions: Vec<Session>,
    pub current_session_id: Option<String>,
    /// Process-wide "a stream is running" indicator. Gates new sends.
    pub is_streaming: bool,
}

/// The durable projection of [`ChatState`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedChat {
    #[serde(default)]
    pub sessions: Vec<Session>,
    #[serde(default)]
    pub current_session_id: Option<String>,
}

impl PersistedChat {
    pub fn project(state: &ChatState) -> Self {
        Self {
            sessions: state.sessions.clone(),
            current_session_id: state.current_session_id.clone(),
        }
    }

    /// Rebuild live state. A persisted streaming flag belonged to a stream
    /// that no longer exists, so every flag comes back cleared.
    pub fn restore(self) -> ChatState {
        let mut sessions = self.sessions;
        for message in sessions.iter_mut().flat_map(|s| s.messages.iter_mut()) {
            message.streaming = false;
        }
        ChatState {
            sessions,
            current_session_id: self.current_session_id,
            is_streaming: false,
        }
    }
}

/// Conversation sessions and their messages.
///
/// Every operation takes the state lock once, so no partially applied
/// mutation is ever visible to another task. Changes to the persisted
/// projection are written through to storage before the lock is released.
/// Cloning is cheap and clones share state.
#[derive(Clone)]
pub struct SessionStore {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<ChatState>,
    storage: Arc<dyn StateStorage>,
}

impl SessionStore {
    /// Restore from `storage`. A missing or unreadable document yields empty state.
    pub fn open(storage: Arc<dyn StateStorage>) -> Self {
        let state = match load_json::<PersistedChat>(&*storage, CHAT_STORE_KEY) {
            Ok(Some(persisted)) => persisted.restore(),
            Ok(None) => ChatState::default(),
            Err(e) => {
                tracing::warn!(error = %e, "discarding unreadable chat state");
                ChatState::default()
            }
        };
        tracing::debug!(sessions = state.sessions.len(), "chat state restored");

        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(state),
                storage,
            }),
        }
    }

    pub fn in_memory() -> Self {
        Self::open(Arc::new(MemoryStorage::new()))
    }

    /// Create a session, put it first and make it active.
    pub fn create_session(&self, title: Option<&str>) -> String {
        let session = Session::new(title.unwrap_or(DEFAULT_SESSION_TITLE).to_string());
        let id = session.id.clone();
        self.mutate(|state| {
            state.sessions.insert(0, session);
            state.current_session_id = Some(id.clone());
            ((), true)
        });
        id
    }

    /// Returns whether a session was removed. Clears the active pointer if it
    /// pointed at the removed session.
    pub fn delete_session(&self, session_id: &str) -> bool {
        self.mutate(|state| {
            let before = state.sessions.len();
            state.sessions.retain(|s| s.id != session_id);
            let removed = state.sessions.len() != before;
            if state.current_session_id.as_deref() == Some(session_id) {
                state.current_session_id = None;
                return (removed, true);
            }
            (removed, removed)
        })
    }

    /// Pointer update only; the id is not checked.
    pub fn set_active_session(&self, session_id: Option<&str>) {
        self.mutate(|state| {
            let next = session_id.map(str::to_string);
            let changed = state.current_session_id != next;
            state.current_session_id = next;
            ((), changed)
        });
    }

    pub fn active_session_id(&self) -> Option<String> {
        self.lock().current_session_id.clone()
    }

    /// Snapshot of the active session; `None` if the pointer is unset or dangling.
    pub fn current_session(&self) -> Option<Session> {
        let state = self.lock();
        let id = state.current_session_id.as_deref()?;
        state.sessions.iter().find(|s| s.id == id).cloned()
    }

    pub fn session(&self, session_id: &str) -> Option<Session> {
        self.lock()
            .sessions
            .iter()
            .find(|s| s.id == session_id)
            .cloned()
    }

    pub fn sessions(&self) -> Vec<Session> {
        self.lock().sessions.clone()
    }

    /// Returns whether the session exists.
    pub fn update_session_title(&self, session_id: &str, title: &str) -> bool {
        self.mutate(|state| match find_session(state, session_id) {
            Some(session) => {
                session.title = title.to_string();
                session.touch();
                (true, true)
            }
            None => (false, false),
        })
    }

    /// Append a message and return its id.
    ///
    /// Fails without changing anything if the session does not exist, or if
    /// the new message is streaming while another one in the session already is.
    pub fn add_message(&self, session_id: &str, new: NewMessage) -> Result<String, StoreError> {
        self.mutate(|state| {
            let Some(session) = find_session(state, session_id) else {
                return (Err(StoreError::SessionNotFound(session_id.to_string())), false);
            };
            if new.streaming {
                if let Some(active) = session.streaming_message() {
                    let err = StoreError::StreamInProgress {
                        session_id: session_id.to_string(),
                        message_id: active.id.clone(),
                    };
                    return (Err(err), false);
                }
            }

            let message = Message::from_new(new);
            let id = message.id.clone();
            session.messages.push(message);
            session.touch();
            (Ok(id), true)
        })
    }

    /// Replace a message's content wholesale. Streaming callers pass the full
    /// accumulated text, never a delta. Returns whether the message exists.
    ///
    /// Content of a streaming message is only written to storage once the
    /// message stops streaming; a reload clears the flag anyway.
    pub fn update_message_content(&self, session_id: &str, message_id: &str, content: &str) -> bool {
        self.mutate(|state| {
            let Some(session) = find_session(state, session_id) else {
                return (false, false);
            };
            let Some(message) = session.message_mut(message_id) else {
                return (false, false);
            };
            message.content = content.to_string();
            let durable = !message.streaming;
            session.touch();
            (true, durable)
        })
    }

    /// Append a user message and a streaming assistant placeholder in one
    /// step and raise the streaming indicator. Returns `(user_id, reply_id)`.
    ///
    /// Refused without any change if the session is missing or already has a
    /// streaming message.
    pub fn start_reply(
        &self,
        session_id: &str,
        user: NewMessage,
    ) -> Result<(String, String), StoreError> {
        self.mutate(|state| {
            let Some(session) = find_session(state, session_id) else {
                return (Err(StoreError::SessionNotFound(session_id.to_string())), false);
            };
            if let Some(active) = session.streaming_message() {
                let err = StoreError::StreamInProgress {
                    session_id: session_id.to_string(),
                    message_id: active.id.clone(),
                };
                return (Err(err), false);
            }

            let user = Message::from_new(NewMessage {
                streaming: false,
                ..user
            });
            let reply = Message::from_new(NewMessage::assistant_placeholder());
            let ids = (user.id.clone(), reply.id.clone());
            session.messages.push(user);
            session.messages.push(reply);
            session.touch();
            state.is_streaming = true;
            (Ok(ids), true)
        })
    }

    /// Set a message's streaming flag. Returns whether anything changed.
    ///
    /// Setting a flag to its current value is a no-op. Turning it on while a
    /// different message in the same session is streaming is refused.
    pub fn set_message_streaming(
        &self,
        session_id: &str,
        message_id: &str,
        streaming: bool,
    ) -> Result<bool, StoreError> {
        self.mutate(|state| {
            let Some(session) = find_session(state, session_id) else {
                return (Err(StoreError::SessionNotFound(session_id.to_string())), false);
            };
            if streaming {
                if let Some(active) = session.streaming_message() {
                    if active.id != message_id {
                        let err = StoreError::StreamInProgress {
                            session_id: session_id.to_string(),
                            message_id: active.id.clone(),
                        };
                        return (Err(err), false);
                    }
                }
            }
            let Some(message) = session.message_mut(message_id) else {
                return (Err(StoreError::MessageNotFound(message_id.to_string())), false);
            };
            if message.streaming == streaming {
                return (Ok(false), false);
            }
            message.streaming = streaming;
            session.touch();
            (Ok(true), true)
        })
    }

    pub fn set_streaming(&self, streaming: bool) {
        self.lock().is_streaming = streaming;
    }

    pub fn is_streaming(&self) -> bool {
        self.lock().is_streaming
    }

    /// Drop every session, the active pointer and the streaming indicator,
    /// and remove the persisted document.
    pub fn clear_all(&self) {
        let mut state = self.lock();
        *state = ChatState::default();
        if let Err(e) = self.inner.storage.remove(CHAT_STORE_KEY) {
            tracing::warn!(error = %e, "failed to remove chat state");
        }
    }

    /// Full in-memory snapshot, including the unpersisted indicator.
    pub fn snapshot(&self) -> ChatState {
        self.lock().clone()
    }

    /// Run `f` under the lock. `f` reports whether the persisted projection
    /// changed; if so it is saved before the lock is released.
    fn mutate<R>(&self, f: impl FnOnce(&mut ChatState) -> (R, bool)) -> R {
        let mut state = self.lock();
        let (result, changed) = f(&mut *state);
        if changed {
            self.persist(&state);
        }
        result
    }

    fn persist(&self, state: &ChatState) {
        let projection = PersistedChat::project(state);
        if let Err(e) = save_json(&*self.inner.storage, CHAT_STORE_KEY, &projection) {
            tracing::warn!(error = %e, "failed to persist chat state");
        }
    }

    fn lock(&self) -> MutexGuard<'_, ChatState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn find_session<'a>(state: &'a mut ChatState, session_id: &str) -> Option<&'a mut Session> {
    state.sessions.iter_mut().find(|s| s.id == session_id)
}
