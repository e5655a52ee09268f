//! Client for a remote workflow-execution service: request/response and
//! streamed calls, persisted chat sessions, and a bounded transcript of the
//! traffic.

pub mod chat;
pub mod cli;
pub mod client;
pub mod core;
pub mod storage;
pub mod stream;

pub use chat::{ChatEngine, Reply, ReplyOutcome};
pub use client::{TranscriptLog, WorkflowApi, WorkflowClient};
pub use storage::{FileStorage, MemoryStorage, SessionStore, SettingsStore, StateStorage};
pub use stream::{decode_stream, EventStream, FrameDecoder, StreamEvent};
