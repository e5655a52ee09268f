//! Applies workflow replies to the session store.
//!
//! [`ChatEngine::send`] is the consumer loop: it records the user turn, opens
//! an assistant placeholder, and folds decoded stream events into it until a
//! terminal event, an error, exhaustion or cancellation.

mod engine;

#[cfg(test)]
mod tests;

pub use engine::{ChatEngine, ChatEvent, Reply, ReplyOutcome, ERROR_MARKER_PREFIX};
