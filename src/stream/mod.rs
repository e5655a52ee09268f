//! Decoding of the workflow service's event-stream response body.
//!
//! The wire format is newline-delimited `event: <type>` / `data: <payload>`
//! line pairs. [`FrameDecoder`] does the framing; [`decode_stream`] drives it
//! from a byte stream and honours a [`CancellationToken`].

mod decoder;


pub use decoder::FrameDecoder;

use serde::Serialize;
use std::fmt;
use std::pin::Pin;
use tokio_util::sync::CancellationToken;

use crate::core::error::ClientError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Data,
    Done,
    Error,
}

impl EventKind {
    /// Unknown announcements fall back to `Data`.
    pub fn parse(s: &str) -> Self {
        match s {
            "done" => Self::Done,
            "error" => Self::Error,
            _ => Self::Data,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Data => "data",
            Self::Done => "done",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One decoded protocol event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum StreamEvent {
    /// A chunk of output text.
    Data(String),
    /// Completion marker. Some services attach the final chunk to it.
    Done(Option<String>),
    /// In-band failure reported by the service.
    Error(String),
}

impl StreamEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Data(_) => EventKind::Data,
            Self::Done(_) => EventKind::Done,
            Self::Error(_) => EventKind::Error,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Data(_))
    }
}

/// Decoded events. Transport failures arrive as `Err` items and end the stream.
pub type EventStream =
    Pin<Box<dyn futures_core::Stream<Item = Result<StreamEvent, ClientError>> + Send>>;

/// Decode a chunked byte stream into [`StreamEvent`]s.
///
/// The stream ends when the source ends, after a transport error, or as soon
/// as `cancel` fires. In every case the source is dropped, which releases the
/// underlying connection. Cancellation is not reported as an error.
pub fn decode_stream<S, B, E>(source: S, cancel: CancellationToken) -> EventStream
where
    S: futures_core::Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: fmt::Display + Send + 'static,
{
    let stream = async_stream::stream! {
        use tokio_stream::StreamExt;

        let mut source = Box::pin(source);
        let mut decoder = FrameDecoder::new();

        'read: loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::debug!(buffered = decoder.buffered_len(), "event stream cancelled");
                    break 'read;
                }
                chunk = source.next() => chunk,
            };

            match next {
                Some(Ok(chunk)) => {
                    for event in decoder.feed(chunk.as_ref()) {
                        if cancel.is_cancelled() {
                            break 'read;
                        }
                        yield Ok(event);
                    }
                }
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "event stream transport failed");
                    yield Err(ClientError::Stream(e.to_string()));
                    break 'read;
                }
                None => {
                    if let Some(event) = decoder.finish() {
                        yield Ok(event);
                    }
                    break 'read;
                }
            }
        }
    };

    Box::pin(stream)
}
