use serde_json::Value;

use super::{EventKind, StreamEvent};

/// Incremental decoder for the `event:` / `data:` line protocol.
///
/// Bytes are buffered until a full line is available, so a frame (or a
/// multi-byte character) split across chunks decodes exactly as if it had
/// arrived in one piece. The type announced by an `event:` line applies to
/// the next `data:` line only; a blank line clears it.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    pending_kind: Option<EventKind>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return the events completed by it.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.buffer[start..].iter().position(|&b| b == b'\n') {
            let end = start + offset;
            let line = String::from_utf8_lossy(&self.buffer[start..end]).into_owned();
            if let Some(event) = self.decode_line(&line) {
                events.push(event);
            }
            start = end + 1;
        }
        // Keep the trailing partial line for the next chunk
        self.buffer.drain(..start);

        events
    }

    /// Flush whatever is left once the transport has ended.
    ///
    /// A final frame without a trailing newline is still a complete frame.
    pub fn finish(&mut self) -> Option<StreamEvent> {
        if self.buffer.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.buffer);
        let line = String::from_utf8_lossy(&rest).into_owned();
        self.decode_line(&line)
    }

    /// Bytes held back waiting for a line terminator.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    fn decode_line(&mut self, line: &str) -> Option<StreamEvent> {
        let line = line.strip_suffix('\r').unwrap_or(line);

        if line.trim().is_empty() {
            self.pending_kind = None;
            return None;
        }

        if let Some(kind) = line.strip_prefix("event:") {
            self.pending_kind = Some(EventKind::parse(kind.trim()));
            return None;
        }

        if let Some(data) = line.strip_prefix("data:") {
            let data = data.strip_prefix(' ').unwrap_or(data);
            return Some(classify(self.pending_kind.take(), data));
        }

        // Comments (`:`), `id:`, `retry:` and anything unknown
        None
    }
}

fn classify(kind: Option<EventKind>, data: &str) -> StreamEvent {
    let parsed: Option<Value> = serde_json::from_str(data).ok();

    match kind {
        Some(EventKind::Error) => StreamEvent::Error(error_message(parsed, data)),
        Some(EventKind::Done) => {
            let text = text_payload(parsed, data);
            StreamEvent::Done((!text.is_empty()).then_some(text))
        }
        Some(EventKind::Data) => StreamEvent::Data(text_payload(parsed, data)),
        None if is_done_sentinel(data) => StreamEvent::Done(None),
        None => StreamEvent::Data(text_payload(parsed, data)),
    }
}

/// JSON string payloads are unwrapped; anything else is kept as sent.
fn text_payload(parsed: Option<Value>, raw: &str) -> String {
    match parsed {
        Some(Value::String(s)) => s,
        _ => raw.to_string(),
    }
}

fn error_message(parsed: Option<Value>, raw: &str) -> String {
    let message = match parsed {
        Some(Value::Object(map)) => match map.get("error") {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => raw.to_string(),
        },
        Some(Value::String(s)) => s,
        _ => raw.to_string(),
    };

    if message.trim().is_empty() {
        "unknown error".into()
    } else {
        message
    }
}

fn is_done_sentinel(data: &str) -> bool {
    matches!(data.trim(), "done" | "[DONE]")
}
