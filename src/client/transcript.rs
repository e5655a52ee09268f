use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;

/// Number of entries kept before the oldest are evicted.
pub const TRANSCRIPT_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Request,
    Response,
    Event,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub direction: Direction,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// Everything about an entry except the id and timestamp, which `record` assigns.
#[derive(Debug, Clone)]
pub struct NewEntry {
    pub direction: Direction,
    pub path: String,
    pub method: Option<String>,
    pub status_code: Option<u16>,
    pub event_type: Option<String>,
    pub summary: String,
    pub details: Option<serde_json::Value>,
}

impl NewEntry {
    pub fn request(method: &str, path: &str, summary: impl Into<String>) -> Self {
        Self::new(Direction::Request, path, summary).with_method(method)
    }

    pub fn response(path: &str, status: u16, summary: impl Into<String>) -> Self {
        let mut entry = Self::new(Direction::Response, path, summary);
        entry.status_code = Some(status);
        entry
    }

    pub fn event(path: &str, event_type: &str) -> Self {
        let mut entry = Self::new(Direction::Event, path, format!("event: {event_type}"));
        entry.event_type = Some(event_type.to_string());
        entry
    }

    fn new(direction: Direction, path: &str, summary: impl Into<String>) -> Self {
        Self {
            direction,
            path: path.to_string(),
            method: None,
            status_code: None,
            event_type: None,
            summary: summary.into(),
            details: None,
        }
    }

    fn with_method(mut self, method: &str) -> Self {
        self.method = Some(method.to_string());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Bounded, in-memory record of transport traffic for diagnostics.
///
/// Never persisted. Writing to it has no effect on request handling.
#[derive(Debug)]
pub struct TranscriptLog {
    entries: Mutex<VecDeque<TranscriptEntry>>,
    capacity: usize,
}

impl Default for TranscriptLog {
    fn default() -> Self {
        Self::new()
    }
}

impl TranscriptLog {
    pub fn new() -> Self {
        Self::with_capacity(TRANSCRIPT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(TRANSCRIPT_CAPACITY))),
            capacity: capacity.max(1),
        }
    }

    /// Append an entry, evicting the oldest ones beyond capacity. Returns the new id.
    pub fn record(&self, entry: NewEntry) -> String {
        let id = uuid::Uuid::new_v4().simple().to_string()[..9].to_string();
        let entry = TranscriptEntry {
            id: id.clone(),
            timestamp: Utc::now(),
            direction: entry.direction,
            path: entry.path,
            method: entry.method,
            status_code: entry.status_code,
            event_type: entry.event_type,
            summary: entry.summary,
            details: entry.details,
        };

        let mut entries = self.lock();
        entries.push_back(entry);
        while entries.len() > self.capacity {
            entries.pop_front();
        }
        id
    }

    /// Snapshot copy, oldest first.
    pub fn list(&self) -> Vec<TranscriptEntry> {
        self.lock().iter().cloned().collect()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<TranscriptEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keeps_most_recent_entries() {
        let log = TranscriptLog::new();
        for i in 0..1001 {
            log.record(NewEntry::request("POST", "/api/execute", format!("call {i}")));
        }

        let entries = log.list();
        assert_eq!(entries.len(), 1000);
        assert_eq!(entries.first().unwrap().summary, "call 1");
        assert_eq!(entries.last().unwrap().summary, "call 1000");
    }

    #[test]
    fn test_list_is_a_snapshot() {
        let log = TranscriptLog::new();
        log.record(NewEntry::event("/api/stream", "data"));

        let mut snapshot = log.list();
        snapshot.clear();
        snapshot.push(log.list()[0].clone());
        snapshot.push(log.list()[0].clone());

        assert_eq!(log.len(), 1);
    }

    #[test]
    fn test_record_assigns_ids_and_fields() {
        let log = TranscriptLog::new();
        let a = log.record(NewEntry::response("/api/workflows", 200, "ok (200)"));
        let b = log.record(
            NewEntry::event("/api/stream", "error")
                .with_details(serde_json::json!({"error": "boom"})),
        );
        assert_ne!(a, b);

        let entries = log.list();
        assert_eq!(entries[0].direction, Direction::Response);
        assert_eq!(entries[0].status_code, Some(200));
        assert_eq!(entries[1].event_type.as_deref(), Some("error"));
        assert_eq!(entries[1].summary, "event: error");
        assert_eq!(entries[1].details, Some(serde_json::json!({"error": "boom"})));
        assert!(entries[0].timestamp <= entries[1].timestamp);
    }

    #[test]
    fn test_clear() {
        let log = TranscriptLog::with_capacity(3);
        for _ in 0..5 {
            log.record(NewEntry::request("GET", "/api/workflows", "list workflows"));
        }
        assert_eq!(log.len(), 3);
        log.clear();
        assert!(log.is_empty());
    }
}
