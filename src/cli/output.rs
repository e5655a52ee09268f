use anyhow::Result;
use std::io::{self, Write};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::chat::{ChatEvent, Reply, ReplyOutcome};
use crate::client::{Direction, TranscriptEntry};
use crate::core::session::Session;
use crate::core::workflow::{WorkflowInfo, WorkflowList};
use crate::storage::PersistedSettings;
use crate::stream::StreamEvent;

/// Render a chat reply as it streams. Ctrl-C cancels it.
pub async fn render_chat(
    rx: &mut mpsc::Receiver<ChatEvent>,
    cancel: &CancellationToken,
) -> Result<Option<Reply>> {
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut first_content = true;
    let mut finished = None;

    loop {
        let event = tokio::select! {
            event = rx.recv() => event,
            _ = &mut ctrl_c, if !cancel.is_cancelled() => {
                cancel.cancel();
                continue;
            }
        };
        let Some(event) = event else { break };

        match event {
            ChatEvent::Started { .. } => {
                eprint!("\x1b[90mWaiting...\x1b[0m");
                io::stderr().flush().ok();
            }
            ChatEvent::Delta { text } => {
                if first_content {
                    // Clear "Waiting..."
                    eprint!("\r\x1b[K");
                    first_content = false;
                }
                print!("{text}");
                io::stdout().flush().ok();
            }
            ChatEvent::Finished(reply) => {
                if first_content {
                    eprint!("\r\x1b[K");
                }
                match &reply.outcome {
                    ReplyOutcome::Completed if first_content => print!("{}", reply.content),
                    ReplyOutcome::Completed => {}
                    ReplyOutcome::Failed(error) => {
                        eprint!("\n\x1b[31;1m[error]\x1b[0m {error}")
                    }
                    ReplyOutcome::Cancelled => eprint!("\n\x1b[33m[cancelled]\x1b[0m"),
                }
                finished = Some(reply);
            }
            ChatEvent::Error { error } => {
                eprint!("\r\x1b[K\x1b[31;1m[error]\x1b[0m {error}");
            }
        }
    }

    println!();
    Ok(finished)
}

pub fn print_stream_event(event: &StreamEvent) {
    match event {
        StreamEvent::Data(text) => {
            print!("{text}");
            io::stdout().flush().ok();
        }
        StreamEvent::Done(last) => {
            if let Some(last) = last {
                print!("{last}");
            }
            println!();
        }
        StreamEvent::Error(message) => {
            eprintln!("\n\x1b[31;1m[error]\x1b[0m {message}");
        }
    }
}

pub fn print_workflows(list: &WorkflowList) {
    if list.workflows.is_empty() {
        println!("No workflows.");
        return;
    }
    for name in &list.workflows {
        println!("  {name}");
    }
    println!("\x1b[90m{} workflow(s)\x1b[0m", list.count);
}

pub fn print_workflow_info(info: &WorkflowInfo) {
    println!("\x1b[1m{}\x1b[0m", info.name);
    if !info.description.is_empty() {
        println!("  {}", info.description);
    }
    if !info.version.is_empty() {
        println!("  version: {}", info.version);
    }
    if !info.status.is_empty() {
        println!("  status:  {}", info.status);
    }
}

pub fn print_sessions(sessions: &[Session], active: Option<&str>) {
    if sessions.is_empty() {
        println!("No sessions.");
        return;
    }
    for s in sessions {
        let marker = if Some(s.id.as_str()) == active { " *" } else { "" };
        println!(
            "  \x1b[90m{}\x1b[0m  {}{}  ({} msgs, {})",
            short_id(&s.id),
            s.title,
            marker,
            s.messages.len(),
            s.updated_at.format("%Y-%m-%d %H:%M"),
        );
    }
}

pub fn print_history(session: &Session) {
    use crate::core::session::MessageRole;

    for msg in &session.messages {
        match msg.role {
            MessageRole::User => println!("\x1b[32;1m>\x1b[0m {}", msg.content),
            MessageRole::Assistant => println!("{}\n", msg.content),
        }
    }
}

pub fn print_transcript(entries: &[TranscriptEntry]) {
    if entries.is_empty() {
        println!("No traffic recorded.");
        return;
    }
    for e in entries {
        let tag = match e.direction {
            Direction::Request => format!("\x1b[36m{:<6}\x1b[0m", e.method.as_deref().unwrap_or("")),
            Direction::Response => format!("\x1b[33m{:<6}\x1b[0m", e.status_code.unwrap_or_default()),
            Direction::Event => "\x1b[90mevent \x1b[0m".to_string(),
        };
        println!(
            "  \x1b[90m{}\x1b[0m {} {}  {}",
            e.timestamp.format("%H:%M:%S%.3f"),
            tag,
            e.path,
            truncate(&e.summary, 120),
        );
    }
}

pub fn print_settings(settings: &PersistedSettings) {
    println!("api base:   {}", settings.api_settings.api_base);
    match &settings.tenant_info {
        Some(t) => {
            println!("user id:    {}", t.user_id);
            println!("archive id: {}", t.archive_id);
        }
        None => println!("tenant:     \x1b[90m(default)\x1b[0m"),
    }
}

/// Session ids share a fixed prefix; the next 8 characters are enough to tell them apart.
pub fn short_id(id: &str) -> &str {
    let end = id
        .char_indices()
        .nth("session_".len() + 8)
        .map(|(i, _)| i)
        .unwrap_or(id.len());
    &id[..end]
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let head: String = s.chars().take(max_chars).collect();
    format!("{head}...")
}
