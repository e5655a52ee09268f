use anyhow::Result;
use std::io::{self, Write};

use super::output;
use crate::core::error::ChatError;

pub async fn run(app: super::App, resume_session: Option<String>) -> Result<()> {
    println!("\x1b[1mworkflow-chat\x1b[0m v{}", env!("CARGO_PKG_VERSION"));
    println!(
        "Workflow: \x1b[36m{}\x1b[0m @ {}",
        app.engine.settings().workflow,
        app.client.base_url()
    );
    println!("Type \x1b[33m/help\x1b[0m for commands, \x1b[33mCtrl-D\x1b[0m to exit.\n");

    match resume_session {
        Some(id) => {
            let id = resolve_session_id(&app, &id)?;
            app.store.set_active_session(Some(&id));
            if let Some(session) = app.store.session(&id) {
                output::print_history(&session);
            }
        }
        None => {
            if app.store.current_session().is_none() {
                app.store.create_session(None);
            }
        }
    }

    loop {
        eprint!("\x1b[32;1mchat>\x1b[0m ");
        io::stderr().flush().ok();

        let mut input = String::new();
        match io::stdin().read_line(&mut input) {
            Ok(0) => {
                // EOF (Ctrl-D)
                println!("\nGoodbye!");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                eprintln!("Input error: {e}");
                break;
            }
        }

        let input = input.trim().to_string();
        if input.is_empty() {
            continue;
        }

        if input.starts_with('/') {
            match handle_command(&input, &app) {
                Ok(true) => continue,
                Ok(false) => break,
                Err(e) => {
                    eprintln!("\x1b[31mCommand error: {e}\x1b[0m");
                    continue;
                }
            }
        }

        if app.store.is_streaming() {
            eprintln!("\x1b[33mA reply is still streaming.\x1b[0m");
            continue;
        }

        let (mut rx, cancel) = app.engine.run(app.store.active_session_id(), input);
        output::render_chat(&mut rx, &cancel).await?;
    }

    Ok(())
}

fn handle_command(input: &str, app: &super::App) -> Result<bool> {
    let (command, arg) = match input.split_once(char::is_whitespace) {
        Some((command, arg)) => (command, arg.trim()),
        None => (input, ""),
    };

    match command {
        "/help" | "/h" => {
            println!("\x1b[1mCommands:\x1b[0m");
            println!("  /help            Show this help");
            println!("  /new [title]     Start a new session");
            println!("  /sessions        List sessions");
            println!("  /switch <id>     Switch to a session");
            println!("  /title <text>    Rename the current session");
            println!("  /delete <id>     Delete a session");
            println!("  /clear           Delete all sessions");
            println!("  /logs            Show recent request traffic");
            println!("  /stream          Toggle streamed replies");
            println!("  /exit            Exit");
            Ok(true)
        }
        "/exit" | "/quit" | "/q" => {
            println!("Goodbye!");
            Ok(false)
        }
        "/new" => {
            let title = (!arg.is_empty()).then_some(arg);
            let id = app.store.create_session(title);
            println!("Started session {}.", output::short_id(&id));
            Ok(true)
        }
        "/sessions" | "/s" => {
            let active = app.store.active_session_id();
            output::print_sessions(&app.store.sessions(), active.as_deref());
            Ok(true)
        }
        "/switch" => {
            let id = resolve_session_id(app, arg)?;
            app.store.set_active_session(Some(&id));
            if let Some(session) = app.store.session(&id) {
                println!("Switched to \x1b[1m{}\x1b[0m.", session.title);
                output::print_history(&session);
            }
            Ok(true)
        }
        "/title" => {
            if arg.is_empty() {
                anyhow::bail!("usage: /title <text>");
            }
            let id = app
                .store
                .current_session()
                .map(|s| s.id)
                .ok_or(ChatError::NoActiveSession)?;
            app.store.update_session_title(&id, arg);
            println!("Renamed to \x1b[1m{arg}\x1b[0m.");
            Ok(true)
        }
        "/delete" => {
            let id = resolve_session_id(app, arg)?;
            app.store.delete_session(&id);
            println!("Deleted session {}.", output::short_id(&id));
            Ok(true)
        }
        "/clear" => {
            app.store.clear_all();
            app.store.create_session(None);
            println!("All sessions cleared.");
            Ok(true)
        }
        "/logs" => {
            let entries = app.client.transcript().list();
            let start = entries.len().saturating_sub(20);
            output::print_transcript(&entries[start..]);
            Ok(true)
        }
        "/stream" => {
            let enabled = !app.engine.settings().use_streaming;
            app.engine.set_use_streaming(enabled);
            println!("Streaming {}.", if enabled { "on" } else { "off" });
            Ok(true)
        }
        _ => {
            eprintln!("Unknown command: {input}. Type /help for available commands.");
            Ok(true)
        }
    }
}

/// Accept a full session id or an unambiguous prefix of one.
fn resolve_session_id(app: &super::App, prefix: &str) -> Result<String> {
    if prefix.is_empty() {
        anyhow::bail!("session id required");
    }
    let matches: Vec<String> = app
        .store
        .sessions()
        .into_iter()
        .map(|s| s.id)
        .filter(|id| id.starts_with(prefix))
        .collect();

    match matches.as_slice() {
        [id] => Ok(id.clone()),
        [] => anyhow::bail!("no session matches '{prefix}'"),
        _ => {
            if let Some(exact) = matches.iter().find(|id| id.as_str() == prefix) {
                return Ok(exact.clone());
            }
            anyhow::bail!("'{prefix}' matches {} sessions", matches.len())
        }
    }
}
