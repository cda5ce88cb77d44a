//! Interactive chat REPL.
//!
//! Subscribes to bus events for live output: streamed text appears as it
//! arrives, tool activity shows as one-line status markers, and each
//! turn ends with a small stats line.

use std::io::Write;
use std::sync::Arc;

use gp_domain::bus::{handler, EventBus, Subscription};
use gp_domain::events::EventType;

use crate::state::AppState;

fn flush() {
    let _ = std::io::stdout().flush();
}

/// Wire bus events to terminal output. Returns the live subscriptions.
fn setup_renderer(bus: &Arc<EventBus>) -> Vec<Subscription> {
    let mut subs = Vec::new();

    subs.push(bus.on(
        EventType::StreamTextDelta,
        handler(|event| async move {
            if let Some(text) = event.data.get("text").and_then(|v| v.as_str()) {
                print!("{text}");
                flush();
            }
            Ok(())
        }),
    ));

    subs.push(bus.on(
        EventType::StateToolExecuting,
        handler(|event| async move {
            let name = event
                .data
                .get("tool_name")
                .and_then(|v| v.as_str())
                .unwrap_or("tool");
            print!("\n  ⚡ {name}...");
            flush();
            Ok(())
        }),
    ));

    subs.push(bus.on(
        EventType::StateToolCompleted,
        handler(|_| async move {
            print!(" ✓");
            flush();
            Ok(())
        }),
    ));

    subs.push(bus.on(
        EventType::StateToolFailed,
        handler(|_| async move {
            print!(" ✗");
            flush();
            Ok(())
        }),
    ));

    subs.push(bus.on(
        EventType::TurnEnd,
        handler(|event| async move {
            let duration = event
                .data
                .get("duration")
                .and_then(|v| v.as_f64())
                .unwrap_or(0.0);
            let iterations = event
                .data
                .get("iterations")
                .and_then(|v| v.as_u64())
                .unwrap_or(0);
            let tokens = event
                .data
                .get("usage")
                .map(|u| {
                    u.get("input_tokens").and_then(|v| v.as_u64()).unwrap_or(0)
                        + u.get("output_tokens").and_then(|v| v.as_u64()).unwrap_or(0)
                })
                .unwrap_or(0);
            let steps = if iterations == 1 { "step" } else { "steps" };
            println!("\n  ({duration:.1}s · {iterations} {steps} · {tokens} tokens)");
            Ok(())
        }),
    ));

    subs
}

/// Run the interactive chat loop until EOF or "quit".
pub async fn run_chat(state: AppState) -> anyhow::Result<()> {
    let backend_ok = state.backend.health_check().await;
    println!();
    println!("GraphPilot — natural language control for your graph backend");
    if backend_ok {
        println!("  ● backend connected");
    } else {
        println!("  ○ backend not reachable");
    }
    println!("  type your message, or 'quit' to exit");
    println!();

    let _subs = setup_renderer(&state.bus);
    let session_id = state.sessions.create_session("CLI Session")?;

    let mut editor = rustyline::DefaultEditor::new()?;
    loop {
        let line = match editor.readline("→ ") {
            Ok(line) => line,
            Err(rustyline::error::ReadlineError::Interrupted)
            | Err(rustyline::error::ReadlineError::Eof) => break,
            Err(e) => return Err(e.into()),
        };

        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if input == "quit" || input == "exit" {
            break;
        }
        let _ = editor.add_history_entry(input);

        println!();
        match state.agent.run(&session_id, input).await {
            Ok(response) => {
                // Streaming already printed deltas; show the final text
                // again only when nothing streamed (e.g. canned replies).
                if response.is_empty() {
                    println!("(no response)");
                } else {
                    println!("\n{response}");
                }
            }
            Err(e) => println!("\nError: {e}"),
        }
        println!();
    }

    state.sessions.close();
    Ok(())
}
