use std::io::Write;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use dropvault_core::protocol::HandlingMode;
use dropvault_engine::client::ClientEvent;
use dropvault_engine::server::ServerEvent;

use crate::ui::{format_rate, format_size};

/// Spawns a task that prints server events until the server goes away.
pub fn spawn_server_event_printer(
    mut events_rx: broadcast::Receiver<ServerEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events_rx.recv().await {
                Ok(ServerEvent::Accepting { addr }) => println!("  ✔ Listening on {addr}"),
                Ok(ServerEvent::AcceptingStopped) => println!("  ⏹ Stopped accepting connections"),
                Ok(ServerEvent::SessionStarted { session_id, peer }) => {
                    println!("  📡 Session #{session_id}: connected to {peer}");
                }
                Ok(ServerEvent::SessionClosed { session_id }) => {
                    println!("  👋 Session #{session_id}: closed");
                }
                Ok(ServerEvent::Error { message }) => println!("  ❌ Server error: {message}"),
                Err(broadcast::error::RecvError::Lagged(n)) => println!("  ⚠ Missed {n} events"),
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

/// Spawns a task that prints client events. It ends once every sender
/// (i.e. the client) is dropped.
pub fn spawn_client_event_printer(
    mut events_rx: mpsc::UnboundedReceiver<ClientEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            print_client_event(event);
        }
    })
}

fn print_client_event(event: ClientEvent) {
    match event {
        ClientEvent::Connected { addr } => println!("  🔌 Connected to {addr}"),
        ClientEvent::Retrying {
            attempt,
            max_retries,
            reason,
        } => println!("  🔁 Retrying ({attempt}/{max_retries}): {reason}"),
        ClientEvent::Reconnected { addr } => println!("  🔌 Reconnected to {addr}"),
        ClientEvent::DuplicateResolved {
            requested,
            stored_as,
            mode,
        } => match mode {
            HandlingMode::Overwrite => println!("  ♻ {requested} exists, overwriting"),
            HandlingMode::Rename => println!("  ✏ {requested} exists, storing as {stored_as}"),
            HandlingMode::Versioning => {
                println!("  🗂 {requested} exists, archiving the current version");
            }
        },
        ClientEvent::Progress {
            filename,
            bytes_transferred,
            total_bytes,
            bytes_per_sec,
        } => print_progress(&filename, bytes_transferred, total_bytes, bytes_per_sec),
        ClientEvent::Resuming {
            filename,
            offset,
            attempt,
        } => println!(
            "\n  ⏯ {filename}: connection lost, resuming at {} (attempt {attempt})",
            format_size(offset)
        ),
        ClientEvent::Verifying { filename } => println!("  🔍 Verifying {filename}..."),
    }
}

#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
fn print_progress(filename: &str, done: u64, total: u64, bytes_per_sec: f64) {
    let pct = if total == 0 {
        100.0
    } else {
        (done as f64 / total as f64) * 100.0
    };
    // Overwrite the same line with \r for a compact progress bar.
    let bar_width: usize = 30;
    let filled = (((pct / 100.0) * bar_width as f64) as usize).min(bar_width);
    let empty = bar_width - filled;
    print!(
        "\r  📊 {filename} [{}{}] {pct:>5.1}%  {sent} / {total_fmt}  {rate}",
        "█".repeat(filled),
        "░".repeat(empty),
        sent = format_size(done),
        total_fmt = format_size(total),
        rate = format_rate(bytes_per_sec),
    );
    let _ = std::io::stdout().flush();
    if done >= total {
        println!();
    }
}
