use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use dropvault_core::protocol::HandlingMode;
use dropvault_core::storage::Storage;
use dropvault_engine::client::{Client, ClientConfig};
use dropvault_engine::server::{Server, ServerCmd, ServerConfig, ServerEvent};
use dropvault_engine::session::FileSessionHandler;
use dropvault_engine::tcp::{TcpConnector, TcpListenerFactory};

use crate::event::{spawn_client_event_printer, spawn_server_event_printer};
use crate::ui::{
    print_banner, print_download_report, print_file_table, print_upload_report,
    print_version_table,
};

/// Runs the server until Ctrl-C.
pub async fn serve(listen: &str, config: ServerConfig) -> anyhow::Result<()> {
    let versions_root = config.versions_root();
    let storage = Storage::open_with_versions(&config.storage_root, &versions_root)
        .await
        .with_context(|| format!("cannot open storage at {}", config.storage_root.display()))?;

    print_banner(listen, &config.storage_root, &versions_root, config.max_connections);

    let handler = FileSessionHandler::new(Arc::new(storage), config.session_config());
    let handle = Server::start(
        TcpListenerFactory::with_backlog(config.backlog),
        handler,
        config.max_connections,
    );

    let mut events_rx = handle.events_tx.subscribe();
    handle
        .cmd_tx
        .send(ServerCmd::StartAccepting {
            addr: listen.to_owned(),
        })
        .await
        .context("server loop is gone")?;

    // A failed bind is fatal here; later errors are only printed.
    loop {
        match events_rx.recv().await {
            Ok(ServerEvent::Accepting { addr }) => {
                println!("  ✔ Listening on {addr}");
                break;
            }
            Ok(ServerEvent::Error { message }) => bail!("cannot listen on {listen}: {message}"),
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => {
                bail!("server loop stopped during start-up")
            }
        }
    }
    let printer = spawn_server_event_printer(events_rx);
    println!("  Press Ctrl-C to stop.");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;

    println!();
    info!("Shutting down");
    if handle.cmd_tx.send(ServerCmd::ShutDown).await.is_err() {
        warn!("Server loop already stopped");
    }
    // Give the loop a moment to log its shutdown.
    tokio::time::sleep(Duration::from_millis(200)).await;
    printer.abort();
    println!("  Bye! 👋");
    Ok(())
}

fn client(config: ClientConfig) -> (Client<TcpConnector>, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let printer = spawn_client_event_printer(rx);
    (Client::new(TcpConnector, config).with_events(tx), printer)
}

/// Closes the client and waits until every event it emitted is printed.
async fn finish(mut client: Client<TcpConnector>, printer: JoinHandle<()>) {
    client.close().await;
    drop(client);
    let _ = printer.await;
}

pub async fn upload(config: ClientConfig, path: &Path, mode: HandlingMode) -> anyhow::Result<()> {
    let (mut client, printer) = client(config);
    let result = client.upload(path, mode).await;
    finish(client, printer).await;

    let report = result.with_context(|| format!("upload of {} failed", path.display()))?;
    print_upload_report(&report);
    Ok(())
}

pub async fn download(config: ClientConfig, filename: &str) -> anyhow::Result<()> {
    let (mut client, printer) = client(config);
    let result = client.download(filename).await;
    finish(client, printer).await;

    let report = result.with_context(|| format!("download of {filename} failed"))?;
    print_download_report(&report);
    Ok(())
}

pub async fn list(config: ClientConfig) -> anyhow::Result<()> {
    let (mut client, printer) = client(config);
    let result = client.list().await;
    finish(client, printer).await;

    let files = result.context("listing failed")?;
    print_file_table(&files);
    Ok(())
}

pub async fn versions(config: ClientConfig, filename: &str) -> anyhow::Result<()> {
    let (mut client, printer) = client(config);
    let result = client.versions(filename).await;
    finish(client, printer).await;

    let versions = result.with_context(|| format!("cannot list versions of {filename}"))?;
    print_version_table(filename, &versions);
    Ok(())
}
