//! End-to-end transfers between a `Client` and a `Server` over TCP.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};

use dropvault_core::digest::digest_bytes;
use dropvault_core::protocol::{
    Command, DownloadRequest, ErrorCode, HandlingMode, MessageType, ReadyAck, Response, Status,
    UploadRequest,
};
use dropvault_core::storage::{STAGING_DIR, Storage};
use dropvault_core::transport::Connector;
use dropvault_core::Error;
use dropvault_engine::client::{Client, ClientConfig, ClientEvent};
use dropvault_engine::framed::Framed;
use dropvault_engine::server::{Server, ServerCmd, ServerEvent, ServerHandle};
use dropvault_engine::session::{FileSessionHandler, SessionConfig, SessionHandler};
use dropvault_engine::tcp::{TcpConnection, TcpConnector, TcpListenerFactory};

const TIMEOUT: Duration = Duration::from_secs(5);

struct TestServer {
    handle: ServerHandle,
    addr: String,
    storage: Arc<Storage>,
    _dir: tempfile::TempDir,
}

impl TestServer {
    async fn shut_down(self) {
        let _ = self.handle.cmd_tx.send(ServerCmd::ShutDown).await;
    }
}

fn session_config() -> SessionConfig {
    SessionConfig {
        operation_timeout: TIMEOUT,
        chunk_size: 16 * 1024,
    }
}

async fn open_storage() -> (tempfile::TempDir, Arc<Storage>) {
    let dir = tempfile::tempdir().unwrap();
    let storage = Arc::new(Storage::open(dir.path().join("server_storage")).await.unwrap());
    (dir, storage)
}

async fn serve<H>(handler: H, storage: Arc<Storage>, dir: tempfile::TempDir) -> TestServer
where
    H: SessionHandler<TcpConnection>,
{
    let handle = Server::start(TcpListenerFactory::default(), handler, 8);
    let mut events = handle.events_tx.subscribe();
    handle
        .cmd_tx
        .send(ServerCmd::StartAccepting {
            addr: "127.0.0.1:0".into(),
        })
        .await
        .unwrap();
    let addr = wait_for_accepting(&mut events).await;
    TestServer {
        handle,
        addr,
        storage,
        _dir: dir,
    }
}

async fn start_server() -> TestServer {
    let (dir, storage) = open_storage().await;
    let handler = FileSessionHandler::new(Arc::clone(&storage), session_config());
    serve(handler, storage, dir).await
}

async fn wait_for_accepting(rx: &mut broadcast::Receiver<ServerEvent>) -> String {
    tokio::time::timeout(TIMEOUT, async {
        loop {
            match rx.recv().await {
                Ok(ServerEvent::Accepting { addr }) => return addr,
                Ok(ServerEvent::Error { message }) => panic!("server error: {message}"),
                Ok(_) => {}
                Err(e) => panic!("event channel error: {e}"),
            }
        }
    })
    .await
    .expect("timed out waiting for the listener")
}

fn client_config(addr: &str, download_dir: &std::path::Path) -> ClientConfig {
    ClientConfig {
        addr: addr.to_owned(),
        download_dir: download_dir.to_path_buf(),
        connect_timeout: TIMEOUT,
        operation_timeout: TIMEOUT,
        retry_delay: Duration::from_millis(50),
        chunk_size: 4096,
        ..ClientConfig::default()
    }
}

fn client(addr: &str, download_dir: &std::path::Path) -> Client<TcpConnector> {
    Client::new(TcpConnector, client_config(addr, download_dir))
}

/// Raw framed connection for driving the protocol by hand.
async fn raw_connection(addr: &str) -> Framed<TcpConnection> {
    Framed::new(TcpConnector.connect(addr).await.unwrap(), TIMEOUT)
}

async fn read_exact_raw(framed: &mut Framed<TcpConnection>, len: usize) -> Vec<u8> {
    let mut out = vec![0u8; len];
    let mut got = 0;
    while got < len {
        let n = framed.read_raw(&mut out[got..]).await.unwrap();
        assert_ne!(n, 0, "stream ended after {got} of {len} bytes");
        got += n;
    }
    out
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

#[tokio::test]
async fn given_uploaded_file_when_downloaded_then_bytes_and_digest_match() {
    let server = start_server().await;
    let local = tempfile::tempdir().unwrap();
    let source = local.path().join("photo.raw");
    let data = pattern(300 * 1024 + 7, 3);
    tokio::fs::write(&source, &data).await.unwrap();

    let mut client = client(&server.addr, &local.path().join("downloads"));
    let uploaded = client.upload(&source, HandlingMode::Overwrite).await.unwrap();
    assert_eq!(uploaded.stored_as, "photo.raw");
    assert!(!uploaded.is_duplicate);
    assert_eq!(uploaded.hash, digest_bytes(&data));

    let downloaded = client.download("photo.raw").await.unwrap();
    assert_eq!(downloaded.filesize, data.len() as u64);
    assert_eq!(downloaded.hash, digest_bytes(&data));
    assert_eq!(downloaded.resumes, 0);
    assert_eq!(tokio::fs::read(&downloaded.path).await.unwrap(), data);

    client.close().await;
    server.shut_down().await;
}

#[tokio::test]
async fn given_repeated_overwrite_uploads_then_single_file_with_last_content() {
    let server = start_server().await;
    let local = tempfile::tempdir().unwrap();
    let source = local.path().join("notes.txt");
    let mut client = client(&server.addr, local.path());

    for round in 0..3u8 {
        tokio::fs::write(&source, pattern(1000, round)).await.unwrap();
        let report = client.upload(&source, HandlingMode::Overwrite).await.unwrap();
        assert_eq!(report.stored_as, "notes.txt");
        assert_eq!(report.is_duplicate, round > 0);
    }

    let files = client.list().await.unwrap();
    assert_eq!(files.len(), 1);
    assert!(files[0].versions.is_empty());
    assert_eq!(
        tokio::fs::read(server.storage.path_of("notes.txt")).await.unwrap(),
        pattern(1000, 2)
    );
    server.shut_down().await;
}

#[tokio::test]
async fn given_repeated_rename_uploads_then_suffixes_increase() {
    let server = start_server().await;
    let local = tempfile::tempdir().unwrap();
    let source = local.path().join("report.pdf");
    tokio::fs::write(&source, b"%PDF-1.7").await.unwrap();

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let mut client = client(&server.addr, local.path()).with_events(events_tx);

    let mut stored = Vec::new();
    for _ in 0..3 {
        stored.push(
            client
                .upload(&source, HandlingMode::Rename)
                .await
                .unwrap()
                .stored_as,
        );
    }
    assert_eq!(stored, ["report.pdf", "report_v2.pdf", "report_v3.pdf"]);

    let mut renamed = Vec::new();
    while let Ok(event) = events_rx.try_recv() {
        if let ClientEvent::DuplicateResolved { stored_as, .. } = event {
            renamed.push(stored_as);
        }
    }
    assert_eq!(renamed, ["report_v2.pdf", "report_v3.pdf"]);
    server.shut_down().await;
}

#[tokio::test]
async fn given_k_versioning_uploads_then_k_minus_one_versions_newest_first() {
    let server = start_server().await;
    let local = tempfile::tempdir().unwrap();
    let source = local.path().join("data.csv");
    let mut client = client(&server.addr, local.path());

    for round in 0..4u8 {
        tokio::fs::write(&source, pattern(64, round)).await.unwrap();
        client.upload(&source, HandlingMode::Versioning).await.unwrap();
    }

    let versions = client.versions("data.csv").await.unwrap();
    assert_eq!(versions.len(), 3);
    assert!(versions.windows(2).all(|w| w[0].filename > w[1].filename));
    assert!(
        versions
            .iter()
            .all(|v| v.filename.starts_with("data_") && v.filename.ends_with(".csv"))
    );

    assert!(matches!(
        client.versions("missing.csv").await,
        Err(Error::NotFound(_))
    ));
    server.shut_down().await;
}

#[tokio::test]
async fn given_hello_world_scenario_then_versions_and_resume_behave() {
    let server = start_server().await;
    let local = tempfile::tempdir().unwrap();
    let source = local.path().join("a.txt");
    let mut client = client(&server.addr, &local.path().join("downloads"));

    tokio::fs::write(&source, b"hello world!").await.unwrap();
    let first = client.upload(&source, HandlingMode::Overwrite).await.unwrap();
    assert_eq!(first.hash, digest_bytes(b"hello world!"));

    tokio::fs::write(&source, b"HELLO WORLD?").await.unwrap();
    client.upload(&source, HandlingMode::Versioning).await.unwrap();

    let files = client.list().await.unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].filename, "a.txt");
    assert_eq!(files[0].size, 12);
    assert_eq!(files[0].versions.len(), 1);
    assert_eq!(files[0].versions[0].size, 12);
    client.close().await;

    let mut raw = raw_connection(&server.addr).await;
    let request = Command::Download(DownloadRequest {
        filename: Some("a.txt".into()),
        resume_offset: Some(5),
    });
    raw.send(MessageType::Request, &request).await.unwrap();
    let ready: Response = raw.read_message(MessageType::Response).await.unwrap();
    assert_eq!(ready.status, Status::Ready);
    assert_eq!(ready.resuming_from, Some(5));
    raw.send(MessageType::Ack, &ReadyAck::ready()).await.unwrap();
    assert_eq!(ready.filesize, Some(12));
    assert_eq!(read_exact_raw(&mut raw, 7).await, b" WORLD?");

    server.shut_down().await;
}

#[tokio::test]
async fn given_corrupted_payload_when_uploading_then_rejected_and_nothing_stored() {
    let server = start_server().await;
    let mut raw = raw_connection(&server.addr).await;

    let request = Command::Upload(UploadRequest {
        filename: Some("x.bin".into()),
        filesize: Some(4),
        hash: Some(digest_bytes(b"abcd")),
        handling_mode: None,
    });
    raw.send(MessageType::Request, &request).await.unwrap();
    let ready: Response = raw.read_message(MessageType::Response).await.unwrap();
    assert_eq!(ready.status, Status::Ready);
    raw.write_raw(b"abce").await.unwrap();

    let response: Response = raw.read_message(MessageType::Response).await.unwrap();
    let err = response.into_result().unwrap_err();
    let Error::Integrity { expected, received } = err else {
        panic!("expected an integrity error, got {err:?}");
    };
    assert_eq!(expected, digest_bytes(b"abcd"));
    assert_eq!(received, digest_bytes(b"abce"));
    assert!(!server.storage.path_of("x.bin").exists());
    server.shut_down().await;
}

#[tokio::test]
async fn given_offset_past_end_when_downloading_then_invalid_range() {
    let server = start_server().await;
    tokio::fs::write(server.storage.path_of("a.txt"), b"hello world!")
        .await
        .unwrap();
    let mut raw = raw_connection(&server.addr).await;

    let request = Command::Download(DownloadRequest {
        filename: Some("a.txt".into()),
        resume_offset: Some(12),
    });
    raw.send(MessageType::Request, &request).await.unwrap();
    let response: Response = raw.read_message(MessageType::Response).await.unwrap();
    assert_eq!(response.status, Status::Error);
    assert_eq!(response.code, Some(ErrorCode::InvalidRange));
    server.shut_down().await;
}

#[tokio::test]
async fn given_malformed_requests_then_errors_and_connection_stays_open() {
    let server = start_server().await;
    let mut raw = raw_connection(&server.addr).await;

    raw.send(MessageType::Request, &serde_json::json!({"command": "DELETE"}))
        .await
        .unwrap();
    let response: Response = raw.read_message(MessageType::Response).await.unwrap();
    assert_eq!(response.message.as_deref(), Some("Invalid command"));

    raw.write_raw(&dropvault_core::protocol::encode_frame_to_bytes(
        MessageType::Request,
        b"{not json",
    ))
    .await
    .unwrap();
    let response: Response = raw.read_message(MessageType::Response).await.unwrap();
    assert_eq!(response.message.as_deref(), Some("Invalid request format"));

    raw.send(MessageType::Request, &Command::List).await.unwrap();
    let response: Response = raw.read_message(MessageType::Response).await.unwrap();
    assert_eq!(response.status, Status::Success);
    server.shut_down().await;
}

#[tokio::test]
async fn given_unknown_file_when_downloading_then_rejected_and_no_local_file() {
    let server = start_server().await;
    let local = tempfile::tempdir().unwrap();
    let mut client = client(&server.addr, local.path());

    let err = client.download("ghost.txt").await.unwrap_err();
    assert!(matches!(
        err,
        Error::Rejected {
            code: ErrorCode::NotFound,
            ..
        }
    ));
    assert!(!local.path().join("ghost.txt").exists());
    // A rejection keeps the connection usable.
    assert!(client.is_connected());
    assert!(client.list().await.unwrap().is_empty());
    server.shut_down().await;
}

#[tokio::test]
async fn given_no_server_when_connecting_then_connect_refused() {
    let addr = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().to_string()
    };
    let local = tempfile::tempdir().unwrap();
    let mut client = client(&addr, local.path());

    let err = client.connect().await.unwrap_err();
    assert!(matches!(err, Error::ConnectRefused { .. }), "got {err:?}");
    assert!(!client.is_connected());
}

#[tokio::test]
async fn given_concurrent_rename_uploads_then_every_upload_gets_its_own_name() {
    let server = start_server().await;
    tokio::fs::write(server.storage.path_of("shared.txt"), b"seed")
        .await
        .unwrap();

    let mut tasks = Vec::new();
    for seed in 0..4u8 {
        let addr = server.addr.clone();
        tasks.push(tokio::spawn(async move {
            let local = tempfile::tempdir().unwrap();
            let source = local.path().join("shared.txt");
            tokio::fs::write(&source, pattern(50_000, seed)).await.unwrap();
            let mut client = client(&addr, local.path());
            client.upload(&source, HandlingMode::Rename).await.unwrap().stored_as
        }));
    }

    let mut names = Vec::new();
    for task in tasks {
        names.push(task.await.unwrap());
    }
    names.sort();
    names.dedup();
    assert_eq!(names.len(), 4, "names collided: {names:?}");
    assert!(!names.contains(&"shared.txt".to_owned()));
    server.shut_down().await;
}

/// What the first connection does after sending `cut_after` bytes of a
/// download.
enum Interruption {
    HangUp,
    /// Keep the connection open but go silent.
    Stall(Duration),
    /// Replace the file with these bytes, then hang up.
    Replace(Vec<u8>),
}

/// Serves the first connection by hand: announces the whole file, sends
/// `cut_after` bytes and is interrupted. Later connections are served
/// normally.
struct FlakyHandler {
    inner: FileSessionHandler,
    storage: Arc<Storage>,
    cut_after: usize,
    interruption: Interruption,
    tripped: AtomicBool,
}

impl SessionHandler<TcpConnection> for FlakyHandler {
    async fn handle(&self, session_id: u64, conn: TcpConnection) {
        if self.tripped.swap(true, Ordering::SeqCst) {
            return self.inner.handle(session_id, conn).await;
        }

        let mut framed = Framed::new(conn, TIMEOUT);
        let Ok(Command::Download(request)) =
            framed.read_message::<Command>(MessageType::Request).await
        else {
            return;
        };
        let filename = request.filename.unwrap();
        let data = tokio::fs::read(self.storage.path_of(&filename)).await.unwrap();
        framed
            .send_response(&Response::download_ready(
                data.len() as u64,
                &digest_bytes(&data),
                0,
            ))
            .await
            .unwrap();
        let _: ReadyAck = framed.read_message(MessageType::Ack).await.unwrap();
        framed.write_raw(&data[..self.cut_after]).await.unwrap();

        match &self.interruption {
            Interruption::HangUp => {}
            Interruption::Stall(pause) => tokio::time::sleep(*pause).await,
            Interruption::Replace(replacement) => {
                tokio::fs::write(self.storage.path_of(&filename), replacement)
                    .await
                    .unwrap();
            }
        }
    }
}

async fn start_flaky_server(
    filename: &str,
    data: &[u8],
    cut_after: usize,
    interruption: Interruption,
) -> TestServer {
    let (dir, storage) = open_storage().await;
    tokio::fs::write(storage.path_of(filename), data).await.unwrap();

    let handler = FlakyHandler {
        inner: FileSessionHandler::new(Arc::clone(&storage), session_config()),
        storage: Arc::clone(&storage),
        cut_after,
        interruption,
        tripped: AtomicBool::new(false),
    };
    serve(handler, storage, dir).await
}

fn resume_offsets(events_rx: &mut mpsc::UnboundedReceiver<ClientEvent>) -> Vec<u64> {
    let mut offsets = Vec::new();
    while let Ok(event) = events_rx.try_recv() {
        if let ClientEvent::Resuming { offset, .. } = event {
            offsets.push(offset);
        }
    }
    offsets
}

#[tokio::test]
async fn given_connection_dropped_mid_download_when_resumed_then_file_is_intact() {
    let data = pattern(100_000, 9);
    let server = start_flaky_server("big.bin", &data, 40_000, Interruption::HangUp).await;

    let local = tempfile::tempdir().unwrap();
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let mut client = client(&server.addr, local.path()).with_events(events_tx);

    let report = client.download("big.bin").await.unwrap();
    assert_eq!(report.resumes, 1);
    assert_eq!(report.hash, digest_bytes(&data));
    assert_eq!(tokio::fs::read(&report.path).await.unwrap(), data);
    assert_eq!(resume_offsets(&mut events_rx), [40_000]);
    server.shut_down().await;
}

#[tokio::test]
async fn given_server_stalls_mid_download_when_read_times_out_then_download_resumes() {
    let data = pattern(100_000, 21);
    let server = start_flaky_server(
        "big.bin",
        &data,
        30_000,
        Interruption::Stall(Duration::from_secs(3)),
    )
    .await;

    let local = tempfile::tempdir().unwrap();
    let config = ClientConfig {
        operation_timeout: Duration::from_millis(500),
        ..client_config(&server.addr, local.path())
    };
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let mut client = Client::new(TcpConnector, config).with_events(events_tx);

    let report = client.download("big.bin").await.unwrap();
    assert_eq!(report.resumes, 1);
    assert_eq!(tokio::fs::read(&report.path).await.unwrap(), data);
    assert_eq!(resume_offsets(&mut events_rx), [30_000]);
    server.shut_down().await;
}

#[tokio::test]
async fn given_file_replaced_before_resume_when_downloading_then_integrity_error_and_client_usable()
{
    let data = pattern(100_000, 9);
    let replacement = pattern(100_000, 77);
    let server = start_flaky_server(
        "big.bin",
        &data,
        40_000,
        Interruption::Replace(replacement),
    )
    .await;

    let local = tempfile::tempdir().unwrap();
    let mut client = client(&server.addr, local.path());

    let err = client.download("big.bin").await.unwrap_err();
    assert!(matches!(err, Error::Integrity { .. }), "unexpected error: {err:?}");
    assert!(!client.is_connected());
    assert!(!local.path().join("big.bin").exists());

    // The next request starts on a clean connection.
    let files = client.list().await.unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].filename, "big.bin");
    assert_eq!(files[0].size, 100_000);
    server.shut_down().await;
}

/// Reads the first request of the first `stalls` connections and never
/// answers it. Later connections are served normally.
struct StallingHandler {
    inner: FileSessionHandler,
    stalls: usize,
    seen: AtomicUsize,
}

impl SessionHandler<TcpConnection> for StallingHandler {
    async fn handle(&self, session_id: u64, conn: TcpConnection) {
        if self.seen.fetch_add(1, Ordering::SeqCst) >= self.stalls {
            return self.inner.handle(session_id, conn).await;
        }
        let mut framed = Framed::new(conn, TIMEOUT);
        let _ = framed.read_frame().await;
        tokio::time::sleep(TIMEOUT).await;
    }
}

async fn start_stalling_server(stalls: usize) -> TestServer {
    let (dir, storage) = open_storage().await;
    let handler = StallingHandler {
        inner: FileSessionHandler::new(Arc::clone(&storage), session_config()),
        stalls,
        seen: AtomicUsize::new(0),
    };
    serve(handler, storage, dir).await
}

fn impatient_client(
    addr: &str,
    download_dir: &std::path::Path,
) -> (Client<TcpConnector>, mpsc::UnboundedReceiver<ClientEvent>) {
    let config = ClientConfig {
        operation_timeout: Duration::from_millis(300),
        ..client_config(addr, download_dir)
    };
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    (Client::new(TcpConnector, config).with_events(events_tx), events_rx)
}

#[tokio::test]
async fn given_unanswered_request_when_exchanging_then_retried_on_fresh_connection() {
    let server = start_stalling_server(1).await;
    let local = tempfile::tempdir().unwrap();
    let (mut client, mut events_rx) = impatient_client(&server.addr, local.path());

    assert!(client.list().await.unwrap().is_empty());

    let mut retries = Vec::new();
    let mut reconnects = 0;
    while let Ok(event) = events_rx.try_recv() {
        match event {
            ClientEvent::Retrying {
                attempt,
                max_retries,
                ..
            } => retries.push((attempt, max_retries)),
            ClientEvent::Reconnected { .. } => reconnects += 1,
            _ => {}
        }
    }
    assert_eq!(retries, [(1, 2)]);
    assert_eq!(reconnects, 1);
    server.shut_down().await;
}

#[tokio::test]
async fn given_server_never_answers_when_retries_exhausted_then_timeout_and_reconnected_once() {
    let server = start_stalling_server(usize::MAX).await;
    let local = tempfile::tempdir().unwrap();
    let (mut client, mut events_rx) = impatient_client(&server.addr, local.path());

    let err = client.list().await.unwrap_err();
    assert!(matches!(err, Error::Timeout), "unexpected error: {err:?}");
    assert!(client.is_connected());

    let mut retries = 0;
    let mut reconnects = 0;
    while let Ok(event) = events_rx.try_recv() {
        match event {
            ClientEvent::Retrying { .. } => retries += 1,
            ClientEvent::Reconnected { .. } => reconnects += 1,
            _ => {}
        }
    }
    assert_eq!(retries, 2);
    // One per retry, plus the final one after giving up.
    assert_eq!(reconnects, 3);
    server.shut_down().await;
}

#[tokio::test]
async fn given_upload_stalls_mid_payload_when_server_times_out_then_staging_file_removed() {
    let (dir, storage) = open_storage().await;
    let config = SessionConfig {
        operation_timeout: Duration::from_millis(300),
        ..session_config()
    };
    let handler = FileSessionHandler::new(Arc::clone(&storage), config);
    let server = serve(handler, storage, dir).await;
    let staging = server.storage.root().join(STAGING_DIR);

    let data = pattern(1000, 5);
    let mut framed = raw_connection(&server.addr).await;
    framed
        .send(
            MessageType::Request,
            &Command::Upload(UploadRequest {
                filename: Some("slow.bin".into()),
                filesize: Some(1000),
                hash: Some(digest_bytes(&data)),
                handling_mode: None,
            }),
        )
        .await
        .unwrap();
    let ready: Response = framed.read_message(MessageType::Response).await.unwrap();
    assert_eq!(ready.status, Status::Ready);
    assert_eq!(std::fs::read_dir(&staging).unwrap().count(), 1);

    framed.write_raw(&data[..100]).await.unwrap();

    // The server gives up without answering and hangs up.
    let closed = framed.read_frame().await;
    assert!(!matches!(closed, Ok(Some(_))), "unexpected reply: {closed:?}");
    assert_eq!(std::fs::read_dir(&staging).unwrap().count(), 0);
    assert!(!server.storage.path_of("slow.bin").exists());
    server.shut_down().await;
}
