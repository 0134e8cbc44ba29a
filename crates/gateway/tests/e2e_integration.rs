//! End-to-end tests for the gateway.
//!
//! A scripted backend sits on the far end of an in-memory transport and
//! plays the server side of the protocol step by step:
//! - session lifecycle (open, ready, errors, close, timeouts)
//! - terminal data and resize
//! - correlated file commands
//! - lock-step chunked uploads
//! - monitoring

use std::io::Cursor;
use std::time::Duration;

use gateway::transport::{Inbound, Outbound};
use gateway::{
    ErrorCode, FileErrorKind, Gateway, GatewayError, GatewayEvent, GatewayOptions, Geometry,
    MemoryTransport, Session, SessionState, Transport, UploadFailure, UploadState,
};
use protocol::messages::{
    Close, Data, ErrorMessage, FileEntry, FileError, FileListData, FileReadData, FileSuccess,
    Message, MonitoringSample, Ready, UploadChunkAck, UploadError as WireUploadError,
    UploadStartAck, UploadSuccess,
};
use protocol::{Envelope, FileErrorCode};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tokio::time::timeout;

/// Upper bound for any single expected step.
const STEP: Duration = Duration::from_secs(5);

const MIB: usize = 1024 * 1024;

/// The server side of the transport, driven by the test.
struct Backend {
    tx: Outbound,
    rx: Inbound,
}

impl Backend {
    async fn recv(&mut self) -> (String, Message) {
        let envelope = timeout(STEP, self.rx.recv())
            .await
            .expect("backend waited too long")
            .expect("transport closed")
            .expect("undecodable envelope");
        (envelope.session_id, envelope.payload)
    }

    async fn send(&self, session_id: &str, payload: Message) {
        self.tx
            .send(Envelope::new(session_id, 0, payload))
            .await
            .expect("gateway end closed");
    }

    /// Assert the gateway sends nothing for `wait`.
    async fn assert_silent(&mut self, wait: Duration) {
        if let Ok(Some(envelope)) = timeout(wait, self.rx.recv()).await {
            panic!("unexpected message from gateway: {envelope:?}");
        }
    }

    /// Answer the next message, which must be a listing request.
    async fn answer_list(&mut self, entries: Vec<FileEntry>) -> String {
        let (session_id, message) = self.recv().await;
        let Message::FileList(req) = message else {
            panic!("expected sftp.list, got {}", message.kind());
        };
        self.send(
            &session_id,
            Message::FileListData(FileListData {
                request_id: req.request_id,
                path: req.path.clone(),
                entries,
            }),
        )
        .await;
        req.path
    }
}

fn test_options() -> GatewayOptions {
    GatewayOptions {
        connect_timeout: Duration::from_secs(2),
        request_timeout: Duration::from_secs(2),
        ack_timeout: Duration::from_secs(2),
        chunk_size: 1024,
        default_geometry: Geometry::default(),
    }
}

fn start(options: GatewayOptions) -> (Gateway, Backend) {
    let (near, far) = MemoryTransport::pair();
    let gateway = Gateway::new(near, options);
    let (tx, rx) = far.split();
    (gateway, Backend { tx, rx })
}

async fn open_ready(gateway: &Gateway, backend: &mut Backend, server: &str) -> Session {
    let session = gateway.open(server, None).await.unwrap();
    let (session_id, message) = backend.recv().await;
    assert_eq!(session_id, server);
    assert!(matches!(message, Message::Connect(ref c) if c.server_id == server));
    backend.send(server, Message::Ready(Ready {})).await;
    session.wait_ready().await.unwrap();
    session
}

/// Round-trip a listing so every earlier inbound message has been applied.
async fn barrier(backend: &mut Backend, session: &Session) {
    let s = session.clone();
    let listing = tokio::spawn(async move { s.list("/").await });
    backend.answer_list(vec![]).await;
    listing.await.unwrap().unwrap();
}

async fn wait_state(session: &Session, state: SessionState) {
    let mut states = session.state_changes();
    timeout(STEP, states.wait_for(|s| *s == state))
        .await
        .expect("state not reached")
        .expect("state channel closed");
}

async fn next_event(
    events: &mut broadcast::Receiver<GatewayEvent>,
    matches: impl Fn(&GatewayEvent) -> bool,
) -> GatewayEvent {
    timeout(STEP, async {
        loop {
            match events.recv().await {
                Ok(event) if matches(&event) => return event,
                Ok(_) => {}
                Err(e) => panic!("event bus failed: {e}"),
            }
        }
    })
    .await
    .expect("event not seen")
}

fn entry(name: &str) -> FileEntry {
    FileEntry {
        name: name.to_string(),
        is_directory: false,
        size_bytes: 1,
        permissions: "-rw-r--r--".to_string(),
    }
}

fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

// =============================================================================
// Session Lifecycle Tests
// =============================================================================

#[tokio::test]
async fn test_open_is_idempotent() {
    let (gateway, mut backend) = start(test_options());

    let first = open_ready(&gateway, &mut backend, "server-a").await;
    let second = gateway.open("server-a", None).await.unwrap();

    backend.assert_silent(Duration::from_millis(100)).await;
    assert_eq!(second.state(), SessionState::Ready);
    assert_eq!(gateway.sessions().len(), 1);
    assert_eq!(first.id(), second.id());
}

#[tokio::test]
async fn test_commands_rejected_before_ready() {
    let (gateway, mut backend) = start(test_options());
    let session = gateway.open("server-a", None).await.unwrap();
    let _ = backend.recv().await;

    assert_eq!(session.state(), SessionState::Connecting);
    assert!(matches!(
        session.send_data(b"ls\n".to_vec()).await,
        Err(GatewayError::NotReady { state: SessionState::Connecting, .. })
    ));
    assert!(matches!(
        session.list("/root").await,
        Err(GatewayError::NotReady { .. })
    ));
    assert!(matches!(
        session.resize(120, 40).await,
        Err(GatewayError::NotReady { .. })
    ));
    assert!(matches!(
        session.upload("/srv/f", Cursor::new(vec![1u8; 10]), 10).await,
        Err(GatewayError::NotReady { .. })
    ));
    backend.assert_silent(Duration::from_millis(100)).await;

    // Monitoring may be requested while connecting.
    session.start_monitoring().await.unwrap();
    let (_, message) = backend.recv().await;
    assert!(matches!(message, Message::MonitorStart(_)));
}

#[tokio::test]
async fn test_connect_timeout_closes_session() {
    let mut options = test_options();
    options.connect_timeout = Duration::from_millis(200);
    let (gateway, mut backend) = start(options);

    let session = gateway.open("server-a", None).await.unwrap();
    let _ = backend.recv().await;

    let err = session.wait_ready().await.unwrap_err();
    assert!(matches!(err, GatewayError::ConnectTimeout { .. }));
    assert_eq!(session.state(), SessionState::Closed);

    let (_, message) = backend.recv().await;
    assert!(matches!(message, Message::Close(_)));
    assert!(gateway.sessions().is_empty());
}

#[tokio::test]
async fn test_open_uses_geometry() {
    let (gateway, mut backend) = start(test_options());
    let session = gateway
        .open("server-a", Some(Geometry::new(132, 43)))
        .await
        .unwrap();

    let (_, message) = backend.recv().await;
    let Message::Connect(connect) = message else {
        panic!("expected connect");
    };
    assert_eq!((connect.cols, connect.rows), (132, 43));
    assert_eq!(session.geometry(), Geometry::new(132, 43));
}

#[tokio::test]
async fn test_server_close() {
    let (gateway, mut backend) = start(test_options());
    let session = open_ready(&gateway, &mut backend, "server-a").await;

    backend
        .send(
            "server-a",
            Message::Close(Close {
                reason: Some("idle".to_string()),
            }),
        )
        .await;
    wait_state(&session, SessionState::Closed).await;

    let err = session.send_data(b"x".to_vec()).await.unwrap_err();
    assert!(matches!(err, GatewayError::SessionClosed { ref reason, .. } if reason.contains("idle")));
    assert!(gateway.session("server-a").is_none());
}

#[tokio::test]
async fn test_fatal_error_closes_and_rejects_pending() {
    let (gateway, mut backend) = start(test_options());
    let mut events = gateway.subscribe();
    let session = open_ready(&gateway, &mut backend, "server-a").await;

    let s = session.clone();
    let pending = tokio::spawn(async move { s.list("/root").await });
    let (_, message) = backend.recv().await;
    assert!(matches!(message, Message::FileList(_)));

    backend
        .send(
            "server-a",
            Message::Error(ErrorMessage::fatal(ErrorCode::AuthFailed, "bad key")),
        )
        .await;

    let err = pending.await.unwrap().unwrap_err();
    assert!(matches!(
        err,
        GatewayError::SessionFailed { code: ErrorCode::AuthFailed, .. }
    ));
    assert_eq!(session.state(), SessionState::Closed);

    let event = next_event(&mut events, |e| matches!(e, GatewayEvent::Error { .. })).await;
    assert!(matches!(event, GatewayEvent::Error { fatal: true, .. }));
}

#[tokio::test]
async fn test_advisory_error_degrades_without_failing_requests() {
    let (gateway, mut backend) = start(test_options());
    let session = open_ready(&gateway, &mut backend, "server-a").await;

    let s = session.clone();
    let pending = tokio::spawn(async move { s.list("/root").await });
    let (_, message) = backend.recv().await;
    let Message::FileList(req) = message else {
        panic!("expected sftp.list");
    };

    backend
        .send(
            "server-a",
            Message::Error(ErrorMessage::advisory(ErrorCode::Timeout, "slow disk")),
        )
        .await;
    backend
        .send(
            "server-a",
            Message::FileListData(FileListData {
                request_id: req.request_id,
                path: req.path,
                entries: vec![entry("a")],
            }),
        )
        .await;

    assert_eq!(pending.await.unwrap().unwrap().len(), 1);
    assert_eq!(session.state(), SessionState::Degraded);

    // Still usable while degraded.
    session.send_data(b"pwd\n".to_vec()).await.unwrap();
    let (_, message) = backend.recv().await;
    assert!(matches!(message, Message::Data(_)));

    backend.send("server-a", Message::Ready(Ready {})).await;
    wait_state(&session, SessionState::Ready).await;
}

#[tokio::test]
async fn test_sessions_are_isolated() {
    let (gateway, mut backend) = start(test_options());
    let a = open_ready(&gateway, &mut backend, "server-a").await;
    let b = open_ready(&gateway, &mut backend, "server-b").await;

    backend
        .send(
            "server-a",
            Message::Error(ErrorMessage::fatal(ErrorCode::Disconnected, "ssh dropped")),
        )
        .await;
    wait_state(&a, SessionState::Closed).await;

    assert_eq!(b.state(), SessionState::Ready);
    barrier(&mut backend, &b).await;
    let infos = gateway.sessions();
    assert_eq!(infos.len(), 1);
    assert_eq!(infos[0].session_id, "server-b");
}

#[tokio::test]
async fn test_transport_loss_closes_everything() {
    let (gateway, mut backend) = start(test_options());
    let mut events = gateway.subscribe();
    let session = open_ready(&gateway, &mut backend, "server-a").await;

    drop(backend);
    wait_state(&session, SessionState::Closed).await;
    next_event(&mut events, |e| matches!(e, GatewayEvent::TransportClosed { .. })).await;

    assert!(!gateway.is_connected());
    assert!(matches!(
        gateway.open("server-b", None).await,
        Err(GatewayError::Transport(_))
    ));
}

// =============================================================================
// Terminal Tests
// =============================================================================

#[tokio::test]
async fn test_terminal_data_both_ways() {
    let (gateway, mut backend) = start(test_options());
    let session = open_ready(&gateway, &mut backend, "server-a").await;
    let mut output = session.output();

    session.send_data(b"ls\n".to_vec()).await.unwrap();
    let (session_id, message) = backend.recv().await;
    assert_eq!(session_id, "server-a");
    assert_eq!(message, Message::Data(Data { bytes: b"ls\n".to_vec() }));

    backend
        .send(
            "server-a",
            Message::Data(Data {
                bytes: b"file.txt\r\n".to_vec(),
            }),
        )
        .await;
    let received = timeout(STEP, output.recv()).await.unwrap().unwrap();
    assert_eq!(received, b"file.txt\r\n");
}

#[tokio::test]
async fn test_resize_sent_every_call() {
    let (gateway, mut backend) = start(test_options());
    let session = open_ready(&gateway, &mut backend, "server-a").await;

    session.resize(100, 40).await.unwrap();
    session.resize(100, 40).await.unwrap();
    for _ in 0..2 {
        let (_, message) = backend.recv().await;
        assert!(matches!(message, Message::Resize(ref r) if (r.cols, r.rows) == (100, 40)));
    }
    assert_eq!(session.geometry(), Geometry::new(100, 40));
}

// =============================================================================
// File Command Tests
// =============================================================================

#[tokio::test]
async fn test_same_class_listings_resolve_to_their_own_paths() {
    let (gateway, mut backend) = start(test_options());
    let session = open_ready(&gateway, &mut backend, "server-a").await;

    let s = session.clone();
    let root = tokio::spawn(async move { s.list("/root").await });
    let s = session.clone();
    let tmp = tokio::spawn(async move { s.list("/tmp").await });

    // One listing at a time; the second waits for the first.
    let (_, first) = backend.recv().await;
    backend.assert_silent(Duration::from_millis(100)).await;
    let Message::FileList(first) = first else {
        panic!("expected sftp.list");
    };
    backend
        .send(
            "server-a",
            Message::FileListData(FileListData {
                request_id: first.request_id,
                path: first.path.clone(),
                entries: vec![entry(&first.path)],
            }),
        )
        .await;
    let second_path = backend.answer_list(vec![]).await;
    assert_ne!(first.path, second_path);

    let root = root.await.unwrap().unwrap();
    let tmp = tmp.await.unwrap().unwrap();
    let (answered, empty) = if first.path == "/root" { (root, tmp) } else { (tmp, root) };
    assert_eq!(answered[0].name, first.path);
    assert!(empty.is_empty());
}

#[tokio::test]
async fn test_different_classes_run_concurrently() {
    let (gateway, mut backend) = start(test_options());
    let session = open_ready(&gateway, &mut backend, "server-a").await;

    let s = session.clone();
    let listing = tokio::spawn(async move { s.list("/root").await });
    let s = session.clone();
    let reading = tokio::spawn(async move { s.read("/root/notes.md").await });

    let (_, a) = backend.recv().await;
    let (_, b) = backend.recv().await;

    // Answer in reverse arrival order.
    for message in [b, a] {
        match message {
            Message::FileList(req) => {
                backend
                    .send(
                        "server-a",
                        Message::FileListData(FileListData {
                            request_id: req.request_id,
                            path: req.path,
                            entries: vec![entry("notes.md")],
                        }),
                    )
                    .await
            }
            Message::FileRead(req) => {
                backend
                    .send(
                        "server-a",
                        Message::FileReadData(FileReadData {
                            request_id: req.request_id,
                            path: req.path,
                            content: b"hello\n".to_vec(),
                        }),
                    )
                    .await
            }
            other => panic!("unexpected {}", other.kind()),
        }
    }

    assert_eq!(listing.await.unwrap().unwrap()[0].name, "notes.md");
    assert_eq!(reading.await.unwrap().unwrap(), "hello\n");
}

#[tokio::test]
async fn test_file_error_is_structured_and_session_survives() {
    let (gateway, mut backend) = start(test_options());
    let session = open_ready(&gateway, &mut backend, "server-a").await;

    let s = session.clone();
    let delete = tokio::spawn(async move { s.delete("/root/gone.txt").await });
    let (_, message) = backend.recv().await;
    let Message::FileDelete(req) = message else {
        panic!("expected sftp.delete");
    };
    backend
        .send(
            "server-a",
            Message::FileError(FileError {
                request_id: req.request_id,
                path: req.path,
                code: FileErrorCode::NotFound,
                message: "No such file".to_string(),
            }),
        )
        .await;

    match delete.await.unwrap() {
        Err(GatewayError::File(err)) => {
            assert_eq!(err.kind, FileErrorKind::NotFound);
            assert_eq!(err.path, "/root/gone.txt");
        }
        other => panic!("unexpected: {other:?}"),
    }
    assert_eq!(session.state(), SessionState::Ready);
}

#[tokio::test]
async fn test_read_rejects_binary_content() {
    let (gateway, mut backend) = start(test_options());
    let session = open_ready(&gateway, &mut backend, "server-a").await;

    let s = session.clone();
    let read = tokio::spawn(async move { s.read("/bin/ls").await });
    let (_, message) = backend.recv().await;
    let Message::FileRead(req) = message else {
        panic!("expected sftp.read");
    };
    backend
        .send(
            "server-a",
            Message::FileReadData(FileReadData {
                request_id: req.request_id,
                path: req.path,
                content: vec![0x7f, b'E', b'L', b'F', 0xff, 0xfe],
            }),
        )
        .await;

    assert!(matches!(
        read.await.unwrap(),
        Err(GatewayError::File(ref e)) if e.kind == FileErrorKind::NotText
    ));
}

#[tokio::test]
async fn test_unedited_text_round_trips_byte_identically() {
    let (gateway, mut backend) = start(test_options());
    let session = open_ready(&gateway, &mut backend, "server-a").await;
    let served = "\u{feff}# héllo wörld\r\nnamé = \"日本語 🚀\"\r\n\ttrailing  \r\n"
        .as_bytes()
        .to_vec();

    let s = session.clone();
    let read = tokio::spawn(async move { s.read("/etc/app.conf").await });
    let (_, message) = backend.recv().await;
    let Message::FileRead(req) = message else {
        panic!("expected sftp.read");
    };
    backend
        .send(
            "server-a",
            Message::FileReadData(FileReadData {
                request_id: req.request_id,
                path: req.path,
                content: served.clone(),
            }),
        )
        .await;
    let text = read.await.unwrap().unwrap();

    let s = session.clone();
    let write = tokio::spawn(async move { s.write("/etc/app.conf", &text).await });
    let (_, message) = backend.recv().await;
    let Message::FileWrite(req) = message else {
        panic!("expected sftp.write");
    };
    assert_eq!(req.content.as_bytes(), served.as_slice());
    backend
        .send(
            "server-a",
            Message::FileSuccess(FileSuccess {
                request_id: req.request_id,
                path: req.path,
            }),
        )
        .await;
    write.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_reopened_session_ignores_late_answer_to_earlier_request() {
    let (gateway, mut backend) = start(test_options());
    let session = open_ready(&gateway, &mut backend, "server-a").await;

    let s = session.clone();
    let old_list = tokio::spawn(async move { s.list("/root").await });
    let (_, message) = backend.recv().await;
    let Message::FileList(old) = message else {
        panic!("expected sftp.list");
    };
    session.close().await.unwrap();
    let (_, message) = backend.recv().await;
    assert!(matches!(message, Message::Close(_)));
    assert!(matches!(
        old_list.await.unwrap(),
        Err(GatewayError::SessionClosed { .. })
    ));

    let reopened = open_ready(&gateway, &mut backend, "server-a").await;
    let s = reopened.clone();
    let new_list = tokio::spawn(async move { s.list("/root").await });
    let (_, message) = backend.recv().await;
    let Message::FileList(new) = message else {
        panic!("expected sftp.list");
    };
    assert_ne!(old.request_id, new.request_id);

    for (request_id, name) in [(old.request_id, "STALE"), (new.request_id, "fresh")] {
        backend
            .send(
                "server-a",
                Message::FileListData(FileListData {
                    request_id,
                    path: "/root".to_string(),
                    entries: vec![entry(name)],
                }),
            )
            .await;
    }
    let names: Vec<String> = new_list
        .await
        .unwrap()
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();
    assert_eq!(names, vec!["fresh"]);
}

#[tokio::test]
async fn test_mutations_return_directories_to_refresh() {
    let (gateway, mut backend) = start(test_options());
    let session = open_ready(&gateway, &mut backend, "server-a").await;

    let s = session.clone();
    let write = tokio::spawn(async move { s.write("/root/a.txt", "content").await });
    let (_, message) = backend.recv().await;
    let Message::FileWrite(req) = message else {
        panic!("expected sftp.write");
    };
    assert_eq!(req.content, "content");
    backend
        .send(
            "server-a",
            Message::FileSuccess(FileSuccess {
                request_id: req.request_id,
                path: req.path,
            }),
        )
        .await;
    assert_eq!(write.await.unwrap().unwrap().directories, vec!["/root"]);

    let s = session.clone();
    let rename = tokio::spawn(async move { s.rename("/root/a.txt", "/tmp/b.txt").await });
    let (_, message) = backend.recv().await;
    let Message::FileRename(req) = message else {
        panic!("expected sftp.rename");
    };
    backend
        .send(
            "server-a",
            Message::FileSuccess(FileSuccess {
                request_id: req.request_id,
                path: req.from,
            }),
        )
        .await;
    let refresh = rename.await.unwrap().unwrap();
    assert_eq!(refresh.directories, vec!["/root", "/tmp"]);

    // Refreshing is an explicit re-list of each directory.
    let s = session.clone();
    let relist = tokio::spawn(async move { s.refresh(&refresh).await });
    assert_eq!(backend.answer_list(vec![]).await, "/root");
    assert_eq!(backend.answer_list(vec![entry("b.txt")]).await, "/tmp");
    let listings = relist.await.unwrap().unwrap();
    assert_eq!(listings[1].1[0].name, "b.txt");
}

#[tokio::test]
async fn test_download_returns_raw_bytes() {
    let (gateway, mut backend) = start(test_options());
    let session = open_ready(&gateway, &mut backend, "server-a").await;
    let payload = patterned(4096);

    let s = session.clone();
    let download = tokio::spawn(async move { s.download("/srv/blob.bin").await });
    let (_, message) = backend.recv().await;
    let Message::FileDownload(req) = message else {
        panic!("expected sftp.download");
    };
    backend
        .send(
            "server-a",
            Message::FileDownloadData(protocol::messages::FileDownloadData {
                request_id: req.request_id,
                path: req.path,
                data: payload.clone(),
            }),
        )
        .await;

    assert_eq!(download.await.unwrap().unwrap(), payload);
}

#[tokio::test]
async fn test_request_timeout_frees_the_slot() {
    let mut options = test_options();
    options.request_timeout = Duration::from_millis(200);
    let (gateway, mut backend) = start(options);
    let session = open_ready(&gateway, &mut backend, "server-a").await;

    let s = session.clone();
    let slow = tokio::spawn(async move { s.list("/mnt/nfs").await });
    let (_, message) = backend.recv().await;
    let Message::FileList(late) = message else {
        panic!("expected sftp.list");
    };
    assert!(matches!(
        slow.await.unwrap(),
        Err(GatewayError::RequestTimeout { .. })
    ));

    // The late answer is discarded and the next listing proceeds.
    backend
        .send(
            "server-a",
            Message::FileListData(FileListData {
                request_id: late.request_id,
                path: late.path,
                entries: vec![entry("stale")],
            }),
        )
        .await;
    let s = session.clone();
    let next = tokio::spawn(async move { s.list("/root").await });
    backend.answer_list(vec![]).await;
    assert!(next.await.unwrap().unwrap().is_empty());
}

// =============================================================================
// Upload Tests
// =============================================================================

/// What the backend saw during an accepted upload.
struct Accepted {
    data: Vec<u8>,
    checksum: Vec<u8>,
    chunks: usize,
}

/// Play the backend side of a successful upload.
async fn accept_upload(backend: &mut Backend) -> Accepted {
    let (session_id, message) = backend.recv().await;
    let Message::UploadStart(start) = message else {
        panic!("expected upload start, got {}", message.kind());
    };
    backend
        .send(
            &session_id,
            Message::UploadStartAck(UploadStartAck {
                transfer_id: start.transfer_id,
                path: start.path.clone(),
            }),
        )
        .await;

    let mut received = Vec::new();
    let mut chunks = 0;
    loop {
        let (_, message) = backend.recv().await;
        match message {
            Message::UploadChunk(chunk) => {
                assert_eq!(chunk.offset, received.len() as u64, "chunks must be contiguous");
                assert_eq!(chunk.transfer_id, start.transfer_id);
                if received.is_empty() {
                    // Nothing else may arrive before this chunk is acknowledged.
                    backend.assert_silent(Duration::from_millis(50)).await;
                }
                received.extend_from_slice(&chunk.data);
                chunks += 1;
                backend
                    .send(
                        &session_id,
                        Message::UploadChunkAck(UploadChunkAck {
                            transfer_id: chunk.transfer_id,
                            path: chunk.path,
                            offset: chunk.offset,
                        }),
                    )
                    .await;
            }
            Message::UploadFinish(finish) => {
                assert_eq!(received.len() as u64, start.size);
                backend
                    .send(
                        &session_id,
                        Message::UploadSuccess(UploadSuccess {
                            transfer_id: finish.transfer_id,
                            path: finish.path,
                        }),
                    )
                    .await;
                return Accepted {
                    data: received,
                    checksum: finish.checksum,
                    chunks,
                };
            }
            other => panic!("unexpected {}", other.kind()),
        }
    }
}

#[tokio::test]
async fn test_upload_reconstructs_file_in_lock_step() {
    let (gateway, mut backend) = start(test_options());
    let mut events = gateway.subscribe();
    let session = open_ready(&gateway, &mut backend, "server-a").await;
    let data = patterned(5000);

    let s = session.clone();
    let source = data.clone();
    let upload =
        tokio::spawn(async move { s.upload("/srv/data.bin", Cursor::new(source), 5000).await });
    let accepted = accept_upload(&mut backend).await;

    let outcome = upload.await.unwrap().unwrap();
    assert_eq!(accepted.data, data);
    assert_eq!(accepted.chunks, 5);
    assert_eq!(accepted.checksum, Sha256::digest(&data).to_vec());
    assert_eq!(outcome.checksum, accepted.checksum);
    assert_eq!(outcome.chunks, 5);
    assert_eq!(outcome.refresh.directories, vec!["/srv"]);

    let finished =
        next_event(&mut events, |e| matches!(e, GatewayEvent::UploadFinished { .. })).await;
    assert!(matches!(finished, GatewayEvent::UploadFinished { ref path, .. } if path == "/srv/data.bin"));
    assert!(session.active_uploads().is_empty());
}

#[tokio::test]
async fn test_upload_from_local_file() {
    let (gateway, mut backend) = start(test_options());
    let session = open_ready(&gateway, &mut backend, "server-a").await;

    let dir = tempfile::TempDir::new().unwrap();
    let local = dir.path().join("report.csv");
    std::fs::write(&local, b"a,b\n1,2\n").unwrap();

    let s = session.clone();
    let path = local.clone();
    let upload = tokio::spawn(async move { s.upload_file(&path, "/root/report.csv").await });
    let accepted = accept_upload(&mut backend).await;

    assert_eq!(accepted.data, b"a,b\n1,2\n");
    assert_eq!(upload.await.unwrap().unwrap().bytes, 8);
}

#[tokio::test]
async fn test_ten_mib_upload_takes_ten_round_trips() {
    let mut options = test_options();
    options.chunk_size = MIB;
    let (gateway, mut backend) = start(options);
    let session = open_ready(&gateway, &mut backend, "server-a").await;
    let data = patterned(10 * MIB);

    let s = session.clone();
    let source = data.clone();
    let upload = tokio::spawn(async move {
        s.upload("/srv/big.iso", Cursor::new(source), (10 * MIB) as u64)
            .await
    });
    let accepted = accept_upload(&mut backend).await;

    assert_eq!(accepted.chunks, 10);
    assert!(accepted.data == data);
    assert_eq!(upload.await.unwrap().unwrap().chunks, 10);
    backend.assert_silent(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn test_upload_ack_timeout_aborts_without_finish() {
    let mut options = test_options();
    options.chunk_size = MIB;
    options.ack_timeout = Duration::from_secs(1);
    let (gateway, mut backend) = start(options);
    let session = open_ready(&gateway, &mut backend, "server-a").await;

    let s = session.clone();
    let upload = tokio::spawn(async move {
        s.upload("/srv/big.iso", Cursor::new(patterned(10 * MIB)), (10 * MIB) as u64)
            .await
    });

    let (_, message) = backend.recv().await;
    let Message::UploadStart(start) = message else {
        panic!("expected upload start");
    };
    assert_eq!(start.size, (10 * MIB) as u64);
    backend
        .send(
            "server-a",
            Message::UploadStartAck(UploadStartAck {
                transfer_id: start.transfer_id,
                path: "/srv/big.iso".to_string(),
            }),
        )
        .await;
    for i in 0..5u64 {
        let (_, message) = backend.recv().await;
        let Message::UploadChunk(chunk) = message else {
            panic!("expected chunk {i}");
        };
        assert_eq!(chunk.offset, i * MIB as u64);
        if i < 4 {
            backend
                .send(
                    "server-a",
                    Message::UploadChunkAck(UploadChunkAck {
                        transfer_id: chunk.transfer_id,
                        path: chunk.path,
                        offset: chunk.offset,
                    }),
                )
                .await;
        }
    }

    let Err(GatewayError::Upload(err)) = upload.await.unwrap() else {
        panic!("upload should fail");
    };
    assert_eq!(err.failure, UploadFailure::AckTimeout { offset: 4 * MIB as u64 });
    assert_eq!(err.bytes_acknowledged, 4 * MIB as u64);
    assert_eq!(err.state, UploadState::Aborted);
    assert_eq!(err.percent(), 40);

    let (_, message) = backend.recv().await;
    assert!(matches!(message, Message::UploadAbort(ref a) if a.path == "/srv/big.iso"));
    backend.assert_silent(Duration::from_millis(100)).await;
    assert_eq!(session.state(), SessionState::Ready);
}

#[tokio::test]
async fn test_transport_loss_mid_upload() {
    let mut options = test_options();
    options.chunk_size = MIB;
    let (gateway, mut backend) = start(options);
    let session = open_ready(&gateway, &mut backend, "server-a").await;

    let s = session.clone();
    let upload = tokio::spawn(async move {
        s.upload("/srv/big.iso", Cursor::new(patterned(10 * MIB)), (10 * MIB) as u64)
            .await
    });

    let (_, message) = backend.recv().await;
    let Message::UploadStart(start) = message else {
        panic!("expected upload start");
    };
    backend
        .send(
            "server-a",
            Message::UploadStartAck(UploadStartAck {
                transfer_id: start.transfer_id,
                path: "/srv/big.iso".to_string(),
            }),
        )
        .await;
    for i in 0..5u64 {
        let (_, message) = backend.recv().await;
        let Message::UploadChunk(chunk) = message else {
            panic!("expected chunk {i}");
        };
        if i == 4 {
            break;
        }
        backend
            .send(
                "server-a",
                Message::UploadChunkAck(UploadChunkAck {
                    transfer_id: chunk.transfer_id,
                    path: chunk.path,
                    offset: chunk.offset,
                }),
            )
            .await;
    }
    drop(backend);

    let Err(GatewayError::Upload(err)) = upload.await.unwrap() else {
        panic!("upload should fail");
    };
    assert!(matches!(err.failure, UploadFailure::SessionClosed { .. }));
    assert_eq!(err.state, UploadState::Aborted);
    assert_eq!(err.bytes_acknowledged, 4 * MIB as u64);
    assert_eq!(session.state(), SessionState::Closed);
}

#[tokio::test]
async fn test_upload_rejected_by_backend() {
    let (gateway, mut backend) = start(test_options());
    let session = open_ready(&gateway, &mut backend, "server-a").await;

    let s = session.clone();
    let upload = tokio::spawn(async move {
        s.upload("/root/ro/file", Cursor::new(vec![0u8; 100]), 100).await
    });
    let (_, message) = backend.recv().await;
    let Message::UploadStart(start) = message else {
        panic!("expected upload start");
    };
    backend
        .send(
            "server-a",
            Message::UploadError(WireUploadError {
                transfer_id: start.transfer_id,
                path: "/root/ro/file".to_string(),
                code: FileErrorCode::PermissionDenied,
                message: "read-only file system".to_string(),
            }),
        )
        .await;

    let Err(GatewayError::Upload(err)) = upload.await.unwrap() else {
        panic!("upload should fail");
    };
    assert!(matches!(err.failure, UploadFailure::Rejected { ref code, .. } if code == "PermissionDenied"));
    let (_, message) = backend.recv().await;
    assert!(matches!(message, Message::UploadAbort(_)));
}

#[tokio::test]
async fn test_second_upload_to_same_path_rejected() {
    let (gateway, mut backend) = start(test_options());
    let session = open_ready(&gateway, &mut backend, "server-a").await;

    let s = session.clone();
    let first = tokio::spawn(async move {
        s.upload("/srv/a.bin", Cursor::new(vec![1u8; 10]), 10).await
    });
    let (_, message) = backend.recv().await;
    let Message::UploadStart(start) = message else {
        panic!("expected upload start");
    };

    let second = session
        .upload("/srv/a.bin", Cursor::new(vec![2u8; 10]), 10)
        .await;
    assert!(matches!(
        second,
        Err(GatewayError::Upload(ref e)) if e.failure == UploadFailure::AlreadyInProgress
    ));
    assert_eq!(session.active_uploads(), vec!["/srv/a.bin".to_string()]);

    backend
        .send(
            "server-a",
            Message::UploadError(WireUploadError {
                transfer_id: start.transfer_id,
                path: "/srv/a.bin".to_string(),
                code: FileErrorCode::Internal,
                message: "disk full".to_string(),
            }),
        )
        .await;
    assert!(first.await.unwrap().is_err());
}

#[tokio::test]
async fn test_reopened_session_ignores_replies_for_earlier_upload() {
    let (gateway, mut backend) = start(test_options());
    let session = open_ready(&gateway, &mut backend, "server-a").await;

    let s = session.clone();
    let old_upload = tokio::spawn(async move {
        s.upload("/srv/x.bin", Cursor::new(vec![1u8; 10]), 10).await
    });
    let (_, message) = backend.recv().await;
    let Message::UploadStart(old) = message else {
        panic!("expected upload start");
    };
    session.close().await.unwrap();
    let (_, message) = backend.recv().await;
    assert!(matches!(message, Message::UploadAbort(ref a) if a.transfer_id == old.transfer_id));
    let (_, message) = backend.recv().await;
    assert!(matches!(message, Message::Close(_)));
    assert!(old_upload.await.unwrap().is_err());

    let reopened = open_ready(&gateway, &mut backend, "server-a").await;
    let s = reopened.clone();
    let upload = tokio::spawn(async move {
        s.upload("/srv/x.bin", Cursor::new(vec![2u8; 10]), 10).await
    });
    let (_, message) = backend.recv().await;
    let Message::UploadStart(new) = message else {
        panic!("expected upload start");
    };
    assert_ne!(old.transfer_id, new.transfer_id);

    // The late acknowledgement for the first transfer must not release a chunk.
    backend
        .send(
            "server-a",
            Message::UploadStartAck(UploadStartAck {
                transfer_id: old.transfer_id,
                path: "/srv/x.bin".to_string(),
            }),
        )
        .await;
    backend.assert_silent(Duration::from_millis(100)).await;

    backend
        .send(
            "server-a",
            Message::UploadStartAck(UploadStartAck {
                transfer_id: new.transfer_id,
                path: "/srv/x.bin".to_string(),
            }),
        )
        .await;
    let (_, message) = backend.recv().await;
    let Message::UploadChunk(chunk) = message else {
        panic!("expected chunk");
    };
    assert_eq!(chunk.data, vec![2u8; 10]);
    backend
        .send(
            "server-a",
            Message::UploadChunkAck(UploadChunkAck {
                transfer_id: chunk.transfer_id,
                path: chunk.path,
                offset: chunk.offset,
            }),
        )
        .await;
    let (_, message) = backend.recv().await;
    let Message::UploadFinish(finish) = message else {
        panic!("expected finish");
    };
    backend
        .send(
            "server-a",
            Message::UploadSuccess(UploadSuccess {
                transfer_id: finish.transfer_id,
                path: finish.path,
            }),
        )
        .await;
    assert_eq!(upload.await.unwrap().unwrap().bytes, 10);
}

#[tokio::test]
async fn test_close_while_reading_source_sends_no_chunk_after_close() {
    let (gateway, mut backend) = start(test_options());
    let session = open_ready(&gateway, &mut backend, "server-a").await;

    // Only the first chunk is readable until the feed is written again.
    let (mut feed, source) = tokio::io::duplex(64 * 1024);
    feed.write_all(&[5u8; 1024]).await.unwrap();

    let s = session.clone();
    let upload = tokio::spawn(async move { s.upload("/srv/gated.bin", source, 3072).await });
    let (_, message) = backend.recv().await;
    let Message::UploadStart(start) = message else {
        panic!("expected upload start");
    };
    backend
        .send(
            "server-a",
            Message::UploadStartAck(UploadStartAck {
                transfer_id: start.transfer_id,
                path: start.path.clone(),
            }),
        )
        .await;
    let (_, message) = backend.recv().await;
    let Message::UploadChunk(chunk) = message else {
        panic!("expected first chunk");
    };
    backend
        .send(
            "server-a",
            Message::UploadChunkAck(UploadChunkAck {
                transfer_id: chunk.transfer_id,
                path: chunk.path,
                offset: chunk.offset,
            }),
        )
        .await;
    // The upload is now blocked reading the second chunk.
    backend.assert_silent(Duration::from_millis(50)).await;

    session.close().await.unwrap();
    let _ = feed.write_all(&[6u8; 2048]).await;
    drop(feed);

    let mut seen = Vec::new();
    while let Ok(Some(envelope)) = timeout(Duration::from_millis(200), backend.rx.recv()).await {
        seen.push(envelope.expect("undecodable envelope").payload.kind());
    }
    assert_eq!(seen, vec!["sftp.upload.abort", "close"]);

    let Err(GatewayError::Upload(err)) = upload.await.unwrap() else {
        panic!("upload should fail");
    };
    assert!(matches!(err.failure, UploadFailure::SessionClosed { .. }));
    assert_eq!(err.bytes_acknowledged, 1024);
}

// =============================================================================
// Monitoring Tests
// =============================================================================

fn sample(cpu: f64) -> MonitoringSample {
    MonitoringSample {
        cpu_percent: cpu,
        mem_used_kb: 1_000_000,
        mem_total_kb: 4_000_000,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_stale_samples_discarded_after_stop() {
    let (gateway, mut backend) = start(test_options());
    let mut events = gateway.subscribe();
    let session = open_ready(&gateway, &mut backend, "server-a").await;

    session.start_monitoring().await.unwrap();
    session.start_monitoring().await.unwrap();
    let (_, message) = backend.recv().await;
    assert!(matches!(message, Message::MonitorStart(_)));

    backend.send("server-a", Message::MonitorData(sample(42.0))).await;
    next_event(&mut events, |e| matches!(e, GatewayEvent::Sample { .. })).await;
    assert_eq!(gateway.latest_sample("server-a").map(|s| s.cpu_percent), Some(42.0));

    session.stop_monitoring().await.unwrap();
    let (_, message) = backend.recv().await;
    assert!(matches!(message, Message::MonitorStop(_)));
    assert!(session.latest_sample().is_none());

    // A sample already in flight when monitoring stopped.
    backend.send("server-a", Message::MonitorData(sample(99.0))).await;
    // And one for a session that never existed.
    backend.send("ghost", Message::MonitorData(sample(1.0))).await;
    barrier(&mut backend, &session).await;

    assert!(session.latest_sample().is_none());
    assert!(gateway.latest_sample("ghost").is_none());
}

// =============================================================================
// Close Tests
// =============================================================================

#[tokio::test]
async fn test_close_aborts_uploads_and_stops_monitoring() {
    let (gateway, mut backend) = start(test_options());
    let session = open_ready(&gateway, &mut backend, "server-a").await;

    session.start_monitoring().await.unwrap();
    let _ = backend.recv().await;

    let s = session.clone();
    let upload = tokio::spawn(async move {
        s.upload("/srv/c.bin", Cursor::new(vec![3u8; 3000]), 3000).await
    });
    let (_, message) = backend.recv().await;
    let Message::UploadStart(start) = message else {
        panic!("expected upload start");
    };
    backend
        .send(
            "server-a",
            Message::UploadStartAck(UploadStartAck {
                transfer_id: start.transfer_id,
                path: "/srv/c.bin".to_string(),
            }),
        )
        .await;
    let (_, message) = backend.recv().await;
    assert!(matches!(message, Message::UploadChunk(ref c) if c.offset == 0));

    session.close().await.unwrap();

    let (_, message) = backend.recv().await;
    assert!(matches!(message, Message::UploadAbort(ref a) if a.path == "/srv/c.bin"));
    let (_, message) = backend.recv().await;
    assert!(matches!(message, Message::MonitorStop(_)));
    let (_, message) = backend.recv().await;
    assert!(matches!(message, Message::Close(_)));

    let Err(GatewayError::Upload(err)) = upload.await.unwrap() else {
        panic!("upload should fail");
    };
    assert!(matches!(err.failure, UploadFailure::SessionClosed { .. }));
    backend.assert_silent(Duration::from_millis(100)).await;

    // Closing twice is a no-op.
    session.close().await.unwrap();
    backend.assert_silent(Duration::from_millis(50)).await;
    assert!(gateway.sessions().is_empty());

    // The id can be opened again as a new session.
    let reopened = gateway.open("server-a", None).await.unwrap();
    assert_eq!(reopened.state(), SessionState::Connecting);
    let (_, message) = backend.recv().await;
    assert!(matches!(message, Message::Connect(_)));
}

#[tokio::test]
async fn test_shutdown_closes_all_sessions() {
    let (gateway, mut backend) = start(test_options());
    let a = open_ready(&gateway, &mut backend, "server-a").await;
    let b = open_ready(&gateway, &mut backend, "server-b").await;

    gateway.shutdown().await;

    let mut closed = Vec::new();
    for _ in 0..2 {
        let (session_id, message) = backend.recv().await;
        assert!(matches!(message, Message::Close(_)));
        closed.push(session_id);
    }
    closed.sort();
    assert_eq!(closed, vec!["server-a", "server-b"]);
    assert_eq!(a.state(), SessionState::Closed);
    assert_eq!(b.state(), SessionState::Closed);
    assert!(!gateway.is_connected());
}
