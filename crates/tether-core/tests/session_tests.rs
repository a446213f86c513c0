//! Session tests: transport fallback, file operations and link lifecycle.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::broadcast;

use tether_core::connection::ConnectionState;
use tether_core::error::{Error, RemoteErrorCode};
use tether_core::files::{SortField, SortOrder};
use tether_core::permission::FixedPermission;
use tether_core::protocol::Opcode;
use tether_core::session::Session;
use tether_core::transport::TransportKind;

use common::{connected_session, test_config, FakeHost, HostOpener, HOST_IDENTITY};

fn drain(rx: &mut broadcast::Receiver<ConnectionState>) -> Vec<ConnectionState> {
    let mut seen = Vec::new();
    while let Ok(state) = rx.try_recv() {
        seen.push(state);
    }
    seen
}

fn sample_host() -> FakeHost {
    let host = FakeHost::new();
    host.add_dir("/docs");
    host.add_dir("/music");
    host.add_file("/b.txt", b"bee");
    host.add_file("/A.txt", b"a much longer file");
    host.add_file("/docs/report.pdf", &[7u8; 4096]);
    host.add_file("/docs/notes.txt", b"notes");
    host
}

/// Test that a denied permission prompt sends the session through the ADB
/// tunnel, over a real TCP socket.
#[tokio::test]
async fn test_permission_denied_uses_adb_tunnel() {
    let host = sample_host();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    host.serve_tcp(listener);

    let mut config = test_config();
    config.link.adb_port = port;
    let session = Session::builder(config)
        .permission_platform(Arc::new(FixedPermission::new(false)))
        .build()
        .unwrap();
    let mut transitions = session.transitions();

    let info = session.connect().await.unwrap();
    assert_eq!(info.identity, HOST_IDENTITY);
    assert_eq!(
        drain(&mut transitions),
        vec![
            ConnectionState::PermissionRequired,
            ConnectionState::Connecting(TransportKind::AdbTunnel),
            ConnectionState::Connected(TransportKind::AdbTunnel),
        ]
    );
    assert_eq!(host.requests()[0], Opcode::Handshake);
}

/// Test that a USB backend that does not respond falls back to the tunnel.
#[tokio::test]
async fn test_backend_unavailable_uses_adb_tunnel() {
    let host = sample_host();
    let opener = Arc::new(HostOpener::new(&host, &[TransportKind::AdbTunnel]));
    let session = Session::builder(test_config())
        .permission_platform(Arc::new(FixedPermission::new(true)))
        .link_opener(opener.clone())
        .build()
        .unwrap();
    let mut transitions = session.transitions();

    session.connect().await.unwrap();

    assert_eq!(
        drain(&mut transitions),
        vec![
            ConnectionState::Connecting(TransportKind::UsbDirect),
            ConnectionState::Connecting(TransportKind::AdbTunnel),
            ConnectionState::Connected(TransportKind::AdbTunnel),
        ]
    );
    assert_eq!(
        opener.attempts(),
        vec![TransportKind::UsbDirect, TransportKind::AdbTunnel]
    );
}

/// Test that the simulation transport is tried only when enabled.
#[tokio::test]
async fn test_simulation_fallback_requires_opt_in() {
    let host = sample_host();

    let session = Session::builder(test_config())
        .link_opener(Arc::new(HostOpener::new(
            &host,
            &[TransportKind::SimulatedTcp],
        )))
        .build()
        .unwrap();
    let err = session.connect().await.unwrap_err();
    assert!(matches!(err, Error::HostUnreachable { .. }));
    assert!(matches!(session.state(), ConnectionState::Error(_)));

    let mut config = test_config();
    config.link.simulation_enabled = true;
    let session = Session::builder(config)
        .link_opener(Arc::new(HostOpener::new(
            &host,
            &[TransportKind::SimulatedTcp],
        )))
        .build()
        .unwrap();
    session.connect().await.unwrap();
    assert_eq!(
        session.state(),
        ConnectionState::Connected(TransportKind::SimulatedTcp)
    );
}

/// Test listing order, metadata and the mutating operations.
#[tokio::test]
async fn test_file_operations() {
    let host = sample_host();
    let session = connected_session(&host, test_config()).await;
    let files = session.files();

    let names: Vec<String> = files
        .list("/", SortOrder::default())
        .await
        .unwrap()
        .into_iter()
        .map(|item| item.name)
        .collect();
    assert_eq!(names, vec!["docs", "music", "A.txt", "b.txt"]);

    let by_size = files
        .list("/", SortOrder::new(SortField::Size, false))
        .await
        .unwrap();
    assert!(by_size[0].is_directory && by_size[1].is_directory);
    assert_eq!(by_size[2].name, "A.txt");

    let info = files.get_info("/docs/report.pdf").await.unwrap();
    assert_eq!(info.size_bytes, 4096);
    assert_eq!(info.extension(), "pdf");

    files.create_folder("/docs/archive").await.unwrap();
    assert!(host.exists("/docs/archive"));
    assert!(matches!(
        files.create_folder("/docs/archive").await,
        Err(Error::Remote {
            code: RemoteErrorCode::AlreadyExists,
            ..
        })
    ));

    files.rename("/docs/notes.txt", "todo.txt").await.unwrap();
    assert!(host.exists("/docs/todo.txt"));
    assert!(!host.exists("/docs/notes.txt"));

    let found = files.search("REPORT", "/").await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].path, "/docs/report.pdf");

    assert_eq!(files.get_drives().await.unwrap(), vec!["/".to_string()]);
    let storage = files.get_storage_info("/").await.unwrap();
    assert!(storage.free_bytes <= storage.total_bytes);
    assert!(storage.used_bytes() > 0);

    assert!(matches!(
        files.get_info("/missing").await,
        Err(Error::Remote {
            code: RemoteErrorCode::FileNotFound,
            ..
        })
    ));
}

/// Test that a delete keeps going past a path the host refuses.
#[tokio::test]
async fn test_delete_reports_partial_failure() {
    let host = sample_host();
    host.lock_path("/b.txt");
    let session = connected_session(&host, test_config()).await;

    let err = session
        .files()
        .delete(&["/A.txt", "/b.txt", "/docs"])
        .await
        .unwrap_err();

    match err {
        Error::DeleteFailed(failed) => {
            assert_eq!(failed.len(), 1);
            assert_eq!(failed[0].0, "/b.txt");
        }
        other => panic!("expected DeleteFailed, got {other:?}"),
    }
    assert!(!host.exists("/A.txt"));
    assert!(!host.exists("/docs/report.pdf"));
    assert!(host.exists("/b.txt"));
}

/// Test that many concurrent requests each get their own answer.
#[tokio::test]
async fn test_concurrent_requests_are_correlated() {
    let host = FakeHost::new();
    for i in 0..32 {
        host.add_file(&format!("/file-{i}.bin"), &vec![0u8; i]);
    }
    let session = connected_session(&host, test_config()).await;

    let requests = (0..32).map(|i| {
        let files = session.files().clone();
        async move { (i, files.get_info(&format!("/file-{i}.bin")).await) }
    });
    for (i, result) in futures::future::join_all(requests).await {
        let info = result.unwrap();
        assert_eq!(info.path, format!("/file-{i}.bin"));
        assert_eq!(info.size_bytes, i as u64);
    }
}

/// Test disconnecting, then connecting again on the same session.
#[tokio::test]
async fn test_disconnect_and_reconnect() {
    let host = sample_host();
    let session = connected_session(&host, test_config()).await;

    let again = session.connect().await.unwrap();
    assert_eq!(again.identity, HOST_IDENTITY);
    assert_eq!(host.count(Opcode::Handshake), 1);

    session.disconnect().await;
    assert_eq!(session.state(), ConnectionState::Disconnected);
    assert!(session.host_info().is_none());
    assert_eq!(host.count(Opcode::Disconnect), 1);
    assert!(matches!(
        session.files().list("/", SortOrder::default()).await,
        Err(Error::NotConnected)
    ));

    session.connect().await.unwrap();
    assert!(session.state().is_connected());
    assert_eq!(host.count(Opcode::Handshake), 2);
    assert_eq!(
        session.files().list("/docs", SortOrder::default()).await.unwrap().len(),
        2
    );
}

/// Test that a link dropped by the host moves the session to `Error`.
#[tokio::test]
async fn test_host_hangup_is_reported() {
    let host = sample_host();
    host.add_file("/big.bin", &[1u8; 4096]);
    host.drop_link_after_reads(0);
    let session = connected_session(&host, test_config()).await;
    let mut state = session.subscribe_state();

    let dir = common::create_temp_dir();
    let task = session
        .transfers()
        .download_file("/big.bin", dir.path().join("big.bin"))
        .await
        .unwrap();
    session.transfers().wait_until_settled(task.id).await.unwrap();

    tokio::time::timeout(
        Duration::from_secs(2),
        state.wait_for(|s| matches!(s, ConnectionState::Error(_))),
    )
    .await
    .expect("state should move to Error")
    .unwrap();
    assert!(session.host_info().is_none());
    assert!(matches!(
        session.files().list("/", SortOrder::default()).await,
        Err(Error::NotConnected)
    ));
}
