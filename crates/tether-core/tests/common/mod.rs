//! Common test utilities for `Tether` integration tests.
//!
//! [`FakeHost`] speaks the wire protocol over any byte stream and keeps an
//! in-memory file tree, with hooks to stall or drop the link mid-transfer.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{TimeZone, Utc};
use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite, WriteHalf};
use tokio::net::TcpListener;

use tether_core::config::Config;
use tether_core::error::{Error, RemoteErrorCode, Result};
use tether_core::files::{FileItem, StorageInfo};
use tether_core::protocol::payload::{
    self, ErrorPayload, ReadRequest, RenameRequest, SearchRequest, WriteChunk,
};
use tether_core::protocol::{Frame, FrameCodec, Opcode};
use tether_core::session::Session;
use tether_core::transport::{Link, LinkOpener, TransportKind};

/// Identity the fake host reports in the handshake.
pub const HOST_IDENTITY: &str = "PCEX-Server-1.0";

#[derive(Debug, Clone)]
struct Entry {
    data: Vec<u8>,
    is_directory: bool,
}

#[derive(Debug, Default)]
struct HostState {
    entries: BTreeMap<String, Entry>,
    requests: Vec<Opcode>,
    reads_seen: usize,
    stall_reads_after: Option<usize>,
    drop_link_after_reads: Option<usize>,
    read_delay: Option<Duration>,
    write_delay: Option<Duration>,
    locked: HashSet<String>,
}

/// In-memory host.
#[derive(Debug, Clone, Default)]
pub struct FakeHost {
    state: Arc<Mutex<HostState>>,
}

enum Action {
    Reply(Frame),
    Stall,
    Hangup,
}

impl FakeHost {
    /// Host with an empty root directory.
    pub fn new() -> Self {
        let host = Self::default();
        host.add_dir("/");
        host
    }

    /// Add a directory.
    pub fn add_dir(&self, path: &str) {
        self.state.lock().unwrap().entries.insert(
            path.to_string(),
            Entry {
                data: Vec::new(),
                is_directory: true,
            },
        );
    }

    /// Add a file with the given contents.
    pub fn add_file(&self, path: &str, data: &[u8]) {
        self.state.lock().unwrap().entries.insert(
            path.to_string(),
            Entry {
                data: data.to_vec(),
                is_directory: false,
            },
        );
    }

    /// Contents of a file, if it exists.
    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.state
            .lock()
            .unwrap()
            .entries
            .get(path)
            .filter(|e| !e.is_directory)
            .map(|e| e.data.clone())
    }

    /// Whether `path` exists.
    pub fn exists(&self, path: &str) -> bool {
        self.state.lock().unwrap().entries.contains_key(path)
    }

    /// Refuse to delete `path`.
    pub fn lock_path(&self, path: &str) {
        self.state.lock().unwrap().locked.insert(path.to_string());
    }

    /// Stop answering reads once `n` have been answered.
    pub fn stall_reads_after(&self, n: usize) {
        self.state.lock().unwrap().stall_reads_after = Some(n);
    }

    /// Hang up once `n` reads have been answered.
    pub fn drop_link_after_reads(&self, n: usize) {
        self.state.lock().unwrap().drop_link_after_reads = Some(n);
    }

    /// Delay every read answer.
    pub fn set_read_delay(&self, delay: Duration) {
        self.state.lock().unwrap().read_delay = Some(delay);
    }

    /// Delay every write acknowledgment.
    pub fn set_write_delay(&self, delay: Duration) {
        self.state.lock().unwrap().write_delay = Some(delay);
    }

    /// Clear the stall, drop and delay hooks.
    pub fn heal(&self) {
        let mut state = self.state.lock().unwrap();
        state.stall_reads_after = None;
        state.drop_link_after_reads = None;
        state.read_delay = None;
        state.write_delay = None;
    }

    /// Opcodes received so far, in arrival order.
    pub fn requests(&self) -> Vec<Opcode> {
        self.state.lock().unwrap().requests.clone()
    }

    /// How many requests with `opcode` arrived.
    pub fn count(&self, opcode: Opcode) -> usize {
        self.requests().iter().filter(|op| **op == opcode).count()
    }

    /// Serve one client on `io` in the background.
    pub fn serve<S>(&self, io: S)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let host = self.clone();
        tokio::spawn(async move {
            let codec = FrameCodec::default();
            let (mut reader, writer) = tokio::io::split(io);
            let writer = Arc::new(tokio::sync::Mutex::new(writer));

            while let Ok(Some(request)) = codec.read_frame(&mut reader).await {
                let closing = request.opcode == Opcode::Disconnect;
                let (action, delay) = host.handle(&request);
                match action {
                    Action::Hangup => break,
                    Action::Stall => {
                        // Hold the link open without ever answering.
                        let writer = Arc::clone(&writer);
                        tokio::spawn(async move {
                            let _writer = writer;
                            std::future::pending::<()>().await;
                        });
                    }
                    Action::Reply(frame) => {
                        let writer = Arc::clone(&writer);
                        tokio::spawn(async move {
                            if let Some(delay) = delay {
                                tokio::time::sleep(delay).await;
                            }
                            reply(&writer, &frame).await;
                        });
                    }
                }
                if closing {
                    break;
                }
            }
        });
    }

    /// Accept one TCP client on `listener` and serve it.
    pub fn serve_tcp(&self, listener: TcpListener) {
        let host = self.clone();
        tokio::spawn(async move {
            if let Ok((stream, _)) = listener.accept().await {
                host.serve(stream);
            }
        });
    }

    fn handle(&self, request: &Frame) -> (Action, Option<Duration>) {
        let mut state = self.state.lock().unwrap();
        state.requests.push(request.opcode);

        let mut delay = None;
        if request.opcode == Opcode::ReadFile {
            if state
                .drop_link_after_reads
                .is_some_and(|n| state.reads_seen >= n)
            {
                return (Action::Hangup, None);
            }
            if state
                .stall_reads_after
                .is_some_and(|n| state.reads_seen >= n)
            {
                return (Action::Stall, None);
            }
            state.reads_seen += 1;
            delay = state.read_delay;
        } else if request.opcode == Opcode::WriteFile {
            delay = state.write_delay;
        }

        let id = request.correlation_id;
        let frame = match execute(&mut state, request) {
            Ok((opcode, payload)) => Frame::new(opcode, id, payload),
            Err((code, message)) => Frame::new(
                Opcode::Error,
                id,
                ErrorPayload {
                    code: code as u32,
                    message,
                }
                .encode(),
            ),
        };
        (Action::Reply(frame), delay)
    }
}

async fn reply<W: AsyncWrite>(writer: &tokio::sync::Mutex<WriteHalf<W>>, frame: &Frame) {
    let mut writer = writer.lock().await;
    let _ = FrameCodec::default().write_frame(&mut *writer, frame).await;
}

type HostResult = std::result::Result<(Opcode, Vec<u8>), (RemoteErrorCode, String)>;

fn malformed(e: &Error) -> (RemoteErrorCode, String) {
    (RemoteErrorCode::ProtocolError, e.to_string())
}

fn parent_of(path: &str) -> &str {
    match path.trim_end_matches('/').rfind('/') {
        Some(0) => "/",
        Some(idx) => &path[..idx],
        None => "/",
    }
}

fn name_of(path: &str) -> &str {
    path.trim_end_matches('/').rsplit('/').next().unwrap_or(path)
}

fn join(parent: &str, name: &str) -> String {
    if parent.ends_with('/') {
        format!("{parent}{name}")
    } else {
        format!("{parent}/{name}")
    }
}

fn item(path: &str, entry: &Entry) -> FileItem {
    FileItem {
        path: path.to_string(),
        name: name_of(path).to_string(),
        size_bytes: entry.data.len() as u64,
        is_directory: entry.is_directory,
        modified_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        permission_bits: if entry.is_directory { 0o755 } else { 0o644 },
    }
}

fn lookup<'a>(state: &'a HostState, path: &str) -> std::result::Result<&'a Entry, (RemoteErrorCode, String)> {
    state
        .entries
        .get(path)
        .ok_or_else(|| (RemoteErrorCode::FileNotFound, format!("{path} not found")))
}

fn execute(state: &mut HostState, request: &Frame) -> HostResult {
    let body = &request.payload;
    match request.opcode {
        Opcode::Handshake => Ok((Opcode::Data, payload::encode_path(HOST_IDENTITY))),
        Opcode::Disconnect => Ok((Opcode::Ok, Vec::new())),
        Opcode::ListDir => {
            let path = payload::decode_path(body).map_err(|e| malformed(&e))?;
            let dir = lookup(state, &path)?;
            if !dir.is_directory {
                return Err((RemoteErrorCode::InvalidPath, format!("{path} is a file")));
            }
            let items: Vec<FileItem> = state
                .entries
                .iter()
                .filter(|(p, _)| p.as_str() != path && parent_of(p) == path)
                .map(|(p, e)| item(p, e))
                .collect();
            Ok((Opcode::Data, payload::encode_file_list(&items)))
        }
        Opcode::GetFileInfo => {
            let path = payload::decode_path(body).map_err(|e| malformed(&e))?;
            let entry = lookup(state, &path)?;
            Ok((Opcode::Data, payload::encode_file_item(&item(&path, entry))))
        }
        Opcode::ReadFile => {
            let request = ReadRequest::decode(body).map_err(|e| malformed(&e))?;
            let entry = lookup(state, &request.path)?;
            let start = usize::try_from(request.offset).unwrap().min(entry.data.len());
            let end = (start + usize::try_from(request.length).unwrap()).min(entry.data.len());
            Ok((Opcode::FileChunk, entry.data[start..end].to_vec()))
        }
        Opcode::WriteFile => {
            let chunk = WriteChunk::decode(body).map_err(|e| malformed(&e))?;
            let entry = state.entries.entry(chunk.path.clone()).or_insert(Entry {
                data: Vec::new(),
                is_directory: false,
            });
            let offset = usize::try_from(chunk.offset).unwrap();
            if offset == 0 {
                entry.data.clear();
            }
            entry.data.truncate(offset);
            entry.data.extend_from_slice(&chunk.data);
            Ok((Opcode::Ok, Vec::new()))
        }
        Opcode::CreateDir => {
            let path = payload::decode_path(body).map_err(|e| malformed(&e))?;
            if state.entries.contains_key(&path) {
                return Err((RemoteErrorCode::AlreadyExists, format!("{path} exists")));
            }
            state.entries.insert(
                path,
                Entry {
                    data: Vec::new(),
                    is_directory: true,
                },
            );
            Ok((Opcode::Ok, Vec::new()))
        }
        Opcode::Delete => {
            let path = payload::decode_path(body).map_err(|e| malformed(&e))?;
            lookup(state, &path)?;
            if state.locked.contains(&path) {
                return Err((RemoteErrorCode::PermissionDenied, format!("{path} is locked")));
            }
            let prefix = join(&path, "");
            state
                .entries
                .retain(|p, _| p != &path && !p.starts_with(&prefix));
            Ok((Opcode::Ok, Vec::new()))
        }
        Opcode::Rename => {
            let request = RenameRequest::decode(body).map_err(|e| malformed(&e))?;
            let entry = lookup(state, &request.path)?.clone();
            let target = join(parent_of(&request.path), &request.new_name);
            if state.entries.contains_key(&target) {
                return Err((RemoteErrorCode::AlreadyExists, format!("{target} exists")));
            }
            state.entries.remove(&request.path);
            state.entries.insert(target, entry);
            Ok((Opcode::Ok, Vec::new()))
        }
        Opcode::Search => {
            let request = SearchRequest::decode(body).map_err(|e| malformed(&e))?;
            let query = request.query.to_lowercase();
            let prefix = join(&request.base_path, "");
            let items: Vec<FileItem> = state
                .entries
                .iter()
                .filter(|(p, _)| p.starts_with(&prefix))
                .filter(|(p, _)| name_of(p).to_lowercase().contains(&query))
                .map(|(p, e)| item(p, e))
                .collect();
            Ok((Opcode::Data, payload::encode_file_list(&items)))
        }
        Opcode::GetDrives => Ok((
            Opcode::Data,
            payload::encode_drive_list(&["/".to_string()]),
        )),
        Opcode::GetStorageInfo => {
            let used: u64 = state.entries.values().map(|e| e.data.len() as u64).sum();
            let total = 1 << 30;
            let info = StorageInfo {
                drive_label: "/".to_string(),
                volume_name: "fake".to_string(),
                total_bytes: total,
                free_bytes: total - used,
            };
            Ok((Opcode::Data, payload::encode_storage_info(&info)))
        }
        other => Err((
            RemoteErrorCode::UnknownCommand,
            format!("unsupported opcode {other:?}"),
        )),
    }
}

/// Opens in-memory links to a [`FakeHost`].
///
/// Transports not listed as working fail the way the real ones do.
pub struct HostOpener {
    host: FakeHost,
    working: Vec<TransportKind>,
    attempts: Mutex<Vec<TransportKind>>,
}

impl HostOpener {
    /// Opener where only `working` transports succeed.
    pub fn new(host: &FakeHost, working: &[TransportKind]) -> Self {
        Self {
            host: host.clone(),
            working: working.to_vec(),
            attempts: Mutex::new(Vec::new()),
        }
    }

    /// Transports tried so far.
    pub fn attempts(&self) -> Vec<TransportKind> {
        self.attempts.lock().unwrap().clone()
    }
}

impl LinkOpener for HostOpener {
    fn open_link(&self, kind: TransportKind) -> BoxFuture<'_, Result<Link>> {
        Box::pin(async move {
            self.attempts.lock().unwrap().push(kind);
            if !self.working.contains(&kind) {
                return Err(match kind {
                    TransportKind::UsbDirect => {
                        Error::BackendUnavailable("no device attached".to_string())
                    }
                    TransportKind::AdbTunnel | TransportKind::SimulatedTcp => {
                        Error::HostUnreachable {
                            addr: ([127, 0, 0, 1], 5555).into(),
                            reason: "connection refused".to_string(),
                        }
                    }
                });
            }
            let (client, server) = tokio::io::duplex(1 << 20);
            self.host.serve(server);
            Ok(Link::from_io(kind, Box::new(client)))
        })
    }
}

/// Configuration for tests: small timeouts, no persistence.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.protocol.default_timeout = Duration::from_secs(2);
    config.transfer.chunk_timeout = Duration::from_secs(2);
    config.transfer.persist_tasks = false;
    config
}

/// Session connected to `host` over the ADB tunnel.
pub async fn connected_session(host: &FakeHost, config: Config) -> Session {
    let session = Session::builder(config)
        .link_opener(Arc::new(HostOpener::new(host, &[TransportKind::AdbTunnel])))
        .build()
        .expect("valid test config");
    session.connect().await.expect("connect to fake host");
    session
}

/// Create a temporary directory for test files.
///
/// The directory will be automatically cleaned up when the returned
/// `TempDir` is dropped.
pub fn create_temp_dir() -> tempfile::TempDir {
    tempfile::tempdir().expect("Failed to create temp directory")
}

/// Create a test file with the given content.
pub fn create_test_file(dir: &std::path::Path, name: &str, content: &[u8]) -> PathBuf {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("Failed to create parent directories");
    }
    std::fs::write(&path, content).expect("Failed to write test file");
    path
}

/// Generate random bytes for testing.
pub fn random_bytes(size: usize) -> Vec<u8> {
    use rand::RngCore;
    let mut bytes = vec![0u8; size];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}
