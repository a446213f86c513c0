//! Correlated request/response over the active link.
//!
//! A [`RequestDispatcher`] owns both halves of a [`Link`]. One background
//! task is the only reader: it decodes frames and hands each to the caller
//! waiting on its correlation id. A second task is the only writer, so a
//! caller that gives up mid-request never leaves half a frame on the wire.
//!
//! When the link ends, for any reason, every outstanding caller fails with
//! `Error::LinkLost` and later sends fail the same way.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, watch, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::config::ProtocolConfig;
use crate::error::{Error, Result};
use crate::protocol::payload::ErrorPayload;
use crate::protocol::{Frame, FrameCodec, Opcode};
use crate::transport::{Link, TransportKind};

/// Encoded frames waiting for the writer task.
const OUTGOING_QUEUE: usize = 32;

type Waiter = oneshot::Sender<Result<Frame>>;

struct Pending {
    waiters: HashMap<u32, Waiter>,
    next_id: u32,
    closed: Option<String>,
}

impl Pending {
    /// Next id not held by an in-flight request. Zero is never used.
    fn allocate(&mut self) -> u32 {
        loop {
            let id = self.next_id;
            self.next_id = self.next_id.wrapping_add(1);
            if id != 0 && !self.waiters.contains_key(&id) {
                return id;
            }
        }
    }
}

struct Shared {
    pending: Mutex<Pending>,
    permits: Semaphore,
    closed: watch::Sender<Option<String>>,
    shutdown: CancellationToken,
}

impl Shared {
    fn lock(&self) -> std::sync::MutexGuard<'_, Pending> {
        // Nothing panics while holding this lock; recover the data if it did.
        self.pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn register(&self, waiter: Waiter) -> Result<u32> {
        let mut pending = self.lock();
        if let Some(reason) = &pending.closed {
            return Err(Error::LinkLost(reason.clone()));
        }
        let id = pending.allocate();
        pending.waiters.insert(id, waiter);
        Ok(id)
    }

    fn forget(&self, correlation_id: u32) {
        self.lock().waiters.remove(&correlation_id);
    }

    fn deliver(&self, frame: Frame) {
        if !frame.opcode.is_response() {
            tracing::debug!(
                correlation_id = frame.correlation_id,
                opcode = ?frame.opcode,
                "Dropping non-response frame from host"
            );
            return;
        }

        let waiter = self.lock().waiters.remove(&frame.correlation_id);
        match waiter {
            Some(waiter) => {
                // The caller may have timed out in the meantime.
                let _ = waiter.send(Ok(frame));
            }
            None => {
                tracing::debug!(
                    correlation_id = frame.correlation_id,
                    opcode = ?frame.opcode,
                    "Dropping response with no waiter"
                );
            }
        }
    }

    fn lost(&self) -> Error {
        let reason = self
            .lock()
            .closed
            .clone()
            .unwrap_or_else(|| "link closed".to_string());
        Error::LinkLost(reason)
    }

    fn close(&self, reason: &str) {
        let waiters = {
            let mut pending = self.lock();
            if pending.closed.is_some() {
                return;
            }
            pending.closed = Some(reason.to_string());
            std::mem::take(&mut pending.waiters)
        };

        tracing::info!(reason, outstanding = waiters.len(), "Dispatcher closed");
        for (_, waiter) in waiters {
            let _ = waiter.send(Err(Error::LinkLost(reason.to_string())));
        }

        self.permits.close();
        self.shutdown.cancel();
        self.closed.send_replace(Some(reason.to_string()));
    }
}

/// Sends requests and matches responses by correlation id.
pub struct RequestDispatcher {
    shared: Arc<Shared>,
    outgoing: mpsc::Sender<Vec<u8>>,
    codec: FrameCodec,
    default_timeout: Duration,
    kind: TransportKind,
}

impl fmt::Debug for RequestDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestDispatcher")
            .field("kind", &self.kind)
            .field("in_flight", &self.in_flight())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl RequestDispatcher {
    /// Take ownership of `link` and start the reader and writer tasks.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(link: Link, config: &ProtocolConfig) -> Arc<Self> {
        let kind = link.kind();
        let codec = FrameCodec::new(config.max_payload_size);
        let (reader, writer) = tokio::io::split(link);
        let (outgoing, queue) = mpsc::channel(OUTGOING_QUEUE);
        let (closed, _) = watch::channel(None);

        let shared = Arc::new(Shared {
            pending: Mutex::new(Pending {
                waiters: HashMap::new(),
                next_id: 1,
                closed: None,
            }),
            permits: Semaphore::new(config.max_in_flight),
            closed,
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(read_loop(Arc::clone(&shared), codec, reader));
        tokio::spawn(write_loop(Arc::clone(&shared), queue, writer));

        tracing::debug!(%kind, "Dispatcher started");
        Arc::new(Self {
            shared,
            outgoing,
            codec,
            default_timeout: config.default_timeout,
            kind,
        })
    }

    /// Transport the underlying link runs on.
    pub const fn kind(&self) -> TransportKind {
        self.kind
    }

    /// Timeout used by [`send`](Self::send).
    pub const fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Send a request with the default timeout.
    ///
    /// # Errors
    ///
    /// See [`send_with_timeout`](Self::send_with_timeout).
    pub async fn send(&self, opcode: Opcode, payload: Vec<u8>) -> Result<Frame> {
        self.send_with_timeout(opcode, payload, self.default_timeout)
            .await
    }

    /// Send a request and wait for its response.
    ///
    /// Host error frames are returned as `Error::Remote`.
    ///
    /// # Errors
    ///
    /// - `Error::Timeout` if no response arrives within `timeout`
    /// - `Error::LinkLost` if the link ends first
    /// - `Error::FrameTooLarge` if the payload is over the limit
    pub async fn send_with_timeout(
        &self,
        opcode: Opcode,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Frame> {
        let exchange = async {
            let _permit = self
                .shared
                .permits
                .acquire()
                .await
                .map_err(|_| self.shared.lost())?;

            let (tx, rx) = oneshot::channel();
            let correlation_id = self.shared.register(tx)?;
            let _waiter = WaiterGuard {
                shared: &self.shared,
                correlation_id,
            };

            let bytes = self
                .codec
                .encode(&Frame::new(opcode, correlation_id, payload))?;
            tracing::trace!(correlation_id, ?opcode, len = bytes.len(), "Sending request");

            self.outgoing
                .send(bytes)
                .await
                .map_err(|_| self.shared.lost())?;

            let frame = rx.await.map_err(|_| self.shared.lost())??;
            Ok::<_, Error>(frame)
        };

        let frame = match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result?,
            Err(_) => {
                tracing::debug!(?opcode, ?timeout, "Request timed out");
                return Err(Error::Timeout(timeout));
            }
        };

        if frame.opcode == Opcode::Error {
            return Err(ErrorPayload::decode(&frame.payload)?.into_error());
        }
        Ok(frame)
    }

    /// Requests currently waiting for a response.
    pub fn in_flight(&self) -> usize {
        self.shared.lock().waiters.len()
    }

    /// Whether the link behind this dispatcher has ended.
    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed.is_some()
    }

    /// Close the link; outstanding requests fail with `LinkLost`.
    pub fn close(&self) {
        self.shared.close("closed by client");
    }

    /// Wait until the link ends and return why.
    pub async fn closed(&self) -> String {
        let mut rx = self.shared.closed.subscribe();
        let result = rx.wait_for(Option::is_some).await;
        result.map_or_else(
            |_| "dispatcher dropped".to_string(),
            |reason| reason.clone().unwrap_or_default(),
        )
    }
}

impl Drop for RequestDispatcher {
    fn drop(&mut self) {
        self.shared.close("dispatcher dropped");
    }
}

/// Removes a waiter when its request finishes, times out or is abandoned.
struct WaiterGuard<'a> {
    shared: &'a Shared,
    correlation_id: u32,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.shared.forget(self.correlation_id);
    }
}

async fn read_loop(shared: Arc<Shared>, codec: FrameCodec, mut reader: ReadHalf<Link>) {
    let reason = loop {
        let frame = tokio::select! {
            () = shared.shutdown.cancelled() => return,
            frame = codec.read_frame(&mut reader) => frame,
        };
        match frame {
            Ok(Some(frame)) => shared.deliver(frame),
            Ok(None) => break "host closed the link".to_string(),
            Err(e) => break e.to_string(),
        }
    };
    shared.close(&reason);
}

async fn write_loop(
    shared: Arc<Shared>,
    mut queue: mpsc::Receiver<Vec<u8>>,
    mut writer: WriteHalf<Link>,
) {
    loop {
        let bytes = tokio::select! {
            () = shared.shutdown.cancelled() => break,
            next = queue.recv() => match next {
                Some(bytes) => bytes,
                None => break,
            },
        };

        let written = tokio::select! {
            () = shared.shutdown.cancelled() => break,
            written = async {
                writer.write_all(&bytes).await?;
                writer.flush().await
            } => written,
        };

        if let Err(e) = written {
            shared.close(&format!("write failed: {e}"));
            break;
        }
    }

    if let Err(e) = writer.shutdown().await {
        tracing::debug!(error = %e, "Error shutting down link writer");
    }
}

/// Owner side of the "current dispatcher" slot.
///
/// The session installs a dispatcher when a link comes up and takes it out
/// when the link goes away. Clients hold an [`ActiveDispatcher`].
#[derive(Debug)]
pub struct DispatcherSlot {
    tx: watch::Sender<Option<Arc<RequestDispatcher>>>,
}

impl Default for DispatcherSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl DispatcherSlot {
    /// Create an empty slot.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    /// Install a dispatcher, returning the previous one.
    pub fn install(&self, dispatcher: Arc<RequestDispatcher>) -> Option<Arc<RequestDispatcher>> {
        self.tx.send_replace(Some(dispatcher))
    }

    /// Empty the slot.
    pub fn take(&self) -> Option<Arc<RequestDispatcher>> {
        self.tx.send_replace(None)
    }

    /// Empty the slot only if it still holds `dispatcher`.
    pub fn take_if(&self, dispatcher: &Arc<RequestDispatcher>) -> bool {
        self.tx.send_if_modified(|current| {
            if current.as_ref().is_some_and(|c| Arc::ptr_eq(c, dispatcher)) {
                *current = None;
                true
            } else {
                false
            }
        })
    }

    /// Read-only handle for clients.
    pub fn handle(&self) -> ActiveDispatcher {
        ActiveDispatcher {
            rx: self.tx.subscribe(),
        }
    }
}

/// Read-only view of the current dispatcher.
#[derive(Debug, Clone)]
pub struct ActiveDispatcher {
    rx: watch::Receiver<Option<Arc<RequestDispatcher>>>,
}

impl ActiveDispatcher {
    /// The dispatcher of the connected link.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotConnected` when no live link exists.
    pub fn current(&self) -> Result<Arc<RequestDispatcher>> {
        self.rx
            .borrow()
            .as_ref()
            .filter(|d| !d.is_closed())
            .cloned()
            .ok_or(Error::NotConnected)
    }

    /// Whether a live link exists.
    pub fn is_connected(&self) -> bool {
        self.current().is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::DuplexStream;

    fn config() -> ProtocolConfig {
        ProtocolConfig {
            default_timeout: Duration::from_millis(200),
            ..ProtocolConfig::default()
        }
    }

    fn connected() -> (Arc<RequestDispatcher>, DuplexStream) {
        let (client, host) = tokio::io::duplex(64 * 1024);
        let link = Link::from_io(TransportKind::SimulatedTcp, Box::new(client));
        (RequestDispatcher::start(link, &config()), host)
    }

    async fn read_request(host: &mut DuplexStream) -> Frame {
        FrameCodec::default()
            .read_frame(host)
            .await
            .expect("read request")
            .expect("request frame")
    }

    async fn reply(host: &mut DuplexStream, frame: Frame) {
        FrameCodec::default()
            .write_frame(host, &frame)
            .await
            .expect("write response");
    }

    #[tokio::test]
    async fn test_concurrent_sends_get_their_own_response() {
        let (dispatcher, mut host) = connected();

        let host_task = tokio::spawn(async move {
            let mut requests = Vec::new();
            for _ in 0..3 {
                requests.push(read_request(&mut host).await);
            }
            // Answer in reverse order, echoing the request payload.
            for request in requests.into_iter().rev() {
                reply(
                    &mut host,
                    Frame::new(Opcode::Data, request.correlation_id, request.payload),
                )
                .await;
            }
            host
        });

        let (a, b, c) = tokio::join!(
            dispatcher.send(Opcode::ListDir, b"a".to_vec()),
            dispatcher.send(Opcode::ListDir, b"b".to_vec()),
            dispatcher.send(Opcode::ListDir, b"c".to_vec()),
        );

        assert_eq!(a.unwrap().payload, b"a");
        assert_eq!(b.unwrap().payload, b"b");
        assert_eq!(c.unwrap().payload, b"c");
        assert_eq!(dispatcher.in_flight(), 0);
        let _host = host_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_timeout_removes_waiter_and_late_reply_is_dropped() {
        let (dispatcher, mut host) = connected();

        let result = dispatcher
            .send_with_timeout(Opcode::GetFileInfo, Vec::new(), Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(Error::Timeout(_))));
        assert_eq!(dispatcher.in_flight(), 0);

        let late = read_request(&mut host).await;
        reply(&mut host, Frame::new(Opcode::Data, late.correlation_id, vec![1])).await;

        let next = tokio::spawn({
            let dispatcher = Arc::clone(&dispatcher);
            async move { dispatcher.send(Opcode::GetDrives, Vec::new()).await }
        });
        let request = read_request(&mut host).await;
        assert_ne!(request.correlation_id, late.correlation_id);
        reply(&mut host, Frame::new(Opcode::Data, request.correlation_id, vec![2])).await;

        assert_eq!(next.await.unwrap().unwrap().payload, vec![2]);
        assert!(!dispatcher.is_closed());
    }

    #[tokio::test]
    async fn test_link_eof_fails_outstanding_requests() {
        let (dispatcher, mut host) = connected();

        let pending = tokio::spawn({
            let dispatcher = Arc::clone(&dispatcher);
            async move {
                dispatcher
                    .send_with_timeout(Opcode::ReadFile, Vec::new(), Duration::from_secs(10))
                    .await
            }
        });

        let _ = read_request(&mut host).await;
        drop(host);

        assert!(matches!(pending.await.unwrap(), Err(Error::LinkLost(_))));
        let reason = dispatcher.closed().await;
        assert!(reason.contains("closed"));
        assert!(matches!(
            dispatcher.send(Opcode::GetDrives, Vec::new()).await,
            Err(Error::LinkLost(_))
        ));
    }

    #[tokio::test]
    async fn test_error_frame_becomes_remote_error() {
        let (dispatcher, mut host) = connected();

        let host_task = tokio::spawn(async move {
            let request = read_request(&mut host).await;
            let payload = ErrorPayload {
                code: 3,
                message: "missing".to_string(),
            };
            reply(
                &mut host,
                Frame::new(Opcode::Error, request.correlation_id, payload.encode()),
            )
            .await;
            host
        });

        match dispatcher.send(Opcode::GetFileInfo, Vec::new()).await {
            Err(Error::Remote { message, .. }) => assert_eq!(message, "missing"),
            other => panic!("expected Remote error, got {other:?}"),
        }
        let _host = host_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_oversized_request_leaves_link_usable() {
        let (client, _host) = tokio::io::duplex(1024);
        let link = Link::from_io(TransportKind::SimulatedTcp, Box::new(client));
        let config = ProtocolConfig {
            max_payload_size: 8,
            ..config()
        };
        let dispatcher = RequestDispatcher::start(link, &config);

        let result = dispatcher.send(Opcode::WriteFile, vec![0; 9]).await;
        assert!(matches!(result, Err(Error::FrameTooLarge { .. })));
        assert_eq!(dispatcher.in_flight(), 0);
        assert!(!dispatcher.is_closed());
    }

    #[tokio::test]
    async fn test_close_fails_waiters_and_empties_slot_view() {
        let (dispatcher, _host) = connected();
        let slot = DispatcherSlot::new();
        let handle = slot.handle();
        assert!(matches!(handle.current(), Err(Error::NotConnected)));

        slot.install(Arc::clone(&dispatcher));
        assert!(handle.is_connected());

        let pending = tokio::spawn({
            let dispatcher = Arc::clone(&dispatcher);
            async move {
                dispatcher
                    .send_with_timeout(Opcode::ListDir, Vec::new(), Duration::from_secs(10))
                    .await
            }
        });
        tokio::task::yield_now().await;
        while dispatcher.in_flight() == 0 {
            tokio::task::yield_now().await;
        }

        dispatcher.close();
        assert!(matches!(pending.await.unwrap(), Err(Error::LinkLost(_))));
        assert!(!handle.is_connected());
    }

    #[test]
    fn test_allocate_skips_zero_and_ids_in_use() {
        let mut pending = Pending {
            waiters: HashMap::new(),
            next_id: u32::MAX,
            closed: None,
        };
        let (tx, _rx) = oneshot::channel();
        pending.waiters.insert(1, tx);

        assert_eq!(pending.allocate(), u32::MAX);
        assert_eq!(pending.allocate(), 2);
    }
}
